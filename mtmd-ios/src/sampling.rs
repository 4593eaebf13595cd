//! Next-token selection from logits
//!
//! A temperature of zero picks the most likely token. Any positive temperature
//! scales the logits, applies softmax and draws from the resulting
//! distribution with a seeded generator, so a session replays identically for
//! the same seed and inputs.

use thiserror::Error;

use crate::token::TokenId;

/// Errors that can occur while sampling
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SamplingError {
    /// The engine returned no logits
    #[error("Logits are empty")]
    EmptyLogits,

    /// Every logit was NaN or negative infinity
    #[error("No token has a finite logit")]
    NoValidTokens,
}

/// xorshift64 generator
#[derive(Debug, Clone)]
struct XorShift {
    state: u64,
}

impl XorShift {
    fn new(seed: u64) -> Self {
        // small seeds give near-zero first outputs unless mixed
        let state = splitmix64(seed);
        // zero is a fixed point of xorshift
        Self {
            state: if state == 0 { 0x9E37_79B9_7F4A_7C15 } else { state },
        }
    }

    /// Uniform float in (0, 1)
    #[allow(clippy::cast_precision_loss)]
    fn next_f32(&mut self) -> f32 {
        self.state ^= self.state << 13;
        self.state ^= self.state >> 7;
        self.state ^= self.state << 17;
        ((self.state >> 40) as f32 + 0.5) / (1u64 << 24) as f32
    }
}

fn splitmix64(seed: u64) -> u64 {
    let mut z = seed.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Temperature sampler
#[derive(Debug, Clone)]
pub struct Sampler {
    temperature: f32,
    seed: u64,
    rng: XorShift,
}

impl Sampler {
    /// Create a sampler with the given temperature and seed
    pub fn new(temperature: f32, seed: u64) -> Self {
        Self {
            temperature,
            seed,
            rng: XorShift::new(seed),
        }
    }

    /// The configured temperature
    pub fn temperature(&self) -> f32 {
        self.temperature
    }

    /// Rewind the generator to its seed
    pub fn reset(&mut self) {
        self.rng = XorShift::new(self.seed);
    }

    /// Pick the next token
    ///
    /// # Errors
    ///
    /// Fails when `logits` is empty or holds no finite value.
    pub fn sample(&mut self, logits: &[f32]) -> Result<TokenId, SamplingError> {
        if logits.is_empty() {
            return Err(SamplingError::EmptyLogits);
        }
        let (best, max) = argmax(logits).ok_or(SamplingError::NoValidTokens)?;

        if self.temperature <= 0.0 {
            return Ok(to_token(best));
        }

        let weights: Vec<f32> = logits
            .iter()
            .map(|&l| {
                if l.is_finite() {
                    ((l - max) / self.temperature).exp()
                } else {
                    0.0
                }
            })
            .collect();
        let total: f32 = weights.iter().sum();
        if !total.is_finite() || total <= 0.0 {
            return Ok(to_token(best));
        }

        let mut target = self.rng.next_f32() * total;
        for (i, w) in weights.iter().enumerate() {
            if *w > 0.0 {
                if target < *w {
                    return Ok(to_token(i));
                }
                target -= w;
            }
        }
        // rounding left a sliver past the last bucket
        let last = weights.iter().rposition(|w| *w > 0.0).unwrap_or(best);
        Ok(to_token(last))
    }
}

/// Index and value of the largest finite logit, lowest index on ties
fn argmax(logits: &[f32]) -> Option<(usize, f32)> {
    let mut best: Option<(usize, f32)> = None;
    for (i, &l) in logits.iter().enumerate() {
        if !l.is_finite() {
            continue;
        }
        match best {
            Some((_, b)) if l <= b => {}
            _ => best = Some((i, l)),
        }
    }
    best
}

fn to_token(index: usize) -> TokenId {
    TokenId::try_from(index).unwrap_or(TokenId::MAX)
}

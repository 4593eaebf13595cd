//! Deterministic engine for integration tests
//!
//! - Byte-level tokenizer: byte `b` is token `BYTE_BASE + b`.
//! - Every image occupies `IMAGE_POSITIONS` positions of one token derived
//!   from its mean brightness.
//! - Logits are one-hot and recite the prompt: the n-th generated token is
//!   the n-th prompt token (BOS skipped), then EOS.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use enumflags2::BitFlags;
use image::{Rgb, RgbImage};
use mtmd_ios::{Capability, Engine, EngineError, Role, Session, SessionParams, TokenId};

pub const BOS: TokenId = 1;
pub const EOS: TokenId = 2;
pub const BYTE_BASE: TokenId = 16;
pub const IMAGE_BASE: TokenId = BYTE_BASE + 256;
pub const IMAGE_POSITIONS: usize = 4;
pub const N_VOCAB: usize = IMAGE_BASE as usize + 16;

/// Counters shared between a test and the engine it handed to a session
#[derive(Debug, Clone, Default)]
pub struct Probe {
    warmups: Arc<AtomicUsize>,
    drops: Arc<AtomicUsize>,
    add_special: Arc<Mutex<Vec<bool>>>,
}

impl Probe {
    pub fn warmups(&self) -> usize {
        self.warmups.load(Ordering::SeqCst)
    }

    pub fn drops(&self) -> usize {
        self.drops.load(Ordering::SeqCst)
    }

    /// `add_special` flag of every tokenize call, in order
    pub fn add_special(&self) -> Vec<bool> {
        self.add_special.lock().unwrap().clone()
    }
}

#[derive(Debug)]
pub struct FixtureEngine {
    n_ctx: usize,
    vision: bool,
    plain_chat: bool,
    image_logits: bool,
    fail_on_eval: Option<usize>,
    evals: usize,
    history: Vec<TokenId>,
    prompt_len: usize,
    logits: Vec<f32>,
    probe: Probe,
}

impl FixtureEngine {
    pub fn new(n_ctx: usize) -> Self {
        Self {
            n_ctx,
            vision: true,
            plain_chat: false,
            image_logits: true,
            fail_on_eval: None,
            evals: 0,
            history: Vec::new(),
            prompt_len: 0,
            logits: Vec::new(),
            probe: Probe::default(),
        }
    }

    pub fn without_vision(mut self) -> Self {
        self.vision = false;
        self
    }

    /// Pass message content through without role markers
    pub fn with_plain_chat(mut self) -> Self {
        self.plain_chat = true;
        self
    }

    /// Leave no logits after an image, as llama.cpp does for embeddings
    pub fn without_image_logits(mut self) -> Self {
        self.image_logits = false;
        self
    }

    /// Make the `n`-th evaluation (zero-based, text or image) write its input and then fail
    pub fn failing_on_eval(mut self, n: usize) -> Self {
        self.fail_on_eval = Some(n);
        self
    }

    pub fn probe(&self) -> Probe {
        self.probe.clone()
    }

    fn check_position(&self, n_past: usize) -> Result<(), EngineError> {
        if n_past == self.history.len() {
            Ok(())
        } else {
            Err(EngineError::Decode(format!(
                "evaluating at {n_past} but the cache holds {}",
                self.history.len()
            )))
        }
    }

    fn check_capacity(
        &self,
        n_ctx: usize,
        n_past: usize,
        needed: usize,
    ) -> Result<(), EngineError> {
        let available = n_ctx.min(self.n_ctx).saturating_sub(n_past);
        if needed > available {
            return Err(EngineError::ContextFull { needed, available });
        }
        Ok(())
    }

    /// Count the evaluation and fail it when it is the injected one
    fn injected_failure(&mut self) -> Result<(), EngineError> {
        let n = self.evals;
        self.evals += 1;
        if self.fail_on_eval == Some(n) {
            return Err(EngineError::Decode(format!("injected failure on eval {n}")));
        }
        Ok(())
    }

    fn refresh_logits(&mut self) {
        let skip = usize::from(self.history.first() == Some(&BOS));
        let cursor = self.history.len() - self.prompt_len;
        let next = self
            .history
            .get(skip + cursor)
            .filter(|_| skip + cursor < self.prompt_len)
            .copied()
            .unwrap_or(EOS);

        self.logits = vec![f32::NEG_INFINITY; N_VOCAB];
        self.logits[next as usize] = 0.0;
    }
}

impl Drop for FixtureEngine {
    fn drop(&mut self) {
        self.probe.drops.fetch_add(1, Ordering::SeqCst);
    }
}

impl Engine for FixtureEngine {
    fn n_ctx(&self) -> usize {
        self.n_ctx
    }

    fn capabilities(&self) -> BitFlags<Capability> {
        if self.vision {
            Capability::Vision.into()
        } else {
            BitFlags::empty()
        }
    }

    fn format_chat(
        &self,
        role: Role,
        content: &str,
        add_generation_prompt: bool,
    ) -> Result<String, EngineError> {
        if self.plain_chat {
            return Ok(content.to_owned());
        }
        let mut out = format!("<|{role}|>\n{content}\n");
        if add_generation_prompt {
            out.push_str("<|assistant|>\n");
        }
        Ok(out)
    }

    fn tokenize(&self, text: &str, add_special: bool) -> Result<Vec<TokenId>, EngineError> {
        self.probe.add_special.lock().unwrap().push(add_special);
        let mut tokens = Vec::with_capacity(text.len() + 1);
        if add_special {
            tokens.push(BOS);
        }
        tokens.extend(text.bytes().map(|b| BYTE_BASE + TokenId::from(b)));
        Ok(tokens)
    }

    fn token_to_piece(&self, token: TokenId) -> Result<Vec<u8>, EngineError> {
        match token {
            BOS | EOS => Ok(Vec::new()),
            t if (BYTE_BASE..IMAGE_BASE).contains(&t) => Ok(vec![(t - BYTE_BASE) as u8]),
            t if (IMAGE_BASE..N_VOCAB as TokenId).contains(&t) => {
                Ok(format!("<img{}>", t - IMAGE_BASE).into_bytes())
            }
            t => Err(EngineError::Tokenization(format!("unknown token {t}"))),
        }
    }

    fn is_end_of_generation(&self, token: TokenId) -> bool {
        token == EOS
    }

    fn eval_tokens(&mut self, tokens: &[TokenId], n_past: usize) -> Result<(), EngineError> {
        self.check_position(n_past)?;
        self.check_capacity(self.n_ctx, n_past, tokens.len())?;
        self.history.extend_from_slice(tokens);
        self.injected_failure()?;
        if tokens.len() > 1 {
            self.prompt_len = self.history.len();
        }
        self.refresh_logits();
        Ok(())
    }

    fn eval_image(
        &mut self,
        image: &RgbImage,
        n_past: usize,
        n_ctx: usize,
    ) -> Result<usize, EngineError> {
        self.check_position(n_past)?;
        self.check_capacity(n_ctx, n_past, IMAGE_POSITIONS)?;
        let token = IMAGE_BASE + TokenId::from(mean_luma(image) / 16);
        self.history
            .extend(std::iter::repeat(token).take(IMAGE_POSITIONS));
        self.injected_failure()?;
        self.prompt_len = self.history.len();
        if self.image_logits {
            self.refresh_logits();
        } else {
            self.logits.clear();
        }
        Ok(self.history.len())
    }

    fn logits(&self) -> Result<&[f32], EngineError> {
        if self.logits.is_empty() {
            return Err(EngineError::NoLogits);
        }
        Ok(&self.logits)
    }

    fn truncate(&mut self, n_past: usize) {
        self.history.truncate(n_past);
        self.prompt_len = self.prompt_len.min(n_past);
        if n_past == 0 {
            self.logits.clear();
        }
    }

    fn warmup(&mut self) -> Result<(), EngineError> {
        self.probe.warmups.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn mean_luma(image: &RgbImage) -> u8 {
    let pixels = u64::from(image.width()) * u64::from(image.height());
    if pixels == 0 {
        return 0;
    }
    let sum: u64 = image
        .pixels()
        .map(|p| p.0.iter().map(|&c| u64::from(c)).sum::<u64>())
        .sum();
    u8::try_from(sum / (pixels * 3)).unwrap_or(u8::MAX)
}

/// Parameters for fixture sessions: greedy, no warmup
pub fn params() -> SessionParams {
    SessionParams::default()
        .with_temperature(0.0)
        .with_warmup(false)
}

pub fn session(engine: FixtureEngine) -> Session {
    Session::with_engine(&params(), Box::new(engine)).unwrap()
}

/// What the fixture template produces for a user turn
pub fn user_turn(text: &str) -> String {
    format!("<|user|>\n{text}\n<|assistant|>\n")
}

/// Write a solid-color PNG and return its path
pub fn write_png(dir: &Path, name: &str, width: u32, height: u32, gray: u8) -> PathBuf {
    let path = dir.join(name);
    RgbImage::from_pixel(width, height, Rgb([gray, gray, gray]))
        .save(&path)
        .unwrap();
    path
}

/// Drain a session through its iterator
pub fn collect(session: &mut Session) -> String {
    session
        .tokens()
        .collect::<Result<String, _>>()
        .unwrap()
}

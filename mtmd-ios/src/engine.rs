//! The seam between a [`Session`](crate::Session) and the inference engine
//!
//! A session never touches tensors. It formats and tokenizes turns, tracks the
//! generation position, checks capacity and samples; everything that needs
//! model weights goes through [`Engine`].

use enumflags2::{bitflags, BitFlags};
use image::RgbImage;
use thiserror::Error;

use crate::chat::Role;
use crate::token::TokenId;

/// Input modalities a multimodal projector can embed
#[bitflags]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    /// Images and video frames
    Vision = 0b01,
    /// PCM audio
    Audio = 0b10,
}

/// Errors reported by an [`Engine`]
#[derive(Debug, Error)]
pub enum EngineError {
    /// The language model could not be loaded
    #[error("Failed to load model: {0}")]
    ModelLoad(String),

    /// The multimodal projector could not be loaded
    #[error("Failed to load multimodal projector: {0}")]
    ProjectorLoad(String),

    /// The inference context could not be allocated
    #[error("Failed to create context: {0}")]
    ContextInit(String),

    /// The input does not fit in the remaining context window
    #[error("Context is full: {needed} positions needed, {available} available")]
    ContextFull {
        /// Positions the input requires
        needed: usize,
        /// Positions left in the context window
        available: usize,
    },

    /// The chat template could not be applied
    #[error("Failed to apply chat template: {0}")]
    ChatTemplate(String),

    /// Text could not be tokenized or detokenized
    #[error("Tokenization failed: {0}")]
    Tokenization(String),

    /// An image could not be encoded or evaluated
    #[error("Image evaluation failed: {0}")]
    ImageEval(String),

    /// A token batch could not be evaluated
    #[error("Decode failed: {0}")]
    Decode(String),

    /// No logits exist for the last evaluated position
    #[error("No logits available for the last position")]
    NoLogits,
}

/// A loaded multimodal model with its KV cache
///
/// Positions are explicit: every evaluation receives `n_past`, the number of
/// positions already in the cache, and writes from there. Implementations must
/// leave cells before `n_past` untouched.
pub trait Engine: Send {
    /// Size of the context window in positions
    fn n_ctx(&self) -> usize;

    /// Modalities the projector supports
    fn capabilities(&self) -> BitFlags<Capability>;

    /// Format one chat message with the model's template
    ///
    /// `add_generation_prompt` appends the opening of an assistant turn.
    fn format_chat(
        &self,
        role: Role,
        content: &str,
        add_generation_prompt: bool,
    ) -> Result<String, EngineError>;

    /// Tokenize text, adding BOS when `add_special` is set and the model uses one
    fn tokenize(&self, text: &str, add_special: bool) -> Result<Vec<TokenId>, EngineError>;

    /// Raw bytes of a token; may be part of a multi-byte character
    fn token_to_piece(&self, token: TokenId) -> Result<Vec<u8>, EngineError>;

    /// Whether `token` ends generation (EOS, EOT and similar)
    fn is_end_of_generation(&self, token: TokenId) -> bool;

    /// Evaluate `tokens` at positions `n_past..n_past + tokens.len()`
    ///
    /// Logits of the last token become available through [`Engine::logits`].
    fn eval_tokens(&mut self, tokens: &[TokenId], n_past: usize) -> Result<(), EngineError>;

    /// Encode an image through the projector and evaluate it at `n_past`
    ///
    /// Returns the new `n_past`. Must fail with [`EngineError::ContextFull`]
    /// before writing anything when the image does not fit below `n_ctx`, the
    /// caller's window, or the engine's own.
    fn eval_image(
        &mut self,
        image: &RgbImage,
        n_past: usize,
        n_ctx: usize,
    ) -> Result<usize, EngineError>;

    /// Logits for the last evaluated position
    ///
    /// [`EngineError::NoLogits`] when the last evaluation produced none, as
    /// image embeddings usually do.
    fn logits(&self) -> Result<&[f32], EngineError>;

    /// Drop every cache cell at position `n_past` and after
    fn truncate(&mut self, n_past: usize);

    /// Run a throwaway evaluation so first use does not pay for allocation
    fn warmup(&mut self) -> Result<(), EngineError> {
        Ok(())
    }
}

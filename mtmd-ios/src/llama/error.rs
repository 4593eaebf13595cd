//! Error types for the llama.cpp backend

use std::ffi::NulError;
use std::path::PathBuf;

use thiserror::Error;

use crate::engine::EngineError;
use crate::llama::multimodal::MultimodalError;

/// Errors raised by [`LlamaEngine`](super::LlamaEngine) and its wrappers
#[derive(Debug, Error)]
pub enum LlamaError {
    /// llama.cpp returned null while loading the model
    #[error("llama.cpp could not load model {}", .0.display())]
    ModelLoad(PathBuf),

    /// llama.cpp returned null while creating the context
    #[error("llama.cpp could not create a context of {n_ctx} positions")]
    ContextInit {
        /// Requested window
        n_ctx: u32,
    },

    /// A path or string contained an interior NUL byte
    #[error("Failed to convert to C string: {0}")]
    NulError(#[from] NulError),

    /// A path is not valid UTF-8
    #[error("Path is not valid UTF-8: {}", .0.display())]
    NonUtf8Path(PathBuf),

    /// `llama_tokenize` failed
    #[error("Failed to tokenize {len} bytes of text")]
    Tokenize {
        /// Length of the rejected text
        len: usize,
    },

    /// `llama_token_to_piece` failed
    #[error("Failed to convert token {0} to text")]
    TokenToPiece(i32),

    /// `llama_chat_apply_template` failed
    #[error("Chat template {template:?} could not be applied")]
    ChatTemplate {
        /// The template source or name
        template: String,
    },

    /// `llama_decode` returned non-zero
    #[error("llama_decode failed with code {0}")]
    Decode(i32),

    /// More tokens were added to a batch than it was allocated for
    #[error("Batch of {capacity} tokens is full")]
    BatchFull {
        /// Allocated size
        capacity: usize,
    },

    /// A position or count does not fit in a C int
    #[error("{0} does not fit in a C int")]
    Overflow(usize),

    /// The input does not fit in the remaining window
    #[error("{needed} positions needed, {available} available")]
    ContextFull {
        /// Positions required
        needed: usize,
        /// Positions left
        available: usize,
    },

    /// `llama_get_logits_ith` returned null
    #[error("No logits for the last position")]
    NoLogits,

    /// libmtmd error
    #[error(transparent)]
    Multimodal(#[from] MultimodalError),
}

impl From<LlamaError> for EngineError {
    fn from(err: LlamaError) -> Self {
        match err {
            LlamaError::ModelLoad(_) | LlamaError::NonUtf8Path(_) | LlamaError::NulError(_) => {
                EngineError::ModelLoad(err.to_string())
            }
            LlamaError::ContextInit { .. } => EngineError::ContextInit(err.to_string()),
            LlamaError::Tokenize { .. } | LlamaError::TokenToPiece(_) => {
                EngineError::Tokenization(err.to_string())
            }
            LlamaError::ChatTemplate { .. } => EngineError::ChatTemplate(err.to_string()),
            LlamaError::Decode(_) | LlamaError::BatchFull { .. } | LlamaError::Overflow(_) => {
                EngineError::Decode(err.to_string())
            }
            LlamaError::ContextFull { needed, available } => {
                EngineError::ContextFull { needed, available }
            }
            LlamaError::NoLogits => EngineError::NoLogits,
            LlamaError::Multimodal(MultimodalError::InitializationFailed(path)) => {
                EngineError::ProjectorLoad(format!("libmtmd could not load {}", path.display()))
            }
            LlamaError::Multimodal(inner) => EngineError::ImageEval(inner.to_string()),
        }
    }
}

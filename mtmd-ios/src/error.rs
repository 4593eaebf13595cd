//! Error types for session operations

use std::path::PathBuf;
use thiserror::Error;

use crate::engine::EngineError;
use crate::media::MediaError;
use crate::sampling::SamplingError;

/// Errors that can occur while creating or driving a [`Session`](crate::Session)
#[derive(Debug, Error)]
pub enum SessionError {
    /// A parameter is out of its valid range
    #[error("Invalid parameters: {0}")]
    InvalidParams(String),

    /// An argument passed across the C boundary is null or not UTF-8
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A model or projector file does not exist or cannot be read
    #[error("{kind} file not found or unreadable: {}", path.display())]
    FileNotFound {
        /// Which file was being opened
        kind: &'static str,
        /// The path that was supplied
        path: PathBuf,
    },

    /// No inference backend was compiled into this build
    #[error("No inference backend compiled in. Build with --features llama")]
    BackendUnavailable,

    /// The role label is not a known chat role
    #[error("Unknown role `{0}`: expected system, user or assistant")]
    UnknownRole(String),

    /// The loaded projector cannot embed images
    #[error("The multimodal projector does not support image input")]
    VisionUnsupported,

    /// Appending the input would overflow the context window
    #[error("Context is full: {needed} positions needed, {available} available")]
    ContextFull {
        /// Positions the input requires
        needed: usize,
        /// Positions left in the context window
        available: usize,
    },

    /// Image or frame loading failed
    #[error(transparent)]
    Media(#[from] MediaError),

    /// The inference engine reported a failure
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// Token sampling failed
    #[error(transparent)]
    Sampling(#[from] SamplingError),
}

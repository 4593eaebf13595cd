//! Error types for multimodal functionality

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur in libmtmd calls
#[derive(Debug, Error)]
pub enum MultimodalError {
    /// `mtmd_init_from_file` returned null
    #[error("Failed to initialize multimodal context from {}", .0.display())]
    InitializationFailed(PathBuf),

    /// An allocation in libmtmd returned null
    #[error("libmtmd returned a null {0}")]
    NullPointer(&'static str),

    /// Pixel buffer does not match the dimensions
    #[error("Invalid image dimensions: {width}x{height} with {len} bytes")]
    InvalidImageDimensions {
        /// Image width
        width: u32,
        /// Image height
        height: u32,
        /// Bytes supplied
        len: usize,
    },

    /// Number of bitmaps does not match the markers in the prompt
    #[error("Number of bitmaps ({provided}) doesn't match markers in text")]
    BitmapCountMismatch {
        /// Bitmaps passed
        provided: usize,
    },

    /// The projector rejected the image
    #[error("Image preprocessing failed")]
    PreprocessingFailed,

    /// `mtmd_tokenize` failed with an unknown code
    #[error("Tokenization failed with code {0}")]
    TokenizationFailed(i32),

    /// `mtmd_helper_eval_chunks` failed
    #[error("Evaluating media chunks failed with code {0}")]
    EvalFailed(i32),

    /// The media marker is not valid UTF-8
    #[error("Invalid UTF-8: {0}")]
    Utf8Error(#[from] std::str::Utf8Error),
}

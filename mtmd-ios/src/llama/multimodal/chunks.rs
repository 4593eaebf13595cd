//! Input chunks produced by mixed text and media tokenization

use std::ffi::CString;
use std::ptr::NonNull;

use llama_cpp_sys_4 as sys;

use crate::llama::context::LlamaContext;
use crate::llama::error::LlamaError;
use crate::llama::multimodal::{Bitmap, MtmdContext, MultimodalError};

/// Text input configuration
#[derive(Debug, Clone)]
pub struct InputText {
    /// The text, with one media marker per bitmap
    pub text: String,
    /// Whether to add BOS and similar special tokens
    pub add_special: bool,
    /// Whether to parse special tokens written in the text
    pub parse_special: bool,
}

impl InputText {
    /// Create a text input with default settings
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            add_special: true,
            parse_special: true,
        }
    }

    /// Set whether to add special tokens
    #[must_use]
    pub fn with_add_special(mut self, add: bool) -> Self {
        self.add_special = add;
        self
    }
}

/// Collection of tokenized chunks, ready to evaluate
#[derive(Debug)]
pub struct InputChunks {
    ptr: NonNull<sys::mtmd_input_chunks>,
}

impl InputChunks {
    /// Create an empty collection
    ///
    /// # Errors
    ///
    /// Fails if libmtmd returns null.
    pub fn new() -> Result<Self, MultimodalError> {
        let ptr = unsafe { sys::mtmd_input_chunks_init() };
        NonNull::new(ptr)
            .map(|ptr| Self { ptr })
            .ok_or(MultimodalError::NullPointer("chunk list"))
    }

    /// Tokenize text, replacing each media marker with the matching bitmap
    ///
    /// Image chunks are encoded by the projector here.
    ///
    /// # Errors
    ///
    /// Fails when markers and bitmaps disagree or preprocessing fails.
    pub fn tokenize(
        &mut self,
        context: &MtmdContext,
        text: InputText,
        bitmaps: &[&Bitmap],
    ) -> Result<(), LlamaError> {
        let c_text = CString::new(text.text)?;
        let sys_text = sys::mtmd_input_text {
            text: c_text.as_ptr(),
            add_special: text.add_special,
            parse_special: text.parse_special,
        };
        let bitmap_ptrs: Vec<*const sys::mtmd_bitmap> = bitmaps
            .iter()
            .map(|b| b.as_ptr().as_ptr().cast_const())
            .collect();

        let result = unsafe {
            // Safety: c_text, sys_text and the bitmaps outlive the call
            sys::mtmd_tokenize(
                context.as_ptr().as_ptr(),
                self.ptr.as_ptr(),
                &sys_text,
                bitmap_ptrs.as_ptr(),
                bitmap_ptrs.len(),
            )
        };

        match result {
            0 => Ok(()),
            1 => Err(MultimodalError::BitmapCountMismatch {
                provided: bitmaps.len(),
            }
            .into()),
            2 => Err(MultimodalError::PreprocessingFailed.into()),
            code => Err(MultimodalError::TokenizationFailed(code).into()),
        }
    }

    /// Number of chunks
    pub fn len(&self) -> usize {
        unsafe { sys::mtmd_input_chunks_size(self.ptr.as_ptr()) }
    }

    /// Whether the collection holds no chunks
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Context positions the chunks will occupy
    pub fn n_pos(&self) -> usize {
        let n_pos = unsafe { sys::mtmd_helper_get_n_pos(self.ptr.as_ptr()) };
        usize::try_from(n_pos).unwrap_or(0)
    }

    /// Evaluate every chunk into sequence 0 starting at `n_past`
    ///
    /// Logits of the last position are kept. Returns the new `n_past`.
    ///
    /// # Errors
    ///
    /// Fails when a chunk cannot be encoded or decoded.
    pub fn eval(
        &self,
        mtmd: &MtmdContext,
        context: &mut LlamaContext,
        n_past: usize,
    ) -> Result<usize, LlamaError> {
        let n_past = i32::try_from(n_past).map_err(|_| LlamaError::Overflow(n_past))?;
        let n_batch = context.n_batch();
        let n_batch = i32::try_from(n_batch).map_err(|_| LlamaError::Overflow(n_batch))?;
        let mut new_n_past: sys::llama_pos = n_past;

        let result = unsafe {
            // Safety: both contexts are live and owned by the caller
            sys::mtmd_helper_eval_chunks(
                mtmd.as_ptr().as_ptr(),
                context.as_ptr().as_ptr(),
                self.ptr.as_ptr(),
                n_past,
                0,
                n_batch,
                true,
                &mut new_n_past,
            )
        };
        if result != 0 {
            return Err(MultimodalError::EvalFailed(result).into());
        }
        usize::try_from(new_n_past).map_err(|_| MultimodalError::EvalFailed(new_n_past).into())
    }
}

impl Drop for InputChunks {
    fn drop(&mut self) {
        unsafe {
            sys::mtmd_input_chunks_free(self.ptr.as_ptr());
        }
    }
}

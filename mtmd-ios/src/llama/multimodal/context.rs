//! Multimodal projector context

use std::ffi::{CStr, CString};
use std::path::Path;
use std::ptr::NonNull;
use std::sync::Arc;

use enumflags2::BitFlags;
use llama_cpp_sys_4 as sys;

use crate::engine::Capability;
use crate::llama::error::LlamaError;
use crate::llama::model::LlamaModel;
use crate::llama::multimodal::MultimodalError;

/// Parameters for creating a multimodal context
#[derive(Debug, Clone)]
pub struct MtmdContextParams {
    /// Whether to run the projector on the GPU
    pub use_gpu: bool,
    /// Whether to print timing information
    pub print_timings: bool,
    /// Number of threads to use
    pub n_threads: i32,
}

impl Default for MtmdContextParams {
    fn default() -> Self {
        Self {
            use_gpu: true,
            print_timings: false,
            n_threads: 4,
        }
    }
}

/// A loaded multimodal projector bound to a text model
#[derive(Debug)]
pub struct MtmdContext {
    ptr: NonNull<sys::mtmd_context>,
    /// Keep the model alive for as long as the projector references it
    _model: Arc<LlamaModel>,
}

impl MtmdContext {
    /// Load a projector file for `model`
    ///
    /// # Errors
    ///
    /// Fails when the path is not valid UTF-8 or libmtmd rejects the file.
    pub fn new_from_file(
        mmproj_path: &Path,
        model: Arc<LlamaModel>,
        params: &MtmdContextParams,
    ) -> Result<Self, LlamaError> {
        let path = mmproj_path
            .to_str()
            .ok_or_else(|| LlamaError::NonUtf8Path(mmproj_path.to_path_buf()))?;
        let c_path = CString::new(path)?;

        let mut sys_params = unsafe {
            // Safety: mtmd_context_params_default returns a valid struct
            sys::mtmd_context_params_default()
        };
        sys_params.use_gpu = params.use_gpu;
        sys_params.print_timings = params.print_timings;
        sys_params.n_threads = params.n_threads;

        let ctx = unsafe {
            // Safety: c_path outlives the call and the model pointer is kept
            // alive by the Arc stored alongside the context
            sys::mtmd_init_from_file(c_path.as_ptr(), model.as_ptr().as_ptr(), sys_params)
        };

        let ptr = NonNull::new(ctx)
            .ok_or_else(|| MultimodalError::InitializationFailed(mmproj_path.to_path_buf()))?;
        Ok(Self { ptr, _model: model })
    }

    /// Check if the projector accepts images
    pub fn supports_vision(&self) -> bool {
        unsafe { sys::mtmd_support_vision(self.ptr.as_ptr()) }
    }

    /// Check if the projector accepts audio
    pub fn supports_audio(&self) -> bool {
        unsafe { sys::mtmd_support_audio(self.ptr.as_ptr()) }
    }

    /// Modalities this projector embeds
    pub fn capabilities(&self) -> BitFlags<Capability> {
        let mut caps = BitFlags::empty();
        if self.supports_vision() {
            caps |= Capability::Vision;
        }
        if self.supports_audio() {
            caps |= Capability::Audio;
        }
        caps
    }

    /// The marker `mtmd_tokenize` replaces with a bitmap
    ///
    /// # Errors
    ///
    /// Fails if libmtmd returns a non UTF-8 marker.
    pub fn default_marker() -> Result<&'static str, MultimodalError> {
        let marker = unsafe {
            // Safety: mtmd_default_marker returns a static NUL-terminated string
            CStr::from_ptr(sys::mtmd_default_marker())
        };
        Ok(marker.to_str()?)
    }

    pub(crate) fn as_ptr(&self) -> NonNull<sys::mtmd_context> {
        self.ptr
    }
}

impl Drop for MtmdContext {
    fn drop(&mut self) {
        unsafe {
            sys::mtmd_free(self.ptr.as_ptr());
        }
    }
}

// Safety: the context is only used through &mut LlamaEngine, one thread at a time
unsafe impl Send for MtmdContext {}

//! [`Engine`] backed by llama.cpp and libmtmd
//!
//! Loading follows the usual order: backend, text model, projector, context.
//! The projector and context each hold an [`Arc`] of the model so it is freed
//! last.

use std::ffi::{c_char, c_void, CStr};
use std::sync::{Arc, Once};

use enumflags2::BitFlags;
use image::RgbImage;
use llama_cpp_sys_4 as sys;
use tracing::{debug, error, info, trace, warn};

use crate::chat::Role;
use crate::engine::{Capability, Engine, EngineError};
use crate::params::SessionParams;
use crate::token::TokenId;

pub mod context;
pub mod error;
pub mod model;
pub mod multimodal;

pub use context::{LlamaContext, LlamaContextParams};
pub use error::LlamaError;
pub use model::{LlamaModel, LlamaModelParams};

use multimodal::{Bitmap, InputChunks, InputText, MtmdContext, MtmdContextParams};

static BACKEND_INIT: Once = Once::new();

/// Initialise the llama.cpp backend once per process and route its log to `tracing`
fn init_backend() {
    BACKEND_INIT.call_once(|| unsafe {
        sys::llama_backend_init();
        sys::llama_log_set(Some(log_callback), std::ptr::null_mut());
    });
}

unsafe extern "C" fn log_callback(
    level: sys::ggml_log_level,
    text: *const c_char,
    _user_data: *mut c_void,
) {
    if text.is_null() {
        return;
    }
    let text = CStr::from_ptr(text).to_string_lossy();
    let text = text.trim_end();
    if text.is_empty() {
        return;
    }
    match level {
        sys::ggml_log_level_GGML_LOG_LEVEL_ERROR => error!(target: "llama.cpp", "{text}"),
        sys::ggml_log_level_GGML_LOG_LEVEL_WARN => warn!(target: "llama.cpp", "{text}"),
        sys::ggml_log_level_GGML_LOG_LEVEL_INFO => debug!(target: "llama.cpp", "{text}"),
        _ => trace!(target: "llama.cpp", "{text}"),
    }
}

/// A text model, its projector and one inference context
#[derive(Debug)]
pub struct LlamaEngine {
    mtmd: MtmdContext,
    context: LlamaContext,
    model: Arc<LlamaModel>,
    template: String,
    marker: &'static str,
}

impl LlamaEngine {
    /// Load the model and projector named in `params`
    ///
    /// # Errors
    ///
    /// Fails when either file is rejected or the context cannot be allocated.
    pub fn load(params: &SessionParams) -> Result<Self, LlamaError> {
        init_backend();

        let model = Arc::new(LlamaModel::load_from_file(
            &params.model_path,
            LlamaModelParams::for_gpu(params.use_gpu),
        )?);
        info!(path = %params.model_path.display(), n_vocab = model.n_vocab(), "model loaded");

        let mtmd = MtmdContext::new_from_file(
            &params.mmproj_path,
            Arc::clone(&model),
            &MtmdContextParams {
                use_gpu: params.mmproj_use_gpu,
                print_timings: false,
                n_threads: params.n_threads,
            },
        )?;
        info!(
            path = %params.mmproj_path.display(),
            vision = mtmd.supports_vision(),
            audio = mtmd.supports_audio(),
            "projector loaded"
        );

        let context = LlamaContext::new(
            Arc::clone(&model),
            LlamaContextParams {
                n_ctx: params.n_ctx,
                n_threads: params.n_threads,
            },
        )?;

        let template = model.chat_template();
        debug!(
            n_ctx = context.n_ctx(),
            template = %template.lines().next().unwrap_or_default(),
            "context created"
        );

        Ok(Self {
            mtmd,
            context,
            model,
            template,
            marker: MtmdContext::default_marker()?,
        })
    }
}

impl Engine for LlamaEngine {
    fn n_ctx(&self) -> usize {
        self.context.n_ctx()
    }

    fn capabilities(&self) -> BitFlags<Capability> {
        self.mtmd.capabilities()
    }

    fn format_chat(
        &self,
        role: Role,
        content: &str,
        add_generation_prompt: bool,
    ) -> Result<String, EngineError> {
        Ok(self.model.apply_chat_template(
            &self.template,
            role.as_str(),
            content,
            add_generation_prompt,
        )?)
    }

    fn tokenize(&self, text: &str, add_special: bool) -> Result<Vec<TokenId>, EngineError> {
        Ok(self.model.tokenize(text, add_special)?)
    }

    fn token_to_piece(&self, token: TokenId) -> Result<Vec<u8>, EngineError> {
        Ok(self.model.token_to_piece(token)?)
    }

    fn is_end_of_generation(&self, token: TokenId) -> bool {
        self.model.is_eog(token)
    }

    fn eval_tokens(&mut self, tokens: &[TokenId], n_past: usize) -> Result<(), EngineError> {
        Ok(self.context.decode(tokens, n_past)?)
    }

    fn eval_image(
        &mut self,
        image: &RgbImage,
        n_past: usize,
        n_ctx: usize,
    ) -> Result<usize, EngineError> {
        let bitmap = Bitmap::from_rgb(image).map_err(LlamaError::from)?;
        let mut chunks = InputChunks::new().map_err(LlamaError::from)?;
        chunks.tokenize(
            &self.mtmd,
            InputText::new(self.marker).with_add_special(false),
            &[&bitmap],
        )?;

        let needed = chunks.n_pos();
        let available = n_ctx.min(self.context.n_ctx()).saturating_sub(n_past);
        if needed > available {
            return Err(LlamaError::ContextFull { needed, available }.into());
        }
        trace!(
            width = bitmap.width(),
            height = bitmap.height(),
            chunks = chunks.len(),
            positions = needed,
            "evaluating image"
        );
        Ok(chunks.eval(&self.mtmd, &mut self.context, n_past)?)
    }

    fn logits(&self) -> Result<&[f32], EngineError> {
        Ok(self.context.last_logits()?)
    }

    fn truncate(&mut self, n_past: usize) {
        self.context.truncate(n_past);
    }

    fn warmup(&mut self) -> Result<(), EngineError> {
        self.context.warmup()?;
        debug!("warmup done");
        Ok(())
    }
}

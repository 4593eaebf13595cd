//! Loaded text model and its vocabulary

use std::ffi::{c_char, CStr, CString};
use std::path::Path;
use std::ptr::NonNull;

use llama_cpp_sys_4 as sys;

use crate::llama::error::LlamaError;
use crate::token::TokenId;

/// Template used when the model carries none
const FALLBACK_TEMPLATE: &str = "chatml";

/// Parameters for loading a model
#[derive(Debug, Clone, Copy)]
pub struct LlamaModelParams {
    /// Layers to offload to the GPU
    pub n_gpu_layers: i32,
}

impl LlamaModelParams {
    /// Offload every layer when `use_gpu` is set, none otherwise
    pub fn for_gpu(use_gpu: bool) -> Self {
        Self {
            n_gpu_layers: if use_gpu { 999 } else { 0 },
        }
    }
}

/// A GGUF model loaded by llama.cpp
#[derive(Debug)]
pub struct LlamaModel {
    ptr: NonNull<sys::llama_model>,
}

// Safety: llama_model is immutable after loading
unsafe impl Send for LlamaModel {}
// Safety: see above
unsafe impl Sync for LlamaModel {}

impl LlamaModel {
    /// Load a model from a GGUF file
    ///
    /// # Errors
    ///
    /// Fails when the path cannot be passed to C or llama.cpp rejects the file.
    pub fn load_from_file(path: &Path, params: LlamaModelParams) -> Result<Self, LlamaError> {
        let path_str = path
            .to_str()
            .ok_or_else(|| LlamaError::NonUtf8Path(path.to_path_buf()))?;
        let c_path = CString::new(path_str)?;

        let mut sys_params = unsafe { sys::llama_model_default_params() };
        sys_params.n_gpu_layers = params.n_gpu_layers;

        let model = unsafe { sys::llama_model_load_from_file(c_path.as_ptr(), sys_params) };
        let ptr = NonNull::new(model).ok_or_else(|| LlamaError::ModelLoad(path.to_path_buf()))?;
        Ok(Self { ptr })
    }

    pub(crate) fn as_ptr(&self) -> NonNull<sys::llama_model> {
        self.ptr
    }

    fn vocab(&self) -> *const sys::llama_vocab {
        unsafe { sys::llama_model_get_vocab(self.ptr.as_ptr()) }
    }

    /// Number of tokens in the vocabulary
    pub fn n_vocab(&self) -> usize {
        let n = unsafe { sys::llama_vocab_n_tokens(self.vocab()) };
        usize::try_from(n).unwrap_or(0)
    }

    /// Beginning-of-sequence token
    pub fn token_bos(&self) -> TokenId {
        unsafe { sys::llama_vocab_bos(self.vocab()) }
    }

    /// End-of-sequence token
    pub fn token_eos(&self) -> TokenId {
        unsafe { sys::llama_vocab_eos(self.vocab()) }
    }

    /// Whether `token` ends generation
    pub fn is_eog(&self, token: TokenId) -> bool {
        unsafe { sys::llama_vocab_is_eog(self.vocab(), token) }
    }

    /// Convert text to tokens
    ///
    /// Special tokens written in the text are parsed.
    ///
    /// # Errors
    ///
    /// Fails when llama.cpp rejects the text.
    pub fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<TokenId>, LlamaError> {
        let len = i32::try_from(text.len()).map_err(|_| LlamaError::Overflow(text.len()))?;
        let mut capacity = text.len() + usize::from(add_bos) + 1;

        // a negative return is the required size
        for _ in 0..2 {
            let mut tokens: Vec<TokenId> = vec![0; capacity];
            let max = i32::try_from(capacity).map_err(|_| LlamaError::Overflow(capacity))?;
            let n = unsafe {
                sys::llama_tokenize(
                    self.vocab(),
                    text.as_ptr().cast::<c_char>(),
                    len,
                    tokens.as_mut_ptr(),
                    max,
                    add_bos,
                    true,
                )
            };
            match usize::try_from(n) {
                Ok(n) => {
                    tokens.truncate(n);
                    return Ok(tokens);
                }
                Err(_) if n != i32::MIN => capacity = n.unsigned_abs() as usize,
                Err(_) => break,
            }
        }
        Err(LlamaError::Tokenize { len: text.len() })
    }

    /// Raw bytes of a token, special tokens rendered as text
    ///
    /// # Errors
    ///
    /// Fails when llama.cpp cannot render the token.
    pub fn token_to_piece(&self, token: TokenId) -> Result<Vec<u8>, LlamaError> {
        let mut capacity = 32usize;
        for _ in 0..2 {
            let mut buf = vec![0u8; capacity];
            let len = i32::try_from(capacity).map_err(|_| LlamaError::Overflow(capacity))?;
            let n = unsafe {
                sys::llama_token_to_piece(
                    self.vocab(),
                    token,
                    buf.as_mut_ptr().cast::<c_char>(),
                    len,
                    0,
                    true,
                )
            };
            match usize::try_from(n) {
                Ok(n) => {
                    buf.truncate(n);
                    return Ok(buf);
                }
                Err(_) if n != i32::MIN => capacity = n.unsigned_abs() as usize,
                Err(_) => break,
            }
        }
        Err(LlamaError::TokenToPiece(token))
    }

    /// Chat template stored in the model, or chatml
    pub fn chat_template(&self) -> String {
        let tmpl = unsafe { sys::llama_model_chat_template(self.ptr.as_ptr(), std::ptr::null()) };
        if tmpl.is_null() {
            return FALLBACK_TEMPLATE.to_owned();
        }
        let tmpl = unsafe {
            // Safety: non-null templates are NUL-terminated strings owned by the model
            CStr::from_ptr(tmpl)
        };
        tmpl.to_str()
            .map_or_else(|_| FALLBACK_TEMPLATE.to_owned(), str::to_owned)
    }

    /// Render a single message with `template`
    ///
    /// # Errors
    ///
    /// Fails when llama.cpp does not recognise the template.
    pub fn apply_chat_template(
        &self,
        template: &str,
        role: &str,
        content: &str,
        add_assistant: bool,
    ) -> Result<String, LlamaError> {
        let failed = || LlamaError::ChatTemplate {
            template: template.to_owned(),
        };
        let c_template = CString::new(template).map_err(|_| failed())?;
        let c_role = CString::new(role).map_err(|_| failed())?;
        let c_content = CString::new(content).map_err(|_| failed())?;
        let message = sys::llama_chat_message {
            role: c_role.as_ptr(),
            content: c_content.as_ptr(),
        };

        let mut capacity = (template.len() + role.len() + content.len()) * 2 + 64;
        for _ in 0..2 {
            let mut buf = vec![0u8; capacity];
            let len = i32::try_from(capacity).map_err(|_| LlamaError::Overflow(capacity))?;
            let n = unsafe {
                // Safety: every string outlives the call and buf holds `len` bytes
                sys::llama_chat_apply_template(
                    c_template.as_ptr(),
                    &message,
                    1,
                    add_assistant,
                    buf.as_mut_ptr().cast::<c_char>(),
                    len,
                )
            };
            let n = usize::try_from(n).map_err(|_| failed())?;
            if n <= capacity {
                buf.truncate(n);
                return String::from_utf8(buf).map_err(|_| failed());
            }
            capacity = n;
        }
        Err(failed())
    }
}

impl Drop for LlamaModel {
    fn drop(&mut self) {
        unsafe { sys::llama_model_free(self.ptr.as_ptr()) }
    }
}

//! Inference context and token batches

use std::ptr::NonNull;
use std::sync::Arc;

use llama_cpp_sys_4 as sys;

use crate::llama::error::LlamaError;
use crate::llama::model::LlamaModel;
use crate::token::{warmup_token, TokenId};

/// Largest logical batch handed to `llama_decode`
const MAX_BATCH: u32 = 512;

/// Parameters for creating a context
#[derive(Debug, Clone, Copy)]
pub struct LlamaContextParams {
    /// Context window in positions
    pub n_ctx: u32,
    /// Threads for generation and prompt processing
    pub n_threads: i32,
}

/// A llama.cpp context with its KV cache
#[derive(Debug)]
pub struct LlamaContext {
    ptr: NonNull<sys::llama_context>,
    batch: Batch,
    n_batch: usize,
    n_vocab: usize,
    model: Arc<LlamaModel>,
}

// Safety: the context is only used through &mut, one thread at a time
unsafe impl Send for LlamaContext {}

impl LlamaContext {
    /// Create a context for `model`
    ///
    /// # Errors
    ///
    /// Fails when llama.cpp cannot allocate the context.
    pub fn new(model: Arc<LlamaModel>, params: LlamaContextParams) -> Result<Self, LlamaError> {
        let n_batch = params.n_ctx.min(MAX_BATCH);
        let mut sys_params = unsafe { sys::llama_context_default_params() };
        sys_params.n_ctx = params.n_ctx;
        sys_params.n_batch = n_batch;
        sys_params.n_ubatch = n_batch;
        sys_params.n_threads = params.n_threads;
        sys_params.n_threads_batch = params.n_threads;

        let ctx = unsafe { sys::llama_init_from_model(model.as_ptr().as_ptr(), sys_params) };
        let ptr = NonNull::new(ctx).ok_or(LlamaError::ContextInit {
            n_ctx: params.n_ctx,
        })?;

        let n_batch = n_batch as usize;
        Ok(Self {
            ptr,
            batch: Batch::new(n_batch),
            n_batch,
            n_vocab: model.n_vocab(),
            model,
        })
    }

    pub(crate) fn as_ptr(&self) -> NonNull<sys::llama_context> {
        self.ptr
    }

    /// Actual window size, which llama.cpp may round
    pub fn n_ctx(&self) -> usize {
        unsafe { sys::llama_n_ctx(self.ptr.as_ptr()) as usize }
    }

    /// Tokens evaluated per `llama_decode` call
    pub fn n_batch(&self) -> usize {
        self.n_batch
    }

    /// Evaluate `tokens` at consecutive positions from `n_past`
    ///
    /// Only the last token requests logits.
    ///
    /// # Errors
    ///
    /// Fails when a position overflows or `llama_decode` fails.
    pub fn decode(&mut self, tokens: &[TokenId], n_past: usize) -> Result<(), LlamaError> {
        let total = tokens.len();
        for (chunk_index, chunk) in tokens.chunks(self.n_batch).enumerate() {
            let offset = chunk_index * self.n_batch;
            self.batch.clear();
            for (i, &token) in chunk.iter().enumerate() {
                let pos = n_past + offset + i;
                let pos = i32::try_from(pos).map_err(|_| LlamaError::Overflow(pos))?;
                self.batch.add(token, pos, offset + i + 1 == total)?;
            }
            let result = unsafe { sys::llama_decode(self.ptr.as_ptr(), self.batch.raw) };
            if result != 0 {
                return Err(LlamaError::Decode(result));
            }
        }
        Ok(())
    }

    /// Logits of the last position that requested them
    ///
    /// # Errors
    ///
    /// Fails when no position has logits.
    pub fn last_logits(&self) -> Result<&[f32], LlamaError> {
        let logits = unsafe { sys::llama_get_logits_ith(self.ptr.as_ptr(), -1) };
        if logits.is_null() || self.n_vocab == 0 {
            return Err(LlamaError::NoLogits);
        }
        // Safety: llama.cpp keeps n_vocab logits per output until the next decode,
        // which needs &mut self
        Ok(unsafe { std::slice::from_raw_parts(logits, self.n_vocab) })
    }

    /// Remove every cache cell of sequence 0 from `n_past` on
    pub fn truncate(&mut self, n_past: usize) {
        let p0 = i32::try_from(n_past).unwrap_or(i32::MAX);
        unsafe {
            let mem = sys::llama_get_memory(self.ptr.as_ptr());
            sys::llama_memory_seq_rm(mem, 0, p0, -1);
        }
    }

    /// Decode one token with warmup enabled, then wipe the cache
    ///
    /// The token is BOS, or EOS for vocabularies without one, or token 0.
    ///
    /// # Errors
    ///
    /// Fails when the warmup decode fails.
    pub fn warmup(&mut self) -> Result<(), LlamaError> {
        let token = warmup_token(self.model.token_bos(), self.model.token_eos());
        unsafe { sys::llama_set_warmup(self.ptr.as_ptr(), true) };
        let result = self.decode(&[token], 0);
        unsafe {
            let mem = sys::llama_get_memory(self.ptr.as_ptr());
            sys::llama_memory_clear(mem, true);
            sys::llama_synchronize(self.ptr.as_ptr());
            sys::llama_set_warmup(self.ptr.as_ptr(), false);
        }
        result
    }
}

impl Drop for LlamaContext {
    fn drop(&mut self) {
        unsafe { sys::llama_free(self.ptr.as_ptr()) }
    }
}

/// A `llama_batch` for single-sequence token input
#[derive(Debug)]
struct Batch {
    raw: sys::llama_batch,
    capacity: usize,
}

impl Batch {
    fn new(capacity: usize) -> Self {
        let n_tokens = i32::try_from(capacity).unwrap_or(i32::MAX);
        let raw = unsafe { sys::llama_batch_init(n_tokens, 0, 1) };
        Self { raw, capacity }
    }

    fn clear(&mut self) {
        self.raw.n_tokens = 0;
    }

    fn add(&mut self, token: TokenId, pos: i32, logits: bool) -> Result<(), LlamaError> {
        let i = usize::try_from(self.raw.n_tokens).unwrap_or(usize::MAX);
        if i >= self.capacity {
            return Err(LlamaError::BatchFull {
                capacity: self.capacity,
            });
        }
        // Safety: llama_batch_init allocated `capacity` slots with one sequence id each
        unsafe {
            *self.raw.token.add(i) = token;
            *self.raw.pos.add(i) = pos;
            *self.raw.n_seq_id.add(i) = 1;
            *(*self.raw.seq_id.add(i)) = 0;
            *self.raw.logits.add(i) = i8::from(logits);
        }
        self.raw.n_tokens += 1;
        Ok(())
    }
}

impl Drop for Batch {
    fn drop(&mut self) {
        unsafe { sys::llama_batch_free(self.raw) }
    }
}

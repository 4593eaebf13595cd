//! Session configuration

use std::path::PathBuf;

use crate::error::SessionError;

/// Seed used by the temperature sampler unless overridden.
pub const DEFAULT_SEED: u64 = 0x5EED;

/// Parameters for creating a [`Session`](crate::Session)
///
/// Paths are only read while the session is created; the session keeps no
/// reference to them afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionParams {
    /// Path to the language model file (GGUF)
    pub model_path: PathBuf,
    /// Path to the multimodal projector file (mmproj GGUF)
    pub mmproj_path: PathBuf,
    /// Maximum number of tokens generated per turn; `<= 0` means until end of generation
    pub n_predict: i32,
    /// Context window size in positions
    pub n_ctx: u32,
    /// Number of threads used for evaluation
    pub n_threads: i32,
    /// Sampling temperature; `0.0` selects the most likely token
    pub temperature: f32,
    /// Whether to offload the language model to the GPU
    pub use_gpu: bool,
    /// Whether to run the projector on the GPU
    pub mmproj_use_gpu: bool,
    /// Whether to run a throwaway evaluation before first use
    pub warmup: bool,
    /// Seed for the temperature sampler
    pub seed: u64,
}

impl Default for SessionParams {
    fn default() -> Self {
        Self {
            model_path: PathBuf::new(),
            mmproj_path: PathBuf::new(),
            n_predict: 100,
            n_ctx: 4096,
            n_threads: 4,
            temperature: 0.7,
            use_gpu: true,
            mmproj_use_gpu: true,
            warmup: true,
            seed: DEFAULT_SEED,
        }
    }
}

impl SessionParams {
    /// Set the language model path
    #[must_use]
    pub fn with_model_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.model_path = path.into();
        self
    }

    /// Set the projector path
    #[must_use]
    pub fn with_mmproj_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.mmproj_path = path.into();
        self
    }

    /// Set the per-turn prediction limit
    #[must_use]
    pub fn with_n_predict(mut self, n_predict: i32) -> Self {
        self.n_predict = n_predict;
        self
    }

    /// Set the context window size
    #[must_use]
    pub fn with_n_ctx(mut self, n_ctx: u32) -> Self {
        self.n_ctx = n_ctx;
        self
    }

    /// Set the number of threads
    #[must_use]
    pub fn with_n_threads(mut self, n_threads: i32) -> Self {
        self.n_threads = n_threads;
        self
    }

    /// Set the sampling temperature
    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Enable or disable GPU offload of the language model
    #[must_use]
    pub fn with_use_gpu(mut self, use_gpu: bool) -> Self {
        self.use_gpu = use_gpu;
        self
    }

    /// Enable or disable GPU use for the projector
    #[must_use]
    pub fn with_mmproj_use_gpu(mut self, use_gpu: bool) -> Self {
        self.mmproj_use_gpu = use_gpu;
        self
    }

    /// Enable or disable the warmup pass
    #[must_use]
    pub fn with_warmup(mut self, warmup: bool) -> Self {
        self.warmup = warmup;
        self
    }

    /// Set the sampler seed
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// The per-turn token limit, or `None` when generation runs until the model stops
    pub fn prediction_limit(&self) -> Option<usize> {
        usize::try_from(self.n_predict).ok().filter(|&n| n > 0)
    }

    /// Check that every numeric parameter is in range
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::InvalidParams`] naming the first offending field.
    pub fn validate(&self) -> Result<(), SessionError> {
        if self.n_ctx == 0 {
            return Err(SessionError::InvalidParams("n_ctx must be greater than 0".into()));
        }
        if self.n_threads <= 0 {
            return Err(SessionError::InvalidParams(format!(
                "n_threads must be greater than 0, got {}",
                self.n_threads
            )));
        }
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err(SessionError::InvalidParams(format!(
                "temperature must be a finite value >= 0, got {}",
                self.temperature
            )));
        }
        Ok(())
    }
}

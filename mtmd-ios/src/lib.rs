//! Multimodal inference sessions for mobile hosts.
//!
//! A [`Session`] owns one multimodal language-model context. Callers prefill it
//! with images, video frames and chat turns in any order, then pull generated
//! text one token at a time:
//!
//! ```no_run
//! use mtmd_ios::{Role, Session, SessionParams};
//!
//! # fn main() -> Result<(), mtmd_ios::SessionError> {
//! let params = SessionParams::default()
//!     .with_model_path("MiniCPM-V-4-Q4_K_M.gguf")
//!     .with_mmproj_path("mmproj-model-f16.gguf");
//! let mut session = Session::new(&params)?;
//!
//! session.prefill_image("photo.jpg")?;
//! session.prefill_text("What is in this picture?", Role::User)?;
//!
//! for piece in session.tokens() {
//!     print!("{}", piece?);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! The same lifecycle is exported with C linkage in [`ffi`] (header:
//! `include/mtmd-ios.h`) for hosts that link the static library.
//!
//! The inference engine sits behind the [`Engine`] trait. The `llama` feature
//! provides [`llama::LlamaEngine`] on top of llama.cpp and libmtmd; other
//! engines can be plugged in with [`Session::with_engine`].

pub mod chat;
pub mod engine;
pub mod error;
pub mod ffi;
pub mod media;
pub mod params;
pub mod sampling;
pub mod session;
pub mod token;

#[cfg(feature = "llama")]
pub mod llama;

pub use chat::Role;
pub use engine::{Capability, Engine, EngineError};
pub use error::SessionError;
pub use params::SessionParams;
pub use session::{Session, Tokens};
pub use token::{Token, TokenId};

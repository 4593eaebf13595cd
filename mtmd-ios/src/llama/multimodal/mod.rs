//! Image support through libmtmd

pub mod bitmap;
pub mod chunks;
pub mod context;
pub mod error;

pub use bitmap::Bitmap;
pub use chunks::{InputChunks, InputText};
pub use context::{MtmdContext, MtmdContextParams};
pub use error::MultimodalError;

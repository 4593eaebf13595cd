//! Loading images and video frames for prefill

use std::path::Path;

use image::imageops::{self, FilterType};
use image::RgbImage;
use thiserror::Error;

/// Longest edge a video frame is scaled down to before projection.
pub const FRAME_MAX_EDGE: u32 = 448;

/// Errors that can occur while loading media
#[derive(Debug, Error)]
pub enum MediaError {
    /// The file could not be read
    #[error("Failed to read {}: {source}", path.display())]
    Io {
        /// The file being read
        path: std::path::PathBuf,
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// The file is not an image in a supported format
    #[error("Failed to decode image {}: {source}", path.display())]
    Decode {
        /// The file being decoded
        path: std::path::PathBuf,
        /// The underlying decoder error
        #[source]
        source: image::ImageError,
    },

    /// The image decoded to zero pixels
    #[error("Invalid image dimensions: {width}x{height}")]
    InvalidDimensions {
        /// Decoded width
        width: u32,
        /// Decoded height
        height: u32,
    },
}

/// Read and decode an image file into RGB pixels
///
/// The format is detected from the file contents, not its extension.
///
/// # Errors
///
/// Returns [`MediaError`] when the file is unreadable, not a supported image,
/// or empty.
pub fn load_image(path: &Path) -> Result<RgbImage, MediaError> {
    let bytes = std::fs::read(path).map_err(|source| MediaError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let image = image::load_from_memory(&bytes)
        .map_err(|source| MediaError::Decode {
            path: path.to_path_buf(),
            source,
        })?
        .to_rgb8();

    if image.width() == 0 || image.height() == 0 {
        return Err(MediaError::InvalidDimensions {
            width: image.width(),
            height: image.height(),
        });
    }
    Ok(image)
}

/// Read a video frame, scaled so its longest edge is at most [`FRAME_MAX_EDGE`]
///
/// # Errors
///
/// Same as [`load_image`].
pub fn load_frame(path: &Path) -> Result<RgbImage, MediaError> {
    load_image(path).map(fit_frame)
}

/// Downscale `image` to the frame budget, keeping its aspect ratio
pub fn fit_frame(image: RgbImage) -> RgbImage {
    let (width, height) = image.dimensions();
    let longest = width.max(height);
    if longest <= FRAME_MAX_EDGE {
        return image;
    }
    let scale = |edge: u32| {
        let scaled = u64::from(edge) * u64::from(FRAME_MAX_EDGE) / u64::from(longest);
        u32::try_from(scaled).unwrap_or(FRAME_MAX_EDGE).max(1)
    };
    imageops::resize(&image, scale(width), scale(height), FilterType::Triangle)
}

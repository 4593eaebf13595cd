//! Bitmap handling for images

use std::ptr::NonNull;

use image::RgbImage;
use llama_cpp_sys_4 as sys;

use crate::llama::multimodal::MultimodalError;

/// An RGB image owned by libmtmd
#[derive(Debug)]
pub struct Bitmap {
    ptr: NonNull<sys::mtmd_bitmap>,
}

impl Bitmap {
    /// Create an image bitmap from packed RGB bytes
    ///
    /// `data` must be `width * height * 3` bytes in RGBRGB... order.
    ///
    /// # Errors
    ///
    /// Fails when the buffer size does not match or libmtmd returns null.
    pub fn new_image(width: u32, height: u32, data: &[u8]) -> Result<Self, MultimodalError> {
        let expected = u64::from(width) * u64::from(height) * 3;
        if width == 0 || height == 0 || data.len() as u64 != expected {
            return Err(MultimodalError::InvalidImageDimensions {
                width,
                height,
                len: data.len(),
            });
        }

        let bitmap = unsafe {
            // Safety: data holds width * height * 3 bytes; libmtmd copies them
            sys::mtmd_bitmap_init(width, height, data.as_ptr())
        };

        NonNull::new(bitmap)
            .map(|ptr| Self { ptr })
            .ok_or(MultimodalError::NullPointer("bitmap"))
    }

    /// Copy a decoded image into a bitmap
    ///
    /// # Errors
    ///
    /// See [`Bitmap::new_image`].
    pub fn from_rgb(image: &RgbImage) -> Result<Self, MultimodalError> {
        Self::new_image(image.width(), image.height(), image.as_raw())
    }

    /// Width in pixels
    pub fn width(&self) -> u32 {
        unsafe { sys::mtmd_bitmap_get_nx(self.ptr.as_ptr()) }
    }

    /// Height in pixels
    pub fn height(&self) -> u32 {
        unsafe { sys::mtmd_bitmap_get_ny(self.ptr.as_ptr()) }
    }

    pub(crate) fn as_ptr(&self) -> NonNull<sys::mtmd_bitmap> {
        self.ptr
    }
}

impl Drop for Bitmap {
    fn drop(&mut self) {
        unsafe {
            sys::mtmd_bitmap_free(self.ptr.as_ptr());
        }
    }
}

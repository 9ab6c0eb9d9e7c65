//! Image file boundary: still images in, PNG out.
//!
//! Loading accepts PNG, JPEG and BMP and reduces the picture to an 8-bit
//! luminance [`Frame`]. Saving writes a [`PixelGrid`] as PNG only.

use std::io::Cursor;
use std::path::Path;

use image::{GrayImage, ImageFormat};

use crate::encode::PixelGrid;
use crate::traits::Frame;

/// Formats accepted by [`load_frame`].
pub const LOADABLE_FORMATS: [ImageFormat; 3] = [ImageFormat::Png, ImageFormat::Jpeg, ImageFormat::Bmp];

/// Error type for image file conversions.
#[derive(Debug, thiserror::Error)]
pub enum ImageIoError {
    /// Bytes are not one of the accepted formats.
    #[error("Unsupported image format")]
    UnsupportedFormat,
    /// The image codec rejected the data.
    #[error("Failed to read image: {0}")]
    Codec(#[from] image::ImageError),
    /// Reading or writing the file failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Decode PNG/JPEG/BMP bytes into a luminance frame.
pub fn load_frame(bytes: &[u8]) -> Result<Frame, ImageIoError> {
    let format = image::guess_format(bytes).map_err(|_| ImageIoError::UnsupportedFormat)?;
    if !LOADABLE_FORMATS.contains(&format) {
        return Err(ImageIoError::UnsupportedFormat);
    }

    let luma = image::load_from_memory_with_format(bytes, format)?.into_luma8();
    let (width, height) = luma.dimensions();
    log::debug!("loaded {format:?} image {width}x{height}");
    Ok(Frame::from_validated(width, height, luma.into_raw()))
}

/// Read and decode an image file into a luminance frame.
pub fn load_frame_from_path<P: AsRef<Path>>(path: P) -> Result<Frame, ImageIoError> {
    let bytes = std::fs::read(path)?;
    load_frame(&bytes)
}

/// Encode a rendered symbol as PNG bytes.
pub fn encode_png(grid: &PixelGrid) -> Result<Vec<u8>, ImageIoError> {
    let image = GrayImage::from_raw(grid.width(), grid.height(), grid.pixels().to_vec())
        .ok_or(ImageIoError::UnsupportedFormat)?;
    let mut out = Cursor::new(Vec::new());
    image.write_to(&mut out, ImageFormat::Png)?;
    Ok(out.into_inner())
}

/// Write a rendered symbol to `path` as PNG, whatever the extension says.
pub fn save_png<P: AsRef<Path>>(grid: &PixelGrid, path: P) -> Result<(), ImageIoError> {
    let bytes = encode_png(grid)?;
    std::fs::write(path, bytes)?;
    Ok(())
}

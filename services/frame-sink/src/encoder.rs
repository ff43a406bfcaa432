//! Gray8 to BMP encoding.

use bytes::Bytes;
use image::codecs::bmp::BmpEncoder;
use image::{ExtendedColorType, ImageEncoder};
use thiserror::Error;
use tracing::trace;

/// Errors that can occur while encoding a frame
#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("Invalid frame dimensions: {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },

    #[error("Frame buffer holds {actual} bytes, expected {expected} for {width}x{height} Gray8")]
    LengthMismatch {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },

    #[error("BMP encoding failed: {0}")]
    Codec(#[from] image::ImageError),
}

/// An encoded BMP image
#[derive(Debug, Clone)]
pub struct EncodedPayload {
    pub data: Bytes,
}

impl EncodedPayload {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

/// Encode a single-channel 8-bit buffer as a lossless BMP.
pub fn encode(buffer: &[u8], width: u32, height: u32) -> Result<EncodedPayload, EncodeError> {
    if width == 0 || height == 0 {
        return Err(EncodeError::InvalidDimensions { width, height });
    }

    let expected = width as usize * height as usize;
    if buffer.len() != expected {
        return Err(EncodeError::LengthMismatch {
            width,
            height,
            expected,
            actual: buffer.len(),
        });
    }

    // 8-bit palette, 1024-byte colour table, rows padded to 4 bytes
    let row = (width as usize + 3) & !3;
    let mut out = Vec::with_capacity(54 + 1024 + row * height as usize);

    BmpEncoder::new(&mut out).write_image(buffer, width, height, ExtendedColorType::L8)?;

    trace!(width, height, bytes = out.len(), "Frame encoded");

    Ok(EncodedPayload {
        data: Bytes::from(out),
    })
}

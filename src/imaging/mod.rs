//! Image generation, image explanation and character portraits

pub mod explainer;
pub mod generator;
pub mod portraits;

pub use explainer::{HttpImageExplainer, ImageExplainer, DEFAULT_EXPLAIN_PROMPT};
pub use generator::{GeneratedImage, HttpImageGenerator, ImageGenerator, ImageRequest};
pub use portraits::{CharacterType, Portrait, PortraitStore};

use crate::{ParleyError, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use std::io::Cursor;

pub fn encode_base64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Decode plain base64 or a `data:image/...;base64,` URL
pub fn decode_base64_image(data: &str) -> Result<Vec<u8>> {
    let payload = match data.split_once(',') {
        Some((prefix, rest)) if prefix.starts_with("data:") => rest,
        _ => data,
    };
    STANDARD
        .decode(payload.trim())
        .map_err(|e| ParleyError::ProtocolError(format!("Invalid base64 image: {}", e)))
}

/// Validate arbitrary image bytes and re-encode them as PNG
pub fn to_png(bytes: &[u8]) -> Result<Vec<u8>> {
    if matches!(image::guess_format(bytes), Ok(image::ImageFormat::Png)) {
        return Ok(bytes.to_vec());
    }
    let decoded = image::load_from_memory(bytes)
        .map_err(|e| ParleyError::ProtocolError(format!("Unreadable image: {}", e)))?;
    let mut out = Cursor::new(Vec::new());
    decoded
        .write_to(&mut out, image::ImageFormat::Png)
        .map_err(|e| ParleyError::IOError(format!("Failed to encode PNG: {}", e)))?;
    Ok(out.into_inner())
}

#[cfg(test)]
pub(crate) fn tiny_png() -> Vec<u8> {
    let img = image::RgbImage::from_pixel(2, 2, image::Rgb([200, 30, 30]));
    let mut out = Cursor::new(Vec::new());
    image::DynamicImage::ImageRgb8(img)
        .write_to(&mut out, image::ImageFormat::Png)
        .unwrap();
    out.into_inner()
}

use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
use std::io::Cursor;
use std::sync::Arc;

use crate::core::errors::{CompositorError, CompositorResult};

const METERS_PER_INCH: f64 = 0.0254;

/// Asynchronously decode an image from bytes using spawn_blocking.
///
/// Image decoding is CPU-intensive, especially for large images.
pub async fn load_image_from_memory_async(bytes: Arc<Vec<u8>>) -> CompositorResult<DynamicImage> {
    tokio::task::spawn_blocking(move || -> CompositorResult<DynamicImage> {
        Ok(image::load_from_memory(&bytes)?)
    })
    .await?
}

/// Asynchronously resize an image to exact dimensions using spawn_blocking.
pub async fn resize_exact_async(
    img: DynamicImage,
    new_width: u32,
    new_height: u32,
    filter: image::imageops::FilterType,
) -> CompositorResult<DynamicImage> {
    tokio::task::spawn_blocking(move || -> CompositorResult<DynamicImage> {
        Ok(img.resize_exact(new_width, new_height, filter))
    })
    .await?
}

/// Strip an optional `data:...;base64,` prefix and right-pad with `=` to a
/// multiple of four before decoding.
pub fn decode_base64_padded(data: &str) -> CompositorResult<Vec<u8>> {
    let payload = match data.split_once(',') {
        Some((prefix, rest)) if prefix.starts_with("data:") => rest,
        _ => data,
    };
    let payload = payload.trim();

    let mut padded = String::with_capacity(payload.len() + 3);
    padded.push_str(payload);
    while padded.len() % 4 != 0 {
        padded.push('=');
    }

    Ok(STANDARD.decode(padded.as_bytes())?)
}

/// Encode RGBA pixels as PNG with a pHYs chunk carrying `dpi` on both axes.
pub fn encode_png_with_dpi(img: &RgbaImage, dpi: u32) -> CompositorResult<Vec<u8>> {
    let ppm = (f64::from(dpi) / METERS_PER_INCH).round() as u32;

    let mut png_bytes = Vec::new();
    {
        let mut encoder = png::Encoder::new(&mut png_bytes, img.width(), img.height());
        encoder.set_color(png::ColorType::Rgba);
        encoder.set_depth(png::BitDepth::Eight);
        encoder.set_pixel_dims(Some(png::PixelDimensions {
            xppu: ppm,
            yppu: ppm,
            unit: png::Unit::Meter,
        }));

        let mut writer = encoder
            .write_header()
            .map_err(|e| CompositorError::Encode(e.to_string()))?;
        writer
            .write_image_data(img.as_raw())
            .map_err(|e| CompositorError::Encode(e.to_string()))?;
        writer
            .finish()
            .map_err(|e| CompositorError::Encode(e.to_string()))?;
    }

    Ok(png_bytes)
}

/// Plain PNG encoding (no physical dimensions).
pub fn encode_png(img: &DynamicImage) -> CompositorResult<Vec<u8>> {
    let mut png_bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut png_bytes), ImageFormat::Png)?;
    Ok(png_bytes)
}

/// Flatten any alpha onto opaque white and encode as JPEG.
pub fn encode_jpeg_flattened(img: &DynamicImage, quality: u8) -> CompositorResult<Vec<u8>> {
    let rgba = img.to_rgba8();
    let mut flat = RgbaImage::from_pixel(rgba.width(), rgba.height(), Rgba([255, 255, 255, 255]));
    image::imageops::overlay(&mut flat, &rgba, 0, 0);
    let rgb = DynamicImage::ImageRgba8(flat).to_rgb8();

    let mut jpeg_bytes = Vec::new();
    JpegEncoder::new_with_quality(&mut jpeg_bytes, quality).encode_image(&rgb)?;
    Ok(jpeg_bytes)
}

/// Asynchronous variant of [`encode_jpeg_flattened`] for raw image bytes.
pub async fn reencode_jpeg_async(bytes: Arc<Vec<u8>>, quality: u8) -> CompositorResult<Vec<u8>> {
    tokio::task::spawn_blocking(move || -> CompositorResult<Vec<u8>> {
        let img = image::load_from_memory(&bytes)?;
        encode_jpeg_flattened(&img, quality)
    })
    .await?
}

pub fn png_data_url(png_bytes: &[u8]) -> String {
    format!("data:image/png;base64,{}", STANDARD.encode(png_bytes))
}

use std::collections::HashMap;
use std::io::Cursor;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat, ImageReader};
use replica_contracts::manifest::Bounds;
use replica_contracts::ReferenceFile;

pub fn decode_reference(file: &ReferenceFile) -> Result<Vec<u8>> {
    BASE64
        .decode(file.payload().as_bytes())
        .with_context(|| format!("reference '{}' is not valid base64", file.filename))
}

/// Reads pixel dimensions from the encoded header without decoding pixels.
pub fn measure_dimensions(bytes: &[u8]) -> Option<(u32, u32)> {
    ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .ok()?
        .into_dimensions()
        .ok()
        .filter(|(width, height)| *width > 0 && *height > 0)
}

pub fn load_image(bytes: &[u8]) -> Result<DynamicImage> {
    image::load_from_memory(bytes).context("reference image decode failed")
}

/// Upscales small references before vision analysis so compression blur does
/// not smear measured edges. Returns `None` when the image is already at least
/// `min_dimension` on its shorter side.
pub fn enhance_for_vision(
    image: &DynamicImage,
    min_dimension: u32,
    max_scale: f64,
) -> Option<DynamicImage> {
    let shorter = image.width().min(image.height());
    if shorter == 0 || shorter >= min_dimension {
        return None;
    }
    let scale = (min_dimension as f64 / shorter as f64).min(max_scale.max(1.0));
    if scale <= 1.0 {
        return None;
    }
    let width = (image.width() as f64 * scale).round() as u32;
    let height = (image.height() as f64 * scale).round() as u32;
    Some(
        image
            .resize_exact(width, height, FilterType::Lanczos3)
            .unsharpen(0.8, 2),
    )
}

pub fn encode_png(image: &DynamicImage) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .context("png encode failed")?;
    Ok(bytes)
}

/// Pixel rectangle `(x, y, width, height)` for canvas-percentage bounds,
/// clamped to the image.
pub fn pixel_rect(width: u32, height: u32, bounds: &Bounds) -> Option<(u32, u32, u32, u32)> {
    if !bounds.is_valid() {
        return None;
    }
    let to_px = |pct: f64, total: u32| ((pct / 100.0) * total as f64).round().max(0.0) as u32;
    let x = to_px(bounds.left, width).min(width);
    let y = to_px(bounds.top, height).min(height);
    let right = to_px(bounds.left + bounds.width, width).min(width);
    let bottom = to_px(bounds.top + bounds.height, height).min(height);
    let (crop_w, crop_h) = (right.saturating_sub(x), bottom.saturating_sub(y));
    if crop_w == 0 || crop_h == 0 {
        return None;
    }
    Some((x, y, crop_w, crop_h))
}

pub fn crop_percent(image: &DynamicImage, bounds: &Bounds) -> Result<DynamicImage> {
    let Some((x, y, width, height)) = pixel_rect(image.width(), image.height(), bounds) else {
        bail!(
            "bounds {:?} select no pixels of a {}x{} image",
            bounds,
            image.width(),
            image.height()
        );
    };
    Ok(image.crop_imm(x, y, width, height))
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImageStats {
    pub width: u32,
    pub height: u32,
    pub brightness: f64,
    /// Most frequent quantised colours as `#rrggbb`, most common first.
    pub palette: Vec<String>,
}

pub fn image_stats(image: &DynamicImage) -> ImageStats {
    let resized = image.resize_exact(96, 96, FilterType::Triangle).to_rgb8();
    let mut total_brightness = 0f64;
    let mut bins: HashMap<(u8, u8, u8), u64> = HashMap::new();
    let mut count = 0f64;

    for pixel in resized.pixels() {
        total_brightness += (pixel[0] as f64 + pixel[1] as f64 + pixel[2] as f64) / (255.0 * 3.0);
        count += 1.0;
        let quantise = |channel: u8| ((channel as u16 / 32) * 32 + 16).min(255) as u8;
        *bins
            .entry((quantise(pixel[0]), quantise(pixel[1]), quantise(pixel[2])))
            .or_insert(0) += 1;
    }

    let mut ranked: Vec<((u8, u8, u8), u64)> = bins.into_iter().collect();
    ranked.sort_by(|left, right| right.1.cmp(&left.1).then(left.0.cmp(&right.0)));
    ImageStats {
        width: image.width(),
        height: image.height(),
        brightness: if count > 0.0 { total_brightness / count } else { 0.0 },
        palette: ranked
            .into_iter()
            .take(5)
            .map(|((r, g, b), _)| format!("#{r:02x}{g:02x}{b:02x}"))
            .collect(),
    }
}

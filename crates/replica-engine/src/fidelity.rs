//! Visual similarity between a rendered screenshot and the reference.
//!
//! score = 100 × (0.25·dHash + 0.25·aHash + 0.5·pixel), each term in 0..=1.
//! Hash terms are 1 − hamming/64 over 64-bit hashes; the pixel term is
//! 1 − mean |Δluma|/255 over a 64×64 downsample.

use image::imageops::FilterType;
use image::{DynamicImage, GrayImage};
use replica_contracts::manifest::Bounds;
use serde::Serialize;

const PIXEL_GRID: u32 = 64;
const HOTSPOT_GRID: u32 = 4;
const HOTSPOT_COUNT: usize = 4;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Hotspot {
    pub bounds: Bounds,
    /// Mean luma difference in 0..=1.
    pub delta: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FidelityReport {
    pub score: f64,
    pub dhash: f64,
    pub ahash: f64,
    pub pixel: f64,
    /// Worst regions first.
    pub hotspots: Vec<Hotspot>,
}

impl FidelityReport {
    /// Inclusive: a score equal to the target passes.
    pub fn passes(&self, target: f64) -> bool {
        self.score >= target
    }
}

pub fn compare(reference: &DynamicImage, candidate: &DynamicImage) -> FidelityReport {
    let dhash = score_hash(dhash64(reference), dhash64(candidate), 64);
    let ahash = score_hash(ahash64(reference), ahash64(candidate), 64);

    let reference_grid = luma_grid(reference, PIXEL_GRID);
    let candidate_grid = luma_grid(candidate, PIXEL_GRID);
    let mut total_delta = 0f64;
    let cell = PIXEL_GRID / HOTSPOT_GRID;
    let mut cells = vec![0f64; (HOTSPOT_GRID * HOTSPOT_GRID) as usize];
    for y in 0..PIXEL_GRID {
        for x in 0..PIXEL_GRID {
            let left = reference_grid.get_pixel(x, y)[0] as f64;
            let right = candidate_grid.get_pixel(x, y)[0] as f64;
            let delta = (left - right).abs() / 255.0;
            total_delta += delta;
            cells[((y / cell) * HOTSPOT_GRID + x / cell) as usize] += delta;
        }
    }
    let pixel = (1.0 - total_delta / (PIXEL_GRID * PIXEL_GRID) as f64).clamp(0.0, 1.0);

    let cell_area = (cell * cell) as f64;
    let span = 100.0 / HOTSPOT_GRID as f64;
    let mut hotspots: Vec<Hotspot> = cells
        .iter()
        .enumerate()
        .map(|(idx, sum)| {
            let row = idx as u32 / HOTSPOT_GRID;
            let col = idx as u32 % HOTSPOT_GRID;
            Hotspot {
                bounds: Bounds::new(row as f64 * span, col as f64 * span, span, span),
                delta: sum / cell_area,
            }
        })
        .filter(|spot| spot.delta > 0.0)
        .collect();
    hotspots.sort_by(|left, right| right.delta.total_cmp(&left.delta));
    hotspots.truncate(HOTSPOT_COUNT);

    let score = (100.0 * (0.25 * dhash + 0.25 * ahash + 0.5 * pixel)).clamp(0.0, 100.0);
    FidelityReport {
        score: (score * 100.0).round() / 100.0,
        dhash,
        ahash,
        pixel,
        hotspots,
    }
}

fn luma_grid(image: &DynamicImage, size: u32) -> GrayImage {
    image.resize_exact(size, size, FilterType::Triangle).to_luma8()
}

fn dhash64(image: &DynamicImage) -> u64 {
    let resized = image.resize_exact(9, 8, FilterType::Triangle).to_luma8();
    let mut value = 0u64;
    for y in 0..8u32 {
        for x in 0..8u32 {
            let left = resized.get_pixel(x, y)[0];
            let right = resized.get_pixel(x + 1, y)[0];
            value = (value << 1) | u64::from(left > right);
        }
    }
    value
}

fn ahash64(image: &DynamicImage) -> u64 {
    let resized = luma_grid(image, 8);
    let sum: u64 = resized.pixels().map(|pixel| pixel[0] as u64).sum();
    let avg = (sum as f64 / 64.0).clamp(0.0, 255.0);
    let mut value = 0u64;
    for y in 0..8u32 {
        for x in 0..8u32 {
            let sample = resized.get_pixel(x, y)[0] as f64;
            value = (value << 1) | u64::from(sample > avg);
        }
    }
    value
}

fn score_hash(left: u64, right: u64, bits: u32) -> f64 {
    let distance = (left ^ right).count_ones() as f64;
    (1.0 - (distance / bits as f64)).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use image::{DynamicImage, Rgb, RgbImage};

    use super::compare;

    fn split(width: u32, height: u32, left: [u8; 3], right: [u8; 3]) -> DynamicImage {
        let image = RgbImage::from_fn(width, height, |x, _| {
            if x < width / 2 {
                Rgb(left)
            } else {
                Rgb(right)
            }
        });
        DynamicImage::ImageRgb8(image)
    }

    #[test]
    fn identical_images_score_full_marks() {
        let image = split(200, 120, [255, 255, 255], [0, 0, 0]);
        let report = compare(&image, &image);
        assert_eq!(report.score, 100.0);
        assert!(report.passes(95.0));
        assert!(report.passes(100.0));
        assert!(report.hotspots.is_empty());
    }

    #[test]
    fn size_differences_do_not_matter() {
        let reference = split(400, 240, [255, 255, 255], [0, 0, 0]);
        let candidate = split(200, 120, [255, 255, 255], [0, 0, 0]);
        assert!(compare(&reference, &candidate).score > 99.0);
    }

    #[test]
    fn inverted_layout_fails_and_reports_hotspots() {
        let reference = split(200, 120, [255, 255, 255], [0, 0, 0]);
        let candidate = split(200, 120, [0, 0, 0], [255, 255, 255]);
        let report = compare(&reference, &candidate);
        assert!(report.score < 50.0, "score was {}", report.score);
        assert!(!report.passes(95.0));
        assert_eq!(report.hotspots.len(), 4);
        assert!(report.hotspots[0].delta > 0.9);
    }
}

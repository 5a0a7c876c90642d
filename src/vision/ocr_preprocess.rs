//! Image normalization ahead of text recognition
//!
//! Rescales the page so the typical detected field height matches the glyph
//! height the recognizer reads best, after sharpening and grayscale conversion.

use image::imageops::{resize, FilterType};
use image::{GrayImage, Rgb, RgbImage};
use std::collections::HashMap;
use tracing::debug;

use crate::error::{FormError, Result};
use crate::vision::preprocess::{ensure_not_empty, grayscale};
use crate::vision::Region;

/// Largest pixel count a rescaled page may have
pub const MAX_SCALED_PIXELS: u64 = 200_000_000;

/// Edge-enhancing kernel, row-major
pub const SHARPEN_KERNEL: [[i32; 3]; 3] = [[-1, -1, -1], [-1, 9, -1], [-1, -1, -1]];

/// Result of normalization
#[derive(Debug, Clone)]
pub struct Normalized {
    /// Sharpened, grayscale, rescaled image
    pub image: GrayImage,
    /// Scale applied to both dimensions
    pub ratio: f32,
}

/// Most frequent region height; ties go to the height seen first
pub fn mode_height(regions: &[Region]) -> Result<u32> {
    if regions.is_empty() {
        return Err(FormError::invalid(
            "at least one region is needed to estimate the field height",
        ));
    }

    let mut counts: HashMap<u32, usize> = HashMap::new();
    for region in regions {
        *counts.entry(region.height).or_insert(0) += 1;
    }

    let mut best = (regions[0].height, 0usize);
    for region in regions {
        let count = counts[&region.height];
        if count > best.1 {
            best = (region.height, count);
        }
    }

    Ok(best.0)
}

/// Scale mapping the typical field height onto `optimal_glyph_height`
pub fn normalization_ratio(regions: &[Region], optimal_glyph_height: u32) -> Result<f32> {
    if optimal_glyph_height == 0 {
        return Err(FormError::invalid("optimal glyph height must be positive"));
    }
    let mode = mode_height(regions)?;
    if mode == 0 {
        return Err(FormError::invalid("typical field height is zero"));
    }
    Ok(optimal_glyph_height as f32 / mode as f32)
}

/// Mirror an out-of-range coordinate back into `0..len` without repeating the edge
fn reflect_101(i: i64, len: i64) -> u32 {
    if len == 1 {
        return 0;
    }
    let mut i = i;
    if i < 0 {
        i = -i;
    }
    if i >= len {
        i = 2 * (len - 1) - i;
    }
    i.clamp(0, len - 1) as u32
}

/// Convolve each channel with [`SHARPEN_KERNEL`], reflecting at the borders
pub fn sharpen(image: &RgbImage) -> RgbImage {
    let (width, height) = image.dimensions();
    let (w, h) = (width as i64, height as i64);
    let mut result = RgbImage::new(width, height);

    for y in 0..h {
        for x in 0..w {
            let mut acc = [0i32; 3];
            for (ky, row) in SHARPEN_KERNEL.iter().enumerate() {
                for (kx, weight) in row.iter().enumerate() {
                    let sx = reflect_101(x + kx as i64 - 1, w);
                    let sy = reflect_101(y + ky as i64 - 1, h);
                    let pixel = image.get_pixel(sx, sy);
                    for c in 0..3 {
                        acc[c] += weight * pixel.0[c] as i32;
                    }
                }
            }
            let out = acc.map(|v| v.clamp(0, 255) as u8);
            result.put_pixel(x as u32, y as u32, Rgb(out));
        }
    }

    result
}

/// Output size of scaling a `width x height` image by `ratio`
///
/// Dimensions are truncated and kept at least 1. Fails when the result would
/// exceed [`MAX_SCALED_PIXELS`].
pub fn scaled_dimensions(width: u32, height: u32, ratio: f32) -> Result<(u32, u32)> {
    if !(ratio > 0.0) || !ratio.is_finite() {
        return Err(FormError::invalid(format!("invalid scale ratio {}", ratio)));
    }
    let new_width = ((width as f64 * ratio as f64) as u64).max(1);
    let new_height = ((height as f64 * ratio as f64) as u64).max(1);
    if new_width.saturating_mul(new_height) > MAX_SCALED_PIXELS {
        return Err(FormError::invalid(format!(
            "rescaling {}x{} by {} needs {}x{} pixels, above the limit of {}",
            width, height, ratio, new_width, new_height, MAX_SCALED_PIXELS
        )));
    }
    // Both sides are bounded by MAX_SCALED_PIXELS here
    Ok((new_width as u32, new_height as u32))
}

/// Scale both dimensions by `ratio` with a Lanczos filter
pub fn rescale(image: &GrayImage, ratio: f32) -> Result<GrayImage> {
    let (new_width, new_height) = scaled_dimensions(image.width(), image.height(), ratio)?;
    Ok(resize(image, new_width, new_height, FilterType::Lanczos3))
}

/// Prepares a page for the recognizer
#[derive(Debug, Clone, Copy)]
pub struct TextNormalizer {
    /// Glyph height in pixels the recognizer reads best
    pub optimal_glyph_height: u32,
}

impl Default for TextNormalizer {
    fn default() -> Self {
        Self {
            optimal_glyph_height: 40,
        }
    }
}

impl TextNormalizer {
    pub fn new(optimal_glyph_height: u32) -> Self {
        Self {
            optimal_glyph_height,
        }
    }

    /// Scale factor for the given regions
    pub fn ratio(&self, regions: &[Region]) -> Result<f32> {
        normalization_ratio(regions, self.optimal_glyph_height)
    }

    /// Sharpen, grayscale and rescale `image`
    pub fn preprocess(&self, image: &RgbImage, regions: &[Region]) -> Result<Normalized> {
        ensure_not_empty(image.width(), image.height())?;
        let ratio = self.ratio(regions)?;
        scaled_dimensions(image.width(), image.height(), ratio)?;

        let sharpened = sharpen(image);
        let gray = grayscale(&sharpened);
        let scaled = rescale(&gray, ratio)?;

        debug!(
            "Normalized {}x{} -> {}x{} (ratio {:.3})",
            image.width(),
            image.height(),
            scaled.width(),
            scaled.height(),
            ratio
        );

        Ok(Normalized {
            image: scaled,
            ratio,
        })
    }
}

//! Grayscale conversion and automatic binarization
//!
//! Produces the two-level ink/background mask the region detectors run on.

use image::{DynamicImage, GrayImage, Luma, RgbImage};
use imageproc::contrast::otsu_level;
use tracing::debug;

use crate::error::{FormError, Result};

/// Mask value for ink
pub const PIXEL_ON: u8 = 255;
/// Mask value for background
pub const PIXEL_OFF: u8 = 0;

/// Fail on zero-sized images
pub fn ensure_not_empty(width: u32, height: u32) -> Result<()> {
    if width == 0 || height == 0 {
        return Err(FormError::invalid(format!(
            "image must have positive dimensions, got {}x{}",
            width, height
        )));
    }
    Ok(())
}

/// Drop any alpha channel and widen gray inputs to three channels
pub fn to_rgb(image: &DynamicImage) -> Result<RgbImage> {
    ensure_not_empty(image.width(), image.height())?;
    Ok(image.to_rgb8())
}

/// Luminance projection (ITU-R BT.601 weights)
///
/// Integer arithmetic with rounding, so a pixel with equal channels keeps its value.
pub fn grayscale(image: &RgbImage) -> GrayImage {
    let (width, height) = image.dimensions();
    let mut gray = GrayImage::new(width, height);

    for (x, y, pixel) in image.enumerate_pixels() {
        let [r, g, b] = pixel.0;
        let luma = (299 * r as u32 + 587 * g as u32 + 114 * b as u32 + 500) / 1000;
        gray.put_pixel(x, y, Luma([luma as u8]));
    }

    gray
}

/// Global Otsu thresholding
#[derive(Debug, Clone, Copy)]
pub struct Binarizer {
    /// Make dark pixels (ink) the "on" value
    pub invert: bool,
}

impl Default for Binarizer {
    fn default() -> Self {
        Self { invert: true }
    }
}

impl Binarizer {
    pub fn new(invert: bool) -> Self {
        Self { invert }
    }

    /// Threshold a grayscale image at its Otsu level
    ///
    /// Pixels brighter than the level are background unless `invert` is false,
    /// in which case they are "on". A uniform image is all background.
    pub fn binarize(&self, gray: &GrayImage) -> Result<GrayImage> {
        ensure_not_empty(gray.width(), gray.height())?;

        let first = gray.as_raw()[0];
        if gray.as_raw().iter().all(|&v| v == first) {
            debug!("Uniform image, nothing to threshold");
            return Ok(GrayImage::from_pixel(gray.width(), gray.height(), Luma([PIXEL_OFF])));
        }

        let level = otsu_level(gray);
        debug!("Otsu threshold level: {}", level);

        let (above, below) = if self.invert {
            (PIXEL_OFF, PIXEL_ON)
        } else {
            (PIXEL_ON, PIXEL_OFF)
        };

        let mut mask = GrayImage::new(gray.width(), gray.height());
        for (x, y, pixel) in gray.enumerate_pixels() {
            let value = if pixel.0[0] > level { above } else { below };
            mask.put_pixel(x, y, Luma([value]));
        }

        Ok(mask)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn count_on(mask: &GrayImage) -> usize {
        mask.pixels().filter(|p| p.0[0] == PIXEL_ON).count()
    }

    #[test]
    fn test_grayscale_weights() {
        let mut img = RgbImage::new(2, 1);
        img.put_pixel(0, 0, Rgb([255, 0, 0]));
        img.put_pixel(1, 0, Rgb([0, 255, 0]));

        let gray = grayscale(&img);
        // 0.299 * 255 = 76.2, 0.587 * 255 = 149.7
        assert_eq!(gray.get_pixel(0, 0).0[0], 76);
        assert_eq!(gray.get_pixel(1, 0).0[0], 150);
    }

    #[test]
    fn test_grayscale_is_stable_on_gray_input() {
        let gray = GrayImage::from_fn(16, 16, |x, y| Luma([(x * 16 + y) as u8]));
        let rgb = DynamicImage::ImageLuma8(gray.clone()).to_rgb8();

        let once = grayscale(&rgb);
        assert_eq!(once, gray);

        let twice = grayscale(&DynamicImage::ImageLuma8(once.clone()).to_rgb8());
        assert_eq!(twice, once);
    }

    #[test]
    fn test_binarize_inverted_marks_ink_on() {
        let gray = GrayImage::from_fn(10, 10, |x, _| {
            if x < 3 { Luma([20]) } else { Luma([230]) }
        });

        let mask = Binarizer::new(true).binarize(&gray).unwrap();
        assert_eq!(mask.get_pixel(0, 0).0[0], PIXEL_ON);
        assert_eq!(mask.get_pixel(9, 9).0[0], PIXEL_OFF);
        assert_eq!(count_on(&mask), 30);
    }

    #[test]
    fn test_binarize_output_is_two_valued() {
        let gray = GrayImage::from_fn(32, 32, |x, y| Luma([((x * 7 + y * 3) % 256) as u8]));
        let mask = Binarizer::new(false).binarize(&gray).unwrap();

        assert!(mask.pixels().all(|p| p.0[0] == PIXEL_ON || p.0[0] == PIXEL_OFF));
    }

    #[test]
    fn test_binarize_is_idempotent() {
        let gray = GrayImage::from_fn(20, 20, |x, y| {
            if (x / 5 + y / 5) % 2 == 0 { Luma([40]) } else { Luma([200]) }
        });
        let binarizer = Binarizer::new(false);

        let once = binarizer.binarize(&gray).unwrap();
        let twice = binarizer.binarize(&once).unwrap();

        assert_eq!(count_on(&once), count_on(&twice));
        assert_eq!(once, twice);
    }

    #[test]
    fn test_uniform_image_is_background() {
        for value in [0u8, 128, 255] {
            let gray = GrayImage::from_pixel(6, 6, Luma([value]));
            for invert in [true, false] {
                let mask = Binarizer::new(invert).binarize(&gray).unwrap();
                assert_eq!(count_on(&mask), 0);
            }
        }
    }

    #[test]
    fn test_empty_image_rejected() {
        let gray = GrayImage::new(0, 5);
        let result = Binarizer::default().binarize(&gray);
        assert!(matches!(result, Err(FormError::InvalidInput(_))));

        let result = to_rgb(&DynamicImage::new_rgb8(4, 0));
        assert!(matches!(result, Err(FormError::InvalidInput(_))));
    }
}

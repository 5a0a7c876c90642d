//! Field region detection
//!
//! Two interchangeable strategies over a binary ink mask:
//! - connected-component labelling, favouring isolated filled boxes on clean scans
//! - dilation plus outer-contour tracing, favouring thin unfilled field lines
//!   and checkboxes on noisier scans
//!
//! Both sit behind [`RegionDetector`] so callers do not care which one runs.

use image::{GrayImage, Luma, Rgb, RgbImage};
use imageproc::contours::{find_contours, BorderType};
use imageproc::distance_transform::Norm;
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::morphology::dilate;
use imageproc::rect::Rect;
use imageproc::region_labelling::{connected_components, Connectivity};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::debug;

use crate::error::{FormError, Result};
use crate::vision::preprocess::{ensure_not_empty, PIXEL_OFF};
use crate::vision::{Region, RegionKind};

/// Outline colour for field regions
pub const FIELD_COLOUR: Rgb<u8> = Rgb([255, 0, 255]);
/// Outline colour for checkbox regions
pub const CHECKBOX_COLOUR: Rgb<u8> = Rgb([0, 200, 0]);

/// Capability shared by all detection strategies
pub trait RegionDetector {
    /// Find candidate field regions in a binary mask (ink = non-zero)
    fn detect(&self, mask: &GrayImage) -> Result<Vec<Region>>;
}

/// Strategy selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum DetectionStrategy {
    /// 4-connected component labelling
    #[default]
    ConnectedComponents,
    /// Dilation and outer contour tracing
    Contour,
}

/// Labels 4-connected blobs and keeps those above a pixel area
#[derive(Debug, Clone, Copy)]
pub struct ConnectedComponentStrategy {
    /// Components must be strictly larger than this many pixels
    pub min_area: u32,
}

/// Per-label accumulator
#[derive(Debug, Clone, Copy)]
struct ComponentStats {
    min_x: u32,
    min_y: u32,
    max_x: u32,
    max_y: u32,
    area: u32,
}

impl ComponentStats {
    fn new(x: u32, y: u32) -> Self {
        Self {
            min_x: x,
            min_y: y,
            max_x: x,
            max_y: y,
            area: 0,
        }
    }

    fn add(&mut self, x: u32, y: u32) {
        self.min_x = self.min_x.min(x);
        self.min_y = self.min_y.min(y);
        self.max_x = self.max_x.max(x);
        self.max_y = self.max_y.max(y);
        self.area += 1;
    }
}

impl RegionDetector for ConnectedComponentStrategy {
    fn detect(&self, mask: &GrayImage) -> Result<Vec<Region>> {
        ensure_not_empty(mask.width(), mask.height())?;
        let start = Instant::now();

        let labels = connected_components(mask, Connectivity::Four, Luma([PIXEL_OFF]));

        // Index 0 is the background label
        let mut stats: Vec<Option<ComponentStats>> = Vec::new();
        for (x, y, label) in labels.enumerate_pixels() {
            let label = label.0[0] as usize;
            if label == 0 {
                continue;
            }
            if stats.len() <= label {
                stats.resize(label + 1, None);
            }
            stats[label]
                .get_or_insert_with(|| ComponentStats::new(x, y))
                .add(x, y);
        }

        let regions: Vec<Region> = stats
            .iter()
            .flatten()
            .filter(|s| s.area > self.min_area)
            .map(|s| {
                Region::new(s.min_x, s.min_y, s.max_x - s.min_x + 1, s.max_y - s.min_y + 1)
            })
            .collect();

        debug!(
            "Connected components: {} labels, {} regions above area {} in {:?}",
            stats.iter().flatten().count(),
            regions.len(),
            self.min_area,
            start.elapsed()
        );

        Ok(regions)
    }
}

/// Shape thresholds for contour classification
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContourParams {
    /// Bounding rectangles with `w * h` below this are discarded
    pub noise_area: u32,
    /// Maximum `|w - h|` for a checkbox
    pub checkbox_tolerance: u32,
    /// Field lines need `w > h` and `w / h` below this ratio
    pub rectangle_ratio: f32,
}

impl Default for ContourParams {
    fn default() -> Self {
        Self {
            noise_area: 100,
            checkbox_tolerance: 5,
            rectangle_ratio: 10.0,
        }
    }
}

/// Classify a bounding rectangle, or `None` if it matches neither shape
pub fn classify(width: u32, height: u32, params: &ContourParams) -> Option<RegionKind> {
    if (width as u64) * (height as u64) < params.noise_area as u64 || height == 0 {
        return None;
    }
    if width.abs_diff(height) <= params.checkbox_tolerance {
        return Some(RegionKind::Checkbox);
    }
    if width > height && (width as f32 / height as f32) < params.rectangle_ratio {
        return Some(RegionKind::Field);
    }
    None
}

/// Dilates the mask, traces outer contours and classifies their bounding boxes
#[derive(Debug, Clone, Copy, Default)]
pub struct ContourStrategy {
    pub params: ContourParams,
}

impl RegionDetector for ContourStrategy {
    fn detect(&self, mask: &GrayImage) -> Result<Vec<Region>> {
        ensure_not_empty(mask.width(), mask.height())?;
        if !(self.params.rectangle_ratio > 0.0) {
            return Err(FormError::invalid("rectangle_ratio must be positive"));
        }
        let start = Instant::now();

        // 3x3 square structuring element
        let dilated = dilate(mask, Norm::LInf, 1);
        let contours = find_contours::<u32>(&dilated);

        let mut traced = 0usize;
        let mut regions = Vec::new();
        for contour in contours
            .iter()
            .filter(|c| c.border_type == BorderType::Outer && c.parent.is_none())
        {
            traced += 1;
            let Some(first) = contour.points.first() else {
                continue;
            };
            let (mut min_x, mut min_y, mut max_x, mut max_y) = (first.x, first.y, first.x, first.y);
            for p in &contour.points {
                min_x = min_x.min(p.x);
                min_y = min_y.min(p.y);
                max_x = max_x.max(p.x);
                max_y = max_y.max(p.y);
            }

            let width = max_x - min_x + 1;
            let height = max_y - min_y + 1;
            if let Some(kind) = classify(width, height, &self.params) {
                regions.push(Region::new(min_x, min_y, width, height).with_kind(kind));
            }
        }

        debug!(
            "Contour detection: {} outer contours, {} classified regions in {:?}",
            traced,
            regions.len(),
            start.elapsed()
        );

        Ok(regions)
    }
}

/// A configured strategy
#[derive(Debug, Clone, Copy)]
pub enum Detector {
    ConnectedComponents(ConnectedComponentStrategy),
    Contour(ContourStrategy),
}

impl Detector {
    pub fn new(strategy: DetectionStrategy, min_area: u32, params: ContourParams) -> Self {
        match strategy {
            DetectionStrategy::ConnectedComponents => {
                Self::ConnectedComponents(ConnectedComponentStrategy { min_area })
            }
            DetectionStrategy::Contour => Self::Contour(ContourStrategy { params }),
        }
    }
}

impl RegionDetector for Detector {
    fn detect(&self, mask: &GrayImage) -> Result<Vec<Region>> {
        match self {
            Self::ConnectedComponents(s) => s.detect(mask),
            Self::Contour(s) => s.detect(mask),
        }
    }
}

/// Outline colour used for a region kind
pub fn region_colour(kind: RegionKind) -> Rgb<u8> {
    match kind {
        RegionKind::Field => FIELD_COLOUR,
        RegionKind::Checkbox => CHECKBOX_COLOUR,
    }
}

/// Copy of `image` with every region outlined, `thickness` pixels wide
pub fn annotate_regions(image: &RgbImage, regions: &[Region], thickness: u32) -> RgbImage {
    let mut annotated = image.clone();

    for region in regions {
        let colour = region_colour(region.kind());
        for i in 0..thickness.max(1) {
            let rect = Rect::at(region.left as i32 - i as i32, region.top as i32 - i as i32)
                .of_size(region.width + 2 * i, region.height + 2 * i);
            draw_hollow_rect_mut(&mut annotated, rect, colour);
        }
    }

    annotated
}

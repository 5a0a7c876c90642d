//! Vision Layer
//!
//! Locates blank answer fields on a form image and binds recognized text to them.
//! Processing runs in two branches that meet at association:
//! - segmentation: colour clustering, binarization, region detection
//! - text: normalization, external recognition, filtering, grouping

pub mod association;
pub mod cluster;
pub mod detection;
pub mod ocr;
pub mod ocr_preprocess;
pub mod preprocess;
pub mod tokens;

use image::{DynamicImage, GrayImage, RgbImage};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::error::Result;

pub use association::{Association, FieldAssociator, SpanMode, TextSpan};
pub use cluster::ColorSimplifier;
pub use detection::{
    annotate_regions, ConnectedComponentStrategy, ContourParams, ContourStrategy,
    DetectionStrategy, Detector, RegionDetector,
};
pub use ocr::{CachedRecognizer, StaticTokens, TesseractCli, TextRecognizer, Token};
pub use ocr_preprocess::{Normalized, TextNormalizer};
pub use preprocess::Binarizer;
pub use tokens::{EnvelopePolicy, TextLine, TokenFilter, TokenGrouper};

/// Outline thickness used for annotated copies
const ANNOTATION_THICKNESS: u32 = 3;

/// Shape class assigned by the contour strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegionKind {
    /// Wide answer field or line
    Field,
    /// Near-square tick box
    Checkbox,
}

/// Axis-aligned candidate field in pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub left: u32,
    pub top: u32,
    pub width: u32,
    pub height: u32,
    /// Set by the contour strategy; untyped regions count as fields
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<RegionKind>,
}

impl Region {
    pub fn new(left: u32, top: u32, width: u32, height: u32) -> Self {
        Self {
            left,
            top,
            width,
            height,
            kind: None,
        }
    }

    pub fn with_kind(mut self, kind: RegionKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn right(&self) -> u32 {
        self.left.saturating_add(self.width)
    }

    pub fn bottom(&self) -> u32 {
        self.top.saturating_add(self.height)
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Kind, treating untyped regions as fields
    pub fn kind(&self) -> RegionKind {
        self.kind.unwrap_or(RegionKind::Field)
    }
}

/// Every intermediate image of the segmentation branch
#[derive(Debug, Clone)]
pub struct Segmentation {
    /// Input without alpha
    pub rgb: RgbImage,
    /// Colour-clustered image
    pub simplified: RgbImage,
    pub gray: GrayImage,
    /// Ink mask
    pub binary: GrayImage,
    /// Input with regions outlined
    pub annotated: RgbImage,
    pub regions: Vec<Region>,
}

/// Output of a full extraction pass
#[derive(Debug, Clone)]
pub struct FieldExtraction {
    pub segmentation: Segmentation,
    pub normalized: Normalized,
    /// Recognized text grouped by block, after confidence filtering
    pub lines: Vec<TextLine>,
    pub associations: Vec<Association>,
    pub processing_time_ms: u64,
}

/// Form field extraction pipeline
pub struct FormPipeline {
    config: AppConfig,
}

impl FormPipeline {
    /// Create a pipeline, rejecting invalid settings
    pub fn new(config: AppConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    fn simplifier(&self) -> ColorSimplifier {
        let seg = &self.config.segmentation;
        ColorSimplifier::new(seg.colour_clusters)
            .with_seed(seg.seed)
            .with_max_samples(seg.max_samples)
            .with_max_iterations(seg.max_iterations)
    }

    fn detector(&self) -> Detector {
        let seg = &self.config.segmentation;
        Detector::new(seg.strategy, seg.min_area, self.config.contour.params())
    }

    /// Run the segmentation branch
    pub fn segment(&self, image: &DynamicImage) -> Result<Segmentation> {
        let start = Instant::now();

        let rgb = preprocess::to_rgb(image)?;
        let simplified = self.simplifier().simplify(&rgb)?;
        let gray = preprocess::grayscale(&simplified);
        let binary = Binarizer::new(self.config.segmentation.invert).binarize(&gray)?;
        let regions = self.detector().detect(&binary)?;
        let annotated = annotate_regions(&rgb, &regions, ANNOTATION_THICKNESS);

        info!(
            "Segmentation ({:?}) found {} regions in {:?}",
            self.config.segmentation.strategy,
            regions.len(),
            start.elapsed()
        );

        Ok(Segmentation {
            rgb,
            simplified,
            gray,
            binary,
            annotated,
            regions,
        })
    }

    /// Prepare the page for the recognizer
    pub fn normalize(&self, image: &DynamicImage, regions: &[Region]) -> Result<Normalized> {
        let rgb = preprocess::to_rgb(image)?;
        TextNormalizer::new(self.config.text.optimal_glyph_height).preprocess(&rgb, regions)
    }

    /// Run segmentation, recognition and association end to end
    pub fn extract_fields(
        &self,
        image: &DynamicImage,
        recognizer: &dyn TextRecognizer,
    ) -> Result<FieldExtraction> {
        let start = Instant::now();

        let segmentation = self.segment(image)?;
        if segmentation.regions.is_empty() {
            warn!("No field regions detected; normalization needs at least one");
        }
        let normalized = self.normalize(image, &segmentation.regions)?;

        let tokens = recognizer.recognize(&normalized.image)?;
        debug!("Recognizer returned {} tokens", tokens.len());

        let kept = TokenFilter::new(self.config.text.min_confidence).filter(tokens);
        let lines = TokenGrouper::new(self.config.text.envelope).group(&kept);

        let associator =
            FieldAssociator::new(self.config.text.field_distance).with_scale(normalized.ratio);
        let associations = match self.config.text.spans {
            SpanMode::Lines => associator.associate(&lines, &segmentation.regions)?,
            SpanMode::Tokens => associator.associate(&kept, &segmentation.regions)?,
        };

        let processing_time = start.elapsed();
        info!(
            "Extracted {} labelled fields from {} lines in {:?}",
            associations.len(),
            lines.len(),
            processing_time
        );

        Ok(FieldExtraction {
            segmentation,
            normalized,
            lines,
            associations,
            processing_time_ms: processing_time.as_millis() as u64,
        })
    }
}

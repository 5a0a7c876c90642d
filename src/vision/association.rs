//! Greedy nearest-neighbour binding of text spans to field regions
//!
//! Each span's anchor is its bottom-right corner; each region's is its
//! top-left corner, projected into the span coordinate space by the
//! normalization ratio. Spans are visited in order and claim the nearest
//! unclaimed region within the distance cutoff.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{FormError, Result};
use crate::vision::ocr::Token;
use crate::vision::tokens::TextLine;
use crate::vision::Region;

/// Anything with text and an anchor point that can label a field
pub trait TextSpan {
    fn text(&self) -> &str;
    /// Anchor point in normalized-image coordinates
    fn anchor(&self) -> (f32, f32);
    fn confidence(&self) -> Option<f32>;
}

impl TextSpan for Token {
    fn text(&self) -> &str {
        &self.text
    }

    fn anchor(&self) -> (f32, f32) {
        (self.right() as f32, self.bottom() as f32)
    }

    fn confidence(&self) -> Option<f32> {
        self.confidence
    }
}

impl TextSpan for TextLine {
    fn text(&self) -> &str {
        &self.text
    }

    fn anchor(&self) -> (f32, f32) {
        (self.right as f32, self.bottom as f32)
    }

    fn confidence(&self) -> Option<f32> {
        self.confidence
    }
}

/// Which spans are matched against regions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum SpanMode {
    /// Tokens grouped by block
    #[default]
    Lines,
    /// Individual recognizer tokens
    Tokens,
}

/// A matched (region, text) pair
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Association {
    pub region: Region,
    /// Index of the region in the input list
    pub region_index: usize,
    /// Index of the span in the input list
    pub span_index: usize,
    pub text: String,
    pub confidence: Option<f32>,
    /// Distance between the anchors that produced the match
    pub distance: f32,
}

fn euclidean(a: (f32, f32), b: (f32, f32)) -> f32 {
    ((a.0 - b.0).powi(2) + (a.1 - b.1).powi(2)).sqrt()
}

/// Greedy one-to-one matcher
#[derive(Debug, Clone, Copy)]
pub struct FieldAssociator {
    /// Largest accepted anchor distance, inclusive
    pub max_distance: f32,
    /// Factor taking region coordinates into span coordinates
    pub scale: f32,
}

impl FieldAssociator {
    pub fn new(max_distance: f32) -> Self {
        Self {
            max_distance,
            scale: 1.0,
        }
    }

    /// Regions were detected on an image that spans see scaled by `ratio`
    pub fn with_scale(mut self, ratio: f32) -> Self {
        self.scale = ratio;
        self
    }

    /// Bind spans to regions, each side at most once
    ///
    /// Ties go to the region listed first. Blank spans are skipped; spans
    /// with no free region within range are left out of the result.
    pub fn associate<S: TextSpan>(&self, spans: &[S], regions: &[Region]) -> Result<Vec<Association>> {
        if !(self.max_distance >= 0.0) {
            return Err(FormError::invalid("maximum association distance must not be negative"));
        }
        if !(self.scale > 0.0) || !self.scale.is_finite() {
            return Err(FormError::invalid(format!("invalid region scale {}", self.scale)));
        }

        let corners: Vec<(f32, f32)> = regions
            .iter()
            .map(|r| (r.left as f32 * self.scale, r.top as f32 * self.scale))
            .collect();
        let mut taken = vec![false; regions.len()];
        let mut associations = Vec::new();

        for (span_index, span) in spans.iter().enumerate() {
            if span.text().trim().is_empty() {
                continue;
            }
            let anchor = span.anchor();

            let mut nearest: Option<(usize, f32)> = None;
            for (i, corner) in corners.iter().enumerate() {
                if taken[i] {
                    continue;
                }
                let distance = euclidean(anchor, *corner);
                if nearest.map_or(true, |(_, best)| distance < best) {
                    nearest = Some((i, distance));
                }
            }

            match nearest {
                Some((region_index, distance)) if distance <= self.max_distance => {
                    taken[region_index] = true;
                    associations.push(Association {
                        region: regions[region_index],
                        region_index,
                        span_index,
                        text: span.text().to_string(),
                        confidence: span.confidence(),
                        distance,
                    });
                }
                _ => {}
            }
        }

        debug!(
            "Associated {} of {} spans with {} regions (max distance {})",
            associations.len(),
            spans.len(),
            regions.len(),
            self.max_distance
        );

        Ok(associations)
    }
}

//! Application Configuration
//!
//! Operator-tunable thresholds stored in TOML format.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{FormError, Result};
use crate::vision::association::SpanMode;
use crate::vision::detection::{ContourParams, DetectionStrategy};
use crate::vision::tokens::EnvelopePolicy;

/// Application settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Colour clustering, binarization and region detection
    pub segmentation: SegmentationSettings,
    /// Contour strategy thresholds
    pub contour: ContourSettings,
    /// Text normalization and field association
    pub text: TextSettings,
    /// External recognizer invocation
    pub recognizer: RecognizerSettings,
}

/// Segmentation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentationSettings {
    /// Number of colour clusters used to simplify the image
    pub colour_clusters: usize,
    /// Connected components must be strictly larger than this many pixels
    pub min_area: u32,
    /// Make ink the "on" value of the binary mask
    pub invert: bool,
    /// Region detection strategy
    pub strategy: DetectionStrategy,
    /// Seed for clustering initialisation (random when unset)
    pub seed: Option<u64>,
    /// Maximum k-means iterations
    pub max_iterations: usize,
    /// Cap on pixels sampled to fit the clusters
    pub max_samples: Option<usize>,
}

impl Default for SegmentationSettings {
    fn default() -> Self {
        Self {
            colour_clusters: 2,
            min_area: 30,
            invert: true,
            strategy: DetectionStrategy::ConnectedComponents,
            seed: None,
            max_iterations: 100,
            max_samples: Some(20_000),
        }
    }
}

/// Contour strategy settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContourSettings {
    /// Bounding rectangles smaller than this area are noise
    pub noise_area: u32,
    /// Maximum |width - height| for a checkbox
    pub checkbox_tolerance: u32,
    /// Field lines must have width/height below this ratio
    pub rectangle_ratio: f32,
}

impl Default for ContourSettings {
    fn default() -> Self {
        Self {
            noise_area: 100,
            checkbox_tolerance: 5,
            rectangle_ratio: 10.0,
        }
    }
}

impl ContourSettings {
    pub fn params(&self) -> ContourParams {
        ContourParams {
            noise_area: self.noise_area,
            checkbox_tolerance: self.checkbox_tolerance,
            rectangle_ratio: self.rectangle_ratio,
        }
    }
}

/// Text settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TextSettings {
    /// Glyph height in pixels the recognizer reads best
    pub optimal_glyph_height: u32,
    /// Tokens below this confidence (0 - 100) are dropped
    pub min_confidence: f32,
    /// Maximum distance between a text anchor and a field corner
    pub field_distance: f32,
    /// How text line bounding envelopes are accumulated
    pub envelope: EnvelopePolicy,
    /// Whether to associate grouped lines or raw tokens
    pub spans: SpanMode,
}

impl Default for TextSettings {
    fn default() -> Self {
        Self {
            optimal_glyph_height: 40,
            min_confidence: 0.0,
            field_distance: 200.0,
            envelope: EnvelopePolicy::Geometric,
            spans: SpanMode::Lines,
        }
    }
}

/// Recognizer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecognizerSettings {
    /// Tesseract executable name or path
    pub command: String,
    /// Language passed with `-l`
    pub language: Option<String>,
    /// Page segmentation mode passed with `--psm`
    pub page_segmentation_mode: Option<u8>,
}

impl Default for RecognizerSettings {
    fn default() -> Self {
        Self {
            command: "tesseract".to_string(),
            language: None,
            page_segmentation_mode: None,
        }
    }
}

impl AppConfig {
    /// Reject parameter combinations the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.segmentation.colour_clusters < 1 {
            return Err(FormError::invalid("colour_clusters must be at least 1"));
        }
        if self.segmentation.max_iterations == 0 {
            return Err(FormError::invalid("max_iterations must be at least 1"));
        }
        if self.segmentation.max_samples == Some(0) {
            return Err(FormError::invalid("max_samples must be positive when set"));
        }
        if !(self.contour.rectangle_ratio > 0.0) {
            return Err(FormError::invalid("rectangle_ratio must be positive"));
        }
        if self.text.optimal_glyph_height == 0 {
            return Err(FormError::invalid("optimal_glyph_height must be positive"));
        }
        if !(self.text.min_confidence >= 0.0) {
            return Err(FormError::invalid("min_confidence must not be negative"));
        }
        if !(self.text.field_distance >= 0.0) {
            return Err(FormError::invalid("field_distance must not be negative"));
        }
        Ok(())
    }
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path)?;
    let config: AppConfig =
        toml::from_str(&content).map_err(|e| FormError::Config(e.to_string()))?;
    Ok(config)
}

/// Save configuration to file
pub fn save_config(config: &AppConfig, path: &Path) -> Result<()> {
    let content =
        toml::to_string_pretty(config).map_err(|e| FormError::Config(e.to_string()))?;
    std::fs::write(path, content)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_app_config() {
        let config = AppConfig::default();

        assert_eq!(config.segmentation.colour_clusters, 2);
        assert_eq!(config.segmentation.min_area, 30);
        assert!(config.segmentation.invert);
        assert_eq!(config.segmentation.strategy, DetectionStrategy::ConnectedComponents);

        assert_eq!(config.contour.noise_area, 100);
        assert_eq!(config.contour.checkbox_tolerance, 5);

        assert_eq!(config.text.optimal_glyph_height, 40);
        assert!((config.text.field_distance - 200.0).abs() < 0.01);
        assert_eq!(config.text.envelope, EnvelopePolicy::Geometric);

        assert_eq!(config.recognizer.command, "tesseract");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serialization_roundtrip() {
        let mut config = AppConfig::default();
        config.segmentation.strategy = DetectionStrategy::Contour;
        config.segmentation.seed = Some(7);
        config.text.envelope = EnvelopePolicy::Legacy;

        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: AppConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(parsed.segmentation.strategy, DetectionStrategy::Contour);
        assert_eq!(parsed.segmentation.seed, Some(7));
        assert_eq!(parsed.text.envelope, EnvelopePolicy::Legacy);
        assert_eq!(parsed.contour.checkbox_tolerance, config.contour.checkbox_tolerance);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let parsed: AppConfig = toml::from_str(
            "[segmentation]\ncolour_clusters = 4\nstrategy = \"contour\"\n",
        )
        .unwrap();

        assert_eq!(parsed.segmentation.colour_clusters, 4);
        assert_eq!(parsed.segmentation.strategy, DetectionStrategy::Contour);
        assert_eq!(parsed.segmentation.min_area, 30);
        assert_eq!(parsed.text.optimal_glyph_height, 40);
    }

    #[test]
    fn test_validate_rejects_bad_ranges() {
        let mut config = AppConfig::default();
        config.segmentation.colour_clusters = 0;
        assert!(matches!(config.validate(), Err(FormError::InvalidInput(_))));

        let mut config = AppConfig::default();
        config.text.field_distance = -1.0;
        assert!(matches!(config.validate(), Err(FormError::InvalidInput(_))));

        let mut config = AppConfig::default();
        config.text.optimal_glyph_height = 0;
        assert!(matches!(config.validate(), Err(FormError::InvalidInput(_))));
    }

    #[test]
    fn test_save_and_load_config() {
        let mut config = AppConfig::default();
        config.text.min_confidence = 60.0;

        let temp_file = NamedTempFile::new().unwrap();
        save_config(&config, temp_file.path()).unwrap();
        let loaded = load_config(temp_file.path()).unwrap();

        assert!((loaded.text.min_confidence - 60.0).abs() < 0.01);
        assert_eq!(loaded.segmentation.colour_clusters, config.segmentation.colour_clusters);
    }

    #[test]
    fn test_load_config_file_not_found() {
        let result = load_config(Path::new("/nonexistent/path/config.toml"));
        assert!(matches!(result, Err(FormError::Io(_))));
    }

    #[test]
    fn test_load_config_invalid_toml() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(temp_file, "this is not valid toml {{{{").unwrap();

        let result = load_config(temp_file.path());
        assert!(matches!(result, Err(FormError::Config(_))));
    }
}

//! FormField command line front end
//!
//! Runs the extraction pipeline on one image and prints the labelled fields as JSON.

use anyhow::{Context, Result};
use clap::Parser;
use image::DynamicImage;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use formfield::config::{load_config, AppConfig};
use formfield::storage::default_config_path;
use formfield::vision::{
    Association, CachedRecognizer, DetectionStrategy, SpanMode, StaticTokens, TesseractCli,
    TextLine, TextRecognizer,
};
use formfield::{FormPipeline, Region, Segmentation};

/// FormField - detect form fields and match them with their labels
#[derive(Parser, Debug)]
#[command(name = "formfield")]
#[command(about = "Detects blank fields on a form image and associates text labels with them")]
struct Args {
    /// Form image to process
    image: PathBuf,

    /// Configuration file (defaults to the per-user config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Pre-computed recognizer tokens as a JSON array, used instead of tesseract
    #[arg(long)]
    tokens: Option<PathBuf>,

    /// Region detection strategy
    #[arg(long, value_enum)]
    strategy: Option<DetectionStrategy>,

    /// Number of colour clusters
    #[arg(short = 'k', long)]
    k_colours: Option<usize>,

    /// Connected components must be larger than this many pixels
    #[arg(long)]
    min_area: Option<u32>,

    /// Minimum recognizer confidence (0 - 100)
    #[arg(long)]
    confidence: Option<f32>,

    /// Glyph height in pixels the recognizer reads best
    #[arg(long)]
    character_pixels: Option<u32>,

    /// Maximum distance between a label and its field
    #[arg(long)]
    field_distance: Option<f32>,

    /// Associate raw tokens or grouped lines
    #[arg(long, value_enum)]
    spans: Option<SpanMode>,

    /// Seed for reproducible colour clustering
    #[arg(long)]
    seed: Option<u64>,

    /// Write the image with detected regions outlined
    #[arg(long)]
    annotate: Option<PathBuf>,

    /// Write every intermediate image into this directory
    #[arg(long)]
    stages: Option<PathBuf>,

    /// Only detect regions, skip recognition and association
    #[arg(long)]
    regions_only: bool,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

/// One labelled field in the output
#[derive(Serialize)]
struct FieldRecord {
    extracted_block_type: &'static str,
    value: String,
    data_type: &'static str,
    cluster: Option<u32>,
    confidence: Option<f32>,
    region: Region,
}

impl From<&Association> for FieldRecord {
    fn from(association: &Association) -> Self {
        Self {
            extracted_block_type: "field",
            value: association.text.clone(),
            data_type: "string",
            cluster: None,
            confidence: association.confidence,
            region: association.region,
        }
    }
}

#[derive(Serialize)]
struct Report<'a> {
    regions: &'a [Region],
    #[serde(skip_serializing_if = "Option::is_none")]
    ratio: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    lines: Option<&'a [TextLine]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    fields: Option<Vec<FieldRecord>>,
}

fn init_logging(verbose: bool) -> Result<()> {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install logger: {}", e))?;
    Ok(())
}

fn resolve_config(args: &Args) -> Result<AppConfig> {
    let mut config = match &args.config {
        Some(path) => load_config(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => match default_config_path() {
            Ok(path) if path.exists() => load_config(&path)
                .with_context(|| format!("Failed to load config from {}", path.display()))?,
            Ok(_) => AppConfig::default(),
            Err(e) => {
                warn!("No config directory available, using defaults: {}", e);
                AppConfig::default()
            }
        },
    };

    if let Some(strategy) = args.strategy {
        config.segmentation.strategy = strategy;
    }
    if let Some(k) = args.k_colours {
        config.segmentation.colour_clusters = k;
    }
    if let Some(min_area) = args.min_area {
        config.segmentation.min_area = min_area;
    }
    if let Some(seed) = args.seed {
        config.segmentation.seed = Some(seed);
    }
    if let Some(confidence) = args.confidence {
        config.text.min_confidence = confidence;
    }
    if let Some(pixels) = args.character_pixels {
        config.text.optimal_glyph_height = pixels;
    }
    if let Some(distance) = args.field_distance {
        config.text.field_distance = distance;
    }
    if let Some(spans) = args.spans {
        config.text.spans = spans;
    }

    Ok(config)
}

fn build_recognizer(args: &Args, config: &AppConfig) -> Result<Box<dyn TextRecognizer>> {
    if let Some(path) = &args.tokens {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read tokens from {}", path.display()))?;
        let tokens = StaticTokens::from_json(&json)
            .with_context(|| format!("Failed to parse tokens in {}", path.display()))?;
        info!("Using {} pre-computed tokens", tokens.0.len());
        return Ok(Box::new(tokens));
    }

    let tesseract = TesseractCli {
        command: config.recognizer.command.clone(),
        language: config.recognizer.language.clone(),
        page_segmentation_mode: config.recognizer.page_segmentation_mode,
    };
    Ok(Box::new(CachedRecognizer::new(tesseract)))
}

fn write_stages(dir: &Path, segmentation: &Segmentation) -> Result<()> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create {}", dir.display()))?;

    let save = |name: &str, image: DynamicImage| -> Result<()> {
        let path = dir.join(name);
        image
            .save(&path)
            .with_context(|| format!("Failed to write {}", path.display()))
    };

    save("clustered.png", DynamicImage::ImageRgb8(segmentation.simplified.clone()))?;
    save("gray.png", DynamicImage::ImageLuma8(segmentation.gray.clone()))?;
    save("binary.png", DynamicImage::ImageLuma8(segmentation.binary.clone()))?;
    save("annotated.png", DynamicImage::ImageRgb8(segmentation.annotated.clone()))?;
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose)?;

    let config = resolve_config(&args)?;
    let pipeline = FormPipeline::new(config).context("Invalid configuration")?;

    let image = image::open(&args.image)
        .with_context(|| format!("Failed to open image {}", args.image.display()))?;
    info!(
        "Processing {} ({}x{})",
        args.image.display(),
        image.width(),
        image.height()
    );

    let report_json = if args.regions_only {
        let segmentation = pipeline.segment(&image)?;
        if let Some(dir) = &args.stages {
            write_stages(dir, &segmentation)?;
        }
        if let Some(path) = &args.annotate {
            segmentation
                .annotated
                .save(path)
                .with_context(|| format!("Failed to write {}", path.display()))?;
        }

        serde_json::to_string_pretty(&Report {
            regions: &segmentation.regions,
            ratio: None,
            lines: None,
            fields: None,
        })?
    } else {
        let recognizer = build_recognizer(&args, pipeline.config())?;
        let extraction = pipeline.extract_fields(&image, recognizer.as_ref())?;

        if let Some(dir) = &args.stages {
            write_stages(dir, &extraction.segmentation)?;
            let path = dir.join("normalized.png");
            extraction
                .normalized
                .image
                .save(&path)
                .with_context(|| format!("Failed to write {}", path.display()))?;
        }
        if let Some(path) = &args.annotate {
            extraction
                .segmentation
                .annotated
                .save(path)
                .with_context(|| format!("Failed to write {}", path.display()))?;
        }

        serde_json::to_string_pretty(&Report {
            regions: &extraction.segmentation.regions,
            ratio: Some(extraction.normalized.ratio),
            lines: Some(&extraction.lines),
            fields: Some(extraction.associations.iter().map(FieldRecord::from).collect()),
        })?
    };

    println!("{}", report_json);
    Ok(())
}

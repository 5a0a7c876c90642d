//! FormField - locate blank fields on scanned forms and label them
//!
//! Segments a form image into candidate answer regions, normalizes the page
//! for an external text recognizer, and binds each recognized label to the
//! nearest free field.

pub mod config;
pub mod error;
pub mod storage;
pub mod vision;

pub use config::AppConfig;
pub use error::{FormError, Result};
pub use vision::{FieldExtraction, FormPipeline, Region, RegionKind, Segmentation};

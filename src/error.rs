//! Error types for form field extraction

use thiserror::Error;

/// Result type alias for formfield operations
pub type Result<T> = std::result::Result<T, FormError>;

/// Errors produced by the extraction pipeline
#[derive(Error, Debug)]
pub enum FormError {
    /// Malformed image, empty input, or a parameter outside its valid range
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Image decode/encode failure
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    /// I/O error when reading or writing files
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The external text recognizer failed or returned unreadable output
    #[error("Recognizer error: {0}")]
    Recognizer(String),

    /// Configuration could not be parsed or serialized
    #[error("Configuration error: {0}")]
    Config(String),
}

impl FormError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }
}

use std::path::PathBuf;
use thiserror::Error;

use crate::embedding::EmbeddingError;
use crate::index::{LexicalIndexError, VectorIndexError};
use crate::storage::StoreError;

/// Main error type for blobdex
#[derive(Error, Debug)]
pub enum BlobdexError {
    /// Configuration related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration validation errors
    #[error("Configuration validation failed: {errors:?}")]
    ConfigValidation { errors: Vec<ValidationError> },

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: PathBuf },

    /// Invalid configuration value
    #[error("Invalid configuration value at {path}: {message}")]
    InvalidConfigValue { path: String, message: String },

    /// IO errors
    #[error("IO error: {context}: {source}")]
    Io {
        source: std::io::Error,
        context: String,
    },

    /// TOML deserialization errors
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// TOML serialization errors
    #[error("TOML serialization error: {0}")]
    TomlSerialization(#[from] toml::ser::Error),

    /// JSON errors
    #[error("JSON error: {context}: {source}")]
    Json {
        source: serde_json::Error,
        context: String,
    },

    /// Object store errors (includes NotFound)
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    /// Lease could not be acquired within the retry budget
    #[error("Failed to acquire lease for {resource} after {attempts} attempts")]
    LockAcquisition { resource: String, attempts: u32 },

    /// Malformed input that must never be retried
    #[error("Validation error: {0}")]
    Validation(String),

    /// Operation requires state that does not exist yet
    #[error("Not initialized: {0}")]
    NotInitialized(String),

    /// Lexical index errors
    #[error(transparent)]
    Lexical(#[from] LexicalIndexError),

    /// Vector index errors
    #[error(transparent)]
    Vector(#[from] VectorIndexError),

    /// Embedding service errors
    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    /// Document produced no usable text
    #[error("Parse error: {0}")]
    Parse(String),

    /// No parser registered for the extension
    #[error("Unsupported file extension: {0}")]
    UnsupportedExtension(String),

    /// Generic errors
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BlobdexError {
    /// True when the error is the store reporting a missing resource
    pub fn is_not_found(&self) -> bool {
        matches!(self, BlobdexError::Store(e) if e.is_not_found())
    }
}

/// Configuration validation error
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// Path to the configuration key that failed validation
    pub path: String,
    /// Error message describing the validation failure
    pub message: String,
}

impl ValidationError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Result type for blobdex operations
pub type Result<T> = std::result::Result<T, BlobdexError>;

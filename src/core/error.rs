//! Error types for temporal anti-aliasing

use thiserror::Error;

/// Main error type for the crate
#[derive(Debug, Error)]
pub enum Error {
    #[error("GPU error: {0}")]
    Gpu(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    /// Rejected configuration value (bounds swapped, out of range, non-finite)
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A program or buffer the resolve needs could not be created
    #[error("Resource unavailable: {0}")]
    ResourceUnavailable(String),

    /// Per-frame calls arrived out of order
    #[error("Frame order violation: {0}")]
    FrameOrder(String),
}

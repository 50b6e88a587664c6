//! # Error Types
//!
//! This module defines error types used throughout the librito library.

use thiserror::Error;

/// Main error type for librito operations
#[derive(Debug, Error)]
pub enum LibritoError {
    /// Entity missing, wrong kind, or unresolvable into tokens
    #[error("Data error: {0}")]
    Data(String),

    /// Template content missing or unusable for a build
    #[error("Content error: {0}")]
    Content(String),

    /// PDF rendering engine missing, misconfigured, or failing
    #[error("Engine error: {0}")]
    Engine(String),

    /// Remote service failure (QR renderer); recovered by local fallbacks
    #[error("Remote service error: {0}")]
    Remote(String),

    /// Artifact storage or signed-link failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// HTTP server error (bind, serve)
    #[error("Server error: {0}")]
    Server(String),

    /// I/O error wrapper
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

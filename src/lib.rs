//! # Librito - Manual Book PDF Generator
//!
//! Librito builds printed "manual book" PDFs for serial-numbered handmade
//! leather goods. It provides:
//!
//! - **Token resolution**: entity fields, settings and computed values
//!   flattened into a `{{token}}` map
//! - **Templating**: stored HTML+CSS template pairs with single-pass
//!   token substitution
//! - **Rendering**: PDF output through an external wkhtmltopdf binary,
//!   content-hashed with SHA-256
//! - **Storage**: dated on-disk layout with public or HMAC-signed
//!   download links
//! - **Queueing**: deduplicated, lease-guarded background build queue
//!
//! ## Quick Start
//!
//! ```no_run
//! use librito::App;
//! use std::collections::BTreeMap;
//!
//! # async fn example() -> Result<(), librito::LibritoError> {
//! // Open the application state under a data directory
//! let app = App::open("data")?;
//!
//! // Build the manual PDF for entity 12 and persist it
//! let output = app.builder.build(12, None, &BTreeMap::new(), true).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Module Overview
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`tokens`] | Token resolution from entities and settings |
//! | [`template`] | Template storage |
//! | [`compose`] | Token substitution into HTML/CSS |
//! | [`qr`] | QR code SVGs with offline fallback |
//! | [`pdf`] | PDF engine seam and the build pipeline |
//! | [`files`] | PDF storage and signed URLs |
//! | [`scheduler`] | Background build queue |
//! | [`server`] | HTTP API |
//! | [`error`] | Error types |

pub mod app;
pub mod compose;
pub mod entity;
pub mod error;
pub mod files;
pub mod pdf;
pub mod qr;
pub mod scheduler;
pub mod server;
pub mod settings;
pub mod template;
pub mod tokens;

// Re-exports for convenience
pub use app::App;
pub use error::LibritoError;

//! # Settings and Token Mappings
//!
//! Global configuration for manual book generation, persisted as JSON files
//! under the data directory:
//!
//! - `settings.json` holds branding, rendering, and storage options
//! - `mappings.json` holds the custom token mapping table
//!
//! Missing fields fall back to defaults, so a partial (or absent) settings
//! file is always usable. The signed-URL secret is generated on first load
//! and written back immediately so links stay valid across restarts.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::LibritoError;

/// Settings file name under the data directory.
pub const SETTINGS_FILE: &str = "settings.json";

/// Mappings file name under the data directory.
pub const MAPPINGS_FILE: &str = "mappings.json";

/// How stored PDFs are exposed to readers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageMode {
    /// Direct public URLs under the base URL.
    Public,
    /// Time-limited HMAC-signed URLs.
    Protected,
}

fn default_base_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_qr_base_url() -> String {
    "http://localhost:8080/manual".to_string()
}

fn default_qr_endpoint() -> String {
    "https://api.qrserver.com/v1/create-qr-code/".to_string()
}

fn default_brand_slogan() -> String {
    "Crafted for the Journey".to_string()
}

fn default_footer_phone() -> String {
    "+62 812-0000-0000".to_string()
}

fn default_storage_mode() -> StorageMode {
    StorageMode::Public
}

fn default_page_size() -> String {
    "A4".to_string()
}

fn default_dpi() -> u32 {
    180
}

fn default_image_quality() -> u32 {
    80
}

fn default_margin_mm() -> u32 {
    10
}

fn default_true() -> bool {
    true
}

fn default_template() -> String {
    "default".to_string()
}

/// Global settings for manual book generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Public base URL of this service (used for artifact URLs).
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Base URL encoded into product QR codes; the serial code is appended.
    #[serde(default = "default_qr_base_url")]
    pub qr_base_url: String,

    /// Remote QR rendering service endpoint.
    #[serde(default = "default_qr_endpoint")]
    pub qr_endpoint: String,

    /// URL of the brand logo placed on the cover.
    #[serde(default)]
    pub logo_url: String,

    /// Brand slogan printed in the footer.
    #[serde(default = "default_brand_slogan")]
    pub brand_slogan: String,

    /// Contact phone printed in the footer.
    #[serde(default = "default_footer_phone")]
    pub footer_phone: String,

    /// Whether stored PDFs are public or behind signed URLs.
    #[serde(default = "default_storage_mode")]
    pub storage_mode: StorageMode,

    /// Page size passed to the rendering engine (e.g. "A4").
    #[serde(default = "default_page_size")]
    pub page_size: String,

    /// Render resolution in dots per inch.
    #[serde(default = "default_dpi")]
    pub dpi: u32,

    /// JPEG quality for images embedded in the PDF (0-100).
    #[serde(default = "default_image_quality")]
    pub image_quality: u32,

    /// Page margin in millimeters (applied to all four sides).
    #[serde(default = "default_margin_mm")]
    pub margin_mm: u32,

    /// Whether to embed the brand font into the document.
    #[serde(default = "default_true")]
    pub embed_font: bool,

    /// Path or URL of the font file embedded when `embed_font` is set.
    #[serde(default)]
    pub font_file: String,

    /// Id of the template used when a build does not name one.
    #[serde(default = "default_template")]
    pub default_template: String,

    /// Secret key for signed URLs (hex). Generated on first load.
    #[serde(default)]
    pub secret: String,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            base_url: default_base_url(),
            qr_base_url: default_qr_base_url(),
            qr_endpoint: default_qr_endpoint(),
            logo_url: String::new(),
            brand_slogan: default_brand_slogan(),
            footer_phone: default_footer_phone(),
            storage_mode: default_storage_mode(),
            page_size: default_page_size(),
            dpi: default_dpi(),
            image_quality: default_image_quality(),
            margin_mm: default_margin_mm(),
            embed_font: true,
            font_file: String::new(),
            default_template: default_template(),
            secret: String::new(),
        }
    }
}

impl Settings {
    /// Load settings from `<data_dir>/settings.json`.
    ///
    /// A missing file yields the defaults. A secret is generated and the
    /// file written back if none was stored yet.
    pub fn load(data_dir: &Path) -> Result<Self, LibritoError> {
        let path = data_dir.join(SETTINGS_FILE);

        let mut settings = if path.exists() {
            let contents = fs::read_to_string(&path)?;
            serde_json::from_str(&contents).map_err(|e| {
                LibritoError::Storage(format!("Failed to parse {}: {}", path.display(), e))
            })?
        } else {
            Settings::default()
        };

        if settings.secret.is_empty() {
            settings.secret = generate_secret();
            settings.save(data_dir)?;
        }

        Ok(settings)
    }

    /// Write settings to `<data_dir>/settings.json`.
    pub fn save(&self, data_dir: &Path) -> Result<(), LibritoError> {
        fs::create_dir_all(data_dir)?;
        let path = data_dir.join(SETTINGS_FILE);
        let contents = serde_json::to_string_pretty(self).map_err(|e| {
            LibritoError::Storage(format!("Failed to serialize settings: {}", e))
        })?;
        fs::write(&path, contents)?;
        Ok(())
    }
}

/// Generate a random 32-byte secret, hex encoded.
fn generate_secret() -> String {
    let mut key = [0u8; 32];
    rand::rng().fill(&mut key);
    hex::encode(key)
}

/// A custom token backed by an entity field with a static fallback.
///
/// Mappings let operators add tokens to templates without code changes:
/// `{{token}}` resolves to the entity field named by `source`, or to
/// `fallback` when the field is empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mapping {
    /// Token name without braces (e.g. "warranty_years").
    pub token: String,
    /// Entity field key the value is read from.
    pub source: String,
    /// Static value used when the source field is empty.
    #[serde(default)]
    pub fallback: String,
}

/// Load the mapping table from `<data_dir>/mappings.json`.
///
/// A missing file yields an empty table.
pub fn load_mappings(data_dir: &Path) -> Result<Vec<Mapping>, LibritoError> {
    let path = data_dir.join(MAPPINGS_FILE);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let contents = fs::read_to_string(&path)?;
    serde_json::from_str(&contents)
        .map_err(|e| LibritoError::Storage(format!("Failed to parse {}: {}", path.display(), e)))
}

/// Write the mapping table to `<data_dir>/mappings.json`.
pub fn save_mappings(data_dir: &Path, mappings: &[Mapping]) -> Result<(), LibritoError> {
    fs::create_dir_all(data_dir)?;
    let path = data_dir.join(MAPPINGS_FILE);
    let contents = serde_json::to_string_pretty(mappings)
        .map_err(|e| LibritoError::Storage(format!("Failed to serialize mappings: {}", e)))?;
    fs::write(&path, contents)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults_fill_missing_fields() {
        let settings: Settings = serde_json::from_str("{}").unwrap();
        assert_eq!(settings.brand_slogan, "Crafted for the Journey");
        assert_eq!(settings.footer_phone, "+62 812-0000-0000");
        assert_eq!(settings.storage_mode, StorageMode::Public);
        assert_eq!(settings.page_size, "A4");
        assert_eq!(settings.dpi, 180);
        assert_eq!(settings.image_quality, 80);
        assert_eq!(settings.margin_mm, 10);
        assert!(settings.embed_font);
        assert_eq!(settings.default_template, "default");
    }

    #[test]
    fn test_partial_file_keeps_explicit_values() {
        let settings: Settings =
            serde_json::from_str(r#"{"dpi": 300, "brand_slogan": "Hecho a mano"}"#).unwrap();
        assert_eq!(settings.dpi, 300);
        assert_eq!(settings.brand_slogan, "Hecho a mano");
        // Untouched fields still default
        assert_eq!(settings.image_quality, 80);
    }

    #[test]
    fn test_secret_generated_and_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let first = Settings::load(dir.path()).unwrap();
        assert_eq!(first.secret.len(), 64);
        assert!(first.secret.chars().all(|c| c.is_ascii_hexdigit()));

        // Reloading keeps the same secret
        let second = Settings::load(dir.path()).unwrap();
        assert_eq!(first.secret, second.secret);
    }

    #[test]
    fn test_storage_mode_round_trip() {
        let json = serde_json::to_string(&StorageMode::Protected).unwrap();
        assert_eq!(json, r#""protected""#);
        let mode: StorageMode = serde_json::from_str(r#""public""#).unwrap();
        assert_eq!(mode, StorageMode::Public);
    }

    #[test]
    fn test_mappings_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_mappings(dir.path()).unwrap().is_empty());

        let mappings = vec![Mapping {
            token: "warranty_years".to_string(),
            source: "warranty".to_string(),
            fallback: "2".to_string(),
        }];
        save_mappings(dir.path(), &mappings).unwrap();
        assert_eq!(load_mappings(dir.path()).unwrap(), mappings);
    }
}

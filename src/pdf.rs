//! # PDF Building
//!
//! Turns a composed document into a stored (or ephemeral) PDF artifact.
//! `PdfBuilder` drives the whole chain: resolve tokens, compose the
//! template, render through the engine, hash the binary, persist it, and
//! write generation metadata back onto the entity.
//!
//! Rendering itself is delegated to a [`PdfEngine`]. The shipped engine
//! shells out to `wkhtmltopdf`, feeding it a scratch HTML file and reading
//! the PDF back; a missing binary surfaces as an engine (configuration)
//! error, distinct from data and content errors.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::compose::{compose, ComposedDocument};
use crate::entity::{
    EntityStore, META_CUSTOMER, META_GENERATED_AT, META_ORDER_DATE, META_PDF_HASH, META_PDF_ID,
    META_PDF_PATH, META_PDF_RELATIVE, META_PDF_VERSION,
};
use crate::error::LibritoError;
use crate::files::FileStore;
use crate::settings::Settings;
use crate::template::TemplateStore;
use crate::tokens::{brace, TokenMap, TokenResolver, TOKEN_CUSTOMER_NAME, TOKEN_ORDER_DATE, TOKEN_SERIAL_CODE};

/// Default renderer binary name, resolved via PATH.
pub const DEFAULT_ENGINE_BINARY: &str = "wkhtmltopdf";

/// Hard ceiling on a single render.
const RENDER_TIMEOUT_SECS: u64 = 60;

/// Page options handed to the rendering engine.
#[derive(Debug, Clone)]
pub struct RenderOptions {
    pub page_size: String,
    pub margin_mm: u32,
    pub dpi: u32,
    pub image_quality: u32,
}

impl RenderOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        RenderOptions {
            page_size: settings.page_size.clone(),
            margin_mm: settings.margin_mm,
            dpi: settings.dpi,
            image_quality: settings.image_quality,
        }
    }
}

/// External HTML-to-PDF rendering seam.
#[async_trait]
pub trait PdfEngine: Send + Sync {
    /// Render a complete HTML document to PDF bytes.
    async fn render(&self, html: &str, options: &RenderOptions) -> Result<Vec<u8>, LibritoError>;
}

/// Renders PDFs by shelling out to `wkhtmltopdf`.
pub struct WkhtmltopdfEngine {
    binary: PathBuf,
    timeout: Duration,
}

impl WkhtmltopdfEngine {
    pub fn new() -> Self {
        Self::with_binary(DEFAULT_ENGINE_BINARY)
    }

    /// Use a specific renderer binary path.
    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        WkhtmltopdfEngine {
            binary: binary.into(),
            timeout: Duration::from_secs(RENDER_TIMEOUT_SECS),
        }
    }

    /// Cap a single render at `timeout` instead of the default.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Default for WkhtmltopdfEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PdfEngine for WkhtmltopdfEngine {
    async fn render(&self, html: &str, options: &RenderOptions) -> Result<Vec<u8>, LibritoError> {
        let scratch = tempfile::tempdir()
            .map_err(|e| LibritoError::Storage(format!("Failed to create scratch dir: {}", e)))?;
        let input = scratch.path().join("manual.html");
        let output = scratch.path().join("manual.pdf");

        tokio::fs::write(&input, html).await?;

        let margin = format!("{}mm", options.margin_mm);
        let mut command = tokio::process::Command::new(&self.binary);
        command
            .arg("--quiet")
            .arg("--encoding")
            .arg("utf-8")
            .arg("--page-size")
            .arg(&options.page_size)
            .arg("--dpi")
            .arg(options.dpi.to_string())
            .arg("--image-quality")
            .arg(options.image_quality.to_string())
            .arg("--margin-top")
            .arg(&margin)
            .arg("--margin-bottom")
            .arg(&margin)
            .arg("--margin-left")
            .arg(&margin)
            .arg("--margin-right")
            .arg(&margin)
            .arg(&input)
            .arg(&output)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            // A timed-out render must not leave the child running.
            .kill_on_drop(true);

        let result = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| {
                LibritoError::Engine(format!(
                    "{} timed out after {}s",
                    self.binary.display(),
                    self.timeout.as_secs()
                ))
            })?;

        let out = result.map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                LibritoError::Engine(format!(
                    "{} not found; install it or configure the engine binary",
                    self.binary.display()
                ))
            } else {
                LibritoError::Engine(format!("Failed to run {}: {}", self.binary.display(), e))
            }
        })?;

        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            return Err(LibritoError::Engine(format!(
                "{} exited with {}: {}",
                self.binary.display(),
                out.status,
                stderr.trim()
            )));
        }

        tokio::fs::read(&output).await.map_err(|e| {
            LibritoError::Engine(format!("{} produced no output: {}", self.binary.display(), e))
        })
    }
}

/// A persisted build result.
#[derive(Debug, Clone, Serialize)]
pub struct Artifact {
    /// Fresh artifact id (UUID v4).
    pub id: String,
    /// Absolute storage path.
    pub path: PathBuf,
    /// Storage-relative path.
    pub relative: String,
    /// SHA-256 of the PDF bytes, hex encoded.
    pub hash: String,
    /// Generator version.
    pub version: String,
    pub generated_at: DateTime<Utc>,
}

/// Result of a build call.
pub enum BuildOutput {
    /// Persisted to storage with entity metadata updated.
    Stored(Artifact),
    /// Ephemeral result; nothing touched storage or metadata.
    Binary { bytes: Vec<u8>, filename: String },
}

/// Orchestrates the resolve-compose-render-persist pipeline.
pub struct PdfBuilder {
    entities: Arc<dyn EntityStore>,
    templates: Arc<TemplateStore>,
    resolver: Arc<TokenResolver>,
    files: Arc<FileStore>,
    engine: Arc<dyn PdfEngine>,
    settings: Arc<Settings>,
}

impl PdfBuilder {
    pub fn new(
        entities: Arc<dyn EntityStore>,
        templates: Arc<TemplateStore>,
        resolver: Arc<TokenResolver>,
        files: Arc<FileStore>,
        engine: Arc<dyn PdfEngine>,
        settings: Arc<Settings>,
    ) -> Self {
        PdfBuilder {
            entities,
            templates,
            resolver,
            files,
            engine,
            settings,
        }
    }

    /// Build a manual PDF for an entity.
    ///
    /// With `persist` the PDF is stored, attached to the entity via
    /// metadata, and returned as [`BuildOutput::Stored`]; without it the
    /// raw bytes and a derived file name come back and nothing is written.
    /// Failures are logged with the entity id and propagated.
    pub async fn build(
        &self,
        entity_id: u64,
        template_id: Option<&str>,
        overrides: &BTreeMap<String, String>,
        persist: bool,
    ) -> Result<BuildOutput, LibritoError> {
        let result = self
            .build_inner(entity_id, template_id, overrides, persist)
            .await;
        if let Err(e) = &result {
            tracing::error!(entity_id, error = %e, "manual build failed");
        }
        result
    }

    async fn build_inner(
        &self,
        entity_id: u64,
        template_id: Option<&str>,
        overrides: &BTreeMap<String, String>,
        persist: bool,
    ) -> Result<BuildOutput, LibritoError> {
        let tokens = self.resolver.resolve(entity_id, overrides).await?;
        if tokens.is_empty() {
            return Err(LibritoError::Data(format!(
                "Entity {} is missing or not a serialnumber record",
                entity_id
            )));
        }

        let template = self.templates.get(template_id);
        let doc = compose(&tokens, &template, true)?;
        let html = self.document_html(&doc);

        let options = RenderOptions::from_settings(&self.settings);
        let bytes = self.engine.render(&html, &options).await?;
        let hash = hex::encode(Sha256::digest(&bytes));

        let serial = tokens
            .get(TOKEN_SERIAL_CODE)
            .map(String::as_str)
            .unwrap_or("");

        if !persist {
            return Ok(BuildOutput::Binary {
                bytes,
                filename: FileStore::filename(serial),
            });
        }

        let saved = self.files.save(&bytes, serial)?;
        let artifact = Artifact {
            id: Uuid::new_v4().to_string(),
            path: saved.path,
            relative: saved.relative,
            hash,
            version: env!("CARGO_PKG_VERSION").to_string(),
            generated_at: Utc::now(),
        };

        self.entities.set_meta(entity_id, META_PDF_ID, &artifact.id)?;
        self.entities
            .set_meta(entity_id, META_PDF_PATH, &artifact.path.display().to_string())?;
        self.entities
            .set_meta(entity_id, META_PDF_RELATIVE, &artifact.relative)?;
        self.entities
            .set_meta(entity_id, META_PDF_VERSION, &artifact.version)?;
        self.entities
            .set_meta(entity_id, META_PDF_HASH, &artifact.hash)?;
        self.entities.set_meta(
            entity_id,
            META_GENERATED_AT,
            &artifact.generated_at.to_rfc3339(),
        )?;

        self.store_override_context(entity_id, overrides, &tokens)?;

        tracing::info!(
            entity_id,
            path = %artifact.path.display(),
            hash = %artifact.hash,
            "manual PDF built"
        );

        Ok(BuildOutput::Stored(artifact))
    }

    /// Non-strict composed preview: `<style>` block plus body markup.
    pub async fn compose_html(
        &self,
        entity_id: u64,
        template_id: Option<&str>,
        overrides: &BTreeMap<String, String>,
    ) -> Result<String, LibritoError> {
        let tokens = self.resolver.resolve(entity_id, overrides).await?;
        if tokens.is_empty() {
            return Err(LibritoError::Data(format!(
                "Entity {} is missing or not a serialnumber record",
                entity_id
            )));
        }
        let template = self.templates.get(template_id);
        let doc = compose(&tokens, &template, false)?;
        Ok(doc.preview_html())
    }

    /// Wrap a composed document into the full HTML the engine renders.
    fn document_html(&self, doc: &ComposedDocument) -> String {
        let mut css = String::new();
        if self.settings.embed_font && !self.settings.font_file.is_empty() {
            css.push_str(&font_face_css(&self.settings.font_file));
        }
        css.push_str(&doc.css);
        format!(
            concat!(
                "<!DOCTYPE html>\n",
                "<html>\n<head>\n<meta charset=\"utf-8\">\n",
                "<style>\n{}\n</style>\n",
                "</head>\n<body>\n{}\n</body>\n</html>\n"
            ),
            css, doc.html
        )
    }

    /// Persist customer/order overrides onto the entity for future builds.
    ///
    /// Only values that were explicitly supplied and resolved non-empty
    /// are stored; absent overrides leave earlier context untouched.
    fn store_override_context(
        &self,
        entity_id: u64,
        overrides: &BTreeMap<String, String>,
        tokens: &TokenMap,
    ) -> Result<(), LibritoError> {
        let supplied = |token_key: &str| overrides.keys().any(|k| brace(k) == token_key);

        if supplied(TOKEN_CUSTOMER_NAME)
            && let Some(customer) = tokens.get(TOKEN_CUSTOMER_NAME)
            && !customer.is_empty()
        {
            self.entities.set_meta(entity_id, META_CUSTOMER, customer)?;
        }
        if supplied(TOKEN_ORDER_DATE)
            && let Some(order_date) = tokens.get(TOKEN_ORDER_DATE)
            && !order_date.is_empty()
        {
            self.entities
                .set_meta(entity_id, META_ORDER_DATE, order_date)?;
        }
        Ok(())
    }
}

/// `@font-face` block for the embedded brand font.
fn font_face_css(font_file: &str) -> String {
    format!(
        concat!(
            "@font-face {{\n",
            "  font-family: 'Manual';\n",
            "  src: url('{}');\n",
            "}}\n"
        ),
        font_file
    )
}

// ============================================================================
// TESTS
// ============================================================================

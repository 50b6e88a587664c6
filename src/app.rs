//! # Application Container
//!
//! Explicit dependency wiring: every component is constructed once in
//! [`App::open`] and shared through `Arc` handles. There are no global
//! singletons; tests swap the rendering engine through
//! [`App::open_with_engine`].

use std::path::PathBuf;
use std::sync::Arc;

use crate::entity::{EntityStore, JsonEntityStore, META_PDF_PATH};
use crate::error::LibritoError;
use crate::files::FileStore;
use crate::pdf::{PdfBuilder, PdfEngine, WkhtmltopdfEngine};
use crate::qr::QrClient;
use crate::scheduler::Scheduler;
use crate::settings::{self, Mapping, Settings};
use crate::template::TemplateStore;
use crate::tokens::TokenResolver;

/// All components of the manual book pipeline, wired together.
pub struct App {
    pub data_dir: PathBuf,
    pub settings: Arc<Settings>,
    pub mappings: Arc<Vec<Mapping>>,
    pub entities: Arc<dyn EntityStore>,
    pub templates: Arc<TemplateStore>,
    pub files: Arc<FileStore>,
    pub resolver: Arc<TokenResolver>,
    pub builder: Arc<PdfBuilder>,
    pub scheduler: Arc<Scheduler>,
}

impl App {
    /// Open the application over a data directory with the default
    /// wkhtmltopdf engine.
    pub fn open(data_dir: impl Into<PathBuf>) -> Result<Self, LibritoError> {
        Self::open_with_engine(data_dir, Arc::new(WkhtmltopdfEngine::new()))
    }

    /// Open with a specific rendering engine (test seam).
    pub fn open_with_engine(
        data_dir: impl Into<PathBuf>,
        engine: Arc<dyn PdfEngine>,
    ) -> Result<Self, LibritoError> {
        let data_dir = data_dir.into();
        std::fs::create_dir_all(&data_dir)?;

        let settings = Arc::new(Settings::load(&data_dir)?);
        let mappings = Arc::new(settings::load_mappings(&data_dir)?);

        let entities: Arc<dyn EntityStore> =
            Arc::new(JsonEntityStore::open(data_dir.join("entities"))?);
        let templates = Arc::new(TemplateStore::open(&data_dir, &settings.default_template)?);
        let files = Arc::new(FileStore::open(
            data_dir.join("storage"),
            &settings.base_url,
            &settings.secret,
        )?);

        let qr = Arc::new(QrClient::new(&settings.qr_endpoint)?);
        let resolver = Arc::new(TokenResolver::new(
            entities.clone(),
            settings.clone(),
            mappings.clone(),
            qr,
        ));
        let builder = Arc::new(PdfBuilder::new(
            entities.clone(),
            templates.clone(),
            resolver.clone(),
            files.clone(),
            engine,
            settings.clone(),
        ));
        let scheduler = Scheduler::open(&data_dir, builder.clone(), entities.clone())?;

        Ok(App {
            data_dir,
            settings,
            mappings,
            entities,
            templates,
            files,
            resolver,
            builder,
            scheduler,
        })
    }

    /// Stored-path metadata of every entity that has a generated manual.
    pub fn referenced_paths(&self) -> Result<Vec<String>, LibritoError> {
        self.entities.meta_values(META_PDF_PATH)
    }

    /// Remove stored PDFs no entity references. Returns the count removed.
    ///
    /// Best-effort against concurrent builds: a PDF written while this
    /// runs may be swept before its metadata lands and will be rebuilt on
    /// the next pass.
    pub fn cleanup(&self) -> Result<usize, LibritoError> {
        self.files.cleanup_orphans(&self.referenced_paths()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_creates_data_layout() {
        let dir = tempfile::tempdir().unwrap();
        let app = App::open(dir.path().join("data")).unwrap();

        assert!(app.data_dir.join("settings.json").exists());
        assert!(app.data_dir.join("templates.json").exists());
        assert!(app.data_dir.join("entities").is_dir());
        assert!(app.data_dir.join("storage").is_dir());
        assert!(!app.settings.secret.is_empty());
    }

    #[test]
    fn test_cleanup_with_nothing_stored() {
        let dir = tempfile::tempdir().unwrap();
        let app = App::open(dir.path()).unwrap();
        assert_eq!(app.cleanup().unwrap(), 0);
    }
}

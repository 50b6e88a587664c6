//! # Entity Records and Storage
//!
//! An entity is a serialized product record: the source a manual book is
//! generated for. Entities are owned externally (created and edited by
//! operators); this crate only reads their fields and writes generation
//! metadata back under fixed keys.
//!
//! `EntityStore` is the storage seam. `JsonEntityStore` is the shipped
//! implementation, keeping one JSON file per entity under
//! `<data_dir>/entities/`.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::LibritoError;

/// Entity kind eligible for manual book generation.
pub const KIND_SERIALNUMBER: &str = "serialnumber";

/// Artifact id of the last generated PDF.
pub const META_PDF_ID: &str = "manual_pdf_id";
/// Absolute path of the stored PDF.
pub const META_PDF_PATH: &str = "manual_pdf_path";
/// Storage-relative path of the stored PDF (used for URLs and signing).
pub const META_PDF_RELATIVE: &str = "manual_pdf_relative";
/// Generator version the PDF was built with.
pub const META_PDF_VERSION: &str = "manual_pdf_version";
/// SHA-256 content hash of the stored PDF.
pub const META_PDF_HASH: &str = "manual_pdf_hash";
/// RFC 3339 timestamp of the last successful build.
pub const META_GENERATED_AT: &str = "manual_generated_at";
/// When set to "1", queued builds skip this entity unless forced.
pub const META_LOCK: &str = "manual_lock";
/// Customer name stored from a build override.
pub const META_CUSTOMER: &str = "manual_customer";
/// Order date (short form) stored from a build override.
pub const META_ORDER_DATE: &str = "manual_order_date";

fn default_status() -> String {
    "published".to_string()
}

/// A serialized product record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub id: u64,
    /// Record kind; only [`KIND_SERIALNUMBER`] entities are processable.
    pub kind: String,
    pub title: String,
    /// Publication status ("published" or "draft").
    #[serde(default = "default_status")]
    pub status: String,
    pub created_at: DateTime<Utc>,
    /// Structured product fields (material, color, serial_code, ...).
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
    /// Generation metadata written back by the pipeline.
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
}

impl Entity {
    /// Create a serialnumber entity with the given id and title.
    pub fn new(id: u64, title: &str) -> Self {
        Entity {
            id,
            kind: KIND_SERIALNUMBER.to_string(),
            title: title.to_string(),
            status: default_status(),
            created_at: Utc::now(),
            fields: BTreeMap::new(),
            meta: BTreeMap::new(),
        }
    }

    /// Look up a structured field, returning "" when absent.
    pub fn field(&self, key: &str) -> &str {
        self.fields.get(key).map(String::as_str).unwrap_or("")
    }

    /// Look up a metadata value, returning "" when absent.
    pub fn meta(&self, key: &str) -> &str {
        self.meta.get(key).map(String::as_str).unwrap_or("")
    }

    /// Whether this entity is of the kind the pipeline processes.
    pub fn is_serial(&self) -> bool {
        self.kind == KIND_SERIALNUMBER
    }

    /// Whether queued builds should skip this entity.
    pub fn is_locked(&self) -> bool {
        self.meta(META_LOCK) == "1"
    }

    /// Serial code: the `serial_code` field, falling back to the title.
    pub fn serial_code(&self) -> &str {
        let code = self.field("serial_code");
        if code.trim().is_empty() {
            self.title.as_str()
        } else {
            code
        }
    }
}

/// Filter for entity listing queries.
#[derive(Debug, Clone, Default)]
pub struct EntityFilter {
    /// Case-insensitive substring match on title or serial code.
    pub search: Option<String>,
    /// Exact match on the `material` field.
    pub material: Option<String>,
    /// Exact match on the `leather_type` field.
    pub leather_type: Option<String>,
    /// Inclusive creation-date lower bound.
    pub from: Option<NaiveDate>,
    /// Inclusive creation-date upper bound.
    pub to: Option<NaiveDate>,
    /// Exact status match ("published", "draft").
    pub status: Option<String>,
}

impl EntityFilter {
    fn matches(&self, entity: &Entity) -> bool {
        if let Some(search) = &self.search {
            let needle = search.to_lowercase();
            let in_title = entity.title.to_lowercase().contains(&needle);
            let in_serial = entity.serial_code().to_lowercase().contains(&needle);
            if !in_title && !in_serial {
                return false;
            }
        }
        if let Some(material) = &self.material
            && !entity.field("material").eq_ignore_ascii_case(material)
        {
            return false;
        }
        if let Some(leather) = &self.leather_type
            && !entity.field("leather_type").eq_ignore_ascii_case(leather)
        {
            return false;
        }
        let date = entity.created_at.date_naive();
        if let Some(from) = self.from
            && date < from
        {
            return false;
        }
        if let Some(to) = self.to
            && date > to
        {
            return false;
        }
        if let Some(status) = &self.status
            && entity.status != *status
        {
            return false;
        }
        true
    }
}

/// Storage seam for entity records.
///
/// The pipeline reads entities through this trait and writes generation
/// metadata back through it; it never creates or deletes entities.
pub trait EntityStore: Send + Sync {
    /// Fetch an entity by id.
    fn get(&self, id: u64) -> Result<Option<Entity>, LibritoError>;

    /// Insert or replace an entity record.
    fn put(&self, entity: &Entity) -> Result<(), LibritoError>;

    /// Set one metadata key on an entity.
    fn set_meta(&self, id: u64, key: &str, value: &str) -> Result<(), LibritoError>;

    /// Remove one metadata key from an entity. No-op when absent.
    fn remove_meta(&self, id: u64, key: &str) -> Result<(), LibritoError>;

    /// Ids of serialnumber entities matching the filter, newest first.
    fn list_ids(&self, filter: &EntityFilter) -> Result<Vec<u64>, LibritoError>;

    /// All non-empty values stored under a metadata key, across entities.
    fn meta_values(&self, key: &str) -> Result<Vec<String>, LibritoError>;
}

/// File-backed entity store: one JSON document per entity.
pub struct JsonEntityStore {
    dir: PathBuf,
    // Serializes read-modify-write cycles on entity files
    write_lock: Mutex<()>,
}

impl JsonEntityStore {
    /// Open (creating if needed) an entity store under `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, LibritoError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(JsonEntityStore {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    fn path_for(&self, id: u64) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    fn read(&self, path: &Path) -> Result<Entity, LibritoError> {
        let contents = fs::read_to_string(path)?;
        serde_json::from_str(&contents).map_err(|e| {
            LibritoError::Storage(format!("Failed to parse {}: {}", path.display(), e))
        })
    }

    fn write(&self, entity: &Entity) -> Result<(), LibritoError> {
        let contents = serde_json::to_string_pretty(entity).map_err(|e| {
            LibritoError::Storage(format!("Failed to serialize entity {}: {}", entity.id, e))
        })?;
        fs::write(self.path_for(entity.id), contents)?;
        Ok(())
    }

    fn all(&self) -> Result<Vec<Entity>, LibritoError> {
        let mut entities = Vec::new();
        for dir_entry in fs::read_dir(&self.dir)? {
            let path = dir_entry?.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                entities.push(self.read(&path)?);
            }
        }
        Ok(entities)
    }
}

impl EntityStore for JsonEntityStore {
    fn get(&self, id: u64) -> Result<Option<Entity>, LibritoError> {
        let path = self.path_for(id);
        if !path.exists() {
            return Ok(None);
        }
        self.read(&path).map(Some)
    }

    fn put(&self, entity: &Entity) -> Result<(), LibritoError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.write(entity)
    }

    fn set_meta(&self, id: u64, key: &str, value: &str) -> Result<(), LibritoError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let path = self.path_for(id);
        if !path.exists() {
            return Err(LibritoError::Data(format!("Unknown entity {}", id)));
        }
        let mut entity = self.read(&path)?;
        entity.meta.insert(key.to_string(), value.to_string());
        self.write(&entity)
    }

    fn remove_meta(&self, id: u64, key: &str) -> Result<(), LibritoError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let path = self.path_for(id);
        if !path.exists() {
            return Err(LibritoError::Data(format!("Unknown entity {}", id)));
        }
        let mut entity = self.read(&path)?;
        entity.meta.remove(key);
        self.write(&entity)
    }

    fn list_ids(&self, filter: &EntityFilter) -> Result<Vec<u64>, LibritoError> {
        let mut matched: Vec<&Entity> = Vec::new();
        let entities = self.all()?;
        for entity in &entities {
            if entity.is_serial() && filter.matches(entity) {
                matched.push(entity);
            }
        }
        // Newest first, ties broken by id for a stable order
        matched.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        Ok(matched.iter().map(|e| e.id).collect())
    }

    fn meta_values(&self, key: &str) -> Result<Vec<String>, LibritoError> {
        let mut values = Vec::new();
        for entity in self.all()? {
            let value = entity.meta(key);
            if !value.is_empty() {
                values.push(value.to_string());
            }
        }
        Ok(values)
    }
}

// ============================================================================
// TESTS
// ============================================================================

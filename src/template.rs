//! # Template Storage
//!
//! Named HTML+CSS template pairs for manual books. Templates live in a
//! single JSON file under the data directory and are held in memory behind
//! a lock; every mutation writes through to disk.
//!
//! A bundled default template (compiled in from `templates/`) seeds the
//! store on first use, so a fresh installation can build manuals
//! immediately. Lookups fall back: requested id, then the configured
//! default, then the first stored template, then the bundled one.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use crate::error::LibritoError;
use crate::tokens::sanitize_text;

/// Bundled default template body.
pub const DEFAULT_TEMPLATE_HTML: &str = include_str!("../templates/default.html");
/// Bundled default template styles.
pub const DEFAULT_TEMPLATE_CSS: &str = include_str!("../templates/default.css");

/// Templates file name under the data directory.
pub const TEMPLATES_FILE: &str = "templates.json";

/// An HTML+CSS template pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub html: String,
    pub css: String,
}

impl Template {
    /// The bundled default template.
    pub fn bundled_default() -> Self {
        Template {
            id: "default".to_string(),
            name: "Default".to_string(),
            description: "Bundled manual book layout".to_string(),
            html: DEFAULT_TEMPLATE_HTML.to_string(),
            css: DEFAULT_TEMPLATE_CSS.to_string(),
        }
    }
}

/// File-backed template store with an in-memory working copy.
pub struct TemplateStore {
    path: PathBuf,
    default_id: String,
    templates: RwLock<Vec<Template>>,
}

impl TemplateStore {
    /// Open the store, seeding the bundled default when no file exists.
    ///
    /// `default_id` is the operator-configured default template id used by
    /// [`TemplateStore::get`] when no id is requested.
    pub fn open(data_dir: &Path, default_id: &str) -> Result<Self, LibritoError> {
        fs::create_dir_all(data_dir)?;
        let path = data_dir.join(TEMPLATES_FILE);

        let templates = if path.exists() {
            let contents = fs::read_to_string(&path)?;
            serde_json::from_str(&contents).map_err(|e| {
                LibritoError::Storage(format!("Failed to parse {}: {}", path.display(), e))
            })?
        } else {
            vec![Template::bundled_default()]
        };

        let store = TemplateStore {
            path,
            default_id: default_id.to_string(),
            templates: RwLock::new(templates),
        };
        if !store.path.exists() {
            store.persist()?;
        }
        Ok(store)
    }

    /// All stored templates, in storage order.
    pub fn list(&self) -> Vec<Template> {
        self.read_guard().clone()
    }

    /// Fetch a template by id.
    ///
    /// Falls back to the configured default, then the first stored
    /// template, then the bundled default. Always yields a template.
    pub fn get(&self, id: Option<&str>) -> Template {
        let templates = self.read_guard();
        let find = |wanted: &str| templates.iter().find(|t| t.id == wanted).cloned();

        if let Some(id) = id
            && !id.is_empty()
            && let Some(found) = find(id)
        {
            return found;
        }
        if let Some(found) = find(&self.default_id) {
            return found;
        }
        templates
            .first()
            .cloned()
            .unwrap_or_else(Template::bundled_default)
    }

    /// Insert or replace a template, keyed by id.
    ///
    /// An empty id is derived from the name (lowercased, non-alphanumeric
    /// runs collapsed to "-").
    pub fn save(&self, mut template: Template) -> Result<Template, LibritoError> {
        if template.id.trim().is_empty() {
            template.id = slug(&template.name);
        }
        if template.id.is_empty() {
            return Err(LibritoError::Content(
                "Template needs an id or a name".to_string(),
            ));
        }
        template.name = sanitize_text(&template.name);
        template.description = sanitize_text(&template.description);

        {
            let mut templates = self.write_guard();
            if let Some(existing) = templates.iter_mut().find(|t| t.id == template.id) {
                *existing = template.clone();
            } else {
                templates.push(template.clone());
            }
        }
        self.persist()?;
        Ok(template)
    }

    /// Remove a template by id. Unknown ids are a no-op.
    ///
    /// Callers must not delete the configured default; that policy is
    /// enforced at the call sites, not here.
    pub fn delete(&self, id: &str) -> Result<(), LibritoError> {
        {
            let mut templates = self.write_guard();
            templates.retain(|t| t.id != id);
        }
        self.persist()
    }

    /// Export all templates as pretty-printed JSON.
    pub fn export_json(&self) -> Result<String, LibritoError> {
        serde_json::to_string_pretty(&*self.read_guard())
            .map_err(|e| LibritoError::Storage(format!("Failed to serialize templates: {}", e)))
    }

    /// Replace the stored set from exported JSON. Returns the count.
    ///
    /// Records with an empty id or no content at all are skipped; name and
    /// description are sanitized like on save.
    pub fn import_json(&self, json: &str) -> Result<usize, LibritoError> {
        let incoming: Vec<Template> = serde_json::from_str(json)
            .map_err(|e| LibritoError::Content(format!("Invalid template JSON: {}", e)))?;

        let mut cleaned = Vec::new();
        for mut template in incoming {
            template.id = template.id.trim().to_string();
            if template.id.is_empty() {
                template.id = slug(&template.name);
            }
            if template.id.is_empty() {
                continue;
            }
            if template.html.trim().is_empty() && template.css.trim().is_empty() {
                continue;
            }
            template.name = sanitize_text(&template.name);
            template.description = sanitize_text(&template.description);
            cleaned.push(template);
        }

        let count = cleaned.len();
        {
            let mut templates = self.write_guard();
            *templates = cleaned;
        }
        self.persist()?;
        Ok(count)
    }

    fn persist(&self) -> Result<(), LibritoError> {
        let contents = serde_json::to_string_pretty(&*self.read_guard())
            .map_err(|e| LibritoError::Storage(format!("Failed to serialize templates: {}", e)))?;
        fs::write(&self.path, contents)?;
        Ok(())
    }

    fn read_guard(&self) -> std::sync::RwLockReadGuard<'_, Vec<Template>> {
        self.templates.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_guard(&self) -> std::sync::RwLockWriteGuard<'_, Vec<Template>> {
        self.templates.write().unwrap_or_else(|e| e.into_inner())
    }
}

/// Lowercase id slug: alphanumeric runs joined by single dashes.
fn slug(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut pending_dash = false;
    for c in name.to_lowercase().chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.push(c);
        } else {
            pending_dash = true;
        }
    }
    out
}

// ============================================================================
// TESTS
// ============================================================================

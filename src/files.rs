//! # Artifact File Storage
//!
//! Persists generated PDFs under a dated directory layout and hands out
//! URLs for them:
//!
//! - `hw-manual-book/<YYYY>/<MM>/HW-Manual-<SERIAL>-<YYYYMMDD>.pdf`
//! - public URLs for open storage
//! - HMAC-signed, time-limited URLs for protected storage
//!
//! File names are deterministic per serial and day: a rebuild overwrites
//! the same path instead of accumulating versions. Files orphaned by
//! earlier builds (serial renamed, dates rolled over) are removed by an
//! explicit cleanup pass.

use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::LibritoError;
use crate::tokens::percent_encode;

type HmacSha256 = Hmac<Sha256>;

/// Directory under the storage root that holds all manual PDFs.
pub const STORAGE_SUBDIR: &str = "hw-manual-book";

/// File name prefix for generated manuals.
const FILENAME_PREFIX: &str = "HW-Manual";

/// A stored artifact's location.
#[derive(Debug, Clone, PartialEq)]
pub struct SavedFile {
    /// Absolute path on disk.
    pub path: PathBuf,
    /// Path relative to the storage root, with `/` separators.
    pub relative: String,
}

/// Persists PDFs and issues public or signed URLs for them.
pub struct FileStore {
    root: PathBuf,
    base_url: String,
    secret: Vec<u8>,
}

impl FileStore {
    /// Open a store rooted at `root`, creating the directory if needed.
    ///
    /// `base_url` is the public prefix URLs are built from; `secret` keys
    /// the signed-URL HMAC.
    pub fn open(root: impl Into<PathBuf>, base_url: &str, secret: &str) -> Result<Self, LibritoError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(FileStore {
            root,
            base_url: base_url.trim_end_matches('/').to_string(),
            secret: secret.as_bytes().to_vec(),
        })
    }

    /// The storage root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Replace non-filename characters with dashes and uppercase.
    pub fn sanitize_serial(serial: &str) -> String {
        let mut out = String::with_capacity(serial.len());
        let mut last_dash = false;
        for c in serial.chars() {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                out.push(c.to_ascii_uppercase());
                last_dash = false;
            } else if !last_dash {
                out.push('-');
                last_dash = true;
            }
        }
        out
    }

    /// Deterministic file name for a serial code, dated today.
    pub fn filename(serial: &str) -> String {
        format!(
            "{}-{}-{}.pdf",
            FILENAME_PREFIX,
            Self::sanitize_serial(serial),
            Utc::now().format("%Y%m%d")
        )
    }

    /// Write a PDF for `serial` under the dated layout, overwriting any
    /// previous file at the same path.
    pub fn save(&self, data: &[u8], serial: &str) -> Result<SavedFile, LibritoError> {
        let now = Utc::now();
        let relative = format!(
            "{}/{}/{}/{}",
            STORAGE_SUBDIR,
            now.format("%Y"),
            now.format("%m"),
            Self::filename(serial)
        );
        let path = self.absolutize(&relative);

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, data)
            .map_err(|e| LibritoError::Storage(format!("Failed to write {}: {}", path.display(), e)))?;

        Ok(SavedFile { path, relative })
    }

    /// Express an absolute path relative to the storage root.
    pub fn relativize(&self, path: &Path) -> Option<String> {
        let stripped = path.strip_prefix(&self.root).ok()?;
        let mut parts = Vec::new();
        for component in stripped.components() {
            parts.push(component.as_os_str().to_str()?);
        }
        Some(parts.join("/"))
    }

    /// Absolute path for a storage-relative one.
    pub fn absolutize(&self, relative: &str) -> PathBuf {
        let mut path = self.root.clone();
        for part in relative.split('/') {
            path.push(part);
        }
        path
    }

    /// Direct URL for open storage.
    pub fn public_url(&self, relative: &str) -> String {
        format!("{}/{}", self.base_url, relative)
    }

    /// Time-limited signed URL for protected storage.
    pub fn signed_url(&self, relative: &str, ttl: Duration) -> Result<String, LibritoError> {
        let expires = Utc::now().timestamp() + ttl.as_secs() as i64;
        let signature = self.sign(relative, expires)?;
        Ok(format!(
            "{}/download?manual={}&exp={}&sig={}",
            self.base_url,
            percent_encode(relative),
            expires,
            signature
        ))
    }

    /// HMAC-SHA256 over `relative|expires`, hex encoded.
    pub fn sign(&self, relative: &str, expires: i64) -> Result<String, LibritoError> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| LibritoError::Storage(format!("Signing key error: {}", e)))?;
        mac.update(format!("{}|{}", relative, expires).as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Verify a signed link and return the file path it grants.
    ///
    /// Rejects expired links, bad signatures (constant-time compare), and
    /// any path that resolves outside the storage root.
    pub fn resolve_signed(
        &self,
        relative: &str,
        expires: i64,
        signature: &str,
    ) -> Result<PathBuf, LibritoError> {
        if Utc::now().timestamp() > expires {
            return Err(LibritoError::Storage("Download link expired".to_string()));
        }

        let expected = hex::decode(signature)
            .map_err(|_| LibritoError::Storage("Malformed signature".to_string()))?;
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| LibritoError::Storage(format!("Signing key error: {}", e)))?;
        mac.update(format!("{}|{}", relative, expires).as_bytes());
        mac.verify_slice(&expected)
            .map_err(|_| LibritoError::Storage("Signature mismatch".to_string()))?;

        self.contained_path(relative)
    }

    /// Canonicalize a relative path and require it under the storage root.
    fn contained_path(&self, relative: &str) -> Result<PathBuf, LibritoError> {
        let path = self.absolutize(relative);
        let canonical = path
            .canonicalize()
            .map_err(|_| LibritoError::Storage(format!("No such file: {}", relative)))?;
        let root = self.root.canonicalize()?;
        if !canonical.starts_with(&root) {
            return Err(LibritoError::Storage(
                "Path escapes the storage root".to_string(),
            ));
        }
        Ok(canonical)
    }

    /// Delete stored PDFs not referenced by any entity.
    ///
    /// `referenced` holds the stored-path metadata values of all entities.
    /// Returns the number of files removed. Best-effort with respect to
    /// concurrent builds: a PDF written but not yet committed to entity
    /// metadata can be swept and will be regenerated by the next build.
    pub fn cleanup_orphans(&self, referenced: &[String]) -> Result<usize, LibritoError> {
        let mut keep = HashSet::new();
        for path in referenced {
            if let Ok(canonical) = Path::new(path).canonicalize() {
                keep.insert(canonical);
            }
        }

        let tree = self.root.join(STORAGE_SUBDIR);
        if !tree.exists() {
            return Ok(0);
        }

        let mut pdfs = Vec::new();
        collect_pdfs(&tree, &mut pdfs)?;

        let mut removed = 0;
        for pdf in pdfs {
            let canonical = match pdf.canonicalize() {
                Ok(c) => c,
                Err(_) => continue,
            };
            if !keep.contains(&canonical) {
                fs::remove_file(&canonical).map_err(|e| {
                    LibritoError::Storage(format!(
                        "Failed to remove {}: {}",
                        canonical.display(),
                        e
                    ))
                })?;
                removed += 1;
            }
        }

        if removed > 0 {
            tracing::info!(removed, "removed orphaned manual PDFs");
        }
        Ok(removed)
    }
}

/// Recursively collect `.pdf` files under `dir`.
fn collect_pdfs(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), LibritoError> {
    for dir_entry in fs::read_dir(dir)? {
        let path = dir_entry?.path();
        if path.is_dir() {
            collect_pdfs(&path, out)?;
        } else if path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"))
        {
            out.push(path);
        }
    }
    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn store() -> (tempfile::TempDir, FileStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(
            dir.path().join("storage"),
            "https://example.com",
            "test-secret",
        )
        .unwrap();
        (dir, store)
    }

    #[test]
    fn test_sanitize_serial() {
        assert_eq!(FileStore::sanitize_serial("HW-001"), "HW-001");
        assert_eq!(FileStore::sanitize_serial("hw 001/a"), "HW-001-A");
        assert_eq!(FileStore::sanitize_serial("a__b"), "A__B");
        assert_eq!(FileStore::sanitize_serial("x!!y"), "X-Y"); // runs collapse
    }

    #[test]
    fn test_filename_shape() {
        let name = FileStore::filename("hw-009");
        let date = Utc::now().format("%Y%m%d").to_string();
        assert_eq!(name, format!("HW-Manual-HW-009-{}.pdf", date));
    }

    #[test]
    fn test_save_uses_dated_layout() {
        let (_dir, store) = store();
        let saved = store.save(b"%PDF-1.4", "HW-001").unwrap();

        let now = Utc::now();
        let expected = format!(
            "hw-manual-book/{}/{}/HW-Manual-HW-001-{}.pdf",
            now.format("%Y"),
            now.format("%m"),
            now.format("%Y%m%d")
        );
        assert_eq!(saved.relative, expected);
        assert!(saved.path.exists());
        assert_eq!(fs::read(&saved.path).unwrap(), b"%PDF-1.4");

        // Same serial on the same day overwrites
        let again = store.save(b"%PDF-1.4 v2", "HW-001").unwrap();
        assert_eq!(again.path, saved.path);
        assert_eq!(fs::read(&again.path).unwrap(), b"%PDF-1.4 v2");
    }

    #[test]
    fn test_relativize_round_trip() {
        let (_dir, store) = store();
        let saved = store.save(b"pdf", "HW-002").unwrap();
        assert_eq!(store.relativize(&saved.path), Some(saved.relative.clone()));
        assert_eq!(store.absolutize(&saved.relative), saved.path);
        // Paths outside the root do not relativize
        assert_eq!(store.relativize(Path::new("/etc/passwd")), None);
    }

    #[test]
    fn test_public_url() {
        let (_dir, store) = store();
        assert_eq!(
            store.public_url("hw-manual-book/2024/03/x.pdf"),
            "https://example.com/hw-manual-book/2024/03/x.pdf"
        );
    }

    #[test]
    fn test_signed_url_round_trip() {
        let (_dir, store) = store();
        let saved = store.save(b"pdf", "HW-003").unwrap();

        let expires = Utc::now().timestamp() + 3600;
        let sig = store.sign(&saved.relative, expires).unwrap();
        let resolved = store.resolve_signed(&saved.relative, expires, &sig).unwrap();
        assert_eq!(resolved, saved.path.canonicalize().unwrap());
    }

    #[test]
    fn test_signed_url_rejects_tampering() {
        let (_dir, store) = store();
        let saved = store.save(b"pdf", "HW-004").unwrap();
        let expires = Utc::now().timestamp() + 3600;
        let sig = store.sign(&saved.relative, expires).unwrap();

        // Flip one signature nibble
        let mut bad_sig = sig.clone();
        let flipped = if bad_sig.ends_with('0') { '1' } else { '0' };
        bad_sig.pop();
        bad_sig.push(flipped);
        assert!(store.resolve_signed(&saved.relative, expires, &bad_sig).is_err());

        // Stretch the expiry without re-signing
        assert!(store
            .resolve_signed(&saved.relative, expires + 1, &sig)
            .is_err());

        // Point the path elsewhere without re-signing
        assert!(store.resolve_signed("other.pdf", expires, &sig).is_err());

        // Garbage signature
        assert!(store.resolve_signed(&saved.relative, expires, "zz").is_err());
    }

    #[test]
    fn test_signed_url_rejects_expired() {
        let (_dir, store) = store();
        let saved = store.save(b"pdf", "HW-005").unwrap();
        let expires = Utc::now().timestamp() - 10;
        let sig = store.sign(&saved.relative, expires).unwrap();
        let err = store.resolve_signed(&saved.relative, expires, &sig);
        assert!(matches!(err, Err(LibritoError::Storage(_))));
    }

    #[test]
    fn test_signed_url_rejects_traversal() {
        let (dir, store) = store();
        // A real file outside the storage root
        let outside = dir.path().join("secret.txt");
        fs::write(&outside, "top secret").unwrap();

        let relative = "../secret.txt";
        let expires = Utc::now().timestamp() + 3600;
        let sig = store.sign(relative, expires).unwrap();
        let err = store.resolve_signed(relative, expires, &sig).unwrap_err();
        assert!(err.to_string().contains("escapes"));
    }

    #[test]
    fn test_cleanup_orphans() {
        let (_dir, store) = store();
        let kept_a = store.save(b"pdf-a", "HW-A").unwrap();
        let kept_b = store.save(b"pdf-b", "HW-B").unwrap();
        let orphan_one = store.save(b"pdf-c", "HW-C").unwrap();
        let orphan_two = store.save(b"pdf-d", "HW-D").unwrap();

        let referenced = vec![
            kept_a.path.display().to_string(),
            kept_b.path.display().to_string(),
        ];
        let removed = store.cleanup_orphans(&referenced).unwrap();
        assert_eq!(removed, 2);
        assert!(kept_a.path.exists());
        assert!(kept_b.path.exists());
        assert!(!orphan_one.path.exists());
        assert!(!orphan_two.path.exists());

        // Idempotent
        assert_eq!(store.cleanup_orphans(&referenced).unwrap(), 0);
    }

    #[test]
    fn test_cleanup_with_empty_tree() {
        let (_dir, store) = store();
        assert_eq!(store.cleanup_orphans(&[]).unwrap(), 0);
    }

    #[test]
    fn test_signed_url_disambiguates_secret() {
        let dir = tempfile::tempdir().unwrap();
        let a = FileStore::open(dir.path().join("s"), "https://example.com", "key-a").unwrap();
        let b = FileStore::open(dir.path().join("s"), "https://example.com", "key-b").unwrap();
        let saved = a.save(b"pdf", "HW-X").unwrap();

        let expires = Utc::now().timestamp() + 60;
        let sig = a.sign(&saved.relative, expires).unwrap();
        assert!(a.resolve_signed(&saved.relative, expires, &sig).is_ok());
        assert!(b.resolve_signed(&saved.relative, expires, &sig).is_err());
    }
}

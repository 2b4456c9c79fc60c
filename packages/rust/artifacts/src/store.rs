//! Object-store capability and a local filesystem implementation.
//!
//! Keys are `/`-separated relative paths (`reports/normalized/2025-08-04/x.csv`).
//! Writes replace whole objects atomically: readers see the old object or the
//! new one, never a partial file.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tracing::debug;
use uuid::Uuid;

use chatlake_shared::{ChatlakeError, Result};

/// Metadata of a stored object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub key: String,
    pub size: u64,
    /// Hex SHA-256 of the content.
    pub etag: String,
    pub last_modified: DateTime<Utc>,
}

/// Destination object store.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Create or overwrite the object at `key`.
    async fn put(&self, key: &str, body: &[u8], content_type: &str) -> Result<ObjectMeta>;

    /// Object body, or `None` if absent.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Metadata, or `None` if absent.
    async fn head(&self, key: &str) -> Result<Option<ObjectMeta>>;

    /// Every object whose key starts with `prefix`, sorted by key.
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>>;

    /// Location handed to external collaborators (transform job, manifest).
    fn uri(&self, key: &str) -> String;
}

/// Hex SHA-256 digest used as the object etag.
pub fn content_etag(body: &[u8]) -> String {
    let digest = Sha256::digest(body);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

// ---------------------------------------------------------------------------
// Local filesystem store
// ---------------------------------------------------------------------------

/// Objects stored as plain files under `root`.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

/// In-flight writes use this file-name prefix and are hidden from listings.
const TEMP_PREFIX: &str = ".tmp-";

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        let valid = !key.is_empty()
            && !key.ends_with('/')
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !valid {
            return Err(ChatlakeError::validation(format!("invalid object key '{key}'")));
        }
        Ok(self.root.join(relative))
    }

    async fn meta_for(&self, key: &str, path: &Path) -> Result<Option<ObjectMeta>> {
        let body = match tokio::fs::read(path).await {
            Ok(body) => body,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(ChatlakeError::io(path, e)),
        };
        let modified = tokio::fs::metadata(path)
            .await
            .and_then(|m| m.modified())
            .map_err(|e| ChatlakeError::io(path, e))?;
        Ok(Some(ObjectMeta {
            key: key.to_string(),
            size: body.len() as u64,
            etag: content_etag(&body),
            last_modified: DateTime::<Utc>::from(modified),
        }))
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn put(&self, key: &str, body: &[u8], content_type: &str) -> Result<ObjectMeta> {
        let target = self.path_for(key)?;
        let write_err = |e: std::io::Error| ChatlakeError::export_write(key, e.to_string());

        let parent = target
            .parent()
            .ok_or_else(|| ChatlakeError::export_write(key, "key has no parent directory"))?;
        tokio::fs::create_dir_all(parent).await.map_err(write_err)?;

        let temp = parent.join(format!("{TEMP_PREFIX}{}", Uuid::now_v7()));
        tokio::fs::write(&temp, body).await.map_err(write_err)?;
        if let Err(e) = tokio::fs::rename(&temp, &target).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(write_err(e));
        }

        debug!(key, content_type, bytes = body.len(), "object written");
        Ok(ObjectMeta {
            key: key.to_string(),
            size: body.len() as u64,
            etag: content_etag(body),
            last_modified: Utc::now(),
        })
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(body) => Ok(Some(body)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ChatlakeError::io(path, e)),
        }
    }

    async fn head(&self, key: &str) -> Result<Option<ObjectMeta>> {
        let path = self.path_for(key)?;
        self.meta_for(key, &path).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let mut found = Vec::new();
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(ChatlakeError::io(&dir, e)),
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| ChatlakeError::io(&dir, e))?
            {
                let path = entry.path();
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| ChatlakeError::io(&path, e))?;
                if file_type.is_dir() {
                    pending.push(path);
                    continue;
                }
                if entry.file_name().to_string_lossy().starts_with(TEMP_PREFIX) {
                    continue;
                }
                let Some(key) = key_for(&self.root, &path) else {
                    continue;
                };
                if key.starts_with(prefix) {
                    if let Some(meta) = self.meta_for(&key, &path).await? {
                        found.push(meta);
                    }
                }
            }
        }

        found.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(found)
    }

    fn uri(&self, key: &str) -> String {
        format!("file://{}", self.root.join(key).display())
    }
}

/// Object key of a file under `root`, with `/` separators.
fn key_for(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Some(parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());

        let first = store
            .put("reports/a/2025-08-04/x.csv", b"one", "text/csv")
            .await
            .unwrap();
        let second = store
            .put("reports/a/2025-08-04/x.csv", b"two", "text/csv")
            .await
            .unwrap();
        assert_ne!(first.etag, second.etag);

        let body = store.get("reports/a/2025-08-04/x.csv").await.unwrap();
        assert_eq!(body.as_deref(), Some(&b"two"[..]));
        assert!(store.get("reports/a/missing.csv").await.unwrap().is_none());

        let head = store.head("reports/a/2025-08-04/x.csv").await.unwrap().unwrap();
        assert_eq!(head.etag, second.etag);
        assert_eq!(head.size, 3);
    }

    #[tokio::test]
    async fn list_filters_by_prefix_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());
        for key in [
            "reports/n/2025-08-05/x.csv",
            "reports/n/2025-08-04/x.csv",
            "reports/t/2025-08-04/y.csv",
        ] {
            store.put(key, b"data", "text/csv").await.unwrap();
        }
        // A stray in-flight write is never listed.
        std::fs::write(dir.path().join("reports/n/.tmp-abc"), b"partial").unwrap();

        let keys: Vec<String> = store
            .list("reports/n/")
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.key)
            .collect();
        assert_eq!(
            keys,
            vec!["reports/n/2025-08-04/x.csv", "reports/n/2025-08-05/x.csv"]
        );
    }

    #[tokio::test]
    async fn rejects_escaping_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());
        assert!(store.put("../evil.csv", b"x", "text/csv").await.is_err());
        assert!(store.put("/abs.csv", b"x", "text/csv").await.is_err());
        assert!(store.put("dir/", b"x", "text/csv").await.is_err());
    }

    #[test]
    fn etag_is_sha256_hex() {
        assert_eq!(
            content_etag(b"Hello World"),
            "a591a6d40bf420404a011733cfb7b190d62c65bf0bcda32b57b277d9ad9f146e"
        );
    }
}

//! Durable index metadata.
//!
//! Index definitions are stored as JSON objects under
//! `collections/{collection}/indexes/{name}.json` in an [`ObjectStore`]:
//! a local directory, MinIO/S3, or memory for tests.

use crate::errors::{Result, StoreError};
use crate::model::IndexEntry;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put_object(&self, key: &str, data: Bytes) -> Result<()>;

    /// `Ok(None)` when the key does not exist.
    async fn get_object(&self, key: &str) -> Result<Option<Bytes>>;

    async fn list_objects(&self, prefix: &str) -> Result<Vec<String>>;

    async fn delete_object(&self, key: &str) -> Result<()>;
}

fn storage_err(context: &str, e: impl std::fmt::Display) -> StoreError {
    StoreError::Storage(format!("{context}: {e}"))
}

/// Objects as files below a root directory.
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() || key.split('/').any(|part| part.is_empty() || part == "." || part == "..") {
            return Err(StoreError::validation(format!("invalid object key: {key}")));
        }
        Ok(self.root.join(key))
    }

    fn key_for(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let parts: Vec<&str> = relative.iter().map(|p| p.to_str()).collect::<Option<_>>()?;
        Some(parts.join("/"))
    }
}

#[async_trait]
impl ObjectStore for LocalStore {
    async fn put_object(&self, key: &str, data: Bytes) -> Result<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| storage_err("Failed to create directory", e))?;
        }
        // write-then-rename so readers never see a torn object
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &data)
            .await
            .map_err(|e| storage_err("Failed to write object", e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| storage_err("Failed to commit object", e))?;
        tracing::debug!("Stored object {} ({} bytes)", key, data.len());
        Ok(())
    }

    async fn get_object(&self, key: &str) -> Result<Option<Bytes>> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(storage_err("Failed to read object", e)),
        }
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut pending = vec![self.root.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(storage_err("Failed to list objects", e)),
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| storage_err("Failed to list objects", e))?
            {
                let path = entry.path();
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| storage_err("Failed to stat object", e))?;
                if file_type.is_dir() {
                    pending.push(path);
                } else if path.extension().map_or(true, |ext| ext != "tmp") {
                    if let Some(key) = self.key_for(&path) {
                        if key.starts_with(prefix) {
                            keys.push(key);
                        }
                    }
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(storage_err("Failed to delete object", e)),
        }
    }
}

/// Non-durable store, for tests and throwaway servers.
#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<BTreeMap<String, Bytes>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn put_object(&self, key: &str, data: Bytes) -> Result<()> {
        self.objects.lock().insert(key.to_string(), data);
        Ok(())
    }

    async fn get_object(&self, key: &str) -> Result<Option<Bytes>> {
        Ok(self.objects.lock().get(key).cloned())
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .objects
            .lock()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        self.objects.lock().remove(key);
        Ok(())
    }
}

/// Index definitions persisted alongside their collection.
#[derive(Clone)]
pub struct Catalog {
    store: Arc<dyn ObjectStore>,
}

impl Catalog {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    fn index_key(collection: &str, name: &str) -> String {
        format!("collections/{}/indexes/{}.json", collection, name)
    }

    pub async fn save_index(&self, entry: &IndexEntry) -> Result<()> {
        let data = serde_json::to_vec_pretty(entry)?;
        self.store
            .put_object(&Self::index_key(&entry.collection, &entry.name), data.into())
            .await
    }

    pub async fn load_index(&self, collection: &str, name: &str) -> Result<Option<IndexEntry>> {
        match self.store.get_object(&Self::index_key(collection, name)).await? {
            Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
            None => Ok(None),
        }
    }

    pub async fn delete_index(&self, collection: &str, name: &str) -> Result<()> {
        self.store.delete_object(&Self::index_key(collection, name)).await
    }

    /// Every persisted index definition, fetched concurrently.
    pub async fn load_all(&self) -> Result<Vec<IndexEntry>> {
        let keys: Vec<String> = self
            .store
            .list_objects("collections/")
            .await?
            .into_iter()
            .filter(|key| key.contains("/indexes/") && key.ends_with(".json"))
            .collect();
        let fetches = keys.iter().map(|key| self.store.get_object(key));
        let objects = futures::future::try_join_all(fetches).await?;

        let mut entries = Vec::new();
        for (key, data) in keys.iter().zip(objects) {
            let Some(data) = data else { continue };
            match serde_json::from_slice::<IndexEntry>(&data) {
                Ok(entry) => entries.push(entry),
                Err(e) => tracing::warn!("Skipping unreadable catalog entry {}: {}", key, e),
            }
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{IndexDefinition, Similarity};
    use chrono::Utc;

    fn entry(collection: &str, name: &str) -> IndexEntry {
        IndexEntry {
            collection: collection.to_string(),
            name: name.to_string(),
            definition: IndexDefinition::vector("embeddings", Similarity::Cosine, 10, 512),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_local_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::new(Arc::new(LocalStore::new(dir.path())));

        catalog.save_index(&entry("beans", "wholebeans_vec_search")).await.unwrap();
        catalog.save_index(&entry("digests", "digest_vec")).await.unwrap();

        let loaded = catalog.load_index("beans", "wholebeans_vec_search").await.unwrap().unwrap();
        assert_eq!(loaded.definition, entry("beans", "x").definition);

        let mut names: Vec<String> = catalog.load_all().await.unwrap().into_iter().map(|e| e.name).collect();
        names.sort();
        assert_eq!(names, vec!["digest_vec", "wholebeans_vec_search"]);

        catalog.delete_index("beans", "wholebeans_vec_search").await.unwrap();
        assert!(catalog.load_index("beans", "wholebeans_vec_search").await.unwrap().is_none());
        // deleting twice is fine
        catalog.delete_index("beans", "wholebeans_vec_search").await.unwrap();
    }

    #[tokio::test]
    async fn test_local_store_rejects_escaping_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path());
        assert!(store.put_object("../evil.json", Bytes::from_static(b"{}")).await.is_err());
        assert!(store.get_object("a//b").await.is_err());
    }

    #[test]
    fn test_memory_store_listing() {
        tokio_test::block_on(async {
            let store = MemoryStore::new();
            store.put_object("collections/a/indexes/x.json", Bytes::from_static(b"{}")).await.unwrap();
            store.put_object("other/y.json", Bytes::from_static(b"{}")).await.unwrap();
            let keys = store.list_objects("collections/").await.unwrap();
            assert_eq!(keys, vec!["collections/a/indexes/x.json"]);
        });
    }
}

use crate::catalog::Catalog;
use crate::collection::Collection;
use crate::errors::{Result, StoreError};
use crate::indexer::IndexManager;
use crate::metadata_filter::MetadataFilter;
use crate::metrics::{get_metrics_collector, OperationType};
use crate::model::*;
use crate::query::{self, SearchSettings};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// All collections of one server plus the index manager that owns their
/// index definitions.
pub struct Database {
    collections: RwLock<HashMap<String, Arc<Collection>>>,
    indexer: IndexManager,
    settings: SearchSettings,
}

impl Database {
    pub fn new(catalog: Catalog, settings: SearchSettings) -> Self {
        Self {
            collections: RwLock::new(HashMap::new()),
            indexer: IndexManager::new(catalog),
            settings,
        }
    }

    /// Open a database and reinstall every index definition found in the
    /// catalog. Indexes start empty since documents are not persisted.
    pub async fn open(catalog: Catalog, settings: SearchSettings) -> Result<Self> {
        let db = Self::new(catalog, settings);
        let entries = db.indexer.catalog().load_all().await?;
        let mut restored = 0;
        for entry in entries {
            let collection = db.collection(&entry.collection)?;
            match collection.install_index(&entry.name, &entry.definition) {
                Ok(_) => restored += 1,
                Err(e) => tracing::warn!(
                    "Skipping persisted index {}.{}: {}",
                    entry.collection,
                    entry.name,
                    e
                ),
            }
        }
        tracing::info!("Restored {} index definitions from catalog", restored);
        Ok(db)
    }

    pub fn settings(&self) -> &SearchSettings {
        &self.settings
    }

    pub fn catalog(&self) -> &Catalog {
        self.indexer.catalog()
    }

    /// The named collection, created on first use.
    pub fn collection(&self, name: &str) -> Result<Arc<Collection>> {
        validate_collection_name(name)?;
        if let Some(existing) = self.collections.read().get(name) {
            return Ok(Arc::clone(existing));
        }
        let mut collections = self.collections.write();
        let collection = collections
            .entry(name.to_string())
            .or_insert_with(|| {
                tracing::debug!("Creating collection {}", name);
                Arc::new(Collection::new(name))
            });
        Ok(Arc::clone(collection))
    }

    pub fn existing(&self, name: &str) -> Option<Arc<Collection>> {
        self.collections.read().get(name).cloned()
    }

    pub fn collection_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.collections.read().keys().cloned().collect();
        names.sort();
        names
    }

    fn require(&self, name: &str) -> Result<Arc<Collection>> {
        self.existing(name)
            .ok_or_else(|| StoreError::not_found(format!("collection {name}")))
    }

    // ---- indexes ----

    pub async fn create_index(&self, collection: &str, name: &str, definition: IndexDefinition) -> Result<bool> {
        let collection = self.collection(collection)?;
        self.indexer.create_index(&collection, name, definition).await
    }

    pub async fn drop_index(&self, collection: &str, name: &str) -> Result<()> {
        let collection = self.require(collection)?;
        self.indexer.drop_index(&collection, name).await
    }

    pub async fn rebuild_index(&self, collection: &str, name: &str, num_lists: Option<usize>) -> Result<IndexStats> {
        let collection = self.require(collection)?;
        self.indexer.rebuild_index(&collection, name, num_lists).await
    }

    pub fn list_indexes(&self, collection: &str) -> Vec<IndexInfo> {
        self.existing(collection)
            .map(|c| self.indexer.list_indexes(&c))
            .unwrap_or_default()
    }

    // ---- documents ----

    pub fn insert_many(&self, collection: &str, docs: Vec<Document>) -> Result<Vec<DocId>> {
        let start = Instant::now();
        let collection = self.collection(collection)?;
        let result = collection.insert_many(docs);
        let count = result.as_ref().map_or(0, Vec::len);
        get_metrics_collector().record(
            OperationType::DocumentWrite,
            collection.name(),
            start.elapsed(),
            count,
            result.is_err(),
        );
        result
    }

    pub fn update(&self, collection: &str, id: &str, patch: DocumentPatch) -> Result<Document> {
        let start = Instant::now();
        let collection = self.require(collection)?;
        let result = collection.update(id, patch);
        get_metrics_collector().record(
            OperationType::DocumentWrite,
            collection.name(),
            start.elapsed(),
            usize::from(result.is_ok()),
            result.is_err(),
        );
        result
    }

    pub fn delete(&self, collection: &str, id: &str) -> Result<()> {
        let collection = self.require(collection)?;
        if collection.delete(id) {
            Ok(())
        } else {
            Err(StoreError::not_found(format!("document {} in {}", id, collection.name())))
        }
    }

    pub fn delete_many(&self, collection: &str, filter: Option<&serde_json::Value>) -> Result<usize> {
        let filter = MetadataFilter::parse(filter)?;
        Ok(self
            .existing(collection)
            .map_or(0, |c| c.delete_many(filter.as_ref())))
    }

    pub fn get(&self, collection: &str, id: &str) -> Result<Document> {
        self.existing(collection)
            .and_then(|c| c.get(id))
            .ok_or_else(|| StoreError::not_found(format!("document {id} in {collection}")))
    }

    /// Missing collections count as empty.
    pub fn count(&self, collection: &str, filter: Option<&serde_json::Value>) -> Result<usize> {
        let filter = MetadataFilter::parse(filter)?;
        Ok(self
            .existing(collection)
            .map_or(0, |c| c.count(filter.as_ref())))
    }

    pub fn find(&self, collection: &str, req: &FindRequest) -> Result<Vec<Document>> {
        let start = Instant::now();
        let filter = MetadataFilter::parse(req.filter.as_ref())?;
        let Some(target) = self.existing(collection) else {
            return match &req.hint {
                Some(hint) => Err(StoreError::not_found(format!("scalar index {hint} in {collection}"))),
                None => Ok(Vec::new()),
            };
        };
        let result = target.find(filter.as_ref(), req.hint.as_deref(), req.limit);
        get_metrics_collector().record(
            OperationType::ScalarQuery,
            collection,
            start.elapsed(),
            result.as_ref().map_or(0, Vec::len),
            result.is_err(),
        );
        result
    }

    pub fn documents(&self, collection: &str) -> Vec<Document> {
        self.existing(collection)
            .map(|c| c.documents())
            .unwrap_or_default()
    }

    // ---- search ----

    /// Vector search. Scoring runs on the blocking pool against an index
    /// snapshot.
    pub async fn search(&self, collection: &str, req: SearchRequest) -> Result<SearchResponse> {
        let target = self.existing(collection).ok_or_else(|| StoreError::IndexNotFound {
            collection: collection.to_string(),
            field: req.field.clone(),
        })?;
        let settings = self.settings.clone();
        tokio::task::spawn_blocking(move || query::search(&target, &req, &settings))
            .await
            .map_err(|e| StoreError::Storage(format!("search task failed: {e}")))?
    }
}

fn validate_collection_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains('/') || name.starts_with('.') {
        return Err(StoreError::validation(format!("invalid collection name: {name:?}")));
    }
    Ok(())
}

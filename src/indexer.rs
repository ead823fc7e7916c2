use crate::catalog::Catalog;
use crate::collection::Collection;
use crate::errors::{Result, StoreError};
use crate::metrics::{get_metrics_collector, OperationType};
use crate::model::*;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

type IndexLock = Arc<tokio::sync::Mutex<()>>;

/// Creates, drops and rebuilds named indexes. Operations on the same
/// `(collection, name)` are serialised; the catalog is written before an
/// index is installed.
pub struct IndexManager {
    catalog: Catalog,
    locks: Mutex<HashMap<(String, String), IndexLock>>,
}

impl IndexManager {
    pub fn new(catalog: Catalog) -> Self {
        Self {
            catalog,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    fn lock_for(&self, collection: &str, name: &str) -> IndexLock {
        let mut locks = self.locks.lock();
        locks
            .entry((collection.to_string(), name.to_string()))
            .or_default()
            .clone()
    }

    /// Forget the lock for `(collection, name)` unless someone else holds or
    /// waits on it. Callers must have dropped their own handle.
    fn release_lock(&self, collection: &str, name: &str) {
        let mut locks = self.locks.lock();
        let key = (collection.to_string(), name.to_string());
        if locks.get(&key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(&key);
        }
    }

    /// Create `name` on `collection`. Returns `Ok(false)` when an identical
    /// index already exists.
    pub async fn create_index(
        &self,
        collection: &Arc<Collection>,
        name: &str,
        definition: IndexDefinition,
    ) -> Result<bool> {
        let _measurement = crate::measure_operation!("indexer.create_index");
        let start = Instant::now();
        definition.validate()?;

        let lock = self.lock_for(collection.name(), name);
        let _guard = lock.lock().await;

        if collection.check_new_index(name, &definition)? {
            tracing::info!("Index {}.{} already exists", collection.name(), name);
            return Ok(false);
        }

        let entry = IndexEntry {
            collection: collection.name().to_string(),
            name: name.to_string(),
            definition: definition.clone(),
            created_at: Utc::now(),
        };
        self.catalog.save_index(&entry).await?;

        let target = Arc::clone(collection);
        let index_name = name.to_string();
        let result = tokio::task::spawn_blocking(move || target.install_index(&index_name, &definition))
            .await
            .map_err(|e| StoreError::Storage(format!("index build task failed: {e}")))
            .and_then(|r| r);

        let stats = match result {
            Ok(stats) => stats,
            Err(e) => {
                tracing::error!("Failed to build index {}.{}: {}", collection.name(), name, e);
                if let Err(cleanup) = self.catalog.delete_index(collection.name(), name).await {
                    tracing::warn!("Could not remove catalog entry for {}.{}: {}", collection.name(), name, cleanup);
                }
                get_metrics_collector().record(OperationType::IndexCreation, collection.name(), start.elapsed(), 0, true);
                return Err(e);
            }
        };

        get_metrics_collector().record(
            OperationType::IndexCreation,
            collection.name(),
            start.elapsed(),
            stats.indexed,
            false,
        );
        tracing::info!(
            "Created index {}.{} ({} indexed, {} rejected, {} partitions)",
            collection.name(),
            name,
            stats.indexed,
            stats.rejected,
            stats.partitions
        );
        Ok(true)
    }

    pub async fn drop_index(&self, collection: &Collection, name: &str) -> Result<()> {
        let _measurement = crate::measure_operation!("indexer.drop_index");
        let lock = self.lock_for(collection.name(), name);
        let result = {
            let _guard = lock.lock().await;
            self.drop_locked(collection, name).await
        };
        drop(lock);
        self.release_lock(collection.name(), name);
        result
    }

    async fn drop_locked(&self, collection: &Collection, name: &str) -> Result<()> {
        let start = Instant::now();
        if collection.index_definition(name).is_none() {
            return Err(StoreError::not_found(format!("index {} in {}", name, collection.name())));
        }
        self.catalog.delete_index(collection.name(), name).await?;
        collection.remove_index(name);

        get_metrics_collector().record(OperationType::IndexDrop, collection.name(), start.elapsed(), 1, false);
        tracing::info!("Dropped index {}.{}", collection.name(), name);
        Ok(())
    }

    /// Retrain `name`, optionally with a new partition count. The new count
    /// is persisted before the rebuilt snapshot is published.
    pub async fn rebuild_index(
        &self,
        collection: &Arc<Collection>,
        name: &str,
        num_lists: Option<usize>,
    ) -> Result<IndexStats> {
        let _measurement = crate::measure_operation!("indexer.rebuild_index");
        let start = Instant::now();
        let lock = self.lock_for(collection.name(), name);
        let _guard = lock.lock().await;

        let current = collection
            .index_definition(name)
            .ok_or_else(|| StoreError::not_found(format!("index {} in {}", name, collection.name())))?;

        if let (IndexDefinition::VectorIvf(opts), Some(n)) = (&current, num_lists) {
            if n != opts.num_lists {
                let definition = IndexDefinition::VectorIvf(VectorOptions {
                    num_lists: n,
                    ..opts.clone()
                });
                definition.validate()?;
                let created_at = self
                    .catalog
                    .load_index(collection.name(), name)
                    .await?
                    .map_or_else(Utc::now, |e| e.created_at);
                self.catalog
                    .save_index(&IndexEntry {
                        collection: collection.name().to_string(),
                        name: name.to_string(),
                        definition,
                        created_at,
                    })
                    .await?;
            }
        }

        let target = Arc::clone(collection);
        let index_name = name.to_string();
        let stats = tokio::task::spawn_blocking(move || target.rebuild_index(&index_name, num_lists))
            .await
            .map_err(|e| StoreError::Storage(format!("index rebuild task failed: {e}")))??;

        get_metrics_collector().record(
            OperationType::IndexRebuild,
            collection.name(),
            start.elapsed(),
            stats.indexed,
            false,
        );
        Ok(stats)
    }

    pub fn list_indexes(&self, collection: &Collection) -> Vec<IndexInfo> {
        collection.index_infos()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn beans() -> Arc<Collection> {
        let beans = Collection::new("beans");
        beans
            .insert_many(vec![
                Document::new("a").with_field("url", json!("https://a")).with_embedding("embeddings", vec![1.0, 0.0]),
                Document::new("b").with_field("url", json!("https://b")).with_embedding("embeddings", vec![0.0, 1.0]),
            ])
            .unwrap();
        Arc::new(beans)
    }

    fn vec_def(dims: usize) -> IndexDefinition {
        IndexDefinition::vector("embeddings", Similarity::Cosine, 10, dims)
    }

    #[tokio::test]
    async fn test_create_is_idempotent_and_persisted() {
        let manager = IndexManager::new(Catalog::in_memory());
        let beans = beans();

        assert!(manager.create_index(&beans, "vec", vec_def(2)).await.unwrap());
        assert!(!manager.create_index(&beans, "vec", vec_def(2)).await.unwrap());
        assert_eq!(manager.list_indexes(&beans).len(), 1);

        let entry = manager.catalog().load_index("beans", "vec").await.unwrap().unwrap();
        assert_eq!(entry.definition, vec_def(2));
    }

    #[tokio::test]
    async fn test_conflicting_definition_leaves_catalog_untouched() {
        let manager = IndexManager::new(Catalog::in_memory());
        let beans = beans();
        manager.create_index(&beans, "vec", vec_def(2)).await.unwrap();

        let err = manager.create_index(&beans, "vec", vec_def(3)).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
        let entry = manager.catalog().load_index("beans", "vec").await.unwrap().unwrap();
        assert_eq!(entry.definition, vec_def(2));
    }

    #[tokio::test]
    async fn test_invalid_definition_is_rejected() {
        let manager = IndexManager::new(Catalog::in_memory());
        let beans = beans();
        let err = manager.create_index(&beans, "vec", vec_def(0)).await.unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
        assert!(manager.catalog().load_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_drop_missing_then_recreate() {
        let manager = IndexManager::new(Catalog::in_memory());
        let beans = beans();
        assert!(matches!(
            manager.drop_index(&beans, "vec").await,
            Err(StoreError::NotFound(_))
        ));

        manager.create_index(&beans, "vec", vec_def(2)).await.unwrap();
        manager.drop_index(&beans, "vec").await.unwrap();
        assert!(manager.catalog().load_index("beans", "vec").await.unwrap().is_none());
        assert!(beans.search_snapshot("embeddings", None).is_err());

        manager.create_index(&beans, "vec", vec_def(2)).await.unwrap();
        assert!(beans.search_snapshot("embeddings", None).is_ok());
    }

    #[tokio::test]
    async fn test_drop_releases_index_lock() {
        let manager = IndexManager::new(Catalog::in_memory());
        let beans = beans();
        manager.create_index(&beans, "vec", vec_def(2)).await.unwrap();
        manager.drop_index(&beans, "vec").await.unwrap();
        assert!(manager.drop_index(&beans, "vec").await.is_err());
        assert!(manager.locks.lock().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_identical_creates_build_once() {
        let manager = Arc::new(IndexManager::new(Catalog::in_memory()));
        let beans = beans();
        let tasks: Vec<_> = (0..2)
            .map(|_| {
                let manager = Arc::clone(&manager);
                let beans = Arc::clone(&beans);
                tokio::spawn(async move { manager.create_index(&beans, "vec", vec_def(2)).await })
            })
            .collect();

        let mut created = 0;
        for task in tasks {
            if task.await.unwrap().unwrap() {
                created += 1;
            }
        }
        assert_eq!(created, 1);
        assert_eq!(manager.list_indexes(&beans).len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_conflicting_creates_keep_winner() {
        let manager = Arc::new(IndexManager::new(Catalog::in_memory()));
        let beans = beans();
        let tasks: Vec<_> = [vec_def(2), vec_def(3)]
            .into_iter()
            .map(|definition| {
                let manager = Arc::clone(&manager);
                let beans = Arc::clone(&beans);
                let expected = definition.clone();
                tokio::spawn(async move { (expected, manager.create_index(&beans, "vec", definition).await) })
            })
            .collect();

        let mut winner = None;
        let mut conflicts = 0;
        for task in tasks {
            match task.await.unwrap() {
                (definition, Ok(true)) => winner = Some(definition),
                (_, Err(StoreError::Conflict { .. })) => conflicts += 1,
                (_, other) => panic!("unexpected outcome {other:?}"),
            }
        }
        assert_eq!(conflicts, 1);
        let winner = winner.unwrap();
        let entry = manager.catalog().load_index("beans", "vec").await.unwrap().unwrap();
        assert_eq!(entry.definition, winner);
        assert_eq!(beans.index_definition("vec").unwrap(), winner);
    }

    #[tokio::test]
    async fn test_rebuild_persists_new_partition_count() {
        let manager = IndexManager::new(Catalog::in_memory());
        let beans = beans();
        manager.create_index(&beans, "vec", vec_def(2)).await.unwrap();

        manager.rebuild_index(&beans, "vec", Some(4)).await.unwrap();
        let entry = manager.catalog().load_index("beans", "vec").await.unwrap().unwrap();
        assert_eq!(entry.definition.vector_options().unwrap().num_lists, 4);

        let scalar = IndexDefinition::scalar([("url", SortDirection::Ascending)]);
        manager.create_index(&beans, "url_1", scalar).await.unwrap();
        assert!(matches!(
            manager.rebuild_index(&beans, "url_1", Some(2)).await,
            Err(StoreError::Validation(_))
        ));
    }
}

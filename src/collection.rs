use crate::errors::{Result, StoreError};
use crate::ivf::IvfIndex;
use crate::metadata_filter::MetadataFilter;
use crate::model::*;
use crate::scalar::ScalarIndex;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

enum IndexSlot {
    Scalar {
        keys: Vec<ScalarKeyField>,
        index: ScalarIndex,
    },
    /// Published snapshot. Writers replace the `Arc`; searches keep whatever
    /// snapshot they cloned.
    Vector(Arc<IvfIndex>),
}

impl IndexSlot {
    fn definition(&self) -> IndexDefinition {
        match self {
            IndexSlot::Scalar { keys, .. } => IndexDefinition::Scalar { keys: keys.clone() },
            IndexSlot::Vector(ivf) => IndexDefinition::VectorIvf(ivf.options().clone()),
        }
    }

    fn stats(&self) -> IndexStats {
        match self {
            IndexSlot::Scalar { index, .. } => IndexStats {
                indexed: index.len(),
                rejected: 0,
                trained: false,
                partitions: 0,
            },
            IndexSlot::Vector(ivf) => ivf.stats(),
        }
    }
}

#[derive(Default)]
struct CollectionState {
    docs: BTreeMap<DocId, Document>,
    indexes: BTreeMap<String, IndexSlot>,
}

impl CollectionState {
    fn vector_options(&self) -> impl Iterator<Item = &VectorOptions> + '_ {
        self.indexes.values().filter_map(|slot| match slot {
            IndexSlot::Vector(ivf) => Some(ivf.options()),
            IndexSlot::Scalar { .. } => None,
        })
    }

    fn check_dimensions(&self, embeddings: &BTreeMap<String, Vec<f32>>) -> Result<()> {
        for opts in self.vector_options() {
            if let Some(vector) = embeddings.get(&opts.field) {
                if vector.len() != opts.dimensions {
                    return Err(StoreError::DimensionMismatch {
                        expected: opts.dimensions,
                        actual: vector.len(),
                    });
                }
            }
        }
        Ok(())
    }

    fn raw_vectors(&self, field: &str) -> Vec<(DocId, Vec<f32>)> {
        self.docs
            .values()
            .filter_map(|doc| doc.embeddings.get(field).map(|v| (doc.id.clone(), v.clone())))
            .collect()
    }

    fn vector_index_on(&self, field: &str) -> Option<(&String, &Arc<IvfIndex>)> {
        self.indexes.iter().find_map(|(name, slot)| match slot {
            IndexSlot::Vector(ivf) if ivf.options().field == field => Some((name, ivf)),
            _ => None,
        })
    }

    /// Add a document to every index. A vector of the wrong dimensionality
    /// (left over from before its index existed) stays rejected.
    fn index_document(&mut self, doc: &Document) {
        for slot in self.indexes.values_mut() {
            match slot {
                IndexSlot::Scalar { index, .. } => index.insert(doc),
                IndexSlot::Vector(ivf) => {
                    if let Some(vector) = doc.embeddings.get(&ivf.options().field) {
                        Arc::make_mut(ivf).insert(doc.id.clone(), vector);
                    }
                }
            }
        }
    }

    fn unindex_document(&mut self, doc: &Document) {
        for slot in self.indexes.values_mut() {
            match slot {
                IndexSlot::Scalar { index, .. } => {
                    index.remove(&doc.id);
                }
                IndexSlot::Vector(ivf) => {
                    if let Some(vector) = doc.embeddings.get(&ivf.options().field) {
                        Arc::make_mut(ivf).remove(&doc.id, vector);
                    }
                }
            }
        }
    }

    fn train_pending(&mut self) {
        for slot in self.indexes.values_mut() {
            if let IndexSlot::Vector(ivf) = slot {
                if !ivf.is_trained() && ivf.len() >= crate::ivf::training_threshold(ivf.options().num_lists) {
                    Arc::make_mut(ivf).maybe_train();
                }
            }
        }
    }
}

/// A named set of documents and the indexes over them.
pub struct Collection {
    name: String,
    state: RwLock<CollectionState>,
}

impl Collection {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: RwLock::new(CollectionState::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.state.read().docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().docs.is_empty()
    }

    // ---- indexes ----

    pub fn index_definition(&self, name: &str) -> Option<IndexDefinition> {
        self.state.read().indexes.get(name).map(IndexSlot::definition)
    }

    pub fn index_names(&self) -> Vec<String> {
        self.state.read().indexes.keys().cloned().collect()
    }

    pub fn index_infos(&self) -> Vec<IndexInfo> {
        self.state
            .read()
            .indexes
            .iter()
            .map(|(name, slot)| IndexInfo {
                name: name.clone(),
                definition: slot.definition(),
                stats: slot.stats(),
            })
            .collect()
    }

    /// Decide whether `definition` can be installed as `name`. Returns
    /// `Ok(true)` when an identical index already exists.
    pub fn check_new_index(&self, name: &str, definition: &IndexDefinition) -> Result<bool> {
        check_new_index(&self.state.read(), name, definition)
    }

    /// Build and install an index. Training runs without holding the lock;
    /// the final assignment of vectors happens under the write lock so no
    /// concurrent insert is missed.
    pub fn install_index(&self, name: &str, definition: &IndexDefinition) -> Result<IndexStats> {
        definition.validate()?;
        let centroids = match definition {
            IndexDefinition::VectorIvf(opts) => {
                let raw = self.state.read().raw_vectors(&opts.field);
                let (entries, _) = IvfIndex::prepare_entries(opts, raw);
                IvfIndex::train(opts, &entries)
            }
            IndexDefinition::Scalar { .. } => None,
        };

        let mut state = self.state.write();
        if check_new_index(&state, name, definition)? {
            return Ok(state.indexes[name].stats());
        }
        let slot = match definition {
            IndexDefinition::Scalar { keys } => IndexSlot::Scalar {
                keys: keys.clone(),
                index: ScalarIndex::build(keys.clone(), state.docs.values()),
            },
            IndexDefinition::VectorIvf(opts) => {
                let (entries, rejected) = IvfIndex::prepare_entries(opts, state.raw_vectors(&opts.field));
                let mut ivf = IvfIndex::assemble(opts.clone(), centroids, entries, rejected);
                ivf.maybe_train();
                IndexSlot::Vector(Arc::new(ivf))
            }
        };
        let stats = slot.stats();
        state.indexes.insert(name.to_string(), slot);
        tracing::info!(
            "Installed index {}.{}: {} entries, {} rejected",
            self.name,
            name,
            stats.indexed,
            stats.rejected
        );
        Ok(stats)
    }

    pub fn remove_index(&self, name: &str) -> bool {
        self.state.write().indexes.remove(name).is_some()
    }

    /// Rebuild an index from the current documents. For vector indexes
    /// `num_lists` replaces the partition count; in-flight searches keep the
    /// old snapshot.
    pub fn rebuild_index(&self, name: &str, num_lists: Option<usize>) -> Result<IndexStats> {
        let definition = self
            .index_definition(name)
            .ok_or_else(|| StoreError::not_found(format!("index {} in {}", name, self.name)))?;

        match definition {
            IndexDefinition::Scalar { keys } => {
                if num_lists.is_some() {
                    return Err(StoreError::validation("numLists only applies to vector indexes"));
                }
                let mut state = self.state.write();
                let index = ScalarIndex::build(keys.clone(), state.docs.values());
                let slot = IndexSlot::Scalar { keys, index };
                let stats = slot.stats();
                state.indexes.insert(name.to_string(), slot);
                Ok(stats)
            }
            IndexDefinition::VectorIvf(mut opts) => {
                if let Some(n) = num_lists {
                    opts.num_lists = n;
                }
                IndexDefinition::VectorIvf(opts.clone()).validate()?;

                let snapshot = self.vector_snapshot(name)?;
                let centroids = IvfIndex::train(&opts, &snapshot.entries());

                let mut state = self.state.write();
                if !state.indexes.contains_key(name) {
                    return Err(StoreError::not_found(format!("index {} in {}", name, self.name)));
                }
                let (entries, rejected) = IvfIndex::prepare_entries(&opts, state.raw_vectors(&opts.field));
                let mut ivf = IvfIndex::assemble(opts, centroids, entries, rejected);
                ivf.maybe_train();
                let stats = ivf.stats();
                state.indexes.insert(name.to_string(), IndexSlot::Vector(Arc::new(ivf)));
                tracing::info!("Rebuilt index {}.{}: {} partitions", self.name, name, stats.partitions);
                Ok(stats)
            }
        }
    }

    fn vector_snapshot(&self, name: &str) -> Result<Arc<IvfIndex>> {
        match self.state.read().indexes.get(name) {
            Some(IndexSlot::Vector(ivf)) => Ok(Arc::clone(ivf)),
            _ => Err(StoreError::not_found(format!("vector index {} in {}", name, self.name))),
        }
    }

    /// The vector index on `field` plus, when a filter is given, the ids that
    /// pass it. Both are taken under one read lock.
    pub fn search_snapshot(
        &self,
        field: &str,
        filter: Option<&MetadataFilter>,
    ) -> Result<(String, Arc<IvfIndex>, Option<HashSet<DocId>>)> {
        let state = self.state.read();
        let (name, ivf) = state.vector_index_on(field).ok_or_else(|| StoreError::IndexNotFound {
            collection: self.name.clone(),
            field: field.to_string(),
        })?;
        let allowed = filter.map(|f| f.pre_filter_ids(state.docs.values()));
        Ok((name.clone(), Arc::clone(ivf), allowed))
    }

    // ---- documents ----

    /// Insert documents whose ids are not present yet. The batch is rejected
    /// as a whole if any embedding violates an index's dimensionality.
    pub fn insert_many(&self, docs: Vec<Document>) -> Result<Vec<DocId>> {
        let mut state = self.state.write();
        for doc in &docs {
            state.check_dimensions(&doc.embeddings)?;
        }

        let mut inserted = Vec::new();
        for doc in docs {
            if state.docs.contains_key(&doc.id) {
                tracing::debug!("[{}] skipping existing document {}", self.name, doc.id);
                continue;
            }
            state.index_document(&doc);
            inserted.push(doc.id.clone());
            state.docs.insert(doc.id.clone(), doc);
        }
        state.train_pending();
        tracing::debug!("[{}]: {} items inserted", self.name, inserted.len());
        Ok(inserted)
    }

    pub fn update(&self, id: &str, patch: DocumentPatch) -> Result<Document> {
        let mut state = self.state.write();
        state.check_dimensions(&patch.embeddings)?;
        let old = state
            .docs
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::not_found(format!("document {} in {}", id, self.name)))?;

        let mut updated = old.clone();
        updated.fields.extend(patch.fields);
        updated.embeddings.extend(patch.embeddings);

        state.unindex_document(&old);
        state.index_document(&updated);
        state.docs.insert(updated.id.clone(), updated.clone());
        state.train_pending();
        Ok(updated)
    }

    pub fn delete(&self, id: &str) -> bool {
        let mut state = self.state.write();
        match state.docs.remove(id) {
            Some(doc) => {
                state.unindex_document(&doc);
                true
            }
            None => false,
        }
    }

    pub fn delete_many(&self, filter: Option<&MetadataFilter>) -> usize {
        let mut state = self.state.write();
        let doomed: Vec<DocId> = state
            .docs
            .values()
            .filter(|doc| filter.map_or(true, |f| f.matches(doc)))
            .map(|doc| doc.id.clone())
            .collect();
        for id in &doomed {
            if let Some(doc) = state.docs.remove(id) {
                state.unindex_document(&doc);
            }
        }
        tracing::debug!("[{}]: {} items deleted", self.name, doomed.len());
        doomed.len()
    }

    pub fn get(&self, id: &str) -> Option<Document> {
        self.state.read().docs.get(id).cloned()
    }

    pub fn count(&self, filter: Option<&MetadataFilter>) -> usize {
        let state = self.state.read();
        match filter {
            Some(f) => state.docs.values().filter(|doc| f.matches(doc)).count(),
            None => state.docs.len(),
        }
    }

    /// Matching documents in id order, or in the order of the scalar index
    /// named by `hint`.
    pub fn find(
        &self,
        filter: Option<&MetadataFilter>,
        hint: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<Document>> {
        let state = self.state.read();
        let limit = limit.unwrap_or(usize::MAX);
        let keep = |doc: &&Document| filter.map_or(true, |f| f.matches(doc));

        let docs: Vec<Document> = match hint {
            None => state.docs.values().filter(keep).take(limit).cloned().collect(),
            Some(name) => match state.indexes.get(name) {
                Some(IndexSlot::Scalar { index, .. }) => index
                    .ids()
                    .filter_map(|id| state.docs.get(id))
                    .filter(keep)
                    .take(limit)
                    .cloned()
                    .collect(),
                _ => {
                    return Err(StoreError::not_found(format!(
                        "scalar index {} in {}",
                        name, self.name
                    )))
                }
            },
        };
        Ok(docs)
    }

    /// Documents for the given ids, projected to `fields`.
    pub fn project(&self, ids: &[DocId], fields: &[String]) -> Vec<Option<serde_json::Map<String, serde_json::Value>>> {
        let state = self.state.read();
        ids.iter()
            .map(|id| state.docs.get(id).map(|doc| doc.project(fields)))
            .collect()
    }

    pub fn documents(&self) -> Vec<Document> {
        self.state.read().docs.values().cloned().collect()
    }
}

fn check_new_index(state: &CollectionState, name: &str, definition: &IndexDefinition) -> Result<bool> {
    if name.is_empty() {
        return Err(StoreError::validation("index name must not be empty"));
    }
    if let Some(existing) = state.indexes.get(name) {
        return if existing.definition() == *definition {
            Ok(true)
        } else {
            Err(StoreError::Conflict { name: name.to_string() })
        };
    }
    if let IndexDefinition::VectorIvf(opts) = definition {
        if let Some((other, _)) = state.vector_index_on(&opts.field) {
            tracing::warn!("Field {} already has vector index {}", opts.field, other);
            return Err(StoreError::Conflict { name: other.clone() });
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn beans() -> Collection {
        let beans = Collection::new("beans");
        beans
            .insert_many(vec![
                Document::new("a").with_field("kind", json!("news")).with_embedding("embeddings", vec![1.0, 0.0]),
                Document::new("b").with_field("kind", json!("blog")).with_embedding("embeddings", vec![0.0, 1.0]),
                Document::new("c").with_field("kind", json!("news")).with_embedding("embeddings", vec![0.7, 0.7]),
                Document::new("d").with_field("kind", json!("news")),
            ])
            .unwrap();
        beans
    }

    fn vec_def(dims: usize) -> IndexDefinition {
        IndexDefinition::vector("embeddings", Similarity::Cosine, 2, dims)
    }

    #[test]
    fn test_insert_skips_existing_ids() {
        let beans = beans();
        let inserted = beans
            .insert_many(vec![Document::new("a"), Document::new("e")])
            .unwrap();
        assert_eq!(inserted, vec!["e".to_string()]);
        assert_eq!(beans.len(), 5);
    }

    #[test]
    fn test_install_counts_rejected_documents() {
        let beans = beans();
        beans
            .insert_many(vec![Document::new("short").with_embedding("embeddings", vec![1.0])])
            .unwrap();
        let stats = beans.install_index("vec", &vec_def(2)).unwrap();
        assert_eq!(stats.indexed, 3);
        assert_eq!(stats.rejected, 1);
    }

    #[test]
    fn test_insert_rejects_wrong_dimension_batch() {
        let beans = beans();
        beans.install_index("vec", &vec_def(2)).unwrap();
        let err = beans
            .insert_many(vec![
                Document::new("ok").with_embedding("embeddings", vec![1.0, 1.0]),
                Document::new("bad").with_embedding("embeddings", vec![1.0, 1.0, 1.0]),
            ])
            .unwrap_err();
        assert!(matches!(err, StoreError::DimensionMismatch { expected: 2, actual: 3 }));
        assert!(beans.get("ok").is_none());
    }

    #[test]
    fn test_check_new_index_conflicts() {
        let beans = beans();
        beans.install_index("vec", &vec_def(2)).unwrap();
        assert!(beans.check_new_index("vec", &vec_def(2)).unwrap());
        assert!(matches!(
            beans.check_new_index("vec", &vec_def(3)),
            Err(StoreError::Conflict { .. })
        ));
        assert!(matches!(
            beans.check_new_index("other_vec", &vec_def(2)),
            Err(StoreError::Conflict { .. })
        ));
    }

    #[test]
    fn test_update_reindexes_vectors() {
        let beans = beans();
        beans.install_index("vec", &vec_def(2)).unwrap();
        let mut patch = DocumentPatch::default();
        patch.embeddings.insert("embeddings".to_string(), vec![-1.0, 0.0]);
        patch.fields.insert("kind".to_string(), json!("opinion"));
        let updated = beans.update("a", patch).unwrap();
        assert_eq!(updated.fields["kind"], json!("opinion"));

        let (_, ivf, _) = beans.search_snapshot("embeddings", None).unwrap();
        let (hits, _) = ivf.search(&[-1.0, 0.0], 1, None, None);
        assert_eq!(hits[0].0, "a");
        assert_eq!(ivf.len(), 3);
    }

    #[test]
    fn test_field_update_keeps_rejected_vector_out_of_index() {
        let beans = Collection::new("beans");
        beans
            .insert_many(vec![
                Document::new("good").with_embedding("embeddings", vec![1.0, 0.0, 0.0]),
                Document::new("bad").with_embedding("embeddings", vec![1.0]),
            ])
            .unwrap();
        let stats = beans.install_index("vec", &vec_def(3)).unwrap();
        assert_eq!((stats.indexed, stats.rejected), (1, 1));

        let mut patch = DocumentPatch::default();
        patch.fields.insert("kind".to_string(), json!("news"));
        beans.update("bad", patch).unwrap();

        let stats = beans.index_infos()[0].stats.clone();
        assert_eq!((stats.indexed, stats.rejected), (1, 1));
        let (_, ivf, _) = beans.search_snapshot("embeddings", None).unwrap();
        let (hits, _) = ivf.search(&[1.0, 0.0, 0.0], 5, None, None);
        let ids: Vec<&str> = hits.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["good"]);
        assert!(ivf.entries().iter().all(|e| e.vector.len() == 3));

        // fixing the vector moves it from rejected to indexed
        let mut patch = DocumentPatch::default();
        patch.embeddings.insert("embeddings".to_string(), vec![0.0, 1.0, 0.0]);
        beans.update("bad", patch).unwrap();
        let stats = beans.index_infos()[0].stats.clone();
        assert_eq!((stats.indexed, stats.rejected), (2, 0));
    }

    #[test]
    fn test_deleting_rejected_document_updates_stats() {
        let beans = beans();
        beans
            .insert_many(vec![Document::new("short").with_embedding("embeddings", vec![1.0])])
            .unwrap();
        beans.install_index("vec", &vec_def(2)).unwrap();
        assert!(beans.delete("short"));
        let stats = beans.index_infos()[0].stats.clone();
        assert_eq!((stats.indexed, stats.rejected), (3, 0));
    }

    #[test]
    fn test_delete_keeps_indexes_consistent() {
        let beans = beans();
        beans.install_index("vec", &vec_def(2)).unwrap();
        assert!(beans.delete("a"));
        assert!(!beans.delete("a"));
        let (_, ivf, _) = beans.search_snapshot("embeddings", None).unwrap();
        assert_eq!(ivf.len(), 2);

        let news = MetadataFilter::new().equals("kind", json!("news"));
        assert_eq!(beans.delete_many(Some(&news)), 2);
        assert_eq!(beans.count(None), 1);
    }

    #[test]
    fn test_find_with_scalar_hint() {
        let beans = beans();
        beans
            .install_index(
                "kind_1",
                &IndexDefinition::scalar([("kind", SortDirection::Ascending)]),
            )
            .unwrap();
        let docs = beans.find(None, Some("kind_1"), Some(2)).unwrap();
        let ids: Vec<&str> = docs.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);

        assert!(matches!(
            beans.find(None, Some("missing"), None),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_search_snapshot_requires_vector_index() {
        let beans = beans();
        assert!(matches!(
            beans.search_snapshot("embeddings", None),
            Err(StoreError::IndexNotFound { .. })
        ));
    }

    #[test]
    fn test_rebuild_changes_partition_count() {
        let beans = Collection::new("beans");
        let docs: Vec<Document> = (0..120)
            .map(|i| {
                let angle = i as f32 * 0.05;
                Document::new(format!("doc{i:03}")).with_embedding("embeddings", vec![angle.cos(), angle.sin()])
            })
            .collect();
        beans.insert_many(docs).unwrap();
        beans
            .install_index("vec", &IndexDefinition::vector("embeddings", Similarity::Cosine, 1, 2))
            .unwrap();

        let (_, before, _) = beans.search_snapshot("embeddings", None).unwrap();
        let stats = beans.rebuild_index("vec", Some(3)).unwrap();
        assert!(stats.trained);
        assert_eq!(stats.partitions, 3);
        assert_eq!(stats.indexed, 120);
        // the old snapshot is still whole
        assert_eq!(before.stats().partitions, 1);
        assert_eq!(before.len(), 120);
        assert_eq!(
            beans.index_definition("vec").unwrap().vector_options().unwrap().num_lists,
            3
        );
    }
}

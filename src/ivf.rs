//! Inverted-file (IVF) vector index.
//!
//! An `IvfIndex` value is an immutable snapshot: mutations go through
//! `Clone` + modify + publish, and partitions are shared between snapshots
//! through `Arc`, so only the partitions a mutation touches get copied.

use crate::defaults::{MAX_KMEANS_ITERATIONS, MIN_POINTS_PER_LIST};
use crate::model::{DocId, IndexStats, Similarity, VectorOptions};
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

/// faiss caps k-means training at 256 points per centroid; so do we.
const MAX_POINTS_PER_LIST: usize = 256;

#[derive(Debug, Clone)]
pub struct Entry {
    pub id: DocId,
    pub vector: Arc<[f32]>,
}

#[derive(Debug, Clone, Default)]
pub struct Partition {
    entries: Vec<Entry>,
}

impl Partition {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct IvfIndex {
    options: VectorOptions,
    /// Empty while the index is untrained; everything then lives in a single
    /// partition that is scanned exhaustively.
    centroids: Arc<Vec<Vec<f32>>>,
    partitions: Vec<Arc<Partition>>,
    len: usize,
    /// Documents whose vector has the wrong dimensionality.
    rejected: Arc<BTreeSet<DocId>>,
}

pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

pub fn l2_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

pub fn normalize(vector: &[f32]) -> Vec<f32> {
    let norm = dot(vector, vector).sqrt();
    if norm == 0.0 {
        return vector.to_vec();
    }
    vector.iter().map(|x| x / norm).collect()
}

/// Bring a raw vector into the form stored in the index.
pub fn prepare(similarity: Similarity, vector: &[f32]) -> Vec<f32> {
    match similarity {
        Similarity::Cosine => normalize(vector),
        Similarity::InnerProduct | Similarity::Euclidean => vector.to_vec(),
    }
}

/// Higher is more similar for every metric. Both inputs must already be
/// prepared; cosine is then a plain dot product.
pub fn score(similarity: Similarity, a: &[f32], b: &[f32]) -> f32 {
    match similarity {
        Similarity::Cosine | Similarity::InnerProduct => dot(a, b),
        Similarity::Euclidean => -l2_distance(a, b),
    }
}

/// Best-first order with the document id as a stable tie-break.
pub fn rank(a: &(DocId, f32), b: &(DocId, f32)) -> Ordering {
    b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0))
}

/// Calculate the nprobe that reaches roughly the requested recall.
pub fn calculate_optimal_nprobe(nlist: usize, target_recall: f64) -> usize {
    let fraction = if target_recall >= 0.95 {
        0.20
    } else if target_recall >= 0.90 {
        0.15
    } else if target_recall >= 0.80 {
        0.10
    } else {
        0.05
    };
    let optimal = (nlist as f64 * fraction).ceil() as usize;
    optimal.max(1).min(nlist.max(1))
}

/// Number of vectors needed before k-means is worth running.
pub fn training_threshold(nlist: usize) -> usize {
    nlist.saturating_mul(MIN_POINTS_PER_LIST).max(nlist)
}

/// Training sample size for `nlist` clusters over `vector_count` vectors.
pub fn calculate_training_size(vector_count: usize, nlist: usize) -> usize {
    nlist.saturating_mul(MAX_POINTS_PER_LIST).min(vector_count)
}

fn nearest(similarity: Similarity, centroids: &[Vec<f32>], vector: &[f32]) -> usize {
    let mut best = 0;
    let mut best_score = f32::NEG_INFINITY;
    for (i, centroid) in centroids.iter().enumerate() {
        let s = score(similarity, centroid, vector);
        if s > best_score {
            best = i;
            best_score = s;
        }
    }
    best
}

/// Lloyd's k-means over prepared vectors. Initial centroids are spread
/// evenly over the input order, which callers keep sorted by id, so
/// training is deterministic. Cosine indexes re-normalise centroids after
/// each step (spherical k-means).
pub fn train_centroids(similarity: Similarity, vectors: &[&[f32]], nlist: usize) -> Vec<Vec<f32>> {
    let n = vectors.len();
    let k = nlist.min(n);
    if k == 0 {
        return Vec::new();
    }

    let mut centroids: Vec<Vec<f32>> = (0..k).map(|i| vectors[i * n / k].to_vec()).collect();
    let dim = centroids[0].len();
    let mut assignment = vec![usize::MAX; n];

    for iteration in 0..MAX_KMEANS_ITERATIONS {
        let mut changed = 0usize;
        for (slot, vector) in assignment.iter_mut().zip(vectors) {
            let best = nearest(similarity, &centroids, vector);
            if *slot != best {
                *slot = best;
                changed += 1;
            }
        }
        if changed == 0 {
            tracing::debug!("k-means converged after {} iterations", iteration);
            break;
        }

        let mut sums = vec![vec![0.0f32; dim]; k];
        let mut counts = vec![0usize; k];
        for (cluster, vector) in assignment.iter().zip(vectors) {
            counts[*cluster] += 1;
            for (acc, x) in sums[*cluster].iter_mut().zip(vector.iter()) {
                *acc += x;
            }
        }
        for (cluster, sum) in sums.into_iter().enumerate() {
            // an empty cluster keeps its previous centroid
            if counts[cluster] == 0 {
                continue;
            }
            let mean: Vec<f32> = sum.iter().map(|x| x / counts[cluster] as f32).collect();
            centroids[cluster] = prepare(similarity, &mean);
        }
    }

    centroids
}

impl IvfIndex {
    pub fn empty(options: VectorOptions) -> Self {
        Self {
            options,
            centroids: Arc::new(Vec::new()),
            partitions: vec![Arc::new(Partition::default())],
            len: 0,
            rejected: Arc::new(BTreeSet::new()),
        }
    }

    /// Prepare raw `(id, vector)` pairs for this index's metric. Pairs of
    /// the wrong dimensionality are set aside by id.
    pub fn prepare_entries<I>(options: &VectorOptions, raw: I) -> (Vec<Entry>, BTreeSet<DocId>)
    where
        I: IntoIterator<Item = (DocId, Vec<f32>)>,
    {
        let mut rejected = BTreeSet::new();
        let mut entries = Vec::new();
        for (id, vector) in raw {
            if vector.len() != options.dimensions {
                tracing::warn!(
                    "Skipping document {} for field {}: expected {} dims, got {}",
                    id,
                    options.field,
                    options.dimensions,
                    vector.len()
                );
                rejected.insert(id);
                continue;
            }
            entries.push(Entry {
                id,
                vector: prepare(options.similarity, &vector).into(),
            });
        }
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        (entries, rejected)
    }

    /// Train centroids from prepared entries if there are enough of them.
    /// Returns `None` when the index should stay flat.
    pub fn train(options: &VectorOptions, entries: &[Entry]) -> Option<Vec<Vec<f32>>> {
        if entries.len() < training_threshold(options.num_lists) {
            return None;
        }
        let sample_size = calculate_training_size(entries.len(), options.num_lists);
        let sample: Vec<&[f32]> = (0..sample_size)
            .map(|i| entries[i * entries.len() / sample_size].vector.as_ref())
            .collect();
        let centroids = train_centroids(options.similarity, &sample, options.num_lists);
        tracing::info!(
            "Trained IVF index on {}: {} vectors, {} dims, {} lists, {} training vectors",
            options.field,
            entries.len(),
            options.dimensions,
            centroids.len(),
            sample_size
        );
        Some(centroids)
    }

    /// Assemble a snapshot from prepared entries and (optional) centroids.
    pub fn assemble(
        options: VectorOptions,
        centroids: Option<Vec<Vec<f32>>>,
        entries: Vec<Entry>,
        rejected: BTreeSet<DocId>,
    ) -> Self {
        let centroids = centroids.unwrap_or_default();
        let mut partitions = vec![Partition::default(); centroids.len().max(1)];
        let len = entries.len();
        for entry in entries {
            let slot = if centroids.is_empty() {
                0
            } else {
                nearest(options.similarity, &centroids, &entry.vector)
            };
            partitions[slot].entries.push(entry);
        }
        Self {
            options,
            centroids: Arc::new(centroids),
            partitions: partitions.into_iter().map(Arc::new).collect(),
            len,
            rejected: Arc::new(rejected),
        }
    }

    pub fn build<I>(options: VectorOptions, raw: I) -> Self
    where
        I: IntoIterator<Item = (DocId, Vec<f32>)>,
    {
        let (entries, rejected) = Self::prepare_entries(&options, raw);
        let centroids = Self::train(&options, &entries);
        Self::assemble(options, centroids, entries, rejected)
    }

    pub fn options(&self) -> &VectorOptions {
        &self.options
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_trained(&self) -> bool {
        !self.centroids.is_empty()
    }

    pub fn stats(&self) -> IndexStats {
        IndexStats {
            indexed: self.len,
            rejected: self.rejected.len(),
            trained: self.is_trained(),
            partitions: self.partitions.len(),
        }
    }

    /// All entries in id order.
    pub fn entries(&self) -> Vec<Entry> {
        let mut all: Vec<Entry> = self
            .partitions
            .iter()
            .flat_map(|p| p.entries.iter().cloned())
            .collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    fn partition_for(&self, prepared: &[f32]) -> usize {
        if self.centroids.is_empty() {
            0
        } else {
            nearest(self.options.similarity, &self.centroids, prepared)
        }
    }

    /// Add a vector. One of the wrong dimensionality is only recorded as
    /// rejected and never becomes searchable.
    pub fn insert(&mut self, id: DocId, vector: &[f32]) -> bool {
        if vector.len() != self.options.dimensions {
            tracing::debug!(
                "Rejecting document {} for field {}: expected {} dims, got {}",
                id,
                self.options.field,
                self.options.dimensions,
                vector.len()
            );
            Arc::make_mut(&mut self.rejected).insert(id);
            return false;
        }
        let prepared = prepare(self.options.similarity, vector);
        let slot = self.partition_for(&prepared);
        Arc::make_mut(&mut self.partitions[slot]).entries.push(Entry {
            id,
            vector: prepared.into(),
        });
        self.len += 1;
        true
    }

    /// Remove the entry for `id`, given the vector it was indexed with.
    pub fn remove(&mut self, id: &str, vector: &[f32]) -> bool {
        if vector.len() != self.options.dimensions {
            if self.rejected.contains(id) {
                Arc::make_mut(&mut self.rejected).remove(id);
            }
            return false;
        }
        let prepared = prepare(self.options.similarity, vector);
        let slot = self.partition_for(&prepared);
        let position = self.partitions[slot].entries.iter().position(|e| e.id == id);
        match position {
            Some(pos) => {
                Arc::make_mut(&mut self.partitions[slot]).entries.swap_remove(pos);
                self.len -= 1;
                true
            }
            None => false,
        }
    }

    /// Train the index once enough vectors arrived through inserts.
    pub fn maybe_train(&mut self) -> bool {
        if self.is_trained() || self.len < training_threshold(self.options.num_lists) {
            return false;
        }
        let entries = self.entries();
        let centroids = Self::train(&self.options, &entries);
        let rejected = self.rejected.as_ref().clone();
        *self = Self::assemble(self.options.clone(), centroids, entries, rejected);
        self.is_trained()
    }

    pub fn default_nprobe(&self) -> usize {
        calculate_optimal_nprobe(self.partitions.len(), 0.95)
    }

    /// Top-`k` search. `allowed` restricts candidates to a pre-filtered id
    /// set. Returns the hits and the number of partitions probed.
    pub fn search(
        &self,
        query: &[f32],
        k: usize,
        nprobe: Option<usize>,
        allowed: Option<&HashSet<DocId>>,
    ) -> (Vec<(DocId, f32)>, usize) {
        let similarity = self.options.similarity;
        let prepared = prepare(similarity, query);

        let probe: Vec<usize> = if self.centroids.is_empty() {
            vec![0]
        } else {
            let nprobe = nprobe
                .unwrap_or_else(|| self.default_nprobe())
                .clamp(1, self.centroids.len());
            let mut ranked: Vec<(usize, f32)> = self
                .centroids
                .iter()
                .enumerate()
                .map(|(i, c)| (i, score(similarity, c, &prepared)))
                .collect();
            ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
            ranked.into_iter().take(nprobe).map(|(i, _)| i).collect()
        };

        let mut hits: Vec<(DocId, f32)> = probe
            .iter()
            .flat_map(|&slot| self.partitions[slot].entries.iter())
            .filter(|e| allowed.map_or(true, |ids| ids.contains(&e.id)))
            .map(|e| (e.id.clone(), score(similarity, &e.vector, &prepared)))
            .collect();
        hits.sort_by(rank);
        hits.truncate(k);
        (hits, probe.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(similarity: Similarity, num_lists: usize, dimensions: usize) -> VectorOptions {
        VectorOptions {
            field: "embeddings".to_string(),
            similarity,
            num_lists,
            dimensions,
        }
    }

    #[test]
    fn test_cosine_is_dot_of_normalized() {
        let a = normalize(&[3.0, 4.0]);
        let b = normalize(&[4.0, 3.0]);
        assert!((score(Similarity::Cosine, &a, &b) - 0.96).abs() < 1e-6);
        assert_eq!(normalize(&[0.0, 0.0]), vec![0.0, 0.0]);
    }

    #[test]
    fn test_untrained_search_is_exact() {
        let index = IvfIndex::build(
            options(Similarity::Cosine, 4, 2),
            vec![
                ("a".to_string(), vec![1.0, 0.0]),
                ("b".to_string(), vec![0.0, 1.0]),
                ("c".to_string(), vec![1.0, 1.0]),
                ("d".to_string(), vec![-1.0, 0.0]),
            ],
        );
        assert!(!index.is_trained());
        let (hits, probed) = index.search(&[2.0, 0.1], 3, None, None);
        assert_eq!(probed, 1);
        let ids: Vec<&str> = hits.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c", "b"]);
    }

    #[test]
    fn test_ties_break_by_id() {
        let index = IvfIndex::build(
            options(Similarity::InnerProduct, 2, 2),
            vec![
                ("z".to_string(), vec![1.0, 0.0]),
                ("m".to_string(), vec![1.0, 0.0]),
                ("a".to_string(), vec![1.0, 0.0]),
            ],
        );
        let (hits, _) = index.search(&[1.0, 0.0], 3, None, None);
        let ids: Vec<&str> = hits.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["a", "m", "z"]);
    }

    #[test]
    fn test_wrong_dimension_entries_are_rejected() {
        let index = IvfIndex::build(
            options(Similarity::Cosine, 1, 3),
            vec![
                ("a".to_string(), vec![1.0, 0.0, 0.0]),
                ("b".to_string(), vec![1.0, 0.0]),
            ],
        );
        assert_eq!(index.stats().indexed, 1);
        assert_eq!(index.stats().rejected, 1);
    }

    #[test]
    fn test_rejected_ids_follow_inserts_and_removes() {
        let mut index = IvfIndex::empty(options(Similarity::Cosine, 1, 3));
        assert!(index.insert("good".to_string(), &[1.0, 0.0, 0.0]));
        assert!(!index.insert("bad".to_string(), &[1.0]));
        assert_eq!(index.stats().indexed, 1);
        assert_eq!(index.stats().rejected, 1);

        let (hits, _) = index.search(&[1.0, 0.0, 0.0], 5, None, None);
        assert_eq!(hits.len(), 1);

        assert!(!index.remove("bad", &[1.0]));
        assert_eq!(index.stats().rejected, 0);
        assert_eq!(index.stats().indexed, 1);
    }

    fn clustered(n_per_cluster: usize) -> Vec<(DocId, Vec<f32>)> {
        let mut raw = Vec::new();
        for i in 0..n_per_cluster {
            let jitter = (i as f32) * 0.001;
            raw.push((format!("x{i:03}"), vec![1.0, jitter, 0.0]));
            raw.push((format!("y{i:03}"), vec![jitter, 1.0, 0.0]));
            raw.push((format!("z{i:03}"), vec![0.0, jitter, 1.0]));
        }
        raw
    }

    #[test]
    fn test_training_partitions_clusters() {
        let index = IvfIndex::build(options(Similarity::Cosine, 3, 3), clustered(50));
        assert!(index.is_trained());
        assert_eq!(index.stats().partitions, 3);
        assert_eq!(index.len(), 150);

        let (hits, probed) = index.search(&[0.0, 0.0, 1.0], 5, Some(1), None);
        assert_eq!(probed, 1);
        assert_eq!(hits.len(), 5);
        assert!(hits.iter().all(|(id, _)| id.starts_with('z')));
    }

    #[test]
    fn test_training_is_deterministic() {
        let a = IvfIndex::build(options(Similarity::Euclidean, 3, 3), clustered(40));
        let b = IvfIndex::build(options(Similarity::Euclidean, 3, 3), clustered(40));
        assert_eq!(a.centroids, b.centroids);
    }

    #[test]
    fn test_insert_remove_and_auto_train() {
        let opts = options(Similarity::Cosine, 3, 3);
        let mut index = IvfIndex::empty(opts);
        let raw = clustered(39);
        for (id, vector) in &raw {
            index.insert(id.clone(), vector);
        }
        assert_eq!(index.len(), 117);
        assert!(index.maybe_train());
        assert!(!index.maybe_train());

        let snapshot = index.clone();
        assert!(index.remove("x000", &raw[0].1));
        assert!(!index.remove("x000", &raw[0].1));
        assert_eq!(index.len(), 116);
        // the earlier snapshot is untouched
        assert_eq!(snapshot.len(), 117);
        assert_eq!(snapshot.entries().len(), 117);
    }

    #[test]
    fn test_allowed_set_restricts_candidates() {
        let index = IvfIndex::build(
            options(Similarity::Cosine, 1, 2),
            vec![
                ("a".to_string(), vec![1.0, 0.0]),
                ("b".to_string(), vec![0.9, 0.1]),
            ],
        );
        let allowed: HashSet<DocId> = ["b".to_string()].into_iter().collect();
        let (hits, _) = index.search(&[1.0, 0.0], 2, None, Some(&allowed));
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, "b");
    }

    #[test]
    fn test_nprobe_helpers() {
        assert_eq!(calculate_optimal_nprobe(10, 0.95), 2);
        assert_eq!(calculate_optimal_nprobe(1, 0.5), 1);
        assert_eq!(training_threshold(10), 390);
        assert_eq!(calculate_training_size(100, 2), 100);
    }
}

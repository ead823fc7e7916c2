use crate::collection::Collection;
use crate::errors::{Result, StoreError};
use crate::metadata_filter::MetadataFilter;
use crate::metrics::{get_metrics_collector, OperationType};
use crate::model::*;
use std::time::Instant;

/// Defaults applied to requests that leave a knob unset.
#[derive(Debug, Clone)]
pub struct SearchSettings {
    pub default_top_k: usize,
    pub default_nprobe: Option<usize>,
    pub default_min_score: Option<f32>,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            default_top_k: crate::defaults::DEFAULT_TOP_K,
            default_nprobe: None,
            default_min_score: None,
        }
    }
}

/// Top-k similarity search over the vector index on `req.field`.
pub fn search(collection: &Collection, req: &SearchRequest, settings: &SearchSettings) -> Result<SearchResponse> {
    let _measurement = crate::measure_operation!("query.search");
    let start = Instant::now();

    let result = execute(collection, req, settings, start);
    let (count, error) = match &result {
        Ok(response) => (response.results.len(), false),
        Err(_) => (0, true),
    };
    get_metrics_collector().record(OperationType::VectorQuery, collection.name(), start.elapsed(), count, error);
    result
}

fn execute(
    collection: &Collection,
    req: &SearchRequest,
    settings: &SearchSettings,
    start: Instant,
) -> Result<SearchResponse> {
    let k = req.k.unwrap_or(settings.default_top_k);
    if k == 0 {
        return Err(StoreError::validation("k must be at least 1"));
    }
    let filter = MetadataFilter::parse(req.filter.as_ref())?;

    let (index_name, ivf, allowed) = collection.search_snapshot(&req.field, filter.as_ref())?;
    let options = ivf.options();
    if req.vector.len() != options.dimensions {
        return Err(StoreError::DimensionMismatch {
            expected: options.dimensions,
            actual: req.vector.len(),
        });
    }
    if let Some(similarity) = req.similarity {
        if similarity != options.similarity {
            return Err(StoreError::validation(format!(
                "index {} uses {} similarity, query asked for {}",
                index_name, options.similarity, similarity
            )));
        }
    }

    get_metrics_collector().track_metric("query.topk", k as f64);
    if let Some(ids) = &allowed {
        get_metrics_collector().track_metric("query.pre_filtered_candidates", ids.len() as f64);
    }

    let nprobe = req.nprobe.or(settings.default_nprobe);
    let (mut hits, probed) = ivf.search(&req.vector, k, nprobe, allowed.as_ref());
    if let Some(min_score) = req.min_score.or(settings.default_min_score) {
        hits.retain(|(_, score)| *score >= min_score);
    }

    let documents = match &req.fields {
        Some(fields) => {
            let ids: Vec<DocId> = hits.iter().map(|(id, _)| id.clone()).collect();
            collection.project(&ids, fields)
        }
        None => vec![None; hits.len()],
    };

    let results: Vec<SearchHit> = hits
        .into_iter()
        .zip(documents)
        .map(|((id, score), document)| SearchHit { id, score, document })
        .collect();

    tracing::debug!(
        "Search on {}.{} returned {} hits from {} partitions",
        collection.name(),
        index_name,
        results.len(),
        probed
    );

    Ok(SearchResponse {
        results,
        index: index_name,
        partitions_probed: probed,
        took_ms: start.elapsed().as_millis(),
    })
}

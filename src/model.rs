use crate::errors::{Result, StoreError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

pub type DocId = String;

fn new_document_id() -> DocId {
    uuid::Uuid::new_v4().to_string()
}

/// A stored record: scalar fields plus named embedding vectors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    #[serde(alias = "_id", default = "new_document_id")]
    pub id: DocId,
    #[serde(default)]
    pub fields: Map<String, Value>,
    #[serde(default)]
    pub embeddings: BTreeMap<String, Vec<f32>>,
}

impl Document {
    pub fn new(id: impl Into<DocId>) -> Self {
        Self {
            id: id.into(),
            fields: Map::new(),
            embeddings: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: Value) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    pub fn with_embedding(mut self, name: impl Into<String>, vector: Vec<f32>) -> Self {
        self.embeddings.insert(name.into(), vector);
        self
    }

    /// Resolve a dotted path against the scalar fields. `_id` resolves to the
    /// document identifier.
    pub fn lookup(&self, path: &str) -> Option<Cow<'_, Value>> {
        if path == "_id" {
            return Some(Cow::Owned(Value::String(self.id.clone())));
        }
        let mut parts = path.split('.');
        let mut current = self.fields.get(parts.next()?)?;
        for part in parts {
            current = match current {
                Value::Object(map) => map.get(part)?,
                Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(Cow::Borrowed(current))
    }

    /// Copy only the requested fields; `_id` is always included.
    pub fn project(&self, fields: &[String]) -> Map<String, Value> {
        let mut out = Map::new();
        out.insert("_id".to_string(), Value::String(self.id.clone()));
        for field in fields {
            if let Some(value) = self.lookup(field) {
                out.insert(field.clone(), value.into_owned());
            } else if let Some(vector) = self.embeddings.get(field) {
                out.insert(field.clone(), serde_json::json!(vector));
            }
        }
        out
    }
}

/// `$set`-style partial update of a document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocumentPatch {
    #[serde(default)]
    pub fields: Map<String, Value>,
    #[serde(default)]
    pub embeddings: BTreeMap<String, Vec<f32>>,
}

/// Vector similarity metric. Accepts the short command-document spellings
/// (`COS`, `IP`, `L2`) as well as their long names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Similarity {
    Cosine,
    InnerProduct,
    Euclidean,
}

impl Similarity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Similarity::Cosine => "COS",
            Similarity::InnerProduct => "IP",
            Similarity::Euclidean => "L2",
        }
    }
}

impl FromStr for Similarity {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "cos" | "cosine" | "angular" => Ok(Similarity::Cosine),
            "ip" | "dot" | "inner_product" => Ok(Similarity::InnerProduct),
            "l2" | "euclidean" => Ok(Similarity::Euclidean),
            other => Err(StoreError::validation(format!(
                "unrecognized similarity metric: {other}"
            ))),
        }
    }
}

impl TryFrom<String> for Similarity {
    type Error = StoreError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Similarity> for String {
    fn from(value: Similarity) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for Similarity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum SortDirection {
    Ascending,
    Descending,
}

impl TryFrom<i64> for SortDirection {
    type Error = StoreError;

    fn try_from(value: i64) -> Result<Self> {
        match value {
            1 => Ok(SortDirection::Ascending),
            -1 => Ok(SortDirection::Descending),
            other => Err(StoreError::validation(format!(
                "index direction must be 1 or -1, got {other}"
            ))),
        }
    }
}

impl From<SortDirection> for i64 {
    fn from(value: SortDirection) -> Self {
        match value {
            SortDirection::Ascending => 1,
            SortDirection::Descending => -1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScalarKeyField {
    pub field: String,
    pub direction: SortDirection,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VectorOptions {
    pub field: String,
    pub similarity: Similarity,
    pub num_lists: usize,
    pub dimensions: usize,
}

/// What an index covers. The index name is kept next to it, not inside it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum IndexDefinition {
    Scalar { keys: Vec<ScalarKeyField> },
    VectorIvf(VectorOptions),
}

impl IndexDefinition {
    pub fn scalar<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = (S, SortDirection)>,
        S: Into<String>,
    {
        IndexDefinition::Scalar {
            keys: keys
                .into_iter()
                .map(|(field, direction)| ScalarKeyField {
                    field: field.into(),
                    direction,
                })
                .collect(),
        }
    }

    pub fn vector(
        field: impl Into<String>,
        similarity: Similarity,
        num_lists: usize,
        dimensions: usize,
    ) -> Self {
        IndexDefinition::VectorIvf(VectorOptions {
            field: field.into(),
            similarity,
            num_lists,
            dimensions,
        })
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            IndexDefinition::Scalar { keys } => {
                if keys.is_empty() {
                    return Err(StoreError::validation("scalar index needs at least one key"));
                }
                if keys.iter().any(|k| k.field.is_empty()) {
                    return Err(StoreError::validation("scalar index key must name a field"));
                }
            }
            IndexDefinition::VectorIvf(opts) => {
                if opts.field.is_empty() {
                    return Err(StoreError::validation("vector index must name a field"));
                }
                if opts.dimensions == 0 {
                    return Err(StoreError::validation("dimensions must be positive"));
                }
                if opts.num_lists == 0 {
                    return Err(StoreError::validation("numLists must be positive"));
                }
            }
        }
        Ok(())
    }

    pub fn vector_options(&self) -> Option<&VectorOptions> {
        match self {
            IndexDefinition::VectorIvf(opts) => Some(opts),
            IndexDefinition::Scalar { .. } => None,
        }
    }

    /// Conventional name for a scalar index, e.g. `url_1_updated_1`.
    pub fn default_name(&self) -> String {
        match self {
            IndexDefinition::Scalar { keys } => keys
                .iter()
                .map(|k| format!("{}_{}", k.field, i64::from(k.direction)))
                .collect::<Vec<_>>()
                .join("_"),
            IndexDefinition::VectorIvf(opts) => format!("{}_ivf", opts.field),
        }
    }
}

/// Catalog record persisted for every index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexEntry {
    pub collection: String,
    pub name: String,
    pub definition: IndexDefinition,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexStats {
    pub indexed: usize,
    pub rejected: usize,
    pub trained: bool,
    pub partitions: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexInfo {
    pub name: String,
    pub definition: IndexDefinition,
    pub stats: IndexStats,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchRequest {
    pub field: String,
    pub vector: Vec<f32>,
    #[serde(default, alias = "topk", alias = "topK")]
    pub k: Option<usize>,
    #[serde(default)]
    pub similarity: Option<Similarity>,
    #[serde(default)]
    pub filter: Option<Value>,
    #[serde(default, alias = "minScore")]
    pub min_score: Option<f32>,
    #[serde(default)]
    pub nprobe: Option<usize>,
    #[serde(default)]
    pub fields: Option<Vec<String>>,
}

impl SearchRequest {
    pub fn new(field: impl Into<String>, vector: Vec<f32>, k: usize) -> Self {
        Self {
            field: field.into(),
            vector,
            k: Some(k),
            similarity: None,
            filter: None,
            min_score: None,
            nprobe: None,
            fields: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub id: DocId,
    pub score: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    pub results: Vec<SearchHit>,
    pub index: String,
    pub partitions_probed: usize,
    pub took_ms: u128,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FindRequest {
    #[serde(default)]
    pub filter: Option<Value>,
    #[serde(default)]
    pub hint: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_document_id_aliases_and_defaults() {
        let doc: Document = serde_json::from_value(json!({
            "_id": "bean-1",
            "fields": {"url": "https://example.com", "kind": "news"}
        }))
        .unwrap();
        assert_eq!(doc.id, "bean-1");
        assert!(doc.embeddings.is_empty());

        let generated: Document = serde_json::from_value(json!({"fields": {}})).unwrap();
        assert_eq!(generated.id.len(), 36);
    }

    #[test]
    fn test_lookup_nested_path() {
        let doc = Document::new("a").with_field("source", json!({"site": {"name": "hn"}}));
        assert_eq!(doc.lookup("source.site.name").unwrap().as_ref(), &json!("hn"));
        assert!(doc.lookup("source.missing").is_none());
        assert_eq!(doc.lookup("_id").unwrap().as_ref(), &json!("a"));
    }

    #[test]
    fn test_similarity_parsing() {
        assert_eq!("COS".parse::<Similarity>().unwrap(), Similarity::Cosine);
        assert_eq!("euclidean".parse::<Similarity>().unwrap(), Similarity::Euclidean);
        assert!(matches!(
            "manhattan".parse::<Similarity>(),
            Err(StoreError::Validation(_))
        ));
    }

    #[test]
    fn test_definition_validation() {
        assert!(IndexDefinition::vector("embeddings", Similarity::Cosine, 10, 0)
            .validate()
            .is_err());
        assert!(IndexDefinition::vector("embeddings", Similarity::Cosine, 0, 512)
            .validate()
            .is_err());
        assert!(IndexDefinition::scalar(Vec::<(String, SortDirection)>::new())
            .validate()
            .is_err());
        assert!(IndexDefinition::vector("embeddings", Similarity::Cosine, 10, 512)
            .validate()
            .is_ok());
    }

    #[test]
    fn test_default_scalar_name() {
        let def = IndexDefinition::scalar([
            ("url", SortDirection::Ascending),
            ("updated", SortDirection::Descending),
        ]);
        assert_eq!(def.default_name(), "url_1_updated_-1");
    }

    #[test]
    fn test_definition_serde_shape() {
        let def = IndexDefinition::vector("embeddings", Similarity::Cosine, 10, 512);
        let value = serde_json::to_value(&def).unwrap();
        assert_eq!(
            value,
            json!({"kind": "vector-ivf", "field": "embeddings", "similarity": "COS", "numLists": 10, "dimensions": 512})
        );
        let back: IndexDefinition = serde_json::from_value(value).unwrap();
        assert_eq!(back, def);
    }
}

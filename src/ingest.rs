//! Bulk document import and export.
//!
//! JSON lines hold one serialized [`Document`] per line. Parquet slices carry
//! `id: Utf8`, `fields: Utf8` (the scalar fields as JSON) and one nullable
//! `List<Float32>` column per embedding field.

use crate::database::Database;
use crate::model::*;
use anyhow::{bail, Context, Result};
use arrow::array::{Array, ArrayRef, Float32Array, ListArray, RecordBatch, StringArray};
use arrow::datatypes::{DataType, Field, Float32Type, Schema};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::file::properties::WriterProperties;
use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

const ID_COLUMN: &str = "id";
const FIELDS_COLUMN: &str = "fields";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SliceFormat {
    JsonLines,
    Parquet,
}

impl SliceFormat {
    pub fn from_path(path: &Path) -> Result<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("jsonl") | Some("ndjson") | Some("json") => Ok(SliceFormat::JsonLines),
            Some("parquet") => Ok(SliceFormat::Parquet),
            _ => bail!("cannot tell the format of {} (expected .jsonl or .parquet)", path.display()),
        }
    }
}

/// `collection=path`, as given to `--load`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoadSpec {
    pub collection: String,
    pub path: PathBuf,
}

impl FromStr for LoadSpec {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('=') {
            Some((collection, path)) if !collection.is_empty() && !path.is_empty() => Ok(Self {
                collection: collection.to_string(),
                path: PathBuf::from(path),
            }),
            _ => bail!("expected COLLECTION=PATH, got {s:?}"),
        }
    }
}

pub fn read_jsonl(reader: impl BufRead) -> Result<Vec<Document>> {
    let mut docs = Vec::new();
    for (n, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("Failed to read line {}", n + 1))?;
        if line.trim().is_empty() {
            continue;
        }
        let doc: Document = serde_json::from_str(&line)
            .with_context(|| format!("Failed to parse document on line {}", n + 1))?;
        docs.push(doc);
    }
    Ok(docs)
}

pub fn write_jsonl(mut writer: impl Write, docs: &[Document]) -> Result<()> {
    for doc in docs {
        serde_json::to_writer(&mut writer, doc)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    Ok(())
}

fn embedding_fields(docs: &[Document]) -> BTreeSet<String> {
    docs.iter()
        .flat_map(|d| d.embeddings.keys().cloned())
        .collect()
}

pub fn write_parquet(file: File, docs: &[Document]) -> Result<()> {
    let vector_fields = embedding_fields(docs);

    let mut fields = vec![
        Field::new(ID_COLUMN, DataType::Utf8, false),
        Field::new(FIELDS_COLUMN, DataType::Utf8, false),
    ];
    for name in &vector_fields {
        fields.push(Field::new(
            name,
            DataType::List(Arc::new(Field::new("item", DataType::Float32, true))),
            true,
        ));
    }
    let schema = Arc::new(Schema::new(fields));

    let ids: Vec<&str> = docs.iter().map(|d| d.id.as_str()).collect();
    let scalars: Vec<String> = docs
        .iter()
        .map(|d| serde_json::to_string(&d.fields))
        .collect::<std::result::Result<_, _>>()?;

    let mut columns: Vec<ArrayRef> = vec![
        Arc::new(StringArray::from(ids)),
        Arc::new(StringArray::from(scalars)),
    ];
    for name in &vector_fields {
        let values = docs.iter().map(|d| {
            d.embeddings
                .get(name)
                .map(|v| v.iter().map(|&f| Some(f)).collect::<Vec<_>>())
        });
        columns.push(Arc::new(ListArray::from_iter_primitive::<Float32Type, _, _>(values)));
    }

    let batch = RecordBatch::try_new(schema.clone(), columns)?;
    let props = WriterProperties::builder().build();
    let mut writer = ArrowWriter::try_new(file, schema, Some(props))?;
    writer.write(&batch)?;
    writer.close()?;
    Ok(())
}

fn string_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a StringArray> {
    batch
        .column_by_name(name)
        .with_context(|| format!("missing column {name}"))?
        .as_any()
        .downcast_ref::<StringArray>()
        .with_context(|| format!("column {name} is not Utf8"))
}

pub fn read_parquet(file: File) -> Result<Vec<Document>> {
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)
        .context("Failed to open parquet file")?
        .build()?;

    let mut docs = Vec::new();
    for batch in reader {
        let batch = batch.context("Failed to read record batch")?;
        let ids = string_column(&batch, ID_COLUMN)?;
        let scalars = string_column(&batch, FIELDS_COLUMN)?;

        let schema = batch.schema();
        let mut vector_columns = Vec::new();
        for (i, field) in schema.fields().iter().enumerate() {
            if matches!(field.data_type(), DataType::List(_)) {
                let list = batch
                    .column(i)
                    .as_any()
                    .downcast_ref::<ListArray>()
                    .with_context(|| format!("column {} is not a list", field.name()))?;
                vector_columns.push((field.name().clone(), list));
            }
        }

        for row in 0..batch.num_rows() {
            let mut doc = Document::new(ids.value(row));
            if !scalars.is_null(row) {
                doc.fields = serde_json::from_str(scalars.value(row))
                    .with_context(|| format!("Invalid fields JSON for document {}", doc.id))?;
            }
            for (name, list) in &vector_columns {
                if list.is_null(row) {
                    continue;
                }
                let values = list.value(row);
                let floats = values
                    .as_any()
                    .downcast_ref::<Float32Array>()
                    .with_context(|| format!("column {name} must hold Float32 values"))?;
                doc.embeddings.insert(name.clone(), floats.values().to_vec());
            }
            docs.push(doc);
        }
    }
    Ok(docs)
}

pub fn read_documents(path: &Path) -> Result<Vec<Document>> {
    let format = SliceFormat::from_path(path)?;
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    match format {
        SliceFormat::JsonLines => read_jsonl(BufReader::new(file)),
        SliceFormat::Parquet => read_parquet(file),
    }
}

pub fn write_documents(path: &Path, docs: &[Document]) -> Result<()> {
    let format = SliceFormat::from_path(path)?;
    let file = File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    match format {
        SliceFormat::JsonLines => write_jsonl(BufWriter::new(file), docs),
        SliceFormat::Parquet => write_parquet(file, docs),
    }
}

/// Import a file into a collection through the regular insert path, so
/// index invariants hold. Returns the number of new documents.
pub async fn load_file(db: &Database, spec: &LoadSpec) -> Result<usize> {
    let _measurement = crate::measure_operation!("ingest.load_file");
    let path = spec.path.clone();
    let docs = tokio::task::spawn_blocking(move || read_documents(&path)).await??;
    let total = docs.len();
    let inserted = db
        .insert_many(&spec.collection, docs)
        .with_context(|| format!("Failed to load {} into {}", spec.path.display(), spec.collection))?;
    tracing::info!(
        "Loaded {} of {} documents from {} into {}",
        inserted.len(),
        total,
        spec.path.display(),
        spec.collection
    );
    Ok(inserted.len())
}

/// Write every document of a collection to `path`.
pub async fn export_collection(db: &Database, collection: &str, path: &Path) -> Result<usize> {
    let docs = db.documents(collection);
    let count = docs.len();
    let target = path.to_path_buf();
    tokio::task::spawn_blocking(move || write_documents(&target, &docs)).await??;
    tracing::info!("Exported {} documents from {} to {}", count, collection, path.display());
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;
    use crate::errors::StoreError;
    use crate::query::SearchSettings;
    use serde_json::json;

    #[test]
    fn test_load_spec_parsing() {
        let spec: LoadSpec = "beans=/data/beans.parquet".parse().unwrap();
        assert_eq!(spec.collection, "beans");
        assert_eq!(spec.path, PathBuf::from("/data/beans.parquet"));
        assert!("beans".parse::<LoadSpec>().is_err());
        assert!("=x.jsonl".parse::<LoadSpec>().is_err());
    }

    #[test]
    fn test_jsonl_accepts_underscore_id_and_reports_bad_lines() {
        let input = "{\"_id\": \"a\", \"fields\": {\"kind\": \"news\"}}\n\n{\"fields\": {}}\n";
        let docs = read_jsonl(input.as_bytes()).unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].id, "a");
        assert!(!docs[1].id.is_empty());

        let err = read_jsonl("{\"_id\": \"a\"}\nnot json\n".as_bytes()).unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn test_parquet_keeps_missing_embeddings_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("beans.parquet");
        let docs = vec![
            Document::new("a")
                .with_field("kind", json!("news"))
                .with_field("updated", json!(1700000000))
                .with_embedding("embeddings", vec![0.5, 0.25]),
            Document::new("b").with_field("kind", json!("blog")),
        ];
        write_documents(&path, &docs).unwrap();

        let loaded = read_documents(&path).unwrap();
        assert_eq!(loaded, docs);
        assert!(loaded[1].embeddings.is_empty());
    }

    #[test]
    fn test_unknown_extension_is_rejected() {
        assert!(SliceFormat::from_path(Path::new("beans.csv")).is_err());
    }

    #[tokio::test]
    async fn test_load_file_goes_through_indexes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("beans.jsonl");
        write_documents(
            &path,
            &[Document::new("a").with_embedding("embeddings", vec![1.0, 0.0, 0.0])],
        )
        .unwrap();

        let db = Database::new(Catalog::in_memory(), SearchSettings::default());
        db.create_index("beans", "vec", IndexDefinition::vector("embeddings", Similarity::Cosine, 1, 2))
            .await
            .unwrap();
        let spec = LoadSpec {
            collection: "beans".to_string(),
            path: path.clone(),
        };
        let err = load_file(&db, &spec).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::DimensionMismatch { .. })
        ));

        db.drop_index("beans", "vec").await.unwrap();
        assert_eq!(load_file(&db, &spec).await.unwrap(), 1);
        assert_eq!(load_file(&db, &spec).await.unwrap(), 0);

        let out = dir.path().join("export.parquet");
        assert_eq!(export_collection(&db, "beans", &out).await.unwrap(), 1);
        assert_eq!(read_documents(&out).unwrap()[0].id, "a");
    }
}

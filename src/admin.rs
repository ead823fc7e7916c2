//! Administrative command documents.
//!
//! Commands are JSON objects whose first key names the command and the
//! target collection, e.g.
//!
//! ```json
//! {"createIndexes": "beans",
//!  "indexes": [{"name": "wholebeans_vec_search",
//!               "key": {"embeddings": "cosmosSearch"},
//!               "cosmosSearchOptions": {"kind": "vector-ivf", "numLists": 10,
//!                                       "similarity": "COS", "dimensions": 512}}]}
//! ```

use crate::database::Database;
use crate::errors::{Result, StoreError};
use crate::model::*;
use serde_json::{json, Map, Value};

const VECTOR_KEY_MARKER: &str = "cosmosSearch";
const VECTOR_KIND: &str = "vector-ivf";

#[derive(Debug, Clone, PartialEq)]
pub enum DropTarget {
    Name(String),
    All,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    CreateIndexes {
        collection: String,
        indexes: Vec<(String, IndexDefinition)>,
    },
    DropIndexes {
        collection: String,
        target: DropTarget,
    },
    Count {
        collection: String,
        query: Option<Value>,
    },
    ListIndexes {
        collection: String,
    },
    RebuildIndex {
        collection: String,
        index: String,
        num_lists: Option<usize>,
    },
}

impl Command {
    pub fn parse(doc: &Value) -> Result<Self> {
        let obj = doc
            .as_object()
            .ok_or_else(|| StoreError::validation("command must be a JSON object"))?;
        let (name, target) = obj
            .iter()
            .next()
            .ok_or_else(|| StoreError::validation("empty command document"))?;
        let collection = target
            .as_str()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| StoreError::validation(format!("{name} expects a collection name")))?
            .to_string();

        match name.as_str() {
            "createIndexes" => {
                let specs = obj
                    .get("indexes")
                    .and_then(Value::as_array)
                    .filter(|specs| !specs.is_empty())
                    .ok_or_else(|| StoreError::validation("createIndexes needs a non-empty indexes array"))?;
                let indexes = specs.iter().map(parse_index_spec).collect::<Result<Vec<_>>>()?;
                Ok(Command::CreateIndexes { collection, indexes })
            }
            "dropIndexes" => {
                let target = match obj.get("index") {
                    Some(Value::String(s)) if s == "*" => DropTarget::All,
                    Some(Value::String(s)) => DropTarget::Name(s.clone()),
                    _ => return Err(StoreError::validation("dropIndexes needs an index name or \"*\"")),
                };
                Ok(Command::DropIndexes { collection, target })
            }
            "count" => Ok(Command::Count {
                collection,
                query: obj.get("query").cloned(),
            }),
            "listIndexes" => Ok(Command::ListIndexes { collection }),
            "rebuildIndex" => {
                let index = obj
                    .get("index")
                    .and_then(Value::as_str)
                    .ok_or_else(|| StoreError::validation("rebuildIndex needs an index name"))?
                    .to_string();
                let num_lists = match obj.get("numLists") {
                    None | Some(Value::Null) => None,
                    Some(v) => Some(as_count(v, "numLists")?),
                };
                Ok(Command::RebuildIndex { collection, index, num_lists })
            }
            other => Err(StoreError::validation(format!("unknown command: {other}"))),
        }
    }
}

fn as_count(value: &Value, what: &str) -> Result<usize> {
    value
        .as_u64()
        .map(|n| n as usize)
        .ok_or_else(|| StoreError::validation(format!("{what} must be a non-negative integer")))
}

fn parse_index_spec(spec: &Value) -> Result<(String, IndexDefinition)> {
    let spec = spec
        .as_object()
        .ok_or_else(|| StoreError::validation("index spec must be an object"))?;
    let key = spec
        .get("key")
        .and_then(Value::as_object)
        .filter(|k| !k.is_empty())
        .ok_or_else(|| StoreError::validation("index spec needs a non-empty key document"))?;

    let vector_fields: Vec<&String> = key
        .iter()
        .filter(|(_, v)| v.as_str() == Some(VECTOR_KEY_MARKER))
        .map(|(k, _)| k)
        .collect();

    let definition = if vector_fields.is_empty() {
        let mut keys = Vec::with_capacity(key.len());
        for (field, direction) in key {
            let direction = direction
                .as_i64()
                .and_then(|d| SortDirection::try_from(d).ok())
                .ok_or_else(|| {
                    StoreError::validation(format!("unsupported index key {field}: {direction}"))
                })?;
            keys.push((field.clone(), direction));
        }
        IndexDefinition::scalar(keys)
    } else {
        if key.len() != 1 {
            return Err(StoreError::validation("a vector index covers exactly one field"));
        }
        parse_vector_options(vector_fields[0], spec.get("cosmosSearchOptions"))?
    };
    definition.validate()?;

    let name = match spec.get("name") {
        Some(Value::String(name)) => name.clone(),
        None | Some(Value::Null) => definition.default_name(),
        Some(other) => return Err(StoreError::validation(format!("index name must be a string, got {other}"))),
    };
    if name.is_empty() {
        return Err(StoreError::validation("index name must not be empty"));
    }
    Ok((name, definition))
}

fn parse_vector_options(field: &str, options: Option<&Value>) -> Result<IndexDefinition> {
    let options = options
        .and_then(Value::as_object)
        .ok_or_else(|| StoreError::validation("vector index needs cosmosSearchOptions"))?;
    match options.get("kind").and_then(Value::as_str) {
        Some(VECTOR_KIND) => {}
        Some(other) => return Err(StoreError::validation(format!("unsupported index kind: {other}"))),
        None => return Err(StoreError::validation("cosmosSearchOptions.kind is required")),
    }
    let similarity: Similarity = options
        .get("similarity")
        .and_then(Value::as_str)
        .ok_or_else(|| StoreError::validation("cosmosSearchOptions.similarity is required"))?
        .parse()?;
    let dimensions = options
        .get("dimensions")
        .ok_or_else(|| StoreError::validation("cosmosSearchOptions.dimensions is required"))
        .and_then(|v| as_count(v, "dimensions"))?;
    let num_lists = match options.get("numLists") {
        Some(v) => as_count(v, "numLists")?,
        None => 1,
    };
    Ok(IndexDefinition::vector(field, similarity, num_lists, dimensions))
}

/// Render an index the way `createIndexes` accepts it, plus its stats.
fn describe_index(info: &IndexInfo) -> Value {
    let mut out = Map::new();
    out.insert("name".to_string(), json!(info.name));
    match &info.definition {
        IndexDefinition::Scalar { keys } => {
            let key: Map<String, Value> = keys
                .iter()
                .map(|k| (k.field.clone(), json!(i64::from(k.direction))))
                .collect();
            out.insert("key".to_string(), Value::Object(key));
        }
        IndexDefinition::VectorIvf(opts) => {
            let mut key = Map::new();
            key.insert(opts.field.clone(), json!(VECTOR_KEY_MARKER));
            out.insert("key".to_string(), Value::Object(key));
            out.insert(
                "cosmosSearchOptions".to_string(),
                json!({
                    "kind": VECTOR_KIND,
                    "numLists": opts.num_lists,
                    "similarity": opts.similarity.as_str(),
                    "dimensions": opts.dimensions,
                }),
            );
        }
    }
    out.insert("stats".to_string(), json!(info.stats));
    Value::Object(out)
}

fn shares_vector_field(a: &IndexDefinition, b: &IndexDefinition) -> bool {
    match (a.vector_options(), b.vector_options()) {
        (Some(a), Some(b)) => a.field == b.field,
        _ => false,
    }
}

/// Drop the indexes a failed `createIndexes` already made.
async fn undo_created(db: &Database, collection: &str, names: &[String]) {
    for name in names.iter().rev() {
        tracing::warn!("Rolling back index {}.{}", collection, name);
        if let Err(e) = db.drop_index(collection, name).await {
            tracing::error!("Could not roll back index {}.{}: {}", collection, name, e);
        }
    }
}

/// Run one command and build its `{"ok": 1, ...}` reply.
pub async fn execute(db: &Database, command: Command) -> Result<Value> {
    match command {
        Command::CreateIndexes { collection, indexes } => {
            let created_collection = db.existing(&collection).is_none();
            let target = db.collection(&collection)?;
            // refuse the whole command before touching anything
            for (i, (name, definition)) in indexes.iter().enumerate() {
                for (earlier, other) in &indexes[..i] {
                    if earlier == name && other != definition {
                        return Err(StoreError::Conflict { name: name.clone() });
                    }
                    if earlier != name && shares_vector_field(other, definition) {
                        return Err(StoreError::Conflict { name: earlier.clone() });
                    }
                }
                target.check_new_index(name, definition)?;
            }

            let before = target.index_names().len();
            let mut created = Vec::new();
            for (name, definition) in indexes {
                match db.create_index(&collection, &name, definition).await {
                    Ok(true) => created.push(name),
                    Ok(false) => {}
                    Err(e) => {
                        undo_created(db, &collection, &created).await;
                        return Err(e);
                    }
                }
            }
            let after = target.index_names().len();

            let mut reply = json!({
                "ok": 1,
                "createdCollectionAutomatically": created_collection,
                "numIndexesBefore": before,
                "numIndexesAfter": after,
            });
            if created.is_empty() {
                reply["note"] = json!("all indexes already exist");
            }
            Ok(reply)
        }
        Command::DropIndexes { collection, target } => {
            let names = match target {
                DropTarget::Name(name) => vec![name],
                DropTarget::All => db
                    .existing(&collection)
                    .map(|c| c.index_names())
                    .unwrap_or_default(),
            };
            let was = db.list_indexes(&collection).len();
            for name in &names {
                db.drop_index(&collection, name).await?;
            }
            Ok(json!({ "ok": 1, "nIndexesWas": was }))
        }
        Command::Count { collection, query } => {
            let n = db.count(&collection, query.as_ref())?;
            Ok(json!({ "ok": 1, "n": n }))
        }
        Command::ListIndexes { collection } => {
            let batch: Vec<Value> = db.list_indexes(&collection).iter().map(describe_index).collect();
            Ok(json!({
                "ok": 1,
                "cursor": { "ns": collection, "firstBatch": batch },
            }))
        }
        Command::RebuildIndex { collection, index, num_lists } => {
            let stats = db.rebuild_index(&collection, &index, num_lists).await?;
            Ok(json!({ "ok": 1, "index": index, "stats": stats }))
        }
    }
}

/// Parse and run a single command document.
pub async fn run_command(db: &Database, doc: &Value) -> Result<Value> {
    let command = Command::parse(doc)?;
    tracing::debug!("Running command {:?}", command);
    execute(db, command).await
}

/// Run a script: a JSON array of command documents (or a single one).
/// Stops at the first failing command.
pub async fn run_script(db: &Database, script: &Value) -> Result<Vec<Value>> {
    let commands: Vec<&Value> = match script {
        Value::Array(items) => items.iter().collect(),
        other => vec![other],
    };
    // parse everything up front so a typo late in the script changes nothing
    let parsed = commands
        .into_iter()
        .map(Command::parse)
        .collect::<Result<Vec<_>>>()?;

    let mut replies = Vec::with_capacity(parsed.len());
    for (i, command) in parsed.into_iter().enumerate() {
        match execute(db, command).await {
            Ok(reply) => replies.push(reply),
            Err(e) => {
                tracing::error!("Command {} of script failed: {}", i + 1, e);
                return Err(e);
            }
        }
    }
    Ok(replies)
}

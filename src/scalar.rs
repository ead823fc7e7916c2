use crate::model::{DocId, Document, ScalarKeyField, SortDirection};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};

/// Totally ordered view of a JSON value, used both as an index key and for
/// range predicates. Types order as null < numbers < strings < documents and
/// arrays < booleans.
#[derive(Debug, Clone)]
pub enum ScalarKey {
    Null,
    Number(f64),
    String(String),
    Composite(String),
    Bool(bool),
}

impl ScalarKey {
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::Null => ScalarKey::Null,
            Value::Bool(b) => ScalarKey::Bool(*b),
            Value::Number(n) => {
                let f = n.as_f64().unwrap_or(0.0);
                // collapse -0.0 so it equals 0.0
                ScalarKey::Number(if f == 0.0 { 0.0 } else { f })
            }
            Value::String(s) => ScalarKey::String(s.clone()),
            other => ScalarKey::Composite(other.to_string()),
        }
    }

    fn rank(&self) -> u8 {
        match self {
            ScalarKey::Null => 0,
            ScalarKey::Number(_) => 1,
            ScalarKey::String(_) => 2,
            ScalarKey::Composite(_) => 3,
            ScalarKey::Bool(_) => 4,
        }
    }

    /// Ordering restricted to keys of the same type; range predicates never
    /// match across types.
    pub fn compare_same_type(&self, other: &ScalarKey) -> Option<Ordering> {
        if self.rank() == other.rank() {
            Some(self.cmp(other))
        } else {
            None
        }
    }
}

impl Ord for ScalarKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (ScalarKey::Number(a), ScalarKey::Number(b)) => a.total_cmp(b),
            (ScalarKey::String(a), ScalarKey::String(b)) => a.cmp(b),
            (ScalarKey::Composite(a), ScalarKey::Composite(b)) => a.cmp(b),
            (ScalarKey::Bool(a), ScalarKey::Bool(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for ScalarKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for ScalarKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ScalarKey {}

#[derive(Debug, Clone)]
struct KeyPart {
    value: ScalarKey,
    direction: SortDirection,
}

impl Ord for KeyPart {
    fn cmp(&self, other: &Self) -> Ordering {
        let ord = self.value.cmp(&other.value);
        match self.direction {
            SortDirection::Ascending => ord,
            SortDirection::Descending => ord.reverse(),
        }
    }
}

impl PartialEq for KeyPart {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for KeyPart {}

impl PartialOrd for KeyPart {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

type IndexKey = Vec<KeyPart>;

/// Ordered (compound) index over scalar document fields. Missing fields are
/// indexed as null.
#[derive(Debug, Clone)]
pub struct ScalarIndex {
    keys: Vec<ScalarKeyField>,
    entries: BTreeSet<(IndexKey, DocId)>,
    by_doc: HashMap<DocId, IndexKey>,
}

impl ScalarIndex {
    pub fn new(keys: Vec<ScalarKeyField>) -> Self {
        Self {
            keys,
            entries: BTreeSet::new(),
            by_doc: HashMap::new(),
        }
    }

    pub fn build<'a>(keys: Vec<ScalarKeyField>, docs: impl IntoIterator<Item = &'a Document>) -> Self {
        let mut index = Self::new(keys);
        for doc in docs {
            index.insert(doc);
        }
        index
    }

    fn key_for(&self, doc: &Document) -> IndexKey {
        self.keys
            .iter()
            .map(|k| KeyPart {
                value: doc
                    .lookup(&k.field)
                    .map(|v| ScalarKey::from_value(&v))
                    .unwrap_or(ScalarKey::Null),
                direction: k.direction,
            })
            .collect()
    }

    /// Insert or re-key a document.
    pub fn insert(&mut self, doc: &Document) {
        self.remove(&doc.id);
        let key = self.key_for(doc);
        self.entries.insert((key.clone(), doc.id.clone()));
        self.by_doc.insert(doc.id.clone(), key);
    }

    pub fn remove(&mut self, id: &str) -> bool {
        match self.by_doc.remove(id) {
            Some(key) => {
                self.entries.remove(&(key, id.to_string()));
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.by_doc.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_doc.is_empty()
    }

    /// Document ids in index order; equal keys fall back to id order.
    pub fn ids(&self) -> impl Iterator<Item = &DocId> + '_ {
        self.entries.iter().map(|(_, id)| id)
    }
}

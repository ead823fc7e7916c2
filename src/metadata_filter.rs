use crate::errors::{Result, StoreError};
use crate::model::{DocId, Document};
use crate::scalar::ScalarKey;
use regex::Regex;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashSet;
use std::ops::Bound;

/// Scalar predicate over document fields, parsed from a query document such
/// as `{"kind": "news", "updated": {"$gte": 1700000000}}`.
#[derive(Debug, Clone)]
pub struct MetadataFilter {
    conditions: Vec<FilterCondition>,
    operator: BooleanOperator,
}

#[derive(Debug, Clone, Copy)]
pub enum BooleanOperator {
    And,
    Or,
}

#[derive(Debug, Clone)]
pub enum FilterCondition {
    Equals { field: String, value: Value },
    NotEquals { field: String, value: Value },
    In { field: String, values: Vec<Value> },
    NotIn { field: String, values: Vec<Value> },
    Range { field: String, lower: Bound<ScalarKey>, upper: Bound<ScalarKey> },
    Contains { field: String, substring: String },
    Regex { field: String, pattern: Regex },
    Exists { field: String },
    NotExists { field: String },
    Group(MetadataFilter),
}

impl MetadataFilter {
    pub fn new() -> Self {
        Self {
            conditions: Vec::new(),
            operator: BooleanOperator::And,
        }
    }

    pub fn and(mut self) -> Self {
        self.operator = BooleanOperator::And;
        self
    }

    pub fn or(mut self) -> Self {
        self.operator = BooleanOperator::Or;
        self
    }

    pub fn equals(mut self, field: impl Into<String>, value: Value) -> Self {
        self.conditions.push(FilterCondition::Equals { field: field.into(), value });
        self
    }

    pub fn not_equals(mut self, field: impl Into<String>, value: Value) -> Self {
        self.conditions.push(FilterCondition::NotEquals { field: field.into(), value });
        self
    }

    pub fn in_values(mut self, field: impl Into<String>, values: Vec<Value>) -> Self {
        self.conditions.push(FilterCondition::In { field: field.into(), values });
        self
    }

    pub fn not_in_values(mut self, field: impl Into<String>, values: Vec<Value>) -> Self {
        self.conditions.push(FilterCondition::NotIn { field: field.into(), values });
        self
    }

    pub fn range(
        mut self,
        field: impl Into<String>,
        lower: Bound<ScalarKey>,
        upper: Bound<ScalarKey>,
    ) -> Self {
        self.conditions.push(FilterCondition::Range { field: field.into(), lower, upper });
        self
    }

    pub fn contains(mut self, field: impl Into<String>, substring: impl Into<String>) -> Self {
        self.conditions.push(FilterCondition::Contains {
            field: field.into(),
            substring: substring.into(),
        });
        self
    }

    pub fn regex(mut self, field: impl Into<String>, pattern: &str) -> Result<Self> {
        let pattern = Regex::new(pattern)
            .map_err(|e| StoreError::validation(format!("invalid $regex: {e}")))?;
        self.conditions.push(FilterCondition::Regex { field: field.into(), pattern });
        Ok(self)
    }

    pub fn exists(mut self, field: impl Into<String>) -> Self {
        self.conditions.push(FilterCondition::Exists { field: field.into() });
        self
    }

    pub fn not_exists(mut self, field: impl Into<String>) -> Self {
        self.conditions.push(FilterCondition::NotExists { field: field.into() });
        self
    }

    pub fn group(mut self, filter: MetadataFilter) -> Self {
        self.conditions.push(FilterCondition::Group(filter));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    /// Apply filter to a document and return whether it matches
    pub fn matches(&self, doc: &Document) -> bool {
        if self.conditions.is_empty() {
            return true;
        }
        let mut results = self.conditions.iter().map(|c| evaluate_condition(c, doc));
        match self.operator {
            BooleanOperator::And => results.all(|x| x),
            BooleanOperator::Or => results.any(|x| x),
        }
    }

    /// Ids of the documents that pass the filter, computed before the vector
    /// search runs.
    pub fn pre_filter_ids<'a>(&self, docs: impl IntoIterator<Item = &'a Document>) -> HashSet<DocId> {
        docs.into_iter()
            .filter(|doc| self.matches(doc))
            .map(|doc| doc.id.clone())
            .collect()
    }
}

impl Default for MetadataFilter {
    fn default() -> Self {
        Self::new()
    }
}

fn scalar_eq(a: &Value, b: &Value) -> bool {
    ScalarKey::from_value(a) == ScalarKey::from_value(b)
}

/// Equality also matches any element of an array field.
fn value_matches(actual: &Value, expected: &Value) -> bool {
    if scalar_eq(actual, expected) {
        return true;
    }
    match actual {
        Value::Array(items) => items.iter().any(|item| scalar_eq(item, expected)),
        _ => false,
    }
}

fn in_range(actual: &Value, lower: &Bound<ScalarKey>, upper: &Bound<ScalarKey>) -> bool {
    let key = ScalarKey::from_value(actual);
    let lower_ok = match lower {
        Bound::Unbounded => true,
        Bound::Included(b) => matches!(key.compare_same_type(b), Some(Ordering::Greater | Ordering::Equal)),
        Bound::Excluded(b) => matches!(key.compare_same_type(b), Some(Ordering::Greater)),
    };
    let upper_ok = match upper {
        Bound::Unbounded => true,
        Bound::Included(b) => matches!(key.compare_same_type(b), Some(Ordering::Less | Ordering::Equal)),
        Bound::Excluded(b) => matches!(key.compare_same_type(b), Some(Ordering::Less)),
    };
    lower_ok && upper_ok
}

fn evaluate_condition(condition: &FilterCondition, doc: &Document) -> bool {
    match condition {
        FilterCondition::Equals { field, value } => doc
            .lookup(field)
            .map(|v| value_matches(&v, value))
            .unwrap_or(value.is_null()),
        FilterCondition::NotEquals { field, value } => doc
            .lookup(field)
            .map(|v| !value_matches(&v, value))
            .unwrap_or(!value.is_null()),
        FilterCondition::In { field, values } => doc
            .lookup(field)
            .map(|v| values.iter().any(|expected| value_matches(&v, expected)))
            .unwrap_or(false),
        FilterCondition::NotIn { field, values } => doc
            .lookup(field)
            .map(|v| !values.iter().any(|expected| value_matches(&v, expected)))
            .unwrap_or(true),
        FilterCondition::Range { field, lower, upper } => doc
            .lookup(field)
            .map(|v| match &*v {
                Value::Array(items) => items.iter().any(|item| in_range(item, lower, upper)),
                other => in_range(other, lower, upper),
            })
            .unwrap_or(false),
        FilterCondition::Contains { field, substring } => doc
            .lookup(field)
            .and_then(|v| v.as_str().map(|s| s.contains(substring.as_str())))
            .unwrap_or(false),
        FilterCondition::Regex { field, pattern } => doc
            .lookup(field)
            .and_then(|v| v.as_str().map(|s| pattern.is_match(s)))
            .unwrap_or(false),
        FilterCondition::Exists { field } => doc.lookup(field).is_some(),
        FilterCondition::NotExists { field } => doc.lookup(field).is_none(),
        FilterCondition::Group(filter) => filter.matches(doc),
    }
}

fn parse_clauses(value: &Value, op: &str) -> Result<Vec<MetadataFilter>> {
    let items = match value {
        Value::Array(items) if !items.is_empty() => items,
        _ => return Err(StoreError::validation(format!("{op} requires a non-empty array"))),
    };
    items.iter().cloned().map(MetadataFilter::try_from).collect()
}

fn bound_key(val: &Value, op: &str) -> Result<ScalarKey> {
    match val {
        Value::Number(_) | Value::String(_) => Ok(ScalarKey::from_value(val)),
        _ => Err(StoreError::validation(format!("{op} requires a number or string"))),
    }
}

/// Parse filter from a JSON query document
impl TryFrom<Value> for MetadataFilter {
    type Error = StoreError;

    fn try_from(value: Value) -> Result<Self> {
        let mut filter = MetadataFilter::new();

        let Value::Object(map) = value else {
            return Err(StoreError::validation("filter must be a JSON object"));
        };

        for (field, condition) in map {
            match field.as_str() {
                "$and" => {
                    let mut group = MetadataFilter::new().and();
                    for clause in parse_clauses(&condition, "$and")? {
                        group = group.group(clause);
                    }
                    filter = filter.group(group);
                    continue;
                }
                "$or" => {
                    let mut group = MetadataFilter::new().or();
                    for clause in parse_clauses(&condition, "$or")? {
                        group = group.group(clause);
                    }
                    filter = filter.group(group);
                    continue;
                }
                op if op.starts_with('$') => {
                    return Err(StoreError::validation(format!("Unknown top-level operator: {op}")));
                }
                _ => {}
            }

            let cond_map = match &condition {
                Value::Object(cond_map) if cond_map.keys().all(|k| k.starts_with('$')) && !cond_map.is_empty() => cond_map,
                _ => {
                    filter = filter.equals(field, condition);
                    continue;
                }
            };

            for (op, val) in cond_map {
                filter = match op.as_str() {
                    "$eq" => filter.equals(field.clone(), val.clone()),
                    "$ne" => filter.not_equals(field.clone(), val.clone()),
                    "$in" | "$nin" => {
                        let Value::Array(arr) = val else {
                            return Err(StoreError::validation(format!("{op} requires array value")));
                        };
                        if op == "$in" {
                            filter.in_values(field.clone(), arr.clone())
                        } else {
                            filter.not_in_values(field.clone(), arr.clone())
                        }
                    }
                    "$gt" => filter.range(field.clone(), Bound::Excluded(bound_key(val, op)?), Bound::Unbounded),
                    "$gte" => filter.range(field.clone(), Bound::Included(bound_key(val, op)?), Bound::Unbounded),
                    "$lt" => filter.range(field.clone(), Bound::Unbounded, Bound::Excluded(bound_key(val, op)?)),
                    "$lte" => filter.range(field.clone(), Bound::Unbounded, Bound::Included(bound_key(val, op)?)),
                    "$contains" => match val.as_str() {
                        Some(s) => filter.contains(field.clone(), s),
                        None => return Err(StoreError::validation("$contains requires string value")),
                    },
                    "$regex" => match val.as_str() {
                        Some(s) => filter.regex(field.clone(), s)?,
                        None => return Err(StoreError::validation("$regex requires string value")),
                    },
                    "$exists" => {
                        if val.as_bool().unwrap_or(false) {
                            filter.exists(field.clone())
                        } else {
                            filter.not_exists(field.clone())
                        }
                    }
                    _ => return Err(StoreError::validation(format!("Unknown filter operator: {op}"))),
                };
            }
        }

        Ok(filter)
    }
}

impl MetadataFilter {
    /// `None` and `{}` both mean "match everything".
    pub fn parse(value: Option<&Value>) -> Result<Option<Self>> {
        match value {
            None | Some(Value::Null) => Ok(None),
            Some(v) => {
                let filter = MetadataFilter::try_from(v.clone())?;
                Ok((!filter.is_empty()).then_some(filter))
            }
        }
    }
}

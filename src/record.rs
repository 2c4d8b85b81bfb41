//! Record Set - the in-flight tabular representation shared by every connector
//!
//! Rows are stored column-aligned against a single ordered column list, so a
//! row can never expose a different column set than its siblings.

use crate::error::{Result, SyncError};
use serde_json::{Map, Value as JsonValue};
use std::collections::HashSet;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Dynamically typed cell value
#[derive(Clone, Debug)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    /// Semi-structured payloads (arrays, objects) kept as raw JSON
    Nested(JsonValue),
}

/// Hashable identity of a value. Equality and hashing both go through here,
/// so duplicate detection has exactly one definition.
#[derive(PartialEq, Eq, Hash)]
enum ValueKey<'a> {
    Null,
    Bool(bool),
    Int(i64),
    Float(u64),
    Str(&'a str),
    Nested(String),
}

impl Value {
    fn key(&self) -> ValueKey<'_> {
        match self {
            Value::Null => ValueKey::Null,
            Value::Bool(b) => ValueKey::Bool(*b),
            Value::Int(i) => ValueKey::Int(*i),
            Value::Float(f) => float_key(*f),
            Value::Str(s) => ValueKey::Str(s),
            Value::Nested(v) => ValueKey::Nested(canonical_json(v)),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn from_json(value: JsonValue) -> Self {
        match value {
            JsonValue::Null => Value::Null,
            JsonValue::Bool(b) => Value::Bool(b),
            JsonValue::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    n.as_f64().map(Value::Float).unwrap_or(Value::Null)
                }
            }
            JsonValue::String(s) => Value::Str(s),
            nested @ (JsonValue::Array(_) | JsonValue::Object(_)) => Value::Nested(nested),
        }
    }

    pub fn to_json(&self) -> JsonValue {
        match self {
            Value::Null => JsonValue::Null,
            Value::Bool(b) => JsonValue::Bool(*b),
            Value::Int(i) => JsonValue::from(*i),
            // NaN and infinities have no JSON representation
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            Value::Str(s) => JsonValue::String(s.clone()),
            Value::Nested(v) => v.clone(),
        }
    }
}

fn float_key(f: f64) -> ValueKey<'static> {
    if f.is_nan() {
        return ValueKey::Float(f64::NAN.to_bits());
    }
    // Integral floats share identity with the integer they represent; also folds -0.0 into 0
    if f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 {
        return ValueKey::Int(f as i64);
    }
    ValueKey::Float(f.to_bits())
}

/// JSON text with object keys sorted at every level.
fn canonical_json(value: &JsonValue) -> String {
    fn sorted(value: &JsonValue) -> JsonValue {
        match value {
            JsonValue::Object(map) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                let mut out = Map::new();
                for key in keys {
                    out.insert(key.clone(), sorted(&map[key]));
                }
                JsonValue::Object(out)
            }
            JsonValue::Array(items) => JsonValue::Array(items.iter().map(sorted).collect()),
            other => other.clone(),
        }
    }
    sorted(value).to_string()
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

/// Text rendering used by delimited codecs. Null renders as an empty cell.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::Str(s) => f.write_str(s),
            Value::Nested(v) => write!(f, "{}", v),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

/// Ordered rows over an ordered, unique column list
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RecordSet {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

impl RecordSet {
    /// The empty set: no columns, no rows. Compatible with every other set.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn new(columns: Vec<String>) -> Result<Self> {
        let mut seen = HashSet::new();
        for column in &columns {
            if !seen.insert(column.as_str()) {
                return Err(SyncError::ShapeMismatch(format!(
                    "duplicate column name '{}'",
                    column
                )));
            }
        }
        Ok(Self {
            columns,
            rows: Vec::new(),
        })
    }

    pub fn with_rows(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Result<Self> {
        let mut set = Self::new(columns)?;
        for row in rows {
            set.push_row(row)?;
        }
        Ok(set)
    }

    /// Build from JSON objects. Keys missing from a row become `Null`; columns
    /// appear in first-seen order.
    pub fn from_json_objects(objects: Vec<Map<String, JsonValue>>) -> Self {
        let mut columns: Vec<String> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        for object in &objects {
            for key in object.keys() {
                if seen.insert(key.clone()) {
                    columns.push(key.clone());
                }
            }
        }

        let rows = objects
            .into_iter()
            .map(|mut object| {
                columns
                    .iter()
                    .map(|column| {
                        object
                            .remove(column)
                            .map(Value::from_json)
                            .unwrap_or(Value::Null)
                    })
                    .collect()
            })
            .collect();

        Self { columns, rows }
    }

    /// Like [`RecordSet::from_json_objects`], but rejects anything that is not an object.
    pub fn from_json_rows(rows: Vec<JsonValue>) -> Result<Self> {
        let mut objects = Vec::with_capacity(rows.len());
        for (idx, row) in rows.into_iter().enumerate() {
            match row {
                JsonValue::Object(map) => objects.push(map),
                other => {
                    return Err(SyncError::ShapeMismatch(format!(
                        "row {} is not a JSON object: {}",
                        idx, other
                    )))
                }
            }
        }
        Ok(Self::from_json_objects(objects))
    }

    pub fn push_row(&mut self, row: Vec<Value>) -> Result<()> {
        if row.len() != self.columns.len() {
            return Err(SyncError::ShapeMismatch(format!(
                "row has {} values but the record set has {} columns",
                row.len(),
                self.columns.len()
            )));
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    pub fn into_parts(self) -> (Vec<String>, Vec<Vec<Value>>) {
        (self.columns, self.rows)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// No columns and no rows.
    pub fn is_blank(&self) -> bool {
        self.columns.is_empty() && self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column_index(name).is_some()
    }

    pub fn value(&self, row: usize, column: &str) -> Option<&Value> {
        let idx = self.column_index(column)?;
        self.rows.get(row).map(|r| &r[idx])
    }

    /// Runtime type of a column, named the way persisted schemas name dtypes.
    pub fn column_type(&self, idx: usize) -> &'static str {
        let (mut ints, mut floats, mut bools, mut other) = (false, false, false, false);
        for row in &self.rows {
            match &row[idx] {
                Value::Null => {}
                Value::Int(_) => ints = true,
                Value::Float(_) => floats = true,
                Value::Bool(_) => bools = true,
                Value::Str(_) | Value::Nested(_) => other = true,
            }
        }

        if other || (bools && (ints || floats)) {
            "object"
        } else if bools {
            "bool"
        } else if floats {
            "float64"
        } else if ints {
            "int64"
        } else {
            "object"
        }
    }

    /// Row `idx` as a JSON object, preserving column order.
    pub fn row_object(&self, idx: usize) -> Option<Map<String, JsonValue>> {
        let row = self.rows.get(idx)?;
        let mut object = Map::new();
        for (column, value) in self.columns.iter().zip(row) {
            object.insert(column.clone(), value.to_json());
        }
        Some(object)
    }

    pub fn to_json_rows(&self) -> Vec<JsonValue> {
        (0..self.rows.len())
            .filter_map(|idx| self.row_object(idx).map(JsonValue::Object))
            .collect()
    }

    /// Append `other` below `self`. Column sets must match; `other` is aligned
    /// to this set's column order. A blank side is an identity.
    pub fn concat(mut self, other: RecordSet) -> Result<RecordSet> {
        if other.is_blank() {
            return Ok(self);
        }
        if self.is_blank() {
            return Ok(other);
        }

        let order = other.positions_for(&self.columns)?;
        let identity = order.iter().enumerate().all(|(i, &j)| i == j);
        if identity {
            self.rows.extend(other.rows);
        } else {
            for row in other.rows {
                let mut cells: Vec<Option<Value>> = row.into_iter().map(Some).collect();
                self.rows.push(
                    order
                        .iter()
                        .map(|&j| cells[j].take().unwrap_or(Value::Null))
                        .collect(),
                );
            }
        }
        Ok(self)
    }

    /// Index in `self` of each of `columns`; fails unless the sets are equal.
    fn positions_for(&self, columns: &[String]) -> Result<Vec<usize>> {
        let mismatch = || {
            SyncError::ShapeMismatch(format!(
                "column sets differ: [{}] vs [{}]",
                columns.join(", "),
                self.columns.join(", ")
            ))
        };
        if columns.len() != self.columns.len() {
            return Err(mismatch());
        }
        columns
            .iter()
            .map(|c| self.column_index(c).ok_or_else(mismatch))
            .collect()
    }

    /// Keep only rows for which `keep` returns true.
    /// Replace the column names positionally, keeping every row.
    pub fn rename_columns(self, columns: Vec<String>) -> Result<RecordSet> {
        if columns.len() != self.columns.len() {
            return Err(SyncError::ShapeMismatch(format!(
                "cannot name {} columns with [{}]",
                self.columns.len(),
                columns.join(", ")
            )));
        }
        let renamed = RecordSet::new(columns)?;
        Ok(Self {
            columns: renamed.columns,
            rows: self.rows,
        })
    }

    pub(crate) fn retain_rows(&mut self, mut keep: impl FnMut(&[Value]) -> bool) {
        self.rows.retain(|row| keep(row));
    }

    pub(crate) fn from_parts_unchecked(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        Self { columns, rows }
    }
}

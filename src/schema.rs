//! Schema Registry - declared or inferred column contract for a pipeline
//!
//! A declared schema is authoritative and checked strictly against every
//! extracted record set. An empty schema is inferred from the first extraction
//! and written back through a [`SchemaStore`].

use crate::error::{Result, SyncError};
use crate::record::RecordSet;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// One named, typed column
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaField {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: String,
}

impl SchemaField {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
        }
    }
}

/// Ordered fields with unique names
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct Schema {
    pub fields: Vec<SchemaField>,
}

impl Schema {
    pub fn new(fields: Vec<SchemaField>) -> Self {
        Self { fields }
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.name.as_str()).collect()
    }

    /// One field per column, typed by the column's runtime values.
    pub fn infer(records: &RecordSet) -> Self {
        let fields = records
            .columns()
            .iter()
            .enumerate()
            .map(|(idx, name)| SchemaField::new(name.clone(), records.column_type(idx)))
            .collect();
        Self { fields }
    }

    fn check_unique(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for field in &self.fields {
            if !seen.insert(field.name.as_str()) {
                return Err(SyncError::Config(format!(
                    "schema declares column '{}' more than once",
                    field.name
                )));
            }
        }
        Ok(())
    }
}

/// Outcome of [`SchemaRegistry::validate_or_infer`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SchemaResolution {
    pub schema: Schema,
    /// True when the schema was inferred (and persisted) by this call
    pub inferred: bool,
}

/// Where an inferred schema gets written
pub trait SchemaStore {
    fn persist(&mut self, schema: &Schema) -> Result<()>;
}

/// Rewrites the `schema` member of the JSON configuration file it was loaded from.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SchemaStore for JsonFileStore {
    fn persist(&mut self, schema: &Schema) -> Result<()> {
        // Re-read the raw document so placeholders and unrelated members survive
        let content = std::fs::read_to_string(&self.path)?;
        let mut document: JsonValue = serde_json::from_str(&content)?;
        let object = document.as_object_mut().ok_or_else(|| {
            SyncError::Config(format!(
                "configuration file {} is not a JSON object",
                self.path.display()
            ))
        })?;
        object.insert("schema".to_string(), serde_json::to_value(schema)?);

        let mut out = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut serializer = serde_json::Serializer::with_formatter(&mut out, formatter);
        document.serialize(&mut serializer)?;
        std::fs::write(&self.path, out)?;
        Ok(())
    }
}

/// Keeps the last persisted schema in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    pub persisted: Option<Schema>,
}

impl SchemaStore for MemoryStore {
    fn persist(&mut self, schema: &Schema) -> Result<()> {
        self.persisted = Some(schema.clone());
        Ok(())
    }
}

pub struct SchemaRegistry {
    schema: Schema,
    store: Box<dyn SchemaStore>,
}

impl SchemaRegistry {
    pub fn new(schema: Schema, store: Box<dyn SchemaStore>) -> Result<Self> {
        schema.check_unique()?;
        Ok(Self { schema, store })
    }

    /// Registry backed by a [`MemoryStore`]
    pub fn in_memory(schema: Schema) -> Result<Self> {
        Self::new(schema, Box::new(MemoryStore::default()))
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Check `records` against the declared schema, or infer and persist one
    /// when none is declared.
    pub fn validate_or_infer(&mut self, records: &RecordSet) -> Result<SchemaResolution> {
        if self.schema.is_empty() {
            let inferred = Schema::infer(records);
            if inferred.is_empty() {
                warn!("Record set has no columns; nothing to infer a schema from.");
                return Ok(SchemaResolution {
                    schema: inferred,
                    inferred: false,
                });
            }
            self.persist(inferred.clone())?;
            info!(
                "Inferred schema with {} columns: {}",
                inferred.fields.len(),
                inferred.names().join(", ")
            );
            return Ok(SchemaResolution {
                schema: inferred,
                inferred: true,
            });
        }

        let declared: HashSet<&str> = self.schema.names().into_iter().collect();
        let found: HashSet<&str> = records.columns().iter().map(String::as_str).collect();

        if declared != found {
            let missing = self
                .schema
                .names()
                .into_iter()
                .filter(|name| !found.contains(name))
                .map(str::to_string)
                .collect();
            let unexpected = records
                .columns()
                .iter()
                .filter(|name| !declared.contains(name.as_str()))
                .cloned()
                .collect();
            return Err(SyncError::SchemaMismatch {
                missing,
                unexpected,
            });
        }

        Ok(SchemaResolution {
            schema: self.schema.clone(),
            inferred: false,
        })
    }

    pub fn field_for(&self, name: &str) -> Result<&SchemaField> {
        self.schema
            .fields
            .iter()
            .find(|f| f.name == name)
            .ok_or_else(|| SyncError::UnknownColumn(name.to_string()))
    }

    /// Make `schema` authoritative and write it back to the configuration store.
    pub fn persist(&mut self, schema: Schema) -> Result<()> {
        schema.check_unique()?;
        self.store.persist(&schema)?;
        self.schema = schema;
        info!("Schema updated and saved to configuration.");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Value;
    use serde_json::json;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Store handle the test can inspect after handing a clone to the registry
    #[derive(Clone, Default)]
    struct SharedStore(Rc<RefCell<Vec<Schema>>>);

    impl SchemaStore for SharedStore {
        fn persist(&mut self, schema: &Schema) -> Result<()> {
            self.0.borrow_mut().push(schema.clone());
            Ok(())
        }
    }

    fn xy_records() -> RecordSet {
        RecordSet::with_rows(
            vec!["x".to_string(), "y".to_string()],
            vec![vec![Value::Int(1), Value::from("a")]],
        )
        .unwrap()
    }

    #[test]
    fn test_first_run_infers_and_persists() {
        let store = SharedStore::default();
        let mut registry = SchemaRegistry::new(Schema::default(), Box::new(store.clone())).unwrap();

        let resolution = registry.validate_or_infer(&xy_records()).unwrap();

        assert!(resolution.inferred);
        assert_eq!(
            resolution.schema.fields,
            vec![SchemaField::new("x", "int64"), SchemaField::new("y", "object")]
        );
        assert_eq!(store.0.borrow().len(), 1);
        assert_eq!(store.0.borrow()[0], resolution.schema);
        assert_eq!(registry.schema(), &resolution.schema);
    }

    #[test]
    fn test_second_run_validates_instead_of_inferring() {
        let store = SharedStore::default();
        let mut registry = SchemaRegistry::new(Schema::default(), Box::new(store.clone())).unwrap();

        registry.validate_or_infer(&xy_records()).unwrap();
        let second = registry.validate_or_infer(&xy_records()).unwrap();

        assert!(!second.inferred);
        assert_eq!(store.0.borrow().len(), 1);
    }

    #[test]
    fn test_mismatch_in_either_direction_fails() {
        let declared = Schema::new(vec![SchemaField::new("x", "int64"), SchemaField::new("y", "object")]);
        let mut registry = SchemaRegistry::in_memory(declared).unwrap();

        let xz = RecordSet::with_rows(
            vec!["x".to_string(), "z".to_string()],
            vec![vec![Value::Int(1), Value::Int(2)]],
        )
        .unwrap();
        match registry.validate_or_infer(&xz) {
            Err(SyncError::SchemaMismatch { missing, unexpected }) => {
                assert_eq!(missing, vec!["y".to_string()]);
                assert_eq!(unexpected, vec!["z".to_string()]);
            }
            other => panic!("expected schema mismatch, got {:?}", other.map(|r| r.inferred)),
        }

        let only_x = RecordSet::with_rows(vec!["x".to_string()], vec![vec![Value::Int(1)]]).unwrap();
        assert!(matches!(
            registry.validate_or_infer(&only_x),
            Err(SyncError::SchemaMismatch { .. })
        ));
    }

    #[test]
    fn test_column_order_does_not_matter() {
        let declared = Schema::new(vec![SchemaField::new("y", "object"), SchemaField::new("x", "int64")]);
        let mut registry = SchemaRegistry::in_memory(declared).unwrap();
        assert!(!registry.validate_or_infer(&xy_records()).unwrap().inferred);
    }

    #[test]
    fn test_field_lookup() {
        let registry = SchemaRegistry::in_memory(Schema::new(vec![SchemaField::new("x", "int64")])).unwrap();
        assert_eq!(registry.field_for("x").unwrap().data_type, "int64");
        assert!(matches!(registry.field_for("nope"), Err(SyncError::UnknownColumn(c)) if c == "nope"));
    }

    #[test]
    fn test_duplicate_declared_fields_rejected() {
        let schema = Schema::new(vec![SchemaField::new("x", "int64"), SchemaField::new("x", "object")]);
        assert!(matches!(SchemaRegistry::in_memory(schema), Err(SyncError::Config(_))));
    }

    #[test]
    fn test_json_file_store_rewrites_only_schema() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.json");
        std::fs::write(
            &path,
            json!({
                "source": {"type": "local_file", "path": "${DATA_DIR}/a.csv", "file_type": "csv"},
                "destination": {"type": "local_file", "path": "b.csv", "file_type": "csv"},
                "schema": []
            })
            .to_string(),
        )
        .unwrap();

        let mut store = JsonFileStore::new(&path);
        store
            .persist(&Schema::new(vec![SchemaField::new("id", "int64")]))
            .unwrap();

        let written: JsonValue = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written["schema"], json!([{"name": "id", "type": "int64"}]));
        assert_eq!(written["source"]["path"], "${DATA_DIR}/a.csv");
        let keys: Vec<&String> = written.as_object().unwrap().keys().collect();
        assert_eq!(keys, vec!["source", "destination", "schema"]);
    }
}

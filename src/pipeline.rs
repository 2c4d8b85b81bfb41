//! Pipeline Orchestrator - one extract -> load cycle between two connectors
//!
//! Resolves both connectors up front (no backend I/O), extracts once, loads
//! once. Any error fails the run; nothing is retried.

use crate::config::PipelineConfig;
use crate::connectors::{self, Connector, Role};
use crate::error::{Result, SyncError};
use crate::schema::{JsonFileStore, SchemaRegistry, SchemaStore};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::Path;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Running,
    Succeeded,
    Failed,
}

/// Summary of a successful run
#[derive(Clone, Debug, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub state: RunState,
    pub rows_extracted: usize,
    /// The schema was inferred from this run's extraction and written back
    pub schema_inferred: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

pub struct Pipeline {
    source: Box<dyn Connector>,
    destination: Box<dyn Connector>,
    registry: SchemaRegistry,
    state: RunState,
}

impl Pipeline {
    /// Load `path` and persist any inferred schema back into it.
    pub fn from_config_file(path: &Path) -> Result<Self> {
        let config = PipelineConfig::from_file(path)?;
        Self::from_config(config, Box::new(JsonFileStore::new(path)))
    }

    pub fn from_config(config: PipelineConfig, store: Box<dyn SchemaStore>) -> Result<Self> {
        let source = connectors::resolve(Role::Source, &config.source)?;
        let destination = connectors::resolve(Role::Destination, &config.destination)?;
        let registry = SchemaRegistry::new(config.schema, store)?;
        Ok(Self::new(source, destination, registry))
    }

    pub fn new(
        source: Box<dyn Connector>,
        destination: Box<dyn Connector>,
        registry: SchemaRegistry,
    ) -> Self {
        Self {
            source,
            destination,
            registry,
            state: RunState::Idle,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    pub fn run(&mut self) -> Result<RunReport> {
        if self.state != RunState::Idle {
            return Err(SyncError::Config(
                "pipeline has already run; build a new one for another transfer".to_string(),
            ));
        }

        let run_id = Uuid::new_v4().to_string();
        let started_at = Utc::now();
        self.state = RunState::Running;
        info!(
            "Starting run {}: {} -> {}",
            run_id,
            self.source.describe(),
            self.destination.describe()
        );

        match self.transfer() {
            Ok((rows_extracted, schema_inferred)) => {
                self.state = RunState::Succeeded;
                let report = RunReport {
                    run_id,
                    state: self.state,
                    rows_extracted,
                    schema_inferred,
                    started_at,
                    finished_at: Utc::now(),
                };
                info!(
                    "Run {} succeeded: {} rows in {} ms",
                    report.run_id,
                    report.rows_extracted,
                    (report.finished_at - report.started_at).num_milliseconds()
                );
                Ok(report)
            }
            Err(e) => {
                self.state = RunState::Failed;
                error!("Run {} failed: {}", run_id, e);
                Err(e)
            }
        }
    }

    fn transfer(&mut self) -> Result<(usize, bool)> {
        let had_schema = !self.registry.schema().is_empty();

        let records = self.source.extract(&mut self.registry)?;
        let rows = records.len();

        let inferred = !had_schema && !self.registry.schema().is_empty();
        if inferred {
            warn!(
                "No schema was declared; inferred [{}] from the source and saved it to the configuration.",
                self.registry.schema().names().join(", ")
            );
        }

        self.destination.load(records)?;
        Ok((rows, inferred))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{RecordSet, Value};
    use crate::schema::{Schema, SchemaField};
    use std::cell::RefCell;
    use std::rc::Rc;

    struct StaticSource {
        records: RecordSet,
    }

    impl Connector for StaticSource {
        fn role(&self) -> Role {
            Role::Source
        }

        fn describe(&self) -> String {
            "static".to_string()
        }

        fn extract(&mut self, schema: &mut SchemaRegistry) -> Result<RecordSet> {
            schema.validate_or_infer(&self.records)?;
            Ok(self.records.clone())
        }

        fn load(&mut self, _records: RecordSet) -> Result<()> {
            Err(SyncError::Load("static source".to_string()))
        }
    }

    #[derive(Clone, Default)]
    struct RecordingSink(Rc<RefCell<Vec<RecordSet>>>);

    impl Connector for RecordingSink {
        fn role(&self) -> Role {
            Role::Destination
        }

        fn describe(&self) -> String {
            "sink".to_string()
        }

        fn extract(&mut self, _schema: &mut SchemaRegistry) -> Result<RecordSet> {
            Err(SyncError::Extraction("sink".to_string()))
        }

        fn load(&mut self, records: RecordSet) -> Result<()> {
            self.0.borrow_mut().push(records);
            Ok(())
        }
    }

    fn records() -> RecordSet {
        RecordSet::with_rows(
            vec!["id".to_string()],
            vec![vec![Value::Int(1)], vec![Value::Int(2)]],
        )
        .unwrap()
    }

    #[test]
    fn test_run_moves_records_and_reports_inference() {
        let sink = RecordingSink::default();
        let mut pipeline = Pipeline::new(
            Box::new(StaticSource { records: records() }),
            Box::new(sink.clone()),
            SchemaRegistry::in_memory(Schema::default()).unwrap(),
        );
        assert_eq!(pipeline.state(), RunState::Idle);

        let report = pipeline.run().unwrap();

        assert_eq!(report.state, RunState::Succeeded);
        assert_eq!(report.rows_extracted, 2);
        assert!(report.schema_inferred);
        assert!(report.finished_at >= report.started_at);
        assert_eq!(sink.0.borrow().as_slice(), &[records()]);
        assert_eq!(pipeline.registry().schema().names(), vec!["id"]);
    }

    #[test]
    fn test_schema_mismatch_fails_before_load() {
        let sink = RecordingSink::default();
        let declared = Schema::new(vec![SchemaField::new("other", "int64")]);
        let mut pipeline = Pipeline::new(
            Box::new(StaticSource { records: records() }),
            Box::new(sink.clone()),
            SchemaRegistry::in_memory(declared).unwrap(),
        );

        assert!(matches!(pipeline.run(), Err(SyncError::SchemaMismatch { .. })));
        assert_eq!(pipeline.state(), RunState::Failed);
        assert!(sink.0.borrow().is_empty());
    }

    #[test]
    fn test_pipeline_runs_once() {
        let declared = Schema::new(vec![SchemaField::new("id", "int64")]);
        let mut pipeline = Pipeline::new(
            Box::new(StaticSource { records: records() }),
            Box::new(RecordingSink::default()),
            SchemaRegistry::in_memory(declared).unwrap(),
        );

        assert!(!pipeline.run().unwrap().schema_inferred);
        assert!(matches!(pipeline.run(), Err(SyncError::Config(_))));
        assert_eq!(pipeline.state(), RunState::Succeeded);
    }
}

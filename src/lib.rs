pub mod config;
pub mod connectors;
pub mod error;
pub mod merge;
pub mod pipeline;
pub mod record;
pub mod schema;

pub use config::{ConnectionConfig, PipelineConfig};
pub use connectors::{Connector, Role};
pub use error::{Result, SyncError};
pub use merge::{merge, MergeStrategy};
pub use pipeline::{Pipeline, RunReport, RunState};
pub use record::{RecordSet, Value};
pub use schema::{Schema, SchemaField, SchemaRegistry, SchemaResolution};

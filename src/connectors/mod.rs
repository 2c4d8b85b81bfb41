//! Connector Trait - uniform extract/load interface over every backend
//!
//! Implementations:
//! - ApiConnector: HTTP/REST endpoints
//! - LocalFileConnector: CSV, JSON and Parquet files on disk
//! - GcsConnector: objects in a bucket, staged through a local file
//! - BigQueryConnector: warehouse tables

pub mod api;
pub mod bigquery;
pub mod codec;
pub mod gcs;
pub mod http;
pub mod local_file;

pub use api::ApiConnector;
pub use bigquery::{BigQueryClient, BigQueryConnector, TableRef, WarehouseClient};
pub use gcs::{GcsClient, GcsConnector, ObjectStore};
pub use local_file::LocalFileConnector;

use crate::config::{BackendConfig, ConnectionConfig};
use crate::error::Result;
use crate::record::RecordSet;
use crate::schema::SchemaRegistry;
use std::fmt;

/// Which end of the pipeline a connector serves
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Source,
    Destination,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Source => f.write_str("source"),
            Role::Destination => f.write_str("destination"),
        }
    }
}

pub trait Connector {
    fn role(&self) -> Role;

    /// Short human-readable location, used in log lines
    fn describe(&self) -> String;

    /// Read every row from the backend and check it against `schema`,
    /// inferring and persisting a schema when none is declared.
    fn extract(&mut self, schema: &mut SchemaRegistry) -> Result<RecordSet>;

    /// Write `records`, merging with existing data when the connection asks for it.
    fn load(&mut self, records: RecordSet) -> Result<()>;
}

/// Build the connector for `config`. Performs no I/O.
pub fn resolve(role: Role, config: &ConnectionConfig) -> Result<Box<dyn Connector>> {
    let strategy = config.merge_strategy();
    let connector: Box<dyn Connector> = match &config.backend {
        BackendConfig::Api(api) => Box::new(ApiConnector::new(role, api, strategy)?),
        BackendConfig::LocalFile(file) => Box::new(LocalFileConnector::new(role, file, strategy)?),
        BackendConfig::Gcs(gcs) => Box::new(GcsConnector::new(role, gcs, strategy)?),
        BackendConfig::Bigquery(bq) => Box::new(BigQueryConnector::new(role, bq, strategy)?),
    };
    Ok(connector)
}

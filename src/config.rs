//! Pipeline configuration document
//!
//! A JSON object with `source`, `destination` and `schema` members. Connection
//! configs are a closed set of variants selected by their `type` tag; required
//! backend fields are optional here and checked when the connector is built.

use crate::error::{Result, SyncError};
use crate::merge::MergeStrategy;
use crate::schema::Schema;
use lazy_static::lazy_static;
use regex::{Captures, Regex};
use serde::Deserialize;
use serde_json::{Map, Value as JsonValue};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{error, info};

lazy_static! {
    static ref ENV_VAR_RE: Regex =
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid env var regex");
}

/// Environment variable consulted when a Google connection has no `access_token`
pub const GOOGLE_TOKEN_ENV: &str = "GOOGLE_OAUTH_ACCESS_TOKEN";

#[derive(Clone, Debug, Deserialize)]
pub struct PipelineConfig {
    pub source: ConnectionConfig,
    pub destination: ConnectionConfig,
    #[serde(default)]
    pub schema: Schema,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ConnectionConfig {
    #[serde(flatten)]
    pub backend: BackendConfig,

    /// Column whose values identify a row for upsert-style merging
    #[serde(default)]
    pub primary_key: Option<String>,

    #[serde(default)]
    pub dedupe_using_all_columns: bool,
}

impl ConnectionConfig {
    pub fn merge_strategy(&self) -> MergeStrategy {
        MergeStrategy::new(self.primary_key.clone(), self.dedupe_using_all_columns)
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendConfig {
    Api(ApiConfig),
    LocalFile(LocalFileConfig),
    Gcs(GcsConfig),
    Bigquery(BigQueryConfig),
}

impl BackendConfig {
    pub fn type_name(&self) -> &'static str {
        match self {
            BackendConfig::Api(_) => "api",
            BackendConfig::LocalFile(_) => "local_file",
            BackendConfig::Gcs(_) => "gcs",
            BackendConfig::Bigquery(_) => "bigquery",
        }
    }
}

// ---------------------------------------------------------------------------
// API
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthConfig {
    Disabled,
    Basic {
        username: String,
        password: String,
    },
    /// Accepted by the grammar; connectors refuse it
    ApiKey {
        #[serde(default)]
        api_key: Option<String>,
    },
}

/// How a single JSON object response is laid out
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JsonOrientation {
    /// `{column: [values] | {index: value}}`
    Columns,
    /// `{index: {column: value}}`
    Index,
}

fn default_request_delay_ms() -> u64 {
    100
}

#[derive(Clone, Debug, Deserialize)]
pub struct ApiConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub method: Option<HttpMethod>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub query_params: Map<String, JsonValue>,
    #[serde(default)]
    pub body: Option<JsonValue>,
    #[serde(default)]
    pub auth: Option<AuthConfig>,
    /// Dotted path to the payload inside the response body
    #[serde(default)]
    pub data_key: Option<String>,
    #[serde(default)]
    pub json_orientation: Option<JsonOrientation>,
    /// Pause between consecutive requests when loading
    #[serde(default = "default_request_delay_ms")]
    pub request_delay_ms: u64,
}

// ---------------------------------------------------------------------------
// Files
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Csv,
    Json,
    Parquet,
    Xlsx,
    Xml,
}

impl FileType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileType::Csv => "csv",
            FileType::Json => "json",
            FileType::Parquet => "parquet",
            FileType::Xlsx => "xlsx",
            FileType::Xml => "xml",
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct FileTypeOptions {
    /// CSV field separator, `,` when unset
    #[serde(default)]
    pub delimiter: Option<char>,
    /// CSV header row, present when unset
    #[serde(default)]
    pub has_header: Option<bool>,
    /// JSON output as one record per line (default) or a single array
    #[serde(default)]
    pub lines: Option<bool>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct LocalFileConfig {
    #[serde(default, alias = "file_path")]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub file_type: Option<FileType>,
    #[serde(default)]
    pub file_type_options: FileTypeOptions,
}

// ---------------------------------------------------------------------------
// Google Cloud
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Deserialize)]
pub struct GcsConfig {
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default, alias = "object_path")]
    pub gcs_path: Option<String>,

    /// Local staging file; defaults to a path under the system temp dir
    #[serde(default, alias = "file_path")]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub file_type: Option<FileType>,
    #[serde(default)]
    pub file_type_options: FileTypeOptions,

    /// Needed only when the bucket has to be created
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WriteDisposition {
    #[default]
    Append,
    Truncate,
}

impl WriteDisposition {
    pub fn as_api(&self) -> &'static str {
        match self {
            WriteDisposition::Append => "WRITE_APPEND",
            WriteDisposition::Truncate => "WRITE_TRUNCATE",
        }
    }
}

fn default_location() -> String {
    "EU".to_string()
}

#[derive(Clone, Debug, Deserialize)]
pub struct BigQueryConfig {
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub dataset: Option<String>,
    #[serde(default)]
    pub table: Option<String>,
    #[serde(default)]
    pub write_disposition: Option<WriteDisposition>,
    #[serde(default = "default_location", alias = "multi_region_location")]
    pub location: String,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
}

/// Explicit token, falling back to [`GOOGLE_TOKEN_ENV`]
pub fn google_access_token(explicit: Option<&str>) -> Option<String> {
    explicit
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .or_else(|| std::env::var(GOOGLE_TOKEN_ENV).ok().filter(|t| !t.is_empty()))
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Substitute `${VAR_NAME}` patterns with environment variable values.
pub fn substitute_env_vars(input: &str) -> Result<String> {
    let mut missing = Vec::new();
    let result = ENV_VAR_RE.replace_all(input, |caps: &Captures| match std::env::var(&caps[1]) {
        Ok(value) => value,
        Err(_) => {
            missing.push(caps[1].to_string());
            caps[0].to_string()
        }
    });

    if !missing.is_empty() {
        return Err(SyncError::Config(format!(
            "Missing environment variable(s): {}",
            missing.join(", ")
        )));
    }
    Ok(result.into_owned())
}

impl FromStr for PipelineConfig {
    type Err = SyncError;

    fn from_str(text: &str) -> Result<Self> {
        let substituted = substitute_env_vars(text)?;
        serde_json::from_str(&substituted)
            .map_err(|e| SyncError::Config(format!("Failed to parse configuration: {}", e)))
    }
}

impl PipelineConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            error!("Configuration file not readable: {}", path.display());
            if e.kind() == std::io::ErrorKind::NotFound {
                SyncError::NotFound(format!("configuration file {}", path.display()))
            } else {
                SyncError::Io(e)
            }
        })?;
        let config: PipelineConfig = content.parse()?;
        info!(
            "Configuration loaded: {} -> {}, {} declared schema fields",
            config.source.backend.type_name(),
            config.destination.backend.type_name(),
            config.schema.fields.len()
        );
        Ok(config)
    }
}

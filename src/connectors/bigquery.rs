//! BigQuery Connector - warehouse tables as sources and destinations
//!
//! Reads are full-table queries. Loads are batch load jobs of
//! newline-delimited JSON. With a merge strategy, the existing table is read
//! back in full and merged locally before the load job is submitted.

use super::{http, Connector, Role};
use crate::config::{google_access_token, BigQueryConfig, WriteDisposition, GOOGLE_TOKEN_ENV};
use crate::error::{Result, SyncError};
use crate::merge::{self, MergeStrategy};
use crate::record::{RecordSet, Value};
use crate::schema::SchemaRegistry;
use reqwest::blocking::Client;
use reqwest::StatusCode;
use serde_json::{json, Value as JsonValue};
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

const DEFAULT_BIGQUERY_ENDPOINT: &str = "https://bigquery.googleapis.com";
const JOB_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Fully qualified table name
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TableRef {
    pub project: String,
    pub dataset: String,
    pub table: String,
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.project, self.dataset, self.table)
    }
}

/// Warehouse operations the connector needs
pub trait WarehouseClient {
    fn dataset_exists(&self, project: &str, dataset: &str) -> Result<bool>;
    fn create_dataset(&self, project: &str, dataset: &str, location: &str) -> Result<()>;
    fn table_exists(&self, table: &TableRef) -> Result<bool>;
    /// Every row of `table`
    fn read_table(&self, table: &TableRef) -> Result<RecordSet>;
    /// Run a load job; the table is created when missing.
    fn load(&self, table: &TableRef, records: &RecordSet, disposition: WriteDisposition) -> Result<()>;
}

/// [`WarehouseClient`] over the BigQuery REST API
pub struct BigQueryClient {
    http: Client,
    endpoint: String,
    token: String,
    location: String,
}

impl BigQueryClient {
    pub fn new(token: String, endpoint: Option<String>, location: String) -> Result<Self> {
        Ok(Self {
            http: http::client()?,
            endpoint: endpoint.unwrap_or_else(|| DEFAULT_BIGQUERY_ENDPOINT.to_string()),
            token,
            location,
        })
    }

    fn url(&self, segments: &[&str]) -> Result<reqwest::Url> {
        let mut all = vec!["bigquery", "v2", "projects"];
        all.extend_from_slice(segments);
        http::url_with_segments(&self.endpoint, &all)
    }

    fn exists(&self, url: reqwest::Url, context: &str) -> Result<bool> {
        let response = self.http.get(url).bearer_auth(&self.token).send()?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        http::ensure_success(response, context)?;
        Ok(true)
    }

    /// Run `sql` and collect every result page.
    pub fn query(&self, project: &str, sql: &str) -> Result<RecordSet> {
        debug!("Running query: {}", sql);
        let response = self
            .http
            .post(self.url(&[project, "queries"])?)
            .bearer_auth(&self.token)
            .json(&json!({
                "query": sql,
                "useLegacySql": false,
                "location": self.location,
                "timeoutMs": 10000,
            }))
            .send()?;
        let mut page: JsonValue = http::ensure_success(response, "Query")?.json()?;

        let job_id = page["jobReference"]["jobId"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| SyncError::Backend("query response carries no job id".to_string()))?;
        let results_url = self.url(&[project, "queries", &job_id])?;

        let mut records = RecordSet::empty();
        loop {
            let complete = page["jobComplete"].as_bool().unwrap_or(false);
            if let Some(error) = page.get("errors").and_then(|e| e.as_array()).filter(|e| !e.is_empty()) {
                return Err(SyncError::Backend(format!("query failed: {}", JsonValue::Array(error.clone()))));
            }
            if complete {
                records = records.concat(query_page_records(&page)?)?;
            }
            let page_token = page["pageToken"].as_str().map(str::to_string);
            if complete && page_token.is_none() {
                break;
            }

            let mut request = self
                .http
                .get(results_url.clone())
                .bearer_auth(&self.token)
                .query(&[("location", self.location.as_str()), ("timeoutMs", "10000")]);
            if let Some(token) = page_token {
                request = request.query(&[("pageToken", token)]);
            }
            page = http::ensure_success(request.send()?, "Query results")?.json()?;
        }
        Ok(records)
    }

    fn wait_for_job(&self, project: &str, job: &JsonValue) -> Result<()> {
        let job_id = job["jobReference"]["jobId"]
            .as_str()
            .ok_or_else(|| SyncError::Backend("load job response carries no job id".to_string()))?
            .to_string();
        let url = self.url(&[project, "jobs", &job_id])?;

        let mut status = job["status"].clone();
        while status["state"].as_str() != Some("DONE") {
            std::thread::sleep(JOB_POLL_INTERVAL);
            let response = self
                .http
                .get(url.clone())
                .bearer_auth(&self.token)
                .query(&[("location", self.location.as_str())])
                .send()?;
            let job: JsonValue = http::ensure_success(response, "Job status")?.json()?;
            status = job["status"].clone();
            debug!("Job {} state: {}", job_id, status["state"]);
        }

        if let Some(error) = status.get("errorResult").filter(|e| !e.is_null()) {
            return Err(SyncError::Backend(format!("job {} failed: {}", job_id, error)));
        }
        Ok(())
    }
}

impl WarehouseClient for BigQueryClient {
    fn dataset_exists(&self, project: &str, dataset: &str) -> Result<bool> {
        let url = self.url(&[project, "datasets", dataset])?;
        self.exists(url, &format!("Dataset lookup {}.{}", project, dataset))
    }

    fn create_dataset(&self, project: &str, dataset: &str, location: &str) -> Result<()> {
        let response = self
            .http
            .post(self.url(&[project, "datasets"])?)
            .bearer_auth(&self.token)
            .json(&json!({
                "datasetReference": {"projectId": project, "datasetId": dataset},
                "location": location,
            }))
            .send()?;
        http::ensure_success(response, &format!("Dataset creation {}.{}", project, dataset))?;
        Ok(())
    }

    fn table_exists(&self, table: &TableRef) -> Result<bool> {
        let url = self.url(&[&table.project, "datasets", &table.dataset, "tables", &table.table])?;
        self.exists(url, &format!("Table lookup {}", table))
    }

    fn read_table(&self, table: &TableRef) -> Result<RecordSet> {
        self.query(&table.project, &format!("SELECT * FROM `{}`", table))
    }

    fn load(&self, table: &TableRef, records: &RecordSet, disposition: WriteDisposition) -> Result<()> {
        let metadata = load_job_metadata(table, disposition, &self.location);
        let mut data = Vec::new();
        for row in records.to_json_rows() {
            serde_json::to_writer(&mut data, &row)?;
            data.push(b'\n');
        }

        let boundary = format!("tabsync-{}", Uuid::new_v4().simple());
        let body = multipart_related(&boundary, &metadata, &data)?;
        let mut url = http::url_with_segments(
            &self.endpoint,
            &["upload", "bigquery", "v2", "projects", &table.project, "jobs"],
        )?;
        url.query_pairs_mut().append_pair("uploadType", "multipart");

        let response = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .header(
                reqwest::header::CONTENT_TYPE,
                format!("multipart/related; boundary={}", boundary),
            )
            .body(body)
            .send()?;
        let job: JsonValue = http::ensure_success(response, &format!("Load job into {}", table))?.json()?;
        self.wait_for_job(&table.project, &job)
    }
}

fn load_job_metadata(table: &TableRef, disposition: WriteDisposition, location: &str) -> JsonValue {
    json!({
        "jobReference": {"projectId": table.project, "location": location},
        "configuration": {
            "load": {
                "destinationTable": {
                    "projectId": table.project,
                    "datasetId": table.dataset,
                    "tableId": table.table,
                },
                "sourceFormat": "NEWLINE_DELIMITED_JSON",
                "autodetect": true,
                "createDisposition": "CREATE_IF_NEEDED",
                "writeDisposition": disposition.as_api(),
            }
        }
    })
}

fn multipart_related(boundary: &str, metadata: &JsonValue, data: &[u8]) -> Result<Vec<u8>> {
    let mut body = Vec::with_capacity(data.len() + 512);
    body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
    body.extend_from_slice(b"Content-Type: application/json; charset=UTF-8\r\n\r\n");
    serde_json::to_writer(&mut body, metadata)?;
    body.extend_from_slice(format!("\r\n--{}\r\n", boundary).as_bytes());
    body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
    body.extend_from_slice(data);
    body.extend_from_slice(format!("\r\n--{}--\r\n", boundary).as_bytes());
    Ok(body)
}

/// Rows of one `queries` / `getQueryResults` page, typed by the page schema.
fn query_page_records(page: &JsonValue) -> Result<RecordSet> {
    let fields = page["schema"]["fields"].as_array().cloned().unwrap_or_default();
    let columns = fields
        .iter()
        .map(|f| f["name"].as_str().unwrap_or_default().to_string())
        .collect();
    let mut records = RecordSet::new(columns)?;

    for row in page["rows"].as_array().into_iter().flatten() {
        let cells = row["f"].as_array().cloned().unwrap_or_default();
        let values = fields
            .iter()
            .zip(cells.iter())
            .map(|(field, cell)| Value::from_json(cell_to_json(field, &cell["v"])))
            .collect();
        records.push_row(values)?;
    }
    Ok(records)
}

/// BigQuery returns every scalar as a string; restore JSON types from the field schema.
fn cell_to_json(field: &JsonValue, v: &JsonValue) -> JsonValue {
    if v.is_null() {
        return JsonValue::Null;
    }
    if field["mode"].as_str() == Some("REPEATED") {
        let mut element = field.clone();
        element["mode"] = json!("NULLABLE");
        let items = v.as_array().map(Vec::as_slice).unwrap_or_default();
        return JsonValue::Array(items.iter().map(|item| cell_to_json(&element, &item["v"])).collect());
    }

    let text = v.as_str();
    match field["type"].as_str().unwrap_or("STRING") {
        "RECORD" | "STRUCT" => {
            let subfields = field["fields"].as_array().map(Vec::as_slice).unwrap_or_default();
            let cells = v["f"].as_array().map(Vec::as_slice).unwrap_or_default();
            let mut object = serde_json::Map::new();
            for (sub, cell) in subfields.iter().zip(cells) {
                let name = sub["name"].as_str().unwrap_or_default().to_string();
                object.insert(name, cell_to_json(sub, &cell["v"]));
            }
            JsonValue::Object(object)
        }
        "INTEGER" | "INT64" => text
            .and_then(|t| t.parse::<i64>().ok())
            .map(JsonValue::from)
            .unwrap_or_else(|| v.clone()),
        "FLOAT" | "FLOAT64" | "NUMERIC" | "BIGNUMERIC" => text
            .and_then(|t| t.parse::<f64>().ok())
            .and_then(serde_json::Number::from_f64)
            .map(JsonValue::Number)
            .unwrap_or_else(|| v.clone()),
        "BOOLEAN" | "BOOL" => match text {
            Some("true") => JsonValue::Bool(true),
            Some("false") => JsonValue::Bool(false),
            _ => v.clone(),
        },
        "JSON" => text
            .and_then(|t| serde_json::from_str(t).ok())
            .unwrap_or_else(|| v.clone()),
        _ => v.clone(),
    }
}

pub struct BigQueryConnector {
    role: Role,
    table: TableRef,
    write_disposition: WriteDisposition,
    location: String,
    strategy: MergeStrategy,
    client: Box<dyn WarehouseClient>,
}

impl BigQueryConnector {
    pub fn new(role: Role, config: &BigQueryConfig, strategy: MergeStrategy) -> Result<Self> {
        let token = google_access_token(config.access_token.as_deref()).ok_or_else(|| {
            SyncError::Config(format!(
                "bigquery {} requires 'access_token' or {}",
                role, GOOGLE_TOKEN_ENV
            ))
        })?;
        let client = BigQueryClient::new(token, config.endpoint.clone(), config.location.clone())?;
        Self::with_client(role, config, strategy, Box::new(client))
    }

    /// Connector over a caller-supplied warehouse client
    pub fn with_client(
        role: Role,
        config: &BigQueryConfig,
        strategy: MergeStrategy,
        client: Box<dyn WarehouseClient>,
    ) -> Result<Self> {
        let required = |value: &Option<String>, name: &str| {
            value
                .clone()
                .filter(|v| !v.is_empty())
                .ok_or_else(|| SyncError::Config(format!("bigquery {} requires '{}'", role, name)))
        };
        let table = TableRef {
            project: required(&config.project, "project")?,
            dataset: required(&config.dataset, "dataset")?,
            table: required(&config.table, "table")?,
        };

        Ok(Self {
            role,
            table,
            write_disposition: config.write_disposition.unwrap_or_default(),
            location: config.location.clone(),
            strategy,
            client,
        })
    }

    pub fn table(&self) -> &TableRef {
        &self.table
    }

    fn ensure_dataset(&self) -> Result<()> {
        let TableRef { project, dataset, .. } = &self.table;
        if !self.client.dataset_exists(project, dataset)? {
            self.client.create_dataset(project, dataset, &self.location)?;
            info!("Created dataset {}.{} in {}", project, dataset, self.location);
        }
        Ok(())
    }

    /// Current table contents; a missing table reads as header-only so the
    /// merge still applies its strategy to the new rows.
    fn existing_records(&self, records: &RecordSet) -> Result<RecordSet> {
        if self.client.table_exists(&self.table)? {
            self.client.read_table(&self.table)
        } else {
            RecordSet::new(records.columns().to_vec())
        }
    }
}

impl Connector for BigQueryConnector {
    fn role(&self) -> Role {
        self.role
    }

    fn describe(&self) -> String {
        format!("bigquery:{}", self.table)
    }

    fn extract(&mut self, schema: &mut SchemaRegistry) -> Result<RecordSet> {
        if !self
            .client
            .table_exists(&self.table)
            .map_err(SyncError::into_extraction)?
        {
            return Err(SyncError::NotFound(format!("table {}", self.table)));
        }
        let records = self
            .client
            .read_table(&self.table)
            .map_err(SyncError::into_extraction)?;
        schema.validate_or_infer(&records)?;
        info!("Extracted {} records from {}", records.len(), self.describe());
        Ok(records)
    }

    fn load(&mut self, records: RecordSet) -> Result<()> {
        self.ensure_dataset().map_err(SyncError::into_load)?;

        let mut disposition = self.write_disposition;
        let mut implicit_truncate = false;
        if self.strategy.dedupe_all_columns && disposition != WriteDisposition::Truncate {
            info!("dedupe_using_all_columns is set; overriding write_disposition to truncate.");
            disposition = WriteDisposition::Truncate;
            implicit_truncate = true;
        }

        let to_load = if self.strategy.is_active() {
            match self.existing_records(&records) {
                Ok(existing) => {
                    let merged = self.strategy.apply(records, existing.clone())?;
                    match disposition {
                        WriteDisposition::Truncate => merged,
                        WriteDisposition::Append => {
                            let appended = merge::delta(merged, &existing)?;
                            match self.strategy.primary_key.as_deref() {
                                Some(key) => merge::without_existing_keys(appended, &existing, key),
                                None => appended,
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(
                        "Could not read existing data from {} ({}). Proceeding without deduplication.",
                        self.table, e
                    );
                    if implicit_truncate {
                        warn!("Falling back to append so the existing table is left intact.");
                        disposition = WriteDisposition::Append;
                    }
                    records
                }
            }
        } else {
            records
        };

        if to_load.is_empty() {
            info!("No new records to load into {}", self.table);
            return Ok(());
        }

        self.client
            .load(&self.table, &to_load, disposition)
            .map_err(SyncError::into_load)?;
        info!(
            "Loaded {} records into {} ({})",
            to_load.len(),
            self.table,
            disposition.as_api()
        );
        Ok(())
    }
}

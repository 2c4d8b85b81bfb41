//! API Connector - pulls rows from, and pushes rows to, an HTTP endpoint

use super::{http, Connector, Role};
use crate::config::{ApiConfig, AuthConfig, HttpMethod, JsonOrientation};
use crate::error::{Result, SyncError};
use crate::merge::MergeStrategy;
use crate::record::RecordSet;
use crate::schema::SchemaRegistry;
use reqwest::blocking::{Client, RequestBuilder};
use reqwest::Method;
use serde_json::{Map, Value as JsonValue};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct ApiConnector {
    role: Role,
    url: String,
    method: HttpMethod,
    headers: HashMap<String, String>,
    query_params: Vec<(String, String)>,
    body: Option<JsonValue>,
    auth: AuthConfig,
    data_key: Option<String>,
    orientation: Option<JsonOrientation>,
    request_delay: Duration,
    strategy: MergeStrategy,
}

impl ApiConnector {
    pub fn new(role: Role, config: &ApiConfig, strategy: MergeStrategy) -> Result<Self> {
        let url = config
            .url
            .clone()
            .filter(|u| !u.is_empty())
            .ok_or_else(|| SyncError::Config(format!("api {} requires 'url'", role)))?;
        let method = config
            .method
            .ok_or_else(|| SyncError::Config(format!("api {} requires 'method'", role)))?;
        let auth = config
            .auth
            .clone()
            .ok_or_else(|| SyncError::Config(format!("api {} requires 'auth'", role)))?;
        if let AuthConfig::ApiKey { .. } = auth {
            return Err(SyncError::Config(
                "api_key authentication is not supported; use 'basic' or 'disabled'".to_string(),
            ));
        }

        let query_params = config
            .query_params
            .iter()
            .map(|(k, v)| (k.clone(), query_value(v)))
            .collect();

        Ok(Self {
            role,
            url,
            method,
            headers: config.headers.clone(),
            query_params,
            body: config.body.clone(),
            auth,
            data_key: config.data_key.clone().filter(|k| !k.is_empty()),
            orientation: config.json_orientation,
            request_delay: Duration::from_millis(config.request_delay_ms),
            strategy,
        })
    }

    fn request(&self, client: &Client, body: Option<&JsonValue>) -> RequestBuilder {
        let method = match self.method {
            HttpMethod::Get => Method::GET,
            HttpMethod::Post => Method::POST,
            HttpMethod::Put => Method::PUT,
            HttpMethod::Patch => Method::PATCH,
        };
        let mut builder = client.request(method, &self.url).query(&self.query_params);
        for (name, value) in &self.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let AuthConfig::Basic { username, password } = &self.auth {
            builder = builder.basic_auth(username, Some(password));
        }
        match body {
            Some(body) if self.method != HttpMethod::Get => builder.json(body),
            _ => builder,
        }
    }

    fn fetch(&self) -> Result<JsonValue> {
        let client = http::client()?;
        let response = self.request(&client, self.body.as_ref()).send()?;
        let response = http::ensure_success(response, &format!("{} {}", self.method.as_str(), self.url))?;
        Ok(response.json()?)
    }
}

fn query_value(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Turn a response body into rows: walk `data_key`, then lay the payload out
/// according to its shape and `orientation`.
pub fn records_from_response(
    body: JsonValue,
    data_key: Option<&str>,
    orientation: Option<JsonOrientation>,
) -> Result<RecordSet> {
    let payload = match data_key {
        Some(key) => unwrap_data_key(body, key)?,
        None => body,
    };

    match payload {
        JsonValue::Array(items) => rows_from_list(items),
        JsonValue::Object(object) => match orientation {
            None => Ok(RecordSet::from_json_objects(vec![object])),
            Some(JsonOrientation::Columns) => rows_from_columns(object),
            Some(JsonOrientation::Index) => {
                rows_from_list(object.into_iter().map(|(_, row)| row).collect())
            }
        },
        other => Err(SyncError::Extraction(format!(
            "response payload must be a JSON list or object, got: {}",
            other
        ))),
    }
}

fn unwrap_data_key(body: JsonValue, key: &str) -> Result<JsonValue> {
    let mut current = body;
    for segment in key.split('.') {
        let next = match current {
            JsonValue::Object(mut object) => object.remove(segment),
            JsonValue::Array(mut items) => match segment.parse::<usize>() {
                Ok(idx) if idx < items.len() => Some(items.swap_remove(idx)),
                _ => None,
            },
            _ => None,
        };
        current = next.ok_or_else(|| {
            SyncError::Extraction(format!(
                "data_key '{}': segment '{}' not found in response",
                key, segment
            ))
        })?;
    }
    Ok(current)
}

fn rows_from_list(items: Vec<JsonValue>) -> Result<RecordSet> {
    let mut objects = Vec::with_capacity(items.len());
    for (idx, item) in items.into_iter().enumerate() {
        match item {
            JsonValue::Object(object) => objects.push(object),
            other => {
                return Err(SyncError::Extraction(format!(
                    "malformed response: element {} is not an object: {}",
                    idx, other
                )))
            }
        }
    }
    Ok(RecordSet::from_json_objects(objects))
}

/// `{col: [v, ..]}` or `{col: {idx: v}}`
fn rows_from_columns(object: Map<String, JsonValue>) -> Result<RecordSet> {
    let mut index: Vec<String> = Vec::new();
    let mut rows: HashMap<String, Map<String, JsonValue>> = HashMap::new();

    for (column, values) in object {
        let cells: Vec<(String, JsonValue)> = match values {
            JsonValue::Array(items) => items
                .into_iter()
                .enumerate()
                .map(|(i, v)| (i.to_string(), v))
                .collect(),
            JsonValue::Object(map) => map.into_iter().collect(),
            other => {
                return Err(SyncError::Extraction(format!(
                    "malformed columns payload: column '{}' holds {}",
                    column, other
                )))
            }
        };
        for (idx, value) in cells {
            let row = rows.entry(idx.clone()).or_insert_with(|| {
                index.push(idx);
                Map::new()
            });
            row.insert(column.clone(), value);
        }
    }

    let objects = index
        .into_iter()
        .filter_map(|idx| rows.remove(&idx))
        .collect();
    Ok(RecordSet::from_json_objects(objects))
}

impl Connector for ApiConnector {
    fn role(&self) -> Role {
        self.role
    }

    fn describe(&self) -> String {
        format!("{} {}", self.method.as_str(), self.url)
    }

    fn extract(&mut self, schema: &mut SchemaRegistry) -> Result<RecordSet> {
        let body = self.fetch().map_err(SyncError::into_extraction)?;
        let records = records_from_response(body, self.data_key.as_deref(), self.orientation)?;
        schema.validate_or_infer(&records)?;
        info!("Extracted {} records from {}", records.len(), self.describe());
        Ok(records)
    }

    fn load(&mut self, records: RecordSet) -> Result<()> {
        if self.strategy.is_active() {
            warn!("API destinations cannot deduplicate; primary_key and dedupe_using_all_columns are ignored.");
        }
        let client = http::client().map_err(SyncError::into_load)?;
        let context = self.describe();

        for (idx, row) in records.to_json_rows().iter().enumerate() {
            if idx > 0 && !self.request_delay.is_zero() {
                std::thread::sleep(self.request_delay);
            }
            let response = self
                .request(&client, Some(row))
                .send()
                .map_err(|e| SyncError::from(e).into_load())?;
            http::ensure_success(response, &context).map_err(SyncError::into_load)?;
            debug!("Sent record {} to {}", idx + 1, context);
        }
        info!("Sent {} records to {}", records.len(), context);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Value;
    use serde_json::json;

    fn config(value: JsonValue) -> ApiConfig {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_data_key_walks_objects_and_indices() {
        let body = json!({"data": {"pages": [{"items": [{"id": 1}, {"id": 2}]}]}});
        let records = records_from_response(body, Some("data.pages.0.items"), None).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records.value(1, "id"), Some(&Value::Int(2)));
    }

    #[test]
    fn test_missing_data_key_segment_is_extraction_error() {
        let body = json!({"data": {"items": []}});
        match records_from_response(body, Some("data.rows"), None) {
            Err(SyncError::Extraction(msg)) => assert!(msg.contains("'rows'")),
            other => panic!("expected extraction error, got {:?}", other),
        }
    }

    #[test]
    fn test_single_object_becomes_one_row() {
        let records = records_from_response(json!({"id": 7, "name": "x"}), None, None).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records.columns(), &["id", "name"]);
    }

    #[test]
    fn test_columns_orientation() {
        let from_lists =
            records_from_response(json!({"id": [1, 2], "v": ["a", "b"]}), None, Some(JsonOrientation::Columns))
                .unwrap();
        let from_maps = records_from_response(
            json!({"id": {"0": 1, "1": 2}, "v": {"0": "a", "1": "b"}}),
            None,
            Some(JsonOrientation::Columns),
        )
        .unwrap();
        assert_eq!(from_lists, from_maps);
        assert_eq!(from_lists.value(1, "v"), Some(&Value::from("b")));
    }

    #[test]
    fn test_index_orientation() {
        let records = records_from_response(
            json!({"r1": {"id": 1}, "r2": {"id": 2, "v": "b"}}),
            None,
            Some(JsonOrientation::Index),
        )
        .unwrap();
        assert_eq!(records.columns(), &["id", "v"]);
        assert_eq!(records.value(0, "v"), Some(&Value::Null));
    }

    #[test]
    fn test_malformed_payloads() {
        assert!(matches!(
            records_from_response(json!([1, 2]), None, None),
            Err(SyncError::Extraction(_))
        ));
        assert!(matches!(
            records_from_response(json!("text"), None, None),
            Err(SyncError::Extraction(_))
        ));
    }

    #[test]
    fn test_construction_validation() {
        let ok = config(json!({"url": "http://localhost/x", "method": "POST", "auth": {"type": "disabled"}}));
        assert!(ApiConnector::new(Role::Destination, &ok, MergeStrategy::default()).is_ok());

        let api_key = config(json!({"url": "http://localhost/x", "method": "GET",
                                    "auth": {"type": "api_key", "api_key": "k"}}));
        assert!(matches!(
            ApiConnector::new(Role::Source, &api_key, MergeStrategy::default()),
            Err(SyncError::Config(_))
        ));

        let no_auth = config(json!({"url": "http://localhost/x", "method": "GET"}));
        assert!(matches!(
            ApiConnector::new(Role::Source, &no_auth, MergeStrategy::default()),
            Err(SyncError::Config(_))
        ));

        let no_url = config(json!({"method": "GET", "auth": {"type": "disabled"}}));
        assert!(matches!(
            ApiConnector::new(Role::Source, &no_url, MergeStrategy::default()),
            Err(SyncError::Config(_))
        ));
    }

    #[test]
    fn test_get_requests_carry_no_body() {
        let api = ApiConnector::new(
            Role::Source,
            &config(json!({"url": "http://localhost/items", "method": "GET", "auth": {"type": "basic",
                           "username": "u", "password": "p"}, "query_params": {"page": 1}})),
            MergeStrategy::default(),
        )
        .unwrap();
        let client = Client::new();
        let request = api.request(&client, Some(&json!({"id": 1}))).build().unwrap();

        assert!(request.body().is_none());
        assert_eq!(request.url().as_str(), "http://localhost/items?page=1");
        assert_eq!(request.headers()["authorization"], "Basic dTpw");
    }
}

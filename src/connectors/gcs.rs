//! GCS Connector - object storage staged through a local file
//!
//! The object is mirrored at a local staging path and all encoding work is
//! delegated to a [`LocalFileConnector`]. The bucket is created on first use
//! when it does not exist.

use super::{http, Connector, LocalFileConnector, Role};
use crate::config::{google_access_token, GcsConfig};
use crate::error::{Result, SyncError};
use crate::merge::MergeStrategy;
use crate::record::RecordSet;
use crate::schema::SchemaRegistry;
use reqwest::blocking::Client;
use reqwest::StatusCode;
use serde_json::json;
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const DEFAULT_GCS_ENDPOINT: &str = "https://storage.googleapis.com";

/// Blob storage operations the connector needs
pub trait ObjectStore {
    fn bucket_exists(&self, bucket: &str) -> Result<bool>;
    fn create_bucket(&self, bucket: &str, project: Option<&str>, location: Option<&str>) -> Result<()>;
    fn object_exists(&self, bucket: &str, object: &str) -> Result<bool>;
    fn download(&self, bucket: &str, object: &str, dest: &Path) -> Result<()>;
    fn upload(&self, bucket: &str, object: &str, src: &Path) -> Result<()>;
}

/// [`ObjectStore`] over the Cloud Storage JSON API
pub struct GcsClient {
    http: Client,
    endpoint: String,
    token: String,
}

impl GcsClient {
    pub fn new(token: String, endpoint: Option<String>) -> Result<Self> {
        Ok(Self {
            http: http::client()?,
            endpoint: endpoint.unwrap_or_else(|| DEFAULT_GCS_ENDPOINT.to_string()),
            token,
        })
    }

    fn object_url(&self, bucket: &str, object: &str) -> Result<reqwest::Url> {
        http::url_with_segments(&self.endpoint, &["storage", "v1", "b", bucket, "o", object])
    }

    /// `Ok(false)` on 404, `Ok(true)` on success
    fn exists(&self, url: reqwest::Url, context: &str) -> Result<bool> {
        let response = self.http.get(url).bearer_auth(&self.token).send()?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        http::ensure_success(response, context)?;
        Ok(true)
    }
}

impl ObjectStore for GcsClient {
    fn bucket_exists(&self, bucket: &str) -> Result<bool> {
        let url = http::url_with_segments(&self.endpoint, &["storage", "v1", "b", bucket])?;
        self.exists(url, &format!("Bucket lookup gs://{}", bucket))
    }

    fn create_bucket(&self, bucket: &str, project: Option<&str>, location: Option<&str>) -> Result<()> {
        let project = project.ok_or_else(|| {
            SyncError::Config(format!("creating bucket '{}' requires 'project'", bucket))
        })?;
        let url = http::url_with_segments(&self.endpoint, &["storage", "v1", "b"])?;
        let mut body = json!({ "name": bucket });
        if let Some(location) = location {
            body["location"] = json!(location);
        }
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .query(&[("project", project)])
            .json(&body)
            .send()?;
        http::ensure_success(response, &format!("Bucket creation gs://{}", bucket))?;
        Ok(())
    }

    fn object_exists(&self, bucket: &str, object: &str) -> Result<bool> {
        let url = self.object_url(bucket, object)?;
        self.exists(url, &format!("Object lookup gs://{}/{}", bucket, object))
    }

    fn download(&self, bucket: &str, object: &str, dest: &Path) -> Result<()> {
        let url = self.object_url(bucket, object)?;
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.token)
            .query(&[("alt", "media")])
            .send()?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(SyncError::NotFound(format!("gs://{}/{}", bucket, object)));
        }
        let mut response = http::ensure_success(response, &format!("Download gs://{}/{}", bucket, object))?;
        let mut file = File::create(dest)?;
        response.copy_to(&mut file)?;
        Ok(())
    }

    fn upload(&self, bucket: &str, object: &str, src: &Path) -> Result<()> {
        let url = http::url_with_segments(&self.endpoint, &["upload", "storage", "v1", "b", bucket, "o"])?;
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .query(&[("uploadType", "media"), ("name", object)])
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(File::open(src)?)
            .send()?;
        http::ensure_success(response, &format!("Upload gs://{}/{}", bucket, object))?;
        Ok(())
    }
}

pub struct GcsConnector {
    bucket: String,
    object: String,
    project: Option<String>,
    location: Option<String>,
    local: LocalFileConnector,
    store: Box<dyn ObjectStore>,
    bucket_ready: bool,
}

impl GcsConnector {
    pub fn new(role: Role, config: &GcsConfig, strategy: MergeStrategy) -> Result<Self> {
        let token = google_access_token(config.access_token.as_deref()).ok_or_else(|| {
            SyncError::Config(format!(
                "gcs {} requires 'access_token' or {}",
                role,
                crate::config::GOOGLE_TOKEN_ENV
            ))
        })?;
        let client = GcsClient::new(token, config.endpoint.clone())?;
        Self::with_store(role, config, strategy, Box::new(client))
    }

    /// Connector over a caller-supplied object store
    pub fn with_store(
        role: Role,
        config: &GcsConfig,
        strategy: MergeStrategy,
        store: Box<dyn ObjectStore>,
    ) -> Result<Self> {
        let bucket = config
            .bucket
            .clone()
            .filter(|b| !b.is_empty())
            .ok_or_else(|| SyncError::Config(format!("gcs {} requires 'bucket'", role)))?;
        let object = config
            .gcs_path
            .clone()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| SyncError::Config(format!("gcs {} requires 'gcs_path'", role)))?;
        let file_type = config
            .file_type
            .ok_or_else(|| SyncError::Config(format!("gcs {} requires 'file_type'", role)))?;
        let staging = config
            .path
            .clone()
            .unwrap_or_else(|| default_staging_path(&bucket, &object));

        let local = LocalFileConnector::from_parts(
            role,
            staging,
            file_type,
            config.file_type_options.clone(),
            strategy,
        )?;

        Ok(Self {
            bucket,
            object,
            project: config.project.clone(),
            location: config.location.clone(),
            local,
            store,
            bucket_ready: false,
        })
    }

    pub fn staging_path(&self) -> &Path {
        self.local.path()
    }

    fn ensure_bucket(&mut self) -> Result<()> {
        if self.bucket_ready {
            return Ok(());
        }
        if !self.store.bucket_exists(&self.bucket)? {
            self.store
                .create_bucket(&self.bucket, self.project.as_deref(), self.location.as_deref())?;
            info!("Created bucket \"{}\"", self.bucket);
        }
        self.bucket_ready = true;
        Ok(())
    }

    fn prepare_staging_dir(&self) -> Result<()> {
        if let Some(parent) = self.staging_path().parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }

    /// Mirror the remote object locally so the merge sees remote state.
    fn stage_existing_object(&self) -> Result<()> {
        if self.store.object_exists(&self.bucket, &self.object)? {
            self.store.download(&self.bucket, &self.object, self.staging_path())?;
        }
        Ok(())
    }
}

fn default_staging_path(bucket: &str, object: &str) -> PathBuf {
    let mut path = std::env::temp_dir().join("tabsync").join(bucket);
    for segment in object.split('/').filter(|s| !s.is_empty() && *s != "..") {
        path.push(segment);
    }
    path
}

impl Connector for GcsConnector {
    fn role(&self) -> Role {
        self.local.role()
    }

    fn describe(&self) -> String {
        format!("gs://{}/{}", self.bucket, self.object)
    }

    fn extract(&mut self, schema: &mut SchemaRegistry) -> Result<RecordSet> {
        self.ensure_bucket().map_err(SyncError::into_extraction)?;
        if !self
            .store
            .object_exists(&self.bucket, &self.object)
            .map_err(SyncError::into_extraction)?
        {
            return Err(SyncError::NotFound(self.describe()));
        }

        info!(
            "Downloading \"{}\" to \"{}\"",
            self.describe(),
            self.staging_path().display()
        );
        self.prepare_staging_dir()
            .and_then(|_| self.store.download(&self.bucket, &self.object, self.staging_path()))
            .map_err(SyncError::into_extraction)?;
        self.local.extract(schema)
    }

    fn load(&mut self, records: RecordSet) -> Result<()> {
        self.ensure_bucket().map_err(SyncError::into_load)?;
        self.prepare_staging_dir().map_err(SyncError::into_load)?;

        if self.local.strategy().is_active() {
            // A leftover staging file must not stand in for the remote object
            if self.staging_path().exists() {
                std::fs::remove_file(self.staging_path()).map_err(|e| SyncError::from(e).into_load())?;
            }
            // The upload replaces the whole object, so merging without the
            // remote rows would drop them
            if let Err(e) = self.stage_existing_object() {
                warn!("Could not fetch existing object {} ({}).", self.describe(), e);
                return Err(SyncError::Load(format!(
                    "existing object {} could not be staged for merge: {}",
                    self.describe(),
                    e
                )));
            }
        }

        self.local.load(records)?;

        info!(
            "Uploading \"{}\" to \"{}\"",
            self.staging_path().display(),
            self.describe()
        );
        self.store
            .upload(&self.bucket, &self.object, self.staging_path())
            .map_err(SyncError::into_load)?;
        info!("Upload to \"{}\" complete.", self.describe());
        Ok(())
    }
}

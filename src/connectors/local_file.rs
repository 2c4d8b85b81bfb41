//! Local File Connector - reads and writes a single file on disk

use super::{codec, Connector, Role};
use crate::config::{FileType, FileTypeOptions, LocalFileConfig};
use crate::error::{Result, SyncError};
use crate::merge::MergeStrategy;
use crate::record::RecordSet;
use crate::schema::SchemaRegistry;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub struct LocalFileConnector {
    role: Role,
    path: PathBuf,
    file_type: FileType,
    options: FileTypeOptions,
    strategy: MergeStrategy,
}

impl LocalFileConnector {
    pub fn new(role: Role, config: &LocalFileConfig, strategy: MergeStrategy) -> Result<Self> {
        let path = config
            .path
            .clone()
            .ok_or_else(|| SyncError::Config(format!("local_file {} requires 'path'", role)))?;
        let file_type = config
            .file_type
            .ok_or_else(|| SyncError::Config(format!("local_file {} requires 'file_type'", role)))?;
        Self::from_parts(role, path, file_type, config.file_type_options.clone(), strategy)
    }

    pub(crate) fn from_parts(
        role: Role,
        path: PathBuf,
        file_type: FileType,
        options: FileTypeOptions,
        strategy: MergeStrategy,
    ) -> Result<Self> {
        codec::validate(file_type, &options)?;
        Ok(Self {
            role,
            path,
            file_type,
            options,
            strategy,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn strategy(&self) -> &MergeStrategy {
        &self.strategy
    }

    fn read(&self) -> Result<RecordSet> {
        codec::read(&self.path, self.file_type, &self.options)
    }

    fn headerless(&self) -> bool {
        self.file_type == FileType::Csv && self.options.has_header == Some(false)
    }

    /// Existing destination contents. A missing file reads as header-only so
    /// the strategy still applies to the new rows; an unreadable one as empty.
    /// A headerless CSV takes the incoming column names by position.
    fn existing_records(&self, records: &RecordSet) -> Result<RecordSet> {
        if !self.path.exists() {
            return Ok(RecordSet::new(records.columns().to_vec()).unwrap_or_default());
        }
        match self.read() {
            Ok(existing) if self.headerless() && !existing.is_blank() => {
                existing.rename_columns(records.columns().to_vec())
            }
            Ok(existing) => Ok(existing),
            Err(e) => {
                warn!(
                    "Could not read existing file {} ({}). Proceeding without deduplication.",
                    self.path.display(),
                    e
                );
                Ok(RecordSet::empty())
            }
        }
    }
}

impl Connector for LocalFileConnector {
    fn role(&self) -> Role {
        self.role
    }

    fn describe(&self) -> String {
        format!("{} ({})", self.path.display(), self.file_type.as_str())
    }

    fn extract(&mut self, schema: &mut SchemaRegistry) -> Result<RecordSet> {
        if !self.path.exists() {
            return Err(SyncError::NotFound(format!(
                "source file {}",
                self.path.display()
            )));
        }
        let records = self.read().map_err(SyncError::into_extraction)?;
        schema.validate_or_infer(&records)?;
        info!("Extracted {} records from {}", records.len(), self.describe());
        Ok(records)
    }

    fn load(&mut self, records: RecordSet) -> Result<()> {
        let to_write = if self.strategy.is_active() {
            let existing = self.existing_records(&records)?;
            self.strategy.apply(records, existing)?
        } else {
            records
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| SyncError::from(e).into_load())?;
        }
        codec::write(&to_write, &self.path, self.file_type, &self.options)
            .map_err(SyncError::into_load)?;
        info!("Wrote {} records to {}", to_write.len(), self.describe());
        Ok(())
    }
}

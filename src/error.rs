use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Schema mismatch: missing columns [{}], unexpected columns [{}]", missing.join(", "), unexpected.join(", "))]
    SchemaMismatch {
        missing: Vec<String>,
        unexpected: Vec<String>,
    },

    #[error("Column '{0}' not found in schema")]
    UnknownColumn(String),

    #[error("Extraction error: {0}")]
    Extraction(String),

    #[error("Load error: {0}")]
    Load(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Record shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Polars error: {0}")]
    Polars(String),

    #[error("Spreadsheet error: {0}")]
    Spreadsheet(String),

    #[error("XML error: {0}")]
    Xml(#[from] quick_xml::Error),
}

impl From<polars::error::PolarsError> for SyncError {
    fn from(err: polars::error::PolarsError) -> Self {
        SyncError::Polars(err.to_string())
    }
}

impl From<calamine::Error> for SyncError {
    fn from(err: calamine::Error) -> Self {
        SyncError::Spreadsheet(err.to_string())
    }
}

impl From<rust_xlsxwriter::XlsxError> for SyncError {
    fn from(err: rust_xlsxwriter::XlsxError) -> Self {
        SyncError::Spreadsheet(err.to_string())
    }
}

impl SyncError {
    /// Re-tag a backend failure raised while reading a source.
    ///
    /// Taxonomy errors (`NotFound`, `SchemaMismatch`, ...) pass through untouched.
    pub fn into_extraction(self) -> Self {
        match self {
            SyncError::Io(_)
            | SyncError::Json(_)
            | SyncError::Csv(_)
            | SyncError::Http(_)
            | SyncError::Polars(_)
            | SyncError::Spreadsheet(_)
            | SyncError::Xml(_)
            | SyncError::Backend(_) => SyncError::Extraction(self.to_string()),
            other => other,
        }
    }

    /// Re-tag a backend failure raised while writing a destination.
    pub fn into_load(self) -> Self {
        match self {
            SyncError::Io(_)
            | SyncError::Json(_)
            | SyncError::Csv(_)
            | SyncError::Http(_)
            | SyncError::Polars(_)
            | SyncError::Spreadsheet(_)
            | SyncError::Xml(_)
            | SyncError::Backend(_)
            | SyncError::Extraction(_) => SyncError::Load(self.to_string()),
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_errors_become_extraction_errors() {
        let io = SyncError::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk gone"));
        assert!(matches!(io.into_extraction(), SyncError::Extraction(msg) if msg.contains("disk gone")));

        let missing = SyncError::NotFound("a.csv".to_string());
        assert!(matches!(missing.into_extraction(), SyncError::NotFound(_)));
    }

    #[test]
    fn test_schema_mismatch_message_lists_columns() {
        let err = SyncError::SchemaMismatch {
            missing: vec!["y".to_string()],
            unexpected: vec!["z".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "Schema mismatch: missing columns [y], unexpected columns [z]"
        );
    }
}

//! Error taxonomy for an ingestion run

use thiserror::Error;

/// Failures that stop a run. Malformed records and partial bundle
/// acceptance are not errors; they are reported through skip reasons and
/// graph outcomes instead.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("failed to fetch chunk at offset {offset} after {attempts} attempts: {message}")]
    ChunkFetch {
        offset: u64,
        attempts: u32,
        message: String,
    },

    #[error("failed to submit bundle {bundle} after {attempts} attempts: {message}")]
    BundleSubmit {
        bundle: usize,
        attempts: u32,
        message: String,
    },

    #[error("state store unavailable: {0}")]
    StateStore(String),

    #[error("state store corrupted: {0}")]
    StateCorrupted(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("run cancelled")]
    Cancelled,
}

impl From<sqlx::Error> for IngestError {
    fn from(err: sqlx::Error) -> Self {
        IngestError::StateStore(err.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for IngestError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        IngestError::StateStore(format!("migration failed: {err}"))
    }
}

impl From<validator::ValidationErrors> for IngestError {
    fn from(err: validator::ValidationErrors) -> Self {
        IngestError::Config(err.to_string())
    }
}

pub type IngestResult<T> = std::result::Result<T, IngestError>;

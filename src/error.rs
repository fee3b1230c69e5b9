use thiserror::Error;

use crate::model::{Depth, ScanId, TargetOs, ToolVariant};

#[derive(Error, Debug)]
pub enum Error {
    #[error("A scan is already in progress ({0}). Please wait for it to complete.")]
    ConcurrentScan(ScanId),

    #[error("No module list for {variant} {os} {depth}")]
    CatalogNotFound {
        variant: ToolVariant,
        os: TargetOs,
        depth: Depth,
    },

    #[error("Invalid scan request: {0}")]
    InvalidRequest(String),

    #[error("Scan not found: {0}")]
    ScanNotFound(ScanId),

    #[error("No result for module {module} in scan {scan_id}")]
    ResultNotFound { scan_id: ScanId, module: String },

    #[error("Module {module} is still pending or running in scan {scan_id}")]
    ModuleBusy { scan_id: ScanId, module: String },

    #[error("Container runtime error: {0}")]
    Runtime(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Corrupt record: {0}")]
    CorruptRecord(String),
}

impl Error {
    /// True for errors that reject a scan request before anything is persisted.
    pub fn is_bad_config(&self) -> bool {
        matches!(self, Error::CatalogNotFound { .. } | Error::InvalidRequest(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

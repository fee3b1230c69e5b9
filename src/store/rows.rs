use chrono::{DateTime, Utc};

#[derive(Debug, sqlx::FromRow)]
pub(super) struct ScanRow {
    pub id: String,
    pub status: String,
    pub variant: String,
    pub os: String,
    pub depth: String,
    pub format: String,
    pub image: String,
    pub dump_path: String,
    pub output_dir: String,
    pub name: Option<String>,
    pub error: Option<String>,
    pub config_json: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
pub(super) struct ScanSummaryRow {
    #[sqlx(flatten)]
    pub scan: ScanRow,
    pub valid_results: i64,
}

#[derive(Debug, sqlx::FromRow)]
pub(super) struct ModuleTaskRow {
    pub scan_id: String,
    pub module: String,
    pub status: String,
    pub error_message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
pub(super) struct ResultRow {
    pub scan_id: String,
    pub module: String,
    pub content: String,
    pub is_error: bool,
    pub created_at: DateTime<Utc>,
}

//! Durable scan state in SQLite.
//!
//! [`ScanStore`] owns the connection pool and exposes one method per state
//! transition. Every mutation is a single statement or a single
//! transaction, and writes that hit lock contention are retried with
//! exponential backoff.
//!
//! The one-active-scan rule is enforced by the schema: pending and running
//! scans hold `active_slot = 1` under a UNIQUE constraint, so two
//! concurrent admissions cannot both commit.

mod rows;
mod tasks;

pub use tasks::NewResult;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::model::{
    Depth, OutputFormat, Scan, ScanId, ScanStatus, ScanSummary, TargetOs, ToolVariant,
};
use rows::{ScanRow, ScanSummaryRow};

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// How long a connection waits on a locked database before reporting busy.
const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

const MAX_CONNECTIONS: u32 = 8;

/// Retries after the first attempt when the database is busy.
const MAX_RETRIES: u32 = 5;

const RETRY_BASE_DELAY: Duration = Duration::from_millis(50);

const SCAN_COLUMNS: &str = "id, status, variant, os, depth, format, image, dump_path, \
     output_dir, name, error, config_json, created_at, updated_at";

/// Everything needed to persist a newly admitted scan.
#[derive(Debug, Clone)]
pub struct NewScan {
    pub id: ScanId,
    pub variant: ToolVariant,
    pub os: TargetOs,
    pub depth: Depth,
    pub format: OutputFormat,
    pub image: String,
    pub dump_path: PathBuf,
    pub output_dir: PathBuf,
    pub name: Option<String>,
    pub config_json: Option<String>,
}

#[derive(Clone, Debug)]
pub struct ScanStore {
    pool: SqlitePool,
}

impl ScanStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Opens (creating if needed) the database at `path` and applies
    /// migrations.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect_with(options)
            .await?;

        let store = Self::new(pool);
        store.migrate().await?;
        debug!(path = %path.display(), "Opened scan database");
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<()> {
        MIGRATOR.run(self.pool()).await?;
        Ok(())
    }

    fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Persists a pending scan together with its pending module tasks.
    ///
    /// # Errors
    ///
    /// [`Error::ConcurrentScan`] if another scan is pending or running.
    /// Nothing is written in that case.
    pub async fn create_scan(&self, new: &NewScan, modules: &[String]) -> Result<Scan> {
        retry_on_contention(|| self.create_scan_once(new, modules)).await?;
        info!(scan_id = %new.id, modules = modules.len(), "Scan admitted");
        self.get_scan(&new.id)
            .await?
            .ok_or(Error::ScanNotFound(new.id))
    }

    async fn create_scan_once(&self, new: &NewScan, modules: &[String]) -> Result<()> {
        let now = Utc::now();
        let mut tx = self.pool().begin().await?;

        let active: Option<String> =
            sqlx::query_scalar("SELECT id FROM scans WHERE active_slot = 1")
                .fetch_optional(&mut *tx)
                .await?;
        if let Some(active) = active {
            return Err(Error::ConcurrentScan(parse_scan_id(&active)?));
        }

        let inserted = sqlx::query(
            r#"
            INSERT INTO scans (
                id, status, active_slot, variant, os, depth, format, image,
                dump_path, output_dir, name, error, config_json, created_at, updated_at
            )
            VALUES (?, 'pending', 1, ?, ?, ?, ?, ?, ?, ?, ?, NULL, ?, ?, ?)
            "#,
        )
        .bind(new.id.to_string())
        .bind(new.variant.as_str())
        .bind(new.os.as_str())
        .bind(new.depth.as_str())
        .bind(new.format.as_str())
        .bind(&new.image)
        .bind(new.dump_path.to_string_lossy().into_owned())
        .bind(new.output_dir.to_string_lossy().into_owned())
        .bind(&new.name)
        .bind(&new.config_json)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await;

        if let Err(e) = inserted {
            drop(tx);
            if is_unique_violation(&e) {
                if let Some(active) = self.active_scan().await? {
                    return Err(Error::ConcurrentScan(active.id));
                }
            }
            return Err(e.into());
        }

        for (position, module) in modules.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT OR IGNORE INTO module_tasks
                    (scan_id, module, position, status, error_message, updated_at)
                VALUES (?, ?, ?, 'PENDING', NULL, ?)
                "#,
            )
            .bind(new.id.to_string())
            .bind(module)
            .bind(position as i64)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Moves a scan forward. Terminal scans are never changed.
    ///
    /// Returns whether a row was updated.
    pub async fn update_scan_status(
        &self,
        id: &ScanId,
        status: ScanStatus,
        error: Option<&str>,
    ) -> Result<bool> {
        let active_slot = status.is_active().then_some(1_i64);
        let result = retry_on_contention(|| async move {
            Ok::<_, Error>(sqlx::query(
                r#"
                UPDATE scans
                SET status = ?, active_slot = ?, error = COALESCE(?, error), updated_at = ?
                WHERE id = ? AND status IN ('pending', 'running')
                "#,
            )
            .bind(status.as_str())
            .bind(active_slot)
            .bind(error)
            .bind(Utc::now())
            .bind(id.to_string())
            .execute(self.pool())
            .await?)
        })
        .await?;

        let updated = result.rows_affected() > 0;
        if updated {
            debug!(scan_id = %id, status = %status, "Scan status updated");
        }
        Ok(updated)
    }

    /// Fails an active scan and all of its unfinished module tasks in one
    /// transaction.
    ///
    /// Returns false if the scan was no longer active.
    pub async fn fail_stale_scan(&self, id: &ScanId, error: &str) -> Result<bool> {
        retry_on_contention(|| self.fail_stale_scan_once(id, error)).await
    }

    async fn fail_stale_scan_once(&self, id: &ScanId, error: &str) -> Result<bool> {
        let now = Utc::now();
        let mut tx = self.pool().begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE scans
            SET status = 'failed', active_slot = NULL, error = ?, updated_at = ?
            WHERE id = ? AND status IN ('pending', 'running')
            "#,
        )
        .bind(error)
        .bind(now)
        .bind(id.to_string())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(tasks::FAIL_UNFINISHED_SQL)
            .bind(error)
            .bind(now)
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        warn!(scan_id = %id, error, "Scan failed by staleness sweep");
        Ok(true)
    }

    pub async fn get_scan(&self, id: &ScanId) -> Result<Option<Scan>> {
        let row = sqlx::query_as::<_, ScanRow>(&format!(
            "SELECT {} FROM scans WHERE id = ?",
            SCAN_COLUMNS
        ))
        .bind(id.to_string())
        .fetch_optional(self.pool())
        .await?;

        row.map(Self::map_row).transpose()
    }

    /// The scan currently holding the admission slot, if any.
    pub async fn active_scan(&self) -> Result<Option<Scan>> {
        let row = sqlx::query_as::<_, ScanRow>(&format!(
            "SELECT {} FROM scans WHERE active_slot = 1",
            SCAN_COLUMNS
        ))
        .fetch_optional(self.pool())
        .await?;

        row.map(Self::map_row).transpose()
    }

    /// Active scans created before `cutoff`.
    pub async fn active_scans_created_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Scan>> {
        let rows = sqlx::query_as::<_, ScanRow>(&format!(
            "SELECT {} FROM scans WHERE status IN ('pending', 'running')",
            SCAN_COLUMNS
        ))
        .fetch_all(self.pool())
        .await?;

        Ok(rows
            .into_iter()
            .map(Self::map_row)
            .collect::<Result<Vec<_>>>()?
            .into_iter()
            .filter(|scan| scan.created_at < cutoff)
            .collect())
    }

    /// All scans, newest first, with their valid result counts.
    pub async fn list_scans(&self) -> Result<Vec<ScanSummary>> {
        let rows = sqlx::query_as::<_, ScanSummaryRow>(
            r#"
            SELECT
                s.id, s.status, s.variant, s.os, s.depth, s.format, s.image, s.dump_path,
                s.output_dir, s.name, s.error, s.config_json, s.created_at, s.updated_at,
                (SELECT COUNT(*) FROM scan_results r
                 WHERE r.scan_id = s.id AND r.is_error = 0) AS valid_results
            FROM scans s
            ORDER BY s.created_at DESC
            "#,
        )
        .fetch_all(self.pool())
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(ScanSummary {
                    valid_results: row.valid_results.max(0) as u64,
                    scan: Self::map_row(row.scan)?,
                })
            })
            .collect()
    }

    pub async fn rename_scan(&self, id: &ScanId, name: &str) -> Result<bool> {
        let result = retry_on_contention(|| async move {
            Ok::<_, Error>(
                sqlx::query("UPDATE scans SET name = ?, updated_at = ? WHERE id = ?")
                    .bind(name)
                    .bind(Utc::now())
                    .bind(id.to_string())
                    .execute(self.pool())
                    .await?,
            )
        })
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Deletes a scan with its tasks and results, returning the removed row.
    pub async fn delete_scan(&self, id: &ScanId) -> Result<Option<Scan>> {
        let Some(scan) = self.get_scan(id).await? else {
            return Ok(None);
        };

        retry_on_contention(|| async move {
            Ok::<_, Error>(sqlx::query("DELETE FROM scans WHERE id = ?")
                .bind(id.to_string())
                .execute(self.pool())
                .await?)
        })
        .await?;

        info!(scan_id = %id, "Scan deleted");
        Ok(Some(scan))
    }

    fn map_row(row: ScanRow) -> Result<Scan> {
        Ok(Scan {
            id: parse_scan_id(&row.id)?,
            status: parse_column(&row.status, "scan status")?,
            variant: parse_column(&row.variant, "variant")?,
            os: parse_column(&row.os, "os")?,
            depth: parse_column(&row.depth, "depth")?,
            format: parse_column(&row.format, "format")?,
            image: row.image,
            dump_path: PathBuf::from(row.dump_path),
            output_dir: PathBuf::from(row.output_dir),
            name: row.name,
            error: row.error,
            config_json: row.config_json,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

pub(crate) fn parse_scan_id(raw: &str) -> Result<ScanId> {
    raw.parse()
        .map_err(|_| Error::CorruptRecord(format!("invalid scan id: {}", raw)))
}

pub(crate) fn parse_column<T>(raw: &str, what: &str) -> Result<T>
where
    T: std::str::FromStr,
{
    raw.parse()
        .map_err(|_| Error::CorruptRecord(format!("invalid {}: {}", what, raw)))
}

/// True for SQLite busy/locked conditions that resolve by waiting.
pub(crate) fn is_contention(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Database(db) => {
            let busy_code = db
                .code()
                .map(|code| matches!(code.as_ref(), "5" | "6" | "261" | "262" | "517"))
                .unwrap_or(false);
            let message = db.message();
            busy_code
                || message.contains("database is locked")
                || message.contains("database table is locked")
        }
        sqlx::Error::PoolTimedOut => true,
        _ => false,
    }
}

fn is_unique_violation(error: &sqlx::Error) -> bool {
    matches!(error, sqlx::Error::Database(db) if db.is_unique_violation())
}

/// Runs `op`, retrying with exponential backoff while the database is busy.
pub(crate) async fn retry_on_contention<T, F, Fut>(mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = RETRY_BASE_DELAY;
    let mut attempt = 0;
    loop {
        match op().await {
            Err(Error::Database(e)) if attempt < MAX_RETRIES && is_contention(&e) => {
                attempt += 1;
                warn!(attempt, error = %e, "Database busy, retrying");
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            other => return other,
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::model::ModuleStatus;

    #[tokio::test]
    async fn test_create_scan_persists_pending_tasks() {
        let (dir, store) = temp_store().await;
        let new = new_scan(dir.path());

        let scan = store
            .create_scan(&new, &modules(&["b.B", "a.A"]))
            .await
            .unwrap();
        assert_eq!(scan.status, ScanStatus::Pending);

        let tasks = store.list_module_tasks(&new.id).await.unwrap();
        let names: Vec<&str> = tasks.iter().map(|t| t.module.as_str()).collect();
        assert_eq!(names, vec!["b.B", "a.A"]);
        assert!(tasks.iter().all(|t| t.status == ModuleStatus::Pending));
    }

    #[tokio::test]
    async fn test_admission_is_exclusive_and_writes_nothing_on_rejection() {
        let (dir, store) = temp_store().await;
        let first = new_scan(dir.path());
        store.create_scan(&first, &modules(&["m"])).await.unwrap();

        let second = new_scan(dir.path());
        let err = store
            .create_scan(&second, &modules(&["m"]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConcurrentScan(id) if id == first.id));
        assert!(store.get_scan(&second.id).await.unwrap().is_none());
        assert!(store.list_module_tasks(&second.id).await.unwrap().is_empty());

        store
            .update_scan_status(&first.id, ScanStatus::Completed, None)
            .await
            .unwrap();
        store.create_scan(&second, &modules(&["m"])).await.unwrap();
        assert_eq!(store.active_scan().await.unwrap().unwrap().id, second.id);
    }

    #[tokio::test]
    async fn test_concurrent_admissions_admit_exactly_one() {
        let (dir, store) = temp_store().await;
        let a = new_scan(dir.path());
        let b = new_scan(dir.path());
        let mods = modules(&["m"]);

        let (ra, rb) = tokio::join!(store.create_scan(&a, &mods), store.create_scan(&b, &mods));
        assert_eq!(ra.is_ok() as u8 + rb.is_ok() as u8, 1);
        assert_eq!(store.list_scans().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_terminal_scan_status_is_final() {
        let (dir, store) = temp_store().await;
        let new = new_scan(dir.path());
        store.create_scan(&new, &[]).await.unwrap();

        assert!(store
            .update_scan_status(&new.id, ScanStatus::Running, None)
            .await
            .unwrap());
        assert!(store
            .update_scan_status(&new.id, ScanStatus::Failed, Some("boom"))
            .await
            .unwrap());
        assert!(!store
            .update_scan_status(&new.id, ScanStatus::Running, None)
            .await
            .unwrap());

        let scan = store.get_scan(&new.id).await.unwrap().unwrap();
        assert_eq!(scan.status, ScanStatus::Failed);
        assert_eq!(scan.error.as_deref(), Some("boom"));
        assert!(store.active_scan().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fail_stale_scan_fails_unfinished_tasks() {
        let (dir, store) = temp_store().await;
        let new = new_scan(dir.path());
        store
            .create_scan(&new, &modules(&["done", "hung", "queued"]))
            .await
            .unwrap();
        store
            .update_scan_status(&new.id, ScanStatus::Running, None)
            .await
            .unwrap();
        store
            .update_module_status(&new.id, "done", ModuleStatus::Completed, None)
            .await
            .unwrap();
        store
            .update_module_status(&new.id, "hung", ModuleStatus::Running, None)
            .await
            .unwrap();

        assert!(store.fail_stale_scan(&new.id, "Timeout (>60m)").await.unwrap());
        assert!(!store.fail_stale_scan(&new.id, "Timeout (>60m)").await.unwrap());

        let scan = store.get_scan(&new.id).await.unwrap().unwrap();
        assert_eq!(scan.status, ScanStatus::Failed);
        let tasks = store.list_module_tasks(&new.id).await.unwrap();
        assert!(tasks.iter().all(|t| t.status.is_terminal()));
        assert_eq!(tasks[0].status, ModuleStatus::Completed);
        assert_eq!(tasks[1].error_message.as_deref(), Some("Timeout (>60m)"));
    }

    #[tokio::test]
    async fn test_active_scans_created_before() {
        let (dir, store) = temp_store().await;
        let new = new_scan(dir.path());
        store.create_scan(&new, &[]).await.unwrap();

        let past = Utc::now() - chrono::Duration::hours(1);
        let future = Utc::now() + chrono::Duration::hours(1);
        assert!(store.active_scans_created_before(past).await.unwrap().is_empty());
        assert_eq!(store.active_scans_created_before(future).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rename_list_and_delete() {
        let (dir, store) = temp_store().await;
        let new = new_scan(dir.path());
        store.create_scan(&new, &modules(&["m"])).await.unwrap();
        store
            .insert_result_if_absent(&new.id, "m", &serde_json::json!([]), false)
            .await
            .unwrap();

        assert!(store.rename_scan(&new.id, "laptop").await.unwrap());
        let listed = store.list_scans().await.unwrap();
        assert_eq!(listed[0].scan.name.as_deref(), Some("laptop"));
        assert_eq!(listed[0].valid_results, 1);

        let deleted = store.delete_scan(&new.id).await.unwrap();
        assert!(deleted.is_some());
        assert!(store.get_scan(&new.id).await.unwrap().is_none());
        assert!(store.list_module_tasks(&new.id).await.unwrap().is_empty());
        assert!(store.get_result(&new.id, "m").await.unwrap().is_none());
        assert!(store.delete_scan(&new.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_retry_on_contention_gives_up_on_other_errors() {
        let mut calls = 0;
        let result: Result<()> = retry_on_contention(|| {
            calls += 1;
            async { Err(Error::InvalidRequest("nope".to_string())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }
}

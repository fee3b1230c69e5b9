use chrono::Utc;
use serde_json::Value;
use tracing::debug;

use super::rows::{ModuleTaskRow, ResultRow};
use super::{parse_column, parse_scan_id, retry_on_contention, ScanStore};
use crate::error::{Error, Result};
use crate::model::{ModuleStatus, ModuleTask, ResultRecord, ScanId};

/// Binds: error, updated_at, scan_id.
pub(super) const FAIL_UNFINISHED_SQL: &str = r#"
    UPDATE module_tasks
    SET status = 'FAILED', error_message = ?, updated_at = ?
    WHERE scan_id = ? AND status IN ('PENDING', 'RUNNING')
"#;

/// Replacement output for a re-run module.
#[derive(Debug, Clone)]
pub struct NewResult {
    pub content: Value,
    pub is_error: bool,
}

/// Module task and result operations.
impl ScanStore {
    /// Adds pending tasks to a scan, appended after existing ones.
    ///
    /// Modules that already have a task are left untouched. Returns the
    /// number of tasks created.
    pub async fn insert_module_tasks(&self, scan_id: &ScanId, modules: &[String]) -> Result<u64> {
        retry_on_contention(|| async move {
            let now = Utc::now();
            let mut tx = self.pool().begin().await?;

            let next: i64 = sqlx::query_scalar(
                "SELECT COALESCE(MAX(position) + 1, 0) FROM module_tasks WHERE scan_id = ?",
            )
            .bind(scan_id.to_string())
            .fetch_one(&mut *tx)
            .await?;

            let mut inserted = 0;
            for (offset, module) in modules.iter().enumerate() {
                let result = sqlx::query(
                    r#"
                    INSERT OR IGNORE INTO module_tasks
                        (scan_id, module, position, status, error_message, updated_at)
                    VALUES (?, ?, ?, 'PENDING', NULL, ?)
                    "#,
                )
                .bind(scan_id.to_string())
                .bind(module)
                .bind(next + offset as i64)
                .bind(now)
                .execute(&mut *tx)
                .await?;
                inserted += result.rows_affected();
            }

            tx.commit().await?;
            Ok::<_, Error>(inserted)
        })
        .await
    }

    /// Records a module's status, creating the task if needed.
    ///
    /// A task that is already COMPLETED or FAILED is never overwritten.
    /// Returns whether the row changed.
    pub async fn update_module_status(
        &self,
        scan_id: &ScanId,
        module: &str,
        status: ModuleStatus,
        error: Option<&str>,
    ) -> Result<bool> {
        let result = retry_on_contention(|| async move {
            Ok::<_, Error>(sqlx::query(
                r#"
                INSERT INTO module_tasks
                    (scan_id, module, position, status, error_message, updated_at)
                VALUES (
                    ?1, ?2,
                    (SELECT COALESCE(MAX(position) + 1, 0) FROM module_tasks WHERE scan_id = ?1),
                    ?3, ?4, ?5
                )
                ON CONFLICT (scan_id, module) DO UPDATE
                SET status = excluded.status,
                    error_message = excluded.error_message,
                    updated_at = excluded.updated_at
                WHERE module_tasks.status NOT IN ('COMPLETED', 'FAILED')
                "#,
            )
            .bind(scan_id.to_string())
            .bind(module)
            .bind(status.as_str())
            .bind(error)
            .bind(Utc::now())
            .execute(self.pool())
            .await?)
        })
        .await?;

        let changed = result.rows_affected() > 0;
        debug!(scan_id = %scan_id, module, status = %status, changed, "Module status");
        Ok(changed)
    }

    /// Replaces the outcome of an explicit re-run.
    ///
    /// Status and result change together. Without a new result the old one
    /// is removed.
    pub async fn replace_module_attempt(
        &self,
        scan_id: &ScanId,
        module: &str,
        status: ModuleStatus,
        error: Option<&str>,
        result: Option<&NewResult>,
    ) -> Result<()> {
        if !status.is_terminal() {
            return Err(Error::InvalidRequest(format!(
                "A re-run must finish as COMPLETED or FAILED, not {}",
                status
            )));
        }

        retry_on_contention(|| async move {
            let now = Utc::now();
            let mut tx = self.pool().begin().await?;

            sqlx::query(
                r#"
                INSERT INTO module_tasks
                    (scan_id, module, position, status, error_message, updated_at)
                VALUES (
                    ?1, ?2,
                    (SELECT COALESCE(MAX(position) + 1, 0) FROM module_tasks WHERE scan_id = ?1),
                    ?3, ?4, ?5
                )
                ON CONFLICT (scan_id, module) DO UPDATE
                SET status = excluded.status,
                    error_message = excluded.error_message,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(scan_id.to_string())
            .bind(module)
            .bind(status.as_str())
            .bind(error)
            .bind(now)
            .execute(&mut *tx)
            .await?;

            match result {
                Some(result) => {
                    sqlx::query(UPSERT_RESULT_SQL)
                        .bind(scan_id.to_string())
                        .bind(module)
                        .bind(result.content.to_string())
                        .bind(result.is_error)
                        .bind(now)
                        .execute(&mut *tx)
                        .await?;
                }
                None => {
                    sqlx::query("DELETE FROM scan_results WHERE scan_id = ? AND module = ?")
                        .bind(scan_id.to_string())
                        .bind(module)
                        .execute(&mut *tx)
                        .await?;
                }
            }

            tx.commit().await?;
            Ok::<_, Error>(())
        })
        .await
    }

    /// Tasks of a scan in planning order.
    pub async fn list_module_tasks(&self, scan_id: &ScanId) -> Result<Vec<ModuleTask>> {
        let rows = sqlx::query_as::<_, ModuleTaskRow>(
            r#"
            SELECT scan_id, module, status, error_message, updated_at
            FROM module_tasks
            WHERE scan_id = ?
            ORDER BY position, module
            "#,
        )
        .bind(scan_id.to_string())
        .fetch_all(self.pool())
        .await?;

        rows.into_iter().map(Self::map_task_row).collect()
    }

    pub async fn get_module_task(&self, scan_id: &ScanId, module: &str) -> Result<Option<ModuleTask>> {
        let row = sqlx::query_as::<_, ModuleTaskRow>(
            r#"
            SELECT scan_id, module, status, error_message, updated_at
            FROM module_tasks
            WHERE scan_id = ? AND module = ?
            "#,
        )
        .bind(scan_id.to_string())
        .bind(module)
        .fetch_optional(self.pool())
        .await?;

        row.map(Self::map_task_row).transpose()
    }

    /// Forces every PENDING or RUNNING task of a scan to FAILED.
    pub async fn fail_unfinished_modules(&self, scan_id: &ScanId, error: &str) -> Result<u64> {
        let result = retry_on_contention(|| async move {
            Ok::<_, Error>(sqlx::query(FAIL_UNFINISHED_SQL)
                .bind(error)
                .bind(Utc::now())
                .bind(scan_id.to_string())
                .execute(self.pool())
                .await?)
        })
        .await?;
        Ok(result.rows_affected())
    }

    /// Stores a result unless one already exists for the module.
    ///
    /// Returns whether this call inserted it.
    pub async fn insert_result_if_absent(
        &self,
        scan_id: &ScanId,
        module: &str,
        content: &Value,
        is_error: bool,
    ) -> Result<bool> {
        let content = content.to_string();
        let content = content.as_str();
        let result = retry_on_contention(|| async move {
            Ok::<_, Error>(sqlx::query(
                r#"
                INSERT INTO scan_results (scan_id, module, content, is_error, created_at)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT (scan_id, module) DO NOTHING
                "#,
            )
            .bind(scan_id.to_string())
            .bind(module)
            .bind(content)
            .bind(is_error)
            .bind(Utc::now())
            .execute(self.pool())
            .await?)
        })
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Stores a result, overwriting any existing one.
    pub async fn replace_result(
        &self,
        scan_id: &ScanId,
        module: &str,
        content: &Value,
        is_error: bool,
    ) -> Result<()> {
        let content = content.to_string();
        let content = content.as_str();
        retry_on_contention(|| async move {
            sqlx::query(UPSERT_RESULT_SQL)
                .bind(scan_id.to_string())
                .bind(module)
                .bind(content)
                .bind(is_error)
                .bind(Utc::now())
                .execute(self.pool())
                .await?;
            Ok::<_, Error>(())
        })
        .await
    }

    pub async fn has_result(&self, scan_id: &ScanId, module: &str) -> Result<bool> {
        let found: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM scan_results WHERE scan_id = ? AND module = ?")
                .bind(scan_id.to_string())
                .bind(module)
                .fetch_optional(self.pool())
                .await?;
        Ok(found.is_some())
    }

    pub async fn get_result(&self, scan_id: &ScanId, module: &str) -> Result<Option<ResultRecord>> {
        let row = sqlx::query_as::<_, ResultRow>(
            r#"
            SELECT scan_id, module, content, is_error, created_at
            FROM scan_results
            WHERE scan_id = ? AND module = ?
            "#,
        )
        .bind(scan_id.to_string())
        .bind(module)
        .fetch_optional(self.pool())
        .await?;

        row.map(Self::map_result_row).transpose()
    }

    pub async fn list_results(&self, scan_id: &ScanId) -> Result<Vec<ResultRecord>> {
        let rows = sqlx::query_as::<_, ResultRow>(
            r#"
            SELECT scan_id, module, content, is_error, created_at
            FROM scan_results
            WHERE scan_id = ?
            ORDER BY module
            "#,
        )
        .bind(scan_id.to_string())
        .fetch_all(self.pool())
        .await?;

        rows.into_iter().map(Self::map_result_row).collect()
    }

    /// Number of modules whose stored output is real tool data.
    pub async fn count_valid_results(&self, scan_id: &ScanId) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM scan_results WHERE scan_id = ? AND is_error = 0",
        )
        .bind(scan_id.to_string())
        .fetch_one(self.pool())
        .await?;
        Ok(count.max(0) as u64)
    }

    fn map_task_row(row: ModuleTaskRow) -> Result<ModuleTask> {
        Ok(ModuleTask {
            scan_id: parse_scan_id(&row.scan_id)?,
            module: row.module,
            status: parse_column(&row.status, "module status")?,
            error_message: row.error_message,
            updated_at: row.updated_at,
        })
    }

    fn map_result_row(row: ResultRow) -> Result<ResultRecord> {
        let content = serde_json::from_str(&row.content).map_err(|e| {
            Error::CorruptRecord(format!("result {} of {}: {}", row.module, row.scan_id, e))
        })?;
        Ok(ResultRecord {
            scan_id: parse_scan_id(&row.scan_id)?,
            module: row.module,
            content,
            is_error: row.is_error,
            created_at: row.created_at,
        })
    }
}

/// Binds: scan_id, module, content, is_error, created_at.
const UPSERT_RESULT_SQL: &str = r#"
    INSERT INTO scan_results (scan_id, module, content, is_error, created_at)
    VALUES (?, ?, ?, ?, ?)
    ON CONFLICT (scan_id, module) DO UPDATE
    SET content = excluded.content,
        is_error = excluded.is_error,
        created_at = excluded.created_at
"#;

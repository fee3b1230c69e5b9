//! Idempotent ingestion of module output artifacts into the store.
//!
//! Every `*_output.json` file in a scan's output directory becomes at most
//! one [`ResultRecord`](crate::model::ResultRecord). Content that cannot be
//! parsed is stored as an error wrapper instead of being dropped, and one
//! unreadable file never stops the rest of the directory from being
//! ingested.

use serde::Serialize;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::executor::normalize::parse_output;
use crate::executor::output_path;
use crate::model::{OutputFormat, ScanId};
use crate::store::ScanStore;

const JSON_ARTIFACT_SUFFIX: &str = "_output.json";

/// What one ingestion pass did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub inserted: usize,
    /// Already had a record.
    pub skipped: usize,
    /// Could not be read.
    pub failed: usize,
}

impl IngestReport {
    pub fn merge(&mut self, other: IngestReport) {
        self.inserted += other.inserted;
        self.skipped += other.skipped;
        self.failed += other.failed;
    }
}

/// Module id encoded in a JSON artifact file name.
pub fn module_from_artifact(file_name: &str) -> Option<&str> {
    file_name
        .strip_suffix(JSON_ARTIFACT_SUFFIX)
        .filter(|module| !module.is_empty())
}

#[derive(Clone, Debug)]
pub struct Ingestor {
    store: ScanStore,
}

impl Ingestor {
    pub fn new(store: ScanStore) -> Self {
        Self { store }
    }

    /// Ingests every JSON artifact in `output_dir`.
    ///
    /// A missing directory yields an empty report.
    pub async fn ingest(&self, scan_id: &ScanId, output_dir: &Path) -> Result<IngestReport> {
        let mut report = IngestReport::default();

        let mut entries = match tokio::fs::read_dir(output_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(scan_id = %scan_id, dir = %output_dir.display(), "Output directory not found");
                return Ok(report);
            }
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            let Some(module) = file_name.to_str().and_then(module_from_artifact) else {
                continue;
            };
            let module = module.to_string();
            self.ingest_file(scan_id, &module, &entry.path(), &mut report)
                .await?;
        }

        info!(
            scan_id = %scan_id,
            inserted = report.inserted,
            skipped = report.skipped,
            failed = report.failed,
            "Ingested output directory"
        );
        Ok(report)
    }

    /// Ingests the JSON artifact of a single module, if it exists.
    pub async fn ingest_module(
        &self,
        scan_id: &ScanId,
        output_dir: &Path,
        module: &str,
    ) -> Result<IngestReport> {
        let mut report = IngestReport::default();
        let path = output_path(output_dir, module, OutputFormat::Json);
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            debug!(scan_id = %scan_id, module, "No JSON artifact to ingest");
            return Ok(report);
        }
        self.ingest_file(scan_id, module, &path, &mut report).await?;
        Ok(report)
    }

    async fn ingest_file(
        &self,
        scan_id: &ScanId,
        module: &str,
        path: &Path,
        report: &mut IngestReport,
    ) -> Result<()> {
        if self.store.has_result(scan_id, module).await? {
            report.skipped += 1;
            return Ok(());
        }

        let raw = match tokio::fs::read(path).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(scan_id = %scan_id, module, error = %e, "Failed to read artifact");
                report.failed += 1;
                return Ok(());
            }
        };

        let content = String::from_utf8_lossy(&raw);
        let (value, is_error) = parse_output(&content);
        if is_error {
            warn!(scan_id = %scan_id, module, "Artifact is not valid JSON, storing error wrapper");
        }

        if self
            .store
            .insert_result_if_absent(scan_id, module, &value, is_error)
            .await?
        {
            report.inserted += 1;
        } else {
            report.skipped += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::*;
    use serde_json::json;
    use std::fs;

    #[test]
    fn test_module_from_artifact() {
        assert_eq!(
            module_from_artifact("windows.info.Info_output.json"),
            Some("windows.info.Info")
        );
        assert_eq!(module_from_artifact("pslist_output.txt"), None);
        assert_eq!(module_from_artifact("_output.json"), None);
    }

    #[tokio::test]
    async fn test_ingest_twice_keeps_one_record_per_module() {
        let (dir, store) = temp_store().await;
        let new = new_scan(dir.path());
        store.create_scan(&new, &modules(&["a.A", "b.B"])).await.unwrap();
        fs::create_dir_all(&new.output_dir).unwrap();
        fs::write(new.output_dir.join("a.A_output.json"), "[{\"x\": 1}]").unwrap();
        fs::write(new.output_dir.join("b.B_output.json"), "{\"y\": 2}").unwrap();
        fs::write(new.output_dir.join("notes.txt"), "ignored").unwrap();

        let ingestor = Ingestor::new(store.clone());
        let first = ingestor.ingest(&new.id, &new.output_dir).await.unwrap();
        assert_eq!(first.inserted, 2);

        let second = ingestor.ingest(&new.id, &new.output_dir).await.unwrap();
        assert_eq!(second.inserted, 0);
        assert_eq!(second.skipped, 2);

        let results = store.list_results(&new.id).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].content, json!([{"x": 1}]));
    }

    #[tokio::test]
    async fn test_malformed_artifact_becomes_error_record() {
        let (dir, store) = temp_store().await;
        let new = new_scan(dir.path());
        store.create_scan(&new, &modules(&["bad", "good"])).await.unwrap();
        fs::create_dir_all(&new.output_dir).unwrap();
        fs::write(new.output_dir.join("bad_output.json"), "Traceback: boom").unwrap();
        fs::write(new.output_dir.join("good_output.json"), "[]").unwrap();

        let ingestor = Ingestor::new(store.clone());
        let report = ingestor.ingest(&new.id, &new.output_dir).await.unwrap();
        assert_eq!(report.inserted, 2);

        let bad = store.get_result(&new.id, "bad").await.unwrap().unwrap();
        assert!(bad.is_error);
        assert_eq!(bad.content["error"], "Invalid JSON output");
        assert_eq!(bad.content["raw_output"], "Traceback: boom");

        let good = store.get_result(&new.id, "good").await.unwrap().unwrap();
        assert!(!good.is_error);
        assert_eq!(store.count_valid_results(&new.id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_missing_directory_is_empty_report() {
        let (dir, store) = temp_store().await;
        let new = new_scan(dir.path());
        store.create_scan(&new, &[]).await.unwrap();

        let report = Ingestor::new(store)
            .ingest(&new.id, &dir.path().join("nope"))
            .await
            .unwrap();
        assert_eq!(report, IngestReport::default());
    }

    #[tokio::test]
    async fn test_ingest_single_module() {
        let (dir, store) = temp_store().await;
        let new = new_scan(dir.path());
        store.create_scan(&new, &modules(&["a", "b"])).await.unwrap();
        fs::create_dir_all(&new.output_dir).unwrap();
        fs::write(new.output_dir.join("a_output.json"), "[1]").unwrap();
        fs::write(new.output_dir.join("b_output.json"), "[2]").unwrap();

        let ingestor = Ingestor::new(store.clone());
        let report = ingestor
            .ingest_module(&new.id, &new.output_dir, "a")
            .await
            .unwrap();
        assert_eq!(report.inserted, 1);
        assert!(store.get_result(&new.id, "b").await.unwrap().is_none());

        let missing = ingestor
            .ingest_module(&new.id, &new.output_dir, "zzz")
            .await
            .unwrap();
        assert_eq!(missing, IngestReport::default());
    }
}

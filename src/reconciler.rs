//! Pull-based reconciliation of module state against the container runtime.
//!
//! When no outcome was pushed for a task (the driver crashed, or the
//! process restarted mid-scan), the runtime still knows what happened to
//! the unit. The reconciler rebuilds each unit name, inspects it, and moves
//! the task forward. Terminal tasks are never touched.

use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::executor::normalize::{Preamble, VOL3_BANNER_LINES};
use crate::executor::{capture_path, finalize_capture, output_path, unit_name};
use crate::ingest::Ingestor;
use crate::model::{ModuleStatus, OutputFormat, Scan};
use crate::runtime::{ContainerRuntime, UnitState};
use crate::store::ScanStore;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Non-terminal tasks whose unit was inspected.
    pub inspected: usize,
    pub marked_running: usize,
    pub marked_completed: usize,
}

#[derive(Clone)]
pub struct Reconciler {
    store: ScanStore,
    runtime: Arc<dyn ContainerRuntime>,
    ingestor: Ingestor,
    banner_lines: usize,
}

impl Reconciler {
    pub fn new(store: ScanStore, runtime: Arc<dyn ContainerRuntime>) -> Self {
        let ingestor = Ingestor::new(store.clone());
        Self {
            store,
            runtime,
            ingestor,
            banner_lines: VOL3_BANNER_LINES,
        }
    }

    /// Banner lines stripped when finalizing a Volatility 3 capture.
    pub fn with_banner_lines(mut self, banner_lines: usize) -> Self {
        self.banner_lines = banner_lines;
        self
    }

    /// Advances every PENDING or RUNNING task of `scan` from runtime state.
    ///
    /// Runtime errors leave the task unchanged; only store errors fail the
    /// pass.
    pub async fn reconcile_scan(&self, scan: &Scan) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();

        let tasks = self.store.list_module_tasks(&scan.id).await?;
        for task in tasks.iter().filter(|t| !t.status.is_terminal()) {
            report.inspected += 1;
            let name = unit_name(scan.variant, &scan.id, &task.module);

            let state = match self.runtime.inspect(&name).await {
                Ok(state) => state,
                Err(e) => {
                    debug!(scan_id = %scan.id, module = %task.module, error = %e, "Inspect failed");
                    continue;
                }
            };

            match state {
                UnitState::Absent | UnitState::Created => {}
                UnitState::Running => {
                    if task.status != ModuleStatus::Running
                        && self
                            .store
                            .update_module_status(&scan.id, &task.module, ModuleStatus::Running, None)
                            .await?
                    {
                        report.marked_running += 1;
                    }
                }
                UnitState::Exited { exit_code } => {
                    let capture = capture_path(&scan.output_dir, &task.module, scan.format);
                    let artifact = output_path(&scan.output_dir, &task.module, scan.format);
                    let preamble = match scan.format {
                        OutputFormat::Json => {
                            Some(Preamble::for_variant(scan.variant, self.banner_lines))
                        }
                        OutputFormat::Text => None,
                    };
                    if let Err(e) = finalize_capture(&capture, &artifact, preamble).await {
                        warn!(
                            scan_id = %scan.id,
                            module = %task.module,
                            error = %e,
                            "Failed to finalize captured logs"
                        );
                        continue;
                    }

                    self.ingestor
                        .ingest_module(&scan.id, &scan.output_dir, &task.module)
                        .await?;
                    if self
                        .store
                        .update_module_status(&scan.id, &task.module, ModuleStatus::Completed, None)
                        .await?
                    {
                        report.marked_completed += 1;
                        info!(
                            scan_id = %scan.id,
                            module = %task.module,
                            exit_code,
                            "Reconciled exited unit"
                        );
                    }
                    if let Err(e) = self.runtime.remove(&name).await {
                        warn!(unit = %name, error = %e, "Failed to remove exited unit");
                    }
                }
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::*;
    use crate::testing::FakeRuntime;
    use std::fs;

    #[tokio::test]
    async fn test_reconcile_advances_from_runtime_state() {
        let (dir, store) = temp_store().await;
        let new = new_scan(dir.path());
        let scan = store
            .create_scan(&new, &modules(&["gone", "created", "busy", "done", "final"]))
            .await
            .unwrap();
        store
            .update_module_status(&scan.id, "final", ModuleStatus::Failed, Some("exit 1"))
            .await
            .unwrap();

        let runtime = Arc::new(FakeRuntime::new());
        let name = |m: &str| unit_name(scan.variant, &scan.id, m);
        runtime.set_state(&name("created"), UnitState::Created);
        runtime.set_state(&name("busy"), UnitState::Running);
        runtime.set_state(&name("done"), UnitState::Exited { exit_code: 0 });
        runtime.set_state(&name("final"), UnitState::Exited { exit_code: 0 });

        fs::create_dir_all(&scan.output_dir).unwrap();
        fs::write(scan.output_dir.join("done_output.json"), "[{\"PID\": 1}]").unwrap();

        let reconciler = Reconciler::new(store.clone(), runtime.clone());
        let report = reconciler.reconcile_scan(&scan).await.unwrap();
        assert_eq!(report.inspected, 4);
        assert_eq!(report.marked_running, 1);
        assert_eq!(report.marked_completed, 1);

        let status = |m: &str| {
            let store = store.clone();
            let id = scan.id;
            let m = m.to_string();
            async move { store.get_module_task(&id, &m).await.unwrap().unwrap().status }
        };
        assert_eq!(status("gone").await, ModuleStatus::Pending);
        assert_eq!(status("created").await, ModuleStatus::Pending);
        assert_eq!(status("busy").await, ModuleStatus::Running);
        assert_eq!(status("done").await, ModuleStatus::Completed);
        assert_eq!(status("final").await, ModuleStatus::Failed);

        assert!(store.get_result(&scan.id, "done").await.unwrap().is_some());
        assert!(runtime.removed().contains(&name("done")));
        assert!(!runtime.removed().contains(&name("final")));
    }

    #[tokio::test]
    async fn test_exited_unit_capture_is_normalized_before_ingest() {
        let (dir, store) = temp_store().await;
        let new = new_scan(dir.path());
        let scan = store.create_scan(&new, &modules(&["m"])).await.unwrap();

        let runtime = Arc::new(FakeRuntime::new());
        runtime.set_state(
            &unit_name(scan.variant, &scan.id, "m"),
            UnitState::Exited { exit_code: 0 },
        );
        fs::create_dir_all(&scan.output_dir).unwrap();
        let capture = capture_path(&scan.output_dir, "m", OutputFormat::Json);
        fs::write(&capture, "Volatility 3 Framework\nProgress: 100\n[{\"PID\": 4}]\n").unwrap();

        let reconciler = Reconciler::new(store.clone(), runtime);
        let report = reconciler.reconcile_scan(&scan).await.unwrap();
        assert_eq!(report.marked_completed, 1);

        let record = store.get_result(&scan.id, "m").await.unwrap().unwrap();
        assert!(!record.is_error);
        assert_eq!(record.content, serde_json::json!([{"PID": 4}]));
        assert!(!capture.exists());
        assert_eq!(
            fs::read_to_string(output_path(&scan.output_dir, "m", OutputFormat::Json)).unwrap(),
            "[{\"PID\": 4}]\n"
        );
    }

    #[tokio::test]
    async fn test_reconcile_twice_is_stable() {
        let (dir, store) = temp_store().await;
        let new = new_scan(dir.path());
        let scan = store.create_scan(&new, &modules(&["m"])).await.unwrap();

        let runtime = Arc::new(FakeRuntime::new());
        runtime.set_state(
            &unit_name(scan.variant, &scan.id, "m"),
            UnitState::Exited { exit_code: 0 },
        );

        let reconciler = Reconciler::new(store.clone(), runtime);
        reconciler.reconcile_scan(&scan).await.unwrap();
        let second = reconciler.reconcile_scan(&scan).await.unwrap();
        assert_eq!(second, ReconcileReport::default());
    }
}

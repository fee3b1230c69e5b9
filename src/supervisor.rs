//! Scan lifecycle: admission, background driving, sweeps, and queries.
//!
//! [`Supervisor`] is the only entry point front ends need. Admission is
//! synchronous and cheap; the scan itself runs on a background task that
//! moves it `pending -> running -> completed|failed`. Status queries
//! reconcile against the container runtime before answering, so progress
//! stays visible even when the driving process is gone.

use futures::StreamExt;
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::catalog::Catalog;
use crate::config::Config;
use crate::coordinator::{Coordinator, ModuleObserver};
use crate::error::{Error, Result};
use crate::executor::normalize::parse_output;
use crate::executor::{output_path, sanitize_module, Executor, ScanBindings};
use crate::ingest::Ingestor;
use crate::model::{
    ModuleOutcome, ModuleStatus, OutputFormat, Scan, ScanId, ScanRequest, ScanStatus,
    ScanStatusReport, ScanSummary, ToolVariant,
};
use crate::reconciler::Reconciler;
use crate::runtime::{ContainerRuntime, DockerCli};
use crate::store::{NewResult, NewScan, ScanStore};

/// Error recorded on tasks still unfinished when a scan's run ends.
pub const COMPLETION_SWEEP_ERROR: &str = "Module failed to produce output";

/// Error recorded on scans (and their tasks) failed by the staleness sweep.
pub fn timeout_error(stale_after_minutes: u64) -> String {
    format!("Timeout (>{}m)", stale_after_minutes)
}

/// Which results a query returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultSelector {
    Module(String),
    All,
}

impl FromStr for ResultSelector {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s.trim() {
            "" | "all" => ResultSelector::All,
            module => ResultSelector::Module(module.to_string()),
        })
    }
}

impl fmt::Display for ResultSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResultSelector::Module(module) => write!(f, "{}", module),
            ResultSelector::All => write!(f, "all"),
        }
    }
}

/// Handle to a freshly admitted scan.
#[derive(Debug)]
pub struct AdmittedScan {
    pub scan: Scan,
    pub modules: Vec<String>,
    /// Background driver; resolves once the scan is terminal.
    pub task: JoinHandle<()>,
}

impl AdmittedScan {
    pub fn id(&self) -> ScanId {
        self.scan.id
    }

    pub fn output_dir(&self) -> &PathBuf {
        &self.scan.output_dir
    }
}

/// Marks tasks RUNNING as their units start.
struct TaskObserver {
    store: ScanStore,
    scan_id: ScanId,
}

#[async_trait::async_trait]
impl ModuleObserver for TaskObserver {
    async fn on_start(&self, module: &str) {
        if let Err(e) = self
            .store
            .update_module_status(&self.scan_id, module, ModuleStatus::Running, None)
            .await
        {
            warn!(scan_id = %self.scan_id, module, error = %e, "Failed to mark module running");
        }
    }
}

#[derive(Clone)]
pub struct Supervisor {
    config: Arc<Config>,
    store: ScanStore,
    runtime: Arc<dyn ContainerRuntime>,
    catalog: Arc<Catalog>,
    executor: Executor,
    ingestor: Ingestor,
    reconciler: Reconciler,
    reruns: Arc<Mutex<HashSet<(ScanId, String)>>>,
}

impl Supervisor {
    pub fn new(config: Config, store: ScanStore, runtime: Arc<dyn ContainerRuntime>) -> Result<Self> {
        let catalog = Catalog::load(config.catalog_path.as_deref())?;
        let config = Arc::new(config);
        Ok(Self {
            executor: Executor::new(runtime.clone(), config.clone()),
            ingestor: Ingestor::new(store.clone()),
            reconciler: Reconciler::new(store.clone(), runtime.clone())
                .with_banner_lines(config.vol3.banner_lines),
            catalog: Arc::new(catalog),
            reruns: Arc::new(Mutex::new(HashSet::new())),
            config,
            store,
            runtime,
        })
    }

    /// Opens the database and storage layout described by `config`, driving
    /// containers through the Docker CLI.
    pub async fn open(config: Config) -> Result<Self> {
        config.ensure_dirs()?;
        let store = ScanStore::open(&config.database_path()).await?;
        let runtime = Arc::new(DockerCli::new(config.docker_binary.clone()));
        Self::new(config, store, runtime)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn store(&self) -> &ScanStore {
        &self.store
    }

    /// Validates and persists a scan, then starts it in the background.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidRequest`] / [`Error::CatalogNotFound`] for a bad
    ///   request
    /// - [`Error::ConcurrentScan`] while another scan is pending or running
    ///
    /// Nothing is persisted when admission fails.
    pub async fn admit_scan(&self, request: ScanRequest) -> Result<AdmittedScan> {
        self.validate_request(&request).await?;

        let modules = dedup_modules(self.catalog.resolve(
            request.variant,
            request.os,
            request.depth,
            request.modules.as_deref(),
        )?);
        for module in &modules {
            validate_module_name(module)?;
        }

        let id = ScanId::new();
        let new = NewScan {
            id,
            variant: request.variant,
            os: request.os,
            depth: request.depth,
            format: request.format,
            image: request
                .image
                .clone()
                .unwrap_or_else(|| self.config.default_image(request.variant).to_string()),
            dump_path: std::path::absolute(&request.dump)?,
            output_dir: self.config.outputs_dir().join(id.to_string()),
            name: request.name.clone(),
            config_json: Some(serde_json::to_string(&request)?),
        };

        let scan = self.store.create_scan(&new, &modules).await?;

        if let Err(e) = tokio::fs::create_dir_all(&scan.output_dir).await {
            error!(scan_id = %id, error = %e, "Failed to create output directory");
            self.store.fail_unfinished_modules(&id, &e.to_string()).await?;
            self.store
                .update_scan_status(&id, ScanStatus::Failed, Some(&e.to_string()))
                .await?;
            return Err(e.into());
        }

        info!(
            scan_id = %id,
            variant = %scan.variant,
            os = %scan.os,
            modules = modules.len(),
            "Starting scan"
        );

        let driver = self.clone();
        let driven = scan.clone();
        let planned = modules.clone();
        let task = tokio::spawn(async move { driver.drive(driven, planned).await });

        Ok(AdmittedScan {
            scan,
            modules,
            task,
        })
    }

    async fn validate_request(&self, request: &ScanRequest) -> Result<()> {
        match tokio::fs::metadata(&request.dump).await {
            Ok(meta) if meta.is_file() => {}
            Ok(_) => {
                return Err(Error::InvalidRequest(format!(
                    "Dump is not a file: {}",
                    request.dump.display()
                )))
            }
            Err(_) => {
                return Err(Error::InvalidRequest(format!(
                    "Dump not found: {}",
                    request.dump.display()
                )))
            }
        }

        if request.variant == ToolVariant::Vol2
            && request.profile.as_deref().map_or(true, |p| p.trim().is_empty())
        {
            return Err(Error::InvalidRequest(
                "Volatility 2 scans require a profile".to_string(),
            ));
        }

        Ok(())
    }

    /// Background driver of one scan. Always leaves every task terminal
    /// before the scan itself becomes terminal.
    async fn drive(self, scan: Scan, modules: Vec<String>) {
        let outcome = self.orchestrate(&scan, modules).await;
        if let Err(e) = &outcome {
            error!(scan_id = %scan.id, error = %e, "Scan orchestration failed");
        }

        if let Err(e) = self.completion_sweep(&scan).await {
            // The scan stays active; the staleness sweep fails it together
            // with its tasks later.
            error!(scan_id = %scan.id, error = %e, "Completion sweep failed");
            return;
        }

        let (status, message) = match outcome {
            Ok(()) => (ScanStatus::Completed, None),
            Err(e) => (ScanStatus::Failed, Some(e.to_string())),
        };
        match self
            .store
            .update_scan_status(&scan.id, status, message.as_deref())
            .await
        {
            Ok(true) => info!(scan_id = %scan.id, status = %status, "Scan finished"),
            Ok(false) => debug!(scan_id = %scan.id, "Scan was already terminal"),
            Err(e) => error!(scan_id = %scan.id, error = %e, "Failed to record final scan status"),
        }
    }

    async fn orchestrate(&self, scan: &Scan, modules: Vec<String>) -> Result<()> {
        self.store
            .update_scan_status(&scan.id, ScanStatus::Running, None)
            .await?;
        self.runtime.ping().await?;

        let parallelism = scan
            .request()
            .and_then(|r| r.max_parallelism)
            .unwrap_or_else(|| self.config.parallelism());
        let coordinator = Coordinator::new(self.executor.clone(), parallelism);
        let observer = Arc::new(TaskObserver {
            store: self.store.clone(),
            scan_id: scan.id,
        });

        let mut outcomes = coordinator.execute(
            ScanBindings::for_scan(scan),
            modules,
            self.config.priority_module(scan.variant, scan.os),
            observer,
        );

        while let Some(outcome) = outcomes.next().await {
            self.record_outcome(scan, &outcome).await?;
        }
        Ok(())
    }

    async fn record_outcome(&self, scan: &Scan, outcome: &ModuleOutcome) -> Result<()> {
        if outcome.success {
            self.ingestor
                .ingest_module(&scan.id, &scan.output_dir, &outcome.module)
                .await?;
            self.store
                .update_module_status(&scan.id, &outcome.module, ModuleStatus::Completed, None)
                .await?;
        } else {
            self.store
                .update_module_status(
                    &scan.id,
                    &outcome.module,
                    ModuleStatus::Failed,
                    outcome.error.as_deref(),
                )
                .await?;
        }
        Ok(())
    }

    /// Ingests whatever the run left on disk and fails tasks that never
    /// reported.
    async fn completion_sweep(&self, scan: &Scan) -> Result<()> {
        if let Err(e) = self.ingestor.ingest(&scan.id, &scan.output_dir).await {
            warn!(scan_id = %scan.id, error = %e, "Final ingestion failed");
        }
        let failed = self
            .store
            .fail_unfinished_modules(&scan.id, COMPLETION_SWEEP_ERROR)
            .await?;
        if failed > 0 {
            warn!(scan_id = %scan.id, failed, "Modules finished without output");
        }
        Ok(())
    }

    /// Current state of a scan, reconciled against the runtime first.
    pub async fn get_scan_status(&self, id: &ScanId) -> Result<ScanStatusReport> {
        let scan = self.require_scan(id).await?;

        let mut modules = self.store.list_module_tasks(id).await?;
        if modules.iter().any(|t| !t.status.is_terminal()) {
            match self.reconciler.reconcile_scan(&scan).await {
                Ok(report) => debug!(scan_id = %id, ?report, "Reconciled"),
                Err(e) => warn!(scan_id = %id, error = %e, "Reconciliation failed"),
            }
            modules = self.store.list_module_tasks(id).await?;
        }

        let valid_results = self.store.count_valid_results(id).await?;
        let soft_failure = scan.status == ScanStatus::Completed
            && match scan.format {
                OutputFormat::Json => valid_results == 0,
                OutputFormat::Text => !modules
                    .iter()
                    .any(|t| t.status == ModuleStatus::Completed),
            };

        Ok(ScanStatusReport {
            scan,
            modules,
            valid_results,
            soft_failure,
        })
    }

    /// Parsed output of one module, or a `module -> output` object for all.
    ///
    /// Modules without a stored record fall back to their artifact on disk.
    pub async fn get_results(&self, id: &ScanId, selector: &ResultSelector) -> Result<Value> {
        let scan = self.require_scan(id).await?;

        match selector {
            ResultSelector::Module(module) => {
                if let Some(record) = self.store.get_result(id, module).await? {
                    return Ok(record.content);
                }
                self.read_artifact(&scan, module)
                    .await
                    .ok_or_else(|| Error::ResultNotFound {
                        scan_id: *id,
                        module: module.clone(),
                    })
            }
            ResultSelector::All => {
                let mut all = Map::new();
                for record in self.store.list_results(id).await? {
                    all.insert(record.module, record.content);
                }
                for task in self.store.list_module_tasks(id).await? {
                    if all.contains_key(&task.module) {
                        continue;
                    }
                    if let Some(value) = self.read_artifact(&scan, &task.module).await {
                        all.insert(task.module, value);
                    }
                }
                Ok(Value::Object(all))
            }
        }
    }

    async fn read_artifact(&self, scan: &Scan, module: &str) -> Option<Value> {
        let json = output_path(&scan.output_dir, module, OutputFormat::Json);
        if let Ok(raw) = tokio::fs::read(&json).await {
            return Some(parse_output(&String::from_utf8_lossy(&raw)).0);
        }
        let text = output_path(&scan.output_dir, module, OutputFormat::Text);
        if let Ok(raw) = tokio::fs::read(&text).await {
            return Some(Value::String(String::from_utf8_lossy(&raw).into_owned()));
        }
        None
    }

    /// Runs one module of an existing scan again, in the background.
    ///
    /// The task keeps its current row until the new attempt finishes; then
    /// its status and result are replaced together.
    ///
    /// # Errors
    ///
    /// [`Error::ModuleBusy`] while the module is pending, running, or
    /// already being re-run.
    pub async fn run_single_module(
        &self,
        id: &ScanId,
        module: &str,
    ) -> Result<JoinHandle<ModuleOutcome>> {
        let scan = self.require_scan(id).await?;
        validate_module_name(module)?;

        let busy = || Error::ModuleBusy {
            scan_id: *id,
            module: module.to_string(),
        };
        if let Some(task) = self.store.get_module_task(id, module).await? {
            if !task.status.is_terminal() {
                return Err(busy());
            }
        }
        if !self.claim_rerun(id, module) {
            return Err(busy());
        }

        let supervisor = self.clone();
        let module = module.to_string();
        Ok(tokio::spawn(async move {
            let outcome = supervisor.rerun(&scan, &module).await;
            supervisor.release_rerun(&scan.id, &module);
            outcome
        }))
    }

    async fn rerun(&self, scan: &Scan, module: &str) -> ModuleOutcome {
        info!(scan_id = %scan.id, module, "Re-running module");
        let bindings = ScanBindings::for_scan(scan);
        let outcome = self.executor.run(module, &bindings).await;

        let result = match scan.format {
            OutputFormat::Json => {
                let path = output_path(&scan.output_dir, module, OutputFormat::Json);
                match tokio::fs::read(&path).await {
                    Ok(raw) => {
                        let (content, is_error) = parse_output(&String::from_utf8_lossy(&raw));
                        Some(NewResult { content, is_error })
                    }
                    Err(_) => None,
                }
            }
            OutputFormat::Text => None,
        };

        let status = if outcome.success {
            ModuleStatus::Completed
        } else {
            ModuleStatus::Failed
        };
        if let Err(e) = self
            .store
            .replace_module_attempt(
                &scan.id,
                module,
                status,
                outcome.error.as_deref(),
                result.as_ref(),
            )
            .await
        {
            error!(scan_id = %scan.id, module, error = %e, "Failed to record re-run");
        }
        outcome
    }

    fn claim_rerun(&self, id: &ScanId, module: &str) -> bool {
        let mut reruns = self
            .reruns
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        reruns.insert((*id, module.to_string()))
    }

    fn release_rerun(&self, id: &ScanId, module: &str) {
        let mut reruns = self
            .reruns
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        reruns.remove(&(*id, module.to_string()));
    }

    pub async fn list_scans(&self) -> Result<Vec<ScanSummary>> {
        self.store.list_scans().await
    }

    pub async fn rename_scan(&self, id: &ScanId, name: &str) -> Result<()> {
        if self.store.rename_scan(id, name.trim()).await? {
            Ok(())
        } else {
            Err(Error::ScanNotFound(*id))
        }
    }

    /// Deletes a finished scan, its records, and its output directory.
    pub async fn delete_scan(&self, id: &ScanId) -> Result<Scan> {
        let scan = self.require_scan(id).await?;
        if scan.status.is_active() {
            return Err(Error::InvalidRequest(format!(
                "Scan {} is still {}",
                id, scan.status
            )));
        }

        let scan = self
            .store
            .delete_scan(id)
            .await?
            .ok_or(Error::ScanNotFound(*id))?;

        match tokio::fs::remove_dir_all(&scan.output_dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                scan_id = %id,
                dir = %scan.output_dir.display(),
                error = %e,
                "Failed to remove output directory"
            ),
        }
        Ok(scan)
    }

    /// Fails active scans older than the configured ceiling.
    ///
    /// Each candidate is reconciled first so units that did finish are
    /// credited. Returns the ids of the scans that were failed.
    pub async fn sweep_stale_scans(&self) -> Result<Vec<ScanId>> {
        let cutoff = chrono::Utc::now() - self.config.stale_after();
        let error = timeout_error(self.config.stale_after_minutes);

        let mut failed = Vec::new();
        for scan in self.store.active_scans_created_before(cutoff).await? {
            if let Err(e) = self.reconciler.reconcile_scan(&scan).await {
                warn!(scan_id = %scan.id, error = %e, "Reconciliation before sweep failed");
            }
            if self.store.fail_stale_scan(&scan.id, &error).await? {
                failed.push(scan.id);
            }
        }

        if !failed.is_empty() {
            info!(count = failed.len(), "Staleness sweep failed scans");
        }
        Ok(failed)
    }

    /// Repeats the staleness sweep every `interval`, starting one interval
    /// from now, until the task is aborted.
    pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let supervisor = self.clone();
        let interval = interval.max(Duration::from_secs(1));
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);
            loop {
                ticker.tick().await;
                if let Err(e) = supervisor.sweep_stale_scans().await {
                    error!(error = %e, "Staleness sweep failed");
                }
            }
        })
    }

    async fn require_scan(&self, id: &ScanId) -> Result<Scan> {
        self.store
            .get_scan(id)
            .await?
            .ok_or(Error::ScanNotFound(*id))
    }
}

/// Drops repeated modules, keeping the first occurrence.
pub fn dedup_modules(modules: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    modules
        .into_iter()
        .filter(|m| seen.insert(m.clone()))
        .collect()
}

/// Module ids become file and unit names verbatim, so anything the unit
/// name sanitizer would alter is rejected along with path syntax.
fn validate_module_name(module: &str) -> Result<()> {
    if module.is_empty() || module.contains("..") || sanitize_module(module) != module {
        return Err(Error::InvalidRequest(format!(
            "Invalid module name: {:?}",
            module
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::unit_name;
    use crate::model::TargetOs;
    use crate::runtime::UnitState;
    use crate::testing::{FakeRuntime, Script};
    use serde_json::json;
    use std::path::Path;
    use tokio::sync::Semaphore;

    struct Harness {
        dir: tempfile::TempDir,
        runtime: Arc<FakeRuntime>,
        supervisor: Supervisor,
    }

    impl Harness {
        async fn new() -> Self {
            Self::with_config(|_| {}).await
        }

        async fn with_config(tweak: impl FnOnce(&mut Config)) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let mut config = Config::for_storage(dir.path());
            config.max_parallelism = Some(2);
            tweak(&mut config);

            let store = ScanStore::open(&config.database_path()).await.unwrap();
            let runtime = Arc::new(FakeRuntime::new());
            let supervisor = Supervisor::new(config, store, runtime.clone()).unwrap();
            std::fs::write(dir.path().join("mem.raw"), b"dump").unwrap();
            Self {
                dir,
                runtime,
                supervisor,
            }
        }

        fn request(&self, modules: &str) -> ScanRequest {
            ScanRequest::new(self.dump(), ToolVariant::Vol3, TargetOs::Windows)
                .with_modules(modules)
        }

        fn dump(&self) -> PathBuf {
            self.dir.path().join("mem.raw")
        }

        async fn run_to_end(&self, request: ScanRequest) -> ScanStatusReport {
            let admitted = self.supervisor.admit_scan(request).await.unwrap();
            let id = admitted.id();
            admitted.task.await.unwrap();
            self.supervisor.get_scan_status(&id).await.unwrap()
        }
    }

    fn status_of(report: &ScanStatusReport, module: &str) -> ModuleStatus {
        report
            .modules
            .iter()
            .find(|t| t.module == module)
            .map(|t| t.status)
            .unwrap()
    }

    #[tokio::test]
    async fn test_failed_module_does_not_fail_scan() {
        let h = Harness::new().await;
        h.runtime.script("m1", Script::exits(0, "b\nb\n[{\"PID\": 4}]"));
        h.runtime.script("m2", Script::exits(1, "b\nb\nTraceback"));

        let report = h.run_to_end(h.request("m1,m2")).await;

        assert_eq!(report.scan.status, ScanStatus::Completed);
        assert_eq!(status_of(&report, "m1"), ModuleStatus::Completed);
        assert_eq!(status_of(&report, "m2"), ModuleStatus::Failed);
        assert_eq!(report.valid_results, 1);
        assert!(!report.soft_failure);
        assert!(report.scan.status.is_terminal());
        assert!(report.modules.iter().all(|t| t.status.is_terminal()));
    }

    #[tokio::test]
    async fn test_second_admission_is_rejected_while_running() {
        let h = Harness::new().await;
        let gate = Arc::new(Semaphore::new(0));
        h.runtime.script("slow", Script::exits(0, "b\nb\n[]").held_by(gate.clone()));

        let first = h.supervisor.admit_scan(h.request("slow")).await.unwrap();

        let err = h.supervisor.admit_scan(h.request("other")).await.unwrap_err();
        assert!(matches!(err, Error::ConcurrentScan(id) if id == first.id()));
        assert_eq!(h.supervisor.list_scans().await.unwrap().len(), 1);

        gate.add_permits(1);
        first.task.await.unwrap();

        let second = h.supervisor.admit_scan(h.request("other")).await.unwrap();
        second.task.await.unwrap();
        assert_eq!(h.supervisor.list_scans().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_unreachable_runtime_fails_scan_and_all_tasks() {
        let h = Harness::new().await;
        h.runtime.set_unreachable("Cannot connect to the Docker daemon");

        let report = h.run_to_end(h.request("a,b")).await;

        assert_eq!(report.scan.status, ScanStatus::Failed);
        assert!(report
            .scan
            .error
            .as_deref()
            .unwrap()
            .contains("Cannot connect"));
        assert!(report.modules.iter().all(|t| t.status == ModuleStatus::Failed
            && t.error_message.as_deref() == Some(COMPLETION_SWEEP_ERROR)));
    }

    #[tokio::test]
    async fn test_zero_valid_results_is_soft_failure() {
        let h = Harness::new().await;
        h.runtime.script("a", Script::exits(0, "b\nb\nnot json at all"));

        let report = h.run_to_end(h.request("a")).await;
        assert_eq!(report.scan.status, ScanStatus::Completed);
        assert_eq!(report.valid_results, 0);
        assert!(report.soft_failure);
    }

    #[tokio::test]
    async fn test_bad_requests_persist_nothing() {
        let h = Harness::new().await;

        let missing = ScanRequest::new(h.dir.path().join("nope.raw"), ToolVariant::Vol3, TargetOs::Linux);
        assert!(h.supervisor.admit_scan(missing).await.unwrap_err().is_bad_config());

        let no_profile = ScanRequest::new(h.dump(), ToolVariant::Vol2, TargetOs::Windows);
        assert!(h.supervisor.admit_scan(no_profile).await.unwrap_err().is_bad_config());

        let empty = h.request(" , ");
        assert!(h.supervisor.admit_scan(empty).await.unwrap_err().is_bad_config());

        let traversal = h.request("../../etc/passwd");
        assert!(h.supervisor.admit_scan(traversal).await.unwrap_err().is_bad_config());

        assert!(h.supervisor.list_scans().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_modules_run_once() {
        let h = Harness::new().await;
        let admitted = h.supervisor.admit_scan(h.request("a,b,a")).await.unwrap();
        assert_eq!(admitted.modules, vec!["a", "b"]);
        admitted.task.await.unwrap();
        assert_eq!(h.runtime.started().len(), 2);
    }

    #[tokio::test]
    async fn test_module_ids_must_map_to_distinct_units() {
        let h = Harness::new().await;
        let colliding = h.request("windows.pslist.PsList --pid 4,windows.pslist.PsList--pid4");
        let err = h.supervisor.admit_scan(colliding).await.unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
        assert!(h.supervisor.list_scans().await.unwrap().is_empty());
        assert!(h.runtime.started().is_empty());

        let report = h.run_to_end(h.request("a")).await;
        let err = h
            .supervisor
            .run_single_module(&report.scan.id, "windows.pslist.PsList --pid 4")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_priority_module_starts_first() {
        let h = Harness::new().await;
        let report = h
            .run_to_end(h.request("windows.pslist.PsList,windows.info.Info"))
            .await;
        assert_eq!(report.scan.status, ScanStatus::Completed);
        assert!(h.runtime.started()[0].ends_with("-windows.info.Info"));
    }

    #[tokio::test]
    async fn test_staleness_sweep_fails_old_running_scan() {
        let h = Harness::with_config(|c| c.stale_after_minutes = 0).await;
        let store = h.supervisor.store().clone();
        let new = crate::store::test_support::new_scan(h.dir.path());
        store
            .create_scan(&new, &crate::store::test_support::modules(&["a", "b"]))
            .await
            .unwrap();
        store
            .update_scan_status(&new.id, ScanStatus::Running, None)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let failed = h.supervisor.sweep_stale_scans().await.unwrap();
        assert_eq!(failed, vec![new.id]);

        let report = h.supervisor.get_scan_status(&new.id).await.unwrap();
        assert_eq!(report.scan.status, ScanStatus::Failed);
        assert_eq!(report.scan.error.as_deref(), Some("Timeout (>0m)"));
        assert!(report.modules.iter().all(|t| t.status == ModuleStatus::Failed));
        assert!(h.supervisor.store().active_scan().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_status_query_reconciles_orphaned_tasks() {
        let h = Harness::new().await;
        let store = h.supervisor.store().clone();
        let new = crate::store::test_support::new_scan(h.dir.path());
        store
            .create_scan(&new, &crate::store::test_support::modules(&["done", "busy"]))
            .await
            .unwrap();

        h.runtime.set_state(
            &unit_name(new.variant, &new.id, "done"),
            UnitState::Exited { exit_code: 0 },
        );
        h.runtime
            .set_state(&unit_name(new.variant, &new.id, "busy"), UnitState::Running);

        let report = h.supervisor.get_scan_status(&new.id).await.unwrap();
        assert_eq!(status_of(&report, "done"), ModuleStatus::Completed);
        assert_eq!(status_of(&report, "busy"), ModuleStatus::Running);
    }

    #[tokio::test]
    async fn test_results_queries() {
        let h = Harness::new().await;
        h.runtime.script("a", Script::exits(0, "b\nb\n[{\"x\": 1}]"));
        let report = h.run_to_end(h.request("a,b")).await;
        let id = report.scan.id;

        let a = h
            .supervisor
            .get_results(&id, &ResultSelector::Module("a".to_string()))
            .await
            .unwrap();
        assert_eq!(a, json!([{"x": 1}]));

        let all = h.supervisor.get_results(&id, &ResultSelector::All).await.unwrap();
        assert_eq!(all["a"], json!([{"x": 1}]));
        assert_eq!(all["b"], json!([]));

        let missing = h
            .supervisor
            .get_results(&id, &ResultSelector::Module("zzz".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(missing, Error::ResultNotFound { .. }));

        let no_scan = h
            .supervisor
            .get_results(&ScanId::new(), &ResultSelector::All)
            .await
            .unwrap_err();
        assert!(matches!(no_scan, Error::ScanNotFound(_)));
    }

    #[tokio::test]
    async fn test_results_fall_back_to_disk() {
        let h = Harness::new().await;
        let report = h.run_to_end(h.request("a")).await;
        let id = report.scan.id;
        std::fs::write(
            report.scan.output_dir.join("late_output.json"),
            "banner\n{\"late\": true}",
        )
        .unwrap();

        let late = h
            .supervisor
            .get_results(&id, &ResultSelector::Module("late".to_string()))
            .await
            .unwrap();
        assert_eq!(late, json!({"late": true}));
    }

    #[tokio::test]
    async fn test_rerun_replaces_failed_module() {
        let h = Harness::new().await;
        h.runtime.script("flaky", Script::exits(1, "b\nb\nboom"));
        let report = h.run_to_end(h.request("flaky")).await;
        let id = report.scan.id;
        assert_eq!(status_of(&report, "flaky"), ModuleStatus::Failed);

        h.runtime.script("flaky", Script::exits(0, "b\nb\n[{\"ok\": 1}]"));
        let outcome = h
            .supervisor
            .run_single_module(&id, "flaky")
            .await
            .unwrap()
            .await
            .unwrap();
        assert!(outcome.success);

        let report = h.supervisor.get_scan_status(&id).await.unwrap();
        assert_eq!(status_of(&report, "flaky"), ModuleStatus::Completed);
        assert_eq!(report.valid_results, 1);
        let content = h
            .supervisor
            .get_results(&id, &ResultSelector::Module("flaky".to_string()))
            .await
            .unwrap();
        assert_eq!(content, json!([{"ok": 1}]));
    }

    #[tokio::test]
    async fn test_rerun_rejected_while_task_active() {
        let h = Harness::new().await;
        let gate = Arc::new(Semaphore::new(0));
        h.runtime.script("slow", Script::exits(0, "b\nb\n[]").held_by(gate.clone()));
        let admitted = h.supervisor.admit_scan(h.request("slow")).await.unwrap();

        let err = h
            .supervisor
            .run_single_module(&admitted.id(), "slow")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ModuleBusy { .. }));

        gate.add_permits(1);
        admitted.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_rename_and_delete() {
        let h = Harness::new().await;
        let report = h.run_to_end(h.request("a")).await;
        let id = report.scan.id;
        assert!(Path::new(&report.scan.output_dir).exists());

        h.supervisor.rename_scan(&id, "workstation").await.unwrap();
        let listed = h.supervisor.list_scans().await.unwrap();
        assert_eq!(listed[0].scan.name.as_deref(), Some("workstation"));

        let deleted = h.supervisor.delete_scan(&id).await.unwrap();
        assert!(!deleted.output_dir.exists());
        assert!(matches!(
            h.supervisor.get_scan_status(&id).await.unwrap_err(),
            Error::ScanNotFound(_)
        ));
        assert!(matches!(
            h.supervisor.rename_scan(&id, "x").await.unwrap_err(),
            Error::ScanNotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_delete_rejects_active_scan() {
        let h = Harness::new().await;
        let gate = Arc::new(Semaphore::new(0));
        h.runtime.script("slow", Script::exits(0, "b\nb\n[]").held_by(gate.clone()));
        let admitted = h.supervisor.admit_scan(h.request("slow")).await.unwrap();
        let id = admitted.id();

        assert!(h.supervisor.delete_scan(&id).await.is_err());

        gate.add_permits(1);
        admitted.task.await.unwrap();
        assert!(h.supervisor.delete_scan(&id).await.is_ok());
    }

    #[test]
    fn test_result_selector_parsing() {
        assert_eq!("all".parse::<ResultSelector>().unwrap(), ResultSelector::All);
        assert_eq!(
            "windows.info.Info".parse::<ResultSelector>().unwrap(),
            ResultSelector::Module("windows.info.Info".to_string())
        );
    }

    #[test]
    fn test_dedup_keeps_first_occurrence() {
        let modules = vec!["b", "a", "b", "c", "a"]
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(dedup_modules(modules), vec!["b", "a", "c"]);
    }
}

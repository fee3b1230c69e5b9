//! Bounded-parallel execution of a scan's modules.
//!
//! The coordinator turns a planned module list into a stream of
//! [`ModuleOutcome`]s in completion order. An optional priority module runs
//! alone first; the rest share a pool of at most `parallelism` concurrent
//! units, each on its own tokio task.

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error};

use crate::executor::{Executor, ScanBindings};
use crate::model::ModuleOutcome;

/// Notified right before a module's unit starts.
#[async_trait]
pub trait ModuleObserver: Send + Sync {
    async fn on_start(&self, module: &str);
}

/// Observer that ignores every notification.
pub struct NoopObserver;

#[async_trait]
impl ModuleObserver for NoopObserver {
    async fn on_start(&self, _module: &str) {}
}

#[derive(Clone)]
pub struct Coordinator {
    executor: Executor,
    parallelism: usize,
}

/// Splits the priority module (if listed) off the pooled set.
pub fn plan(modules: Vec<String>, priority: Option<&str>) -> (Option<String>, Vec<String>) {
    let mut rest = modules;
    let first = priority.and_then(|p| {
        let index = rest.iter().position(|m| m == p)?;
        Some(rest.remove(index))
    });
    (first, rest)
}

impl Coordinator {
    pub fn new(executor: Executor, parallelism: usize) -> Self {
        Self {
            executor,
            parallelism: parallelism.max(1),
        }
    }

    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    /// Runs `modules` and yields their outcomes as they finish.
    ///
    /// The priority module, when present in `modules`, completes before any
    /// other module starts. Nothing runs until the stream is polled.
    pub fn execute(
        &self,
        bindings: ScanBindings,
        modules: Vec<String>,
        priority: Option<&str>,
        observer: Arc<dyn ModuleObserver>,
    ) -> BoxStream<'static, ModuleOutcome> {
        let (first, rest) = plan(modules, priority);
        let width = self.parallelism.min(rest.len()).max(1);
        debug!(
            scan_id = %bindings.scan_id,
            priority = ?first,
            pooled = rest.len(),
            width,
            "Planning module execution"
        );

        let bindings = Arc::new(bindings);

        let head = {
            let executor = self.executor.clone();
            let bindings = bindings.clone();
            let observer = observer.clone();
            stream::iter(first).then(move |module| {
                launch(executor.clone(), bindings.clone(), observer.clone(), module)
            })
        };

        let executor = self.executor.clone();
        let pooled = stream::iter(rest)
            .map(move |module| launch(executor.clone(), bindings.clone(), observer.clone(), module))
            .buffer_unordered(width);

        head.chain(pooled).boxed()
    }
}

/// Spawns one module run on its own task.
fn launch(
    executor: Executor,
    bindings: Arc<ScanBindings>,
    observer: Arc<dyn ModuleObserver>,
    module: String,
) -> impl Future<Output = ModuleOutcome> + Send + 'static {
    let name = module.clone();
    let handle = tokio::spawn(async move {
        observer.on_start(&module).await;
        executor.run(&module, &bindings).await
    });

    async move {
        match handle.await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(module = %name, error = %e, "Module task aborted");
                ModuleOutcome::failed(name, format!("Module task aborted: {}", e))
            }
        }
    }
}

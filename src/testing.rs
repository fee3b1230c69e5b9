//! Scripted container runtime for tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

use crate::error::{Error, Result};
use crate::runtime::{ContainerRuntime, UnitSpec, UnitState};

const DEFAULT_OUTPUT: &str = "Volatility 3 Framework 2.7.0\nProgress:  100.00\n[]\n";

/// Scripted behavior of one module's unit.
#[derive(Clone)]
pub(crate) struct Script {
    start_error: Option<String>,
    exit_code: i64,
    output: String,
    gate: Option<Arc<Semaphore>>,
}

impl Script {
    pub(crate) fn exits(exit_code: i64, output: &str) -> Self {
        Self {
            start_error: None,
            exit_code,
            output: output.to_string(),
            gate: None,
        }
    }

    pub(crate) fn fails_to_start(error: &str) -> Self {
        Self {
            start_error: Some(error.to_string()),
            ..Self::exits(0, "")
        }
    }

    /// The unit keeps running until `gate` receives a permit.
    pub(crate) fn held_by(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }
}

#[derive(Default)]
pub(crate) struct FakeRuntime {
    scripts: Mutex<HashMap<String, Script>>,
    units: Mutex<HashMap<String, UnitState>>,
    started: Mutex<Vec<String>>,
    removed: Mutex<Vec<String>>,
    unreachable: Mutex<Option<String>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl FakeRuntime {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Scripts the unit running `module`.
    pub(crate) fn script(&self, module: &str, script: Script) {
        lock(&self.scripts).insert(crate::executor::sanitize_module(module), script);
    }

    pub(crate) fn set_unreachable(&self, error: &str) {
        *lock(&self.unreachable) = Some(error.to_string());
    }

    /// Pretends a unit exists in `state`, as if left over from a crash.
    pub(crate) fn set_state(&self, name: &str, state: UnitState) {
        lock(&self.units).insert(name.to_string(), state);
    }

    /// Unit names in start order.
    pub(crate) fn started(&self) -> Vec<String> {
        lock(&self.started).clone()
    }

    pub(crate) fn removed(&self) -> Vec<String> {
        lock(&self.removed).clone()
    }

    /// Most units ever running at once.
    pub(crate) fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn script_for(&self, name: &str) -> Script {
        // <variant>-<scan>-<module>
        let module = name.splitn(3, '-').nth(2).unwrap_or(name);
        lock(&self.scripts)
            .get(module)
            .cloned()
            .unwrap_or_else(|| Script::exits(0, DEFAULT_OUTPUT))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn ping(&self) -> Result<()> {
        match lock(&self.unreachable).clone() {
            Some(error) => Err(Error::Runtime(error)),
            None => Ok(()),
        }
    }

    async fn run(&self, spec: &UnitSpec) -> Result<()> {
        if let Some(error) = self.script_for(&spec.name).start_error {
            return Err(Error::Runtime(error));
        }
        lock(&self.units).insert(spec.name.clone(), UnitState::Running);
        lock(&self.started).push(spec.name.clone());

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        Ok(())
    }

    async fn capture_logs(&self, name: &str, dest: &Path) -> Result<()> {
        let script = self.script_for(name);
        if let Some(gate) = &script.gate {
            let permit = gate
                .acquire()
                .await
                .map_err(|e| Error::Runtime(e.to_string()))?;
            permit.forget();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        tokio::fs::write(dest, script.output).await?;
        Ok(())
    }

    async fn wait(&self, name: &str) -> Result<i64> {
        let exit_code = self.script_for(name).exit_code;
        lock(&self.units).insert(name.to_string(), UnitState::Exited { exit_code });
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(exit_code)
    }

    async fn inspect(&self, name: &str) -> Result<UnitState> {
        Ok(lock(&self.units)
            .get(name)
            .copied()
            .unwrap_or(UnitState::Absent))
    }

    async fn remove(&self, name: &str) -> Result<()> {
        lock(&self.units).remove(name);
        lock(&self.removed).push(name.to_string());
        Ok(())
    }
}

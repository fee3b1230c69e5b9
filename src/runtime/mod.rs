//! Container runtime abstraction.
//!
//! The engine only ever talks to containers through [`ContainerRuntime`],
//! addressing them by name. [`DockerCli`] drives the `docker` executable;
//! tests substitute a scripted runtime.

mod docker;

pub use docker::DockerCli;

use async_trait::async_trait;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::Result;

/// A host directory or file bound into a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub source: PathBuf,
    pub target: String,
    pub read_only: bool,
}

impl Mount {
    pub fn rw(source: impl Into<PathBuf>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            read_only: false,
        }
    }

    pub fn ro(source: impl Into<PathBuf>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            read_only: true,
        }
    }

    /// `source:target[:ro]`, as accepted by `docker run -v`.
    pub fn to_volume_arg(&self) -> String {
        let mut arg = format!("{}:{}", self.source.display(), self.target);
        if self.read_only {
            arg.push_str(":ro");
        }
        arg
    }
}

/// Everything needed to start one execution unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitSpec {
    pub name: String,
    pub image: String,
    /// Arguments passed to the image entrypoint.
    pub command: Vec<String>,
    pub mounts: Vec<Mount>,
    pub tty: bool,
}

/// Observed state of a named unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    /// Created but not yet started.
    Created,
    Running,
    /// Exited or dead.
    Exited { exit_code: i64 },
    /// No unit with that name exists.
    Absent,
}

impl fmt::Display for UnitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitState::Created => write!(f, "created"),
            UnitState::Running => write!(f, "running"),
            UnitState::Exited { exit_code } => write!(f, "exited ({})", exit_code),
            UnitState::Absent => write!(f, "absent"),
        }
    }
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Fails when the runtime daemon cannot be reached.
    async fn ping(&self) -> Result<()>;

    /// Starts a detached unit named `spec.name`.
    async fn run(&self, spec: &UnitSpec) -> Result<()>;

    /// Follows the unit's combined stdout/stderr into `dest` until it exits.
    async fn capture_logs(&self, name: &str, dest: &Path) -> Result<()>;

    /// Blocks until the unit exits and returns its exit code.
    async fn wait(&self, name: &str) -> Result<i64>;

    async fn inspect(&self, name: &str) -> Result<UnitState>;

    /// Force-removes the unit. Removing an absent unit is not an error.
    async fn remove(&self, name: &str) -> Result<()>;
}

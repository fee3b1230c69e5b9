use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use super::{Depth, ModuleTask, OutputFormat, ScanId, TargetOs, ToolVariant};

/// Lifecycle of a scan: `Pending -> Running -> {Completed, Failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl ScanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanStatus::Pending => "pending",
            ScanStatus::Running => "running",
            ScanStatus::Completed => "completed",
            ScanStatus::Failed => "failed",
        }
    }

    /// Pending and running scans hold the global admission slot.
    pub fn is_active(&self) -> bool {
        matches!(self, ScanStatus::Pending | ScanStatus::Running)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }
}

impl fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ScanStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(ScanStatus::Pending),
            "running" => Ok(ScanStatus::Running),
            "completed" => Ok(ScanStatus::Completed),
            "failed" => Ok(ScanStatus::Failed),
            _ => Err(format!("Unknown scan status: {}", s)),
        }
    }
}

/// Parameters a scan is admitted with.
///
/// The request is persisted alongside the scan so that single modules can be
/// re-run later with the same bindings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanRequest {
    pub dump: PathBuf,
    pub variant: ToolVariant,
    pub os: TargetOs,
    #[serde(default)]
    pub depth: Depth,
    /// Comma-separated module list overriding the catalog.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modules: Option<String>,
    #[serde(default)]
    pub format: OutputFormat,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Volatility 2 profile, e.g. `Win7SP1x64`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Fetch symbol tables remotely. Defaults to on for Linux dumps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fetch_symbol: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_parallelism: Option<usize>,
}

impl ScanRequest {
    pub fn new(dump: impl Into<PathBuf>, variant: ToolVariant, os: TargetOs) -> Self {
        Self {
            dump: dump.into(),
            variant,
            os,
            depth: Depth::default(),
            modules: None,
            format: OutputFormat::default(),
            image: None,
            profile: None,
            name: None,
            fetch_symbol: None,
            max_parallelism: None,
        }
    }

    pub fn with_depth(mut self, depth: Depth) -> Self {
        self.depth = depth;
        self
    }

    pub fn with_modules(mut self, modules: impl Into<String>) -> Self {
        self.modules = Some(modules.into());
        self
    }

    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_profile(mut self, profile: impl Into<String>) -> Self {
        self.profile = Some(profile.into());
        self
    }

    pub fn fetch_symbols(&self) -> bool {
        self.fetch_symbol.unwrap_or(self.os == TargetOs::Linux)
    }
}

/// One end-to-end analysis job against one memory dump.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scan {
    pub id: ScanId,
    pub status: ScanStatus,
    pub variant: ToolVariant,
    pub os: TargetOs,
    pub depth: Depth,
    pub format: OutputFormat,
    pub image: String,
    pub dump_path: PathBuf,
    pub output_dir: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_json: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Scan {
    /// The request this scan was admitted with, if it was recorded.
    pub fn request(&self) -> Option<ScanRequest> {
        self.config_json
            .as_deref()
            .and_then(|json| serde_json::from_str(json).ok())
    }

    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("scan_{}", self.id.short()))
    }
}

/// Scan listing entry with the number of modules that produced usable output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanSummary {
    #[serde(flatten)]
    pub scan: Scan,
    pub valid_results: u64,
}

/// Point-in-time view of a scan and all of its module tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanStatusReport {
    pub scan: Scan,
    pub modules: Vec<ModuleTask>,
    pub valid_results: u64,
    /// Completed, but not a single module produced usable output.
    pub soft_failure: bool,
}

impl ScanStatusReport {
    pub fn count(&self, status: super::ModuleStatus) -> usize {
        self.modules.iter().filter(|m| m.status == status).count()
    }

    pub fn finished_modules(&self) -> usize {
        self.modules.iter().filter(|m| m.status.is_terminal()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_status_activity() {
        assert!(ScanStatus::Pending.is_active());
        assert!(ScanStatus::Running.is_active());
        assert!(ScanStatus::Completed.is_terminal());
        assert!(ScanStatus::Failed.is_terminal());
    }

    #[test]
    fn test_fetch_symbols_defaults_on_for_linux() {
        let linux = ScanRequest::new("/tmp/mem.lime", ToolVariant::Vol3, TargetOs::Linux);
        let windows = ScanRequest::new("/tmp/mem.raw", ToolVariant::Vol3, TargetOs::Windows);
        assert!(linux.fetch_symbols());
        assert!(!windows.fetch_symbols());

        let mut explicit = linux.clone();
        explicit.fetch_symbol = Some(false);
        assert!(!explicit.fetch_symbols());
    }

    #[test]
    fn test_request_deserializes_with_defaults() {
        let request: ScanRequest = serde_json::from_str(
            r#"{"dump": "/data/mem.raw", "variant": "vol3", "os": "windows"}"#,
        )
        .unwrap();
        assert_eq!(request.depth, Depth::Light);
        assert_eq!(request.format, OutputFormat::Json);
        assert!(request.modules.is_none());
    }
}

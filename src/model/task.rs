use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::ScanId;

/// Lifecycle of one module inside a scan.
///
/// `Completed` and `Failed` are terminal: once a task reaches either, the
/// regular update path never moves it again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ModuleStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl ModuleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModuleStatus::Pending => "PENDING",
            ModuleStatus::Running => "RUNNING",
            ModuleStatus::Completed => "COMPLETED",
            ModuleStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ModuleStatus::Completed | ModuleStatus::Failed)
    }
}

impl fmt::Display for ModuleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ModuleStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "PENDING" => Ok(ModuleStatus::Pending),
            "RUNNING" => Ok(ModuleStatus::Running),
            "COMPLETED" => Ok(ModuleStatus::Completed),
            "FAILED" => Ok(ModuleStatus::Failed),
            _ => Err(format!("Unknown module status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleTask {
    pub scan_id: ScanId,
    pub module: String,
    pub status: ModuleStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Canonicalized output of one module, stored at most once per scan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultRecord {
    pub scan_id: ScanId,
    pub module: String,
    pub content: serde_json::Value,
    /// The content is the invalid-output wrapper rather than tool data.
    pub is_error: bool,
    pub created_at: DateTime<Utc>,
}

/// What one module run reported back to the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleOutcome {
    pub module: String,
    pub success: bool,
    pub error: Option<String>,
}

impl ModuleOutcome {
    pub fn succeeded(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            success: true,
            error: None,
        }
    }

    pub fn failed(module: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            success: false,
            error: Some(error.into()),
        }
    }
}

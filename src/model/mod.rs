//! Core data types for scans, module tasks, and stored results.
//!
//! This module contains the fundamental types used throughout multivol:
//!
//! - [`Scan`] - One analysis job against one memory dump
//! - [`ModuleTask`] - The lifecycle row of one module inside a scan
//! - [`ResultRecord`] - Canonicalized output of one module
//! - [`ScanRequest`] - Parameters a scan is admitted with
//! - [`ToolVariant`], [`TargetOs`], [`Depth`], [`OutputFormat`] - Request dimensions
//!
//! # Example
//!
//! ```
//! use multivol::model::{ModuleStatus, ScanStatus};
//!
//! assert!(ModuleStatus::Failed.is_terminal());
//! assert!(ScanStatus::Running.is_active());
//! ```

mod scan;
mod task;

pub use scan::*;
pub use task::*;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Unique identifier of a scan.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScanId(pub Uuid);

impl Default for ScanId {
    fn default() -> Self {
        Self::new()
    }
}

impl ScanId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Hyphen-free form, safe to embed in container names.
    pub fn simple(&self) -> String {
        self.0.simple().to_string()
    }

    /// First eight characters, for display.
    pub fn short(&self) -> String {
        self.simple().chars().take(8).collect()
    }
}

impl fmt::Display for ScanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ScanId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(ScanId)
    }
}

/// Which generation of the wrapped analysis tool runs the modules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolVariant {
    Vol2,
    Vol3,
}

impl ToolVariant {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolVariant::Vol2 => "vol2",
            ToolVariant::Vol3 => "vol3",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            ToolVariant::Vol2 => "Volatility 2",
            ToolVariant::Vol3 => "Volatility 3",
        }
    }
}

impl fmt::Display for ToolVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ToolVariant {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "vol2" | "volatility2" => Ok(ToolVariant::Vol2),
            "vol3" | "volatility3" => Ok(ToolVariant::Vol3),
            _ => Err(format!("Unknown tool variant: {}. Use 'vol2' or 'vol3'", s)),
        }
    }
}

/// Operating system the memory dump was taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetOs {
    Windows,
    Linux,
}

impl TargetOs {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetOs::Windows => "windows",
            TargetOs::Linux => "linux",
        }
    }
}

impl fmt::Display for TargetOs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TargetOs {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "windows" => Ok(TargetOs::Windows),
            "linux" => Ok(TargetOs::Linux),
            _ => Err(format!("Unknown OS: {}. Use 'windows' or 'linux'", s)),
        }
    }
}

/// How many modules a catalog-driven scan runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Depth {
    #[default]
    Light,
    Full,
}

impl Depth {
    pub fn as_str(&self) -> &'static str {
        match self {
            Depth::Light => "light",
            Depth::Full => "full",
        }
    }
}

impl fmt::Display for Depth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Depth {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "light" => Ok(Depth::Light),
            "full" => Ok(Depth::Full),
            _ => Err(format!("Unknown depth: {}. Use 'light' or 'full'", s)),
        }
    }
}

/// Format the wrapped tool renders module output in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Json,
    Text,
}

impl OutputFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Json => "json",
            OutputFormat::Text => "text",
        }
    }

    /// File extension of the captured output artifact.
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Json => "json",
            OutputFormat::Text => "txt",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(OutputFormat::Json),
            "text" | "txt" => Ok(OutputFormat::Text),
            _ => Err(format!("Format not supported: {}. Use 'json' or 'text'", s)),
        }
    }
}

mod cli;
mod json;

pub use cli::{print_modules_table, print_scans_table, print_status_table};
pub use json::print_json;

use crate::model::{ScanStatusReport, ScanSummary};
use anyhow::Result;
use serde_json::Value;

/// How reports are rendered on stdout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayFormat {
    /// Human-readable table format
    Table,
    /// JSON format for programmatic use
    Json,
}

impl std::str::FromStr for DisplayFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "table" => Ok(DisplayFormat::Table),
            "json" => Ok(DisplayFormat::Json),
            _ => Err(format!("Unknown format: {}. Use 'table' or 'json'", s)),
        }
    }
}

pub fn print_scans(scans: &[ScanSummary], format: DisplayFormat) -> Result<()> {
    match format {
        DisplayFormat::Table => print_scans_table(scans),
        DisplayFormat::Json => print_json(scans),
    }
}

pub fn print_status(report: &ScanStatusReport, format: DisplayFormat) -> Result<()> {
    match format {
        DisplayFormat::Table => print_status_table(report),
        DisplayFormat::Json => print_json(report),
    }
}

/// Prints module results. Text-format output is printed verbatim.
pub fn print_results(results: &Value) -> Result<()> {
    match results {
        Value::String(text) => {
            println!("{}", text);
            Ok(())
        }
        other => print_json(other),
    }
}

//! Output normalization for captured module logs.
//!
//! The wrapped tools print a preamble before their JSON payload: Volatility 3
//! emits a fixed number of banner lines, Volatility 2 prints progress chatter
//! and puts the whole document on its last line. Everything that knows about
//! those shapes lives here.

use serde_json::{json, Value};

use crate::model::ToolVariant;

/// Banner lines Volatility 3 prints ahead of `-r json` output.
pub const VOL3_BANNER_LINES: usize = 2;

/// Error text stored in place of output that is not valid JSON.
pub const INVALID_JSON_ERROR: &str = "Invalid JSON output";

/// How to strip the preamble from a captured JSON log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preamble {
    /// Drop this many leading lines.
    SkipLines(usize),
    /// Keep only the final line.
    LastLineOnly,
}

impl Preamble {
    pub fn for_variant(variant: ToolVariant, banner_lines: usize) -> Self {
        match variant {
            ToolVariant::Vol3 => Preamble::SkipLines(banner_lines),
            ToolVariant::Vol2 => Preamble::LastLineOnly,
        }
    }
}

/// Strips the tool preamble from a captured JSON log.
///
/// Line endings of the kept lines are preserved. Trailing blank lines are
/// not counted as the last line.
pub fn normalize_output(content: &str, preamble: Preamble) -> String {
    match preamble {
        Preamble::SkipLines(n) => content.split_inclusive('\n').skip(n).collect(),
        Preamble::LastLineOnly => content
            .split_inclusive('\n')
            .rev()
            .find(|line| !line.trim().is_empty())
            .unwrap_or_default()
            .to_string(),
    }
}

fn is_json_open(c: char) -> bool {
    c == '[' || c == '{'
}

/// Parses the first JSON value of `content`, ignoring whatever follows it.
fn parse_leading(content: &str) -> Option<Value> {
    serde_json::Deserializer::from_str(content)
        .into_iter::<Value>()
        .next()?
        .ok()
}

/// Locates and parses the JSON document inside tool output.
///
/// Parsing starts at the first `[` or `{`. If that fails, each later line
/// that opens with a bracket is tried in turn.
pub fn extract_json(content: &str) -> Option<Value> {
    let start = content.find(is_json_open)?;
    if let Some(value) = parse_leading(&content[start..]) {
        return Some(value);
    }

    content
        .match_indices('\n')
        .map(|(i, _)| content[i + 1..].trim_start())
        .filter(|rest| rest.starts_with(is_json_open))
        .find_map(parse_leading)
}

/// Parses module output into a storable value.
///
/// Returns the value and whether it is the invalid-output wrapper.
pub fn parse_output(content: &str) -> (Value, bool) {
    match extract_json(content) {
        Some(value) => (value, false),
        None => (invalid_output(content), true),
    }
}

pub fn invalid_output(raw: &str) -> Value {
    json!({
        "error": INVALID_JSON_ERROR,
        "raw_output": raw,
    })
}

/// Returns the first configured error marker found in `content`.
pub fn find_error_marker<'a>(content: &str, markers: &'a [String]) -> Option<&'a str> {
    markers
        .iter()
        .map(String::as_str)
        .find(|marker| !marker.is_empty() && content.contains(marker))
}

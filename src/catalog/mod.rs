//! Module catalog.
//!
//! Maps a tool variant, target OS, and depth onto the ordered list of
//! modules a scan runs. The built-in lists ship inside the binary as a
//! versioned TOML file; a replacement file can be supplied through
//! [`Config::catalog_path`](crate::Config).
//!
//! # Example
//!
//! ```
//! use multivol::catalog::Catalog;
//! use multivol::model::{Depth, TargetOs, ToolVariant};
//!
//! let catalog = Catalog::builtin().unwrap();
//! let modules = catalog
//!     .resolve(ToolVariant::Vol3, TargetOs::Linux, Depth::Light, None)
//!     .unwrap();
//! assert_eq!(modules[0], "linux.bash.Bash");
//! ```

use serde::Deserialize;
use std::fs;
use std::path::Path;

use crate::error::{Error, Result};
use crate::model::{Depth, TargetOs, ToolVariant};

const BUILTIN_CATALOG: &str = include_str!("modules.toml");

/// Catalog format version this build understands.
pub const CATALOG_VERSION: u32 = 1;

#[derive(Debug, Clone, Deserialize)]
struct CatalogFile {
    version: u32,
    #[serde(default)]
    vol2: OsTable,
    #[serde(default)]
    vol3: OsTable,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct OsTable {
    windows: Option<DepthTable>,
    linux: Option<DepthTable>,
}

#[derive(Debug, Clone, Deserialize)]
struct DepthTable {
    light: Vec<String>,
    full: Option<Vec<String>>,
}

/// Predefined module lists, loaded once and queried by [`Catalog::resolve`].
#[derive(Debug, Clone)]
pub struct Catalog {
    file: CatalogFile,
}

impl Catalog {
    /// The catalog compiled into the binary.
    pub fn builtin() -> Result<Self> {
        Self::parse(BUILTIN_CATALOG)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Loads `path` when given, the built-in catalog otherwise.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_path(path),
            None => Self::builtin(),
        }
    }

    fn parse(content: &str) -> Result<Self> {
        let file: CatalogFile = toml::from_str(content)?;
        if file.version != CATALOG_VERSION {
            return Err(Error::InvalidRequest(format!(
                "Unsupported catalog version {} (expected {})",
                file.version, CATALOG_VERSION
            )));
        }
        Ok(Self { file })
    }

    /// Resolves the modules a scan runs.
    ///
    /// An explicit comma-separated list wins over the catalog and is kept in
    /// order with duplicates; entries are trimmed and blanks dropped.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidRequest`] for an explicit list with no entries,
    /// [`Error::CatalogNotFound`] when the catalog has no list for the
    /// combination.
    pub fn resolve(
        &self,
        variant: ToolVariant,
        os: TargetOs,
        depth: Depth,
        explicit: Option<&str>,
    ) -> Result<Vec<String>> {
        if let Some(list) = explicit {
            let modules = parse_module_list(list);
            if modules.is_empty() {
                return Err(Error::InvalidRequest(
                    "Module list is empty".to_string(),
                ));
            }
            return Ok(modules);
        }

        let by_os = match variant {
            ToolVariant::Vol2 => &self.file.vol2,
            ToolVariant::Vol3 => &self.file.vol3,
        };
        let table = match os {
            TargetOs::Windows => by_os.windows.as_ref(),
            TargetOs::Linux => by_os.linux.as_ref(),
        };
        let not_found = || Error::CatalogNotFound { variant, os, depth };

        let table = table.ok_or_else(not_found)?;
        let modules = match depth {
            Depth::Light => &table.light,
            Depth::Full => table.full.as_ref().unwrap_or(&table.light),
        };

        if modules.is_empty() {
            return Err(not_found());
        }
        Ok(modules.clone())
    }
}

/// Splits a comma-separated module list.
pub fn parse_module_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(String::from)
        .collect()
}

//! Configuration file handling.
//!
//! This module provides loading and saving of multivol configuration
//! from a TOML file.
//!
//! # Configuration Location
//!
//! The configuration file is stored at:
//! - Linux: `~/.config/multivol/config.toml`
//! - macOS: `~/Library/Application Support/multivol/config.toml`
//! - Windows: `%APPDATA%\multivol\config.toml`
//!
//! # Example Configuration
//!
//! ```toml
//! storage_dir = "/srv/multivol"
//! max_parallelism = 6
//! stale_after_minutes = 60
//! docker_binary = "docker"
//!
//! [vol3]
//! image = "sp00kyskelet0n/volatility3"
//! banner_lines = 2
//!
//! [vol2]
//! image = "sp00kyskelet0n/volatility2"
//! ```

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Result;
use crate::executor::normalize::VOL3_BANNER_LINES;
use crate::model::{TargetOs, ToolVariant};
use crate::platform;

/// Application configuration.
///
/// Every field has a default, so a partial file (or no file at all) is
/// valid.
///
/// # Example
///
/// ```no_run
/// use multivol::Config;
///
/// let config = Config::load().unwrap();
///
/// println!("Database: {}", config.database_path().display());
/// println!("Parallelism: {}", config.parallelism());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root directory for the database and per-scan outputs.
    ///
    /// Default: platform data directory + `multivol`
    pub storage_dir: PathBuf,

    /// SQLite database file. Defaults to `<storage_dir>/scans.db`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database_path: Option<PathBuf>,

    /// Upper bound on concurrently running containers.
    ///
    /// Default: number of CPUs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_parallelism: Option<usize>,

    /// A running scan older than this is failed by the staleness sweep.
    ///
    /// Default: 60 minutes
    pub stale_after_minutes: u64,

    /// How often a long-lived process repeats the staleness sweep.
    pub sweep_interval_secs: u64,

    /// Container runtime executable.
    pub docker_binary: String,

    /// Allocate a pseudo-TTY for module containers.
    pub tty: bool,

    /// Project root as seen from the host when running Docker-outside-of-Docker.
    ///
    /// Bind mount sources under the current directory are rewritten onto
    /// this path.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_path: Option<PathBuf>,

    /// Module catalog file replacing the built-in one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub catalog_path: Option<PathBuf>,

    pub paths: PathsConfig,

    pub vol3: Vol3Config,

    pub vol2: Vol2Config,
}

/// Shared directories mounted into module containers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbols: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plugins: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profiles: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Vol3Config {
    pub image: String,

    /// Leading banner lines the tool prints before its JSON payload.
    pub banner_lines: usize,

    /// Runs before the pool to warm the symbol cache on Windows dumps.
    pub windows_priority_module: Option<String>,

    /// Runs before the pool on Linux dumps.
    pub linux_priority_module: Option<String>,

    pub remote_isf_url: String,

    /// Output fragments that mark a run as failed even with exit code 0.
    pub error_markers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Vol2Config {
    pub image: String,
    pub error_markers: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_dir: platform::data_dir(),
            database_path: None,
            max_parallelism: None,
            stale_after_minutes: 60,
            sweep_interval_secs: 300,
            docker_binary: "docker".to_string(),
            tty: true,
            host_path: platform::env_host_path(),
            catalog_path: None,
            paths: PathsConfig::default(),
            vol3: Vol3Config::default(),
            vol2: Vol2Config::default(),
        }
    }
}

impl Default for Vol3Config {
    fn default() -> Self {
        Self {
            image: "sp00kyskelet0n/volatility3".to_string(),
            banner_lines: VOL3_BANNER_LINES,
            windows_priority_module: Some("windows.info.Info".to_string()),
            linux_priority_module: Some("linux.bash.Bash".to_string()),
            remote_isf_url:
                "https://github.com/Abyss-W4tcher/volatility3-symbols/raw/master/banners/banners.json"
                    .to_string(),
            error_markers: vec![
                "Volatility experienced".to_string(),
                "vol.py: error:".to_string(),
                "vol: error:".to_string(),
            ],
        }
    }
}

impl Default for Vol2Config {
    fn default() -> Self {
        Self {
            image: "sp00kyskelet0n/volatility2".to_string(),
            error_markers: vec!["vol.py: error:".to_string()],
        }
    }
}

impl Config {
    /// Loads configuration from the config file.
    ///
    /// If the config file doesn't exist, returns default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be read or parsed.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// Loads configuration from an explicit path, falling back to defaults
    /// when the file is missing.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Saves the configuration to the config file.
    ///
    /// Creates the parent directory if it doesn't exist.
    pub fn save(&self) -> anyhow::Result<()> {
        let path = Self::config_path();

        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(&path, content)?;
        Ok(())
    }

    /// Returns the path to the configuration file.
    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }

    /// Generates a string containing the default configuration.
    pub fn generate_default_config() -> String {
        let config = Config::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }

    pub fn database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| self.storage_dir.join("scans.db"))
    }

    pub fn outputs_dir(&self) -> PathBuf {
        self.storage_dir.join("outputs")
    }

    pub fn symbols_dir(&self) -> PathBuf {
        self.paths
            .symbols
            .clone()
            .unwrap_or_else(|| self.storage_dir.join("volatility3_symbols"))
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.paths
            .cache
            .clone()
            .unwrap_or_else(|| self.storage_dir.join("volatility3_cache"))
    }

    pub fn plugins_dir(&self) -> PathBuf {
        self.paths
            .plugins
            .clone()
            .unwrap_or_else(|| self.storage_dir.join("volatility3_plugins"))
    }

    pub fn profiles_dir(&self) -> PathBuf {
        self.paths
            .profiles
            .clone()
            .unwrap_or_else(|| self.storage_dir.join("volatility2_profiles"))
    }

    /// Effective pool ceiling, never below one.
    pub fn parallelism(&self) -> usize {
        self.max_parallelism.unwrap_or_else(num_cpus::get).max(1)
    }

    pub fn stale_after(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.stale_after_minutes as i64)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn default_image(&self, variant: ToolVariant) -> &str {
        match variant {
            ToolVariant::Vol2 => &self.vol2.image,
            ToolVariant::Vol3 => &self.vol3.image,
        }
    }

    pub fn error_markers(&self, variant: ToolVariant) -> &[String] {
        match variant {
            ToolVariant::Vol2 => &self.vol2.error_markers,
            ToolVariant::Vol3 => &self.vol3.error_markers,
        }
    }

    /// Module that must finish before the pool starts, if any.
    pub fn priority_module(&self, variant: ToolVariant, os: TargetOs) -> Option<&str> {
        match (variant, os) {
            (ToolVariant::Vol2, _) => None,
            (ToolVariant::Vol3, TargetOs::Windows) => self.vol3.windows_priority_module.as_deref(),
            (ToolVariant::Vol3, TargetOs::Linux) => self.vol3.linux_priority_module.as_deref(),
        }
    }

    /// Creates the storage layout the engine and the containers rely on.
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [
            self.storage_dir.clone(),
            self.outputs_dir(),
            self.symbols_dir(),
            self.cache_dir(),
            self.plugins_dir(),
            self.profiles_dir(),
        ] {
            fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    /// Configuration rooted in a scratch directory, for tests.
    #[cfg(test)]
    pub(crate) fn for_storage(dir: &Path) -> Self {
        Self {
            storage_dir: dir.to_path_buf(),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = Config::default();

        assert_eq!(config.stale_after_minutes, 60);
        assert_eq!(config.docker_binary, "docker");
        assert_eq!(config.vol3.banner_lines, 2);
        assert!(config.tty);
        assert!(config.parallelism() >= 1);
        assert_eq!(config.vol3.error_markers.len(), 3);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            max_parallelism = 3
            [vol3]
            banner_lines = 4
            "#,
        )
        .unwrap();

        assert_eq!(config.parallelism(), 3);
        assert_eq!(config.vol3.banner_lines, 4);
        assert_eq!(config.vol3.image, "sp00kyskelet0n/volatility3");
        assert_eq!(config.vol2.image, "sp00kyskelet0n/volatility2");
    }

    #[test]
    fn test_zero_parallelism_is_clamped() {
        let config = Config {
            max_parallelism: Some(0),
            ..Config::default()
        };
        assert_eq!(config.parallelism(), 1);
    }

    #[test]
    fn test_derived_paths_follow_storage_dir() {
        let config = Config::for_storage(Path::new("/srv/mv"));
        assert_eq!(config.database_path(), PathBuf::from("/srv/mv/scans.db"));
        assert_eq!(config.outputs_dir(), PathBuf::from("/srv/mv/outputs"));
        assert_eq!(
            config.symbols_dir(),
            PathBuf::from("/srv/mv/volatility3_symbols")
        );
    }

    #[test]
    fn test_priority_module_per_variant() {
        let config = Config::default();
        assert_eq!(
            config.priority_module(ToolVariant::Vol3, TargetOs::Windows),
            Some("windows.info.Info")
        );
        assert_eq!(
            config.priority_module(ToolVariant::Vol3, TargetOs::Linux),
            Some("linux.bash.Bash")
        );
        assert_eq!(config.priority_module(ToolVariant::Vol2, TargetOs::Windows), None);
    }

    #[test]
    fn test_load_from_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.stale_after_minutes, 60);
    }
}

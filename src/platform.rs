//! Platform-specific locations.
//!
//! All functions fall back to a relative or temporary path instead of
//! failing when the platform directory can't be determined.

use std::path::PathBuf;

const APP_DIR: &str = "multivol";

/// Environment variable naming the host-side path of the working directory
/// when multivol itself runs inside a container next to the Docker socket.
pub const HOST_PATH_ENV: &str = "HOST_PATH";

/// Default storage root for the database and scan outputs.
///
/// - Linux: `~/.local/share/multivol/`
/// - macOS: `~/Library/Application Support/multivol/`
/// - Windows: `%APPDATA%\multivol\`
pub fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

/// Directory holding `config.toml`.
pub fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

/// Host path override from [`HOST_PATH_ENV`], if set and non-empty.
pub fn env_host_path() -> Option<PathBuf> {
    std::env::var_os(HOST_PATH_ENV)
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dirs_end_with_app_name() {
        assert!(data_dir().ends_with(APP_DIR));
        assert!(config_dir().ends_with(APP_DIR));
    }
}

//! Settings file discovery and loading.
//!
//! Default location: $XDG_CONFIG_HOME/apiconn/apiconn.toml
//! Fallback: the platform config directory (e.g. ~/.config/apiconn/apiconn.toml)

use std::io;
use std::path::{Path, PathBuf};

use log::debug;

use super::Settings;
use crate::error::{CacheError, CacheResult};

const APP_DIR: &str = "apiconn";
const FILE_NAME: &str = "apiconn.toml";

/// Returns the path of the default settings file.
///
/// The path is determined by:
/// 1. If $XDG_CONFIG_HOME is set: $XDG_CONFIG_HOME/apiconn/apiconn.toml
/// 2. Otherwise: `dirs::config_dir()`/apiconn/apiconn.toml
///
/// Returns None if no config directory can be determined.
pub fn default_config_path() -> Option<PathBuf> {
    if let Ok(xdg_config) = std::env::var("XDG_CONFIG_HOME")
        && !xdg_config.is_empty()
    {
        return Some(PathBuf::from(xdg_config).join(APP_DIR).join(FILE_NAME));
    }

    dirs::config_dir().map(|dir| dir.join(APP_DIR).join(FILE_NAME))
}

/// Load settings from `path`.
///
/// A missing file yields the default settings; an unreadable or invalid one
/// is an error.
pub fn load_settings(path: &Path) -> CacheResult<Settings> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!(
                target: "apiconn::config",
                "No settings at {}, using defaults",
                path.display()
            );
            return Ok(Settings::default());
        }
        Err(e) => return Err(e.into()),
    };

    Settings::from_toml_str(&text).map_err(|e| match e {
        CacheError::Config { message } => {
            CacheError::config(format!("{}: {message}", path.display()))
        }
        other => other,
    })
}

//! Configuration management

use std::env;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::constants::APP_DIR_NAME;

/// Daemon configuration, as edited by the user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Local directories mirrored to the drive.
    pub sync_dirs: Vec<SyncDir>,
    /// Remote prefix every mirror lives under; empty means the drive root.
    #[serde(default)]
    pub remote_root: String,
    #[serde(default)]
    pub sync: SyncTuning,
}

/// One watched directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncDir {
    pub source_path: PathBuf,
}

/// Engine tuning knobs; the defaults match the documented behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncTuning {
    pub debounce_ms: u64,
    pub max_retries: i64,
}

impl Default for SyncTuning {
    fn default() -> Self {
        Self {
            debounce_ms: crate::constants::DEBOUNCE_MS,
            max_retries: crate::constants::MAX_RETRIES,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self { sync_dirs: Vec::new(), remote_root: String::new(), sync: SyncTuning::default() }
    }
}

/// State directory: `$XDG_STATE_HOME/proton-drive-sync`, falling back to
/// `~/.local/state/proton-drive-sync`.
pub fn state_dir() -> PathBuf {
    xdg_dir("XDG_STATE_HOME", ".local/state")
}

/// Config directory: `$XDG_CONFIG_HOME/proton-drive-sync`, falling back to
/// `~/.config/proton-drive-sync`.
pub fn config_dir() -> PathBuf {
    xdg_dir("XDG_CONFIG_HOME", ".config")
}

fn xdg_dir(var: &str, home_fallback: &str) -> PathBuf {
    let base = env::var_os(var)
        .map(PathBuf::from)
        .filter(|p| p.is_absolute())
        .unwrap_or_else(|| {
            let home = env::var_os("HOME").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."));
            home.join(home_fallback)
        });
    base.join(APP_DIR_NAME)
}

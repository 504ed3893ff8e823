//! Configuration loader
//!
//! Loads the daemon configuration from the user's config directory.
//!
//! ## Loading Strategy
//! 1. `$PDSYNC_CONFIG`, when set, names the config file directly
//! 2. Otherwise the config directory is probed for `config.toml` /
//!    `config.json`
//! 3. Format is detected by file extension
//!
//! The config file is user-edited; a reload travels through the
//! refresh-dashboard collaborator pathway rather than a file watch.

use std::path::{Path, PathBuf};

use pdsync_domain::{config_dir, Config, Result, SyncError};

const CONFIG_ENV_VAR: &str = "PDSYNC_CONFIG";

/// Load configuration from the standard locations.
///
/// # Errors
/// Returns `SyncError::Config` if no config file exists, or the file cannot
/// be read or parsed.
pub fn load() -> Result<Config> {
    if let Some(path) = std::env::var_os(CONFIG_ENV_VAR) {
        return load_from_file(Some(PathBuf::from(path)));
    }
    load_from_file(None)
}

/// Load configuration from a file, probing the config directory when `path`
/// is `None`.
pub fn load_from_file(path: Option<PathBuf>) -> Result<Config> {
    let config_path = match path {
        Some(p) => {
            if !p.exists() {
                return Err(SyncError::Config(format!("config file not found: {}", p.display())));
            }
            p
        }
        None => probe_config_paths().ok_or_else(|| {
            SyncError::Config(format!(
                "no config file found under {}",
                config_dir().display()
            ))
        })?,
    };

    tracing::info!(path = %config_path.display(), "loading configuration");

    let contents = std::fs::read_to_string(&config_path)
        .map_err(|e| SyncError::Config(format!("failed to read config file: {e}")))?;

    parse_config(&contents, &config_path)
}

/// Parse configuration content; format is detected by file extension.
fn parse_config(contents: &str, path: &Path) -> Result<Config> {
    let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    let config: Config = match extension {
        "toml" => toml::from_str(contents)
            .map_err(|e| SyncError::Config(format!("invalid TOML config: {e}")))?,
        "json" => serde_json::from_str(contents)
            .map_err(|e| SyncError::Config(format!("invalid JSON config: {e}")))?,
        other => {
            return Err(SyncError::Config(format!("unsupported config format: {other}")));
        }
    };

    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.sync_dirs.is_empty() {
        return Err(SyncError::Config("config lists no sync_dirs".into()));
    }
    for dir in &config.sync_dirs {
        if !dir.source_path.is_absolute() {
            return Err(SyncError::Config(format!(
                "sync dir must be absolute: {}",
                dir.source_path.display()
            )));
        }
    }
    Ok(())
}

/// First existing candidate among the standard config file names.
pub fn probe_config_paths() -> Option<PathBuf> {
    let dir = config_dir();
    [dir.join("config.toml"), dir.join("config.json")]
        .into_iter()
        .find(|path| path.exists())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_toml_config() {
        let toml_content = r#"
remote_root = "backups"

[[sync_dirs]]
source_path = "/home/u/Documents"

[sync]
debounce_ms = 250
max_retries = 5
"#;
        let config = parse_config(toml_content, Path::new("config.toml")).unwrap();
        assert_eq!(config.sync_dirs.len(), 1);
        assert_eq!(config.remote_root, "backups");
        assert_eq!(config.sync.debounce_ms, 250);
        assert_eq!(config.sync.max_retries, 5);
    }

    #[test]
    fn parses_json_config_with_default_tuning() {
        let json_content = r#"{
            "sync_dirs": [{"source_path": "/home/u/Documents"}],
            "remote_root": ""
        }"#;
        let config = parse_config(json_content, Path::new("config.json")).unwrap();
        assert_eq!(config.sync.debounce_ms, 500);
        assert!(config.remote_root.is_empty());
    }

    #[test]
    fn rejects_empty_sync_dirs() {
        let err = parse_config("sync_dirs = []", Path::new("config.toml")).unwrap_err();
        assert!(matches!(err, SyncError::Config(_)));
    }

    #[test]
    fn rejects_relative_sync_dirs() {
        let toml_content = r#"
[[sync_dirs]]
source_path = "Documents"
"#;
        let err = parse_config(toml_content, Path::new("config.toml")).unwrap_err();
        assert!(matches!(err, SyncError::Config(_)));
    }

    #[test]
    fn rejects_unknown_extension() {
        let err = parse_config("{}", Path::new("config.yaml")).unwrap_err();
        assert!(matches!(err, SyncError::Config(_)));
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let err = load_from_file(Some(PathBuf::from("/nonexistent/config.toml"))).unwrap_err();
        assert!(matches!(err, SyncError::Config(_)));
    }
}

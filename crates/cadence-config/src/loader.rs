use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::Config;

/// Resolve a configured path, expanding ~ to the home directory.
pub fn resolve_path(path: &str) -> PathBuf {
    if path.starts_with("~/") || path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home.join(path.strip_prefix("~/").unwrap_or(""));
        }
    }
    PathBuf::from(path)
}

/// Find the config file by searching standard locations.
pub fn find_config_path() -> PathBuf {
    // 1. Current directory
    let local = Path::new("cadence.json");
    if local.exists() {
        return local.to_path_buf();
    }

    // 2. ~/.cadence/config.json
    if let Some(home) = dirs::home_dir() {
        let home_config = home.join(".cadence").join("config.json");
        if home_config.exists() {
            return home_config;
        }
    }

    // Default: ~/.cadence/config.json (will use defaults if missing)
    dirs::home_dir()
        .map(|h| h.join(".cadence").join("config.json"))
        .unwrap_or_else(|| PathBuf::from("cadence.json"))
}

/// Parse configuration from a JSON file without validating it.
///
/// A missing file yields the defaults. Callers that patch the result
/// (command-line overrides) must call [`Config::validate`] themselves.
pub fn read_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config '{}'", path.display()))?;
    serde_json::from_str::<Config>(&contents)
        .with_context(|| format!("failed to parse config '{}'", path.display()))
}

/// Load and validate configuration from a JSON file.
///
/// A missing file yields the defaults. Invalid values are a startup error.
pub fn load_config(path: &Path) -> Result<Config> {
    let config = read_config(path)?;
    config
        .validate()
        .with_context(|| format!("config '{}' rejected", path.display()))?;
    Ok(config)
}

/// Save configuration to a JSON file.
pub fn save_config(path: &Path, config: &Config) -> Result<()> {
    let contents = serde_json::to_string_pretty(config)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).with_context(|| {
            format!(
                "failed to create config directory '{}'",
                parent.to_string_lossy()
            )
        })?;
    }
    std::fs::write(path, contents)
        .with_context(|| format!("failed to write config '{}'", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = load_config(&dir.path().join("nope.json")).unwrap();
        assert_eq!(cfg.scheduler.interval_secs, 300);
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/config.json");
        let mut cfg = Config::default();
        cfg.scheduler.interval_secs = 42;
        save_config(&path, &cfg).unwrap();

        let loaded = load_config(&path).unwrap();
        assert_eq!(loaded.scheduler.interval_secs, 42);
    }

    #[test]
    fn invalid_values_fail_startup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"scheduler":{"intervalSecs":0}}"#).unwrap();
        let err = load_config(&path).unwrap_err();
        assert!(format!("{err:#}").contains("intervalSecs"));
    }

    #[test]
    fn invalid_file_can_be_patched_before_validation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"scheduler":{"intervalSecs":0}}"#).unwrap();

        let mut cfg = read_config(&path).unwrap();
        assert!(cfg.validate().is_err());
        cfg.scheduler.interval_secs = 30;
        cfg.validate().unwrap();
    }

    #[test]
    fn tilde_is_expanded() {
        let resolved = resolve_path("~/data");
        if let Some(home) = dirs::home_dir() {
            assert_eq!(resolved, home.join("data"));
        }
        assert_eq!(resolve_path("/tmp/x"), PathBuf::from("/tmp/x"));
    }
}

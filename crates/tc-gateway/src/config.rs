use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use tc_types::config::TcConfig;

/// Environment variable that relocates the teleclaude home directory.
pub const HOME_ENV: &str = "TELECLAUDE_HOME";

/// Returns the teleclaude home directory (`$TELECLAUDE_HOME` or ~/.teleclaude/).
pub fn tc_home() -> Result<PathBuf> {
    if let Some(dir) = std::env::var_os(HOME_ENV).filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir));
    }
    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".teleclaude"))
}

/// Returns the path to the config file (~/.teleclaude/config.toml)
pub fn config_path() -> Result<PathBuf> {
    Ok(tc_home()?.join("config.toml"))
}

/// Directory holding session records: the configured data dir, or the home dir.
pub fn data_dir(config: &TcConfig) -> Result<PathBuf> {
    match &config.storage.data_dir {
        Some(dir) => Ok(dir.clone()),
        None => tc_home(),
    }
}

/// Load config from `path`, writing the defaults there first if it is missing.
pub fn load_config_from(path: &Path) -> Result<TcConfig> {
    if !path.exists() {
        let default = TcConfig::default();
        save_config_to(&default, path)?;
        return Ok(default);
    }

    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config from {}", path.display()))?;
    let config: TcConfig = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse config at {}", path.display()))?;
    Ok(config)
}

pub fn save_config_to(config: &TcConfig, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let toml_str = toml::to_string_pretty(config).context("Failed to serialize config")?;
    std::fs::write(path, toml_str)
        .with_context(|| format!("Failed to write config to {}", path.display()))?;
    Ok(())
}

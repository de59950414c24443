//! Configuration file location

use anyhow::{Context, Result};
use gbp_mapping::Config;
use std::fs;
use std::path::{Path, PathBuf};

/// Explicit path if given, else `~/.gbp/config.toml`
pub fn config_path(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }
    let home = dirs::home_dir().context("cannot find home directory")?;
    Ok(home.join(".gbp").join("config.toml"))
}

pub fn load(path: &Path) -> Result<Config> {
    Config::load(path).with_context(|| format!("loading {}", path.display()))
}

pub fn save(config: &Config, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    fs::write(path, config.to_toml()?).with_context(|| format!("writing {}", path.display()))
}

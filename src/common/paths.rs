//! Centralized path defaults for snapresize.
//! A root process uses system locations, anyone else gets per-user ones so
//! the CLI stays usable for inspection without privileges.

use anyhow::{Context, Result};
use std::path::PathBuf;

fn running_as_root() -> bool {
    nix::unistd::geteuid().is_root()
}

/// Directory the config file lives in
pub fn config_dir() -> Result<PathBuf> {
    if running_as_root() {
        return Ok(PathBuf::from("/etc/snapresize"));
    }
    Ok(dirs::config_dir()
        .context("Unable to determine user config directory")?
        .join("snapresize"))
}

/// Default config file path
pub fn default_config_path() -> Result<PathBuf> {
    Ok(config_dir()?.join("config.toml"))
}

/// Default directory for job output files and cleanup markers
pub fn default_work_dir() -> PathBuf {
    if running_as_root() {
        return PathBuf::from("/var/lib/snapresize");
    }
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("~/.local/share"))
        .join("snapresize")
}

/// Default root of the snapshot image tree
pub fn default_image_root() -> PathBuf {
    PathBuf::from("/var/lib/snapresize/images")
}

/// Make sure a directory exists, with a readable error if it can't be created
pub fn ensure_dir(dir: &std::path::Path) -> Result<()> {
    std::fs::create_dir_all(dir).with_context(|| format!("creating directory {}", dir.display()))
}

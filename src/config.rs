use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::common::{paths, shell};

/// Three days, matching how long a large NTFS relocation can legitimately take.
pub const DEFAULT_TOOL_TIMEOUT_SECS: u64 = 3 * 24 * 60 * 60;

fn default_tool_timeout_secs() -> u64 {
    DEFAULT_TOOL_TIMEOUT_SECS
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ResizeConfig {
    /// Root of the snapshot image tree: `<image_root>/<agent>/<epoch>/<guid>[.<ext>]`
    pub image_root: PathBuf,
    /// Job output files and cleanup markers
    pub work_dir: PathBuf,
    /// Background job records, defaults to `<work_dir>/jobs`
    pub jobs_dir: Option<PathBuf>,
    /// Snapshot metadata tree, defaults to `image_root`
    pub metadata_root: Option<PathBuf>,
    /// Command line for the privileged helper, defaults to this executable
    pub helper_command: Option<String>,
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
    /// Optional JSON-lines event log
    pub log_file: Option<PathBuf>,
}

impl Default for ResizeConfig {
    fn default() -> Self {
        Self {
            image_root: paths::default_image_root(),
            work_dir: paths::default_work_dir(),
            jobs_dir: None,
            metadata_root: None,
            helper_command: None,
            tool_timeout_secs: default_tool_timeout_secs(),
            log_file: None,
        }
    }
}

fn expand(path: &Path) -> PathBuf {
    PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).into_owned())
}

impl ResizeConfig {
    /// Load from `path`, or the default location. A missing file yields defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => paths::default_config_path()?,
        };
        if !path.exists() {
            return Ok(Self::default().expanded());
        }
        let s = fs::read_to_string(&path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_toml(&s).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn from_toml(s: &str) -> Result<Self> {
        let c: ResizeConfig = toml::from_str(s).context("parsing config toml")?;
        Ok(c.expanded())
    }

    fn expanded(mut self) -> Self {
        self.image_root = expand(&self.image_root);
        self.work_dir = expand(&self.work_dir);
        self.jobs_dir = self.jobs_dir.as_deref().map(expand);
        self.metadata_root = self.metadata_root.as_deref().map(expand);
        self.log_file = self.log_file.as_deref().map(expand);
        self
    }

    pub fn jobs_dir(&self) -> PathBuf {
        self.jobs_dir
            .clone()
            .unwrap_or_else(|| self.work_dir.join("jobs"))
    }

    pub fn metadata_root(&self) -> PathBuf {
        self.metadata_root
            .clone()
            .unwrap_or_else(|| self.image_root.clone())
    }

    pub fn tool_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.tool_timeout_secs)
    }

    /// Program and leading arguments used to invoke the helper subcommands.
    pub fn helper_invocation(&self) -> Result<(String, Vec<String>)> {
        let line = self
            .helper_command
            .clone()
            .unwrap_or_else(shell::current_exe_command);
        shell::split_command(&line).context("parsing helper_command")
    }
}

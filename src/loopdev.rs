//! Loop device operations (losetup).

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::process::ProcessRunner;
use crate::ui::prelude::*;

/// A loop device bound to a backing image file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopBinding {
    pub device: PathBuf,
    pub backing_file: PathBuf,
}

impl LoopBinding {
    pub fn new(device: impl Into<PathBuf>, backing_file: impl Into<PathBuf>) -> Self {
        Self {
            device: device.into(),
            backing_file: backing_file.into(),
        }
    }

    /// Device node of the n-th partition, e.g. `/dev/loop7p1`. Only present
    /// when the binding was created with partition scanning.
    pub fn partition(&self, number: u32) -> PathBuf {
        let mut s = self.device.as_os_str().to_os_string();
        s.push(format!("p{number}"));
        PathBuf::from(s)
    }
}

pub trait LoopManager: Send + Sync {
    /// First existing binding for `file`, if any.
    fn find(&self, file: &Path) -> Result<Option<LoopBinding>>;

    /// Bind a new loop device to `file`. With `scan_partitions` the kernel
    /// creates `pN` nodes for the image's partition table (`losetup -P`).
    fn create(&self, file: &Path, scan_partitions: bool) -> Result<LoopBinding>;

    fn destroy(&self, binding: &LoopBinding) -> Result<()>;
}

/// `LoopManager` that shells out to losetup through a `ProcessRunner`, so
/// loop operations share the runner's timeout and logging.
#[derive(Clone)]
pub struct Losetup {
    runner: Arc<dyn ProcessRunner>,
}

impl Losetup {
    pub fn new(runner: Arc<dyn ProcessRunner>) -> Self {
        Self { runner }
    }

    fn path_arg(path: &Path) -> Result<String> {
        path.to_str()
            .map(str::to_string)
            .with_context(|| format!("Invalid path encoding: {}", path.display()))
    }

    /// Run `losetup` and return its stdout, failing on a non-zero exit.
    fn losetup(&self, args: Vec<String>) -> Result<String> {
        let output = self.runner.run("losetup", &args)?;
        if !output.success() {
            anyhow::bail!(
                "losetup exited with {:?}: {}",
                output.status,
                output.stderr.trim()
            );
        }
        Ok(output.stdout)
    }
}

impl LoopManager for Losetup {
    fn find(&self, file: &Path) -> Result<Option<LoopBinding>> {
        let stdout = self
            .losetup(vec![
                "--associated".to_string(),
                Self::path_arg(file)?,
                "--noheadings".to_string(),
                "--output".to_string(),
                "NAME".to_string(),
            ])
            .with_context(|| format!("Failed to query loop devices for {}", file.display()))?;

        Ok(parse_associated(&stdout).map(|device| LoopBinding::new(device, file)))
    }

    fn create(&self, file: &Path, scan_partitions: bool) -> Result<LoopBinding> {
        let mut args = vec!["--find".to_string(), "--show".to_string()];
        if scan_partitions {
            args.push("--partscan".to_string());
        }
        args.push(Self::path_arg(file)?);

        let stdout = self
            .losetup(args)
            .with_context(|| format!("losetup failed for {}", file.display()))?;
        let device = stdout.trim();
        if device.is_empty() {
            anyhow::bail!("losetup did not report a device for {}", file.display());
        }

        // Partition nodes are created asynchronously by udev
        if scan_partitions {
            let settled = self
                .runner
                .run("udevadm", &["settle".to_string()])
                .is_ok_and(|out| out.success());
            if !settled {
                emit(
                    Level::Warn,
                    "loop.udev_settle_failed",
                    "udevadm settle failed; partition nodes may appear late",
                    None,
                );
            }
        }

        Ok(LoopBinding::new(device, file))
    }

    fn destroy(&self, binding: &LoopBinding) -> Result<()> {
        let device = Self::path_arg(&binding.device)?;
        self.losetup(vec!["--detach".to_string(), device.clone()])
            .with_context(|| format!("Failed to detach {device}"))?;
        Ok(())
    }
}

/// First device name from `losetup --associated ... --noheadings --output NAME`
pub fn parse_associated(output: &str) -> Option<PathBuf> {
    output
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(PathBuf::from)
}

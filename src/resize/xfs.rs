//! XFS cannot be shrunk. The minimum size is the current size and the resize
//! operations refuse to run.

use super::base::{ResizerBase, device_size};
use super::factory::FilesystemType;
use super::job::JobKind;
use super::progress::{MinimumSizeProgress, ResizeProgress, parse_helper_output};
use super::Resizer;
use crate::error::{ResizeError, Result};
use crate::ui::prelude::*;

pub struct XfsResizer {
    base: ResizerBase,
}

impl XfsResizer {
    pub fn new(base: ResizerBase) -> Self {
        Self { base }
    }

    fn unsupported(operation: &'static str) -> ResizeError {
        emit(
            Level::Error,
            "resize.xfs.unsupported",
            &format!("{operation} called on an XFS volume"),
            None,
        );
        ResizeError::Unsupported {
            filesystem: "xfs",
            operation,
        }
    }
}

impl Resizer for XfsResizer {
    fn filesystem(&self) -> FilesystemType {
        FilesystemType::Xfs
    }

    fn base(&self) -> &ResizerBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ResizerBase {
        &mut self.base
    }

    fn can_resize(&mut self) -> Result<bool> {
        Ok(false)
    }

    fn calculate_minimum_size(&mut self) -> Result<u64> {
        self.base
            .with_loop(|base, device| device_size(base.runner(), device))
    }

    fn resize_safety_run(&mut self, _target_bytes: u64) -> Result<bool> {
        Ok(true)
    }

    fn resize_to_size(&mut self, _target_bytes: u64) -> Result<bool> {
        Err(Self::unsupported("resize"))
    }

    fn generate_progress(&mut self) -> Result<ResizeProgress> {
        Err(Self::unsupported("resize progress"))
    }

    fn calculate_minimum_size_start(&mut self) -> Result<bool> {
        self.base.start_helper("xfs", |_, _| Ok(Vec::new()))
    }

    fn calculate_minimum_size_progress(&mut self) -> Result<MinimumSizeProgress> {
        let running = self.base.is_running(JobKind::MinimumSize)?;
        let (stdout, stderr) = self.base.read_output(JobKind::MinimumSize)?;
        let outcome = parse_helper_output(stdout.as_deref(), running);
        Ok(MinimumSizeProgress::new(running, outcome, stderr))
    }
}

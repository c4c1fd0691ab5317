//! Filesystem resize engine
//!
//! Each supported filesystem family implements [`Resizer`] on top of a shared
//! [`base::ResizerBase`]. Long operations run as detached background jobs;
//! their state is rebuilt from output files on every poll.

pub mod base;
pub mod ext;
pub mod factory;
pub mod job;
pub mod ntfs;
pub mod progress;
pub mod xfs;

use crate::error::Result;

pub use base::{ResizeServices, ResizerBase};
pub use factory::{FilesystemType, ResizerFactory};
pub use job::{JobIdentity, JobKind};
pub use progress::{CalculationStage, MinimumSizeProgress, ResizeProgress};

pub trait Resizer: Send {
    fn filesystem(&self) -> FilesystemType;

    fn base(&self) -> &ResizerBase;

    fn base_mut(&mut self) -> &mut ResizerBase;

    /// Whether the filesystem is healthy enough to be shrunk at all.
    fn can_resize(&mut self) -> Result<bool>;

    /// Smallest size in bytes the volume can be shrunk to. Blocks for as long
    /// as the tools take; prefer the `calculate_minimum_size_start` flow.
    fn calculate_minimum_size(&mut self) -> Result<u64>;

    /// Dry run of a resize to `target_bytes`. Tool failure is `Ok(false)`.
    fn resize_safety_run(&mut self, target_bytes: u64) -> Result<bool>;

    /// Start shrinking the volume to `target_bytes` in the background.
    /// Returns whether the job was launched.
    fn resize_to_size(&mut self, target_bytes: u64) -> Result<bool>;

    /// Poll the resize job started by `resize_to_size`. Once the job has
    /// stopped, the loop binding it used is released.
    fn generate_progress(&mut self) -> Result<ResizeProgress>;

    /// Start the background minimum-size calculation.
    fn calculate_minimum_size_start(&mut self) -> Result<bool>;

    fn calculate_minimum_size_progress(&mut self) -> Result<MinimumSizeProgress>;

    /// Kill a running resize job. No rollback is attempted.
    fn stop_resize(&mut self) -> Result<()> {
        self.base().kill(JobKind::Resize)
    }

    fn stop_minimum_size_calculation(&mut self) -> Result<()> {
        self.base().kill(JobKind::MinimumSize)
    }
}

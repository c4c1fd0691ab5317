//! Shrinks snapshot volume images in place.
//!
//! Images are bound to loop devices and shrunk with the filesystem's own
//! tools (e2fsprogs, ntfsresize). Long operations run as detached jobs whose
//! progress is read back from their output files.

pub mod common;
pub mod config;
pub mod error;
pub mod helper;
pub mod jobs;
pub mod loopdev;
pub mod metadata;
pub mod process;
pub mod resize;
pub mod ui;

#[cfg(test)]
mod testing;

pub use error::{ResizeError, Result};

//! The `asset:snapshot:<fs>:calcminsize` helper subcommands.
//!
//! Helpers print a fixed-format report on stdout that the minimum-size
//! pollers parse back. Everything else (logs, diagnostics) goes to stderr.

use anyhow::{Context, Result};
use clap::{Args, ValueEnum};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::ResizeError;
use crate::loopdev::{LoopBinding, LoopManager};
use crate::process::ProcessRunner;
use crate::resize::base::{device_size, stat_block_size};
use crate::resize::ext::ExtTools;
use crate::resize::ntfs::{NtfsEstimate, NtfsTools, describe_event, search_minimum_size};
use crate::resize::progress::{SizeReport, markers};
use crate::ui::prelude::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum HelperMode {
    /// Report ntfsresize's own estimate only
    Estimated,
    /// Run the dry-run search starting from a known estimate
    Precise,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelperFilesystem {
    Ext,
    Ntfs,
    Xfs,
}

#[derive(Args, Debug, Clone, Default)]
pub struct HelperArgs {
    /// Partition device to inspect
    #[arg(long)]
    pub path: PathBuf,
    /// Volume image to bind to a fresh loop device instead of using --path
    #[arg(long)]
    pub image: Option<PathBuf>,
    /// NTFS only; both phases run when omitted
    #[arg(long, value_enum)]
    pub mode: Option<HelperMode>,
    #[arg(long, required_if_eq("mode", "precise"))]
    pub recommended_min: Option<u64>,
    #[arg(long, required_if_eq("mode", "precise"))]
    pub cluster_size: Option<u64>,
    #[arg(long, required_if_eq("mode", "precise"))]
    pub original_size: Option<u64>,
}

impl HelperArgs {
    fn precise_estimate(&self) -> Result<NtfsEstimate> {
        Ok(NtfsEstimate {
            recommended_min: self
                .recommended_min
                .context("--recommended-min is required in precise mode")?,
            cluster_size: self
                .cluster_size
                .context("--cluster-size is required in precise mode")?,
            original_size: self
                .original_size
                .context("--original-size is required in precise mode")?,
        })
    }
}

pub struct Helper<'a> {
    runner: &'a dyn ProcessRunner,
    loops: &'a dyn LoopManager,
}

impl<'a> Helper<'a> {
    pub fn new(runner: &'a dyn ProcessRunner, loops: &'a dyn LoopManager) -> Self {
        Self { runner, loops }
    }

    /// Run one helper and return its exit code. Only failing to write the
    /// report or to bind the image is an `Err`.
    pub fn run(&self, filesystem: HelperFilesystem, args: &HelperArgs, out: &mut dyn Write) -> Result<i32> {
        let binding = match &args.image {
            Some(image) => Some(self.bind(image)?),
            None => None,
        };
        let device = binding
            .as_ref()
            .map_or_else(|| args.path.clone(), |b| b.partition(1));

        let result = match filesystem {
            HelperFilesystem::Ext => self.ext(&device, out),
            HelperFilesystem::Xfs => self.xfs(&device, out),
            HelperFilesystem::Ntfs => self.ntfs(&device, args, out),
        };

        if let Some(binding) = binding
            && let Err(e) = self.loops.destroy(&binding)
        {
            emit(
                Level::Warn,
                "helper.loop.teardown_failed",
                &format!("Could not detach {}: {e:#}", binding.device.display()),
                None,
            );
        }
        result
    }

    /// Always a new binding; one found for the image belongs to someone else.
    fn bind(&self, image: &Path) -> Result<LoopBinding> {
        let binding = self
            .loops
            .create(image, true)
            .with_context(|| format!("binding {}", image.display()))?;
        emit(
            Level::Debug,
            "helper.loop.created",
            &format!("Bound {} to {}", image.display(), binding.device.display()),
            None,
        );
        Ok(binding)
    }

    fn ext(&self, device: &Path, out: &mut dyn Write) -> Result<i32> {
        match ExtTools::new(self.runner).minimum_size(device) {
            Ok(report) => finish(out, &report.render(markers::SUCCESS), 0),
            Err(e) => {
                report_failure(&e);
                let line = match e {
                    ResizeError::CannotResize(_) => e.to_string(),
                    other => format!("Filesystem cannot be resized: {other}"),
                };
                finish(out, &format!("{line}\n"), 1)
            }
        }
    }

    fn xfs(&self, device: &Path, out: &mut dyn Write) -> Result<i32> {
        let sizes = device_size(self.runner, device).and_then(|current| {
            Ok(SizeReport {
                current,
                minimum: current,
                cluster: stat_block_size(self.runner, device)?,
            })
        });
        match sizes {
            Ok(report) => finish(out, &report.render(markers::SUCCESS), 0),
            Err(e) => {
                report_failure(&e);
                finish(out, &format!("Filesystem cannot be resized: {e}\n"), 1)
            }
        }
    }

    fn ntfs(&self, device: &Path, args: &HelperArgs, out: &mut dyn Write) -> Result<i32> {
        let tools = NtfsTools::new(self.runner);
        let estimate = match args.mode {
            Some(HelperMode::Precise) => args.precise_estimate()?,
            Some(HelperMode::Estimated) | None => match tools.info(device) {
                Ok(estimate) => estimate,
                Err(e) => {
                    report_failure(&e);
                    return match e {
                        ResizeError::CannotResize(_) => finish(out, &format!("{e}\n"), 1),
                        _ => Ok(1),
                    };
                }
            },
        };

        if args.mode == Some(HelperMode::Estimated) {
            return finish(out, &estimate.report().render(markers::ESTIMATED), 0);
        }

        writeln!(out, "Current volume size: {} bytes", estimate.original_size)?;
        writeln!(out, "Cluster size: {} bytes", estimate.cluster_size)?;
        out.flush()?;

        let mut write_error = None;
        let searched = search_minimum_size(
            &estimate,
            |size| tools.safety_run(device, size),
            |event| {
                let written = writeln!(out, "{}", describe_event(event)).and_then(|_| out.flush());
                if let Err(e) = written
                    && write_error.is_none()
                {
                    write_error = Some(e);
                }
            },
        );
        if let Some(e) = write_error {
            return Err(e).context("writing helper output");
        }

        match searched {
            Ok(minimum) => {
                let report = SizeReport {
                    current: estimate.original_size,
                    minimum,
                    cluster: estimate.cluster_size,
                };
                finish(out, &report.render(markers::SUCCESS), 0)
            }
            Err(e) => {
                report_failure(&e);
                finish(out, &format!("{e}\n"), 1)
            }
        }
    }
}

fn finish(out: &mut dyn Write, text: &str, code: i32) -> Result<i32> {
    out.write_all(text.as_bytes())
        .and_then(|_| out.flush())
        .context("writing helper output")?;
    Ok(code)
}

fn report_failure(e: &ResizeError) {
    emit(
        Level::Error,
        "helper.failed",
        &e.to_string(),
        Some(serde_json::json!({ "code": e.code() })),
    );
}

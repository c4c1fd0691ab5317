//! NTFS resizing with ntfsresize.
//!
//! The estimate ntfsresize reports is not a safe shrink target on its own.
//! The minimum size is found by walking candidates upward from it in 5%
//! steps, accepting the first one a dry run agrees to.

use regex::Regex;
use std::path::Path;
use std::sync::LazyLock;

use super::base::{ResizerBase, ToolSite, run_checked, run_unchecked, size_from_output};
use super::factory::FilesystemType;
use super::job::JobKind;
use super::progress::{
    CalculationOutcome, CalculationStage, MinimumSizeProgress, ResizeProgress, STAGE_COMPLETE,
    SizeReport, markers,
};
use super::Resizer;
use crate::error::{ResizeError, Result};
use crate::process::ProcessRunner;
use crate::ui::prelude::*;

const INFO_SITE: ToolSite = ToolSite::new(1120, "resize.ntfs.info_failed");
const DRY_RUN_SITE: ToolSite = ToolSite::new(1121, "resize.ntfs.safety_run_failed");
const ESTIMATE_HELPER_SITE: ToolSite = ToolSite::new(1122, "resize.ntfs.estimate_helper_failed");

/// Candidates tried before giving up: 105% up to 195% of the estimate.
pub const SAFETY_SEARCH_ATTEMPTS: u32 = 19;

/// Bytes of output read when looking for the relocation percentage. The
/// tool rewrites that line in place with carriage returns.
const PROGRESS_TAIL_BYTES: u64 = 50;

pub const STAGE_CHECKING: &str = "Checking filesystem consistency";
pub const STAGE_RELOCATING: &str = "Relocating needed data";

static PERCENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d+(?:\.\d+)?) percent completed").expect("valid regex")
});

static CHECKING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Checking attempt (\d+) of (\d+) for size (\d+)").expect("valid regex")
});

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// What `ntfsresize --info` says about a volume, all in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NtfsEstimate {
    pub original_size: u64,
    pub cluster_size: u64,
    pub recommended_min: u64,
}

impl NtfsEstimate {
    pub fn parse(output: &str) -> Result<Self> {
        Ok(Self {
            original_size: size_from_output(output, r"Current volume size\s*:\s*(\d+) bytes")?,
            cluster_size: size_from_output(output, r"Cluster size\s*:\s*(\d+) bytes")?,
            recommended_min: size_from_output(output, r"You might resize at (\d+) bytes")?,
        })
    }

    pub fn report(&self) -> SizeReport {
        SizeReport {
            current: self.original_size,
            minimum: self.recommended_min,
            cluster: self.cluster_size,
        }
    }
}

/// `ceil(recommended_min * (1 + attempt/20) / cluster) * cluster`, in integers.
pub fn candidate_size(recommended_min: u64, cluster_size: u64, attempt: u32) -> u64 {
    let numerator = recommended_min as u128 * (20 + attempt as u128);
    let denominator = 20 * cluster_size as u128;
    let size = numerator.div_ceil(denominator) * cluster_size as u128;
    u64::try_from(size).unwrap_or(u64::MAX)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchEvent {
    Checking { attempt: u32, size: u64 },
    Accepted { attempt: u32, size: u64 },
}

/// Bounded linear search for the smallest candidate the dry run accepts.
///
/// A candidate beyond the current volume size ends the search: the volume
/// cannot be shrunk. `safety_run` is never called for such a candidate.
pub fn search_minimum_size(
    estimate: &NtfsEstimate,
    mut safety_run: impl FnMut(u64) -> bool,
    mut on_event: impl FnMut(SearchEvent),
) -> Result<u64> {
    if estimate.cluster_size == 0 {
        return Err(ResizeError::CannotResize(
            "ntfsresize reported a cluster size of 0".to_string(),
        ));
    }

    for attempt in 1..=SAFETY_SEARCH_ATTEMPTS {
        let size = candidate_size(estimate.recommended_min, estimate.cluster_size, attempt);
        if size > estimate.original_size {
            return Err(ResizeError::CannotResize(format!(
                "candidate size {size} exceeds the volume size {}",
                estimate.original_size
            )));
        }
        on_event(SearchEvent::Checking { attempt, size });
        if safety_run(size) {
            on_event(SearchEvent::Accepted { attempt, size });
            return Ok(size);
        }
    }

    Err(ResizeError::SearchExhausted {
        attempts: SAFETY_SEARCH_ATTEMPTS,
    })
}

/// Protocol lines the precise helper prints for each search event.
pub fn describe_event(event: SearchEvent) -> String {
    match event {
        SearchEvent::Checking { attempt, size } => format!(
            "{} {attempt} of {SAFETY_SEARCH_ATTEMPTS} for size {size}",
            markers::CHECKING_ATTEMPT
        ),
        SearchEvent::Accepted { attempt, size } => {
            format!("{} {attempt} with size {size}", markers::SUCCESS_ON_ATTEMPT)
        }
    }
}

/// Stage and percent of an `ntfsresize -f -b -s` run.
///
/// `output` is the whole stdout, `tail` only its last bytes, which is where
/// the live percentage is.
pub fn parse_resize_progress(output: &str, tail: &str) -> (Option<String>, Option<f64>) {
    let lower = output.to_lowercase();
    if lower.contains("nothing to do") || lower.contains("successfully resized") {
        return (Some(STAGE_COMPLETE.to_string()), Some(100.0));
    }

    let tail_percent = PERCENT_RE
        .captures_iter(tail)
        .last()
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok());

    if output.contains(STAGE_RELOCATING) {
        // No percentage in the tail means relocation is over
        return (
            Some(STAGE_RELOCATING.to_string()),
            Some(tail_percent.unwrap_or(100.0)),
        );
    }

    if output.contains(STAGE_CHECKING) {
        return (Some(STAGE_CHECKING.to_string()), tail_percent);
    }

    (None, None)
}

/// Parse the precise helper's output.
///
/// Unlike the single-shot helpers, output without any recognizable marker
/// counts as failed once this phase has been launched.
pub fn parse_precise_output(stdout: Option<&str>, running: bool) -> CalculationOutcome {
    let Some(stdout) = stdout else {
        return if running {
            CalculationOutcome::at(CalculationStage::Running, 0.0)
        } else {
            CalculationOutcome::not_started()
        };
    };

    let known = SizeReport::parse_partial(stdout);
    let with_sizes = |stage, percent| CalculationOutcome {
        stage,
        percent,
        sizes: known,
    };

    if stdout.contains(markers::CANNOT_RESIZE) || stdout.contains(markers::UNABLE_TO_CALCULATE) {
        return with_sizes(CalculationStage::Failed, 0.0);
    }

    if stdout.contains(markers::SUCCESS)
        && let Some(sizes) = SizeReport::parse(stdout)
    {
        return CalculationOutcome {
            stage: CalculationStage::Complete,
            percent: 100.0,
            sizes,
        };
    }

    let stage = if running {
        CalculationStage::Running
    } else {
        CalculationStage::Failed
    };

    if stdout.contains(markers::SUCCESS_ON_ATTEMPT) {
        return with_sizes(stage, 100.0);
    }

    if let Some(caps) = CHECKING_RE.captures_iter(stdout).last() {
        let attempt: f64 = caps[1].parse().unwrap_or(0.0);
        let total: f64 = caps[2].parse().unwrap_or(0.0);
        let percent = if total > 0.0 { 100.0 * attempt / total } else { 0.0 };
        return with_sizes(stage, percent);
    }

    with_sizes(CalculationStage::Failed, 0.0)
}

/// ntfsresize invocations against one device.
pub struct NtfsTools<'a> {
    runner: &'a dyn ProcessRunner,
}

impl<'a> NtfsTools<'a> {
    pub fn new(runner: &'a dyn ProcessRunner) -> Self {
        Self { runner }
    }

    pub fn info(&self, device: &Path) -> Result<NtfsEstimate> {
        let out = run_checked(
            self.runner,
            INFO_SITE,
            "ntfsresize",
            &[
                "-i".to_string(),
                "-f".to_string(),
                "-b".to_string(),
                path_arg(device),
            ],
        )?;
        NtfsEstimate::parse(&out.stdout)
    }

    /// No-action resize to `size`. Any failure, including not being able to
    /// run the tool, is a plain `false`.
    pub fn safety_run(&self, device: &Path, size: u64) -> bool {
        let args = [
            "-n".to_string(),
            "-s".to_string(),
            size.to_string(),
            path_arg(device),
        ];
        match run_unchecked(self.runner, DRY_RUN_SITE, "ntfsresize", &args) {
            Ok(out) if out.success() => true,
            Ok(out) => {
                emit(
                    Level::Debug,
                    "resize.ntfs.safety_run_rejected",
                    &format!("Dry run at {size} bytes rejected (exit {:?})", out.status),
                    Some(serde_json::json!({ "stdout": out.stdout, "stderr": out.stderr })),
                );
                false
            }
            Err(_) => false,
        }
    }

    pub fn minimum_size(
        &self,
        device: &Path,
        on_event: impl FnMut(SearchEvent),
    ) -> Result<(NtfsEstimate, u64)> {
        let estimate = self.info(device)?;
        let minimum = search_minimum_size(&estimate, |size| self.safety_run(device, size), on_event)?;
        Ok((estimate, minimum))
    }
}

pub struct NtfsResizer {
    base: ResizerBase,
}

impl NtfsResizer {
    pub fn new(base: ResizerBase) -> Self {
        Self { base }
    }

    /// Phase one of the background calculation: ask the helper for the
    /// estimate while this process still holds the binding.
    fn estimate_with_helper(base: &ResizerBase, device: &Path) -> Result<SizeReport> {
        let out = base.run_helper(
            "ntfs",
            vec![
                "--path".to_string(),
                path_arg(device),
                "--mode".to_string(),
                "estimated".to_string(),
            ],
        )?;

        if let Some(line) = out
            .stdout
            .lines()
            .find(|l| l.contains(markers::CANNOT_RESIZE))
        {
            return Err(ResizeError::CannotResize(line.trim().to_string()));
        }

        match SizeReport::parse(&out.stdout) {
            Some(report) if out.success() && out.stdout.contains(markers::ESTIMATED) => Ok(report),
            _ => {
                emit(
                    Level::Error,
                    ESTIMATE_HELPER_SITE.event,
                    "Estimate helper gave no usable sizes",
                    Some(serde_json::json!({
                        "code": ESTIMATE_HELPER_SITE.code,
                        "status": out.status,
                        "stdout": out.stdout,
                        "stderr": out.stderr,
                    })),
                );
                Err(ResizeError::ToolFailed {
                    code: ESTIMATE_HELPER_SITE.code,
                    event: ESTIMATE_HELPER_SITE.event,
                    tool: "asset:snapshot:ntfs:calcminsize".to_string(),
                    status: out.status,
                    stderr: out.stderr.trim().to_string(),
                })
            }
        }
    }
}

impl Resizer for NtfsResizer {
    fn filesystem(&self) -> FilesystemType {
        FilesystemType::Ntfs
    }

    fn base(&self) -> &ResizerBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ResizerBase {
        &mut self.base
    }

    /// Resizable when ntfsresize can read the volume and the first candidate
    /// fits inside it.
    fn can_resize(&mut self) -> Result<bool> {
        self.base.with_loop(|base, device| {
            match NtfsTools::new(base.runner()).info(device) {
                Ok(estimate) => Ok(candidate_size(
                    estimate.recommended_min,
                    estimate.cluster_size,
                    1,
                ) <= estimate.original_size),
                Err(ResizeError::ToolFailed { .. } | ResizeError::Parse { .. }) => Ok(false),
                Err(e) => Err(e),
            }
        })
    }

    fn calculate_minimum_size(&mut self) -> Result<u64> {
        self.base.with_loop(|base, device| {
            let (estimate, minimum) = NtfsTools::new(base.runner()).minimum_size(device, |event| {
                emit(Level::Debug, "resize.ntfs.search", &describe_event(event), None);
            })?;
            emit(
                Level::Info,
                "resize.ntfs.min_size.calculated",
                &format!(
                    "Minimum size of {} is {minimum} bytes (estimate {})",
                    base.identity(),
                    estimate.recommended_min
                ),
                None,
            );
            Ok(minimum)
        })
    }

    fn resize_safety_run(&mut self, target_bytes: u64) -> Result<bool> {
        self.base.with_loop(|base, device| {
            Ok(NtfsTools::new(base.runner()).safety_run(device, target_bytes))
        })
    }

    fn resize_to_size(&mut self, target_bytes: u64) -> Result<bool> {
        self.base.start_job(JobKind::Resize, |_, device| {
            Ok((
                "ntfsresize".to_string(),
                vec![
                    "-f".to_string(),
                    "-b".to_string(),
                    "-s".to_string(),
                    target_bytes.to_string(),
                    path_arg(device),
                ],
            ))
        })
    }

    fn generate_progress(&mut self) -> Result<ResizeProgress> {
        let running = self.base.is_running(JobKind::Resize)?;
        let (stdout, stderr) = self.base.read_output(JobKind::Resize)?;
        let tail = self
            .base
            .read_stdout_tail(JobKind::Resize, PROGRESS_TAIL_BYTES)?
            .unwrap_or_default();
        let (stage, percent) = parse_resize_progress(stdout.as_deref().unwrap_or_default(), &tail);
        let progress = ResizeProgress::new(running, stage, percent, stderr);
        self.base.release_if_stopped(running)?;
        Ok(progress)
    }

    fn calculate_minimum_size_start(&mut self) -> Result<bool> {
        self.base.start_helper("ntfs", |base, device| {
            let estimate = Self::estimate_with_helper(base, device)?;
            emit(
                Level::Debug,
                "resize.ntfs.estimate",
                &format!(
                    "Estimated minimum for {} is {} bytes",
                    base.identity(),
                    estimate.minimum
                ),
                None,
            );
            Ok(vec![
                "--mode".to_string(),
                "precise".to_string(),
                "--recommended-min".to_string(),
                estimate.minimum.to_string(),
                "--cluster-size".to_string(),
                estimate.cluster.to_string(),
                "--original-size".to_string(),
                estimate.current.to_string(),
            ])
        })
    }

    fn calculate_minimum_size_progress(&mut self) -> Result<MinimumSizeProgress> {
        let running = self.base.is_running(JobKind::MinimumSize)?;
        let (stdout, stderr) = self.base.read_output(JobKind::MinimumSize)?;
        let outcome = parse_precise_output(stdout.as_deref(), running);
        Ok(MinimumSizeProgress::new(running, outcome, stderr))
    }
}

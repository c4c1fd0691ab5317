//! ext2/3/4 resizing with e2fsprogs

use regex::Regex;
use std::path::Path;
use std::sync::LazyLock;

use super::base::{
    ResizerBase, ToolSite, device_size, run_checked, run_unchecked, size_from_output,
    stat_block_size,
};
use super::factory::FilesystemType;
use super::job::JobKind;
use super::progress::{
    MinimumSizeProgress, ResizeProgress, STAGE_COMPLETE, SizeReport, parse_helper_output,
};
use super::Resizer;
use crate::error::{ResizeError, Result};
use crate::process::ProcessRunner;
use crate::ui::prelude::*;

const FSCK_SITE: ToolSite = ToolSite::new(1110, "resize.ext.fsck_failed");
const ESTIMATE_SITE: ToolSite = ToolSite::new(1111, "resize.ext.min_size.estimate_failed");
const DUMPE2FS_SITE: ToolSite = ToolSite::new(1112, "resize.ext.block_size_failed");

const ESTIMATE_PATTERN: &str = r"Estimated minimum size of the filesystem:\s*(\d+)";

/// Width of the progress bar resize2fs draws for each pass
const PASS_WIDTH: usize = 40;

/// resize2fs -p passes, in the order they run
const PASSES: [&str; 3] = [
    "Relocating blocks",
    "Scanning inode table",
    "Updating inode references",
];

static PASS_RES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    PASSES
        .iter()
        .map(|pass| {
            Regex::new(&format!(r"{}\s*(X{{0,{PASS_WIDTH}}})", regex::escape(pass)))
                .expect("valid regex")
        })
        .collect()
});

static DONE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"is now .*blocks long").expect("valid regex"));

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Number from the first `dumpe2fs -h` line starting with `field`,
/// e.g. `Block size:               4096`.
pub fn parse_dumpe2fs_field(output: &str, field: &str) -> Option<u64> {
    output
        .lines()
        .find_map(|line| line.strip_prefix(field))
        .and_then(|value| value.trim().parse().ok())
}

/// Stage and percent of a `resize2fs -f -p` run from its accumulated output.
///
/// Later passes supersede earlier ones. A pass at 100% is not completion;
/// only the final "is now ... blocks long" line (or resize2fs refusing
/// because there is nothing to do) is.
pub fn parse_resize_progress(stdout: &str, stderr: &str) -> (Option<String>, Option<f64>) {
    let complete = (Some(STAGE_COMPLETE.to_string()), Some(100.0));

    let err = stderr.to_lowercase();
    if err.contains("already") && err.contains("nothing to do") {
        return complete;
    }
    if DONE_RE.is_match(stdout) {
        return complete;
    }

    for (pass, re) in PASSES.iter().zip(PASS_RES.iter()).rev() {
        if let Some(caps) = re.captures_iter(stdout).last() {
            let filled = caps.get(1).map_or(0, |m| m.as_str().len());
            let percent = filled as f64 / PASS_WIDTH as f64 * 100.0;
            return (Some(pass.to_string()), Some(percent));
        }
    }

    (None, None)
}

/// e2fsprogs invocations against one device.
pub struct ExtTools<'a> {
    runner: &'a dyn ProcessRunner,
}

impl<'a> ExtTools<'a> {
    pub fn new(runner: &'a dyn ProcessRunner) -> Self {
        Self { runner }
    }

    /// Forced, non-interactive check. Exit 0 (clean) and 1 (errors fixed)
    /// both mean the filesystem can be resized.
    pub fn is_healthy(&self, device: &Path) -> Result<bool> {
        let out = run_unchecked(
            self.runner,
            FSCK_SITE,
            "e2fsck",
            &["-f".to_string(), "-a".to_string(), path_arg(device)],
        )?;
        let healthy = matches!(out.status, Some(0) | Some(1));
        if !healthy {
            emit(
                Level::Warn,
                "resize.ext.fsck_unhealthy",
                &format!(
                    "e2fsck on {} exited with {:?}; filesystem is not resizable",
                    device.display(),
                    out.status
                ),
                Some(serde_json::json!({ "stdout": out.stdout, "stderr": out.stderr })),
            );
        }
        Ok(healthy)
    }

    /// `resize2fs -P` estimate, in filesystem blocks.
    pub fn estimate_minimum_blocks(&self, device: &Path) -> Result<u64> {
        let out = run_checked(
            self.runner,
            ESTIMATE_SITE,
            "resize2fs",
            &["-P".to_string(), path_arg(device)],
        )?;
        size_from_output(&out.combined(), ESTIMATE_PATTERN)
    }

    /// Filesystem block size from the superblock, or the `stat` fallback.
    pub fn block_size(&self, device: &Path) -> Result<u64> {
        let out = run_unchecked(
            self.runner,
            DUMPE2FS_SITE,
            "dumpe2fs",
            &["-h".to_string(), path_arg(device)],
        )?;
        if out.success()
            && let Some(size) = parse_dumpe2fs_field(&out.stdout, "Block size:")
        {
            return Ok(size);
        }
        emit(
            Level::Debug,
            "resize.ext.block_size_fallback",
            &format!("dumpe2fs gave no block size for {}, using stat", device.display()),
            None,
        );
        stat_block_size(self.runner, device)
    }

    /// Current size, minimum size and block size. The check must pass first.
    pub fn minimum_size(&self, device: &Path) -> Result<SizeReport> {
        if !self.is_healthy(device)? {
            return Err(ResizeError::CannotResize(format!(
                "e2fsck found errors on {} it could not fix",
                device.display()
            )));
        }
        let blocks = self.estimate_minimum_blocks(device)?;
        let block_size = self.block_size(device)?;
        let minimum = blocks.checked_mul(block_size).ok_or_else(|| {
            ResizeError::CannotResize(format!("{blocks} blocks of {block_size} bytes overflows"))
        })?;
        Ok(SizeReport {
            current: device_size(self.runner, device)?,
            minimum,
            cluster: block_size,
        })
    }
}

pub struct ExtResizer {
    base: ResizerBase,
    filesystem: FilesystemType,
}

impl ExtResizer {
    pub fn new(base: ResizerBase, filesystem: FilesystemType) -> Self {
        Self { base, filesystem }
    }
}

impl Resizer for ExtResizer {
    fn filesystem(&self) -> FilesystemType {
        self.filesystem
    }

    fn base(&self) -> &ResizerBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ResizerBase {
        &mut self.base
    }

    fn can_resize(&mut self) -> Result<bool> {
        self.base
            .with_loop(|base, device| ExtTools::new(base.runner()).is_healthy(device))
    }

    fn calculate_minimum_size(&mut self) -> Result<u64> {
        self.base.with_loop(|base, device| {
            let report = ExtTools::new(base.runner()).minimum_size(device)?;
            emit(
                Level::Info,
                "resize.ext.min_size.calculated",
                &format!(
                    "Minimum size of {} is {} bytes",
                    base.identity(),
                    report.minimum
                ),
                None,
            );
            Ok(report.minimum)
        })
    }

    fn resize_safety_run(&mut self, target_bytes: u64) -> Result<bool> {
        self.base.with_loop(|base, device| {
            match ExtTools::new(base.runner()).minimum_size(device) {
                Ok(report) => Ok(report.minimum <= target_bytes),
                Err(ResizeError::CannotResize(_) | ResizeError::ToolFailed { .. }) => Ok(false),
                Err(e) => Err(e),
            }
        })
    }

    fn resize_to_size(&mut self, target_bytes: u64) -> Result<bool> {
        self.base.start_job(JobKind::Resize, |base, device| {
            let block_size = ExtTools::new(base.runner()).block_size(device)?;
            let blocks = target_bytes / block_size;
            if blocks == 0 {
                return Err(ResizeError::CannotResize(format!(
                    "target of {target_bytes} bytes is smaller than one block"
                )));
            }
            Ok((
                "resize2fs".to_string(),
                vec![
                    "-f".to_string(),
                    "-p".to_string(),
                    path_arg(device),
                    blocks.to_string(),
                ],
            ))
        })
    }

    fn generate_progress(&mut self) -> Result<ResizeProgress> {
        let running = self.base.is_running(JobKind::Resize)?;
        let (stdout, stderr) = self.base.read_output(JobKind::Resize)?;
        let (stage, percent) = parse_resize_progress(
            stdout.as_deref().unwrap_or_default(),
            stderr.as_deref().unwrap_or_default(),
        );
        let progress = ResizeProgress::new(running, stage, percent, stderr);
        self.base.release_if_stopped(running)?;
        Ok(progress)
    }

    fn calculate_minimum_size_start(&mut self) -> Result<bool> {
        self.base.start_helper("ext", |_, _| Ok(Vec::new()))
    }

    fn calculate_minimum_size_progress(&mut self) -> Result<MinimumSizeProgress> {
        let running = self.base.is_running(JobKind::MinimumSize)?;
        let (stdout, stderr) = self.base.read_output(JobKind::MinimumSize)?;
        let outcome = parse_helper_output(stdout.as_deref(), running);
        Ok(MinimumSizeProgress::new(running, outcome, stderr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resize::CalculationStage;
    use crate::resize::progress::markers;
    use crate::testing::{Harness, exit, ok};
    use std::path::PathBuf;

    fn resizer(h: &Harness) -> ExtResizer {
        ExtResizer::new(h.base(), FilesystemType::Ext4)
    }

    fn healthy_volume(h: &Harness) {
        h.runner.respond("e2fsck -f -a", exit(0, "clean", ""));
        h.runner.respond(
            "resize2fs -P",
            ok("resize2fs 1.47.0 (5-Feb-2023)\nEstimated minimum size of the filesystem: 1000\n"),
        );
        h.runner.respond(
            "dumpe2fs -h",
            ok("Filesystem volume name:   <none>\nBlock count:              262144\nBlock size:               4096\n"),
        );
        h.runner.respond("blockdev --getsize64", ok("1073741824\n"));
    }

    #[test]
    fn scanning_pass_half_done() {
        let stdout = "Begin pass 3 (max = 16)\nScanning inode table          XXXXXXXXXXXXXXXXXXXX--------------------";
        assert_eq!(
            parse_resize_progress(stdout, ""),
            (Some("Scanning inode table".to_string()), Some(50.0))
        );
    }

    #[test]
    fn nothing_to_do_is_complete_regardless_of_stdout() {
        let stderr = "The filesystem is already 262144 (4k) blocks long.  Nothing to do!\n";
        assert_eq!(
            parse_resize_progress("Relocating blocks             XXXX", stderr),
            (Some("Complete".to_string()), Some(100.0))
        );
    }

    #[test]
    fn later_passes_supersede_earlier_ones() {
        let stdout = "Begin pass 2 (max = 300)\n\
            Relocating blocks             XXXXXXXXXXXXXXXXXXXXXXXXXXXXXXXXXXXXXXXX\n\
            Begin pass 3 (max = 16)\n\
            Scanning inode table          XXXXXXXXXX------------------------------\n";
        assert_eq!(
            parse_resize_progress(stdout, ""),
            (Some("Scanning inode table".to_string()), Some(25.0))
        );
    }

    #[test]
    fn finished_pass_is_not_completion() {
        let stdout = "Updating inode references     XXXXXXXXXXXXXXXXXXXXXXXXXXXXXXXXXXXXXXXX\n";
        assert_eq!(
            parse_resize_progress(stdout, ""),
            (Some("Updating inode references".to_string()), Some(100.0))
        );

        let done = format!("{stdout}The filesystem on /dev/loop0p1 is now 131072 (4k) blocks long.\n");
        assert_eq!(
            parse_resize_progress(&done, ""),
            (Some("Complete".to_string()), Some(100.0))
        );
    }

    #[test]
    fn no_markers_means_unknown() {
        assert_eq!(parse_resize_progress("resize2fs 1.47.0\n", ""), (None, None));
    }

    #[test]
    fn test_parse_dumpe2fs_field() {
        let output = "Block count:              262144\nBlock size:               4096\n";
        assert_eq!(parse_dumpe2fs_field(output, "Block size:"), Some(4096));
        assert_eq!(parse_dumpe2fs_field(output, "Free blocks:"), None);
        assert_eq!(parse_dumpe2fs_field("Block size:    unknown\n", "Block size:"), None);
    }

    #[test]
    fn minimum_size_is_blocks_times_block_size() {
        let h = Harness::new();
        healthy_volume(&h);
        let mut r = resizer(&h);

        assert_eq!(r.calculate_minimum_size().unwrap(), 4_096_000);
        assert_eq!(h.loops.created(), 1);
        assert_eq!(h.loops.active(), 0);
    }

    #[test]
    fn block_size_falls_back_to_stat() {
        let h = Harness::new();
        h.runner.respond("dumpe2fs -h /dev/sdz1", exit(1, "", "Bad magic number"));
        h.runner.respond("stat --file-system", ok("1024\n"));
        let tools = ExtTools::new(h.runner.as_ref());
        assert_eq!(tools.block_size(Path::new("/dev/sdz1")).unwrap(), 1024);
    }

    #[test]
    fn fsck_exit_codes() {
        for (status, healthy) in [(0, true), (1, true), (2, false), (4, false), (8, false)] {
            let h = Harness::new();
            h.runner.respond("e2fsck", exit(status, "", ""));
            assert_eq!(resizer(&h).can_resize().unwrap(), healthy, "exit {status}");
            assert_eq!(h.loops.active(), 0);
        }
    }

    #[test]
    fn unhealthy_filesystem_cannot_report_a_minimum() {
        let h = Harness::new();
        h.runner.respond("e2fsck", exit(4, "", "UNEXPECTED INCONSISTENCY"));
        let err = resizer(&h).calculate_minimum_size().unwrap_err();
        assert!(matches!(err, ResizeError::CannotResize(_)));
        assert_eq!(h.loops.active(), 0);
        assert!(h.runner.calls_starting_with("resize2fs").is_empty());
    }

    #[test]
    fn estimate_failure_releases_the_loop() {
        let h = Harness::new();
        h.runner.respond("e2fsck", exit(0, "", ""));
        h.runner.respond("resize2fs -P", exit(1, "", "Bad magic number in super-block"));
        let err = resizer(&h).calculate_minimum_size().unwrap_err();
        assert_eq!(err.code(), 1111);
        assert_eq!(h.loops.destroyed().len(), 1);
    }

    #[test]
    fn missing_summary_line_is_a_parse_error() {
        let h = Harness::new();
        h.runner.respond("e2fsck", exit(0, "", ""));
        h.runner.respond("resize2fs -P", ok("resize2fs 1.47.0 (5-Feb-2023)\n"));
        let err = resizer(&h).calculate_minimum_size().unwrap_err();
        assert!(matches!(err, ResizeError::Parse { .. }));
        assert_eq!(h.loops.active(), 0);
    }

    #[test]
    fn safety_run_compares_against_the_estimate() {
        let h = Harness::new();
        healthy_volume(&h);
        assert!(resizer(&h).resize_safety_run(8_192_000).unwrap());
        assert!(!resizer(&h).resize_safety_run(4_095_999).unwrap());
    }

    #[test]
    fn resize_runs_in_the_background_and_releases_when_done() {
        let h = Harness::new();
        healthy_volume(&h);
        let mut r = resizer(&h);

        assert!(r.resize_to_size(536_870_912).unwrap());
        let launched = h.jobs.launched();
        assert_eq!(launched.len(), 1);
        assert_eq!(launched[0].program, "resize2fs");
        assert_eq!(launched[0].args, vec!["-f", "-p", "/dev/loop0p1", "131072"]);
        assert_eq!(h.loops.active(), 1);

        h.write_output(
            JobKind::Resize,
            Some("Begin pass 2 (max = 10)\nRelocating blocks             XXXXXXXXXX"),
            Some(""),
        );
        let mut poller = resizer(&h);
        let p = poller.generate_progress().unwrap();
        assert!(p.running());
        assert_eq!(p.stage(), Some("Relocating blocks"));
        assert_eq!(p.percent(), Some(25.0));
        assert_eq!(p.std_err(), None);
        assert_eq!(h.loops.active(), 1);

        h.write_output(
            JobKind::Resize,
            Some("The filesystem on /dev/loop0p1 is now 131072 (4k) blocks long.\n"),
            None,
        );
        h.jobs.set_running(&h.job_name(JobKind::Resize), false);
        let p = poller.generate_progress().unwrap();
        assert!(!p.running());
        assert!(p.is_complete());
        assert_eq!(h.loops.active(), 0);
        assert!(!h.base_files().stdout(JobKind::Resize).exists());
    }

    #[test]
    fn failed_launch_releases_the_loop() {
        let h = Harness::new();
        healthy_volume(&h);
        h.jobs.fail_launch();
        assert!(!resizer(&h).resize_to_size(536_870_912).unwrap());
        assert_eq!(h.loops.active(), 0);
    }

    #[test]
    fn second_start_is_refused_while_running() {
        let h = Harness::new();
        healthy_volume(&h);
        assert!(resizer(&h).resize_to_size(536_870_912).unwrap());
        let err = resizer(&h).resize_to_size(536_870_912).unwrap_err();
        assert!(matches!(err, ResizeError::JobInProgress(_)));
        // the running job keeps its binding
        assert_eq!(h.loops.active(), 1);
        assert_eq!(h.loops.created(), 1);
    }

    #[test]
    fn stop_kills_the_job() {
        let h = Harness::new();
        healthy_volume(&h);
        let mut r = resizer(&h);
        assert!(r.resize_to_size(536_870_912).unwrap());
        r.stop_resize().unwrap();
        assert_eq!(h.jobs.killed(), vec![h.job_name(JobKind::Resize)]);
        // stopping again is fine
        r.stop_resize().unwrap();
    }

    #[test]
    fn minimum_size_start_hands_off_to_the_helper() {
        let h = Harness::new();
        let mut r = resizer(&h);
        assert!(r.calculate_minimum_size_start().unwrap());

        let launched = h.jobs.launched();
        assert_eq!(launched.len(), 1);
        assert_eq!(launched[0].name, h.job_name(JobKind::MinimumSize));
        assert_eq!(launched[0].program, "snapresize-helper");
        assert_eq!(launched[0].args[0], "asset:snapshot:ext:calcminsize");
        assert_eq!(launched[0].args[1..3], ["--path", "/dev/loop0p1"]);
        assert_eq!(launched[0].args[3], "--image");
        assert_eq!(h.loops.active(), 0);
        assert!(!r.base().needs_cleanup().unwrap());
    }

    #[test]
    fn check_during_a_running_resize_leaves_its_loop_alone() {
        let h = Harness::new();
        healthy_volume(&h);
        assert!(resizer(&h).resize_to_size(536_870_912).unwrap());
        h.write_output(JobKind::Resize, Some("Relocating blocks             XXXX"), None);

        let mut other = resizer(&h);
        assert!(other.can_resize().unwrap());
        assert_eq!(other.calculate_minimum_size().unwrap(), 4_096_000);
        assert!(other.base().binding().is_none());

        assert!(h.loops.destroyed().is_empty());
        assert_eq!(h.loops.active(), 1);
        assert!(h.base_files().stdout(JobKind::Resize).exists());

        // once the resize ends its own poll still releases the binding
        h.jobs.set_running(&h.job_name(JobKind::Resize), false);
        resizer(&h).generate_progress().unwrap();
        assert_eq!(h.loops.destroyed(), vec![PathBuf::from("/dev/loop0")]);
    }

    #[test]
    fn helper_start_during_a_running_resize_leaves_its_loop_alone() {
        let h = Harness::new();
        healthy_volume(&h);
        assert!(resizer(&h).resize_to_size(536_870_912).unwrap());
        h.write_output(JobKind::Resize, Some("Relocating blocks             XXXX"), None);

        assert!(resizer(&h).calculate_minimum_size_start().unwrap());
        let helper = &h.jobs.launched()[1];
        assert_eq!(helper.args[1..3], ["--path", "/dev/loop0p1"]);

        assert!(h.loops.destroyed().is_empty());
        assert_eq!(h.loops.created(), 1);
        assert!(h.base_files().stdout(JobKind::Resize).exists());
        let p = resizer(&h).generate_progress().unwrap();
        assert_eq!(p.stage(), Some("Relocating blocks"));
    }

    #[test]
    fn minimum_size_progress_is_a_pure_poll() {
        let h = Harness::new();
        let mut r = resizer(&h);
        assert_eq!(
            r.calculate_minimum_size_progress().unwrap().stage(),
            CalculationStage::NotStarted
        );

        h.jobs.set_running(&h.job_name(JobKind::MinimumSize), true);
        h.write_output(JobKind::MinimumSize, Some("e2fsck 1.47.0\n"), Some(""));
        let p = r.calculate_minimum_size_progress().unwrap();
        assert_eq!(p.stage(), CalculationStage::Running);
        assert_eq!(p.percent_complete(), 0.0);

        let report = SizeReport {
            current: 1073741824,
            minimum: 4096000,
            cluster: 4096,
        };
        h.write_output(JobKind::MinimumSize, Some(&report.render(markers::SUCCESS)), None);
        h.jobs.set_running(&h.job_name(JobKind::MinimumSize), false);
        let first = r.calculate_minimum_size_progress().unwrap();
        let second = r.calculate_minimum_size_progress().unwrap();
        assert_eq!(first, second);
        assert_eq!(first.stage(), CalculationStage::Complete);
        assert_eq!(first.minimum_volume_size(), 4096000);
        assert_eq!(first.cluster_size(), 4096);
        assert!(!first.running());
    }

    #[test]
    fn helper_failure_is_terminal() {
        let h = Harness::new();
        h.write_output(
            JobKind::MinimumSize,
            Some("Filesystem cannot be resized: e2fsck found errors\n"),
            Some("e2fsck exited with 4\n"),
        );
        let p = resizer(&h).calculate_minimum_size_progress().unwrap();
        assert_eq!(p.stage(), CalculationStage::Failed);
        assert_eq!(p.std_err(), Some("e2fsck exited with 4\n"));
    }
}

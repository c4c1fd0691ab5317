//! Behavior shared by every filesystem resizer: loop device lifecycle and
//! ownership, tool invocation, detached job launch and output file access.

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use regex::Regex;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::job::{JobFiles, JobIdentity, JobKind};
use crate::config::ResizeConfig;
use crate::error::{ResizeError, Result};
use crate::jobs::{JobSpec, JobSupervisor};
use crate::loopdev::{LoopBinding, LoopManager};
use crate::process::{ProcessRunner, ToolOutput};
use crate::ui::prelude::*;

/// Collaborators every resizer is wired with. There are no defaults; the
/// caller decides what runs tools, binds loops and supervises jobs.
#[derive(Clone)]
pub struct ResizeServices {
    pub config: Arc<ResizeConfig>,
    pub runner: Arc<dyn ProcessRunner>,
    pub loops: Arc<dyn LoopManager>,
    pub jobs: Arc<dyn JobSupervisor>,
}

/// A call site that runs an external tool: its stable error code and log event.
#[derive(Debug, Clone, Copy)]
pub struct ToolSite {
    pub code: u32,
    pub event: &'static str,
}

impl ToolSite {
    pub const fn new(code: u32, event: &'static str) -> Self {
        Self { code, event }
    }
}

const BLOCKDEV_SITE: ToolSite = ToolSite::new(1101, "resize.blockdev.failed");
const STAT_SITE: ToolSite = ToolSite::new(1102, "resize.stat.failed");
const HELPER_SITE: ToolSite = ToolSite::new(1103, "resize.helper.failed");

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Run a tool that must exit 0. Failures are logged under the site's event
/// with the full output before being returned.
pub fn run_checked(
    runner: &dyn ProcessRunner,
    site: ToolSite,
    program: &str,
    args: &[String],
) -> Result<ToolOutput> {
    let output = run_unchecked(runner, site, program, args)?;
    if !output.success() {
        emit(
            Level::Error,
            site.event,
            &format!("{program} exited with {:?}", output.status),
            Some(serde_json::json!({
                "code": site.code,
                "args": args,
                "status": output.status,
                "stdout": output.stdout,
                "stderr": output.stderr,
            })),
        );
        return Err(ResizeError::ToolFailed {
            code: site.code,
            event: site.event,
            tool: program.to_string(),
            status: output.status,
            stderr: output.stderr.trim().to_string(),
        });
    }
    Ok(output)
}

/// Run a tool whose exit status the caller interprets itself. Only failing
/// to execute it at all is an error.
pub fn run_unchecked(
    runner: &dyn ProcessRunner,
    site: ToolSite,
    program: &str,
    args: &[String],
) -> Result<ToolOutput> {
    runner.run(program, args).map_err(|e| {
        emit(
            Level::Error,
            site.event,
            &format!("Could not run {program}: {e:#}"),
            Some(serde_json::json!({ "code": site.code, "args": args })),
        );
        ResizeError::ToolFailed {
            code: site.code,
            event: site.event,
            tool: program.to_string(),
            status: None,
            stderr: format!("{e:#}"),
        }
    })
}

/// Extract an integer from tool output. `pattern` must have exactly one
/// capturing group; a missing match is fatal and logs the raw output.
pub fn size_from_output(output: &str, pattern: &str) -> Result<u64> {
    let parse_error = || {
        emit(
            Level::Error,
            "resize.parse.failed",
            &format!("Could not find '{pattern}' in tool output"),
            Some(serde_json::json!({ "pattern": pattern, "output": output })),
        );
        ResizeError::Parse {
            pattern: pattern.to_string(),
            output: output.to_string(),
        }
    };

    let re = Regex::new(pattern).map_err(|_| parse_error())?;
    if re.captures_len() != 2 {
        return Err(parse_error());
    }
    re.captures(output)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
        .ok_or_else(parse_error)
}

/// Raw size of a block device in bytes.
pub fn device_size(runner: &dyn ProcessRunner, device: &Path) -> Result<u64> {
    let out = run_checked(
        runner,
        BLOCKDEV_SITE,
        "blockdev",
        &["--getsize64".to_string(), path_arg(device)],
    )?;
    size_from_output(&out.stdout, r"(\d+)")
}

/// Fundamental block size reported by `stat --file-system`.
pub fn stat_block_size(runner: &dyn ProcessRunner, device: &Path) -> Result<u64> {
    let out = run_checked(
        runner,
        STAT_SITE,
        "stat",
        &[
            "--file-system".to_string(),
            "--format=%s".to_string(),
            path_arg(device),
        ],
    )?;
    size_from_output(&out.stdout, r"(\d+)")
}

/// Contents of the `.cleaned` file: `1` when clean, `0 <device>` while the
/// volume owes the release of the loop device it bound.
#[derive(Debug, Clone, PartialEq, Eq)]
enum CleanupMarker {
    Clean,
    /// `None` for a bare "0" that does not say which device it meant
    Owed(Option<PathBuf>),
}

impl CleanupMarker {
    fn parse(content: &str) -> Self {
        let mut parts = content.trim().splitn(2, char::is_whitespace);
        match parts.next() {
            Some("0") => Self::Owed(
                parts
                    .next()
                    .map(str::trim)
                    .filter(|d| !d.is_empty())
                    .map(PathBuf::from),
            ),
            _ => Self::Clean,
        }
    }

    fn render(&self) -> String {
        match self {
            Self::Clean => "1".to_string(),
            Self::Owed(Some(device)) => format!("0 {}", device.display()),
            Self::Owed(None) => "0".to_string(),
        }
    }
}

/// Exclusive right to start a job for one volume. Dropping it releases the lock.
pub struct JobClaim {
    name: String,
    _lock: Flock<File>,
}

pub struct ResizerBase {
    identity: JobIdentity,
    image: PathBuf,
    files: JobFiles,
    services: ResizeServices,
    binding: Option<LoopBinding>,
    adopted: bool,
}

impl ResizerBase {
    pub fn new(identity: JobIdentity, services: ResizeServices) -> Self {
        let image = identity.image_path(&services.config.image_root);
        let files = JobFiles::new(services.config.work_dir.clone(), &identity);
        Self {
            identity,
            image,
            files,
            services,
            binding: None,
            adopted: false,
        }
    }

    pub fn identity(&self) -> &JobIdentity {
        &self.identity
    }

    pub fn image_path(&self) -> &Path {
        &self.image
    }

    pub fn files(&self) -> &JobFiles {
        &self.files
    }

    pub fn runner(&self) -> &dyn ProcessRunner {
        self.services.runner.as_ref()
    }

    pub fn binding(&self) -> Option<&LoopBinding> {
        self.binding.as_ref()
    }

    /// Partition 1 of the current binding.
    pub fn partition_path(&self) -> Result<PathBuf> {
        self.binding
            .as_ref()
            .map(|b| b.partition(1))
            .ok_or(ResizeError::NotBound)
    }

    /// Bind `file` (the volume image by default) to a loop device.
    ///
    /// A binding that already exists is adopted and never owned: cleanup on
    /// this instance leaves it alone, and the persisted marker keeps naming
    /// whoever created it.
    pub fn setup_loop(&mut self, file: Option<&Path>) -> Result<LoopBinding> {
        if let Some(binding) = &self.binding {
            return Ok(binding.clone());
        }

        let file = file.unwrap_or(self.image.as_path()).to_path_buf();
        let setup_error = |source: anyhow::Error| {
            emit(
                Level::Error,
                "resize.loop.setup_failed",
                &format!("Loop setup failed for {}: {source:#}", file.display()),
                None,
            );
            ResizeError::LoopSetup {
                path: file.display().to_string(),
                source,
            }
        };

        if let Some(existing) = self.services.loops.find(&file).map_err(setup_error)? {
            emit(
                Level::Debug,
                "resize.loop.adopted",
                &format!(
                    "Reusing {} for {} without taking ownership",
                    existing.device.display(),
                    file.display()
                ),
                None,
            );
            self.adopted = true;
            self.binding = Some(existing.clone());
            return Ok(existing);
        }

        let binding = self.services.loops.create(&file, true).map_err(setup_error)?;
        emit(
            Level::Debug,
            "resize.loop.created",
            &format!("Bound {} to {}", file.display(), binding.device.display()),
            None,
        );
        self.adopted = false;
        self.binding = Some(binding.clone());
        if let Err(e) = self.write_marker(&CleanupMarker::Owed(Some(binding.device.clone()))) {
            let _ = self.services.loops.destroy(&binding);
            self.binding = None;
            return Err(e);
        }
        Ok(binding)
    }

    /// Release the loop binding and the resize stdout file, if this volume
    /// owes a cleanup. Safe to call any number of times.
    ///
    /// Without an in-memory binding (a later poll in another process) the
    /// binding is looked up again, and only detached if it is the device the
    /// marker recorded.
    pub fn clean_up_loop(&mut self) -> Result<()> {
        let owned = match self.read_marker()? {
            CleanupMarker::Owed(owned) if !self.adopted => owned,
            _ => {
                self.binding = None;
                self.adopted = false;
                return Ok(());
            }
        };

        match fs::remove_file(self.files.stdout(JobKind::Resize)) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let binding = match self.binding.take() {
            Some(b) => Some(b),
            None => self
                .services
                .loops
                .find(&self.image)
                .map_err(|source| ResizeError::LoopTeardown {
                    device: self.image.display().to_string(),
                    source,
                })?,
        };

        match binding {
            Some(binding) if owned.as_deref() == Some(binding.device.as_path()) => {
                self.services.loops.destroy(&binding).map_err(|source| {
                    emit(
                        Level::Error,
                        "resize.loop.teardown_failed",
                        &format!("Could not detach {}: {source:#}", binding.device.display()),
                        None,
                    );
                    ResizeError::LoopTeardown {
                        device: binding.device.display().to_string(),
                        source,
                    }
                })?;
                emit(
                    Level::Debug,
                    "resize.loop.destroyed",
                    &format!("Detached {}", binding.device.display()),
                    None,
                );
            }
            Some(binding) => emit(
                Level::Warn,
                "resize.loop.foreign_binding",
                &format!(
                    "Leaving {} attached: it is not the device this volume bound",
                    binding.device.display()
                ),
                Some(serde_json::json!({
                    "recorded": owned.as_ref().map(|d| d.display().to_string()),
                })),
            ),
            None => {}
        }

        self.write_marker(&CleanupMarker::Clean)
    }

    /// Whether this instance owes a loop cleanup. Always false for an adopted
    /// binding; otherwise read from the persisted marker.
    pub fn needs_cleanup(&self) -> Result<bool> {
        if self.adopted {
            return Ok(false);
        }
        Ok(matches!(self.read_marker()?, CleanupMarker::Owed(_)))
    }

    /// Persist that no cleanup is owed. Owed markers are only ever written
    /// for a binding this volume created itself.
    pub fn set_needs_cleanup(&self, owed: bool) -> Result<()> {
        match (owed, &self.binding) {
            (true, Some(binding)) if !self.adopted => {
                self.write_marker(&CleanupMarker::Owed(Some(binding.device.clone())))
            }
            (true, _) => Err(ResizeError::NotBound),
            (false, _) => self.write_marker(&CleanupMarker::Clean),
        }
    }

    fn read_marker(&self) -> Result<CleanupMarker> {
        match fs::read_to_string(self.files.cleanup_marker()) {
            Ok(content) => Ok(CleanupMarker::parse(&content)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(CleanupMarker::Clean),
            Err(e) => Err(e.into()),
        }
    }

    fn write_marker(&self, marker: &CleanupMarker) -> Result<()> {
        fs::create_dir_all(self.files.dir())?;
        fs::write(self.files.cleanup_marker(), marker.render())?;
        Ok(())
    }

    /// Run `op` against partition 1 of a fresh loop binding, releasing the
    /// binding afterwards whether `op` succeeded or not.
    pub fn with_loop<T>(&mut self, op: impl FnOnce(&mut Self, &Path) -> Result<T>) -> Result<T> {
        let binding = self.setup_loop(None)?;
        let partition = binding.partition(1);
        let result = op(self, &partition);
        let cleanup = self.clean_up_loop();
        match (result, cleanup) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(cleanup_err)) => {
                emit(
                    Level::Warn,
                    "resize.loop.cleanup_after_error_failed",
                    &format!("Cleanup after failure also failed: {cleanup_err}"),
                    None,
                );
                Err(e)
            }
        }
    }

    fn control_error(&self, kind: JobKind, source: anyhow::Error) -> ResizeError {
        ResizeError::JobControl {
            job: self.files.job_name(kind),
            source,
        }
    }

    /// Take the per-volume start lock and make sure no job of this kind is
    /// already running for the volume.
    pub fn claim(&self, kind: JobKind) -> Result<JobClaim> {
        fs::create_dir_all(self.files.dir())?;
        let name = self.files.job_name(kind);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.files.lock())?;
        let lock = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => lock,
            Err((_, Errno::EWOULDBLOCK)) => return Err(ResizeError::JobInProgress(name)),
            Err((_, errno)) => return Err(std::io::Error::from(errno).into()),
        };

        if self.is_running(kind)? {
            emit(
                Level::Warn,
                "resize.job.already_running",
                &format!("Refusing to start {name}: a job for {} is running", self.identity),
                None,
            );
            return Err(ResizeError::JobInProgress(name));
        }
        Ok(JobClaim { name, _lock: lock })
    }

    /// Launch a detached job under `claim`. Returns whether the job was
    /// started, not whether it will succeed.
    pub fn launch(&self, claim: JobClaim, kind: JobKind, program: &str, args: Vec<String>) -> bool {
        let spec = JobSpec {
            name: claim.name.clone(),
            program: program.to_string(),
            args,
            stdout: self.files.stdout(kind),
            stderr: self.files.stderr(kind),
        };
        match self.services.jobs.launch(&spec) {
            Ok(()) => {
                emit(
                    Level::Info,
                    "resize.job.launched",
                    &format!("Started {} for {}", spec.name, self.identity),
                    Some(serde_json::json!({ "command": spec.command_line() })),
                );
                true
            }
            Err(e) => {
                emit(
                    Level::Error,
                    "resize.job.launch_failed",
                    &format!("Could not start {}: {e:#}", spec.name),
                    Some(serde_json::json!({ "command": spec.command_line() })),
                );
                false
            }
        }
    }

    pub fn is_running(&self, kind: JobKind) -> Result<bool> {
        self.services
            .jobs
            .is_running(&self.files.job_name(kind))
            .map_err(|e| self.control_error(kind, e))
    }

    pub fn kill(&self, kind: JobKind) -> Result<()> {
        self.services
            .jobs
            .kill(&self.files.job_name(kind))
            .map_err(|e| self.control_error(kind, e))
    }

    /// Contents of the job's stdout and stderr files. A missing file reads as
    /// `None`, and so does a stderr that is only whitespace.
    pub fn read_output(&self, kind: JobKind) -> Result<(Option<String>, Option<String>)> {
        let stdout = read_optional(&self.files.stdout(kind))?;
        let stderr = read_optional(&self.files.stderr(kind))?.filter(|s| !s.trim().is_empty());
        Ok((stdout, stderr))
    }

    /// Last `bytes` bytes of the job's stdout.
    pub fn read_stdout_tail(&self, kind: JobKind, bytes: u64) -> Result<Option<String>> {
        let mut file = match File::open(self.files.stdout(kind)) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let len = file.metadata()?.len();
        file.seek(SeekFrom::Start(len.saturating_sub(bytes)))?;
        let mut buf = Vec::with_capacity(bytes as usize);
        file.read_to_end(&mut buf)?;
        Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
    }

    /// Claim, bind and launch a job whose command `build` derives from the
    /// partition path. The binding stays up while the job runs and is only
    /// released here if nothing was launched.
    pub fn start_job(
        &mut self,
        kind: JobKind,
        build: impl FnOnce(&Self, &Path) -> Result<(String, Vec<String>)>,
    ) -> Result<bool> {
        let claim = self.claim(kind)?;
        let partition = self.setup_loop(None)?.partition(1);

        let launched = build(self, &partition)
            .map(|(program, args)| self.launch(claim, kind, &program, args));

        if !matches!(launched, Ok(true)) {
            if let Err(e) = self.clean_up_loop() {
                emit(
                    Level::Warn,
                    "resize.job.start_cleanup_failed",
                    &format!("Could not release loop device after failed start: {e}"),
                    None,
                );
            }
        }
        launched
    }

    /// Called at the end of every resize poll: a job that has stopped no
    /// longer needs its loop binding.
    pub fn release_if_stopped(&mut self, running: bool) -> Result<()> {
        if running {
            return Ok(());
        }
        self.clean_up_loop()
    }

    /// Program and arguments for `<helper> asset:snapshot:<fs>:calcminsize`.
    pub fn helper_command(&self, filesystem: &str, extra: Vec<String>) -> Result<(String, Vec<String>)> {
        let (program, mut args) = self
            .services
            .config
            .helper_invocation()
            .map_err(|e| self.control_error(JobKind::MinimumSize, e))?;
        args.push(format!("asset:snapshot:{filesystem}:calcminsize"));
        args.extend(extra);
        Ok((program, args))
    }

    /// Run a helper to completion in this process.
    pub fn run_helper(&self, filesystem: &str, extra: Vec<String>) -> Result<ToolOutput> {
        let (program, args) = self.helper_command(filesystem, extra)?;
        run_unchecked(self.runner(), HELPER_SITE, &program, &args)
    }

    /// Start the detached minimum-size helper for `filesystem`.
    ///
    /// `prepare` runs while the loop binding is held and returns any extra
    /// helper arguments. The binding is released right after launch; the
    /// helper gets `--image` so it can bind its own device.
    pub fn start_helper(
        &mut self,
        filesystem: &str,
        prepare: impl FnOnce(&Self, &Path) -> Result<Vec<String>>,
    ) -> Result<bool> {
        let claim = self.claim(JobKind::MinimumSize)?;
        let binding = self.setup_loop(None)?;
        let partition = binding.partition(1);

        let launched = prepare(self, &partition).and_then(|extra| {
            let mut helper_args = vec![
                "--path".to_string(),
                path_arg(&partition),
                "--image".to_string(),
                path_arg(&binding.backing_file),
            ];
            helper_args.extend(extra);
            let (program, args) = self.helper_command(filesystem, helper_args)?;
            Ok(self.launch(claim, JobKind::MinimumSize, &program, args))
        });

        let cleanup = self.clean_up_loop();
        let launched = launched?;
        cleanup?;
        Ok(launched)
    }
}

fn read_optional(path: &Path) -> Result<Option<String>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).into_owned())),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

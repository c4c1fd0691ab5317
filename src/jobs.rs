//! Detached background jobs that outlive the process that started them.
//!
//! A job is a process group started with stdout/stderr redirected to files.
//! Its identity (pid plus kernel start time) is persisted as a JSON record so
//! a later, unrelated process can ask whether it is still alive or kill it.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::sys::wait::{WaitPidFlag, waitpid};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use crate::common::paths::ensure_dir;
use crate::common::shell::render_command;
use crate::ui::prelude::*;

/// What to run and where its output goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSpec {
    pub name: String,
    pub program: String,
    pub args: Vec<String>,
    pub stdout: PathBuf,
    pub stderr: PathBuf,
}

impl JobSpec {
    pub fn command_line(&self) -> String {
        render_command(&self.program, &self.args)
    }
}

pub trait JobSupervisor: Send + Sync {
    /// Start `spec` detached from the caller. Returns once the process exists.
    fn launch(&self, spec: &JobSpec) -> Result<()>;

    fn is_running(&self, name: &str) -> Result<bool>;

    /// Best effort; killing a job that is not running succeeds.
    fn kill(&self, name: &str) -> Result<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobRecord {
    pub name: String,
    pub command: String,
    pub pid: i32,
    /// Kernel start time in clock ticks, guards against pid reuse
    pub start_ticks: Option<u64>,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    records_dir: PathBuf,
}

impl ProcessSupervisor {
    pub fn new(records_dir: impl Into<PathBuf>) -> Self {
        Self {
            records_dir: records_dir.into(),
        }
    }

    fn record_path(&self, name: &str) -> PathBuf {
        self.records_dir.join(format!("{name}.json"))
    }

    pub fn record(&self, name: &str) -> Result<Option<JobRecord>> {
        let path = self.record_path(name);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("reading job record {}", path.display()))?;
        let record = serde_json::from_str(&content)
            .with_context(|| format!("parsing job record {}", path.display()))?;
        Ok(Some(record))
    }

    fn write_record(&self, record: &JobRecord) -> Result<()> {
        ensure_dir(&self.records_dir)?;
        let path = self.record_path(&record.name);
        let json = serde_json::to_string_pretty(record).context("serializing job record")?;
        fs::write(&path, json).with_context(|| format!("writing job record {}", path.display()))
    }
}

fn create_output(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    File::create(path).with_context(|| format!("creating output file {}", path.display()))
}

impl JobSupervisor for ProcessSupervisor {
    fn launch(&self, spec: &JobSpec) -> Result<()> {
        let stdout = create_output(&spec.stdout)?;
        let stderr = create_output(&spec.stderr)?;

        let child = Command::new(&spec.program)
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .process_group(0)
            .spawn()
            .with_context(|| format!("Failed to start {}", spec.program))?;

        let pid = child.id() as i32;
        let record = JobRecord {
            name: spec.name.clone(),
            command: spec.command_line(),
            pid,
            start_ticks: read_proc_stat(pid).map(|s| s.start_ticks),
            started_at: Utc::now(),
        };
        self.write_record(&record)?;

        emit(
            Level::Debug,
            "jobs.launched",
            &format!("Started job {} (pid {pid}): {}", spec.name, record.command),
            None,
        );
        Ok(())
    }

    fn is_running(&self, name: &str) -> Result<bool> {
        let Some(record) = self.record(name)? else {
            return Ok(false);
        };

        // Reap it if we happen to be the parent; ECHILD otherwise, which is fine.
        let _ = waitpid(Pid::from_raw(record.pid), Some(WaitPidFlag::WNOHANG));

        let Some(stat) = read_proc_stat(record.pid) else {
            return Ok(false);
        };
        if stat.state == 'Z' || stat.state == 'X' {
            return Ok(false);
        }
        Ok(match record.start_ticks {
            Some(ticks) => ticks == stat.start_ticks,
            None => true,
        })
    }

    fn kill(&self, name: &str) -> Result<()> {
        if !self.is_running(name)? {
            return Ok(());
        }
        let Some(record) = self.record(name)? else {
            return Ok(());
        };
        match killpg(Pid::from_raw(record.pid), Signal::SIGTERM) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => return Err(e).with_context(|| format!("Failed to kill job {name}")),
        }
        emit(
            Level::Info,
            "jobs.killed",
            &format!("Sent SIGTERM to job {name} (pid {})", record.pid),
            None,
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcStat {
    pub state: char,
    pub start_ticks: u64,
}

fn read_proc_stat(pid: i32) -> Option<ProcStat> {
    let content = fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    parse_proc_stat(&content)
}

/// Parse the state (field 3) and start time (field 22) of `/proc/<pid>/stat`.
/// The command name in field 2 may itself contain spaces and parentheses.
pub fn parse_proc_stat(content: &str) -> Option<ProcStat> {
    let rest = &content[content.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    let state = fields.first()?.chars().next()?;
    let start_ticks = fields.get(19)?.parse().ok()?;
    Some(ProcStat { state, start_ticks })
}

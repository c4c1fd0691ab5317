//! In-memory collaborators for unit tests.

use anyhow::Result;
use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::common::shell::render_command;
use crate::config::ResizeConfig;
use crate::jobs::{JobSpec, JobSupervisor};
use crate::loopdev::{LoopBinding, LoopManager};
use crate::metadata::VolumeMetadata;
use crate::process::{ProcessRunner, ToolOutput};
use crate::resize::base::{ResizeServices, ResizerBase};
use crate::resize::job::{JobFiles, JobIdentity, JobKind};

pub fn ok(stdout: &str) -> ToolOutput {
    exit(0, stdout, "")
}

pub fn exit(status: i32, stdout: &str, stderr: &str) -> ToolOutput {
    ToolOutput {
        status: Some(status),
        stdout: stdout.to_string(),
        stderr: stderr.to_string(),
    }
}

/// Answers commands whose rendered command line starts with a registered
/// prefix. Several answers for one prefix are handed out in order; the last
/// one repeats.
#[derive(Default)]
pub struct FakeRunner {
    responses: Mutex<Vec<(String, VecDeque<ToolOutput>)>>,
    calls: Mutex<Vec<String>>,
}

impl FakeRunner {
    pub fn respond(&self, prefix: &str, output: ToolOutput) {
        let mut responses = self.responses.lock().unwrap();
        if let Some((_, queue)) = responses.iter_mut().find(|(p, _)| p == prefix) {
            queue.push_back(output);
        } else {
            responses.push((prefix.to_string(), VecDeque::from([output])));
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_starting_with(&self, prefix: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.starts_with(prefix))
            .collect()
    }
}

impl ProcessRunner for FakeRunner {
    fn run(&self, program: &str, args: &[String]) -> Result<ToolOutput> {
        let line = render_command(program, args);
        self.calls.lock().unwrap().push(line.clone());

        let mut responses = self.responses.lock().unwrap();
        let Some((_, queue)) = responses
            .iter_mut()
            .filter(|(prefix, _)| line.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
        else {
            anyhow::bail!("unexpected command: {line}");
        };
        if queue.len() > 1 {
            Ok(queue.pop_front().unwrap())
        } else {
            Ok(queue.front().cloned().unwrap())
        }
    }
}

#[derive(Default)]
struct LoopState {
    bindings: Vec<LoopBinding>,
    created: usize,
    destroyed: Vec<PathBuf>,
    fail_create: bool,
    next: u32,
}

#[derive(Default)]
pub struct FakeLoops {
    state: Mutex<LoopState>,
}

impl FakeLoops {
    pub fn preexisting(&self, file: &Path, device: &str) {
        self.state
            .lock()
            .unwrap()
            .bindings
            .push(LoopBinding::new(device, file));
    }

    pub fn fail_create(&self) {
        self.state.lock().unwrap().fail_create = true;
    }

    pub fn created(&self) -> usize {
        self.state.lock().unwrap().created
    }

    pub fn destroyed(&self) -> Vec<PathBuf> {
        self.state.lock().unwrap().destroyed.clone()
    }

    pub fn active(&self) -> usize {
        self.state.lock().unwrap().bindings.len()
    }
}

impl LoopManager for FakeLoops {
    fn find(&self, file: &Path) -> Result<Option<LoopBinding>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .bindings
            .iter()
            .find(|b| b.backing_file == file)
            .cloned())
    }

    fn create(&self, file: &Path, _scan_partitions: bool) -> Result<LoopBinding> {
        let mut state = self.state.lock().unwrap();
        if state.fail_create {
            anyhow::bail!("losetup: {}: failed to set up loop device", file.display());
        }
        let binding = LoopBinding::new(format!("/dev/loop{}", state.next), file);
        state.next += 1;
        state.created += 1;
        state.bindings.push(binding.clone());
        Ok(binding)
    }

    fn destroy(&self, binding: &LoopBinding) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.bindings.retain(|b| b.device != binding.device);
        state.destroyed.push(binding.device.clone());
        Ok(())
    }
}

#[derive(Default)]
struct JobState {
    launched: Vec<JobSpec>,
    running: HashSet<String>,
    killed: Vec<String>,
    fail_launch: bool,
}

#[derive(Default)]
pub struct FakeJobs {
    state: Mutex<JobState>,
}

impl FakeJobs {
    pub fn set_running(&self, name: &str, running: bool) {
        let mut state = self.state.lock().unwrap();
        if running {
            state.running.insert(name.to_string());
        } else {
            state.running.remove(name);
        }
    }

    pub fn fail_launch(&self) {
        self.state.lock().unwrap().fail_launch = true;
    }

    pub fn launched(&self) -> Vec<JobSpec> {
        self.state.lock().unwrap().launched.clone()
    }

    pub fn killed(&self) -> Vec<String> {
        self.state.lock().unwrap().killed.clone()
    }
}

impl JobSupervisor for FakeJobs {
    fn launch(&self, spec: &JobSpec) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_launch {
            anyhow::bail!("fork failed");
        }
        state.launched.push(spec.clone());
        state.running.insert(spec.name.clone());
        Ok(())
    }

    fn is_running(&self, name: &str) -> Result<bool> {
        Ok(self.state.lock().unwrap().running.contains(name))
    }

    fn kill(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.running.remove(name) {
            state.killed.push(name.to_string());
        }
        Ok(())
    }
}

pub struct StaticMetadata(pub String);

impl VolumeMetadata for StaticMetadata {
    fn filesystem_type(&self, _agent: &str, _epoch: i64, _guid: &str) -> Result<String> {
        Ok(self.0.clone())
    }
}

/// Scratch directories plus fakes, wired the way the factory wires real services.
pub struct Harness {
    _dir: tempfile::TempDir,
    pub config: Arc<ResizeConfig>,
    pub runner: Arc<FakeRunner>,
    pub loops: Arc<FakeLoops>,
    pub jobs: Arc<FakeJobs>,
}

impl Harness {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = ResizeConfig {
            image_root: dir.path().join("images"),
            work_dir: dir.path().join("work"),
            helper_command: Some("snapresize-helper".to_string()),
            ..ResizeConfig::default()
        };
        std::fs::create_dir_all(&config.work_dir).unwrap();
        Self {
            _dir: dir,
            config: Arc::new(config),
            runner: Arc::new(FakeRunner::default()),
            loops: Arc::new(FakeLoops::default()),
            jobs: Arc::new(FakeJobs::default()),
        }
    }

    pub fn identity(&self) -> JobIdentity {
        JobIdentity::new("agent1", 1700000000, "vol-guid")
    }

    pub fn services(&self) -> ResizeServices {
        ResizeServices {
            config: self.config.clone(),
            runner: self.runner.clone(),
            loops: self.loops.clone(),
            jobs: self.jobs.clone(),
        }
    }

    pub fn base(&self) -> ResizerBase {
        ResizerBase::new(self.identity(), self.services())
    }

    pub fn base_files(&self) -> JobFiles {
        JobFiles::new(self.config.work_dir.clone(), &self.identity())
    }

    pub fn image_path(&self) -> PathBuf {
        self.identity().image_path(&self.config.image_root)
    }

    pub fn job_name(&self, kind: JobKind) -> String {
        self.base_files().job_name(kind)
    }

    pub fn write_output(&self, kind: JobKind, stdout: Option<&str>, stderr: Option<&str>) {
        let files = self.base_files();
        if let Some(out) = stdout {
            std::fs::write(files.stdout(kind), out).unwrap();
        }
        if let Some(err) = stderr {
            std::fs::write(files.stderr(kind), err).unwrap();
        }
    }
}

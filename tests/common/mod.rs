#![allow(dead_code)]

use anyhow::Result;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;

use snapresize::common::shell::shell_quote;
use snapresize::config::ResizeConfig;
use snapresize::jobs::ProcessSupervisor;
use snapresize::loopdev::{LoopBinding, LoopManager};
use snapresize::metadata::VolumeMetadata;
use snapresize::process::DuctRunner;
use snapresize::resize::ResizeServices;

pub struct TestEnvironment {
    temp_dir: TempDir,
}

impl TestEnvironment {
    pub fn new() -> Result<Self> {
        let temp_dir = tempfile::tempdir()?;
        std::fs::create_dir_all(temp_dir.path().join("work"))?;
        std::fs::create_dir_all(temp_dir.path().join("images"))?;
        Ok(Self { temp_dir })
    }

    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn work_dir(&self) -> PathBuf {
        self.path().join("work")
    }

    pub fn supervisor(&self) -> ProcessSupervisor {
        ProcessSupervisor::new(self.work_dir().join("jobs"))
    }

    /// Write an executable-by-sh script and return the command line that runs it.
    pub fn helper_script(&self, name: &str, body: &str) -> Result<String> {
        let path = self.path().join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n"))?;
        Ok(format!("sh {}", shell_quote(&path.to_string_lossy())))
    }

    pub fn config(&self, helper_command: Option<String>) -> ResizeConfig {
        ResizeConfig {
            image_root: self.path().join("images"),
            work_dir: self.work_dir(),
            helper_command,
            tool_timeout_secs: 10,
            ..ResizeConfig::default()
        }
    }

    /// Real runner and supervisor; loop devices are only pretended.
    pub fn services(&self, config: ResizeConfig) -> ResizeServices {
        ResizeServices {
            runner: Arc::new(DuctRunner::new(config.tool_timeout())),
            loops: Arc::new(MemoryLoops::default()),
            jobs: Arc::new(ProcessSupervisor::new(config.jobs_dir())),
            config: Arc::new(config),
        }
    }
}

/// Poll `check` until it returns true or `timeout` passes.
pub fn wait_until(timeout: Duration, mut check: impl FnMut() -> Result<bool>) -> Result<bool> {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check()? {
            return Ok(true);
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    check()
}

#[derive(Default)]
pub struct MemoryLoops {
    bindings: Mutex<Vec<LoopBinding>>,
}

impl MemoryLoops {
    pub fn active(&self) -> usize {
        self.bindings.lock().unwrap().len()
    }
}

impl LoopManager for MemoryLoops {
    fn find(&self, file: &Path) -> Result<Option<LoopBinding>> {
        Ok(self
            .bindings
            .lock()
            .unwrap()
            .iter()
            .find(|b| b.backing_file == file)
            .cloned())
    }

    fn create(&self, file: &Path, _scan_partitions: bool) -> Result<LoopBinding> {
        let mut bindings = self.bindings.lock().unwrap();
        let binding = LoopBinding::new(format!("/dev/loop{}", 100 + bindings.len()), file);
        bindings.push(binding.clone());
        Ok(binding)
    }

    fn destroy(&self, binding: &LoopBinding) -> Result<()> {
        self.bindings
            .lock()
            .unwrap()
            .retain(|b| b.device != binding.device);
        Ok(())
    }
}

pub struct FixedFilesystem(pub &'static str);

impl VolumeMetadata for FixedFilesystem {
    fn filesystem_type(&self, _agent: &str, _epoch: i64, _guid: &str) -> Result<String> {
        Ok(self.0.to_string())
    }
}

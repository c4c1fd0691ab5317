//! Job identity and the per-job file naming conventions.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// The (agent, snapshot, volume) tuple every resize job is keyed by.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobIdentity {
    pub agent_key: String,
    pub snapshot_epoch: i64,
    pub volume_guid: String,
    pub extension: Option<String>,
}

impl JobIdentity {
    pub fn new(agent_key: impl Into<String>, snapshot_epoch: i64, volume_guid: impl Into<String>) -> Self {
        Self {
            agent_key: agent_key.into(),
            snapshot_epoch,
            volume_guid: volume_guid.into(),
            extension: None,
        }
    }

    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = Some(extension.into());
        self
    }

    /// `<root>/<agent>/<epoch>/<guid>[.<ext>]`
    pub fn image_path(&self, root: &Path) -> PathBuf {
        let file = match &self.extension {
            Some(ext) => format!("{}.{}", self.volume_guid, ext),
            None => self.volume_guid.clone(),
        };
        root.join(&self.agent_key)
            .join(self.snapshot_epoch.to_string())
            .join(file)
    }

    /// Deterministic hex key. Fields are length-prefixed so that no two
    /// distinct tuples can produce the same digest input.
    pub fn hash(&self) -> String {
        let mut hasher = Sha256::new();
        let epoch = self.snapshot_epoch.to_string();
        let fields = [
            Some(self.agent_key.as_str()),
            Some(epoch.as_str()),
            Some(self.volume_guid.as_str()),
            self.extension.as_deref(),
        ];
        for field in fields {
            match field {
                Some(value) => {
                    hasher.update((value.len() as u64).to_le_bytes());
                    hasher.update(value.as_bytes());
                }
                None => hasher.update(u64::MAX.to_le_bytes()),
            }
        }
        hasher
            .finalize()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect()
    }
}

impl std::fmt::Display for JobIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}/{}", self.agent_key, self.snapshot_epoch, self.volume_guid)?;
        if let Some(ext) = &self.extension {
            write!(f, ".{ext}")?;
        }
        Ok(())
    }
}

/// The two kinds of background job a volume can have. They get separate
/// names and output files so one never clobbers the other's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Resize,
    MinimumSize,
}

/// Output, marker and lock file paths for one job identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFiles {
    dir: PathBuf,
    hash: String,
}

impl JobFiles {
    pub fn new(dir: impl Into<PathBuf>, identity: &JobIdentity) -> Self {
        Self {
            dir: dir.into(),
            hash: identity.hash(),
        }
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// Background job name: `H` for resizes, `H-minsize` for minimum size runs
    pub fn job_name(&self, kind: JobKind) -> String {
        match kind {
            JobKind::Resize => self.hash.clone(),
            JobKind::MinimumSize => format!("{}-minsize", self.hash),
        }
    }

    pub fn stdout(&self, kind: JobKind) -> PathBuf {
        self.dir.join(format!("{}.log", self.job_name(kind)))
    }

    pub fn stderr(&self, kind: JobKind) -> PathBuf {
        self.dir.join(format!("{}.stdErr", self.job_name(kind)))
    }

    /// "0 <device>" while this volume owes a loop cleanup, "1" once clean
    pub fn cleanup_marker(&self) -> PathBuf {
        self.dir.join(format!("{}.cleaned", self.hash))
    }

    pub fn lock(&self) -> PathBuf {
        self.dir.join(format!("{}.lock", self.hash))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

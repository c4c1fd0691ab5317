//! Snapshot volume metadata lookup.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeInfo {
    pub guid: String,
    /// Filesystem type as recorded at snapshot time, e.g. "NTFS" or "ext4"
    pub filesystem: String,
    #[serde(default)]
    pub mountpoint: Option<String>,
}

pub trait VolumeMetadata: Send + Sync {
    /// Recorded filesystem type of one volume in one snapshot.
    fn filesystem_type(&self, agent_key: &str, snapshot_epoch: i64, volume_guid: &str)
    -> Result<String>;
}

/// Reads `<root>/<agent>/<epoch>/volumes.json`, a JSON array of `VolumeInfo`.
#[derive(Debug, Clone)]
pub struct SnapshotMetadataStore {
    root: PathBuf,
}

impl SnapshotMetadataStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn volumes_file(&self, agent_key: &str, snapshot_epoch: i64) -> PathBuf {
        self.root
            .join(agent_key)
            .join(snapshot_epoch.to_string())
            .join("volumes.json")
    }

    pub fn volumes(&self, agent_key: &str, snapshot_epoch: i64) -> Result<Vec<VolumeInfo>> {
        let path = self.volumes_file(agent_key, snapshot_epoch);
        load_volumes(&path)
    }
}

fn load_volumes(path: &Path) -> Result<Vec<VolumeInfo>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading snapshot metadata {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("parsing snapshot metadata {}", path.display()))
}

impl VolumeMetadata for SnapshotMetadataStore {
    fn filesystem_type(
        &self,
        agent_key: &str,
        snapshot_epoch: i64,
        volume_guid: &str,
    ) -> Result<String> {
        let volumes = self.volumes(agent_key, snapshot_epoch)?;
        volumes
            .into_iter()
            .find(|v| v.guid.eq_ignore_ascii_case(volume_guid))
            .map(|v| v.filesystem)
            .with_context(|| {
                format!("Volume {volume_guid} not found in snapshot {agent_key}@{snapshot_epoch}")
            })
    }
}

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use super::base::{ResizeServices, ResizerBase};
use super::ext::ExtResizer;
use super::job::JobIdentity;
use super::ntfs::NtfsResizer;
use super::xfs::XfsResizer;
use super::Resizer;
use crate::config::ResizeConfig;
use crate::error::{ResizeError, Result};
use crate::jobs::ProcessSupervisor;
use crate::loopdev::Losetup;
use crate::metadata::{SnapshotMetadataStore, VolumeMetadata};
use crate::process::{DuctRunner, ProcessRunner};
use crate::ui::prelude::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum FilesystemType {
    Ext2,
    Ext3,
    Ext4,
    Ntfs,
    Xfs,
}

impl FilesystemType {
    pub fn as_str(self) -> &'static str {
        match self {
            FilesystemType::Ext2 => "ext2",
            FilesystemType::Ext3 => "ext3",
            FilesystemType::Ext4 => "ext4",
            FilesystemType::Ntfs => "ntfs",
            FilesystemType::Xfs => "xfs",
        }
    }

    pub fn is_ext(self) -> bool {
        matches!(
            self,
            FilesystemType::Ext2 | FilesystemType::Ext3 | FilesystemType::Ext4
        )
    }
}

impl fmt::Display for FilesystemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FilesystemType {
    type Err = ResizeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ext2" => Ok(FilesystemType::Ext2),
            "ext3" => Ok(FilesystemType::Ext3),
            "ext4" => Ok(FilesystemType::Ext4),
            "ntfs" => Ok(FilesystemType::Ntfs),
            "xfs" => Ok(FilesystemType::Xfs),
            _ => {
                emit(
                    Level::Error,
                    "resize.factory.unknown_filesystem",
                    &format!("No resizer for filesystem type '{s}'"),
                    None,
                );
                Err(ResizeError::UnknownFilesystem(s.to_string()))
            }
        }
    }
}

/// Builds the resizer matching a volume's recorded filesystem type.
#[derive(Clone)]
pub struct ResizerFactory {
    services: ResizeServices,
    metadata: Arc<dyn VolumeMetadata>,
}

impl ResizerFactory {
    pub fn new(services: ResizeServices, metadata: Arc<dyn VolumeMetadata>) -> Self {
        Self { services, metadata }
    }

    /// Real collaborators: duct for tools, losetup for loops, detached
    /// process groups for jobs, the JSON metadata tree for volume lookups.
    pub fn from_config(config: ResizeConfig) -> Self {
        let runner: Arc<dyn ProcessRunner> = Arc::new(DuctRunner::new(config.tool_timeout()));
        let services = ResizeServices {
            loops: Arc::new(Losetup::new(runner.clone())),
            runner,
            jobs: Arc::new(ProcessSupervisor::new(config.jobs_dir())),
            config: Arc::new(config),
        };
        let metadata = Arc::new(SnapshotMetadataStore::new(services.config.metadata_root()));
        Self::new(services, metadata)
    }

    pub fn services(&self) -> &ResizeServices {
        &self.services
    }

    /// Look up the volume's filesystem type and build its resizer.
    pub fn create(&self, identity: JobIdentity) -> Result<Box<dyn Resizer>> {
        let recorded = self
            .metadata
            .filesystem_type(
                &identity.agent_key,
                identity.snapshot_epoch,
                &identity.volume_guid,
            )
            .map_err(ResizeError::Metadata)?;
        let filesystem = recorded.parse()?;
        emit(
            Level::Debug,
            "resize.factory.selected",
            &format!("{identity} is {filesystem}"),
            None,
        );
        Ok(self.for_type(filesystem, identity))
    }

    /// Build a resizer for a filesystem type the caller already knows.
    pub fn for_type(&self, filesystem: FilesystemType, identity: JobIdentity) -> Box<dyn Resizer> {
        let base = ResizerBase::new(identity, self.services.clone());
        match filesystem {
            FilesystemType::Ext2 | FilesystemType::Ext3 | FilesystemType::Ext4 => {
                Box::new(ExtResizer::new(base, filesystem))
            }
            FilesystemType::Ntfs => Box::new(NtfsResizer::new(base)),
            FilesystemType::Xfs => Box::new(XfsResizer::new(base)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Harness, StaticMetadata};

    fn factory(h: &Harness, recorded: &str) -> ResizerFactory {
        ResizerFactory::new(h.services(), Arc::new(StaticMetadata(recorded.to_string())))
    }

    #[test]
    fn maps_recorded_types_case_insensitively() {
        let h = Harness::new();
        let cases = [
            ("ext2", FilesystemType::Ext2),
            ("EXT3", FilesystemType::Ext3),
            ("Ext4", FilesystemType::Ext4),
            ("NTFS", FilesystemType::Ntfs),
            ("xfs", FilesystemType::Xfs),
        ];
        for (recorded, expected) in cases {
            let resizer = factory(&h, recorded).create(h.identity()).unwrap();
            assert_eq!(resizer.filesystem(), expected, "{recorded}");
            assert_eq!(resizer.base().identity(), &h.identity());
        }
    }

    #[test]
    fn unknown_types_fail_fast() {
        let h = Harness::new();
        for recorded in ["btrfs", "", "ext"] {
            let err = factory(&h, recorded).create(h.identity()).err().unwrap();
            assert!(matches!(err, ResizeError::UnknownFilesystem(_)), "{recorded}");
            assert_eq!(err.code(), 1040);
        }
    }

    #[test]
    fn metadata_failures_are_wrapped() {
        struct Missing;
        impl VolumeMetadata for Missing {
            fn filesystem_type(&self, _: &str, _: i64, guid: &str) -> anyhow::Result<String> {
                anyhow::bail!("volume {guid} not found")
            }
        }

        let h = Harness::new();
        let err = ResizerFactory::new(h.services(), Arc::new(Missing))
            .create(h.identity())
            .err()
            .unwrap();
        assert_eq!(err.code(), 1050);
    }

    #[test]
    fn ext_family() {
        assert!(FilesystemType::Ext3.is_ext());
        assert!(!FilesystemType::Ntfs.is_ext());
        assert_eq!(FilesystemType::Ext4.to_string(), "ext4");
    }
}

use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::{info, warn};

/// Per-instance writable directories under `volumes/`, bind-mounted into
/// workloads at `/app/data`.
pub struct VolumeManager {
    base_path: PathBuf,
}

/// Fixed mount point inside every workload.
pub const VOLUME_MOUNT_POINT: &str = "/app/data";

impl VolumeManager {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub async fn create_volume(&self, instance_id: &str) -> Result<PathBuf> {
        let volume_path = self.base_path.join(instance_id);

        tokio::fs::create_dir_all(&volume_path)
            .await
            .context("Failed to create volume directory")?;

        info!("Created volume for instance {} at {:?}", instance_id, volume_path);
        Ok(volume_path)
    }

    pub async fn remove_volume(&self, instance_id: &str) -> Result<()> {
        let volume_path = self.base_path.join(instance_id);

        if volume_path.exists() {
            tokio::fs::remove_dir_all(&volume_path)
                .await
                .context("Failed to remove volume directory")?;
            info!("Removed volume for instance {} at {:?}", instance_id, volume_path);
        } else {
            warn!("Volume for instance {} not found at {:?}", instance_id, volume_path);
        }

        Ok(())
    }

    pub fn volume_path(&self, instance_id: &str) -> PathBuf {
        self.base_path.join(instance_id)
    }

    /// Total on-disk size of the volume in bytes, walking nested
    /// directories. A missing volume measures as zero.
    pub async fn volume_size_bytes(&self, instance_id: &str) -> Result<u64> {
        let root = self.base_path.join(instance_id);
        if !root.exists() {
            return Ok(0);
        }

        let mut size = 0u64;
        let mut pending = vec![root];

        while let Some(dir) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let metadata = entry.metadata().await?;
                if metadata.is_dir() {
                    pending.push(entry.path());
                } else if metadata.is_file() {
                    size += metadata.len();
                }
            }
        }

        Ok(size)
    }

    /// Volume size rounded up to whole MiB, the unit disk limits use.
    pub async fn volume_size_mib(&self, instance_id: &str) -> Result<u64> {
        let bytes = self.volume_size_bytes(instance_id).await?;
        Ok(bytes.div_ceil(1024 * 1024))
    }
}

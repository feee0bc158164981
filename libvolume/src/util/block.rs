//! Symlink bookkeeping for raw block volumes.
//!
//! A mapped block volume is exposed as symlinks to its device: one per pod
//! under the volume's global map directory (named after the pod UID) and one
//! inside the pod's own volume directory.

use std::path::Path;

use async_trait::async_trait;
use tracing::debug;

use crate::error::VolumeError;

/// Creates and removes device symlinks for block volumes.
#[async_trait]
pub trait BlockVolumePathHandler: Send + Sync {
    /// Link `map_dir/link_name` to `device_path`, creating `map_dir`.
    async fn map_device(
        &self,
        device_path: &str,
        map_dir: &str,
        link_name: &str,
    ) -> Result<(), VolumeError>;

    /// Remove `map_dir/link_name`. A missing link is not an error.
    async fn unmap_device(&self, map_dir: &str, link_name: &str) -> Result<(), VolumeError>;

    /// Links under `map_dir` that still point at `device_path`. With an
    /// empty `device_path` every link counts.
    async fn get_device_symlink_refs(
        &self,
        device_path: &str,
        map_dir: &str,
    ) -> Result<Vec<String>, VolumeError>;
}

/// [`BlockVolumePathHandler`] working on the local filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct LinuxBlockPathHandler;

impl LinuxBlockPathHandler {
    /// Create a handler.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl BlockVolumePathHandler for LinuxBlockPathHandler {
    async fn map_device(
        &self,
        device_path: &str,
        map_dir: &str,
        link_name: &str,
    ) -> Result<(), VolumeError> {
        if device_path.is_empty() {
            return Err(VolumeError::InvalidArgument("device path is empty".into()));
        }
        tokio::fs::create_dir_all(map_dir)
            .await
            .map_err(|e| VolumeError::io(map_dir, e))?;

        let link = Path::new(map_dir).join(link_name);
        match tokio::fs::read_link(&link).await {
            Ok(existing) if existing == Path::new(device_path) => {
                debug!(link = %link.display(), "device link already in place");
                return Ok(());
            }
            Ok(_) => {
                tokio::fs::remove_file(&link)
                    .await
                    .map_err(|e| VolumeError::io(link.to_string_lossy(), e))?;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(VolumeError::io(link.to_string_lossy(), e)),
        }

        tokio::fs::symlink(device_path, &link)
            .await
            .map_err(|e| VolumeError::io(link.to_string_lossy(), e))?;
        debug!(link = %link.display(), %device_path, "device link created");
        Ok(())
    }

    async fn unmap_device(&self, map_dir: &str, link_name: &str) -> Result<(), VolumeError> {
        let link = Path::new(map_dir).join(link_name);
        match tokio::fs::remove_file(&link).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(VolumeError::io(link.to_string_lossy(), e)),
        }
    }

    async fn get_device_symlink_refs(
        &self,
        device_path: &str,
        map_dir: &str,
    ) -> Result<Vec<String>, VolumeError> {
        let mut dir = match tokio::fs::read_dir(map_dir).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(VolumeError::io(map_dir, e)),
        };

        let mut refs = Vec::new();
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| VolumeError::io(map_dir, e))?
        {
            let path = entry.path();
            if let Ok(target) = tokio::fs::read_link(&path).await {
                if device_path.is_empty() || target == Path::new(device_path) {
                    refs.push(path.to_string_lossy().into_owned());
                }
            }
        }
        refs.sort();
        Ok(refs)
    }
}

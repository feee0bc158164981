//! Raw block volumes: map, unmap and device release.
//!
//! A mapped volume is exposed through two device symlinks: one under the
//! volume's global map path named after the pod UID, and one in the pod's
//! own device directory. The global links double as the reference count
//! checked before the device is released.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, instrument};

use crate::error::VolumeError;
use crate::node_client::NodeClient;
use crate::plugin::{Attacher, BlockVolumeMapper, BlockVolumeUnmapper, VolumeAttributes};
use crate::recorder::{EventRecorder, reason};
use crate::state::{ActualStateUpdater, MarkVolumeMountedOpts};
use crate::types::{AttachedVolume, MountedVolume, OperationMessages, VolumeMode, VolumeToMount};
use crate::util::block::BlockVolumePathHandler;
use crate::util::mount::MountInterface;

use super::mount::pod_ref_from_uid;
use super::{
    Operation, OperationGenerator, block_capability, check_node_affinity, log_state_update,
    node_object_ref, report_failure, wait_for_attach,
};

/// Maps a raw block volume into a pod.
pub struct MapVolumeOperation {
    volume: VolumeToMount,
    plugin_name: String,
    mapper: Box<dyn BlockVolumeMapper>,
    attacher: Option<Box<dyn Attacher>>,
    wait_for_attach_timeout: Duration,
    node_client: Arc<dyn NodeClient>,
    recorder: Arc<dyn EventRecorder>,
    block_path_handler: Arc<dyn BlockVolumePathHandler>,
    asw: Arc<dyn ActualStateUpdater>,
}

impl MapVolumeOperation {
    fn fail(&self, prefix: &str, err: VolumeError) -> VolumeError {
        report_failure(
            self.recorder.as_ref(),
            &[self.volume.pod.object_ref()],
            &self.volume,
            reason::FAILED_MAP_VOLUME,
            prefix,
            err,
        )
    }

    fn map_failed(&self, reason: impl ToString) -> VolumeError {
        VolumeError::MapFailed {
            volume: self.volume.volume_name.clone(),
            reason: reason.to_string(),
        }
    }

    async fn device_path(&self) -> Result<String, VolumeError> {
        match &self.attacher {
            Some(attacher) => {
                wait_for_attach(attacher.as_ref(), &self.volume, self.wait_for_attach_timeout)
                    .await
                    .map_err(|e| self.fail("MapVolume.WaitForAttach failed", e))
            }
            None => self
                .mapper
                .set_up_device()
                .await
                .map_err(|e| self.fail("MapVolume.SetUpDevice failed", self.map_failed(e))),
        }
    }
}

#[async_trait]
impl Operation for MapVolumeOperation {
    fn name(&self) -> &'static str {
        "map_volume"
    }

    #[instrument(skip_all, fields(volume = %self.volume.volume_name, pod = %self.volume.pod_name))]
    async fn execute(&self) -> Result<(), VolumeError> {
        let volume = &self.volume;

        check_node_affinity(
            self.node_client.as_ref(),
            &volume.volume_name,
            &volume.volume_spec,
            &volume.node_name,
        )
        .await
        .map_err(|e| self.fail("MapVolume.NodeAffinity check failed", e))?;

        let device_path = self.device_path().await?;
        if device_path.is_empty() {
            let err = self.map_failed("device path of the volume is empty");
            return Err(self.fail("MapVolume failed", err));
        }

        let global_map_path = self
            .mapper
            .global_map_path(&volume.volume_spec)
            .map_err(|e| self.fail("MapVolume.GetGlobalMapPath failed", self.map_failed(e)))?;
        self.block_path_handler
            .map_device(&device_path, &global_map_path, &volume.pod.uid)
            .await
            .map_err(|e| self.fail("MapVolume.MapDevice failed", self.map_failed(e)))?;

        let (pod_map_dir, link_name) = self.mapper.pod_device_map_path();
        self.block_path_handler
            .map_device(&device_path, &pod_map_dir, &link_name)
            .await
            .map_err(|e| self.fail("MapVolume.MapDevice failed", self.map_failed(e)))?;

        let (_, detailed) = volume.generate_msg(
            "MapVolume.MapDevice succeeded",
            &format!("device path {device_path:?}"),
        );
        info!("{detailed}");

        log_state_update(
            "MarkDeviceAsMounted",
            self.asw.mark_device_as_mounted(&volume.volume_name),
        );
        log_state_update(
            "MarkVolumeAsMounted",
            self.asw.mark_volume_as_mounted(MarkVolumeMountedOpts {
                pod_name: volume.pod_name.clone(),
                pod_uid: volume.pod.uid.clone(),
                volume_name: volume.volume_name.clone(),
                plugin_name: self.plugin_name.clone(),
                attributes: VolumeAttributes {
                    read_only: volume.volume_spec.read_only,
                    ..Default::default()
                },
                outer_volume_spec_name: volume.outer_volume_spec_name.clone(),
                volume_gid_value: volume.volume_gid_value.clone(),
                volume_mode: VolumeMode::Block,
            }),
        );
        Ok(())
    }
}

/// Removes a pod's device links to a raw block volume.
pub struct UnmapVolumeOperation {
    volume: MountedVolume,
    unmapper: Box<dyn BlockVolumeUnmapper>,
    recorder: Arc<dyn EventRecorder>,
    block_path_handler: Arc<dyn BlockVolumePathHandler>,
    asw: Arc<dyn ActualStateUpdater>,
}

impl UnmapVolumeOperation {
    async fn unmap(&self) -> Result<(), VolumeError> {
        let volume = &self.volume;
        let (pod_map_dir, link_name) = self.unmapper.pod_device_map_path();
        self.block_path_handler
            .unmap_device(&pod_map_dir, &link_name)
            .await?;
        let global_map_path = self.unmapper.global_map_path(&volume.volume_spec)?;
        self.block_path_handler
            .unmap_device(&global_map_path, &volume.pod_uid)
            .await
    }
}

#[async_trait]
impl Operation for UnmapVolumeOperation {
    fn name(&self) -> &'static str {
        "unmap_volume"
    }

    #[instrument(skip_all, fields(volume = %self.volume.volume_name, pod = %self.volume.pod_name))]
    async fn execute(&self) -> Result<(), VolumeError> {
        let volume = &self.volume;
        self.unmap().await.map_err(|e| {
            let err = VolumeError::UnmapFailed {
                volume: volume.volume_name.clone(),
                reason: e.to_string(),
            };
            report_failure(
                self.recorder.as_ref(),
                &[pod_ref_from_uid(&volume.pod_uid)],
                volume,
                reason::FAILED_UNMOUNT_VOLUME,
                "UnmapVolume.UnmapDevice failed",
                err,
            )
        })?;

        let (_, detailed) = volume.generate_msg("UnmapVolume succeeded", "");
        info!("{detailed}");
        log_state_update(
            "MarkVolumeAsUnmounted",
            self.asw
                .mark_volume_as_unmounted(&volume.pod_name, &volume.volume_name),
        );
        Ok(())
    }
}

/// Releases a raw block device once no pod links to it.
pub struct UnmapDeviceOperation {
    volume: AttachedVolume,
    unmapper: Box<dyn BlockVolumeUnmapper>,
    recorder: Arc<dyn EventRecorder>,
    block_path_handler: Arc<dyn BlockVolumePathHandler>,
    host_mounter: Arc<dyn MountInterface>,
    asw: Arc<dyn ActualStateUpdater>,
}

impl UnmapDeviceOperation {
    fn fail(&self, prefix: &str, err: VolumeError) -> VolumeError {
        report_failure(
            self.recorder.as_ref(),
            &[node_object_ref(&self.volume.node_name)],
            &self.volume,
            reason::FAILED_UNMAP_DEVICE,
            prefix,
            err,
        )
    }

    fn unmap_failed(&self, reason: impl ToString) -> VolumeError {
        VolumeError::UnmapFailed {
            volume: self.volume.volume_name.clone(),
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl Operation for UnmapDeviceOperation {
    fn name(&self) -> &'static str {
        "unmap_device"
    }

    #[instrument(skip_all, fields(volume = %self.volume.volume_name, node = %self.volume.node_name))]
    async fn execute(&self) -> Result<(), VolumeError> {
        let volume = &self.volume;
        let global_map_path = self
            .unmapper
            .global_map_path(&volume.volume_spec)
            .map_err(|e| self.fail("UnmapDevice.GetGlobalMapPath failed", self.unmap_failed(e)))?;

        let refs = self
            .block_path_handler
            .get_device_symlink_refs(&volume.device_path, &global_map_path)
            .await
            .map_err(|e| self.fail("UnmapDevice.GetDeviceSymlinkRefs check failed", e))?;
        if !refs.is_empty() {
            let err = VolumeError::StillReferenced {
                volume: volume.volume_name.clone(),
                references: refs,
            };
            return Err(self.fail("UnmapDevice failed", err));
        }

        self.unmapper
            .tear_down_device(&global_map_path, &volume.device_path)
            .await
            .map_err(|e| self.fail("UnmapDevice.TearDownDevice failed", self.unmap_failed(e)))?;

        if !volume.device_path.is_empty() {
            let opened = self
                .host_mounter
                .device_opened(&volume.device_path)
                .await
                .map_err(|e| self.fail("UnmapDevice.DeviceOpened check failed", e))?;
            if opened {
                let err = VolumeError::DeviceStillOpen {
                    volume: volume.volume_name.clone(),
                    device_path: volume.device_path.clone(),
                };
                return Err(self.fail("UnmapDevice failed", err));
            }
        }

        let (_, detailed) = volume.generate_msg("UnmapDevice succeeded", "");
        info!("{detailed}");
        log_state_update(
            "MarkDeviceAsUnmounted",
            self.asw.mark_device_as_unmounted(&volume.volume_name),
        );
        Ok(())
    }
}

impl OperationGenerator {
    /// Map the raw block `volume` into its pod.
    pub fn generate_map_volume(
        &self,
        volume: VolumeToMount,
        wait_for_attach_timeout: Duration,
        asw: Arc<dyn ActualStateUpdater>,
    ) -> Result<Box<dyn Operation>, VolumeError> {
        let plugin = self
            .plugin_mgr
            .find_block_plugin_by_spec(&volume.volume_spec)?;
        let mapper = block_capability(plugin.as_ref())?
            .new_block_volume_mapper(&volume.volume_spec, &volume.pod)?;
        let attacher = match plugin.as_attachable() {
            Some(attachable) => Some(attachable.new_attacher()?),
            None => None,
        };
        Ok(Box::new(MapVolumeOperation {
            plugin_name: plugin.name().to_owned(),
            volume,
            mapper,
            attacher,
            wait_for_attach_timeout,
            node_client: Arc::clone(&self.node_client),
            recorder: Arc::clone(&self.recorder),
            block_path_handler: Arc::clone(&self.block_path_handler),
            asw,
        }))
    }

    /// Remove the pod's links to the raw block `volume`.
    pub fn generate_unmap_volume(
        &self,
        volume: MountedVolume,
        asw: Arc<dyn ActualStateUpdater>,
    ) -> Result<Box<dyn Operation>, VolumeError> {
        let plugin = self.plugin_mgr.find_block_plugin_by_name(&volume.plugin_name)?;
        let unmapper = block_capability(plugin.as_ref())?
            .new_block_volume_unmapper(&volume.inner_volume_spec_name, &volume.pod_uid)?;
        Ok(Box::new(UnmapVolumeOperation {
            volume,
            unmapper,
            recorder: Arc::clone(&self.recorder),
            block_path_handler: Arc::clone(&self.block_path_handler),
            asw,
        }))
    }

    /// Release the device of the raw block `volume`.
    pub fn generate_unmap_device(
        &self,
        volume: AttachedVolume,
        asw: Arc<dyn ActualStateUpdater>,
    ) -> Result<Box<dyn Operation>, VolumeError> {
        let plugin = self
            .plugin_mgr
            .find_block_plugin_by_spec(&volume.volume_spec)?;
        let unmapper = block_capability(plugin.as_ref())?
            .new_block_volume_unmapper(&volume.volume_spec.name, "")?;
        Ok(Box::new(UnmapDeviceOperation {
            volume,
            unmapper,
            recorder: Arc::clone(&self.recorder),
            block_path_handler: Arc::clone(&self.block_path_handler),
            host_mounter: Arc::clone(&self.mounter),
            asw,
        }))
    }
}

//! Filesystem mount, unmount and global device unmount.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, instrument};

use crate::error::VolumeError;
use crate::node_client::NodeClient;
use crate::plugin::{Attacher, Detacher, Mounter, Unmounter};
use crate::recorder::{EventRecorder, EventType, reason};
use crate::state::{ActualStateUpdater, MarkVolumeMountedOpts};
use crate::types::{
    AttachedVolume, MountedVolume, ObjectReference, OperationMessages, VolumeMode, VolumeToMount,
};
use crate::util::mount::MountInterface;

use super::{
    Operation, OperationGenerator, attach_capability, check_mount_option_support,
    check_node_affinity, log_state_update, report_failure, wait_for_attach,
};

/// Mounts a filesystem volume for a pod: waits for the device, mounts it at
/// its global path, then sets the pod-scoped mount up.
pub struct MountVolumeOperation {
    volume: VolumeToMount,
    plugin_name: String,
    mounter: Box<dyn Mounter>,
    attacher: Option<Box<dyn Attacher>>,
    wait_for_attach_timeout: Duration,
    check_node_capabilities: bool,
    node_client: Arc<dyn NodeClient>,
    recorder: Arc<dyn EventRecorder>,
    host_mounter: Arc<dyn MountInterface>,
    asw: Arc<dyn ActualStateUpdater>,
}

impl MountVolumeOperation {
    fn fail(&self, prefix: &str, err: VolumeError) -> VolumeError {
        report_failure(
            self.recorder.as_ref(),
            &[self.volume.pod.object_ref()],
            &self.volume,
            reason::FAILED_MOUNT_VOLUME,
            prefix,
            err,
        )
    }

    async fn mount_device(&self, attacher: &dyn Attacher) -> Result<(), VolumeError> {
        let volume = &self.volume;
        let device_path = wait_for_attach(attacher, volume, self.wait_for_attach_timeout)
            .await
            .map_err(|e| self.fail("MountVolume.WaitForAttach failed", e))?;

        let device_mount_path = attacher
            .get_device_mount_path(&volume.volume_spec)
            .map_err(|e| {
                let err = VolumeError::DeviceMountFailed {
                    volume: volume.volume_name.clone(),
                    path: String::new(),
                    reason: e.to_string(),
                };
                self.fail("MountVolume.GetDeviceMountPath failed", err)
            })?;

        attacher
            .mount_device(&volume.volume_spec, &device_path, &device_mount_path)
            .await
            .map_err(|e| {
                let err = VolumeError::DeviceMountFailed {
                    volume: volume.volume_name.clone(),
                    path: device_mount_path.clone(),
                    reason: e.to_string(),
                };
                self.fail("MountVolume.MountDevice failed", err)
            })?;

        let (_, detailed) = volume.generate_msg(
            "MountVolume.MountDevice succeeded",
            &format!("device mount path {device_mount_path:?}"),
        );
        info!("{detailed}");
        log_state_update(
            "MarkDeviceAsMounted",
            self.asw.mark_device_as_mounted(&volume.volume_name),
        );

        if self.asw.fs_resize_required(&volume.volume_name) {
            self.resize_file_system(&device_path, &device_mount_path)
                .await?;
        }
        Ok(())
    }

    async fn resize_file_system(
        &self,
        device_path: &str,
        device_mount_path: &str,
    ) -> Result<(), VolumeError> {
        let pod = self.volume.pod.object_ref();
        let resized = self
            .host_mounter
            .resize_fs(device_path, device_mount_path)
            .await
            .map_err(|e| {
                report_failure(
                    self.recorder.as_ref(),
                    std::slice::from_ref(&pod),
                    &self.volume,
                    reason::FILE_SYSTEM_RESIZE_FAILED,
                    "MountVolume.resizeFileSystem failed",
                    e,
                )
            })?;
        if resized {
            let (simple, detailed) = self
                .volume
                .generate_msg("MountVolume.resizeFileSystem succeeded", "");
            info!("{detailed}");
            self.recorder.event(
                &pod,
                EventType::Normal,
                reason::FILE_SYSTEM_RESIZE_SUCCESSFUL,
                &simple,
            );
        } else {
            debug!(%device_path, "no filesystem on device, nothing to resize");
        }
        log_state_update(
            "MarkFsResized",
            self.asw.mark_fs_resized(&self.volume.volume_name),
        );
        Ok(())
    }
}

#[async_trait]
impl Operation for MountVolumeOperation {
    fn name(&self) -> &'static str {
        "volume_mount"
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
        .map_err(|e| self.fail("MountVolume.NodeAffinity check failed", e))?;

        if let Some(attacher) = &self.attacher {
            self.mount_device(attacher.as_ref()).await?;
        }

        if self.check_node_capabilities {
            self.mounter.can_mount().await.map_err(|e| {
                let err = VolumeError::CannotMount {
                    volume: volume.volume_name.clone(),
                    reason: e.to_string(),
                };
                self.fail("MountVolume.CanMount failed", err)
            })?;
        }

        self.mounter
            .set_up(volume.pod.fs_group)
            .await
            .map_err(|e| {
                let err = VolumeError::SetupFailed {
                    volume: volume.volume_name.clone(),
                    pod: volume.pod.name.clone(),
                    reason: e.to_string(),
                };
                self.fail("MountVolume.SetUp failed", err)
            })?;

        let (simple, detailed) = volume.generate_msg("MountVolume.SetUp succeeded", "");
        info!(path = %self.mounter.get_path(), "{detailed}");
        if !volume.remount {
            self.recorder.event(
                &volume.pod.object_ref(),
                EventType::Normal,
                reason::SUCCESSFUL_MOUNT_VOLUME,
                &simple,
            );
        }

        log_state_update(
            "MarkVolumeAsMounted",
            self.asw.mark_volume_as_mounted(MarkVolumeMountedOpts {
                pod_name: volume.pod_name.clone(),
                pod_uid: volume.pod.uid.clone(),
                volume_name: volume.volume_name.clone(),
                plugin_name: self.plugin_name.clone(),
                attributes: self.mounter.get_attributes(),
                outer_volume_spec_name: volume.outer_volume_spec_name.clone(),
                volume_gid_value: volume.volume_gid_value.clone(),
                volume_mode: VolumeMode::Filesystem,
            }),
        );
        Ok(())
    }
}

/// Tears down the pod-scoped mount of a volume.
pub struct UnmountVolumeOperation {
    volume: MountedVolume,
    unmounter: Box<dyn Unmounter>,
    recorder: Arc<dyn EventRecorder>,
    asw: Arc<dyn ActualStateUpdater>,
}

/// Event target for a pod known only by UID.
pub(super) fn pod_ref_from_uid(uid: &str) -> ObjectReference {
    ObjectReference {
        kind: "Pod".to_owned(),
        namespace: String::new(),
        name: uid.to_owned(),
        uid: uid.to_owned(),
    }
}

#[async_trait]
impl Operation for UnmountVolumeOperation {
    fn name(&self) -> &'static str {
        "volume_unmount"
    }

    #[instrument(skip_all, fields(volume = %self.volume.volume_name, pod = %self.volume.pod_name))]
    async fn execute(&self) -> Result<(), VolumeError> {
        let volume = &self.volume;
        self.unmounter.tear_down().await.map_err(|e| {
            let err = VolumeError::TeardownFailed {
                volume: volume.volume_name.clone(),
                pod: volume.pod_name.to_string(),
                reason: e.to_string(),
            };
            report_failure(
                self.recorder.as_ref(),
                &[pod_ref_from_uid(&volume.pod_uid)],
                volume,
                reason::FAILED_UNMOUNT_VOLUME,
                "UnmountVolume.TearDown failed",
                err,
            )
        })?;

        let (_, detailed) = volume.generate_msg("UnmountVolume.TearDown succeeded", "");
        info!(path = %self.unmounter.get_path(), "{detailed}");
        log_state_update(
            "MarkVolumeAsUnmounted",
            self.asw
                .mark_volume_as_unmounted(&volume.pod_name, &volume.volume_name),
        );
        Ok(())
    }
}

/// Unmounts a device from its global mount path once no pod uses it.
pub struct UnmountDeviceOperation {
    volume: AttachedVolume,
    attacher: Box<dyn Attacher>,
    detacher: Box<dyn Detacher>,
    recorder: Arc<dyn EventRecorder>,
    host_mounter: Arc<dyn MountInterface>,
    asw: Arc<dyn ActualStateUpdater>,
}

impl UnmountDeviceOperation {
    fn fail(&self, prefix: &str, err: VolumeError) -> VolumeError {
        report_failure(
            self.recorder.as_ref(),
            &[],
            &self.volume,
            reason::FAILED_UNMOUNT_VOLUME,
            prefix,
            err,
        )
    }
}

#[async_trait]
impl Operation for UnmountDeviceOperation {
    fn name(&self) -> &'static str {
        "unmount_device"
    }

    #[instrument(skip_all, fields(volume = %self.volume.volume_name, node = %self.volume.node_name))]
    async fn execute(&self) -> Result<(), VolumeError> {
        let volume = &self.volume;
        let device_mount_path = self
            .attacher
            .get_device_mount_path(&volume.volume_spec)
            .map_err(|e| {
                let err = VolumeError::UnmountDeviceFailed {
                    volume: volume.volume_name.clone(),
                    reason: e.to_string(),
                };
                self.fail("UnmountDevice.GetDeviceMountPath failed", err)
            })?;

        // Check-then-act: a bind mount created after this check is not seen.
        let refs = self
            .host_mounter
            .get_mount_refs(&device_mount_path)
            .await
            .map_err(|e| self.fail("UnmountDevice.GetDeviceMountRefs check failed", e))?;
        if !refs.is_empty() {
            let err = VolumeError::StillReferenced {
                volume: volume.volume_name.clone(),
                references: refs,
            };
            return Err(self.fail("UnmountDevice failed", err));
        }

        self.detacher
            .unmount_device(&device_mount_path)
            .await
            .map_err(|e| {
                let err = VolumeError::UnmountDeviceFailed {
                    volume: volume.volume_name.clone(),
                    reason: e.to_string(),
                };
                self.fail("UnmountDevice failed", err)
            })?;

        if !volume.device_path.is_empty() {
            let opened = self
                .host_mounter
                .device_opened(&volume.device_path)
                .await
                .map_err(|e| self.fail("UnmountDevice.DeviceOpened check failed", e))?;
            if opened {
                let err = VolumeError::DeviceStillOpen {
                    volume: volume.volume_name.clone(),
                    device_path: volume.device_path.clone(),
                };
                return Err(self.fail("UnmountDevice failed", err));
            }
        }

        let (_, detailed) = volume.generate_msg(
            "UnmountDevice succeeded",
            &format!("device mount path {device_mount_path:?}"),
        );
        info!("{detailed}");
        log_state_update(
            "MarkDeviceAsUnmounted",
            self.asw.mark_device_as_unmounted(&volume.volume_name),
        );
        Ok(())
    }
}

impl OperationGenerator {
    /// Mount `volume` for its pod. `wait_for_attach_timeout` bounds the wait
    /// for the device of attachable volumes.
    ///
    /// Mount options requested from a plugin that does not take them are a
    /// configuration error: an `UnsupportedMountOption` event is recorded and
    /// no operation is produced.
    pub fn generate_mount_volume(
        &self,
        volume: VolumeToMount,
        wait_for_attach_timeout: Duration,
        asw: Arc<dyn ActualStateUpdater>,
    ) -> Result<Box<dyn Operation>, VolumeError> {
        let plugin = self.plugin_mgr.find_plugin_by_spec(&volume.volume_spec)?;

        check_mount_option_support(
            plugin.name(),
            plugin.supports_mount_option(),
            &volume.volume_spec,
        )
        .map_err(|e| {
            report_failure(
                self.recorder.as_ref(),
                &[volume.pod.object_ref()],
                &volume,
                reason::UNSUPPORTED_MOUNT_OPTION,
                "MountVolume.MountOptions check failed",
                e,
            )
        })?;

        let mounter = plugin.new_mounter(&volume.volume_spec, &volume.pod)?;
        let attacher = match plugin.as_attachable() {
            Some(attachable) => Some(attachable.new_attacher()?),
            None => None,
        };

        Ok(Box::new(MountVolumeOperation {
            plugin_name: plugin.name().to_owned(),
            volume,
            mounter,
            attacher,
            wait_for_attach_timeout,
            check_node_capabilities: self.check_node_capabilities_before_mount,
            node_client: Arc::clone(&self.node_client),
            recorder: Arc::clone(&self.recorder),
            host_mounter: Arc::clone(&self.mounter),
            asw,
        }))
    }

    /// Tear down the pod-scoped mount of `volume`.
    pub fn generate_unmount_volume(
        &self,
        volume: MountedVolume,
        asw: Arc<dyn ActualStateUpdater>,
    ) -> Result<Box<dyn Operation>, VolumeError> {
        let plugin = self.plugin_mgr.find_plugin_by_name(&volume.plugin_name)?;
        let unmounter = plugin.new_unmounter(&volume.inner_volume_spec_name, &volume.pod_uid)?;
        Ok(Box::new(UnmountVolumeOperation {
            volume,
            unmounter,
            recorder: Arc::clone(&self.recorder),
            asw,
        }))
    }

    /// Unmount the device of `volume` from its global mount path.
    pub fn generate_unmount_device(
        &self,
        volume: AttachedVolume,
        asw: Arc<dyn ActualStateUpdater>,
    ) -> Result<Box<dyn Operation>, VolumeError> {
        let plugin = self
            .plugin_mgr
            .find_attachable_plugin_by_spec(&volume.volume_spec)?;
        let attachable = attach_capability(plugin.as_ref())?;
        let attacher = attachable.new_attacher()?;
        let detacher = attachable.new_detacher()?;
        Ok(Box::new(UnmountDeviceOperation {
            volume,
            attacher,
            detacher,
            recorder: Arc::clone(&self.recorder),
            host_mounter: Arc::clone(&self.mounter),
            asw,
        }))
    }
}

//! Attach, detach and attach verification.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use crate::error::VolumeError;
use crate::node_client::NodeClient;
use crate::plugin::{Attacher, Detacher, VolumePlugin, VolumePluginMgr};
use crate::recorder::{EventRecorder, reason};
use crate::state::ActualStateUpdater;
use crate::types::{AttachedVolume, NodeName, OperationMessages, PodRef, VolumeToAttach, VolumeToMount};

use super::{
    Operation, OperationGenerator, attach_capability, log_state_update, node_object_ref,
    report_failure,
};

/// Attaches a volume to a node.
pub struct AttachVolumeOperation {
    volume: VolumeToAttach,
    attacher: Box<dyn Attacher>,
    recorder: Arc<dyn EventRecorder>,
    asw: Arc<dyn ActualStateUpdater>,
}

#[async_trait]
impl Operation for AttachVolumeOperation {
    fn name(&self) -> &'static str {
        "volume_attach"
    }

    #[instrument(skip_all, fields(volume = %self.volume.volume_name, node = %self.volume.node_name))]
    async fn execute(&self) -> Result<(), VolumeError> {
        let device_path = self
            .attacher
            .attach(&self.volume.volume_spec, &self.volume.node_name)
            .await
            .map_err(|e| {
                let err = VolumeError::AttachFailed {
                    volume: self.volume.volume_name.clone(),
                    node: self.volume.node_name.clone(),
                    reason: e.to_string(),
                };
                let pods: Vec<_> = self
                    .volume
                    .scheduled_pods
                    .iter()
                    .map(PodRef::object_ref)
                    .collect();
                report_failure(
                    self.recorder.as_ref(),
                    &pods,
                    &self.volume,
                    reason::FAILED_ATTACH_VOLUME,
                    "AttachVolume.Attach failed",
                    err,
                )
            })?;

        let (_, detailed) = self.volume.generate_msg("AttachVolume.Attach succeeded", "");
        info!(%device_path, "{detailed}");

        log_state_update(
            "MarkVolumeAsAttached",
            self.asw.mark_volume_as_attached(
                &self.volume.volume_name,
                &self.volume.volume_spec,
                &self.volume.node_name,
                &device_path,
            ),
        );
        Ok(())
    }
}

/// Detaches a volume from a node, optionally checking node status first.
pub struct DetachVolumeOperation {
    volume: AttachedVolume,
    plugin_volume_name: String,
    detacher: Box<dyn Detacher>,
    verify_safe_to_detach: bool,
    node_client: Arc<dyn NodeClient>,
    recorder: Arc<dyn EventRecorder>,
    asw: Arc<dyn ActualStateUpdater>,
}

impl DetachVolumeOperation {
    /// Refuse to detach while node status still lists the volume in
    /// `VolumesInUse`. A node that no longer exists cannot use the volume.
    async fn verify_volume_is_safe_to_detach(&self) -> Result<(), VolumeError> {
        let node = &self.volume.node_name;
        let node_obj = match self.node_client.get_node(node).await {
            Ok(Some(n)) => n,
            Ok(None) => {
                info!(%node, "node not found, skipping safe-to-detach check");
                return Ok(());
            }
            Err(e @ VolumeError::NodeUnavailable { .. }) => return Err(e),
            Err(e) => {
                return Err(VolumeError::NodeUnavailable {
                    node: node.clone(),
                    reason: e.to_string(),
                });
            }
        };

        if node_obj
            .status
            .volumes_in_use
            .contains(&self.volume.volume_name)
        {
            return Err(VolumeError::StillReferenced {
                volume: self.volume.volume_name.clone(),
                references: vec![format!("node {node} status.volumesInUse")],
            });
        }
        debug!(%node, "volume is safe to detach");
        Ok(())
    }

    async fn detach(&self) -> Result<(), VolumeError> {
        let node = &self.volume.node_name;
        if self.verify_safe_to_detach {
            self.verify_volume_is_safe_to_detach().await.map_err(|e| {
                report_failure(
                    self.recorder.as_ref(),
                    &[node_object_ref(node)],
                    &self.volume,
                    reason::FAILED_DETACH_VOLUME,
                    "DetachVolume.Detach failed",
                    e,
                )
            })?;
        }

        self.detacher
            .detach(&self.plugin_volume_name, node)
            .await
            .map_err(|e| {
                let err = VolumeError::DetachFailed {
                    volume: self.volume.volume_name.clone(),
                    node: node.clone(),
                    reason: e.to_string(),
                };
                report_failure(
                    self.recorder.as_ref(),
                    &[node_object_ref(node)],
                    &self.volume,
                    reason::FAILED_DETACH_VOLUME,
                    "DetachVolume.Detach failed",
                    err,
                )
            })
    }
}

#[async_trait]
impl Operation for DetachVolumeOperation {
    fn name(&self) -> &'static str {
        "volume_detach"
    }

    #[instrument(skip_all, fields(volume = %self.volume.volume_name, node = %self.volume.node_name))]
    async fn execute(&self) -> Result<(), VolumeError> {
        let name = &self.volume.volume_name;
        let node = &self.volume.node_name;

        // Node status must stop listing the volume before it goes away.
        log_state_update(
            "RemoveVolumeFromReportAsAttached",
            self.asw.remove_volume_from_report_as_attached(name, node),
        );

        if let Err(err) = self.detach().await {
            self.asw.add_volume_to_report_as_attached(name, node);
            return Err(err);
        }

        let (_, detailed) = self.volume.generate_msg("DetachVolume.Detach succeeded", "");
        info!("{detailed}");
        log_state_update(
            "MarkVolumeAsDetached",
            self.asw.mark_volume_as_detached(name, node),
        );
        Ok(())
    }
}

/// Confirms that the attach/detach controller attached a volume to this
/// node, by reading node status.
pub struct VerifyControllerAttachedVolumeOperation {
    volume: VolumeToMount,
    node_client: Arc<dyn NodeClient>,
    recorder: Arc<dyn EventRecorder>,
    asw: Arc<dyn ActualStateUpdater>,
}

impl VerifyControllerAttachedVolumeOperation {
    fn mark_attached(&self, device_path: &str) -> Result<(), VolumeError> {
        self.asw
            .mark_volume_as_attached(
                &self.volume.volume_name,
                &self.volume.volume_spec,
                &self.volume.node_name,
                device_path,
            )
            .map_err(|e| VolumeError::state_update("MarkVolumeAsAttached", &e))
    }

    async fn verify(&self) -> Result<(), VolumeError> {
        // Nothing to attach; the volume only needs an actual state entry.
        if !self.volume.plugin_is_attachable {
            return self.mark_attached("");
        }

        if !self.volume.reported_in_use {
            return Err(VolumeError::NotReportedInUse {
                volume: self.volume.volume_name.clone(),
            });
        }

        let node = &self.volume.node_name;
        let node_obj = self
            .node_client
            .get_node(node)
            .await?
            .ok_or_else(|| VolumeError::NodeUnavailable {
                node: node.clone(),
                reason: "node not found".into(),
            })?;

        let attached = node_obj
            .status
            .volumes_attached
            .iter()
            .find(|a| a.name == self.volume.volume_name)
            .ok_or_else(|| VolumeError::NotYetAttached {
                volume: self.volume.volume_name.clone(),
                node: node.clone(),
            })?;
        self.mark_attached(&attached.device_path)
    }
}

#[async_trait]
impl Operation for VerifyControllerAttachedVolumeOperation {
    fn name(&self) -> &'static str {
        "verify_controller_attached_volume"
    }

    #[instrument(skip_all, fields(volume = %self.volume.volume_name, pod = %self.volume.pod_name))]
    async fn execute(&self) -> Result<(), VolumeError> {
        self.verify().await.map_err(|e| {
            report_failure(
                self.recorder.as_ref(),
                &[],
                &self.volume,
                reason::FAILED_MOUNT_VOLUME,
                "VerifyControllerAttachedVolume failed",
                e,
            )
        })?;
        let (_, detailed) = self
            .volume
            .generate_msg("VerifyControllerAttachedVolume succeeded", "");
        info!("{detailed}");
        Ok(())
    }
}

/// Asks attachers whether volumes the actual state holds as attached to a
/// node still are, and marks the ones that are not as detached.
pub struct VolumesAreAttachedOperation {
    node: NodeName,
    volumes: Vec<AttachedVolume>,
    plugin_mgr: Arc<VolumePluginMgr>,
    asw: Arc<dyn ActualStateUpdater>,
}

impl VolumesAreAttachedOperation {
    fn partition_by_plugin(&self) -> BTreeMap<String, (Arc<dyn VolumePlugin>, Vec<&AttachedVolume>)> {
        let mut by_plugin: BTreeMap<String, (Arc<dyn VolumePlugin>, Vec<&AttachedVolume>)> =
            BTreeMap::new();
        for volume in &self.volumes {
            match self
                .plugin_mgr
                .find_attachable_plugin_by_spec(&volume.volume_spec)
            {
                Ok(plugin) => {
                    by_plugin
                        .entry(plugin.name().to_owned())
                        .or_insert_with(|| (Arc::clone(&plugin), Vec::new()))
                        .1
                        .push(volume);
                }
                Err(e) => {
                    warn!(volume = %volume.volume_name, error = %e, "skipping attach verification");
                }
            }
        }
        by_plugin
    }
}

#[async_trait]
impl Operation for VolumesAreAttachedOperation {
    fn name(&self) -> &'static str {
        "verify_volumes_are_attached_per_node"
    }

    #[instrument(skip_all, fields(node = %self.node, volumes = self.volumes.len()))]
    async fn execute(&self) -> Result<(), VolumeError> {
        for (plugin_name, (plugin, volumes)) in self.partition_by_plugin() {
            let attacher = match attach_capability(plugin.as_ref()).and_then(|p| p.new_attacher()) {
                Ok(a) => a,
                Err(e) => {
                    warn!(plugin = %plugin_name, error = %e, "cannot build attacher for verification");
                    continue;
                }
            };

            let specs: Vec<_> = volumes.iter().map(|v| v.volume_spec.clone()).collect();
            let attached = match attacher.volumes_are_attached(&specs, &self.node).await {
                Ok(attached) => attached,
                Err(e) => {
                    warn!(plugin = %plugin_name, error = %e, "VolumesAreAttached failed");
                    continue;
                }
            };

            if attached.len() != volumes.len() {
                warn!(
                    plugin = %plugin_name,
                    expected = volumes.len(),
                    got = attached.len(),
                    "VolumesAreAttached returned a mismatched answer, skipping plugin"
                );
                continue;
            }

            for (volume, is_attached) in volumes.into_iter().zip(attached) {
                if !is_attached {
                    info!(
                        volume = %volume.volume_name,
                        node = %self.node,
                        "volume is no longer attached, marking it detached"
                    );
                    log_state_update(
                        "MarkVolumeAsDetached",
                        self.asw
                            .mark_volume_as_detached(&volume.volume_name, &self.node),
                    );
                }
            }
        }
        Ok(())
    }
}

impl OperationGenerator {
    /// Attach `volume` to its node.
    pub fn generate_attach_volume(
        &self,
        volume: VolumeToAttach,
        asw: Arc<dyn ActualStateUpdater>,
    ) -> Result<Box<dyn Operation>, VolumeError> {
        let plugin = self
            .plugin_mgr
            .find_attachable_plugin_by_spec(&volume.volume_spec)?;
        let attacher = attach_capability(plugin.as_ref())?.new_attacher()?;
        Ok(Box::new(AttachVolumeOperation {
            volume,
            attacher,
            recorder: Arc::clone(&self.recorder),
            asw,
        }))
    }

    /// Detach `volume` from its node. With `verify_safe_to_detach`, node
    /// status is checked first.
    pub fn generate_detach_volume(
        &self,
        volume: AttachedVolume,
        verify_safe_to_detach: bool,
        asw: Arc<dyn ActualStateUpdater>,
    ) -> Result<Box<dyn Operation>, VolumeError> {
        let plugin = self
            .plugin_mgr
            .find_attachable_plugin_by_spec(&volume.volume_spec)?;
        let plugin_volume_name = plugin.volume_name(&volume.volume_spec)?;
        let detacher = attach_capability(plugin.as_ref())?.new_detacher()?;
        Ok(Box::new(DetachVolumeOperation {
            volume,
            plugin_volume_name,
            detacher,
            verify_safe_to_detach,
            node_client: Arc::clone(&self.node_client),
            recorder: Arc::clone(&self.recorder),
            asw,
        }))
    }

    /// Confirm that `volume` is attached to `volume.node_name`.
    pub fn generate_verify_controller_attached_volume(
        &self,
        volume: VolumeToMount,
        asw: Arc<dyn ActualStateUpdater>,
    ) -> Result<Box<dyn Operation>, VolumeError> {
        self.plugin_mgr.find_plugin_by_spec(&volume.volume_spec)?;
        Ok(Box::new(VerifyControllerAttachedVolumeOperation {
            volume,
            node_client: Arc::clone(&self.node_client),
            recorder: Arc::clone(&self.recorder),
            asw,
        }))
    }

    /// Verify that `volumes` are still attached to `node`.
    pub fn generate_volumes_are_attached(
        &self,
        volumes: Vec<AttachedVolume>,
        node: NodeName,
        asw: Arc<dyn ActualStateUpdater>,
    ) -> Result<Box<dyn Operation>, VolumeError> {
        Ok(Box::new(VolumesAreAttachedOperation {
            node,
            volumes,
            plugin_mgr: Arc::clone(&self.plugin_mgr),
            asw,
        }))
    }
}

//! Operation executor.
//!
//! [`OperationExecutor`] is the entry point callers use. Each method
//! generates the operation through the [`OperationGenerator`] and hands it
//! to [`NestedPendingOperations`], which starts it on its own task unless a
//! conflicting operation is in flight or the key is backing off after a
//! failure. Methods return as soon as the operation is started; the outcome
//! is observed through the actual state of world.
//!
//! Keys per operation:
//!
//! | operation | pod | node |
//! |---|---|---|
//! | attach, detach | - | node |
//! | mount, map (attachable plugin) | - | - |
//! | mount, map (non-attachable plugin), unmount, unmap | pod | - |
//! | unmount device, unmap device, verify attached, expand | - | - |
//! | bulk verify for a node | - | node (volume name is synthetic) |

mod pending;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error};

use crate::config::ExecutorConfig;
use crate::error::VolumeError;
use crate::operation::{Operation, OperationGenerator};
use crate::state::ActualStateUpdater;
use crate::types::{
    AttachedVolume, MountedVolume, NodeName, UniquePodName, UniqueVolumeName, VolumeMode,
    VolumeToAttach, VolumeToExpand, VolumeToMount,
};

pub use pending::{BackoffConfig, NestedPendingOperations, OperationKey};

/// Runs generated operations with per-key exclusivity.
pub struct OperationExecutor {
    generator: OperationGenerator,
    pending: Arc<NestedPendingOperations>,
    wait_for_attach_timeout: Duration,
    block_volume_enabled: bool,
}

impl OperationExecutor {
    pub fn new(generator: OperationGenerator, config: &ExecutorConfig) -> Self {
        Self {
            generator,
            pending: NestedPendingOperations::new(config.backoff()),
            wait_for_attach_timeout: config.wait_for_attach_timeout(),
            block_volume_enabled: config.block_volume_enabled,
        }
    }

    pub fn generator(&self) -> &OperationGenerator {
        &self.generator
    }

    fn run(&self, key: OperationKey, operation: Box<dyn Operation>) -> Result<(), VolumeError> {
        self.pending.run(key, operation)
    }

    /// Attach `volume` to its node.
    pub fn attach_volume(
        &self,
        volume: VolumeToAttach,
        asw: Arc<dyn ActualStateUpdater>,
    ) -> Result<(), VolumeError> {
        let key = OperationKey::new(
            volume.volume_name.clone(),
            None,
            Some(volume.node_name.clone()),
        );
        let op = self.generator.generate_attach_volume(volume, asw)?;
        self.run(key, op)
    }

    /// Detach `volume` from its node. With `verify_safe_to_detach` the node's
    /// `VolumesInUse` is consulted first.
    pub fn detach_volume(
        &self,
        volume: AttachedVolume,
        verify_safe_to_detach: bool,
        asw: Arc<dyn ActualStateUpdater>,
    ) -> Result<(), VolumeError> {
        let key = OperationKey::new(
            volume.volume_name.clone(),
            None,
            Some(volume.node_name.clone()),
        );
        let op = self
            .generator
            .generate_detach_volume(volume, verify_safe_to_detach, asw)?;
        self.run(key, op)
    }

    /// Check the attachment of every volume in `attached`, one operation per
    /// node. Per-node failures to start are logged and do not stop the rest.
    pub fn verify_volumes_are_attached(
        &self,
        attached: HashMap<NodeName, Vec<AttachedVolume>>,
        asw: Arc<dyn ActualStateUpdater>,
    ) {
        for (node, volumes) in attached {
            let result =
                self.verify_volumes_are_attached_per_node(volumes, node.clone(), Arc::clone(&asw));
            if let Err(e) = result {
                if e.is_expected_executor_rejection() {
                    debug!(node = %node, "verify volumes are attached not started: {e}");
                } else {
                    error!(node = %node, "verify volumes are attached failed: {e}");
                }
            }
        }
    }

    /// Check the attachment of `volumes` on `node` and mark those the plugins
    /// report as gone.
    pub fn verify_volumes_are_attached_per_node(
        &self,
        volumes: Vec<AttachedVolume>,
        node: NodeName,
        asw: Arc<dyn ActualStateUpdater>,
    ) -> Result<(), VolumeError> {
        let key = OperationKey::new(
            UniqueVolumeName(format!("verify_volumes_are_attached_per_node/{node}")),
            None,
            Some(node.clone()),
        );
        let op = self.generator.generate_volumes_are_attached(volumes, node, asw)?;
        self.run(key, op)
    }

    /// Mount `volume` for its pod, or map it when it is a block volume and
    /// block support is enabled.
    pub fn mount_volume(
        &self,
        volume: VolumeToMount,
        asw: Arc<dyn ActualStateUpdater>,
    ) -> Result<(), VolumeError> {
        // The global device mount is shared, so every pod's mount of an
        // attachable volume is serialized.
        let pod = (!volume.plugin_is_attachable).then(|| volume.pod_name.clone());
        let key = OperationKey::new(volume.volume_name.clone(), pod, None);
        let op = if self.is_block(volume.volume_spec.volume_mode) {
            self.generator
                .generate_map_volume(volume, self.wait_for_attach_timeout, asw)?
        } else {
            self.generator
                .generate_mount_volume(volume, self.wait_for_attach_timeout, asw)?
        };
        self.run(key, op)
    }

    /// Tear down `volume` for its pod (unmap for block volumes).
    pub fn unmount_volume(
        &self,
        volume: MountedVolume,
        asw: Arc<dyn ActualStateUpdater>,
    ) -> Result<(), VolumeError> {
        let key = OperationKey::new(
            volume.volume_name.clone(),
            Some(volume.pod_name.clone()),
            None,
        );
        let op = if self.is_block(volume.volume_mode) {
            self.generator.generate_unmap_volume(volume, asw)?
        } else {
            self.generator.generate_unmount_volume(volume, asw)?
        };
        self.run(key, op)
    }

    /// Unmount the device from its global path (unmap for block volumes).
    pub fn unmount_device(
        &self,
        volume: AttachedVolume,
        asw: Arc<dyn ActualStateUpdater>,
    ) -> Result<(), VolumeError> {
        let key = OperationKey::new(volume.volume_name.clone(), None, None);
        let op = if self.is_block(volume.volume_spec.volume_mode) {
            self.generator.generate_unmap_device(volume, asw)?
        } else {
            self.generator.generate_unmount_device(volume, asw)?
        };
        self.run(key, op)
    }

    /// Confirm from node status that the controller attached `volume`.
    pub fn verify_controller_attached_volume(
        &self,
        volume: VolumeToMount,
        asw: Arc<dyn ActualStateUpdater>,
    ) -> Result<(), VolumeError> {
        let key = OperationKey::new(volume.volume_name.clone(), None, None);
        let op = self
            .generator
            .generate_verify_controller_attached_volume(volume, asw)?;
        self.run(key, op)
    }

    /// Grow `volume` in its storage backend.
    pub fn expand_volume(
        &self,
        volume: VolumeToExpand,
        asw: Arc<dyn ActualStateUpdater>,
    ) -> Result<(), VolumeError> {
        let key = OperationKey::new(volume.volume_name.clone(), None, None);
        let op = self.generator.generate_expand_volume(volume, asw)?;
        self.run(key, op)
    }

    pub fn is_operation_pending(
        &self,
        volume_name: &UniqueVolumeName,
        pod_name: Option<&UniquePodName>,
        node_name: Option<&NodeName>,
    ) -> bool {
        self.pending
            .is_operation_pending(volume_name, pod_name, node_name)
    }

    /// Resolve once no operation is in flight.
    pub async fn wait(&self) {
        self.pending.wait().await
    }

    fn is_block(&self, mode: VolumeMode) -> bool {
        self.block_volume_enabled && mode == VolumeMode::Block
    }
}

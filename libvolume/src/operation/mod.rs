//! Operation generator.
//!
//! Each `generate_*` method resolves the volume plugin and the capability it
//! needs up front and returns a boxed [`Operation`]: a small command struct
//! holding its inputs as typed fields. Resolution failures are configuration
//! errors and are returned immediately; no operation is produced.
//!
//! [`Operation::execute`] performs the blocking work (plugin calls, device
//! waits, mount syscalls) and is run by the
//! [`OperationExecutor`](crate::executor::OperationExecutor), which
//! guarantees at most one in-flight operation per volume/pod/node key.
//!
//! Every failure is logged with the descriptor's detailed message and, when
//! the operation concerns a pod or claim, recorded as a Warning event with
//! the simple message. A failed actual-state update after a successful
//! physical step is logged as [`VolumeError::StateUpdateFailed`] and does
//! not fail the operation.

mod attach;
mod block;
mod expand;
mod mount;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{error, warn};

use crate::error::VolumeError;
use crate::node_client::NodeClient;
use crate::plugin::{
    Attacher, AttachableVolumePlugin, BlockVolumePlugin, ExpandableVolumePlugin, VolumePlugin,
    VolumePluginMgr,
};
use crate::recorder::{EventRecorder, EventType};
use crate::types::{
    NodeName, ObjectReference, OperationMessages, UniqueVolumeName, VolumeSpec, VolumeToMount,
};
use crate::util::block::BlockVolumePathHandler;
use crate::util::mount::MountInterface;
use crate::util::node_affinity_matches;

pub use attach::{
    AttachVolumeOperation, DetachVolumeOperation, VerifyControllerAttachedVolumeOperation,
    VolumesAreAttachedOperation,
};
pub use block::{MapVolumeOperation, UnmapDeviceOperation, UnmapVolumeOperation};
pub use expand::ExpandVolumeOperation;
pub use mount::{MountVolumeOperation, UnmountDeviceOperation, UnmountVolumeOperation};

/// A generated unit of work.
#[async_trait]
pub trait Operation: Send + Sync {
    /// Short name used in logs and metrics labels, e.g. `"volume_attach"`.
    fn name(&self) -> &'static str;

    /// Run the operation to completion.
    async fn execute(&self) -> Result<(), VolumeError>;
}

/// Builds [`Operation`]s from operation descriptors.
///
/// The generator is stateless per call and can be shared across tasks.
#[derive(Clone)]
pub struct OperationGenerator {
    node_client: Arc<dyn NodeClient>,
    plugin_mgr: Arc<VolumePluginMgr>,
    recorder: Arc<dyn EventRecorder>,
    mounter: Arc<dyn MountInterface>,
    block_path_handler: Arc<dyn BlockVolumePathHandler>,
    check_node_capabilities_before_mount: bool,
}

impl OperationGenerator {
    /// Create a generator.
    pub fn new(
        node_client: Arc<dyn NodeClient>,
        plugin_mgr: Arc<VolumePluginMgr>,
        recorder: Arc<dyn EventRecorder>,
        mounter: Arc<dyn MountInterface>,
        block_path_handler: Arc<dyn BlockVolumePathHandler>,
        check_node_capabilities_before_mount: bool,
    ) -> Self {
        Self {
            node_client,
            plugin_mgr,
            recorder,
            mounter,
            block_path_handler,
            check_node_capabilities_before_mount,
        }
    }

    /// The plugin registry operations resolve against.
    pub fn plugin_mgr(&self) -> &Arc<VolumePluginMgr> {
        &self.plugin_mgr
    }
}

/// Attach capability of `plugin`.
pub(crate) fn attach_capability(plugin: &dyn VolumePlugin) -> Result<&dyn AttachableVolumePlugin, VolumeError> {
    plugin
        .as_attachable()
        .ok_or_else(|| VolumeError::CapabilityUnsupported {
            plugin: plugin.name().to_owned(),
            capability: "attacher",
        })
}

/// Raw block capability of `plugin`.
pub(crate) fn block_capability(plugin: &dyn VolumePlugin) -> Result<&dyn BlockVolumePlugin, VolumeError> {
    plugin
        .as_block()
        .ok_or_else(|| VolumeError::CapabilityUnsupported {
            plugin: plugin.name().to_owned(),
            capability: "block mapper",
        })
}

/// Expansion capability of `plugin`.
pub(crate) fn expand_capability(plugin: &dyn VolumePlugin) -> Result<&dyn ExpandableVolumePlugin, VolumeError> {
    plugin
        .as_expandable()
        .ok_or_else(|| VolumeError::CapabilityUnsupported {
            plugin: plugin.name().to_owned(),
            capability: "expansion",
        })
}

/// Log `err` with the detailed message and record a Warning event with the
/// simple one on each of `targets`. Returns `err` for `map_err` use.
pub(crate) fn report_failure<D: OperationMessages + ?Sized>(
    recorder: &dyn EventRecorder,
    targets: &[ObjectReference],
    descriptor: &D,
    reason: &str,
    prefix: &str,
    err: VolumeError,
) -> VolumeError {
    let (simple, detailed) = descriptor.generate_error_msg(prefix, &err);
    error!("{detailed}");
    for target in targets {
        recorder.event(target, EventType::Warning, reason, &simple);
    }
    err
}

/// Log a rejected actual-state update; never fails the caller.
pub(crate) fn log_state_update(operation: &'static str, result: Result<(), VolumeError>) {
    if let Err(e) = result {
        let err = VolumeError::state_update(operation, &e);
        warn!("{err}");
    }
}

/// Event target for a node.
pub(crate) fn node_object_ref(node: &NodeName) -> ObjectReference {
    ObjectReference {
        kind: "Node".to_owned(),
        namespace: String::new(),
        name: node.to_string(),
        uid: node.to_string(),
    }
}

/// Fail with [`VolumeError::AffinityMismatch`] unless `spec` may be used on
/// `node`. Specs without affinity pass without a node lookup.
pub(crate) async fn check_node_affinity(
    node_client: &dyn NodeClient,
    volume_name: &UniqueVolumeName,
    spec: &VolumeSpec,
    node: &NodeName,
) -> Result<(), VolumeError> {
    let Some(affinity) = &spec.node_affinity else {
        return Ok(());
    };
    let node_obj = node_client
        .get_node(node)
        .await?
        .ok_or_else(|| VolumeError::NodeUnavailable {
            node: node.clone(),
            reason: "node not found".into(),
        })?;
    if node_affinity_matches(affinity, &node_obj.labels) {
        Ok(())
    } else {
        Err(VolumeError::AffinityMismatch {
            volume: volume_name.clone(),
            node: node.clone(),
        })
    }
}

/// Wait for the device of `volume` to show up, bounded by `timeout`.
///
/// An elapsed bound is reported as [`VolumeError::WaitForAttachTimeout`],
/// any plugin error as [`VolumeError::WaitForAttachFailed`].
pub(crate) async fn wait_for_attach(
    attacher: &dyn Attacher,
    volume: &VolumeToMount,
    timeout: Duration,
) -> Result<String, VolumeError> {
    let wait = attacher.wait_for_attach(
        &volume.volume_spec,
        &volume.device_path,
        &volume.pod,
        timeout,
    );
    match tokio::time::timeout(timeout, wait).await {
        Ok(Ok(device_path)) => Ok(device_path),
        Ok(Err(e @ VolumeError::WaitForAttachTimeout { .. })) => Err(e),
        Ok(Err(e)) => Err(VolumeError::WaitForAttachFailed {
            volume: volume.volume_name.clone(),
            reason: e.to_string(),
        }),
        Err(_) => Err(VolumeError::WaitForAttachTimeout {
            volume: volume.volume_name.clone(),
            timeout,
        }),
    }
}

/// Fail with [`VolumeError::MountOptionUnsupported`] when `spec` requests
/// mount options from a plugin that does not take any.
pub(crate) fn check_mount_option_support(
    plugin_name: &str,
    supports_mount_option: bool,
    spec: &VolumeSpec,
) -> Result<(), VolumeError> {
    if spec.mount_options.is_empty() || supports_mount_option {
        Ok(())
    } else {
        Err(VolumeError::MountOptionUnsupported {
            plugin: plugin_name.to_owned(),
            options: spec.mount_options.clone(),
        })
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeNodeClient;
    use crate::types::{NodeAffinity, NodeSelectorOperator, NodeSelectorRequirement, NodeSelectorTerm};

    fn zone_affinity(zone: &str) -> NodeAffinity {
        NodeAffinity {
            required: vec![NodeSelectorTerm {
                match_expressions: vec![NodeSelectorRequirement {
                    key: "zone".into(),
                    operator: NodeSelectorOperator::In,
                    values: vec![zone.into()],
                }],
            }],
        }
    }

    #[tokio::test]
    async fn affinity_checked_against_node_labels() {
        let client = FakeNodeClient::new();
        client.add_node_with_labels("node-1", &[("zone", "a")]);
        let name = UniqueVolumeName::from("fake/disk-1");
        let node = NodeName::from("node-1");

        let spec = VolumeSpec::new("vol-a", "fake", "disk-1").with_node_affinity(zone_affinity("a"));
        check_node_affinity(&client, &name, &spec, &node).await.unwrap();

        let spec = VolumeSpec::new("vol-a", "fake", "disk-1").with_node_affinity(zone_affinity("b"));
        let result = check_node_affinity(&client, &name, &spec, &node).await;
        assert!(matches!(result, Err(VolumeError::AffinityMismatch { .. })));
    }

    #[tokio::test]
    async fn spec_without_affinity_skips_lookup() {
        let client = FakeNodeClient::new();
        let spec = VolumeSpec::new("vol-a", "fake", "disk-1");
        check_node_affinity(&client, &"fake/disk-1".into(), &spec, &"node-1".into())
            .await
            .unwrap();
        assert_eq!(client.get_calls(), 0);
    }

    #[test]
    fn mount_options_need_plugin_support() {
        let spec = VolumeSpec::new("vol-a", "fake", "disk-1").with_mount_options(vec!["ro".into()]);
        assert!(check_mount_option_support("fake", true, &spec).is_ok());
        assert!(matches!(
            check_mount_option_support("fake", false, &spec),
            Err(VolumeError::MountOptionUnsupported { .. })
        ));
        let plain = VolumeSpec::new("vol-a", "fake", "disk-1");
        assert!(check_mount_option_support("fake", false, &plain).is_ok());
    }
}

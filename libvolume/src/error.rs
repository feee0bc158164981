//! Volume operation error types.
//!
//! All errors in the `libvolume` crate are represented by the [`VolumeError`]
//! enum. Variants fall into three groups:
//!
//! * **configuration** errors ([`VolumeError::is_permanent`]): no plugin,
//!   missing capability, affinity or mount option mismatch. Retrying the same
//!   request cannot succeed until the configuration changes.
//! * **transient** errors: wait-for-attach timeouts, failed device mounts,
//!   still-referenced devices, node lookups. Callers retry by generating the
//!   operation again.
//! * **bookkeeping** errors: the actual state of world refused an update.
//!   Generated operations log these and carry on.

use std::time::Duration;

use thiserror::Error;

use crate::types::{NodeName, UniqueVolumeName};

/// Unified error type for volume operations.
#[derive(Debug, Error)]
pub enum VolumeError {
    /// No registered plugin supports the volume spec.
    #[error("no volume plugin matched spec {spec}")]
    PluginNotFound {
        /// Name of the spec (or plugin) that was looked up.
        spec: String,
    },

    /// More than one registered plugin claims the volume spec.
    #[error("multiple volume plugins matched spec {spec}: {plugins:?}")]
    MultiplePluginsMatched {
        /// Name of the spec that was looked up.
        spec: String,
        /// Names of the matching plugins.
        plugins: Vec<String>,
    },

    /// The plugin exists but cannot produce the requested capability.
    #[error("plugin {plugin} does not support {capability}")]
    CapabilityUnsupported {
        /// Plugin name.
        plugin: String,
        /// Missing capability, e.g. `"attacher"` or `"block mapper"`.
        capability: &'static str,
    },

    /// The volume's node affinity excludes this node.
    #[error("volume {volume} node affinity does not match node {node}")]
    AffinityMismatch {
        /// Volume that was being mounted.
        volume: UniqueVolumeName,
        /// Node whose labels were checked.
        node: NodeName,
    },

    /// Mount options were requested from a plugin that does not take them.
    #[error("mount options {options:?} are not supported by plugin {plugin}")]
    MountOptionUnsupported {
        /// Plugin name.
        plugin: String,
        /// The rejected options.
        options: Vec<String>,
    },

    /// The plugin failed to attach the volume.
    #[error("attach of volume {volume} to node {node} failed: {reason}")]
    AttachFailed {
        /// Volume being attached.
        volume: UniqueVolumeName,
        /// Target node.
        node: NodeName,
        /// Plugin-provided reason.
        reason: String,
    },

    /// The device did not show up within the configured timeout.
    #[error("timed out after {timeout:?} waiting for volume {volume} to attach")]
    WaitForAttachTimeout {
        /// Volume being waited on.
        volume: UniqueVolumeName,
        /// The bound that elapsed.
        timeout: Duration,
    },

    /// The plugin reported an error while waiting for the device.
    #[error("waiting for volume {volume} to attach failed: {reason}")]
    WaitForAttachFailed {
        /// Volume being waited on.
        volume: UniqueVolumeName,
        /// Plugin-provided reason.
        reason: String,
    },

    /// Mounting the device at its global mount path failed.
    #[error("mount of device for volume {volume} at {path} failed: {reason}")]
    DeviceMountFailed {
        /// Volume being mounted.
        volume: UniqueVolumeName,
        /// Global device mount path.
        path: String,
        /// Underlying reason.
        reason: String,
    },

    /// The node lacks what the mounter needs (helper binaries, kernel modules).
    #[error("node cannot mount volume {volume}: {reason}")]
    CannotMount {
        /// Volume being mounted.
        volume: UniqueVolumeName,
        /// Mounter-provided reason.
        reason: String,
    },

    /// The pod-scoped `SetUp` failed.
    #[error("setup of volume {volume} for pod {pod} failed: {reason}")]
    SetupFailed {
        /// Volume being set up.
        volume: UniqueVolumeName,
        /// Pod the volume is set up for.
        pod: String,
        /// Mounter-provided reason.
        reason: String,
    },

    /// The pod-scoped `TearDown` failed.
    #[error("teardown of volume {volume} for pod {pod} failed: {reason}")]
    TeardownFailed {
        /// Volume being torn down.
        volume: UniqueVolumeName,
        /// Pod the volume was mounted for.
        pod: String,
        /// Unmounter-provided reason.
        reason: String,
    },

    /// Something still depends on the device or the attachment.
    #[error("volume {volume} is still referenced by {references:?}")]
    StillReferenced {
        /// Volume that cannot be released yet.
        volume: UniqueVolumeName,
        /// Mount paths, map links or node status entries holding it.
        references: Vec<String>,
    },

    /// The block device is still held open after the global unmount.
    #[error("device {device_path} of volume {volume} is still opened on the host")]
    DeviceStillOpen {
        /// Volume being unmounted.
        volume: UniqueVolumeName,
        /// Device path checked.
        device_path: String,
    },

    /// The plugin failed to unmount the device from its global path.
    #[error("unmount of device for volume {volume} failed: {reason}")]
    UnmountDeviceFailed {
        /// Volume being unmounted.
        volume: UniqueVolumeName,
        /// Plugin-provided reason.
        reason: String,
    },

    /// The plugin failed to detach the volume.
    #[error("detach of volume {volume} from node {node} failed: {reason}")]
    DetachFailed {
        /// Volume being detached.
        volume: UniqueVolumeName,
        /// Node it is attached to.
        node: NodeName,
        /// Plugin-provided reason.
        reason: String,
    },

    /// Mapping a raw block volume failed.
    #[error("map of block volume {volume} failed: {reason}")]
    MapFailed {
        /// Volume being mapped.
        volume: UniqueVolumeName,
        /// Underlying reason.
        reason: String,
    },

    /// Unmapping a raw block volume failed.
    #[error("unmap of block volume {volume} failed: {reason}")]
    UnmapFailed {
        /// Volume being unmapped.
        volume: UniqueVolumeName,
        /// Underlying reason.
        reason: String,
    },

    /// Expanding the volume in the storage backend failed.
    #[error("expand of volume {volume} failed: {reason}")]
    ExpandFailed {
        /// Volume being expanded.
        volume: UniqueVolumeName,
        /// Plugin-provided reason.
        reason: String,
    },

    /// The attach/detach controller has not attached the volume yet.
    #[error("volume {volume} is not yet attached to node {node} according to node status")]
    NotYetAttached {
        /// Volume being verified.
        volume: UniqueVolumeName,
        /// Node whose status was read.
        node: NodeName,
    },

    /// The volume has not been reported in the node's `VolumesInUse` yet.
    #[error("volume {volume} has not yet been added to the list of volumes in use")]
    NotReportedInUse {
        /// Volume being verified.
        volume: UniqueVolumeName,
    },

    /// The node object could not be fetched.
    #[error("node {node} is unavailable: {reason}")]
    NodeUnavailable {
        /// Node that was looked up.
        node: NodeName,
        /// Client-provided reason.
        reason: String,
    },

    /// The actual state refused an update after a physical step succeeded.
    #[error("{operation} succeeded but updating actual state failed: {reason}")]
    StateUpdateFailed {
        /// Operation name, e.g. `"MarkVolumeAsMounted"`.
        operation: &'static str,
        /// Error returned by the state table.
        reason: String,
    },

    /// The requested state transition would break a state invariant.
    #[error("state conflict for volume {volume}: {reason}")]
    StateConflict {
        /// Volume whose entry was touched.
        volume: UniqueVolumeName,
        /// Which invariant blocked the transition.
        reason: String,
    },

    /// The volume has no entry in the state table.
    #[error("volume {volume} is not tracked in actual state")]
    VolumeNotTracked {
        /// Volume that was looked up.
        volume: UniqueVolumeName,
    },

    /// An operation for a conflicting key is already in flight.
    #[error("an operation for {key} is already pending")]
    OperationAlreadyExists {
        /// Rendered operation key.
        key: String,
    },

    /// The key failed recently and is still backing off.
    #[error("operation for {key} failed recently; no retries permitted for {remaining:?}")]
    BackoffNotExpired {
        /// Rendered operation key.
        key: String,
        /// Time left before the next attempt is allowed.
        remaining: Duration,
    },

    /// A plugin call failed with an unclassified error.
    #[error("plugin error: {0}")]
    Plugin(String),

    /// A host I/O call failed.
    #[error("io error at {path}: {source}")]
    Io {
        /// Path the call operated on.
        path: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The caller supplied an invalid argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl VolumeError {
    /// Create a [`VolumeError::Plugin`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn plugin<E: std::fmt::Display>(e: E) -> Self {
        Self::Plugin(e.to_string())
    }

    /// Create a [`VolumeError::Io`] for `path`.
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Wrap a rejected state-table update for logging.
    pub fn state_update(operation: &'static str, err: &VolumeError) -> Self {
        Self::StateUpdateFailed {
            operation,
            reason: err.to_string(),
        }
    }

    /// Configuration errors: retrying without a configuration change cannot
    /// succeed, so the executor's caller decides the retry cadence.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::PluginNotFound { .. }
                | Self::MultiplePluginsMatched { .. }
                | Self::CapabilityUnsupported { .. }
                | Self::AffinityMismatch { .. }
                | Self::MountOptionUnsupported { .. }
                | Self::InvalidArgument(_)
        )
    }

    /// `true` for the executor's own rejections (pending or backing off).
    /// The reconciler hits these every tick and should not log them loudly.
    pub fn is_expected_executor_rejection(&self) -> bool {
        matches!(
            self,
            Self::OperationAlreadyExists { .. } | Self::BackoffNotExpired { .. }
        )
    }
}

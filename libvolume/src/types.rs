//! Core volume types: names, specs, operation descriptors and the node model.
//!
//! The descriptors ([`VolumeToAttach`], [`VolumeToMount`], [`AttachedVolume`],
//! [`MountedVolume`], [`VolumeToExpand`]) describe intent. They are handed to
//! the operation generator by value and never own state.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::VolumeError;

// ---------------------------------------------------------------------------
// Identities
// ---------------------------------------------------------------------------

macro_rules! string_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub String);

        impl $name {
            /// Borrow the underlying string.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

string_newtype!(
    /// Unique name of a volume: `<plugin-name>/<volume-name>`.
    UniqueVolumeName
);
string_newtype!(
    /// Unique name of a pod (its UID).
    UniquePodName
);
string_newtype!(
    /// Name of a node object.
    NodeName
);

// ---------------------------------------------------------------------------
// Volume spec
// ---------------------------------------------------------------------------

/// Whether the volume is consumed as a filesystem or as a raw block device.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum VolumeMode {
    /// Mounted into the pod as a filesystem.
    #[default]
    Filesystem,
    /// Mapped into the pod as a raw block device.
    Block,
}

/// Plugin-specific source of a volume.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeSource {
    /// Driver that owns the volume; plugins match on it in `can_support`.
    pub driver: String,
    /// Backend-assigned handle (disk ID, LUN, export path...).
    pub volume_handle: String,
    /// Free-form attributes forwarded to the plugin.
    #[serde(default)]
    pub attributes: HashMap<String, String>,
}

/// Operator of a [`NodeSelectorRequirement`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum NodeSelectorOperator {
    /// Label value is one of `values`.
    In,
    /// Label value is none of `values` (or the label is absent).
    NotIn,
    /// Label is present.
    Exists,
    /// Label is absent.
    DoesNotExist,
}

/// One label requirement inside a [`NodeSelectorTerm`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeSelectorRequirement {
    /// Label key.
    pub key: String,
    /// How `values` are applied.
    pub operator: NodeSelectorOperator,
    /// Values for `In`/`NotIn`.
    #[serde(default)]
    pub values: Vec<String>,
}

/// Requirements ANDed together.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeSelectorTerm {
    /// Requirements that must all hold.
    #[serde(default)]
    pub match_expressions: Vec<NodeSelectorRequirement>,
}

/// Nodes a volume can be used from. Terms are ORed.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeAffinity {
    /// At least one term must match the node's labels.
    #[serde(default)]
    pub required: Vec<NodeSelectorTerm>,
}

/// Immutable description of a volume.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeSpec {
    /// Plugin-local (inner) name of the volume.
    pub name: String,
    /// Plugin-specific source.
    pub source: VolumeSource,
    /// Whether the volume is mounted read-only.
    #[serde(default)]
    pub read_only: bool,
    /// Filesystem or raw block.
    #[serde(default)]
    pub volume_mode: VolumeMode,
    /// Mount options requested by the storage class or volume.
    #[serde(default)]
    pub mount_options: Vec<String>,
    /// Node affinity of node-local volumes.
    #[serde(default)]
    pub node_affinity: Option<NodeAffinity>,
    /// Provisioned capacity, when known.
    #[serde(default)]
    pub capacity_bytes: Option<u64>,
}

impl VolumeSpec {
    /// Build a filesystem spec for `driver` with the given handle.
    pub fn new(
        name: impl Into<String>,
        driver: impl Into<String>,
        volume_handle: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            source: VolumeSource {
                driver: driver.into(),
                volume_handle: volume_handle.into(),
                attributes: HashMap::new(),
            },
            ..Default::default()
        }
    }

    /// Switch the spec to raw block mode.
    pub fn with_block_mode(mut self) -> Self {
        self.volume_mode = VolumeMode::Block;
        self
    }

    /// Set the requested mount options.
    pub fn with_mount_options(mut self, options: Vec<String>) -> Self {
        self.mount_options = options;
        self
    }

    /// Restrict the volume to nodes matching `affinity`.
    pub fn with_node_affinity(mut self, affinity: NodeAffinity) -> Self {
        self.node_affinity = Some(affinity);
        self
    }

    /// Record the provisioned capacity.
    pub fn with_capacity(mut self, bytes: u64) -> Self {
        self.capacity_bytes = Some(bytes);
        self
    }
}

// ---------------------------------------------------------------------------
// Pods, nodes, events targets
// ---------------------------------------------------------------------------

/// Reference to the object an event is attached to.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ObjectReference {
    /// Object kind, e.g. `"Pod"`.
    pub kind: String,
    /// Namespace, empty for cluster-scoped objects.
    pub namespace: String,
    /// Object name.
    pub name: String,
    /// Object UID.
    pub uid: String,
}

impl fmt::Display for ObjectReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}/{}", self.kind, self.name)
        } else {
            write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
        }
    }
}

/// The parts of a pod the volume subsystem needs.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PodRef {
    /// Pod name.
    pub name: String,
    /// Pod namespace.
    pub namespace: String,
    /// Pod UID.
    pub uid: String,
    /// Supplemental group that owns the volume contents.
    #[serde(default)]
    pub fs_group: Option<i64>,
}

impl PodRef {
    /// Build a pod reference.
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        uid: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            uid: uid.into(),
            fs_group: None,
        }
    }

    /// Unique pod name used as a state key.
    pub fn unique_name(&self) -> UniquePodName {
        UniquePodName(self.uid.clone())
    }

    /// Event target for this pod.
    pub fn object_ref(&self) -> ObjectReference {
        ObjectReference {
            kind: "Pod".to_owned(),
            namespace: self.namespace.clone(),
            name: self.name.clone(),
            uid: self.uid.clone(),
        }
    }
}

/// Attachment entry in [`NodeStatus::volumes_attached`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AttachedVolumeStatus {
    /// Attached volume.
    pub name: UniqueVolumeName,
    /// Device path reported by the attach/detach controller.
    pub device_path: String,
}

/// Volume-related node status.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeStatus {
    /// Volumes the node agent reports as in use by pods.
    #[serde(default)]
    pub volumes_in_use: Vec<UniqueVolumeName>,
    /// Volumes the controller reports as attached.
    #[serde(default)]
    pub volumes_attached: Vec<AttachedVolumeStatus>,
}

/// The parts of a node object the volume subsystem needs.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Node {
    /// Node name.
    pub name: NodeName,
    /// Node labels, checked against volume node affinity.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Volume-related status.
    #[serde(default)]
    pub status: NodeStatus,
}

// ---------------------------------------------------------------------------
// Operation descriptors
// ---------------------------------------------------------------------------

/// Renders the simple (event) and detailed (log) messages for a descriptor.
pub trait OperationMessages {
    /// Spec name shown to users.
    fn volume_spec_name(&self) -> &str;

    /// Identity details appended to detailed messages.
    fn detail(&self) -> String;

    /// Return `(simple, detailed)` messages for `prefix`, with an optional
    /// `suffix`.
    fn generate_msg(&self, prefix: &str, suffix: &str) -> (String, String) {
        let simple = format!("{prefix} for volume {:?}", self.volume_spec_name());
        let detailed = format!(
            "{prefix} for volume {:?} {}",
            self.volume_spec_name(),
            self.detail()
        );
        if suffix.is_empty() {
            (simple, detailed)
        } else {
            (format!("{simple} {suffix}"), format!("{detailed} {suffix}"))
        }
    }

    /// Return `(simple, detailed)` messages describing `err`.
    fn generate_error_msg(&self, prefix: &str, err: &VolumeError) -> (String, String) {
        let (simple, detailed) = self.generate_msg(prefix, "");
        (format!("{simple} : {err}"), format!("{detailed} : {err}"))
    }
}

/// A volume that should be attached to a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeToAttach {
    /// Unique volume name.
    pub volume_name: UniqueVolumeName,
    /// Volume spec.
    pub volume_spec: VolumeSpec,
    /// Node to attach to.
    pub node_name: NodeName,
    /// Pods scheduled to the node that reference the volume; failures are
    /// reported on them.
    pub scheduled_pods: Vec<PodRef>,
}

impl OperationMessages for VolumeToAttach {
    fn volume_spec_name(&self) -> &str {
        &self.volume_spec.name
    }

    fn detail(&self) -> String {
        format!(
            "(UniqueName: {:?}) from node {:?}",
            self.volume_name.as_str(),
            self.node_name.as_str()
        )
    }
}

/// A volume that should be mounted (or mapped) for a pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeToMount {
    /// Unique volume name.
    pub volume_name: UniqueVolumeName,
    /// Unique pod name.
    pub pod_name: UniquePodName,
    /// Pod the volume is mounted for.
    pub pod: PodRef,
    /// Volume spec; `volume_spec.name` is the inner (plugin-local) name.
    pub volume_spec: VolumeSpec,
    /// Name of the volume in the pod spec.
    pub outer_volume_spec_name: String,
    /// Whether the plugin supports attach.
    pub plugin_is_attachable: bool,
    /// Device path, when already known from node status.
    pub device_path: String,
    /// GID annotation of the volume, when present.
    pub volume_gid_value: Option<String>,
    /// Whether the volume has been reported in `VolumesInUse`.
    pub reported_in_use: bool,
    /// Node the agent runs on.
    pub node_name: NodeName,
    /// The volume is already mounted and is being mounted again.
    pub remount: bool,
}

impl OperationMessages for VolumeToMount {
    fn volume_spec_name(&self) -> &str {
        &self.volume_spec.name
    }

    fn detail(&self) -> String {
        format!(
            "(UniqueName: {:?}) pod {:?} (UID: {:?})",
            self.volume_name.as_str(),
            self.pod.name,
            self.pod.uid
        )
    }
}

/// A volume recorded as attached in the actual state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachedVolume {
    /// Unique volume name.
    pub volume_name: UniqueVolumeName,
    /// Volume spec.
    pub volume_spec: VolumeSpec,
    /// Node it is attached to.
    pub node_name: NodeName,
    /// Whether the plugin supports attach.
    pub plugin_is_attachable: bool,
    /// Device path returned by attach.
    pub device_path: String,
    /// Whether the device is mounted at its global mount path.
    pub device_mounted: bool,
}

impl OperationMessages for AttachedVolume {
    fn volume_spec_name(&self) -> &str {
        &self.volume_spec.name
    }

    fn detail(&self) -> String {
        format!(
            "(UniqueName: {:?}) on node {:?}",
            self.volume_name.as_str(),
            self.node_name.as_str()
        )
    }
}

/// A volume recorded as mounted for a pod in the actual state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountedVolume {
    /// Unique pod name.
    pub pod_name: UniquePodName,
    /// Unique volume name.
    pub volume_name: UniqueVolumeName,
    /// Plugin-local name of the volume.
    pub inner_volume_spec_name: String,
    /// Name of the volume in the pod spec.
    pub outer_volume_spec_name: String,
    /// Plugin that mounted it.
    pub plugin_name: String,
    /// Pod UID.
    pub pod_uid: String,
    /// Volume spec.
    pub volume_spec: VolumeSpec,
    /// GID annotation of the volume, when present.
    pub volume_gid_value: Option<String>,
    /// Filesystem or raw block.
    pub volume_mode: VolumeMode,
}

impl OperationMessages for MountedVolume {
    fn volume_spec_name(&self) -> &str {
        &self.outer_volume_spec_name
    }

    fn detail(&self) -> String {
        format!(
            "(UniqueName: {:?}) pod {:?} (UID: {:?})",
            self.volume_name.as_str(),
            self.pod_name.as_str(),
            self.pod_uid
        )
    }
}

/// A volume whose backing storage should grow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeToExpand {
    /// Unique volume name.
    pub volume_name: UniqueVolumeName,
    /// Volume spec; `capacity_bytes` is the current size.
    pub volume_spec: VolumeSpec,
    /// Claim that requested the resize; events go there.
    pub claim: ObjectReference,
    /// Requested size in bytes.
    pub requested_size: u64,
}

impl OperationMessages for VolumeToExpand {
    fn volume_spec_name(&self) -> &str {
        &self.volume_spec.name
    }

    fn detail(&self) -> String {
        format!(
            "(UniqueName: {:?}) claim {}",
            self.volume_name.as_str(),
            self.claim
        )
    }
}

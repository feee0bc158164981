//! Volume plugin capability traits.
//!
//! A plugin is looked up through [`VolumePluginMgr`] and exposes optional
//! capabilities through the `as_*` accessors instead of runtime type checks:
//!
//! | accessor | capability | used by |
//! |---|---|---|
//! | (always) | [`Mounter`] / [`Unmounter`] | mount, unmount |
//! | [`VolumePlugin::as_attachable`] | [`Attacher`] / [`Detacher`] | attach, detach, device mount |
//! | [`VolumePlugin::as_block`] | [`BlockVolumeMapper`] / [`BlockVolumeUnmapper`] | map, unmap |
//! | [`VolumePlugin::as_expandable`] | [`ExpandableVolumePlugin`] | expand |
//!
//! The executor calls these traits; it never implements them.

mod mgr;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::VolumeError;
use crate::types::{NodeName, PodRef, VolumeSpec};

pub use mgr::VolumePluginMgr;

/// Attributes a mounter reports about the mounted volume.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeAttributes {
    /// The mount is read-only.
    pub read_only: bool,
    /// The node agent manages ownership and permissions of the contents.
    pub managed: bool,
    /// The volume supports SELinux relabelling.
    pub supports_selinux: bool,
}

/// A volume technology.
pub trait VolumePlugin: Send + Sync {
    /// Plugin name, unique in the registry, e.g. `"rk8s.io/local-disk"`.
    fn name(&self) -> &str;

    /// Whether this plugin handles `spec`.
    fn can_support(&self, spec: &VolumeSpec) -> bool;

    /// Plugin-scoped name of the volume; combined with [`Self::name`] it forms
    /// the [`UniqueVolumeName`](crate::types::UniqueVolumeName).
    fn volume_name(&self, spec: &VolumeSpec) -> Result<String, VolumeError>;

    /// Whether the plugin accepts mount options.
    fn supports_mount_option(&self) -> bool;

    /// Build the pod-scoped mounter for `spec`.
    fn new_mounter(&self, spec: &VolumeSpec, pod: &PodRef)
    -> Result<Box<dyn Mounter>, VolumeError>;

    /// Build the pod-scoped unmounter for a previously mounted volume.
    fn new_unmounter(
        &self,
        inner_spec_name: &str,
        pod_uid: &str,
    ) -> Result<Box<dyn Unmounter>, VolumeError>;

    /// Attach capability.
    fn as_attachable(&self) -> Option<&dyn AttachableVolumePlugin> {
        None
    }

    /// Raw block capability.
    fn as_block(&self) -> Option<&dyn BlockVolumePlugin> {
        None
    }

    /// Expansion capability.
    fn as_expandable(&self) -> Option<&dyn ExpandableVolumePlugin> {
        None
    }
}

/// Plugins whose volumes must be attached to a node before use.
pub trait AttachableVolumePlugin: Send + Sync {
    /// Build an attacher.
    fn new_attacher(&self) -> Result<Box<dyn Attacher>, VolumeError>;

    /// Build a detacher.
    fn new_detacher(&self) -> Result<Box<dyn Detacher>, VolumeError>;
}

/// Attaches volumes to nodes and mounts devices at their global path.
#[async_trait]
pub trait Attacher: Send + Sync {
    /// Attach the volume to `node` and return the device path.
    async fn attach(&self, spec: &VolumeSpec, node: &NodeName) -> Result<String, VolumeError>;

    /// Block until the device shows up on this node, bounded by `timeout`,
    /// and return its path.
    async fn wait_for_attach(
        &self,
        spec: &VolumeSpec,
        device_path: &str,
        pod: &PodRef,
        timeout: Duration,
    ) -> Result<String, VolumeError>;

    /// Global (per-node) path the device is mounted at.
    fn get_device_mount_path(&self, spec: &VolumeSpec) -> Result<String, VolumeError>;

    /// Mount `device_path` at `device_mount_path`.
    async fn mount_device(
        &self,
        spec: &VolumeSpec,
        device_path: &str,
        device_mount_path: &str,
    ) -> Result<(), VolumeError>;

    /// Report whether each volume is attached to `node`. The answer at
    /// index `i` is for `specs[i]`.
    async fn volumes_are_attached(
        &self,
        specs: &[VolumeSpec],
        node: &NodeName,
    ) -> Result<Vec<bool>, VolumeError>;
}

/// Detaches volumes and unmounts devices from their global path.
#[async_trait]
pub trait Detacher: Send + Sync {
    /// Detach the plugin-scoped `volume_name` from `node`.
    async fn detach(&self, volume_name: &str, node: &NodeName) -> Result<(), VolumeError>;

    /// Unmount the device from its global mount path.
    async fn unmount_device(&self, device_mount_path: &str) -> Result<(), VolumeError>;
}

/// Pod-scoped setup of a filesystem volume.
#[async_trait]
pub trait Mounter: Send + Sync {
    /// Path the volume is set up at inside the pod's volume directory.
    fn get_path(&self) -> String;

    /// Check the node has what the mount needs (helpers, kernel modules).
    async fn can_mount(&self) -> Result<(), VolumeError>;

    /// Set the volume up for the pod, owned by `fs_group` when given.
    async fn set_up(&self, fs_group: Option<i64>) -> Result<(), VolumeError>;

    /// Attributes of the mounted volume.
    fn get_attributes(&self) -> VolumeAttributes;
}

/// Pod-scoped teardown of a filesystem volume.
#[async_trait]
pub trait Unmounter: Send + Sync {
    /// Path the volume was set up at.
    fn get_path(&self) -> String;

    /// Tear the pod-scoped mount down.
    async fn tear_down(&self) -> Result<(), VolumeError>;
}

/// Plugins that can hand out volumes as raw block devices.
pub trait BlockVolumePlugin: Send + Sync {
    /// Build the pod-scoped mapper for `spec`.
    fn new_block_volume_mapper(
        &self,
        spec: &VolumeSpec,
        pod: &PodRef,
    ) -> Result<Box<dyn BlockVolumeMapper>, VolumeError>;

    /// Build the pod-scoped unmapper for a previously mapped volume.
    fn new_block_volume_unmapper(
        &self,
        inner_spec_name: &str,
        pod_uid: &str,
    ) -> Result<Box<dyn BlockVolumeUnmapper>, VolumeError>;
}

/// Pod-scoped mapping of a raw block volume.
#[async_trait]
pub trait BlockVolumeMapper: Send + Sync {
    /// Prepare the device for non-attachable plugins and return its path.
    async fn set_up_device(&self) -> Result<String, VolumeError>;

    /// Global map directory of the volume on this node.
    fn global_map_path(&self, spec: &VolumeSpec) -> Result<String, VolumeError>;

    /// Pod map directory and link name.
    fn pod_device_map_path(&self) -> (String, String);
}

/// Pod-scoped unmapping of a raw block volume.
#[async_trait]
pub trait BlockVolumeUnmapper: Send + Sync {
    /// Release the device behind `map_path`.
    async fn tear_down_device(&self, map_path: &str, device_path: &str)
    -> Result<(), VolumeError>;

    /// Global map directory of the volume on this node.
    fn global_map_path(&self, spec: &VolumeSpec) -> Result<String, VolumeError>;

    /// Pod map directory and link name.
    fn pod_device_map_path(&self) -> (String, String);
}

/// Plugins whose volumes can grow.
#[async_trait]
pub trait ExpandableVolumePlugin: Send + Sync {
    /// Grow the backing volume from `old_size` to `new_size` bytes and return
    /// the size actually provisioned.
    async fn expand_volume_device(
        &self,
        spec: &VolumeSpec,
        new_size: u64,
        old_size: u64,
    ) -> Result<u64, VolumeError>;

    /// Whether the filesystem on the device must be grown on the node after
    /// the backend expansion.
    fn requires_fs_resize(&self) -> bool;
}

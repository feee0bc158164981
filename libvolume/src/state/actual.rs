//! Actual state of world: what is physically attached and mounted.
//!
//! The table is keyed by [`UniqueVolumeName`]; each entry records the nodes
//! the volume is attached to, whether its device is mounted at the global
//! mount path, and the pods it is mounted for. Entries are only created and
//! removed by the `mark_*` transitions of [`ActualStateUpdater`], which the
//! generated operations call after the corresponding physical step succeeded.
//!
//! # Thread safety
//!
//! Entries live in a [`DashMap`]; every transition takes the lock of the
//! volume's bucket for its whole read-modify-write, so concurrent operations
//! on different volumes proceed in parallel and operations on the same
//! volume are serialized.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::{debug, info, warn};

use crate::error::VolumeError;
use crate::plugin::{VolumeAttributes, VolumePluginMgr};
use crate::types::{
    AttachedVolume, AttachedVolumeStatus, MountedVolume, NodeName, UniquePodName,
    UniqueVolumeName, VolumeMode, VolumeSpec,
};

/// Arguments of [`ActualStateUpdater::mark_volume_as_mounted`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkVolumeMountedOpts {
    /// Pod the volume was mounted for.
    pub pod_name: UniquePodName,
    /// UID of that pod.
    pub pod_uid: String,
    /// Volume that was mounted.
    pub volume_name: UniqueVolumeName,
    /// Plugin that mounted it; unmount looks the plugin up by this name.
    pub plugin_name: String,
    /// Attributes reported by the mounter or mapper.
    pub attributes: VolumeAttributes,
    /// Name of the volume in the pod spec.
    pub outer_volume_spec_name: String,
    /// GID annotation of the volume, when present.
    pub volume_gid_value: Option<String>,
    /// Filesystem or raw block.
    pub volume_mode: VolumeMode,
}

/// State transitions consumed by generated operations.
pub trait ActualStateUpdater: Send + Sync {
    /// Record that `volume_name` is attached to `node` at `device_path`.
    fn mark_volume_as_attached(
        &self,
        volume_name: &UniqueVolumeName,
        spec: &VolumeSpec,
        node: &NodeName,
        device_path: &str,
    ) -> Result<(), VolumeError>;

    /// Record that `volume_name` is no longer attached to `node`.
    fn mark_volume_as_detached(
        &self,
        volume_name: &UniqueVolumeName,
        node: &NodeName,
    ) -> Result<(), VolumeError>;

    /// Record that the device is mounted at its global mount path.
    fn mark_device_as_mounted(&self, volume_name: &UniqueVolumeName) -> Result<(), VolumeError>;

    /// Record that the device is no longer globally mounted.
    fn mark_device_as_unmounted(&self, volume_name: &UniqueVolumeName)
    -> Result<(), VolumeError>;

    /// Record that the volume is mounted for a pod.
    fn mark_volume_as_mounted(&self, opts: MarkVolumeMountedOpts) -> Result<(), VolumeError>;

    /// Record that the volume is no longer mounted for `pod_name`.
    fn mark_volume_as_unmounted(
        &self,
        pod_name: &UniquePodName,
        volume_name: &UniqueVolumeName,
    ) -> Result<(), VolumeError>;

    /// Report the attachment in node status again (after a failed detach).
    fn add_volume_to_report_as_attached(&self, volume_name: &UniqueVolumeName, node: &NodeName);

    /// Stop reporting the attachment in node status (before a detach).
    fn remove_volume_from_report_as_attached(
        &self,
        volume_name: &UniqueVolumeName,
        node: &NodeName,
    ) -> Result<(), VolumeError>;

    /// Record a completed backend expansion.
    fn mark_volume_as_resized(
        &self,
        volume_name: &UniqueVolumeName,
        new_size: u64,
        fs_resize_required: bool,
    ) -> Result<(), VolumeError>;

    /// Whether the filesystem still has to grow to the expanded size.
    fn fs_resize_required(&self, volume_name: &UniqueVolumeName) -> bool;

    /// Record that the filesystem has grown.
    fn mark_fs_resized(&self, volume_name: &UniqueVolumeName) -> Result<(), VolumeError>;
}

#[derive(Debug, Clone)]
struct NodeAttachment {
    device_path: String,
    report_as_attached: bool,
}

#[derive(Debug, Clone)]
struct PodMount {
    pod_uid: String,
    plugin_name: String,
    attributes: VolumeAttributes,
    outer_volume_spec_name: String,
    volume_gid_value: Option<String>,
    volume_mode: VolumeMode,
}

#[derive(Debug, Clone)]
struct VolumeEntry {
    spec: VolumeSpec,
    plugin_is_attachable: bool,
    nodes: HashMap<NodeName, NodeAttachment>,
    device_mounted: bool,
    pods: HashMap<UniquePodName, PodMount>,
}

#[derive(Debug, Clone, Copy)]
struct ResizeRecord {
    size: u64,
    fs_resize_required: bool,
}

/// In-memory record of attached and mounted volumes.
pub struct ActualStateOfWorld {
    plugin_mgr: Arc<VolumePluginMgr>,
    volumes: DashMap<UniqueVolumeName, VolumeEntry>,
    /// Kept apart from `volumes`: a volume can be expanded while attached
    /// nowhere.
    resized: DashMap<UniqueVolumeName, ResizeRecord>,
}

impl ActualStateOfWorld {
    /// Create an empty table. `plugin_mgr` resolves whether newly attached
    /// volumes belong to an attachable plugin.
    pub fn new(plugin_mgr: Arc<VolumePluginMgr>) -> Self {
        Self {
            plugin_mgr,
            volumes: DashMap::new(),
            resized: DashMap::new(),
        }
    }

    /// Whether the volume has an entry.
    pub fn volume_exists(&self, volume_name: &UniqueVolumeName) -> bool {
        self.volumes.contains_key(volume_name)
    }

    /// Device path of the attachment to `node`, if attached.
    pub fn is_volume_attached(
        &self,
        volume_name: &UniqueVolumeName,
        node: &NodeName,
    ) -> Option<String> {
        self.volumes
            .get(volume_name)
            .and_then(|entry| entry.nodes.get(node).map(|a| a.device_path.clone()))
    }

    /// Whether the device is mounted at its global mount path.
    pub fn is_device_mounted(&self, volume_name: &UniqueVolumeName) -> bool {
        self.volumes
            .get(volume_name)
            .is_some_and(|entry| entry.device_mounted)
    }

    /// Whether the volume is mounted for `pod_name`.
    pub fn pod_exists_in_volume(
        &self,
        pod_name: &UniquePodName,
        volume_name: &UniqueVolumeName,
    ) -> bool {
        self.volumes
            .get(volume_name)
            .is_some_and(|entry| entry.pods.contains_key(pod_name))
    }

    /// Last recorded size of the volume.
    pub fn volume_size(&self, volume_name: &UniqueVolumeName) -> Option<u64> {
        self.resized
            .get(volume_name)
            .map(|r| r.size)
            .or_else(|| {
                self.volumes
                    .get(volume_name)
                    .and_then(|entry| entry.spec.capacity_bytes)
            })
    }

    /// Every `(volume, node)` attachment.
    pub fn get_attached_volumes(&self) -> Vec<AttachedVolume> {
        self.collect_attached(|_, _| true)
    }

    /// Attachments to `node`.
    pub fn get_attached_volumes_for_node(&self, node: &NodeName) -> Vec<AttachedVolume> {
        self.collect_attached(|_, n| n == node)
    }

    /// Attachments with no pod mounts left.
    pub fn get_unmounted_volumes(&self) -> Vec<AttachedVolume> {
        self.collect_attached(|entry, _| entry.pods.is_empty())
    }

    /// Attachments to `node` that node status should list.
    pub fn get_volumes_to_report_attached(&self, node: &NodeName) -> Vec<AttachedVolumeStatus> {
        let mut out: Vec<AttachedVolumeStatus> = self
            .volumes
            .iter()
            .filter_map(|entry| {
                entry
                    .nodes
                    .get(node)
                    .filter(|a| a.report_as_attached)
                    .map(|a| AttachedVolumeStatus {
                        name: entry.key().clone(),
                        device_path: a.device_path.clone(),
                    })
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Every `(pod, volume)` mount.
    pub fn get_mounted_volumes(&self) -> Vec<MountedVolume> {
        self.collect_mounted(|_| true)
    }

    /// Mounts for `pod_name`.
    pub fn get_mounted_volumes_for_pod(&self, pod_name: &UniquePodName) -> Vec<MountedVolume> {
        self.collect_mounted(|p| p == pod_name)
    }

    fn collect_attached(
        &self,
        keep: impl Fn(&VolumeEntry, &NodeName) -> bool,
    ) -> Vec<AttachedVolume> {
        let mut out = Vec::new();
        for entry in self.volumes.iter() {
            for (node, attachment) in &entry.nodes {
                if keep(entry.value(), node) {
                    out.push(AttachedVolume {
                        volume_name: entry.key().clone(),
                        volume_spec: entry.spec.clone(),
                        node_name: node.clone(),
                        plugin_is_attachable: entry.plugin_is_attachable,
                        device_path: attachment.device_path.clone(),
                        device_mounted: entry.device_mounted,
                    });
                }
            }
        }
        out.sort_by(|a, b| {
            (&a.volume_name, &a.node_name).cmp(&(&b.volume_name, &b.node_name))
        });
        out
    }

    fn collect_mounted(&self, keep: impl Fn(&UniquePodName) -> bool) -> Vec<MountedVolume> {
        let mut out = Vec::new();
        for entry in self.volumes.iter() {
            for (pod_name, mount) in &entry.pods {
                if keep(pod_name) {
                    out.push(MountedVolume {
                        pod_name: pod_name.clone(),
                        volume_name: entry.key().clone(),
                        inner_volume_spec_name: entry.spec.name.clone(),
                        outer_volume_spec_name: mount.outer_volume_spec_name.clone(),
                        plugin_name: mount.plugin_name.clone(),
                        pod_uid: mount.pod_uid.clone(),
                        volume_spec: entry.spec.clone(),
                        volume_gid_value: mount.volume_gid_value.clone(),
                        volume_mode: mount.volume_mode,
                    });
                }
            }
        }
        out.sort_by(|a, b| (&a.volume_name, &a.pod_name).cmp(&(&b.volume_name, &b.pod_name)));
        out
    }
}

impl ActualStateUpdater for ActualStateOfWorld {
    fn mark_volume_as_attached(
        &self,
        volume_name: &UniqueVolumeName,
        spec: &VolumeSpec,
        node: &NodeName,
        device_path: &str,
    ) -> Result<(), VolumeError> {
        let plugin = self.plugin_mgr.find_plugin_by_spec(spec)?;
        let plugin_is_attachable = plugin.as_attachable().is_some();

        let mut entry = self
            .volumes
            .entry(volume_name.clone())
            .or_insert_with(|| VolumeEntry {
                spec: spec.clone(),
                plugin_is_attachable,
                nodes: HashMap::new(),
                device_mounted: false,
                pods: HashMap::new(),
            });
        entry.spec = spec.clone();
        entry.plugin_is_attachable = plugin_is_attachable;
        if let Some(existing) = entry.nodes.get(node) {
            if existing.device_path != device_path {
                info!(
                    volume = %volume_name,
                    %node,
                    old = %existing.device_path,
                    new = %device_path,
                    "device path of attached volume changed"
                );
            }
        }
        entry.nodes.insert(
            node.clone(),
            NodeAttachment {
                device_path: device_path.to_owned(),
                report_as_attached: true,
            },
        );
        debug!(volume = %volume_name, %node, %device_path, "volume marked attached");
        Ok(())
    }

    fn mark_volume_as_detached(
        &self,
        volume_name: &UniqueVolumeName,
        node: &NodeName,
    ) -> Result<(), VolumeError> {
        let Entry::Occupied(mut occupied) = self.volumes.entry(volume_name.clone()) else {
            debug!(volume = %volume_name, %node, "volume not tracked, nothing to detach");
            return Ok(());
        };
        let entry = occupied.get_mut();
        if !entry.nodes.contains_key(node) {
            debug!(volume = %volume_name, %node, "volume not attached to node, nothing to detach");
            return Ok(());
        }
        if entry.nodes.len() == 1 && (entry.device_mounted || !entry.pods.is_empty()) {
            return Err(VolumeError::StateConflict {
                volume: volume_name.clone(),
                reason: format!(
                    "cannot mark detached from {node}: device mounted={}, pod mounts={}",
                    entry.device_mounted,
                    entry.pods.len()
                ),
            });
        }
        entry.nodes.remove(node);
        if entry.nodes.is_empty() {
            occupied.remove();
        }
        debug!(volume = %volume_name, %node, "volume marked detached");
        Ok(())
    }

    fn mark_device_as_mounted(&self, volume_name: &UniqueVolumeName) -> Result<(), VolumeError> {
        let mut entry = self
            .volumes
            .get_mut(volume_name)
            .ok_or_else(|| VolumeError::VolumeNotTracked {
                volume: volume_name.clone(),
            })?;
        entry.device_mounted = true;
        debug!(volume = %volume_name, "device marked mounted");
        Ok(())
    }

    fn mark_device_as_unmounted(
        &self,
        volume_name: &UniqueVolumeName,
    ) -> Result<(), VolumeError> {
        let mut entry = self
            .volumes
            .get_mut(volume_name)
            .ok_or_else(|| VolumeError::VolumeNotTracked {
                volume: volume_name.clone(),
            })?;
        if !entry.pods.is_empty() {
            let mut pods: Vec<String> = entry.pods.keys().map(ToString::to_string).collect();
            pods.sort();
            return Err(VolumeError::StateConflict {
                volume: volume_name.clone(),
                reason: format!("device still mounted for pods {pods:?}"),
            });
        }
        entry.device_mounted = false;
        debug!(volume = %volume_name, "device marked unmounted");
        Ok(())
    }

    fn mark_volume_as_mounted(&self, opts: MarkVolumeMountedOpts) -> Result<(), VolumeError> {
        let mut entry = self
            .volumes
            .get_mut(&opts.volume_name)
            .ok_or_else(|| VolumeError::VolumeNotTracked {
                volume: opts.volume_name.clone(),
            })?;
        let replaced = entry
            .pods
            .insert(
                opts.pod_name.clone(),
                PodMount {
                    pod_uid: opts.pod_uid,
                    plugin_name: opts.plugin_name,
                    attributes: opts.attributes,
                    outer_volume_spec_name: opts.outer_volume_spec_name,
                    volume_gid_value: opts.volume_gid_value,
                    volume_mode: opts.volume_mode,
                },
            )
            .is_some();
        debug!(volume = %opts.volume_name, pod = %opts.pod_name, replaced, "volume marked mounted");
        Ok(())
    }

    fn mark_volume_as_unmounted(
        &self,
        pod_name: &UniquePodName,
        volume_name: &UniqueVolumeName,
    ) -> Result<(), VolumeError> {
        let mut entry = self
            .volumes
            .get_mut(volume_name)
            .ok_or_else(|| VolumeError::VolumeNotTracked {
                volume: volume_name.clone(),
            })?;
        if entry.pods.remove(pod_name).is_some() {
            debug!(volume = %volume_name, pod = %pod_name, "volume marked unmounted");
        }
        Ok(())
    }

    fn add_volume_to_report_as_attached(&self, volume_name: &UniqueVolumeName, node: &NodeName) {
        let attachment = self
            .volumes
            .get_mut(volume_name)
            .map(|mut entry| match entry.nodes.get_mut(node) {
                Some(a) => {
                    a.report_as_attached = true;
                    true
                }
                None => false,
            });
        if attachment != Some(true) {
            warn!(volume = %volume_name, %node, "cannot report unknown attachment as attached");
        }
    }

    fn remove_volume_from_report_as_attached(
        &self,
        volume_name: &UniqueVolumeName,
        node: &NodeName,
    ) -> Result<(), VolumeError> {
        let mut entry = self
            .volumes
            .get_mut(volume_name)
            .ok_or_else(|| VolumeError::VolumeNotTracked {
                volume: volume_name.clone(),
            })?;
        let attachment =
            entry
                .nodes
                .get_mut(node)
                .ok_or_else(|| VolumeError::VolumeNotTracked {
                    volume: volume_name.clone(),
                })?;
        attachment.report_as_attached = false;
        Ok(())
    }

    fn mark_volume_as_resized(
        &self,
        volume_name: &UniqueVolumeName,
        new_size: u64,
        fs_resize_required: bool,
    ) -> Result<(), VolumeError> {
        self.resized.insert(
            volume_name.clone(),
            ResizeRecord {
                size: new_size,
                fs_resize_required,
            },
        );
        if let Some(mut entry) = self.volumes.get_mut(volume_name) {
            entry.spec.capacity_bytes = Some(new_size);
        }
        debug!(volume = %volume_name, new_size, fs_resize_required, "volume marked resized");
        Ok(())
    }

    fn fs_resize_required(&self, volume_name: &UniqueVolumeName) -> bool {
        self.resized
            .get(volume_name)
            .is_some_and(|r| r.fs_resize_required)
    }

    fn mark_fs_resized(&self, volume_name: &UniqueVolumeName) -> Result<(), VolumeError> {
        let mut record =
            self.resized
                .get_mut(volume_name)
                .ok_or_else(|| VolumeError::VolumeNotTracked {
                    volume: volume_name.clone(),
                })?;
        record.fs_resize_required = false;
        Ok(())
    }
}

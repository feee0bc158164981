//! Desired state of world: volumes that pods on this node reference.

use std::collections::HashMap;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::debug;

use crate::error::VolumeError;
use crate::plugin::VolumePluginMgr;
use crate::types::{NodeName, PodRef, UniquePodName, UniqueVolumeName, VolumeSpec, VolumeToMount};
use crate::util;

/// Volume attribute carrying the GID that should own the volume contents.
pub const VOLUME_GID_ATTRIBUTE: &str = "volume.rk8s.io/gid";

#[derive(Debug, Clone)]
struct DesiredPod {
    pod: PodRef,
    outer_volume_spec_name: String,
    remount: bool,
}

#[derive(Debug, Clone)]
struct DesiredVolume {
    spec: VolumeSpec,
    plugin_is_attachable: bool,
    volume_gid_value: Option<String>,
    reported_in_use: bool,
    pods: HashMap<UniquePodName, DesiredPod>,
}

/// Volumes that should be mounted for pods scheduled to `node_name`.
pub struct DesiredStateOfWorld {
    node_name: NodeName,
    volumes: DashMap<UniqueVolumeName, DesiredVolume>,
}

impl DesiredStateOfWorld {
    /// Create an empty table for `node_name`.
    pub fn new(node_name: NodeName) -> Self {
        Self {
            node_name,
            volumes: DashMap::new(),
        }
    }

    /// Node the table describes.
    pub fn node_name(&self) -> &NodeName {
        &self.node_name
    }

    /// Record that `pod` wants `spec` mounted under `outer_volume_spec_name`
    /// and return the volume's unique name.
    ///
    /// Attachable volumes are shared by every pod that references them;
    /// non-attachable volumes get a pod-scoped name.
    pub fn add_pod_to_volume(
        &self,
        pod: &PodRef,
        spec: VolumeSpec,
        outer_volume_spec_name: &str,
        plugin_mgr: &VolumePluginMgr,
    ) -> Result<UniqueVolumeName, VolumeError> {
        let plugin = plugin_mgr.find_plugin_by_spec(&spec)?;
        let plugin_is_attachable = plugin.as_attachable().is_some();
        let pod_name = pod.unique_name();
        let volume_name = if plugin_is_attachable {
            util::unique_volume_name_from_spec(plugin.as_ref(), &spec)?
        } else {
            util::unique_volume_name_for_non_attachable(&pod_name, plugin.as_ref(), &spec)
        };
        let volume_gid_value = spec.source.attributes.get(VOLUME_GID_ATTRIBUTE).cloned();

        let mut entry = self
            .volumes
            .entry(volume_name.clone())
            .or_insert_with(|| DesiredVolume {
                spec: spec.clone(),
                plugin_is_attachable,
                volume_gid_value: volume_gid_value.clone(),
                reported_in_use: false,
                pods: HashMap::new(),
            });
        entry.spec = spec;
        entry.volume_gid_value = volume_gid_value;
        entry.pods.insert(
            pod_name,
            DesiredPod {
                pod: pod.clone(),
                outer_volume_spec_name: outer_volume_spec_name.to_owned(),
                remount: false,
            },
        );
        debug!(volume = %volume_name, pod = %pod.uid, "pod added to desired volume");
        Ok(volume_name)
    }

    /// Forget that `pod_name` wants `volume_name`. The volume entry goes away
    /// with its last pod.
    pub fn delete_pod_from_volume(&self, pod_name: &UniquePodName, volume_name: &UniqueVolumeName) {
        if let Entry::Occupied(mut occupied) = self.volumes.entry(volume_name.clone()) {
            occupied.get_mut().pods.remove(pod_name);
            if occupied.get().pods.is_empty() {
                occupied.remove();
            }
            debug!(volume = %volume_name, pod = %pod_name, "pod removed from desired volume");
        }
    }

    /// Whether any pod wants the volume.
    pub fn volume_exists(&self, volume_name: &UniqueVolumeName) -> bool {
        self.volumes.contains_key(volume_name)
    }

    /// Whether `pod_name` wants the volume.
    pub fn pod_exists_in_volume(
        &self,
        pod_name: &UniquePodName,
        volume_name: &UniqueVolumeName,
    ) -> bool {
        self.volumes
            .get(volume_name)
            .is_some_and(|v| v.pods.contains_key(pod_name))
    }

    /// Ask for every volume of `pod_name` to be mounted again.
    pub fn mark_remount_required(&self, pod_name: &UniquePodName) {
        for mut volume in self.volumes.iter_mut() {
            if let Some(pod) = volume.pods.get_mut(pod_name) {
                pod.remount = true;
            }
        }
    }

    /// Clear the remount request of `(pod_name, volume_name)`.
    pub fn clear_remount(&self, pod_name: &UniquePodName, volume_name: &UniqueVolumeName) {
        if let Some(mut volume) = self.volumes.get_mut(volume_name) {
            if let Some(pod) = volume.pods.get_mut(pod_name) {
                pod.remount = false;
            }
        }
    }

    /// Record which volumes node status lists in `VolumesInUse`; every other
    /// volume is marked as not reported.
    pub fn mark_volumes_reported_in_use(&self, reported: &[UniqueVolumeName]) {
        for mut volume in self.volumes.iter_mut() {
            let in_use = reported.contains(volume.key());
            volume.reported_in_use = in_use;
        }
    }

    /// One [`VolumeToMount`] per `(pod, volume)` pair, sorted by volume then pod.
    pub fn get_volumes_to_mount(&self) -> Vec<VolumeToMount> {
        let mut out = Vec::new();
        for volume in self.volumes.iter() {
            for (pod_name, desired) in &volume.pods {
                out.push(VolumeToMount {
                    volume_name: volume.key().clone(),
                    pod_name: pod_name.clone(),
                    pod: desired.pod.clone(),
                    volume_spec: volume.spec.clone(),
                    outer_volume_spec_name: desired.outer_volume_spec_name.clone(),
                    plugin_is_attachable: volume.plugin_is_attachable,
                    device_path: String::new(),
                    volume_gid_value: volume.volume_gid_value.clone(),
                    reported_in_use: volume.reported_in_use,
                    node_name: self.node_name.clone(),
                    remount: desired.remount,
                });
            }
        }
        out.sort_by(|a, b| (&a.volume_name, &a.pod_name).cmp(&(&b.volume_name, &b.pod_name)));
        out
    }
}

//! Reconciler: drives the actual state of world toward the desired state.
//!
//! Each pass starts whatever operations are needed and returns without
//! waiting for them. Operations that are already in flight or backing off
//! are rejected by the executor; those rejections are expected and logged at
//! `debug`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::ExecutorConfig;
use crate::error::VolumeError;
use crate::executor::OperationExecutor;
use crate::node_client::NodeClient;
use crate::state::{ActualStateOfWorld, ActualStateUpdater, DesiredStateOfWorld};
use crate::types::{UniqueVolumeName, VolumeToAttach};

pub struct Reconciler {
    executor: Arc<OperationExecutor>,
    dsw: Arc<DesiredStateOfWorld>,
    asw: Arc<ActualStateOfWorld>,
    node_client: Arc<dyn NodeClient>,
    controller_attach_detach_enabled: bool,
    loop_period: Duration,
}

impl Reconciler {
    pub fn new(
        executor: Arc<OperationExecutor>,
        dsw: Arc<DesiredStateOfWorld>,
        asw: Arc<ActualStateOfWorld>,
        node_client: Arc<dyn NodeClient>,
        config: &ExecutorConfig,
    ) -> Self {
        Self {
            executor,
            dsw,
            asw,
            node_client,
            controller_attach_detach_enabled: config.controller_attach_detach_enabled,
            loop_period: config.reconciler_loop_period(),
        }
    }

    /// Reconcile every `loop_period` until `stop` turns `true` or its sender
    /// is dropped.
    pub async fn run(&self, mut stop: watch::Receiver<bool>) {
        info!(node = %self.dsw.node_name(), period = ?self.loop_period, "reconciler started");
        let mut ticker = tokio::time::interval(self.loop_period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.reconcile_once().await,
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
        }
        info!(node = %self.dsw.node_name(), "reconciler stopped");
    }

    /// One reconciliation pass.
    pub async fn reconcile_once(&self) {
        self.unmount_volumes();
        if self.controller_attach_detach_enabled {
            self.sync_reported_in_use().await;
        }
        self.mount_attach_volumes();
        self.unmount_detach_devices();
    }

    fn asw(&self) -> Arc<dyn ActualStateUpdater> {
        self.asw.clone()
    }

    /// Pod mounts that are no longer desired.
    fn unmount_volumes(&self) {
        for mounted in self.asw.get_mounted_volumes() {
            if self
                .dsw
                .pod_exists_in_volume(&mounted.pod_name, &mounted.volume_name)
            {
                continue;
            }
            let volume = mounted.volume_name.clone();
            started(
                "unmount volume",
                &volume,
                self.executor.unmount_volume(mounted, self.asw()),
            );
        }
    }

    async fn sync_reported_in_use(&self) {
        match self.node_client.get_node(self.dsw.node_name()).await {
            Ok(Some(node)) => self
                .dsw
                .mark_volumes_reported_in_use(&node.status.volumes_in_use),
            Ok(None) => warn!(node = %self.dsw.node_name(), "node object not found"),
            Err(e) => warn!(node = %self.dsw.node_name(), "failed to read node status: {e}"),
        }
    }

    /// Desired pod volumes that are not attached or not mounted yet.
    fn mount_attach_volumes(&self) {
        let node = self.dsw.node_name();
        for mut volume in self.dsw.get_volumes_to_mount() {
            let name = volume.volume_name.clone();
            let Some(device_path) = self.asw.is_volume_attached(&name, node) else {
                if self.controller_attach_detach_enabled || !volume.plugin_is_attachable {
                    started(
                        "verify controller attached volume",
                        &name,
                        self.executor
                            .verify_controller_attached_volume(volume, self.asw()),
                    );
                } else {
                    let to_attach = VolumeToAttach {
                        volume_name: name.clone(),
                        volume_spec: volume.volume_spec,
                        node_name: node.clone(),
                        scheduled_pods: vec![volume.pod],
                    };
                    started(
                        "attach volume",
                        &name,
                        self.executor.attach_volume(to_attach, self.asw()),
                    );
                }
                continue;
            };

            let mounted = self.asw.pod_exists_in_volume(&volume.pod_name, &name);
            if mounted && !volume.remount {
                continue;
            }
            volume.remount = mounted;
            volume.device_path = device_path;
            let pod_name = volume.pod_name.clone();
            let result = self.executor.mount_volume(volume, self.asw());
            if result.is_ok() {
                self.dsw.clear_remount(&pod_name, &name);
            }
            started("mount volume", &name, result);
        }
    }

    /// Attached volumes with no pod left: release the device, then detach.
    fn unmount_detach_devices(&self) {
        let node = self.dsw.node_name();
        for attached in self.asw.get_unmounted_volumes() {
            if &attached.node_name != node
                || self.dsw.volume_exists(&attached.volume_name)
                || self
                    .executor
                    .is_operation_pending(&attached.volume_name, None, None)
            {
                continue;
            }
            let name = attached.volume_name.clone();
            if attached.device_mounted {
                started(
                    "unmount device",
                    &name,
                    self.executor.unmount_device(attached, self.asw()),
                );
            } else if self.controller_attach_detach_enabled || !attached.plugin_is_attachable {
                // The controller detaches; only forget the attachment locally.
                if let Err(e) = self.asw.mark_volume_as_detached(&name, node) {
                    warn!(volume = %name, "failed to mark volume as detached: {e}");
                }
            } else {
                started(
                    "detach volume",
                    &name,
                    self.executor.detach_volume(attached, false, self.asw()),
                );
            }
        }
    }
}

fn started(what: &str, volume: &UniqueVolumeName, result: Result<(), VolumeError>) {
    match result {
        Ok(()) => debug!(volume = %volume, "{what} started"),
        Err(e) if e.is_expected_executor_rejection() => {
            debug!(volume = %volume, "{what} not started: {e}")
        }
        Err(e) => error!(volume = %volume, "{what} could not be started: {e}"),
    }
}

//! The reconciler loop converges the actual state onto the desired state.

use std::sync::Arc;
use std::time::Duration;

use libvolume::{DesiredStateOfWorld, ExecutorConfig, OperationExecutor, Reconciler};
use tokio::sync::watch;

use crate::common::{TestNode, disk, pod};

async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached");
}

#[tokio::test(flavor = "multi_thread")]
async fn pod_volume_mounted_and_released() {
    let config = ExecutorConfig {
        wait_for_attach_timeout_secs: 5,
        initial_backoff_millis: 10,
        max_backoff_millis: 50,
        reconciler_loop_period_millis: 10,
        controller_attach_detach_enabled: false,
        ..Default::default()
    };
    let t = TestNode::with_config(config.clone());
    let dsw = Arc::new(DesiredStateOfWorld::new(t.node()));
    let reconciler = Reconciler::new(
        Arc::new(OperationExecutor::new(t.generator.clone(), &config)),
        Arc::clone(&dsw),
        Arc::clone(&t.asw),
        t.nodes.clone(),
        &config,
    );
    let (stop_tx, stop_rx) = watch::channel(false);
    let handle = tokio::spawn(async move { reconciler.run(stop_rx).await });

    let web = pod("web", "uid-1");
    let name = dsw
        .add_pod_to_volume(&web, disk("vol-a", "disk-1"), "data", &t.plugin_mgr)
        .unwrap();
    eventually(|| t.asw.pod_exists_in_volume(&web.unique_name(), &name)).await;
    assert!(t.asw.is_device_mounted(&name));

    dsw.delete_pod_from_volume(&web.unique_name(), &name);
    eventually(|| !t.asw.volume_exists(&name)).await;
    assert_eq!(t.plugin.detached().len(), 1);

    stop_tx.send(true).unwrap();
    handle.await.unwrap();
}

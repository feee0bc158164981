//! Raw block volumes are mapped through device symlinks when block support
//! is enabled.

use std::path::Path;

use libvolume::testing::{FAKE_DEVICE_PATH, FakeCall};
use libvolume::{ExecutorConfig, VolumeMode};

use crate::common::{TestNode, disk, pod, to_mount};

fn block_node() -> TestNode {
    TestNode::with_config(ExecutorConfig {
        wait_for_attach_timeout_secs: 5,
        initial_backoff_millis: 50,
        max_backoff_millis: 200,
        block_volume_enabled: true,
        ..Default::default()
    })
}

#[tokio::test]
async fn map_unmap_and_release_device() {
    let t = block_node();
    let spec = disk("vol-a", "disk-1").with_block_mode();
    let name = t.mark_attached(&spec);
    let web = pod("web", "uid-1");

    t.executor
        .mount_volume(to_mount(&name, &spec, &web, true), t.state())
        .unwrap();
    t.executor.wait().await;

    let global_link = t.tmp.path().join("plugins/fake/volumeDevices/disk-1/uid-1");
    let pod_link = t.tmp.path().join("pods/uid-1/volumeDevices/fake/vol-a");
    assert_eq!(std::fs::read_link(&global_link).unwrap(), Path::new(FAKE_DEVICE_PATH));
    assert_eq!(std::fs::read_link(&pod_link).unwrap(), Path::new(FAKE_DEVICE_PATH));
    assert_eq!(t.mounted(&web, &name).volume_mode, VolumeMode::Block);
    assert!(t.asw.is_device_mounted(&name));
    assert_eq!(t.plugin.calls(FakeCall::MountDevice), 0);

    t.executor
        .unmount_volume(t.mounted(&web, &name), t.state())
        .unwrap();
    t.executor.wait().await;
    assert!(std::fs::symlink_metadata(&pod_link).is_err());
    assert!(std::fs::symlink_metadata(&global_link).is_err());

    t.executor
        .unmount_device(t.attached(&name), t.state())
        .unwrap();
    t.executor.wait().await;
    assert_eq!(t.plugin.calls(FakeCall::TearDownDevice), 1);
    assert!(!t.asw.is_device_mounted(&name));
}

#[tokio::test]
async fn device_kept_while_another_pod_maps_it() {
    let t = block_node();
    let spec = disk("vol-a", "disk-1").with_block_mode();
    let name = t.mark_attached(&spec);
    let (web, worker) = (pod("web", "uid-1"), pod("worker", "uid-2"));
    for p in [&web, &worker] {
        t.executor
            .mount_volume(to_mount(&name, &spec, p, true), t.state())
            .unwrap();
        t.executor.wait().await;
    }

    t.executor
        .unmount_volume(t.mounted(&web, &name), t.state())
        .unwrap();
    t.executor.wait().await;

    // Release is attempted directly; the remaining pod link blocks it.
    t.executor
        .unmount_device(t.attached(&name), t.state())
        .unwrap();
    t.executor.wait().await;
    assert_eq!(t.plugin.calls(FakeCall::TearDownDevice), 0);
    assert!(t.asw.is_device_mounted(&name));
}

#[tokio::test]
async fn block_mode_mounts_as_filesystem_when_disabled() {
    let t = TestNode::new();
    let spec = disk("vol-a", "disk-1").with_block_mode();
    let name = t.mark_attached(&spec);
    let web = pod("web", "uid-1");

    t.executor
        .mount_volume(to_mount(&name, &spec, &web, true), t.state())
        .unwrap();
    t.executor.wait().await;

    assert_eq!(t.plugin.calls(FakeCall::MountDevice), 1);
    assert_eq!(t.mounted(&web, &name).volume_mode, VolumeMode::Filesystem);
}

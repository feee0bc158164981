//! The global device mount is kept while other mount points reference it.

use libvolume::ActualStateUpdater;
use libvolume::testing::FakeCall;

use crate::common::{TestNode, disk};

#[tokio::test]
async fn unmount_device_denied_with_references() {
    let t = TestNode::new();
    let spec = disk("vol-a", "disk-1");
    let name = t.mark_attached(&spec);
    t.asw.mark_device_as_mounted(&name).unwrap();
    t.mounter.set_mount_refs(
        &t.device_mount_path("disk-1"),
        vec!["/var/lib/rkl/pods/a/volumes/fake/vol-a".into(), "/mnt/debug".into()],
    );

    t.executor
        .unmount_device(t.attached(&name), t.state())
        .unwrap();
    t.executor.wait().await;

    assert_eq!(t.plugin.calls(FakeCall::UnmountDevice), 0);
    assert!(t.asw.is_device_mounted(&name));
}

#[tokio::test]
async fn unmount_device_retried_after_references_go_away() {
    let t = TestNode::new();
    let spec = disk("vol-a", "disk-1");
    let name = t.mark_attached(&spec);
    t.asw.mark_device_as_mounted(&name).unwrap();
    let path = t.device_mount_path("disk-1");
    t.mounter.set_mount_refs(&path, vec!["/mnt/debug".into()]);

    t.executor
        .unmount_device(t.attached(&name), t.state())
        .unwrap();
    t.executor.wait().await;

    t.mounter.set_mount_refs(&path, vec![]);
    tokio::time::sleep(std::time::Duration::from_millis(60)).await;
    t.executor
        .unmount_device(t.attached(&name), t.state())
        .unwrap();
    t.executor.wait().await;

    assert_eq!(t.plugin.calls(FakeCall::UnmountDevice), 1);
    assert!(!t.asw.is_device_mounted(&name));
}

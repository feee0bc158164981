//! A failed actual-state update after a successful plugin call is logged;
//! the operation itself still succeeds.

use libvolume::ActualStateUpdater;
use libvolume::testing::FakeCall;

use crate::common::{TestNode, disk, pod, to_attach, to_mount};

#[tokio::test]
async fn attach_succeeds_when_marking_attached_fails() {
    let t = TestNode::new();
    let spec = disk("vol-a", "disk-1");
    let name = "fake/disk-1".into();
    let counting = t.counting();
    counting.fail("mark_volume_as_attached");

    let op = t
        .generator
        .generate_attach_volume(to_attach(&name, &spec), counting.clone())
        .unwrap();
    op.execute().await.unwrap();

    assert_eq!(t.plugin.calls(FakeCall::Attach), 1);
    assert_eq!(counting.calls("mark_volume_as_attached"), 1);
    assert!(!t.asw.volume_exists(&name));
}

#[tokio::test]
async fn unmount_succeeds_when_marking_unmounted_fails() {
    let t = TestNode::new();
    let spec = disk("vol-a", "disk-1");
    let name = t.mark_attached(&spec);
    let web = pod("web", "uid-1");
    t.executor
        .mount_volume(to_mount(&name, &spec, &web, true), t.state())
        .unwrap();
    t.executor.wait().await;

    let counting = t.counting();
    counting.fail("mark_volume_as_unmounted");
    let op = t
        .generator
        .generate_unmount_volume(t.mounted(&web, &name), counting.clone())
        .unwrap();
    op.execute().await.unwrap();

    assert_eq!(t.plugin.calls(FakeCall::TearDown), 1);
    assert_eq!(counting.calls("mark_volume_as_unmounted"), 1);
    assert!(t.asw.pod_exists_in_volume(&web.unique_name(), &name));
}

#[tokio::test]
async fn unmount_device_succeeds_when_marking_device_unmounted_fails() {
    let t = TestNode::new();
    let spec = disk("vol-a", "disk-1");
    let name = t.mark_attached(&spec);
    t.asw.mark_device_as_mounted(&name).unwrap();

    let counting = t.counting();
    counting.fail("mark_device_as_unmounted");
    let op = t
        .generator
        .generate_unmount_device(t.attached(&name), counting.clone())
        .unwrap();
    op.execute().await.unwrap();

    assert_eq!(t.plugin.calls(FakeCall::UnmountDevice), 1);
    assert_eq!(counting.calls("mark_device_as_unmounted"), 1);
    assert!(t.asw.is_device_mounted(&name));
}

//! Backend expansion followed by the node-side filesystem resize on the next
//! device mount.

use libvolume::testing::FakeCall;
use libvolume::{ActualStateUpdater, ObjectReference, VolumeToExpand};

use crate::common::{TestNode, disk, pod, to_mount};

fn claim() -> ObjectReference {
    ObjectReference {
        kind: "PersistentVolumeClaim".into(),
        namespace: "default".into(),
        name: "data".into(),
        uid: "claim-1".into(),
    }
}

#[tokio::test]
async fn expand_then_mount_resizes_filesystem() {
    let t = TestNode::new();
    let spec = disk("vol-a", "disk-1").with_capacity(1 << 30);
    let name = t.mark_attached(&spec);

    t.executor
        .expand_volume(
            VolumeToExpand {
                volume_name: name.clone(),
                volume_spec: spec.clone(),
                claim: claim(),
                requested_size: 2 << 30,
            },
            t.state(),
        )
        .unwrap();
    t.executor.wait().await;
    assert_eq!(t.plugin.calls(FakeCall::Expand), 1);
    assert_eq!(t.asw.volume_size(&name), Some(2 << 30));
    assert!(t.asw.fs_resize_required(&name));

    let web = pod("web", "uid-1");
    t.executor
        .mount_volume(to_mount(&name, &spec, &web, true), t.state())
        .unwrap();
    t.executor.wait().await;

    assert_eq!(t.mounter.resize_calls(), 1);
    assert!(!t.asw.fs_resize_required(&name));
    assert!(t
        .recorder
        .reasons()
        .contains(&"FileSystemResizeSuccessful".to_string()));
    assert!(t.asw.pod_exists_in_volume(&web.unique_name(), &name));
}

#[tokio::test]
async fn failed_resize_keeps_request_pending() {
    let t = TestNode::new();
    let spec = disk("vol-a", "disk-1").with_capacity(1 << 30);
    let name = t.mark_attached(&spec);
    t.asw.mark_volume_as_resized(&name, 2 << 30, true).unwrap();
    t.mounter.fail_resize(true);

    let web = pod("web", "uid-1");
    t.executor
        .mount_volume(to_mount(&name, &spec, &web, true), t.state())
        .unwrap();
    t.executor.wait().await;

    assert!(t.asw.fs_resize_required(&name));
    assert!(t
        .recorder
        .reasons()
        .contains(&"FileSystemResizeFailed".to_string()));
}

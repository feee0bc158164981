//! Mounting a volume that is already mounted for the pod leaves exactly one
//! mount record.

use libvolume::testing::FakeCall;

use crate::common::{TestNode, disk, pod, to_mount};

#[tokio::test]
async fn second_mount_replaces_record() {
    let t = TestNode::new();
    let spec = disk("vol-a", "disk-1");
    let name = t.mark_attached(&spec);
    let web = pod("web", "uid-1");

    t.executor
        .mount_volume(to_mount(&name, &spec, &web, true), t.state())
        .unwrap();
    t.executor.wait().await;

    let mut again = to_mount(&name, &spec, &web, true);
    again.remount = true;
    t.executor.mount_volume(again, t.state()).unwrap();
    t.executor.wait().await;

    assert_eq!(t.plugin.calls(FakeCall::SetUp), 2);
    assert_eq!(t.asw.get_mounted_volumes_for_pod(&web.unique_name()).len(), 1);
    assert_eq!(t.asw.get_mounted_volumes().len(), 1);
    assert!(t.asw.is_device_mounted(&name));
}

#[tokio::test]
async fn two_pods_share_one_device_mount() {
    let t = TestNode::new();
    let spec = disk("vol-a", "disk-1");
    let name = t.mark_attached(&spec);
    let (web, worker) = (pod("web", "uid-1"), pod("worker", "uid-2"));

    t.executor
        .mount_volume(to_mount(&name, &spec, &web, true), t.state())
        .unwrap();
    t.executor.wait().await;
    t.executor
        .mount_volume(to_mount(&name, &spec, &worker, true), t.state())
        .unwrap();
    t.executor.wait().await;

    assert_eq!(t.asw.get_mounted_volumes().len(), 2);
    assert!(t.asw.pod_exists_in_volume(&web.unique_name(), &name));
    assert!(t.asw.pod_exists_in_volume(&worker.unique_name(), &name));
}

//! A volume still listed in node `VolumesInUse` is not detached.

use libvolume::testing::FakeCall;

use crate::common::{TestNode, disk};

#[tokio::test]
async fn volume_in_use_is_not_detached() {
    let t = TestNode::new();
    let spec = disk("vol-a", "disk-1");
    let name = t.mark_attached(&spec);
    t.nodes.set_volumes_in_use(&t.node(), vec![name.clone()]);
    let counting = t.counting();

    t.executor
        .detach_volume(t.attached(&name), true, counting.clone())
        .unwrap();
    t.executor.wait().await;

    assert_eq!(t.plugin.calls(FakeCall::Detach), 0);
    assert_eq!(counting.calls("remove_volume_from_report_as_attached"), 1);
    assert_eq!(counting.calls("add_volume_to_report_as_attached"), 1);
    assert_eq!(counting.calls("mark_volume_as_detached"), 0);
    let reported = t.asw.get_volumes_to_report_attached(&t.node());
    assert_eq!(reported.len(), 1);
    assert_eq!(reported[0].name, name);
}

#[tokio::test]
async fn unused_volume_is_detached() {
    let t = TestNode::new();
    let spec = disk("vol-a", "disk-1");
    let name = t.mark_attached(&spec);

    t.executor
        .detach_volume(t.attached(&name), true, t.state())
        .unwrap();
    t.executor.wait().await;

    assert_eq!(t.plugin.detached(), vec![("disk-1".to_string(), t.node())]);
    assert!(!t.asw.volume_exists(&name));
}

#[tokio::test]
async fn failed_detach_keeps_reporting_attachment() {
    let t = TestNode::new();
    let spec = disk("vol-a", "disk-1");
    let name = t.mark_attached(&spec);
    t.plugin.fail(libvolume::testing::FakeFailure::Detach);

    t.executor
        .detach_volume(t.attached(&name), false, t.state())
        .unwrap();
    t.executor.wait().await;

    assert!(t.asw.is_volume_attached(&name, &t.node()).is_some());
    assert_eq!(t.asw.get_volumes_to_report_attached(&t.node()).len(), 1);
    assert!(t
        .recorder
        .reasons()
        .contains(&"FailedDetachVolume".to_string()));
}

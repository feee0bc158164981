//! Bulk attach verification drops exactly the attachments the plugin no
//! longer reports.

use std::collections::HashMap;

use libvolume::testing::{FakeCall, FakeFailure};

use crate::common::{TestNode, disk};

#[tokio::test]
async fn missing_attachment_marked_detached_once() {
    let t = TestNode::new();
    let kept = t.mark_attached(&disk("vol-a", "disk-1"));
    let gone = t.mark_attached(&disk("vol-b", "disk-2"));
    t.plugin.set_attached("disk-2", false);
    let counting = t.counting();

    let attached = HashMap::from([(t.node(), t.asw.get_attached_volumes_for_node(&t.node()))]);
    t.executor
        .verify_volumes_are_attached(attached, counting.clone());
    t.executor.wait().await;

    assert_eq!(t.plugin.calls(FakeCall::VolumesAreAttached), 1);
    assert_eq!(counting.calls("mark_volume_as_detached"), 1);
    assert!(t.asw.volume_exists(&kept));
    assert!(!t.asw.volume_exists(&gone));
}

#[tokio::test]
async fn plugin_error_changes_nothing() {
    let t = TestNode::new();
    let name = t.mark_attached(&disk("vol-a", "disk-1"));
    t.plugin.fail(FakeFailure::VolumesAreAttached);

    t.executor
        .verify_volumes_are_attached_per_node(
            t.asw.get_attached_volumes_for_node(&t.node()),
            t.node(),
            t.state(),
        )
        .unwrap();
    t.executor.wait().await;

    assert!(t.asw.volume_exists(&name));
}

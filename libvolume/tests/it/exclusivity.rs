//! At most one operation per key is in flight.

use std::time::Duration;

use libvolume::VolumeError;
use libvolume::testing::FakeCall;

use crate::common::{NODE, TestNode, disk, to_attach};

#[tokio::test(flavor = "multi_thread")]
async fn detach_rejected_while_attach_in_flight() {
    let t = TestNode::new();
    let spec = disk("vol-a", "disk-1");
    let name = "fake/disk-1".into();
    t.plugin.set_attach_delay(Duration::from_millis(200));

    t.executor
        .attach_volume(to_attach(&name, &spec), t.state())
        .unwrap();
    assert!(t
        .executor
        .is_operation_pending(&name, None, Some(&NODE.into())));

    let attached = libvolume::AttachedVolume {
        volume_name: name.clone(),
        volume_spec: spec.clone(),
        node_name: NODE.into(),
        plugin_is_attachable: true,
        device_path: String::new(),
        device_mounted: false,
    };
    let err = t
        .executor
        .detach_volume(attached, false, t.state())
        .unwrap_err();
    assert!(matches!(err, VolumeError::OperationAlreadyExists { .. }));

    t.executor.wait().await;
    assert_eq!(t.plugin.calls(FakeCall::Attach), 1);
    assert_eq!(t.plugin.calls(FakeCall::Detach), 0);
    assert_eq!(t.plugin.max_concurrent_attach_detach(), 1);
    assert!(t.asw.is_volume_attached(&name, &NODE.into()).is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn different_volumes_attach_concurrently() {
    let t = TestNode::new();
    t.plugin.set_attach_delay(Duration::from_millis(100));
    for handle in ["disk-1", "disk-2"] {
        let spec = disk(handle, handle);
        let name = format!("fake/{handle}").into();
        t.executor
            .attach_volume(to_attach(&name, &spec), t.state())
            .unwrap();
    }
    t.executor.wait().await;

    assert_eq!(t.plugin.calls(FakeCall::Attach), 2);
    assert_eq!(t.asw.get_attached_volumes().len(), 2);
}

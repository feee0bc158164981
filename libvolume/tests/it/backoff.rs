//! A failed key is refused until its backoff expires.

use std::time::Duration;

use libvolume::VolumeError;
use libvolume::testing::{FakeCall, FakeFailure};

use crate::common::{TestNode, disk, pod, to_attach};

#[tokio::test]
async fn retry_refused_until_backoff_expires() {
    let t = TestNode::new();
    let spec = disk("vol-a", "disk-1");
    let name = "fake/disk-1".into();
    let mut volume = to_attach(&name, &spec);
    volume.scheduled_pods = vec![pod("web", "uid-1")];
    t.plugin.fail(FakeFailure::Attach);

    t.executor.attach_volume(volume.clone(), t.state()).unwrap();
    t.executor.wait().await;

    let events = t.recorder.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].reason, "FailedAttachVolume");
    assert_eq!(events[0].object.kind, "Pod");

    let err = t
        .executor
        .attach_volume(volume.clone(), t.state())
        .unwrap_err();
    assert!(matches!(err, VolumeError::BackoffNotExpired { .. }));
    assert_eq!(t.plugin.calls(FakeCall::Attach), 1);

    t.plugin.clear_failure(FakeFailure::Attach);
    tokio::time::sleep(Duration::from_millis(70)).await;
    t.executor.attach_volume(volume, t.state()).unwrap();
    t.executor.wait().await;

    assert_eq!(t.plugin.calls(FakeCall::Attach), 2);
    assert!(t.asw.is_volume_attached(&name, &t.node()).is_some());
}

#[tokio::test]
async fn backoff_is_per_key() {
    let t = TestNode::new();
    t.plugin.fail(FakeFailure::Attach);
    let (a, b) = (disk("vol-a", "disk-1"), disk("vol-b", "disk-2"));

    t.executor
        .attach_volume(to_attach(&"fake/disk-1".into(), &a), t.state())
        .unwrap();
    t.executor.wait().await;

    t.plugin.clear_failure(FakeFailure::Attach);
    t.executor
        .attach_volume(to_attach(&"fake/disk-2".into(), &b), t.state())
        .unwrap();
    t.executor.wait().await;
    assert!(t.asw.volume_exists(&"fake/disk-2".into()));
}

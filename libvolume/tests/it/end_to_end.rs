//! Full lifecycle of an attachable volume through the executor.

use libvolume::testing::{FAKE_DEVICE_PATH, FakeCall};
use libvolume::{NodeAffinity, NodeSelectorOperator, NodeSelectorRequirement, NodeSelectorTerm};

use crate::common::{TestNode, disk, pod, to_attach, to_mount};

fn zone(value: &str) -> NodeAffinity {
    NodeAffinity {
        required: vec![NodeSelectorTerm {
            match_expressions: vec![NodeSelectorRequirement {
                key: "zone".into(),
                operator: NodeSelectorOperator::In,
                values: vec![value.into()],
            }],
        }],
    }
}

#[tokio::test]
async fn attach_mount_unmount_detach() {
    let t = TestNode::new();
    let spec = disk("vol-a", "disk-1").with_node_affinity(zone("a"));
    let name = "fake/disk-1".into();
    let web = pod("web", "uid-1");

    t.executor
        .attach_volume(to_attach(&name, &spec), t.state())
        .unwrap();
    t.executor.wait().await;
    assert_eq!(
        t.asw.is_volume_attached(&name, &t.node()).as_deref(),
        Some(FAKE_DEVICE_PATH)
    );

    t.executor
        .mount_volume(to_mount(&name, &spec, &web, true), t.state())
        .unwrap();
    t.executor.wait().await;
    assert!(t.asw.is_device_mounted(&name));
    assert!(t.asw.pod_exists_in_volume(&web.unique_name(), &name));
    assert_eq!(t.recorder.reasons(), vec!["SuccessfulMountVolume".to_string()]);

    t.executor
        .unmount_volume(t.mounted(&web, &name), t.state())
        .unwrap();
    t.executor.wait().await;
    assert!(!t.asw.pod_exists_in_volume(&web.unique_name(), &name));
    assert_eq!(t.asw.get_unmounted_volumes().len(), 1);

    t.executor
        .unmount_device(t.attached(&name), t.state())
        .unwrap();
    t.executor.wait().await;
    assert!(!t.asw.is_device_mounted(&name));

    t.executor
        .detach_volume(t.attached(&name), true, t.state())
        .unwrap();
    t.executor.wait().await;
    assert!(!t.asw.volume_exists(&name));

    for call in [
        FakeCall::Attach,
        FakeCall::WaitForAttach,
        FakeCall::MountDevice,
        FakeCall::SetUp,
        FakeCall::TearDown,
        FakeCall::UnmountDevice,
        FakeCall::Detach,
    ] {
        assert_eq!(t.plugin.calls(call), 1, "{call:?}");
    }
}

#[tokio::test]
async fn affinity_mismatch_blocks_mount() {
    let t = TestNode::new();
    let spec = disk("vol-a", "disk-1").with_node_affinity(zone("b"));
    let name = t.mark_attached(&spec);
    let web = pod("web", "uid-1");

    t.executor
        .mount_volume(to_mount(&name, &spec, &web, true), t.state())
        .unwrap();
    t.executor.wait().await;

    assert_eq!(t.plugin.calls(FakeCall::MountDevice), 0);
    assert!(!t.asw.pod_exists_in_volume(&web.unique_name(), &name));
    assert_eq!(t.recorder.reasons(), vec!["FailedMountVolume".to_string()]);
}

#[tokio::test]
async fn non_attachable_volume_mounts_per_pod() {
    let t = TestNode::new();
    let spec = libvolume::VolumeSpec::new("scratch", "local", "dir-1");
    let (web, worker) = (pod("web", "uid-1"), pod("worker", "uid-2"));

    for p in [&web, &worker] {
        let name = libvolume::UniqueVolumeName(format!("local/{}-scratch", p.uid));
        t.executor
            .verify_controller_attached_volume(to_mount(&name, &spec, p, false), t.state())
            .unwrap();
    }
    t.executor.wait().await;
    for p in [&web, &worker] {
        let name = libvolume::UniqueVolumeName(format!("local/{}-scratch", p.uid));
        t.executor
            .mount_volume(to_mount(&name, &spec, p, false), t.state())
            .unwrap();
    }
    t.executor.wait().await;

    assert_eq!(t.asw.get_mounted_volumes().len(), 2);
    assert_eq!(t.local.calls(FakeCall::SetUp), 2);
    assert_eq!(t.plugin.calls(FakeCall::Attach), 0);
}

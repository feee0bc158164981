//! Node fixture wiring the executor to in-memory fakes.

use std::sync::Arc;

use libvolume::plugin::VolumePlugin;
use libvolume::testing::{
    CountingStateUpdater, FAKE_DEVICE_PATH, FakeMounter, FakeNodeClient, FakePluginState,
    FakeRecorder, FakeVolumePlugin,
};
use libvolume::util::block::LinuxBlockPathHandler;
use libvolume::{
    ActualStateOfWorld, ActualStateUpdater, AttachedVolume, ExecutorConfig, MountedVolume,
    NodeName, OperationExecutor, OperationGenerator, PodRef, UniqueVolumeName, VolumePluginMgr,
    VolumeSpec, VolumeToAttach, VolumeToMount,
};
use tempfile::TempDir;

pub const NODE: &str = "node-1";

/// One node: an attachable `fake` plugin with block and expansion support
/// and a non-attachable `local` plugin, all rooted in a temp dir.
pub struct TestNode {
    pub plugin: Arc<FakePluginState>,
    pub local: Arc<FakePluginState>,
    pub nodes: Arc<FakeNodeClient>,
    pub recorder: Arc<FakeRecorder>,
    pub mounter: Arc<FakeMounter>,
    pub asw: Arc<ActualStateOfWorld>,
    pub plugin_mgr: Arc<VolumePluginMgr>,
    pub generator: OperationGenerator,
    pub executor: OperationExecutor,
    pub config: ExecutorConfig,
    pub tmp: TempDir,
}

impl TestNode {
    pub fn new() -> Self {
        Self::with_config(ExecutorConfig {
            wait_for_attach_timeout_secs: 5,
            initial_backoff_millis: 50,
            max_backoff_millis: 200,
            ..Default::default()
        })
    }

    pub fn with_config(config: ExecutorConfig) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let fake = FakeVolumePlugin::attachable("fake")
            .with_block()
            .with_expansion(true)
            .with_base_dir(tmp.path());
        let local = FakeVolumePlugin::non_attachable("local")
            .with_block()
            .with_base_dir(tmp.path());
        let (plugin, local_state) = (fake.state(), local.state());
        let plugins: Vec<Arc<dyn VolumePlugin>> = vec![Arc::new(fake), Arc::new(local)];
        let plugin_mgr = Arc::new(VolumePluginMgr::new(plugins).unwrap());

        let nodes = Arc::new(FakeNodeClient::new());
        nodes.add_node_with_labels(NODE, &[("zone", "a")]);
        let recorder = Arc::new(FakeRecorder::new());
        let mounter = Arc::new(FakeMounter::new());
        let generator = OperationGenerator::new(
            nodes.clone(),
            Arc::clone(&plugin_mgr),
            recorder.clone(),
            mounter.clone(),
            Arc::new(LinuxBlockPathHandler::new()),
            config.check_node_capabilities_before_mount,
        );
        let executor = OperationExecutor::new(generator.clone(), &config);
        Self {
            plugin,
            local: local_state,
            nodes,
            recorder,
            mounter,
            asw: Arc::new(ActualStateOfWorld::new(Arc::clone(&plugin_mgr))),
            plugin_mgr,
            generator,
            executor,
            config,
            tmp,
        }
    }

    pub fn state(&self) -> Arc<dyn ActualStateUpdater> {
        self.asw.clone()
    }

    pub fn counting(&self) -> Arc<CountingStateUpdater> {
        Arc::new(CountingStateUpdater::new(Arc::clone(&self.asw)))
    }

    pub fn node(&self) -> NodeName {
        NODE.into()
    }

    /// Record `spec` as attached to the node at the fake device path and
    /// return its unique name.
    pub fn mark_attached(&self, spec: &VolumeSpec) -> UniqueVolumeName {
        let name = UniqueVolumeName(format!("fake/{}", spec.source.volume_handle));
        self.asw
            .mark_volume_as_attached(&name, spec, &self.node(), FAKE_DEVICE_PATH)
            .unwrap();
        name
    }

    pub fn attached(&self, name: &UniqueVolumeName) -> AttachedVolume {
        self.asw
            .get_attached_volumes()
            .into_iter()
            .find(|v| &v.volume_name == name)
            .unwrap()
    }

    pub fn mounted(&self, pod: &PodRef, name: &UniqueVolumeName) -> MountedVolume {
        self.asw
            .get_mounted_volumes_for_pod(&pod.unique_name())
            .into_iter()
            .find(|v| &v.volume_name == name)
            .unwrap()
    }

    pub fn device_mount_path(&self, handle: &str) -> String {
        self.tmp
            .path()
            .join("plugins/fake/mounts")
            .join(handle)
            .to_string_lossy()
            .into_owned()
    }
}

pub fn disk(spec_name: &str, handle: &str) -> VolumeSpec {
    VolumeSpec::new(spec_name, "fake", handle)
}

pub fn pod(name: &str, uid: &str) -> PodRef {
    PodRef::new("default", name, uid)
}

pub fn to_attach(name: &UniqueVolumeName, spec: &VolumeSpec) -> VolumeToAttach {
    VolumeToAttach {
        volume_name: name.clone(),
        volume_spec: spec.clone(),
        node_name: NODE.into(),
        scheduled_pods: vec![],
    }
}

pub fn to_mount(
    name: &UniqueVolumeName,
    spec: &VolumeSpec,
    pod: &PodRef,
    attachable: bool,
) -> VolumeToMount {
    VolumeToMount {
        volume_name: name.clone(),
        pod_name: pod.unique_name(),
        pod: pod.clone(),
        volume_spec: spec.clone(),
        outer_volume_spec_name: "data".into(),
        plugin_is_attachable: attachable,
        device_path: if attachable {
            FAKE_DEVICE_PATH.into()
        } else {
            String::new()
        },
        volume_gid_value: None,
        reported_in_use: true,
        node_name: NODE.into(),
        remount: false,
    }
}

//! In-memory fakes for the collaborators of the operation generator.
//!
//! Every fake keeps its counters and knobs in shared state so a test can hand
//! the fake to the generator (boxed or behind an `Arc`) and still inspect or
//! steer it afterwards.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::VolumeError;
use crate::node_client::NodeClient;
use crate::plugin::{
    AttachableVolumePlugin, Attacher, BlockVolumeMapper, BlockVolumePlugin, BlockVolumeUnmapper,
    Detacher, ExpandableVolumePlugin, Mounter, Unmounter, VolumeAttributes, VolumePlugin,
};
use crate::recorder::{EventRecorder, EventType};
use crate::state::{ActualStateOfWorld, ActualStateUpdater, MarkVolumeMountedOpts};
use crate::types::{
    AttachedVolumeStatus, Node, NodeName, ObjectReference, PodRef, UniquePodName,
    UniqueVolumeName, VolumeSpec,
};
use crate::util::mount::MountInterface;

/// Device path fake attachers hand out unless told otherwise.
pub const FAKE_DEVICE_PATH: &str = "/dev/sdz";

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn path_string(path: PathBuf) -> String {
    path.to_string_lossy().into_owned()
}

/// Plugin calls a test can make fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FakeFailure {
    Attach,
    WaitForAttach,
    MountDevice,
    Detach,
    UnmountDevice,
    CanMount,
    SetUp,
    TearDown,
    SetUpDevice,
    TearDownDevice,
    Expand,
    VolumesAreAttached,
}

/// Calls recorded by [`FakeVolumePlugin`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FakeCall {
    Attach,
    WaitForAttach,
    MountDevice,
    Detach,
    UnmountDevice,
    CanMount,
    SetUp,
    TearDown,
    SetUpDevice,
    TearDownDevice,
    Expand,
    VolumesAreAttached,
}

/// Counters and knobs shared by a [`FakeVolumePlugin`] and everything it
/// builds.
#[derive(Debug)]
pub struct FakePluginState {
    calls: Mutex<HashMap<FakeCall, usize>>,
    failures: Mutex<HashSet<FakeFailure>>,
    device_path: Mutex<String>,
    attach_delay: Mutex<Duration>,
    wait_for_attach_delay: Mutex<Duration>,
    not_attached: Mutex<HashSet<String>>,
    detached: Mutex<Vec<(String, NodeName)>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl Default for FakePluginState {
    fn default() -> Self {
        Self {
            calls: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashSet::new()),
            device_path: Mutex::new(FAKE_DEVICE_PATH.to_owned()),
            attach_delay: Mutex::new(Duration::ZERO),
            wait_for_attach_delay: Mutex::new(Duration::ZERO),
            not_attached: Mutex::new(HashSet::new()),
            detached: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        }
    }
}

impl FakePluginState {
    /// How many times `call` happened.
    pub fn calls(&self, call: FakeCall) -> usize {
        lock(&self.calls).get(&call).copied().unwrap_or(0)
    }

    /// Make `call` fail until [`Self::clear_failure`].
    pub fn fail(&self, failure: FakeFailure) {
        lock(&self.failures).insert(failure);
    }

    /// Stop failing `call`.
    pub fn clear_failure(&self, failure: FakeFailure) {
        lock(&self.failures).remove(&failure);
    }

    /// Device path returned by attach, wait-for-attach and set-up-device.
    pub fn set_device_path(&self, path: &str) {
        *lock(&self.device_path) = path.to_owned();
    }

    /// Make attach sleep before returning.
    pub fn set_attach_delay(&self, delay: Duration) {
        *lock(&self.attach_delay) = delay;
    }

    /// Make wait-for-attach sleep before returning.
    pub fn set_wait_for_attach_delay(&self, delay: Duration) {
        *lock(&self.wait_for_attach_delay) = delay;
    }

    /// Report the volume backed by `volume_handle` as attached or not in
    /// `volumes_are_attached`.
    pub fn set_attached(&self, volume_handle: &str, attached: bool) {
        let mut set = lock(&self.not_attached);
        if attached {
            set.remove(volume_handle);
        } else {
            set.insert(volume_handle.to_owned());
        }
    }

    /// `(plugin volume name, node)` pairs passed to detach.
    pub fn detached(&self) -> Vec<(String, NodeName)> {
        lock(&self.detached).clone()
    }

    /// Highest number of attach/detach calls observed in flight at once.
    pub fn max_concurrent_attach_detach(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    fn record(&self, call: FakeCall) {
        *lock(&self.calls).entry(call).or_insert(0) += 1;
    }

    fn check(&self, failure: FakeFailure) -> Result<(), VolumeError> {
        if lock(&self.failures).contains(&failure) {
            Err(VolumeError::Plugin(format!("fake {failure:?} failure")))
        } else {
            Ok(())
        }
    }

    fn device_path(&self) -> String {
        lock(&self.device_path).clone()
    }

    fn enter(&self) {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone)]
struct Layout {
    plugin_name: String,
    base_dir: PathBuf,
}

impl Layout {
    fn device_mount_path(&self, spec: &VolumeSpec) -> String {
        path_string(
            self.base_dir
                .join("plugins")
                .join(&self.plugin_name)
                .join("mounts")
                .join(&spec.source.volume_handle),
        )
    }

    fn global_map_path(&self, spec: &VolumeSpec) -> String {
        path_string(
            self.base_dir
                .join("plugins")
                .join(&self.plugin_name)
                .join("volumeDevices")
                .join(&spec.source.volume_handle),
        )
    }

    fn pod_volume_path(&self, pod_uid: &str, inner_spec_name: &str) -> String {
        path_string(
            self.base_dir
                .join("pods")
                .join(pod_uid)
                .join("volumes")
                .join(&self.plugin_name)
                .join(inner_spec_name),
        )
    }

    fn pod_device_map_dir(&self, pod_uid: &str) -> String {
        path_string(
            self.base_dir
                .join("pods")
                .join(pod_uid)
                .join("volumeDevices")
                .join(&self.plugin_name),
        )
    }
}

/// Configurable [`VolumePlugin`] double.
///
/// By default the plugin supports specs whose `source.driver` equals its
/// name and uses the spec's volume handle as its plugin-scoped volume name.
pub struct FakeVolumePlugin {
    driver: String,
    attachable: bool,
    block: bool,
    expandable: bool,
    requires_fs_resize: bool,
    supports_mount_option: bool,
    layout: Layout,
    state: Arc<FakePluginState>,
}

impl FakeVolumePlugin {
    fn new(name: &str, attachable: bool) -> Self {
        Self {
            driver: name.to_owned(),
            attachable,
            block: false,
            expandable: false,
            requires_fs_resize: false,
            supports_mount_option: true,
            layout: Layout {
                plugin_name: name.to_owned(),
                base_dir: PathBuf::from("/var/lib/rkl"),
            },
            state: Arc::new(FakePluginState::default()),
        }
    }

    /// A plugin with attach support.
    pub fn attachable(name: &str) -> Self {
        Self::new(name, true)
    }

    /// A plugin without attach support.
    pub fn non_attachable(name: &str) -> Self {
        Self::new(name, false)
    }

    /// Claim specs whose driver is `driver` instead of the plugin name.
    pub fn supporting_driver(mut self, driver: &str) -> Self {
        self.driver = driver.to_owned();
        self
    }

    /// Add raw block support.
    pub fn with_block(mut self) -> Self {
        self.block = true;
        self
    }

    /// Add expansion support.
    pub fn with_expansion(mut self, requires_fs_resize: bool) -> Self {
        self.expandable = true;
        self.requires_fs_resize = requires_fs_resize;
        self
    }

    /// Refuse mount options.
    pub fn without_mount_options(mut self) -> Self {
        self.supports_mount_option = false;
        self
    }

    /// Root the plugin's global and pod paths under `dir`.
    pub fn with_base_dir(mut self, dir: &Path) -> Self {
        self.layout.base_dir = dir.to_path_buf();
        self
    }

    /// Shared counters and knobs.
    pub fn state(&self) -> Arc<FakePluginState> {
        Arc::clone(&self.state)
    }
}

impl VolumePlugin for FakeVolumePlugin {
    fn name(&self) -> &str {
        &self.layout.plugin_name
    }

    fn can_support(&self, spec: &VolumeSpec) -> bool {
        spec.source.driver == self.driver
    }

    fn volume_name(&self, spec: &VolumeSpec) -> Result<String, VolumeError> {
        if spec.source.volume_handle.is_empty() {
            return Err(VolumeError::InvalidArgument(format!(
                "spec {} has no volume handle",
                spec.name
            )));
        }
        Ok(spec.source.volume_handle.clone())
    }

    fn supports_mount_option(&self) -> bool {
        self.supports_mount_option
    }

    fn new_mounter(
        &self,
        spec: &VolumeSpec,
        pod: &PodRef,
    ) -> Result<Box<dyn Mounter>, VolumeError> {
        Ok(Box::new(FakeMounterHandle {
            path: self.layout.pod_volume_path(&pod.uid, &spec.name),
            read_only: spec.read_only,
            state: self.state(),
        }))
    }

    fn new_unmounter(
        &self,
        inner_spec_name: &str,
        pod_uid: &str,
    ) -> Result<Box<dyn Unmounter>, VolumeError> {
        Ok(Box::new(FakeUnmounterHandle {
            path: self.layout.pod_volume_path(pod_uid, inner_spec_name),
            state: self.state(),
        }))
    }

    fn as_attachable(&self) -> Option<&dyn AttachableVolumePlugin> {
        self.attachable.then_some(self as &dyn AttachableVolumePlugin)
    }

    fn as_block(&self) -> Option<&dyn BlockVolumePlugin> {
        self.block.then_some(self as &dyn BlockVolumePlugin)
    }

    fn as_expandable(&self) -> Option<&dyn ExpandableVolumePlugin> {
        self.expandable.then_some(self as &dyn ExpandableVolumePlugin)
    }
}

impl AttachableVolumePlugin for FakeVolumePlugin {
    fn new_attacher(&self) -> Result<Box<dyn Attacher>, VolumeError> {
        Ok(Box::new(FakeAttacher {
            layout: self.layout.clone(),
            state: self.state(),
        }))
    }

    fn new_detacher(&self) -> Result<Box<dyn Detacher>, VolumeError> {
        Ok(Box::new(FakeDetacher {
            state: self.state(),
        }))
    }
}

impl BlockVolumePlugin for FakeVolumePlugin {
    fn new_block_volume_mapper(
        &self,
        spec: &VolumeSpec,
        pod: &PodRef,
    ) -> Result<Box<dyn BlockVolumeMapper>, VolumeError> {
        Ok(Box::new(FakeBlockMapper {
            layout: self.layout.clone(),
            pod_uid: pod.uid.clone(),
            inner_spec_name: spec.name.clone(),
            state: self.state(),
        }))
    }

    fn new_block_volume_unmapper(
        &self,
        inner_spec_name: &str,
        pod_uid: &str,
    ) -> Result<Box<dyn BlockVolumeUnmapper>, VolumeError> {
        Ok(Box::new(FakeBlockMapper {
            layout: self.layout.clone(),
            pod_uid: pod_uid.to_owned(),
            inner_spec_name: inner_spec_name.to_owned(),
            state: self.state(),
        }))
    }
}

#[async_trait]
impl ExpandableVolumePlugin for FakeVolumePlugin {
    async fn expand_volume_device(
        &self,
        _spec: &VolumeSpec,
        new_size: u64,
        _old_size: u64,
    ) -> Result<u64, VolumeError> {
        self.state.record(FakeCall::Expand);
        self.state.check(FakeFailure::Expand)?;
        Ok(new_size)
    }

    fn requires_fs_resize(&self) -> bool {
        self.requires_fs_resize
    }
}

struct FakeAttacher {
    layout: Layout,
    state: Arc<FakePluginState>,
}

#[async_trait]
impl Attacher for FakeAttacher {
    async fn attach(&self, _spec: &VolumeSpec, _node: &NodeName) -> Result<String, VolumeError> {
        self.state.record(FakeCall::Attach);
        self.state.enter();
        let delay = *lock(&self.state.attach_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.state.exit();
        self.state.check(FakeFailure::Attach)?;
        Ok(self.state.device_path())
    }

    async fn wait_for_attach(
        &self,
        _spec: &VolumeSpec,
        device_path: &str,
        _pod: &PodRef,
        _timeout: Duration,
    ) -> Result<String, VolumeError> {
        self.state.record(FakeCall::WaitForAttach);
        let delay = *lock(&self.state.wait_for_attach_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.state.check(FakeFailure::WaitForAttach)?;
        if device_path.is_empty() {
            Ok(self.state.device_path())
        } else {
            Ok(device_path.to_owned())
        }
    }

    fn get_device_mount_path(&self, spec: &VolumeSpec) -> Result<String, VolumeError> {
        Ok(self.layout.device_mount_path(spec))
    }

    async fn mount_device(
        &self,
        _spec: &VolumeSpec,
        _device_path: &str,
        _device_mount_path: &str,
    ) -> Result<(), VolumeError> {
        self.state.record(FakeCall::MountDevice);
        self.state.check(FakeFailure::MountDevice)
    }

    async fn volumes_are_attached(
        &self,
        specs: &[VolumeSpec],
        _node: &NodeName,
    ) -> Result<Vec<bool>, VolumeError> {
        self.state.record(FakeCall::VolumesAreAttached);
        self.state.check(FakeFailure::VolumesAreAttached)?;
        let not_attached = lock(&self.state.not_attached);
        Ok(specs
            .iter()
            .map(|spec| !not_attached.contains(&spec.source.volume_handle))
            .collect())
    }
}

struct FakeDetacher {
    state: Arc<FakePluginState>,
}

#[async_trait]
impl Detacher for FakeDetacher {
    async fn detach(&self, volume_name: &str, node: &NodeName) -> Result<(), VolumeError> {
        self.state.record(FakeCall::Detach);
        self.state.enter();
        self.state.exit();
        self.state.check(FakeFailure::Detach)?;
        lock(&self.state.detached).push((volume_name.to_owned(), node.clone()));
        Ok(())
    }

    async fn unmount_device(&self, _device_mount_path: &str) -> Result<(), VolumeError> {
        self.state.record(FakeCall::UnmountDevice);
        self.state.check(FakeFailure::UnmountDevice)
    }
}

struct FakeMounterHandle {
    path: String,
    read_only: bool,
    state: Arc<FakePluginState>,
}

#[async_trait]
impl Mounter for FakeMounterHandle {
    fn get_path(&self) -> String {
        self.path.clone()
    }

    async fn can_mount(&self) -> Result<(), VolumeError> {
        self.state.record(FakeCall::CanMount);
        self.state.check(FakeFailure::CanMount)
    }

    async fn set_up(&self, _fs_group: Option<i64>) -> Result<(), VolumeError> {
        self.state.record(FakeCall::SetUp);
        self.state.check(FakeFailure::SetUp)
    }

    fn get_attributes(&self) -> VolumeAttributes {
        VolumeAttributes {
            read_only: self.read_only,
            managed: true,
            supports_selinux: false,
        }
    }
}

struct FakeUnmounterHandle {
    path: String,
    state: Arc<FakePluginState>,
}

#[async_trait]
impl Unmounter for FakeUnmounterHandle {
    fn get_path(&self) -> String {
        self.path.clone()
    }

    async fn tear_down(&self) -> Result<(), VolumeError> {
        self.state.record(FakeCall::TearDown);
        self.state.check(FakeFailure::TearDown)
    }
}

struct FakeBlockMapper {
    layout: Layout,
    pod_uid: String,
    inner_spec_name: String,
    state: Arc<FakePluginState>,
}

#[async_trait]
impl BlockVolumeMapper for FakeBlockMapper {
    async fn set_up_device(&self) -> Result<String, VolumeError> {
        self.state.record(FakeCall::SetUpDevice);
        self.state.check(FakeFailure::SetUpDevice)?;
        Ok(self.state.device_path())
    }

    fn global_map_path(&self, spec: &VolumeSpec) -> Result<String, VolumeError> {
        Ok(self.layout.global_map_path(spec))
    }

    fn pod_device_map_path(&self) -> (String, String) {
        (
            self.layout.pod_device_map_dir(&self.pod_uid),
            self.inner_spec_name.clone(),
        )
    }
}

#[async_trait]
impl BlockVolumeUnmapper for FakeBlockMapper {
    async fn tear_down_device(
        &self,
        _map_path: &str,
        _device_path: &str,
    ) -> Result<(), VolumeError> {
        self.state.record(FakeCall::TearDownDevice);
        self.state.check(FakeFailure::TearDownDevice)
    }

    fn global_map_path(&self, spec: &VolumeSpec) -> Result<String, VolumeError> {
        Ok(self.layout.global_map_path(spec))
    }

    fn pod_device_map_path(&self) -> (String, String) {
        (
            self.layout.pod_device_map_dir(&self.pod_uid),
            self.inner_spec_name.clone(),
        )
    }
}

/// [`MountInterface`] double that never touches the host.
#[derive(Debug, Default)]
pub struct FakeMounter {
    mount_refs: Mutex<HashMap<String, Vec<String>>>,
    opened: Mutex<HashSet<String>>,
    mounts: Mutex<HashSet<String>>,
    resize_calls: AtomicUsize,
    fail_resize: AtomicBool,
}

impl FakeMounter {
    /// Create a mounter with no mounts.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `get_mount_refs(path)` return `refs`.
    pub fn set_mount_refs(&self, path: &str, refs: Vec<String>) {
        lock(&self.mount_refs).insert(path.to_owned(), refs);
    }

    /// Make `device_opened(path)` return `opened`.
    pub fn set_device_opened(&self, path: &str, opened: bool) {
        let mut set = lock(&self.opened);
        if opened {
            set.insert(path.to_owned());
        } else {
            set.remove(path);
        }
    }

    /// Make `resize_fs` fail.
    pub fn fail_resize(&self, fail: bool) {
        self.fail_resize.store(fail, Ordering::SeqCst);
    }

    /// How many times `resize_fs` was called.
    pub fn resize_calls(&self) -> usize {
        self.resize_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MountInterface for FakeMounter {
    async fn mount(
        &self,
        _source: &str,
        target: &str,
        _fs_type: &str,
        _options: &[String],
    ) -> Result<(), VolumeError> {
        lock(&self.mounts).insert(target.to_owned());
        Ok(())
    }

    async fn unmount(&self, target: &str) -> Result<(), VolumeError> {
        lock(&self.mounts).remove(target);
        Ok(())
    }

    async fn is_likely_not_mount_point(&self, path: &str) -> Result<bool, VolumeError> {
        Ok(!lock(&self.mounts).contains(path))
    }

    async fn path_is_device(&self, path: &str) -> Result<bool, VolumeError> {
        Ok(path.starts_with("/dev/"))
    }

    async fn device_opened(&self, path: &str) -> Result<bool, VolumeError> {
        Ok(lock(&self.opened).contains(path))
    }

    async fn get_mount_refs(&self, path: &str) -> Result<Vec<String>, VolumeError> {
        Ok(lock(&self.mount_refs).get(path).cloned().unwrap_or_default())
    }

    async fn format_and_mount(
        &self,
        source: &str,
        target: &str,
        fs_type: &str,
        options: &[String],
    ) -> Result<(), VolumeError> {
        self.mount(source, target, fs_type, options).await
    }

    async fn resize_fs(
        &self,
        device_path: &str,
        _device_mount_path: &str,
    ) -> Result<bool, VolumeError> {
        self.resize_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_resize.load(Ordering::SeqCst) {
            return Err(VolumeError::Plugin(format!("fake resize of {device_path} failed")));
        }
        Ok(true)
    }
}

/// [`NodeClient`] serving nodes from memory.
#[derive(Debug, Default)]
pub struct FakeNodeClient {
    nodes: Mutex<HashMap<NodeName, Node>>,
    unavailable: AtomicBool,
    get_calls: AtomicUsize,
}

impl FakeNodeClient {
    /// Create a client that knows no nodes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace `node`.
    pub fn add_node(&self, node: Node) {
        lock(&self.nodes).insert(node.name.clone(), node);
    }

    /// Add a node called `name` with `labels`.
    pub fn add_node_with_labels(&self, name: &str, labels: &[(&str, &str)]) {
        self.add_node(Node {
            name: name.into(),
            labels: labels
                .iter()
                .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
                .collect(),
            ..Default::default()
        });
    }

    /// Delete the node called `name`.
    pub fn remove_node(&self, name: &NodeName) {
        lock(&self.nodes).remove(name);
    }

    /// Replace `status.volumes_in_use` of an existing node.
    pub fn set_volumes_in_use(&self, name: &NodeName, volumes: Vec<UniqueVolumeName>) {
        if let Some(node) = lock(&self.nodes).get_mut(name) {
            node.status.volumes_in_use = volumes;
        }
    }

    /// Replace `status.volumes_attached` of an existing node.
    pub fn set_volumes_attached(&self, name: &NodeName, volumes: Vec<AttachedVolumeStatus>) {
        if let Some(node) = lock(&self.nodes).get_mut(name) {
            node.status.volumes_attached = volumes;
        }
    }

    /// Make every lookup fail.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of lookups served.
    pub fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NodeClient for FakeNodeClient {
    async fn get_node(&self, name: &NodeName) -> Result<Option<Node>, VolumeError> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(VolumeError::NodeUnavailable {
                node: name.clone(),
                reason: "fake api server unavailable".into(),
            });
        }
        Ok(lock(&self.nodes).get(name).cloned())
    }
}

/// An event captured by [`FakeRecorder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    pub object: ObjectReference,
    pub event_type: EventType,
    pub reason: String,
    pub message: String,
}

/// [`EventRecorder`] that keeps every event.
#[derive(Debug, Default)]
pub struct FakeRecorder {
    events: Mutex<Vec<RecordedEvent>>,
}

impl FakeRecorder {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// All events so far.
    pub fn events(&self) -> Vec<RecordedEvent> {
        lock(&self.events).clone()
    }

    /// Reasons of all events so far, in order.
    pub fn reasons(&self) -> Vec<String> {
        lock(&self.events).iter().map(|e| e.reason.clone()).collect()
    }
}

impl EventRecorder for FakeRecorder {
    fn event(&self, object: &ObjectReference, event_type: EventType, reason: &str, message: &str) {
        lock(&self.events).push(RecordedEvent {
            object: object.clone(),
            event_type,
            reason: reason.to_owned(),
            message: message.to_owned(),
        });
    }
}

/// [`ActualStateUpdater`] that counts calls per method and forwards them to
/// a real [`ActualStateOfWorld`]. Selected methods can be made to fail.
pub struct CountingStateUpdater {
    inner: Arc<ActualStateOfWorld>,
    calls: Mutex<HashMap<&'static str, usize>>,
    failing: Mutex<HashSet<&'static str>>,
}

impl CountingStateUpdater {
    /// Wrap `inner`.
    pub fn new(inner: Arc<ActualStateOfWorld>) -> Self {
        Self {
            inner,
            calls: Mutex::new(HashMap::new()),
            failing: Mutex::new(HashSet::new()),
        }
    }

    /// The wrapped table.
    pub fn inner(&self) -> &Arc<ActualStateOfWorld> {
        &self.inner
    }

    /// How many times `method` (e.g. `"mark_volume_as_detached"`) was called.
    pub fn calls(&self, method: &str) -> usize {
        lock(&self.calls).get(method).copied().unwrap_or(0)
    }

    /// Make `method` return a state error without touching the table.
    pub fn fail(&self, method: &'static str) {
        lock(&self.failing).insert(method);
    }

    fn enter(&self, method: &'static str) -> Result<(), VolumeError> {
        *lock(&self.calls).entry(method).or_insert(0) += 1;
        if lock(&self.failing).contains(method) {
            return Err(VolumeError::Plugin(format!("injected {method} failure")));
        }
        Ok(())
    }
}

impl ActualStateUpdater for CountingStateUpdater {
    fn mark_volume_as_attached(
        &self,
        volume_name: &UniqueVolumeName,
        spec: &VolumeSpec,
        node: &NodeName,
        device_path: &str,
    ) -> Result<(), VolumeError> {
        self.enter("mark_volume_as_attached")?;
        self.inner
            .mark_volume_as_attached(volume_name, spec, node, device_path)
    }

    fn mark_volume_as_detached(
        &self,
        volume_name: &UniqueVolumeName,
        node: &NodeName,
    ) -> Result<(), VolumeError> {
        self.enter("mark_volume_as_detached")?;
        self.inner.mark_volume_as_detached(volume_name, node)
    }

    fn mark_device_as_mounted(&self, volume_name: &UniqueVolumeName) -> Result<(), VolumeError> {
        self.enter("mark_device_as_mounted")?;
        self.inner.mark_device_as_mounted(volume_name)
    }

    fn mark_device_as_unmounted(
        &self,
        volume_name: &UniqueVolumeName,
    ) -> Result<(), VolumeError> {
        self.enter("mark_device_as_unmounted")?;
        self.inner.mark_device_as_unmounted(volume_name)
    }

    fn mark_volume_as_mounted(&self, opts: MarkVolumeMountedOpts) -> Result<(), VolumeError> {
        self.enter("mark_volume_as_mounted")?;
        self.inner.mark_volume_as_mounted(opts)
    }

    fn mark_volume_as_unmounted(
        &self,
        pod_name: &UniquePodName,
        volume_name: &UniqueVolumeName,
    ) -> Result<(), VolumeError> {
        self.enter("mark_volume_as_unmounted")?;
        self.inner.mark_volume_as_unmounted(pod_name, volume_name)
    }

    fn add_volume_to_report_as_attached(&self, volume_name: &UniqueVolumeName, node: &NodeName) {
        if self.enter("add_volume_to_report_as_attached").is_ok() {
            self.inner.add_volume_to_report_as_attached(volume_name, node);
        }
    }

    fn remove_volume_from_report_as_attached(
        &self,
        volume_name: &UniqueVolumeName,
        node: &NodeName,
    ) -> Result<(), VolumeError> {
        self.enter("remove_volume_from_report_as_attached")?;
        self.inner
            .remove_volume_from_report_as_attached(volume_name, node)
    }

    fn mark_volume_as_resized(
        &self,
        volume_name: &UniqueVolumeName,
        new_size: u64,
        fs_resize_required: bool,
    ) -> Result<(), VolumeError> {
        self.enter("mark_volume_as_resized")?;
        self.inner
            .mark_volume_as_resized(volume_name, new_size, fs_resize_required)
    }

    fn fs_resize_required(&self, volume_name: &UniqueVolumeName) -> bool {
        self.inner.fs_resize_required(volume_name)
    }

    fn mark_fs_resized(&self, volume_name: &UniqueVolumeName) -> Result<(), VolumeError> {
        self.enter("mark_fs_resized")?;
        self.inner.mark_fs_resized(volume_name)
    }
}

//! Per-key operation exclusivity with exponential backoff on failure.
//!
//! An operation is identified by an [`OperationKey`]. Pod and node are
//! optional: an absent component matches any value, so an operation keyed on
//! a volume alone excludes every pod- or node-scoped operation on that
//! volume.
//!
//! A key that failed stays in the table, not pending, until its backoff
//! expires and the next attempt succeeds.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tracing::{debug, error};

use crate::error::VolumeError;
use crate::operation::Operation;
use crate::types::{NodeName, UniquePodName, UniqueVolumeName};

/// Identity of a pending operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OperationKey {
    /// Volume the operation acts on.
    pub volume_name: UniqueVolumeName,
    /// Pod scope; `None` matches every pod.
    pub pod_name: Option<UniquePodName>,
    /// Node scope; `None` matches every node.
    pub node_name: Option<NodeName>,
}

impl OperationKey {
    pub fn new(
        volume_name: UniqueVolumeName,
        pod_name: Option<UniquePodName>,
        node_name: Option<NodeName>,
    ) -> Self {
        Self {
            volume_name,
            pod_name,
            node_name,
        }
    }

    /// Two keys conflict when they name the same volume and neither the pod
    /// nor the node tells them apart.
    pub fn conflicts_with(&self, other: &OperationKey) -> bool {
        fn overlaps<T: PartialEq>(a: &Option<T>, b: &Option<T>) -> bool {
            match (a, b) {
                (Some(a), Some(b)) => a == b,
                _ => true,
            }
        }
        self.volume_name == other.volume_name
            && overlaps(&self.pod_name, &other.pod_name)
            && overlaps(&self.node_name, &other.node_name)
    }
}

impl fmt::Display for OperationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{volumeName={:?}", self.volume_name.as_str())?;
        if let Some(pod) = &self.pod_name {
            write!(f, ", podName={:?}", pod.as_str())?;
        }
        if let Some(node) = &self.node_name {
            write!(f, ", nodeName={:?}", node.as_str())?;
        }
        f.write_str("}")
    }
}

/// Retry delays after a failed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffConfig {
    /// Delay after the first failure.
    pub initial: Duration,
    /// Upper bound of the doubling delay.
    pub max: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(2 * 60 + 2),
        }
    }
}

#[derive(Debug, Default)]
struct ExponentialBackoff {
    last_error_time: Option<Instant>,
    last_error: Option<String>,
    duration_before_retry: Duration,
}

impl ExponentialBackoff {
    fn safe_to_retry(&self, key: &OperationKey) -> Result<(), VolumeError> {
        let Some(last) = self.last_error_time else {
            return Ok(());
        };
        let elapsed = last.elapsed();
        if elapsed < self.duration_before_retry {
            return Err(VolumeError::BackoffNotExpired {
                key: key.to_string(),
                remaining: self.duration_before_retry - elapsed,
            });
        }
        Ok(())
    }

    fn update(&mut self, config: &BackoffConfig, err: &VolumeError) {
        self.duration_before_retry = if self.duration_before_retry.is_zero() {
            config.initial
        } else {
            (self.duration_before_retry * 2).min(config.max)
        };
        self.last_error_time = Some(Instant::now());
        self.last_error = Some(err.to_string());
    }
}

#[derive(Debug)]
struct PendingOperation {
    key: OperationKey,
    operation_name: &'static str,
    pending: bool,
    backoff: ExponentialBackoff,
}

/// Table of in-flight and recently failed operations.
pub struct NestedPendingOperations {
    operations: Mutex<Vec<PendingOperation>>,
    idle: Notify,
    config: BackoffConfig,
}

impl NestedPendingOperations {
    pub fn new(config: BackoffConfig) -> Arc<Self> {
        Arc::new(Self {
            operations: Mutex::new(Vec::new()),
            idle: Notify::new(),
            config,
        })
    }

    fn lock(&self) -> MutexGuard<'_, Vec<PendingOperation>> {
        self.operations.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start `operation` under `key` on a new tokio task.
    ///
    /// Returns [`VolumeError::OperationAlreadyExists`] when a conflicting
    /// operation is in flight and [`VolumeError::BackoffNotExpired`] when the
    /// conflicting entry failed recently. Neither starts anything.
    pub fn run(
        self: &Arc<Self>,
        key: OperationKey,
        operation: Box<dyn Operation>,
    ) -> Result<(), VolumeError> {
        let name = operation.name();
        {
            let mut ops = self.lock();
            let mut conflicting = ops.iter().filter(|op| op.key.conflicts_with(&key));
            if conflicting.clone().any(|op| op.pending) {
                return Err(VolumeError::OperationAlreadyExists {
                    key: key.to_string(),
                });
            }
            conflicting.try_for_each(|op| op.backoff.safe_to_retry(&key))?;

            // Reuse the entry carrying this key's backoff history.
            let reuse = ops
                .iter()
                .position(|op| op.key == key)
                .or_else(|| ops.iter().position(|op| op.key.conflicts_with(&key)));
            match reuse {
                Some(idx) => {
                    let existing = &mut ops[idx];
                    existing.key = key.clone();
                    existing.operation_name = name;
                    existing.pending = true;
                }
                None => ops.push(PendingOperation {
                    key: key.clone(),
                    operation_name: name,
                    pending: true,
                    backoff: ExponentialBackoff::default(),
                }),
            }
        }

        debug!(operation = name, key = %key, "starting operation");
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let handle = tokio::spawn(async move { operation.execute().await });
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => Err(VolumeError::Plugin(format!(
                    "operation {name} did not complete: {e}"
                ))),
            };
            this.operation_complete(&key, result);
        });
        Ok(())
    }

    fn operation_complete(&self, key: &OperationKey, result: Result<(), VolumeError>) {
        let mut ops = self.lock();
        let Some(idx) = ops.iter().position(|op| &op.key == key) else {
            error!(key = %key, "completed operation not found in pending table");
            return;
        };
        match result {
            Ok(()) => {
                ops.swap_remove(idx);
            }
            Err(err) => {
                let op = &mut ops[idx];
                op.pending = false;
                op.backoff.update(&self.config, &err);
                error!(
                    operation = op.operation_name,
                    key = %key,
                    retry_after = ?op.backoff.duration_before_retry,
                    "operation failed: {err}"
                );
            }
        }
        if !ops.iter().any(|op| op.pending) {
            self.idle.notify_waiters();
        }
    }

    /// Whether an operation conflicting with the given scope is in flight.
    pub fn is_operation_pending(
        &self,
        volume_name: &UniqueVolumeName,
        pod_name: Option<&UniquePodName>,
        node_name: Option<&NodeName>,
    ) -> bool {
        let key = OperationKey::new(
            volume_name.clone(),
            pod_name.cloned(),
            node_name.cloned(),
        );
        self.lock()
            .iter()
            .any(|op| op.pending && op.key.conflicts_with(&key))
    }

    /// Resolve once no operation is in flight.
    pub async fn wait(&self) {
        loop {
            // Registered before the check so a completion in between is seen.
            let notified = self.idle.notified();
            if !self.lock().iter().any(|op| op.pending) {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct TestOperation {
        delay: Duration,
        fail: bool,
        runs: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Operation for TestOperation {
        fn name(&self) -> &'static str {
            "test"
        }

        async fn execute(&self) -> Result<(), VolumeError> {
            tokio::time::sleep(self.delay).await;
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(VolumeError::Plugin("boom".into()))
            } else {
                Ok(())
            }
        }
    }

    fn op(delay_ms: u64, fail: bool, runs: &Arc<AtomicUsize>) -> Box<dyn Operation> {
        Box::new(TestOperation {
            delay: Duration::from_millis(delay_ms),
            fail,
            runs: Arc::clone(runs),
        })
    }

    fn key(volume: &str, pod: Option<&str>, node: Option<&str>) -> OperationKey {
        OperationKey::new(volume.into(), pod.map(Into::into), node.map(Into::into))
    }

    #[test]
    fn key_conflicts() {
        let volume_only = key("fake/vol-a", None, None);
        let pod_a = key("fake/vol-a", Some("pod-a"), None);
        let pod_b = key("fake/vol-a", Some("pod-b"), None);
        let node_1 = key("fake/vol-a", None, Some("node-1"));

        assert!(volume_only.conflicts_with(&pod_a));
        assert!(pod_a.conflicts_with(&volume_only));
        assert!(!pod_a.conflicts_with(&pod_b));
        assert!(pod_a.conflicts_with(&node_1));
        assert!(!node_1.conflicts_with(&key("fake/vol-a", None, Some("node-2"))));
        assert!(!volume_only.conflicts_with(&key("fake/vol-b", None, None)));
    }

    #[test]
    fn key_display() {
        assert_eq!(
            key("fake/vol-a", Some("uid-1"), None).to_string(),
            r#"{volumeName="fake/vol-a", podName="uid-1"}"#
        );
    }

    #[test]
    fn backoff_doubles_up_to_max() {
        let config = BackoffConfig {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(2),
        };
        let err = VolumeError::Plugin("boom".into());
        let mut backoff = ExponentialBackoff::default();
        let mut seen = Vec::new();
        for _ in 0..5 {
            backoff.update(&config, &err);
            seen.push(backoff.duration_before_retry);
        }
        assert_eq!(
            seen,
            vec![
                Duration::from_millis(500),
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(2),
                Duration::from_secs(2),
            ]
        );
        assert_eq!(backoff.last_error.as_deref(), Some("plugin error: boom"));
    }

    #[tokio::test]
    async fn conflicting_run_rejected_while_pending() {
        let pending = NestedPendingOperations::new(BackoffConfig::default());
        let runs = Arc::new(AtomicUsize::new(0));

        pending
            .run(key("fake/vol-a", None, None), op(100, false, &runs))
            .unwrap();
        let err = pending
            .run(key("fake/vol-a", Some("pod-a"), None), op(0, false, &runs))
            .unwrap_err();
        assert!(matches!(err, VolumeError::OperationAlreadyExists { .. }));
        assert!(pending.is_operation_pending(&"fake/vol-a".into(), None, None));

        pending
            .run(key("fake/vol-b", None, None), op(0, false, &runs))
            .unwrap();

        pending.wait().await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert!(!pending.is_operation_pending(&"fake/vol-a".into(), None, None));
    }

    #[tokio::test]
    async fn distinct_pods_run_concurrently() {
        let pending = NestedPendingOperations::new(BackoffConfig::default());
        let runs = Arc::new(AtomicUsize::new(0));
        pending
            .run(key("local/vol", Some("pod-a"), None), op(50, false, &runs))
            .unwrap();
        pending
            .run(key("local/vol", Some("pod-b"), None), op(50, false, &runs))
            .unwrap();
        pending.wait().await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_key_backs_off_then_retries() {
        let pending = NestedPendingOperations::new(BackoffConfig {
            initial: Duration::from_millis(200),
            max: Duration::from_secs(1),
        });
        let runs = Arc::new(AtomicUsize::new(0));
        let k = key("fake/vol-a", None, Some("node-1"));

        pending.run(k.clone(), op(0, true, &runs)).unwrap();
        pending.wait().await;

        let err = pending.run(k.clone(), op(0, false, &runs)).unwrap_err();
        assert!(matches!(err, VolumeError::BackoffNotExpired { .. }));
        assert!(!pending.is_operation_pending(&"fake/vol-a".into(), None, None));

        tokio::time::sleep(Duration::from_millis(250)).await;
        pending.run(k.clone(), op(0, false, &runs)).unwrap();
        pending.wait().await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        // Success forgets the key; the next run starts without backoff.
        pending.run(k, op(0, false, &runs)).unwrap();
        pending.wait().await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn panicking_operation_releases_key() {
        struct Panics;

        #[async_trait]
        impl Operation for Panics {
            fn name(&self) -> &'static str {
                "panics"
            }

            async fn execute(&self) -> Result<(), VolumeError> {
                panic!("plugin bug");
            }
        }

        let pending = NestedPendingOperations::new(BackoffConfig {
            initial: Duration::from_millis(10),
            max: Duration::from_millis(10),
        });
        pending
            .run(key("fake/vol-a", None, None), Box::new(Panics))
            .unwrap();
        pending.wait().await;
        assert!(!pending.is_operation_pending(&"fake/vol-a".into(), None, None));
    }

    #[tokio::test]
    async fn wait_returns_immediately_when_idle() {
        let pending = NestedPendingOperations::new(BackoffConfig::default());
        tokio::time::timeout(Duration::from_millis(100), pending.wait())
            .await
            .unwrap();
    }
}

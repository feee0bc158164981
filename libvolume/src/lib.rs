//! # libvolume — volume operation executor for RK8s nodes
//!
//! `libvolume` orchestrates the lifecycle of storage volumes on a node:
//! attach, mount, unmount, unmount-device and detach, raw block map/unmap,
//! attachment verification and expansion. It tracks what is physically
//! attached and mounted in an actual state table, and guarantees that at
//! most one operation runs per volume (and pod, or node) at a time, with
//! exponential backoff after failures.
//!
//! Volume drivers, the node API and the event backend are consumed through
//! traits so the orchestration logic can run against fakes.
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`types`] | Names, `VolumeSpec`, operation descriptors, node model. |
//! | [`error`] | [`VolumeError`] enum covering all failure modes. |
//! | [`config`] | [`ExecutorConfig`], YAML file plus `RKVOL_*` overrides. |
//! | [`logging`] | `tracing-subscriber` initialisation. |
//! | [`plugin`] | Plugin capability traits and the [`VolumePluginMgr`] registry. |
//! | [`util`] | Host mount and block symlink utilities, node affinity. |
//! | [`state`] | Actual and desired state of world. |
//! | [`operation`] | [`OperationGenerator`] and the generated operations. |
//! | [`executor`] | [`OperationExecutor`] with per-key exclusivity and backoff. |
//! | [`reconciler`] | Loop driving actual state toward desired state. |
//! | [`recorder`] | Event recorder port. |
//! | [`node_client`] | Node API port. |
//! | [`testing`] | In-memory fakes for every port. |

pub mod config;
pub mod error;
pub mod executor;
pub mod logging;
pub mod node_client;
pub mod operation;
pub mod plugin;
pub mod reconciler;
pub mod recorder;
pub mod state;
pub mod testing;
pub mod types;
pub mod util;

pub use config::ExecutorConfig;
pub use error::VolumeError;
pub use executor::OperationExecutor;
pub use operation::{Operation, OperationGenerator};
pub use plugin::VolumePluginMgr;
pub use reconciler::Reconciler;
pub use state::{ActualStateOfWorld, ActualStateUpdater, DesiredStateOfWorld};
pub use types::*;

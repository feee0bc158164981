//! Actual and desired state of world.
//!
//! [`ActualStateOfWorld`] is mutated only through [`ActualStateUpdater`] by
//! generated operations. [`DesiredStateOfWorld`] is filled by the pod
//! watcher and read by the reconciler.

mod actual;
mod desired;

pub use actual::{ActualStateOfWorld, ActualStateUpdater, MarkVolumeMountedOpts};
pub use desired::DesiredStateOfWorld;

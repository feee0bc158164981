//! Event recorder port.
//!
//! Generated operations report user-visible outcomes through
//! [`EventRecorder`] instead of talking to an event backend directly, so the
//! decision logic can be tested by inspecting the recorded events.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::types::ObjectReference;

/// Event reasons emitted by the operation generator.
pub mod reason {
    /// Attach failed.
    pub const FAILED_ATTACH_VOLUME: &str = "FailedAttachVolume";
    /// Detach failed.
    pub const FAILED_DETACH_VOLUME: &str = "FailedDetachVolume";
    /// Any step of a mount failed.
    pub const FAILED_MOUNT_VOLUME: &str = "FailedMountVolume";
    /// Mount succeeded.
    pub const SUCCESSFUL_MOUNT_VOLUME: &str = "SuccessfulMountVolume";
    /// Pod-scoped teardown failed.
    pub const FAILED_UNMOUNT_VOLUME: &str = "FailedUnMountVolume";
    /// Any step of a block map failed.
    pub const FAILED_MAP_VOLUME: &str = "FailedMapVolume";
    /// Releasing a block device failed.
    pub const FAILED_UNMAP_DEVICE: &str = "FailedUnmapDevice";
    /// The plugin does not take the requested mount options.
    pub const UNSUPPORTED_MOUNT_OPTION: &str = "UnsupportedMountOption";
    /// Backend expansion failed.
    pub const VOLUME_RESIZE_FAILED: &str = "VolumeResizeFailed";
    /// Node-side filesystem growth failed.
    pub const FILE_SYSTEM_RESIZE_FAILED: &str = "FileSystemResizeFailed";
    /// Node-side filesystem growth succeeded.
    pub const FILE_SYSTEM_RESIZE_SUCCESSFUL: &str = "FileSystemResizeSuccessful";
}

/// Severity of an event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EventType {
    /// Informational.
    Normal,
    /// Something went wrong.
    Warning,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => f.write_str("Normal"),
            Self::Warning => f.write_str("Warning"),
        }
    }
}

/// Sink for events attached to API objects.
pub trait EventRecorder: Send + Sync {
    /// Record an event about `object`.
    fn event(&self, object: &ObjectReference, event_type: EventType, reason: &str, message: &str);
}

/// Recorder that writes events to the `tracing` log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingRecorder;

impl EventRecorder for TracingRecorder {
    fn event(&self, object: &ObjectReference, event_type: EventType, reason: &str, message: &str) {
        match event_type {
            EventType::Normal => info!(%object, %reason, "{message}"),
            EventType::Warning => warn!(%object, %reason, "{message}"),
        }
    }
}

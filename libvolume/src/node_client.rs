//! Node API port.
//!
//! The detach safety check and the controller-attach verification read the
//! node object from the API server through [`NodeClient`].

use async_trait::async_trait;

use crate::error::VolumeError;
use crate::types::{Node, NodeName};

/// Read access to node objects.
#[async_trait]
pub trait NodeClient: Send + Sync {
    /// Fetch the node called `name`. `Ok(None)` means the node does not exist
    /// (deleted); `Err` means the lookup itself failed.
    async fn get_node(&self, name: &NodeName) -> Result<Option<Node>, VolumeError>;
}

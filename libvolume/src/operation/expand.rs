//! Backend volume expansion.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, instrument};

use crate::error::VolumeError;
use crate::plugin::VolumePlugin;
use crate::recorder::{EventRecorder, reason};
use crate::state::ActualStateUpdater;
use crate::types::{OperationMessages, VolumeToExpand};

use super::{Operation, OperationGenerator, expand_capability, log_state_update, report_failure};

/// Grows a volume in its storage backend. When the plugin needs the
/// filesystem grown as well, the next mount of the volume does it.
pub struct ExpandVolumeOperation {
    volume: VolumeToExpand,
    plugin: Arc<dyn VolumePlugin>,
    recorder: Arc<dyn EventRecorder>,
    asw: Arc<dyn ActualStateUpdater>,
}

impl ExpandVolumeOperation {
    async fn expand(&self) -> Result<(u64, bool), VolumeError> {
        let expander = expand_capability(self.plugin.as_ref())?;
        let old_size = self.volume.volume_spec.capacity_bytes.unwrap_or(0);
        let new_size = expander
            .expand_volume_device(&self.volume.volume_spec, self.volume.requested_size, old_size)
            .await
            .map_err(|e| VolumeError::ExpandFailed {
                volume: self.volume.volume_name.clone(),
                reason: e.to_string(),
            })?;
        Ok((new_size, expander.requires_fs_resize()))
    }
}

#[async_trait]
impl Operation for ExpandVolumeOperation {
    fn name(&self) -> &'static str {
        "expand_volume"
    }

    #[instrument(skip_all, fields(volume = %self.volume.volume_name, claim = %self.volume.claim))]
    async fn execute(&self) -> Result<(), VolumeError> {
        let (new_size, fs_resize_required) = self.expand().await.map_err(|e| {
            report_failure(
                self.recorder.as_ref(),
                std::slice::from_ref(&self.volume.claim),
                &self.volume,
                reason::VOLUME_RESIZE_FAILED,
                "ExpandVolume failed",
                e,
            )
        })?;

        let (_, detailed) = self.volume.generate_msg("ExpandVolume succeeded", "");
        info!(new_size, fs_resize_required, "{detailed}");
        log_state_update(
            "MarkVolumeAsResized",
            self.asw
                .mark_volume_as_resized(&self.volume.volume_name, new_size, fs_resize_required),
        );
        Ok(())
    }
}

impl OperationGenerator {
    /// Grow `volume` to its requested size.
    pub fn generate_expand_volume(
        &self,
        volume: VolumeToExpand,
        asw: Arc<dyn ActualStateUpdater>,
    ) -> Result<Box<dyn Operation>, VolumeError> {
        let plugin = self
            .plugin_mgr
            .find_expandable_plugin_by_spec(&volume.volume_spec)?;
        Ok(Box::new(ExpandVolumeOperation {
            volume,
            plugin,
            recorder: Arc::clone(&self.recorder),
            asw,
        }))
    }
}

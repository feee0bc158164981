//! Registry of volume plugins keyed by name.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::error::VolumeError;
use crate::types::VolumeSpec;

use super::VolumePlugin;

/// Registry of the volume plugins known to this process.
///
/// Built once at startup and shared behind an `Arc`; lookups never mutate it.
pub struct VolumePluginMgr {
    plugins: HashMap<String, Arc<dyn VolumePlugin>>,
}

impl VolumePluginMgr {
    /// Register `plugins`. Two plugins with the same name are rejected.
    pub fn new(plugins: Vec<Arc<dyn VolumePlugin>>) -> Result<Self, VolumeError> {
        let mut registry: HashMap<String, Arc<dyn VolumePlugin>> = HashMap::new();
        for plugin in plugins {
            let name = plugin.name().to_owned();
            if name.is_empty() {
                return Err(VolumeError::InvalidArgument(
                    "volume plugin name must not be empty".into(),
                ));
            }
            if registry.contains_key(&name) {
                return Err(VolumeError::InvalidArgument(format!(
                    "volume plugin {name} registered more than once"
                )));
            }
            debug!(plugin = %name, "registered volume plugin");
            registry.insert(name, plugin);
        }
        Ok(Self { plugins: registry })
    }

    /// The single plugin that supports `spec`.
    pub fn find_plugin_by_spec(&self, spec: &VolumeSpec) -> Result<Arc<dyn VolumePlugin>, VolumeError> {
        let mut matches: Vec<&Arc<dyn VolumePlugin>> = self
            .plugins
            .values()
            .filter(|plugin| plugin.can_support(spec))
            .collect();
        match matches.len() {
            0 => Err(VolumeError::PluginNotFound {
                spec: spec.name.clone(),
            }),
            1 => Ok(Arc::clone(matches.remove(0))),
            _ => {
                let mut plugins: Vec<String> =
                    matches.iter().map(|plugin| plugin.name().to_owned()).collect();
                plugins.sort();
                Err(VolumeError::MultiplePluginsMatched {
                    spec: spec.name.clone(),
                    plugins,
                })
            }
        }
    }

    /// The plugin registered as `name`.
    pub fn find_plugin_by_name(&self, name: &str) -> Result<Arc<dyn VolumePlugin>, VolumeError> {
        self.plugins
            .get(name)
            .map(Arc::clone)
            .ok_or_else(|| VolumeError::PluginNotFound {
                spec: name.to_owned(),
            })
    }

    /// The plugin that supports `spec`, which must be attachable.
    pub fn find_attachable_plugin_by_spec(
        &self,
        spec: &VolumeSpec,
    ) -> Result<Arc<dyn VolumePlugin>, VolumeError> {
        let plugin = self.find_plugin_by_spec(spec)?;
        require(plugin, |p| p.as_attachable().is_some(), "attacher")
    }

    /// The plugin that supports `spec`, which must map raw block volumes.
    pub fn find_block_plugin_by_spec(
        &self,
        spec: &VolumeSpec,
    ) -> Result<Arc<dyn VolumePlugin>, VolumeError> {
        let plugin = self.find_plugin_by_spec(spec)?;
        require(plugin, |p| p.as_block().is_some(), "block mapper")
    }

    /// The plugin registered as `name`, which must map raw block volumes.
    pub fn find_block_plugin_by_name(
        &self,
        name: &str,
    ) -> Result<Arc<dyn VolumePlugin>, VolumeError> {
        let plugin = self.find_plugin_by_name(name)?;
        require(plugin, |p| p.as_block().is_some(), "block mapper")
    }

    /// The plugin that supports `spec`, which must be expandable.
    pub fn find_expandable_plugin_by_spec(
        &self,
        spec: &VolumeSpec,
    ) -> Result<Arc<dyn VolumePlugin>, VolumeError> {
        let plugin = self.find_plugin_by_spec(spec)?;
        require(plugin, |p| p.as_expandable().is_some(), "expansion")
    }
}

fn require(
    plugin: Arc<dyn VolumePlugin>,
    has: impl Fn(&dyn VolumePlugin) -> bool,
    capability: &'static str,
) -> Result<Arc<dyn VolumePlugin>, VolumeError> {
    if has(plugin.as_ref()) {
        Ok(plugin)
    } else {
        Err(VolumeError::CapabilityUnsupported {
            plugin: plugin.name().to_owned(),
            capability,
        })
    }
}

//! Executor configuration.
//!
//! Loaded from an optional YAML file, then overridden from the environment:
//!
//! - `RKVOL_WAIT_FOR_ATTACH_TIMEOUT_SECS`: bound on `WaitForAttach` (default 600).
//! - `RKVOL_INITIAL_BACKOFF_MILLIS`: first retry delay after a failure (default 500).
//! - `RKVOL_MAX_BACKOFF_MILLIS`: cap of the doubling retry delay (default 122000).
//! - `RKVOL_CHECK_NODE_CAPABILITIES`: `1` runs `CanMount` before `SetUp`.
//! - `RKVOL_BLOCK_VOLUME`: `1` routes block mode volumes to map/unmap.
//! - `RKVOL_RECONCILER_PERIOD_MILLIS`: reconciler tick (default 100).
//! - `RKVOL_CONTROLLER_ATTACH_DETACH`: `0` lets the node attach and detach itself.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};

use crate::executor::BackoffConfig;

/// Tunables of the executor and reconciler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecutorConfig {
    pub wait_for_attach_timeout_secs: u64,
    pub initial_backoff_millis: u64,
    pub max_backoff_millis: u64,
    pub check_node_capabilities_before_mount: bool,
    pub block_volume_enabled: bool,
    pub reconciler_loop_period_millis: u64,
    /// The attach/detach controller owns attachment; the node only verifies.
    pub controller_attach_detach_enabled: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            wait_for_attach_timeout_secs: 600,
            initial_backoff_millis: 500,
            max_backoff_millis: 122_000,
            check_node_capabilities_before_mount: false,
            block_volume_enabled: false,
            reconciler_loop_period_millis: 100,
            controller_attach_detach_enabled: true,
        }
    }
}

impl ExecutorConfig {
    /// Read `path` (when given), apply `RKVOL_*` overrides and validate.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read config {}", path.display()))?;
                serde_yaml::from_str(&raw)
                    .with_context(|| format!("failed to parse config {}", path.display()))?
            }
            None => Self::default(),
        };
        config.apply_env(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides looked up through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn number(name: &str, value: &str) -> anyhow::Result<u64> {
            value
                .trim()
                .parse()
                .with_context(|| format!("{name}={value:?} is not a number"))
        }

        if let Some(v) = lookup("RKVOL_WAIT_FOR_ATTACH_TIMEOUT_SECS") {
            self.wait_for_attach_timeout_secs = number("RKVOL_WAIT_FOR_ATTACH_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("RKVOL_INITIAL_BACKOFF_MILLIS") {
            self.initial_backoff_millis = number("RKVOL_INITIAL_BACKOFF_MILLIS", &v)?;
        }
        if let Some(v) = lookup("RKVOL_MAX_BACKOFF_MILLIS") {
            self.max_backoff_millis = number("RKVOL_MAX_BACKOFF_MILLIS", &v)?;
        }
        if let Some(v) = lookup("RKVOL_RECONCILER_PERIOD_MILLIS") {
            self.reconciler_loop_period_millis = number("RKVOL_RECONCILER_PERIOD_MILLIS", &v)?;
        }
        if let Some(v) = lookup("RKVOL_CHECK_NODE_CAPABILITIES") {
            self.check_node_capabilities_before_mount = v == "1";
        }
        if let Some(v) = lookup("RKVOL_BLOCK_VOLUME") {
            self.block_volume_enabled = v == "1";
        }
        if let Some(v) = lookup("RKVOL_CONTROLLER_ATTACH_DETACH") {
            self.controller_attach_detach_enabled = v != "0";
        }
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.wait_for_attach_timeout_secs == 0 {
            bail!("waitForAttachTimeoutSecs must be greater than zero");
        }
        if self.reconciler_loop_period_millis == 0 {
            bail!("reconcilerLoopPeriodMillis must be greater than zero");
        }
        if self.initial_backoff_millis > self.max_backoff_millis {
            bail!(
                "initialBackoffMillis ({}) exceeds maxBackoffMillis ({})",
                self.initial_backoff_millis,
                self.max_backoff_millis
            );
        }
        Ok(())
    }

    pub fn wait_for_attach_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_for_attach_timeout_secs)
    }

    pub fn reconciler_loop_period(&self) -> Duration {
        Duration::from_millis(self.reconciler_loop_period_millis)
    }

    pub fn backoff(&self) -> BackoffConfig {
        BackoffConfig {
            initial: Duration::from_millis(self.initial_backoff_millis),
            max: Duration::from_millis(self.max_backoff_millis),
        }
    }
}

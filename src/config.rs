/*!
Engine configuration.

Every recognized knob lives on [`EngineConfig`]; defaults match the documented
contract, and `from_env` layers environment overrides on top (the storage
directory and the alert endpoint are the deploy-specific values).
*/

use std::path::PathBuf;
use std::time::Duration;

use rustc_hash::FxHashMap;

/// Which storage arrangement the checkpoint store runs with.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StorageBackendKind {
    /// File back-end only.
    File,
    /// Opaque primary key/value store with the file back-end as a durability
    /// net on any primary failure.
    #[default]
    PrimaryWithFileFallback,
}

/// Default snapshot size cap: 50 MiB.
pub const DEFAULT_MAX_CHECKPOINT_SIZE_BYTES: usize = 50 * 1024 * 1024;

/// Default cumulative-storage alert threshold: 5 GiB.
pub const DEFAULT_STORAGE_ALERT_THRESHOLD_BYTES: u64 = 5 * 1024 * 1024 * 1024;

/// Engine-wide configuration.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Write an automated checkpoint when `auto_checkpoint_interval` has
    /// elapsed since the last write (checked at stage boundaries).
    pub enable_auto_checkpoints: bool,
    pub auto_checkpoint_interval: Duration,
    /// Write `before-`/`after-` checkpoints at every stage boundary.
    pub checkpoint_after_each_agent: bool,
    /// Retention cap per workflow; 0 means unlimited.
    pub max_checkpoints_per_workflow: usize,
    pub max_checkpoint_size_bytes: usize,
    pub storage_backend: StorageBackendKind,
    pub local_storage_directory: PathBuf,
    pub compress_snapshots: bool,
    /// Running workflows older than this trigger a long-running alert.
    pub long_running_threshold: Duration,
    /// Cumulative checkpoint storage above this triggers a storage alert.
    pub storage_alert_threshold_bytes: u64,
    /// Per-agent hard timeout; absent agents fall back to
    /// `default_stage_timeout`.
    pub stage_timeouts: FxHashMap<String, Duration>,
    pub default_stage_timeout: Duration,
    /// Per-agent retry budgets; absent agents fall back to the built-in
    /// research-pipeline defaults, then to 1.
    pub retry_max_attempts: FxHashMap<String, u32>,
    /// Timing middleware warns when a stage exceeds this latency.
    pub slow_stage_threshold: Duration,
    /// Back-pressure: process-wide bound on concurrently running workflows.
    pub max_concurrent_workflows: usize,
    /// Back-pressure: bound on in-flight file back-end writes.
    pub max_inflight_checkpoint_writes: usize,
    /// Where the alert sink POSTs alert batches; alerts are only recorded
    /// locally when unset.
    pub alert_endpoint: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            enable_auto_checkpoints: true,
            auto_checkpoint_interval: Duration::from_secs(5 * 60),
            checkpoint_after_each_agent: true,
            max_checkpoints_per_workflow: 10,
            max_checkpoint_size_bytes: DEFAULT_MAX_CHECKPOINT_SIZE_BYTES,
            storage_backend: StorageBackendKind::default(),
            local_storage_directory: PathBuf::from("./checkpoints"),
            compress_snapshots: false,
            long_running_threshold: Duration::from_secs(30 * 60),
            storage_alert_threshold_bytes: DEFAULT_STORAGE_ALERT_THRESHOLD_BYTES,
            stage_timeouts: FxHashMap::default(),
            default_stage_timeout: Duration::from_secs(60),
            retry_max_attempts: FxHashMap::default(),
            slow_stage_threshold: Duration::from_secs(30),
            max_concurrent_workflows: 8,
            max_inflight_checkpoint_writes: 32,
            alert_endpoint: None,
        }
    }
}

impl EngineConfig {
    /// Defaults with environment overrides applied.
    ///
    /// Recognized variables: `CAIRN_STORAGE_DIR` (file back-end root) and
    /// `CAIRN_ALERT_ENDPOINT` (alert sink target).
    #[must_use]
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let mut config = Self::default();
        if let Ok(dir) = std::env::var("CAIRN_STORAGE_DIR") {
            if !dir.trim().is_empty() {
                config.local_storage_directory = PathBuf::from(dir);
            }
        }
        if let Ok(endpoint) = std::env::var("CAIRN_ALERT_ENDPOINT") {
            if !endpoint.trim().is_empty() {
                config.alert_endpoint = Some(endpoint);
            }
        }
        config
    }

    #[must_use]
    pub fn with_storage_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.local_storage_directory = dir.into();
        self
    }

    #[must_use]
    pub fn with_storage_backend(mut self, kind: StorageBackendKind) -> Self {
        self.storage_backend = kind;
        self
    }

    #[must_use]
    pub fn with_retention(mut self, max_checkpoints_per_workflow: usize) -> Self {
        self.max_checkpoints_per_workflow = max_checkpoints_per_workflow;
        self
    }

    #[must_use]
    pub fn with_stage_timeout(mut self, agent_id: impl Into<String>, timeout: Duration) -> Self {
        self.stage_timeouts.insert(agent_id.into(), timeout);
        self
    }

    #[must_use]
    pub fn with_retry_attempts(mut self, agent_id: impl Into<String>, attempts: u32) -> Self {
        self.retry_max_attempts.insert(agent_id.into(), attempts);
        self
    }

    #[must_use]
    pub fn with_alert_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.alert_endpoint = Some(endpoint.into());
        self
    }

    /// Hard timeout for one stage invocation.
    #[must_use]
    pub fn stage_timeout(&self, agent_id: &str) -> Duration {
        self.stage_timeouts
            .get(agent_id)
            .copied()
            .unwrap_or(self.default_stage_timeout)
    }

    /// Retry budget (total attempts) for one stage.
    ///
    /// Configured values win; otherwise the research pipeline's historical
    /// defaults apply to the well-known agent names, and anything else gets a
    /// single attempt.
    #[must_use]
    pub fn retry_budget(&self, agent_id: &str) -> u32 {
        if let Some(attempts) = self.retry_max_attempts.get(agent_id) {
            return (*attempts).max(1);
        }
        let lower = agent_id.to_ascii_lowercase();
        match lower.as_str() {
            "clarify" => 2,
            "brief" => 1,
            "researcher" => 3,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_contract() {
        let config = EngineConfig::default();
        assert!(config.enable_auto_checkpoints);
        assert_eq!(config.auto_checkpoint_interval, Duration::from_secs(300));
        assert!(config.checkpoint_after_each_agent);
        assert_eq!(config.max_checkpoints_per_workflow, 10);
        assert_eq!(config.max_checkpoint_size_bytes, 50 * 1024 * 1024);
        assert_eq!(
            config.storage_backend,
            StorageBackendKind::PrimaryWithFileFallback
        );
        assert_eq!(
            config.local_storage_directory,
            PathBuf::from("./checkpoints")
        );
        assert!(!config.compress_snapshots);
        assert_eq!(config.long_running_threshold, Duration::from_secs(1800));
        assert_eq!(
            config.storage_alert_threshold_bytes,
            5 * 1024 * 1024 * 1024
        );
        assert_eq!(config.default_stage_timeout, Duration::from_secs(60));
    }

    #[test]
    fn retry_budget_prefers_configured_values() {
        let config = EngineConfig::default().with_retry_attempts("Researcher", 5);
        assert_eq!(config.retry_budget("Researcher"), 5);
    }

    #[test]
    fn retry_budget_built_in_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.retry_budget("Clarify"), 2);
        assert_eq!(config.retry_budget("Brief"), 1);
        assert_eq!(config.retry_budget("researcher"), 3);
        assert_eq!(config.retry_budget("Scraper"), 1);
    }

    #[test]
    fn stage_timeout_falls_back_to_default() {
        let config =
            EngineConfig::default().with_stage_timeout("Researcher", Duration::from_secs(120));
        assert_eq!(config.stage_timeout("Researcher"), Duration::from_secs(120));
        assert_eq!(config.stage_timeout("Brief"), Duration::from_secs(60));
    }
}

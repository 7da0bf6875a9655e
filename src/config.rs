//! Orchestrator configuration knobs.
//!
//! Every knob has a default; builder-style `with_*` methods cover the values
//! tests and the CLI override most often.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Directory under the workspace root that holds persisted campaign state.
pub const STATE_DIR_NAME: &str = ".nerd";

/// Configuration for the campaign orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Workspace root the campaign operates on.
    pub workspace_dir: PathBuf,
    /// Base concurrency cap for task execution.
    pub max_parallel_tasks: usize,
    /// Campaign-level deadline.
    #[serde(with = "duration_secs")]
    pub campaign_timeout: Duration,
    /// Per-task execution deadline.
    #[serde(with = "duration_secs")]
    pub task_timeout: Duration,
    /// Remove both campaign and per-task deadlines.
    pub disable_timeouts: bool,
    /// Maximum retry attempts per task before it is failed.
    pub max_retries: u32,
    /// Failed-task count at which the kernel derives `replan_needed`.
    pub replan_threshold: u32,
    /// Interval between heartbeat facts and progress snapshots.
    #[serde(with = "duration_secs")]
    pub heartbeat_interval: Duration,
    /// Interval between periodic autosaves.
    #[serde(with = "duration_secs")]
    pub autosave_interval: Duration,
    /// Maximum number of entries in the task result cache.
    pub task_result_cache_limit: usize,
    /// Per-entry byte cap for cached task outputs.
    pub task_result_entry_bytes: usize,
    /// Base retry backoff.
    #[serde(with = "duration_secs")]
    pub retry_base_backoff: Duration,
    /// Maximum retry backoff.
    #[serde(with = "duration_secs")]
    pub retry_max_backoff: Duration,
    /// Run phase checkpoints even when some tasks ended skipped or failed.
    pub checkpoint_on_fail: bool,
    /// Invoke the replanner automatically on failures and blocks.
    pub auto_replan: bool,
    /// Toolchain used for build/test/static-check verification.
    pub toolchain: ToolchainConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            workspace_dir: PathBuf::from("."),
            max_parallel_tasks: 3,
            campaign_timeout: Duration::from_secs(4 * 60 * 60),
            task_timeout: Duration::from_secs(30 * 60),
            disable_timeouts: false,
            max_retries: 3,
            replan_threshold: 3,
            heartbeat_interval: Duration::from_secs(15),
            autosave_interval: Duration::from_secs(60),
            task_result_cache_limit: 50,
            task_result_entry_bytes: 8 * 1024,
            retry_base_backoff: Duration::from_secs(5),
            retry_max_backoff: Duration::from_secs(5 * 60),
            checkpoint_on_fail: true,
            auto_replan: true,
            toolchain: ToolchainConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Create a config rooted at the given workspace directory.
    pub fn new(workspace_dir: impl Into<PathBuf>) -> Self {
        Self {
            workspace_dir: workspace_dir.into(),
            ..Default::default()
        }
    }

    /// Directory that holds all persisted campaign state.
    pub fn state_dir(&self) -> PathBuf {
        self.workspace_dir.join(STATE_DIR_NAME)
    }

    /// Directory that holds serialised campaign files.
    pub fn campaigns_dir(&self) -> PathBuf {
        self.state_dir().join("campaigns")
    }

    /// Set the base concurrency cap.
    pub fn with_max_parallel_tasks(mut self, max: usize) -> Self {
        self.max_parallel_tasks = max.max(1);
        self
    }

    /// Set the per-task deadline.
    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }

    /// Remove campaign and per-task deadlines.
    pub fn with_timeouts_disabled(mut self, disabled: bool) -> Self {
        self.disable_timeouts = disabled;
        self
    }

    /// Set the maximum retry attempts per task.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the failed-task threshold for `replan_needed`.
    pub fn with_replan_threshold(mut self, threshold: u32) -> Self {
        self.replan_threshold = threshold;
        self
    }

    /// Set the task result cache entry limit.
    pub fn with_cache_limit(mut self, limit: usize) -> Self {
        self.task_result_cache_limit = limit;
        self
    }

    /// Set the retry backoff window.
    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.retry_base_backoff = base;
        self.retry_max_backoff = max;
        self
    }

    /// Enable or disable automatic replanning.
    pub fn with_auto_replan(mut self, enabled: bool) -> Self {
        self.auto_replan = enabled;
        self
    }
}

/// Toolchain invocations used by checkpoint verification and assault stages.
///
/// The target (a package pattern such as `./internal/core/...`) is appended
/// to the argument list when a scoped invocation is needed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolchainConfig {
    /// Toolchain binary.
    pub binary: String,
    /// Arguments for a test run.
    pub test_args: Vec<String>,
    /// Arguments for a race-detector test run.
    pub race_args: Vec<String>,
    /// Arguments for a build.
    pub build_args: Vec<String>,
    /// Arguments for a static check.
    pub static_check_args: Vec<String>,
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        Self {
            binary: "go".to_string(),
            test_args: vec!["test".to_string()],
            race_args: vec!["test".to_string(), "-race".to_string()],
            build_args: vec!["build".to_string()],
            static_check_args: vec!["vet".to_string()],
        }
    }
}

/// Serde helpers for Duration serialization as whole seconds.
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.max_parallel_tasks, 3);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.retry_base_backoff, Duration::from_secs(5));
        assert_eq!(config.retry_max_backoff, Duration::from_secs(300));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(15));
        assert_eq!(config.autosave_interval, Duration::from_secs(60));
        assert!(config.auto_replan);
    }

    #[test]
    fn test_state_dirs() {
        let config = OrchestratorConfig::new("/work");
        assert_eq!(config.state_dir(), PathBuf::from("/work/.nerd"));
        assert_eq!(
            config.campaigns_dir(),
            PathBuf::from("/work/.nerd/campaigns")
        );
    }

    #[test]
    fn test_builders() {
        let config = OrchestratorConfig::default()
            .with_max_parallel_tasks(0)
            .with_max_retries(0)
            .with_cache_limit(2)
            .with_backoff(Duration::from_millis(1), Duration::from_secs(1));
        // A zero cap would deadlock the phase loop; clamp to serial.
        assert_eq!(config.max_parallel_tasks, 1);
        assert_eq!(config.max_retries, 0);
        assert_eq!(config.task_result_cache_limit, 2);
    }

    #[test]
    fn test_serde_round_trip() {
        let config = OrchestratorConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: OrchestratorConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.campaign_timeout, config.campaign_timeout);
        assert_eq!(back.toolchain.binary, config.toolchain.binary);
    }
}

//! Assault sweep configuration and result records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Granularity of target discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AssaultScope {
    /// One wildcard target for the whole repository.
    Repo,
    /// Group packages by their first path segment.
    Module,
    /// Group by the first two segments under `internal`/`cmd`/`pkg`,
    /// otherwise by the first segment.
    Subsystem,
    /// One target per package directory.
    #[default]
    Package,
}

/// The kind of work an assault stage performs against a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StageKind {
    Test,
    RaceTest,
    StaticCheck,
    AdversarialReview,
    CustomCommand,
}

impl StageKind {
    /// Short tag used in log file names.
    pub fn short(&self) -> &'static str {
        match self {
            Self::Test => "test",
            Self::RaceTest => "race",
            Self::StaticCheck => "static",
            Self::AdversarialReview => "review",
            Self::CustomCommand => "custom",
        }
    }

    /// Stable wire name, matching the serde representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Test => "test",
            Self::RaceTest => "race-test",
            Self::StaticCheck => "static-check",
            Self::AdversarialReview => "adversarial-review",
            Self::CustomCommand => "custom-command",
        }
    }
}

/// One stage executed for every target in every cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssaultStage {
    pub kind: StageKind,
    /// Command template for custom-command stages; `{{target}}` is
    /// substituted per target.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Per-stage timeout; 0 means inherit the config default.
    #[serde(default)]
    pub timeout_secs: u64,
    /// How many attempts to run per target per cycle.
    #[serde(default)]
    pub repeat: u32,
}

impl AssaultStage {
    pub fn new(kind: StageKind) -> Self {
        Self {
            kind,
            command: None,
            timeout_secs: 0,
            repeat: 0,
        }
    }

    pub fn with_command(mut self, template: &str) -> Self {
        self.command = Some(template.to_string());
        self
    }

    pub fn with_repeat(mut self, repeat: u32) -> Self {
        self.repeat = repeat;
        self
    }
}

/// Configuration for an adversarial assault sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssaultConfig {
    #[serde(default)]
    pub scope: AssaultScope,
    /// Include path prefixes (slash-normalised).
    #[serde(default)]
    pub include: Vec<String>,
    /// Exclude path prefixes (slash-normalised).
    #[serde(default)]
    pub exclude: Vec<String>,
    /// Targets per batch.
    #[serde(default)]
    pub batch_size: usize,
    /// Full sweeps over every target.
    #[serde(default)]
    pub cycles: u32,
    /// Default per-stage timeout in seconds.
    #[serde(default)]
    pub stage_timeout_secs: u64,
    #[serde(default)]
    pub stages: Vec<AssaultStage>,
    /// Cap on captured output per stage attempt, in bytes.
    #[serde(default)]
    pub max_log_bytes: usize,
    /// Cap on remediation tasks generated by triage.
    #[serde(default)]
    pub max_remediation_tasks: usize,
    /// Ask the LLM for a remediation plan before the deterministic fallback.
    #[serde(default = "default_true")]
    pub llm_triage: bool,
}

fn default_true() -> bool {
    true
}

impl Default for AssaultConfig {
    fn default() -> Self {
        let mut config = Self {
            scope: AssaultScope::Package,
            include: Vec::new(),
            exclude: Vec::new(),
            batch_size: 0,
            cycles: 0,
            stage_timeout_secs: 0,
            stages: Vec::new(),
            max_log_bytes: 0,
            max_remediation_tasks: 0,
            llm_triage: true,
        };
        config.normalise();
        config
    }
}

impl AssaultConfig {
    /// Fill missing fields from defaults. Recomputed on every load so that
    /// hand-edited or older persisted configs stay usable.
    pub fn normalise(&mut self) {
        if self.batch_size == 0 {
            self.batch_size = 5;
        }
        if self.cycles == 0 {
            self.cycles = 1;
        }
        if self.stage_timeout_secs == 0 {
            self.stage_timeout_secs = 120;
        }
        if self.max_log_bytes == 0 {
            self.max_log_bytes = 256 * 1024;
        }
        if self.max_remediation_tasks == 0 {
            self.max_remediation_tasks = 10;
        }
        if self.stages.is_empty() {
            self.stages = vec![
                AssaultStage::new(StageKind::Test),
                AssaultStage::new(StageKind::RaceTest),
                AssaultStage::new(StageKind::StaticCheck),
            ];
        }
        for stage in &mut self.stages {
            if stage.timeout_secs == 0 {
                stage.timeout_secs = self.stage_timeout_secs;
            }
            if stage.repeat == 0 {
                stage.repeat = 1;
            }
        }
        self.include = self
            .include
            .iter()
            .map(|p| crate::util::normalise_slashes(p.trim_end_matches('/')))
            .collect();
        self.exclude = self
            .exclude
            .iter()
            .map(|p| crate::util::normalise_slashes(p.trim_end_matches('/')))
            .collect();
    }
}

/// One append-only JSONL record per stage attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssaultRecord {
    pub campaign_id: String,
    pub batch_id: String,
    pub target: String,
    pub cycle: u32,
    pub stage: StageKind,
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub exit_code: i32,
    pub killed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kill_reason: Option<String>,
    pub truncated: bool,
    pub log_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AssaultRecord {
    /// Recovery key: a record with the same key is never re-run.
    pub fn key(&self) -> String {
        stage_key(self.cycle, self.stage, self.attempt, &self.target)
    }

    pub fn passed(&self) -> bool {
        self.exit_code == 0 && self.error.is_none() && !self.killed
    }
}

/// Stable key identifying one stage attempt against one target.
pub fn stage_key(cycle: u32, stage: StageKind, attempt: u32, target: &str) -> String {
    format!("{}|{}|{}|{}", cycle, stage.as_str(), attempt, target)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalise_fills_defaults() {
        let mut config = AssaultConfig {
            scope: AssaultScope::Subsystem,
            include: vec!["internal/".to_string()],
            exclude: Vec::new(),
            batch_size: 0,
            cycles: 0,
            stage_timeout_secs: 0,
            stages: vec![AssaultStage::new(StageKind::Test)],
            max_log_bytes: 0,
            max_remediation_tasks: 0,
            llm_triage: true,
        };
        config.normalise();
        assert_eq!(config.batch_size, 5);
        assert_eq!(config.cycles, 1);
        assert_eq!(config.stages[0].timeout_secs, 120);
        assert_eq!(config.stages[0].repeat, 1);
        // Trailing slash stripped from prefixes.
        assert_eq!(config.include, vec!["internal"]);
    }

    #[test]
    fn test_normalise_is_idempotent() {
        let mut config = AssaultConfig::default();
        let before = serde_json::to_string(&config).unwrap();
        config.normalise();
        assert_eq!(before, serde_json::to_string(&config).unwrap());
    }

    #[test]
    fn test_default_stages() {
        let config = AssaultConfig::default();
        let kinds: Vec<StageKind> = config.stages.iter().map(|s| s.kind).collect();
        assert_eq!(
            kinds,
            vec![StageKind::Test, StageKind::RaceTest, StageKind::StaticCheck]
        );
    }

    #[test]
    fn test_stage_key() {
        assert_eq!(
            stage_key(2, StageKind::RaceTest, 1, "./internal/a/..."),
            "2|race-test|1|./internal/a/..."
        );
    }

    #[test]
    fn test_record_passed() {
        let mut record = AssaultRecord {
            campaign_id: "c".to_string(),
            batch_id: "batch_0001".to_string(),
            target: "./internal/a/...".to_string(),
            cycle: 1,
            stage: StageKind::Test,
            attempt: 1,
            started_at: Utc::now(),
            duration_ms: 10,
            exit_code: 0,
            killed: false,
            kill_reason: None,
            truncated: false,
            log_path: "logs/b/test_abc.log".to_string(),
            error: None,
        };
        assert!(record.passed());
        record.exit_code = 1;
        assert!(!record.passed());
        record.exit_code = 0;
        record.killed = true;
        assert!(!record.passed());
    }

    #[test]
    fn test_record_jsonl_round_trip() {
        let record = AssaultRecord {
            campaign_id: "c".to_string(),
            batch_id: "batch_0001".to_string(),
            target: "./pkg/x/...".to_string(),
            cycle: 1,
            stage: StageKind::StaticCheck,
            attempt: 2,
            started_at: Utc::now(),
            duration_ms: 42,
            exit_code: 2,
            killed: true,
            kill_reason: Some("timeout".to_string()),
            truncated: true,
            log_path: "logs/b/static_0123456789.log".to_string(),
            error: Some("exit 2".to_string()),
        };
        let line = serde_json::to_string(&record).unwrap();
        assert!(!line.contains('\n'));
        let back: AssaultRecord = serde_json::from_str(&line).unwrap();
        assert_eq!(back.key(), record.key());
        assert_eq!(back.stage, StageKind::StaticCheck);
    }
}

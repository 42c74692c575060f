use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::paths::Paths;
use crate::types::Mode;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusConfig {
    /// Number of worker tasks pulling from the event queue.
    #[serde(default = "default_bus_workers")]
    pub workers: usize,
    /// Bounded queue size; `emit` waits when the queue is full.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

fn default_bus_workers() -> usize {
    4
}

fn default_queue_capacity() -> usize {
    256
}

fn default_shutdown_timeout_ms() -> u64 {
    2000
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            workers: default_bus_workers(),
            queue_capacity: default_queue_capacity(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerConfig {
    /// How often the loop checks for due jobs.
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

fn default_tick_ms() -> u64 {
    250
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionsConfig {
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    /// Mode of the session created at boot.
    #[serde(default)]
    pub default_mode: Mode,
    /// Sessions idle for longer than this are closed by the cleanup sweep.
    #[serde(default = "default_max_idle_hours")]
    pub max_idle_hours: u64,
    /// Interval of the cleanup sweep. 0 disables it.
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
}

fn default_history_limit() -> usize {
    100
}

fn default_max_idle_hours() -> u64 {
    24
}

fn default_cleanup_interval_secs() -> u64 {
    3600
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            history_limit: default_history_limit(),
            default_mode: Mode::default(),
            max_idle_hours: default_max_idle_hours(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReasoningConfig {
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    /// Install the built-in global rules (intent shape, blank entities).
    #[serde(default = "default_true")]
    pub default_rules: bool,
}

fn default_true() -> bool {
    true
}

impl Default for ReasoningConfig {
    fn default() -> Self {
        Self {
            history_limit: default_history_limit(),
            default_rules: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatcherConfig {
    /// Verify declared skill requirements before every call.
    #[serde(default = "default_true")]
    pub check_dependencies: bool,
    /// Per-call wall-clock limit. None = unbounded.
    #[serde(default)]
    pub skill_timeout_ms: Option<u64>,
    /// Number of recent dispatch records kept for introspection.
    #[serde(default = "default_history_limit")]
    pub record_history: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            check_dependencies: true,
            skill_timeout_ms: None,
            record_history: default_history_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LearningConfig {
    /// Minimum correction confidence that overrides the parsed intent.
    #[serde(default = "default_override_threshold")]
    pub override_threshold: f64,
    /// A skill is unhealthy once its failures in the window reach this.
    #[serde(default = "default_health_failure_threshold")]
    pub health_failure_threshold: u32,
    /// Sliding window for health checks. None counts every failure.
    #[serde(default)]
    pub health_window_secs: Option<u64>,
    #[serde(default = "default_recent_errors_limit")]
    pub recent_errors_limit: usize,
    /// Persist learning to this file (supports `~/`). None keeps it in memory.
    #[serde(default)]
    pub file: Option<String>,
    /// Autosave interval when `file` is set. 0 disables periodic saves.
    #[serde(default = "default_autosave_interval_secs")]
    pub autosave_interval_secs: u64,
}

fn default_override_threshold() -> f64 {
    0.3
}

fn default_health_failure_threshold() -> u32 {
    3
}

fn default_recent_errors_limit() -> usize {
    10
}

fn default_autosave_interval_secs() -> u64 {
    300
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            override_threshold: default_override_threshold(),
            health_failure_threshold: default_health_failure_threshold(),
            health_window_secs: None,
            recent_errors_limit: default_recent_errors_limit(),
            file: None,
            autosave_interval_secs: default_autosave_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageConfig {
    /// SQLite conversation database (supports `~/`). None keeps conversations in memory.
    #[serde(default)]
    pub conversation_db: Option<String>,
    /// Capacity of the in-memory conversation store.
    #[serde(default = "default_conversation_limit")]
    pub conversation_limit: usize,
    /// Append dispatch records and mode changes to `<base>/audit/*.jsonl`.
    #[serde(default)]
    pub audit: bool,
}

fn default_conversation_limit() -> usize {
    500
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            conversation_db: None,
            conversation_limit: default_conversation_limit(),
            audit: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub sessions: SessionsConfig,
    #[serde(default)]
    pub reasoning: ReasoningConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub learning: LearningConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_or_default(paths: &Paths) -> Result<Self> {
        let config_path = paths.config_file();
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject settings the runtime cannot start with.
    pub fn validate(&self) -> Result<()> {
        if self.bus.workers == 0 {
            return Err(Error::Config("bus.workers must be at least 1".to_string()));
        }
        if self.bus.queue_capacity == 0 {
            return Err(Error::Config("bus.queueCapacity must be at least 1".to_string()));
        }
        if self.scheduler.tick_ms == 0 {
            return Err(Error::Config("scheduler.tickMs must be at least 1".to_string()));
        }
        if self.sessions.history_limit == 0 {
            return Err(Error::Config("sessions.historyLimit must be at least 1".to_string()));
        }
        if !(0.0..=1.0).contains(&self.learning.override_threshold) {
            return Err(Error::Config(format!(
                "learning.overrideThreshold must be within [0, 1], got {}",
                self.learning.override_threshold
            )));
        }
        if self.learning.health_failure_threshold == 0 {
            return Err(Error::Config(
                "learning.healthFailureThreshold must be at least 1".to_string(),
            ));
        }
        if self.dispatcher.skill_timeout_ms == Some(0) {
            return Err(Error::Config("dispatcher.skillTimeoutMs must be positive".to_string()));
        }
        Ok(())
    }

    pub fn learning_path(&self) -> Option<PathBuf> {
        self.learning.file.as_deref().map(expand_home)
    }

    pub fn conversation_db_path(&self) -> Option<PathBuf> {
        self.storage.conversation_db.as_deref().map(expand_home)
    }
}

/// Expand a leading `~/` to the home directory.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_partial_config_fills_defaults() {
        let raw = r#"{
  "bus": { "workers": 2 },
  "sessions": { "defaultMode": "SAFE" },
  "learning": { "healthWindowSecs": 600 }
}"#;
        let cfg: Config = serde_json::from_str(raw).unwrap();
        assert_eq!(cfg.bus.workers, 2);
        assert_eq!(cfg.bus.queue_capacity, 256);
        assert_eq!(cfg.sessions.default_mode, Mode::Safe);
        assert_eq!(cfg.sessions.history_limit, 100);
        assert_eq!(cfg.learning.health_window_secs, Some(600));
        assert!((cfg.learning.override_threshold - 0.3).abs() < f64::EPSILON);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let mut cfg = Config::default();
        cfg.bus.workers = 0;
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_validate_rejects_threshold_out_of_range() {
        let mut cfg = Config::default();
        cfg.learning.override_threshold = 1.5;
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let paths = Paths::with_base(dir.path().to_path_buf());

        let mut cfg = Config::default();
        cfg.scheduler.tick_ms = 50;
        cfg.storage.audit = true;
        cfg.save(&paths.config_file()).unwrap();

        let loaded = Config::load_or_default(&paths).unwrap();
        assert_eq!(loaded.scheduler.tick_ms, 50);
        assert!(loaded.storage.audit);
    }

    #[test]
    fn test_load_or_default_without_file() {
        let dir = TempDir::new().unwrap();
        let paths = Paths::with_base(dir.path().join("missing"));
        let cfg = Config::load_or_default(&paths).unwrap();
        assert_eq!(cfg.bus.workers, 4);
    }
}

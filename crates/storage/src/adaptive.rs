use chrono::Utc;
use conductor_core::config::LearningConfig;
use conductor_core::{entities_signature, normalize_text, Entities, Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info, warn};

const SNAPSHOT_VERSION: u32 = 1;

/// `occurrences × 1.5` once a key has been seen more than once, else 1.0.
fn weight_for(count: u64) -> f64 {
    if count > 1 {
        count as f64 * 1.5
    } else {
        1.0
    }
}

fn confidence_for(weight: f64) -> f64 {
    (weight / 10.0).min(1.0)
}

/// A learned meaning for an utterance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Correction {
    pub intent: String,
    pub entities: Entities,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CorrectionEntry {
    pub intent: String,
    #[serde(default)]
    pub entities: Entities,
    pub count: u64,
    pub weight: f64,
    pub updated_at_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuccessPattern {
    pub intent: String,
    #[serde(default)]
    pub entities: Entities,
    pub count: u64,
    pub weight: f64,
    /// Last utterance that led to this success.
    #[serde(default)]
    pub last_text: String,
    #[serde(default)]
    pub last_result: serde_json::Value,
    pub updated_at_ms: i64,
}

impl SuccessPattern {
    pub fn confidence(&self) -> f64 {
        confidence_for(self.weight)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureRecord {
    pub text: String,
    pub error: String,
    pub at_ms: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureEntry {
    pub total_failures: u64,
    #[serde(default)]
    pub recent_errors: VecDeque<FailureRecord>,
    /// Failure timestamps inside the health window, when one is configured.
    #[serde(default)]
    pub failure_times_ms: VecDeque<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkillHealth {
    pub intent: String,
    pub total_failures: u64,
    /// Failures counted against the threshold.
    pub counted_failures: u64,
    pub is_healthy: bool,
    pub recent_errors: Vec<String>,
}

/// Serialized form of everything the memory has learned.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LearningSnapshot {
    pub version: u32,
    #[serde(default)]
    pub corrections: BTreeMap<String, Vec<CorrectionEntry>>,
    #[serde(default)]
    pub successes: BTreeMap<String, SuccessPattern>,
    #[serde(default)]
    pub failures: BTreeMap<String, FailureEntry>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LearningStats {
    pub correction_keys: usize,
    pub correction_entries: usize,
    pub success_patterns: usize,
    pub failing_intents: usize,
    pub total_failures: u64,
}

#[derive(Default)]
struct LearningState {
    corrections: BTreeMap<String, Vec<CorrectionEntry>>,
    successes: BTreeMap<String, SuccessPattern>,
    failures: BTreeMap<String, FailureEntry>,
}

/// Feedback memory: user corrections, successful patterns and per-intent failures.
pub struct AdaptiveMemory {
    state: Mutex<LearningState>,
    failure_threshold: u64,
    window: Option<Duration>,
    recent_errors_limit: usize,
}

impl Default for AdaptiveMemory {
    fn default() -> Self {
        Self::new(&LearningConfig::default())
    }
}

impl AdaptiveMemory {
    pub fn new(config: &LearningConfig) -> Self {
        Self {
            state: Mutex::new(LearningState::default()),
            failure_threshold: config.health_failure_threshold.max(1) as u64,
            window: config.health_window_secs.map(Duration::from_secs),
            recent_errors_limit: config.recent_errors_limit.max(1),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LearningState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn record_correction(&self, text: &str, intent: &str, entities: &Entities) {
        let key = normalize_text(text);
        if key.is_empty() {
            return;
        }
        let now = Utc::now().timestamp_millis();
        let mut state = self.lock();
        let list = state.corrections.entry(key.clone()).or_default();
        match list
            .iter_mut()
            .find(|e| e.intent == intent && &e.entities == entities)
        {
            Some(entry) => {
                entry.count += 1;
                entry.weight = entry.weight.max(weight_for(entry.count));
                entry.updated_at_ms = now;
            }
            None => list.push(CorrectionEntry {
                intent: intent.to_string(),
                entities: entities.clone(),
                count: 1,
                weight: weight_for(1),
                updated_at_ms: now,
            }),
        }
        debug!(text = %key, intent = %intent, "Correction recorded");
    }

    /// Best learned meaning for `text`: highest weight, most recent on ties.
    pub fn get_correction_for(&self, text: &str) -> Option<Correction> {
        let key = normalize_text(text);
        let state = self.lock();
        let best = state.corrections.get(&key)?.iter().max_by(|a, b| {
            a.weight
                .total_cmp(&b.weight)
                .then(a.updated_at_ms.cmp(&b.updated_at_ms))
        })?;
        Some(Correction {
            intent: best.intent.clone(),
            entities: best.entities.clone(),
            confidence: confidence_for(best.weight),
        })
    }

    pub fn record_success(
        &self,
        text: &str,
        intent: &str,
        entities: &Entities,
        result: &serde_json::Value,
    ) {
        let key = format!("{}:{}", intent, entities_signature(entities));
        let now = Utc::now().timestamp_millis();
        let mut state = self.lock();
        let pattern = state.successes.entry(key).or_insert_with(|| SuccessPattern {
            intent: intent.to_string(),
            entities: entities.clone(),
            count: 0,
            weight: 0.0,
            last_text: String::new(),
            last_result: serde_json::Value::Null,
            updated_at_ms: now,
        });
        pattern.count += 1;
        pattern.weight = pattern.weight.max(weight_for(pattern.count));
        pattern.last_text = normalize_text(text);
        pattern.last_result = result.clone();
        pattern.updated_at_ms = now;
    }

    pub fn get_success_pattern(&self, intent: &str, entities: &Entities) -> Option<SuccessPattern> {
        let key = format!("{}:{}", intent, entities_signature(entities));
        self.lock().successes.get(&key).cloned()
    }

    pub fn record_failure(&self, text: &str, intent: &str, error: &str) {
        let now = Utc::now().timestamp_millis();
        let mut state = self.lock();
        let entry = state.failures.entry(intent.to_string()).or_default();
        entry.total_failures += 1;
        entry.recent_errors.push_back(FailureRecord {
            text: normalize_text(text),
            error: error.to_string(),
            at_ms: now,
        });
        while entry.recent_errors.len() > self.recent_errors_limit {
            entry.recent_errors.pop_front();
        }
        if let Some(window) = self.window {
            entry.failure_times_ms.push_back(now);
            prune_window(&mut entry.failure_times_ms, window, now);
        }
        let total = entry.total_failures;
        drop(state);
        if total == self.failure_threshold {
            warn!(intent = %intent, failures = total, "Skill reached failure threshold");
        }
    }

    pub fn get_skill_health(&self, intent: &str) -> SkillHealth {
        let now = Utc::now().timestamp_millis();
        let mut state = self.lock();
        let Some(entry) = state.failures.get_mut(intent) else {
            return SkillHealth {
                intent: intent.to_string(),
                total_failures: 0,
                counted_failures: 0,
                is_healthy: true,
                recent_errors: Vec::new(),
            };
        };
        let counted = match self.window {
            Some(window) => {
                prune_window(&mut entry.failure_times_ms, window, now);
                entry.failure_times_ms.len() as u64
            }
            None => entry.total_failures,
        };
        SkillHealth {
            intent: intent.to_string(),
            total_failures: entry.total_failures,
            counted_failures: counted,
            is_healthy: counted < self.failure_threshold,
            recent_errors: entry.recent_errors.iter().map(|r| r.error.clone()).collect(),
        }
    }

    pub fn export_learning(&self) -> LearningSnapshot {
        let state = self.lock();
        LearningSnapshot {
            version: SNAPSHOT_VERSION,
            corrections: state.corrections.clone(),
            successes: state.successes.clone(),
            failures: state.failures.clone(),
        }
    }

    /// Merge a snapshot: entries with an existing key are replaced, new ones added.
    pub fn import_learning(&self, snapshot: LearningSnapshot) -> Result<()> {
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(Error::Storage(format!(
                "Unsupported learning snapshot version {}",
                snapshot.version
            )));
        }
        let mut state = self.lock();
        for (key, entries) in snapshot.corrections {
            let list = state.corrections.entry(key).or_default();
            for incoming in entries {
                match list
                    .iter_mut()
                    .find(|e| e.intent == incoming.intent && e.entities == incoming.entities)
                {
                    Some(existing) => *existing = incoming,
                    None => list.push(incoming),
                }
            }
        }
        state.successes.extend(snapshot.successes);
        state.failures.extend(snapshot.failures);
        Ok(())
    }

    /// Write the snapshot as pretty JSON, replacing the file atomically.
    pub fn save(&self, path: &Path) -> Result<()> {
        let snapshot = self.export_learning();
        let content = serde_json::to_string_pretty(&snapshot)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, path)?;
        debug!(path = %path.display(), "Learning saved");
        Ok(())
    }

    pub fn load(&self, path: &Path) -> Result<()> {
        let content = std::fs::read_to_string(path)?;
        let snapshot: LearningSnapshot = serde_json::from_str(&content)?;
        self.import_learning(snapshot)?;
        info!(path = %path.display(), "Learning loaded");
        Ok(())
    }

    pub fn stats(&self) -> LearningStats {
        let state = self.lock();
        LearningStats {
            correction_keys: state.corrections.len(),
            correction_entries: state.corrections.values().map(Vec::len).sum(),
            success_patterns: state.successes.len(),
            failing_intents: state.failures.len(),
            total_failures: state.failures.values().map(|f| f.total_failures).sum(),
        }
    }
}

fn prune_window(times: &mut VecDeque<i64>, window: Duration, now: i64) {
    let cutoff = now - window.as_millis() as i64;
    while times.front().is_some_and(|t| *t < cutoff) {
        times.pop_front();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_core::entities;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_corrections_are_counted_once_each() {
        let memory = Arc::new(AdaptiveMemory::default());
        let ents = entities([("app", "obsidian")]);
        let tasks: Vec<_> = (0..2)
            .map(|_| {
                let memory = memory.clone();
                let ents = ents.clone();
                tokio::spawn(async move {
                    for _ in 0..3 {
                        memory.record_correction("Abre Obsidian", "open_app", &ents);
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        let snapshot = memory.export_learning();
        let list = &snapshot.corrections["abre obsidian"];
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].count, 6);
        let correction = memory.get_correction_for("abre obsidian").unwrap();
        assert!((correction.confidence - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_repeated_correction_overrides() {
        let memory = AdaptiveMemory::default();
        let ents = entities([("app", "obsidian")]);
        for _ in 0..3 {
            memory.record_correction("abre obsidian", "open_app", &ents);
        }
        let correction = memory.get_correction_for("  Abre   OBSIDIAN ").unwrap();
        assert_eq!(correction.intent, "open_app");
        assert_eq!(correction.entities, ents);
        assert!(correction.confidence > 0.3);
    }

    #[test]
    fn test_confidence_grows_until_capped() {
        let memory = AdaptiveMemory::default();
        let ents = Entities::new();
        let mut last = 0.0;
        for i in 0..10 {
            memory.record_correction("what time", "get_time", &ents);
            let confidence = memory.get_correction_for("what time").unwrap().confidence;
            if i > 0 && last < 1.0 {
                assert!(confidence > last, "confidence did not grow at step {}", i);
            }
            assert!(confidence <= 1.0);
            last = confidence;
        }
        assert_eq!(last, 1.0);
    }

    #[test]
    fn test_highest_weight_wins() {
        let memory = AdaptiveMemory::default();
        memory.record_correction("play it", "play_music", &Entities::new());
        memory.record_correction("play it", "play_video", &Entities::new());
        memory.record_correction("play it", "play_video", &Entities::new());
        assert_eq!(memory.get_correction_for("play it").unwrap().intent, "play_video");
        assert!(memory.get_correction_for("never seen").is_none());
    }

    #[test]
    fn test_health_threshold() {
        let memory = AdaptiveMemory::default();
        assert!(memory.get_skill_health("flaky").is_healthy);
        for i in 0..3 {
            memory.record_failure("do it", "flaky", &format!("error {}", i));
        }
        let health = memory.get_skill_health("flaky");
        assert!(!health.is_healthy);
        assert_eq!(health.total_failures, 3);
        assert_eq!(health.recent_errors.len(), 3);
    }

    #[test]
    fn test_health_window_forgets_old_failures() {
        let config = LearningConfig {
            health_window_secs: Some(60),
            ..LearningConfig::default()
        };
        let memory = AdaptiveMemory::new(&config);
        {
            let mut state = memory.lock();
            let entry = state.failures.entry("flaky".to_string()).or_default();
            let old = Utc::now().timestamp_millis() - 120_000;
            entry.total_failures = 5;
            entry.failure_times_ms.extend([old, old, old, old, old]);
        }
        let health = memory.get_skill_health("flaky");
        assert_eq!(health.total_failures, 5);
        assert_eq!(health.counted_failures, 0);
        assert!(health.is_healthy);
    }

    #[test]
    fn test_success_patterns() {
        let memory = AdaptiveMemory::default();
        let ents = entities([("city", "Madrid")]);
        memory.record_success("weather in madrid", "get_weather", &ents, &serde_json::json!("sunny"));
        memory.record_success("weather in madrid", "get_weather", &ents, &serde_json::json!("rain"));
        let pattern = memory.get_success_pattern("get_weather", &ents).unwrap();
        assert_eq!(pattern.count, 2);
        assert_eq!(pattern.last_result, serde_json::json!("rain"));
        assert!(memory.get_success_pattern("get_weather", &Entities::new()).is_none());
    }

    #[test]
    fn test_export_import_reproduces_corrections() {
        let memory = AdaptiveMemory::default();
        let ents = entities([("app", "obsidian")]);
        memory.record_correction("abre obsidian", "open_app", &ents);
        memory.record_correction("abre obsidian", "open_app", &ents);
        memory.record_failure("x", "broken", "boom");

        let fresh = AdaptiveMemory::default();
        fresh.import_learning(memory.export_learning()).unwrap();
        assert_eq!(
            fresh.get_correction_for("abre obsidian"),
            memory.get_correction_for("abre obsidian")
        );

        // A second import updates in place.
        fresh.import_learning(memory.export_learning()).unwrap();
        assert_eq!(fresh.stats().correction_entries, 1);
        assert_eq!(fresh.stats().total_failures, 1);
    }

    #[test]
    fn test_rejects_unknown_snapshot_version() {
        let memory = AdaptiveMemory::default();
        let snapshot = LearningSnapshot {
            version: 7,
            ..LearningSnapshot::default()
        };
        assert!(matches!(memory.import_learning(snapshot), Err(Error::Storage(_))));
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("learning.json");
        let memory = AdaptiveMemory::default();
        memory.record_correction("hora", "get_time", &Entities::new());
        memory.save(&path).unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["version"], 1);

        let restored = AdaptiveMemory::default();
        restored.load(&path).unwrap();
        assert_eq!(restored.get_correction_for("hora").unwrap().intent, "get_time");
    }
}

use conductor_core::config::DispatcherConfig;
use conductor_core::{Entities, Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::skill::{Skill, SkillContext, SkillMeta, SkillOutcome};

/// One dispatcher call, successful or not.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchRecord {
    pub intent: String,
    pub success: bool,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub at_ms: i64,
}

/// Aggregated numbers for a single skill.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkillPerformance {
    pub calls: u64,
    pub failures: u64,
    pub total_duration_ms: u64,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub last_called_at_ms: Option<i64>,
}

impl SkillPerformance {
    pub fn success_rate(&self) -> f64 {
        if self.calls == 0 {
            return 0.0;
        }
        (self.calls - self.failures) as f64 / self.calls as f64
    }

    pub fn avg_duration_ms(&self) -> f64 {
        if self.calls == 0 {
            return 0.0;
        }
        self.total_duration_ms as f64 / self.calls as f64
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionStats {
    pub total_calls: u64,
    pub total_failures: u64,
    pub success_rate: f64,
    pub skills: BTreeMap<String, SkillPerformance>,
}

#[derive(Default)]
struct StatsState {
    total_calls: u64,
    total_failures: u64,
    per_skill: HashMap<String, SkillPerformance>,
    recent: VecDeque<DispatchRecord>,
}

/// Maps intents to skills and runs them with uniform error capture.
///
/// Every call returns a [`SkillOutcome`]; failures (unknown intent, missing
/// requirement, mode restriction, error, panic, timeout) never escape as `Err`.
pub struct SkillDispatcher {
    skills: RwLock<HashMap<String, Arc<dyn Skill>>>,
    stats: Mutex<StatsState>,
    check_dependencies: bool,
    timeout: Option<Duration>,
    record_history: usize,
}

impl Default for SkillDispatcher {
    fn default() -> Self {
        Self::new(&DispatcherConfig::default())
    }
}

impl SkillDispatcher {
    pub fn new(config: &DispatcherConfig) -> Self {
        Self {
            skills: RwLock::new(HashMap::new()),
            stats: Mutex::new(StatsState::default()),
            check_dependencies: config.check_dependencies,
            timeout: config.skill_timeout_ms.map(Duration::from_millis),
            record_history: config.record_history.max(1),
        }
    }

    /// Register a skill under its meta name, replacing any previous one.
    pub fn register(&self, skill: Arc<dyn Skill>) -> Result<()> {
        let name = skill.meta().name;
        if name.trim().is_empty() {
            return Err(Error::Config("skill name must not be empty".to_string()));
        }
        let mut skills = self.skills.write().unwrap_or_else(|e| e.into_inner());
        if skills.insert(name.clone(), skill).is_some() {
            warn!(skill = %name, "Replacing previously registered skill");
        } else {
            debug!(skill = %name, "Skill registered");
        }
        Ok(())
    }

    pub fn unregister(&self, name: &str) -> bool {
        let mut skills = self.skills.write().unwrap_or_else(|e| e.into_inner());
        skills.remove(name).is_some()
    }

    pub fn has_skill(&self, name: &str) -> bool {
        let skills = self.skills.read().unwrap_or_else(|e| e.into_inner());
        skills.contains_key(name)
    }

    fn get(&self, name: &str) -> Option<Arc<dyn Skill>> {
        let skills = self.skills.read().unwrap_or_else(|e| e.into_inner());
        skills.get(name).cloned()
    }

    /// Metadata of every registered skill, sorted by name.
    pub fn list_skills(&self) -> Vec<SkillMeta> {
        let skills = self.skills.read().unwrap_or_else(|e| e.into_inner());
        let mut metas: Vec<SkillMeta> = skills.values().map(|s| s.meta()).collect();
        metas.sort_by(|a, b| a.name.cmp(&b.name));
        metas
    }

    /// Verify a skill's declared binaries, environment variables and peer skills.
    pub fn check_dependencies(&self, name: &str) -> Result<()> {
        let skill = self
            .get(name)
            .ok_or_else(|| Error::SkillNotFound(name.to_string()))?;
        self.check_requirements(&skill.meta())
    }

    fn check_requirements(&self, meta: &SkillMeta) -> Result<()> {
        for bin in &meta.requires.bins {
            if which::which(bin).is_err() {
                return Err(Error::SkillExecution(format!("Missing binary: {}", bin)));
            }
        }
        for var in &meta.requires.env {
            if std::env::var(var).is_err() {
                return Err(Error::SkillExecution(format!("Missing env var: {}", var)));
            }
        }
        for peer in &meta.requires.skills {
            if !self.has_skill(peer) {
                return Err(Error::SkillExecution(format!("Missing skill: {}", peer)));
            }
        }
        Ok(())
    }

    pub async fn dispatch(
        &self,
        intent: &str,
        entities: &Entities,
        ctx: &SkillContext,
    ) -> SkillOutcome {
        self.dispatch_with_record(intent, entities, ctx).await.0
    }

    /// Dispatch and also return the record that was stored for the call.
    pub async fn dispatch_with_record(
        &self,
        intent: &str,
        entities: &Entities,
        ctx: &SkillContext,
    ) -> (SkillOutcome, DispatchRecord) {
        let started = Instant::now();
        let outcome = self.invoke(intent, entities, ctx).await;
        let record = DispatchRecord {
            intent: intent.to_string(),
            success: outcome.success,
            duration_ms: started.elapsed().as_millis() as u64,
            error: outcome.error.clone(),
            at_ms: chrono::Utc::now().timestamp_millis(),
        };
        self.record(&record);
        (outcome, record)
    }

    async fn invoke(&self, intent: &str, entities: &Entities, ctx: &SkillContext) -> SkillOutcome {
        let Some(skill) = self.get(intent) else {
            debug!(intent = %intent, "No skill registered for intent");
            return SkillOutcome::failed(Error::SkillNotFound(intent.to_string()).to_string());
        };
        let meta = skill.meta();

        if self.check_dependencies {
            if let Err(e) = self.check_requirements(&meta) {
                warn!(skill = %intent, error = %e, "Skill requirements not met");
                return SkillOutcome::failed(e.to_string());
            }
        }

        if !meta.allows_mode(ctx.mode) {
            info!(skill = %intent, mode = %ctx.mode, "Skill not permitted in current mode");
            return SkillOutcome::failed(format!(
                "Skill '{}' is not permitted in {} mode",
                intent, ctx.mode
            ));
        }

        // Run on its own task so a panicking skill surfaces as a JoinError.
        let entities = entities.clone();
        let task_ctx = ctx.clone();
        let task = tokio::spawn(async move { skill.run(&entities, &task_ctx).await });
        let abort = task.abort_handle();

        let joined = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, task).await {
                Ok(joined) => joined,
                Err(_) => {
                    abort.abort();
                    warn!(skill = %intent, timeout_ms = limit.as_millis() as u64, "Skill timed out");
                    return SkillOutcome::failed(
                        Error::Timeout(format!("skill '{}' exceeded {:?}", intent, limit)).to_string(),
                    );
                }
            },
            None => task.await,
        };

        match joined {
            Ok(Ok(mut outcome)) => {
                if !outcome.success && outcome.error.is_none() {
                    outcome.error = Some(format!("Skill '{}' reported failure", intent));
                }
                outcome
            }
            Ok(Err(e)) => {
                warn!(skill = %intent, error = %e, "Skill returned an error");
                SkillOutcome::failed(e.to_string())
            }
            Err(e) if e.is_panic() => {
                warn!(skill = %intent, "Skill panicked");
                SkillOutcome::failed(format!("Skill '{}' panicked", intent))
            }
            Err(e) => SkillOutcome::failed(format!("Skill '{}' was cancelled: {}", intent, e)),
        }
    }

    fn record(&self, record: &DispatchRecord) {
        let known = self.has_skill(&record.intent);
        let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        stats.total_calls += 1;
        if !record.success {
            stats.total_failures += 1;
        }
        if known {
            let perf = stats.per_skill.entry(record.intent.clone()).or_default();
            perf.calls += 1;
            perf.total_duration_ms += record.duration_ms;
            perf.last_called_at_ms = Some(record.at_ms);
            if !record.success {
                perf.failures += 1;
                perf.last_error = record.error.clone();
            }
        }
        stats.recent.push_back(record.clone());
        while stats.recent.len() > self.record_history {
            stats.recent.pop_front();
        }
    }

    pub fn get_skill_performance(&self, name: &str) -> Option<SkillPerformance> {
        let stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        stats.per_skill.get(name).cloned()
    }

    pub fn get_execution_stats(&self) -> ExecutionStats {
        let stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        let success_rate = if stats.total_calls == 0 {
            0.0
        } else {
            (stats.total_calls - stats.total_failures) as f64 / stats.total_calls as f64
        };
        ExecutionStats {
            total_calls: stats.total_calls,
            total_failures: stats.total_failures,
            success_rate,
            skills: stats
                .per_skill
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    /// Most recent records, newest last.
    pub fn recent_records(&self, limit: usize) -> Vec<DispatchRecord> {
        let stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        let skip = stats.recent.len().saturating_sub(limit);
        stats.recent.iter().skip(skip).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::skill::FnSkill;
    use async_trait::async_trait;
    use conductor_core::{entities, Mode};
    use serde_json::json;

    fn time_skill() -> Arc<dyn Skill> {
        Arc::new(FnSkill::new(
            SkillMeta::new("get_time", "Current time"),
            |_entities, _ctx| Ok(SkillOutcome::ok(json!({"time": "12:00"}))),
        ))
    }

    fn failing_skill(name: &str) -> Arc<dyn Skill> {
        Arc::new(FnSkill::new(SkillMeta::new(name, ""), |_entities, _ctx| {
            Err(Error::SkillExecution("boom".to_string()))
        }))
    }

    struct SlowSkill;

    #[async_trait]
    impl Skill for SlowSkill {
        fn meta(&self) -> SkillMeta {
            SkillMeta::new("slow", "")
        }

        async fn run(&self, _entities: &Entities, _ctx: &SkillContext) -> Result<SkillOutcome> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(SkillOutcome::ok(json!(null)))
        }
    }

    struct PanickingSkill;

    #[async_trait]
    impl Skill for PanickingSkill {
        fn meta(&self) -> SkillMeta {
            SkillMeta::new("explode", "")
        }

        async fn run(&self, _entities: &Entities, _ctx: &SkillContext) -> Result<SkillOutcome> {
            panic!("skill exploded");
        }
    }

    #[tokio::test]
    async fn test_dispatch_registered_skill() {
        let dispatcher = SkillDispatcher::default();
        dispatcher.register(time_skill()).unwrap();

        let outcome = dispatcher
            .dispatch("get_time", &Entities::new(), &SkillContext::default())
            .await;
        assert!(outcome.success);
        assert_eq!(outcome.result, Some(json!({"time": "12:00"})));

        let perf = dispatcher.get_skill_performance("get_time").unwrap();
        assert_eq!(perf.calls, 1);
        assert_eq!(perf.failures, 0);
    }

    #[tokio::test]
    async fn test_unknown_intent_fails_without_error() {
        let dispatcher = SkillDispatcher::default();
        let outcome = dispatcher
            .dispatch("nonexistent", &Entities::new(), &SkillContext::default())
            .await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("nonexistent"));

        let stats = dispatcher.get_execution_stats();
        assert_eq!(stats.total_calls, 1);
        assert_eq!(stats.total_failures, 1);
        assert!(stats.skills.is_empty());
    }

    #[tokio::test]
    async fn test_failing_skill_is_captured() {
        let dispatcher = SkillDispatcher::default();
        dispatcher.register(failing_skill("bad")).unwrap();

        let (outcome, record) = dispatcher
            .dispatch_with_record("bad", &Entities::new(), &SkillContext::default())
            .await;
        assert!(!outcome.success);
        assert!(outcome.error.as_deref().unwrap().contains("boom"));
        assert!(!record.success);
        assert_eq!(record.intent, "bad");

        let perf = dispatcher.get_skill_performance("bad").unwrap();
        assert_eq!(perf.failures, 1);
        assert_eq!(perf.success_rate(), 0.0);
    }

    #[tokio::test]
    async fn test_panicking_skill_is_captured() {
        let dispatcher = SkillDispatcher::default();
        dispatcher.register(Arc::new(PanickingSkill)).unwrap();

        let outcome = dispatcher
            .dispatch("explode", &Entities::new(), &SkillContext::default())
            .await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("panicked"));
    }

    #[tokio::test]
    async fn test_timeout_fails_call() {
        let config = DispatcherConfig {
            skill_timeout_ms: Some(20),
            ..DispatcherConfig::default()
        };
        let dispatcher = SkillDispatcher::new(&config);
        dispatcher.register(Arc::new(SlowSkill)).unwrap();

        let outcome = dispatcher
            .dispatch("slow", &Entities::new(), &SkillContext::default())
            .await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("Timeout"));
    }

    #[tokio::test]
    async fn test_mode_restriction() {
        let dispatcher = SkillDispatcher::default();
        dispatcher
            .register(Arc::new(FnSkill::new(
                SkillMeta::new("delete_file", "").with_modes(&[Mode::Active]),
                |_e, _c| Ok(SkillOutcome::ok(json!("deleted"))),
            )))
            .unwrap();

        let safe = dispatcher
            .dispatch("delete_file", &Entities::new(), &SkillContext::new(Mode::Safe))
            .await;
        assert!(!safe.success);
        assert!(safe.error.unwrap().contains("SAFE"));

        let active = dispatcher
            .dispatch("delete_file", &Entities::new(), &SkillContext::new(Mode::Active))
            .await;
        assert!(active.success);
    }

    #[tokio::test]
    async fn test_missing_requirements_block_dispatch() {
        let dispatcher = SkillDispatcher::default();
        dispatcher
            .register(Arc::new(FnSkill::new(
                SkillMeta::new("needs_env", "").with_env(&["CONDUCTOR_TEST_VAR_THAT_IS_NEVER_SET"]),
                |_e, _c| Ok(SkillOutcome::ok(json!(true))),
            )))
            .unwrap();
        dispatcher
            .register(Arc::new(FnSkill::new(
                SkillMeta::new("needs_peer", "").with_skills(&["absent_skill"]),
                |_e, _c| Ok(SkillOutcome::ok(json!(true))),
            )))
            .unwrap();

        let outcome = dispatcher
            .dispatch("needs_env", &Entities::new(), &SkillContext::default())
            .await;
        assert!(outcome.error.unwrap().contains("Missing env var"));

        let err = dispatcher.check_dependencies("needs_peer").unwrap_err();
        assert!(err.to_string().contains("absent_skill"));
        assert!(matches!(
            dispatcher.check_dependencies("ghost"),
            Err(Error::SkillNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_entities_reach_the_skill() {
        let dispatcher = SkillDispatcher::default();
        dispatcher
            .register(Arc::new(FnSkill::new(SkillMeta::new("open_app", ""), |e, ctx| {
                let app = e.get("app").and_then(|v| v.as_str()).unwrap_or_default();
                Ok(SkillOutcome::ok(json!({"opened": app, "mode": ctx.mode})))
            })))
            .unwrap();

        let outcome = dispatcher
            .dispatch(
                "open_app",
                &entities([("app", "obsidian")]),
                &SkillContext::new(Mode::Passive),
            )
            .await;
        assert_eq!(outcome.result, Some(json!({"opened": "obsidian", "mode": "PASSIVE"})));
    }

    #[test]
    fn test_register_and_list() {
        let dispatcher = SkillDispatcher::default();
        dispatcher.register(failing_skill("zeta")).unwrap();
        dispatcher.register(time_skill()).unwrap();
        let names: Vec<String> = dispatcher.list_skills().into_iter().map(|m| m.name).collect();
        assert_eq!(names, vec!["get_time", "zeta"]);

        assert!(dispatcher.unregister("zeta"));
        assert!(!dispatcher.unregister("zeta"));
        assert!(dispatcher.register(failing_skill(" ")).is_err());
    }

    #[tokio::test]
    async fn test_recent_records_are_bounded() {
        let config = DispatcherConfig {
            record_history: 2,
            ..DispatcherConfig::default()
        };
        let dispatcher = SkillDispatcher::new(&config);
        for intent in ["a", "b", "c"] {
            dispatcher
                .dispatch(intent, &Entities::new(), &SkillContext::default())
                .await;
        }
        let recent = dispatcher.recent_records(10);
        let intents: Vec<&str> = recent.iter().map(|r| r.intent.as_str()).collect();
        assert_eq!(intents, vec!["b", "c"]);
    }
}

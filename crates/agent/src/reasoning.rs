use conductor_core::config::ReasoningConfig;
use conductor_core::{Entities, EntityValue, Error, Mode, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, warn};

static INTENT_SHAPE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z][a-z0-9_]*$").expect("intent shape regex is valid"));

/// Outcome of a single rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub passed: bool,
    pub reason: String,
}

impl Verdict {
    pub fn pass(reason: impl Into<String>) -> Self {
        Self {
            passed: true,
            reason: reason.into(),
        }
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        Self {
            passed: false,
            reason: reason.into(),
        }
    }
}

/// What the rules see besides intent and entities.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReasoningContext {
    /// Prior confidence of the candidate intent, scaled by the rule pass ratio.
    pub confidence: f64,
    #[serde(default)]
    pub mode: Mode,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub values: serde_json::Map<String, serde_json::Value>,
}

impl Default for ReasoningContext {
    fn default() -> Self {
        Self {
            confidence: 1.0,
            mode: Mode::default(),
            session_id: None,
            text: String::new(),
            values: serde_json::Map::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReasoningResult {
    pub intent: String,
    pub entities: Entities,
    pub valid: bool,
    pub confidence: f64,
    /// Failed global rules and rule errors.
    pub warnings: Vec<String>,
    /// `rule: reason` for every rule that produced a verdict.
    pub reasons: Vec<String>,
    /// Reasons of the intent rules that rejected the request.
    pub rejections: Vec<String>,
    pub at_ms: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReasoningStats {
    pub total: usize,
    pub valid_count: usize,
    pub validity_rate: f64,
    pub average_confidence: f64,
}

type GlobalRuleFn = dyn Fn(&str, &Entities, &ReasoningContext) -> Result<Verdict> + Send + Sync;
type SkillRuleFn = dyn Fn(&ReasoningContext, &Entities) -> Result<Verdict> + Send + Sync;

struct Rules {
    global: Vec<(String, Arc<GlobalRuleFn>)>,
    per_intent: HashMap<String, Vec<(String, Arc<SkillRuleFn>)>>,
}

/// Validates a candidate intent against registered rules and scores it.
pub struct ReasoningEngine {
    rules: RwLock<Rules>,
    history: Mutex<VecDeque<ReasoningResult>>,
    history_limit: usize,
}

impl Default for ReasoningEngine {
    fn default() -> Self {
        Self::new(&ReasoningConfig::default())
    }
}

impl ReasoningEngine {
    /// Engine with the built-in global rules installed when the config asks for them.
    pub fn new(config: &ReasoningConfig) -> Self {
        let engine = Self {
            rules: RwLock::new(Rules {
                global: Vec::new(),
                per_intent: HashMap::new(),
            }),
            history: Mutex::new(VecDeque::new()),
            history_limit: config.history_limit.max(1),
        };
        if config.default_rules {
            engine.install_default_rules();
        }
        engine
    }

    pub fn with_default_rules() -> Self {
        Self::new(&ReasoningConfig {
            default_rules: true,
            ..ReasoningConfig::default()
        })
    }

    fn install_default_rules(&self) {
        self.register_global_rule("intent_shape", |intent, _entities, _ctx| {
            if INTENT_SHAPE.is_match(intent) {
                Ok(Verdict::pass("intent is a valid identifier"))
            } else {
                Ok(Verdict::fail(format!("intent '{}' is not a snake_case identifier", intent)))
            }
        });
        self.register_global_rule("entities_not_blank", |_intent, entities, _ctx| {
            let blank: Vec<&str> = entities
                .iter()
                .filter(|(_, v)| matches!(v, EntityValue::Text(t) if t.trim().is_empty()))
                .map(|(k, _)| k.as_str())
                .collect();
            if blank.is_empty() {
                Ok(Verdict::pass("entities are filled"))
            } else {
                Ok(Verdict::fail(format!("blank entities: {}", blank.join(", "))))
            }
        });
    }

    /// Rule run for every intent. A failing global rule only adds a warning.
    pub fn register_global_rule<F>(&self, name: &str, rule: F)
    where
        F: Fn(&str, &Entities, &ReasoningContext) -> Result<Verdict> + Send + Sync + 'static,
    {
        let mut rules = self.rules.write().unwrap_or_else(|e| e.into_inner());
        rules.global.push((name.to_string(), Arc::new(rule)));
    }

    /// Rule run for one intent. A failing intent rule invalidates the result.
    pub fn register_skill_rule<F>(&self, intent: &str, name: &str, rule: F)
    where
        F: Fn(&ReasoningContext, &Entities) -> Result<Verdict> + Send + Sync + 'static,
    {
        let mut rules = self.rules.write().unwrap_or_else(|e| e.into_inner());
        rules
            .per_intent
            .entry(intent.to_string())
            .or_default()
            .push((name.to_string(), Arc::new(rule)));
    }

    pub fn reason(&self, intent: &str, entities: &Entities, ctx: &ReasoningContext) -> ReasoningResult {
        let (global, per_intent) = {
            let rules = self.rules.read().unwrap_or_else(|e| e.into_inner());
            (
                rules.global.clone(),
                rules.per_intent.get(intent).cloned().unwrap_or_default(),
            )
        };

        let mut result = ReasoningResult {
            intent: intent.to_string(),
            entities: entities.clone(),
            valid: true,
            confidence: 0.0,
            warnings: Vec::new(),
            reasons: Vec::new(),
            rejections: Vec::new(),
            at_ms: chrono::Utc::now().timestamp_millis(),
        };
        let mut evaluated = 0usize;
        let mut passed = 0usize;

        for (name, rule) in &global {
            evaluated += 1;
            match run_rule(name, || rule(intent, entities, ctx)) {
                Ok(verdict) => {
                    result.reasons.push(format!("{}: {}", name, verdict.reason));
                    if verdict.passed {
                        passed += 1;
                    } else {
                        result.warnings.push(verdict.reason);
                    }
                }
                Err(e) => result.warnings.push(e.to_string()),
            }
        }

        for (name, rule) in &per_intent {
            evaluated += 1;
            match run_rule(name, || rule(ctx, entities)) {
                Ok(verdict) => {
                    result.reasons.push(format!("{}: {}", name, verdict.reason));
                    if verdict.passed {
                        passed += 1;
                    } else {
                        result.valid = false;
                        result.rejections.push(verdict.reason);
                    }
                }
                Err(e) => result.warnings.push(e.to_string()),
            }
        }

        let prior = ctx.confidence.clamp(0.0, 1.0);
        result.confidence = if evaluated == 0 {
            prior
        } else {
            (prior * passed as f64 / evaluated as f64).clamp(0.0, 1.0)
        };

        debug!(
            intent = %intent,
            valid = result.valid,
            confidence = result.confidence,
            rules = evaluated,
            "Reasoning complete"
        );

        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history.push_back(result.clone());
        while history.len() > self.history_limit {
            history.pop_front();
        }
        result
    }

    /// Recent results, oldest first.
    pub fn history(&self) -> Vec<ReasoningResult> {
        let history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history.iter().cloned().collect()
    }

    pub fn stats(&self) -> ReasoningStats {
        let history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        let total = history.len();
        if total == 0 {
            return ReasoningStats::default();
        }
        let valid_count = history.iter().filter(|r| r.valid).count();
        let confidence_sum: f64 = history.iter().map(|r| r.confidence).sum();
        ReasoningStats {
            total,
            valid_count,
            validity_rate: valid_count as f64 / total as f64,
            average_confidence: confidence_sum / total as f64,
        }
    }
}

/// Run a rule, turning errors and panics into `Error::ReasoningRule`.
fn run_rule<F>(name: &str, rule: F) -> Result<Verdict>
where
    F: FnOnce() -> Result<Verdict>,
{
    match catch_unwind(AssertUnwindSafe(rule)) {
        Ok(Ok(verdict)) => Ok(verdict),
        Ok(Err(e)) => {
            warn!(rule = %name, error = %e, "Rule returned an error");
            Err(Error::ReasoningRule(format!("{}: {}", name, e)))
        }
        Err(_) => {
            warn!(rule = %name, "Rule panicked");
            Err(Error::ReasoningRule(format!("{} panicked", name)))
        }
    }
}

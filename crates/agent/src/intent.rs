use conductor_core::{normalize_text, Entities, EntityValue, Error, Result};
use conductor_skills::SkillMeta;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::RwLock;

const PATTERN_CONFIDENCE: f64 = 0.9;
const KEYWORD_CONFIDENCE: f64 = 0.6;
const TRIGGER_PRIORITY: u8 = 5;

/// A candidate meaning for an utterance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedIntent {
    pub intent: String,
    pub entities: Entities,
    pub confidence: f64,
}

/// Turns normalized text into a candidate intent. `None` means no candidate.
pub trait IntentParser: Send + Sync {
    fn parse(&self, text: &str) -> Option<ParsedIntent>;
}

/// One keyword/regex rule. Named capture groups become entities.
#[derive(Debug, Clone)]
pub struct IntentRule {
    intent: String,
    keywords: Vec<String>,
    patterns: Vec<Regex>,
    negative: Vec<String>,
    priority: u8,
}

impl IntentRule {
    pub fn new(intent: &str, priority: u8) -> Self {
        Self {
            intent: intent.to_string(),
            keywords: Vec::new(),
            patterns: Vec::new(),
            negative: Vec::new(),
            priority,
        }
    }

    pub fn with_keywords(mut self, keywords: &[&str]) -> Self {
        self.keywords
            .extend(keywords.iter().map(|k| normalize_text(k)).filter(|k| !k.is_empty()));
        self
    }

    pub fn with_pattern(mut self, pattern: &str) -> Result<Self> {
        let regex = Regex::new(pattern)
            .map_err(|e| Error::Config(format!("invalid intent pattern '{}': {}", pattern, e)))?;
        self.patterns.push(regex);
        Ok(self)
    }

    /// Keywords that veto this rule when present.
    pub fn with_negative(mut self, words: &[&str]) -> Self {
        self.negative.extend(words.iter().map(|w| normalize_text(w)));
        self
    }

    pub fn intent(&self) -> &str {
        &self.intent
    }

    fn matches(&self, text: &str) -> Option<(Entities, f64)> {
        if self.negative.iter().any(|n| text.contains(n.as_str())) {
            return None;
        }
        for pattern in &self.patterns {
            if let Some(caps) = pattern.captures(text) {
                let entities = pattern
                    .capture_names()
                    .flatten()
                    .filter_map(|name| {
                        let value = caps.name(name)?.as_str().trim();
                        (!value.is_empty()).then(|| (name.to_string(), capture_value(value)))
                    })
                    .collect();
                return Some((entities, PATTERN_CONFIDENCE));
            }
        }
        if self.keywords.iter().any(|k| text.contains(k.as_str())) {
            return Some((Entities::new(), KEYWORD_CONFIDENCE));
        }
        None
    }
}

fn capture_value(value: &str) -> EntityValue {
    match value.parse::<f64>() {
        Ok(n) if n.is_finite() => EntityValue::Number(n),
        _ => EntityValue::Text(value.to_string()),
    }
}

/// Rule table parser: highest priority match wins, pattern matches beat keyword matches.
#[derive(Default)]
pub struct RuleIntentParser {
    rules: RwLock<Vec<IntentRule>>,
}

impl RuleIntentParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parser preloaded with rules for common assistant requests.
    pub fn with_defaults() -> Result<Self> {
        let parser = Self::new();
        parser.add_rule(
            IntentRule::new("get_time", 8)
                .with_keywords(&["what time", "qué hora", "que hora", "current time"]),
        );
        parser.add_rule(
            IntentRule::new("get_date", 8)
                .with_keywords(&["what day", "today's date", "qué día", "que dia", "fecha"]),
        );
        parser.add_rule(
            IntentRule::new("open_app", 7)
                .with_pattern(r"^(?:open|launch|start|abre|abrir|inicia)\s+(?P<app>[\w .+-]+)$")?
                .with_negative(&["file", "archivo"]),
        );
        parser.add_rule(
            IntentRule::new("set_mode", 9).with_pattern(
                r"(?:switch|change|set|cambia)\s+(?:to\s+|a\s+)?(?:modo\s+)?(?P<mode>safe|passive|active|analysis)(?:\s+mode)?",
            )?,
        );
        Ok(parser)
    }

    pub fn add_rule(&self, rule: IntentRule) {
        let mut rules = self.rules.write().unwrap_or_else(|e| e.into_inner());
        rules.push(rule);
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));
    }

    /// Register a skill's trigger phrases as keywords for its intent.
    pub fn add_skill_triggers(&self, meta: &SkillMeta) {
        if meta.triggers.is_empty() {
            return;
        }
        let triggers: Vec<&str> = meta.triggers.iter().map(String::as_str).collect();
        self.add_rule(IntentRule::new(&meta.name, TRIGGER_PRIORITY).with_keywords(&triggers));
    }

    pub fn remove_rules_for(&self, intent: &str) -> usize {
        let mut rules = self.rules.write().unwrap_or_else(|e| e.into_inner());
        let before = rules.len();
        rules.retain(|r| r.intent != intent);
        before - rules.len()
    }

    pub fn rule_count(&self) -> usize {
        self.rules.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl IntentParser for RuleIntentParser {
    fn parse(&self, text: &str) -> Option<ParsedIntent> {
        let text = normalize_text(text);
        if text.is_empty() {
            return None;
        }
        let rules = self.rules.read().unwrap_or_else(|e| e.into_inner());
        let mut best: Option<(u8, ParsedIntent)> = None;
        for rule in rules.iter() {
            if best.as_ref().is_some_and(|(p, _)| *p > rule.priority) {
                break;
            }
            if let Some((entities, confidence)) = rule.matches(&text) {
                let better = best
                    .as_ref()
                    .map_or(true, |(_, current)| confidence > current.confidence);
                if better {
                    best = Some((
                        rule.priority,
                        ParsedIntent {
                            intent: rule.intent.clone(),
                            entities,
                            confidence,
                        },
                    ));
                }
            }
        }
        best.map(|(_, parsed)| parsed)
    }
}

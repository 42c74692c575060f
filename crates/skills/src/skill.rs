use async_trait::async_trait;
use conductor_core::{Entities, Mode, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SkillMeta {
    /// Intent this skill handles.
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub requires: SkillRequires,
    /// Modes the skill may run in. Empty = every mode.
    #[serde(default)]
    pub allowed_modes: Vec<Mode>,
    /// Trigger phrases that map user input to this skill's intent.
    #[serde(default)]
    pub triggers: Vec<String>,
}

impl SkillMeta {
    pub fn new(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            ..Self::default()
        }
    }

    pub fn with_bins(mut self, bins: &[&str]) -> Self {
        self.requires.bins.extend(bins.iter().map(|b| b.to_string()));
        self
    }

    pub fn with_env(mut self, vars: &[&str]) -> Self {
        self.requires.env.extend(vars.iter().map(|v| v.to_string()));
        self
    }

    pub fn with_skills(mut self, skills: &[&str]) -> Self {
        self.requires.skills.extend(skills.iter().map(|s| s.to_string()));
        self
    }

    pub fn with_modes(mut self, modes: &[Mode]) -> Self {
        self.allowed_modes.extend_from_slice(modes);
        self
    }

    pub fn with_triggers(mut self, triggers: &[&str]) -> Self {
        self.triggers.extend(triggers.iter().map(|t| t.to_string()));
        self
    }

    pub fn allows_mode(&self, mode: Mode) -> bool {
        self.allowed_modes.is_empty() || self.allowed_modes.contains(&mode)
    }
}

/// Requirements checked before each dispatch.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SkillRequires {
    /// Executables that must be on `PATH`.
    #[serde(default)]
    pub bins: Vec<String>,
    /// Environment variables that must be set.
    #[serde(default)]
    pub env: Vec<String>,
    /// Other skills that must be registered.
    #[serde(default)]
    pub skills: Vec<String>,
}

impl SkillRequires {
    pub fn is_empty(&self) -> bool {
        self.bins.is_empty() && self.env.is_empty() && self.skills.is_empty()
    }
}

/// Execution context handed to a skill.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkillContext {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub mode: Mode,
    /// Normalized utterance that produced the intent.
    #[serde(default)]
    pub text: String,
    /// Session context values.
    #[serde(default)]
    pub values: Map<String, Value>,
}

impl SkillContext {
    pub fn new(mode: Mode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }
}

/// What a skill reports back: `{success, result?, error?}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkillOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SkillOutcome {
    pub fn ok(result: Value) -> Self {
        Self {
            success: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error.into()),
        }
    }
}

/// A registered capability handling exactly one intent.
#[async_trait]
pub trait Skill: Send + Sync {
    fn meta(&self) -> SkillMeta;
    async fn run(&self, entities: &Entities, ctx: &SkillContext) -> Result<SkillOutcome>;
}

type SkillFn = dyn Fn(&Entities, &SkillContext) -> Result<SkillOutcome> + Send + Sync;

/// Adapter turning a plain closure into a [`Skill`].
pub struct FnSkill {
    meta: SkillMeta,
    handler: Box<SkillFn>,
}

impl FnSkill {
    pub fn new<F>(meta: SkillMeta, handler: F) -> Self
    where
        F: Fn(&Entities, &SkillContext) -> Result<SkillOutcome> + Send + Sync + 'static,
    {
        Self {
            meta,
            handler: Box::new(handler),
        }
    }
}

#[async_trait]
impl Skill for FnSkill {
    fn meta(&self) -> SkillMeta {
        self.meta.clone()
    }

    async fn run(&self, entities: &Entities, ctx: &SkillContext) -> Result<SkillOutcome> {
        (self.handler)(entities, ctx)
    }
}

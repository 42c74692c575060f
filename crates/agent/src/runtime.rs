use async_trait::async_trait;
use conductor_core::message::{INPUT_EVENT, MODE_CHANGED_EVENT, RESPONSE_EVENT};
use conductor_core::{normalize_text, Config, Entities, Error, Event, Mode, Paths, Result};
use conductor_scheduler::Scheduler;
use conductor_skills::{
    ExecutionStats, Skill, SkillContext, SkillDispatcher, SkillMeta, SkillOutcome,
};
use conductor_storage::{
    AdaptiveMemory, AuditLogger, ConversationStore, InMemoryConversationStore, LearningStats,
    SqliteConversationStore,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::bus::{BusStats, EventBus, EventHandler};
use crate::intent::{IntentParser, RuleIntentParser};
use crate::reasoning::{ReasoningContext, ReasoningEngine, ReasoningStats};
use crate::session::SessionController;

pub const UNKNOWN_INTENT: &str = "unknown";
const SET_MODE_INTENT: &str = "set_mode";
const DEFAULT_SOURCE: &str = "api";

/// What Core answers for one utterance. Also published as a `response` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub text: String,
    pub intent: String,
    pub entities: Entities,
    pub success: bool,
    pub session_id: String,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoreStats {
    pub bus: BusStats,
    pub dispatch: ExecutionStats,
    pub reasoning: ReasoningStats,
    pub learning: LearningStats,
    pub active_sessions: usize,
    pub scheduled_jobs: usize,
}

pub struct CoreBuilder {
    config: Config,
    paths: Paths,
    parser: Option<Arc<dyn IntentParser>>,
    conversations: Option<Arc<dyn ConversationStore>>,
}

impl CoreBuilder {
    pub fn paths(mut self, paths: Paths) -> Self {
        self.paths = paths;
        self
    }

    /// Replace the built-in rule parser. Skill triggers are then not registered.
    pub fn parser(mut self, parser: Arc<dyn IntentParser>) -> Self {
        self.parser = Some(parser);
        self
    }

    pub fn conversation_store(mut self, store: Arc<dyn ConversationStore>) -> Self {
        self.conversations = Some(store);
        self
    }

    pub fn build(self) -> Result<Arc<Core>> {
        let CoreBuilder {
            config,
            paths,
            parser,
            conversations,
        } = self;
        config.validate()?;

        let (parser, rule_parser): (Arc<dyn IntentParser>, Option<Arc<RuleIntentParser>>) =
            match parser {
                Some(custom) => (custom, None),
                None => {
                    let rules = Arc::new(RuleIntentParser::with_defaults()?);
                    let parser: Arc<dyn IntentParser> = rules.clone();
                    (parser, Some(rules))
                }
            };

        let conversations: Arc<dyn ConversationStore> = match conversations {
            Some(store) => store,
            None => match config.conversation_db_path() {
                Some(path) => Arc::new(SqliteConversationStore::open(&path)?),
                None => Arc::new(InMemoryConversationStore::new(
                    config.storage.conversation_limit,
                )),
            },
        };

        let memory = Arc::new(AdaptiveMemory::new(&config.learning));
        let learning_path = config.learning_path();
        if let Some(path) = learning_path.as_deref().filter(|p| p.exists()) {
            if let Err(e) = memory.load(path) {
                warn!(path = %path.display(), error = %e, "Failed to load learning, starting fresh");
            }
        }

        let audit = config.storage.audit.then(|| AuditLogger::new(&paths));
        let sessions = Arc::new(SessionController::new(&config.sessions));
        let default_session = sessions.create_session(None, Some(config.sessions.default_mode));

        let core = Arc::new_cyclic(|weak: &Weak<Core>| {
            let bus = Arc::new(EventBus::new(&config.bus));
            bus.subscribe(INPUT_EVENT, Arc::new(InputHandler { core: weak.clone() }));

            let dispatcher = Arc::new(SkillDispatcher::new(&config.dispatcher));
            if let Err(e) = dispatcher.register(Arc::new(SetModeSkill { core: weak.clone() })) {
                warn!(error = %e, "Failed to register built-in set_mode skill");
            }

            Core {
                bus,
                scheduler: Arc::new(Scheduler::new(&config.scheduler)),
                reasoning: Arc::new(ReasoningEngine::new(&config.reasoning)),
                dispatcher,
                sessions,
                memory,
                parser,
                rule_parser,
                conversations,
                audit,
                default_session,
                learning_path,
                jobs: Mutex::new(Vec::new()),
                config,
                paths,
            }
        });
        info!(session = %core.default_session, "Core initialised");
        Ok(core)
    }
}

/// Wires the bus, scheduler, reasoning, dispatcher, sessions and learning together.
pub struct Core {
    config: Config,
    paths: Paths,
    bus: Arc<EventBus>,
    scheduler: Arc<Scheduler>,
    reasoning: Arc<ReasoningEngine>,
    dispatcher: Arc<SkillDispatcher>,
    sessions: Arc<SessionController>,
    memory: Arc<AdaptiveMemory>,
    parser: Arc<dyn IntentParser>,
    rule_parser: Option<Arc<RuleIntentParser>>,
    conversations: Arc<dyn ConversationStore>,
    audit: Option<AuditLogger>,
    default_session: String,
    learning_path: Option<PathBuf>,
    jobs: Mutex<Vec<String>>,
}

impl Core {
    pub fn builder(config: Config) -> CoreBuilder {
        CoreBuilder {
            config,
            paths: Paths::default(),
            parser: None,
            conversations: None,
        }
    }

    /// Load `config.json` under `paths` (defaults when absent) and build a Core there.
    pub fn open(paths: Paths) -> Result<Arc<Core>> {
        let config = Config::load_or_default(&paths)?;
        paths.ensure_dirs()?;
        Core::builder(config).paths(paths).build()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn paths(&self) -> &Paths {
        &self.paths
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn reasoning(&self) -> &Arc<ReasoningEngine> {
        &self.reasoning
    }

    pub fn dispatcher(&self) -> &Arc<SkillDispatcher> {
        &self.dispatcher
    }

    pub fn sessions(&self) -> &Arc<SessionController> {
        &self.sessions
    }

    pub fn memory(&self) -> &Arc<AdaptiveMemory> {
        &self.memory
    }

    pub fn conversations(&self) -> &Arc<dyn ConversationStore> {
        &self.conversations
    }

    pub fn default_session_id(&self) -> &str {
        &self.default_session
    }

    /// Register a skill and, with the built-in parser, its trigger phrases.
    pub fn register_skill(&self, skill: Arc<dyn Skill>) -> Result<()> {
        let meta = skill.meta();
        self.dispatcher.register(skill)?;
        if let Some(rules) = &self.rule_parser {
            rules.add_skill_triggers(&meta);
        }
        Ok(())
    }

    /// Start the bus workers, the scheduler loop and the housekeeping jobs.
    pub fn start(&self) -> Result<()> {
        self.bus.start();
        self.scheduler.start();

        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        if !jobs.is_empty() {
            return Ok(());
        }

        if self.config.sessions.cleanup_interval_secs > 0 {
            let sessions = self.sessions.clone();
            let keep = self.default_session.clone();
            let max_idle = Duration::from_secs(self.config.sessions.max_idle_hours * 3600);
            let id = self.scheduler.schedule_every(
                "session-cleanup",
                Duration::from_secs(self.config.sessions.cleanup_interval_secs),
                move || {
                    let sessions = sessions.clone();
                    let keep = keep.clone();
                    async move {
                        sessions.cleanup_inactive_sessions_except(max_idle, &[keep.as_str()]);
                        Ok::<(), Error>(())
                    }
                },
            )?;
            jobs.push(id);
        }

        if let Some(path) = self.learning_path.clone() {
            if self.config.learning.autosave_interval_secs > 0 {
                let memory = self.memory.clone();
                let id = self.scheduler.schedule_every(
                    "learning-autosave",
                    Duration::from_secs(self.config.learning.autosave_interval_secs),
                    move || {
                        let memory = memory.clone();
                        let path = path.clone();
                        async move { memory.save(&path) }
                    },
                )?;
                jobs.push(id);
            }
        }
        info!(jobs = jobs.len(), "Core started");
        Ok(())
    }

    /// Stop the scheduler and the bus, then persist learning. Idempotent.
    pub async fn stop(&self) {
        let jobs: Vec<String> = std::mem::take(&mut *self.jobs.lock().unwrap_or_else(|e| e.into_inner()));
        for id in &jobs {
            self.scheduler.cancel(id);
        }
        self.scheduler.stop().await;
        self.bus.stop().await;
        if let Some(path) = &self.learning_path {
            if let Err(e) = self.memory.save(path) {
                warn!(path = %path.display(), error = %e, "Failed to save learning");
            }
        }
        info!("Core stopped");
    }

    pub async fn process_text(&self, text: &str) -> Response {
        self.process_text_in(&self.default_session, text, DEFAULT_SOURCE)
            .await
    }

    /// Run the full pipeline for one utterance in `session_id`.
    pub async fn process_text_in(&self, session_id: &str, text: &str, source: &str) -> Response {
        let normalized = normalize_text(text);
        let response = self.resolve(session_id, &normalized).await;

        if let Err(e) = self.sessions.add_session_history(session_id, "user", text) {
            debug!(session = %session_id, error = %e, "History not recorded");
        } else {
            if let Err(e) = self
                .sessions
                .add_session_history(session_id, "assistant", &response.text)
            {
                debug!(session = %session_id, error = %e, "History not recorded");
            }
        }
        if let Err(e) = self
            .conversations
            .save_conversation(text, &response.text, source)
        {
            warn!(error = %e, "Failed to store conversation");
        }
        let payload = json!({
            "text": response.text,
            "intent": response.intent,
            "entities": response.entities,
            "success": response.success,
            "sessionId": response.session_id,
        });
        self.publish(RESPONSE_EVENT, payload);
        response
    }

    /// Publish from inside the pipeline without waiting for queue space. The
    /// pipeline may itself run on a bus worker, so waiting here could stall
    /// every worker on a full queue.
    fn publish(&self, event_type: &str, payload: Value) {
        if let Err(e) = self.bus.try_emit(event_type, payload) {
            warn!(event_type = %event_type, error = %e, "Event not published");
        }
    }

    async fn resolve(&self, session_id: &str, text: &str) -> Response {
        let candidate = self.parser.parse(text);
        let correction = self
            .memory
            .get_correction_for(text)
            .filter(|c| c.confidence >= self.config.learning.override_threshold);

        let (intent, entities, confidence) = match (correction, candidate) {
            (Some(c), _) => {
                debug!(intent = %c.intent, confidence = c.confidence, "Learned correction applied");
                (c.intent, c.entities, c.confidence)
            }
            (None, Some(p)) => (p.intent, p.entities, p.confidence),
            (None, None) => {
                return Response {
                    text: "Sorry, I didn't understand that. Could you rephrase it?".to_string(),
                    intent: UNKNOWN_INTENT.to_string(),
                    entities: Entities::new(),
                    success: false,
                    session_id: session_id.to_string(),
                    confidence: 0.0,
                    result: None,
                };
            }
        };

        let fail = |text: String, confidence: f64| Response {
            text,
            intent: intent.clone(),
            entities: entities.clone(),
            success: false,
            session_id: session_id.to_string(),
            confidence,
            result: None,
        };

        let session = match self.sessions.get_session(session_id) {
            Ok(session) => session,
            Err(e) => return fail(format!("Sorry, I can't continue: {}", e), confidence),
        };

        let ctx = ReasoningContext {
            confidence,
            mode: session.mode,
            session_id: Some(session.id.clone()),
            text: text.to_string(),
            values: session.context.clone(),
        };
        let verdict = self.reasoning.reason(&intent, &entities, &ctx);
        if !verdict.valid {
            let explanation = verdict.rejections.join("; ");
            self.memory.record_failure(text, &intent, &explanation);
            return fail(
                format!("I can't do that: {}", explanation),
                verdict.confidence,
            );
        }

        let health = self.memory.get_skill_health(&intent);
        if !health.is_healthy {
            warn!(intent = %intent, failures = health.counted_failures, "Dispatching to unhealthy skill");
        }

        let skill_ctx = SkillContext {
            session_id: Some(session.id.clone()),
            mode: session.mode,
            text: text.to_string(),
            values: session.context,
        };
        let (outcome, record) = self
            .dispatcher
            .dispatch_with_record(&intent, &entities, &skill_ctx)
            .await;

        if let Some(audit) = &self.audit {
            if let Err(e) = audit.log_dispatch(
                session_id,
                &record.intent,
                record.success,
                record.duration_ms,
                record.error.clone(),
            ) {
                warn!(error = %e, "Failed to write audit record");
            }
        }

        if outcome.success {
            let result = outcome.result.clone().unwrap_or(Value::Null);
            self.memory.record_success(text, &intent, &entities, &result);
            Response {
                text: render_result(&outcome),
                intent,
                entities,
                success: true,
                session_id: session_id.to_string(),
                confidence: verdict.confidence,
                result: outcome.result,
            }
        } else {
            let error = outcome.error.unwrap_or_else(|| "unknown error".to_string());
            self.memory.record_failure(text, &intent, &error);
            fail(format!("Sorry, that didn't work: {}", error), verdict.confidence)
        }
    }

    /// Teach Core what `text` means.
    pub fn record_correction(&self, text: &str, intent: &str, entities: &Entities) {
        self.memory.record_correction(text, intent, entities);
        if let Some(audit) = &self.audit {
            if let Err(e) = audit.log_correction(&normalize_text(text), intent) {
                warn!(error = %e, "Failed to write audit record");
            }
        }
    }

    /// Switch a session's mode and publish `mode_changed`. Returns the previous mode.
    pub fn set_session_mode(&self, session_id: &str, mode: &str) -> Result<Mode> {
        let to: Mode = mode.parse()?;
        self.set_mode(session_id, to)
    }

    pub fn set_mode(&self, session_id: &str, to: Mode) -> Result<Mode> {
        let from = self.sessions.set_mode(session_id, to)?;
        if let Some(audit) = &self.audit {
            if let Err(e) = audit.log_mode_change(session_id, from, to) {
                warn!(error = %e, "Failed to write audit record");
            }
        }
        let payload = json!({"sessionId": session_id, "from": from, "to": to});
        self.publish(MODE_CHANGED_EVENT, payload);
        Ok(from)
    }

    pub fn stats(&self) -> CoreStats {
        CoreStats {
            bus: self.bus.stats(),
            dispatch: self.dispatcher.get_execution_stats(),
            reasoning: self.reasoning.stats(),
            learning: self.memory.stats(),
            active_sessions: self.sessions.list_active_sessions().len(),
            scheduled_jobs: self.scheduler.list_jobs().len(),
        }
    }
}

fn render_result(outcome: &SkillOutcome) -> String {
    match &outcome.result {
        None | Some(Value::Null) => "Done.".to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(value) => value
            .get("message")
            .or_else(|| value.get("text"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| value.to_string()),
    }
}

/// Runs the pipeline for `input` events: `{text, sessionId?, source?}`.
struct InputHandler {
    core: Weak<Core>,
}

#[async_trait]
impl EventHandler for InputHandler {
    async fn handle(&self, event: &Event) -> Result<()> {
        let core = self
            .core
            .upgrade()
            .ok_or_else(|| Error::Other("core has been dropped".to_string()))?;
        let text = event
            .str_field("text")
            .ok_or_else(|| Error::Other("input event without text".to_string()))?;
        let session_id = event
            .str_field("sessionId")
            .unwrap_or(&core.default_session)
            .to_string();
        let source = event.str_field("source").unwrap_or("event").to_string();
        core.process_text_in(&session_id, text, &source).await;
        Ok(())
    }
}

/// Built-in skill behind the `set_mode` intent.
struct SetModeSkill {
    core: Weak<Core>,
}

#[async_trait]
impl Skill for SetModeSkill {
    fn meta(&self) -> SkillMeta {
        SkillMeta::new(SET_MODE_INTENT, "Switch the session's operating mode")
    }

    async fn run(&self, entities: &Entities, ctx: &SkillContext) -> Result<SkillOutcome> {
        let core = self
            .core
            .upgrade()
            .ok_or_else(|| Error::Other("core has been dropped".to_string()))?;
        let session_id = ctx
            .session_id
            .clone()
            .unwrap_or_else(|| core.default_session.clone());
        let Some(mode) = entities.get("mode").and_then(|v| v.as_str()) else {
            return Ok(SkillOutcome::failed("no mode given"));
        };
        let to: Mode = mode.parse()?;
        let from = core.set_mode(&session_id, to)?;
        Ok(SkillOutcome::ok(json!({
            "message": format!("Mode changed from {} to {}", from, to),
            "from": from,
            "to": to,
        })))
    }
}

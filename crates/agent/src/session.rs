use chrono::Utc;
use conductor_core::config::SessionsConfig;
use conductor_core::{Error, Mode, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    /// `user`, `assistant`, `mode` or any caller-chosen tag.
    pub role: String,
    pub content: String,
    pub at_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub created_at_ms: i64,
    pub last_activity_ms: i64,
    pub mode: Mode,
    pub context: Map<String, Value>,
    pub history: VecDeque<HistoryEntry>,
}

impl Session {
    fn push_history(&mut self, role: &str, content: &str, limit: usize) {
        let now = Utc::now().timestamp_millis();
        self.history.push_back(HistoryEntry {
            role: role.to_string(),
            content: content.to_string(),
            at_ms: now,
        });
        while self.history.len() > limit {
            self.history.pop_front();
        }
        self.last_activity_ms = now;
    }
}

/// Owns every conversation session. All access goes through one lock.
pub struct SessionController {
    sessions: Mutex<HashMap<String, Session>>,
    history_limit: usize,
    default_mode: Mode,
}

impl Default for SessionController {
    fn default() -> Self {
        Self::new(&SessionsConfig::default())
    }
}

impl SessionController {
    pub fn new(config: &SessionsConfig) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            history_limit: config.history_limit.max(1),
            default_mode: config.default_mode,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Session>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn create_session(&self, initial_context: Option<Map<String, Value>>, mode: Option<Mode>) -> String {
        let now = Utc::now().timestamp_millis();
        let session = Session {
            id: uuid::Uuid::new_v4().to_string(),
            created_at_ms: now,
            last_activity_ms: now,
            mode: mode.unwrap_or(self.default_mode),
            context: initial_context.unwrap_or_default(),
            history: VecDeque::new(),
        };
        let id = session.id.clone();
        debug!(session = %id, mode = %session.mode, "Session created");
        self.lock().insert(id.clone(), session);
        id
    }

    pub fn get_session(&self, id: &str) -> Result<Session> {
        self.lock()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::SessionNotFound(id.to_string()))
    }

    /// Parse `mode` and switch to it. Returns the previous mode.
    pub fn set_session_mode(&self, id: &str, mode: &str) -> Result<Mode> {
        let mode: Mode = mode.parse()?;
        self.set_mode(id, mode)
    }

    pub fn set_mode(&self, id: &str, mode: Mode) -> Result<Mode> {
        let mut sessions = self.lock();
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| Error::SessionNotFound(id.to_string()))?;
        let previous = session.mode;
        session.mode = mode;
        session.push_history("mode", &format!("{} -> {}", previous, mode), self.history_limit);
        info!(session = %id, from = %previous, to = %mode, "Session mode changed");
        Ok(previous)
    }

    /// Merge `updates` into the session context, overwriting existing keys.
    pub fn update_session_context(&self, id: &str, updates: Map<String, Value>) -> Result<()> {
        let mut sessions = self.lock();
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| Error::SessionNotFound(id.to_string()))?;
        session.context.extend(updates);
        session.last_activity_ms = Utc::now().timestamp_millis();
        Ok(())
    }

    pub fn add_session_history(&self, id: &str, role: &str, content: &str) -> Result<()> {
        let mut sessions = self.lock();
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| Error::SessionNotFound(id.to_string()))?;
        session.push_history(role, content, self.history_limit);
        Ok(())
    }

    pub fn list_active_sessions(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self.lock().values().cloned().collect();
        sessions.sort_by_key(|s| s.created_at_ms);
        sessions
    }

    pub fn close_session(&self, id: &str) -> bool {
        let closed = self.lock().remove(id).is_some();
        if closed {
            debug!(session = %id, "Session closed");
        }
        closed
    }

    /// Close every session idle for longer than `max_age`. Returns how many were closed.
    pub fn cleanup_inactive_sessions(&self, max_age: Duration) -> usize {
        self.cleanup_inactive_sessions_except(max_age, &[])
    }

    /// Same as [`cleanup_inactive_sessions`](Self::cleanup_inactive_sessions), sparing `keep`.
    pub fn cleanup_inactive_sessions_except(&self, max_age: Duration, keep: &[&str]) -> usize {
        let cutoff = Utc::now().timestamp_millis() - max_age.as_millis() as i64;
        let mut sessions = self.lock();
        let before = sessions.len();
        sessions.retain(|id, s| s.last_activity_ms >= cutoff || keep.contains(&id.as_str()));
        let removed = before - sessions.len();
        if removed > 0 {
            info!(removed, "Closed inactive sessions");
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_history_and_mode_changes() {
        let config = SessionsConfig {
            history_limit: 50,
            ..SessionsConfig::default()
        };
        let controller = Arc::new(SessionController::new(&config));
        let id = controller.create_session(None, None);

        let run_round = |round: usize| {
            let tasks: Vec<_> = (0..4)
                .map(|t| {
                    let controller = controller.clone();
                    let id = id.clone();
                    tokio::spawn(async move {
                        for i in 0..10 {
                            controller
                                .add_session_history(&id, "user", &format!("{}-{}-{}", round, t, i))
                                .unwrap();
                            tokio::task::yield_now().await;
                        }
                        controller.set_mode(&id, Mode::Safe).unwrap();
                    })
                })
                .collect::<Vec<_>>();
            futures::future::join_all(tasks)
        };

        for joined in run_round(0).await {
            joined.unwrap();
        }
        let session = controller.get_session(&id).unwrap();
        assert_eq!(session.history.len(), 44);
        assert_eq!(session.mode, Mode::Safe);

        for joined in run_round(1).await {
            joined.unwrap();
        }
        let session = controller.get_session(&id).unwrap();
        assert_eq!(session.history.len(), 50);
        assert_eq!(session.mode, Mode::Safe);
        assert_eq!(
            session.history.iter().filter(|e| e.role == "mode").count(),
            session.history.iter().filter(|e| e.content.ends_with("-> SAFE")).count()
        );
    }

    #[test]
    fn test_create_then_get() {
        let controller = SessionController::default();
        let id = controller.create_session(None, None);
        let session = controller.get_session(&id).unwrap();
        assert_eq!(session.mode, Mode::Active);
        assert!(session.history.is_empty());
        assert!(matches!(
            controller.get_session("missing"),
            Err(Error::SessionNotFound(_))
        ));
    }

    #[test]
    fn test_invalid_mode_leaves_session_unchanged() {
        let controller = SessionController::default();
        let id = controller.create_session(None, Some(Mode::Passive));
        assert!(matches!(
            controller.set_session_mode(&id, "INVALID"),
            Err(Error::InvalidMode(_))
        ));
        let session = controller.get_session(&id).unwrap();
        assert_eq!(session.mode, Mode::Passive);
        assert!(session.history.is_empty());
    }

    #[test]
    fn test_mode_transition_is_recorded() {
        let controller = SessionController::default();
        let id = controller.create_session(None, None);
        let previous = controller.set_session_mode(&id, "safe").unwrap();
        assert_eq!(previous, Mode::Active);

        let session = controller.get_session(&id).unwrap();
        assert_eq!(session.mode, Mode::Safe);
        let last = session.history.back().unwrap();
        assert_eq!(last.role, "mode");
        assert_eq!(last.content, "ACTIVE -> SAFE");
    }

    #[test]
    fn test_history_is_capped() {
        let config = SessionsConfig {
            history_limit: 3,
            ..SessionsConfig::default()
        };
        let controller = SessionController::new(&config);
        let id = controller.create_session(None, None);
        for i in 0..5 {
            controller.add_session_history(&id, "user", &format!("msg {}", i)).unwrap();
        }
        let history = controller.get_session(&id).unwrap().history;
        assert_eq!(history.len(), 3);
        assert_eq!(history.front().unwrap().content, "msg 2");
    }

    #[test]
    fn test_context_merge() {
        let controller = SessionController::default();
        let mut initial = Map::new();
        initial.insert("lang".to_string(), json!("es"));
        let id = controller.create_session(Some(initial), None);

        let mut updates = Map::new();
        updates.insert("lang".to_string(), json!("en"));
        updates.insert("user".to_string(), json!("ana"));
        controller.update_session_context(&id, updates).unwrap();

        let ctx = controller.get_session(&id).unwrap().context;
        assert_eq!(ctx["lang"], "en");
        assert_eq!(ctx["user"], "ana");
    }

    #[test]
    fn test_cleanup_and_close() {
        let controller = SessionController::default();
        let stale = controller.create_session(None, None);
        let fresh = controller.create_session(None, None);
        controller.lock().get_mut(&stale).unwrap().last_activity_ms -= 3_600_000;

        assert_eq!(controller.cleanup_inactive_sessions(Duration::from_secs(60)), 1);
        assert!(controller.get_session(&stale).is_err());
        assert_eq!(controller.list_active_sessions().len(), 1);

        let pinned = controller.create_session(None, None);
        controller.lock().get_mut(&pinned).unwrap().last_activity_ms -= 3_600_000;
        assert_eq!(
            controller.cleanup_inactive_sessions_except(Duration::from_secs(60), &[pinned.as_str()]),
            0
        );
        assert!(controller.close_session(&pinned));

        assert!(controller.close_session(&fresh));
        assert!(!controller.close_session(&fresh));
        assert!(controller.list_active_sessions().is_empty());
    }
}

use chrono::Utc;
use conductor_core::{Mode, Paths, Result};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use tracing::error;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditEvent {
    Dispatch {
        session_id: String,
        intent: String,
        success: bool,
        duration_ms: u64,
        error: Option<String>,
        timestamp_ms: i64,
    },
    ModeChange {
        session_id: String,
        from: Mode,
        to: Mode,
        timestamp_ms: i64,
    },
    Correction {
        text: String,
        intent: String,
        timestamp_ms: i64,
    },
}

/// Appends audit events to one JSONL file per UTC day under `<base>/audit`.
pub struct AuditLogger {
    dir: PathBuf,
}

impl AuditLogger {
    pub fn new(paths: &Paths) -> Self {
        Self {
            dir: paths.audit_dir(),
        }
    }

    pub fn log_dispatch(
        &self,
        session_id: &str,
        intent: &str,
        success: bool,
        duration_ms: u64,
        error: Option<String>,
    ) -> Result<()> {
        self.write_event(&AuditEvent::Dispatch {
            session_id: session_id.to_string(),
            intent: intent.to_string(),
            success,
            duration_ms,
            error,
            timestamp_ms: Utc::now().timestamp_millis(),
        })
    }

    pub fn log_mode_change(&self, session_id: &str, from: Mode, to: Mode) -> Result<()> {
        self.write_event(&AuditEvent::ModeChange {
            session_id: session_id.to_string(),
            from,
            to,
            timestamp_ms: Utc::now().timestamp_millis(),
        })
    }

    pub fn log_correction(&self, text: &str, intent: &str) -> Result<()> {
        self.write_event(&AuditEvent::Correction {
            text: text.to_string(),
            intent: intent.to_string(),
            timestamp_ms: Utc::now().timestamp_millis(),
        })
    }

    fn file_for(&self, date: &str) -> PathBuf {
        self.dir.join(format!("{}.jsonl", date))
    }

    fn write_event(&self, event: &AuditEvent) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let today = Utc::now().format("%Y-%m-%d").to_string();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.file_for(&today))?;
        let json = serde_json::to_string(event)?;
        writeln!(file, "{}", json)?;
        Ok(())
    }

    /// Events logged on `date` (`YYYY-MM-DD`). Unparseable lines are skipped.
    pub fn read_events(&self, date: &str) -> Result<Vec<AuditEvent>> {
        let path = self.file_for(date);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&path)?;
        let mut events = Vec::new();
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<AuditEvent>(line) {
                Ok(event) => events.push(event),
                Err(e) => error!(error = %e, line = %line, "Failed to parse audit event"),
            }
        }
        Ok(events)
    }

    pub fn read_today(&self) -> Result<Vec<AuditEvent>> {
        self.read_events(&Utc::now().format("%Y-%m-%d").to_string())
    }
}

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Skill not found: {0}")]
    SkillNotFound(String),

    #[error("Skill execution error: {0}")]
    SkillExecution(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Invalid mode: {0} (expected one of SAFE, PASSIVE, ACTIVE, ANALYSIS)")]
    InvalidMode(String),

    #[error("Rule error: {0}")]
    ReasoningRule(String),

    #[error("Event queue is full ({0} entries)")]
    QueueFull(usize),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

pub mod adaptive;
pub mod audit;
pub mod conversation;

pub use adaptive::{
    AdaptiveMemory, Correction, LearningSnapshot, LearningStats, SkillHealth, SuccessPattern,
};
pub use audit::{AuditEvent, AuditLogger};
pub use conversation::{
    ConversationRecord, ConversationStore, InMemoryConversationStore, SqliteConversationStore,
};

pub mod dispatcher;
pub mod skill;

pub use dispatcher::{DispatchRecord, ExecutionStats, SkillDispatcher, SkillPerformance};
pub use skill::{FnSkill, Skill, SkillContext, SkillMeta, SkillOutcome, SkillRequires};

pub mod bus;
pub mod intent;
pub mod reasoning;
pub mod runtime;
pub mod session;

pub use bus::{BusStats, EventBus, EventHandler, SubscriptionId};
pub use intent::{IntentParser, IntentRule, ParsedIntent, RuleIntentParser};
pub use reasoning::{ReasoningContext, ReasoningEngine, ReasoningResult, ReasoningStats, Verdict};
pub use runtime::{Core, CoreBuilder, CoreStats, Response, UNKNOWN_INTENT};
pub use session::{HistoryEntry, Session, SessionController};

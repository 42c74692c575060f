pub mod config;
pub mod error;
pub mod logging;
pub mod message;
pub mod paths;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use message::Event;
pub use paths::Paths;
pub use types::{entities, entities_signature, normalize_text, Entities, EntityValue, Mode};

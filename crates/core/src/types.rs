use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Operational permission level of a session.
///
/// Transitions between any two modes are allowed; skills may restrict the
/// modes they run in through `SkillMeta::allowed_modes`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Mode {
    /// Read-only: only skills that explicitly allow SAFE run.
    Safe,
    /// Observe and answer, no side effects expected.
    Passive,
    /// Normal interactive operation.
    #[default]
    Active,
    /// Introspection and diagnostics.
    Analysis,
}

impl Mode {
    pub const ALL: [Mode; 4] = [Mode::Safe, Mode::Passive, Mode::Active, Mode::Analysis];

    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Safe => "SAFE",
            Mode::Passive => "PASSIVE",
            Mode::Active => "ACTIVE",
            Mode::Analysis => "ANALYSIS",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "SAFE" => Ok(Mode::Safe),
            "PASSIVE" => Ok(Mode::Passive),
            "ACTIVE" => Ok(Mode::Active),
            "ANALYSIS" => Ok(Mode::Analysis),
            _ => Err(Error::InvalidMode(s.to_string())),
        }
    }
}

/// A single extracted parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntityValue {
    Bool(bool),
    Number(f64),
    Text(String),
    List(Vec<EntityValue>),
}

impl EntityValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            EntityValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            EntityValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            EntityValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl fmt::Display for EntityValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityValue::Bool(b) => write!(f, "{}", b),
            EntityValue::Number(n) => write!(f, "{}", n),
            EntityValue::Text(s) => f.write_str(s),
            EntityValue::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{}", item)?;
                }
                f.write_str("]")
            }
        }
    }
}

impl From<&str> for EntityValue {
    fn from(s: &str) -> Self {
        EntityValue::Text(s.to_string())
    }
}

impl From<String> for EntityValue {
    fn from(s: String) -> Self {
        EntityValue::Text(s)
    }
}

impl From<f64> for EntityValue {
    fn from(n: f64) -> Self {
        EntityValue::Number(n)
    }
}

impl From<i64> for EntityValue {
    fn from(n: i64) -> Self {
        EntityValue::Number(n as f64)
    }
}

impl From<bool> for EntityValue {
    fn from(b: bool) -> Self {
        EntityValue::Bool(b)
    }
}

impl<T: Into<EntityValue>> From<Vec<T>> for EntityValue {
    fn from(items: Vec<T>) -> Self {
        EntityValue::List(items.into_iter().map(Into::into).collect())
    }
}

/// Parameters extracted alongside an intent, ordered by key.
pub type Entities = BTreeMap<String, EntityValue>;

/// Build an `Entities` map from `(key, value)` pairs.
pub fn entities<K, V, I>(pairs: I) -> Entities
where
    K: Into<String>,
    V: Into<EntityValue>,
    I: IntoIterator<Item = (K, V)>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

/// Stable `key=value` signature of an entity map, used as a lookup key.
pub fn entities_signature(entities: &Entities) -> String {
    entities
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// Normalize an utterance for lookups: trim, lowercase, collapse whitespace.
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

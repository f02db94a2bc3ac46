use crate::membership::MemberId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Identifier of an outstanding coordinator round trip.
pub type PollId = u64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConfigMessage {
    /// Ask the coordinator to apply entries; answered by `PollResponse`.
    /// Values are `None` for removals.
    Request {
        poll: PollId,
        entries: Vec<(String, Option<Value>)>,
        remove: bool,
    },
    /// Entries applied by the coordinator.
    Update {
        entries: Vec<(String, Option<Value>)>,
        remove: bool,
    },
    /// The coordinator's complete map.
    Sync { entries: Vec<(String, Value)> },
    PollResponse { poll: PollId },
}

impl ConfigMessage {
    pub fn name(&self) -> &'static str {
        match self {
            ConfigMessage::Request { .. } => "ConfigRequest",
            ConfigMessage::Update { .. } => "ConfigUpdate",
            ConfigMessage::Sync { .. } => "ConfigSync",
            ConfigMessage::PollResponse { .. } => "ConfigResponse",
        }
    }
}

impl fmt::Display for ConfigMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigMessage::Request { poll, entries, .. } => {
                write!(f, "{}(poll={poll}, entries={})", self.name(), entries.len())
            }
            ConfigMessage::Update { entries, .. } => write!(f, "{}(entries={})", self.name(), entries.len()),
            ConfigMessage::Sync { entries } => write!(f, "{}(entries={})", self.name(), entries.len()),
            ConfigMessage::PollResponse { poll } => write!(f, "{}(poll={poll})", self.name()),
        }
    }
}

/// Delivers config messages between members. Sends are fire and forget.
pub trait ConfigTransport: Send + Sync {
    fn send(&self, from: MemberId, to: MemberId, message: ConfigMessage);
}

//! Payloads submitted by participants and the reasons a round rejects them.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Address;

/// The single value one participant contributes to one round.
///
/// Payloads are keyed by `(round_id, sender)`; a round accepts at most one
/// per sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    round_id: String,
    sender: Address,
    content: Value,
}

impl Payload {
    pub fn new(round_id: impl Into<String>, sender: impl Into<Address>, content: Value) -> Self {
        Self {
            round_id: round_id.into(),
            sender: sender.into(),
            content,
        }
    }

    pub fn round_id(&self) -> &str {
        &self.round_id
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    pub fn content(&self) -> &Value {
        &self.content
    }

    /// Value compared by aggregating rounds: the whole content, or one of its
    /// attributes when `attribute` is given
    pub fn attribute(&self, attribute: Option<&str>) -> Option<&Value> {
        match attribute {
            None => Some(&self.content),
            Some(name) => self.content.get(name),
        }
    }
}

/// Reasons a round refuses a payload. Rejections never change round state.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PayloadError {
    #[error("Payload for round {payload_round} delivered to round {round}")]
    WrongRound { round: String, payload_round: String },

    #[error("{0} is not in the list of participants")]
    NotParticipant(Address),

    #[error("{sender} has already sent a payload for round {round}")]
    DuplicateSender { round: String, sender: Address },

    #[error("Payload attribute mismatch: expected {expected}, got {found}")]
    Mismatch { expected: String, found: String },

    #[error("{sender} is not the elected keeper {keeper}")]
    NotKeeper { sender: Address, keeper: Address },

    #[error("Value {0} has already been submitted by another participant")]
    DuplicateValue(String),

    #[error("Invalid payload content: {0}")]
    Invalid(String),

    #[error("Round {0} does not accept payloads")]
    RoundClosed(String),
}

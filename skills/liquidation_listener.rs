//! # Liquidation Listener Protocol
//!
//! Message model and dialogue rules of the protocol agents use to subscribe
//! to on-chain liquidation events. Transport and wire encoding are left to the
//! connection carrying the messages.
//!
//! ## Performatives
//!
//! | Performative                          | Contents                                  | Valid replies                  |
//! |---------------------------------------|-------------------------------------------|--------------------------------|
//! | `subscribe_to_liquidation_events`     | none                                      | `liquidation_event`, `error`   |
//! | `unsubscribe_from_liquidation_events` | none                                      | `unsubscribed`, `error`        |
//! | `liquidation_event`                   | ten event fields, `received_token_address` optional | terminal             |
//! | `unsubscribed`                        | none                                      | terminal                       |
//! | `error`                               | `error_code`, `error_msg`, `error_data`   | terminal                       |

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Protocol violations detected on a message or a dialogue
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    #[error("Invalid content: {0}")]
    InvalidContent(String),

    #[error("Performative {0} cannot open a dialogue")]
    InvalidInitialPerformative(Performative),

    #[error("Performative {performative} is not a valid reply to {target}")]
    InvalidReply {
        performative: Performative,
        target: Performative,
    },

    #[error("Expected message id {expected}, found {found}")]
    InvalidMessageId { expected: i64, found: i64 },

    #[error("Message {message_id} targets unknown message {target}")]
    InvalidTarget { message_id: i64, target: i64 },

    #[error("Message sent by the {0} out of turn")]
    WrongSender(Role),

    #[error("Dialogue {0} already reached a terminal performative")]
    Terminated(String),

    #[error("No dialogue with reference {0}")]
    UnknownDialogue(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Performative {
    SubscribeToLiquidationEvents,
    UnsubscribeFromLiquidationEvents,
    LiquidationEvent,
    Unsubscribed,
    Error,
}

impl Performative {
    pub const INITIAL: [Performative; 2] = [
        Performative::SubscribeToLiquidationEvents,
        Performative::UnsubscribeFromLiquidationEvents,
    ];

    pub const TERMINAL: [Performative; 3] = [
        Performative::LiquidationEvent,
        Performative::Unsubscribed,
        Performative::Error,
    ];

    pub fn is_initial(self) -> bool {
        Self::INITIAL.contains(&self)
    }

    pub fn is_terminal(self) -> bool {
        Self::TERMINAL.contains(&self)
    }

    /// Performatives allowed in reply to `self`
    pub fn valid_replies(self) -> &'static [Performative] {
        match self {
            Self::SubscribeToLiquidationEvents => &[Self::LiquidationEvent, Self::Error],
            Self::UnsubscribeFromLiquidationEvents => &[Self::Unsubscribed, Self::Error],
            Self::LiquidationEvent | Self::Unsubscribed | Self::Error => &[],
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::SubscribeToLiquidationEvents => "subscribe_to_liquidation_events",
            Self::UnsubscribeFromLiquidationEvents => "unsubscribe_from_liquidation_events",
            Self::LiquidationEvent => "liquidation_event",
            Self::Unsubscribed => "unsubscribed",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for Performative {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ErrorCode(pub i32);

/// Lending protocol the liquidation happened on
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LendingProtocol(pub String);

/// A liquidation observed on chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiquidationEvent {
    pub liquidated_user: String,
    pub liquidator_user: String,
    pub collateral_token_address: String,
    pub debt_token_address: String,
    #[serde(with = "amount")]
    pub debt_purchase_amount: u128,
    #[serde(with = "amount")]
    pub received_amount: u128,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub received_token_address: Option<String>,
    pub protocol: LendingProtocol,
    pub transaction_hash: String,
    pub trace_address: Vec<i64>,
    pub block_number: String,
}

impl LiquidationEvent {
    /// Number of contents carried; ten plus the optional received token
    pub fn nb_contents(&self) -> usize {
        10 + usize::from(self.received_token_address.is_some())
    }

    fn check(&self) -> Result<(), ProtocolError> {
        let required = [
            ("liquidated_user", &self.liquidated_user),
            ("liquidator_user", &self.liquidator_user),
            ("collateral_token_address", &self.collateral_token_address),
            ("debt_token_address", &self.debt_token_address),
            ("transaction_hash", &self.transaction_hash),
            ("block_number", &self.block_number),
        ];
        if let Some((name, _)) = required.iter().find(|(_, value)| value.is_empty()) {
            return Err(ProtocolError::InvalidContent(format!("'{name}' content is not set")));
        }
        if self.protocol.0.is_empty() {
            return Err(ProtocolError::InvalidContent("'protocol' content is not set".to_string()));
        }
        if self.received_token_address.as_deref() == Some("") {
            return Err(ProtocolError::InvalidContent(
                "'received_token_address' must be omitted rather than empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Token amounts travel as decimal strings; JSON numbers cannot hold them
mod amount {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &u128, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u128, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Text(String),
            Number(u64),
        }
        match Repr::deserialize(deserializer)? {
            Repr::Text(text) => text.parse().map_err(D::Error::custom),
            Repr::Number(number) => Ok(u128::from(number)),
        }
    }
}

/// Contents of a message, one variant per performative
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "performative", rename_all = "snake_case")]
pub enum Content {
    SubscribeToLiquidationEvents,
    UnsubscribeFromLiquidationEvents,
    LiquidationEvent(LiquidationEvent),
    Unsubscribed,
    Error {
        error_code: ErrorCode,
        error_msg: String,
        error_data: BTreeMap<String, String>,
    },
}

impl Content {
    pub fn performative(&self) -> Performative {
        match self {
            Self::SubscribeToLiquidationEvents => Performative::SubscribeToLiquidationEvents,
            Self::UnsubscribeFromLiquidationEvents => Performative::UnsubscribeFromLiquidationEvents,
            Self::LiquidationEvent(_) => Performative::LiquidationEvent,
            Self::Unsubscribed => Performative::Unsubscribed,
            Self::Error { .. } => Performative::Error,
        }
    }

    pub fn nb_contents(&self) -> usize {
        match self {
            Self::LiquidationEvent(event) => event.nb_contents(),
            Self::Error { .. } => 3,
            _ => 0,
        }
    }
}

/// `(starter reference, responder reference)`
pub type DialogueReference = (String, String);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiquidationListenerMessage {
    pub dialogue_reference: DialogueReference,
    pub message_id: i64,
    pub target: i64,
    #[serde(flatten)]
    pub content: Content,
}

impl LiquidationListenerMessage {
    pub fn new(dialogue_reference: DialogueReference, message_id: i64, target: i64, content: Content) -> Self {
        Self {
            dialogue_reference,
            message_id,
            target,
            content,
        }
    }

    pub fn performative(&self) -> Performative {
        self.content.performative()
    }

    /// Header and content rules every message must satisfy on its own
    pub fn check_consistency(&self) -> Result<(), ProtocolError> {
        let (starter, responder) = &self.dialogue_reference;
        if starter.is_empty() && responder.is_empty() {
            return Err(ProtocolError::InvalidHeader("dialogue_reference is not set".to_string()));
        }
        if self.message_id < 1 {
            return Err(ProtocolError::InvalidHeader(format!(
                "message_id must be positive, found {}",
                self.message_id
            )));
        }
        if self.message_id == 1 && self.target != 0 {
            return Err(ProtocolError::InvalidHeader(format!(
                "first message must have target 0, found {}",
                self.target
            )));
        }
        if self.message_id > 1 && !(1..self.message_id).contains(&self.target) {
            return Err(ProtocolError::InvalidTarget {
                message_id: self.message_id,
                target: self.target,
            });
        }

        match &self.content {
            Content::LiquidationEvent(event) => event.check(),
            Content::Error { error_msg, .. } if error_msg.is_empty() => {
                Err(ProtocolError::InvalidContent("'error_msg' content is not set".to_string()))
            }
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Client,
    Server,
}

impl Role {
    pub fn counterparty(self) -> Self {
        match self {
            Self::Client => Self::Server,
            Self::Server => Self::Client,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Client => f.write_str("client"),
            Self::Server => f.write_str("server"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndState {
    Successful,
}

/// One exchange between a client and a server
#[derive(Debug, Clone, PartialEq)]
pub struct LiquidationListenerDialogue {
    reference: DialogueReference,
    self_role: Role,
    /// Sender role and message, in order
    messages: Vec<(Role, LiquidationListenerMessage)>,
}

impl LiquidationListenerDialogue {
    pub fn new(reference: DialogueReference, self_role: Role) -> Self {
        Self {
            reference,
            self_role,
            messages: Vec::new(),
        }
    }

    pub fn reference(&self) -> &DialogueReference {
        &self.reference
    }

    pub fn self_role(&self) -> Role {
        self.self_role
    }

    pub fn messages(&self) -> impl Iterator<Item = &LiquidationListenerMessage> {
        self.messages.iter().map(|(_, message)| message)
    }

    pub fn last_message(&self) -> Option<&LiquidationListenerMessage> {
        self.messages.last().map(|(_, message)| message)
    }

    pub fn is_terminated(&self) -> bool {
        self.last_message()
            .is_some_and(|message| message.performative().is_terminal())
    }

    /// Terminal dialogues that ended with the expected reply
    pub fn end_state(&self) -> Option<EndState> {
        self.last_message()
            .filter(|message| {
                matches!(
                    message.performative(),
                    Performative::LiquidationEvent | Performative::Unsubscribed
                )
            })
            .map(|_| EndState::Successful)
    }

    /// Validate `message` sent by `sender` against the dialogue so far and
    /// append it
    pub fn update(&mut self, sender: Role, message: LiquidationListenerMessage) -> Result<(), ProtocolError> {
        message.check_consistency()?;
        if self.is_terminated() {
            return Err(ProtocolError::Terminated(self.reference.0.clone()));
        }

        let expected = self.messages.len() as i64 + 1;
        if message.message_id != expected {
            return Err(ProtocolError::InvalidMessageId {
                expected,
                found: message.message_id,
            });
        }

        let target = usize::try_from(message.target - 1)
            .ok()
            .and_then(|index| self.messages.get(index));
        match target {
            None => {
                if !message.performative().is_initial() {
                    return Err(ProtocolError::InvalidInitialPerformative(message.performative()));
                }
                if sender != Role::Client {
                    return Err(ProtocolError::WrongSender(sender));
                }
            }
            Some((target_sender, target)) => {
                if !target.performative().valid_replies().contains(&message.performative()) {
                    return Err(ProtocolError::InvalidReply {
                        performative: message.performative(),
                        target: target.performative(),
                    });
                }
                if sender == *target_sender {
                    return Err(ProtocolError::WrongSender(sender));
                }
            }
        }

        debug!(
            dialogue = %self.reference.0,
            message_id = message.message_id,
            performative = %message.performative(),
            "Dialogue updated"
        );
        self.messages.push((sender, message));
        Ok(())
    }
}

/// Dialogues of one agent, keyed by starter reference
#[derive(Debug, Clone)]
pub struct LiquidationListenerDialogues {
    self_address: String,
    dialogues: BTreeMap<String, LiquidationListenerDialogue>,
    nonce: u64,
    /// Completed dialogues per end state
    successful: u64,
}

impl LiquidationListenerDialogues {
    pub fn new(self_address: impl Into<String>) -> Self {
        Self {
            self_address: self_address.into(),
            dialogues: BTreeMap::new(),
            nonce: 0,
            successful: 0,
        }
    }

    pub fn self_address(&self) -> &str {
        &self.self_address
    }

    pub fn get(&self, starter_reference: &str) -> Option<&LiquidationListenerDialogue> {
        self.dialogues.get(starter_reference)
    }

    pub fn len(&self) -> usize {
        self.dialogues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dialogues.is_empty()
    }

    pub fn successful(&self) -> u64 {
        self.successful
    }

    /// Open a dialogue as the client with `content`, returning the first
    /// message
    pub fn create(&mut self, content: Content) -> Result<LiquidationListenerMessage, ProtocolError> {
        self.nonce += 1;
        let starter = format!("{}_{}", self.self_address, self.nonce);
        let message = LiquidationListenerMessage::new((starter.clone(), String::new()), 1, 0, content);

        let mut dialogue = LiquidationListenerDialogue::new(message.dialogue_reference.clone(), Role::Client);
        dialogue.update(Role::Client, message.clone())?;
        self.dialogues.insert(starter, dialogue);
        Ok(message)
    }

    /// Route a message received from the counterparty. A first message opens
    /// a new dialogue in the server role.
    pub fn update(&mut self, message: LiquidationListenerMessage) -> Result<&LiquidationListenerDialogue, ProtocolError> {
        let starter = message.dialogue_reference.0.clone();
        if message.message_id == 1 && !self.dialogues.contains_key(&starter) {
            let mut dialogue = LiquidationListenerDialogue::new(message.dialogue_reference.clone(), Role::Server);
            dialogue.update(Role::Client, message)?;
            return Ok(self.dialogues.entry(starter).or_insert(dialogue));
        }

        let dialogue = self
            .dialogues
            .get_mut(&starter)
            .ok_or_else(|| ProtocolError::UnknownDialogue(starter.clone()))?;
        let sender = dialogue.self_role().counterparty();
        dialogue.update(sender, message)?;
        if dialogue.end_state().is_some() {
            self.successful += 1;
        }
        Ok(dialogue)
    }

    /// Build this agent's reply to the last message of a dialogue
    pub fn reply(&mut self, starter_reference: &str, content: Content) -> Result<LiquidationListenerMessage, ProtocolError> {
        let dialogue = self
            .dialogues
            .get_mut(starter_reference)
            .ok_or_else(|| ProtocolError::UnknownDialogue(starter_reference.to_string()))?;
        let target = dialogue.last_message().map(|m| m.message_id).unwrap_or(0);
        let mut reference = dialogue.reference().clone();
        if reference.1.is_empty() && dialogue.self_role() == Role::Server {
            reference.1 = format!("{}_{}", self.self_address, target);
        }
        let message = LiquidationListenerMessage::new(reference, target + 1, target, content);
        let self_role = dialogue.self_role();
        dialogue.update(self_role, message.clone())?;
        if dialogue.end_state().is_some() {
            self.successful += 1;
        }
        Ok(message)
    }

    /// Drop dialogues that reached a terminal performative
    pub fn prune_terminated(&mut self) -> usize {
        let before = self.dialogues.len();
        self.dialogues.retain(|_, dialogue| !dialogue.is_terminated());
        before - self.dialogues.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event() -> LiquidationEvent {
        LiquidationEvent {
            liquidated_user: "0xborrower".to_string(),
            liquidator_user: "0xliquidator".to_string(),
            collateral_token_address: "0xcollateral".to_string(),
            debt_token_address: "0xdebt".to_string(),
            debt_purchase_amount: 1_500_000_000_000_000_000_000,
            received_amount: 42,
            received_token_address: None,
            protocol: LendingProtocol("0vix".to_string()),
            transaction_hash: "0xhash".to_string(),
            trace_address: vec![0, 1],
            block_number: "43000000".to_string(),
        }
    }

    fn subscribe() -> LiquidationListenerMessage {
        LiquidationListenerMessage::new(
            ("client_1".to_string(), String::new()),
            1,
            0,
            Content::SubscribeToLiquidationEvents,
        )
    }

    #[test]
    fn test_first_message_must_target_zero() {
        let mut message = subscribe();
        assert!(message.check_consistency().is_ok());

        message.target = 1;
        assert!(matches!(message.check_consistency(), Err(ProtocolError::InvalidHeader(_))));
    }

    #[test]
    fn test_reply_target_must_precede_message() {
        let reply = LiquidationListenerMessage::new(
            ("client_1".to_string(), "server_1".to_string()),
            2,
            2,
            Content::Unsubscribed,
        );
        assert_eq!(
            reply.check_consistency(),
            Err(ProtocolError::InvalidTarget { message_id: 2, target: 2 })
        );
    }

    #[test]
    fn test_liquidation_event_contents() {
        let mut liquidation = event();
        assert_eq!(liquidation.nb_contents(), 10);
        liquidation.received_token_address = Some("0xreceived".to_string());
        assert_eq!(Content::LiquidationEvent(liquidation.clone()).nb_contents(), 11);

        liquidation.transaction_hash.clear();
        let message = LiquidationListenerMessage::new(
            ("client_1".to_string(), "server_1".to_string()),
            2,
            1,
            Content::LiquidationEvent(liquidation),
        );
        assert!(matches!(message.check_consistency(), Err(ProtocolError::InvalidContent(m)) if m.contains("transaction_hash")));
    }

    #[test]
    fn test_message_serializes_with_performative_tag() {
        let message = LiquidationListenerMessage::new(
            ("client_1".to_string(), "server_1".to_string()),
            2,
            1,
            Content::Error {
                error_code: ErrorCode(3),
                error_msg: "unsupported protocol".to_string(),
                error_data: BTreeMap::from([("protocol".to_string(), "aave".to_string())]),
            },
        );

        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["performative"], "error");
        assert_eq!(json["error_code"], 3);
        assert_eq!(message.content.nb_contents(), 3);

        let decoded: LiquidationListenerMessage = serde_json::from_value(json).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_amounts_travel_as_decimal_strings() {
        let json = serde_json::to_value(event()).unwrap();
        assert_eq!(json["debt_purchase_amount"], "1500000000000000000000");
        assert!(json.get("received_token_address").is_none());

        let decoded: LiquidationEvent = serde_json::from_value(json).unwrap();
        assert_eq!(decoded.debt_purchase_amount, 1_500_000_000_000_000_000_000);
    }

    #[test]
    fn test_valid_replies_and_terminals() {
        assert!(Performative::SubscribeToLiquidationEvents.is_initial());
        assert!(!Performative::LiquidationEvent.is_initial());
        assert!(Performative::Error.is_terminal());
        assert_eq!(
            Performative::UnsubscribeFromLiquidationEvents.valid_replies(),
            &[Performative::Unsubscribed, Performative::Error]
        );
        assert!(Performative::Unsubscribed.valid_replies().is_empty());
    }

    #[test]
    fn test_dialogue_rejects_non_initial_opening() {
        let mut dialogue = LiquidationListenerDialogue::new(("client_1".to_string(), String::new()), Role::Client);
        let opening = LiquidationListenerMessage::new(
            ("client_1".to_string(), String::new()),
            1,
            0,
            Content::Unsubscribed,
        );
        assert_eq!(
            dialogue.update(Role::Client, opening),
            Err(ProtocolError::InvalidInitialPerformative(Performative::Unsubscribed))
        );
    }

    #[test]
    fn test_dialogue_rejects_invalid_reply() {
        let mut dialogue = LiquidationListenerDialogue::new(("client_1".to_string(), String::new()), Role::Client);
        dialogue.update(Role::Client, subscribe()).unwrap();

        let reply = LiquidationListenerMessage::new(
            ("client_1".to_string(), "server_1".to_string()),
            2,
            1,
            Content::Unsubscribed,
        );
        assert_eq!(
            dialogue.update(Role::Server, reply),
            Err(ProtocolError::InvalidReply {
                performative: Performative::Unsubscribed,
                target: Performative::SubscribeToLiquidationEvents,
            })
        );
        assert_eq!(dialogue.messages().count(), 1);
    }

    #[test]
    fn test_client_and_server_complete_subscription() {
        let mut client = LiquidationListenerDialogues::new("client");
        let mut server = LiquidationListenerDialogues::new("server");

        let request = client.create(Content::SubscribeToLiquidationEvents).unwrap();
        let starter = request.dialogue_reference.0.clone();
        assert_eq!(server.update(request).unwrap().self_role(), Role::Server);

        let reply = server.reply(&starter, Content::LiquidationEvent(event())).unwrap();
        assert_eq!((reply.message_id, reply.target), (2, 1));
        assert!(!reply.dialogue_reference.1.is_empty());

        let dialogue = client.update(reply).unwrap();
        assert!(dialogue.is_terminated());
        assert_eq!(dialogue.end_state(), Some(EndState::Successful));
        assert_eq!(client.successful(), 1);

        let late = LiquidationListenerMessage::new(
            (starter.clone(), "server_1".to_string()),
            3,
            2,
            Content::Unsubscribed,
        );
        assert!(matches!(client.update(late), Err(ProtocolError::Terminated(_))));

        assert_eq!(client.prune_terminated(), 1);
        assert!(client.is_empty());
    }

    #[test]
    fn test_error_reply_is_terminal_but_not_successful() {
        let mut client = LiquidationListenerDialogues::new("client");
        let mut server = LiquidationListenerDialogues::new("server");

        let request = client.create(Content::UnsubscribeFromLiquidationEvents).unwrap();
        let starter = request.dialogue_reference.0.clone();
        server.update(request).unwrap();
        let reply = server
            .reply(
                &starter,
                Content::Error {
                    error_code: ErrorCode(1),
                    error_msg: "not subscribed".to_string(),
                    error_data: BTreeMap::new(),
                },
            )
            .unwrap();

        let dialogue = client.update(reply).unwrap();
        assert!(dialogue.is_terminated());
        assert_eq!(dialogue.end_state(), None);
        assert_eq!(client.successful(), 0);
    }

    #[test]
    fn test_server_cannot_open_dialogue() {
        let mut dialogue = LiquidationListenerDialogue::new(("server_1".to_string(), String::new()), Role::Server);
        let opening = LiquidationListenerMessage::new(
            ("server_1".to_string(), String::new()),
            1,
            0,
            Content::SubscribeToLiquidationEvents,
        );
        assert_eq!(dialogue.update(Role::Server, opening), Err(ProtocolError::WrongSender(Role::Server)));
    }
}

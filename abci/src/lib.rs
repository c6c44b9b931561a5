//! # Round ABCI - Replicated Round Engine
//!
//! This library provides a deterministic, replicated state machine for groups of
//! autonomous agents. Every agent runs the same application; the consensus layer
//! delivers the same ordered blocks of payloads to each of them, so every replica
//! walks through the same rounds and ends up with the same synchronized data.
//!
//! ## Architecture
//!
//! The engine is built from a handful of layers, leaves first:
//!
//! - **SynchronizedData**: versioned, per-period key/value store shared by all replicas
//! - **Payload**: the single value a participant submits to a round
//! - **Round**: one state of the machine, aggregating payloads with an archetype
//!   (collect-same, collect-different, keeper-only, voting, degenerate, custom)
//! - **AbciApp**: the transition table `(round, event) -> round`, its timeouts and
//!   the runtime that consumes blocks
//! - **Behaviour**: the local, asynchronous work an agent performs in a round
//! - **RoundBehaviour**: the per-tick driver keeping the active behaviour aligned
//!   with the active round
//!
//! ## Usage
//!
//! ```rust,ignore
//! use round_abci::{AbciApp, AbciAppSpec, CollectConfig, RoundSpec};
//!
//! let spec = AbciAppSpec::builder("counter")
//!     .round(RoundSpec::collect_same_until_all(
//!         "count",
//!         CollectConfig::new(Event::Done).with_payload_attribute("value"),
//!     ))
//!     .round(RoundSpec::degenerate("finished"))
//!     .initial_round("count")
//!     .final_state("finished")
//!     .transition("count", Event::Done, "finished")
//!     .build()?;
//!
//! let mut app = AbciApp::new(Arc::new(spec), setup, genesis)?;
//! app.process_block(&block)?;
//! ```

#![warn(clippy::all)]
#![allow(clippy::large_enum_variant)]

use std::fmt::{Debug, Display};
use std::hash::Hash;

pub mod app;
pub mod behaviour;
pub mod config;
pub mod payload;
pub mod round_behaviour;
pub mod rounds;
pub mod synchronized_data;
pub mod transport;

#[cfg(any(test, feature = "test-tools"))]
pub mod test_tools;

pub use app::{AbciApp, AbciAppSpec, AbciAppSpecBuilder, AppOptions, Block, Transition};
pub use behaviour::{
    AgentContext, Behaviour, BehaviourContext, BehaviourError, ConsensusTransport, ContractApi,
    ContractCall, DegenerateBehaviour, ExternalCallError, HttpClient, HttpRequest, HttpResponse,
    RawTransaction, RoundInfo,
};
pub use crate::config::{AbciParams, ConfigError};
pub use payload::{Payload, PayloadError};
pub use round_behaviour::RoundBehaviour;
pub use rounds::{
    consensus_threshold, Aggregation, CollectConfig, KeeperConfig, Round, RoundContext,
    RoundSpec, RoundStrategy, VotingConfig,
};
pub use synchronized_data::{AbciAppDb, DbError, SynchronizedData};
pub use transport::LocalTransport;

/// Participant address as known to the consensus layer
pub type Address = String;

/// Round identifier, unique within an application
pub type RoundId = &'static str;

/// Marker trait for application event enums.
///
/// Events label the edges of the transition table. They must be totally
/// ordered so that timeouts firing at the same instant resolve identically on
/// every replica.
pub trait AppEvent: Copy + Ord + Hash + Debug + Display + Send + Sync + 'static {}

impl<T> AppEvent for T where T: Copy + Ord + Hash + Debug + Display + Send + Sync + 'static {}

/// Fatal engine errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AbciError {
    /// The transition table failed static validation
    #[error("Invalid application specification: {0}")]
    InvalidSpec(String),

    /// An event was raised that the current round does not declare
    #[error("Event {event} is not a declared transition of round {round}")]
    InvalidTransition { round: RoundId, event: String },

    /// A round id was referenced that the application does not declare
    #[error("Round {0} is not declared")]
    UnknownRound(String),

    #[error("Pre-condition of round {round} violated: key `{key}` is not set")]
    PreConditionViolated { round: RoundId, key: String },

    #[error("Post-condition of round {round} violated: key `{key}` is not set")]
    PostConditionViolated { round: RoundId, key: String },

    /// A degenerate round was asked to make progress
    #[error("Round {0} is degenerate and cannot be operated")]
    DegenerateRound(RoundId),

    #[error(transparent)]
    Db(#[from] DbError),
}

/// Result type for engine operations
pub type AbciResult<T> = Result<T, AbciError>;

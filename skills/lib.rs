//! # AEA Skills - Agent Applications on the Round Engine
//!
//! Applications built with `round-abci`. Each skill declares its rounds and
//! transition table, the behaviours agents run in every round, and a
//! constructor for the per-agent [`round_abci::RoundBehaviour`].
//!
//! ## Skills
//!
//! - **liquidation_station**: finds under-collateralised lending positions
//!   and prepares their liquidation, one period per sweep
//! - **rysk_roller**: gathers option market data and routes the allocation
//!   decision of a caller supplied strategy
//! - **liquidation_listener**: message and dialogue rules of the liquidation
//!   event subscription protocol
//! - **contract_subscription**: one-shot `eth_subscribe` request for the logs
//!   of a configured contract
//!
//! ## Usage
//!
//! ```rust,ignore
//! use aea_skills::liquidation_station;
//!
//! let params = AbciParams::load("agent.toml")?;
//! let spec = Arc::new(liquidation_station::abci_app_spec(&params)?);
//! let app = AbciApp::with_options(Arc::clone(&spec), params.setup_data(), now, params.app_options())?;
//! let driver = liquidation_station::round_behaviour(&spec, agent)?;
//! ```

#![warn(clippy::all)]

use serde_json::Value;

pub mod contract_subscription;
pub mod liquidation_listener;
pub mod liquidation_station;
pub mod rysk_roller;

/// Token amount from a contract or subgraph value: an unsigned integer or
/// its decimal string
pub fn parse_amount(value: &Value) -> Option<u128> {
    match value {
        Value::Number(number) => number.as_u64().map(u128::from),
        Value::String(text) => text.parse().ok(),
        _ => None,
    }
}

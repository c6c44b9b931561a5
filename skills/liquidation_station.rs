//! # Liquidation Station
//!
//! Periodic sweep over the borrowers of a Compound-style lending market.
//! Every period the agents agree on the open positions, on the subset whose
//! collateral no longer covers their debt, and on the liquidation
//! transactions to submit for them, then pause before the next sweep.
//!
//! ## Transition Table
//!
//! ```text
//! registration                          --done-->          collect_positions
//! collect_positions                     --done-->          calculate_position_health
//! calculate_position_health             --done-->          prepare_liquidation_transactions
//! prepare_liquidation_transactions      --done-->          submit_position_liquidation_transactions
//! submit_position_liquidation_transactions --done|not_triggered--> reset_and_pause
//! reset_and_pause                       --done-->          collect_positions (next period)
//! collect/calculate/prepare             --round_timeout|no_majority--> reset_and_pause
//! reset_and_pause                       --no_majority|reset_timeout--> reset_and_pause
//! ```
//!
//! ## Skill Parameters
//!
//! - `comptroller_address`: unitroller of the lending market
//! - `subgraph_url`, `positions_query`: source of borrower accounts
//! - `debt_market`, `collateral_market`: oToken markets liquidations use
//! - `reset_pause_ms`: pause before proposing the next period (optional)

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use round_abci::{
    AbciAppSpec, AbciParams, AbciResult, AgentContext, Behaviour, BehaviourContext, BehaviourError,
    CollectConfig, ContractCall, HttpRequest, Payload, PayloadError, RoundBehaviour, RoundContext, RoundId,
    RoundSpec, RoundStrategy, SynchronizedData,
};

use crate::parse_amount;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Event {
    Done,
    NotTriggered,
    RoundTimeout,
    NoMajority,
    ResetTimeout,
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Done => "done",
            Self::NotTriggered => "not_triggered",
            Self::RoundTimeout => "round_timeout",
            Self::NoMajority => "no_majority",
            Self::ResetTimeout => "reset_timeout",
        };
        f.write_str(name)
    }
}

pub const REGISTRATION_ROUND: RoundId = "registration";
pub const COLLECT_POSITIONS_ROUND: RoundId = "collect_positions";
pub const CALCULATE_POSITION_HEALTH_ROUND: RoundId = "calculate_position_health";
pub const PREPARE_LIQUIDATION_TRANSACTIONS_ROUND: RoundId = "prepare_liquidation_transactions";
pub const SUBMIT_POSITION_LIQUIDATION_TRANSACTIONS_ROUND: RoundId = "submit_position_liquidation_transactions";
pub const RESET_AND_PAUSE_ROUND: RoundId = "reset_and_pause";

pub const COMPTROLLER_KEY: &str = "comptroller_address";
pub const POSITIONS_KEY: &str = "positions";
pub const UNHEALTHY_POSITIONS_KEY: &str = "unhealthy_positions";
pub const LIQUIDATION_TRANSACTIONS_KEY: &str = "liquidation_transactions";
pub const SUBMITTED_TRANSACTIONS_KEY: &str = "submitted_transactions";

const UNITROLLER_CONTRACT_ID: &str = "zarathustra/unitroller:0.1.0";
const OTOKEN_CONTRACT_ID: &str = "zarathustra/otoken:0.1.0";

/// Skill parameters read from the agent's `skill` table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiquidationStationParams {
    pub comptroller_address: String,
    pub subgraph_url: String,
    #[serde(default = "default_positions_query")]
    pub positions_query: String,
    pub debt_market: String,
    pub collateral_market: String,
    #[serde(default)]
    pub reset_pause_ms: u64,
}

fn default_positions_query() -> String {
    "{ accounts(where: { hasBorrowed: true }) { id } }".to_string()
}

impl LiquidationStationParams {
    pub fn from_context(ctx: &BehaviourContext) -> Result<Self, BehaviourError> {
        serde_json::from_value(Value::Object(ctx.params().clone())).map_err(|e| BehaviourError::InvalidParam {
            key: "skill".to_string(),
            reason: e.to_string(),
        })
    }
}

/// Borrower whose collateral no longer covers its debt
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UnhealthyPosition {
    pub account: String,
    /// Decimal string, base units
    pub shortfall: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiquidationTransaction {
    pub borrower: String,
    pub repay_amount: String,
    pub transaction: Value,
}

/// Submission outcome: `not_triggered` once the agreed list is empty
#[derive(Debug, Default)]
pub struct SubmitLiquidationsStrategy;

impl RoundStrategy<Event> for SubmitLiquidationsStrategy {
    fn check_payload(&self, _ctx: &RoundContext<'_>, payload: &Payload) -> Result<(), PayloadError> {
        match payload.attribute(Some("transactions")) {
            Some(Value::Array(_)) => Ok(()),
            _ => Err(PayloadError::Invalid("expected a `transactions` list".to_string())),
        }
    }

    fn end_block(&self, ctx: &RoundContext<'_>) -> AbciResult<Option<(SynchronizedData, Event)>> {
        let Some((agreed, count)) = ctx.most_voted(Some("transactions")) else {
            return Ok(None);
        };
        if count < ctx.threshold {
            return Ok(None);
        }
        if agreed.as_array().is_some_and(|transactions| transactions.is_empty()) {
            return Ok(Some((ctx.synchronized_data.clone(), Event::NotTriggered)));
        }
        let data = ctx
            .synchronized_data
            .update([(SUBMITTED_TRANSACTIONS_KEY, agreed.clone())])?;
        Ok(Some((data, Event::Done)))
    }

    fn declared_events(&self) -> Vec<Event> {
        vec![Event::Done, Event::NotTriggered]
    }
}

/// Agreement on the period being closed opens the next one
#[derive(Debug, Default)]
pub struct ResetAndPauseStrategy;

impl RoundStrategy<Event> for ResetAndPauseStrategy {
    fn check_payload(&self, _ctx: &RoundContext<'_>, payload: &Payload) -> Result<(), PayloadError> {
        match payload.attribute(Some("period_count")).and_then(Value::as_u64) {
            Some(_) => Ok(()),
            None => Err(PayloadError::Invalid("expected a numeric `period_count`".to_string())),
        }
    }

    fn end_block(&self, ctx: &RoundContext<'_>) -> AbciResult<Option<(SynchronizedData, Event)>> {
        if let Some((agreed, count)) = ctx.most_voted(Some("period_count")) {
            if count >= ctx.threshold {
                if agreed.as_u64() != Some(ctx.synchronized_data.period_count()) {
                    warn!(%agreed, "Agents agreed on a stale period");
                    return Ok(Some((ctx.synchronized_data.clone(), Event::NoMajority)));
                }
                let next = ctx.synchronized_data.create_new_period()?;
                return Ok(Some((next, Event::Done)));
            }
        }
        if !ctx.is_majority_possible(Some("period_count")) {
            return Ok(Some((ctx.synchronized_data.clone(), Event::NoMajority)));
        }
        Ok(None)
    }

    fn declared_events(&self) -> Vec<Event> {
        vec![Event::Done, Event::NoMajority]
    }
}

/// Transition table with timeouts taken from `params`
pub fn abci_app_spec(params: &AbciParams) -> AbciResult<AbciAppSpec<Event>> {
    let collect = |key: &str| {
        CollectConfig::new(Event::Done)
            .with_no_majority_event(Event::NoMajority)
            .with_payload_attribute(key)
            .with_selection_key(key)
    };

    AbciAppSpec::builder("LiquidationStationAbciApp")
        .round(RoundSpec::collect_same_until_all(
            REGISTRATION_ROUND,
            CollectConfig::new(Event::Done)
                .with_payload_attribute(COMPTROLLER_KEY)
                .with_selection_key(COMPTROLLER_KEY),
        ))
        .round(RoundSpec::collect_same_until_threshold(
            COLLECT_POSITIONS_ROUND,
            collect(POSITIONS_KEY),
        ))
        .round(RoundSpec::collect_same_until_threshold(
            CALCULATE_POSITION_HEALTH_ROUND,
            collect(UNHEALTHY_POSITIONS_KEY),
        ))
        .round(RoundSpec::collect_same_until_threshold(
            PREPARE_LIQUIDATION_TRANSACTIONS_ROUND,
            collect(LIQUIDATION_TRANSACTIONS_KEY),
        ))
        .round(RoundSpec::custom(
            SUBMIT_POSITION_LIQUIDATION_TRANSACTIONS_ROUND,
            || SubmitLiquidationsStrategy,
        ))
        .round(RoundSpec::custom(RESET_AND_PAUSE_ROUND, || ResetAndPauseStrategy))
        .initial_round(REGISTRATION_ROUND)
        .transition(REGISTRATION_ROUND, Event::Done, COLLECT_POSITIONS_ROUND)
        .transition(COLLECT_POSITIONS_ROUND, Event::Done, CALCULATE_POSITION_HEALTH_ROUND)
        .transition(COLLECT_POSITIONS_ROUND, Event::RoundTimeout, RESET_AND_PAUSE_ROUND)
        .transition(COLLECT_POSITIONS_ROUND, Event::NoMajority, RESET_AND_PAUSE_ROUND)
        .transition(CALCULATE_POSITION_HEALTH_ROUND, Event::Done, PREPARE_LIQUIDATION_TRANSACTIONS_ROUND)
        .transition(CALCULATE_POSITION_HEALTH_ROUND, Event::RoundTimeout, RESET_AND_PAUSE_ROUND)
        .transition(CALCULATE_POSITION_HEALTH_ROUND, Event::NoMajority, RESET_AND_PAUSE_ROUND)
        .transition(
            PREPARE_LIQUIDATION_TRANSACTIONS_ROUND,
            Event::Done,
            SUBMIT_POSITION_LIQUIDATION_TRANSACTIONS_ROUND,
        )
        .transition(PREPARE_LIQUIDATION_TRANSACTIONS_ROUND, Event::RoundTimeout, RESET_AND_PAUSE_ROUND)
        .transition(PREPARE_LIQUIDATION_TRANSACTIONS_ROUND, Event::NoMajority, RESET_AND_PAUSE_ROUND)
        .transition(SUBMIT_POSITION_LIQUIDATION_TRANSACTIONS_ROUND, Event::Done, RESET_AND_PAUSE_ROUND)
        .transition(
            SUBMIT_POSITION_LIQUIDATION_TRANSACTIONS_ROUND,
            Event::NotTriggered,
            RESET_AND_PAUSE_ROUND,
        )
        .transition(RESET_AND_PAUSE_ROUND, Event::Done, COLLECT_POSITIONS_ROUND)
        .transition(RESET_AND_PAUSE_ROUND, Event::NoMajority, RESET_AND_PAUSE_ROUND)
        .transition(RESET_AND_PAUSE_ROUND, Event::ResetTimeout, RESET_AND_PAUSE_ROUND)
        .event_timeout(Event::RoundTimeout, params.round_timeout())
        .event_timeout(Event::ResetTimeout, params.reset_timeout())
        .build()
}

/// Agrees on the comptroller every agent is configured with
#[derive(Debug, Default)]
pub struct RegistrationBehaviour;

#[async_trait]
impl Behaviour for RegistrationBehaviour {
    fn behaviour_id(&self) -> &str {
        "registration_behaviour"
    }

    fn matching_round(&self) -> RoundId {
        REGISTRATION_ROUND
    }

    async fn act(&self, ctx: &BehaviourContext) -> Result<(), BehaviourError> {
        let comptroller: String = ctx.param(COMPTROLLER_KEY)?;
        ctx.send_a2a_transaction(json!({ COMPTROLLER_KEY: comptroller })).await?;
        ctx.wait_until_round_end().await;
        Ok(())
    }
}

/// Queries the subgraph for every account holding a borrow
#[derive(Debug, Default)]
pub struct CollectPositionsBehaviour;

#[async_trait]
impl Behaviour for CollectPositionsBehaviour {
    fn behaviour_id(&self) -> &str {
        "collect_positions_behaviour"
    }

    fn matching_round(&self) -> RoundId {
        COLLECT_POSITIONS_ROUND
    }

    async fn act(&self, ctx: &BehaviourContext) -> Result<(), BehaviourError> {
        let params = LiquidationStationParams::from_context(ctx)?;
        let request = HttpRequest::post_json(&params.subgraph_url, &json!({ "query": params.positions_query }));
        let response: Value = ctx.get_http_response(request).await?.json()?;

        let accounts = response
            .pointer("/data/accounts")
            .and_then(Value::as_array)
            .ok_or_else(|| BehaviourError::Failed("subgraph response has no `data.accounts`".to_string()))?;
        let mut positions: Vec<String> = accounts
            .iter()
            .filter_map(|account| account.get("id").and_then(Value::as_str))
            .map(str::to_lowercase)
            .collect();
        positions.sort();
        positions.dedup();
        info!(positions = positions.len(), "Collected borrower positions");

        ctx.send_a2a_transaction(json!({ POSITIONS_KEY: positions })).await?;
        ctx.wait_until_round_end().await;
        Ok(())
    }
}

/// Asks the comptroller for the liquidity of every agreed position
#[derive(Debug, Default)]
pub struct CalculatePositionHealthBehaviour;

#[async_trait]
impl Behaviour for CalculatePositionHealthBehaviour {
    fn behaviour_id(&self) -> &str {
        "calculate_position_health_behaviour"
    }

    fn matching_round(&self) -> RoundId {
        CALCULATE_POSITION_HEALTH_ROUND
    }

    async fn act(&self, ctx: &BehaviourContext) -> Result<(), BehaviourError> {
        let params = LiquidationStationParams::from_context(ctx)?;
        let positions: Vec<String> = ctx.synchronized_data().get_strict(POSITIONS_KEY)?;

        let mut unhealthy = Vec::new();
        for account in positions {
            let call = ContractCall::new(UNITROLLER_CONTRACT_ID, &params.comptroller_address, "get_account_liquidity")
                .with_kwarg("account", json!(account));
            let liquidity = ctx.get_contract_state(call).await?;
            if liquidity.get("error").and_then(Value::as_u64).unwrap_or(0) != 0 {
                warn!(%account, ?liquidity, "Comptroller reported an error, skipping account");
                continue;
            }
            let shortfall = liquidity.get("shortfall").and_then(parse_amount).unwrap_or(0);
            if shortfall > 0 {
                debug!(%account, shortfall, "Position under water");
                unhealthy.push(UnhealthyPosition {
                    account,
                    shortfall: shortfall.to_string(),
                });
            }
        }
        info!(unhealthy = unhealthy.len(), "Calculated position health");

        ctx.send_a2a_transaction(json!({ UNHEALTHY_POSITIONS_KEY: unhealthy })).await?;
        ctx.wait_until_round_end().await;
        Ok(())
    }
}

/// Builds a `liquidate_borrow` transaction for every position the
/// comptroller allows to be liquidated
#[derive(Debug, Default)]
pub struct PrepareLiquidationTransactionsBehaviour;

#[async_trait]
impl Behaviour for PrepareLiquidationTransactionsBehaviour {
    fn behaviour_id(&self) -> &str {
        "prepare_liquidation_transactions_behaviour"
    }

    fn matching_round(&self) -> RoundId {
        PREPARE_LIQUIDATION_TRANSACTIONS_ROUND
    }

    async fn act(&self, ctx: &BehaviourContext) -> Result<(), BehaviourError> {
        let params = LiquidationStationParams::from_context(ctx)?;
        let unhealthy: Vec<UnhealthyPosition> = ctx.synchronized_data().get_strict(UNHEALTHY_POSITIONS_KEY)?;

        let mut transactions = Vec::new();
        for position in unhealthy {
            let allowed = ctx
                .get_contract_state(
                    ContractCall::new(UNITROLLER_CONTRACT_ID, &params.comptroller_address, "liquidate_borrow_allowed")
                        .with_kwarg("o_token_borrowed", json!(params.debt_market))
                        .with_kwarg("o_token_collateral", json!(params.collateral_market))
                        .with_kwarg("liquidator", json!(ctx.agent_address()))
                        .with_kwarg("borrower", json!(position.account))
                        .with_kwarg("repay_amount", json!(position.shortfall)),
                )
                .await?;
            if allowed.get("error").and_then(Value::as_u64) != Some(0) {
                debug!(account = %position.account, ?allowed, "Liquidation not allowed");
                continue;
            }

            let raw = ctx
                .get_raw_transaction(
                    ContractCall::new(OTOKEN_CONTRACT_ID, &params.debt_market, "liquidate_borrow")
                        .with_kwarg("borrower", json!(position.account))
                        .with_kwarg("repay_amount", json!(position.shortfall))
                        .with_kwarg("o_token_collateral", json!(params.collateral_market)),
                )
                .await?;
            transactions.push(LiquidationTransaction {
                borrower: position.account,
                repay_amount: position.shortfall,
                transaction: raw.body,
            });
        }
        info!(transactions = transactions.len(), "Prepared liquidation transactions");

        ctx.send_a2a_transaction(json!({ LIQUIDATION_TRANSACTIONS_KEY: transactions }))
            .await?;
        ctx.wait_until_round_end().await;
        Ok(())
    }
}

/// Proposes the agreed liquidation transactions for settlement
#[derive(Debug, Default)]
pub struct SubmitPositionLiquidationTransactionsBehaviour;

#[async_trait]
impl Behaviour for SubmitPositionLiquidationTransactionsBehaviour {
    fn behaviour_id(&self) -> &str {
        "submit_position_liquidation_transactions_behaviour"
    }

    fn matching_round(&self) -> RoundId {
        SUBMIT_POSITION_LIQUIDATION_TRANSACTIONS_ROUND
    }

    async fn act(&self, ctx: &BehaviourContext) -> Result<(), BehaviourError> {
        let transactions: Vec<Value> = ctx
            .synchronized_data()
            .get_optional(LIQUIDATION_TRANSACTIONS_KEY)?
            .unwrap_or_default();
        if transactions.is_empty() {
            info!("No liquidation to submit");
        }
        ctx.send_a2a_transaction(json!({ "transactions": transactions })).await?;
        ctx.wait_until_round_end().await;
        Ok(())
    }
}

/// Pauses, then votes to close the current period
#[derive(Debug, Default)]
pub struct ResetAndPauseBehaviour;

#[async_trait]
impl Behaviour for ResetAndPauseBehaviour {
    fn behaviour_id(&self) -> &str {
        "reset_and_pause_behaviour"
    }

    fn matching_round(&self) -> RoundId {
        RESET_AND_PAUSE_ROUND
    }

    async fn act(&self, ctx: &BehaviourContext) -> Result<(), BehaviourError> {
        let pause: u64 = ctx.params().get("reset_pause_ms").and_then(Value::as_u64).unwrap_or(0);
        if pause > 0 {
            tokio::time::sleep(Duration::from_millis(pause)).await;
        }
        info!(period = ctx.period_count(), "Closing period");
        ctx.send_a2a_transaction(json!({ "period_count": ctx.period_count() })).await?;
        ctx.wait_until_round_end().await;
        Ok(())
    }
}

pub fn behaviours() -> Vec<Arc<dyn Behaviour>> {
    vec![
        Arc::new(RegistrationBehaviour),
        Arc::new(CollectPositionsBehaviour),
        Arc::new(CalculatePositionHealthBehaviour),
        Arc::new(PrepareLiquidationTransactionsBehaviour),
        Arc::new(SubmitPositionLiquidationTransactionsBehaviour),
        Arc::new(ResetAndPauseBehaviour),
    ]
}

pub fn round_behaviour(spec: &AbciAppSpec<Event>, agent: AgentContext) -> AbciResult<RoundBehaviour> {
    RoundBehaviour::new(spec, behaviours(), agent)
}

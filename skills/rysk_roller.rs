//! # Rysk Roller
//!
//! Options vault roller. Agents gather subgraph series, wallet balances and
//! vault quotes, agree on an allocation decision and route the period to the
//! settlement or selling branch it names. Selling and swapping happen in
//! downstream apps chained on the four final rounds.
//!
//! ## Key Features
//!
//! - **Pluggable decisions**: the choice of branch comes from a
//!   [`StrategyDecider`]; [`BalanceThresholdDecider`] sells whichever asset
//!   holds more than its configured floor
//! - **Quote collection**: buyable and sellable series are priced through the
//!   vault's `quote_option_price`
//! - **Market naming**: [`to_human_format`] renders series as
//!   `ETH-16MAY23-1550-C`

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use round_abci::{
    AbciAppSpec, AbciResult, AgentContext, Behaviour, BehaviourContext, BehaviourError, CollectConfig, ContractCall,
    HttpRequest, Payload, PayloadError, RoundBehaviour, RoundContext, RoundId, RoundSpec, RoundStrategy,
    SynchronizedData,
};

use crate::parse_amount;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Event {
    PutExercised,
    CallExpired,
    NotDone,
    Error,
    UnderAllocated,
    SwapFromUsdcToEth,
    CallExercised,
    SwapFromEthToUsdc,
    Done,
    PutExpired,
    SellCallOption,
    SellPutOption,
}

impl Event {
    pub const ALL: [Event; 12] = [
        Event::PutExercised,
        Event::CallExpired,
        Event::NotDone,
        Event::Error,
        Event::UnderAllocated,
        Event::SwapFromUsdcToEth,
        Event::CallExercised,
        Event::SwapFromEthToUsdc,
        Event::Done,
        Event::PutExpired,
        Event::SellCallOption,
        Event::SellPutOption,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PutExercised => "put_exercised",
            Self::CallExpired => "call_expired",
            Self::NotDone => "not_done",
            Self::Error => "error",
            Self::UnderAllocated => "under_allocated",
            Self::SwapFromUsdcToEth => "swap_from_usdc_to_eth",
            Self::CallExercised => "call_exercised",
            Self::SwapFromEthToUsdc => "swap_from_eth_to_usdc",
            Self::Done => "done",
            Self::PutExpired => "put_expired",
            Self::SellCallOption => "sell_call_option",
            Self::SellPutOption => "sell_put_option",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|event| event.as_str() == name)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub const COLLECT_DATA_ROUND: RoundId = "collect_data";
pub const COLLECT_PRICE_DATA_ROUND: RoundId = "collect_price_data";
pub const ANALYSE_DATA_ROUND: RoundId = "analyse_data";
pub const MULTIPLEXER_ROUND: RoundId = "multiplexer";
pub const PUT_EXPIRED_ROUND: RoundId = "put_expired";
pub const CALL_EXPIRED_ROUND: RoundId = "call_expired";
pub const PUT_EXERCISED_ROUND: RoundId = "put_exercised";
pub const CALL_EXERCISED_ROUND: RoundId = "call_exercised";
pub const UNDER_ALLOCATED_ROUND: RoundId = "under_allocated";
pub const SELL_CALL_OPTION_ROUND: RoundId = "sell_call_option";
pub const SELL_PUT_OPTION_ROUND: RoundId = "sell_put_option";
pub const SWAP_FROM_ETH_TO_USDC_ROUND: RoundId = "swap_from_eth_to_usdc";
pub const SWAP_FROM_USDC_TO_ETH_ROUND: RoundId = "swap_from_usdc_to_eth";

pub const RYSK_DATA_KEY: &str = "rysk_data";
pub const PRICE_DATA_KEY: &str = "price_data";
pub const ANALYSIS_KEY: &str = "analysis";
pub const DECISION_KEY: &str = "decision";
pub const SETTLEMENT_KEY: &str = "settlement";
pub const STRATEGY_ACTION_KEY: &str = "strategy_action";

const ERC20_CONTRACT_ID: &str = "valory/uniswap_v2_erc20:0.1.0";
const VAULT_CONTRACT_ID: &str = "zarathustra/homm_vault:0.1.0";

/// 1e18, the fixed point scale of strikes and quote amounts
pub const PRICE_DIVISOR: u128 = 1_000_000_000_000_000_000;

pub const DEFAULT_UNDERLYING_ADDRESS: &str = "0x3b3a1dE07439eeb04492Fa64A889eE25A130CDd3";
pub const DEFAULT_STRIKE_ASSET_ADDRESS: &str = "0x408c5755b5c7a0a28D851558eA3636CfC5b5b19d";

/// Allocation codes agreed in the under-allocated round
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StrategyAction {
    SellCall = 1,
    SellPut = 2,
    SwapUsdcToEth = 3,
    SwapEthToUsdc = 4,
    Hold = 5,
}

impl StrategyAction {
    pub fn code(self) -> u64 {
        self as u64
    }

    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            1 => Some(Self::SellCall),
            2 => Some(Self::SellPut),
            3 => Some(Self::SwapUsdcToEth),
            4 => Some(Self::SwapEthToUsdc),
            5 => Some(Self::Hold),
            _ => None,
        }
    }

    /// Branch the multiplexer takes for this action
    pub fn event(self) -> Event {
        match self {
            Self::SellCall => Event::SellCallOption,
            Self::SellPut => Event::SellPutOption,
            Self::SwapUsdcToEth => Event::PutExercised,
            Self::SwapEthToUsdc => Event::CallExercised,
            Self::Hold => Event::NotDone,
        }
    }
}

/// Open positions that need attention before new options are sold
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    PutExpired,
    PutExercised,
    CallExpired,
    CallExercised,
    UnderAllocated,
}

impl Settlement {
    pub fn event(self) -> Event {
        match self {
            Self::PutExpired => Event::PutExpired,
            Self::PutExercised => Event::PutExercised,
            Self::CallExpired => Event::CallExpired,
            Self::CallExercised => Event::CallExercised,
            Self::UnderAllocated => Event::UnderAllocated,
        }
    }
}

/// Agreed market snapshot of one period
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RyskData {
    /// Asset name to balance in base units, as decimal strings
    pub balances: BTreeMap<String, String>,
    pub subgraph: Value,
}

impl RyskData {
    pub fn balance(&self, asset: &str) -> u128 {
        self.balances.get(asset).and_then(|b| b.parse().ok()).unwrap_or(0)
    }

    pub fn series(&self) -> Vec<Value> {
        self.subgraph
            .get("series")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default()
    }
}

/// Trading decisions of the roller. Every agent must run the same decider
/// for the decision round to reach agreement.
pub trait StrategyDecider: Send + Sync {
    /// Open position to settle first, if any
    fn settlement(&self, _data: &RyskData) -> Option<Settlement> {
        None
    }

    fn allocate(&self, data: &RyskData) -> StrategyAction;
}

/// Sells calls while WETH sits above its floor, puts while USDC does
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BalanceThresholdDecider {
    pub min_weth: u128,
    pub min_usdc: u128,
}

impl BalanceThresholdDecider {
    pub fn new(min_weth: u128, min_usdc: u128) -> Self {
        Self { min_weth, min_usdc }
    }

    /// Read `min_weth` and `min_usdc` from skill parameters
    pub fn from_params(params: &Map<String, Value>) -> Result<Self, BehaviourError> {
        let floor = |key: &str| {
            let value = params.get(key).ok_or_else(|| BehaviourError::MissingParam(key.to_string()))?;
            parse_amount(value).ok_or_else(|| BehaviourError::InvalidParam {
                key: key.to_string(),
                reason: format!("expected an unsigned amount, found {value}"),
            })
        };
        Ok(Self::new(floor("min_weth")?, floor("min_usdc")?))
    }
}

impl StrategyDecider for BalanceThresholdDecider {
    fn allocate(&self, data: &RyskData) -> StrategyAction {
        if data.balance("WETH") > self.min_weth {
            info!(weth = data.balance("WETH"), "Available WETH funds");
            StrategyAction::SellCall
        } else if data.balance("USDC") > self.min_usdc {
            info!(usdc = data.balance("USDC"), "Available USDC funds");
            StrategyAction::SellPut
        } else {
            info!(balances = ?data.balances, "No funds available");
            StrategyAction::Hold
        }
    }
}

/// Skill parameters read from the agent's `skill` table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RyskRollerParams {
    pub subgraph_url: String,
    pub subgraph_query: String,
    /// Asset name to ERC-20 address
    pub option_assets: BTreeMap<String, String>,
    pub vault_address: String,
    #[serde(default = "default_underlying")]
    pub underlying_address: String,
    #[serde(default = "default_strike_asset")]
    pub strike_asset_address: String,
    #[serde(default = "default_strike_asset")]
    pub collateral_address: String,
}

fn default_underlying() -> String {
    DEFAULT_UNDERLYING_ADDRESS.to_string()
}

fn default_strike_asset() -> String {
    DEFAULT_STRIKE_ASSET_ADDRESS.to_string()
}

impl RyskRollerParams {
    pub fn from_context(ctx: &BehaviourContext) -> Result<Self, BehaviourError> {
        serde_json::from_value(Value::Object(ctx.params().clone())).map_err(|e| BehaviourError::InvalidParam {
            key: "skill".to_string(),
            reason: e.to_string(),
        })
    }
}

/// Market name of a subgraph series in the unified exchange format,
/// e.g. `ETH-16MAY23-1550-C`
pub fn to_human_format(row: &Value) -> Option<String> {
    let expiration = row.get("expiration").and_then(parse_amount)?;
    let expiration = Utc.timestamp_opt(i64::try_from(expiration).ok()?, 0).single()?;
    let strike = row.get("strike").and_then(parse_amount)? / PRICE_DIVISOR;
    let kind = if row.get("isPut").and_then(Value::as_bool)? { "P" } else { "C" };
    Some(format!(
        "ETH-{}-{strike}-{kind}",
        expiration.format("%d%b%y").to_string().to_uppercase()
    ))
}

/// Routes the agreed decision name to its branch; unknown names and split
/// votes both fall back to `error`
#[derive(Debug, Default)]
pub struct MultiplexerStrategy;

impl RoundStrategy<Event> for MultiplexerStrategy {
    fn check_payload(&self, _ctx: &RoundContext<'_>, payload: &Payload) -> Result<(), PayloadError> {
        match payload.attribute(Some(DECISION_KEY)) {
            Some(Value::String(_)) => Ok(()),
            _ => Err(PayloadError::Invalid(format!("expected a `{DECISION_KEY}` name"))),
        }
    }

    fn end_block(&self, ctx: &RoundContext<'_>) -> AbciResult<Option<(SynchronizedData, Event)>> {
        let entry = ctx.synchronized_data;
        if let Some((decision, count)) = ctx.most_voted(Some(DECISION_KEY)) {
            if count >= ctx.threshold {
                let event = decision
                    .as_str()
                    .and_then(Event::from_name)
                    .filter(|event| self.declared_events().contains(event))
                    .unwrap_or(Event::Error);
                let data = entry.update([(DECISION_KEY, json!(event.as_str()))])?;
                return Ok(Some((data, event)));
            }
        }
        if !ctx.is_majority_possible(Some(DECISION_KEY)) {
            return Ok(Some((entry.clone(), Event::Error)));
        }
        Ok(None)
    }

    fn declared_events(&self) -> Vec<Event> {
        vec![
            Event::NotDone,
            Event::Error,
            Event::PutExpired,
            Event::PutExercised,
            Event::CallExpired,
            Event::CallExercised,
            Event::UnderAllocated,
            Event::SellPutOption,
            Event::SellCallOption,
        ]
    }
}

/// Agreement on a selling action for idle funds
#[derive(Debug, Default)]
pub struct UnderAllocatedStrategy;

impl RoundStrategy<Event> for UnderAllocatedStrategy {
    fn check_payload(&self, _ctx: &RoundContext<'_>, payload: &Payload) -> Result<(), PayloadError> {
        let action = payload
            .attribute(Some(STRATEGY_ACTION_KEY))
            .and_then(Value::as_u64)
            .and_then(StrategyAction::from_code);
        match action {
            Some(StrategyAction::SellCall | StrategyAction::SellPut) => Ok(()),
            _ => Err(PayloadError::Invalid("expected a sell call or sell put action".to_string())),
        }
    }

    fn end_block(&self, ctx: &RoundContext<'_>) -> AbciResult<Option<(SynchronizedData, Event)>> {
        let Some((action, count)) = ctx.most_voted(Some(STRATEGY_ACTION_KEY)) else {
            return Ok(None);
        };
        if count < ctx.threshold {
            return Ok(None);
        }
        let event = match action.as_u64().and_then(StrategyAction::from_code) {
            Some(StrategyAction::SellPut) => Event::SellPutOption,
            _ => Event::SellCallOption,
        };
        let data = ctx.synchronized_data.update([(STRATEGY_ACTION_KEY, action.clone())])?;
        Ok(Some((data, event)))
    }

    fn declared_events(&self) -> Vec<Event> {
        vec![Event::SellPutOption, Event::SellCallOption]
    }
}

pub fn abci_app_spec() -> AbciResult<AbciAppSpec<Event>> {
    let agreed = |done: Event, key: &str| {
        CollectConfig::new(done)
            .with_payload_attribute(key)
            .with_selection_key(key)
    };

    AbciAppSpec::builder("FlowchartToFSMAbciApp")
        .round(RoundSpec::collect_same_until_threshold(
            COLLECT_DATA_ROUND,
            agreed(Event::Done, RYSK_DATA_KEY),
        ))
        .round(RoundSpec::collect_same_until_threshold(
            COLLECT_PRICE_DATA_ROUND,
            agreed(Event::Done, PRICE_DATA_KEY),
        ))
        .round(RoundSpec::collect_same_until_threshold(
            ANALYSE_DATA_ROUND,
            agreed(Event::Done, ANALYSIS_KEY),
        ))
        .round(RoundSpec::custom(MULTIPLEXER_ROUND, || MultiplexerStrategy))
        .round(RoundSpec::collect_same_until_threshold(
            PUT_EXPIRED_ROUND,
            agreed(Event::SellPutOption, SETTLEMENT_KEY),
        ))
        .round(RoundSpec::collect_same_until_threshold(
            CALL_EXPIRED_ROUND,
            agreed(Event::SellCallOption, SETTLEMENT_KEY),
        ))
        .round(RoundSpec::collect_same_until_threshold(
            PUT_EXERCISED_ROUND,
            agreed(Event::SwapFromUsdcToEth, SETTLEMENT_KEY),
        ))
        .round(RoundSpec::collect_same_until_threshold(
            CALL_EXERCISED_ROUND,
            agreed(Event::SwapFromEthToUsdc, SETTLEMENT_KEY),
        ))
        .round(RoundSpec::custom(UNDER_ALLOCATED_ROUND, || UnderAllocatedStrategy))
        .round(RoundSpec::degenerate(SELL_CALL_OPTION_ROUND))
        .round(RoundSpec::degenerate(SELL_PUT_OPTION_ROUND))
        .round(RoundSpec::degenerate(SWAP_FROM_ETH_TO_USDC_ROUND))
        .round(RoundSpec::degenerate(SWAP_FROM_USDC_TO_ETH_ROUND))
        .initial_round(COLLECT_DATA_ROUND)
        .final_state(SELL_CALL_OPTION_ROUND)
        .final_state(SELL_PUT_OPTION_ROUND)
        .final_state(SWAP_FROM_ETH_TO_USDC_ROUND)
        .final_state(SWAP_FROM_USDC_TO_ETH_ROUND)
        .transition(COLLECT_DATA_ROUND, Event::Done, COLLECT_PRICE_DATA_ROUND)
        .transition(COLLECT_PRICE_DATA_ROUND, Event::Done, ANALYSE_DATA_ROUND)
        .transition(ANALYSE_DATA_ROUND, Event::Done, MULTIPLEXER_ROUND)
        .transition(MULTIPLEXER_ROUND, Event::NotDone, COLLECT_DATA_ROUND)
        .transition(MULTIPLEXER_ROUND, Event::Error, COLLECT_DATA_ROUND)
        .transition(MULTIPLEXER_ROUND, Event::PutExpired, PUT_EXPIRED_ROUND)
        .transition(MULTIPLEXER_ROUND, Event::PutExercised, PUT_EXERCISED_ROUND)
        .transition(MULTIPLEXER_ROUND, Event::CallExpired, CALL_EXPIRED_ROUND)
        .transition(MULTIPLEXER_ROUND, Event::CallExercised, CALL_EXERCISED_ROUND)
        .transition(MULTIPLEXER_ROUND, Event::UnderAllocated, UNDER_ALLOCATED_ROUND)
        .transition(MULTIPLEXER_ROUND, Event::SellPutOption, SELL_PUT_OPTION_ROUND)
        .transition(MULTIPLEXER_ROUND, Event::SellCallOption, SELL_CALL_OPTION_ROUND)
        .transition(PUT_EXPIRED_ROUND, Event::SellPutOption, SELL_PUT_OPTION_ROUND)
        .transition(CALL_EXPIRED_ROUND, Event::SellCallOption, SELL_CALL_OPTION_ROUND)
        .transition(PUT_EXERCISED_ROUND, Event::SwapFromUsdcToEth, SWAP_FROM_USDC_TO_ETH_ROUND)
        .transition(CALL_EXERCISED_ROUND, Event::SwapFromEthToUsdc, SWAP_FROM_ETH_TO_USDC_ROUND)
        .transition(UNDER_ALLOCATED_ROUND, Event::SellPutOption, SELL_PUT_OPTION_ROUND)
        .transition(UNDER_ALLOCATED_ROUND, Event::SellCallOption, SELL_CALL_OPTION_ROUND)
        .build()
}

/// Subgraph series plus the agent's balance of every option asset
#[derive(Debug, Default)]
pub struct CollectDataBehaviour;

#[async_trait]
impl Behaviour for CollectDataBehaviour {
    fn behaviour_id(&self) -> &str {
        "collect_data_behaviour"
    }

    fn matching_round(&self) -> RoundId {
        COLLECT_DATA_ROUND
    }

    async fn act(&self, ctx: &BehaviourContext) -> Result<(), BehaviourError> {
        let params = RyskRollerParams::from_context(ctx)?;

        info!("Requesting subgraph data");
        let request = HttpRequest::post_json(&params.subgraph_url, &json!({ "query": params.subgraph_query }));
        let response: Value = ctx.get_http_response(request).await?.json()?;
        let subgraph = response
            .get("data")
            .cloned()
            .ok_or_else(|| BehaviourError::Failed("subgraph response has no `data`".to_string()))?;

        let mut balances = BTreeMap::new();
        for (name, address) in &params.option_assets {
            let call = ContractCall::new(ERC20_CONTRACT_ID, address, "balance_of")
                .with_kwarg("owner_address", json!(ctx.agent_address()));
            let state = ctx.get_contract_state(call).await?;
            let balance = state
                .get("balance")
                .and_then(parse_amount)
                .ok_or_else(|| BehaviourError::Failed(format!("no balance returned for {name}")))?;
            info!(asset = %name, %address, balance, "Requested balance");
            balances.insert(name.clone(), balance.to_string());
        }

        let data = RyskData { balances, subgraph };
        ctx.send_a2a_transaction(json!({ RYSK_DATA_KEY: data })).await?;
        ctx.wait_until_round_end().await;
        Ok(())
    }
}

/// Vault quotes for every buyable (ask) and sellable (bid) series
#[derive(Debug, Default)]
pub struct CollectPriceDataBehaviour;

impl CollectPriceDataBehaviour {
    async fn quote(
        &self,
        ctx: &BehaviourContext,
        params: &RyskRollerParams,
        row: &Value,
        is_sell: bool,
    ) -> Value {
        let field = |key: &str| row.get(key).cloned().unwrap_or(Value::Null);
        let request = json!({
            "_option_series": {
                "expiration": field("expiration"),
                "strike": field("strike"),
                "is_put": row.get("isPut").and_then(Value::as_bool).unwrap_or(false),
                "underlying": params.underlying_address,
                "strike_asset": params.strike_asset_address,
                "collateral": params.collateral_address,
            },
            "_amount": PRICE_DIVISOR.to_string(),
            "is_sell": is_sell,
            "net_dhv_exposure": field("netDHVExposure"),
        });
        let call = ContractCall::new(VAULT_CONTRACT_ID, &params.vault_address, "quote_option_price")
            .with_kwarg("owner_address", json!(ctx.agent_address()))
            .with_kwarg("request_quote_option_price", request);

        match ctx.get_contract_state(call).await {
            Ok(state) => state.get("quote_option_price").cloned().unwrap_or_else(|| json!({})),
            Err(e) => {
                warn!(series = ?row.get("id"), error = %e, "Quote failed");
                json!({})
            }
        }
    }
}

#[async_trait]
impl Behaviour for CollectPriceDataBehaviour {
    fn behaviour_id(&self) -> &str {
        "collect_price_data_behaviour"
    }

    fn matching_round(&self) -> RoundId {
        COLLECT_PRICE_DATA_ROUND
    }

    async fn act(&self, ctx: &BehaviourContext) -> Result<(), BehaviourError> {
        let params = RyskRollerParams::from_context(ctx)?;
        let data: RyskData = ctx.synchronized_data().get_strict(RYSK_DATA_KEY)?;

        let mut series = data.series();
        for row in series.iter_mut() {
            let flag = |key: &str| row.get(key).and_then(Value::as_bool).unwrap_or(false);
            let (buyable, sellable) = (flag("isBuyable"), flag("isSellable"));
            let ask = if buyable { Some(self.quote(ctx, &params, row, false).await) } else { None };
            let bid = if sellable { Some(self.quote(ctx, &params, row, true).await) } else { None };
            let name = to_human_format(row);

            if let Value::Object(fields) = row {
                if let Some(ask) = ask {
                    fields.insert("ask".to_string(), ask);
                }
                if let Some(bid) = bid {
                    fields.insert("bid".to_string(), bid);
                }
                if let Some(name) = name {
                    fields.insert("name".to_string(), json!(name));
                }
            }
        }
        info!(series = series.len(), "Collected option prices");

        ctx.send_a2a_transaction(json!({ PRICE_DATA_KEY: series })).await?;
        ctx.wait_until_round_end().await;
        Ok(())
    }
}

/// Summary of the priced series the decision round works from
#[derive(Debug, Default)]
pub struct AnalyseDataBehaviour;

#[async_trait]
impl Behaviour for AnalyseDataBehaviour {
    fn behaviour_id(&self) -> &str {
        "analyse_data_behaviour"
    }

    fn matching_round(&self) -> RoundId {
        ANALYSE_DATA_ROUND
    }

    async fn act(&self, ctx: &BehaviourContext) -> Result<(), BehaviourError> {
        let series: Vec<Value> = ctx
            .synchronized_data()
            .get_optional(PRICE_DATA_KEY)?
            .unwrap_or_default();
        let quoted = |side: &str| {
            series
                .iter()
                .filter(|row| row.get(side).and_then(Value::as_object).is_some_and(|q| !q.is_empty()))
                .count()
        };
        let analysis = json!({
            "series": series.len(),
            "asks": quoted("ask"),
            "bids": quoted("bid"),
        });
        info!(%analysis, "Analysed option market");

        ctx.send_a2a_transaction(json!({ ANALYSIS_KEY: analysis })).await?;
        ctx.wait_until_round_end().await;
        Ok(())
    }
}

/// Settlement first, allocation otherwise
pub struct MultiplexerBehaviour {
    decider: Arc<dyn StrategyDecider>,
}

impl MultiplexerBehaviour {
    pub fn new(decider: Arc<dyn StrategyDecider>) -> Self {
        Self { decider }
    }
}

#[async_trait]
impl Behaviour for MultiplexerBehaviour {
    fn behaviour_id(&self) -> &str {
        "multiplexer_behaviour"
    }

    fn matching_round(&self) -> RoundId {
        MULTIPLEXER_ROUND
    }

    async fn act(&self, ctx: &BehaviourContext) -> Result<(), BehaviourError> {
        let data: RyskData = ctx.synchronized_data().get_strict(RYSK_DATA_KEY)?;
        let decision = match self.decider.settlement(&data) {
            Some(settlement) => settlement.event(),
            None => self.decider.allocate(&data).event(),
        };
        info!(%decision, "Strategy decision");

        ctx.send_a2a_transaction(json!({ DECISION_KEY: decision.as_str() })).await?;
        ctx.wait_until_round_end().await;
        Ok(())
    }
}

/// Acknowledges a settlement branch so the period can move on
#[derive(Debug, Clone)]
pub struct SettlementBehaviour {
    id: String,
    round: RoundId,
}

impl SettlementBehaviour {
    pub fn new(round: RoundId) -> Self {
        Self {
            id: format!("{round}_behaviour"),
            round,
        }
    }
}

#[async_trait]
impl Behaviour for SettlementBehaviour {
    fn behaviour_id(&self) -> &str {
        &self.id
    }

    fn matching_round(&self) -> RoundId {
        self.round
    }

    async fn act(&self, ctx: &BehaviourContext) -> Result<(), BehaviourError> {
        ctx.send_a2a_transaction(json!({ SETTLEMENT_KEY: self.round })).await?;
        ctx.wait_until_round_end().await;
        Ok(())
    }
}

/// Picks what to sell with idle funds
pub struct UnderAllocatedBehaviour {
    decider: Arc<dyn StrategyDecider>,
}

impl UnderAllocatedBehaviour {
    pub fn new(decider: Arc<dyn StrategyDecider>) -> Self {
        Self { decider }
    }
}

#[async_trait]
impl Behaviour for UnderAllocatedBehaviour {
    fn behaviour_id(&self) -> &str {
        "under_allocated_behaviour"
    }

    fn matching_round(&self) -> RoundId {
        UNDER_ALLOCATED_ROUND
    }

    async fn act(&self, ctx: &BehaviourContext) -> Result<(), BehaviourError> {
        let data: RyskData = ctx.synchronized_data().get_strict(RYSK_DATA_KEY)?;
        let action = match self.decider.allocate(&data) {
            action @ (StrategyAction::SellCall | StrategyAction::SellPut) => action,
            other => {
                return Err(BehaviourError::Failed(format!(
                    "{other:?} does not allocate idle funds"
                )))
            }
        };

        ctx.send_a2a_transaction(json!({ STRATEGY_ACTION_KEY: action.code() })).await?;
        ctx.wait_until_round_end().await;
        Ok(())
    }
}

pub fn behaviours(decider: Arc<dyn StrategyDecider>) -> Vec<Arc<dyn Behaviour>> {
    vec![
        Arc::new(CollectDataBehaviour),
        Arc::new(CollectPriceDataBehaviour),
        Arc::new(AnalyseDataBehaviour),
        Arc::new(MultiplexerBehaviour::new(Arc::clone(&decider))),
        Arc::new(SettlementBehaviour::new(PUT_EXPIRED_ROUND)),
        Arc::new(SettlementBehaviour::new(CALL_EXPIRED_ROUND)),
        Arc::new(SettlementBehaviour::new(PUT_EXERCISED_ROUND)),
        Arc::new(SettlementBehaviour::new(CALL_EXERCISED_ROUND)),
        Arc::new(UnderAllocatedBehaviour::new(decider)),
    ]
}

pub fn round_behaviour(
    spec: &AbciAppSpec<Event>,
    agent: AgentContext,
    decider: Arc<dyn StrategyDecider>,
) -> AbciResult<RoundBehaviour> {
    RoundBehaviour::new(spec, behaviours(decider), agent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use round_abci::test_tools::{participants, setup_data, timestamp, MockContractApi, MockHttpClient};
    use round_abci::{AbciApp, LocalTransport, Round};

    const SUBGRAPH_URL: &str = "http://subgraph.local/rysk";

    fn skill_params() -> Map<String, Value> {
        let params = json!({
            "subgraph_url": SUBGRAPH_URL,
            "subgraph_query": "{ series { id expiration strike isPut isBuyable isSellable netDHVExposure } }",
            "option_assets": {"WETH": "0xweth", "USDC": "0xusdc"},
            "vault_address": "0xvault",
            "min_weth": "1000000000000000000",
            "min_usdc": 5_000_000_000u64,
        });
        params.as_object().cloned().unwrap()
    }

    fn series_row() -> Value {
        json!({
            "id": "0xseries",
            "expiration": "1684195200",
            "strike": "1550000000000000000000",
            "isPut": false,
            "isBuyable": true,
            "isSellable": true,
            "netDHVExposure": "-12000000000000000000",
        })
    }

    fn http() -> MockHttpClient {
        MockHttpClient::new().with_json(SUBGRAPH_URL, json!({"data": {"series": [series_row()]}}))
    }

    fn contracts() -> MockContractApi {
        MockContractApi::new()
            .with_state("balance_of", json!({"balance": "2000000000000000000"}))
            .with_state(
                "quote_option_price",
                json!({"quote_option_price": {"total_premium": "31000000", "total_delta": "-420000000000000000"}}),
            )
    }

    struct Agent {
        app: AbciApp<Event>,
        driver: RoundBehaviour,
    }

    fn agents(transport: &LocalTransport, decider: Arc<dyn StrategyDecider>) -> Vec<Agent> {
        let spec = Arc::new(abci_app_spec().unwrap());
        let (contracts, http) = (contracts(), http());
        participants(4)
            .into_iter()
            .map(|address| {
                let agent = AgentContext::new(address, Arc::new(transport.clone()))
                    .with_contract_api(Arc::new(contracts.clone()))
                    .with_http_client(Arc::new(http.clone()))
                    .with_params(skill_params());
                Agent {
                    app: AbciApp::new(Arc::clone(&spec), setup_data(&participants(4)), timestamp(0)).unwrap(),
                    driver: round_behaviour(&spec, agent, Arc::clone(&decider)).unwrap(),
                }
            })
            .collect()
    }

    fn step(agents: &mut [Agent], transport: &LocalTransport, seconds: i64) {
        for agent in agents.iter_mut() {
            agent.driver.act_wrapper(&agent.app).unwrap();
        }
        let block = transport.next_block(timestamp(seconds));
        for agent in agents.iter_mut() {
            agent.app.process_block(&block).unwrap();
        }
    }

    fn run_until_decision(agents: &mut [Agent], transport: &LocalTransport) {
        for (height, round) in [COLLECT_PRICE_DATA_ROUND, ANALYSE_DATA_ROUND, MULTIPLEXER_ROUND]
            .into_iter()
            .enumerate()
        {
            step(agents, transport, height as i64 + 1);
            assert!(agents.iter().all(|a| a.app.current_round_id() == round), "expected {round}");
        }
    }

    struct FixedDecider {
        settlement: Option<Settlement>,
        action: StrategyAction,
    }

    impl StrategyDecider for FixedDecider {
        fn settlement(&self, _data: &RyskData) -> Option<Settlement> {
            self.settlement
        }

        fn allocate(&self, _data: &RyskData) -> StrategyAction {
            self.action
        }
    }

    #[test]
    fn test_to_human_format() {
        assert_eq!(to_human_format(&series_row()).as_deref(), Some("ETH-16MAY23-1550-C"));

        let put = json!({"expiration": 1688112000, "strike": "1800000000000000000000", "isPut": true});
        assert_eq!(to_human_format(&put).as_deref(), Some("ETH-30JUN23-1800-P"));

        assert_eq!(to_human_format(&json!({"strike": "1"})), None);
    }

    #[test]
    fn test_event_names_round_trip() {
        for event in Event::ALL {
            assert_eq!(Event::from_name(event.as_str()), Some(event));
            assert_eq!(event.to_string(), event.as_str());
        }
        assert_eq!(Event::from_name("sell_straddle"), None);
    }

    #[test]
    fn test_spec_declares_four_final_rounds() {
        let spec = abci_app_spec().unwrap();

        assert_eq!(spec.initial_round(), COLLECT_DATA_ROUND);
        assert_eq!(spec.final_states().len(), 4);
        assert!(spec.is_final(SWAP_FROM_USDC_TO_ETH_ROUND));
        assert_eq!(spec.next_round(MULTIPLEXER_ROUND, Event::Error), Some(COLLECT_DATA_ROUND));
        assert_eq!(spec.next_round(UNDER_ALLOCATED_ROUND, Event::SellPutOption), Some(SELL_PUT_OPTION_ROUND));
        assert_eq!(spec.events().len(), Event::ALL.len());
    }

    #[test]
    fn test_balance_threshold_decider() {
        let decider = BalanceThresholdDecider::from_params(&skill_params()).unwrap();
        assert_eq!(decider, BalanceThresholdDecider::new(1_000_000_000_000_000_000, 5_000_000_000));

        let data = |weth: &str, usdc: &str| RyskData {
            balances: BTreeMap::from([("WETH".to_string(), weth.to_string()), ("USDC".to_string(), usdc.to_string())]),
            subgraph: json!({}),
        };
        assert_eq!(decider.allocate(&data("2000000000000000000", "0")), StrategyAction::SellCall);
        assert_eq!(decider.allocate(&data("1000000000000000000", "6000000000")), StrategyAction::SellPut);
        assert_eq!(decider.allocate(&data("0", "5000000000")), StrategyAction::Hold);
        assert_eq!(decider.settlement(&data("0", "0")), None);

        let mut missing = skill_params();
        missing.remove("min_usdc");
        assert_eq!(
            BalanceThresholdDecider::from_params(&missing),
            Err(BehaviourError::MissingParam("min_usdc".to_string()))
        );
    }

    #[test]
    fn test_funded_wallet_sells_calls() {
        let transport = LocalTransport::new();
        let decider = Arc::new(BalanceThresholdDecider::from_params(&skill_params()).unwrap());
        let mut agents = agents(&transport, decider);

        run_until_decision(&mut agents, &transport);
        let data = agents[0].app.synchronized_data();
        let rysk: RyskData = data.get_strict(RYSK_DATA_KEY).unwrap();
        assert_eq!(rysk.balance("WETH"), 2_000_000_000_000_000_000);
        let prices: Vec<Value> = data.get_strict(PRICE_DATA_KEY).unwrap();
        assert_eq!(prices[0]["name"], json!("ETH-16MAY23-1550-C"));
        assert_eq!(prices[0]["ask"]["total_premium"], json!("31000000"));
        assert_eq!(data.get(ANALYSIS_KEY), Some(&json!({"series": 1, "asks": 1, "bids": 1})));

        step(&mut agents, &transport, 4);
        assert!(agents.iter().all(|a| a.app.current_round_id() == SELL_CALL_OPTION_ROUND));
        assert!(agents.iter().all(|a| a.app.is_finished()));
        assert_eq!(agents[0].app.synchronized_data().get(DECISION_KEY), Some(&json!("sell_call_option")));
    }

    #[test]
    fn test_expired_put_is_settled_before_selling() {
        let transport = LocalTransport::new();
        let decider = Arc::new(FixedDecider {
            settlement: Some(Settlement::PutExpired),
            action: StrategyAction::Hold,
        });
        let mut agents = agents(&transport, decider);

        run_until_decision(&mut agents, &transport);
        step(&mut agents, &transport, 4);
        assert!(agents.iter().all(|a| a.app.current_round_id() == PUT_EXPIRED_ROUND));
        step(&mut agents, &transport, 5);
        assert!(agents.iter().all(|a| a.app.current_round_id() == SELL_PUT_OPTION_ROUND));
    }

    #[test]
    fn test_under_allocated_funds_sell_puts() {
        let transport = LocalTransport::new();
        let decider = Arc::new(FixedDecider {
            settlement: Some(Settlement::UnderAllocated),
            action: StrategyAction::SellPut,
        });
        let mut agents = agents(&transport, decider);

        run_until_decision(&mut agents, &transport);
        step(&mut agents, &transport, 4);
        step(&mut agents, &transport, 5);

        assert!(agents.iter().all(|a| a.app.current_round_id() == SELL_PUT_OPTION_ROUND));
        assert_eq!(
            agents[0].app.synchronized_data().get(STRATEGY_ACTION_KEY),
            Some(&json!(StrategyAction::SellPut.code()))
        );
    }

    #[test]
    fn test_hold_collects_again() {
        let transport = LocalTransport::new();
        let decider = Arc::new(FixedDecider {
            settlement: None,
            action: StrategyAction::Hold,
        });
        let mut agents = agents(&transport, decider);

        run_until_decision(&mut agents, &transport);
        step(&mut agents, &transport, 4);

        assert!(agents.iter().all(|a| a.app.current_round_id() == COLLECT_DATA_ROUND));
        assert_eq!(agents[0].app.period_count(), 0);
        assert_eq!(agents[0].app.last_transition().unwrap().event, Event::NotDone);
    }

    #[test]
    fn test_multiplexer_routes_unknown_decision_to_error() {
        let spec = RoundSpec::custom(MULTIPLEXER_ROUND, || MultiplexerStrategy);
        let mut round = Round::new(&spec, setup_data(&participants(4)), None).unwrap();

        let numeric = Payload::new(MULTIPLEXER_ROUND, "agent_0", json!({DECISION_KEY: 1}));
        assert!(round.process_payload(numeric).is_err());

        for sender in participants(3) {
            round
                .process_payload(Payload::new(MULTIPLEXER_ROUND, sender, json!({DECISION_KEY: "done"})))
                .unwrap();
        }
        let (_, event) = round.end_block().unwrap().unwrap();
        assert_eq!(event, Event::Error);
    }

    #[test]
    fn test_multiplexer_split_vote_is_error() {
        let spec = RoundSpec::custom(MULTIPLEXER_ROUND, || MultiplexerStrategy);
        let mut round = Round::new(&spec, setup_data(&participants(4)), None).unwrap();

        let votes = ["sell_call_option", "sell_call_option", "sell_put_option", "not_done"];
        for (sender, vote) in participants(4).into_iter().zip(votes) {
            round
                .process_payload(Payload::new(MULTIPLEXER_ROUND, sender, json!({DECISION_KEY: vote})))
                .unwrap();
        }
        let (data, event) = round.end_block().unwrap().unwrap();
        assert_eq!(event, Event::Error);
        assert_eq!(data.get(DECISION_KEY), None);
    }

    #[test]
    fn test_under_allocated_rejects_non_selling_actions() {
        let spec = RoundSpec::custom(UNDER_ALLOCATED_ROUND, || UnderAllocatedStrategy);
        let mut round = Round::new(&spec, setup_data(&participants(4)), None).unwrap();

        let hold = Payload::new(UNDER_ALLOCATED_ROUND, "agent_0", json!({STRATEGY_ACTION_KEY: 5}));
        assert!(matches!(round.process_payload(hold), Err(PayloadError::Invalid(_))));
        assert!(round.end_block().unwrap().is_none());
    }
}

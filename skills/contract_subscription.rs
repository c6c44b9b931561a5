//! # Contract Subscription
//!
//! Subscribes the agent to the logs of one contract over a websocket JSON-RPC
//! provider. The subscription request is sent once per agent; the agents then
//! agree on the subscribed address and the app finishes.
//!
//! ## Transition Table
//!
//! ```text
//! subscribe --done-->          subscribed (final)
//! subscribe --round_timeout--> subscribe
//! ```
//!
//! ## Skill Parameters
//!
//! - `contract_address`: contract whose logs are streamed
//! - `websocket_provider`: JSON-RPC endpoint the request goes to (optional)

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use round_abci::{
    AbciAppSpec, AbciParams, AbciResult, AgentContext, Behaviour, BehaviourContext, BehaviourError,
    CollectConfig, ExternalCallError, RoundBehaviour, RoundId, RoundSpec,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Event {
    Done,
    RoundTimeout,
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Done => "done",
            Self::RoundTimeout => "round_timeout",
        })
    }
}

pub const SUBSCRIBE_ROUND: RoundId = "subscribe";
pub const SUBSCRIBED_ROUND: RoundId = "subscribed";

pub const SUBSCRIPTION_KEY: &str = "subscribed_contract_address";

/// Skill parameters read from the agent's `skill` table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractSubscriptionParams {
    pub contract_address: String,
    #[serde(default = "default_websocket_provider")]
    pub websocket_provider: String,
}

fn default_websocket_provider() -> String {
    "ws://localhost:8546".to_string()
}

impl ContractSubscriptionParams {
    pub fn from_params(params: &Map<String, Value>) -> Result<Self, BehaviourError> {
        serde_json::from_value(Value::Object(params.clone())).map_err(|e| BehaviourError::InvalidParam {
            key: "skill".to_string(),
            reason: e.to_string(),
        })
    }
}

/// `eth_subscribe` request for the logs emitted by `contract_address`
pub fn subscription_message(contract_address: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": "eth_subscribe",
        "params": ["logs", { "address": contract_address }],
    })
}

/// Outbound side of the websocket client connection
#[async_trait]
pub trait WebsocketConnection: Send + Sync {
    /// Deliver raw message bytes to `endpoint`
    async fn send(&self, endpoint: &str, content: Vec<u8>) -> Result<(), ExternalCallError>;
}

/// Sends the subscription request once, then reports the subscribed address
pub struct SubscriptionBehaviour {
    connection: Arc<dyn WebsocketConnection>,
    sent: AtomicBool,
}

impl SubscriptionBehaviour {
    pub fn new(connection: Arc<dyn WebsocketConnection>) -> Self {
        Self {
            connection,
            sent: AtomicBool::new(false),
        }
    }

    /// Whether the request has already gone out
    pub fn is_sent(&self) -> bool {
        self.sent.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Behaviour for SubscriptionBehaviour {
    fn behaviour_id(&self) -> &str {
        "subscription_behaviour"
    }

    fn matching_round(&self) -> RoundId {
        SUBSCRIBE_ROUND
    }

    async fn act(&self, ctx: &BehaviourContext) -> Result<(), BehaviourError> {
        let params = ContractSubscriptionParams::from_params(ctx.params())?;

        if self.is_sent() {
            debug!(contract = %params.contract_address, "Subscription already sent");
        } else {
            let message = subscription_message(&params.contract_address);
            info!(endpoint = %params.websocket_provider, %message, "Sending subscription message");
            let content = serde_json::to_vec(&message).map_err(|e| BehaviourError::Failed(e.to_string()))?;
            self.connection.send(&params.websocket_provider, content).await?;
            self.sent.store(true, Ordering::SeqCst);
        }

        ctx.send_a2a_transaction(json!({ SUBSCRIPTION_KEY: params.contract_address }))
            .await?;
        ctx.wait_until_round_end().await;
        Ok(())
    }
}

pub fn abci_app_spec(params: &AbciParams) -> AbciResult<AbciAppSpec<Event>> {
    AbciAppSpec::builder("ContractSubscriptionAbciApp")
        .round(RoundSpec::collect_same_until_threshold(
            SUBSCRIBE_ROUND,
            CollectConfig::new(Event::Done)
                .with_payload_attribute(SUBSCRIPTION_KEY)
                .with_selection_key(SUBSCRIPTION_KEY),
        ))
        .round(RoundSpec::degenerate(SUBSCRIBED_ROUND))
        .initial_round(SUBSCRIBE_ROUND)
        .final_state(SUBSCRIBED_ROUND)
        .transition(SUBSCRIBE_ROUND, Event::Done, SUBSCRIBED_ROUND)
        .transition(SUBSCRIBE_ROUND, Event::RoundTimeout, SUBSCRIBE_ROUND)
        .event_timeout(Event::RoundTimeout, params.round_timeout())
        .build()
}

pub fn behaviours(connection: Arc<dyn WebsocketConnection>) -> Vec<Arc<dyn Behaviour>> {
    vec![Arc::new(SubscriptionBehaviour::new(connection))]
}

pub fn round_behaviour(
    spec: &AbciAppSpec<Event>,
    agent: AgentContext,
    connection: Arc<dyn WebsocketConnection>,
) -> AbciResult<RoundBehaviour> {
    RoundBehaviour::new(spec, behaviours(connection), agent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use round_abci::test_tools::{participants, setup_data, timestamp};
    use round_abci::{AbciApp, LocalTransport};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    const CONTRACT: &str = "0xf25212e676d1f7f89cd72ffee66158f541246445";
    const PROVIDER: &str = "ws://node.local:8546";

    /// Records every message and fails the first `failures` sends
    #[derive(Default)]
    struct RecordingConnection {
        sent: Mutex<Vec<(String, Vec<u8>)>>,
        failures: AtomicUsize,
    }

    impl RecordingConnection {
        fn failing(failures: usize) -> Self {
            Self {
                failures: AtomicUsize::new(failures),
                ..Self::default()
            }
        }

        fn messages(&self) -> Vec<(String, Value)> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .map(|(endpoint, content)| (endpoint.clone(), serde_json::from_slice(content).unwrap()))
                .collect()
        }
    }

    #[async_trait]
    impl WebsocketConnection for RecordingConnection {
        async fn send(&self, endpoint: &str, content: Vec<u8>) -> Result<(), ExternalCallError> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(ExternalCallError::Transport("connection closed".to_string()));
            }
            self.sent.lock().unwrap().push((endpoint.to_string(), content));
            Ok(())
        }
    }

    fn skill_params() -> Map<String, Value> {
        json!({ "contract_address": CONTRACT, "websocket_provider": PROVIDER })
            .as_object()
            .cloned()
            .unwrap()
    }

    fn abci_params() -> AbciParams {
        AbciParams::new("agent_0", participants(4)).with_round_timeout_seconds(30.0)
    }

    struct Agent {
        app: AbciApp<Event>,
        driver: RoundBehaviour,
        connection: Arc<RecordingConnection>,
    }

    fn agents(transport: &LocalTransport, failures: usize) -> Vec<Agent> {
        let spec = Arc::new(abci_app_spec(&abci_params()).unwrap());
        participants(4)
            .into_iter()
            .map(|address| {
                let connection = Arc::new(RecordingConnection::failing(failures));
                let agent = AgentContext::new(address, Arc::new(transport.clone())).with_params(skill_params());
                Agent {
                    app: AbciApp::new(Arc::clone(&spec), setup_data(&participants(4)), timestamp(0)).unwrap(),
                    driver: round_behaviour(&spec, agent, connection.clone()).unwrap(),
                    connection,
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

    #[test]
    fn test_subscription_message() {
        assert_eq!(
            subscription_message(CONTRACT),
            json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": "eth_subscribe",
                "params": ["logs", {"address": CONTRACT}],
            })
        );
    }

    #[test]
    fn test_params_default_provider() {
        let params = json!({ "contract_address": CONTRACT }).as_object().cloned().unwrap();
        let params = ContractSubscriptionParams::from_params(&params).unwrap();
        assert_eq!(params.websocket_provider, "ws://localhost:8546");

        let missing = ContractSubscriptionParams::from_params(&Map::new());
        assert!(matches!(missing, Err(BehaviourError::InvalidParam { .. })));
    }

    #[test]
    fn test_spec_matches_transition_table() {
        let spec = abci_app_spec(&abci_params()).unwrap();

        assert_eq!(spec.initial_round(), SUBSCRIBE_ROUND);
        assert!(spec.is_final(SUBSCRIBED_ROUND));
        assert_eq!(spec.next_round(SUBSCRIBE_ROUND, Event::Done), Some(SUBSCRIBED_ROUND));
        assert_eq!(spec.next_round(SUBSCRIBE_ROUND, Event::RoundTimeout), Some(SUBSCRIBE_ROUND));
    }

    #[test]
    fn test_every_agent_subscribes_once() {
        let transport = LocalTransport::new();
        let mut agents = agents(&transport, 0);

        step(&mut agents, &transport, 1);
        assert!(agents.iter().all(|a| a.app.current_round_id() == SUBSCRIBED_ROUND));
        assert!(agents.iter().all(|a| a.app.is_finished()));
        let agreed: String = agents[0].app.synchronized_data().get_strict(SUBSCRIPTION_KEY).unwrap();
        assert_eq!(agreed, CONTRACT);

        step(&mut agents, &transport, 2);
        for agent in &agents {
            assert_eq!(
                agent.connection.messages(),
                vec![(PROVIDER.to_string(), subscription_message(CONTRACT))]
            );
        }
    }

    #[test]
    fn test_failed_send_is_retried() {
        let transport = LocalTransport::new();
        let mut agents = agents(&transport, 1);

        step(&mut agents, &transport, 1);
        assert!(agents.iter().all(|a| a.app.current_round_id() == SUBSCRIBE_ROUND));
        assert!(agents.iter().all(|a| a.driver.failed_acts() == 1));
        assert!(agents.iter().all(|a| a.connection.messages().is_empty()));

        step(&mut agents, &transport, 2);
        assert!(agents.iter().all(|a| a.app.current_round_id() == SUBSCRIBED_ROUND));
        assert!(agents.iter().all(|a| a.connection.messages().len() == 1));
    }
}

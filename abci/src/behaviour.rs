//! # Behaviours
//!
//! A behaviour is the local half of a round: the asynchronous work one agent
//! performs to produce its payload. Behaviours talk to the outside world only
//! through the collaborators carried by [`BehaviourContext`]:
//!
//! - **ConsensusTransport**: submits the agent's payload for ordering
//! - **ContractApi**: reads contract state and builds raw transactions
//! - **HttpClient**: queries HTTP endpoints and subgraphs
//!
//! Every round entry creates a fresh `act` future. The driver polls it once
//! per tick and drops it when the round changes, so suspension points are the
//! only places an act can be interrupted.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::watch;
use tracing::debug;

use crate::app::AbciApp;
use crate::payload::Payload;
use crate::synchronized_data::{DbError, SynchronizedData};
use crate::{Address, AppEvent, RoundId};

/// Failures reported by external collaborators
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExternalCallError {
    #[error("Contract call {callable} returned an error: {message}")]
    Contract { callable: String, message: String },

    #[error("HTTP request to {url} failed with status {status}")]
    HttpStatus { url: String, status: u16 },

    #[error("HTTP request to {url} failed: {message}")]
    Http { url: String, message: String },

    #[error("Transport rejected the payload: {0}")]
    Transport(String),

    #[error("No {0} is configured for this agent")]
    Unavailable(&'static str),

    #[error("Malformed response: {0}")]
    Decode(String),
}

/// Failures of a behaviour's `act`; the driver retries on the next tick
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BehaviourError {
    #[error(transparent)]
    External(#[from] ExternalCallError),

    #[error(transparent)]
    Db(#[from] DbError),

    #[error("Missing parameter `{0}`")]
    MissingParam(String),

    #[error("Invalid parameter `{key}`: {reason}")]
    InvalidParam { key: String, reason: String },

    #[error("{0}")]
    Failed(String),
}

/// Read or build request addressed to a contract
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractCall {
    pub contract_id: String,
    pub contract_address: String,
    pub callable: String,
    pub kwargs: Map<String, Value>,
}

impl ContractCall {
    pub fn new(
        contract_id: impl Into<String>,
        contract_address: impl Into<String>,
        callable: impl Into<String>,
    ) -> Self {
        Self {
            contract_id: contract_id.into(),
            contract_address: contract_address.into(),
            callable: callable.into(),
            kwargs: Map::new(),
        }
    }

    pub fn with_kwarg(mut self, key: impl Into<String>, value: Value) -> Self {
        self.kwargs.insert(key.into(), value);
        self
    }
}

/// Unsigned transaction body returned by the contract layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawTransaction {
    pub ledger_id: String,
    pub body: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: "GET".to_string(),
            url: url.into(),
            headers: BTreeMap::new(),
            body: Vec::new(),
        }
    }

    /// POST with a JSON body
    pub fn post_json(url: impl Into<String>, body: &Value) -> Self {
        let mut headers = BTreeMap::new();
        headers.insert("Content-Type".to_string(), "application/json".to_string());
        Self {
            method: "POST".to_string(),
            url: url.into(),
            headers,
            body: body.to_string().into_bytes(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpResponse {
    pub status_code: u16,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status_code: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status_code,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ExternalCallError> {
        serde_json::from_slice(&self.body).map_err(|e| ExternalCallError::Decode(e.to_string()))
    }
}

/// Submits payloads to the consensus layer
#[async_trait]
pub trait ConsensusTransport: Send + Sync {
    async fn submit(&self, payload: Payload) -> Result<(), ExternalCallError>;
}

/// Contract/RPC collaborator
#[async_trait]
pub trait ContractApi: Send + Sync {
    async fn get_state(&self, call: ContractCall) -> Result<Value, ExternalCallError>;

    async fn get_raw_transaction(&self, call: ContractCall) -> Result<RawTransaction, ExternalCallError>;
}

#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn request(&self, request: HttpRequest) -> Result<HttpResponse, ExternalCallError>;
}

/// Collaborators and parameters of one agent, shared by all its behaviours
#[derive(Clone)]
pub struct AgentContext {
    agent_address: Address,
    transport: Arc<dyn ConsensusTransport>,
    contract_api: Option<Arc<dyn ContractApi>>,
    http_client: Option<Arc<dyn HttpClient>>,
    params: Arc<Map<String, Value>>,
}

impl AgentContext {
    pub fn new(agent_address: impl Into<Address>, transport: Arc<dyn ConsensusTransport>) -> Self {
        Self {
            agent_address: agent_address.into(),
            transport,
            contract_api: None,
            http_client: None,
            params: Arc::new(Map::new()),
        }
    }

    pub fn with_contract_api(mut self, contract_api: Arc<dyn ContractApi>) -> Self {
        self.contract_api = Some(contract_api);
        self
    }

    pub fn with_http_client(mut self, http_client: Arc<dyn HttpClient>) -> Self {
        self.http_client = Some(http_client);
        self
    }

    pub fn with_params(mut self, params: Map<String, Value>) -> Self {
        self.params = Arc::new(params);
        self
    }

    pub fn agent_address(&self) -> &str {
        &self.agent_address
    }
}

impl fmt::Debug for AgentContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentContext")
            .field("agent_address", &self.agent_address)
            .field("contract_api", &self.contract_api.is_some())
            .field("http_client", &self.http_client.is_some())
            .field("params", &self.params)
            .finish()
    }
}

/// Snapshot of the application state published to behaviours
#[derive(Debug, Clone, PartialEq)]
pub struct RoundInfo {
    pub round_id: RoundId,
    /// Identifies the round entry
    pub round_count: u64,
    pub period_count: u64,
    pub synchronized_data: Arc<SynchronizedData>,
    pub is_finished: bool,
}

impl RoundInfo {
    pub fn from_app<E: AppEvent>(app: &AbciApp<E>) -> Self {
        Self {
            round_id: app.current_round_id(),
            round_count: app.round_count(),
            period_count: app.period_count(),
            synchronized_data: Arc::new(app.synchronized_data().clone()),
            is_finished: app.is_finished(),
        }
    }
}

/// Everything an `act` may use, bound to one round entry
#[derive(Clone)]
pub struct BehaviourContext {
    agent: AgentContext,
    round: RoundInfo,
    round_watch: watch::Receiver<RoundInfo>,
}

impl BehaviourContext {
    pub fn new(agent: AgentContext, round: RoundInfo, round_watch: watch::Receiver<RoundInfo>) -> Self {
        Self {
            agent,
            round,
            round_watch,
        }
    }

    pub fn agent_address(&self) -> &str {
        &self.agent.agent_address
    }

    pub fn round_id(&self) -> RoundId {
        self.round.round_id
    }

    pub fn round_count(&self) -> u64 {
        self.round.round_count
    }

    pub fn period_count(&self) -> u64 {
        self.round.period_count
    }

    /// Entry state of the round this context is bound to
    pub fn synchronized_data(&self) -> &SynchronizedData {
        &self.round.synchronized_data
    }

    pub fn params(&self) -> &Map<String, Value> {
        &self.agent.params
    }

    /// Decode the skill parameter `key`
    pub fn param<T: DeserializeOwned>(&self, key: &str) -> Result<T, BehaviourError> {
        let value = self
            .agent
            .params
            .get(key)
            .ok_or_else(|| BehaviourError::MissingParam(key.to_string()))?;
        serde_json::from_value(value.clone()).map_err(|e| BehaviourError::InvalidParam {
            key: key.to_string(),
            reason: e.to_string(),
        })
    }

    /// Submit `content` as this agent's payload for the current round
    pub async fn send_a2a_transaction(&self, content: Value) -> Result<(), BehaviourError> {
        let payload = Payload::new(self.round.round_id, self.agent.agent_address.clone(), content);
        debug!(
            round = self.round.round_id,
            sender = %self.agent.agent_address,
            "Submitting payload"
        );
        self.agent.transport.submit(payload).await?;
        Ok(())
    }

    /// Suspend until the application leaves the round entry this context is
    /// bound to
    pub async fn wait_until_round_end(&self) {
        let mut receiver = self.round_watch.clone();
        loop {
            if receiver.borrow_and_update().round_count != self.round.round_count {
                return;
            }
            if receiver.changed().await.is_err() {
                return;
            }
        }
    }

    pub async fn get_contract_state(&self, call: ContractCall) -> Result<Value, ExternalCallError> {
        let api = self
            .agent
            .contract_api
            .as_ref()
            .ok_or(ExternalCallError::Unavailable("contract api"))?;
        api.get_state(call).await
    }

    pub async fn get_raw_transaction(&self, call: ContractCall) -> Result<RawTransaction, ExternalCallError> {
        let api = self
            .agent
            .contract_api
            .as_ref()
            .ok_or(ExternalCallError::Unavailable("contract api"))?;
        api.get_raw_transaction(call).await
    }

    /// Perform `request`; non-2xx responses are errors
    pub async fn get_http_response(&self, request: HttpRequest) -> Result<HttpResponse, ExternalCallError> {
        let client = self
            .agent
            .http_client
            .as_ref()
            .ok_or(ExternalCallError::Unavailable("http client"))?;
        let url = request.url.clone();
        let response = client.request(request).await?;
        if !response.is_success() {
            return Err(ExternalCallError::HttpStatus {
                url,
                status: response.status_code,
            });
        }
        Ok(response)
    }
}

impl fmt::Debug for BehaviourContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BehaviourContext")
            .field("agent", &self.agent)
            .field("round_id", &self.round.round_id)
            .field("round_count", &self.round.round_count)
            .finish()
    }
}

/// Local work performed by one agent while its matching round is current
#[async_trait]
pub trait Behaviour: Send + Sync {
    fn behaviour_id(&self) -> &str;

    fn matching_round(&self) -> RoundId;

    /// Called once when the matching round is entered
    fn setup(&self, _ctx: &BehaviourContext) {}

    /// Called once when the matching round is left
    fn teardown(&self, _ctx: &BehaviourContext) {}

    async fn act(&self, ctx: &BehaviourContext) -> Result<(), BehaviourError>;
}

/// No-op behaviour attached to final rounds
#[derive(Debug, Clone)]
pub struct DegenerateBehaviour {
    id: String,
    round: RoundId,
}

impl DegenerateBehaviour {
    pub fn new(round: RoundId) -> Self {
        Self {
            id: format!("degenerate_behaviour_{round}"),
            round,
        }
    }
}

#[async_trait]
impl Behaviour for DegenerateBehaviour {
    fn behaviour_id(&self) -> &str {
        &self.id
    }

    fn matching_round(&self) -> RoundId {
        self.round
    }

    async fn act(&self, ctx: &BehaviourContext) -> Result<(), BehaviourError> {
        debug!(round = self.round, period = ctx.period_count(), "Final round reached");
        Ok(())
    }
}

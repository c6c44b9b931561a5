//! Fixtures and mock collaborators for tests of applications built on the
//! engine. Enabled for this crate's tests and, downstream, through the
//! `test-tools` feature.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{json, Value};

use crate::app::Block;
use crate::behaviour::{
    Behaviour, BehaviourContext, BehaviourError, ContractApi, ContractCall, ExternalCallError, HttpClient,
    HttpRequest, HttpResponse, RawTransaction,
};
use crate::payload::Payload;
use crate::synchronized_data::{SynchronizedData, PARTICIPANTS_KEY};
use crate::{Address, RoundId};

/// 2023-05-16T00:00:00Z
pub const GENESIS_SECONDS: i64 = 1_684_195_200;

/// Generic event set for engine tests
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TestEvent {
    Done,
    RoundTimeout,
    NoMajority,
    None,
    Negative,
    Fail,
}

impl fmt::Display for TestEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Done => "done",
            Self::RoundTimeout => "round_timeout",
            Self::NoMajority => "no_majority",
            Self::None => "none",
            Self::Negative => "negative",
            Self::Fail => "fail",
        };
        f.write_str(name)
    }
}

/// `agent_0 .. agent_{n-1}`
pub fn participants(n: usize) -> Vec<Address> {
    (0..n).map(|i| format!("agent_{i}")).collect()
}

/// Setup data holding only the participant set
pub fn setup_data(participants: &[Address]) -> SynchronizedData {
    let mut setup = BTreeMap::new();
    setup.insert(PARTICIPANTS_KEY.to_string(), json!(participants));
    SynchronizedData::create(setup)
}

/// Genesis plus `seconds`
pub fn timestamp(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(GENESIS_SECONDS + seconds, 0)
        .single()
        .unwrap_or_default()
}

/// Block at `height` whose timestamp is `height` seconds after genesis
pub fn block(height: u64, payloads: Vec<Payload>) -> Block {
    Block::new(height, timestamp(height as i64), payloads)
}

/// One payload per `(sender, content)` for `round`
pub fn payloads<'a, I>(round: &str, contents: I) -> Vec<Payload>
where
    I: IntoIterator<Item = (&'a str, Value)>,
{
    contents
        .into_iter()
        .map(|(sender, content)| Payload::new(round, sender, content))
        .collect()
}

enum Reply<T> {
    Ok(T),
    Err(String),
}

/// Contract collaborator answering from canned responses keyed by callable
#[derive(Clone, Default)]
pub struct MockContractApi {
    states: Arc<Mutex<BTreeMap<String, Reply<Value>>>>,
    transactions: Arc<Mutex<BTreeMap<String, Value>>>,
    calls: Arc<Mutex<Vec<ContractCall>>>,
}

impl MockContractApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(self, callable: &str, value: Value) -> Self {
        self.lock_states().insert(callable.to_string(), Reply::Ok(value));
        self
    }

    pub fn with_error(self, callable: &str, message: &str) -> Self {
        self.lock_states()
            .insert(callable.to_string(), Reply::Err(message.to_string()));
        self
    }

    pub fn with_raw_transaction(self, callable: &str, body: Value) -> Self {
        if let Ok(mut transactions) = self.transactions.lock() {
            transactions.insert(callable.to_string(), body);
        }
        self
    }

    /// Every call received, in order
    pub fn calls(&self) -> Vec<ContractCall> {
        self.calls.lock().map(|calls| calls.clone()).unwrap_or_default()
    }

    fn lock_states(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Reply<Value>>> {
        self.states.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record(&self, call: &ContractCall) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call.clone());
        }
    }
}

#[async_trait]
impl ContractApi for MockContractApi {
    async fn get_state(&self, call: ContractCall) -> Result<Value, ExternalCallError> {
        self.record(&call);
        match self.lock_states().get(&call.callable) {
            Some(Reply::Ok(value)) => Ok(value.clone()),
            Some(Reply::Err(message)) => Err(ExternalCallError::Contract {
                callable: call.callable.clone(),
                message: message.clone(),
            }),
            None => Err(ExternalCallError::Contract {
                callable: call.callable.clone(),
                message: "no canned response".to_string(),
            }),
        }
    }

    async fn get_raw_transaction(&self, call: ContractCall) -> Result<RawTransaction, ExternalCallError> {
        self.record(&call);
        let body = self
            .transactions
            .lock()
            .ok()
            .and_then(|transactions| transactions.get(&call.callable).cloned());
        match body {
            Some(body) => Ok(RawTransaction {
                ledger_id: "ethereum".to_string(),
                body,
            }),
            None => Err(ExternalCallError::Contract {
                callable: call.callable.clone(),
                message: "no canned transaction".to_string(),
            }),
        }
    }
}

/// HTTP collaborator answering from canned responses keyed by URL
#[derive(Clone, Default)]
pub struct MockHttpClient {
    responses: Arc<Mutex<BTreeMap<String, HttpResponse>>>,
    requests: Arc<Mutex<Vec<HttpRequest>>>,
}

impl MockHttpClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_json(self, url: &str, body: Value) -> Self {
        self.insert(url, HttpResponse::new(200, body.to_string()));
        self
    }

    pub fn with_status(self, url: &str, status_code: u16) -> Self {
        self.insert(url, HttpResponse::new(status_code, Vec::new()));
        self
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    fn insert(&self, url: &str, response: HttpResponse) {
        if let Ok(mut responses) = self.responses.lock() {
            responses.insert(url.to_string(), response);
        }
    }
}

#[async_trait]
impl HttpClient for MockHttpClient {
    async fn request(&self, request: HttpRequest) -> Result<HttpResponse, ExternalCallError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        self.responses
            .lock()
            .ok()
            .and_then(|responses| responses.get(&request.url).cloned())
            .ok_or_else(|| ExternalCallError::Http {
                url: request.url.clone(),
                message: "connection refused".to_string(),
            })
    }
}

/// Submits a fixed content, then waits for the round to end
#[derive(Debug, Clone)]
pub struct StaticBehaviour {
    id: String,
    round: RoundId,
    content: Value,
}

impl StaticBehaviour {
    pub fn new(id: impl Into<String>, round: RoundId, content: Value) -> Self {
        Self {
            id: id.into(),
            round,
            content,
        }
    }
}

#[async_trait]
impl Behaviour for StaticBehaviour {
    fn behaviour_id(&self) -> &str {
        &self.id
    }

    fn matching_round(&self) -> RoundId {
        self.round
    }

    async fn act(&self, ctx: &BehaviourContext) -> Result<(), BehaviourError> {
        ctx.send_a2a_transaction(self.content.clone()).await?;
        ctx.wait_until_round_end().await;
        Ok(())
    }
}

/// Fails its first `failures` acts, then behaves like [`StaticBehaviour`]
#[derive(Debug)]
pub struct FlakyBehaviour {
    inner: StaticBehaviour,
    failures: usize,
    attempts: AtomicUsize,
}

impl FlakyBehaviour {
    pub fn new(inner: StaticBehaviour, failures: usize) -> Self {
        Self {
            inner,
            failures,
            attempts: AtomicUsize::new(0),
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Behaviour for FlakyBehaviour {
    fn behaviour_id(&self) -> &str {
        self.inner.behaviour_id()
    }

    fn matching_round(&self) -> RoundId {
        self.inner.matching_round()
    }

    async fn act(&self, ctx: &BehaviourContext) -> Result<(), BehaviourError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.failures {
            return Err(ExternalCallError::Http {
                url: "http://flaky".to_string(),
                message: format!("attempt {attempt} failed"),
            }
            .into());
        }
        self.inner.act(ctx).await
    }
}

//! # Rounds
//!
//! A round is one state of the replicated machine. While it is current it
//! accumulates at most one payload per participant and, at the end of every
//! block, decides whether it is complete. Completion yields the next version
//! of the synchronized data together with the event that selects the next
//! round.
//!
//! ## Aggregation Archetypes
//!
//! - **CollectSameUntilAll**: every participant submitted the same value
//! - **CollectSameUntilThreshold**: the most voted value reached the consensus threshold
//! - **CollectDifferentUntilAll**: every participant submitted a distinct value
//! - **CollectDifferentUntilThreshold**: enough participants submitted anything
//! - **OnlyKeeperSends**: the elected keeper alone decides the outcome
//! - **Voting**: boolean votes with positive, negative and abstain outcomes
//! - **Degenerate**: terminal round, never completes
//! - **Custom**: application supplied [`RoundStrategy`]
//!
//! `end_block` is a pure function of the entry data and the collected
//! payloads. Collections are kept in a `BTreeMap` keyed by sender so that all
//! replicas iterate them in the same order.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::payload::{Payload, PayloadError};
use crate::synchronized_data::{SynchronizedData, KEEPER_KEY};
use crate::{AbciError, AbciResult, Address, AppEvent, RoundId};

/// Outcome of a completed round
pub type RoundOutcome<E> = Option<(SynchronizedData, E)>;

/// Smallest number of agreeing participants that makes a decision safe:
/// `ceil((2n + 1) / 3)`
pub fn consensus_threshold(nb_participants: usize) -> usize {
    (2 * nb_participants + 3) / 3
}

/// Read-only view of a round handed to its aggregation strategy
#[derive(Debug, Clone, Copy)]
pub struct RoundContext<'a> {
    pub round_id: RoundId,
    pub synchronized_data: &'a SynchronizedData,
    pub participants: &'a BTreeSet<Address>,
    pub collection: &'a BTreeMap<Address, Payload>,
    pub threshold: usize,
}

impl<'a> RoundContext<'a> {
    pub fn nb_participants(&self) -> usize {
        self.participants.len()
    }

    pub fn threshold_reached(&self) -> bool {
        self.collection.len() >= self.threshold
    }

    /// Count of each distinct selected value, in first-seen sender order
    pub fn tally(&self, attribute: Option<&str>) -> Vec<(&'a Value, usize)> {
        let mut counts: Vec<(&'a Value, usize)> = Vec::new();
        for payload in self.collection.values() {
            let Some(value) = payload.attribute(attribute) else {
                continue;
            };
            match counts.iter_mut().find(|(seen, _)| *seen == value) {
                Some((_, count)) => *count += 1,
                None => counts.push((value, 1)),
            }
        }
        counts
    }

    /// Most voted value and its count. Ties resolve to the value whose first
    /// sender sorts lowest.
    pub fn most_voted(&self, attribute: Option<&str>) -> Option<(&'a Value, usize)> {
        self.tally(attribute)
            .into_iter()
            .fold(None, |best, (value, count)| match best {
                Some((_, best_count)) if best_count >= count => best,
                _ => Some((value, count)),
            })
    }

    /// Whether the missing payloads could still lift a value to the threshold
    pub fn is_majority_possible(&self, attribute: Option<&str>) -> bool {
        let leading = self.most_voted(attribute).map(|(_, count)| count).unwrap_or(0);
        let remaining = self.nb_participants().saturating_sub(self.collection.len());
        leading + remaining >= self.threshold
    }

    /// The collection as a JSON object `sender -> content`
    pub fn collection_map(&self) -> Value {
        let map: Map<String, Value> = self
            .collection
            .iter()
            .map(|(sender, payload)| (sender.clone(), payload.content().clone()))
            .collect();
        Value::Object(map)
    }

    fn commit<E: AppEvent>(&self, event: E, entries: Vec<(String, Value)>) -> AbciResult<RoundOutcome<E>> {
        let data = self.synchronized_data.update(entries)?;
        Ok(Some((data, event)))
    }
}

/// The single interface every aggregation archetype implements
pub trait RoundStrategy<E: AppEvent>: Send + Sync {
    /// Archetype specific validity check, run after the common checks
    fn check_payload(&self, _ctx: &RoundContext<'_>, _payload: &Payload) -> Result<(), PayloadError> {
        Ok(())
    }

    /// Hook invoked once a payload has been accepted
    fn process_payload(&mut self, _ctx: &RoundContext<'_>, _payload: &Payload) {}

    /// `None` until the completion predicate holds
    fn end_block(&self, ctx: &RoundContext<'_>) -> AbciResult<RoundOutcome<E>>;

    /// Every event `end_block` may emit. The app spec refuses to build
    /// unless each of them has an edge out of the round.
    fn declared_events(&self) -> Vec<E>;
}

/// Configuration shared by the collect archetypes
#[derive(Debug, Clone)]
pub struct CollectConfig<E> {
    pub done_event: E,
    pub no_majority_event: Option<E>,
    pub none_event: Option<E>,
    /// Payload attribute compared between participants; whole content if unset
    pub payload_attribute: Option<String>,
    /// Key receiving the agreed value
    pub selection_key: Option<String>,
    /// Key receiving the `sender -> content` map
    pub collection_key: Option<String>,
}

impl<E: AppEvent> CollectConfig<E> {
    pub fn new(done_event: E) -> Self {
        Self {
            done_event,
            no_majority_event: None,
            none_event: None,
            payload_attribute: None,
            selection_key: None,
            collection_key: None,
        }
    }

    pub fn with_no_majority_event(mut self, event: E) -> Self {
        self.no_majority_event = Some(event);
        self
    }

    pub fn with_none_event(mut self, event: E) -> Self {
        self.none_event = Some(event);
        self
    }

    pub fn with_payload_attribute(mut self, attribute: impl Into<String>) -> Self {
        self.payload_attribute = Some(attribute.into());
        self
    }

    pub fn with_selection_key(mut self, key: impl Into<String>) -> Self {
        self.selection_key = Some(key.into());
        self
    }

    pub fn with_collection_key(mut self, key: impl Into<String>) -> Self {
        self.collection_key = Some(key.into());
        self
    }

    fn attribute(&self) -> Option<&str> {
        self.payload_attribute.as_deref()
    }

    fn entries(&self, ctx: &RoundContext<'_>, selected: Option<&Value>) -> Vec<(String, Value)> {
        let mut entries = Vec::new();
        if let (Some(key), Some(value)) = (&self.selection_key, selected) {
            entries.push((key.clone(), value.clone()));
        }
        if let Some(key) = &self.collection_key {
            entries.push((key.clone(), ctx.collection_map()));
        }
        entries
    }

    fn events(&self) -> Vec<E> {
        std::iter::once(self.done_event)
            .chain(self.none_event)
            .chain(self.no_majority_event)
            .collect()
    }
}

/// Configuration of the keeper-only archetype
#[derive(Debug, Clone)]
pub struct KeeperConfig<E> {
    pub done_event: E,
    /// Emitted when the keeper submits a null value
    pub fail_event: Option<E>,
    pub payload_attribute: Option<String>,
    pub selection_key: Option<String>,
    /// Key naming the keeper address
    pub keeper_key: String,
}

impl<E: AppEvent> KeeperConfig<E> {
    pub fn new(done_event: E) -> Self {
        Self {
            done_event,
            fail_event: None,
            payload_attribute: None,
            selection_key: None,
            keeper_key: KEEPER_KEY.to_string(),
        }
    }

    pub fn with_fail_event(mut self, event: E) -> Self {
        self.fail_event = Some(event);
        self
    }

    pub fn with_payload_attribute(mut self, attribute: impl Into<String>) -> Self {
        self.payload_attribute = Some(attribute.into());
        self
    }

    pub fn with_selection_key(mut self, key: impl Into<String>) -> Self {
        self.selection_key = Some(key.into());
        self
    }

    pub fn with_keeper_key(mut self, key: impl Into<String>) -> Self {
        self.keeper_key = key.into();
        self
    }
}

/// Configuration of the voting archetype. Votes are `true`, `false` or `null`.
#[derive(Debug, Clone)]
pub struct VotingConfig<E> {
    /// Emitted when positive votes reach the threshold
    pub done_event: E,
    pub negative_event: Option<E>,
    pub none_event: Option<E>,
    pub no_majority_event: Option<E>,
    pub payload_attribute: Option<String>,
    pub collection_key: Option<String>,
}

impl<E: AppEvent> VotingConfig<E> {
    pub fn new(done_event: E) -> Self {
        Self {
            done_event,
            negative_event: None,
            none_event: None,
            no_majority_event: None,
            payload_attribute: Some("vote".to_string()),
            collection_key: None,
        }
    }

    pub fn with_negative_event(mut self, event: E) -> Self {
        self.negative_event = Some(event);
        self
    }

    pub fn with_none_event(mut self, event: E) -> Self {
        self.none_event = Some(event);
        self
    }

    pub fn with_no_majority_event(mut self, event: E) -> Self {
        self.no_majority_event = Some(event);
        self
    }

    pub fn with_payload_attribute(mut self, attribute: impl Into<String>) -> Self {
        self.payload_attribute = Some(attribute.into());
        self
    }

    pub fn with_collection_key(mut self, key: impl Into<String>) -> Self {
        self.collection_key = Some(key.into());
        self
    }
}

/// Closed set of aggregation archetypes plus the custom extension point
pub enum Aggregation<E: AppEvent> {
    CollectSameUntilAll(CollectConfig<E>),
    CollectSameUntilThreshold(CollectConfig<E>),
    CollectDifferentUntilAll(CollectConfig<E>),
    CollectDifferentUntilThreshold(CollectConfig<E>),
    OnlyKeeperSends(KeeperConfig<E>),
    Voting(VotingConfig<E>),
    Degenerate,
    Custom(Box<dyn RoundStrategy<E>>),
}

impl<E: AppEvent> Aggregation<E> {
    pub fn name(&self) -> &'static str {
        match self {
            Self::CollectSameUntilAll(_) => "collect_same_until_all",
            Self::CollectSameUntilThreshold(_) => "collect_same_until_threshold",
            Self::CollectDifferentUntilAll(_) => "collect_different_until_all",
            Self::CollectDifferentUntilThreshold(_) => "collect_different_until_threshold",
            Self::OnlyKeeperSends(_) => "only_keeper_sends",
            Self::Voting(_) => "voting",
            Self::Degenerate => "degenerate",
            Self::Custom(_) => "custom",
        }
    }

    pub fn is_degenerate(&self) -> bool {
        matches!(self, Self::Degenerate)
    }
}

impl<E: AppEvent> fmt::Debug for Aggregation<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Aggregation").field(&self.name()).finish()
    }
}

fn selected<'p>(attribute: Option<&str>, payload: &'p Payload) -> Result<&'p Value, PayloadError> {
    payload.attribute(attribute).ok_or_else(|| {
        PayloadError::Invalid(format!("missing attribute `{}`", attribute.unwrap_or_default()))
    })
}

impl<E: AppEvent> RoundStrategy<E> for Aggregation<E> {
    fn check_payload(&self, ctx: &RoundContext<'_>, payload: &Payload) -> Result<(), PayloadError> {
        match self {
            Self::CollectSameUntilAll(config) => {
                let value = selected(config.attribute(), payload)?;
                if let Some(first) = ctx.collection.values().next() {
                    let expected = selected(config.attribute(), first)?;
                    if expected != value {
                        return Err(PayloadError::Mismatch {
                            expected: expected.to_string(),
                            found: value.to_string(),
                        });
                    }
                }
                Ok(())
            }
            Self::CollectSameUntilThreshold(config) | Self::CollectDifferentUntilThreshold(config) => {
                selected(config.attribute(), payload).map(|_| ())
            }
            Self::CollectDifferentUntilAll(config) => {
                let value = selected(config.attribute(), payload)?;
                let taken = ctx
                    .collection
                    .values()
                    .any(|other| other.attribute(config.attribute()) == Some(value));
                if taken {
                    return Err(PayloadError::DuplicateValue(value.to_string()));
                }
                Ok(())
            }
            Self::OnlyKeeperSends(config) => {
                let keeper: Address = ctx
                    .synchronized_data
                    .get_strict(&config.keeper_key)
                    .map_err(|e| PayloadError::Invalid(e.to_string()))?;
                if payload.sender() != keeper {
                    return Err(PayloadError::NotKeeper {
                        sender: payload.sender().to_string(),
                        keeper,
                    });
                }
                Ok(())
            }
            Self::Voting(config) => match selected(config.payload_attribute.as_deref(), payload)? {
                Value::Bool(_) | Value::Null => Ok(()),
                other => Err(PayloadError::Invalid(format!("vote must be a boolean or null, got {other}"))),
            },
            Self::Degenerate => Err(PayloadError::RoundClosed(ctx.round_id.to_string())),
            Self::Custom(strategy) => strategy.check_payload(ctx, payload),
        }
    }

    fn process_payload(&mut self, ctx: &RoundContext<'_>, payload: &Payload) {
        if let Self::Custom(strategy) = self {
            strategy.process_payload(ctx, payload);
        }
    }

    fn end_block(&self, ctx: &RoundContext<'_>) -> AbciResult<RoundOutcome<E>> {
        let entry = ctx.synchronized_data;
        match self {
            Self::CollectSameUntilAll(config) => {
                let complete = ctx.nb_participants() > 0 && ctx.collection.len() >= ctx.nb_participants();
                let Some(first) = ctx.collection.values().next().filter(|_| complete) else {
                    return Ok(None);
                };
                let value = first.attribute(config.attribute()).unwrap_or(&Value::Null);
                match config.none_event {
                    Some(event) if value.is_null() => Ok(Some((entry.clone(), event))),
                    _ => ctx.commit(config.done_event, config.entries(ctx, Some(value))),
                }
            }
            Self::CollectSameUntilThreshold(config) => {
                if let Some((value, count)) = ctx.most_voted(config.attribute()) {
                    if count >= ctx.threshold {
                        return match config.none_event {
                            Some(event) if value.is_null() => Ok(Some((entry.clone(), event))),
                            _ => ctx.commit(config.done_event, config.entries(ctx, Some(value))),
                        };
                    }
                }
                match config.no_majority_event {
                    Some(event) if !ctx.is_majority_possible(config.attribute()) => {
                        Ok(Some((entry.clone(), event)))
                    }
                    _ => Ok(None),
                }
            }
            Self::CollectDifferentUntilAll(config) => {
                if ctx.nb_participants() == 0 || ctx.collection.len() < ctx.nb_participants() {
                    return Ok(None);
                }
                ctx.commit(config.done_event, config.entries(ctx, None))
            }
            Self::CollectDifferentUntilThreshold(config) => {
                if !ctx.threshold_reached() {
                    return Ok(None);
                }
                ctx.commit(config.done_event, config.entries(ctx, None))
            }
            Self::OnlyKeeperSends(config) => {
                let Some(payload) = ctx.collection.values().next() else {
                    return Ok(None);
                };
                let value = payload
                    .attribute(config.payload_attribute.as_deref())
                    .unwrap_or(&Value::Null);
                match config.fail_event {
                    Some(event) if value.is_null() => Ok(Some((entry.clone(), event))),
                    _ => {
                        let entries = config
                            .selection_key
                            .iter()
                            .map(|key| (key.clone(), value.clone()))
                            .collect();
                        ctx.commit(config.done_event, entries)
                    }
                }
            }
            Self::Voting(config) => {
                let attribute = config.payload_attribute.as_deref();
                let count = |wanted: &Value| {
                    ctx.collection
                        .values()
                        .filter(|p| p.attribute(attribute) == Some(wanted))
                        .count()
                };
                let positive = count(&Value::Bool(true));
                let negative = count(&Value::Bool(false));
                let abstain = count(&Value::Null);
                let entries = || {
                    config
                        .collection_key
                        .iter()
                        .map(|key| (key.clone(), ctx.collection_map()))
                        .collect::<Vec<_>>()
                };

                if positive >= ctx.threshold {
                    return ctx.commit(config.done_event, entries());
                }
                if let Some(event) = config.negative_event.filter(|_| negative >= ctx.threshold) {
                    return ctx.commit(event, entries());
                }
                if let Some(event) = config.none_event.filter(|_| abstain >= ctx.threshold) {
                    return ctx.commit(event, entries());
                }
                let remaining = ctx.nb_participants().saturating_sub(ctx.collection.len());
                let leading = positive.max(negative).max(abstain);
                match config.no_majority_event {
                    Some(event) if leading + remaining < ctx.threshold => Ok(Some((entry.clone(), event))),
                    _ => Ok(None),
                }
            }
            Self::Degenerate => Err(AbciError::DegenerateRound(ctx.round_id)),
            Self::Custom(strategy) => strategy.end_block(ctx),
        }
    }

    fn declared_events(&self) -> Vec<E> {
        match self {
            Self::CollectSameUntilAll(config)
            | Self::CollectSameUntilThreshold(config)
            | Self::CollectDifferentUntilAll(config)
            | Self::CollectDifferentUntilThreshold(config) => config.events(),
            Self::OnlyKeeperSends(config) => {
                std::iter::once(config.done_event).chain(config.fail_event).collect()
            }
            Self::Voting(config) => std::iter::once(config.done_event)
                .chain(config.negative_event)
                .chain(config.none_event)
                .chain(config.no_majority_event)
                .collect(),
            Self::Degenerate => Vec::new(),
            Self::Custom(strategy) => strategy.declared_events(),
        }
    }
}

/// Factory producing a fresh aggregation for every round entry
pub type RoundFactory<E> = Arc<dyn Fn() -> Aggregation<E> + Send + Sync>;

/// Static description of a round inside an application
pub struct RoundSpec<E: AppEvent> {
    id: RoundId,
    factory: RoundFactory<E>,
}

impl<E: AppEvent> Clone for RoundSpec<E> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            factory: Arc::clone(&self.factory),
        }
    }
}

impl<E: AppEvent> fmt::Debug for RoundSpec<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoundSpec")
            .field("id", &self.id)
            .field("aggregation", &self.instantiate().name())
            .finish()
    }
}

impl<E: AppEvent> RoundSpec<E> {
    pub fn new<F>(id: RoundId, factory: F) -> Self
    where
        F: Fn() -> Aggregation<E> + Send + Sync + 'static,
    {
        Self {
            id,
            factory: Arc::new(factory),
        }
    }

    pub fn collect_same_until_all(id: RoundId, config: CollectConfig<E>) -> Self {
        Self::new(id, move || Aggregation::CollectSameUntilAll(config.clone()))
    }

    pub fn collect_same_until_threshold(id: RoundId, config: CollectConfig<E>) -> Self {
        Self::new(id, move || Aggregation::CollectSameUntilThreshold(config.clone()))
    }

    pub fn collect_different_until_all(id: RoundId, config: CollectConfig<E>) -> Self {
        Self::new(id, move || Aggregation::CollectDifferentUntilAll(config.clone()))
    }

    pub fn collect_different_until_threshold(id: RoundId, config: CollectConfig<E>) -> Self {
        Self::new(id, move || Aggregation::CollectDifferentUntilThreshold(config.clone()))
    }

    pub fn only_keeper_sends(id: RoundId, config: KeeperConfig<E>) -> Self {
        Self::new(id, move || Aggregation::OnlyKeeperSends(config.clone()))
    }

    pub fn voting(id: RoundId, config: VotingConfig<E>) -> Self {
        Self::new(id, move || Aggregation::Voting(config.clone()))
    }

    pub fn degenerate(id: RoundId) -> Self {
        Self::new(id, || Aggregation::Degenerate)
    }

    /// Round driven by an application strategy; `factory` runs on every entry
    pub fn custom<S, F>(id: RoundId, factory: F) -> Self
    where
        S: RoundStrategy<E> + 'static,
        F: Fn() -> S + Send + Sync + 'static,
    {
        Self::new(id, move || Aggregation::Custom(Box::new(factory())))
    }

    pub fn id(&self) -> RoundId {
        self.id
    }

    pub fn instantiate(&self) -> Aggregation<E> {
        (self.factory)()
    }
}

/// One live entry of a round
#[derive(Debug)]
pub struct Round<E: AppEvent> {
    id: RoundId,
    synchronized_data: SynchronizedData,
    participants: BTreeSet<Address>,
    collection: BTreeMap<Address, Payload>,
    threshold: usize,
    aggregation: Aggregation<E>,
}

impl<E: AppEvent> Round<E> {
    /// Enter `spec` with `synchronized_data` as entry state.
    ///
    /// `threshold` overrides [`consensus_threshold`] when given.
    pub fn new(spec: &RoundSpec<E>, synchronized_data: SynchronizedData, threshold: Option<usize>) -> AbciResult<Self> {
        let aggregation = spec.instantiate();
        let participants = if aggregation.is_degenerate() {
            synchronized_data.participants().unwrap_or_default()
        } else {
            synchronized_data.participants()?
        };
        let threshold = threshold.unwrap_or_else(|| consensus_threshold(participants.len()));

        Ok(Self {
            id: spec.id(),
            synchronized_data,
            participants,
            collection: BTreeMap::new(),
            threshold,
            aggregation,
        })
    }

    pub fn id(&self) -> RoundId {
        self.id
    }

    /// Entry state of this round
    pub fn synchronized_data(&self) -> &SynchronizedData {
        &self.synchronized_data
    }

    pub fn participants(&self) -> &BTreeSet<Address> {
        &self.participants
    }

    pub fn collection(&self) -> &BTreeMap<Address, Payload> {
        &self.collection
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn aggregation(&self) -> &Aggregation<E> {
        &self.aggregation
    }

    pub fn is_degenerate(&self) -> bool {
        self.aggregation.is_degenerate()
    }

    fn context(&self) -> RoundContext<'_> {
        RoundContext {
            round_id: self.id,
            synchronized_data: &self.synchronized_data,
            participants: &self.participants,
            collection: &self.collection,
            threshold: self.threshold,
        }
    }

    /// Common checks shared by all archetypes, then the archetype's own
    pub fn check_payload(&self, payload: &Payload) -> Result<(), PayloadError> {
        if payload.round_id() != self.id {
            return Err(PayloadError::WrongRound {
                round: self.id.to_string(),
                payload_round: payload.round_id().to_string(),
            });
        }
        if self.is_degenerate() {
            return Err(PayloadError::RoundClosed(self.id.to_string()));
        }
        if !self.participants.contains(payload.sender()) {
            return Err(PayloadError::NotParticipant(payload.sender().to_string()));
        }
        if self.collection.contains_key(payload.sender()) {
            return Err(PayloadError::DuplicateSender {
                round: self.id.to_string(),
                sender: payload.sender().to_string(),
            });
        }
        self.aggregation.check_payload(&self.context(), payload)
    }

    /// Check and record `payload`
    pub fn process_payload(&mut self, payload: Payload) -> Result<(), PayloadError> {
        self.check_payload(&payload)?;

        let ctx = RoundContext {
            round_id: self.id,
            synchronized_data: &self.synchronized_data,
            participants: &self.participants,
            collection: &self.collection,
            threshold: self.threshold,
        };
        self.aggregation.process_payload(&ctx, &payload);

        self.collection.insert(payload.sender().to_string(), payload);
        Ok(())
    }

    pub fn end_block(&self) -> AbciResult<RoundOutcome<E>> {
        self.aggregation.end_block(&self.context())
    }

    pub fn declared_events(&self) -> Vec<E> {
        self.aggregation.declared_events()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_tools::{participants, setup_data, TestEvent};
    use serde_json::json;

    fn enter(spec: &RoundSpec<TestEvent>, n: usize) -> Round<TestEvent> {
        Round::new(spec, setup_data(&participants(n)), None).unwrap()
    }

    fn payload(round: &str, sender: usize, content: Value) -> Payload {
        Payload::new(round, format!("agent_{sender}"), content)
    }

    #[test]
    fn test_consensus_threshold() {
        assert_eq!(consensus_threshold(1), 1);
        assert_eq!(consensus_threshold(3), 3);
        assert_eq!(consensus_threshold(4), 3);
        assert_eq!(consensus_threshold(7), 5);
        assert_eq!(consensus_threshold(10), 7);
    }

    #[test]
    fn test_common_checks() {
        let spec = RoundSpec::collect_same_until_all("collect", CollectConfig::new(TestEvent::Done));
        let mut round = enter(&spec, 4);

        let wrong_round = payload("other", 0, json!(1));
        assert!(matches!(round.check_payload(&wrong_round), Err(PayloadError::WrongRound { .. })));

        let stranger = Payload::new("collect", "mallory", json!(1));
        assert!(matches!(round.check_payload(&stranger), Err(PayloadError::NotParticipant(_))));

        round.process_payload(payload("collect", 0, json!(1))).unwrap();
        let again = payload("collect", 0, json!(1));
        assert!(matches!(round.process_payload(again), Err(PayloadError::DuplicateSender { .. })));
        assert_eq!(round.collection().len(), 1);
    }

    #[test]
    fn test_collect_same_until_all_rejects_divergent_value() {
        let config = CollectConfig::new(TestEvent::Done).with_payload_attribute("value");
        let spec = RoundSpec::collect_same_until_all("collect", config);
        let mut round = enter(&spec, 2);

        round.process_payload(payload("collect", 0, json!({"value": "X"}))).unwrap();
        let divergent = payload("collect", 1, json!({"value": "Y"}));
        assert!(matches!(round.process_payload(divergent), Err(PayloadError::Mismatch { .. })));
        assert!(round.end_block().unwrap().is_none());
    }

    #[test]
    fn test_collect_same_until_threshold_no_majority() {
        let config = CollectConfig::new(TestEvent::Done).with_no_majority_event(TestEvent::NoMajority);
        let spec = RoundSpec::collect_same_until_threshold("collect", config);
        let mut round = enter(&spec, 4);

        round.process_payload(payload("collect", 0, json!("A"))).unwrap();
        round.process_payload(payload("collect", 1, json!("B"))).unwrap();
        assert!(round.end_block().unwrap().is_none());

        round.process_payload(payload("collect", 2, json!("C"))).unwrap();
        let (_, event) = round.end_block().unwrap().unwrap();
        assert_eq!(event, TestEvent::NoMajority);
    }

    #[test]
    fn test_collect_same_until_threshold_none_event() {
        let config = CollectConfig::new(TestEvent::Done)
            .with_none_event(TestEvent::None)
            .with_selection_key("agreed");
        let spec = RoundSpec::collect_same_until_threshold("collect", config);
        let mut round = enter(&spec, 4);
        for sender in 0..3 {
            round.process_payload(payload("collect", sender, Value::Null)).unwrap();
        }

        let (data, event) = round.end_block().unwrap().unwrap();
        assert_eq!(event, TestEvent::None);
        assert_eq!(data.get("agreed"), None);
    }

    #[test]
    fn test_collect_different_until_all() {
        let config = CollectConfig::new(TestEvent::Done).with_collection_key("registrations");
        let spec = RoundSpec::collect_different_until_all("register", config);
        let mut round = enter(&spec, 3);

        round.process_payload(payload("register", 0, json!("a"))).unwrap();
        let copy = payload("register", 1, json!("a"));
        assert!(matches!(round.process_payload(copy), Err(PayloadError::DuplicateValue(_))));
        round.process_payload(payload("register", 1, json!("b"))).unwrap();
        assert!(round.end_block().unwrap().is_none());
        round.process_payload(payload("register", 2, json!("c"))).unwrap();

        let (data, event) = round.end_block().unwrap().unwrap();
        assert_eq!(event, TestEvent::Done);
        assert_eq!(
            data.get("registrations"),
            Some(&json!({"agent_0": "a", "agent_1": "b", "agent_2": "c"}))
        );
    }

    #[test]
    fn test_collect_different_until_threshold_tolerates_divergence() {
        let config = CollectConfig::new(TestEvent::Done).with_collection_key("observations");
        let spec = RoundSpec::collect_different_until_threshold("observe", config);
        let mut round = enter(&spec, 4);

        for (sender, value) in [(0, json!(1)), (1, json!(1)), (2, json!(7))] {
            round.process_payload(payload("observe", sender, value)).unwrap();
        }
        let (data, _) = round.end_block().unwrap().unwrap();
        assert_eq!(data.get("observations").unwrap().as_object().unwrap().len(), 3);
    }

    #[test]
    fn test_only_keeper_sends() {
        let config = KeeperConfig::new(TestEvent::Done)
            .with_fail_event(TestEvent::Fail)
            .with_payload_attribute("tx_hash")
            .with_selection_key("final_tx_hash");
        let spec = RoundSpec::only_keeper_sends("submit", config);
        let data = setup_data(&participants(4))
            .update([(KEEPER_KEY, json!("agent_2"))])
            .unwrap();
        let mut round = Round::new(&spec, data, None).unwrap();

        let intruder = payload("submit", 0, json!({"tx_hash": "0xabc"}));
        assert!(matches!(round.process_payload(intruder), Err(PayloadError::NotKeeper { .. })));
        assert!(round.end_block().unwrap().is_none());

        round.process_payload(payload("submit", 2, json!({"tx_hash": "0xabc"}))).unwrap();
        let (data, event) = round.end_block().unwrap().unwrap();
        assert_eq!(event, TestEvent::Done);
        assert_eq!(data.get("final_tx_hash"), Some(&json!("0xabc")));
    }

    #[test]
    fn test_voting_outcomes() {
        let config = VotingConfig::new(TestEvent::Done)
            .with_negative_event(TestEvent::Negative)
            .with_no_majority_event(TestEvent::NoMajority);
        let spec = RoundSpec::voting("vote", config);

        let mut round = enter(&spec, 4);
        for sender in 0..3 {
            round.process_payload(payload("vote", sender, json!({"vote": false}))).unwrap();
        }
        assert_eq!(round.end_block().unwrap().unwrap().1, TestEvent::Negative);

        let mut split = enter(&spec, 4);
        for (sender, vote) in [(0, true), (1, true), (2, false), (3, false)] {
            split.process_payload(payload("vote", sender, json!({"vote": vote}))).unwrap();
        }
        assert_eq!(split.end_block().unwrap().unwrap().1, TestEvent::NoMajority);

        let invalid = payload("vote", 0, json!({"vote": "yes"}));
        assert!(matches!(enter(&spec, 4).check_payload(&invalid), Err(PayloadError::Invalid(_))));
    }

    #[test]
    fn test_degenerate_round() {
        let spec: RoundSpec<TestEvent> = RoundSpec::degenerate("finished");
        let round = enter(&spec, 4);

        let attempt = payload("finished", 0, json!(1));
        assert!(matches!(round.check_payload(&attempt), Err(PayloadError::RoundClosed(_))));
        assert_eq!(round.end_block(), Err(AbciError::DegenerateRound("finished")));
        assert!(round.declared_events().is_empty());
    }

    #[test]
    fn test_threshold_override() {
        let spec = RoundSpec::collect_different_until_threshold("observe", CollectConfig::new(TestEvent::Done));
        let round = Round::new(&spec, setup_data(&participants(4)), Some(4)).unwrap();
        assert_eq!(round.threshold(), 4);
    }

    #[test]
    fn test_missing_participants_is_fatal() {
        let spec = RoundSpec::collect_same_until_all("collect", CollectConfig::new(TestEvent::Done));
        let result = Round::new(&spec, SynchronizedData::create(BTreeMap::new()), None);
        assert!(matches!(result, Err(AbciError::Db(_))));
    }
}

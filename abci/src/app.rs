//! # ABCI Application
//!
//! The application couples a static transition table with the runtime that
//! consumes consensus blocks.
//!
//! ## Key Features
//!
//! - **Declarative table**: `(round, event) -> round` edges, built with [`AbciAppSpecBuilder`]
//! - **Static validation**: dangling edges, stalled or unreachable rounds and
//!   undeclared events are rejected before the app runs
//! - **Timeouts**: one deadline per timed outgoing event, measured in block time
//! - **Conditions**: required keys checked on entry of initial and final rounds
//! - **Periods**: `reset` starts a new period carrying the persisted keys
//!
//! Every replica fed the same blocks walks through the same transitions and
//! ends with the same synchronized data.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::payload::{Payload, PayloadError};
use crate::rounds::{Round, RoundSpec, RoundStrategy};
use crate::synchronized_data::SynchronizedData;
use crate::{AbciError, AbciResult, AppEvent, RoundId};

/// Ordered batch of payloads delivered by the consensus layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub height: u64,
    pub timestamp: DateTime<Utc>,
    pub payloads: Vec<Payload>,
}

impl Block {
    pub fn new(height: u64, timestamp: DateTime<Utc>, payloads: Vec<Payload>) -> Self {
        Self {
            height,
            timestamp,
            payloads,
        }
    }
}

/// One edge taken by the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition<E> {
    pub from: RoundId,
    pub event: E,
    pub to: RoundId,
    /// Round count after entering `to`
    pub round_count: u64,
    pub period_count: u64,
    pub timestamp: DateTime<Utc>,
}

/// Static description of an application: rounds, edges, timeouts and
/// conditions. Immutable once built.
#[derive(Debug)]
pub struct AbciAppSpec<E: AppEvent> {
    name: String,
    rounds: IndexMap<RoundId, RoundSpec<E>>,
    transition_function: IndexMap<RoundId, IndexMap<E, RoundId>>,
    initial_round: RoundId,
    initial_states: BTreeSet<RoundId>,
    final_states: BTreeSet<RoundId>,
    event_to_timeout: BTreeMap<E, Duration>,
    db_pre_conditions: BTreeMap<RoundId, BTreeSet<String>>,
    db_post_conditions: BTreeMap<RoundId, BTreeSet<String>>,
    cross_period_persisted_keys: BTreeSet<String>,
}

impl<E: AppEvent> AbciAppSpec<E> {
    pub fn builder(name: impl Into<String>) -> AbciAppSpecBuilder<E> {
        AbciAppSpecBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn initial_round(&self) -> RoundId {
        self.initial_round
    }

    pub fn initial_states(&self) -> &BTreeSet<RoundId> {
        &self.initial_states
    }

    pub fn final_states(&self) -> &BTreeSet<RoundId> {
        &self.final_states
    }

    pub fn is_final(&self, round: RoundId) -> bool {
        self.final_states.contains(round)
    }

    pub fn rounds(&self) -> impl Iterator<Item = &RoundSpec<E>> {
        self.rounds.values()
    }

    pub fn round(&self, id: &str) -> Option<&RoundSpec<E>> {
        self.rounds.get(id)
    }

    /// Outgoing edges of `round`, in declaration order
    pub fn transitions(&self, round: &str) -> Option<&IndexMap<E, RoundId>> {
        self.transition_function.get(round)
    }

    pub fn next_round(&self, round: &str, event: E) -> Option<RoundId> {
        self.transitions(round)?.get(&event).copied()
    }

    pub fn event_to_timeout(&self) -> &BTreeMap<E, Duration> {
        &self.event_to_timeout
    }

    pub fn timeout(&self, event: E) -> Option<Duration> {
        self.event_to_timeout.get(&event).copied()
    }

    /// All events used on any edge
    pub fn events(&self) -> BTreeSet<E> {
        self.transition_function
            .values()
            .flat_map(|edges| edges.keys().copied())
            .collect()
    }

    pub fn cross_period_persisted_keys(&self) -> &BTreeSet<String> {
        &self.cross_period_persisted_keys
    }

    pub fn db_pre_conditions(&self, round: &str) -> impl Iterator<Item = &String> {
        self.db_pre_conditions.get(round).into_iter().flatten()
    }

    pub fn db_post_conditions(&self, round: &str) -> impl Iterator<Item = &String> {
        self.db_post_conditions.get(round).into_iter().flatten()
    }

    fn check_pre_conditions(&self, round: RoundId, data: &SynchronizedData) -> AbciResult<()> {
        match self.db_pre_conditions(round).find(|key| data.get(key).is_none()) {
            Some(key) => Err(AbciError::PreConditionViolated {
                round,
                key: key.clone(),
            }),
            None => Ok(()),
        }
    }

    fn check_post_conditions(&self, round: RoundId, data: &SynchronizedData) -> AbciResult<()> {
        match self.db_post_conditions(round).find(|key| data.get(key).is_none()) {
            Some(key) => Err(AbciError::PostConditionViolated {
                round,
                key: key.clone(),
            }),
            None => Ok(()),
        }
    }

    /// Static checks run by [`AbciAppSpecBuilder::build`]
    pub fn validate(&self) -> AbciResult<()> {
        let invalid = |message: String| Err(AbciError::InvalidSpec(format!("{}: {}", self.name, message)));

        if !self.initial_states.contains(self.initial_round) {
            return invalid(format!("initial round {} is not an initial state", self.initial_round));
        }
        for round in self.initial_states.iter().chain(self.final_states.iter()) {
            if !self.rounds.contains_key(round) {
                return invalid(format!("round {round} is not declared"));
            }
        }
        if let Some(round) = self.initial_states.intersection(&self.final_states).next() {
            return invalid(format!("round {round} is both initial and final"));
        }

        for (round, edges) in &self.transition_function {
            let aggregation = match self.rounds.get(round) {
                Some(spec) => spec.instantiate(),
                None => return invalid(format!("round {round} is not declared")),
            };
            if let Some((event, target)) = edges.iter().find(|(_, target)| !self.rounds.contains_key(*target)) {
                return invalid(format!("edge ({round}, {event}) targets undeclared round {target}"));
            }

            if self.is_final(*round) {
                if !edges.is_empty() {
                    return invalid(format!("final round {round} has outgoing edges"));
                }
                if !aggregation.is_degenerate() {
                    return invalid(format!("final round {round} must be degenerate"));
                }
                continue;
            }

            if edges.is_empty() {
                return invalid(format!("round {round} has no outgoing edge"));
            }
            if aggregation.is_degenerate() {
                return invalid(format!("degenerate round {round} is not declared final"));
            }
            if let Some(event) = aggregation
                .declared_events()
                .into_iter()
                .find(|event| !edges.contains_key(event))
            {
                return invalid(format!("round {round} emits {event} but has no edge for it"));
            }
            if !self.event_to_timeout.is_empty() && !edges.keys().any(|e| self.event_to_timeout.contains_key(e)) {
                warn!(app = %self.name, round = *round, "Round has no timed outgoing event and may stall");
            }
        }

        for (event, timeout) in &self.event_to_timeout {
            if timeout.is_zero() || chrono::Duration::from_std(*timeout).is_err() {
                return invalid(format!("timeout of {event} must be positive and finite"));
            }
        }

        let mut reachable: BTreeSet<RoundId> = self.initial_states.clone();
        let mut frontier: Vec<RoundId> = self.initial_states.iter().copied().collect();
        while let Some(round) = frontier.pop() {
            for &target in self.transitions(round).into_iter().flat_map(|edges| edges.values()) {
                if reachable.insert(target) {
                    frontier.push(target);
                }
            }
        }
        if let Some(round) = self.rounds.keys().find(|round| !reachable.contains(*round)) {
            return invalid(format!("round {round} is unreachable"));
        }

        if let Some(round) = self.db_pre_conditions.keys().find(|r| !self.initial_states.contains(*r)) {
            return invalid(format!("pre-conditions declared for non-initial round {round}"));
        }
        if let Some(round) = self.db_post_conditions.keys().find(|r| !self.final_states.contains(*r)) {
            return invalid(format!("post-conditions declared for non-final round {round}"));
        }

        Ok(())
    }
}

/// Builder collecting rounds, edges and conditions of an [`AbciAppSpec`]
pub struct AbciAppSpecBuilder<E: AppEvent> {
    name: String,
    rounds: IndexMap<RoundId, RoundSpec<E>>,
    edges: Vec<(RoundId, E, RoundId)>,
    initial_round: Option<RoundId>,
    initial_states: BTreeSet<RoundId>,
    final_states: BTreeSet<RoundId>,
    event_to_timeout: BTreeMap<E, Duration>,
    db_pre_conditions: BTreeMap<RoundId, BTreeSet<String>>,
    db_post_conditions: BTreeMap<RoundId, BTreeSet<String>>,
    cross_period_persisted_keys: BTreeSet<String>,
    errors: Vec<String>,
}

impl<E: AppEvent> AbciAppSpecBuilder<E> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rounds: IndexMap::new(),
            edges: Vec::new(),
            initial_round: None,
            initial_states: BTreeSet::new(),
            final_states: BTreeSet::new(),
            event_to_timeout: BTreeMap::new(),
            db_pre_conditions: BTreeMap::new(),
            db_post_conditions: BTreeMap::new(),
            cross_period_persisted_keys: BTreeSet::new(),
            errors: Vec::new(),
        }
    }

    pub fn round(mut self, spec: RoundSpec<E>) -> Self {
        if self.rounds.contains_key(spec.id()) {
            self.errors.push(format!("round {} is declared twice", spec.id()));
        }
        self.rounds.insert(spec.id(), spec);
        self
    }

    pub fn transition(mut self, from: RoundId, event: E, to: RoundId) -> Self {
        self.edges.push((from, event, to));
        self
    }

    /// Round entered at genesis; also an initial state
    pub fn initial_round(mut self, round: RoundId) -> Self {
        self.initial_round = Some(round);
        self.initial_states.insert(round);
        self
    }

    /// Additional round an application composed before this one may enter
    pub fn initial_state(mut self, round: RoundId) -> Self {
        self.initial_states.insert(round);
        self
    }

    pub fn final_state(mut self, round: RoundId) -> Self {
        self.final_states.insert(round);
        self
    }

    pub fn event_timeout(mut self, event: E, timeout: Duration) -> Self {
        self.event_to_timeout.insert(event, timeout);
        self
    }

    pub fn db_pre_conditions<I, S>(mut self, round: RoundId, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.db_pre_conditions
            .entry(round)
            .or_default()
            .extend(keys.into_iter().map(Into::into));
        self
    }

    pub fn db_post_conditions<I, S>(mut self, round: RoundId, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.db_post_conditions
            .entry(round)
            .or_default()
            .extend(keys.into_iter().map(Into::into));
        self
    }

    pub fn cross_period_persisted_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cross_period_persisted_keys
            .extend(keys.into_iter().map(Into::into));
        self
    }

    /// Assemble and validate the specification
    pub fn build(self) -> AbciResult<AbciAppSpec<E>> {
        let invalid = |message: String| AbciError::InvalidSpec(format!("{}: {}", self.name, message));

        if let Some(error) = self.errors.first() {
            return Err(invalid(error.clone()));
        }
        let initial_round = self
            .initial_round
            .ok_or_else(|| invalid("no initial round".to_string()))?;

        let mut transition_function: IndexMap<RoundId, IndexMap<E, RoundId>> = self
            .rounds
            .keys()
            .map(|round| (*round, IndexMap::new()))
            .collect();
        for (from, event, to) in &self.edges {
            let edges = transition_function
                .get_mut(from)
                .ok_or_else(|| invalid(format!("edge ({from}, {event}) leaves undeclared round {from}")))?;
            match edges.insert(*event, *to) {
                Some(previous) if previous != *to => {
                    return Err(invalid(format!(
                        "edge ({from}, {event}) targets both {previous} and {to}"
                    )));
                }
                _ => {}
            }
        }

        let spec = AbciAppSpec {
            name: self.name.clone(),
            rounds: self.rounds,
            transition_function,
            initial_round,
            initial_states: self.initial_states,
            final_states: self.final_states,
            event_to_timeout: self.event_to_timeout,
            db_pre_conditions: self.db_pre_conditions,
            db_post_conditions: self.db_post_conditions,
            cross_period_persisted_keys: self.cross_period_persisted_keys,
        };
        spec.validate()?;
        debug!(app = %spec.name, rounds = spec.rounds.len(), "Application specification built");
        Ok(spec)
    }
}

/// Runtime knobs of an [`AbciApp`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppOptions {
    /// Overrides the participant-derived consensus threshold
    pub consensus_threshold: Option<usize>,
    /// Periods kept in memory after a reset
    pub history_depth: Option<usize>,
    pub transition_log_capacity: usize,
}

impl Default for AppOptions {
    fn default() -> Self {
        Self {
            consensus_threshold: None,
            history_depth: None,
            transition_log_capacity: 256,
        }
    }
}

/// Running application of one agent
#[derive(Debug)]
pub struct AbciApp<E: AppEvent> {
    spec: Arc<AbciAppSpec<E>>,
    options: AppOptions,
    current_round: Round<E>,
    round_entered_at: DateTime<Utc>,
    last_timestamp: DateTime<Utc>,
    last_height: Option<u64>,
    pending_timeouts: Vec<(DateTime<Utc>, E)>,
    transitions: VecDeque<Transition<E>>,
    rejected_payloads: u64,
    is_finished: bool,
}

impl<E: AppEvent> AbciApp<E> {
    pub fn new(spec: Arc<AbciAppSpec<E>>, setup: SynchronizedData, genesis_time: DateTime<Utc>) -> AbciResult<Self> {
        Self::with_options(spec, setup, genesis_time, AppOptions::default())
    }

    /// Check the initial round's pre-conditions against `setup` and enter it
    pub fn with_options(
        spec: Arc<AbciAppSpec<E>>,
        mut setup: SynchronizedData,
        genesis_time: DateTime<Utc>,
        options: AppOptions,
    ) -> AbciResult<Self> {
        let initial = spec.initial_round();
        spec.check_pre_conditions(initial, &setup)?;
        setup
            .db_mut()
            .add_cross_period_persisted_keys(spec.cross_period_persisted_keys().iter().cloned());
        setup.db_mut().increment_round_count();

        let round_spec = spec
            .round(initial)
            .ok_or_else(|| AbciError::UnknownRound(initial.to_string()))?;
        let current_round = Round::new(round_spec, setup, options.consensus_threshold)?;

        let mut app = Self {
            spec,
            options,
            current_round,
            round_entered_at: genesis_time,
            last_timestamp: genesis_time,
            last_height: None,
            pending_timeouts: Vec::new(),
            transitions: VecDeque::new(),
            rejected_payloads: 0,
            is_finished: false,
        };
        app.pending_timeouts = app.timeouts_for(initial, genesis_time);
        info!(app = %app.spec.name(), round = initial, "Entered initial round");
        Ok(app)
    }

    pub fn spec(&self) -> &Arc<AbciAppSpec<E>> {
        &self.spec
    }

    pub fn options(&self) -> &AppOptions {
        &self.options
    }

    pub fn current_round(&self) -> &Round<E> {
        &self.current_round
    }

    pub fn current_round_id(&self) -> RoundId {
        self.current_round.id()
    }

    /// Latest committed synchronized data
    pub fn synchronized_data(&self) -> &SynchronizedData {
        self.current_round.synchronized_data()
    }

    pub fn round_count(&self) -> u64 {
        self.synchronized_data().round_count()
    }

    pub fn period_count(&self) -> u64 {
        self.synchronized_data().period_count()
    }

    pub fn is_finished(&self) -> bool {
        self.is_finished
    }

    pub fn last_timestamp(&self) -> DateTime<Utc> {
        self.last_timestamp
    }

    pub fn round_entered_at(&self) -> DateTime<Utc> {
        self.round_entered_at
    }

    /// Deadlines of the current round entry, earliest first
    pub fn pending_timeouts(&self) -> &[(DateTime<Utc>, E)] {
        &self.pending_timeouts
    }

    /// Transition log, oldest first
    pub fn transitions(&self) -> impl Iterator<Item = &Transition<E>> {
        self.transitions.iter()
    }

    pub fn last_transition(&self) -> Option<&Transition<E>> {
        self.transitions.back()
    }

    pub fn rejected_payloads(&self) -> u64 {
        self.rejected_payloads
    }

    pub fn digest(&self) -> String {
        self.synchronized_data().digest()
    }

    /// Consume one consensus block.
    ///
    /// Expired timeouts fire first, then every payload is offered to the
    /// current round, then the round is asked whether it is complete.
    pub fn process_block(&mut self, block: &Block) -> AbciResult<Vec<Transition<E>>> {
        if let Some(height) = self.last_height.filter(|height| block.height <= *height) {
            warn!(height = block.height, last = height, "Ignoring block that was already processed");
            return Ok(Vec::new());
        }
        self.last_height = Some(block.height);

        let mut fired = self.update_time(block.timestamp)?;
        if self.is_finished {
            debug!(
                height = block.height,
                round = self.current_round_id(),
                "Application finished, ignoring block"
            );
            return Ok(fired);
        }

        for payload in &block.payloads {
            // rejections are logged and counted by deliver_payload
            let _ = self.deliver_payload(payload.clone());
        }

        if let Some(transition) = self.end_block(block.timestamp)? {
            fired.push(transition);
        }
        Ok(fired)
    }

    /// Offer a single payload to the current round
    pub fn deliver_payload(&mut self, payload: Payload) -> Result<(), PayloadError> {
        let result = if self.is_finished {
            Err(PayloadError::RoundClosed(self.current_round_id().to_string()))
        } else {
            self.current_round.process_payload(payload.clone())
        };
        if let Err(error) = &result {
            self.rejected_payloads += 1;
            debug!(
                round = self.current_round_id(),
                sender = payload.sender(),
                %error,
                "Payload rejected"
            );
        }
        result
    }

    /// Ask the current round whether it is complete and transition if so
    pub fn end_block(&mut self, timestamp: DateTime<Utc>) -> AbciResult<Option<Transition<E>>> {
        if self.is_finished {
            return Ok(None);
        }
        match self.current_round.end_block()? {
            Some((data, event)) => self.transition(event, data, timestamp.max(self.last_timestamp)).map(Some),
            None => Ok(None),
        }
    }

    /// Advance block time and fire every expired timeout
    pub fn update_time(&mut self, timestamp: DateTime<Utc>) -> AbciResult<Vec<Transition<E>>> {
        self.last_timestamp = self.last_timestamp.max(timestamp);

        let mut fired = Vec::new();
        while !self.is_finished {
            let Some(&(deadline, event)) = self.pending_timeouts.first() else {
                break;
            };
            if deadline > self.last_timestamp {
                break;
            }
            warn!(
                round = self.current_round_id(),
                event = %event,
                %deadline,
                "Round timed out"
            );
            let entry_data = self.current_round.synchronized_data().clone();
            fired.push(self.transition(event, entry_data, self.last_timestamp)?);
        }
        Ok(fired)
    }

    /// Raise `event` on the current round; uncommitted round state is
    /// discarded
    pub fn process_event(&mut self, event: E) -> AbciResult<Transition<E>> {
        let entry_data = self.current_round.synchronized_data().clone();
        self.transition(event, entry_data, self.last_timestamp)
    }

    /// Start a new period at the initial round
    pub fn reset(&mut self, timestamp: DateTime<Utc>) -> AbciResult<()> {
        let data = self.current_round.synchronized_data().create_new_period()?;
        let initial = self.spec.initial_round();
        self.spec.check_pre_conditions(initial, &data)?;

        self.last_timestamp = self.last_timestamp.max(timestamp);
        self.enter_round(initial, data, self.last_timestamp)?;
        info!(
            app = %self.spec.name(),
            period = self.period_count(),
            round = initial,
            "Period reset"
        );
        Ok(())
    }

    fn transition(&mut self, event: E, data: SynchronizedData, timestamp: DateTime<Utc>) -> AbciResult<Transition<E>> {
        let from = self.current_round_id();
        let to = self
            .spec
            .next_round(from, event)
            .ok_or_else(|| AbciError::InvalidTransition {
                round: from,
                event: event.to_string(),
            })?;
        self.enter_round(to, data, timestamp)?;

        let transition = Transition {
            from,
            event,
            to,
            round_count: self.round_count(),
            period_count: self.period_count(),
            timestamp,
        };
        info!(
            from,
            event = %event,
            to,
            round_count = transition.round_count,
            "Transition"
        );
        if self.transitions.len() >= self.options.transition_log_capacity.max(1) {
            self.transitions.pop_front();
        }
        self.transitions.push_back(transition.clone());
        Ok(transition)
    }

    fn enter_round(&mut self, round: RoundId, mut data: SynchronizedData, timestamp: DateTime<Utc>) -> AbciResult<()> {
        let spec = Arc::clone(&self.spec);
        let round_spec = spec
            .round(round)
            .ok_or_else(|| AbciError::UnknownRound(round.to_string()))?;

        data.db_mut().increment_round_count();
        // rounds may open a period themselves
        if data.period_count() > self.period_count() {
            if let Some(depth) = self.options.history_depth {
                data.db_mut().cleanup(depth, usize::MAX);
            }
        }
        let is_final = spec.is_final(round);
        if is_final {
            spec.check_post_conditions(round, &data)?;
        }

        self.current_round = Round::new(round_spec, data, self.options.consensus_threshold)?;
        self.round_entered_at = timestamp;
        self.pending_timeouts = self.timeouts_for(round, timestamp);
        self.is_finished = is_final;
        if is_final {
            info!(app = %spec.name(), round, "Final round reached");
        }
        Ok(())
    }

    fn timeouts_for(&self, round: RoundId, entered_at: DateTime<Utc>) -> Vec<(DateTime<Utc>, E)> {
        let mut timeouts: Vec<(DateTime<Utc>, E)> = self
            .spec
            .transitions(round)
            .into_iter()
            .flat_map(|edges| edges.keys().copied())
            .filter_map(|event| {
                let timeout = chrono::Duration::from_std(self.spec.timeout(event)?).ok()?;
                Some((entered_at.checked_add_signed(timeout)?, event))
            })
            .collect();
        timeouts.sort();
        timeouts
    }
}

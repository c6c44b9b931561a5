//! # Round Behaviour Driver
//!
//! Keeps the behaviour an agent executes aligned with the round its
//! application is in. Each call to [`RoundBehaviour::act_wrapper`] is one
//! scheduler tick:
//!
//! 1. publish the application's current round entry to the running act
//! 2. when the round entry changed, tear down the old behaviour and set up
//!    the one matching the new round with a fresh act future
//! 3. poll the current act future once
//!
//! A failed act is logged and recreated on the next tick; the round's timeout
//! bounds the retries.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use futures::task::noop_waker;
use indexmap::IndexMap;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::app::{AbciApp, AbciAppSpec};
use crate::behaviour::{AgentContext, Behaviour, BehaviourContext, BehaviourError, DegenerateBehaviour, RoundInfo};
use crate::{AbciError, AbciResult, AppEvent, RoundId};

type ActFuture = BoxFuture<'static, Result<(), BehaviourError>>;

struct ActiveBehaviour {
    behaviour: Arc<dyn Behaviour>,
    ctx: BehaviourContext,
    round_count: u64,
    act: Option<ActFuture>,
    done: bool,
}

impl ActiveBehaviour {
    /// Poll the act once, creating it if needed. Returns whether it failed.
    fn poll_once(&mut self) -> bool {
        if self.done {
            return false;
        }
        let act = self.act.get_or_insert_with(|| {
            let behaviour = Arc::clone(&self.behaviour);
            let ctx = self.ctx.clone();
            Box::pin(async move { behaviour.act(&ctx).await })
        });

        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        match act.poll_unpin(&mut cx) {
            Poll::Pending => false,
            Poll::Ready(Ok(())) => {
                debug!(behaviour = self.behaviour.behaviour_id(), "Behaviour done");
                self.act = None;
                self.done = true;
                false
            }
            Poll::Ready(Err(error)) => {
                warn!(
                    behaviour = self.behaviour.behaviour_id(),
                    %error,
                    "Behaviour act failed, retrying on next tick"
                );
                self.act = None;
                true
            }
        }
    }
}

/// Per-agent scheduler selecting and driving the behaviour of the current round
pub struct RoundBehaviour {
    agent: AgentContext,
    behaviours: IndexMap<RoundId, Arc<dyn Behaviour>>,
    round_watch: Option<watch::Sender<RoundInfo>>,
    current: Option<ActiveBehaviour>,
    failed_acts: u64,
}

impl RoundBehaviour {
    /// Bind `behaviours` to the rounds of `spec`.
    ///
    /// Every non-final round needs exactly one behaviour; final rounds without
    /// one get a [`DegenerateBehaviour`].
    pub fn new<E: AppEvent>(
        spec: &AbciAppSpec<E>,
        behaviours: Vec<Arc<dyn Behaviour>>,
        agent: AgentContext,
    ) -> AbciResult<Self> {
        let invalid = |message: String| AbciError::InvalidSpec(format!("{}: {}", spec.name(), message));

        let mut ids = BTreeSet::new();
        let mut by_round: IndexMap<RoundId, Arc<dyn Behaviour>> = IndexMap::new();
        for behaviour in behaviours {
            let id = behaviour.behaviour_id().to_string();
            let round = behaviour.matching_round();
            if !ids.insert(id.clone()) {
                return Err(invalid(format!("behaviour id {id} is used twice")));
            }
            if spec.round(round).is_none() {
                return Err(invalid(format!("behaviour {id} matches undeclared round {round}")));
            }
            if let Some(other) = by_round.insert(round, behaviour) {
                return Err(invalid(format!(
                    "round {round} is matched by both {} and {id}",
                    other.behaviour_id()
                )));
            }
        }

        for round in spec.rounds().map(|r| r.id()) {
            if by_round.contains_key(round) {
                continue;
            }
            if spec.is_final(round) {
                by_round.insert(round, Arc::new(DegenerateBehaviour::new(round)));
            } else {
                return Err(invalid(format!("round {round} has no behaviour")));
            }
        }

        Ok(Self {
            agent,
            behaviours: by_round,
            round_watch: None,
            current: None,
            failed_acts: 0,
        })
    }

    pub fn agent(&self) -> &AgentContext {
        &self.agent
    }

    /// Behaviour bound to `round`
    pub fn behaviour_for(&self, round: &str) -> Option<&Arc<dyn Behaviour>> {
        self.behaviours.get(round)
    }

    pub fn current_behaviour_id(&self) -> Option<&str> {
        self.current.as_ref().map(|active| active.behaviour.behaviour_id())
    }

    /// Whether the current act ran to completion
    pub fn is_done(&self) -> bool {
        self.current.as_ref().is_some_and(|active| active.done)
    }

    pub fn failed_acts(&self) -> u64 {
        self.failed_acts
    }

    /// One scheduler tick
    pub fn act_wrapper<E: AppEvent>(&mut self, app: &AbciApp<E>) -> AbciResult<()> {
        let entry_changed = self
            .current
            .as_ref()
            .map_or(true, |active| active.round_count != app.round_count());

        if entry_changed {
            let info = RoundInfo::from_app(app);
            let receiver = self.publish(info.clone());

            if let Some(mut previous) = self.current.take() {
                // let the old act observe the round end before it is dropped
                if previous.poll_once() {
                    self.failed_acts += 1;
                }
                previous.behaviour.teardown(&previous.ctx);
                debug!(behaviour = previous.behaviour.behaviour_id(), "Behaviour torn down");
            }

            let behaviour = self
                .behaviours
                .get(info.round_id)
                .cloned()
                .ok_or_else(|| AbciError::UnknownRound(info.round_id.to_string()))?;
            let ctx = BehaviourContext::new(self.agent.clone(), info.clone(), receiver);
            behaviour.setup(&ctx);
            info!(
                agent = self.agent.agent_address(),
                round = info.round_id,
                behaviour = behaviour.behaviour_id(),
                "Switched behaviour"
            );
            self.current = Some(ActiveBehaviour {
                behaviour,
                ctx,
                round_count: info.round_count,
                act: None,
                done: false,
            });
        }

        if let Some(active) = self.current.as_mut() {
            if active.poll_once() {
                self.failed_acts += 1;
            }
        }
        Ok(())
    }

    fn publish(&mut self, info: RoundInfo) -> watch::Receiver<RoundInfo> {
        match &self.round_watch {
            Some(sender) => {
                sender.send_replace(info);
                sender.subscribe()
            }
            None => {
                let (sender, receiver) = watch::channel(info);
                self.round_watch = Some(sender);
                receiver
            }
        }
    }

    /// Drive ticks every `tick` until `shutdown` turns true or its sender is
    /// dropped
    pub async fn run<E: AppEvent>(
        &mut self,
        app: Arc<Mutex<AbciApp<E>>>,
        tick: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> AbciResult<()> {
        let mut interval = tokio::time::interval(tick);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let guard = app.lock().await;
                    self.act_wrapper(&*guard)?;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!(agent = self.agent.agent_address(), "Round behaviour stopped");
                        return Ok(());
                    }
                }
            }
        }
    }
}

impl fmt::Debug for RoundBehaviour {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoundBehaviour")
            .field("agent", &self.agent)
            .field("behaviours", &self.behaviours.keys().collect::<Vec<_>>())
            .field("current", &self.current_behaviour_id())
            .field("failed_acts", &self.failed_acts)
            .finish()
    }
}

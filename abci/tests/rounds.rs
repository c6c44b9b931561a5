//! Aggregation archetype tests
//!
//! Exercises the round contract shared by every archetype:
//! - `end_block` stays `None` until the completion predicate holds
//! - completion is a deterministic function of the entry data and the collection
//! - rejected payloads never change round state
//!
//! Property-based tests use `proptest` over arbitrary submission orders and
//! value assignments.

use proptest::prelude::*;
use serde_json::{json, Value};

use round_abci::test_tools::{participants, setup_data, TestEvent};
use round_abci::{
    CollectConfig, Payload, PayloadError, Round, RoundContext, RoundSpec, RoundStrategy,
    SynchronizedData,
};

fn collect_same_spec() -> RoundSpec<TestEvent> {
    RoundSpec::collect_same_until_all(
        "collect",
        CollectConfig::new(TestEvent::Done)
            .with_payload_attribute("value")
            .with_selection_key("value"),
    )
}

fn enter(spec: &RoundSpec<TestEvent>, n: usize) -> Round<TestEvent> {
    Round::new(spec, setup_data(&participants(n)), None).unwrap()
}

fn value_payload(sender: usize, value: &str) -> Payload {
    Payload::new("collect", format!("agent_{sender}"), json!({ "value": value }))
}

#[test]
fn four_identical_values_complete_with_done() {
    let mut round = enter(&collect_same_spec(), 4);

    for sender in 0..4 {
        assert!(round.end_block().unwrap().is_none());
        round.process_payload(value_payload(sender, "X")).unwrap();
    }

    let (data, event) = round.end_block().unwrap().expect("round should be complete");
    assert_eq!(event, TestEvent::Done);
    assert_eq!(data.get_strict::<String>("value").unwrap(), "X");
    // entry data is untouched
    assert_eq!(round.synchronized_data().get("value"), None);
}

#[test]
fn divergent_value_keeps_round_open() {
    let mut round = enter(&collect_same_spec(), 4);

    for sender in 0..3 {
        round.process_payload(value_payload(sender, "X")).unwrap();
    }
    let rejected = round.process_payload(value_payload(3, "Y"));

    assert!(matches!(rejected, Err(PayloadError::Mismatch { .. })));
    assert_eq!(round.collection().len(), 3);
    assert!(round.end_block().unwrap().is_none());
}

#[test]
fn duplicate_payload_is_rejected_without_state_change() {
    let mut round = enter(&collect_same_spec(), 4);
    round.process_payload(value_payload(0, "X")).unwrap();
    let before = round.collection().clone();

    let duplicate = round.process_payload(value_payload(0, "X"));

    assert!(matches!(duplicate, Err(PayloadError::DuplicateSender { .. })));
    assert_eq!(round.collection(), &before);
}

/// Completes when the sum of submitted numbers reaches a target
struct SumUntil {
    target: i64,
}

impl RoundStrategy<TestEvent> for SumUntil {
    fn check_payload(&self, _ctx: &RoundContext<'_>, payload: &Payload) -> Result<(), PayloadError> {
        payload
            .content()
            .as_i64()
            .map(|_| ())
            .ok_or_else(|| PayloadError::Invalid("expected an integer".to_string()))
    }

    fn end_block(&self, ctx: &RoundContext<'_>) -> round_abci::AbciResult<Option<(SynchronizedData, TestEvent)>> {
        let sum: i64 = ctx.collection.values().filter_map(|p| p.content().as_i64()).sum();
        if sum < self.target {
            return Ok(None);
        }
        let data = ctx.synchronized_data.update([("sum", json!(sum))])?;
        Ok(Some((data, TestEvent::Done)))
    }

    fn declared_events(&self) -> Vec<TestEvent> {
        vec![TestEvent::Done]
    }
}

#[test]
fn custom_strategy_round() {
    let spec = RoundSpec::custom("sum", || SumUntil { target: 10 });
    let mut round = Round::new(&spec, setup_data(&participants(4)), None).unwrap();

    let text = Payload::new("sum", "agent_0", json!("four"));
    assert!(matches!(round.process_payload(text), Err(PayloadError::Invalid(_))));

    round.process_payload(Payload::new("sum", "agent_0", json!(4))).unwrap();
    assert!(round.end_block().unwrap().is_none());
    round.process_payload(Payload::new("sum", "agent_1", json!(6))).unwrap();

    let (data, event) = round.end_block().unwrap().unwrap();
    assert_eq!(event, TestEvent::Done);
    assert_eq!(data.get("sum"), Some(&json!(10)));
    assert_eq!(round.declared_events(), vec![TestEvent::Done]);
}

fn threshold_spec() -> RoundSpec<TestEvent> {
    RoundSpec::collect_same_until_threshold(
        "collect",
        CollectConfig::new(TestEvent::Done)
            .with_no_majority_event(TestEvent::NoMajority)
            .with_selection_key("value"),
    )
}

fn outcome(spec: &RoundSpec<TestEvent>, n: usize, submissions: &[(usize, u8)]) -> Option<(Value, TestEvent)> {
    let mut round = enter(spec, n);
    for (sender, value) in submissions {
        let _ = round.process_payload(Payload::new("collect", format!("agent_{sender}"), json!(value)));
    }
    round
        .end_block()
        .unwrap()
        .map(|(data, event)| (data.get("value").cloned().unwrap_or(Value::Null), event))
}

prop_compose! {
    fn arb_submissions(n: usize)
                      (values in proptest::collection::vec(0u8..3, n))
                      -> Vec<(usize, u8)> {
        values.into_iter().enumerate().collect()
    }
}

proptest! {
    #[test]
    fn collect_same_until_all_only_completes_on_unanimity(
        values in proptest::collection::vec(prop_oneof![Just("X"), Just("Y")], 1..6),
    ) {
        let n = 4;
        let mut round = enter(&collect_same_spec(), n);
        for (sender, value) in values.iter().enumerate().take(n) {
            let _ = round.process_payload(value_payload(sender, value));
        }

        let submitted = &values[..values.len().min(n)];
        let unanimous = submitted.len() == n && submitted.iter().all(|v| *v == submitted[0]);
        match round.end_block().unwrap() {
            Some((data, event)) => {
                prop_assert!(unanimous);
                prop_assert_eq!(event, TestEvent::Done);
                prop_assert_eq!(data.get("value"), Some(&json!(submitted[0])));
            }
            None => prop_assert!(!unanimous),
        }
    }

    #[test]
    fn threshold_outcome_is_independent_of_arrival_order(
        (ordered, shuffled) in arb_submissions(7)
            .prop_flat_map(|s| (Just(s.clone()), Just(s).prop_shuffle())),
    ) {
        let spec = threshold_spec();
        prop_assert_eq!(outcome(&spec, 7, &ordered), outcome(&spec, 7, &shuffled));
    }

    #[test]
    fn too_few_payloads_never_complete(
        submissions in arb_submissions(4),
        count in 0usize..3,
    ) {
        // fewer than ceil((2 * 4 + 1) / 3) = 3 payloads can neither agree nor rule out agreement
        let spec = threshold_spec();
        prop_assert_eq!(outcome(&spec, 4, &submissions[..count]), None);
    }

    #[test]
    fn end_block_is_repeatable(submissions in arb_submissions(5)) {
        let spec = threshold_spec();
        let mut round = enter(&spec, 5);
        for (sender, value) in &submissions {
            let _ = round.process_payload(Payload::new("collect", format!("agent_{sender}"), json!(value)));
        }
        prop_assert_eq!(round.end_block().unwrap(), round.end_block().unwrap());
    }
}

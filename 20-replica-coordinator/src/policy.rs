//! Rules for reconciling replica outcomes into one result.
//!
//! A [`Policy`] looks at the outcomes recorded so far, in arrival order, and
//! either decides or asks to keep waiting. Evaluation is pure: the same
//! [`OutcomeSet`] always yields the same [`Decision`], which is what lets the
//! dispatcher re-run it after every arrival and stop as soon as it decides.

use std::{collections::HashMap, fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::replica::{FailureKind, ReplicaOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    /// The first successful reply wins.
    FirstSuccess,
    /// Resolve once this many replicas returned identical payloads.
    Quorum(usize),
    /// Every replica must return the same payload.
    AllAgree,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnresolvedReason {
    AllFailed,
    NoQuorum,
}

impl fmt::Display for UnresolvedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnresolvedReason::AllFailed => f.write_str("all-failed"),
            UnresolvedReason::NoQuorum => f.write_str("no-quorum"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AggregateResult {
    Resolved(Vec<u8>),
    Unresolved(UnresolvedReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Pending,
    Decided(AggregateResult),
}

/// Outcomes of one dispatch, in the order they were recorded.
///
/// Replicas are identified by their position in the configured replica list.
/// Each position is recorded at most once.
#[derive(Debug, Clone)]
pub struct OutcomeSet {
    expected: usize,
    arrivals: Vec<(usize, ReplicaOutcome)>,
}

impl OutcomeSet {
    pub fn new(expected: usize) -> Self {
        Self {
            expected,
            arrivals: Vec::with_capacity(expected),
        }
    }

    pub fn expected(&self) -> usize {
        self.expected
    }

    pub fn len(&self) -> usize {
        self.arrivals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arrivals.is_empty()
    }

    pub fn is_complete(&self) -> bool {
        self.arrivals.len() >= self.expected
    }

    pub fn contains(&self, replica: usize) -> bool {
        self.arrivals.iter().any(|(index, _)| *index == replica)
    }

    /// Records an outcome. Returns `false` and ignores it when the replica is
    /// out of range or already has an outcome.
    pub fn record(&mut self, replica: usize, outcome: ReplicaOutcome) -> bool {
        if replica >= self.expected || self.contains(replica) {
            return false;
        }
        self.arrivals.push((replica, outcome));
        true
    }

    /// Gives every replica without an outcome the same failure, in configured order.
    pub fn fill_missing(&mut self, kind: FailureKind) {
        for replica in 0..self.expected {
            if !self.contains(replica) {
                self.arrivals.push((replica, ReplicaOutcome::Failure(kind)));
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &(usize, ReplicaOutcome)> {
        self.arrivals.iter()
    }

    fn remaining(&self) -> usize {
        self.expected.saturating_sub(self.arrivals.len())
    }
}

impl Policy {
    /// Decides from the outcomes seen so far, or returns [`Decision::Pending`]
    /// if more outcomes could still change the answer. A complete set always
    /// yields a decision.
    pub fn decide(&self, outcomes: &OutcomeSet) -> Decision {
        match *self {
            Policy::FirstSuccess => first_success(outcomes),
            Policy::Quorum(needed) => quorum(outcomes, needed),
            Policy::AllAgree => quorum(outcomes, outcomes.expected()),
        }
    }

    /// Like [`Policy::decide`], but for a set that will receive no more outcomes.
    pub fn conclude(&self, outcomes: &OutcomeSet) -> AggregateResult {
        match self.decide(outcomes) {
            Decision::Decided(result) => result,
            Decision::Pending => AggregateResult::Unresolved(self.exhausted_reason()),
        }
    }

    /// Smallest number of replicas this policy can resolve with.
    pub fn required(&self, replicas: usize) -> usize {
        match *self {
            Policy::FirstSuccess => 1,
            Policy::Quorum(needed) => needed,
            Policy::AllAgree => replicas,
        }
    }

    fn exhausted_reason(&self) -> UnresolvedReason {
        match self {
            Policy::FirstSuccess => UnresolvedReason::AllFailed,
            Policy::Quorum(_) | Policy::AllAgree => UnresolvedReason::NoQuorum,
        }
    }
}

fn first_success(outcomes: &OutcomeSet) -> Decision {
    let winner = outcomes.iter().find_map(|(_, outcome)| match outcome {
        ReplicaOutcome::Success(payload) => Some(payload),
        ReplicaOutcome::Failure(_) => None,
    });

    match winner {
        Some(payload) => Decision::Decided(AggregateResult::Resolved(payload.clone())),
        None if outcomes.is_complete() => {
            Decision::Decided(AggregateResult::Unresolved(UnresolvedReason::AllFailed))
        }
        None => Decision::Pending,
    }
}

fn quorum(outcomes: &OutcomeSet, needed: usize) -> Decision {
    let mut votes: HashMap<&[u8], usize> = HashMap::new();
    let mut leader = 0;

    for (_, outcome) in outcomes.iter() {
        let ReplicaOutcome::Success(payload) = outcome else {
            continue;
        };
        let count = votes.entry(payload.as_slice()).or_insert(0);
        *count += 1;
        if *count >= needed && needed > 0 {
            return Decision::Decided(AggregateResult::Resolved(payload.clone()));
        }
        leader = leader.max(*count);
    }

    if needed == 0 || leader + outcomes.remaining() < needed {
        Decision::Decided(AggregateResult::Unresolved(UnresolvedReason::NoQuorum))
    } else {
        Decision::Pending
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid policy '{0}': expected first-success, quorum:<k> or all-agree")]
pub struct ParsePolicyError(String);

impl FromStr for Policy {
    type Err = ParsePolicyError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "first-success" | "first" => Ok(Policy::FirstSuccess),
            "all-agree" | "all" => Ok(Policy::AllAgree),
            other => other
                .strip_prefix("quorum:")
                .or_else(|| other.strip_prefix("quorum-"))
                .and_then(|k| k.parse().ok())
                .map(Policy::Quorum)
                .ok_or_else(|| ParsePolicyError(input.to_string())),
        }
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Policy::FirstSuccess => f.write_str("first-success"),
            Policy::Quorum(needed) => write!(f, "quorum:{needed}"),
            Policy::AllAgree => f.write_str("all-agree"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok(payload: &str) -> ReplicaOutcome {
        ReplicaOutcome::Success(payload.as_bytes().to_vec())
    }

    fn failed(kind: FailureKind) -> ReplicaOutcome {
        ReplicaOutcome::Failure(kind)
    }

    fn resolved(payload: &str) -> Decision {
        Decision::Decided(AggregateResult::Resolved(payload.as_bytes().to_vec()))
    }

    fn unresolved(reason: UnresolvedReason) -> Decision {
        Decision::Decided(AggregateResult::Unresolved(reason))
    }

    #[test]
    fn first_success_takes_earliest_arrival() {
        let mut outcomes = OutcomeSet::new(3);
        assert_eq!(Policy::FirstSuccess.decide(&outcomes), Decision::Pending);

        outcomes.record(1, ok("OK-R2"));
        outcomes.record(0, ok("OK-R1"));
        assert_eq!(Policy::FirstSuccess.decide(&outcomes), resolved("OK-R2"));
    }

    #[test]
    fn first_success_waits_through_failures() {
        let mut outcomes = OutcomeSet::new(3);
        outcomes.record(0, failed(FailureKind::ConnectRefused));
        outcomes.record(1, failed(FailureKind::Timeout));
        assert_eq!(Policy::FirstSuccess.decide(&outcomes), Decision::Pending);

        outcomes.record(2, ok("OK-R3"));
        assert_eq!(Policy::FirstSuccess.decide(&outcomes), resolved("OK-R3"));
    }

    #[test]
    fn first_success_reports_all_failed() {
        let mut outcomes = OutcomeSet::new(2);
        outcomes.record(0, failed(FailureKind::MalformedResponse));
        outcomes.record(1, failed(FailureKind::Declined));
        assert_eq!(
            Policy::FirstSuccess.decide(&outcomes),
            unresolved(UnresolvedReason::AllFailed)
        );
    }

    #[test]
    fn quorum_resolves_on_second_match() {
        let policy = Policy::Quorum(2);
        let mut outcomes = OutcomeSet::new(3);

        outcomes.record(0, ok("A"));
        assert_eq!(policy.decide(&outcomes), Decision::Pending);

        outcomes.record(1, ok("A"));
        assert_eq!(policy.decide(&outcomes), resolved("A"));
    }

    #[test]
    fn quorum_gives_up_once_agreement_is_impossible() {
        let policy = Policy::Quorum(2);
        let mut outcomes = OutcomeSet::new(3);

        outcomes.record(0, ok("A"));
        outcomes.record(1, ok("B"));
        assert_eq!(policy.decide(&outcomes), Decision::Pending);

        outcomes.record(2, failed(FailureKind::Timeout));
        assert_eq!(policy.decide(&outcomes), unresolved(UnresolvedReason::NoQuorum));
    }

    #[test]
    fn quorum_fails_early_when_failures_leave_too_few_replicas() {
        let policy = Policy::Quorum(3);
        let mut outcomes = OutcomeSet::new(4);

        outcomes.record(2, failed(FailureKind::ConnectRefused));
        assert_eq!(policy.decide(&outcomes), Decision::Pending);

        outcomes.record(0, failed(FailureKind::Timeout));
        assert_eq!(policy.decide(&outcomes), unresolved(UnresolvedReason::NoQuorum));
    }

    #[test]
    fn quorum_larger_than_replica_set_never_resolves() {
        let outcomes = OutcomeSet::new(2);
        assert_eq!(
            Policy::Quorum(3).decide(&outcomes),
            unresolved(UnresolvedReason::NoQuorum)
        );
    }

    #[test]
    fn all_agree_needs_every_replica() {
        let mut outcomes = OutcomeSet::new(3);
        outcomes.record(0, ok("same"));
        outcomes.record(2, ok("same"));
        assert_eq!(Policy::AllAgree.decide(&outcomes), Decision::Pending);

        outcomes.record(1, ok("same"));
        assert_eq!(Policy::AllAgree.decide(&outcomes), resolved("same"));
    }

    #[test]
    fn all_agree_fails_on_first_mismatch() {
        let mut outcomes = OutcomeSet::new(3);
        outcomes.record(0, ok("left"));
        outcomes.record(1, ok("right"));
        assert_eq!(
            Policy::AllAgree.decide(&outcomes),
            unresolved(UnresolvedReason::NoQuorum)
        );
    }

    #[test]
    fn decisions_replay_identically() {
        let arrivals = [
            (2, failed(FailureKind::Timeout)),
            (0, ok("x")),
            (1, ok("y")),
        ];
        for policy in [Policy::FirstSuccess, Policy::Quorum(2), Policy::AllAgree] {
            let mut first = OutcomeSet::new(3);
            let mut second = OutcomeSet::new(3);
            for (replica, outcome) in arrivals.iter().cloned() {
                first.record(replica, outcome.clone());
                second.record(replica, outcome);
                assert_eq!(policy.decide(&first), policy.decide(&second));
            }
        }
    }

    #[test]
    fn record_ignores_duplicates_and_unknown_replicas() {
        let mut outcomes = OutcomeSet::new(2);
        assert!(outcomes.record(0, ok("a")));
        assert!(!outcomes.record(0, ok("b")));
        assert!(!outcomes.record(5, ok("c")));
        assert_eq!(outcomes.len(), 1);
    }

    #[test]
    fn fill_missing_completes_in_configured_order() {
        let mut outcomes = OutcomeSet::new(3);
        outcomes.record(1, ok("late"));
        outcomes.fill_missing(FailureKind::Timeout);

        let order: Vec<usize> = outcomes.iter().map(|(replica, _)| *replica).collect();
        assert_eq!(order, vec![1, 0, 2]);
        assert!(outcomes.is_complete());
    }

    #[test]
    fn conclude_always_decides() {
        let outcomes = OutcomeSet::new(2);
        assert_eq!(
            Policy::FirstSuccess.conclude(&outcomes),
            AggregateResult::Unresolved(UnresolvedReason::AllFailed)
        );
    }

    #[test]
    fn parses_policy_names() {
        assert_eq!("first-success".parse(), Ok(Policy::FirstSuccess));
        assert_eq!("Quorum:2".parse(), Ok(Policy::Quorum(2)));
        assert_eq!("quorum-3".parse(), Ok(Policy::Quorum(3)));
        assert_eq!("all-agree".parse(), Ok(Policy::AllAgree));
        assert!("quorum:".parse::<Policy>().is_err());
        assert!("majority".parse::<Policy>().is_err());
        assert_eq!(Policy::Quorum(2).to_string(), "quorum:2");
    }
}

//! Fan-out of one request to every configured replica.
//!
//! Every replica call runs as a task in a [`JoinSet`] owned by the dispatch and
//! reports its outcome over a channel private to that dispatch. Once the policy
//! decides or the deadline fires, the receiver and the set are dropped: calls
//! still in flight are aborted and nothing they produce can reach the outcome
//! set that was decided on.

use std::{sync::Arc, time::Duration};

use tokio::{
    select,
    sync::mpsc,
    task::JoinSet,
    time::sleep,
};
use tracing::debug;

use crate::{
    frame::Request,
    policy::{AggregateResult, Decision, OutcomeSet, Policy},
    replica::{self, FailureKind, ReplicaAddress, ReplicaOutcome},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchConfig {
    /// How long a single replica may take before it counts as timed out.
    pub replica_timeout: Duration,
    /// How long the whole dispatch may take before the policy is forced to decide.
    pub dispatch_deadline: Duration,
    pub policy: Policy,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            replica_timeout: Duration::from_millis(1000),
            dispatch_deadline: Duration::from_millis(2000),
            policy: Policy::FirstSuccess,
        }
    }
}

type Arrival = (usize, ReplicaOutcome);

/// Sends `request` to every replica concurrently and returns the policy's verdict.
pub async fn dispatch(
    request: &Request,
    replicas: &[ReplicaAddress],
    config: &DispatchConfig,
) -> AggregateResult {
    let request = Arc::new(request.clone());
    let (arrivals_tx, mut arrivals) = mpsc::unbounded_channel::<Arrival>();
    let mut tasks = JoinSet::new();

    for (index, address) in replicas.iter().cloned().enumerate() {
        let request = Arc::clone(&request);
        let arrivals_tx = arrivals_tx.clone();
        let limit = config.replica_timeout;
        tasks.spawn(async move {
            let outcome = replica::contact(&address, &request, limit).await;
            // The receiver is gone once the dispatch has decided.
            let _ = arrivals_tx.send((index, outcome));
        });
    }
    drop(arrivals_tx);

    let mut outcomes = OutcomeSet::new(replicas.len());
    let result = collect(
        config.policy,
        &mut outcomes,
        &mut arrivals,
        config.dispatch_deadline,
    )
    .await;

    drop(arrivals);
    let abandoned = tasks.len();
    tasks.abort_all();
    debug!(
        policy = %config.policy,
        received = outcomes.len(),
        abandoned,
        ?result,
        "dispatch decided"
    );
    result
}

/// Records arrivals until `policy` decides, every task has reported, or
/// `deadline` elapses.
async fn collect(
    policy: Policy,
    outcomes: &mut OutcomeSet,
    arrivals: &mut mpsc::UnboundedReceiver<Arrival>,
    deadline: Duration,
) -> AggregateResult {
    let deadline = sleep(deadline);
    tokio::pin!(deadline);

    loop {
        if let Decision::Decided(result) = policy.decide(outcomes) {
            return result;
        }

        select! {
            biased;

            received = arrivals.recv() => {
                let Some(first) = received else {
                    // Every task ended; any replica still missing never reported.
                    outcomes.fill_missing(FailureKind::MalformedResponse);
                    return policy.conclude(outcomes);
                };
                record_batch(outcomes, first, arrivals);
            }
            _ = &mut deadline => {
                // Outcomes queued right at the deadline still count.
                if let Ok(first) = arrivals.try_recv() {
                    record_batch(outcomes, first, arrivals);
                }
                debug!(
                    received = outcomes.len(),
                    expected = outcomes.expected(),
                    "dispatch deadline elapsed"
                );
                outcomes.fill_missing(FailureKind::Timeout);
                return policy.conclude(outcomes);
            }
        }
    }
}

/// Records `first` together with every outcome already waiting in the channel.
/// Outcomes that are ready together count as simultaneous and are recorded in
/// configured replica order.
fn record_batch(
    outcomes: &mut OutcomeSet,
    first: Arrival,
    arrivals: &mut mpsc::UnboundedReceiver<Arrival>,
) {
    let mut batch = vec![first];
    while let Ok(arrival) = arrivals.try_recv() {
        batch.push(arrival);
    }
    batch.sort_by_key(|(index, _)| *index);

    for (index, outcome) in batch {
        outcomes.record(index, outcome);
    }
}

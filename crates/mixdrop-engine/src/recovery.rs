//! Old-round recovery.
//!
//! Rounds recorded as in flight but not watched by any worker are orphans:
//! their outcome arrived, or will arrive, while nobody was listening, which
//! is what a restart leaves behind. Recovery asks the transport for their
//! outcomes and resolves them like a worker would.
//!
//! It runs once at start and again on every unhealthy → healthy transition.
//! A failed outcome query is retried after the network is healthy again, up
//! to `recovery.max_attempts` times and within `recovery.timeout_ms`. Giving
//! up requeues every orphaned part for ordinary sending.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use mixdrop_core::{RoundId, TransferId};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::context::EngineContext;
use crate::error::RecoveryError;
use crate::outcome::resolve_round;
use crate::transport::RoundStatus;

/// Pause before retrying a failed query while the network stays healthy.
const RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// Extra time allowed past the round results timeout for the query callback.
const QUERY_SLACK: Duration = Duration::from_secs(1);

pub(crate) async fn recovery_loop(ctx: Arc<EngineContext>, cancel: CancellationToken) {
    let (health_tx, mut health_rx) = mpsc::unbounded_channel();
    let subscription = ctx.transport.add_health_callback(Box::new(move |healthy: bool| {
        let _ = health_tx.send(healthy);
    }));

    run_once(&ctx, &cancel, &mut health_rx).await;

    let mut healthy = ctx.transport.is_healthy();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            signal = health_rx.recv() => match signal {
                Some(true) if !healthy => {
                    run_once(&ctx, &cancel, &mut health_rx).await;
                    healthy = ctx.transport.is_healthy();
                }
                Some(now) => healthy = now,
                None => break,
            },
        }
    }

    ctx.transport.remove_health_callback(subscription);
    tracing::debug!("recovery loop stopped");
}

async fn run_once(
    ctx: &EngineContext,
    cancel: &CancellationToken,
    health_rx: &mut mpsc::UnboundedReceiver<bool>,
) {
    match recover_old_rounds(ctx, cancel, health_rx).await {
        Ok(0) => {}
        Ok(rounds) => tracing::info!(rounds, "recovered old rounds"),
        Err(RecoveryError::Cancelled) => {}
        Err(e) => tracing::error!(error = %e, "round recovery gave up, parts requeued"),
    }
}

/// Resolve every orphaned round. Returns the number of rounds resolved.
pub(crate) async fn recover_old_rounds(
    ctx: &EngineContext,
    cancel: &CancellationToken,
    health_rx: &mut mpsc::UnboundedReceiver<bool>,
) -> Result<usize, RecoveryError> {
    let orphans = orphaned_rounds(ctx);
    if orphans.is_empty() {
        return Ok(0);
    }
    let rounds: Vec<RoundId> = orphans.keys().copied().collect();
    tracing::info!(rounds = rounds.len(), "recovering rounds with unknown outcome");

    let deadline = ctx.recovery.timeout().map(|t| Instant::now() + t);
    let max_attempts = ctx.recovery.max_attempts.max(1);
    let mut attempts = 0;

    while attempts < max_attempts {
        let ready = if attempts == 0 && ctx.transport.is_healthy() {
            Wait::Ready
        } else {
            wait_until_healthy(ctx, health_rx, cancel, deadline, attempts > 0).await
        };
        match ready {
            Wait::Ready => {}
            Wait::Cancelled => return Err(RecoveryError::Cancelled),
            Wait::Expired => break,
        }

        attempts += 1;
        match query(ctx, &rounds, cancel, deadline).await {
            Query::Resolved(statuses) => {
                for (round, tids) in &orphans {
                    let delivered = statuses.get(round) == Some(&RoundStatus::Succeeded);
                    resolve_round(ctx, *round, tids, delivered).await;
                }
                return Ok(rounds.len());
            }
            Query::Failed(reason) => {
                tracing::warn!(attempt = attempts, max_attempts, reason = %reason, "round outcome query failed");
            }
            Query::Cancelled => return Err(RecoveryError::Cancelled),
            Query::Expired => break,
        }
    }

    for (round, tids) in &orphans {
        resolve_round(ctx, *round, tids, false).await;
    }
    Err(RecoveryError::Unresolved {
        rounds: rounds.len(),
        attempts,
    })
}

/// In-flight rounds of running transfers that no worker is waiting on.
fn orphaned_rounds(ctx: &EngineContext) -> HashMap<RoundId, Vec<TransferId>> {
    let mut orphans: HashMap<RoundId, HashSet<TransferId>> = HashMap::new();
    for transfer in ctx.sent.all() {
        for (round, _) in transfer.in_flight_rounds() {
            if ctx.pending_rounds.contains(&round) {
                continue;
            }
            orphans.entry(round).or_default().insert(transfer.tid());
        }
    }
    orphans
        .into_iter()
        .map(|(round, tids)| (round, tids.into_iter().collect()))
        .collect()
}

enum Wait {
    Ready,
    Cancelled,
    Expired,
}

/// Wait for the network to be healthy. After a failed attempt a healthy
/// network is retried after a short backoff rather than a fresh signal.
async fn wait_until_healthy(
    ctx: &EngineContext,
    health_rx: &mut mpsc::UnboundedReceiver<bool>,
    cancel: &CancellationToken,
    deadline: Option<Instant>,
    retrying: bool,
) -> Wait {
    let expired = sleep_until(deadline);
    tokio::pin!(expired);

    if retrying && ctx.transport.is_healthy() {
        return tokio::select! {
            _ = cancel.cancelled() => Wait::Cancelled,
            _ = &mut expired => Wait::Expired,
            _ = tokio::time::sleep(RETRY_BACKOFF) => Wait::Ready,
        };
    }

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Wait::Cancelled,
            _ = &mut expired => return Wait::Expired,
            signal = health_rx.recv() => match signal {
                Some(true) => return Wait::Ready,
                Some(false) => {}
                None => return Wait::Cancelled,
            },
        }
    }
}

enum Query {
    Resolved(HashMap<RoundId, RoundStatus>),
    Failed(String),
    Cancelled,
    Expired,
}

async fn query(
    ctx: &EngineContext,
    rounds: &[RoundId],
    cancel: &CancellationToken,
    deadline: Option<Instant>,
) -> Query {
    let timeout = ctx.sending.round_results_timeout();
    let (tx, rx) = oneshot::channel();
    if let Err(e) = ctx.transport.query_round_outcome(
        rounds,
        timeout,
        Box::new(move |_: bool, statuses: HashMap<RoundId, RoundStatus>| {
            let _ = tx.send(statuses);
        }),
    ) {
        return Query::Failed(e.to_string());
    }

    let expired = sleep_until(deadline);
    tokio::select! {
        _ = cancel.cancelled() => Query::Cancelled,
        _ = expired => Query::Expired,
        res = tokio::time::timeout(timeout + QUERY_SLACK, rx) => match res {
            Ok(Ok(statuses)) => Query::Resolved(statuses),
            Ok(Err(_)) => Query::Failed("outcome callback dropped".into()),
            Err(_) => Query::Failed("no outcome before timeout".into()),
        },
    }
}

/// Sleep until `deadline`, or forever when there is none.
async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::scheduler::client_manager::ClientManager;
use crate::scheduler::task_manager::TaskManager;

/// Ready-poll ticker: moves ready tasks into the work queue.
pub(crate) fn spawn_queue_tick(
    tm: TaskManager,
    period: Duration,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    tracing::trace!("queue tick");
                    tm.update_queue().await;
                }
                _ = token.cancelled() => break,
            }
        }
    })
}

/// Liveness ticker: sweeps the client table for missed heartbeats.
pub(crate) fn spawn_client_tick(
    cm: ClientManager,
    period: Duration,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    tracing::trace!("client tick");
                    cm.liveness_sweep().await;
                }
                _ = token.cancelled() => break,
            }
        }
    })
}

/// Expiration ticker: deletes completed jobs past their expiration.
pub(crate) fn spawn_expiration_tick(
    tm: TaskManager,
    period: Duration,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    tracing::trace!("expiration tick");
                    tm.expire_jobs().await;
                }
                _ = token.cancelled() => break,
            }
        }
    })
}

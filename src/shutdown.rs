use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Scheduler loops that drain on shutdown, in spawn order.
pub const DRAIN_ORDER: &[&str] = &[
    "dispatcher",
    "feedback",
    "queue-tick",
    "client-tick",
    "expiration-tick",
];

/// Install SIGTERM/SIGINT handling for the scheduler process and return
/// the token its loops select on. Once it fires, the dispatcher and
/// feedback loops finish their in-flight request and stop, the tickers
/// wind down, and nothing new is checked out.
pub fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();

    tokio::spawn(async move {
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(err) => {
                tracing::error!(%err, "could not install the SIGTERM handler");
                return;
            }
        };
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(stream) => stream,
            Err(err) => {
                tracing::error!(%err, "could not install the SIGINT handler");
                return;
            }
        };

        let received = tokio::select! {
            _ = sigterm.recv() => "SIGTERM",
            _ = sigint.recv() => "SIGINT",
        };
        tracing::info!(signal = received, draining = ?DRAIN_ORDER, "shutdown requested");
        trigger.cancel();
    });

    token
}

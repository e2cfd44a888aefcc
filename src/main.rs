use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use taskhive::config::SchedulerConfig;
use taskhive::scheduler::Scheduler;
use taskhive::shutdown::shutdown_token;
use taskhive::store::{DataStore, MemoryBlobStore, MemoryStore};

const EXIT_CONFIG_ERROR: u8 = 1;
const EXIT_STORE_UNAVAILABLE: u8 = 2;

#[derive(Parser, Debug)]
#[command(name = "taskhive")]
#[command(about = "Core scheduler for a distributed batch-execution service")]
struct Args {
    /// Ready-poll interval in seconds
    #[arg(long, default_value = "10")]
    queue_tick_secs: u64,

    /// Client liveness sweep interval in seconds
    #[arg(long, default_value = "30")]
    client_tick_secs: u64,

    /// Expired-job sweep interval in seconds
    #[arg(long, default_value = "60")]
    expiration_tick_secs: u64,

    /// Execution failures tolerated per workunit before suspension
    #[arg(long, default_value = "3")]
    max_work_failure: u32,

    /// Require a clientgroup token on registration
    #[arg(long)]
    client_auth: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = SchedulerConfig::default().with_ticks(
        Duration::from_secs(args.queue_tick_secs),
        Duration::from_secs(args.client_tick_secs),
        Duration::from_secs(args.expiration_tick_secs),
    );
    config.max_work_failure = args.max_work_failure;
    config.client_auth_required = args.client_auth;

    if let Err(err) = config.validate() {
        tracing::error!(%err, "invalid configuration");
        return ExitCode::from(EXIT_CONFIG_ERROR);
    }

    // The embedding service wires its document and blob stores here; the
    // in-memory adapters keep a standalone scheduler runnable.
    let store: Arc<dyn DataStore> = Arc::new(MemoryStore::new());
    let blobs = Arc::new(MemoryBlobStore::new());

    if let Err(err) = store.ping().await {
        tracing::error!(%err, "document store unreachable at startup");
        return ExitCode::from(EXIT_STORE_UNAVAILABLE);
    }

    tracing::info!(
        queue_tick_secs = args.queue_tick_secs,
        client_tick_secs = args.client_tick_secs,
        expiration_tick_secs = args.expiration_tick_secs,
        max_work_failure = args.max_work_failure,
        "starting taskhive scheduler"
    );

    let scheduler = Scheduler::new(config, store, blobs);

    match scheduler.recover().await {
        Ok(count) if count > 0 => tracing::info!(jobs = count, "recovered jobs from the store"),
        Ok(_) => {}
        Err(err) => tracing::warn!(%err, "job recovery failed"),
    }

    let token = shutdown_token();
    let handles = scheduler.spawn(&token);

    token.cancelled().await;
    for handle in handles {
        let _ = handle.await;
    }
    tracing::info!("scheduler stopped");
    ExitCode::SUCCESS
}

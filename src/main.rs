use anyhow::Result;
use clap::Parser;
use reviewd::{
    config::ReviewdConfig,
    orchestrator,
    provider::HttpProviderClient,
    reasoner::HttpReasonerClient,
    storage::Storage,
    webhook, worker, AppContext,
};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(
    name = "reviewd",
    about = "reviewd — event-driven repository indexing and PR review daemon",
    version
)]
struct Args {
    /// Webhook HTTP server port
    #[arg(long, env = "REVIEWD_PORT")]
    port: Option<u16>,

    /// Data directory for config and the SQLite database
    #[arg(long, env = "REVIEWD_DATA_DIR")]
    data_dir: Option<std::path::PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "REVIEWD_LOG")]
    log: Option<String>,

    /// Number of concurrent worker tasks
    #[arg(long, env = "REVIEWD_POOL_SIZE")]
    pool_size: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Arc::new(ReviewdConfig::new(
        args.port,
        args.data_dir,
        args.log,
        args.pool_size,
    ));

    // Init once — must happen before any tracing calls.
    setup_logging(&config.log, &config.log_format);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.port,
        data_dir = %config.data_dir.display(),
        workers = config.pool_size,
        "starting reviewd"
    );

    if config.provider.webhook_secret.is_empty() {
        warn!("no webhook secret configured (REVIEWD_WEBHOOK_SECRET) — all deliveries will be rejected");
    }

    let storage = Arc::new(
        Storage::new_with_slow_query(
            &config.data_dir,
            config.observability.slow_query_threshold_ms,
        )
        .await?,
    );

    let provider = Arc::new(HttpProviderClient::new(config.provider.clone()));
    let reasoner = Arc::new(HttpReasonerClient::new(config.model.clone()));
    let ctx = Arc::new(AppContext::new(
        Arc::clone(&config),
        storage,
        provider,
        reasoner,
    ));

    // Jobs interrupted by a previous crash or shutdown go back to the queue.
    ctx.orchestrator.recover_interrupted().await?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let mut workers = Vec::with_capacity(config.pool_size);
    for _ in 0..config.pool_size {
        let w = Arc::new(ctx.worker());
        workers.push(tokio::spawn(worker::run_worker(w, shutdown_rx.clone())));
    }

    tokio::spawn(orchestrator::run_reaper(
        Arc::clone(&ctx.orchestrator),
        Arc::clone(&ctx.storage),
    ));

    tokio::select! {
        res = webhook::start_webhook_server(Arc::clone(&ctx)) => res?,
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    // Let in-flight jobs finish; anything still running at exit is requeued
    // on the next start.
    let _ = shutdown_tx.send(true);
    for handle in workers {
        let _ = handle.await;
    }
    info!("reviewd stopped");
    Ok(())
}

fn setup_logging(log_level: &str, log_format: &str) {
    if log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(log_level)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(log_level)
            .compact()
            .init();
    }
}

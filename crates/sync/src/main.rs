//! KGRAG Sync Worker
//!
//! Long-running consistency worker:
//! 1. Connects the primary store, vector index and settings store
//! 2. Runs the periodic consistency audit under the persisted sync policy
//! 3. Optionally runs one audit or a scope regeneration and exits

use kgrag_common::{config::AppConfig, metrics, EngineContext, VERSION};
use kgrag_common::models::ItemKind;
use kgrag_sync::{
    never_cancel, BulkProgress, BulkRegenerator, ConsistencyAuditor, ConsistencyScheduler,
    SyncManager,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Load configuration
    let config = AppConfig::load().map_err(|e| {
        eprintln!("Failed to load configuration: {}", e);
        e
    })?;

    init_tracing(&config);
    info!("Starting KGRAG Sync Worker v{}", VERSION);

    if config.observability.metrics_port != 0 {
        let addr = SocketAddr::from(([0, 0, 0, 0], config.observability.metrics_port));
        PrometheusBuilder::new().with_http_listener(addr).install()?;
        metrics::register_metrics();
        info!(%addr, "Metrics exporter listening");
    }

    let ctx = EngineContext::connect(config).await?;
    let manager = SyncManager::new(ctx.clone());
    let auditor = ConsistencyAuditor::new(manager.clone());

    // One-shot modes for operators
    let args: Vec<String> = std::env::args().collect();
    match args.get(1).map(String::as_str) {
        Some("check") => {
            let scope = args.get(2).map(String::as_str);
            let found = auditor.check_consistency(scope).await?;
            let report = auditor.repair(&found, &never_cancel).await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            return Ok(());
        }
        Some("regenerate") => {
            let Some(scope) = args.get(2) else {
                anyhow::bail!("usage: sync-worker regenerate <scope_id> [--force]");
            };
            let force = args.iter().any(|a| a == "--force");
            let report = BulkRegenerator::new(manager)
                .regenerate_scope(scope, &ItemKind::ALL, force, &never_cancel, &|p: BulkProgress| {
                    info!(
                        kind = %p.kind,
                        current = p.current,
                        total = p.total,
                        "Regeneration progress"
                    )
                })
                .await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            return Ok(());
        }
        _ => {}
    }

    let scope = std::env::var("SYNC_SCOPE_ID").ok().filter(|s| !s.is_empty());
    let scheduler = ConsistencyScheduler::new(auditor);
    scheduler.start(scope);

    let policy = ctx.policy.get();
    info!(
        enabled = policy.consistency_check_enabled,
        interval_ms = policy.consistency_interval_ms,
        "Consistency scheduler running"
    );

    shutdown_signal().await;
    scheduler.stop();

    info!("Sync worker shutting down");
    Ok(())
}

fn init_tracing(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.observability.log_level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    if config.observability.json_logging {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, starting shutdown..."),
        _ = terminate => info!("Received SIGTERM, starting shutdown..."),
    }
}

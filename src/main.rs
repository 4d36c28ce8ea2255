use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use leadqual::config::{EngineConfig, ServerConfig};
use leadqual::delivery::api_routes;
use leadqual::engine::ResearchEngine;
use leadqual::store::{JobStore, LibSqlJobStore};

/// Extra time given to in-flight jobs on shutdown, on top of the kill grace.
const SHUTDOWN_SLACK: Duration = Duration::from_secs(3);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let server = ServerConfig::from_env().context("invalid server configuration")?;
    let _log_guard = init_tracing(&server)?;

    let config = EngineConfig::from_env().context("invalid engine configuration")?;

    eprintln!("🔎 leadqual v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Agent: {}", config.agent.program);
    eprintln!("   Max concurrent jobs: {}", config.max_concurrent_jobs);
    eprintln!("   Database: {}", server.db_path.display());
    eprintln!("   API: http://0.0.0.0:{}/api/jobs", server.http_port);
    eprintln!("   Job stream: ws://0.0.0.0:{}/ws/jobs/{{id}}\n", server.http_port);

    // ── Database ─────────────────────────────────────────────────────────
    let store: Arc<dyn JobStore> = Arc::new(
        LibSqlJobStore::new_local(&server.db_path)
            .await
            .with_context(|| format!("failed to open database at {}", server.db_path.display()))?,
    );

    // ── Engine ───────────────────────────────────────────────────────────
    let kill_grace = config.kill_grace;
    let engine = Arc::new(ResearchEngine::new(config, store));

    // Anything still queued/running in the store belongs to a dead process.
    match engine.recover_stuck_jobs().await {
        Ok(0) => {}
        Ok(n) => eprintln!("   Recovered {n} stuck job(s) from a previous run"),
        Err(e) => tracing::error!(error = %e, "Startup recovery failed"),
    }

    let shutdown = CancellationToken::new();
    let housekeeping = engine.spawn_housekeeping(shutdown.clone());

    // ── HTTP / WebSocket ─────────────────────────────────────────────────
    let app = api_routes(Arc::clone(&engine));
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", server.http_port))
        .await
        .with_context(|| format!("failed to bind port {}", server.http_port))?;
    tracing::info!(port = server.http_port, "HTTP server listening");

    let server_shutdown = shutdown.clone();
    let http = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
            .await
    });

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    eprintln!("\nShutting down...");

    if tokio::time::timeout(kill_grace + SHUTDOWN_SLACK, engine.shutdown())
        .await
        .is_err()
    {
        tracing::warn!("Jobs still finalizing at shutdown deadline");
    }
    shutdown.cancel();
    let _ = housekeeping.await;
    match http.await {
        Ok(Err(e)) => tracing::error!(error = %e, "HTTP server error"),
        Err(e) => tracing::error!(error = %e, "HTTP server task failed"),
        Ok(Ok(())) => {}
    }

    Ok(())
}

/// Stderr logging, plus a daily-rolling file when a log directory is set.
fn init_tracing(server: &ServerConfig) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match &server.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "leadqual.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .with(file_layer)
        .try_init()
        .context("failed to install tracing subscriber")?;

    Ok(guard)
}

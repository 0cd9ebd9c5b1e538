use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use stream_relay::api;
use stream_relay::cache::FragmentCache;
use stream_relay::config::EngineConfig;
use stream_relay::executor::{Executor, UpstreamExecutor};
use stream_relay::store::{HistoryStore, LibSqlHistory};
use stream_relay::tasks::{DescriptorStore, TaskSupervisor};
use stream_relay::telemetry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = EngineConfig::from_env().context("invalid configuration")?;
    let _log_guard = telemetry::init(&config.log_dir()).context("cannot initialize logging")?;

    eprintln!("📡 Stream Relay v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Data:     {}", config.data_dir.display());
    eprintln!("   Upstream: {}", config.upstream_url);
    eprintln!("   API:      http://0.0.0.0:{}/api/tasks", config.port);
    eprintln!("   Stream:   ws://0.0.0.0:{}/ws/tasks/{{key}}\n", config.port);

    // ── Storage ──────────────────────────────────────────────────────────
    let history: Arc<dyn HistoryStore> = Arc::new(
        LibSqlHistory::new_local(&config.db_path)
            .await
            .with_context(|| format!("cannot open history database {}", config.db_path.display()))?,
    );
    let cache = Arc::new(
        FragmentCache::open(config.wal_dir(), config.subscriber_capacity)
            .await
            .context("cannot open fragment log directory")?,
    );
    let descriptors = Arc::new(
        DescriptorStore::open(config.tasks_dir())
            .await
            .context("cannot open descriptor directory")?,
    );

    // ── Supervisor + startup recovery ────────────────────────────────────
    let supervisor = Arc::new(TaskSupervisor::new(
        cache,
        descriptors,
        history,
        config.supervisor(),
    ));
    let recovered = supervisor
        .recover_on_startup()
        .await
        .context("startup recovery failed")?;
    if recovered > 0 {
        eprintln!("   Recovered {recovered} interrupted task(s)");
    }

    // ── HTTP ─────────────────────────────────────────────────────────────
    let executor: Arc<dyn Executor> =
        Arc::new(UpstreamExecutor::new(config.upstream()).context("cannot build upstream client")?);
    let app = api::router(Arc::clone(&supervisor), executor);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("cannot bind port {}", config.port))?;
    info!(port = config.port, "Listening");

    // Open streams only end with their job, so workers stop before draining.
    let shutdown = async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("Shutting down");
        supervisor.shutdown().await;
    };
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("server error")?;

    Ok(())
}

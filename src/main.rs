use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use trade_inbox::config::InboxConfig;
use trade_inbox::inbox::inbox_routes;
use trade_inbox::llm::create_provider;
use trade_inbox::pipeline::InboxService;
use trade_inbox::storage::{LocalObjectStore, ObjectStore};
use trade_inbox::store::{Database, LibSqlBackend};
use trade_inbox::transcription::TranscriptionChain;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = InboxConfig::from_env().context("Failed to load configuration")?;

    // Held for the process lifetime so buffered log lines are flushed.
    let _log_guard = init_tracing(&config)?;

    eprintln!("📥 Trade Inbox v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Model: {} ({})", config.llm.model, config.llm.backend.as_str());
    eprintln!("   API: http://{}/api/inbox", config.server.bind);
    eprintln!("   Feed WS: ws://{}/ws/inbox/{{artisan_id}}", config.server.bind);

    let llm = create_provider(&config.llm)?;

    // ── Database ─────────────────────────────────────────────────────────
    let db_path = &config.server.db_path;
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(db_path)
            .await
            .with_context(|| format!("Failed to open database at {}", db_path.display()))?,
    );
    eprintln!("   Database: {}", db_path.display());

    // ── Storage + transcription ──────────────────────────────────────────
    tokio::fs::create_dir_all(&config.server.storage_dir)
        .await
        .with_context(|| {
            format!(
                "Failed to create storage dir {}",
                config.server.storage_dir.display()
            )
        })?;
    let store: Arc<dyn ObjectStore> = Arc::new(LocalObjectStore::new(
        &config.server.storage_dir,
        &config.server.public_base_url,
        config.intake.media_timeout,
    ));
    eprintln!("   Storage: {}", config.server.storage_dir.display());

    let transcriber = Arc::new(TranscriptionChain::from_config(
        &config.transcription,
        config.intake.media_timeout,
    ));
    if transcriber.is_empty() {
        eprintln!("   Transcription: disabled (no provider keys)");
    } else {
        eprintln!(
            "   Transcription: {}",
            transcriber.provider_names().join(" → ")
        );
    }

    // ── Service + HTTP ───────────────────────────────────────────────────
    let service = Arc::new(InboxService::assemble(
        db,
        store,
        transcriber,
        llm,
        config.intake.clone(),
    ));
    let app = inbox_routes(service, &config.server.storage_dir);

    let listener = tokio::net::TcpListener::bind(config.server.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind))?;
    tracing::info!(bind = %config.server.bind, "Trade Inbox server started");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!("Trade Inbox server stopped");
    Ok(())
}

/// Stdout logging, plus a daily-rolling file when a log dir is configured.
fn init_tracing(
    config: &InboxConfig,
) -> anyhow::Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stdout = tracing_subscriber::fmt::layer().with_target(false);

    match &config.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log dir {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "trade-inbox.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(stdout)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::registry().with(filter).with(stdout).init();
            Ok(None)
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}

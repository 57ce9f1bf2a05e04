//! clipq-seq - Session sequencing service
//!
//! **Module Identity:**
//! - Name: clipq-seq
//! - Default HTTP bind: 127.0.0.1:5790
//!
//! Runs the intake and sequencer workers against the shared database, plus a
//! small operational HTTP API. Any number of instances may share one database
//! file; the session store is the only coordination between them.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use clipq_common::config::{resolve_database_path, ConfigResolver, StoreBackend, TomlConfig};
use clipq_common::db::init_database;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use clipq_seq::config::ServiceSettings;
use clipq_seq::consumer::FeedbackConsumer;
use clipq_seq::db::FeedbackSink;
use clipq_seq::ingest::{IntakeStage, PassthroughTranscriber};
use clipq_seq::provider::build_provider;
use clipq_seq::store::{MemorySessionStore, SessionStore, SqliteSessionStore};
use clipq_seq::transport::{MessageTransport, SqliteQueue};
use clipq_seq::worker::WorkerPool;
use clipq_seq::{AppState, OrderedConsumer, Resequencer};

/// Command-line arguments for clipq-seq
#[derive(Parser, Debug)]
#[command(name = "clipq-seq")]
#[command(about = "Session resequencer for ordered clip feedback")]
#[command(version)]
struct Args {
    /// Config file (overrides CLIPQ_CONFIG and the default locations)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Database file (overrides CLIPQ_DATABASE and the config file)
    #[arg(short, long)]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the workers and the HTTP API (default)
    Serve {
        /// HTTP bind address (overrides [http] bind)
        #[arg(long, env = "CLIPQ_HTTP_BIND")]
        bind: Option<String>,
    },
    /// Enqueue a raw message body
    Publish { queue: String, body: String },
    /// Print a session snapshot as JSON
    Inspect { session_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let resolver = ConfigResolver::new(args.config.clone());
    let config_source = resolver.resolve();
    let config = resolver.load().context("Failed to load configuration")?;

    // Initialize tracing
    let level = config.logging.level.clone();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("clipq_seq={level},clipq_common={level},tower_http={level}").into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(source = ?config_source, "Configuration resolved");

    let db_path = resolve_database_path(args.database.as_deref(), &config);

    match args.command.unwrap_or(Command::Serve { bind: None }) {
        Command::Serve { bind } => serve(config, db_path, bind).await,
        Command::Publish { queue, body } => {
            let pool = init_database(&db_path).await?;
            let settings = ServiceSettings::from_toml(&config)?;
            let queue_handle = SqliteQueue::new(pool, settings.visibility_timeout);
            let id = queue_handle.publish(&queue, &body).await?;
            println!("{}", id);
            Ok(())
        }
        Command::Inspect { session_id } => {
            let pool = init_database(&db_path).await?;
            let store = SqliteSessionStore::new(pool.clone());
            let session = store
                .get(&session_id)
                .await?
                .with_context(|| format!("Session {} not found", session_id))?;
            let document = FeedbackSink::new(pool).summary(&session_id).await?;
            let report = serde_json::json!({ "session": session, "document": document });
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
    }
}

async fn serve(config: TomlConfig, db_path: PathBuf, bind: Option<String>) -> Result<()> {
    info!(
        "Starting clipq-seq v{} [{}] built {} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_PROFILE")
    );
    let settings = ServiceSettings::from_toml(&config)?;

    info!("Database: {}", db_path.display());
    let pool = init_database(&db_path)
        .await
        .context("Failed to open database")?;

    let store: Arc<dyn SessionStore> = match config.sequencer.store {
        StoreBackend::Sqlite => Arc::new(SqliteSessionStore::new(pool.clone())),
        StoreBackend::Memory => {
            warn!("Memory session store selected: only valid while this is the only instance");
            Arc::new(MemorySessionStore::new())
        }
    };
    let transport: Arc<dyn MessageTransport> =
        Arc::new(SqliteQueue::new(pool.clone(), settings.visibility_timeout));

    let provider = build_provider(&config).context("Failed to build feedback provider")?;
    info!(provider = provider.name(), store = store.backend(), "Pipeline configured");

    let consumer: Arc<dyn OrderedConsumer> = Arc::new(FeedbackConsumer::new(
        provider,
        FeedbackSink::new(pool.clone()),
        settings.retry.clone(),
    ));
    let resequencer = Resequencer::new(store.clone(), settings.resequencer.clone());
    let intake = IntakeStage::new(Arc::new(PassthroughTranscriber), settings.retry.clone());

    let state = AppState::new(
        store,
        transport.clone(),
        vec![
            settings.pool.uploads_queue.clone(),
            settings.pool.segments_queue.clone(),
        ],
    );

    let workers = WorkerPool::spawn(
        &settings.pool,
        transport,
        resequencer,
        consumer,
        Some(intake),
        state.last_error.clone(),
    );

    if config.http.enabled {
        let bind = bind.unwrap_or_else(|| config.http.bind.clone());
        let listener = tokio::net::TcpListener::bind(&bind)
            .await
            .with_context(|| format!("Failed to bind to {}", bind))?;
        info!("Listening on http://{}", bind);
        info!("Health check: http://{}/health", bind);

        axum::serve(listener, clipq_seq::build_router(state))
            .with_graceful_shutdown(shutdown_signal())
            .await
            .context("Server error")?;
    } else {
        shutdown_signal().await;
    }

    workers.shutdown().await;
    info!("Shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}

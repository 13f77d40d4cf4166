use anyhow::{Context, Result};
use clap::Parser;
use notify::Notifier;
use patrol::{
    BroadcastPublisher, Engine, MemoryStore, PatrolStore, SqliteStore, StaticIdentityProvider,
};
use patrol_server::{AppState, ServerConfig};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "patrol-server", version, about = "Patrol compliance engine HTTP server")]
struct Args {
    /// YAML configuration file
    #[arg(long, env = "PATROL_CONFIG")]
    config: Option<String>,

    /// Listen address, overrides the config file
    #[arg(long, env = "PATROL_LISTEN")]
    listen: Option<String>,

    /// SQLite database path, overrides the config file
    #[arg(long, env = "PATROL_DATABASE")]
    database: Option<String>,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info,patrol=debug".into());
    let registry = tracing_subscriber::registry().with(filter);
    if std::env::var("PATROL_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json")) {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing();

    info!("Starting patrol-server v{}", env!("CARGO_PKG_VERSION"));

    let mut config = ServerConfig::load(args.config.as_deref());
    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    if args.database.is_some() {
        config.database = args.database;
    }
    config.validate()?;

    let store: Arc<dyn PatrolStore> = match &config.database {
        Some(path) => {
            info!(path = %path, "Using SQLite store");
            Arc::new(SqliteStore::open(path).with_context(|| format!("Failed to open {path}"))?)
        }
        None => {
            warn!("No database configured, state is kept in memory");
            Arc::new(MemoryStore::new())
        }
    };

    let notifier = Notifier::from_env();
    let bus = BroadcastPublisher::default();
    let engine = Engine::builder(store)
        .publisher(Arc::new(bus.clone()))
        .sink(Arc::new(notifier))
        .identity(Arc::new(StaticIdentityProvider::new(config.guards.clone())))
        .config(config.patrol.clone())
        .build();

    let state = AppState::new(engine, bus);
    state.scheduler.start();

    let listener = TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen))?;

    patrol_server::serve(listener, state, &config, shutdown_signal()).await
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
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
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C, shutting down gracefully");
        },
        () = terminate => {
            info!("Received SIGTERM, shutting down gracefully");
        },
    }
}

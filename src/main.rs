mod broker;
mod cluster_cache;
mod config;
mod error;
mod health_poller;
mod idle_reaper;
mod job_poller;
mod model;
mod partition;
mod port;
mod proxy;
mod session_store;
mod slurm;
mod ssh;
mod ssh_queue;
mod state_manager;
mod store;
mod timefmt;
mod tunnel;

use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use clap::Parser;
use dotenvy::dotenv;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::broker::Broker;
use crate::config::{BrokerConfig, ClustersConfig};
use crate::store::SqliteStore;

/// The only HTTP surface this crate owns directly: a liveness probe. Full
/// session-management/status-snapshot routing is the non-core layer named
/// in spec.md §6 and lives outside this crate.
async fn healthz(State(broker): State<Arc<Broker>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "ready": broker.state.is_ready().await }))
}

/// Trimmed down from the teacher's `Serve`/`Tui` subcommand enum now that
/// there's only one thing to start — a flat flag set instead.
#[derive(Parser)]
#[command(name = "rcbroker", about = "HPC interactive-session broker")]
struct Cli {
    /// Path to the clusters TOML file; falls back to CLUSTERS_CONFIG_PATH,
    /// then `clusters.toml`.
    #[arg(long)]
    clusters_config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    dotenv().ok();
    let cli = Cli::parse();

    let config = BrokerConfig::from_env();
    let _guard = init_observability(&config);

    let clusters_path = cli
        .clusters_config
        .or_else(|| std::env::var("CLUSTERS_CONFIG_PATH").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("clusters.toml"));
    let clusters = match ClustersConfig::load(&clusters_path) {
        Ok(clusters) => clusters,
        Err(err) => {
            tracing::warn!(path = %clusters_path.display(), error = %err, "no clusters config found, starting with zero clusters");
            ClustersConfig::default()
        }
    };

    let port = config.port;
    let store = Arc::new(if config.use_sqlite {
        SqliteStore::open(&PathBuf::from("rcbroker.sqlite3"))?
    } else {
        SqliteStore::open_in_memory()?
    });

    let broker = Broker::new(config, clusters, store);
    broker.start().await?;

    let app = Router::new().route("/healthz", get(healthz)).layer(CorsLayer::permissive()).with_state(broker.clone());

    let addr = format!("0.0.0.0:{port}");
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "rcbroker listening");
    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;

    broker.shutdown().await;
    Ok(())
}

/// `EnvFilter` default mirrors the teacher's `src/main.rs`
/// (`cthulu=info,tower_http=warn,hyper=warn`), renamed to this crate's
/// target. Sentry wiring is identical to the teacher's, minus
/// `tracing_tree`'s hierarchical console layer, which has no remaining
/// caller once the TUI it was styled for is gone (see DESIGN.md).
fn init_observability(config: &BrokerConfig) -> sentry::ClientInitGuard {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("rcbroker=info,tower_http=warn,hyper=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().json().with_target(true))
        .with(sentry::integrations::tracing::layer().event_filter(|metadata| match *metadata.level() {
            tracing::Level::ERROR => sentry::integrations::tracing::EventFilter::Event,
            tracing::Level::WARN | tracing::Level::INFO => sentry::integrations::tracing::EventFilter::Breadcrumb,
            _ => sentry::integrations::tracing::EventFilter::Ignore,
        }))
        .init();

    sentry::init((
        config.sentry_dsn.clone().unwrap_or_default(),
        sentry::ClientOptions {
            release: sentry::release_name!(),
            environment: Some(config.environment.clone().into()),
            send_default_pii: true,
            traces_sample_rate: 0.2,
            enable_logs: true,
            ..Default::default()
        },
    ))
}

/// Waits for either signal a container orchestrator would send. Graceful
/// shutdown (§5: stop pollers → drain SSH queues → destroy proxies → close
/// tunnels → flush store) runs in `Broker::shutdown` after this returns.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

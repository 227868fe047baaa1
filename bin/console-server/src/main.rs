use anyhow::{bail, Context, Result};
use clap::Parser;
use console_core::{
    ClusterManager, ClusterRefresher, ClusterRegistry, ClusterStore, ConnectionBuilder,
    MemoryClusterStore,
};
use console_store::PgClusterStore;
use hyper::{server::conn::http1, service::service_fn};
use hyper_util::rt::tokio::TokioIo;
use sqlx::postgres::PgPoolOptions;
use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod config;
mod router;

use config::{LogSettings, Settings};
use router::Router;

const DEFAULT_CONFIG: &str = "console.yaml";

/// Multi-cluster Kubernetes console server
#[derive(Parser, Debug)]
#[command(name = "console-server", version, about, long_about = None)]
struct Args {
    /// Configuration file (defaults to ./console.yaml when present)
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Register every context of this kubeconfig as a static cluster
    #[arg(long)]
    kubeconfig: Option<PathBuf>,

    /// Register the pod's service account as a static cluster
    #[arg(long)]
    in_cluster: bool,

    /// Apply database migrations and exit
    #[arg(long)]
    migrate: bool,

    /// PostgreSQL URL for dynamic clusters
    #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
    database_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let settings = load_settings(&args)?;
    init_tracing(&settings.log)?;

    info!("Starting console-server...");

    let store = open_store(&settings, args.migrate).await?;
    let Some(store) = store else {
        return Ok(());
    };

    // Create cluster registry
    let registry = ClusterRegistry::new();
    let builder = ConnectionBuilder::new(settings.connection_settings());
    let manager = Arc::new(ClusterManager::new(
        registry.clone(),
        store,
        builder,
        settings.refresh_config().timeout,
    ));

    // An incomplete cluster list is worse than not starting.
    manager
        .boot(&settings.static_sources())
        .await
        .context("failed to load clusters")?;
    info!("Cluster registry initialized with {} clusters", registry.cluster_count().await);

    let refresher = ClusterRefresher::new(registry.clone(), settings.refresh_config());
    tokio::spawn(async move { refresher.run().await });

    let router = Arc::new(Router::new(manager));
    let listener = TcpListener::bind(settings.listen).await?;
    info!("HTTP server listening on {}", settings.listen);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer_addr) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Error accepting connection: {}", e);
                        continue;
                    }
                };
                let io = TokioIo::new(stream);
                let router = router.clone();

                tokio::task::spawn(async move {
                    let service = service_fn(move |req| {
                        let router = router.clone();
                        async move { Ok::<_, Infallible>(router.handle(req).await) }
                    });

                    if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                        debug!("Error serving HTTP connection from {}: {}", peer_addr, e);
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down console-server");
                return Ok(());
            }
        }
    }
}

fn load_settings(args: &Args) -> Result<Settings> {
    let (path, required) = match &args.config {
        Some(path) => (path.clone(), true),
        None => (PathBuf::from(DEFAULT_CONFIG), false),
    };
    let mut settings = Settings::load(&path, required)?;

    if let Some(kubeconfig) = &args.kubeconfig {
        settings.kubernetes.kubeconfig = Some(kubeconfig.clone());
    }
    if args.in_cluster {
        settings.kubernetes.in_cluster = true;
    }
    if let Some(url) = &args.database_url {
        settings.database.url = Some(url.clone());
    }
    Ok(settings)
}

fn init_tracing(log: &LogSettings) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&log.level)
            .with_context(|| format!("invalid log level: {}", log.level))?,
    };

    let registry = tracing_subscriber::registry().with(filter);
    if log.json {
        registry.with(fmt::layer().json()).try_init()?;
    } else {
        registry.with(fmt::layer()).try_init()?;
    }
    Ok(())
}

/// Connect and migrate the cluster store; `None` when only migrating
async fn open_store(settings: &Settings, migrate_only: bool) -> Result<Option<Arc<dyn ClusterStore>>> {
    let Some(url) = &settings.database.url else {
        if migrate_only {
            bail!("--migrate requires a database url");
        }
        warn!("No database configured, dynamic clusters will not survive a restart");
        return Ok(Some(Arc::new(MemoryClusterStore::new())));
    };

    let pool = PgPoolOptions::new()
        .max_connections(settings.database.max_connections)
        .connect(url)
        .await
        .context("failed to connect to the cluster database")?;
    console_store::migrate(&pool).await?;

    if migrate_only {
        return Ok(None);
    }
    Ok(Some(Arc::new(PgClusterStore::new(pool))))
}

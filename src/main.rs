use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use gridq::api::{self, AppState};
use gridq::auth;
use gridq::config::ServerConfig;
use gridq::scanner::{ArtifactScanner, StaticScanner};
use gridq::shutdown;
use gridq::store::Store;
use gridq::worker;

#[derive(Parser, Debug)]
#[command(name = "gridq")]
#[command(about = "Multi-tenant GPU job dispatcher with bastion-relayed execution")]
struct Args {
    /// Path to the server configuration file
    #[arg(long, default_value = "gridq.yaml")]
    config: PathBuf,

    /// Override the configured listen address
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Override the configured datastore path
    #[arg(long)]
    database: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config = ServerConfig::load(&args.config)?;
    if let Some(listen) = args.listen {
        config.listen_addr = listen;
    }
    if let Some(database) = args.database {
        config.database_path = database;
    }
    let config = Arc::new(config);

    tracing::info!(
        listen_addr = %config.listen_addr,
        num_nodes = config.num_nodes,
        database = %config.database_path.display(),
        bastion = %config.bastion.address,
        "starting gridq"
    );

    std::fs::create_dir_all(&config.jobs_dir)?;
    let store = Arc::new(Store::open(&config.database_path, config.num_nodes)?);

    // Credentials are normally provisioned out of band; this seeds a first
    // admin credential on a fresh deployment.
    if let Ok(secret) = std::env::var("GRIDQ_BOOTSTRAP_ADMIN_SECRET") {
        match auth::issue_credential(
            &store,
            "admin",
            &secret,
            true,
            None,
            config.credential_max_validity_days,
        ) {
            Ok(expires) => tracing::info!(%expires, "bootstrap admin credential issued"),
            Err(err) => tracing::warn!(error = %err, "bootstrap admin credential not issued"),
        }
    }

    let shutdown = shutdown::shutdown_token();
    let workers = worker::spawn_workers(store.clone(), &config, shutdown.clone());

    let scanner: Option<Arc<dyn ArtifactScanner>> = if config.scanner_enabled {
        if !config.scanner_quick {
            tracing::warn!("deep artifact scanning is not configured, using static screening only");
        }
        Some(Arc::new(StaticScanner::new()))
    } else {
        None
    };
    let state = AppState::new(store, config.clone(), scanner);
    let app = api::router(state);

    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    let serve_shutdown = shutdown.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { serve_shutdown.cancelled().await })
    .await?;

    // The server only returns after the token fired; wait for the workers
    // to finish their in-flight iteration.
    shutdown.cancel();
    for handle in workers {
        let _ = handle.await;
    }
    tracing::info!("gridq stopped");
    Ok(())
}

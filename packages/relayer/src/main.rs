use std::sync::Arc;

use bridge_relayer::api::{self, AppState};
use bridge_relayer::checkpoint::{CheckpointStore, MemoryCheckpointStore};
use bridge_relayer::db::{self, PgCheckpointStore};
use bridge_relayer::{Config, Coordinator};
use tokio::sync::watch;

fn main() -> eyre::Result<()> {
    // Install color-eyre for better error reporting
    color_eyre::install()?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main())
}

async fn async_main() -> eyre::Result<()> {
    init_logging();

    tracing::info!("Starting bridge relayer");

    let config = Config::load()?;
    tracing::info!(
        chains = config.chains.len(),
        api_port = config.api.port,
        persistent = config.database.is_some(),
        "Configuration loaded"
    );

    let store: Arc<dyn CheckpointStore> = match &config.database {
        Some(database) => {
            let pool = db::create_pool(&database.url).await?;
            tracing::info!("Database connected");
            db::run_migrations(&pool).await?;
            tracing::info!("Database migrations complete");
            Arc::new(PgCheckpointStore::new(pool))
        }
        None => {
            tracing::warn!(
                "relayer.memory_checkpoints is set, checkpoints and pending deposits \
                 will not survive a restart"
            );
            Arc::new(MemoryCheckpointStore::new())
        }
    };

    let chains = config.gateway_descriptors()?;
    for chain in &chains {
        tracing::info!(
            chain_id = %chain.chain_id,
            name = %chain.name,
            role = ?chain.role,
            confirmation_depth = chain.confirmation_depth,
            resources = chain.resources.len(),
            "Chain configured"
        );
    }

    let coordinator = Coordinator::start(chains, store, config.coordinator_config())?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);
    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        signal_tx.send_replace(true);
    });

    let state = AppState::new(coordinator.health(), coordinator.status());
    let api_shutdown = shutdown_rx.clone();
    let bind_address = config.api.bind_address.clone();
    let port = config.api.port;
    let api_handle = tokio::spawn(async move {
        if let Err(e) = api::start_api_server(&bind_address, port, state, api_shutdown).await {
            tracing::error!(error = %e, "API server error");
        }
    });

    let result = coordinator.run(shutdown_rx).await;

    // Units may all have exited on their own; stop the API either way
    shutdown_tx.send_replace(true);

    if let Err(e) = api_handle.await {
        tracing::error!(error = %e, "API server task failed");
    }

    result?;
    tracing::info!("Bridge relayer stopped");
    Ok(())
}

/// Initialize tracing/logging with structured output
///
/// `LOG_FORMAT=json` switches to JSON lines.
fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,bridge_relayer=debug"));

    let json = std::env::var("LOG_FORMAT")
        .map(|format| format.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_target(true).with_thread_ids(true))
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .with(filter)
            .init();
    }
}

/// Wait for shutdown signals (SIGINT/SIGTERM)
async fn wait_for_shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }
}

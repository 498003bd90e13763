use std::sync::Arc;
use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing::info;
use order_service::api::{self, AppState};
use order_service::clock::{Clock, SystemClock};
use order_service::config::Args;
use order_service::orders::OrdersService;
use order_service::releaser::ReservationReleaser;
use order_service::store::{self, PgStore, Store};
use order_service::telemetry;
use order_service::warehouses::WarehousesService;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Args::parse().into_config()?;
    telemetry::init(config.production).context("failed to install tracing subscriber")?;

    info!("Running database migrations...");
    let database_url = config.database_url.clone();
    tokio::task::spawn_blocking(move || store::run_migrations(&database_url))
        .await
        .context("migration task panicked")??;

    let pg = PgStore::connect(&config.database_url, config.db_max_connections).await?;
    let store: Arc<dyn Store> = Arc::new(pg);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let orders = OrdersService::new(store.clone(), clock.clone(), config.reservation_ttl);
    let warehouses = WarehousesService::new(store, clock);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let releaser = ReservationReleaser::new(orders.clone(), config.sweep_interval, config.sweep_batch_limit)
        .spawn(shutdown_rx);

    let app = api::create_router(AppState { orders, warehouses }, config.request_timeout);
    let listener = tokio::net::TcpListener::bind(config.http_addr).await?;
    info!("Order service listening on http://{}", config.http_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("HTTP server stopped, waiting for reservation releaser");
    let _ = shutdown_tx.send(true);
    releaser.await.context("reservation releaser panicked")?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}

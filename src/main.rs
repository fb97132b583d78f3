use std::time::Duration;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use creditchat::config::AppConfig;
use creditchat::providers::ProviderRouter;
use creditchat::services::Database;
use creditchat::{api, App};

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load()?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let db_path = config.database_path()?;
    let db = Database::open(&db_path)?;
    tracing::info!("Database at {}", db_path.display());

    let providers = ProviderRouter::from_config(&config.providers);
    let listen_addr = config.listen_addr.clone();
    let app = App::new(config, db, providers);

    let recovered = app.recover_orphaned_streams().await?;
    if recovered > 0 {
        tracing::warn!("Recovered {} orphaned streams from the previous run", recovered);
    }

    let listener = tokio::net::TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", listen_addr))?;
    tracing::info!("Listening on {}", listen_addr);

    let signal_app = app.clone();
    axum::serve(listener, api::router(app.clone()))
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
            tracing::info!("Shutting down");
            // Open SSE responses only end once their streams stop
            signal_app.streams.cancel_all();
        })
        .await?;

    app.shutdown(Duration::from_secs(5)).await;
    Ok(())
}

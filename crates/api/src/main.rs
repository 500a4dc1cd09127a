//! Helpline API server

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use helpline_api::{auth::JwtManager, routes::create_router, AppState, Config};
use helpline_shared::{create_pool, run_migrations, MemoryStorage, PgStorage, StorageGateway};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Tokens issued to users are valid for a week
const TOKEN_EXPIRY_HOURS: i64 = 24 * 7;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = Config::from_env().context("invalid configuration")?;

    let storage: Arc<dyn StorageGateway> = match &config.database_url {
        Some(url) => {
            let pool = create_pool(url, config.database_max_connections)
                .await
                .context("failed to connect to database")?;
            run_migrations(&pool)
                .await
                .context("failed to run migrations")?;
            tracing::info!("Connected to PostgreSQL");
            Arc::new(PgStorage::new(pool))
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using in-memory storage (data is lost on restart)");
            Arc::new(MemoryStorage::new())
        }
    };
    let verifier = Arc::new(JwtManager::new(&config.jwt_secret, TOKEN_EXPIRY_HOURS));

    let bind_address = config.bind_address.clone();
    let state = AppState::new(config, storage, verifier);
    let heartbeat = state.heartbeat_monitor().spawn();

    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("failed to bind {}", bind_address))?;
    tracing::info!(address = %bind_address, "Helpline API listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("server error")?;

    heartbeat.abort();
    tracing::info!("Helpline API stopped");
    Ok(())
}

/// `LOG_FORMAT=json` switches to structured JSON output
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("helpline_api=info,helpline_shared=info,tower_http=info"));

    let json = std::env::var("LOG_FORMAT").is_ok_and(|format| format == "json");
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

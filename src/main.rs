use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use sqlx::sqlite::SqlitePoolOptions;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use tracing_subscriber::EnvFilter;

use backchat::config::Config;
use backchat::store::{MemoryStore, RedisStore, SharedStore};
use backchat::{chat, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "info,backchat=debug".into()),
        )
        .init();

    let config = Config::from_env()?;

    let store: Arc<dyn SharedStore> = match &config.redis_url {
        Some(url) => {
            info!(url, "using redis for presence and sessions");
            Arc::new(
                RedisStore::connect(url)
                    .await
                    .with_context(|| format!("connecting to redis at {url}"))?,
            )
        }
        None => {
            info!("using in-process store, presence is per-worker");
            Arc::new(MemoryStore::default())
        }
    };

    let pool = SqlitePoolOptions::new()
        .connect(&config.database_url)
        .await
        .with_context(|| format!("opening database {}", config.database_url))?;

    let state = AppState::new(pool, store, Arc::new(config));
    state.repo().ensure_schema().await?;
    state.dispatch.validate()?;

    let app = Router::new()
        .merge(chat::router())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind(&state.config.bind_addr).await?;
    info!("listening on {}", listener.local_addr()?);
    axum::serve(listener, app).await?;
    Ok(())
}

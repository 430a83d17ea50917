use std::{net::SocketAddr, sync::Arc};

use axum::{
    routing::{get, post},
    Router,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

mod api;
mod app_state;
mod broker;
mod config;
mod tokens;

use app_state::AppState;
use config::load_settings;
use tokens::TokenConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let settings = load_settings();
    let state = AppState::new(
        TokenConfig {
            secret: settings.jwt_secret,
            access_ttl_seconds: settings.access_ttl_seconds,
            refresh_ttl_seconds: settings.refresh_ttl_seconds,
        },
        settings.cookie_secure,
        settings.users,
    );
    let app = build_router(Arc::new(state));

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/auth/login", post(api::login))
        .route("/auth/refresh-token", post(api::refresh_token))
        .route("/auth/logout", post(api::logout))
        .route("/me", get(api::me))
        .route("/ws", get(broker::ws_handler))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;

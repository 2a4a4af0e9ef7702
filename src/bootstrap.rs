use anyhow::{Context, Result};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::{app_state::AppState, config, db};

pub fn init_tracing() {
    tracing_subscriber::fmt().init();
}

pub fn init_env() {
    dotenvy::dotenv().ok();
}

/// Builds the shared state, attaches request tracing and serves the app.
pub async fn bootstrap(service_name: &str, app: Router<AppState>) -> Result<()> {
    let config = config::load()?;
    let db_pool = db::create_pool(&config.database.url).await?;
    let state = AppState { db_pool };

    let app = app.with_state(state).layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    tracing::info!("{service_name} listening on {addr}");

    axum::serve(listener, app)
        .await
        .context("Server exited with an error")?;
    Ok(())
}

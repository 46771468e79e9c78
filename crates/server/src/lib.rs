use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;

pub mod api;
mod app_state;
pub mod config;
pub mod gateway;

pub use api::build_router;
pub use app_state::AppState;

pub async fn serve(listener: TcpListener, state: Arc<AppState>) -> anyhow::Result<()> {
    axum::serve(listener, build_router(state))
        .await
        .context("http server stopped")
}

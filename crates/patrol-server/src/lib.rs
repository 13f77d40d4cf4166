//! HTTP surface for the patrol compliance engine.
//!
//! JSON REST endpoints for topology, shifts, scans, alerts and assignments,
//! plus an SSE stream of domain events. Guards identify themselves with the
//! `x-guard-id` header, supervisors with `x-user-id`.

pub mod config;
pub mod error;
pub mod qr;
mod routes;
pub mod state;

pub use config::ServerConfig;
pub use error::{ApiError, ApiResult};
pub use routes::{build_router, GUARD_HEADER, USER_HEADER};
pub use state::AppState;

use anyhow::Result;
use std::future::Future;
use tokio::net::TcpListener;
use tracing::info;

/// Serve `state` on `listener` until `shutdown` resolves, then stop the
/// background jobs.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    config: &ServerConfig,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let app = build_router(state.clone(), config.request_timeout());
    info!(addr = %listener.local_addr()?, "Patrol server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    state.scheduler.shutdown().await;
    info!("Patrol server stopped");
    Ok(())
}

//! Main Entrypoint for the AudioHook Server
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment.
//! 2. Initializing logging.
//! 3. Constructing the session registry and shared state.
//! 4. Starting the web server and handling graceful shutdown with a
//!    bounded grace period for live sessions.

use anyhow::Context;
use audiohook_server::{config::Config, router::create_router, state::AppState};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- 1. Load Configuration ---
    let config = Config::from_env().context("Failed to load configuration")?;

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();
    info!("Configuration loaded. Initializing application state...");

    // --- 3. Shared State and Shutdown Signal ---
    let state = Arc::new(AppState::new(config.clone()));

    let signal_token = state.shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal. Shutting down gracefully...");
            signal_token.cancel();
        }
    });

    // --- 4. Start Server ---
    let app = create_router(state.clone());
    info!(
        bind_address = %config.bind_address,
        open_failure_policy = ?config.open_failure_policy,
        "Service configured. Starting server..."
    );
    let listener = tokio::net::TcpListener::bind(config.bind_address).await?;

    let serve_token = state.shutdown.clone();
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(serve_token.clone().cancelled_owned())
            .await;
        if let Err(e) = result {
            error!(error = %e, "Server error");
        }
        // Unblocks the shutdown wait below if the server dies on its own.
        serve_token.cancel();
    });

    // --- 5. Graceful Shutdown ---
    state.shutdown.cancelled().await;

    // Read loops observe the token and tear their sessions down; give them
    // the grace period before sweeping whatever is left.
    let drained = tokio::time::timeout(config.shutdown_grace, async {
        while !state.registry.is_empty() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    if drained.is_err() {
        warn!(
            remaining = state.registry.len(),
            "Grace period elapsed; force-closing remaining sessions"
        );
        for id in state.registry.ids() {
            state.registry.remove(&id).await;
        }
    }

    let _ = tokio::time::timeout(Duration::from_secs(1), server).await;
    info!("Server has shut down.");
    Ok(())
}

//! # sensorlink-server
//!
//! HTTP server for sensorlink.
//!
//! This binary provides:
//! - REST API for managing sensor sessions and pulling stored records
//! - OpenAPI specification at `/api/openapi.json`
//! - Structured logging to file and stdout
//!
//! ## Running
//!
//! ```bash
//! # Development, simulated peripherals
//! cargo run --package sensorlink-server
//!
//! # Against BlueZ
//! cargo run --package sensorlink-server --features bluetooth
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

use std::net::SocketAddr;
use std::sync::Arc;

use sensorlink_core::{
    drive, event_channel, transport_channel, Config, SessionRegistry, SimulatedTransport,
    Transport, TransportEventSender,
};
use sensorlink_server::state::{self, AppState};
use sensorlink_server::{api, logging};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

#[cfg(feature = "bluetooth")]
async fn build_transport(
    events: TransportEventSender,
) -> anyhow::Result<(Box<dyn Transport>, Option<SimulatedTransport>)> {
    let transport = sensorlink_core::BluerTransport::new(events.clone()).await?;
    if !transport.is_powered().await? {
        let event = sensorlink_core::TransportEvent::RadioStateChanged { available: false };
        if events.send(event).is_err() {
            tracing::debug!("Transport event channel closed, radio state not reported");
        }
    }
    Ok((Box::new(transport), None))
}

#[cfg(not(feature = "bluetooth"))]
#[allow(clippy::unused_async)]
async fn build_transport(
    events: TransportEventSender,
) -> anyhow::Result<(Box<dyn Transport>, Option<SimulatedTransport>)> {
    info!("Built without bluetooth, using simulated peripherals");
    let simulator = SimulatedTransport::new(events);
    Ok((Box::new(simulator.clone()), Some(simulator)))
}

async fn shutdown_signal(state: AppState) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Cannot listen for shutdown signal");
        return;
    }
    info!("Shutting down");
    state.registry().await.disconnect_all_and_stop(Instant::now());
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load()?;
    logging::init(config.server.production)?;

    info!("Starting sensorlink-server");

    let (transport_tx, transport_rx) = transport_channel();
    let (event_tx, event_rx) = event_channel();
    let (transport, simulator) = build_transport(transport_tx).await?;

    let registry = Arc::new(Mutex::new(SessionRegistry::new(
        transport,
        config.clone(),
        event_tx,
    )));
    tokio::spawn(drive(Arc::clone(&registry), transport_rx));
    tokio::spawn(state::log_events(event_rx));

    let state = AppState::new(registry, config.clone(), simulator);
    state.connect_managed().await?;

    let app = api::create_router(state.clone())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr: SocketAddr = config.server.bind_address.parse()?;
    let listener = TcpListener::bind(addr).await?;

    info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state))
        .await?;

    Ok(())
}

//! Application state shared across handlers.

use std::sync::Arc;

use sensorlink_core::{
    event_channel, transport_channel, Config, Event, EventReceiver, PeripheralHandle, Profile,
    SessionRegistry, SimulatedPeripheral, SimulatedTransport, TransportEventReceiver,
};
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Handle passed to every handler.
pub type SharedState = AppState;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    registry: Arc<Mutex<SessionRegistry>>,
    config: Config,
    simulator: Option<SimulatedTransport>,
}

impl AppState {
    /// Wrap an existing registry. `simulator` is set when the registry runs
    /// on a [`SimulatedTransport`], so peripherals can be conjured on demand.
    #[must_use]
    pub fn new(
        registry: Arc<Mutex<SessionRegistry>>,
        config: Config,
        simulator: Option<SimulatedTransport>,
    ) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                registry,
                config,
                simulator,
            }),
        }
    }

    /// State backed by a fresh simulated transport, plus the channels the
    /// caller must drain.
    #[must_use]
    pub fn simulated(config: Config) -> (Self, TransportEventReceiver, EventReceiver) {
        let (transport_tx, transport_rx) = transport_channel();
        let (event_tx, event_rx) = event_channel();
        let simulator = SimulatedTransport::new(transport_tx);
        let registry = SessionRegistry::new(Box::new(simulator.clone()), config.clone(), event_tx);
        let state = Self::new(Arc::new(Mutex::new(registry)), config, Some(simulator));
        (state, transport_rx, event_rx)
    }

    /// Lock the registry.
    pub async fn registry(&self) -> MutexGuard<'_, SessionRegistry> {
        self.inner.registry.lock().await
    }

    /// The registry handle, for the drive loop.
    #[must_use]
    pub fn registry_handle(&self) -> Arc<Mutex<SessionRegistry>> {
        Arc::clone(&self.inner.registry)
    }

    /// Configuration the server started with.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// The simulated transport, if the server runs on one.
    #[must_use]
    pub fn simulator(&self) -> Option<&SimulatedTransport> {
        self.inner.simulator.as_ref()
    }

    /// Manage and connect `handle`, adding a matching simulated peripheral
    /// first when running simulated.
    ///
    /// # Errors
    ///
    /// Whatever [`SessionRegistry::connect`] refuses the request with.
    pub async fn connect(
        &self,
        handle: PeripheralHandle,
        profile: Profile,
    ) -> sensorlink_core::Result<()> {
        if let Some(simulator) = self.simulator() {
            if !simulator.has_peripheral(&handle.id) {
                debug!(peripheral = %handle.id, %profile, "Adding simulated peripheral");
                simulator.add_peripheral(handle.id.clone(), SimulatedPeripheral::for_profile(profile));
            }
        }
        self.registry().await.connect(handle, profile, Instant::now())
    }

    /// Connect every peripheral listed in the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if a configured address is invalid. Connect failures
    /// are logged and skipped.
    pub async fn connect_managed(&self) -> sensorlink_core::Result<()> {
        let managed = self.config().managed_peripherals()?;
        info!(count = managed.len(), "Connecting configured peripherals");
        for (handle, profile) in managed {
            let id = handle.id.clone();
            if let Err(e) = self.connect(handle, profile).await {
                warn!(peripheral = %id, error = %e, "Configured peripheral not connected");
            }
        }
        Ok(())
    }
}

/// Log every session event until the channel closes.
pub async fn log_events(mut events: EventReceiver) {
    while let Some(event) = events.recv().await {
        let peripheral = &event.peripheral;
        match &event.event {
            Event::Measurement(measurement) => {
                debug!(%peripheral, ?measurement, "Measurement");
            }
            Event::Retrieval(retrieval) => debug!(%peripheral, ?retrieval, "Retrieval"),
            Event::Error { code, message } => warn!(%peripheral, %code, %message, "Session error"),
            other => info!(%peripheral, event = ?other, "Session event"),
        }
    }
}

//! The set of managed sessions and the loop that drives them.
//!
//! A [`SessionRegistry`] owns the transport and every [`Session`]. Callers
//! reach sessions only through it, and it is meant to live behind a single
//! `tokio::sync::Mutex` shared with [`drive`], which feeds transport events
//! and deadline ticks into it.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{Result, SensorlinkError};
use crate::racp::Record;
use crate::session::{RetrievalCommand, Session, SessionInput, SessionSnapshot};
use crate::transport::{Transport, TransportEvent, TransportEventReceiver};
use crate::types::{EventSender, PeripheralHandle, PeripheralId, Profile};

/// Every managed session plus the transport they share.
pub struct SessionRegistry {
    transport: Box<dyn Transport>,
    sessions: HashMap<PeripheralId, Session>,
    config: Config,
    events: EventSender,
    radio_available: bool,
    stopped: bool,
    waker: Arc<Notify>,
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.sessions.len())
            .field("radio_available", &self.radio_available)
            .field("stopped", &self.stopped)
            .finish_non_exhaustive()
    }
}

impl SessionRegistry {
    /// Empty registry. The radio is assumed available until the transport
    /// says otherwise.
    #[must_use]
    pub fn new(transport: Box<dyn Transport>, config: Config, events: EventSender) -> Self {
        Self {
            transport,
            sessions: HashMap::new(),
            config,
            events,
            radio_available: true,
            stopped: false,
            waker: Arc::new(Notify::new()),
        }
    }

    /// Signalled whenever a command may have created new deadlines.
    #[must_use]
    pub fn waker(&self) -> Arc<Notify> {
        Arc::clone(&self.waker)
    }

    /// Whether [`Self::disconnect_all_and_stop`] was called.
    #[must_use]
    pub const fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Whether the radio is usable.
    #[must_use]
    pub const fn radio_available(&self) -> bool {
        self.radio_available
    }

    /// Number of managed sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no session is managed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn input(&mut self, id: &PeripheralId, input: SessionInput, now: Instant) -> Result<()> {
        let session = self
            .sessions
            .get_mut(id)
            .ok_or_else(|| SensorlinkError::NotFound(id.to_string()))?;
        session.transition(input, self.transport.as_mut(), now)?;
        self.waker.notify_one();
        Ok(())
    }

    /// Manage `handle` and connect to it.
    ///
    /// Idempotent: an already managed, live session is left alone. While the
    /// radio is off the session is created but the connect is deferred until
    /// the radio comes back.
    ///
    /// # Errors
    ///
    /// [`SensorlinkError::RegistryStopped`] after shutdown,
    /// [`SensorlinkError::ProfileMismatch`] if the peripheral is managed under
    /// another profile,
    /// [`SensorlinkError::UnsupportedDevice`] for a peripheral already found
    /// unsupported, or a transport error.
    pub fn connect(&mut self, handle: PeripheralHandle, profile: Profile, now: Instant) -> Result<()> {
        if self.stopped {
            return Err(SensorlinkError::RegistryStopped);
        }
        let id = handle.id.clone();
        let session = self.sessions.entry(id.clone()).or_insert_with(|| {
            info!(peripheral = %handle.id, %profile, "Managing peripheral");
            Session::new(handle, profile, &self.config, self.events.clone())
        });
        if session.profile() != profile {
            warn!(
                peripheral = %id,
                existing = %session.profile(),
                requested = %profile,
                "Peripheral already managed with another profile"
            );
            return Err(SensorlinkError::ProfileMismatch {
                address: id.to_string(),
                existing: session.profile().to_string(),
                requested: profile.to_string(),
            });
        }
        if session.state().is_live() {
            return Ok(());
        }
        if !self.radio_available {
            info!(peripheral = %id, "Radio unavailable, deferring connect");
            return Ok(());
        }
        self.input(&id, SessionInput::Connect, now)
    }

    /// Disconnect if needed and drop the session with its records.
    ///
    /// # Errors
    ///
    /// [`SensorlinkError::NotFound`] for an unmanaged peripheral.
    pub fn forget(&mut self, id: &PeripheralId, now: Instant) -> Result<()> {
        let mut session = self
            .sessions
            .remove(id)
            .ok_or_else(|| SensorlinkError::NotFound(id.to_string()))?;
        session.transition(SessionInput::Shutdown, self.transport.as_mut(), now)?;
        info!(peripheral = %id, "Forgot peripheral");
        Ok(())
    }

    /// Disconnect, keeping the session managed.
    ///
    /// # Errors
    ///
    /// [`SensorlinkError::NotFound`] for an unmanaged peripheral.
    pub fn disconnect(&mut self, id: &PeripheralId, now: Instant) -> Result<()> {
        self.input(id, SessionInput::Disconnect, now)
    }

    /// Report the outcome of bonding done outside the transport.
    ///
    /// # Errors
    ///
    /// [`SensorlinkError::NotFound`] for an unmanaged peripheral.
    pub fn set_bonded(&mut self, id: &PeripheralId, bonded: bool, now: Instant) -> Result<()> {
        self.input(id, SessionInput::BondStateChanged { bonded }, now)
    }

    /// Route a record access command.
    ///
    /// # Errors
    ///
    /// [`SensorlinkError::NotFound`] for an unmanaged peripheral, or whatever
    /// the session refuses the command with.
    pub fn retrieval(
        &mut self,
        id: &PeripheralId,
        command: RetrievalCommand,
        now: Instant,
    ) -> Result<()> {
        self.input(id, SessionInput::Retrieval(command), now)
    }

    /// Feed one transport event to the session it concerns.
    pub fn handle_transport_event(&mut self, event: TransportEvent, now: Instant) {
        if let TransportEvent::RadioStateChanged { available } = event {
            self.on_radio_state(available, now);
            return;
        }
        let Some(id) = event.peripheral().cloned() else {
            return;
        };
        let Some(session) = self.sessions.get_mut(&id) else {
            debug!(peripheral = %id, ?event, "Event for unmanaged peripheral");
            return;
        };
        if let Err(e) = session.transition(SessionInput::Transport(event), self.transport.as_mut(), now) {
            warn!(peripheral = %id, error = %e, "Transport event rejected");
        }
    }

    fn on_radio_state(&mut self, available: bool, now: Instant) {
        let was_available = self.radio_available;
        self.radio_available = available;
        if !available {
            info!("Radio unavailable");
            return;
        }
        if was_available || self.stopped || !self.config.registry.reconnect_on_radio_enabled {
            return;
        }
        info!("Radio available, reconnecting managed peripherals");
        let transport = self.transport.as_mut();
        for (id, session) in &mut self.sessions {
            if session.state().is_live() || session.is_unsupported() {
                continue;
            }
            if let Err(e) = session.transition(SessionInput::Connect, transport, now) {
                warn!(peripheral = %id, error = %e, "Reconnect failed");
            }
        }
    }

    /// Tick every session whose deadline has passed.
    pub fn tick(&mut self, now: Instant) {
        let transport = self.transport.as_mut();
        for session in self.sessions.values_mut() {
            if session.next_deadline().is_some_and(|d| d <= now) {
                // Ticks never fail.
                let _ = session.transition(SessionInput::Tick, transport, now);
            }
        }
    }

    /// Earliest deadline across all sessions.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.sessions.values().filter_map(Session::next_deadline).min()
    }

    /// Snapshot of one session.
    ///
    /// # Errors
    ///
    /// [`SensorlinkError::NotFound`] for an unmanaged peripheral.
    pub fn snapshot(&self, id: &PeripheralId) -> Result<SessionSnapshot> {
        self.sessions
            .get(id)
            .map(Session::snapshot)
            .ok_or_else(|| SensorlinkError::NotFound(id.to_string()))
    }

    /// Snapshots of every session, ordered by address.
    #[must_use]
    pub fn snapshots(&self) -> Vec<SessionSnapshot> {
        let mut snapshots: Vec<_> = self.sessions.values().map(Session::snapshot).collect();
        snapshots.sort_by(|a, b| a.address.cmp(&b.address));
        snapshots
    }

    /// Records held for one session, in sequence order.
    ///
    /// # Errors
    ///
    /// [`SensorlinkError::NotFound`] for an unmanaged peripheral.
    pub fn records(&self, id: &PeripheralId) -> Result<Vec<Record>> {
        self.sessions
            .get(id)
            .map(|s| s.records().records().cloned().collect())
            .ok_or_else(|| SensorlinkError::NotFound(id.to_string()))
    }

    /// Disconnect everything and refuse further connects.
    pub fn disconnect_all_and_stop(&mut self, now: Instant) {
        info!(sessions = self.sessions.len(), "Disconnecting all peripherals");
        self.stopped = true;
        let transport = self.transport.as_mut();
        for session in self.sessions.values_mut() {
            let _ = session.transition(SessionInput::Disconnect, transport, now);
        }
        self.waker.notify_one();
    }
}

/// Pump transport events and deadline ticks into `registry` until the
/// transport channel closes.
pub async fn drive(registry: Arc<Mutex<SessionRegistry>>, mut events: TransportEventReceiver) {
    let waker = registry.lock().await.waker();
    loop {
        let deadline = registry.lock().await.next_deadline();
        let sleep = async {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    info!("Transport event channel closed, stopping");
                    break;
                };
                registry.lock().await.handle_transport_event(event, Instant::now());
            }
            () = sleep => registry.lock().await.tick(Instant::now()),
            () = waker.notified() => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{CgmMeasurement, SFloat};
    use crate::gatt;
    use crate::racp::{Phase, RetrievalEvent};
    use crate::simulated::{SimulatedPeripheral, SimulatedTransport};
    use crate::transport::transport_channel;
    use crate::types::{event_channel, ConnectionState, DisconnectReason, Event, EventReceiver};
    use std::time::Duration;

    struct Fixture {
        registry: SessionRegistry,
        sim: SimulatedTransport,
        transport_events: TransportEventReceiver,
        events: EventReceiver,
    }

    impl Fixture {
        fn new(config: Config) -> Self {
            let (ttx, trx) = transport_channel();
            let (etx, erx) = event_channel();
            let sim = SimulatedTransport::new(ttx);
            Self {
                registry: SessionRegistry::new(Box::new(sim.clone()), config, etx),
                sim,
                transport_events: trx,
                events: erx,
            }
        }

        /// Deliver transport events until the channel is empty.
        fn settle(&mut self) {
            while let Ok(event) = self.transport_events.try_recv() {
                self.registry.handle_transport_event(event, Instant::now());
            }
        }

        fn drain(&mut self) -> Vec<Event> {
            let mut out = Vec::new();
            while let Ok(e) = self.events.try_recv() {
                out.push(e.event);
            }
            out
        }

        fn state(&self, id: &PeripheralId) -> ConnectionState {
            self.registry.snapshot(id).unwrap().state
        }
    }

    fn id(n: u8) -> PeripheralId {
        format!("AA:BB:CC:00:00:{n:02X}").parse().unwrap()
    }

    fn glucose(offsets: std::ops::RangeInclusive<u16>) -> Vec<CgmMeasurement> {
        offsets
            .map(|o| CgmMeasurement::new(SFloat::new(120, 0).unwrap(), o))
            .collect()
    }

    #[test]
    fn test_connect_is_idempotent() {
        let mut f = Fixture::new(Config::default());
        f.sim
            .add_peripheral(id(1), SimulatedPeripheral::for_profile(Profile::HeartRate));
        let now = Instant::now();
        f.registry
            .connect(PeripheralHandle::new(id(1)), Profile::HeartRate, now)
            .unwrap();
        f.registry
            .connect(PeripheralHandle::new(id(1)), Profile::HeartRate, now)
            .unwrap();
        f.settle();

        assert_eq!(f.registry.len(), 1);
        assert_eq!(f.state(&id(1)), ConnectionState::Ready);
        let connecting = f.drain().iter().filter(|e| **e == Event::Connecting).count();
        assert_eq!(connecting, 1);

        f.registry
            .connect(PeripheralHandle::new(id(1)), Profile::HeartRate, now)
            .unwrap();
        assert!(f.drain().is_empty());
    }

    #[test]
    fn test_connect_with_other_profile_is_refused() {
        let mut f = Fixture::new(Config::default());
        f.sim
            .add_peripheral(id(2), SimulatedPeripheral::for_profile(Profile::HeartRate));
        let now = Instant::now();
        f.registry
            .connect(PeripheralHandle::new(id(2)), Profile::HeartRate, now)
            .unwrap();

        let err = f
            .registry
            .connect(PeripheralHandle::new(id(2)), Profile::ContinuousGlucose, now)
            .unwrap_err();
        assert!(matches!(err, SensorlinkError::ProfileMismatch { .. }));
        assert_eq!(err.http_status_code(), 409);
        assert_eq!(
            f.registry.snapshot(&id(2)).unwrap().profile,
            Profile::HeartRate
        );
    }

    #[test]
    fn test_unknown_ids_are_not_found() {
        let mut f = Fixture::new(Config::default());
        let now = Instant::now();
        assert!(matches!(
            f.registry.forget(&id(9), now),
            Err(SensorlinkError::NotFound(_))
        ));
        assert!(matches!(
            f.registry.retrieval(&id(9), RetrievalCommand::All, now),
            Err(SensorlinkError::NotFound(_))
        ));
        assert!(f.registry.snapshot(&id(9)).is_err());
    }

    #[test]
    fn test_forget_disconnects_and_drops_records() {
        let mut f = Fixture::new(Config::default());
        f.sim.add_peripheral(
            id(1),
            SimulatedPeripheral::for_profile(Profile::ContinuousGlucose)
                .with_records(glucose(0..=2)),
        );
        let now = Instant::now();
        f.registry
            .connect(PeripheralHandle::new(id(1)), Profile::ContinuousGlucose, now)
            .unwrap();
        f.settle();
        f.registry
            .retrieval(&id(1), RetrievalCommand::All, now)
            .unwrap();
        f.settle();
        assert_eq!(f.registry.records(&id(1)).unwrap().len(), 3);

        f.registry.forget(&id(1), now).unwrap();
        assert!(f.registry.is_empty());
        assert_eq!(
            f.drain().last(),
            Some(&Event::Disconnected {
                reason: DisconnectReason::Requested
            })
        );
        // The transport's own disconnect notice finds no session.
        f.settle();
        assert!(f.registry.records(&id(1)).is_err());
    }

    #[test]
    fn test_get_all_then_get_since() {
        let mut f = Fixture::new(Config::default());
        f.sim.add_peripheral(
            id(2),
            SimulatedPeripheral::for_profile(Profile::ContinuousGlucose)
                .with_crc(true)
                .with_records(glucose(0..=4)),
        );
        let now = Instant::now();
        f.registry
            .connect(PeripheralHandle::new(id(2)), Profile::ContinuousGlucose, now)
            .unwrap();
        f.settle();
        f.drain();

        f.registry
            .retrieval(&id(2), RetrievalCommand::All, now)
            .unwrap();
        f.settle();
        let retrieval: Vec<_> = f
            .drain()
            .into_iter()
            .filter_map(|e| match e {
                Event::Retrieval(r) => Some(r),
                _ => None,
            })
            .collect();
        assert_eq!(retrieval.first(), Some(&RetrievalEvent::Started));
        assert_eq!(
            retrieval.last(),
            Some(&RetrievalEvent::Completed { records: 5 })
        );
        let records = f.registry.records(&id(2)).unwrap();
        assert_eq!(records.len(), 5);
        // Session start time was read, so records carry timestamps.
        assert!(records.iter().all(|r| r.timestamp.is_some()));

        for m in glucose(5..=6) {
            f.sim.push_record(&id(2), m);
        }
        f.registry
            .retrieval(&id(2), RetrievalCommand::Since, now)
            .unwrap();
        f.settle();
        let received = f
            .drain()
            .into_iter()
            .filter(|e| matches!(e, Event::Retrieval(RetrievalEvent::RecordReceived { .. })))
            .count();
        assert_eq!(received, 2);
        assert_eq!(f.registry.records(&id(2)).unwrap().len(), 7);
    }

    #[test]
    fn test_delete_all_clears_both_sides() {
        let mut f = Fixture::new(Config::default());
        f.sim.add_peripheral(
            id(3),
            SimulatedPeripheral::for_profile(Profile::ContinuousGlucose)
                .with_records(glucose(0..=1)),
        );
        let now = Instant::now();
        f.registry
            .connect(PeripheralHandle::new(id(3)), Profile::ContinuousGlucose, now)
            .unwrap();
        f.settle();
        f.registry
            .retrieval(&id(3), RetrievalCommand::All, now)
            .unwrap();
        f.settle();
        f.registry
            .retrieval(&id(3), RetrievalCommand::DeleteAll, now)
            .unwrap();
        f.settle();

        assert_eq!(f.sim.record_count(&id(3)), 0);
        assert!(f.registry.records(&id(3)).unwrap().is_empty());
        assert_eq!(
            f.registry.snapshot(&id(3)).unwrap().retrieval_phase,
            Phase::Idle
        );
    }

    #[test]
    fn test_radio_toggle_reconnects() {
        let mut f = Fixture::new(Config::default());
        f.sim
            .add_peripheral(id(4), SimulatedPeripheral::for_profile(Profile::RunningSpeedCadence));
        let now = Instant::now();
        f.registry
            .connect(PeripheralHandle::new(id(4)), Profile::RunningSpeedCadence, now)
            .unwrap();
        f.settle();

        f.sim.set_radio(false);
        f.settle();
        assert!(!f.registry.radio_available());
        assert_eq!(f.state(&id(4)), ConnectionState::Disconnected);

        f.sim.set_radio(true);
        f.settle();
        assert_eq!(f.state(&id(4)), ConnectionState::Ready);
    }

    #[test]
    fn test_connect_deferred_while_radio_off() {
        let mut f = Fixture::new(Config::default());
        f.sim
            .add_peripheral(id(5), SimulatedPeripheral::for_profile(Profile::HeartRate));
        f.sim.set_radio(false);
        f.settle();

        let now = Instant::now();
        f.registry
            .connect(PeripheralHandle::new(id(5)), Profile::HeartRate, now)
            .unwrap();
        assert_eq!(f.state(&id(5)), ConnectionState::Idle);

        f.sim.set_radio(true);
        f.settle();
        assert_eq!(f.state(&id(5)), ConnectionState::Ready);
    }

    #[test]
    fn test_no_reconnect_when_disabled() {
        let mut config = Config::default();
        config.registry.reconnect_on_radio_enabled = false;
        let mut f = Fixture::new(config);
        f.sim
            .add_peripheral(id(6), SimulatedPeripheral::for_profile(Profile::HeartRate));
        let now = Instant::now();
        f.registry
            .connect(PeripheralHandle::new(id(6)), Profile::HeartRate, now)
            .unwrap();
        f.settle();
        f.sim.set_radio(false);
        f.sim.set_radio(true);
        f.settle();
        assert_eq!(f.state(&id(6)), ConnectionState::Disconnected);
    }

    #[test]
    fn test_unsupported_peripheral_is_not_reconnected() {
        let mut f = Fixture::new(Config::default());
        f.sim.add_peripheral(
            id(7),
            SimulatedPeripheral::new(&[gatt::BATTERY_LEVEL]),
        );
        let now = Instant::now();
        f.registry
            .connect(PeripheralHandle::new(id(7)), Profile::HeartRate, now)
            .unwrap();
        f.settle();
        assert!(f.registry.snapshot(&id(7)).unwrap().unsupported);

        f.sim.set_radio(false);
        f.sim.set_radio(true);
        f.settle();
        assert_eq!(f.state(&id(7)), ConnectionState::Disconnected);
        assert!(matches!(
            f.registry
                .connect(PeripheralHandle::new(id(7)), Profile::HeartRate, now),
            Err(SensorlinkError::UnsupportedDevice(_))
        ));
    }

    #[test]
    fn test_stop_refuses_connects() {
        let mut f = Fixture::new(Config::default());
        f.sim
            .add_peripheral(id(8), SimulatedPeripheral::for_profile(Profile::HeartRate));
        let now = Instant::now();
        f.registry
            .connect(PeripheralHandle::new(id(8)), Profile::HeartRate, now)
            .unwrap();
        f.settle();

        f.registry.disconnect_all_and_stop(now);
        f.settle();
        assert!(f.registry.is_stopped());
        assert_eq!(f.state(&id(8)), ConnectionState::Disconnected);
        assert!(matches!(
            f.registry
                .connect(PeripheralHandle::new(id(8)), Profile::HeartRate, now),
            Err(SensorlinkError::RegistryStopped)
        ));
    }

    #[test]
    fn test_bonding_through_registry() {
        let mut f = Fixture::new(Config::default());
        f.sim.add_peripheral(
            id(10),
            SimulatedPeripheral::for_profile(Profile::BloodPressure).requiring_authentication(),
        );
        let now = Instant::now();
        f.registry
            .connect(PeripheralHandle::new(id(10)), Profile::BloodPressure, now)
            .unwrap();
        f.settle();
        assert!(f.drain().contains(&Event::BondingRequired));
        assert_eq!(f.state(&id(10)), ConnectionState::Initializing);

        f.sim.bond(&id(10));
        f.settle();
        assert_eq!(f.state(&id(10)), ConnectionState::Ready);
        assert!(f.registry.snapshot(&id(10)).unwrap().bonded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drive_times_out_unresponsive_setup() {
        let mut config = Config::default();
        config.session.operation_timeout_ms = 1000;
        config.session.max_retries = 2;
        config.session.retry_backoff_ms = 200;

        let (ttx, trx) = transport_channel();
        let (etx, mut erx) = event_channel();
        let sim = SimulatedTransport::new(ttx);
        sim.add_peripheral(
            id(11),
            SimulatedPeripheral::for_profile(Profile::HeartRate).unresponsive(),
        );
        let registry = Arc::new(Mutex::new(SessionRegistry::new(
            Box::new(sim.clone()),
            config,
            etx,
        )));
        tokio::spawn(drive(Arc::clone(&registry), trx));

        let started = Instant::now();
        registry
            .lock()
            .await
            .connect(PeripheralHandle::new(id(11)), Profile::HeartRate, started)
            .unwrap();

        let reason = tokio::time::timeout(Duration::from_secs(60), async {
            while let Some(e) = erx.recv().await {
                if let Event::Disconnected { reason } = e.event {
                    return reason;
                }
            }
            panic!("event channel closed");
        })
        .await
        .unwrap();

        assert_eq!(reason, DisconnectReason::InitializationFailed);
        // Three attempts of 1 s plus backoffs of 200 ms and 400 ms.
        assert!(started.elapsed() >= Duration::from_millis(3600));
    }
}

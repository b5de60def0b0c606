//! Per-peripheral session state machine.
//!
//! A [`Session`] owns one peripheral's lifecycle:
//!
//! ```text
//! Idle ─connect─► Connecting ─connected─► Discovering ─discovered─► Validating
//!                                                                      │
//!             ┌── missing required characteristic (NotSupported) ◄─────┤
//!             ▼                                                        ▼
//!       Disconnecting ◄─ disconnect / setup failure ── Ready ◄─ Initializing
//!             │                                          │
//!             ▼                                          │ link loss
//!       Disconnected ◄───────────────────────────────────┘
//! ```
//!
//! Everything that can happen to a session arrives through
//! [`Session::transition`] as a [`SessionInput`]. Wire work is queued on the
//! session's [`OperationQueue`] and handed to the [`Transport`] one attempt at
//! a time; results, notifications and link changes come back as
//! [`TransportEvent`]s. Upward events go out on the [`EventSender`].

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use utoipa::ToSchema;

use crate::codec::{cgm, CscCalculator, DecodeError, Measurement, MeasurementKind};
use crate::config::{Config, SessionConfig};
use crate::error::SensorlinkError;
use crate::gatt::{self, CharacteristicId};
use crate::queue::{Completion, Issue, Operation, OperationKind, OperationQueue, Origin};
use crate::racp::{
    Phase, RacpResponse, Record, RecordStore, RetrievalEngine, RetrievalError, RetrievalEvent,
    Step,
};
use crate::transport::{OperationError, Transport, TransportError, TransportEvent};
use crate::types::{
    ConnectionState, DisconnectReason, Event, EventSender, PeripheralHandle, PeripheralId,
    Profile, SessionEvent,
};

/// Errors returned synchronously by [`Session::transition`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    /// The session already holds or is acquiring a link.
    #[error("Peripheral {0} is already connected")]
    AlreadyConnected(PeripheralId),

    /// The peripheral was found to lack a required characteristic.
    #[error("Peripheral {0} does not support its profile")]
    Unsupported(PeripheralId),

    /// The command needs a ready session.
    #[error("Peripheral {peripheral} is not ready (state: {state})")]
    NotReady {
        /// Peripheral.
        peripheral: PeripheralId,
        /// Current state.
        state: ConnectionState,
    },

    /// The profile has no record access control point.
    #[error("Peripheral {0} has no record access control point")]
    RecordAccessUnavailable(PeripheralId),

    /// The retrieval engine refused the command.
    #[error(transparent)]
    Retrieval(#[from] RetrievalError),

    /// The transport refused to start a request.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// High-level record access commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrievalCommand {
    /// Every stored record.
    All,
    /// The oldest record.
    First,
    /// The newest record.
    Last,
    /// Records newer than the newest one already held.
    Since,
    /// Abort the running retrieval.
    Abort,
    /// Delete every record on the peripheral.
    DeleteAll,
}

/// Everything that can drive a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionInput {
    /// Start connecting.
    Connect,
    /// Disconnect and wait for the transport to confirm.
    Disconnect,
    /// Disconnect now without waiting; the session is about to be dropped.
    Shutdown,
    /// Something the transport reported about this peripheral.
    Transport(TransportEvent),
    /// Time has passed; check operation deadlines and backoffs.
    Tick,
    /// A record access command.
    Retrieval(RetrievalCommand),
    /// Bonding finished (or the bond was removed) outside the transport.
    BondStateChanged {
        /// Whether the peripheral is now bonded.
        bonded: bool,
    },
}

/// Where a characteristic's values go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Handler {
    Measurement(MeasurementKind),
    CgmMeasurement,
    CgmFeature,
    CgmSessionStartTime,
    RecordAccess,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    Notify,
    Indicate,
    Read,
}

#[derive(Debug, Clone, Copy)]
struct CharacteristicSpec {
    id: CharacteristicId,
    required: bool,
    access: Access,
    handler: Handler,
}

const fn entry(
    id: CharacteristicId,
    required: bool,
    access: Access,
    handler: Handler,
) -> CharacteristicSpec {
    CharacteristicSpec {
        id,
        required,
        access,
        handler,
    }
}

const BATTERY: CharacteristicSpec = entry(
    gatt::BATTERY_LEVEL,
    false,
    Access::Notify,
    Handler::Measurement(MeasurementKind::BatteryLevel),
);

const HEART_RATE_LAYOUT: &[CharacteristicSpec] = &[
    entry(
        gatt::HEART_RATE_MEASUREMENT,
        true,
        Access::Notify,
        Handler::Measurement(MeasurementKind::HeartRate),
    ),
    entry(
        gatt::BODY_SENSOR_LOCATION,
        false,
        Access::Read,
        Handler::Measurement(MeasurementKind::BodySensorLocation),
    ),
    BATTERY,
];

const BLOOD_PRESSURE_LAYOUT: &[CharacteristicSpec] = &[
    entry(
        gatt::BLOOD_PRESSURE_MEASUREMENT,
        true,
        Access::Indicate,
        Handler::Measurement(MeasurementKind::BloodPressure),
    ),
    entry(
        gatt::INTERMEDIATE_CUFF_PRESSURE,
        false,
        Access::Notify,
        Handler::Measurement(MeasurementKind::IntermediateCuffPressure),
    ),
    BATTERY,
];

const CSC_LAYOUT: &[CharacteristicSpec] = &[
    entry(
        gatt::CSC_MEASUREMENT,
        true,
        Access::Notify,
        Handler::Measurement(MeasurementKind::CyclingSpeedCadence),
    ),
    BATTERY,
];

const RSC_LAYOUT: &[CharacteristicSpec] = &[
    entry(
        gatt::RSC_MEASUREMENT,
        true,
        Access::Notify,
        Handler::Measurement(MeasurementKind::RunningSpeedCadence),
    ),
    BATTERY,
];

const THERMOMETER_LAYOUT: &[CharacteristicSpec] = &[
    entry(
        gatt::TEMPERATURE_MEASUREMENT,
        true,
        Access::Indicate,
        Handler::Measurement(MeasurementKind::Temperature),
    ),
    entry(
        gatt::INTERMEDIATE_TEMPERATURE,
        false,
        Access::Notify,
        Handler::Measurement(MeasurementKind::IntermediateTemperature),
    ),
    BATTERY,
];

const CGM_LAYOUT: &[CharacteristicSpec] = &[
    entry(
        gatt::CGM_MEASUREMENT,
        true,
        Access::Notify,
        Handler::CgmMeasurement,
    ),
    entry(
        gatt::RECORD_ACCESS_CONTROL_POINT,
        true,
        Access::Indicate,
        Handler::RecordAccess,
    ),
    entry(gatt::CGM_FEATURE, false, Access::Read, Handler::CgmFeature),
    entry(
        gatt::CGM_SESSION_START_TIME,
        false,
        Access::Read,
        Handler::CgmSessionStartTime,
    ),
    BATTERY,
];

const fn layout(profile: Profile) -> &'static [CharacteristicSpec] {
    match profile {
        Profile::HeartRate => HEART_RATE_LAYOUT,
        Profile::BloodPressure => BLOOD_PRESSURE_LAYOUT,
        Profile::CyclingSpeedCadence => CSC_LAYOUT,
        Profile::RunningSpeedCadence => RSC_LAYOUT,
        Profile::HealthThermometer => THERMOMETER_LAYOUT,
        Profile::ContinuousGlucose => CGM_LAYOUT,
    }
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct SessionSnapshot {
    /// Bluetooth address.
    pub address: String,
    /// Advertised name, if known.
    pub name: Option<String>,
    /// Profile spoken.
    pub profile: Profile,
    /// Lifecycle state.
    pub state: ConnectionState,
    /// Whether the peripheral is bonded.
    pub bonded: bool,
    /// Whether an operation is parked waiting for bonding.
    pub bonding_pending: bool,
    /// Whether the peripheral was found to lack a required characteristic.
    pub unsupported: bool,
    /// Why the session last went down.
    pub disconnect_reason: Option<DisconnectReason>,
    /// Record retrieval phase.
    pub retrieval_phase: Phase,
    /// Records held locally.
    pub record_count: usize,
    /// Last reported battery level.
    pub battery_level: Option<u8>,
    /// Operations queued or in flight.
    pub pending_operations: usize,
}

/// One peripheral's lifecycle, operation queue and record store.
#[derive(Debug)]
pub struct Session {
    handle: PeripheralHandle,
    profile: Profile,
    state: ConnectionState,
    handlers: HashMap<CharacteristicId, Handler>,
    queue: OperationQueue,
    config: SessionConfig,
    bonded: bool,
    bonding_pending: bool,
    unsupported: bool,
    disconnect_reason: Option<DisconnectReason>,
    store: RecordStore,
    retrieval: RetrievalEngine,
    csc: CscCalculator,
    cgm_crc: bool,
    session_start: Option<DateTime<Utc>>,
    battery_level: Option<u8>,
    events: EventSender,
}

impl Session {
    /// Idle session for `handle`.
    #[must_use]
    pub fn new(
        handle: PeripheralHandle,
        profile: Profile,
        config: &Config,
        events: EventSender,
    ) -> Self {
        Self {
            handle,
            profile,
            state: ConnectionState::Idle,
            handlers: HashMap::new(),
            queue: OperationQueue::new(config.session.retry_backoff()),
            config: config.session.clone(),
            bonded: false,
            bonding_pending: false,
            unsupported: false,
            disconnect_reason: None,
            store: RecordStore::new(),
            retrieval: RetrievalEngine::new(),
            csc: CscCalculator::new(config.profiles.wheel_circumference_mm),
            cgm_crc: false,
            session_start: None,
            battery_level: None,
            events,
        }
    }

    /// Peripheral identity.
    #[must_use]
    pub const fn id(&self) -> &PeripheralId {
        &self.handle.id
    }

    /// Handle the session was created with.
    #[must_use]
    pub const fn handle(&self) -> &PeripheralHandle {
        &self.handle
    }

    /// Profile spoken.
    #[must_use]
    pub const fn profile(&self) -> Profile {
        self.profile
    }

    /// Lifecycle state.
    #[must_use]
    pub const fn state(&self) -> ConnectionState {
        self.state
    }

    /// Whether the peripheral is bonded.
    #[must_use]
    pub const fn is_bonded(&self) -> bool {
        self.bonded
    }

    /// Whether validation found a required characteristic missing.
    #[must_use]
    pub const fn is_unsupported(&self) -> bool {
        self.unsupported
    }

    /// Records held locally.
    #[must_use]
    pub const fn records(&self) -> &RecordStore {
        &self.store
    }

    /// When the session next needs a [`SessionInput::Tick`].
    #[must_use]
    pub const fn next_deadline(&self) -> Option<Instant> {
        self.queue.next_deadline()
    }

    /// Point-in-time view.
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            address: self.handle.id.to_string(),
            name: self.handle.name.clone(),
            profile: self.profile,
            state: self.state,
            bonded: self.bonded,
            bonding_pending: self.bonding_pending,
            unsupported: self.unsupported,
            disconnect_reason: self.disconnect_reason,
            retrieval_phase: self.retrieval.phase(),
            record_count: self.store.len(),
            battery_level: self.battery_level,
            pending_operations: self.queue.outstanding(),
        }
    }

    /// Single entry point for everything that drives the session.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`] when a command is not legal in the current
    /// state. Transport events and ticks never fail; their problems surface
    /// as events.
    pub fn transition(
        &mut self,
        input: SessionInput,
        transport: &mut dyn Transport,
        now: Instant,
    ) -> Result<(), SessionError> {
        match input {
            SessionInput::Connect => self.connect(transport),
            SessionInput::Disconnect => {
                self.disconnect(transport);
                Ok(())
            }
            SessionInput::Shutdown => {
                self.shutdown(transport);
                Ok(())
            }
            SessionInput::Transport(event) => {
                self.on_transport_event(event, transport, now);
                Ok(())
            }
            SessionInput::Tick => {
                if let Some(completion) = self.queue.poll_timeouts(now) {
                    self.on_completion(completion, transport);
                }
                self.pump(transport, now);
                Ok(())
            }
            SessionInput::Retrieval(command) => self.on_retrieval(command, transport, now),
            SessionInput::BondStateChanged { bonded } => {
                self.on_bond_state(bonded, transport, now);
                Ok(())
            }
        }
    }

    // ── Events ───────────────────────────────────────────────────────────────

    fn emit(&self, event: Event) {
        // The receiver going away only means nobody is listening any more.
        let _ = self.events.send(SessionEvent {
            peripheral: self.handle.id.clone(),
            event,
        });
    }

    fn emit_error(&self, err: &SensorlinkError) {
        self.emit(Event::Error {
            code: err.error_code().to_string(),
            message: err.to_string(),
        });
    }

    // ── Lifecycle ────────────────────────────────────────────────────────────

    fn connect(&mut self, transport: &mut dyn Transport) -> Result<(), SessionError> {
        if self.unsupported {
            return Err(SessionError::Unsupported(self.handle.id.clone()));
        }
        if self.state.is_live() {
            return Err(SessionError::AlreadyConnected(self.handle.id.clone()));
        }
        transport.connect(&self.handle.id)?;
        info!(peripheral = %self.handle.id, profile = %self.profile, "Connecting");
        self.state = ConnectionState::Connecting;
        self.disconnect_reason = None;
        self.emit(Event::Connecting);
        Ok(())
    }

    fn disconnect(&mut self, transport: &mut dyn Transport) {
        if !self.state.is_live() || self.state == ConnectionState::Disconnecting {
            return;
        }
        self.begin_disconnect(DisconnectReason::Requested, transport);
    }

    fn shutdown(&mut self, transport: &mut dyn Transport) {
        if !self.state.is_live() {
            return;
        }
        self.teardown();
        if let Err(e) = transport.disconnect(&self.handle.id) {
            debug!(peripheral = %self.handle.id, error = %e, "Disconnect during shutdown failed");
        }
        self.finish_disconnect(DisconnectReason::Requested);
    }

    fn begin_disconnect(&mut self, reason: DisconnectReason, transport: &mut dyn Transport) {
        info!(peripheral = %self.handle.id, ?reason, "Disconnecting");
        self.teardown();
        self.state = ConnectionState::Disconnecting;
        self.disconnect_reason = Some(reason);
        if let Err(e) = transport.disconnect(&self.handle.id) {
            warn!(peripheral = %self.handle.id, error = %e, "Disconnect request failed");
            self.finish_disconnect(reason);
        }
    }

    fn finish_disconnect(&mut self, reason: DisconnectReason) {
        self.teardown();
        self.state = ConnectionState::Disconnected;
        self.disconnect_reason = Some(reason);
        match reason {
            DisconnectReason::Requested | DisconnectReason::LinkLoss => {
                info!(peripheral = %self.handle.id, ?reason, "Disconnected");
            }
            _ => error!(peripheral = %self.handle.id, ?reason, "Session ended"),
        }
        self.emit(Event::Disconnected { reason });
    }

    /// Drop everything tied to the current link.
    fn teardown(&mut self) {
        for operation in self.queue.clear() {
            debug!(
                peripheral = %self.handle.id,
                target = %operation.target,
                error = %OperationError::Cancelled,
                "Dropping queued operation"
            );
        }
        self.handlers.clear();
        self.bonding_pending = false;
        self.csc.reset();
        let step = self.retrieval.cancel();
        self.emit_retrieval(step.events);
    }

    fn fail(&mut self, reason: DisconnectReason, err: &SensorlinkError, transport: &mut dyn Transport) {
        self.emit_error(err);
        self.begin_disconnect(reason, transport);
    }

    // ── Transport events ─────────────────────────────────────────────────────

    fn on_transport_event(
        &mut self,
        event: TransportEvent,
        transport: &mut dyn Transport,
        now: Instant,
    ) {
        match event {
            TransportEvent::Connected { .. } => {
                if self.state != ConnectionState::Connecting {
                    debug!(peripheral = %self.handle.id, state = %self.state, "Ignoring connected event");
                    return;
                }
                info!(peripheral = %self.handle.id, "Connected, discovering characteristics");
                self.state = ConnectionState::Discovering;
                self.emit(Event::Connected);
                if let Err(e) = transport.discover_characteristics(&self.handle.id) {
                    self.fail(DisconnectReason::TransportError, &e.into(), transport);
                }
            }
            TransportEvent::ConnectFailed { reason, .. } => {
                if self.state != ConnectionState::Connecting {
                    return;
                }
                self.emit_error(&TransportError::Backend(reason).into());
                self.finish_disconnect(DisconnectReason::TransportError);
            }
            TransportEvent::ServicesDiscovered {
                characteristics, ..
            } => {
                if self.state != ConnectionState::Discovering {
                    debug!(peripheral = %self.handle.id, state = %self.state, "Ignoring discovery result");
                    return;
                }
                self.state = ConnectionState::Validating;
                self.validate(&characteristics, transport, now);
            }
            TransportEvent::DiscoveryFailed { reason, .. } => {
                if self.state != ConnectionState::Discovering {
                    return;
                }
                self.fail(
                    DisconnectReason::TransportError,
                    &TransportError::Backend(reason).into(),
                    transport,
                );
            }
            TransportEvent::Disconnected { .. } => self.on_disconnected(),
            TransportEvent::ValueChanged {
                characteristic,
                value,
                ..
            } => {
                if matches!(
                    self.state,
                    ConnectionState::Initializing | ConnectionState::Ready
                ) {
                    self.dispatch(characteristic, &value);
                    self.pump(transport, now);
                }
            }
            TransportEvent::OperationResult { token, result, .. } => {
                match self.queue.complete(token, result, now) {
                    Some(completion) => self.on_completion(completion, transport),
                    None => warn!(peripheral = %self.handle.id, %token, "Dropping stale operation result"),
                }
                self.pump(transport, now);
            }
            TransportEvent::BondStateChanged { bonded, .. } => {
                self.on_bond_state(bonded, transport, now);
            }
            TransportEvent::RadioStateChanged { .. } => {}
        }
    }

    fn on_disconnected(&mut self) {
        let reason = match self.state {
            ConnectionState::Idle | ConnectionState::Disconnected => return,
            ConnectionState::Disconnecting => {
                self.disconnect_reason.unwrap_or(DisconnectReason::Requested)
            }
            ConnectionState::Ready => {
                warn!(peripheral = %self.handle.id, "Link lost");
                self.emit(Event::LinkLoss);
                DisconnectReason::LinkLoss
            }
            _ => DisconnectReason::LinkLoss,
        };
        self.finish_disconnect(reason);
    }

    fn validate(
        &mut self,
        discovered: &[CharacteristicId],
        transport: &mut dyn Transport,
        now: Instant,
    ) {
        let specs = layout(self.profile);
        let missing: Vec<_> = specs
            .iter()
            .filter(|s| s.required && !discovered.contains(&s.id))
            .map(|s| s.id)
            .collect();
        if !missing.is_empty() {
            warn!(
                peripheral = %self.handle.id,
                profile = %self.profile,
                ?missing,
                "Required characteristics missing"
            );
            self.unsupported = true;
            self.emit(Event::NotSupported);
            self.begin_disconnect(DisconnectReason::UnsupportedDevice, transport);
            return;
        }

        let present: Vec<&CharacteristicSpec> = specs
            .iter()
            .filter(|s| discovered.contains(&s.id))
            .collect();
        self.handlers = present.iter().map(|s| (s.id, s.handler)).collect();
        info!(
            peripheral = %self.handle.id,
            characteristics = present.len(),
            "Capabilities validated"
        );
        self.emit(Event::CapabilitiesValidated);
        self.state = ConnectionState::Initializing;

        let subscriptions = |required: bool| {
            present
                .iter()
                .filter(move |s| s.required == required && s.access != Access::Read)
        };
        let reads = present.iter().filter(|s| s.access == Access::Read);
        let setup: Vec<Operation> = subscriptions(true)
            .chain(subscriptions(false))
            .chain(reads)
            .map(|s| {
                let kind = match s.access {
                    Access::Notify => OperationKind::EnableNotifications,
                    Access::Indicate => OperationKind::EnableIndications,
                    Access::Read => OperationKind::Read,
                };
                Operation::new(
                    kind,
                    s.id,
                    Origin::Setup {
                        required: s.required,
                    },
                    &self.config,
                )
            })
            .collect();
        for operation in setup {
            self.queue.enqueue(operation);
        }
        self.pump(transport, now);
    }

    // ── Operation queue ──────────────────────────────────────────────────────

    /// Issue whatever the queue allows, then check whether setup finished.
    fn pump(&mut self, transport: &mut dyn Transport, now: Instant) {
        while let Some(issue) = self.queue.start_next(now) {
            debug!(peripheral = %self.handle.id, token = %issue.token, target = %issue.target, kind = ?issue.kind, "Issuing operation");
            let Err(e) = self.send(&issue, transport) else {
                break;
            };
            if let Some(completion) =
                self.queue
                    .complete(issue.token, Err(OperationError::Transport(e.to_string())), now)
            {
                self.on_completion(completion, transport);
            }
        }

        if self.state == ConnectionState::Initializing && self.queue.is_idle() {
            info!(peripheral = %self.handle.id, "Ready");
            self.state = ConnectionState::Ready;
            self.emit(Event::Ready);
        }
    }

    fn send(&self, issue: &Issue, transport: &mut dyn Transport) -> Result<(), TransportError> {
        let id = &self.handle.id;
        match &issue.kind {
            OperationKind::Read => transport.read_characteristic(id, issue.target, issue.token),
            OperationKind::Write(value) => {
                transport.write_characteristic(id, issue.target, value, issue.token)
            }
            OperationKind::EnableNotifications => transport.write_descriptor(
                id,
                issue.target,
                gatt::CLIENT_CHARACTERISTIC_CONFIGURATION,
                &gatt::ENABLE_NOTIFICATION_VALUE,
                issue.token,
            ),
            OperationKind::EnableIndications => transport.write_descriptor(
                id,
                issue.target,
                gatt::CLIENT_CHARACTERISTIC_CONFIGURATION,
                &gatt::ENABLE_INDICATION_VALUE,
                issue.token,
            ),
        }
    }

    fn on_completion(&mut self, completion: Completion, transport: &mut dyn Transport) {
        match completion {
            Completion::Succeeded { operation, value } => {
                if let (OperationKind::Read, Some(value)) = (&operation.kind, value) {
                    self.dispatch(operation.target, &value);
                }
            }
            Completion::Retrying {
                target,
                error,
                retries_left,
            } => {
                warn!(peripheral = %self.handle.id, %target, %error, retries_left, "Retrying operation");
            }
            Completion::Failed { operation, error } => {
                self.on_operation_failed(&operation, &error, transport);
            }
            Completion::Parked { target } => {
                if self.bonded {
                    if let Some(operation) = self.queue.abandon_parked() {
                        self.on_operation_failed(
                            &operation,
                            &OperationError::InsufficientAuthentication,
                            transport,
                        );
                    }
                    return;
                }
                info!(peripheral = %self.handle.id, %target, "Bonding required");
                self.bonding_pending = true;
                self.emit(Event::BondingRequired);
            }
        }
    }

    fn on_operation_failed(
        &mut self,
        operation: &Operation,
        error: &OperationError,
        transport: &mut dyn Transport,
    ) {
        warn!(peripheral = %self.handle.id, target = %operation.target, %error, "Operation failed");
        match operation.origin {
            Origin::RecordAccess => {
                let step = self.retrieval.on_write_failed(&error.to_string());
                self.emit_retrieval(step.events);
            }
            Origin::Setup { .. }
                if operation.is_required() && self.state == ConnectionState::Initializing =>
            {
                self.fail(
                    DisconnectReason::InitializationFailed,
                    &error.clone().into(),
                    transport,
                );
            }
            Origin::Setup { .. } => {}
        }
    }

    // ── Bonding ──────────────────────────────────────────────────────────────

    fn on_bond_state(&mut self, bonded: bool, transport: &mut dyn Transport, now: Instant) {
        let was_bonded = self.bonded;
        self.bonded = bonded;

        if bonded {
            if !was_bonded || self.bonding_pending {
                info!(peripheral = %self.handle.id, "Bonded");
                self.emit(Event::Bonded);
            }
            self.bonding_pending = false;
            if self.queue.resume_parked(now) {
                self.pump(transport, now);
            }
            return;
        }

        if !self.bonding_pending {
            return;
        }
        warn!(peripheral = %self.handle.id, "Bonding failed");
        self.bonding_pending = false;
        self.emit(Event::BondingFailed);
        let Some(operation) = self.queue.abandon_parked() else {
            return;
        };
        if self.state == ConnectionState::Initializing {
            self.emit_error(&SensorlinkError::AuthenticationRequired);
            self.begin_disconnect(DisconnectReason::BondingFailed, transport);
            return;
        }
        if operation.origin == Origin::RecordAccess {
            let step = self.retrieval.on_write_failed("bonding failed");
            self.emit_retrieval(step.events);
        }
        self.pump(transport, now);
    }

    // ── Record access ────────────────────────────────────────────────────────

    fn on_retrieval(
        &mut self,
        command: RetrievalCommand,
        transport: &mut dyn Transport,
        now: Instant,
    ) -> Result<(), SessionError> {
        if !self.profile.supports_record_access() {
            return Err(SessionError::RecordAccessUnavailable(self.handle.id.clone()));
        }
        if self.state != ConnectionState::Ready {
            return Err(SessionError::NotReady {
                peripheral: self.handle.id.clone(),
                state: self.state,
            });
        }
        let step = match command {
            RetrievalCommand::All => self.retrieval.get_all(),
            RetrievalCommand::First => self.retrieval.get_first(),
            RetrievalCommand::Last => self.retrieval.get_last(),
            RetrievalCommand::Since => self.retrieval.get_since(&self.store),
            RetrievalCommand::Abort => self.retrieval.abort(),
            RetrievalCommand::DeleteAll => self.retrieval.delete_all(),
        }?;
        info!(peripheral = %self.handle.id, ?command, "Record access command");
        self.apply_step(step);
        self.pump(transport, now);
        Ok(())
    }

    fn apply_step(&mut self, step: Step) {
        if let Some(request) = step.request {
            debug!(peripheral = %self.handle.id, ?request, "Queueing RACP request");
            self.queue.enqueue(Operation::new(
                OperationKind::Write(request.encode()),
                gatt::RECORD_ACCESS_CONTROL_POINT,
                Origin::RecordAccess,
                &self.config,
            ));
        }
        self.emit_retrieval(step.events);
    }

    fn emit_retrieval(&self, events: Vec<RetrievalEvent>) {
        for event in events {
            self.emit(Event::Retrieval(event));
        }
    }

    // ── Value dispatch ───────────────────────────────────────────────────────

    fn dispatch(&mut self, characteristic: CharacteristicId, value: &[u8]) {
        let Some(handler) = self.handlers.get(&characteristic).copied() else {
            debug!(peripheral = %self.handle.id, %characteristic, "Value for unhandled characteristic");
            return;
        };
        debug!(peripheral = %self.handle.id, %characteristic, len = value.len(), "Value received");

        let result = match handler {
            Handler::Measurement(kind) => kind.decode(value).map(|m| self.on_measurement(m)),
            Handler::CgmMeasurement => {
                cgm::decode_records(value, self.cgm_crc).map(|records| self.on_cgm_records(records))
            }
            Handler::CgmFeature => cgm::decode_feature(value).map(|feature| {
                self.cgm_crc = feature.e2e_crc_supported();
                self.emit(Event::Measurement(Measurement::CgmFeature(feature)));
            }),
            Handler::CgmSessionStartTime => cgm::decode_session_start_time(value, self.cgm_crc)
                .map(|start| {
                    self.session_start = start.to_utc();
                    self.emit(Event::Measurement(Measurement::CgmSessionStartTime(start)));
                }),
            Handler::RecordAccess => RacpResponse::decode(value).map(|response| {
                let step = self.retrieval.on_response(response, &mut self.store);
                self.apply_step(step);
            }),
        };

        if let Err(e) = result {
            self.on_decode_error(characteristic, e);
        }
    }

    fn on_measurement(&mut self, measurement: Measurement) {
        let metrics = match &measurement {
            Measurement::CyclingSpeedCadence(csc) => self.csc.update(csc),
            Measurement::BatteryLevel(level) => {
                self.battery_level = Some(*level);
                None
            }
            _ => None,
        };
        self.emit(Event::Measurement(measurement));
        if let Some(metrics) = metrics {
            self.emit(Event::Measurement(Measurement::CyclingMetrics(metrics)));
        }
    }

    fn on_cgm_records(&mut self, measurements: Vec<cgm::CgmMeasurement>) {
        for measurement in measurements {
            let record = Record::new(measurement, self.session_start);
            let step = self.retrieval.on_record(record, &mut self.store);
            if step.events.is_empty() {
                self.emit(Event::Measurement(Measurement::Glucose(measurement)));
            } else {
                self.emit_retrieval(step.events);
            }
        }
    }

    fn on_decode_error(&self, characteristic: CharacteristicId, err: DecodeError) {
        warn!(peripheral = %self.handle.id, %characteristic, error = %err, "Dropping malformed value");
        self.emit_error(&err.into());
    }
}

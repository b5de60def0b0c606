//! # sensorlink-core
//!
//! Core logic for talking to Bluetooth Low Energy health sensors.
//!
//! This crate provides:
//! - Decoders and encoders for the standard health and fitness measurement formats
//! - A per-peripheral session state machine (connect, discover, validate, subscribe)
//! - A serialized GATT operation queue with timeouts, retries and bonding pauses
//! - Record Access Control Point retrieval of stored CGM records
//! - A registry that owns every session and drives it from transport events
//!
//! ## Architecture
//!
//! The crate is organized into the following modules:
//!
//! - [`codec`] - Measurement, feature and time codecs for each profile
//! - [`units`] - Display-unit conversions for decoded values
//! - [`gatt`] - Service, characteristic and descriptor UUIDs
//! - [`transport`] - The non-blocking transport interface and its events
//! - [`queue`] - One-at-a-time operation queue with retry and timeout handling
//! - [`racp`] - Record access wire format, record store and retrieval engine
//! - [`session`] - The per-peripheral state machine
//! - [`registry`] - The set of sessions and the loop that drives them
//! - [`simulated`] - In-process transport with scripted peripherals
//! - `bluetooth` - BlueZ transport (feature `bluetooth`)
//! - [`config`] - Configuration loading, saving, and validation
//! - [`error`] - Unified error types for the crate
//! - [`types`] - Shared identifiers, states and events

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![warn(missing_docs)]

#[cfg(feature = "bluetooth")]
pub mod bluetooth;
pub mod codec;
pub mod config;
pub mod error;
pub mod gatt;
pub mod queue;
pub mod racp;
pub mod registry;
pub mod session;
pub mod simulated;
pub mod transport;
pub mod types;
pub mod units;

// Re-export primary types for convenience
#[cfg(feature = "bluetooth")]
pub use bluetooth::BluerTransport;
pub use codec::{DecodeError, Measurement, MeasurementKind};
pub use config::{
    Config, ConfigError, ConfigResult, PeripheralConfig, ProfilesConfig, RegistryConfig,
    ServerConfig, SessionConfig,
};
pub use error::{Result, SensorlinkError};
pub use racp::{Phase, Record, RecordStore, RetrievalEvent};
pub use registry::{drive, SessionRegistry};
pub use session::{RetrievalCommand, Session, SessionError, SessionInput, SessionSnapshot};
pub use simulated::{SimulatedPeripheral, SimulatedTransport};
pub use transport::{
    transport_channel, OperationError, Transport, TransportError, TransportEvent,
    TransportEventReceiver, TransportEventSender,
};
pub use types::{
    event_channel, is_valid_mac_address, ConnectionState, DisconnectReason, Event,
    EventReceiver, EventSender, PeripheralHandle, PeripheralId, Profile, SessionEvent,
};

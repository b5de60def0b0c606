//! Shared identity, state and event types.
//!
//! Everything a collaborator outside the core sees flows through the types in
//! this module: the [`PeripheralHandle`] it hands in, and the [`SessionEvent`]s
//! it receives back on the event channel.

use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use utoipa::ToSchema;

use crate::codec::Measurement;
use crate::racp::RetrievalEvent;

static MAC_ADDRESS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([0-9A-Fa-f]{2}:){5}[0-9A-Fa-f]{2}$").expect("valid regex"));

/// Returns `true` if `address` looks like `AA:BB:CC:DD:EE:FF`.
#[must_use]
pub fn is_valid_mac_address(address: &str) -> bool {
    MAC_ADDRESS_RE.is_match(address)
}

/// Transport-level identity of a peripheral: its Bluetooth address,
/// normalised to upper case.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeripheralId(String);

impl PeripheralId {
    /// The address as `AA:BB:CC:DD:EE:FF`.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for PeripheralId {
    type Err = crate::error::SensorlinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if is_valid_mac_address(s) {
            Ok(Self(s.to_ascii_uppercase()))
        } else {
            Err(crate::error::SensorlinkError::InvalidAddress(s.to_string()))
        }
    }
}

impl TryFrom<String> for PeripheralId {
    type Error = crate::error::SensorlinkError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PeripheralId> for String {
    fn from(id: PeripheralId) -> Self {
        id.0
    }
}

impl fmt::Display for PeripheralId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a caller hands in to manage a peripheral.
///
/// Transport-specific connection objects are kept by the transport itself,
/// keyed by [`PeripheralId`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeripheralHandle {
    /// Bluetooth address.
    pub id: PeripheralId,
    /// Advertised name, if the caller knows it.
    pub name: Option<String>,
}

impl PeripheralHandle {
    /// Handle with no advertised name.
    #[must_use]
    pub const fn new(id: PeripheralId) -> Self {
        Self { id, name: None }
    }

    /// Attach the advertised name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Sensor profile a session speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Profile {
    /// Heart Rate Service (0x180D).
    HeartRate,
    /// Blood Pressure Service (0x1810).
    BloodPressure,
    /// Cycling Speed and Cadence Service (0x1816).
    CyclingSpeedCadence,
    /// Running Speed and Cadence Service (0x1814).
    RunningSpeedCadence,
    /// Health Thermometer Service (0x1809).
    HealthThermometer,
    /// Continuous Glucose Monitoring Service (0x181F).
    ContinuousGlucose,
}

impl Profile {
    /// Whether this profile carries the record access control point.
    #[must_use]
    pub const fn supports_record_access(self) -> bool {
        matches!(self, Self::ContinuousGlucose)
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HeartRate => write!(f, "Heart Rate"),
            Self::BloodPressure => write!(f, "Blood Pressure"),
            Self::CyclingSpeedCadence => write!(f, "Cycling Speed/Cadence"),
            Self::RunningSpeedCadence => write!(f, "Running Speed/Cadence"),
            Self::HealthThermometer => write!(f, "Health Thermometer"),
            Self::ContinuousGlucose => write!(f, "Continuous Glucose Monitoring"),
        }
    }
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Created, never connected.
    #[default]
    Idle,
    /// Waiting for the transport to connect.
    Connecting,
    /// Waiting for characteristic discovery.
    Discovering,
    /// Checking discovered characteristics against the profile.
    Validating,
    /// Running the setup sequence.
    Initializing,
    /// Setup finished; measurements and record access are live.
    Ready,
    /// Disconnect requested, waiting for the transport.
    Disconnecting,
    /// Link is down.
    Disconnected,
}

impl ConnectionState {
    /// `true` while the session holds (or is acquiring) a link.
    #[must_use]
    pub const fn is_live(self) -> bool {
        !matches!(self, Self::Idle | Self::Disconnected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Discovering => "discovering",
            Self::Validating => "validating",
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Disconnecting => "disconnecting",
            Self::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}

/// Why a session went down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    /// The caller asked for it.
    Requested,
    /// The peripheral lacks a required characteristic.
    UnsupportedDevice,
    /// A required setup step failed terminally.
    InitializationFailed,
    /// Bonding was refused or failed.
    BondingFailed,
    /// The transport reported a fatal error.
    TransportError,
    /// The link dropped without being asked to.
    LinkLoss,
}

/// Event emitted by a session.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A connection attempt started.
    Connecting,
    /// The transport connected; discovery follows.
    Connected,
    /// All required characteristics resolved.
    CapabilitiesValidated,
    /// A required characteristic is missing.
    NotSupported,
    /// Setup is complete.
    Ready,
    /// The session is down.
    Disconnected {
        /// Why.
        reason: DisconnectReason,
    },
    /// The link dropped while the session was ready.
    LinkLoss,
    /// An operation needs the peripheral to be bonded first.
    BondingRequired,
    /// Bonding completed; parked work resumes.
    Bonded,
    /// Bonding failed.
    BondingFailed,
    /// A non-fatal or fatal error surfaced to the caller.
    Error {
        /// Machine-readable code (see [`crate::error::SensorlinkError::error_code`]).
        code: String,
        /// Human-readable message.
        message: String,
    },
    /// A decoded notification or one-shot read.
    Measurement(Measurement),
    /// Record retrieval progress or outcome.
    Retrieval(RetrievalEvent),
}

/// An [`Event`] tagged with the peripheral it came from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionEvent {
    /// Source peripheral.
    pub peripheral: PeripheralId,
    /// What happened.
    pub event: Event,
}

/// Sending half of the event channel.
pub type EventSender = mpsc::UnboundedSender<SessionEvent>;

/// Receiving half of the event channel.
pub type EventReceiver = mpsc::UnboundedReceiver<SessionEvent>;

/// Create the event channel shared by a registry and its consumer.
#[must_use]
pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peripheral_id_normalises_case() {
        let id: PeripheralId = "aa:bb:cc:dd:ee:0f".parse().unwrap();
        assert_eq!(id.as_str(), "AA:BB:CC:DD:EE:0F");
    }

    #[test]
    fn test_peripheral_id_rejects_garbage() {
        assert!("not-an-address".parse::<PeripheralId>().is_err());
        assert!("AA:BB:CC:DD:EE".parse::<PeripheralId>().is_err());
        assert!("AA-BB-CC-DD-EE-FF".parse::<PeripheralId>().is_err());
    }

    #[test]
    fn test_peripheral_id_serde() {
        let id: PeripheralId = serde_json::from_str("\"01:02:03:04:05:06\"").unwrap();
        assert_eq!(id.to_string(), "01:02:03:04:05:06");
        assert!(serde_json::from_str::<PeripheralId>("\"nope\"").is_err());
    }

    #[test]
    fn test_connection_state_liveness() {
        assert!(!ConnectionState::Idle.is_live());
        assert!(!ConnectionState::Disconnected.is_live());
        assert!(ConnectionState::Connecting.is_live());
        assert!(ConnectionState::Ready.is_live());
        assert!(ConnectionState::Disconnecting.is_live());
    }

    #[test]
    fn test_only_cgm_supports_record_access() {
        assert!(Profile::ContinuousGlucose.supports_record_access());
        assert!(!Profile::HeartRate.supports_record_access());
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let json = serde_json::to_string(&Event::Disconnected {
            reason: DisconnectReason::LinkLoss,
        })
        .unwrap();
        assert!(json.contains("\"type\":\"disconnected\""));
        assert!(json.contains("\"reason\":\"link_loss\""));
    }
}

//! The downward seam between sessions and the radio.
//!
//! A [`Transport`] only *starts* work: every call returns as soon as the
//! request has been handed to the backend. Outcomes come back later as
//! [`TransportEvent`]s on an unbounded channel, in whatever order the backend
//! produces them. Operation outcomes carry the [`OperationToken`] that was
//! passed in, which lets the operation queue drop stale results.

use std::fmt;

use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::gatt::CharacteristicId;
use crate::types::PeripheralId;

/// GATT status codes that are worth retrying.
const TRANSIENT_GATT_STATUSES: [u8; 3] = [
    0x0E, // Unlikely Error
    0x11, // Insufficient Resources
    0x85, // Generic stack error reported by several controllers
];

/// Insufficient Authentication.
pub const GATT_INSUFFICIENT_AUTHENTICATION: u8 = 0x05;
/// Insufficient Encryption.
pub const GATT_INSUFFICIENT_ENCRYPTION: u8 = 0x0F;

/// Identifies one issued attempt of an operation.
///
/// Each retry of the same operation gets a fresh token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationToken(pub u64);

impl fmt::Display for OperationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op#{}", self.0)
    }
}

/// A transport failed to start a request, or is unusable.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// No adapter, or the adapter is powered off.
    #[error("Bluetooth adapter is unavailable")]
    AdapterUnavailable,

    /// The transport has never heard of this peripheral.
    #[error("Unknown peripheral {0}")]
    UnknownPeripheral(PeripheralId),

    /// The request needs a live link.
    #[error("Peripheral {0} is not connected")]
    NotConnected(PeripheralId),

    /// The backend reported an error.
    #[error("{0}")]
    Backend(String),
}

/// Outcome of a single read/write attempt that did not succeed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OperationError {
    /// No result arrived before the per-operation timeout.
    #[error("operation timed out")]
    Timeout,

    /// The peripheral answered with an ATT error status.
    #[error("GATT error status {status:#04x}")]
    Gatt {
        /// ATT status code.
        status: u8,
    },

    /// The peripheral must be bonded first.
    #[error("insufficient authentication")]
    InsufficientAuthentication,

    /// The operation was dropped because the session went down.
    #[error("operation cancelled")]
    Cancelled,

    /// The backend failed the operation.
    #[error("transport failure: {0}")]
    Transport(String),
}

impl OperationError {
    /// Timeouts and transient GATT statuses.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Timeout => true,
            Self::Gatt { status } => TRANSIENT_GATT_STATUSES.contains(status),
            _ => false,
        }
    }

    /// Failures the bonding interrupt handles.
    #[must_use]
    pub const fn is_authentication(&self) -> bool {
        matches!(
            self,
            Self::InsufficientAuthentication
                | Self::Gatt {
                    status: GATT_INSUFFICIENT_AUTHENTICATION | GATT_INSUFFICIENT_ENCRYPTION
                }
        )
    }
}

/// Value returned by a successful operation: the read value, if any.
pub type OperationOutcome = Result<Option<Vec<u8>>, OperationError>;

/// Something the transport reports back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The link is up.
    Connected {
        /// Peripheral.
        peripheral: PeripheralId,
    },
    /// The connection attempt failed.
    ConnectFailed {
        /// Peripheral.
        peripheral: PeripheralId,
        /// Backend message.
        reason: String,
    },
    /// The link is down, whether requested or not.
    Disconnected {
        /// Peripheral.
        peripheral: PeripheralId,
    },
    /// Characteristic discovery finished.
    ServicesDiscovered {
        /// Peripheral.
        peripheral: PeripheralId,
        /// Every characteristic found, across all services.
        characteristics: Vec<CharacteristicId>,
    },
    /// Characteristic discovery failed.
    DiscoveryFailed {
        /// Peripheral.
        peripheral: PeripheralId,
        /// Backend message.
        reason: String,
    },
    /// A notification or indication arrived.
    ValueChanged {
        /// Peripheral.
        peripheral: PeripheralId,
        /// Source characteristic.
        characteristic: CharacteristicId,
        /// Raw payload.
        value: Vec<u8>,
    },
    /// An operation started with `token` finished.
    OperationResult {
        /// Peripheral.
        peripheral: PeripheralId,
        /// Token passed when the operation was started.
        token: OperationToken,
        /// Read value or failure.
        result: OperationOutcome,
    },
    /// The bond with a peripheral was created or removed.
    BondStateChanged {
        /// Peripheral.
        peripheral: PeripheralId,
        /// Whether the peripheral is now bonded.
        bonded: bool,
    },
    /// The adapter was powered on or off.
    RadioStateChanged {
        /// Whether the radio can be used.
        available: bool,
    },
}

impl TransportEvent {
    /// Peripheral the event is about; `None` for adapter-wide events.
    #[must_use]
    pub const fn peripheral(&self) -> Option<&PeripheralId> {
        match self {
            Self::Connected { peripheral }
            | Self::ConnectFailed { peripheral, .. }
            | Self::Disconnected { peripheral }
            | Self::ServicesDiscovered { peripheral, .. }
            | Self::DiscoveryFailed { peripheral, .. }
            | Self::ValueChanged { peripheral, .. }
            | Self::OperationResult { peripheral, .. }
            | Self::BondStateChanged { peripheral, .. } => Some(peripheral),
            Self::RadioStateChanged { .. } => None,
        }
    }
}

/// Sending half of the transport event channel.
pub type TransportEventSender = mpsc::UnboundedSender<TransportEvent>;

/// Receiving half of the transport event channel.
pub type TransportEventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// Create the channel a transport reports on.
#[must_use]
pub fn transport_channel() -> (TransportEventSender, TransportEventReceiver) {
    mpsc::unbounded_channel()
}

/// Non-blocking GATT client.
///
/// Implementations must never block; they report every outcome as a
/// [`TransportEvent`]. An `Err` return means the request was not started at
/// all and no event will follow.
pub trait Transport: Send {
    /// Start connecting.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] if the request could not be started.
    fn connect(&mut self, peripheral: &PeripheralId) -> Result<(), TransportError>;

    /// Start disconnecting.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] if the request could not be started.
    fn disconnect(&mut self, peripheral: &PeripheralId) -> Result<(), TransportError>;

    /// Start characteristic discovery.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] if the request could not be started.
    fn discover_characteristics(&mut self, peripheral: &PeripheralId)
        -> Result<(), TransportError>;

    /// Start a characteristic read.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] if the request could not be started.
    fn read_characteristic(
        &mut self,
        peripheral: &PeripheralId,
        characteristic: CharacteristicId,
        token: OperationToken,
    ) -> Result<(), TransportError>;

    /// Start a characteristic write (with response).
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] if the request could not be started.
    fn write_characteristic(
        &mut self,
        peripheral: &PeripheralId,
        characteristic: CharacteristicId,
        value: &[u8],
        token: OperationToken,
    ) -> Result<(), TransportError>;

    /// Start a descriptor write.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] if the request could not be started.
    fn write_descriptor(
        &mut self,
        peripheral: &PeripheralId,
        characteristic: CharacteristicId,
        descriptor: Uuid,
        value: &[u8],
        token: OperationToken,
    ) -> Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retriable_classification() {
        assert!(OperationError::Timeout.is_retriable());
        assert!(OperationError::Gatt { status: 0x0E }.is_retriable());
        assert!(!OperationError::Gatt { status: 0x03 }.is_retriable());
        assert!(!OperationError::Cancelled.is_retriable());
        assert!(!OperationError::InsufficientAuthentication.is_retriable());
    }

    #[test]
    fn test_authentication_classification() {
        assert!(OperationError::InsufficientAuthentication.is_authentication());
        assert!(OperationError::Gatt { status: 0x05 }.is_authentication());
        assert!(OperationError::Gatt { status: 0x0F }.is_authentication());
        assert!(!OperationError::Timeout.is_authentication());
    }

    #[test]
    fn test_event_peripheral() {
        let id: PeripheralId = "AA:BB:CC:DD:EE:FF".parse().unwrap();
        let event = TransportEvent::Connected {
            peripheral: id.clone(),
        };
        assert_eq!(event.peripheral(), Some(&id));
        assert_eq!(
            TransportEvent::RadioStateChanged { available: true }.peripheral(),
            None
        );
    }
}

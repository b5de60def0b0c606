//! In-process transport backed by simulated peripherals.
//!
//! Every request is answered immediately through the transport event channel,
//! in the order a real stack would: the operation result first, then any
//! indications it triggers. The record access control point is simulated in
//! full over a list of stored CGM records.
//!
//! [`SimulatedTransport`] is cheap to clone; clones share the same
//! peripherals, so a test or the server can keep a handle to push
//! notifications, bond peripherals or toggle the radio while the registry
//! owns another.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;
use uuid::Uuid;

use crate::codec::cgm::{self, CgmFeature, CgmFeatures, CgmMeasurement, SessionStartTime};
use crate::codec::GattDateTime;
use crate::gatt::{self, CharacteristicId};
use crate::racp::{OpCode, Operand, Operator, RacpRequest, RacpResponse, ResultCode};
use crate::transport::{
    OperationError, OperationOutcome, OperationToken, Transport, TransportError, TransportEvent,
    TransportEventSender,
};
use crate::types::{PeripheralId, Profile};

/// ATT "Attribute Not Found".
const ATT_ATTRIBUTE_NOT_FOUND: u8 = 0x0A;
/// ATT "Read Not Permitted".
const ATT_READ_NOT_PERMITTED: u8 = 0x02;

/// Description of one simulated peripheral.
#[derive(Debug, Clone, Default)]
pub struct SimulatedPeripheral {
    characteristics: Vec<CharacteristicId>,
    values: HashMap<CharacteristicId, Vec<u8>>,
    requires_authentication: bool,
    unresponsive: bool,
    records: Vec<CgmMeasurement>,
    crc: bool,
}

impl SimulatedPeripheral {
    /// Peripheral exposing exactly `characteristics`.
    #[must_use]
    pub fn new(characteristics: &[CharacteristicId]) -> Self {
        Self {
            characteristics: characteristics.to_vec(),
            ..Self::default()
        }
    }

    /// Peripheral exposing every characteristic `profile` uses, with
    /// plausible values for the readable ones.
    #[must_use]
    pub fn for_profile(profile: Profile) -> Self {
        let characteristics: &[CharacteristicId] = match profile {
            Profile::HeartRate => &[gatt::HEART_RATE_MEASUREMENT, gatt::BODY_SENSOR_LOCATION],
            Profile::BloodPressure => &[
                gatt::BLOOD_PRESSURE_MEASUREMENT,
                gatt::INTERMEDIATE_CUFF_PRESSURE,
            ],
            Profile::CyclingSpeedCadence => &[gatt::CSC_MEASUREMENT],
            Profile::RunningSpeedCadence => &[gatt::RSC_MEASUREMENT],
            Profile::HealthThermometer => &[
                gatt::TEMPERATURE_MEASUREMENT,
                gatt::INTERMEDIATE_TEMPERATURE,
            ],
            Profile::ContinuousGlucose => &[
                gatt::CGM_MEASUREMENT,
                gatt::RECORD_ACCESS_CONTROL_POINT,
                gatt::CGM_FEATURE,
                gatt::CGM_SESSION_START_TIME,
            ],
        };
        let mut peripheral = Self::new(characteristics)
            .with_characteristic(gatt::BATTERY_LEVEL)
            .with_value(gatt::BATTERY_LEVEL, vec![100]);
        if profile == Profile::HeartRate {
            // Chest strap.
            peripheral = peripheral.with_value(gatt::BODY_SENSOR_LOCATION, vec![1]);
        }
        if profile == Profile::ContinuousGlucose {
            peripheral.refresh_cgm_values();
        }
        peripheral
    }

    /// Add a characteristic.
    #[must_use]
    pub fn with_characteristic(mut self, characteristic: CharacteristicId) -> Self {
        if !self.characteristics.contains(&characteristic) {
            self.characteristics.push(characteristic);
        }
        self
    }

    /// Value returned by reads of `characteristic`.
    #[must_use]
    pub fn with_value(mut self, characteristic: CharacteristicId, value: Vec<u8>) -> Self {
        self.values.insert(characteristic, value);
        self
    }

    /// Reject reads and writes with insufficient authentication until bonded.
    #[must_use]
    pub const fn requiring_authentication(mut self) -> Self {
        self.requires_authentication = true;
        self
    }

    /// Accept requests but never answer them.
    #[must_use]
    pub const fn unresponsive(mut self) -> Self {
        self.unresponsive = true;
        self
    }

    /// Records held for the record access control point.
    #[must_use]
    pub fn with_records(mut self, records: Vec<CgmMeasurement>) -> Self {
        self.records = records;
        self
    }

    /// Announce and use the CGM E2E-CRC.
    #[must_use]
    pub fn with_crc(mut self, crc: bool) -> Self {
        self.crc = crc;
        self.refresh_cgm_values();
        self
    }

    fn refresh_cgm_values(&mut self) {
        let features = if self.crc {
            CgmFeatures::E2E_CRC.bits()
        } else {
            0
        };
        let feature = CgmFeature {
            features,
            sample_type: 0x01,
            sample_location: 0x05,
        };
        let start = SessionStartTime {
            start: GattDateTime {
                year: 2024,
                month: 1,
                day: 1,
                hours: 8,
                minutes: 0,
                seconds: 0,
            },
            time_zone: 0,
            dst_offset: 0,
        };
        self.values
            .insert(gatt::CGM_FEATURE, cgm::encode_feature(&feature));
        self.values.insert(
            gatt::CGM_SESSION_START_TIME,
            cgm::encode_session_start_time(&start, self.crc),
        );
    }

    fn select(&self, operator: Operator, operand: Option<Operand>) -> Vec<usize> {
        let mut indices: Vec<usize> = (0..self.records.len()).collect();
        indices.sort_by_key(|&i| self.records[i].time_offset);
        let offset = |i: &usize| self.records[*i].time_offset;
        match (operator, operand) {
            (Operator::All, _) => indices,
            (Operator::LessOrEqual, Some(Operand::Single(n))) => {
                indices.into_iter().filter(|i| offset(i) <= n).collect()
            }
            (Operator::GreaterOrEqual, Some(Operand::Single(n))) => {
                indices.into_iter().filter(|i| offset(i) >= n).collect()
            }
            (Operator::WithinRange, Some(Operand::Range(from, to))) => indices
                .into_iter()
                .filter(|i| (from..=to).contains(&offset(i)))
                .collect(),
            (Operator::First, _) => indices.into_iter().take(1).collect(),
            (Operator::Last, _) => indices.into_iter().last().into_iter().collect(),
            _ => Vec::new(),
        }
    }
}

#[derive(Debug)]
struct Device {
    peripheral: SimulatedPeripheral,
    connected: bool,
    bonded: bool,
    subscribed: HashSet<CharacteristicId>,
}

#[derive(Debug)]
struct State {
    events: TransportEventSender,
    devices: HashMap<PeripheralId, Device>,
    radio_available: bool,
}

impl State {
    fn send(&self, event: TransportEvent) {
        // A closed channel means the registry is gone.
        let _ = self.events.send(event);
    }

    fn connected_device(&mut self, id: &PeripheralId) -> Result<&mut Device, TransportError> {
        if !self.radio_available {
            return Err(TransportError::AdapterUnavailable);
        }
        let device = self
            .devices
            .get_mut(id)
            .ok_or_else(|| TransportError::UnknownPeripheral(id.clone()))?;
        if device.connected {
            Ok(device)
        } else {
            Err(TransportError::NotConnected(id.clone()))
        }
    }
}

/// Transport over in-process simulated peripherals.
#[derive(Debug, Clone)]
pub struct SimulatedTransport {
    state: Arc<Mutex<State>>,
}

impl SimulatedTransport {
    /// Transport reporting on `events`, with the radio on and no peripherals.
    #[must_use]
    pub fn new(events: TransportEventSender) -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                events,
                devices: HashMap::new(),
                radio_available: true,
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add or replace a peripheral.
    pub fn add_peripheral(&self, id: PeripheralId, peripheral: SimulatedPeripheral) {
        self.state().devices.insert(
            id,
            Device {
                peripheral,
                connected: false,
                bonded: false,
                subscribed: HashSet::new(),
            },
        );
    }

    /// Whether a peripheral with this id exists.
    #[must_use]
    pub fn has_peripheral(&self, id: &PeripheralId) -> bool {
        self.state().devices.contains_key(id)
    }

    /// Remove a peripheral; its link drops if it was connected.
    pub fn remove_peripheral(&self, id: &PeripheralId) {
        let mut state = self.state();
        if let Some(device) = state.devices.remove(id) {
            if device.connected {
                state.send(TransportEvent::Disconnected {
                    peripheral: id.clone(),
                });
            }
        }
    }

    /// Power the radio on or off. Powering off drops every link.
    pub fn set_radio(&self, available: bool) {
        let mut state = self.state();
        state.radio_available = available;
        if !available {
            let dropped: Vec<PeripheralId> = state
                .devices
                .iter_mut()
                .filter(|(_, d)| d.connected)
                .map(|(id, d)| {
                    d.connected = false;
                    d.subscribed.clear();
                    id.clone()
                })
                .collect();
            for peripheral in dropped {
                state.send(TransportEvent::Disconnected { peripheral });
            }
        }
        state.send(TransportEvent::RadioStateChanged { available });
    }

    /// Send a notification or indication if the peripheral is connected and
    /// the characteristic is subscribed. Returns whether it was sent.
    pub fn notify(&self, id: &PeripheralId, characteristic: CharacteristicId, value: Vec<u8>) -> bool {
        let state = self.state();
        let subscribed = state
            .devices
            .get(id)
            .is_some_and(|d| d.connected && d.subscribed.contains(&characteristic));
        if subscribed {
            state.send(TransportEvent::ValueChanged {
                peripheral: id.clone(),
                characteristic,
                value,
            });
        }
        subscribed
    }

    /// Complete bonding with a peripheral.
    pub fn bond(&self, id: &PeripheralId) {
        let mut state = self.state();
        if let Some(device) = state.devices.get_mut(id) {
            device.bonded = true;
            state.send(TransportEvent::BondStateChanged {
                peripheral: id.clone(),
                bonded: true,
            });
        }
    }

    /// Drop the link as if the peripheral went out of range.
    pub fn drop_link(&self, id: &PeripheralId) {
        let mut state = self.state();
        if let Some(device) = state.devices.get_mut(id) {
            if device.connected {
                device.connected = false;
                device.subscribed.clear();
                state.send(TransportEvent::Disconnected {
                    peripheral: id.clone(),
                });
            }
        }
    }

    /// Store another record on a CGM peripheral.
    pub fn push_record(&self, id: &PeripheralId, record: CgmMeasurement) {
        if let Some(device) = self.state().devices.get_mut(id) {
            device.peripheral.records.push(record);
        }
    }

    /// Number of records a peripheral still holds.
    #[must_use]
    pub fn record_count(&self, id: &PeripheralId) -> usize {
        self.state()
            .devices
            .get(id)
            .map_or(0, |d| d.peripheral.records.len())
    }

    /// Answer an operation unless the peripheral is unresponsive.
    fn answer(
        state: &State,
        id: &PeripheralId,
        unresponsive: bool,
        token: OperationToken,
        result: OperationOutcome,
    ) {
        if unresponsive {
            debug!(peripheral = %id, %token, "Simulated peripheral ignoring request");
            return;
        }
        state.send(TransportEvent::OperationResult {
            peripheral: id.clone(),
            token,
            result,
        });
    }

    /// Run a record access request against the device's records.
    fn record_access(state: &mut State, id: &PeripheralId, value: &[u8]) {
        let Some(device) = state.devices.get_mut(id) else {
            return;
        };
        let request_opcode = value.first().copied().unwrap_or(0);
        let respond = |result| RacpResponse::ResponseCode {
            request_opcode,
            result,
        };

        let mut indications = Vec::new();
        let response = match RacpRequest::decode(value) {
            Err(_) if OpCode::from_code(request_opcode).is_none() => {
                respond(ResultCode::OpCodeNotSupported)
            }
            Err(_) => respond(ResultCode::InvalidOperator),
            Ok(request) => match request.opcode {
                OpCode::ReportNumberOfRecords => {
                    let count = device
                        .peripheral
                        .select(request.operator, request.operand)
                        .len();
                    RacpResponse::NumberOfRecords(u16::try_from(count).unwrap_or(u16::MAX))
                }
                OpCode::ReportStoredRecords => {
                    let selected = device.peripheral.select(request.operator, request.operand);
                    if selected.is_empty() {
                        respond(ResultCode::NoRecordsFound)
                    } else {
                        for i in selected {
                            let record = &device.peripheral.records[i];
                            indications.push(cgm::encode_record(record, device.peripheral.crc));
                        }
                        respond(ResultCode::Success)
                    }
                }
                OpCode::DeleteStoredRecords => {
                    let selected: HashSet<usize> = device
                        .peripheral
                        .select(request.operator, request.operand)
                        .into_iter()
                        .collect();
                    let mut index = 0;
                    device.peripheral.records.retain(|_| {
                        let keep = !selected.contains(&index);
                        index += 1;
                        keep
                    });
                    respond(ResultCode::Success)
                }
                OpCode::AbortOperation => respond(ResultCode::Success),
                OpCode::NumberOfRecordsResponse | OpCode::ResponseCode => {
                    respond(ResultCode::OpCodeNotSupported)
                }
            },
        };

        let cgm_subscribed = device.subscribed.contains(&gatt::CGM_MEASUREMENT);
        let racp_subscribed = device.subscribed.contains(&gatt::RECORD_ACCESS_CONTROL_POINT);
        if cgm_subscribed {
            for value in indications {
                state.send(TransportEvent::ValueChanged {
                    peripheral: id.clone(),
                    characteristic: gatt::CGM_MEASUREMENT,
                    value,
                });
            }
        }
        if racp_subscribed {
            state.send(TransportEvent::ValueChanged {
                peripheral: id.clone(),
                characteristic: gatt::RECORD_ACCESS_CONTROL_POINT,
                value: response.encode(),
            });
        }
    }
}

/// Shared checks for reads and writes; `Err` is the operation's outcome.
fn access_check(device: &Device, characteristic: CharacteristicId) -> Result<(), OperationError> {
    if !device.peripheral.characteristics.contains(&characteristic) {
        return Err(OperationError::Gatt {
            status: ATT_ATTRIBUTE_NOT_FOUND,
        });
    }
    if device.peripheral.requires_authentication && !device.bonded {
        return Err(OperationError::InsufficientAuthentication);
    }
    Ok(())
}

impl Transport for SimulatedTransport {
    fn connect(&mut self, peripheral: &PeripheralId) -> Result<(), TransportError> {
        let mut state = self.state();
        if !state.radio_available {
            return Err(TransportError::AdapterUnavailable);
        }
        let event = match state.devices.get_mut(peripheral) {
            Some(device) => {
                device.connected = true;
                TransportEvent::Connected {
                    peripheral: peripheral.clone(),
                }
            }
            None => TransportEvent::ConnectFailed {
                peripheral: peripheral.clone(),
                reason: "peripheral not in range".to_string(),
            },
        };
        state.send(event);
        Ok(())
    }

    fn disconnect(&mut self, peripheral: &PeripheralId) -> Result<(), TransportError> {
        let mut state = self.state();
        let device = state
            .devices
            .get_mut(peripheral)
            .ok_or_else(|| TransportError::UnknownPeripheral(peripheral.clone()))?;
        device.connected = false;
        device.subscribed.clear();
        state.send(TransportEvent::Disconnected {
            peripheral: peripheral.clone(),
        });
        Ok(())
    }

    fn discover_characteristics(&mut self, peripheral: &PeripheralId) -> Result<(), TransportError> {
        let mut state = self.state();
        let characteristics = state
            .connected_device(peripheral)?
            .peripheral
            .characteristics
            .clone();
        state.send(TransportEvent::ServicesDiscovered {
            peripheral: peripheral.clone(),
            characteristics,
        });
        Ok(())
    }

    fn read_characteristic(
        &mut self,
        peripheral: &PeripheralId,
        characteristic: CharacteristicId,
        token: OperationToken,
    ) -> Result<(), TransportError> {
        let mut state = self.state();
        let device = state.connected_device(peripheral)?;
        let unresponsive = device.peripheral.unresponsive;
        let result = access_check(device, characteristic).and_then(|()| {
            device
                .peripheral
                .values
                .get(&characteristic)
                .cloned()
                .map(Some)
                .ok_or(OperationError::Gatt {
                    status: ATT_READ_NOT_PERMITTED,
                })
        });
        Self::answer(&state, peripheral, unresponsive, token, result);
        Ok(())
    }

    fn write_characteristic(
        &mut self,
        peripheral: &PeripheralId,
        characteristic: CharacteristicId,
        value: &[u8],
        token: OperationToken,
    ) -> Result<(), TransportError> {
        let mut state = self.state();
        let device = state.connected_device(peripheral)?;
        let unresponsive = device.peripheral.unresponsive;
        let result = access_check(device, characteristic);
        let accepted = result.is_ok();
        if accepted && characteristic != gatt::RECORD_ACCESS_CONTROL_POINT {
            device.peripheral.values.insert(characteristic, value.to_vec());
        }
        Self::answer(&state, peripheral, unresponsive, token, result.map(|()| None));
        if accepted && !unresponsive && characteristic == gatt::RECORD_ACCESS_CONTROL_POINT {
            Self::record_access(&mut state, peripheral, value);
        }
        Ok(())
    }

    fn write_descriptor(
        &mut self,
        peripheral: &PeripheralId,
        characteristic: CharacteristicId,
        descriptor: Uuid,
        value: &[u8],
        token: OperationToken,
    ) -> Result<(), TransportError> {
        let mut state = self.state();
        let device = state.connected_device(peripheral)?;
        let unresponsive = device.peripheral.unresponsive;
        let result = access_check(device, characteristic);
        if result.is_ok() && descriptor == gatt::CLIENT_CHARACTERISTIC_CONFIGURATION {
            if value.first().is_some_and(|v| v & 0x03 != 0) {
                device.subscribed.insert(characteristic);
            } else {
                device.subscribed.remove(&characteristic);
            }
        }
        Self::answer(&state, peripheral, unresponsive, token, result.map(|()| None));
        Ok(())
    }
}

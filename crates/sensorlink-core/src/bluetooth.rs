//! [`Transport`] backed by BlueZ through `bluer`.
//!
//! Every request is started on the tokio runtime the transport was created
//! on and reports back through the [`TransportEventSender`]. BlueZ owns the
//! client characteristic configuration descriptor, so enabling
//! notifications or indications opens a notify stream whose values are
//! forwarded as [`TransportEvent::ValueChanged`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bluer::gatt::remote::Characteristic;
use bluer::{
    Adapter, AdapterEvent, AdapterProperty, Address, Device, DeviceEvent, DeviceProperty,
    ErrorKind, Session,
};
use futures::StreamExt;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::gatt::{self, CharacteristicId};
use crate::transport::{
    OperationError, OperationOutcome, OperationToken, Transport, TransportError, TransportEvent,
    TransportEventSender,
};
use crate::types::PeripheralId;

/// ATT "Attribute Not Found".
const ATT_ATTRIBUTE_NOT_FOUND: u8 = 0x0A;
/// How often to check whether BlueZ has resolved the GATT database.
const SERVICES_RESOLVED_POLL: Duration = Duration::from_millis(250);
/// Give up on discovery after this many polls.
const SERVICES_RESOLVED_ATTEMPTS: u32 = 120;

/// State for one peripheral with a link.
struct Link {
    device: Device,
    characteristics: HashMap<CharacteristicId, Characteristic>,
    subscriptions: HashMap<CharacteristicId, JoinHandle<()>>,
    watcher: JoinHandle<()>,
}

impl Link {
    fn abort(self) {
        self.watcher.abort();
        for task in self.subscriptions.into_values() {
            task.abort();
        }
    }
}

/// BlueZ transport for the default adapter.
pub struct BluerTransport {
    _session: Session,
    adapter: Adapter,
    runtime: Handle,
    events: TransportEventSender,
    links: Arc<Mutex<HashMap<PeripheralId, Link>>>,
    radio_watch: JoinHandle<()>,
}

impl std::fmt::Debug for BluerTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BluerTransport")
            .field("adapter", &self.adapter.name())
            .finish_non_exhaustive()
    }
}

impl Drop for BluerTransport {
    fn drop(&mut self) {
        self.radio_watch.abort();
        for (_, link) in self.links().drain() {
            link.abort();
        }
    }
}

fn backend(err: &bluer::Error) -> TransportError {
    TransportError::Backend(err.to_string())
}

fn operation_error(err: &bluer::Error) -> OperationError {
    match err.kind {
        ErrorKind::NotAuthorized | ErrorKind::AuthenticationFailed => {
            OperationError::InsufficientAuthentication
        }
        _ => OperationError::Transport(err.to_string()),
    }
}

fn address(peripheral: &PeripheralId) -> Result<Address, TransportError> {
    peripheral
        .to_string()
        .parse()
        .map_err(|_| TransportError::UnknownPeripheral(peripheral.clone()))
}

impl BluerTransport {
    /// Open a BlueZ session on the default adapter.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// [`TransportError::AdapterUnavailable`] when there is no adapter, or
    /// [`TransportError::Backend`] when BlueZ cannot be reached.
    pub async fn new(events: TransportEventSender) -> Result<Self, TransportError> {
        let session = Session::new().await.map_err(|e| backend(&e))?;
        let adapter = session
            .default_adapter()
            .await
            .map_err(|_| TransportError::AdapterUnavailable)?;
        info!("Using Bluetooth adapter {}", adapter.name());

        let adapter_events = adapter.events().await.map_err(|e| backend(&e))?;
        let radio_events = events.clone();
        let radio_watch = tokio::spawn(async move {
            let mut adapter_events = Box::pin(adapter_events);
            while let Some(event) = adapter_events.next().await {
                if let AdapterEvent::PropertyChanged(AdapterProperty::Powered(powered)) = event {
                    info!(powered, "Adapter power changed");
                    let _ = radio_events.send(TransportEvent::RadioStateChanged {
                        available: powered,
                    });
                }
            }
        });

        Ok(Self {
            _session: session,
            adapter,
            runtime: Handle::current(),
            events,
            links: Arc::new(Mutex::new(HashMap::new())),
            radio_watch,
        })
    }

    /// Whether the adapter is powered.
    ///
    /// # Errors
    ///
    /// [`TransportError::Backend`] when BlueZ cannot be queried.
    pub async fn is_powered(&self) -> Result<bool, TransportError> {
        self.adapter.is_powered().await.map_err(|e| backend(&e))
    }

    fn links(&self) -> MutexGuard<'_, HashMap<PeripheralId, Link>> {
        self.links.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn device(&self, peripheral: &PeripheralId) -> Result<Device, TransportError> {
        self.links()
            .get(peripheral)
            .map(|l| l.device.clone())
            .ok_or_else(|| TransportError::NotConnected(peripheral.clone()))
    }

    /// Device and characteristic handle, or the outcome to report when the
    /// characteristic is unknown.
    fn characteristic(
        &self,
        peripheral: &PeripheralId,
        characteristic: CharacteristicId,
    ) -> Result<(Device, Option<Characteristic>), TransportError> {
        let links = self.links();
        let link = links
            .get(peripheral)
            .ok_or_else(|| TransportError::NotConnected(peripheral.clone()))?;
        Ok((
            link.device.clone(),
            link.characteristics.get(&characteristic).cloned(),
        ))
    }

    fn report(&self, peripheral: &PeripheralId, token: OperationToken, result: OperationOutcome) {
        let _ = self.events.send(TransportEvent::OperationResult {
            peripheral: peripheral.clone(),
            token,
            result,
        });
    }

    /// Run `operation` and report its outcome, asking BlueZ to pair when the
    /// peripheral wants authentication.
    fn spawn_operation<F>(&self, peripheral: &PeripheralId, device: Device, token: OperationToken, operation: F)
    where
        F: std::future::Future<Output = Result<Option<Vec<u8>>, bluer::Error>> + Send + 'static,
    {
        let events = self.events.clone();
        let peripheral = peripheral.clone();
        self.runtime.spawn(async move {
            let result = operation.await.map_err(|e| operation_error(&e));
            let needs_pairing = matches!(result, Err(ref e) if e.is_authentication());
            let _ = events.send(TransportEvent::OperationResult {
                peripheral: peripheral.clone(),
                token,
                result,
            });
            if needs_pairing {
                pair(&peripheral, &device).await;
            }
        });
    }

    fn subscribe(
        &self,
        peripheral: &PeripheralId,
        id: CharacteristicId,
        characteristic: Characteristic,
        token: OperationToken,
    ) {
        let events = self.events.clone();
        let peripheral_id = peripheral.clone();
        let task = self.runtime.spawn(async move {
            let stream = match characteristic.notify().await {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = events.send(TransportEvent::OperationResult {
                        peripheral: peripheral_id,
                        token,
                        result: Err(operation_error(&e)),
                    });
                    return;
                }
            };
            let _ = events.send(TransportEvent::OperationResult {
                peripheral: peripheral_id.clone(),
                token,
                result: Ok(None),
            });
            let mut stream = Box::pin(stream);
            while let Some(value) = stream.next().await {
                let _ = events.send(TransportEvent::ValueChanged {
                    peripheral: peripheral_id.clone(),
                    characteristic: id,
                    value,
                });
            }
            debug!(peripheral = %peripheral_id, characteristic = %id, "Notification stream ended");
        });
        if let Some(link) = self.links().get_mut(peripheral) {
            if let Some(previous) = link.subscriptions.insert(id, task) {
                previous.abort();
            }
        }
    }

    fn unsubscribe(&self, peripheral: &PeripheralId, id: CharacteristicId) {
        if let Some(task) = self
            .links()
            .get_mut(peripheral)
            .and_then(|l| l.subscriptions.remove(&id))
        {
            task.abort();
        }
    }
}

async fn pair(peripheral: &PeripheralId, device: &Device) {
    if device.is_paired().await.unwrap_or(false) {
        return;
    }
    info!(peripheral = %peripheral, "Peripheral requires authentication, pairing");
    if let Err(e) = device.pair().await {
        warn!(peripheral = %peripheral, error = %e, "Pairing failed");
    }
}

/// Forward link and bond changes until the device goes away.
async fn watch_device(peripheral: PeripheralId, device: Device, events: TransportEventSender) {
    let stream = match device.events().await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(peripheral = %peripheral, error = %e, "Cannot watch device events");
            return;
        }
    };
    let mut stream = Box::pin(stream);
    while let Some(event) = stream.next().await {
        let DeviceEvent::PropertyChanged(property) = event else {
            continue;
        };
        let event = match property {
            DeviceProperty::Connected(false) => TransportEvent::Disconnected {
                peripheral: peripheral.clone(),
            },
            DeviceProperty::Paired(bonded) => TransportEvent::BondStateChanged {
                peripheral: peripheral.clone(),
                bonded,
            },
            _ => continue,
        };
        let _ = events.send(event);
    }
}

async fn discover(device: &Device) -> Result<HashMap<CharacteristicId, Characteristic>, bluer::Error> {
    let mut attempts = 0;
    while !device.is_services_resolved().await? {
        attempts += 1;
        if attempts >= SERVICES_RESOLVED_ATTEMPTS {
            return Err(bluer::Error {
                kind: ErrorKind::Failed,
                message: "timed out waiting for services".to_string(),
            });
        }
        tokio::time::sleep(SERVICES_RESOLVED_POLL).await;
    }

    let mut found = HashMap::new();
    for service in device.services().await? {
        for characteristic in service.characteristics().await? {
            let uuid = characteristic.uuid().await?;
            found.insert(CharacteristicId(uuid), characteristic);
        }
    }
    Ok(found)
}

async fn write_descriptor(
    characteristic: &Characteristic,
    descriptor: Uuid,
    value: &[u8],
) -> Result<Option<Vec<u8>>, bluer::Error> {
    for candidate in characteristic.descriptors().await? {
        if candidate.uuid().await? == descriptor {
            candidate.write(value).await?;
            return Ok(None);
        }
    }
    Err(bluer::Error {
        kind: ErrorKind::NotFound,
        message: format!("descriptor {descriptor} not found"),
    })
}

impl Transport for BluerTransport {
    fn connect(&mut self, peripheral: &PeripheralId) -> Result<(), TransportError> {
        let device = self
            .adapter
            .device(address(peripheral)?)
            .map_err(|e| backend(&e))?;

        let watcher = self.runtime.spawn(watch_device(
            peripheral.clone(),
            device.clone(),
            self.events.clone(),
        ));
        let link = Link {
            device: device.clone(),
            characteristics: HashMap::new(),
            subscriptions: HashMap::new(),
            watcher,
        };
        if let Some(previous) = self.links().insert(peripheral.clone(), link) {
            previous.abort();
        }

        let events = self.events.clone();
        let peripheral = peripheral.clone();
        self.runtime.spawn(async move {
            let result = match device.is_connected().await {
                Ok(true) => Ok(()),
                _ => device.connect().await,
            };
            let event = match result {
                Ok(()) => {
                    info!(peripheral = %peripheral, "Link established");
                    TransportEvent::Connected { peripheral }
                }
                Err(e) => TransportEvent::ConnectFailed {
                    peripheral,
                    reason: e.to_string(),
                },
            };
            let _ = events.send(event);
        });
        Ok(())
    }

    fn disconnect(&mut self, peripheral: &PeripheralId) -> Result<(), TransportError> {
        let link = self
            .links()
            .remove(peripheral)
            .ok_or_else(|| TransportError::NotConnected(peripheral.clone()))?;
        let device = link.device.clone();
        link.abort();

        let events = self.events.clone();
        let peripheral = peripheral.clone();
        self.runtime.spawn(async move {
            if let Err(e) = device.disconnect().await {
                debug!(peripheral = %peripheral, error = %e, "Disconnect failed");
            }
            let _ = events.send(TransportEvent::Disconnected { peripheral });
        });
        Ok(())
    }

    fn discover_characteristics(&mut self, peripheral: &PeripheralId) -> Result<(), TransportError> {
        let device = self.device(peripheral)?;
        let links = Arc::clone(&self.links);
        let events = self.events.clone();
        let peripheral = peripheral.clone();
        self.runtime.spawn(async move {
            let event = match discover(&device).await {
                Ok(found) => {
                    let characteristics: Vec<_> = found.keys().copied().collect();
                    if let Some(link) = links
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .get_mut(&peripheral)
                    {
                        link.characteristics = found;
                    }
                    TransportEvent::ServicesDiscovered {
                        peripheral,
                        characteristics,
                    }
                }
                Err(e) => TransportEvent::DiscoveryFailed {
                    peripheral,
                    reason: e.to_string(),
                },
            };
            let _ = events.send(event);
        });
        Ok(())
    }

    fn read_characteristic(
        &mut self,
        peripheral: &PeripheralId,
        characteristic: CharacteristicId,
        token: OperationToken,
    ) -> Result<(), TransportError> {
        let (device, handle) = self.characteristic(peripheral, characteristic)?;
        let Some(handle) = handle else {
            self.report(peripheral, token, Err(OperationError::Gatt { status: ATT_ATTRIBUTE_NOT_FOUND }));
            return Ok(());
        };
        self.spawn_operation(peripheral, device, token, async move {
            handle.read().await.map(Some)
        });
        Ok(())
    }

    fn write_characteristic(
        &mut self,
        peripheral: &PeripheralId,
        characteristic: CharacteristicId,
        value: &[u8],
        token: OperationToken,
    ) -> Result<(), TransportError> {
        let (device, handle) = self.characteristic(peripheral, characteristic)?;
        let Some(handle) = handle else {
            self.report(peripheral, token, Err(OperationError::Gatt { status: ATT_ATTRIBUTE_NOT_FOUND }));
            return Ok(());
        };
        let value = value.to_vec();
        self.spawn_operation(peripheral, device, token, async move {
            handle.write(&value).await.map(|()| None)
        });
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
        let (device, handle) = self.characteristic(peripheral, characteristic)?;
        let Some(handle) = handle else {
            self.report(peripheral, token, Err(OperationError::Gatt { status: ATT_ATTRIBUTE_NOT_FOUND }));
            return Ok(());
        };

        if descriptor == gatt::CLIENT_CHARACTERISTIC_CONFIGURATION {
            if value.iter().any(|b| *b != 0) {
                self.subscribe(peripheral, characteristic, handle, token);
            } else {
                self.unsubscribe(peripheral, characteristic);
                self.report(peripheral, token, Ok(None));
            }
            return Ok(());
        }

        let value = value.to_vec();
        self.spawn_operation(peripheral, device, token, async move {
            write_descriptor(&handle, descriptor, &value).await
        });
        Ok(())
    }
}

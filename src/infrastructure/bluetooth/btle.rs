//! btleplug-backed Transport
//!
//! Cross-platform hardware adapter behind the `btleplug-transport`
//! feature. Values cross the transport boundary base64-encoded, so this
//! adapter re-encodes notification payloads and decodes outbound frames
//! at the edge.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use btleplug::api::{
    Central, CentralEvent, CentralState, Characteristic, Manager as _, Peripheral as _,
    ScanFilter as PlatformScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::stream::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::models::{DeviceId, PeripheralHandle, RadioState, ScannedPod};
use crate::infrastructure::bluetooth::transport::{
    MonitorEndReason, MonitorEvent, MonitorHandle, ScanFilter, Transport, TransportError,
};

/// How long to run a discovery pass when a connect targets a device the
/// adapter has not seen yet, as happens on auto-reconnect after launch.
const LOOKUP_TIMEOUT: Duration = Duration::from_secs(3);
const LOOKUP_POLL: Duration = Duration::from_millis(250);

struct ScanTask {
    forwarder: JoinHandle<()>,
}

/// [`Transport`] over a real BLE radio via btleplug.
pub struct BtleplugTransport {
    adapter: Adapter,
    radio_tx: watch::Sender<RadioState>,
    generation: AtomicU64,
    scan: Mutex<Option<ScanTask>>,
    radio_pump: JoinHandle<()>,
}

impl BtleplugTransport {
    /// Binds to the first Bluetooth adapter on the system.
    pub async fn new() -> Result<Self, TransportError> {
        let manager = Manager::new().await.map_err(backend)?;
        let adapter = manager
            .adapters()
            .await
            .map_err(backend)?
            .into_iter()
            .next()
            .ok_or_else(|| TransportError::Backend("no Bluetooth adapter present".to_string()))?;
        Self::with_adapter(adapter).await
    }

    pub async fn with_adapter(adapter: Adapter) -> Result<Self, TransportError> {
        let initial = adapter
            .adapter_state()
            .await
            .map(map_radio)
            .unwrap_or(RadioState::Unknown);
        let (radio_tx, _) = watch::channel(initial);

        let mut events = adapter.events().await.map_err(backend)?;
        let pump_tx = radio_tx.clone();
        let radio_pump = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if let CentralEvent::StateUpdate(state) = event {
                    debug!("Radio state update: {:?}", state);
                    pump_tx.send_replace(map_radio(state));
                }
            }
        });

        Ok(Self {
            adapter,
            radio_tx,
            generation: AtomicU64::new(0),
            scan: Mutex::new(None),
            radio_pump,
        })
    }

    async fn lookup(&self, device: &DeviceId) -> Result<Option<Peripheral>, TransportError> {
        let peripherals = self.adapter.peripherals().await.map_err(backend)?;
        Ok(peripherals
            .into_iter()
            .find(|peripheral| peripheral.id().to_string() == device.as_str()))
    }

    /// Finds a peripheral by id, running a short discovery pass when the
    /// adapter cache does not know it yet.
    async fn find_peripheral(&self, device: &DeviceId) -> Result<Peripheral, TransportError> {
        if let Some(found) = self.lookup(device).await? {
            return Ok(found);
        }

        let owns_scan = self.scan.lock().unwrap().is_none();
        if owns_scan {
            self.adapter
                .start_scan(PlatformScanFilter::default())
                .await
                .map_err(|err| TransportError::ScanFailed(err.to_string()))?;
        }

        let deadline = tokio::time::Instant::now() + LOOKUP_TIMEOUT;
        let mut found = None;
        while tokio::time::Instant::now() < deadline {
            tokio::time::sleep(LOOKUP_POLL).await;
            if let Some(peripheral) = self.lookup(device).await? {
                found = Some(peripheral);
                break;
            }
        }

        if owns_scan {
            if let Err(err) = self.adapter.stop_scan().await {
                debug!("Stopping lookup scan reported: {}", err);
            }
        }
        found.ok_or_else(|| TransportError::DeviceNotFound(device.clone()))
    }

    fn take_scan_task(&self) -> Option<ScanTask> {
        self.scan.lock().unwrap().take()
    }
}

impl Drop for BtleplugTransport {
    fn drop(&mut self) {
        self.radio_pump.abort();
        if let Some(task) = self.take_scan_task() {
            task.forwarder.abort();
        }
    }
}

#[async_trait]
impl Transport for BtleplugTransport {
    fn radio_state(&self) -> watch::Receiver<RadioState> {
        self.radio_tx.subscribe()
    }

    async fn start_scan(
        &self,
        filter: ScanFilter,
        sink: mpsc::UnboundedSender<ScannedPod>,
    ) -> Result<(), TransportError> {
        if let Some(task) = self.take_scan_task() {
            task.forwarder.abort();
            let _ = self.adapter.stop_scan().await;
        }

        self.adapter
            .start_scan(PlatformScanFilter::default())
            .await
            .map_err(|err| TransportError::ScanFailed(err.to_string()))?;
        let mut events = self.adapter.events().await.map_err(backend)?;

        let adapter = self.adapter.clone();
        let forwarder = tokio::spawn(async move {
            let mut seen = HashSet::new();
            while let Some(event) = events.next().await {
                let id = match event {
                    CentralEvent::DeviceDiscovered(id)
                    | CentralEvent::DeviceUpdated(id)
                    | CentralEvent::ManufacturerDataAdvertisement { id, .. } => id,
                    _ => continue,
                };
                let Ok(peripheral) = adapter.peripheral(&id).await else {
                    continue;
                };
                let Ok(Some(properties)) = peripheral.properties().await else {
                    continue;
                };

                let matches = match filter.company_id {
                    Some(company) => properties.manufacturer_data.contains_key(&company),
                    None => true,
                } && match &filter.name {
                    Some(name) => properties.local_name.as_deref() == Some(name.as_str()),
                    None => true,
                };
                if !matches || !seen.insert(id.to_string()) {
                    continue;
                }

                let pod = ScannedPod {
                    device_id: DeviceId::new(id.to_string()),
                    name: properties.local_name.clone(),
                    signal_strength: properties.rssi,
                };
                if sink.send(pod).is_err() {
                    break;
                }
            }
        });

        *self.scan.lock().unwrap() = Some(ScanTask { forwarder });
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        if let Some(task) = self.take_scan_task() {
            task.forwarder.abort();
        }
        self.adapter
            .stop_scan()
            .await
            .map_err(|err| TransportError::ScanFailed(err.to_string()))
    }

    async fn connect(
        &self,
        device: &DeviceId,
        _auto_connect: bool,
    ) -> Result<PeripheralHandle, TransportError> {
        let peripheral = self.find_peripheral(device).await?;
        peripheral
            .connect()
            .await
            .map_err(|err| TransportError::ConnectionFailed {
                device: device.clone(),
                reason: err.to_string(),
            })?;

        let name = peripheral
            .properties()
            .await
            .ok()
            .flatten()
            .and_then(|properties| properties.local_name);
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(PeripheralHandle::new(device.clone(), name, generation))
    }

    async fn cancel_connection(&self, device: &DeviceId) -> Result<(), TransportError> {
        let peripheral = self.find_peripheral(device).await?;
        peripheral.disconnect().await.map_err(backend)
    }

    async fn discover_services(&self, handle: &PeripheralHandle) -> Result<(), TransportError> {
        let peripheral = self.find_peripheral(&handle.device_id).await?;
        peripheral
            .discover_services()
            .await
            .map_err(|err| TransportError::DiscoveryFailed(err.to_string()))
    }

    /// btleplug leaves MTU negotiation to the platform, so the exchange
    /// is reported as failed and the session stays on the default.
    async fn request_mtu(
        &self,
        _handle: &PeripheralHandle,
        _mtu: u16,
    ) -> Result<u16, TransportError> {
        Err(TransportError::MtuExchangeFailed(
            "not exposed by this backend".to_string(),
        ))
    }

    async fn monitor_characteristic(
        &self,
        handle: &PeripheralHandle,
        service: Uuid,
        characteristic: Uuid,
        sink: mpsc::UnboundedSender<MonitorEvent>,
    ) -> Result<MonitorHandle, TransportError> {
        let peripheral = self.find_peripheral(&handle.device_id).await?;
        let target = find_characteristic(&peripheral, service, characteristic).ok_or_else(|| {
            TransportError::SubscriptionFailed(format!(
                "characteristic {} not found",
                characteristic
            ))
        })?;

        peripheral
            .subscribe(&target)
            .await
            .map_err(|err| TransportError::SubscriptionFailed(err.to_string()))?;
        let mut notifications = peripheral
            .notifications()
            .await
            .map_err(|err| TransportError::SubscriptionFailed(err.to_string()))?;
        let mut central_events = self.adapter.events().await.map_err(backend)?;

        let target_id = peripheral.id();
        let link = peripheral.clone();
        let forward = tokio::spawn(async move {
            let mut events_open = true;
            loop {
                tokio::select! {
                    notification = notifications.next() => match notification {
                        Some(notification) if notification.uuid == characteristic => {
                            let value = general_purpose::STANDARD.encode(&notification.value);
                            if sink.send(MonitorEvent::Data(value)).is_err() {
                                return;
                            }
                        }
                        Some(_) => {}
                        None => {
                            // A stream that dies while the link is up is a
                            // characteristic-level fault, not a disconnect.
                            let connected = link.is_connected().await.unwrap_or(false);
                            let reason = if connected {
                                MonitorEndReason::other(
                                    "characteristic notification stream closed while connected",
                                )
                            } else {
                                MonitorEndReason::device_disconnected()
                            };
                            let _ = sink.send(MonitorEvent::Ended(reason));
                            return;
                        }
                    },
                    event = central_events.next(), if events_open => match event {
                        Some(CentralEvent::DeviceDisconnected(id)) if id == target_id => {
                            let _ = sink
                                .send(MonitorEvent::Ended(MonitorEndReason::device_disconnected()));
                            return;
                        }
                        Some(_) => {}
                        None => events_open = false,
                    },
                }
            }
        });

        Ok(MonitorHandle::new(move || {
            forward.abort();
            tokio::spawn(async move {
                if let Err(err) = peripheral.unsubscribe(&target).await {
                    warn!("Unsubscribe failed: {}", err);
                }
            });
        }))
    }

    async fn write_characteristic(
        &self,
        handle: &PeripheralHandle,
        service: Uuid,
        characteristic: Uuid,
        base64_payload: &str,
        with_response: bool,
    ) -> Result<(), TransportError> {
        let peripheral = self.find_peripheral(&handle.device_id).await?;
        let target = find_characteristic(&peripheral, service, characteristic).ok_or_else(|| {
            TransportError::WriteFailed(format!("characteristic {} not found", characteristic))
        })?;
        let payload = general_purpose::STANDARD
            .decode(base64_payload)
            .map_err(|err| TransportError::WriteFailed(format!("payload is not base64: {}", err)))?;
        let write_type = if with_response {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        peripheral
            .write(&target, &payload, write_type)
            .await
            .map_err(|err| TransportError::WriteFailed(err.to_string()))
    }
}

fn find_characteristic(
    peripheral: &Peripheral,
    service: Uuid,
    characteristic: Uuid,
) -> Option<Characteristic> {
    peripheral
        .characteristics()
        .into_iter()
        .find(|candidate| candidate.uuid == characteristic && candidate.service_uuid == service)
}

fn map_radio(state: CentralState) -> RadioState {
    match state {
        CentralState::PoweredOn => RadioState::PoweredOn,
        CentralState::PoweredOff => RadioState::PoweredOff,
        _ => RadioState::Unknown,
    }
}

fn backend(err: btleplug::Error) -> TransportError {
    TransportError::Backend(err.to_string())
}

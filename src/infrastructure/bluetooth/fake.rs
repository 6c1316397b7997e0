//! In-Memory Fake Transport
//!
//! A scriptable pod stack for tests and development without hardware.
//! Tests drive it from the outside: add pods, inject failures for the
//! next operation, deliver frames into live monitors, and drop links.
//! Handles are validated strictly, so a handle minted by an earlier
//! connection is rejected once the session reconnects.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::domain::models::{DeviceId, PeripheralHandle, RadioState, ScannedPod};
use crate::infrastructure::bluetooth::protocol;
use crate::infrastructure::bluetooth::transport::{
    MonitorEndReason, MonitorEvent, MonitorHandle, ScanFilter, Transport, TransportError,
};

/// One captured characteristic write.
#[derive(Debug, Clone)]
pub struct CapturedWrite {
    pub device: DeviceId,
    pub characteristic: Uuid,
    pub base64_payload: String,
    pub with_response: bool,
}

#[derive(Default)]
struct FakePod {
    name: Option<String>,
    connected: bool,
    generation: u64,
    services_discovered: bool,
}

struct OpenMonitor {
    device: DeviceId,
    sink: mpsc::UnboundedSender<MonitorEvent>,
}

struct ScanSession {
    filter: ScanFilter,
    sink: mpsc::UnboundedSender<ScannedPod>,
}

#[derive(Default)]
struct FakeState {
    pods: HashMap<DeviceId, FakePod>,
    monitors: HashMap<u64, OpenMonitor>,
    next_monitor_id: u64,
    monitors_created: usize,
    scan: Option<ScanSession>,
    writes: Vec<CapturedWrite>,
    connect_attempts: usize,
    cancelled: Vec<DeviceId>,
    fail_next_connect: Option<String>,
    fail_next_discovery: Option<String>,
    fail_next_monitor: Option<String>,
    fail_next_write: Option<String>,
    fail_next_mtu: Option<String>,
    mtu_cap: Option<u16>,
}

/// Scriptable [`Transport`] backed by plain in-memory state.
pub struct FakeTransport {
    radio_tx: watch::Sender<RadioState>,
    state: Arc<Mutex<FakeState>>,
}

impl FakeTransport {
    /// A fake with the radio already powered on.
    pub fn new() -> Self {
        Self::with_radio(RadioState::PoweredOn)
    }

    pub fn with_radio(radio: RadioState) -> Self {
        let (radio_tx, _) = watch::channel(radio);
        Self {
            radio_tx,
            state: Arc::new(Mutex::new(FakeState::default())),
        }
    }

    /// Registers a pod that scans can see and connects can reach.
    pub fn add_pod(&self, device: &DeviceId, name: &str) {
        let mut state = self.state();
        let pod = state.pods.entry(device.clone()).or_default();
        pod.name = Some(name.to_string());
    }

    pub fn set_radio(&self, radio: RadioState) {
        self.radio_tx.send_replace(radio);
    }

    pub fn fail_next_connect(&self, reason: &str) {
        self.state().fail_next_connect = Some(reason.to_string());
    }

    pub fn fail_next_discovery(&self, reason: &str) {
        self.state().fail_next_discovery = Some(reason.to_string());
    }

    pub fn fail_next_monitor(&self, reason: &str) {
        self.state().fail_next_monitor = Some(reason.to_string());
    }

    pub fn fail_next_write(&self, reason: &str) {
        self.state().fail_next_write = Some(reason.to_string());
    }

    pub fn fail_next_mtu(&self, reason: &str) {
        self.state().fail_next_mtu = Some(reason.to_string());
    }

    /// Caps what [`Transport::request_mtu`] grants.
    pub fn set_mtu_cap(&self, cap: u16) {
        self.state().mtu_cap = Some(cap);
    }

    /// Feeds an advertisement through the running scan, registering the
    /// pod on the way so it can be connected afterwards.
    pub fn advertise(&self, device: &DeviceId, name: &str, manufacturer_data: &[u8]) {
        let mut state = self.state();
        let pod = state.pods.entry(device.clone()).or_default();
        pod.name = Some(name.to_string());

        let Some(scan) = &state.scan else { return };
        if !scan.filter.matches(Some(name), Some(manufacturer_data)) {
            return;
        }
        let _ = scan.sink.send(ScannedPod {
            device_id: device.clone(),
            name: Some(name.to_string()),
            signal_strength: Some(-42),
        });
    }

    /// Delivers a text frame from the pod, already encoded the way the
    /// wire carries it. Returns how many live monitors received it.
    pub fn deliver_frame(&self, device: &DeviceId, message: &str) -> usize {
        self.deliver_base64(device, &protocol::encode_frame(message))
    }

    /// Delivers a raw base64 value, useful for malformed-frame cases.
    pub fn deliver_base64(&self, device: &DeviceId, raw: &str) -> usize {
        let state = self.state();
        let mut delivered = 0;
        for monitor in state.monitors.values() {
            if monitor.device == *device
                && monitor
                    .sink
                    .send(MonitorEvent::Data(raw.to_string()))
                    .is_ok()
            {
                delivered += 1;
            }
        }
        delivered
    }

    /// Terminates every live monitor on the device with `reason`,
    /// leaving the link itself up. Returns how many monitors ended.
    pub fn end_monitors(&self, device: &DeviceId, reason: MonitorEndReason) -> usize {
        let mut state = self.state();
        Self::end_monitors_locked(&mut state, device, reason)
    }

    /// Drops the link from the pod side: the device goes disconnected
    /// and every live monitor ends with the platform disconnect reason.
    pub fn simulate_disconnect(&self, device: &DeviceId) {
        let mut state = self.state();
        if let Some(pod) = state.pods.get_mut(device) {
            pod.connected = false;
            pod.services_discovered = false;
        }
        Self::end_monitors_locked(&mut state, device, MonitorEndReason::device_disconnected());
    }

    pub fn is_connected(&self, device: &DeviceId) -> bool {
        self.state()
            .pods
            .get(device)
            .map(|pod| pod.connected)
            .unwrap_or(false)
    }

    pub fn live_monitor_count(&self) -> usize {
        self.state().monitors.len()
    }

    /// Monitors opened over the whole lifetime, live or not.
    pub fn monitors_created(&self) -> usize {
        self.state().monitors_created
    }

    pub fn connect_attempts(&self) -> usize {
        self.state().connect_attempts
    }

    pub fn cancelled_connections(&self) -> Vec<DeviceId> {
        self.state().cancelled.clone()
    }

    pub fn writes(&self) -> Vec<CapturedWrite> {
        self.state().writes.clone()
    }

    /// Captured writes decoded back to text, newline and all.
    pub fn written_messages(&self) -> Vec<String> {
        self.state()
            .writes
            .iter()
            .filter_map(|write| {
                general_purpose::STANDARD
                    .decode(&write.base64_payload)
                    .ok()
                    .and_then(|bytes| String::from_utf8(bytes).ok())
            })
            .collect()
    }

    pub fn scan_active(&self) -> bool {
        self.state().scan.is_some()
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    fn radio_is_on(&self) -> bool {
        *self.radio_tx.borrow() == RadioState::PoweredOn
    }

    fn end_monitors_locked(
        state: &mut FakeState,
        device: &DeviceId,
        reason: MonitorEndReason,
    ) -> usize {
        let ids: Vec<u64> = state
            .monitors
            .iter()
            .filter(|(_, monitor)| monitor.device == *device)
            .map(|(id, _)| *id)
            .collect();
        for id in &ids {
            if let Some(monitor) = state.monitors.remove(id) {
                let _ = monitor.sink.send(MonitorEvent::Ended(reason.clone()));
            }
        }
        ids.len()
    }

    fn check_handle(state: &FakeState, handle: &PeripheralHandle) -> Result<(), TransportError> {
        let pod = state
            .pods
            .get(&handle.device_id)
            .ok_or_else(|| TransportError::DeviceNotFound(handle.device_id.clone()))?;
        if handle.generation() != pod.generation {
            return Err(TransportError::StaleHandle(handle.device_id.clone()));
        }
        if !pod.connected {
            return Err(TransportError::NotConnected(handle.device_id.clone()));
        }
        Ok(())
    }
}

impl Default for FakeTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    fn radio_state(&self) -> watch::Receiver<RadioState> {
        self.radio_tx.subscribe()
    }

    async fn start_scan(
        &self,
        filter: ScanFilter,
        sink: mpsc::UnboundedSender<ScannedPod>,
    ) -> Result<(), TransportError> {
        if !self.radio_is_on() {
            return Err(TransportError::RadioOff);
        }
        self.state().scan = Some(ScanSession { filter, sink });
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        self.state().scan = None;
        Ok(())
    }

    async fn connect(
        &self,
        device: &DeviceId,
        _auto_connect: bool,
    ) -> Result<PeripheralHandle, TransportError> {
        if !self.radio_is_on() {
            return Err(TransportError::RadioOff);
        }
        let mut state = self.state();
        state.connect_attempts += 1;
        if let Some(reason) = state.fail_next_connect.take() {
            return Err(TransportError::ConnectionFailed {
                device: device.clone(),
                reason,
            });
        }
        let pod = state
            .pods
            .get_mut(device)
            .ok_or_else(|| TransportError::DeviceNotFound(device.clone()))?;
        pod.connected = true;
        pod.generation += 1;
        pod.services_discovered = false;
        Ok(PeripheralHandle::new(
            device.clone(),
            pod.name.clone(),
            pod.generation,
        ))
    }

    async fn cancel_connection(&self, device: &DeviceId) -> Result<(), TransportError> {
        let mut state = self.state();
        state.cancelled.push(device.clone());
        if let Some(pod) = state.pods.get_mut(device) {
            pod.connected = false;
            pod.services_discovered = false;
        }
        Self::end_monitors_locked(&mut state, device, MonitorEndReason::cancelled());
        Ok(())
    }

    async fn discover_services(&self, handle: &PeripheralHandle) -> Result<(), TransportError> {
        let mut state = self.state();
        Self::check_handle(&state, handle)?;
        if let Some(reason) = state.fail_next_discovery.take() {
            return Err(TransportError::DiscoveryFailed(reason));
        }
        if let Some(pod) = state.pods.get_mut(&handle.device_id) {
            pod.services_discovered = true;
        }
        Ok(())
    }

    async fn request_mtu(
        &self,
        handle: &PeripheralHandle,
        mtu: u16,
    ) -> Result<u16, TransportError> {
        let mut state = self.state();
        Self::check_handle(&state, handle)?;
        if let Some(reason) = state.fail_next_mtu.take() {
            return Err(TransportError::MtuExchangeFailed(reason));
        }
        Ok(state.mtu_cap.map_or(mtu, |cap| mtu.min(cap)))
    }

    async fn monitor_characteristic(
        &self,
        handle: &PeripheralHandle,
        _service: Uuid,
        _characteristic: Uuid,
        sink: mpsc::UnboundedSender<MonitorEvent>,
    ) -> Result<MonitorHandle, TransportError> {
        let mut state = self.state();
        Self::check_handle(&state, handle)?;
        if let Some(reason) = state.fail_next_monitor.take() {
            return Err(TransportError::SubscriptionFailed(reason));
        }
        let discovered = state
            .pods
            .get(&handle.device_id)
            .map(|pod| pod.services_discovered)
            .unwrap_or(false);
        if !discovered {
            return Err(TransportError::SubscriptionFailed(
                "services not discovered".to_string(),
            ));
        }

        state.next_monitor_id += 1;
        let id = state.next_monitor_id;
        state.monitors.insert(
            id,
            OpenMonitor {
                device: handle.device_id.clone(),
                sink,
            },
        );
        state.monitors_created += 1;

        let shared = Arc::clone(&self.state);
        Ok(MonitorHandle::new(move || {
            shared.lock().unwrap().monitors.remove(&id);
        }))
    }

    async fn write_characteristic(
        &self,
        handle: &PeripheralHandle,
        _service: Uuid,
        characteristic: Uuid,
        base64_payload: &str,
        with_response: bool,
    ) -> Result<(), TransportError> {
        let mut state = self.state();
        Self::check_handle(&state, handle)?;
        if let Some(reason) = state.fail_next_write.take() {
            return Err(TransportError::WriteFailed(reason));
        }
        state.writes.push(CapturedWrite {
            device: handle.device_id.clone(),
            characteristic,
            base64_payload: base64_payload.to_string(),
            with_response,
        });
        Ok(())
    }
}

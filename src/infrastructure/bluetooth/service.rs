//! Pod Service Module
//!
//! The async facade the application talks to. Coordinates the session
//! manager, scanning, and the one-shot auto-reconnect, and converts
//! failures into logged outcomes so callers can stay on the happy path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::domain::models::{
    ConnectionState, DeviceId, MessageSeverity, PeripheralHandle, PodEvent, RadioState,
    StatusMessage,
};
use crate::domain::store::{ProfileStore, ProfileStoreExt};
use crate::infrastructure::bluetooth::config::PodConfig;
use crate::infrastructure::bluetooth::protocol::{POD_ADVERTISED_NAME, POD_COMPANY_ID};
use crate::infrastructure::bluetooth::session::{SendError, SessionManager};
use crate::infrastructure::bluetooth::transport::{ScanFilter, Transport};

#[derive(Default)]
struct ScanSlot {
    forwarder: Option<JoinHandle<()>>,
    stopper: Option<JoinHandle<()>>,
}

/// Main pod service coordinating all BLE operations.
pub struct PodService {
    transport: Arc<dyn Transport>,
    store: Arc<dyn ProfileStore>,
    config: PodConfig,
    session: Arc<SessionManager>,
    events: mpsc::UnboundedSender<PodEvent>,
    auto_reconnect_launched: AtomicBool,
    auto_reconnect_attempted: Arc<AtomicBool>,
    scan: Mutex<ScanSlot>,
}

impl PodService {
    /// Creates a new pod service.
    ///
    /// Events, including connection state changes and scan results, arrive
    /// on the channel behind `events`.
    pub fn new(
        transport: Arc<dyn Transport>,
        store: Arc<dyn ProfileStore>,
        config: PodConfig,
        events: mpsc::UnboundedSender<PodEvent>,
    ) -> Self {
        let session = Arc::new(SessionManager::new(
            transport.clone(),
            config.clone(),
            events.clone(),
        ));
        Self {
            transport,
            store,
            config,
            session,
            events,
            auto_reconnect_launched: AtomicBool::new(false),
            auto_reconnect_attempted: Arc::new(AtomicBool::new(false)),
            scan: Mutex::new(ScanSlot::default()),
        }
    }

    /// Launches the one-shot auto-reconnect in the background.
    ///
    /// Once the radio reports powered-on, the first stored device record
    /// that carries a device id gets a single connect attempt. The outcome,
    /// success or not, is published as [`PodEvent::AutoReconnectFinished`]
    /// and [`has_attempted_auto_reconnect`](Self::has_attempted_auto_reconnect)
    /// flips to true. Subsequent calls do nothing.
    pub fn start(&self) {
        if self.auto_reconnect_launched.swap(true, Ordering::SeqCst) {
            warn!("start() called again, auto-reconnect already ran");
            return;
        }

        let session = Arc::clone(&self.session);
        let store = Arc::clone(&self.store);
        let events = self.events.clone();
        let attempted = Arc::clone(&self.auto_reconnect_attempted);
        let mut radio = self.transport.radio_state();

        tokio::spawn(async move {
            while *radio.borrow_and_update() != RadioState::PoweredOn {
                debug!("Waiting for the radio to power on");
                if radio.changed().await.is_err() {
                    warn!("Radio watch closed before power-on, skipping auto-reconnect");
                    attempted.store(true, Ordering::SeqCst);
                    let _ = events.send(PodEvent::AutoReconnectFinished { connected: false });
                    return;
                }
            }
            drop(radio);

            let target = match store.devices() {
                Ok(devices) => devices.into_iter().find_map(|record| record.device_id),
                Err(err) => {
                    warn!("Could not read stored devices: {}", err);
                    None
                }
            };

            let connected = match target {
                Some(device) => {
                    info!("Trying to reconnect to {}", device);
                    match session.connect(&device).await {
                        Ok(_) => {
                            info!("Reconnected to the previously paired pod");
                            true
                        }
                        Err(err) => {
                            warn!("Auto-reconnect failed: {}", err);
                            false
                        }
                    }
                }
                None => {
                    info!("No stored pod to reconnect to");
                    false
                }
            };

            attempted.store(true, Ordering::SeqCst);
            let _ = events.send(PodEvent::AutoReconnectFinished { connected });
        });
    }

    /// Connects to a pod. Returns the fresh handle, or `None` after a
    /// logged failure.
    pub async fn connect_device(&self, target: &DeviceId) -> Option<PeripheralHandle> {
        match self.session.connect(target).await {
            Ok(handle) => Some(handle),
            Err(err) => {
                error!("Connection failed: {}", err);
                let _ = self.events.send(PodEvent::LogMessage(StatusMessage {
                    message: format!("Connection failed: {}", err),
                    severity: MessageSeverity::Error,
                }));
                None
            }
        }
    }

    /// Disconnects the tracked session, or an explicitly named device.
    pub async fn disconnect_device(&self, device: Option<DeviceId>) {
        self.session.disconnect(device).await;
    }

    /// Sends a request to the connected pod and waits for the correlated
    /// reply. `None` means no connection, a failed write, a timeout, or
    /// supersession by a newer request with the same header.
    pub async fn send_message(&self, message: &str) -> Option<String> {
        match self.session.send(message).await {
            Ok(reply) => reply.wait().await,
            Err(SendError::NotConnected) => {
                warn!("No connected pod to send the message to");
                None
            }
            Err(err) => {
                warn!("Send failed: {}", err);
                None
            }
        }
    }

    /// Sends a request over an explicit handle instead of the tracked one.
    pub async fn send_message_to(
        &self,
        handle: &PeripheralHandle,
        message: &str,
    ) -> Option<String> {
        match self.session.send_to(handle, message).await {
            Ok(reply) => reply.wait().await,
            Err(err) => {
                warn!("Send failed: {}", err);
                None
            }
        }
    }

    /// Re-establishes the RX subscription of the current connection.
    /// Returns whether a subscription is live afterwards.
    pub async fn subscribe_rx(&self) -> bool {
        let Some(handle) = self.session.connected_handle() else {
            warn!("No connected pod to subscribe to");
            return false;
        };
        match self.session.subscribe_rx(&handle).await {
            Ok(()) => true,
            Err(err) => {
                warn!("RX subscription failed: {}", err);
                false
            }
        }
    }

    /// Removes the RX subscription without touching the link.
    pub async fn unsubscribe_rx(&self) {
        self.session.unsubscribe_rx().await;
    }

    /// Starts scanning for pods. Matches are published as
    /// [`PodEvent::DeviceFound`]; the scan stops by itself after the
    /// configured timeout. A running scan is restarted.
    pub async fn start_scan(&self) -> bool {
        let mut slot = self.scan.lock().await;
        self.stop_scan_locked(&mut slot).await;

        let (scan_tx, mut scan_rx) = mpsc::unbounded_channel();
        let filter = ScanFilter::company(POD_COMPANY_ID);
        if let Err(err) = self.transport.start_scan(filter, scan_tx).await {
            error!("Failed to start scanning: {}", err);
            return false;
        }
        info!("Scanning for {} pods", POD_ADVERTISED_NAME);

        let events = self.events.clone();
        slot.forwarder = Some(tokio::spawn(async move {
            while let Some(pod) = scan_rx.recv().await {
                debug!("Found pod {}", pod.display_name());
                let _ = events.send(PodEvent::DeviceFound(pod));
            }
        }));

        let transport = Arc::clone(&self.transport);
        let timeout = self.config.scan_timeout;
        slot.stopper = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            info!("Scan timeout reached, stopping");
            let _ = transport.stop_scan().await;
        }));

        true
    }

    /// Stops a running scan. A no-op when none is active.
    pub async fn stop_scan(&self) {
        let mut slot = self.scan.lock().await;
        self.stop_scan_locked(&mut slot).await;
    }

    async fn stop_scan_locked(&self, slot: &mut ScanSlot) {
        if let Some(stopper) = slot.stopper.take() {
            stopper.abort();
        }
        if let Some(forwarder) = slot.forwarder.take() {
            if let Err(err) = self.transport.stop_scan().await {
                debug!("Stopping scan reported: {}", err);
            }
            forwarder.abort();
            info!("Scan stopped");
        }
    }

    /// Snapshot of the current connection state.
    pub fn connection_state(&self) -> ConnectionState {
        self.session.state()
    }

    /// Watch channel tracking every connection state change.
    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.session.watch_state()
    }

    pub fn connected_handle(&self) -> Option<PeripheralHandle> {
        self.session.connected_handle()
    }

    /// Whether the one-shot auto-reconnect has finished, either way.
    pub fn has_attempted_auto_reconnect(&self) -> bool {
        self.auto_reconnect_attempted.load(Ordering::SeqCst)
    }

    /// How often an established link lost its bond mid-session.
    pub fn bond_lost_count(&self) -> u64 {
        self.session.bond_lost_count()
    }

    /// The device of the most recent successful connect, if any.
    pub fn last_connected_device(&self) -> Option<DeviceId> {
        self.session.last_connected_device()
    }
}

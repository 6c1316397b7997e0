//! Connection session management.
//!
//! Owns the single pod session: the stepwise connect sequence, the one live
//! RX notification subscription, teardown, and the classification of monitor
//! terminations into intentional and unexpected disconnects. All lifecycle
//! operations are serialized by one async mutex so a connect can never race
//! a disconnect or a resubscribe.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};

use crate::domain::models::{ConnectionState, DeviceId, PeripheralHandle, PodEvent};
use crate::infrastructure::bluetooth::config::PodConfig;
use crate::infrastructure::bluetooth::multiplex::{PendingReply, RequestMultiplexer};
use crate::infrastructure::bluetooth::protocol::{
    self, RX_CHAR_UUID, TX_CHAR_UUID, UART_SERVICE_UUID,
};
use crate::infrastructure::bluetooth::transport::{
    MonitorEndReason, MonitorEvent, MonitorHandle, Transport, TransportError,
};

/// Failure of a single connect attempt. Fatal to the attempt, never to the
/// process; the session is back in a clean disconnected state afterwards.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// Service discovery failed after the link came up.
    #[error("service discovery failed: {0}")]
    DiscoveryFailed(#[source] TransportError),
    /// The RX monitor could not be established, commonly a PIN or bond
    /// mismatch during the security handshake.
    #[error("notification subscription failed: {0}")]
    SubscriptionFailed(#[source] TransportError),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Failure to put a request on the air.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("no active connection")]
    NotConnected,
    #[error("write failed: {0}")]
    WriteFailed(#[source] TransportError),
}

/// How a session teardown came about.
///
/// There is no mutable "was this manual" flag to read back later: a
/// teardown issued on this side removes the subscription record before
/// anything else, so by the time the transport's monitor-end event is
/// processed it no longer matches a live subscription and classifies as
/// [`DisconnectKind::UserInitiated`] with nothing to race against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectKind {
    UserInitiated,
    Unexpected,
}

/// The one live RX subscription, if any. The id is compared against the id
/// carried by monitor-end events: an event whose subscription is no longer
/// recorded here was torn down on purpose and must not be treated as an
/// unexpected disconnect.
struct RxSubscription {
    id: u64,
    device: DeviceId,
    monitor: MonitorHandle,
}

#[derive(Default)]
struct SessionSlot {
    subscription: Option<RxSubscription>,
}

impl SessionSlot {
    fn drop_subscription(&mut self) -> Option<DeviceId> {
        self.subscription.take().map(|sub| {
            sub.monitor.remove();
            sub.device
        })
    }
}

/// State shared between the session manager and the RX pump tasks it
/// spawns. The pump only ever touches this, never the transport.
struct SessionShared {
    requests: RequestMultiplexer,
    events: mpsc::UnboundedSender<PodEvent>,
    state_tx: watch::Sender<ConnectionState>,
    slot: Mutex<SessionSlot>,
    subscription_seq: AtomicU64,
    bond_lost: AtomicU64,
    last_connected: std::sync::Mutex<Option<DeviceId>>,
}

impl SessionShared {
    fn set_state(&self, next: ConnectionState) {
        if *self.state_tx.borrow() == next {
            return;
        }
        self.state_tx.send_replace(next.clone());
        let _ = self.events.send(PodEvent::ConnectionChanged(next));
    }

    /// Resolves every in-flight request with no reply. Callers fail fast
    /// instead of riding out the request timeout.
    fn fail_pending(&self) {
        let failed = self.requests.fail_all();
        if failed > 0 {
            debug!("Resolved {} pending requests with no reply", failed);
        }
    }

    /// Classifies the end of an RX monitor.
    ///
    /// A subscription that is no longer recorded was torn down by this side
    /// and the event is noise. Otherwise the link died under us: a reason
    /// naming the characteristic on a live link means the bond was lost
    /// (the pod forgot the pairing), anything else is a routine unexpected
    /// disconnect. Either way pending requests fail immediately.
    async fn handle_monitor_end(&self, subscription_id: u64, reason: MonitorEndReason) {
        let mut slot = self.slot.lock().await;
        let kind = match &slot.subscription {
            Some(live) if live.id == subscription_id => DisconnectKind::Unexpected,
            _ => DisconnectKind::UserInitiated,
        };
        if kind == DisconnectKind::UserInitiated {
            info!("RX monitor ended after teardown: {}", reason);
            return;
        }

        let device = slot.drop_subscription();

        if reason.is_expected_disconnect() {
            warn!("Pod disconnected unexpectedly: {}", reason);
        } else if reason.is_characteristic_fault() {
            warn!("Bond lost on an established link: {}", reason);
            self.bond_lost.fetch_add(1, Ordering::Relaxed);
            if let Some(device) = device {
                let _ = self.events.send(PodEvent::BondLost { device });
            }
        } else {
            warn!("RX monitor failed: {}", reason);
        }

        self.fail_pending();
        self.set_state(ConnectionState::Disconnected);
    }
}

/// Manages the session with one acoustic pod.
pub struct SessionManager {
    transport: Arc<dyn Transport>,
    config: PodConfig,
    shared: Arc<SessionShared>,
}

impl SessionManager {
    pub fn new(
        transport: Arc<dyn Transport>,
        config: PodConfig,
        events: mpsc::UnboundedSender<PodEvent>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let requests = RequestMultiplexer::new(config.request_timeout);
        Self {
            transport,
            config,
            shared: Arc::new(SessionShared {
                requests,
                events,
                state_tx,
                slot: Mutex::new(SessionSlot::default()),
                subscription_seq: AtomicU64::new(0),
                bond_lost: AtomicU64::new(0),
                last_connected: std::sync::Mutex::new(None),
            }),
        }
    }

    /// Snapshot of the current connection state.
    pub fn state(&self) -> ConnectionState {
        self.shared.state_tx.borrow().clone()
    }

    /// Watch channel that tracks every connection state change.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    pub fn connected_handle(&self) -> Option<PeripheralHandle> {
        self.shared.state_tx.borrow().handle().cloned()
    }

    /// How often an established link lost its bond mid-session.
    pub fn bond_lost_count(&self) -> u64 {
        self.shared.bond_lost.load(Ordering::Relaxed)
    }

    /// The device of the most recent successful connect, if any.
    pub fn last_connected_device(&self) -> Option<DeviceId> {
        self.shared.last_connected.lock().unwrap().clone()
    }

    /// Connects to `target` and brings the session fully up: link, settle
    /// delay, service discovery, best-effort MTU exchange, RX subscription.
    ///
    /// Connecting while already connected tears the existing session down
    /// first, whether it is the same pod (reset) or a different one. A
    /// half-open link left behind by a failed step is actively cancelled.
    pub async fn connect(&self, target: &DeviceId) -> Result<PeripheralHandle, ConnectError> {
        let mut slot = self.shared.slot.lock().await;

        if let Some(current) = self.connected_handle() {
            if current.device_id == *target {
                info!("Already connected to {}, resetting the session", target);
            } else {
                info!(
                    "Dropping session with {} to connect to {}",
                    current.device_id, target
                );
            }
            self.teardown_locked(&mut slot, &current.device_id).await;
        }

        // A failed earlier attempt may have left a subscription behind.
        if slot.drop_subscription().is_some() {
            warn!("Dropped stale RX subscription before connecting");
        }

        self.shared.set_state(ConnectionState::Connecting);
        info!("Connecting to {}", target);

        let handle = match self.transport.connect(target, false).await {
            Ok(handle) => handle,
            Err(err) => {
                warn!("Connection to {} failed: {}", target, err);
                self.shared.set_state(ConnectionState::Disconnected);
                return Err(ConnectError::Transport(err));
            }
        };

        // Some platforms report the link before it is usable.
        tokio::time::sleep(self.config.settle_delay).await;

        if let Err(err) = self.transport.discover_services(&handle).await {
            warn!("Service discovery for {} failed: {}", target, err);
            self.abort_half_open(target).await;
            return Err(ConnectError::DiscoveryFailed(err));
        }

        match self
            .transport
            .request_mtu(&handle, self.config.target_mtu)
            .await
        {
            Ok(mtu) => debug!("Negotiated MTU {}", mtu),
            Err(err) => debug!("MTU exchange failed, staying on the default: {}", err),
        }

        if let Err(err) = self.subscribe_rx_locked(&mut slot, &handle).await {
            warn!(
                "RX subscription for {} failed, likely a PIN or security mismatch",
                target
            );
            self.abort_half_open(target).await;
            return Err(err);
        }

        *self.shared.last_connected.lock().unwrap() = Some(target.clone());
        self.shared
            .set_state(ConnectionState::Connected(handle.clone()));
        info!("Connected to {} and listening for notifications", target);
        Ok(handle)
    }

    /// Tears the session down on purpose.
    ///
    /// With no argument the tracked session is closed. An explicit device
    /// that is not the tracked session only gets its link cancelled; the
    /// session state is left alone. The subscription record is removed
    /// before the link is cancelled, which marks the resulting monitor-end
    /// event as intentional.
    pub async fn disconnect(&self, explicit: Option<DeviceId>) {
        let mut slot = self.shared.slot.lock().await;
        let current = self.connected_handle().map(|handle| handle.device_id);

        if let Some(device) = explicit {
            if current.as_ref() != Some(&device) {
                info!("Disconnecting untracked device {}", device);
                if let Err(err) = self.transport.cancel_connection(&device).await {
                    warn!("Cancelling connection to {} failed: {}", device, err);
                }
                return;
            }
        }

        let Some(target) = current else {
            debug!("Disconnect requested with no active connection");
            return;
        };

        info!("Disconnecting from {}", target);
        self.shared.set_state(ConnectionState::Disconnecting);
        self.teardown_locked(&mut slot, &target).await;
        self.shared.set_state(ConnectionState::Disconnected);
    }

    /// Subscribes the RX characteristic of an established connection.
    /// A no-op when a subscription is already live.
    pub async fn subscribe_rx(&self, handle: &PeripheralHandle) -> Result<(), ConnectError> {
        let mut slot = self.shared.slot.lock().await;
        self.subscribe_rx_locked(&mut slot, handle).await
    }

    /// Removes the live RX subscription, if any. Safe to call repeatedly.
    pub async fn unsubscribe_rx(&self) {
        let mut slot = self.shared.slot.lock().await;
        match slot.drop_subscription() {
            Some(device) => debug!("Unsubscribed from RX notifications of {}", device),
            None => debug!("No live RX subscription to remove"),
        }
    }

    /// Registers a pending request for the message's header and writes the
    /// encoded frame to the TX characteristic of the current connection.
    pub async fn send(&self, message: &str) -> Result<PendingReply, SendError> {
        let Some(handle) = self.connected_handle() else {
            return Err(SendError::NotConnected);
        };
        self.send_to(&handle, message).await
    }

    /// Like [`send`](Self::send), but writes to an explicit handle.
    pub async fn send_to(
        &self,
        handle: &PeripheralHandle,
        message: &str,
    ) -> Result<PendingReply, SendError> {
        let header = protocol::request_header(message);
        let reply = self.shared.requests.register(header);
        debug!("TX {}", message);

        let frame = protocol::encode_frame(message);
        if let Err(err) = self
            .transport
            .write_characteristic(handle, UART_SERVICE_UUID, TX_CHAR_UUID, &frame, true)
            .await
        {
            // The reply can never arrive; drop the entry right away.
            self.shared.requests.abandon(header, reply.token());
            return Err(SendError::WriteFailed(err));
        }

        Ok(reply)
    }

    /// Opens the RX monitor and spawns its pump. The guard check and the
    /// slot assignment happen under the caller's lock with no await between
    /// them, so two monitors can never coexist.
    async fn subscribe_rx_locked(
        &self,
        slot: &mut SessionSlot,
        handle: &PeripheralHandle,
    ) -> Result<(), ConnectError> {
        if slot.subscription.is_some() {
            warn!("Already subscribed to RX notifications, keeping the existing monitor");
            return Ok(());
        }

        let (monitor_tx, mut monitor_rx) = mpsc::unbounded_channel();
        let monitor = self
            .transport
            .monitor_characteristic(handle, UART_SERVICE_UUID, RX_CHAR_UUID, monitor_tx)
            .await
            .map_err(ConnectError::SubscriptionFailed)?;

        let id = self.shared.subscription_seq.fetch_add(1, Ordering::Relaxed) + 1;
        slot.subscription = Some(RxSubscription {
            id,
            device: handle.device_id.clone(),
            monitor,
        });

        let shared = Arc::clone(&self.shared);
        let requests = self.shared.requests.clone();
        tokio::spawn(async move {
            while let Some(event) = monitor_rx.recv().await {
                match event {
                    MonitorEvent::Data(raw) => match protocol::decode_frame(&raw) {
                        Ok((header, payload)) => {
                            debug!("RX {}: {}", header, payload);
                            requests.complete(&header, &payload);
                        }
                        Err(err) => debug!("Dropped malformed frame: {}", err),
                    },
                    MonitorEvent::Ended(reason) => {
                        shared.handle_monitor_end(id, reason).await;
                        break;
                    }
                }
            }
            debug!("RX pump {} finished", id);
        });

        debug!("Subscribed to RX notifications (subscription {})", id);
        Ok(())
    }

    /// Drops the subscription record, cancels the link, and fails pending
    /// requests. Transport refusals are advisory here.
    async fn teardown_locked(&self, slot: &mut SessionSlot, device: &DeviceId) {
        if slot.drop_subscription().is_some() {
            debug!("Removed RX subscription for {}", device);
        }
        if let Err(err) = self.transport.cancel_connection(device).await {
            warn!("Cancelling connection to {} failed: {}", device, err);
        }
        self.shared.fail_pending();
    }

    /// A half-open link from a failed connect step must not linger.
    async fn abort_half_open(&self, target: &DeviceId) {
        if let Err(err) = self.transport.cancel_connection(target).await {
            debug!(
                "Cancelling half-open connection to {} reported: {}",
                target, err
            );
        }
        self.shared.set_state(ConnectionState::Disconnected);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::fake::FakeTransport;

    async fn drain() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    fn manager() -> (
        SessionManager,
        Arc<FakeTransport>,
        mpsc::UnboundedReceiver<PodEvent>,
    ) {
        let transport = Arc::new(FakeTransport::new());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let session = SessionManager::new(transport.clone(), PodConfig::default(), events_tx);
        (session, transport, events_rx)
    }

    fn pod() -> DeviceId {
        DeviceId::from("11:22:33:44:55:66")
    }

    #[tokio::test(start_paused = true)]
    async fn subscribe_while_live_is_a_noop() {
        let (session, transport, _events) = manager();
        transport.add_pod(&pod(), "XIAO-BLE-SECURE");

        let handle = session.connect(&pod()).await.unwrap();
        assert_eq!(transport.monitors_created(), 1);

        session.subscribe_rx(&handle).await.unwrap();
        assert_eq!(transport.monitors_created(), 1);
        assert_eq!(transport.live_monitor_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unsubscribe_is_idempotent() {
        let (session, transport, _events) = manager();
        transport.add_pod(&pod(), "XIAO-BLE-SECURE");

        session.connect(&pod()).await.unwrap();
        session.unsubscribe_rx().await;
        assert_eq!(transport.live_monitor_count(), 0);

        session.unsubscribe_rx().await;
        assert_eq!(transport.live_monitor_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_end_racing_a_disconnect_stays_intentional() {
        let (session, transport, mut events) = manager();
        transport.add_pod(&pod(), "XIAO-BLE-SECURE");
        session.connect(&pod()).await.unwrap();

        // Queue a characteristic fault, then tear down before the RX pump
        // gets to run. The fault must be attributed to the teardown, not
        // counted as a lost bond.
        transport.end_monitors(&pod(), MonitorEndReason::other("characteristic went away"));
        session.disconnect(None).await;
        drain().await;

        assert_eq!(session.bond_lost_count(), 0);
        assert_eq!(session.state(), ConnectionState::Disconnected);
        while let Ok(event) = events.try_recv() {
            assert!(!matches!(event, PodEvent::BondLost { .. }));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn bond_fault_on_live_link_counts_once() {
        let (session, transport, mut events) = manager();
        transport.add_pod(&pod(), "XIAO-BLE-SECURE");
        session.connect(&pod()).await.unwrap();

        transport.end_monitors(
            &pod(),
            MonitorEndReason::other("GATT characteristic notify rejected"),
        );
        drain().await;

        assert_eq!(session.bond_lost_count(), 1);
        assert_eq!(session.state(), ConnectionState::Disconnected);

        let mut bond_events = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, PodEvent::BondLost { .. }) {
                bond_events += 1;
            }
        }
        assert_eq!(bond_events, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn send_without_connection_is_rejected() {
        let (session, transport, _events) = manager();

        let result = session.send("GET_FREQ").await;
        assert!(matches!(result, Err(SendError::NotConnected)));
        assert!(transport.writes().is_empty());
    }
}

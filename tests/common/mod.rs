//! Shared harness for the scenario tests: a pod service wired to the
//! scriptable fake transport and an in-memory profile store.
#![allow(dead_code)]

use std::sync::Arc;

use tokio::sync::mpsc;

use acoustic_pod::domain::store::MemoryStore;
use acoustic_pod::{DeviceId, FakeTransport, PodConfig, PodEvent, PodService, RadioState};

pub const POD_ID: &str = "E7:54:0A:91:3C:22";
pub const POD_NAME: &str = "XIAO-BLE-SECURE";

/// Manufacturer data the pod advertises: company id 0xFF01, little-endian.
pub const POD_MANUFACTURER_DATA: [u8; 3] = [0x01, 0xFF, 0x07];

pub struct Harness {
    pub service: Arc<PodService>,
    pub transport: Arc<FakeTransport>,
    pub store: Arc<MemoryStore>,
    pub events: mpsc::UnboundedReceiver<PodEvent>,
}

pub fn pod_id() -> DeviceId {
    DeviceId::from(POD_ID)
}

pub fn harness() -> Harness {
    harness_with_radio(RadioState::PoweredOn)
}

pub fn harness_with_radio(radio: RadioState) -> Harness {
    let transport = Arc::new(FakeTransport::with_radio(radio));
    transport.add_pod(&pod_id(), POD_NAME);
    let store = Arc::new(MemoryStore::new());
    let (events_tx, events) = mpsc::unbounded_channel();
    let service = Arc::new(PodService::new(
        transport.clone(),
        store.clone(),
        PodConfig::default(),
        events_tx,
    ));
    Harness {
        service,
        transport,
        store,
        events,
    }
}

/// Lets spawned background tasks run up to their next await point.
pub async fn drain_tasks() {
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
}

/// Everything currently queued on the event channel.
pub fn drain_events(events: &mut mpsc::UnboundedReceiver<PodEvent>) -> Vec<PodEvent> {
    let mut drained = Vec::new();
    while let Ok(event) = events.try_recv() {
        drained.push(event);
    }
    drained
}

/// Waits for the auto-reconnect outcome event, skipping everything else.
pub async fn wait_auto_reconnect(events: &mut mpsc::UnboundedReceiver<PodEvent>) -> bool {
    loop {
        match events.recv().await {
            Some(PodEvent::AutoReconnectFinished { connected }) => return connected,
            Some(_) => continue,
            None => panic!("event channel closed before auto-reconnect finished"),
        }
    }
}

//! Acoustic Pod BLE core.
//!
//! Connection management and the request/response protocol for talking to
//! an Acoustic Pod over its UART-style BLE service: the session lifecycle
//! (connect, disconnect, one-shot auto-reconnect), the single RX
//! notification subscription, and header-correlated request multiplexing,
//! all behind one async facade.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use acoustic_pod::domain::store::MemoryStore;
//! use acoustic_pod::{DeviceId, FakeTransport, PodConfig, PodService};
//!
//! # async fn example() {
//! let transport = Arc::new(FakeTransport::new());
//! let store = Arc::new(MemoryStore::new());
//! let (events_tx, mut events) = tokio::sync::mpsc::unbounded_channel();
//!
//! let service = PodService::new(transport, store, PodConfig::default(), events_tx);
//! service.start();
//!
//! if let Some(handle) = service.connect_device(&DeviceId::from("AA:BB:CC:DD:EE:FF")).await {
//!     println!("connected to {}", handle.device_id);
//!     let frequency = service.send_message("GET_FREQ").await;
//!     println!("pod frequency: {:?}", frequency);
//! }
//! # let _ = events.recv();
//! # }
//! ```
//!
//! UI concerns and acoustic math beyond the profile records live in the
//! application layer, not here.

pub mod domain;
pub mod infrastructure;

// Public API exports
pub use domain::models::{
    ConnectionState, DeviceId, MessageSeverity, PeripheralHandle, PodEvent, RadioState,
    ScannedPod, StatusMessage,
};
#[cfg(feature = "btleplug-transport")]
pub use infrastructure::bluetooth::BtleplugTransport;
pub use infrastructure::bluetooth::{
    ConnectError, DisconnectKind, FakeTransport, MonitorEndReason, PodConfig, PodService,
    SendError, Transport, TransportError,
};

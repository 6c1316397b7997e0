//! Bluetooth Module
//!
//! BLE communication with the Acoustic Pod.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                      PodService                          │
//! │   (Async facade - public API for the application)        │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!            ┌──────────┴──────────┐
//!            ▼                     ▼
//! ┌──────────────────┐   ┌──────────────────┐
//! │  SessionManager  │   │   scan control   │
//! │                  │   │                  │
//! │ - connect steps  │   │ - company filter │
//! │ - RX monitor     │   │ - auto timeout   │
//! │ - classification │   └──────────────────┘
//! └────────┬─────────┘
//!          │
//!     ┌────┴──────────────┐
//!     ▼                   ▼
//! ┌──────────────┐  ┌──────────────────────────┐
//! │ Multiplexer  │  │     Transport trait      │
//! │              │  │                          │
//! │ - one entry  │  │ - fake (tests, dev)      │
//! │   per header │  │ - btleplug (hardware,    │
//! │ - timeouts   │  │   feature-gated)         │
//! └──────────────┘  └──────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - Pod protocol: UUIDs, advertisement filter, frame codec
//! - [`config`] - Tunable delays, timeouts, and the MTU target
//! - [`transport`] - Platform adapter contract the session drives
//! - [`multiplex`] - Header-correlated pending-request table
//! - [`session`] - Connection lifecycle and disconnect classification
//! - [`service`] - Main service facade
//! - [`fake`] - Scriptable in-memory transport
//! - `btle` - btleplug hardware transport (feature `btleplug-transport`)

#[cfg(feature = "btleplug-transport")]
pub mod btle;
pub mod config;
pub mod fake;
pub mod multiplex;
pub mod protocol;
pub mod service;
pub mod session;
pub mod transport;

// Re-export the main surface for convenience
#[cfg(feature = "btleplug-transport")]
pub use btle::BtleplugTransport;
pub use config::PodConfig;
pub use fake::FakeTransport;
pub use service::PodService;
pub use session::{ConnectError, DisconnectKind, SendError, SessionManager};
pub use transport::{MonitorEndReason, MonitorEvent, ScanFilter, Transport, TransportError};

//! Transport Contract
//!
//! The adapter surface the session layer drives. Implementations wrap a
//! concrete BLE stack ([`crate::infrastructure::bluetooth::fake`] for
//! tests, the btleplug adapter behind the `btleplug-transport` feature
//! for hardware); the session and multiplexer never touch a platform
//! API directly.
//!
//! Characteristic values cross this boundary base64-encoded, the same
//! representation the mobile BLE bridge hands the application layer.
//! Adapters for stacks that deal in raw bytes re-encode at the edge.

use crate::domain::models::{DeviceId, PeripheralHandle, RadioState, ScannedPod};
use async_trait::async_trait;
use std::fmt;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

/// Normalized adapter failures. `Backend` carries anything the platform
/// reports that has no dedicated variant.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Bluetooth radio is powered off")]
    RadioOff,
    #[error("Device {0} not found")]
    DeviceNotFound(DeviceId),
    #[error("Device {0} is not connected")]
    NotConnected(DeviceId),
    #[error("Stale handle for {0}; the connection it came from is gone")]
    StaleHandle(DeviceId),
    #[error("Connection to {device} failed: {reason}")]
    ConnectionFailed { device: DeviceId, reason: String },
    #[error("Service discovery failed: {0}")]
    DiscoveryFailed(String),
    #[error("Subscription setup failed: {0}")]
    SubscriptionFailed(String),
    #[error("Write failed: {0}")]
    WriteFailed(String),
    #[error("Scan failed: {0}")]
    ScanFailed(String),
    #[error("MTU exchange failed: {0}")]
    MtuExchangeFailed(String),
    #[error("Bluetooth backend error: {0}")]
    Backend(String),
}

/// Why a characteristic monitor stopped delivering.
///
/// `code` carries the platform error code when the stack provides one;
/// classification falls back to message text otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorEndReason {
    pub code: Option<u16>,
    pub message: String,
}

impl MonitorEndReason {
    /// Platform code for a dropped link.
    pub const DEVICE_DISCONNECTED: u16 = 201;
    /// Platform code for an operation cancelled on purpose.
    pub const OPERATION_CANCELLED: u16 = 205;

    pub fn new(code: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn device_disconnected() -> Self {
        Self::new(Some(Self::DEVICE_DISCONNECTED), "Device was disconnected")
    }

    pub fn cancelled() -> Self {
        Self::new(Some(Self::OPERATION_CANCELLED), "Operation was cancelled")
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(None, message)
    }

    /// True for the terminations every adapter produces when a link goes
    /// down, whether remotely or by a local cancel.
    pub fn is_expected_disconnect(&self) -> bool {
        if matches!(
            self.code,
            Some(Self::DEVICE_DISCONNECTED) | Some(Self::OPERATION_CANCELLED)
        ) {
            return true;
        }
        let message = self.message.to_lowercase();
        message.contains("disconnect") || message.contains("cancel")
    }

    /// True when the monitor died at the characteristic level while the
    /// link itself was up, the signature of a broken bond.
    pub fn is_characteristic_fault(&self) -> bool {
        self.message.to_lowercase().contains("characteristic")
    }
}

impl fmt::Display for MonitorEndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "{} (code {})", self.message, code),
            None => f.write_str(&self.message),
        }
    }
}

/// One characteristic notification, or the end of the stream.
#[derive(Debug, Clone)]
pub enum MonitorEvent {
    /// Base64-encoded characteristic value, one notification per event.
    Data(String),
    /// The monitor terminated; nothing follows on this stream.
    Ended(MonitorEndReason),
}

/// Live characteristic monitor. Removal is explicit; dropping the handle
/// leaves the monitor running until the connection goes away.
pub struct MonitorHandle {
    remover: Option<Box<dyn FnOnce() + Send>>,
}

impl MonitorHandle {
    pub fn new(remover: impl FnOnce() + Send + 'static) -> Self {
        Self {
            remover: Some(Box::new(remover)),
        }
    }

    pub fn remove(mut self) {
        if let Some(remover) = self.remover.take() {
            remover();
        }
    }
}

impl fmt::Debug for MonitorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MonitorHandle").finish_non_exhaustive()
    }
}

/// Advertisement filter for scans. Empty filter matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanFilter {
    /// Company identifier expected in the first two bytes
    /// (little-endian) of the manufacturer data.
    pub company_id: Option<u16>,
    /// Exact advertised name.
    pub name: Option<String>,
}

impl ScanFilter {
    pub fn company(id: u16) -> Self {
        Self {
            company_id: Some(id),
            ..Self::default()
        }
    }

    pub fn matches(&self, name: Option<&str>, manufacturer_data: Option<&[u8]>) -> bool {
        if let Some(expected) = self.company_id {
            let found = manufacturer_data
                .and_then(crate::infrastructure::bluetooth::protocol::manufacturer_company_id);
            if found != Some(expected) {
                return false;
            }
        }
        if let Some(expected) = &self.name {
            if name != Some(expected.as_str()) {
                return false;
            }
        }
        true
    }
}

/// Platform BLE surface consumed by the session layer.
///
/// One implementation instance manages one radio. Discovered pods and
/// monitor events are pushed through the provided channels; everything
/// else is request/response.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Radio power watch. The receiver starts at the current state, so a
    /// radio that is already powered on is observed without a transition.
    fn radio_state(&self) -> watch::Receiver<RadioState>;

    /// Starts advertising discovery, pushing matches into `sink` until
    /// [`Transport::stop_scan`] is called or the sink is dropped.
    async fn start_scan(
        &self,
        filter: ScanFilter,
        sink: mpsc::UnboundedSender<ScannedPod>,
    ) -> Result<(), TransportError>;

    async fn stop_scan(&self) -> Result<(), TransportError>;

    /// Establishes a link and mints a fresh [`PeripheralHandle`].
    /// `auto_connect` asks the platform to keep retrying in the
    /// background; this layer always passes `false` and owns its own
    /// reconnect policy.
    async fn connect(
        &self,
        device: &DeviceId,
        auto_connect: bool,
    ) -> Result<PeripheralHandle, TransportError>;

    /// Drops the link to the device if one exists. Cancelling a device
    /// that is not connected is not an error on every platform; callers
    /// treat failures as advisory.
    async fn cancel_connection(&self, device: &DeviceId) -> Result<(), TransportError>;

    async fn discover_services(&self, handle: &PeripheralHandle) -> Result<(), TransportError>;

    /// Negotiates a larger MTU, returning the value actually granted.
    async fn request_mtu(
        &self,
        handle: &PeripheralHandle,
        mtu: u16,
    ) -> Result<u16, TransportError>;

    /// Opens a notification monitor on one characteristic. Events flow
    /// into `sink`; a [`MonitorEvent::Ended`] is the last event a
    /// monitor produces.
    async fn monitor_characteristic(
        &self,
        handle: &PeripheralHandle,
        service: Uuid,
        characteristic: Uuid,
        sink: mpsc::UnboundedSender<MonitorEvent>,
    ) -> Result<MonitorHandle, TransportError>;

    /// Writes a base64-encoded payload to one characteristic.
    /// `with_response` selects an acknowledged write; request frames use
    /// it so a write the pod never took fails loudly instead of silently.
    async fn write_characteristic(
        &self,
        handle: &PeripheralHandle,
        service: Uuid,
        characteristic: Uuid,
        base64_payload: &str,
        with_response: bool,
    ) -> Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expected_disconnect_matches_codes_and_text() {
        assert!(MonitorEndReason::device_disconnected().is_expected_disconnect());
        assert!(MonitorEndReason::cancelled().is_expected_disconnect());
        assert!(MonitorEndReason::other("peer disconnected early").is_expected_disconnect());
        assert!(MonitorEndReason::other("Operation was cancelled").is_expected_disconnect());
        assert!(!MonitorEndReason::other("GATT failure 133").is_expected_disconnect());
    }

    #[test]
    fn characteristic_fault_is_case_insensitive() {
        assert!(MonitorEndReason::other("Characteristic read failed").is_characteristic_fault());
        assert!(
            MonitorEndReason::new(None, "cannot monitor CHARACTERISTIC").is_characteristic_fault()
        );
        assert!(!MonitorEndReason::device_disconnected().is_characteristic_fault());
    }

    #[test]
    fn scan_filter_checks_company_id_and_name() {
        let filter = ScanFilter::company(0xFF01);
        assert!(filter.matches(Some("XIAO-BLE-SECURE"), Some(&[0x01, 0xFF, 0x07])));
        assert!(filter.matches(None, Some(&[0x01, 0xFF])));
        assert!(!filter.matches(Some("XIAO-BLE-SECURE"), Some(&[0xFF, 0x01])));
        assert!(!filter.matches(Some("XIAO-BLE-SECURE"), Some(&[0x01])));
        assert!(!filter.matches(Some("XIAO-BLE-SECURE"), None));

        let named = ScanFilter {
            company_id: Some(0xFF01),
            name: Some("XIAO-BLE-SECURE".to_string()),
        };
        assert!(named.matches(Some("XIAO-BLE-SECURE"), Some(&[0x01, 0xFF])));
        assert!(!named.matches(Some("OTHER"), Some(&[0x01, 0xFF])));

        assert!(ScanFilter::default().matches(None, None));
    }
}

use serde::{Deserialize, Serialize};
use std::fmt;

/// Platform identifier of a pod, as reported by the BLE stack.
///
/// Stable across connections on a given phone, but not across platforms
/// (a MAC address on some, an opaque UUID on others). Treated as an
/// opaque string everywhere.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for DeviceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Reference to one live connection attempt.
///
/// Minted by the transport on every successful connect; the generation
/// makes handles from a previous connection unusable after a reconnect,
/// so a stale handle can never write into a fresh session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeripheralHandle {
    pub device_id: DeviceId,
    pub name: Option<String>,
    generation: u64,
}

impl PeripheralHandle {
    pub fn new(device_id: DeviceId, name: Option<String>, generation: u64) -> Self {
        Self {
            device_id,
            name,
            generation,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Power state of the local Bluetooth radio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioState {
    Unknown,
    PoweredOff,
    PoweredOn,
}

/// Connection lifecycle of the single tracked pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected(PeripheralHandle),
    Disconnecting,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected(_))
    }

    pub fn handle(&self) -> Option<&PeripheralHandle> {
        match self {
            Self::Connected(handle) => Some(handle),
            _ => None,
        }
    }
}

/// A pod seen during a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedPod {
    pub device_id: DeviceId,
    pub name: Option<String>,
    pub signal_strength: Option<i16>,
}

impl ScannedPod {
    /// Name for UI lists, falling back to the platform id.
    pub fn display_name(&self) -> String {
        match &self.name {
            Some(name) if !name.is_empty() => name.clone(),
            _ => self.device_id.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum PodEvent {
    ConnectionChanged(ConnectionState),
    DeviceFound(ScannedPod),
    /// The established bond stopped working mid-session; the stored
    /// pairing for this pod should no longer be trusted.
    BondLost {
        device: DeviceId,
    },
    AutoReconnectFinished {
        connected: bool,
    },
    LogMessage(StatusMessage),
}

#[derive(Debug, Clone)]
pub struct StatusMessage {
    pub message: String,
    pub severity: MessageSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    Info,
    Success,
    Warning,
    Error,
}

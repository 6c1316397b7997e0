//! Session configuration

use std::time::Duration;

/// Tunables for the session layer. Defaults match the shipped app; tests
/// shrink the timers.
#[derive(Debug, Clone)]
pub struct PodConfig {
    /// Pause between "connected" and service discovery; some platforms
    /// report the link before it is usable.
    pub settle_delay: Duration,
    /// How long a pending request waits for its response frame.
    pub request_timeout: Duration,
    /// MTU requested after discovery. Best-effort.
    pub target_mtu: u16,
    /// Scans stop by themselves after this long.
    pub scan_timeout: Duration,
}

impl Default for PodConfig {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_millis(300),
            request_timeout: Duration::from_secs(5),
            target_mtu: 247,
            scan_timeout: Duration::from_secs(10),
        }
    }
}

impl PodConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_target_mtu(mut self, mtu: u16) -> Self {
        self.target_mtu = mtu;
        self
    }

    pub fn with_scan_timeout(mut self, timeout: Duration) -> Self {
        self.scan_timeout = timeout;
        self
    }
}

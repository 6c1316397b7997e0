//! Request/response multiplexing over the shared RX characteristic.
//!
//! Every outbound message is correlated with its reply by the ASCII header
//! the pod echoes back on the notify characteristic. The table keeps at most
//! one in-flight request per header: re-sending a header supersedes the
//! earlier request, which resolves immediately with `None` so its caller
//! never waits out the full timeout behind a duplicate.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Reply side of one registered request.
pub struct PendingReply {
    receiver: oneshot::Receiver<Option<String>>,
    token: u64,
}

impl PendingReply {
    /// Waits for the correlated response payload. Resolves with `None` on
    /// timeout, supersession by a newer request, or disconnect.
    pub async fn wait(self) -> Option<String> {
        self.receiver.await.unwrap_or(None)
    }

    pub(crate) fn token(&self) -> u64 {
        self.token
    }
}

struct PendingRequest {
    responder: oneshot::Sender<Option<String>>,
    timer: JoinHandle<()>,
    token: u64,
}

/// Pending-request table keyed by message header.
///
/// Clones share the same table, so the session manager and the RX pump task
/// operate on one set of in-flight requests. The inner mutex is only ever
/// held for map operations, never across an await.
#[derive(Clone)]
pub struct RequestMultiplexer {
    pending: Arc<Mutex<HashMap<String, PendingRequest>>>,
    next_token: Arc<AtomicU64>,
    timeout: Duration,
}

impl RequestMultiplexer {
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_token: Arc::new(AtomicU64::new(0)),
            timeout,
        }
    }

    /// Registers an in-flight request for `header` and arms its expiry timer.
    ///
    /// An existing entry under the same header is superseded: its timer is
    /// cancelled and its caller resolves with `None` right away.
    pub fn register(&self, header: &str) -> PendingReply {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let (responder, receiver) = oneshot::channel();
        let timer = self.spawn_expiry(header.to_string(), token);

        let superseded = self.table().insert(
            header.to_string(),
            PendingRequest {
                responder,
                timer,
                token,
            },
        );
        if let Some(prior) = superseded {
            prior.timer.abort();
            let _ = prior.responder.send(None);
            debug!("Superseded pending {} request", header);
        }

        PendingReply { receiver, token }
    }

    /// Resolves the request registered under `header` with `payload`.
    /// Returns false when no request is waiting, which covers both late
    /// replies after a timeout and unsolicited frames.
    pub fn complete(&self, header: &str, payload: &str) -> bool {
        match self.table().remove(header) {
            Some(entry) => {
                entry.timer.abort();
                let _ = entry.responder.send(Some(payload.to_string()));
                true
            }
            None => {
                debug!("No pending request for {} header", header);
                false
            }
        }
    }

    /// Drops the entry for `header` if it still belongs to `token`.
    /// Used after a failed write, when the reply can never arrive; the
    /// caller's receiver resolves with `None` once the responder drops.
    pub fn abandon(&self, header: &str, token: u64) {
        let mut table = self.table();
        if table.get(header).map(|entry| entry.token) == Some(token) {
            if let Some(entry) = table.remove(header) {
                entry.timer.abort();
            }
        }
    }

    /// Resolves every in-flight request with `None`. Called on disconnect so
    /// callers fail fast instead of riding out the timeout.
    pub fn fail_all(&self) -> usize {
        let drained: Vec<(String, PendingRequest)> = self.table().drain().collect();
        let count = drained.len();
        for (header, entry) in drained {
            entry.timer.abort();
            let _ = entry.responder.send(None);
            debug!("Failed pending {} request", header);
        }
        count
    }

    #[cfg(test)]
    pub(crate) fn pending_len(&self) -> usize {
        self.table().len()
    }

    fn table(&self) -> MutexGuard<'_, HashMap<String, PendingRequest>> {
        self.pending.lock().unwrap()
    }

    fn spawn_expiry(&self, header: String, token: u64) -> JoinHandle<()> {
        let pending = Arc::clone(&self.pending);
        let timeout = self.timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            // Only evict the entry this timer was armed for. A stale timer
            // must never remove a successor registered under the same header.
            let expired = {
                let mut table = pending.lock().unwrap();
                match table.get(&header) {
                    Some(entry) if entry.token == token => table.remove(&header),
                    _ => None,
                }
            };
            if let Some(entry) = expired {
                warn!("Timeout waiting for {}", header);
                let _ = entry.responder.send(None);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[tokio::test(start_paused = true)]
    async fn complete_resolves_with_payload() {
        let requests = RequestMultiplexer::new(TIMEOUT);
        let reply = requests.register("GET_FREQ");

        assert!(requests.complete("GET_FREQ", "132.7"));
        assert_eq!(reply.wait().await, Some("132.7".to_string()));
        assert_eq!(requests.pending_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn expires_with_none_and_removes_entry() {
        let requests = RequestMultiplexer::new(TIMEOUT);
        let reply = requests.register("GET_FREQ");

        let started = tokio::time::Instant::now();
        assert_eq!(reply.wait().await, None);
        assert!(started.elapsed() >= TIMEOUT);
        assert_eq!(requests.pending_len(), 0);

        // A late frame for the expired header is dropped.
        assert!(!requests.complete("GET_FREQ", "132.7"));
    }

    #[tokio::test(start_paused = true)]
    async fn reregistering_supersedes_with_none() {
        let requests = RequestMultiplexer::new(TIMEOUT);
        let first = requests.register("GET_FREQ");
        let second = requests.register("GET_FREQ");

        // The first caller resolves immediately, well before the timeout.
        let started = tokio::time::Instant::now();
        assert_eq!(first.wait().await, None);
        assert!(started.elapsed() < TIMEOUT);

        assert!(requests.complete("GET_FREQ", "128.3"));
        assert_eq!(second.wait().await, Some("128.3".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_timer_does_not_evict_successor() {
        let requests = RequestMultiplexer::new(TIMEOUT);
        let _first = requests.register("GET_FREQ");

        // Re-register shortly before the first timer would have fired.
        tokio::time::sleep(TIMEOUT - Duration::from_millis(100)).await;
        let second = requests.register("GET_FREQ");

        // Past the first deadline; the successor must still be in flight.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(requests.pending_len(), 1);

        assert!(requests.complete("GET_FREQ", "100.8"));
        assert_eq!(second.wait().await, Some("100.8".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn independent_headers_do_not_interfere() {
        let requests = RequestMultiplexer::new(TIMEOUT);
        let freq = requests.register("GET_FREQ");
        let mode = requests.register("GET_MODE");

        assert!(requests.complete("GET_MODE", "1"));
        assert_eq!(mode.wait().await, Some("1".to_string()));
        assert_eq!(requests.pending_len(), 1);

        assert!(requests.complete("GET_FREQ", "132.7"));
        assert_eq!(freq.wait().await, Some("132.7".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn fail_all_resolves_everything_with_none() {
        let requests = RequestMultiplexer::new(TIMEOUT);
        let freq = requests.register("GET_FREQ");
        let mode = requests.register("GET_MODE");

        assert_eq!(requests.fail_all(), 2);
        assert_eq!(freq.wait().await, None);
        assert_eq!(mode.wait().await, None);
        assert_eq!(requests.pending_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn abandon_only_removes_matching_token() {
        let requests = RequestMultiplexer::new(TIMEOUT);
        let first = requests.register("GET_FREQ");
        let first_token = first.token();

        requests.abandon("GET_FREQ", first_token);
        assert_eq!(requests.pending_len(), 0);
        assert_eq!(first.wait().await, None);

        // A stale token must not touch the successor.
        let second = requests.register("GET_FREQ");
        requests.abandon("GET_FREQ", first_token);
        assert_eq!(requests.pending_len(), 1);

        assert!(requests.complete("GET_FREQ", "140"));
        assert_eq!(second.wait().await, Some("140".to_string()));
    }
}

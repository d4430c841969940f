//! Proxy endpoints and the ordered endpoint set.
//!
//! An [`Endpoint`] is a `(host, port)` address with mutable health state:
//! a healthy flag and the timestamp of the last failure attributed to it.
//! The [`EndpointSet`] preserves locator order and owns the shared
//! round-robin cursor used for new-session selection.

use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Milliseconds elapsed since the process-wide epoch. Monotonic; zero is
/// reserved for "no recorded failure".
pub(crate) fn monotonic_ms() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_millis() as u64
}

/// A remote proxy server address with mutable health bookkeeping.
///
/// Equality and hashing consider only the address; the health fields are
/// runtime state.
#[derive(Debug)]
pub struct Endpoint {
    host: String,
    port: u16,
    healthy: AtomicBool,
    last_failure_ms: AtomicU64,
}

impl Endpoint {
    /// Creates a healthy endpoint with no recorded failure.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            healthy: AtomicBool::new(true),
            last_failure_ms: AtomicU64::new(0),
        }
    }

    /// Returns the host component.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Returns the port component.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Returns the `host:port` address.
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Returns the plaintext HTTP/2 URI for channel construction.
    #[must_use]
    pub fn uri(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    /// Returns whether the endpoint is currently considered healthy.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    /// Flips the endpoint healthy and clears the last-failure timestamp.
    pub(crate) fn mark_healthy(&self) {
        self.healthy.store(true, Ordering::Release);
        self.last_failure_ms.store(0, Ordering::Release);
    }

    /// Flips the endpoint unhealthy and records the failure time.
    pub(crate) fn mark_unhealthy(&self) {
        self.healthy.store(false, Ordering::Release);
        // max(1): zero means "cleared" and the very first millisecond of
        // process lifetime must still count as a recorded failure.
        self.last_failure_ms.store(monotonic_ms().max(1), Ordering::Release);
    }

    /// Returns the recorded failure time in monotonic milliseconds, or zero.
    pub(crate) fn last_failure_ms(&self) -> u64 {
        self.last_failure_ms.load(Ordering::Acquire)
    }

    /// Returns true when the endpoint is unhealthy and its last failure is
    /// older than the retry delay, making it a recovery candidate.
    pub(crate) fn due_for_recovery(&self, retry_delay: Duration) -> bool {
        if self.is_healthy() {
            return false;
        }
        let elapsed = monotonic_ms().saturating_sub(self.last_failure_ms());
        elapsed > retry_delay.as_millis() as u64
    }
}

impl PartialEq for Endpoint {
    fn eq(&self, other: &Self) -> bool {
        self.host == other.host && self.port == other.port
    }
}

impl Eq for Endpoint {}

impl std::hash::Hash for Endpoint {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.host.hash(state);
        self.port.hash(state);
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Ordered, immutable set of endpoints plus the shared round-robin cursor.
///
/// The sequence preserves locator order and is non-empty by construction
/// (the parser rejects empty lists). Selection never mutates the order:
/// the monotonically increasing cursor indexes the full sequence modulo
/// its size, and unhealthy members are skipped by advancing the cursor,
/// so transient unhealth of one endpoint does not make the cursor visit
/// another endpoint twice in the same round.
#[derive(Debug)]
pub struct EndpointSet {
    endpoints: Vec<std::sync::Arc<Endpoint>>,
    cursor: AtomicU64,
}

impl EndpointSet {
    /// Builds a set from parsed endpoints, preserving order.
    pub(crate) fn new(endpoints: Vec<Endpoint>) -> Self {
        debug_assert!(!endpoints.is_empty(), "endpoint set is non-empty by construction");
        Self {
            endpoints: endpoints.into_iter().map(std::sync::Arc::new).collect(),
            cursor: AtomicU64::new(0),
        }
    }

    /// Number of endpoints in the set.
    #[must_use]
    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    /// Always false; the set is non-empty by construction.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Iterates the endpoints in locator order.
    pub fn iter(&self) -> impl Iterator<Item = &std::sync::Arc<Endpoint>> {
        self.endpoints.iter()
    }

    /// Number of currently healthy endpoints.
    #[must_use]
    pub fn healthy_count(&self) -> usize {
        self.endpoints.iter().filter(|e| e.is_healthy()).count()
    }

    /// Selects the next healthy endpoint in round-robin order, or `None`
    /// when every endpoint is unhealthy.
    ///
    /// Each probe consumes one cursor position; unhealthy endpoints are
    /// skipped. After one full pass without a healthy candidate the
    /// selection gives up.
    pub(crate) fn next_healthy(&self) -> Option<std::sync::Arc<Endpoint>> {
        let len = self.endpoints.len() as u64;
        for _ in 0..self.endpoints.len() {
            let position = self.cursor.fetch_add(1, Ordering::Relaxed);
            let candidate = &self.endpoints[(position % len) as usize];
            if candidate.is_healthy() {
                return Some(candidate.clone());
            }
        }
        None
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    fn three_node_set() -> EndpointSet {
        EndpointSet::new(vec![
            Endpoint::new("e0", 1059),
            Endpoint::new("e1", 1059),
            Endpoint::new("e2", 1060),
        ])
    }

    fn pick(set: &EndpointSet) -> String {
        set.next_healthy().expect("healthy endpoint").address()
    }

    #[test]
    fn equality_is_by_address() {
        let a = Endpoint::new("h", 1);
        let b = Endpoint::new("h", 1);
        let c = Endpoint::new("h", 2);
        b.mark_unhealthy();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn endpoints_start_healthy_with_cleared_timestamp() {
        let ep = Endpoint::new("h", 1);
        assert!(ep.is_healthy());
        assert_eq!(ep.last_failure_ms(), 0);
    }

    #[test]
    fn mark_unhealthy_records_failure_time() {
        let ep = Endpoint::new("h", 1);
        ep.mark_unhealthy();
        assert!(!ep.is_healthy());
        assert!(ep.last_failure_ms() > 0);

        ep.mark_healthy();
        assert!(ep.is_healthy());
        assert_eq!(ep.last_failure_ms(), 0);
    }

    #[test]
    fn recovery_due_only_after_delay() {
        let ep = Endpoint::new("h", 1);
        ep.mark_unhealthy();
        // A failure recorded just now is not due under a long delay.
        assert!(!ep.due_for_recovery(Duration::from_secs(60)));
        // Healthy endpoints are never due.
        ep.mark_healthy();
        assert!(!ep.due_for_recovery(Duration::ZERO));
    }

    #[test]
    fn round_robin_visits_in_locator_order() {
        let set = three_node_set();
        let picks: Vec<String> = (0..6).map(|_| pick(&set)).collect();
        assert_eq!(
            picks,
            ["e0:1059", "e1:1059", "e2:1060", "e0:1059", "e1:1059", "e2:1060"]
        );
    }

    #[test]
    fn unhealthy_endpoint_is_skipped_without_repeating_others() {
        let set = three_node_set();
        assert_eq!(pick(&set), "e0:1059");
        assert_eq!(pick(&set), "e1:1059");

        // e1 fails between the second and third selection.
        set.iter().nth(1).unwrap().mark_unhealthy();

        assert_eq!(pick(&set), "e2:1060");
        assert_eq!(pick(&set), "e0:1059");
        assert_eq!(pick(&set), "e2:1060");
        assert_eq!(pick(&set), "e0:1059");
    }

    #[test]
    fn recovered_endpoint_rejoins_rotation() {
        let set = three_node_set();
        set.iter().nth(1).unwrap().mark_unhealthy();
        assert_eq!(pick(&set), "e0:1059");
        assert_eq!(pick(&set), "e2:1060");

        set.iter().nth(1).unwrap().mark_healthy();
        // Cursor is at 3 after consuming 0, 1(skipped), 2.
        assert_eq!(pick(&set), "e0:1059");
        assert_eq!(pick(&set), "e1:1059");
        assert_eq!(pick(&set), "e2:1060");
    }

    #[test]
    fn all_unhealthy_yields_none() {
        let set = three_node_set();
        for ep in set.iter() {
            ep.mark_unhealthy();
        }
        assert!(set.next_healthy().is_none());
        assert_eq!(set.healthy_count(), 0);
    }

    #[test]
    fn single_endpoint_keeps_being_selected() {
        let set = EndpointSet::new(vec![Endpoint::new("only", 1)]);
        for _ in 0..4 {
            assert_eq!(pick(&set), "only:1");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod proptest_tests {
    use proptest::prelude::*;

    use super::*;

    proptest! {
        /// With every endpoint healthy, selection i returns endpoint
        /// (c0 + i) mod n for the cursor value c0 before the sequence.
        #[test]
        fn prop_round_robin_is_modular(n in 1usize..8, calls in 1usize..32) {
            let set = EndpointSet::new(
                (0..n).map(|i| Endpoint::new(format!("host{i}"), 1000 + i as u16)).collect(),
            );

            for i in 0..calls {
                let picked = set.next_healthy().unwrap();
                prop_assert_eq!(picked.port() as usize, 1000 + (i % n));
            }
        }

        /// Selection never returns an unhealthy endpoint, and returns None
        /// only when every endpoint is unhealthy.
        #[test]
        fn prop_selection_respects_health(
            n in 1usize..8,
            unhealthy_mask in proptest::collection::vec(any::<bool>(), 8)
        ) {
            let set = EndpointSet::new(
                (0..n).map(|i| Endpoint::new(format!("host{i}"), 1000 + i as u16)).collect(),
            );
            for (i, ep) in set.iter().enumerate() {
                if unhealthy_mask[i] {
                    ep.mark_unhealthy();
                }
            }

            let any_healthy = set.healthy_count() > 0;
            match set.next_healthy() {
                Some(ep) => {
                    prop_assert!(any_healthy);
                    prop_assert!(ep.is_healthy());
                },
                None => prop_assert!(!any_healthy),
            }
        }
    }
}

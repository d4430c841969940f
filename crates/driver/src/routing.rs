//! Multinode connection management.
//!
//! The [`ConnectionManager`] ties together the endpoint set, the channel
//! cache, and the session-pin table. New sessions round-robin over healthy
//! endpoints; established sessions stick to the endpoint that created them
//! until that endpoint is detected unhealthy, at which point the pin is
//! dropped and routing falls back to round-robin. When no endpoint is
//! healthy, an inline recovery sweep re-probes endpoints whose last
//! failure is older than the retry delay.

use std::sync::Arc;

use dashmap::DashMap;

use crate::channel::{ChannelCache, ChannelHandle};
use crate::config::DriverConfig;
use crate::endpoint::{Endpoint, EndpointSet};
use crate::error::{DriverError, Result};

#[derive(Debug)]
pub(crate) struct ConnectionManager {
    endpoints: EndpointSet,
    channels: ChannelCache,
    /// Session identifier -> endpoint holding its server-side state.
    /// Insertion on response and removal on failure may race; last writer
    /// wins, and a stale pin is re-checked at next dispatch.
    pins: DashMap<String, Arc<Endpoint>>,
    retry_delay: std::time::Duration,
}

impl ConnectionManager {
    pub(crate) fn new(endpoints: EndpointSet, config: &DriverConfig) -> Self {
        tracing::info!(
            endpoints = endpoints.len(),
            "multinode connection manager initialized"
        );
        Self {
            endpoints,
            channels: ChannelCache::new(config),
            pins: DashMap::new(),
            retry_delay: config.retry_delay(),
        }
    }

    pub(crate) fn endpoints(&self) -> &EndpointSet {
        &self.endpoints
    }

    /// Round-robin selection over healthy endpoints, running a recovery
    /// sweep when none is available.
    pub(crate) async fn select_for_new_session(&self) -> Option<Arc<Endpoint>> {
        if let Some(endpoint) = self.endpoints.next_healthy() {
            return Some(endpoint);
        }

        self.recovery_sweep().await;
        self.endpoints.next_healthy()
    }

    /// Session-pinned selection. An empty or unknown session identifier
    /// falls back to round-robin; a pin to an unhealthy endpoint is
    /// removed before routing proceeds.
    pub(crate) async fn select_for_session(&self, session_id: &str) -> Option<Arc<Endpoint>> {
        if session_id.is_empty() {
            return self.select_for_new_session().await;
        }

        let pinned = self.pins.get(session_id).map(|entry| entry.value().clone());
        if let Some(endpoint) = pinned {
            if endpoint.is_healthy() {
                return Some(endpoint);
            }
            self.pins.remove(session_id);
            tracing::warn!(
                session = session_id,
                endpoint = %endpoint,
                "pinned endpoint unhealthy, falling back to round-robin"
            );
        }

        self.select_for_new_session().await
    }

    /// Returns the channel handle for an endpoint, connecting lazily.
    pub(crate) async fn channel(&self, endpoint: &Endpoint) -> Result<ChannelHandle> {
        self.channels.get_or_create(endpoint).await
    }

    /// Marks an endpoint unhealthy, records the failure time, and tears
    /// its channel down.
    pub(crate) fn mark_unhealthy(&self, endpoint: &Endpoint, reason: &DriverError) {
        endpoint.mark_unhealthy();
        tracing::warn!(endpoint = %endpoint, %reason, "endpoint marked unhealthy");
        self.channels.evict(endpoint);
    }

    /// Records a successful call through an endpoint.
    pub(crate) fn observe_success(&self, endpoint: &Endpoint) {
        endpoint.mark_healthy();
    }

    /// Pins a session to the endpoint that produced its latest response.
    pub(crate) fn pin(&self, session_id: &str, endpoint: Arc<Endpoint>) {
        if session_id.is_empty() {
            return;
        }
        tracing::debug!(session = session_id, endpoint = %endpoint, "session pinned");
        self.pins.insert(session_id.to_owned(), endpoint);
    }

    /// Removes a session pin, typically on explicit termination.
    pub(crate) fn unpin(&self, session_id: &str) {
        if self.pins.remove(session_id).is_some() {
            tracing::debug!(session = session_id, "session pin removed");
        }
    }

    /// Returns the pinned endpoint for a session, if any.
    pub(crate) fn pinned(&self, session_id: &str) -> Option<Arc<Endpoint>> {
        self.pins.get(session_id).map(|entry| entry.value().clone())
    }

    /// Probes unhealthy endpoints whose last failure is older than the
    /// retry delay by building a fresh channel. Success flips the endpoint
    /// healthy and clears its failure timestamp; failure refreshes the
    /// timestamp so the next sweep backs off again.
    pub(crate) async fn recovery_sweep(&self) {
        for endpoint in self.endpoints.iter() {
            if !endpoint.due_for_recovery(self.retry_delay) {
                continue;
            }

            tracing::debug!(endpoint = %endpoint, "attempting endpoint recovery");
            match self.channels.get_or_create(endpoint).await {
                Ok(_) => {
                    endpoint.mark_healthy();
                    tracing::info!(endpoint = %endpoint, "endpoint recovered");
                },
                Err(error) => {
                    endpoint.mark_unhealthy();
                    tracing::debug!(endpoint = %endpoint, %error, "endpoint recovery failed");
                },
            }
        }
    }

    /// Drops every cached channel and pin.
    pub(crate) fn shutdown(&self) {
        self.channels.clear();
        self.pins.clear();
    }

    /// Number of live channels, for tests.
    #[cfg(test)]
    pub(crate) fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::locator::parse_endpoints;

    fn manager() -> ConnectionManager {
        let endpoints = parse_endpoints("jdbc:ojp[e0:1059,e1:1059,e2:1060]_h2:mem:t").unwrap();
        let config = DriverConfig::default();
        ConnectionManager::new(endpoints, &config)
    }

    fn nth(manager: &ConnectionManager, index: usize) -> Arc<Endpoint> {
        manager.endpoints().iter().nth(index).unwrap().clone()
    }

    #[tokio::test]
    async fn new_sessions_round_robin() {
        let manager = manager();
        let picks: Vec<String> = [
            manager.select_for_new_session().await,
            manager.select_for_new_session().await,
            manager.select_for_new_session().await,
            manager.select_for_new_session().await,
        ]
        .into_iter()
        .map(|e| e.unwrap().address())
        .collect();
        assert_eq!(picks, ["e0:1059", "e1:1059", "e2:1060", "e0:1059"]);
    }

    #[tokio::test]
    async fn empty_session_id_uses_round_robin() {
        let manager = manager();
        let first = manager.select_for_session("").await.unwrap();
        let second = manager.select_for_session("").await.unwrap();
        assert_ne!(first.address(), second.address());
    }

    #[tokio::test]
    async fn pinned_session_sticks_to_its_endpoint() {
        let manager = manager();
        let pinned = nth(&manager, 1);
        manager.pin("sess-1", pinned.clone());

        for _ in 0..4 {
            let selected = manager.select_for_session("sess-1").await.unwrap();
            assert_eq!(selected.address(), pinned.address());
        }
    }

    #[tokio::test]
    async fn unhealthy_pin_is_removed_before_routing() {
        let manager = manager();
        let pinned = nth(&manager, 0);
        manager.pin("sess-1", pinned.clone());

        // Make the next failure recent so the sweep inside selection does
        // not try to reconnect to a fictional host.
        pinned.mark_unhealthy();

        let selected = manager.select_for_session("sess-1").await.unwrap();
        assert_ne!(selected.address(), pinned.address());
        assert!(manager.pinned("sess-1").is_none());
    }

    #[tokio::test]
    async fn unknown_session_falls_back_to_round_robin() {
        let manager = manager();
        assert!(manager.select_for_session("missing").await.is_some());
    }

    #[tokio::test]
    async fn all_unhealthy_with_recent_failures_yields_none() {
        let manager = manager();
        for endpoint in manager.endpoints().iter() {
            endpoint.mark_unhealthy();
        }
        // Failures are fresh, so the sweep skips every endpoint and no
        // candidate remains.
        assert!(manager.select_for_new_session().await.is_none());
    }

    #[tokio::test]
    async fn mark_unhealthy_evicts_channel_state() {
        let manager = manager();
        let endpoint = nth(&manager, 0);
        // No channel was ever built; eviction is a no-op but health flips.
        manager.mark_unhealthy(&endpoint, &DriverError::NoHealthyEndpoints);
        assert!(!endpoint.is_healthy());
        assert_eq!(manager.channel_count(), 0);
    }

    #[tokio::test]
    async fn pin_with_empty_id_is_ignored() {
        let manager = manager();
        manager.pin("", nth(&manager, 0));
        assert!(manager.pinned("").is_none());
    }

    #[tokio::test]
    async fn unpin_removes_the_association() {
        let manager = manager();
        manager.pin("sess-9", nth(&manager, 2));
        assert!(manager.pinned("sess-9").is_some());
        manager.unpin("sess-9");
        assert!(manager.pinned("sess-9").is_none());
    }

    #[tokio::test]
    async fn pin_overwrite_last_writer_wins() {
        let manager = manager();
        manager.pin("sess-1", nth(&manager, 0));
        manager.pin("sess-1", nth(&manager, 2));
        assert_eq!(manager.pinned("sess-1").unwrap().address(), "e2:1060");
    }
}

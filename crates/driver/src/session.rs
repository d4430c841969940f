//! Caller-side session state.
//!
//! Every response from the proxy may carry a replacement
//! [`proto::SessionInfo`]; the session identifier stays stable while the
//! associated server-side state evolves. [`Session`] is the mutable cell
//! holding the caller's current value under the rule "last response wins".
//! Routing stickiness is keyed by the stable identifier, not by this
//! evolving object.

use std::sync::Arc;

use ojp_proto::proto;
use parking_lot::RwLock;

/// A handle to one logical database session behind the proxy.
///
/// Cloning is cheap and clones share the same underlying cell, so a
/// response observed through any clone is visible to all of them. No
/// ordering is guaranteed between concurrent callers sharing a session;
/// callers must serialize their own use if they require it.
#[derive(Debug, Clone)]
pub struct Session {
    inner: Arc<RwLock<proto::SessionInfo>>,
}

impl Session {
    /// Wraps the session info returned by a connect call.
    pub(crate) fn new(info: proto::SessionInfo) -> Self {
        Self { inner: Arc::new(RwLock::new(info)) }
    }

    /// Returns the opaque session identifier. Empty before a session
    /// exists on the server.
    #[must_use]
    pub fn id(&self) -> String {
        self.inner.read().session_id.clone()
    }

    /// Returns the hash of the server-side pooled connection.
    #[must_use]
    pub fn connection_hash(&self) -> String {
        self.inner.read().connection_hash.clone()
    }

    /// Returns the downstream database family tag.
    #[must_use]
    pub fn db_family(&self) -> proto::DbFamily {
        proto::DbFamily::try_from(self.inner.read().db_family)
            .unwrap_or(proto::DbFamily::Unspecified)
    }

    /// Returns the server-side state generation last observed.
    #[must_use]
    pub fn server_state(&self) -> u64 {
        self.inner.read().server_state
    }

    /// Returns a copy of the current session info for use in a request.
    #[must_use]
    pub fn snapshot(&self) -> proto::SessionInfo {
        self.inner.read().clone()
    }

    /// Adopts the replacement session carried by a response.
    pub(crate) fn merge(&self, info: proto::SessionInfo) {
        *self.inner.write() = info;
    }
}

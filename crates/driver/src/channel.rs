//! Channel cache and transport plumbing.
//!
//! One [`ChannelHandle`] exists per endpoint at any time. Handles pair the
//! tonic channel with two service clients, one used for unary calls and
//! one for streaming calls, mirroring the blocking/streaming stub split of
//! the wire protocol. Handles are created lazily on first use and evicted
//! when their endpoint is marked unhealthy; dropping the evicted handle
//! tears the channel down.

use std::time::Duration;

use dashmap::DashMap;
use ojp_proto::proto::statement_service_client::StatementServiceClient;
use snafu::ResultExt;
use tonic::transport::{Channel, Endpoint as TonicEndpoint};

use crate::config::DriverConfig;
use crate::endpoint::Endpoint;
use crate::error::{DriverError, Result, TransportSnafu};

/// HTTP/2 keep-alive interval for idle connections.
const HTTP2_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// HTTP/2 keep-alive timeout.
const HTTP2_KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(10);

/// TCP keepalive interval.
const TCP_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(60);

/// Generated service client over a shared channel.
pub(crate) type ServiceClient = StatementServiceClient<Channel>;

/// A connected channel plus its unary and streaming call handles.
#[derive(Debug, Clone)]
pub(crate) struct ChannelHandle {
    #[allow(dead_code)]
    channel: Channel,
    unary: ServiceClient,
    streaming: ServiceClient,
}

impl ChannelHandle {
    /// Returns the call handle for unary operations.
    pub(crate) fn unary(&self) -> ServiceClient {
        self.unary.clone()
    }

    /// Returns the call handle for streaming operations.
    pub(crate) fn streaming(&self) -> ServiceClient {
        self.streaming.clone()
    }
}

/// Lazily populated map from endpoint address to its [`ChannelHandle`].
#[derive(Debug)]
pub(crate) struct ChannelCache {
    channels: DashMap<(String, u16), ChannelHandle>,
    connect_timeout: Duration,
    request_timeout: Option<Duration>,
    max_inbound_message_size: usize,
}

impl ChannelCache {
    pub(crate) fn new(config: &DriverConfig) -> Self {
        Self {
            channels: DashMap::new(),
            connect_timeout: config.connect_timeout(),
            request_timeout: config.request_timeout(),
            max_inbound_message_size: config.max_inbound_message_size(),
        }
    }

    /// Returns the handle for an endpoint, establishing the channel on
    /// first use.
    ///
    /// Creation happens outside the map lock; when two callers race, the
    /// first insert wins and the loser's channel is dropped, so at most
    /// one handle per endpoint survives.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Transport`] when the connection cannot be
    /// established.
    pub(crate) async fn get_or_create(&self, endpoint: &Endpoint) -> Result<ChannelHandle> {
        let key = (endpoint.host().to_owned(), endpoint.port());

        if let Some(handle) = self.channels.get(&key) {
            return Ok(handle.clone());
        }

        let handle = self.build(endpoint).await?;
        let entry = self.channels.entry(key).or_insert(handle);
        Ok(entry.clone())
    }

    /// Builds a fresh connected handle for an endpoint.
    async fn build(&self, endpoint: &Endpoint) -> Result<ChannelHandle> {
        let tonic_endpoint =
            TonicEndpoint::from_shared(endpoint.uri()).context(TransportSnafu)?;

        let mut tonic_endpoint = tonic_endpoint
            .connect_timeout(self.connect_timeout)
            .tcp_nodelay(true)
            .tcp_keepalive(Some(TCP_KEEPALIVE_INTERVAL))
            .http2_keep_alive_interval(HTTP2_KEEPALIVE_INTERVAL)
            .keep_alive_timeout(HTTP2_KEEPALIVE_TIMEOUT)
            .keep_alive_while_idle(true);
        if let Some(timeout) = self.request_timeout {
            tonic_endpoint = tonic_endpoint.timeout(timeout);
        }

        let channel = tonic_endpoint.connect().await.context(TransportSnafu)?;

        // Inbound limits are set at channel construction; the transport
        // enforces them when decoding responses.
        let client = StatementServiceClient::new(channel.clone())
            .max_decoding_message_size(self.max_inbound_message_size);

        tracing::debug!(endpoint = %endpoint, "channel established");

        Ok(ChannelHandle { channel, unary: client.clone(), streaming: client })
    }

    /// Removes and shuts down the handle for an endpoint, if present.
    pub(crate) fn evict(&self, endpoint: &Endpoint) -> bool {
        let key = (endpoint.host().to_owned(), endpoint.port());
        let removed = self.channels.remove(&key).is_some();
        if removed {
            tracing::debug!(endpoint = %endpoint, "channel evicted");
        }
        removed
    }

    /// Drops every cached handle.
    pub(crate) fn clear(&self) {
        self.channels.clear();
    }

    /// Number of live handles, for diagnostics and tests.
    pub(crate) fn len(&self) -> usize {
        self.channels.len()
    }
}

/// Rejects an outbound message whose encoded length exceeds the configured
/// ceiling, before it enters the transport.
///
/// The length comes from the encoder's computed size rather than a second
/// serialization pass.
pub(crate) fn check_outbound_size<M: prost::Message>(message: &M, limit: usize) -> Result<()> {
    let size = message.encoded_len();
    if size > limit {
        return Err(DriverError::MessageTooLarge { size, limit });
    }
    Ok(())
}

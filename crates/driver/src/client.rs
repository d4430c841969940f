//! The driver's public client surface.
//!
//! [`OjpClient`] owns the connection manager and runs every unary
//! operation through one dispatch template: pick an endpoint (pinned or
//! round-robin), obtain its channel, issue the call, and on success adopt
//! the response session and pin it to the endpoint that produced it.
//! Transport-classified failures mark the endpoint unhealthy and fail the
//! call over to another endpoint under the configured retry policy; every
//! other failure surfaces unchanged.
//!
//! Streaming operations (LOB transfer) resolve their endpoint through the
//! same routing but never retry across endpoints: session pinning
//! guarantees they reach the owning endpoint, and partial streams cannot
//! be safely replayed.

use std::sync::Arc;

use ojp_proto::{ROWS_PER_RESULT_SET_BLOCK, proto};
use serde::{Serialize, de::DeserializeOwned};
use tokio_util::sync::CancellationToken;

use crate::channel::{ChannelHandle, check_outbound_size};
use crate::codec;
use crate::config::DriverConfig;
use crate::error::{DriverError, Result};
use crate::lob::{LobReader, LobWriteOptions, LobWriter};
use crate::locator;
use crate::resource::ResourceCall;
use crate::routing::ConnectionManager;
use crate::session::Session;

/// Responses that may carry a replacement session.
trait SessionCarrier {
    fn session_info(&self) -> Option<&proto::SessionInfo>;
}

impl SessionCarrier for proto::SessionInfo {
    fn session_info(&self) -> Option<&proto::SessionInfo> {
        Some(self)
    }
}

impl SessionCarrier for proto::OpResult {
    fn session_info(&self) -> Option<&proto::SessionInfo> {
        self.session.as_ref()
    }
}

impl SessionCarrier for proto::CallResourceResponse {
    fn session_info(&self) -> Option<&proto::SessionInfo> {
        self.session.as_ref()
    }
}

impl SessionCarrier for proto::SessionTerminationStatus {
    fn session_info(&self) -> Option<&proto::SessionInfo> {
        None
    }
}

impl<T> SessionCarrier for tonic::Streaming<T> {
    fn session_info(&self) -> Option<&proto::SessionInfo> {
        None
    }
}

/// Optional per-statement settings.
#[derive(Debug, Clone, Default)]
pub struct StatementOptions {
    /// Identifier of a previously prepared statement.
    pub statement_id: Option<String>,
    /// Serialized per-statement properties (encode with
    /// [`codec::encode`](crate::codec::encode)).
    pub properties: Option<Vec<u8>>,
}

/// Server-streaming query results.
///
/// Each received result's replacement session is adopted before the
/// result is handed to the caller.
pub struct QueryStream {
    inner: tonic::Streaming<proto::OpResult>,
    session: Session,
}

impl QueryStream {
    /// Returns the next result batch, or `None` when the stream ends.
    pub async fn next(&mut self) -> Result<Option<proto::OpResult>> {
        match self.inner.message().await.map_err(DriverError::from)? {
            Some(result) => {
                if let Some(info) = result.session.clone() {
                    self.session.merge(info);
                }
                Ok(Some(result))
            },
            None => Ok(None),
        }
    }
}

struct ClientInner {
    locator: String,
    downstream_url: String,
    pool_profile: String,
    manager: ConnectionManager,
    config: DriverConfig,
    cancellation: CancellationToken,
}

/// Client-side session router for a set of OJP proxy endpoints.
///
/// Cloning is cheap; clones share endpoints, channels, session pins, and
/// the shutdown signal. The client is safe for concurrent use from
/// unrelated caller tasks.
#[derive(Clone)]
pub struct OjpClient {
    inner: Arc<ClientInner>,
}

impl OjpClient {
    /// Creates a client from a composite locator.
    ///
    /// No connection is established here; channels are built lazily when
    /// the first call needs them.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::InvalidLocator`] when the locator cannot be
    /// parsed.
    pub fn new(locator: impl Into<String>, config: DriverConfig) -> Result<Self> {
        let locator = locator.into();
        let endpoints = locator::parse_endpoints(&locator)?;
        let downstream_url = locator::extract_downstream_url(&locator);
        let pool_profile = locator::extract_pool_profile(&locator);

        tracing::info!(
            endpoints = endpoints.len(),
            profile = %pool_profile,
            "OJP driver initialized"
        );

        let manager = ConnectionManager::new(endpoints, &config);
        Ok(Self {
            inner: Arc::new(ClientInner {
                locator,
                downstream_url,
                pool_profile,
                manager,
                config,
                cancellation: CancellationToken::new(),
            }),
        })
    }

    /// Creates a client with the default configuration.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::InvalidLocator`] when the locator cannot be
    /// parsed.
    pub fn with_defaults(locator: impl Into<String>) -> Result<Self> {
        Self::new(locator, DriverConfig::default())
    }

    /// Returns the composite locator the client was built from.
    #[must_use]
    pub fn locator(&self) -> &str {
        &self.inner.locator
    }

    /// Returns the downstream database URL embedded in the locator.
    #[must_use]
    pub fn downstream_url(&self) -> &str {
        &self.inner.downstream_url
    }

    /// Returns the pool profile named in the locator, or `"default"`.
    #[must_use]
    pub fn pool_profile(&self) -> &str {
        &self.inner.pool_profile
    }

    /// Returns the driver configuration.
    #[must_use]
    pub fn config(&self) -> &DriverConfig {
        &self.inner.config
    }

    /// Returns the proxy endpoint addresses in locator order.
    #[must_use]
    pub fn endpoint_addresses(&self) -> Vec<String> {
        self.inner.manager.endpoints().iter().map(|e| e.address()).collect()
    }

    /// Returns the client's cancellation token; cancel it (or call
    /// [`shutdown`](Self::shutdown)) to fail all in-flight operations.
    #[must_use]
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.inner.cancellation
    }

    /// Cancels in-flight operations and drops channels and session pins.
    pub fn shutdown(&self) {
        self.inner.cancellation.cancel();
        self.inner.manager.shutdown();
        tracing::debug!("driver shutdown initiated");
    }

    /// Returns true once [`shutdown`](Self::shutdown) has been called.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.inner.cancellation.is_cancelled()
    }

    fn check_shutdown(&self) -> Result<()> {
        if self.inner.cancellation.is_cancelled() {
            return Err(DriverError::Cancelled);
        }
        Ok(())
    }

    fn max_outbound(&self) -> usize {
        self.inner.config.max_outbound_message_size
    }

    fn retries_exhausted(&self, attempts: u32) -> bool {
        match self.inner.config.retry_attempts {
            Some(cap) => attempts + 1 >= cap,
            None => false,
        }
    }

    async fn backoff(&self, operation: &'static str, attempt: u32) -> Result<()> {
        let delay = self.inner.config.retry_delay;
        tracing::debug!(
            operation,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "retrying after backoff"
        );
        tokio::select! {
            biased;
            () = self.inner.cancellation.cancelled() => Err(DriverError::Cancelled),
            () = tokio::time::sleep(delay) => Ok(()),
        }
    }

    /// Dispatch template shared by every unary operation.
    async fn dispatch<T, F, Fut>(
        &self,
        session: Option<&Session>,
        operation: &'static str,
        mut call: F,
    ) -> Result<T>
    where
        T: SessionCarrier,
        F: FnMut(ChannelHandle) -> Fut,
        Fut: Future<Output = std::result::Result<T, tonic::Status>>,
    {
        self.check_shutdown()?;
        let session_id = session.map(|s| s.id()).unwrap_or_default();
        let manager = &self.inner.manager;
        let mut attempts: u32 = 0;

        loop {
            let Some(endpoint) = manager.select_for_session(&session_id).await else {
                if self.retries_exhausted(attempts) {
                    return Err(DriverError::NoHealthyEndpoints);
                }
                attempts += 1;
                self.backoff(operation, attempts).await?;
                continue;
            };

            let handle = match manager.channel(&endpoint).await {
                Ok(handle) => handle,
                Err(error) => {
                    manager.mark_unhealthy(&endpoint, &error);
                    if !error.is_retryable() || self.retries_exhausted(attempts) {
                        return Err(error);
                    }
                    attempts += 1;
                    self.backoff(operation, attempts).await?;
                    continue;
                },
            };

            let outcome = tokio::select! {
                biased;
                () = self.inner.cancellation.cancelled() => return Err(DriverError::Cancelled),
                outcome = call(handle) => outcome,
            };

            match outcome {
                Ok(response) => {
                    manager.observe_success(&endpoint);
                    if let Some(info) = response.session_info() {
                        if !info.session_id.is_empty() {
                            manager.pin(&info.session_id, endpoint.clone());
                        }
                        if let Some(session) = session {
                            session.merge(info.clone());
                        }
                    }
                    return Ok(response);
                },
                Err(status) => {
                    let mapped = DriverError::from(status);
                    if !mapped.is_retryable() || self.retries_exhausted(attempts) {
                        return Err(mapped);
                    }
                    manager.mark_unhealthy(&endpoint, &mapped);
                    attempts += 1;
                    self.backoff(operation, attempts).await?;
                },
            }
        }
    }

    // =========================================================================
    // Session lifecycle
    // =========================================================================

    /// Opens a session against the downstream database.
    ///
    /// # Errors
    ///
    /// Fails with [`DriverError::NoHealthyEndpoints`] when no endpoint
    /// answers within the retry policy, or with the mapped server error.
    pub async fn connect(&self, user: &str, password: &str) -> Result<Session> {
        self.connect_with(user, password, &()).await
    }

    /// Opens a session, forwarding serialized connection properties.
    ///
    /// # Errors
    ///
    /// As [`connect`](Self::connect), plus codec errors for the
    /// properties blob.
    pub async fn connect_with<P>(&self, user: &str, password: &str, properties: &P) -> Result<Session>
    where
        P: Serialize + ?Sized,
    {
        let details = proto::ConnectionDetails {
            url: self.inner.locator.clone(),
            user: user.to_owned(),
            password: password.to_owned(),
            client_identifier: self.inner.config.client_id.clone(),
            properties: codec::encode(properties)?,
        };
        check_outbound_size(&details, self.max_outbound())?;

        let info = self
            .dispatch(None, "connect", move |handle| {
                let request = details.clone();
                async move {
                    let mut client = handle.unary();
                    client.open_session(request).await.map(tonic::Response::into_inner)
                }
            })
            .await?;

        tracing::debug!(session = %info.session_id, "session established");
        Ok(Session::new(info))
    }

    /// Terminates a session and removes its endpoint pin.
    ///
    /// # Errors
    ///
    /// Returns the mapped server error; the pin is removed regardless.
    pub async fn terminate_session(&self, session: &Session) -> Result<()> {
        let request = session.snapshot();
        check_outbound_size(&request, self.max_outbound())?;
        let result = self
            .dispatch(Some(session), "terminate_session", move |handle| {
                let request = request.clone();
                async move {
                    let mut client = handle.unary();
                    client.terminate_session(request).await.map(tonic::Response::into_inner)
                }
            })
            .await;

        self.inner.manager.unpin(&session.id());
        result.map(|_| ())
    }

    // =========================================================================
    // Statements
    // =========================================================================

    fn statement_request<P>(
        &self,
        session: &Session,
        sql: &str,
        params: &P,
        options: &StatementOptions,
    ) -> Result<proto::StatementRequest>
    where
        P: Serialize + ?Sized,
    {
        let request = proto::StatementRequest {
            session: Some(session.snapshot()),
            statement_id: options.statement_id.clone().unwrap_or_default(),
            sql: sql.to_owned(),
            parameters: codec::encode(params)?,
            properties: options.properties.clone().unwrap_or_default(),
        };
        check_outbound_size(&request, self.max_outbound())?;
        Ok(request)
    }

    /// Executes a DML statement and returns its result.
    ///
    /// # Errors
    ///
    /// Returns the mapped server error, a codec error for the parameter
    /// blob, or [`DriverError::MessageTooLarge`].
    pub async fn execute_update<P>(
        &self,
        session: &Session,
        sql: &str,
        params: &P,
    ) -> Result<proto::OpResult>
    where
        P: Serialize + ?Sized,
    {
        self.execute_update_opts(session, sql, params, &StatementOptions::default()).await
    }

    /// Executes a DML statement with per-statement options.
    ///
    /// # Errors
    ///
    /// As [`execute_update`](Self::execute_update).
    pub async fn execute_update_opts<P>(
        &self,
        session: &Session,
        sql: &str,
        params: &P,
        options: &StatementOptions,
    ) -> Result<proto::OpResult>
    where
        P: Serialize + ?Sized,
    {
        let request = self.statement_request(session, sql, params, options)?;
        self.dispatch(Some(session), "execute_update", move |handle| {
            let request = request.clone();
            async move {
                let mut client = handle.unary();
                client.execute_update(request).await.map(tonic::Response::into_inner)
            }
        })
        .await
    }

    /// Executes a query, returning a stream of result batches.
    ///
    /// The stream is established through the dispatch template; once
    /// flowing it is not re-dispatched.
    ///
    /// # Errors
    ///
    /// As [`execute_update`](Self::execute_update).
    pub async fn execute_query<P>(
        &self,
        session: &Session,
        sql: &str,
        params: &P,
    ) -> Result<QueryStream>
    where
        P: Serialize + ?Sized,
    {
        self.execute_query_opts(session, sql, params, &StatementOptions::default()).await
    }

    /// Executes a query with per-statement options.
    ///
    /// # Errors
    ///
    /// As [`execute_query`](Self::execute_query).
    pub async fn execute_query_opts<P>(
        &self,
        session: &Session,
        sql: &str,
        params: &P,
        options: &StatementOptions,
    ) -> Result<QueryStream>
    where
        P: Serialize + ?Sized,
    {
        let request = self.statement_request(session, sql, params, options)?;
        let stream = self
            .dispatch(Some(session), "execute_query", move |handle| {
                let request = request.clone();
                async move {
                    let mut client = handle.streaming();
                    client.execute_query(request).await.map(tonic::Response::into_inner)
                }
            })
            .await?;
        Ok(QueryStream { inner: stream, session: session.clone() })
    }

    /// Fetches the next page of rows with the default page size (100).
    ///
    /// # Errors
    ///
    /// Returns the mapped server error.
    pub async fn fetch_next(&self, session: &Session, result_set_id: &str) -> Result<proto::OpResult> {
        self.fetch_next_rows(session, result_set_id, ROWS_PER_RESULT_SET_BLOCK).await
    }

    /// Fetches the next page of rows with a caller-supplied page size.
    ///
    /// # Errors
    ///
    /// Returns the mapped server error.
    pub async fn fetch_next_rows(
        &self,
        session: &Session,
        result_set_id: &str,
        page_size: u32,
    ) -> Result<proto::OpResult> {
        let request = proto::ResultSetFetchRequest {
            session: Some(session.snapshot()),
            result_set_id: result_set_id.to_owned(),
            page_size,
        };
        check_outbound_size(&request, self.max_outbound())?;

        self.dispatch(Some(session), "fetch_next_rows", move |handle| {
            let request = request.clone();
            async move {
                let mut client = handle.unary();
                client.fetch_next_rows(request).await.map(tonic::Response::into_inner)
            }
        })
        .await
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    /// Starts a transaction on the session.
    ///
    /// # Errors
    ///
    /// Returns the mapped server error.
    pub async fn start_transaction(&self, session: &Session) -> Result<()> {
        let request = session.snapshot();
        check_outbound_size(&request, self.max_outbound())?;
        self.dispatch(Some(session), "start_transaction", move |handle| {
            let request = request.clone();
            async move {
                let mut client = handle.unary();
                client.start_transaction(request).await.map(tonic::Response::into_inner)
            }
        })
        .await
        .map(|_| ())
    }

    /// Commits the session's transaction.
    ///
    /// # Errors
    ///
    /// Returns the mapped server error.
    pub async fn commit_transaction(&self, session: &Session) -> Result<()> {
        let request = session.snapshot();
        check_outbound_size(&request, self.max_outbound())?;
        self.dispatch(Some(session), "commit_transaction", move |handle| {
            let request = request.clone();
            async move {
                let mut client = handle.unary();
                client.commit_transaction(request).await.map(tonic::Response::into_inner)
            }
        })
        .await
        .map(|_| ())
    }

    /// Rolls the session's transaction back.
    ///
    /// # Errors
    ///
    /// Returns the mapped server error.
    pub async fn rollback_transaction(&self, session: &Session) -> Result<()> {
        let request = session.snapshot();
        check_outbound_size(&request, self.max_outbound())?;
        self.dispatch(Some(session), "rollback_transaction", move |handle| {
            let request = request.clone();
            async move {
                let mut client = handle.unary();
                client.rollback_transaction(request).await.map(tonic::Response::into_inner)
            }
        })
        .await
        .map(|_| ())
    }

    // =========================================================================
    // Remote resources
    // =========================================================================

    /// Invokes an operation on a named server-side resource.
    ///
    /// # Errors
    ///
    /// Returns the mapped server error or
    /// [`DriverError::MessageTooLarge`].
    pub async fn call_resource(
        &self,
        session: &Session,
        kind: proto::ResourceKind,
        resource_id: &str,
        call: ResourceCall,
    ) -> Result<proto::CallResourceResponse> {
        let request = proto::CallResourceRequest {
            session: Some(session.snapshot()),
            resource_kind: kind as i32,
            resource_id: resource_id.to_owned(),
            target: Some(call.into_target()),
        };
        check_outbound_size(&request, self.max_outbound())?;

        self.dispatch(Some(session), "call_resource", move |handle| {
            let request = request.clone();
            async move {
                let mut client = handle.unary();
                client.call_resource(request).await.map(tonic::Response::into_inner)
            }
        })
        .await
    }

    /// Invokes a resource operation and decodes the serialized return
    /// value into the caller-chosen type.
    ///
    /// # Errors
    ///
    /// As [`call_resource`](Self::call_resource), plus codec errors.
    pub async fn call_resource_typed<T: DeserializeOwned>(
        &self,
        session: &Session,
        kind: proto::ResourceKind,
        resource_id: &str,
        call: ResourceCall,
    ) -> Result<T> {
        let response = self.call_resource(session, kind, resource_id, call).await?;
        codec::decode(&response.values)
    }

    /// Invokes a resource operation, suppressing return-value decoding.
    ///
    /// # Errors
    ///
    /// As [`call_resource`](Self::call_resource).
    pub async fn call_resource_void(
        &self,
        session: &Session,
        kind: proto::ResourceKind,
        resource_id: &str,
        call: ResourceCall,
    ) -> Result<()> {
        self.call_resource(session, kind, resource_id, call).await.map(|_| ())
    }

    // =========================================================================
    // Large objects
    // =========================================================================

    /// Starts a LOB upload on the session's endpoint and returns the byte
    /// sink feeding it.
    ///
    /// # Errors
    ///
    /// Fails with [`DriverError::NoHealthyEndpoints`] when the owning
    /// endpoint cannot be resolved, or the mapped transport error when
    /// the stream cannot be opened. No cross-endpoint retry is attempted.
    pub async fn create_lob(
        &self,
        session: &Session,
        kind: proto::LobKind,
        options: LobWriteOptions,
    ) -> Result<LobWriter> {
        self.check_shutdown()?;
        let session_id = session.id();
        let manager = &self.inner.manager;

        let endpoint = manager
            .select_for_session(&session_id)
            .await
            .ok_or(DriverError::NoHealthyEndpoints)?;
        let handle = match manager.channel(&endpoint).await {
            Ok(handle) => handle,
            Err(error) => {
                manager.mark_unhealthy(&endpoint, &error);
                return Err(error);
            },
        };

        tracing::debug!(endpoint = %endpoint, "creating LOB");
        let writer = LobWriter::start(
            &handle,
            session.clone(),
            kind,
            options,
            self.max_outbound(),
            self.inner.cancellation.child_token(),
        )
        .await;

        if let Err(error) = &writer
            && error.is_retryable()
        {
            manager.mark_unhealthy(&endpoint, error);
        }
        writer
    }

    /// Opens a byte source over a stored LOB.
    ///
    /// `position` is 1-based and inclusive; `length` is the requested
    /// byte count. Blocks are fetched lazily in 2-block windows as the
    /// source is read.
    ///
    /// # Errors
    ///
    /// Fails with [`DriverError::NoHealthyEndpoints`] when the owning
    /// endpoint cannot be resolved.
    pub async fn read_lob(
        &self,
        reference: &proto::LobReference,
        position: u64,
        length: u64,
    ) -> Result<LobReader> {
        self.check_shutdown()?;
        if position == 0 {
            return Err(DriverError::Protocol {
                message: "LOB read positions are 1-based".to_owned(),
            });
        }

        let session_id =
            reference.session.as_ref().map(|s| s.session_id.clone()).unwrap_or_default();
        let manager = &self.inner.manager;

        let endpoint = manager
            .select_for_session(&session_id)
            .await
            .ok_or(DriverError::NoHealthyEndpoints)?;
        let handle = match manager.channel(&endpoint).await {
            Ok(handle) => handle,
            Err(error) => {
                manager.mark_unhealthy(&endpoint, &error);
                return Err(error);
            },
        };

        Ok(LobReader::new(
            handle.streaming(),
            reference.clone(),
            position,
            length,
            self.max_outbound(),
        ))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn fast_config() -> DriverConfig {
        DriverConfig::builder()
            .with_retry_attempts(2)
            .with_retry_delay(Duration::from_millis(20))
            .with_connect_timeout(Duration::from_millis(250))
            .build()
            .unwrap()
    }

    #[test]
    fn construction_parses_the_locator() {
        let client = OjpClient::with_defaults(
            "jdbc:ojp[server1:1059,server2:1060>fast]_postgresql://h:5432/db",
        )
        .unwrap();
        assert_eq!(client.endpoint_addresses(), ["server1:1059", "server2:1060"]);
        assert_eq!(client.downstream_url(), "jdbc:postgresql://h:5432/db");
        assert_eq!(client.pool_profile(), "fast");
    }

    #[test]
    fn construction_rejects_bad_locators() {
        assert!(OjpClient::with_defaults("jdbc:postgresql://direct").is_err());
        assert!(OjpClient::with_defaults("jdbc:ojp[h:99999]_x").is_err());
    }

    #[tokio::test]
    async fn shutdown_fails_subsequent_calls() {
        let client = OjpClient::new("jdbc:ojp[localhost:1059]_h2:mem:t", fast_config()).unwrap();
        client.shutdown();
        assert!(client.is_shutdown());

        let error = client.connect("sa", "").await.unwrap_err();
        assert!(matches!(error, DriverError::Cancelled));
    }

    #[tokio::test]
    async fn exhausted_retries_surface_no_healthy_endpoints() {
        // Port 1 refuses connections; after the first transport failure the
        // endpoint is unhealthy and the second attempt finds no candidate.
        let client = OjpClient::new("jdbc:ojp[127.0.0.1:1]_h2:mem:t", fast_config()).unwrap();
        let error = client.connect("sa", "").await.unwrap_err();
        assert!(
            matches!(error, DriverError::NoHealthyEndpoints | DriverError::Transport { .. }),
            "unexpected error: {error:?}"
        );
    }

    #[tokio::test]
    async fn oversized_outbound_messages_are_rejected_locally() {
        let config = DriverConfig::builder()
            .with_max_outbound_message_size(32)
            .with_retry_attempts(1)
            .build()
            .unwrap();
        let client = OjpClient::new("jdbc:ojp[localhost:1059]_h2:mem:t", config).unwrap();

        let session = Session::new(proto::SessionInfo {
            session_id: "sess".to_owned(),
            ..Default::default()
        });
        let error = client
            .execute_update(&session, &"x".repeat(256), &())
            .await
            .unwrap_err();
        assert!(matches!(error, DriverError::MessageTooLarge { .. }));
    }
}

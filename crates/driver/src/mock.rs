//! Mock OJP proxy server for driver testing.
//!
//! Provides a controllable in-process implementation of the statement
//! service for testing routing, failover, and LOB streaming without a
//! real proxy deployment.
//!
//! # Features
//!
//! - **Session tracking**: sessions are created on connect and the
//!   server-state generation is bumped on every response
//! - **LOB storage**: uploaded LOBs are reassembled and stored, with a
//!   per-LOB frame log for asserting wire framing
//! - **Failure injection**: inject UNAVAILABLE errors or delays for
//!   resilience tests
//! - **Request counting**: per-operation counters for verification
//!
//! # Example
//!
//! ```no_run
//! use ojp_driver::mock::MockProxyServer;
//! use ojp_driver::OjpClient;
//!
//! #[tokio::test]
//! async fn test_connect() {
//!     let server = MockProxyServer::start("node-a").await.unwrap();
//!     let locator = format!("jdbc:ojp[{}]_h2:mem:test", server.address());
//!     let client = OjpClient::with_defaults(&locator).unwrap();
//!
//!     let session = client.connect("sa", "").await.unwrap();
//!     assert_eq!(session.connection_hash(), "node-a");
//!     assert_eq!(server.connect_count(), 1);
//! }
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use ojp_proto::{MAX_LOB_BLOCK_SIZE, proto};
use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::Server;
use tonic::{Request, Response, Status, Streaming};

use ojp_proto::proto::statement_service_server::{StatementService, StatementServiceServer};

use crate::error::{DriverError, Result};

/// Shared state of one mock proxy node.
#[derive(Debug)]
struct MockState {
    /// Name reported as the connection hash, identifying the node in
    /// routing assertions.
    name: String,

    /// Database family reported on connect.
    db_family: i32,

    /// Live session identifiers.
    sessions: RwLock<std::collections::HashSet<String>>,

    /// Server-side state generation, bumped on every response.
    state_generation: AtomicU64,

    /// Stored LOB bytes by identifier.
    lobs: RwLock<HashMap<String, Vec<u8>>>,

    /// (position, payload length) per received frame, by LOB identifier.
    frame_log: RwLock<HashMap<String, Vec<(i64, usize)>>>,

    /// SQL texts received by execute operations.
    sql_log: RwLock<Vec<String>>,

    /// Page size of the most recent fetch request.
    last_fetch_size: AtomicU32,

    /// Number of UNAVAILABLE errors to inject into upcoming requests.
    unavailable_count: AtomicUsize,

    /// Delay injected into each request, in milliseconds.
    delay_ms: AtomicU64,

    connect_count: AtomicUsize,
    update_count: AtomicUsize,
    query_count: AtomicUsize,
    fetch_count: AtomicUsize,
    lob_create_count: AtomicUsize,
    lob_read_count: AtomicUsize,
    resource_count: AtomicUsize,
    terminate_count: AtomicUsize,
}

impl MockState {
    fn new(name: &str, db_family: proto::DbFamily) -> Self {
        Self {
            name: name.to_owned(),
            db_family: db_family as i32,
            sessions: RwLock::new(std::collections::HashSet::new()),
            state_generation: AtomicU64::new(0),
            lobs: RwLock::new(HashMap::new()),
            frame_log: RwLock::new(HashMap::new()),
            sql_log: RwLock::new(Vec::new()),
            last_fetch_size: AtomicU32::new(0),
            unavailable_count: AtomicUsize::new(0),
            delay_ms: AtomicU64::new(0),
            connect_count: AtomicUsize::new(0),
            update_count: AtomicUsize::new(0),
            query_count: AtomicUsize::new(0),
            fetch_count: AtomicUsize::new(0),
            lob_create_count: AtomicUsize::new(0),
            lob_read_count: AtomicUsize::new(0),
            resource_count: AtomicUsize::new(0),
            terminate_count: AtomicUsize::new(0),
        }
    }

    /// Injects a failure or delay when configured.
    async fn check_injection(&self) -> std::result::Result<(), Status> {
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        loop {
            let current = self.unavailable_count.load(Ordering::SeqCst);
            if current == 0 {
                return Ok(());
            }
            if self
                .unavailable_count
                .compare_exchange(current, current - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return Err(Status::unavailable("injected outage"));
            }
        }
    }

    /// Echoes the request session with a bumped state generation, or
    /// creates a session shell when none was sent.
    fn refresh(&self, session: Option<proto::SessionInfo>) -> proto::SessionInfo {
        let generation = self.state_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let mut info = session.unwrap_or_default();
        info.connection_hash = self.name.clone();
        info.db_family = self.db_family;
        info.server_state = generation;
        info
    }
}

/// Handle to a running mock proxy node.
pub struct MockProxyServer {
    state: Arc<MockState>,
    addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl MockProxyServer {
    /// Starts a named mock node on an ephemeral port, reporting the H2
    /// family disabled (PostgreSQL semantics).
    ///
    /// # Errors
    ///
    /// Returns a connection error when binding fails.
    pub async fn start(name: &str) -> Result<Self> {
        Self::start_with_family(name, proto::DbFamily::Postgresql).await
    }

    /// Starts a named mock node reporting the given database family.
    ///
    /// # Errors
    ///
    /// Returns a connection error when binding fails.
    pub async fn start_with_family(name: &str, family: proto::DbFamily) -> Result<Self> {
        let state = Arc::new(MockState::new(name, family));

        let listener =
            tokio::net::TcpListener::bind("127.0.0.1:0").await.map_err(|e| DriverError::Protocol {
                message: format!("mock bind failed: {e}"),
            })?;
        let addr = listener.local_addr().map_err(|e| DriverError::Protocol {
            message: format!("mock local addr failed: {e}"),
        })?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let service = MockStatementService { state: state.clone() };
        let incoming = tokio_stream::wrappers::TcpListenerStream::new(listener);

        tokio::spawn(async move {
            let result = Server::builder()
                .add_service(StatementServiceServer::new(service))
                .serve_with_incoming_shutdown(incoming, async {
                    let _ = shutdown_rx.await;
                })
                .await;
            if let Err(error) = result {
                tracing::error!(%error, "mock proxy server error");
            }
        });

        Ok(Self { state, addr, shutdown_tx: Some(shutdown_tx) })
    }

    /// Returns the `host:port` address for locator construction.
    #[must_use]
    pub fn address(&self) -> String {
        format!("127.0.0.1:{}", self.addr.port())
    }

    /// Makes the next `count` requests fail with UNAVAILABLE.
    pub fn inject_unavailable(&self, count: usize) {
        self.state.unavailable_count.store(count, Ordering::SeqCst);
    }

    /// Delays every request by the given number of milliseconds.
    pub fn set_delay_ms(&self, delay: u64) {
        self.state.delay_ms.store(delay, Ordering::SeqCst);
    }

    /// Number of sessions currently open.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.state.sessions.read().len()
    }

    /// Number of connect requests served.
    #[must_use]
    pub fn connect_count(&self) -> usize {
        self.state.connect_count.load(Ordering::SeqCst)
    }

    /// Number of update requests served.
    #[must_use]
    pub fn update_count(&self) -> usize {
        self.state.update_count.load(Ordering::SeqCst)
    }

    /// Number of query requests served.
    #[must_use]
    pub fn query_count(&self) -> usize {
        self.state.query_count.load(Ordering::SeqCst)
    }

    /// Number of fetch requests served.
    #[must_use]
    pub fn fetch_count(&self) -> usize {
        self.state.fetch_count.load(Ordering::SeqCst)
    }

    /// Number of LOB uploads served.
    #[must_use]
    pub fn lob_create_count(&self) -> usize {
        self.state.lob_create_count.load(Ordering::SeqCst)
    }

    /// Number of LOB read requests served.
    #[must_use]
    pub fn lob_read_count(&self) -> usize {
        self.state.lob_read_count.load(Ordering::SeqCst)
    }

    /// Number of resource calls served.
    #[must_use]
    pub fn resource_count(&self) -> usize {
        self.state.resource_count.load(Ordering::SeqCst)
    }

    /// Number of terminate requests served.
    #[must_use]
    pub fn terminate_count(&self) -> usize {
        self.state.terminate_count.load(Ordering::SeqCst)
    }

    /// Page size of the most recent fetch request.
    #[must_use]
    pub fn last_fetch_size(&self) -> u32 {
        self.state.last_fetch_size.load(Ordering::SeqCst)
    }

    /// Returns the stored bytes of a LOB.
    #[must_use]
    pub fn lob(&self, identifier: &str) -> Option<Vec<u8>> {
        self.state.lobs.read().get(identifier).cloned()
    }

    /// Returns the (position, payload length) log of a LOB upload.
    #[must_use]
    pub fn lob_frames(&self, identifier: &str) -> Vec<(i64, usize)> {
        self.state.frame_log.read().get(identifier).cloned().unwrap_or_default()
    }

    /// Returns the SQL texts received so far.
    #[must_use]
    pub fn sql_log(&self) -> Vec<String> {
        self.state.sql_log.read().clone()
    }

    /// Stops the server.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for MockProxyServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct MockStatementService {
    state: Arc<MockState>,
}

#[tonic::async_trait]
impl StatementService for MockStatementService {
    async fn open_session(
        &self,
        _request: Request<proto::ConnectionDetails>,
    ) -> std::result::Result<Response<proto::SessionInfo>, Status> {
        self.state.check_injection().await?;
        self.state.connect_count.fetch_add(1, Ordering::SeqCst);

        let session_id = format!("sess-{}", uuid::Uuid::new_v4());
        self.state.sessions.write().insert(session_id.clone());

        let info = self.state.refresh(Some(proto::SessionInfo {
            session_id,
            ..Default::default()
        }));
        Ok(Response::new(info))
    }

    async fn execute_update(
        &self,
        request: Request<proto::StatementRequest>,
    ) -> std::result::Result<Response<proto::OpResult>, Status> {
        self.state.check_injection().await?;
        self.state.update_count.fetch_add(1, Ordering::SeqCst);

        let request = request.into_inner();
        self.state.sql_log.write().push(request.sql);

        Ok(Response::new(proto::OpResult {
            kind: proto::OpResultKind::UpdateCount as i32,
            payload: vec![1],
            session: Some(self.state.refresh(request.session)),
        }))
    }

    type ExecuteQueryStream = ReceiverStream<std::result::Result<proto::OpResult, Status>>;

    async fn execute_query(
        &self,
        request: Request<proto::StatementRequest>,
    ) -> std::result::Result<Response<Self::ExecuteQueryStream>, Status> {
        self.state.check_injection().await?;
        self.state.query_count.fetch_add(1, Ordering::SeqCst);

        let request = request.into_inner();
        self.state.sql_log.write().push(request.sql);

        let (tx, rx) = mpsc::channel(4);
        let result = proto::OpResult {
            kind: proto::OpResultKind::ResultSetId as i32,
            payload: b"rs-1".to_vec(),
            session: Some(self.state.refresh(request.session)),
        };
        tokio::spawn(async move {
            let _ = tx.send(Ok(result)).await;
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn fetch_next_rows(
        &self,
        request: Request<proto::ResultSetFetchRequest>,
    ) -> std::result::Result<Response<proto::OpResult>, Status> {
        self.state.check_injection().await?;
        self.state.fetch_count.fetch_add(1, Ordering::SeqCst);

        let request = request.into_inner();
        self.state.last_fetch_size.store(request.page_size, Ordering::SeqCst);

        Ok(Response::new(proto::OpResult {
            kind: proto::OpResultKind::RowBatch as i32,
            payload: Vec::new(),
            session: Some(self.state.refresh(request.session)),
        }))
    }

    type CreateLobStream = ReceiverStream<std::result::Result<proto::LobReference, Status>>;

    async fn create_lob(
        &self,
        request: Request<Streaming<proto::LobDataBlock>>,
    ) -> std::result::Result<Response<Self::CreateLobStream>, Status> {
        self.state.check_injection().await?;
        self.state.lob_create_count.fetch_add(1, Ordering::SeqCst);

        let state = self.state.clone();
        let mut inbound = request.into_inner();
        let (tx, rx) = mpsc::channel(4);

        tokio::spawn(async move {
            let identifier = format!("lob-{}", uuid::Uuid::new_v4());
            let mut bytes = Vec::new();
            let mut frames = Vec::new();
            let mut kind = proto::LobKind::Unspecified as i32;
            let mut session = None;
            let mut acknowledged = false;

            loop {
                match inbound.message().await {
                    Ok(Some(block)) => {
                        kind = block.kind;
                        if block.session.is_some() {
                            session = block.session.clone();
                        }
                        frames.push((block.position, block.payload.len()));
                        bytes.extend_from_slice(&block.payload);

                        if !acknowledged {
                            acknowledged = true;
                            let reference = proto::LobReference {
                                identifier: identifier.clone(),
                                session: Some(state.refresh(session.clone())),
                                kind,
                            };
                            if tx.send(Ok(reference)).await.is_err() {
                                return;
                            }
                        }
                    },
                    Ok(None) => {
                        state.lobs.write().insert(identifier.clone(), bytes);
                        state.frame_log.write().insert(identifier.clone(), frames);
                        let reference = proto::LobReference {
                            identifier,
                            session: Some(state.refresh(session)),
                            kind,
                        };
                        let _ = tx.send(Ok(reference)).await;
                        return;
                    },
                    Err(status) => {
                        let _ = tx.send(Err(status)).await;
                        return;
                    },
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    type ReadLobStream = ReceiverStream<std::result::Result<proto::LobDataBlock, Status>>;

    async fn read_lob(
        &self,
        request: Request<proto::ReadLobRequest>,
    ) -> std::result::Result<Response<Self::ReadLobStream>, Status> {
        self.state.check_injection().await?;
        self.state.lob_read_count.fetch_add(1, Ordering::SeqCst);

        let request = request.into_inner();
        let reference = request
            .reference
            .ok_or_else(|| Status::invalid_argument("missing LOB reference"))?;

        let bytes = self
            .state
            .lobs
            .read()
            .get(&reference.identifier)
            .cloned()
            .ok_or_else(|| Status::not_found("unknown LOB"))?;

        if request.position < 1 {
            return Err(Status::invalid_argument("positions are 1-based"));
        }
        let start = (request.position - 1) as usize;
        let end = start.saturating_add(request.length.max(0) as usize).min(bytes.len());
        let window = if start < bytes.len() { &bytes[start..end] } else { &[][..] };

        let session = self.state.refresh(reference.session.clone());
        let (tx, rx) = mpsc::channel(4);
        let blocks: Vec<proto::LobDataBlock> = if window.is_empty() {
            vec![proto::LobDataBlock {
                kind: reference.kind,
                session: Some(session),
                position: -1,
                payload: Vec::new(),
                metadata: Vec::new(),
            }]
        } else {
            window
                .chunks(MAX_LOB_BLOCK_SIZE)
                .enumerate()
                .map(|(i, chunk)| proto::LobDataBlock {
                    kind: reference.kind,
                    session: Some(session.clone()),
                    position: (start + 1 + i * MAX_LOB_BLOCK_SIZE) as i64,
                    payload: chunk.to_vec(),
                    metadata: Vec::new(),
                })
                .collect()
        };

        tokio::spawn(async move {
            for block in blocks {
                if tx.send(Ok(block)).await.is_err() {
                    return;
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn start_transaction(
        &self,
        request: Request<proto::SessionInfo>,
    ) -> std::result::Result<Response<proto::SessionInfo>, Status> {
        self.state.check_injection().await?;
        Ok(Response::new(self.state.refresh(Some(request.into_inner()))))
    }

    async fn commit_transaction(
        &self,
        request: Request<proto::SessionInfo>,
    ) -> std::result::Result<Response<proto::SessionInfo>, Status> {
        self.state.check_injection().await?;
        Ok(Response::new(self.state.refresh(Some(request.into_inner()))))
    }

    async fn rollback_transaction(
        &self,
        request: Request<proto::SessionInfo>,
    ) -> std::result::Result<Response<proto::SessionInfo>, Status> {
        self.state.check_injection().await?;
        Ok(Response::new(self.state.refresh(Some(request.into_inner()))))
    }

    async fn terminate_session(
        &self,
        request: Request<proto::SessionInfo>,
    ) -> std::result::Result<Response<proto::SessionTerminationStatus>, Status> {
        self.state.check_injection().await?;
        self.state.terminate_count.fetch_add(1, Ordering::SeqCst);

        let info = request.into_inner();
        let removed = self.state.sessions.write().remove(&info.session_id);
        Ok(Response::new(proto::SessionTerminationStatus { terminated: removed }))
    }

    async fn call_resource(
        &self,
        request: Request<proto::CallResourceRequest>,
    ) -> std::result::Result<Response<proto::CallResourceResponse>, Status> {
        self.state.check_injection().await?;
        self.state.resource_count.fetch_add(1, Ordering::SeqCst);

        let request = request.into_inner();
        let target = request.target.unwrap_or_default();

        let resource_kind = proto::ResourceKind::try_from(request.resource_kind)
            .unwrap_or(proto::ResourceKind::Unspecified);
        let call_kind =
            proto::CallKind::try_from(target.kind).unwrap_or(proto::CallKind::Unspecified);

        let values = match (resource_kind, call_kind) {
            (proto::ResourceKind::Lob, proto::CallKind::Length) => {
                let length = self
                    .state
                    .lobs
                    .read()
                    .get(&request.resource_id)
                    .map(|bytes| bytes.len() as u64)
                    .ok_or_else(|| Status::not_found("unknown LOB"))?;
                postcard::to_allocvec(&length)
                    .map_err(|e| Status::internal(format!("encode failed: {e}")))?
            },
            _ => Vec::new(),
        };

        Ok(Response::new(proto::CallResourceResponse {
            session: Some(self.state.refresh(request.session)),
            values,
        }))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn server_starts_on_ephemeral_port() {
        let server = MockProxyServer::start("node-a").await.unwrap();
        assert!(server.address().starts_with("127.0.0.1:"));
        assert!(!server.address().ends_with(":0"));
    }

    #[tokio::test]
    async fn counters_start_at_zero() {
        let server = MockProxyServer::start("node-a").await.unwrap();
        assert_eq!(server.connect_count(), 0);
        assert_eq!(server.update_count(), 0);
        assert_eq!(server.session_count(), 0);
        assert!(server.lob("missing").is_none());
    }

    #[tokio::test]
    async fn injection_counter_is_consumed() {
        let server = MockProxyServer::start("node-a").await.unwrap();
        server.inject_unavailable(2);
        assert!(server.state.check_injection().await.is_err());
        assert!(server.state.check_injection().await.is_err());
        assert!(server.state.check_injection().await.is_ok());
    }

    #[tokio::test]
    async fn refresh_bumps_the_state_generation() {
        let server = MockProxyServer::start("node-a").await.unwrap();
        let first = server.state.refresh(None);
        let second = server.state.refresh(None);
        assert!(second.server_state > first.server_state);
        assert_eq!(first.connection_hash, "node-a");
    }
}

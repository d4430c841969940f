//! Client-side driver for the OJP database-access proxy.
//!
//! Applications speak to a set of remote proxy servers, each fronting one
//! or more actual databases, as though they were talking to those
//! databases directly. The driver adds multi-node failover, session-sticky
//! request routing, and framed streaming for large binary and character
//! objects.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use ojp_driver::{OjpClient, DriverConfig};
//!
//! #[tokio::main]
//! async fn main() -> ojp_driver::Result<()> {
//!     let client = OjpClient::with_defaults(
//!         "jdbc:ojp[proxy1:1059,proxy2:1059]_postgresql://db:5432/app",
//!     )?;
//!
//!     let session = client.connect("app", "secret").await?;
//!     client.execute_update(&session, "DELETE FROM staging", &()).await?;
//!     client.terminate_session(&session).await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     OjpClient (public API)                  │
//! │  .connect() │ .execute_*() │ .create_lob() │ .call_resource │
//! ├─────────────────────────────────────────────────────────────┤
//! │                     Dispatch template                       │
//! │   Retry/failover │ Session adoption │ Outbound size guard  │
//! ├─────────────────────────────────────────────────────────────┤
//! │                     Connection manager                      │
//! │   Round-robin cursor │ Session pins │ Recovery sweep       │
//! ├─────────────────────────────────────────────────────────────┤
//! │                     Channel cache                           │
//! │   One handle per endpoint │ Lazy connect │ Evict on failure │
//! ├─────────────────────────────────────────────────────────────┤
//! │                     Tonic gRPC transport                    │
//! └─────────────────────────────────────────────────────────────┘
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod channel;
mod client;
pub mod codec;
mod config;
mod endpoint;
mod error;
pub mod locator;
mod lob;
pub mod mock;
mod resource;
mod routing;
mod session;

// Public API exports
pub use client::{OjpClient, QueryStream, StatementOptions};
pub use config::{
    DEFAULT_CONNECT_TIMEOUT, DEFAULT_RETRY_ATTEMPTS, DEFAULT_RETRY_DELAY, DriverConfig,
    DriverConfigBuilder,
};
pub use endpoint::{Endpoint, EndpointSet};
pub use error::{DriverError, LobWritePhase, Result};
pub use lob::{LobReader, LobWriteOptions, LobWriter};
pub use resource::ResourceCall;
pub use session::Session;

// Re-export the wire contract
pub use ojp_proto::{
    DEFAULT_MAX_MESSAGE_SIZE, LARGE_MAX_MESSAGE_SIZE, MAX_LOB_BLOCK_SIZE,
    ROWS_PER_RESULT_SET_BLOCK, proto,
};

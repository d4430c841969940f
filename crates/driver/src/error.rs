//! Driver error types with retryability classification.
//!
//! Provides a two-tier error model:
//! - **Transport errors**: connection failures, gRPC status codes reported
//!   by the channel. These are candidates for failover to another endpoint.
//! - **Driver errors**: locator parsing, configuration, framing and LOB
//!   protocol violations. These are terminal and surface unchanged.
//!
//! The [`From<tonic::Status>`](#impl-From<Status>-for-DriverError)
//! conversion is the error mapper: it translates transport status codes
//! into the driver taxonomy; unknown statuses become [`DriverError::Remote`]
//! carrying the original code and message.

use snafu::{Location, Snafu};
use tonic::Code;

/// Result type alias for driver operations.
pub type Result<T> = std::result::Result<T, DriverError>;

/// Phase of a LOB write that failed, reported by
/// [`LobWriter::finish`](crate::lob::LobWriter::finish).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LobWritePhase {
    /// Framing or transmission of data blocks failed.
    Send,
    /// The returned reference did not pass validation.
    Validate,
    /// Adopting the replacement session from the final reference failed.
    RefreshSession,
}

impl std::fmt::Display for LobWritePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let phase = match self {
            Self::Send => "send",
            Self::Validate => "validate",
            Self::RefreshSession => "refresh-session",
        };
        f.write_str(phase)
    }
}

/// Driver error taxonomy.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum DriverError {
    /// The composite locator could not be parsed.
    #[snafu(display("invalid locator: {message}"))]
    InvalidLocator {
        /// What was wrong with the locator.
        message: String,
    },

    /// Configuration validation failed.
    #[snafu(display("invalid configuration: {message}"))]
    InvalidConfig {
        /// What was wrong with the configuration.
        message: String,
    },

    /// The router found no candidate endpoint after a recovery sweep and
    /// the configured retries were exhausted.
    #[snafu(display("no healthy endpoints available"))]
    NoHealthyEndpoints,

    /// The transport reported the endpoint unavailable.
    #[snafu(display("endpoint unavailable: {message}"))]
    Unavailable {
        /// Status message from the transport.
        message: String,
    },

    /// The transport deadline elapsed before a response arrived.
    #[snafu(display("transport deadline exceeded: {message}"))]
    DeadlineExceeded {
        /// Status message from the transport.
        message: String,
    },

    /// Channel-level failure (connect, HTTP/2, TLS).
    #[snafu(display("transport error at {location}: {source}"))]
    Transport {
        /// Underlying transport error.
        source: tonic::transport::Error,
        /// Source location.
        #[snafu(implicit)]
        location: Location,
    },

    /// An outbound message exceeded the configured size ceiling. Rejected
    /// locally, before entering the transport.
    #[snafu(display("outbound message too large: {size} bytes exceeds limit of {limit}"))]
    MessageTooLarge {
        /// Encoded size of the rejected message.
        size: usize,
        /// Configured ceiling.
        limit: usize,
    },

    /// The server returned a database-level error. Surfaced as-is, never
    /// retried.
    #[snafu(display("remote failure (code={code:?}): {message}"))]
    Remote {
        /// gRPC status code reported by the server.
        code: Code,
        /// Error message from the server.
        message: String,
    },

    /// A LOB write completed without a usable reference identifier.
    #[snafu(display("LOB write yielded no reference identifier"))]
    LobReferenceMissing,

    /// A LOB write failed, annotated with the phase that failed.
    #[snafu(display("LOB write failed during {phase}: {source}"))]
    LobWrite {
        /// Which close phase failed.
        phase: LobWritePhase,
        /// The underlying failure.
        source: Box<DriverError>,
    },

    /// Block framing or stream sequencing violated the wire contract.
    #[snafu(display("protocol violation: {message}"))]
    Protocol {
        /// Description of the violation.
        message: String,
    },

    /// The caller cancelled the operation or shut the client down.
    #[snafu(display("operation cancelled"))]
    Cancelled,

    /// Serialization of a properties/parameters/return-value blob failed.
    #[snafu(display("codec error: {source}"))]
    Codec {
        /// Underlying postcard error.
        source: postcard::Error,
    },
}

impl DriverError {
    /// Returns true if the failure is transport-classified and the
    /// dispatcher may retry the call on another endpoint.
    ///
    /// Retryable: `Unavailable`, `DeadlineExceeded`, and channel-level
    /// `Transport` failures. Everything else is terminal.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Unavailable { .. } | Self::DeadlineExceeded { .. } | Self::Transport { .. }
        )
    }

    /// Returns the gRPC status code if this error carries one.
    #[must_use]
    pub fn code(&self) -> Option<Code> {
        match self {
            Self::Remote { code, .. } => Some(*code),
            Self::Unavailable { .. } => Some(Code::Unavailable),
            Self::DeadlineExceeded { .. } => Some(Code::DeadlineExceeded),
            Self::Cancelled => Some(Code::Cancelled),
            _ => None,
        }
    }

    /// Wraps an error with the LOB write phase it occurred in.
    pub(crate) fn in_write_phase(self, phase: LobWritePhase) -> Self {
        Self::LobWrite { phase, source: Box::new(self) }
    }
}

impl From<tonic::transport::Error> for DriverError {
    fn from(source: tonic::transport::Error) -> Self {
        Self::Transport { source, location: Location::default() }
    }
}

impl From<tonic::Status> for DriverError {
    fn from(status: tonic::Status) -> Self {
        let message = status.message().to_owned();
        match status.code() {
            Code::Unavailable => Self::Unavailable { message },
            Code::DeadlineExceeded => Self::DeadlineExceeded { message },
            Code::Cancelled => Self::Cancelled,
            code => Self::Remote { code, message },
        }
    }
}

//! Protobuf types and wire constants for the OJP proxy protocol.
//!
//! This crate provides:
//! - Generated protobuf types and gRPC service traits ([`proto`])
//! - The framing constants that are part of the wire contract
//!
//! # Architecture
//!
//! Kept separate from the driver crate so that tooling needing only
//! wire-format types (e.g., test harnesses) can avoid pulling in the
//! driver's routing machinery.

#![deny(unsafe_code)]
// gRPC services return tonic::Status - standard practice for gRPC error handling
#![allow(clippy::result_large_err)]

/// Generated protobuf types and service traits.
pub mod proto {
    #![allow(clippy::all)]
    #![allow(missing_docs)]

    tonic::include_proto!("ojp.v1");
}

/// Maximum payload bytes per [`proto::LobDataBlock`]. Part of the wire
/// contract for both transfer directions.
pub const MAX_LOB_BLOCK_SIZE: usize = 1024;

/// Number of rows the server packs into one result-set data block.
pub const ROWS_PER_RESULT_SET_BLOCK: u32 = 100;

/// Default message size ceiling (4 MiB), applied to outbound messages by
/// the driver's local guard and to inbound messages at channel build.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Message size ceiling for the large-message channel profile (16 MiB).
pub const LARGE_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

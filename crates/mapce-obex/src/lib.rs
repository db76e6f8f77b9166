//! # MCE OBEX
//!
//! Generic OBEX layer for the MAP client equipment stack.
//!
//! This crate provides:
//! - Packet and header-set encoding/decoding
//! - Application-parameter TLV block codec
//! - Client-side multi-packet engine (PUT/GET fragmentation, SRM flow
//!   control, deferred abort, multi-segment SETPATH)
//! - Server-side session used by the notification-receiving role
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │              ObexSession / ObexServerSession             │
//! │   (multi-packet state machines, one op in flight)       │
//! ├─────────────────────────────────────────────────────────┤
//! │                      HeaderSet                           │
//! │   (typed OBEX headers, app-parameter TLV block)         │
//! ├─────────────────────────────────────────────────────────┤
//! │                      PacketSink                          │
//! │   (transport boundary, one encoded packet per call)     │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! The engines are deliberately transport-free: outgoing packets go through
//! a [`PacketSink`] and incoming packets are fed to `handle_packet`. This
//! crate knows nothing about MAP semantics.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod header;
pub mod server;
pub mod session;
pub mod tlv;

pub use error::ObexError;
pub use header::{
    build_request, build_response, header_id, opcode, response_code, srm_value, srmp_value,
    ConnectFields, HeaderSet, ObexResponse, RequestPacket, ResponseCode,
};
pub use server::{ObexServerSession, ServerConfig, ServerEvent};
pub use session::{ObexOp, ObexSession, PacketSink, PathSegment, SessionEvent};
pub use tlv::TlvBlock;

/// OBEX protocol version (1.0 encoded as BCD)
pub const OBEX_VERSION: u8 = 0x10;

/// Smallest OBEX packet length a peer may advertise
pub const MIN_PACKET_LENGTH: u16 = 255;

/// Default maximum packet length advertised on CONNECT
pub const DEFAULT_PACKET_LENGTH: u16 = 0x8000;

/// Fixed request/response prefix: code + 2-byte length
pub const PACKET_PREFIX_SIZE: usize = 3;

/// Extra fields carried by CONNECT requests and responses
pub const CONNECT_FIELDS_SIZE: usize = 4;

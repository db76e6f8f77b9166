//! # MCE transport boundary
//!
//! The lower Bluetooth stack (SDP, GAP, RFCOMM, L2CAP) is an external
//! collaborator; this crate pins down its interface:
//!
//! - [`addr::Address`] — remote device addressing
//! - [`sdp`] — MAS attribute ids and discovered record data
//! - [`stack`] — the [`stack::BluetoothStack`] and
//!   [`stack::ObexTransport`] traits, transport events, MNS registration
//! - [`mem`] — in-memory transports and a scriptable stack for tests
//!
//! Transports deliver inbound traffic as owned [`stack::TransportEvent`]s
//! over a channel; business logic never blocks in a stack callback.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod addr;
pub mod mem;
pub mod sdp;
pub mod stack;

pub use addr::Address;
pub use mem::{link_pair, MemLink, MemTransport, PeerEndpoint, ScriptedStack};
pub use sdp::{attribute, MasRecord};
pub use stack::{
    BluetoothStack, IncomingConnection, MnsRegistration, ObexTransport, TransportError,
    TransportEvent, TransportKind, TransportLink, TransportResult, TransportTarget,
};

//! Bluetooth stack trait boundary.
//!
//! Everything below OBEX lives behind [`BluetoothStack`]: SDP searches,
//! GAP service security, transport channel establishment, and MNS service
//! registration. Implementations hand inbound traffic to the profile as
//! owned [`TransportEvent`]s over a channel; no shared mutable state
//! crosses the boundary.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::addr::Address;
use crate::sdp::MasRecord;

/// Transport layer errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// SDP search failed
    #[error("sdp search failed: {0}")]
    Sdp(String),

    /// GAP security request failed
    #[error("security request failed: {0}")]
    Security(String),

    /// Peer-initiated simultaneous connect detected during setup
    #[error("connection collision")]
    Collision,

    /// Channel establishment failed
    #[error("transport connect failed: {0}")]
    ConnectFailed(String),

    /// Transport is closed
    #[error("transport closed")]
    Closed,

    /// Outgoing packet was rejected
    #[error("transport send failed: {0}")]
    SendFailed(String),

    /// Service/SDP record registration failed
    #[error("service registration failed: {0}")]
    Registration(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Channel type under the OBEX session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// RFCOMM (GOEP 1.1); the lower layer gates security during connect
    Rfcomm,
    /// L2CAP (GOEP 2.0); the profile requests security itself
    L2cap,
}

/// Fully resolved channel endpoint on a remote device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportTarget {
    /// Remote device address
    pub address: Address,
    /// Channel type
    pub kind: TransportKind,
    /// RFCOMM channel number or L2CAP PSM
    pub channel: u16,
}

/// Events raised by an open transport
#[derive(Debug)]
pub enum TransportEvent {
    /// One complete OBEX packet
    Packet(Vec<u8>),
    /// Raw transport backpressure edge
    Busy(bool),
    /// Transport went down; `clean` distinguishes an orderly close from
    /// an abrupt failure
    Closed {
        /// True for peer-initiated orderly shutdown
        clean: bool,
    },
}

/// An open OBEX-bearing transport channel
pub trait ObexTransport: Send + Sync {
    /// Queue one packet for transmission.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Closed`] or
    /// [`TransportError::SendFailed`] when the channel is down.
    fn send_packet(&self, packet: Vec<u8>) -> TransportResult<()>;

    /// Largest packet the channel can carry
    fn max_packet_size(&self) -> u16;

    /// Close the channel; the peer observes a clean shutdown
    fn close(&self);
}

/// An open transport plus its inbound event stream
pub struct TransportLink {
    /// Send-side handle
    pub handle: Arc<dyn ObexTransport>,
    /// Inbound events; dropped when the transport dies
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Inbound MNS connection handed up by the stack
pub struct IncomingConnection {
    /// Peer device address
    pub peer: Address,
    /// Channel type the peer chose
    pub kind: TransportKind,
    /// The accepted transport
    pub link: TransportLink,
}

/// Parameters for MNS service registration
#[derive(Debug, Clone)]
pub struct MnsRegistration {
    /// RFCOMM server channel to publish
    pub rfcomm_channel: u8,
    /// L2CAP PSM to publish
    pub l2cap_psm: u16,
    /// SDP service name
    pub service_name: String,
}

/// The lower Bluetooth stack, as seen by the profile.
#[async_trait]
pub trait BluetoothStack: Send + Sync {
    /// Run an SDP attribute search for MAS records on `address`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Sdp`] when the search itself fails. A
    /// successful search with no MAS services returns an empty vector.
    async fn sdp_search_mas(&self, address: Address) -> TransportResult<Vec<MasRecord>>;

    /// Request GAP service security for `target`. Only required for
    /// L2CAP; RFCOMM security is gated by the lower layer during its own
    /// connect.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Collision`] when the peer initiated a
    /// simultaneous connect, or [`TransportError::Security`] on failure.
    async fn request_security(&self, target: &TransportTarget) -> TransportResult<()>;

    /// Open an OBEX-bearing channel to `target`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectFailed`] when the channel cannot
    /// be established.
    async fn connect_transport(&self, target: &TransportTarget) -> TransportResult<TransportLink>;

    /// Publish the MNS service record and security entries for both
    /// transports, and start listening. Inbound connections arrive on the
    /// returned channel.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Registration`] when the record or the
    /// listeners cannot be set up.
    fn register_mns(
        &self,
        registration: MnsRegistration,
    ) -> TransportResult<mpsc::UnboundedReceiver<IncomingConnection>>;
}

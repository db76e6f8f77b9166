//! Per-instance OBEX client.
//!
//! Owns one OBEX session bound to one MAS instance, enforces the
//! single-in-flight-request discipline, and keeps the FIFO queue of
//! pending requests. Connection sequencing (security, transport open) is
//! driven by the instance state machine; this type only deals with the
//! OBEX exchanges themselves.

use std::collections::VecDeque;
use std::sync::Arc;

use mapce_obex::{
    HeaderSet, ObexError, ObexSession, PacketSink, SessionEvent, TlvBlock, DEFAULT_PACKET_LENGTH,
};
use mapce_transport::{MasRecord, ObexTransport, TransportKind, TransportTarget};

use crate::error::{MapError, Result};
use crate::params::tag;
use crate::request::{MapRequest, RequestOutcome};
use crate::types::{Address, MasInstanceInfo, MAS_TARGET_UUID};

/// MapSupportedFeatures advertised by this client on OBEX CONNECT
pub const MCE_SUPPORTED_FEATURES: u32 = 0x0000_007F;

/// Adapts an open transport to the engine's packet boundary
pub(crate) struct SinkAdapter {
    transport: Arc<dyn ObexTransport>,
}

impl SinkAdapter {
    pub(crate) fn new(transport: Arc<dyn ObexTransport>) -> Self {
        Self { transport }
    }
}

impl PacketSink for SinkAdapter {
    fn send_packet(&self, packet: Vec<u8>) -> mapce_obex::error::Result<()> {
        self.transport
            .send_packet(packet)
            .map_err(|e| ObexError::Transport(e.to_string()))
    }
}

/// A request together with its origin
#[derive(Debug)]
pub struct PendingRequest {
    /// The request itself
    pub request: MapRequest,
    /// True for requests issued by the connect sequence; their outcomes
    /// never reach the observer
    pub internal: bool,
}

/// Result of the common response processor
pub struct ProcResult {
    /// Outcome from the current request's parser
    pub outcome: RequestOutcome,
    /// True when the finished (or continuing) request is internal
    pub internal: bool,
    /// The request, handed back once its slot is released
    pub finished: Option<MapRequest>,
}

/// OBEX client for one MAS instance
pub struct InstanceClient {
    address: Address,
    sdp: MasRecord,
    target: TransportTarget,
    session: Option<ObexSession<SinkAdapter>>,
    transport: Option<Arc<dyn ObexTransport>>,
    current: Option<PendingRequest>,
    queue: VecDeque<PendingRequest>,
    owner_uci: Option<String>,
}

impl InstanceClient {
    /// Create a client for one discovered instance
    pub fn new(address: Address, sdp: MasRecord, target: TransportTarget) -> Self {
        Self {
            address,
            sdp,
            target,
            session: None,
            transport: None,
            current: None,
            queue: VecDeque::new(),
            owner_uci: None,
        }
    }

    /// Remote device address
    #[must_use]
    pub fn address(&self) -> Address {
        self.address
    }

    /// Resolved transport endpoint for this instance
    #[must_use]
    pub fn target(&self) -> TransportTarget {
        self.target
    }

    /// Immutable SDP parameters for this instance
    #[must_use]
    pub fn sdp_param(&self) -> &MasRecord {
        &self.sdp
    }

    /// Instance metadata, including the owner UCI once learned
    #[must_use]
    pub fn instance_info(&self) -> MasInstanceInfo {
        MasInstanceInfo {
            is_valid: true,
            instance_id: self.sdp.instance_id,
            supported_message_types: self.sdp.supported_message_types,
            supported_features: self.sdp.supported_features,
            owner_uci: self.owner_uci.clone(),
        }
    }

    /// Record the owner UCI learned from the instance-information request
    pub fn set_owner_uci(&mut self, uci: Option<String>) {
        self.owner_uci = uci;
    }

    /// Owner UCI, when known
    #[must_use]
    pub fn owner_uci(&self) -> Option<&str> {
        self.owner_uci.as_deref()
    }

    /// True while a request occupies the in-flight slot
    #[must_use]
    pub fn has_current(&self) -> bool {
        self.current.is_some()
    }

    /// Number of queued requests
    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// True while the session has an active send or receive object
    #[must_use]
    pub fn is_transfer_active(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(ObexSession::is_transfer_active)
    }

    /// Issue the OBEX CONNECT over a freshly opened transport. SRM is
    /// negotiated only on L2CAP (GOEP 2.0); the MAP supported-features
    /// parameter is included when the peer's record advertised one.
    ///
    /// # Errors
    ///
    /// Propagates transport failure from the CONNECT send.
    pub fn begin_obex_connect(&mut self, transport: Arc<dyn ObexTransport>) -> Result<()> {
        let mtu = transport.max_packet_size().min(DEFAULT_PACKET_LENGTH);
        let srm = self.target.kind == TransportKind::L2cap;
        let mut session = ObexSession::new(
            SinkAdapter {
                transport: Arc::clone(&transport),
            },
            mtu,
            srm,
        );
        let mut headers = HeaderSet::new();
        headers.set_target(&MAS_TARGET_UUID);
        if self.sdp.supported_features.is_some() {
            let mut params = TlvBlock::new();
            params.push_u32(tag::MAP_SUPPORTED_FEATURES, MCE_SUPPORTED_FEATURES);
            headers.set_app_params(params.encode());
        }
        session.connect(headers)?;
        self.session = Some(session);
        self.transport = Some(transport);
        Ok(())
    }

    /// True once the OBEX session is connected
    #[must_use]
    pub fn is_obex_connected(&self) -> bool {
        self.session.as_ref().is_some_and(ObexSession::is_connected)
    }

    /// Feed one raw packet to the session.
    ///
    /// # Errors
    ///
    /// Propagates parse and transport failures.
    pub fn handle_packet(&mut self, data: &[u8]) -> Result<Option<SessionEvent>> {
        let session = self.session.as_mut().ok_or(MapError::NotConnected)?;
        Ok(session.handle_packet(data)?)
    }

    /// Forward a transport backpressure edge.
    ///
    /// # Errors
    ///
    /// Propagates transport failure from resumed sends.
    pub fn set_transport_busy(&mut self, busy: bool) -> Result<()> {
        if let Some(session) = self.session.as_mut() {
            session.set_transport_busy(busy)?;
        }
        Ok(())
    }

    /// Make `request` current and issue its exchange. Fails with
    /// `RequestInFlight` when a request is already current; on any
    /// failure the request is handed back for failure reporting.
    ///
    /// # Errors
    ///
    /// `RequestInFlight`, `NotConnected`, or the underlying send error,
    /// paired with the unstarted request.
    pub fn client_send_request(
        &mut self,
        mut pending: PendingRequest,
    ) -> std::result::Result<(), (MapError, PendingRequest)> {
        if self.current.is_some() {
            return Err((MapError::RequestInFlight, pending));
        }
        let Some(session) = self.session.as_mut() else {
            return Err((MapError::NotConnected, pending));
        };
        if let Err(e) = pending.request.start(session) {
            return Err((e.into(), pending));
        }
        tracing::debug!(
            "request {} in flight on instance {}",
            pending.request.name(),
            self.sdp.instance_id
        );
        self.current = Some(pending);
        Ok(())
    }

    /// Append a request to the FIFO queue
    pub fn client_save_request(&mut self, pending: PendingRequest) {
        tracing::debug!(
            "request {} queued on instance {} (depth {})",
            pending.request.name(),
            self.sdp.instance_id,
            self.queue.len() + 1
        );
        self.queue.push_back(pending);
    }

    /// Drain the queue into the in-flight slot. Requests whose send
    /// fails are skipped and returned for failure reporting.
    pub fn client_send_saved_request(&mut self) -> Vec<PendingRequest> {
        let mut skipped = Vec::new();
        while self.current.is_none() {
            let Some(pending) = self.queue.pop_front() else {
                break;
            };
            match self.client_send_request(pending) {
                Ok(()) => break,
                Err((e, pending)) => {
                    tracing::warn!("queued request send failed, skipping: {e}");
                    skipped.push(pending);
                }
            }
        }
        skipped
    }

    /// Dispatch a session event to the current request and map its
    /// continuation code.
    pub fn client_proc_response(&mut self, event: &SessionEvent) -> Option<ProcResult> {
        let session = self.session.as_mut()?;
        let pending = self.current.as_mut()?;
        let outcome = pending.request.handle_event(session, event);
        let internal = pending.internal;
        let finished = if outcome.continuation.is_terminal() {
            self.current.take().map(|p| p.request)
        } else {
            None
        };
        Some(ProcResult {
            outcome,
            internal,
            finished,
        })
    }

    /// Issue the OBEX DISCONNECT.
    ///
    /// # Errors
    ///
    /// Propagates transport failure; callers treat that the same as a
    /// completed disconnect.
    pub fn start_client_disconnect(&mut self) -> Result<()> {
        let session = self.session.as_mut().ok_or(MapError::NotConnected)?;
        session.disconnect()?;
        Ok(())
    }

    /// Request a deferred abort of the active transfer.
    ///
    /// # Errors
    ///
    /// Fails when no transfer is active.
    pub fn abort_current(&mut self) -> Result<()> {
        let session = self.session.as_mut().ok_or(MapError::NotConnected)?;
        session.abort()?;
        Ok(())
    }

    /// Drop every queued request without sending, returning the
    /// non-internal ones for failure reporting
    pub fn discard_queue(&mut self) -> Vec<PendingRequest> {
        self.queue.drain(..).filter(|p| !p.internal).collect()
    }

    /// Tear down session and transport. Returns every owned request
    /// (current first, then the queue, internals excluded) so the caller
    /// can synthesize failure completions; nothing is leaked.
    pub fn teardown(&mut self) -> Vec<PendingRequest> {
        if let Some(session) = self.session.as_mut() {
            session.reset();
        }
        self.session = None;
        if let Some(transport) = self.transport.take() {
            transport.close();
        }
        let mut orphaned = Vec::new();
        if let Some(current) = self.current.take() {
            if !current.internal {
                orphaned.push(current);
            }
        }
        orphaned.extend(self.queue.drain(..).filter(|p| !p.internal));
        orphaned
    }
}

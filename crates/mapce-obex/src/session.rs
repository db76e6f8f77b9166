//! Client-side OBEX session with multi-packet PUT/GET support.
//!
//! The session is a sans-I/O state machine: outgoing packets are handed to
//! a [`PacketSink`], incoming packets are fed to [`ObexSession::handle_packet`]
//! and surface as [`SessionEvent`]s. One send object and one receive object
//! may be active per session at a time.
//!
//! Single Response Mode: on each CONTINUE response the peer may grant SRM
//! and may additionally request an SRMP wait. While SRM is enabled and not
//! waiting, PUT chunks are sent back-to-back without per-chunk
//! acknowledgment, subject to transport backpressure; GET responses stream
//! in without per-fragment requests.

use std::collections::VecDeque;

use crate::error::{ObexError, Result};
use crate::header::{
    build_request, header_id, opcode, srm_value, srmp_value, HeaderSet, ObexResponse, ResponseCode,
};
use crate::{CONNECT_FIELDS_SIZE, MIN_PACKET_LENGTH, OBEX_VERSION, PACKET_PREFIX_SIZE};

/// Boundary for outgoing packets. One encoded OBEX packet per call.
pub trait PacketSink: Send {
    /// Queue one packet for transmission.
    ///
    /// # Errors
    ///
    /// Returns an error when the transport has failed; the session treats
    /// this as fatal for the active operation.
    fn send_packet(&self, packet: Vec<u8>) -> Result<()>;
}

/// OBEX operations, as reported in completion events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObexOp {
    /// CONNECT exchange
    Connect,
    /// DISCONNECT exchange
    Disconnect,
    /// Multi-packet PUT
    Put,
    /// Multi-packet GET
    Get,
    /// Multi-segment SETPATH
    SetPath,
    /// ABORT exchange
    Abort,
}

/// One path segment for a SETPATH sequence
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    /// Go to the folder root
    Root,
    /// Go up one level
    Up,
    /// Descend into a named child folder
    Down(String),
}

/// Events produced by the session
#[derive(Debug)]
pub enum SessionEvent {
    /// CONNECT exchange finished; inspect `response.code`
    ConnectComplete {
        /// Peer response, connect fields populated on success
        response: ObexResponse,
    },
    /// A PUT completed, or a GET terminated with a failure code
    ActionCompleted {
        /// The operation that completed
        op: ObexOp,
        /// Terminal peer response
        response: ObexResponse,
    },
    /// A GET completed successfully; `response` carries the fully
    /// assembled body as a single End-of-Body header
    GetDataAvailable {
        /// Synthesized unified response
        response: ObexResponse,
    },
    /// SETPATH sequence finished
    SetPathCompleted {
        /// SUCCESS when every segment was accepted
        code: ResponseCode,
    },
    /// A deferred abort finished; send and receive objects are freed
    AbortCompleted,
    /// DISCONNECT exchange finished
    DisconnectComplete {
        /// Peer response code
        code: ResponseCode,
    },
}

/// Outgoing object being chunked across PUT packets
#[derive(Debug)]
struct SendObject {
    headers: HeaderSet,
    body: Vec<u8>,
    offset: usize,
    first_sent: bool,
    awaiting_response: bool,
    done: bool,
}

/// Incoming object being assembled across GET responses
#[derive(Debug, Default)]
struct ReceivedObject {
    headers: HeaderSet,
    body: Vec<u8>,
}

impl ReceivedObject {
    fn absorb(&mut self, response: &ObexResponse) {
        if let Some(b) = response.headers.body() {
            self.body.extend_from_slice(b);
        }
        if let Some(b) = response.headers.end_of_body() {
            self.body.extend_from_slice(b);
        }
        // first occurrence of non-body metadata wins
        if self.headers.app_params().is_none() {
            if let Some(p) = response.headers.app_params() {
                self.headers.set_app_params(p.to_vec());
            }
        }
        if self.headers.name().is_none() {
            if let Some(n) = response.headers.name() {
                self.headers.set_name(n);
            }
        }
    }

    fn into_response(mut self) -> ObexResponse {
        let body = std::mem::take(&mut self.body);
        self.headers.set_end_of_body(body);
        ObexResponse {
            code: ResponseCode::SUCCESS,
            connect: None,
            headers: self.headers,
        }
    }
}

#[derive(Debug)]
enum ActiveOp {
    Idle,
    Connecting,
    Disconnecting,
    Put,
    Get { srmp_remaining: u8 },
    SetPath { remaining: VecDeque<PathSegment> },
    Aborting,
}

impl ActiveOp {
    fn is_idle(&self) -> bool {
        matches!(self, ActiveOp::Idle)
    }
}

/// Client-side OBEX session
pub struct ObexSession<S: PacketSink> {
    sink: S,
    local_max_packet: u16,
    peer_max_packet: u16,
    connected: bool,
    connection_id: Option<u32>,
    srm_supported: bool,
    srm_enabled: bool,
    srm_wait: bool,
    transport_busy: bool,
    op: ActiveOp,
    send_obj: Option<SendObject>,
    recv_obj: Option<ReceivedObject>,
    pending_abort: bool,
}

impl<S: PacketSink> ObexSession<S> {
    /// Create a session over `sink`. `local_max_packet` is advertised on
    /// CONNECT; `srm_supported` enables SRM negotiation for transfers.
    pub fn new(sink: S, local_max_packet: u16, srm_supported: bool) -> Self {
        Self {
            sink,
            local_max_packet: local_max_packet.max(MIN_PACKET_LENGTH),
            peer_max_packet: MIN_PACKET_LENGTH,
            connected: false,
            connection_id: None,
            srm_supported,
            srm_enabled: false,
            srm_wait: false,
            transport_busy: false,
            op: ActiveOp::Idle,
            send_obj: None,
            recv_obj: None,
            pending_abort: false,
        }
    }

    /// True once the CONNECT exchange succeeded
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Negotiated connection id, if the peer assigned one
    #[must_use]
    pub fn connection_id(&self) -> Option<u32> {
        self.connection_id
    }

    /// Peer's negotiated maximum packet length
    #[must_use]
    pub fn peer_max_packet(&self) -> u16 {
        self.peer_max_packet
    }

    /// True while a send or receive object is active ("continuous"
    /// transfer activity, input to the busy aggregation)
    #[must_use]
    pub fn is_transfer_active(&self) -> bool {
        self.send_obj.is_some() || self.recv_obj.is_some()
    }

    /// Start the CONNECT exchange.
    ///
    /// # Errors
    ///
    /// Fails when another operation is in flight or the transport rejects
    /// the packet.
    pub fn connect(&mut self, headers: HeaderSet) -> Result<()> {
        if !self.op.is_idle() {
            return Err(ObexError::OperationInProgress);
        }
        let mut extra = [0u8; CONNECT_FIELDS_SIZE];
        extra[0] = OBEX_VERSION;
        extra[1] = 0;
        extra[2..4].copy_from_slice(&self.local_max_packet.to_be_bytes());
        self.sink
            .send_packet(build_request(opcode::CONNECT, &extra, &headers))?;
        self.op = ActiveOp::Connecting;
        Ok(())
    }

    /// Start the DISCONNECT exchange.
    ///
    /// # Errors
    ///
    /// Fails when another operation is in flight or on transport failure.
    pub fn disconnect(&mut self) -> Result<()> {
        if !self.op.is_idle() {
            return Err(ObexError::OperationInProgress);
        }
        let mut headers = HeaderSet::new();
        if let Some(id) = self.connection_id {
            headers.set_connection_id(id);
        }
        self.sink
            .send_packet(build_request(opcode::DISCONNECT, &[], &headers))?;
        self.op = ActiveOp::Disconnecting;
        Ok(())
    }

    /// Start a multi-packet PUT. `headers` must not carry Body or
    /// End-of-Body; the engine manages chunking against the negotiated
    /// packet length.
    ///
    /// # Errors
    ///
    /// Fails when body headers were supplied directly, another transfer is
    /// active, or the first-packet headers exceed the packet length.
    pub fn put(&mut self, mut headers: HeaderSet, body: Vec<u8>) -> Result<()> {
        if headers.contains(header_id::BODY) || headers.contains(header_id::END_OF_BODY) {
            return Err(ObexError::BodyNotAllowed);
        }
        if !self.op.is_idle() || self.is_transfer_active() {
            return Err(ObexError::OperationInProgress);
        }
        if !self.connected {
            return Err(ObexError::NotConnected);
        }
        if let Some(id) = self.connection_id {
            headers.set_connection_id(id);
        }
        if self.srm_supported {
            headers.set_srm(srm_value::ENABLE);
        }
        self.srm_enabled = false;
        self.srm_wait = false;
        self.send_obj = Some(SendObject {
            headers,
            body,
            offset: 0,
            first_sent: false,
            awaiting_response: false,
            done: false,
        });
        self.op = ActiveOp::Put;
        self.pump_send()
    }

    /// Start a multi-packet GET. `srmp_count` is the number of SRMP "wait"
    /// rounds requested from the peer while SRM is active.
    ///
    /// # Errors
    ///
    /// Fails when another transfer is active or on transport failure.
    pub fn get(&mut self, mut headers: HeaderSet, srmp_count: u8) -> Result<()> {
        if !self.op.is_idle() || self.is_transfer_active() {
            return Err(ObexError::OperationInProgress);
        }
        if !self.connected {
            return Err(ObexError::NotConnected);
        }
        if let Some(id) = self.connection_id {
            headers.set_connection_id(id);
        }
        if self.srm_supported {
            headers.set_srm(srm_value::ENABLE);
        }
        let mut srmp_remaining = srmp_count;
        if srmp_remaining > 0 {
            headers.set_srmp(srmp_value::WAIT);
            srmp_remaining -= 1;
        }
        self.srm_enabled = false;
        self.srm_wait = false;
        self.recv_obj = Some(ReceivedObject::default());
        self.sink
            .send_packet(build_request(opcode::GET_FINAL, &[], &headers))?;
        self.op = ActiveOp::Get { srmp_remaining };
        Ok(())
    }

    /// Start a multi-segment SETPATH sequence. Segments are issued one
    /// request at a time, advancing only on SUCCESS.
    ///
    /// # Errors
    ///
    /// Fails when another operation is in flight, the segment list is
    /// empty, or on transport failure.
    pub fn set_path(&mut self, segments: Vec<PathSegment>) -> Result<()> {
        if !self.op.is_idle() {
            return Err(ObexError::OperationInProgress);
        }
        if !self.connected {
            return Err(ObexError::NotConnected);
        }
        let mut remaining: VecDeque<PathSegment> = segments.into();
        let Some(first) = remaining.pop_front() else {
            return Err(ObexError::NoActiveOperation);
        };
        self.send_setpath_segment(&first)?;
        self.op = ActiveOp::SetPath { remaining };
        Ok(())
    }

    /// Request an abort of the active transfer. The ABORT packet is
    /// deferred until the in-flight chunk exchange resolves.
    ///
    /// # Errors
    ///
    /// Fails when no transfer is active.
    pub fn abort(&mut self) -> Result<()> {
        match self.op {
            ActiveOp::Put | ActiveOp::Get { .. } => {
                self.pending_abort = true;
                Ok(())
            }
            _ => Err(ObexError::NoActiveOperation),
        }
    }

    /// Transport backpressure signal. Clearing busy resumes a paused
    /// chunk loop.
    ///
    /// # Errors
    ///
    /// Propagates transport failure from resumed sends.
    pub fn set_transport_busy(&mut self, busy: bool) -> Result<()> {
        self.transport_busy = busy;
        if !busy && matches!(self.op, ActiveOp::Put) {
            self.pump_send()?;
        }
        Ok(())
    }

    /// Drop all transfer state after a transport loss. No packets are
    /// sent; the session becomes disconnected and idle.
    pub fn reset(&mut self) {
        self.connected = false;
        self.connection_id = None;
        self.op = ActiveOp::Idle;
        self.send_obj = None;
        self.recv_obj = None;
        self.pending_abort = false;
        self.srm_enabled = false;
        self.srm_wait = false;
        self.transport_busy = false;
        self.peer_max_packet = MIN_PACKET_LENGTH;
    }

    /// Feed one incoming packet. Returns at most one event.
    ///
    /// # Errors
    ///
    /// Returns an error on malformed packets or transport failure while
    /// issuing follow-up requests.
    pub fn handle_packet(&mut self, data: &[u8]) -> Result<Option<SessionEvent>> {
        let response = ObexResponse::parse(data, matches!(self.op, ActiveOp::Connecting))?;
        match std::mem::replace(&mut self.op, ActiveOp::Idle) {
            ActiveOp::Idle => {
                tracing::warn!("unexpected packet while idle, code 0x{:02X}", data[0]);
                Ok(None)
            }
            ActiveOp::Connecting => self.on_connect_response(response),
            ActiveOp::Disconnecting => {
                self.connected = false;
                self.connection_id = None;
                Ok(Some(SessionEvent::DisconnectComplete {
                    code: response.code,
                }))
            }
            ActiveOp::Put => self.on_put_response(response),
            ActiveOp::Get { srmp_remaining } => self.on_get_response(response, srmp_remaining),
            ActiveOp::SetPath { remaining } => self.on_setpath_response(response, remaining),
            ActiveOp::Aborting => {
                if response.code.is_continue() {
                    // stale data from the aborted exchange, drop it
                    self.op = ActiveOp::Aborting;
                    return Ok(None);
                }
                self.send_obj = None;
                self.recv_obj = None;
                Ok(Some(SessionEvent::AbortCompleted))
            }
        }
    }

    fn on_connect_response(&mut self, response: ObexResponse) -> Result<Option<SessionEvent>> {
        if response.code.is_success() {
            let advertised = response
                .connect
                .map_or(MIN_PACKET_LENGTH, |f| f.max_packet_length);
            self.peer_max_packet = advertised.max(MIN_PACKET_LENGTH);
            self.connection_id = response.headers.connection_id();
            self.connected = true;
            tracing::debug!(
                "obex connected, peer max packet {}, connection id {:?}",
                self.peer_max_packet,
                self.connection_id
            );
        }
        Ok(Some(SessionEvent::ConnectComplete { response }))
    }

    fn on_put_response(&mut self, response: ObexResponse) -> Result<Option<SessionEvent>> {
        if self.pending_abort {
            return self.send_deferred_abort();
        }
        if response.code.is_continue() {
            self.negotiate_srm(&response);
            if let Some(obj) = self.send_obj.as_mut() {
                obj.awaiting_response = false;
            }
            self.op = ActiveOp::Put;
            self.pump_send()?;
            return Ok(None);
        }
        // terminal response, success or failure
        self.send_obj = None;
        self.srm_enabled = false;
        Ok(Some(SessionEvent::ActionCompleted {
            op: ObexOp::Put,
            response,
        }))
    }

    fn on_get_response(
        &mut self,
        response: ObexResponse,
        mut srmp_remaining: u8,
    ) -> Result<Option<SessionEvent>> {
        if self.pending_abort {
            return self.send_deferred_abort();
        }
        if response.code.is_continue() {
            self.negotiate_srm(&response);
            if let Some(obj) = self.recv_obj.as_mut() {
                obj.absorb(&response);
            }
            // request the next fragment unless the peer streams under SRM
            if !self.srm_enabled || srmp_remaining > 0 {
                let mut headers = HeaderSet::new();
                if let Some(id) = self.connection_id {
                    headers.set_connection_id(id);
                }
                if self.srm_enabled && srmp_remaining > 0 {
                    srmp_remaining -= 1;
                    if srmp_remaining > 0 {
                        headers.set_srmp(srmp_value::WAIT);
                    }
                }
                self.sink
                    .send_packet(build_request(opcode::GET_FINAL, &[], &headers))?;
            }
            self.op = ActiveOp::Get { srmp_remaining };
            return Ok(None);
        }
        let obj = self.recv_obj.take().unwrap_or_default();
        self.srm_enabled = false;
        if response.code.is_success() {
            let mut assembled = obj;
            assembled.absorb(&response);
            Ok(Some(SessionEvent::GetDataAvailable {
                response: assembled.into_response(),
            }))
        } else {
            Ok(Some(SessionEvent::ActionCompleted {
                op: ObexOp::Get,
                response,
            }))
        }
    }

    fn on_setpath_response(
        &mut self,
        response: ObexResponse,
        mut remaining: VecDeque<PathSegment>,
    ) -> Result<Option<SessionEvent>> {
        if !response.code.is_success() {
            return Ok(Some(SessionEvent::SetPathCompleted {
                code: response.code,
            }));
        }
        match remaining.pop_front() {
            None => Ok(Some(SessionEvent::SetPathCompleted {
                code: ResponseCode::SUCCESS,
            })),
            Some(next) => {
                self.send_setpath_segment(&next)?;
                self.op = ActiveOp::SetPath { remaining };
                Ok(None)
            }
        }
    }

    fn send_deferred_abort(&mut self) -> Result<Option<SessionEvent>> {
        self.pending_abort = false;
        let mut headers = HeaderSet::new();
        if let Some(id) = self.connection_id {
            headers.set_connection_id(id);
        }
        self.sink
            .send_packet(build_request(opcode::ABORT, &[], &headers))?;
        self.op = ActiveOp::Aborting;
        tracing::debug!("deferred abort issued");
        Ok(None)
    }

    fn send_setpath_segment(&mut self, segment: &PathSegment) -> Result<()> {
        let mut headers = HeaderSet::new();
        if let Some(id) = self.connection_id {
            headers.set_connection_id(id);
        }
        // bit 0: go up, bit 1: don't create
        let flags = match segment {
            PathSegment::Up => 0x03,
            PathSegment::Root => {
                headers.set_name("");
                0x02
            }
            PathSegment::Down(name) => {
                headers.set_name(name);
                0x02
            }
        };
        self.sink
            .send_packet(build_request(opcode::SET_PATH, &[flags, 0x00], &headers))
    }

    fn negotiate_srm(&mut self, response: &ObexResponse) {
        if self.srm_supported && response.headers.srm() == Some(srm_value::ENABLE) {
            self.srm_enabled = true;
        }
        self.srm_wait = response.headers.srmp() == Some(srmp_value::WAIT);
    }

    /// Send as many PUT chunks as the current mode allows.
    fn pump_send(&mut self) -> Result<()> {
        loop {
            if self.transport_busy {
                return Ok(());
            }
            let srm_streaming = self.srm_enabled && !self.srm_wait;
            let Some(obj) = self.send_obj.as_mut() else {
                return Ok(());
            };
            if obj.done || obj.awaiting_response {
                return Ok(());
            }
            let packet = obj.next_chunk(self.peer_max_packet, self.connection_id)?;
            if !srm_streaming {
                obj.awaiting_response = true;
            }
            let done = obj.done;
            self.sink.send_packet(packet)?;
            if done || !srm_streaming {
                return Ok(());
            }
        }
    }
}

impl SendObject {
    /// Build the next PUT packet, marking `done` on the final chunk.
    fn next_chunk(&mut self, peer_max: u16, conn_id: Option<u32>) -> Result<Vec<u8>> {
        let mut headers = if self.first_sent {
            let mut h = HeaderSet::new();
            if let Some(id) = conn_id {
                h.set_connection_id(id);
            }
            h
        } else {
            self.headers.clone()
        };
        let overhead = PACKET_PREFIX_SIZE + headers.encoded_len() + 3;
        let capacity = (peer_max as usize)
            .checked_sub(overhead)
            .ok_or(ObexError::HeadersTooLarge(overhead))?;
        let remaining = self.body.len() - self.offset;
        if capacity == 0 && remaining > 0 {
            return Err(ObexError::HeadersTooLarge(overhead));
        }
        let packet = if remaining <= capacity {
            headers.set_end_of_body(self.body[self.offset..].to_vec());
            self.offset = self.body.len();
            self.done = true;
            build_request(opcode::PUT_FINAL, &[], &headers)
        } else {
            headers.set_body(self.body[self.offset..self.offset + capacity].to_vec());
            self.offset += capacity;
            build_request(opcode::PUT, &[], &headers)
        };
        self.first_sent = true;
        Ok(packet)
    }
}

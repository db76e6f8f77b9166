//! Server-side OBEX session.
//!
//! Accepts one peer connection, validates the Target header on the
//! application-layer CONNECT, and reassembles multi-packet PUTs. Used by
//! the notification-receiving role; GET and SETPATH are not served.

use crate::error::Result;
use crate::header::{
    build_response, opcode, response_code, srm_value, HeaderSet, RequestPacket,
};
use crate::session::PacketSink;
use crate::{CONNECT_FIELDS_SIZE, MIN_PACKET_LENGTH, OBEX_VERSION};

/// Server session configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Expected Target UUID on CONNECT
    pub target: Vec<u8>,
    /// Maximum packet length advertised to the peer
    pub local_max_packet: u16,
    /// Grant SRM when the peer requests it
    pub srm_supported: bool,
}

/// Events produced by the server session
#[derive(Debug)]
pub enum ServerEvent {
    /// Application-layer CONNECT accepted
    ConnectAccepted,
    /// CONNECT carried a wrong or missing Target; NOT_ACCEPTABLE was sent
    /// and the owner should drop the transport
    ConnectRejected,
    /// A complete PUT object was received
    PutReceived {
        /// Headers from the first PUT packet
        headers: HeaderSet,
        /// Fully reassembled body
        body: Vec<u8>,
    },
    /// Peer issued DISCONNECT; pending work has been flushed
    Disconnected,
}

/// Server-side OBEX session state machine
pub struct ObexServerSession<S: PacketSink> {
    sink: S,
    config: ServerConfig,
    connected: bool,
    peer_max_packet: u16,
    srm_enabled: bool,
    put_headers: Option<HeaderSet>,
    put_body: Vec<u8>,
}

impl<S: PacketSink> ObexServerSession<S> {
    /// Create a server session over `sink`
    pub fn new(sink: S, config: ServerConfig) -> Self {
        Self {
            sink,
            config,
            connected: false,
            peer_max_packet: MIN_PACKET_LENGTH,
            srm_enabled: false,
            put_headers: None,
            put_body: Vec::new(),
        }
    }

    /// True once the peer's CONNECT was accepted
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// True while a multi-packet PUT is being reassembled
    #[must_use]
    pub fn is_transfer_active(&self) -> bool {
        self.put_headers.is_some()
    }

    /// Peer's advertised maximum packet length
    #[must_use]
    pub fn peer_max_packet(&self) -> u16 {
        self.peer_max_packet
    }

    /// Feed one incoming request packet. Returns at most one event.
    ///
    /// # Errors
    ///
    /// Returns an error on malformed packets or transport failure while
    /// sending the response.
    pub fn handle_packet(&mut self, data: &[u8]) -> Result<Option<ServerEvent>> {
        let request = RequestPacket::parse(data)?;
        match request.opcode {
            opcode::CONNECT => self.on_connect(&request),
            opcode::PUT | opcode::PUT_FINAL => self.on_put(request),
            opcode::DISCONNECT => {
                self.put_headers = None;
                self.put_body.clear();
                self.connected = false;
                self.respond(response_code::SUCCESS, &HeaderSet::new())?;
                Ok(Some(ServerEvent::Disconnected))
            }
            opcode::ABORT => {
                self.put_headers = None;
                self.put_body.clear();
                self.srm_enabled = false;
                self.respond(response_code::SUCCESS, &HeaderSet::new())?;
                Ok(None)
            }
            other => {
                tracing::debug!("rejecting unsupported opcode 0x{other:02X}");
                self.respond(response_code::NOT_IMPLEMENTED, &HeaderSet::new())?;
                Ok(None)
            }
        }
    }

    fn on_connect(&mut self, request: &RequestPacket) -> Result<Option<ServerEvent>> {
        if request.headers.target() != Some(self.config.target.as_slice()) {
            tracing::warn!("connect target mismatch, rejecting");
            self.respond_connect(response_code::NOT_ACCEPTABLE, &HeaderSet::new())?;
            return Ok(Some(ServerEvent::ConnectRejected));
        }
        self.peer_max_packet = request
            .connect
            .map_or(MIN_PACKET_LENGTH, |f| f.max_packet_length)
            .max(MIN_PACKET_LENGTH);
        self.connected = true;
        let mut headers = HeaderSet::new();
        headers.set_who(&self.config.target);
        headers.set_connection_id(1);
        self.respond_connect(response_code::SUCCESS, &headers)?;
        Ok(Some(ServerEvent::ConnectAccepted))
    }

    fn on_put(&mut self, request: RequestPacket) -> Result<Option<ServerEvent>> {
        if !self.connected {
            self.respond(response_code::FORBIDDEN, &HeaderSet::new())?;
            return Ok(None);
        }
        let first_fragment = self.put_headers.is_none();
        if first_fragment {
            self.srm_enabled =
                self.config.srm_supported && request.headers.srm() == Some(srm_value::ENABLE);
            let mut meta = request.headers.clone();
            meta.remove(crate::header::header_id::BODY);
            meta.remove(crate::header::header_id::END_OF_BODY);
            self.put_headers = Some(meta);
        }
        if let Some(b) = request.headers.body() {
            self.put_body.extend_from_slice(b);
        }
        if let Some(b) = request.headers.end_of_body() {
            self.put_body.extend_from_slice(b);
        }

        if request.is_final() {
            let headers = self.put_headers.take().unwrap_or_default();
            let body = std::mem::take(&mut self.put_body);
            self.srm_enabled = false;
            self.respond(response_code::SUCCESS, &HeaderSet::new())?;
            return Ok(Some(ServerEvent::PutReceived { headers, body }));
        }

        // SRM: acknowledge only the first fragment, the rest stream in
        if first_fragment {
            let mut headers = HeaderSet::new();
            if self.srm_enabled {
                headers.set_srm(srm_value::ENABLE);
            }
            self.respond(response_code::CONTINUE, &headers)?;
        } else if !self.srm_enabled {
            self.respond(response_code::CONTINUE, &HeaderSet::new())?;
        }
        Ok(None)
    }

    fn respond(&self, code: u8, headers: &HeaderSet) -> Result<()> {
        self.sink.send_packet(build_response(code, &[], headers))
    }

    fn respond_connect(&self, code: u8, headers: &HeaderSet) -> Result<()> {
        let mut extra = [0u8; CONNECT_FIELDS_SIZE];
        extra[0] = OBEX_VERSION;
        extra[1] = 0;
        extra[2..4].copy_from_slice(&self.config.local_max_packet.to_be_bytes());
        self.sink.send_packet(build_response(code, &extra, headers))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ObexError;
    use crate::header::{build_request, ObexResponse};
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct VecSink {
        sent: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl PacketSink for VecSink {
        fn send_packet(&self, packet: Vec<u8>) -> std::result::Result<(), ObexError> {
            self.sent.lock().unwrap().push(packet);
            Ok(())
        }
    }

    impl VecSink {
        fn drain(&self) -> Vec<Vec<u8>> {
            std::mem::take(&mut self.sent.lock().unwrap())
        }
    }

    const TARGET: [u8; 16] = [0xBB; 16];

    fn server() -> (ObexServerSession<VecSink>, VecSink) {
        let sink = VecSink::default();
        let session = ObexServerSession::new(
            sink.clone(),
            ServerConfig {
                target: TARGET.to_vec(),
                local_max_packet: 1024,
                srm_supported: true,
            },
        );
        (session, sink)
    }

    fn connect_packet(target: &[u8]) -> Vec<u8> {
        let mut headers = HeaderSet::new();
        headers.set_target(target);
        build_request(opcode::CONNECT, &[OBEX_VERSION, 0, 0x04, 0x00], &headers)
    }

    #[test]
    fn test_connect_validates_target() {
        let (mut session, sink) = server();
        let evt = session
            .handle_packet(&connect_packet(&[0x11; 16]))
            .unwrap()
            .unwrap();
        assert!(matches!(evt, ServerEvent::ConnectRejected));
        let resp = ObexResponse::parse(&sink.drain()[0], false).unwrap();
        assert_eq!(resp.code.as_u8(), response_code::NOT_ACCEPTABLE);
        assert!(!session.is_connected());
    }

    #[test]
    fn test_connect_accepted_with_who() {
        let (mut session, sink) = server();
        let evt = session
            .handle_packet(&connect_packet(&TARGET))
            .unwrap()
            .unwrap();
        assert!(matches!(evt, ServerEvent::ConnectAccepted));
        let resp = ObexResponse::parse(&sink.drain()[0], true).unwrap();
        assert!(resp.code.is_success());
        assert_eq!(resp.headers.who(), Some(&TARGET[..]));
        assert!(resp.headers.connection_id().is_some());
        assert!(session.is_connected());
    }

    #[test]
    fn test_put_before_connect_forbidden() {
        let (mut session, sink) = server();
        let pkt = build_request(opcode::PUT_FINAL, &[], &HeaderSet::new());
        assert!(session.handle_packet(&pkt).unwrap().is_none());
        let resp = ObexResponse::parse(&sink.drain()[0], false).unwrap();
        assert_eq!(resp.code.as_u8(), response_code::FORBIDDEN);
    }

    #[test]
    fn test_put_reassembly() {
        let (mut session, sink) = server();
        session.handle_packet(&connect_packet(&TARGET)).unwrap();
        sink.drain();

        let mut h1 = HeaderSet::new();
        h1.set_type("x-bt/MAP-event-report");
        h1.set_body(b"<MAP-event-report>".to_vec());
        let pkt1 = build_request(opcode::PUT, &[], &h1);
        assert!(session.handle_packet(&pkt1).unwrap().is_none());
        assert!(session.is_transfer_active());

        let mut h2 = HeaderSet::new();
        h2.set_end_of_body(b"</MAP-event-report>".to_vec());
        let pkt2 = build_request(opcode::PUT_FINAL, &[], &h2);
        let evt = session.handle_packet(&pkt2).unwrap().unwrap();
        match evt {
            ServerEvent::PutReceived { headers, body } => {
                assert_eq!(headers.type_str(), Some("x-bt/MAP-event-report"));
                assert_eq!(body, b"<MAP-event-report></MAP-event-report>");
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(!session.is_transfer_active());
        let responses = sink.drain();
        assert_eq!(responses.len(), 2);
        let last = ObexResponse::parse(&responses[1], false).unwrap();
        assert!(last.code.is_success());
    }

    #[test]
    fn test_srm_put_acknowledges_once() {
        let (mut session, sink) = server();
        session.handle_packet(&connect_packet(&TARGET)).unwrap();
        sink.drain();

        let mut h1 = HeaderSet::new();
        h1.set_srm(srm_value::ENABLE);
        h1.set_body(vec![0xAA; 10]);
        session
            .handle_packet(&build_request(opcode::PUT, &[], &h1))
            .unwrap();
        // SRM grant on the first fragment
        let first = sink.drain();
        assert_eq!(first.len(), 1);
        let resp = ObexResponse::parse(&first[0], false).unwrap();
        assert_eq!(resp.headers.srm(), Some(srm_value::ENABLE));

        // streamed fragments are not acknowledged
        let mut h2 = HeaderSet::new();
        h2.set_body(vec![0xBB; 10]);
        session
            .handle_packet(&build_request(opcode::PUT, &[], &h2))
            .unwrap();
        assert!(sink.drain().is_empty());
    }

    #[test]
    fn test_disconnect_flushes_pending_put() {
        let (mut session, sink) = server();
        session.handle_packet(&connect_packet(&TARGET)).unwrap();
        sink.drain();

        let mut h1 = HeaderSet::new();
        h1.set_body(vec![0xAA; 4]);
        session
            .handle_packet(&build_request(opcode::PUT, &[], &h1))
            .unwrap();
        sink.drain();

        let evt = session
            .handle_packet(&build_request(opcode::DISCONNECT, &[], &HeaderSet::new()))
            .unwrap()
            .unwrap();
        assert!(matches!(evt, ServerEvent::Disconnected));
        assert!(!session.is_transfer_active());
    }

    #[test]
    fn test_get_not_served() {
        let (mut session, sink) = server();
        session.handle_packet(&connect_packet(&TARGET)).unwrap();
        sink.drain();

        let pkt = build_request(opcode::GET_FINAL, &[], &HeaderSet::new());
        assert!(session.handle_packet(&pkt).unwrap().is_none());
        let resp = ObexResponse::parse(&sink.drain()[0], false).unwrap();
        assert_eq!(resp.code.as_u8(), response_code::NOT_IMPLEMENTED);
    }
}

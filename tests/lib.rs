//! Shared helpers for MCE integration tests: a scripted MAS peer that
//! plays the server side of the OBEX wire, a recording observer, and the
//! service harness.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use mapce_core::{
    ActionReport, BmessageReport, ConnectionState, ConversationListingReport, EventReport,
    JsonStrategyStore, MapClientObserver, MapClientService, MessagesListingReport, ServiceConfig,
};
use mapce_obex::{
    build_response, opcode, response_code, srm_value, HeaderSet, RequestPacket, TlvBlock,
    OBEX_VERSION,
};
use mapce_transport::{
    Address, MasRecord, MemLink, ObexTransport, PeerEndpoint, ScriptedStack, TransportEvent,
};

/// MAP application-parameter tags used by the peer script
pub mod peer_tag {
    /// OwnerUCI
    pub const OWNER_UCI: u8 = 0x27;
    /// MASInstanceID
    pub const MAS_INSTANCE_ID: u8 = 0x0F;
}

/// Behavior knobs for one scripted MAS peer
#[derive(Debug, Clone)]
pub struct MasPeerConfig {
    /// Owner UCI served from the instance-information request
    pub owner_uci: Option<String>,
    /// Body served for messages-listing requests
    pub listing_body: String,
    /// handle -> bMessage body
    pub messages: Vec<(String, String)>,
    /// Fragment GET responses into chunks of this size
    pub fragment_size: Option<usize>,
    /// Grant SRM when the client requests it
    pub grant_srm: bool,
    /// Handle reported for pushed messages
    pub push_handle: String,
    /// Maximum packet length advertised on CONNECT
    pub connect_mtu: u16,
}

impl Default for MasPeerConfig {
    fn default() -> Self {
        Self {
            owner_uci: None,
            listing_body: "<MAP-msg-listing/>".to_owned(),
            messages: Vec::new(),
            fragment_size: None,
            grant_srm: false,
            push_handle: "20000100FF".to_owned(),
            connect_mtu: 1024,
        }
    }
}

/// A complete PUT received by the peer
#[derive(Debug, Clone)]
pub struct ReceivedPut {
    /// Type header from the first packet
    pub type_str: Option<String>,
    /// Reassembled body
    pub body: Vec<u8>,
}

/// Handle to a spawned peer
pub struct PeerHandle {
    /// Wire-level request log: "CONNECT", "GET <type> <name>", ...
    pub log: Arc<Mutex<Vec<String>>>,
    /// Complete PUTs received
    pub puts: Arc<Mutex<Vec<ReceivedPut>>>,
    task: JoinHandle<()>,
}

impl Drop for PeerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct MasPeer {
    config: MasPeerConfig,
    log: Arc<Mutex<Vec<String>>>,
    puts: Arc<Mutex<Vec<ReceivedPut>>>,
    pending_get: Option<Vec<u8>>,
    srm_granted: bool,
    put_type: Option<String>,
    put_body: Vec<u8>,
    put_active: bool,
    put_srm: bool,
}

impl MasPeer {
    fn handle_packet(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        let Ok(request) = RequestPacket::parse(data) else {
            return vec![build_response(
                response_code::BAD_REQUEST,
                &[],
                &HeaderSet::new(),
            )];
        };
        match request.opcode {
            opcode::CONNECT => {
                self.log.lock().unwrap().push("CONNECT".to_owned());
                let mut headers = HeaderSet::new();
                headers.set_connection_id(1);
                if let Some(target) = request.headers.target() {
                    headers.set_who(target);
                }
                let mut extra = [0u8; 4];
                extra[0] = OBEX_VERSION;
                extra[2..4].copy_from_slice(&self.config.connect_mtu.to_be_bytes());
                vec![build_response(response_code::SUCCESS, &extra, &headers)]
            }
            opcode::SET_PATH => {
                self.log
                    .lock()
                    .unwrap()
                    .push(format!("SETPATH {}", request.headers.name().unwrap_or("")));
                vec![build_response(response_code::SUCCESS, &[], &HeaderSet::new())]
            }
            opcode::GET | opcode::GET_FINAL => self.on_get(&request),
            opcode::PUT | opcode::PUT_FINAL => self.on_put(&request),
            opcode::ABORT => {
                self.log.lock().unwrap().push("ABORT".to_owned());
                self.pending_get = None;
                self.put_active = false;
                self.put_body.clear();
                vec![build_response(response_code::SUCCESS, &[], &HeaderSet::new())]
            }
            opcode::DISCONNECT => {
                self.log.lock().unwrap().push("DISCONNECT".to_owned());
                vec![build_response(response_code::SUCCESS, &[], &HeaderSet::new())]
            }
            other => {
                self.log.lock().unwrap().push(format!("OP {other:02X}"));
                vec![build_response(
                    response_code::NOT_IMPLEMENTED,
                    &[],
                    &HeaderSet::new(),
                )]
            }
        }
    }

    fn on_get(&mut self, request: &RequestPacket) -> Vec<Vec<u8>> {
        if self.pending_get.is_some() {
            return self.next_fragment();
        }
        let ty = request.headers.type_str().unwrap_or("").to_owned();
        let name = request.headers.name().unwrap_or("").to_owned();
        self.log
            .lock()
            .unwrap()
            .push(format!("GET {ty} {name}").trim_end().to_owned());
        let srm_requested = request.headers.srm() == Some(srm_value::ENABLE);

        let (body, params) = match ty.as_str() {
            "x-bt/MASInstanceInformation" => {
                let mut params = TlvBlock::new();
                if let Some(uci) = &self.config.owner_uci {
                    params.push_text(peer_tag::OWNER_UCI, uci);
                }
                (b"SMS/MMS message access".to_vec(), Some(params))
            }
            "x-bt/MAP-msg-listing" => (self.config.listing_body.clone().into_bytes(), None),
            "x-bt/message" => {
                let Some((_, body)) = self.config.messages.iter().find(|(h, _)| *h == name) else {
                    return vec![build_response(
                        response_code::NOT_FOUND,
                        &[],
                        &HeaderSet::new(),
                    )];
                };
                (body.clone().into_bytes(), None)
            }
            "x-bt/ownerStatus" => {
                let mut params = TlvBlock::new();
                params.push_u8(0x1C, 1);
                (Vec::new(), Some(params))
            }
            "x-obex/folder-listing" => {
                (b"<folder-listing><folder name=\"inbox\"/></folder-listing>".to_vec(), None)
            }
            "x-bt/MAP-convo-listing" => (b"<MAP-convo-listing/>".to_vec(), None),
            _ => {
                return vec![build_response(
                    response_code::NOT_IMPLEMENTED,
                    &[],
                    &HeaderSet::new(),
                )];
            }
        };
        self.respond_get(body, params, srm_requested)
    }

    fn respond_get(
        &mut self,
        body: Vec<u8>,
        params: Option<TlvBlock>,
        srm_requested: bool,
    ) -> Vec<Vec<u8>> {
        let frag = self.config.fragment_size.unwrap_or(usize::MAX);
        if body.len() <= frag {
            let mut headers = HeaderSet::new();
            if let Some(p) = params {
                headers.set_app_params(p.encode());
            }
            headers.set_end_of_body(body);
            return vec![build_response(response_code::SUCCESS, &[], &headers)];
        }

        let mut packets = Vec::new();
        let mut headers = HeaderSet::new();
        if let Some(p) = params {
            headers.set_app_params(p.encode());
        }
        if srm_requested && self.config.grant_srm {
            headers.set_srm(srm_value::ENABLE);
            self.srm_granted = true;
        }
        headers.set_body(body[..frag].to_vec());
        packets.push(build_response(response_code::CONTINUE, &[], &headers));

        let rest = body[frag..].to_vec();
        if self.srm_granted {
            // stream the remaining fragments without waiting for requests
            let mut offset = 0;
            while rest.len() - offset > frag {
                let mut h = HeaderSet::new();
                h.set_body(rest[offset..offset + frag].to_vec());
                packets.push(build_response(response_code::CONTINUE, &[], &h));
                offset += frag;
            }
            let mut h = HeaderSet::new();
            h.set_end_of_body(rest[offset..].to_vec());
            packets.push(build_response(response_code::SUCCESS, &[], &h));
            self.srm_granted = false;
        } else {
            self.pending_get = Some(rest);
        }
        packets
    }

    fn next_fragment(&mut self) -> Vec<Vec<u8>> {
        let rest = self.pending_get.take().unwrap_or_default();
        let frag = self.config.fragment_size.unwrap_or(usize::MAX);
        if rest.len() > frag {
            let mut h = HeaderSet::new();
            h.set_body(rest[..frag].to_vec());
            self.pending_get = Some(rest[frag..].to_vec());
            vec![build_response(response_code::CONTINUE, &[], &h)]
        } else {
            let mut h = HeaderSet::new();
            h.set_end_of_body(rest);
            vec![build_response(response_code::SUCCESS, &[], &h)]
        }
    }

    fn on_put(&mut self, request: &RequestPacket) -> Vec<Vec<u8>> {
        let first = !self.put_active;
        if first {
            self.put_active = true;
            self.put_type = request.headers.type_str().map(str::to_owned);
            self.put_srm = self.config.grant_srm
                && request.headers.srm() == Some(srm_value::ENABLE);
            self.log
                .lock()
                .unwrap()
                .push(format!("PUT {}", self.put_type.as_deref().unwrap_or("")));
        }
        if let Some(b) = request.headers.body() {
            self.put_body.extend_from_slice(b);
        }
        if let Some(b) = request.headers.end_of_body() {
            self.put_body.extend_from_slice(b);
        }
        if request.is_final() {
            let put = ReceivedPut {
                type_str: self.put_type.take(),
                body: std::mem::take(&mut self.put_body),
            };
            let is_message = put.type_str.as_deref() == Some("x-bt/message");
            self.puts.lock().unwrap().push(put);
            self.put_active = false;
            let mut headers = HeaderSet::new();
            if is_message {
                headers.set_name(&self.config.push_handle);
            }
            return vec![build_response(response_code::SUCCESS, &[], &headers)];
        }
        if first {
            let mut headers = HeaderSet::new();
            if self.put_srm {
                headers.set_srm(srm_value::ENABLE);
            }
            return vec![build_response(response_code::CONTINUE, &[], &headers)];
        }
        if self.put_srm {
            // streamed fragments are not acknowledged
            return Vec::new();
        }
        vec![build_response(response_code::CONTINUE, &[], &HeaderSet::new())]
    }
}

/// Spawn a scripted MAS peer over the far end of a transport pair
pub fn spawn_mas_peer(link: MemLink, config: MasPeerConfig) -> PeerHandle {
    let log = Arc::new(Mutex::new(Vec::new()));
    let puts = Arc::new(Mutex::new(Vec::new()));
    let mut peer = MasPeer {
        config,
        log: Arc::clone(&log),
        puts: Arc::clone(&puts),
        pending_get: None,
        srm_granted: false,
        put_type: None,
        put_body: Vec::new(),
        put_active: false,
        put_srm: false,
    };
    let transport = link.transport;
    let mut events = link.events;
    let task = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                TransportEvent::Packet(data) => {
                    for packet in peer.handle_packet(&data) {
                        if transport.send_packet(packet).is_err() {
                            return;
                        }
                    }
                }
                TransportEvent::Closed { .. } => return,
                TransportEvent::Busy(_) => {}
            }
        }
    });
    PeerHandle { log, puts, task }
}

/// Observer that records every callback
#[derive(Default)]
pub struct RecordingObserver {
    /// Device state transitions
    pub states: Mutex<Vec<(Address, ConnectionState)>>,
    /// Action completions
    pub actions: Mutex<Vec<(Address, ActionReport)>>,
    /// Message-body completions
    pub bmessages: Mutex<Vec<(Address, BmessageReport)>>,
    /// Messages-listing completions
    pub listings: Mutex<Vec<(Address, MessagesListingReport)>>,
    /// Conversation-listing completions
    pub conversations: Mutex<Vec<(Address, ConversationListingReport)>>,
    /// MNS event reports
    pub events: Mutex<Vec<(Address, EventReport)>>,
    /// Busy edges
    pub busy: Mutex<Vec<(Address, bool)>>,
}

impl MapClientObserver for RecordingObserver {
    fn on_connection_state_changed(&self, address: Address, state: ConnectionState) {
        self.states.lock().unwrap().push((address, state));
    }
    fn on_map_action_completed(&self, address: Address, report: ActionReport) {
        self.actions.lock().unwrap().push((address, report));
    }
    fn on_bmessage_completed(&self, address: Address, report: BmessageReport) {
        self.bmessages.lock().unwrap().push((address, report));
    }
    fn on_messages_listing_completed(&self, address: Address, report: MessagesListingReport) {
        self.listings.lock().unwrap().push((address, report));
    }
    fn on_conversation_listing_completed(
        &self,
        address: Address,
        report: ConversationListingReport,
    ) {
        self.conversations.lock().unwrap().push((address, report));
    }
    fn on_map_event_reported(&self, address: Address, event: EventReport) {
        self.events.lock().unwrap().push((address, event));
    }
    fn on_device_busy_changed(&self, address: Address, busy: bool) {
        self.busy.lock().unwrap().push((address, busy));
    }
}

/// Service plus scripted stack and recording observer
pub struct Harness {
    /// The service under test
    pub service: MapClientService,
    /// The scripted stack
    pub stack: Arc<ScriptedStack>,
    /// Far ends of opened transports
    pub endpoints: tokio::sync::Mutex<mpsc::UnboundedReceiver<PeerEndpoint>>,
    /// The recording observer
    pub observer: Arc<RecordingObserver>,
}

/// Build a harness with the default service configuration
#[must_use]
pub fn new_harness() -> Harness {
    new_harness_with(ServiceConfig::default())
}

/// Initialize test logging once; `RUST_LOG` selects the filter
pub fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Build a harness with a custom service configuration
#[must_use]
pub fn new_harness_with(config: ServiceConfig) -> Harness {
    init_tracing();
    let (stack, endpoints) = ScriptedStack::new(2048);
    let observer = Arc::new(RecordingObserver::default());
    let service = MapClientService::start(
        stack.clone(),
        observer.clone(),
        Arc::new(JsonStrategyStore::new()),
        config,
    )
    .expect("service start");
    Harness {
        service,
        stack,
        endpoints: tokio::sync::Mutex::new(endpoints),
        observer,
    }
}

/// Device address used across tests
#[must_use]
pub fn test_address(last: u8) -> Address {
    Address::from_bytes([0xAA, 0xBB, 0xCC, 0x00, 0x00, last])
}

/// MAS record with the given instance id and supported-type bits
#[must_use]
pub fn mas_record(instance_id: u8, message_types: u8, l2cap: bool) -> MasRecord {
    MasRecord {
        instance_id,
        service_name: Some(format!("MAS {instance_id}")),
        rfcomm_channel: Some(4 + instance_id),
        l2cap_psm: if l2cap { Some(0x1021 + u16::from(instance_id)) } else { None },
        supported_message_types: message_types,
        supported_features: Some(0x0000_007F),
    }
}

/// Wait for a condition with a bounded polling loop
pub async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for: {what}");
}

/// Take the next opened transport's far end
pub async fn next_endpoint(harness: &Harness) -> PeerEndpoint {
    let mut endpoints = harness.endpoints.lock().await;
    tokio::time::timeout(Duration::from_secs(5), endpoints.recv())
        .await
        .expect("endpoint timeout")
        .expect("endpoint channel closed")
}

/// Script SDP for `address`, connect, and spawn one scripted peer per
/// record. Returns the peer handles in endpoint-arrival order alongside
/// the channel each one serves.
pub async fn connect_with_peers(
    harness: &Harness,
    address: Address,
    records: Vec<MasRecord>,
    config_for: impl Fn(u16) -> MasPeerConfig,
) -> Vec<(u16, PeerHandle)> {
    harness.stack.script_sdp(address, Ok(records.clone()));
    assert!(harness.service.connect(address).is_ok());
    let mut peers = Vec::new();
    for _ in 0..records.len() {
        let endpoint = next_endpoint(harness).await;
        let channel = endpoint.target.channel;
        peers.push((channel, spawn_mas_peer(endpoint.link, config_for(channel))));
    }
    let service = &harness.service;
    wait_until("device connected", || service.is_connected(address)).await;
    peers
}

/// Receive one packet from a link's event stream
pub async fn recv_peer_packet(link: &mut MemLink) -> Option<Vec<u8>> {
    loop {
        match tokio::time::timeout(Duration::from_secs(5), link.events.recv())
            .await
            .ok()??
        {
            TransportEvent::Packet(data) => return Some(data),
            TransportEvent::Closed { .. } => return None,
            TransportEvent::Busy(_) => {}
        }
    }
}

/// Build an MNS-side OBEX CONNECT request
#[must_use]
pub fn mns_connect_packet(target: &[u8]) -> Vec<u8> {
    let mut headers = HeaderSet::new();
    headers.set_target(target);
    mapce_obex::build_request(opcode::CONNECT, &[OBEX_VERSION, 0, 0x04, 0x00], &headers)
}

/// Build an MNS event-report PUT request
#[must_use]
pub fn mns_event_packet(instance_id: u8, body: &str) -> Vec<u8> {
    let mut headers = HeaderSet::new();
    headers.set_type("x-bt/MAP-event-report");
    let mut params = TlvBlock::new();
    params.push_u8(peer_tag::MAS_INSTANCE_ID, instance_id);
    headers.set_app_params(params.encode());
    headers.set_end_of_body(body.as_bytes().to_vec());
    mapce_obex::build_request(opcode::PUT_FINAL, &[], &headers)
}

/// True when the packet is a response with the given code
#[must_use]
pub fn response_has_code(packet: &[u8], code: u8) -> bool {
    packet.first() == Some(&code)
}

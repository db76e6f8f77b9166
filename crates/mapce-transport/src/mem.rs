//! In-memory transports and a scriptable stack.
//!
//! `link_pair` builds two connected transport endpoints that exchange
//! whole packets over channels; `ScriptedStack` implements
//! [`BluetoothStack`] against them so higher layers can be exercised
//! without a Bluetooth controller.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;

use crate::addr::Address;
use crate::sdp::MasRecord;
use crate::stack::{
    BluetoothStack, IncomingConnection, MnsRegistration, ObexTransport, TransportError,
    TransportEvent, TransportLink, TransportResult, TransportTarget,
};
use async_trait::async_trait;

/// One side of an in-memory transport pair
pub struct MemTransport {
    peer_tx: mpsc::UnboundedSender<TransportEvent>,
    local_tx: mpsc::UnboundedSender<TransportEvent>,
    mtu: u16,
    closed: AtomicBool,
}

impl MemTransport {
    /// Inject a backpressure edge into this side's event stream
    pub fn raise_busy(&self, busy: bool) {
        let _ = self.local_tx.send(TransportEvent::Busy(busy));
    }

    /// Simulate an abrupt transport failure visible to both sides
    pub fn fail(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.local_tx.send(TransportEvent::Closed { clean: false });
            let _ = self.peer_tx.send(TransportEvent::Closed { clean: false });
        }
    }
}

impl ObexTransport for MemTransport {
    fn send_packet(&self, packet: Vec<u8>) -> TransportResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.peer_tx
            .send(TransportEvent::Packet(packet))
            .map_err(|_| TransportError::Closed)
    }

    fn max_packet_size(&self) -> u16 {
        self.mtu
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.peer_tx.send(TransportEvent::Closed { clean: true });
        }
    }
}

/// A transport handle together with its inbound event stream
pub struct MemLink {
    /// Send side
    pub transport: Arc<MemTransport>,
    /// Inbound events
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

impl MemLink {
    /// Erase the concrete type for handing to the profile
    #[must_use]
    pub fn into_link(self) -> TransportLink {
        TransportLink {
            handle: self.transport,
            events: self.events,
        }
    }
}

/// Build a connected pair of in-memory transports with the given MTU
#[must_use]
pub fn link_pair(mtu: u16) -> (MemLink, MemLink) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    let a = MemTransport {
        peer_tx: b_tx.clone(),
        local_tx: a_tx.clone(),
        mtu,
        closed: AtomicBool::new(false),
    };
    let b = MemTransport {
        peer_tx: a_tx,
        local_tx: b_tx,
        mtu,
        closed: AtomicBool::new(false),
    };
    (
        MemLink {
            transport: Arc::new(a),
            events: a_rx,
        },
        MemLink {
            transport: Arc::new(b),
            events: b_rx,
        },
    )
}

/// The far end of a transport opened through [`ScriptedStack`]
pub struct PeerEndpoint {
    /// Target the profile asked for
    pub target: TransportTarget,
    /// The peer side of the pair; drive it to play the MAS role
    pub link: MemLink,
}

/// Scriptable [`BluetoothStack`] backed by in-memory transports.
///
/// SDP results, security outcomes, and connect outcomes are programmed
/// per address; every opened transport's far end is delivered on the
/// endpoint channel so a test can play the remote device.
pub struct ScriptedStack {
    mtu: u16,
    sdp: Mutex<HashMap<Address, TransportResult<Vec<MasRecord>>>>,
    sdp_holds: Mutex<HashSet<Address>>,
    security_errors: Mutex<HashMap<Address, VecDeque<TransportError>>>,
    connect_errors: Mutex<HashMap<Address, VecDeque<TransportError>>>,
    endpoints: mpsc::UnboundedSender<PeerEndpoint>,
    mns_sink: Mutex<Option<mpsc::UnboundedSender<IncomingConnection>>>,
}

impl ScriptedStack {
    /// Create a stack; the receiver yields the far end of every
    /// transport the profile opens.
    #[must_use]
    pub fn new(mtu: u16) -> (Arc<Self>, mpsc::UnboundedReceiver<PeerEndpoint>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                mtu,
                sdp: Mutex::new(HashMap::new()),
                sdp_holds: Mutex::new(HashSet::new()),
                security_errors: Mutex::new(HashMap::new()),
                connect_errors: Mutex::new(HashMap::new()),
                endpoints: tx,
                mns_sink: Mutex::new(None),
            }),
            rx,
        )
    }

    /// Program the SDP search result for `address`
    pub fn script_sdp(&self, address: Address, result: TransportResult<Vec<MasRecord>>) {
        self.sdp.lock().unwrap().insert(address, result);
    }

    /// Park SDP searches for `address` until [`Self::release_sdp`]
    pub fn hold_sdp(&self, address: Address) {
        self.sdp_holds.lock().unwrap().insert(address);
    }

    /// Release a parked SDP search
    pub fn release_sdp(&self, address: Address) {
        self.sdp_holds.lock().unwrap().remove(&address);
    }

    /// Queue an error for the next security request against `address`
    pub fn script_security_error(&self, address: Address, error: TransportError) {
        self.security_errors
            .lock()
            .unwrap()
            .entry(address)
            .or_default()
            .push_back(error);
    }

    /// Queue an error for the next transport connect against `address`
    pub fn script_connect_error(&self, address: Address, error: TransportError) {
        self.connect_errors
            .lock()
            .unwrap()
            .entry(address)
            .or_default()
            .push_back(error);
    }

    /// Push an inbound MNS connection, as the stack listener would
    pub fn inject_mns_connection(&self, connection: IncomingConnection) {
        if let Some(tx) = self.mns_sink.lock().unwrap().as_ref() {
            let _ = tx.send(connection);
        }
    }
}

#[async_trait]
impl BluetoothStack for ScriptedStack {
    async fn sdp_search_mas(&self, address: Address) -> TransportResult<Vec<MasRecord>> {
        while self.sdp_holds.lock().unwrap().contains(&address) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        self.sdp
            .lock()
            .unwrap()
            .get(&address)
            .cloned()
            .unwrap_or_else(|| Ok(Vec::new()))
    }

    async fn request_security(&self, target: &TransportTarget) -> TransportResult<()> {
        if let Some(err) = self
            .security_errors
            .lock()
            .unwrap()
            .get_mut(&target.address)
            .and_then(VecDeque::pop_front)
        {
            return Err(err);
        }
        Ok(())
    }

    async fn connect_transport(&self, target: &TransportTarget) -> TransportResult<TransportLink> {
        if let Some(err) = self
            .connect_errors
            .lock()
            .unwrap()
            .get_mut(&target.address)
            .and_then(VecDeque::pop_front)
        {
            return Err(err);
        }
        let (local, peer) = link_pair(self.mtu);
        let _ = self.endpoints.send(PeerEndpoint {
            target: *target,
            link: peer,
        });
        Ok(local.into_link())
    }

    fn register_mns(
        &self,
        registration: MnsRegistration,
    ) -> TransportResult<mpsc::UnboundedReceiver<IncomingConnection>> {
        tracing::debug!(
            "mns registered: rfcomm {}, psm 0x{:04X}",
            registration.rfcomm_channel,
            registration.l2cap_psm
        );
        let (tx, rx) = mpsc::unbounded_channel();
        *self.mns_sink.lock().unwrap() = Some(tx);
        Ok(rx)
    }
}

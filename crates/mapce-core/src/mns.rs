//! MNS server: accepts the peer's notification pushes.
//!
//! One SDP record and security entries for both transports are registered
//! at service start; inbound transports are gated by the owning device's
//! state, the OBEX Target is validated against the MNS UUID, and each
//! complete PUT is decoded into an event report and demultiplexed to the
//! owning device by address.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;

use mapce_obex::{
    ObexServerSession, ServerConfig, ServerEvent, DEFAULT_PACKET_LENGTH,
};
use mapce_transport::{
    BluetoothStack, IncomingConnection, MnsRegistration, ObexTransport, TransportEvent,
    TransportKind,
};

use crate::client::SinkAdapter;
use crate::codec::{parse_event_report, EventReport};
use crate::error::Result;
use crate::params::{tag, type_str};
use crate::service::ServiceEvent;
use crate::types::{Address, ConnectionState, MNS_TARGET_UUID};

/// State or data change produced by an MNS connection
pub(crate) enum MnsUpdate {
    /// The device's MNS session state changed
    State(Address, ConnectionState),
    /// An event report arrived for the device
    Event(Address, EventReport),
}

struct MnsConnection {
    peer: Address,
    session: ObexServerSession<SinkAdapter>,
    handle: Arc<dyn ObexTransport>,
}

/// The notification-receiving OBEX server
pub(crate) struct MnsServer {
    connections: HashMap<u64, MnsConnection>,
    next_id: u64,
}

impl MnsServer {
    pub(crate) fn new() -> Self {
        Self {
            connections: HashMap::new(),
            next_id: 1,
        }
    }

    /// Register the MNS service and start forwarding inbound connections
    /// onto the dispatcher.
    pub(crate) fn start(
        stack: &Arc<dyn BluetoothStack>,
        events: &mpsc::UnboundedSender<ServiceEvent>,
        registration: MnsRegistration,
    ) -> Result<()> {
        let mut incoming = stack.register_mns(registration)?;
        let events = events.clone();
        tokio::spawn(async move {
            while let Some(connection) = incoming.recv().await {
                if events
                    .send(ServiceEvent::MnsIncoming { connection })
                    .is_err()
                {
                    break;
                }
            }
        });
        Ok(())
    }

    /// Admit or reject one inbound transport. Returns the peer address
    /// when admitted; the caller marks the device's MNS axis Connecting.
    pub(crate) fn on_incoming(
        &mut self,
        connection: IncomingConnection,
        accept: bool,
        events: &mpsc::UnboundedSender<ServiceEvent>,
    ) -> Option<Address> {
        let peer = connection.peer;
        if !accept {
            tracing::info!("rejecting mns transport from {}", peer);
            connection.link.handle.close();
            return None;
        }
        let id = self.next_id;
        self.next_id += 1;
        let handle = connection.link.handle;
        let session = ObexServerSession::new(
            SinkAdapter::new(Arc::clone(&handle)),
            ServerConfig {
                target: MNS_TARGET_UUID.to_vec(),
                local_max_packet: handle.max_packet_size().min(DEFAULT_PACKET_LENGTH),
                srm_supported: connection.kind == TransportKind::L2cap,
            },
        );
        self.connections.insert(
            id,
            MnsConnection {
                peer,
                session,
                handle,
            },
        );
        let events = events.clone();
        let mut transport_events = connection.link.events;
        tokio::spawn(async move {
            while let Some(event) = transport_events.recv().await {
                let terminal = matches!(event, TransportEvent::Closed { .. });
                if events.send(ServiceEvent::MnsTransport { id, event }).is_err() || terminal {
                    break;
                }
            }
        });
        tracing::debug!("mns transport {} accepted from {}", id, peer);
        Some(peer)
    }

    /// Process one transport event for an MNS connection
    pub(crate) fn on_transport_event(&mut self, id: u64, event: TransportEvent) -> Vec<MnsUpdate> {
        let Some(connection) = self.connections.get_mut(&id) else {
            return Vec::new();
        };
        let peer = connection.peer;
        match event {
            TransportEvent::Packet(data) => match connection.session.handle_packet(&data) {
                Ok(Some(server_event)) => self.on_server_event(id, peer, server_event),
                Ok(None) => Vec::new(),
                Err(e) => {
                    tracing::warn!("malformed mns packet from {}: {e}", peer);
                    Vec::new()
                }
            },
            TransportEvent::Busy(_) => Vec::new(),
            TransportEvent::Closed { .. } => {
                self.connections.remove(&id);
                vec![MnsUpdate::State(peer, ConnectionState::Disconnected)]
            }
        }
    }

    fn on_server_event(&mut self, id: u64, peer: Address, event: ServerEvent) -> Vec<MnsUpdate> {
        match event {
            ServerEvent::ConnectAccepted => {
                vec![MnsUpdate::State(peer, ConnectionState::Connected)]
            }
            ServerEvent::ConnectRejected => {
                if let Some(connection) = self.connections.remove(&id) {
                    connection.handle.close();
                }
                vec![MnsUpdate::State(peer, ConnectionState::Disconnected)]
            }
            ServerEvent::PutReceived { headers, body } => {
                if headers.type_str() != Some(type_str::EVENT_REPORT) {
                    tracing::warn!(
                        "unexpected mns object type {:?} from {}",
                        headers.type_str(),
                        peer
                    );
                    return Vec::new();
                }
                let mas_instance_id = headers
                    .app_params()
                    .map(mapce_obex::TlvBlock::decode)
                    .and_then(|p| p.get_u8(tag::MAS_INSTANCE_ID))
                    .unwrap_or(0);
                let report =
                    parse_event_report(mas_instance_id, &String::from_utf8_lossy(&body));
                vec![MnsUpdate::Event(peer, report)]
            }
            ServerEvent::Disconnected => {
                if let Some(connection) = self.connections.remove(&id) {
                    connection.handle.close();
                }
                vec![MnsUpdate::State(peer, ConnectionState::Disconnected)]
            }
        }
    }

    /// Drop every connection belonging to `address`; used when the
    /// device disconnects. Returns true when something was closed.
    pub(crate) fn close_for(&mut self, address: Address) -> bool {
        let ids: Vec<u64> = self
            .connections
            .iter()
            .filter(|(_, c)| c.peer == address)
            .map(|(id, _)| *id)
            .collect();
        for id in &ids {
            if let Some(connection) = self.connections.remove(id) {
                connection.handle.close();
            }
        }
        !ids.is_empty()
    }
}

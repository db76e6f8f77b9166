//! Service facade and dispatcher.
//!
//! `MapClientService` is the public surface: admission control runs
//! synchronously against read-side snapshots, accepted work is posted to
//! a single dispatcher task that owns every device controller, and all
//! protocol results come back through the observer. No business logic
//! runs on the caller's thread; the only cross-thread state is the
//! snapshot map and the strategy store.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;

use mapce_obex::PathSegment;
use mapce_transport::{
    BluetoothStack, IncomingConnection, MasRecord, MnsRegistration, ObexTransport, TransportEvent,
    TransportResult,
};

use crate::device::{DeviceController, DispatchCtx};
use crate::error::{AdmissionStatus, Result};
use crate::instance::InstanceCtx;
use crate::mns::{MnsServer, MnsUpdate};
use crate::observer::MapClientObserver;
use crate::request::{
    ConversationListingParams, GetMessageParams, MapRequest, MessagesListingParams,
    OwnerStatusParams, PushMessageParams, SetMessageStatusParams,
};
use crate::strategy::StrategyStore;
use crate::types::{
    Address, ConnectionState, ConnectionStrategy, DeviceSnapshot, MasInstanceInfoList,
    MessageTypeMask, TargetState,
};

/// Service-wide configuration
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Device-table capacity; a disconnected device is evicted when a
    /// connect would exceed it
    pub max_devices: usize,
    /// Per-device bound on queued requests
    pub max_pending_requests: usize,
    /// Restrict discovery to one MAS instance id
    pub single_instance_id: Option<u8>,
    /// RFCOMM channel published for the MNS service
    pub mns_rfcomm_channel: u8,
    /// L2CAP PSM published for the MNS service
    pub mns_l2cap_psm: u16,
    /// SDP service name for the MNS record
    pub mns_service_name: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            max_devices: 6,
            max_pending_requests: 30,
            single_instance_id: None,
            mns_rfcomm_channel: 18,
            mns_l2cap_psm: 0x1029,
            mns_service_name: "MAP MNS".to_owned(),
        }
    }
}

/// Everything the dispatcher reacts to: facade commands and posted
/// stack/transport callbacks
pub enum ServiceEvent {
    /// Facade: connect a device
    Connect {
        /// Device address
        address: Address,
    },
    /// Facade: disconnect a device
    Disconnect {
        /// Device address
        address: Address,
    },
    /// Facade: connect one instance
    ConnectInstance {
        /// Device address
        address: Address,
        /// MAS instance id
        instance_id: u8,
    },
    /// Facade: route a request
    SendRequest {
        /// Device address
        address: Address,
        /// The request to route
        request: MapRequest,
    },
    /// SDP search finished
    SdpResult {
        /// Device address
        address: Address,
        /// Discovered records or the search error
        result: TransportResult<Vec<MasRecord>>,
    },
    /// GAP security finished
    SecurityResult {
        /// Device address
        address: Address,
        /// MAS instance id
        instance_id: u8,
        /// Security outcome
        result: TransportResult<()>,
    },
    /// Transport open finished
    TransportConnected {
        /// Device address
        address: Address,
        /// MAS instance id
        instance_id: u8,
        /// Open transport or the failure
        result: TransportResult<Arc<dyn ObexTransport>>,
    },
    /// Event from an instance transport
    Transport {
        /// Device address
        address: Address,
        /// MAS instance id
        instance_id: u8,
        /// The event
        event: TransportEvent,
    },
    /// Inbound MNS transport from the stack listener
    MnsIncoming {
        /// The connection
        connection: IncomingConnection,
    },
    /// Event from an accepted MNS transport
    MnsTransport {
        /// Connection id
        id: u64,
        /// The event
        event: TransportEvent,
    },
    /// Stop the dispatcher
    Shutdown,
}

/// Public handle to the MCE service
pub struct MapClientService {
    events: mpsc::UnboundedSender<ServiceEvent>,
    snapshots: Arc<DashMap<Address, DeviceSnapshot>>,
    strategy: Arc<dyn StrategyStore>,
    config: ServiceConfig,
}

impl MapClientService {
    /// Start the service: registers the MNS service and spawns the
    /// dispatcher. Must be called within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Fails when the MNS service cannot be registered.
    pub fn start(
        stack: Arc<dyn BluetoothStack>,
        observer: Arc<dyn MapClientObserver>,
        strategy: Arc<dyn StrategyStore>,
        config: ServiceConfig,
    ) -> Result<Self> {
        let (events, rx) = mpsc::unbounded_channel();
        MnsServer::start(
            &stack,
            &events,
            MnsRegistration {
                rfcomm_channel: config.mns_rfcomm_channel,
                l2cap_psm: config.mns_l2cap_psm,
                service_name: config.mns_service_name.clone(),
            },
        )?;
        let snapshots: Arc<DashMap<Address, DeviceSnapshot>> = Arc::new(DashMap::new());
        let actor = ServiceActor {
            stack,
            observer,
            config: config.clone(),
            snapshots: Arc::clone(&snapshots),
            devices: HashMap::new(),
            mns: MnsServer::new(),
            events: events.clone(),
        };
        tokio::spawn(actor.run(rx));
        tracing::info!("map client service started");
        Ok(Self {
            events,
            snapshots,
            strategy,
            config,
        })
    }

    fn post(&self, event: ServiceEvent) -> AdmissionStatus {
        match self.events.send(event) {
            Ok(()) => AdmissionStatus::NoError,
            Err(_) => AdmissionStatus::BadStatus,
        }
    }

    /// Connect to a device: SDP discovery, then one session per MAS
    /// instance.
    pub fn connect(&self, address: Address) -> AdmissionStatus {
        if self.strategy.load(address) == Some(ConnectionStrategy::Forbidden) {
            return AdmissionStatus::BadStatus;
        }
        if let Some(snapshot) = self.snapshots.get(&address) {
            if snapshot.target == TargetState::Connected
                || snapshot.state != ConnectionState::Disconnected
            {
                return AdmissionStatus::BadStatus;
            }
        } else if self.snapshots.len() >= self.config.max_devices
            && !self
                .snapshots
                .iter()
                .any(|e| e.state == ConnectionState::Disconnected)
        {
            return AdmissionStatus::BadStatus;
        }
        // claim the target immediately so a racing second connect is
        // refused before the dispatcher runs
        self.snapshots.entry(address).or_default().target = TargetState::Connected;
        self.post(ServiceEvent::Connect { address })
    }

    /// Disconnect a device, cancelling outstanding work
    pub fn disconnect(&self, address: Address) -> AdmissionStatus {
        let Some(mut snapshot) = self.snapshots.get_mut(&address) else {
            return AdmissionStatus::BadStatus;
        };
        if snapshot.target == TargetState::Disconnected
            && snapshot.state == ConnectionState::Disconnected
        {
            return AdmissionStatus::BadStatus;
        }
        snapshot.target = TargetState::Disconnected;
        drop(snapshot);
        self.post(ServiceEvent::Disconnect { address })
    }

    /// Connect one already-discovered instance
    pub fn connect_instance(&self, address: Address, instance_id: u8) -> AdmissionStatus {
        let Some(snapshot) = self.snapshots.get(&address) else {
            return AdmissionStatus::BadStatus;
        };
        if snapshot.state == ConnectionState::Disconnected {
            return AdmissionStatus::BadStatus;
        }
        if !snapshot
            .instances
            .iter()
            .any(|i| i.instance_id == instance_id)
        {
            return AdmissionStatus::BadParam;
        }
        drop(snapshot);
        self.post(ServiceEvent::ConnectInstance {
            address,
            instance_id,
        })
    }

    /// Push a message to a folder on the peer
    pub fn send_message(&self, address: Address, params: PushMessageParams) -> AdmissionStatus {
        if params.folder.is_empty() || params.bmessage.is_empty() {
            return AdmissionStatus::BadParam;
        }
        self.submit(address, MapRequest::PushMessage(params))
    }

    /// Update the MNS notification filter
    pub fn set_notification_filter(&self, address: Address, mask: u32) -> AdmissionStatus {
        self.submit(address, MapRequest::SetNotificationFilter { mask })
    }

    /// Switch MNS notification registration on or off
    pub fn set_notification_registration(&self, address: Address, enable: bool) -> AdmissionStatus {
        self.submit(address, MapRequest::SetNotificationRegistration { enable })
    }

    /// Retrieve a messages listing
    pub fn get_messages_listing(
        &self,
        address: Address,
        params: MessagesListingParams,
    ) -> AdmissionStatus {
        self.submit(address, MapRequest::GetMessagesListing(params))
    }

    /// Retrieve one message body
    pub fn get_message(&self, address: Address, params: GetMessageParams) -> AdmissionStatus {
        if params.handle.is_empty() {
            return AdmissionStatus::BadParam;
        }
        self.submit(address, MapRequest::GetMessage(params))
    }

    /// Retrieve up to `max_count` unread messages of the given types
    pub fn get_unread_messages(
        &self,
        address: Address,
        message_type: MessageTypeMask,
        max_count: u16,
    ) -> AdmissionStatus {
        if max_count == 0 || message_type.is_empty() {
            return AdmissionStatus::BadParam;
        }
        self.submit(address, MapRequest::unread(message_type, max_count))
    }

    /// Ask the peer to update its inbox
    pub fn update_inbox(&self, address: Address) -> AdmissionStatus {
        self.submit(address, MapRequest::UpdateInbox)
    }

    /// Retrieve a conversation listing
    pub fn get_conversation_listing(
        &self,
        address: Address,
        params: ConversationListingParams,
    ) -> AdmissionStatus {
        self.submit(address, MapRequest::GetConversationListing(params))
    }

    /// Update a message's status indicator
    pub fn set_message_status(
        &self,
        address: Address,
        params: SetMessageStatusParams,
    ) -> AdmissionStatus {
        if params.handle.is_empty() {
            return AdmissionStatus::BadParam;
        }
        self.submit(address, MapRequest::SetMessageStatus(params))
    }

    /// Update the owner status
    pub fn set_owner_status(&self, address: Address, params: OwnerStatusParams) -> AdmissionStatus {
        self.submit(address, MapRequest::SetOwnerStatus(params))
    }

    /// Retrieve the owner status
    pub fn get_owner_status(
        &self,
        address: Address,
        conversation_id: Option<String>,
        owner_uci: Option<String>,
    ) -> AdmissionStatus {
        self.submit(
            address,
            MapRequest::GetOwnerStatus {
                conversation_id,
                owner_uci,
            },
        )
    }

    /// Retrieve a folder listing
    pub fn get_folder_listing(
        &self,
        address: Address,
        max_list_count: Option<u16>,
        list_start_offset: Option<u16>,
    ) -> AdmissionStatus {
        self.submit(
            address,
            MapRequest::GetFolderListing {
                max_list_count,
                list_start_offset,
            },
        )
    }

    /// Change the current folder path. `path` is absolute when it starts
    /// with `/`; `..` segments go up.
    pub fn set_folder_path(&self, address: Address, path: &str) -> AdmissionStatus {
        let Some(segments) = parse_folder_path(path) else {
            return AdmissionStatus::BadParam;
        };
        self.submit(address, MapRequest::SetFolderPath { segments })
    }

    /// Instance metadata for a device; `is_valid` is false until SDP
    /// discovery succeeded
    #[must_use]
    pub fn get_mas_instance_info(&self, address: Address) -> MasInstanceInfoList {
        let Some(snapshot) = self.snapshots.get(&address) else {
            return MasInstanceInfoList::default();
        };
        MasInstanceInfoList {
            is_valid: !snapshot.instances.is_empty(),
            instances: snapshot.instances.clone(),
        }
    }

    /// True when the device-level state is Connected
    #[must_use]
    pub fn is_connected(&self, address: Address) -> bool {
        self.snapshots
            .get(&address)
            .is_some_and(|s| s.state == ConnectionState::Connected)
    }

    /// Addresses of devices currently in any of `states`
    #[must_use]
    pub fn get_devices_by_states(&self, states: &[ConnectionState]) -> Vec<Address> {
        self.snapshots
            .iter()
            .filter(|e| states.contains(&e.state))
            .map(|e| *e.key())
            .collect()
    }

    /// Persist the connection strategy for a device
    pub fn set_connection_strategy(
        &self,
        address: Address,
        strategy: ConnectionStrategy,
    ) -> AdmissionStatus {
        self.strategy.store(address, strategy);
        AdmissionStatus::NoError
    }

    /// Stored connection strategy; defaults to Allowed
    #[must_use]
    pub fn get_connection_strategy(&self, address: Address) -> ConnectionStrategy {
        self.strategy
            .load(address)
            .unwrap_or(ConnectionStrategy::Allowed)
    }

    /// Stop the dispatcher; outstanding devices are torn down
    pub fn shutdown(&self) {
        let _ = self.events.send(ServiceEvent::Shutdown);
    }

    fn submit(&self, address: Address, request: MapRequest) -> AdmissionStatus {
        let Some(snapshot) = self.snapshots.get(&address) else {
            return AdmissionStatus::BadStatus;
        };
        if snapshot.state != ConnectionState::Connected {
            return AdmissionStatus::BadStatus;
        }
        if snapshot.queued_requests >= self.config.max_pending_requests {
            return AdmissionStatus::BadStatus;
        }
        let mask = request.required_message_types();
        let supported = snapshot
            .instances
            .iter()
            .any(|i| MessageTypeMask::from_bits(i.supported_message_types).intersects(mask));
        drop(snapshot);
        // the dispatcher synthesizes the NotSupported completion; the
        // synchronous result only mirrors it
        let posted = self.post(ServiceEvent::SendRequest { address, request });
        if posted.is_ok() && !supported {
            AdmissionStatus::NoSupport
        } else {
            posted
        }
    }
}

/// Parse a folder path into SETPATH segments
fn parse_folder_path(path: &str) -> Option<Vec<PathSegment>> {
    if path.is_empty() {
        return None;
    }
    let mut segments = Vec::new();
    if path.starts_with('/') {
        segments.push(PathSegment::Root);
    }
    for part in path.split('/').filter(|p| !p.is_empty()) {
        if part == ".." {
            segments.push(PathSegment::Up);
        } else {
            segments.push(PathSegment::Down(part.to_owned()));
        }
    }
    if segments.is_empty() {
        return None;
    }
    Some(segments)
}

/// Single-threaded owner of all device state
struct ServiceActor {
    stack: Arc<dyn BluetoothStack>,
    observer: Arc<dyn MapClientObserver>,
    config: ServiceConfig,
    snapshots: Arc<DashMap<Address, DeviceSnapshot>>,
    devices: HashMap<Address, DeviceController>,
    mns: MnsServer,
    events: mpsc::UnboundedSender<ServiceEvent>,
}

impl ServiceActor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<ServiceEvent>) {
        while let Some(event) = rx.recv().await {
            if matches!(event, ServiceEvent::Shutdown) {
                break;
            }
            self.handle(event);
        }
        tracing::info!("dispatcher stopping, tearing down {} devices", self.devices.len());
        let addresses: Vec<Address> = self.devices.keys().copied().collect();
        for address in addresses {
            let ctx = self.ctx(address);
            if let Some(device) = self.devices.get_mut(&address) {
                device.cmd_disconnect(&ctx);
            }
            self.mns.close_for(address);
            self.sync_snapshot(address);
        }
    }

    fn ctx(&self, address: Address) -> DispatchCtx {
        DispatchCtx {
            address,
            stack: Arc::clone(&self.stack),
            events: self.events.clone(),
            observer: Arc::clone(&self.observer),
            snapshots: Arc::clone(&self.snapshots),
        }
    }

    fn handle(&mut self, event: ServiceEvent) {
        match event {
            ServiceEvent::Connect { address } => {
                if !self.devices.contains_key(&address) && self.devices.len() >= self.config.max_devices {
                    let evictable = self
                        .devices
                        .iter()
                        .find(|(_, d)| d.state() == ConnectionState::Disconnected)
                        .map(|(a, _)| *a);
                    match evictable {
                        Some(victim) => {
                            tracing::info!("evicting disconnected device {victim}");
                            self.devices.remove(&victim);
                            self.snapshots.remove(&victim);
                        }
                        None => {
                            tracing::warn!("device table full, dropping connect to {address}");
                            self.snapshots.remove(&address);
                            return;
                        }
                    }
                }
                let ctx = self.ctx(address);
                self.devices
                    .entry(address)
                    .or_insert_with(|| DeviceController::new(address))
                    .cmd_connect(&ctx);
                self.sync_snapshot(address);
            }
            ServiceEvent::Disconnect { address } => {
                let ctx = self.ctx(address);
                if self.mns.close_for(address) {
                    if let Some(device) = self.devices.get_mut(&address) {
                        device.set_mns_state(&ctx, ConnectionState::Disconnected);
                    }
                }
                if let Some(device) = self.devices.get_mut(&address) {
                    device.cmd_disconnect(&ctx);
                }
                self.sync_snapshot(address);
            }
            ServiceEvent::ConnectInstance {
                address,
                instance_id,
            } => {
                let ctx = self.ctx(address);
                if let Some(device) = self.devices.get_mut(&address) {
                    device.cmd_connect_instance(&ctx, instance_id);
                }
                self.sync_snapshot(address);
            }
            ServiceEvent::SendRequest { address, request } => {
                let ctx = self.ctx(address);
                match self.devices.get_mut(&address) {
                    Some(device) => {
                        device.send_request(&ctx, request);
                    }
                    None => {
                        ctx.deliver(
                            request.failure_report(crate::observer::RequestStatus::NotSupported),
                        );
                    }
                }
                self.sync_snapshot(address);
            }
            ServiceEvent::SdpResult { address, result } => {
                let ctx = self.ctx(address);
                let single = self.config.single_instance_id;
                if let Some(device) = self.devices.get_mut(&address) {
                    device.on_sdp_result(&ctx, result, single);
                }
                self.sync_snapshot(address);
            }
            ServiceEvent::SecurityResult {
                address,
                instance_id,
                result,
            } => {
                let ctx = self.ctx(address);
                if let Some(device) = self.devices.get_mut(&address) {
                    device.on_security_result(&ctx, instance_id, result);
                }
                self.sync_snapshot(address);
            }
            ServiceEvent::TransportConnected {
                address,
                instance_id,
                result,
            } => {
                let ctx = self.ctx(address);
                if let Some(device) = self.devices.get_mut(&address) {
                    device.on_transport_connected(&ctx, instance_id, result);
                } else if let Ok(handle) = result {
                    handle.close();
                }
                self.sync_snapshot(address);
            }
            ServiceEvent::Transport {
                address,
                instance_id,
                event,
            } => {
                let ctx = self.ctx(address);
                if let Some(device) = self.devices.get_mut(&address) {
                    device.on_transport_event(&ctx, instance_id, event);
                }
                self.sync_snapshot(address);
            }
            ServiceEvent::MnsIncoming { connection } => {
                let peer = connection.peer;
                let accept = self
                    .devices
                    .get(&peer)
                    .is_some_and(DeviceController::mns_accept_allowed);
                if let Some(peer) = self.mns.on_incoming(connection, accept, &self.events) {
                    let ctx = self.ctx(peer);
                    if let Some(device) = self.devices.get_mut(&peer) {
                        device.set_mns_state(&ctx, ConnectionState::Connecting);
                    }
                    self.sync_snapshot(peer);
                }
            }
            ServiceEvent::MnsTransport { id, event } => {
                for update in self.mns.on_transport_event(id, event) {
                    match update {
                        MnsUpdate::State(address, state) => {
                            let ctx = self.ctx(address);
                            if let Some(device) = self.devices.get_mut(&address) {
                                device.set_mns_state(&ctx, state);
                            }
                            self.sync_snapshot(address);
                        }
                        MnsUpdate::Event(address, report) => {
                            if self.devices.contains_key(&address) {
                                self.observer.on_map_event_reported(address, report);
                            } else {
                                tracing::warn!("event report from unknown device {address}");
                            }
                        }
                    }
                }
            }
            ServiceEvent::Shutdown => {}
        }
    }

    fn sync_snapshot(&self, address: Address) {
        match self.devices.get(&address) {
            Some(device) => {
                self.snapshots.insert(address, device.snapshot());
            }
            None => {
                self.snapshots.remove(&address);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_folder_path() {
        assert_eq!(
            parse_folder_path("/telecom/msg"),
            Some(vec![
                PathSegment::Root,
                PathSegment::Down("telecom".into()),
                PathSegment::Down("msg".into()),
            ])
        );
        assert_eq!(
            parse_folder_path("../outbox"),
            Some(vec![PathSegment::Up, PathSegment::Down("outbox".into())])
        );
        assert!(parse_folder_path("").is_none());
    }
}

//! Per-device connection controller.
//!
//! One controller per remote device: drives SDP discovery, owns the
//! instance state machines created from the discovered MAS records,
//! routes outbound requests to the instance that supports them, and
//! aggregates per-device state and busy flags. The MNS session share of
//! the device lifecycle is tracked here as a third state axis.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;

use mapce_transport::{
    BluetoothStack, MasRecord, ObexTransport, TransportEvent, TransportResult, TransportTarget,
};

use crate::instance::{InstanceCtx, InstanceState, InstanceStateMachine};
use crate::observer::{MapClientObserver, RequestStatus};
use crate::request::{MapRequest, Report};
use crate::service::ServiceEvent;
use crate::types::{
    Address, ConnectionState, DeviceSnapshot, MasInstanceInfo, MessageTypeMask, TargetState,
};

/// Shared handles the controller and its instances use to spawn
/// off-dispatcher work and reach the observer
pub(crate) struct DispatchCtx {
    pub address: Address,
    pub stack: Arc<dyn BluetoothStack>,
    pub events: mpsc::UnboundedSender<ServiceEvent>,
    pub observer: Arc<dyn MapClientObserver>,
    pub snapshots: Arc<DashMap<Address, DeviceSnapshot>>,
}

impl InstanceCtx for DispatchCtx {
    fn spawn_security(&self, instance_id: u8, target: TransportTarget) {
        let stack = Arc::clone(&self.stack);
        let events = self.events.clone();
        let address = self.address;
        tokio::spawn(async move {
            let result = stack.request_security(&target).await;
            let _ = events.send(ServiceEvent::SecurityResult {
                address,
                instance_id,
                result,
            });
        });
    }

    fn spawn_transport_connect(&self, instance_id: u8, target: TransportTarget) {
        let stack = Arc::clone(&self.stack);
        let events = self.events.clone();
        let address = self.address;
        tokio::spawn(async move {
            match stack.connect_transport(&target).await {
                Ok(link) => {
                    let handle = link.handle;
                    let mut transport_events = link.events;
                    let _ = events.send(ServiceEvent::TransportConnected {
                        address,
                        instance_id,
                        result: Ok(handle),
                    });
                    while let Some(event) = transport_events.recv().await {
                        let terminal = matches!(event, TransportEvent::Closed { .. });
                        if events
                            .send(ServiceEvent::Transport {
                                address,
                                instance_id,
                                event,
                            })
                            .is_err()
                            || terminal
                        {
                            break;
                        }
                    }
                }
                Err(e) => {
                    let _ = events.send(ServiceEvent::TransportConnected {
                        address,
                        instance_id,
                        result: Err(e),
                    });
                }
            }
        });
    }

    fn deliver(&self, report: Report) {
        let address = self.address;
        match report {
            Report::Action(r) => self.observer.on_map_action_completed(address, r),
            Report::Bmessage(r) => self.observer.on_bmessage_completed(address, r),
            Report::MessagesListing(r) => {
                self.observer.on_messages_listing_completed(address, r);
            }
            Report::ConversationListing(r) => {
                self.observer.on_conversation_listing_completed(address, r);
            }
        }
    }
}

/// Controller for one remote device
pub struct DeviceController {
    address: Address,
    state: ConnectionState,
    target: TargetState,
    instances: Vec<InstanceStateMachine>,
    mns_state: ConnectionState,
    sdp_in_flight: bool,
    busy_reported: bool,
}

impl DeviceController {
    /// Create a controller in the disconnected state
    pub fn new(address: Address) -> Self {
        Self {
            address,
            state: ConnectionState::Disconnected,
            target: TargetState::Disconnected,
            instances: Vec::new(),
            mns_state: ConnectionState::Disconnected,
            sdp_in_flight: false,
            busy_reported: false,
        }
    }

    /// Device address
    #[must_use]
    pub fn address(&self) -> Address {
        self.address
    }

    /// Device-level connection state
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Device-level target state
    #[must_use]
    pub fn target(&self) -> TargetState {
        self.target
    }

    /// Read-side snapshot for admission and inquiry
    #[must_use]
    pub fn snapshot(&self) -> DeviceSnapshot {
        DeviceSnapshot {
            state: self.state,
            target: self.target,
            busy: self.busy_reported,
            instances: self
                .instances
                .iter()
                .map(InstanceStateMachine::instance_info)
                .collect(),
            queued_requests: self
                .instances
                .iter()
                .map(InstanceStateMachine::queue_len)
                .sum(),
        }
    }

    /// Instance metadata for inquiry; invalid until SDP populated it
    #[must_use]
    pub fn instance_info_list(&self) -> Vec<MasInstanceInfo> {
        self.instances
            .iter()
            .map(InstanceStateMachine::instance_info)
            .collect()
    }

    /// True when an inbound MNS transport from this device may be
    /// accepted
    #[must_use]
    pub fn mns_accept_allowed(&self) -> bool {
        self.target == TargetState::Connected
            && matches!(
                self.state,
                ConnectionState::Connecting | ConnectionState::Connected
            )
    }

    /// Record the device's MNS session state
    pub(crate) fn set_mns_state(&mut self, ctx: &DispatchCtx, state: ConnectionState) {
        if self.mns_state != state {
            tracing::debug!("device {} mns state {:?} -> {:?}", self.address, self.mns_state, state);
            self.mns_state = state;
            self.reconcile(ctx);
        }
    }

    /// Command: connect the device. Starts SDP discovery.
    pub(crate) fn cmd_connect(&mut self, ctx: &DispatchCtx) {
        if self.state != ConnectionState::Disconnected {
            tracing::warn!("connect ignored, device {} is {:?}", self.address, self.state);
            return;
        }
        self.target = TargetState::Connected;
        self.set_state(ctx, ConnectionState::Connecting);
        self.sdp_in_flight = true;
        let stack = Arc::clone(&ctx.stack);
        let events = ctx.events.clone();
        let address = self.address;
        tokio::spawn(async move {
            let result = stack.sdp_search_mas(address).await;
            let _ = events.send(ServiceEvent::SdpResult { address, result });
        });
    }

    /// Command: disconnect the device
    pub(crate) fn cmd_disconnect(&mut self, ctx: &DispatchCtx) {
        self.target = TargetState::Disconnected;
        for instance in &mut self.instances {
            instance.cmd_disconnect(ctx);
        }
        self.reconcile(ctx);
    }

    /// Command: connect one specific instance of an already-discovered
    /// device
    pub(crate) fn cmd_connect_instance(&mut self, ctx: &DispatchCtx, instance_id: u8) {
        match self.instances.iter_mut().find(|i| i.instance_id() == instance_id) {
            Some(instance) => {
                instance.cmd_connect(ctx);
                self.reconcile(ctx);
            }
            None => tracing::warn!("no instance {} on device {}", instance_id, self.address),
        }
    }

    /// SDP completion
    pub(crate) fn on_sdp_result(
        &mut self,
        ctx: &DispatchCtx,
        result: TransportResult<Vec<MasRecord>>,
        single_instance: Option<u8>,
    ) {
        self.sdp_in_flight = false;
        if self.target == TargetState::Disconnected {
            // disconnect raced the search; settle with zero instances
            self.instances.clear();
            self.reconcile(ctx);
            return;
        }
        let records = match result {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!("sdp search failed for {}: {e}", self.address);
                self.target = TargetState::Disconnected;
                self.reconcile(ctx);
                return;
            }
        };
        let usable: Vec<MasRecord> = records
            .into_iter()
            .filter(|r| {
                if !r.has_transport() {
                    tracing::warn!(
                        "mas instance {} on {} lacks transport parameters",
                        r.instance_id,
                        self.address
                    );
                    return false;
                }
                single_instance.map_or(true, |id| r.instance_id == id)
            })
            .collect();
        if usable.is_empty() {
            tracing::info!("no usable mas instances on {}", self.address);
            self.target = TargetState::Disconnected;
            self.reconcile(ctx);
            return;
        }
        for record in usable {
            let target = record
                .transport_target(self.address)
                .expect("transport presence checked");
            let mut instance = InstanceStateMachine::new(self.address, record, target);
            instance.cmd_connect(ctx);
            self.instances.push(instance);
        }
        self.reconcile(ctx);
    }

    /// Route a request to the first instance whose supported-type mask
    /// intersects the request's, preferring an owner-UCI match when one
    /// is given. No match synthesizes a NotSupported completion.
    pub(crate) fn send_request(&mut self, ctx: &DispatchCtx, request: MapRequest) -> bool {
        let mask = request.required_message_types();
        let candidates: Vec<usize> = self
            .instances
            .iter()
            .enumerate()
            .filter(|(_, i)| {
                matches!(
                    i.state(),
                    InstanceState::Connecting | InstanceState::Connected | InstanceState::Sending
                ) && MessageTypeMask::from_bits(i.sdp_param().supported_message_types)
                    .intersects(mask)
            })
            .map(|(idx, _)| idx)
            .collect();
        if candidates.is_empty() {
            tracing::info!(
                "no instance on {} serves {} (mask {:#04x})",
                self.address,
                request.name(),
                mask.bits()
            );
            ctx.deliver(request.failure_report(RequestStatus::NotSupported));
            return false;
        }
        let chosen = request
            .owner_uci()
            .and_then(|uci| {
                candidates
                    .iter()
                    .copied()
                    .find(|&idx| self.instances[idx].instance_info().owner_uci.as_deref() == Some(uci))
            })
            .unwrap_or(candidates[0]);
        self.instances[chosen].cmd_send_request(ctx, request);
        self.reconcile(ctx);
        true
    }

    /// GAP security completion for one instance
    pub(crate) fn on_security_result(
        &mut self,
        ctx: &DispatchCtx,
        instance_id: u8,
        result: TransportResult<()>,
    ) {
        if let Some(instance) = self.instance_mut(instance_id) {
            instance.on_security_result(ctx, result);
            self.reconcile(ctx);
        }
    }

    /// Transport open completion for one instance
    pub(crate) fn on_transport_connected(
        &mut self,
        ctx: &DispatchCtx,
        instance_id: u8,
        result: TransportResult<Arc<dyn ObexTransport>>,
    ) {
        if let Some(instance) = self.instance_mut(instance_id) {
            instance.on_transport_connected(ctx, result);
            self.reconcile(ctx);
        }
    }

    /// Transport event for one instance
    pub(crate) fn on_transport_event(
        &mut self,
        ctx: &DispatchCtx,
        instance_id: u8,
        event: TransportEvent,
    ) {
        if let Some(instance) = self.instance_mut(instance_id) {
            instance.on_transport_event(ctx, event);
            self.reconcile(ctx);
        }
    }

    fn instance_mut(&mut self, instance_id: u8) -> Option<&mut InstanceStateMachine> {
        self.instances
            .iter_mut()
            .find(|i| i.instance_id() == instance_id)
    }

    fn set_state(&mut self, ctx: &DispatchCtx, new: ConnectionState) {
        if self.state != new {
            tracing::info!("device {} state {:?} -> {:?}", self.address, self.state, new);
            self.state = new;
            // the snapshot must never trail the callback
            ctx.snapshots.insert(self.address, self.snapshot());
            ctx.observer.on_connection_state_changed(self.address, new);
        }
    }

    /// Re-derive device-level state and busy from the instance set and
    /// the MNS axis; only edges are reported.
    fn reconcile(&mut self, ctx: &DispatchCtx) {
        let any_connected = self
            .instances
            .iter()
            .any(|i| matches!(i.state(), InstanceState::Connected | InstanceState::Sending));
        let any_connecting = self
            .instances
            .iter()
            .any(|i| i.state() == InstanceState::Connecting);
        let any_disconnecting = self
            .instances
            .iter()
            .any(|i| i.state() == InstanceState::Disconnecting);
        let mns_open = self.mns_state != ConnectionState::Disconnected;

        let new = if any_connected {
            ConnectionState::Connected
        } else if any_connecting || self.sdp_in_flight {
            ConnectionState::Connecting
        } else if any_disconnecting || (mns_open && self.target == TargetState::Disconnected) {
            ConnectionState::Disconnecting
        } else {
            ConnectionState::Disconnected
        };

        if new == ConnectionState::Disconnected {
            if self.target == TargetState::Connected && !self.instances.is_empty() {
                // every instance settled without a session: the connect
                // attempt failed
                self.target = TargetState::Disconnected;
            }
            if self.target == TargetState::Disconnected {
                self.instances.clear();
            }
        }
        self.set_state(ctx, new);

        let busy = self.instances.iter().any(InstanceStateMachine::is_busy);
        if busy != self.busy_reported {
            self.busy_reported = busy;
            ctx.snapshots.insert(self.address, self.snapshot());
            ctx.observer.on_device_busy_changed(self.address, busy);
        }
    }
}

//! Per-instance lifecycle state machine.
//!
//! One state machine owns one [`InstanceClient`] and drives it through
//! Disconnected → Connecting → Connected (→ Sending) → Disconnecting.
//! The actual and target states may diverge only transiently: every
//! terminal transition re-checks the target and either reconnects or
//! finalizes the disconnect.
//!
//! Connecting runs the setup sequence: GAP security (L2CAP only) →
//! transport → OBEX connect → instance information → folder path
//! `telecom/msg`. A transport collision during setup retries the
//! security request once before failing.

use std::sync::Arc;

use mapce_obex::{PathSegment, SessionEvent};
use mapce_transport::{
    MasRecord, ObexTransport, TransportError, TransportEvent, TransportKind, TransportResult,
    TransportTarget,
};

use crate::client::{InstanceClient, PendingRequest};
use crate::observer::{ActionData, RequestStatus};
use crate::request::{MapRequest, Report};
use crate::types::{Address, MasInstanceInfo, TargetState};

/// Instance lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    /// No session
    Disconnected,
    /// Setup sequence running
    Connecting,
    /// Session up, in-flight slot empty
    Connected,
    /// Session up, a request is in flight
    Sending,
    /// OBEX disconnect in progress
    Disconnecting,
}

/// Sub-phase of the Connecting state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectPhase {
    Idle,
    Security,
    Transport,
    ObexConnect,
    InstanceInfo,
    SetPath,
}

/// Side effects the state machine asks its owner to perform
pub(crate) trait InstanceCtx {
    /// Run the GAP security request off-dispatcher
    fn spawn_security(&self, instance_id: u8, target: TransportTarget);
    /// Open the transport off-dispatcher
    fn spawn_transport_connect(&self, instance_id: u8, target: TransportTarget);
    /// Deliver a report to the observer
    fn deliver(&self, report: Report);
}

/// State machine for one MAS instance
pub struct InstanceStateMachine {
    state: InstanceState,
    target: TargetState,
    phase: ConnectPhase,
    security_retried: bool,
    client: InstanceClient,
}

impl InstanceStateMachine {
    /// Create a machine for one discovered instance
    pub fn new(address: Address, sdp: MasRecord, target: TransportTarget) -> Self {
        Self {
            state: InstanceState::Disconnected,
            target: TargetState::Disconnected,
            phase: ConnectPhase::Idle,
            security_retried: false,
            client: InstanceClient::new(address, sdp, target),
        }
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> InstanceState {
        self.state
    }

    /// Target state
    #[must_use]
    pub fn target(&self) -> TargetState {
        self.target
    }

    /// MAS instance id
    #[must_use]
    pub fn instance_id(&self) -> u8 {
        self.client.sdp_param().instance_id
    }

    /// Immutable SDP parameters
    #[must_use]
    pub fn sdp_param(&self) -> &MasRecord {
        self.client.sdp_param()
    }

    /// Instance metadata, owner UCI included once learned
    #[must_use]
    pub fn instance_info(&self) -> MasInstanceInfo {
        self.client.instance_info()
    }

    /// Queued request count
    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.client.queue_len()
    }

    /// Continuous transfer activity or an in-flight request
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.client.is_transfer_active() || self.state == InstanceState::Sending
    }

    fn set_state(&mut self, new: InstanceState) {
        if self.state != new {
            tracing::debug!(
                "instance {} state {:?} -> {:?}",
                self.instance_id(),
                self.state,
                new
            );
            self.state = new;
        }
    }

    /// Command: bring the instance up
    pub(crate) fn cmd_connect(&mut self, ctx: &dyn InstanceCtx) {
        self.target = TargetState::Connected;
        if self.state != InstanceState::Disconnected {
            return;
        }
        self.security_retried = false;
        self.set_state(InstanceState::Connecting);
        self.start_link_setup(ctx);
    }

    /// Command: bring the instance down
    pub(crate) fn cmd_disconnect(&mut self, ctx: &dyn InstanceCtx) {
        self.target = TargetState::Disconnected;
        match self.state {
            InstanceState::Disconnected | InstanceState::Disconnecting => {}
            InstanceState::Connecting => {
                // security/transport phases settle through their callbacks;
                // obex phases settle at the next terminal session event
                if self.phase == ConnectPhase::Idle {
                    self.settle_disconnected();
                }
            }
            InstanceState::Connected => self.start_disconnect(ctx),
            InstanceState::Sending => {
                // defer: abort the transfer if one is outstanding, then
                // disconnect once the exchange resolves
                if self.client.is_transfer_active() {
                    if let Err(e) = self.client.abort_current() {
                        tracing::debug!("abort not possible, waiting for completion: {e}");
                    }
                }
            }
        }
    }

    /// Command: issue or queue a request
    pub(crate) fn cmd_send_request(&mut self, ctx: &dyn InstanceCtx, request: MapRequest) {
        let pending = PendingRequest {
            request,
            internal: false,
        };
        match self.state {
            InstanceState::Connected => match self.client.client_send_request(pending) {
                Ok(()) => self.set_state(InstanceState::Sending),
                Err((e, pending)) => {
                    tracing::warn!("request send failed: {e}");
                    self.deliver_failure(ctx, &pending, RequestStatus::Failure);
                }
            },
            // queued requests drain once the connect sequence settles or
            // the current exchange finishes, strictly in order
            InstanceState::Sending | InstanceState::Connecting => {
                self.client.client_save_request(pending);
            }
            _ => {
                tracing::warn!(
                    "request {} against instance in state {:?}",
                    pending.request.name(),
                    self.state
                );
                self.deliver_failure(ctx, &pending, RequestStatus::Failure);
            }
        }
    }

    /// GAP security completion
    pub(crate) fn on_security_result(&mut self, ctx: &dyn InstanceCtx, result: TransportResult<()>) {
        if self.phase != ConnectPhase::Security {
            return;
        }
        if self.target == TargetState::Disconnected {
            self.settle_disconnected();
            return;
        }
        match result {
            Ok(()) => {
                self.phase = ConnectPhase::Transport;
                ctx.spawn_transport_connect(self.instance_id(), self.client.target());
            }
            Err(TransportError::Collision) if !self.security_retried => {
                tracing::info!("security collision on instance {}, retrying", self.instance_id());
                self.security_retried = true;
                ctx.spawn_security(self.instance_id(), self.client.target());
            }
            Err(e) => {
                tracing::warn!("security failed on instance {}: {e}", self.instance_id());
                self.fail_connect(ctx);
            }
        }
    }

    /// Transport open completion
    pub(crate) fn on_transport_connected(
        &mut self,
        ctx: &dyn InstanceCtx,
        result: TransportResult<Arc<dyn ObexTransport>>,
    ) {
        if self.phase != ConnectPhase::Transport {
            if let Ok(handle) = result {
                handle.close();
            }
            return;
        }
        if self.target == TargetState::Disconnected {
            if let Ok(handle) = result {
                handle.close();
            }
            self.settle_disconnected();
            return;
        }
        match result {
            Ok(handle) => match self.client.begin_obex_connect(handle) {
                Ok(()) => self.phase = ConnectPhase::ObexConnect,
                Err(e) => {
                    tracing::warn!("obex connect send failed: {e}");
                    self.fail_connect(ctx);
                }
            },
            Err(TransportError::Collision) if !self.security_retried => {
                // peer-initiated simultaneous connect: redo security
                tracing::info!("transport collision on instance {}, retrying security", self.instance_id());
                self.security_retried = true;
                self.phase = ConnectPhase::Security;
                ctx.spawn_security(self.instance_id(), self.client.target());
            }
            Err(e) => {
                tracing::warn!("transport connect failed on instance {}: {e}", self.instance_id());
                self.fail_connect(ctx);
            }
        }
    }

    /// Transport event (packet, backpressure edge, loss)
    pub(crate) fn on_transport_event(&mut self, ctx: &dyn InstanceCtx, event: TransportEvent) {
        match event {
            TransportEvent::Packet(data) => match self.client.handle_packet(&data) {
                Ok(Some(session_event)) => self.on_session_event(ctx, session_event),
                Ok(None) => {}
                Err(e) => tracing::warn!(
                    "dropping malformed packet on instance {}: {e}",
                    self.instance_id()
                ),
            },
            TransportEvent::Busy(busy) => {
                if let Err(e) = self.client.set_transport_busy(busy) {
                    tracing::warn!("resume after backpressure failed: {e}");
                    self.on_transport_lost(ctx, false);
                }
            }
            TransportEvent::Closed { clean } => self.on_transport_lost(ctx, clean),
        }
    }

    fn on_session_event(&mut self, ctx: &dyn InstanceCtx, event: SessionEvent) {
        match event {
            SessionEvent::ConnectComplete { response } => {
                if self.phase != ConnectPhase::ObexConnect {
                    return;
                }
                if !response.code.is_success() {
                    tracing::warn!(
                        "obex connect rejected on instance {} (0x{:02X})",
                        self.instance_id(),
                        response.code.as_u8()
                    );
                    self.fail_connect(ctx);
                    return;
                }
                if self.target == TargetState::Disconnected {
                    self.start_disconnect(ctx);
                    return;
                }
                self.send_internal(
                    ctx,
                    MapRequest::GetMasInstanceInfo {
                        instance_id: self.instance_id(),
                    },
                    ConnectPhase::InstanceInfo,
                );
            }
            SessionEvent::DisconnectComplete { .. } => self.finalize_disconnect(ctx),
            SessionEvent::AbortCompleted => {
                // cancellation via disconnect: the aborted request still
                // gets its one terminal failure callback
                if let Some(result) =
                    self.client.client_proc_response(&SessionEvent::AbortCompleted)
                {
                    if !result.internal {
                        for report in result.outcome.reports {
                            ctx.deliver(report);
                        }
                    }
                }
                self.discard_queue(ctx);
                self.start_disconnect(ctx);
            }
            other => self.on_response_event(ctx, other),
        }
    }

    fn on_response_event(&mut self, ctx: &dyn InstanceCtx, event: SessionEvent) {
        let Some(result) = self.client.client_proc_response(&event) else {
            tracing::debug!("response with no current request on instance {}", self.instance_id());
            return;
        };
        if self.state == InstanceState::Connecting {
            self.advance_connect_sequence(ctx, &result.outcome.reports, result.finished.is_some());
            return;
        }
        if !result.internal {
            for report in result.outcome.reports {
                ctx.deliver(report);
            }
        }
        if result.finished.is_some() {
            self.on_request_finished(ctx);
        }
    }

    fn advance_connect_sequence(
        &mut self,
        ctx: &dyn InstanceCtx,
        reports: &[Report],
        finished: bool,
    ) {
        if !finished {
            return;
        }
        match self.phase {
            ConnectPhase::InstanceInfo => {
                // instance information is best-effort; capture the owner
                // identity when present and move on
                for report in reports {
                    if let Report::Action(action) = report {
                        if let ActionData::InstanceInfo { owner_uci, .. } = &action.data {
                            self.client.set_owner_uci(owner_uci.clone());
                        }
                    }
                }
                if self.target == TargetState::Disconnected {
                    self.start_disconnect(ctx);
                    return;
                }
                self.send_internal(
                    ctx,
                    MapRequest::SetFolderPath {
                        segments: vec![
                            PathSegment::Root,
                            PathSegment::Down("telecom".into()),
                            PathSegment::Down("msg".into()),
                        ],
                    },
                    ConnectPhase::SetPath,
                );
            }
            ConnectPhase::SetPath => {
                let ok = reports.iter().any(|r| {
                    matches!(
                        r,
                        Report::Action(a) if a.status == RequestStatus::Success
                    )
                });
                if !ok {
                    tracing::warn!("folder setup failed on instance {}", self.instance_id());
                    self.fail_connect(ctx);
                    return;
                }
                if self.target == TargetState::Disconnected {
                    self.start_disconnect(ctx);
                    return;
                }
                self.phase = ConnectPhase::Idle;
                self.set_state(InstanceState::Connected);
                self.drain_or_idle(ctx);
            }
            _ => {}
        }
    }

    fn send_internal(&mut self, ctx: &dyn InstanceCtx, request: MapRequest, phase: ConnectPhase) {
        let pending = PendingRequest {
            request,
            internal: true,
        };
        match self.client.client_send_request(pending) {
            Ok(()) => self.phase = phase,
            Err((e, _)) => {
                tracing::warn!("connect sequence send failed: {e}");
                self.fail_connect(ctx);
            }
        }
    }

    fn on_request_finished(&mut self, ctx: &dyn InstanceCtx) {
        if !matches!(
            self.state,
            InstanceState::Sending | InstanceState::Connected
        ) {
            return;
        }
        if self.target == TargetState::Disconnected {
            self.discard_queue(ctx);
            self.start_disconnect(ctx);
            return;
        }
        self.drain_or_idle(ctx);
    }

    fn drain_or_idle(&mut self, ctx: &dyn InstanceCtx) {
        let skipped = self.client.client_send_saved_request();
        for pending in &skipped {
            self.deliver_failure(ctx, pending, RequestStatus::Failure);
        }
        if self.client.has_current() {
            self.set_state(InstanceState::Sending);
        } else {
            self.set_state(InstanceState::Connected);
        }
    }

    fn discard_queue(&mut self, ctx: &dyn InstanceCtx) {
        for pending in self.client.discard_queue() {
            self.deliver_failure(ctx, &pending, RequestStatus::Failure);
        }
    }

    fn start_link_setup(&mut self, ctx: &dyn InstanceCtx) {
        match self.client.target().kind {
            TransportKind::L2cap => {
                self.phase = ConnectPhase::Security;
                ctx.spawn_security(self.instance_id(), self.client.target());
            }
            TransportKind::Rfcomm => {
                // the lower layer gates security during its own connect
                self.phase = ConnectPhase::Transport;
                ctx.spawn_transport_connect(self.instance_id(), self.client.target());
            }
        }
    }

    fn start_disconnect(&mut self, ctx: &dyn InstanceCtx) {
        match self.client.start_client_disconnect() {
            Ok(()) => {
                self.phase = ConnectPhase::Idle;
                self.set_state(InstanceState::Disconnecting);
            }
            Err(e) => {
                // a failed disconnect is treated the same as completion
                tracing::debug!("disconnect send failed, finalizing: {e}");
                self.finalize_disconnect(ctx);
            }
        }
    }

    fn finalize_disconnect(&mut self, ctx: &dyn InstanceCtx) {
        let orphaned = self.client.teardown();
        for pending in &orphaned {
            self.deliver_failure(ctx, pending, RequestStatus::Failure);
        }
        self.phase = ConnectPhase::Idle;
        self.set_state(InstanceState::Disconnected);
        if self.target == TargetState::Connected {
            // target flipped back while disconnecting
            self.security_retried = false;
            self.set_state(InstanceState::Connecting);
            self.start_link_setup(ctx);
        }
    }

    fn on_transport_lost(&mut self, ctx: &dyn InstanceCtx, clean: bool) {
        if self.state == InstanceState::Disconnected {
            return;
        }
        if clean {
            tracing::info!("peer closed transport on instance {}", self.instance_id());
        } else {
            tracing::warn!("transport failed on instance {}", self.instance_id());
        }
        self.finalize_disconnect(ctx);
    }

    fn fail_connect(&mut self, ctx: &dyn InstanceCtx) {
        // failed connects do not retry; the target is cleared so the
        // terminal state is stable
        self.target = TargetState::Disconnected;
        self.finalize_disconnect(ctx);
    }

    fn settle_disconnected(&mut self) {
        self.phase = ConnectPhase::Idle;
        self.set_state(InstanceState::Disconnected);
    }

    fn deliver_failure(
        &self,
        ctx: &dyn InstanceCtx,
        pending: &PendingRequest,
        status: RequestStatus,
    ) {
        if !pending.internal {
            ctx.deliver(pending.request.failure_report(status));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingCtx {
        security: Mutex<Vec<u8>>,
        connects: Mutex<Vec<u8>>,
        reports: Mutex<Vec<Report>>,
    }

    impl InstanceCtx for RecordingCtx {
        fn spawn_security(&self, instance_id: u8, _target: TransportTarget) {
            self.security.lock().unwrap().push(instance_id);
        }
        fn spawn_transport_connect(&self, instance_id: u8, _target: TransportTarget) {
            self.connects.lock().unwrap().push(instance_id);
        }
        fn deliver(&self, report: Report) {
            self.reports.lock().unwrap().push(report);
        }
    }

    fn machine(kind: TransportKind) -> InstanceStateMachine {
        let sdp = MasRecord {
            instance_id: 1,
            service_name: None,
            rfcomm_channel: Some(4),
            l2cap_psm: Some(0x1021),
            supported_message_types: 0x0E,
            supported_features: Some(0x7F),
        };
        let target = TransportTarget {
            address: Address::ANY,
            kind,
            channel: if kind == TransportKind::L2cap { 0x1021 } else { 4 },
        };
        InstanceStateMachine::new(Address::ANY, sdp, target)
    }

    #[test]
    fn test_l2cap_connect_requests_security_first() {
        let ctx = RecordingCtx::default();
        let mut stm = machine(TransportKind::L2cap);
        stm.cmd_connect(&ctx);
        assert_eq!(stm.state(), InstanceState::Connecting);
        assert_eq!(ctx.security.lock().unwrap().as_slice(), &[1]);
        assert!(ctx.connects.lock().unwrap().is_empty());

        stm.on_security_result(&ctx, Ok(()));
        assert_eq!(ctx.connects.lock().unwrap().as_slice(), &[1]);
    }

    #[test]
    fn test_rfcomm_connect_skips_security() {
        let ctx = RecordingCtx::default();
        let mut stm = machine(TransportKind::Rfcomm);
        stm.cmd_connect(&ctx);
        assert!(ctx.security.lock().unwrap().is_empty());
        assert_eq!(ctx.connects.lock().unwrap().as_slice(), &[1]);
    }

    #[test]
    fn test_collision_retries_security_once() {
        let ctx = RecordingCtx::default();
        let mut stm = machine(TransportKind::L2cap);
        stm.cmd_connect(&ctx);
        stm.on_security_result(&ctx, Ok(()));
        stm.on_transport_connected(&ctx, Err(TransportError::Collision));
        assert_eq!(ctx.security.lock().unwrap().len(), 2);
        assert_eq!(stm.state(), InstanceState::Connecting);

        // a second collision fails the connect
        stm.on_security_result(&ctx, Ok(()));
        stm.on_transport_connected(&ctx, Err(TransportError::Collision));
        assert_eq!(stm.state(), InstanceState::Disconnected);
        assert_eq!(stm.target(), TargetState::Disconnected);
    }

    #[test]
    fn test_security_failure_settles_disconnected() {
        let ctx = RecordingCtx::default();
        let mut stm = machine(TransportKind::L2cap);
        stm.cmd_connect(&ctx);
        stm.on_security_result(&ctx, Err(TransportError::Security("refused".into())));
        assert_eq!(stm.state(), InstanceState::Disconnected);
    }

    #[test]
    fn test_disconnect_during_security_settles_without_transport() {
        let ctx = RecordingCtx::default();
        let mut stm = machine(TransportKind::L2cap);
        stm.cmd_connect(&ctx);
        stm.cmd_disconnect(&ctx);
        stm.on_security_result(&ctx, Ok(()));
        assert_eq!(stm.state(), InstanceState::Disconnected);
        assert!(ctx.connects.lock().unwrap().is_empty());
    }

    #[test]
    fn test_send_request_while_disconnected_fails() {
        let ctx = RecordingCtx::default();
        let mut stm = machine(TransportKind::Rfcomm);
        stm.cmd_send_request(&ctx, MapRequest::UpdateInbox);
        let reports = ctx.reports.lock().unwrap();
        assert_eq!(reports.len(), 1);
        match &reports[0] {
            Report::Action(r) => assert_eq!(r.status, RequestStatus::Failure),
            other => panic!("unexpected report {other:?}"),
        }
    }
}

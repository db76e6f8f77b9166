//! # MCE core
//!
//! Client-side implementation of the Bluetooth Message Access Profile:
//! MAS instance discovery, per-instance OBEX sessions, request routing,
//! and the MNS notification-receiving server.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                   MapClientService                       │
//! │   (admission control, snapshots, dispatcher task)       │
//! ├─────────────────────────────────────────────────────────┤
//! │      DeviceController (one per remote device)           │
//! │   (SDP discovery, request routing, busy aggregation)    │
//! ├─────────────────────────────────────────────────────────┤
//! │  InstanceStateMachine → InstanceClient → ObexSession    │
//! │   (lifecycle, single-flight requests, FIFO queue)       │
//! ├─────────────────────────────────────────────────────────┤
//! │           MnsServer (inbound event reports)             │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! All state mutation runs on one dispatcher task per service; stack and
//! transport callbacks post owned events onto it. Synchronous inquiry
//! methods read from snapshot maps the dispatcher maintains.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod codec;
pub mod device;
pub mod error;
pub mod instance;
pub(crate) mod mns;
pub mod observer;
pub mod params;
pub mod request;
pub mod service;
pub mod strategy;
pub mod types;

pub use codec::{EventReport, MessageEntry};
pub use error::{AdmissionStatus, MapError};
pub use observer::{
    ActionData, ActionReport, BmessageReport, ConversationListingReport, MapAction,
    MapClientObserver, MessagesListingReport, OwnerStatus, RequestStatus,
};
pub use request::{
    Continuation, ConversationListingParams, GetMessageParams, MapRequest, MessagesListingParams,
    OwnerStatusParams, PushMessageParams, Report, SetMessageStatusParams,
};
pub use service::{MapClientService, ServiceConfig, ServiceEvent};
pub use strategy::{JsonStrategyStore, StrategyStore};
pub use types::{
    Address, ConnectionState, ConnectionStrategy, DeviceSnapshot, MasInstanceInfo,
    MasInstanceInfoList, MessageTypeMask, TargetState, MAS_TARGET_UUID, MNS_TARGET_UUID,
};

//! Observer interface and completion report types.
//!
//! Every accepted operation eventually yields exactly one terminal
//! observer callback; continuation-style operations (unread-message
//! retrieval) may yield intermediate callbacks first.

use crate::codec::{EventReport, MessageEntry};
use crate::types::{Address, ConnectionState};

/// Outcome of one request as reported to the observer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    /// Peer accepted the request
    Success,
    /// Peer rejected or the exchange failed
    Failure,
    /// Peer does not implement the operation, or no instance serves it
    NotSupported,
}

/// Action kinds reported through [`MapClientObserver::on_map_action_completed`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapAction {
    /// Notification filter update
    SetNotificationFilter,
    /// Notification registration update
    SetNotificationRegistration,
    /// MAS instance information retrieval
    GetMasInstanceInfo,
    /// Folder listing retrieval
    GetFolderListing,
    /// Folder path change
    SetFolderPath,
    /// Message push
    PushMessage,
    /// Inbox update
    UpdateInbox,
    /// Owner status update
    SetOwnerStatus,
    /// Owner status retrieval
    GetOwnerStatus,
    /// Message status update
    SetMessageStatus,
}

/// Owner status fields from a GetOwnerStatus response
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OwnerStatus {
    /// Presence availability
    pub availability: Option<u8>,
    /// Presence text
    pub text: Option<String>,
    /// Last activity timestamp
    pub last_activity: Option<String>,
    /// Chat state
    pub chat_state: Option<u8>,
}

/// Payload attached to an action completion
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ActionData {
    /// No payload
    #[default]
    None,
    /// Handle assigned to a pushed message
    PushedHandle(String),
    /// Owner status fields
    OwnerStatus(OwnerStatus),
    /// Raw folder-listing body and its reported size
    FolderListing {
        /// Listing body
        body: String,
        /// FolderListingSize parameter
        size: Option<u16>,
    },
    /// MAS instance information
    InstanceInfo {
        /// Owner UCI reported by the instance
        owner_uci: Option<String>,
        /// Instance description body
        body: String,
    },
}

/// Completion report for action-category requests
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionReport {
    /// Which action completed
    pub action: MapAction,
    /// Outcome
    pub status: RequestStatus,
    /// Action-specific payload
    pub data: ActionData,
}

impl ActionReport {
    /// Report with no payload
    #[must_use]
    pub fn plain(action: MapAction, status: RequestStatus) -> Self {
        Self {
            action,
            status,
            data: ActionData::None,
        }
    }
}

/// Completion report for message-body requests
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BmessageReport {
    /// Outcome
    pub status: RequestStatus,
    /// Handle of the retrieved message; absent on the terminal report of
    /// an unread-message sequence
    pub handle: Option<String>,
    /// bMessage payload, opaque to this layer
    pub bmessage: String,
    /// FractionDeliver parameter
    pub fraction_deliver: Option<u8>,
    /// True for intermediate reports of a multi-message sequence
    pub more_coming: bool,
}

/// Completion report for messages-listing requests
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessagesListingReport {
    /// Outcome
    pub status: RequestStatus,
    /// Raw listing body
    pub body: String,
    /// Parsed entries
    pub entries: Vec<MessageEntry>,
    /// NewMessage parameter
    pub new_message: Option<bool>,
    /// MseTime parameter
    pub mse_time: Option<String>,
    /// ListingSize parameter
    pub listing_size: Option<u16>,
}

/// Completion report for conversation-listing requests
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationListingReport {
    /// Outcome
    pub status: RequestStatus,
    /// Raw listing body
    pub body: String,
    /// ListingSize parameter
    pub listing_size: Option<u16>,
    /// DatabaseIdentifier parameter
    pub database_identifier: Option<Vec<u8>>,
    /// ConversationListingVersionCounter parameter
    pub version_counter: Option<Vec<u8>>,
}

/// Observer for protocol results and connection events. All methods have
/// no-op defaults; implementations override what they consume. Callbacks
/// run on the service dispatcher and must not block.
pub trait MapClientObserver: Send + Sync {
    /// Device-level connection state change
    fn on_connection_state_changed(&self, _address: Address, _state: ConnectionState) {}

    /// Action-category request completed
    fn on_map_action_completed(&self, _address: Address, _report: ActionReport) {}

    /// Message body retrieved, or a message-retrieval sequence ended
    fn on_bmessage_completed(&self, _address: Address, _report: BmessageReport) {}

    /// Messages listing retrieved
    fn on_messages_listing_completed(&self, _address: Address, _report: MessagesListingReport) {}

    /// Conversation listing retrieved
    fn on_conversation_listing_completed(
        &self,
        _address: Address,
        _report: ConversationListingReport,
    ) {
    }

    /// MNS event report received from the peer
    fn on_map_event_reported(&self, _address: Address, _event: EventReport) {}

    /// OR-reduced device busy flag changed; drives power management
    fn on_device_busy_changed(&self, _address: Address, _busy: bool) {}
}

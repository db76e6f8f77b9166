//! MAP application-parameter tag table and value constants.
//!
//! These are wire constants from the MAP specification, carried inside
//! the OBEX application-parameter header as TLV triplets.

/// Application-parameter tag ids
pub mod tag {
    /// Maximum number of listing entries to return
    pub const MAX_LIST_COUNT: u8 = 0x01;
    /// Listing start offset
    pub const LIST_START_OFFSET: u8 = 0x02;
    /// Message-type exclusion mask
    pub const FILTER_MESSAGE_TYPE: u8 = 0x03;
    /// Period filter, begin
    pub const FILTER_PERIOD_BEGIN: u8 = 0x04;
    /// Period filter, end
    pub const FILTER_PERIOD_END: u8 = 0x05;
    /// Read-status filter
    pub const FILTER_READ_STATUS: u8 = 0x06;
    /// Recipient filter
    pub const FILTER_RECIPIENT: u8 = 0x07;
    /// Originator filter
    pub const FILTER_ORIGINATOR: u8 = 0x08;
    /// Priority filter
    pub const FILTER_PRIORITY: u8 = 0x09;
    /// Include attachments
    pub const ATTACHMENT: u8 = 0x0A;
    /// Transparent push
    pub const TRANSPARENT: u8 = 0x0B;
    /// Retry push on failure
    pub const RETRY: u8 = 0x0C;
    /// New-message indicator
    pub const NEW_MESSAGE: u8 = 0x0D;
    /// Notification registration status
    pub const NOTIFICATION_STATUS: u8 = 0x0E;
    /// MAS instance id
    pub const MAS_INSTANCE_ID: u8 = 0x0F;
    /// Listing parameter mask
    pub const PARAMETER_MASK: u8 = 0x10;
    /// Folder-listing size
    pub const FOLDER_LISTING_SIZE: u8 = 0x11;
    /// Messages-listing size
    pub const LISTING_SIZE: u8 = 0x12;
    /// Subject truncation length
    pub const SUBJECT_LENGTH: u8 = 0x13;
    /// Transfer charset
    pub const CHARSET: u8 = 0x14;
    /// Fraction request
    pub const FRACTION_REQUEST: u8 = 0x15;
    /// Fraction deliver
    pub const FRACTION_DELIVER: u8 = 0x16;
    /// Status indicator for message-status updates
    pub const STATUS_INDICATOR: u8 = 0x17;
    /// Status value for message-status updates
    pub const STATUS_VALUE: u8 = 0x18;
    /// MSE local time
    pub const MSE_TIME: u8 = 0x19;
    /// Database identifier
    pub const DATABASE_IDENTIFIER: u8 = 0x1A;
    /// Conversation-listing version counter
    pub const CONV_LISTING_VERSION_COUNTER: u8 = 0x1B;
    /// Presence availability
    pub const PRESENCE_AVAILABILITY: u8 = 0x1C;
    /// Presence text
    pub const PRESENCE_TEXT: u8 = 0x1D;
    /// Last activity timestamp
    pub const LAST_ACTIVITY: u8 = 0x1E;
    /// Last-activity filter, begin
    pub const FILTER_LAST_ACTIVITY_BEGIN: u8 = 0x1F;
    /// Last-activity filter, end
    pub const FILTER_LAST_ACTIVITY_END: u8 = 0x20;
    /// Chat state
    pub const CHAT_STATE: u8 = 0x21;
    /// Conversation id
    pub const CONVERSATION_ID: u8 = 0x22;
    /// Folder version counter
    pub const FOLDER_VERSION_COUNTER: u8 = 0x23;
    /// Message-handle filter
    pub const FILTER_MESSAGE_HANDLE: u8 = 0x24;
    /// Notification filter mask
    pub const NOTIFICATION_FILTER_MASK: u8 = 0x25;
    /// Conversation parameter mask
    pub const CONV_PARAMETER_MASK: u8 = 0x26;
    /// Owner UCI
    pub const OWNER_UCI: u8 = 0x27;
    /// Extended data for message-status updates
    pub const EXTENDED_DATA: u8 = 0x28;
    /// MAP supported features, sent on OBEX CONNECT
    pub const MAP_SUPPORTED_FEATURES: u8 = 0x29;
}

/// Charset values for the Charset parameter
pub mod charset {
    /// Native encoding
    pub const NATIVE: u8 = 0x00;
    /// UTF-8
    pub const UTF8: u8 = 0x01;
}

/// FilterReadStatus values
pub mod read_status {
    /// No filtering
    pub const ALL: u8 = 0x00;
    /// Unread messages only
    pub const UNREAD: u8 = 0x01;
    /// Read messages only
    pub const READ: u8 = 0x02;
}

/// NotificationStatus values
pub mod notification_status {
    /// Notifications off
    pub const OFF: u8 = 0x00;
    /// Notifications on
    pub const ON: u8 = 0x01;
}

/// OBEX Type header strings for each MAP object
pub mod type_str {
    /// Message object
    pub const MESSAGE: &str = "x-bt/message";
    /// Messages listing
    pub const MSG_LISTING: &str = "x-bt/MAP-msg-listing";
    /// Folder listing
    pub const FOLDER_LISTING: &str = "x-obex/folder-listing";
    /// Inbox update action
    pub const MESSAGE_UPDATE: &str = "x-bt/MAP-messageUpdate";
    /// Message-status action
    pub const MESSAGE_STATUS: &str = "x-bt/messageStatus";
    /// Notification registration action
    pub const NOTIFICATION_REGISTRATION: &str = "x-bt/MAP-NotificationRegistration";
    /// Notification filter action
    pub const NOTIFICATION_FILTER: &str = "x-bt/MAP-notification-filter";
    /// MAS instance information
    pub const MAS_INSTANCE_INFO: &str = "x-bt/MASInstanceInformation";
    /// Owner status
    pub const OWNER_STATUS: &str = "x-bt/ownerStatus";
    /// Conversation listing
    pub const CONVO_LISTING: &str = "x-bt/MAP-convo-listing";
    /// MNS event report
    pub const EVENT_REPORT: &str = "x-bt/MAP-event-report";
}

/// Filler byte sent as the body of bodyless PUT actions
pub const ACTION_FILLER: u8 = 0x30;

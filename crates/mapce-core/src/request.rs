//! MAP request command hierarchy.
//!
//! One variant per operation; each builds its outgoing OBEX exchange and
//! parses the peer response into a typed report. Responses walk the
//! application-parameter block by tag and treat an absent tag as "not
//! present"; only the top-level OBEX response code is authoritative for
//! success or failure.
//!
//! `GetUnreadMessages` is a composite: it first runs a messages listing,
//! then retrieves the returned handles one at a time, reporting each
//! message with a continue-style callback and finishing once the handle
//! queue drains or a sub-send fails.

use std::collections::VecDeque;

use mapce_obex::{
    response_code, HeaderSet, ObexResponse, ObexSession, PacketSink, PathSegment, ResponseCode,
    SessionEvent, TlvBlock,
};

use crate::codec::{parse_messages_listing, MessageEntry};
use crate::observer::{
    ActionData, ActionReport, BmessageReport, ConversationListingReport, MapAction,
    MessagesListingReport, OwnerStatus, RequestStatus,
};
use crate::params::{charset, read_status, tag, type_str, ACTION_FILLER};
use crate::types::MessageTypeMask;

/// Continuation code returned by response processing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Continuation {
    /// Exchange continues, nothing to report
    ContinueNoCallback,
    /// Exchange continues, intermediate report attached
    ContinueWithCallback,
    /// Exchange done, terminal report attached
    Finish,
    /// Exchange done, nothing to report (internal requests)
    FinishNoCallback,
    /// Exchange failed, terminal failure report attached
    FinishNg,
}

impl Continuation {
    /// True when the in-flight slot is released
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Continuation::Finish | Continuation::FinishNoCallback | Continuation::FinishNg
        )
    }
}

/// A typed completion or intermediate report
#[derive(Debug, Clone)]
pub enum Report {
    /// Action-category report
    Action(ActionReport),
    /// Message-body report
    Bmessage(BmessageReport),
    /// Messages-listing report
    MessagesListing(MessagesListingReport),
    /// Conversation-listing report
    ConversationListing(ConversationListingReport),
}

/// Result of feeding one session event to the current request
#[derive(Debug)]
pub struct RequestOutcome {
    /// Whether the in-flight slot stays occupied
    pub continuation: Continuation,
    /// Reports to deliver, in order
    pub reports: Vec<Report>,
}

impl RequestOutcome {
    fn going(reports: Vec<Report>) -> Self {
        Self {
            continuation: Continuation::ContinueNoCallback,
            reports,
        }
    }

    fn done(report: Report) -> Self {
        Self {
            continuation: Continuation::Finish,
            reports: vec![report],
        }
    }

    fn failed(report: Report) -> Self {
        Self {
            continuation: Continuation::FinishNg,
            reports: vec![report],
        }
    }
}

/// Parameters for a messages-listing request
#[derive(Debug, Clone, Default)]
pub struct MessagesListingParams {
    /// Folder to list, relative to the current path
    pub folder: String,
    /// MaxListCount
    pub max_list_count: Option<u16>,
    /// ListStartOffset
    pub list_start_offset: Option<u16>,
    /// FilterMessageType exclusion bits
    pub filter_message_type: Option<u8>,
    /// FilterReadStatus
    pub filter_read_status: Option<u8>,
    /// FilterRecipient substring
    pub filter_recipient: Option<String>,
    /// FilterOriginator substring
    pub filter_originator: Option<String>,
    /// FilterPriority
    pub filter_priority: Option<u8>,
    /// SubjectLength truncation
    pub subject_length: Option<u8>,
    /// ParameterMask
    pub parameter_mask: Option<u32>,
}

/// Parameters for a message retrieval
#[derive(Debug, Clone)]
pub struct GetMessageParams {
    /// Message handle
    pub handle: String,
    /// Include attachments
    pub attachment: bool,
    /// Transfer charset
    pub charset: u8,
    /// FractionRequest
    pub fraction_request: Option<u8>,
}

/// Parameters for a message push
#[derive(Debug, Clone)]
pub struct PushMessageParams {
    /// Destination folder
    pub folder: String,
    /// bMessage payload
    pub bmessage: String,
    /// Transparent flag
    pub transparent: Option<bool>,
    /// Retry flag
    pub retry: Option<bool>,
    /// Transfer charset
    pub charset: u8,
}

/// Parameters for a message-status update
#[derive(Debug, Clone)]
pub struct SetMessageStatusParams {
    /// Message handle
    pub handle: String,
    /// StatusIndicator
    pub indicator: u8,
    /// StatusValue
    pub value: u8,
    /// ExtendedData
    pub extended_data: Option<String>,
}

/// Parameters for an owner-status update
#[derive(Debug, Clone, Default)]
pub struct OwnerStatusParams {
    /// PresenceAvailability
    pub availability: Option<u8>,
    /// PresenceText
    pub text: Option<String>,
    /// LastActivity timestamp
    pub last_activity: Option<String>,
    /// ChatState
    pub chat_state: Option<u8>,
    /// ConversationID the status applies to
    pub conversation_id: Option<String>,
    /// Owner UCI used for instance routing
    pub owner_uci: Option<String>,
}

/// Parameters for a conversation-listing request
#[derive(Debug, Clone, Default)]
pub struct ConversationListingParams {
    /// MaxListCount
    pub max_list_count: Option<u16>,
    /// ListStartOffset
    pub list_start_offset: Option<u16>,
    /// FilterLastActivityBegin
    pub filter_last_activity_begin: Option<String>,
    /// FilterLastActivityEnd
    pub filter_last_activity_end: Option<String>,
    /// FilterReadStatus
    pub filter_read_status: Option<u8>,
    /// FilterRecipient substring
    pub filter_recipient: Option<String>,
    /// Restrict to one conversation
    pub conversation_id: Option<String>,
    /// ConvParameterMask
    pub conv_parameter_mask: Option<u32>,
    /// Owner UCI used for instance routing
    pub owner_uci: Option<String>,
}

/// One MAP request
#[derive(Debug)]
pub enum MapRequest {
    /// Update the MNS notification filter mask
    SetNotificationFilter {
        /// NotificationFilterMask bits
        mask: u32,
    },
    /// Switch MNS notification registration on or off
    SetNotificationRegistration {
        /// Desired registration state
        enable: bool,
    },
    /// Retrieve MAS instance information
    GetMasInstanceInfo {
        /// Instance to query
        instance_id: u8,
    },
    /// Retrieve a folder listing
    GetFolderListing {
        /// MaxListCount
        max_list_count: Option<u16>,
        /// ListStartOffset
        list_start_offset: Option<u16>,
    },
    /// Change the current folder path
    SetFolderPath {
        /// Segments to apply in order
        segments: Vec<PathSegment>,
    },
    /// Push a message
    PushMessage(PushMessageParams),
    /// Retrieve one message body
    GetMessage(GetMessageParams),
    /// Composite: list unread handles, then retrieve each
    GetUnreadMessages {
        /// Types to retrieve
        message_type: MessageTypeMask,
        /// Upper bound on retrieved messages
        max_count: u16,
        /// Handles still to fetch
        pending: VecDeque<String>,
        /// Handle currently being fetched
        current: Option<String>,
    },
    /// Ask the server to update its inbox
    UpdateInbox,
    /// Update the owner status
    SetOwnerStatus(OwnerStatusParams),
    /// Retrieve the owner status
    GetOwnerStatus {
        /// ConversationID to query
        conversation_id: Option<String>,
        /// Owner UCI used for instance routing
        owner_uci: Option<String>,
    },
    /// Update a message's status indicator
    SetMessageStatus(SetMessageStatusParams),
    /// Retrieve a conversation listing
    GetConversationListing(ConversationListingParams),
    /// Retrieve a messages listing
    GetMessagesListing(MessagesListingParams),
}

fn status_of(code: ResponseCode) -> RequestStatus {
    if code.is_success() {
        RequestStatus::Success
    } else if code.as_u8() == response_code::NOT_IMPLEMENTED
        || code.as_u8() == response_code::FORBIDDEN
    {
        RequestStatus::NotSupported
    } else {
        RequestStatus::Failure
    }
}

fn bool_param(v: bool) -> u8 {
    u8::from(v)
}

impl MapRequest {
    /// Short name for logs
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            MapRequest::SetNotificationFilter { .. } => "SetNotificationFilter",
            MapRequest::SetNotificationRegistration { .. } => "SetNotificationRegistration",
            MapRequest::GetMasInstanceInfo { .. } => "GetMasInstanceInfo",
            MapRequest::GetFolderListing { .. } => "GetFolderListing",
            MapRequest::SetFolderPath { .. } => "SetFolderPath",
            MapRequest::PushMessage(_) => "PushMessage",
            MapRequest::GetMessage(_) => "GetMessage",
            MapRequest::GetUnreadMessages { .. } => "GetUnreadMessages",
            MapRequest::UpdateInbox => "UpdateInbox",
            MapRequest::SetOwnerStatus(_) => "SetOwnerStatus",
            MapRequest::GetOwnerStatus { .. } => "GetOwnerStatus",
            MapRequest::SetMessageStatus(_) => "SetMessageStatus",
            MapRequest::GetConversationListing(_) => "GetConversationListing",
            MapRequest::GetMessagesListing(_) => "GetMessagesListing",
        }
    }

    /// Message types an instance must support to serve this request
    #[must_use]
    pub fn required_message_types(&self) -> MessageTypeMask {
        match self {
            MapRequest::GetUnreadMessages { message_type, .. } => *message_type,
            _ => MessageTypeMask::all(),
        }
    }

    /// Owner UCI preference for instance routing
    #[must_use]
    pub fn owner_uci(&self) -> Option<&str> {
        match self {
            MapRequest::SetOwnerStatus(p) => p.owner_uci.as_deref(),
            MapRequest::GetOwnerStatus { owner_uci, .. } => owner_uci.as_deref(),
            MapRequest::GetConversationListing(p) => p.owner_uci.as_deref(),
            _ => None,
        }
    }

    /// Issue the OBEX exchange for this request.
    ///
    /// # Errors
    ///
    /// Propagates OBEX/transport failures; the request did not start.
    pub fn start<S: PacketSink>(
        &mut self,
        session: &mut ObexSession<S>,
    ) -> mapce_obex::error::Result<()> {
        match self {
            MapRequest::SetNotificationFilter { mask } => {
                let mut params = TlvBlock::new();
                params.push_u32(tag::NOTIFICATION_FILTER_MASK, *mask);
                put_action(session, type_str::NOTIFICATION_FILTER, params)
            }
            MapRequest::SetNotificationRegistration { enable } => {
                let mut params = TlvBlock::new();
                params.push_u8(tag::NOTIFICATION_STATUS, bool_param(*enable));
                put_action(session, type_str::NOTIFICATION_REGISTRATION, params)
            }
            MapRequest::GetMasInstanceInfo { instance_id } => {
                let mut headers = HeaderSet::new();
                headers.set_type(type_str::MAS_INSTANCE_INFO);
                let mut params = TlvBlock::new();
                params.push_u8(tag::MAS_INSTANCE_ID, *instance_id);
                headers.set_app_params(params.encode());
                session.get(headers, 0)
            }
            MapRequest::GetFolderListing {
                max_list_count,
                list_start_offset,
            } => {
                let mut headers = HeaderSet::new();
                headers.set_type(type_str::FOLDER_LISTING);
                let mut params = TlvBlock::new();
                if let Some(v) = max_list_count {
                    params.push_u16(tag::MAX_LIST_COUNT, *v);
                }
                if let Some(v) = list_start_offset {
                    params.push_u16(tag::LIST_START_OFFSET, *v);
                }
                if !params.is_empty() {
                    headers.set_app_params(params.encode());
                }
                session.get(headers, 0)
            }
            MapRequest::SetFolderPath { segments } => session.set_path(segments.clone()),
            MapRequest::PushMessage(p) => {
                let mut headers = HeaderSet::new();
                headers.set_type(type_str::MESSAGE);
                headers.set_name(&p.folder);
                let mut params = TlvBlock::new();
                params.push_u8(tag::CHARSET, p.charset);
                if let Some(v) = p.transparent {
                    params.push_u8(tag::TRANSPARENT, bool_param(v));
                }
                if let Some(v) = p.retry {
                    params.push_u8(tag::RETRY, bool_param(v));
                }
                headers.set_app_params(params.encode());
                session.put(headers, p.bmessage.clone().into_bytes())
            }
            MapRequest::GetMessage(p) => send_get_message(session, &p.handle, p),
            MapRequest::GetUnreadMessages {
                message_type,
                max_count,
                ..
            } => {
                let mut headers = HeaderSet::new();
                headers.set_type(type_str::MSG_LISTING);
                headers.set_name("inbox");
                let mut params = TlvBlock::new();
                params.push_u16(tag::MAX_LIST_COUNT, *max_count);
                params.push_u8(tag::FILTER_READ_STATUS, read_status::UNREAD);
                // exclusion mask: filter out everything the caller did not ask for
                params.push_u8(
                    tag::FILTER_MESSAGE_TYPE,
                    MessageTypeMask::all().bits() & !message_type.bits(),
                );
                headers.set_app_params(params.encode());
                session.get(headers, 0)
            }
            MapRequest::UpdateInbox => {
                put_action(session, type_str::MESSAGE_UPDATE, TlvBlock::new())
            }
            MapRequest::SetOwnerStatus(p) => {
                let mut params = TlvBlock::new();
                if let Some(v) = p.availability {
                    params.push_u8(tag::PRESENCE_AVAILABILITY, v);
                }
                if let Some(v) = &p.text {
                    params.push_text(tag::PRESENCE_TEXT, v);
                }
                if let Some(v) = &p.last_activity {
                    params.push_text(tag::LAST_ACTIVITY, v);
                }
                if let Some(v) = p.chat_state {
                    params.push_u8(tag::CHAT_STATE, v);
                }
                if let Some(v) = &p.conversation_id {
                    params.push_text(tag::CONVERSATION_ID, v);
                }
                put_action(session, type_str::OWNER_STATUS, params)
            }
            MapRequest::GetOwnerStatus {
                conversation_id, ..
            } => {
                let mut headers = HeaderSet::new();
                headers.set_type(type_str::OWNER_STATUS);
                let mut params = TlvBlock::new();
                if let Some(v) = conversation_id {
                    params.push_text(tag::CONVERSATION_ID, v);
                }
                if !params.is_empty() {
                    headers.set_app_params(params.encode());
                }
                session.get(headers, 0)
            }
            MapRequest::SetMessageStatus(p) => {
                let mut headers = HeaderSet::new();
                headers.set_type(type_str::MESSAGE_STATUS);
                headers.set_name(&p.handle);
                let mut params = TlvBlock::new();
                params.push_u8(tag::STATUS_INDICATOR, p.indicator);
                params.push_u8(tag::STATUS_VALUE, p.value);
                if let Some(v) = &p.extended_data {
                    params.push_text(tag::EXTENDED_DATA, v);
                }
                headers.set_app_params(params.encode());
                session.put(headers, vec![ACTION_FILLER])
            }
            MapRequest::GetConversationListing(p) => {
                let mut headers = HeaderSet::new();
                headers.set_type(type_str::CONVO_LISTING);
                let mut params = TlvBlock::new();
                if let Some(v) = p.max_list_count {
                    params.push_u16(tag::MAX_LIST_COUNT, v);
                }
                if let Some(v) = p.list_start_offset {
                    params.push_u16(tag::LIST_START_OFFSET, v);
                }
                if let Some(v) = &p.filter_last_activity_begin {
                    params.push_text(tag::FILTER_LAST_ACTIVITY_BEGIN, v);
                }
                if let Some(v) = &p.filter_last_activity_end {
                    params.push_text(tag::FILTER_LAST_ACTIVITY_END, v);
                }
                if let Some(v) = p.filter_read_status {
                    params.push_u8(tag::FILTER_READ_STATUS, v);
                }
                if let Some(v) = &p.filter_recipient {
                    params.push_text(tag::FILTER_RECIPIENT, v);
                }
                if let Some(v) = &p.conversation_id {
                    params.push_text(tag::CONVERSATION_ID, v);
                }
                if let Some(v) = p.conv_parameter_mask {
                    params.push_u32(tag::CONV_PARAMETER_MASK, v);
                }
                if !params.is_empty() {
                    headers.set_app_params(params.encode());
                }
                session.get(headers, 0)
            }
            MapRequest::GetMessagesListing(p) => {
                let mut headers = HeaderSet::new();
                headers.set_type(type_str::MSG_LISTING);
                headers.set_name(&p.folder);
                let mut params = TlvBlock::new();
                if let Some(v) = p.max_list_count {
                    params.push_u16(tag::MAX_LIST_COUNT, v);
                }
                if let Some(v) = p.list_start_offset {
                    params.push_u16(tag::LIST_START_OFFSET, v);
                }
                if let Some(v) = p.filter_message_type {
                    params.push_u8(tag::FILTER_MESSAGE_TYPE, v);
                }
                if let Some(v) = p.filter_read_status {
                    params.push_u8(tag::FILTER_READ_STATUS, v);
                }
                if let Some(v) = &p.filter_recipient {
                    params.push_text(tag::FILTER_RECIPIENT, v);
                }
                if let Some(v) = &p.filter_originator {
                    params.push_text(tag::FILTER_ORIGINATOR, v);
                }
                if let Some(v) = p.filter_priority {
                    params.push_u8(tag::FILTER_PRIORITY, v);
                }
                if let Some(v) = p.subject_length {
                    params.push_u8(tag::SUBJECT_LENGTH, v);
                }
                if let Some(v) = p.parameter_mask {
                    params.push_u32(tag::PARAMETER_MASK, v);
                }
                if !params.is_empty() {
                    headers.set_app_params(params.encode());
                }
                session.get(headers, 0)
            }
        }
    }

    /// Process one session event against this request.
    pub fn handle_event<S: PacketSink>(
        &mut self,
        session: &mut ObexSession<S>,
        event: &SessionEvent,
    ) -> RequestOutcome {
        match self {
            MapRequest::SetNotificationFilter { .. } => {
                action_outcome(event, MapAction::SetNotificationFilter)
            }
            MapRequest::SetNotificationRegistration { .. } => {
                action_outcome(event, MapAction::SetNotificationRegistration)
            }
            MapRequest::GetMasInstanceInfo { .. } => match event {
                SessionEvent::GetDataAvailable { response } => {
                    let params = response_params(response);
                    let body = response_body(response);
                    RequestOutcome::done(Report::Action(ActionReport {
                        action: MapAction::GetMasInstanceInfo,
                        status: RequestStatus::Success,
                        data: ActionData::InstanceInfo {
                            owner_uci: params.get_text(tag::OWNER_UCI).map(str::to_owned),
                            body,
                        },
                    }))
                }
                other => failure_outcome(other, MapAction::GetMasInstanceInfo),
            },
            MapRequest::GetFolderListing { .. } => match event {
                SessionEvent::GetDataAvailable { response } => {
                    let params = response_params(response);
                    RequestOutcome::done(Report::Action(ActionReport {
                        action: MapAction::GetFolderListing,
                        status: RequestStatus::Success,
                        data: ActionData::FolderListing {
                            body: response_body(response),
                            size: params.get_u16(tag::FOLDER_LISTING_SIZE),
                        },
                    }))
                }
                other => failure_outcome(other, MapAction::GetFolderListing),
            },
            MapRequest::SetFolderPath { .. } => match event {
                SessionEvent::SetPathCompleted { code } => {
                    let status = status_of(*code);
                    let report = Report::Action(ActionReport::plain(MapAction::SetFolderPath, status));
                    if status == RequestStatus::Success {
                        RequestOutcome::done(report)
                    } else {
                        RequestOutcome::failed(report)
                    }
                }
                other => failure_outcome(other, MapAction::SetFolderPath),
            },
            MapRequest::PushMessage(_) => match event {
                SessionEvent::ActionCompleted { response, .. } => {
                    let status = status_of(response.code);
                    let data = response
                        .headers
                        .name()
                        .map(|h| ActionData::PushedHandle(h.to_owned()))
                        .unwrap_or_default();
                    let report = Report::Action(ActionReport {
                        action: MapAction::PushMessage,
                        status,
                        data,
                    });
                    if status == RequestStatus::Success {
                        RequestOutcome::done(report)
                    } else {
                        RequestOutcome::failed(report)
                    }
                }
                other => failure_outcome(other, MapAction::PushMessage),
            },
            MapRequest::GetMessage(_) => match event {
                SessionEvent::GetDataAvailable { response } => {
                    let params = response_params(response);
                    RequestOutcome::done(Report::Bmessage(BmessageReport {
                        status: RequestStatus::Success,
                        handle: None,
                        bmessage: response_body(response),
                        fraction_deliver: params.get_u8(tag::FRACTION_DELIVER),
                        more_coming: false,
                    }))
                }
                other => RequestOutcome::failed(Report::Bmessage(bmessage_failure(other))),
            },
            MapRequest::GetUnreadMessages {
                max_count,
                pending,
                current,
                ..
            } => unread_event(session, event, *max_count, pending, current),
            MapRequest::UpdateInbox => action_outcome(event, MapAction::UpdateInbox),
            MapRequest::SetOwnerStatus(_) => action_outcome(event, MapAction::SetOwnerStatus),
            MapRequest::GetOwnerStatus { .. } => match event {
                SessionEvent::GetDataAvailable { response } => {
                    let params = response_params(response);
                    RequestOutcome::done(Report::Action(ActionReport {
                        action: MapAction::GetOwnerStatus,
                        status: RequestStatus::Success,
                        data: ActionData::OwnerStatus(OwnerStatus {
                            availability: params.get_u8(tag::PRESENCE_AVAILABILITY),
                            text: params.get_text(tag::PRESENCE_TEXT).map(str::to_owned),
                            last_activity: params.get_text(tag::LAST_ACTIVITY).map(str::to_owned),
                            chat_state: params.get_u8(tag::CHAT_STATE),
                        }),
                    }))
                }
                other => failure_outcome(other, MapAction::GetOwnerStatus),
            },
            MapRequest::SetMessageStatus(_) => action_outcome(event, MapAction::SetMessageStatus),
            MapRequest::GetConversationListing(_) => match event {
                SessionEvent::GetDataAvailable { response } => {
                    let params = response_params(response);
                    RequestOutcome::done(Report::ConversationListing(ConversationListingReport {
                        status: RequestStatus::Success,
                        body: response_body(response),
                        listing_size: params.get_u16(tag::LISTING_SIZE),
                        database_identifier: params
                            .get(tag::DATABASE_IDENTIFIER)
                            .map(<[u8]>::to_vec),
                        version_counter: params
                            .get(tag::CONV_LISTING_VERSION_COUNTER)
                            .map(<[u8]>::to_vec),
                    }))
                }
                other => RequestOutcome::failed(Report::ConversationListing(
                    ConversationListingReport {
                        status: event_failure_status(other),
                        body: String::new(),
                        listing_size: None,
                        database_identifier: None,
                        version_counter: None,
                    },
                )),
            },
            MapRequest::GetMessagesListing(_) => match event {
                SessionEvent::GetDataAvailable { response } => {
                    let params = response_params(response);
                    let body = response_body(response);
                    let entries = parse_messages_listing(&body);
                    RequestOutcome::done(Report::MessagesListing(MessagesListingReport {
                        status: RequestStatus::Success,
                        body,
                        entries,
                        new_message: params.get_u8(tag::NEW_MESSAGE).map(|v| v != 0),
                        mse_time: params.get_text(tag::MSE_TIME).map(str::to_owned),
                        listing_size: params.get_u16(tag::LISTING_SIZE),
                    }))
                }
                other => RequestOutcome::failed(Report::MessagesListing(MessagesListingReport {
                    status: event_failure_status(other),
                    body: String::new(),
                    entries: Vec::new(),
                    new_message: None,
                    mse_time: None,
                    listing_size: None,
                })),
            },
        }
    }

    /// Synthesize the terminal failure report for this request's
    /// category; used when the request never reaches the peer (routing
    /// failure, send failure, teardown).
    #[must_use]
    pub fn failure_report(&self, status: RequestStatus) -> Report {
        match self {
            MapRequest::SetNotificationFilter { .. } => {
                Report::Action(ActionReport::plain(MapAction::SetNotificationFilter, status))
            }
            MapRequest::SetNotificationRegistration { .. } => Report::Action(ActionReport::plain(
                MapAction::SetNotificationRegistration,
                status,
            )),
            MapRequest::GetMasInstanceInfo { .. } => {
                Report::Action(ActionReport::plain(MapAction::GetMasInstanceInfo, status))
            }
            MapRequest::GetFolderListing { .. } => {
                Report::Action(ActionReport::plain(MapAction::GetFolderListing, status))
            }
            MapRequest::SetFolderPath { .. } => {
                Report::Action(ActionReport::plain(MapAction::SetFolderPath, status))
            }
            MapRequest::PushMessage(_) => {
                Report::Action(ActionReport::plain(MapAction::PushMessage, status))
            }
            MapRequest::GetMessage(_) | MapRequest::GetUnreadMessages { .. } => {
                Report::Bmessage(BmessageReport {
                    status,
                    handle: None,
                    bmessage: String::new(),
                    fraction_deliver: None,
                    more_coming: false,
                })
            }
            MapRequest::UpdateInbox => {
                Report::Action(ActionReport::plain(MapAction::UpdateInbox, status))
            }
            MapRequest::SetOwnerStatus(_) => {
                Report::Action(ActionReport::plain(MapAction::SetOwnerStatus, status))
            }
            MapRequest::GetOwnerStatus { .. } => {
                Report::Action(ActionReport::plain(MapAction::GetOwnerStatus, status))
            }
            MapRequest::SetMessageStatus(_) => {
                Report::Action(ActionReport::plain(MapAction::SetMessageStatus, status))
            }
            MapRequest::GetConversationListing(_) => {
                Report::ConversationListing(ConversationListingReport {
                    status,
                    body: String::new(),
                    listing_size: None,
                    database_identifier: None,
                    version_counter: None,
                })
            }
            MapRequest::GetMessagesListing(_) => {
                Report::MessagesListing(MessagesListingReport {
                    status,
                    body: String::new(),
                    entries: Vec::new(),
                    new_message: None,
                    mse_time: None,
                    listing_size: None,
                })
            }
        }
    }

    /// Build a new unread-messages composite
    #[must_use]
    pub fn unread(message_type: MessageTypeMask, max_count: u16) -> Self {
        MapRequest::GetUnreadMessages {
            message_type,
            max_count,
            pending: VecDeque::new(),
            current: None,
        }
    }
}

fn put_action<S: PacketSink>(
    session: &mut ObexSession<S>,
    ty: &str,
    params: TlvBlock,
) -> mapce_obex::error::Result<()> {
    let mut headers = HeaderSet::new();
    headers.set_type(ty);
    if !params.is_empty() {
        headers.set_app_params(params.encode());
    }
    session.put(headers, vec![ACTION_FILLER])
}

fn send_get_message<S: PacketSink>(
    session: &mut ObexSession<S>,
    handle: &str,
    p: &GetMessageParams,
) -> mapce_obex::error::Result<()> {
    let mut headers = HeaderSet::new();
    headers.set_type(type_str::MESSAGE);
    headers.set_name(handle);
    let mut params = TlvBlock::new();
    params.push_u8(tag::ATTACHMENT, bool_param(p.attachment));
    params.push_u8(tag::CHARSET, p.charset);
    if let Some(v) = p.fraction_request {
        params.push_u8(tag::FRACTION_REQUEST, v);
    }
    headers.set_app_params(params.encode());
    session.get(headers, 0)
}

fn send_unread_fetch<S: PacketSink>(
    session: &mut ObexSession<S>,
    handle: &str,
) -> mapce_obex::error::Result<()> {
    let p = GetMessageParams {
        handle: handle.to_owned(),
        attachment: false,
        charset: charset::UTF8,
        fraction_request: None,
    };
    send_get_message(session, handle, &p)
}

fn unread_event<S: PacketSink>(
    session: &mut ObexSession<S>,
    event: &SessionEvent,
    max_count: u16,
    pending: &mut VecDeque<String>,
    current: &mut Option<String>,
) -> RequestOutcome {
    let failure = |status| {
        Report::Bmessage(BmessageReport {
            status,
            handle: None,
            bmessage: String::new(),
            fraction_deliver: None,
            more_coming: false,
        })
    };
    match event {
        SessionEvent::GetDataAvailable { response } if current.is_none() && pending.is_empty() => {
            // listing phase result
            let body = response_body(response);
            let handles: Vec<String> = parse_messages_listing(&body)
                .into_iter()
                .filter(|e: &MessageEntry| e.read != Some(true))
                .map(|e| e.handle)
                .take(max_count as usize)
                .collect();
            if handles.is_empty() {
                return RequestOutcome::done(failure(RequestStatus::Success));
            }
            let mut queue: VecDeque<String> = handles.into();
            let first = queue.pop_front().expect("non-empty queue");
            if let Err(e) = send_unread_fetch(session, &first) {
                tracing::warn!("unread fetch send failed: {e}");
                return RequestOutcome::failed(failure(RequestStatus::Failure));
            }
            *current = Some(first);
            *pending = queue;
            RequestOutcome::going(Vec::new())
        }
        SessionEvent::GetDataAvailable { response } => {
            // one message retrieved
            let params = response_params(response);
            let handle = current.take();
            let message = Report::Bmessage(BmessageReport {
                status: RequestStatus::Success,
                handle,
                bmessage: response_body(response),
                fraction_deliver: params.get_u8(tag::FRACTION_DELIVER),
                more_coming: true,
            });
            match pending.pop_front() {
                Some(next) => {
                    if let Err(e) = send_unread_fetch(session, &next) {
                        tracing::warn!("unread fetch send failed: {e}");
                        pending.clear();
                        return RequestOutcome {
                            continuation: Continuation::FinishNg,
                            reports: vec![message, failure(RequestStatus::Failure)],
                        };
                    }
                    *current = Some(next);
                    RequestOutcome {
                        continuation: Continuation::ContinueWithCallback,
                        reports: vec![message],
                    }
                }
                None => RequestOutcome {
                    continuation: Continuation::Finish,
                    reports: vec![message, failure(RequestStatus::Success)],
                },
            }
        }
        other => {
            pending.clear();
            *current = None;
            RequestOutcome::failed(failure(event_failure_status(other)))
        }
    }
}

fn action_outcome(event: &SessionEvent, action: MapAction) -> RequestOutcome {
    match event {
        SessionEvent::ActionCompleted { response, .. } => {
            let status = status_of(response.code);
            let report = Report::Action(ActionReport::plain(action, status));
            if status == RequestStatus::Success {
                RequestOutcome::done(report)
            } else {
                RequestOutcome::failed(report)
            }
        }
        other => failure_outcome(other, action),
    }
}

fn failure_outcome(event: &SessionEvent, action: MapAction) -> RequestOutcome {
    RequestOutcome::failed(Report::Action(ActionReport::plain(
        action,
        event_failure_status(event),
    )))
}

fn event_failure_status(event: &SessionEvent) -> RequestStatus {
    match event {
        SessionEvent::ActionCompleted { response, .. } => status_of(response.code),
        SessionEvent::SetPathCompleted { code } => status_of(*code),
        SessionEvent::AbortCompleted => RequestStatus::Failure,
        _ => RequestStatus::Failure,
    }
}

fn bmessage_failure(event: &SessionEvent) -> BmessageReport {
    BmessageReport {
        status: event_failure_status(event),
        handle: None,
        bmessage: String::new(),
        fraction_deliver: None,
        more_coming: false,
    }
}

fn response_params(response: &ObexResponse) -> TlvBlock {
    response
        .headers
        .app_params()
        .map(TlvBlock::decode)
        .unwrap_or_default()
}

fn response_body(response: &ObexResponse) -> String {
    let bytes = response
        .headers
        .end_of_body()
        .or_else(|| response.headers.body())
        .unwrap_or_default();
    String::from_utf8_lossy(bytes).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use mapce_obex::error::Result as ObexResult;
    use mapce_obex::{build_response, opcode, RequestPacket, OBEX_VERSION};
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct VecSink {
        sent: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl PacketSink for VecSink {
        fn send_packet(&self, packet: Vec<u8>) -> ObexResult<()> {
            self.sent.lock().unwrap().push(packet);
            Ok(())
        }
    }

    impl VecSink {
        fn drain(&self) -> Vec<Vec<u8>> {
            std::mem::take(&mut self.sent.lock().unwrap())
        }
    }

    fn session() -> (ObexSession<VecSink>, VecSink) {
        let sink = VecSink::default();
        let mut session = ObexSession::new(sink.clone(), 0x2000, false);
        session.connect(HeaderSet::new()).unwrap();
        sink.drain();
        let mut resp = vec![response_code::SUCCESS, 0, 0, OBEX_VERSION, 0, 0x20, 0x00];
        let len = resp.len() as u16;
        resp[1..3].copy_from_slice(&len.to_be_bytes());
        session.handle_packet(&resp).unwrap();
        (session, sink)
    }

    fn success_get_response(body: &[u8], params: Option<TlvBlock>) -> Vec<u8> {
        let mut headers = HeaderSet::new();
        headers.set_end_of_body(body.to_vec());
        if let Some(p) = params {
            headers.set_app_params(p.encode());
        }
        build_response(response_code::SUCCESS, &[], &headers)
    }

    fn feed<S: PacketSink>(
        session: &mut ObexSession<S>,
        request: &mut MapRequest,
        packet: &[u8],
    ) -> RequestOutcome {
        let event = session.handle_packet(packet).unwrap().unwrap();
        request.handle_event(session, &event)
    }

    #[test]
    fn test_notification_filter_builds_put() {
        let (mut session, sink) = session();
        let mut req = MapRequest::SetNotificationFilter { mask: 0x0000_0003 };
        req.start(&mut session).unwrap();
        let pkt = RequestPacket::parse(&sink.drain()[0]).unwrap();
        assert_eq!(pkt.opcode, opcode::PUT_FINAL);
        assert_eq!(pkt.headers.type_str(), Some(type_str::NOTIFICATION_FILTER));
        let params = TlvBlock::decode(pkt.headers.app_params().unwrap());
        assert_eq!(params.get_u32(tag::NOTIFICATION_FILTER_MASK), Some(3));
        assert_eq!(pkt.headers.end_of_body(), Some(&[ACTION_FILLER][..]));
    }

    #[test]
    fn test_action_success_and_failure_mapping() {
        let (mut session, sink) = session();
        let mut req = MapRequest::UpdateInbox;
        req.start(&mut session).unwrap();
        sink.drain();
        let outcome = feed(
            &mut session,
            &mut req,
            &build_response(response_code::SUCCESS, &[], &HeaderSet::new()),
        );
        assert_eq!(outcome.continuation, Continuation::Finish);
        match &outcome.reports[0] {
            Report::Action(r) => {
                assert_eq!(r.action, MapAction::UpdateInbox);
                assert_eq!(r.status, RequestStatus::Success);
            }
            other => panic!("unexpected report {other:?}"),
        }

        let mut req = MapRequest::UpdateInbox;
        req.start(&mut session).unwrap();
        sink.drain();
        let outcome = feed(
            &mut session,
            &mut req,
            &build_response(response_code::NOT_IMPLEMENTED, &[], &HeaderSet::new()),
        );
        assert_eq!(outcome.continuation, Continuation::FinishNg);
        match &outcome.reports[0] {
            Report::Action(r) => assert_eq!(r.status, RequestStatus::NotSupported),
            other => panic!("unexpected report {other:?}"),
        }
    }

    #[test]
    fn test_push_message_reports_assigned_handle() {
        let (mut session, sink) = session();
        let mut req = MapRequest::PushMessage(PushMessageParams {
            folder: "outbox".into(),
            bmessage: "BEGIN:BMSG\r\nEND:BMSG\r\n".into(),
            transparent: None,
            retry: Some(true),
            charset: charset::UTF8,
        });
        req.start(&mut session).unwrap();
        let pkt = RequestPacket::parse(&sink.drain()[0]).unwrap();
        assert_eq!(pkt.headers.name(), Some("outbox"));

        let mut headers = HeaderSet::new();
        headers.set_name("20000100009");
        let outcome = feed(
            &mut session,
            &mut req,
            &build_response(response_code::SUCCESS, &[], &headers),
        );
        match &outcome.reports[0] {
            Report::Action(r) => {
                assert_eq!(r.data, ActionData::PushedHandle("20000100009".into()));
            }
            other => panic!("unexpected report {other:?}"),
        }
    }

    #[test]
    fn test_messages_listing_parses_params_and_entries() {
        let (mut session, sink) = session();
        let mut req = MapRequest::GetMessagesListing(MessagesListingParams {
            folder: "inbox".into(),
            max_list_count: Some(10),
            ..Default::default()
        });
        req.start(&mut session).unwrap();
        sink.drain();

        let body = br#"<MAP-msg-listing><msg handle="A1" read="no"/></MAP-msg-listing>"#;
        let mut params = TlvBlock::new();
        params.push_u8(tag::NEW_MESSAGE, 1);
        params.push_u16(tag::LISTING_SIZE, 1);
        params.push_text(tag::MSE_TIME, "20240301T120000+0000");
        let outcome = feed(
            &mut session,
            &mut req,
            &success_get_response(body, Some(params)),
        );
        assert_eq!(outcome.continuation, Continuation::Finish);
        match &outcome.reports[0] {
            Report::MessagesListing(r) => {
                assert_eq!(r.entries.len(), 1);
                assert_eq!(r.new_message, Some(true));
                assert_eq!(r.listing_size, Some(1));
                assert!(r.mse_time.is_some());
            }
            other => panic!("unexpected report {other:?}"),
        }
    }

    #[test]
    fn test_missing_response_params_tolerated() {
        let (mut session, sink) = session();
        let mut req = MapRequest::GetMessagesListing(MessagesListingParams::default());
        req.start(&mut session).unwrap();
        sink.drain();
        let outcome = feed(&mut session, &mut req, &success_get_response(b"", None));
        match &outcome.reports[0] {
            Report::MessagesListing(r) => {
                assert_eq!(r.status, RequestStatus::Success);
                assert!(r.entries.is_empty());
                assert!(r.new_message.is_none());
                assert!(r.listing_size.is_none());
            }
            other => panic!("unexpected report {other:?}"),
        }
    }

    #[test]
    fn test_unread_composite_fetches_each_handle() {
        let (mut session, sink) = session();
        let mut req = MapRequest::unread(MessageTypeMask::SMS_GSM, 3);
        req.start(&mut session).unwrap();
        let listing_req = RequestPacket::parse(&sink.drain()[0]).unwrap();
        let params = TlvBlock::decode(listing_req.headers.app_params().unwrap());
        assert_eq!(params.get_u8(tag::FILTER_READ_STATUS), Some(read_status::UNREAD));
        assert_eq!(params.get_u16(tag::MAX_LIST_COUNT), Some(3));
        // exclusion mask keeps only SMS_GSM
        assert_eq!(
            params.get_u8(tag::FILTER_MESSAGE_TYPE),
            Some(0x1F & !MessageTypeMask::SMS_GSM.bits())
        );

        // five unread handles; only three may be fetched
        let listing = br#"<L><msg handle="H1" read="no"/><msg handle="H2" read="no"/><msg handle="H3" read="no"/><msg handle="H4" read="no"/><msg handle="H5" read="no"/></L>"#;
        let outcome = feed(&mut session, &mut req, &success_get_response(listing, None));
        assert_eq!(outcome.continuation, Continuation::ContinueNoCallback);
        assert!(outcome.reports.is_empty());
        // first message fetch issued
        let fetch1 = RequestPacket::parse(&sink.drain()[0]).unwrap();
        assert_eq!(fetch1.headers.name(), Some("H1"));

        let outcome = feed(&mut session, &mut req, &success_get_response(b"BMSG-1", None));
        assert_eq!(outcome.continuation, Continuation::ContinueWithCallback);
        assert_eq!(outcome.reports.len(), 1);
        match &outcome.reports[0] {
            Report::Bmessage(r) => {
                assert_eq!(r.handle.as_deref(), Some("H1"));
                assert!(r.more_coming);
            }
            other => panic!("unexpected report {other:?}"),
        }
        sink.drain();

        let outcome = feed(&mut session, &mut req, &success_get_response(b"BMSG-2", None));
        assert_eq!(outcome.continuation, Continuation::ContinueWithCallback);
        sink.drain();

        // third message drains the queue: message report plus terminal
        let outcome = feed(&mut session, &mut req, &success_get_response(b"BMSG-3", None));
        assert_eq!(outcome.continuation, Continuation::Finish);
        assert_eq!(outcome.reports.len(), 2);
        match &outcome.reports[1] {
            Report::Bmessage(r) => {
                assert!(r.handle.is_none());
                assert!(!r.more_coming);
                assert_eq!(r.status, RequestStatus::Success);
            }
            other => panic!("unexpected report {other:?}"),
        }
        assert!(sink.drain().is_empty(), "no fetch beyond the maximum");
    }

    #[test]
    fn test_unread_empty_listing_finishes_immediately() {
        let (mut session, sink) = session();
        let mut req = MapRequest::unread(MessageTypeMask::EMAIL, 5);
        req.start(&mut session).unwrap();
        sink.drain();
        let outcome = feed(&mut session, &mut req, &success_get_response(b"<L/>", None));
        assert_eq!(outcome.continuation, Continuation::Finish);
        assert_eq!(outcome.reports.len(), 1);
    }

    #[test]
    fn test_unread_listing_failure_is_terminal() {
        let (mut session, sink) = session();
        let mut req = MapRequest::unread(MessageTypeMask::EMAIL, 5);
        req.start(&mut session).unwrap();
        sink.drain();
        let outcome = feed(
            &mut session,
            &mut req,
            &build_response(response_code::BAD_REQUEST, &[], &HeaderSet::new()),
        );
        assert_eq!(outcome.continuation, Continuation::FinishNg);
        match &outcome.reports[0] {
            Report::Bmessage(r) => assert_eq!(r.status, RequestStatus::Failure),
            other => panic!("unexpected report {other:?}"),
        }
    }

    #[test]
    fn test_owner_status_roundtrip() {
        let (mut session, sink) = session();
        let mut req = MapRequest::GetOwnerStatus {
            conversation_id: Some("C1".into()),
            owner_uci: None,
        };
        req.start(&mut session).unwrap();
        sink.drain();

        let mut params = TlvBlock::new();
        params.push_u8(tag::PRESENCE_AVAILABILITY, 2);
        params.push_text(tag::PRESENCE_TEXT, "in a meeting");
        let outcome = feed(&mut session, &mut req, &success_get_response(b"", Some(params)));
        match &outcome.reports[0] {
            Report::Action(r) => match &r.data {
                ActionData::OwnerStatus(s) => {
                    assert_eq!(s.availability, Some(2));
                    assert_eq!(s.text.as_deref(), Some("in a meeting"));
                    assert!(s.chat_state.is_none());
                }
                other => panic!("unexpected data {other:?}"),
            },
            other => panic!("unexpected report {other:?}"),
        }
    }

    #[test]
    fn test_routing_metadata() {
        let req = MapRequest::unread(MessageTypeMask::EMAIL, 1);
        assert_eq!(req.required_message_types(), MessageTypeMask::EMAIL);
        assert!(req.owner_uci().is_none());

        let req = MapRequest::GetOwnerStatus {
            conversation_id: None,
            owner_uci: Some("alice@uci".into()),
        };
        assert_eq!(req.owner_uci(), Some("alice@uci"));
        assert_eq!(req.required_message_types(), MessageTypeMask::all());
    }
}

//! Helper codecs for listing and event-report bodies.
//!
//! Listing payloads are structured strings produced by the server; the
//! scanners here pull out the attributes the client acts on and leave the
//! rest opaque. An absent attribute is "not present", never an error.

/// One entry from a messages listing
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageEntry {
    /// Message handle
    pub handle: String,
    /// Subject, possibly truncated by the server
    pub subject: Option<String>,
    /// Delivery or reception timestamp
    pub datetime: Option<String>,
    /// Message type string (EMAIL, SMS_GSM, ...)
    pub msg_type: Option<String>,
    /// Read flag
    pub read: Option<bool>,
}

/// Decoded MNS event report
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventReport {
    /// MAS instance the event originated from
    pub mas_instance_id: u8,
    /// Event type (NewMessage, MessageShift, ...)
    pub event_type: Option<String>,
    /// Affected message handle
    pub handle: Option<String>,
    /// Current folder
    pub folder: Option<String>,
    /// Previous folder for shift events
    pub old_folder: Option<String>,
    /// Message type string
    pub msg_type: Option<String>,
    /// Raw body as received
    pub raw: String,
}

/// Extract the value of `name="..."` from one element's text
fn attr_value(element: &str, name: &str) -> Option<String> {
    let mut search = 0;
    let pattern = format!("{name}=\"");
    loop {
        let start = element[search..].find(&pattern)? + search;
        // require a delimiter before the attribute name
        if start > 0 {
            let prev = element.as_bytes()[start - 1];
            if prev != b' ' && prev != b'\t' && prev != b'\n' {
                search = start + pattern.len();
                continue;
            }
        }
        let value_start = start + pattern.len();
        let value_end = element[value_start..].find('"')? + value_start;
        return Some(element[value_start..value_end].to_string());
    }
}

/// Split out every element with the given tag name
fn elements<'a>(body: &'a str, tag: &str) -> Vec<&'a str> {
    let open = format!("<{tag}");
    let mut found = Vec::new();
    let mut rest = body;
    while let Some(start) = rest.find(&open) {
        let after = &rest[start..];
        // element ends at the first '>' (entries are self-closing or
        // attribute-only)
        match after.find('>') {
            Some(end) => {
                found.push(&after[..=end]);
                rest = &after[end + 1..];
            }
            None => break,
        }
    }
    found
}

/// Parse a messages-listing body into entries. Entries without a handle
/// are dropped.
#[must_use]
pub fn parse_messages_listing(body: &str) -> Vec<MessageEntry> {
    elements(body, "msg")
        .into_iter()
        .filter_map(|el| {
            let handle = attr_value(el, "handle")?;
            Some(MessageEntry {
                handle,
                subject: attr_value(el, "subject"),
                datetime: attr_value(el, "datetime"),
                msg_type: attr_value(el, "type"),
                read: attr_value(el, "read").map(|v| v.eq_ignore_ascii_case("yes")),
            })
        })
        .collect()
}

/// Parse folder names from a folder-listing body
#[must_use]
pub fn parse_folder_listing(body: &str) -> Vec<String> {
    elements(body, "folder")
        .into_iter()
        .filter_map(|el| attr_value(el, "name"))
        .collect()
}

/// Parse conversation ids from a conversation-listing body
#[must_use]
pub fn parse_conversation_ids(body: &str) -> Vec<String> {
    elements(body, "conversation")
        .into_iter()
        .filter_map(|el| attr_value(el, "id"))
        .collect()
}

/// Parse an MNS event-report body. `mas_instance_id` comes from the
/// request's application parameters, not the body.
#[must_use]
pub fn parse_event_report(mas_instance_id: u8, body: &str) -> EventReport {
    let event = elements(body, "event").into_iter().next().unwrap_or("");
    EventReport {
        mas_instance_id,
        event_type: attr_value(event, "type"),
        handle: attr_value(event, "handle"),
        folder: attr_value(event, "folder"),
        old_folder: attr_value(event, "old_folder"),
        msg_type: attr_value(event, "msg_type"),
        raw: body.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = r#"<MAP-msg-listing version="1.0">
<msg handle="20000100001" subject="Lunch?" datetime="20240301T091500" type="SMS_GSM" read="no"/>
<msg handle="20000100002" subject="Re: report" datetime="20240301T101500" type="EMAIL" read="yes"/>
<msg subject="no handle, dropped"/>
</MAP-msg-listing>"#;

    #[test]
    fn test_parse_messages_listing() {
        let entries = parse_messages_listing(LISTING);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].handle, "20000100001");
        assert_eq!(entries[0].read, Some(false));
        assert_eq!(entries[0].msg_type.as_deref(), Some("SMS_GSM"));
        assert_eq!(entries[1].read, Some(true));
    }

    #[test]
    fn test_missing_attributes_are_none() {
        let entries = parse_messages_listing(r#"<msg handle="abc"/>"#);
        assert_eq!(entries.len(), 1);
        assert!(entries[0].subject.is_none());
        assert!(entries[0].read.is_none());
    }

    #[test]
    fn test_empty_body_yields_no_entries() {
        assert!(parse_messages_listing("").is_empty());
        assert!(parse_folder_listing("").is_empty());
    }

    #[test]
    fn test_parse_folder_listing() {
        let body = r#"<folder-listing version="1.0">
<folder name="inbox"/>
<folder name="outbox"/>
</folder-listing>"#;
        assert_eq!(parse_folder_listing(body), vec!["inbox", "outbox"]);
    }

    #[test]
    fn test_parse_event_report() {
        let body = r#"<MAP-event-report version="1.0">
<event type="NewMessage" handle="20000100003" folder="telecom/msg/inbox" msg_type="SMS_GSM"/>
</MAP-event-report>"#;
        let report = parse_event_report(1, body);
        assert_eq!(report.mas_instance_id, 1);
        assert_eq!(report.event_type.as_deref(), Some("NewMessage"));
        assert_eq!(report.handle.as_deref(), Some("20000100003"));
        assert_eq!(report.folder.as_deref(), Some("telecom/msg/inbox"));
        assert!(report.old_folder.is_none());
    }

    #[test]
    fn test_event_report_tolerates_empty_body() {
        let report = parse_event_report(0, "");
        assert!(report.event_type.is_none());
        assert!(report.handle.is_none());
    }

    #[test]
    fn test_attr_name_must_be_delimited() {
        // "old_folder" must not match a search for "folder"
        let el = r#"<event old_folder="a"/>"#;
        assert_eq!(attr_value(el, "folder"), None);
        assert_eq!(attr_value(el, "old_folder").as_deref(), Some("a"));
    }
}

//! SDP attribute ids and discovered MAS record data.
//!
//! Attribute values are wire constants from the MAP service record
//! definition; records are immutable once built from a search result.

use crate::addr::Address;
use crate::stack::{TransportKind, TransportTarget};

/// MAS service record attribute ids
pub mod attribute {
    /// ServiceClassIDList
    pub const SERVICE_CLASS_ID_LIST: u16 = 0x0001;
    /// ProtocolDescriptorList (carries the RFCOMM channel)
    pub const PROTOCOL_DESCRIPTOR_LIST: u16 = 0x0004;
    /// GoepL2capPsm (present when the server offers GOEP 2.0 over L2CAP)
    pub const GOEP_L2CAP_PSM: u16 = 0x0200;
    /// MASInstanceID
    pub const MAS_INSTANCE_ID: u16 = 0x0315;
    /// SupportedMessageTypes bitmask
    pub const SUPPORTED_MESSAGE_TYPES: u16 = 0x0316;
    /// MapSupportedFeatures bitmask
    pub const MAP_SUPPORTED_FEATURES: u16 = 0x0317;
}

/// One discovered MAS instance record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasRecord {
    /// MAS instance id
    pub instance_id: u8,
    /// Service name from the record, if any
    pub service_name: Option<String>,
    /// RFCOMM channel from the protocol descriptor list
    pub rfcomm_channel: Option<u8>,
    /// L2CAP PSM from the GoepL2capPsm attribute
    pub l2cap_psm: Option<u16>,
    /// SupportedMessageTypes bitmask
    pub supported_message_types: u8,
    /// MapSupportedFeatures bitmask, absent on pre-1.2 servers
    pub supported_features: Option<u32>,
}

impl MasRecord {
    /// True when the record carries enough to open a transport
    #[must_use]
    pub fn has_transport(&self) -> bool {
        self.l2cap_psm.is_some() || self.rfcomm_channel.is_some()
    }

    /// Resolve the transport target for this record, preferring L2CAP
    /// (GOEP 2.0) when the server advertises a PSM.
    #[must_use]
    pub fn transport_target(&self, address: Address) -> Option<TransportTarget> {
        if let Some(psm) = self.l2cap_psm {
            return Some(TransportTarget {
                address,
                kind: TransportKind::L2cap,
                channel: psm,
            });
        }
        self.rfcomm_channel.map(|ch| TransportTarget {
            address,
            kind: TransportKind::Rfcomm,
            channel: u16::from(ch),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> MasRecord {
        MasRecord {
            instance_id: 0,
            service_name: Some("SMS/MMS".into()),
            rfcomm_channel: Some(4),
            l2cap_psm: None,
            supported_message_types: 0x0E,
            supported_features: Some(0x0000_007F),
        }
    }

    #[test]
    fn test_rfcomm_target() {
        let target = record().transport_target(Address::ANY).unwrap();
        assert_eq!(target.kind, TransportKind::Rfcomm);
        assert_eq!(target.channel, 4);
    }

    #[test]
    fn test_l2cap_preferred_over_rfcomm() {
        let mut r = record();
        r.l2cap_psm = Some(0x1021);
        let target = r.transport_target(Address::ANY).unwrap();
        assert_eq!(target.kind, TransportKind::L2cap);
        assert_eq!(target.channel, 0x1021);
    }

    #[test]
    fn test_no_transport_in_record() {
        let mut r = record();
        r.rfcomm_channel = None;
        assert!(!r.has_transport());
        assert!(r.transport_target(Address::ANY).is_none());
    }
}

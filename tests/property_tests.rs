//! Property-based tests for the OBEX wire codecs.
//!
//! Uses proptest to verify codec invariants across large input spaces;
//! malformed inputs must never panic.

use proptest::prelude::*;

mod header_properties {
    use super::*;
    use mapce_obex::{build_request, HeaderSet, RequestPacket, TlvBlock};

    proptest! {
        /// Header sets survive an encode/decode cycle
        #[test]
        fn header_set_roundtrip(
            name in "[a-zA-Z0-9_/]{0,40}",
            ty in "[a-z/\\-]{1,30}",
            conn_id in any::<u32>(),
            body in prop::collection::vec(any::<u8>(), 0..512),
        ) {
            let mut headers = HeaderSet::new();
            headers.set_name(&name);
            headers.set_type(&ty);
            headers.set_connection_id(conn_id);
            headers.set_end_of_body(body.clone());

            let mut encoded = Vec::new();
            headers.encode_into(&mut encoded);
            prop_assert_eq!(encoded.len(), headers.encoded_len());

            let decoded = HeaderSet::decode(&encoded).unwrap();
            prop_assert_eq!(decoded.name(), Some(name.as_str()));
            prop_assert_eq!(decoded.type_str(), Some(ty.as_str()));
            prop_assert_eq!(decoded.connection_id(), Some(conn_id));
            prop_assert_eq!(decoded.end_of_body(), Some(&body[..]));
        }

        /// Arbitrary bytes never panic the header decoder
        #[test]
        fn header_decode_never_panics(data in prop::collection::vec(any::<u8>(), 0..256)) {
            let _ = HeaderSet::decode(&data);
        }

        /// Arbitrary bytes never panic the request parser
        #[test]
        fn request_parse_never_panics(data in prop::collection::vec(any::<u8>(), 0..256)) {
            let _ = RequestPacket::parse(&data);
        }

        /// Request packets declare their exact length
        #[test]
        fn request_length_is_exact(
            op in prop::sample::select(vec![0x02u8, 0x82, 0x03, 0x83, 0x81, 0xFF]),
            body in prop::collection::vec(any::<u8>(), 0..200),
        ) {
            let mut headers = HeaderSet::new();
            headers.set_body(body);
            let packet = build_request(op, &[], &headers);
            let declared = u16::from_be_bytes([packet[1], packet[2]]) as usize;
            prop_assert_eq!(declared, packet.len());
        }

        /// TLV blocks survive an encode/decode cycle
        #[test]
        fn tlv_roundtrip(entries in prop::collection::vec((any::<u8>(), 0u16..600), 0..12)) {
            let mut block = TlvBlock::new();
            for (t, v) in &entries {
                block.push_u16(*t, *v);
            }
            let decoded = TlvBlock::decode(&block.encode());
            // first occurrence of each tag wins on read
            for (t, _) in &entries {
                let first = entries.iter().find(|(et, _)| et == t).map(|(_, ev)| *ev);
                prop_assert_eq!(decoded.get_u16(*t), first);
            }
        }

        /// Arbitrary bytes never panic the TLV decoder
        #[test]
        fn tlv_decode_never_panics(data in prop::collection::vec(any::<u8>(), 0..256)) {
            let _ = TlvBlock::decode(&data);
        }
    }
}

mod listing_properties {
    use super::*;
    use mapce_core::codec::parse_messages_listing;

    proptest! {
        /// The listing scanner never panics on arbitrary text
        #[test]
        fn listing_parse_never_panics(body in ".{0,400}") {
            let _ = parse_messages_listing(&body);
        }

        /// Every parsed entry keeps its handle verbatim
        #[test]
        fn handles_survive(handles in prop::collection::vec("[A-F0-9]{4,12}", 0..8)) {
            let body: String = handles
                .iter()
                .map(|h| format!("<msg handle=\"{h}\"/>\n"))
                .collect();
            let entries = parse_messages_listing(&body);
            prop_assert_eq!(entries.len(), handles.len());
            for (entry, handle) in entries.iter().zip(&handles) {
                prop_assert_eq!(&entry.handle, handle);
            }
        }
    }
}

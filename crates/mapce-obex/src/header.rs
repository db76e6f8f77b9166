//! OBEX packet and header-set encoding/decoding.
//!
//! All multi-byte fields are big-endian (network byte order). Header
//! encoding is dictated by the two top bits of the header id: unicode
//! text, byte sequence, single byte, or four-byte value.

use crate::error::{ObexError, Result};
use crate::{CONNECT_FIELDS_SIZE, PACKET_PREFIX_SIZE};

/// Request opcodes
pub mod opcode {
    /// CONNECT (final)
    pub const CONNECT: u8 = 0x80;
    /// DISCONNECT (final)
    pub const DISCONNECT: u8 = 0x81;
    /// PUT, more packets follow
    pub const PUT: u8 = 0x02;
    /// PUT, final packet
    pub const PUT_FINAL: u8 = 0x82;
    /// GET, more request packets follow
    pub const GET: u8 = 0x03;
    /// GET, final request packet
    pub const GET_FINAL: u8 = 0x83;
    /// SETPATH (final)
    pub const SET_PATH: u8 = 0x85;
    /// ABORT (final)
    pub const ABORT: u8 = 0xFF;
}

/// Response code values
pub mod response_code {
    /// More packets follow
    pub const CONTINUE: u8 = 0x90;
    /// Operation complete
    pub const SUCCESS: u8 = 0xA0;
    /// Malformed request
    pub const BAD_REQUEST: u8 = 0xC0;
    /// Request understood but refused
    pub const FORBIDDEN: u8 = 0xC3;
    /// No such object
    pub const NOT_FOUND: u8 = 0xC4;
    /// Request not acceptable (e.g. wrong target)
    pub const NOT_ACCEPTABLE: u8 = 0xC6;
    /// Operation not implemented by the peer
    pub const NOT_IMPLEMENTED: u8 = 0xD1;
    /// Peer temporarily unable to serve
    pub const SERVICE_UNAVAILABLE: u8 = 0xD3;
}

/// Header identifiers
pub mod header_id {
    /// Object name (unicode)
    pub const NAME: u8 = 0x01;
    /// Object type string (bytes, null-terminated ASCII)
    pub const TYPE: u8 = 0x42;
    /// Service target UUID (bytes)
    pub const TARGET: u8 = 0x46;
    /// Body fragment (bytes)
    pub const BODY: u8 = 0x48;
    /// Final body fragment (bytes)
    pub const END_OF_BODY: u8 = 0x49;
    /// Responding service UUID (bytes)
    pub const WHO: u8 = 0x4A;
    /// Application-parameter TLV block (bytes)
    pub const APP_PARAMS: u8 = 0x4C;
    /// Single Response Mode (single byte)
    pub const SRM: u8 = 0x97;
    /// SRM parameters (single byte)
    pub const SRMP: u8 = 0x98;
    /// Connection identifier (four bytes)
    pub const CONNECTION_ID: u8 = 0xCB;
}

/// SRM header values
pub mod srm_value {
    /// Disable SRM
    pub const DISABLE: u8 = 0x00;
    /// Enable SRM
    pub const ENABLE: u8 = 0x01;
}

/// SRMP header values
pub mod srmp_value {
    /// Peer asks the sender to wait for one response
    pub const WAIT: u8 = 0x01;
}

/// OBEX response code newtype
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResponseCode(pub u8);

impl ResponseCode {
    /// More packets follow
    pub const CONTINUE: Self = Self(response_code::CONTINUE);
    /// Operation complete
    pub const SUCCESS: Self = Self(response_code::SUCCESS);
    /// Request not acceptable
    pub const NOT_ACCEPTABLE: Self = Self(response_code::NOT_ACCEPTABLE);
    /// Operation not implemented
    pub const NOT_IMPLEMENTED: Self = Self(response_code::NOT_IMPLEMENTED);

    /// True for CONTINUE
    #[must_use]
    pub fn is_continue(self) -> bool {
        self.0 == response_code::CONTINUE
    }

    /// True for SUCCESS
    #[must_use]
    pub fn is_success(self) -> bool {
        self.0 == response_code::SUCCESS
    }

    /// True for any terminal non-success code
    #[must_use]
    pub fn is_failure(self) -> bool {
        !self.is_continue() && !self.is_success()
    }

    /// Raw code byte
    #[must_use]
    pub fn as_u8(self) -> u8 {
        self.0
    }
}

/// A single decoded OBEX header
#[derive(Debug, Clone, PartialEq, Eq)]
enum Header {
    /// Null-terminated UTF-16BE text
    Unicode(u8, String),
    /// Raw byte sequence
    Bytes(u8, Vec<u8>),
    /// One-byte value
    Byte(u8, u8),
    /// Four-byte big-endian value
    U32(u8, u32),
}

impl Header {
    fn id(&self) -> u8 {
        match self {
            Header::Unicode(id, _)
            | Header::Bytes(id, _)
            | Header::Byte(id, _)
            | Header::U32(id, _) => *id,
        }
    }

    fn encoded_len(&self) -> usize {
        match self {
            // id + len + UTF-16BE + null terminator (empty string omits both)
            Header::Unicode(_, s) => {
                if s.is_empty() {
                    3
                } else {
                    3 + s.encode_utf16().count() * 2 + 2
                }
            }
            Header::Bytes(_, b) => 3 + b.len(),
            Header::Byte(_, _) => 2,
            Header::U32(_, _) => 5,
        }
    }

    fn encode_into(&self, buf: &mut Vec<u8>) {
        match self {
            Header::Unicode(id, s) => {
                buf.push(*id);
                let len = self.encoded_len() as u16;
                buf.extend_from_slice(&len.to_be_bytes());
                if !s.is_empty() {
                    for unit in s.encode_utf16() {
                        buf.extend_from_slice(&unit.to_be_bytes());
                    }
                    buf.extend_from_slice(&[0, 0]);
                }
            }
            Header::Bytes(id, b) => {
                buf.push(*id);
                buf.extend_from_slice(&((3 + b.len()) as u16).to_be_bytes());
                buf.extend_from_slice(b);
            }
            Header::Byte(id, v) => {
                buf.push(*id);
                buf.push(*v);
            }
            Header::U32(id, v) => {
                buf.push(*id);
                buf.extend_from_slice(&v.to_be_bytes());
            }
        }
    }
}

/// Ordered set of OBEX headers for one packet
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderSet {
    headers: Vec<Header>,
}

impl HeaderSet {
    /// Create an empty header set
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// True if no headers are present
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    /// Total encoded size of all headers
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        self.headers.iter().map(Header::encoded_len).sum()
    }

    /// True if a header with the given id is present
    #[must_use]
    pub fn contains(&self, id: u8) -> bool {
        self.headers.iter().any(|h| h.id() == id)
    }

    /// Remove all headers with the given id
    pub fn remove(&mut self, id: u8) {
        self.headers.retain(|h| h.id() != id);
    }

    fn replace(&mut self, header: Header) {
        self.remove(header.id());
        self.headers.push(header);
    }

    /// Set the Name header
    pub fn set_name(&mut self, name: &str) {
        self.replace(Header::Unicode(header_id::NAME, name.to_owned()));
    }

    /// Set the Type header (null-terminated ASCII)
    pub fn set_type(&mut self, ty: &str) {
        let mut bytes = ty.as_bytes().to_vec();
        bytes.push(0);
        self.replace(Header::Bytes(header_id::TYPE, bytes));
    }

    /// Set the Target header
    pub fn set_target(&mut self, uuid: &[u8]) {
        self.replace(Header::Bytes(header_id::TARGET, uuid.to_vec()));
    }

    /// Set the Who header
    pub fn set_who(&mut self, uuid: &[u8]) {
        self.replace(Header::Bytes(header_id::WHO, uuid.to_vec()));
    }

    /// Set the Connection-Id header
    pub fn set_connection_id(&mut self, id: u32) {
        self.replace(Header::U32(header_id::CONNECTION_ID, id));
    }

    /// Set the application-parameter block
    pub fn set_app_params(&mut self, block: Vec<u8>) {
        self.replace(Header::Bytes(header_id::APP_PARAMS, block));
    }

    /// Set a Body fragment
    pub fn set_body(&mut self, body: Vec<u8>) {
        self.replace(Header::Bytes(header_id::BODY, body));
    }

    /// Set an End-of-Body fragment
    pub fn set_end_of_body(&mut self, body: Vec<u8>) {
        self.replace(Header::Bytes(header_id::END_OF_BODY, body));
    }

    /// Set the SRM header
    pub fn set_srm(&mut self, value: u8) {
        self.replace(Header::Byte(header_id::SRM, value));
    }

    /// Set the SRMP header
    pub fn set_srmp(&mut self, value: u8) {
        self.replace(Header::Byte(header_id::SRMP, value));
    }

    fn unicode(&self, id: u8) -> Option<&str> {
        self.headers.iter().find_map(|h| match h {
            Header::Unicode(i, s) if *i == id => Some(s.as_str()),
            _ => None,
        })
    }

    fn bytes(&self, id: u8) -> Option<&[u8]> {
        self.headers.iter().find_map(|h| match h {
            Header::Bytes(i, b) if *i == id => Some(b.as_slice()),
            _ => None,
        })
    }

    fn byte(&self, id: u8) -> Option<u8> {
        self.headers.iter().find_map(|h| match h {
            Header::Byte(i, v) if *i == id => Some(*v),
            _ => None,
        })
    }

    /// Name header, if present
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.unicode(header_id::NAME)
    }

    /// Type header with the null terminator stripped
    #[must_use]
    pub fn type_str(&self) -> Option<&str> {
        self.bytes(header_id::TYPE).and_then(|b| {
            let b = b.strip_suffix(&[0]).unwrap_or(b);
            std::str::from_utf8(b).ok()
        })
    }

    /// Target header, if present
    #[must_use]
    pub fn target(&self) -> Option<&[u8]> {
        self.bytes(header_id::TARGET)
    }

    /// Who header, if present
    #[must_use]
    pub fn who(&self) -> Option<&[u8]> {
        self.bytes(header_id::WHO)
    }

    /// Connection-Id header, if present
    #[must_use]
    pub fn connection_id(&self) -> Option<u32> {
        self.headers.iter().find_map(|h| match h {
            Header::U32(i, v) if *i == header_id::CONNECTION_ID => Some(*v),
            _ => None,
        })
    }

    /// Application-parameter block, if present
    #[must_use]
    pub fn app_params(&self) -> Option<&[u8]> {
        self.bytes(header_id::APP_PARAMS)
    }

    /// Body fragment, if present
    #[must_use]
    pub fn body(&self) -> Option<&[u8]> {
        self.bytes(header_id::BODY)
    }

    /// End-of-Body fragment, if present
    #[must_use]
    pub fn end_of_body(&self) -> Option<&[u8]> {
        self.bytes(header_id::END_OF_BODY)
    }

    /// SRM header value, if present
    #[must_use]
    pub fn srm(&self) -> Option<u8> {
        self.byte(header_id::SRM)
    }

    /// SRMP header value, if present
    #[must_use]
    pub fn srmp(&self) -> Option<u8> {
        self.byte(header_id::SRMP)
    }

    /// Append the encoded headers to `buf`
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        for h in &self.headers {
            h.encode_into(buf);
        }
    }

    /// Decode a header sequence from raw bytes
    ///
    /// # Errors
    ///
    /// Returns an error when a header runs past the end of the buffer or
    /// declares a length smaller than its own encoding.
    pub fn decode(mut data: &[u8]) -> Result<Self> {
        let mut headers = Vec::new();
        while !data.is_empty() {
            let id = data[0];
            match id & 0xC0 {
                0x00 => {
                    // unicode: id + u16 length + UTF-16BE + null terminator
                    if data.len() < 3 {
                        return Err(ObexError::TruncatedHeader(id));
                    }
                    let len = u16::from_be_bytes([data[1], data[2]]) as usize;
                    if len < 3 {
                        return Err(ObexError::InvalidHeaderLength(id));
                    }
                    if data.len() < len {
                        return Err(ObexError::TruncatedHeader(id));
                    }
                    let payload = &data[3..len];
                    let text = decode_utf16be(payload).ok_or(ObexError::MalformedUnicode(id))?;
                    headers.push(Header::Unicode(id, text));
                    data = &data[len..];
                }
                0x40 => {
                    if data.len() < 3 {
                        return Err(ObexError::TruncatedHeader(id));
                    }
                    let len = u16::from_be_bytes([data[1], data[2]]) as usize;
                    if len < 3 {
                        return Err(ObexError::InvalidHeaderLength(id));
                    }
                    if data.len() < len {
                        return Err(ObexError::TruncatedHeader(id));
                    }
                    headers.push(Header::Bytes(id, data[3..len].to_vec()));
                    data = &data[len..];
                }
                0x80 => {
                    if data.len() < 2 {
                        return Err(ObexError::TruncatedHeader(id));
                    }
                    headers.push(Header::Byte(id, data[1]));
                    data = &data[2..];
                }
                _ => {
                    if data.len() < 5 {
                        return Err(ObexError::TruncatedHeader(id));
                    }
                    let v = u32::from_be_bytes([data[1], data[2], data[3], data[4]]);
                    headers.push(Header::U32(id, v));
                    data = &data[5..];
                }
            }
        }
        Ok(Self { headers })
    }
}

fn decode_utf16be(payload: &[u8]) -> Option<String> {
    if payload.len() % 2 != 0 {
        return None;
    }
    let mut units: Vec<u16> = payload
        .chunks_exact(2)
        .map(|c| u16::from_be_bytes([c[0], c[1]]))
        .collect();
    if units.last() == Some(&0) {
        units.pop();
    }
    String::from_utf16(&units).ok()
}

/// Connect-packet extra fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectFields {
    /// OBEX protocol version
    pub version: u8,
    /// Connect flags
    pub flags: u8,
    /// Maximum packet length the sender can receive
    pub max_packet_length: u16,
}

/// Build a request packet: opcode, extra fields, headers
#[must_use]
pub fn build_request(op: u8, extra: &[u8], headers: &HeaderSet) -> Vec<u8> {
    let total = PACKET_PREFIX_SIZE + extra.len() + headers.encoded_len();
    let mut buf = Vec::with_capacity(total);
    buf.push(op);
    buf.extend_from_slice(&(total as u16).to_be_bytes());
    buf.extend_from_slice(extra);
    headers.encode_into(&mut buf);
    buf
}

/// Build a response packet: code, extra fields, headers
#[must_use]
pub fn build_response(code: u8, extra: &[u8], headers: &HeaderSet) -> Vec<u8> {
    // responses share the request wire shape
    build_request(code, extra, headers)
}

fn check_prefix(data: &[u8]) -> Result<usize> {
    if data.len() < PACKET_PREFIX_SIZE {
        return Err(ObexError::TooShort {
            expected: PACKET_PREFIX_SIZE,
            actual: data.len(),
        });
    }
    let declared = u16::from_be_bytes([data[1], data[2]]) as usize;
    if declared < PACKET_PREFIX_SIZE || data.len() < declared {
        return Err(ObexError::TooShort {
            expected: declared.max(PACKET_PREFIX_SIZE),
            actual: data.len(),
        });
    }
    Ok(declared)
}

/// A decoded response packet
#[derive(Debug, Clone)]
pub struct ObexResponse {
    /// Response code
    pub code: ResponseCode,
    /// Connect fields, present only on CONNECT responses
    pub connect: Option<ConnectFields>,
    /// Decoded headers
    pub headers: HeaderSet,
}

impl ObexResponse {
    /// Parse a response packet. `connect` selects whether the four
    /// connect-specific bytes follow the prefix.
    ///
    /// # Errors
    ///
    /// Returns an error on truncated packets or malformed headers.
    pub fn parse(data: &[u8], connect: bool) -> Result<Self> {
        let declared = check_prefix(data)?;
        let code = ResponseCode(data[0]);
        let mut offset = PACKET_PREFIX_SIZE;
        // failure responses to CONNECT may omit the connect fields
        let fields = if connect && declared >= PACKET_PREFIX_SIZE + CONNECT_FIELDS_SIZE {
            let f = ConnectFields {
                version: data[3],
                flags: data[4],
                max_packet_length: u16::from_be_bytes([data[5], data[6]]),
            };
            offset += CONNECT_FIELDS_SIZE;
            Some(f)
        } else {
            None
        };
        let headers = HeaderSet::decode(&data[offset..declared])?;
        Ok(Self {
            code,
            connect: fields,
            headers,
        })
    }
}

/// A decoded request packet (server side)
#[derive(Debug, Clone)]
pub struct RequestPacket {
    /// Request opcode
    pub opcode: u8,
    /// Connect fields, present only on CONNECT
    pub connect: Option<ConnectFields>,
    /// SETPATH flags byte, present only on SETPATH
    pub setpath_flags: Option<u8>,
    /// Decoded headers
    pub headers: HeaderSet,
}

impl RequestPacket {
    /// Parse a request packet.
    ///
    /// # Errors
    ///
    /// Returns an error on truncated packets or malformed headers.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let declared = check_prefix(data)?;
        let op = data[0];
        let mut offset = PACKET_PREFIX_SIZE;
        let mut connect = None;
        let mut setpath_flags = None;
        match op {
            opcode::CONNECT => {
                if declared < PACKET_PREFIX_SIZE + CONNECT_FIELDS_SIZE {
                    return Err(ObexError::TooShort {
                        expected: PACKET_PREFIX_SIZE + CONNECT_FIELDS_SIZE,
                        actual: declared,
                    });
                }
                connect = Some(ConnectFields {
                    version: data[3],
                    flags: data[4],
                    max_packet_length: u16::from_be_bytes([data[5], data[6]]),
                });
                offset += CONNECT_FIELDS_SIZE;
            }
            opcode::SET_PATH => {
                if declared < PACKET_PREFIX_SIZE + 2 {
                    return Err(ObexError::TooShort {
                        expected: PACKET_PREFIX_SIZE + 2,
                        actual: declared,
                    });
                }
                setpath_flags = Some(data[3]);
                offset += 2;
            }
            _ => {}
        }
        let headers = HeaderSet::decode(&data[offset..declared])?;
        Ok(Self {
            opcode: op,
            connect,
            setpath_flags,
            headers,
        })
    }

    /// True when the opcode carries the final bit
    #[must_use]
    pub fn is_final(&self) -> bool {
        self.opcode & 0x80 != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_set_roundtrip() {
        let mut hs = HeaderSet::new();
        hs.set_name("telecom");
        hs.set_type("x-bt/message");
        hs.set_connection_id(0x1234_5678);
        hs.set_app_params(vec![0x01, 0x02, 0x00, 0x64]);
        hs.set_srm(srm_value::ENABLE);

        let mut buf = Vec::new();
        hs.encode_into(&mut buf);
        assert_eq!(buf.len(), hs.encoded_len());

        let decoded = HeaderSet::decode(&buf).unwrap();
        assert_eq!(decoded.name(), Some("telecom"));
        assert_eq!(decoded.type_str(), Some("x-bt/message"));
        assert_eq!(decoded.connection_id(), Some(0x1234_5678));
        assert_eq!(decoded.app_params(), Some(&[0x01, 0x02, 0x00, 0x64][..]));
        assert_eq!(decoded.srm(), Some(srm_value::ENABLE));
    }

    #[test]
    fn test_empty_name_header() {
        let mut hs = HeaderSet::new();
        hs.set_name("");
        let mut buf = Vec::new();
        hs.encode_into(&mut buf);
        assert_eq!(buf.len(), 3);

        let decoded = HeaderSet::decode(&buf).unwrap();
        assert_eq!(decoded.name(), Some(""));
    }

    #[test]
    fn test_truncated_header_rejected() {
        // bytes header claiming 10 bytes but only 5 present
        let buf = [header_id::BODY, 0x00, 0x0A, 0xAA, 0xBB];
        assert!(matches!(
            HeaderSet::decode(&buf),
            Err(ObexError::TruncatedHeader(_))
        ));
    }

    #[test]
    fn test_request_roundtrip_connect() {
        let mut hs = HeaderSet::new();
        hs.set_target(&[0xBB; 16]);
        let pkt = build_request(
            opcode::CONNECT,
            &[crate::OBEX_VERSION, 0x00, 0x20, 0x00],
            &hs,
        );

        let req = RequestPacket::parse(&pkt).unwrap();
        assert_eq!(req.opcode, opcode::CONNECT);
        let fields = req.connect.unwrap();
        assert_eq!(fields.version, crate::OBEX_VERSION);
        assert_eq!(fields.max_packet_length, 0x2000);
        assert_eq!(req.headers.target(), Some(&[0xBB; 16][..]));
    }

    #[test]
    fn test_response_parse_plain() {
        let mut hs = HeaderSet::new();
        hs.set_end_of_body(b"abc".to_vec());
        let pkt = build_response(response_code::SUCCESS, &[], &hs);

        let resp = ObexResponse::parse(&pkt, false).unwrap();
        assert!(resp.code.is_success());
        assert!(resp.connect.is_none());
        assert_eq!(resp.headers.end_of_body(), Some(&b"abc"[..]));
    }

    #[test]
    fn test_response_declared_length_honored() {
        // trailing garbage beyond the declared length is ignored
        let pkt = build_response(response_code::SUCCESS, &[], &HeaderSet::new());
        let mut padded = pkt.clone();
        padded.extend_from_slice(&[0xFF; 4]);
        let resp = ObexResponse::parse(&padded, false).unwrap();
        assert!(resp.headers.is_empty());
    }

    #[test]
    fn test_setpath_request_flags() {
        let mut hs = HeaderSet::new();
        hs.set_name("msg");
        let pkt = build_request(opcode::SET_PATH, &[0x02, 0x00], &hs);
        let req = RequestPacket::parse(&pkt).unwrap();
        assert_eq!(req.setpath_flags, Some(0x02));
        assert_eq!(req.headers.name(), Some("msg"));
    }

    #[test]
    fn test_final_bit() {
        let hs = HeaderSet::new();
        let put = RequestPacket::parse(&build_request(opcode::PUT, &[], &hs)).unwrap();
        assert!(!put.is_final());
        let put_final = RequestPacket::parse(&build_request(opcode::PUT_FINAL, &[], &hs)).unwrap();
        assert!(put_final.is_final());
    }
}

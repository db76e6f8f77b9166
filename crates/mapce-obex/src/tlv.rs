//! Application-parameter TLV block codec.
//!
//! OBEX application parameters are a flat sequence of tag(1) length(1)
//! value(n) triplets carried in a single header. Tags are profile-defined;
//! this codec treats them as opaque. Absent or zero-length tags decode to
//! "not present" rather than an error.

/// A tag/length/value parameter block
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlvBlock {
    entries: Vec<(u8, Vec<u8>)>,
}

impl TlvBlock {
    /// Create an empty block
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// True if no parameters are present
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append a raw value. Values longer than 255 bytes are truncated to
    /// the encodable maximum.
    pub fn push(&mut self, tag: u8, value: &[u8]) {
        let mut v = value.to_vec();
        v.truncate(u8::MAX as usize);
        self.entries.push((tag, v));
    }

    /// Append a one-byte value
    pub fn push_u8(&mut self, tag: u8, value: u8) {
        self.entries.push((tag, vec![value]));
    }

    /// Append a two-byte big-endian value
    pub fn push_u16(&mut self, tag: u8, value: u16) {
        self.entries.push((tag, value.to_be_bytes().to_vec()));
    }

    /// Append a four-byte big-endian value
    pub fn push_u32(&mut self, tag: u8, value: u32) {
        self.entries.push((tag, value.to_be_bytes().to_vec()));
    }

    /// Append a UTF-8 text value
    pub fn push_text(&mut self, tag: u8, value: &str) {
        self.push(tag, value.as_bytes());
    }

    /// First value for `tag`, if present and non-empty
    #[must_use]
    pub fn get(&self, tag: u8) -> Option<&[u8]> {
        self.entries
            .iter()
            .find(|(t, v)| *t == tag && !v.is_empty())
            .map(|(_, v)| v.as_slice())
    }

    /// One-byte value for `tag`
    #[must_use]
    pub fn get_u8(&self, tag: u8) -> Option<u8> {
        self.get(tag).and_then(|v| v.first().copied())
    }

    /// Two-byte big-endian value for `tag`
    #[must_use]
    pub fn get_u16(&self, tag: u8) -> Option<u16> {
        self.get(tag).and_then(|v| {
            if v.len() >= 2 {
                Some(u16::from_be_bytes([v[0], v[1]]))
            } else {
                None
            }
        })
    }

    /// Four-byte big-endian value for `tag`
    #[must_use]
    pub fn get_u32(&self, tag: u8) -> Option<u32> {
        self.get(tag).and_then(|v| {
            if v.len() >= 4 {
                Some(u32::from_be_bytes([v[0], v[1], v[2], v[3]]))
            } else {
                None
            }
        })
    }

    /// UTF-8 text value for `tag`
    #[must_use]
    pub fn get_text(&self, tag: u8) -> Option<&str> {
        self.get(tag).and_then(|v| std::str::from_utf8(v).ok())
    }

    /// Encode the block to bytes
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.entries.iter().map(|(_, v)| 2 + v.len()).sum());
        for (tag, value) in &self.entries {
            buf.push(*tag);
            buf.push(value.len() as u8);
            buf.extend_from_slice(value);
        }
        buf
    }

    /// Decode a block from bytes. A triplet whose declared length runs
    /// past the buffer terminates the scan; everything decoded before it
    /// is kept (best-effort, per the malformed-peer-data policy).
    #[must_use]
    pub fn decode(data: &[u8]) -> Self {
        let mut entries = Vec::new();
        let mut rest = data;
        while rest.len() >= 2 {
            let tag = rest[0];
            let len = rest[1] as usize;
            if rest.len() < 2 + len {
                break;
            }
            entries.push((tag, rest[2..2 + len].to_vec()));
            rest = &rest[2 + len..];
        }
        Self { entries }
    }
}

//! Message and message-set codec (magic 0 and 1).
//!
//! A single message is `crc32 (over magic..value), magic, attributes,
//! [timestamp when magic >= 1], key, value`. A message set is a flat
//! sequence of `(offset: i64, message_size: i32, message)` entries with no
//! count prefix; `message_size` is the byte length of the inner message, so
//! a set may legitimately end mid-message when the broker hits the
//! requested byte budget. Such a trailing partial record is dropped, not
//! treated as corruption.

use std::io::{Cursor, Read, Write};

use bytes::{Bytes, BytesMut};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

use super::{wire, ProtocolError};
use crate::config::Compression;

/// Message offset plus size header length of one message-set entry.
const ENTRY_HEADER_LEN: usize = 8 + 4;

/// A single Kafka message.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Message {
    pub key: Option<Bytes>,
    pub value: Option<Bytes>,
    /// Milliseconds since epoch; `-1` when unset or below magic 1.
    pub timestamp: i64,
}

impl Message {
    pub fn new<V: Into<Bytes>>(value: V) -> Self {
        Self {
            key: None,
            value: Some(value.into()),
            timestamp: -1,
        }
    }

    pub fn with_key<K: Into<Bytes>>(mut self, key: K) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// One decoded message-set entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageSetEntry {
    pub offset: i64,
    pub message: Message,
}

/// Encode one message (without the offset/size entry header).
pub fn encode_message(
    msg: &Message,
    magic: u8,
    codec: Compression,
) -> Result<Bytes, ProtocolError> {
    if codec == Compression::Snappy {
        return Err(ProtocolError::UnsupportedCompression(Compression::Snappy as u8));
    }
    let mut body = BytesMut::new();
    wire::put_u8(&mut body, magic);
    wire::put_u8(&mut body, codec as u8);
    if magic >= 1 {
        wire::put_i64(&mut body, msg.timestamp);
    }
    wire::put_nullable_bytes(&mut body, msg.key.as_deref());
    wire::put_nullable_bytes(&mut body, msg.value.as_deref());

    let crc = crc32fast::hash(&body);
    let mut out = BytesMut::with_capacity(4 + body.len());
    wire::put_u32(&mut out, crc);
    out.extend_from_slice(&body);
    Ok(out.freeze())
}

/// Encode a message set. With gzip, the whole set is encoded once, then
/// wrapped in a single compressed carrier message whose offset is the last
/// inner offset.
pub fn encode_message_set(
    messages: &[Message],
    magic: u8,
    codec: Compression,
) -> Result<Bytes, ProtocolError> {
    match codec {
        Compression::None => encode_plain_set(messages, magic),
        Compression::Gzip => {
            let inner = encode_plain_set(messages, magic)?;
            let compressed = gzip(&inner)?;
            let wrapper = Message {
                key: None,
                value: Some(compressed),
                timestamp: messages.iter().map(|m| m.timestamp).max().unwrap_or(-1),
            };
            let encoded = encode_message(&wrapper, magic, Compression::Gzip)?;
            let mut out = BytesMut::new();
            wire::put_i64(&mut out, messages.len().saturating_sub(1) as i64);
            wire::put_i32(&mut out, encoded.len() as i32);
            out.extend_from_slice(&encoded);
            Ok(out.freeze())
        }
        Compression::Snappy => {
            Err(ProtocolError::UnsupportedCompression(Compression::Snappy as u8))
        }
    }
}

fn encode_plain_set(messages: &[Message], magic: u8) -> Result<Bytes, ProtocolError> {
    let mut out = BytesMut::new();
    for (index, msg) in messages.iter().enumerate() {
        let encoded = encode_message(msg, magic, Compression::None)?;
        wire::put_i64(&mut out, index as i64);
        wire::put_i32(&mut out, encoded.len() as i32);
        out.extend_from_slice(&encoded);
    }
    Ok(out.freeze())
}

/// Decode one message, validating the stored CRC against magic..value.
/// Compressed carriers are expanded recursively; the returned entries carry
/// offsets renumbered against `wrapper_offset`.
pub fn decode_message(
    data: &[u8],
    wrapper_offset: i64,
) -> Result<Vec<MessageSetEntry>, ProtocolError> {
    let mut cur = Cursor::new(data);
    let stored = wire::get_u32(&mut cur)?;
    let body_start = cur.position() as usize;
    let computed = crc32fast::hash(&data[body_start..]);
    if stored != computed {
        return Err(ProtocolError::CrcMismatch { stored, computed });
    }

    let magic = wire::get_u8(&mut cur)?;
    if magic > 1 {
        return Err(ProtocolError::InvalidMagic(magic));
    }
    let attributes = wire::get_u8(&mut cur)?;
    let timestamp = if magic >= 1 { wire::get_i64(&mut cur)? } else { -1 };
    let key = wire::get_nullable_bytes(&mut cur)?;
    let value = wire::get_nullable_bytes(&mut cur)?;

    let codec = Compression::from_attributes(attributes)
        .ok_or(ProtocolError::UnsupportedCompression(attributes & 0x07))?;
    match codec {
        Compression::None => Ok(vec![MessageSetEntry {
            offset: wrapper_offset,
            message: Message {
                key,
                value,
                timestamp,
            },
        }]),
        Compression::Gzip => {
            let compressed = value.unwrap_or_default();
            let inner = gunzip(&compressed)?;
            let entries = decode_message_set(&inner)?;
            // Inner offsets are 0-based; the wrapper carries the offset of
            // the last inner message.
            let last_inner = entries.last().map(|e| e.offset).unwrap_or(0);
            Ok(entries
                .into_iter()
                .map(|e| MessageSetEntry {
                    offset: wrapper_offset - last_inner + e.offset,
                    message: e.message,
                })
                .collect())
        }
        Compression::Snappy => {
            Err(ProtocolError::UnsupportedCompression(Compression::Snappy as u8))
        }
    }
}

/// Decode a message set, expanding compressed carriers and silently
/// dropping a trailing partial record.
pub fn decode_message_set(data: &[u8]) -> Result<Vec<MessageSetEntry>, ProtocolError> {
    let mut entries = Vec::new();
    let mut pos = 0usize;
    while data.len() - pos >= ENTRY_HEADER_LEN {
        let mut cur = Cursor::new(&data[pos..]);
        let offset = wire::get_i64(&mut cur)?;
        let size = wire::get_i32(&mut cur)?;
        if size < 0 {
            return Err(ProtocolError::InvalidLength(size));
        }
        let size = size as usize;
        let body_start = pos + ENTRY_HEADER_LEN;
        if data.len() - body_start < size {
            // truncated by the broker's byte budget
            break;
        }
        entries.extend(decode_message(&data[body_start..body_start + size], offset)?);
        pos = body_start + size;
    }
    Ok(entries)
}

fn gzip(data: &[u8]) -> Result<Bytes, ProtocolError> {
    let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::fast());
    encoder
        .write_all(data)
        .and_then(|_| encoder.finish())
        .map(Bytes::from)
        .map_err(|e| ProtocolError::BadCompressedPayload(e.to_string()))
}

fn gunzip(data: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| ProtocolError::BadCompressedPayload(e.to_string()))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<Message> {
        vec![
            Message::new("hello").with_key("k1").with_timestamp(1_500_000_000_000),
            Message::new("world").with_timestamp(1_500_000_000_001),
        ]
    }

    #[test]
    fn single_message_roundtrip_magic0() {
        let msg = Message::new("payload").with_key("key");
        let encoded = encode_message(&msg, 0, Compression::None).unwrap();
        let decoded = decode_message(&encoded, 7).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].offset, 7);
        assert_eq!(decoded[0].message.key, Some(Bytes::from_static(b"key")));
        assert_eq!(decoded[0].message.value, Some(Bytes::from_static(b"payload")));
        assert_eq!(decoded[0].message.timestamp, -1, "magic 0 has no timestamp");
    }

    #[test]
    fn single_message_roundtrip_magic1_keeps_timestamp() {
        let msg = Message::new("v").with_timestamp(42);
        let encoded = encode_message(&msg, 1, Compression::None).unwrap();
        let decoded = decode_message(&encoded, 0).unwrap();
        assert_eq!(decoded[0].message.timestamp, 42);
    }

    #[test]
    fn magic_gates_timestamp_bytes() {
        let msg = Message::new("v").with_timestamp(42);
        let magic0 = encode_message(&msg, 0, Compression::None).unwrap();
        let magic1 = encode_message(&msg, 1, Compression::None).unwrap();
        assert_eq!(magic1.len(), magic0.len() + 8);
    }

    #[test]
    fn corrupted_byte_fails_crc() {
        let msg = Message::new("payload");
        let encoded = encode_message(&msg, 0, Compression::None).unwrap();
        let mut corrupted = encoded.to_vec();
        let last = corrupted.len() - 1;
        corrupted[last] ^= 0xff;
        match decode_message(&corrupted, 0) {
            Err(ProtocolError::CrcMismatch { .. }) => {}
            other => panic!("expected CRC mismatch, got {other:?}"),
        }
    }

    #[test]
    fn null_key_and_empty_key_are_distinct() {
        let null_key = Message::new("v");
        let empty_key = Message::new("v").with_key("");
        let a = encode_message(&null_key, 0, Compression::None).unwrap();
        let b = encode_message(&empty_key, 0, Compression::None).unwrap();
        assert_ne!(a, b);
        assert_eq!(decode_message(&a, 0).unwrap()[0].message.key, None);
        assert_eq!(
            decode_message(&b, 0).unwrap()[0].message.key,
            Some(Bytes::new())
        );
    }

    #[test]
    fn message_set_roundtrip() {
        let messages = sample();
        let encoded = encode_message_set(&messages, 1, Compression::None).unwrap();
        let decoded = decode_message_set(&encoded).unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].offset, 0);
        assert_eq!(decoded[1].offset, 1);
        assert_eq!(decoded[0].message, messages[0]);
        assert_eq!(decoded[1].message, messages[1]);
    }

    #[test]
    fn trailing_partial_record_is_dropped() {
        let messages = sample();
        let encoded = encode_message_set(&messages, 1, Compression::None).unwrap();
        // cut into the second message's body
        let truncated = &encoded[..encoded.len() - 5];
        let decoded = decode_message_set(truncated).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].message, messages[0]);
    }

    #[test]
    fn gzip_roundtrip_flattens_and_renumbers() {
        let messages = sample();
        let encoded = encode_message_set(&messages, 1, Compression::Gzip).unwrap();
        let decoded = decode_message_set(&encoded).unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].offset, 0);
        assert_eq!(decoded[1].offset, 1);
        assert_eq!(decoded[0].message.value, messages[0].value);
        assert_eq!(decoded[1].message.value, messages[1].value);
    }

    #[test]
    fn gzip_renumbers_against_wrapper_offset() {
        let messages = sample();
        let inner = encode_plain_set(&messages, 1).unwrap();
        let wrapper = Message {
            key: None,
            value: Some(gzip(&inner).unwrap()),
            timestamp: -1,
        };
        let carrier = encode_message(&wrapper, 1, Compression::Gzip).unwrap();
        // broker delivered the carrier at offset 45 = last inner message
        let decoded = decode_message(&carrier, 45).unwrap();
        assert_eq!(decoded[0].offset, 44);
        assert_eq!(decoded[1].offset, 45);
    }

    #[test]
    fn snappy_is_unsupported_both_ways() {
        let messages = sample();
        assert_eq!(
            encode_message_set(&messages, 1, Compression::Snappy),
            Err(ProtocolError::UnsupportedCompression(2))
        );

        // hand-build a message claiming the snappy codec bit
        let mut body = BytesMut::new();
        wire::put_u8(&mut body, 0);
        wire::put_u8(&mut body, 2);
        wire::put_nullable_bytes(&mut body, None);
        wire::put_nullable_bytes(&mut body, Some(b"compressed"));
        let crc = crc32fast::hash(&body);
        let mut framed = BytesMut::new();
        wire::put_u32(&mut framed, crc);
        framed.extend_from_slice(&body);
        assert_eq!(
            decode_message(&framed, 0),
            Err(ProtocolError::UnsupportedCompression(2))
        );
    }

    #[test]
    fn message_size_is_byte_length_not_count() {
        let messages = vec![Message::new("abc")];
        let encoded = encode_message_set(&messages, 0, Compression::None).unwrap();
        let mut cur = Cursor::new(&encoded[..]);
        let _offset = wire::get_i64(&mut cur).unwrap();
        let size = wire::get_i32(&mut cur).unwrap();
        assert_eq!(size as usize, encoded.len() - ENTRY_HEADER_LEN);
        assert_ne!(size, 1);
    }
}

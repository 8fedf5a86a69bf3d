//! Binary primitives of the wire format.
//!
//! All readers take a `Cursor` over the undecoded remainder and advance it;
//! all writers append to a `BytesMut`. Readers check the remaining length
//! before touching the buffer so a truncated frame surfaces as
//! [`ProtocolError::Underrun`] instead of a panic.

use std::io::Cursor;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::ProtocolError;

pub type Reader<'a> = Cursor<&'a [u8]>;

fn ensure(cur: &Reader<'_>, needed: usize) -> Result<(), ProtocolError> {
    let available = cur.remaining();
    if available < needed {
        Err(ProtocolError::Underrun { needed, available })
    } else {
        Ok(())
    }
}

pub fn get_i8(cur: &mut Reader<'_>) -> Result<i8, ProtocolError> {
    ensure(cur, 1)?;
    Ok(cur.get_i8())
}

pub fn get_u8(cur: &mut Reader<'_>) -> Result<u8, ProtocolError> {
    ensure(cur, 1)?;
    Ok(cur.get_u8())
}

pub fn get_i16(cur: &mut Reader<'_>) -> Result<i16, ProtocolError> {
    ensure(cur, 2)?;
    Ok(cur.get_i16())
}

pub fn get_i32(cur: &mut Reader<'_>) -> Result<i32, ProtocolError> {
    ensure(cur, 4)?;
    Ok(cur.get_i32())
}

pub fn get_u32(cur: &mut Reader<'_>) -> Result<u32, ProtocolError> {
    ensure(cur, 4)?;
    Ok(cur.get_u32())
}

/// 64-bit values use the native signed type; two's-complement semantics make
/// sentinel offsets such as `-1` round-trip unchanged.
pub fn get_i64(cur: &mut Reader<'_>) -> Result<i64, ProtocolError> {
    ensure(cur, 8)?;
    Ok(cur.get_i64())
}

/// Read an `int16`-length-prefixed non-nullable string.
pub fn get_string(cur: &mut Reader<'_>) -> Result<String, ProtocolError> {
    match get_nullable_string(cur)? {
        Some(s) => Ok(s),
        None => Err(ProtocolError::InvalidLength(-1)),
    }
}

/// Read an `int16`-length-prefixed nullable string (`-1` means null).
pub fn get_nullable_string(cur: &mut Reader<'_>) -> Result<Option<String>, ProtocolError> {
    let len = get_i16(cur)?;
    if len == -1 {
        return Ok(None);
    }
    if len < 0 {
        return Err(ProtocolError::InvalidLength(len as i32));
    }
    let len = len as usize;
    ensure(cur, len)?;
    let mut raw = vec![0u8; len];
    cur.copy_to_slice(&mut raw);
    String::from_utf8(raw)
        .map(Some)
        .map_err(|_| ProtocolError::InvalidUtf8)
}

/// Read an `int32`-length-prefixed non-nullable byte blob.
pub fn get_bytes(cur: &mut Reader<'_>) -> Result<Bytes, ProtocolError> {
    match get_nullable_bytes(cur)? {
        Some(b) => Ok(b),
        None => Err(ProtocolError::InvalidLength(-1)),
    }
}

/// Read an `int32`-length-prefixed nullable byte blob. `-1` means null;
/// `0` is a present-but-empty value, distinct from null.
pub fn get_nullable_bytes(cur: &mut Reader<'_>) -> Result<Option<Bytes>, ProtocolError> {
    let len = get_i32(cur)?;
    if len == -1 {
        return Ok(None);
    }
    if len < 0 {
        return Err(ProtocolError::InvalidLength(len));
    }
    let len = len as usize;
    ensure(cur, len)?;
    let mut raw = vec![0u8; len];
    cur.copy_to_slice(&mut raw);
    Ok(Some(Bytes::from(raw)))
}

/// Read an array count. Negative counts never occur in well-formed frames
/// and are rejected as out of range.
pub fn get_array_len(cur: &mut Reader<'_>) -> Result<usize, ProtocolError> {
    let count = get_i32(cur)?;
    if count < 0 {
        return Err(ProtocolError::InvalidLength(count));
    }
    Ok(count as usize)
}

/// Decode `count`-prefixed array elements with `f`. A zero count yields an
/// empty vector.
pub fn get_array<T>(
    cur: &mut Reader<'_>,
    mut f: impl FnMut(&mut Reader<'_>) -> Result<T, ProtocolError>,
) -> Result<Vec<T>, ProtocolError> {
    let count = get_array_len(cur)?;
    let mut out = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        out.push(f(cur)?);
    }
    Ok(out)
}

pub fn put_i8(buf: &mut BytesMut, value: i8) {
    buf.put_i8(value);
}

pub fn put_u8(buf: &mut BytesMut, value: u8) {
    buf.put_u8(value);
}

pub fn put_i16(buf: &mut BytesMut, value: i16) {
    buf.put_i16(value);
}

pub fn put_i32(buf: &mut BytesMut, value: i32) {
    buf.put_i32(value);
}

pub fn put_u32(buf: &mut BytesMut, value: u32) {
    buf.put_u32(value);
}

pub fn put_i64(buf: &mut BytesMut, value: i64) {
    buf.put_i64(value);
}

/// Write an `int16`-length-prefixed string. An empty string encodes with
/// length `0`, not the null marker.
pub fn put_string(buf: &mut BytesMut, value: &str) {
    buf.put_i16(value.len() as i16);
    buf.put_slice(value.as_bytes());
}

pub fn put_nullable_string(buf: &mut BytesMut, value: Option<&str>) {
    match value {
        Some(s) => put_string(buf, s),
        None => buf.put_i16(-1),
    }
}

/// Write an `int32`-length-prefixed byte blob.
pub fn put_bytes(buf: &mut BytesMut, value: &[u8]) {
    buf.put_i32(value.len() as i32);
    buf.put_slice(value);
}

pub fn put_nullable_bytes(buf: &mut BytesMut, value: Option<&[u8]>) {
    match value {
        Some(b) => put_bytes(buf, b),
        None => buf.put_i32(-1),
    }
}

/// Write a count-prefixed array with `f` applied to each element.
pub fn put_array<T>(buf: &mut BytesMut, items: &[T], mut f: impl FnMut(&mut BytesMut, &T)) {
    buf.put_i32(items.len() as i32);
    for item in items {
        f(buf, item);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reader(bytes: &[u8]) -> Reader<'_> {
        Cursor::new(bytes)
    }

    #[test]
    fn integer_roundtrip() {
        let mut buf = BytesMut::new();
        put_i8(&mut buf, -3);
        put_u8(&mut buf, 250);
        put_i16(&mut buf, -2);
        put_i32(&mut buf, 1 << 20);
        put_u32(&mut buf, 0xdead_beef);
        put_i64(&mut buf, -1);
        put_i64(&mut buf, i64::MAX);

        let frozen = buf.freeze();
        let mut cur = reader(&frozen);
        assert_eq!(get_i8(&mut cur).unwrap(), -3);
        assert_eq!(get_u8(&mut cur).unwrap(), 250);
        assert_eq!(get_i16(&mut cur).unwrap(), -2);
        assert_eq!(get_i32(&mut cur).unwrap(), 1 << 20);
        assert_eq!(get_u32(&mut cur).unwrap(), 0xdead_beef);
        assert_eq!(get_i64(&mut cur).unwrap(), -1, "no-offset sentinel survives");
        assert_eq!(get_i64(&mut cur).unwrap(), i64::MAX);
        assert_eq!(cur.remaining(), 0);
    }

    #[test]
    fn integers_are_big_endian() {
        let mut buf = BytesMut::new();
        put_i32(&mut buf, 0x0102_0304);
        assert_eq!(&buf[..], &[0x01, 0x02, 0x03, 0x04]);
        let mut buf = BytesMut::new();
        put_i16(&mut buf, 0x0a0b);
        assert_eq!(&buf[..], &[0x0a, 0x0b]);
    }

    #[test]
    fn string_roundtrip_and_empty() {
        let mut buf = BytesMut::new();
        put_string(&mut buf, "topic");
        put_string(&mut buf, "");
        put_nullable_string(&mut buf, None);

        let frozen = buf.freeze();
        let mut cur = reader(&frozen);
        assert_eq!(get_string(&mut cur).unwrap(), "topic");
        assert_eq!(get_string(&mut cur).unwrap(), "");
        assert_eq!(get_nullable_string(&mut cur).unwrap(), None);
    }

    #[test]
    fn empty_string_is_not_null() {
        let mut buf = BytesMut::new();
        put_string(&mut buf, "");
        assert_eq!(&buf[..], &[0x00, 0x00]);
    }

    #[test]
    fn bytes_null_vs_empty() {
        let mut buf = BytesMut::new();
        put_nullable_bytes(&mut buf, None);
        put_nullable_bytes(&mut buf, Some(b""));
        put_nullable_bytes(&mut buf, Some(b"xy"));

        let frozen = buf.freeze();
        let mut cur = reader(&frozen);
        assert_eq!(get_nullable_bytes(&mut cur).unwrap(), None);
        assert_eq!(get_nullable_bytes(&mut cur).unwrap(), Some(Bytes::new()));
        assert_eq!(
            get_nullable_bytes(&mut cur).unwrap(),
            Some(Bytes::from_static(b"xy"))
        );
    }

    #[test]
    fn negative_array_count_is_rejected() {
        let mut buf = BytesMut::new();
        put_i32(&mut buf, -4);
        let frozen = buf.freeze();
        let mut cur = reader(&frozen);
        assert_eq!(
            get_array_len(&mut cur),
            Err(ProtocolError::InvalidLength(-4))
        );
    }

    #[test]
    fn zero_count_decodes_to_empty_collection() {
        let mut buf = BytesMut::new();
        put_i32(&mut buf, 0);
        let frozen = buf.freeze();
        let mut cur = reader(&frozen);
        let items = get_array(&mut cur, get_i32).unwrap();
        assert!(items.is_empty());
    }

    #[test]
    fn truncated_input_reports_underrun() {
        let bytes = [0x00, 0x00, 0x00];
        let mut cur = reader(&bytes);
        assert_eq!(
            get_i32(&mut cur),
            Err(ProtocolError::Underrun {
                needed: 4,
                available: 3
            })
        );

        // length prefix promises more than the buffer holds
        let bytes = [0x00, 0x05, b'a', b'b'];
        let mut cur = reader(&bytes);
        assert_eq!(
            get_string(&mut cur),
            Err(ProtocolError::Underrun {
                needed: 5,
                available: 2
            })
        );
    }

    #[test]
    fn array_roundtrip() {
        let mut buf = BytesMut::new();
        put_array(&mut buf, &[1i32, 2, 3], |b, v| put_i32(b, *v));
        let frozen = buf.freeze();
        let mut cur = reader(&frozen);
        assert_eq!(get_array(&mut cur, get_i32).unwrap(), vec![1, 2, 3]);
    }
}

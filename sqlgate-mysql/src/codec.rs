// Copyright 2025 Apache Doris Community
// Licensed under the Apache License, Version 2.0

//! MySQL Protocol Codec
//!
//! Pure encode/decode helpers over byte slices. Decoders take the buffer and
//! a read offset and return the decoded value together with the offset just
//! past it, so callers thread an explicit cursor through a packet:
//!
//! ```text
//! let (flags, pos) = read_u32_le(buf, 0)?;
//! let (name, pos) = read_null_terminated(buf, pos)?;
//! ```

use std::collections::HashMap;

use bytes::{BufMut, BytesMut};
use sqlgate_common::ProtocolError;

use crate::constants::*;

/// A decoded value and the offset immediately after it.
pub type Decoded<T> = Result<(T, usize), ProtocolError>;

fn take<'a>(buf: &'a [u8], pos: usize, len: usize) -> Decoded<&'a [u8]> {
    let end = pos
        .checked_add(len)
        .filter(|end| *end <= buf.len())
        .ok_or_else(|| {
            ProtocolError::Malformed(format!(
                "need {} bytes at offset {}, only {} available",
                len,
                pos,
                buf.len().saturating_sub(pos)
            ))
        })?;
    Ok((&buf[pos..end], end))
}

pub fn read_u8(buf: &[u8], pos: usize) -> Decoded<u8> {
    let (bytes, pos) = take(buf, pos, 1)?;
    Ok((bytes[0], pos))
}

pub fn read_u16_le(buf: &[u8], pos: usize) -> Decoded<u16> {
    let (bytes, pos) = take(buf, pos, 2)?;
    Ok((u16::from_le_bytes([bytes[0], bytes[1]]), pos))
}

pub fn read_u24_le(buf: &[u8], pos: usize) -> Decoded<u32> {
    let (bytes, pos) = take(buf, pos, 3)?;
    Ok((u32::from_le_bytes([bytes[0], bytes[1], bytes[2], 0]), pos))
}

pub fn read_u32_le(buf: &[u8], pos: usize) -> Decoded<u32> {
    let (bytes, pos) = take(buf, pos, 4)?;
    Ok((u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]), pos))
}

pub fn read_u64_le(buf: &[u8], pos: usize) -> Decoded<u64> {
    let (bytes, pos) = take(buf, pos, 8)?;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(bytes);
    Ok((u64::from_le_bytes(raw), pos))
}

/// Read `len` raw bytes.
pub fn read_bytes<'a>(buf: &'a [u8], pos: usize, len: usize) -> Decoded<&'a [u8]> {
    take(buf, pos, len)
}

/// Read a length-encoded integer. `None` is the NULL marker (0xFB).
pub fn read_lenenc_int(buf: &[u8], pos: usize) -> Decoded<Option<u64>> {
    let (first, pos) = read_u8(buf, pos)?;
    match first {
        0..=250 => Ok((Some(first as u64), pos)),
        LENENC_NULL => Ok((None, pos)),
        LENENC_U16 => read_u16_le(buf, pos).map(|(v, pos)| (Some(v as u64), pos)),
        LENENC_U24 => read_u24_le(buf, pos).map(|(v, pos)| (Some(v as u64), pos)),
        LENENC_U64 => read_u64_le(buf, pos).map(|(v, pos)| (Some(v), pos)),
        _ => Err(ProtocolError::Malformed(format!(
            "invalid length-encoded integer prefix 0x{:02X}",
            first
        ))),
    }
}

/// Read a length-encoded byte string. `None` is the NULL marker.
pub fn read_lenenc_bytes<'a>(buf: &'a [u8], pos: usize) -> Decoded<Option<&'a [u8]>> {
    let (len, pos) = read_lenenc_int(buf, pos)?;
    match len {
        None => Ok((None, pos)),
        Some(len) => {
            let len = usize::try_from(len).map_err(|_| {
                ProtocolError::Malformed(format!("length-encoded string too long: {}", len))
            })?;
            let (bytes, pos) = take(buf, pos, len)?;
            Ok((Some(bytes), pos))
        }
    }
}

/// Read bytes up to (not including) the next NUL; the returned offset is
/// past the terminator.
pub fn read_null_terminated<'a>(buf: &'a [u8], pos: usize) -> Decoded<&'a [u8]> {
    let rest = buf.get(pos..).unwrap_or_default();
    match rest.iter().position(|b| *b == 0) {
        Some(idx) => Ok((&rest[..idx], pos + idx + 1)),
        None => Err(ProtocolError::Malformed(format!(
            "missing NUL terminator after offset {}",
            pos
        ))),
    }
}

/// Like [`read_null_terminated`] but accepts a string that runs to the end of
/// the buffer without a terminator. Some clients omit the final NUL on
/// trailing handshake fields.
pub fn read_null_terminated_or_eof<'a>(buf: &'a [u8], pos: usize) -> (&'a [u8], usize) {
    let rest = buf.get(pos..).unwrap_or_default();
    match rest.iter().position(|b| *b == 0) {
        Some(idx) => (&rest[..idx], pos + idx + 1),
        None => (rest, buf.len()),
    }
}

/// Decode a connection attribute block: length-encoded key/value pairs until
/// the block is exhausted. Later duplicates overwrite earlier keys.
pub fn read_connect_attrs(block: &[u8]) -> Result<HashMap<String, String>, ProtocolError> {
    let mut attrs = HashMap::new();
    let mut pos = 0;
    while pos < block.len() {
        let (key, next) = read_lenenc_bytes(block, pos)?;
        let (value, next) = read_lenenc_bytes(block, next)?;
        pos = next;

        let key = String::from_utf8_lossy(key.unwrap_or_default()).into_owned();
        let value = String::from_utf8_lossy(value.unwrap_or_default()).into_owned();
        attrs.insert(key, value);
    }
    Ok(attrs)
}

/// Write a length-encoded integer using the shortest valid form.
pub fn write_lenenc_int(buf: &mut BytesMut, value: u64) {
    if value <= 250 {
        buf.put_u8(value as u8);
    } else if value <= 0xFFFF {
        buf.put_u8(LENENC_U16);
        buf.put_u16_le(value as u16);
    } else if value <= 0xFF_FFFF {
        buf.put_u8(LENENC_U24);
        buf.put_uint_le(value, 3);
    } else {
        buf.put_u8(LENENC_U64);
        buf.put_u64_le(value);
    }
}

pub fn write_lenenc_bytes(buf: &mut BytesMut, bytes: &[u8]) {
    write_lenenc_int(buf, bytes.len() as u64);
    buf.put_slice(bytes);
}

pub fn write_null_terminated(buf: &mut BytesMut, bytes: &[u8]) {
    buf.put_slice(bytes);
    buf.put_u8(0);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_int(value: u64) -> BytesMut {
        let mut buf = BytesMut::new();
        write_lenenc_int(&mut buf, value);
        buf
    }

    #[test]
    fn test_lenenc_int_picks_shortest_form() {
        let cases: [(u64, usize); 8] = [
            (0, 1),
            (250, 1),
            (251, 3),
            (0xFFFF, 3),
            (0x10000, 4),
            (0xFF_FFFF, 4),
            (0x100_0000, 9),
            (u64::MAX, 9),
        ];

        for (value, width) in cases {
            let buf = encode_int(value);
            assert_eq!(buf.len(), width, "width of {}", value);

            let (decoded, pos) = read_lenenc_int(&buf, 0).unwrap();
            assert_eq!(decoded, Some(value));
            assert_eq!(pos, width);
        }
    }

    #[test]
    fn test_lenenc_int_prefixes() {
        assert_eq!(encode_int(251)[0], 0xFC);
        assert_eq!(encode_int(0x10000)[0], 0xFD);
        assert_eq!(encode_int(0x100_0000)[0], 0xFE);
    }

    #[test]
    fn test_lenenc_null_is_distinct_from_zero() {
        assert_eq!(read_lenenc_int(&[0xFB], 0).unwrap(), (None, 1));
        assert_eq!(read_lenenc_int(&[0x00], 0).unwrap(), (Some(0), 1));
    }

    #[test]
    fn test_lenenc_int_rejects_bad_prefix_and_short_input() {
        assert!(matches!(read_lenenc_int(&[0xFF], 0), Err(ProtocolError::Malformed(_))));
        assert!(matches!(read_lenenc_int(&[0xFC, 0x01], 0), Err(ProtocolError::Malformed(_))));
        assert!(matches!(read_lenenc_int(&[], 0), Err(ProtocolError::Malformed(_))));
    }

    #[test]
    fn test_lenenc_bytes_at_offset() {
        let mut buf = BytesMut::new();
        buf.put_u8(0xAA);
        write_lenenc_bytes(&mut buf, b"hello");
        buf.put_u8(0xBB);

        let (bytes, pos) = read_lenenc_bytes(&buf, 1).unwrap();
        assert_eq!(bytes, Some(&b"hello"[..]));
        assert_eq!(pos, 7);
        assert_eq!(buf[pos], 0xBB);
    }

    #[test]
    fn test_lenenc_bytes_truncated() {
        let buf = [0x05, b'a', b'b'];
        assert!(matches!(read_lenenc_bytes(&buf, 0), Err(ProtocolError::Malformed(_))));
    }

    #[test]
    fn test_null_terminated() {
        let buf = b"root\0test\0";
        let (user, pos) = read_null_terminated(buf, 0).unwrap();
        assert_eq!(user, b"root");
        assert_eq!(pos, 5);

        let (db, pos) = read_null_terminated(buf, pos).unwrap();
        assert_eq!(db, b"test");
        assert_eq!(pos, buf.len());
    }

    #[test]
    fn test_null_terminated_without_terminator_is_malformed() {
        assert!(matches!(read_null_terminated(b"root", 0), Err(ProtocolError::Malformed(_))));
        assert!(matches!(read_null_terminated(b"", 0), Err(ProtocolError::Malformed(_))));
        assert!(matches!(read_null_terminated(b"a\0", 5), Err(ProtocolError::Malformed(_))));
    }

    #[test]
    fn test_null_terminated_or_eof() {
        assert_eq!(read_null_terminated_or_eof(b"abc", 0), (&b"abc"[..], 3));
        assert_eq!(read_null_terminated_or_eof(b"abc\0d", 0), (&b"abc"[..], 4));
        assert_eq!(read_null_terminated_or_eof(b"abc", 3), (&b""[..], 3));
    }

    #[test]
    fn test_fixed_width_integers() {
        let buf = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];
        assert_eq!(read_u16_le(&buf, 0).unwrap(), (0x0201, 2));
        assert_eq!(read_u24_le(&buf, 0).unwrap(), (0x030201, 3));
        assert_eq!(read_u32_le(&buf, 4).unwrap(), (0x08070605, 8));
        assert_eq!(read_u64_le(&buf, 0).unwrap(), (0x0807060504030201, 8));
        assert!(read_u32_le(&buf, 6).is_err());
    }

    #[test]
    fn test_connect_attrs_last_write_wins() {
        let mut block = BytesMut::new();
        write_lenenc_bytes(&mut block, b"_client_name");
        write_lenenc_bytes(&mut block, b"libmysql");
        write_lenenc_bytes(&mut block, b"_os");
        write_lenenc_bytes(&mut block, b"linux");
        write_lenenc_bytes(&mut block, b"_client_name");
        write_lenenc_bytes(&mut block, b"mysql-connector");

        let attrs = read_connect_attrs(&block).unwrap();
        assert_eq!(attrs.len(), 2);
        assert_eq!(attrs["_client_name"], "mysql-connector");
        assert_eq!(attrs["_os"], "linux");
    }

    #[test]
    fn test_connect_attrs_missing_value_is_malformed() {
        let mut block = BytesMut::new();
        write_lenenc_bytes(&mut block, b"orphan_key");
        assert!(read_connect_attrs(&block).is_err());
        assert!(read_connect_attrs(&[]).unwrap().is_empty());
    }
}

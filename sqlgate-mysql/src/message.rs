// Copyright 2025 Apache Doris Community
// Licensed under the Apache License, Version 2.0

//! MySQL Protocol Messages
//!
//! Payload layouts for the packets exchanged during the handshake and the
//! command phase. Everything here works on packet payloads only; framing
//! lives in [`crate::packet`].

use std::collections::HashMap;

use bytes::{BufMut, Bytes, BytesMut};
use sqlgate_common::ProtocolError;

use crate::codec::*;
use crate::constants::*;

/// Initial handshake (protocol v10) sent by the server.
#[derive(Debug, Clone)]
pub struct Greeting<'a> {
    pub server_version: &'a str,
    pub connection_id: u32,
    pub salt: &'a [u8; SALT_LEN],
    pub capability_flags: u32,
    pub character_set: u8,
    pub status_flags: u16,
    pub auth_plugin_name: &'a str,
}

impl Greeting<'_> {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(128);

        buf.put_u8(PROTOCOL_VERSION);
        write_null_terminated(&mut buf, self.server_version.as_bytes());
        buf.put_u32_le(self.connection_id);

        // Auth plugin data part 1 + filler
        buf.put_slice(&self.salt[..SALT_FIRST_PART_LEN]);
        buf.put_u8(0);

        buf.put_u16_le((self.capability_flags & 0xFFFF) as u16);
        buf.put_u8(self.character_set);
        buf.put_u16_le(self.status_flags);
        buf.put_u16_le((self.capability_flags >> 16) as u16);

        // Auth plugin data length counts the trailing NUL
        buf.put_u8(SALT_LEN as u8 + 1);
        buf.put_bytes(0, 10);

        buf.put_slice(&self.salt[SALT_FIRST_PART_LEN..]);
        buf.put_u8(0);

        write_null_terminated(&mut buf, self.auth_plugin_name.as_bytes());

        buf.freeze()
    }
}

/// HandshakeResponse41 sent by the client.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandshakeResponse {
    pub capability_flags: u32,
    pub max_packet_size: u32,
    pub character_set: u8,
    pub username: String,
    pub auth_response: Vec<u8>,
    pub database: Option<String>,
    pub auth_plugin_name: Option<String>,
    pub connect_attrs: HashMap<String, String>,
}

impl HandshakeResponse {
    /// Decode a client response. Optional fields are read only when their
    /// capability bit is set, and decoding stops quietly once the payload
    /// is exhausted: clients do not always send every field they declare.
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        if payload.len() < HANDSHAKE_RESPONSE_HEADER_LEN {
            return Err(ProtocolError::ResponseTooShort(payload.len()));
        }

        let (capability_flags, pos) = read_u32_le(payload, 0)?;
        let (max_packet_size, pos) = read_u32_le(payload, pos)?;
        let (character_set, pos) = read_u8(payload, pos)?;
        let (_reserved, pos) = read_bytes(payload, pos, 23)?;

        let mut resp = HandshakeResponse {
            capability_flags,
            max_packet_size,
            character_set,
            ..Default::default()
        };

        if pos >= payload.len() {
            return Ok(resp);
        }
        let (username, mut pos) = read_null_terminated(payload, pos)?;
        resp.username = String::from_utf8_lossy(username).into_owned();

        if pos >= payload.len() {
            return Ok(resp);
        }
        let (auth_response, next) = Self::decode_auth_response(capability_flags, payload, pos)?;
        resp.auth_response = auth_response;
        pos = next;

        if capability_flags & CLIENT_CONNECT_WITH_DB != 0 {
            if pos >= payload.len() {
                return Ok(resp);
            }
            let (db, next) = read_null_terminated_or_eof(payload, pos);
            if !db.is_empty() {
                resp.database = Some(String::from_utf8_lossy(db).into_owned());
            }
            pos = next;
        }

        if capability_flags & CLIENT_PLUGIN_AUTH != 0 {
            if pos >= payload.len() {
                return Ok(resp);
            }
            let (plugin, next) = read_null_terminated_or_eof(payload, pos);
            if !plugin.is_empty() {
                resp.auth_plugin_name = Some(String::from_utf8_lossy(plugin).into_owned());
            }
            pos = next;
        }

        if capability_flags & CLIENT_CONNECT_ATTRS != 0 {
            if pos >= payload.len() {
                return Ok(resp);
            }
            let (block, _) = read_lenenc_bytes(payload, pos)?;
            if let Some(block) = block {
                resp.connect_attrs = read_connect_attrs(block)?;
            }
        }

        Ok(resp)
    }

    fn decode_auth_response(
        flags: u32,
        payload: &[u8],
        pos: usize,
    ) -> Result<(Vec<u8>, usize), ProtocolError> {
        if flags & CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA != 0 {
            let (data, pos) = read_lenenc_bytes(payload, pos)?;
            Ok((data.unwrap_or_default().to_vec(), pos))
        } else if flags & CLIENT_SECURE_CONNECTION != 0 {
            let (len, pos) = read_u8(payload, pos)?;
            let (data, pos) = read_bytes(payload, pos, len as usize)?;
            Ok((data.to_vec(), pos))
        } else {
            let (data, pos) = read_null_terminated(payload, pos)?;
            Ok((data.to_vec(), pos))
        }
    }
}

/// Request that the client re-sends its credentials for another plugin.
#[derive(Debug, Clone)]
pub struct AuthSwitchRequest<'a> {
    pub plugin_name: &'a str,
    pub salt: &'a [u8; SALT_LEN],
}

impl AuthSwitchRequest<'_> {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(2 + self.plugin_name.len() + SALT_LEN + 1);
        buf.put_u8(AUTH_SWITCH_HEADER);
        write_null_terminated(&mut buf, self.plugin_name.as_bytes());
        write_null_terminated(&mut buf, self.salt);
        buf.freeze()
    }
}

// OK Packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OkPacket {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status_flags: u16,
    pub warnings: u16,
}

impl OkPacket {
    pub fn new(status_flags: u16) -> Self {
        Self {
            affected_rows: 0,
            last_insert_id: 0,
            status_flags,
            warnings: 0,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(16);
        buf.put_u8(OK_HEADER);
        write_lenenc_int(&mut buf, self.affected_rows);
        write_lenenc_int(&mut buf, self.last_insert_id);
        buf.put_u16_le(self.status_flags);
        buf.put_u16_le(self.warnings);
        buf.freeze()
    }
}

impl Default for OkPacket {
    fn default() -> Self {
        Self::new(SERVER_STATUS_AUTOCOMMIT)
    }
}

// Error Packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrPacket {
    pub error_code: u16,
    pub sql_state: String,
    pub error_message: String,
}

impl ErrPacket {
    pub fn new(error_code: u16, sql_state: &str, error_message: impl Into<String>) -> Self {
        Self {
            error_code,
            sql_state: sql_state.to_string(),
            error_message: error_message.into(),
        }
    }

    pub fn access_denied(username: &str) -> Self {
        Self::new(
            ER_ACCESS_DENIED_ERROR,
            SQLSTATE_ACCESS_DENIED,
            format!("Access denied for user '{}'", username),
        )
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(9 + self.error_message.len());
        buf.put_u8(ERR_HEADER);
        buf.put_u16_le(self.error_code);
        // SQL state is always exactly five characters on the wire
        buf.put_u8(b'#');
        let state = self.sql_state.as_bytes();
        for i in 0..5 {
            buf.put_u8(state.get(i).copied().unwrap_or(b' '));
        }
        buf.put_slice(self.error_message.as_bytes());
        buf.freeze()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Sleep,
    Quit,
    InitDb,
    Query,
    FieldList,
    Ping,
    Other(u8),
}

impl From<u8> for CommandKind {
    fn from(byte: u8) -> Self {
        match byte {
            COM_SLEEP => CommandKind::Sleep,
            COM_QUIT => CommandKind::Quit,
            COM_INIT_DB => CommandKind::InitDb,
            COM_QUERY => CommandKind::Query,
            COM_FIELD_LIST => CommandKind::FieldList,
            COM_PING => CommandKind::Ping,
            b => CommandKind::Other(b),
        }
    }
}

/// One client request in the command phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command<'a> {
    pub kind: CommandKind,
    pub payload: &'a [u8],
}

impl<'a> Command<'a> {
    /// Returns `None` for an empty packet.
    pub fn decode(packet: &'a [u8]) -> Option<Self> {
        let (&first, payload) = packet.split_first()?;
        Some(Self {
            kind: CommandKind::from(first),
            payload,
        })
    }

    /// Query text with one trailing NUL removed, if present.
    pub fn query_text(&self) -> Result<&'a str, ProtocolError> {
        let raw = self.payload.strip_suffix(&[0]).unwrap_or(self.payload);
        std::str::from_utf8(raw)
            .map_err(|e| ProtocolError::Malformed(format!("query is not valid UTF-8: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SALT: [u8; SALT_LEN] = *b"abcdefghijklmnopqrst";

    fn response_header(flags: u32) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_u32_le(flags);
        buf.put_u32_le(16 * 1024 * 1024);
        buf.put_u8(UTF8MB4_GENERAL_CI);
        buf.put_bytes(0, 23);
        buf
    }

    #[test]
    fn test_greeting_layout() {
        let greeting = Greeting {
            server_version: "5.7.25-sqlgate",
            connection_id: 0x0102_0304,
            salt: &SALT,
            capability_flags: DEFAULT_CAPABILITY_FLAGS,
            character_set: DEFAULT_CHARSET,
            status_flags: SERVER_STATUS_AUTOCOMMIT,
            auth_plugin_name: MYSQL_NATIVE_PASSWORD,
        };
        let payload = greeting.encode();

        assert_eq!(payload[0], PROTOCOL_VERSION);
        let (version, pos) = read_null_terminated(&payload, 1).unwrap();
        assert_eq!(version, b"5.7.25-sqlgate");

        let (conn_id, pos) = read_u32_le(&payload, pos).unwrap();
        assert_eq!(conn_id, 0x0102_0304);

        let (salt1, pos) = read_bytes(&payload, pos, 8).unwrap();
        assert_eq!(salt1, &SALT[..8]);
        let (filler, pos) = read_u8(&payload, pos).unwrap();
        assert_eq!(filler, 0);

        let (cap_low, pos) = read_u16_le(&payload, pos).unwrap();
        let (charset, pos) = read_u8(&payload, pos).unwrap();
        let (status, pos) = read_u16_le(&payload, pos).unwrap();
        let (cap_high, pos) = read_u16_le(&payload, pos).unwrap();
        assert_eq!((cap_high as u32) << 16 | cap_low as u32, DEFAULT_CAPABILITY_FLAGS);
        assert_eq!(charset, 46);
        assert_eq!(status, SERVER_STATUS_AUTOCOMMIT);

        let (auth_len, pos) = read_u8(&payload, pos).unwrap();
        assert_eq!(auth_len, 21);
        let (reserved, pos) = read_bytes(&payload, pos, 10).unwrap();
        assert!(reserved.iter().all(|b| *b == 0));

        let (salt2, pos) = read_null_terminated(&payload, pos).unwrap();
        assert_eq!(salt2, &SALT[8..]);
        let (plugin, pos) = read_null_terminated(&payload, pos).unwrap();
        assert_eq!(plugin, MYSQL_NATIVE_PASSWORD.as_bytes());
        assert_eq!(pos, payload.len());
    }

    #[test]
    fn test_decode_full_response() {
        let flags = CLIENT_PROTOCOL_41
            | CLIENT_SECURE_CONNECTION
            | CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA
            | CLIENT_CONNECT_WITH_DB
            | CLIENT_PLUGIN_AUTH
            | CLIENT_CONNECT_ATTRS;
        let mut buf = response_header(flags);
        write_null_terminated(&mut buf, b"root");
        write_lenenc_bytes(&mut buf, &[0xAB; 20]);
        write_null_terminated(&mut buf, b"test");
        write_null_terminated(&mut buf, MYSQL_NATIVE_PASSWORD.as_bytes());
        let mut attrs = BytesMut::new();
        write_lenenc_bytes(&mut attrs, b"_client_name");
        write_lenenc_bytes(&mut attrs, b"libmysql");
        write_lenenc_bytes(&mut buf, &attrs);

        let resp = HandshakeResponse::decode(&buf).unwrap();
        assert_eq!(resp.capability_flags, flags);
        assert_eq!(resp.max_packet_size, 16 * 1024 * 1024);
        assert_eq!(resp.character_set, UTF8MB4_GENERAL_CI);
        assert_eq!(resp.username, "root");
        assert_eq!(resp.auth_response, vec![0xAB; 20]);
        assert_eq!(resp.database.as_deref(), Some("test"));
        assert_eq!(resp.auth_plugin_name.as_deref(), Some(MYSQL_NATIVE_PASSWORD));
        assert_eq!(resp.connect_attrs.get("_client_name").map(String::as_str), Some("libmysql"));
    }

    #[test]
    fn test_decode_response_too_short() {
        let err = HandshakeResponse::decode(&[0u8; 31]).unwrap_err();
        assert_eq!(err, ProtocolError::ResponseTooShort(31));
    }

    #[test]
    fn test_clear_bits_consume_nothing() {
        // Without CONNECT_WITH_DB the bytes that follow belong to the plugin name.
        let flags = CLIENT_PROTOCOL_41 | CLIENT_SECURE_CONNECTION | CLIENT_PLUGIN_AUTH;
        let mut buf = response_header(flags);
        write_null_terminated(&mut buf, b"app");
        buf.put_u8(0);
        write_null_terminated(&mut buf, CACHING_SHA2_PASSWORD.as_bytes());

        let resp = HandshakeResponse::decode(&buf).unwrap();
        assert_eq!(resp.username, "app");
        assert!(resp.auth_response.is_empty());
        assert_eq!(resp.database, None);
        assert_eq!(resp.auth_plugin_name.as_deref(), Some(CACHING_SHA2_PASSWORD));
        assert!(resp.connect_attrs.is_empty());
    }

    #[test]
    fn test_declared_fields_missing_from_buffer() {
        let flags = CLIENT_PROTOCOL_41
            | CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA
            | CLIENT_CONNECT_WITH_DB
            | CLIENT_PLUGIN_AUTH
            | CLIENT_CONNECT_ATTRS;
        let mut buf = response_header(flags);
        write_null_terminated(&mut buf, b"root");
        write_lenenc_bytes(&mut buf, b"");

        let resp = HandshakeResponse::decode(&buf).unwrap();
        assert_eq!(resp.username, "root");
        assert_eq!(resp.database, None);
        assert_eq!(resp.auth_plugin_name, None);
        assert!(resp.connect_attrs.is_empty());

        // Only the fixed header: everything after it is absent.
        let resp = HandshakeResponse::decode(&response_header(flags)).unwrap();
        assert_eq!(resp.username, "");
    }

    #[test]
    fn test_auth_response_variants() {
        let mut buf = response_header(CLIENT_PROTOCOL_41);
        write_null_terminated(&mut buf, b"legacy");
        write_null_terminated(&mut buf, b"scramble");
        let resp = HandshakeResponse::decode(&buf).unwrap();
        assert_eq!(resp.auth_response, b"scramble".to_vec());

        let mut buf = response_header(CLIENT_PROTOCOL_41 | CLIENT_SECURE_CONNECTION);
        write_null_terminated(&mut buf, b"secure");
        buf.put_u8(3);
        buf.put_slice(&[1, 2, 3]);
        let resp = HandshakeResponse::decode(&buf).unwrap();
        assert_eq!(resp.auth_response, vec![1, 2, 3]);
    }

    #[test]
    fn test_truncated_auth_response_is_malformed() {
        let mut buf = response_header(CLIENT_PROTOCOL_41 | CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA);
        write_null_terminated(&mut buf, b"root");
        buf.put_u8(20);
        buf.put_slice(&[0u8; 5]);
        assert!(matches!(HandshakeResponse::decode(&buf), Err(ProtocolError::Malformed(_))));
    }

    #[test]
    fn test_auth_switch_request_layout() {
        let payload = AuthSwitchRequest {
            plugin_name: MYSQL_NATIVE_PASSWORD,
            salt: &SALT,
        }
        .encode();

        assert_eq!(payload[0], 0xFE);
        let (plugin, pos) = read_null_terminated(&payload, 1).unwrap();
        assert_eq!(plugin, MYSQL_NATIVE_PASSWORD.as_bytes());
        let (salt, pos) = read_bytes(&payload, pos, SALT_LEN).unwrap();
        assert_eq!(salt, &SALT[..]);
        assert_eq!(payload[pos], 0);
        assert_eq!(pos + 1, payload.len());
    }

    #[test]
    fn test_ok_packet_encoding() {
        let payload = OkPacket::default().encode();
        assert_eq!(&payload[..], &[0x00u8, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_err_packet_encoding() {
        let payload = ErrPacket::access_denied("bob").encode();
        assert_eq!(payload[0], 0xFF);
        assert_eq!(u16::from_le_bytes([payload[1], payload[2]]), 1045);
        assert_eq!(&payload[3..9], b"#28000");
        assert_eq!(&payload[9..], b"Access denied for user 'bob'");
    }

    #[test]
    fn test_command_decode() {
        assert_eq!(Command::decode(&[]), None);

        let cmd = Command::decode(&[0x01]).unwrap();
        assert_eq!(cmd.kind, CommandKind::Quit);
        assert!(cmd.payload.is_empty());

        let cmd = Command::decode(&[0x2A, 1, 2]).unwrap();
        assert_eq!(cmd.kind, CommandKind::Other(0x2A));
        assert_eq!(cmd.payload, &[1u8, 2]);
    }

    #[test]
    fn test_query_text_strips_exactly_one_nul() {
        let cmd = Command::decode(b"\x03SELECT 1\0\0").unwrap();
        assert_eq!(cmd.query_text().unwrap(), "SELECT 1\0");

        let cmd = Command::decode(b"\x03SELECT 1").unwrap();
        assert_eq!(cmd.query_text().unwrap(), "SELECT 1");

        let cmd = Command::decode(&[0x03, 0xFF, 0xFE]).unwrap();
        assert!(cmd.query_text().is_err());
    }
}

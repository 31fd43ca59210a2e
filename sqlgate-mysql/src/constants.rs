// Copyright 2025 Apache Doris Community
// Licensed under the Apache License, Version 2.0

//! MySQL Protocol Constants

// MySQL Protocol Version
pub const PROTOCOL_VERSION: u8 = 10;

// Packet framing
pub const PACKET_HEADER_LEN: usize = 4;
pub const MAX_PAYLOAD_LEN: usize = (1 << 24) - 1;

// Fixed part of HandshakeResponse41: capability(4) + max packet(4) + charset(1) + reserved(23)
pub const HANDSHAKE_RESPONSE_HEADER_LEN: usize = 32;

// Scramble sent in the greeting
pub const SALT_LEN: usize = 20;
pub const SALT_FIRST_PART_LEN: usize = 8;

// Capability flags
pub const CLIENT_LONG_PASSWORD: u32 = 0x00000001;
pub const CLIENT_FOUND_ROWS: u32 = 0x00000002;
pub const CLIENT_LONG_FLAG: u32 = 0x00000004;
pub const CLIENT_CONNECT_WITH_DB: u32 = 0x00000008;
pub const CLIENT_NO_SCHEMA: u32 = 0x00000010;
pub const CLIENT_COMPRESS: u32 = 0x00000020;
pub const CLIENT_ODBC: u32 = 0x00000040;
pub const CLIENT_LOCAL_FILES: u32 = 0x00000080;
pub const CLIENT_IGNORE_SPACE: u32 = 0x00000100;
pub const CLIENT_PROTOCOL_41: u32 = 0x00000200;
pub const CLIENT_INTERACTIVE: u32 = 0x00000400;
pub const CLIENT_SSL: u32 = 0x00000800;
pub const CLIENT_IGNORE_SIGPIPE: u32 = 0x00001000;
pub const CLIENT_TRANSACTIONS: u32 = 0x00002000;
pub const CLIENT_RESERVED: u32 = 0x00004000;
pub const CLIENT_SECURE_CONNECTION: u32 = 0x00008000;
pub const CLIENT_MULTI_STATEMENTS: u32 = 0x00010000;
pub const CLIENT_MULTI_RESULTS: u32 = 0x00020000;
pub const CLIENT_PS_MULTI_RESULTS: u32 = 0x00040000;
pub const CLIENT_PLUGIN_AUTH: u32 = 0x00080000;
pub const CLIENT_CONNECT_ATTRS: u32 = 0x00100000;
pub const CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA: u32 = 0x00200000;
pub const CLIENT_CAN_HANDLE_EXPIRED_PASSWORDS: u32 = 0x00400000;
pub const CLIENT_SESSION_TRACK: u32 = 0x00800000;
pub const CLIENT_DEPRECATE_EOF: u32 = 0x01000000;

// Default server capabilities. No SSL, no compression, no LOCAL INFILE.
pub const DEFAULT_CAPABILITY_FLAGS: u32 = CLIENT_LONG_PASSWORD
    | CLIENT_FOUND_ROWS
    | CLIENT_LONG_FLAG
    | CLIENT_CONNECT_WITH_DB
    | CLIENT_PROTOCOL_41
    | CLIENT_INTERACTIVE
    | CLIENT_TRANSACTIONS
    | CLIENT_SECURE_CONNECTION
    | CLIENT_MULTI_STATEMENTS
    | CLIENT_MULTI_RESULTS
    | CLIENT_PLUGIN_AUTH
    | CLIENT_CONNECT_ATTRS
    | CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA;

// Character set
pub const UTF8MB4_GENERAL_CI: u8 = 45;
pub const UTF8MB4_BIN: u8 = 46;
pub const DEFAULT_CHARSET: u8 = UTF8MB4_BIN;

// Auth plugins
pub const MYSQL_NATIVE_PASSWORD: &str = "mysql_native_password";
pub const CACHING_SHA2_PASSWORD: &str = "caching_sha2_password";
pub const SHA256_PASSWORD: &str = "sha256_password";

// Command types
pub const COM_SLEEP: u8 = 0x00;
pub const COM_QUIT: u8 = 0x01;
pub const COM_INIT_DB: u8 = 0x02;
pub const COM_QUERY: u8 = 0x03;
pub const COM_FIELD_LIST: u8 = 0x04;
pub const COM_PING: u8 = 0x0E;

// Response packet headers
pub const OK_HEADER: u8 = 0x00;
pub const ERR_HEADER: u8 = 0xFF;
pub const AUTH_SWITCH_HEADER: u8 = 0xFE;

// Length-encoded integer prefixes
pub const LENENC_NULL: u8 = 0xFB;
pub const LENENC_U16: u8 = 0xFC;
pub const LENENC_U24: u8 = 0xFD;
pub const LENENC_U64: u8 = 0xFE;

// Status flags
pub const SERVER_STATUS_IN_TRANS: u16 = 0x0001;
pub const SERVER_STATUS_AUTOCOMMIT: u16 = 0x0002;

// Error codes and SQL states
pub const ER_ACCESS_DENIED_ERROR: u16 = 1045;
pub const ER_UNKNOWN_ERROR: u16 = 1105;
pub const SQLSTATE_ACCESS_DENIED: &str = "28000";
pub const SQLSTATE_GENERAL: &str = "HY000";

// Copyright 2025 Apache Doris Community
// Licensed under the Apache License, Version 2.0

//! Error types for sqlgate
//!
//! Errors fall into four families:
//! - transport failures (I/O, timeouts, peer gone), always fatal to the connection
//! - protocol violations (bad sequence, truncated or malformed packets), fatal
//! - authentication rejections, answered with an ERR packet before closing
//! - execution failures reported by the query collaborator, answered with an
//!   ERR packet while the connection stays open

use std::time::Duration;
use thiserror::Error;

/// Failures of the underlying byte stream.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("read timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection closed by peer")]
    Closed,
}

/// Violations of the wire protocol framing or packet layout.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("invalid sequence, expected {expected}, got {actual}")]
    SequenceMismatch { expected: u8, actual: u8 },

    #[error("truncated packet: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("malformed packet: {0}")]
    Malformed(String),

    #[error("handshake response too short: {0} bytes")]
    ResponseTooShort(usize),
}

#[derive(Error, Debug)]
pub enum GateError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl GateError {
    /// True when the peer went away without violating the protocol.
    pub fn is_clean_close(&self) -> bool {
        matches!(self, GateError::Transport(TransportError::Closed))
    }

    /// Execution errors are reported to the client and the connection
    /// continues; everything else tears the connection down.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, GateError::Execution(_))
    }
}

impl From<std::io::Error> for GateError {
    fn from(err: std::io::Error) -> Self {
        GateError::Transport(TransportError::Io(err))
    }
}

pub type Result<T> = std::result::Result<T, GateError>;

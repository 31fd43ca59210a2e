// Copyright 2025 Apache Doris Community
// Licensed under the Apache License, Version 2.0

//! MySQL Protocol Packet Framing
//!
//! MySQL wire protocol uses this packet format:
//! ```text
//! [3 bytes: payload length]
//! [1 byte: sequence number]
//! [N bytes: payload]
//! ```
//!
//! A payload of 2^24-1 bytes or more is split into several physical packets;
//! a physical packet of exactly 2^24-1 bytes means "more follows", so a
//! payload that is an exact multiple of the limit ends with an empty packet.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use sqlgate_common::{GateError, ProtocolError, Result, TransportError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufStream};

use crate::constants::{MAX_PAYLOAD_LEN, PACKET_HEADER_LEN};

const DEFAULT_READER_SIZE: usize = 16 * 1024;
const DEFAULT_WRITER_SIZE: usize = 16 * 1024;

/// Packet-level reader/writer over a buffered byte stream.
///
/// Tracks the sequence number for the current command cycle: every physical
/// packet read or written advances it by one.
pub struct PacketIo<S> {
    stream: BufStream<S>,
    sequence: u8,
    read_timeout: Option<Duration>,
}

impl<S> PacketIo<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream: BufStream::with_capacity(DEFAULT_READER_SIZE, DEFAULT_WRITER_SIZE, stream),
            sequence: 0,
            read_timeout: None,
        }
    }

    /// Bound each physical packet read. `None` waits forever.
    pub fn set_read_timeout(&mut self, timeout: Option<Duration>) {
        self.read_timeout = timeout;
    }

    pub fn sequence(&self) -> u8 {
        self.sequence
    }

    pub fn reset_sequence(&mut self) {
        self.sequence = 0;
    }

    /// Read one logical packet, joining split payloads.
    pub async fn read_packet(&mut self) -> Result<Bytes> {
        let mut data = self.read_one_packet().await?;
        if data.len() < MAX_PAYLOAD_LEN {
            return Ok(data.freeze());
        }

        loop {
            // The stream ending between fragments leaves the packet incomplete
            let chunk = match self.read_one_packet().await {
                Err(GateError::Transport(TransportError::Closed)) => {
                    return Err(ProtocolError::Truncated {
                        expected: PACKET_HEADER_LEN,
                        actual: 0,
                    }
                    .into());
                }
                chunk => chunk?,
            };
            let more = chunk.len() == MAX_PAYLOAD_LEN;
            data.extend_from_slice(&chunk);
            if !more {
                break;
            }
        }

        Ok(data.freeze())
    }

    async fn read_one_packet(&mut self) -> Result<BytesMut> {
        match self.read_timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.read_physical())
                .await
                .map_err(|_| TransportError::Timeout(timeout))?,
            None => self.read_physical().await,
        }
    }

    async fn read_physical(&mut self) -> Result<BytesMut> {
        let mut header = [0u8; PACKET_HEADER_LEN];
        let n = read_full(&mut self.stream, &mut header).await?;
        if n == 0 {
            return Err(TransportError::Closed.into());
        }
        if n < PACKET_HEADER_LEN {
            return Err(ProtocolError::Truncated {
                expected: PACKET_HEADER_LEN,
                actual: n,
            }
            .into());
        }

        let sequence = header[3];
        if sequence != self.sequence {
            return Err(ProtocolError::SequenceMismatch {
                expected: self.sequence,
                actual: sequence,
            }
            .into());
        }
        self.sequence = self.sequence.wrapping_add(1);

        let length = u32::from_le_bytes([header[0], header[1], header[2], 0]) as usize;
        let mut payload = BytesMut::zeroed(length);
        let n = read_full(&mut self.stream, &mut payload).await?;
        if n < length {
            return Err(ProtocolError::Truncated {
                expected: length,
                actual: n,
            }
            .into());
        }

        Ok(payload)
    }

    /// Buffer one logical packet, splitting it as needed. Nothing reaches the
    /// peer until [`flush`](Self::flush).
    pub async fn write_packet(&mut self, payload: &[u8]) -> Result<()> {
        let mut rest = payload;
        while rest.len() >= MAX_PAYLOAD_LEN {
            let (chunk, tail) = rest.split_at(MAX_PAYLOAD_LEN);
            self.write_physical(chunk).await?;
            rest = tail;
        }
        self.write_physical(rest).await
    }

    async fn write_physical(&mut self, chunk: &[u8]) -> Result<()> {
        let len = (chunk.len() as u32).to_le_bytes();
        let header = [len[0], len[1], len[2], self.sequence];
        self.stream.write_all(&header).await?;
        self.stream.write_all(chunk).await?;
        self.sequence = self.sequence.wrapping_add(1);
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<()> {
        self.stream.flush().await?;
        Ok(())
    }

    /// Flush and close the write half.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.stream.shutdown().await?;
        Ok(())
    }

    /// Unwrap the stream. Call [`flush`](Self::flush) first: unflushed
    /// output is dropped.
    pub fn into_inner(self) -> S {
        self.stream.into_inner()
    }
}

/// Read until `buf` is full or the stream ends; returns the bytes read.
async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

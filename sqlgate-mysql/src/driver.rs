// Copyright 2025 Apache Doris Community
// Licensed under the Apache License, Version 2.0

//! Query driver interface
//!
//! The protocol core never interprets SQL. A driver opens one session per
//! authenticated connection, splits query text into statements and runs
//! them, returning the server status flags for the OK packet.

use std::collections::HashMap;

use async_trait::async_trait;
use sqlgate_common::Result;

use crate::constants::SERVER_STATUS_AUTOCOMMIT;
use crate::message::{Command, CommandKind};

/// What the handshake learned about the client, handed to the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionParams {
    pub connection_id: u32,
    /// Negotiated capabilities (client & server)
    pub capabilities: u32,
    pub collation: u8,
    pub username: String,
    pub database: Option<String>,
    pub attributes: HashMap<String, String>,
}

pub trait SessionFactory: Send + Sync + 'static {
    type Session: Send;

    /// Called once per connection after credentials are accepted and before
    /// the client sees the final OK. An error rejects the login.
    fn open_session(&self, params: &SessionParams) -> Result<Self::Session>;

    /// Called exactly once when the connection ends.
    fn close_session(&self, _session: Self::Session) {}
}

/// Response for a command the core does not answer itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    /// Write nothing.
    None,
    /// Write an OK packet with these status flags.
    Ok(u16),
}

#[async_trait]
pub trait StatementExecutor: SessionFactory {
    /// Split query text into statements. An empty result means there is
    /// nothing to run and the client gets a plain OK.
    fn parse(&self, session: &mut Self::Session, sql: &str) -> Result<Vec<String>>;

    /// Run one statement and return the server status flags.
    /// `GateError::Execution` is reported to the client and the connection
    /// stays open; any other error closes it.
    async fn execute(&self, session: &mut Self::Session, statement: &str) -> Result<u16>;

    /// Status flags for responses that did not run a statement.
    fn status(&self, _session: &Self::Session) -> u16 {
        SERVER_STATUS_AUTOCOMMIT
    }

    /// Every command except Query and Quit lands here.
    async fn on_command(
        &self,
        session: &mut Self::Session,
        command: &Command<'_>,
    ) -> Result<Reply> {
        match command.kind {
            CommandKind::Ping => Ok(Reply::Ok(self.status(session))),
            _ => Ok(Reply::None),
        }
    }
}

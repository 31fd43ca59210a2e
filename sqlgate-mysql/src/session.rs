// Copyright 2025 Apache Doris Community
// Licensed under the Apache License, Version 2.0

//! Per-connection lifecycle: handshake, registration and the command loop.

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use sqlgate_common::{Config, GateError, Result};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::auth::Authenticator;
use crate::constants::*;
use crate::driver::{Reply, SessionParams, StatementExecutor};
use crate::handshake::{
    AuthSwitchPolicy, Handshake, Negotiated, PluginSwitchPolicy, Salt, ServerParams,
};
use crate::message::{Command, CommandKind, ErrPacket, OkPacket};
use crate::packet::PacketIo;
use crate::registry::{ConnectionInfo, ConnectionRegistry};

const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(28800);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Collaborators and settings shared by every connection of a server.
pub struct Services<D> {
    pub params: ServerParams,
    pub driver: Arc<D>,
    pub authenticator: Arc<dyn Authenticator>,
    pub switch_policy: Arc<dyn AuthSwitchPolicy>,
    pub handshake_timeout: Duration,
    pub idle_timeout: Duration,
}

impl<D: StatementExecutor> Services<D> {
    pub fn new(driver: Arc<D>, authenticator: Arc<dyn Authenticator>) -> Self {
        Self {
            params: ServerParams::default(),
            driver,
            authenticator,
            switch_policy: Arc::new(PluginSwitchPolicy::default()),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }

    pub fn from_config(
        config: &Config,
        driver: Arc<D>,
        authenticator: Arc<dyn Authenticator>,
    ) -> Self {
        Self {
            params: ServerParams::from(config),
            driver,
            authenticator,
            switch_policy: Arc::new(PluginSwitchPolicy::new(
                config.auth.plugin.clone(),
                config.auth.switch_plugins.iter().cloned(),
            )),
            handshake_timeout: config.handshake_timeout(),
            idle_timeout: config.idle_timeout(),
        }
    }
}

/// Everything known about one client connection.
#[derive(Debug, Clone)]
pub struct ConnectionState {
    pub connection_id: u32,
    pub peer: String,
    pub salt: Salt,
    pub capabilities: u32,
    pub collation: u8,
    pub username: String,
    pub current_database: Option<String>,
    pub attributes: HashMap<String, String>,
}

impl ConnectionState {
    fn new(connection_id: u32, peer: String) -> Self {
        Self {
            connection_id,
            peer,
            salt: Salt::generate(),
            capabilities: 0,
            collation: DEFAULT_CHARSET,
            username: String::new(),
            current_database: None,
            attributes: HashMap::new(),
        }
    }

    fn apply(&mut self, negotiated: &Negotiated) {
        let response = &negotiated.response;
        self.capabilities = negotiated.capabilities;
        self.collation = response.character_set;
        self.username = response.username.clone();
        self.current_database = response.database.clone();
        self.attributes = response.connect_attrs.clone();
    }

    fn session_params(&self) -> SessionParams {
        SessionParams {
            connection_id: self.connection_id,
            capabilities: self.capabilities,
            collation: self.collation,
            username: self.username.clone(),
            database: self.current_database.clone(),
            attributes: self.attributes.clone(),
        }
    }
}

/// One client connection, driven to completion by [`run`](Self::run).
pub struct Connection<S, D> {
    io: PacketIo<S>,
    state: ConnectionState,
    services: Arc<Services<D>>,
}

impl<S, D> Connection<S, D>
where
    S: AsyncRead + AsyncWrite + Unpin,
    D: StatementExecutor,
{
    pub fn new(
        stream: S,
        connection_id: u32,
        peer: impl Into<String>,
        services: Arc<Services<D>>,
    ) -> Self {
        Self {
            io: PacketIo::new(stream),
            state: ConnectionState::new(connection_id, peer.into()),
            services,
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    /// Serve the connection until the client quits, the stream fails or
    /// `cancel` fires. A client that simply goes away is not an error.
    pub async fn run(
        mut self,
        registry: &ConnectionRegistry,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let span = info_span!(
            "conn",
            conn_id = self.state.connection_id,
            peer = %self.state.peer
        );

        async move {
            let result = self.serve(registry, cancel).await;

            // Best effort: the peer may already be gone or have stopped reading
            let close = async {
                self.io.flush().await?;
                self.io.shutdown().await
            };
            match tokio::time::timeout(CLOSE_TIMEOUT, close).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!("Final flush failed: {}", e),
                Err(_) => debug!("Final flush timed out after {:?}", CLOSE_TIMEOUT),
            }

            match result {
                Ok(()) => {
                    info!("Connection closed");
                    Ok(())
                }
                Err(e) if e.is_clean_close() => {
                    info!("Client disconnected");
                    Ok(())
                }
                Err(e) => Err(e),
            }
        }
        .instrument(span)
        .await
    }

    async fn serve(
        &mut self,
        registry: &ConnectionRegistry,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let services = Arc::clone(&self.services);
        let salt = self.state.salt.clone();
        self.io.set_read_timeout(Some(services.handshake_timeout));

        let mut handshake = Handshake::new(
            &services.params,
            self.state.connection_id,
            &salt,
            services.authenticator.as_ref(),
            services.switch_policy.as_ref(),
        );

        let negotiated = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Shutdown during handshake");
                return Ok(());
            }
            negotiated = handshake.negotiate(&mut self.io) => negotiated?,
        };
        self.state.apply(&negotiated);

        let mut session = match services.driver.open_session(&self.state.session_params()) {
            Ok(session) => session,
            Err(e) => {
                warn!("Failed to open session for '{}': {}", self.state.username, e);
                let err = ErrPacket::new(ER_UNKNOWN_ERROR, SQLSTATE_GENERAL, e.to_string());
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = handshake.reject(&mut self.io, &err) => {}
                }
                return Err(e);
            }
        };

        let status = services.driver.status(&session);
        let accepted = tokio::select! {
            _ = cancel.cancelled() => None,
            accepted = handshake.accept(&mut self.io, status) => Some(accepted),
        };
        match accepted {
            Some(Ok(())) => {}
            Some(Err(e)) => {
                services.driver.close_session(session);
                return Err(e);
            }
            None => {
                debug!("Shutdown before login completed");
                services.driver.close_session(session);
                return Ok(());
            }
        }
        info!(
            "User '{}' authenticated, database: {:?}",
            self.state.username, self.state.current_database
        );

        let _registration = registry.register(ConnectionInfo {
            id: self.state.connection_id,
            peer: self.state.peer.clone(),
            user: self.state.username.clone(),
            database: self.state.current_database.clone(),
            connected_at: SystemTime::now(),
        });

        let result = self.command_loop(&mut session, registry, cancel).await;
        services.driver.close_session(session);
        result
    }

    async fn command_loop(
        &mut self,
        session: &mut D::Session,
        registry: &ConnectionRegistry,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.io.set_read_timeout(Some(self.services.idle_timeout));

        loop {
            self.io.reset_sequence();

            // Shutdown also interrupts a reply blocked on a client that stopped reading
            let flow = tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Server shutting down, closing connection");
                    return Ok(());
                }
                flow = self.next_command(session, registry) => flow?,
            };
            if flow.is_break() {
                return Ok(());
            }
        }
    }

    /// Read and answer one command. Breaks when the client is done.
    async fn next_command(
        &mut self,
        session: &mut D::Session,
        registry: &ConnectionRegistry,
    ) -> Result<ControlFlow<()>> {
        let services = Arc::clone(&self.services);
        let packet = self.io.read_packet().await?;

        let Some(command) = Command::decode(&packet) else {
            debug!("Empty command packet, closing");
            return Ok(ControlFlow::Break(()));
        };
        debug!("Command: {:?}", command.kind);

        match command.kind {
            CommandKind::Quit => return Ok(ControlFlow::Break(())),
            CommandKind::Query => {
                let sql = command.query_text()?;
                self.handle_query(session, sql).await?;
            }
            kind => {
                if kind == CommandKind::InitDb {
                    let db = String::from_utf8_lossy(command.payload).into_owned();
                    info!("Changed database to: {}", db);
                    registry.update_database(self.state.connection_id, Some(db.clone()));
                    self.state.current_database = Some(db);
                }
                let reply = services.driver.on_command(session, &command).await;
                self.send_reply(reply).await?;
            }
        }
        Ok(ControlFlow::Continue(()))
    }

    async fn handle_query(&mut self, session: &mut D::Session, sql: &str) -> Result<()> {
        debug!("Query: {}", sql.trim());
        let services = Arc::clone(&self.services);

        let statements = match services.driver.parse(session, sql) {
            Ok(statements) => statements,
            Err(e) => return self.send_execution_error(e).await,
        };

        let Some(first) = statements.first() else {
            return self.send_ok(services.driver.status(session)).await;
        };
        if statements.len() > 1 {
            warn!(
                "Query contains {} statements, only the first is executed",
                statements.len()
            );
        }

        match services.driver.execute(session, first).await {
            Ok(status) => self.send_ok(status).await,
            Err(e) => self.send_execution_error(e).await,
        }
    }

    async fn send_reply(&mut self, reply: Result<Reply>) -> Result<()> {
        match reply {
            Ok(Reply::None) => Ok(()),
            Ok(Reply::Ok(status)) => self.send_ok(status).await,
            Err(e) => self.send_execution_error(e).await,
        }
    }

    async fn send_ok(&mut self, status_flags: u16) -> Result<()> {
        self.io.write_packet(&OkPacket::new(status_flags).encode()).await?;
        self.io.flush().await
    }

    /// Report an execution error to the client. Anything else is fatal and
    /// handed back to the caller.
    async fn send_execution_error(&mut self, err: GateError) -> Result<()> {
        if err.is_fatal() {
            return Err(err);
        }
        let message = match err {
            GateError::Execution(message) => message,
            other => other.to_string(),
        };
        warn!("Statement failed: {}", message);
        let packet = ErrPacket::new(ER_UNKNOWN_ERROR, SQLSTATE_GENERAL, message);
        self.io.write_packet(&packet.encode()).await?;
        self.io.flush().await
    }
}

// Copyright 2025 Apache Doris Community
// Licensed under the Apache License, Version 2.0

//! MySQL Handshake Protocol
//!
//! Implements the connection phase:
//! 1. Server sends Initial Handshake packet (v10)
//! 2. Client responds with HandshakeResponse41
//! 3. Optionally, server asks the client to switch auth plugin and the client
//!    answers with fresh auth bytes
//! 4. Server sends OK or ERR packet

use rand::Rng;
use sqlgate_common::{Config, GateError, Result};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

use crate::auth::Authenticator;
use crate::constants::*;
use crate::message::{AuthSwitchRequest, ErrPacket, Greeting, HandshakeResponse, OkPacket};
use crate::packet::PacketIo;

/// Per-connection scramble. Bytes are printable-ish ASCII below 0x7F and
/// never 0 or `$`, so the second half can be sent NUL-terminated.
#[derive(Clone, PartialEq, Eq)]
pub struct Salt([u8; SALT_LEN]);

impl Salt {
    pub fn generate() -> Self {
        let mut rng = rand::rng();
        let mut bytes = [0u8; SALT_LEN];
        for b in bytes.iter_mut() {
            let mut v: u8 = rng.random_range(0..127);
            if v == 0 || v == b'$' {
                v += 1;
            }
            *b = v;
        }
        Salt(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SALT_LEN] {
        &self.0
    }
}

impl From<[u8; SALT_LEN]> for Salt {
    fn from(bytes: [u8; SALT_LEN]) -> Self {
        Salt(bytes)
    }
}

impl std::fmt::Debug for Salt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Salt(..)")
    }
}

/// Decides whether a client that announced `client_plugin` should be asked
/// to re-authenticate with another plugin.
pub trait AuthSwitchPolicy: Send + Sync {
    fn switch_target(&self, client_plugin: Option<&str>) -> Option<String>;
}

/// Switches clients using one of `triggers` over to `target`.
#[derive(Debug, Clone)]
pub struct PluginSwitchPolicy {
    target: String,
    triggers: Vec<String>,
}

impl PluginSwitchPolicy {
    pub fn new<I, T>(target: impl Into<String>, triggers: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        Self {
            target: target.into(),
            triggers: triggers.into_iter().map(Into::into).collect(),
        }
    }

    /// A policy that never switches.
    pub fn never() -> Self {
        Self::new(MYSQL_NATIVE_PASSWORD, Vec::<String>::new())
    }
}

impl Default for PluginSwitchPolicy {
    fn default() -> Self {
        Self::new(MYSQL_NATIVE_PASSWORD, [CACHING_SHA2_PASSWORD, SHA256_PASSWORD])
    }
}

impl AuthSwitchPolicy for PluginSwitchPolicy {
    fn switch_target(&self, client_plugin: Option<&str>) -> Option<String> {
        let plugin = client_plugin?;
        if plugin != self.target && self.triggers.iter().any(|t| t == plugin) {
            Some(self.target.clone())
        } else {
            None
        }
    }
}

/// What the server announces in its greeting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerParams {
    pub server_version: String,
    pub capability_flags: u32,
    pub character_set: u8,
    pub status_flags: u16,
    pub auth_plugin: String,
}

impl Default for ServerParams {
    fn default() -> Self {
        Self {
            server_version: "5.7.25-sqlgate".to_string(),
            capability_flags: DEFAULT_CAPABILITY_FLAGS,
            character_set: DEFAULT_CHARSET,
            status_flags: SERVER_STATUS_AUTOCOMMIT,
            auth_plugin: MYSQL_NATIVE_PASSWORD.to_string(),
        }
    }
}

impl From<&Config> for ServerParams {
    fn from(config: &Config) -> Self {
        Self {
            server_version: config.server_version.clone(),
            auth_plugin: config.auth.plugin.clone(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Greeted,
    AwaitingResponse,
    AuthSwitching,
    Authenticated,
    Failed,
}

/// Result of a successful credential check, before the final OK.
#[derive(Debug, Clone)]
pub struct Negotiated {
    pub response: HandshakeResponse,
    /// Client capabilities masked by what the server offered
    pub capabilities: u32,
    /// Plugin the accepted auth bytes belong to
    pub auth_plugin: String,
}

/// Server side of one connection phase.
///
/// Call [`negotiate`](Self::negotiate), then either [`accept`](Self::accept)
/// or [`reject`](Self::reject). Any I/O or protocol failure moves the
/// handshake to [`HandshakeState::Failed`].
pub struct Handshake<'a> {
    params: &'a ServerParams,
    connection_id: u32,
    salt: &'a Salt,
    authenticator: &'a dyn Authenticator,
    switch_policy: &'a dyn AuthSwitchPolicy,
    state: HandshakeState,
}

impl<'a> Handshake<'a> {
    pub fn new(
        params: &'a ServerParams,
        connection_id: u32,
        salt: &'a Salt,
        authenticator: &'a dyn Authenticator,
        switch_policy: &'a dyn AuthSwitchPolicy,
    ) -> Self {
        Self {
            params,
            connection_id,
            salt,
            authenticator,
            switch_policy,
            state: HandshakeState::Greeted,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Greet the client, read its response, switch plugins if the policy
    /// asks for it and verify the credentials. Rejected credentials are
    /// answered with an access-denied ERR before returning.
    pub async fn negotiate<S>(&mut self, io: &mut PacketIo<S>) -> Result<Negotiated>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let result = self.negotiate_inner(io).await;
        if result.is_err() {
            self.state = HandshakeState::Failed;
        }
        result
    }

    async fn negotiate_inner<S>(&mut self, io: &mut PacketIo<S>) -> Result<Negotiated>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.send_greeting(io).await?;
        self.state = HandshakeState::AwaitingResponse;

        let packet = io.read_packet().await?;
        let mut response = HandshakeResponse::decode(&packet)?;
        debug!(
            "Handshake response - username: {}, db: {:?}, plugin: {:?}",
            response.username, response.database, response.auth_plugin_name
        );

        let mut auth_plugin = response
            .auth_plugin_name
            .clone()
            .unwrap_or_else(|| self.params.auth_plugin.clone());

        let switch_to = self
            .switch_policy
            .switch_target(response.auth_plugin_name.as_deref());
        if let Some(target) = switch_to {
            self.state = HandshakeState::AuthSwitching;
            debug!("Switching auth plugin from {} to {}", auth_plugin, target);

            let request = AuthSwitchRequest {
                plugin_name: &target,
                salt: self.salt.as_bytes(),
            };
            io.write_packet(&request.encode()).await?;
            io.flush().await?;

            response.auth_response = io.read_packet().await?.to_vec();
            auth_plugin = target;
        }

        let accepted = match self
            .authenticator
            .verify(&response.username, &response.auth_response, &auth_plugin, self.salt.as_bytes())
            .await
        {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Authenticator failed for user '{}': {}", response.username, e);
                false
            }
        };

        if !accepted {
            self.send_error(io, &ErrPacket::access_denied(&response.username)).await;
            return Err(GateError::Authentication(format!(
                "access denied for user '{}'",
                response.username
            )));
        }

        let capabilities = response.capability_flags & self.params.capability_flags;
        Ok(Negotiated {
            response,
            capabilities,
            auth_plugin,
        })
    }

    async fn send_greeting<S>(&mut self, io: &mut PacketIo<S>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let greeting = Greeting {
            server_version: &self.params.server_version,
            connection_id: self.connection_id,
            salt: self.salt.as_bytes(),
            capability_flags: self.params.capability_flags,
            character_set: self.params.character_set,
            status_flags: self.params.status_flags,
            auth_plugin_name: &self.params.auth_plugin,
        };

        io.reset_sequence();
        io.write_packet(&greeting.encode()).await?;
        io.flush().await
    }

    /// Send the final OK and reset the sequence for the command phase.
    pub async fn accept<S>(&mut self, io: &mut PacketIo<S>, status_flags: u16) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.state = HandshakeState::Authenticated;
        let sent = async {
            io.write_packet(&OkPacket::new(status_flags).encode()).await?;
            io.flush().await
        }
        .await;
        io.reset_sequence();

        if sent.is_err() {
            self.state = HandshakeState::Failed;
        }
        sent
    }

    /// Fail the handshake after verification, e.g. when no session could be
    /// opened for the user. Delivery of the ERR is best effort.
    pub async fn reject<S>(&mut self, io: &mut PacketIo<S>, err: &ErrPacket)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.send_error(io, err).await;
    }

    async fn send_error<S>(&mut self, io: &mut PacketIo<S>, err: &ErrPacket)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.state = HandshakeState::Failed;
        if let Err(e) = io.write_packet(&err.encode()).await {
            debug!("Failed to write handshake error: {}", e);
            return;
        }
        if let Err(e) = io.flush().await {
            debug!("Failed to flush handshake error: {}", e);
        }
    }
}

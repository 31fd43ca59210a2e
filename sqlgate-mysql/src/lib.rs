// Copyright 2025 Apache Doris Community
// Licensed under the Apache License, Version 2.0

//! MySQL Wire Protocol Server
//!
//! Server side of the MySQL client/server protocol:
//! - Packet framing with sequence validation
//! - Handshake with optional auth plugin switch
//! - Command loop that hands SQL to a pluggable [`StatementExecutor`]

pub mod constants;
pub mod codec;
pub mod message;
pub mod packet;
pub mod auth;
pub mod handshake;
pub mod driver;
pub mod registry;
pub mod session;
pub mod server;

pub use auth::{Authenticator, NativePasswordAuthenticator, TrustAuthenticator};
pub use driver::{Reply, SessionFactory, SessionParams, StatementExecutor};
pub use handshake::{AuthSwitchPolicy, HandshakeState, PluginSwitchPolicy, ServerParams};
pub use message::{Command, CommandKind};
pub use packet::PacketIo;
pub use registry::{ConnectionInfo, ConnectionRegistry};
pub use server::MysqlServer;
pub use session::{Connection, ConnectionState, Services};

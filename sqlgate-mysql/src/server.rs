// Copyright 2025 Apache Doris Community
// Licensed under the Apache License, Version 2.0

//! TCP acceptor: one task per client connection.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use sqlgate_common::{GateError, Result, TransportError};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::driver::StatementExecutor;
use crate::registry::ConnectionRegistry;
use crate::session::{Connection, Services};

pub struct MysqlServer<D> {
    bind_addr: String,
    services: Arc<Services<D>>,
    registry: ConnectionRegistry,
    connection_id_counter: AtomicU32,
}

impl<D: StatementExecutor> MysqlServer<D> {
    pub fn new(bind_addr: impl Into<String>, services: Services<D>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            services: Arc::new(services),
            registry: ConnectionRegistry::new(),
            connection_id_counter: AtomicU32::new(1),
        }
    }

    /// Live connections, for monitoring.
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Bind the configured address and serve until `cancel` fires.
    pub async fn start(&self, cancel: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(&self.bind_addr).await?;
        self.serve(listener, cancel).await
    }

    /// Accept connections from `listener` until `cancel` fires, then wait for
    /// open connections to wind down.
    pub async fn serve(&self, listener: TcpListener, cancel: CancellationToken) -> Result<()> {
        info!("MySQL server listening on {}", listener.local_addr()?);
        let tracker = TaskTracker::new();

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let connection_id = self.next_connection_id();
                        info!("Accepted connection from {}, ID: {}", peer, connection_id);
                        self.spawn_connection(
                            &tracker,
                            stream,
                            peer.to_string(),
                            connection_id,
                            cancel.child_token(),
                        );
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                    }
                },
                _ = cancel.cancelled() => {
                    info!("MySQL server shutting down");
                    break;
                }
            }
        }

        tracker.close();
        tracker.wait().await;
        Ok(())
    }

    /// Next id, never 0. After u32::MAX accepts the sequence wraps to 1.
    fn next_connection_id(&self) -> u32 {
        loop {
            let id = self.connection_id_counter.fetch_add(1, Ordering::SeqCst);
            if id != 0 {
                return id;
            }
        }
    }

    fn spawn_connection(
        &self,
        tracker: &TaskTracker,
        stream: TcpStream,
        peer: String,
        connection_id: u32,
        cancel: CancellationToken,
    ) {
        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY for {}: {}", peer, e);
        }

        let services = Arc::clone(&self.services);
        let registry = self.registry.clone();
        tracker.spawn(async move {
            let conn = Connection::new(stream, connection_id, peer, services);
            if let Err(e) = conn.run(&registry, &cancel).await {
                log_connection_error(connection_id, &e);
            }
        });
    }
}

fn log_connection_error(connection_id: u32, err: &GateError) {
    match err {
        GateError::Transport(TransportError::Timeout(_)) => {
            info!("Connection {} timed out: {}", connection_id, err)
        }
        GateError::Authentication(_) => warn!("Connection {} rejected: {}", connection_id, err),
        _ => error!("Connection {} error: {}", connection_id, err),
    }
}

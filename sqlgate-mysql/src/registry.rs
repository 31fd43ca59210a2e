// Copyright 2025 Apache Doris Community
// Licensed under the Apache License, Version 2.0

//! Live connection registry
//!
//! Owned by the acceptor and shared with every connection task. A connection
//! registers once its handshake succeeds and is removed when its
//! [`Registration`] guard drops, whichever way the task ends.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: u32,
    pub peer: String,
    pub user: String,
    pub database: Option<String>,
    pub connected_at: SystemTime,
}

#[derive(Debug, Clone, Default)]
pub struct ConnectionRegistry {
    connections: Arc<Mutex<HashMap<u32, ConnectionInfo>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `info`, replacing any entry with the same id.
    pub fn register(&self, info: ConnectionInfo) -> Registration {
        let id = info.id;
        self.connections.lock().insert(id, info);
        Registration {
            registry: self.clone(),
            id,
        }
    }

    pub fn update_database(&self, id: u32, database: Option<String>) {
        if let Some(info) = self.connections.lock().get_mut(&id) {
            info.database = database;
        }
    }

    pub fn get(&self, id: u32) -> Option<ConnectionInfo> {
        self.connections.lock().get(&id).cloned()
    }

    /// Copy of every live connection, ordered by id.
    pub fn snapshot(&self) -> Vec<ConnectionInfo> {
        let mut infos: Vec<_> = self.connections.lock().values().cloned().collect();
        infos.sort_by_key(|info| info.id);
        infos
    }

    pub fn len(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.lock().is_empty()
    }

    fn remove(&self, id: u32) {
        self.connections.lock().remove(&id);
    }
}

/// Removes its connection from the registry on drop.
#[derive(Debug)]
pub struct Registration {
    registry: ConnectionRegistry,
    id: u32,
}

impl Registration {
    pub fn id(&self) -> u32 {
        self.id
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.remove(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(id: u32, user: &str) -> ConnectionInfo {
        ConnectionInfo {
            id,
            peer: format!("127.0.0.1:{}", 50000 + id),
            user: user.to_string(),
            database: None,
            connected_at: SystemTime::now(),
        }
    }

    #[test]
    fn test_register_and_drop() {
        let registry = ConnectionRegistry::new();
        assert!(registry.is_empty());

        let first = registry.register(info(1, "root"));
        let second = registry.register(info(2, "app"));
        assert_eq!(registry.len(), 2);
        assert_eq!(second.id(), 2);

        drop(first);
        assert_eq!(registry.len(), 1);
        assert!(registry.get(1).is_none());
        assert_eq!(registry.get(2).map(|i| i.user), Some("app".to_string()));

        drop(second);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_snapshot_is_ordered_copy() {
        let registry = ConnectionRegistry::new();
        let _c = registry.register(info(3, "c"));
        let _a = registry.register(info(1, "a"));
        let _b = registry.register(info(2, "b"));

        let snapshot = registry.snapshot();
        let ids: Vec<u32> = snapshot.iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);

        registry.update_database(2, Some("sales".to_string()));
        assert_eq!(snapshot[1].database, None);
        assert_eq!(registry.get(2).and_then(|i| i.database), Some("sales".to_string()));
    }

    #[tokio::test]
    async fn test_concurrent_registration() {
        let registry = ConnectionRegistry::new();
        let mut handles = Vec::new();
        for id in 1..=32u32 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                let guard = registry.register(info(id, "user"));
                tokio::task::yield_now().await;
                assert!(registry.get(id).is_some());
                drop(guard);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(registry.is_empty());
    }
}

//! Owner of a group of connections.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use crate::buffer_pool::BufferPool;

use super::connection::Connection;

/// Registry and statistics for the connections it created.
#[derive(Debug)]
pub struct IoProcessor {
    name: String,
    pool: Arc<BufferPool>,
    next_id: AtomicU64,
    connections: Mutex<HashMap<u64, Weak<Connection>>>,
    net_in_bytes: AtomicU64,
    net_out_bytes: AtomicU64,
    closed_connections: AtomicU64,
}

impl IoProcessor {
    /// Create a processor allocating buffers from `pool`.
    pub fn new(name: impl Into<String>, pool: Arc<BufferPool>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            pool,
            next_id: AtomicU64::new(1),
            connections: Mutex::new(HashMap::new()),
            net_in_bytes: AtomicU64::new(0),
            net_out_bytes: AtomicU64::new(0),
            closed_connections: AtomicU64::new(0),
        })
    }

    /// Processor name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Buffer pool shared by this processor's connections.
    pub fn buffer_pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    pub(crate) fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn register(&self, conn: &Arc<Connection>) {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(conn.id(), Arc::downgrade(conn));
    }

    /// Deregister a closed connection.
    pub(crate) fn remove_connection(&self, id: u64) {
        let removed = self
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        if removed.is_some() {
            self.closed_connections.fetch_add(1, Ordering::Relaxed);
        } else {
            tracing::warn!(processor = %self.name, conn_id = id, "connection was not registered");
        }
    }

    /// Look up a live connection by id.
    pub fn connection(&self, id: u64) -> Option<Arc<Connection>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .and_then(Weak::upgrade)
    }

    /// Number of registered connections.
    pub fn connection_count(&self) -> usize {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Number of connections deregistered so far.
    pub fn closed_connections(&self) -> u64 {
        self.closed_connections.load(Ordering::Relaxed)
    }

    pub(crate) fn add_net_in_bytes(&self, n: u64) {
        self.net_in_bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_net_out_bytes(&self, n: u64) {
        self.net_out_bytes.fetch_add(n, Ordering::Relaxed);
    }

    /// Bytes read by all connections.
    pub fn net_in_bytes(&self) -> u64 {
        self.net_in_bytes.load(Ordering::Relaxed)
    }

    /// Bytes written by all connections.
    pub fn net_out_bytes(&self) -> u64 {
        self.net_out_bytes.load(Ordering::Relaxed)
    }
}

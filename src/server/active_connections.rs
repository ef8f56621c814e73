//! Connection Groups
//!
//! A listener keeps its live connections grouped by the filter chain that
//! admitted them, so draining one chain touches only its own connections.
//! Each group stores its wrappers in a [`Slab`]; a [`ConnectionHandle`]
//! names a wrapper by chain, slot and connection id.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use slab::Slab;
use tracing::{debug, trace};

use crate::event::DeferredDeletable;
use crate::network::connection::ConnectionHandle;
use crate::network::filter_chain::{FilterChain, FilterChainKey};
use crate::server::active_tcp_connection::ActiveTcpConnection;

static NEXT_GROUP_ID: AtomicU64 = AtomicU64::new(1);

/// The live connections of one listener that share a filter chain.
#[derive(Debug)]
pub struct ActiveConnections {
    id: u64,
    listener_tag: u64,
    filter_chain: Arc<FilterChain>,
    connections: Slab<ActiveTcpConnection>,
}

impl ActiveConnections {
    pub fn new(listener_tag: u64, filter_chain: Arc<FilterChain>) -> Self {
        Self {
            id: NEXT_GROUP_ID.fetch_add(1, Ordering::Relaxed),
            listener_tag,
            filter_chain,
            connections: Slab::new(),
        }
    }

    /// Process-unique id of this group instance.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn listener_tag(&self) -> u64 {
        self.listener_tag
    }

    pub fn filter_chain(&self) -> &Arc<FilterChain> {
        &self.filter_chain
    }

    pub fn key(&self) -> FilterChainKey {
        FilterChainKey::of(&self.filter_chain)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Slot the next [`insert`](Self::insert) will use.
    pub fn vacant_slot(&self) -> usize {
        self.connections.vacant_key()
    }

    /// Links a wrapper built for [`vacant_slot`](Self::vacant_slot).
    pub fn insert(&mut self, connection: ActiveTcpConnection) -> usize {
        let expected = connection.handle().slot;
        let slot = self.connections.insert(connection);
        debug_assert_eq!(slot, expected, "connection built for a different slot");
        slot
    }

    pub fn get(&self, handle: ConnectionHandle) -> Option<&ActiveTcpConnection> {
        self.connections
            .get(handle.slot)
            .filter(|connection| connection.id() == handle.id)
    }

    pub fn get_mut(&mut self, handle: ConnectionHandle) -> Option<&mut ActiveTcpConnection> {
        self.connections
            .get_mut(handle.slot)
            .filter(|connection| connection.id() == handle.id)
    }

    /// Unlinks the wrapper named by `handle`.
    ///
    /// Returns `None` if the slot is empty or now holds a different
    /// connection.
    pub fn remove(&mut self, handle: ConnectionHandle) -> Option<ActiveTcpConnection> {
        self.get(handle)?;
        self.connections.try_remove(handle.slot)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ActiveTcpConnection> {
        self.connections.iter().map(|(_, connection)| connection)
    }

    /// Closes every connection in the group. Wrappers stay linked.
    pub fn close_all(&mut self) {
        if !self.connections.is_empty() {
            debug!(
                listener_tag = self.listener_tag,
                filter_chain = self.filter_chain.name(),
                connections = self.connections.len(),
                "Closing connection group"
            );
        }
        for (_, connection) in self.connections.iter_mut() {
            connection.close();
        }
    }
}

impl DeferredDeletable for ActiveConnections {
    fn delete_is_pending(&mut self) {
        trace!(
            group = self.id,
            filter_chain = self.filter_chain.name(),
            connections = self.connections.len(),
            "Connection group pending deletion"
        );
    }
}

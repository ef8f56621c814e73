//! Listener Configuration
//!
//! A [`ListenerConfig`] is the immutable description of one listener as seen
//! by every worker: its address, connection ceiling, filter chains, balancer
//! and statistics. Workers hold it behind an `Arc` and may swap it for an
//! updated one at any time without touching connections already admitted.
//!
//! ## In-place Updates
//!
//! ```text
//!   ListenerConfig v1 ──to_builder()──> ListenerConfigBuilder ──build()──> v2
//!        │                                                                  │
//!        └──── shares tag, ConnectionLimit, ListenerStats, balancer ────────┘
//! ```
//!
//! The limiter is shared across versions so connections counted under v1 are
//! released against the same counter under v2.

pub mod options;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::network::balancer::{ConnectionBalancer, NopConnectionBalancer};
use crate::network::filter_chain::{FilterChainManager, StaticFilterChainManager};
use crate::stats::ListenerStats;

pub use options::{BalanceMode, Invocation, ServerOptions};

/// Default per-connection read buffer limit (1 MiB)
pub const DEFAULT_PER_CONNECTION_BUFFER_LIMIT: usize = 1024 * 1024;

static NEXT_LISTENER_TAG: AtomicU64 = AtomicU64::new(1);

/// Open-connection limiter shared by every worker copy of a listener.
///
/// `can_create` is a snapshot: two workers may both see room for the last
/// slot. The ceiling is a soft bound in the same way the kernel backlog is.
#[derive(Debug)]
pub struct ConnectionLimit {
    max: AtomicU64,
    current: AtomicU64,
}

impl ConnectionLimit {
    /// Creates a limiter. `None` means unlimited.
    pub fn new(max: Option<u64>) -> Self {
        Self {
            max: AtomicU64::new(max.unwrap_or(u64::MAX)),
            current: AtomicU64::new(0),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(None)
    }

    pub fn can_create(&self) -> bool {
        self.current.load(Ordering::Acquire) < self.max.load(Ordering::Acquire)
    }

    pub fn inc(&self) {
        self.current.fetch_add(1, Ordering::AcqRel);
    }

    pub fn dec(&self) {
        let previous = self.current.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "connection limit underflow");
    }

    pub fn count(&self) -> u64 {
        self.current.load(Ordering::Acquire)
    }

    pub fn max(&self) -> Option<u64> {
        match self.max.load(Ordering::Acquire) {
            u64::MAX => None,
            max => Some(max),
        }
    }

    /// Replaces the ceiling. Connections over a lowered ceiling are kept.
    pub fn set_max(&self, max: Option<u64>) {
        self.max.store(max.unwrap_or(u64::MAX), Ordering::Release);
    }
}

impl Default for ConnectionLimit {
    fn default() -> Self {
        Self::unlimited()
    }
}

/// Everything a worker needs to know about one listener.
#[derive(Debug)]
pub struct ListenerConfig {
    name: String,
    tag: u64,
    address: SocketAddr,
    max_connections: Option<u64>,
    open_connections: Arc<ConnectionLimit>,
    filter_chain_manager: Arc<dyn FilterChainManager>,
    connection_balancer: Arc<dyn ConnectionBalancer>,
    hand_off_restored_destination_connections: bool,
    per_connection_buffer_limit_bytes: usize,
    stats: Arc<ListenerStats>,
}

impl ListenerConfig {
    pub fn builder(name: impl Into<String>, address: SocketAddr) -> ListenerConfigBuilder {
        ListenerConfigBuilder::new(name, address)
    }

    /// Starts an in-place update of this listener.
    pub fn to_builder(&self) -> ListenerConfigBuilder {
        ListenerConfigBuilder {
            name: self.name.clone(),
            tag: Some(self.tag),
            address: self.address,
            max_connections: self.max_connections,
            open_connections: Some(Arc::clone(&self.open_connections)),
            filter_chain_manager: Some(Arc::clone(&self.filter_chain_manager)),
            connection_balancer: Some(Arc::clone(&self.connection_balancer)),
            hand_off_restored_destination_connections: self
                .hand_off_restored_destination_connections,
            per_connection_buffer_limit_bytes: self.per_connection_buffer_limit_bytes,
            stats: Some(Arc::clone(&self.stats)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tag(&self) -> u64 {
        self.tag
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn max_connections(&self) -> Option<u64> {
        self.max_connections
    }

    pub fn open_connections(&self) -> &Arc<ConnectionLimit> {
        &self.open_connections
    }

    pub fn filter_chain_manager(&self) -> &dyn FilterChainManager {
        self.filter_chain_manager.as_ref()
    }

    pub fn connection_balancer(&self) -> &Arc<dyn ConnectionBalancer> {
        &self.connection_balancer
    }

    pub fn hand_off_restored_destination_connections(&self) -> bool {
        self.hand_off_restored_destination_connections
    }

    pub fn per_connection_buffer_limit_bytes(&self) -> usize {
        self.per_connection_buffer_limit_bytes
    }

    pub fn stats(&self) -> &Arc<ListenerStats> {
        &self.stats
    }
}

/// Builder for [`ListenerConfig`].
#[derive(Debug)]
pub struct ListenerConfigBuilder {
    name: String,
    tag: Option<u64>,
    address: SocketAddr,
    max_connections: Option<u64>,
    open_connections: Option<Arc<ConnectionLimit>>,
    filter_chain_manager: Option<Arc<dyn FilterChainManager>>,
    connection_balancer: Option<Arc<dyn ConnectionBalancer>>,
    hand_off_restored_destination_connections: bool,
    per_connection_buffer_limit_bytes: usize,
    stats: Option<Arc<ListenerStats>>,
}

impl ListenerConfigBuilder {
    pub fn new(name: impl Into<String>, address: SocketAddr) -> Self {
        Self {
            name: name.into(),
            tag: None,
            address,
            max_connections: None,
            open_connections: None,
            filter_chain_manager: None,
            connection_balancer: None,
            hand_off_restored_destination_connections: false,
            per_connection_buffer_limit_bytes: DEFAULT_PER_CONNECTION_BUFFER_LIMIT,
            stats: None,
        }
    }

    /// Sets the tag. Listeners get a fresh process-unique tag otherwise.
    pub fn tag(mut self, tag: u64) -> Self {
        self.tag = Some(tag);
        self
    }

    pub fn max_connections(mut self, max: Option<u64>) -> Self {
        self.max_connections = max;
        self
    }

    /// Uses an existing limiter instead of creating one.
    pub fn open_connections(mut self, limit: Arc<ConnectionLimit>) -> Self {
        self.open_connections = Some(limit);
        self
    }

    pub fn filter_chain_manager(mut self, manager: Arc<dyn FilterChainManager>) -> Self {
        self.filter_chain_manager = Some(manager);
        self
    }

    pub fn connection_balancer(mut self, balancer: Arc<dyn ConnectionBalancer>) -> Self {
        self.connection_balancer = Some(balancer);
        self
    }

    pub fn hand_off_restored_destination_connections(mut self, enabled: bool) -> Self {
        self.hand_off_restored_destination_connections = enabled;
        self
    }

    pub fn per_connection_buffer_limit_bytes(mut self, limit: usize) -> Self {
        self.per_connection_buffer_limit_bytes = limit;
        self
    }

    pub fn build(self) -> ListenerConfig {
        let open_connections = self
            .open_connections
            .unwrap_or_else(|| Arc::new(ConnectionLimit::new(self.max_connections)));

        ListenerConfig {
            name: self.name,
            tag: self
                .tag
                .unwrap_or_else(|| NEXT_LISTENER_TAG.fetch_add(1, Ordering::Relaxed)),
            address: self.address,
            max_connections: self.max_connections,
            open_connections,
            filter_chain_manager: self
                .filter_chain_manager
                .unwrap_or_else(|| Arc::new(StaticFilterChainManager::default())),
            connection_balancer: self
                .connection_balancer
                .unwrap_or_else(|| Arc::new(NopConnectionBalancer)),
            hand_off_restored_destination_connections: self
                .hand_off_restored_destination_connections,
            per_connection_buffer_limit_bytes: self.per_connection_buffer_limit_bytes,
            stats: self.stats.unwrap_or_default(),
        }
    }
}

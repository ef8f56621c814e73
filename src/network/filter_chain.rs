//! Filter Chains
//!
//! A filter chain names the processing pipeline picked for a connection.
//! Listeners only care about its identity: connections are grouped by the
//! chain object they were matched to, compared by address, never by value.
//! Two chains with identical contents are still two groups.

use std::fmt;
use std::sync::Arc;

use crate::network::socket::ConnectionSocket;

/// The processing pipeline selected for a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterChain {
    name: String,
    destination_ports: Vec<u16>,
    network_filters: Vec<String>,
}

impl FilterChain {
    pub fn new(name: impl Into<String>, network_filters: Vec<String>) -> Self {
        Self {
            name: name.into(),
            destination_ports: Vec::new(),
            network_filters,
        }
    }

    /// Restricts the chain to sockets whose local port is in `ports`.
    pub fn with_destination_ports(mut self, ports: Vec<u16>) -> Self {
        self.destination_ports = ports;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn network_filters(&self) -> &[String] {
        &self.network_filters
    }

    fn matches(&self, socket: &ConnectionSocket) -> bool {
        self.destination_ports.is_empty()
            || self
                .destination_ports
                .contains(&socket.local_address().port())
    }
}

/// Identity of a filter chain object.
///
/// Valid as a map key for as long as someone holds the `Arc` it was taken
/// from; connection groups keep theirs for exactly that reason.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FilterChainKey(usize);

impl FilterChainKey {
    pub fn of(chain: &Arc<FilterChain>) -> Self {
        Self(Arc::as_ptr(chain) as usize)
    }

    #[cfg(test)]
    pub(crate) fn from_raw(raw: usize) -> Self {
        Self(raw)
    }
}

impl fmt::Debug for FilterChainKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FilterChainKey({:#x})", self.0)
    }
}

/// Resolves the filter chain for an accepted socket.
pub trait FilterChainManager: fmt::Debug + Send + Sync {
    /// Returns the chain for this socket, or `None` when nothing matches.
    fn find_filter_chain(&self, socket: &ConnectionSocket) -> Option<Arc<FilterChain>>;

    /// Whether this exact chain object is part of the configuration.
    fn contains(&self, chain: &Arc<FilterChain>) -> bool;
}

/// First chain whose destination ports match, otherwise the default chain.
#[derive(Debug, Default)]
pub struct StaticFilterChainManager {
    chains: Vec<Arc<FilterChain>>,
    default_chain: Option<Arc<FilterChain>>,
}

impl StaticFilterChainManager {
    pub fn new(chains: Vec<Arc<FilterChain>>, default_chain: Option<Arc<FilterChain>>) -> Self {
        Self {
            chains,
            default_chain,
        }
    }

    pub fn chains(&self) -> &[Arc<FilterChain>] {
        &self.chains
    }

    pub fn default_chain(&self) -> Option<&Arc<FilterChain>> {
        self.default_chain.as_ref()
    }
}

impl FilterChainManager for StaticFilterChainManager {
    fn find_filter_chain(&self, socket: &ConnectionSocket) -> Option<Arc<FilterChain>> {
        self.chains
            .iter()
            .find(|chain| chain.matches(socket))
            .or(self.default_chain.as_ref())
            .cloned()
    }

    fn contains(&self, chain: &Arc<FilterChain>) -> bool {
        self.chains
            .iter()
            .chain(self.default_chain.iter())
            .any(|candidate| Arc::ptr_eq(candidate, chain))
    }
}

//! Network Primitives
//!
//! The pieces the listener core consumes from, and exposes to, the rest of
//! the proxy:
//!
//! - [`socket`]: move-only accepted sockets
//! - [`connection`]: server connections, their events and callbacks
//! - [`filter_chain`]: filter-chain identity and resolution
//! - [`balancer`]: the cross-worker balancing surface
//! - [`listener`]: the accept loop for one listening socket

pub mod balancer;
pub mod connection;
pub mod filter_chain;
pub mod listener;
pub mod socket;

pub use balancer::{
    BalancedConnectionHandler, ConnectionBalancer, ExactConnectionBalancer, HandlerId,
    NopConnectionBalancer,
};
pub use connection::{
    ConnectionCallbacks, ConnectionEvent, ConnectionEventNotifier, ConnectionHandle,
    ConnectionState, EventAction, ServerConnection,
};
pub use filter_chain::{FilterChain, FilterChainKey, FilterChainManager, StaticFilterChainManager};
pub use listener::ListenerDriver;
pub use socket::ConnectionSocket;

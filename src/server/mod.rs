//! Worker-side Listener Core
//!
//! - [`active_tcp_listener`]: admission, balancing and connection tracking
//!   for one listener on one worker
//! - [`active_connections`]: connections grouped by filter chain
//! - [`active_tcp_connection`]: the per-connection wrapper
//! - [`connection_handler`]: every listener of one worker
//! - [`worker`]: the worker thread and its loop
//! - [`instance`]: process-level startup and shutdown

pub mod active_connections;
pub mod active_tcp_connection;
pub mod active_tcp_listener;
pub mod connection_handler;
pub mod instance;
pub mod worker;

pub use active_connections::ActiveConnections;
pub use active_tcp_connection::{ActiveTcpConnection, ConnectionAccounting};
pub use active_tcp_listener::{ActiveTcpListener, ListenerState, RejectCause, TcpListenerHandle};
pub use connection_handler::ConnectionHandler;
pub use instance::{Server, DEFAULT_NETWORK_FILTER};
pub use worker::{Worker, WorkerHandle};

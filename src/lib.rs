//! # FlashGate - Worker-side Connection Core for a Multi-threaded TCP Proxy
//!
//! FlashGate is the part of a proxy that sits between `accept()` and the
//! network filters. For every listener on every worker it decides whether an
//! accepted socket is admitted, which worker keeps it, which filter chain
//! serves it, and it tracks the resulting connection until it is destroyed.
//!
//! ## Features
//!
//! - **Admission control**: per-listener and process-wide connection limits
//! - **Exact balancing**: sockets go to the least-loaded worker
//! - **Filter-chain groups**: connections are grouped by the chain that
//!   admitted them so a chain can be drained on its own
//! - **Deferred deletion**: connections are destroyed after the callback
//!   that closed them has returned
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                                FlashGate                                 │
//! │                                                                          │
//! │   listening socket (shared)                                              │
//! │          │                                                               │
//! │   ┌──────┴───────────────────────┐      ┌──────────────────────────────┐ │
//! │   │ Worker 0                     │      │ Worker 1                     │ │
//! │   │  ListenerDriver ─> task queue│<─post┤  ListenerDriver ─> task queue│ │
//! │   │        ConnectionHandler     ├─post>│        ConnectionHandler     │ │
//! │   │        ActiveTcpListener     │      │        ActiveTcpListener     │ │
//! │   │   ┌──────────┐ ┌──────────┐  │      │   ┌──────────┐               │ │
//! │   │   │ chain A  │ │ chain B  │  │      │   │ chain A  │               │ │
//! │   │   │ conns... │ │ conns... │  │      │   │ conns... │               │ │
//! │   │   └──────────┘ └──────────┘  │      │   └──────────┘               │ │
//! │   └──────────────────────────────┘      └──────────────────────────────┘ │
//! │                 │                                      │                 │
//! │                 └──────── ExactConnectionBalancer ─────┘                 │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use flashgate::config::ServerOptions;
//! use flashgate::server::Server;
//!
//! let server = Server::start(&ServerOptions::default())?;
//! println!("listening on {}", server.local_addr());
//! // ...
//! server.shutdown();
//! ```
//!
//! ## Module Overview
//!
//! - [`server`]: listeners, connection groups, workers
//! - [`network`]: sockets, connections, filter chains, balancers
//! - [`event`]: the worker task queue and deferred deletion
//! - [`config`]: listener configuration and command-line options
//! - [`stats`]: listener and worker counters
//! - [`stream_info`]: per-connection metadata and access logs

pub mod config;
pub mod error;
pub mod event;
pub mod network;
pub mod server;
pub mod stats;
pub mod stream_info;

// Re-export commonly used types for convenience
pub use config::{ListenerConfig, ServerOptions};
pub use error::{ConfigError, ListenerError};
pub use server::{ActiveTcpListener, ConnectionHandler, Server, Worker, WorkerHandle};
pub use stats::{ListenerStats, ListenerStatsSnapshot};

/// The default port FlashGate listens on
pub const DEFAULT_PORT: u16 = 10000;

/// The default host FlashGate binds to
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Version of FlashGate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

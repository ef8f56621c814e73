//! Server Instance
//!
//! Binds the public listening socket, starts the workers and installs one
//! copy of the listener on each of them. All workers accept on the same
//! socket; the configured balancer decides which worker keeps a connection.

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::info;

use crate::config::{BalanceMode, ConnectionLimit, ListenerConfig, ServerOptions};
use crate::error::ListenerError;
use crate::network::balancer::{ConnectionBalancer, ExactConnectionBalancer, NopConnectionBalancer};
use crate::network::filter_chain::{FilterChain, StaticFilterChainManager};
use crate::server::worker::{Worker, WorkerHandle};
use crate::stats::ListenerStatsSnapshot;

/// Network filter installed on the default filter chain.
pub const DEFAULT_NETWORK_FILTER: &str = "sink";

/// A running proxy: the listening socket and its workers.
#[derive(Debug)]
pub struct Server {
    local_addr: SocketAddr,
    config: Arc<ListenerConfig>,
    workers: Vec<WorkerHandle>,
    global_limit: Option<Arc<ConnectionLimit>>,
    // Kept open so listeners can be reinstalled on the same socket.
    _socket: std::net::TcpListener,
}

impl Server {
    pub fn start(options: &ServerOptions) -> Result<Self, ListenerError> {
        let socket = std::net::TcpListener::bind(options.bind_address())?;
        let local_addr = socket.local_addr()?;

        let balancer: Arc<dyn ConnectionBalancer> = match options.balance {
            BalanceMode::Exact => Arc::new(ExactConnectionBalancer::new()),
            BalanceMode::None => Arc::new(NopConnectionBalancer),
        };
        let default_chain = Arc::new(FilterChain::new(
            "default",
            vec![DEFAULT_NETWORK_FILTER.to_string()],
        ));
        let config = Arc::new(
            ListenerConfig::builder("public", local_addr)
                .max_connections(options.max_connections)
                .connection_balancer(balancer)
                .filter_chain_manager(Arc::new(StaticFilterChainManager::new(
                    Vec::new(),
                    Some(default_chain),
                )))
                .build(),
        );

        let global_limit = options
            .global_max_connections
            .map(|max| Arc::new(ConnectionLimit::new(Some(max))));

        let workers = (0..options.workers)
            .map(|index| Worker::spawn(format!("worker_{}", index), global_limit.clone()))
            .collect::<Result<Vec<_>, _>>()?;
        for worker in &workers {
            worker.add_listener(Arc::clone(&config), Some(&socket))?;
        }

        info!(
            address = %local_addr,
            workers = workers.len(),
            balance = ?options.balance,
            max_connections = ?options.max_connections,
            global_max_connections = ?options.global_max_connections,
            "Server started"
        );

        Ok(Self {
            local_addr,
            config,
            workers,
            global_limit,
            _socket: socket,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn config(&self) -> &Arc<ListenerConfig> {
        &self.config
    }

    pub fn workers(&self) -> &[WorkerHandle] {
        &self.workers
    }

    /// Connections open across all workers.
    pub fn num_connections(&self) -> u64 {
        self.workers.iter().map(WorkerHandle::num_connections).sum()
    }

    pub fn global_connections(&self) -> Option<u64> {
        self.global_limit.as_ref().map(|limit| limit.count())
    }

    pub fn stats(&self) -> ListenerStatsSnapshot {
        self.config.stats().snapshot()
    }

    /// Stops accepting on every worker. Open connections stay up.
    pub fn stop_listeners(&self) -> Result<(), ListenerError> {
        self.workers.iter().try_for_each(WorkerHandle::stop_listeners)
    }

    /// Stops every worker, closing all connections.
    pub fn shutdown(self) {
        let stats = self.stats();
        for worker in self.workers {
            worker.stop();
        }
        info!(
            total = stats.downstream_cx_total,
            overflow = stats.downstream_cx_overflow,
            global_overflow = stats.downstream_global_cx_overflow,
            no_filter_chain_match = stats.no_filter_chain_match,
            "Server stopped"
        );
    }
}

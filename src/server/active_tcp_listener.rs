//! Active TCP Listener
//!
//! One [`ActiveTcpListener`] exists per listener per worker. It decides what
//! happens to every socket the worker accepts for that listener:
//!
//! ```text
//!   accept ──> on_accept ──limit?──> reject (listener_overflow, close)
//!                  │
//!                  v
//!            on_accept_worker ──balancer──> sibling.post(socket) ──> sibling worker
//!                  │                                                      │
//!                  │<──────────────── on_accept_worker(rebalanced) <──────┘
//!                  v
//!        restored destination? ──> hand off to the listener owning that address
//!                  │
//!                  v
//!            new_connection ──no chain / no filters──> close
//!                  │
//!                  v
//!      ActiveConnections[filter chain] <── ActiveTcpConnection
//! ```
//!
//! Connections are removed in two phases: the wrapper is unlinked from its
//! group inside the event callback and parked on the dispatcher's
//! deferred-delete list; the worker loop destroys it once the callback has
//! returned.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{debug, info, trace, warn};

use crate::config::{ConnectionLimit, ListenerConfig};
use crate::event::{Dispatcher, DispatcherHandle, WorkerTask};
use crate::network::balancer::{BalancedConnectionHandler, HandlerId};
use crate::network::connection::{
    next_connection_id, ConnectionCallbacks, ConnectionEvent, ConnectionEventNotifier,
    ConnectionHandle, EventAction, ServerConnection,
};
use crate::network::filter_chain::{FilterChain, FilterChainKey};
use crate::network::listener::ListenerDriver;
use crate::network::socket::ConnectionSocket;
use crate::server::active_connections::ActiveConnections;
use crate::server::active_tcp_connection::{ActiveTcpConnection, ConnectionAccounting};
use crate::stats::HandlerCounters;
use crate::stream_info::{details, ResponseFlag, StreamInfo};

/// Why an accepted socket was turned away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectCause {
    /// The worker-wide limit shared by every listener was reached
    GlobalConnectionLimit,
    /// This listener's own limit was reached
    ListenerConnectionLimit,
}

/// Accepting state of a listener.
///
/// `Active` and `Paused` alternate freely; `ShutDown` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Active,
    Paused,
    ShutDown,
}

/// The part of a listener other workers can see.
///
/// Registered with the listener's connection balancer. Its connection count
/// is what the balancer compares, and `post` is how a sibling worker hands
/// a socket over.
pub struct TcpListenerHandle {
    tag: u64,
    handler_id: HandlerId,
    num_connections: AtomicU64,
    open_connections: Arc<ConnectionLimit>,
    dispatcher: DispatcherHandle,
}

impl TcpListenerHandle {
    pub fn new(
        tag: u64,
        handler_id: HandlerId,
        open_connections: Arc<ConnectionLimit>,
        dispatcher: DispatcherHandle,
    ) -> Self {
        Self {
            tag,
            handler_id,
            num_connections: AtomicU64::new(0),
            open_connections,
            dispatcher,
        }
    }

    pub fn tag(&self) -> u64 {
        self.tag
    }

    pub fn open_connections(&self) -> &Arc<ConnectionLimit> {
        &self.open_connections
    }
}

impl BalancedConnectionHandler for TcpListenerHandle {
    fn handler_id(&self) -> HandlerId {
        self.handler_id
    }

    fn num_connections(&self) -> u64 {
        self.num_connections.load(Ordering::Acquire)
    }

    fn inc_num_connections(&self) {
        self.num_connections.fetch_add(1, Ordering::AcqRel);
        self.open_connections.inc();
    }

    fn dec_num_connections(&self) {
        let previous = self.num_connections.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "listener connection count underflow");
        self.open_connections.dec();
    }

    fn is_overloaded(&self) -> bool {
        !self.open_connections.can_create()
    }

    fn post(&self, socket: ConnectionSocket) {
        let task = WorkerTask::Rebalanced {
            listener_tag: self.tag,
            handler_id: self.handler_id,
            socket,
            open_connections: Arc::clone(&self.open_connections),
        };
        if let Err(task) = self.dispatcher.post_task(task) {
            debug!(
                listener_tag = self.tag,
                worker = self.dispatcher.name(),
                "Target worker stopped, dropping rebalanced socket"
            );
            self.dec_num_connections();
            if let WorkerTask::Rebalanced { socket, .. } = task {
                socket.close();
            }
        }
    }
}

impl fmt::Debug for TcpListenerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpListenerHandle")
            .field("tag", &self.tag)
            .field("handler_id", &self.handler_id)
            .field("num_connections", &self.num_connections())
            .field("worker", &self.dispatcher.name())
            .finish()
    }
}

/// A listener's presence on one worker.
#[derive(Debug)]
pub struct ActiveTcpListener {
    config: Arc<ListenerConfig>,
    dispatcher: Dispatcher,
    handle: Arc<TcpListenerHandle>,
    counters: Arc<HandlerCounters>,
    listener: Option<ListenerDriver>,
    state: ListenerState,
    connections_by_context: HashMap<FilterChainKey, ActiveConnections>,
    is_deleting: bool,
}

impl ActiveTcpListener {
    /// Creates the listener and registers it with the config's balancer.
    ///
    /// With a socket, the accept loop starts immediately; this requires a
    /// tokio runtime. Without one the listener only admits what is handed
    /// to it.
    pub fn new(
        config: Arc<ListenerConfig>,
        dispatcher: Dispatcher,
        counters: Arc<HandlerCounters>,
        socket: Option<TcpListener>,
    ) -> Self {
        config.open_connections().set_max(config.max_connections());

        let handle = Arc::new(TcpListenerHandle::new(
            config.tag(),
            HandlerId::next(),
            Arc::clone(config.open_connections()),
            dispatcher.handle(),
        ));
        config
            .connection_balancer()
            .register_handler(Arc::clone(&handle) as Arc<dyn BalancedConnectionHandler>);

        let listener =
            socket.map(|socket| ListenerDriver::start(socket, config.tag(), dispatcher.handle()));

        info!(
            listener = config.name(),
            tag = config.tag(),
            worker = dispatcher.name(),
            address = %config.address(),
            "Listener added"
        );

        Self {
            config,
            dispatcher,
            handle,
            counters,
            listener,
            state: ListenerState::Active,
            connections_by_context: HashMap::new(),
            is_deleting: false,
        }
    }

    pub fn tag(&self) -> u64 {
        self.config.tag()
    }

    pub fn config(&self) -> &Arc<ListenerConfig> {
        &self.config
    }

    pub fn state(&self) -> ListenerState {
        self.state
    }

    pub fn handle(&self) -> &Arc<TcpListenerHandle> {
        &self.handle
    }

    /// Connections counted against this listener on this worker.
    pub fn num_connections(&self) -> u64 {
        self.handle.num_connections()
    }

    /// Address the accept loop is bound to, if it owns a socket.
    pub fn listen_address(&self) -> Option<std::net::SocketAddr> {
        self.listener.as_ref().map(ListenerDriver::address)
    }

    pub fn connection_group(&self, chain: &Arc<FilterChain>) -> Option<&ActiveConnections> {
        self.connections_by_context.get(&FilterChainKey::of(chain))
    }

    pub fn num_connection_groups(&self) -> usize {
        self.connections_by_context.len()
    }

    /// Wrappers currently linked in any group.
    pub fn num_linked_connections(&self) -> usize {
        self.connections_by_context
            .values()
            .map(ActiveConnections::len)
            .sum()
    }

    pub fn listener_connection_limit_reached(&self) -> bool {
        !self.handle.open_connections.can_create()
    }

    /// Entry point for a socket accepted by this worker.
    pub fn on_accept(&mut self, socket: ConnectionSocket) {
        if self.state == ListenerState::ShutDown {
            debug!(
                listener = self.config.name(),
                remote = %socket.remote_address(),
                "Listener shut down, closing accepted socket"
            );
            socket.close();
            return;
        }

        if self.listener_connection_limit_reached() {
            debug!(
                listener = self.config.name(),
                remote = %socket.remote_address(),
                limit = ?self.handle.open_connections.max(),
                "Closing connection: listener connection limit reached"
            );
            self.on_reject(RejectCause::ListenerConnectionLimit);
            socket.close();
            return;
        }

        let hand_off_restored = self.config.hand_off_restored_destination_connections();
        self.on_accept_worker(socket, hand_off_restored, false);
    }

    /// Records a rejected socket. The caller closes it.
    pub fn on_reject(&self, cause: RejectCause) {
        match cause {
            RejectCause::GlobalConnectionLimit => self.config.stats().global_overflow(),
            RejectCause::ListenerConnectionLimit => self.config.stats().listener_overflow(),
        }
    }

    /// Balances, redirects or admits a socket.
    ///
    /// `rebalanced` is true when a sibling worker already picked this
    /// listener; the socket is then admitted here without another pick.
    pub fn on_accept_worker(
        &mut self,
        socket: ConnectionSocket,
        hand_off_restored_destination_connections: bool,
        rebalanced: bool,
    ) {
        if !rebalanced {
            let current: Arc<dyn BalancedConnectionHandler> = self.handle.clone();
            let target = self
                .config
                .connection_balancer()
                .pick_target_handler(&current);
            if target.handler_id() != self.handle.handler_id() {
                trace!(
                    listener = self.config.name(),
                    from = ?self.handle.handler_id(),
                    to = ?target.handler_id(),
                    "Rebalancing socket to sibling worker"
                );
                target.post(socket);
                return;
            }
        }

        if hand_off_restored_destination_connections && socket.local_address_restored() {
            // The listener owning the original destination counts it itself.
            self.handle.dec_num_connections();
            let task = WorkerTask::HandOffRestored {
                listener_tag: self.tag(),
                socket,
            };
            if let Err(WorkerTask::HandOffRestored { socket, .. }) =
                self.dispatcher.handle().post_task(task)
            {
                socket.close();
            }
            return;
        }

        let stream_info = StreamInfo::new(socket.local_address(), socket.remote_address());
        self.new_connection(socket, stream_info);
    }

    /// Turns an admitted socket into a tracked connection.
    ///
    /// The socket has already been counted against this listener.
    pub fn new_connection(&mut self, socket: ConnectionSocket, mut stream_info: StreamInfo) {
        let Some(filter_chain) = self.config.filter_chain_manager().find_filter_chain(&socket)
        else {
            debug!(
                listener = self.config.name(),
                local = %socket.local_address(),
                remote = %socket.remote_address(),
                "Closing connection: no matching filter chain found"
            );
            self.config.stats().no_filter_chain_match();
            stream_info.set_response_flag(ResponseFlag::NoRouteFound);
            stream_info.set_response_code_details(details::FILTER_CHAIN_NOT_FOUND);
            stream_info.emit_log(self.config.name());
            self.discard(socket);
            return;
        };

        stream_info.set_filter_chain_name(filter_chain.name());
        if filter_chain.network_filters().is_empty() {
            debug!(
                listener = self.config.name(),
                filter_chain = filter_chain.name(),
                remote = %socket.remote_address(),
                "Closing connection: no filters"
            );
            stream_info.set_response_code_details(details::NO_NETWORK_FILTERS);
            stream_info.emit_log(self.config.name());
            self.discard(socket);
            return;
        }

        let listener_tag = self.tag();
        let listener_name: Arc<str> = Arc::from(self.config.name());
        let stats = Arc::clone(self.config.stats());
        let buffer_limit = self.config.per_connection_buffer_limit_bytes();
        let notify_to = self.dispatcher.handle();
        let accounting =
            ConnectionAccounting::new(Arc::clone(&self.handle), Arc::clone(&self.counters));

        let group = self.get_or_create_active_connections(&filter_chain);
        let handle = ConnectionHandle {
            filter_chain: group.key(),
            slot: group.vacant_slot(),
            id: next_connection_id(),
        };
        let remote = socket.remote_address();
        let notifier = ConnectionEventNotifier::new(notify_to, listener_tag, handle);
        let connection = ServerConnection::new(handle.id, socket, notifier, buffer_limit);

        group.insert(ActiveTcpConnection::new(
            handle,
            connection,
            stream_info,
            Arc::clone(&listener_name),
            stats,
            accounting,
        ));

        debug!(
            listener = %listener_name,
            connection_id = handle.id,
            remote = %remote,
            filter_chain = filter_chain.name(),
            "New connection"
        );
    }

    /// Returns the group for `filter_chain`, creating it on first use.
    pub fn get_or_create_active_connections(
        &mut self,
        filter_chain: &Arc<FilterChain>,
    ) -> &mut ActiveConnections {
        let listener_tag = self.tag();
        self.connections_by_context
            .entry(FilterChainKey::of(filter_chain))
            .or_insert_with(|| {
                debug!(
                    listener_tag,
                    filter_chain = filter_chain.name(),
                    "Created connection group"
                );
                ActiveConnections::new(listener_tag, Arc::clone(filter_chain))
            })
    }

    /// Delivers a connection event to the wrapper it belongs to.
    pub fn on_connection_event(&mut self, handle: ConnectionHandle, event: ConnectionEvent) {
        let action = match self
            .connections_by_context
            .get_mut(&handle.filter_chain)
            .and_then(|group| group.get_mut(handle))
        {
            Some(connection) => connection.on_event(event),
            None => {
                trace!(connection_id = handle.id, ?event, "Event for a removed connection");
                return;
            }
        };

        if action == EventAction::Remove {
            self.remove_connection(handle);
        }
    }

    /// Unlinks a connection and schedules its destruction.
    ///
    /// A group left empty is scheduled too, unless its filter chain is still
    /// part of the current config or the listener is already tearing groups
    /// down itself.
    pub fn remove_connection(&mut self, handle: ConnectionHandle) {
        let Some(group) = self.connections_by_context.get_mut(&handle.filter_chain) else {
            trace!(connection_id = handle.id, "No group for removed connection");
            return;
        };
        let Some(connection) = group.remove(handle) else {
            trace!(connection_id = handle.id, "Connection already removed");
            return;
        };

        debug!(connection_id = handle.id, "Adding to cleanup list");
        self.dispatcher.deferred_delete(Box::new(connection));

        let drained = group.is_empty()
            && !self.is_deleting
            && !self
                .config
                .filter_chain_manager()
                .contains(group.filter_chain());
        if drained {
            if let Some(group) = self.connections_by_context.remove(&handle.filter_chain) {
                debug!(
                    listener = self.config.name(),
                    filter_chain = group.filter_chain().name(),
                    "Removing drained connection group"
                );
                self.dispatcher.deferred_delete(Box::new(group));
            }
        }
    }

    /// Closes and schedules destruction of the groups for `draining_chains`.
    pub fn deferred_remove_filter_chains(&mut self, draining_chains: &[Arc<FilterChain>]) {
        for chain in draining_chains {
            match self.connections_by_context.remove(&FilterChainKey::of(chain)) {
                Some(mut group) => {
                    info!(
                        listener = self.config.name(),
                        filter_chain = chain.name(),
                        connections = group.len(),
                        "Draining filter chain"
                    );
                    group.close_all();
                    self.dispatcher.deferred_delete(Box::new(group));
                }
                None => trace!(filter_chain = chain.name(), "No connections to drain"),
            }
        }
    }

    /// Adopts an updated config. Connections already admitted are untouched.
    pub fn update_listener_config(&mut self, config: Arc<ListenerConfig>) {
        if !Arc::ptr_eq(config.open_connections(), &self.handle.open_connections) {
            warn!(
                listener = config.name(),
                "Updated config carries a new connection limiter, keeping the current one"
            );
        }
        self.handle.open_connections.set_max(config.max_connections());

        if !Arc::ptr_eq(config.connection_balancer(), self.config.connection_balancer()) {
            self.config
                .connection_balancer()
                .unregister_handler(self.handle.handler_id());
            config
                .connection_balancer()
                .register_handler(Arc::clone(&self.handle) as Arc<dyn BalancedConnectionHandler>);
        }

        info!(
            listener = config.name(),
            tag = config.tag(),
            max_connections = ?config.max_connections(),
            "Listener config updated"
        );
        self.config = config;
    }

    pub fn pause_listening(&mut self) {
        if self.state != ListenerState::Active {
            return;
        }
        if let Some(listener) = &self.listener {
            listener.disable();
        }
        self.state = ListenerState::Paused;
        info!(listener = self.config.name(), "Listener paused");
    }

    pub fn resume_listening(&mut self) {
        if self.state != ListenerState::Paused {
            return;
        }
        if let Some(listener) = &self.listener {
            listener.enable();
        }
        self.state = ListenerState::Active;
        info!(listener = self.config.name(), "Listener resumed");
    }

    /// Stops accepting for good. Live connections are kept.
    pub fn shutdown_listener(&mut self) {
        if self.state == ListenerState::ShutDown {
            return;
        }
        self.listener = None;
        self.state = ListenerState::ShutDown;
        info!(listener = self.config.name(), "Listener shut down");
    }

    fn discard(&self, socket: ConnectionSocket) {
        socket.close();
        self.handle.dec_num_connections();
    }
}

impl Drop for ActiveTcpListener {
    fn drop(&mut self) {
        self.is_deleting = true;
        self.config
            .connection_balancer()
            .unregister_handler(self.handle.handler_id());
        self.listener = None;

        for group in self.connections_by_context.values_mut() {
            group.close_all();
        }
        self.connections_by_context.clear();
        self.dispatcher.clear_deferred_delete_list();

        info!(
            listener = self.config.name(),
            worker = self.dispatcher.name(),
            "Listener removed"
        );
    }
}

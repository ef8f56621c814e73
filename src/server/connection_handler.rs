//! Connection Handler
//!
//! The per-worker owner of every [`ActiveTcpListener`]. It receives the
//! worker's tasks and routes each one to the listener it names, applying the
//! worker-wide connection limit before a listener sees an accepted socket.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{debug, info, trace};

use crate::config::{ConnectionLimit, ListenerConfig};
use crate::event::{Dispatcher, WorkerTask};
use crate::network::balancer::BalancedConnectionHandler;
use crate::network::filter_chain::FilterChain;
use crate::network::socket::ConnectionSocket;
use crate::server::active_tcp_listener::{ActiveTcpListener, ListenerState, RejectCause};
use crate::stats::HandlerCounters;

/// All listeners of one worker.
#[derive(Debug)]
pub struct ConnectionHandler {
    dispatcher: Dispatcher,
    counters: Arc<HandlerCounters>,
    listeners: HashMap<u64, ActiveTcpListener>,
    disable_listeners: bool,
}

impl ConnectionHandler {
    pub fn new(dispatcher: Dispatcher, global_limit: Option<Arc<ConnectionLimit>>) -> Self {
        Self::with_counters(dispatcher, Arc::new(HandlerCounters::new(global_limit)))
    }

    /// Uses counters the caller can also read from other threads.
    pub fn with_counters(dispatcher: Dispatcher, counters: Arc<HandlerCounters>) -> Self {
        Self {
            dispatcher,
            counters,
            listeners: HashMap::new(),
            disable_listeners: false,
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn counters(&self) -> &Arc<HandlerCounters> {
        &self.counters
    }

    /// Connections open across every listener of this worker.
    pub fn num_connections(&self) -> u64 {
        self.counters.num_connections()
    }

    pub fn num_listeners(&self) -> usize {
        self.listeners.len()
    }

    pub fn listener(&self, tag: u64) -> Option<&ActiveTcpListener> {
        self.listeners.get(&tag)
    }

    pub fn listener_mut(&mut self, tag: u64) -> Option<&mut ActiveTcpListener> {
        self.listeners.get_mut(&tag)
    }

    /// Adds a listener, or updates it in place when its tag is already known.
    ///
    /// On update the socket is ignored; the existing accept loop keeps
    /// running.
    pub fn add_listener(&mut self, config: Arc<ListenerConfig>, socket: Option<TcpListener>) {
        if let Some(existing) = self.listeners.get_mut(&config.tag()) {
            existing.update_listener_config(config);
            return;
        }

        let tag = config.tag();
        let mut listener = ActiveTcpListener::new(
            config,
            self.dispatcher.clone(),
            Arc::clone(&self.counters),
            socket,
        );
        if self.disable_listeners {
            listener.pause_listening();
        }
        self.listeners.insert(tag, listener);
    }

    /// Removes a listener, closing its connections.
    pub fn remove_listener(&mut self, tag: u64) -> bool {
        match self.listeners.remove(&tag) {
            Some(listener) => {
                drop(listener);
                true
            }
            None => false,
        }
    }

    /// Drains the given filter chains of a listener.
    ///
    /// `completion` runs on this worker after the drained connections have
    /// been destroyed.
    pub fn remove_filter_chains<F>(
        &mut self,
        tag: u64,
        draining_chains: &[Arc<FilterChain>],
        completion: F,
    ) where
        F: FnOnce() + Send + 'static,
    {
        if let Some(listener) = self.listeners.get_mut(&tag) {
            listener.deferred_remove_filter_chains(draining_chains);
        }
        // Runs as its own task, so the deferred list has been cleared first.
        if let Err(e) = self.dispatcher.handle().post(move |_| completion()) {
            debug!(error = %e, "Could not schedule filter chain drain completion");
        }
    }

    pub fn stop_listener(&mut self, tag: u64) {
        if let Some(listener) = self.listeners.get_mut(&tag) {
            listener.shutdown_listener();
        }
    }

    pub fn stop_listeners(&mut self) {
        for listener in self.listeners.values_mut() {
            listener.shutdown_listener();
        }
    }

    pub fn disable_listeners(&mut self) {
        self.disable_listeners = true;
        for listener in self.listeners.values_mut() {
            listener.pause_listening();
        }
    }

    pub fn enable_listeners(&mut self) {
        self.disable_listeners = false;
        for listener in self.listeners.values_mut() {
            listener.resume_listening();
        }
    }

    pub fn get_balanced_handler_by_tag(
        &self,
        tag: u64,
    ) -> Option<Arc<dyn BalancedConnectionHandler>> {
        self.listeners
            .get(&tag)
            .map(|listener| Arc::clone(listener.handle()) as Arc<dyn BalancedConnectionHandler>)
    }

    pub fn get_balanced_handler_by_address(
        &self,
        address: SocketAddr,
    ) -> Option<Arc<dyn BalancedConnectionHandler>> {
        self.find_listener_by_address(address)
            .and_then(|tag| self.get_balanced_handler_by_tag(tag))
    }

    /// Finds the listener bound to `address`.
    ///
    /// An exact match wins; otherwise a listener on the wildcard address of
    /// the same family and port is used.
    fn find_listener_by_address(&self, address: SocketAddr) -> Option<u64> {
        let active = || {
            self.listeners
                .values()
                .filter(|listener| listener.state() != ListenerState::ShutDown)
        };

        active()
            .find(|listener| listener.config().address() == address)
            .or_else(|| {
                active().find(|listener| {
                    let bound = listener.config().address();
                    bound.ip().is_unspecified()
                        && bound.is_ipv4() == address.is_ipv4()
                        && bound.port() == address.port()
                })
            })
            .map(ActiveTcpListener::tag)
    }

    /// Runs one task from the worker's queue.
    pub fn handle_task(&mut self, task: WorkerTask) {
        trace!(worker = self.dispatcher.name(), task = task.kind(), "Handling task");
        match task {
            WorkerTask::Accept {
                listener_tag,
                socket,
            } => self.on_accept(listener_tag, socket),
            WorkerTask::Rebalanced {
                listener_tag,
                handler_id,
                mut socket,
                open_connections,
            } => match self.listeners.get_mut(&listener_tag) {
                Some(listener) if listener.handle().handler_id() == handler_id => {
                    if let Err(e) = socket.attach_to_current_runtime() {
                        debug!(listener_tag, error = %e, "Failed to take over rebalanced socket");
                        listener.handle().dec_num_connections();
                        socket.close();
                        return;
                    }
                    let hand_off = listener
                        .config()
                        .hand_off_restored_destination_connections();
                    listener.on_accept_worker(socket, hand_off, true);
                }
                _ => {
                    debug!(
                        listener_tag,
                        worker = self.dispatcher.name(),
                        "Rebalanced socket arrived after its listener was removed"
                    );
                    open_connections.dec();
                    socket.close();
                }
            },
            WorkerTask::HandOffRestored {
                listener_tag,
                socket,
            } => {
                let target = self
                    .find_listener_by_address(socket.local_address())
                    .unwrap_or(listener_tag);
                match self.listeners.get_mut(&target) {
                    Some(listener) => listener.on_accept_worker(socket, false, false),
                    None => socket.close(),
                }
            }
            WorkerTask::ConnectionEvent {
                listener_tag,
                connection,
                event,
            } => match self.listeners.get_mut(&listener_tag) {
                Some(listener) => listener.on_connection_event(connection, event),
                None => trace!(listener_tag, ?event, "Event for a removed listener"),
            },
            WorkerTask::Post(callback) => callback(self),
            WorkerTask::Stop => {}
        }
    }

    fn on_accept(&mut self, listener_tag: u64, socket: ConnectionSocket) {
        let Some(listener) = self.listeners.get_mut(&listener_tag) else {
            debug!(listener_tag, "Accepted socket for a removed listener");
            socket.close();
            return;
        };

        if self.counters.global_limit_reached() {
            debug!(
                listener = listener.config().name(),
                remote = %socket.remote_address(),
                "Closing connection: global connection limit reached"
            );
            listener.on_reject(RejectCause::GlobalConnectionLimit);
            socket.close();
            return;
        }

        listener.on_accept(socket);
    }

    /// Removes every listener. Used when the worker stops.
    pub fn clear_listeners(&mut self) {
        if !self.listeners.is_empty() {
            info!(
                worker = self.dispatcher.name(),
                listeners = self.listeners.len(),
                "Removing all listeners"
            );
        }
        self.listeners.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::TaskReceiver;
    use crate::network::balancer::{ExactConnectionBalancer, HandlerId};
    use crate::network::connection::ConnectionEvent;
    use crate::network::filter_chain::StaticFilterChainManager;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn addr(ip: [u8; 4], port: u16) -> SocketAddr {
        SocketAddr::from((ip, port))
    }

    fn config(name: &str, address: SocketAddr) -> Arc<ListenerConfig> {
        let chain = Arc::new(FilterChain::new("default", vec!["echo".into()]));
        Arc::new(
            ListenerConfig::builder(name, address)
                .filter_chain_manager(Arc::new(StaticFilterChainManager::new(vec![], Some(chain))))
                .build(),
        )
    }

    fn handler(global_limit: Option<u64>) -> (ConnectionHandler, TaskReceiver) {
        let (dispatcher, rx) = Dispatcher::new("worker_0");
        let limit = global_limit.map(|max| Arc::new(ConnectionLimit::new(Some(max))));
        (ConnectionHandler::new(dispatcher, limit), rx)
    }

    /// Runs queued tasks until the queue is empty, clearing deferred
    /// deletions after each one like the worker loop does.
    fn run_pending(handler: &mut ConnectionHandler, rx: &mut TaskReceiver) {
        while let Ok(task) = rx.try_recv() {
            handler.handle_task(task);
            handler.dispatcher().clear_deferred_delete_list();
        }
    }

    fn accept(tag: u64, local: SocketAddr) -> WorkerTask {
        WorkerTask::Accept {
            listener_tag: tag,
            socket: ConnectionSocket::detached(local, addr([10, 0, 0, 1], 40000)),
        }
    }

    #[test]
    fn test_accept_routes_to_listener() {
        let (mut handler, mut rx) = handler(None);
        let config = config("public", addr([127, 0, 0, 1], 10000));
        handler.add_listener(Arc::clone(&config), None);

        handler.handle_task(accept(config.tag(), config.address()));
        run_pending(&mut handler, &mut rx);

        assert_eq!(handler.num_connections(), 1);
        assert_eq!(handler.listener(config.tag()).map(|l| l.num_connections()), Some(1));
    }

    #[test]
    fn test_global_limit_rejects() {
        let (mut handler, _rx) = handler(Some(1));
        let config = config("public", addr([127, 0, 0, 1], 10000));
        handler.add_listener(Arc::clone(&config), None);

        handler.handle_task(accept(config.tag(), config.address()));
        handler.handle_task(accept(config.tag(), config.address()));

        assert_eq!(handler.num_connections(), 1);
        let stats = config.stats().snapshot();
        assert_eq!(stats.downstream_global_cx_overflow, 1);
        assert_eq!(stats.downstream_cx_overflow, 0);
    }

    #[test]
    fn test_accept_for_unknown_listener_is_closed() {
        let (mut handler, _rx) = handler(None);
        handler.handle_task(accept(999, addr([127, 0, 0, 1], 10000)));
        assert_eq!(handler.num_connections(), 0);
    }

    #[test]
    fn test_add_existing_tag_updates_in_place() {
        let (mut handler, _rx) = handler(None);
        let config = config("public", addr([127, 0, 0, 1], 10000));
        handler.add_listener(Arc::clone(&config), None);
        handler.handle_task(accept(config.tag(), config.address()));

        let updated = Arc::new(config.to_builder().max_connections(Some(5)).build());
        handler.add_listener(Arc::clone(&updated), None);

        assert_eq!(handler.num_listeners(), 1);
        let listener = handler.listener(config.tag()).unwrap();
        assert!(Arc::ptr_eq(listener.config(), &updated));
        assert_eq!(listener.num_connections(), 1);
    }

    #[test]
    fn test_connection_event_removes_connection() {
        let (mut handler, mut rx) = handler(None);
        let config = config("public", addr([127, 0, 0, 1], 10000));
        handler.add_listener(Arc::clone(&config), None);
        handler.handle_task(accept(config.tag(), config.address()));

        let chain = config
            .filter_chain_manager()
            .find_filter_chain(&ConnectionSocket::detached(
                config.address(),
                addr([10, 0, 0, 1], 1),
            ))
            .unwrap();
        let connection = handler
            .listener(config.tag())
            .and_then(|l| l.connection_group(&chain))
            .and_then(|g| g.iter().next())
            .map(|c| c.handle())
            .unwrap();

        handler.handle_task(WorkerTask::ConnectionEvent {
            listener_tag: config.tag(),
            connection,
            event: ConnectionEvent::RemoteClose,
        });
        handler.dispatcher().clear_deferred_delete_list();
        run_pending(&mut handler, &mut rx);

        assert_eq!(handler.num_connections(), 0);
    }

    #[test]
    fn test_remove_listener_releases_connections() {
        let (mut handler, _rx) = handler(Some(10));
        let config = config("public", addr([127, 0, 0, 1], 10000));
        handler.add_listener(Arc::clone(&config), None);
        handler.handle_task(accept(config.tag(), config.address()));
        handler.handle_task(accept(config.tag(), config.address()));

        assert!(handler.remove_listener(config.tag()));
        assert!(!handler.remove_listener(config.tag()));

        assert_eq!(handler.num_connections(), 0);
        assert_eq!(config.open_connections().count(), 0);
    }

    #[test]
    fn test_rebalanced_socket_for_missing_listener() {
        let (mut handler, _rx) = handler(None);
        let limit = Arc::new(ConnectionLimit::unlimited());
        limit.inc();

        handler.handle_task(WorkerTask::Rebalanced {
            listener_tag: 42,
            handler_id: HandlerId::next(),
            socket: ConnectionSocket::detached(
                addr([127, 0, 0, 1], 10000),
                addr([10, 0, 0, 1], 40000),
            ),
            open_connections: Arc::clone(&limit),
        });

        assert_eq!(limit.count(), 0);
        assert_eq!(handler.num_connections(), 0);
    }

    #[test]
    fn test_rebalanced_socket_is_admitted_without_pick() {
        let (mut handler, _rx) = handler(None);
        let balancer = Arc::new(ExactConnectionBalancer::new());
        let chain = Arc::new(FilterChain::new("default", vec!["echo".into()]));
        let config = Arc::new(
            ListenerConfig::builder("public", addr([127, 0, 0, 1], 10000))
                .connection_balancer(balancer)
                .filter_chain_manager(Arc::new(StaticFilterChainManager::new(vec![], Some(chain))))
                .build(),
        );
        handler.add_listener(Arc::clone(&config), None);
        let target = handler.get_balanced_handler_by_tag(config.tag()).unwrap();

        // What a sibling's pick would have done.
        target.inc_num_connections();
        handler.handle_task(WorkerTask::Rebalanced {
            listener_tag: config.tag(),
            handler_id: target.handler_id(),
            socket: ConnectionSocket::detached(config.address(), addr([10, 0, 0, 1], 40000)),
            open_connections: Arc::clone(config.open_connections()),
        });

        assert_eq!(target.num_connections(), 1);
        assert_eq!(handler.num_connections(), 1);
    }

    #[test]
    fn test_restored_destination_goes_to_owning_listener() {
        let (mut handler, mut rx) = handler(None);
        let catch_all = Arc::new(
            config("catch_all", addr([0, 0, 0, 0], 15001))
                .to_builder()
                .hand_off_restored_destination_connections(true)
                .build(),
        );
        let service = config("service", addr([0, 0, 0, 0], 8080));
        handler.add_listener(Arc::clone(&catch_all), None);
        handler.add_listener(Arc::clone(&service), None);

        let mut socket =
            ConnectionSocket::detached(addr([127, 0, 0, 1], 15001), addr([10, 0, 0, 1], 40000));
        socket.restore_local_address(addr([10, 1, 2, 3], 8080));
        handler.handle_task(WorkerTask::Accept {
            listener_tag: catch_all.tag(),
            socket,
        });
        run_pending(&mut handler, &mut rx);

        assert_eq!(handler.listener(catch_all.tag()).map(|l| l.num_connections()), Some(0));
        assert_eq!(handler.listener(service.tag()).map(|l| l.num_connections()), Some(1));
        assert_eq!(handler.num_connections(), 1);
    }

    #[test]
    fn test_restored_destination_without_owner_stays() {
        let (mut handler, mut rx) = handler(None);
        let catch_all = Arc::new(
            config("catch_all", addr([0, 0, 0, 0], 15001))
                .to_builder()
                .hand_off_restored_destination_connections(true)
                .build(),
        );
        handler.add_listener(Arc::clone(&catch_all), None);

        let mut socket =
            ConnectionSocket::detached(addr([127, 0, 0, 1], 15001), addr([10, 0, 0, 1], 40000));
        socket.restore_local_address(addr([10, 1, 2, 3], 9999));
        handler.handle_task(WorkerTask::Accept {
            listener_tag: catch_all.tag(),
            socket,
        });
        run_pending(&mut handler, &mut rx);

        assert_eq!(handler.listener(catch_all.tag()).map(|l| l.num_connections()), Some(1));
    }

    #[test]
    fn test_balanced_handler_lookup() {
        let (mut handler, _rx) = handler(None);
        let exact = config("exact", addr([127, 0, 0, 1], 10000));
        let wildcard = config("wildcard", addr([0, 0, 0, 0], 11000));
        handler.add_listener(Arc::clone(&exact), None);
        handler.add_listener(Arc::clone(&wildcard), None);

        let by_tag = handler.get_balanced_handler_by_tag(exact.tag()).unwrap();
        let by_addr = handler.get_balanced_handler_by_address(exact.address()).unwrap();
        assert_eq!(by_tag.handler_id(), by_addr.handler_id());

        let via_wildcard = handler
            .get_balanced_handler_by_address(addr([192, 168, 1, 1], 11000))
            .unwrap();
        assert_eq!(
            via_wildcard.handler_id(),
            handler.listener(wildcard.tag()).unwrap().handle().handler_id()
        );

        assert!(handler.get_balanced_handler_by_tag(7777).is_none());
        assert!(handler
            .get_balanced_handler_by_address(addr([127, 0, 0, 1], 1))
            .is_none());
    }

    #[test]
    fn test_disable_and_enable_listeners() {
        let (mut handler, _rx) = handler(None);
        let first = config("first", addr([127, 0, 0, 1], 10000));
        handler.add_listener(Arc::clone(&first), None);

        handler.disable_listeners();
        let second = config("second", addr([127, 0, 0, 1], 10001));
        handler.add_listener(Arc::clone(&second), None);

        let state = |h: &ConnectionHandler, tag| h.listener(tag).map(ActiveTcpListener::state);
        assert_eq!(state(&handler, first.tag()), Some(ListenerState::Paused));
        assert_eq!(state(&handler, second.tag()), Some(ListenerState::Paused));

        handler.enable_listeners();
        assert_eq!(state(&handler, first.tag()), Some(ListenerState::Active));
        assert_eq!(state(&handler, second.tag()), Some(ListenerState::Active));

        handler.stop_listeners();
        assert_eq!(state(&handler, first.tag()), Some(ListenerState::ShutDown));
        handler.handle_task(accept(first.tag(), first.address()));
        assert_eq!(handler.num_connections(), 0);
    }

    #[test]
    fn test_remove_filter_chains_runs_completion_later() {
        let (mut handler, mut rx) = handler(None);
        let config = config("public", addr([127, 0, 0, 1], 10000));
        handler.add_listener(Arc::clone(&config), None);
        handler.handle_task(accept(config.tag(), config.address()));
        handler.handle_task(accept(config.tag(), config.address()));

        let chain = config
            .filter_chain_manager()
            .find_filter_chain(&ConnectionSocket::detached(
                config.address(),
                addr([10, 0, 0, 1], 1),
            ))
            .unwrap();
        let done = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&done);
        handler.remove_filter_chains(config.tag(), &[chain], move || {
            flag.store(true, Ordering::SeqCst);
        });

        assert!(!done.load(Ordering::SeqCst));
        assert_eq!(handler.num_connections(), 2);

        handler.dispatcher().clear_deferred_delete_list();
        run_pending(&mut handler, &mut rx);

        assert!(done.load(Ordering::SeqCst));
        assert_eq!(handler.num_connections(), 0);
    }

    #[test]
    fn test_post_callback_runs_with_handler() {
        let (mut handler, mut rx) = handler(None);
        let config = config("public", addr([127, 0, 0, 1], 10000));
        let tag = config.tag();

        handler
            .dispatcher()
            .handle()
            .post(move |h| h.add_listener(config, None))
            .unwrap();
        run_pending(&mut handler, &mut rx);

        assert!(handler.listener(tag).is_some());
        assert!(handler.listener_mut(tag).is_some());
    }
}

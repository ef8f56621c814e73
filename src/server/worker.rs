//! Worker Threads
//!
//! A worker is an OS thread running a single-threaded tokio runtime. All of
//! its listeners, connections and deferred deletions live on that thread;
//! the rest of the process talks to it through a [`WorkerHandle`], which
//! only posts tasks.
//!
//! ```text
//!   WorkerHandle ──post──> [ task queue ] ──> Worker::run
//!                                              │ handle_task(task)
//!                                              │ clear_deferred_delete_list()
//!                                              └─ repeat until Stop
//! ```

use std::sync::Arc;
use std::thread;

use tokio::net::TcpListener;
use tokio::runtime;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, trace};

use crate::config::{ConnectionLimit, ListenerConfig};
use crate::error::ListenerError;
use crate::event::{Dispatcher, DispatcherHandle, TaskReceiver, WorkerTask};
use crate::network::filter_chain::FilterChain;
use crate::server::connection_handler::ConnectionHandler;
use crate::stats::HandlerCounters;

/// The worker loop and the state it owns.
pub struct Worker {
    handler: ConnectionHandler,
    tasks: TaskReceiver,
}

impl Worker {
    pub fn new(handler: ConnectionHandler, tasks: TaskReceiver) -> Self {
        Self { handler, tasks }
    }

    /// Starts a worker on its own thread.
    pub fn spawn(
        name: impl Into<String>,
        global_limit: Option<Arc<ConnectionLimit>>,
    ) -> Result<WorkerHandle, ListenerError> {
        let name = name.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let dispatcher = DispatcherHandle::new(name.clone(), tx);
        let counters = Arc::new(HandlerCounters::new(global_limit));

        let thread = {
            let dispatcher = dispatcher.clone();
            let counters = Arc::clone(&counters);
            thread::Builder::new().name(name.clone()).spawn(move || {
                let runtime = match runtime::Builder::new_current_thread().enable_all().build() {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        error!(worker = dispatcher.name(), error = %e, "Failed to build worker runtime");
                        return;
                    }
                };
                let handler =
                    ConnectionHandler::with_counters(Dispatcher::from_handle(dispatcher), counters);
                runtime.block_on(Worker::new(handler, rx).run());
            })?
        };

        Ok(WorkerHandle {
            name,
            dispatcher,
            counters,
            thread: Some(thread),
        })
    }

    /// Processes tasks until a `Stop` arrives.
    pub async fn run(mut self) {
        info!(worker = self.handler.dispatcher().name(), "Worker started");

        while let Some(task) = self.tasks.recv().await {
            if matches!(task, WorkerTask::Stop) {
                break;
            }
            self.handler.handle_task(task);
            self.handler.dispatcher().clear_deferred_delete_list();
        }

        self.handler.clear_listeners();
        self.release_pending_tasks();
        self.handler.dispatcher().clear_deferred_delete_list();
        info!(worker = self.handler.dispatcher().name(), "Worker stopped");
    }

    /// Closes the queue and drops whatever is still in it. Rebalanced
    /// sockets were counted by the sibling that picked this worker, so
    /// their slot goes back to the listener's limiter.
    fn release_pending_tasks(&mut self) {
        self.tasks.close();
        while let Ok(task) = self.tasks.try_recv() {
            match task {
                WorkerTask::Rebalanced {
                    listener_tag,
                    socket,
                    open_connections,
                    ..
                } => {
                    debug!(
                        listener_tag,
                        worker = self.handler.dispatcher().name(),
                        "Releasing rebalanced socket queued behind stop"
                    );
                    open_connections.dec();
                    socket.close();
                }
                other => trace!(kind = other.kind(), "Dropping task queued behind stop"),
            }
        }
    }
}

/// Control handle for a running worker. Dropping it stops the worker.
#[derive(Debug)]
pub struct WorkerHandle {
    name: String,
    dispatcher: DispatcherHandle,
    counters: Arc<HandlerCounters>,
    thread: Option<thread::JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dispatcher(&self) -> &DispatcherHandle {
        &self.dispatcher
    }

    /// Connections currently open on this worker.
    pub fn num_connections(&self) -> u64 {
        self.counters.num_connections()
    }

    /// Runs `callback` on the worker without waiting for it.
    pub fn post<F>(&self, callback: F) -> Result<(), ListenerError>
    where
        F: FnOnce(&mut ConnectionHandler) + Send + 'static,
    {
        self.dispatcher.post(callback)
    }

    /// Runs `callback` on the worker and returns its result.
    pub async fn call<F, R>(&self, callback: F) -> Result<R, ListenerError>
    where
        F: FnOnce(&mut ConnectionHandler) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.dispatcher.post(move |handler| {
            let _ = tx.send(callback(handler));
        })?;
        rx.await
            .map_err(|_| ListenerError::worker_stopped(self.name.as_str()))
    }

    /// Installs a listener on this worker.
    ///
    /// The socket is duplicated so several workers can accept on the same
    /// listening socket.
    pub fn add_listener(
        &self,
        config: Arc<ListenerConfig>,
        socket: Option<&std::net::TcpListener>,
    ) -> Result<(), ListenerError> {
        let socket = match socket {
            Some(socket) => {
                let socket = socket.try_clone()?;
                socket.set_nonblocking(true)?;
                Some(socket)
            }
            None => None,
        };

        self.post(move |handler| {
            let socket = match socket.map(TcpListener::from_std).transpose() {
                Ok(socket) => socket,
                Err(e) => {
                    error!(listener = config.name(), error = %e, "Failed to register listening socket");
                    return;
                }
            };
            handler.add_listener(config, socket);
        })
    }

    pub fn remove_listener(&self, tag: u64) -> Result<(), ListenerError> {
        self.post(move |handler| {
            if !handler.remove_listener(tag) {
                debug!(tag, "No listener to remove");
            }
        })
    }

    /// Drains filter chains of a listener and waits until the drained
    /// connections are gone.
    pub async fn remove_filter_chains(
        &self,
        tag: u64,
        draining_chains: Vec<Arc<FilterChain>>,
    ) -> Result<(), ListenerError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.call(move |handler| {
            if handler.listener(tag).is_none() {
                return Err(ListenerError::NotFound { tag });
            }
            handler.remove_filter_chains(tag, &draining_chains, move || {
                let _ = done_tx.send(());
            });
            Ok(())
        })
        .await??;

        done_rx
            .await
            .map_err(|_| ListenerError::worker_stopped(self.name.as_str()))
    }

    pub fn pause_listeners(&self) -> Result<(), ListenerError> {
        self.post(ConnectionHandler::disable_listeners)
    }

    pub fn resume_listeners(&self) -> Result<(), ListenerError> {
        self.post(ConnectionHandler::enable_listeners)
    }

    pub fn stop_listeners(&self) -> Result<(), ListenerError> {
        self.post(ConnectionHandler::stop_listeners)
    }

    /// Stops the worker and waits for its thread to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        if self.dispatcher.post_task(WorkerTask::Stop).is_err() {
            debug!(worker = %self.name, "Worker already stopped");
        }
        if thread.join().is_err() {
            error!(worker = %self.name, "Worker thread panicked");
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

//! Worker Dispatcher
//!
//! Each worker owns one [`Dispatcher`]. It provides the three primitives the
//! listener core relies on:
//!
//! 1. **Post**: [`DispatcherHandle::post_task`] pushes a [`WorkerTask`] onto
//!    the worker's queue from any thread.
//! 2. **Deferred deletion**: [`Dispatcher::deferred_delete`] parks an object
//!    until [`Dispatcher::clear_deferred_delete_list`] runs, which the worker
//!    loop does after every task. Whatever callback requested the deletion
//!    has returned by then.
//! 3. **Delivery**: the worker loop drains the queue and feeds each task to
//!    its `ConnectionHandler`.
//!
//! The dispatcher itself is worker-local (`Rc`), only the handle crosses
//! threads.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::trace;

use crate::config::ConnectionLimit;
use crate::error::ListenerError;
use crate::network::balancer::HandlerId;
use crate::network::connection::{ConnectionEvent, ConnectionHandle};
use crate::network::socket::ConnectionSocket;
use crate::server::ConnectionHandler;

/// A closure run on the worker with its connection handler.
pub type PostCallback = Box<dyn FnOnce(&mut ConnectionHandler) + Send>;

/// Receiving end of a worker's task queue.
pub type TaskReceiver = mpsc::UnboundedReceiver<WorkerTask>;

/// Work delivered to a worker loop.
pub enum WorkerTask {
    /// A socket accepted by this worker's accept loop
    Accept {
        listener_tag: u64,
        socket: ConnectionSocket,
    },
    /// A socket handed off by a sibling worker, already counted against
    /// the handler identified by `handler_id`
    Rebalanced {
        listener_tag: u64,
        handler_id: HandlerId,
        socket: ConnectionSocket,
        open_connections: Arc<ConnectionLimit>,
    },
    /// A socket whose original destination belongs to another listener
    HandOffRestored {
        listener_tag: u64,
        socket: ConnectionSocket,
    },
    /// An event raised by a tracked connection
    ConnectionEvent {
        listener_tag: u64,
        connection: ConnectionHandle,
        event: ConnectionEvent,
    },
    /// Arbitrary work to run on the worker
    Post(PostCallback),
    /// Ends the worker loop
    Stop,
}

impl WorkerTask {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Accept { .. } => "accept",
            Self::Rebalanced { .. } => "rebalanced",
            Self::HandOffRestored { .. } => "hand_off_restored",
            Self::ConnectionEvent { .. } => "connection_event",
            Self::Post(_) => "post",
            Self::Stop => "stop",
        }
    }
}

/// Objects that must be destroyed outside the callback that removed them.
pub trait DeferredDeletable {
    /// Called when the object is parked on the deferred-delete list.
    fn delete_is_pending(&mut self) {}
}

/// Thread-safe handle for posting work to a worker.
#[derive(Clone)]
pub struct DispatcherHandle {
    name: Arc<str>,
    tx: mpsc::UnboundedSender<WorkerTask>,
}

impl DispatcherHandle {
    pub(crate) fn new(name: impl Into<String>, tx: mpsc::UnboundedSender<WorkerTask>) -> Self {
        let name: String = name.into();
        Self {
            name: name.into(),
            tx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queues a task. Hands it back if the worker has stopped.
    pub fn post_task(&self, task: WorkerTask) -> Result<(), WorkerTask> {
        self.tx.send(task).map_err(|mpsc::error::SendError(task)| task)
    }

    /// Queues a closure to run with the worker's connection handler.
    pub fn post<F>(&self, callback: F) -> Result<(), ListenerError>
    where
        F: FnOnce(&mut ConnectionHandler) + Send + 'static,
    {
        self.post_task(WorkerTask::Post(Box::new(callback)))
            .map_err(|_| ListenerError::worker_stopped(self.name()))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl fmt::Debug for DispatcherHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatcherHandle")
            .field("name", &self.name)
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

struct DispatcherInner {
    handle: DispatcherHandle,
    deferred_delete_list: RefCell<Vec<Box<dyn DeferredDeletable>>>,
}

/// Worker-local dispatcher. Cloning shares the same deferred-delete list.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Rc<DispatcherInner>,
}

impl Dispatcher {
    /// Creates a dispatcher and the receiving end of its task queue.
    pub fn new(name: impl Into<String>) -> (Self, TaskReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::from_handle(DispatcherHandle::new(name, tx)), rx)
    }

    /// Builds the worker-local side around a queue created elsewhere.
    ///
    /// Worker threads use this: the queue is made on the spawning thread so
    /// its sender can be handed out before the worker is running.
    pub fn from_handle(handle: DispatcherHandle) -> Self {
        Self {
            inner: Rc::new(DispatcherInner {
                handle,
                deferred_delete_list: RefCell::new(Vec::new()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        self.inner.handle.name()
    }

    pub fn handle(&self) -> DispatcherHandle {
        self.inner.handle.clone()
    }

    /// Parks `object` until the next [`clear_deferred_delete_list`].
    ///
    /// [`clear_deferred_delete_list`]: Dispatcher::clear_deferred_delete_list
    pub fn deferred_delete(&self, mut object: Box<dyn DeferredDeletable>) {
        object.delete_is_pending();
        self.inner.deferred_delete_list.borrow_mut().push(object);
    }

    pub fn deferred_delete_len(&self) -> usize {
        self.inner.deferred_delete_list.borrow().len()
    }

    /// Destroys everything parked so far, in the order it was parked.
    ///
    /// Objects parked by destructors running here are destroyed in the same
    /// call. Returns how many objects were destroyed.
    pub fn clear_deferred_delete_list(&self) -> usize {
        let mut destroyed = 0;
        loop {
            let batch = std::mem::take(&mut *self.inner.deferred_delete_list.borrow_mut());
            if batch.is_empty() {
                break;
            }
            destroyed += batch.len();
            drop(batch);
        }
        if destroyed > 0 {
            trace!(worker = self.name(), destroyed, "Cleared deferred delete list");
        }
        destroyed
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("name", &self.name())
            .field("deferred", &self.deferred_delete_len())
            .finish()
    }
}

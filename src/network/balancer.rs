//! Cross-Worker Connection Balancing
//!
//! Every worker runs its own copy of each listener. When the kernel hands a
//! socket to one worker, the listener's [`ConnectionBalancer`] decides which
//! copy should own it:
//!
//! ```text
//!   worker 0 accepts ──> pick_target_handler()
//!                            │  min num_connections(), skipping overloaded
//!                            ▼
//!          ┌─────────────┬─────────────┬─────────────┐
//!          │ handler w0  │ handler w1  │ handler w2  │
//!          │   5 conns   │   3 conns   │   5 conns   │
//!          └─────────────┴──────┬──────┴─────────────┘
//!                               │ inc_num_connections()  (exactly once)
//!                               ▼
//!                        w1.post(socket) ──> w1's task queue
//! ```
//!
//! The pick increments the chosen handler's counter before returning, so the
//! destination must not count the socket again when it arrives.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::trace;

use crate::network::socket::ConnectionSocket;

static NEXT_HANDLER_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of one balanced handler instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

impl HandlerId {
    pub fn next() -> Self {
        Self(NEXT_HANDLER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// The surface a worker's listener exposes to its siblings on other workers.
///
/// Everything here may be called from any thread.
pub trait BalancedConnectionHandler: Send + Sync {
    fn handler_id(&self) -> HandlerId;

    /// Connections currently attributed to this handler.
    fn num_connections(&self) -> u64;

    fn inc_num_connections(&self);

    fn dec_num_connections(&self);

    /// Whether this handler is already past its own connection limit.
    fn is_overloaded(&self) -> bool;

    /// Moves an already counted socket onto this handler's worker.
    fn post(&self, socket: ConnectionSocket);
}

/// Picks which handler should own a freshly accepted socket.
pub trait ConnectionBalancer: fmt::Debug + Send + Sync {
    fn register_handler(&self, handler: Arc<dyn BalancedConnectionHandler>);

    fn unregister_handler(&self, id: HandlerId);

    /// Returns the chosen handler after incrementing its connection count.
    fn pick_target_handler(
        &self,
        current: &Arc<dyn BalancedConnectionHandler>,
    ) -> Arc<dyn BalancedConnectionHandler>;
}

/// Keeps every socket on the worker that accepted it.
#[derive(Debug, Default)]
pub struct NopConnectionBalancer;

impl ConnectionBalancer for NopConnectionBalancer {
    fn register_handler(&self, _handler: Arc<dyn BalancedConnectionHandler>) {}

    fn unregister_handler(&self, _id: HandlerId) {}

    fn pick_target_handler(
        &self,
        current: &Arc<dyn BalancedConnectionHandler>,
    ) -> Arc<dyn BalancedConnectionHandler> {
        current.inc_num_connections();
        Arc::clone(current)
    }
}

/// Sends each socket to the least-loaded handler that is not overloaded.
///
/// The mutex only guards the handler list; counters are atomics owned by the
/// handlers themselves. Ties go to the handler registered first.
#[derive(Default)]
pub struct ExactConnectionBalancer {
    handlers: Mutex<Vec<Arc<dyn BalancedConnectionHandler>>>,
}

impl ExactConnectionBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn num_handlers(&self) -> usize {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl fmt::Debug for ExactConnectionBalancer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExactConnectionBalancer")
            .field("handlers", &self.num_handlers())
            .finish()
    }
}

impl ConnectionBalancer for ExactConnectionBalancer {
    fn register_handler(&self, handler: Arc<dyn BalancedConnectionHandler>) {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }

    fn unregister_handler(&self, id: HandlerId) {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|handler| handler.handler_id() != id);
    }

    fn pick_target_handler(
        &self,
        current: &Arc<dyn BalancedConnectionHandler>,
    ) -> Arc<dyn BalancedConnectionHandler> {
        let handlers = self.handlers.lock().unwrap_or_else(PoisonError::into_inner);

        let target = handlers
            .iter()
            .filter(|handler| !handler.is_overloaded())
            .min_by_key(|handler| handler.num_connections())
            .cloned()
            .unwrap_or_else(|| Arc::clone(current));

        target.inc_num_connections();
        trace!(
            target = ?target.handler_id(),
            current = ?current.handler_id(),
            connections = target.num_connections(),
            "Picked target handler"
        );
        target
    }
}

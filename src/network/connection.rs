//! Server Connections and Connection Events
//!
//! A [`ServerConnection`] owns the stream of one admitted socket. It does not
//! run network filters (that pipeline lives above this crate); it watches the
//! stream on a tokio task, drains whatever arrives into a byte counter, and
//! reports the terminal events that drive lifecycle management:
//!
//! ```text
//!   peer closes / read error ──> RemoteClose ─┐
//!                                             ├──> worker queue ──> listener
//!   ServerConnection::close() ──> LocalClose ─┘     (WorkerTask)    on_connection_event
//! ```
//!
//! Events always go through the owning worker's queue, so a callback never
//! runs on the stack of the code that produced it.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::event::{DispatcherHandle, WorkerTask};
use crate::network::filter_chain::FilterChainKey;
use crate::network::socket::ConnectionSocket;

/// Upper bound for a single read when the buffer limit is larger
const MAX_READ_CHUNK: usize = 16 * 1024;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Allocates a process-unique connection id.
pub fn next_connection_id() -> u64 {
    NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)
}

/// Events raised by a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The peer closed the connection or it failed
    RemoteClose,
    /// The connection was closed from this side
    LocalClose,
    /// Outbound connect finished
    Connected,
}

impl ConnectionEvent {
    pub fn is_close(self) -> bool {
        matches!(self, Self::RemoteClose | Self::LocalClose)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    Closed,
}

/// What the owner should do after a callback returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventAction {
    /// Nothing to do
    Continue,
    /// Detach the connection and schedule its destruction
    Remove,
}

/// Callbacks a connection delivers to whoever tracks it.
pub trait ConnectionCallbacks {
    fn on_event(&mut self, event: ConnectionEvent) -> EventAction;
    fn on_above_write_buffer_high_watermark(&mut self);
    fn on_below_write_buffer_low_watermark(&mut self);
}

/// Locates a tracked connection inside a listener.
///
/// `slot` is an index into the group's slab and may be reused after the
/// connection is removed; `id` is never reused, so a stale handle can always
/// be told apart from the current occupant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionHandle {
    pub filter_chain: FilterChainKey,
    pub slot: usize,
    pub id: u64,
}

/// Posts a connection's events to its worker.
#[derive(Debug, Clone)]
pub struct ConnectionEventNotifier {
    dispatcher: DispatcherHandle,
    listener_tag: u64,
    connection: ConnectionHandle,
}

impl ConnectionEventNotifier {
    pub fn new(dispatcher: DispatcherHandle, listener_tag: u64, connection: ConnectionHandle) -> Self {
        Self {
            dispatcher,
            listener_tag,
            connection,
        }
    }

    pub fn notify(&self, event: ConnectionEvent) {
        let task = WorkerTask::ConnectionEvent {
            listener_tag: self.listener_tag,
            connection: self.connection,
            event,
        };
        if self.dispatcher.post_task(task).is_err() {
            trace!(
                connection_id = self.connection.id,
                ?event,
                "Worker stopped, dropping connection event"
            );
        }
    }
}

/// A downstream connection created from an admitted socket.
#[derive(Debug)]
pub struct ServerConnection {
    id: u64,
    local_address: SocketAddr,
    remote_address: SocketAddr,
    state: ConnectionState,
    stream: Option<Arc<TcpStream>>,
    watcher: Option<JoinHandle<()>>,
    bytes_received: Arc<AtomicU64>,
    notifier: ConnectionEventNotifier,
}

impl ServerConnection {
    /// Takes over the socket's stream and starts watching it.
    ///
    /// Must be called from within a tokio runtime when the socket carries a
    /// stream. Detached sockets produce a connection with no I/O.
    pub fn new(
        id: u64,
        mut socket: ConnectionSocket,
        notifier: ConnectionEventNotifier,
        buffer_limit: usize,
    ) -> Self {
        let bytes_received = Arc::new(AtomicU64::new(0));
        let stream = socket.take_stream().map(Arc::new);
        let watcher = stream.as_ref().map(|stream| {
            tokio::spawn(watch_stream(
                Arc::clone(stream),
                notifier.clone(),
                Arc::clone(&bytes_received),
                buffer_limit,
            ))
        });

        Self {
            id,
            local_address: socket.local_address(),
            remote_address: socket.remote_address(),
            state: ConnectionState::Open,
            stream,
            watcher,
            bytes_received,
            notifier,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn local_address(&self) -> SocketAddr {
        self.local_address
    }

    pub fn remote_address(&self) -> SocketAddr {
        self.remote_address
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn set_no_delay(&self, enabled: bool) {
        if let Some(stream) = &self.stream {
            if let Err(e) = stream.set_nodelay(enabled) {
                warn!(connection_id = self.id, error = %e, "Failed to set TCP_NODELAY");
            }
        }
    }

    /// Closes the connection and reports `LocalClose` to the worker.
    pub fn close(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.release();
        debug!(connection_id = self.id, "Closing connection");
        self.notifier.notify(ConnectionEvent::LocalClose);
    }

    /// Records that the peer went away. No event is raised.
    pub fn on_remote_close(&mut self) {
        if self.state == ConnectionState::Open {
            self.release();
        }
    }

    fn release(&mut self) {
        self.state = ConnectionState::Closed;
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
        self.stream = None;
    }
}

impl Drop for ServerConnection {
    fn drop(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
    }
}

/// Reads until the peer closes or the stream fails, then reports it.
async fn watch_stream(
    stream: Arc<TcpStream>,
    notifier: ConnectionEventNotifier,
    bytes_received: Arc<AtomicU64>,
    buffer_limit: usize,
) {
    let chunk = buffer_limit.clamp(1, MAX_READ_CHUNK);
    let mut buffer = BytesMut::with_capacity(chunk);

    loop {
        if let Err(e) = stream.readable().await {
            debug!(error = %e, "Stream no longer readable");
            break;
        }

        buffer.clear();
        buffer.reserve(chunk);
        match stream.try_read_buf(&mut buffer) {
            Ok(0) => break,
            Ok(n) => {
                bytes_received.fetch_add(n as u64, Ordering::Relaxed);
                trace!(bytes = n, "Read data");
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(e) => {
                debug!(error = %e, "Read error");
                break;
            }
        }
    }

    notifier.notify(ConnectionEvent::RemoteClose);
}

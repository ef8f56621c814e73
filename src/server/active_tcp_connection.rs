//! Active TCP Connection
//!
//! The wrapper a listener keeps for every admitted connection. It owns the
//! [`ServerConnection`], its [`StreamInfo`] and a lifetime [`Timespan`], and
//! releases all of the accounting taken for the connection when it is
//! finally dropped.
//!
//! A wrapper never removes itself. Its [`ConnectionCallbacks::on_event`]
//! answers [`EventAction::Remove`] on a terminal event and the listener does
//! the detaching, parking the wrapper on the dispatcher's deferred-delete
//! list. Dropping happens later, from the worker loop.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::event::DeferredDeletable;
use crate::network::balancer::BalancedConnectionHandler;
use crate::network::connection::{
    ConnectionCallbacks, ConnectionEvent, ConnectionHandle, ConnectionState, EventAction,
    ServerConnection,
};
use crate::server::active_tcp_listener::TcpListenerHandle;
use crate::stats::{HandlerCounters, ListenerStats, Timespan};
use crate::stream_info::StreamInfo;

/// Counts held on behalf of one live connection.
///
/// The listener count was taken by the balancer pick; the handler count is
/// taken here. Both are released on drop.
#[derive(Debug)]
pub struct ConnectionAccounting {
    listener: Arc<TcpListenerHandle>,
    handler: Arc<HandlerCounters>,
}

impl ConnectionAccounting {
    pub fn new(listener: Arc<TcpListenerHandle>, handler: Arc<HandlerCounters>) -> Self {
        handler.inc_num_connections();
        Self { listener, handler }
    }
}

impl Drop for ConnectionAccounting {
    fn drop(&mut self) {
        self.listener.dec_num_connections();
        self.handler.dec_num_connections();
    }
}

/// A live connection tracked by a listener.
#[derive(Debug)]
pub struct ActiveTcpConnection {
    handle: ConnectionHandle,
    listener_name: Arc<str>,
    stream_info: StreamInfo,
    connection: ServerConnection,
    conn_length: Timespan,
    stats: Arc<ListenerStats>,
    _accounting: ConnectionAccounting,
}

impl ActiveTcpConnection {
    pub fn new(
        handle: ConnectionHandle,
        connection: ServerConnection,
        mut stream_info: StreamInfo,
        listener_name: Arc<str>,
        stats: Arc<ListenerStats>,
        accounting: ConnectionAccounting,
    ) -> Self {
        connection.set_no_delay(true);
        stream_info.set_connection_id(connection.id());
        stats.connection_opened();

        Self {
            handle,
            listener_name,
            stream_info,
            connection,
            conn_length: Timespan::start(Arc::clone(&stats)),
            stats,
            _accounting: accounting,
        }
    }

    pub fn handle(&self) -> ConnectionHandle {
        self.handle
    }

    pub fn id(&self) -> u64 {
        self.handle.id
    }

    pub fn connection(&self) -> &ServerConnection {
        &self.connection
    }

    pub fn stream_info(&self) -> &StreamInfo {
        &self.stream_info
    }

    /// Closes the underlying connection without detaching the wrapper.
    pub fn close(&mut self) {
        self.connection.close();
    }
}

impl ConnectionCallbacks for ActiveTcpConnection {
    fn on_event(&mut self, event: ConnectionEvent) -> EventAction {
        match event {
            ConnectionEvent::RemoteClose => {
                self.connection.on_remote_close();
                EventAction::Remove
            }
            ConnectionEvent::LocalClose => EventAction::Remove,
            ConnectionEvent::Connected => EventAction::Continue,
        }
    }

    // Back-pressure belongs to the filters, not to lifecycle tracking.
    fn on_above_write_buffer_high_watermark(&mut self) {}

    fn on_below_write_buffer_low_watermark(&mut self) {}
}

impl DeferredDeletable for ActiveTcpConnection {
    fn delete_is_pending(&mut self) {
        trace!(connection_id = self.handle.id, "Connection pending deletion");
    }
}

impl Drop for ActiveTcpConnection {
    fn drop(&mut self) {
        if self.connection.state() == ConnectionState::Open {
            self.connection.close();
        }

        let length = self.conn_length.complete();
        self.stream_info
            .set_bytes_received(self.connection.bytes_received());
        self.stream_info.set_duration(length);
        self.stream_info.emit_log(&self.listener_name);
        self.stats.connection_destroyed();

        debug!(
            listener = %self.listener_name,
            connection_id = self.handle.id,
            "Connection destroyed"
        );
    }
}

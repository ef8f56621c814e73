//! Listening Socket Driver
//!
//! The driver owns a listening socket and runs an accept loop on the worker's
//! runtime. Accepted sockets are posted to the worker as
//! [`WorkerTask::Accept`] so admission runs from the worker loop like every
//! other callback.
//!
//! Pausing does not close the socket: the loop simply stops polling
//! `accept()` until it is re-enabled, leaving new connections in the kernel
//! backlog. Dropping the driver aborts the loop and closes the socket.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::event::{DispatcherHandle, WorkerTask};
use crate::network::socket::ConnectionSocket;

/// Back-off after a failed accept (e.g. out of file descriptors)
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(10);

/// Handle to a running accept loop.
#[derive(Debug)]
pub struct ListenerDriver {
    address: SocketAddr,
    enabled: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ListenerDriver {
    /// Starts accepting on `listener`. Must be called inside a tokio runtime.
    pub fn start(listener: TcpListener, listener_tag: u64, dispatcher: DispatcherHandle) -> Self {
        let address = listener
            .local_addr()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)));
        let (enabled, enabled_rx) = watch::channel(true);
        let task = tokio::spawn(accept_loop(listener, listener_tag, dispatcher, enabled_rx));

        info!(listener_tag, address = %address, "Accept loop started");

        Self {
            address,
            enabled,
            task,
        }
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn enable(&self) {
        self.enabled.send_replace(true);
    }

    pub fn disable(&self) {
        self.enabled.send_replace(false);
    }

    pub fn is_enabled(&self) -> bool {
        *self.enabled.borrow()
    }
}

impl Drop for ListenerDriver {
    fn drop(&mut self) {
        self.task.abort();
        debug!(address = %self.address, "Accept loop stopped");
    }
}

async fn accept_loop(
    listener: TcpListener,
    listener_tag: u64,
    dispatcher: DispatcherHandle,
    mut enabled: watch::Receiver<bool>,
) {
    loop {
        if !*enabled.borrow_and_update() {
            if enabled.changed().await.is_err() {
                return;
            }
            continue;
        }

        // A pending pause wins over a socket already sitting in the backlog.
        tokio::select! {
            biased;

            changed = enabled.changed() => {
                if changed.is_err() {
                    return;
                }
            }
            result = listener.accept() => match result {
                Ok((stream, remote)) => {
                    let socket = match ConnectionSocket::from_stream(stream, remote) {
                        Ok(socket) => socket,
                        Err(e) => {
                            debug!(remote = %remote, error = %e, "Dropping socket without local address");
                            continue;
                        }
                    };
                    let task = WorkerTask::Accept { listener_tag, socket };
                    if dispatcher.post_task(task).is_err() {
                        debug!(listener_tag, "Worker stopped, ending accept loop");
                        return;
                    }
                }
                Err(e) => {
                    error!(listener_tag, error = %e, "Failed to accept connection");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Dispatcher;
    use tokio::net::TcpStream;

    async fn bind() -> (TcpListener, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, addr)
    }

    #[tokio::test]
    async fn test_accepted_sockets_are_posted() {
        let (listener, addr) = bind().await;
        let (dispatcher, mut rx) = Dispatcher::new("test");
        let driver = ListenerDriver::start(listener, 5, dispatcher.handle());
        assert_eq!(driver.address(), addr);

        let _client = TcpStream::connect(addr).await.unwrap();

        let task = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match task {
            WorkerTask::Accept {
                listener_tag,
                socket,
            } => {
                assert_eq!(listener_tag, 5);
                assert_eq!(socket.local_address(), addr);
                assert!(socket.is_open());
            }
            other => panic!("unexpected task: {:?}", other.kind()),
        }
    }

    #[tokio::test]
    async fn test_disabled_driver_does_not_accept() {
        let (listener, addr) = bind().await;
        let (dispatcher, mut rx) = Dispatcher::new("test");
        let driver = ListenerDriver::start(listener, 5, dispatcher.handle());

        driver.disable();
        assert!(!driver.is_enabled());
        tokio::task::yield_now().await;

        let _client = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());

        driver.enable();
        let task = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(task.kind(), "accept");
    }

    #[tokio::test]
    async fn test_pause_wins_over_backlogged_socket() {
        let (listener, addr) = bind().await;
        let (dispatcher, mut rx) = Dispatcher::new("test");
        let driver = ListenerDriver::start(listener, 5, dispatcher.handle());
        tokio::task::yield_now().await;

        // Queue a connection and the pause together, without yielding in between.
        let _client = std::net::TcpStream::connect(addr).unwrap();
        driver.disable();
        tokio::task::yield_now().await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());

        driver.enable();
        let task = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(task.kind(), "accept");
    }
}

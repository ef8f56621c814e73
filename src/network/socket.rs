//! Accepted Sockets
//!
//! A [`ConnectionSocket`] is the move-only capability handed from the accept
//! driver to a listener, and from one worker to another during balancing.
//! Whoever holds it owns the underlying stream; sending it somewhere else
//! moves it, so the sender statically loses access.

use std::net::SocketAddr;

use tokio::net::TcpStream;
use tracing::trace;

/// An accepted, not yet admitted, downstream socket.
#[derive(Debug)]
pub struct ConnectionSocket {
    stream: Option<TcpStream>,
    local_address: SocketAddr,
    remote_address: SocketAddr,
    local_address_restored: bool,
}

impl ConnectionSocket {
    /// Wraps a freshly accepted stream.
    pub fn from_stream(stream: TcpStream, remote_address: SocketAddr) -> std::io::Result<Self> {
        let local_address = stream.local_addr()?;
        Ok(Self {
            stream: Some(stream),
            local_address,
            remote_address,
            local_address_restored: false,
        })
    }

    /// A socket with addresses but no I/O behind it.
    ///
    /// Used where the stream lives elsewhere (or nowhere, as in tests); every
    /// admission decision in this crate only looks at the addresses.
    pub fn detached(local_address: SocketAddr, remote_address: SocketAddr) -> Self {
        Self {
            stream: None,
            local_address,
            remote_address,
            local_address_restored: false,
        }
    }

    pub fn local_address(&self) -> SocketAddr {
        self.local_address
    }

    pub fn remote_address(&self) -> SocketAddr {
        self.remote_address
    }

    /// Overrides the local address with the connection's original
    /// destination (e.g. recovered from `SO_ORIGINAL_DST`).
    pub fn restore_local_address(&mut self, original: SocketAddr) {
        self.local_address = original;
        self.local_address_restored = true;
    }

    pub fn local_address_restored(&self) -> bool {
        self.local_address_restored
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    /// Re-registers the stream with the reactor of the calling runtime.
    ///
    /// A stream is tied to the runtime that accepted it; a worker receiving
    /// one from a sibling must call this before doing any I/O on it.
    pub fn attach_to_current_runtime(&mut self) -> std::io::Result<()> {
        if let Some(stream) = self.stream.take() {
            self.stream = Some(TcpStream::from_std(stream.into_std()?)?);
        }
        Ok(())
    }

    /// Releases the stream to a connection object.
    pub(crate) fn take_stream(&mut self) -> Option<TcpStream> {
        self.stream.take()
    }

    /// Closes the socket without admitting it.
    pub fn close(mut self) {
        if self.stream.take().is_some() {
            trace!(remote = %self.remote_address, "Closed socket");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detached_socket() {
        let local: SocketAddr = "10.0.0.1:443".parse().unwrap();
        let remote: SocketAddr = "192.168.1.5:50000".parse().unwrap();
        let socket = ConnectionSocket::detached(local, remote);

        assert_eq!(socket.local_address(), local);
        assert_eq!(socket.remote_address(), remote);
        assert!(!socket.local_address_restored());
        assert!(!socket.is_open());
    }

    #[test]
    fn test_restore_local_address() {
        let mut socket = ConnectionSocket::detached(
            "127.0.0.1:15001".parse().unwrap(),
            "127.0.0.1:40000".parse().unwrap(),
        );
        let original: SocketAddr = "10.1.2.3:8080".parse().unwrap();

        socket.restore_local_address(original);

        assert_eq!(socket.local_address(), original);
        assert!(socket.local_address_restored());
    }

    #[tokio::test]
    async fn test_from_stream() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _client = TcpStream::connect(addr).await.unwrap();
        let (stream, remote) = listener.accept().await.unwrap();

        let socket = ConnectionSocket::from_stream(stream, remote).unwrap();
        assert!(socket.is_open());
        assert_eq!(socket.local_address(), addr);
        assert_eq!(socket.remote_address(), remote);
        socket.close();
    }
}

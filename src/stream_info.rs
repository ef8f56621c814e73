//! Per-connection stream metadata and access logging.

use std::net::SocketAddr;
use std::time::{Duration, SystemTime};

use tracing::info;

/// Response codes details recorded when a socket never became a connection.
pub mod details {
    pub const FILTER_CHAIN_NOT_FOUND: &str = "filter_chain_not_found";
    pub const NO_NETWORK_FILTERS: &str = "no_network_filters";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseFlag {
    /// No filter chain matched the socket
    NoRouteFound,
}

impl ResponseFlag {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoRouteFound => "NR",
        }
    }
}

/// Metadata for one downstream connection.
#[derive(Debug, Clone)]
pub struct StreamInfo {
    start_time: SystemTime,
    connection_id: Option<u64>,
    downstream_local_address: SocketAddr,
    downstream_remote_address: SocketAddr,
    filter_chain_name: Option<String>,
    response_flag: Option<ResponseFlag>,
    response_code_details: Option<&'static str>,
    bytes_received: u64,
    duration: Option<Duration>,
}

impl StreamInfo {
    pub fn new(downstream_local_address: SocketAddr, downstream_remote_address: SocketAddr) -> Self {
        Self {
            start_time: SystemTime::now(),
            connection_id: None,
            downstream_local_address,
            downstream_remote_address,
            filter_chain_name: None,
            response_flag: None,
            response_code_details: None,
            bytes_received: 0,
            duration: None,
        }
    }

    pub fn start_time(&self) -> SystemTime {
        self.start_time
    }

    pub fn connection_id(&self) -> Option<u64> {
        self.connection_id
    }

    pub fn set_connection_id(&mut self, id: u64) {
        self.connection_id = Some(id);
    }

    pub fn downstream_local_address(&self) -> SocketAddr {
        self.downstream_local_address
    }

    pub fn downstream_remote_address(&self) -> SocketAddr {
        self.downstream_remote_address
    }

    pub fn filter_chain_name(&self) -> Option<&str> {
        self.filter_chain_name.as_deref()
    }

    pub fn set_filter_chain_name(&mut self, name: impl Into<String>) {
        self.filter_chain_name = Some(name.into());
    }

    pub fn response_flag(&self) -> Option<ResponseFlag> {
        self.response_flag
    }

    pub fn set_response_flag(&mut self, flag: ResponseFlag) {
        self.response_flag = Some(flag);
    }

    pub fn response_code_details(&self) -> Option<&'static str> {
        self.response_code_details
    }

    pub fn set_response_code_details(&mut self, details: &'static str) {
        self.response_code_details = Some(details);
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    pub fn set_bytes_received(&mut self, bytes: u64) {
        self.bytes_received = bytes;
    }

    pub fn duration(&self) -> Option<Duration> {
        self.duration
    }

    pub fn set_duration(&mut self, duration: Duration) {
        self.duration = Some(duration);
    }

    /// Writes the access log line for this stream.
    pub fn emit_log(&self, listener: &str) {
        info!(
            target: "flashgate::access",
            listener,
            connection_id = self.connection_id,
            downstream_local = %self.downstream_local_address,
            downstream_remote = %self.downstream_remote_address,
            filter_chain = self.filter_chain_name.as_deref().unwrap_or("-"),
            response_flag = self.response_flag.map_or("-", ResponseFlag::as_str),
            details = self.response_code_details.unwrap_or("-"),
            bytes_received = self.bytes_received,
            duration_ms = self.duration.map(|d| d.as_millis() as u64),
            "connection finished"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_info_fields() {
        let mut info = StreamInfo::new(
            "127.0.0.1:10000".parse().unwrap(),
            "127.0.0.1:55555".parse().unwrap(),
        );
        assert_eq!(info.connection_id(), None);
        assert_eq!(info.filter_chain_name(), None);

        info.set_connection_id(12);
        info.set_filter_chain_name("default");
        info.set_response_flag(ResponseFlag::NoRouteFound);
        info.set_response_code_details(details::FILTER_CHAIN_NOT_FOUND);
        info.set_bytes_received(64);
        info.set_duration(Duration::from_millis(3));

        assert_eq!(info.connection_id(), Some(12));
        assert_eq!(info.filter_chain_name(), Some("default"));
        assert_eq!(info.response_flag().map(ResponseFlag::as_str), Some("NR"));
        assert_eq!(info.response_code_details(), Some("filter_chain_not_found"));
        assert_eq!(info.bytes_received(), 64);
        assert_eq!(info.duration(), Some(Duration::from_millis(3)));

        info.emit_log("public");
    }
}

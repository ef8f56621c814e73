//! Listener and Handler Statistics
//!
//! Counters are plain atomics so any worker can bump them without a lock.
//! Emitting them to an external sink is someone else's job; this module only
//! keeps the numbers and hands out snapshots.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::ConnectionLimit;

/// Per-listener counters, shared by every worker's copy of the listener.
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Total connections that reached a filter chain
    downstream_cx_total: AtomicU64,
    /// Currently live connections
    downstream_cx_active: AtomicU64,
    /// Connections destroyed
    downstream_cx_destroy: AtomicU64,
    /// Sockets rejected by the listener connection limit
    downstream_cx_overflow: AtomicU64,
    /// Sockets rejected by the global connection limit
    downstream_global_cx_overflow: AtomicU64,
    /// Sockets closed because no filter chain matched
    no_filter_chain_match: AtomicU64,
    /// Sum of connection lifetimes in milliseconds
    downstream_cx_length_ms: AtomicU64,
}

impl ListenerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        self.downstream_cx_total.fetch_add(1, Ordering::Relaxed);
        self.downstream_cx_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_destroyed(&self) {
        self.downstream_cx_active.fetch_sub(1, Ordering::Relaxed);
        self.downstream_cx_destroy.fetch_add(1, Ordering::Relaxed);
    }

    pub fn listener_overflow(&self) {
        self.downstream_cx_overflow.fetch_add(1, Ordering::Relaxed);
    }

    pub fn global_overflow(&self) {
        self.downstream_global_cx_overflow
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn no_filter_chain_match(&self) {
        self.no_filter_chain_match.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_length(&self, length: Duration) {
        self.downstream_cx_length_ms
            .fetch_add(length.as_millis() as u64, Ordering::Relaxed);
    }

    /// Takes a point-in-time copy of every counter.
    pub fn snapshot(&self) -> ListenerStatsSnapshot {
        ListenerStatsSnapshot {
            downstream_cx_total: self.downstream_cx_total.load(Ordering::Relaxed),
            downstream_cx_active: self.downstream_cx_active.load(Ordering::Relaxed),
            downstream_cx_destroy: self.downstream_cx_destroy.load(Ordering::Relaxed),
            downstream_cx_overflow: self.downstream_cx_overflow.load(Ordering::Relaxed),
            downstream_global_cx_overflow: self
                .downstream_global_cx_overflow
                .load(Ordering::Relaxed),
            no_filter_chain_match: self.no_filter_chain_match.load(Ordering::Relaxed),
            downstream_cx_length_ms: self.downstream_cx_length_ms.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`ListenerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListenerStatsSnapshot {
    pub downstream_cx_total: u64,
    pub downstream_cx_active: u64,
    pub downstream_cx_destroy: u64,
    pub downstream_cx_overflow: u64,
    pub downstream_global_cx_overflow: u64,
    pub no_filter_chain_match: u64,
    pub downstream_cx_length_ms: u64,
}

/// Worker-wide connection accounting.
///
/// The count covers every listener on one worker. It is readable from other
/// threads so a server can report per-worker load. When a global limit is
/// configured the same limiter is shared by all workers.
#[derive(Debug, Default)]
pub struct HandlerCounters {
    num_handler_connections: AtomicU64,
    global_limit: Option<Arc<ConnectionLimit>>,
}

impl HandlerCounters {
    pub fn new(global_limit: Option<Arc<ConnectionLimit>>) -> Self {
        Self {
            num_handler_connections: AtomicU64::new(0),
            global_limit,
        }
    }

    pub fn num_connections(&self) -> u64 {
        self.num_handler_connections.load(Ordering::Acquire)
    }

    pub fn inc_num_connections(&self) {
        self.num_handler_connections.fetch_add(1, Ordering::AcqRel);
        if let Some(limit) = &self.global_limit {
            limit.inc();
        }
    }

    pub fn dec_num_connections(&self) {
        let previous = self.num_handler_connections.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "handler connection count underflow");
        if let Some(limit) = &self.global_limit {
            limit.dec();
        }
    }

    /// Returns true when the shared global limit refuses another connection.
    pub fn global_limit_reached(&self) -> bool {
        self.global_limit
            .as_ref()
            .is_some_and(|limit| !limit.can_create())
    }
}

/// Measures how long a connection lived and records it on completion.
#[derive(Debug)]
pub struct Timespan {
    start: Instant,
    sink: Arc<ListenerStats>,
    completed: bool,
}

impl Timespan {
    pub fn start(sink: Arc<ListenerStats>) -> Self {
        Self {
            start: Instant::now(),
            sink,
            completed: false,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Records the elapsed time. Only the first call has an effect.
    pub fn complete(&mut self) -> Duration {
        let elapsed = self.elapsed();
        if !self.completed {
            self.completed = true;
            self.sink.record_connection_length(elapsed);
        }
        elapsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_and_destroy_counts() {
        let stats = ListenerStats::new();

        stats.connection_opened();
        stats.connection_opened();
        stats.connection_destroyed();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.downstream_cx_total, 2);
        assert_eq!(snapshot.downstream_cx_active, 1);
        assert_eq!(snapshot.downstream_cx_destroy, 1);
    }

    #[test]
    fn test_handler_counters_share_global_limit() {
        let global = Arc::new(ConnectionLimit::new(Some(1)));
        let worker_a = HandlerCounters::new(Some(Arc::clone(&global)));
        let worker_b = HandlerCounters::new(Some(Arc::clone(&global)));

        assert!(!worker_b.global_limit_reached());
        worker_a.inc_num_connections();

        assert_eq!(worker_a.num_connections(), 1);
        assert_eq!(worker_b.num_connections(), 0);
        assert!(worker_b.global_limit_reached());

        worker_a.dec_num_connections();
        assert!(!worker_b.global_limit_reached());
    }

    #[test]
    fn test_no_global_limit_never_reached() {
        let counters = HandlerCounters::new(None);
        for _ in 0..100 {
            counters.inc_num_connections();
        }
        assert!(!counters.global_limit_reached());
    }

    #[test]
    fn test_timespan_completes_once() {
        let stats = Arc::new(ListenerStats::new());
        let mut span = Timespan::start(Arc::clone(&stats));

        std::thread::sleep(Duration::from_millis(5));
        let first = span.complete();
        assert!(first >= Duration::from_millis(5));

        let recorded = stats.snapshot().downstream_cx_length_ms;
        std::thread::sleep(Duration::from_millis(5));
        span.complete();
        assert_eq!(stats.snapshot().downstream_cx_length_ms, recorded);
    }
}

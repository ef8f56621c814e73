//! Error types for FlashGate
//!
//! Admission rejection and filter-chain resolution failure are not errors:
//! they are ordinary branches in the accept path that bump a stat and close
//! the socket. The errors here cover the things a caller can actually react
//! to: sockets that cannot be set up, listeners that do not exist, workers
//! that have gone away, and bad command-line input.

use std::io;

use thiserror::Error;

/// Errors raised while installing or driving listeners on a worker.
#[derive(Debug, Error)]
pub enum ListenerError {
    /// I/O error while preparing a listening socket
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// No listener with this tag is installed on the worker
    #[error("Listener with tag {tag} not found")]
    NotFound { tag: u64 },

    /// The worker's task queue is closed
    #[error("Worker {0} has stopped")]
    WorkerStopped(String),
}

impl ListenerError {
    /// Creates a `WorkerStopped` error for the named worker.
    pub fn worker_stopped(name: impl Into<String>) -> Self {
        Self::WorkerStopped(name.into())
    }
}

/// Errors raised while parsing server options.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A flag was given without its value
    #[error("{flag} requires a value")]
    MissingValue { flag: String },

    /// A flag value could not be parsed
    #[error("Invalid value for {flag}: {value}")]
    InvalidValue { flag: String, value: String },

    /// An argument that is not a known flag
    #[error("Unknown argument: {0}")]
    UnknownArgument(String),
}

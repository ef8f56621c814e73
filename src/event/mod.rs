//! Event Dispatching
//!
//! Worker task queue, cross-thread posting and deferred deletion.

pub mod dispatcher;

pub use dispatcher::{
    DeferredDeletable, Dispatcher, DispatcherHandle, PostCallback, TaskReceiver, WorkerTask,
};

//! Distributed execution substrate.
//!
//! Work submitted to thread, async or process pools carries a logical
//! execution context with it; objects registered with the scope's remote
//! object service can be called from any worker process.
//!
//! # Crate Structure
//!
//! - [`transport`]: TCP listener and connect with timeout
//! - [`frame`]: wire frames, codec and request/reply envelopes
//! - [`channel`]: reliable message channels with reconnection and heartbeats
//! - [`remote`]: remote object service and proxies
//! - [`exec`]: futures, context, join and the executor pools
//! - [`worker`]: the loop a worker process runs
//! - [`logging`]: subscriber setup (behind the `cli` feature)

/// Re-export transport types.
pub mod transport {
    pub use parflow_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use parflow_frame::*;
}

/// Re-export channel types.
pub mod channel {
    pub use parflow_channel::*;
}

/// Re-export remote object types.
pub mod remote {
    pub use parflow_remote::*;
}

/// Re-export executor types.
pub mod exec {
    pub use parflow_exec::*;
}

/// Worker process entry point for binaries embedding their own tasks.
pub mod worker {
    pub use parflow_exec::worker::*;
}

#[cfg(feature = "cli")]
pub mod logging;

pub use parflow_exec::{
    join, join_async, AsyncPool, AsyncPoolConfig, Context, JoinOptions, NodeRef, Pool, PoolError,
    ProcessPool, ProcessPoolConfig, Scope, ScopeConfig, Task, TaskError, TaskRegistry, ThreadPool,
    ThreadPoolConfig, WorkFuture,
};
pub use parflow_remote::{ObjectRef, RemoteObject, RemoteService, ServiceObject};

//! Executors that run work on threads, an event loop or worker processes,
//! with futures and a logical execution context that follow the work.
//!
//! Every pool follows the same contract: `open`, then `submit(context, work,
//! block)` returning a [`WorkFuture`] registered as a child of `context`,
//! then `shutdown`. [`join`] waits on futures and surfaces the first failure.

pub mod async_pool;
pub mod context;
pub mod error;
pub mod event_loop;
pub mod future;
pub mod join;
pub mod pool;
pub mod process_pool;
pub mod registry;
pub mod scope;
pub mod thread_pool;
pub mod worker;

pub use async_pool::{AsyncPool, AsyncPoolConfig};
pub use context::{Context, ContextSnapshot, NodeRef};
pub use error::{JoinError, PoolError, Result, TaskError, TaskResult};
pub use event_loop::EventLoop;
pub use future::{FutureState, Joinable, WorkFuture};
pub use join::{join, join_async, join_children, join_children_async, JoinOptions};
pub use pool::Pool;
pub use process_pool::{ProcessPool, ProcessPoolConfig, WorkItem};
pub use registry::{Task, TaskFn, TaskRegistry};
pub use scope::{Scope, ScopeConfig};
pub use thread_pool::{ThreadPool, ThreadPoolConfig};
pub use worker::{WorkerArgs, OUTPUT_TARGET, READY_SENTINEL};

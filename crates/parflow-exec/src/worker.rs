//! The loop run inside a worker process.

use std::io::Write;
use std::net::{SocketAddr, ToSocketAddrs};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;

use parflow_remote::{Map, ObjectRef, RemoteService, ServiceConfig, ServiceObject, Value};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::context::Context;
use crate::error::{PoolError, Result, TaskError};
use crate::future::panic_message;
use crate::process_pool::WorkItem;
use crate::registry::TaskRegistry;

/// Printed on stdout once the worker can take work.
pub const READY_SENTINEL: &str = "PARFLOW-WORKER-READY";

/// Tracing target the parent logs forwarded worker output under.
pub const OUTPUT_TARGET: &str = "parflow::worker";

/// Where a worker finds its parent's work queue.
#[derive(Debug, Clone)]
pub struct WorkerArgs {
    pub host: String,
    pub port: u16,
    pub queue_id: String,
    /// How long each `get` waits on the parent for an item.
    pub poll_interval: Duration,
}

impl WorkerArgs {
    pub fn new(host: impl Into<String>, port: u16, queue_id: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            queue_id: queue_id.into(),
            poll_interval: Duration::from_millis(500),
        }
    }

    fn address(&self) -> Result<SocketAddr> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| PoolError::Worker(format!("could not resolve {}:{}", self.host, self.port)))
    }
}

/// Serve work items from the parent until it says stop.
///
/// Must be called from a plain thread, not from inside an async runtime.
pub fn run(args: &WorkerArgs, registry: &TaskRegistry) -> Result<()> {
    let address = args.address()?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("parflow-worker-io")
        .enable_all()
        .build()?;
    let service = {
        let _entered = runtime.enter();
        RemoteService::client(ServiceConfig::default())?
    };

    let queue = service.proxy(ObjectRef {
        object_id: args.queue_id.clone(),
        address,
    });
    let served = serve(&service, &queue, args, registry);

    if let Err(err) = runtime.block_on(service.shutdown(Duration::from_secs(2))) {
        warn!(error = %err, "worker service shutdown failed");
    }
    runtime.shutdown_timeout(Duration::from_secs(1));
    served
}

fn serve(
    service: &RemoteService,
    queue: &ServiceObject,
    args: &WorkerArgs,
    registry: &TaskRegistry,
) -> Result<()> {
    let pid = std::process::id();
    let pool = queue.get_attribute_blocking("pool")?;

    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{READY_SENTINEL}")?;
    stdout.flush()?;
    drop(stdout);
    info!(pid, %pool, parent = %queue.address(), "worker ready");

    let wait_ms = u64::try_from(args.poll_interval.as_millis()).unwrap_or(u64::MAX);
    let mut served = 0usize;
    loop {
        let reply = queue.call_blocking("get", vec![json!(wait_ms), json!(pid)], Map::new())?;
        if reply.is_null() {
            continue;
        }
        if reply.get("stop").and_then(Value::as_bool) == Some(true) {
            break;
        }
        let item: WorkItem = serde_json::from_value(reply)?;
        execute(service, registry, item, pid)?;
        served += 1;
    }
    info!(pid, served, "worker stopping");
    Ok(())
}

fn execute(service: &RemoteService, registry: &TaskRegistry, item: WorkItem, pid: u32) -> Result<()> {
    let completion = service.proxy(item.completion);
    let started = completion.call_blocking("set_running", vec![json!(pid)], Map::new())?;
    if started != Value::Bool(true) {
        debug!(pid, task = %item.task.name, "work item was cancelled, skipping");
        return Ok(());
    }

    let mut context = Context::restore(item.context);
    context.set_framework("settings", item.settings);
    let task = item.task;
    debug!(pid, task = %task.name, "running task");

    let outcome = catch_unwind(AssertUnwindSafe(|| registry.call(&context, &task)))
        .unwrap_or_else(|payload| {
            Err(TaskError::Panicked {
                message: panic_message(payload.as_ref()),
            })
        });
    match outcome {
        Ok(value) => {
            completion.call_blocking("set_result", vec![value], Map::new())?;
        }
        Err(err) => {
            debug!(pid, task = %task.name, error = %err, "task failed");
            completion.call_blocking("set_exception", vec![serde_json::to_value(&err)?], Map::new())?;
        }
    }
    Ok(())
}

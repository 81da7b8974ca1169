//! Process-wide state shared by the pools: event loop, remote object
//! service and the table of worker processes.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use parflow_remote::{RemoteService, ServiceConfig};
use tracing::{info, warn};

use crate::async_pool::{AsyncPool, AsyncPoolConfig};
use crate::error::{PoolError, Result};
use crate::event_loop::EventLoop;
use crate::future::lock;

#[derive(Debug, Clone)]
pub struct ScopeConfig {
    pub name: String,
    pub service: ServiceConfig,
}

impl Default for ScopeConfig {
    fn default() -> Self {
        Self {
            name: "parflow".to_string(),
            service: ServiceConfig::default(),
        }
    }
}

impl ScopeConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_service(mut self, service: ServiceConfig) -> Self {
        self.service = service;
        self
    }
}

/// Explicitly created and torn down; pools receive it by reference.
#[derive(Debug)]
pub struct Scope {
    name: String,
    event_loop: Arc<EventLoop>,
    service: RemoteService,
    address: SocketAddr,
    pids: Mutex<BTreeSet<u32>>,
    torn_down: AtomicBool,
}

impl Scope {
    /// Start the event loop and bind the remote object service on it.
    pub fn init(config: ScopeConfig) -> Result<Arc<Self>> {
        let event_loop = Arc::new(EventLoop::start(format!("{}-loop", config.name))?);
        let service = match event_loop.block_on(RemoteService::bind(config.service)) {
            Ok(Ok(service)) => service,
            Ok(Err(err)) => {
                let _ = event_loop.stop(Some(Duration::from_secs(1)));
                return Err(err.into());
            }
            Err(err) => return Err(err),
        };
        let address = service
            .address()
            .ok_or_else(|| PoolError::Worker("remote object service is not bound".to_string()))?;
        info!(scope = %config.name, %address, "scope initialised");

        Ok(Arc::new(Self {
            name: config.name,
            event_loop,
            service,
            address,
            pids: Mutex::new(BTreeSet::new()),
            torn_down: AtomicBool::new(false),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn event_loop(&self) -> &Arc<EventLoop> {
        &self.event_loop
    }

    pub fn service(&self) -> &RemoteService {
        &self.service
    }

    /// Where worker processes reach the service.
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// An async pool running on this scope's event loop.
    pub fn async_pool(&self, config: AsyncPoolConfig) -> AsyncPool {
        AsyncPool::with_event_loop(config, self.event_loop.clone())
    }

    pub fn worker_pids(&self) -> Vec<u32> {
        lock(&self.pids).iter().copied().collect()
    }

    pub(crate) fn register_pid(&self, pid: u32) {
        lock(&self.pids).insert(pid);
    }

    pub(crate) fn unregister_pid(&self, pid: u32) {
        lock(&self.pids).remove(&pid);
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::Acquire)
    }

    /// Shut the service down and stop the event loop.
    pub fn teardown(&self, timeout: Duration) -> Result<()> {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let live = self.worker_pids();
        if !live.is_empty() {
            warn!(scope = %self.name, ?live, "tearing down with worker processes still registered");
        }
        let service = self.service.clone();
        self.event_loop
            .block_on(async move { service.shutdown(timeout).await })??;
        self.event_loop.stop(Some(timeout))?;
        info!(scope = %self.name, "scope torn down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_binds_and_teardown_stops() {
        let scope = Scope::init(ScopeConfig::default().with_name("scope-test")).unwrap();
        assert!(scope.address().port() > 0);
        assert!(scope.event_loop().is_running());
        scope.register_pid(42);
        scope.register_pid(7);
        assert_eq!(scope.worker_pids(), vec![7, 42]);
        scope.unregister_pid(42);
        scope.unregister_pid(7);

        scope.teardown(Duration::from_secs(2)).unwrap();
        assert!(scope.is_torn_down());
        assert!(scope.service().is_closed());
        assert!(!scope.event_loop().is_running());
        scope.teardown(Duration::from_secs(2)).unwrap();
    }
}

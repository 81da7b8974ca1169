//! Service owning registered objects and the channels that reach them.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use parflow_channel::{
    new_correlation_id, ChannelConfig, ChannelError, ConnectOptions, Delivery, Identity,
    MessageChannel,
};
use serde_json::{Map, Value};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::error::{RemoteError, Result};
use crate::message::{CallReply, CallRequest, Outcome, WireMessage, GETATTR_MEMBER};
use crate::object::{ObjectRef, RemoteException, RemoteObject};
use crate::proxy::ServiceObject;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Remote object service configuration.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Service identity. Random when unset.
    pub identity: Option<Identity>,
    /// Address the inbound channel binds to.
    pub bind: SocketAddr,
    /// Bound on each remote call.
    pub call_timeout: Duration,
    /// Bound on establishing a link to another service.
    pub connect_timeout: Duration,
    /// Template for both channels. Delivery is always at-least-once.
    pub channel: ChannelConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            identity: None,
            bind: SocketAddr::from(([127, 0, 0, 1], 0)),
            call_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            channel: ChannelConfig::default(),
        }
    }
}

impl ServiceConfig {
    pub fn with_identity(mut self, identity: impl Into<Identity>) -> Self {
        self.identity = Some(identity.into());
        self
    }

    pub fn with_bind(mut self, bind: SocketAddr) -> Self {
        self.bind = bind;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_channel(mut self, channel: ChannelConfig) -> Self {
        self.channel = channel;
        self
    }
}

#[derive(Default)]
struct Registry {
    objects: HashMap<String, Arc<dyn RemoteObject>>,
    ids_by_ptr: HashMap<usize, String>,
}

type LinkSlot = tokio::sync::Mutex<Option<Identity>>;

fn object_key(object: &Arc<dyn RemoteObject>) -> usize {
    Arc::as_ptr(object) as *const () as usize
}

struct Inner {
    identity: Identity,
    config: ServiceConfig,
    /// Receives requests and sends replies. Absent in client mode.
    inbound: Option<MessageChannel>,
    address: Option<SocketAddr>,
    /// Sends requests to other services and receives their replies.
    outbound: MessageChannel,
    /// One slot per remote address. Only callers of the same address wait on
    /// each other while a link is being established.
    links: Mutex<HashMap<SocketAddr, Arc<LinkSlot>>>,
    registry: Mutex<Registry>,
    waiters: Mutex<HashMap<String, oneshot::Sender<Outcome>>>,
    runtime: Handle,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    closed: AtomicBool,
}

/// Exposes local objects and calls remote ones.
#[derive(Clone)]
pub struct RemoteService {
    inner: Arc<Inner>,
}

impl RemoteService {
    /// Start a service with a bound inbound channel, able to both register
    /// objects and call remote ones.
    pub async fn bind(config: ServiceConfig) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|_| RemoteError::NoRuntime)?;
        let identity = config.identity.clone().unwrap_or_else(Identity::random);

        let inbound = MessageChannel::new(
            config
                .channel
                .clone()
                .with_identity(identity.clone())
                .with_delivery(Delivery::AtLeastOnce),
        )?;
        let address = inbound.bind(config.bind).await?;

        let service = Self::assemble(runtime, identity, config, Some((inbound, address)))?;
        info!(identity = %service.inner.identity, %address, "remote object service bound");
        Ok(service)
    }

    /// Start a service that only calls remote objects.
    pub fn client(config: ServiceConfig) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|_| RemoteError::NoRuntime)?;
        let identity = config.identity.clone().unwrap_or_else(Identity::random);
        let service = Self::assemble(runtime, identity, config, None)?;
        debug!(identity = %service.inner.identity, "remote object client started");
        Ok(service)
    }

    fn assemble(
        runtime: Handle,
        identity: Identity,
        config: ServiceConfig,
        inbound: Option<(MessageChannel, SocketAddr)>,
    ) -> Result<Self> {
        let outbound = MessageChannel::new(
            config
                .channel
                .clone()
                .with_identity(format!("{identity}.{}", Uuid::new_v4().simple()))
                .with_delivery(Delivery::AtLeastOnce),
        )?;
        let (inbound, address) = match inbound {
            Some((channel, address)) => (Some(channel), Some(address)),
            None => (None, None),
        };

        let inner = Arc::new(Inner {
            identity,
            config,
            inbound,
            address,
            outbound,
            links: Mutex::new(HashMap::new()),
            registry: Mutex::new(Registry::default()),
            waiters: Mutex::new(HashMap::new()),
            runtime,
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
            closed: AtomicBool::new(false),
        });

        inner
            .runtime
            .spawn(inner.tracker.track_future(reply_loop(inner.clone())));
        if inner.inbound.is_some() {
            inner
                .runtime
                .spawn(inner.tracker.track_future(request_loop(inner.clone())));
        }
        Ok(Self { inner })
    }

    pub fn identity(&self) -> &Identity {
        &self.inner.identity
    }

    /// Inbound address, when bound.
    pub fn address(&self) -> Option<SocketAddr> {
        self.inner.address
    }

    pub fn runtime(&self) -> &Handle {
        &self.inner.runtime
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Expose `object`. Registering the same `Arc` again returns a handle
    /// with the same object id.
    pub fn register(&self, object: Arc<dyn RemoteObject>) -> Result<ServiceObject> {
        if self.is_closed() {
            return Err(RemoteError::ServiceClosed);
        }
        let address = self.inner.address.ok_or(RemoteError::NotServing)?;

        let key = object_key(&object);
        let mut registry = lock(&self.inner.registry);
        let object_id = match registry.ids_by_ptr.get(&key) {
            Some(existing) => existing.clone(),
            None => {
                let object_id = Uuid::new_v4().to_string();
                debug!(
                    identity = %self.inner.identity,
                    %object_id,
                    type_name = object.type_name(),
                    "registered object"
                );
                registry.ids_by_ptr.insert(key, object_id.clone());
                registry.objects.insert(object_id.clone(), object);
                object_id
            }
        };
        drop(registry);

        Ok(self.proxy(ObjectRef { object_id, address }))
    }

    /// Stop exposing `object`. Returns false if it was not registered.
    pub fn unregister(&self, object: &Arc<dyn RemoteObject>) -> bool {
        let mut registry = lock(&self.inner.registry);
        let Some(object_id) = registry.ids_by_ptr.remove(&object_key(object)) else {
            return false;
        };
        registry.objects.remove(&object_id);
        debug!(identity = %self.inner.identity, %object_id, "unregistered object");
        true
    }

    /// Stop exposing the object with `object_id`.
    pub fn unregister_id(&self, object_id: &str) -> bool {
        let mut registry = lock(&self.inner.registry);
        let Some(object) = registry.objects.remove(object_id) else {
            return false;
        };
        registry.ids_by_ptr.remove(&object_key(&object));
        debug!(identity = %self.inner.identity, %object_id, "unregistered object");
        true
    }

    pub fn is_registered(&self, object_id: &str) -> bool {
        lock(&self.inner.registry).objects.contains_key(object_id)
    }

    pub fn registered_count(&self) -> usize {
        lock(&self.inner.registry).objects.len()
    }

    /// Rebind a reference (possibly received from another process).
    pub fn proxy(&self, reference: ObjectRef) -> ServiceObject {
        ServiceObject::new(reference, self.clone())
    }

    /// Invoke `member` on the referenced object and wait for its reply.
    pub(crate) async fn call(
        &self,
        reference: &ObjectRef,
        member: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Result<Value> {
        let inner = &self.inner;
        if self.is_closed() {
            return Err(RemoteError::ServiceClosed);
        }
        let timeout = inner.config.call_timeout;

        let outcome = tokio::time::timeout(timeout, async {
            let peer = self.link(reference.address).await?;
            let correlation_id = new_correlation_id();
            let request = WireMessage::Request(CallRequest {
                correlation_id: correlation_id.clone(),
                object_id: reference.object_id.clone(),
                member: member.to_string(),
                args,
                kwargs,
            });

            let (tx, rx) = oneshot::channel();
            lock(&inner.waiters).insert(correlation_id.clone(), tx);
            let _waiter = WaiterGuard {
                inner,
                correlation_id: &correlation_id,
            };

            trace!(%correlation_id, object_id = %reference.object_id, member, "sending remote call");
            inner.outbound.send(request.to_vec()?, Some(&peer))?;
            rx.await.map_err(|_| RemoteError::ServiceClosed)
        })
        .await
        .map_err(|_| RemoteError::Timeout(timeout))??;

        match outcome {
            Outcome::Result(value) => Ok(value),
            Outcome::Exception(exception) => Err(RemoteError::Exception(exception)),
        }
    }

    /// Outbound link to the service at `address`, connecting if needed.
    async fn link(&self, address: SocketAddr) -> Result<Identity> {
        let inner = &self.inner;
        let slot = lock(&inner.links).entry(address).or_default().clone();

        let mut peer = slot.lock().await;
        if let Some(existing) = peer.as_ref() {
            if inner.outbound.is_connected(existing) {
                return Ok(existing.clone());
            }
        }
        let options = ConnectOptions::default().with_timeout(inner.config.connect_timeout);
        let linked = inner.outbound.connect(address, options).await?;
        debug!(identity = %inner.identity, peer = %linked, %address, "linked to remote service");
        *peer = Some(linked.clone());
        Ok(linked)
    }

    /// Unregister every object, fail outstanding calls and close both channels.
    pub async fn shutdown(&self, timeout: Duration) -> Result<()> {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let remaining = {
            let mut registry = lock(&inner.registry);
            registry.ids_by_ptr.clear();
            registry.objects.drain().count()
        };
        let abandoned = {
            let mut waiters = lock(&inner.waiters);
            waiters.drain().count()
        };
        debug!(identity = %inner.identity, remaining, abandoned, "shutting down remote service");

        inner.shutdown.cancel();
        if let Some(inbound) = &inner.inbound {
            inbound.close(timeout).await?;
        }
        inner.outbound.close(timeout).await?;

        inner.tracker.close();
        if tokio::time::timeout(timeout, inner.tracker.wait()).await.is_err() {
            warn!(identity = %inner.identity, "remote dispatch still running after shutdown timeout");
        }
        info!(identity = %inner.identity, "remote object service stopped");
        Ok(())
    }
}

impl std::fmt::Debug for RemoteService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteService")
            .field("identity", &self.inner.identity)
            .field("address", &self.inner.address)
            .finish_non_exhaustive()
    }
}

struct WaiterGuard<'a> {
    inner: &'a Inner,
    correlation_id: &'a str,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        lock(&self.inner.waiters).remove(self.correlation_id);
    }
}

async fn reply_loop(inner: Arc<Inner>) {
    loop {
        let received = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            received = inner.outbound.recv_identity() => received,
        };
        let (peer, payload) = match received {
            Ok(item) => item,
            Err(ChannelError::Closed) => break,
            Err(err) => {
                warn!(identity = %inner.identity, error = %err, "reply receive failed");
                continue;
            }
        };
        match WireMessage::from_slice(&payload) {
            Ok(WireMessage::Reply(reply)) => {
                let waiter = lock(&inner.waiters).remove(&reply.correlation_id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(reply.outcome);
                    }
                    None => debug!(
                        correlation_id = %reply.correlation_id,
                        "reply for a call nobody is waiting on"
                    ),
                }
            }
            Ok(WireMessage::Request(request)) => {
                warn!(%peer, correlation_id = %request.correlation_id, "request arrived on reply channel");
            }
            Err(err) => warn!(%peer, error = %err, "malformed reply"),
        }
    }
    debug!(identity = %inner.identity, "reply loop stopped");
}

async fn request_loop(inner: Arc<Inner>) {
    let Some(inbound) = inner.inbound.clone() else {
        return;
    };
    loop {
        let received = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            received = inbound.recv_identity() => received,
        };
        let (requester, payload) = match received {
            Ok(item) => item,
            Err(ChannelError::Closed) => break,
            Err(err) => {
                warn!(identity = %inner.identity, error = %err, "request receive failed");
                continue;
            }
        };
        match WireMessage::from_slice(&payload) {
            Ok(WireMessage::Request(request)) => {
                inner.runtime.spawn(
                    inner
                        .tracker
                        .track_future(serve_request(inner.clone(), inbound.clone(), requester, request)),
                );
            }
            Ok(WireMessage::Reply(reply)) => {
                warn!(%requester, correlation_id = %reply.correlation_id, "reply arrived on request channel");
            }
            Err(err) => warn!(%requester, error = %err, "malformed request"),
        }
    }
    debug!(identity = %inner.identity, "request loop stopped");
}

async fn serve_request(
    inner: Arc<Inner>,
    inbound: MessageChannel,
    requester: Identity,
    request: CallRequest,
) {
    let correlation_id = request.correlation_id.clone();
    let object = lock(&inner.registry).objects.get(&request.object_id).cloned();

    let outcome = match object {
        None => Outcome::Exception(
            RemoteException::new(
                "ObjectNotFound",
                format!("object '{}' is not registered", request.object_id),
            )
            .with_frame(service_frame(&inner)),
        ),
        Some(object) => {
            let frame = format!(
                "in {}.{} (object {}, {})",
                object.type_name(),
                request.member,
                request.object_id,
                service_frame(&inner)
            );
            let joined = tokio::task::spawn_blocking(move || invoke(object.as_ref(), request)).await;
            match joined {
                Ok(Ok(value)) => Outcome::Result(value),
                Ok(Err(exception)) => Outcome::Exception(exception.with_frame(frame)),
                Err(err) => Outcome::Exception(
                    RemoteException::new("Cancelled", err.to_string()).with_frame(frame),
                ),
            }
        }
    };

    let reply = WireMessage::Reply(CallReply {
        correlation_id: correlation_id.clone(),
        outcome,
    });
    let sent = reply
        .to_vec()
        .map_err(RemoteError::from)
        .and_then(|bytes| inbound.send(bytes, Some(&requester)).map_err(RemoteError::from));
    if let Err(err) = sent {
        warn!(%requester, %correlation_id, error = %err, "could not send reply");
    }
}

fn invoke(object: &dyn RemoteObject, request: CallRequest) -> std::result::Result<Value, RemoteException> {
    let CallRequest {
        member,
        args,
        kwargs,
        ..
    } = request;

    let result = catch_unwind(AssertUnwindSafe(|| {
        if member == GETATTR_MEMBER {
            match args.first().and_then(Value::as_str) {
                Some(name) => object.get_attribute(name),
                None => Err(RemoteException::bad_arguments(
                    GETATTR_MEMBER,
                    "expected the attribute name as the first argument",
                )),
            }
        } else {
            object.invoke(&member, args, kwargs)
        }
    }));

    match result {
        Ok(outcome) => outcome,
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "member panicked".to_string());
            Err(RemoteException::new("Panic", message))
        }
    }
}

fn service_frame(inner: &Inner) -> String {
    match inner.address {
        Some(address) => format!("service {} at {address}", inner.identity),
        None => format!("service {}", inner.identity),
    }
}

//! The public channel type.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use parflow_frame::{Frame, Message};
use parflow_transport::Listener;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::{ChannelConfig, ConnectOptions, Delivery, Distribution};
use crate::connection::{ConnectionHandle, ConnectionSet, RoundRobinMiss, UnicastMiss};
use crate::error::{ChannelError, Result};
use crate::identity::{new_correlation_id, Identity};
use crate::pending::{AckOutcome, PendingAcks, SeenIds};
use crate::{connector, listener};

/// Lock a mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Grace period for connection tasks after a close deadline has passed.
const STOP_GRACE: Duration = Duration::from_millis(100);

/// State shared by the channel handle and its background tasks.
pub(crate) struct Shared {
    pub identity: Identity,
    pub config: ChannelConfig,
    pub connections: Mutex<ConnectionSet>,
    pub inbox_tx: mpsc::Sender<(Identity, Bytes)>,
    pub pending: PendingAcks,
    pub seen: SeenIds,
    pub shutdown: CancellationToken,
    tracker: TaskTracker,
    runtime: Handle,
    closing: AtomicBool,
    local_addr: Mutex<Option<SocketAddr>>,
    next_connection_id: AtomicU64,
}

impl Shared {
    pub fn spawn<F>(&self, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.runtime.spawn(self.tracker.track_future(future));
    }

    pub fn next_connection_id(&self) -> u64 {
        self.next_connection_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    pub fn register(&self, handle: Arc<ConnectionHandle>) -> Result<()> {
        if self.is_closing() {
            return Err(ChannelError::Closed);
        }
        lock(&self.connections)
            .insert(handle)
            .map_err(ChannelError::DuplicateIdentity)
    }

    pub fn unregister(&self, handle: &ConnectionHandle) {
        if lock(&self.connections).remove(handle.id) {
            debug!(identity = %self.identity, peer = %handle.identity, "connection removed");
        }
    }

    /// Put a tracked frame on the wire. Returns whether some connection took it.
    fn route_tracked(&self, correlation_id: &str, frame: Frame, target: Option<&Identity>) -> bool {
        let mut connections = lock(&self.connections);
        match target {
            Some(identity) => match connections.unicast(identity, frame) {
                Ok(()) => true,
                Err(UnicastMiss::Full) => {
                    warn!(peer = %identity, %correlation_id, "outbound queue full, will retry");
                    false
                }
                Err(UnicastMiss::NotConnected) => {
                    debug!(peer = %identity, %correlation_id, "target not connected, will retry");
                    false
                }
            },
            None => match connections.round_robin(frame) {
                Ok(_) => true,
                Err(RoundRobinMiss::NoConnections) => {
                    debug!(%correlation_id, "no connections, will retry");
                    false
                }
                Err(RoundRobinMiss::AllSaturated) => {
                    warn!(%correlation_id, "all outbound queues full, will retry");
                    false
                }
            },
        }
    }
}

/// Resend a tracked message until it is acknowledged or attempts run out.
async fn retry_loop(shared: Arc<Shared>, correlation_id: String, settled: CancellationToken) {
    let policy = shared.config.retry;
    let mut attempts: u32 = 1;
    loop {
        tokio::select! {
            _ = settled.cancelled() => return,
            _ = shared.shutdown.cancelled() => return,
            _ = tokio::time::sleep(policy.interval) => {}
        }

        if attempts >= policy.max_attempts {
            if shared.pending.give_up(&correlation_id) {
                warn!(
                    identity = %shared.identity,
                    %correlation_id,
                    attempts,
                    "message not acknowledged, dropping"
                );
            }
            return;
        }

        let Some((frame, target)) = shared.pending.resend(&correlation_id) else {
            return;
        };
        attempts += 1;
        debug!(%correlation_id, attempt = attempts, "resending unacknowledged message");
        shared.route_tracked(&correlation_id, frame, target.as_ref());
    }
}

/// How a send left the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    /// Placed on at least one outbound queue.
    Queued,
    /// Tracked but not yet on any queue; the retry timer will resend it.
    Pending,
    /// Discarded because every candidate queue was full.
    Dropped,
}

/// Result of [`MessageChannel::send`].
#[derive(Debug)]
pub struct Receipt {
    status: SendStatus,
    correlation_ids: Vec<String>,
    acks: Vec<oneshot::Receiver<AckOutcome>>,
}

impl Receipt {
    fn untracked(status: SendStatus) -> Self {
        Self {
            status,
            correlation_ids: Vec::new(),
            acks: Vec::new(),
        }
    }

    pub fn status(&self) -> SendStatus {
        self.status
    }

    pub fn is_dropped(&self) -> bool {
        self.status == SendStatus::Dropped
    }

    /// Correlation ids of the tracked copies. Empty for at-most-once sends.
    pub fn correlation_ids(&self) -> &[String] {
        &self.correlation_ids
    }

    /// Wait until every tracked copy is acknowledged.
    ///
    /// At-most-once receipts resolve immediately: `Ok` if queued, otherwise
    /// [`ChannelError::Undelivered`].
    pub async fn acknowledged(self) -> Result<()> {
        if self.acks.is_empty() {
            return match self.status {
                SendStatus::Dropped => Err(ChannelError::Undelivered("untracked".to_string())),
                SendStatus::Queued | SendStatus::Pending => Ok(()),
            };
        }
        for (id, ack) in self.correlation_ids.into_iter().zip(self.acks) {
            match ack.await {
                Ok(AckOutcome::Acknowledged) => {}
                Ok(AckOutcome::Dropped) => return Err(ChannelError::Undelivered(id)),
                Err(_) => return Err(ChannelError::Closed),
            }
        }
        Ok(())
    }
}

/// Content-agnostic duplex message channel.
///
/// Cloning yields another handle onto the same channel.
#[derive(Clone)]
pub struct MessageChannel {
    shared: Arc<Shared>,
    inbox: Arc<tokio::sync::Mutex<mpsc::Receiver<(Identity, Bytes)>>>,
}

impl MessageChannel {
    /// Create a channel. Must be called from within a tokio runtime, which
    /// then hosts all of the channel's background tasks.
    pub fn new(config: ChannelConfig) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|_| ChannelError::NoRuntime)?;
        let identity = config.identity.clone().unwrap_or_else(Identity::random);
        let (inbox_tx, inbox_rx) = mpsc::channel(config.recv_capacity.max(1));

        let shared = Arc::new(Shared {
            identity,
            seen: SeenIds::new(config.dedup_window),
            config,
            connections: Mutex::new(ConnectionSet::default()),
            inbox_tx,
            pending: PendingAcks::default(),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
            runtime,
            closing: AtomicBool::new(false),
            local_addr: Mutex::new(None),
            next_connection_id: AtomicU64::new(1),
        });

        debug!(identity = %shared.identity, "channel created");
        Ok(Self {
            shared,
            inbox: Arc::new(tokio::sync::Mutex::new(inbox_rx)),
        })
    }

    pub fn identity(&self) -> &Identity {
        &self.shared.identity
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.shared.config
    }

    /// Address the channel is listening on, once bound.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *lock(&self.shared.local_addr)
    }

    /// Identities currently connected, in connection order.
    pub fn connections(&self) -> Vec<Identity> {
        lock(&self.shared.connections).identities()
    }

    pub fn is_connected(&self, identity: &Identity) -> bool {
        lock(&self.shared.connections).contains(identity)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closing()
    }

    /// Accept inbound connections on `addr`. Returns the bound address,
    /// which carries the real port when `addr` asks for an ephemeral one.
    pub async fn bind(&self, addr: SocketAddr) -> Result<SocketAddr> {
        if self.shared.is_closing() {
            return Err(ChannelError::Closed);
        }
        if let Some(bound) = self.local_addr() {
            return Err(ChannelError::AlreadyBound(bound));
        }

        let listener = Listener::bind(addr).await?;
        let bound = listener.local_addr();
        {
            let mut local = lock(&self.shared.local_addr);
            if let Some(existing) = *local {
                return Err(ChannelError::AlreadyBound(existing));
            }
            *local = Some(bound);
        }

        info!(identity = %self.shared.identity, address = %bound, "channel listening");
        self.shared
            .spawn(listener::accept_loop(self.shared.clone(), listener));
        Ok(bound)
    }

    /// Establish an outbound link. Resolves with the peer identity once the
    /// first handshake succeeds; the link keeps running in the background.
    pub async fn connect(&self, addr: SocketAddr, options: ConnectOptions) -> Result<Identity> {
        if self.shared.is_closing() {
            return Err(ChannelError::Closed);
        }
        let (ready_tx, ready_rx) = oneshot::channel();
        self.shared
            .spawn(connector::supervise(self.shared.clone(), addr, options, ready_tx));
        ready_rx.await.map_err(|_| ChannelError::Closed)?
    }

    /// Send `payload` to `target`, or distribute it per the configured mode.
    ///
    /// Never blocks: saturated queues drop (at-most-once) or defer to the
    /// retry timer (at-least-once).
    pub fn send(&self, payload: impl Into<Bytes>, target: Option<&Identity>) -> Result<Receipt> {
        if self.shared.is_closing() {
            return Err(ChannelError::Closed);
        }
        let payload = payload.into();
        match self.shared.config.delivery {
            Delivery::AtMostOnce => self.send_untracked(payload, target),
            Delivery::AtLeastOnce => self.send_tracked(payload, target),
        }
    }

    fn send_untracked(&self, payload: Bytes, target: Option<&Identity>) -> Result<Receipt> {
        let frame = Frame::data(payload);
        let mut connections = lock(&self.shared.connections);

        if let Some(identity) = target {
            return match connections.unicast(identity, frame) {
                Ok(()) => Ok(Receipt::untracked(SendStatus::Queued)),
                Err(UnicastMiss::Full) => {
                    warn!(peer = %identity, "outbound queue full, dropping message");
                    Ok(Receipt::untracked(SendStatus::Dropped))
                }
                Err(UnicastMiss::NotConnected) => Err(ChannelError::NotConnected(identity.clone())),
            };
        }

        match self.shared.config.distribution {
            Distribution::RoundRobin => match connections.round_robin(frame) {
                Ok(_) => Ok(Receipt::untracked(SendStatus::Queued)),
                Err(RoundRobinMiss::NoConnections) => Err(ChannelError::NoConnections),
                Err(RoundRobinMiss::AllSaturated) => {
                    warn!(
                        connections = connections.len(),
                        "all outbound queues full, dropping message"
                    );
                    Ok(Receipt::untracked(SendStatus::Dropped))
                }
            },
            Distribution::Publish => {
                if connections.is_empty() {
                    return Err(ChannelError::NoConnections);
                }
                let (queued, dropped) = connections.broadcast(&frame);
                for peer in &dropped {
                    warn!(%peer, "outbound queue full, dropping published message");
                }
                let status = if queued.is_empty() {
                    SendStatus::Dropped
                } else {
                    SendStatus::Queued
                };
                Ok(Receipt::untracked(status))
            }
        }
    }

    fn send_tracked(&self, payload: Bytes, target: Option<&Identity>) -> Result<Receipt> {
        let targets: Vec<Option<Identity>> = match (target, self.shared.config.distribution) {
            (Some(identity), _) => vec![Some(identity.clone())],
            (None, Distribution::RoundRobin) => vec![None],
            (None, Distribution::Publish) => {
                let identities = lock(&self.shared.connections).identities();
                if identities.is_empty() {
                    return Err(ChannelError::NoConnections);
                }
                identities.into_iter().map(Some).collect()
            }
        };

        let mut receipt = Receipt {
            status: SendStatus::Pending,
            correlation_ids: Vec::with_capacity(targets.len()),
            acks: Vec::with_capacity(targets.len()),
        };

        for target in targets {
            let correlation_id = new_correlation_id();
            let frame = Message::Request {
                correlation_id: correlation_id.clone(),
                payload: payload.clone(),
            }
            .into_frame()?;

            let (ack, settled) =
                self.shared
                    .pending
                    .insert(correlation_id.clone(), frame.clone(), target.clone());
            if self
                .shared
                .route_tracked(&correlation_id, frame, target.as_ref())
            {
                receipt.status = SendStatus::Queued;
            }
            self.shared.spawn(retry_loop(
                self.shared.clone(),
                correlation_id.clone(),
                settled,
            ));

            receipt.correlation_ids.push(correlation_id);
            receipt.acks.push(ack);
        }
        Ok(receipt)
    }

    /// Next payload, with the identity of the connection it arrived on.
    pub async fn recv_identity(&self) -> Result<(Identity, Bytes)> {
        let mut inbox = self.inbox.lock().await;
        tokio::select! {
            biased;
            item = inbox.recv() => item.ok_or(ChannelError::Closed),
            _ = self.shared.shutdown.cancelled() => Err(ChannelError::Closed),
        }
    }

    /// Next payload.
    pub async fn recv(&self) -> Result<Bytes> {
        self.recv_identity().await.map(|(_, payload)| payload)
    }

    /// Next payload, waiting at most `timeout`.
    pub async fn recv_timeout(&self, timeout: Duration) -> Result<(Identity, Bytes)> {
        tokio::time::timeout(timeout, self.recv_identity())
            .await
            .map_err(|_| ChannelError::Timeout(timeout))?
    }

    /// Stop the channel.
    ///
    /// Waits (up to `timeout`) for outstanding acknowledgments, then cancels
    /// retries, tells inbound peers to disconnect and stops every task.
    pub async fn close(&self, timeout: Duration) -> Result<()> {
        if self.shared.closing.swap(true, Ordering::AcqRel) {
            self.shared.tracker.wait().await;
            return Ok(());
        }
        let deadline = Instant::now() + timeout;
        debug!(identity = %self.shared.identity, "closing channel");

        if tokio::time::timeout_at(deadline, self.shared.pending.wait_drained())
            .await
            .is_err()
        {
            warn!(
                identity = %self.shared.identity,
                outstanding = self.shared.pending.len(),
                "closing with unacknowledged messages"
            );
        }
        self.shared.pending.abandon_all();

        self.shared.shutdown.cancel();
        self.shared.tracker.close();

        let stop_deadline = deadline.max(Instant::now() + STOP_GRACE);
        if tokio::time::timeout_at(stop_deadline, self.shared.tracker.wait())
            .await
            .is_err()
        {
            warn!(
                identity = %self.shared.identity,
                tasks = self.shared.tracker.len(),
                "channel tasks still running after close timeout"
            );
        }
        info!(identity = %self.shared.identity, "channel closed");
        Ok(())
    }
}

impl std::fmt::Debug for MessageChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageChannel")
            .field("identity", &self.shared.identity)
            .field("local_addr", &self.local_addr())
            .field("connections", &self.connections())
            .finish()
    }
}

//! One physical link and the set of links a channel owns.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use parflow_frame::kind::{is_reserved, kind_name};
use parflow_frame::{Frame, FrameCodec, FrameError, Message, DISCONNECT, HANDSHAKE, HEARTBEAT};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, error::SendTimeoutError, error::TrySendError};
use tokio::time::Instant;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::channel::Shared;
use crate::error::ChannelError;
use crate::identity::Identity;

/// Which side initiated the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Accepted by a bound channel. Watches for peer silence.
    Inbound,
    /// Established by `connect`. Sends heartbeats while idle.
    Outbound,
}

/// Why a connection task stopped.
#[derive(Debug)]
pub enum ConnectionEnd {
    /// The owning channel asked the connection to stop.
    Cancelled,
    /// The peer sent a DISCONNECT frame.
    Disconnected,
    /// The peer closed the stream.
    Closed,
    /// I/O, protocol or liveness failure.
    Failed(ChannelError),
}

pub(crate) struct ConnectionHandle {
    pub id: u64,
    pub identity: Identity,
    pub role: Role,
    pub peer_addr: SocketAddr,
    pub outbound: mpsc::Sender<Frame>,
    pub cancel: CancellationToken,
}

/// Outcome of a unicast attempt.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum UnicastMiss {
    NotConnected,
    Full,
}

/// Outcome of a round-robin attempt.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum RoundRobinMiss {
    NoConnections,
    AllSaturated,
}

/// Live connections keyed by peer identity, in insertion order.
#[derive(Default)]
pub(crate) struct ConnectionSet {
    entries: Vec<Arc<ConnectionHandle>>,
    cursor: usize,
}

impl ConnectionSet {
    /// Add a connection. Fails if the identity is already connected.
    pub fn insert(&mut self, handle: Arc<ConnectionHandle>) -> Result<(), Identity> {
        if self.entries.iter().any(|h| h.identity == handle.identity) {
            return Err(handle.identity.clone());
        }
        self.entries.push(handle);
        Ok(())
    }

    /// Remove the connection with this serial id. A newer connection that
    /// reuses the identity is left alone.
    pub fn remove(&mut self, id: u64) -> bool {
        let Some(pos) = self.entries.iter().position(|h| h.id == id) else {
            return false;
        };
        self.entries.remove(pos);
        if pos < self.cursor {
            self.cursor -= 1;
        }
        if self.cursor >= self.entries.len() {
            self.cursor = 0;
        }
        true
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, identity: &Identity) -> bool {
        self.entries.iter().any(|h| &h.identity == identity)
    }

    pub fn identities(&self) -> Vec<Identity> {
        self.entries.iter().map(|h| h.identity.clone()).collect()
    }

    pub fn unicast(&self, identity: &Identity, frame: Frame) -> Result<(), UnicastMiss> {
        let handle = self
            .entries
            .iter()
            .find(|h| &h.identity == identity)
            .ok_or(UnicastMiss::NotConnected)?;
        match handle.outbound.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(UnicastMiss::Full),
            Err(TrySendError::Closed(_)) => Err(UnicastMiss::NotConnected),
        }
    }

    /// Queue on the next connection in rotation that has room.
    pub fn round_robin(&mut self, frame: Frame) -> Result<Identity, RoundRobinMiss> {
        let len = self.entries.len();
        if len == 0 {
            return Err(RoundRobinMiss::NoConnections);
        }
        for step in 0..len {
            let index = (self.cursor + step) % len;
            let handle = &self.entries[index];
            if handle.outbound.try_send(frame.clone()).is_ok() {
                self.cursor = (index + 1) % len;
                return Ok(handle.identity.clone());
            }
        }
        Err(RoundRobinMiss::AllSaturated)
    }

    /// Queue on every connection. Returns the identities that accepted it and
    /// the ones that were saturated.
    pub fn broadcast(&self, frame: &Frame) -> (Vec<Identity>, Vec<Identity>) {
        let mut queued = Vec::new();
        let mut dropped = Vec::new();
        for handle in &self.entries {
            match handle.outbound.try_send(frame.clone()) {
                Ok(()) => queued.push(handle.identity.clone()),
                Err(_) => dropped.push(handle.identity.clone()),
            }
        }
        (queued, dropped)
    }
}

enum Flow {
    Continue,
    Disconnect,
    Deliver(PendingDelivery),
}

/// A payload waiting for room in the receive queue.
type PendingDelivery = Pin<Box<dyn Future<Output = Delivered> + Send>>;

struct Delivered {
    /// Set for payloads that must be acknowledged once accepted.
    correlation_id: Option<String>,
    accepted: bool,
}

type FramedTcp = Framed<TcpStream, FrameCodec>;
type FrameSink = futures_util::stream::SplitSink<FramedTcp, Frame>;

/// Drive one link until it ends.
///
/// A single task owns both halves of the stream, so outbound writes,
/// heartbeats, acknowledgments and inbound frames never race each other.
/// While a payload waits for room in the receive queue, no further frames
/// are read, but outbound traffic and heartbeats keep flowing.
pub(crate) async fn run_connection(
    shared: Arc<Shared>,
    handle: Arc<ConnectionHandle>,
    framed: FramedTcp,
    mut outbound_rx: mpsc::Receiver<Frame>,
) -> ConnectionEnd {
    let (mut sink, mut stream) = framed.split();
    debug!(peer = %handle.identity, addr = %handle.peer_addr, role = ?handle.role, "connection running");

    let (heartbeat_interval, silence_timeout) = match handle.role {
        Role::Outbound => (shared.config.heartbeat_interval, Duration::ZERO),
        Role::Inbound => (Duration::ZERO, shared.config.heartbeat_timeout),
    };
    let mut last_sent = Instant::now();
    let mut last_heard = Instant::now();
    let mut pending: Option<PendingDelivery> = None;

    loop {
        let heartbeat_at = last_sent + heartbeat_interval;
        let silence_at = last_heard + silence_timeout;
        let delivering = pending.is_some();

        tokio::select! {
            biased;

            _ = handle.cancel.cancelled() => {
                if handle.role == Role::Inbound {
                    let _ = sink.send(Frame::disconnect()).await;
                }
                let _ = sink.close().await;
                return ConnectionEnd::Cancelled;
            }

            delivered = finish_delivery(&mut pending), if delivering => {
                pending = None;
                // Frames were not read while the queue was full.
                last_heard = Instant::now();
                if let Err(err) = acknowledge(&shared, &mut sink, delivered).await {
                    return ConnectionEnd::Failed(err);
                }
            }

            _ = tokio::time::sleep_until(heartbeat_at), if !heartbeat_interval.is_zero() => {
                trace!(peer = %handle.identity, "sending heartbeat");
                if let Err(err) = sink.send(Frame::heartbeat()).await {
                    return ConnectionEnd::Failed(err.into());
                }
                last_sent = Instant::now();
            }

            frame = outbound_rx.recv() => {
                let Some(frame) = frame else {
                    return ConnectionEnd::Cancelled;
                };
                if let Err(err) = sink.send(frame).await {
                    return ConnectionEnd::Failed(err.into());
                }
                last_sent = Instant::now();
            }

            item = stream.next(), if !delivering => {
                last_heard = Instant::now();
                let frame = match item {
                    None => return ConnectionEnd::Closed,
                    Some(Err(FrameError::ConnectionClosed)) => return ConnectionEnd::Closed,
                    Some(Err(err)) => return ConnectionEnd::Failed(err.into()),
                    Some(Ok(frame)) => frame,
                };
                match handle_frame(&shared, &handle, &mut sink, frame).await {
                    Ok(Flow::Continue) => {}
                    Ok(Flow::Deliver(delivery)) => pending = Some(delivery),
                    Ok(Flow::Disconnect) => return ConnectionEnd::Disconnected,
                    Err(err) => return ConnectionEnd::Failed(err),
                }
            }

            _ = tokio::time::sleep_until(silence_at), if !silence_timeout.is_zero() && !delivering => {
                return ConnectionEnd::Failed(ChannelError::HeartbeatTimeout(silence_timeout));
            }
        }
    }
}

async fn finish_delivery(pending: &mut Option<PendingDelivery>) -> Delivered {
    match pending {
        Some(delivery) => delivery.await,
        None => std::future::pending().await,
    }
}

/// Acknowledge an accepted request, or forget its id so a retry is
/// delivered again.
async fn acknowledge(
    shared: &Shared,
    sink: &mut FrameSink,
    delivered: Delivered,
) -> Result<(), ChannelError> {
    let Some(correlation_id) = delivered.correlation_id else {
        return Ok(());
    };
    if !delivered.accepted {
        shared.seen.forget(&correlation_id);
        return Ok(());
    }
    let reply = Message::Reply { correlation_id }.into_frame()?;
    sink.send(reply).await?;
    Ok(())
}

async fn handle_frame(
    shared: &Shared,
    handle: &ConnectionHandle,
    sink: &mut FrameSink,
    frame: Frame,
) -> Result<Flow, ChannelError> {
    trace!(
        peer = %handle.identity,
        kind = kind_name(frame.kind),
        bytes = frame.wire_size(),
        "frame received"
    );
    match frame.kind {
        HEARTBEAT => return Ok(Flow::Continue),
        DISCONNECT => return Ok(Flow::Disconnect),
        HANDSHAKE => {
            return Err(ChannelError::HandshakeFailed(
                "handshake frame after connection was established".to_string(),
            ))
        }
        _ => {}
    }

    let message = match Message::from_frame(frame) {
        Ok(message) => message,
        Err(FrameError::UnexpectedKind(kind)) => {
            debug!(
                peer = %handle.identity,
                kind,
                reserved = is_reserved(kind),
                "ignoring frame of unknown kind"
            );
            return Ok(Flow::Continue);
        }
        Err(err) => {
            warn!(peer = %handle.identity, error = %err, "discarding malformed envelope");
            return Ok(Flow::Continue);
        }
    };

    match message {
        Message::Plain(payload) => Ok(Flow::Deliver(deliver(shared, handle, None, payload))),
        Message::Request {
            correlation_id,
            payload,
        } => {
            if shared.seen.insert(&correlation_id) {
                return Ok(Flow::Deliver(deliver(
                    shared,
                    handle,
                    Some(correlation_id),
                    payload,
                )));
            }
            debug!(peer = %handle.identity, %correlation_id, "duplicate request, re-acknowledging");
            let reply = Message::Reply { correlation_id }.into_frame()?;
            sink.send(reply).await?;
            Ok(Flow::Continue)
        }
        Message::Reply { correlation_id } => {
            if !shared.pending.resolve(&correlation_id) {
                trace!(peer = %handle.identity, %correlation_id, "reply for unknown or settled message");
            }
            Ok(Flow::Continue)
        }
    }
}

/// Hand a payload to the receive queue, waiting up to `deliver_timeout`
/// for room.
fn deliver(
    shared: &Shared,
    handle: &ConnectionHandle,
    correlation_id: Option<String>,
    payload: Bytes,
) -> PendingDelivery {
    let inbox = shared.inbox_tx.clone();
    let timeout = shared.config.deliver_timeout;
    let peer = handle.identity.clone();
    Box::pin(async move {
        let accepted = match inbox.send_timeout((peer.clone(), payload), timeout).await {
            Ok(()) => true,
            Err(SendTimeoutError::Timeout(_)) => {
                warn!(%peer, ?timeout, "receive queue full, dropping payload");
                false
            }
            Err(SendTimeoutError::Closed(_)) => {
                debug!(%peer, "receive queue closed, dropping payload");
                false
            }
        };
        Delivered {
            correlation_id,
            accepted,
        }
    })
}

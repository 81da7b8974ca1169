//! Outbound side: connect, handshake and the reconnect supervisor.

use std::net::SocketAddr;
use std::sync::Arc;

use parflow_frame::{Frame, FrameCodec};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::channel::Shared;
use crate::config::ConnectOptions;
use crate::connection::{run_connection, ConnectionEnd, ConnectionHandle, Role};
use crate::error::{ChannelError, Result};
use crate::handshake::handshake_client;
use crate::identity::Identity;

type Ready = Option<oneshot::Sender<Result<Identity>>>;

fn report(ready: &mut Ready, result: Result<Identity>) {
    if let Some(tx) = ready.take() {
        let _ = tx.send(result);
    }
}

struct Established {
    handle: Arc<ConnectionHandle>,
    framed: Framed<TcpStream, FrameCodec>,
    outbound_rx: mpsc::Receiver<Frame>,
}

async fn establish(
    shared: &Shared,
    addr: SocketAddr,
    options: &ConnectOptions,
) -> Result<Established> {
    let stream = parflow_transport::connect(addr, options.connect_timeout).await?;
    let mut framed = Framed::new(
        stream,
        FrameCodec::new(shared.config.frame.max_handshake_payload),
    );

    let peer = handshake_client(
        &mut framed,
        &shared.identity,
        options.expected_identity.as_ref(),
        &shared.config.handshake,
    )
    .await?;
    framed
        .codec_mut()
        .set_max_payload_size(shared.config.frame.max_payload_size);

    let (outbound, outbound_rx) = mpsc::channel(shared.config.outbound_capacity.max(1));
    let handle = Arc::new(ConnectionHandle {
        id: shared.next_connection_id(),
        identity: peer,
        role: Role::Outbound,
        peer_addr: addr,
        outbound,
        cancel: shared.shutdown.child_token(),
    });
    shared.register(handle.clone())?;

    Ok(Established {
        handle,
        framed,
        outbound_rx,
    })
}

/// Keep one outbound link alive according to `options`.
///
/// The first successful handshake (or the terminal failure) is reported on
/// `ready`. Non-permanent links stop after the first loss; permanent links
/// reconnect until the channel closes or the peer disconnects.
pub(crate) async fn supervise(
    shared: Arc<Shared>,
    addr: SocketAddr,
    options: ConnectOptions,
    ready: oneshot::Sender<Result<Identity>>,
) {
    let mut ready: Ready = Some(ready);
    let started = Instant::now();
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;
        let result = tokio::select! {
            _ = shared.shutdown.cancelled() => Err(ChannelError::Closed),
            result = establish(&shared, addr, &options) => result,
        };

        match result {
            Ok(Established {
                handle,
                framed,
                outbound_rx,
            }) => {
                attempt = 0;
                info!(
                    identity = %shared.identity,
                    peer = %handle.identity,
                    %addr,
                    "outbound connection established"
                );
                report(&mut ready, Ok(handle.identity.clone()));

                let end = run_connection(shared.clone(), handle.clone(), framed, outbound_rx).await;
                shared.unregister(&handle);

                match end {
                    ConnectionEnd::Cancelled => {
                        debug!(peer = %handle.identity, "outbound link cancelled");
                        return;
                    }
                    ConnectionEnd::Disconnected => {
                        info!(peer = %handle.identity, "peer ended the link");
                        return;
                    }
                    ConnectionEnd::Closed if !options.permanent => {
                        info!(peer = %handle.identity, "outbound connection closed");
                        return;
                    }
                    ConnectionEnd::Failed(err) if !options.permanent => {
                        warn!(peer = %handle.identity, error = %err, "outbound connection lost");
                        return;
                    }
                    ConnectionEnd::Closed => {
                        warn!(peer = %handle.identity, %addr, "connection closed, reconnecting");
                    }
                    ConnectionEnd::Failed(err) => {
                        warn!(peer = %handle.identity, %addr, error = %err, "connection lost, reconnecting");
                    }
                }
            }
            Err(err) => {
                if shared.shutdown.is_cancelled() || err.is_fatal_for_connect() {
                    warn!(identity = %shared.identity, %addr, error = %err, "connect failed");
                    report(&mut ready, Err(err));
                    return;
                }

                let mut delay = (options.backoff)(attempt);
                if !options.permanent {
                    let elapsed = started.elapsed();
                    if elapsed >= options.timeout {
                        warn!(%addr, attempts = attempt, error = %err, "giving up on connect");
                        report(
                            &mut ready,
                            Err(ChannelError::ConnectTimeout {
                                addr,
                                timeout: options.timeout,
                                last_error: err.to_string(),
                            }),
                        );
                        return;
                    }
                    delay = delay.min(options.timeout - elapsed);
                }

                debug!(%addr, attempt, ?delay, error = %err, "connect attempt failed, retrying");
                tokio::select! {
                    _ = shared.shutdown.cancelled() => {
                        report(&mut ready, Err(ChannelError::Closed));
                        return;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

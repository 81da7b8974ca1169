//! Inbound side: accept loop and per-connection handshake.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parflow_frame::FrameCodec;
use parflow_transport::Listener;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};

use crate::channel::Shared;
use crate::connection::{run_connection, ConnectionEnd, ConnectionHandle, Role};
use crate::handshake::handshake_server;

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

pub(crate) async fn accept_loop(shared: Arc<Shared>, listener: Listener) {
    loop {
        let accepted = tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                debug!(identity = %shared.identity, %peer, "accepted tcp connection");
                shared.spawn(serve_inbound(shared.clone(), stream, peer));
            }
            Err(err) => {
                warn!(identity = %shared.identity, error = %err, "accept failed");
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
            }
        }
    }
    debug!(identity = %shared.identity, "accept loop stopped");
}

async fn serve_inbound(shared: Arc<Shared>, stream: TcpStream, peer_addr: SocketAddr) {
    let mut framed = Framed::new(
        stream,
        FrameCodec::new(shared.config.frame.max_handshake_payload),
    );
    let (outbound, outbound_rx) = mpsc::channel(shared.config.outbound_capacity.max(1));
    let cancel = shared.shutdown.child_token();

    let mut registered: Option<Arc<ConnectionHandle>> = None;
    let result = handshake_server(
        &mut framed,
        &shared.identity,
        &shared.config.handshake,
        |identity| {
            let handle = Arc::new(ConnectionHandle {
                id: shared.next_connection_id(),
                identity: identity.clone(),
                role: Role::Inbound,
                peer_addr,
                outbound,
                cancel,
            });
            shared
                .register(handle.clone())
                .map_err(|err| err.to_string())?;
            registered = Some(handle);
            Ok(())
        },
    )
    .await;

    let handle = match (result, registered) {
        (Ok(_), Some(handle)) => handle,
        (Ok(identity), None) => {
            error!(%identity, %peer_addr, "handshake accepted without registering connection");
            return;
        }
        (Err(err), registered) => {
            if let Some(handle) = registered {
                shared.unregister(&handle);
            }
            warn!(identity = %shared.identity, %peer_addr, error = %err, "inbound handshake failed");
            return;
        }
    };

    framed
        .codec_mut()
        .set_max_payload_size(shared.config.frame.max_payload_size);
    info!(identity = %shared.identity, peer = %handle.identity, %peer_addr, "inbound connection established");

    let end = run_connection(shared.clone(), handle.clone(), framed, outbound_rx).await;
    shared.unregister(&handle);

    match end {
        ConnectionEnd::Cancelled => {
            debug!(peer = %handle.identity, "inbound connection cancelled");
        }
        ConnectionEnd::Closed => {
            info!(peer = %handle.identity, "inbound peer closed the connection");
        }
        ConnectionEnd::Disconnected => {
            error!(peer = %handle.identity, "inbound peer sent disconnect");
        }
        ConnectionEnd::Failed(err) => {
            warn!(peer = %handle.identity, error = %err, "inbound connection failed");
        }
    }
}

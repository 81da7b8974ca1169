use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{lookup_host, TcpListener, TcpStream};
use tracing::{debug, info};

use crate::error::{Result, TransportError};

/// Listening TCP socket.
///
/// Binding to port 0 picks an ephemeral port; [`Listener::local_addr`]
/// reports the address actually bound.
#[derive(Debug)]
pub struct Listener {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Listener {
    /// Bind and listen on `addr`.
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| TransportError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| TransportError::Bind { addr, source })?;

        info!(%local_addr, "listening on tcp socket");

        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Accept the next inbound stream.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr)> {
        let (stream, peer) = self
            .listener
            .accept()
            .await
            .map_err(TransportError::Accept)?;
        stream.set_nodelay(true)?;
        debug!(%peer, "accepted connection");
        Ok((stream, peer))
    }

    /// The address this listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Transport name for diagnostics.
    pub fn transport_name(&self) -> &'static str {
        "tcp"
    }
}

/// Connect to a listening socket, bounded by `timeout`.
pub async fn connect(addr: SocketAddr, timeout: Duration) -> Result<TcpStream> {
    let stream = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(source)) => return Err(TransportError::Connect { addr, source }),
        Err(_) => return Err(TransportError::ConnectTimeout { addr, timeout }),
    };
    stream.set_nodelay(true)?;
    debug!(%addr, "connected to tcp socket");
    Ok(stream)
}

/// Resolve a `host:port` string to the first matching socket address.
pub async fn resolve(address: &str) -> Result<SocketAddr> {
    if let Ok(addr) = address.parse::<SocketAddr>() {
        return Ok(addr);
    }

    let mut addrs = lookup_host(address)
        .await
        .map_err(|err| TransportError::InvalidAddress {
            address: address.to_string(),
            reason: err.to_string(),
        })?;

    addrs.next().ok_or_else(|| TransportError::InvalidAddress {
        address: address.to_string(),
        reason: "no addresses resolved".to_string(),
    })
}

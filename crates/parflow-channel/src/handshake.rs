//! Identity exchange performed before any application traffic.
//!
//! The connecting side sends a [`HandshakeRequest`] in a `HANDSHAKE` frame;
//! the accepting side answers with a [`HandshakeResponse`] that either
//! admits the connection or carries the rejection reason.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parflow_frame::{Frame, FrameCodec, HANDSHAKE};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;

use crate::error::{ChannelError, Result};
use crate::identity::Identity;

const MAX_PROTOCOL_LEN: usize = 32;
const MAX_VERSION_LEN: usize = 16;
const MAX_IDENTITY_LEN: usize = 128;

/// Sent by the connecting side.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HandshakeRequest {
    pub protocol: String,
    pub version: String,
    pub identity: Identity,
}

/// Sent by the accepting side.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HandshakeResponse {
    pub protocol: String,
    pub version: String,
    pub identity: Identity,
    pub accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Configuration for handshake negotiation.
#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    /// Bound on the whole exchange.
    pub timeout: Duration,
    pub protocol_name: String,
    pub protocol_version: String,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            protocol_name: "parflow".to_string(),
            protocol_version: "1.0".to_string(),
        }
    }
}

/// Client side of the exchange. Returns the peer's identity.
pub async fn handshake_client<T>(
    framed: &mut Framed<T, FrameCodec>,
    local: &Identity,
    expected: Option<&Identity>,
    config: &HandshakeConfig,
) -> Result<Identity>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    validate_protocol_name(&config.protocol_name)?;
    validate_version(&config.protocol_version)?;
    validate_identity(local)?;

    let req = HandshakeRequest {
        protocol: config.protocol_name.clone(),
        version: config.protocol_version.clone(),
        identity: local.clone(),
    };

    let resp: HandshakeResponse = bounded(config.timeout, async {
        send_control_json(framed, &req).await?;
        recv_control_json(framed).await
    })
    .await?;

    if !resp.accepted {
        return Err(ChannelError::HandshakeRejected(
            resp.reason.unwrap_or_else(|| "no reason given".to_string()),
        ));
    }

    validate_identity(&resp.identity)?;
    if resp.protocol != config.protocol_name {
        return Err(ChannelError::HandshakeFailed(format!(
            "unknown protocol '{}' (expected '{}')",
            resp.protocol, config.protocol_name
        )));
    }
    if !is_version_compatible(&config.protocol_version, &resp.version)? {
        return Err(ChannelError::HandshakeFailed(format!(
            "incompatible version '{}' (local '{}')",
            resp.version, config.protocol_version
        )));
    }

    if let Some(expected) = expected {
        if expected != &resp.identity {
            return Err(ChannelError::IdentityMismatch {
                expected: expected.clone(),
                actual: resp.identity,
            });
        }
    }

    Ok(resp.identity)
}

/// Server side of the exchange. Returns the peer's identity.
///
/// `admit` runs once the request is valid; returning `Err(reason)` sends a
/// rejection carrying that reason instead of an acceptance.
pub async fn handshake_server<T, F>(
    framed: &mut Framed<T, FrameCodec>,
    local: &Identity,
    config: &HandshakeConfig,
    admit: F,
) -> Result<Identity>
where
    T: AsyncRead + AsyncWrite + Unpin,
    F: FnOnce(&Identity) -> std::result::Result<(), String>,
{
    validate_protocol_name(&config.protocol_name)?;
    validate_version(&config.protocol_version)?;

    bounded(config.timeout, async {
        let req: HandshakeRequest = recv_control_json(framed).await?;

        if let Err(reason) = check_request(&req, config) {
            reject(framed, local, config, &reason).await?;
            return Err(ChannelError::HandshakeFailed(reason));
        }

        if let Err(reason) = admit(&req.identity) {
            reject(framed, local, config, &reason).await?;
            return Err(ChannelError::HandshakeRejected(reason));
        }

        let resp = HandshakeResponse {
            protocol: config.protocol_name.clone(),
            version: config.protocol_version.clone(),
            identity: local.clone(),
            accepted: true,
            reason: None,
        };
        send_control_json(framed, &resp).await?;
        Ok(req.identity)
    })
    .await
}

fn check_request(req: &HandshakeRequest, config: &HandshakeConfig) -> std::result::Result<(), String> {
    validate_protocol_name(&req.protocol).map_err(|e| e.to_string())?;
    validate_version(&req.version).map_err(|e| e.to_string())?;
    validate_identity(&req.identity).map_err(|e| e.to_string())?;

    if req.protocol != config.protocol_name {
        return Err(format!(
            "unknown protocol '{}' (expected '{}')",
            req.protocol, config.protocol_name
        ));
    }
    match is_version_compatible(&req.version, &config.protocol_version) {
        Ok(true) => Ok(()),
        Ok(false) => Err(format!(
            "incompatible version '{}' (server '{}')",
            req.version, config.protocol_version
        )),
        Err(err) => Err(err.to_string()),
    }
}

async fn reject<T>(
    framed: &mut Framed<T, FrameCodec>,
    local: &Identity,
    config: &HandshakeConfig,
    reason: &str,
) -> Result<()>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let resp = HandshakeResponse {
        protocol: config.protocol_name.clone(),
        version: config.protocol_version.clone(),
        identity: local.clone(),
        accepted: false,
        reason: Some(reason.to_string()),
    };
    send_control_json(framed, &resp).await
}

async fn bounded<F, T>(timeout: Duration, fut: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(ChannelError::Timeout(timeout)),
    }
}

async fn send_control_json<T, V>(framed: &mut Framed<T, FrameCodec>, value: &V) -> Result<()>
where
    T: AsyncRead + AsyncWrite + Unpin,
    V: Serialize,
{
    let payload = serde_json::to_vec(value)?;
    framed.send(Frame::new(HANDSHAKE, payload)).await?;
    Ok(())
}

async fn recv_control_json<T, V>(framed: &mut Framed<T, FrameCodec>) -> Result<V>
where
    T: AsyncRead + AsyncWrite + Unpin,
    V: DeserializeOwned,
{
    match framed.next().await {
        Some(Ok(frame)) if frame.kind == HANDSHAKE => Ok(serde_json::from_slice(&frame.payload)?),
        Some(Ok(frame)) => Err(ChannelError::HandshakeFailed(format!(
            "expected HANDSHAKE frame {}, got {}",
            HANDSHAKE, frame.kind
        ))),
        Some(Err(err)) => Err(ChannelError::Frame(err)),
        None => Err(ChannelError::Disconnected(
            "connection closed during handshake".to_string(),
        )),
    }
}

fn validate_protocol_name(protocol: &str) -> Result<()> {
    if protocol.is_empty() || protocol.len() > MAX_PROTOCOL_LEN {
        return Err(ChannelError::HandshakeFailed(format!(
            "invalid protocol name length: {}",
            protocol.len()
        )));
    }
    Ok(())
}

fn validate_version(version: &str) -> Result<()> {
    if version.is_empty() || version.len() > MAX_VERSION_LEN {
        return Err(ChannelError::HandshakeFailed(format!(
            "invalid protocol version length: {}",
            version.len()
        )));
    }
    let _ = parse_version(version)?;
    Ok(())
}

fn validate_identity(identity: &Identity) -> Result<()> {
    let len = identity.as_str().len();
    if len == 0 || len > MAX_IDENTITY_LEN {
        return Err(ChannelError::HandshakeFailed(format!(
            "invalid identity length: {len}"
        )));
    }
    Ok(())
}

fn is_version_compatible(client_version: &str, server_version: &str) -> Result<bool> {
    let (client_major, client_minor) = parse_version(client_version)?;
    let (server_major, server_minor) = parse_version(server_version)?;

    Ok(client_major == server_major && client_minor >= server_minor)
}

fn parse_version(version: &str) -> Result<(u16, u16)> {
    let invalid = |why: &str| ChannelError::HandshakeFailed(format!("invalid version '{version}': {why}"));

    let mut parts = version.split('.');
    let major = parts.next().ok_or_else(|| invalid("missing major"))?;
    let minor = parts.next().ok_or_else(|| invalid("missing minor"))?;
    if parts.next().is_some() {
        return Err(invalid("expected '<major>.<minor>'"));
    }

    let major = major.parse::<u16>().map_err(|_| invalid("non-numeric major"))?;
    let minor = minor.parse::<u16>().map_err(|_| invalid("non-numeric minor"))?;
    Ok((major, minor))
}

#[cfg(test)]
mod tests {
    use tokio::io::DuplexStream;

    use super::*;

    fn pair() -> (
        Framed<DuplexStream, FrameCodec>,
        Framed<DuplexStream, FrameCodec>,
    ) {
        let (left, right) = tokio::io::duplex(16 * 1024);
        (
            Framed::new(left, FrameCodec::default()),
            Framed::new(right, FrameCodec::default()),
        )
    }

    #[tokio::test]
    async fn successful_handshake_exchanges_identities() {
        let (mut client, mut server) = pair();
        let server_task = tokio::spawn(async move {
            handshake_server(
                &mut server,
                &Identity::new("server"),
                &HandshakeConfig::default(),
                |_| Ok(()),
            )
            .await
        });

        let peer = handshake_client(
            &mut client,
            &Identity::new("client"),
            None,
            &HandshakeConfig::default(),
        )
        .await
        .unwrap();

        assert_eq!(peer, Identity::new("server"));
        assert_eq!(server_task.await.unwrap().unwrap(), Identity::new("client"));
    }

    #[tokio::test]
    async fn expected_identity_mismatch_fails_client() {
        let (mut client, mut server) = pair();
        let server_task = tokio::spawn(async move {
            handshake_server(
                &mut server,
                &Identity::new("server-a"),
                &HandshakeConfig::default(),
                |_| Ok(()),
            )
            .await
        });

        let err = handshake_client(
            &mut client,
            &Identity::new("client"),
            Some(&Identity::new("server-b")),
            &HandshakeConfig::default(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, ChannelError::IdentityMismatch { .. }));
        assert!(err.is_fatal_for_connect());
        server_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn admission_refusal_is_reported_to_both_sides() {
        let (mut client, mut server) = pair();
        let server_task = tokio::spawn(async move {
            handshake_server(
                &mut server,
                &Identity::new("server"),
                &HandshakeConfig::default(),
                |identity| Err(format!("duplicate identity '{identity}'")),
            )
            .await
        });

        let err = handshake_client(
            &mut client,
            &Identity::new("client"),
            None,
            &HandshakeConfig::default(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, ChannelError::HandshakeRejected(reason) if reason.contains("duplicate")));
        assert!(matches!(
            server_task.await.unwrap(),
            Err(ChannelError::HandshakeRejected(_))
        ));
    }

    #[tokio::test]
    async fn wrong_protocol_name_rejected() {
        let (mut client, mut server) = pair();
        let server_task = tokio::spawn(async move {
            handshake_server(
                &mut server,
                &Identity::new("server"),
                &HandshakeConfig::default(),
                |_| Ok(()),
            )
            .await
        });

        let cfg = HandshakeConfig {
            protocol_name: "foobar".to_string(),
            ..HandshakeConfig::default()
        };
        let err = handshake_client(&mut client, &Identity::new("client"), None, &cfg)
            .await
            .unwrap_err();

        assert!(matches!(err, ChannelError::HandshakeRejected(_)));
        assert!(matches!(
            server_task.await.unwrap(),
            Err(ChannelError::HandshakeFailed(_))
        ));
    }

    #[tokio::test]
    async fn version_mismatch_rejected() {
        let (mut client, mut server) = pair();
        let server_task = tokio::spawn(async move {
            let cfg = HandshakeConfig {
                protocol_version: "2.0".to_string(),
                ..HandshakeConfig::default()
            };
            handshake_server(&mut server, &Identity::new("server"), &cfg, |_| Ok(())).await
        });

        let err = handshake_client(
            &mut client,
            &Identity::new("client"),
            None,
            &HandshakeConfig::default(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, ChannelError::HandshakeRejected(reason) if reason.contains("incompatible")));
        assert!(server_task.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn invalid_json_rejected() {
        let (mut client, mut server) = pair();
        client
            .send(Frame::new(HANDSHAKE, &b"{not-json"[..]))
            .await
            .unwrap();

        let err = handshake_server(
            &mut server,
            &Identity::new("server"),
            &HandshakeConfig::default(),
            |_| Ok(()),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ChannelError::Json(_)));
    }

    #[tokio::test]
    async fn silent_peer_times_out() {
        let (mut client, _server) = pair();
        let cfg = HandshakeConfig {
            timeout: Duration::from_millis(25),
            ..HandshakeConfig::default()
        };

        let err = handshake_client(&mut client, &Identity::new("client"), None, &cfg)
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::Timeout(_)));
    }

    #[tokio::test]
    async fn closed_peer_is_disconnected() {
        let (mut client, server) = pair();
        drop(server);

        let err = handshake_client(
            &mut client,
            &Identity::new("client"),
            None,
            &HandshakeConfig::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            ChannelError::Disconnected(_) | ChannelError::Frame(_)
        ));
    }

    #[test]
    fn version_parsing() {
        assert_eq!(parse_version("1.2").unwrap(), (1, 2));
        assert!(parse_version("1").is_err());
        assert!(parse_version("1.2.3").is_err());
        assert!(parse_version("a.b").is_err());
        assert!(is_version_compatible("1.3", "1.2").unwrap());
        assert!(!is_version_compatible("1.1", "1.2").unwrap());
        assert!(!is_version_compatible("2.0", "1.0").unwrap());
    }
}

//! Handshake negotiation
//!
//! Phase one allocates a session id over a short-poll request. Phase two
//! opens the duplex channel, proves it with a PING/PONG probe and promotes
//! the session with UPGRADE followed by the application CONNECT.

use super::{Channel, Connector, SessionConfig, SessionError, SessionResult};
use crate::protocol::{decode_handshake, Frame, FrameType, HandshakeInfo, Packet, PROBE};

/// Run the short-poll handshake and parse the OPEN frame
pub async fn request_handshake(
    connector: &dyn Connector,
    config: &SessionConfig,
    token: &str,
) -> SessionResult<HandshakeInfo> {
    let url = config.handshake_url(token);
    tracing::debug!("Handshake request to {}", config.url);

    let response = connector
        .poll(&url)
        .await
        .map_err(|e| SessionError::Handshake(format!("request failed: {}", e)))?;

    if !response.is_success() {
        return Err(SessionError::Handshake(format!(
            "unexpected status {}",
            response.status
        )));
    }

    let info = decode_handshake(&response.body)
        .map_err(|e| SessionError::Handshake(e.to_string()))?;

    if !info.upgrades.is_empty() && !info.upgrades.iter().any(|u| u == "websocket") {
        tracing::warn!(sid = %info.sid, "Peer does not advertise a websocket upgrade: {:?}", info.upgrades);
    }

    Ok(info)
}

/// Open the duplex channel for `sid` and wait for the probe to be echoed
pub async fn open_and_probe(
    connector: &dyn Connector,
    config: &SessionConfig,
    sid: &str,
    token: &str,
) -> SessionResult<Box<dyn Channel>> {
    let url = config.upgrade_url(sid, token);
    let mut channel = connector.open(&url).await?;

    channel.send(Frame::ping(Some(PROBE)).encode()).await?;

    loop {
        let text = match channel.recv().await {
            Some(result) => result?,
            None => {
                return Err(SessionError::ChannelClosed(
                    "closed before probe confirmation".to_string(),
                ))
            }
        };

        match Frame::decode(&text) {
            Ok(frame) if frame.kind == FrameType::Pong && frame.payload_str() == PROBE => {
                tracing::debug!(sid, "Probe confirmed");
                return Ok(channel);
            }
            Ok(frame) => {
                tracing::debug!(sid, "Ignoring {:?} frame while probing", frame.kind);
            }
            Err(e) => {
                tracing::warn!(sid, "Dropping malformed frame while probing: {}", e);
            }
        }
    }
}

/// Commit to the channel and open the application session in one burst
pub async fn promote(channel: &mut dyn Channel) -> SessionResult<()> {
    channel.send(Frame::empty(FrameType::Upgrade).encode()).await?;
    channel
        .send(Frame::message(&Packet::connect(None)).encode())
        .await?;
    Ok(())
}

//! Network module - Client side of the real-time transport
//!
//! Provides:
//! - Transport seam (short-poll request + duplex channel) over HTTP/WebSocket
//! - Handshake negotiation and transport promotion
//! - Session lifecycle, heartbeat, ack correlation and event dispatch

mod connection;
mod correlator;
mod dispatcher;
mod handshake;
mod session;
mod transport;

pub use connection::*;
pub use correlator::*;
pub use dispatcher::*;
pub use handshake::*;
pub use session::*;
pub use transport::*;

use std::time::Duration;
use url::Url;

use crate::protocol::{DEFAULT_VERSION_PARAM, PROTOCOL_VERSION};

/// Configuration for a single session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Handshake endpoint, e.g. `http://localhost:3000/socket.io/`
    pub url: Url,
    /// Query key carrying the protocol revision
    pub version_param: String,
    /// Budget for handshake, probe and CONNECT reply together
    pub connect_timeout: Duration,
    /// Default deadline for acknowledged events
    pub ack_timeout: Duration,
    /// Capacity of the outbound frame queue
    pub outbound_queue: usize,
}

impl SessionConfig {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            version_param: DEFAULT_VERSION_PARAM.to_string(),
            connect_timeout: Duration::from_secs(10),
            ack_timeout: Duration::from_secs(5),
            outbound_queue: 256,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    /// Short-poll handshake URL
    pub fn handshake_url(&self, token: &str) -> Url {
        let mut url = self.url.clone();
        url.query_pairs_mut()
            .append_pair(&self.version_param, &PROTOCOL_VERSION.to_string())
            .append_pair("transport", "polling")
            .append_pair("token", token);
        url
    }

    /// Duplex channel URL for an allocated session id
    pub fn upgrade_url(&self, sid: &str, token: &str) -> Url {
        let mut url = self.url.clone();
        let scheme = match url.scheme() {
            "https" | "wss" => "wss",
            _ => "ws",
        };
        // http/https <-> ws/wss are both "special" schemes, so this cannot fail
        let _ = url.set_scheme(scheme);
        url.query_pairs_mut()
            .append_pair(&self.version_param, &PROTOCOL_VERSION.to_string())
            .append_pair("transport", "websocket")
            .append_pair("sid", sid)
            .append_pair("token", token);
        url
    }
}

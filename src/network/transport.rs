//! Transport seam
//!
//! A [`Connector`] performs the short-poll request and opens duplex
//! channels. The production implementation speaks HTTP and WebSocket; tests
//! use the in-memory implementation in [`memory`].

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use url::Url;

/// Transport errors
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

pub type TransportResult<T> = Result<T, TransportError>;

/// Response of a short-poll request
#[derive(Debug, Clone)]
pub struct PollResponse {
    pub status: u16,
    pub body: String,
}

impl PollResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Opens the two kinds of transport a session uses
#[async_trait]
pub trait Connector: Send + Sync {
    /// Issue a single request-response exchange
    async fn poll(&self, url: &Url) -> TransportResult<PollResponse>;

    /// Open a persistent duplex text channel
    async fn open(&self, url: &Url) -> TransportResult<Box<dyn Channel>>;
}

/// A persistent, ordered, bidirectional text channel
#[async_trait]
pub trait Channel: Send {
    async fn send(&mut self, text: String) -> TransportResult<()>;

    /// Next inbound text message; `None` once the channel is closed.
    /// Must be cancel-safe: the session polls it inside `select!`.
    async fn recv(&mut self) -> Option<TransportResult<String>>;

    async fn close(&mut self) -> TransportResult<()>;
}

/// HTTP short-poll + WebSocket channel
#[derive(Debug, Clone, Default)]
pub struct WsConnector {
    http: reqwest::Client,
}

impl WsConnector {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn poll(&self, url: &Url) -> TransportResult<PollResponse> {
        let response = self.http.get(url.clone()).send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        Ok(PollResponse { status, body })
    }

    async fn open(&self, url: &Url) -> TransportResult<Box<dyn Channel>> {
        let (stream, _) = connect_async(url.as_str()).await?;
        Ok(Box::new(WsChannel { stream }))
    }
}

/// WebSocket-backed channel
pub struct WsChannel {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Channel for WsChannel {
    async fn send(&mut self, text: String) -> TransportResult<()> {
        self.stream.send(Message::Text(text)).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Option<TransportResult<String>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                Ok(Message::Close(_)) => return None,
                Ok(Message::Binary(data)) => {
                    tracing::debug!("Ignoring {} byte binary message", data.len());
                }
                // Control frames are answered by tungstenite itself
                Ok(_) => {}
                Err(e) => return Some(Err(e.into())),
            }
        }
    }

    async fn close(&mut self) -> TransportResult<()> {
        self.stream.close(None).await?;
        Ok(())
    }
}

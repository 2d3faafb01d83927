//! Client session
//!
//! A [`Session`] negotiates the transport, then hands the channel to a
//! driver task that owns it for the rest of the session's life. The driver
//! is the only writer, so frames leave in the order they were queued.

use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::{
    open_and_probe, promote, request_handshake, AckCorrelator, Channel, ConnectionHandle,
    ConnectionState, ConnectionStats, Connector, EventDispatcher, EventHandler, SessionConfig,
    TransportError,
};
use crate::protocol::{Frame, FrameType, Packet, PacketType, ProtocolError};

/// Session errors
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Probe not confirmed within {0:?}")]
    ProbeTimeout(Duration),

    #[error("No CONNECT reply within {0:?}")]
    ConnectTimeout(Duration),

    #[error("Connection rejected: {0}")]
    ConnectRejected(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("No ack for request {ack_id} within {after:?}")]
    AckTimeout { ack_id: u64, after: Duration },

    #[error("Session closed with the operation outstanding")]
    Cancelled,

    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Already connected")]
    AlreadyConnected,

    #[error("Not connected")]
    NotConnected,
}

impl SessionError {
    /// Stable short name, used to attribute failures in metrics
    pub fn kind(&self) -> &'static str {
        match self {
            SessionError::Handshake(_) => "handshake",
            SessionError::ProbeTimeout(_) => "probe_timeout",
            SessionError::ConnectTimeout(_) => "connect_timeout",
            SessionError::ConnectRejected(_) => "connect_rejected",
            SessionError::Protocol(_) => "protocol",
            SessionError::AckTimeout { .. } => "ack_timeout",
            SessionError::Cancelled => "cancelled",
            SessionError::ChannelClosed(_) => "channel_closed",
            SessionError::Transport(_) => "transport",
            SessionError::AlreadyConnected => "already_connected",
            SessionError::NotConnected => "not_connected",
        }
    }
}

pub type SessionResult<T> = Result<T, SessionError>;

/// Lifecycle notifications emitted by a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The peer accepted the application CONNECT
    Connected { sid: String },
    /// The session ended
    Disconnected { reason: String },
}

/// State shared between the session and its driver task
struct Shared {
    label: String,
    state: RwLock<ConnectionState>,
    sid: RwLock<Option<String>>,
    handle: RwLock<Option<ConnectionHandle>>,
    correlator: Arc<AckCorrelator>,
    dispatcher: EventDispatcher,
    stats: ConnectionStats,
}

impl Shared {
    async fn set_state(&self, next: ConnectionState) {
        let mut state = self.state.write().await;
        tracing::debug!(session = %self.label, "{} -> {}", *state, next);
        *state = next;
    }
}

/// One logical client of the real-time layer
pub struct Session {
    config: SessionConfig,
    connector: Arc<dyn Connector>,
    shared: Arc<Shared>,
    event_tx: mpsc::Sender<SessionEvent>,
    event_rx: Mutex<Option<mpsc::Receiver<SessionEvent>>>,
    shutdown_tx: watch::Sender<bool>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Create a new, disconnected session
    pub fn new(config: SessionConfig, connector: Arc<dyn Connector>) -> Self {
        let label = uuid::Uuid::new_v4().to_string();
        Self::with_label(config, connector, label)
    }

    /// Create a session with an explicit label for logs
    pub fn with_label(config: SessionConfig, connector: Arc<dyn Connector>, label: String) -> Self {
        let (event_tx, event_rx) = mpsc::channel(16);
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            config,
            connector,
            shared: Arc::new(Shared {
                label,
                state: RwLock::new(ConnectionState::Disconnected),
                sid: RwLock::new(None),
                handle: RwLock::new(None),
                correlator: Arc::new(AckCorrelator::new()),
                dispatcher: EventDispatcher::new(),
                stats: ConnectionStats::default(),
            }),
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
            shutdown_tx,
            driver: Mutex::new(None),
        }
    }

    /// Take the lifecycle event receiver (can only be called once)
    pub fn take_event_receiver(&self) -> Option<mpsc::Receiver<SessionEvent>> {
        self.event_rx.lock().take()
    }

    /// Negotiate the transport and open the application session.
    ///
    /// Resolves once the peer answers the CONNECT, or fails on the first of
    /// CONNECT_ERROR, channel closure, `close()` or the connect timeout.
    pub async fn connect(&self, token: &str) -> SessionResult<()> {
        {
            let mut state = self.shared.state.write().await;
            if *state != ConnectionState::Disconnected {
                return Err(SessionError::AlreadyConnected);
            }
            *state = ConnectionState::HandshakePending;
        }

        self.shutdown_tx.send_replace(false);
        let mut shutdown = self.shutdown_tx.subscribe();
        let deadline = Instant::now() + self.config.connect_timeout;

        tracing::info!(session = %self.shared.label, "Connecting to {}", self.config.url);

        let result = tokio::select! {
            result = self.negotiate(token, deadline) => result,
            _ = closed(&mut shutdown) => Err(SessionError::Cancelled),
        };

        match result {
            Ok(sid) => {
                tracing::info!(session = %self.shared.label, sid = %sid, "Session connected");
                let _ = self.event_tx.try_send(SessionEvent::Connected { sid });
                Ok(())
            }
            Err(e) => {
                tracing::warn!(session = %self.shared.label, "Connect failed: {}", e);
                self.abandon_connect().await;
                Err(e)
            }
        }
    }

    async fn negotiate(&self, token: &str, deadline: Instant) -> SessionResult<String> {
        let handshake = request_handshake(self.connector.as_ref(), &self.config, token);
        let info = match tokio::time::timeout_at(deadline, handshake).await {
            Ok(result) => result?,
            Err(_) => return Err(SessionError::Handshake("timed out".to_string())),
        };

        *self.shared.sid.write().await = Some(info.sid.clone());
        self.shared.set_state(ConnectionState::ProbePending).await;

        let probe = open_and_probe(self.connector.as_ref(), &self.config, &info.sid, token);
        let mut channel = match tokio::time::timeout_at(deadline, probe).await {
            Ok(result) => result?,
            Err(_) => return Err(SessionError::ProbeTimeout(self.config.connect_timeout)),
        };

        self.shared.set_state(ConnectionState::Connected).await;
        promote(channel.as_mut()).await?;
        self.shared.stats.record_sent();
        self.shared.stats.record_sent();

        let (out_tx, out_rx) = mpsc::channel(self.config.outbound_queue);
        *self.shared.handle.write().await = Some(ConnectionHandle::new(out_tx));

        let (ready_tx, ready_rx) = oneshot::channel();
        let driver = Driver {
            channel,
            outbound: out_rx,
            shutdown: self.shutdown_tx.subscribe(),
            ready: Some(ready_tx),
            shared: self.shared.clone(),
            heartbeat_window: info.heartbeat_window(),
            events: self.event_tx.clone(),
        };
        *self.driver.lock() = Some(tokio::spawn(driver.run()));

        match tokio::time::timeout_at(deadline, ready_rx).await {
            Ok(Ok(result)) => result.map(|()| info.sid),
            Ok(Err(_)) => Err(SessionError::ChannelClosed(
                "session ended before CONNECT reply".to_string(),
            )),
            Err(_) => Err(SessionError::ConnectTimeout(self.config.connect_timeout)),
        }
    }

    /// Stop whatever a failed connect left behind
    async fn abandon_connect(&self) {
        self.shutdown_tx.send_replace(true);
        let driver = self.driver.lock().take();
        match driver {
            Some(driver) => {
                let _ = driver.await;
            }
            None => {
                *self.shared.sid.write().await = None;
                self.shared.set_state(ConnectionState::Disconnected).await;
            }
        }
    }

    /// Close the session from any task.
    ///
    /// Tears down the channel, rejects outstanding acks with
    /// [`SessionError::Cancelled`] and drops all handler registrations.
    pub async fn close(&self) -> SessionResult<()> {
        self.shutdown_tx.send_replace(true);
        let driver = self.driver.lock().take();
        if let Some(driver) = driver {
            let _ = driver.await;
        }
        Ok(())
    }

    /// Register a handler for an inbound event
    pub fn on(&self, event: &str, handler: EventHandler) {
        self.shared.dispatcher.on(event, handler);
    }

    /// Remove the first registration of `handler` for `event`
    pub fn off(&self, event: &str, handler: &EventHandler) -> bool {
        self.shared.dispatcher.off(event, handler)
    }

    /// Send an event without waiting for a reply
    pub async fn emit(&self, event: &str, args: Vec<Value>) -> SessionResult<()> {
        let handle = self.handle().await?;
        handle
            .send(Frame::message(&Packet::event(event, args, None)))
            .await
    }

    /// Send an event and wait for its ACK using the configured deadline
    pub async fn emit_with_ack(&self, event: &str, args: Vec<Value>) -> SessionResult<Vec<Value>> {
        self.emit_with_ack_timeout(event, args, self.config.ack_timeout)
            .await
    }

    /// Send an event and wait for its ACK, failing after `timeout`
    pub async fn emit_with_ack_timeout(
        &self,
        event: &str,
        args: Vec<Value>,
        timeout: Duration,
    ) -> SessionResult<Vec<Value>> {
        let handle = self.handle().await?;
        let reply = self.shared.correlator.register(timeout);
        let packet = Packet::event(event, args, Some(reply.id()));
        handle.send(Frame::message(&packet)).await?;
        reply.wait().await
    }

    async fn handle(&self) -> SessionResult<ConnectionHandle> {
        self.shared
            .handle
            .read()
            .await
            .clone()
            .ok_or(SessionError::NotConnected)
    }

    /// Get the current state
    pub async fn state(&self) -> ConnectionState {
        *self.shared.state.read().await
    }

    /// Session id assigned by the peer, once the handshake succeeded
    pub async fn sid(&self) -> Option<String> {
        self.shared.sid.read().await.clone()
    }

    pub async fn is_connected(&self) -> bool {
        self.state().await == ConnectionState::Connected
    }

    /// Acknowledged requests still in flight
    #[cfg(test)]
    pub fn pending_acks(&self) -> usize {
        self.shared.correlator.pending_count()
    }

    /// Handler registrations currently held
    #[cfg(test)]
    pub fn registrations(&self) -> usize {
        self.shared.dispatcher.registration_count()
    }

    pub fn stats(&self) -> &ConnectionStats {
        &self.shared.stats
    }
}

/// Resolves once the shutdown flag is set or its sender is gone
async fn closed(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|closed| *closed).await;
}

enum Exit {
    Requested,
    Remote(String),
    Failed(SessionError),
}

enum Flow {
    Continue,
    Heartbeat,
    Exit(Exit),
}

/// Owns the channel of a promoted session
struct Driver {
    channel: Box<dyn Channel>,
    outbound: mpsc::Receiver<Frame>,
    shutdown: watch::Receiver<bool>,
    ready: Option<oneshot::Sender<SessionResult<()>>>,
    shared: Arc<Shared>,
    heartbeat_window: Duration,
    events: mpsc::Sender<SessionEvent>,
}

impl Driver {
    async fn run(mut self) {
        let heartbeat = tokio::time::sleep(self.heartbeat_window);
        tokio::pin!(heartbeat);

        let exit = loop {
            tokio::select! {
                inbound = self.channel.recv() => {
                    match inbound {
                        Some(Ok(text)) => match self.handle_inbound(&text).await {
                            Ok(Flow::Continue) => {}
                            Ok(Flow::Heartbeat) => {
                                heartbeat.as_mut().reset(Instant::now() + self.heartbeat_window);
                            }
                            Ok(Flow::Exit(exit)) => break exit,
                            Err(e) => break Exit::Failed(e),
                        },
                        Some(Err(e)) => break Exit::Failed(e.into()),
                        None => break Exit::Remote("channel closed".to_string()),
                    }
                }

                Some(frame) = self.outbound.recv() => {
                    if let Err(e) = self.write(frame).await {
                        break Exit::Failed(e);
                    }
                }

                _ = &mut heartbeat => {
                    break Exit::Remote("ping timeout".to_string());
                }

                _ = closed(&mut self.shutdown) => {
                    break Exit::Requested;
                }
            }
        };

        self.finish(exit).await;
    }

    async fn write(&mut self, frame: Frame) -> SessionResult<()> {
        self.channel.send(frame.encode()).await?;
        self.shared.stats.record_sent();
        Ok(())
    }

    async fn handle_inbound(&mut self, text: &str) -> SessionResult<Flow> {
        self.shared.stats.record_received();

        let frame = match Frame::decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                self.drop_frame(text, &e);
                return Ok(Flow::Continue);
            }
        };

        match frame.kind {
            FrameType::Ping => {
                self.write(Frame::pong(frame.payload.as_deref())).await?;
                Ok(Flow::Heartbeat)
            }
            FrameType::Close => Ok(Flow::Exit(Exit::Remote("closed by peer".to_string()))),
            FrameType::Message => match frame.packet() {
                Ok(packet) => self.handle_packet(packet).await,
                Err(e) => {
                    self.drop_frame(text, &e);
                    Ok(Flow::Continue)
                }
            },
            FrameType::Pong | FrameType::Noop | FrameType::Open | FrameType::Upgrade => {
                tracing::debug!(session = %self.shared.label, "Ignoring {:?} frame", frame.kind);
                Ok(Flow::Continue)
            }
        }
    }

    async fn handle_packet(&mut self, packet: Packet) -> SessionResult<Flow> {
        match packet.kind {
            PacketType::Connect => {
                match self.ready.take() {
                    Some(ready) => {
                        let _ = ready.send(Ok(()));
                    }
                    None => tracing::debug!(session = %self.shared.label, "Duplicate CONNECT"),
                }
                Ok(Flow::Continue)
            }
            PacketType::ConnectError => {
                let reason = packet.error_message();
                if let Some(ready) = self.ready.take() {
                    let _ = ready.send(Err(SessionError::ConnectRejected(reason.clone())));
                }
                Ok(Flow::Exit(Exit::Remote(format!("connect error: {}", reason))))
            }
            PacketType::Disconnect => {
                Ok(Flow::Exit(Exit::Remote("disconnected by peer".to_string())))
            }
            PacketType::Event => {
                if let Some((name, args)) = packet.event_parts() {
                    tracing::debug!(session = %self.shared.label, event = name, "Inbound event");
                    if let Some(ack) = self.shared.dispatcher.dispatch(name, args, packet.ack_id) {
                        self.write(Frame::message(&ack)).await?;
                    }
                }
                Ok(Flow::Continue)
            }
            PacketType::Ack => {
                if let Some(id) = packet.ack_id {
                    self.shared.correlator.resolve(id, packet.ack_args());
                }
                Ok(Flow::Continue)
            }
        }
    }

    fn drop_frame(&self, text: &str, error: &ProtocolError) {
        self.shared.stats.record_dropped();
        tracing::warn!(
            session = %self.shared.label,
            "Dropping malformed frame {:?}: {}",
            text.chars().take(64).collect::<String>(),
            error
        );
    }

    async fn finish(mut self, exit: Exit) {
        self.shared.set_state(ConnectionState::Closing).await;

        if let Some(handle) = self.shared.handle.write().await.take() {
            handle.mark_disconnected();
        }

        if matches!(exit, Exit::Requested) {
            // Flush what callers queued before asking to close
            while let Ok(frame) = self.outbound.try_recv() {
                if self.write(frame).await.is_err() {
                    break;
                }
            }
            let _ = self
                .channel
                .send(Frame::message(&Packet::disconnect()).encode())
                .await;
            let _ = self.channel.send(Frame::empty(FrameType::Close).encode()).await;
        }
        if let Err(e) = self.channel.close().await {
            tracing::debug!(session = %self.shared.label, "Channel close failed: {}", e);
        }

        let cancelled = self.shared.correlator.cancel_all();
        self.shared.dispatcher.clear();

        let reason = match &exit {
            Exit::Requested => "close requested".to_string(),
            Exit::Remote(reason) => reason.clone(),
            Exit::Failed(e) => e.to_string(),
        };

        if let Some(ready) = self.ready.take() {
            let error = match exit {
                Exit::Requested => SessionError::Cancelled,
                Exit::Remote(reason) => SessionError::ChannelClosed(reason),
                Exit::Failed(e) => e,
            };
            let _ = ready.send(Err(error));
        }

        *self.shared.sid.write().await = None;
        self.shared.set_state(ConnectionState::Disconnected).await;

        tracing::info!(
            session = %self.shared.label,
            cancelled_acks = cancelled,
            "Session closed: {}",
            reason
        );
        let _ = self.events.try_send(SessionEvent::Disconnected { reason });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::handler;
    use crate::network::memory::{MemoryConnector, MemoryServer};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use url::Url;

    const OPEN: &str = "0{\"sid\":\"abc\",\"pingInterval\":25000,\"pingTimeout\":60000}";

    fn config() -> SessionConfig {
        SessionConfig::new(Url::parse("http://localhost:3000/socket.io/").unwrap())
    }

    fn session(body: &str, config: SessionConfig) -> (Arc<Session>, Arc<MemoryConnector>, MemoryServer) {
        let (connector, server) = MemoryConnector::new(200, body);
        let session = Arc::new(Session::new(config, connector.clone()));
        (session, connector, server)
    }

    async fn connected(body: &str, config: SessionConfig) -> (Arc<Session>, MemoryServer) {
        let (session, _connector, mut server) = self::session(body, config);
        let task = {
            let session = session.clone();
            tokio::spawn(async move { session.connect("tok").await })
        };

        assert_eq!(server.expect().await, "2probe");
        server.push("3probe");
        assert_eq!(server.expect().await, "5");
        assert_eq!(server.expect().await, "40");
        server.push("40{\"sid\":\"app\"}");

        task.await.unwrap().unwrap();
        (session, server)
    }

    async fn eventually(session: &Session, want: ConnectionState) {
        for _ in 0..200 {
            if session.state().await == want {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("session never reached {}", want);
    }

    fn ack_id_of(frame: &str) -> u64 {
        Frame::decode(frame).unwrap().packet().unwrap().ack_id.unwrap()
    }

    #[tokio::test]
    async fn test_full_negotiation() {
        let (session, connector, mut server) = session(OPEN, config());
        let mut events = session.take_event_receiver().unwrap();
        let task = {
            let session = session.clone();
            tokio::spawn(async move { session.connect("tok").await })
        };

        assert_eq!(server.expect().await, "2probe");
        assert_eq!(session.state().await, ConnectionState::ProbePending);
        assert_eq!(session.sid().await.as_deref(), Some("abc"));

        let opened = connector.opened.lock()[0].clone();
        assert_eq!(opened.scheme(), "ws");
        assert!(opened.query().unwrap().contains("sid=abc"));

        server.push("3probe");
        assert_eq!(server.expect().await, "5");
        assert_eq!(server.expect().await, "40");
        assert_eq!(session.state().await, ConnectionState::Connected);

        server.push("40");
        tokio_test::assert_ok!(task.await.unwrap());
        assert!(session.is_connected().await);
        assert_eq!(
            events.recv().await,
            Some(SessionEvent::Connected { sid: "abc".to_string() })
        );
    }

    #[tokio::test]
    async fn test_non_open_handshake_never_probes() {
        let (session, connector, _server) = session("40", config());
        let err = session.connect("tok").await.unwrap_err();

        assert!(matches!(err, SessionError::Handshake(_)));
        assert_eq!(connector.opens.load(Ordering::SeqCst), 0);
        assert_eq!(session.state().await, ConnectionState::Disconnected);
        assert!(session.sid().await.is_none());
    }

    #[tokio::test]
    async fn test_connect_twice_is_rejected() {
        let (session, _server) = connected(OPEN, config()).await;
        assert!(matches!(
            session.connect("tok").await,
            Err(SessionError::AlreadyConnected)
        ));
    }

    #[tokio::test]
    async fn test_probe_timeout() {
        let config = config().with_connect_timeout(Duration::from_millis(100));
        let (session, _connector, mut server) = session(OPEN, config);
        let task = {
            let session = session.clone();
            tokio::spawn(async move { session.connect("tok").await })
        };

        assert_eq!(server.expect().await, "2probe");
        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, SessionError::ProbeTimeout(_)));
        assert_eq!(session.state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_timeout_without_reply() {
        let config = config().with_connect_timeout(Duration::from_millis(150));
        let (session, _connector, mut server) = session(OPEN, config);
        let task = {
            let session = session.clone();
            tokio::spawn(async move { session.connect("tok").await })
        };

        assert_eq!(server.expect().await, "2probe");
        server.push("3probe");
        assert_eq!(server.expect().await, "5");
        assert_eq!(server.expect().await, "40");

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, SessionError::ConnectTimeout(_)));
        assert_eq!(session.state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_error_rejects() {
        let (session, _connector, mut server) = session(OPEN, config());
        let task = {
            let session = session.clone();
            tokio::spawn(async move { session.connect("bad").await })
        };

        assert_eq!(server.expect().await, "2probe");
        server.push("3probe");
        assert_eq!(server.expect().await, "5");
        assert_eq!(server.expect().await, "40");
        server.push("44{\"message\":\"Not authorized\"}");

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, SessionError::ConnectRejected(ref m) if m == "Not authorized"));
        assert_eq!(session.state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_channel_closed_during_connect() {
        let (session, _connector, mut server) = session(OPEN, config());
        let task = {
            let session = session.clone();
            tokio::spawn(async move { session.connect("tok").await })
        };

        assert_eq!(server.expect().await, "2probe");
        server.push("3probe");
        assert_eq!(server.expect().await, "5");
        assert_eq!(server.expect().await, "40");
        drop(server);

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, SessionError::ChannelClosed(_)));
    }

    #[tokio::test]
    async fn test_inbound_event_with_ack_id() {
        let (session, mut server) = connected(OPEN, config()).await;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        session.on(
            "chat:new",
            handler(move |args| {
                sink.lock().extend_from_slice(args);
                Ok(None)
            }),
        );

        server.push("422[\"chat:new\",{\"id\":7}]");
        assert_eq!(server.expect().await, "432");
        assert_eq!(*seen.lock(), vec![json!({"id": 7})]);
    }

    #[tokio::test]
    async fn test_inbound_event_without_ack_id() {
        let (session, mut server) = connected(OPEN, config()).await;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        session.on(
            "chat:new",
            handler(move |args| {
                sink.lock().extend_from_slice(args);
                Ok(Some(json!("unused")))
            }),
        );

        server.push("42[\"chat:new\",{\"id\":7}]");
        server.push("2");
        // The next client frame is the PONG, not an ACK
        assert_eq!(server.expect().await, "3");
        assert_eq!(*seen.lock(), vec![json!({"id": 7})]);
    }

    #[tokio::test]
    async fn test_off_removes_one_registration() {
        let (session, mut server) = connected(OPEN, config()).await;
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = {
            let calls = calls.clone();
            handler(move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(None)
            })
        };
        session.on("evt", counter.clone());
        session.on("evt", counter.clone());
        assert!(session.off("evt", &counter));

        server.push("42[\"evt\"]");
        server.push("2");
        assert_eq!(server.expect().await, "3");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_huge_ping_window_keeps_session_alive() {
        let open = "0{\"sid\":\"abc\",\"pingInterval\":18446744073709551615,\"pingTimeout\":18446744073709551615}";
        let (session, mut server) = connected(open, config()).await;

        server.push("2");
        assert_eq!(server.expect().await, "3");
        server.push("2");
        assert_eq!(server.expect().await, "3");
        assert!(session.is_connected().await);
    }

    #[tokio::test]
    async fn test_handler_reply_becomes_ack_payload() {
        let (session, mut server) = connected(OPEN, config()).await;
        session.on("whoami", handler(|_| Ok(Some(json!({"name": "bot-1"})))));

        server.push("4211[\"whoami\"]");
        assert_eq!(server.expect().await, "4311[{\"name\":\"bot-1\"}]");
    }

    #[tokio::test]
    async fn test_ping_answered_with_pong() {
        let (_session, mut server) = connected(OPEN, config()).await;
        server.push("2");
        assert_eq!(server.expect().await, "3");
        server.push("2probe");
        assert_eq!(server.expect().await, "3probe");
    }

    #[tokio::test]
    async fn test_malformed_frames_are_dropped() {
        let (session, mut server) = connected(OPEN, config()).await;
        server.push("9zzz");
        server.push("42[broken");
        server.push("2");

        assert_eq!(server.expect().await, "3");
        assert!(session.is_connected().await);
        assert_eq!(session.stats().frames_dropped(), 2);
    }

    #[tokio::test]
    async fn test_emit_with_ack_resolves() {
        let (session, mut server) = connected(OPEN, config()).await;
        let call = {
            let session = session.clone();
            tokio::spawn(async move { session.emit_with_ack("move", vec![json!(1)]).await })
        };

        let frame = server.expect().await;
        let id = ack_id_of(&frame);
        assert_eq!(frame, format!("42{}[\"move\",1]", id));

        server.push(&format!("43{}[\"ok\"]", id));
        assert_eq!(call.await.unwrap().unwrap(), vec![json!("ok")]);
        assert_eq!(session.pending_acks(), 0);
    }

    #[tokio::test]
    async fn test_back_to_back_acks_get_distinct_ids() {
        let (session, mut server) = connected(OPEN, config()).await;
        let first = {
            let session = session.clone();
            tokio::spawn(async move { session.emit_with_ack("a", vec![]).await })
        };
        let second = {
            let session = session.clone();
            tokio::spawn(async move { session.emit_with_ack("b", vec![]).await })
        };

        let one = ack_id_of(&server.expect().await);
        let two = ack_id_of(&server.expect().await);
        assert_ne!(one, two);

        // Answer out of order
        server.push(&format!("43{}[2]", two));
        server.push(&format!("43{}[1]", one));
        let results = [first.await.unwrap().unwrap(), second.await.unwrap().unwrap()];
        let mut values: Vec<_> = results.iter().map(|r| r[0].clone()).collect();
        values.sort_by_key(|v| v.as_i64());
        assert_eq!(values, vec![json!(1), json!(2)]);
    }

    #[tokio::test]
    async fn test_ack_timeout_cleans_up() {
        let (session, mut server) = connected(OPEN, config()).await;
        let err = session
            .emit_with_ack_timeout("slow", vec![], Duration::from_millis(50))
            .await
            .unwrap_err();

        assert!(matches!(err, SessionError::AckTimeout { .. }));
        assert_eq!(session.pending_acks(), 0);

        // A late ACK is ignored and the session stays up
        let id = ack_id_of(&server.expect().await);
        server.push(&format!("43{}", id));
        server.push("2");
        assert_eq!(server.expect().await, "3");
        assert!(session.is_connected().await);
    }

    #[tokio::test]
    async fn test_close_cancels_outstanding_acks() {
        let (session, mut server) = connected(OPEN, config()).await;
        session.on("chat:new", handler(|_| Ok(None)));

        let calls: Vec<_> = (0..3)
            .map(|i| {
                let session = session.clone();
                tokio::spawn(async move { session.emit_with_ack("req", vec![json!(i)]).await })
            })
            .collect();
        for _ in 0..3 {
            server.expect().await;
        }
        assert_eq!(session.pending_acks(), 3);

        // Close from a task other than the ones awaiting
        let closer = {
            let session = session.clone();
            tokio::spawn(async move { session.close().await })
        };
        closer.await.unwrap().unwrap();

        for call in calls {
            assert!(matches!(call.await.unwrap(), Err(SessionError::Cancelled)));
        }
        assert_eq!(session.pending_acks(), 0);
        assert_eq!(session.registrations(), 0);
        assert_eq!(session.state().await, ConnectionState::Disconnected);

        assert_eq!(server.expect().await, "41");
        assert_eq!(server.expect().await, "1");
    }

    #[tokio::test]
    async fn test_queued_frames_flushed_before_close() {
        let (session, mut server) = connected(OPEN, config()).await;
        session.emit("bye", vec![]).await.unwrap();
        session.close().await.unwrap();

        assert_eq!(server.expect().await, "42[\"bye\"]");
        assert_eq!(server.expect().await, "41");
        assert!(matches!(
            session.emit("late", vec![]).await,
            Err(SessionError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_peer_close_ends_session() {
        let (session, mut server) = connected(OPEN, config()).await;
        let mut events = session.take_event_receiver().unwrap();
        assert!(matches!(events.recv().await, Some(SessionEvent::Connected { .. })));

        let call = {
            let session = session.clone();
            tokio::spawn(async move { session.emit_with_ack("req", vec![]).await })
        };
        server.expect().await;
        server.push("1");

        assert!(matches!(call.await.unwrap(), Err(SessionError::Cancelled)));
        eventually(&session, ConnectionState::Disconnected).await;
        assert_eq!(
            events.recv().await,
            Some(SessionEvent::Disconnected { reason: "closed by peer".to_string() })
        );
    }

    #[tokio::test]
    async fn test_heartbeat_expiry_closes_session() {
        let open = "0{\"sid\":\"abc\",\"pingInterval\":60,\"pingTimeout\":40}";
        let (session, mut server) = connected(open, config()).await;

        // Pings keep the session alive past the window
        for _ in 0..3 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            server.push("2");
            assert_eq!(server.expect().await, "3");
        }
        assert!(session.is_connected().await);

        eventually(&session, ConnectionState::Disconnected).await;
    }

    #[tokio::test]
    async fn test_close_when_disconnected_is_noop() {
        let (session, _connector, _server) = session(OPEN, config());
        session.close().await.unwrap();
        assert_eq!(session.state().await, ConnectionState::Disconnected);
    }
}

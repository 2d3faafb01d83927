//! Connection state and the outbound handle shared with callers

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use super::SessionError;
use crate::protocol::Frame;

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No transport; `connect` may be called
    Disconnected,
    /// Short-poll handshake in flight
    HandshakePending,
    /// Duplex channel open, waiting for the probe PONG
    ProbePending,
    /// Transport promoted; application traffic flows
    Connected,
    /// Tearing down the channel and pending work
    Closing,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::HandshakePending => "handshake-pending",
            ConnectionState::ProbePending => "probe-pending",
            ConnectionState::Connected => "connected",
            ConnectionState::Closing => "closing",
        };
        f.write_str(name)
    }
}

/// Per-session traffic counters
#[derive(Debug, Default)]
pub struct ConnectionStats {
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    frames_dropped: AtomicU64,
}

impl ConnectionStats {
    pub fn record_sent(&self) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }

    pub fn frames_received(&self) -> u64 {
        self.frames_received.load(Ordering::Relaxed)
    }

    /// Malformed frames that were logged and skipped
    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped.load(Ordering::Relaxed)
    }
}

/// A handle for queueing frames onto a session's channel
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    sender: mpsc::Sender<Frame>,
    connected: Arc<AtomicBool>,
}

impl ConnectionHandle {
    pub fn new(sender: mpsc::Sender<Frame>) -> Self {
        Self {
            sender,
            connected: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Queue a frame; frames are written in the order they are queued
    pub async fn send(&self, frame: Frame) -> Result<(), SessionError> {
        if !self.is_connected() {
            return Err(SessionError::NotConnected);
        }

        self.sender
            .send(frame)
            .await
            .map_err(|_| SessionError::ChannelClosed("send queue closed".to_string()))
    }

    /// Check if the channel is still accepting frames
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Mark the channel as gone
    pub fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}

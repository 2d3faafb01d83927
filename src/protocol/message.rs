//! Protocol message definitions
//!
//! Defines the outer transport frames and the inner event packets.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outer transport frame types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    Open = 0,
    Close = 1,
    Ping = 2,
    Pong = 3,
    Message = 4,
    Upgrade = 5,
    Noop = 6,
}

impl FrameType {
    pub const ALL: [FrameType; 7] = [
        FrameType::Open,
        FrameType::Close,
        FrameType::Ping,
        FrameType::Pong,
        FrameType::Message,
        FrameType::Upgrade,
        FrameType::Noop,
    ];

    /// Wire digit for this frame type
    pub fn as_char(self) -> char {
        char::from(b'0' + self as u8)
    }

    pub fn from_char(c: char) -> Option<Self> {
        match c {
            '0' => Some(FrameType::Open),
            '1' => Some(FrameType::Close),
            '2' => Some(FrameType::Ping),
            '3' => Some(FrameType::Pong),
            '4' => Some(FrameType::Message),
            '5' => Some(FrameType::Upgrade),
            '6' => Some(FrameType::Noop),
            _ => None,
        }
    }
}

/// A transport frame: type plus optional opaque payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameType,
    /// Never `Some("")`; an empty payload is `None`
    pub payload: Option<String>,
}

impl Frame {
    pub fn new(kind: FrameType, payload: Option<String>) -> Self {
        Self {
            kind,
            payload: payload.filter(|p| !p.is_empty()),
        }
    }

    pub fn empty(kind: FrameType) -> Self {
        Self { kind, payload: None }
    }

    pub fn ping(payload: Option<&str>) -> Self {
        Self::new(FrameType::Ping, payload.map(str::to_string))
    }

    pub fn pong(payload: Option<&str>) -> Self {
        Self::new(FrameType::Pong, payload.map(str::to_string))
    }

    /// Wrap an inner packet in a MESSAGE frame
    pub fn message(packet: &Packet) -> Self {
        Self {
            kind: FrameType::Message,
            payload: Some(packet.encode()),
        }
    }

    pub fn payload_str(&self) -> &str {
        self.payload.as_deref().unwrap_or("")
    }
}

/// Inner event packet types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    Connect = 0,
    Disconnect = 1,
    Event = 2,
    Ack = 3,
    ConnectError = 4,
}

impl PacketType {
    pub const ALL: [PacketType; 5] = [
        PacketType::Connect,
        PacketType::Disconnect,
        PacketType::Event,
        PacketType::Ack,
        PacketType::ConnectError,
    ];

    pub fn as_char(self) -> char {
        char::from(b'0' + self as u8)
    }

    pub fn from_char(c: char) -> Option<Self> {
        match c {
            '0' => Some(PacketType::Connect),
            '1' => Some(PacketType::Disconnect),
            '2' => Some(PacketType::Event),
            '3' => Some(PacketType::Ack),
            '4' => Some(PacketType::ConnectError),
            _ => None,
        }
    }
}

/// An event packet multiplexed inside a MESSAGE frame
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub kind: PacketType,
    /// Correlation id pairing a request with its ACK
    pub ack_id: Option<u64>,
    /// JSON payload; an array led by the event name for EVENT packets
    pub data: Option<Value>,
}

impl Packet {
    pub fn connect(data: Option<Value>) -> Self {
        Self {
            kind: PacketType::Connect,
            ack_id: None,
            data,
        }
    }

    pub fn disconnect() -> Self {
        Self {
            kind: PacketType::Disconnect,
            ack_id: None,
            data: None,
        }
    }

    /// Build an EVENT packet: `[name, args...]`
    pub fn event(name: &str, args: Vec<Value>, ack_id: Option<u64>) -> Self {
        let mut items = Vec::with_capacity(args.len() + 1);
        items.push(Value::String(name.to_string()));
        items.extend(args);
        Self {
            kind: PacketType::Event,
            ack_id,
            data: Some(Value::Array(items)),
        }
    }

    /// Build an ACK packet; an empty argument list is sent without payload
    pub fn ack(id: u64, args: Vec<Value>) -> Self {
        Self {
            kind: PacketType::Ack,
            ack_id: Some(id),
            data: if args.is_empty() {
                None
            } else {
                Some(Value::Array(args))
            },
        }
    }

    /// Event name and arguments of an EVENT packet
    pub fn event_parts(&self) -> Option<(&str, &[Value])> {
        if self.kind != PacketType::Event {
            return None;
        }
        match &self.data {
            Some(Value::Array(items)) => match items.split_first() {
                Some((Value::String(name), rest)) => Some((name.as_str(), rest)),
                _ => None,
            },
            _ => None,
        }
    }

    /// ACK arguments as a list (empty when the ACK had no payload)
    pub fn ack_args(&self) -> Vec<Value> {
        match &self.data {
            Some(Value::Array(items)) => items.clone(),
            Some(other) => vec![other.clone()],
            None => Vec::new(),
        }
    }

    /// Human-readable reason carried by CONNECT_ERROR
    pub fn error_message(&self) -> String {
        match &self.data {
            Some(Value::Object(map)) => map
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| Value::Object(map.clone()).to_string()),
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => "connection refused".to_string(),
        }
    }
}

/// Upper bound on the heartbeat window, whatever the peer announces
pub const MAX_HEARTBEAT_WINDOW: std::time::Duration = std::time::Duration::from_secs(24 * 60 * 60);

fn default_ping_interval() -> u64 {
    25_000
}

fn default_ping_timeout() -> u64 {
    20_000
}

/// Session parameters announced in the OPEN frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeInfo {
    /// Session id assigned by the peer
    pub sid: String,
    /// Transports the session may be upgraded to
    #[serde(default)]
    pub upgrades: Vec<String>,
    /// Interval between server PINGs (ms)
    #[serde(default = "default_ping_interval")]
    pub ping_interval: u64,
    /// Grace period after a missed PING (ms)
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout: u64,
    #[serde(default)]
    pub max_payload: Option<u64>,
}

impl HandshakeInfo {
    /// Time without a PING after which the peer is considered gone
    pub fn heartbeat_window(&self) -> std::time::Duration {
        let millis = self.ping_interval.saturating_add(self.ping_timeout);
        std::time::Duration::from_millis(millis).min(MAX_HEARTBEAT_WINDOW)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_frame_type_digits() {
        for digit in '0'..='6' {
            let kind = FrameType::from_char(digit).unwrap();
            assert_eq!(kind.as_char(), digit);
        }
        assert!(FrameType::from_char('7').is_none());

        for kind in PacketType::ALL {
            assert_eq!(PacketType::from_char(kind.as_char()), Some(kind));
        }
        assert!(PacketType::from_char('5').is_none());
    }

    #[test]
    fn test_empty_payload_is_none() {
        let frame = Frame::new(FrameType::Ping, Some(String::new()));
        assert_eq!(frame.payload, None);
    }

    #[test]
    fn test_event_parts() {
        let packet = Packet::event("chat:new", vec![json!({"id": 7})], None);
        let (name, args) = packet.event_parts().unwrap();
        assert_eq!(name, "chat:new");
        assert_eq!(args, &[json!({"id": 7})]);

        assert!(Packet::ack(1, vec![]).event_parts().is_none());
    }

    #[test]
    fn test_connect_error_message() {
        let packet = Packet {
            kind: PacketType::ConnectError,
            ack_id: None,
            data: Some(json!({"message": "Not authorized"})),
        };
        assert_eq!(packet.error_message(), "Not authorized");
    }

    #[test]
    fn test_handshake_info_defaults() {
        let info: HandshakeInfo = serde_json::from_str(r#"{"sid":"abc"}"#).unwrap();
        assert_eq!(info.sid, "abc");
        assert_eq!(info.ping_interval, 25_000);
        assert_eq!(info.ping_timeout, 20_000);
        assert!(info.upgrades.is_empty());
        assert_eq!(info.heartbeat_window(), std::time::Duration::from_millis(45_000));
    }

    #[test]
    fn test_heartbeat_window_is_capped() {
        let info: HandshakeInfo = serde_json::from_value(json!({
            "sid": "abc",
            "pingInterval": u64::MAX,
            "pingTimeout": u64::MAX,
        }))
        .unwrap();
        assert_eq!(info.heartbeat_window(), MAX_HEARTBEAT_WINDOW);
    }
}

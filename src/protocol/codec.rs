//! Protocol codec for encoding/decoding frames and packets
//!
//! Both envelopes are text: a type digit followed directly by the payload.

use serde_json::Value;
use thiserror::Error;

use super::{Frame, FrameType, HandshakeInfo, Packet, PacketType, RECORD_SEPARATOR};

/// Codec errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Empty frame")]
    Empty,

    #[error("Unknown frame type: {0:?}")]
    UnknownFrameType(char),

    #[error("Unknown packet type: {0:?}")]
    UnknownPacketType(char),

    #[error("Invalid ack id: {0}")]
    InvalidAckId(String),

    #[error("Invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Malformed packet: {0}")]
    Malformed(&'static str),

    #[error("Expected {expected:?} frame, got {actual:?}")]
    UnexpectedFrame { expected: FrameType, actual: FrameType },
}

pub type ProtocolResult<T> = Result<T, ProtocolError>;

impl Frame {
    /// Encode into wire text
    pub fn encode(&self) -> String {
        let payload = self.payload_str();
        let mut out = String::with_capacity(1 + payload.len());
        out.push(self.kind.as_char());
        out.push_str(payload);
        out
    }

    /// Decode wire text into a frame
    pub fn decode(text: &str) -> ProtocolResult<Self> {
        let mut chars = text.chars();
        let selector = chars.next().ok_or(ProtocolError::Empty)?;
        let kind = FrameType::from_char(selector).ok_or(ProtocolError::UnknownFrameType(selector))?;
        Ok(Frame::new(kind, Some(chars.as_str().to_string())))
    }

    /// Decode the inner packet of a MESSAGE frame
    pub fn packet(&self) -> ProtocolResult<Packet> {
        if self.kind != FrameType::Message {
            return Err(ProtocolError::UnexpectedFrame {
                expected: FrameType::Message,
                actual: self.kind,
            });
        }
        Packet::decode(self.payload_str())
    }
}

impl Packet {
    /// Encode into the MESSAGE frame payload
    pub fn encode(&self) -> String {
        let mut out = String::new();
        out.push(self.kind.as_char());
        if let Some(id) = self.ack_id {
            out.push_str(&id.to_string());
        }
        if let Some(data) = &self.data {
            out.push_str(&data.to_string());
        }
        out
    }

    /// Decode a MESSAGE frame payload.
    ///
    /// A run of digits after the type is only an ack id when it is followed
    /// by `[` or ends the packet; otherwise it belongs to the JSON body.
    pub fn decode(text: &str) -> ProtocolResult<Self> {
        let mut chars = text.chars();
        let selector = chars.next().ok_or(ProtocolError::Empty)?;
        let kind =
            PacketType::from_char(selector).ok_or(ProtocolError::UnknownPacketType(selector))?;
        let rest = chars.as_str();

        let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
        let is_id = digits > 0 && matches!(rest.as_bytes().get(digits), None | Some(b'['));
        let (ack_id, body) = if is_id {
            let raw = &rest[..digits];
            let id = raw
                .parse::<u64>()
                .map_err(|_| ProtocolError::InvalidAckId(raw.to_string()))?;
            (Some(id), &rest[digits..])
        } else {
            (None, rest)
        };

        let data = if body.is_empty() {
            None
        } else {
            Some(serde_json::from_str::<Value>(body)?)
        };

        let packet = Packet { kind, ack_id, data };
        packet.validate()?;
        Ok(packet)
    }

    fn validate(&self) -> ProtocolResult<()> {
        match self.kind {
            PacketType::Event if self.event_parts().is_none() => Err(ProtocolError::Malformed(
                "EVENT payload must be an array led by the event name",
            )),
            PacketType::Ack if self.ack_id.is_none() => {
                Err(ProtocolError::Malformed("ACK without id"))
            }
            _ => Ok(()),
        }
    }
}

/// Parse a short-poll handshake body into the announced session parameters.
///
/// Only the first of several record-separated frames is considered.
pub fn decode_handshake(body: &str) -> ProtocolResult<HandshakeInfo> {
    let first = body.split(RECORD_SEPARATOR).next().unwrap_or("");
    let frame = Frame::decode(first)?;
    if frame.kind != FrameType::Open {
        return Err(ProtocolError::UnexpectedFrame {
            expected: FrameType::Open,
            actual: frame.kind,
        });
    }
    Ok(serde_json::from_str(frame.payload_str())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_frame_roundtrip() {
        let frames = vec![
            Frame::empty(FrameType::Open),
            Frame::empty(FrameType::Close),
            Frame::ping(Some("probe")),
            Frame::pong(None),
            Frame::message(&Packet::connect(None)),
            Frame::empty(FrameType::Upgrade),
            Frame::empty(FrameType::Noop),
        ];

        for frame in frames {
            let decoded = Frame::decode(&frame.encode()).unwrap();
            assert_eq!(decoded, frame);
        }
    }

    #[test]
    fn test_frame_wire_text() {
        assert_eq!(Frame::ping(Some("probe")).encode(), "2probe");
        assert_eq!(Frame::empty(FrameType::Upgrade).encode(), "5");
        assert_eq!(Frame::message(&Packet::connect(None)).encode(), "40");
    }

    #[test]
    fn test_frame_decode_errors() {
        assert!(matches!(Frame::decode(""), Err(ProtocolError::Empty)));
        assert!(matches!(
            Frame::decode("9abc"),
            Err(ProtocolError::UnknownFrameType('9'))
        ));
    }

    #[test]
    fn test_packet_roundtrip_with_and_without_id() {
        let packets = vec![
            Packet::event("chat:new", vec![json!({"id": 7})], None),
            Packet::event("chat:new", vec![json!({"id": 7})], Some(0)),
            Packet::event("join", vec![], Some(12)),
            Packet::ack(2, vec![]),
            Packet::ack(3, vec![json!("ok"), json!(1)]),
            Packet::connect(None),
            Packet::connect(Some(json!({"sid": "xyz"}))),
            Packet::disconnect(),
        ];

        for packet in packets {
            let decoded = Packet::decode(&packet.encode()).unwrap();
            assert_eq!(decoded, packet);
        }
    }

    #[test]
    fn test_ack_id_scanning() {
        let packet = Packet::decode("2[\"chat:new\",{\"id\":7}]").unwrap();
        assert_eq!(packet.ack_id, None);

        let packet = Packet::decode("22[\"chat:new\",{\"id\":7}]").unwrap();
        assert_eq!(packet.kind, PacketType::Event);
        assert_eq!(packet.ack_id, Some(2));

        let packet = Packet::decode("32").unwrap();
        assert_eq!(packet.kind, PacketType::Ack);
        assert_eq!(packet.ack_id, Some(2));
        assert_eq!(packet.data, None);

        let packet = Packet::decode("310[\"ok\"]").unwrap();
        assert_eq!(packet.ack_id, Some(10));
        assert_eq!(packet.ack_args(), vec![json!("ok")]);
    }

    #[test]
    fn test_digits_not_followed_by_array_stay_in_body() {
        let packet = Packet::decode("0{\"sid\":\"x\"}").unwrap();
        assert_eq!(packet.ack_id, None);
        assert_eq!(packet.data, Some(json!({"sid": "x"})));

        // "5{}" is parsed as JSON, which fails on the trailing object
        assert!(matches!(Packet::decode("05{}"), Err(ProtocolError::Json(_))));

        let packet = Packet::decode("4{\"message\":\"nope\"}").unwrap();
        assert_eq!(packet.kind, PacketType::ConnectError);
        assert_eq!(packet.ack_id, None);
        assert_eq!(packet.error_message(), "nope");

        let err = Packet::decode("112{").unwrap_err();
        assert!(matches!(err, ProtocolError::Json(_)));
    }

    #[test]
    fn test_packet_decode_errors() {
        assert!(matches!(Packet::decode(""), Err(ProtocolError::Empty)));
        assert!(matches!(
            Packet::decode("7[]"),
            Err(ProtocolError::UnknownPacketType('7'))
        ));
        assert!(matches!(Packet::decode("2[oops"), Err(ProtocolError::Json(_))));
        assert!(matches!(
            Packet::decode("2[1,2]"),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(Packet::decode("3"), Err(ProtocolError::Malformed(_))));
        assert!(matches!(
            Packet::decode("299999999999999999999999[\"x\"]"),
            Err(ProtocolError::InvalidAckId(_))
        ));
    }

    #[test]
    fn test_message_frame_packet() {
        let frame = Frame::decode("432").unwrap();
        let packet = frame.packet().unwrap();
        assert_eq!(packet, Packet::ack(2, vec![]));

        let err = Frame::decode("3probe").unwrap().packet().unwrap_err();
        assert!(matches!(err, ProtocolError::UnexpectedFrame { .. }));
    }

    #[test]
    fn test_decode_handshake() {
        let info = decode_handshake(
            "0{\"sid\":\"abc\",\"upgrades\":[\"websocket\"],\"pingInterval\":25000,\"pingTimeout\":60000}",
        )
        .unwrap();
        assert_eq!(info.sid, "abc");
        assert_eq!(info.ping_timeout, 60_000);
        assert_eq!(info.upgrades, vec!["websocket".to_string()]);
    }

    #[test]
    fn test_decode_handshake_batched_body() {
        let body = "0{\"sid\":\"abc\"}\u{1e}40";
        let info = decode_handshake(body).unwrap();
        assert_eq!(info.sid, "abc");
    }

    #[test]
    fn test_decode_handshake_rejects_other_frames() {
        assert!(matches!(
            decode_handshake("40"),
            Err(ProtocolError::UnexpectedFrame { actual: FrameType::Message, .. })
        ));
        assert!(matches!(decode_handshake("0{not json"), Err(ProtocolError::Json(_))));
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        fn json_value() -> impl Strategy<Value = Value> {
            let leaf = prop_oneof![
                Just(Value::Null),
                any::<bool>().prop_map(Value::Bool),
                any::<i64>().prop_map(Value::from),
                ".*".prop_map(Value::String),
            ];
            leaf.prop_recursive(3, 24, 4, |inner| {
                prop_oneof![
                    proptest::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
                    proptest::collection::btree_map(".*", inner, 0..4)
                        .prop_map(|map| Value::Object(map.into_iter().collect())),
                ]
            })
        }

        proptest! {
            #[test]
            fn frame_roundtrip(
                kind in proptest::sample::select(FrameType::ALL.to_vec()),
                payload in ".*",
            ) {
                let frame = Frame::new(kind, Some(payload));
                prop_assert_eq!(Frame::decode(&frame.encode()).unwrap(), frame);
            }

            #[test]
            fn event_roundtrip(
                name in ".*",
                args in proptest::collection::vec(json_value(), 0..4),
                ack_id in proptest::option::of(any::<u64>()),
            ) {
                let packet = Packet::event(&name, args, ack_id);
                let frame = Frame::decode(&Frame::message(&packet).encode()).unwrap();
                prop_assert_eq!(frame.packet().unwrap(), packet);
            }

            #[test]
            fn ack_roundtrip(
                id in any::<u64>(),
                args in proptest::collection::vec(json_value(), 0..4),
            ) {
                let packet = Packet::ack(id, args.clone());
                let decoded = Packet::decode(&packet.encode()).unwrap();
                prop_assert_eq!(decoded.ack_id, Some(id));
                prop_assert_eq!(decoded.ack_args(), args);
            }
        }
    }
}

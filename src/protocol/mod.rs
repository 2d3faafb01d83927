//! Protocol module - Defines the wire format spoken over the real-time layer
//!
//! Two envelopes are nested on the wire:
//! - an outer transport frame: 1 ASCII digit frame type, then the payload
//! - an inner event packet (only inside MESSAGE frames): 1 ASCII digit packet
//!   type, an optional decimal ack id, then a JSON payload

mod message;
mod codec;

pub use message::*;
pub use codec::*;

/// Transport protocol revision sent during the handshake
pub const PROTOCOL_VERSION: u32 = 4;

/// Default query key carrying the protocol revision
pub const DEFAULT_VERSION_PARAM: &str = "protocolVersion";

/// Payload of the PING/PONG exchange that validates a fresh duplex channel
pub const PROBE: &str = "probe";

/// Separator between frames batched into one short-poll response body
pub const RECORD_SEPARATOR: char = '\u{1e}';

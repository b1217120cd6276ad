//! Wire protocol
//!
//! Message taxonomy, payload primitives, framing and the version handshake.

pub mod codec;
pub mod constants;
pub mod handshake;
pub mod message;
pub mod wire;

pub use codec::{decode, encode, encode_into, FrameDecoder};
pub use constants::{DEFAULT_MAX_FRAME_SIZE, DEFAULT_PORT, PROTOCOL_VERSION};
pub use handshake::{Handshake, HandshakeRole, Negotiated, ServerReply};
pub use message::Message;

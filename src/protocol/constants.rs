//! Protocol constants

/// Protocol version spoken by this crate (major in the high byte)
pub const PROTOCOL_VERSION: u16 = 0x0401;

/// Default TCP port
pub const DEFAULT_PORT: u16 = 5810;

/// Frame header: tag (1) + payload length (4)
pub const FRAME_HEADER_LEN: usize = 5;

/// Default upper bound on a single frame's payload
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Maximum varint length for a u64
pub const MAX_VARINT_LEN: usize = 10;

// Message tags
pub const TAG_HELLO: u8 = 0x01;
pub const TAG_HELLO_ACK: u8 = 0x02;
pub const TAG_REJECT: u8 = 0x03;
pub const TAG_ANNOUNCE: u8 = 0x10;
pub const TAG_UNANNOUNCE: u8 = 0x11;
pub const TAG_SUBSCRIBE: u8 = 0x12;
pub const TAG_UNSUBSCRIBE: u8 = 0x13;
pub const TAG_SET_PROPERTIES: u8 = 0x14;
pub const TAG_VALUE: u8 = 0x20;
pub const TAG_KEEP_ALIVE: u8 = 0x30;

// Subscriber option flags
pub const SUB_CHANGES_ONLY: u8 = 0x01;
pub const SUB_SEND_ALL: u8 = 0x02;
pub const SUB_TOPICS_ONLY: u8 = 0x04;
pub const SUB_PREFIX_MATCH: u8 = 0x08;

/// Major part of a protocol version
pub fn major(version: u16) -> u8 {
    (version >> 8) as u8
}

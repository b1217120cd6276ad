//! Message framing
//!
//! ```text
//! +--------+------------------+-------------------+
//! | tag u8 | length u32 (BE)  | payload[length]   |
//! +--------+------------------+-------------------+
//! ```
//!
//! A frame whose payload fails to decode is consumed in full, so the next
//! frame still decodes. Only an oversized length header is fatal, since the
//! frame boundary can no longer be trusted.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::CodecError;

use super::constants::*;
use super::message::Message;
use super::wire::*;

/// Encode a message into a new frame
pub fn encode(message: &Message) -> Bytes {
    let mut buf = BytesMut::with_capacity(64);
    encode_into(message, &mut buf);
    buf.freeze()
}

/// Append a message frame to `buf`
pub fn encode_into(message: &Message, buf: &mut BytesMut) {
    let start = buf.len();
    buf.put_u8(message.tag());
    buf.put_u32(0); // patched below

    encode_payload(message, buf);

    let len = (buf.len() - start - FRAME_HEADER_LEN) as u32;
    buf[start + 1..start + FRAME_HEADER_LEN].copy_from_slice(&len.to_be_bytes());
}

fn encode_payload(message: &Message, buf: &mut BytesMut) {
    match message {
        Message::Hello { version, name } => {
            buf.put_u16(*version);
            put_string(buf, name);
        }
        Message::HelloAck {
            version,
            client_id,
            server_time,
        } => {
            buf.put_u16(*version);
            put_varint(buf, *client_id);
            put_svarint(buf, *server_time);
        }
        Message::Reject {
            server_version,
            reason,
        } => {
            buf.put_u16(*server_version);
            put_string(buf, reason);
        }
        Message::Announce {
            name,
            id,
            pubuid,
            value_type,
            properties,
        } => {
            put_string(buf, name);
            put_varint(buf, *id as u64);
            put_option_u32(buf, *pubuid);
            put_value_type(buf, *value_type);
            put_properties(buf, properties);
        }
        Message::Unannounce { name, id, pubuid } => {
            put_string(buf, name);
            put_varint(buf, *id as u64);
            put_option_u32(buf, *pubuid);
        }
        Message::Subscribe {
            subuid,
            patterns,
            options,
        } => {
            put_varint(buf, *subuid as u64);
            put_varint(buf, patterns.len() as u64);
            for pattern in patterns {
                put_string(buf, pattern);
            }
            put_options(buf, options);
        }
        Message::Unsubscribe { subuid } => {
            put_varint(buf, *subuid as u64);
        }
        Message::SetProperties { name, update } => {
            put_string(buf, name);
            put_property_update(buf, update);
        }
        Message::Value {
            id,
            timestamp,
            value,
        } => {
            put_varint(buf, *id as u64);
            put_svarint(buf, *timestamp);
            put_value(buf, value);
        }
        Message::KeepAlive {
            timestamp,
            server_time,
        } => {
            put_svarint(buf, *timestamp);
            put_svarint(buf, *server_time);
        }
    }
}

/// Decode exactly one frame from `data`
///
/// Incomplete input yields `Truncated`; bytes after the frame yield
/// `TrailingBytes`.
pub fn decode(data: &[u8]) -> Result<Message, CodecError> {
    if data.len() < FRAME_HEADER_LEN {
        return Err(CodecError::Truncated);
    }

    let tag = data[0];
    let len = u32::from_be_bytes([data[1], data[2], data[3], data[4]]) as usize;
    let body = &data[FRAME_HEADER_LEN..];
    if body.len() < len {
        return Err(CodecError::Truncated);
    }
    if body.len() > len {
        return Err(CodecError::TrailingBytes(body.len() - len));
    }

    decode_payload(tag, Bytes::copy_from_slice(body))
}

/// Decode a frame payload for the given tag
pub fn decode_payload(tag: u8, mut payload: Bytes) -> Result<Message, CodecError> {
    let buf = &mut payload;
    let message = match tag {
        TAG_HELLO => Message::Hello {
            version: get_u16(buf)?,
            name: get_string(buf)?,
        },
        TAG_HELLO_ACK => Message::HelloAck {
            version: get_u16(buf)?,
            client_id: get_varint(buf)?,
            server_time: get_svarint(buf)?,
        },
        TAG_REJECT => Message::Reject {
            server_version: get_u16(buf)?,
            reason: get_string(buf)?,
        },
        TAG_ANNOUNCE => Message::Announce {
            name: get_string(buf)?,
            id: get_u32_varint(buf)?,
            pubuid: get_option_u32(buf)?,
            value_type: get_value_type(buf)?,
            properties: get_properties(buf)?,
        },
        TAG_UNANNOUNCE => Message::Unannounce {
            name: get_string(buf)?,
            id: get_u32_varint(buf)?,
            pubuid: get_option_u32(buf)?,
        },
        TAG_SUBSCRIBE => {
            let subuid = get_u32_varint(buf)?;
            let count = get_varint(buf)?;
            if count > buf.remaining() as u64 {
                return Err(CodecError::Truncated);
            }
            let patterns = (0..count)
                .map(|_| get_string(buf))
                .collect::<Result<Vec<_>, _>>()?;
            Message::Subscribe {
                subuid,
                patterns,
                options: get_options(buf)?,
            }
        }
        TAG_UNSUBSCRIBE => Message::Unsubscribe {
            subuid: get_u32_varint(buf)?,
        },
        TAG_SET_PROPERTIES => Message::SetProperties {
            name: get_string(buf)?,
            update: get_property_update(buf)?,
        },
        TAG_VALUE => Message::Value {
            id: get_u32_varint(buf)?,
            timestamp: get_svarint(buf)?,
            value: get_value(buf)?,
        },
        TAG_KEEP_ALIVE => Message::KeepAlive {
            timestamp: get_svarint(buf)?,
            server_time: get_svarint(buf)?,
        },
        other => return Err(CodecError::UnknownTag(other)),
    };

    if payload.has_remaining() {
        return Err(CodecError::TrailingBytes(payload.remaining()));
    }
    Ok(message)
}

/// Streaming frame decoder
///
/// Feed bytes with [`FrameDecoder::extend`] (or read directly into
/// [`FrameDecoder::buffer_mut`]) and pull messages with
/// [`FrameDecoder::decode`].
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: BytesMut,
    max_frame_size: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
            max_frame_size,
        }
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Buffer to read socket data into
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }

    /// Bytes buffered but not yet decoded
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Decode the next complete frame
    ///
    /// Returns `Ok(None)` until a full frame is buffered. A non-fatal error
    /// has already consumed its frame; call again to continue.
    pub fn decode(&mut self) -> Result<Option<Message>, CodecError> {
        if self.buffer.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        let tag = self.buffer[0];
        let len = u32::from_be_bytes([
            self.buffer[1],
            self.buffer[2],
            self.buffer[3],
            self.buffer[4],
        ]) as usize;

        if len > self.max_frame_size {
            return Err(CodecError::FrameTooLarge {
                len,
                max: self.max_frame_size,
            });
        }

        if self.buffer.len() < FRAME_HEADER_LEN + len {
            self.buffer.reserve(FRAME_HEADER_LEN + len - self.buffer.len());
            return Ok(None);
        }

        self.buffer.advance(FRAME_HEADER_LEN);
        let payload = self.buffer.split_to(len).freeze();
        decode_payload(tag, payload).map(Some)
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscription::SubscriberOptions;
    use crate::value::{Properties, PropertyUpdate, Value, ValueType};
    use std::time::Duration;

    fn sample_messages() -> Vec<Message> {
        let mut update = PropertyUpdate::new();
        update.insert("retained".into(), None);

        vec![
            Message::Hello {
                version: PROTOCOL_VERSION,
                name: "dashboard".into(),
            },
            Message::HelloAck {
                version: PROTOCOL_VERSION,
                client_id: 42,
                server_time: 1_700_000_000_000_000,
            },
            Message::Reject {
                server_version: PROTOCOL_VERSION,
                reason: "unsupported".into(),
            },
            Message::Announce {
                name: "/drive/speed".into(),
                id: 7,
                pubuid: Some(3),
                value_type: ValueType::Double,
                properties: Properties::retained(),
            },
            Message::Unannounce {
                name: "/drive/speed".into(),
                id: 7,
                pubuid: None,
            },
            Message::Subscribe {
                subuid: 1,
                patterns: vec!["/drive/*".into(), "/arm".into()],
                options: SubscriberOptions::new().periodic(Duration::from_millis(100)),
            },
            Message::Unsubscribe { subuid: 1 },
            Message::SetProperties {
                name: "/drive/speed".into(),
                update,
            },
            Message::Value {
                id: 7,
                timestamp: -5,
                value: Value::IntArray(vec![1, -2, 3]),
            },
            Message::KeepAlive {
                timestamp: 10,
                server_time: 0,
            },
        ]
    }

    #[test]
    fn test_every_message_decodes_back() {
        for message in sample_messages() {
            let frame = encode(&message);
            assert_eq!(frame[0], message.tag());
            assert_eq!(decode(&frame).unwrap(), message, "{}", message.kind());
        }
    }

    #[test]
    fn test_frame_header_length() {
        let frame = encode(&Message::Unsubscribe { subuid: 300 });
        assert_eq!(&frame[..], &[TAG_UNSUBSCRIBE, 0, 0, 0, 2, 0xAC, 0x02]);
    }

    #[test]
    fn test_truncated_input_never_panics() {
        for message in sample_messages() {
            let frame = encode(&message);
            for cut in 0..frame.len() {
                assert_eq!(decode(&frame[..cut]), Err(CodecError::Truncated));
            }
        }
    }

    #[test]
    fn test_payload_shorter_than_declared_fields() {
        // Header claims 1 byte, Hello needs at least 3
        let frame = [TAG_HELLO, 0, 0, 0, 1, 0x04];
        assert_eq!(decode(&frame), Err(CodecError::Truncated));
    }

    #[test]
    fn test_unknown_tag_and_trailing_bytes() {
        assert_eq!(decode(&[0x7F, 0, 0, 0, 0]), Err(CodecError::UnknownTag(0x7F)));

        let mut frame = encode(&Message::Unsubscribe { subuid: 1 }).to_vec();
        frame.push(0);
        assert_eq!(decode(&frame), Err(CodecError::TrailingBytes(1)));

        // Extra bytes inside the declared payload
        let frame = [TAG_UNSUBSCRIBE, 0, 0, 0, 2, 0x01, 0x00];
        assert_eq!(decode(&frame), Err(CodecError::TrailingBytes(1)));
    }

    #[test]
    fn test_stream_partial_frames() {
        let mut stream = BytesMut::new();
        for message in sample_messages() {
            encode_into(&message, &mut stream);
        }

        let mut decoder = FrameDecoder::new();
        let mut decoded = Vec::new();
        // Feed three bytes at a time
        for chunk in stream.chunks(3) {
            decoder.extend(chunk);
            while let Some(message) = decoder.decode().unwrap() {
                decoded.push(message);
            }
        }

        assert_eq!(decoded, sample_messages());
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_stream_resumes_after_bad_frame() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(&[0x7F, 0, 0, 0, 2, 0xAA, 0xBB]);
        decoder.extend(&encode(&Message::Unsubscribe { subuid: 9 }));

        assert_eq!(decoder.decode(), Err(CodecError::UnknownTag(0x7F)));
        assert_eq!(
            decoder.decode().unwrap(),
            Some(Message::Unsubscribe { subuid: 9 })
        );
        assert_eq!(decoder.decode().unwrap(), None);
    }

    #[test]
    fn test_stream_oversized_frame_is_fatal() {
        let mut decoder = FrameDecoder::with_max_frame_size(16);
        decoder.extend(&[TAG_VALUE, 0, 0, 1, 0]);

        let err = decoder.decode().unwrap_err();
        assert_eq!(err, CodecError::FrameTooLarge { len: 256, max: 16 });
        assert!(err.is_fatal());
    }
}

//! Payload primitives
//!
//! ```text
//! varint     LEB128, 7 bits per byte, low group first
//! svarint    zig-zag mapped varint
//! string     varint length + UTF-8 bytes
//! f32 / f64  big-endian IEEE 754
//! value      u8 type tag + body
//! ```
//!
//! Value bodies by type tag:
//!
//! ```text
//!  0 boolean   u8 (0 or 1)        16 boolean[]  varint count + u8 each
//!  1 double    f64                17 double[]   varint count + f64 each
//!  2 int       svarint            18 int[]      varint count + svarint each
//!  3 float     f32                19 float[]    varint count + f32 each
//!  4 string    string             20 string[]   varint count + string each
//!  5 raw       varint len + bytes
//! ```

use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::CodecError;
use crate::subscription::SubscriberOptions;
use crate::value::{Properties, PropertyUpdate, Value, ValueType};

use super::constants::{
    MAX_VARINT_LEN, SUB_CHANGES_ONLY, SUB_PREFIX_MATCH, SUB_SEND_ALL, SUB_TOPICS_ONLY,
};

fn ensure(buf: &Bytes, len: usize) -> Result<(), CodecError> {
    if buf.remaining() < len {
        Err(CodecError::Truncated)
    } else {
        Ok(())
    }
}

// ============================================================================
// Integers
// ============================================================================

pub fn put_varint(buf: &mut BytesMut, mut value: u64) {
    while value >= 0x80 {
        buf.put_u8((value as u8 & 0x7F) | 0x80);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

pub fn get_varint(buf: &mut Bytes) -> Result<u64, CodecError> {
    let mut value = 0u64;
    for i in 0..MAX_VARINT_LEN {
        ensure(buf, 1)?;
        let byte = buf.get_u8();
        let bits = (byte & 0x7F) as u64;

        // Tenth byte may only carry the top bit
        if i == MAX_VARINT_LEN - 1 && bits > 1 {
            return Err(CodecError::MalformedVarint);
        }

        value |= bits << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(CodecError::MalformedVarint)
}

pub fn put_svarint(buf: &mut BytesMut, value: i64) {
    put_varint(buf, ((value << 1) ^ (value >> 63)) as u64);
}

pub fn get_svarint(buf: &mut Bytes) -> Result<i64, CodecError> {
    let raw = get_varint(buf)?;
    Ok((raw >> 1) as i64 ^ -((raw & 1) as i64))
}

pub fn get_u32_varint(buf: &mut Bytes) -> Result<u32, CodecError> {
    u32::try_from(get_varint(buf)?).map_err(|_| CodecError::MalformedVarint)
}

/// Varint used as a count or length, bounded by the bytes left
fn get_len(buf: &mut Bytes, min_item_size: usize) -> Result<usize, CodecError> {
    let len = get_varint(buf)?;
    let len = usize::try_from(len).map_err(|_| CodecError::Truncated)?;
    if len.saturating_mul(min_item_size) > buf.remaining() {
        return Err(CodecError::Truncated);
    }
    Ok(len)
}

pub fn get_u8(buf: &mut Bytes) -> Result<u8, CodecError> {
    ensure(buf, 1)?;
    Ok(buf.get_u8())
}

pub fn get_u16(buf: &mut Bytes) -> Result<u16, CodecError> {
    ensure(buf, 2)?;
    Ok(buf.get_u16())
}

pub fn get_bool(buf: &mut Bytes) -> Result<bool, CodecError> {
    match get_u8(buf)? {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(CodecError::InvalidBool(other)),
    }
}

pub fn put_bool(buf: &mut BytesMut, value: bool) {
    buf.put_u8(value as u8);
}

fn get_f64(buf: &mut Bytes) -> Result<f64, CodecError> {
    ensure(buf, 8)?;
    Ok(buf.get_f64())
}

fn get_f32(buf: &mut Bytes) -> Result<f32, CodecError> {
    ensure(buf, 4)?;
    Ok(buf.get_f32())
}

// ============================================================================
// Strings and bytes
// ============================================================================

pub fn put_bytes(buf: &mut BytesMut, bytes: &[u8]) {
    put_varint(buf, bytes.len() as u64);
    buf.put_slice(bytes);
}

pub fn get_bytes(buf: &mut Bytes) -> Result<Bytes, CodecError> {
    let len = get_len(buf, 1)?;
    Ok(buf.split_to(len))
}

pub fn put_string(buf: &mut BytesMut, s: &str) {
    put_bytes(buf, s.as_bytes());
}

pub fn get_string(buf: &mut Bytes) -> Result<String, CodecError> {
    let bytes = get_bytes(buf)?;
    String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::InvalidUtf8)
}

pub fn put_option_u32(buf: &mut BytesMut, value: Option<u32>) {
    match value {
        Some(v) => {
            buf.put_u8(1);
            put_varint(buf, v as u64);
        }
        None => buf.put_u8(0),
    }
}

pub fn get_option_u32(buf: &mut Bytes) -> Result<Option<u32>, CodecError> {
    if get_bool(buf)? {
        Ok(Some(get_u32_varint(buf)?))
    } else {
        Ok(None)
    }
}

// ============================================================================
// Values
// ============================================================================

pub fn put_value_type(buf: &mut BytesMut, value_type: ValueType) {
    buf.put_u8(value_type.tag());
}

pub fn get_value_type(buf: &mut Bytes) -> Result<ValueType, CodecError> {
    let tag = get_u8(buf)?;
    ValueType::from_tag(tag).ok_or(CodecError::UnknownValueType(tag))
}

/// Write a tagged value
pub fn put_value(buf: &mut BytesMut, value: &Value) {
    put_value_type(buf, value.value_type());
    match value {
        Value::Boolean(b) => put_bool(buf, *b),
        Value::Double(d) => buf.put_f64(*d),
        Value::Int(i) => put_svarint(buf, *i),
        Value::Float(f) => buf.put_f32(*f),
        Value::String(s) => put_string(buf, s),
        Value::Raw(r) => put_bytes(buf, r),
        Value::BooleanArray(items) => {
            put_varint(buf, items.len() as u64);
            items.iter().for_each(|b| put_bool(buf, *b));
        }
        Value::DoubleArray(items) => {
            put_varint(buf, items.len() as u64);
            items.iter().for_each(|d| buf.put_f64(*d));
        }
        Value::IntArray(items) => {
            put_varint(buf, items.len() as u64);
            items.iter().for_each(|i| put_svarint(buf, *i));
        }
        Value::FloatArray(items) => {
            put_varint(buf, items.len() as u64);
            items.iter().for_each(|f| buf.put_f32(*f));
        }
        Value::StringArray(items) => {
            put_varint(buf, items.len() as u64);
            items.iter().for_each(|s| put_string(buf, s));
        }
    }
}

/// Read a tagged value
pub fn get_value(buf: &mut Bytes) -> Result<Value, CodecError> {
    let value_type = get_value_type(buf)?;
    Ok(match value_type {
        ValueType::Boolean => Value::Boolean(get_bool(buf)?),
        ValueType::Double => Value::Double(get_f64(buf)?),
        ValueType::Int => Value::Int(get_svarint(buf)?),
        ValueType::Float => Value::Float(get_f32(buf)?),
        ValueType::String => Value::String(get_string(buf)?),
        ValueType::Raw => Value::Raw(get_bytes(buf)?.to_vec()),
        ValueType::BooleanArray => {
            let len = get_len(buf, 1)?;
            Value::BooleanArray((0..len).map(|_| get_bool(buf)).collect::<Result<_, _>>()?)
        }
        ValueType::DoubleArray => {
            let len = get_len(buf, 8)?;
            Value::DoubleArray((0..len).map(|_| get_f64(buf)).collect::<Result<_, _>>()?)
        }
        ValueType::IntArray => {
            let len = get_len(buf, 1)?;
            Value::IntArray((0..len).map(|_| get_svarint(buf)).collect::<Result<_, _>>()?)
        }
        ValueType::FloatArray => {
            let len = get_len(buf, 4)?;
            Value::FloatArray((0..len).map(|_| get_f32(buf)).collect::<Result<_, _>>()?)
        }
        ValueType::StringArray => {
            let len = get_len(buf, 1)?;
            Value::StringArray((0..len).map(|_| get_string(buf)).collect::<Result<_, _>>()?)
        }
    })
}

// ============================================================================
// Properties and options
// ============================================================================

pub fn put_properties(buf: &mut BytesMut, properties: &Properties) {
    put_varint(buf, properties.len() as u64);
    for (key, value) in properties.iter() {
        put_string(buf, key);
        put_value(buf, value);
    }
}

pub fn get_properties(buf: &mut Bytes) -> Result<Properties, CodecError> {
    let len = get_len(buf, 2)?;
    let mut properties = Properties::new();
    for _ in 0..len {
        let key = get_string(buf)?;
        let value = get_value(buf)?;
        properties.insert(key, value);
    }
    Ok(properties)
}

/// Write a property update (`None` deletes the key)
pub fn put_property_update(buf: &mut BytesMut, update: &PropertyUpdate) {
    put_varint(buf, update.len() as u64);
    for (key, value) in update {
        put_string(buf, key);
        match value {
            Some(value) => {
                buf.put_u8(1);
                put_value(buf, value);
            }
            None => buf.put_u8(0),
        }
    }
}

pub fn get_property_update(buf: &mut Bytes) -> Result<PropertyUpdate, CodecError> {
    let len = get_len(buf, 2)?;
    let mut update = PropertyUpdate::new();
    for _ in 0..len {
        let key = get_string(buf)?;
        let value = if get_bool(buf)? {
            Some(get_value(buf)?)
        } else {
            None
        };
        update.insert(key, value);
    }
    Ok(update)
}

/// Write subscriber options: periodic (µs varint) + flag byte
pub fn put_options(buf: &mut BytesMut, options: &SubscriberOptions) {
    put_varint(buf, options.periodic.as_micros().min(u64::MAX as u128) as u64);

    let mut flags = 0u8;
    if options.changes_only {
        flags |= SUB_CHANGES_ONLY;
    }
    if options.send_all {
        flags |= SUB_SEND_ALL;
    }
    if options.topics_only {
        flags |= SUB_TOPICS_ONLY;
    }
    if options.prefix_match {
        flags |= SUB_PREFIX_MATCH;
    }
    buf.put_u8(flags);
}

pub fn get_options(buf: &mut Bytes) -> Result<SubscriberOptions, CodecError> {
    let periodic = Duration::from_micros(get_varint(buf)?);
    let flags = get_u8(buf)?;
    Ok(SubscriberOptions {
        periodic,
        changes_only: flags & SUB_CHANGES_ONLY != 0,
        send_all: flags & SUB_SEND_ALL != 0,
        topics_only: flags & SUB_TOPICS_ONLY != 0,
        prefix_match: flags & SUB_PREFIX_MATCH != 0,
    })
}

//! Table value types
//!
//! Every topic carries values of exactly one declared [`ValueType`]. The
//! [`Value`] enum is the tagged union over all supported kinds; the numeric
//! tag of each kind is what travels on the wire.

use std::fmt;

/// Declared type of a topic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    Boolean,
    Double,
    Int,
    Float,
    String,
    Raw,
    BooleanArray,
    DoubleArray,
    IntArray,
    FloatArray,
    StringArray,
}

impl ValueType {
    /// Wire tag for this type
    pub fn tag(self) -> u8 {
        match self {
            ValueType::Boolean => 0,
            ValueType::Double => 1,
            ValueType::Int => 2,
            ValueType::Float => 3,
            ValueType::String => 4,
            ValueType::Raw => 5,
            ValueType::BooleanArray => 16,
            ValueType::DoubleArray => 17,
            ValueType::IntArray => 18,
            ValueType::FloatArray => 19,
            ValueType::StringArray => 20,
        }
    }

    /// Look up a type by its wire tag
    pub fn from_tag(tag: u8) -> Option<Self> {
        let ty = match tag {
            0 => ValueType::Boolean,
            1 => ValueType::Double,
            2 => ValueType::Int,
            3 => ValueType::Float,
            4 => ValueType::String,
            5 => ValueType::Raw,
            16 => ValueType::BooleanArray,
            17 => ValueType::DoubleArray,
            18 => ValueType::IntArray,
            19 => ValueType::FloatArray,
            20 => ValueType::StringArray,
            _ => return None,
        };
        Some(ty)
    }

    /// Human-readable type name ("double", "string[]", ...)
    pub fn name(self) -> &'static str {
        match self {
            ValueType::Boolean => "boolean",
            ValueType::Double => "double",
            ValueType::Int => "int",
            ValueType::Float => "float",
            ValueType::String => "string",
            ValueType::Raw => "raw",
            ValueType::BooleanArray => "boolean[]",
            ValueType::DoubleArray => "double[]",
            ValueType::IntArray => "int[]",
            ValueType::FloatArray => "float[]",
            ValueType::StringArray => "string[]",
        }
    }

    /// Whether this is one of the array kinds
    pub fn is_array(self) -> bool {
        self.tag() >= 16
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A typed table value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Boolean(bool),
    Double(f64),
    Int(i64),
    Float(f32),
    String(String),
    Raw(Vec<u8>),
    BooleanArray(Vec<bool>),
    DoubleArray(Vec<f64>),
    IntArray(Vec<i64>),
    FloatArray(Vec<f32>),
    StringArray(Vec<String>),
}

impl Value {
    /// The declared type this value satisfies
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Boolean(_) => ValueType::Boolean,
            Value::Double(_) => ValueType::Double,
            Value::Int(_) => ValueType::Int,
            Value::Float(_) => ValueType::Float,
            Value::String(_) => ValueType::String,
            Value::Raw(_) => ValueType::Raw,
            Value::BooleanArray(_) => ValueType::BooleanArray,
            Value::DoubleArray(_) => ValueType::DoubleArray,
            Value::IntArray(_) => ValueType::IntArray,
            Value::FloatArray(_) => ValueType::FloatArray,
            Value::StringArray(_) => ValueType::StringArray,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Numeric view of any scalar number kind
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Double(d) => Some(*d),
            Value::Float(f) => Some(*f as f64),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_raw(&self) -> Option<&[u8]> {
        match self {
            Value::Raw(r) => Some(r),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Raw(v)
    }
}

/// A stored value together with its ordering metadata
///
/// `timestamp` is in microseconds on the server clock. `sequence` is assigned
/// by the value store and increases strictly per topic.
#[derive(Debug, Clone, PartialEq)]
pub struct TimestampedValue {
    pub value: Value,
    pub timestamp: i64,
    pub sequence: u64,
}

impl TimestampedValue {
    pub fn new(value: Value, timestamp: i64, sequence: u64) -> Self {
        Self {
            value,
            timestamp,
            sequence,
        }
    }
}

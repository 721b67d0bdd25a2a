//! Core value and wire-type definitions
//!
//! Shared by the codec layer, the metric store and every southbound driver.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

// ============================================================================
// Metric datatypes
// ============================================================================

/// Wire datatype of a metric, matching the Sparkplug B datatype set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MetricType {
    Boolean,
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float,
    Double,
    DateTime,
    String,
    Text,
    Uuid,
    Bytes,
    File,
    DataSet,
    Template,
    PropertySet,
    PropertySetList,
}

impl MetricType {
    /// Parse a config-borne type name. Case-insensitive; endianness
    /// suffixes must already be stripped by the config rehasher.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "boolean" | "bool" => Some(Self::Boolean),
            "int8" => Some(Self::Int8),
            "int16" => Some(Self::Int16),
            "int32" => Some(Self::Int32),
            "int64" => Some(Self::Int64),
            "uint8" => Some(Self::UInt8),
            "uint16" => Some(Self::UInt16),
            "uint32" => Some(Self::UInt32),
            "uint64" => Some(Self::UInt64),
            "float" => Some(Self::Float),
            "double" => Some(Self::Double),
            "datetime" => Some(Self::DateTime),
            "string" => Some(Self::String),
            "text" => Some(Self::Text),
            "uuid" => Some(Self::Uuid),
            "bytes" => Some(Self::Bytes),
            "file" => Some(Self::File),
            "dataset" => Some(Self::DataSet),
            "template" => Some(Self::Template),
            "propertyset" => Some(Self::PropertySet),
            "propertysetlist" => Some(Self::PropertySetList),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Boolean => "Boolean",
            Self::Int8 => "Int8",
            Self::Int16 => "Int16",
            Self::Int32 => "Int32",
            Self::Int64 => "Int64",
            Self::UInt8 => "UInt8",
            Self::UInt16 => "UInt16",
            Self::UInt32 => "UInt32",
            Self::UInt64 => "UInt64",
            Self::Float => "Float",
            Self::Double => "Double",
            Self::DateTime => "DateTime",
            Self::String => "String",
            Self::Text => "Text",
            Self::Uuid => "Uuid",
            Self::Bytes => "Bytes",
            Self::File => "File",
            Self::DataSet => "DataSet",
            Self::Template => "Template",
            Self::PropertySet => "PropertySet",
            Self::PropertySetList => "PropertySetList",
        }
    }

    /// True for the signed integer widths.
    pub fn is_signed_integer(&self) -> bool {
        matches!(self, Self::Int8 | Self::Int16 | Self::Int32 | Self::Int64)
    }

    /// True for the unsigned integer widths. DateTime travels as uint64 ms.
    pub fn is_unsigned_integer(&self) -> bool {
        matches!(
            self,
            Self::UInt8 | Self::UInt16 | Self::UInt32 | Self::UInt64 | Self::DateTime
        )
    }

    /// True for the string-like types.
    pub fn is_string_like(&self) -> bool {
        matches!(self, Self::String | Self::Text | Self::Uuid)
    }
}

impl std::fmt::Display for MetricType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Metric values
// ============================================================================

/// Decoded metric value in the native representation of its [`MetricType`].
///
/// `Null` represents an absent value; structured payloads (data sets,
/// templates, property sets) are carried as JSON trees so the change
/// filter gets deep equality for free.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricValue {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    Json(serde_json::Value),
    Null,
}

impl MetricValue {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            Self::UInt(u) => i64::try_from(*u).ok(),
            Self::Float(f) => Some(f.round() as i64),
            Self::Bool(b) => Some(i64::from(*b)),
            Self::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::UInt(u) => Some(*u),
            Self::Int(i) => u64::try_from(*i).ok(),
            Self::Float(f) if *f >= 0.0 => Some(f.round() as u64),
            Self::Bool(b) => Some(u64::from(*b)),
            Self::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            Self::Int(i) => Some(*i as f64),
            Self::UInt(u) => Some(*u as f64),
            Self::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Self::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            Self::Int(i) => Some(*i != 0),
            Self::UInt(u) => Some(*u != 0),
            Self::Float(f) => Some(*f != 0.0),
            Self::String(s) => Some(string_to_bool(s)),
            _ => None,
        }
    }

    pub fn as_string(&self) -> String {
        match self {
            Self::String(s) => s.clone(),
            Self::Int(i) => i.to_string(),
            Self::UInt(u) => u.to_string(),
            Self::Float(f) => f.to_string(),
            Self::Bool(b) => b.to_string(),
            Self::Json(v) => v.to_string(),
            Self::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
            Self::Null => String::new(),
        }
    }

    /// Wire representation for payload DTOs.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::{json, Value};
        match self {
            Self::Bool(b) => json!(b),
            Self::Int(i) => json!(i),
            Self::UInt(u) => json!(u),
            Self::Float(f) => json!(f),
            Self::String(s) => json!(s),
            Self::Bytes(b) => json!(b),
            Self::Json(v) => v.clone(),
            Self::Null => Value::Null,
        }
    }
}

/// Boolean coercion for string payloads: the literal false set maps to
/// false, everything else is true.
pub fn string_to_bool(s: &str) -> bool {
    !matches!(s.trim().to_lowercase().as_str(), "false" | "no" | "0" | "")
}

// ============================================================================
// Endianness
// ============================================================================

/// Byte order of a fixed-buffer field.
///
/// The numeric codes are the config-borne forms: 4321 big-endian, 1234
/// little-endian, 3412 PDP. PDP is big-endian with the 16-bit word order
/// swapped (byte order 3-4-1-2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Endianness {
    #[default]
    Big,
    Little,
    Pdp,
}

impl Endianness {
    /// Parse either the numeric config code or a textual name/suffix.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "4321" | "BE" | "BIGENDIAN" | "BIG_ENDIAN" => Some(Self::Big),
            "1234" | "LE" | "LITTLEENDIAN" | "LITTLE_ENDIAN" => Some(Self::Little),
            "3412" | "PDP" | "PDPENDIAN" | "PDP_ENDIAN" => Some(Self::Pdp),
            _ => None,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            4321 => Some(Self::Big),
            1234 => Some(Self::Little),
            3412 => Some(Self::Pdp),
            _ => None,
        }
    }

    pub fn code(&self) -> u32 {
        match self {
            Self::Big => 4321,
            Self::Little => 1234,
            Self::Pdp => 3412,
        }
    }

    /// Reorder a field in place so a big-endian read yields the value.
    ///
    /// The transform is an involution, so the same call also produces the
    /// wire layout from a big-endian rendering when encoding.
    pub fn reorder(&self, bytes: &mut [u8]) {
        match self {
            Self::Big => {}
            Self::Little => bytes.reverse(),
            Self::Pdp => word_swap(bytes),
        }
    }
}

/// Swap adjacent 16-bit words across the slice. Odd trailing bytes and
/// unpaired words are left where they are.
pub fn word_swap(bytes: &mut [u8]) {
    let mut i = 0;
    while i + 4 <= bytes.len() {
        bytes.swap(i, i + 2);
        bytes.swap(i + 1, i + 3);
        i += 4;
    }
}

// ============================================================================
// Payload formats
// ============================================================================

/// Serialisation format of a connection's payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PayloadFormat {
    #[default]
    Delimited,
    Json,
    Xml,
    FixedBuffer,
    SerialisedBuffer,
}

impl PayloadFormat {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "delimited" | "csv" | "ascii" => Some(Self::Delimited),
            "json" => Some(Self::Json),
            "xml" => Some(Self::Xml),
            "buffer" | "fixedbuffer" | "binary" => Some(Self::FixedBuffer),
            "serialisedbuffer" | "serializedbuffer" => Some(Self::SerialisedBuffer),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Delimited => "Delimited",
            Self::Json => "JSON",
            Self::Xml => "XML",
            Self::FixedBuffer => "Buffer",
            Self::SerialisedBuffer => "SerialisedBuffer",
        }
    }
}

// ============================================================================
// Raw driver payloads
// ============================================================================

/// What a driver hands the device for one address: whatever shape the
/// transport produced.
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    /// Raw bytes off the wire.
    Bytes(Vec<u8>),
    /// Textual payload (HTTP body, MQTT text, ASCII line).
    Text(String),
    /// A value the driver already decoded to its native form.
    Decoded(MetricValue),
}

impl RawValue {
    /// Best-effort textual view; bytes are interpreted as UTF-8.
    pub fn as_text(&self) -> Option<std::borrow::Cow<'_, str>> {
        match self {
            Self::Text(s) => Some(std::borrow::Cow::Borrowed(s)),
            Self::Bytes(b) => Some(String::from_utf8_lossy(b)),
            Self::Decoded(_) => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b),
            Self::Text(s) => Some(s.as_bytes()),
            Self::Decoded(_) => None,
        }
    }

    /// Pass-through conversion used when the driver marked the payload as
    /// already final (`parse_vals == false`).
    pub fn into_value(self) -> MetricValue {
        match self {
            Self::Decoded(v) => v,
            Self::Text(s) => MetricValue::String(s),
            Self::Bytes(b) => MetricValue::Bytes(b),
        }
    }
}

/// One inbound data event: native address to raw payload.
pub type DataPayload = HashMap<String, RawValue>;

// ============================================================================
// OPC UA security lookups
// ============================================================================

/// OPC UA message security mode, resolved from its config string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpcSecurityMode {
    None,
    Sign,
    SignAndEncrypt,
    Invalid,
}

impl OpcSecurityMode {
    /// Fixed textual lookup; unknown values resolve to `Invalid`.
    pub fn lookup(s: &str) -> Self {
        match s.trim() {
            "None" => Self::None,
            "Sign" => Self::Sign,
            "SignAndEncrypt" => Self::SignAndEncrypt,
            _ => Self::Invalid,
        }
    }
}

/// OPC UA security policy, resolved from its config string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpcSecurityPolicy {
    None,
    Basic128Rsa15,
    Basic256,
    Basic256Sha256,
    Aes128Sha256RsaOaep,
    Aes256Sha256RsaPss,
    Invalid,
}

impl OpcSecurityPolicy {
    /// Fixed textual lookup; unknown values resolve to `Invalid`.
    pub fn lookup(s: &str) -> Self {
        match s.trim() {
            "None" => Self::None,
            "Basic128Rsa15" => Self::Basic128Rsa15,
            "Basic256" => Self::Basic256,
            "Basic256Sha256" => Self::Basic256Sha256,
            "Aes128_Sha256_RsaOaep" => Self::Aes128Sha256RsaOaep,
            "Aes256_Sha256_RsaPss" => Self::Aes256Sha256RsaPss,
            _ => Self::Invalid,
        }
    }
}

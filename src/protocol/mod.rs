//! Protocol module - wire encodings for values and message envelopes.
//!
//! Three interchangeable encodings share one value model:
//!
//! - [`BinaryOutputProtocol`] / [`BinaryInputProtocol`] - tagged binary, fixed-width big-endian
//! - [`CompactOutputProtocol`] / [`CompactInputProtocol`] - zigzag varints, delta field ids
//! - [`JsonOutputProtocol`] / [`JsonInputProtocol`] - human-readable JSON tree
//!
//! The value model is: bool, i8, i16, i32, i64, double, string, struct,
//! list, set and map. Every struct field carries its own type tag and
//! numeric id, so readers can [`skip`] fields they do not know about.
//!
//! # Design
//!
//! Encoders are trait objects chosen once per channel through
//! [`ProtocolKind`]. They know nothing about calls: they only turn
//! values into bytes and back.
//!
//! # Example
//!
//! ```
//! use wirecall::protocol::{ProtocolKind, WireValue};
//!
//! let mut out = ProtocolKind::Compact.output();
//! "hello".to_string().write_value(out.as_mut()).unwrap();
//! let bytes = out.finish().unwrap();
//!
//! let mut input = ProtocolKind::Compact.input(bytes).unwrap();
//! assert_eq!(String::read_value(input.as_mut()).unwrap(), "hello");
//! ```

mod binary;
mod compact;
mod json;

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize};

use crate::envelope::Envelope;
use crate::error::{Result, WirecallError};

pub use binary::{BinaryInputProtocol, BinaryOutputProtocol};
pub use compact::{CompactInputProtocol, CompactOutputProtocol};
pub use json::{JsonInputProtocol, JsonOutputProtocol};

/// Maximum nesting depth accepted by [`skip`].
pub const MAX_SKIP_DEPTH: usize = 64;

/// Type tag carried by every field, list element and map entry.
///
/// Discriminants are the tagged-binary type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TType {
    Stop = 0,
    Void = 1,
    Bool = 2,
    I8 = 3,
    Double = 4,
    I16 = 6,
    I32 = 8,
    I64 = 10,
    String = 11,
    Struct = 12,
    Map = 13,
    Set = 14,
    List = 15,
}

impl TryFrom<u8> for TType {
    type Error = WirecallError;

    fn try_from(code: u8) -> Result<Self> {
        Ok(match code {
            0 => TType::Stop,
            1 => TType::Void,
            2 => TType::Bool,
            3 => TType::I8,
            4 => TType::Double,
            6 => TType::I16,
            8 => TType::I32,
            10 => TType::I64,
            11 => TType::String,
            12 => TType::Struct,
            13 => TType::Map,
            14 => TType::Set,
            15 => TType::List,
            other => {
                return Err(WirecallError::decode(format!("unknown type code {}", other)))
            }
        })
    }
}

impl fmt::Display for TType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Header of one struct field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldHeader {
    /// Type of the field value ([`TType::Stop`] ends the struct).
    pub ttype: TType,
    /// Numeric field id.
    pub id: i16,
}

impl FieldHeader {
    /// Create a new field header.
    pub fn new(ttype: TType, id: i16) -> Self {
        Self { ttype, id }
    }

    /// The end-of-struct marker.
    pub fn stop() -> Self {
        Self {
            ttype: TType::Stop,
            id: 0,
        }
    }

    /// Check if this marks the end of a struct.
    #[inline]
    pub fn is_stop(&self) -> bool {
        self.ttype == TType::Stop
    }
}

/// Header of a list or set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListHeader {
    pub elem: TType,
    pub size: usize,
}

impl ListHeader {
    pub fn new(elem: TType, size: usize) -> Self {
        Self { elem, size }
    }
}

/// Header of a map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapHeader {
    pub key: TType,
    pub value: TType,
    pub size: usize,
}

impl MapHeader {
    pub fn new(key: TType, value: TType, size: usize) -> Self {
        Self { key, value, size }
    }
}

/// Encoder for one message at a time.
///
/// Call [`finish`](OutputProtocol::finish) to take the encoded bytes; the
/// encoder is then ready for the next message.
pub trait OutputProtocol: Send {
    fn write_message_begin(&mut self, envelope: &Envelope) -> Result<()>;
    fn write_message_end(&mut self) -> Result<()>;
    fn write_struct_begin(&mut self, name: &str) -> Result<()>;
    fn write_struct_end(&mut self) -> Result<()>;
    fn write_field_begin(&mut self, field: FieldHeader) -> Result<()>;
    fn write_field_end(&mut self) -> Result<()>;
    fn write_field_stop(&mut self) -> Result<()>;
    fn write_bool(&mut self, value: bool) -> Result<()>;
    fn write_i8(&mut self, value: i8) -> Result<()>;
    fn write_i16(&mut self, value: i16) -> Result<()>;
    fn write_i32(&mut self, value: i32) -> Result<()>;
    fn write_i64(&mut self, value: i64) -> Result<()>;
    fn write_double(&mut self, value: f64) -> Result<()>;
    fn write_string(&mut self, value: &str) -> Result<()>;
    fn write_list_begin(&mut self, list: ListHeader) -> Result<()>;
    fn write_list_end(&mut self) -> Result<()>;
    fn write_set_begin(&mut self, set: ListHeader) -> Result<()>;
    fn write_set_end(&mut self) -> Result<()>;
    fn write_map_begin(&mut self, map: MapHeader) -> Result<()>;
    fn write_map_end(&mut self) -> Result<()>;

    /// Take the bytes written so far and reset the encoder.
    fn finish(&mut self) -> Result<Bytes>;
}

/// Decoder over one received message.
pub trait InputProtocol: Send {
    fn read_message_begin(&mut self) -> Result<Envelope>;
    fn read_message_end(&mut self) -> Result<()>;
    fn read_struct_begin(&mut self) -> Result<()>;
    fn read_struct_end(&mut self) -> Result<()>;
    /// Returns a header whose type is [`TType::Stop`] at the end of a struct.
    fn read_field_begin(&mut self) -> Result<FieldHeader>;
    fn read_field_end(&mut self) -> Result<()>;
    fn read_bool(&mut self) -> Result<bool>;
    fn read_i8(&mut self) -> Result<i8>;
    fn read_i16(&mut self) -> Result<i16>;
    fn read_i32(&mut self) -> Result<i32>;
    fn read_i64(&mut self) -> Result<i64>;
    fn read_double(&mut self) -> Result<f64>;
    fn read_string(&mut self) -> Result<String>;
    fn read_list_begin(&mut self) -> Result<ListHeader>;
    fn read_list_end(&mut self) -> Result<()>;
    fn read_set_begin(&mut self) -> Result<ListHeader>;
    fn read_set_end(&mut self) -> Result<()>;
    fn read_map_begin(&mut self) -> Result<MapHeader>;
    fn read_map_end(&mut self) -> Result<()>;
}

/// Consume one value of type `ttype` without interpreting it.
pub fn skip(input: &mut dyn InputProtocol, ttype: TType) -> Result<()> {
    skip_nested(input, ttype, MAX_SKIP_DEPTH)
}

fn skip_nested(input: &mut dyn InputProtocol, ttype: TType, depth: usize) -> Result<()> {
    if depth == 0 {
        return Err(WirecallError::decode("maximum nesting depth exceeded"));
    }

    match ttype {
        TType::Bool => input.read_bool().map(drop),
        TType::I8 => input.read_i8().map(drop),
        TType::I16 => input.read_i16().map(drop),
        TType::I32 => input.read_i32().map(drop),
        TType::I64 => input.read_i64().map(drop),
        TType::Double => input.read_double().map(drop),
        TType::String => input.read_string().map(drop),
        TType::Struct => {
            input.read_struct_begin()?;
            loop {
                let field = input.read_field_begin()?;
                if field.is_stop() {
                    break;
                }
                skip_nested(input, field.ttype, depth - 1)?;
                input.read_field_end()?;
            }
            input.read_struct_end()
        }
        TType::List => {
            let list = input.read_list_begin()?;
            for _ in 0..list.size {
                skip_nested(input, list.elem, depth - 1)?;
            }
            input.read_list_end()
        }
        TType::Set => {
            let set = input.read_set_begin()?;
            for _ in 0..set.size {
                skip_nested(input, set.elem, depth - 1)?;
            }
            input.read_set_end()
        }
        TType::Map => {
            let map = input.read_map_begin()?;
            for _ in 0..map.size {
                skip_nested(input, map.key, depth - 1)?;
                skip_nested(input, map.value, depth - 1)?;
            }
            input.read_map_end()
        }
        TType::Stop | TType::Void => Err(WirecallError::decode(format!(
            "cannot skip value of type {}",
            ttype
        ))),
    }
}

/// Length of the whole message at the start of `buf`.
///
/// `Ok(None)` means `buf` holds only the beginning of a message. Used to
/// find message boundaries on streams without length prefixes.
pub fn message_len(kind: ProtocolKind, buf: &[u8]) -> Result<Option<usize>> {
    let scanned = match kind {
        ProtocolKind::Binary => {
            let mut input = BinaryInputProtocol::new(Bytes::copy_from_slice(buf));
            scan_message(&mut input).map(|()| buf.len() - input.remaining())
        }
        ProtocolKind::Compact => {
            let mut input = CompactInputProtocol::new(Bytes::copy_from_slice(buf));
            scan_message(&mut input).map(|()| buf.len() - input.remaining())
        }
        ProtocolKind::Json => return json::message_len(buf),
    };
    match scanned {
        Ok(len) => Ok(Some(len)),
        Err(WirecallError::Truncated(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

fn scan_message(input: &mut dyn InputProtocol) -> Result<()> {
    input.read_message_begin()?;
    skip(input, TType::Struct)?;
    input.read_message_end()
}

/// A value with a fixed wire type.
///
/// Records, argument structs and result structs implement this with
/// `TTYPE = TType::Struct`.
pub trait WireValue: Sized {
    /// Type tag written in front of this value inside structs and containers.
    const TTYPE: TType;

    fn write_value(&self, out: &mut dyn OutputProtocol) -> Result<()>;

    fn read_value(input: &mut dyn InputProtocol) -> Result<Self>;
}

impl WireValue for bool {
    const TTYPE: TType = TType::Bool;

    fn write_value(&self, out: &mut dyn OutputProtocol) -> Result<()> {
        out.write_bool(*self)
    }

    fn read_value(input: &mut dyn InputProtocol) -> Result<Self> {
        input.read_bool()
    }
}

impl WireValue for i8 {
    const TTYPE: TType = TType::I8;

    fn write_value(&self, out: &mut dyn OutputProtocol) -> Result<()> {
        out.write_i8(*self)
    }

    fn read_value(input: &mut dyn InputProtocol) -> Result<Self> {
        input.read_i8()
    }
}

impl WireValue for i16 {
    const TTYPE: TType = TType::I16;

    fn write_value(&self, out: &mut dyn OutputProtocol) -> Result<()> {
        out.write_i16(*self)
    }

    fn read_value(input: &mut dyn InputProtocol) -> Result<Self> {
        input.read_i16()
    }
}

impl WireValue for i32 {
    const TTYPE: TType = TType::I32;

    fn write_value(&self, out: &mut dyn OutputProtocol) -> Result<()> {
        out.write_i32(*self)
    }

    fn read_value(input: &mut dyn InputProtocol) -> Result<Self> {
        input.read_i32()
    }
}

impl WireValue for i64 {
    const TTYPE: TType = TType::I64;

    fn write_value(&self, out: &mut dyn OutputProtocol) -> Result<()> {
        out.write_i64(*self)
    }

    fn read_value(input: &mut dyn InputProtocol) -> Result<Self> {
        input.read_i64()
    }
}

impl WireValue for f64 {
    const TTYPE: TType = TType::Double;

    fn write_value(&self, out: &mut dyn OutputProtocol) -> Result<()> {
        out.write_double(*self)
    }

    fn read_value(input: &mut dyn InputProtocol) -> Result<Self> {
        input.read_double()
    }
}

impl WireValue for String {
    const TTYPE: TType = TType::String;

    fn write_value(&self, out: &mut dyn OutputProtocol) -> Result<()> {
        out.write_string(self)
    }

    fn read_value(input: &mut dyn InputProtocol) -> Result<Self> {
        input.read_string()
    }
}

impl<T: WireValue> WireValue for Vec<T> {
    const TTYPE: TType = TType::List;

    fn write_value(&self, out: &mut dyn OutputProtocol) -> Result<()> {
        out.write_list_begin(ListHeader::new(T::TTYPE, self.len()))?;
        for item in self {
            item.write_value(out)?;
        }
        out.write_list_end()
    }

    fn read_value(input: &mut dyn InputProtocol) -> Result<Self> {
        let list = input.read_list_begin()?;
        if list.elem != T::TTYPE {
            return Err(WirecallError::decode(format!(
                "list element type {} does not match expected {}",
                list.elem,
                T::TTYPE
            )));
        }
        // Cap the preallocation; the size comes off the wire.
        let mut items = Vec::with_capacity(list.size.min(1024));
        for _ in 0..list.size {
            items.push(T::read_value(input)?);
        }
        input.read_list_end()?;
        Ok(items)
    }
}

/// Write `value` as field `id` of the struct being written.
pub fn write_field<T: WireValue>(out: &mut dyn OutputProtocol, id: i16, value: &T) -> Result<()> {
    out.write_field_begin(FieldHeader::new(T::TTYPE, id))?;
    value.write_value(out)?;
    out.write_field_end()
}

/// Write an optional field; `None` is omitted from the struct.
pub fn write_optional_field<T: WireValue>(
    out: &mut dyn OutputProtocol,
    id: i16,
    value: Option<&T>,
) -> Result<()> {
    match value {
        Some(value) => write_field(out, id, value),
        None => Ok(()),
    }
}

/// Read the value of `field` as `T`.
///
/// A field whose wire type differs from `T` is skipped and yields `None`,
/// the same as an unknown field.
pub fn read_field<T: WireValue>(
    input: &mut dyn InputProtocol,
    field: FieldHeader,
) -> Result<Option<T>> {
    if field.ttype == T::TTYPE {
        T::read_value(input).map(Some)
    } else {
        skip(input, field.ttype)?;
        Ok(None)
    }
}

/// Read one struct, handing every field to `on_field`.
///
/// `on_field` must consume the field value, usually with [`read_field`]
/// for known ids and [`skip`] for the rest.
pub fn read_struct<F>(input: &mut dyn InputProtocol, mut on_field: F) -> Result<()>
where
    F: FnMut(&mut dyn InputProtocol, FieldHeader) -> Result<()>,
{
    input.read_struct_begin()?;
    loop {
        let field = input.read_field_begin()?;
        if field.is_stop() {
            break;
        }
        on_field(input, field)?;
        input.read_field_end()?;
    }
    input.read_struct_end()
}

/// Unwrap a required field after a struct has been read.
pub fn required<T>(value: Option<T>, record: &str, field: &str) -> Result<T> {
    value.ok_or_else(|| {
        WirecallError::decode(format!("required field {}.{} is missing", record, field))
    })
}

/// Wire encoding selected for a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolKind {
    /// Tagged binary (default).
    #[default]
    Binary,
    /// Compact binary.
    Compact,
    /// JSON text.
    Json,
}

impl ProtocolKind {
    /// Parse a protocol name leniently.
    ///
    /// Names are trimmed and compared case-insensitively; anything
    /// unrecognised falls back to [`ProtocolKind::Binary`].
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "binary" => ProtocolKind::Binary,
            "compact" => ProtocolKind::Compact,
            "json" => ProtocolKind::Json,
            other => {
                tracing::debug!("Unrecognised protocol '{}', using binary", other);
                ProtocolKind::Binary
            }
        }
    }

    /// Canonical lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolKind::Binary => "binary",
            ProtocolKind::Compact => "compact",
            ProtocolKind::Json => "json",
        }
    }

    /// Create a fresh encoder for this protocol.
    pub fn output(&self) -> Box<dyn OutputProtocol> {
        match self {
            ProtocolKind::Binary => Box::new(BinaryOutputProtocol::new()),
            ProtocolKind::Compact => Box::new(CompactOutputProtocol::new()),
            ProtocolKind::Json => Box::new(JsonOutputProtocol::new()),
        }
    }

    /// Create a decoder over one received message.
    ///
    /// The JSON decoder parses the whole message up front and fails here
    /// if it is not valid JSON.
    pub fn input(&self, data: Bytes) -> Result<Box<dyn InputProtocol>> {
        Ok(match self {
            ProtocolKind::Binary => Box::new(BinaryInputProtocol::new(data)),
            ProtocolKind::Compact => Box::new(CompactInputProtocol::new(data)),
            ProtocolKind::Json => Box::new(JsonInputProtocol::new(&data)?),
        })
    }
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ProtocolKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Ok(ProtocolKind::from_name(&name))
    }
}

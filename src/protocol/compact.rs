//! Compact binary encoding.
//!
//! Smaller than the tagged binary form at the cost of more state:
//!
//! - integers are zigzag varints, doubles little-endian
//! - field ids are deltas against the previous field of the same struct
//!   (delta 1-15 shares a byte with the type nibble)
//! - a bool field's value lives in its type nibble, there is no value byte
//! - list/set sizes up to 14 share a byte with the element type
//!
//! Message header:
//! ```text
//! ┌──────┬──────────────────────┬──────────────┬─────────────────┐
//! │ 0x82 │ kind << 5 | version  │ seq (varint) │ name (varint+b) │
//! └──────┴──────────────────────┴──────────────┴─────────────────┘
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{FieldHeader, InputProtocol, ListHeader, MapHeader, OutputProtocol, TType};
use crate::envelope::{Envelope, MessageKind};
use crate::error::{Result, WirecallError};

/// First byte of every compact message.
pub const PROTOCOL_ID: u8 = 0x82;

/// Compact protocol version carried in the low 5 bits of the second byte.
pub const VERSION: u8 = 1;

const VERSION_MASK: u8 = 0x1f;
const KIND_SHIFT: u8 = 5;

/// Compact type nibbles.
mod ctype {
    pub const STOP: u8 = 0;
    pub const BOOL_TRUE: u8 = 1;
    pub const BOOL_FALSE: u8 = 2;
    pub const I8: u8 = 3;
    pub const I16: u8 = 4;
    pub const I32: u8 = 5;
    pub const I64: u8 = 6;
    pub const DOUBLE: u8 = 7;
    pub const BINARY: u8 = 8;
    pub const LIST: u8 = 9;
    pub const SET: u8 = 10;
    pub const MAP: u8 = 11;
    pub const STRUCT: u8 = 12;
}

fn to_ctype(ttype: TType) -> Result<u8> {
    Ok(match ttype {
        TType::Stop => ctype::STOP,
        TType::Bool => ctype::BOOL_TRUE,
        TType::I8 => ctype::I8,
        TType::I16 => ctype::I16,
        TType::I32 => ctype::I32,
        TType::I64 => ctype::I64,
        TType::Double => ctype::DOUBLE,
        TType::String => ctype::BINARY,
        TType::List => ctype::LIST,
        TType::Set => ctype::SET,
        TType::Map => ctype::MAP,
        TType::Struct => ctype::STRUCT,
        TType::Void => {
            return Err(WirecallError::decode("void has no compact encoding"));
        }
    })
}

fn from_ctype(code: u8) -> Result<TType> {
    Ok(match code {
        ctype::STOP => TType::Stop,
        ctype::BOOL_TRUE | ctype::BOOL_FALSE => TType::Bool,
        ctype::I8 => TType::I8,
        ctype::I16 => TType::I16,
        ctype::I32 => TType::I32,
        ctype::I64 => TType::I64,
        ctype::DOUBLE => TType::Double,
        ctype::BINARY => TType::String,
        ctype::LIST => TType::List,
        ctype::SET => TType::Set,
        ctype::MAP => TType::Map,
        ctype::STRUCT => TType::Struct,
        other => {
            return Err(WirecallError::decode(format!(
                "unknown compact type {}",
                other
            )))
        }
    })
}

#[inline]
fn zigzag32(n: i32) -> u32 {
    ((n << 1) ^ (n >> 31)) as u32
}

#[inline]
fn zigzag64(n: i64) -> u64 {
    ((n << 1) ^ (n >> 63)) as u64
}

#[inline]
fn unzigzag32(n: u32) -> i32 {
    ((n >> 1) as i32) ^ -((n & 1) as i32)
}

#[inline]
fn unzigzag64(n: u64) -> i64 {
    ((n >> 1) as i64) ^ -((n & 1) as i64)
}

/// Compact encoder.
#[derive(Debug, Default)]
pub struct CompactOutputProtocol {
    buf: BytesMut,
    last_field_id: i16,
    field_stack: Vec<i16>,
    /// Bool field whose header is written together with its value.
    pending_bool_field: Option<i16>,
}

impl CompactOutputProtocol {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(256),
            ..Default::default()
        }
    }

    fn put_varint(&mut self, mut n: u64) {
        while n >= 0x80 {
            self.buf.put_u8((n as u8 & 0x7f) | 0x80);
            n >>= 7;
        }
        self.buf.put_u8(n as u8);
    }

    fn put_size(&mut self, size: usize) -> Result<()> {
        let size = u32::try_from(size)
            .ok()
            .filter(|s| *s <= i32::MAX as u32)
            .ok_or_else(|| WirecallError::decode(format!("size {} too large", size)))?;
        self.put_varint(size as u64);
        Ok(())
    }

    fn write_field_header(&mut self, code: u8, id: i16) {
        let delta = id.wrapping_sub(self.last_field_id);
        if id > self.last_field_id && delta <= 15 {
            self.buf.put_u8(((delta as u8) << 4) | code);
        } else {
            self.buf.put_u8(code);
            self.put_varint(zigzag32(id as i32) as u64);
        }
        self.last_field_id = id;
    }

    fn write_collection_begin(&mut self, elem: TType, size: usize) -> Result<()> {
        let code = to_ctype(elem)?;
        if size <= 14 {
            self.buf.put_u8(((size as u8) << 4) | code);
            Ok(())
        } else {
            self.buf.put_u8(0xf0 | code);
            self.put_size(size)
        }
    }
}

impl OutputProtocol for CompactOutputProtocol {
    fn write_message_begin(&mut self, envelope: &Envelope) -> Result<()> {
        self.buf.put_u8(PROTOCOL_ID);
        self.buf
            .put_u8((envelope.kind.code() << KIND_SHIFT) | (VERSION & VERSION_MASK));
        self.put_varint(envelope.sequence_id as u32 as u64);
        self.write_string(&envelope.name)
    }

    fn write_message_end(&mut self) -> Result<()> {
        Ok(())
    }

    fn write_struct_begin(&mut self, _name: &str) -> Result<()> {
        self.field_stack.push(self.last_field_id);
        self.last_field_id = 0;
        Ok(())
    }

    fn write_struct_end(&mut self) -> Result<()> {
        self.last_field_id = self.field_stack.pop().unwrap_or(0);
        Ok(())
    }

    fn write_field_begin(&mut self, field: FieldHeader) -> Result<()> {
        if field.ttype == TType::Bool {
            self.pending_bool_field = Some(field.id);
            return Ok(());
        }
        let code = to_ctype(field.ttype)?;
        self.write_field_header(code, field.id);
        Ok(())
    }

    fn write_field_end(&mut self) -> Result<()> {
        Ok(())
    }

    fn write_field_stop(&mut self) -> Result<()> {
        self.buf.put_u8(ctype::STOP);
        Ok(())
    }

    fn write_bool(&mut self, value: bool) -> Result<()> {
        let code = if value {
            ctype::BOOL_TRUE
        } else {
            ctype::BOOL_FALSE
        };
        match self.pending_bool_field.take() {
            Some(id) => self.write_field_header(code, id),
            None => self.buf.put_u8(code),
        }
        Ok(())
    }

    fn write_i8(&mut self, value: i8) -> Result<()> {
        self.buf.put_i8(value);
        Ok(())
    }

    fn write_i16(&mut self, value: i16) -> Result<()> {
        self.put_varint(zigzag32(value as i32) as u64);
        Ok(())
    }

    fn write_i32(&mut self, value: i32) -> Result<()> {
        self.put_varint(zigzag32(value) as u64);
        Ok(())
    }

    fn write_i64(&mut self, value: i64) -> Result<()> {
        self.put_varint(zigzag64(value));
        Ok(())
    }

    fn write_double(&mut self, value: f64) -> Result<()> {
        self.buf.put_f64_le(value);
        Ok(())
    }

    fn write_string(&mut self, value: &str) -> Result<()> {
        self.put_size(value.len())?;
        self.buf.put_slice(value.as_bytes());
        Ok(())
    }

    fn write_list_begin(&mut self, list: ListHeader) -> Result<()> {
        self.write_collection_begin(list.elem, list.size)
    }

    fn write_list_end(&mut self) -> Result<()> {
        Ok(())
    }

    fn write_set_begin(&mut self, set: ListHeader) -> Result<()> {
        self.write_collection_begin(set.elem, set.size)
    }

    fn write_set_end(&mut self) -> Result<()> {
        Ok(())
    }

    fn write_map_begin(&mut self, map: MapHeader) -> Result<()> {
        if map.size == 0 {
            self.buf.put_u8(0);
            return Ok(());
        }
        let key = to_ctype(map.key)?;
        let value = to_ctype(map.value)?;
        self.put_size(map.size)?;
        self.buf.put_u8((key << 4) | value);
        Ok(())
    }

    fn write_map_end(&mut self) -> Result<()> {
        Ok(())
    }

    fn finish(&mut self) -> Result<Bytes> {
        self.last_field_id = 0;
        self.field_stack.clear();
        self.pending_bool_field = None;
        Ok(self.buf.split().freeze())
    }
}

/// Compact decoder over one message.
#[derive(Debug)]
pub struct CompactInputProtocol {
    buf: Bytes,
    last_field_id: i16,
    field_stack: Vec<i16>,
    /// Value of the bool field just announced by `read_field_begin`.
    pending_bool: Option<bool>,
}

impl CompactInputProtocol {
    pub fn new(buf: Bytes) -> Self {
        Self {
            buf,
            last_field_id: 0,
            field_stack: Vec::new(),
            pending_bool: None,
        }
    }

    /// Bytes not consumed yet.
    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    fn get_u8(&mut self, what: &str) -> Result<u8> {
        if !self.buf.has_remaining() {
            return Err(WirecallError::truncated(format!(
                "truncated input reading {}",
                what
            )));
        }
        Ok(self.buf.get_u8())
    }

    fn get_varint(&mut self, max_bytes: usize, what: &str) -> Result<u64> {
        let mut result: u64 = 0;
        for i in 0..max_bytes {
            let byte = self.get_u8(what)?;
            result |= ((byte & 0x7f) as u64) << (7 * i);
            if byte & 0x80 == 0 {
                return Ok(result);
            }
        }
        Err(WirecallError::decode(format!("varint overflow reading {}", what)))
    }

    fn get_varint32(&mut self, what: &str) -> Result<u32> {
        let value = self.get_varint(5, what)?;
        u32::try_from(value)
            .map_err(|_| WirecallError::decode(format!("varint overflow reading {}", what)))
    }

    fn read_size(&mut self, what: &str) -> Result<usize> {
        let size = self.get_varint32(what)?;
        if size > i32::MAX as u32 {
            return Err(WirecallError::decode(format!("{} size {} too large", what, size)));
        }
        let size = size as usize;
        if size > self.buf.remaining() {
            return Err(WirecallError::truncated(format!(
                "{} size {} exceeds remaining {} bytes",
                what,
                size,
                self.buf.remaining()
            )));
        }
        Ok(size)
    }

    fn read_collection_begin(&mut self, what: &str) -> Result<ListHeader> {
        let header = self.get_u8(what)?;
        let elem = from_ctype(header & 0x0f)?;
        let short = (header >> 4) & 0x0f;
        let size = if short == 0x0f {
            self.read_size(what)?
        } else {
            short as usize
        };
        if size > self.buf.remaining() {
            return Err(WirecallError::truncated(format!(
                "{} size {} exceeds remaining {} bytes",
                what,
                size,
                self.buf.remaining()
            )));
        }
        Ok(ListHeader::new(elem, size))
    }
}

impl InputProtocol for CompactInputProtocol {
    fn read_message_begin(&mut self) -> Result<Envelope> {
        let protocol_id = self.get_u8("protocol id")?;
        if protocol_id != PROTOCOL_ID {
            return Err(WirecallError::decode(format!(
                "bad compact protocol id 0x{:02x}",
                protocol_id
            )));
        }
        let version_and_kind = self.get_u8("message header")?;
        let version = version_and_kind & VERSION_MASK;
        if version != VERSION {
            return Err(WirecallError::decode(format!(
                "bad compact protocol version {}",
                version
            )));
        }
        let kind = MessageKind::try_from(version_and_kind >> KIND_SHIFT)?;
        let sequence_id = self.get_varint32("sequence id")? as i32;
        let name = self.read_string()?;
        Ok(Envelope::new(name, kind, sequence_id))
    }

    fn read_message_end(&mut self) -> Result<()> {
        Ok(())
    }

    fn read_struct_begin(&mut self) -> Result<()> {
        self.field_stack.push(self.last_field_id);
        self.last_field_id = 0;
        Ok(())
    }

    fn read_struct_end(&mut self) -> Result<()> {
        self.last_field_id = self.field_stack.pop().unwrap_or(0);
        Ok(())
    }

    fn read_field_begin(&mut self) -> Result<FieldHeader> {
        let header = self.get_u8("field header")?;
        let code = header & 0x0f;
        if code == ctype::STOP {
            return Ok(FieldHeader::stop());
        }

        let delta = (header >> 4) & 0x0f;
        let id = if delta == 0 {
            self.read_i16()?
        } else {
            self.last_field_id.wrapping_add(delta as i16)
        };

        let ttype = from_ctype(code)?;
        if ttype == TType::Bool {
            self.pending_bool = Some(code == ctype::BOOL_TRUE);
        }
        self.last_field_id = id;
        Ok(FieldHeader::new(ttype, id))
    }

    fn read_field_end(&mut self) -> Result<()> {
        Ok(())
    }

    fn read_bool(&mut self) -> Result<bool> {
        if let Some(value) = self.pending_bool.take() {
            return Ok(value);
        }
        match self.get_u8("bool")? {
            ctype::BOOL_TRUE => Ok(true),
            ctype::BOOL_FALSE => Ok(false),
            other => Err(WirecallError::decode(format!("invalid bool byte {}", other))),
        }
    }

    fn read_i8(&mut self) -> Result<i8> {
        Ok(self.get_u8("i8")? as i8)
    }

    fn read_i16(&mut self) -> Result<i16> {
        let value = unzigzag32(self.get_varint32("i16")?);
        i16::try_from(value)
            .map_err(|_| WirecallError::decode(format!("i16 out of range: {}", value)))
    }

    fn read_i32(&mut self) -> Result<i32> {
        Ok(unzigzag32(self.get_varint32("i32")?))
    }

    fn read_i64(&mut self) -> Result<i64> {
        Ok(unzigzag64(self.get_varint(10, "i64")?))
    }

    fn read_double(&mut self) -> Result<f64> {
        if self.buf.remaining() < 8 {
            return Err(WirecallError::truncated("truncated input reading double"));
        }
        Ok(self.buf.get_f64_le())
    }

    fn read_string(&mut self) -> Result<String> {
        let len = self.read_size("string")?;
        let raw = self.buf.split_to(len);
        String::from_utf8(raw.to_vec())
            .map_err(|e| WirecallError::decode(format!("invalid UTF-8 in string: {}", e)))
    }

    fn read_list_begin(&mut self) -> Result<ListHeader> {
        self.read_collection_begin("list")
    }

    fn read_list_end(&mut self) -> Result<()> {
        Ok(())
    }

    fn read_set_begin(&mut self) -> Result<ListHeader> {
        self.read_collection_begin("set")
    }

    fn read_set_end(&mut self) -> Result<()> {
        Ok(())
    }

    fn read_map_begin(&mut self) -> Result<MapHeader> {
        let size = self.read_size("map")?;
        if size == 0 {
            return Ok(MapHeader::new(TType::Stop, TType::Stop, 0));
        }
        let types = self.get_u8("map types")?;
        let key = from_ctype(types >> 4)?;
        let value = from_ctype(types & 0x0f)?;
        Ok(MapHeader::new(key, value, size))
    }

    fn read_map_end(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(f: impl FnOnce(&mut CompactOutputProtocol)) -> Bytes {
        let mut out = CompactOutputProtocol::new();
        f(&mut out);
        out.finish().unwrap()
    }

    #[test]
    fn test_zigzag() {
        assert_eq!(zigzag32(0), 0);
        assert_eq!(zigzag32(-1), 1);
        assert_eq!(zigzag32(1), 2);
        assert_eq!(zigzag32(-2), 3);
        assert_eq!(zigzag32(i32::MIN), u32::MAX);
        assert_eq!(zigzag64(i64::MIN), u64::MAX);

        for n in [0, 1, -1, 300, -300, i32::MAX, i32::MIN] {
            assert_eq!(unzigzag32(zigzag32(n)), n);
        }
        for n in [0, 1, -1, i64::MAX, i64::MIN] {
            assert_eq!(unzigzag64(zigzag64(n)), n);
        }
    }

    #[test]
    fn test_message_header_layout() {
        let bytes = encode(|out| {
            out.write_message_begin(&Envelope::new("ab", MessageKind::Oneway, 300))
                .unwrap();
        });
        assert_eq!(
            &bytes[..],
            &[
                0x82,            // protocol id
                (4 << 5) | 1,    // ONEWAY, version 1
                0xAC, 0x02,      // varint 300
                0x02, b'a', b'b' // name
            ]
        );
    }

    #[test]
    fn test_short_and_long_field_headers() {
        let bytes = encode(|out| {
            out.write_struct_begin("s").unwrap();
            out.write_field_begin(FieldHeader::new(TType::I32, 1)).unwrap();
            out.write_i32(-1).unwrap();
            out.write_field_begin(FieldHeader::new(TType::I32, 100)).unwrap();
            out.write_i32(1).unwrap();
            out.write_field_stop().unwrap();
            out.write_struct_end().unwrap();
        });
        assert_eq!(
            &bytes[..],
            &[
                0x15, 0x01, // delta 1, i32, zigzag(-1)
                0x05, 0xC8, 0x01, 0x02, // i32, explicit id zigzag(100)=200, zigzag(1)
                0x00, // stop
            ]
        );
    }

    #[test]
    fn test_bool_field_folded_into_header() {
        let bytes = encode(|out| {
            out.write_struct_begin("s").unwrap();
            out.write_field_begin(FieldHeader::new(TType::Bool, 1)).unwrap();
            out.write_bool(true).unwrap();
            out.write_field_begin(FieldHeader::new(TType::Bool, 2)).unwrap();
            out.write_bool(false).unwrap();
            out.write_field_stop().unwrap();
            out.write_struct_end().unwrap();
        });
        assert_eq!(&bytes[..], &[0x11, 0x12, 0x00]);

        let mut input = CompactInputProtocol::new(bytes);
        input.read_struct_begin().unwrap();
        let first = input.read_field_begin().unwrap();
        assert_eq!(first, FieldHeader::new(TType::Bool, 1));
        assert!(input.read_bool().unwrap());
        let second = input.read_field_begin().unwrap();
        assert_eq!(second, FieldHeader::new(TType::Bool, 2));
        assert!(!input.read_bool().unwrap());
        assert!(input.read_field_begin().unwrap().is_stop());
    }

    #[test]
    fn test_nested_struct_restores_field_ids() {
        let bytes = encode(|out| {
            out.write_struct_begin("outer").unwrap();
            out.write_field_begin(FieldHeader::new(TType::Struct, 5)).unwrap();
            out.write_struct_begin("inner").unwrap();
            out.write_field_begin(FieldHeader::new(TType::I8, 1)).unwrap();
            out.write_i8(7).unwrap();
            out.write_field_stop().unwrap();
            out.write_struct_end().unwrap();
            out.write_field_begin(FieldHeader::new(TType::I8, 6)).unwrap();
            out.write_i8(8).unwrap();
            out.write_field_stop().unwrap();
            out.write_struct_end().unwrap();
        });

        let mut input = CompactInputProtocol::new(bytes);
        input.read_struct_begin().unwrap();
        assert_eq!(input.read_field_begin().unwrap(), FieldHeader::new(TType::Struct, 5));
        input.read_struct_begin().unwrap();
        assert_eq!(input.read_field_begin().unwrap(), FieldHeader::new(TType::I8, 1));
        assert_eq!(input.read_i8().unwrap(), 7);
        assert!(input.read_field_begin().unwrap().is_stop());
        input.read_struct_end().unwrap();
        assert_eq!(input.read_field_begin().unwrap(), FieldHeader::new(TType::I8, 6));
        assert_eq!(input.read_i8().unwrap(), 8);
    }

    #[test]
    fn test_long_list_header() {
        let items: Vec<i32> = (0..20).collect();
        let bytes = encode(|out| {
            out.write_list_begin(ListHeader::new(TType::I32, items.len())).unwrap();
            for i in &items {
                out.write_i32(*i).unwrap();
            }
        });
        assert_eq!(bytes[0], 0xf5);
        assert_eq!(bytes[1], 20);

        let mut input = CompactInputProtocol::new(bytes);
        let list = input.read_list_begin().unwrap();
        assert_eq!(list, ListHeader::new(TType::I32, 20));
        for i in &items {
            assert_eq!(input.read_i32().unwrap(), *i);
        }
    }

    #[test]
    fn test_empty_map() {
        let bytes = encode(|out| {
            out.write_map_begin(MapHeader::new(TType::String, TType::I64, 0)).unwrap();
        });
        assert_eq!(&bytes[..], &[0x00]);
        let mut input = CompactInputProtocol::new(bytes);
        assert_eq!(input.read_map_begin().unwrap().size, 0);
    }

    #[test]
    fn test_bad_protocol_id() {
        let mut input = CompactInputProtocol::new(Bytes::from_static(&[0x80, 0x21, 0x01, 0x00]));
        let err = input.read_message_begin().unwrap_err();
        assert!(err.to_string().contains("protocol id"));
    }

    #[test]
    fn test_bad_version() {
        let mut input = CompactInputProtocol::new(Bytes::from_static(&[0x82, 0x22, 0x01, 0x00]));
        let err = input.read_message_begin().unwrap_err();
        assert!(err.to_string().contains("version"));
    }

    #[test]
    fn test_unknown_kind_is_violation() {
        let mut input =
            CompactInputProtocol::new(Bytes::from_static(&[0x82, (6 << 5) | 1, 0x01, 0x00]));
        assert!(matches!(
            input.read_message_begin(),
            Err(WirecallError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_varint_overflow() {
        let mut input = CompactInputProtocol::new(Bytes::from_static(&[0xFF; 11]));
        let err = input.read_i64().unwrap_err();
        assert!(err.to_string().contains("overflow"));

        let mut input =
            CompactInputProtocol::new(Bytes::from_static(&[0xFF, 0xFF, 0xFF, 0xFF, 0x7F]));
        assert!(input.read_i32().is_err());
    }

    #[test]
    fn test_truncated_varint() {
        let mut input = CompactInputProtocol::new(Bytes::from_static(&[0x80, 0x80]));
        let err = input.read_i32().unwrap_err();
        assert!(err.to_string().contains("truncated"));
    }

    #[test]
    fn test_i16_out_of_range() {
        let bytes = encode(|out| out.write_i32(70_000).unwrap());
        let mut input = CompactInputProtocol::new(bytes);
        assert!(input.read_i16().is_err());
    }

    #[test]
    fn test_invalid_bool_byte() {
        let mut input = CompactInputProtocol::new(Bytes::from_static(&[7]));
        assert!(input.read_bool().is_err());
    }

    #[test]
    fn test_negative_sequence_id_roundtrip() {
        let bytes = encode(|out| {
            out.write_message_begin(&Envelope::new("x", MessageKind::Call, -5))
                .unwrap();
        });
        let mut input = CompactInputProtocol::new(bytes);
        assert_eq!(input.read_message_begin().unwrap().sequence_id, -5);
    }
}

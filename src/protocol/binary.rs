//! Tagged binary encoding.
//!
//! Message header (strict form):
//! ```text
//! ┌────────────────────────┬──────────────┬──────────┐
//! │ 0x8001_0000 | kind     │ name         │ seq id   │
//! │ i32 BE                 │ i32 len+utf8 │ i32 BE   │
//! └────────────────────────┴──────────────┴──────────┘
//! ```
//!
//! Fields are `i8 type` + `i16 id`, a zero type byte ends a struct.
//! All multi-byte integers are Big Endian. The reader also accepts the
//! legacy header that starts directly with the name.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{FieldHeader, InputProtocol, ListHeader, MapHeader, OutputProtocol, TType};
use crate::envelope::{Envelope, MessageKind};
use crate::error::{Result, WirecallError};

/// Version word of the strict message header.
pub const VERSION_1: u32 = 0x8001_0000;

/// Mask selecting the version bits of the first header word.
pub const VERSION_MASK: u32 = 0xffff_0000;

/// Tagged binary encoder.
#[derive(Debug, Default)]
pub struct BinaryOutputProtocol {
    buf: BytesMut,
}

impl BinaryOutputProtocol {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(256),
        }
    }

    fn write_len(&mut self, len: usize) -> Result<()> {
        let len = i32::try_from(len)
            .map_err(|_| WirecallError::decode(format!("length {} does not fit in i32", len)))?;
        self.buf.put_i32(len);
        Ok(())
    }
}

impl OutputProtocol for BinaryOutputProtocol {
    fn write_message_begin(&mut self, envelope: &Envelope) -> Result<()> {
        self.buf.put_u32(VERSION_1 | envelope.kind.code() as u32);
        self.write_string(&envelope.name)?;
        self.buf.put_i32(envelope.sequence_id);
        Ok(())
    }

    fn write_message_end(&mut self) -> Result<()> {
        Ok(())
    }

    fn write_struct_begin(&mut self, _name: &str) -> Result<()> {
        Ok(())
    }

    fn write_struct_end(&mut self) -> Result<()> {
        Ok(())
    }

    fn write_field_begin(&mut self, field: FieldHeader) -> Result<()> {
        self.buf.put_u8(field.ttype as u8);
        self.buf.put_i16(field.id);
        Ok(())
    }

    fn write_field_end(&mut self) -> Result<()> {
        Ok(())
    }

    fn write_field_stop(&mut self) -> Result<()> {
        self.buf.put_u8(TType::Stop as u8);
        Ok(())
    }

    fn write_bool(&mut self, value: bool) -> Result<()> {
        self.buf.put_u8(value as u8);
        Ok(())
    }

    fn write_i8(&mut self, value: i8) -> Result<()> {
        self.buf.put_i8(value);
        Ok(())
    }

    fn write_i16(&mut self, value: i16) -> Result<()> {
        self.buf.put_i16(value);
        Ok(())
    }

    fn write_i32(&mut self, value: i32) -> Result<()> {
        self.buf.put_i32(value);
        Ok(())
    }

    fn write_i64(&mut self, value: i64) -> Result<()> {
        self.buf.put_i64(value);
        Ok(())
    }

    fn write_double(&mut self, value: f64) -> Result<()> {
        self.buf.put_f64(value);
        Ok(())
    }

    fn write_string(&mut self, value: &str) -> Result<()> {
        self.write_len(value.len())?;
        self.buf.put_slice(value.as_bytes());
        Ok(())
    }

    fn write_list_begin(&mut self, list: ListHeader) -> Result<()> {
        self.buf.put_u8(list.elem as u8);
        self.write_len(list.size)
    }

    fn write_list_end(&mut self) -> Result<()> {
        Ok(())
    }

    fn write_set_begin(&mut self, set: ListHeader) -> Result<()> {
        self.write_list_begin(set)
    }

    fn write_set_end(&mut self) -> Result<()> {
        Ok(())
    }

    fn write_map_begin(&mut self, map: MapHeader) -> Result<()> {
        self.buf.put_u8(map.key as u8);
        self.buf.put_u8(map.value as u8);
        self.write_len(map.size)
    }

    fn write_map_end(&mut self) -> Result<()> {
        Ok(())
    }

    fn finish(&mut self) -> Result<Bytes> {
        Ok(self.buf.split().freeze())
    }
}

/// Tagged binary decoder over one message.
#[derive(Debug)]
pub struct BinaryInputProtocol {
    buf: Bytes,
}

impl BinaryInputProtocol {
    pub fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    /// Bytes not consumed yet.
    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    /// Fail unless at least `n` more bytes are available.
    #[inline]
    fn need(&self, n: usize, what: &str) -> Result<()> {
        if self.buf.remaining() < n {
            return Err(WirecallError::truncated(format!(
                "truncated input reading {}: need {} bytes, have {}",
                what,
                n,
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    fn read_len(&mut self, what: &str) -> Result<usize> {
        self.need(4, what)?;
        let len = self.buf.get_i32();
        if len < 0 {
            return Err(WirecallError::decode(format!("negative {} length {}", what, len)));
        }
        Ok(len as usize)
    }

    /// Read a container size and make sure the input could hold it.
    fn read_size(&mut self, what: &str) -> Result<usize> {
        let size = self.read_len(what)?;
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

    fn read_ttype(&mut self) -> Result<TType> {
        self.need(1, "type")?;
        TType::try_from(self.buf.get_u8())
    }

    fn read_utf8(&mut self, len: usize) -> Result<String> {
        self.need(len, "string")?;
        let raw = self.buf.split_to(len);
        String::from_utf8(raw.to_vec())
            .map_err(|e| WirecallError::decode(format!("invalid UTF-8 in string: {}", e)))
    }
}

impl InputProtocol for BinaryInputProtocol {
    fn read_message_begin(&mut self) -> Result<Envelope> {
        self.need(4, "message header")?;
        let first = self.buf.get_i32();

        if first < 0 {
            let word = first as u32;
            if word & VERSION_MASK != VERSION_1 {
                return Err(WirecallError::decode(format!(
                    "bad binary protocol version 0x{:08x}",
                    word & VERSION_MASK
                )));
            }
            let kind = MessageKind::try_from((word & 0xff) as u8)?;
            let name = self.read_string()?;
            let sequence_id = self.read_i32()?;
            Ok(Envelope::new(name, kind, sequence_id))
        } else {
            // Legacy header: the first word is the name length.
            let name = self.read_utf8(first as usize)?;
            let kind = MessageKind::try_from(self.read_i8()? as u8)?;
            let sequence_id = self.read_i32()?;
            Ok(Envelope::new(name, kind, sequence_id))
        }
    }

    fn read_message_end(&mut self) -> Result<()> {
        Ok(())
    }

    fn read_struct_begin(&mut self) -> Result<()> {
        Ok(())
    }

    fn read_struct_end(&mut self) -> Result<()> {
        Ok(())
    }

    fn read_field_begin(&mut self) -> Result<FieldHeader> {
        let ttype = self.read_ttype()?;
        if ttype == TType::Stop {
            return Ok(FieldHeader::stop());
        }
        let id = self.read_i16()?;
        Ok(FieldHeader::new(ttype, id))
    }

    fn read_field_end(&mut self) -> Result<()> {
        Ok(())
    }

    fn read_bool(&mut self) -> Result<bool> {
        self.need(1, "bool")?;
        Ok(self.buf.get_u8() != 0)
    }

    fn read_i8(&mut self) -> Result<i8> {
        self.need(1, "i8")?;
        Ok(self.buf.get_i8())
    }

    fn read_i16(&mut self) -> Result<i16> {
        self.need(2, "i16")?;
        Ok(self.buf.get_i16())
    }

    fn read_i32(&mut self) -> Result<i32> {
        self.need(4, "i32")?;
        Ok(self.buf.get_i32())
    }

    fn read_i64(&mut self) -> Result<i64> {
        self.need(8, "i64")?;
        Ok(self.buf.get_i64())
    }

    fn read_double(&mut self) -> Result<f64> {
        self.need(8, "double")?;
        Ok(self.buf.get_f64())
    }

    fn read_string(&mut self) -> Result<String> {
        let len = self.read_len("string")?;
        self.read_utf8(len)
    }

    fn read_list_begin(&mut self) -> Result<ListHeader> {
        let elem = self.read_ttype()?;
        let size = self.read_size("list")?;
        Ok(ListHeader::new(elem, size))
    }

    fn read_list_end(&mut self) -> Result<()> {
        Ok(())
    }

    fn read_set_begin(&mut self) -> Result<ListHeader> {
        let elem = self.read_ttype()?;
        let size = self.read_size("set")?;
        Ok(ListHeader::new(elem, size))
    }

    fn read_set_end(&mut self) -> Result<()> {
        Ok(())
    }

    fn read_map_begin(&mut self) -> Result<MapHeader> {
        let key = self.read_ttype()?;
        let value = self.read_ttype()?;
        let size = self.read_size("map")?;
        Ok(MapHeader::new(key, value, size))
    }

    fn read_map_end(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(f: impl FnOnce(&mut BinaryOutputProtocol)) -> Bytes {
        let mut out = BinaryOutputProtocol::new();
        f(&mut out);
        out.finish().unwrap()
    }

    #[test]
    fn test_strict_message_header_layout() {
        let bytes = encode(|out| {
            out.write_message_begin(&Envelope::new("ab", MessageKind::Call, 0x0102_0304))
                .unwrap();
        });

        assert_eq!(
            &bytes[..],
            &[
                0x80, 0x01, 0x00, 0x01, // version | CALL
                0x00, 0x00, 0x00, 0x02, b'a', b'b', // name
                0x01, 0x02, 0x03, 0x04, // sequence id
            ]
        );
    }

    #[test]
    fn test_field_and_scalar_layout() {
        let bytes = encode(|out| {
            out.write_field_begin(FieldHeader::new(TType::I64, 3)).unwrap();
            out.write_i64(-2).unwrap();
            out.write_field_stop().unwrap();
        });

        assert_eq!(
            &bytes[..],
            &[
                10, 0x00, 0x03, // i64 field 3
                0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFE, // -2 BE
                0x00, // stop
            ]
        );
    }

    #[test]
    fn test_legacy_message_header_accepted() {
        let mut raw = BytesMut::new();
        raw.put_i32(7);
        raw.put_slice(b"getUser");
        raw.put_i8(2); // REPLY
        raw.put_i32(11);

        let mut input = BinaryInputProtocol::new(raw.freeze());
        let envelope = input.read_message_begin().unwrap();
        assert_eq!(envelope, Envelope::new("getUser", MessageKind::Reply, 11));
    }

    #[test]
    fn test_bad_version_rejected() {
        let mut raw = BytesMut::new();
        raw.put_u32(0x8002_0001);
        let mut input = BinaryInputProtocol::new(raw.freeze());
        let err = input.read_message_begin().unwrap_err();
        assert!(matches!(err, WirecallError::Decode(_)));
        assert!(err.to_string().contains("version"));
    }

    #[test]
    fn test_unknown_message_kind_is_violation() {
        let mut raw = BytesMut::new();
        raw.put_u32(VERSION_1 | 9);
        raw.put_i32(0);
        raw.put_i32(1);
        let mut input = BinaryInputProtocol::new(raw.freeze());
        let err = input.read_message_begin().unwrap_err();
        assert!(matches!(err, WirecallError::ProtocolViolation(_)));
    }

    #[test]
    fn test_truncated_input() {
        let mut input = BinaryInputProtocol::new(Bytes::from_static(&[0x00, 0x01]));
        let err = input.read_i32().unwrap_err();
        assert!(err.to_string().contains("truncated"));

        // String claims 10 bytes, only 3 present.
        let mut input =
            BinaryInputProtocol::new(Bytes::from_static(&[0, 0, 0, 10, b'a', b'b', b'c']));
        assert!(input.read_string().is_err());
    }

    #[test]
    fn test_negative_length_rejected() {
        let mut input = BinaryInputProtocol::new(Bytes::from_static(&[0xFF, 0xFF, 0xFF, 0xFF]));
        let err = input.read_string().unwrap_err();
        assert!(err.to_string().contains("negative"));
    }

    #[test]
    fn test_invalid_utf8_rejected() {
        let mut input = BinaryInputProtocol::new(Bytes::from_static(&[0, 0, 0, 2, 0xC3, 0x28]));
        let err = input.read_string().unwrap_err();
        assert!(err.to_string().contains("UTF-8"));
    }

    #[test]
    fn test_unknown_field_type_rejected() {
        let mut input = BinaryInputProtocol::new(Bytes::from_static(&[5, 0, 1]));
        assert!(matches!(
            input.read_field_begin(),
            Err(WirecallError::Decode(_))
        ));
    }

    #[test]
    fn test_oversized_list_rejected() {
        let bytes = encode(|out| {
            out.write_list_begin(ListHeader::new(TType::I32, 1_000_000)).unwrap();
            out.write_i32(1).unwrap();
        });
        let mut input = BinaryInputProtocol::new(bytes);
        let err = input.read_list_begin().unwrap_err();
        assert!(err.to_string().contains("exceeds remaining"));
    }

    #[test]
    fn test_map_roundtrip() {
        let bytes = encode(|out| {
            out.write_map_begin(MapHeader::new(TType::String, TType::Double, 1)).unwrap();
            out.write_string("pi").unwrap();
            out.write_double(3.25).unwrap();
            out.write_map_end().unwrap();
        });
        let mut input = BinaryInputProtocol::new(bytes);
        let map = input.read_map_begin().unwrap();
        assert_eq!(map, MapHeader::new(TType::String, TType::Double, 1));
        assert_eq!(input.read_string().unwrap(), "pi");
        assert_eq!(input.read_double().unwrap(), 3.25);
    }
}

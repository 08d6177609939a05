//! JSON text encoding.
//!
//! Every value is wrapped so that it carries its own type tag:
//!
//! | Value   | JSON form                                   |
//! |---------|---------------------------------------------|
//! | message | `[1, "name", kind, seq, <struct>]`          |
//! | struct  | `{"<id>": {"<type>": <value>}, ...}`        |
//! | list    | `["<elem type>", count, v1, v2, ...]`       |
//! | set     | same as list                                |
//! | map     | `["<key type>", "<value type>", count, {..}]` |
//! | bool    | `1` / `0`                                   |
//! | double  | number, or `"NaN"` / `"Infinity"` / `"-Infinity"` |
//!
//! Type tags are `tf i8 i16 i32 i64 dbl str rec map lst set`. Map keys
//! are always JSON strings; numeric keys are stringified.
//!
//! The encoder builds a [`serde_json::Value`] tree and serializes it in
//! [`finish`](OutputProtocol::finish). The decoder parses the whole
//! message up front and walks the tree.

use bytes::Bytes;
use serde_json::{Map, Number, Value};

use super::{FieldHeader, InputProtocol, ListHeader, MapHeader, OutputProtocol, TType};
use crate::envelope::{Envelope, MessageKind};
use crate::error::{Result, WirecallError};

/// Version number leading every JSON message.
pub const VERSION: i64 = 1;

fn type_name(ttype: TType) -> Result<&'static str> {
    Ok(match ttype {
        TType::Bool => "tf",
        TType::I8 => "i8",
        TType::I16 => "i16",
        TType::I32 => "i32",
        TType::I64 => "i64",
        TType::Double => "dbl",
        TType::String => "str",
        TType::Struct => "rec",
        TType::Map => "map",
        TType::List => "lst",
        TType::Set => "set",
        TType::Stop | TType::Void => {
            return Err(WirecallError::decode(format!(
                "type {} has no JSON tag",
                ttype
            )))
        }
    })
}

fn type_from_name(name: &str) -> Result<TType> {
    Ok(match name {
        "tf" => TType::Bool,
        "i8" => TType::I8,
        "i16" => TType::I16,
        "i32" => TType::I32,
        "i64" => TType::I64,
        "dbl" => TType::Double,
        "str" => TType::String,
        "rec" => TType::Struct,
        "map" => TType::Map,
        "lst" => TType::List,
        "set" => TType::Set,
        other => {
            return Err(WirecallError::decode(format!(
                "unknown JSON type tag '{}'",
                other
            )))
        }
    })
}

/// Container under construction.
#[derive(Debug)]
enum Building {
    /// Message array or list/set array; headers already pushed.
    Seq(Vec<Value>),
    Struct {
        fields: Map<String, Value>,
        pending: Option<FieldHeader>,
    },
    Map {
        header: MapHeader,
        entries: Map<String, Value>,
        pending_key: Option<String>,
    },
}

/// JSON encoder.
#[derive(Debug, Default)]
pub struct JsonOutputProtocol {
    stack: Vec<Building>,
    root: Option<Value>,
}

impl JsonOutputProtocol {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a finished value to the innermost open container.
    fn emit(&mut self, value: Value) -> Result<()> {
        match self.stack.last_mut() {
            None => {
                if self.root.is_some() {
                    return Err(WirecallError::decode("JSON encoder already holds a value"));
                }
                self.root = Some(value);
            }
            Some(Building::Seq(items)) => items.push(value),
            Some(Building::Struct { fields, pending }) => {
                let field = pending
                    .take()
                    .ok_or_else(|| WirecallError::decode("struct value written outside a field"))?;
                let mut tagged = Map::with_capacity(1);
                tagged.insert(type_name(field.ttype)?.to_string(), value);
                fields.insert(field.id.to_string(), Value::Object(tagged));
            }
            Some(Building::Map {
                entries,
                pending_key,
                ..
            }) => match pending_key.take() {
                Some(key) => {
                    entries.insert(key, value);
                }
                None => *pending_key = Some(key_string(value)?),
            },
        }
        Ok(())
    }

    fn pop(&mut self, what: &str) -> Result<Building> {
        self.stack
            .pop()
            .ok_or_else(|| WirecallError::decode(format!("{} end without begin", what)))
    }
}

fn key_string(value: Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(if b { "1" } else { "0" }.to_string()),
        other => Err(WirecallError::decode(format!(
            "map key must be a scalar, got {}",
            other
        ))),
    }
}

fn double_value(value: f64) -> Value {
    if value.is_nan() {
        Value::String("NaN".to_string())
    } else if value.is_infinite() {
        let name = if value > 0.0 { "Infinity" } else { "-Infinity" };
        Value::String(name.to_string())
    } else {
        Number::from_f64(value)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

impl OutputProtocol for JsonOutputProtocol {
    fn write_message_begin(&mut self, envelope: &Envelope) -> Result<()> {
        self.stack.push(Building::Seq(vec![
            Value::from(VERSION),
            Value::from(envelope.name.as_str()),
            Value::from(envelope.kind.code()),
            Value::from(envelope.sequence_id),
        ]));
        Ok(())
    }

    fn write_message_end(&mut self) -> Result<()> {
        match self.pop("message")? {
            Building::Seq(items) => self.emit(Value::Array(items)),
            _ => Err(WirecallError::decode("message end inside an open container")),
        }
    }

    fn write_struct_begin(&mut self, _name: &str) -> Result<()> {
        self.stack.push(Building::Struct {
            fields: Map::new(),
            pending: None,
        });
        Ok(())
    }

    fn write_struct_end(&mut self) -> Result<()> {
        match self.pop("struct")? {
            Building::Struct { fields, .. } => self.emit(Value::Object(fields)),
            _ => Err(WirecallError::decode("struct end inside another container")),
        }
    }

    fn write_field_begin(&mut self, field: FieldHeader) -> Result<()> {
        match self.stack.last_mut() {
            Some(Building::Struct { pending, .. }) => {
                *pending = Some(field);
                Ok(())
            }
            _ => Err(WirecallError::decode("field written outside a struct")),
        }
    }

    fn write_field_end(&mut self) -> Result<()> {
        Ok(())
    }

    fn write_field_stop(&mut self) -> Result<()> {
        Ok(())
    }

    fn write_bool(&mut self, value: bool) -> Result<()> {
        self.emit(Value::from(value as u8))
    }

    fn write_i8(&mut self, value: i8) -> Result<()> {
        self.emit(Value::from(value))
    }

    fn write_i16(&mut self, value: i16) -> Result<()> {
        self.emit(Value::from(value))
    }

    fn write_i32(&mut self, value: i32) -> Result<()> {
        self.emit(Value::from(value))
    }

    fn write_i64(&mut self, value: i64) -> Result<()> {
        self.emit(Value::from(value))
    }

    fn write_double(&mut self, value: f64) -> Result<()> {
        self.emit(double_value(value))
    }

    fn write_string(&mut self, value: &str) -> Result<()> {
        self.emit(Value::from(value))
    }

    fn write_list_begin(&mut self, list: ListHeader) -> Result<()> {
        let mut items = Vec::with_capacity(list.size.min(1024) + 2);
        items.push(Value::from(type_name(list.elem)?));
        items.push(Value::from(list.size));
        self.stack.push(Building::Seq(items));
        Ok(())
    }

    fn write_list_end(&mut self) -> Result<()> {
        match self.pop("list")? {
            Building::Seq(items) => self.emit(Value::Array(items)),
            _ => Err(WirecallError::decode("list end inside another container")),
        }
    }

    fn write_set_begin(&mut self, set: ListHeader) -> Result<()> {
        self.write_list_begin(set)
    }

    fn write_set_end(&mut self) -> Result<()> {
        self.write_list_end()
    }

    fn write_map_begin(&mut self, map: MapHeader) -> Result<()> {
        // Validate the tags now so a bad header fails at the call site.
        type_name(map.key)?;
        type_name(map.value)?;
        self.stack.push(Building::Map {
            header: map,
            entries: Map::new(),
            pending_key: None,
        });
        Ok(())
    }

    fn write_map_end(&mut self) -> Result<()> {
        match self.pop("map")? {
            Building::Map {
                header, entries, ..
            } => self.emit(Value::Array(vec![
                Value::from(type_name(header.key)?),
                Value::from(type_name(header.value)?),
                Value::from(entries.len()),
                Value::Object(entries),
            ])),
            _ => Err(WirecallError::decode("map end inside another container")),
        }
    }

    fn finish(&mut self) -> Result<Bytes> {
        let open = !self.stack.is_empty();
        self.stack.clear();
        let root = self.root.take();
        if open {
            return Err(WirecallError::decode("JSON message has unclosed containers"));
        }
        match root {
            Some(value) => Ok(Bytes::from(serde_json::to_vec(&value)?)),
            None => Ok(Bytes::new()),
        }
    }
}

/// Position inside the parsed tree.
#[derive(Debug)]
enum Cursor {
    Seq(std::vec::IntoIter<Value>),
    Fields {
        fields: serde_json::map::IntoIter,
        pending: Option<Value>,
    },
    Map {
        entries: serde_json::map::IntoIter,
        pending: Option<Value>,
    },
}

/// Length of the first complete JSON document in `buf`, if any.
pub(super) fn message_len(buf: &[u8]) -> Result<Option<usize>> {
    let mut documents =
        serde_json::Deserializer::from_slice(buf).into_iter::<serde::de::IgnoredAny>();
    match documents.next() {
        None => Ok(None),
        Some(Ok(_)) => Ok(Some(documents.byte_offset())),
        Some(Err(e)) if e.is_eof() => Ok(None),
        Some(Err(e)) => Err(WirecallError::decode(format!("invalid JSON: {}", e))),
    }
}

/// JSON decoder over one message.
#[derive(Debug)]
pub struct JsonInputProtocol {
    root: Option<Value>,
    stack: Vec<Cursor>,
}

impl JsonInputProtocol {
    /// Parse `data` as one JSON document.
    pub fn new(data: &[u8]) -> Result<Self> {
        let root: Value = serde_json::from_slice(data)
            .map_err(|e| WirecallError::decode(format!("invalid JSON: {}", e)))?;
        Ok(Self {
            root: Some(root),
            stack: Vec::new(),
        })
    }

    fn next_value(&mut self, what: &str) -> Result<Value> {
        let missing = || WirecallError::decode(format!("missing JSON value for {}", what));
        match self.stack.last_mut() {
            None => self.root.take().ok_or_else(missing),
            Some(Cursor::Seq(items)) => items.next().ok_or_else(missing),
            Some(Cursor::Fields { pending, .. }) => pending.take().ok_or_else(missing),
            Some(Cursor::Map { entries, pending }) => match pending.take() {
                Some(value) => Ok(value),
                None => {
                    let (key, value) = entries.next().ok_or_else(missing)?;
                    *pending = Some(value);
                    Ok(Value::String(key))
                }
            },
        }
    }

    fn next_array(&mut self, what: &str) -> Result<std::vec::IntoIter<Value>> {
        match self.next_value(what)? {
            Value::Array(items) => Ok(items.into_iter()),
            other => Err(WirecallError::decode(format!(
                "expected JSON array for {}, got {}",
                what,
                other
            ))),
        }
    }

    fn next_i64(&mut self, what: &str) -> Result<i64> {
        let value = self.next_value(what)?;
        as_i64(value, what)
    }

    fn next_tag(items: &mut std::vec::IntoIter<Value>, what: &str) -> Result<TType> {
        match items.next() {
            Some(Value::String(tag)) => type_from_name(&tag),
            _ => Err(WirecallError::decode(format!("missing type tag in {}", what))),
        }
    }

    fn next_count(items: &mut std::vec::IntoIter<Value>, what: &str) -> Result<usize> {
        let count = items
            .next()
            .ok_or_else(|| WirecallError::decode(format!("missing count in {}", what)))?;
        let count = as_i64(count, what)?;
        usize::try_from(count)
            .map_err(|_| WirecallError::decode(format!("negative {} count {}", what, count)))
    }

    fn read_collection_begin(&mut self, what: &str) -> Result<ListHeader> {
        let mut items = self.next_array(what)?;
        let elem = Self::next_tag(&mut items, what)?;
        let size = Self::next_count(&mut items, what)?;
        if items.len() != size {
            return Err(WirecallError::decode(format!(
                "{} count {} does not match {} elements",
                what,
                size,
                items.len()
            )));
        }
        self.stack.push(Cursor::Seq(items));
        Ok(ListHeader::new(elem, size))
    }

    fn pop(&mut self, what: &str) -> Result<Cursor> {
        self.stack
            .pop()
            .ok_or_else(|| WirecallError::decode(format!("{} end without begin", what)))
    }
}

fn as_i64(value: Value, what: &str) -> Result<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| WirecallError::decode(format!("{} is not an integer: {}", what, n))),
        Value::String(s) => s
            .trim()
            .parse()
            .map_err(|_| WirecallError::decode(format!("{} is not an integer: '{}'", what, s))),
        other => Err(WirecallError::decode(format!(
            "expected integer for {}, got {}",
            what, other
        ))),
    }
}

fn narrow<T: TryFrom<i64>>(value: i64, what: &str) -> Result<T> {
    T::try_from(value)
        .map_err(|_| WirecallError::decode(format!("{} out of range: {}", what, value)))
}

impl InputProtocol for JsonInputProtocol {
    fn read_message_begin(&mut self) -> Result<Envelope> {
        let mut items = self.next_array("message")?;
        let mut header = |what: &str| {
            items
                .next()
                .ok_or_else(|| WirecallError::decode(format!("message header missing {}", what)))
        };

        let version = as_i64(header("version")?, "version")?;
        if version != VERSION {
            return Err(WirecallError::decode(format!(
                "unsupported JSON protocol version {}",
                version
            )));
        }
        let name = match header("name")? {
            Value::String(name) => name,
            other => {
                return Err(WirecallError::decode(format!(
                    "message name must be a string, got {}",
                    other
                )))
            }
        };
        let kind = as_i64(header("kind")?, "message kind")?;
        let kind = MessageKind::try_from(u8::try_from(kind).unwrap_or(0))?;
        let sequence_id = narrow(as_i64(header("sequence id")?, "sequence id")?, "sequence id")?;

        self.stack.push(Cursor::Seq(items));
        Ok(Envelope::new(name, kind, sequence_id))
    }

    fn read_message_end(&mut self) -> Result<()> {
        self.pop("message").map(drop)
    }

    fn read_struct_begin(&mut self) -> Result<()> {
        match self.next_value("struct")? {
            Value::Object(fields) => {
                self.stack.push(Cursor::Fields {
                    fields: fields.into_iter(),
                    pending: None,
                });
                Ok(())
            }
            other => Err(WirecallError::decode(format!(
                "expected JSON object for struct, got {}",
                other
            ))),
        }
    }

    fn read_struct_end(&mut self) -> Result<()> {
        self.pop("struct").map(drop)
    }

    fn read_field_begin(&mut self) -> Result<FieldHeader> {
        let (fields, pending) = match self.stack.last_mut() {
            Some(Cursor::Fields { fields, pending }) => (fields, pending),
            _ => return Err(WirecallError::decode("field read outside a struct")),
        };
        let Some((key, tagged)) = fields.next() else {
            return Ok(FieldHeader::stop());
        };

        let id: i16 = key
            .parse()
            .map_err(|_| WirecallError::decode(format!("invalid field id '{}'", key)))?;
        let tagged = match tagged {
            Value::Object(tagged) if tagged.len() == 1 => tagged,
            other => {
                return Err(WirecallError::decode(format!(
                    "field {} must be a single-entry object, got {}",
                    id, other
                )))
            }
        };
        let (tag, value) = tagged
            .into_iter()
            .next()
            .ok_or_else(|| WirecallError::decode(format!("field {} has no value", id)))?;

        *pending = Some(value);
        Ok(FieldHeader::new(type_from_name(&tag)?, id))
    }

    fn read_field_end(&mut self) -> Result<()> {
        Ok(())
    }

    fn read_bool(&mut self) -> Result<bool> {
        match self.next_value("bool")? {
            Value::Bool(b) => Ok(b),
            Value::String(s) if s == "true" => Ok(true),
            Value::String(s) if s == "false" => Ok(false),
            other => match as_i64(other, "bool")? {
                0 => Ok(false),
                1 => Ok(true),
                n => Err(WirecallError::decode(format!("invalid bool value {}", n))),
            },
        }
    }

    fn read_i8(&mut self) -> Result<i8> {
        narrow(self.next_i64("i8")?, "i8")
    }

    fn read_i16(&mut self) -> Result<i16> {
        narrow(self.next_i64("i16")?, "i16")
    }

    fn read_i32(&mut self) -> Result<i32> {
        narrow(self.next_i64("i32")?, "i32")
    }

    fn read_i64(&mut self) -> Result<i64> {
        self.next_i64("i64")
    }

    fn read_double(&mut self) -> Result<f64> {
        match self.next_value("double")? {
            Value::Number(n) => n
                .as_f64()
                .ok_or_else(|| WirecallError::decode(format!("invalid double {}", n))),
            Value::String(s) => match s.as_str() {
                "NaN" => Ok(f64::NAN),
                "Infinity" => Ok(f64::INFINITY),
                "-Infinity" => Ok(f64::NEG_INFINITY),
                other => other
                    .trim()
                    .parse()
                    .map_err(|_| WirecallError::decode(format!("invalid double '{}'", other))),
            },
            other => Err(WirecallError::decode(format!(
                "expected number for double, got {}",
                other
            ))),
        }
    }

    fn read_string(&mut self) -> Result<String> {
        match self.next_value("string")? {
            Value::String(s) => Ok(s),
            other => Err(WirecallError::decode(format!(
                "expected JSON string, got {}",
                other
            ))),
        }
    }

    fn read_list_begin(&mut self) -> Result<ListHeader> {
        self.read_collection_begin("list")
    }

    fn read_list_end(&mut self) -> Result<()> {
        self.pop("list").map(drop)
    }

    fn read_set_begin(&mut self) -> Result<ListHeader> {
        self.read_collection_begin("set")
    }

    fn read_set_end(&mut self) -> Result<()> {
        self.pop("set").map(drop)
    }

    fn read_map_begin(&mut self) -> Result<MapHeader> {
        let mut items = self.next_array("map")?;
        let key = Self::next_tag(&mut items, "map")?;
        let value = Self::next_tag(&mut items, "map")?;
        let size = Self::next_count(&mut items, "map")?;
        let entries = match items.next() {
            Some(Value::Object(entries)) => entries,
            None if size == 0 => Map::new(),
            _ => return Err(WirecallError::decode("map entries must be a JSON object")),
        };
        if entries.len() != size {
            return Err(WirecallError::decode(format!(
                "map count {} does not match {} entries",
                size,
                entries.len()
            )));
        }
        self.stack.push(Cursor::Map {
            entries: entries.into_iter(),
            pending: None,
        });
        Ok(MapHeader::new(key, value, size))
    }

    fn read_map_end(&mut self) -> Result<()> {
        self.pop("map").map(drop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(f: impl FnOnce(&mut JsonOutputProtocol)) -> String {
        let mut out = JsonOutputProtocol::new();
        f(&mut out);
        String::from_utf8(out.finish().unwrap().to_vec()).unwrap()
    }

    #[test]
    fn test_message_layout() {
        let text = encode(|out| {
            out.write_message_begin(&Envelope::new("getUser", MessageKind::Call, 3))
                .unwrap();
            out.write_struct_begin("args").unwrap();
            out.write_field_begin(FieldHeader::new(TType::I64, 1)).unwrap();
            out.write_i64(42).unwrap();
            out.write_field_end().unwrap();
            out.write_field_begin(FieldHeader::new(TType::Bool, 2)).unwrap();
            out.write_bool(true).unwrap();
            out.write_field_end().unwrap();
            out.write_field_stop().unwrap();
            out.write_struct_end().unwrap();
            out.write_message_end().unwrap();
        });
        assert_eq!(text, r#"[1,"getUser",1,3,{"1":{"i64":42},"2":{"tf":1}}]"#);
    }

    #[test]
    fn test_list_and_map_layout() {
        let text = encode(|out| {
            out.write_list_begin(ListHeader::new(TType::String, 2)).unwrap();
            out.write_string("a").unwrap();
            out.write_string("b").unwrap();
            out.write_list_end().unwrap();
        });
        assert_eq!(text, r#"["str",2,"a","b"]"#);

        let text = encode(|out| {
            out.write_map_begin(MapHeader::new(TType::I32, TType::String, 1)).unwrap();
            out.write_i32(7).unwrap();
            out.write_string("seven").unwrap();
            out.write_map_end().unwrap();
        });
        assert_eq!(text, r#"["i32","str",1,{"7":"seven"}]"#);
    }

    #[test]
    fn test_map_with_integer_keys_roundtrip() {
        let mut out = JsonOutputProtocol::new();
        out.write_map_begin(MapHeader::new(TType::I64, TType::Bool, 2)).unwrap();
        out.write_i64(-1).unwrap();
        out.write_bool(false).unwrap();
        out.write_i64(10).unwrap();
        out.write_bool(true).unwrap();
        out.write_map_end().unwrap();
        let bytes = out.finish().unwrap();

        let mut input = JsonInputProtocol::new(&bytes).unwrap();
        let map = input.read_map_begin().unwrap();
        assert_eq!(map, MapHeader::new(TType::I64, TType::Bool, 2));
        let mut entries = Vec::new();
        for _ in 0..map.size {
            entries.push((input.read_i64().unwrap(), input.read_bool().unwrap()));
        }
        input.read_map_end().unwrap();
        entries.sort();
        assert_eq!(entries, vec![(-1, false), (10, true)]);
    }

    #[test]
    fn test_special_doubles() {
        let text = encode(|out| {
            out.write_list_begin(ListHeader::new(TType::Double, 4)).unwrap();
            out.write_double(f64::NAN).unwrap();
            out.write_double(f64::INFINITY).unwrap();
            out.write_double(f64::NEG_INFINITY).unwrap();
            out.write_double(0.5).unwrap();
            out.write_list_end().unwrap();
        });
        assert_eq!(text, r#"["dbl",4,"NaN","Infinity","-Infinity",0.5]"#);

        let mut input = JsonInputProtocol::new(text.as_bytes()).unwrap();
        input.read_list_begin().unwrap();
        assert!(input.read_double().unwrap().is_nan());
        assert_eq!(input.read_double().unwrap(), f64::INFINITY);
        assert_eq!(input.read_double().unwrap(), f64::NEG_INFINITY);
        assert_eq!(input.read_double().unwrap(), 0.5);
    }

    #[test]
    fn test_numbers_as_strings_accepted() {
        let mut input = JsonInputProtocol::new(br#"["i32",2,"12"," -3"]"#).unwrap();
        input.read_list_begin().unwrap();
        assert_eq!(input.read_i32().unwrap(), 12);
        assert_eq!(input.read_i32().unwrap(), -3);
    }

    #[test]
    fn test_list_count_mismatch() {
        let mut input = JsonInputProtocol::new(br#"["i32",3,1,2]"#).unwrap();
        let err = input.read_list_begin().unwrap_err();
        assert!(err.to_string().contains("does not match"));
    }

    #[test]
    fn test_message_len() {
        let wire = br#" [1,"ping",4,1,{}]  [1,"pong""#;
        assert_eq!(message_len(wire).unwrap(), Some(18));
        assert_eq!(message_len(&wire[18..]).unwrap(), None);
        assert_eq!(message_len(b"   ").unwrap(), None);
        assert!(message_len(b"[1,}").is_err());
    }

    #[test]
    fn test_invalid_json() {
        let err = JsonInputProtocol::new(b"[1,\"x\",").unwrap_err();
        assert!(matches!(err, WirecallError::Decode(_)));
    }

    #[test]
    fn test_unknown_type_tag() {
        let mut input = JsonInputProtocol::new(br#"{"1":{"u64":5}}"#).unwrap();
        input.read_struct_begin().unwrap();
        assert!(input.read_field_begin().is_err());
    }

    #[test]
    fn test_out_of_range_integer() {
        let mut input = JsonInputProtocol::new(b"300").unwrap();
        let err = input.read_i8().unwrap_err();
        assert!(err.to_string().contains("out of range"));
    }

    #[test]
    fn test_bad_version() {
        let mut input = JsonInputProtocol::new(br#"[2,"x",1,1,{}]"#).unwrap();
        let err = input.read_message_begin().unwrap_err();
        assert!(err.to_string().contains("version"));
    }

    #[test]
    fn test_unknown_kind_is_violation() {
        let mut input = JsonInputProtocol::new(br#"[1,"x",9,1,{}]"#).unwrap();
        assert!(matches!(
            input.read_message_begin(),
            Err(WirecallError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_unclosed_container_fails_finish() {
        let mut out = JsonOutputProtocol::new();
        out.write_struct_begin("open").unwrap();
        assert!(out.finish().is_err());
        // Encoder is usable again afterwards.
        out.write_i32(1).unwrap();
        assert_eq!(&out.finish().unwrap()[..], b"1");
    }

    #[test]
    fn test_value_outside_field_rejected() {
        let mut out = JsonOutputProtocol::new();
        out.write_struct_begin("s").unwrap();
        assert!(out.write_i32(1).is_err());
    }
}

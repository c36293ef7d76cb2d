//! Typed records <-> stream field lists.
//!
//! Encoding goes through `serde_json`: every member of the record becomes
//! one `(name, value)` pair in declaration order. Strings are stored as-is,
//! `null` members are dropped, and anything else is stored as its JSON text.
//!
//! Decoding is driven by the target type: a field declared as `u32` parses
//! its value as a number, a `String` field takes the value verbatim, and
//! nested structures or sequences are read back from their JSON text.
//! Fields missing from the entry fall back to serde defaults (`Option`
//! members become `None`). A field whose value does not convert is dropped
//! and treated as missing, so it falls back the same way; decoding fails
//! only when a required member ends up without a value.

use crate::error::{CodecError, CodecResult};
use crate::session::FieldList;
use serde::de::value::StrDeserializer;
use serde::de::{self, DeserializeOwned, DeserializeSeed, IntoDeserializer, MapAccess, Visitor};
use serde::Serialize;
use serde_json::Value;
use std::cell::Cell;
use tracing::debug;

/// Encode a record into ordered stream fields.
pub fn to_fields<T: Serialize + ?Sized>(value: &T) -> CodecResult<FieldList> {
    match serde_json::to_value(value)? {
        Value::Object(members) => Ok(members
            .into_iter()
            .filter_map(|(name, value)| match value {
                Value::Null => None,
                Value::String(s) => Some((name, s)),
                other => Some((name, other.to_string())),
            })
            .collect()),
        other => Err(CodecError::NotARecord(kind_of(&other))),
    }
}

/// Decode stream fields into a record. When a name repeats, the last value wins.
pub fn from_fields<T: DeserializeOwned>(fields: &[(String, String)]) -> CodecResult<T> {
    let mut unique: Vec<(&str, &str)> = Vec::with_capacity(fields.len());
    for (name, value) in fields {
        match unique.iter_mut().find(|(seen, _)| *seen == name.as_str()) {
            Some(slot) => slot.1 = value.as_str(),
            None => unique.push((name.as_str(), value.as_str())),
        }
    }

    loop {
        let failed = Cell::new(None);
        let err = match T::deserialize(FieldsDeserializer {
            fields: &unique,
            failed: &failed,
        }) {
            Ok(record) => return Ok(record),
            Err(e) => e,
        };

        // Each retry has one field fewer, so this ends.
        let Some(index) = failed.get() else {
            return Err(err);
        };
        let (name, value) = unique.remove(index);
        debug!(field = name, value = value, error = %err, "Dropping field that does not convert");
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

struct FieldsDeserializer<'de> {
    fields: &'de [(&'de str, &'de str)],
    /// Index of the field whose value failed to convert.
    failed: &'de Cell<Option<usize>>,
}

impl<'de> de::Deserializer<'de> for FieldsDeserializer<'de> {
    type Error = CodecError;

    fn deserialize_any<V: Visitor<'de>>(self, visitor: V) -> CodecResult<V::Value> {
        visitor.visit_map(FieldsAccess {
            fields: self.fields.iter().enumerate(),
            value: None,
            failed: self.failed,
        })
    }

    serde::forward_to_deserialize_any! {
        bool i8 i16 i32 i64 i128 u8 u16 u32 u64 u128 f32 f64 char str string
        bytes byte_buf option unit unit_struct newtype_struct seq tuple
        tuple_struct map struct enum identifier ignored_any
    }
}

struct FieldsAccess<'de> {
    fields: std::iter::Enumerate<std::slice::Iter<'de, (&'de str, &'de str)>>,
    value: Option<(usize, &'de str)>,
    failed: &'de Cell<Option<usize>>,
}

impl<'de> MapAccess<'de> for FieldsAccess<'de> {
    type Error = CodecError;

    fn next_key_seed<K: DeserializeSeed<'de>>(&mut self, seed: K) -> CodecResult<Option<K::Value>> {
        match self.fields.next() {
            Some((index, &(name, value))) => {
                self.value = Some((index, value));
                let key: StrDeserializer<'_, CodecError> = name.into_deserializer();
                seed.deserialize(key).map(Some)
            }
            None => Ok(None),
        }
    }

    fn next_value_seed<V: DeserializeSeed<'de>>(&mut self, seed: V) -> CodecResult<V::Value> {
        let (index, value) = self
            .value
            .take()
            .ok_or_else(|| CodecError::Message("value requested before key".to_string()))?;
        seed.deserialize(FieldValue(value)).map_err(|e| {
            self.failed.set(Some(index));
            e
        })
    }

    fn size_hint(&self) -> Option<usize> {
        Some(self.fields.len())
    }
}

/// One stored field value, converted on demand to whatever the target asks for.
struct FieldValue<'de>(&'de str);

impl<'de> FieldValue<'de> {
    fn parse<N: std::str::FromStr>(&self, expected: &'static str) -> CodecResult<N> {
        self.0.trim().parse().map_err(|_| CodecError::InvalidValue {
            value: self.0.to_string(),
            expected,
        })
    }

    fn json(&self) -> serde_json::Deserializer<serde_json::de::StrRead<'de>> {
        serde_json::Deserializer::from_str(self.0)
    }
}

macro_rules! parse_scalar {
    ($($method:ident => $visit:ident : $ty:ty),* $(,)?) => {
        $(
            fn $method<V: Visitor<'de>>(self, visitor: V) -> CodecResult<V::Value> {
                visitor.$visit(self.parse::<$ty>(stringify!($ty))?)
            }
        )*
    };
}

impl<'de> de::Deserializer<'de> for FieldValue<'de> {
    type Error = CodecError;

    fn deserialize_any<V: Visitor<'de>>(self, visitor: V) -> CodecResult<V::Value> {
        visitor.visit_borrowed_str(self.0)
    }

    parse_scalar! {
        deserialize_bool => visit_bool: bool,
        deserialize_i8 => visit_i8: i8,
        deserialize_i16 => visit_i16: i16,
        deserialize_i32 => visit_i32: i32,
        deserialize_i64 => visit_i64: i64,
        deserialize_i128 => visit_i128: i128,
        deserialize_u8 => visit_u8: u8,
        deserialize_u16 => visit_u16: u16,
        deserialize_u32 => visit_u32: u32,
        deserialize_u64 => visit_u64: u64,
        deserialize_u128 => visit_u128: u128,
        deserialize_f32 => visit_f32: f32,
        deserialize_f64 => visit_f64: f64,
        deserialize_char => visit_char: char,
    }

    fn deserialize_str<V: Visitor<'de>>(self, visitor: V) -> CodecResult<V::Value> {
        visitor.visit_borrowed_str(self.0)
    }

    fn deserialize_string<V: Visitor<'de>>(self, visitor: V) -> CodecResult<V::Value> {
        visitor.visit_string(self.0.to_string())
    }

    fn deserialize_identifier<V: Visitor<'de>>(self, visitor: V) -> CodecResult<V::Value> {
        visitor.visit_str(self.0)
    }

    fn deserialize_bytes<V: Visitor<'de>>(self, visitor: V) -> CodecResult<V::Value> {
        de::Deserializer::deserialize_bytes(&mut self.json(), visitor).map_err(CodecError::from)
    }

    fn deserialize_byte_buf<V: Visitor<'de>>(self, visitor: V) -> CodecResult<V::Value> {
        de::Deserializer::deserialize_byte_buf(&mut self.json(), visitor).map_err(CodecError::from)
    }

    fn deserialize_option<V: Visitor<'de>>(self, visitor: V) -> CodecResult<V::Value> {
        visitor.visit_some(self)
    }

    fn deserialize_unit<V: Visitor<'de>>(self, visitor: V) -> CodecResult<V::Value> {
        visitor.visit_unit()
    }

    fn deserialize_unit_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        visitor: V,
    ) -> CodecResult<V::Value> {
        visitor.visit_unit()
    }

    fn deserialize_newtype_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        visitor: V,
    ) -> CodecResult<V::Value> {
        visitor.visit_newtype_struct(self)
    }

    fn deserialize_seq<V: Visitor<'de>>(self, visitor: V) -> CodecResult<V::Value> {
        de::Deserializer::deserialize_seq(&mut self.json(), visitor).map_err(CodecError::from)
    }

    fn deserialize_tuple<V: Visitor<'de>>(self, len: usize, visitor: V) -> CodecResult<V::Value> {
        de::Deserializer::deserialize_tuple(&mut self.json(), len, visitor)
            .map_err(CodecError::from)
    }

    fn deserialize_tuple_struct<V: Visitor<'de>>(
        self,
        name: &'static str,
        len: usize,
        visitor: V,
    ) -> CodecResult<V::Value> {
        de::Deserializer::deserialize_tuple_struct(&mut self.json(), name, len, visitor)
            .map_err(CodecError::from)
    }

    fn deserialize_map<V: Visitor<'de>>(self, visitor: V) -> CodecResult<V::Value> {
        de::Deserializer::deserialize_map(&mut self.json(), visitor).map_err(CodecError::from)
    }

    fn deserialize_struct<V: Visitor<'de>>(
        self,
        name: &'static str,
        fields: &'static [&'static str],
        visitor: V,
    ) -> CodecResult<V::Value> {
        de::Deserializer::deserialize_struct(&mut self.json(), name, fields, visitor)
            .map_err(CodecError::from)
    }

    fn deserialize_enum<V: Visitor<'de>>(
        self,
        name: &'static str,
        variants: &'static [&'static str],
        visitor: V,
    ) -> CodecResult<V::Value> {
        // Unit variants are stored bare; data-carrying variants as JSON objects.
        if self.0.trim_start().starts_with('{') {
            return de::Deserializer::deserialize_enum(&mut self.json(), name, variants, visitor)
                .map_err(CodecError::from);
        }
        let variant: StrDeserializer<'_, CodecError> = self.0.into_deserializer();
        visitor.visit_enum(variant)
    }

    fn deserialize_ignored_any<V: Visitor<'de>>(self, visitor: V) -> CodecResult<V::Value> {
        visitor.visit_unit()
    }
}

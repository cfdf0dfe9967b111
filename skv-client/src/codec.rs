//! # Value Codec
//!
//! Purpose: Convert application values to and from the byte strings the
//! store keeps, with the encoding chosen by the value's declared type.
//!
//! ## Design Principles
//! 1. **Declared Capability**: `ToWire`/`FromWire` replace runtime shape
//!    inspection. Scalars implement them directly; structs opt in through a
//!    wrapper that names the encoder (`Json<T>` or `Binary<T>`).
//! 2. **References Are Transparent**: `&T` encodes exactly like `T`.
//! 3. **Nil Is Rejected Early**: `None` cannot be stored and fails before I/O.
//! 4. **Two Struct Layouts, Two Names**: blobs go through `Json`/`Binary`;
//!    one-field-per-hash-field storage goes through `flatten_fields` and
//!    `unflatten_fields`.
//!
//! ## Scalar Wire Forms
//!
//! ```text
//! "text"  -> text        42 -> 42        -7i8 -> -7
//! 1.5f64  -> 1.5         true -> 1       false -> 0
//! ```

use std::fmt;
use std::ops::{Deref, DerefMut};

use bytes::Bytes;
use serde::de::value::{Error as DeError, MapDeserializer, StringDeserializer};
use serde::de::{DeserializeOwned, Error as _, IntoDeserializer, Visitor};
use serde::{forward_to_deserialize_any, Deserializer, Serialize};

use crate::error::{ClientError, ClientResult};

/// Wire form of a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodedValue {
    /// Stored as-is and coerced by the store (strings, numbers, booleans).
    Scalar(Bytes),
    /// Serialized struct payload.
    Blob(Bytes),
}

impl EncodedValue {
    pub fn kind(&self) -> &'static str {
        match self {
            EncodedValue::Scalar(_) => "scalar",
            EncodedValue::Blob(_) => "blob",
        }
    }

    pub fn into_bytes(self) -> Bytes {
        match self {
            EncodedValue::Scalar(bytes) | EncodedValue::Blob(bytes) => bytes,
        }
    }
}

/// Values that can be written to the store.
pub trait ToWire {
    fn to_wire(&self) -> ClientResult<EncodedValue>;
}

/// Values that can be read back from a stored byte string.
pub trait FromWire: Sized {
    fn from_wire(raw: &[u8]) -> ClientResult<Self>;
}

impl<T: ToWire + ?Sized> ToWire for &T {
    fn to_wire(&self) -> ClientResult<EncodedValue> {
        (**self).to_wire()
    }
}

impl<T: ToWire> ToWire for Option<T> {
    fn to_wire(&self) -> ClientResult<EncodedValue> {
        match self {
            Some(value) => value.to_wire(),
            None => Err(ClientError::InvalidValue("value should not be nil".into())),
        }
    }
}

impl ToWire for str {
    fn to_wire(&self) -> ClientResult<EncodedValue> {
        Ok(EncodedValue::Scalar(Bytes::copy_from_slice(self.as_bytes())))
    }
}

impl ToWire for String {
    fn to_wire(&self) -> ClientResult<EncodedValue> {
        self.as_str().to_wire()
    }
}

impl FromWire for String {
    fn from_wire(raw: &[u8]) -> ClientResult<Self> {
        String::from_utf8(raw.to_vec()).map_err(ClientError::encoding)
    }
}

impl ToWire for [u8] {
    fn to_wire(&self) -> ClientResult<EncodedValue> {
        Ok(EncodedValue::Scalar(Bytes::copy_from_slice(self)))
    }
}

impl ToWire for Vec<u8> {
    fn to_wire(&self) -> ClientResult<EncodedValue> {
        self.as_slice().to_wire()
    }
}

impl FromWire for Vec<u8> {
    fn from_wire(raw: &[u8]) -> ClientResult<Self> {
        Ok(raw.to_vec())
    }
}

impl ToWire for Bytes {
    fn to_wire(&self) -> ClientResult<EncodedValue> {
        Ok(EncodedValue::Scalar(self.clone()))
    }
}

impl FromWire for Bytes {
    fn from_wire(raw: &[u8]) -> ClientResult<Self> {
        Ok(Bytes::copy_from_slice(raw))
    }
}

impl ToWire for bool {
    fn to_wire(&self) -> ClientResult<EncodedValue> {
        let text: &'static [u8] = if *self { b"1" } else { b"0" };
        Ok(EncodedValue::Scalar(Bytes::from_static(text)))
    }
}

impl FromWire for bool {
    fn from_wire(raw: &[u8]) -> ClientResult<Self> {
        let text = std::str::from_utf8(raw).map_err(ClientError::encoding)?;
        parse_bool(text)
            .ok_or_else(|| ClientError::Encoding(format!("cannot parse {:?} as bool", text)))
    }
}

macro_rules! display_scalar {
    ($($ty:ty),* $(,)?) => {$(
        impl ToWire for $ty {
            fn to_wire(&self) -> ClientResult<EncodedValue> {
                Ok(EncodedValue::Scalar(Bytes::from(self.to_string())))
            }
        }

        impl FromWire for $ty {
            fn from_wire(raw: &[u8]) -> ClientResult<Self> {
                let text = std::str::from_utf8(raw).map_err(ClientError::encoding)?;
                text.trim().parse::<$ty>().map_err(|err| {
                    ClientError::Encoding(format!(
                        "cannot parse {:?} as {}: {}",
                        text,
                        stringify!($ty),
                        err
                    ))
                })
            }
        }
    )*};
}

display_scalar!(i8, i16, i32, i64, i128, isize, u8, u16, u32, u64, u128, usize, f32, f64);

fn parse_bool(text: &str) -> Option<bool> {
    match text.trim() {
        "1" => Some(true),
        "0" => Some(false),
        t if t.eq_ignore_ascii_case("true") || t.eq_ignore_ascii_case("t") => Some(true),
        f if f.eq_ignore_ascii_case("false") || f.eq_ignore_ascii_case("f") => Some(false),
        _ => None,
    }
}

/// Stores a struct as a JSON blob.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Json<T>(pub T);

/// Stores a struct as a compact bincode blob.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Binary<T>(pub T);

macro_rules! blob_wrapper {
    ($wrapper:ident, $encode:expr, $decode:expr) => {
        impl<T> $wrapper<T> {
            pub fn into_inner(self) -> T {
                self.0
            }
        }

        impl<T> Deref for $wrapper<T> {
            type Target = T;

            fn deref(&self) -> &T {
                &self.0
            }
        }

        impl<T> DerefMut for $wrapper<T> {
            fn deref_mut(&mut self) -> &mut T {
                &mut self.0
            }
        }

        impl<T: Serialize> ToWire for $wrapper<T> {
            fn to_wire(&self) -> ClientResult<EncodedValue> {
                let bytes: Vec<u8> = $encode(&self.0)?;
                Ok(EncodedValue::Blob(Bytes::from(bytes)))
            }
        }

        impl<T: DeserializeOwned> FromWire for $wrapper<T> {
            fn from_wire(raw: &[u8]) -> ClientResult<Self> {
                Ok($wrapper($decode(raw)?))
            }
        }
    };
}

blob_wrapper!(Json, serde_json::to_vec, serde_json::from_slice);
blob_wrapper!(Binary, bincode::serialize, bincode::deserialize);

/// Flattens a struct into `(field, value)` pairs for hash storage.
///
/// Strings are stored raw, numbers and booleans by their text form, nested
/// values as JSON text. `null` fields are skipped, so `Option` fields read
/// back as `None`.
pub fn flatten_fields<T: Serialize + ?Sized>(value: &T) -> ClientResult<Vec<(String, String)>> {
    let serde_json::Value::Object(map) = serde_json::to_value(value)? else {
        return Err(ClientError::InvalidValue(
            "hash storage requires a struct or map value".into(),
        ));
    };

    let mut fields = Vec::with_capacity(map.len());
    for (name, value) in map {
        match value {
            serde_json::Value::Null => continue,
            serde_json::Value::String(text) => fields.push((name, text)),
            other => fields.push((name, other.to_string())),
        }
    }
    Ok(fields)
}

/// Rebuilds a struct from hash `(field, value)` pairs.
///
/// Each value is coerced to the type its field declares. Unknown fields are
/// ignored unless the target denies them.
pub fn unflatten_fields<T: DeserializeOwned>(fields: Vec<(String, String)>) -> ClientResult<T> {
    let deserializer: MapDeserializer<'_, _, DeError> =
        MapDeserializer::new(fields.into_iter().map(|(name, value)| (name, FieldValue(value))));
    T::deserialize(deserializer).map_err(ClientError::encoding)
}

/// One hash field value, deserialized according to the visitor's request.
struct FieldValue(String);

impl FieldValue {
    fn invalid(&self, expected: &str) -> DeError {
        DeError::custom(format!("cannot parse {:?} as {}", self.0, expected))
    }

    fn json<'de, V, F>(self, visit: F) -> Result<V::Value, DeError>
    where
        V: Visitor<'de>,
        F: FnOnce(
            &mut serde_json::Deserializer<serde_json::de::IoRead<std::io::Cursor<Vec<u8>>>>,
        ) -> serde_json::Result<V::Value>,
    {
        let mut de = serde_json::Deserializer::from_reader(std::io::Cursor::new(self.0.into_bytes()));
        let value = visit(&mut de).map_err(DeError::custom)?;
        de.end().map_err(DeError::custom)?;
        Ok(value)
    }
}

impl<'de> IntoDeserializer<'de, DeError> for FieldValue {
    type Deserializer = FieldValue;

    fn into_deserializer(self) -> FieldValue {
        self
    }
}

macro_rules! parse_field {
    ($($method:ident => $visit:ident : $ty:ty),* $(,)?) => {$(
        fn $method<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, DeError> {
            let value = self.0.trim().parse::<$ty>().map_err(|_| self.invalid(stringify!($ty)))?;
            visitor.$visit(value)
        }
    )*};
}

impl<'de> Deserializer<'de> for FieldValue {
    type Error = DeError;

    fn deserialize_any<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, DeError> {
        visitor.visit_string(self.0)
    }

    fn deserialize_bool<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, DeError> {
        match parse_bool(&self.0) {
            Some(value) => visitor.visit_bool(value),
            None => Err(self.invalid("bool")),
        }
    }

    parse_field! {
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
    }

    fn deserialize_option<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, DeError> {
        visitor.visit_some(self)
    }

    fn deserialize_unit<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, DeError> {
        visitor.visit_unit()
    }

    fn deserialize_newtype_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        visitor: V,
    ) -> Result<V::Value, DeError> {
        visitor.visit_newtype_struct(self)
    }

    fn deserialize_seq<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, DeError> {
        self.json::<V, _>(|de| de.deserialize_seq(visitor))
    }

    fn deserialize_tuple<V: Visitor<'de>>(
        self,
        len: usize,
        visitor: V,
    ) -> Result<V::Value, DeError> {
        self.json::<V, _>(|de| de.deserialize_tuple(len, visitor))
    }

    fn deserialize_tuple_struct<V: Visitor<'de>>(
        self,
        name: &'static str,
        len: usize,
        visitor: V,
    ) -> Result<V::Value, DeError> {
        self.json::<V, _>(|de| de.deserialize_tuple_struct(name, len, visitor))
    }

    fn deserialize_map<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, DeError> {
        self.json::<V, _>(|de| de.deserialize_map(visitor))
    }

    fn deserialize_struct<V: Visitor<'de>>(
        self,
        name: &'static str,
        fields: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, DeError> {
        self.json::<V, _>(|de| de.deserialize_struct(name, fields, visitor))
    }

    fn deserialize_enum<V: Visitor<'de>>(
        self,
        name: &'static str,
        variants: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, DeError> {
        // Unit variants are stored bare; data-carrying variants as JSON.
        if self.0.trim_start().starts_with('{') {
            return self.json::<V, _>(|de| de.deserialize_enum(name, variants, visitor));
        }
        let variant: StringDeserializer<DeError> = self.0.into_deserializer();
        visitor.visit_enum(variant)
    }

    forward_to_deserialize_any! {
        char str string bytes byte_buf unit_struct identifier ignored_any
    }
}

impl fmt::Debug for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FieldValue({:?})", self.0)
    }
}

//! Wire form of values and the scalar byte encodings.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::code::Ref;
use crate::error::{Error, Result};
use crate::types::Type;
use crate::value::Time;

/// A value as it travels between compiler, executor and callers.
///
/// Scalars keep their bytes in `value`; arrays use `array`, maps and blocks
/// use `map`. Refs and function refs are scalars holding the packed ref.
/// `null` marks a typed value that holds nothing, so an absent string or
/// list stays distinct from an empty one. `error` carries the message of a
/// failed value, such as one element of a fan-out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypedValue {
    #[serde(rename = "type")]
    pub typ: Type,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub null: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub value: Vec<u8>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub array: Vec<TypedValue>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub map: BTreeMap<String, TypedValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TypedValue {
    pub fn scalar(typ: Type, value: Vec<u8>) -> Self {
        Self {
            typ,
            null: false,
            value,
            array: Vec::new(),
            map: BTreeMap::new(),
            error: None,
        }
    }

    pub fn unset() -> Self {
        Self::scalar(Type::Unset, Vec::new())
    }

    pub fn nil() -> Self {
        Self::scalar(Type::Nil, Vec::new())
    }

    /// An absent value that keeps its type.
    pub fn null_of(typ: Type) -> Self {
        Self {
            null: true,
            ..Self::scalar(typ, Vec::new())
        }
    }

    pub fn bool(value: bool) -> Self {
        Self::scalar(Type::Bool, encode_bool(value))
    }

    pub fn int(value: i64) -> Self {
        Self::scalar(Type::Int, encode_int(value))
    }

    pub fn float(value: f64) -> Self {
        Self::scalar(Type::Float, encode_float(value))
    }

    pub fn string(value: impl Into<String>) -> Self {
        Self::scalar(Type::String, value.into().into_bytes())
    }

    pub fn regex(pattern: impl Into<String>) -> Self {
        Self::scalar(Type::Regex, pattern.into().into_bytes())
    }

    pub fn time(value: Time) -> Self {
        Self::scalar(Type::Time, encode_time(value))
    }

    pub fn reference(target: Ref) -> Self {
        Self::scalar(Type::Ref, encode_uint(target.raw()))
    }

    /// A ref to a function block whose single value has type `result`.
    pub fn function(block: Ref, result: Type) -> Self {
        Self::scalar(Type::function(result), encode_uint(block.raw()))
    }

    pub fn array(items: Vec<TypedValue>, child: Type) -> Self {
        Self {
            typ: Type::array(child),
            null: false,
            value: Vec::new(),
            array: items,
            map: BTreeMap::new(),
            error: None,
        }
    }

    pub fn string_map(entries: BTreeMap<String, TypedValue>, child: Type) -> Self {
        Self {
            typ: Type::string_map(child),
            null: false,
            value: Vec::new(),
            array: Vec::new(),
            map: entries,
            error: None,
        }
    }

    pub fn resource(name: &str, id: &str) -> Self {
        Self::scalar(Type::resource(name), id.as_bytes().to_vec())
    }

    /// Returns the target if this value is a ref or a function ref.
    pub fn as_ref(&self) -> Option<Ref> {
        match self.typ {
            Type::Ref | Type::Function(_) => decode_uint(&self.value).ok().map(Ref::from_raw),
            _ => None,
        }
    }

    pub fn is_ref(&self) -> bool {
        self.typ == Type::Ref
    }

    pub fn is_nil(&self) -> bool {
        self.null || matches!(self.typ, Type::Nil | Type::Unset)
    }

    /// Literal chunks are static unless they point at another chunk.
    pub fn is_static(&self) -> bool {
        self.typ != Type::Ref
            && self.array.iter().all(TypedValue::is_static)
            && self.map.values().all(TypedValue::is_static)
    }

    /// Human-readable rendering used in reports and traces.
    pub fn label(&self) -> String {
        crate::convert::to_runtime(self).to_string()
    }
}

pub fn encode_bool(value: bool) -> Vec<u8> {
    vec![u8::from(value)]
}

pub fn decode_bool(bytes: &[u8]) -> Result<bool> {
    match bytes {
        [0] => Ok(false),
        [1] => Ok(true),
        other => Err(Error::Decode(format!("invalid bool encoding {other:?}"))),
    }
}

/// Signed LEB128.
pub fn encode_int(value: i64) -> Vec<u8> {
    let mut out = Vec::with_capacity(10);
    let mut value = value;
    loop {
        let byte = (value as u8) & 0x7f;
        value >>= 7;
        let sign_bit_clear = byte & 0x40 == 0;
        let done = (value == 0 && sign_bit_clear) || (value == -1 && !sign_bit_clear);
        if done {
            out.push(byte);
            return out;
        }
        out.push(byte | 0x80);
    }
}

pub fn decode_int(bytes: &[u8]) -> Result<i64> {
    let mut result: i64 = 0;
    let mut shift = 0u32;
    for (idx, &byte) in bytes.iter().enumerate() {
        if shift >= 64 {
            return Err(Error::Decode("int varint overflows 64 bits".to_string()));
        }
        result |= i64::from(byte & 0x7f) << shift;
        shift += 7;
        if byte & 0x80 == 0 {
            if idx + 1 != bytes.len() {
                return Err(Error::Decode("trailing bytes after int varint".to_string()));
            }
            if shift < 64 && (byte & 0x40) != 0 {
                result |= -1i64 << shift;
            }
            return Ok(result);
        }
    }
    Err(Error::Decode("unterminated int varint".to_string()))
}

/// Unsigned LEB128, used for packed refs.
pub fn encode_uint(value: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(10);
    let mut value = value;
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return out;
        }
        out.push(byte | 0x80);
    }
}

pub fn decode_uint(bytes: &[u8]) -> Result<u64> {
    let mut result: u64 = 0;
    let mut shift = 0u32;
    for (idx, &byte) in bytes.iter().enumerate() {
        if shift >= 64 {
            return Err(Error::Decode("uint varint overflows 64 bits".to_string()));
        }
        result |= u64::from(byte & 0x7f) << shift;
        shift += 7;
        if byte & 0x80 == 0 {
            if idx + 1 != bytes.len() {
                return Err(Error::Decode("trailing bytes after uint varint".to_string()));
            }
            return Ok(result);
        }
    }
    Err(Error::Decode("unterminated uint varint".to_string()))
}

pub fn encode_float(value: f64) -> Vec<u8> {
    value.to_le_bytes().to_vec()
}

pub fn decode_float(bytes: &[u8]) -> Result<f64> {
    let raw: [u8; 8] = bytes
        .try_into()
        .map_err(|_| Error::Decode(format!("float needs 8 bytes, got {}", bytes.len())))?;
    Ok(f64::from_le_bytes(raw))
}

pub fn encode_time(value: Time) -> Vec<u8> {
    let mut out = Vec::with_capacity(12);
    out.extend_from_slice(&value.secs.to_le_bytes());
    out.extend_from_slice(&value.nanos.to_le_bytes());
    out
}

pub fn decode_time(bytes: &[u8]) -> Result<Time> {
    if bytes.len() != 12 {
        return Err(Error::Decode(format!("time needs 12 bytes, got {}", bytes.len())));
    }
    let mut secs = [0u8; 8];
    secs.copy_from_slice(&bytes[..8]);
    let mut nanos = [0u8; 4];
    nanos.copy_from_slice(&bytes[8..]);
    Ok(Time::new(i64::from_le_bytes(secs), u32::from_le_bytes(nanos)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_varint_matches_known_encodings() {
        assert_eq!(encode_int(0), vec![0x00]);
        assert_eq!(encode_int(2), vec![0x02]);
        assert_eq!(encode_int(-1), vec![0x7f]);
        assert_eq!(encode_int(63), vec![0x3f]);
        assert_eq!(encode_int(64), vec![0xc0, 0x00]);
        assert_eq!(encode_int(-123456), vec![0xc0, 0xbb, 0x78]);
    }

    #[test]
    fn int_varint_extremes_decode() {
        for value in [i64::MIN, i64::MAX, -64, -65, 1 << 40] {
            assert_eq!(decode_int(&encode_int(value)).unwrap(), value);
        }
    }

    #[test]
    fn truncated_varints_are_errors() {
        assert!(decode_int(&[0x80]).is_err());
        assert!(decode_uint(&[]).is_err());
        assert!(decode_uint(&[0x01, 0x02]).is_err());
    }

    #[test]
    fn time_layout_is_seconds_then_nanos() {
        let bytes = encode_time(Time::new(1, 2));
        assert_eq!(bytes, vec![1, 0, 0, 0, 0, 0, 0, 0, 2, 0, 0, 0]);
        assert_eq!(decode_time(&bytes).unwrap(), Time::new(1, 2));
        assert!(decode_time(&bytes[..11]).is_err());
    }

    #[test]
    fn float_is_little_endian_ieee() {
        assert_eq!(encode_float(1.0), vec![0, 0, 0, 0, 0, 0, 0xf0, 0x3f]);
        assert!(decode_float(&[1, 2, 3]).is_err());
    }

    #[test]
    fn refs_survive_the_wire() {
        let target = Ref::new(2, 7);
        let value = TypedValue::reference(target);
        assert_eq!(value.as_ref(), Some(target));
        assert!(!value.is_static());
        let func = TypedValue::function(Ref::block(3), Type::Bool);
        assert_eq!(func.as_ref(), Some(Ref::block(3)));
        assert!(TypedValue::int(4).as_ref().is_none());
    }

    #[test]
    fn json_omits_empty_parts() {
        let json = serde_json::to_value(TypedValue::int(5)).unwrap();
        let object = json.as_object().unwrap();
        assert!(object.contains_key("type"));
        assert!(!object.contains_key("array"));
        assert!(!object.contains_key("map"));
    }
}

//! Type tags shared by the wire format, the checksum engine and dispatch.
//!
//! Every type has a compact byte encoding (one tag byte per level, resource
//! names appended verbatim) and a human-readable label. Signatures in the
//! builtin table are built from labels.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};

const TAG_UNSET: u8 = 0;
const TAG_ANY: u8 = 1;
const TAG_NIL: u8 = 2;
const TAG_REF: u8 = 3;
const TAG_BOOL: u8 = 4;
const TAG_INT: u8 = 5;
const TAG_FLOAT: u8 = 6;
const TAG_STRING: u8 = 7;
const TAG_REGEX: u8 = 8;
const TAG_TIME: u8 = 9;
const TAG_DICT: u8 = 10;
const TAG_BLOCK: u8 = 12;
const TAG_EMPTY: u8 = 13;
const TAG_ARRAY: u8 = 25;
const TAG_MAP: u8 = 26;
const TAG_RESOURCE: u8 = 27;
const TAG_FUNCTION: u8 = 28;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Type {
    Unset,
    Any,
    Nil,
    Ref,
    Bool,
    Int,
    Float,
    String,
    Regex,
    Time,
    Dict,
    Block,
    Empty,
    Array(Box<Type>),
    Map(Box<Type>, Box<Type>),
    Resource(String),
    Function(Box<Type>),
}

/// The underlying class of a type; the outer key of the dispatch table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Kind {
    Unset,
    Any,
    Nil,
    Ref,
    Bool,
    Int,
    Float,
    String,
    Regex,
    Time,
    Dict,
    Block,
    Empty,
    Array,
    Map,
    Resource,
    Function,
}

impl Kind {
    pub fn label(self) -> &'static str {
        match self {
            Kind::Unset => "unset",
            Kind::Any => "any",
            Kind::Nil => "null",
            Kind::Ref => "ref",
            Kind::Bool => "bool",
            Kind::Int => "int",
            Kind::Float => "float",
            Kind::String => "string",
            Kind::Regex => "regex",
            Kind::Time => "time",
            Kind::Dict => "dict",
            Kind::Block => "block",
            Kind::Empty => "empty",
            Kind::Array => "[]",
            Kind::Map => "map",
            Kind::Resource => "resource",
            Kind::Function => "function",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl Type {
    pub fn array(child: Type) -> Type {
        Type::Array(Box::new(child))
    }

    /// Map keys are restricted to strings and ints.
    pub fn map(key: Type, value: Type) -> Result<Type> {
        match key {
            Type::String | Type::Int => Ok(Type::Map(Box::new(key), Box::new(value))),
            other => Err(Error::type_mismatch("string or int map key", other.label())),
        }
    }

    pub fn string_map(value: Type) -> Type {
        Type::Map(Box::new(Type::String), Box::new(value))
    }

    pub fn resource(name: impl Into<String>) -> Type {
        Type::Resource(name.into())
    }

    pub fn function(result: Type) -> Type {
        Type::Function(Box::new(result))
    }

    pub fn kind(&self) -> Kind {
        match self {
            Type::Unset => Kind::Unset,
            Type::Any => Kind::Any,
            Type::Nil => Kind::Nil,
            Type::Ref => Kind::Ref,
            Type::Bool => Kind::Bool,
            Type::Int => Kind::Int,
            Type::Float => Kind::Float,
            Type::String => Kind::String,
            Type::Regex => Kind::Regex,
            Type::Time => Kind::Time,
            Type::Dict => Kind::Dict,
            Type::Block => Kind::Block,
            Type::Empty => Kind::Empty,
            Type::Array(_) => Kind::Array,
            Type::Map(_, _) => Kind::Map,
            Type::Resource(_) => Kind::Resource,
            Type::Function(_) => Kind::Function,
        }
    }

    /// Element type for arrays, value type for maps, result type for functions.
    pub fn child(&self) -> Type {
        match self {
            Type::Array(child) | Type::Map(_, child) | Type::Function(child) => (**child).clone(),
            Type::Dict => Type::Dict,
            _ => Type::Any,
        }
    }

    pub fn key(&self) -> Option<&Type> {
        match self {
            Type::Map(key, _) => Some(key),
            _ => None,
        }
    }

    pub fn resource_name(&self) -> Option<&str> {
        match self {
            Type::Resource(name) => Some(name),
            _ => None,
        }
    }

    pub fn is_array(&self) -> bool {
        matches!(self, Type::Array(_))
    }

    pub fn is_map(&self) -> bool {
        matches!(self, Type::Map(_, _))
    }

    pub fn is_resource(&self) -> bool {
        matches!(self, Type::Resource(_))
    }

    pub fn is_function(&self) -> bool {
        matches!(self, Type::Function(_))
    }

    pub fn label(&self) -> String {
        match self {
            Type::Array(child) => format!("[]{}", child.label()),
            Type::Map(key, value) => format!("map[{}]{}", key.label(), value.label()),
            Type::Resource(name) => name.clone(),
            Type::Function(result) => format!("function({})", result.label()),
            other => other.kind().label().to_string(),
        }
    }

    /// Parses a label as produced by [`Type::label`]. Names that are not
    /// builtin labels are resource names.
    pub fn from_label(label: &str) -> Result<Type> {
        let label = label.trim();
        if label.is_empty() {
            return Err(Error::Decode("empty type label".to_string()));
        }
        if let Some(child) = label.strip_prefix("[]") {
            return Ok(Type::array(Type::from_label(child)?));
        }
        if let Some(rest) = label.strip_prefix("map[") {
            let Some((key, value)) = rest.split_once(']') else {
                return Err(Error::Decode(format!("unterminated map key in {label:?}")));
            };
            return Type::map(Type::from_label(key)?, Type::from_label(value)?);
        }
        if let Some(inner) = label
            .strip_prefix("function(")
            .and_then(|rest| rest.strip_suffix(')'))
        {
            return Ok(Type::function(Type::from_label(inner)?));
        }
        let simple = match label {
            "unset" => Type::Unset,
            "any" => Type::Any,
            "null" => Type::Nil,
            "ref" => Type::Ref,
            "bool" => Type::Bool,
            "int" => Type::Int,
            "float" => Type::Float,
            "string" => Type::String,
            "regex" => Type::Regex,
            "time" => Type::Time,
            "dict" => Type::Dict,
            "block" => Type::Block,
            "empty" => Type::Empty,
            name => Type::resource(name),
        };
        Ok(simple)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Type::Unset => out.push(TAG_UNSET),
            Type::Any => out.push(TAG_ANY),
            Type::Nil => out.push(TAG_NIL),
            Type::Ref => out.push(TAG_REF),
            Type::Bool => out.push(TAG_BOOL),
            Type::Int => out.push(TAG_INT),
            Type::Float => out.push(TAG_FLOAT),
            Type::String => out.push(TAG_STRING),
            Type::Regex => out.push(TAG_REGEX),
            Type::Time => out.push(TAG_TIME),
            Type::Dict => out.push(TAG_DICT),
            Type::Block => out.push(TAG_BLOCK),
            Type::Empty => out.push(TAG_EMPTY),
            Type::Array(child) => {
                out.push(TAG_ARRAY);
                child.encode_into(out);
            }
            Type::Map(key, value) => {
                out.push(TAG_MAP);
                key.encode_into(out);
                value.encode_into(out);
            }
            Type::Resource(name) => {
                out.push(TAG_RESOURCE);
                out.extend_from_slice(name.as_bytes());
            }
            Type::Function(result) => {
                out.push(TAG_FUNCTION);
                result.encode_into(out);
            }
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Type> {
        let (typ, rest) = Self::decode_prefix(bytes)?;
        if !rest.is_empty() {
            return Err(Error::Decode(format!(
                "{} trailing bytes after type {}",
                rest.len(),
                typ.label()
            )));
        }
        Ok(typ)
    }

    fn decode_prefix(bytes: &[u8]) -> Result<(Type, &[u8])> {
        let Some((&tag, rest)) = bytes.split_first() else {
            return Err(Error::Decode("empty type tag".to_string()));
        };
        let simple = match tag {
            TAG_UNSET => Some(Type::Unset),
            TAG_ANY => Some(Type::Any),
            TAG_NIL => Some(Type::Nil),
            TAG_REF => Some(Type::Ref),
            TAG_BOOL => Some(Type::Bool),
            TAG_INT => Some(Type::Int),
            TAG_FLOAT => Some(Type::Float),
            TAG_STRING => Some(Type::String),
            TAG_REGEX => Some(Type::Regex),
            TAG_TIME => Some(Type::Time),
            TAG_DICT => Some(Type::Dict),
            TAG_BLOCK => Some(Type::Block),
            TAG_EMPTY => Some(Type::Empty),
            _ => None,
        };
        if let Some(typ) = simple {
            return Ok((typ, rest));
        }
        match tag {
            TAG_ARRAY => {
                let (child, rest) = Self::decode_prefix(rest)?;
                Ok((Type::array(child), rest))
            }
            TAG_MAP => {
                let (key, rest) = Self::decode_prefix(rest)?;
                let (value, rest) = Self::decode_prefix(rest)?;
                Ok((Type::map(key, value)?, rest))
            }
            TAG_FUNCTION => {
                let (result, rest) = Self::decode_prefix(rest)?;
                Ok((Type::function(result), rest))
            }
            TAG_RESOURCE => {
                let name = std::str::from_utf8(rest)
                    .map_err(|err| Error::Decode(format!("resource name: {err}")))?;
                if name.is_empty() {
                    return Err(Error::Decode("resource type without a name".to_string()));
                }
                Ok((Type::Resource(name.to_string()), &[]))
            }
            other => Err(Error::Decode(format!("unknown type tag {other:#04x}"))),
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

// Serialized through the compact encoding; every tag byte is ASCII so the
// encoding is a valid string.
impl Serialize for Type {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let encoded = String::from_utf8_lossy(&self.encode()).into_owned();
        serializer.serialize_str(&encoded)
    }
}

impl<'de> Deserialize<'de> for Type {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Type::decode(raw.as_bytes()).map_err(serde::de::Error::custom)
    }
}

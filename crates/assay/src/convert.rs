//! Conversion between the wire form and the runtime form of values.
//!
//! Both directions are total: malformed input becomes an error value.
//! Errors cross the wire as their message, so a decoded error is always
//! [`Error::Eval`].

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::warn;

use crate::code::Ref;
use crate::error::{Error, Result};
use crate::types::Type;
use crate::value::{Data, ResourceHandle, RuntimeValue};
use crate::wire::{self, TypedValue};

pub fn to_runtime(value: &TypedValue) -> RuntimeValue {
    if let Some(message) = &value.error {
        return RuntimeValue::typed_error(value.typ.clone(), Error::eval(message.clone()));
    }
    match data_from_wire(value) {
        Ok(data) => RuntimeValue::new(value.typ.clone(), data),
        Err(err) => RuntimeValue::typed_error(value.typ.clone(), err),
    }
}

pub fn to_wire(value: &RuntimeValue) -> TypedValue {
    let mut out = data_to_wire(&value.data, &value.typ);
    out.error = value.error.as_ref().map(ToString::to_string);
    out
}

fn data_from_wire(value: &TypedValue) -> Result<Data> {
    if value.null {
        return Ok(Data::Nil);
    }
    let bytes = value.value.as_slice();
    let data = match &value.typ {
        Type::Unset | Type::Nil | Type::Empty => Data::Nil,
        Type::Any => {
            if bytes.is_empty() && value.array.is_empty() && value.map.is_empty() {
                Data::Nil
            } else {
                return Err(Error::Decode("untyped value carries a payload".to_string()));
            }
        }
        // Absent scalars: a field that exists but holds nothing.
        _ if absent_when_empty(&value.typ) && bytes.is_empty() => Data::Nil,
        Type::Bool => Data::Bool(wire::decode_bool(bytes)?),
        Type::Int => Data::Int(wire::decode_int(bytes)?),
        Type::Float => Data::Float(wire::decode_float(bytes)?),
        Type::String => Data::String(utf8(bytes)?),
        Type::Regex => {
            let pattern = utf8(bytes)?;
            let compiled = regex::Regex::new(&pattern)
                .map_err(|err| Error::Decode(format!("invalid regex: {err}")))?;
            Data::Regex(Arc::new(compiled))
        }
        Type::Time => Data::Time(wire::decode_time(bytes)?),
        Type::Dict => {
            let parsed = serde_json::from_slice(bytes)
                .map_err(|err| Error::Decode(format!("invalid dict: {err}")))?;
            Data::Dict(parsed)
        }
        Type::Ref | Type::Function(_) => Data::Ref(Ref::from_raw(wire::decode_uint(bytes)?)),
        Type::Resource(name) => Data::Resource(ResourceHandle::new(name.clone(), utf8(bytes)?)),
        Type::Array(_) => {
            let items = value
                .array
                .iter()
                .map(data_from_wire)
                .collect::<Result<Vec<_>>>()?;
            Data::array(items)
        }
        Type::Map(key, _) => {
            let mut entries = BTreeMap::new();
            for (name, item) in &value.map {
                if **key == Type::Int && name.parse::<i64>().is_err() {
                    return Err(Error::Decode(format!("map key {name:?} is not an int")));
                }
                entries.insert(name.clone(), data_from_wire(item)?);
            }
            Data::map(entries)
        }
        Type::Block => {
            let entries = value
                .map
                .iter()
                .map(|(name, item)| (name.clone(), to_runtime(item)))
                .collect();
            Data::Block(Arc::new(entries))
        }
    };
    Ok(data)
}

// Strings may legitimately be empty; these may not.
fn absent_when_empty(typ: &Type) -> bool {
    matches!(
        typ,
        Type::Bool
            | Type::Int
            | Type::Float
            | Type::Time
            | Type::Dict
            | Type::Ref
            | Type::Function(_)
            | Type::Resource(_)
    )
}

fn utf8(bytes: &[u8]) -> Result<String> {
    String::from_utf8(bytes.to_vec()).map_err(|err| Error::Decode(format!("invalid utf-8: {err}")))
}

fn data_to_wire(data: &Data, typ: &Type) -> TypedValue {
    match data {
        Data::Nil => match typ {
            Type::Unset | Type::Nil | Type::Any | Type::Empty => {
                TypedValue::scalar(typ.clone(), Vec::new())
            }
            _ => TypedValue::null_of(typ.clone()),
        },
        Data::Bool(value) => TypedValue::scalar(typ.clone(), wire::encode_bool(*value)),
        Data::Int(value) => TypedValue::scalar(typ.clone(), wire::encode_int(*value)),
        Data::Float(value) => TypedValue::scalar(typ.clone(), wire::encode_float(*value)),
        Data::String(value) => TypedValue::scalar(typ.clone(), value.as_bytes().to_vec()),
        Data::Regex(value) => TypedValue::scalar(typ.clone(), value.as_str().as_bytes().to_vec()),
        Data::Time(value) => TypedValue::scalar(typ.clone(), wire::encode_time(*value)),
        Data::Dict(value) => match serde_json::to_vec(value) {
            Ok(bytes) => TypedValue::scalar(typ.clone(), bytes),
            Err(err) => {
                warn!(error = %err, "convert> dict does not serialize, sending null");
                TypedValue::null_of(typ.clone())
            }
        },
        Data::Ref(target) => TypedValue::scalar(typ.clone(), wire::encode_uint(target.raw())),
        Data::Resource(handle) => {
            TypedValue::scalar(Type::resource(handle.name.clone()), handle.id.as_bytes().to_vec())
        }
        Data::Array(items) => {
            let child = typ.child();
            let mut out = TypedValue::scalar(typ.clone(), Vec::new());
            out.array = items.iter().map(|item| element_to_wire(item, &child)).collect();
            out
        }
        Data::Map(entries) => {
            let child = typ.child();
            let mut out = TypedValue::scalar(typ.clone(), Vec::new());
            out.map = entries
                .iter()
                .map(|(key, item)| (key.clone(), element_to_wire(item, &child)))
                .collect();
            out
        }
        Data::Block(entries) => {
            let mut out = TypedValue::scalar(Type::Block, Vec::new());
            out.map = entries
                .iter()
                .map(|(key, item)| (key.clone(), to_wire(item)))
                .collect();
            out
        }
    }
}

// Elements of `[]any` or `map[string]any` keep their own type on the wire.
fn element_to_wire(data: &Data, child: &Type) -> TypedValue {
    if *child == Type::Any {
        return data_to_wire(data, &infer_type(data));
    }
    data_to_wire(data, child)
}

/// Best-effort type of a bare payload.
pub fn infer_type(data: &Data) -> Type {
    match data {
        Data::Nil => Type::Nil,
        Data::Bool(_) => Type::Bool,
        Data::Int(_) => Type::Int,
        Data::Float(_) => Type::Float,
        Data::String(_) => Type::String,
        Data::Regex(_) => Type::Regex,
        Data::Time(_) => Type::Time,
        Data::Dict(_) => Type::Dict,
        Data::Array(_) => Type::array(Type::Any),
        Data::Map(_) => Type::string_map(Type::Any),
        Data::Resource(handle) => Type::resource(handle.name.clone()),
        Data::Block(_) => Type::Block,
        Data::Ref(_) => Type::Ref,
    }
}

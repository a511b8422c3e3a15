use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use regex::Regex;

use crate::code::Ref;
use crate::error::{Error, Result};
use crate::types::Type;

mod json;

/// Key under which a block result carries the resource it was bound to.
pub const BLOCK_BINDING_KEY: &str = "_";
/// Optional key whose truthiness overrides a block's own.
pub const BLOCK_TRUTHY_KEY: &str = "__t";

/// Seconds and nanoseconds since the unix epoch.
///
/// Durations share this representation: a duration of `n` seconds is the
/// time `n` seconds after the epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Time {
    pub secs: i64,
    pub nanos: u32,
}

impl Time {
    pub const NEVER_FUTURE: Time = Time {
        secs: i64::MAX,
        nanos: 0,
    };
    pub const NEVER_PAST: Time = Time {
        secs: -i64::MAX,
        nanos: 0,
    };

    pub fn new(secs: i64, nanos: u32) -> Self {
        Self { secs, nanos }
    }

    pub fn from_secs(secs: i64) -> Self {
        Self::new(secs, 0)
    }

    pub fn now() -> Self {
        Self::from_datetime(Utc::now())
    }

    pub fn from_datetime(value: DateTime<Utc>) -> Self {
        Self::new(value.timestamp(), value.timestamp_subsec_nanos())
    }

    pub fn to_datetime(self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.secs, self.nanos)
    }

    pub fn is_never(self) -> bool {
        self == Self::NEVER_FUTURE || self == Self::NEVER_PAST
    }

    pub fn is_zero(self) -> bool {
        self.secs == 0 && self.nanos == 0
    }
}

/// A resource instance owned by the backend; the engine only keeps its identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceHandle {
    pub name: String,
    pub id: String,
}

impl ResourceHandle {
    pub fn new(name: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: id.into(),
        }
    }
}

/// Payload of a runtime value. Array elements and map values carry only
/// payloads; their type is the container's child type.
#[derive(Debug, Clone)]
pub enum Data {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Regex(Arc<Regex>),
    Time(Time),
    Dict(serde_json::Value),
    Array(Arc<Vec<Data>>),
    Map(Arc<BTreeMap<String, Data>>),
    Resource(ResourceHandle),
    Block(Arc<BTreeMap<String, RuntimeValue>>),
    Ref(Ref),
}

impl Data {
    pub fn array(items: Vec<Data>) -> Data {
        Data::Array(Arc::new(items))
    }

    pub fn map(entries: BTreeMap<String, Data>) -> Data {
        Data::Map(Arc::new(entries))
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Data::Nil)
    }

    pub fn as_array(&self) -> Option<&[Data]> {
        match self {
            Data::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Data>> {
        match self {
            Data::Map(entries) => Some(entries),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Data::String(value) => Some(value),
            Data::Regex(value) => Some(value.as_str()),
            _ => None,
        }
    }

    fn variant(&self) -> &'static str {
        match self {
            Data::Nil => "null",
            Data::Bool(_) => "bool",
            Data::Int(_) => "int",
            Data::Float(_) => "float",
            Data::String(_) => "string",
            Data::Regex(_) => "regex",
            Data::Time(_) => "time",
            Data::Dict(_) => "dict",
            Data::Array(_) => "array",
            Data::Map(_) => "map",
            Data::Resource(_) => "resource",
            Data::Block(_) => "block",
            Data::Ref(_) => "ref",
        }
    }
}

impl PartialEq for Data {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Data::Nil, Data::Nil) => true,
            (Data::Bool(a), Data::Bool(b)) => a == b,
            (Data::Int(a), Data::Int(b)) => a == b,
            (Data::Float(a), Data::Float(b)) => a == b,
            (Data::String(a), Data::String(b)) => a == b,
            (Data::Regex(a), Data::Regex(b)) => a.as_str() == b.as_str(),
            (Data::Time(a), Data::Time(b)) => a == b,
            (Data::Dict(a), Data::Dict(b)) => a == b,
            (Data::Array(a), Data::Array(b)) => a == b,
            (Data::Map(a), Data::Map(b)) => a == b,
            (Data::Resource(a), Data::Resource(b)) => a == b,
            (Data::Block(a), Data::Block(b)) => a == b,
            (Data::Ref(a), Data::Ref(b)) => a == b,
            _ => false,
        }
    }
}

/// The value a chunk computes: a type tag, a payload and an optional error.
///
/// When `error` is set the payload must not be trusted.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeValue {
    pub typ: Type,
    pub data: Data,
    pub error: Option<Error>,
}

impl RuntimeValue {
    pub fn new(typ: Type, data: Data) -> Self {
        Self {
            typ,
            data,
            error: None,
        }
    }

    pub fn nil() -> Self {
        Self::new(Type::Nil, Data::Nil)
    }

    /// An absent value of type `typ`, e.g. a field that exists but is empty.
    pub fn null_of(typ: Type) -> Self {
        Self::new(typ, Data::Nil)
    }

    pub fn bool(value: bool) -> Self {
        Self::new(Type::Bool, Data::Bool(value))
    }

    pub fn int(value: i64) -> Self {
        Self::new(Type::Int, Data::Int(value))
    }

    pub fn float(value: f64) -> Self {
        Self::new(Type::Float, Data::Float(value))
    }

    pub fn string(value: impl Into<String>) -> Self {
        Self::new(Type::String, Data::String(value.into()))
    }

    pub fn regex(pattern: &str) -> Result<Self> {
        let compiled =
            Regex::new(pattern).map_err(|err| Error::eval(format!("invalid regex: {err}")))?;
        Ok(Self::new(Type::Regex, Data::Regex(Arc::new(compiled))))
    }

    pub fn time(value: Time) -> Self {
        Self::new(Type::Time, Data::Time(value))
    }

    pub fn dict(value: serde_json::Value) -> Self {
        Self::new(Type::Dict, Data::Dict(value))
    }

    pub fn array(items: Vec<Data>, child: Type) -> Self {
        Self::new(Type::array(child), Data::array(items))
    }

    pub fn string_map(entries: BTreeMap<String, Data>, child: Type) -> Self {
        Self::new(Type::string_map(child), Data::map(entries))
    }

    pub fn resource(handle: ResourceHandle) -> Self {
        Self::new(Type::resource(handle.name.clone()), Data::Resource(handle))
    }

    pub fn block(entries: BTreeMap<String, RuntimeValue>) -> Self {
        Self::new(Type::Block, Data::Block(Arc::new(entries)))
    }

    pub fn reference(target: Ref) -> Self {
        Self::new(Type::Ref, Data::Ref(target))
    }

    /// An error value carrying no type information.
    pub fn from_error(err: Error) -> Self {
        Self::typed_error(Type::Unset, err)
    }

    pub fn typed_error(typ: Type, err: Error) -> Self {
        Self {
            typ,
            data: Data::Nil,
            error: Some(err),
        }
    }

    pub fn with_error(mut self, err: Option<Error>) -> Self {
        self.error = err;
        self
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Truthiness used by conditions, filters and assessments.
    pub fn is_truthy(&self) -> bool {
        is_truthy(&self.data, &self.typ)
    }

    /// True when the value is truthy and carries no error.
    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.is_truthy()
    }

    /// Returns the element `index` of an array payload as a standalone value.
    pub fn element(&self, index: usize) -> Option<RuntimeValue> {
        let items = self.data.as_array()?;
        items
            .get(index)
            .map(|item| RuntimeValue::new(self.typ.child(), item.clone()))
    }

    /// A short description of the payload kind, used in error messages.
    pub fn describe(&self) -> String {
        format!("{} ({})", self.typ.label(), self.data.variant())
    }
}

fn is_truthy(data: &Data, typ: &Type) -> bool {
    match data {
        Data::Nil => false,
        Data::Bool(value) => *value,
        Data::Int(value) => *value != 0,
        Data::Float(value) => *value != 0.0,
        Data::String(value) => !value.is_empty(),
        Data::Regex(value) => !value.as_str().is_empty(),
        Data::Time(value) => !value.is_zero(),
        Data::Dict(value) => dict_truthy(value),
        Data::Array(items) => {
            let child = typ.child();
            !items.is_empty() && items.iter().all(|item| is_truthy(item, &child))
        }
        Data::Map(entries) => {
            let child = typ.child();
            entries.values().all(|item| is_truthy(item, &child))
        }
        Data::Resource(_) => true,
        Data::Block(entries) => {
            if let Some(explicit) = entries.get(BLOCK_TRUTHY_KEY) {
                return explicit.is_truthy();
            }
            entries
                .iter()
                .filter(|(key, _)| key.as_str() != BLOCK_BINDING_KEY)
                .all(|(_, value)| value.error.is_none() && value.is_truthy())
        }
        Data::Ref(_) => true,
    }
}

fn dict_truthy(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => false,
        serde_json::Value::Bool(value) => *value,
        serde_json::Value::Number(value) => value.as_f64().map(|n| n != 0.0).unwrap_or(false),
        serde_json::Value::String(value) => !value.is_empty(),
        serde_json::Value::Array(items) => !items.is_empty() && items.iter().all(dict_truthy),
        serde_json::Value::Object(entries) => entries.values().all(dict_truthy),
    }
}

impl fmt::Display for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_never() {
            return f.write_str("Never");
        }
        match self.to_datetime() {
            Some(value) => write!(f, "{}", value.to_rfc3339()),
            None => write!(f, "{}s", self.secs),
        }
    }
}

impl fmt::Display for Data {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Data::Nil => f.write_str("null"),
            Data::Bool(value) => write!(f, "{value}"),
            Data::Int(value) => write!(f, "{value}"),
            Data::Float(value) => write!(f, "{value}"),
            Data::String(value) => write!(f, "{value:?}"),
            Data::Regex(value) => write!(f, "/{}/", value.as_str()),
            Data::Time(value) => write!(f, "{value}"),
            Data::Dict(value) => write!(f, "{value}"),
            Data::Array(items) => {
                f.write_str("[")?;
                for (idx, item) in items.iter().enumerate() {
                    if idx > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            Data::Map(entries) => {
                f.write_str("{")?;
                for (idx, (key, item)) in entries.iter().enumerate() {
                    if idx > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{key:?}: {item}")?;
                }
                f.write_str("}")
            }
            Data::Resource(handle) => write!(f, "{} id = {}", handle.name, handle.id),
            Data::Block(entries) => {
                f.write_str("{")?;
                for (idx, (key, item)) in entries.iter().enumerate() {
                    if idx > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{key}: {item}")?;
                }
                f.write_str("}")
            }
            Data::Ref(target) => write!(f, "<ref {target}>"),
        }
    }
}

impl fmt::Display for RuntimeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.error {
            Some(err) => write!(f, "error: {err}"),
            None => write!(f, "{}", self.data),
        }
    }
}

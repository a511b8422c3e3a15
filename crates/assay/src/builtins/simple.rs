//! Comparison, logic and arithmetic shared by all scalar kinds.

use std::cmp::Ordering;

use serde_json::Value as Json;

use super::{Builtins, Handler, Returns};
use crate::error::{Error, Result};
use crate::types::{Kind, Type};
use crate::value::{Data, RuntimeValue};

/// Kinds that can appear on either side of `==`, `!=`, `&&` and `||`.
pub(super) const OPERAND_KINDS: [Kind; 12] = [
    Kind::Nil,
    Kind::Bool,
    Kind::Int,
    Kind::Float,
    Kind::String,
    Kind::Regex,
    Kind::Time,
    Kind::Dict,
    Kind::Array,
    Kind::Map,
    Kind::Resource,
    Kind::Function,
];

pub(super) fn register(table: &mut Builtins) {
    for kind in OPERAND_KINDS {
        for target in OPERAND_KINDS {
            let label = target.label();
            // Arrays resolve their own comparisons and logic.
            if kind != Kind::Array {
                table.add(kind, format!("=={label}"), Handler::Binary(eq), Returns::Bool);
                table.add(kind, format!("!={label}"), Handler::Binary(ne), Returns::Bool);
                table.add(kind, format!("&&{label}"), Handler::Binary(and), Returns::Bool);
                table.add(kind, format!("||{label}"), Handler::Binary(or), Returns::Bool);
            }
        }
    }

    let ordered: [(Kind, &[Kind]); 5] = [
        (Kind::Int, &[Kind::Int, Kind::Float, Kind::String, Kind::Dict]),
        (Kind::Float, &[Kind::Int, Kind::Float, Kind::String, Kind::Dict]),
        (Kind::String, &[Kind::Int, Kind::Float, Kind::String, Kind::Dict]),
        (Kind::Dict, &[Kind::Int, Kind::Float, Kind::String, Kind::Dict]),
        (Kind::Time, &[Kind::Time]),
    ];
    for (kind, targets) in ordered {
        for target in targets {
            let label = target.label();
            table.add(kind, format!("<{label}"), Handler::Binary(lt), Returns::Bool);
            table.add(kind, format!("<={label}"), Handler::Binary(le), Returns::Bool);
            table.add(kind, format!(">{label}"), Handler::Binary(gt), Returns::Bool);
            table.add(kind, format!(">={label}"), Handler::Binary(ge), Returns::Bool);
        }
    }

    for (kind, target, returns) in [
        (Kind::Int, Kind::Int, Returns::Int),
        (Kind::Int, Kind::Float, Returns::Float),
        (Kind::Int, Kind::Dict, Returns::Float),
        (Kind::Float, Kind::Int, Returns::Float),
        (Kind::Float, Kind::Float, Returns::Float),
        (Kind::Float, Kind::Dict, Returns::Float),
        (Kind::Dict, Kind::Int, Returns::Float),
        (Kind::Dict, Kind::Float, Returns::Float),
    ] {
        let label = target.label();
        table.add(kind, format!("+{label}"), Handler::Binary(add), returns);
        table.add(kind, format!("-{label}"), Handler::Binary(sub), returns);
        table.add(kind, format!("*{label}"), Handler::Binary(mul), returns);
        table.add(kind, format!("/{label}"), Handler::Binary(div), returns);
    }
    table.add(Kind::Int, "*time", Handler::Binary(mul), Returns::Time);
    table.add(Kind::Float, "*time", Handler::Binary(mul), Returns::Time);
}

pub(super) fn eq(left: &RuntimeValue, right: &RuntimeValue) -> Result<RuntimeValue> {
    Ok(RuntimeValue::bool(values_equal(left, right)))
}

pub(super) fn ne(left: &RuntimeValue, right: &RuntimeValue) -> Result<RuntimeValue> {
    Ok(RuntimeValue::bool(!values_equal(left, right)))
}

pub(super) fn and(left: &RuntimeValue, right: &RuntimeValue) -> Result<RuntimeValue> {
    Ok(RuntimeValue::bool(left.is_truthy() && right.is_truthy()))
}

pub(super) fn or(left: &RuntimeValue, right: &RuntimeValue) -> Result<RuntimeValue> {
    Ok(RuntimeValue::bool(left.is_truthy() || right.is_truthy()))
}

/// Equality across kinds: numbers compare numerically, scalars against
/// strings compare by their text, regexes match.
pub fn values_equal(left: &RuntimeValue, right: &RuntimeValue) -> bool {
    data_equal(&left.data, &left.typ, &right.data, &right.typ)
}

fn data_equal(left: &Data, left_typ: &Type, right: &Data, right_typ: &Type) -> bool {
    match (left, right) {
        (Data::Nil, Data::Nil) => true,
        (Data::Nil, _) | (_, Data::Nil) => false,
        (Data::Int(a), Data::Float(b)) | (Data::Float(b), Data::Int(a)) => *a as f64 == *b,
        (Data::Regex(a), Data::Regex(b)) => a.as_str() == b.as_str(),
        (Data::Regex(re), other) | (other, Data::Regex(re)) => {
            scalar_text(other).is_some_and(|text| re.is_match(&text))
        }
        (Data::String(text), other @ (Data::Int(_) | Data::Float(_) | Data::Bool(_)))
        | (other @ (Data::Int(_) | Data::Float(_) | Data::Bool(_)), Data::String(text)) => {
            scalar_text(other).is_some_and(|other| other == *text)
        }
        (Data::Dict(json), other) | (other, Data::Dict(json)) => dict_equal(json, other),
        (Data::Array(a), Data::Array(b)) => {
            let (left_child, right_child) = (left_typ.child(), right_typ.child());
            a.len() == b.len()
                && a.iter()
                    .zip(b.iter())
                    .all(|(a, b)| data_equal(a, &left_child, b, &right_child))
        }
        (Data::Map(a), Data::Map(b)) => {
            let (left_child, right_child) = (left_typ.child(), right_typ.child());
            a.len() == b.len()
                && a.iter().all(|(key, a)| {
                    b.get(key)
                        .is_some_and(|b| data_equal(a, &left_child, b, &right_child))
                })
        }
        _ => left == right,
    }
}

/// Text form of a scalar, as used when comparing it to a string.
pub(super) fn scalar_text(data: &Data) -> Option<String> {
    match data {
        Data::String(value) => Some(value.clone()),
        Data::Int(value) => Some(value.to_string()),
        Data::Float(value) => Some(value.to_string()),
        Data::Bool(value) => Some(value.to_string()),
        _ => None,
    }
}

fn dict_equal(json: &Json, other: &Data) -> bool {
    match (json, other) {
        (Json::Number(number), Data::Int(value)) => number.as_f64() == Some(*value as f64),
        (Json::Number(number), Data::Float(value)) => number.as_f64() == Some(*value),
        (Json::String(text), Data::String(value)) => text == value,
        (Json::Bool(flag), Data::Bool(value)) => flag == value,
        (Json::Null, Data::Nil) => true,
        (json, Data::Dict(other)) => json == other,
        (json, other) => {
            let typ = crate::convert::infer_type(other);
            RuntimeValue::new(typ, other.clone()).to_json() == *json
        }
    }
}

/// A dict holding a plain scalar, as data.
fn dict_scalar(json: &Json) -> Option<Data> {
    match json {
        Json::Null => Some(Data::Nil),
        Json::Bool(flag) => Some(Data::Bool(*flag)),
        Json::Number(number) => number
            .as_i64()
            .map(Data::Int)
            .or_else(|| number.as_f64().map(Data::Float)),
        Json::String(text) => Some(Data::String(text.clone())),
        _ => None,
    }
}

fn number(data: &Data) -> Option<f64> {
    match data {
        Data::Int(value) => Some(*value as f64),
        Data::Float(value) => Some(*value),
        Data::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

/// Ordering of two values; `None` when either side is null.
fn ordering(left: &RuntimeValue, right: &RuntimeValue) -> Result<Option<Ordering>> {
    ordering_of(&left.data, &right.data).ok_or_else(|| {
        Error::type_mismatch(
            format!("a value comparable to {}", left.describe()),
            right.describe(),
        )
    })
}

fn ordering_of(left: &Data, right: &Data) -> Option<Option<Ordering>> {
    match (left, right) {
        (Data::Nil, _) | (_, Data::Nil) => Some(None),
        (Data::Dict(json), other) => ordering_of(&dict_scalar(json)?, other),
        (other, Data::Dict(json)) => ordering_of(other, &dict_scalar(json)?),
        (Data::Int(a), Data::Int(b)) => Some(Some(a.cmp(b))),
        (Data::String(a), Data::String(b)) => Some(Some(a.cmp(b))),
        (Data::Time(a), Data::Time(b)) => Some(Some(a.cmp(b))),
        (a, b) => Some(number(a)?.partial_cmp(&number(b)?)),
    }
}

fn lt(left: &RuntimeValue, right: &RuntimeValue) -> Result<RuntimeValue> {
    Ok(RuntimeValue::bool(ordering(left, right)? == Some(Ordering::Less)))
}

fn le(left: &RuntimeValue, right: &RuntimeValue) -> Result<RuntimeValue> {
    Ok(RuntimeValue::bool(matches!(
        ordering(left, right)?,
        Some(Ordering::Less | Ordering::Equal)
    )))
}

fn gt(left: &RuntimeValue, right: &RuntimeValue) -> Result<RuntimeValue> {
    Ok(RuntimeValue::bool(ordering(left, right)? == Some(Ordering::Greater)))
}

fn ge(left: &RuntimeValue, right: &RuntimeValue) -> Result<RuntimeValue> {
    Ok(RuntimeValue::bool(matches!(
        ordering(left, right)?,
        Some(Ordering::Greater | Ordering::Equal)
    )))
}

#[derive(Debug, Clone, Copy)]
enum Arith {
    Add,
    Sub,
    Mul,
    Div,
}

impl Arith {
    fn symbol(self) -> &'static str {
        match self {
            Arith::Add => "+",
            Arith::Sub => "-",
            Arith::Mul => "*",
            Arith::Div => "/",
        }
    }

    fn ints(self, a: i64, b: i64) -> Result<i64> {
        let result = match self {
            Arith::Add => a.checked_add(b),
            Arith::Sub => a.checked_sub(b),
            Arith::Mul => a.checked_mul(b),
            Arith::Div if b == 0 => return Err(Error::DivisionByZero),
            Arith::Div => a.checked_div(b),
        };
        result.ok_or_else(|| Error::eval(format!("integer overflow in {a} {} {b}", self.symbol())))
    }

    fn floats(self, a: f64, b: f64) -> Result<f64> {
        Ok(match self {
            Arith::Add => a + b,
            Arith::Sub => a - b,
            Arith::Mul => a * b,
            Arith::Div if b == 0.0 => return Err(Error::DivisionByZero),
            Arith::Div => a / b,
        })
    }

    fn apply(self, left: &RuntimeValue, right: &RuntimeValue) -> Result<RuntimeValue> {
        let left_data = match &left.data {
            Data::Dict(json) => dict_scalar(json).unwrap_or(Data::Nil),
            other => other.clone(),
        };
        let right_data = match &right.data {
            Data::Dict(json) => dict_scalar(json).unwrap_or(Data::Nil),
            other => other.clone(),
        };
        match (&left_data, &right_data) {
            (Data::Nil, _) | (_, Data::Nil) => Ok(RuntimeValue::null_of(result_type(left, right))),
            (Data::Int(a), Data::Int(b)) if left.typ != Type::Dict && right.typ != Type::Dict => {
                Ok(RuntimeValue::int(self.ints(*a, *b)?))
            }
            (Data::Time(time), other) | (other, Data::Time(time))
                if matches!(self, Arith::Mul) =>
            {
                let factor = number(other).ok_or_else(|| self.unsupported(left, right))?;
                Ok(RuntimeValue::time(super::time::scale(*time, factor)))
            }
            (a, b) => {
                let (Some(a), Some(b)) = (numeric(a), numeric(b)) else {
                    return Err(self.unsupported(left, right));
                };
                Ok(RuntimeValue::float(self.floats(a, b)?))
            }
        }
    }

    fn unsupported(self, left: &RuntimeValue, right: &RuntimeValue) -> Error {
        Error::unsupported(
            format!("{}{}", self.symbol(), right.typ.label()),
            left.typ.label(),
        )
    }
}

fn numeric(data: &Data) -> Option<f64> {
    match data {
        Data::Int(value) => Some(*value as f64),
        Data::Float(value) => Some(*value),
        _ => None,
    }
}

fn result_type(left: &RuntimeValue, right: &RuntimeValue) -> Type {
    match (&left.typ, &right.typ) {
        (Type::Int, Type::Int) => Type::Int,
        (Type::Time, _) | (_, Type::Time) => Type::Time,
        _ => Type::Float,
    }
}

fn add(left: &RuntimeValue, right: &RuntimeValue) -> Result<RuntimeValue> {
    Arith::Add.apply(left, right)
}

fn sub(left: &RuntimeValue, right: &RuntimeValue) -> Result<RuntimeValue> {
    Arith::Sub.apply(left, right)
}

fn mul(left: &RuntimeValue, right: &RuntimeValue) -> Result<RuntimeValue> {
    Arith::Mul.apply(left, right)
}

fn div(left: &RuntimeValue, right: &RuntimeValue) -> Result<RuntimeValue> {
    Arith::Div.apply(left, right)
}

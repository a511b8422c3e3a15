//! Unbound calls: control flow and conversions.

use super::{arg, Builtins};
use crate::code::{Chunk, Ref};
use crate::error::{Error, Result};
use crate::executor::{BlockExecutor, Lookup, Step};
use crate::types::Type;
use crate::value::{Data, RuntimeValue};

pub(super) fn register(table: &mut Builtins) {
    table.add_global("if", if_call);
    table.add_global("switch", switch_call);
    table.add_global("expect", expect_call);
    table.add_global("return", return_call);
    table.add_global("typeof", typeof_call);
    table.add_global("createResource", create_resource_call);
    table.add_global("string", string_call);
    table.add_global("regex", regex_call);
    table.add_global("int", int_call);
    table.add_global("float", float_call);
    table.add_global("bool", bool_call);
    table.add_global("dict", dict_call);
}

/// Resolves the only argument of `name`.
fn single(exec: &BlockExecutor, chunk: &Chunk, at: Ref, name: &str) -> Result<Lookup> {
    if chunk.args().len() != 1 {
        return Err(Error::eval(format!(
            "called `{name}` with {} arguments, expected one",
            chunk.args().len()
        )));
    }
    exec.resolve_value(&chunk.args()[0], at)
}

/// Arguments come in `condition, block, block args` triples, optionally
/// followed by an `else` block and its args.
fn if_call(exec: &BlockExecutor, chunk: &Chunk, at: Ref) -> Result<Step> {
    let args = chunk.args();
    if args.len() < 3 {
        return Err(Error::eval(format!(
            "called `if` with {} arguments, expected at least 3",
            args.len()
        )));
    }
    let mut idx = 0;
    while idx + 2 < args.len() {
        let condition = ready!(exec.resolve_value(&args[idx], at));
        if let Some(err) = condition.error {
            return Err(err);
        }
        if condition.is_truthy() {
            return exec.run_block(at, None, &args[idx + 1], &args[idx + 2].array);
        }
        idx += 3;
    }
    if idx + 1 < args.len() {
        return exec.run_block(at, None, &args[idx], &args[idx + 1].array);
    }
    Ok(Step::Value(RuntimeValue::nil()))
}

/// The first argument is the value cases bind to (unset for none). A case
/// whose condition is a plain bool literal is the default.
fn switch_call(exec: &BlockExecutor, chunk: &Chunk, at: Ref) -> Result<Step> {
    let args = chunk.args();
    if args.len() < 2 {
        return Err(Error::eval(
            "called `switch` with no arguments, expected at least one case",
        ));
    }
    let bind = match args[0].typ {
        Type::Unset => None,
        _ => Some(ready!(exec.resolve_value(&args[0], at))),
    };

    let mut default = None;
    let mut idx = 1;
    while idx + 2 < args.len() {
        if args[idx].typ == Type::Bool {
            default = Some(idx);
            idx += 3;
            continue;
        }
        let condition = ready!(exec.resolve_value(&args[idx], at));
        if condition.is_truthy() {
            return exec.run_block(at, bind, &args[idx + 1], &args[idx + 2].array);
        }
        idx += 3;
    }
    match default {
        Some(idx) => exec.run_block(at, None, &args[idx + 1], &args[idx + 2].array),
        None => Ok(Step::Value(RuntimeValue::nil())),
    }
}

fn expect_call(exec: &BlockExecutor, chunk: &Chunk, at: Ref) -> Result<Step> {
    let value = ready!(single(exec, chunk, at, "expect"));
    if value.typ != Type::Bool {
        return Err(Error::eval(
            "called `expect` with wrong type, it should be a boolean (type mismatch)",
        ));
    }
    Ok(Step::Value(value))
}

fn return_call(exec: &BlockExecutor, chunk: &Chunk, at: Ref) -> Result<Step> {
    let value = ready!(exec.resolve_value(arg(chunk, 0)?, at));
    Ok(Step::Value(value))
}

fn typeof_call(exec: &BlockExecutor, chunk: &Chunk, at: Ref) -> Result<Step> {
    let value = ready!(single(exec, chunk, at, "typeof"));
    Ok(Step::Value(RuntimeValue::string(value.typ.label())))
}

/// `createResource(id, name, value, ...)`; the resource comes from the
/// chunk's type.
fn create_resource_call(exec: &BlockExecutor, chunk: &Chunk, at: Ref) -> Result<Step> {
    let count = chunk.args().len();
    if count == 0 || count % 2 != 1 {
        return Err(Error::eval(
            "called `createResource` with an invalid number of arguments",
        ));
    }
    let Some(name) = chunk.typ().resource_name() else {
        return Err(Error::type_mismatch("resource", chunk.typ().label()));
    };
    let mut values = ready!(exec.resolve_args(chunk.args(), at));
    let id = match values.remove(0).data {
        Data::String(id) => id,
        other => {
            return Err(Error::type_mismatch(
                "string resource id",
                format!("{other}"),
            ))
        }
    };
    exec.create_resource_with_id(name, &id, values).map(Step::Value)
}

/// Text of a scalar; `None` for anything else.
fn scalar_text(data: &Data) -> Option<String> {
    match data {
        Data::String(text) => Some(text.clone()),
        Data::Int(value) => Some(value.to_string()),
        Data::Float(value) => Some(format!("{value:.2}")),
        Data::Bool(value) => Some(value.to_string()),
        _ => None,
    }
}

fn string_call(exec: &BlockExecutor, chunk: &Chunk, at: Ref) -> Result<Step> {
    let value = ready!(single(exec, chunk, at, "string"));
    Ok(Step::Value(match scalar_text(&value.data) {
        Some(text) => RuntimeValue::string(text),
        None => RuntimeValue::nil(),
    }))
}

fn regex_call(exec: &BlockExecutor, chunk: &Chunk, at: Ref) -> Result<Step> {
    let value = ready!(single(exec, chunk, at, "regex"));
    if matches!(value.data, Data::Regex(_)) {
        return Ok(Step::Value(value));
    }
    Ok(Step::Value(match scalar_text(&value.data) {
        Some(pattern) => RuntimeValue::regex(&pattern)?,
        None => RuntimeValue::nil(),
    }))
}

fn int_call(exec: &BlockExecutor, chunk: &Chunk, at: Ref) -> Result<Step> {
    let value = ready!(single(exec, chunk, at, "int"));
    Ok(Step::Value(match &value.data {
        Data::String(text) => RuntimeValue::int(
            text.trim()
                .parse()
                .map_err(|_| Error::eval(format!("cannot convert '{text}' to int")))?,
        ),
        Data::Int(number) => RuntimeValue::int(*number),
        Data::Float(number) => RuntimeValue::int(number.trunc() as i64),
        Data::Bool(flag) => RuntimeValue::int(i64::from(*flag)),
        _ => RuntimeValue::nil(),
    }))
}

fn float_call(exec: &BlockExecutor, chunk: &Chunk, at: Ref) -> Result<Step> {
    let value = ready!(single(exec, chunk, at, "float"));
    Ok(Step::Value(match &value.data {
        Data::String(text) => RuntimeValue::float(
            text.trim()
                .parse()
                .map_err(|_| Error::eval(format!("cannot convert '{text}' to float")))?,
        ),
        Data::Int(number) => RuntimeValue::float(*number as f64),
        Data::Float(number) => RuntimeValue::float(*number),
        Data::Bool(flag) => RuntimeValue::float(if *flag { 1.0 } else { 0.0 }),
        _ => RuntimeValue::nil(),
    }))
}

fn bool_call(exec: &BlockExecutor, chunk: &Chunk, at: Ref) -> Result<Step> {
    let value = ready!(single(exec, chunk, at, "bool"));
    Ok(Step::Value(match &value.data {
        Data::String(text) => RuntimeValue::bool(text == "true"),
        Data::Int(number) => RuntimeValue::bool(*number != 0),
        Data::Float(number) => RuntimeValue::bool(*number != 0.0),
        Data::Bool(flag) => RuntimeValue::bool(*flag),
        _ => RuntimeValue::nil(),
    }))
}

fn dict_call(exec: &BlockExecutor, chunk: &Chunk, at: Ref) -> Result<Step> {
    let value = ready!(single(exec, chunk, at, "dict"));
    if matches!(value.data, Data::Dict(_)) {
        return Ok(Step::Value(value));
    }
    Ok(Step::Value(match &value.data {
        Data::String(_)
        | Data::Int(_)
        | Data::Float(_)
        | Data::Bool(_)
        | Data::Array(_)
        | Data::Map(_) => RuntimeValue::dict(value.to_json()),
        _ => RuntimeValue::nil(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalars_render_as_text() {
        assert_eq!(scalar_text(&Data::Float(1.0 / 3.0)).as_deref(), Some("0.33"));
        assert_eq!(scalar_text(&Data::Int(-7)).as_deref(), Some("-7"));
        assert_eq!(scalar_text(&Data::Bool(true)).as_deref(), Some("true"));
        assert_eq!(scalar_text(&Data::Nil), None);
    }
}

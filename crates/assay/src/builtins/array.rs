//! Array builtins, including the per-element block combinators.

use std::sync::Arc;

use super::simple::{self, OPERAND_KINDS};
use super::{arg, arg_value, Builtins, Handler, Returns};
use crate::code::{Chunk, Ref};
use crate::error::{Error, Result};
use crate::executor::{element_errors, Aggregate, BlockExecutor, BlockResult, Step};
use crate::types::{Kind, Type};
use crate::value::{Data, RuntimeValue};

/// Element kinds with dedicated comparison signatures.
const SCALAR_KINDS: [Kind; 7] = [
    Kind::Bool,
    Kind::Int,
    Kind::Float,
    Kind::String,
    Kind::Regex,
    Kind::Time,
    Kind::Dict,
];

pub(super) fn register(table: &mut Builtins) {
    let a = Kind::Array;
    for child in SCALAR_KINDS {
        for target in SCALAR_KINDS {
            let (child, target) = (child.label(), target.label());
            table.add(a, format!("{child}=={target}"), Handler::Binary(lift_eq), Returns::Bool);
            table.add(a, format!("{child}!={target}"), Handler::Binary(lift_ne), Returns::Bool);
            table.add(a, format!("{child}==[]{target}"), Handler::Binary(simple::eq), Returns::Bool);
            table.add(a, format!("{child}!=[]{target}"), Handler::Binary(simple::ne), Returns::Bool);
        }
    }
    table.add(a, "==null", Handler::Binary(simple::eq), Returns::Bool);
    table.add(a, "!=null", Handler::Binary(simple::ne), Returns::Bool);
    table.add(a, "==", Handler::Binary(simple::eq), Returns::Bool);
    table.add(a, "!=", Handler::Binary(simple::ne), Returns::Bool);
    table.add(a, "+", Handler::Binary(concat), Returns::Receiver);
    for target in OPERAND_KINDS {
        let label = target.label();
        table.add(a, format!("any&&{label}"), Handler::Binary(simple::and), Returns::Bool);
        table.add(a, format!("any||{label}"), Handler::Binary(simple::or), Returns::Bool);
    }
    table.add_compiler(a, "==", compile_equality::<false>, Returns::Bool);
    table.add_compiler(a, "!=", compile_equality::<true>, Returns::Bool);
    table.add_compiler(a, "+", compile_concat, Returns::Receiver);
    table.add_compiler(a, "&&", compile_logical::<false>, Returns::Bool);
    table.add_compiler(a, "||", compile_logical::<true>, Returns::Bool);

    table.add(a, "[]", Handler::Binary(index), Returns::Child);
    table.add(a, "first", Handler::Method(first), Returns::Child);
    table.add(a, "last", Handler::Method(last), Returns::Child);
    table.add(a, "length", Handler::Method(length), Returns::Int);
    table.add(a, "notEmpty", Handler::Method(not_empty), Returns::Bool);
    table.add(a, "duplicates", Handler::Method(duplicates), Returns::Receiver);
    table.add(a, "unique", Handler::Method(unique), Returns::Receiver);
    table.add(a, "difference", Handler::Method(difference), Returns::Receiver);
    table.add(a, "containsNone", Handler::Method(contains_none), Returns::Bool);
    table.add(a, "$all", Handler::Method(all), Returns::Bool);
    table.add(a, "$any", Handler::Method(any), Returns::Bool);
    table.add(a, "$none", Handler::Method(none), Returns::Bool);
    table.add(a, "$one", Handler::Method(one), Returns::Bool);
    table.add(a, "where", Handler::Exec(filter_kept), Returns::Receiver);
    table.add(a, "$whereNot", Handler::Exec(filter_dropped), Returns::Receiver);
    table.add(a, "map", Handler::Exec(map), Returns::Mapped);
    table.add(a, "fieldDuplicates", Handler::Exec(field_duplicates), Returns::Receiver);
    table.add(a, "{}", Handler::Exec(block_per_element), Returns::Blocks);
    table.add(a, "${}", Handler::Exec(block_call), Returns::Block);
}

fn compile_equality<const NOT: bool>(receiver: &Type, argument: &Type) -> Result<String> {
    let op = if NOT { "!=" } else { "==" };
    if *argument == Type::Nil {
        return Ok(format!("{op}null"));
    }
    let specific = format!("{}{op}{}", receiver.child().label(), argument.label());
    if super::table().entry(Kind::Array, &specific).is_some() {
        return Ok(specific);
    }
    Ok(op.to_string())
}

fn compile_concat(receiver: &Type, argument: &Type) -> Result<String> {
    if argument.is_array() {
        return Ok("+".to_string());
    }
    Err(Error::unsupported(format!("+{}", argument.label()), receiver.label()))
}

fn compile_logical<const OR: bool>(receiver: &Type, argument: &Type) -> Result<String> {
    let op = if OR { "||" } else { "&&" };
    let name = format!("any{op}{}", argument.kind().label());
    if super::table().entry(Kind::Array, &name).is_some() {
        return Ok(name);
    }
    Err(Error::eval(format!(
        "cannot find operation for {} {op} {}",
        receiver.label(),
        argument.label()
    )))
}

/// A one-element list compares like its element.
fn lift_eq(left: &RuntimeValue, right: &RuntimeValue) -> Result<RuntimeValue> {
    let equal = match left.data.as_array() {
        Some([_]) => left
            .element(0)
            .is_some_and(|only| simple::values_equal(&only, right)),
        _ => false,
    };
    Ok(RuntimeValue::bool(equal))
}

fn lift_ne(left: &RuntimeValue, right: &RuntimeValue) -> Result<RuntimeValue> {
    let equal = lift_eq(left, right)?;
    Ok(RuntimeValue::bool(!equal.is_truthy()))
}

fn concat(left: &RuntimeValue, right: &RuntimeValue) -> Result<RuntimeValue> {
    match (&left.data, &right.data) {
        (Data::Array(a), Data::Array(b)) => {
            let items = a.iter().chain(b.iter()).cloned().collect();
            Ok(RuntimeValue::array(items, left.typ.child()))
        }
        (Data::Nil, _) | (_, Data::Nil) => Ok(RuntimeValue::null_of(left.typ.clone())),
        _ => Err(Error::unsupported(format!("+{}", right.typ.label()), left.typ.label())),
    }
}

fn index(list: &RuntimeValue, key: &RuntimeValue) -> Result<RuntimeValue> {
    let Some(items) = list.data.as_array() else {
        return Ok(RuntimeValue::null_of(list.typ.child()));
    };
    let Data::Int(requested) = key.data else {
        return Err(Error::type_mismatch("int index", key.describe()));
    };
    let len = items.len() as i64;
    let position = if requested < 0 { len + requested } else { requested };
    if position < 0 || position >= len {
        return Err(Error::IndexOutOfBounds {
            index: requested,
            max: len - 1,
        });
    }
    Ok(RuntimeValue::new(list.typ.child(), items[position as usize].clone()))
}

fn edge(list: &RuntimeValue, last: bool) -> Result<RuntimeValue> {
    let Some(items) = list.data.as_array() else {
        return Ok(RuntimeValue::null_of(list.typ.child()));
    };
    let item = if last { items.last() } else { items.first() };
    match item {
        Some(item) => Ok(RuntimeValue::new(list.typ.child(), item.clone())),
        None => Err(Error::eval(format!(
            "array index out of bound (trying to access {} element on an empty array)",
            if last { "last" } else { "first" }
        ))),
    }
}

fn first(list: &RuntimeValue, _: &[RuntimeValue]) -> Result<RuntimeValue> {
    edge(list, false)
}

fn last(list: &RuntimeValue, _: &[RuntimeValue]) -> Result<RuntimeValue> {
    edge(list, true)
}

fn length(list: &RuntimeValue, _: &[RuntimeValue]) -> Result<RuntimeValue> {
    Ok(match list.data.as_array() {
        Some(items) => RuntimeValue::int(items.len() as i64),
        None => RuntimeValue::null_of(Type::Int),
    })
}

fn not_empty(list: &RuntimeValue, _: &[RuntimeValue]) -> Result<RuntimeValue> {
    Ok(RuntimeValue::bool(
        list.data.as_array().is_some_and(|items| !items.is_empty()),
    ))
}

fn same(typ: &Type, a: &Data, b: &Data) -> bool {
    simple::values_equal(
        &RuntimeValue::new(typ.clone(), a.clone()),
        &RuntimeValue::new(typ.clone(), b.clone()),
    )
}

/// Splits a list into its first occurrences and the values seen more than once.
fn partition_duplicates(list: &RuntimeValue) -> Option<(Vec<Data>, Vec<Data>)> {
    let items = list.data.as_array()?;
    let child = list.typ.child();
    let mut unique: Vec<Data> = Vec::new();
    let mut dupes: Vec<Data> = Vec::new();
    for item in items {
        if !unique.iter().any(|seen| same(&child, seen, item)) {
            unique.push(item.clone());
        } else if !dupes.iter().any(|seen| same(&child, seen, item)) {
            dupes.push(item.clone());
        }
    }
    Some((unique, dupes))
}

fn duplicates(list: &RuntimeValue, _: &[RuntimeValue]) -> Result<RuntimeValue> {
    Ok(match partition_duplicates(list) {
        Some((_, dupes)) => RuntimeValue::array(dupes, list.typ.child()),
        None => RuntimeValue::null_of(list.typ.clone()),
    })
}

fn unique(list: &RuntimeValue, _: &[RuntimeValue]) -> Result<RuntimeValue> {
    Ok(match partition_duplicates(list) {
        Some((unique, _)) => RuntimeValue::array(unique, list.typ.child()),
        None => RuntimeValue::null_of(list.typ.clone()),
    })
}

fn other_list<'a>(list: &RuntimeValue, args: &'a [RuntimeValue], name: &str) -> Result<&'a [Data]> {
    let other = arg_value(args, 0, name)?;
    match other.data.as_array() {
        Some(items) => Ok(items),
        None if other.data.is_nil() => Ok(&[]),
        None => Err(Error::type_mismatch(list.typ.label(), other.describe())),
    }
}

fn difference(list: &RuntimeValue, args: &[RuntimeValue]) -> Result<RuntimeValue> {
    let Some(items) = list.data.as_array() else {
        return Ok(RuntimeValue::null_of(list.typ.clone()));
    };
    let filters = other_list(list, args, "difference")?;
    let child = list.typ.child();
    let kept = items
        .iter()
        .filter(|item| !filters.iter().any(|filter| same(&child, item, filter)))
        .cloned()
        .collect();
    Ok(RuntimeValue::array(kept, child))
}

fn contains_none(list: &RuntimeValue, args: &[RuntimeValue]) -> Result<RuntimeValue> {
    let Some(items) = list.data.as_array() else {
        return Ok(RuntimeValue::null_of(Type::Bool));
    };
    let filters = other_list(list, args, "containsNone")?;
    let child = list.typ.child();
    let hit = items
        .iter()
        .any(|item| filters.iter().any(|filter| same(&child, item, filter)));
    Ok(RuntimeValue::bool(!hit))
}

/// `$all`, `$any`, `$none` and `$one` look at an already filtered list.
fn count_check(list: &RuntimeValue, check: fn(usize) -> bool) -> RuntimeValue {
    match list.data.as_array() {
        Some(items) => RuntimeValue::bool(check(items.len())),
        None => RuntimeValue::typed_error(
            Type::Bool,
            Error::eval("failed to validate all entries (list is null)"),
        ),
    }
}

fn all(list: &RuntimeValue, _: &[RuntimeValue]) -> Result<RuntimeValue> {
    Ok(count_check(list, |len| len == 0))
}

fn any(list: &RuntimeValue, _: &[RuntimeValue]) -> Result<RuntimeValue> {
    Ok(count_check(list, |len| len != 0))
}

fn none(list: &RuntimeValue, _: &[RuntimeValue]) -> Result<RuntimeValue> {
    Ok(count_check(list, |len| len == 0))
}

fn one(list: &RuntimeValue, _: &[RuntimeValue]) -> Result<RuntimeValue> {
    Ok(count_check(list, |len| len == 1))
}

/// Trailing arguments after the list and the function, passed to every block.
fn extra_args(chunk: &Chunk) -> &[crate::wire::TypedValue] {
    chunk.args().get(2..).unwrap_or(&[])
}

fn filter_kept(exec: &BlockExecutor, _: &RuntimeValue, chunk: &Chunk, at: Ref) -> Result<Step> {
    let list = ready!(exec.resolve_value(arg(chunk, 0)?, at));
    filter_list(exec, chunk, at, list, false)
}

fn filter_dropped(exec: &BlockExecutor, _: &RuntimeValue, chunk: &Chunk, at: Ref) -> Result<Step> {
    let list = ready!(exec.resolve_value(arg(chunk, 0)?, at));
    filter_list(exec, chunk, at, list, true)
}

/// Keeps the elements whose block is truthy, or falsy when `invert` is set.
/// A literal instead of a function keeps the elements equal to it.
pub(super) fn filter_list(
    exec: &BlockExecutor,
    chunk: &Chunk,
    at: Ref,
    list: RuntimeValue,
    invert: bool,
) -> Result<Step> {
    filter_items(exec, chunk, at, list, invert, RuntimeValue::array)
}

/// Builds the value of a filter from the kept elements and the element type.
pub(super) type Collect = fn(Vec<Data>, Type) -> RuntimeValue;

/// [`filter_list`] with the result shaped by `collect`.
pub(super) fn filter_items(
    exec: &BlockExecutor,
    chunk: &Chunk,
    at: Ref,
    list: RuntimeValue,
    invert: bool,
    collect: Collect,
) -> Result<Step> {
    let Data::Array(items) = &list.data else {
        return Ok(Step::Value(RuntimeValue::null_of(list.typ.clone())));
    };
    if items.is_empty() {
        return Ok(Step::Value(collect(Vec::new(), list.typ.child())));
    }
    let function = arg(chunk, 1)?;
    let child = list.typ.child();
    if !function.typ.is_function() {
        let wanted = ready!(exec.resolve_value(function, at));
        let kept = items
            .iter()
            .filter(|item| {
                let item = RuntimeValue::new(child.clone(), (*item).clone());
                simple::values_equal(&item, &wanted) != invert
            })
            .cloned()
            .collect();
        return Ok(Step::Value(collect(kept, child)));
    }

    let extra = ready!(exec.resolve_args(extra_args(chunk), at));
    let arg_lists = element_args(items, &child, &extra);
    let items = items.clone();
    let aggregate: Aggregate = Arc::new(move |results: Vec<BlockResult>| {
        let kept = results
            .iter()
            .zip(items.iter())
            .filter(|(result, _)| result.is_truthy() != invert)
            .map(|(_, item)| item.clone())
            .collect();
        collect(kept, child.clone()).with_error(element_errors(&results))
    });
    exec.run_function_blocks(at, function, arg_lists, aggregate)
}

fn element_args(items: &[Data], child: &Type, extra: &[RuntimeValue]) -> Vec<Vec<RuntimeValue>> {
    items
        .iter()
        .map(|item| {
            let mut args = Vec::with_capacity(extra.len() + 1);
            args.push(RuntimeValue::new(child.clone(), item.clone()));
            args.extend(extra.iter().cloned());
            args
        })
        .collect()
}

fn map(exec: &BlockExecutor, _: &RuntimeValue, chunk: &Chunk, at: Ref) -> Result<Step> {
    let list = ready!(exec.resolve_value(arg(chunk, 0)?, at));
    map_list(exec, chunk, at, list)
}

/// Replaces every element with the first value its block produces.
pub(super) fn map_list(exec: &BlockExecutor, chunk: &Chunk, at: Ref, list: RuntimeValue) -> Result<Step> {
    let function = arg(chunk, 1)?;
    let mapped = function.typ.child();
    let Data::Array(items) = &list.data else {
        return Ok(Step::Value(RuntimeValue::null_of(Type::array(mapped))));
    };
    if items.is_empty() {
        return Ok(Step::Value(RuntimeValue::array(Vec::new(), mapped)));
    }
    let extra = ready!(exec.resolve_args(extra_args(chunk), at));
    let arg_lists = element_args(items, &list.typ.child(), &extra);
    let aggregate: Aggregate = Arc::new(move |results: Vec<BlockResult>| {
        let values = results
            .iter()
            .map(|result| result.first().map(|value| value.data.clone()).unwrap_or(Data::Nil))
            .collect();
        RuntimeValue::array(values, mapped.clone()).with_error(element_errors(&results))
    });
    exec.run_function_blocks(at, function, arg_lists, aggregate)
}

/// Keeps every element whose field, as picked by the block, equals the
/// field of another element.
fn field_duplicates(exec: &BlockExecutor, _: &RuntimeValue, chunk: &Chunk, at: Ref) -> Result<Step> {
    let list = ready!(exec.resolve_value(arg(chunk, 0)?, at));
    let Data::Array(items) = &list.data else {
        return Ok(Step::Value(RuntimeValue::null_of(list.typ.clone())));
    };
    if items.is_empty() {
        return Ok(Step::Value(list));
    }
    let function = arg(chunk, 1)?;
    if !function.typ.is_function() {
        return Err(Error::type_mismatch("field function", function.typ.label()));
    }
    let extra = ready!(exec.resolve_args(extra_args(chunk), at));
    let child = list.typ.child();
    let arg_lists = element_args(items, &child, &extra);
    let items = items.clone();
    let aggregate: Aggregate = Arc::new(move |results: Vec<BlockResult>| {
        let fields: Vec<RuntimeValue> = results
            .iter()
            .map(|result| result.first().cloned().unwrap_or_else(RuntimeValue::nil))
            .collect();
        let kept = items
            .iter()
            .enumerate()
            .filter(|(index, _)| {
                fields.iter().enumerate().any(|(other, field)| {
                    other != *index && simple::values_equal(&fields[*index], field)
                })
            })
            .map(|(_, item)| item.clone())
            .collect();
        RuntimeValue::array(kept, child.clone()).with_error(element_errors(&results))
    });
    exec.run_function_blocks(at, function, arg_lists, aggregate)
}

/// Runs the block once with the whole list as its argument.
fn block_call(exec: &BlockExecutor, list: &RuntimeValue, chunk: &Chunk, at: Ref) -> Result<Step> {
    let function = arg(chunk, 0)?;
    exec.run_block(at, Some(list.clone()), function, chunk.args().get(1..).unwrap_or(&[]))
}

pub(super) fn block_per_element(
    exec: &BlockExecutor,
    list: &RuntimeValue,
    chunk: &Chunk,
    at: Ref,
) -> Result<Step> {
    let Data::Array(items) = &list.data else {
        return Ok(Step::Value(RuntimeValue::null_of(Type::array(Type::Block))));
    };
    if items.is_empty() {
        return Ok(Step::Value(RuntimeValue::array(Vec::new(), Type::Block)));
    }
    let function = arg(chunk, 0)?;
    let extra = ready!(exec.resolve_args(chunk.args().get(1..).unwrap_or(&[]), at));
    let child = list.typ.child();
    let arg_lists = element_args(items, &child, &extra);
    let items = items.clone();
    let aggregate: Aggregate = Arc::new(move |results: Vec<BlockResult>| {
        let err = element_errors(&results);
        let blocks = results
            .into_iter()
            .zip(items.iter())
            .map(|(result, item)| {
                let result = if child.is_resource() {
                    result.with_binding(RuntimeValue::new(child.clone(), item.clone()))
                } else {
                    result
                };
                result.into_value().data
            })
            .collect();
        RuntimeValue::array(blocks, Type::Block).with_error(err)
    });
    exec.run_function_blocks(at, function, arg_lists, aggregate)
}

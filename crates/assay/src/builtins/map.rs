//! Map and dict builtins.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value as Json;

use super::array::{block_per_element, filter_items, map_list};
use super::{arg, string, Builtins, Handler, MethodFn, Returns};
use crate::code::{Chunk, Ref};
use crate::error::{Error, Result};
use crate::executor::{element_errors, Aggregate, BlockExecutor, BlockResult, Step};
use crate::types::{Kind, Type};
use crate::value::{Data, RuntimeValue};

pub(super) fn register(table: &mut Builtins) {
    table.add(Kind::Map, "[]", Handler::Binary(map_index), Returns::Child);
    table.add(Kind::Map, "length", Handler::Method(map_length), Returns::Int);
    table.add(Kind::Map, "keys", Handler::Method(map_keys), Returns::Keys);
    table.add(Kind::Map, "values", Handler::Method(map_values), Returns::Values);
    table.add(Kind::Map, "where", Handler::Exec(filter_kept), Returns::Receiver);
    table.add(Kind::Map, "$whereNot", Handler::Exec(filter_dropped), Returns::Receiver);
    table.add(Kind::Map, "{}", Handler::Exec(block_call), Returns::Block);

    table.add(Kind::Dict, "[]", Handler::Binary(dict_index), Returns::Dict);
    table.add(Kind::Dict, "length", Handler::Method(dict_length), Returns::Int);
    table.add(Kind::Dict, "keys", Handler::Method(dict_keys), Returns::StringArray);
    table.add(Kind::Dict, "values", Handler::Method(dict_values), Returns::Values);
    table.add(Kind::Dict, "notEmpty", Handler::Method(dict_not_empty), Returns::Bool);
    table.add(Kind::Dict, "where", Handler::Exec(dict_filter_kept), Returns::Receiver);
    table.add(Kind::Dict, "$whereNot", Handler::Exec(dict_filter_dropped), Returns::Receiver);
    table.add(Kind::Dict, "map", Handler::Exec(dict_map), Returns::Mapped);
    table.add(Kind::Dict, "{}", Handler::Exec(dict_block_call), Returns::Block);
    table.add(Kind::Dict, "$all", Handler::Method(dict_all), Returns::Bool);
    table.add(Kind::Dict, "$any", Handler::Method(dict_any), Returns::Bool);
    table.add(Kind::Dict, "$none", Handler::Method(dict_all), Returns::Bool);
    table.add(Kind::Dict, "$one", Handler::Method(dict_one), Returns::Bool);
    table.add(Kind::Dict, "contains", Handler::Method(dict_contains), Returns::Bool);
    table.add(Kind::Dict, "find", Handler::Method(dict_find), Returns::StringArray);
    table.add(Kind::Dict, "camelcase", Handler::Method(dict_camelcase), Returns::String);
    table.add(Kind::Dict, "downcase", Handler::Method(dict_downcase), Returns::String);
    table.add(Kind::Dict, "upcase", Handler::Method(dict_upcase), Returns::String);
    table.add(Kind::Dict, "lines", Handler::Method(dict_lines), Returns::StringArray);
    table.add(Kind::Dict, "split", Handler::Method(dict_split), Returns::StringArray);
    table.add(Kind::Dict, "trim", Handler::Method(dict_trim), Returns::String);
}

fn key_text(key: &RuntimeValue) -> Result<String> {
    match &key.data {
        Data::String(text) => Ok(text.clone()),
        Data::Int(number) => Ok(number.to_string()),
        _ => Err(Error::type_mismatch("string or int key", key.describe())),
    }
}

fn map_index(map: &RuntimeValue, key: &RuntimeValue) -> Result<RuntimeValue> {
    let child = map.typ.child();
    let Some(entries) = map.data.as_map() else {
        return Ok(RuntimeValue::null_of(child));
    };
    let data = entries.get(&key_text(key)?).cloned().unwrap_or(Data::Nil);
    Ok(RuntimeValue::new(child, data))
}

fn map_length(map: &RuntimeValue, _: &[RuntimeValue]) -> Result<RuntimeValue> {
    Ok(match map.data.as_map() {
        Some(entries) => RuntimeValue::int(entries.len() as i64),
        None => RuntimeValue::null_of(Type::Int),
    })
}

fn map_keys(map: &RuntimeValue, _: &[RuntimeValue]) -> Result<RuntimeValue> {
    let key = map.typ.key().cloned().unwrap_or(Type::String);
    let Some(entries) = map.data.as_map() else {
        return Ok(RuntimeValue::typed_error(
            Type::array(key),
            Error::eval("failed to get keys of `null`"),
        ));
    };
    let keys = entries
        .keys()
        .map(|name| match (&key, name.parse::<i64>()) {
            (Type::Int, Ok(number)) => Data::Int(number),
            _ => Data::String(name.clone()),
        })
        .collect();
    Ok(RuntimeValue::array(keys, key))
}

fn map_values(map: &RuntimeValue, _: &[RuntimeValue]) -> Result<RuntimeValue> {
    let child = map.typ.child();
    let Some(entries) = map.data.as_map() else {
        return Ok(RuntimeValue::typed_error(
            Type::array(child),
            Error::eval("failed to get values of `null`"),
        ));
    };
    Ok(RuntimeValue::array(entries.values().cloned().collect(), child))
}

fn filter_kept(exec: &BlockExecutor, _: &RuntimeValue, chunk: &Chunk, at: Ref) -> Result<Step> {
    filter_entries(exec, chunk, at, false)
}

fn filter_dropped(exec: &BlockExecutor, _: &RuntimeValue, chunk: &Chunk, at: Ref) -> Result<Step> {
    filter_entries(exec, chunk, at, true)
}

/// Runs the filter block once per entry with `(key, value)` as arguments.
fn filter_entries(exec: &BlockExecutor, chunk: &Chunk, at: Ref, invert: bool) -> Result<Step> {
    let map = ready!(exec.resolve_value(arg(chunk, 0)?, at));
    let Data::Map(entries) = &map.data else {
        return Ok(Step::Value(RuntimeValue::null_of(map.typ.clone())));
    };
    if entries.is_empty() {
        return Ok(Step::Value(map));
    }
    let function = arg(chunk, 1)?;
    if !function.typ.is_function() {
        return Err(Error::eval("cannot call 'where' on a map without a filter function"));
    }
    let extra = ready!(exec.resolve_args(chunk.args().get(2..).unwrap_or(&[]), at));
    let child = map.typ.child();
    let arg_lists = entries
        .iter()
        .map(|(key, value)| {
            let mut args = vec![
                RuntimeValue::string(key.clone()),
                RuntimeValue::new(child.clone(), value.clone()),
            ];
            args.extend(extra.iter().cloned());
            args
        })
        .collect();

    let entries = entries.clone();
    let typ = map.typ.clone();
    let aggregate: Aggregate = Arc::new(move |results: Vec<BlockResult>| {
        let kept: BTreeMap<String, Data> = results
            .iter()
            .zip(entries.iter())
            .filter(|(result, _)| result.is_truthy() != invert)
            .map(|(_, (key, value))| (key.clone(), value.clone()))
            .collect();
        RuntimeValue::new(typ.clone(), Data::map(kept)).with_error(element_errors(&results))
    });
    exec.run_function_blocks(at, function, arg_lists, aggregate)
}

fn block_call(exec: &BlockExecutor, map: &RuntimeValue, chunk: &Chunk, at: Ref) -> Result<Step> {
    let function = arg(chunk, 0)?;
    exec.run_block(at, Some(map.clone()), function, chunk.args().get(1..).unwrap_or(&[]))
}

fn dict_index(dict: &RuntimeValue, key: &RuntimeValue) -> Result<RuntimeValue> {
    let found = match (&dict.data, &key.data) {
        (Data::Dict(Json::Object(entries)), Data::String(name)) => entries.get(name).cloned(),
        (Data::Dict(Json::Array(items)), Data::Int(requested)) => {
            let len = items.len() as i64;
            let position = if *requested < 0 { len + requested } else { *requested };
            if position < 0 || position >= len {
                return Err(Error::IndexOutOfBounds {
                    index: *requested,
                    max: len - 1,
                });
            }
            items.get(position as usize).cloned()
        }
        (Data::Nil, _) | (Data::Dict(Json::Null), _) => None,
        (Data::Dict(_), _) => {
            return Err(Error::unsupported(format!("[]{}", key.typ.label()), "dict"))
        }
        _ => return Err(Error::type_mismatch("dict", dict.describe())),
    };
    Ok(match found {
        Some(value) => RuntimeValue::dict(value),
        None => RuntimeValue::null_of(Type::Dict),
    })
}

fn dict_length(dict: &RuntimeValue, _: &[RuntimeValue]) -> Result<RuntimeValue> {
    let len = match &dict.data {
        Data::Dict(Json::Array(items)) => items.len(),
        Data::Dict(Json::Object(entries)) => entries.len(),
        Data::Dict(Json::String(text)) => text.len(),
        Data::Nil | Data::Dict(Json::Null) => return Ok(RuntimeValue::null_of(Type::Int)),
        _ => {
            return Err(Error::unsupported("length", format!("dict ({})", dict.data)));
        }
    };
    Ok(RuntimeValue::int(len as i64))
}

fn dict_keys(dict: &RuntimeValue, _: &[RuntimeValue]) -> Result<RuntimeValue> {
    match &dict.data {
        Data::Dict(Json::Object(entries)) => Ok(RuntimeValue::array(
            entries.keys().cloned().map(Data::String).collect(),
            Type::String,
        )),
        _ => Ok(RuntimeValue::typed_error(
            Type::array(Type::String),
            Error::eval("failed to get keys of a dict that is not an object"),
        )),
    }
}

fn dict_values(dict: &RuntimeValue, _: &[RuntimeValue]) -> Result<RuntimeValue> {
    let values: Vec<Data> = match &dict.data {
        Data::Dict(Json::Object(entries)) => entries.values().cloned().map(Data::Dict).collect(),
        Data::Dict(Json::Array(items)) => items.iter().cloned().map(Data::Dict).collect(),
        _ => {
            return Ok(RuntimeValue::typed_error(
                Type::array(Type::Dict),
                Error::eval("failed to get values of a dict that is not a collection"),
            ))
        }
    };
    Ok(RuntimeValue::array(values, Type::Dict))
}

fn dict_not_empty(dict: &RuntimeValue, _: &[RuntimeValue]) -> Result<RuntimeValue> {
    let empty = match &dict.data {
        Data::Nil | Data::Dict(Json::Null) => true,
        Data::Dict(Json::String(text)) => text.is_empty(),
        Data::Dict(Json::Array(items)) => items.is_empty(),
        Data::Dict(Json::Object(entries)) => entries.is_empty(),
        _ => return Err(Error::eval("dict value does not support field `notEmpty`")),
    };
    Ok(RuntimeValue::bool(!empty))
}

/// The elements of a dict holding a list, as a list of dicts.
fn dict_list(items: &[Json]) -> RuntimeValue {
    RuntimeValue::array(items.iter().cloned().map(Data::Dict).collect(), Type::Dict)
}

/// Folds filtered elements back into a dict holding a list.
fn collect_dict(items: Vec<Data>, _: Type) -> RuntimeValue {
    let items = items
        .into_iter()
        .map(|item| match item {
            Data::Dict(json) => json,
            other => RuntimeValue::new(crate::convert::infer_type(&other), other).to_json(),
        })
        .collect();
    RuntimeValue::dict(Json::Array(items))
}

fn dict_filter_kept(exec: &BlockExecutor, _: &RuntimeValue, chunk: &Chunk, at: Ref) -> Result<Step> {
    dict_filter(exec, chunk, at, false)
}

fn dict_filter_dropped(exec: &BlockExecutor, _: &RuntimeValue, chunk: &Chunk, at: Ref) -> Result<Step> {
    dict_filter(exec, chunk, at, true)
}

/// Filters the elements of a list dict or the values of an object dict.
/// Each block gets the element (or value) as a dict.
fn dict_filter(exec: &BlockExecutor, chunk: &Chunk, at: Ref, invert: bool) -> Result<Step> {
    let dict = ready!(exec.resolve_value(arg(chunk, 0)?, at));
    match &dict.data {
        Data::Nil | Data::Dict(Json::Null) => Ok(Step::Value(RuntimeValue::null_of(Type::Dict))),
        Data::Dict(Json::Array(items)) => {
            filter_items(exec, chunk, at, dict_list(items), invert, collect_dict)
        }
        Data::Dict(Json::Object(entries)) => {
            if entries.is_empty() {
                return Ok(Step::Value(dict.clone()));
            }
            let function = arg(chunk, 1)?;
            if !function.typ.is_function() {
                return Err(Error::eval("cannot call 'where' on a map without a filter function"));
            }
            let extra = ready!(exec.resolve_args(chunk.args().get(2..).unwrap_or(&[]), at));
            let arg_lists = entries
                .values()
                .map(|value| {
                    let mut args = vec![RuntimeValue::dict(value.clone())];
                    args.extend(extra.iter().cloned());
                    args
                })
                .collect();
            let entries = entries.clone();
            let aggregate: Aggregate = Arc::new(move |results: Vec<BlockResult>| {
                let kept: serde_json::Map<String, Json> = results
                    .iter()
                    .zip(entries.iter())
                    .filter(|(result, _)| result.is_truthy() != invert)
                    .map(|(_, (key, value))| (key.clone(), value.clone()))
                    .collect();
                RuntimeValue::dict(Json::Object(kept)).with_error(element_errors(&results))
            });
            exec.run_function_blocks(at, function, arg_lists, aggregate)
        }
        _ => Err(Error::eval("failed to call dict.where on this value")),
    }
}

fn dict_map(exec: &BlockExecutor, _: &RuntimeValue, chunk: &Chunk, at: Ref) -> Result<Step> {
    let dict = ready!(exec.resolve_value(arg(chunk, 0)?, at));
    match &dict.data {
        Data::Nil | Data::Dict(Json::Null) => {
            map_list(exec, chunk, at, RuntimeValue::null_of(Type::array(Type::Dict)))
        }
        Data::Dict(Json::Array(items)) => map_list(exec, chunk, at, dict_list(items)),
        _ => Err(Error::eval("failed to call dict.map on a non-list value")),
    }
}

/// Runs the block per element for list dicts, once otherwise.
fn dict_block_call(exec: &BlockExecutor, dict: &RuntimeValue, chunk: &Chunk, at: Ref) -> Result<Step> {
    match &dict.data {
        Data::Dict(Json::Array(items)) => block_per_element(exec, &dict_list(items), chunk, at),
        _ => {
            let function = arg(chunk, 0)?;
            exec.run_block(at, Some(dict.clone()), function, chunk.args().get(1..).unwrap_or(&[]))
        }
    }
}

/// `$all`, `$any`, `$none` and `$one` on an already filtered dict.
fn dict_count_check(dict: &RuntimeValue, check: fn(usize) -> bool) -> Result<RuntimeValue> {
    let len = match &dict.data {
        Data::Nil | Data::Dict(Json::Null) => return Ok(RuntimeValue::null_of(Type::Bool)),
        Data::Dict(Json::Array(items)) => items.len(),
        Data::Dict(Json::Object(entries)) => entries.len(),
        _ => return Err(Error::eval("failed to call dict assertion on a non-list/map value")),
    };
    Ok(RuntimeValue::bool(check(len)))
}

fn dict_all(dict: &RuntimeValue, _: &[RuntimeValue]) -> Result<RuntimeValue> {
    dict_count_check(dict, |len| len == 0)
}

fn dict_any(dict: &RuntimeValue, _: &[RuntimeValue]) -> Result<RuntimeValue> {
    dict_count_check(dict, |len| len != 0)
}

fn dict_one(dict: &RuntimeValue, _: &[RuntimeValue]) -> Result<RuntimeValue> {
    dict_count_check(dict, |len| len == 1)
}

/// Applies a string method to a dict holding a string.
fn as_text(dict: &RuntimeValue, args: &[RuntimeValue], name: &str, method: MethodFn) -> Result<RuntimeValue> {
    let text = match &dict.data {
        Data::Nil | Data::Dict(Json::Null) => RuntimeValue::null_of(Type::String),
        Data::Dict(Json::String(text)) => RuntimeValue::string(text.clone()),
        _ => return Err(Error::eval(format!("dict value does not support field `{name}`"))),
    };
    method(&text, args)
}

fn dict_contains(dict: &RuntimeValue, args: &[RuntimeValue]) -> Result<RuntimeValue> {
    as_text(dict, args, "contains", string::contains)
}

fn dict_find(dict: &RuntimeValue, args: &[RuntimeValue]) -> Result<RuntimeValue> {
    as_text(dict, args, "find", string::find)
}

fn dict_camelcase(dict: &RuntimeValue, args: &[RuntimeValue]) -> Result<RuntimeValue> {
    as_text(dict, args, "camelcase", string::camelcase)
}

fn dict_downcase(dict: &RuntimeValue, args: &[RuntimeValue]) -> Result<RuntimeValue> {
    as_text(dict, args, "downcase", string::downcase)
}

fn dict_upcase(dict: &RuntimeValue, args: &[RuntimeValue]) -> Result<RuntimeValue> {
    as_text(dict, args, "upcase", string::upcase)
}

fn dict_lines(dict: &RuntimeValue, args: &[RuntimeValue]) -> Result<RuntimeValue> {
    as_text(dict, args, "lines", string::lines)
}

fn dict_split(dict: &RuntimeValue, args: &[RuntimeValue]) -> Result<RuntimeValue> {
    as_text(dict, args, "split", string::split)
}

fn dict_trim(dict: &RuntimeValue, args: &[RuntimeValue]) -> Result<RuntimeValue> {
    as_text(dict, args, "trim", string::trim)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn sizes() -> RuntimeValue {
        RuntimeValue::string_map(
            BTreeMap::from([
                ("a".to_string(), Data::Int(1)),
                ("b".to_string(), Data::Int(2)),
            ]),
            Type::Int,
        )
    }

    #[test]
    fn maps_index_and_list() {
        let map = sizes();
        assert_eq!(map_index(&map, &RuntimeValue::string("b")).unwrap(), RuntimeValue::int(2));
        assert_eq!(
            map_index(&map, &RuntimeValue::string("z")).unwrap(),
            RuntimeValue::null_of(Type::Int)
        );
        assert_eq!(map_length(&map, &[]).unwrap(), RuntimeValue::int(2));
        assert_eq!(
            map_keys(&map, &[]).unwrap().data,
            Data::array(vec![Data::String("a".into()), Data::String("b".into())])
        );
        assert_eq!(
            map_values(&map, &[]).unwrap(),
            RuntimeValue::array(vec![Data::Int(1), Data::Int(2)], Type::Int)
        );
        assert!(map_keys(&RuntimeValue::null_of(map.typ.clone()), &[])
            .unwrap()
            .is_error());
    }

    #[test]
    fn dicts_index_objects_and_arrays() {
        let dict = RuntimeValue::dict(json!({"name": "root", "groups": ["wheel", "adm"]}));
        assert_eq!(
            dict_index(&dict, &RuntimeValue::string("name")).unwrap(),
            RuntimeValue::dict(json!("root"))
        );
        let groups = dict_index(&dict, &RuntimeValue::string("groups")).unwrap();
        assert_eq!(
            dict_index(&groups, &RuntimeValue::int(-1)).unwrap(),
            RuntimeValue::dict(json!("adm"))
        );
        assert!(dict_index(&groups, &RuntimeValue::int(5)).is_err());
        assert_eq!(dict_length(&groups, &[]).unwrap(), RuntimeValue::int(2));
        assert_eq!(dict_keys(&dict, &[]).unwrap().data.as_array().map(<[Data]>::len), Some(2));
        assert_eq!(dict_values(&groups, &[]).unwrap().element(0), Some(RuntimeValue::dict(json!("wheel"))));
    }

    #[test]
    fn dicts_holding_strings_use_string_methods() {
        let padded = RuntimeValue::dict(json!("  Hello World \n"));
        assert_eq!(dict_trim(&padded, &[]).unwrap(), RuntimeValue::string("Hello World"));
        assert_eq!(
            dict_downcase(&RuntimeValue::dict(json!("MiXed")), &[]).unwrap(),
            RuntimeValue::string("mixed")
        );
        let rows = dict_lines(&RuntimeValue::dict(json!("a\nb")), &[]).unwrap();
        assert_eq!(rows.element(1), Some(RuntimeValue::string("b")));
        assert_eq!(
            dict_upcase(&RuntimeValue::null_of(Type::Dict), &[]).unwrap(),
            RuntimeValue::null_of(Type::String)
        );
        let err = dict_camelcase(&RuntimeValue::dict(json!([1])), &[]).unwrap_err();
        assert!(err.to_string().contains("camelcase"), "{err}");
        assert!(dict_contains(&RuntimeValue::dict(json!("port 22")), &[RuntimeValue::int(22)])
            .unwrap()
            .is_truthy());
    }

    #[test]
    fn dict_quantifiers_and_emptiness() {
        let empty = RuntimeValue::dict(json!([]));
        let one = RuntimeValue::dict(json!({"a": 1}));
        assert_eq!(dict_all(&empty, &[]).unwrap(), RuntimeValue::bool(true));
        assert_eq!(dict_any(&one, &[]).unwrap(), RuntimeValue::bool(true));
        assert_eq!(dict_one(&one, &[]).unwrap(), RuntimeValue::bool(true));
        assert_eq!(
            dict_all(&RuntimeValue::null_of(Type::Dict), &[]).unwrap(),
            RuntimeValue::null_of(Type::Bool)
        );
        assert!(dict_any(&RuntimeValue::dict(json!(3)), &[]).is_err());

        assert!(!dict_not_empty(&empty, &[]).unwrap().is_truthy());
        assert!(dict_not_empty(&RuntimeValue::dict(json!("x")), &[]).unwrap().is_truthy());
        assert!(!dict_not_empty(&RuntimeValue::null_of(Type::Dict), &[]).unwrap().is_truthy());
        assert!(dict_not_empty(&RuntimeValue::dict(json!(true)), &[]).is_err());
    }
}

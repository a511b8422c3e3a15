//! Builtins on list resources. The list itself is the first argument; the
//! receiver is the resource that owns it.
//!
//! Anything not registered here is a field read and goes to the backend.

use super::array::{filter_list, map_list};
use super::{arg, Builtins, Handler, Returns};
use crate::code::{Chunk, Ref};
use crate::error::Result;
use crate::executor::{BlockExecutor, Step};
use crate::types::{Kind, Type};
use crate::value::{Data, RuntimeValue};

pub(super) fn register(table: &mut Builtins) {
    let r = Kind::Resource;
    table.add(r, "where", Handler::Exec(filter_kept), Returns::Argument);
    table.add(r, "$whereNot", Handler::Exec(filter_dropped), Returns::Argument);
    table.add(r, "map", Handler::Exec(map), Returns::Mapped);
    table.add(r, "length", Handler::Exec(length), Returns::Int);
    table.add(r, "{}", Handler::Exec(block_call), Returns::Block);
}

fn filter_kept(exec: &BlockExecutor, _: &RuntimeValue, chunk: &Chunk, at: Ref) -> Result<Step> {
    let list = ready!(exec.resolve_value(arg(chunk, 0)?, at));
    filter_list(exec, chunk, at, list, false)
}

fn filter_dropped(exec: &BlockExecutor, _: &RuntimeValue, chunk: &Chunk, at: Ref) -> Result<Step> {
    let list = ready!(exec.resolve_value(arg(chunk, 0)?, at));
    filter_list(exec, chunk, at, list, true)
}

fn map(exec: &BlockExecutor, _: &RuntimeValue, chunk: &Chunk, at: Ref) -> Result<Step> {
    let list = ready!(exec.resolve_value(arg(chunk, 0)?, at));
    map_list(exec, chunk, at, list)
}

fn length(exec: &BlockExecutor, _: &RuntimeValue, chunk: &Chunk, at: Ref) -> Result<Step> {
    let list = ready!(exec.resolve_value(arg(chunk, 0)?, at));
    Ok(Step::Value(match list.data {
        Data::Array(items) => RuntimeValue::int(items.len() as i64),
        _ => RuntimeValue::null_of(Type::Int),
    }))
}

/// Runs the block once with the resource as its argument.
fn block_call(exec: &BlockExecutor, resource: &RuntimeValue, chunk: &Chunk, at: Ref) -> Result<Step> {
    let function = arg(chunk, 0)?;
    exec.run_block(
        at,
        Some(resource.clone()),
        function,
        chunk.args().get(1..).unwrap_or(&[]),
    )
}

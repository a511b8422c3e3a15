//! Child executors: block calls, branches and per-element combinators.

use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use tracing::{debug, trace};

use super::{lock, BlockExecutor, Lookup, RawResult, ResultCallback, Step};
use crate::code::Ref;
use crate::error::{Error, Result};
use crate::types::Type;
use crate::value::{RuntimeValue, BLOCK_BINDING_KEY};
use crate::wire::TypedValue;

/// Turns the per-element results of a fan-out into the value of the call.
pub(crate) type Aggregate = Arc<dyn Fn(Vec<BlockResult>) -> RuntimeValue + Send + Sync>;

/// Everything one child block reported, keyed by checksum.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BlockResult {
    values: BTreeMap<String, RuntimeValue>,
    entrypoints: Arc<Vec<String>>,
}

impl BlockResult {
    pub fn get(&self, code_id: &str) -> Option<&RuntimeValue> {
        self.values.get(code_id)
    }

    /// Value of the block's first entrypoint.
    pub fn first(&self) -> Option<&RuntimeValue> {
        self.entrypoints.first().and_then(|sum| self.values.get(sum))
    }

    pub fn error(&self) -> Option<&Error> {
        self.values.values().find_map(|value| value.error.as_ref())
    }

    /// True when every entrypoint reported a truthy value without error.
    pub fn is_truthy(&self) -> bool {
        self.entrypoints.iter().all(|sum| {
            self.values
                .get(sum)
                .is_some_and(RuntimeValue::is_success)
        })
    }

    /// Records the value the block ran against under [`BLOCK_BINDING_KEY`].
    pub fn with_binding(mut self, binding: RuntimeValue) -> Self {
        self.values.insert(BLOCK_BINDING_KEY.to_string(), binding);
        self
    }

    pub fn into_value(self) -> RuntimeValue {
        RuntimeValue::block(self.values)
    }
}

/// Combines element errors into one, tagged with their index.
pub(crate) fn element_errors(results: &[BlockResult]) -> Option<Error> {
    results
        .iter()
        .enumerate()
        .filter_map(|(index, result)| {
            result.error().map(|err| Error::Element {
                index,
                source: Box::new(err.clone()),
            })
        })
        .fold(None, Error::append)
}

/// Barrier over the children of one fan-out.
struct FanIn {
    expected: usize,
    slots: Vec<BTreeMap<String, RuntimeValue>>,
    complete: Vec<bool>,
    waiting: usize,
}

impl FanIn {
    fn new(elements: usize, expected: usize) -> Self {
        Self {
            expected,
            slots: vec![BTreeMap::new(); elements],
            complete: vec![false; elements],
            waiting: elements,
        }
    }

    /// Stores one child report. Once every child is complete, returns a
    /// snapshot of all slots, including for later updates.
    fn record(&mut self, index: usize, result: RawResult) -> Option<Vec<BTreeMap<String, RuntimeValue>>> {
        let slot = self.slots.get_mut(index)?;
        slot.insert(result.code_id, result.data);
        if !self.complete[index] && slot.len() >= self.expected {
            self.complete[index] = true;
            self.waiting -= 1;
        }
        (self.waiting == 0).then(|| self.slots.clone())
    }
}

fn function_block(function: &TypedValue) -> Result<Ref> {
    match &function.typ {
        Type::Function(_) => function
            .as_ref()
            .ok_or_else(|| Error::Decode("malformed function ref".to_string())),
        other => Err(Error::type_mismatch("function", other.label())),
    }
}

impl BlockExecutor {
    /// Checksums of the block's entrypoints and the number of distinct
    /// checksums a child of it reports.
    fn block_shape(&self, block_ref: Ref) -> Result<(Arc<Vec<String>>, usize)> {
        let block = self.code().block(block_ref)?;
        let mut entrypoints = Vec::new();
        for point in &block.entrypoints {
            let sum = self.code().checksum_of(*point)?.to_string();
            if !entrypoints.contains(&sum) {
                entrypoints.push(sum);
            }
        }
        let mut all: Vec<&str> = Vec::new();
        for point in block.callback_points() {
            let sum = self.code().checksum_of(point)?;
            if !all.contains(&sum) {
                all.push(sum);
            }
        }
        Ok((Arc::new(entrypoints), all.len()))
    }

    /// Retires the children spawned for `at` by an earlier run.
    fn replace_children(&self, at: Ref) {
        let previous = lock(&self.children).remove(&at).unwrap_or_default();
        for child in previous {
            // The old children have no watchers left worth reporting on.
            let _ = child.retire();
        }
    }

    /// Spawns a child executor for `block_ref` with `args` seeded at the
    /// block's parameter refs and runs it.
    pub(crate) fn run_function_block(
        &self,
        at: Ref,
        block_ref: Ref,
        args: Vec<RuntimeValue>,
        callback: ResultCallback,
    ) -> Result<Arc<BlockExecutor>> {
        let parameters = self.code().block(block_ref)?.parameters as usize;
        if args.len() < parameters {
            return Err(Error::eval(format!(
                "block {block_ref} expects {parameters} arguments, got {}",
                args.len()
            )));
        }
        let index = self.next_child.fetch_add(1, Ordering::Relaxed);
        let child = BlockExecutor::new(
            self.shared.clone(),
            block_ref,
            format!("{}/{index}", self.id),
            callback,
            self.this.clone(),
        )?;
        for (param, value) in args.into_iter().take(parameters).enumerate() {
            child.store(block_ref.with_chunk(param as u32), value, true);
        }
        lock(&self.children)
            .entry(at)
            .or_default()
            .push(child.clone());
        trace!(executor = %self.id, child = %child.id, block = %block_ref, "executor> spawn child");
        child.run()?;
        Ok(child)
    }

    /// Runs the block of `function` once. `bind` is its first argument;
    /// `extra` are resolved and passed after it.
    ///
    /// Single-value blocks produce their first entrypoint's value; other
    /// blocks produce a block value keyed by checksum.
    pub(crate) fn run_block(
        &self,
        at: Ref,
        bind: Option<RuntimeValue>,
        function: &TypedValue,
        extra: &[TypedValue],
    ) -> Result<Step> {
        if let Some(bind) = &bind {
            if bind.data.is_nil() && bind.typ != Type::Nil {
                return Ok(Step::Value(RuntimeValue::null_of(bind.typ.clone())));
            }
        }
        let block_ref = function_block(function)?;
        let mut args: Vec<RuntimeValue> = bind.iter().cloned().collect();
        match self.resolve_args(extra, at)? {
            Lookup::Ready(values) => args.extend(values),
            Lookup::Pending(step) => return Ok(step),
        }

        let single_value = self.code().block(block_ref)?.single_value;
        let (entrypoints, expected) = self.block_shape(block_ref)?;
        if expected == 0 {
            return Ok(Step::Value(RuntimeValue::block(BTreeMap::new())));
        }
        let binding = bind.filter(|value| value.typ.is_resource());
        let collected: Arc<Mutex<BTreeMap<String, RuntimeValue>>> = Arc::default();
        let parent = self.this.clone();

        let callback: ResultCallback = Arc::new(move |result: RawResult| {
            let Some(parent) = parent.upgrade() else {
                return;
            };
            if single_value {
                if entrypoints.first() == Some(&result.code_id) {
                    parent.settle(at, result.data);
                }
                return;
            }
            let snapshot = {
                let mut values = lock(&collected);
                values.insert(result.code_id, result.data);
                (values.len() >= expected).then(|| values.clone())
            };
            let Some(mut values) = snapshot else {
                return;
            };
            let err = values
                .values()
                .filter_map(|value| value.error.clone())
                .fold(None, Error::append);
            if let Some(binding) = &binding {
                values.insert(BLOCK_BINDING_KEY.to_string(), binding.clone());
            }
            parent.settle(at, RuntimeValue::block(values).with_error(err));
        });

        self.replace_children(at);
        self.run_function_block(at, block_ref, args, callback)?;
        Ok(Step::Wait)
    }

    /// Runs the block of `function` once per argument list and hands the
    /// index-ordered results to `aggregate` once every child reported.
    ///
    /// Later reports from any child re-aggregate and re-trigger `at`.
    pub(crate) fn run_function_blocks(
        &self,
        at: Ref,
        function: &TypedValue,
        arg_lists: Vec<Vec<RuntimeValue>>,
        aggregate: Aggregate,
    ) -> Result<Step> {
        let limit = self.config().max_fan_out;
        if arg_lists.len() > limit {
            return Err(Error::eval(format!(
                "cannot run a block for {} elements (limit is {limit})",
                arg_lists.len()
            )));
        }
        let block_ref = function_block(function)?;
        let (entrypoints, expected) = self.block_shape(block_ref)?;
        self.replace_children(at);

        if arg_lists.is_empty() || expected == 0 {
            let results = vec![
                BlockResult {
                    values: BTreeMap::new(),
                    entrypoints,
                };
                arg_lists.len()
            ];
            return Ok(Step::Value(aggregate(results)));
        }

        debug!(executor = %self.id, at = %at, elements = arg_lists.len(), "executor> fan out");
        let barrier = Arc::new(Mutex::new(FanIn::new(arg_lists.len(), expected)));
        for (index, args) in arg_lists.into_iter().enumerate() {
            let barrier = barrier.clone();
            let parent = self.this.clone();
            let aggregate = aggregate.clone();
            let entrypoints = entrypoints.clone();
            let callback: ResultCallback = Arc::new(move |result: RawResult| {
                let Some(parent) = parent.upgrade() else {
                    return;
                };
                let Some(slots) = lock(&barrier).record(index, result) else {
                    return;
                };
                let results = slots
                    .into_iter()
                    .map(|values| BlockResult {
                        values,
                        entrypoints: entrypoints.clone(),
                    })
                    .collect();
                parent.settle(at, aggregate(results));
            });
            self.run_function_block(at, block_ref, args, callback)?;
        }
        Ok(Step::Wait)
    }
}

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use dashmap::{DashMap, DashSet};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, error, trace, warn};

use super::calls::Calls;
use super::{lock, Lookup, RawResult, ResultCallback, Shared, Step};
use crate::backend::{FieldCallback, ResourceArgs, ResourceBackend};
use crate::builtins;
use crate::code::{Call, Chunk, Code, Function, Ref};
use crate::config::ExecutorConfig;
use crate::convert::{infer_type, to_runtime};
use crate::error::{Error, Result};
use crate::types::Type;
use crate::value::{Data, RuntimeValue};
use crate::wire::TypedValue;

#[derive(Debug, Clone)]
pub(crate) struct StepCache {
    pub(crate) value: RuntimeValue,
    /// Literal or seeded parameter; never invalidated.
    pub(crate) is_static: bool,
}

/// Evaluates one block: the root block of an [`super::Executor`] or a
/// child block spawned by a combinator, branch or block call.
pub struct BlockExecutor {
    pub(super) id: String,
    pub(super) block_ref: Ref,
    pub(super) shared: Arc<Shared>,
    callback: ResultCallback,
    callback_points: FxHashMap<Ref, String>,
    cache: DashMap<Ref, StepCache>,
    step_tracker: DashSet<Ref>,
    calls: Calls,
    watcher_ids: Mutex<FxHashSet<String>>,
    /// Child executors by the ref that spawned them.
    pub(super) children: Mutex<FxHashMap<Ref, Vec<Arc<BlockExecutor>>>>,
    pub(super) next_child: AtomicUsize,
    delivered: Mutex<FxHashMap<Ref, RuntimeValue>>,
    retired: AtomicBool,
    parent: Weak<BlockExecutor>,
    pub(super) this: Weak<BlockExecutor>,
}

impl BlockExecutor {
    pub(super) fn new(
        shared: Arc<Shared>,
        block_ref: Ref,
        id: String,
        callback: ResultCallback,
        parent: Weak<BlockExecutor>,
    ) -> Result<Arc<Self>> {
        let block = shared.code.block(block_ref)?;
        let mut callback_points = FxHashMap::default();
        for point in block.callback_points() {
            let sum = shared
                .code
                .checksum_of(point)
                .map_err(|_| Error::InvalidEntrypoint(point))?;
            callback_points.insert(point, sum.to_string());
        }
        Ok(Arc::new_cyclic(|this| BlockExecutor {
            id,
            block_ref,
            shared,
            callback,
            callback_points,
            cache: DashMap::new(),
            step_tracker: DashSet::new(),
            calls: Calls::default(),
            watcher_ids: Mutex::new(FxHashSet::default()),
            children: Mutex::new(FxHashMap::default()),
            next_child: AtomicUsize::new(0),
            delivered: Mutex::new(FxHashMap::default()),
            retired: AtomicBool::new(false),
            parent,
            this: this.clone(),
        }))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn block_ref(&self) -> Ref {
        self.block_ref
    }

    pub fn code(&self) -> &Code {
        &self.shared.code
    }

    pub fn backend(&self) -> &dyn ResourceBackend {
        self.shared.backend.as_ref()
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.shared.config
    }

    pub(crate) fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    /// Runs every callback point of the block that has not been visited.
    pub(crate) fn run(&self) -> Result<()> {
        let block = self.shared.code.block(self.block_ref)?;
        let mut points: Vec<Ref> = block.callback_points().collect();
        // Later chunks first: they pull in most of the block.
        points.sort_unstable_by(|a, b| b.cmp(a));
        points.dedup();
        for point in points {
            if point.block_ref() != self.block_ref {
                let value = self
                    .lookup_value(point)
                    .unwrap_or_else(RuntimeValue::from_error);
                self.report(point, &value);
                continue;
            }
            if self.step_tracker.contains(&point) {
                continue;
            }
            if let Err(err) = self.run_chain(point) {
                self.abort(&err);
                return Err(err);
            }
        }
        Ok(())
    }

    /// Reports `err` for every callback point.
    pub(crate) fn no_run(&self, err: &Error) {
        for point in self.callback_points.keys() {
            self.report(*point, &RuntimeValue::from_error(err.clone()));
        }
    }

    fn abort(&self, err: &Error) {
        error!(executor = %self.id, error = %err, "executor> evaluation aborted");
        self.no_run(err);
    }

    /// Runs `start` and everything that becomes runnable because of it.
    ///
    /// Only structural errors are returned; evaluation errors are cached at
    /// the failing ref and flow to its dependents.
    pub(crate) fn run_chain(&self, start: Ref) -> Result<()> {
        let mut next = Some(start);
        let mut remaining: VecDeque<Ref> = VecDeque::new();
        while let Some(current) = next.take() {
            if self.is_retired() {
                return Ok(());
            }
            self.step_tracker.insert(current);

            let (step, fresh) = match self.cached(current) {
                Some(value) => (Ok(Step::Value(value)), false),
                None => (self.run_ref(current), true),
            };
            trace!(executor = %self.id, at = %current, ?step, "chain> step");

            let resume = match step {
                Ok(Step::Next(dependency)) => {
                    next = Some(dependency);
                    continue;
                }
                Ok(Step::Wait) => false,
                Ok(Step::Value(value)) => {
                    if fresh {
                        let is_static = self
                            .code()
                            .chunk(current)
                            .map(Chunk::is_static)
                            .unwrap_or(false);
                        self.store(current, value.clone(), is_static);
                    }
                    self.report(current, &value);
                    true
                }
                Err(err) if err.is_structural() => return Err(err),
                Err(err) if err.is_not_ready() => false,
                Err(err) => {
                    let value = self.fail(current, err);
                    self.report(current, &value);
                    true
                }
            };

            if resume {
                let dependents = self.calls.load(current);
                for dependent in dependents.iter().skip(1).rev() {
                    remaining.push_front(*dependent);
                }
                if fresh {
                    for dependent in &dependents {
                        self.invalidate(*dependent);
                    }
                }
                next = dependents.first().copied();
            }
            if next.is_none() {
                next = remaining.pop_front();
            }
        }
        Ok(())
    }

    pub(crate) fn run_ref(&self, at: Ref) -> Result<Step> {
        let chunk = self.shared.code.chunk(at)?;
        self.run_chunk(chunk, at)
    }

    pub(crate) fn run_chunk(&self, chunk: &Chunk, at: Ref) -> Result<Step> {
        match &chunk.call {
            Call::Primitive(value) => Ok(match self.resolve_value(value, at)? {
                Lookup::Ready(value) => Step::Value(value),
                Lookup::Pending(step) => step,
            }),
            Call::Function(func) => self.run_function(chunk, func, at),
            Call::Property(typ) => self.run_property(chunk, typ),
        }
    }

    fn run_property(&self, chunk: &Chunk, typ: &Type) -> Result<Step> {
        let Some(prop) = self.shared.props.get(&chunk.id) else {
            return Err(Error::eval(format!("cannot find property '{}'", chunk.id)));
        };
        let mut value = to_runtime(prop);
        if let Some(err) = value.error.take() {
            return Err(err);
        }
        if value.data.is_nil() && *typ != Type::Any {
            value.typ = typ.clone();
        }
        Ok(Step::Value(value))
    }

    pub(crate) fn run_function(&self, chunk: &Chunk, func: &Function, at: Ref) -> Result<Step> {
        let Some(binding) = func.binding else {
            return self.run_global_function(chunk, at);
        };
        let receiver = match self.resolve_ref(binding, at)? {
            Lookup::Ready(value) => value,
            Lookup::Pending(step) => return Ok(step),
        };
        self.run_bound_function(&receiver, chunk, at)
    }

    pub(crate) fn run_global_function(&self, chunk: &Chunk, at: Ref) -> Result<Step> {
        match builtins::global(&chunk.id) {
            Some(handler) => handler(self, chunk, at),
            None => self.create_resource(&chunk.id, chunk, at),
        }
    }

    /// Constructs a resource from alternating name/value arguments.
    pub(crate) fn create_resource(&self, name: &str, chunk: &Chunk, at: Ref) -> Result<Step> {
        let values = match self.resolve_args(chunk.args(), at)? {
            Lookup::Ready(values) => values,
            Lookup::Pending(step) => return Ok(step),
        };
        let args = resource_args(values)?;
        debug!(executor = %self.id, resource = name, "executor> create resource");
        let handle = self.shared.backend.create_resource(name, &args)?;
        Ok(Step::Value(RuntimeValue::resource(handle)))
    }

    /// Like [`Self::create_resource`] with a caller-chosen id. `values` are
    /// the already resolved name/value pairs.
    pub(crate) fn create_resource_with_id(
        &self,
        name: &str,
        id: &str,
        values: Vec<RuntimeValue>,
    ) -> Result<RuntimeValue> {
        let args = resource_args(values)?;
        debug!(executor = %self.id, resource = name, id, "executor> create resource");
        let handle = self.shared.backend.create_resource_with_id(name, id, &args)?;
        Ok(RuntimeValue::resource(handle))
    }

    pub(crate) fn run_bound_function(
        &self,
        receiver: &RuntimeValue,
        chunk: &Chunk,
        at: Ref,
    ) -> Result<Step> {
        if receiver.typ == Type::Any && !receiver.data.is_nil() {
            let typed = RuntimeValue::new(infer_type(&receiver.data), receiver.data.clone());
            return self.run_bound_function(&typed, chunk, at);
        }
        if let Some(handler) = builtins::lookup(receiver.typ.kind(), &chunk.id) {
            return handler.call(self, receiver, chunk, at);
        }
        if receiver.typ.is_resource() {
            return self.run_resource_function(receiver, chunk, at);
        }
        Err(Error::unsupported(&chunk.id, receiver.typ.label()))
    }

    /// Reads a resource field by subscribing to it. The value arrives via
    /// the backend callback, possibly before this returns.
    pub(crate) fn run_resource_function(
        &self,
        receiver: &RuntimeValue,
        chunk: &Chunk,
        at: Ref,
    ) -> Result<Step> {
        let Data::Resource(handle) = &receiver.data else {
            return Ok(Step::Value(RuntimeValue::null_of(chunk.typ().clone())));
        };
        let typ = self
            .shared
            .backend
            .schema()
            .field_type(&handle.name, &chunk.id)
            .cloned()
            .unwrap_or_else(|| chunk.typ().clone());

        let watcher_id = self.watcher_uid(at);
        lock(&self.watcher_ids).insert(watcher_id.clone());

        let this = self.this.clone();
        let field_typ = typ.clone();
        let on_update: FieldCallback = Arc::new(move |update| {
            if let Some(block) = this.upgrade() {
                block.on_field_update(at, &field_typ, update);
            }
        });
        trace!(executor = %self.id, at = %at, resource = %handle.name, field = %chunk.id, "executor> watch field");
        match self
            .shared
            .backend
            .watch_field(handle, &chunk.id, &watcher_id, on_update)
        {
            Ok(()) => Ok(Step::Wait),
            Err(err) if err.is_not_ready() => Err(err),
            Err(err) => {
                self.store(at, RuntimeValue::typed_error(typ, err.clone()), false);
                Err(err)
            }
        }
    }

    fn on_field_update(&self, at: Ref, typ: &Type, update: Result<Data>) {
        if self.is_retired() || self.shared.is_decommissioned() {
            return;
        }
        match update {
            Ok(data) => self.settle(at, RuntimeValue::new(typ.clone(), data)),
            Err(err) if err.is_not_ready() => {
                trace!(executor = %self.id, at = %at, "executor> field still loading");
            }
            Err(err) => {
                debug!(executor = %self.id, at = %at, error = %err, "executor> field failed");
                self.trigger_chain_error(at, err);
            }
        }
    }

    /// Records that `dependent` needs `source`. The first registration runs
    /// `source`; later ones wait for it.
    pub(crate) fn connect_ref(&self, source: Ref, dependent: Ref) -> Step {
        if self.calls.store(source, dependent) {
            Step::Wait
        } else {
            Step::Next(source)
        }
    }

    pub(crate) fn resolve_ref(&self, source: Ref, at: Ref) -> Result<Lookup> {
        if source.block_ref() != self.block_ref {
            return self.lookup_value(source).map(Lookup::Ready);
        }
        match self.cached(source) {
            Some(value) => match value.error {
                Some(err) => Err(err),
                None => Ok(Lookup::Ready(value)),
            },
            None => Ok(Lookup::Pending(self.connect_ref(source, at))),
        }
    }

    pub(crate) fn resolve_value(&self, value: &TypedValue, at: Ref) -> Result<Lookup> {
        match &value.typ {
            Type::Ref => {
                let source = value
                    .as_ref()
                    .ok_or_else(|| Error::Decode(format!("malformed ref at {at}")))?;
                self.resolve_ref(source, at)
            }
            Type::Array(child) if has_refs(value) => {
                let mut items = Vec::with_capacity(value.array.len());
                for item in &value.array {
                    match self.resolve_value(item, at)? {
                        Lookup::Ready(resolved) => items.push(resolved.data),
                        Lookup::Pending(step) => return Ok(Lookup::Pending(step)),
                    }
                }
                Ok(Lookup::Ready(RuntimeValue::array(items, (**child).clone())))
            }
            Type::Map(_, _) if has_refs(value) => {
                let mut entries = std::collections::BTreeMap::new();
                for (key, item) in &value.map {
                    match self.resolve_value(item, at)? {
                        Lookup::Ready(resolved) => {
                            entries.insert(key.clone(), resolved.data);
                        }
                        Lookup::Pending(step) => return Ok(Lookup::Pending(step)),
                    }
                }
                Ok(Lookup::Ready(RuntimeValue::new(
                    value.typ.clone(),
                    Data::map(entries),
                )))
            }
            _ => {
                let mut resolved = to_runtime(value);
                match resolved.error.take() {
                    Some(err) => Err(err),
                    None => Ok(Lookup::Ready(resolved)),
                }
            }
        }
    }

    pub(crate) fn resolve_args(
        &self,
        args: &[TypedValue],
        at: Ref,
    ) -> Result<Lookup<Vec<RuntimeValue>>> {
        let mut values = Vec::with_capacity(args.len());
        for arg in args {
            match self.resolve_value(arg, at)? {
                Lookup::Ready(value) => values.push(value),
                Lookup::Pending(step) => return Ok(Lookup::Pending(step)),
            }
        }
        Ok(Lookup::Ready(values))
    }

    /// Value of `target` in this block or any parent block.
    pub(crate) fn lookup_value(&self, target: Ref) -> Result<RuntimeValue> {
        if let Some(value) = self.cached(target) {
            return match value.error {
                Some(err) => Err(err),
                None => Ok(value),
            };
        }
        match self.parent.upgrade() {
            Some(parent) => parent.lookup_value(target),
            None => Err(Error::eval(format!("cannot find value for ref {target}"))),
        }
    }

    pub(crate) fn cached(&self, at: Ref) -> Option<RuntimeValue> {
        self.cache.get(&at).map(|entry| entry.value.clone())
    }

    pub(crate) fn store(&self, at: Ref, value: RuntimeValue, is_static: bool) {
        self.cache.insert(at, StepCache { value, is_static });
    }

    fn invalidate(&self, at: Ref) {
        self.cache.remove_if(&at, |_, entry| !entry.is_static);
    }

    /// Caches an evaluation error at `at` unless an error is already there.
    fn fail(&self, at: Ref, err: Error) -> RuntimeValue {
        if let Some(existing) = self.cached(at).filter(RuntimeValue::is_error) {
            return existing;
        }
        let typ = self
            .code()
            .chunk(at)
            .map(|chunk| chunk.typ().clone())
            .unwrap_or(Type::Unset);
        let value = RuntimeValue::typed_error(typ, err);
        self.store(at, value.clone(), false);
        value
    }

    /// Caches a value that arrived asynchronously and resumes its dependents.
    pub(crate) fn settle(&self, at: Ref, value: RuntimeValue) {
        if self.is_retired() {
            return;
        }
        self.store(at, value.clone(), false);
        self.trigger_chain(at, &value);
    }

    /// Reports `value` for `at` and re-runs everything waiting on it.
    pub(crate) fn trigger_chain(&self, at: Ref, value: &RuntimeValue) {
        self.report(at, value);
        for dependent in self.calls.load(at) {
            self.invalidate(dependent);
            if let Err(err) = self.run_chain(dependent) {
                self.abort(&err);
                return;
            }
        }
    }

    /// Marks `at` and everything downstream of it as failed with `err`.
    pub(crate) fn trigger_chain_error(&self, at: Ref, err: Error) {
        let mut visited = FxHashSet::default();
        let mut queue = VecDeque::from([at]);
        while let Some(current) = queue.pop_front() {
            if !visited.insert(current) {
                continue;
            }
            let typ = self
                .code()
                .chunk(current)
                .map(|chunk| chunk.typ().clone())
                .unwrap_or(Type::Unset);
            let value = RuntimeValue::typed_error(typ, err.clone());
            self.store(current, value.clone(), false);
            self.report(current, &value);
            queue.extend(self.calls.load(current));
        }
    }

    /// Delivers `value` if `at` is a callback point. Pending errors are never
    /// delivered; unchanged values are skipped when deduplication is on.
    fn report(&self, at: Ref, value: &RuntimeValue) {
        let Some(code_id) = self.callback_points.get(&at) else {
            return;
        };
        if self.is_retired() || value.error.as_ref().is_some_and(Error::is_not_ready) {
            return;
        }
        if self.shared.config.dedupe_results {
            let mut delivered = lock(&self.delivered);
            if delivered.get(&at) == Some(value) {
                return;
            }
            delivered.insert(at, value.clone());
        }
        trace!(executor = %self.id, at = %at, "executor> report");
        (self.callback)(RawResult {
            data: value.clone(),
            code_id: code_id.clone(),
        });
    }

    fn watcher_uid(&self, at: Ref) -> String {
        format!("{}\x00{}", self.id, at.raw())
    }

    /// Silences this executor and its children and cancels their watches.
    /// Returns the backend errors met on the way.
    pub(crate) fn retire(&self) -> Option<Error> {
        if self.retired.swap(true, Ordering::SeqCst) {
            return None;
        }
        let children: Vec<Arc<BlockExecutor>> = lock(&self.children)
            .drain()
            .flat_map(|(_, children)| children)
            .collect();
        let mut errors = None;
        for child in children {
            if let Some(err) = child.retire() {
                errors = Error::append(errors, err);
            }
        }
        let watcher_ids: Vec<String> = lock(&self.watcher_ids).drain().collect();
        for watcher_id in watcher_ids {
            if let Err(err) = self.shared.backend.unregister(&watcher_id) {
                warn!(executor = %self.id, error = %err, "executor> failed to unregister watcher");
                errors = Error::append(errors, err);
            }
        }
        errors
    }
}

fn has_refs(value: &TypedValue) -> bool {
    value.is_ref() || value.array.iter().any(has_refs) || value.map.values().any(has_refs)
}

/// Pairs up alternating name/value arguments.
fn resource_args(values: Vec<RuntimeValue>) -> Result<ResourceArgs> {
    if values.len() % 2 != 0 {
        return Err(Error::eval(
            "resource arguments must come in name/value pairs",
        ));
    }
    let mut args = ResourceArgs::new();
    let mut values = values.into_iter();
    while let (Some(name), Some(value)) = (values.next(), values.next()) {
        match name.data {
            Data::String(name) => {
                args.insert(name, value);
            }
            _ => return Err(Error::type_mismatch("string argument name", name.describe())),
        }
    }
    Ok(args)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_args_pair_names_and_values() {
        let args = resource_args(vec![
            RuntimeValue::string("id"),
            RuntimeValue::string("root"),
            RuntimeValue::string("uid"),
            RuntimeValue::int(0),
        ])
        .unwrap();
        assert_eq!(args.len(), 2);
        assert_eq!(args["uid"], RuntimeValue::int(0));

        assert!(resource_args(vec![RuntimeValue::string("id")]).is_err());
        assert!(resource_args(vec![RuntimeValue::int(1), RuntimeValue::int(2)]).is_err());
    }

    #[test]
    fn nested_refs_are_detected() {
        let plain = TypedValue::array(vec![TypedValue::int(1)], Type::Int);
        assert!(!has_refs(&plain));
        let nested = TypedValue::array(
            vec![TypedValue::array(
                vec![TypedValue::reference(Ref::new(0, 0))],
                Type::Ref,
            )],
            Type::array(Type::Ref),
        );
        assert!(has_refs(&nested));
    }
}

//! Demand-driven evaluation of a [`Code`] graph.
//!
//! Evaluation starts at the callback points of the root block and walks
//! dependencies backwards until it finds something it can compute. Values
//! that arrive later (resource fields, child blocks) resume the chains that
//! were waiting for them. Nothing here owns a thread: `run` and every
//! resumption execute on whichever thread calls them.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};

use rustc_hash::FxHashMap;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::backend::ResourceBackend;
use crate::code::{Code, Ref};
use crate::config::ExecutorConfig;
use crate::error::{Error, Result};
use crate::value::RuntimeValue;
use crate::wire::TypedValue;

mod block;
mod calls;
mod fanout;

pub use block::BlockExecutor;
pub use fanout::BlockResult;
pub(crate) use fanout::{element_errors, Aggregate};

/// One delivery for a callback point.
#[derive(Debug, Clone, PartialEq)]
pub struct RawResult {
    pub data: RuntimeValue,
    /// Checksum of the chunk the value belongs to.
    pub code_id: String,
}

pub type ResultCallback = Arc<dyn Fn(RawResult) + Send + Sync>;

/// What running one chunk produced.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Value(RuntimeValue),
    /// The ref has to run first; the current chunk resumes afterwards.
    Next(Ref),
    /// The value arrives later through a trigger.
    Wait,
}

/// Outcome of resolving an argument.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup<T = RuntimeValue> {
    Ready(T),
    Pending(Step),
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State shared by a root executor and all of its children.
pub(crate) struct Shared {
    pub(crate) id: String,
    pub(crate) code: Arc<Code>,
    pub(crate) backend: Arc<dyn ResourceBackend>,
    pub(crate) props: FxHashMap<String, TypedValue>,
    pub(crate) config: ExecutorConfig,
    callback: ResultCallback,
    decommissioned: RwLock<bool>,
}

impl Shared {
    pub(crate) fn is_decommissioned(&self) -> bool {
        *self.decommissioned.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hands a result to the caller unless the executor was unregistered.
    /// The read guard is held across the callback so `decommission` waits
    /// for deliveries already in progress.
    fn deliver(&self, result: RawResult) {
        let guard = self.decommissioned.read().unwrap_or_else(PoisonError::into_inner);
        if *guard {
            return;
        }
        (self.callback)(result);
    }

    /// Returns false if it was already decommissioned.
    fn decommission(&self) -> bool {
        let mut guard = self
            .decommissioned
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        !std::mem::replace(&mut *guard, true)
    }
}

/// Evaluates one piece of code against a resource backend.
///
/// Every entrypoint and datapoint of the root block receives at least one
/// [`RawResult`] through the callback: a value or an error.
pub struct Executor {
    shared: Arc<Shared>,
    root: Arc<BlockExecutor>,
}

impl Executor {
    pub fn new(
        code: Arc<Code>,
        backend: Arc<dyn ResourceBackend>,
        props: impl IntoIterator<Item = (String, TypedValue)>,
        callback: ResultCallback,
    ) -> Result<Self> {
        Self::with_config(code, backend, props, callback, ExecutorConfig::default())
    }

    pub fn with_config(
        code: Arc<Code>,
        backend: Arc<dyn ResourceBackend>,
        props: impl IntoIterator<Item = (String, TypedValue)>,
        callback: ResultCallback,
        config: ExecutorConfig,
    ) -> Result<Self> {
        let shared = Arc::new(Shared {
            id: Uuid::new_v4().to_string(),
            code,
            backend,
            props: props.into_iter().collect(),
            config,
            callback,
            decommissioned: RwLock::new(false),
        });
        let sink = shared.clone();
        let root_callback: ResultCallback = Arc::new(move |result| sink.deliver(result));
        let root = BlockExecutor::new(
            shared.clone(),
            Ref::block(0),
            shared.id.clone(),
            root_callback,
            Weak::new(),
        )?;
        debug!(executor = %shared.id, code = %shared.code.id, "executor> created");
        Ok(Self { shared, root })
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn code(&self) -> &Arc<Code> {
        &self.shared.code
    }

    /// Starts evaluation. Values that are available synchronously are
    /// delivered before this returns; the rest follow from backend updates.
    ///
    /// Structural errors abort the evaluation: they are delivered to every
    /// callback point and returned.
    pub fn run(&self) -> Result<()> {
        debug!(executor = %self.shared.id, "executor> run");
        self.root.run()
    }

    /// Delivers `err` to every callback point without evaluating anything.
    pub fn no_run(&self, err: Error) {
        self.root.no_run(&err);
    }

    /// Stops the evaluation: cancels every watch of this executor and its
    /// children. No result is delivered after this returns.
    pub fn unregister(&self) -> Result<()> {
        if !self.shared.decommission() {
            return Ok(());
        }
        debug!(executor = %self.shared.id, "executor> unregister");
        match self.root.retire() {
            None => Ok(()),
            Some(err) => {
                warn!(executor = %self.shared.id, error = %err, "executor> unregister failed");
                Err(err)
            }
        }
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        if self.shared.config.unregister_on_drop {
            // Errors are already logged by unregister.
            let _ = self.unregister();
        }
    }
}

#[cfg(test)]
mod tests;

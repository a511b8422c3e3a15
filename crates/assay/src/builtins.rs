//! The builtin dispatch table.
//!
//! Handlers are keyed by the receiver's [`Kind`] and a signature string:
//! the operator followed by the argument's type label (`==int`, `+string`)
//! or a method name (`length`, `where`). The builder resolves signatures
//! once at graph-build time; at runtime a chunk's id is looked up as is.
//!
//! Some generic signatures are compile entries: they only exist to rewrite
//! the signature from the operand types (`[]int == []int` becomes
//! `int==[]int`).

use std::sync::OnceLock;

use rustc_hash::FxHashMap;

use crate::code::{Chunk, Ref};
use crate::error::{Error, Result};
use crate::executor::{BlockExecutor, Step};
use crate::types::{Kind, Type};
use crate::value::RuntimeValue;
use crate::wire::TypedValue;

/// Unwraps a ready [`crate::executor::Lookup`] or returns its pending step.
macro_rules! ready {
    ($lookup:expr) => {
        match $lookup? {
            $crate::executor::Lookup::Ready(value) => value,
            $crate::executor::Lookup::Pending(step) => return Ok(step),
        }
    };
}

mod array;
mod global;
mod map;
mod resource;
mod simple;
mod string;
mod time;


pub use simple::values_equal;

pub type HandlerFn = fn(&BlockExecutor, &RuntimeValue, &Chunk, Ref) -> Result<Step>;
pub type GlobalFn = fn(&BlockExecutor, &Chunk, Ref) -> Result<Step>;
pub type BinaryFn = fn(&RuntimeValue, &RuntimeValue) -> Result<RuntimeValue>;
pub type MethodFn = fn(&RuntimeValue, &[RuntimeValue]) -> Result<RuntimeValue>;
/// Picks the specific signature for `receiver op argument`.
pub type CompileFn = fn(receiver: &Type, argument: &Type) -> Result<String>;

#[derive(Debug, Clone, Copy)]
pub enum Handler {
    /// An operator; its single argument is resolved first.
    Binary(BinaryFn),
    /// A method over its resolved arguments.
    Method(MethodFn),
    /// Needs the executor: lazy arguments, child blocks, resource watches.
    Exec(HandlerFn),
}

impl Handler {
    pub fn call(
        &self,
        exec: &BlockExecutor,
        receiver: &RuntimeValue,
        chunk: &Chunk,
        at: Ref,
    ) -> Result<Step> {
        match self {
            Handler::Binary(op) => {
                let right = ready!(exec.resolve_value(arg(chunk, 0)?, at));
                Ok(Step::Value(op(receiver, &right)?))
            }
            Handler::Method(method) => {
                let args = ready!(exec.resolve_args(chunk.args(), at));
                Ok(Step::Value(method(receiver, &args)?))
            }
            Handler::Exec(handler) => handler(exec, receiver, chunk, at),
        }
    }
}

/// Result type of a builtin, relative to its receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Returns {
    Bool,
    Int,
    Float,
    String,
    Time,
    Dict,
    StringArray,
    /// Same type as the receiver.
    Receiver,
    /// Element type of the receiver.
    Child,
    Keys,
    Values,
    Block,
    /// One block value per element.
    Blocks,
    /// Whatever the first argument is.
    Argument,
    /// One value per element, typed by the function argument's result.
    Mapped,
}

impl Returns {
    /// `args` are the argument types of the call, refs already followed.
    pub fn resolve(self, receiver: &Type, args: &[Type]) -> Type {
        match self {
            Returns::Bool => Type::Bool,
            Returns::Int => Type::Int,
            Returns::Float => Type::Float,
            Returns::String => Type::String,
            Returns::Time => Type::Time,
            Returns::Dict => Type::Dict,
            Returns::StringArray => Type::array(Type::String),
            Returns::Receiver => receiver.clone(),
            Returns::Child => receiver.child(),
            Returns::Keys => match receiver.key() {
                Some(key) => Type::array(key.clone()),
                None => Type::array(Type::String),
            },
            Returns::Values => Type::array(receiver.child()),
            Returns::Block => Type::Block,
            Returns::Blocks => Type::array(Type::Block),
            Returns::Argument => args.first().cloned().unwrap_or(Type::Any),
            Returns::Mapped => Type::array(
                args.iter()
                    .find(|arg| arg.is_function())
                    .map(Type::child)
                    .unwrap_or(Type::Any),
            ),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Entry {
    pub handler: Option<Handler>,
    pub compile: Option<CompileFn>,
    pub returns: Returns,
}

#[derive(Default)]
pub struct Builtins {
    kinds: FxHashMap<Kind, FxHashMap<String, Entry>>,
    globals: FxHashMap<&'static str, GlobalFn>,
}

impl Builtins {
    fn build() -> Self {
        let mut table = Builtins::default();
        simple::register(&mut table);
        string::register(&mut table);
        time::register(&mut table);
        array::register(&mut table);
        map::register(&mut table);
        resource::register(&mut table);
        global::register(&mut table);
        table
    }

    fn add(&mut self, kind: Kind, signature: impl Into<String>, handler: Handler, returns: Returns) {
        self.kinds.entry(kind).or_default().insert(
            signature.into(),
            Entry {
                handler: Some(handler),
                compile: None,
                returns,
            },
        );
    }

    fn add_compiler(&mut self, kind: Kind, signature: &str, compile: CompileFn, returns: Returns) {
        let entry = self
            .kinds
            .entry(kind)
            .or_default()
            .entry(signature.to_string())
            .or_insert(Entry {
                handler: None,
                compile: None,
                returns,
            });
        entry.compile = Some(compile);
    }

    fn add_global(&mut self, name: &'static str, handler: GlobalFn) {
        self.globals.insert(name, handler);
    }

    pub fn entry(&self, kind: Kind, signature: &str) -> Option<&Entry> {
        self.kinds.get(&kind).and_then(|entries| entries.get(signature))
    }

    /// Signatures registered for `kind`, sorted.
    pub fn signatures(&self, kind: Kind) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .kinds
            .get(&kind)
            .map(|entries| entries.keys().map(String::as_str).collect())
            .unwrap_or_default();
        names.sort_unstable();
        names
    }
}

/// The process-wide table, built on first use.
pub fn table() -> &'static Builtins {
    static TABLE: OnceLock<Builtins> = OnceLock::new();
    TABLE.get_or_init(Builtins::build)
}

pub fn lookup(kind: Kind, signature: &str) -> Option<&'static Handler> {
    table()
        .entry(kind, signature)
        .and_then(|entry| entry.handler.as_ref())
}

pub fn global(name: &str) -> Option<GlobalFn> {
    table().globals.get(name).copied()
}

/// Resolves `receiver op argument` to a signature and its result type.
///
/// Tries the operator's compile entry, then the exact argument label, then
/// the argument's kind label.
pub fn resolve_operator(receiver: &Type, op: &str, argument: &Type) -> Result<(String, Type)> {
    let table = table();
    let kind = receiver.kind();
    let signature = match table.entry(kind, op).and_then(|entry| entry.compile) {
        Some(compile) => compile(receiver, argument)?,
        None => {
            let exact = format!("{op}{}", argument.label());
            if table.entry(kind, &exact).is_some() {
                exact
            } else {
                format!("{op}{}", argument.kind().label())
            }
        }
    };
    match table.entry(kind, &signature) {
        Some(entry) if entry.handler.is_some() => {
            Ok((signature, entry.returns.resolve(receiver, std::slice::from_ref(argument))))
        }
        _ => Err(Error::unsupported(
            format!("{op}{}", argument.label()),
            receiver.label(),
        )),
    }
}

/// Result type of method `name` on `receiver` called with `args`, if the
/// method exists.
pub fn method_type(receiver: &Type, name: &str, args: &[Type]) -> Option<Type> {
    table()
        .entry(receiver.kind(), name)
        .filter(|entry| entry.handler.is_some())
        .map(|entry| entry.returns.resolve(receiver, args))
}

fn arg<'a>(chunk: &'a Chunk, index: usize) -> Result<&'a TypedValue> {
    chunk.args().get(index).ok_or_else(|| {
        Error::eval(format!(
            "missing argument {} for '{}'",
            index + 1,
            chunk.id
        ))
    })
}

fn arg_value<'a>(args: &'a [RuntimeValue], index: usize, name: &str) -> Result<&'a RuntimeValue> {
    args.get(index)
        .ok_or_else(|| Error::eval(format!("missing argument {} for '{name}'", index + 1)))
}

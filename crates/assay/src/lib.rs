//! Execution engine for compiled queries.
//!
//! A [`Code`] graph is evaluated by an [`Executor`] against a
//! [`ResourceBackend`]. Results are delivered per entrypoint and datapoint
//! through a callback, possibly long after [`Executor::run`] returned.

pub mod assessment;
pub mod backend;
pub mod builtins;
pub mod checksum;
pub mod code;
pub mod collector;
pub mod config;
pub mod convert;
pub mod error;
pub mod executor;
pub mod types;
pub mod value;
pub mod wire;

pub use assessment::{assess, Assessment, AssessmentItem};
pub use backend::{FieldState, MemoryBackend, ResourceBackend, Schema};
pub use code::{Chunk, Code, CodeBuilder, Ref};
pub use config::ExecutorConfig;
pub use error::{Error, Result};
pub use executor::{Executor, RawResult, ResultCallback};
pub use types::Type;
pub use value::{Data, RuntimeValue};
pub use wire::TypedValue;

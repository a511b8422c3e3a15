use thiserror::Error;

use crate::code::Ref;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while building, decoding or evaluating code.
///
/// Errors are values: they are cloned into [`crate::value::RuntimeValue`]s and
/// travel along the dependency graph, so every variant is `Clone`.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    /// The value is being fetched; retry once the backend reports it.
    #[error("{0} is not ready yet")]
    NotReady(String),

    #[error("{0}")]
    Eval(String),

    #[error("cannot find function '{name}' for type '{typ}'")]
    UnsupportedOperation { name: String, typ: String },

    #[error("array index out of bound (trying to access element {index}, max: {max})")]
    IndexOutOfBounds { index: i64, max: i64 },

    #[error("type mismatch: expected {expected}, got {actual}")]
    TypeMismatch { expected: String, actual: String },

    #[error("division by zero")]
    DivisionByZero,

    #[error("backend: {0}")]
    Backend(String),

    #[error("invalid ref {0}")]
    InvalidRef(Ref),

    #[error("missing checksum for ref {0}")]
    MissingChecksum(Ref),

    #[error("cannot find block {0}")]
    MissingBlock(Ref),

    #[error("cannot execute with invalid ref {0} in entrypoint or datapoint")]
    InvalidEntrypoint(Ref),

    #[error("element {index}: {source}")]
    Element { index: usize, source: Box<Error> },

    #[error("{}", format_multi(.0))]
    Multi(Vec<Error>),

    #[error("failed to decode value: {0}")]
    Decode(String),

    #[error("config: {0}")]
    Config(String),
}

impl Error {
    pub fn eval(message: impl Into<String>) -> Self {
        Error::Eval(message.into())
    }

    pub fn unsupported(name: impl Into<String>, typ: impl Into<String>) -> Self {
        Error::UnsupportedOperation {
            name: name.into(),
            typ: typ.into(),
        }
    }

    pub fn type_mismatch(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Error::TypeMismatch {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    pub fn is_not_ready(&self) -> bool {
        matches!(self, Error::NotReady(_))
    }

    /// Structural errors mean the graph itself is malformed.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Error::InvalidRef(_)
                | Error::MissingChecksum(_)
                | Error::MissingBlock(_)
                | Error::InvalidEntrypoint(_)
        )
    }

    /// Appends `err` to an optional aggregate, flattening nested aggregates.
    pub fn append(acc: Option<Error>, err: Error) -> Option<Error> {
        let mut errors = match acc {
            None => Vec::new(),
            Some(Error::Multi(errors)) => errors,
            Some(other) => vec![other],
        };
        match err {
            Error::Multi(more) => errors.extend(more),
            other => errors.push(other),
        }
        Some(Error::Multi(errors))
    }

    /// The errors of an aggregate, or the error itself.
    pub fn errors(&self) -> Vec<&Error> {
        match self {
            Error::Multi(errors) => errors.iter().collect(),
            other => vec![other],
        }
    }
}

fn format_multi(errors: &[Error]) -> String {
    if errors.len() == 1 {
        return format!("1 error occurred: {}", errors[0]);
    }
    let mut out = format!("{} errors occurred:", errors.len());
    for err in errors {
        out.push_str("\n\t* ");
        out.push_str(&err.to_string());
    }
    out
}

//! Async receivers for executor results.
//!
//! Executors call back synchronously on whatever thread produced a value.
//! These adapters hand the results to async code through `tokio` channels.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};

use crate::code::Code;
use crate::error::{Error, Result};
use crate::executor::{lock, RawResult, ResultCallback};
use crate::value::RuntimeValue;

/// Results by checksum, latest value wins.
pub type Collected = BTreeMap<String, RuntimeValue>;

/// Returns a callback for [`crate::Executor::new`] and the receiving end.
pub fn channel() -> (ResultCallback, ResultReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    let callback: ResultCallback = Arc::new(move |result| {
        // A dropped receiver means nobody is listening any more.
        let _ = tx.send(result);
    });
    (callback, ResultReceiver { rx })
}

pub struct ResultReceiver {
    rx: mpsc::UnboundedReceiver<RawResult>,
}

impl ResultReceiver {
    /// Waits for the next result. `None` once every callback is dropped.
    pub async fn next(&mut self) -> Option<RawResult> {
        self.rx.recv().await
    }

    /// A result that is already queued, if any.
    pub fn try_next(&mut self) -> Option<RawResult> {
        self.rx.try_recv().ok()
    }

    /// Waits until `count` distinct checksums reported.
    pub async fn collect(&mut self, count: usize) -> Result<Collected> {
        let mut collected = Collected::new();
        while collected.len() < count {
            let Some(result) = self.rx.recv().await else {
                return Err(Error::eval(format!(
                    "result channel closed after {} of {count} results",
                    collected.len()
                )));
            };
            collected.insert(result.code_id, result.data);
        }
        // Later updates for the same checksums may already be queued.
        while let Ok(result) = self.rx.try_recv() {
            collected.insert(result.code_id, result.data);
        }
        Ok(collected)
    }
}

/// Resolves once every callback point of the root block reported.
pub struct Completion {
    rx: oneshot::Receiver<Collected>,
}

struct Pending {
    expected: usize,
    collected: Collected,
    done: Option<oneshot::Sender<Collected>>,
}

/// A callback that completes [`Completion`] once `code`'s entrypoints and
/// datapoints all reported. `forward` still sees every result.
pub fn completion(code: &Code, forward: Option<ResultCallback>) -> Result<(ResultCallback, Completion)> {
    let mut sums: Vec<&str> = Vec::new();
    for point in code.entrypoints().iter().chain(code.datapoints()) {
        let sum = code.checksum_of(*point)?;
        if !sums.contains(&sum) {
            sums.push(sum);
        }
    }
    let (tx, rx) = oneshot::channel();
    let pending = Mutex::new(Pending {
        expected: sums.len(),
        collected: Collected::new(),
        done: Some(tx),
    });
    if sums.is_empty() {
        if let Some(done) = lock(&pending).done.take() {
            let _ = done.send(Collected::new());
        }
    }

    let callback: ResultCallback = Arc::new(move |result: RawResult| {
        if let Some(forward) = &forward {
            forward(result.clone());
        }
        let mut pending = lock(&pending);
        pending.collected.insert(result.code_id, result.data);
        if pending.collected.len() >= pending.expected {
            if let Some(done) = pending.done.take() {
                let _ = done.send(pending.collected.clone());
            }
        }
    });
    Ok((callback, Completion { rx }))
}

impl Completion {
    pub async fn wait(self) -> Result<Collected> {
        self.rx
            .await
            .map_err(|_| Error::eval("evaluation ended before every result arrived"))
    }

    /// The results if they are complete already.
    pub fn try_wait(&mut self) -> Option<Collected> {
        self.rx.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::CodeBuilder;
    use crate::wire::TypedValue;

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap()
    }

    fn result(code_id: &str, value: i64) -> RawResult {
        RawResult {
            data: RuntimeValue::int(value),
            code_id: code_id.to_string(),
        }
    }

    #[test]
    fn collect_keeps_the_latest_value_per_checksum() {
        let (callback, mut receiver) = channel();
        callback(result("a", 1));
        callback(result("a", 2));
        callback(result("b", 3));
        callback(result("a", 4));

        let collected = runtime().block_on(receiver.collect(2)).unwrap();
        assert_eq!(collected["a"], RuntimeValue::int(4));
        assert_eq!(collected["b"], RuntimeValue::int(3));
        assert!(receiver.try_next().is_none());
    }

    #[test]
    fn collect_fails_once_senders_are_gone() {
        let (callback, mut receiver) = channel();
        callback(result("a", 1));
        drop(callback);
        let err = runtime().block_on(receiver.collect(2)).unwrap_err();
        assert!(err.to_string().contains("1 of 2"), "{err}");
    }

    #[test]
    fn completion_waits_for_every_callback_point() {
        let mut builder = CodeBuilder::new();
        let one = builder.literal(TypedValue::int(1)).unwrap();
        let two = builder.literal(TypedValue::int(2)).unwrap();
        builder.entrypoint(one).unwrap();
        builder.datapoint(two).unwrap();
        let code = builder.finish().unwrap();

        let (forward, mut receiver) = channel();
        let (callback, mut completion) = completion(&code, Some(forward)).unwrap();
        callback(result(code.checksum_of(one).unwrap(), 1));
        assert!(completion.try_wait().is_none());
        callback(result(code.checksum_of(two).unwrap(), 2));

        let collected = runtime().block_on(completion.wait()).unwrap();
        assert_eq!(collected.len(), 2);
        assert!(receiver.try_next().is_some());
    }
}

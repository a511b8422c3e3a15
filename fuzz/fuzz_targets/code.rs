#![no_main]

use std::sync::Arc;

use assay::{Code, Executor, MemoryBackend, ResourceBackend, ResultCallback, Schema, TypedValue};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Large graphs only slow the fuzzer down.
    if data.len() > 16 * 1024 {
        return;
    }
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    let Ok(code) = Code::from_json(text) else {
        return;
    };
    let backend: Arc<dyn ResourceBackend> = Arc::new(MemoryBackend::new(Schema::default()));
    let callback: ResultCallback = Arc::new(|_| {});
    let props: Vec<(String, TypedValue)> = Vec::new();
    if let Ok(executor) = Executor::new(Arc::new(code), backend, props, callback) {
        let _ = executor.run();
    }
});

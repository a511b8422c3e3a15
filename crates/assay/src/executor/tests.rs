use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use super::*;
use crate::backend::{FieldState, MemoryBackend, Schema};
use crate::code::{Chunk, CodeBuilder};
use crate::types::Type;
use crate::value::{Data, ResourceHandle};

type Seen = Arc<Mutex<Vec<RawResult>>>;

fn recorder() -> (ResultCallback, Seen) {
    let seen: Seen = Arc::default();
    let sink = seen.clone();
    let callback: ResultCallback = Arc::new(move |result| sink.lock().unwrap().push(result));
    (callback, seen)
}

fn schema() -> Schema {
    Schema::default()
        .with_field("users", "list", Type::array(Type::resource("user")))
        .with_field("user", "name", Type::String)
        .with_field("user", "uid", Type::Int)
}

fn start(code: Code, backend: Arc<MemoryBackend>, config: ExecutorConfig) -> (Executor, Seen) {
    let (callback, seen) = recorder();
    let backend: Arc<dyn ResourceBackend> = backend;
    let props: Vec<(String, TypedValue)> = Vec::new();
    let executor = Executor::with_config(Arc::new(code), backend, props, callback, config).unwrap();
    executor.run().unwrap();
    (executor, seen)
}

fn values_for(seen: &Seen, code_id: &str) -> Vec<RuntimeValue> {
    seen.lock()
        .unwrap()
        .iter()
        .filter(|result| result.code_id == code_id)
        .map(|result| result.data.clone())
        .collect()
}

/// `user(id: "root").name` compared against a string.
fn name_check(expected: &str) -> (Code, Ref, Ref) {
    let mut b = CodeBuilder::new();
    let user = b.resource("user", vec![("id", TypedValue::string("root"))]).unwrap();
    let name = b.field(user, "name", Type::String).unwrap();
    let check = b.op(name, "==", TypedValue::string(expected)).unwrap();
    b.entrypoint(check).unwrap();
    b.datapoint(name).unwrap();
    (b.finish().unwrap(), name, check)
}

#[test]
fn literal_arithmetic_reports_synchronously() {
    let mut b = CodeBuilder::new();
    let one = b.literal(TypedValue::int(1)).unwrap();
    let sum = b.op(one, "+", TypedValue::int(2)).unwrap();
    let check = b.op(sum, "==", TypedValue::int(3)).unwrap();
    b.entrypoint(check).unwrap();
    let code = b.finish().unwrap();
    let sum_id = code.checksum_of(check).unwrap().to_string();

    let backend = Arc::new(MemoryBackend::new(schema()));
    let (_executor, seen) = start(code, backend, ExecutorConfig::default());
    let results = seen.lock().unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].code_id, sum_id);
    assert_eq!(results[0].data, RuntimeValue::bool(true));
}

#[test]
fn pending_fields_report_once_they_arrive() {
    let backend = Arc::new(MemoryBackend::new(schema()));
    let root = backend.add_resource("user", "root", [("name", FieldState::Pending)]);
    let (code, name, check) = name_check("root");
    let check_id = code.checksum_of(check).unwrap().to_string();
    let name_id = code.checksum_of(name).unwrap().to_string();

    let (_executor, seen) = start(code, backend.clone(), ExecutorConfig::default());
    assert!(seen.lock().unwrap().is_empty());

    backend.set_field(&root, "name", FieldState::Ready(Data::String("root".into())));
    assert_eq!(values_for(&seen, &check_id), vec![RuntimeValue::bool(true)]);
    assert_eq!(values_for(&seen, &name_id), vec![RuntimeValue::string("root")]);

    // Same value again is swallowed, a new one is delivered.
    backend.set_field(&root, "name", FieldState::Ready(Data::String("root".into())));
    assert_eq!(values_for(&seen, &check_id).len(), 1);
    backend.set_field(&root, "name", FieldState::Ready(Data::String("toor".into())));
    assert_eq!(
        values_for(&seen, &check_id),
        vec![RuntimeValue::bool(true), RuntimeValue::bool(false)]
    );
}

#[test]
fn repeated_values_are_delivered_without_dedupe() {
    let backend = Arc::new(MemoryBackend::new(schema()));
    let root = backend.add_resource("user", "root", [("name", FieldState::Pending)]);
    let (code, _, check) = name_check("root");
    let check_id = code.checksum_of(check).unwrap().to_string();
    let config = ExecutorConfig {
        dedupe_results: false,
        ..ExecutorConfig::default()
    };
    let (_executor, seen) = start(code, backend.clone(), config);

    for _ in 0..2 {
        backend.set_field(&root, "name", FieldState::Ready(Data::String("root".into())));
    }
    assert_eq!(values_for(&seen, &check_id).len(), 2);
}

#[test]
fn terminal_watch_errors_reach_dependents() {
    let backend = Arc::new(MemoryBackend::new(schema()));
    backend.add_resource(
        "user",
        "root",
        [("name", FieldState::Failed(Error::Backend("disk gone".into())))],
    );
    let (code, _, check) = name_check("root");
    let check_id = code.checksum_of(check).unwrap().to_string();

    let (_executor, seen) = start(code, backend, ExecutorConfig::default());
    let values = values_for(&seen, &check_id);
    assert_eq!(values.len(), 1);
    let err = values[0].error.as_ref().unwrap();
    assert!(matches!(err, Error::Backend(message) if message == "disk gone"));
}

#[test]
fn late_failures_replace_earlier_values() {
    let backend = Arc::new(MemoryBackend::new(schema()));
    let root = backend.add_resource("user", "root", [("name", FieldState::Pending)]);
    let (code, _, check) = name_check("root");
    let check_id = code.checksum_of(check).unwrap().to_string();
    let (_executor, seen) = start(code, backend.clone(), ExecutorConfig::default());

    backend.set_field(&root, "name", FieldState::Ready(Data::String("root".into())));
    backend.set_field(&root, "name", FieldState::Failed(Error::Backend("revoked".into())));
    let values = values_for(&seen, &check_id);
    assert_eq!(values.len(), 2);
    assert!(values[0].is_success());
    assert!(values[1].is_error());
}

#[test]
fn unregister_silences_the_executor() {
    let backend = Arc::new(MemoryBackend::new(schema()));
    let root = backend.add_resource("user", "root", [("name", FieldState::Pending)]);
    let (code, _, _) = name_check("root");
    let (executor, seen) = start(code, backend.clone(), ExecutorConfig::default());
    assert_eq!(backend.watcher_count(), 1);

    executor.unregister().unwrap();
    assert_eq!(backend.watcher_count(), 0);
    assert_eq!(backend.unregistered().len(), 1);
    assert!(backend.unregistered()[0].starts_with(executor.id()));

    backend.set_field(&root, "name", FieldState::Ready(Data::String("root".into())));
    assert!(seen.lock().unwrap().is_empty());
    // A second call has nothing left to do.
    executor.unregister().unwrap();
    assert_eq!(backend.unregistered().len(), 1);
}

#[test]
fn unregister_wins_against_concurrent_field_updates() {
    let backend = Arc::new(MemoryBackend::new(schema()));
    let root = backend.add_resource("user", "root", [("name", FieldState::Pending)]);
    let (code, _, _) = name_check("root");
    let (executor, seen) = start(code, backend.clone(), ExecutorConfig::default());

    let stop = Arc::new(AtomicBool::new(false));
    let writers: Vec<_> = (0..4)
        .map(|writer| {
            let backend = backend.clone();
            let root = root.clone();
            let stop = stop.clone();
            thread::spawn(move || {
                let mut round = 0usize;
                while !stop.load(Ordering::SeqCst) {
                    let name = if (round + writer) % 2 == 0 { "root" } else { "other" };
                    backend.set_field(&root, "name", FieldState::Ready(Data::String(name.into())));
                    round += 1;
                }
            })
        })
        .collect();

    let deadline = Instant::now() + Duration::from_secs(10);
    while seen.lock().unwrap().is_empty() && Instant::now() < deadline {
        thread::yield_now();
    }
    assert!(!seen.lock().unwrap().is_empty());

    executor.unregister().unwrap();
    let delivered = seen.lock().unwrap().len();
    thread::sleep(Duration::from_millis(20));
    stop.store(true, Ordering::SeqCst);
    for writer in writers {
        writer.join().unwrap();
    }
    assert_eq!(seen.lock().unwrap().len(), delivered);
}

#[test]
fn dropping_the_executor_unregisters_it() {
    let backend = Arc::new(MemoryBackend::new(schema()));
    backend.add_resource("user", "root", [("name", FieldState::Pending)]);
    let (code, _, _) = name_check("root");
    let (executor, _) = start(code, backend.clone(), ExecutorConfig::default());
    drop(executor);
    assert_eq!(backend.watcher_count(), 0);
}

#[test]
fn fan_out_keeps_element_order_and_collects_errors() {
    let mut b = CodeBuilder::new();
    let list = b
        .literal(TypedValue::array(
            [1, 0, 2].map(TypedValue::int).to_vec(),
            Type::Int,
        ))
        .unwrap();
    let quotients = b
        .map(list, list, |b, params| {
            let ten = b.literal(TypedValue::int(10))?;
            b.op(ten, "/", TypedValue::reference(params[0]))
        })
        .unwrap();
    b.entrypoint(quotients).unwrap();
    let code = b.finish().unwrap();
    let id = code.checksum_of(quotients).unwrap().to_string();

    let backend = Arc::new(MemoryBackend::new(schema()));
    let (_executor, seen) = start(code, backend, ExecutorConfig::default());
    let values = values_for(&seen, &id);
    assert_eq!(values.len(), 1);
    let value = &values[0];
    let items = value.data.as_array().unwrap();
    assert_eq!(items.len(), 3);
    assert_eq!(items[0], Data::Int(10));
    assert_eq!(items[2], Data::Int(5));

    let Some(Error::Multi(errors)) = &value.error else {
        panic!("expected combined element errors, got {:?}", value.error);
    };
    assert_eq!(errors.len(), 1);
    assert!(matches!(
        &errors[0],
        Error::Element { index: 1, source } if matches!(**source, Error::DivisionByZero)
    ));
}

#[test]
fn fan_out_limit_is_an_error_value() {
    let mut b = CodeBuilder::new();
    let list = b
        .literal(TypedValue::array([1, 2, 3].map(TypedValue::int).to_vec(), Type::Int))
        .unwrap();
    let kept = b
        .filter(list, list, |b, params| b.op(params[0], ">", TypedValue::int(1)))
        .unwrap();
    b.entrypoint(kept).unwrap();
    let code = b.finish().unwrap();
    let id = code.checksum_of(kept).unwrap().to_string();

    let config = ExecutorConfig {
        max_fan_out: 2,
        ..ExecutorConfig::default()
    };
    let (_executor, seen) = start(code, Arc::new(MemoryBackend::new(schema())), config);
    let values = values_for(&seen, &id);
    assert!(values[0].error.as_ref().unwrap().to_string().contains("limit is 2"));
}

#[test]
fn fan_in_waits_for_fields_set_from_many_threads() {
    let backend = Arc::new(MemoryBackend::new(schema()));
    let mut users = Vec::new();
    for idx in 0..8 {
        users.push(backend.add_resource("user", &format!("u{idx}"), [("uid", FieldState::Pending)]));
    }
    let list = users.iter().cloned().map(Data::Resource).collect();
    backend.add_resource("users", "", [("list", FieldState::Ready(Data::array(list)))]);

    let mut b = CodeBuilder::new();
    let all_users = b.resource("users", Vec::new()).unwrap();
    let list = b
        .field(all_users, "list", Type::array(Type::resource("user")))
        .unwrap();
    let system = b
        .filter(all_users, list, |b, params| {
            let uid = b.field(params[0], "uid", Type::Int)?;
            b.op(uid, "<", TypedValue::int(1000))
        })
        .unwrap();
    let count = b.method(system, "length", Vec::new()).unwrap();
    b.entrypoint(count).unwrap();
    let code = b.finish().unwrap();
    let id = code.checksum_of(count).unwrap().to_string();

    let (_executor, seen) = start(code, backend.clone(), ExecutorConfig::default());
    assert!(seen.lock().unwrap().is_empty());

    let handles: Vec<_> = users
        .into_iter()
        .enumerate()
        .map(|(idx, user): (usize, ResourceHandle)| {
            let backend = backend.clone();
            thread::spawn(move || {
                let uid = if idx % 2 == 0 { idx as i64 } else { 1000 + idx as i64 };
                backend.set_field(&user, "uid", FieldState::Ready(Data::Int(uid)));
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(values_for(&seen, &id), vec![RuntimeValue::int(4)]);
}

#[test]
fn properties_come_from_the_executor() {
    let mut b = CodeBuilder::new();
    let limit = b.property("limit", Type::Int).unwrap();
    let next = b.op(limit, "+", TypedValue::int(1)).unwrap();
    let missing = b.property("missing", Type::Int).unwrap();
    b.entrypoint(next).unwrap();
    b.entrypoint(missing).unwrap();
    let code = b.finish().unwrap();
    let next_id = code.checksum_of(next).unwrap().to_string();
    let missing_id = code.checksum_of(missing).unwrap().to_string();

    let (callback, seen) = recorder();
    let backend: Arc<dyn ResourceBackend> = Arc::new(MemoryBackend::new(schema()));
    let props = vec![("limit".to_string(), TypedValue::int(3))];
    let executor = Executor::new(Arc::new(code), backend, props, callback).unwrap();
    executor.run().unwrap();

    assert_eq!(values_for(&seen, &next_id), vec![RuntimeValue::int(4)]);
    let missing = values_for(&seen, &missing_id);
    assert!(missing[0].error.as_ref().unwrap().to_string().contains("missing"));
}

#[test]
fn structural_errors_abort_every_callback_point() {
    let mut b = CodeBuilder::new();
    let one = b.literal(TypedValue::int(1)).unwrap();
    let sum = b.op(one, "+", TypedValue::int(1)).unwrap();
    let other = b.literal(TypedValue::int(5)).unwrap();
    b.entrypoint(sum).unwrap();
    b.entrypoint(other).unwrap();
    let mut code = b.finish().unwrap();
    // Point the literal at a chunk that does not exist.
    code.block_mut(Ref::block(0)).unwrap().chunks[0] =
        Chunk::function("+int", Type::Int, Some(Ref::new(0, 42)), Vec::new());

    let (callback, seen) = recorder();
    let backend: Arc<dyn ResourceBackend> = Arc::new(MemoryBackend::new(schema()));
    let props: Vec<(String, TypedValue)> = Vec::new();
    let executor = Executor::new(Arc::new(code), backend, props, callback).unwrap();
    let err = executor.run().unwrap_err();
    assert!(err.is_structural());
    assert!(seen.lock().unwrap().iter().any(|result| result.data.is_error()));
}

#[test]
fn no_run_reports_the_error_everywhere() {
    let (code, _, _) = name_check("root");
    let (callback, seen) = recorder();
    let backend: Arc<dyn ResourceBackend> = Arc::new(MemoryBackend::new(schema()));
    let props: Vec<(String, TypedValue)> = Vec::new();
    let executor = Executor::new(Arc::new(code), backend, props, callback).unwrap();
    executor.no_run(Error::eval("not scheduled"));

    let results = seen.lock().unwrap();
    assert_eq!(results.len(), 2);
    assert!(results
        .iter()
        .all(|result| result.data.error == Some(Error::eval("not scheduled"))));
}

#[test]
fn executors_get_distinct_ids() {
    let (code, _, _) = name_check("root");
    let code = Arc::new(code);
    let backend: Arc<dyn ResourceBackend> = Arc::new(MemoryBackend::new(schema()));
    let (callback, _) = recorder();
    let props: Vec<(String, TypedValue)> = Vec::new();
    let a = Executor::new(code.clone(), backend.clone(), props.clone(), callback.clone()).unwrap();
    let b = Executor::new(code, backend, props, callback).unwrap();
    assert_ne!(a.id(), b.id());
    assert_eq!(a.code().id, b.code().id);
}

use std::sync::Arc;

use assay::assessment::assess_results;
use assay::collector::{channel, completion};
use assay::value::ResourceHandle;
use assay::{
    CodeBuilder, Data, Error, Executor, FieldState, MemoryBackend, ResourceBackend, RuntimeValue,
    Schema, Type, TypedValue,
};

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap()
}

fn schema() -> Schema {
    Schema::default()
        .with_field("users", "list", Type::array(Type::resource("user")))
        .with_field("user", "name", Type::String)
}

fn no_props() -> Vec<(String, TypedValue)> {
    Vec::new()
}

/// Registers `users` with one `user` per entry.
fn users(backend: &MemoryBackend, names: &[FieldState]) -> Vec<ResourceHandle> {
    let handles: Vec<ResourceHandle> = names
        .iter()
        .enumerate()
        .map(|(idx, name)| backend.add_resource("user", &format!("u{idx}"), [("name", name.clone())]))
        .collect();
    let list = handles.iter().cloned().map(Data::Resource).collect();
    backend.add_resource("users", "", [("list", FieldState::Ready(Data::array(list)))]);
    handles
}

#[test]
fn arithmetic_assertion_passes() {
    let mut b = CodeBuilder::new();
    let one = b.literal(TypedValue::int(1)).unwrap();
    let sum = b.op(one, "+", TypedValue::int(2)).unwrap();
    let check = b.op(sum, "==", TypedValue::int(3)).unwrap();
    b.entrypoint(check).unwrap();
    let code = Arc::new(b.finish().unwrap());

    let (callback, done) = completion(&code, None).unwrap();
    let backend: Arc<dyn ResourceBackend> = Arc::new(MemoryBackend::new(schema()));
    let executor = Executor::new(code.clone(), backend, no_props(), callback).unwrap();
    executor.run().unwrap();

    let results = runtime().block_on(done.wait()).unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[code.checksum_of(check).unwrap()], RuntimeValue::bool(true));

    let assessment = assess_results(&code, &results).unwrap();
    assert!(assessment.success);
    assert_eq!(assessment.results[0].actual, Some(RuntimeValue::int(3)));
    assert_eq!(assessment.results[0].expected, Some(RuntimeValue::int(3)));
}

#[test]
fn filtering_an_empty_list_spawns_nothing() {
    let backend = Arc::new(MemoryBackend::new(schema()));
    users(&backend, &[]);

    let mut b = CodeBuilder::new();
    let all = b.resource("users", Vec::new()).unwrap();
    let list = b.field(all, "list", Type::array(Type::resource("user"))).unwrap();
    let named = b
        .filter(all, list, |b, params| {
            let name = b.field(params[0], "name", Type::String)?;
            b.op(name, "==", TypedValue::string("root"))
        })
        .unwrap();
    let count = b.method(named, "length", Vec::new()).unwrap();
    let check = b.op(count, "==", TypedValue::int(0)).unwrap();
    b.entrypoint(check).unwrap();
    let code = Arc::new(b.finish().unwrap());

    let (callback, mut receiver) = channel();
    let dyn_backend: Arc<dyn ResourceBackend> = backend.clone();
    let executor = Executor::new(code.clone(), dyn_backend, no_props(), callback).unwrap();
    executor.run().unwrap();

    let results = runtime().block_on(receiver.collect(1)).unwrap();
    assert_eq!(results[code.checksum_of(check).unwrap()], RuntimeValue::bool(true));
    // Only `users.list` is watched: no child block ever ran.
    assert_eq!(backend.watcher_count(), 1);
}

#[test]
fn pending_field_reports_exactly_once() {
    let backend = Arc::new(MemoryBackend::new(schema()));
    let handles = users(&backend, &[FieldState::Pending]);

    let mut b = CodeBuilder::new();
    let user = b.resource("user", vec![("id", TypedValue::string("u0"))]).unwrap();
    let name = b.field(user, "name", Type::String).unwrap();
    b.entrypoint(name).unwrap();
    let code = Arc::new(b.finish().unwrap());

    let (callback, mut receiver) = channel();
    let dyn_backend: Arc<dyn ResourceBackend> = backend.clone();
    let executor = Executor::new(code.clone(), dyn_backend, no_props(), callback).unwrap();
    executor.run().unwrap();
    assert!(receiver.try_next().is_none());

    backend.set_field(&handles[0], "name", FieldState::Ready(Data::String("root".into())));
    let first = receiver.try_next().unwrap();
    assert_eq!(first.code_id, code.checksum_of(name).unwrap());
    assert_eq!(first.data, RuntimeValue::string("root"));
    assert!(receiver.try_next().is_none());
}

#[test]
fn terminal_watch_error_fails_the_assessment() {
    let backend = Arc::new(MemoryBackend::new(schema()));
    users(
        &backend,
        &[FieldState::Failed(Error::Backend("permission denied".into()))],
    );

    let mut b = CodeBuilder::new();
    let user = b.resource("user", vec![("id", TypedValue::string("u0"))]).unwrap();
    let name = b.field(user, "name", Type::String).unwrap();
    let check = b.op(name, "!=", TypedValue::string("")).unwrap();
    b.entrypoint(check).unwrap();
    let code = Arc::new(b.finish().unwrap());

    let (forward, mut receiver) = channel();
    let (callback, done) = completion(&code, Some(forward)).unwrap();
    let dyn_backend: Arc<dyn ResourceBackend> = backend.clone();
    let executor = Executor::new(code.clone(), dyn_backend, no_props(), callback).unwrap();
    executor.run().unwrap();

    let results = runtime().block_on(done.wait()).unwrap();
    let value = &results[code.checksum_of(check).unwrap()];
    assert!(value.error.as_ref().unwrap().to_string().contains("permission denied"));
    assert!(receiver.try_next().is_some());
    assert!(receiver.try_next().is_none());

    let assessment = assess_results(&code, &results).unwrap();
    assert!(!assessment.success);
    let item = &assessment.results[0];
    assert!(!item.success);
    assert_eq!(item.operation.as_deref(), Some("!="));
    assert!(item.error.as_deref().unwrap().contains("permission denied"));
}

#[test]
fn failing_element_keeps_its_slot() {
    let backend = Arc::new(MemoryBackend::new(schema()));
    users(
        &backend,
        &[
            FieldState::Ready(Data::String("root".into())),
            FieldState::Failed(Error::Backend("unreadable".into())),
            FieldState::Ready(Data::String("bob".into())),
        ],
    );

    let mut b = CodeBuilder::new();
    let all = b.resource("users", Vec::new()).unwrap();
    let list = b.field(all, "list", Type::array(Type::resource("user"))).unwrap();
    let blocks = b
        .each(list, |b, params| {
            let name = b.field(params[0], "name", Type::String)?;
            let check = b.op(name, "!=", TypedValue::string(""))?;
            b.entrypoint(check)
        })
        .unwrap();
    b.entrypoint(blocks).unwrap();
    let code = Arc::new(b.finish().unwrap());

    let (callback, done) = completion(&code, None).unwrap();
    let dyn_backend: Arc<dyn ResourceBackend> = backend.clone();
    let executor = Executor::new(code.clone(), dyn_backend, no_props(), callback).unwrap();
    executor.run().unwrap();

    let results = runtime().block_on(done.wait()).unwrap();
    let value = &results[code.checksum_of(blocks).unwrap()];
    let items = value.data.as_array().unwrap();
    assert_eq!(items.len(), 3);
    let passed: Vec<bool> = items
        .iter()
        .map(|item| match item {
            Data::Block(values) => values.values().all(|value| value.error.is_none()),
            other => panic!("expected a block, got {other}"),
        })
        .collect();
    assert_eq!(passed, vec![true, false, true]);

    let err = value.error.as_ref().unwrap();
    let errors = err.errors();
    assert_eq!(errors.len(), 1);
    assert!(matches!(errors[0], Error::Element { index: 1, .. }));

    let assessment = assess_results(&code, &results).unwrap();
    assert!(!assessment.success);
}

#[test]
fn unregistered_executors_stay_silent() {
    let backend = Arc::new(MemoryBackend::new(schema()));
    let handles = users(&backend, &[FieldState::Pending]);

    let mut b = CodeBuilder::new();
    let user = b.resource("user", vec![("id", TypedValue::string("u0"))]).unwrap();
    let name = b.field(user, "name", Type::String).unwrap();
    b.entrypoint(name).unwrap();
    let code = Arc::new(b.finish().unwrap());

    let (callback, mut receiver) = channel();
    let dyn_backend: Arc<dyn ResourceBackend> = backend.clone();
    let executor = Executor::new(code, dyn_backend, no_props(), callback).unwrap();
    executor.run().unwrap();
    executor.unregister().unwrap();

    backend.set_field(&handles[0], "name", FieldState::Ready(Data::String("root".into())));
    assert!(receiver.try_next().is_none());
}

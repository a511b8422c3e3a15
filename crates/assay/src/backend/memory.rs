use std::sync::{Mutex, MutexGuard, PoisonError};

use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use super::{FieldCallback, ResourceArgs, ResourceBackend, Schema};
use crate::error::{Error, Result};
use crate::value::{Data, ResourceHandle};

/// Scripted state of one resource field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldState {
    Ready(Data),
    /// Watchers get `NotReady` now and the value once it is set.
    Pending,
    Failed(Error),
}

struct Watch {
    handle: ResourceHandle,
    field: String,
    callback: FieldCallback,
}

#[derive(Default)]
struct State {
    resources: FxHashMap<ResourceHandle, FxHashMap<String, FieldState>>,
    watches: FxHashMap<String, Watch>,
    unregistered: Vec<String>,
}

/// A backend whose resources and field values are set up by the caller.
///
/// Field updates pushed through [`MemoryBackend::set_field`] are delivered to
/// current watchers on the calling thread.
pub struct MemoryBackend {
    schema: Schema,
    state: Mutex<State>,
}

impl MemoryBackend {
    pub fn new(schema: Schema) -> Self {
        Self {
            schema,
            state: Mutex::new(State::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a resource instance with initial field states.
    pub fn add_resource<I, K>(&self, name: &str, id: &str, fields: I) -> ResourceHandle
    where
        I: IntoIterator<Item = (K, FieldState)>,
        K: Into<String>,
    {
        let handle = ResourceHandle::new(name, id);
        let mut state = self.state();
        let entry = state.resources.entry(handle.clone()).or_default();
        for (field, value) in fields {
            entry.insert(field.into(), value);
        }
        handle
    }

    /// Sets a field and pushes the new state to everyone watching it.
    pub fn set_field(&self, handle: &ResourceHandle, field: &str, value: FieldState) {
        let update = match &value {
            FieldState::Ready(data) => Some(Ok(data.clone())),
            FieldState::Failed(err) => Some(Err(err.clone())),
            FieldState::Pending => None,
        };
        let callbacks: Vec<FieldCallback> = {
            let mut state = self.state();
            state
                .resources
                .entry(handle.clone())
                .or_default()
                .insert(field.to_string(), value);
            state
                .watches
                .values()
                .filter(|watch| &watch.handle == handle && watch.field == field)
                .map(|watch| watch.callback.clone())
                .collect()
        };
        let Some(update) = update else {
            return;
        };
        trace!(resource = %handle.name, id = %handle.id, field, watchers = callbacks.len(), "memory> set field");
        for callback in callbacks {
            callback(update.clone());
        }
    }

    pub fn watcher_count(&self) -> usize {
        self.state().watches.len()
    }

    /// Watcher ids that were unregistered, in order.
    pub fn unregistered(&self) -> Vec<String> {
        self.state().unregistered.clone()
    }
}

fn id_from_args(args: &ResourceArgs) -> String {
    match args.get("id").map(|value| &value.data) {
        Some(Data::String(id)) => id.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

impl ResourceBackend for MemoryBackend {
    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn create_resource(&self, name: &str, args: &ResourceArgs) -> Result<ResourceHandle> {
        self.create_resource_with_id(name, &id_from_args(args), args)
    }

    fn create_resource_with_id(
        &self,
        name: &str,
        id: &str,
        args: &ResourceArgs,
    ) -> Result<ResourceHandle> {
        let handle = ResourceHandle::new(name, id);
        let mut state = self.state();
        if state.resources.contains_key(&handle) {
            return Ok(handle);
        }
        if self.schema.resource(name).is_none() {
            return Err(Error::Backend(format!("unknown resource '{name}'")));
        }
        debug!(resource = name, id, "memory> create resource");
        let fields = args
            .iter()
            .map(|(key, value)| (key.clone(), FieldState::Ready(value.data.clone())))
            .collect();
        state.resources.insert(handle.clone(), fields);
        Ok(handle)
    }

    fn watch_field(
        &self,
        handle: &ResourceHandle,
        field: &str,
        watcher_id: &str,
        on_update: FieldCallback,
    ) -> Result<()> {
        let current = {
            let mut state = self.state();
            let current = state
                .resources
                .get(handle)
                .and_then(|fields| fields.get(field))
                .cloned();
            let Some(current) = current else {
                return Err(Error::Backend(format!(
                    "field '{field}' is not available on {}",
                    handle.name
                )));
            };
            state.watches.insert(
                watcher_id.to_string(),
                Watch {
                    handle: handle.clone(),
                    field: field.to_string(),
                    callback: on_update.clone(),
                },
            );
            current
        };
        match current {
            FieldState::Ready(data) => {
                on_update(Ok(data));
                Ok(())
            }
            FieldState::Pending => Err(Error::NotReady(format!("{}.{field}", handle.name))),
            FieldState::Failed(err) => Err(err),
        }
    }

    fn unregister(&self, watcher_id: &str) -> Result<()> {
        let mut state = self.state();
        state.watches.remove(watcher_id);
        state.unregistered.push(watcher_id.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::types::Type;

    fn backend() -> MemoryBackend {
        MemoryBackend::new(Schema::default().with_field("user", "name", Type::String))
    }

    fn recorder() -> (FieldCallback, Arc<Mutex<Vec<Result<Data>>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let callback: FieldCallback = Arc::new(move |update| sink.lock().unwrap().push(update));
        (callback, seen)
    }

    #[test]
    fn ready_fields_deliver_immediately() {
        let backend = backend();
        let handle = backend.add_resource(
            "user",
            "root",
            [("name", FieldState::Ready(Data::String("root".into())))],
        );
        let (callback, seen) = recorder();
        backend.watch_field(&handle, "name", "w1", callback).unwrap();
        assert_eq!(
            seen.lock().unwrap().as_slice(),
            &[Ok(Data::String("root".into()))]
        );
    }

    #[test]
    fn pending_fields_deliver_on_set() {
        let backend = backend();
        let handle = backend.add_resource("user", "root", [("name", FieldState::Pending)]);
        let (callback, seen) = recorder();
        let err = backend
            .watch_field(&handle, "name", "w1", callback)
            .unwrap_err();
        assert!(err.is_not_ready());
        assert!(seen.lock().unwrap().is_empty());

        backend.set_field(&handle, "name", FieldState::Ready(Data::String("x".into())));
        assert_eq!(seen.lock().unwrap().len(), 1);

        backend.unregister("w1").unwrap();
        backend.set_field(&handle, "name", FieldState::Ready(Data::String("y".into())));
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(backend.unregistered(), vec!["w1".to_string()]);
    }

    #[test]
    fn create_resource_uses_id_arg_and_schema() {
        let backend = backend();
        let mut args = ResourceArgs::new();
        args.insert("id".into(), crate::value::RuntimeValue::string("alice"));
        let handle = backend.create_resource("user", &args).unwrap();
        assert_eq!(handle, ResourceHandle::new("user", "alice"));
        assert!(backend.create_resource("group", &ResourceArgs::new()).is_err());
    }

    #[test]
    fn unknown_fields_are_backend_errors() {
        let backend = backend();
        let handle = backend.add_resource("user", "root", Vec::<(String, FieldState)>::new());
        let (callback, _) = recorder();
        let err = backend
            .watch_field(&handle, "shell", "w", callback)
            .unwrap_err();
        assert!(matches!(err, Error::Backend(_)));
    }
}

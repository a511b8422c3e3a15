use std::sync::Mutex;

use rustc_hash::FxHashMap;

use super::lock;
use crate::code::Ref;

/// Dependency edges: for each ref, the refs waiting on its value.
#[derive(Default)]
pub(crate) struct Calls {
    edges: Mutex<FxHashMap<Ref, Vec<Ref>>>,
}

impl Calls {
    /// Records that `dependent` waits on `source`. Returns true if the edge
    /// was already known.
    pub(crate) fn store(&self, source: Ref, dependent: Ref) -> bool {
        let mut edges = lock(&self.edges);
        let waiting = edges.entry(source).or_default();
        if waiting.contains(&dependent) {
            return true;
        }
        waiting.push(dependent);
        false
    }

    /// Dependents of `source` in registration order.
    pub(crate) fn load(&self, source: Ref) -> Vec<Ref> {
        lock(&self.edges).get(&source).cloned().unwrap_or_default()
    }
}

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::callable::Callable;
use crate::ids::FunctionId;

/// Identity of a callable: the address of its shared allocation.
///
/// The registry holds a clone of every registered `Arc`, so an address can't
/// be reused while its entry exists.
fn identity(callable: &Arc<dyn Callable>) -> usize {
    Arc::as_ptr(callable) as *const () as usize
}

#[derive(Default)]
struct Entries {
    by_id: HashMap<FunctionId, Arc<dyn Callable>>,
    by_callable: HashMap<usize, FunctionId>,
}

/// Bidirectional map between published callables and their function ids
#[derive(Default)]
pub struct Registry {
    entries: RwLock<Entries>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callable`, returning its existing id if already published
    pub fn publish(&self, callable: &Arc<dyn Callable>) -> FunctionId {
        let key = identity(callable);
        let mut entries = self.entries.write();
        if let Some(id) = entries.by_callable.get(&key) {
            return *id;
        }

        let id = FunctionId::new();
        entries.by_id.insert(id, callable.clone());
        entries.by_callable.insert(key, id);
        id
    }

    /// Register `callable` under a reserved id
    pub fn reserve(&self, id: FunctionId, callable: Arc<dyn Callable>) {
        debug_assert!(id.is_reserved());
        let mut entries = self.entries.write();
        entries.by_callable.insert(identity(&callable), id);
        entries.by_id.insert(id, callable);
    }

    pub fn get(&self, id: &FunctionId) -> Option<Arc<dyn Callable>> {
        self.entries.read().by_id.get(id).cloned()
    }

    pub fn id_of(&self, callable: &Arc<dyn Callable>) -> Option<FunctionId> {
        self.entries
            .read()
            .by_callable
            .get(&identity(callable))
            .copied()
    }

    /// Remove a published function; reserved functions stay registered
    pub fn unpublish(&self, id: &FunctionId) -> bool {
        if id.is_reserved() {
            return false;
        }
        let mut entries = self.entries.write();
        match entries.by_id.remove(id) {
            Some(callable) => {
                entries.by_callable.remove(&identity(&callable));
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

use drudge_core::WorkerDescriptor;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Registry of worker descriptors by queue name
pub struct WorkerRegistry {
    workers: RwLock<HashMap<String, Arc<WorkerDescriptor>>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        WorkerRegistry {
            workers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a worker; a later registration for the same queue replaces it
    pub fn register(&self, descriptor: WorkerDescriptor) {
        let mut workers = self.workers.write();
        workers.insert(descriptor.queue_name().to_string(), Arc::new(descriptor));
    }

    /// Get the worker for a queue
    pub fn get(&self, queue: &str) -> Option<Arc<WorkerDescriptor>> {
        let workers = self.workers.read();
        workers.get(queue).cloned()
    }

    /// Check if a worker is registered for a queue
    pub fn contains(&self, queue: &str) -> bool {
        let workers = self.workers.read();
        workers.contains_key(queue)
    }

    /// All registered queue names, sorted
    pub fn queue_names(&self) -> Vec<String> {
        let workers = self.workers.read();
        let mut names: Vec<_> = workers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.workers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for WorkerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

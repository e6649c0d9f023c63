use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

/// Per-program key-value storage handed to the probe executor, so probes can
/// accumulate state across firings (`$req.count` style counters). Opaque to
/// the engine.
pub trait ProbeStore: Send + Sync {
    fn get(&self, key: &str) -> Option<serde_json::Value>;
    fn set(&self, key: &str, value: serde_json::Value);
}

pub trait StoreProvider: Send + Sync {
    fn for_program(&self, program_id: &str) -> Arc<dyn ProbeStore>;
}

/// In-process store provider; one map per program id.
#[derive(Default)]
pub struct MemoryStores {
    programs: Mutex<HashMap<String, Arc<MemoryStore>>>,
}

#[derive(Default)]
struct MemoryStore {
    values: Mutex<HashMap<String, serde_json::Value>>,
}

impl ProbeStore for MemoryStore {
    fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.values.lock().get(key).cloned()
    }

    fn set(&self, key: &str, value: serde_json::Value) {
        self.values.lock().insert(key.to_owned(), value);
    }
}

impl StoreProvider for MemoryStores {
    fn for_program(&self, program_id: &str) -> Arc<dyn ProbeStore> {
        self.programs
            .lock()
            .entry(program_id.to_owned())
            .or_default()
            .clone()
    }
}

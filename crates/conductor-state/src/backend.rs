use async_trait::async_trait;
use conductor_core::ConductorResult;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Key/value persistence boundary of the state store.
///
/// Values are JSON documents. A key set with a TTL disappears once it
/// expires; reads of an expired key return `None`.
#[async_trait]
pub trait StateBackend: Send + Sync {
    async fn get(&self, key: &str) -> ConductorResult<Option<serde_json::Value>>;
    async fn set(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl: Option<Duration>,
    ) -> ConductorResult<()>;
    async fn delete(&self, key: &str) -> ConductorResult<()>;
    /// Live keys starting with `prefix`, sorted.
    async fn keys(&self, prefix: &str) -> ConductorResult<Vec<String>>;
    fn name(&self) -> &str;
}

struct Entry {
    value: serde_json::Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-process backend. Contents are lost with the process.
#[derive(Default)]
pub struct MemoryBackend {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.lock().values().filter(|e| !e.is_expired(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl StateBackend for MemoryBackend {
    async fn get(&self, key: &str) -> ConductorResult<Option<serde_json::Value>> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.is_expired(Instant::now()) => {
                entries.remove(key);
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.value.clone())),
            None => Ok(None),
        }
    }

    async fn set(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl: Option<Duration>,
    ) -> ConductorResult<()> {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.entries
            .lock()
            .insert(key.to_string(), Entry { value, expires_at });
        Ok(())
    }

    async fn delete(&self, key: &str) -> ConductorResult<()> {
        self.entries.lock().remove(key);
        Ok(())
    }

    async fn keys(&self, prefix: &str) -> ConductorResult<Vec<String>> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        entries.retain(|_, e| !e.is_expired(now));
        let mut keys: Vec<String> = entries
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    fn name(&self) -> &str {
        "memory"
    }
}

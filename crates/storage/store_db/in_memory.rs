use std::{
    collections::BTreeMap,
    fmt::Debug,
    sync::{Arc, Mutex, MutexGuard},
};

use crate::api::{StoreEngine, WriteBatch};
use crate::error::StoreError;

/// Volatile engine; everything is lost on restart. The kernel's transactional
/// invariants still hold within a run, which is what tests exercise.
#[derive(Default, Clone)]
pub struct InMemoryStore(Arc<Mutex<BTreeMap<String, Vec<u8>>>>);

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> Result<MutexGuard<'_, BTreeMap<String, Vec<u8>>>, StoreError> {
        self.0.lock().map_err(|_| StoreError::LockPoisoned)
    }
}

#[async_trait::async_trait]
impl StoreEngine for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.inner()?.get(key).cloned())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        let inner = self.inner()?;
        Ok(inner
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    async fn commit(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut inner = self.inner()?;
        for (key, value) in batch.sets {
            inner.insert(key, value);
        }
        for key in batch.deletes {
            inner.remove(&key);
        }
        Ok(())
    }
}

impl Debug for InMemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryStore").finish()
    }
}

use std::fmt::Debug;

use crate::error::StoreError;

/// An atomically-applied set of mutations. Sets are applied before deletes;
/// a key in both ends up deleted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    pub sets: Vec<(String, Vec<u8>)>,
    pub deletes: Vec<String>,
}

impl WriteBatch {
    pub fn new() -> Self {
        WriteBatch::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: Vec<u8>) {
        self.sets.push((key.into(), value));
    }

    pub fn delete(&mut self, key: impl Into<String>) {
        self.deletes.push(key.into());
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty() && self.deletes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.sets.len() + self.deletes.len()
    }
}

// We need async_trait because the stabilized feature lacks support for object
// safety (i.e. dyn StoreEngine)
#[async_trait::async_trait]
pub trait StoreEngine: Debug + Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// All entries whose key starts with `prefix`, in ascending key order.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError>;

    /// Applies the whole batch atomically: either every mutation is visible
    /// after this returns, or none is.
    async fn commit(&self, batch: WriteBatch) -> Result<(), StoreError>;
}

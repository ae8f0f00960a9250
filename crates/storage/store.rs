use std::collections::BTreeMap;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use ocapd_common::message::RunQueueItem;
use ocapd_common::refs::{ERef, EndpointId, KRef};
use ocapd_common::state::{
    ClistEntry, EndpointRecord, KernelObject, KernelPromise, SubclusterRecord,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{info, warn};

use crate::api::{StoreEngine, WriteBatch};
use crate::error::StoreError;
use crate::keys;
use crate::store_db::in_memory::InMemoryStore;
#[cfg(feature = "sql")]
use crate::store_db::sql::SqlStore;

/// How many times a failed commit is retried before the cycle is abandoned.
pub const COMMIT_RETRIES: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineType {
    InMemory,
    #[cfg(feature = "sql")]
    Sql,
}

/// Typed façade over a [`StoreEngine`]. All kernel reads and the per-cycle
/// commit go through here.
#[derive(Debug, Clone)]
pub struct Store {
    engine: Arc<dyn StoreEngine>,
}

impl Default for Store {
    fn default() -> Self {
        Store {
            engine: Arc::new(InMemoryStore::new()),
        }
    }
}

impl Store {
    pub fn new(_path: &Path, engine_type: EngineType) -> Result<Self, StoreError> {
        info!("Starting kernel store engine ({engine_type:?})");
        let store = match engine_type {
            EngineType::InMemory => Store::default(),
            #[cfg(feature = "sql")]
            EngineType::Sql => Store {
                engine: Arc::new(SqlStore::new(_path)?),
            },
        };
        Ok(store)
    }

    pub fn in_memory() -> Self {
        Store::default()
    }

    pub fn with_engine(engine: Arc<dyn StoreEngine>) -> Self {
        Store { engine }
    }

    pub async fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.engine.get(key).await
    }

    pub async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        self.engine.scan_prefix(prefix).await
    }

    async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        match self.engine.get(key).await? {
            None => Ok(None),
            Some(bytes) => Ok(Some(decode_json(key, &bytes)?)),
        }
    }

    pub async fn commit(&self, batch: WriteBatch) -> Result<(), StoreError> {
        self.engine.commit(batch).await
    }

    /// Commits with retries: up to [`COMMIT_RETRIES`] attempts, returning
    /// the last error if none succeeds.
    pub async fn commit_with_retry(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut last_error = None;
        for attempt in 1..=COMMIT_RETRIES {
            match self.engine.commit(batch.clone()).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    warn!("Store commit attempt {attempt}/{COMMIT_RETRIES} failed: {err}");
                    last_error = Some(err);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| StoreError::Custom("commit failed".to_string())))
    }

    // Object and promise tables.

    pub async fn get_object(&self, index: u64) -> Result<Option<KernelObject>, StoreError> {
        self.get_json(&keys::object(index)).await
    }

    pub async fn get_promise(&self, index: u64) -> Result<Option<KernelPromise>, StoreError> {
        self.get_json(&keys::promise(index)).await
    }

    pub async fn load_objects(&self) -> Result<BTreeMap<u64, KernelObject>, StoreError> {
        let mut objects = BTreeMap::new();
        for (key, bytes) in self.engine.scan_prefix(keys::OBJECT_PREFIX).await? {
            let index = keys::index_from_key(&key, keys::OBJECT_PREFIX)?;
            objects.insert(index, decode_json(&key, &bytes)?);
        }
        Ok(objects)
    }

    pub async fn load_promises(&self) -> Result<BTreeMap<u64, KernelPromise>, StoreError> {
        let mut promises = BTreeMap::new();
        for (key, bytes) in self.engine.scan_prefix(keys::PROMISE_PREFIX).await? {
            let index = keys::index_from_key(&key, keys::PROMISE_PREFIX)?;
            promises.insert(index, decode_json(&key, &bytes)?);
        }
        Ok(promises)
    }

    // C-lists.

    pub async fn get_clist_entry(
        &self,
        endpoint: EndpointId,
        kref: KRef,
    ) -> Result<Option<ClistEntry>, StoreError> {
        self.get_json(&keys::clist_k2e(endpoint, kref)).await
    }

    pub async fn lookup_eref(
        &self,
        endpoint: EndpointId,
        eref: ERef,
    ) -> Result<Option<KRef>, StoreError> {
        match self.engine.get(&keys::clist_e2k(endpoint, eref)).await? {
            None => Ok(None),
            Some(bytes) => {
                let text = String::from_utf8(bytes).map_err(|e| StoreError::Decode {
                    key: keys::clist_e2k(endpoint, eref),
                    reason: e.to_string(),
                })?;
                Ok(Some(text.parse()?))
            }
        }
    }

    /// The endpoint's full c-list, from the k2e direction.
    pub async fn load_clist(
        &self,
        endpoint: EndpointId,
    ) -> Result<Vec<(KRef, ClistEntry)>, StoreError> {
        let prefix = keys::clist_k2e_prefix(endpoint);
        let mut entries = Vec::new();
        for (key, bytes) in self.engine.scan_prefix(&prefix).await? {
            let kref: KRef = keys::suffix_from_key(&key, &prefix)?.parse()?;
            entries.push((kref, decode_json(&key, &bytes)?));
        }
        Ok(entries)
    }

    // Run queue.

    pub async fn load_queue_cursors(&self) -> Result<Option<(u64, u64)>, StoreError> {
        let head = self.get_counter_at(keys::QUEUE_HEAD).await?;
        let tail = self.get_counter_at(keys::QUEUE_TAIL).await?;
        match (head, tail) {
            (Some(head), Some(tail)) => Ok(Some((head, tail))),
            (None, None) => Ok(None),
            _ => Err(StoreError::Custom(
                "queue cursors are only partially present".to_string(),
            )),
        }
    }

    pub async fn load_queue_items(&self) -> Result<Vec<(u64, RunQueueItem)>, StoreError> {
        let mut items = Vec::new();
        for (key, bytes) in self.engine.scan_prefix(keys::QUEUE_RUN_PREFIX).await? {
            let seq = keys::index_from_key(&key, keys::QUEUE_RUN_PREFIX)?;
            items.push((seq, decode_json(&key, &bytes)?));
        }
        Ok(items)
    }

    // Counters.

    pub async fn get_counter(&self, name: &str) -> Result<Option<u64>, StoreError> {
        self.get_counter_at(&keys::counter(name)).await
    }

    async fn get_counter_at(&self, key: &str) -> Result<Option<u64>, StoreError> {
        match self.engine.get(key).await? {
            None => Ok(None),
            Some(bytes) => {
                let text = String::from_utf8(bytes).map_err(|e| StoreError::Decode {
                    key: key.to_string(),
                    reason: e.to_string(),
                })?;
                text.parse::<u64>().map(Some).map_err(|e| StoreError::Decode {
                    key: key.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }

    // Endpoints and subclusters.

    pub async fn get_endpoint(&self, id: EndpointId) -> Result<Option<EndpointRecord>, StoreError> {
        self.get_json(&keys::endpoint(id)).await
    }

    pub async fn load_endpoints(&self) -> Result<Vec<EndpointRecord>, StoreError> {
        let mut endpoints = Vec::new();
        for (key, bytes) in self.engine.scan_prefix(keys::ENDPOINT_PREFIX).await? {
            endpoints.push(decode_json::<EndpointRecord>(&key, &bytes)?);
        }
        Ok(endpoints)
    }

    pub async fn load_subclusters(&self) -> Result<Vec<SubclusterRecord>, StoreError> {
        let mut subclusters = Vec::new();
        for (key, bytes) in self.engine.scan_prefix(keys::SUBCLUSTER_PREFIX).await? {
            subclusters.push(decode_json::<SubclusterRecord>(&key, &bytes)?);
        }
        Ok(subclusters)
    }

    // Vat kv partitions.

    pub async fn vatstore_get(
        &self,
        vat: EndpointId,
        key: &str,
    ) -> Result<Option<String>, StoreError> {
        let full = keys::vatstore(vat, key);
        match self.engine.get(&full).await? {
            None => Ok(None),
            Some(bytes) => String::from_utf8(bytes).map(Some).map_err(|e| {
                StoreError::Decode {
                    key: full,
                    reason: e.to_string(),
                }
            }),
        }
    }

    /// The next key in the vat's partition strictly after `prior_key`, with
    /// the partition prefix stripped.
    pub async fn vatstore_get_next_key(
        &self,
        vat: EndpointId,
        prior_key: &str,
    ) -> Result<Option<String>, StoreError> {
        let prefix = keys::vatstore_prefix(vat);
        let after = keys::vatstore(vat, prior_key);
        for (key, _) in self.engine.scan_prefix(&prefix).await? {
            if key > after {
                return Ok(Some(
                    keys::suffix_from_key(&key, &prefix)?.to_string(),
                ));
            }
        }
        Ok(None)
    }

    /// Removes every key in the store. Used by `clearState`.
    pub async fn clear(&self) -> Result<(), StoreError> {
        let mut batch = WriteBatch::new();
        for (key, _) in self.engine.scan_prefix("").await? {
            batch.delete(key);
        }
        self.engine.commit(batch).await
    }
}

fn decode_json<T: DeserializeOwned>(key: &str, bytes: &[u8]) -> Result<T, StoreError> {
    serde_json::from_slice(bytes).map_err(|e| StoreError::Decode {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

fn encode_json<T: Serialize>(key: &str, value: &T) -> Result<Vec<u8>, StoreError> {
    serde_json::to_vec(value).map_err(|e| StoreError::Encode {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

/// Per-cycle write buffer. All mutations a delivery cycle produces are
/// collected here and handed to [`Store::commit_with_retry`] as one batch;
/// the overlay gives the cycle read-your-writes over the engine. Writes are
/// last-write-wins per key, so a cycle that deletes a key and later rewrites
/// it (a popped queue slot reused by a splice) commits the rewrite.
#[derive(Debug, Default)]
pub struct KernelTx {
    overlay: HashMap<String, Option<Vec<u8>>>,
}

impl KernelTx {
    pub fn new() -> Self {
        KernelTx::default()
    }

    pub fn into_batch(self) -> WriteBatch {
        let mut entries: Vec<(String, Option<Vec<u8>>)> = self.overlay.into_iter().collect();
        entries.sort_by(|(a, _), (b, _)| a.cmp(b));
        let mut batch = WriteBatch::new();
        for (key, value) in entries {
            match value {
                Some(value) => batch.set(key, value),
                None => batch.delete(key),
            }
        }
        batch
    }

    pub fn is_empty(&self) -> bool {
        self.overlay.is_empty()
    }

    /// What this transaction would make of `key`: `None` means untouched,
    /// `Some(None)` means deleted.
    pub fn pending(&self, key: &str) -> Option<Option<&Vec<u8>>> {
        self.overlay.get(key).map(Option::as_ref)
    }

    pub fn is_pending_delete(&self, key: &str) -> bool {
        matches!(self.overlay.get(key), Some(None))
    }

    /// Keys this transaction sets (not deletes) under the given prefix.
    pub fn pending_set_keys(&self, prefix: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .overlay
            .iter()
            .filter(|(key, value)| key.starts_with(prefix) && value.is_some())
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    pub fn set_raw(&mut self, key: impl Into<String>, value: Vec<u8>) {
        self.overlay.insert(key.into(), Some(value));
    }

    pub fn set_string(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.set_raw(key, value.into().into_bytes());
    }

    pub fn set_json<T: Serialize>(
        &mut self,
        key: impl Into<String>,
        value: &T,
    ) -> Result<(), StoreError> {
        let key = key.into();
        let bytes = encode_json(&key, value)?;
        self.set_raw(key, bytes);
        Ok(())
    }

    pub fn delete(&mut self, key: impl Into<String>) {
        self.overlay.insert(key.into(), None);
    }

    // Typed setters over the kernel schema.

    pub fn put_object(&mut self, index: u64, object: &KernelObject) -> Result<(), StoreError> {
        self.set_json(keys::object(index), object)
    }

    pub fn delete_object(&mut self, index: u64) {
        self.delete(keys::object(index));
    }

    pub fn put_promise(&mut self, index: u64, promise: &KernelPromise) -> Result<(), StoreError> {
        self.set_json(keys::promise(index), promise)
    }

    pub fn delete_promise(&mut self, index: u64) {
        self.delete(keys::promise(index));
    }

    pub fn put_clist(
        &mut self,
        endpoint: EndpointId,
        kref: KRef,
        entry: &ClistEntry,
    ) -> Result<(), StoreError> {
        self.set_string(keys::clist_e2k(endpoint, entry.eref), kref.to_string());
        self.set_json(keys::clist_k2e(endpoint, kref), entry)
    }

    pub fn delete_clist(&mut self, endpoint: EndpointId, kref: KRef, eref: ERef) {
        self.delete(keys::clist_e2k(endpoint, eref));
        self.delete(keys::clist_k2e(endpoint, kref));
    }

    pub fn put_queue_item(&mut self, seq: u64, item: &RunQueueItem) -> Result<(), StoreError> {
        self.set_json(keys::queue_item(seq), item)
    }

    pub fn delete_queue_item(&mut self, seq: u64) {
        self.delete(keys::queue_item(seq));
    }

    pub fn set_queue_cursors(&mut self, head: u64, tail: u64) {
        self.set_string(keys::QUEUE_HEAD, head.to_string());
        self.set_string(keys::QUEUE_TAIL, tail.to_string());
    }

    pub fn set_counter(&mut self, name: &str, value: u64) {
        self.set_string(keys::counter(name), value.to_string());
    }

    pub fn put_endpoint(&mut self, record: &EndpointRecord) -> Result<(), StoreError> {
        self.set_json(keys::endpoint(record.id), record)
    }

    pub fn delete_endpoint(&mut self, id: EndpointId) {
        self.delete(keys::endpoint(id));
    }

    pub fn put_subcluster(&mut self, record: &SubclusterRecord) -> Result<(), StoreError> {
        self.set_json(keys::subcluster(&record.id), record)
    }

    pub fn delete_subcluster(&mut self, id: &str) {
        self.delete(keys::subcluster(id));
    }

    pub fn vatstore_set(&mut self, vat: EndpointId, key: &str, value: &str) {
        self.set_string(keys::vatstore(vat, key), value);
    }

    pub fn vatstore_delete(&mut self, vat: EndpointId, key: &str) {
        self.delete(keys::vatstore(vat, key));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ocapd_common::refs::RefSpace;
    use ocapd_common::state::PromiseState;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn sample_object() -> KernelObject {
        KernelObject {
            owner: EndpointId::Vat(1),
            reachable_count: 2,
            recognizable_count: 3,
            revoked: false,
        }
    }

    #[tokio::test]
    async fn typed_records_round_trip() {
        let store = Store::in_memory();
        let mut tx = KernelTx::new();
        tx.put_object(1, &sample_object()).expect("encode");
        tx.put_promise(4, &KernelPromise::unresolved(Some(EndpointId::Vat(1))))
            .expect("encode");
        tx.put_clist(
            EndpointId::Vat(1),
            KRef::Object(1),
            &ClistEntry {
                eref: ERef::object_export(RefSpace::Vat, 0),
                reachable: false,
            },
        )
        .expect("encode");
        store.commit(tx.into_batch()).await.expect("commit");

        assert_eq!(store.get_object(1).await.expect("get"), Some(sample_object()));
        let promise = store.get_promise(4).await.expect("get").expect("present");
        assert_eq!(promise.state, PromiseState::Unresolved);
        assert_eq!(
            store
                .lookup_eref(EndpointId::Vat(1), ERef::object_export(RefSpace::Vat, 0))
                .await
                .expect("lookup"),
            Some(KRef::Object(1))
        );
        let clist = store.load_clist(EndpointId::Vat(1)).await.expect("load");
        assert_eq!(clist.len(), 1);
        assert_eq!(clist[0].0, KRef::Object(1));
        let entry = store
            .get_clist_entry(EndpointId::Vat(1), KRef::Object(1))
            .await
            .expect("get")
            .expect("present");
        assert_eq!(entry.eref, ERef::object_export(RefSpace::Vat, 0));
    }

    #[tokio::test]
    async fn queue_items_recover_in_order() {
        let store = Store::in_memory();
        let mut tx = KernelTx::new();
        let base = 1u64 << 32;
        for offset in 0..3u64 {
            tx.put_queue_item(
                base + offset,
                &RunQueueItem::BringOutYourDead {
                    endpoint: EndpointId::Vat(offset),
                },
            )
            .expect("encode");
        }
        tx.set_queue_cursors(base, base + 3);
        store.commit(tx.into_batch()).await.expect("commit");

        assert_eq!(
            store.load_queue_cursors().await.expect("cursors"),
            Some((base, base + 3))
        );
        let items = store.load_queue_items().await.expect("items");
        let seqs: Vec<u64> = items.iter().map(|(seq, _)| *seq).collect();
        assert_eq!(seqs, vec![base, base + 1, base + 2]);
    }

    #[tokio::test]
    async fn delete_then_rewrite_of_a_key_commits_the_rewrite() {
        let store = Store::in_memory();
        let mut seed = KernelTx::new();
        seed.put_queue_item(
            7,
            &RunQueueItem::BringOutYourDead {
                endpoint: EndpointId::Vat(1),
            },
        )
        .expect("encode");
        store.commit(seed.into_batch()).await.expect("commit");

        // One cycle pops the slot and a splice reuses the same sequence
        // number; the rewrite must survive the commit.
        let mut tx = KernelTx::new();
        tx.delete_queue_item(7);
        tx.put_queue_item(
            7,
            &RunQueueItem::BringOutYourDead {
                endpoint: EndpointId::Vat(2),
            },
        )
        .expect("encode");
        store.commit(tx.into_batch()).await.expect("commit");

        let items = store.load_queue_items().await.expect("items");
        assert_eq!(items.len(), 1);
        assert!(matches!(
            items[0].1,
            RunQueueItem::BringOutYourDead { endpoint } if endpoint == EndpointId::Vat(2)
        ));
    }

    #[tokio::test]
    async fn vatstore_is_namespace_isolated() {
        let store = Store::in_memory();
        let mut tx = KernelTx::new();
        tx.vatstore_set(EndpointId::Vat(1), "a", "1");
        tx.vatstore_set(EndpointId::Vat(1), "b", "2");
        tx.vatstore_set(EndpointId::Vat(2), "a", "other");
        store.commit(tx.into_batch()).await.expect("commit");

        assert_eq!(
            store
                .vatstore_get(EndpointId::Vat(1), "a")
                .await
                .expect("get"),
            Some("1".to_string())
        );
        assert_eq!(
            store
                .vatstore_get_next_key(EndpointId::Vat(1), "a")
                .await
                .expect("next"),
            Some("b".to_string())
        );
        assert_eq!(
            store
                .vatstore_get_next_key(EndpointId::Vat(1), "b")
                .await
                .expect("next"),
            None
        );
    }

    #[derive(Debug)]
    struct FlakyEngine {
        inner: InMemoryStore,
        failures_left: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl StoreEngine for FlakyEngine {
        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
            self.inner.get(key).await
        }

        async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
            self.inner.scan_prefix(prefix).await
        }

        async fn commit(&self, batch: WriteBatch) -> Result<(), StoreError> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(StoreError::Custom("injected commit failure".to_string()));
            }
            self.inner.commit(batch).await
        }
    }

    #[tokio::test]
    async fn commit_retries_until_success() {
        let store = Store::with_engine(Arc::new(FlakyEngine {
            inner: InMemoryStore::new(),
            failures_left: AtomicUsize::new(COMMIT_RETRIES - 1),
        }));
        let mut batch = WriteBatch::new();
        batch.set("kv.x", b"1".to_vec());
        store.commit_with_retry(batch).await.expect("commit");
        assert_eq!(store.get_raw("kv.x").await.expect("get"), Some(b"1".to_vec()));
    }

    #[tokio::test]
    async fn commit_gives_up_after_retries() {
        let store = Store::with_engine(Arc::new(FlakyEngine {
            inner: InMemoryStore::new(),
            failures_left: AtomicUsize::new(COMMIT_RETRIES),
        }));
        let mut batch = WriteBatch::new();
        batch.set("kv.x", b"1".to_vec());
        assert!(store.commit_with_retry(batch).await.is_err());
        assert_eq!(store.get_raw("kv.x").await.expect("get"), None);
    }
}

//! In-memory image of the kernel tables. The store holds the authoritative
//! bytes; this image is rebuilt from it at startup (and after a failed
//! commit) and every mutation is mirrored into the cycle's [`KernelTx`].

use std::collections::{BTreeMap, BTreeSet};

use ocapd_common::refs::{ERef, EndpointId, KRef};
use ocapd_common::state::{
    ClistEntry, EndpointRecord, KernelObject, KernelPromise, SubclusterRecord, VatRecord,
};
use ocapd_storage::{KernelTx, Store, StoreError, keys};

use crate::queue::RunQueue;

pub const COUNTER_OBJECT: &str = "object";
pub const COUNTER_PROMISE: &str = "promise";
pub const COUNTER_VAT: &str = "vat";
pub const COUNTER_SUBCLUSTER: &str = "subcluster";

fn pins_key() -> String {
    keys::kv("pins")
}

/// One endpoint's bidirectional translation table. The two maps are inverse
/// bijections; every mutation goes through [`Clist::insert`]/[`Clist::remove`]
/// to keep them in lockstep.
#[derive(Debug, Default)]
pub struct Clist {
    e2k: BTreeMap<ERef, KRef>,
    k2e: BTreeMap<KRef, ClistEntry>,
}

impl Clist {
    pub fn insert(&mut self, kref: KRef, entry: ClistEntry) {
        self.e2k.insert(entry.eref, kref);
        self.k2e.insert(kref, entry);
    }

    pub fn remove(&mut self, kref: KRef) -> Option<ClistEntry> {
        let entry = self.k2e.remove(&kref)?;
        self.e2k.remove(&entry.eref);
        Some(entry)
    }

    pub fn entry(&self, kref: KRef) -> Option<&ClistEntry> {
        self.k2e.get(&kref)
    }

    pub fn entry_mut(&mut self, kref: KRef) -> Option<&mut ClistEntry> {
        self.k2e.get_mut(&kref)
    }

    pub fn lookup_eref(&self, eref: ERef) -> Option<KRef> {
        self.e2k.get(&eref).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&KRef, &ClistEntry)> {
        self.k2e.iter()
    }
}

#[derive(Debug, Default)]
pub struct KernelData {
    pub objects: BTreeMap<u64, KernelObject>,
    pub promises: BTreeMap<u64, KernelPromise>,
    pub clists: BTreeMap<EndpointId, Clist>,
    pub endpoints: BTreeMap<EndpointId, EndpointRecord>,
    pub subclusters: BTreeMap<String, SubclusterRecord>,
    pub queue: RunQueue,
    /// Promises pinned by the external control surface; each pin holds one
    /// reference until the promise settles.
    pub pins: BTreeSet<KRef>,
    pub next_object_id: u64,
    pub next_promise_id: u64,
    pub next_vat_id: u64,
    pub next_subcluster_id: u64,
}

impl KernelData {
    pub fn new() -> Self {
        KernelData {
            next_object_id: 1,
            next_promise_id: 1,
            next_vat_id: 1,
            next_subcluster_id: 1,
            ..KernelData::default()
        }
    }

    /// Writes a fresh image's counters and cursors so the very first commit
    /// establishes the schema.
    pub fn write_initial(&self, tx: &mut KernelTx) {
        tx.set_counter(COUNTER_OBJECT, self.next_object_id);
        tx.set_counter(COUNTER_PROMISE, self.next_promise_id);
        tx.set_counter(COUNTER_VAT, self.next_vat_id);
        tx.set_counter(COUNTER_SUBCLUSTER, self.next_subcluster_id);
        tx.set_queue_cursors(self.queue.head(), self.queue.tail());
    }

    /// Reloads the entire image from the store. `None` means the store is
    /// fresh (no queue cursors committed yet).
    pub async fn load(store: &Store) -> Result<Option<KernelData>, StoreError> {
        let Some((head, tail)) = store.load_queue_cursors().await? else {
            return Ok(None);
        };
        let queue = RunQueue::from_parts(head, tail, store.load_queue_items().await?)?;

        let mut data = KernelData {
            objects: store.load_objects().await?,
            promises: store.load_promises().await?,
            queue,
            ..KernelData::default()
        };

        for record in store.load_endpoints().await? {
            let mut clist = Clist::default();
            for (kref, entry) in store.load_clist(record.id).await? {
                clist.insert(kref, entry);
            }
            data.clists.insert(record.id, clist);
            data.endpoints.insert(record.id, record);
        }

        for record in store.load_subclusters().await? {
            data.subclusters.insert(record.id.clone(), record);
        }

        data.next_object_id = store.get_counter(COUNTER_OBJECT).await?.unwrap_or(1);
        data.next_promise_id = store.get_counter(COUNTER_PROMISE).await?.unwrap_or(1);
        data.next_vat_id = store.get_counter(COUNTER_VAT).await?.unwrap_or(1);
        data.next_subcluster_id = store.get_counter(COUNTER_SUBCLUSTER).await?.unwrap_or(1);

        if let Some(bytes) = store.get_raw(&pins_key()).await? {
            let pins: Vec<KRef> =
                serde_json::from_slice(&bytes).map_err(|e| StoreError::Decode {
                    key: pins_key(),
                    reason: e.to_string(),
                })?;
            data.pins = pins.into_iter().collect();
        }

        Ok(Some(data))
    }

    pub fn persist_pins(&self, tx: &mut KernelTx) -> Result<(), StoreError> {
        let pins: Vec<KRef> = self.pins.iter().copied().collect();
        tx.set_json(pins_key(), &pins)
    }

    pub fn vat_record(&self, vat: EndpointId) -> Option<&VatRecord> {
        self.endpoints.get(&vat).and_then(|e| e.vat.as_ref())
    }

    pub fn vat_record_mut(&mut self, vat: EndpointId) -> Option<&mut VatRecord> {
        self.endpoints.get_mut(&vat).and_then(|e| e.vat.as_mut())
    }

    pub fn clist(&self, endpoint: EndpointId) -> Option<&Clist> {
        self.clists.get(&endpoint)
    }

    pub fn clist_mut(&mut self, endpoint: EndpointId) -> &mut Clist {
        self.clists.entry(endpoint).or_default()
    }
}

//! The kernel key schema. Every piece of kernel state maps onto one of
//! these key families:
//!
//! ```text
//! kv.<k>                         free-form kernel kv
//! ko.<n>                         kernel object record
//! kp.<n>                         kernel promise record
//! clist.<endpoint>.e2k.<eref>    endpoint-ref to kernel-ref mapping
//! clist.<endpoint>.k2e.<kref>    kernel-ref to endpoint-ref entry
//! queue.run.<seq>                run-queue item (zero-padded seq)
//! queue.head / queue.tail        run-queue cursors
//! counter.<name>                 monotonic allocation counters
//! endpoint.<id>                  endpoint record (counters + vat record)
//! subcluster.<id>                subcluster record
//! vatstore.<vat>.<key>           per-vat kv partition
//! ```

use ocapd_common::refs::{ERef, EndpointId, KRef};

use crate::error::StoreError;

pub const QUEUE_HEAD: &str = "queue.head";
pub const QUEUE_TAIL: &str = "queue.tail";

pub const OBJECT_PREFIX: &str = "ko.";
pub const PROMISE_PREFIX: &str = "kp.";
pub const QUEUE_RUN_PREFIX: &str = "queue.run.";
pub const ENDPOINT_PREFIX: &str = "endpoint.";
pub const SUBCLUSTER_PREFIX: &str = "subcluster.";
pub const COUNTER_PREFIX: &str = "counter.";

pub fn kv(key: &str) -> String {
    format!("kv.{key}")
}

pub fn object(index: u64) -> String {
    format!("{OBJECT_PREFIX}{index}")
}

pub fn promise(index: u64) -> String {
    format!("{PROMISE_PREFIX}{index}")
}

pub fn kref_record(kref: KRef) -> String {
    match kref {
        KRef::Object(n) => object(n),
        KRef::Promise(n) => promise(n),
    }
}

pub fn clist_e2k(endpoint: EndpointId, eref: ERef) -> String {
    format!("clist.{endpoint}.e2k.{eref}")
}

pub fn clist_k2e(endpoint: EndpointId, kref: KRef) -> String {
    format!("clist.{endpoint}.k2e.{kref}")
}

pub fn clist_prefix(endpoint: EndpointId) -> String {
    format!("clist.{endpoint}.")
}

pub fn clist_k2e_prefix(endpoint: EndpointId) -> String {
    format!("clist.{endpoint}.k2e.")
}

/// Queue keys are zero-padded so a prefix scan yields items in seq order.
pub fn queue_item(seq: u64) -> String {
    format!("{QUEUE_RUN_PREFIX}{seq:020}")
}

pub fn counter(name: &str) -> String {
    format!("{COUNTER_PREFIX}{name}")
}

pub fn endpoint(id: EndpointId) -> String {
    format!("{ENDPOINT_PREFIX}{id}")
}

pub fn subcluster(id: &str) -> String {
    format!("{SUBCLUSTER_PREFIX}{id}")
}

pub fn vatstore(vat: EndpointId, key: &str) -> String {
    format!("vatstore.{vat}.{key}")
}

pub fn vatstore_prefix(vat: EndpointId) -> String {
    format!("vatstore.{vat}.")
}

/// Extracts `<n>` from a `ko.<n>` / `kp.<n>` style key.
pub fn index_from_key(key: &str, prefix: &str) -> Result<u64, StoreError> {
    key.strip_prefix(prefix)
        .and_then(|rest| rest.parse::<u64>().ok())
        .ok_or_else(|| StoreError::MalformedKey(key.to_string()))
}

/// Extracts the typed suffix (an eref, kref, or id) from a schema key.
pub fn suffix_from_key<'k>(key: &'k str, prefix: &str) -> Result<&'k str, StoreError> {
    key.strip_prefix(prefix)
        .ok_or_else(|| StoreError::MalformedKey(key.to_string()))
}

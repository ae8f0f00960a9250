//! Persisted kernel records: objects, promises, endpoints, vats, and
//! subclusters. These are the JSON shapes stored under the kernel key
//! schema and reloaded on startup.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::capdata::CapData;
use crate::message::Message;
use crate::refs::{ERef, EndpointId, KRef};
use crate::subcluster::{CreationOptions, SubclusterConfig};

/// A kernel object `ko<n>`. Reachable counts importers that hold a live
/// handle; recognizable counts importers that still remember the identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KernelObject {
    pub owner: EndpointId,
    pub reachable_count: u32,
    pub recognizable_count: u32,
    #[serde(default)]
    pub revoked: bool,
}

impl KernelObject {
    pub fn new(owner: EndpointId) -> Self {
        KernelObject {
            owner,
            reachable_count: 0,
            recognizable_count: 0,
            revoked: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PromiseState {
    Unresolved,
    Fulfilled,
    Rejected,
}

/// A kernel promise `kp<n>`. Messages sent while unresolved queue on the
/// promise itself; resolution splices them back into the run queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KernelPromise {
    pub decider: Option<EndpointId>,
    pub state: PromiseState,
    #[serde(default)]
    pub subscribers: BTreeSet<EndpointId>,
    #[serde(default)]
    pub queue: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<CapData>,
    pub ref_count: u32,
}

impl KernelPromise {
    pub fn unresolved(decider: Option<EndpointId>) -> Self {
        KernelPromise {
            decider,
            state: PromiseState::Unresolved,
            subscribers: BTreeSet::new(),
            queue: Vec::new(),
            value: None,
            ref_count: 0,
        }
    }

    pub fn is_settled(&self) -> bool {
        !matches!(self.state, PromiseState::Unresolved)
    }
}

/// One c-list entry, stored under `clist.<endpoint>.k2e.<kref>`. The
/// reachable flag is set only on import-direction entries that currently
/// contribute to the object's reachable count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClistEntry {
    pub eref: ERef,
    #[serde(default)]
    pub reachable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VatState {
    Active,
    Broken,
}

/// Kernel-side record of a live vat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VatRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subcluster_id: Option<String>,
    /// The vat's root object, pre-installed in its c-list as `vo+0`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root: Option<KRef>,
    pub bundle_spec: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub creation_options: Option<CreationOptions>,
    pub state: VatState,
    #[serde(default)]
    pub deliveries_since_boyd: u64,
}

/// Per-endpoint allocation counters plus the vat record when the endpoint is
/// a vat hosted by this kernel. C-list entries are persisted individually.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointRecord {
    pub id: EndpointId,
    pub next_export_object_id: u64,
    pub next_export_promise_id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vat: Option<VatRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubclusterRecord {
    pub id: String,
    pub bootstrap: String,
    pub vats: BTreeMap<String, EndpointId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root: Option<KRef>,
    pub config: SubclusterConfig,
}

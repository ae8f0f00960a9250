//! The kernel's message vocabulary: run-queue items, deliveries, syscalls,
//! and the delivery-result checkpoint. Kernel-space types carry `KRef`s;
//! everything inside a `DeliveryPayload` or `Syscall` is already in the
//! endpoint's own reference space and stays as plain strings.

use serde::{Deserialize, Serialize};

use crate::capdata::CapData;
use crate::refs::{EndpointId, KRef};

/// A message directed at a kernel object or promise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub methargs: CapData,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<KRef>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum GcActionKind {
    DropExports,
    RetireExports,
    RetireImports,
}

/// One unit of schedulable work, persisted in FIFO order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RunQueueItem {
    Send {
        target: KRef,
        message: Message,
    },
    Notify {
        endpoint: EndpointId,
        kpid: KRef,
    },
    GcAction {
        endpoint: EndpointId,
        kind: GcActionKind,
        krefs: Vec<KRef>,
    },
    BringOutYourDead {
        endpoint: EndpointId,
    },
    StartVat {
        vat_id: EndpointId,
    },
    TerminateVat {
        vat_id: EndpointId,
    },
}

/// One settled promise, in the receiving endpoint's reference space.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub kpid: String,
    pub rejected: bool,
    pub value: CapData,
}

/// Kernel-to-worker work item, in the worker's reference space.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DeliveryPayload {
    #[serde(rename_all = "camelCase")]
    StartVat {
        bundle_spec: String,
        parameters: CapData,
    },
    Message {
        target: String,
        methargs: CapData,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<String>,
    },
    Notify {
        resolutions: Vec<Resolution>,
    },
    DropExports {
        erefs: Vec<String>,
    },
    RetireExports {
        erefs: Vec<String>,
    },
    RetireImports {
        erefs: Vec<String>,
    },
    BringOutYourDead,
    StopVat,
}

/// Worker-to-kernel request, emitted during a delivery and applied in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Syscall {
    Send {
        target: String,
        methargs: CapData,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<String>,
    },
    Subscribe {
        kpid: String,
    },
    Resolve {
        resolutions: Vec<Resolution>,
    },
    Exit {
        failure: bool,
        info: CapData,
    },
    VatstoreGet {
        key: String,
    },
    VatstoreSet {
        key: String,
        value: String,
    },
    VatstoreDelete {
        key: String,
    },
    #[serde(rename_all = "camelCase")]
    VatstoreGetNextKey {
        prior_key: String,
    },
    DropImports {
        erefs: Vec<String>,
    },
    RetireImports {
        erefs: Vec<String>,
    },
    RetireExports {
        erefs: Vec<String>,
    },
    AbandonExports {
        erefs: Vec<String>,
    },
}

/// The state the worker asks the kernel to persist for it, committed in the
/// same transaction as the rest of the delivery cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VatCheckpoint {
    pub kv_mutations: Vec<(String, String)>,
    pub kv_deletions: Vec<String>,
}

/// Worker's answer to one delivery.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryResult {
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub checkpoint: VatCheckpoint,
    #[serde(default)]
    pub syscalls: Vec<Syscall>,
}

impl DeliveryResult {
    pub fn ok() -> Self {
        DeliveryResult::default()
    }

    pub fn failed(error: impl Into<String>) -> Self {
        DeliveryResult {
            error: Some(error.into()),
            ..DeliveryResult::default()
        }
    }

    pub fn with_syscalls(syscalls: Vec<Syscall>) -> Self {
        DeliveryResult {
            syscalls,
            ..DeliveryResult::default()
        }
    }
}

//! The worker wire protocol. Two message variants in each direction, plus
//! the `ready`/`connected` handshake exchanged once per worker.

use ocapd_common::message::{DeliveryPayload, Syscall, VatCheckpoint};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum KernelToWorker {
    /// Handshake acknowledgment to the worker's `ready`.
    Connected,
    Delivery { id: u64, payload: DeliveryPayload },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum WorkerToKernel {
    /// First message after startup.
    Ready,
    /// A syscall streamed out while a delivery is in flight.
    Syscall { syscall: Syscall },
    DeliveryResult {
        id: u64,
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        checkpoint: VatCheckpoint,
        #[serde(default)]
        syscalls: Vec<Syscall>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wire_tags_match_the_protocol() {
        assert_eq!(
            serde_json::to_value(KernelToWorker::Connected).expect("encode"),
            json!({"type": "connected"})
        );
        let ready: WorkerToKernel = serde_json::from_value(json!({"type": "ready"})).expect("decode");
        assert_eq!(ready, WorkerToKernel::Ready);

        let result: WorkerToKernel = serde_json::from_value(json!({
            "type": "delivery-result",
            "id": 7,
            "error": null,
            "checkpoint": {"kvMutations": [["a", "1"]], "kvDeletions": []},
            "syscalls": [],
        }))
        .expect("decode");
        match result {
            WorkerToKernel::DeliveryResult {
                id,
                error,
                checkpoint,
                syscalls,
            } => {
                assert_eq!(id, 7);
                assert!(error.is_none());
                assert_eq!(checkpoint.kv_mutations, vec![("a".into(), "1".into())]);
                assert!(syscalls.is_empty());
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }
}

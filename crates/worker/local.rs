//! In-process workers: a channel-backed worker for vats hosted inside the
//! kernel process, and a scripted worker for tests that need deterministic
//! delivery results.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ocapd_common::message::{DeliveryPayload, DeliveryResult, Syscall};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::warn;

use crate::VatWorker;
use crate::error::WorkerError;
use crate::wire::{KernelToWorker, WorkerToKernel};

/// The vat side of a [`ChannelWorker`] pair. Whatever task owns this plays
/// the role of the worker: it must send `Ready`, answer deliveries, and may
/// stream syscalls.
#[derive(Debug)]
pub struct WorkerEndpoint {
    pub rx: mpsc::Receiver<KernelToWorker>,
    pub tx: mpsc::Sender<WorkerToKernel>,
}

/// A worker reached over bounded in-process channels; the channel capacity
/// is the transport's back-pressure bound.
#[derive(Debug)]
pub struct ChannelWorker {
    tx: mpsc::Sender<KernelToWorker>,
    rx: mpsc::Receiver<WorkerToKernel>,
}

pub fn channel_pair(buffer: usize) -> (ChannelWorker, WorkerEndpoint) {
    let (kernel_tx, worker_rx) = mpsc::channel(buffer);
    let (worker_tx, kernel_rx) = mpsc::channel(buffer);
    (
        ChannelWorker {
            tx: kernel_tx,
            rx: kernel_rx,
        },
        WorkerEndpoint {
            rx: worker_rx,
            tx: worker_tx,
        },
    )
}

impl ChannelWorker {
    /// Same initialization protocol as the stream transport.
    pub async fn connect(&mut self, handshake_timeout: Duration) -> Result<(), WorkerError> {
        let first = timeout(handshake_timeout, self.rx.recv())
            .await
            .map_err(|_| WorkerError::HandshakeTimeout)?;
        match first {
            Some(WorkerToKernel::Ready) => {}
            Some(other) => {
                return Err(WorkerError::Protocol(format!(
                    "expected ready, got {other:?}"
                )));
            }
            None => {
                return Err(WorkerError::StreamRead(
                    "worker closed the channel before ready".to_string(),
                ));
            }
        }
        self.tx
            .send(KernelToWorker::Connected)
            .await
            .map_err(|_| WorkerError::StreamRead("worker channel closed".to_string()))?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl VatWorker for ChannelWorker {
    async fn deliver(
        &mut self,
        id: u64,
        payload: DeliveryPayload,
    ) -> Result<DeliveryResult, WorkerError> {
        self.tx
            .send(KernelToWorker::Delivery { id, payload })
            .await
            .map_err(|_| WorkerError::StreamRead("worker channel closed".to_string()))?;

        let mut streamed: Vec<Syscall> = Vec::new();
        loop {
            match self.rx.recv().await {
                None => {
                    return Err(WorkerError::StreamRead(
                        "worker channel closed mid-delivery".to_string(),
                    ));
                }
                Some(WorkerToKernel::Syscall { syscall }) => streamed.push(syscall),
                Some(WorkerToKernel::DeliveryResult {
                    id: result_id,
                    error,
                    checkpoint,
                    syscalls,
                }) => {
                    if result_id != id {
                        return Err(WorkerError::Protocol(format!(
                            "delivery-result id {result_id} does not match pending delivery {id}"
                        )));
                    }
                    streamed.extend(syscalls);
                    return Ok(DeliveryResult {
                        error,
                        checkpoint,
                        syscalls: streamed,
                    });
                }
                Some(WorkerToKernel::Ready) => {
                    return Err(WorkerError::Protocol(
                        "worker repeated the ready handshake".to_string(),
                    ));
                }
            }
        }
    }

    async fn terminate(&mut self) {
        let stop = KernelToWorker::Delivery {
            id: 0,
            payload: DeliveryPayload::StopVat,
        };
        if self.tx.send(stop).await.is_err() {
            warn!("Worker channel already closed during teardown");
        }
        self.rx.close();
    }
}

/// Test worker that answers each delivery from a canned script (defaulting
/// to an empty success) and records everything it was handed.
#[derive(Debug, Default)]
pub struct ScriptedWorker {
    script: Mutex<VecDeque<DeliveryResult>>,
    log: Arc<Mutex<Vec<(u64, DeliveryPayload)>>>,
}

impl ScriptedWorker {
    pub fn new() -> Self {
        ScriptedWorker::default()
    }

    pub fn with_results(results: Vec<DeliveryResult>) -> Self {
        ScriptedWorker {
            script: Mutex::new(results.into()),
            log: Arc::default(),
        }
    }

    /// Queues the result for the next unanswered delivery.
    pub fn push_result(&self, result: DeliveryResult) {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(result);
        }
    }

    /// Shared view of the deliveries this worker has received.
    pub fn log_handle(&self) -> Arc<Mutex<Vec<(u64, DeliveryPayload)>>> {
        Arc::clone(&self.log)
    }
}

#[async_trait::async_trait]
impl VatWorker for ScriptedWorker {
    async fn deliver(
        &mut self,
        id: u64,
        payload: DeliveryPayload,
    ) -> Result<DeliveryResult, WorkerError> {
        if let Ok(mut log) = self.log.lock() {
            log.push((id, payload));
        }
        let scripted = self
            .script
            .lock()
            .ok()
            .and_then(|mut script| script.pop_front());
        Ok(scripted.unwrap_or_default())
    }

    async fn terminate(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn channel_worker_round_trip() {
        let (mut worker, mut endpoint) = channel_pair(8);

        let vat = tokio::spawn(async move {
            endpoint.tx.send(WorkerToKernel::Ready).await.expect("ready");
            assert_eq!(
                endpoint.rx.recv().await.expect("connected"),
                KernelToWorker::Connected
            );
            let KernelToWorker::Delivery { id, .. } =
                endpoint.rx.recv().await.expect("delivery")
            else {
                panic!("expected delivery");
            };
            endpoint
                .tx
                .send(WorkerToKernel::DeliveryResult {
                    id,
                    error: None,
                    checkpoint: Default::default(),
                    syscalls: vec![],
                })
                .await
                .expect("result");
        });

        worker.connect(Duration::from_secs(1)).await.expect("handshake");
        let result = worker
            .deliver(3, DeliveryPayload::BringOutYourDead)
            .await
            .expect("deliver");
        assert!(result.error.is_none());
        vat.await.expect("vat task");
    }

    #[tokio::test]
    async fn scripted_worker_pops_results_in_order() {
        let mut worker = ScriptedWorker::with_results(vec![
            DeliveryResult::failed("first"),
            DeliveryResult::ok(),
        ]);
        let log = worker.log_handle();

        let first = worker
            .deliver(1, DeliveryPayload::BringOutYourDead)
            .await
            .expect("deliver");
        assert_eq!(first.error.as_deref(), Some("first"));

        let second = worker
            .deliver(2, DeliveryPayload::StopVat)
            .await
            .expect("deliver");
        assert!(second.error.is_none());

        // Script exhausted: further deliveries succeed with empty results.
        let third = worker
            .deliver(3, DeliveryPayload::BringOutYourDead)
            .await
            .expect("deliver");
        assert_eq!(third, DeliveryResult::ok());

        assert_eq!(log.lock().expect("log").len(), 3);
    }
}

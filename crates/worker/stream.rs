//! Transport-generic delivery/syscall driver: anything that provides an
//! `AsyncRead`/`AsyncWrite` pair (a child's stdio, a socket, a duplex test
//! stream) becomes a vat worker.

use std::fmt;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use ocapd_common::message::{DeliveryPayload, DeliveryResult, Syscall};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, trace, warn};

use crate::VatWorker;
use crate::codec::JsonLineCodec;
use crate::error::WorkerError;
use crate::wire::{KernelToWorker, WorkerToKernel};

type Codec = JsonLineCodec<WorkerToKernel, KernelToWorker>;

pub struct StreamWorker<R, W> {
    reader: FramedRead<R, Codec>,
    writer: FramedWrite<W, Codec>,
}

impl<R, W> fmt::Debug for StreamWorker<R, W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamWorker").finish()
    }
}

impl<R, W> StreamWorker<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    /// Runs the initialization protocol: the worker opens with `ready`, the
    /// kernel acknowledges with `connected`. A worker that says anything
    /// else, or nothing within the timeout, never becomes a vat.
    pub async fn connect(
        reader: R,
        writer: W,
        handshake_timeout: Duration,
    ) -> Result<Self, WorkerError> {
        let mut worker = StreamWorker {
            reader: FramedRead::new(reader, Codec::new()),
            writer: FramedWrite::new(writer, Codec::new()),
        };
        let first = timeout(handshake_timeout, worker.reader.next())
            .await
            .map_err(|_| WorkerError::HandshakeTimeout)?;
        match first {
            Some(Ok(WorkerToKernel::Ready)) => {}
            Some(Ok(other)) => {
                return Err(WorkerError::Protocol(format!(
                    "expected ready, got {other:?}"
                )));
            }
            Some(Err(err)) => return Err(err),
            None => {
                return Err(WorkerError::StreamRead(
                    "worker closed the stream before ready".to_string(),
                ));
            }
        }
        worker.writer.send(KernelToWorker::Connected).await?;
        debug!("Worker handshake complete");
        Ok(worker)
    }
}

#[async_trait::async_trait]
impl<R, W> VatWorker for StreamWorker<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn deliver(
        &mut self,
        id: u64,
        payload: DeliveryPayload,
    ) -> Result<DeliveryResult, WorkerError> {
        self.writer
            .send(KernelToWorker::Delivery { id, payload })
            .await?;

        // Syscalls streamed during the delivery are buffered and prepended
        // to the batch the result carries; workers use one mechanism or the
        // other.
        let mut streamed: Vec<Syscall> = Vec::new();
        loop {
            match self.reader.next().await {
                None => {
                    return Err(WorkerError::StreamRead(
                        "worker closed the stream mid-delivery".to_string(),
                    ));
                }
                Some(Err(err)) => return Err(err),
                Some(Ok(WorkerToKernel::Syscall { syscall })) => {
                    trace!("Buffered streamed syscall");
                    streamed.push(syscall);
                }
                Some(Ok(WorkerToKernel::DeliveryResult {
                    id: result_id,
                    error,
                    checkpoint,
                    syscalls,
                })) => {
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
                Some(Ok(WorkerToKernel::Ready)) => {
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
        if let Err(err) = self.writer.send(stop).await {
            warn!("Failed to send stopVat during teardown: {err}");
        }
        let _ = self.writer.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ocapd_common::message::VatCheckpoint;
    use tokio::io::duplex;
    use tokio_util::codec::{FramedRead as TestRead, FramedWrite as TestWrite};

    type WorkerSideCodec = JsonLineCodec<KernelToWorker, WorkerToKernel>;

    #[tokio::test]
    async fn handshake_then_delivery_round_trip() {
        let (kernel_in, worker_out) = duplex(4096);
        let (worker_in, kernel_out) = duplex(4096);

        let worker_task = tokio::spawn(async move {
            let mut reader = TestRead::new(worker_in, WorkerSideCodec::new());
            let mut writer = TestWrite::new(worker_out, WorkerSideCodec::new());
            writer.send(WorkerToKernel::Ready).await.expect("ready");
            assert_eq!(
                reader.next().await.expect("frame").expect("decode"),
                KernelToWorker::Connected
            );
            let delivery = reader.next().await.expect("frame").expect("decode");
            let KernelToWorker::Delivery { id, .. } = delivery else {
                panic!("expected a delivery");
            };
            writer
                .send(WorkerToKernel::Syscall {
                    syscall: Syscall::VatstoreSet {
                        key: "a".into(),
                        value: "1".into(),
                    },
                })
                .await
                .expect("syscall");
            writer
                .send(WorkerToKernel::DeliveryResult {
                    id,
                    error: None,
                    checkpoint: VatCheckpoint::default(),
                    syscalls: vec![Syscall::Subscribe { kpid: "vp-1".into() }],
                })
                .await
                .expect("result");
        });

        let mut worker = StreamWorker::connect(kernel_in, kernel_out, Duration::from_secs(1))
            .await
            .expect("handshake");
        let result = worker
            .deliver(1, DeliveryPayload::BringOutYourDead)
            .await
            .expect("deliver");
        // Streamed syscalls come before the batch in the result.
        assert_eq!(
            result.syscalls,
            vec![
                Syscall::VatstoreSet {
                    key: "a".into(),
                    value: "1".into()
                },
                Syscall::Subscribe { kpid: "vp-1".into() },
            ]
        );
        worker_task.await.expect("worker task");
    }

    #[tokio::test]
    async fn silent_worker_times_out() {
        let (kernel_in, _worker_out) = duplex(64);
        let (_worker_in, kernel_out) = duplex(64);
        let result =
            StreamWorker::connect(kernel_in, kernel_out, Duration::from_millis(20)).await;
        assert!(matches!(result, Err(WorkerError::HandshakeTimeout)));
    }

    #[tokio::test]
    async fn disconnect_mid_delivery_is_a_stream_error() {
        let (kernel_in, worker_out) = duplex(4096);
        let (worker_in, kernel_out) = duplex(4096);

        tokio::spawn(async move {
            let mut reader = TestRead::new(worker_in, WorkerSideCodec::new());
            let mut writer = TestWrite::new(worker_out, WorkerSideCodec::new());
            writer.send(WorkerToKernel::Ready).await.expect("ready");
            let _ = reader.next().await;
            let _ = reader.next().await;
            // Drop both halves without answering the delivery.
        });

        let mut worker = StreamWorker::connect(kernel_in, kernel_out, Duration::from_secs(1))
            .await
            .expect("handshake");
        let result = worker.deliver(1, DeliveryPayload::BringOutYourDead).await;
        assert!(matches!(result, Err(WorkerError::StreamRead(_))));
    }

    #[tokio::test]
    async fn mismatched_result_id_is_a_protocol_error() {
        let (kernel_in, worker_out) = duplex(4096);
        let (worker_in, kernel_out) = duplex(4096);

        tokio::spawn(async move {
            let mut reader = TestRead::new(worker_in, WorkerSideCodec::new());
            let mut writer = TestWrite::new(worker_out, WorkerSideCodec::new());
            writer.send(WorkerToKernel::Ready).await.expect("ready");
            let _ = reader.next().await;
            let _ = reader.next().await;
            writer
                .send(WorkerToKernel::DeliveryResult {
                    id: 99,
                    error: None,
                    checkpoint: VatCheckpoint::default(),
                    syscalls: vec![],
                })
                .await
                .expect("result");
        });

        let mut worker = StreamWorker::connect(kernel_in, kernel_out, Duration::from_secs(1))
            .await
            .expect("handshake");
        let result = worker.deliver(1, DeliveryPayload::BringOutYourDead).await;
        assert!(matches!(result, Err(WorkerError::Protocol(_))));
    }
}

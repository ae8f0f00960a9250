//! Stream multiplexing: several logical worker channels over one duplex
//! stream. A remote peer hosting many vats needs only one connection; each
//! vat's delivery/syscall traffic rides its own channel id.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use ocapd_common::message::{DeliveryPayload, DeliveryResult, Syscall};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex, mpsc};
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, warn};

use crate::VatWorker;
use crate::codec::JsonLineCodec;
use crate::error::WorkerError;
use crate::wire::{KernelToWorker, WorkerToKernel};

/// One multiplexed frame: the channel id plus the ordinary wire message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MuxFrame {
    pub channel: u64,
    pub payload: serde_json::Value,
}

/// Registered channels plus a bounded park for frames that arrive before
/// their channel is opened. A peer may announce `ready` for a vat before the
/// kernel opens that channel; parking keeps the handshake from being lost to
/// the race.
#[derive(Debug, Default)]
struct ChannelTable {
    open: HashMap<u64, mpsc::Sender<WorkerToKernel>>,
    parked: HashMap<u64, VecDeque<WorkerToKernel>>,
}

type Channels = Arc<Mutex<ChannelTable>>;

/// The kernel side of a multiplexed worker connection. Owns the read and
/// write pumps; [`Multiplexer::open_worker`] yields one [`MuxWorker`] per
/// channel.
#[derive(Debug)]
pub struct Multiplexer {
    outbound: mpsc::Sender<MuxFrame>,
    channels: Channels,
    buffer: usize,
}

impl Multiplexer {
    /// Starts the demux/mux pumps over a duplex stream. `buffer` bounds
    /// every per-channel queue; a slow channel back-pressures its own vat
    /// without stalling the others until the shared outbound fills.
    pub fn new<R, W>(reader: R, writer: W, buffer: usize) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let channels: Channels = Arc::default();
        let (outbound, mut outbound_rx) = mpsc::channel::<MuxFrame>(buffer);

        let mut framed_writer =
            FramedWrite::new(writer, JsonLineCodec::<MuxFrame, MuxFrame>::new());
        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                if let Err(err) = framed_writer.send(frame).await {
                    warn!("Mux write pump stopped: {err}");
                    break;
                }
            }
        });

        let demux_channels = Arc::clone(&channels);
        let mut framed_reader = FramedRead::new(reader, JsonLineCodec::<MuxFrame, MuxFrame>::new());
        tokio::spawn(async move {
            loop {
                match framed_reader.next().await {
                    None => break,
                    Some(Err(err)) => {
                        warn!("Mux read pump stopped: {err}");
                        break;
                    }
                    Some(Ok(frame)) => {
                        let message: WorkerToKernel = match serde_json::from_value(frame.payload) {
                            Ok(message) => message,
                            Err(err) => {
                                warn!("Dropping malformed frame on channel {}: {err}", frame.channel);
                                continue;
                            }
                        };
                        let mut table = demux_channels.lock().await;
                        match table.open.get(&frame.channel) {
                            Some(sender) => {
                                let sender = sender.clone();
                                drop(table);
                                if sender.send(message).await.is_err() {
                                    debug!("Channel {} receiver is gone", frame.channel);
                                }
                            }
                            None => {
                                let parked = table.parked.entry(frame.channel).or_default();
                                if parked.len() < buffer {
                                    parked.push_back(message);
                                } else {
                                    warn!(
                                        "Dropping frame for unopened channel {}",
                                        frame.channel
                                    );
                                }
                            }
                        }
                    }
                }
            }
            // Stream gone: every channel sees EOF.
            let mut table = demux_channels.lock().await;
            table.open.clear();
            table.parked.clear();
        });

        Multiplexer {
            outbound,
            channels,
            buffer,
        }
    }

    /// Registers a channel (draining any frames parked for it) and runs the
    /// per-channel ready/connected handshake, yielding a worker the router
    /// can drive like any other.
    pub async fn open_worker(
        &self,
        channel: u64,
        handshake_timeout: Duration,
    ) -> Result<MuxWorker, WorkerError> {
        let (tx, rx) = mpsc::channel(self.buffer);
        {
            let mut table = self.channels.lock().await;
            if table.open.contains_key(&channel) {
                return Err(WorkerError::ChannelExists(channel));
            }
            if let Some(parked) = table.parked.remove(&channel) {
                // Parked count is bounded by the queue capacity.
                for message in parked {
                    let _ = tx.try_send(message);
                }
            }
            table.open.insert(channel, tx);
        }
        let mut worker = MuxWorker {
            channel,
            outbound: self.outbound.clone(),
            inbound: rx,
            channels: Arc::clone(&self.channels),
        };
        if let Err(err) = worker.connect(handshake_timeout).await {
            let _ = self.close_channel(channel).await;
            return Err(err);
        }
        Ok(worker)
    }

    /// Deregisters a channel; the id becomes free for a fresh `open_worker`.
    pub async fn close_channel(&self, channel: u64) -> Result<(), WorkerError> {
        let mut table = self.channels.lock().await;
        table.parked.remove(&channel);
        table
            .open
            .remove(&channel)
            .map(|_| ())
            .ok_or(WorkerError::ChannelNotFound(channel))
    }
}

#[derive(Debug)]
pub struct MuxWorker {
    channel: u64,
    outbound: mpsc::Sender<MuxFrame>,
    inbound: mpsc::Receiver<WorkerToKernel>,
    channels: Channels,
}

impl MuxWorker {
    async fn send(&self, message: &KernelToWorker) -> Result<(), WorkerError> {
        let frame = MuxFrame {
            channel: self.channel,
            payload: serde_json::to_value(message)?,
        };
        self.outbound
            .send(frame)
            .await
            .map_err(|_| WorkerError::StreamRead("mux write pump is gone".to_string()))
    }

    async fn connect(&mut self, handshake_timeout: Duration) -> Result<(), WorkerError> {
        let first = timeout(handshake_timeout, self.inbound.recv())
            .await
            .map_err(|_| WorkerError::HandshakeTimeout)?;
        match first {
            Some(WorkerToKernel::Ready) => {}
            Some(other) => {
                return Err(WorkerError::Protocol(format!(
                    "expected ready on channel {}, got {other:?}",
                    self.channel
                )));
            }
            None => {
                return Err(WorkerError::StreamRead(
                    "mux stream closed before ready".to_string(),
                ));
            }
        }
        self.send(&KernelToWorker::Connected).await
    }
}

#[async_trait::async_trait]
impl VatWorker for MuxWorker {
    async fn deliver(
        &mut self,
        id: u64,
        payload: DeliveryPayload,
    ) -> Result<DeliveryResult, WorkerError> {
        self.send(&KernelToWorker::Delivery { id, payload }).await?;

        let mut streamed: Vec<Syscall> = Vec::new();
        loop {
            match self.inbound.recv().await {
                None => {
                    return Err(WorkerError::StreamRead(
                        "mux stream closed mid-delivery".to_string(),
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
        if self.send(&stop).await.is_err() {
            warn!("Mux channel {} already closed during teardown", self.channel);
        }
        self.inbound.close();
        self.channels.lock().await.open.remove(&self.channel);
    }
}

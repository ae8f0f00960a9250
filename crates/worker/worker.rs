//! Vat worker hosting: the delivery/syscall transport, the concrete worker
//! implementations (child process over stdio, in-process channels), and the
//! service that spawns, supervises, and tears them down.

use std::fmt::Debug;

use ocapd_common::message::{DeliveryPayload, DeliveryResult};

pub mod codec;
pub mod error;
pub mod local;
pub mod mux;
pub mod process;
pub mod service;
pub mod stream;
pub mod wire;

pub use error::WorkerError;
pub use local::{ChannelWorker, ScriptedWorker, WorkerEndpoint, channel_pair};
pub use mux::{Multiplexer, MuxWorker};
pub use process::ProcessWorker;
pub use service::{WorkerFactory, WorkerService};
pub use stream::StreamWorker;
pub use wire::{KernelToWorker, WorkerToKernel};

/// A live vat worker. Exactly one delivery is in flight at a time; the
/// router enforces this by holding the worker mutably across the await.
#[async_trait::async_trait]
pub trait VatWorker: Debug + Send {
    /// Writes one delivery and waits for its result, collecting any syscalls
    /// the worker streams out while the delivery runs.
    async fn deliver(
        &mut self,
        id: u64,
        payload: DeliveryPayload,
    ) -> Result<DeliveryResult, WorkerError>;

    /// Best-effort teardown: a `stopVat` delivery, then transport close.
    /// Never fails; late messages from the worker are dropped.
    async fn terminate(&mut self);
}

//! The worker service: owns every live worker, spawning them through a
//! pluggable factory and tearing them down on vat termination. The kernel
//! only ever talks to workers through this service.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use ocapd_common::message::{DeliveryPayload, DeliveryResult};
use ocapd_common::refs::EndpointId;
use ocapd_common::subcluster::{VatSpec, WorkerKind};
use tracing::{debug, info};

use crate::VatWorker;
use crate::error::WorkerError;
use crate::process::ProcessWorker;

/// Builds a worker for a vat. The factory decides how the bundle spec is
/// resolved; the kernel treats it as opaque.
pub type WorkerFactory = Arc<
    dyn Fn(EndpointId, VatSpec) -> BoxFuture<'static, Result<Box<dyn VatWorker>, WorkerError>>
        + Send
        + Sync,
>;

pub struct WorkerService {
    factory: WorkerFactory,
    workers: HashMap<EndpointId, Box<dyn VatWorker>>,
}

impl fmt::Debug for WorkerService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerService")
            .field("workers", &self.workers.len())
            .finish()
    }
}

impl WorkerService {
    pub fn new(factory: WorkerFactory) -> Self {
        WorkerService {
            factory,
            workers: HashMap::new(),
        }
    }

    /// A service that spawns one OS process per vat. Per-vat creation
    /// options may override the command; the bundle spec is appended as the
    /// final argument.
    pub fn with_process_workers(
        default_command: Option<String>,
        handshake_timeout: Duration,
    ) -> Self {
        let factory: WorkerFactory = Arc::new(move |vat, spec: VatSpec| {
            let default_command = default_command.clone();
            Box::pin(async move {
                let options = spec.creation_options.clone().unwrap_or_default();
                if options.worker == Some(WorkerKind::Local) {
                    return Err(WorkerError::Spawn(
                        "local vats need an embedder-provided worker factory".to_string(),
                    ));
                }
                let command = options
                    .command
                    .or(default_command)
                    .ok_or(WorkerError::NoWorkerCommand)?;
                info!("Spawning process worker for {vat} ({command})");
                let worker = ProcessWorker::spawn(
                    &command,
                    &options.args,
                    &spec.bundle_spec,
                    handshake_timeout,
                )
                .await?;
                Ok(Box::new(worker) as Box<dyn VatWorker>)
            })
        });
        WorkerService::new(factory)
    }

    pub async fn spawn(&mut self, vat: EndpointId, spec: &VatSpec) -> Result<(), WorkerError> {
        if self.workers.contains_key(&vat) {
            return Err(WorkerError::VatAlreadyExists(vat));
        }
        let worker = (self.factory)(vat, spec.clone()).await?;
        self.workers.insert(vat, worker);
        Ok(())
    }

    pub async fn deliver(
        &mut self,
        vat: EndpointId,
        id: u64,
        payload: DeliveryPayload,
    ) -> Result<DeliveryResult, WorkerError> {
        let worker = self
            .workers
            .get_mut(&vat)
            .ok_or(WorkerError::VatNotFound(vat))?;
        worker.deliver(id, payload).await
    }

    /// Tears down the vat's worker if it has one. Returns whether a worker
    /// was present.
    pub async fn terminate(&mut self, vat: EndpointId) -> bool {
        match self.workers.remove(&vat) {
            Some(mut worker) => {
                debug!("Terminating worker for {vat}");
                worker.terminate().await;
                true
            }
            None => false,
        }
    }

    pub async fn terminate_all(&mut self) {
        let vats: Vec<EndpointId> = self.workers.keys().copied().collect();
        for vat in vats {
            self.terminate(vat).await;
        }
    }

    pub fn contains(&self, vat: EndpointId) -> bool {
        self.workers.contains_key(&vat)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

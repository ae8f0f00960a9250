//! The ocap kernel: hosts isolated vats, brokers every inter-vat message
//! through capability references, tracks distributed ref counts, and
//! persists all of its state transactionally.

pub mod command;
pub mod error;
pub mod gc;
pub mod objects;
pub mod queue;
pub mod router;
pub mod state;
pub mod subcluster;
pub mod syscall;
pub mod translate;

use ocapd_common::capdata::CapData;
use ocapd_common::message::{Message, RunQueueItem};
use ocapd_common::refs::{EndpointId, KRef};
use ocapd_common::state::{VatRecord, VatState};
use ocapd_common::subcluster::VatSpec;
use ocapd_storage::{KernelTx, Store};
use ocapd_worker::WorkerService;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

pub use command::{
    KernelCommand, KernelHandle, KernelStatus, LaunchedSubcluster, LaunchedVat, VatPing, VatStatus,
};
pub use error::KernelError;
pub use queue::QUEUE_BASE;
pub use state::KernelData;

const COMMAND_BUFFER: usize = 64;

#[derive(Debug, Clone)]
pub struct KernelOptions {
    /// Deliveries per vat between `bringOutYourDead` pseudo-deliveries.
    /// Zero disables the cadence (operators can still trigger sweeps).
    pub bring_out_your_dead_interval: u64,
}

impl Default for KernelOptions {
    fn default() -> Self {
        KernelOptions {
            bring_out_your_dead_interval: 20,
        }
    }
}

pub struct Kernel {
    pub(crate) store: Store,
    pub(crate) data: KernelData,
    pub(crate) workers: WorkerService,
    pub(crate) options: KernelOptions,
    pub(crate) commands: mpsc::Receiver<KernelCommand>,
    pub(crate) delivery_seq: u64,
}

impl Kernel {
    /// Opens (or initializes) the kernel over a store. Recovery replays the
    /// committed image: queue cursors and items, object/promise tables,
    /// c-lists, endpoints, and subclusters; workers for recovered vats are
    /// respawned.
    pub async fn new(
        store: Store,
        workers: WorkerService,
        options: KernelOptions,
    ) -> Result<(Kernel, KernelHandle), KernelError> {
        let (tx, commands) = mpsc::channel(COMMAND_BUFFER);
        let data = match KernelData::load(&store).await? {
            Some(data) => {
                info!(
                    "Recovered kernel state: {} objects, {} promises, {} vats, queue depth {}",
                    data.objects.len(),
                    data.promises.len(),
                    data.endpoints.len(),
                    data.queue.depth()
                );
                data
            }
            None => {
                info!("Initializing fresh kernel state");
                let data = KernelData::new();
                let mut init = KernelTx::new();
                data.write_initial(&mut init);
                store.commit_with_retry(init.into_batch()).await?;
                data
            }
        };
        let mut kernel = Kernel {
            store,
            data,
            workers,
            options,
            commands,
            delivery_seq: 0,
        };
        kernel.respawn_workers().await?;
        Ok((kernel, KernelHandle::new(tx)))
    }

    pub fn data(&self) -> &KernelData {
        &self.data
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub(crate) fn vat_spec(record: &VatRecord) -> VatSpec {
        VatSpec {
            bundle_spec: record.bundle_spec.clone(),
            parameters: record.parameters.clone(),
            creation_options: record.creation_options.clone(),
        }
    }

    /// Spawns workers for every active vat that lacks one (startup recovery
    /// and `reload`). A vat whose worker cannot come up is broken.
    pub(crate) async fn respawn_workers(&mut self) -> Result<(), KernelError> {
        let pending: Vec<(EndpointId, VatSpec)> = self
            .data
            .endpoints
            .iter()
            .filter_map(|(id, record)| {
                record.vat.as_ref().and_then(|vat| {
                    (vat.state == VatState::Active && !self.workers.contains(*id))
                        .then(|| (*id, Kernel::vat_spec(vat)))
                })
            })
            .collect();
        for (vat, spec) in pending {
            if let Err(err) = self.workers.spawn(vat, &spec).await {
                error!("Failed to respawn worker for {vat}: {err}");
                let mut tx = KernelTx::new();
                self.mark_vat_broken(vat, &mut tx)?;
                self.commit_or_reload(tx).await?;
            }
        }
        Ok(())
    }

    /// Commits a command-scoped transaction; a failed commit restores the
    /// in-memory image from the store so the two never diverge.
    pub(crate) async fn commit_or_reload(&mut self, tx: KernelTx) -> Result<(), KernelError> {
        if tx.is_empty() {
            return Ok(());
        }
        match self.store.commit_with_retry(tx.into_batch()).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.reload_data().await?;
                Err(KernelError::Store(err))
            }
        }
    }

    pub(crate) async fn handle_command(
        &mut self,
        command: KernelCommand,
    ) -> Result<(), KernelError> {
        match command {
            KernelCommand::GetStatus { reply } => {
                let _ = reply.send(self.status());
            }
            KernelCommand::LaunchSubcluster { config, reply } => {
                let _ = reply.send(self.launch_subcluster(config).await);
            }
            KernelCommand::TerminateSubcluster { id, reply } => {
                let _ = reply.send(self.terminate_subcluster(&id).await);
            }
            KernelCommand::LaunchVat {
                spec,
                subcluster_id,
                reply,
            } => {
                let _ = reply.send(self.launch_vat(spec, subcluster_id).await);
            }
            KernelCommand::TerminateVat { id, reply } => {
                let _ = reply.send(self.terminate_vat(id).await);
            }
            KernelCommand::RestartVat { id, reply } => {
                let _ = reply.send(self.restart_vat(id).await);
            }
            KernelCommand::PingVat { id, reply } => {
                let _ = reply.send(self.ping_vat(id));
            }
            KernelCommand::QueueMessage {
                target,
                method,
                args,
                reply,
            } => {
                let _ = reply.send(self.queue_message(target, &method, args).await);
            }
            KernelCommand::CollectGarbage { reply } => {
                let _ = reply.send(self.collect_garbage().await);
            }
            KernelCommand::ClearState { reply } => {
                let _ = reply.send(self.clear_state().await);
            }
            KernelCommand::Reload { reply } => {
                let _ = reply.send(self.reload().await);
            }
        }
        Ok(())
    }

    pub fn status(&self) -> KernelStatus {
        let vats = self
            .data
            .endpoints
            .iter()
            .filter_map(|(id, record)| {
                record.vat.as_ref().map(|vat| VatStatus {
                    id: *id,
                    subcluster_id: vat.subcluster_id.clone(),
                    config: Kernel::vat_spec(vat),
                    state: vat.state,
                })
            })
            .collect();
        KernelStatus {
            subclusters: self.data.subclusters.values().cloned().collect(),
            vats,
            queue_depth: self.data.queue.depth(),
        }
    }

    /// Operator send: allocates a pinned result promise and enqueues the
    /// message. The pin is released when the promise settles.
    pub async fn queue_message(
        &mut self,
        target: KRef,
        method: &str,
        args: Vec<Value>,
    ) -> Result<KRef, KernelError> {
        let known = match target {
            KRef::Object(index) => self.data.objects.contains_key(&index),
            KRef::Promise(index) => self.data.promises.contains_key(&index),
        };
        if !known {
            return Err(KernelError::InvalidReference(target.to_string()));
        }
        let mut tx = KernelTx::new();
        let result = self.data.alloc_promise(None, &mut tx)?;
        if let KRef::Promise(index) = result {
            self.data.pins.insert(result);
            self.data.persist_pins(&mut tx)?;
            self.data.inc_promise_ref(index, &mut tx)?;
        }
        let message = Message {
            methargs: CapData::methargs(method, args, Vec::new())?,
            result: Some(result),
        };
        self.data.kernel_send(target, message, &mut tx)?;
        self.commit_or_reload(tx).await?;
        Ok(result)
    }

    /// Operator termination: the vat is broken immediately; the queued
    /// `terminateVat` item performs the teardown.
    pub async fn terminate_vat(&mut self, vat: EndpointId) -> Result<(), KernelError> {
        if self.data.vat_record(vat).is_none() {
            return Err(KernelError::VatNotFound(vat));
        }
        let mut tx = KernelTx::new();
        self.mark_vat_broken(vat, &mut tx)?;
        self.commit_or_reload(tx).await
    }

    /// Tears down the vat's worker and brings up a fresh one; kernel-side
    /// state (c-lists, promises) is untouched. Also un-breaks a broken vat.
    pub async fn restart_vat(&mut self, vat: EndpointId) -> Result<(), KernelError> {
        let Some(record) = self.data.vat_record(vat) else {
            return Err(KernelError::VatNotFound(vat));
        };
        let spec = Kernel::vat_spec(record);
        self.workers.terminate(vat).await;

        let mut tx = KernelTx::new();
        if let Some(record) = self.data.vat_record_mut(vat) {
            record.state = VatState::Active;
        }
        if let Some(endpoint_record) = self.data.endpoints.get(&vat) {
            tx.put_endpoint(endpoint_record)?;
        }
        // A restart overrides any teardown still queued from a prior break.
        self.data.queue.retain(
            |item| !matches!(item, RunQueueItem::TerminateVat { vat_id } if *vat_id == vat),
            &mut tx,
        );
        match self.workers.spawn(vat, &spec).await {
            Ok(()) => {
                self.data
                    .queue
                    .push_back(RunQueueItem::StartVat { vat_id: vat }, &mut tx)?;
                self.commit_or_reload(tx).await
            }
            Err(err) => {
                warn!("Restart of {vat} failed to spawn a worker: {err}");
                self.mark_vat_broken(vat, &mut tx)?;
                self.commit_or_reload(tx).await?;
                Err(KernelError::Worker(err))
            }
        }
    }

    pub fn ping_vat(&self, vat: EndpointId) -> Result<VatPing, KernelError> {
        let record = self
            .data
            .vat_record(vat)
            .ok_or(KernelError::VatNotFound(vat))?;
        Ok(VatPing {
            id: vat,
            state: record.state,
            worker_alive: self.workers.contains(vat),
        })
    }

    pub async fn collect_garbage(&mut self) -> Result<(), KernelError> {
        let mut tx = KernelTx::new();
        self.schedule_full_gc(&mut tx)?;
        self.commit_or_reload(tx).await
    }

    /// Wipes everything: workers, store, and the in-memory image.
    pub async fn clear_state(&mut self) -> Result<(), KernelError> {
        warn!("Clearing all kernel state");
        self.workers.terminate_all().await;
        self.store.clear().await?;
        self.data = KernelData::new();
        let mut tx = KernelTx::new();
        self.data.write_initial(&mut tx);
        self.store.commit_with_retry(tx.into_batch()).await?;
        Ok(())
    }

    /// Drops the in-memory image, reloads from the store, and respawns
    /// workers.
    pub async fn reload(&mut self) -> Result<(), KernelError> {
        info!("Reloading kernel from persistent state");
        self.workers.terminate_all().await;
        self.reload_data().await?;
        self.respawn_workers().await
    }
}

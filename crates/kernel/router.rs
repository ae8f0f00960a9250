//! The router: the single-threaded driver that pops one run-queue item per
//! cycle, translates it into the target vat's space, hands it to the worker,
//! applies the syscalls it produced, and commits everything atomically with
//! the queue advance.

use ocapd_common::capdata::CapData;
use ocapd_common::error::{ErrorCode, MarshaledError};
use ocapd_common::message::{DeliveryPayload, Message, Resolution, RunQueueItem};
use ocapd_common::refs::{EndpointId, KRef};
use ocapd_common::state::{PromiseState, VatState};
use ocapd_storage::{KernelTx, keys};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::Kernel;
use crate::error::KernelError;
use crate::state::KernelData;

impl Kernel {
    /// The kernel main loop: drains the run queue, parking on the command
    /// channel when idle. Control commands interleave between cycles, never
    /// inside one.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<(), KernelError> {
        info!("Kernel router started");
        loop {
            if cancel.is_cancelled() {
                break;
            }
            if self.data.queue.is_empty() {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    command = self.commands.recv() => match command {
                        Some(command) => self.handle_command(command).await?,
                        None => break,
                    },
                }
            } else {
                while let Ok(command) = self.commands.try_recv() {
                    self.handle_command(command).await?;
                }
                self.process_next().await?;
            }
        }
        self.workers.terminate_all().await;
        info!("Kernel router stopped");
        Ok(())
    }

    /// Processes items until the queue drains. Used by tests and by
    /// `collectGarbage` to observe a quiescent state.
    pub async fn run_to_idle(&mut self) -> Result<(), KernelError> {
        while self.process_next().await? {}
        Ok(())
    }

    /// One cycle: pop, process, commit. A commit failure (after the store's
    /// own retries) restores the pre-cycle image, leaving the item at the
    /// head, and breaks the target vat.
    pub async fn process_next(&mut self) -> Result<bool, KernelError> {
        if self.data.queue.is_empty() {
            return Ok(false);
        }
        let mut tx = KernelTx::new();
        let Some((seq, item)) = self.data.queue.pop_front(&mut tx) else {
            return Ok(false);
        };
        trace!("Cycle {seq}: {item:?}");
        let cycle_vat = self.item_vat(&item);

        match self.run_cycle(item, &mut tx).await {
            Ok(()) => {}
            Err(KernelError::Store(err)) => {
                self.reload_data().await?;
                return Err(KernelError::Store(err));
            }
            Err(err) => {
                // The item is consumed either way; the failure is local to it.
                warn!("Cycle {seq} failed: {err}");
            }
        }

        match self.store.commit_with_retry(tx.into_batch()).await {
            Ok(()) => Ok(true),
            Err(err) => {
                warn!("Cycle {seq} commit failed, delivery not applied: {err}");
                self.reload_data().await?;
                if let Some(vat) = cycle_vat {
                    let mut tx = KernelTx::new();
                    self.mark_vat_broken(vat, &mut tx)?;
                    self.store
                        .commit_with_retry(tx.into_batch())
                        .await
                        .map_err(KernelError::Store)?;
                    Ok(true)
                } else {
                    Err(KernelError::Store(err))
                }
            }
        }
    }

    async fn run_cycle(&mut self, item: RunQueueItem, tx: &mut KernelTx) -> Result<(), KernelError> {
        match item {
            RunQueueItem::Send { target, message } => self.cycle_send(target, message, tx).await,
            RunQueueItem::Notify { endpoint, kpid } => self.cycle_notify(endpoint, kpid, tx).await,
            RunQueueItem::GcAction {
                endpoint,
                kind,
                krefs,
            } => self.cycle_gc_action(endpoint, kind, krefs, tx).await,
            RunQueueItem::BringOutYourDead { endpoint } => {
                self.cycle_bring_out_your_dead(endpoint, tx).await
            }
            RunQueueItem::StartVat { vat_id } => self.cycle_start_vat(vat_id, tx).await,
            RunQueueItem::TerminateVat { vat_id } => self.cycle_terminate_vat(vat_id, tx).await,
        }
    }

    pub(crate) fn vat_is_active(&self, vat: EndpointId) -> bool {
        self.data
            .vat_record(vat)
            .is_some_and(|record| record.state == VatState::Active)
    }

    async fn cycle_send(
        &mut self,
        target: KRef,
        message: Message,
        tx: &mut KernelTx,
    ) -> Result<(), KernelError> {
        let KRef::Object(index) = target else {
            // A promise target can reach the run queue only through recovery
            // of an older image; re-route it through the promise tables.
            self.data.dec_message_refs(&message, tx)?;
            self.data.kernel_send(target, message, tx)?;
            return Ok(());
        };

        let Some(object) = self.data.objects.get(&index) else {
            return self.reject_and_consume(
                message,
                &MarshaledError::with_code(
                    format!("{target} does not exist"),
                    ErrorCode::InvalidReference,
                ),
                tx,
            );
        };
        if object.revoked {
            return self.reject_and_consume(message, &MarshaledError::revoked(target), tx);
        }
        let owner = object.owner;
        match self.data.vat_record(owner).map(|record| record.state) {
            None => {
                return self.reject_and_consume(
                    message,
                    &MarshaledError::with_code(
                        format!("owner of {target} is gone"),
                        ErrorCode::VatNotFound,
                    ),
                    tx,
                );
            }
            Some(VatState::Broken) => {
                return self.reject_and_consume(message, &MarshaledError::vat_deleted(owner), tx);
            }
            Some(VatState::Active) => {}
        }

        // Only the owner may receive deliveries to the object; its export
        // entry must still be present.
        let Some(target_eref) = self
            .data
            .clist(owner)
            .and_then(|clist| clist.entry(target))
            .map(|entry| entry.eref)
        else {
            return self.reject_and_consume(
                message,
                &MarshaledError::with_code(
                    format!("{target} has no owner entry"),
                    ErrorCode::InvalidReference,
                ),
                tx,
            );
        };

        let methargs = self
            .data
            .translate_capdata_to_endpoint(owner, &message.methargs, tx)?;
        let result = match message.result {
            None => None,
            Some(result_kref) => {
                if let KRef::Promise(p) = result_kref
                    && let Some(promise) = self.data.promises.get_mut(&p)
                {
                    // The receiving vat becomes the decider.
                    promise.decider = Some(owner);
                    tx.put_promise(p, promise)?;
                }
                Some(
                    self.data
                        .export_to_endpoint(owner, result_kref, tx)?
                        .to_string(),
                )
            }
        };

        let payload = DeliveryPayload::Message {
            target: target_eref.to_string(),
            methargs,
            result,
        };
        self.deliver_and_apply(owner, payload, tx, true).await?;
        self.data.dec_message_refs(&message, tx)?;
        Ok(())
    }

    /// Rejects the message's result promise (if any) and releases the
    /// consumed item's references.
    fn reject_and_consume(
        &mut self,
        message: Message,
        error: &MarshaledError,
        tx: &mut KernelTx,
    ) -> Result<(), KernelError> {
        debug!("Rejecting undeliverable send: {error}");
        if let Some(KRef::Promise(result)) = message.result {
            self.data.reject_promise(result, error, tx)?;
        }
        self.data.dec_message_refs(&message, tx)?;
        Ok(())
    }

    async fn cycle_notify(
        &mut self,
        endpoint: EndpointId,
        kpid: KRef,
        tx: &mut KernelTx,
    ) -> Result<(), KernelError> {
        let KRef::Promise(index) = kpid else {
            return Ok(());
        };
        let Some(promise) = self.data.promises.get(&index) else {
            return Ok(());
        };
        if !promise.is_settled() || !self.vat_is_active(endpoint) {
            self.data.dec_promise_ref(index, tx)?;
            return Ok(());
        }
        let rejected = promise.state == PromiseState::Rejected;
        let value = promise.value.clone().unwrap_or_else(CapData::empty);

        let kpid_eref = self.data.export_to_endpoint(endpoint, kpid, tx)?;
        let translated = match self.data.translate_capdata_to_endpoint(endpoint, &value, tx) {
            Ok(translated) => translated,
            Err(err) => {
                warn!("Cannot translate resolution of {kpid} for {endpoint}: {err}");
                self.data.dec_promise_ref(index, tx)?;
                return Ok(());
            }
        };
        let payload = DeliveryPayload::Notify {
            resolutions: vec![Resolution {
                kpid: kpid_eref.to_string(),
                rejected,
                value: translated,
            }],
        };
        self.deliver_and_apply(endpoint, payload, tx, true).await?;

        // The subscriber has seen the resolution; its c-list entry for the
        // promise is retired.
        if self.vat_is_active(endpoint)
            && let Some(entry) = self.data.clist_mut(endpoint).remove(kpid)
        {
            tx.delete_clist(endpoint, kpid, entry.eref);
            self.data.dec_promise_ref(index, tx)?;
        }
        self.data.dec_promise_ref(index, tx)?;
        Ok(())
    }

    async fn cycle_start_vat(
        &mut self,
        vat: EndpointId,
        tx: &mut KernelTx,
    ) -> Result<(), KernelError> {
        let Some(record) = self.data.vat_record(vat) else {
            return Ok(());
        };
        if record.state != VatState::Active {
            return Ok(());
        }
        let parameters = CapData::from_value(
            &record.parameters.clone().unwrap_or(Value::Null),
            Vec::new(),
        )?;
        let payload = DeliveryPayload::StartVat {
            bundle_spec: record.bundle_spec.clone(),
            parameters,
        };
        self.deliver_and_apply(vat, payload, tx, false).await
    }

    async fn cycle_terminate_vat(
        &mut self,
        vat: EndpointId,
        tx: &mut KernelTx,
    ) -> Result<(), KernelError> {
        self.workers.terminate(vat).await;
        if self.data.vat_record(vat).is_none() {
            return Ok(());
        }
        info!("Terminating vat {vat}");
        self.sever_vat_messaging(vat, tx)?;

        // C-list teardown: exports are revoked, imports released.
        let clist = self.data.clists.remove(&vat).unwrap_or_default();
        for (kref, entry) in clist.iter() {
            tx.delete_clist(vat, *kref, entry.eref);
            match *kref {
                KRef::Object(index) => {
                    let Some(object) = self.data.objects.get_mut(&index) else {
                        continue;
                    };
                    if object.owner == vat {
                        object.revoked = true;
                        let orphaned = object.recognizable_count == 0;
                        tx.put_object(index, object)?;
                        if orphaned {
                            self.data.objects.remove(&index);
                            tx.delete_object(index);
                        }
                    } else {
                        if entry.reachable {
                            self.data.dec_object_reachable(index, tx)?;
                        }
                        self.data.dec_object_recognizable(index, tx)?;
                    }
                }
                KRef::Promise(index) => {
                    self.data.dec_promise_ref(index, tx)?;
                }
            }
        }

        // The vat's kv partition goes with it.
        for (key, _) in self
            .store
            .scan_prefix(&keys::vatstore_prefix(vat))
            .await?
        {
            tx.delete(key);
        }

        if let Some(subcluster_id) = self
            .data
            .vat_record(vat)
            .and_then(|record| record.subcluster_id.clone())
            && let Some(record) = self.data.subclusters.get_mut(&subcluster_id)
        {
            record.vats.retain(|_, id| *id != vat);
            tx.put_subcluster(record)?;
        }

        self.data.endpoints.remove(&vat);
        tx.delete_endpoint(vat);
        Ok(())
    }

    /// One delivery round-trip plus the application of everything it
    /// produced. A transport failure or an error reported by the worker
    /// marks the vat broken; a bad syscall does the same and abandons the
    /// rest of the batch.
    pub(crate) async fn deliver_and_apply(
        &mut self,
        vat: EndpointId,
        payload: DeliveryPayload,
        tx: &mut KernelTx,
        counts_toward_boyd: bool,
    ) -> Result<(), KernelError> {
        self.delivery_seq += 1;
        let id = self.delivery_seq;
        trace!("Delivery {id} to {vat}: {payload:?}");
        let outcome = self.workers.deliver(vat, id, payload).await;
        let result = match outcome {
            Err(err) => {
                warn!("Delivery {id} to {vat} failed in transport: {err}");
                self.mark_vat_broken(vat, tx)?;
                return Ok(());
            }
            Ok(result) => result,
        };
        if let Some(error) = &result.error {
            warn!("Vat {vat} reported a fatal delivery error: {error}");
            self.mark_vat_broken(vat, tx)?;
            return Ok(());
        }

        for syscall in result.syscalls {
            match self.apply_syscall(vat, syscall, tx).await {
                Ok(_) => {}
                Err(KernelError::Store(err)) => return Err(KernelError::Store(err)),
                Err(err) => {
                    warn!("Breaking {vat}: {err}");
                    self.mark_vat_broken(vat, tx)?;
                    return Ok(());
                }
            }
        }

        for (key, value) in &result.checkpoint.kv_mutations {
            tx.vatstore_set(vat, key, value);
        }
        for key in &result.checkpoint.kv_deletions {
            tx.vatstore_delete(vat, key);
        }
        if counts_toward_boyd {
            self.bump_boyd_counter(vat, tx)?;
        }
        Ok(())
    }

    /// Marks a vat broken: no further deliveries, decided promises
    /// rejected, subscriptions removed, queued sends to its exports
    /// rejected, and a `terminateVat` item appended.
    pub(crate) fn mark_vat_broken(
        &mut self,
        vat: EndpointId,
        tx: &mut KernelTx,
    ) -> Result<(), KernelError> {
        match self.data.vat_record_mut(vat) {
            None => return Ok(()),
            Some(record) if record.state == VatState::Broken => return Ok(()),
            Some(record) => record.state = VatState::Broken,
        }
        if let Some(record) = self.data.endpoints.get(&vat) {
            tx.put_endpoint(record)?;
        }
        warn!("Vat {vat} is broken");
        self.sever_vat_messaging(vat, tx)?;
        self.data
            .queue
            .push_back(RunQueueItem::TerminateVat { vat_id: vat }, tx)?;
        Ok(())
    }

    /// Rejects everything that depends on the vat answering: promises it
    /// decides, its subscriptions, and queued sends to its exports.
    fn sever_vat_messaging(&mut self, vat: EndpointId, tx: &mut KernelTx) -> Result<(), KernelError> {
        let error = MarshaledError::vat_deleted(vat);

        let decided: Vec<u64> = self
            .data
            .promises
            .iter()
            .filter(|(_, promise)| promise.decider == Some(vat))
            .map(|(index, _)| *index)
            .collect();
        for index in decided {
            self.data.reject_promise(index, &error, tx)?;
        }

        let subscribed: Vec<u64> = self
            .data
            .promises
            .iter()
            .filter(|(_, promise)| promise.subscribers.contains(&vat))
            .map(|(index, _)| *index)
            .collect();
        for index in subscribed {
            if let Some(promise) = self.data.promises.get_mut(&index) {
                promise.subscribers.remove(&vat);
                tx.put_promise(index, promise)?;
            }
            self.data.maybe_free_promise(index, tx)?;
        }

        let KernelData { objects, queue, .. } = &mut self.data;
        let removed = queue.retain(
            |item| !matches!(item, RunQueueItem::Send { target: KRef::Object(index), .. }
                if objects.get(index).is_some_and(|object| object.owner == vat)),
            tx,
        );
        for item in removed {
            if let RunQueueItem::Send { message, .. } = item {
                if let Some(KRef::Promise(result)) = message.result {
                    self.data.reject_promise(result, &error, tx)?;
                }
                self.data.dec_message_refs(&message, tx)?;
            }
        }
        Ok(())
    }

    /// Discards the in-memory image and reloads it from the last committed
    /// state.
    pub(crate) async fn reload_data(&mut self) -> Result<(), KernelError> {
        self.data = KernelData::load(&self.store)
            .await?
            .unwrap_or_else(KernelData::new);
        debug!("Kernel image reloaded from store");
        Ok(())
    }
}

impl Kernel {
    /// The vat a cycle delivers to, for broken-vat attribution on commit
    /// failure.
    fn item_vat(&self, item: &RunQueueItem) -> Option<EndpointId> {
        match item {
            RunQueueItem::Send { target, .. } => match target {
                KRef::Object(index) => self.data.objects.get(index).map(|object| object.owner),
                KRef::Promise(_) => None,
            },
            RunQueueItem::Notify { endpoint, .. }
            | RunQueueItem::GcAction { endpoint, .. }
            | RunQueueItem::BringOutYourDead { endpoint } => Some(*endpoint),
            RunQueueItem::StartVat { vat_id } | RunQueueItem::TerminateVat { vat_id } => {
                Some(*vat_id)
            }
        }
    }
}

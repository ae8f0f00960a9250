//! Syscall handlers. Each handler is a state transition applied under the
//! cycle's transaction; a protocol violation surfaces as `BadSyscall` and
//! the router breaks the offending vat.

use ocapd_common::capdata::CapData;
use ocapd_common::message::{Message, Resolution, Syscall};
use ocapd_common::refs::{ERef, EndpointId, KRef, RefDirection, RefKind};
use ocapd_storage::{KernelTx, keys};
use tracing::{info, warn};

use crate::Kernel;
use crate::error::KernelError;

impl Kernel {
    /// Applies one syscall from `vat`. `Ok(Some(_))` carries the value of a
    /// read-style syscall for transports that can hand it back in-line;
    /// batched transports simply drop it.
    pub(crate) async fn apply_syscall(
        &mut self,
        vat: EndpointId,
        syscall: Syscall,
        tx: &mut KernelTx,
    ) -> Result<Option<String>, KernelError> {
        match syscall {
            Syscall::Send {
                target,
                methargs,
                result,
            } => {
                self.syscall_send(vat, &target, methargs, result.as_deref(), tx)?;
                Ok(None)
            }
            Syscall::Subscribe { kpid } => {
                self.syscall_subscribe(vat, &kpid, tx)?;
                Ok(None)
            }
            Syscall::Resolve { resolutions } => {
                self.syscall_resolve(vat, resolutions, tx)?;
                Ok(None)
            }
            Syscall::Exit { failure, info } => {
                if failure {
                    warn!("Vat {vat} requested termination (failure): {}", info.body);
                } else {
                    info!("Vat {vat} requested termination: {}", info.body);
                }
                self.data
                    .queue
                    .push_back(ocapd_common::message::RunQueueItem::TerminateVat { vat_id: vat }, tx)?;
                Ok(None)
            }
            Syscall::VatstoreGet { key } => self.vatstore_get(vat, &key, tx).await,
            Syscall::VatstoreSet { key, value } => {
                tx.vatstore_set(vat, &key, &value);
                Ok(None)
            }
            Syscall::VatstoreDelete { key } => {
                tx.vatstore_delete(vat, &key);
                Ok(None)
            }
            Syscall::VatstoreGetNextKey { prior_key } => {
                self.vatstore_get_next_key(vat, &prior_key, tx).await
            }
            Syscall::DropImports { erefs } => {
                self.syscall_drop_imports(vat, &erefs, tx)?;
                Ok(None)
            }
            Syscall::RetireImports { erefs } => {
                self.syscall_retire_imports(vat, &erefs, tx)?;
                Ok(None)
            }
            Syscall::RetireExports { erefs } => {
                self.syscall_retire_exports(vat, &erefs, tx)?;
                Ok(None)
            }
            Syscall::AbandonExports { erefs } => {
                self.syscall_abandon_exports(vat, &erefs, tx)?;
                Ok(None)
            }
        }
    }

    fn parse_eref(&self, vat: EndpointId, raw: &str) -> Result<ERef, KernelError> {
        raw.parse().map_err(|_| KernelError::BadSyscall {
            vat,
            reason: format!("malformed reference {raw}"),
        })
    }

    fn syscall_send(
        &mut self,
        vat: EndpointId,
        target: &str,
        methargs: CapData,
        result: Option<&str>,
        tx: &mut KernelTx,
    ) -> Result<(), KernelError> {
        let target_eref = self.parse_eref(vat, target)?;
        let target_kref = self.data.import_to_kernel(vat, target_eref, tx)?;
        let methargs = self.data.translate_capdata_to_kernel(vat, &methargs, tx)?;

        let result_kref = match result {
            None => None,
            Some(raw) => {
                let eref = self.parse_eref(vat, raw)?;
                if eref.kind != RefKind::Promise {
                    return Err(KernelError::BadSyscall {
                        vat,
                        reason: format!("result {eref} is not a promise"),
                    });
                }
                let kref = self.data.import_to_kernel(vat, eref, tx)?;
                let KRef::Promise(index) = kref else {
                    return Err(KernelError::BadSyscall {
                        vat,
                        reason: format!("result {eref} is not a promise"),
                    });
                };
                let promise = self
                    .data
                    .promises
                    .get_mut(&index)
                    .ok_or_else(|| KernelError::InvalidReference(kref.to_string()))?;
                // A fresh `p+` mint arrives here with the caller as decider;
                // anything else the caller does not decide is unusable.
                if promise.is_settled() || promise.decider != Some(vat) {
                    return Err(KernelError::BadSyscall {
                        vat,
                        reason: format!("{kref} is not a usable result promise"),
                    });
                }
                // Pipelined: no decider until the message is delivered, the
                // caller subscribes to hear the outcome.
                promise.decider = None;
                promise.subscribers.insert(vat);
                tx.put_promise(index, promise)?;
                Some(kref)
            }
        };

        let message = Message {
            methargs,
            result: result_kref,
        };
        self.data.kernel_send(target_kref, message, tx)
    }

    fn syscall_subscribe(
        &mut self,
        vat: EndpointId,
        kpid: &str,
        tx: &mut KernelTx,
    ) -> Result<(), KernelError> {
        let eref = self.parse_eref(vat, kpid)?;
        let kref = self.data.import_to_kernel(vat, eref, tx)?;
        let KRef::Promise(index) = kref else {
            return Err(KernelError::BadSyscall {
                vat,
                reason: format!("cannot subscribe to {kref}"),
            });
        };
        let promise = self
            .data
            .promises
            .get_mut(&index)
            .ok_or_else(|| KernelError::InvalidReference(kref.to_string()))?;
        if promise.is_settled() {
            // Already settled: notify immediately.
            self.data.inc_promise_ref(index, tx)?;
            self.data.queue.push_back(
                ocapd_common::message::RunQueueItem::Notify {
                    endpoint: vat,
                    kpid: kref,
                },
                tx,
            )?;
        } else {
            promise.subscribers.insert(vat);
            tx.put_promise(index, promise)?;
        }
        Ok(())
    }

    fn syscall_resolve(
        &mut self,
        vat: EndpointId,
        resolutions: Vec<Resolution>,
        tx: &mut KernelTx,
    ) -> Result<(), KernelError> {
        // Validate the whole batch before applying any of it.
        let mut staged = Vec::with_capacity(resolutions.len());
        for resolution in resolutions {
            let eref = self.parse_eref(vat, &resolution.kpid)?;
            let kref = self.data.import_to_kernel(vat, eref, tx)?;
            let KRef::Promise(index) = kref else {
                return Err(KernelError::BadSyscall {
                    vat,
                    reason: format!("cannot resolve {kref}"),
                });
            };
            let promise = self
                .data
                .promises
                .get(&index)
                .ok_or_else(|| KernelError::InvalidReference(kref.to_string()))?;
            if promise.is_settled() {
                return Err(KernelError::BadSyscall {
                    vat,
                    reason: format!("{kref} is already settled"),
                });
            }
            if promise.decider != Some(vat) {
                return Err(KernelError::BadSyscall {
                    vat,
                    reason: format!("{vat} is not the decider of {kref}"),
                });
            }
            let value = self
                .data
                .translate_capdata_to_kernel(vat, &resolution.value, tx)?;
            staged.push((index, kref, resolution.rejected, value));
        }

        for (index, kref, rejected, value) in staged {
            // The decider no longer needs its c-list entry once it settles
            // the promise.
            if let Some(entry) = self.data.clist_mut(vat).remove(kref) {
                tx.delete_clist(vat, kref, entry.eref);
                self.data.dec_promise_ref(index, tx)?;
            }
            self.data.resolve_promise(index, rejected, value, tx)?;
        }
        Ok(())
    }

    fn syscall_drop_imports(
        &mut self,
        vat: EndpointId,
        erefs: &[String],
        tx: &mut KernelTx,
    ) -> Result<(), KernelError> {
        for raw in erefs {
            let eref = self.parse_eref(vat, raw)?;
            if eref.direction != RefDirection::Import || eref.kind != RefKind::Object {
                return Err(KernelError::BadSyscall {
                    vat,
                    reason: format!("dropImports of non-imported-object {eref}"),
                });
            }
            let kref = self.data.import_to_kernel(vat, eref, tx)?;
            let KRef::Object(index) = kref else { continue };
            let Some(entry) = self.data.clist_mut(vat).entry_mut(kref) else {
                continue;
            };
            if !entry.reachable {
                continue;
            }
            entry.reachable = false;
            let entry = entry.clone();
            tx.put_clist(vat, kref, &entry)?;
            self.data.dec_object_reachable(index, tx)?;
        }
        Ok(())
    }

    fn syscall_retire_imports(
        &mut self,
        vat: EndpointId,
        erefs: &[String],
        tx: &mut KernelTx,
    ) -> Result<(), KernelError> {
        for raw in erefs {
            let eref = self.parse_eref(vat, raw)?;
            if eref.direction != RefDirection::Import || eref.kind != RefKind::Object {
                return Err(KernelError::BadSyscall {
                    vat,
                    reason: format!("retireImports of non-imported-object {eref}"),
                });
            }
            let kref = self.data.import_to_kernel(vat, eref, tx)?;
            let KRef::Object(index) = kref else { continue };
            let Some(entry) = self.data.clist(vat).and_then(|c| c.entry(kref)) else {
                continue;
            };
            if entry.reachable {
                return Err(KernelError::BadSyscall {
                    vat,
                    reason: format!("retireImports of still-reachable {eref}"),
                });
            }
            if let Some(entry) = self.data.clist_mut(vat).remove(kref) {
                tx.delete_clist(vat, kref, entry.eref);
            }
            self.data.dec_object_recognizable(index, tx)?;
        }
        Ok(())
    }

    fn syscall_retire_exports(
        &mut self,
        vat: EndpointId,
        erefs: &[String],
        tx: &mut KernelTx,
    ) -> Result<(), KernelError> {
        for raw in erefs {
            let (index, kref) = self.owned_export(vat, raw, tx)?;
            if let Some(entry) = self.data.clist_mut(vat).remove(kref) {
                tx.delete_clist(vat, kref, entry.eref);
            }
            // The identity is gone: importers are told to retire, and the
            // object rejects deliveries in the interim.
            if let Some(object) = self.data.objects.get_mut(&index) {
                object.revoked = true;
                tx.put_object(index, object)?;
            }
            let importers: Vec<EndpointId> = self
                .data
                .clists
                .iter()
                .filter(|(endpoint, clist)| **endpoint != vat && clist.entry(kref).is_some())
                .map(|(endpoint, _)| *endpoint)
                .collect();
            if importers.is_empty() {
                self.data.objects.remove(&index);
                tx.delete_object(index);
            } else {
                for importer in importers {
                    self.data.queue.push_back(
                        ocapd_common::message::RunQueueItem::GcAction {
                            endpoint: importer,
                            kind: ocapd_common::message::GcActionKind::RetireImports,
                            krefs: vec![kref],
                        },
                        tx,
                    )?;
                }
            }
        }
        Ok(())
    }

    fn syscall_abandon_exports(
        &mut self,
        vat: EndpointId,
        erefs: &[String],
        tx: &mut KernelTx,
    ) -> Result<(), KernelError> {
        for raw in erefs {
            let (index, kref) = self.owned_export(vat, raw, tx)?;
            if let Some(entry) = self.data.clist_mut(vat).remove(kref) {
                tx.delete_clist(vat, kref, entry.eref);
            }
            // Importers keep the identity; only future deliveries fail.
            if let Some(object) = self.data.objects.get_mut(&index) {
                object.revoked = true;
                tx.put_object(index, object)?;
            }
        }
        Ok(())
    }

    /// Parses an `o+<n>` eref and checks the caller really owns the export.
    fn owned_export(
        &mut self,
        vat: EndpointId,
        raw: &str,
        tx: &mut KernelTx,
    ) -> Result<(u64, KRef), KernelError> {
        let eref = self.parse_eref(vat, raw)?;
        if eref.direction != RefDirection::Export || eref.kind != RefKind::Object {
            return Err(KernelError::BadSyscall {
                vat,
                reason: format!("{eref} is not an exported object"),
            });
        }
        let kref = self.data.import_to_kernel(vat, eref, tx)?;
        let KRef::Object(index) = kref else {
            return Err(KernelError::BadSyscall {
                vat,
                reason: format!("{eref} is not an object"),
            });
        };
        let owner = self
            .data
            .objects
            .get(&index)
            .map(|object| object.owner)
            .ok_or_else(|| KernelError::InvalidReference(kref.to_string()))?;
        if owner != vat {
            return Err(KernelError::BadSyscall {
                vat,
                reason: format!("{vat} does not own {kref}"),
            });
        }
        Ok((index, kref))
    }

    async fn vatstore_get(
        &mut self,
        vat: EndpointId,
        key: &str,
        tx: &KernelTx,
    ) -> Result<Option<String>, KernelError> {
        let full = keys::vatstore(vat, key);
        match tx.pending(&full) {
            Some(Some(bytes)) => Ok(Some(String::from_utf8_lossy(bytes).into_owned())),
            Some(None) => Ok(None),
            None => Ok(self.store.vatstore_get(vat, key).await?),
        }
    }

    /// Next key in the vat's partition after `prior_key`, seeing both the
    /// committed state and this cycle's uncommitted writes.
    async fn vatstore_get_next_key(
        &mut self,
        vat: EndpointId,
        prior_key: &str,
        tx: &KernelTx,
    ) -> Result<Option<String>, KernelError> {
        let prefix = keys::vatstore_prefix(vat);

        let mut cursor = prior_key.to_string();
        let engine_next = loop {
            match self.store.vatstore_get_next_key(vat, &cursor).await? {
                None => break None,
                Some(key) if tx.is_pending_delete(&keys::vatstore(vat, &key)) => {
                    cursor = key;
                }
                Some(key) => break Some(key),
            }
        };

        let overlay_next = tx
            .pending_set_keys(&prefix)
            .into_iter()
            .filter_map(|full| full.strip_prefix(&prefix).map(str::to_string))
            .find(|key| key.as_str() > prior_key);

        Ok(match (engine_next, overlay_next) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (next, None) | (None, next) => next,
        })
    }
}

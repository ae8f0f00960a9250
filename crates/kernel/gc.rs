//! Distributed GC. Collection rides the run queue so it is serialized
//! against deliveries: drop/retire intentions surface as `gc-action` items,
//! and `bringOutYourDead` pseudo-deliveries give each vat a periodic chance
//! to emit its pending drops before a checkpoint.
//!
//! For any object the owner observes drop before retire, and neither while
//! a reachable c-list entry for it exists anywhere.

use ocapd_common::message::{DeliveryPayload, GcActionKind, RunQueueItem};
use ocapd_common::refs::{EndpointId, KRef, RefDirection};
use ocapd_common::state::VatState;
use ocapd_storage::KernelTx;
use tracing::debug;

use crate::Kernel;
use crate::error::KernelError;

impl Kernel {
    /// Filters a scheduled action down to the krefs it still applies to.
    /// Counts move between scheduling and processing (re-exports, vat
    /// deaths), so every action re-checks its premise at delivery time.
    pub(crate) fn live_gc_krefs(
        &self,
        endpoint: EndpointId,
        kind: GcActionKind,
        krefs: &[KRef],
    ) -> Vec<KRef> {
        krefs
            .iter()
            .copied()
            .filter(|kref| {
                let KRef::Object(index) = kref else {
                    return false;
                };
                let Some(entry) = self.data.clist(endpoint).and_then(|c| c.entry(*kref)) else {
                    return false;
                };
                match kind {
                    GcActionKind::DropExports => {
                        entry.eref.direction == RefDirection::Export
                            && self.data.objects.get(index).is_some_and(|object| {
                                object.reachable_count == 0 && !object.revoked
                            })
                    }
                    GcActionKind::RetireExports => {
                        entry.eref.direction == RefDirection::Export
                            && self.data.objects.get(index).is_some_and(|object| {
                                object.reachable_count == 0 && object.recognizable_count == 0
                            })
                    }
                    GcActionKind::RetireImports => entry.eref.direction == RefDirection::Import,
                }
            })
            .collect()
    }

    pub(crate) async fn cycle_gc_action(
        &mut self,
        endpoint: EndpointId,
        kind: GcActionKind,
        krefs: Vec<KRef>,
        tx: &mut KernelTx,
    ) -> Result<(), KernelError> {
        if !self.vat_is_active(endpoint) {
            return Ok(());
        }
        let live = self.live_gc_krefs(endpoint, kind, &krefs);
        if live.is_empty() {
            debug!("Skipping stale {kind:?} for {endpoint}");
            return Ok(());
        }

        let mut erefs = Vec::with_capacity(live.len());
        for kref in &live {
            let entry = self
                .data
                .clist(endpoint)
                .and_then(|c| c.entry(*kref))
                .ok_or_else(|| KernelError::InvalidReference(kref.to_string()))?;
            erefs.push(entry.eref.to_string());
        }

        let payload = match kind {
            GcActionKind::DropExports => DeliveryPayload::DropExports { erefs },
            GcActionKind::RetireExports => DeliveryPayload::RetireExports { erefs },
            GcActionKind::RetireImports => DeliveryPayload::RetireImports { erefs },
        };
        self.deliver_and_apply(endpoint, payload, tx, false).await?;

        match kind {
            GcActionKind::DropExports => {}
            GcActionKind::RetireExports => {
                for kref in live {
                    if let Some(entry) = self.data.clist_mut(endpoint).remove(kref) {
                        tx.delete_clist(endpoint, kref, entry.eref);
                    }
                    if let KRef::Object(index) = kref {
                        self.data.objects.remove(&index);
                        tx.delete_object(index);
                    }
                }
            }
            GcActionKind::RetireImports => {
                for kref in live {
                    let Some(entry) = self.data.clist_mut(endpoint).remove(kref) else {
                        continue;
                    };
                    tx.delete_clist(endpoint, kref, entry.eref);
                    if let KRef::Object(index) = kref {
                        if entry.reachable {
                            self.data.dec_object_reachable(index, tx)?;
                        }
                        self.data.dec_object_recognizable(index, tx)?;
                    }
                }
            }
        }
        Ok(())
    }

    pub(crate) async fn cycle_bring_out_your_dead(
        &mut self,
        endpoint: EndpointId,
        tx: &mut KernelTx,
    ) -> Result<(), KernelError> {
        if !self.vat_is_active(endpoint) {
            return Ok(());
        }
        self.deliver_and_apply(endpoint, DeliveryPayload::BringOutYourDead, tx, false)
            .await?;
        if self.vat_is_active(endpoint)
            && let Some(record) = self.data.vat_record_mut(endpoint)
        {
            record.deliveries_since_boyd = 0;
            if let Some(endpoint_record) = self.data.endpoints.get(&endpoint) {
                tx.put_endpoint(endpoint_record)?;
            }
        }
        Ok(())
    }

    /// Counts a delivery toward the vat's `bringOutYourDead` cadence,
    /// scheduling one when the interval elapses.
    pub(crate) fn bump_boyd_counter(
        &mut self,
        vat: EndpointId,
        tx: &mut KernelTx,
    ) -> Result<(), KernelError> {
        let interval = self.options.bring_out_your_dead_interval;
        let Some(record) = self.data.vat_record_mut(vat) else {
            return Ok(());
        };
        record.deliveries_since_boyd += 1;
        let due = interval > 0 && record.deliveries_since_boyd >= interval;
        if due {
            record.deliveries_since_boyd = 0;
        }
        if let Some(endpoint_record) = self.data.endpoints.get(&vat) {
            tx.put_endpoint(endpoint_record)?;
        }
        if due {
            self.data
                .queue
                .push_back(RunQueueItem::BringOutYourDead { endpoint: vat }, tx)?;
        }
        Ok(())
    }

    /// Operator-triggered sweep: every active vat gets an immediate
    /// `bringOutYourDead`.
    pub(crate) fn schedule_full_gc(&mut self, tx: &mut KernelTx) -> Result<(), KernelError> {
        let vats: Vec<EndpointId> = self
            .data
            .endpoints
            .iter()
            .filter(|(_, record)| {
                record
                    .vat
                    .as_ref()
                    .is_some_and(|vat| vat.state == VatState::Active)
            })
            .map(|(id, _)| *id)
            .collect();
        for vat in vats {
            self.data
                .queue
                .push_back(RunQueueItem::BringOutYourDead { endpoint: vat }, tx)?;
        }
        Ok(())
    }
}

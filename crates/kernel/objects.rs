//! The object and promise tables: allocation, distributed ref counting with
//! gc-action scheduling, message routing onto targets, and promise
//! resolution with the transactional queue splice.

use std::mem;

use ocapd_common::capdata::CapData;
use ocapd_common::error::MarshaledError;
use ocapd_common::message::{GcActionKind, Message, RunQueueItem};
use ocapd_common::refs::{EndpointId, KRef, RefDirection};
use ocapd_common::state::{KernelObject, KernelPromise, PromiseState, VatState};
use ocapd_storage::KernelTx;
use tracing::debug;

use crate::error::KernelError;
use crate::state::{COUNTER_OBJECT, COUNTER_PROMISE, KernelData};

impl KernelData {
    pub fn alloc_object(
        &mut self,
        owner: EndpointId,
        tx: &mut KernelTx,
    ) -> Result<KRef, KernelError> {
        let index = self.next_object_id;
        self.next_object_id += 1;
        tx.set_counter(COUNTER_OBJECT, self.next_object_id);
        let object = KernelObject::new(owner);
        tx.put_object(index, &object)?;
        self.objects.insert(index, object);
        Ok(KRef::Object(index))
    }

    pub fn alloc_promise(
        &mut self,
        decider: Option<EndpointId>,
        tx: &mut KernelTx,
    ) -> Result<KRef, KernelError> {
        let index = self.next_promise_id;
        self.next_promise_id += 1;
        tx.set_counter(COUNTER_PROMISE, self.next_promise_id);
        let promise = KernelPromise::unresolved(decider);
        tx.put_promise(index, &promise)?;
        self.promises.insert(index, promise);
        Ok(KRef::Promise(index))
    }

    pub fn inc_promise_ref(&mut self, index: u64, tx: &mut KernelTx) -> Result<(), KernelError> {
        let promise = self
            .promises
            .get_mut(&index)
            .ok_or_else(|| KernelError::InvalidReference(KRef::Promise(index).to_string()))?;
        promise.ref_count += 1;
        tx.put_promise(index, promise)?;
        Ok(())
    }

    pub fn dec_promise_ref(&mut self, index: u64, tx: &mut KernelTx) -> Result<(), KernelError> {
        if let Some(promise) = self.promises.get_mut(&index) {
            promise.ref_count = promise.ref_count.saturating_sub(1);
            tx.put_promise(index, promise)?;
            self.maybe_free_promise(index, tx)?;
        }
        Ok(())
    }

    /// Deletes a settled, fully-unreferenced promise record, releasing the
    /// references its resolution value held.
    pub fn maybe_free_promise(&mut self, index: u64, tx: &mut KernelTx) -> Result<(), KernelError> {
        let free = match self.promises.get(&index) {
            Some(p) => {
                p.is_settled() && p.ref_count == 0 && p.queue.is_empty() && p.subscribers.is_empty()
            }
            None => false,
        };
        if !free {
            return Ok(());
        }
        let value = self
            .promises
            .remove(&index)
            .and_then(|promise| promise.value);
        tx.delete_promise(index);
        debug!("Freed promise kp{index}");
        if let Some(value) = value {
            self.dec_value_refs(&value, tx)?;
        }
        Ok(())
    }

    /// Does the owner still hold its `+` entry for this object?
    fn owner_holds_export(&self, index: u64) -> bool {
        let Some(object) = self.objects.get(&index) else {
            return false;
        };
        self.clists
            .get(&object.owner)
            .and_then(|clist| clist.entry(KRef::Object(index)))
            .is_some_and(|entry| entry.eref.direction == RefDirection::Export)
    }

    fn owner_is_live(&self, index: u64) -> bool {
        let Some(object) = self.objects.get(&index) else {
            return false;
        };
        matches!(
            self.vat_record(object.owner).map(|vat| vat.state),
            Some(VatState::Active)
        )
    }

    /// Drops one reachable count; hitting zero schedules `dropExports` to
    /// the owner (when the owner can still act on it).
    pub fn dec_object_reachable(&mut self, index: u64, tx: &mut KernelTx) -> Result<(), KernelError> {
        let Some(object) = self.objects.get_mut(&index) else {
            return Ok(());
        };
        object.reachable_count = object.reachable_count.saturating_sub(1);
        let owner = object.owner;
        let hit_zero = object.reachable_count == 0;
        let revoked = object.revoked;
        tx.put_object(index, object)?;
        if hit_zero && !revoked && self.owner_holds_export(index) && self.owner_is_live(index) {
            self.queue.push_back(
                RunQueueItem::GcAction {
                    endpoint: owner,
                    kind: GcActionKind::DropExports,
                    krefs: vec![KRef::Object(index)],
                },
                tx,
            )?;
        }
        Ok(())
    }

    /// Drops one recognizable count; hitting zero schedules `retireExports`
    /// to a live owner, or deletes the record outright when the owner is
    /// gone or the object was revoked.
    pub fn dec_object_recognizable(
        &mut self,
        index: u64,
        tx: &mut KernelTx,
    ) -> Result<(), KernelError> {
        let Some(object) = self.objects.get_mut(&index) else {
            return Ok(());
        };
        object.recognizable_count = object.recognizable_count.saturating_sub(1);
        let owner = object.owner;
        let hit_zero = object.recognizable_count == 0;
        let revoked = object.revoked;
        tx.put_object(index, object)?;
        if !hit_zero {
            return Ok(());
        }
        if !revoked && self.owner_holds_export(index) && self.owner_is_live(index) {
            self.queue.push_back(
                RunQueueItem::GcAction {
                    endpoint: owner,
                    kind: GcActionKind::RetireExports,
                    krefs: vec![KRef::Object(index)],
                },
                tx,
            )?;
        } else if !self.owner_holds_export(index) {
            // Nobody remembers the identity and the owner already let go.
            self.objects.remove(&index);
            tx.delete_object(index);
            debug!("Freed object ko{index}");
        }
        Ok(())
    }

    /// References a queued message holds: its result promise plus every
    /// promise slot. Object slots are tracked purely through c-lists.
    pub fn inc_message_refs(&mut self, message: &Message, tx: &mut KernelTx) -> Result<(), KernelError> {
        if let Some(KRef::Promise(index)) = message.result {
            self.inc_promise_ref(index, tx)?;
        }
        for index in promise_slots(&message.methargs) {
            self.inc_promise_ref(index, tx)?;
        }
        Ok(())
    }

    pub fn dec_message_refs(&mut self, message: &Message, tx: &mut KernelTx) -> Result<(), KernelError> {
        if let Some(KRef::Promise(index)) = message.result {
            self.dec_promise_ref(index, tx)?;
        }
        for index in promise_slots(&message.methargs) {
            self.dec_promise_ref(index, tx)?;
        }
        Ok(())
    }

    fn inc_value_refs(&mut self, value: &CapData, tx: &mut KernelTx) -> Result<(), KernelError> {
        for index in promise_slots(value) {
            self.inc_promise_ref(index, tx)?;
        }
        Ok(())
    }

    fn dec_value_refs(&mut self, value: &CapData, tx: &mut KernelTx) -> Result<(), KernelError> {
        for index in promise_slots(value) {
            self.dec_promise_ref(index, tx)?;
        }
        Ok(())
    }

    /// Routes a kernel-space message at a target: objects enqueue a send,
    /// unresolved promises queue the message on themselves, settled promises
    /// forward to their resolution (or reject the result).
    pub fn kernel_send(
        &mut self,
        target: KRef,
        message: Message,
        tx: &mut KernelTx,
    ) -> Result<(), KernelError> {
        let mut target = target;
        // Bounds pathological promise-chain cycles (kpA resolved to kpB
        // resolved back to kpA).
        let mut hops = 0u32;
        loop {
            hops += 1;
            if hops > 64 {
                if let Some(KRef::Promise(result)) = message.result {
                    self.reject_promise(
                        result,
                        &MarshaledError::new("promise resolution chain is too deep"),
                        tx,
                    )?;
                }
                return Ok(());
            }
            match target {
                KRef::Object(_) => {
                    self.inc_message_refs(&message, tx)?;
                    self.queue
                        .push_back(RunQueueItem::Send { target, message }, tx)?;
                    return Ok(());
                }
                KRef::Promise(index) => {
                    let Some(promise) = self.promises.get(&index) else {
                        if let Some(KRef::Promise(result)) = message.result {
                            self.reject_promise(
                                result,
                                &MarshaledError::with_code(
                                    format!("{target} does not exist"),
                                    ocapd_common::error::ErrorCode::InvalidReference,
                                ),
                                tx,
                            )?;
                        }
                        return Ok(());
                    };
                    match promise.state {
                        PromiseState::Unresolved => {
                            self.inc_message_refs(&message, tx)?;
                            let promise = self
                                .promises
                                .get_mut(&index)
                                .ok_or_else(|| KernelError::InvalidReference(target.to_string()))?;
                            promise.queue.push(message);
                            tx.put_promise(index, promise)?;
                            return Ok(());
                        }
                        PromiseState::Fulfilled => {
                            let value = promise.value.clone().unwrap_or_else(CapData::empty);
                            match resolution_target(&value) {
                                Some(next) => {
                                    target = next;
                                    continue;
                                }
                                None => {
                                    if let Some(KRef::Promise(result)) = message.result {
                                        self.reject_promise(
                                            result,
                                            &MarshaledError::new(
                                                "cannot deliver to a non-capability resolution",
                                            ),
                                            tx,
                                        )?;
                                    }
                                    return Ok(());
                                }
                            }
                        }
                        PromiseState::Rejected => {
                            let value = promise.value.clone().unwrap_or_else(CapData::empty);
                            if let Some(KRef::Promise(result)) = message.result {
                                self.resolve_promise(result, true, value, tx)?;
                            }
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    pub fn reject_promise(
        &mut self,
        index: u64,
        error: &MarshaledError,
        tx: &mut KernelTx,
    ) -> Result<(), KernelError> {
        self.resolve_promise(index, true, error.to_capdata(), tx)
    }

    /// Settles a promise. The promise's queued backlog and the state flip
    /// happen in the same transaction: fulfilled-to-capability backlogs are
    /// spliced at the run-queue head in FIFO order, rejections and data
    /// resolutions reject each backlog message's result, and every
    /// subscriber gets a notify.
    pub fn resolve_promise(
        &mut self,
        index: u64,
        rejected: bool,
        value: CapData,
        tx: &mut KernelTx,
    ) -> Result<(), KernelError> {
        let mut work = vec![(index, rejected, value)];
        while let Some((index, rejected, value)) = work.pop() {
            let Some(promise) = self.promises.get_mut(&index) else {
                continue;
            };
            if promise.is_settled() {
                continue;
            }
            promise.state = if rejected {
                PromiseState::Rejected
            } else {
                PromiseState::Fulfilled
            };
            promise.decider = None;
            promise.value = Some(value.clone());
            let queued = mem::take(&mut promise.queue);
            let subscribers = mem::take(&mut promise.subscribers);
            tx.put_promise(index, promise)?;

            // The settled record keeps its resolution's promise slots alive.
            self.inc_value_refs(&value, tx)?;

            if rejected {
                // Error contagion: the backlog's results inherit the
                // rejection.
                for message in queued {
                    if let Some(KRef::Promise(result)) = message.result {
                        work.push((result, true, value.clone()));
                    }
                    self.dec_message_refs(&message, tx)?;
                }
            } else {
                match resolution_target(&value) {
                    Some(KRef::Object(object)) => {
                        let spliced: Vec<RunQueueItem> = queued
                            .into_iter()
                            .map(|message| RunQueueItem::Send {
                                target: KRef::Object(object),
                                message,
                            })
                            .collect();
                        self.queue.splice_front(spliced, tx)?;
                    }
                    Some(KRef::Promise(next)) => {
                        for message in queued {
                            self.dec_message_refs(&message, tx)?;
                            self.kernel_send(KRef::Promise(next), message, tx)?;
                        }
                    }
                    None => {
                        for message in queued {
                            if let Some(KRef::Promise(result)) = message.result {
                                work.push((
                                    result,
                                    true,
                                    MarshaledError::new(
                                        "cannot deliver to a non-capability resolution",
                                    )
                                    .to_capdata(),
                                ));
                            }
                            self.dec_message_refs(&message, tx)?;
                        }
                    }
                }
            }

            for subscriber in subscribers {
                self.inc_promise_ref(index, tx)?;
                self.queue.push_back(
                    RunQueueItem::Notify {
                        endpoint: subscriber,
                        kpid: KRef::Promise(index),
                    },
                    tx,
                )?;
            }

            // Operator pins survive settlement: the external holder is
            // still entitled to read the outcome.
            self.maybe_free_promise(index, tx)?;
        }
        Ok(())
    }
}

/// The capability a fulfilled value stands for, when it is exactly one slot.
fn resolution_target(value: &CapData) -> Option<KRef> {
    value.as_single_slot()?.parse().ok()
}

fn promise_slots(capdata: &CapData) -> Vec<u64> {
    capdata
        .slots
        .iter()
        .filter_map(|slot| match slot.parse() {
            Ok(KRef::Promise(index)) => Some(index),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ocapd_common::state::EndpointRecord;
    use ocapd_common::state::VatRecord;

    fn data_with_vat(vat: EndpointId) -> KernelData {
        let mut data = KernelData::new();
        data.endpoints.insert(
            vat,
            EndpointRecord {
                id: vat,
                next_export_object_id: 1,
                next_export_promise_id: 1,
                vat: Some(VatRecord {
                    subcluster_id: None,
                    root: None,
                    bundle_spec: "test.bundle".into(),
                    parameters: None,
                    creation_options: None,
                    state: VatState::Active,
                    deliveries_since_boyd: 0,
                }),
            },
        );
        data
    }

    fn msg(result: Option<KRef>) -> Message {
        Message {
            methargs: CapData::methargs("poke", vec![], vec![]).expect("valid"),
            result,
        }
    }

    #[test]
    fn sends_to_unresolved_promises_queue_on_the_promise() {
        let vat = EndpointId::Vat(1);
        let mut data = data_with_vat(vat);
        let mut tx = KernelTx::new();
        let kp = data.alloc_promise(Some(vat), &mut tx).expect("alloc");
        let KRef::Promise(p) = kp else { panic!() };

        data.kernel_send(kp, msg(None), &mut tx).expect("send");
        assert_eq!(data.promises[&p].queue.len(), 1);
        assert_eq!(data.queue.depth(), 0);
    }

    #[test]
    fn resolution_splices_backlog_ahead_of_the_queue() {
        let vat = EndpointId::Vat(1);
        let mut data = data_with_vat(vat);
        let mut tx = KernelTx::new();
        let kp = data.alloc_promise(Some(vat), &mut tx).expect("alloc");
        let KRef::Promise(p) = kp else { panic!() };
        let ko = data.alloc_object(vat, &mut tx).expect("alloc");

        data.kernel_send(kp, msg(None), &mut tx).expect("send");
        data.kernel_send(kp, msg(None), &mut tx).expect("send");
        // Something else is already waiting in the run queue.
        data.queue
            .push_back(
                RunQueueItem::BringOutYourDead { endpoint: vat },
                &mut tx,
            )
            .expect("push");

        data.resolve_promise(p, false, CapData::single_slot(ko.to_string()), &mut tx)
            .expect("resolve");

        let kinds: Vec<&RunQueueItem> = data.queue.iter().map(|(_, item)| item).collect();
        assert!(matches!(kinds[0], RunQueueItem::Send { target, .. } if *target == ko));
        assert!(matches!(kinds[1], RunQueueItem::Send { target, .. } if *target == ko));
        assert!(matches!(kinds[2], RunQueueItem::BringOutYourDead { .. }));
    }

    #[test]
    fn rejection_contaminates_backlog_results() {
        let vat = EndpointId::Vat(1);
        let mut data = data_with_vat(vat);
        let mut tx = KernelTx::new();
        let kp = data.alloc_promise(Some(vat), &mut tx).expect("alloc");
        let KRef::Promise(p) = kp else { panic!() };
        let result = data.alloc_promise(None, &mut tx).expect("alloc");
        let KRef::Promise(r) = result else { panic!() };

        data.kernel_send(kp, msg(Some(result)), &mut tx).expect("send");
        let rejection = MarshaledError::vat_deleted(vat).to_capdata();
        data.resolve_promise(p, true, rejection.clone(), &mut tx)
            .expect("resolve");

        let inherited = &data.promises[&r];
        assert_eq!(inherited.state, PromiseState::Rejected);
        assert_eq!(inherited.value, Some(rejection));
    }

    #[test]
    fn send_to_settled_promise_retargets_to_resolution() {
        let vat = EndpointId::Vat(1);
        let mut data = data_with_vat(vat);
        let mut tx = KernelTx::new();
        let kp = data.alloc_promise(Some(vat), &mut tx).expect("alloc");
        let KRef::Promise(p) = kp else { panic!() };
        let ko = data.alloc_object(vat, &mut tx).expect("alloc");
        data.resolve_promise(p, false, CapData::single_slot(ko.to_string()), &mut tx)
            .expect("resolve");

        data.kernel_send(kp, msg(None), &mut tx).expect("send");
        assert!(matches!(
            data.queue.peek().map(|(_, item)| item),
            Some(RunQueueItem::Send { target, .. }) if *target == ko
        ));
    }

    #[test]
    fn subscribers_are_notified_on_resolution() {
        let vat = EndpointId::Vat(1);
        let other = EndpointId::Vat(2);
        let mut data = data_with_vat(vat);
        let mut tx = KernelTx::new();
        let kp = data.alloc_promise(Some(vat), &mut tx).expect("alloc");
        let KRef::Promise(p) = kp else { panic!() };
        if let Some(promise) = data.promises.get_mut(&p) {
            promise.subscribers.insert(other);
        }

        data.resolve_promise(p, false, CapData::empty(), &mut tx)
            .expect("resolve");
        assert!(matches!(
            data.queue.peek().map(|(_, item)| item),
            Some(RunQueueItem::Notify { endpoint, kpid })
                if *endpoint == other && *kpid == kp
        ));
        // The notify item itself keeps the settled promise alive.
        assert!(data.promises.contains_key(&p));
    }

    #[test]
    fn settled_unreferenced_promises_are_freed() {
        let vat = EndpointId::Vat(1);
        let mut data = data_with_vat(vat);
        let mut tx = KernelTx::new();
        let kp = data.alloc_promise(Some(vat), &mut tx).expect("alloc");
        let KRef::Promise(p) = kp else { panic!() };

        data.resolve_promise(p, false, CapData::empty(), &mut tx)
            .expect("resolve");
        assert!(!data.promises.contains_key(&p));
    }

    #[test]
    fn reachable_zero_schedules_drop_exports_to_owner() {
        let vat = EndpointId::Vat(1);
        let importer = EndpointId::Vat(2);
        let mut data = data_with_vat(vat);
        data.endpoints.insert(
            importer,
            EndpointRecord {
                id: importer,
                next_export_object_id: 1,
                next_export_promise_id: 1,
                vat: Some(VatRecord {
                    subcluster_id: None,
                    root: None,
                    bundle_spec: "other.bundle".into(),
                    parameters: None,
                    creation_options: None,
                    state: VatState::Active,
                    deliveries_since_boyd: 0,
                }),
            },
        );
        let mut tx = KernelTx::new();

        // The owner exports, the importer imports (counts go to 1).
        let eref = ocapd_common::refs::ERef::object_export(ocapd_common::refs::RefSpace::Vat, 0);
        let ko = data.import_to_kernel(vat, eref, &mut tx).expect("mint");
        let KRef::Object(o) = ko else { panic!() };
        data.export_to_endpoint(importer, ko, &mut tx).expect("export");
        assert_eq!(data.objects[&o].reachable_count, 1);

        data.dec_object_reachable(o, &mut tx).expect("dec");
        assert!(matches!(
            data.queue.peek().map(|(_, item)| item),
            Some(RunQueueItem::GcAction {
                endpoint,
                kind: GcActionKind::DropExports,
                ..
            }) if *endpoint == vat
        ));
    }
}

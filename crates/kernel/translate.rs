//! The c-list translator: the only code that moves references between the
//! kernel space and an endpoint space.
//!
//! Kernel-to-endpoint (export direction) allocates fresh import erefs on
//! first sight from the endpoint's persisted counters. Endpoint-to-kernel
//! (import direction) accepts an endpoint-minted `+` ref by allocating a
//! kernel identity for it; an unknown `-` ref is a protocol violation and
//! breaks the vat.

use ocapd_common::capdata::CapData;
use ocapd_common::refs::{ERef, EndpointId, KRef, RefDirection, RefKind};
use ocapd_common::state::ClistEntry;
use ocapd_storage::KernelTx;

use crate::error::KernelError;
use crate::state::KernelData;

impl KernelData {
    /// Translates a kernel ref into `endpoint`'s space, minting an import
    /// entry (direction `-` from the endpoint's perspective) on first sight.
    /// A new object import contributes to both distributed ref counts.
    pub fn export_to_endpoint(
        &mut self,
        endpoint: EndpointId,
        kref: KRef,
        tx: &mut KernelTx,
    ) -> Result<ERef, KernelError> {
        if let Some(entry) = self.clists.get(&endpoint).and_then(|c| c.entry(kref)) {
            return Ok(entry.eref);
        }

        let record = self
            .endpoints
            .get_mut(&endpoint)
            .ok_or(KernelError::VatNotFound(endpoint))?;
        let index = match kref.kind() {
            RefKind::Object => {
                let index = record.next_export_object_id;
                record.next_export_object_id += 1;
                index
            }
            RefKind::Promise => {
                let index = record.next_export_promise_id;
                record.next_export_promise_id += 1;
                index
            }
        };
        tx.put_endpoint(record)?;

        let eref = ERef::new(endpoint.space(), kref.kind(), RefDirection::Import, index);
        let entry = ClistEntry {
            eref,
            reachable: matches!(kref, KRef::Object(_)),
        };
        tx.put_clist(endpoint, kref, &entry)?;
        self.clist_mut(endpoint).insert(kref, entry);

        match kref {
            KRef::Object(n) => {
                let object = self
                    .objects
                    .get_mut(&n)
                    .ok_or_else(|| KernelError::InvalidReference(kref.to_string()))?;
                object.reachable_count += 1;
                object.recognizable_count += 1;
                tx.put_object(n, object)?;
            }
            KRef::Promise(n) => {
                let promise = self
                    .promises
                    .get_mut(&n)
                    .ok_or_else(|| KernelError::InvalidReference(kref.to_string()))?;
                promise.ref_count += 1;
                tx.put_promise(n, promise)?;
            }
        }
        Ok(eref)
    }

    /// Translates an endpoint ref into kernel space. An unknown ref bearing
    /// the endpoint's own export tag allocates a fresh kernel identity owned
    /// (or decided) by that endpoint; an unknown import tag is a hard
    /// protocol error.
    pub fn import_to_kernel(
        &mut self,
        endpoint: EndpointId,
        eref: ERef,
        tx: &mut KernelTx,
    ) -> Result<KRef, KernelError> {
        if eref.space != endpoint.space() {
            return Err(KernelError::BadSyscall {
                vat: endpoint,
                reason: format!("{eref} does not belong to {endpoint}'s space"),
            });
        }
        if let Some(kref) = self.clists.get(&endpoint).and_then(|c| c.lookup_eref(eref)) {
            return Ok(kref);
        }
        match eref.direction {
            RefDirection::Import => Err(KernelError::BadSyscall {
                vat: endpoint,
                reason: format!("{eref} was never imported by {endpoint}"),
            }),
            RefDirection::Export => {
                let kref = match eref.kind {
                    RefKind::Object => self.alloc_object(endpoint, tx)?,
                    RefKind::Promise => self.alloc_promise(Some(endpoint), tx)?,
                };
                let entry = ClistEntry {
                    eref,
                    reachable: false,
                };
                tx.put_clist(endpoint, kref, &entry)?;
                self.clist_mut(endpoint).insert(kref, entry);
                if let KRef::Promise(n) = kref {
                    let promise = self
                        .promises
                        .get_mut(&n)
                        .ok_or_else(|| KernelError::InvalidReference(kref.to_string()))?;
                    promise.ref_count += 1;
                    tx.put_promise(n, promise)?;
                }
                Ok(kref)
            }
        }
    }

    /// Rewrites every capdata slot into the endpoint's space.
    pub fn translate_capdata_to_endpoint(
        &mut self,
        endpoint: EndpointId,
        capdata: &CapData,
        tx: &mut KernelTx,
    ) -> Result<CapData, KernelError> {
        capdata.map_slots(|slot| {
            let kref: KRef = slot
                .parse()
                .map_err(|_| KernelError::InvalidReference(slot.to_string()))?;
            Ok(self.export_to_endpoint(endpoint, kref, tx)?.to_string())
        })
    }

    /// Rewrites every capdata slot from the endpoint's space into kernel
    /// refs, applying the import-direction rules.
    pub fn translate_capdata_to_kernel(
        &mut self,
        endpoint: EndpointId,
        capdata: &CapData,
        tx: &mut KernelTx,
    ) -> Result<CapData, KernelError> {
        capdata.validate().map_err(|e| KernelError::BadSyscall {
            vat: endpoint,
            reason: format!("malformed capdata: {e}"),
        })?;
        capdata.map_slots(|slot| {
            let eref: ERef = slot.parse().map_err(|_| KernelError::BadSyscall {
                vat: endpoint,
                reason: format!("malformed reference {slot}"),
            })?;
            Ok(self.import_to_kernel(endpoint, eref, tx)?.to_string())
        })
    }
}

//! Subcluster management: launching a declaratively-configured group of
//! vats, wiring the bootstrap vat up with everyone's roots, and tearing the
//! whole group down.

use std::collections::BTreeMap;

use ocapd_common::capdata::CapData;
use ocapd_common::message::{Message, RunQueueItem};
use ocapd_common::refs::{ERef, EndpointId, KRef};
use ocapd_common::state::{ClistEntry, EndpointRecord, SubclusterRecord, VatRecord, VatState};
use ocapd_common::subcluster::{SubclusterConfig, VatSpec};
use ocapd_storage::KernelTx;
use serde_json::{Map, Value, json};
use tracing::info;

use crate::command::{LaunchedSubcluster, LaunchedVat};
use crate::error::KernelError;
use crate::state::{COUNTER_SUBCLUSTER, COUNTER_VAT};
use crate::Kernel;

impl Kernel {
    /// Creates a vat: endpoint record, root object pre-installed as `o+0`,
    /// a live worker, and the `startVat` item that will be its first
    /// delivery.
    pub(crate) async fn create_vat(
        &mut self,
        spec: &VatSpec,
        subcluster_id: Option<&str>,
        tx: &mut KernelTx,
    ) -> Result<(EndpointId, KRef), KernelError> {
        let vat = EndpointId::Vat(self.data.next_vat_id);
        self.data.next_vat_id += 1;
        tx.set_counter(COUNTER_VAT, self.data.next_vat_id);

        self.data.endpoints.insert(
            vat,
            EndpointRecord {
                id: vat,
                next_export_object_id: 1,
                next_export_promise_id: 1,
                vat: Some(VatRecord {
                    subcluster_id: subcluster_id.map(str::to_string),
                    root: None,
                    bundle_spec: spec.bundle_spec.clone(),
                    parameters: spec.parameters.clone(),
                    creation_options: spec.creation_options.clone(),
                    state: VatState::Active,
                    deliveries_since_boyd: 0,
                }),
            },
        );

        let root = self.data.alloc_object(vat, tx)?;
        if let Some(record) = self.data.vat_record_mut(vat) {
            record.root = Some(root);
        }
        if let Some(record) = self.data.endpoints.get(&vat) {
            tx.put_endpoint(record)?;
        }

        let entry = ClistEntry {
            eref: ERef::object_export(vat.space(), 0),
            reachable: false,
        };
        tx.put_clist(vat, root, &entry)?;
        self.data.clist_mut(vat).insert(root, entry);

        self.workers.spawn(vat, spec).await?;
        self.data
            .queue
            .push_back(RunQueueItem::StartVat { vat_id: vat }, tx)?;
        info!("Created vat {vat} (root {root}, bundle {})", spec.bundle_spec);
        Ok((vat, root))
    }

    pub async fn launch_subcluster(
        &mut self,
        config: SubclusterConfig,
    ) -> Result<LaunchedSubcluster, KernelError> {
        config.validate().map_err(KernelError::InvalidConfig)?;
        let mut tx = KernelTx::new();
        let mut spawned: Vec<EndpointId> = Vec::new();
        match self.launch_subcluster_inner(&config, &mut tx, &mut spawned).await {
            Ok(launched) => match self.commit_or_reload(tx).await {
                Ok(()) => Ok(launched),
                Err(err) => {
                    for vat in spawned {
                        self.workers.terminate(vat).await;
                    }
                    Err(err)
                }
            },
            Err(err) => {
                // Uncommitted: drop the half-built image and the workers.
                for vat in spawned {
                    self.workers.terminate(vat).await;
                }
                self.reload_data().await?;
                Err(err)
            }
        }
    }

    async fn launch_subcluster_inner(
        &mut self,
        config: &SubclusterConfig,
        tx: &mut KernelTx,
        spawned: &mut Vec<EndpointId>,
    ) -> Result<LaunchedSubcluster, KernelError> {
        let id = format!("s{}", self.data.next_subcluster_id);
        self.data.next_subcluster_id += 1;
        tx.set_counter(COUNTER_SUBCLUSTER, self.data.next_subcluster_id);
        info!("Launching subcluster {id} ({} vats)", config.vats.len());

        let mut vats: BTreeMap<String, EndpointId> = BTreeMap::new();
        let mut roots: Vec<(String, KRef)> = Vec::new();
        for (name, spec) in &config.vats {
            let (vat, root) = self.create_vat(spec, Some(&id), tx).await?;
            spawned.push(vat);
            vats.insert(name.clone(), vat);
            roots.push((name.clone(), root));
        }

        let root_kref = roots
            .iter()
            .find(|(name, _)| *name == config.bootstrap)
            .map(|(_, root)| *root)
            .ok_or_else(|| KernelError::InvalidConfig("bootstrap vat has no root".to_string()))?;

        // bootstrap(vats, services): every root rides along as a capdata
        // slot, keyed by vat name.
        let mut vats_value = Map::new();
        let mut slots = Vec::with_capacity(roots.len());
        for (index, (name, root)) in roots.iter().enumerate() {
            vats_value.insert(name.clone(), json!({"@qclass": "slot", "index": index}));
            slots.push(root.to_string());
        }
        let services_value = Value::Array(
            config
                .services
                .iter()
                .map(|name| Value::String(name.clone()))
                .collect(),
        );

        let result = self.data.alloc_promise(None, tx)?;
        if let KRef::Promise(index) = result {
            self.data.pins.insert(result);
            self.data.persist_pins(tx)?;
            self.data.inc_promise_ref(index, tx)?;
        }
        let message = Message {
            methargs: CapData::methargs(
                "bootstrap",
                vec![Value::Object(vats_value), services_value],
                slots,
            )?,
            result: Some(result),
        };
        let KRef::Object(_) = root_kref else {
            return Err(KernelError::InvalidConfig(
                "bootstrap root is not an object".to_string(),
            ));
        };
        self.data.kernel_send(root_kref, message, tx)?;

        let record = SubclusterRecord {
            id: id.clone(),
            bootstrap: config.bootstrap.clone(),
            vats,
            root: Some(root_kref),
            config: config.clone(),
        };
        tx.put_subcluster(&record)?;
        self.data.subclusters.insert(id.clone(), record);

        Ok(LaunchedSubcluster {
            subcluster_id: id,
            root_kref,
            result_kpid: result,
        })
    }

    /// Severs every member vat and removes the record. The vats' exports
    /// are revoked and their pending inbound messages rejected as part of
    /// the broken-vat path; the queued `terminateVat` items finish the
    /// cleanup.
    pub async fn terminate_subcluster(&mut self, id: &str) -> Result<(), KernelError> {
        let Some(record) = self.data.subclusters.get(id) else {
            return Err(KernelError::SubclusterNotFound(id.to_string()));
        };
        let vats: Vec<EndpointId> = record.vats.values().copied().collect();
        info!("Terminating subcluster {id} ({} vats)", vats.len());
        let mut tx = KernelTx::new();
        for vat in vats {
            self.mark_vat_broken(vat, &mut tx)?;
        }
        self.data.subclusters.remove(id);
        tx.delete_subcluster(id);
        self.commit_or_reload(tx).await
    }

    /// Launches a single vat outside (or appended to) a subcluster.
    pub async fn launch_vat(
        &mut self,
        spec: VatSpec,
        subcluster_id: Option<String>,
    ) -> Result<LaunchedVat, KernelError> {
        if let Some(id) = &subcluster_id
            && !self.data.subclusters.contains_key(id)
        {
            return Err(KernelError::SubclusterNotFound(id.clone()));
        }
        let mut tx = KernelTx::new();
        let created = self.create_vat(&spec, subcluster_id.as_deref(), &mut tx).await;
        match created {
            Ok((vat, root)) => {
                if let Some(id) = subcluster_id
                    && let Some(record) = self.data.subclusters.get_mut(&id)
                {
                    record.vats.insert(vat.to_string(), vat);
                    tx.put_subcluster(record)?;
                }
                match self.commit_or_reload(tx).await {
                    Ok(()) => Ok(LaunchedVat {
                        vat_id: vat,
                        root_kref: root,
                    }),
                    Err(err) => {
                        self.workers.terminate(vat).await;
                        Err(err)
                    }
                }
            }
            Err(err) => {
                self.reload_data().await?;
                Err(err)
            }
        }
    }
}

//! End-to-end kernel scenarios driven through scripted workers: subcluster
//! bootstrap, promise pipelining, distributed GC, broken vats, commit
//! failure, and crash recovery.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use ocapd_common::capdata::CapData;
use ocapd_common::error::{ErrorCode, MarshaledError};
use ocapd_common::message::{DeliveryPayload, DeliveryResult, Resolution, Syscall};
use ocapd_common::refs::{EndpointId, KRef};
use ocapd_common::state::{PromiseState, VatState};
use ocapd_common::subcluster::{SubclusterConfig, VatSpec};
use ocapd_kernel::{Kernel, KernelOptions};
use ocapd_storage::store_db::in_memory::InMemoryStore;
use ocapd_storage::{Store, StoreEngine, WriteBatch};
use ocapd_worker::{ScriptedWorker, VatWorker, WorkerFactory, WorkerService};
use serde_json::json;

type DeliveryLog = Arc<Mutex<Vec<(u64, DeliveryPayload)>>>;
type Logs = Arc<Mutex<HashMap<EndpointId, DeliveryLog>>>;

/// Worker service whose vats answer from per-bundle scripts; every delivery
/// is recorded per vat id.
fn scripted_service(scripts: &[(&str, Vec<DeliveryResult>)]) -> (WorkerService, Logs) {
    let logs: Logs = Arc::default();
    let scripts: Arc<Mutex<HashMap<String, Vec<DeliveryResult>>>> = Arc::new(Mutex::new(
        scripts
            .iter()
            .map(|(bundle, results)| (bundle.to_string(), results.clone()))
            .collect(),
    ));
    let factory_logs = Arc::clone(&logs);
    let factory: WorkerFactory = Arc::new(move |vat, spec: VatSpec| {
        let logs = Arc::clone(&factory_logs);
        let scripts = Arc::clone(&scripts);
        Box::pin(async move {
            let script = scripts
                .lock()
                .unwrap()
                .remove(&spec.bundle_spec)
                .unwrap_or_default();
            let worker = ScriptedWorker::with_results(script);
            logs.lock().unwrap().insert(vat, worker.log_handle());
            Ok(Box::new(worker) as Box<dyn VatWorker>)
        })
    });
    (WorkerService::new(factory), logs)
}

fn two_vat_config() -> SubclusterConfig {
    serde_json::from_value(json!({
        "bootstrap": "a",
        "vats": {
            "a": {"bundleSpec": "alice.bundle"},
            "b": {"bundleSpec": "bob.bundle"},
        },
    }))
    .unwrap()
}

fn options() -> KernelOptions {
    // Cadence off so delivery counts in the assertions stay exact.
    KernelOptions {
        bring_out_your_dead_interval: 0,
    }
}

fn deliveries(logs: &Logs, vat: EndpointId) -> Vec<DeliveryPayload> {
    logs.lock().unwrap()[&vat]
        .lock()
        .unwrap()
        .iter()
        .map(|(_, payload)| payload.clone())
        .collect()
}

fn methargs(method: &str) -> CapData {
    CapData::methargs(method, vec![], vec![]).unwrap()
}

/// Properties 1 and 2: c-list bijection and ref-count soundness, checked
/// against the live image.
fn assert_invariants(kernel: &Kernel) {
    let data = kernel.data();
    for (endpoint, clist) in &data.clists {
        for (kref, entry) in clist.iter() {
            assert_eq!(
                clist.lookup_eref(entry.eref),
                Some(*kref),
                "c-list bijection broken for {endpoint}: {kref} / {}",
                entry.eref
            );
        }
    }
    for (index, object) in &data.objects {
        let kref = KRef::Object(*index);
        let mut reachable = 0u32;
        let mut recognizable = 0u32;
        for clist in data.clists.values() {
            if let Some(entry) = clist.entry(kref) {
                if entry.reachable {
                    reachable += 1;
                }
                if entry.eref.direction == ocapd_common::refs::RefDirection::Import {
                    recognizable += 1;
                }
            }
        }
        assert_eq!(
            object.reachable_count, reachable,
            "reachable count of {kref} out of sync"
        );
        assert_eq!(
            object.recognizable_count, recognizable,
            "recognizable count of {kref} out of sync"
        );
        assert!(object.reachable_count <= object.recognizable_count);
    }
}

#[tokio::test]
async fn s1_bootstrap_wires_roots_into_the_bootstrap_vat() {
    let (service, logs) = scripted_service(&[("alice.bundle", vec![]), ("bob.bundle", vec![])]);
    let (mut kernel, _handle) = Kernel::new(Store::in_memory(), service, options())
        .await
        .unwrap();

    let launched = kernel.launch_subcluster(two_vat_config()).await.unwrap();
    assert_eq!(launched.subcluster_id, "s1");
    assert_eq!(launched.root_kref, KRef::Object(1));

    kernel.run_to_idle().await.unwrap();

    let status = kernel.status();
    let ids: Vec<EndpointId> = status.vats.iter().map(|vat| vat.id).collect();
    assert_eq!(ids, vec![EndpointId::Vat(1), EndpointId::Vat(2)]);

    let v1 = deliveries(&logs, EndpointId::Vat(1));
    assert!(matches!(
        &v1[0],
        DeliveryPayload::StartVat { bundle_spec, .. } if bundle_spec == "alice.bundle"
    ));
    let DeliveryPayload::Message {
        target, methargs, ..
    } = &v1[1]
    else {
        panic!("expected the bootstrap message, got {:?}", v1[1]);
    };
    assert_eq!(target, "vo+0");
    // v2's root crosses as a fresh import in v1's space.
    assert_eq!(methargs.slots, vec!["vo+0".to_string(), "vo-1".to_string()]);

    let v2 = deliveries(&logs, EndpointId::Vat(2));
    assert_eq!(v2.len(), 1);
    assert!(matches!(
        &v2[0],
        DeliveryPayload::StartVat { bundle_spec, .. } if bundle_spec == "bob.bundle"
    ));

    assert_invariants(&kernel);
}

#[tokio::test]
async fn s2_pipelined_send_queues_on_the_promise_then_retargets() {
    let alice_script = vec![
        DeliveryResult::ok(), // startVat
        DeliveryResult::with_syscalls(vec![
            Syscall::Send {
                target: "vo-1".into(),
                methargs: methargs("foo"),
                result: Some("vp+1".into()),
            },
            Syscall::Send {
                target: "vp+1".into(),
                methargs: methargs("bar"),
                result: Some("vp+2".into()),
            },
        ]),
    ];
    let bob_script = vec![
        DeliveryResult::ok(), // startVat
        DeliveryResult::with_syscalls(vec![Syscall::Resolve {
            resolutions: vec![Resolution {
                kpid: "vp-1".into(),
                rejected: false,
                value: CapData::single_slot("vo+7"),
            }],
        }]),
    ];
    let (service, logs) =
        scripted_service(&[("alice.bundle", alice_script), ("bob.bundle", bob_script)]);
    let (mut kernel, _handle) = Kernel::new(Store::in_memory(), service, options())
        .await
        .unwrap();
    kernel.launch_subcluster(two_vat_config()).await.unwrap();

    // Cycles: startVat v1, startVat v2, bootstrap delivery (emits both
    // sends).
    for _ in 0..3 {
        kernel.process_next().await.unwrap();
    }
    // foo is a run-queue item; bar is parked on foo's unresolved result.
    let foo_result = kernel.data().promises.get(&2).expect("result promise");
    assert_eq!(foo_result.queue.len(), 1);
    assert_eq!(kernel.data().queue.depth(), 1);

    kernel.run_to_idle().await.unwrap();

    let v2 = deliveries(&logs, EndpointId::Vat(2));
    let DeliveryPayload::Message {
        target: foo_target,
        result: foo_result,
        ..
    } = &v2[1]
    else {
        panic!("expected foo, got {:?}", v2[1]);
    };
    assert_eq!(foo_target, "vo+0");
    assert_eq!(foo_result.as_deref(), Some("vp-1"));

    // bar was re-targeted to the resolution object and delivered to its
    // owner.
    let DeliveryPayload::Message {
        target: bar_target,
        methargs: bar_methargs,
        ..
    } = &v2[2]
    else {
        panic!("expected bar, got {:?}", v2[2]);
    };
    assert_eq!(bar_target, "vo+7");
    assert!(bar_methargs.body.contains("bar"));

    // The sender hears about the resolution it subscribed to.
    let v1 = deliveries(&logs, EndpointId::Vat(1));
    let DeliveryPayload::Notify { resolutions } = &v1[2] else {
        panic!("expected a notify, got {:?}", v1[2]);
    };
    assert_eq!(resolutions[0].kpid, "vp+1");
    assert!(!resolutions[0].rejected);

    assert_invariants(&kernel);
}

#[tokio::test]
async fn s3_drop_then_retire_propagates_to_the_owner() {
    let alice_script = vec![
        DeliveryResult::ok(),
        DeliveryResult::with_syscalls(vec![
            Syscall::DropImports {
                erefs: vec!["vo-1".into()],
            },
            Syscall::RetireImports {
                erefs: vec!["vo-1".into()],
            },
        ]),
    ];
    let (service, logs) =
        scripted_service(&[("alice.bundle", alice_script), ("bob.bundle", vec![])]);
    let (mut kernel, _handle) = Kernel::new(Store::in_memory(), service, options())
        .await
        .unwrap();
    kernel.launch_subcluster(two_vat_config()).await.unwrap();
    kernel.run_to_idle().await.unwrap();

    let v2 = deliveries(&logs, EndpointId::Vat(2));
    let gc: Vec<&DeliveryPayload> = v2
        .iter()
        .filter(|payload| {
            matches!(
                payload,
                DeliveryPayload::DropExports { .. } | DeliveryPayload::RetireExports { .. }
            )
        })
        .collect();
    // Property 6: drop strictly before retire, both for the owner's `o+0`.
    assert_eq!(gc.len(), 2);
    assert!(matches!(
        gc[0],
        DeliveryPayload::DropExports { erefs } if erefs == &vec!["vo+0".to_string()]
    ));
    assert!(matches!(
        gc[1],
        DeliveryPayload::RetireExports { erefs } if erefs == &vec!["vo+0".to_string()]
    ));

    // The fully-retired object is gone from the kernel table.
    assert!(!kernel.data().objects.contains_key(&2));
    assert_invariants(&kernel);
}

#[tokio::test]
async fn s4_bad_syscall_breaks_the_vat_and_rejects_its_promises() {
    let alice_script = vec![
        DeliveryResult::ok(), // startVat
        DeliveryResult::ok(), // bootstrap
        // Minting an import-direction ref it never received is a protocol
        // violation.
        DeliveryResult::with_syscalls(vec![Syscall::Send {
            target: "vo-9".into(),
            methargs: methargs("evil"),
            result: None,
        }]),
    ];
    let (service, _logs) =
        scripted_service(&[("alice.bundle", alice_script), ("bob.bundle", vec![])]);
    let (mut kernel, _handle) = Kernel::new(Store::in_memory(), service, options())
        .await
        .unwrap();
    let launched = kernel.launch_subcluster(two_vat_config()).await.unwrap();
    kernel.run_to_idle().await.unwrap();

    // Operator pokes v1's root; the delivery answers with the bad syscall.
    let poke_result = kernel
        .queue_message(launched.root_kref, "poke", vec![])
        .await
        .unwrap();
    kernel.run_to_idle().await.unwrap();

    // The poke's result promise was decided by the broken vat.
    let KRef::Promise(poke_index) = poke_result else {
        panic!("queueMessage must return a promise");
    };
    let promise = kernel.data().promises.get(&poke_index).expect("pinned");
    assert_eq!(promise.state, PromiseState::Rejected);
    let rejection = MarshaledError::from_capdata(promise.value.as_ref().unwrap()).unwrap();
    assert_eq!(rejection.code, Some(ErrorCode::VatDeleted));

    // The bootstrap result promise suffered the same fate.
    let KRef::Promise(bootstrap_index) = launched.result_kpid else {
        panic!("bootstrap result must be a promise");
    };
    let bootstrap_promise = kernel.data().promises.get(&bootstrap_index).expect("pinned");
    assert_eq!(bootstrap_promise.state, PromiseState::Rejected);

    // The terminateVat item ran: v1 is gone, its root object with it, and
    // v2 is untouched.
    let status = kernel.status();
    let ids: Vec<EndpointId> = status.vats.iter().map(|vat| vat.id).collect();
    assert_eq!(ids, vec![EndpointId::Vat(2)]);
    assert!(!kernel.data().objects.contains_key(&1));
    assert_eq!(
        status.vats[0].state,
        VatState::Active,
        "the healthy vat must stay active"
    );
    assert_invariants(&kernel);
}

#[tokio::test]
async fn s6_restart_resumes_the_spliced_delivery() {
    let engine = InMemoryStore::new();

    // First life: run scenario S2 up to (and including) the resolution of
    // foo's result, leaving the re-targeted bar at the queue head.
    {
        let alice_script = vec![
            DeliveryResult::ok(),
            DeliveryResult::with_syscalls(vec![
                Syscall::Send {
                    target: "vo-1".into(),
                    methargs: methargs("foo"),
                    result: Some("vp+1".into()),
                },
                Syscall::Send {
                    target: "vp+1".into(),
                    methargs: methargs("bar"),
                    result: Some("vp+2".into()),
                },
            ]),
        ];
        let bob_script = vec![
            DeliveryResult::ok(),
            DeliveryResult::with_syscalls(vec![Syscall::Resolve {
                resolutions: vec![Resolution {
                    kpid: "vp-1".into(),
                    rejected: false,
                    value: CapData::single_slot("vo+7"),
                }],
            }]),
        ];
        let (service, _logs) =
            scripted_service(&[("alice.bundle", alice_script), ("bob.bundle", bob_script)]);
        let (mut kernel, _handle) =
            Kernel::new(Store::with_engine(Arc::new(engine.clone())), service, options())
                .await
                .unwrap();
        kernel.launch_subcluster(two_vat_config()).await.unwrap();
        for _ in 0..4 {
            kernel.process_next().await.unwrap();
        }
        assert!(kernel.data().queue.depth() >= 1);
        // Kernel dropped here: the crash.
    }

    // Property 8: recovery must not mutate the committed image.
    let before: Vec<(String, Vec<u8>)> = engine.scan_prefix("").await.unwrap();

    let (service, logs) = scripted_service(&[("alice.bundle", vec![]), ("bob.bundle", vec![])]);
    let (mut kernel, _handle) = Kernel::new(
        Store::with_engine(Arc::new(engine.clone())),
        service,
        options(),
    )
    .await
    .unwrap();
    let after: Vec<(String, Vec<u8>)> = engine.scan_prefix("").await.unwrap();
    assert_eq!(before, after);

    kernel.run_to_idle().await.unwrap();

    // The restored queue delivers bar to the resolution's owner, exactly as
    // the pre-crash kernel would have.
    let v2 = deliveries(&logs, EndpointId::Vat(2));
    let DeliveryPayload::Message {
        target, methargs, ..
    } = &v2[0]
    else {
        panic!("expected bar after recovery, got {:?}", v2[0]);
    };
    assert_eq!(target, "vo+7");
    assert!(methargs.body.contains("bar"));

    let v1 = deliveries(&logs, EndpointId::Vat(1));
    assert!(matches!(&v1[0], DeliveryPayload::Notify { .. }));

    assert_invariants(&kernel);
}

/// Engine that injects a burst of commit failures on demand.
#[derive(Debug, Clone)]
struct FlakyEngine {
    inner: InMemoryStore,
    failures: Arc<AtomicUsize>,
}

#[async_trait::async_trait]
impl StoreEngine for FlakyEngine {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, ocapd_storage::StoreError> {
        self.inner.get(key).await
    }

    async fn scan_prefix(
        &self,
        prefix: &str,
    ) -> Result<Vec<(String, Vec<u8>)>, ocapd_storage::StoreError> {
        self.inner.scan_prefix(prefix).await
    }

    async fn commit(&self, batch: WriteBatch) -> Result<(), ocapd_storage::StoreError> {
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ocapd_storage::StoreError::Custom(
                "injected commit failure".to_string(),
            ));
        }
        self.inner.commit(batch).await
    }
}

#[tokio::test]
async fn failed_cycle_commit_breaks_the_target_vat_not_the_kernel() {
    let failures = Arc::new(AtomicUsize::new(0));
    let engine = FlakyEngine {
        inner: InMemoryStore::new(),
        failures: Arc::clone(&failures),
    };
    let (service, _logs) =
        scripted_service(&[("alice.bundle", vec![]), ("bob.bundle", vec![])]);
    let (mut kernel, _handle) = Kernel::new(
        Store::with_engine(Arc::new(engine)),
        service,
        options(),
    )
    .await
    .unwrap();
    let launched = kernel.launch_subcluster(two_vat_config()).await.unwrap();
    kernel.run_to_idle().await.unwrap();

    let poke = kernel
        .queue_message(launched.root_kref, "poke", vec![])
        .await
        .unwrap();

    // The delivery cycle exhausts every commit retry.
    failures.store(ocapd_storage::COMMIT_RETRIES, Ordering::SeqCst);
    kernel.process_next().await.unwrap();

    // Property 5: the cycle never half-applies. The delivery's target vat
    // is broken, and the in-flight message was rejected rather than lost.
    let KRef::Promise(index) = poke else { panic!() };
    let promise = kernel.data().promises.get(&index).expect("pinned");
    assert_eq!(promise.state, PromiseState::Rejected);

    kernel.run_to_idle().await.unwrap();
    let status = kernel.status();
    assert_eq!(status.vats.len(), 1, "the broken vat was terminated");
    assert_invariants(&kernel);
}

#[tokio::test]
async fn terminate_subcluster_severs_and_removes_the_record() {
    let (service, _logs) =
        scripted_service(&[("alice.bundle", vec![]), ("bob.bundle", vec![])]);
    let (mut kernel, _handle) = Kernel::new(Store::in_memory(), service, options())
        .await
        .unwrap();
    let launched = kernel.launch_subcluster(two_vat_config()).await.unwrap();
    kernel.run_to_idle().await.unwrap();

    kernel
        .terminate_subcluster(&launched.subcluster_id)
        .await
        .unwrap();
    kernel.run_to_idle().await.unwrap();

    let status = kernel.status();
    assert!(status.subclusters.is_empty());
    assert!(status.vats.is_empty());
    assert!(kernel.data().objects.is_empty());
    assert!(matches!(
        kernel.terminate_subcluster("s1").await,
        Err(ocapd_kernel::KernelError::SubclusterNotFound(_))
    ));
}

#[tokio::test]
async fn vatstore_checkpoint_is_partition_scoped_and_persistent() {
    let engine = InMemoryStore::new();
    {
        let alice_script = vec![
            DeliveryResult::ok(),
            DeliveryResult {
                error: None,
                checkpoint: ocapd_common::message::VatCheckpoint {
                    kv_mutations: vec![("seat".into(), "taken".into())],
                    kv_deletions: vec![],
                },
                syscalls: vec![],
            },
        ];
        let (service, _logs) =
            scripted_service(&[("alice.bundle", alice_script), ("bob.bundle", vec![])]);
        let (mut kernel, _handle) =
            Kernel::new(Store::with_engine(Arc::new(engine.clone())), service, options())
                .await
                .unwrap();
        kernel.launch_subcluster(two_vat_config()).await.unwrap();
        kernel.run_to_idle().await.unwrap();
    }

    let store = Store::with_engine(Arc::new(engine));
    assert_eq!(
        store
            .vatstore_get(EndpointId::Vat(1), "seat")
            .await
            .unwrap(),
        Some("taken".to_string())
    );
    assert_eq!(
        store
            .vatstore_get(EndpointId::Vat(2), "seat")
            .await
            .unwrap(),
        None
    );
}

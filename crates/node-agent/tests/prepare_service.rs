use std::sync::Arc;

use api_types::Attributes;
use api_types::Checkpoint;
use api_types::ClaimRecord;
use api_types::ClaimState;
use api_types::DeviceAttribute;
use api_types::DeviceRecord;
use api_types::PrepareDevice;
use api_types::PrepareRequest;
use api_types::PrepareResult;
use api_types::PreparedDevice;
use node_agent::attributes::ATTR_DEVICE_TYPE;
use node_agent::attributes::ATTR_MIG_DEVICE_UUID;
use node_agent::attributes::ATTR_PCI_BUS_ID;
use node_agent::cdi::CdiDeviceIds;
use node_agent::mock::MemoryCheckpointStore;
use node_agent::mock::MemoryLock;
use node_agent::mock::RecordingMigManager;
use node_agent::mock::RecordingVfioManager;
use node_agent::mock::RecordingWriter;
use node_agent::AgentError;
use node_agent::PrepareService;
use node_agent::ServiceConfig;
use similar_asserts::assert_eq;
use test_log::test;
use tokio_util::sync::CancellationToken;

struct Harness {
    store: Arc<MemoryCheckpointStore>,
    lock: Arc<MemoryLock>,
    writer: Arc<RecordingWriter>,
    mig: Arc<RecordingMigManager>,
    vfio: Arc<RecordingVfioManager>,
    service: PrepareService,
}

impl Harness {
    fn new() -> Self {
        Self::with_store(MemoryCheckpointStore::default())
    }

    fn with_store(store: MemoryCheckpointStore) -> Self {
        let store = Arc::new(store);
        let lock = Arc::new(MemoryLock::default());
        let writer = Arc::new(RecordingWriter::default());
        let mig = Arc::new(RecordingMigManager::new("GPU-xyz"));
        let vfio = Arc::new(RecordingVfioManager::default());

        let config = ServiceConfig::new(store.clone(), lock.clone(), writer.clone())
            .with_mig(mig.clone())
            .with_vfio(vfio.clone());

        Self {
            store,
            lock,
            writer,
            mig,
            vfio,
            service: PrepareService::new(config),
        }
    }

    fn claim(&self, claim_id: &str) -> Option<ClaimRecord> {
        self.store.snapshot().claims.get(claim_id).cloned()
    }

    fn assert_lock_balanced(&self) {
        assert_eq!(self.lock.acquired(), self.lock.released());
        assert!(!self.lock.is_held());
    }
}

fn device(name: &str, device_type: &str, pci: &str) -> PrepareDevice {
    PrepareDevice {
        request: "gpu".to_string(),
        pool: "node-a".to_string(),
        device: name.to_string(),
        attributes: Attributes::from([
            (ATTR_DEVICE_TYPE.to_string(), device_type.into()),
            (ATTR_PCI_BUS_ID.to_string(), pci.into()),
        ]),
        ..Default::default()
    }
}

fn mig_request(claim_id: &str) -> PrepareRequest {
    PrepareRequest {
        claim_id: claim_id.to_string(),
        devices: vec![device("mig-p0-s0-n1", "mig", "0000:01:00.0")],
        vfio: false,
    }
}

fn vfio_request(claim_id: &str) -> PrepareRequest {
    PrepareRequest {
        claim_id: claim_id.to_string(),
        devices: vec![device("gpu-0", "physical", "0000:3b:00.0")],
        vfio: true,
    }
}

#[test(tokio::test)]
async fn pipeline_stage_order() {
    let h = Harness::new();
    assert_eq!(
        h.service.stage_names(),
        vec![
            "validate",
            "lock",
            "load-checkpoint",
            "short-circuit",
            "plan",
            "mig-prepare",
            "vfio-prepare",
            "save-started",
            "write-descriptors",
            "save-completed",
            "finalize",
        ]
    );
}

#[test(tokio::test)]
async fn mig_claim_end_to_end() {
    let h = Harness::new();
    let ctx = CancellationToken::new();
    h.writer.respond_with(CdiDeviceIds::from([(
        "mig-p0-s0-n1".to_string(),
        vec!["cdi0".to_string()],
    )]));

    let result = h.service.prepare(&ctx, &mig_request("c1")).await.unwrap();
    assert_eq!(
        result,
        PrepareResult {
            claim_id: "c1".to_string(),
            devices: vec![PreparedDevice {
                request: "gpu".to_string(),
                pool: "node-a".to_string(),
                device: "mig-p0-s0-n1".to_string(),
                cdi_device_ids: vec!["cdi0".to_string()],
            }],
        }
    );

    let prepared = h.mig.prepared();
    assert_eq!(prepared.len(), 1);
    assert_eq!(prepared[0].pci_bus_id, "0000:01:00.0");
    assert_eq!(prepared[0].profile_id, 0);
    assert_eq!(prepared[0].slice_count, 1);

    // the writer sees the MIG device UUID, the stored record keeps the backend state
    let writes = h.writer.writes();
    assert_eq!(writes.len(), 1);
    assert_eq!(
        writes[0].devices[0].attributes.get(ATTR_MIG_DEVICE_UUID),
        Some(&DeviceAttribute::String("GPU-xyz".to_string()))
    );
    let claim = h.claim("c1").unwrap();
    assert_eq!(claim.state, ClaimState::PrepareCompleted);
    assert_eq!(
        claim.devices[0].mig.as_ref().map(|m| m.device_uuid.as_str()),
        Some("GPU-xyz")
    );

    let saved_states: Vec<_> = h
        .store
        .saves()
        .iter()
        .map(|cp| cp.claims["c1"].state)
        .collect();
    assert_eq!(
        saved_states,
        vec![ClaimState::PrepareStarted, ClaimState::PrepareCompleted]
    );

    h.service.unprepare(&ctx, "c1").await.unwrap();
    assert!(h.claim("c1").is_none());
    assert_eq!(h.mig.unprepared().len(), 1);
    assert_eq!(h.mig.unprepared()[0].device_uuid, "GPU-xyz");
    assert_eq!(h.writer.deletes(), vec!["c1".to_string()]);
    h.assert_lock_balanced();
}

#[test(tokio::test)]
async fn prepare_is_idempotent() {
    let h = Harness::new();
    let ctx = CancellationToken::new();
    let request = mig_request("c1");

    let first = h.service.prepare(&ctx, &request).await.unwrap();
    let second = h.service.prepare(&ctx, &request).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(h.mig.prepared().len(), 1);
    assert_eq!(h.writer.writes().len(), 1);
    assert_eq!(h.store.saves().len(), 2);
    assert_eq!(h.lock.acquired(), 2);
    h.assert_lock_balanced();
}

#[test(tokio::test)]
async fn caller_attributes_are_not_modified() {
    let h = Harness::new();
    let request = mig_request("c1");
    let original = request.clone();

    h.service
        .prepare(&CancellationToken::new(), &request)
        .await
        .unwrap();

    assert_eq!(request, original);
    assert!(!request.devices[0]
        .attributes
        .contains_key(ATTR_MIG_DEVICE_UUID));
}

#[test(tokio::test)]
async fn vfio_claim_round_trip() {
    let h = Harness::new();
    let ctx = CancellationToken::new();

    let result = h.service.prepare(&ctx, &vfio_request("c2")).await.unwrap();
    assert_eq!(
        result.devices[0].cdi_device_ids,
        vec!["mock.com/gpu=c2-gpu-0".to_string()]
    );
    assert_eq!(h.vfio.prepared().len(), 1);
    assert_eq!(h.vfio.prepared()[0].pci_bus_id, "0000:3b:00.0");
    assert!(h.mig.prepared().is_empty());

    h.service.unprepare(&ctx, "c2").await.unwrap();
    assert_eq!(h.vfio.unprepared().len(), 1);
    assert!(h.mig.unprepared().is_empty());
    assert!(h.claim("c2").is_none());
    h.assert_lock_balanced();
}

#[test(tokio::test)]
async fn full_gpu_without_vfio_touches_no_backend() {
    let h = Harness::new();
    let ctx = CancellationToken::new();
    let mut request = vfio_request("c3");
    request.vfio = false;
    request.devices[0].share_id = Some("share-1".to_string());

    h.service.prepare(&ctx, &request).await.unwrap();
    h.service.unprepare(&ctx, "c3").await.unwrap();

    assert!(h.vfio.prepared().is_empty());
    assert!(h.vfio.unprepared().is_empty());
    assert_eq!(h.writer.deletes(), vec!["c3".to_string()]);
}

#[test(tokio::test)]
async fn shared_device_rejected_for_vfio() {
    let h = Harness::new();
    let mut request = vfio_request("c4");
    request.devices[0].share_id = Some("share-1".to_string());

    let err = h
        .service
        .prepare(&CancellationToken::new(), &request)
        .await
        .unwrap_err();

    assert!(matches!(err.current_context(), AgentError::Validation { .. }));
    assert!(h.store.saves().is_empty());
    assert!(h.vfio.prepared().is_empty());
    assert!(h.writer.writes().is_empty());
    h.assert_lock_balanced();
}

#[test(tokio::test)]
async fn request_validation() {
    let h = Harness::new();
    let ctx = CancellationToken::new();

    let mut request = mig_request("");
    let err = h.service.prepare(&ctx, &request).await.unwrap_err();
    assert!(matches!(err.current_context(), AgentError::Validation { .. }));

    request.claim_id = "c5".to_string();
    request.devices.clear();
    let err = h.service.prepare(&ctx, &request).await.unwrap_err();
    assert!(matches!(err.current_context(), AgentError::Validation { .. }));

    let err = h.service.unprepare(&ctx, "").await.unwrap_err();
    assert!(matches!(err.current_context(), AgentError::Validation { .. }));

    // validation runs before the lock is taken
    assert_eq!(h.lock.acquired(), 0);
}

#[test(tokio::test)]
async fn descriptor_failure_leaves_claim_started() {
    let h = Harness::new();
    let ctx = CancellationToken::new();
    h.writer.fail_writes(true);

    let err = h.service.prepare(&ctx, &mig_request("c6")).await.unwrap_err();
    assert!(matches!(err.current_context(), AgentError::Descriptor { .. }));
    assert_eq!(h.claim("c6").unwrap().state, ClaimState::PrepareStarted);
    h.assert_lock_balanced();

    // the retry reuses the recorded MIG device and only redoes the descriptor
    h.writer.fail_writes(false);
    let result = h.service.prepare(&ctx, &mig_request("c6")).await.unwrap();
    assert_eq!(result.devices.len(), 1);
    assert_eq!(h.mig.prepared().len(), 1);
    assert_eq!(h.writer.writes().len(), 2);
    assert_eq!(h.claim("c6").unwrap().state, ClaimState::PrepareCompleted);
}

#[test(tokio::test)]
async fn missing_device_in_descriptor_result_fails() {
    let h = Harness::new();
    h.writer.respond_with(CdiDeviceIds::from([(
        "some-other-device".to_string(),
        vec!["cdi0".to_string()],
    )]));

    let err = h
        .service
        .prepare(&CancellationToken::new(), &mig_request("c7"))
        .await
        .unwrap_err();
    assert!(matches!(err.current_context(), AgentError::Descriptor { .. }));
    assert!(err.to_string().contains("mig-p0-s0-n1"));
    assert_eq!(h.claim("c7").unwrap().state, ClaimState::PrepareStarted);
}

#[test(tokio::test)]
async fn backend_failure_keeps_last_saved_checkpoint() {
    let h = Harness::new();
    h.mig.fail_prepare(true);

    let err = h
        .service
        .prepare(&CancellationToken::new(), &mig_request("c8"))
        .await
        .unwrap_err();
    assert!(matches!(err.current_context(), AgentError::Backend { .. }));
    assert!(err.to_string().contains("c8"));
    assert!(h.store.saves().is_empty());
    assert!(h.writer.writes().is_empty());
    h.assert_lock_balanced();
}

#[test(tokio::test)]
async fn unknown_claim_unprepare_is_noop() {
    let h = Harness::new();

    h.service
        .unprepare(&CancellationToken::new(), "missing")
        .await
        .unwrap();

    assert!(h.store.saves().is_empty());
    assert!(h.writer.deletes().is_empty());
    assert!(h.mig.unprepared().is_empty());
    h.assert_lock_balanced();
}

#[test(tokio::test)]
async fn started_claim_unprepare_skips_teardown() {
    let h = Harness::new();
    let ctx = CancellationToken::new();
    h.writer.fail_writes(true);
    h.service.prepare(&ctx, &mig_request("c9")).await.unwrap_err();

    h.service.unprepare(&ctx, "c9").await.unwrap();

    assert_eq!(h.claim("c9").unwrap().state, ClaimState::PrepareStarted);
    assert!(h.mig.unprepared().is_empty());
    assert!(h.writer.deletes().is_empty());
}

#[test(tokio::test)]
async fn backend_unprepare_failure_keeps_claim() {
    let h = Harness::new();
    let ctx = CancellationToken::new();
    h.service.prepare(&ctx, &mig_request("c10")).await.unwrap();
    let saves_before = h.store.saves().len();

    h.mig.fail_unprepare(true);
    let err = h.service.unprepare(&ctx, "c10").await.unwrap_err();
    assert!(matches!(err.current_context(), AgentError::Backend { .. }));
    assert!(h.writer.deletes().is_empty());
    assert_eq!(h.store.saves().len(), saves_before);
    assert_eq!(h.claim("c10").unwrap().state, ClaimState::PrepareCompleted);

    h.mig.fail_unprepare(false);
    h.service.unprepare(&ctx, "c10").await.unwrap();
    assert!(h.claim("c10").is_none());
}

#[test(tokio::test)]
async fn descriptor_delete_failure_keeps_claim() {
    let h = Harness::new();
    let ctx = CancellationToken::new();
    h.service.prepare(&ctx, &vfio_request("c11")).await.unwrap();

    h.writer.fail_deletes(true);
    let err = h.service.unprepare(&ctx, "c11").await.unwrap_err();
    assert!(matches!(err.current_context(), AgentError::Descriptor { .. }));
    assert!(h.claim("c11").is_some());
}

#[test(tokio::test)]
async fn corrupt_completed_claim_fails_loudly() {
    let mut checkpoint = Checkpoint::default();
    checkpoint.claims.insert(
        "c12".to_string(),
        ClaimRecord {
            state: ClaimState::PrepareCompleted,
            devices: vec![DeviceRecord::new("gpu", "node-a", "mig-p0-s0-n1")],
        },
    );
    let h = Harness::with_store(MemoryCheckpointStore::with_checkpoint(checkpoint));

    let err = h
        .service
        .prepare(&CancellationToken::new(), &mig_request("c12"))
        .await
        .unwrap_err();
    assert!(matches!(
        err.current_context(),
        AgentError::DataIntegrity { .. }
    ));
    assert!(h.mig.prepared().is_empty());
    h.assert_lock_balanced();
}

#[test(tokio::test)]
async fn lock_release_failure_is_ignored() {
    let h = Harness::new();
    h.lock.fail_release(true);

    h.service
        .prepare(&CancellationToken::new(), &mig_request("c13"))
        .await
        .unwrap();
    h.service
        .unprepare(&CancellationToken::new(), "c13")
        .await
        .unwrap();
    assert_eq!(h.lock.released(), 2);
}

#[test(tokio::test)]
async fn lock_acquire_failure_aborts_before_load() {
    let h = Harness::new();
    h.lock.fail_acquire(true);
    h.store.fail_loads(true);

    let err = h
        .service
        .prepare(&CancellationToken::new(), &mig_request("c14"))
        .await
        .unwrap_err();
    assert!(matches!(err.current_context(), AgentError::Lock { .. }));
}

#[test(tokio::test)]
async fn persistence_failure_is_reported() {
    let h = Harness::new();
    h.store.fail_saves(true);

    let err = h
        .service
        .prepare(&CancellationToken::new(), &mig_request("c15"))
        .await
        .unwrap_err();
    assert!(matches!(
        err.current_context(),
        AgentError::Persistence { .. }
    ));
    // backend work already happened; nothing rolls it back
    assert_eq!(h.mig.prepared().len(), 1);
    assert!(h.writer.writes().is_empty());
    h.assert_lock_balanced();
}

#[test(tokio::test)]
async fn cancelled_context_fails_without_side_effects() {
    let h = Harness::new();
    let ctx = CancellationToken::new();
    ctx.cancel();

    let err = h.service.prepare(&ctx, &mig_request("c16")).await.unwrap_err();
    assert!(matches!(err.current_context(), AgentError::Cancelled { .. }));
    assert!(h.store.saves().is_empty());
    h.assert_lock_balanced();
}

#[test(tokio::test)]
async fn mig_request_without_mig_manager_is_configuration_error() {
    let store = Arc::new(MemoryCheckpointStore::default());
    let service = PrepareService::new(ServiceConfig::new(
        store.clone(),
        Arc::new(MemoryLock::default()),
        Arc::new(RecordingWriter::default()),
    ));

    let err = service
        .prepare(&CancellationToken::new(), &mig_request("c17"))
        .await
        .unwrap_err();
    assert!(matches!(
        err.current_context(),
        AgentError::Configuration { .. }
    ));
    assert!(store.saves().is_empty());
}

#[test(tokio::test)]
async fn multi_device_claim() {
    let h = Harness::new();
    let ctx = CancellationToken::new();
    let request = PrepareRequest {
        claim_id: "c18".to_string(),
        devices: vec![
            device("mig-p0-s0-n1", "mig", "0000:01:00.0"),
            device("mig-p5-s4-n2", "mig", "0000:01:00.0"),
            device("gpu-1", "physical", "0000:02:00.0"),
        ],
        vfio: false,
    };

    let result = h.service.prepare(&ctx, &request).await.unwrap();
    let devices: Vec<_> = result.devices.iter().map(|d| d.device.as_str()).collect();
    assert_eq!(devices, vec!["mig-p0-s0-n1", "mig-p5-s4-n2", "gpu-1"]);
    assert_eq!(h.mig.prepared().len(), 2);
    assert_eq!(h.mig.prepared()[1].slice_start, 4);

    h.service.unprepare(&ctx, "c18").await.unwrap();
    assert_eq!(h.mig.unprepared().len(), 2);
    assert_eq!(h.writer.deletes().len(), 1);
}

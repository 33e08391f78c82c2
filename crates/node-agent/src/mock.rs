//! In-memory collaborators for tests
//!
//! Every double records the calls it receives so tests can assert on how many
//! backend, descriptor and checkpoint operations a prepare or unprepare made.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;

use api_types::Checkpoint;
use api_types::MigBackendState;
use api_types::MigPrepareRequest;
use api_types::PrepareRequest;
use api_types::VfioBackendState;
use api_types::VfioPrepareRequest;
use tokio_util::sync::CancellationToken;

use crate::backend::MigManager;
use crate::backend::VfioManager;
use crate::cdi::CdiDeviceIds;
use crate::cdi::DeviceInterfaceWriter;
use crate::checkpoint::CheckpointStore;
use crate::error::AgentError;
use crate::error::AgentResult;
use crate::lock::LockRelease;
use crate::lock::NodeLock;

/// Checkpoint held in memory, with switchable load/save failures.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    checkpoint: Mutex<Checkpoint>,
    saves: Mutex<Vec<Checkpoint>>,
    fail_loads: AtomicBool,
    fail_saves: AtomicBool,
}

impl MemoryCheckpointStore {
    pub fn with_checkpoint(checkpoint: Checkpoint) -> Self {
        Self {
            checkpoint: Mutex::new(checkpoint),
            ..Default::default()
        }
    }

    /// Current stored document
    pub fn snapshot(&self) -> Checkpoint {
        self.checkpoint.lock().unwrap().clone()
    }

    /// Every document passed to `save`, oldest first
    pub fn saves(&self) -> Vec<Checkpoint> {
        self.saves.lock().unwrap().clone()
    }

    pub fn fail_loads(&self, enabled: bool) {
        self.fail_loads.store(enabled, Ordering::SeqCst);
    }

    pub fn fail_saves(&self, enabled: bool) {
        self.fail_saves.store(enabled, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self, _ctx: &CancellationToken) -> AgentResult<Checkpoint> {
        if self.fail_loads.load(Ordering::SeqCst) {
            return Err(AgentError::persistence("injected load failure").into());
        }
        Ok(self.snapshot())
    }

    async fn save(&self, _ctx: &CancellationToken, checkpoint: &Checkpoint) -> AgentResult<()> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(AgentError::persistence("injected save failure").into());
        }
        *self.checkpoint.lock().unwrap() = checkpoint.clone();
        self.saves.lock().unwrap().push(checkpoint.clone());
        Ok(())
    }
}

/// In-process lock counting acquisitions and releases.
#[derive(Debug, Default)]
pub struct MemoryLock {
    inner: Arc<tokio::sync::Mutex<()>>,
    counters: Arc<LockCounters>,
    fail_acquire: AtomicBool,
    fail_release: Arc<AtomicBool>,
}

#[derive(Debug, Default)]
struct LockCounters {
    acquired: AtomicUsize,
    released: AtomicUsize,
}

impl MemoryLock {
    pub fn acquired(&self) -> usize {
        self.counters.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.counters.released.load(Ordering::SeqCst)
    }

    /// True while some caller holds the lock
    pub fn is_held(&self) -> bool {
        self.inner.try_lock().is_err()
    }

    pub fn fail_acquire(&self, enabled: bool) {
        self.fail_acquire.store(enabled, Ordering::SeqCst);
    }

    /// Make `release` report an error; the lock is still freed.
    pub fn fail_release(&self, enabled: bool) {
        self.fail_release.store(enabled, Ordering::SeqCst);
    }
}

struct MemoryLockRelease {
    _guard: tokio::sync::OwnedMutexGuard<()>,
    counters: Arc<LockCounters>,
    fail: bool,
}

#[async_trait::async_trait]
impl LockRelease for MemoryLockRelease {
    async fn release(self: Box<Self>) -> AgentResult<()> {
        self.counters.released.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(AgentError::lock("injected release failure").into());
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl NodeLock for MemoryLock {
    async fn acquire(&self, _ctx: &CancellationToken) -> AgentResult<Box<dyn LockRelease>> {
        if self.fail_acquire.load(Ordering::SeqCst) {
            return Err(AgentError::lock("injected acquire failure").into());
        }
        let guard = Arc::clone(&self.inner).lock_owned().await;
        self.counters.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryLockRelease {
            _guard: guard,
            counters: Arc::clone(&self.counters),
            fail: self.fail_release.load(Ordering::SeqCst),
        }))
    }
}

/// Descriptor writer that records calls and answers with `mock.com/gpu=<claim>-<device>`.
#[derive(Debug, Default)]
pub struct RecordingWriter {
    writes: Mutex<Vec<PrepareRequest>>,
    deletes: Mutex<Vec<String>>,
    response: Mutex<Option<CdiDeviceIds>>,
    fail_writes: AtomicBool,
    fail_deletes: AtomicBool,
}

impl RecordingWriter {
    /// Answer every write with `response` instead of the generated ids
    pub fn respond_with(&self, response: CdiDeviceIds) {
        *self.response.lock().unwrap() = Some(response);
    }

    pub fn writes(&self) -> Vec<PrepareRequest> {
        self.writes.lock().unwrap().clone()
    }

    pub fn deletes(&self) -> Vec<String> {
        self.deletes.lock().unwrap().clone()
    }

    pub fn fail_writes(&self, enabled: bool) {
        self.fail_writes.store(enabled, Ordering::SeqCst);
    }

    pub fn fail_deletes(&self, enabled: bool) {
        self.fail_deletes.store(enabled, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl DeviceInterfaceWriter for RecordingWriter {
    async fn write(
        &self,
        _ctx: &CancellationToken,
        request: &PrepareRequest,
    ) -> AgentResult<CdiDeviceIds> {
        self.writes.lock().unwrap().push(request.clone());
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(AgentError::descriptor("injected write failure").into());
        }
        if let Some(response) = self.response.lock().unwrap().clone() {
            return Ok(response);
        }
        Ok(request
            .devices
            .iter()
            .map(|d| {
                (
                    d.device.clone(),
                    vec![format!("mock.com/gpu={}-{}", request.claim_id, d.device)],
                )
            })
            .collect())
    }

    async fn delete(&self, _ctx: &CancellationToken, claim_id: &str) -> AgentResult<()> {
        self.deletes.lock().unwrap().push(claim_id.to_string());
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(AgentError::descriptor("injected delete failure").into());
        }
        Ok(())
    }
}

/// MIG backend that hands out a fixed device UUID.
#[derive(Debug)]
pub struct RecordingMigManager {
    device_uuid: String,
    prepared: Mutex<Vec<MigPrepareRequest>>,
    unprepared: Mutex<Vec<MigBackendState>>,
    fail_prepare: AtomicBool,
    fail_unprepare: AtomicBool,
}

impl RecordingMigManager {
    pub fn new(device_uuid: impl Into<String>) -> Self {
        Self {
            device_uuid: device_uuid.into(),
            prepared: Mutex::default(),
            unprepared: Mutex::default(),
            fail_prepare: AtomicBool::new(false),
            fail_unprepare: AtomicBool::new(false),
        }
    }

    pub fn prepared(&self) -> Vec<MigPrepareRequest> {
        self.prepared.lock().unwrap().clone()
    }

    pub fn unprepared(&self) -> Vec<MigBackendState> {
        self.unprepared.lock().unwrap().clone()
    }

    pub fn fail_prepare(&self, enabled: bool) {
        self.fail_prepare.store(enabled, Ordering::SeqCst);
    }

    pub fn fail_unprepare(&self, enabled: bool) {
        self.fail_unprepare.store(enabled, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl MigManager for RecordingMigManager {
    async fn prepare(
        &self,
        _ctx: &CancellationToken,
        request: &MigPrepareRequest,
    ) -> AgentResult<MigBackendState> {
        self.prepared.lock().unwrap().push(request.clone());
        if self.fail_prepare.load(Ordering::SeqCst) {
            return Err(AgentError::backend("injected MIG prepare failure").into());
        }
        Ok(MigBackendState {
            parent_pci_bus_id: request.pci_bus_id.clone(),
            profile_id: request.profile_id,
            slice_start: request.slice_start,
            slice_count: request.slice_count,
            gpu_instance_id: Some(request.slice_start),
            compute_instance_id: Some(0),
            device_uuid: self.device_uuid.clone(),
        })
    }

    async fn unprepare(
        &self,
        _ctx: &CancellationToken,
        state: &MigBackendState,
    ) -> AgentResult<()> {
        self.unprepared.lock().unwrap().push(state.clone());
        if self.fail_unprepare.load(Ordering::SeqCst) {
            return Err(AgentError::backend("injected MIG unprepare failure").into());
        }
        Ok(())
    }
}

/// VFIO backend that pretends every device was bound to `nvidia` before.
#[derive(Debug, Default)]
pub struct RecordingVfioManager {
    prepared: Mutex<Vec<VfioPrepareRequest>>,
    unprepared: Mutex<Vec<VfioBackendState>>,
    fail_prepare: AtomicBool,
    fail_unprepare: AtomicBool,
}

impl RecordingVfioManager {
    pub fn prepared(&self) -> Vec<VfioPrepareRequest> {
        self.prepared.lock().unwrap().clone()
    }

    pub fn unprepared(&self) -> Vec<VfioBackendState> {
        self.unprepared.lock().unwrap().clone()
    }

    pub fn fail_prepare(&self, enabled: bool) {
        self.fail_prepare.store(enabled, Ordering::SeqCst);
    }

    pub fn fail_unprepare(&self, enabled: bool) {
        self.fail_unprepare.store(enabled, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl VfioManager for RecordingVfioManager {
    async fn prepare(
        &self,
        _ctx: &CancellationToken,
        request: &VfioPrepareRequest,
    ) -> AgentResult<VfioBackendState> {
        self.prepared.lock().unwrap().push(request.clone());
        if self.fail_prepare.load(Ordering::SeqCst) {
            return Err(AgentError::backend("injected VFIO prepare failure").into());
        }
        Ok(VfioBackendState {
            pci_bus_id: request.pci_bus_id.clone(),
            original_driver: Some("nvidia".to_string()),
            iommu_group: None,
        })
    }

    async fn unprepare(
        &self,
        _ctx: &CancellationToken,
        state: &VfioBackendState,
    ) -> AgentResult<()> {
        self.unprepared.lock().unwrap().push(state.clone());
        if self.fail_unprepare.load(Ordering::SeqCst) {
            return Err(AgentError::backend("injected VFIO unprepare failure").into());
        }
        Ok(())
    }
}

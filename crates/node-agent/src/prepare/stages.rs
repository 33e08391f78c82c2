//! The ordered stages of a prepare call.
//!
//! Each stage works on the shared [`PrepareState`] and either lets the pipeline
//! continue or finishes it early. Stages run strictly in the order returned by
//! [`build_pipeline`]; nothing after `SaveStarted` runs before the claim is
//! recorded as started, so a crash leaves a checkpoint a retry can resume from.

use std::collections::HashSet;
use std::sync::Arc;

use api_types::Checkpoint;
use api_types::ClaimRecord;
use api_types::ClaimState;
use api_types::DeviceAttribute;
use api_types::DeviceRecord;
use api_types::MigPrepareRequest;
use api_types::PrepareDevice;
use api_types::PrepareRequest;
use api_types::PrepareResult;
use api_types::PreparedDevice;
use api_types::VfioPrepareRequest;
use error_stack::Report;
use error_stack::ResultExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;

use super::ServiceConfig;
use crate::attributes::attr_string;
use crate::attributes::clone_attributes;
use crate::attributes::is_mig_device;
use crate::attributes::is_physical_device;
use crate::attributes::ATTR_DEVICE_TYPE;
use crate::attributes::ATTR_IOMMU_GROUP;
use crate::attributes::ATTR_MIG_DEVICE_UUID;
use crate::attributes::ATTR_PCI_BUS_ID;
use crate::backend::MigManager;
use crate::backend::VfioManager;
use crate::cdi::DeviceInterfaceWriter;
use crate::checkpoint::load_checkpoint;
use crate::checkpoint::reconstruct_result;
use crate::checkpoint::CheckpointStore;
use crate::error::AgentError;
use crate::error::AgentResult;
use crate::lock::LockRelease;
use crate::lock::NodeLock;
use crate::mig::parse_mig_device_name;

/// Whether the pipeline goes on after a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageFlow {
    Continue,
    Finish,
}

/// Per-device work decided by the plan stage.
#[derive(Debug, Clone)]
pub(crate) struct PlannedDevice {
    pub record: DeviceRecord,
    /// Set when the device still needs a MIG instance
    pub mig: Option<MigPrepareRequest>,
    /// Set when the device still needs a VFIO binding
    pub vfio: Option<VfioPrepareRequest>,
}

/// Mutable state threaded through the stages of one prepare call.
pub struct PrepareState {
    pub(crate) request: PrepareRequest,
    pub(crate) lock: Option<Box<dyn LockRelease>>,
    pub(crate) checkpoint: Checkpoint,
    pub(crate) devices: Vec<PlannedDevice>,
    pub(crate) result: Option<PrepareResult>,
}

impl PrepareState {
    pub(crate) fn new(request: &PrepareRequest) -> Self {
        Self {
            request: request.clone(),
            lock: None,
            checkpoint: Checkpoint::default(),
            devices: Vec::new(),
            result: None,
        }
    }

    fn claim_id(&self) -> &str {
        &self.request.claim_id
    }

    fn records(&self) -> Vec<DeviceRecord> {
        self.devices.iter().map(|d| d.record.clone()).collect()
    }

    fn set_claim(&mut self, state: ClaimState) {
        let record = ClaimRecord {
            state,
            devices: self.records(),
        };
        self.checkpoint
            .claims
            .insert(self.request.claim_id.clone(), record);
    }
}

#[async_trait::async_trait]
pub trait PrepareStage: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, ctx: &CancellationToken, state: &mut PrepareState)
        -> AgentResult<StageFlow>;
}

/// Builds the prepare pipeline from the service's collaborators.
pub fn build_pipeline(config: &ServiceConfig) -> Vec<Box<dyn PrepareStage>> {
    vec![
        Box::new(Validate),
        Box::new(AcquireLock {
            lock: Arc::clone(&config.lock),
        }),
        Box::new(LoadCheckpoint {
            store: Arc::clone(&config.checkpoints),
        }),
        Box::new(ShortCircuitCompleted),
        Box::new(Plan {
            mig: Arc::clone(&config.mig),
            vfio: Arc::clone(&config.vfio),
        }),
        Box::new(MigPrepare {
            mig: Arc::clone(&config.mig),
        }),
        Box::new(VfioPrepare {
            vfio: Arc::clone(&config.vfio),
        }),
        Box::new(SaveCheckpoint {
            store: Arc::clone(&config.checkpoints),
            state: ClaimState::PrepareStarted,
        }),
        Box::new(WriteDescriptors {
            writer: Arc::clone(&config.writer),
        }),
        Box::new(SaveCheckpoint {
            store: Arc::clone(&config.checkpoints),
            state: ClaimState::PrepareCompleted,
        }),
        Box::new(Finalize),
    ]
}

struct Validate;

#[async_trait::async_trait]
impl PrepareStage for Validate {
    fn name(&self) -> &'static str {
        "validate"
    }

    async fn run(
        &self,
        _ctx: &CancellationToken,
        state: &mut PrepareState,
    ) -> AgentResult<StageFlow> {
        let request = &state.request;
        if request.claim_id.is_empty() {
            return Err(AgentError::validation("claim id must not be empty").into());
        }
        if request.devices.is_empty() {
            return Err(AgentError::validation(format!(
                "claim {} has no devices to prepare",
                request.claim_id
            ))
            .into());
        }

        let mut seen = HashSet::new();
        for device in &request.devices {
            if !seen.insert(device.device.as_str()) {
                return Err(AgentError::validation(format!(
                    "claim {} lists device {} more than once",
                    request.claim_id, device.device
                ))
                .into());
            }
        }
        Ok(StageFlow::Continue)
    }
}

struct AcquireLock {
    lock: Arc<dyn NodeLock>,
}

#[async_trait::async_trait]
impl PrepareStage for AcquireLock {
    fn name(&self) -> &'static str {
        "lock"
    }

    async fn run(
        &self,
        ctx: &CancellationToken,
        state: &mut PrepareState,
    ) -> AgentResult<StageFlow> {
        let release = self
            .lock
            .acquire(ctx)
            .await
            .attach_printable_lazy(|| format!("prepare claim {}", state.claim_id()))?;
        state.lock = Some(release);
        debug!(claim_id = %state.claim_id(), "node lock acquired for prepare");
        Ok(StageFlow::Continue)
    }
}

struct LoadCheckpoint {
    store: Arc<dyn CheckpointStore>,
}

#[async_trait::async_trait]
impl PrepareStage for LoadCheckpoint {
    fn name(&self) -> &'static str {
        "load-checkpoint"
    }

    async fn run(
        &self,
        ctx: &CancellationToken,
        state: &mut PrepareState,
    ) -> AgentResult<StageFlow> {
        state.checkpoint = load_checkpoint(self.store.as_ref(), ctx)
            .await
            .attach_printable_lazy(|| format!("prepare claim {}", state.claim_id()))?;
        Ok(StageFlow::Continue)
    }
}

struct ShortCircuitCompleted;

#[async_trait::async_trait]
impl PrepareStage for ShortCircuitCompleted {
    fn name(&self) -> &'static str {
        "short-circuit"
    }

    async fn run(
        &self,
        _ctx: &CancellationToken,
        state: &mut PrepareState,
    ) -> AgentResult<StageFlow> {
        let Some(record) = state.checkpoint.claims.get(state.claim_id()) else {
            return Ok(StageFlow::Continue);
        };
        if record.state != ClaimState::PrepareCompleted {
            info!(
                claim_id = %state.claim_id(),
                state = %record.state,
                "resuming partially prepared claim"
            );
            return Ok(StageFlow::Continue);
        }

        let result = reconstruct_result(state.claim_id(), record)?;
        info!(claim_id = %state.claim_id(), "claim already prepared, returning recorded result");
        state.result = Some(result);
        Ok(StageFlow::Finish)
    }
}

/// Decides the backend work per device and rejects anything invalid before
/// the first backend call or checkpoint write.
struct Plan {
    mig: Arc<dyn MigManager>,
    vfio: Arc<dyn VfioManager>,
}

impl Plan {
    fn pci_bus_id(claim_id: &str, device: &PrepareDevice) -> AgentResult<String> {
        let pci_bus_id = attr_string(&device.attributes, ATTR_PCI_BUS_ID);
        if pci_bus_id.is_empty() {
            return Err(AgentError::validation(format!(
                "claim {claim_id} device {} has no {ATTR_PCI_BUS_ID} attribute",
                device.device
            ))
            .into());
        }
        Ok(pci_bus_id)
    }

    fn plan_device(
        &self,
        claim_id: &str,
        vfio_requested: bool,
        device: &PrepareDevice,
        previous: Option<&DeviceRecord>,
    ) -> AgentResult<PlannedDevice> {
        let record = previous
            .cloned()
            .unwrap_or_else(|| DeviceRecord::new(&device.request, &device.pool, &device.device));
        let device_type = attr_string(&device.attributes, ATTR_DEVICE_TYPE);
        let mut planned = PlannedDevice {
            record,
            mig: None,
            vfio: None,
        };

        if vfio_requested {
            if !is_physical_device(&device_type) {
                return Err(AgentError::validation(format!(
                    "claim {claim_id} device {}: VFIO needs a physical device, got {device_type:?}",
                    device.device
                ))
                .into());
            }
            if device.is_shared() {
                return Err(AgentError::validation(format!(
                    "claim {claim_id} device {}: VFIO passthrough cannot use a shared allocation",
                    device.device
                ))
                .into());
            }
            if !self.vfio.is_configured() {
                return Err(AgentError::configuration(format!(
                    "claim {claim_id} device {}: VFIO requested but no VFIO manager is configured",
                    device.device
                ))
                .into());
            }
            if planned.record.vfio.is_none() {
                planned.vfio = Some(VfioPrepareRequest {
                    pci_bus_id: Self::pci_bus_id(claim_id, device)?,
                });
            }
        }

        if is_mig_device(&device_type) {
            if !self.mig.is_configured() {
                return Err(AgentError::configuration(format!(
                    "claim {claim_id} device {}: MIG device but no MIG manager is configured",
                    device.device
                ))
                .into());
            }
            if planned.record.mig.is_none() {
                let placement = parse_mig_device_name(&device.device).map_err(|e| {
                    Report::new(e).change_context(AgentError::validation(format!(
                        "claim {claim_id}: cannot decode MIG device {}",
                        device.device
                    )))
                })?;
                planned.mig = Some(MigPrepareRequest {
                    pci_bus_id: Self::pci_bus_id(claim_id, device)?,
                    profile_id: placement.profile_id,
                    slice_start: placement.slice_start,
                    slice_count: placement.slice_count,
                });
            }
        }

        Ok(planned)
    }
}

#[async_trait::async_trait]
impl PrepareStage for Plan {
    fn name(&self) -> &'static str {
        "plan"
    }

    async fn run(
        &self,
        _ctx: &CancellationToken,
        state: &mut PrepareState,
    ) -> AgentResult<StageFlow> {
        // only a claim that is not completed reaches this stage
        let previous = state.checkpoint.claims.get(state.claim_id());

        let devices = state
            .request
            .devices
            .iter()
            .map(|device| {
                self.plan_device(
                    &state.request.claim_id,
                    state.request.vfio,
                    device,
                    previous.and_then(|claim| claim.device(&device.device)),
                )
            })
            .collect::<AgentResult<Vec<_>>>()?;

        state.devices = devices;
        Ok(StageFlow::Continue)
    }
}

struct MigPrepare {
    mig: Arc<dyn MigManager>,
}

#[async_trait::async_trait]
impl PrepareStage for MigPrepare {
    fn name(&self) -> &'static str {
        "mig-prepare"
    }

    async fn run(
        &self,
        ctx: &CancellationToken,
        state: &mut PrepareState,
    ) -> AgentResult<StageFlow> {
        let claim_id = state.request.claim_id.clone();
        for planned in &mut state.devices {
            let Some(request) = planned.mig.take() else {
                continue;
            };
            let backend = self.mig.prepare(ctx, &request).await.change_context_lazy(|| {
                AgentError::backend(format!(
                    "claim {claim_id}: MIG prepare failed for device {}",
                    planned.record.device
                ))
            })?;
            info!(
                claim_id = %claim_id,
                device = %planned.record.device,
                mig_uuid = %backend.device_uuid,
                "MIG device prepared"
            );
            planned.record.mig = Some(backend);
        }
        Ok(StageFlow::Continue)
    }
}

struct VfioPrepare {
    vfio: Arc<dyn VfioManager>,
}

#[async_trait::async_trait]
impl PrepareStage for VfioPrepare {
    fn name(&self) -> &'static str {
        "vfio-prepare"
    }

    async fn run(
        &self,
        ctx: &CancellationToken,
        state: &mut PrepareState,
    ) -> AgentResult<StageFlow> {
        let claim_id = state.request.claim_id.clone();
        for planned in &mut state.devices {
            let Some(request) = planned.vfio.take() else {
                continue;
            };
            let backend = self.vfio.prepare(ctx, &request).await.change_context_lazy(|| {
                AgentError::backend(format!(
                    "claim {claim_id}: VFIO prepare failed for device {}",
                    planned.record.device
                ))
            })?;
            info!(
                claim_id = %claim_id,
                device = %planned.record.device,
                pci_bus_id = %backend.pci_bus_id,
                "VFIO device prepared"
            );
            planned.record.vfio = Some(backend);
        }
        Ok(StageFlow::Continue)
    }
}

struct SaveCheckpoint {
    store: Arc<dyn CheckpointStore>,
    state: ClaimState,
}

#[async_trait::async_trait]
impl PrepareStage for SaveCheckpoint {
    fn name(&self) -> &'static str {
        match self.state {
            ClaimState::PrepareStarted => "save-started",
            ClaimState::PrepareCompleted => "save-completed",
        }
    }

    async fn run(
        &self,
        ctx: &CancellationToken,
        state: &mut PrepareState,
    ) -> AgentResult<StageFlow> {
        state.set_claim(self.state);
        self.store
            .save(ctx, &state.checkpoint)
            .await
            .change_context_lazy(|| {
                AgentError::persistence(format!(
                    "failed to record claim {} as {}",
                    state.request.claim_id, self.state
                ))
            })?;
        info!(claim_id = %state.claim_id(), state = %self.state, "checkpoint saved");
        Ok(StageFlow::Continue)
    }
}

struct WriteDescriptors {
    writer: Arc<dyn DeviceInterfaceWriter>,
}

impl WriteDescriptors {
    /// Copy of the request for the writer, with the MIG device UUID and the
    /// IOMMU group resolved by the backends injected.
    fn descriptor_request(state: &PrepareState) -> PrepareRequest {
        let devices = state
            .request
            .devices
            .iter()
            .zip(&state.devices)
            .map(|(device, planned)| {
                let mut attributes = clone_attributes(&device.attributes);
                if let Some(mig) = &planned.record.mig {
                    attributes.insert(
                        ATTR_MIG_DEVICE_UUID.to_string(),
                        DeviceAttribute::String(mig.device_uuid.clone()),
                    );
                }
                let iommu_group = planned
                    .record
                    .vfio
                    .as_ref()
                    .and_then(|vfio| vfio.iommu_group.clone());
                if let Some(group) = iommu_group {
                    attributes.insert(
                        ATTR_IOMMU_GROUP.to_string(),
                        DeviceAttribute::String(group),
                    );
                }
                PrepareDevice {
                    attributes,
                    ..device.clone()
                }
            })
            .collect();

        PrepareRequest {
            devices,
            ..state.request.clone()
        }
    }
}

#[async_trait::async_trait]
impl PrepareStage for WriteDescriptors {
    fn name(&self) -> &'static str {
        "write-descriptors"
    }

    async fn run(
        &self,
        ctx: &CancellationToken,
        state: &mut PrepareState,
    ) -> AgentResult<StageFlow> {
        let request = Self::descriptor_request(state);
        let claim_id = request.claim_id.as_str();
        let mut ids = self
            .writer
            .write(ctx, &request)
            .await
            .change_context_lazy(|| {
                AgentError::descriptor(format!("failed to write CDI spec for claim {claim_id}"))
            })?;

        for planned in &mut state.devices {
            let device_ids = ids
                .remove(&planned.record.device)
                .filter(|ids| !ids.is_empty())
                .ok_or_else(|| {
                    AgentError::descriptor(format!(
                        "claim {claim_id}: no CDI device ids returned for device {}",
                        planned.record.device
                    ))
                })?;
            planned.record.cdi_device_ids = device_ids;
        }
        Ok(StageFlow::Continue)
    }
}

struct Finalize;

#[async_trait::async_trait]
impl PrepareStage for Finalize {
    fn name(&self) -> &'static str {
        "finalize"
    }

    async fn run(
        &self,
        _ctx: &CancellationToken,
        state: &mut PrepareState,
    ) -> AgentResult<StageFlow> {
        let devices = state
            .devices
            .iter()
            .map(|planned| PreparedDevice {
                request: planned.record.request.clone(),
                pool: planned.record.pool.clone(),
                device: planned.record.device.clone(),
                cdi_device_ids: planned.record.cdi_device_ids.clone(),
            })
            .collect();
        state.result = Some(PrepareResult {
            claim_id: state.request.claim_id.clone(),
            devices,
        });
        Ok(StageFlow::Finish)
    }
}

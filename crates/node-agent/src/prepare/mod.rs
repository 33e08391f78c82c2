//! Claim preparation and unpreparation.
//!
//! [`PrepareService`] is the entry point used by the plugin's RPC handlers. All
//! calls on a node are serialized by the node lock, which is held from the
//! checkpoint load to the final checkpoint save and always released on exit.

mod stages;

pub use stages::build_pipeline;
pub use stages::PrepareStage;
pub use stages::PrepareState;
pub use stages::StageFlow;

use std::sync::Arc;

use api_types::ClaimState;
use api_types::PrepareRequest;
use api_types::PrepareResult;
use error_stack::Report;
use error_stack::ResultExt;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing::instrument;
use tracing::warn;

use crate::backend::MigManager;
use crate::backend::Unconfigured;
use crate::backend::VfioManager;
use crate::cdi::DeviceInterfaceWriter;
use crate::checkpoint::load_checkpoint;
use crate::checkpoint::CheckpointStore;
use crate::error::AgentError;
use crate::error::AgentResult;
use crate::lock::LockRelease;
use crate::lock::NodeLock;

/// Collaborators the service is built from.
///
/// MIG and VFIO default to [`Unconfigured`]; requests that need them then fail
/// with a configuration error before anything is changed.
#[derive(Clone)]
pub struct ServiceConfig {
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub lock: Arc<dyn NodeLock>,
    pub writer: Arc<dyn DeviceInterfaceWriter>,
    pub mig: Arc<dyn MigManager>,
    pub vfio: Arc<dyn VfioManager>,
}

impl ServiceConfig {
    pub fn new(
        checkpoints: Arc<dyn CheckpointStore>,
        lock: Arc<dyn NodeLock>,
        writer: Arc<dyn DeviceInterfaceWriter>,
    ) -> Self {
        Self {
            checkpoints,
            lock,
            writer,
            mig: Arc::new(Unconfigured),
            vfio: Arc::new(Unconfigured),
        }
    }

    pub fn with_mig(mut self, mig: Arc<dyn MigManager>) -> Self {
        self.mig = mig;
        self
    }

    pub fn with_vfio(mut self, vfio: Arc<dyn VfioManager>) -> Self {
        self.vfio = vfio;
        self
    }
}

pub struct PrepareService {
    config: ServiceConfig,
    pipeline: Vec<Box<dyn PrepareStage>>,
}

impl PrepareService {
    pub fn new(config: ServiceConfig) -> Self {
        let pipeline = build_pipeline(&config);
        Self { config, pipeline }
    }

    /// Names of the prepare stages in execution order.
    pub fn stage_names(&self) -> Vec<&'static str> {
        self.pipeline.iter().map(|stage| stage.name()).collect()
    }

    /// Prepares every device of the claim and returns the CDI device ids to inject.
    ///
    /// Calling this again for a claim that already completed returns the recorded
    /// result without touching any backend.
    #[instrument(skip_all, fields(claim_id = %request.claim_id, devices = request.devices.len()))]
    pub async fn prepare(
        &self,
        ctx: &CancellationToken,
        request: &PrepareRequest,
    ) -> AgentResult<PrepareResult> {
        let mut state = PrepareState::new(request);
        let outcome = self.run_pipeline(ctx, &mut state).await;
        release_lock(state.lock.take(), &request.claim_id).await;
        outcome?;

        let result = state.result.ok_or_else(|| {
            Report::new(AgentError::data_integrity(format!(
                "prepare pipeline for claim {} finished without a result",
                request.claim_id
            )))
        })?;
        info!(claim_id = %result.claim_id, "claim prepared");
        Ok(result)
    }

    async fn run_pipeline(
        &self,
        ctx: &CancellationToken,
        state: &mut PrepareState,
    ) -> AgentResult<()> {
        for stage in &self.pipeline {
            if ctx.is_cancelled() {
                return Err(AgentError::cancelled(format!(
                    "prepare claim {} before stage {}",
                    state.request.claim_id,
                    stage.name()
                ))
                .into());
            }
            let flow = stage
                .run(ctx, state)
                .await
                .attach_printable_lazy(|| format!("stage: {}", stage.name()))?;
            if flow == StageFlow::Finish {
                break;
            }
        }
        Ok(())
    }

    /// Tears down the backend state of a completed claim and forgets it.
    ///
    /// Unknown claims succeed without side effects. A claim that never got past
    /// the started state is left untouched, including its backend state.
    #[instrument(skip_all, fields(claim_id = %claim_id))]
    pub async fn unprepare(&self, ctx: &CancellationToken, claim_id: &str) -> AgentResult<()> {
        if claim_id.is_empty() {
            return Err(AgentError::validation("claim id must not be empty").into());
        }

        let release = self
            .config
            .lock
            .acquire(ctx)
            .await
            .attach_printable_lazy(|| format!("unprepare claim {claim_id}"))?;
        let outcome = self.unprepare_locked(ctx, claim_id).await;
        release_lock(Some(release), claim_id).await;
        outcome
    }

    async fn unprepare_locked(&self, ctx: &CancellationToken, claim_id: &str) -> AgentResult<()> {
        let mut checkpoint = load_checkpoint(self.config.checkpoints.as_ref(), ctx)
            .await
            .attach_printable_lazy(|| format!("unprepare claim {claim_id}"))?;

        let Some(claim) = checkpoint.claims.get(claim_id) else {
            info!(claim_id = %claim_id, "claim not in checkpoint, nothing to unprepare");
            return Ok(());
        };

        if claim.state == ClaimState::PrepareStarted {
            warn!(
                claim_id = %claim_id,
                "claim was never fully prepared, leaving its backend state in place"
            );
            return Ok(());
        }

        for device in &claim.devices {
            if let Some(mig) = &device.mig {
                if !self.config.mig.is_configured() {
                    return Err(AgentError::configuration(format!(
                        "claim {claim_id} device {} has MIG state but no MIG manager",
                        device.device
                    ))
                    .into());
                }
                self.config
                    .mig
                    .unprepare(ctx, mig)
                    .await
                    .change_context_lazy(|| {
                        AgentError::backend(format!(
                            "claim {claim_id}: MIG unprepare failed for device {}",
                            device.device
                        ))
                    })?;
                info!(claim_id = %claim_id, device = %device.device, "MIG device removed");
            }

            if let Some(vfio) = &device.vfio {
                if !self.config.vfio.is_configured() {
                    return Err(AgentError::configuration(format!(
                        "claim {claim_id} device {} has VFIO state but no VFIO manager",
                        device.device
                    ))
                    .into());
                }
                self.config
                    .vfio
                    .unprepare(ctx, vfio)
                    .await
                    .change_context_lazy(|| {
                        AgentError::backend(format!(
                            "claim {claim_id}: VFIO unprepare failed for device {}",
                            device.device
                        ))
                    })?;
                info!(claim_id = %claim_id, device = %device.device, "VFIO device released");
            }
        }

        self.config
            .writer
            .delete(ctx, claim_id)
            .await
            .change_context_lazy(|| {
                AgentError::descriptor(format!("failed to delete CDI spec for claim {claim_id}"))
            })?;

        checkpoint.claims.remove(claim_id);
        self.config
            .checkpoints
            .save(ctx, &checkpoint)
            .await
            .change_context_lazy(|| {
                AgentError::persistence(format!(
                    "failed to remove claim {claim_id} from checkpoint"
                ))
            })?;

        info!(claim_id = %claim_id, "claim unprepared");
        Ok(())
    }
}

/// Releases the node lock, if held. Failures are logged and dropped.
async fn release_lock(release: Option<Box<dyn LockRelease>>, claim_id: &str) {
    let Some(release) = release else {
        return;
    };
    if let Err(e) = release.release().await {
        warn!(claim_id = %claim_id, error = ?e, "failed to release node lock");
    }
}

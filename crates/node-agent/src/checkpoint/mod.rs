//! Checkpoint access: loading, normalization and result reconstruction.

mod file_store;

pub use file_store::FileCheckpointStore;

use api_types::Checkpoint;
use api_types::ClaimRecord;
use api_types::ClaimState;
use api_types::PrepareResult;
use api_types::PreparedDevice;
use api_types::CHECKPOINT_VERSION_V1;
use error_stack::ResultExt;
use tokio_util::sync::CancellationToken;

use crate::error::AgentError;
use crate::error::AgentResult;

/// Durable storage of the checkpoint document.
#[async_trait::async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self, ctx: &CancellationToken) -> AgentResult<Checkpoint>;

    async fn save(&self, ctx: &CancellationToken, checkpoint: &Checkpoint) -> AgentResult<()>;
}

/// Loads the checkpoint and fills in defaults for a document written without them.
pub async fn load_checkpoint(
    store: &dyn CheckpointStore,
    ctx: &CancellationToken,
) -> AgentResult<Checkpoint> {
    let mut checkpoint = store
        .load(ctx)
        .await
        .change_context(AgentError::persistence("failed to load checkpoint"))?;

    if checkpoint.version.is_empty() {
        checkpoint.version = CHECKPOINT_VERSION_V1.to_string();
    }
    Ok(checkpoint)
}

/// Rebuilds the result of an earlier successful prepare from its checkpoint record.
pub fn reconstruct_result(claim_id: &str, record: &ClaimRecord) -> AgentResult<PrepareResult> {
    if record.state != ClaimState::PrepareCompleted {
        return Err(AgentError::data_integrity(format!(
            "claim {claim_id} is in state {}, not {}",
            record.state,
            ClaimState::PrepareCompleted
        ))
        .into());
    }

    let devices = record
        .devices
        .iter()
        .map(|device| {
            if device.cdi_device_ids.is_empty() {
                return Err(AgentError::data_integrity(format!(
                    "claim {claim_id} device {} is completed but has no CDI device ids",
                    device.device
                )));
            }
            Ok(PreparedDevice {
                request: device.request.clone(),
                pool: device.pool.clone(),
                device: device.device.clone(),
                cdi_device_ids: device.cdi_device_ids.clone(),
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(PrepareResult {
        claim_id: claim_id.to_string(),
        devices,
    })
}

#[cfg(test)]
mod tests {
    use api_types::DeviceRecord;
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;
    use crate::mock::MemoryCheckpointStore;

    fn completed_record() -> ClaimRecord {
        let mut device = DeviceRecord::new("gpu", "node-a", "gpu-0");
        device.cdi_device_ids = vec!["nvidia.com/gpu=c1-gpu-0".to_string()];
        ClaimRecord {
            state: ClaimState::PrepareCompleted,
            devices: vec![device],
        }
    }

    #[test(tokio::test)]
    async fn load_fills_in_version() {
        let store = MemoryCheckpointStore::default();
        let checkpoint = load_checkpoint(&store, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(checkpoint.version, CHECKPOINT_VERSION_V1);
        assert!(checkpoint.claims.is_empty());
    }

    #[test(tokio::test)]
    async fn load_keeps_existing_version() {
        let store = MemoryCheckpointStore::with_checkpoint(Checkpoint {
            version: "v2".to_string(),
            ..Default::default()
        });
        let checkpoint = load_checkpoint(&store, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(checkpoint.version, "v2");
    }

    #[test(tokio::test)]
    async fn load_failure_is_persistence_error() {
        let store = MemoryCheckpointStore::default();
        store.fail_loads(true);
        let err = load_checkpoint(&store, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err.current_context(),
            AgentError::Persistence { .. }
        ));
    }

    #[test]
    fn reconstruct_completed_claim() {
        let result = reconstruct_result("c1", &completed_record()).unwrap();
        assert_eq!(
            result,
            PrepareResult {
                claim_id: "c1".to_string(),
                devices: vec![PreparedDevice {
                    request: "gpu".to_string(),
                    pool: "node-a".to_string(),
                    device: "gpu-0".to_string(),
                    cdi_device_ids: vec!["nvidia.com/gpu=c1-gpu-0".to_string()],
                }],
            }
        );
    }

    #[test]
    fn reconstruct_rejects_started_claim() {
        let mut record = completed_record();
        record.state = ClaimState::PrepareStarted;
        assert!(reconstruct_result("c1", &record).is_err());
    }

    #[test]
    fn reconstruct_rejects_missing_ids() {
        let mut record = completed_record();
        record.devices[0].cdi_device_ids.clear();
        let err = reconstruct_result("c1", &record).unwrap_err();
        assert!(matches!(
            err.current_context(),
            AgentError::DataIntegrity { .. }
        ));
        assert!(err.to_string().contains("gpu-0"));
    }
}

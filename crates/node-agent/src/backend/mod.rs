//! Hardware backends that turn an allocated device into something a container can use.

mod vfio;

pub use vfio::SysfsVfioManager;

use api_types::MigBackendState;
use api_types::MigPrepareRequest;
use api_types::VfioBackendState;
use api_types::VfioPrepareRequest;
use tokio_util::sync::CancellationToken;

use crate::error::AgentError;
use crate::error::AgentResult;

/// Creates and destroys MIG instances on a GPU.
#[async_trait::async_trait]
pub trait MigManager: Send + Sync {
    /// Whether this manager can actually serve requests on this node.
    fn is_configured(&self) -> bool {
        true
    }

    async fn prepare(
        &self,
        ctx: &CancellationToken,
        request: &MigPrepareRequest,
    ) -> AgentResult<MigBackendState>;

    async fn unprepare(&self, ctx: &CancellationToken, state: &MigBackendState)
        -> AgentResult<()>;
}

/// Binds PCI functions to `vfio-pci` for exclusive passthrough and back.
#[async_trait::async_trait]
pub trait VfioManager: Send + Sync {
    fn is_configured(&self) -> bool {
        true
    }

    async fn prepare(
        &self,
        ctx: &CancellationToken,
        request: &VfioPrepareRequest,
    ) -> AgentResult<VfioBackendState>;

    async fn unprepare(
        &self,
        ctx: &CancellationToken,
        state: &VfioBackendState,
    ) -> AgentResult<()>;
}

/// Stand-in for a backend that is not available on this node.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unconfigured;

#[async_trait::async_trait]
impl MigManager for Unconfigured {
    fn is_configured(&self) -> bool {
        false
    }

    async fn prepare(
        &self,
        _ctx: &CancellationToken,
        request: &MigPrepareRequest,
    ) -> AgentResult<MigBackendState> {
        Err(AgentError::configuration(format!(
            "MIG manager is not configured, cannot prepare MIG device on {}",
            request.pci_bus_id
        ))
        .into())
    }

    async fn unprepare(
        &self,
        _ctx: &CancellationToken,
        state: &MigBackendState,
    ) -> AgentResult<()> {
        Err(AgentError::configuration(format!(
            "MIG manager is not configured, cannot remove MIG device {}",
            state.device_uuid
        ))
        .into())
    }
}

#[async_trait::async_trait]
impl VfioManager for Unconfigured {
    fn is_configured(&self) -> bool {
        false
    }

    async fn prepare(
        &self,
        _ctx: &CancellationToken,
        request: &VfioPrepareRequest,
    ) -> AgentResult<VfioBackendState> {
        Err(AgentError::configuration(format!(
            "VFIO manager is not configured, cannot bind {}",
            request.pci_bus_id
        ))
        .into())
    }

    async fn unprepare(
        &self,
        _ctx: &CancellationToken,
        state: &VfioBackendState,
    ) -> AgentResult<()> {
        Err(AgentError::configuration(format!(
            "VFIO manager is not configured, cannot unbind {}",
            state.pci_bus_id
        ))
        .into())
    }
}

use std::path::Path;
use std::path::PathBuf;

use api_types::VfioBackendState;
use api_types::VfioPrepareRequest;
use error_stack::Report;
use error_stack::ResultExt;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::VfioManager;
use crate::error::AgentError;
use crate::error::AgentResult;

const VFIO_PCI_DRIVER: &str = "vfio-pci";

/// VFIO binding through the kernel's sysfs PCI interface.
///
/// Prepare unbinds the function from its current driver, sets
/// `driver_override` to `vfio-pci` and re-probes it. Unprepare reverses that
/// and lets the kernel hand the function back to its default driver.
#[derive(Debug, Clone)]
pub struct SysfsVfioManager {
    sysfs_root: PathBuf,
}

impl SysfsVfioManager {
    pub fn new(sysfs_root: impl Into<PathBuf>) -> Self {
        Self {
            sysfs_root: sysfs_root.into(),
        }
    }

    fn pci_root(&self) -> PathBuf {
        self.sysfs_root.join("bus/pci")
    }

    fn device_dir(&self, pci_bus_id: &str) -> PathBuf {
        self.pci_root().join("devices").join(pci_bus_id)
    }

    /// Last path component of a sysfs symlink, e.g. the driver or IOMMU group name.
    async fn link_name(path: &Path) -> Option<String> {
        let target = tokio::fs::read_link(path).await.ok()?;
        target.file_name().map(|n| n.to_string_lossy().into_owned())
    }

    async fn sysfs_write(path: &Path, value: &str, pci_bus_id: &str) -> AgentResult<()> {
        tokio::fs::write(path, value).await.map_err(|e| {
            Report::new(e).change_context(AgentError::backend(format!(
                "VFIO: failed to write {} for {pci_bus_id}",
                path.display()
            )))
        })
    }

    async fn current_driver(&self, pci_bus_id: &str) -> Option<String> {
        Self::link_name(&self.device_dir(pci_bus_id).join("driver")).await
    }

    async fn bind_to_vfio(&self, pci_bus_id: &str) -> AgentResult<VfioBackendState> {
        let dev = self.device_dir(pci_bus_id);
        if !tokio::fs::try_exists(&dev).await.unwrap_or(false) {
            return Err(AgentError::backend(format!(
                "VFIO: PCI device {pci_bus_id} not found under {}",
                self.pci_root().display()
            ))
            .into());
        }

        let iommu_group = Self::link_name(&dev.join("iommu_group")).await;
        let original_driver = self.current_driver(pci_bus_id).await;

        if original_driver.as_deref() == Some(VFIO_PCI_DRIVER) {
            info!(pci_bus_id = %pci_bus_id, "device already bound to vfio-pci");
            return Ok(VfioBackendState {
                pci_bus_id: pci_bus_id.to_string(),
                original_driver,
                iommu_group,
            });
        }

        if original_driver.is_some() {
            Self::sysfs_write(&dev.join("driver/unbind"), pci_bus_id, pci_bus_id).await?;
        }
        Self::sysfs_write(&dev.join("driver_override"), VFIO_PCI_DRIVER, pci_bus_id).await?;
        Self::sysfs_write(&self.pci_root().join("drivers_probe"), pci_bus_id, pci_bus_id)
            .await?;

        info!(
            pci_bus_id = %pci_bus_id,
            original_driver = ?original_driver,
            iommu_group = ?iommu_group,
            "device bound to vfio-pci"
        );
        Ok(VfioBackendState {
            pci_bus_id: pci_bus_id.to_string(),
            original_driver,
            iommu_group,
        })
    }

    async fn restore(&self, state: &VfioBackendState) -> AgentResult<()> {
        let pci_bus_id = state.pci_bus_id.as_str();
        if state.original_driver.as_deref() == Some(VFIO_PCI_DRIVER) {
            // it was ours before prepare, leave it bound
            return Ok(());
        }

        let dev = self.device_dir(pci_bus_id);
        if self.current_driver(pci_bus_id).await.as_deref() == Some(VFIO_PCI_DRIVER) {
            Self::sysfs_write(&dev.join("driver/unbind"), pci_bus_id, pci_bus_id).await?;
        }
        // an empty override hands the device back to normal driver matching
        Self::sysfs_write(&dev.join("driver_override"), "\n", pci_bus_id).await?;
        Self::sysfs_write(&self.pci_root().join("drivers_probe"), pci_bus_id, pci_bus_id)
            .await?;

        info!(
            pci_bus_id = %pci_bus_id,
            original_driver = ?state.original_driver,
            "device released from vfio-pci"
        );
        Ok(())
    }
}

#[async_trait::async_trait]
impl VfioManager for SysfsVfioManager {
    async fn prepare(
        &self,
        ctx: &CancellationToken,
        request: &VfioPrepareRequest,
    ) -> AgentResult<VfioBackendState> {
        if ctx.is_cancelled() {
            return Err(AgentError::cancelled("VFIO prepare").into());
        }
        self.bind_to_vfio(&request.pci_bus_id)
            .await
            .attach_printable_lazy(|| format!("sysfs root: {}", self.sysfs_root.display()))
    }

    async fn unprepare(
        &self,
        ctx: &CancellationToken,
        state: &VfioBackendState,
    ) -> AgentResult<()> {
        if ctx.is_cancelled() {
            return Err(AgentError::cancelled("VFIO unprepare").into());
        }
        self.restore(state)
            .await
            .attach_printable_lazy(|| format!("sysfs root: {}", self.sysfs_root.display()))
    }
}

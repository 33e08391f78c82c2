//! Container Device Interface (CDI) descriptors for prepared claims.

use std::collections::BTreeMap;
use std::path::Path;
use std::path::PathBuf;

use api_types::PrepareDevice;
use api_types::PrepareRequest;
use error_stack::Report;
use error_stack::ResultExt;
use serde::Deserialize;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::attributes::attr_string;
use crate::attributes::ATTR_IOMMU_GROUP;
use crate::attributes::ATTR_MIG_DEVICE_UUID;
use crate::attributes::ATTR_UUID;
use crate::error::AgentError;
use crate::error::AgentResult;
use crate::fs::write_atomic;

const CDI_VERSION: &str = "0.6.0";
const VISIBLE_DEVICES_ENV: &str = "NVIDIA_VISIBLE_DEVICES";
const VFIO_CONTAINER_NODE: &str = "/dev/vfio/vfio";

/// Device name -> fully qualified CDI device ids.
pub type CdiDeviceIds = BTreeMap<String, Vec<String>>;

/// Writes and removes the descriptors the container runtime uses to attach devices.
#[async_trait::async_trait]
pub trait DeviceInterfaceWriter: Send + Sync {
    async fn write(&self, ctx: &CancellationToken, request: &PrepareRequest)
        -> AgentResult<CdiDeviceIds>;

    async fn delete(&self, ctx: &CancellationToken, claim_id: &str) -> AgentResult<()>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CdiSpec {
    pub cdi_version: String,
    pub kind: String,
    pub devices: Vec<CdiDevice>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CdiDevice {
    pub name: String,
    pub container_edits: ContainerEdits,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerEdits {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub device_nodes: Vec<DeviceNode>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceNode {
    pub path: String,
}

/// Writes one CDI spec file per claim into the CDI spec directory.
#[derive(Debug, Clone)]
pub struct CdiSpecWriter {
    root: PathBuf,
    kind: String,
}

impl CdiSpecWriter {
    /// `kind` is the CDI `vendor/class`, e.g. `nvidia.com/gpu`.
    pub fn new(root: impl Into<PathBuf>, kind: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            kind: kind.into(),
        }
    }

    /// Path of the spec file owned by `claim_id`.
    pub fn spec_path(&self, claim_id: &str) -> PathBuf {
        let vendor_class = self.kind.replace('/', "_");
        self.root
            .join(format!("{vendor_class}-claim_{claim_id}.json"))
    }

    fn device_name(claim_id: &str, device: &str) -> String {
        format!("{claim_id}-{device}")
    }

    fn container_edits(device: &PrepareDevice, vfio: bool) -> ContainerEdits {
        let mut edits = ContainerEdits::default();

        let mig_uuid = attr_string(&device.attributes, ATTR_MIG_DEVICE_UUID);
        let visible = if !mig_uuid.is_empty() {
            mig_uuid
        } else {
            attr_string(&device.attributes, ATTR_UUID)
        };

        if vfio {
            edits.device_nodes.push(DeviceNode {
                path: VFIO_CONTAINER_NODE.to_string(),
            });
            let group = attr_string(&device.attributes, ATTR_IOMMU_GROUP);
            if !group.is_empty() {
                edits.device_nodes.push(DeviceNode {
                    path: format!("/dev/vfio/{group}"),
                });
            }
        } else if !visible.is_empty() {
            edits.env.push(format!("{VISIBLE_DEVICES_ENV}={visible}"));
        }
        edits
    }

    fn build_spec(&self, request: &PrepareRequest) -> (CdiSpec, CdiDeviceIds) {
        let mut ids = CdiDeviceIds::new();
        let devices = request
            .devices
            .iter()
            .map(|device| {
                let name = Self::device_name(&request.claim_id, &device.device);
                ids.entry(device.device.clone())
                    .or_default()
                    .push(format!("{}={name}", self.kind));
                CdiDevice {
                    name,
                    container_edits: Self::container_edits(device, request.vfio),
                }
            })
            .collect();

        let spec = CdiSpec {
            cdi_version: CDI_VERSION.to_string(),
            kind: self.kind.clone(),
            devices,
        };
        (spec, ids)
    }

    async fn write_spec(&self, path: &Path, spec: &CdiSpec) -> AgentResult<()> {
        let descriptor_error =
            || AgentError::descriptor(format!("failed to write CDI spec {}", path.display()));

        let json = serde_json::to_vec_pretty(spec).change_context_lazy(descriptor_error)?;
        write_atomic(&self.root, path, json)
            .await
            .change_context_lazy(descriptor_error)
    }
}

#[async_trait::async_trait]
impl DeviceInterfaceWriter for CdiSpecWriter {
    async fn write(
        &self,
        ctx: &CancellationToken,
        request: &PrepareRequest,
    ) -> AgentResult<CdiDeviceIds> {
        if ctx.is_cancelled() {
            return Err(AgentError::cancelled("CDI spec write").into());
        }

        let path = self.spec_path(&request.claim_id);
        let (spec, ids) = self.build_spec(request);
        self.write_spec(&path, &spec).await?;

        info!(
            claim_id = %request.claim_id,
            path = %path.display(),
            devices = spec.devices.len(),
            "CDI spec written"
        );
        Ok(ids)
    }

    async fn delete(&self, ctx: &CancellationToken, claim_id: &str) -> AgentResult<()> {
        if ctx.is_cancelled() {
            return Err(AgentError::cancelled("CDI spec delete").into());
        }

        let path = self.spec_path(claim_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                info!(claim_id = %claim_id, path = %path.display(), "CDI spec deleted");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Report::new(e).change_context(AgentError::descriptor(format!(
                "failed to delete CDI spec {}",
                path.display()
            )))),
        }
    }
}

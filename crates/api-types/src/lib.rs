//! Shared API type definitions
//!
//! This crate contains the data model exchanged between the node agent and the
//! plugin RPC surface: claim preparation requests and results, the per-device
//! attribute bag, backend states, and the persisted checkpoint document.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;

/// Checkpoint version written when the stored document carries none.
pub const CHECKPOINT_VERSION_V1: &str = "v1";

/// Attribute key -> value bag published for every device.
pub type Attributes = BTreeMap<String, DeviceAttribute>;

/// Capacity name -> quantity consumed from a shared device.
pub type ConsumedCapacity = BTreeMap<String, String>;

/// A single typed device attribute.
///
/// Exactly one variant is present, so readers match on the kind instead of
/// probing optional fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeviceAttribute {
    String(String),
    Int(i64),
    Bool(bool),
    Version(String),
}

impl DeviceAttribute {
    /// Returns the string payload, if this is the string variant.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            DeviceAttribute::String(s) => Some(s),
            DeviceAttribute::Int(_) | DeviceAttribute::Bool(_) | DeviceAttribute::Version(_) => {
                None
            }
        }
    }
}

impl From<&str> for DeviceAttribute {
    fn from(value: &str) -> Self {
        DeviceAttribute::String(value.to_string())
    }
}

impl From<String> for DeviceAttribute {
    fn from(value: String) -> Self {
        DeviceAttribute::String(value)
    }
}

/// One device allocated to a claim.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrepareDevice {
    /// Request name inside the claim
    pub request: String,
    /// Resource pool the device was allocated from
    pub pool: String,
    /// Device name inside the pool
    pub device: String,
    #[serde(default)]
    pub attributes: Attributes,
    /// Set when the device is shared between several consumers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub share_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consumed_capacity: Option<ConsumedCapacity>,
}

impl PrepareDevice {
    /// Whether this allocation is a shared slice of the device rather than the whole device.
    pub fn is_shared(&self) -> bool {
        let has_share_id = self.share_id.as_deref().is_some_and(|id| !id.is_empty());
        let has_capacity = self
            .consumed_capacity
            .as_ref()
            .is_some_and(|capacity| !capacity.is_empty());
        has_share_id || has_capacity
    }
}

/// Request to prepare every device of a claim.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrepareRequest {
    #[serde(rename = "claimUID")]
    pub claim_id: String,
    pub devices: Vec<PrepareDevice>,
    /// Request exclusive VFIO passthrough for all devices
    #[serde(default)]
    pub vfio: bool,
}

/// A prepared device and the CDI device ids the runtime should inject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreparedDevice {
    pub request: String,
    pub pool: String,
    pub device: String,
    #[serde(rename = "cdiDeviceIDs")]
    pub cdi_device_ids: Vec<String>,
}

/// Result of a successful prepare call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrepareResult {
    #[serde(rename = "claimUID")]
    pub claim_id: String,
    pub devices: Vec<PreparedDevice>,
}

/// Parameters handed to the MIG backend to carve out a GPU instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigPrepareRequest {
    #[serde(rename = "pciBusID")]
    pub pci_bus_id: String,
    pub profile_id: u32,
    pub slice_start: u32,
    pub slice_count: u32,
}

/// Parameters handed to the VFIO backend to bind a PCI function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VfioPrepareRequest {
    #[serde(rename = "pciBusID")]
    pub pci_bus_id: String,
}

/// State returned by the MIG backend, required to tear the instance down again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigBackendState {
    #[serde(rename = "parentPciBusID")]
    pub parent_pci_bus_id: String,
    pub profile_id: u32,
    pub slice_start: u32,
    pub slice_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_instance_id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compute_instance_id: Option<u32>,
    /// UUID of the created MIG device, e.g. `MIG-...`
    pub device_uuid: String,
}

/// State returned by the VFIO backend, required to restore the original driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VfioBackendState {
    #[serde(rename = "pciBusID")]
    pub pci_bus_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_driver: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iommu_group: Option<String>,
}

/// Preparation progress of a claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClaimState {
    /// Backends prepared, descriptors not yet written
    PrepareStarted,
    /// Descriptors written, claim fully prepared
    PrepareCompleted,
}

impl std::fmt::Display for ClaimState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Persisted per-device preparation progress.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    pub request: String,
    pub pool: String,
    pub device: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mig: Option<MigBackendState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vfio: Option<VfioBackendState>,
    #[serde(rename = "cdiDeviceIDs", default, skip_serializing_if = "Vec::is_empty")]
    pub cdi_device_ids: Vec<String>,
}

impl DeviceRecord {
    /// Fresh record for a device that has not been touched yet.
    pub fn new(request: &str, pool: &str, device: &str) -> Self {
        Self {
            request: request.to_string(),
            pool: pool.to_string(),
            device: device.to_string(),
            ..Default::default()
        }
    }
}

/// Persisted preparation progress of a claim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimRecord {
    pub state: ClaimState,
    #[serde(default)]
    pub devices: Vec<DeviceRecord>,
}

impl ClaimRecord {
    pub fn device(&self, name: &str) -> Option<&DeviceRecord> {
        self.devices.iter().find(|record| record.device == name)
    }
}

/// Durable record of every claim prepared on this node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    #[serde(default)]
    pub version: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub claims: BTreeMap<String, ClaimRecord>,
}

/// Treats an explicit `null` the same as a missing field.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

//! Accessors over the per-device attribute bag.

use api_types::Attributes;
use api_types::DeviceAttribute;

/// Device type of the allocated device.
pub const ATTR_DEVICE_TYPE: &str = "type";
/// PCI bus address of the physical GPU (or the MIG parent).
pub const ATTR_PCI_BUS_ID: &str = "pciBusID";
/// UUID of a full GPU.
pub const ATTR_UUID: &str = "uuid";
/// IOMMU group of the PCI function.
pub const ATTR_IOMMU_GROUP: &str = "iommuGroup";
/// Injected for the descriptor writer once the MIG backend created the device.
pub const ATTR_MIG_DEVICE_UUID: &str = "migDeviceUUID";

pub const DEVICE_TYPE_MIG: &str = "mig";
pub const DEVICE_TYPE_PHYSICAL: &str = "physical";

/// Trimmed string value of `key`, or an empty string when the key is missing
/// or holds a non-string attribute.
pub fn attr_string(bag: &Attributes, key: &str) -> String {
    bag.get(key)
        .and_then(DeviceAttribute::as_str)
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}

/// Independent copy of the bag, safe to mutate without touching the caller's data.
pub fn clone_attributes(bag: &Attributes) -> Attributes {
    bag.iter()
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

pub fn is_mig_device(device_type: &str) -> bool {
    device_type.eq_ignore_ascii_case(DEVICE_TYPE_MIG)
}

pub fn is_physical_device(device_type: &str) -> bool {
    device_type.eq_ignore_ascii_case(DEVICE_TYPE_PHYSICAL)
}

//! Process-wide Vulkan loading.
//!
//! The loader entry is shared by every instance in the process.
//! `load_vulkan`/`unload_vulkan` form an idempotent pair; all contexts must
//! be dropped before unloading.

use crate::error::{GpuError, Result};
use crate::instance::create_instance;
use ash::vk;
use parking_lot::Mutex;
use std::ffi::CStr;

static VULKAN_ENTRY: Mutex<Option<ash::Entry>> = Mutex::new(None);

/// Load the Vulkan library. Calling it again is a no-op.
pub fn load_vulkan() -> Result<()> {
    let mut entry = VULKAN_ENTRY.lock();
    if entry.is_none() {
        let loaded =
            unsafe { ash::Entry::load() }.map_err(|e| GpuError::LoadingFailed(e.to_string()))?;
        tracing::debug!("Vulkan library loaded");
        *entry = Some(loaded);
    }
    Ok(())
}

/// Drop the process-wide Vulkan entry. No-op when not loaded.
pub fn unload_vulkan() {
    if VULKAN_ENTRY.lock().take().is_some() {
        tracing::debug!("Vulkan library unloaded");
    }
}

/// Get a handle to the loaded entry.
pub fn entry() -> Result<ash::Entry> {
    VULKAN_ENTRY.lock().clone().ok_or(GpuError::VulkanNotLoaded)
}

/// Names of the Vulkan-capable GPUs, in physical-device order.
///
/// The order matches the `gpu_device_index` configuration field.
pub fn enumerate_gpu_names() -> Result<Vec<String>> {
    let entry = entry()?;
    let instance = unsafe { create_instance(&entry, "vulkansift-enum", false, false) }?;

    let names = unsafe {
        let devices = match instance.enumerate_physical_devices() {
            Ok(devices) => devices,
            Err(e) => {
                instance.destroy_instance(None);
                return Err(GpuError::from(e));
            }
        };
        let names: Vec<String> = devices
            .iter()
            .map(|&device| unsafe { physical_device_name(&instance, device) })
            .collect();
        instance.destroy_instance(None);
        names
    };

    Ok(names)
}

pub(crate) unsafe fn physical_device_name(
    instance: &ash::Instance,
    device: vk::PhysicalDevice,
) -> String {
    let properties = unsafe { instance.get_physical_device_properties(device) };
    unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }
        .to_string_lossy()
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_is_unavailable_before_loading() {
        // No test in this binary loads Vulkan, so the process-wide entry
        // must still be empty
        assert!(matches!(entry(), Err(GpuError::VulkanNotLoaded)));
    }
}

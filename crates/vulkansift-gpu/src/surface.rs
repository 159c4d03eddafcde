//! Surface management for the debug window.
//!
//! The library never creates windows; the caller hands over raw window and
//! display handles and keeps the window alive for the surface's lifetime.

use crate::context::GpuContext;
use crate::error::{GpuError, Result};
use crate::swapchain::{calculate_extent, select_present_mode, select_surface_format, Swapchain};
use ash::vk;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};

/// Surface context for the debug window.
pub struct SurfaceContext {
    /// The Vulkan surface handle.
    pub surface: vk::SurfaceKHR,
    /// Surface extension loader.
    pub surface_loader: ash::khr::surface::Instance,
    /// Swapchain extension loader.
    pub swapchain_loader: ash::khr::swapchain::Device,
}

impl SurfaceContext {
    /// Create a surface from raw window handles.
    ///
    /// # Safety
    /// The GPU context must be valid and the handles must refer to a live
    /// window that outlives the surface.
    pub unsafe fn from_raw_handles(
        gpu: &GpuContext,
        display: RawDisplayHandle,
        window: RawWindowHandle,
    ) -> Result<Self> {
        let surface = unsafe {
            ash_window::create_surface(&gpu.entry, gpu.instance(), display, window, None)
                .map_err(|e| GpuError::SurfaceCreation(e.to_string()))?
        };

        let surface_loader = ash::khr::surface::Instance::new(&gpu.entry, gpu.instance());
        let swapchain_loader = ash::khr::swapchain::Device::new(gpu.instance(), gpu.device());

        // The present queue is the graphics queue; refuse surfaces it
        // cannot present to rather than fail at present time
        let supported = unsafe {
            surface_loader.get_physical_device_surface_support(
                gpu.physical_device(),
                gpu.graphics_queue_family(),
                surface,
            )?
        };
        if !supported {
            unsafe { surface_loader.destroy_surface(surface, None) };
            return Err(GpuError::SurfaceCreation(
                "graphics queue cannot present to the provided window".to_string(),
            ));
        }

        Ok(Self {
            surface,
            surface_loader,
            swapchain_loader,
        })
    }

    /// Create a swapchain for this surface sized to its current extent.
    ///
    /// # Safety
    /// The GPU context must be valid.
    pub unsafe fn create_swapchain(
        &self,
        gpu: &GpuContext,
        old_swapchain: Option<vk::SwapchainKHR>,
    ) -> Result<Swapchain> {
        let capabilities = unsafe {
            self.surface_loader
                .get_physical_device_surface_capabilities(gpu.physical_device(), self.surface)?
        };
        let formats = unsafe {
            self.surface_loader
                .get_physical_device_surface_formats(gpu.physical_device(), self.surface)?
        };
        let present_modes = unsafe {
            self.surface_loader
                .get_physical_device_surface_present_modes(gpu.physical_device(), self.surface)?
        };

        let surface_format = select_surface_format(&formats);
        let present_mode = select_present_mode(&present_modes);
        let extent = calculate_extent(&capabilities);

        unsafe {
            Swapchain::new(
                &self.swapchain_loader,
                self.surface,
                &capabilities,
                surface_format,
                present_mode,
                extent,
                old_swapchain,
                gpu.graphics_queue_family(),
            )
        }
    }

    /// Destroy the surface.
    ///
    /// # Safety
    /// The surface must not be in use.
    pub unsafe fn destroy(&self) {
        unsafe { self.surface_loader.destroy_surface(self.surface, None) };
    }
}

//! Vulkan abstraction layer for VulkanSift.
//!
//! This crate provides:
//! - Process-wide Vulkan loading and GPU enumeration
//! - Logical device and queue management
//! - Memory allocation via gpu-allocator
//! - Buffer and image wrappers that track their own access state and
//!   produce the pipeline barriers for each transition
//! - Command pools, fences, descriptors and compute pipelines
//! - The optional debug surface/swapchain

pub mod capabilities;
pub mod command;
pub mod context;
pub mod descriptors;
pub mod error;
pub mod instance;
pub mod loader;
pub mod memory;
pub mod pipeline;
pub mod surface;
pub mod swapchain;
pub mod sync;

pub use capabilities::{GpuCapabilities, GpuVendor};
pub use context::{GpuContext, GpuContextBuilder};
pub use descriptors::{
    write_combined_image_sampler, write_sampled_image_array, write_storage_buffer,
    write_storage_image, DescriptorPool, DescriptorSetLayoutBuilder,
};
pub use error::{GpuError, Result};
pub use loader::{enumerate_gpu_names, load_vulkan, unload_vulkan};
pub use memory::{GpuAllocator, GpuBuffer, GpuImage};
pub use pipeline::ComputePipeline;
pub use surface::SurfaceContext;
pub use swapchain::Swapchain;
pub use sync::{create_fence, create_semaphore, fence_status, reset_fence, wait_for_fence};

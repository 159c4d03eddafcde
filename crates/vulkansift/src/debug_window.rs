//! Debug frame presentation.
//!
//! Graphics debuggers such as RenderDoc key on frame delimiters and cannot
//! attach to compute-only applications; presenting an empty frame per
//! detection loop gives them something to latch onto. The caller owns the
//! window and hands over raw handles at instance creation.

use ash::vk;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use vulkansift_gpu::command::{begin_command_buffer, end_command_buffer, CommandPool};
use vulkansift_gpu::error::Result;
use vulkansift_gpu::sync::{create_fence, create_semaphore, reset_fence, wait_for_fence};
use vulkansift_gpu::{GpuContext, SurfaceContext, Swapchain};

/// Raw handles of a caller-owned window used for debug presentation.
#[derive(Clone, Copy)]
pub struct ExternalWindowInfo {
    pub display: RawDisplayHandle,
    pub window: RawWindowHandle,
}

/// Swapchain state for the debug window.
pub struct DebugWindow {
    surface: SurfaceContext,
    swapchain: Option<Swapchain>,
    command_pool: CommandPool,
    command_buffer: vk::CommandBuffer,
    acquire_semaphore: vk::Semaphore,
    present_semaphore: vk::Semaphore,
    frame_fence: vk::Fence,
    alive: bool,
}

impl DebugWindow {
    /// Create the surface and swapchain for the provided window handles.
    pub fn new(context: &GpuContext, window_info: &ExternalWindowInfo) -> Result<Self> {
        let device = context.device();
        unsafe {
            let surface = SurfaceContext::from_raw_handles(
                context,
                window_info.display,
                window_info.window,
            )?;
            let swapchain = surface.create_swapchain(context, None)?;

            let command_pool = CommandPool::new(
                device,
                context.graphics_queue_family(),
                vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            )?;
            let command_buffer = command_pool.allocate_command_buffer(device)?;

            Ok(Self {
                surface,
                swapchain: Some(swapchain),
                command_pool,
                command_buffer,
                acquire_semaphore: create_semaphore(device)?,
                present_semaphore: create_semaphore(device)?,
                frame_fence: create_fence(device, false)?,
                alive: true,
            })
        }
    }

    /// Present one cleared frame. Returns false once the surface is gone,
    /// after which the window is considered closed.
    pub fn present_frame(&mut self, context: &GpuContext) -> bool {
        if !self.alive {
            return false;
        }
        match self.try_present(context) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Debug window presentation stopped: {e}");
                self.alive = false;
                false
            }
        }
    }

    fn try_present(&mut self, context: &GpuContext) -> Result<()> {
        let device = context.device();

        unsafe {
            let mut swapchain = self.swapchain.take().expect("swapchain present while alive");

            let acquired = swapchain.acquire_next_image(
                &self.surface.swapchain_loader,
                self.acquire_semaphore,
                u64::MAX,
            );
            let (image_index, suboptimal) = match acquired {
                Ok(result) => result,
                Err(_) => {
                    // Window resized or invalidated: rebuild and retry on
                    // the next frame
                    let rebuilt = self
                        .surface
                        .create_swapchain(context, Some(swapchain.swapchain))?;
                    swapchain.destroy(&self.surface.swapchain_loader);
                    self.swapchain = Some(rebuilt);
                    return Ok(());
                }
            };

            let image = swapchain.images[image_index as usize];
            let range = vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            };

            begin_command_buffer(
                device,
                self.command_buffer,
                vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
            )?;

            let to_transfer = vk::ImageMemoryBarrier2::default()
                .src_stage_mask(vk::PipelineStageFlags2::TOP_OF_PIPE)
                .src_access_mask(vk::AccessFlags2::NONE)
                .dst_stage_mask(vk::PipelineStageFlags2::TRANSFER)
                .dst_access_mask(vk::AccessFlags2::TRANSFER_WRITE)
                .old_layout(vk::ImageLayout::UNDEFINED)
                .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                .image(image)
                .subresource_range(range);
            let dependency = vk::DependencyInfo::default()
                .image_memory_barriers(std::slice::from_ref(&to_transfer));
            device.cmd_pipeline_barrier2(self.command_buffer, &dependency);

            let clear_color = vk::ClearColorValue {
                float32: [0.0, 0.0, 0.0, 1.0],
            };
            device.cmd_clear_color_image(
                self.command_buffer,
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &clear_color,
                &[range],
            );

            let to_present = vk::ImageMemoryBarrier2::default()
                .src_stage_mask(vk::PipelineStageFlags2::TRANSFER)
                .src_access_mask(vk::AccessFlags2::TRANSFER_WRITE)
                .dst_stage_mask(vk::PipelineStageFlags2::BOTTOM_OF_PIPE)
                .dst_access_mask(vk::AccessFlags2::NONE)
                .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                .new_layout(vk::ImageLayout::PRESENT_SRC_KHR)
                .image(image)
                .subresource_range(range);
            let dependency = vk::DependencyInfo::default()
                .image_memory_barriers(std::slice::from_ref(&to_present));
            device.cmd_pipeline_barrier2(self.command_buffer, &dependency);

            end_command_buffer(device, self.command_buffer)?;

            let wait_semaphores = [self.acquire_semaphore];
            let wait_stages = [vk::PipelineStageFlags::TRANSFER];
            let signal_semaphores = [self.present_semaphore];
            let command_buffers = [self.command_buffer];
            let submit_info = vk::SubmitInfo::default()
                .wait_semaphores(&wait_semaphores)
                .wait_dst_stage_mask(&wait_stages)
                .command_buffers(&command_buffers)
                .signal_semaphores(&signal_semaphores);
            device.queue_submit(context.graphics_queue(), &[submit_info], self.frame_fence)?;

            let out_of_date = swapchain.present(
                &self.surface.swapchain_loader,
                context.graphics_queue(),
                image_index,
                &signal_semaphores,
            )?;

            wait_for_fence(device, self.frame_fence, u64::MAX)?;
            reset_fence(device, self.frame_fence)?;

            if suboptimal || out_of_date {
                let rebuilt = self
                    .surface
                    .create_swapchain(context, Some(swapchain.swapchain))?;
                swapchain.destroy(&self.surface.swapchain_loader);
                self.swapchain = Some(rebuilt);
            } else {
                self.swapchain = Some(swapchain);
            }
        }

        Ok(())
    }

    /// Destroy surface and swapchain resources.
    ///
    /// # Safety
    /// The device must be idle.
    pub unsafe fn destroy(&mut self, context: &GpuContext) {
        let device = context.device();
        unsafe {
            if let Some(swapchain) = self.swapchain.take() {
                swapchain.destroy(&self.surface.swapchain_loader);
            }
            device.destroy_semaphore(self.acquire_semaphore, None);
            device.destroy_semaphore(self.present_semaphore, None);
            device.destroy_fence(self.frame_fence, None);
            self.command_pool.destroy(device);
            self.surface.destroy();
        }
    }
}

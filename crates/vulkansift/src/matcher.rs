//! Brute-force 2-nearest-neighbor descriptor matching.
//!
//! One match buffer exists per instance; the prepare kernel copies slot
//! A's feature count into its header and sizes the indirect dispatch, so
//! only one match can be in flight at a time.

use ash::vk;
use gpu_allocator::MemoryLocation;
use vulkansift_core::constants::FEATURE_BUFFER_HEADER_SIZE;
use vulkansift_core::SiftConfig;
use vulkansift_gpu::command::pipeline_barrier;
use vulkansift_gpu::descriptors::{write_storage_buffer, DescriptorPool};
use vulkansift_gpu::error::Result;
use vulkansift_gpu::memory::{GpuAllocator, GpuBuffer};
use vulkansift_gpu::pipeline::ComputePipeline;
use vulkansift_shaders::DescriptorKind;

use crate::detector::{Detector, PreparePush, INDIRECT_SLOT_MATCH, MATCH_GROUP_SIZE};

/// Byte stride of one 2-NN match record.
const MATCH_STRIDE: u64 = 20;

/// The matching pipeline and its output buffer.
pub struct Matcher {
    capacity: u32,
    pub(crate) match_buffer: GpuBuffer,
    pipeline: ComputePipeline,
    pool: DescriptorPool,
    prepare_set: vk::DescriptorSet,
    match_set: vk::DescriptorSet,
}

impl Matcher {
    /// Create the match pipeline; set layouts are shared with the
    /// detector's prepare pass (three storage buffers).
    pub fn new(
        device: &ash::Device,
        allocator: &mut GpuAllocator,
        config: &SiftConfig,
        detector: &Detector,
    ) -> Result<Self> {
        let capacity = config.max_nb_sift_per_buffer;
        let match_buffer = allocator.create_buffer(
            FEATURE_BUFFER_HEADER_SIZE + u64::from(capacity) * MATCH_STRIDE,
            vk::BufferUsageFlags::STORAGE_BUFFER
                | vk::BufferUsageFlags::TRANSFER_SRC
                | vk::BufferUsageFlags::TRANSFER_DST,
            MemoryLocation::GpuOnly,
            "sift_matches",
        )?;

        let descriptor_kind = match config.descriptor_format {
            vulkansift_core::DescriptorFormat::Ubc1 => DescriptorKind::Ubc1,
            vulkansift_core::DescriptorFormat::Ubc2 => DescriptorKind::Ubc2,
        };
        let pipeline = unsafe {
            ComputePipeline::new(
                device,
                vulkansift_shaders::match_nearest_neighbors(descriptor_kind),
                &[detector.prepare_layout],
                &[],
            )?
        };

        let pool_sizes = [vk::DescriptorPoolSize::default()
            .ty(vk::DescriptorType::STORAGE_BUFFER)
            .descriptor_count(6)];
        let pool = unsafe { DescriptorPool::new(device, 2, &pool_sizes)? };
        let sets =
            unsafe { pool.allocate(device, &[detector.prepare_layout, detector.prepare_layout])? };

        Ok(Self {
            capacity,
            match_buffer,
            pipeline,
            pool,
            prepare_set: sets[0],
            match_set: sets[1],
        })
    }

    /// Record a match of slot A against slot B. Both descriptor sets are
    /// rewritten for the pair, which is safe because the caller has waited
    /// on any previous match fence.
    ///
    /// # Safety
    /// The command buffer must be in recording state.
    pub unsafe fn record_match(
        &mut self,
        device: &ash::Device,
        cmd: vk::CommandBuffer,
        detector: &mut Detector,
        slot_a: &mut GpuBuffer,
        slot_b: &mut GpuBuffer,
    ) -> Result<()> {
        unsafe {
            write_storage_buffer(
                device,
                self.prepare_set,
                0,
                slot_a.buffer,
                0,
                FEATURE_BUFFER_HEADER_SIZE,
            );
            write_storage_buffer(
                device,
                self.prepare_set,
                1,
                detector.indirect_buffer.buffer,
                0,
                vk::WHOLE_SIZE,
            );
            write_storage_buffer(
                device,
                self.prepare_set,
                2,
                self.match_buffer.buffer,
                0,
                FEATURE_BUFFER_HEADER_SIZE,
            );

            write_storage_buffer(device, self.match_set, 0, slot_a.buffer, 0, vk::WHOLE_SIZE);
            write_storage_buffer(device, self.match_set, 1, slot_b.buffer, 0, vk::WHOLE_SIZE);
            write_storage_buffer(
                device,
                self.match_set,
                2,
                self.match_buffer.buffer,
                0,
                vk::WHOLE_SIZE,
            );

            // Copy |A| into the match header and size the dispatch
            let barriers = [
                slot_a.barrier_and_update(
                    vk::PipelineStageFlags2::COMPUTE_SHADER,
                    vk::AccessFlags2::SHADER_STORAGE_READ
                        | vk::AccessFlags2::SHADER_STORAGE_WRITE,
                ),
                self.match_buffer.barrier_and_update(
                    vk::PipelineStageFlags2::COMPUTE_SHADER,
                    vk::AccessFlags2::SHADER_STORAGE_WRITE,
                ),
                detector.indirect_buffer.barrier_and_update(
                    vk::PipelineStageFlags2::COMPUTE_SHADER,
                    vk::AccessFlags2::SHADER_STORAGE_WRITE,
                ),
            ];
            pipeline_barrier(device, cmd, &barriers, &[]);

            detector
                .prepare_pipeline
                .bind(device, cmd, self.prepare_set);
            detector.prepare_pipeline.push_constants(
                device,
                cmd,
                &PreparePush {
                    capacity: self.capacity,
                    slot: INDIRECT_SLOT_MATCH,
                    group_size: MATCH_GROUP_SIZE,
                },
            );
            device.cmd_dispatch(cmd, 1, 1, 1);

            // The 2-NN search proper
            let barriers = [
                detector.indirect_buffer.barrier_and_update(
                    vk::PipelineStageFlags2::DRAW_INDIRECT,
                    vk::AccessFlags2::INDIRECT_COMMAND_READ,
                ),
                slot_a.barrier_and_update(
                    vk::PipelineStageFlags2::COMPUTE_SHADER,
                    vk::AccessFlags2::SHADER_STORAGE_READ,
                ),
                slot_b.barrier_and_update(
                    vk::PipelineStageFlags2::COMPUTE_SHADER,
                    vk::AccessFlags2::SHADER_STORAGE_READ,
                ),
                self.match_buffer.barrier_and_update(
                    vk::PipelineStageFlags2::COMPUTE_SHADER,
                    vk::AccessFlags2::SHADER_STORAGE_READ
                        | vk::AccessFlags2::SHADER_STORAGE_WRITE,
                ),
            ];
            pipeline_barrier(device, cmd, &barriers, &[]);

            self.pipeline.bind(device, cmd, self.match_set);
            device.cmd_dispatch_indirect(
                cmd,
                detector.indirect_buffer.buffer,
                u64::from(INDIRECT_SLOT_MATCH) * 16,
            );
        }

        Ok(())
    }

    /// Destroy all GPU resources.
    ///
    /// # Safety
    /// The device must be valid and no recorded work may reference the
    /// match buffer.
    pub unsafe fn destroy(
        &mut self,
        device: &ash::Device,
        allocator: &mut GpuAllocator,
    ) -> Result<()> {
        allocator.free_buffer(&mut self.match_buffer)?;
        unsafe {
            self.pipeline.destroy(device);
            self.pool.destroy(device);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn match_record_stride_matches_std430() {
        assert_eq!(
            MATCH_STRIDE,
            std::mem::size_of::<vulkansift_core::Match2NN>() as u64
        );
    }
}

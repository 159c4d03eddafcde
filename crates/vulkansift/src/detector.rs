//! Feature extraction pipelines.
//!
//! Detection runs in three GPU passes chained through indirect dispatches:
//! extremum extraction appends refined candidates, orientation assignment
//! turns candidates into oriented keypoints, and descriptor computation
//! writes the final feature records into the target slot. Counters are
//! clamped to capacity between passes by a single-invocation prepare
//! kernel that also derives the next dispatch size.

use ash::vk;
use bytemuck::{Pod, Zeroable};
use gpu_allocator::MemoryLocation;
use vulkansift_core::constants::{FEATURE_BUFFER_HEADER_SIZE, MAX_OCTAVES};
use vulkansift_core::SiftConfig;
use vulkansift_gpu::command::pipeline_barrier;
use vulkansift_gpu::descriptors::{
    write_sampled_image_array, write_storage_buffer, DescriptorPool, DescriptorSetLayoutBuilder,
};
use vulkansift_gpu::error::Result;
use vulkansift_gpu::memory::{GpuAllocator, GpuBuffer};
use vulkansift_gpu::pipeline::ComputePipeline;
use vulkansift_shaders::DescriptorKind;

use crate::scale_space::ScaleSpace;

/// Byte stride of one candidate record (9 std430 scalars).
const CANDIDATE_STRIDE: u64 = 36;
/// Byte stride of one oriented keypoint record (10 std430 scalars).
const ORIENTED_STRIDE: u64 = 40;

/// Indirect-command slots within the shared indirect buffer.
const INDIRECT_SLOT_ORIENTATION: u32 = 0;
const INDIRECT_SLOT_DESCRIPTOR: u32 = 1;
pub(crate) const INDIRECT_SLOT_MATCH: u32 = 2;
const INDIRECT_BUFFER_SIZE: u64 = 48;

/// Match kernel workgroup width; must match the shader's local size.
pub(crate) const MATCH_GROUP_SIZE: u32 = 64;

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct ExtractPush {
    octave: u32,
    nb_scales: u32,
    max_candidates: u32,
    max_refine_steps: u32,
    intensity_threshold: f32,
    edge_threshold: f32,
    seed_sigma: f32,
    octave_input_scale: f32,
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub(crate) struct PreparePush {
    pub capacity: u32,
    pub slot: u32,
    pub group_size: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct OrientationPush {
    max_keypoints: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct DescriptorPush {
    upsample_factor: f32,
}

/// The feature extractor: pipelines, intermediate buffers and per-slot
/// descriptor sets.
pub struct Detector {
    config: SiftConfig,

    candidate_buffer: GpuBuffer,
    oriented_buffer: GpuBuffer,
    pub(crate) indirect_buffer: GpuBuffer,

    extract_layout: vk::DescriptorSetLayout,
    keypoint_layout: vk::DescriptorSetLayout,
    pub(crate) prepare_layout: vk::DescriptorSetLayout,
    pool: DescriptorPool,

    extract_pipeline: ComputePipeline,
    orientation_pipeline: ComputePipeline,
    descriptor_pipeline: ComputePipeline,
    pub(crate) prepare_pipeline: ComputePipeline,

    extract_sets: Vec<vk::DescriptorSet>,
    orientation_set: vk::DescriptorSet,
    descriptor_sets: Vec<vk::DescriptorSet>,
    prepare_candidates_set: vk::DescriptorSet,
    prepare_features_sets: Vec<vk::DescriptorSet>,
}

impl Detector {
    /// Create pipelines and intermediate buffers; `slot_buffers` are the
    /// per-slot feature buffer handles the descriptor pass writes into.
    pub fn new(
        device: &ash::Device,
        allocator: &mut GpuAllocator,
        config: &SiftConfig,
        slot_buffers: &[vk::Buffer],
    ) -> Result<Self> {
        let capacity = u64::from(config.max_nb_sift_per_buffer);

        let candidate_buffer = allocator.create_buffer(
            FEATURE_BUFFER_HEADER_SIZE + capacity * CANDIDATE_STRIDE,
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
            MemoryLocation::GpuOnly,
            "sift_candidates",
        )?;
        let oriented_buffer = allocator.create_buffer(
            FEATURE_BUFFER_HEADER_SIZE + capacity * ORIENTED_STRIDE,
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
            MemoryLocation::GpuOnly,
            "sift_oriented",
        )?;
        let indirect_buffer = allocator.create_buffer(
            INDIRECT_BUFFER_SIZE,
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::INDIRECT_BUFFER,
            MemoryLocation::GpuOnly,
            "sift_indirect",
        )?;

        let extract_layout = unsafe {
            DescriptorSetLayoutBuilder::new()
                .sampled_image(0, vk::ShaderStageFlags::COMPUTE)
                .storage_buffer(1, vk::ShaderStageFlags::COMPUTE)
                .build(device)?
        };
        // Orientation and descriptor passes share one shape: two storage
        // buffers plus the runtime-indexed octave array
        let keypoint_layout = unsafe {
            DescriptorSetLayoutBuilder::new()
                .storage_buffer(0, vk::ShaderStageFlags::COMPUTE)
                .storage_buffer(1, vk::ShaderStageFlags::COMPUTE)
                .sampled_image_array(2, MAX_OCTAVES, vk::ShaderStageFlags::COMPUTE)
                .build(device)?
        };
        let prepare_layout = unsafe {
            DescriptorSetLayoutBuilder::new()
                .storage_buffer(0, vk::ShaderStageFlags::COMPUTE)
                .storage_buffer(1, vk::ShaderStageFlags::COMPUTE)
                .storage_buffer(2, vk::ShaderStageFlags::COMPUTE)
                .build(device)?
        };

        let nb_slots = config.sift_buffer_count;
        let max_sets = MAX_OCTAVES + 1 + nb_slots + 1 + nb_slots + 2;
        let pool_sizes = [
            vk::DescriptorPoolSize::default()
                .ty(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                .descriptor_count(MAX_OCTAVES + (1 + nb_slots) * MAX_OCTAVES),
            vk::DescriptorPoolSize::default()
                .ty(vk::DescriptorType::STORAGE_BUFFER)
                .descriptor_count(MAX_OCTAVES + (1 + nb_slots) * 2 + (2 + nb_slots + 2) * 3),
        ];
        let pool = unsafe { DescriptorPool::new(device, max_sets, &pool_sizes)? };

        let descriptor_kind = match config.descriptor_format {
            vulkansift_core::DescriptorFormat::Ubc1 => DescriptorKind::Ubc1,
            vulkansift_core::DescriptorFormat::Ubc2 => DescriptorKind::Ubc2,
        };

        let extract_pipeline = unsafe {
            ComputePipeline::new(
                device,
                vulkansift_shaders::extract_keypoints(),
                &[extract_layout],
                &[push_range::<ExtractPush>()],
            )?
        };
        let orientation_pipeline = unsafe {
            ComputePipeline::new(
                device,
                vulkansift_shaders::compute_orientation(),
                &[keypoint_layout],
                &[push_range::<OrientationPush>()],
            )?
        };
        let descriptor_pipeline = unsafe {
            ComputePipeline::new(
                device,
                vulkansift_shaders::compute_descriptors(descriptor_kind),
                &[keypoint_layout],
                &[push_range::<DescriptorPush>()],
            )?
        };
        let prepare_pipeline = unsafe {
            ComputePipeline::new(
                device,
                vulkansift_shaders::prepare_indirect(),
                &[prepare_layout],
                &[push_range::<PreparePush>()],
            )?
        };

        // Persistent sets: orientation, per-slot descriptor, and the
        // prepare sets for the candidate and per-slot feature counters
        let mut layouts = vec![keypoint_layout; 1 + nb_slots as usize];
        layouts.extend(vec![prepare_layout; 1 + nb_slots as usize]);
        let mut sets = unsafe { pool.allocate(device, &layouts)? };

        let orientation_set = sets.remove(0);
        let descriptor_sets: Vec<_> = sets.drain(..nb_slots as usize).collect();
        let prepare_candidates_set = sets.remove(0);
        let prepare_features_sets = sets;

        let detector = Self {
            config: config.clone(),
            candidate_buffer,
            oriented_buffer,
            indirect_buffer,
            extract_layout,
            keypoint_layout,
            prepare_layout,
            pool,
            extract_pipeline,
            orientation_pipeline,
            descriptor_pipeline,
            prepare_pipeline,
            extract_sets: Vec::new(),
            orientation_set,
            descriptor_sets,
            prepare_candidates_set,
            prepare_features_sets,
        };

        unsafe {
            write_storage_buffer(
                device,
                detector.orientation_set,
                0,
                detector.candidate_buffer.buffer,
                0,
                vk::WHOLE_SIZE,
            );
            write_storage_buffer(
                device,
                detector.orientation_set,
                1,
                detector.oriented_buffer.buffer,
                0,
                vk::WHOLE_SIZE,
            );

            write_storage_buffer(
                device,
                detector.prepare_candidates_set,
                0,
                detector.candidate_buffer.buffer,
                0,
                FEATURE_BUFFER_HEADER_SIZE,
            );
            write_storage_buffer(
                device,
                detector.prepare_candidates_set,
                1,
                detector.indirect_buffer.buffer,
                0,
                vk::WHOLE_SIZE,
            );
            write_storage_buffer(
                device,
                detector.prepare_candidates_set,
                2,
                detector.candidate_buffer.buffer,
                0,
                FEATURE_BUFFER_HEADER_SIZE,
            );

            for (slot, &slot_buffer) in slot_buffers.iter().enumerate() {
                write_storage_buffer(
                    device,
                    detector.descriptor_sets[slot],
                    0,
                    detector.oriented_buffer.buffer,
                    0,
                    vk::WHOLE_SIZE,
                );
                write_storage_buffer(
                    device,
                    detector.descriptor_sets[slot],
                    1,
                    slot_buffer,
                    0,
                    vk::WHOLE_SIZE,
                );

                write_storage_buffer(
                    device,
                    detector.prepare_features_sets[slot],
                    0,
                    detector.oriented_buffer.buffer,
                    0,
                    FEATURE_BUFFER_HEADER_SIZE,
                );
                write_storage_buffer(
                    device,
                    detector.prepare_features_sets[slot],
                    1,
                    detector.indirect_buffer.buffer,
                    0,
                    vk::WHOLE_SIZE,
                );
                write_storage_buffer(
                    device,
                    detector.prepare_features_sets[slot],
                    2,
                    slot_buffer,
                    0,
                    FEATURE_BUFFER_HEADER_SIZE,
                );
            }
        }

        Ok(detector)
    }

    /// Refresh every descriptor set referencing pyramid image views after
    /// a resolution change.
    pub fn on_resolution_change(
        &mut self,
        device: &ash::Device,
        scale_space: &mut ScaleSpace,
    ) -> Result<()> {
        if !self.extract_sets.is_empty() {
            unsafe { self.pool.free(device, &self.extract_sets)? };
            self.extract_sets.clear();
        }

        let nb_octaves = scale_space.octave_count() as usize;
        let layouts = vec![self.extract_layout; nb_octaves];
        self.extract_sets = unsafe { self.pool.allocate(device, &layouts)? };

        let sampler = scale_space.sampler();
        let octaves = scale_space.octaves();

        let mut gauss_infos = Vec::with_capacity(nb_octaves);
        for (octave_idx, octave) in octaves.iter().enumerate() {
            unsafe {
                vulkansift_gpu::descriptors::write_combined_image_sampler(
                    device,
                    self.extract_sets[octave_idx],
                    0,
                    octave.dog.view,
                    vk::ImageLayout::GENERAL,
                    sampler,
                );
                write_storage_buffer(
                    device,
                    self.extract_sets[octave_idx],
                    1,
                    self.candidate_buffer.buffer,
                    0,
                    vk::WHOLE_SIZE,
                );
            }
            gauss_infos.push(
                vk::DescriptorImageInfo::default()
                    .sampler(sampler)
                    .image_view(octave.gauss.view)
                    .image_layout(vk::ImageLayout::GENERAL),
            );
        }

        unsafe {
            write_sampled_image_array(device, self.orientation_set, 2, &gauss_infos);
            for set in &self.descriptor_sets {
                write_sampled_image_array(device, *set, 2, &gauss_infos);
            }
        }

        Ok(())
    }

    /// Record the three detection passes into `cmd`, targeting one slot.
    /// The scale-space build must already be recorded.
    ///
    /// # Safety
    /// The command buffer must be in recording state.
    pub unsafe fn record_detect(
        &mut self,
        device: &ash::Device,
        cmd: vk::CommandBuffer,
        scale_space: &mut ScaleSpace,
        slot_buffer: &mut GpuBuffer,
        slot: usize,
    ) -> Result<()> {
        let capacity = self.config.max_nb_sift_per_buffer;
        let nb_scales = self.config.nb_scales_per_octave;
        let upsample_factor = if self.config.use_upsampling { 0.5 } else { 1.0 };

        unsafe {
            // Reset the append counters
            let buffer_barriers = [
                self.candidate_buffer.barrier_and_update(
                    vk::PipelineStageFlags2::TRANSFER,
                    vk::AccessFlags2::TRANSFER_WRITE,
                ),
                self.oriented_buffer.barrier_and_update(
                    vk::PipelineStageFlags2::TRANSFER,
                    vk::AccessFlags2::TRANSFER_WRITE,
                ),
            ];
            pipeline_barrier(device, cmd, &buffer_barriers, &[]);
            device.cmd_fill_buffer(cmd, self.candidate_buffer.buffer, 0, 4, 0);
            device.cmd_fill_buffer(cmd, self.oriented_buffer.buffer, 0, 4, 0);

            // Extraction over every octave
            let candidate_barrier = [self.candidate_buffer.barrier_and_update(
                vk::PipelineStageFlags2::COMPUTE_SHADER,
                vk::AccessFlags2::SHADER_STORAGE_READ | vk::AccessFlags2::SHADER_STORAGE_WRITE,
            )];
            pipeline_barrier(device, cmd, &candidate_barrier, &[]);

            let nb_octaves = scale_space.octave_count();
            for octave in 0..nb_octaves {
                let (width, height) = scale_space.octave_dimensions(octave).unwrap();
                let dog_barrier = [scale_space.octaves()[octave as usize]
                    .dog
                    .barrier_and_update(
                        vk::PipelineStageFlags2::COMPUTE_SHADER,
                        vk::AccessFlags2::SHADER_SAMPLED_READ,
                        vk::ImageLayout::GENERAL,
                    )];
                pipeline_barrier(device, cmd, &[], &dog_barrier);

                self.extract_pipeline
                    .bind(device, cmd, self.extract_sets[octave as usize]);
                self.extract_pipeline.push_constants(
                    device,
                    cmd,
                    &ExtractPush {
                        octave,
                        nb_scales,
                        max_candidates: capacity,
                        max_refine_steps: self.config.max_nb_refinement_steps,
                        intensity_threshold: self.config.intensity_threshold,
                        edge_threshold: self.config.edge_threshold,
                        seed_sigma: self.config.seed_scale_sigma,
                        octave_input_scale: 2f32.powi(octave as i32) * upsample_factor,
                    },
                );
                device.cmd_dispatch(
                    cmd,
                    width.div_ceil(8),
                    height.div_ceil(8),
                    nb_scales,
                );
            }

            // Clamp the candidate count and size the orientation dispatch
            let barriers = [
                self.candidate_buffer.barrier_and_update(
                    vk::PipelineStageFlags2::COMPUTE_SHADER,
                    vk::AccessFlags2::SHADER_STORAGE_READ
                        | vk::AccessFlags2::SHADER_STORAGE_WRITE,
                ),
                self.indirect_buffer.barrier_and_update(
                    vk::PipelineStageFlags2::COMPUTE_SHADER,
                    vk::AccessFlags2::SHADER_STORAGE_WRITE,
                ),
            ];
            pipeline_barrier(device, cmd, &barriers, &[]);

            self.prepare_pipeline
                .bind(device, cmd, self.prepare_candidates_set);
            self.prepare_pipeline.push_constants(
                device,
                cmd,
                &PreparePush {
                    capacity,
                    slot: INDIRECT_SLOT_ORIENTATION,
                    group_size: 1,
                },
            );
            device.cmd_dispatch(cmd, 1, 1, 1);

            // Orientation assignment
            let barriers = [
                self.indirect_buffer.barrier_and_update(
                    vk::PipelineStageFlags2::DRAW_INDIRECT,
                    vk::AccessFlags2::INDIRECT_COMMAND_READ,
                ),
                self.candidate_buffer.barrier_and_update(
                    vk::PipelineStageFlags2::COMPUTE_SHADER,
                    vk::AccessFlags2::SHADER_STORAGE_READ,
                ),
                self.oriented_buffer.barrier_and_update(
                    vk::PipelineStageFlags2::COMPUTE_SHADER,
                    vk::AccessFlags2::SHADER_STORAGE_READ
                        | vk::AccessFlags2::SHADER_STORAGE_WRITE,
                ),
            ];
            pipeline_barrier(device, cmd, &barriers, &[]);

            self.orientation_pipeline
                .bind(device, cmd, self.orientation_set);
            self.orientation_pipeline.push_constants(
                device,
                cmd,
                &OrientationPush {
                    max_keypoints: capacity,
                },
            );
            device.cmd_dispatch_indirect(cmd, self.indirect_buffer.buffer, 0);

            // Clamp the keypoint count into the slot header and size the
            // descriptor dispatch
            let barriers = [
                self.oriented_buffer.barrier_and_update(
                    vk::PipelineStageFlags2::COMPUTE_SHADER,
                    vk::AccessFlags2::SHADER_STORAGE_READ
                        | vk::AccessFlags2::SHADER_STORAGE_WRITE,
                ),
                self.indirect_buffer.barrier_and_update(
                    vk::PipelineStageFlags2::COMPUTE_SHADER,
                    vk::AccessFlags2::SHADER_STORAGE_WRITE,
                ),
                slot_buffer.barrier_and_update(
                    vk::PipelineStageFlags2::COMPUTE_SHADER,
                    vk::AccessFlags2::SHADER_STORAGE_WRITE,
                ),
            ];
            pipeline_barrier(device, cmd, &barriers, &[]);

            self.prepare_pipeline
                .bind(device, cmd, self.prepare_features_sets[slot]);
            self.prepare_pipeline.push_constants(
                device,
                cmd,
                &PreparePush {
                    capacity,
                    slot: INDIRECT_SLOT_DESCRIPTOR,
                    group_size: 1,
                },
            );
            device.cmd_dispatch(cmd, 1, 1, 1);

            // Descriptor computation into the slot buffer
            let barriers = [
                self.indirect_buffer.barrier_and_update(
                    vk::PipelineStageFlags2::DRAW_INDIRECT,
                    vk::AccessFlags2::INDIRECT_COMMAND_READ,
                ),
                self.oriented_buffer.barrier_and_update(
                    vk::PipelineStageFlags2::COMPUTE_SHADER,
                    vk::AccessFlags2::SHADER_STORAGE_READ,
                ),
                slot_buffer.barrier_and_update(
                    vk::PipelineStageFlags2::COMPUTE_SHADER,
                    vk::AccessFlags2::SHADER_STORAGE_WRITE,
                ),
            ];
            pipeline_barrier(device, cmd, &barriers, &[]);

            self.descriptor_pipeline
                .bind(device, cmd, self.descriptor_sets[slot]);
            self.descriptor_pipeline
                .push_constants(device, cmd, &DescriptorPush { upsample_factor });
            device.cmd_dispatch_indirect(cmd, self.indirect_buffer.buffer, 16);
        }

        Ok(())
    }

    /// Destroy all GPU resources.
    ///
    /// # Safety
    /// The device must be valid and no recorded work may reference the
    /// detector's resources.
    pub unsafe fn destroy(
        &mut self,
        device: &ash::Device,
        allocator: &mut GpuAllocator,
    ) -> Result<()> {
        allocator.free_buffer(&mut self.candidate_buffer)?;
        allocator.free_buffer(&mut self.oriented_buffer)?;
        allocator.free_buffer(&mut self.indirect_buffer)?;
        unsafe {
            self.extract_pipeline.destroy(device);
            self.orientation_pipeline.destroy(device);
            self.descriptor_pipeline.destroy(device);
            self.prepare_pipeline.destroy(device);
            self.pool.destroy(device);
            device.destroy_descriptor_set_layout(self.extract_layout, None);
            device.destroy_descriptor_set_layout(self.keypoint_layout, None);
            device.destroy_descriptor_set_layout(self.prepare_layout, None);
        }
        Ok(())
    }
}

pub(crate) fn push_range<T>() -> vk::PushConstantRange {
    vk::PushConstantRange::default()
        .stage_flags(vk::ShaderStageFlags::COMPUTE)
        .size(std::mem::size_of::<T>() as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intermediate_record_strides_match_std430() {
        // Candidate: 9 scalars, OrientedKeypoint: 10 scalars
        assert_eq!(CANDIDATE_STRIDE, 9 * 4);
        assert_eq!(ORIENTED_STRIDE, 10 * 4);
        // Three uvec4 indirect slots
        assert_eq!(INDIRECT_BUFFER_SIZE, 3 * 16);
    }

    #[test]
    fn push_constants_fit_the_guaranteed_budget() {
        assert!(std::mem::size_of::<ExtractPush>() <= 128);
        assert_eq!(std::mem::size_of::<PreparePush>(), 12);
        assert_eq!(std::mem::size_of::<OrientationPush>(), 4);
        assert_eq!(std::mem::size_of::<DescriptorPush>(), 4);
    }
}

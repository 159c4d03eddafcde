//! Gaussian / DoG scale-space construction.
//!
//! One layered image per octave holds the Gaussian stack (`S+3` layers) and
//! another the DoG stack (`S+2` layers); a single-layer scratch image per
//! octave carries the intermediate of the separable blur. Octave images are
//! rebuilt whenever the input resolution changes.

use ash::vk;
use bytemuck::{Pod, Zeroable};
use vulkansift_core::constants::MAX_GAUSSIAN_KERNEL_SIZE;
use vulkansift_core::{PyramidPrecision, SiftConfig};
use vulkansift_gpu::command::pipeline_barrier;
use vulkansift_gpu::descriptors::{DescriptorPool, DescriptorSetLayoutBuilder};
use vulkansift_gpu::error::Result;
use vulkansift_gpu::memory::{GpuAllocator, GpuBuffer, GpuImage};
use vulkansift_gpu::pipeline::ComputePipeline;
use vulkansift_shaders::PyramidFormat;

/// Largest paired-tap count of the hardware-interpolated blur.
const MAX_PAIRED_TAPS: usize = MAX_GAUSSIAN_KERNEL_SIZE / 2;

/// A normalized, truncated 1-D Gaussian kernel.
///
/// `weights[0]` is the center tap; the kernel is symmetric so only one side
/// is stored. Weights satisfy `w[0] + 2 * sum(w[1..]) == 1`.
#[derive(Debug, Clone)]
pub struct GaussianKernel {
    pub sigma: f32,
    pub weights: Vec<f32>,
}

impl GaussianKernel {
    /// Build the kernel truncated at `ceil(3*sigma)` taps, capped by the
    /// push-constant budget.
    pub fn new(sigma: f32) -> Self {
        let radius = (3.0 * sigma).ceil() as usize;
        let radius = radius.clamp(1, MAX_GAUSSIAN_KERNEL_SIZE - 1);

        let inv_denom = 1.0 / (2.0 * f64::from(sigma) * f64::from(sigma));
        let mut weights: Vec<f64> = (0..=radius)
            .map(|i| (-((i * i) as f64) * inv_denom).exp())
            .collect();

        let sum: f64 = weights[0] + 2.0 * weights[1..].iter().sum::<f64>();
        for w in &mut weights {
            *w /= sum;
        }

        Self {
            sigma,
            weights: weights.into_iter().map(|w| w as f32).collect(),
        }
    }

    /// Pair adjacent taps into bilinear samples for the
    /// hardware-interpolated blur. Returns `(offsets, weights)` with the
    /// unpaired center at index 0.
    pub fn paired_taps(&self) -> (Vec<f32>, Vec<f32>) {
        // The paired push-constant arrays hold one slot fewer pairs than
        // the discrete kernel holds taps; drop the outermost (negligible)
        // taps when the radius exceeds what pairing can carry.
        let max_radius = (MAX_PAIRED_TAPS - 1) * 2;
        let side = &self.weights[1..self.weights.len().min(max_radius + 1)];

        let mut offsets = vec![0.0f32];
        let mut weights = vec![self.weights[0]];

        let mut i = 0;
        while i < side.len() {
            if i + 1 < side.len() {
                let (w_near, w_far) = (side[i], side[i + 1]);
                let (o_near, o_far) = ((i + 1) as f32, (i + 2) as f32);
                let w = w_near + w_far;
                offsets.push((o_near * w_near + o_far * w_far) / w);
                weights.push(w);
                i += 2;
            } else {
                offsets.push((i + 1) as f32);
                weights.push(side[i]);
                i += 1;
            }
        }

        (offsets, weights)
    }
}

/// Incremental blur sigmas for scales `0..=S+2`.
///
/// Entry 0 raises the (possibly upsampled) input blur to the seed sigma;
/// entry `s` raises the cumulative blur from `sigma0 * k^(s-1)` to
/// `sigma0 * k^s` with `k = 2^(1/S)`.
pub fn blur_increments(config: &SiftConfig) -> Vec<f32> {
    let nb_scales = config.nb_scales_per_octave;
    let sigma0 = f64::from(config.seed_scale_sigma);
    let k = 2f64.powf(1.0 / f64::from(nb_scales));

    // Upsampling doubles the blur already present in the input
    let input_blur = f64::from(config.input_blur_level)
        * if config.use_upsampling { 2.0 } else { 1.0 };

    let mut increments = Vec::with_capacity(nb_scales as usize + 3);
    increments.push((sigma0 * sigma0 - input_blur * input_blur).max(0.01).sqrt() as f32);
    for s in 1..=nb_scales + 2 {
        let total_prev = sigma0 * k.powi(s as i32 - 1);
        let total = sigma0 * k.powi(s as i32);
        increments.push((total * total - total_prev * total_prev).sqrt() as f32);
    }
    increments
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct BlurPush {
    src_layer: u32,
    dst_layer: u32,
    is_vertical: u32,
    kernel_size: u32,
    weights: [f32; MAX_GAUSSIAN_KERNEL_SIZE],
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct BlurInterpPush {
    src_layer: u32,
    dst_layer: u32,
    is_vertical: u32,
    tap_count: u32,
    offsets: [f32; MAX_PAIRED_TAPS],
    weights: [f32; MAX_PAIRED_TAPS],
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct DownsamplePush {
    src_layer: u32,
}

/// GPU images of one octave.
pub struct OctaveImages {
    pub gauss: GpuImage,
    pub dog: GpuImage,
    scratch: GpuImage,
    pub width: u32,
    pub height: u32,
}

/// The scale-space engine: pyramid images, blur kernels and build passes.
pub struct ScaleSpace {
    config: SiftConfig,
    pyramid_format: vk::Format,
    kernels: Vec<GaussianKernel>,

    input_image: Option<GpuImage>,
    octaves: Vec<OctaveImages>,
    input_width: u32,
    input_height: u32,

    sampler: vk::Sampler,
    io_layout: vk::DescriptorSetLayout,
    pool: DescriptorPool,

    convert_pipeline: ComputePipeline,
    blur_pipeline: ComputePipeline,
    downsample_pipeline: ComputePipeline,
    dog_pipeline: ComputePipeline,

    convert_set: vk::DescriptorSet,
    blur_h_sets: Vec<vk::DescriptorSet>,
    blur_v_sets: Vec<vk::DescriptorSet>,
    downsample_sets: Vec<vk::DescriptorSet>,
    dog_sets: Vec<vk::DescriptorSet>,
}

fn group_count(extent: u32) -> u32 {
    extent.div_ceil(8)
}

impl ScaleSpace {
    /// Create the engine and allocate the pyramid for the configured
    /// maximum input size.
    pub fn new(
        device: &ash::Device,
        allocator: &mut GpuAllocator,
        config: &SiftConfig,
    ) -> Result<Self> {
        let pyramid_format = match config.pyramid_precision_mode {
            PyramidPrecision::Float16 => vk::Format::R16_SFLOAT,
            PyramidPrecision::Float32 => vk::Format::R32_SFLOAT,
        };
        let shader_format = match config.pyramid_precision_mode {
            PyramidPrecision::Float16 => PyramidFormat::F16,
            PyramidPrecision::Float32 => PyramidFormat::F32,
        };

        let sampler_info = vk::SamplerCreateInfo::default()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .mipmap_mode(vk::SamplerMipmapMode::NEAREST)
            .address_mode_u(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_v(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_w(vk::SamplerAddressMode::CLAMP_TO_EDGE);
        let sampler = unsafe { device.create_sampler(&sampler_info, None) }?;

        // All pyramid passes share one (sampled input, storage output) layout
        let io_layout = unsafe {
            DescriptorSetLayoutBuilder::new()
                .sampled_image(0, vk::ShaderStageFlags::COMPUTE)
                .storage_image(1, vk::ShaderStageFlags::COMPUTE)
                .build(device)?
        };

        let max_octaves = vulkansift_core::constants::MAX_OCTAVES;
        let max_sets = 4 * max_octaves + 1;
        let pool_sizes = [
            vk::DescriptorPoolSize::default()
                .ty(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                .descriptor_count(max_sets),
            vk::DescriptorPoolSize::default()
                .ty(vk::DescriptorType::STORAGE_IMAGE)
                .descriptor_count(max_sets),
        ];
        let pool = unsafe { DescriptorPool::new(device, max_sets, &pool_sizes)? };

        let blur_range = vk::PushConstantRange::default()
            .stage_flags(vk::ShaderStageFlags::COMPUTE)
            .size(std::mem::size_of::<BlurPush>() as u32);
        let downsample_range = vk::PushConstantRange::default()
            .stage_flags(vk::ShaderStageFlags::COMPUTE)
            .size(std::mem::size_of::<DownsamplePush>() as u32);

        let blur_code = if config.use_hardware_interpolated_blur {
            vulkansift_shaders::gaussian_blur_interpolated(shader_format)
        } else {
            vulkansift_shaders::gaussian_blur(shader_format)
        };

        let layouts = [io_layout];
        let convert_pipeline = unsafe {
            ComputePipeline::new(
                device,
                vulkansift_shaders::convert_input(shader_format),
                &layouts,
                &[],
            )?
        };
        let blur_pipeline =
            unsafe { ComputePipeline::new(device, blur_code, &layouts, &[blur_range])? };
        let downsample_pipeline = unsafe {
            ComputePipeline::new(
                device,
                vulkansift_shaders::downsample(shader_format),
                &layouts,
                &[downsample_range],
            )?
        };
        let dog_pipeline = unsafe {
            ComputePipeline::new(
                device,
                vulkansift_shaders::difference_of_gaussian(shader_format),
                &layouts,
                &[],
            )?
        };

        let mut scale_space = Self {
            config: config.clone(),
            pyramid_format,
            kernels: blur_increments(config)
                .into_iter()
                .map(GaussianKernel::new)
                .collect(),
            input_image: None,
            octaves: Vec::new(),
            input_width: 0,
            input_height: 0,
            sampler,
            io_layout,
            pool,
            convert_pipeline,
            blur_pipeline,
            downsample_pipeline,
            dog_pipeline,
            convert_set: vk::DescriptorSet::null(),
            blur_h_sets: Vec::new(),
            blur_v_sets: Vec::new(),
            downsample_sets: Vec::new(),
            dog_sets: Vec::new(),
        };

        // Allocate for the largest accepted input so creation fails early
        // when the device cannot hold the pyramid
        scale_space.ensure_resolution(
            device,
            allocator,
            config.input_image_max_size.width,
            config.input_image_max_size.height,
        )?;

        Ok(scale_space)
    }

    pub fn octave_count(&self) -> u32 {
        self.octaves.len() as u32
    }

    pub fn octaves(&mut self) -> &mut [OctaveImages] {
        &mut self.octaves
    }

    pub fn octave_dimensions(&self, octave: u32) -> Option<(u32, u32)> {
        self.octaves
            .get(octave as usize)
            .map(|o| (o.width, o.height))
    }

    pub fn input_dimensions(&self) -> (u32, u32) {
        (self.input_width, self.input_height)
    }

    pub fn sampler(&self) -> vk::Sampler {
        self.sampler
    }

    pub fn nb_gauss_layers(&self) -> u32 {
        self.config.nb_scales_per_octave + 3
    }

    pub fn nb_dog_layers(&self) -> u32 {
        self.config.nb_scales_per_octave + 2
    }

    /// Rebuild the pyramid images and descriptor sets for a new input
    /// resolution. Returns true when images were recreated; the caller must
    /// then refresh any descriptor set referencing pyramid views.
    pub fn ensure_resolution(
        &mut self,
        device: &ash::Device,
        allocator: &mut GpuAllocator,
        width: u32,
        height: u32,
    ) -> Result<bool> {
        if width == self.input_width && height == self.input_height {
            return Ok(false);
        }

        self.release_octaves(device, allocator)?;
        self.input_width = 0;
        self.input_height = 0;

        // Layer count 0 selects a plain 2-D image; the pyramid images below
        // are arrayed, including the single-layer blur scratch
        let input_image = allocator.create_image(
            width,
            height,
            vk::Format::R8_UNORM,
            0,
            vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
            "sift_input",
        )?;

        let nb_octaves = self.config.octave_count(width, height);
        let gauss_layers = self.nb_gauss_layers();
        let dog_layers = self.nb_dog_layers();

        let pyramid_usage = vk::ImageUsageFlags::STORAGE
            | vk::ImageUsageFlags::SAMPLED
            | vk::ImageUsageFlags::TRANSFER_SRC;

        let mut octaves = Vec::with_capacity(nb_octaves as usize);
        for octave in 0..nb_octaves {
            let (octave_w, octave_h) = self.config.octave_resolution(width, height, octave);
            let gauss = allocator.create_image(
                octave_w,
                octave_h,
                self.pyramid_format,
                gauss_layers,
                pyramid_usage,
                &format!("sift_gauss_o{octave}"),
            )?;
            let dog = allocator.create_image(
                octave_w,
                octave_h,
                self.pyramid_format,
                dog_layers,
                pyramid_usage,
                &format!("sift_dog_o{octave}"),
            )?;
            let scratch = allocator.create_image(
                octave_w,
                octave_h,
                self.pyramid_format,
                1,
                vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::SAMPLED,
                &format!("sift_scratch_o{octave}"),
            )?;
            octaves.push(OctaveImages {
                gauss,
                dog,
                scratch,
                width: octave_w,
                height: octave_h,
            });
        }

        self.input_image = Some(input_image);
        self.octaves = octaves;
        self.input_width = width;
        self.input_height = height;

        self.allocate_sets(device)?;
        Ok(true)
    }

    fn release_octaves(&mut self, device: &ash::Device, allocator: &mut GpuAllocator) -> Result<()> {
        let mut old_sets: Vec<vk::DescriptorSet> = Vec::new();
        if self.convert_set != vk::DescriptorSet::null() {
            old_sets.push(self.convert_set);
            self.convert_set = vk::DescriptorSet::null();
        }
        old_sets.append(&mut self.blur_h_sets);
        old_sets.append(&mut self.blur_v_sets);
        old_sets.append(&mut self.downsample_sets);
        old_sets.append(&mut self.dog_sets);
        if !old_sets.is_empty() {
            unsafe { self.pool.free(device, &old_sets)? };
        }

        if let Some(mut input_image) = self.input_image.take() {
            allocator.free_image(&mut input_image)?;
        }
        for octave in &mut self.octaves {
            allocator.free_image(&mut octave.gauss)?;
            allocator.free_image(&mut octave.dog)?;
            allocator.free_image(&mut octave.scratch)?;
        }
        self.octaves.clear();
        Ok(())
    }

    fn allocate_sets(&mut self, device: &ash::Device) -> Result<()> {
        let nb_octaves = self.octaves.len();

        let layouts = vec![self.io_layout; 1 + 3 * nb_octaves + nb_octaves.saturating_sub(1)];
        let mut sets = unsafe { self.pool.allocate(device, &layouts)? };

        self.convert_set = sets.remove(0);
        self.blur_h_sets = sets.drain(..nb_octaves).collect();
        self.blur_v_sets = sets.drain(..nb_octaves).collect();
        self.dog_sets = sets.drain(..nb_octaves).collect();
        self.downsample_sets = sets;

        let input_view = self.input_image.as_ref().unwrap().view;
        write_io_set(
            device,
            self.convert_set,
            self.sampler,
            input_view,
            self.octaves[0].gauss.view,
        );
        for (octave_idx, octave) in self.octaves.iter().enumerate() {
            write_io_set(
                device,
                self.blur_h_sets[octave_idx],
                self.sampler,
                octave.gauss.view,
                octave.scratch.view,
            );
            write_io_set(
                device,
                self.blur_v_sets[octave_idx],
                self.sampler,
                octave.scratch.view,
                octave.gauss.view,
            );
            write_io_set(
                device,
                self.dog_sets[octave_idx],
                self.sampler,
                octave.gauss.view,
                octave.dog.view,
            );
        }
        // Downsample reads the previous octave's Gaussian stack and seeds
        // the next one
        for octave_idx in 1..nb_octaves {
            write_io_set(
                device,
                self.downsample_sets[octave_idx - 1],
                self.sampler,
                self.octaves[octave_idx - 1].gauss.view,
                self.octaves[octave_idx].gauss.view,
            );
        }

        Ok(())
    }

    /// Record the full pyramid build: staged upload, seed conversion,
    /// per-octave blurs and DoG computation.
    ///
    /// # Safety
    /// The command buffer must be in recording state and the staging buffer
    /// must hold `width * height` grayscale bytes.
    pub unsafe fn record_build(
        &mut self,
        device: &ash::Device,
        cmd: vk::CommandBuffer,
        input_staging: &mut GpuBuffer,
    ) -> Result<()> {
        let nb_scales = self.config.nb_scales_per_octave;

        // Upload the input image through the staging buffer
        let input_image = self.input_image.as_mut().unwrap();
        unsafe {
            let barriers = [input_image.barrier_and_update(
                vk::PipelineStageFlags2::TRANSFER,
                vk::AccessFlags2::TRANSFER_WRITE,
                vk::ImageLayout::GENERAL,
            )];
            let staging_barrier = [input_staging.barrier_and_update(
                vk::PipelineStageFlags2::TRANSFER,
                vk::AccessFlags2::TRANSFER_READ,
            )];
            pipeline_barrier(device, cmd, &staging_barrier, &barriers);

            let region = vk::BufferImageCopy::default()
                .image_subresource(vk::ImageSubresourceLayers {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    mip_level: 0,
                    base_array_layer: 0,
                    layer_count: 1,
                })
                .image_extent(vk::Extent3D {
                    width: self.input_width,
                    height: self.input_height,
                    depth: 1,
                });
            device.cmd_copy_buffer_to_image(
                cmd,
                input_staging.buffer,
                input_image.image,
                vk::ImageLayout::GENERAL,
                &[region],
            );

            let barriers = [input_image.barrier_and_update(
                vk::PipelineStageFlags2::COMPUTE_SHADER,
                vk::AccessFlags2::SHADER_SAMPLED_READ,
                vk::ImageLayout::GENERAL,
            )];
            pipeline_barrier(device, cmd, &[], &barriers);
        }

        for octave_idx in 0..self.octaves.len() {
            // Seed scale 0: convert/upsample for octave 0, decimate the
            // previous octave's scale S otherwise
            if octave_idx == 0 {
                unsafe {
                    let octave = &mut self.octaves[0];
                    let barriers = [octave.gauss.barrier_and_update(
                        vk::PipelineStageFlags2::COMPUTE_SHADER,
                        vk::AccessFlags2::SHADER_STORAGE_WRITE,
                        vk::ImageLayout::GENERAL,
                    )];
                    pipeline_barrier(device, cmd, &[], &barriers);

                    self.convert_pipeline.bind(device, cmd, self.convert_set);
                    device.cmd_dispatch(
                        cmd,
                        group_count(octave.width),
                        group_count(octave.height),
                        1,
                    );
                }
                // Raise the seed blur to sigma0
                unsafe { self.record_blur(device, cmd, 0, 0, 0, 0)? };
            } else {
                unsafe {
                    let src_barrier = self.octaves[octave_idx - 1].gauss.barrier_and_update(
                        vk::PipelineStageFlags2::COMPUTE_SHADER,
                        vk::AccessFlags2::SHADER_SAMPLED_READ,
                        vk::ImageLayout::GENERAL,
                    );
                    let dst_barrier = self.octaves[octave_idx].gauss.barrier_and_update(
                        vk::PipelineStageFlags2::COMPUTE_SHADER,
                        vk::AccessFlags2::SHADER_STORAGE_WRITE,
                        vk::ImageLayout::GENERAL,
                    );
                    pipeline_barrier(device, cmd, &[], &[src_barrier, dst_barrier]);

                    self.downsample_pipeline.bind(
                        device,
                        cmd,
                        self.downsample_sets[octave_idx - 1],
                    );
                    self.downsample_pipeline.push_constants(
                        device,
                        cmd,
                        &DownsamplePush {
                            src_layer: nb_scales,
                        },
                    );
                    let octave = &self.octaves[octave_idx];
                    device.cmd_dispatch(
                        cmd,
                        group_count(octave.width),
                        group_count(octave.height),
                        1,
                    );
                }
            }

            // Incremental blurs through the remaining scales
            for scale in 1..=nb_scales + 2 {
                unsafe {
                    self.record_blur(
                        device,
                        cmd,
                        octave_idx,
                        scale as usize,
                        scale - 1,
                        scale,
                    )?
                };
            }

            // DoG for the whole octave in one dispatch
            unsafe {
                let octave = &mut self.octaves[octave_idx];
                let gauss_barrier = octave.gauss.barrier_and_update(
                    vk::PipelineStageFlags2::COMPUTE_SHADER,
                    vk::AccessFlags2::SHADER_SAMPLED_READ,
                    vk::ImageLayout::GENERAL,
                );
                let dog_barrier = octave.dog.barrier_and_update(
                    vk::PipelineStageFlags2::COMPUTE_SHADER,
                    vk::AccessFlags2::SHADER_STORAGE_WRITE,
                    vk::ImageLayout::GENERAL,
                );
                pipeline_barrier(device, cmd, &[], &[gauss_barrier, dog_barrier]);

                self.dog_pipeline.bind(device, cmd, self.dog_sets[octave_idx]);
                device.cmd_dispatch(
                    cmd,
                    group_count(octave.width),
                    group_count(octave.height),
                    nb_scales + 2,
                );
            }
        }

        Ok(())
    }

    /// Record one separable blur: horizontal pass into the octave scratch,
    /// vertical pass back into the Gaussian stack.
    unsafe fn record_blur(
        &mut self,
        device: &ash::Device,
        cmd: vk::CommandBuffer,
        octave_idx: usize,
        kernel_idx: usize,
        src_layer: u32,
        dst_layer: u32,
    ) -> Result<()> {
        let kernel = &self.kernels[kernel_idx];

        let (mut discrete, mut interp) = (
            BlurPush::zeroed(),
            BlurInterpPush::zeroed(),
        );
        if self.config.use_hardware_interpolated_blur {
            let (offsets, weights) = kernel.paired_taps();
            interp.is_vertical = 0;
            interp.tap_count = offsets.len() as u32;
            interp.offsets[..offsets.len()].copy_from_slice(&offsets);
            interp.weights[..weights.len()].copy_from_slice(&weights);
        } else {
            discrete.is_vertical = 0;
            discrete.kernel_size = kernel.weights.len() as u32;
            discrete.weights[..kernel.weights.len()].copy_from_slice(&kernel.weights);
        }

        let octave = &mut self.octaves[octave_idx];
        let groups_x = group_count(octave.width);
        let groups_y = group_count(octave.height);

        unsafe {
            // Horizontal: gauss[src_layer] -> scratch
            let gauss_barrier = octave.gauss.barrier_and_update(
                vk::PipelineStageFlags2::COMPUTE_SHADER,
                vk::AccessFlags2::SHADER_SAMPLED_READ,
                vk::ImageLayout::GENERAL,
            );
            let scratch_barrier = octave.scratch.barrier_and_update(
                vk::PipelineStageFlags2::COMPUTE_SHADER,
                vk::AccessFlags2::SHADER_STORAGE_WRITE,
                vk::ImageLayout::GENERAL,
            );
            pipeline_barrier(device, cmd, &[], &[gauss_barrier, scratch_barrier]);

            self.blur_pipeline
                .bind(device, cmd, self.blur_h_sets[octave_idx]);
            if self.config.use_hardware_interpolated_blur {
                interp.src_layer = src_layer;
                interp.dst_layer = 0;
                self.blur_pipeline.push_constants(device, cmd, &interp);
            } else {
                discrete.src_layer = src_layer;
                discrete.dst_layer = 0;
                self.blur_pipeline.push_constants(device, cmd, &discrete);
            }
            device.cmd_dispatch(cmd, groups_x, groups_y, 1);

            // Vertical: scratch -> gauss[dst_layer]
            let scratch_barrier = octave.scratch.barrier_and_update(
                vk::PipelineStageFlags2::COMPUTE_SHADER,
                vk::AccessFlags2::SHADER_SAMPLED_READ,
                vk::ImageLayout::GENERAL,
            );
            let gauss_barrier = octave.gauss.barrier_and_update(
                vk::PipelineStageFlags2::COMPUTE_SHADER,
                vk::AccessFlags2::SHADER_STORAGE_WRITE,
                vk::ImageLayout::GENERAL,
            );
            pipeline_barrier(device, cmd, &[], &[scratch_barrier, gauss_barrier]);

            self.blur_pipeline
                .bind(device, cmd, self.blur_v_sets[octave_idx]);
            if self.config.use_hardware_interpolated_blur {
                interp.src_layer = 0;
                interp.dst_layer = dst_layer;
                interp.is_vertical = 1;
                self.blur_pipeline.push_constants(device, cmd, &interp);
            } else {
                discrete.src_layer = 0;
                discrete.dst_layer = dst_layer;
                discrete.is_vertical = 1;
                self.blur_pipeline.push_constants(device, cmd, &discrete);
            }
            device.cmd_dispatch(cmd, groups_x, groups_y, 1);
        }

        Ok(())
    }

    /// Record a copy of one pyramid plane into a staging buffer.
    ///
    /// # Safety
    /// The command buffer must be in recording state.
    pub unsafe fn record_plane_download(
        &mut self,
        device: &ash::Device,
        cmd: vk::CommandBuffer,
        octave: u32,
        layer: u32,
        from_dog: bool,
        staging: &mut GpuBuffer,
    ) {
        let octave_images = &mut self.octaves[octave as usize];
        let (width, height) = (octave_images.width, octave_images.height);
        let image = if from_dog {
            &mut octave_images.dog
        } else {
            &mut octave_images.gauss
        };

        unsafe {
            let image_barrier = [image.barrier_and_update(
                vk::PipelineStageFlags2::TRANSFER,
                vk::AccessFlags2::TRANSFER_READ,
                vk::ImageLayout::GENERAL,
            )];
            let staging_barrier = [staging.barrier_and_update(
                vk::PipelineStageFlags2::TRANSFER,
                vk::AccessFlags2::TRANSFER_WRITE,
            )];
            pipeline_barrier(device, cmd, &staging_barrier, &image_barrier);

            let region = vk::BufferImageCopy::default()
                .image_subresource(vk::ImageSubresourceLayers {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    mip_level: 0,
                    base_array_layer: layer,
                    layer_count: 1,
                })
                .image_extent(vk::Extent3D {
                    width,
                    height,
                    depth: 1,
                });
            device.cmd_copy_image_to_buffer(
                cmd,
                image.image,
                vk::ImageLayout::GENERAL,
                staging.buffer,
                &[region],
            );
        }
    }

    /// Destroy all GPU resources.
    ///
    /// # Safety
    /// The device must be valid and no recorded work may reference the
    /// pyramid.
    pub unsafe fn destroy(
        &mut self,
        device: &ash::Device,
        allocator: &mut GpuAllocator,
    ) -> Result<()> {
        self.release_octaves(device, allocator)?;
        unsafe {
            self.convert_pipeline.destroy(device);
            self.blur_pipeline.destroy(device);
            self.downsample_pipeline.destroy(device);
            self.dog_pipeline.destroy(device);
            self.pool.destroy(device);
            device.destroy_descriptor_set_layout(self.io_layout, None);
            device.destroy_sampler(self.sampler, None);
        }
        Ok(())
    }
}

fn write_io_set(
    device: &ash::Device,
    set: vk::DescriptorSet,
    sampler: vk::Sampler,
    src_view: vk::ImageView,
    dst_view: vk::ImageView,
) {
    unsafe {
        vulkansift_gpu::descriptors::write_combined_image_sampler(
            device,
            set,
            0,
            src_view,
            vk::ImageLayout::GENERAL,
            sampler,
        );
        vulkansift_gpu::descriptors::write_storage_image(
            device,
            set,
            1,
            dst_view,
            vk::ImageLayout::GENERAL,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn kernel_weights_are_normalized() {
        for sigma in [0.5f32, 1.0, 1.6, 2.5, 4.0] {
            let kernel = GaussianKernel::new(sigma);
            let total: f32 =
                kernel.weights[0] + 2.0 * kernel.weights[1..].iter().sum::<f32>();
            assert_relative_eq!(total, 1.0, epsilon = 1e-5);
        }
    }

    #[test]
    fn kernel_truncates_at_three_sigma() {
        let kernel = GaussianKernel::new(2.0);
        assert_eq!(kernel.weights.len(), 7); // center + ceil(3*2) taps

        // Large sigmas stay within the push-constant budget
        let kernel = GaussianKernel::new(10.0);
        assert_eq!(kernel.weights.len(), MAX_GAUSSIAN_KERNEL_SIZE);
    }

    #[test]
    fn kernel_weights_decrease_monotonically() {
        let kernel = GaussianKernel::new(1.6);
        for pair in kernel.weights.windows(2) {
            assert!(pair[0] > pair[1]);
        }
    }

    #[test]
    fn paired_taps_preserve_weight_mass() {
        let kernel = GaussianKernel::new(2.2);
        let (offsets, weights) = kernel.paired_taps();
        assert_eq!(offsets.len(), weights.len());
        assert!(offsets.len() <= MAX_PAIRED_TAPS);

        let discrete_total: f32 =
            kernel.weights[0] + 2.0 * kernel.weights[1..].iter().sum::<f32>();
        let paired_total: f32 = weights[0] + 2.0 * weights[1..].iter().sum::<f32>();
        assert_relative_eq!(discrete_total, paired_total, epsilon = 1e-5);

        // Paired offsets sit between their source taps
        for (i, &offset) in offsets.iter().enumerate().skip(1) {
            let near = (2 * i - 1) as f32;
            assert!(offset >= near && offset <= near + 1.0);
        }
    }

    #[test]
    fn paired_taps_reproduce_discrete_first_moment() {
        // Each bilinear sample at fractional offset o with weight w reads
        // (1-frac)*near + frac*far, reproducing the two discrete taps
        let kernel = GaussianKernel::new(1.6);
        let (offsets, weights) = kernel.paired_taps();
        for (i, (&offset, &weight)) in offsets.iter().zip(&weights).enumerate().skip(1) {
            let near_idx = 2 * i - 1;
            let w_near = kernel.weights[near_idx];
            let w_far = kernel.weights.get(near_idx + 1).copied().unwrap_or(0.0);
            assert_relative_eq!(weight, w_near + w_far, epsilon = 1e-6);
            let expected =
                (near_idx as f32 * w_near + (near_idx + 1) as f32 * w_far) / (w_near + w_far);
            assert_relative_eq!(offset, expected, epsilon = 1e-5);
        }
    }

    #[test]
    fn blur_increments_follow_the_sigma_schedule() {
        let config = SiftConfig {
            use_upsampling: false,
            ..SiftConfig::default()
        };
        let increments = blur_increments(&config);
        assert_eq!(increments.len(), 6); // S + 3 with S = 3

        // First step raises input blur to sigma0
        let sigma0 = config.seed_scale_sigma;
        let input_blur = config.input_blur_level;
        assert_relative_eq!(
            increments[0],
            (sigma0 * sigma0 - input_blur * input_blur).sqrt(),
            epsilon = 1e-5
        );

        // Cumulative blur at scale s equals sigma0 * k^s
        let k = 2f32.powf(1.0 / config.nb_scales_per_octave as f32);
        let mut total_sq = sigma0 * sigma0;
        for (s, &increment) in increments.iter().enumerate().skip(1) {
            total_sq += increment * increment;
            let expected = sigma0 * k.powi(s as i32);
            assert_relative_eq!(total_sq.sqrt(), expected, epsilon = 1e-4);
        }
    }

    #[test]
    fn upsampling_doubles_the_assumed_input_blur() {
        let base = SiftConfig {
            use_upsampling: false,
            ..SiftConfig::default()
        };
        let upsampled = SiftConfig::default();
        // A larger assumed blur leaves less to add in the seed step
        assert!(blur_increments(&upsampled)[0] < blur_increments(&base)[0]);
    }
}

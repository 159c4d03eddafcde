//! The SIFT instance: GPU resources, slot state machine and the public
//! operation set.
//!
//! Detection and matching are non-blocking: they record a command buffer,
//! submit it with a fence and return. Every transfer operation first waits
//! on the fences guarding the touched slots, then performs a synchronous
//! staging copy. A Vulkan-level failure poisons the instance; only
//! destruction remains valid afterwards.

use ash::vk;
use gpu_allocator::MemoryLocation;
use vulkansift_core::constants::FEATURE_BUFFER_HEADER_SIZE;
use vulkansift_core::{
    DescriptorFormat, Feature, Match2NN, PyramidPrecision, RawFeatureF32, RawFeatureU8,
    SiftConfig, SiftError, SiftResult,
};
use vulkansift_gpu::command::{
    begin_command_buffer, end_command_buffer, execute_single_time_commands, pipeline_barrier,
    submit_command_buffers, CommandPool,
};
use vulkansift_gpu::error::GpuError;
use vulkansift_gpu::memory::GpuBuffer;
use vulkansift_gpu::sync::{create_fence, fence_status, reset_fence, wait_for_fence};
use vulkansift_gpu::{GpuContext, GpuContextBuilder};

use crate::debug_window::{DebugWindow, ExternalWindowInfo};
use crate::detector::Detector;
use crate::matcher::Matcher;
use crate::scale_space::ScaleSpace;
use crate::staging;

/// Per-slot scheduling state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Idle,
    RunningDetect,
    RunningMatchA,
    RunningMatchB,
    Transfer,
}

struct FeatureSlot {
    buffer: GpuBuffer,
    fence: vk::Fence,
    state: SlotState,
}

/// A per-device SIFT context: detection and matching pipelines plus a
/// fixed array of feature slots.
pub struct SiftInstance {
    config: SiftConfig,

    slots: Vec<FeatureSlot>,
    scale_space: ScaleSpace,
    detector: Detector,
    matcher: Matcher,

    input_staging: GpuBuffer,
    upload_staging: GpuBuffer,
    download_staging: GpuBuffer,

    command_pool: CommandPool,
    detect_cmd: vk::CommandBuffer,
    match_cmd: vk::CommandBuffer,
    match_fence: vk::Fence,
    match_pair: Option<(usize, usize)>,
    transfer_queue: vk::Queue,

    poisoned: bool,
    debug_window: Option<DebugWindow>,

    // Dropped last: owns the device every resource above lives on
    context: GpuContext,
}

fn map_gpu_error(error: &GpuError) -> SiftError {
    if error.is_out_of_memory() {
        SiftError::OutOfMemory
    } else {
        SiftError::Vulkan
    }
}

impl SiftInstance {
    /// Create an instance without a debug window.
    pub fn new(config: &SiftConfig) -> SiftResult<Self> {
        Self::create(config, None)
    }

    /// Create an instance presenting debug frames to a caller-owned window.
    pub fn with_window(config: &SiftConfig, window: &ExternalWindowInfo) -> SiftResult<Self> {
        Self::create(config, Some(window))
    }

    fn create(config: &SiftConfig, window: Option<&ExternalWindowInfo>) -> SiftResult<Self> {
        config.validate()?;

        let context = GpuContextBuilder::new()
            .app_name("vulkansift")
            .device_index(config.gpu_device_index)
            .surface_support(window.is_some())
            .build()
            .map_err(|e| {
                tracing::error!("GPU context creation failed: {e}");
                map_gpu_error(&e)
            })?;

        // On failure the context drop waits for the device and releases
        // every allocation; no partial instance survives
        Self::create_resources(config, window, context)
    }

    fn create_resources(
        config: &SiftConfig,
        window: Option<&ExternalWindowInfo>,
        context: GpuContext,
    ) -> SiftResult<Self> {
        let device = context.device();
        let record_size = config.descriptor_format.record_size();
        let capacity = u64::from(config.max_nb_sift_per_buffer);
        let slot_buffer_size = FEATURE_BUFFER_HEADER_SIZE + capacity * record_size;

        let mut allocator = context.allocator().lock();
        let gpu = |e: GpuError| {
            tracing::error!("Instance creation failed: {e}");
            map_gpu_error(&e)
        };

        let mut slots = Vec::with_capacity(config.sift_buffer_count as usize);
        for slot_idx in 0..config.sift_buffer_count {
            let buffer = allocator
                .create_buffer(
                    slot_buffer_size,
                    vk::BufferUsageFlags::STORAGE_BUFFER
                        | vk::BufferUsageFlags::TRANSFER_SRC
                        | vk::BufferUsageFlags::TRANSFER_DST,
                    MemoryLocation::GpuOnly,
                    &format!("sift_features_{slot_idx}"),
                )
                .map_err(gpu)?;
            let fence = unsafe { create_fence(device, true) }.map_err(gpu)?;
            slots.push(FeatureSlot {
                buffer,
                fence,
                state: SlotState::Idle,
            });
        }

        let mut scale_space = ScaleSpace::new(device, &mut allocator, config).map_err(gpu)?;
        let slot_buffers: Vec<vk::Buffer> = slots.iter().map(|s| s.buffer.buffer).collect();
        let mut detector =
            Detector::new(device, &mut allocator, config, &slot_buffers).map_err(gpu)?;
        let mut matcher = Matcher::new(device, &mut allocator, config, &detector).map_err(gpu)?;

        detector
            .on_resolution_change(device, &mut scale_space)
            .map_err(gpu)?;

        let max_size = config.input_image_max_size;
        let input_bytes = u64::from(max_size.width) * u64::from(max_size.height);
        let (base_w, base_h) = config.base_dimensions(max_size.width, max_size.height);
        let plane_bytes = u64::from(base_w) * u64::from(base_h) * 4;
        let match_bytes = FEATURE_BUFFER_HEADER_SIZE + capacity * 20;

        let input_staging = allocator
            .create_buffer(
                input_bytes,
                vk::BufferUsageFlags::TRANSFER_SRC,
                MemoryLocation::CpuToGpu,
                "sift_input_staging",
            )
            .map_err(gpu)?;
        let upload_staging = allocator
            .create_buffer(
                slot_buffer_size,
                vk::BufferUsageFlags::TRANSFER_SRC,
                MemoryLocation::CpuToGpu,
                "sift_upload_staging",
            )
            .map_err(gpu)?;
        let download_staging = allocator
            .create_buffer(
                slot_buffer_size.max(plane_bytes).max(match_bytes),
                vk::BufferUsageFlags::TRANSFER_DST,
                MemoryLocation::GpuToCpu,
                "sift_download_staging",
            )
            .map_err(gpu)?;
        drop(allocator);

        let command_pool = unsafe {
            CommandPool::new(
                device,
                context.compute_queue_family(),
                vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            )
        }
        .map_err(gpu)?;

        // Staging copies run on the transfer queue only when it aliases the
        // compute family; cross-family ownership transfers are not worth it
        // for a handful of synchronous copies
        let transfer_queue = if context.transfer_queue_family() == context.compute_queue_family() {
            context.transfer_queue()
        } else {
            context.compute_queue()
        };
        let detect_cmd = unsafe { command_pool.allocate_command_buffer(device) }.map_err(gpu)?;
        let match_cmd = unsafe { command_pool.allocate_command_buffer(device) }.map_err(gpu)?;
        let match_fence = unsafe { create_fence(device, false) }.map_err(gpu)?;

        // Zero every count header so transfers before the first detection
        // report empty slots
        unsafe {
            execute_single_time_commands(device, &command_pool, transfer_queue, |cmd| {
                let mut barriers = Vec::new();
                for slot in &mut slots {
                    barriers.push(slot.buffer.barrier_and_update(
                        vk::PipelineStageFlags2::TRANSFER,
                        vk::AccessFlags2::TRANSFER_WRITE,
                    ));
                }
                barriers.push(matcher.match_buffer.barrier_and_update(
                    vk::PipelineStageFlags2::TRANSFER,
                    vk::AccessFlags2::TRANSFER_WRITE,
                ));
                pipeline_barrier(device, cmd, &barriers, &[]);
                for slot in &slots {
                    device.cmd_fill_buffer(cmd, slot.buffer.buffer, 0, 4, 0);
                }
                device.cmd_fill_buffer(cmd, matcher.match_buffer.buffer, 0, 4, 0);
            })
        }
        .map_err(gpu)?;

        let debug_window = match window {
            Some(info) => Some(DebugWindow::new(&context, info).map_err(gpu)?),
            None => None,
        };

        tracing::info!(
            "SIFT instance ready: {} slots of {} features, {} octaves at {}x{}",
            config.sift_buffer_count,
            config.max_nb_sift_per_buffer,
            scale_space.octave_count(),
            max_size.width,
            max_size.height,
        );

        Ok(Self {
            config: config.clone(),
            slots,
            scale_space,
            detector,
            matcher,
            input_staging,
            upload_staging,
            download_staging,
            command_pool,
            detect_cmd,
            match_cmd,
            match_fence,
            match_pair: None,
            transfer_queue,
            poisoned: false,
            debug_window,
            context,
        })
    }

    /// The configuration the instance was created with.
    pub fn config(&self) -> &SiftConfig {
        &self.config
    }

    // ---------------------------------------------------------------
    // Non-blocking pipelines
    // ---------------------------------------------------------------

    /// Upload a grayscale image and start the detection pipeline for one
    /// slot. Returns as soon as the GPU work is submitted.
    pub fn detect_features(
        &mut self,
        image_data: &[u8],
        width: u32,
        height: u32,
        buffer_id: u32,
    ) {
        if self.reject_poisoned() {
            return;
        }
        let max = self.config.input_image_max_size;
        if buffer_id >= self.config.sift_buffer_count
            || width == 0
            || height == 0
            || width > max.width
            || height > max.height
            || image_data.len() != (width as usize) * (height as usize)
        {
            self.report(SiftError::InvalidInput);
            return;
        }
        if let Err(e) = self.try_detect(image_data, width, height, buffer_id as usize) {
            self.fail(e);
        }
    }

    /// Start 2-NN matching of slot A's descriptors against slot B's.
    /// Returns as soon as the GPU work is submitted.
    pub fn match_features(&mut self, buffer_id_a: u32, buffer_id_b: u32) {
        if self.reject_poisoned() {
            return;
        }
        if buffer_id_a == buffer_id_b
            || buffer_id_a >= self.config.sift_buffer_count
            || buffer_id_b >= self.config.sift_buffer_count
        {
            self.report(SiftError::InvalidInput);
            return;
        }
        if let Err(e) = self.try_match(buffer_id_a as usize, buffer_id_b as usize) {
            self.fail(e);
        }
    }

    // ---------------------------------------------------------------
    // Blocking transfers
    // ---------------------------------------------------------------

    /// Number of features in a slot, clamped to the slot capacity.
    pub fn get_features_number(&mut self, buffer_id: u32) -> u32 {
        if self.reject_poisoned() || self.reject_invalid_slot(buffer_id) {
            return 0;
        }
        let slot = buffer_id as usize;
        match self
            .wait_slot(slot)
            .and_then(|()| self.read_slot_count(slot))
        {
            Ok(count) => count,
            Err(e) => {
                self.fail(e);
                0
            }
        }
    }

    /// Download the features of a slot.
    pub fn download_features(&mut self, buffer_id: u32) -> Vec<Feature> {
        if self.reject_poisoned() || self.reject_invalid_slot(buffer_id) {
            return Vec::new();
        }
        let slot = buffer_id as usize;
        match self
            .wait_slot(slot)
            .and_then(|()| self.try_download_features(slot))
        {
            Ok(features) => features,
            Err(e) => {
                self.fail(e);
                Vec::new()
            }
        }
    }

    /// Upload features into a slot, replacing its contents. Descriptors
    /// must carry the instance's configured format.
    pub fn upload_features(&mut self, features: &[Feature], buffer_id: u32) {
        if self.reject_poisoned() || self.reject_invalid_slot(buffer_id) {
            return;
        }
        if features.len() > self.config.max_nb_sift_per_buffer as usize
            || features
                .iter()
                .any(|f| f.descriptor.format() != self.config.descriptor_format)
        {
            self.report(SiftError::InvalidInput);
            return;
        }
        let slot = buffer_id as usize;
        if let Err(e) = self
            .wait_slot(slot)
            .and_then(|()| self.try_upload_features(features, slot))
        {
            self.fail(e);
        }
    }

    /// Number of matches produced by the last `match_features` call.
    pub fn get_matches_number(&mut self) -> u32 {
        if self.reject_poisoned() {
            return 0;
        }
        match self.wait_match().and_then(|()| self.read_match_count()) {
            Ok(count) => count,
            Err(e) => {
                self.fail(e);
                0
            }
        }
    }

    /// Download the match records of the last `match_features` call.
    pub fn download_matches(&mut self) -> Vec<Match2NN> {
        if self.reject_poisoned() {
            return Vec::new();
        }
        match self.wait_match().and_then(|()| self.try_download_matches()) {
            Ok(matches) => matches,
            Err(e) => {
                self.fail(e);
                Vec::new()
            }
        }
    }

    /// Download one Gaussian scale-space plane as float32 pixels.
    /// Blocks until any running detection is finished.
    pub fn download_scale_space_image(&mut self, octave: u32, scale: u32) -> Vec<f32> {
        self.download_plane(octave, scale, false)
    }

    /// Download one DoG plane as float32 pixels.
    /// Blocks until any running detection is finished.
    pub fn download_dog_image(&mut self, octave: u32, scale: u32) -> Vec<f32> {
        self.download_plane(octave, scale, true)
    }

    // ---------------------------------------------------------------
    // Introspection
    // ---------------------------------------------------------------

    /// Octave count of the current scale-space.
    pub fn scale_space_nb_octaves(&self) -> u32 {
        self.scale_space.octave_count()
    }

    /// Image resolution of one octave.
    pub fn scale_space_octave_resolution(&mut self, octave: u32) -> (u32, u32) {
        match self.scale_space.octave_dimensions(octave) {
            Some(resolution) => resolution,
            None => {
                self.report(SiftError::InvalidInput);
                (0, 0)
            }
        }
    }

    /// Whether a slot is free: no detection, match or transfer owns it.
    pub fn is_buffer_available(&mut self, buffer_id: u32) -> bool {
        if self.reject_poisoned() || self.reject_invalid_slot(buffer_id) {
            return false;
        }
        let slot = buffer_id as usize;
        let device = self.context.device();
        let signalled = match self.slots[slot].state {
            SlotState::Idle => true,
            SlotState::RunningDetect => {
                unsafe { fence_status(device, self.slots[slot].fence) }.unwrap_or(false)
            }
            SlotState::RunningMatchA | SlotState::RunningMatchB => {
                unsafe { fence_status(device, self.match_fence) }.unwrap_or(false)
            }
            SlotState::Transfer => false,
        };
        if signalled {
            self.slots[slot].state = SlotState::Idle;
        }
        signalled
    }

    /// Present one empty debug frame. Returns true while the debug surface
    /// is attached and presentable.
    pub fn present_debug_frame(&mut self) -> bool {
        if self.poisoned {
            return false;
        }
        match self.debug_window.as_mut() {
            Some(window) => window.present_frame(&self.context),
            None => {
                tracing::warn!(
                    "present_debug_frame called without external window information"
                );
                false
            }
        }
    }

    // ---------------------------------------------------------------
    // Internals
    // ---------------------------------------------------------------

    fn report(&self, error: SiftError) {
        tracing::error!("SIFT operation failed: {error}");
        if let Some(callback) = self.config.on_error_callback {
            callback(error);
        }
    }

    fn fail(&mut self, error: SiftError) {
        if error == SiftError::Vulkan {
            self.poisoned = true;
        }
        self.report(error);
    }

    fn reject_poisoned(&self) -> bool {
        if self.poisoned {
            self.report(SiftError::Vulkan);
            return true;
        }
        false
    }

    fn reject_invalid_slot(&self, buffer_id: u32) -> bool {
        if buffer_id >= self.config.sift_buffer_count {
            self.report(SiftError::InvalidInput);
            return true;
        }
        false
    }

    fn wait_slot(&mut self, slot: usize) -> SiftResult<()> {
        match self.slots[slot].state {
            SlotState::Idle | SlotState::Transfer => {}
            SlotState::RunningDetect => {
                unsafe { wait_for_fence(self.context.device(), self.slots[slot].fence, u64::MAX) }
                    .map_err(|_| SiftError::Vulkan)?;
            }
            SlotState::RunningMatchA | SlotState::RunningMatchB => {
                self.wait_match()?;
            }
        }
        self.slots[slot].state = SlotState::Idle;
        Ok(())
    }

    fn wait_match(&mut self) -> SiftResult<()> {
        if let Some((a, b)) = self.match_pair {
            let running = matches!(
                self.slots[a].state,
                SlotState::RunningMatchA | SlotState::RunningMatchB
            ) || matches!(
                self.slots[b].state,
                SlotState::RunningMatchA | SlotState::RunningMatchB
            );
            if running {
                unsafe { wait_for_fence(self.context.device(), self.match_fence, u64::MAX) }
                    .map_err(|_| SiftError::Vulkan)?;
                self.slots[a].state = SlotState::Idle;
                self.slots[b].state = SlotState::Idle;
            }
        }
        Ok(())
    }

    fn wait_all_detects(&mut self) -> SiftResult<()> {
        for slot in 0..self.slots.len() {
            if self.slots[slot].state == SlotState::RunningDetect {
                self.wait_slot(slot)?;
            }
        }
        Ok(())
    }

    fn try_detect(
        &mut self,
        image_data: &[u8],
        width: u32,
        height: u32,
        slot: usize,
    ) -> SiftResult<()> {
        // The pyramid, candidate and staging buffers are shared by every
        // detection, so a new detection waits on any running one even when
        // it targets another slot
        self.wait_all_detects()?;
        self.wait_slot(slot)?;

        let device = self.context.device();

        if self.scale_space.input_dimensions() != (width, height) {
            let mut allocator = self.context.allocator().lock();
            let rebuilt = self
                .scale_space
                .ensure_resolution(device, &mut allocator, width, height)
                .map_err(|e| map_gpu_error(&e))?;
            drop(allocator);
            if rebuilt {
                tracing::debug!(
                    "Scale-space rebuilt for {width}x{height}, {} octaves",
                    self.scale_space.octave_count()
                );
                self.detector
                    .on_resolution_change(device, &mut self.scale_space)
                    .map_err(|e| map_gpu_error(&e))?;
            }
        }

        self.input_staging
            .write_bytes(0, image_data)
            .map_err(|_| SiftError::Vulkan)?;

        unsafe {
            reset_fence(device, self.slots[slot].fence).map_err(|_| SiftError::Vulkan)?;

            begin_command_buffer(
                device,
                self.detect_cmd,
                vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
            )
            .map_err(|_| SiftError::Vulkan)?;
            self.scale_space
                .record_build(device, self.detect_cmd, &mut self.input_staging)
                .map_err(|_| SiftError::Vulkan)?;
            self.detector
                .record_detect(
                    device,
                    self.detect_cmd,
                    &mut self.scale_space,
                    &mut self.slots[slot].buffer,
                    slot,
                )
                .map_err(|_| SiftError::Vulkan)?;
            end_command_buffer(device, self.detect_cmd).map_err(|_| SiftError::Vulkan)?;

            submit_command_buffers(
                device,
                self.context.compute_queue(),
                &[self.detect_cmd],
                self.slots[slot].fence,
            )
            .map_err(|_| SiftError::Vulkan)?;
        }

        self.slots[slot].state = SlotState::RunningDetect;
        Ok(())
    }

    fn try_match(&mut self, slot_a: usize, slot_b: usize) -> SiftResult<()> {
        self.wait_slot(slot_a)?;
        self.wait_slot(slot_b)?;

        // Matching empty slots is a caller error
        if self.read_slot_count(slot_a)? == 0 || self.read_slot_count(slot_b)? == 0 {
            return Err(SiftError::InvalidInput);
        }

        let device = self.context.device();
        unsafe {
            reset_fence(device, self.match_fence).map_err(|_| SiftError::Vulkan)?;

            begin_command_buffer(
                device,
                self.match_cmd,
                vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
            )
            .map_err(|_| SiftError::Vulkan)?;

            let (low, high) = (slot_a.min(slot_b), slot_a.max(slot_b));
            let (left, right) = self.slots.split_at_mut(high);
            let (low_buffer, high_buffer) = (&mut left[low].buffer, &mut right[0].buffer);
            let (buffer_a, buffer_b) = if slot_a < slot_b {
                (low_buffer, high_buffer)
            } else {
                (high_buffer, low_buffer)
            };

            self.matcher
                .record_match(
                    device,
                    self.match_cmd,
                    &mut self.detector,
                    buffer_a,
                    buffer_b,
                )
                .map_err(|_| SiftError::Vulkan)?;
            end_command_buffer(device, self.match_cmd).map_err(|_| SiftError::Vulkan)?;

            submit_command_buffers(
                device,
                self.context.compute_queue(),
                &[self.match_cmd],
                self.match_fence,
            )
            .map_err(|_| SiftError::Vulkan)?;
        }

        self.slots[slot_a].state = SlotState::RunningMatchA;
        self.slots[slot_b].state = SlotState::RunningMatchB;
        self.match_pair = Some((slot_a, slot_b));
        Ok(())
    }

    /// Synchronous copy of a slot's count header.
    fn read_slot_count(&mut self, slot: usize) -> SiftResult<u32> {
        self.slots[slot].state = SlotState::Transfer;
        let device = self.context.device();
        let slot_buffer = &mut self.slots[slot].buffer;
        let download = &mut self.download_staging;

        let result = unsafe {
            execute_single_time_commands(
                device,
                &self.command_pool,
                self.transfer_queue,
                |cmd| {
                    let barriers = [
                        slot_buffer.barrier_and_update(
                            vk::PipelineStageFlags2::TRANSFER,
                            vk::AccessFlags2::TRANSFER_READ,
                        ),
                        download.barrier_and_update(
                            vk::PipelineStageFlags2::TRANSFER,
                            vk::AccessFlags2::TRANSFER_WRITE,
                        ),
                    ];
                    pipeline_barrier(device, cmd, &barriers, &[]);
                    let region = vk::BufferCopy::default().size(4);
                    device.cmd_copy_buffer(cmd, slot_buffer.buffer, download.buffer, &[region]);
                },
            )
        };
        self.slots[slot].state = SlotState::Idle;
        result.map_err(|_| SiftError::Vulkan)?;

        let mut header = [0u8; 4];
        self.download_staging
            .read_bytes(0, &mut header)
            .map_err(|_| SiftError::Vulkan)?;
        Ok(u32::from_le_bytes(header).min(self.config.max_nb_sift_per_buffer))
    }

    fn try_download_features(&mut self, slot: usize) -> SiftResult<Vec<Feature>> {
        let count = self.read_slot_count(slot)? as usize;
        if count == 0 {
            return Ok(Vec::new());
        }

        let record_size = self.config.descriptor_format.record_size();
        let byte_count = count as u64 * record_size;

        self.slots[slot].state = SlotState::Transfer;
        let device = self.context.device();
        let slot_buffer = &mut self.slots[slot].buffer;
        let download = &mut self.download_staging;

        let result = unsafe {
            execute_single_time_commands(
                device,
                &self.command_pool,
                self.transfer_queue,
                |cmd| {
                    let barriers = [
                        slot_buffer.barrier_and_update(
                            vk::PipelineStageFlags2::TRANSFER,
                            vk::AccessFlags2::TRANSFER_READ,
                        ),
                        download.barrier_and_update(
                            vk::PipelineStageFlags2::TRANSFER,
                            vk::AccessFlags2::TRANSFER_WRITE,
                        ),
                    ];
                    pipeline_barrier(device, cmd, &barriers, &[]);
                    let region = vk::BufferCopy::default()
                        .src_offset(FEATURE_BUFFER_HEADER_SIZE)
                        .size(byte_count);
                    device.cmd_copy_buffer(cmd, slot_buffer.buffer, download.buffer, &[region]);
                },
            )
        };
        self.slots[slot].state = SlotState::Idle;
        result.map_err(|_| SiftError::Vulkan)?;

        let features = match self.config.descriptor_format {
            DescriptorFormat::Ubc1 => self
                .download_staging
                .read_range::<RawFeatureU8>(0, count)
                .map_err(|_| SiftError::Vulkan)?
                .iter()
                .map(Feature::from)
                .collect(),
            DescriptorFormat::Ubc2 => self
                .download_staging
                .read_range::<RawFeatureF32>(0, count)
                .map_err(|_| SiftError::Vulkan)?
                .iter()
                .map(Feature::from)
                .collect(),
        };
        Ok(features)
    }

    fn try_upload_features(&mut self, features: &[Feature], slot: usize) -> SiftResult<()> {
        let record_size = self.config.descriptor_format.record_size();
        let header = [features.len() as u32, 0, 0, 0];
        self.upload_staging
            .write_range(0, &header)
            .map_err(|_| SiftError::Vulkan)?;

        match self.config.descriptor_format {
            DescriptorFormat::Ubc1 => {
                let raw: Vec<RawFeatureU8> =
                    features.iter().filter_map(Feature::to_raw_u8).collect();
                self.upload_staging
                    .write_range(FEATURE_BUFFER_HEADER_SIZE, &raw)
                    .map_err(|_| SiftError::Vulkan)?;
            }
            DescriptorFormat::Ubc2 => {
                let raw: Vec<RawFeatureF32> =
                    features.iter().filter_map(Feature::to_raw_f32).collect();
                self.upload_staging
                    .write_range(FEATURE_BUFFER_HEADER_SIZE, &raw)
                    .map_err(|_| SiftError::Vulkan)?;
            }
        }

        let byte_count = FEATURE_BUFFER_HEADER_SIZE + features.len() as u64 * record_size;

        self.slots[slot].state = SlotState::Transfer;
        let device = self.context.device();
        let slot_buffer = &mut self.slots[slot].buffer;
        let upload = &mut self.upload_staging;

        let result = unsafe {
            execute_single_time_commands(
                device,
                &self.command_pool,
                self.transfer_queue,
                |cmd| {
                    let barriers = [
                        upload.barrier_and_update(
                            vk::PipelineStageFlags2::TRANSFER,
                            vk::AccessFlags2::TRANSFER_READ,
                        ),
                        slot_buffer.barrier_and_update(
                            vk::PipelineStageFlags2::TRANSFER,
                            vk::AccessFlags2::TRANSFER_WRITE,
                        ),
                    ];
                    pipeline_barrier(device, cmd, &barriers, &[]);
                    let region = vk::BufferCopy::default().size(byte_count);
                    device.cmd_copy_buffer(cmd, upload.buffer, slot_buffer.buffer, &[region]);
                },
            )
        };
        self.slots[slot].state = SlotState::Idle;
        result.map_err(|_| SiftError::Vulkan)?;
        Ok(())
    }

    fn read_match_count(&mut self) -> SiftResult<u32> {
        let device = self.context.device();
        let match_buffer = &mut self.matcher.match_buffer;
        let download = &mut self.download_staging;

        unsafe {
            execute_single_time_commands(
                device,
                &self.command_pool,
                self.transfer_queue,
                |cmd| {
                    let barriers = [
                        match_buffer.barrier_and_update(
                            vk::PipelineStageFlags2::TRANSFER,
                            vk::AccessFlags2::TRANSFER_READ,
                        ),
                        download.barrier_and_update(
                            vk::PipelineStageFlags2::TRANSFER,
                            vk::AccessFlags2::TRANSFER_WRITE,
                        ),
                    ];
                    pipeline_barrier(device, cmd, &barriers, &[]);
                    let region = vk::BufferCopy::default().size(4);
                    device.cmd_copy_buffer(cmd, match_buffer.buffer, download.buffer, &[region]);
                },
            )
        }
        .map_err(|_| SiftError::Vulkan)?;

        let mut header = [0u8; 4];
        self.download_staging
            .read_bytes(0, &mut header)
            .map_err(|_| SiftError::Vulkan)?;
        Ok(u32::from_le_bytes(header).min(self.config.max_nb_sift_per_buffer))
    }

    fn try_download_matches(&mut self) -> SiftResult<Vec<Match2NN>> {
        let count = self.read_match_count()? as usize;
        if count == 0 {
            return Ok(Vec::new());
        }

        let byte_count = count as u64 * std::mem::size_of::<Match2NN>() as u64;
        let device = self.context.device();
        let match_buffer = &mut self.matcher.match_buffer;
        let download = &mut self.download_staging;

        unsafe {
            execute_single_time_commands(
                device,
                &self.command_pool,
                self.transfer_queue,
                |cmd| {
                    let barriers = [
                        match_buffer.barrier_and_update(
                            vk::PipelineStageFlags2::TRANSFER,
                            vk::AccessFlags2::TRANSFER_READ,
                        ),
                        download.barrier_and_update(
                            vk::PipelineStageFlags2::TRANSFER,
                            vk::AccessFlags2::TRANSFER_WRITE,
                        ),
                    ];
                    pipeline_barrier(device, cmd, &barriers, &[]);
                    let region = vk::BufferCopy::default()
                        .src_offset(FEATURE_BUFFER_HEADER_SIZE)
                        .size(byte_count);
                    device.cmd_copy_buffer(cmd, match_buffer.buffer, download.buffer, &[region]);
                },
            )
        }
        .map_err(|_| SiftError::Vulkan)?;

        self.download_staging
            .read_range::<Match2NN>(0, count)
            .map_err(|_| SiftError::Vulkan)
    }

    fn download_plane(&mut self, octave: u32, scale: u32, from_dog: bool) -> Vec<f32> {
        if self.reject_poisoned() {
            return Vec::new();
        }
        let max_scale = if from_dog {
            self.scale_space.nb_dog_layers()
        } else {
            self.scale_space.nb_gauss_layers()
        };
        if octave >= self.scale_space.octave_count() || scale >= max_scale {
            self.report(SiftError::InvalidInput);
            return Vec::new();
        }
        match self.try_download_plane(octave, scale, from_dog) {
            Ok(plane) => plane,
            Err(e) => {
                self.fail(e);
                Vec::new()
            }
        }
    }

    fn try_download_plane(
        &mut self,
        octave: u32,
        scale: u32,
        from_dog: bool,
    ) -> SiftResult<Vec<f32>> {
        // The pyramid holds the planes of the last detection
        self.wait_all_detects()?;

        let device = self.context.device();
        let scale_space = &mut self.scale_space;
        let download = &mut self.download_staging;

        unsafe {
            execute_single_time_commands(
                device,
                &self.command_pool,
                self.transfer_queue,
                |cmd| {
                    scale_space
                        .record_plane_download(device, cmd, octave, scale, from_dog, download);
                },
            )
        }
        .map_err(|_| SiftError::Vulkan)?;

        let (width, height) = self
            .scale_space
            .octave_dimensions(octave)
            .ok_or(SiftError::InvalidInput)?;
        let pixel_count = (width as usize) * (height as usize);

        let plane = match self.config.pyramid_precision_mode {
            PyramidPrecision::Float16 => {
                let mut bytes = vec![0u8; pixel_count * 2];
                self.download_staging
                    .read_bytes(0, &mut bytes)
                    .map_err(|_| SiftError::Vulkan)?;
                staging::decode_f16_plane(&bytes)
            }
            PyramidPrecision::Float32 => {
                let mut bytes = vec![0u8; pixel_count * 4];
                self.download_staging
                    .read_bytes(0, &mut bytes)
                    .map_err(|_| SiftError::Vulkan)?;
                staging::decode_f32_plane(&bytes)
            }
        };
        Ok(plane)
    }
}

impl Drop for SiftInstance {
    fn drop(&mut self) {
        // Wait for every in-flight pipeline before tearing anything down
        let _ = self.context.wait_idle();

        unsafe {
            if let Some(mut window) = self.debug_window.take() {
                window.destroy(&self.context);
            }

            let device = self.context.device();
            let mut allocator = self.context.allocator().lock();
            let _ = self.scale_space.destroy(device, &mut allocator);
            let _ = self.detector.destroy(device, &mut allocator);
            let _ = self.matcher.destroy(device, &mut allocator);
            for slot in &mut self.slots {
                let _ = allocator.free_buffer(&mut slot.buffer);
                device.destroy_fence(slot.fence, None);
            }
            let _ = allocator.free_buffer(&mut self.input_staging);
            let _ = allocator.free_buffer(&mut self.upload_staging);
            let _ = allocator.free_buffer(&mut self.download_staging);
            drop(allocator);

            device.destroy_fence(self.match_fence, None);
            self.command_pool.destroy(device);
        }
        // The context field drops last and releases the device
    }
}

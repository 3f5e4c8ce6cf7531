//! Compute pipeline configuration and command recording.
//!
//! A [`ComputePipeline`] turns a shader + workgroup + constant-data
//! configuration into a driver pipeline object, built lazily and rebuilt
//! whenever a mutation invalidates it. Recording is split into three ordered
//! phases per dispatch cycle — init (resource layout transitions), compute
//! (bind + push constants + dispatch), finalize (symmetric transitions) —
//! appended into an externally-owned [`CommandBuffer`].

use std::sync::Arc;

use ash::vk;
use thiserror::Error;

use crate::command::CommandBuffer;
use crate::device::Device;
use crate::shader::ShaderModule;

#[derive(Debug, Error)]
pub enum CreateComputePipelineError {
    #[error(
        "Mismatched parameters to ComputePipeline::new. The shader module \
         must be created from the same device"
    )]
    MismatchedDevice,
}

#[derive(Debug, Error)]
pub enum BuildComputePipelineError {
    #[error("Vulkan error creating pipeline layout: {0}")]
    LayoutCreation(vk::Result),

    #[error("Vulkan error creating compute pipeline: {0}")]
    PipelineCreation(vk::Result),
}

#[derive(Debug, Error)]
pub enum RecordCommandsError {
    #[error("The command buffer was created from a different device than the pipeline")]
    MismatchedDevice,

    #[error(transparent)]
    Build(#[from] BuildComputePipelineError),
}

#[derive(Debug, Error)]
pub enum SetPushConstantsError {
    #[error("Push constant data is {actual} byte(s); the pipeline was created with {expected}")]
    SizeMismatch { expected: usize, actual: usize },
}

/// An image the compute shader reads or writes, registered for the
/// init/finalize barrier phases of a dispatch cycle.
#[derive(Debug, Clone, Copy)]
pub struct BoundImage {
    pub image: vk::Image,
    /// Layout the image is in when the init phase runs.
    pub initial_layout: vk::ImageLayout,
    /// Layout the finalize phase leaves the image in for downstream
    /// consumers.
    pub final_layout: vk::ImageLayout,
}

/// Command-recording protocol shared by all pipeline kinds.
///
/// Each pipeline kind is a separate type implementing this trait; adding a
/// kind (e.g. a graphics variant) adds an implementation, not a subclass
/// chain. The three phases must be recorded in order within one command
/// buffer; [`record_commands`](Pipeline::record_commands) runs them
/// back-to-back.
pub trait Pipeline {
    /// Record the resource transitions required before the shader may touch
    /// its bound resources. Must precede
    /// [`record_commands_compute`](Pipeline::record_commands_compute) in the
    /// same command buffer.
    ///
    /// # Safety
    /// `command_buffer` must be in the recording state. Registered resources
    /// must be in their declared layouts when the buffer executes.
    unsafe fn record_commands_init(
        &mut self,
        command_buffer: &mut CommandBuffer,
    ) -> Result<(), RecordCommandsError>;

    /// Ensure the driver pipeline exists (building it when stale), bind it,
    /// upload push constants, and record the dispatch.
    ///
    /// # Safety
    /// `command_buffer` must be in the recording state.
    unsafe fn record_commands_compute(
        &mut self,
        command_buffer: &mut CommandBuffer,
    ) -> Result<(), RecordCommandsError>;

    /// Record the symmetric transitions leaving resources in an
    /// externally-consumable state.
    ///
    /// # Safety
    /// `command_buffer` must be in the recording state, after the compute
    /// phase of the same cycle.
    unsafe fn record_commands_finalize(
        &mut self,
        command_buffer: &mut CommandBuffer,
    ) -> Result<(), RecordCommandsError>;

    /// Run init, compute, and — when `finalize_images` is set — finalize.
    ///
    /// Skipping finalize is for callers whose downstream pass in the same
    /// command buffer performs an equivalent transition itself.
    ///
    /// # Safety
    /// `command_buffer` must be in the recording state. Registered resources
    /// must be in their declared layouts when the buffer executes.
    unsafe fn record_commands(
        &mut self,
        command_buffer: &mut CommandBuffer,
        finalize_images: bool,
    ) -> Result<(), RecordCommandsError> {
        // SAFETY: Forwarded to this method's safety contract.
        unsafe {
            self.record_commands_init(command_buffer)?;
            self.record_commands_compute(command_buffer)?;
            if finalize_images {
                self.record_commands_finalize(command_buffer)?;
            }
        }
        Ok(())
    }
}

/// A configurable compute program bound to one [`Device`].
///
/// The driver pipeline object is built on demand from the current
/// configuration: changing the local workgroup size or the specialization
/// data invalidates a built pipeline (the next recording call rebuilds it);
/// changing the problem size only recomputes the dispatch group count.
///
/// Configuration and recording take `&mut self`: a pipeline is owned by the
/// thread recording with it, which is the documented thread-safety contract.
/// The type is `Send`, so ownership may move between threads.
pub struct ComputePipeline {
    parent: Arc<Device>,
    shader_module: Arc<ShaderModule>,

    /// `None` until first built, and again after any invalidating mutation.
    handle: Option<vk::Pipeline>,
    layout: Option<vk::PipelineLayout>,

    push_constants: Vec<u8>,
    specialization_data: Vec<u32>,

    size: vk::Extent2D,
    local_workgroup_size: vk::Extent2D,
    group_count: vk::Extent2D,

    bound_images: Vec<BoundImage>,
}

impl std::fmt::Debug for ComputePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputePipeline")
            .field("handle", &self.handle)
            .field("size", &self.size)
            .field("local_workgroup_size", &self.local_workgroup_size)
            .field("group_count", &self.group_count)
            .finish_non_exhaustive()
    }
}

impl ComputePipeline {
    /// Create a compute pipeline configuration.
    ///
    /// No driver object is built yet; that happens on the first compute
    /// recording. `push_constants_size` fixes the byte size of the
    /// push-constant block for the pipeline's lifetime. The local workgroup
    /// size starts at a value derived from the device limits and can be
    /// overridden via
    /// [`set_local_workgroup_size`](Self::set_local_workgroup_size).
    pub fn new(
        device: &Arc<Device>,
        shader_module: Arc<ShaderModule>,
        push_constants_size: u32,
    ) -> Result<Self, CreateComputePipelineError> {
        if !Arc::ptr_eq(shader_module.device(), device) {
            return Err(CreateComputePipelineError::MismatchedDevice);
        }

        let local_workgroup_size =
            default_local_workgroup_size(device.physical_device().limits());

        Ok(Self {
            parent: Arc::clone(device),
            shader_module,
            handle: None,
            layout: None,
            push_constants: vec![0; push_constants_size as usize],
            specialization_data: Vec::new(),
            size: vk::Extent2D::default(),
            local_workgroup_size,
            group_count: vk::Extent2D::default(),
            bound_images: Vec::new(),
        })
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.parent
    }

    pub fn local_workgroup_size(&self) -> vk::Extent2D {
        self.local_workgroup_size
    }

    pub fn size(&self) -> vk::Extent2D {
        self.size
    }

    pub fn group_count(&self) -> vk::Extent2D {
        self.group_count
    }

    /// Replace the specialization-constant words consumed at build time.
    ///
    /// Invalidates an already-built pipeline object; the next recording call
    /// rebuilds it. The previously built object is destroyed immediately, so
    /// command buffers recorded against it must have finished executing.
    pub fn set_custom_specialization_data(&mut self, data: Vec<u32>) {
        if self.specialization_data == data {
            return;
        }
        self.specialization_data = data;
        self.invalidate();
    }

    /// Set the per-invocation workgroup dimensions.
    ///
    /// Returns whether the value actually changed, letting callers skip
    /// redundant rebuild cycles. A degenerate (zero-area) size is rejected:
    /// the previous value stays in place and `false` is returned.
    ///
    /// On change, the dispatch group count is recomputed for the current
    /// problem size and any built pipeline object is destroyed (command
    /// buffers recorded against it must have finished executing).
    pub fn set_local_workgroup_size(&mut self, local_workgroup_size: vk::Extent2D) -> bool {
        let Some(accepted) = accept_workgroup_size(self.local_workgroup_size, local_workgroup_size)
        else {
            return false;
        };

        self.local_workgroup_size = accepted;
        self.group_count = dispatch_group_count(self.size, self.local_workgroup_size);
        self.invalidate();
        true
    }

    /// Set the global problem size in elements.
    ///
    /// Recomputes the dispatch group count as the per-axis ceiling division
    /// by the local workgroup size. Never invalidates a built pipeline — the
    /// group count feeds the dispatch call, not the pipeline object.
    pub fn set_size(&mut self, size: vk::Extent2D) {
        self.size = size;
        self.group_count = dispatch_group_count(size, self.local_workgroup_size);
    }

    /// The current push-constant bytes, sized exactly as configured at
    /// creation.
    pub fn push_constants(&self) -> &[u8] {
        &self.push_constants
    }

    /// Replace the push-constant bytes uploaded by the compute phase.
    ///
    /// `data` must match the configured push-constant size exactly. Changing
    /// push constants never invalidates the pipeline object.
    pub fn set_push_constants(&mut self, data: &[u8]) -> Result<(), SetPushConstantsError> {
        if data.len() != self.push_constants.len() {
            return Err(SetPushConstantsError::SizeMismatch {
                expected: self.push_constants.len(),
                actual: data.len(),
            });
        }
        self.push_constants.copy_from_slice(data);
        Ok(())
    }

    /// Register the images the init and finalize phases transition for this
    /// dispatch cycle. Does not affect the pipeline object.
    pub fn set_bound_images(&mut self, images: Vec<BoundImage>) {
        self.bound_images = images;
    }

    fn invalidate(&mut self) {
        if let Some(handle) = self.handle.take() {
            tracing::debug!("Invalidating compute pipeline {:?}", handle);
            // SAFETY: handle was created from parent. The setters' documented
            // contract requires no in-flight GPU work on the old object.
            unsafe { self.parent.destroy_raw_pipeline(handle) };
        }
    }

    fn ensure_layout(&mut self) -> Result<vk::PipelineLayout, BuildComputePipelineError> {
        if let Some(layout) = self.layout {
            return Ok(layout);
        }

        let push_constant_range = vk::PushConstantRange::default()
            .stage_flags(vk::ShaderStageFlags::COMPUTE)
            .offset(0)
            .size(self.push_constants.len() as u32);
        let push_constant_ranges = [push_constant_range];

        let mut create_info = vk::PipelineLayoutCreateInfo::default();
        if !self.push_constants.is_empty() {
            create_info = create_info.push_constant_ranges(&push_constant_ranges);
        }

        // SAFETY: create_info only references the local range array.
        let layout = unsafe { self.parent.create_raw_pipeline_layout(&create_info) }
            .map_err(BuildComputePipelineError::LayoutCreation)?;
        self.layout = Some(layout);
        Ok(layout)
    }

    /// Build the driver pipeline object if it does not exist, returning the
    /// pipeline and its layout. On failure the pipeline stays unbuilt and no
    /// partial object is retained.
    fn ensure_built(
        &mut self,
    ) -> Result<(vk::Pipeline, vk::PipelineLayout), BuildComputePipelineError> {
        let layout = self.ensure_layout()?;
        if let Some(handle) = self.handle {
            return Ok((handle, layout));
        }

        let words = specialization_words(self.local_workgroup_size, &self.specialization_data);
        let map_entries: Vec<vk::SpecializationMapEntry> = (0..words.len())
            .map(|index| {
                vk::SpecializationMapEntry::default()
                    .constant_id(index as u32)
                    .offset((index * 4) as u32)
                    .size(4)
            })
            .collect();
        let data: Vec<u8> = words.iter().flat_map(|word| word.to_ne_bytes()).collect();

        let specialization_info = vk::SpecializationInfo::default()
            .map_entries(&map_entries)
            .data(&data);

        let stage = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(self.shader_module.raw_handle())
            .name(c"main")
            .specialization_info(&specialization_info);

        let create_info = vk::ComputePipelineCreateInfo::default()
            .stage(stage)
            .layout(layout);

        // SAFETY: create_info references the shader module owned by this
        // pipeline and a layout created from parent; all borrowed data
        // outlives the call.
        let handle = unsafe { self.parent.create_raw_compute_pipeline(&create_info) }
            .map_err(BuildComputePipelineError::PipelineCreation)?;

        tracing::debug!(
            "Built compute pipeline {:?} (local workgroup {}x{}, {} specialization word(s))",
            handle,
            self.local_workgroup_size.width,
            self.local_workgroup_size.height,
            words.len(),
        );

        self.handle = Some(handle);
        Ok((handle, layout))
    }

    fn check_same_device(&self, command_buffer: &CommandBuffer) -> Result<(), RecordCommandsError> {
        if Arc::ptr_eq(command_buffer.device(), &self.parent) {
            Ok(())
        } else {
            Err(RecordCommandsError::MismatchedDevice)
        }
    }
}

impl Pipeline for ComputePipeline {
    unsafe fn record_commands_init(
        &mut self,
        command_buffer: &mut CommandBuffer,
    ) -> Result<(), RecordCommandsError> {
        self.check_same_device(command_buffer)?;
        if self.bound_images.is_empty() {
            return Ok(());
        }

        let barriers: Vec<vk::ImageMemoryBarrier<'_>> = self
            .bound_images
            .iter()
            .map(|bound| {
                vk::ImageMemoryBarrier::default()
                    .src_access_mask(vk::AccessFlags::empty())
                    .dst_access_mask(vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE)
                    .old_layout(bound.initial_layout)
                    .new_layout(vk::ImageLayout::GENERAL)
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .image(bound.image)
                    .subresource_range(full_color_subresource_range())
            })
            .collect();

        // SAFETY: Recording state is the caller's contract; the barriers
        // reference images the caller registered for this cycle.
        unsafe {
            command_buffer.pipeline_barrier(
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::COMPUTE_SHADER,
                &barriers,
            )
        };
        Ok(())
    }

    unsafe fn record_commands_compute(
        &mut self,
        command_buffer: &mut CommandBuffer,
    ) -> Result<(), RecordCommandsError> {
        self.check_same_device(command_buffer)?;
        let (pipeline, layout) = self.ensure_built()?;

        // SAFETY: Recording state is the caller's contract; pipeline and
        // layout are live objects created from the same device.
        unsafe {
            command_buffer.bind_compute_pipeline(pipeline);
            if !self.push_constants.is_empty() {
                command_buffer.push_constants(
                    layout,
                    vk::ShaderStageFlags::COMPUTE,
                    0,
                    &self.push_constants,
                );
            }
            command_buffer.dispatch(self.group_count.width, self.group_count.height, 1);
        }
        Ok(())
    }

    unsafe fn record_commands_finalize(
        &mut self,
        command_buffer: &mut CommandBuffer,
    ) -> Result<(), RecordCommandsError> {
        self.check_same_device(command_buffer)?;
        if self.bound_images.is_empty() {
            return Ok(());
        }

        let barriers: Vec<vk::ImageMemoryBarrier<'_>> = self
            .bound_images
            .iter()
            .map(|bound| {
                vk::ImageMemoryBarrier::default()
                    .src_access_mask(vk::AccessFlags::SHADER_WRITE)
                    .dst_access_mask(vk::AccessFlags::MEMORY_READ)
                    .old_layout(vk::ImageLayout::GENERAL)
                    .new_layout(bound.final_layout)
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .image(bound.image)
                    .subresource_range(full_color_subresource_range())
            })
            .collect();

        // SAFETY: Recording state is the caller's contract; the compute
        // phase of this cycle left the images in GENERAL.
        unsafe {
            command_buffer.pipeline_barrier(
                vk::PipelineStageFlags::COMPUTE_SHADER,
                vk::PipelineStageFlags::ALL_COMMANDS,
                &barriers,
            )
        };
        Ok(())
    }
}

impl Drop for ComputePipeline {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            tracing::debug!("Dropping compute pipeline {:?}", handle);
            // SAFETY: handle was created from parent and is being destroyed
            // during teardown. All in-flight GPU work referencing it must be
            // completed before drop.
            unsafe { self.parent.destroy_raw_pipeline(handle) };
        }
        if let Some(layout) = self.layout.take() {
            // SAFETY: layout was created from parent; the only pipeline using
            // it was destroyed above.
            unsafe { self.parent.destroy_raw_pipeline_layout(layout) };
        }
    }
}

// Verified at compile time: a pipeline can move to the thread that records
// with it. &mut receivers on all mutating operations make that thread the
// single writer.
#[allow(dead_code)]
trait AssertSend: Send {}
impl AssertSend for ComputePipeline {}

fn full_color_subresource_range() -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange::default()
        .aspect_mask(vk::ImageAspectFlags::COLOR)
        .base_mip_level(0)
        .level_count(vk::REMAINING_MIP_LEVELS)
        .base_array_layer(0)
        .layer_count(vk::REMAINING_ARRAY_LAYERS)
}

/// Per-axis ceiling division of the problem size by the workgroup size.
fn dispatch_group_count(size: vk::Extent2D, local: vk::Extent2D) -> vk::Extent2D {
    vk::Extent2D {
        width: size.width.div_ceil(local.width.max(1)),
        height: size.height.div_ceil(local.height.max(1)),
    }
}

/// Validate a requested workgroup-size change against the current value.
/// Returns `None` for degenerate (zero-area) requests and for no-op
/// requests equal to the current size.
fn accept_workgroup_size(
    current: vk::Extent2D,
    requested: vk::Extent2D,
) -> Option<vk::Extent2D> {
    if requested.width == 0 || requested.height == 0 {
        return None;
    }
    if requested.width == current.width && requested.height == current.height {
        return None;
    }
    Some(requested)
}

/// Specialization constants consumed at build time: words 0 and 1 carry the
/// local workgroup dimensions, custom data follows, one map entry per word
/// with consecutive constant IDs.
fn specialization_words(local: vk::Extent2D, custom: &[u32]) -> Vec<u32> {
    let mut words = Vec::with_capacity(2 + custom.len());
    words.push(local.width);
    words.push(local.height);
    words.extend_from_slice(custom);
    words
}

/// Largest power-of-two square workgroup that fits the device's compute
/// limits. On common desktop limits (1024 invocations) this yields 32x32.
fn default_local_workgroup_size(limits: &vk::PhysicalDeviceLimits) -> vk::Extent2D {
    let max_side = limits.max_compute_work_group_size[0]
        .min(limits.max_compute_work_group_size[1])
        .max(1);

    let mut side = 1u32;
    while side * 2 <= max_side
        && (side * 2).saturating_mul(side * 2) <= limits.max_compute_work_group_invocations
    {
        side *= 2;
    }

    vk::Extent2D {
        width: side,
        height: side,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extent(width: u32, height: u32) -> vk::Extent2D {
        vk::Extent2D { width, height }
    }

    #[test]
    fn group_count_divides_exactly() {
        let count = dispatch_group_count(extent(1024, 768), extent(16, 16));

        assert_eq!(count.width, 64);
        assert_eq!(count.height, 48);
    }

    #[test]
    fn group_count_rounds_up() {
        let count = dispatch_group_count(extent(1025, 768), extent(16, 16));

        assert_eq!(count.width, 65);
        assert_eq!(count.height, 48);
    }

    #[test]
    fn zero_area_workgroup_size_is_rejected() {
        let current = extent(16, 16);

        assert_eq!(accept_workgroup_size(current, extent(0, 16)), None);
        assert_eq!(accept_workgroup_size(current, extent(16, 0)), None);
    }

    #[test]
    fn unchanged_workgroup_size_reports_no_change() {
        let current = extent(16, 16);

        assert_eq!(accept_workgroup_size(current, extent(16, 16)), None);
        assert_eq!(
            accept_workgroup_size(current, extent(8, 8)),
            Some(extent(8, 8))
        );
    }

    #[test]
    fn specialization_words_lead_with_workgroup_dimensions() {
        let words = specialization_words(extent(16, 8), &[3, 7]);

        assert_eq!(words, vec![16, 8, 3, 7]);
    }

    #[test]
    fn specialization_words_without_custom_data() {
        let words = specialization_words(extent(32, 32), &[]);

        assert_eq!(words, vec![32, 32]);
    }

    #[test]
    fn default_workgroup_size_on_desktop_limits() {
        let limits = vk::PhysicalDeviceLimits {
            max_compute_work_group_invocations: 1024,
            max_compute_work_group_size: [1024, 1024, 64],
            ..Default::default()
        };

        assert_eq!(default_local_workgroup_size(&limits), extent(32, 32));
    }

    #[test]
    fn default_workgroup_size_respects_invocation_limit() {
        let limits = vk::PhysicalDeviceLimits {
            max_compute_work_group_invocations: 256,
            max_compute_work_group_size: [1024, 1024, 64],
            ..Default::default()
        };

        assert_eq!(default_local_workgroup_size(&limits), extent(16, 16));
    }

    #[test]
    fn default_workgroup_size_respects_axis_limit() {
        let limits = vk::PhysicalDeviceLimits {
            max_compute_work_group_invocations: 1024,
            max_compute_work_group_size: [8, 1024, 64],
            ..Default::default()
        };

        assert_eq!(default_local_workgroup_size(&limits), extent(8, 8));
    }
}

use std::collections::HashSet;
use std::ffi::{CString, c_char};
use std::sync::{Arc, Weak};

use ash::vk;
use parking_lot::Mutex;
use thiserror::Error;

use crate::physical_device::PhysicalDevice;
use crate::queue::Queue;

#[derive(Debug, Error)]
pub enum CreateDeviceError {
    #[error(
        "Mismatched parameters to Instance::create_device. The physical \
         device must be derived from the same instance"
    )]
    MismatchedInstance,

    #[error("No queue family satisfies the requested capabilities: {0:?}")]
    NoQueueFamily(vk::QueueFlags),

    #[error("Invalid extension name (contains interior NUL): {0}")]
    InvalidExtensionName(std::ffi::NulError),

    #[error("Vulkan error creating logical device: {0}")]
    DeviceCreation(vk::Result),
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Queue index {index} is out of range; the device was opened with {count} queue(s)")]
    IndexOutOfRange { index: u32, count: u32 },
}

/// One opened logical device.
///
/// Holds a strong reference to the adapter it was opened against, so the
/// adapter (and transitively the instance) cannot be destroyed while this
/// device is alive. Queues handed out by [`queue`](Self::queue) are tracked
/// weakly — the device never extends a queue wrapper's lifetime.
pub struct Device {
    parent: Arc<PhysicalDevice>,
    handle: ash::Device,
    queue_family_index: u32,
    queue_count: u32,
    enabled_extensions: HashSet<String>,
    /// Lazily populated, grows to the highest requested index, never shrinks.
    queues: Mutex<Vec<Weak<Queue>>>,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("handle", &self.handle.handle())
            .field("queue_family_index", &self.queue_family_index)
            .finish_non_exhaustive()
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        tracing::debug!("Dropping device {:?}", self.handle.handle());
        //SAFETY: All objects derived from this device hold an Arc to it and
        //are already dropped when we get here.
        unsafe { self.handle.destroy_device(None) };
    }
}

impl Device {
    pub(crate) fn new(
        physical_device: &Arc<PhysicalDevice>,
        queue_family_index: u32,
        features: &vk::PhysicalDeviceFeatures,
        extensions: Vec<String>,
        max_queue_count: u32,
    ) -> Result<Arc<Self>, CreateDeviceError> {
        let family = physical_device
            .queue_family_properties()
            .get(queue_family_index as usize)
            .ok_or(CreateDeviceError::NoQueueFamily(vk::QueueFlags::empty()))?;
        let queue_count = max_queue_count.clamp(1, family.queue_count);

        let queue_priorities = vec![1.0f32; queue_count as usize];
        let queue_create_info = vk::DeviceQueueCreateInfo::default()
            .queue_family_index(queue_family_index)
            .queue_priorities(&queue_priorities);

        let extension_cstrings: Vec<CString> = extensions
            .iter()
            .map(|name| CString::new(name.as_str()))
            .collect::<Result<_, _>>()
            .map_err(CreateDeviceError::InvalidExtensionName)?;
        let extension_ptrs: Vec<*const c_char> =
            extension_cstrings.iter().map(|name| name.as_ptr()).collect();

        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(std::slice::from_ref(&queue_create_info))
            .enabled_extension_names(&extension_ptrs)
            .enabled_features(features);

        //SAFETY: The physical device handle was enumerated from its parent
        //instance; create_info only references locals that outlive the call.
        let handle = unsafe {
            physical_device
                .instance()
                .create_ash_device(physical_device.raw_handle(), &create_info)
        }
        .map_err(CreateDeviceError::DeviceCreation)?;

        tracing::info!(
            "Opened logical device on {:?} (queue family {}, {} queue(s), {} extension(s))",
            physical_device.name(),
            queue_family_index,
            queue_count,
            extensions.len(),
        );

        Ok(Arc::new(Self {
            parent: Arc::clone(physical_device),
            handle,
            queue_family_index,
            queue_count,
            enabled_extensions: extensions.into_iter().collect(),
            queues: Mutex::new(Vec::new()),
        }))
    }

    pub fn physical_device(&self) -> &Arc<PhysicalDevice> {
        &self.parent
    }

    /// The extensions actually enabled on this device — the requested set
    /// intersected with what the adapter supports, not the original request.
    pub fn enabled_extensions(&self) -> &HashSet<String> {
        &self.enabled_extensions
    }

    pub fn has_extension(&self, name: &str) -> bool {
        self.enabled_extensions.contains(name)
    }

    pub fn queue_family_index(&self) -> u32 {
        self.queue_family_index
    }

    /// Number of queues the device was opened with.
    pub fn num_queues(&self) -> u32 {
        self.queue_count
    }

    /// The queue at `index`, creating it on first request.
    ///
    /// Repeated calls with the same index return the same [`Queue`] object
    /// until every strong reference to it is dropped; construction is
    /// serialized on the registry mutex so concurrent callers can never
    /// produce two distinct queues for one index.
    pub fn queue(self: &Arc<Self>, index: u32) -> Result<Arc<Queue>, QueueError> {
        if index >= self.queue_count {
            return Err(QueueError::IndexOutOfRange {
                index,
                count: self.queue_count,
            });
        }

        let mut queues = self.queues.lock();
        if queues.len() <= index as usize {
            queues.resize_with(index as usize + 1, Weak::new);
        }
        if let Some(queue) = queues[index as usize].upgrade() {
            return Ok(queue);
        }

        //SAFETY: The device was opened with queue_count queues in
        //queue_family_index and index < queue_count.
        let raw = unsafe {
            self.handle
                .get_device_queue(self.queue_family_index, index)
        };
        let queue = Arc::new(Queue::new(
            Arc::clone(self),
            raw,
            self.queue_family_index,
            index,
        ));
        queues[index as usize] = Arc::downgrade(&queue);
        Ok(queue)
    }

    /// Wait until all submitted work on this device has completed.
    ///
    /// This may block the calling thread and should generally be used for
    /// coarse-grained transitions (shutdown, reconfiguration) rather than
    /// hot per-frame paths.
    pub fn wait_idle(&self) -> Result<(), vk::Result> {
        let _span = tracing::debug_span!("device_wait_idle").entered();
        // SAFETY: `self.handle` is a valid logical device for the lifetime of
        // `self`, and this call has no additional pointer preconditions.
        unsafe { self.handle.device_wait_idle() }
    }

    pub fn ash_handle(&self) -> &ash::Device {
        &self.handle
    }

    pub fn raw_handle(&self) -> vk::Device {
        self.handle.handle()
    }
}

// Shader module functionality
impl Device {
    /// # Safety
    /// `create_info` must contain valid SPIR-V code. All referenced pointers
    /// must remain valid for the duration of the call.
    pub unsafe fn create_raw_shader_module(
        &self,
        create_info: &vk::ShaderModuleCreateInfo<'_>,
    ) -> Result<vk::ShaderModule, vk::Result> {
        // SAFETY: Caller guarantees create_info validity.
        unsafe { self.handle.create_shader_module(create_info, None) }
    }

    /// # Safety
    /// `shader_module` must be a valid handle created from this device and
    /// not yet destroyed. All pipelines derived from it must be destroyed
    /// first.
    pub unsafe fn destroy_raw_shader_module(&self, shader_module: vk::ShaderModule) {
        // SAFETY: Caller guarantees shader_module provenance and drop ordering.
        unsafe { self.handle.destroy_shader_module(shader_module, None) };
    }
}

// Pipeline functionality
impl Device {
    /// # Safety
    /// `create_info` must be a valid pipeline layout create info. All
    /// referenced push constant ranges must remain valid for the duration of
    /// the call.
    pub unsafe fn create_raw_pipeline_layout(
        &self,
        create_info: &vk::PipelineLayoutCreateInfo<'_>,
    ) -> Result<vk::PipelineLayout, vk::Result> {
        // SAFETY: Caller guarantees create_info validity.
        unsafe { self.handle.create_pipeline_layout(create_info, None) }
    }

    /// # Safety
    /// `layout` must be a valid handle created from this device and not yet
    /// destroyed. No pipeline still using this layout may be in use.
    pub unsafe fn destroy_raw_pipeline_layout(&self, layout: vk::PipelineLayout) {
        // SAFETY: Caller guarantees layout provenance and drop ordering.
        unsafe { self.handle.destroy_pipeline_layout(layout, None) };
    }

    /// Create a single compute pipeline.
    ///
    /// On partial batch failure ash returns any successfully-created pipeline
    /// handles alongside the error; this wrapper destroys them so callers
    /// never receive a mix of valid and invalid handles.
    ///
    /// # Safety
    /// `create_info` must reference a valid compute shader stage and a valid
    /// pipeline layout, both derived from this device. All referenced
    /// pointers must remain valid for the duration of the call.
    pub unsafe fn create_raw_compute_pipeline(
        &self,
        create_info: &vk::ComputePipelineCreateInfo<'_>,
    ) -> Result<vk::Pipeline, vk::Result> {
        // SAFETY: Caller guarantees create_info validity.
        unsafe {
            self.handle.create_compute_pipelines(
                vk::PipelineCache::null(),
                std::slice::from_ref(create_info),
                None,
            )
        }
        .map_err(|(partial, result)| {
            for pipeline in partial {
                if pipeline != vk::Pipeline::null() {
                    // SAFETY: pipeline was just created by this device.
                    unsafe { self.handle.destroy_pipeline(pipeline, None) };
                }
            }
            result
        })
        .map(|mut pipelines| {
            debug_assert_eq!(pipelines.len(), 1);
            pipelines.remove(0)
        })
    }

    /// # Safety
    /// `pipeline` must be a valid handle created from this device and not yet
    /// destroyed. No in-flight GPU work may still reference the pipeline.
    pub unsafe fn destroy_raw_pipeline(&self, pipeline: vk::Pipeline) {
        // SAFETY: Caller guarantees pipeline provenance and drop ordering.
        unsafe { self.handle.destroy_pipeline(pipeline, None) };
    }
}

// Command pool/buffer functionality
impl Device {
    /// # Safety
    /// `create_info` must use a queue family index this device was opened
    /// with.
    pub unsafe fn create_raw_command_pool(
        &self,
        create_info: &vk::CommandPoolCreateInfo<'_>,
    ) -> Result<vk::CommandPool, vk::Result> {
        // SAFETY: Caller guarantees create_info validity.
        unsafe { self.handle.create_command_pool(create_info, None) }
    }

    /// # Safety
    /// `pool` must be a valid handle created from this device. No command
    /// buffer allocated from it may be pending execution.
    pub unsafe fn destroy_raw_command_pool(&self, pool: vk::CommandPool) {
        // SAFETY: Caller guarantees pool provenance and drop ordering.
        unsafe { self.handle.destroy_command_pool(pool, None) };
    }

    /// # Safety
    /// `allocate_info` must reference a valid pool created from this device,
    /// with external synchronization on that pool upheld by the caller.
    pub unsafe fn allocate_raw_command_buffers(
        &self,
        allocate_info: &vk::CommandBufferAllocateInfo<'_>,
    ) -> Result<Vec<vk::CommandBuffer>, vk::Result> {
        // SAFETY: Caller guarantees allocate_info validity and pool
        // synchronization.
        unsafe { self.handle.allocate_command_buffers(allocate_info) }
    }

    /// # Safety
    /// `command_buffer` must be allocated from this device and not pending
    /// execution.
    pub unsafe fn reset_raw_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        flags: vk::CommandBufferResetFlags,
    ) -> Result<(), vk::Result> {
        // SAFETY: Caller guarantees command buffer provenance and state.
        unsafe { self.handle.reset_command_buffer(command_buffer, flags) }
    }

    /// # Safety
    /// `command_buffer` must be allocated from this device and in the initial
    /// state.
    pub unsafe fn begin_raw_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        begin_info: &vk::CommandBufferBeginInfo<'_>,
    ) -> Result<(), vk::Result> {
        // SAFETY: Caller guarantees command buffer provenance and state.
        unsafe { self.handle.begin_command_buffer(command_buffer, begin_info) }
    }

    /// # Safety
    /// `command_buffer` must be allocated from this device and in the
    /// recording state.
    pub unsafe fn end_raw_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
    ) -> Result<(), vk::Result> {
        // SAFETY: Caller guarantees command buffer provenance and state.
        unsafe { self.handle.end_command_buffer(command_buffer) }
    }

    /// # Safety
    /// `command_buffer` must be in the recording state. All handles in the
    /// barriers must be valid and consistent with current resource state.
    pub unsafe fn cmd_pipeline_barrier(
        &self,
        command_buffer: vk::CommandBuffer,
        src_stage_mask: vk::PipelineStageFlags,
        dst_stage_mask: vk::PipelineStageFlags,
        image_memory_barriers: &[vk::ImageMemoryBarrier<'_>],
    ) {
        // SAFETY: Caller guarantees recording state and barrier validity.
        unsafe {
            self.handle.cmd_pipeline_barrier(
                command_buffer,
                src_stage_mask,
                dst_stage_mask,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                image_memory_barriers,
            )
        }
    }

    /// # Safety
    /// `command_buffer` must be in the recording state. `pipeline` must be a
    /// valid compute pipeline created from this device.
    pub unsafe fn cmd_bind_compute_pipeline(
        &self,
        command_buffer: vk::CommandBuffer,
        pipeline: vk::Pipeline,
    ) {
        // SAFETY: Caller guarantees recording state and pipeline validity.
        unsafe {
            self.handle.cmd_bind_pipeline(
                command_buffer,
                vk::PipelineBindPoint::COMPUTE,
                pipeline,
            )
        }
    }

    /// # Safety
    /// `command_buffer` must be in the recording state. `layout` must be a
    /// valid pipeline layout created from this device whose push-constant
    /// range covers `constants` at `offset` for `stage_flags`.
    pub unsafe fn cmd_push_constants(
        &self,
        command_buffer: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        stage_flags: vk::ShaderStageFlags,
        offset: u32,
        constants: &[u8],
    ) {
        // SAFETY: Caller guarantees recording state and range validity.
        unsafe {
            self.handle
                .cmd_push_constants(command_buffer, layout, stage_flags, offset, constants)
        }
    }

    /// # Safety
    /// `command_buffer` must be in the recording state with a compute
    /// pipeline bound, and the group counts must respect device limits.
    pub unsafe fn cmd_dispatch(
        &self,
        command_buffer: vk::CommandBuffer,
        group_count_x: u32,
        group_count_y: u32,
        group_count_z: u32,
    ) {
        // SAFETY: Caller guarantees recording and bound-pipeline state.
        unsafe {
            self.handle
                .cmd_dispatch(command_buffer, group_count_x, group_count_y, group_count_z)
        }
    }
}

// Queue functionality
impl Device {
    /// # Safety
    /// `queue` must belong to this device. All submit infos must reference
    /// valid, fully recorded command buffers. External synchronization on
    /// the queue is the caller's responsibility.
    pub unsafe fn queue_submit_raw(
        &self,
        queue: vk::Queue,
        submits: &[vk::SubmitInfo<'_>],
        fence: vk::Fence,
    ) -> Result<(), vk::Result> {
        // SAFETY: Caller guarantees queue provenance and submit validity.
        unsafe { self.handle.queue_submit(queue, submits, fence) }
    }

    /// # Safety
    /// `queue` must belong to this device.
    pub unsafe fn queue_wait_idle_raw(&self, queue: vk::Queue) -> Result<(), vk::Result> {
        // SAFETY: Caller guarantees queue provenance.
        unsafe { self.handle.queue_wait_idle(queue) }
    }
}

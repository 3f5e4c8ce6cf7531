//! Command pool and command buffer wrappers.
//!
//! [`CommandBuffer`] is the object the pipeline recording protocol appends
//! into. Each buffer co-owns its pool's inner state, so the raw Vulkan pool
//! is destroyed only after the pool wrapper and every buffer allocated from
//! it are gone; buffer memory is reclaimed by that pool destruction.

use std::marker::PhantomData;
use std::sync::Arc;

use ash::vk;
use thiserror::Error;

use crate::device::Device;

#[derive(Debug, Error)]
pub enum CreateCommandPoolError {
    #[error("Vulkan error creating command pool: {0}")]
    Vulkan(vk::Result),
}

#[derive(Debug, Error)]
pub enum AllocateCommandBufferError {
    #[error("Vulkan error allocating command buffer: {0}")]
    Vulkan(vk::Result),
}

/// Shared ownership of the raw Vulkan pool handle.
///
/// Held via `Arc` by both [`CommandPool`] and every [`CommandBuffer`]
/// allocated from it, preventing a buffer from holding a handle into a
/// destroyed pool.
struct CommandPoolShared {
    parent: Arc<Device>,
    pool: vk::CommandPool,
}

impl Drop for CommandPoolShared {
    fn drop(&mut self) {
        tracing::debug!("Dropping command pool {:?}", self.pool);
        // SAFETY: pool was created from parent. This runs only when the
        // CommandPool and every CommandBuffer allocated from it are dropped.
        // vkDestroyCommandPool implicitly frees all allocated buffers.
        unsafe { self.parent.destroy_raw_command_pool(self.pool) };
    }
}

/// An owned command pool that allocates individually-resettable primary
/// command buffers.
///
/// `CommandPool` is `!Sync`: the Vulkan spec requires external
/// synchronization for pool-level operations, and keeping the pool on a
/// single thread guarantees that structurally rather than with a mutex.
pub struct CommandPool {
    shared: Arc<CommandPoolShared>,
    _not_sync: PhantomData<std::cell::Cell<()>>,
}

impl std::fmt::Debug for CommandPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandPool")
            .field("pool", &self.shared.pool)
            .finish_non_exhaustive()
    }
}

impl CommandPool {
    /// Create a command pool for `queue_family_index`.
    pub fn new(
        device: &Arc<Device>,
        queue_family_index: u32,
    ) -> Result<Self, CreateCommandPoolError> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family_index)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);

        // SAFETY: create_info uses a queue family index of this device.
        let pool = unsafe { device.create_raw_command_pool(&create_info) }
            .map_err(CreateCommandPoolError::Vulkan)?;

        Ok(Self {
            shared: Arc::new(CommandPoolShared {
                parent: Arc::clone(device),
                pool,
            }),
            _not_sync: PhantomData,
        })
    }

    /// Allocate one primary command buffer.
    ///
    /// The returned buffer keeps the underlying pool alive; its handle is
    /// reclaimed when the pool is finally destroyed.
    pub fn allocate_command_buffer(&self) -> Result<CommandBuffer, AllocateCommandBufferError> {
        let allocate_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.shared.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        // SAFETY: allocate_info references a valid pool created from parent.
        // CommandPool is !Sync so no concurrent pool access is possible.
        let handle = unsafe { self.shared.parent.allocate_raw_command_buffers(&allocate_info) }
            .map(|mut buffers| {
                debug_assert_eq!(buffers.len(), 1);
                buffers.remove(0)
            })
            .map_err(AllocateCommandBufferError::Vulkan)?;

        Ok(CommandBuffer {
            _pool: Arc::clone(&self.shared),
            parent: Arc::clone(&self.shared.parent),
            handle,
        })
    }

    pub fn raw_command_pool(&self) -> vk::CommandPool {
        self.shared.pool
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.shared.parent
    }
}

/// A primary command buffer allocated from a [`CommandPool`].
///
/// All recording operations are `unsafe` — the caller is responsible for
/// correct Vulkan state sequencing (reset → begin → record → end → submit).
pub struct CommandBuffer {
    /// Keeps the pool alive until this buffer is dropped.
    _pool: Arc<CommandPoolShared>,
    parent: Arc<Device>,
    handle: vk::CommandBuffer,
}

impl std::fmt::Debug for CommandBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandBuffer")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl CommandBuffer {
    /// Reset this buffer to the initial state.
    ///
    /// # Safety
    /// The buffer must not be pending execution on the GPU.
    pub unsafe fn reset(&mut self) -> Result<(), vk::Result> {
        // SAFETY: Caller guarantees the buffer is not pending.
        unsafe {
            self.parent
                .reset_raw_command_buffer(self.handle, vk::CommandBufferResetFlags::empty())
        }
    }

    /// Begin recording.
    ///
    /// # Safety
    /// The buffer must be in the initial state (freshly allocated or reset).
    pub unsafe fn begin(&mut self) -> Result<(), vk::Result> {
        let begin_info = vk::CommandBufferBeginInfo::default();
        // SAFETY: Caller guarantees the buffer is in the initial state.
        unsafe { self.parent.begin_raw_command_buffer(self.handle, &begin_info) }
    }

    /// End recording.
    ///
    /// # Safety
    /// The buffer must be in the recording state.
    pub unsafe fn end(&mut self) -> Result<(), vk::Result> {
        // SAFETY: Caller guarantees the buffer is in the recording state.
        unsafe { self.parent.end_raw_command_buffer(self.handle) }
    }

    /// Record an image layout transition barrier.
    ///
    /// # Safety
    /// The buffer must be in the recording state. All image handles in the
    /// barriers must be valid and in the declared old layouts at execution
    /// time.
    pub unsafe fn pipeline_barrier(
        &mut self,
        src_stage_mask: vk::PipelineStageFlags,
        dst_stage_mask: vk::PipelineStageFlags,
        image_memory_barriers: &[vk::ImageMemoryBarrier<'_>],
    ) {
        // SAFETY: Caller guarantees recording state and barrier validity.
        unsafe {
            self.parent.cmd_pipeline_barrier(
                self.handle,
                src_stage_mask,
                dst_stage_mask,
                image_memory_barriers,
            )
        }
    }

    /// Bind a compute pipeline for subsequent dispatches.
    ///
    /// # Safety
    /// The buffer must be in the recording state. `pipeline` must be a valid
    /// compute pipeline created from the same device as this buffer.
    pub unsafe fn bind_compute_pipeline(&mut self, pipeline: vk::Pipeline) {
        // SAFETY: Caller guarantees recording state and pipeline validity.
        unsafe { self.parent.cmd_bind_compute_pipeline(self.handle, pipeline) }
    }

    /// Upload push-constant bytes.
    ///
    /// # Safety
    /// The buffer must be in the recording state. `layout` must declare a
    /// push-constant range covering `constants` at `offset` for
    /// `stage_flags`.
    pub unsafe fn push_constants(
        &mut self,
        layout: vk::PipelineLayout,
        stage_flags: vk::ShaderStageFlags,
        offset: u32,
        constants: &[u8],
    ) {
        // SAFETY: Caller guarantees recording state and range validity.
        unsafe {
            self.parent
                .cmd_push_constants(self.handle, layout, stage_flags, offset, constants)
        }
    }

    /// Record a dispatch.
    ///
    /// # Safety
    /// The buffer must be in the recording state with a compute pipeline
    /// bound.
    pub unsafe fn dispatch(&mut self, group_count_x: u32, group_count_y: u32, group_count_z: u32) {
        // SAFETY: Caller guarantees recording and bound-pipeline state.
        unsafe {
            self.parent
                .cmd_dispatch(self.handle, group_count_x, group_count_y, group_count_z)
        }
    }

    pub fn raw_command_buffer(&self) -> vk::CommandBuffer {
        self.handle
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.parent
    }
}

// Verified at compile time: both types are Send.
// CommandPool: Send + !Sync (PhantomData<Cell<()>>)
#[allow(dead_code)]
trait AssertSend: Send {}
impl AssertSend for CommandPool {}
impl AssertSend for CommandBuffer {}

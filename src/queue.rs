use std::sync::Arc;

use ash::vk;

use crate::device::Device;

/// A command-submission endpoint: one queue slot within the family the
/// owning [`Device`] was opened with.
///
/// Obtained only through [`Device::queue`], which caches one wrapper per
/// index. Holding a `Queue` keeps its device alive.
pub struct Queue {
    parent: Arc<Device>,
    handle: vk::Queue,
    family_index: u32,
    index: u32,
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("handle", &self.handle)
            .field("family_index", &self.family_index)
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}

impl Queue {
    pub(crate) fn new(parent: Arc<Device>, handle: vk::Queue, family_index: u32, index: u32) -> Self {
        Self {
            parent,
            handle,
            family_index,
            index,
        }
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.parent
    }

    pub fn raw_handle(&self) -> vk::Queue {
        self.handle
    }

    pub fn family_index(&self) -> u32 {
        self.family_index
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    /// Submit recorded work, optionally signalling `fence` on completion.
    ///
    /// Driver failures propagate unchanged as `vk::Result`.
    ///
    /// # Safety
    /// All submit infos must reference valid, fully recorded command buffers
    /// created from this queue's device. The caller must externally
    /// synchronize submissions against other uses of this queue.
    pub unsafe fn submit(
        &self,
        submits: &[vk::SubmitInfo<'_>],
        fence: vk::Fence,
    ) -> Result<(), vk::Result> {
        // SAFETY: handle belongs to parent; remaining requirements are
        // forwarded to the caller.
        unsafe { self.parent.queue_submit_raw(self.handle, submits, fence) }
    }

    /// Block until all work submitted to this queue has completed.
    pub fn wait_idle(&self) -> Result<(), vk::Result> {
        let _span = tracing::debug_span!("queue_wait_idle").entered();
        // SAFETY: handle belongs to parent and stays valid for the call.
        unsafe { self.parent.queue_wait_idle_raw(self.handle) }
    }
}

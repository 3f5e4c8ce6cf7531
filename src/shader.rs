use std::sync::Arc;

use ash::vk;
use thiserror::Error;

use crate::device::Device;

#[derive(Debug, Error)]
pub enum CreateShaderModuleError {
    #[error("SPIR-V byte slice length ({0}) is not a multiple of 4")]
    InvalidLength(usize),

    #[error("Vulkan error creating shader module: {0}")]
    Vulkan(vk::Result),
}

/// An owned compute shader module.
///
/// Pipelines hold the module behind an `Arc` so it outlives every pipeline
/// object compiled from it.
pub struct ShaderModule {
    parent: Arc<Device>,
    handle: vk::ShaderModule,
}

impl std::fmt::Debug for ShaderModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShaderModule")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl ShaderModule {
    /// Create a shader module from raw SPIR-V bytes.
    ///
    /// `spirv_bytes` must have a length that is a multiple of 4. The bytes
    /// are decoded as little-endian words (SPIR-V is defined little-endian),
    /// so the input need not be `u32`-aligned.
    pub fn new(
        device: &Arc<Device>,
        spirv_bytes: &[u8],
    ) -> Result<Arc<Self>, CreateShaderModuleError> {
        if spirv_bytes.len() % 4 != 0 {
            return Err(CreateShaderModuleError::InvalidLength(spirv_bytes.len()));
        }

        let code: Vec<u32> = spirv_bytes
            .chunks_exact(4)
            .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();

        let create_info = vk::ShaderModuleCreateInfo::default().code(&code);

        // SAFETY: create_info contains valid SPIR-V code words.
        let handle = unsafe { device.create_raw_shader_module(&create_info) }
            .map_err(CreateShaderModuleError::Vulkan)?;

        Ok(Arc::new(Self {
            parent: Arc::clone(device),
            handle,
        }))
    }

    pub fn raw_handle(&self) -> vk::ShaderModule {
        self.handle
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.parent
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        tracing::debug!("Dropping shader module {:?}", self.handle);
        // SAFETY: handle was created from parent. Every pipeline compiled
        // from this module holds an Arc to it, so all of them are gone.
        unsafe { self.parent.destroy_raw_shader_module(self.handle) };
    }
}

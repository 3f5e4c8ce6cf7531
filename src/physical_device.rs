use std::collections::HashSet;
use std::sync::Arc;

use ash::vk;

use crate::device::{CreateDeviceError, Device};
use crate::instance::Instance;
use crate::memory::{ANY_HEAP, MemoryPropertyFlags};

/// One enumerated adapter.
///
/// Immutable after construction and safe to share between threads. Capability
/// data (queue families, supported extensions, memory types) is queried once
/// at wrap time and cached for the adapter's lifetime.
pub struct PhysicalDevice {
    parent: Arc<Instance>,
    handle: vk::PhysicalDevice,
    properties: vk::PhysicalDeviceProperties,
    queue_families: Vec<vk::QueueFamilyProperties>,
    extensions: HashSet<String>,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
}

impl std::fmt::Debug for PhysicalDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhysicalDevice")
            .field("handle", &self.handle)
            .field("name", &self.name())
            .finish_non_exhaustive()
    }
}

impl PhysicalDevice {
    pub(crate) fn new(parent: Arc<Instance>, handle: vk::PhysicalDevice) -> Self {
        // SAFETY: handle was just enumerated from parent.
        let properties = unsafe { parent.get_raw_physical_device_properties(handle) };
        // SAFETY: handle was just enumerated from parent.
        let queue_families =
            unsafe { parent.get_raw_physical_device_queue_family_properties(handle) };
        // SAFETY: handle was just enumerated from parent.
        let memory_properties =
            unsafe { parent.get_raw_physical_device_memory_properties(handle) };
        // SAFETY: handle was just enumerated from parent.
        let extensions = unsafe { parent.enumerate_raw_device_extension_properties(handle) }
            .unwrap_or_default()
            .iter()
            .filter_map(|ext| ext.extension_name_as_c_str().ok())
            .map(|name| name.to_string_lossy().into_owned())
            .collect();

        Self {
            parent,
            handle,
            properties,
            queue_families,
            extensions,
            memory_properties,
        }
    }

    pub fn instance(&self) -> &Arc<Instance> {
        &self.parent
    }

    pub fn raw_handle(&self) -> vk::PhysicalDevice {
        self.handle
    }

    pub fn properties(&self) -> &vk::PhysicalDeviceProperties {
        &self.properties
    }

    pub fn limits(&self) -> &vk::PhysicalDeviceLimits {
        &self.properties.limits
    }

    pub fn queue_family_properties(&self) -> &[vk::QueueFamilyProperties] {
        &self.queue_families
    }

    pub fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    pub fn name(&self) -> String {
        self.properties
            .device_name_as_c_str()
            .unwrap_or(c"unknown")
            .to_string_lossy()
            .into_owned()
    }

    pub fn api_version(&self) -> u32 {
        self.properties.api_version
    }

    /// The library's compatibility predicate: an adapter is usable when it
    /// exposes at least one compute-capable queue family. Everything else the
    /// compute path needs (storage images, push constants) is core Vulkan.
    pub fn is_compatible(&self) -> bool {
        find_queue_family_index(&self.queue_families, vk::QueueFlags::COMPUTE).is_some()
    }

    /// First queue family whose capabilities contain `flags`, or `None`.
    pub fn queue_family_index(&self, flags: vk::QueueFlags) -> Option<u32> {
        find_queue_family_index(&self.queue_families, flags)
    }

    pub fn has_extension(&self, name: &str) -> bool {
        self.extensions.contains(name)
    }

    pub fn supported_extensions(&self) -> &HashSet<String> {
        &self.extensions
    }

    /// Intersect `requested` with the adapter's supported extension set,
    /// preserving the requested order. Unsupported names are silently dropped
    /// — callers inspect the device's enabled set afterwards.
    pub fn filter_available_extensions(&self, requested: &[&str]) -> Vec<String> {
        intersect_extensions(&self.extensions, requested)
    }

    /// Pick a memory type index for `type_bits` (from
    /// `vk::MemoryRequirements`) according to `flags`.
    ///
    /// Among types carrying all required bits and none of the not-wanted
    /// bits, the one matching the most optional bits wins; earlier indices
    /// break ties, matching the driver's own preference ordering.
    pub fn find_memory_type(&self, type_bits: u32, flags: &MemoryPropertyFlags) -> Option<u32> {
        select_memory_type(&self.memory_properties, type_bits, flags)
    }

    /// Open a logical device against this adapter. Called through
    /// [`Instance::create_device`], which resolves the queue family and
    /// filters the extension list first.
    pub(crate) fn create_device(
        self: &Arc<Self>,
        queue_family_index: u32,
        features: &vk::PhysicalDeviceFeatures,
        extensions: Vec<String>,
        max_queue_count: u32,
    ) -> Result<Arc<Device>, CreateDeviceError> {
        Device::new(self, queue_family_index, features, extensions, max_queue_count)
    }
}

fn find_queue_family_index(
    queue_families: &[vk::QueueFamilyProperties],
    flags: vk::QueueFlags,
) -> Option<u32> {
    queue_families
        .iter()
        .position(|family| family.queue_flags.contains(flags))
        .map(|index| index as u32)
}

fn intersect_extensions(supported: &HashSet<String>, requested: &[&str]) -> Vec<String> {
    requested
        .iter()
        .filter(|name| supported.contains(**name))
        .map(|name| (*name).to_owned())
        .collect()
}

fn select_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    flags: &MemoryPropertyFlags,
) -> Option<u32> {
    let types = &memory_properties.memory_types[..memory_properties.memory_type_count as usize];

    let mut best: Option<(u32, u32)> = None;
    for (index, memory_type) in types.iter().enumerate() {
        if type_bits & (1 << index) == 0 {
            continue;
        }
        if !memory_type.property_flags.contains(flags.required) {
            continue;
        }
        if memory_type.property_flags.intersects(flags.not_wanted) {
            continue;
        }
        if flags.heap != ANY_HEAP && memory_type.heap_index != flags.heap {
            continue;
        }

        let optional_matches = (memory_type.property_flags & flags.optional)
            .as_raw()
            .count_ones();
        let better = match best {
            Some((_, best_matches)) => optional_matches > best_matches,
            None => true,
        };
        if better {
            best = Some((index as u32, optional_matches));
        }
    }

    best.map(|(index, _)| index)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags, count: u32) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: count,
            ..Default::default()
        }
    }

    #[test]
    fn queue_family_selection_takes_first_match() {
        let families = [
            family(vk::QueueFlags::TRANSFER, 1),
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE, 4),
            family(vk::QueueFlags::COMPUTE, 2),
        ];

        assert_eq!(
            find_queue_family_index(&families, vk::QueueFlags::COMPUTE),
            Some(1)
        );
        assert_eq!(
            find_queue_family_index(&families, vk::QueueFlags::SPARSE_BINDING),
            None
        );
    }

    #[test]
    fn extension_intersection_preserves_requested_order() {
        let supported: HashSet<String> = ["VK_KHR_sampler_ycbcr_conversion", "VK_EXT_hdr_metadata"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        let filtered = intersect_extensions(
            &supported,
            &[
                "VK_EXT_hdr_metadata",
                "VK_KHR_video_queue",
                "VK_KHR_sampler_ycbcr_conversion",
            ],
        );

        assert_eq!(
            filtered,
            vec![
                "VK_EXT_hdr_metadata".to_owned(),
                "VK_KHR_sampler_ycbcr_conversion".to_owned(),
            ]
        );
    }

    fn memory_properties(
        types: &[(vk::MemoryPropertyFlags, u32)],
    ) -> vk::PhysicalDeviceMemoryProperties {
        let mut properties = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: types.len() as u32,
            ..Default::default()
        };
        for (index, &(property_flags, heap_index)) in types.iter().enumerate() {
            properties.memory_types[index] = vk::MemoryType {
                property_flags,
                heap_index,
            };
        }
        properties
    }

    #[test]
    fn memory_selection_honors_required_and_not_wanted() {
        let properties = memory_properties(&[
            (vk::MemoryPropertyFlags::HOST_VISIBLE, 1),
            (
                vk::MemoryPropertyFlags::DEVICE_LOCAL | vk::MemoryPropertyFlags::HOST_VISIBLE,
                0,
            ),
            (vk::MemoryPropertyFlags::DEVICE_LOCAL, 0),
        ]);

        let flags = MemoryPropertyFlags {
            required: vk::MemoryPropertyFlags::DEVICE_LOCAL,
            not_wanted: vk::MemoryPropertyFlags::HOST_VISIBLE,
            ..Default::default()
        };

        assert_eq!(select_memory_type(&properties, 0b111, &flags), Some(2));
    }

    #[test]
    fn memory_selection_prefers_most_optional_bits() {
        let properties = memory_properties(&[
            (vk::MemoryPropertyFlags::DEVICE_LOCAL, 0),
            (
                vk::MemoryPropertyFlags::DEVICE_LOCAL
                    | vk::MemoryPropertyFlags::HOST_VISIBLE
                    | vk::MemoryPropertyFlags::HOST_COHERENT,
                0,
            ),
        ]);

        let flags = MemoryPropertyFlags {
            required: vk::MemoryPropertyFlags::DEVICE_LOCAL,
            optional: vk::MemoryPropertyFlags::HOST_VISIBLE
                | vk::MemoryPropertyFlags::HOST_COHERENT,
            ..Default::default()
        };

        assert_eq!(select_memory_type(&properties, 0b11, &flags), Some(1));
    }

    #[test]
    fn memory_selection_respects_heap_constraint_and_type_bits() {
        let properties = memory_properties(&[
            (vk::MemoryPropertyFlags::DEVICE_LOCAL, 0),
            (vk::MemoryPropertyFlags::DEVICE_LOCAL, 1),
        ]);

        let flags = MemoryPropertyFlags {
            required: vk::MemoryPropertyFlags::DEVICE_LOCAL,
            heap: 1,
            ..Default::default()
        };

        assert_eq!(select_memory_type(&properties, 0b11, &flags), Some(1));
        // Type bits exclude the only heap-1 type.
        assert_eq!(select_memory_type(&properties, 0b01, &flags), None);
    }

    #[test]
    fn compatibility_requires_a_compute_family() {
        let compute_capable = [family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE, 1)];
        let graphics_only = [family(vk::QueueFlags::GRAPHICS, 1)];

        assert!(find_queue_family_index(&compute_capable, vk::QueueFlags::COMPUTE).is_some());
        assert!(find_queue_family_index(&graphics_only, vk::QueueFlags::COMPUTE).is_none());
    }
}

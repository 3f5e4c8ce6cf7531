use ash::vk;

/// Heap value meaning "no heap constraint" in [`MemoryPropertyFlags`].
pub const ANY_HEAP: u32 = u32::MAX;

/// A memory-selection policy consumed by allocators picking a memory type.
///
/// `required` bits must all be present on the chosen memory type, `not_wanted`
/// bits must all be absent, and among the remaining candidates the one with
/// the most `optional` bits wins. `heap` restricts the choice to a single
/// memory heap; leave it at [`ANY_HEAP`] to accept any heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryPropertyFlags {
    pub required: vk::MemoryPropertyFlags,
    pub optional: vk::MemoryPropertyFlags,
    pub not_wanted: vk::MemoryPropertyFlags,
    pub heap: u32,
}

impl Default for MemoryPropertyFlags {
    fn default() -> Self {
        Self {
            required: vk::MemoryPropertyFlags::empty(),
            optional: vk::MemoryPropertyFlags::empty(),
            not_wanted: vk::MemoryPropertyFlags::empty(),
            heap: ANY_HEAP,
        }
    }
}

impl MemoryPropertyFlags {
    pub fn new(
        required: vk::MemoryPropertyFlags,
        optional: vk::MemoryPropertyFlags,
        not_wanted: vk::MemoryPropertyFlags,
    ) -> Self {
        Self {
            required,
            optional,
            not_wanted,
            heap: ANY_HEAP,
        }
    }
}

impl From<vk::MemoryPropertyFlags> for MemoryPropertyFlags {
    fn from(required: vk::MemoryPropertyFlags) -> Self {
        Self {
            required,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn required_only_leaves_rest_unset() {
        let flags = MemoryPropertyFlags::from(vk::MemoryPropertyFlags::DEVICE_LOCAL);

        assert_eq!(flags.required, vk::MemoryPropertyFlags::DEVICE_LOCAL);
        assert_eq!(flags.optional, vk::MemoryPropertyFlags::empty());
        assert_eq!(flags.not_wanted, vk::MemoryPropertyFlags::empty());
        assert_eq!(flags.heap, ANY_HEAP);
    }

    #[test]
    fn default_accepts_any_heap() {
        let flags = MemoryPropertyFlags::default();

        assert_eq!(flags.heap, ANY_HEAP);
        assert_eq!(flags.required, vk::MemoryPropertyFlags::empty());
    }
}

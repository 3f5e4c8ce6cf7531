//! `mvk` — Vulkan object-lifetime and compute-pipeline layer for media
//! processing hosts.
//!
//! The crate owns the driver object hierarchy (instance → physical device →
//! logical device → queue) and a compute pipeline abstraction that records
//! dispatch work into command buffers. Children hold strong references to
//! their parents; parents hold weak references to lazily-created children,
//! so no reference cycles exist and destruction order is always
//! child-before-parent.
//!
//! Naming conventions:
//! - `raw_*` accessors return the Vulkan handle type from `ash::vk`.
//! - Unsafe wrappers around raw driver calls live on the owning parent
//!   object (`create_raw_*`, `destroy_raw_*`, `cmd_*`).

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(clippy::undocumented_unsafe_blocks)]

pub mod command;
pub mod device;
pub mod instance;
pub mod memory;
pub mod physical_device;
pub mod pipeline;
pub mod queue;
pub mod shader;

pub use ash;

//! # Terra Engine
//!
//! Resource-lifetime and frame-synchronization core of a Vulkan renderer.
//!
//! ## Features
//!
//! - **Object Lifecycle**: priority-ordered ownership and teardown of engine singletons
//! - **Queue Resolution**: graphics/transfer/compute role assignment over queue families
//! - **Memory Sub-allocation**: per-class memory blocks with aligned per-frame resource views
//! - **Frame Synchronization**: rotating fence/semaphore/command-buffer rings per queue
//! - **Presentation**: swapchain, render pass and framebuffer management
//! - **Descriptors**: per-frame descriptor sets bound to resource view slots
//! - **Vertex Data**: classic and primitive-cluster vertex managers fed through staging
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use terra_engine::prelude::*;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut terra = Terra::new(RendererConfig::default());
//!     let target = SurfaceTarget::Headless;
//!
//!     terra.init_instance(Some(&target))?;
//!     terra.init_surface(&target)?;
//!     terra.init_device()?;
//!     terra.init_sync_objects()?;
//!     terra.init_swapchain(terra.config().extent())?;
//!
//!     terra.shutdown()?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions, clippy::similar_names, clippy::too_many_arguments)]

pub mod config;
pub mod foundation;
pub mod lifecycle;
pub mod vulkan;

mod engine;

#[cfg(test)]
mod testing;

pub use engine::{priority, slots, Terra};

/// Engine name reported to the Vulkan driver
pub const ENGINE_NAME: &std::ffi::CStr =
    unsafe { std::ffi::CStr::from_bytes_with_nul_unchecked(b"Terra\0") };

/// Common imports for engine users
pub mod prelude {
    pub use crate::{
        config::{Config, ConfigError, EngineConfig, RendererConfig, SurfaceExtent},
        engine::{priority, slots, Terra},
        lifecycle::{ObjectManager, ObjectManagerError, Priority, Slot},
        vulkan::{
            BufferAlignments, ClusterVertexManager, DescriptorInfo, DescriptorSetManager,
            LogicalDevice, MemoryAllocator, MemoryClass, QueueHandle, QueueRole,
            ResourceState, ResourceView, SurfaceTarget, SwapchainManager, SyncObjects,
            UploadContainer, VertexManager, VulkanError, VulkanResult,
        },
    };
}

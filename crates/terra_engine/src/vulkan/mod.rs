//! Vulkan backend implementation
//!
//! Organized into initialization, memory, state and resources modules.

/// Vulkan initialization types (instance, debug layer, surface, queues, device)
pub mod initialization;

/// Device memory blocks, sub-allocation and the upload path
pub mod memory;

/// Vulkan state management (frame synchronization, swapchain, render pass)
pub mod state;

/// Vulkan resource management (descriptors, vertex data, shaders)
pub mod resources;

// Re-export core initialization types
pub use initialization::context::{VulkanError, VulkanInstance, VulkanResult};
pub use initialization::debug_layer::{select_debug_layer, DebugLayer, NoDebugLayer, ValidationLayer};
pub use initialization::device::{LogicalDevice, PhysicalDeviceInfo, QueueHandle};
pub use initialization::queue_family::{
    resolve_queue_indices, QueueAssignment, QueueFamilyCaps, QueueRole, QueueSlot,
};
pub use initialization::surface::{Surface, SurfaceTarget};

// Re-export memory types
pub use memory::alignment::{align_up, BufferAlignments, SubAllocationLayout};
pub use memory::allocator::{find_memory_type, BlockKey, MemoryAllocator};
pub use memory::block::{MemoryBlock, MemoryClass};
pub use memory::resource_view::{Placement, ResourceState, ResourceView};
pub use memory::upload::{UploadBatch, UploadContainer, UploadRegion};

// Re-export state types
pub use state::render_pass::RenderPass;
pub use state::swapchain::SwapchainManager;
pub use state::sync::{begin_front, submit_front, Fence, FrameRing, Semaphore, SyncObjects};

// Re-export resource types
pub use resources::descriptor_set::{DescriptorInfo, DescriptorSetManager};
pub use resources::shader::{parse_spirv, ShaderModule};
pub use resources::vertex_manager::{ClusterVertexManager, VertexManager};

// Vulkan initialization components

pub mod context;
pub mod debug_layer;
pub mod device;
pub mod queue_family;
pub mod surface;

//! Vulkan state management
//!
//! Frame synchronization rings, the swapchain and the render pass its
//! framebuffers are realized against.

pub mod render_pass;
pub mod swapchain;
pub mod sync;

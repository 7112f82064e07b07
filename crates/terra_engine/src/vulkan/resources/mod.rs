//! Shader-visible resources: descriptor sets, shader modules and vertex data

pub mod descriptor_set;
pub mod shader;
pub mod vertex_manager;

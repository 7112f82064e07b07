//! SPIR-V shader modules
//!
//! Compiled blobs only. Nothing here compiles or reflects shaders.

use std::fs;
use std::io::Cursor;
use std::path::Path;

use ash::{vk, Device};

use crate::foundation::logging::{debug, error};
use crate::vulkan::{VulkanError, VulkanResult};

/// Decode a SPIR-V blob into words
///
/// The blob must be a whole number of words starting with the SPIR-V magic
/// number; big-endian blobs are swapped to host order.
pub fn parse_spirv(bytes: &[u8]) -> VulkanResult<Vec<u32>> {
    ash::util::read_spv(&mut Cursor::new(bytes))
        .map_err(|e| VulkanError::InitializationFailed(format!("invalid SPIR-V blob: {e}")))
}

/// Owned `vk::ShaderModule`
pub struct ShaderModule {
    device: Device,
    module: vk::ShaderModule,
}

impl ShaderModule {
    /// Create a module from SPIR-V bytes
    pub fn from_bytes(device: &Device, bytes: &[u8]) -> VulkanResult<Self> {
        let words = parse_spirv(bytes)?;
        let create_info = vk::ShaderModuleCreateInfo::builder().code(&words);
        let module = unsafe { device.create_shader_module(&create_info, None) }.map_err(|e| {
            error!("vkCreateShaderModule failed: {:?}", e);
            VulkanError::from(e)
        })?;

        debug!("Created shader module {:?} ({} words)", module, words.len());
        Ok(Self {
            device: device.clone(),
            module,
        })
    }

    /// Load a module from a compiled `.spv` file
    pub fn from_file<P: AsRef<Path>>(device: &Device, path: P) -> VulkanResult<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(|e| {
            VulkanError::InitializationFailed(format!("failed to read shader {}: {e}", path.display()))
        })?;
        Self::from_bytes(device, &bytes)
    }

    /// Raw module handle
    pub const fn handle(&self) -> vk::ShaderModule {
        self.module
    }

    /// Stage info for `entry_point` of this module
    pub fn stage_info(&self, stage: vk::ShaderStageFlags, entry_point: &std::ffi::CStr) -> vk::PipelineShaderStageCreateInfo {
        vk::PipelineShaderStageCreateInfo::builder()
            .stage(stage)
            .module(self.module)
            .name(entry_point)
            .build()
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        debug!("Destroying shader module {:?}", self.module);
        unsafe {
            self.device.destroy_shader_module(self.module, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPIRV_MAGIC: u32 = 0x0723_0203;

    fn blob(words: &[u32]) -> Vec<u8> {
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    #[test]
    fn test_parse_accepts_magic() {
        let words = parse_spirv(&blob(&[SPIRV_MAGIC, 0x0001_0000, 0, 1, 0])).unwrap();
        assert_eq!(words.len(), 5);
        assert_eq!(words[0], SPIRV_MAGIC);
    }

    #[test]
    fn test_parse_swaps_big_endian_blob() {
        let swapped: Vec<u32> = [SPIRV_MAGIC, 0x0001_0000].iter().map(|w| w.swap_bytes()).collect();
        let words = parse_spirv(&blob(&swapped)).unwrap();
        assert_eq!(words, vec![SPIRV_MAGIC, 0x0001_0000]);
    }

    #[test]
    fn test_parse_rejects_bad_blobs() {
        assert!(parse_spirv(&[]).is_err());
        assert!(parse_spirv(&[0x03, 0x02, 0x23]).is_err());
        assert!(parse_spirv(&blob(&[0xDEAD_BEEF, 0])).is_err());
    }

    #[test]
    fn test_missing_file_is_reported() {
        let Some(terra) = crate::testing::headless_terra(1, false) else {
            return;
        };
        let device = terra.device().unwrap().raw();
        let err = ShaderModule::from_file(device, "does/not/exist.spv").err().unwrap();
        assert!(matches!(err, VulkanError::InitializationFailed(_)));
    }
}

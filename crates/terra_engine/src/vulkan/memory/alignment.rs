//! Alignment rules and per-frame sub-allocation layout

use ash::vk;

use crate::vulkan::{VulkanError, VulkanResult};

/// Minimum alignment for buffers without a device-reported rule
const BASE_ALIGNMENT: u64 = 4;

/// Round `value` up to a multiple of `alignment`
///
/// Alignments of 0 and 1 leave the value unchanged.
pub const fn align_up(value: u64, alignment: u64) -> u64 {
    if alignment <= 1 {
        return value;
    }
    value.div_ceil(alignment) * alignment
}

/// Device minimum offset alignments per buffer usage class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferAlignments {
    /// `minUniformBufferOffsetAlignment`
    pub uniform: u64,
    /// `minStorageBufferOffsetAlignment`
    pub storage: u64,
    /// `minTexelBufferOffsetAlignment`
    pub texel: u64,
}

impl BufferAlignments {
    /// Capture the alignment rules from device limits
    pub const fn from_limits(limits: &vk::PhysicalDeviceLimits) -> Self {
        Self {
            uniform: limits.min_uniform_buffer_offset_alignment,
            storage: limits.min_storage_buffer_offset_alignment,
            texel: limits.min_texel_buffer_offset_alignment,
        }
    }

    /// Strictest alignment that applies to a buffer with `usage`
    pub fn for_usage(&self, usage: vk::BufferUsageFlags) -> u64 {
        let mut alignment = BASE_ALIGNMENT;
        if usage.contains(vk::BufferUsageFlags::UNIFORM_BUFFER) {
            alignment = alignment.max(self.uniform);
        }
        if usage.contains(vk::BufferUsageFlags::STORAGE_BUFFER) {
            alignment = alignment.max(self.storage);
        }
        if usage.intersects(
            vk::BufferUsageFlags::UNIFORM_TEXEL_BUFFER | vk::BufferUsageFlags::STORAGE_TEXEL_BUFFER,
        ) {
            alignment = alignment.max(self.texel);
        }
        alignment
    }
}

/// Placement of `frame_count` equally sized slots inside one buffer
///
/// Every slot but the last is padded to `stride`; the buffer ends right after
/// the last slot's element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubAllocationLayout {
    element_size: u64,
    frame_count: u32,
    stride: u64,
}

impl SubAllocationLayout {
    /// Compute the layout for `frame_count` slots of `element_size` bytes
    pub fn new(element_size: u64, frame_count: u32, alignment: u64) -> VulkanResult<Self> {
        if element_size == 0 {
            return Err(VulkanError::invalid("resource element size must be non-zero"));
        }
        if frame_count == 0 {
            return Err(VulkanError::invalid("resource frame count must be non-zero"));
        }
        Ok(Self {
            element_size,
            frame_count,
            stride: align_up(element_size, alignment),
        })
    }

    /// Logical element size
    pub const fn element_size(&self) -> u64 {
        self.element_size
    }

    /// Number of slots
    pub const fn frame_count(&self) -> u32 {
        self.frame_count
    }

    /// Aligned distance between slots
    pub const fn stride(&self) -> u64 {
        self.stride
    }

    /// Total buffer size: `stride * (frame_count - 1) + element_size`
    pub const fn total_size(&self) -> u64 {
        self.stride * (self.frame_count as u64 - 1) + self.element_size
    }

    /// Byte offset of `slot`
    pub const fn offset(&self, slot: u32) -> u64 {
        self.stride * slot as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 256), 0);
        assert_eq!(align_up(1, 256), 256);
        assert_eq!(align_up(256, 256), 256);
        assert_eq!(align_up(257, 256), 512);
        assert_eq!(align_up(13, 0), 13);
        assert_eq!(align_up(13, 1), 13);
        assert_eq!(align_up(10, 12), 12);
    }

    #[test]
    fn test_layout_already_aligned() {
        let layout = SubAllocationLayout::new(128, 2, 64).unwrap();
        assert_eq!(layout.stride(), 128);
        assert_eq!(layout.total_size(), 256);
        assert_eq!(layout.offset(0), 0);
        assert_eq!(layout.offset(1), 128);
    }

    #[test]
    fn test_last_slot_is_not_padded() {
        let layout = SubAllocationLayout::new(100, 3, 256).unwrap();
        assert_eq!(layout.stride(), 256);
        assert_eq!(layout.total_size(), 256 * 2 + 100);
        assert_eq!(layout.offset(2), 512);

        let single = SubAllocationLayout::new(100, 1, 256).unwrap();
        assert_eq!(single.total_size(), 100);
    }

    #[test]
    fn test_layout_formula_holds() {
        for element_size in [1_u64, 4, 63, 64, 65, 200, 1024] {
            for alignment in [1_u64, 4, 16, 64, 256] {
                for frame_count in 1_u32..=4 {
                    let layout = SubAllocationLayout::new(element_size, frame_count, alignment).unwrap();
                    let stride = align_up(element_size, alignment);
                    assert_eq!(layout.stride(), stride);
                    assert_eq!(
                        layout.total_size(),
                        stride * u64::from(frame_count - 1) + element_size
                    );
                    assert_eq!(layout.offset(frame_count - 1), stride * u64::from(frame_count - 1));
                }
            }
        }
    }

    #[test]
    fn test_zero_sizes_rejected() {
        assert!(SubAllocationLayout::new(0, 2, 4).is_err());
        assert!(SubAllocationLayout::new(16, 0, 4).is_err());
    }

    #[test]
    fn test_alignment_for_usage() {
        let alignments = BufferAlignments {
            uniform: 256,
            storage: 64,
            texel: 16,
        };
        assert_eq!(alignments.for_usage(vk::BufferUsageFlags::UNIFORM_BUFFER), 256);
        assert_eq!(alignments.for_usage(vk::BufferUsageFlags::STORAGE_BUFFER), 64);
        assert_eq!(
            alignments.for_usage(vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::UNIFORM_BUFFER),
            256
        );
        assert_eq!(alignments.for_usage(vk::BufferUsageFlags::UNIFORM_TEXEL_BUFFER), 16);
        assert_eq!(alignments.for_usage(vk::BufferUsageFlags::VERTEX_BUFFER), BASE_ALIGNMENT);
    }
}

//! Memory blocks
//!
//! A block accumulates claims while pending and becomes one real device
//! allocation exactly once.

use ash::vk;
use std::ptr::NonNull;

use super::alignment::align_up;
use crate::vulkan::{VulkanError, VulkanResult};

/// Memory type class a block is allocated from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryClass {
    /// Device-local, not host visible
    GpuOnly,
    /// Host-writable memory read by the GPU every frame
    CpuWritable,
    /// Host-visible staging memory for transfers
    Upload,
}

impl MemoryClass {
    /// Flags a memory type must have
    pub fn required_flags(self) -> vk::MemoryPropertyFlags {
        match self {
            Self::GpuOnly => vk::MemoryPropertyFlags::DEVICE_LOCAL,
            Self::CpuWritable | Self::Upload => {
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
            }
        }
    }

    /// Flags tried first
    pub fn preferred_flags(self) -> vk::MemoryPropertyFlags {
        match self {
            Self::CpuWritable => self.required_flags() | vk::MemoryPropertyFlags::DEVICE_LOCAL,
            Self::GpuOnly | Self::Upload => self.required_flags(),
        }
    }

    /// Whether blocks of this class are mapped for host writes
    pub const fn is_host_visible(self) -> bool {
        matches!(self, Self::CpuWritable | Self::Upload)
    }
}

/// One device allocation shared by several resource views
#[derive(Debug)]
pub struct MemoryBlock {
    class: MemoryClass,
    size: u64,
    alignment: u64,
    type_bits: u32,
    claims: u32,
    allocated: bool,
    memory: vk::DeviceMemory,
    memory_type: Option<u32>,
    mapped: Option<NonNull<u8>>,
}

impl MemoryBlock {
    /// Create an empty pending block
    pub const fn new(class: MemoryClass) -> Self {
        Self {
            class,
            size: 0,
            alignment: 1,
            type_bits: u32::MAX,
            claims: 0,
            allocated: false,
            memory: vk::DeviceMemory::null(),
            memory_type: None,
            mapped: None,
        }
    }

    /// Reserve a range satisfying `requirements`, returning its offset
    pub fn claim(&mut self, requirements: &vk::MemoryRequirements) -> VulkanResult<u64> {
        if self.allocated {
            return Err(VulkanError::invalid("cannot claim from an allocated memory block"));
        }

        let type_bits = self.type_bits & requirements.memory_type_bits;
        if type_bits == 0 {
            return Err(VulkanError::NoSuitableMemoryType);
        }

        let offset = align_up(self.size, requirements.alignment);
        self.size = offset + requirements.size;
        self.alignment = self.alignment.max(requirements.alignment);
        self.type_bits = type_bits;
        self.claims += 1;
        Ok(offset)
    }

    /// Record the real allocation backing this block
    ///
    /// A block is backed exactly once; a second call is misuse.
    pub fn mark_allocated(
        &mut self,
        memory: vk::DeviceMemory,
        memory_type: Option<u32>,
        mapped: Option<NonNull<u8>>,
    ) -> VulkanResult<()> {
        if self.allocated {
            return Err(VulkanError::invalid("memory block is already allocated"));
        }
        self.allocated = true;
        self.memory = memory;
        self.memory_type = memory_type;
        self.mapped = mapped;
        Ok(())
    }

    /// Copy `bytes` into the mapped block at `offset`
    pub fn write(&mut self, offset: u64, bytes: &[u8]) -> VulkanResult<()> {
        let Some(mapped) = self.mapped else {
            return Err(VulkanError::invalid("memory block is not host mapped"));
        };
        let end = offset
            .checked_add(bytes.len() as u64)
            .ok_or_else(|| VulkanError::invalid("write range overflows"))?;
        if end > self.size {
            return Err(VulkanError::invalid(format!(
                "write of {} bytes at {} exceeds block size {}",
                bytes.len(),
                offset,
                self.size
            )));
        }

        let offset = usize::try_from(offset).map_err(|_| VulkanError::invalid("write offset exceeds address space"))?;
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), mapped.as_ptr().add(offset), bytes.len());
        }
        Ok(())
    }

    /// Memory class
    pub const fn class(&self) -> MemoryClass {
        self.class
    }

    /// Bytes covered by every claim
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Strictest alignment among claims
    pub const fn alignment(&self) -> u64 {
        self.alignment
    }

    /// Memory types acceptable to every claim
    pub const fn type_bits(&self) -> u32 {
        self.type_bits
    }

    /// Number of claims placed
    pub const fn claim_count(&self) -> u32 {
        self.claims
    }

    /// Whether the block has been backed
    pub const fn is_allocated(&self) -> bool {
        self.allocated
    }

    /// Backing memory, null until allocated (and for empty blocks)
    pub const fn memory(&self) -> vk::DeviceMemory {
        self.memory
    }

    /// Memory type index chosen at allocation
    pub const fn memory_type(&self) -> Option<u32> {
        self.memory_type
    }

    /// Whether the block is persistently mapped
    pub const fn is_mapped(&self) -> bool {
        self.mapped.is_some()
    }

    pub(crate) fn take_mapping(&mut self) -> (vk::DeviceMemory, bool) {
        let mapped = self.mapped.take().is_some();
        let memory = std::mem::replace(&mut self.memory, vk::DeviceMemory::null());
        (memory, mapped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn requirements(size: u64, alignment: u64, memory_type_bits: u32) -> vk::MemoryRequirements {
        vk::MemoryRequirements {
            size,
            alignment,
            memory_type_bits,
        }
    }

    #[test]
    fn test_claims_are_aligned_and_packed() {
        let mut block = MemoryBlock::new(MemoryClass::GpuOnly);

        assert_eq!(block.claim(&requirements(100, 64, 0b111)).unwrap(), 0);
        assert_eq!(block.claim(&requirements(10, 256, 0b110)).unwrap(), 256);
        assert_eq!(block.claim(&requirements(4, 4, 0b010)).unwrap(), 268);

        assert_eq!(block.size(), 272);
        assert_eq!(block.alignment(), 256);
        assert_eq!(block.type_bits(), 0b010);
        assert_eq!(block.claim_count(), 3);
    }

    #[test]
    fn test_incompatible_memory_types() {
        let mut block = MemoryBlock::new(MemoryClass::CpuWritable);
        block.claim(&requirements(16, 16, 0b01)).unwrap();
        assert!(matches!(
            block.claim(&requirements(16, 16, 0b10)),
            Err(VulkanError::NoSuitableMemoryType)
        ));
        assert_eq!(block.claim_count(), 1);
    }

    #[test]
    fn test_allocate_once() {
        let mut block = MemoryBlock::new(MemoryClass::GpuOnly);
        block.claim(&requirements(64, 64, 1)).unwrap();

        block.mark_allocated(vk::DeviceMemory::null(), Some(0), None).unwrap();
        assert!(block.is_allocated());
        assert!(matches!(
            block.mark_allocated(vk::DeviceMemory::null(), Some(0), None),
            Err(VulkanError::InvalidOperation { .. })
        ));
        assert!(matches!(
            block.claim(&requirements(64, 64, 1)),
            Err(VulkanError::InvalidOperation { .. })
        ));
    }

    #[test]
    fn test_write_into_mapped_block() {
        let mut backing = vec![0_u8; 32];
        let mut block = MemoryBlock::new(MemoryClass::CpuWritable);
        block.claim(&requirements(32, 4, 1)).unwrap();
        block
            .mark_allocated(vk::DeviceMemory::null(), Some(0), NonNull::new(backing.as_mut_ptr()))
            .unwrap();

        block.write(8, &[1, 2, 3, 4]).unwrap();
        assert!(block.write(30, &[0; 4]).is_err());
        assert_eq!(&backing[8..12], &[1, 2, 3, 4]);
    }

    #[test]
    fn test_unmapped_write_rejected() {
        let mut block = MemoryBlock::new(MemoryClass::GpuOnly);
        block.claim(&requirements(16, 4, 1)).unwrap();
        block.mark_allocated(vk::DeviceMemory::null(), Some(0), None).unwrap();
        assert!(matches!(block.write(0, &[1]), Err(VulkanError::InvalidOperation { .. })));
    }

    #[test]
    fn test_class_flags() {
        assert!(MemoryClass::CpuWritable
            .preferred_flags()
            .contains(MemoryClass::CpuWritable.required_flags()));
        assert!(!MemoryClass::GpuOnly.is_host_visible());
        assert!(MemoryClass::Upload.is_host_visible());
    }
}

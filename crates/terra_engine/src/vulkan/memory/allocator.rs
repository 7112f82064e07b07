//! # Memory Allocator
//!
//! Owns every [`MemoryBlock`]. Resource views never hold a block, only the
//! [`BlockKey`] they were placed in, and are torn down before the allocator.
//!
//! Bring-up follows a fixed order:
//!
//! 1. [`set_buffer_alignments`](MemoryAllocator::set_buffer_alignments) once
//! 2. resource views are created and claim ranges per [`MemoryClass`]
//! 3. [`allocate_memory`](MemoryAllocator::allocate_memory) backs each pending block
//! 4. views bind to their ranges

use ash::vk;
use slotmap::SlotMap;
use std::collections::HashMap;
use std::ptr::NonNull;

use super::alignment::BufferAlignments;
use super::block::{MemoryBlock, MemoryClass};
use super::resource_view::Placement;
use crate::foundation::logging::{debug, warn};
use crate::vulkan::{VulkanError, VulkanResult};

slotmap::new_key_type! {
    /// Handle to a block owned by the allocator
    pub struct BlockKey;
}

/// Pick a memory type index allowed by `type_bits`
///
/// Types carrying `preferred` are tried first, then anything with `required`.
pub fn find_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    required: vk::MemoryPropertyFlags,
    preferred: vk::MemoryPropertyFlags,
) -> Option<u32> {
    let matching = |flags: vk::MemoryPropertyFlags| {
        (0..memory_properties.memory_type_count).find(|&i| {
            (type_bits & (1 << i)) != 0
                && memory_properties.memory_types[i as usize]
                    .property_flags
                    .contains(flags)
        })
    };
    matching(required | preferred).or_else(|| matching(required))
}

/// Device memory sub-allocator
pub struct MemoryAllocator {
    device: ash::Device,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    alignments: Option<BufferAlignments>,
    epoch: u64,
    views_created: u64,
    blocks: SlotMap<BlockKey, MemoryBlock>,
    pending: HashMap<MemoryClass, BlockKey>,
    allocated: HashMap<MemoryClass, BlockKey>,
}

impl MemoryAllocator {
    /// Create an allocator with no alignment rules captured yet
    pub fn new(device: ash::Device, memory_properties: vk::PhysicalDeviceMemoryProperties) -> Self {
        Self {
            device,
            memory_properties,
            alignments: None,
            epoch: 0,
            views_created: 0,
            blocks: SlotMap::with_key(),
            pending: HashMap::new(),
            allocated: HashMap::new(),
        }
    }

    /// Capture the device's buffer alignment rules
    ///
    /// Must happen before any resource view is created. Calling it afterwards
    /// invalidates every existing view: their placement and binding fail.
    pub fn set_buffer_alignments(&mut self, alignments: BufferAlignments) {
        if self.views_created > 0 {
            self.epoch += 1;
            warn!(
                "Buffer alignments changed after {} resource views were created; those views are now stale",
                self.views_created
            );
        }
        self.alignments = Some(alignments);
    }

    /// Captured alignment rules
    pub const fn buffer_alignments(&self) -> Option<BufferAlignments> {
        self.alignments
    }

    /// Current alignment epoch
    pub const fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Record a new resource view, returning its alignment and epoch
    pub(crate) fn register_resource(&mut self, usage: vk::BufferUsageFlags) -> VulkanResult<(u64, u64)> {
        let alignments = self
            .alignments
            .ok_or_else(|| VulkanError::invalid("buffer alignments must be set before creating resources"))?;
        self.views_created += 1;
        Ok((alignments.for_usage(usage), self.epoch))
    }

    pub(crate) fn check_epoch(&self, epoch: u64) -> VulkanResult<()> {
        if epoch == self.epoch {
            Ok(())
        } else {
            Err(VulkanError::invalid(
                "resource was created under buffer alignments that have since changed",
            ))
        }
    }

    /// Claim a range in the pending block of `class`
    pub fn claim(
        &mut self,
        class: MemoryClass,
        requirements: &vk::MemoryRequirements,
        epoch: u64,
    ) -> VulkanResult<Placement> {
        self.check_epoch(epoch)?;

        let key = match self.pending.get(&class) {
            Some(&key) => key,
            None => {
                let key = self.blocks.insert(MemoryBlock::new(class));
                self.pending.insert(class, key);
                key
            }
        };
        let block = self
            .blocks
            .get_mut(key)
            .ok_or_else(|| VulkanError::invalid("pending memory block no longer exists"))?;
        let offset = block.claim(requirements)?;

        Ok(Placement { block: key, offset, class })
    }

    /// Back the pending block of `class` with one real allocation
    ///
    /// With nothing claimed, an empty block is recorded as allocated with size
    /// zero and no driver call is made. Calling it again before a new claim has
    /// been placed in `class` is misuse.
    pub fn allocate_memory(&mut self, class: MemoryClass) -> VulkanResult<BlockKey> {
        let key = match self.pending.get(&class) {
            Some(&key) => key,
            None => {
                if let Some(&previous) = self.allocated.get(&class) {
                    return Err(VulkanError::invalid(format!(
                        "{class:?} memory was already allocated (block {previous:?}) and nothing was claimed since"
                    )));
                }
                self.blocks.insert(MemoryBlock::new(class))
            }
        };
        self.allocate_block(key)?;
        Ok(key)
    }

    /// Back every pending block
    pub fn allocate_all(&mut self) -> VulkanResult<Vec<BlockKey>> {
        let mut pending: Vec<_> = self.pending.values().copied().collect();
        pending.sort();
        for &key in &pending {
            self.allocate_block(key)?;
        }
        Ok(pending)
    }

    /// Back a specific block; a block allocates exactly once
    pub fn allocate_block(&mut self, key: BlockKey) -> VulkanResult<()> {
        let block = self
            .blocks
            .get(key)
            .ok_or_else(|| VulkanError::invalid("unknown memory block"))?;
        if block.is_allocated() {
            return Err(VulkanError::invalid("memory block is already allocated"));
        }
        let class = block.class();
        let size = block.size();
        let type_bits = block.type_bits();

        if block.claim_count() == 0 {
            self.release_pending(class, key);
            self.allocated.insert(class, key);
            debug!("Memory block {:?} ({:?}) has no claims; recorded as zero-sized", key, class);
            return self.block_mut(key)?.mark_allocated(vk::DeviceMemory::null(), None, None);
        }

        let memory_type = find_memory_type(
            &self.memory_properties,
            type_bits,
            class.required_flags(),
            class.preferred_flags(),
        )
        .ok_or_else(|| VulkanError::missing(format!("memory type for {class:?} blocks")))?;

        let allocate_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(size)
            .memory_type_index(memory_type);
        let memory = unsafe { self.device.allocate_memory(&allocate_info, None) }.map_err(|e| match e {
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
                VulkanError::OutOfMemory { requested: size }
            }
            other => VulkanError::from(other),
        })?;

        let mapped = if class.is_host_visible() {
            let pointer = unsafe {
                self.device
                    .map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
            };
            match pointer {
                Ok(pointer) => NonNull::new(pointer.cast::<u8>()),
                Err(e) => {
                    unsafe { self.device.free_memory(memory, None) };
                    return Err(VulkanError::from(e));
                }
            }
        } else {
            None
        };

        self.release_pending(class, key);
        self.allocated.insert(class, key);
        debug!(
            "Allocated {} bytes of {:?} memory (type {}) for block {:?}",
            size, class, memory_type, key
        );
        self.block_mut(key)?.mark_allocated(memory, Some(memory_type), mapped)
    }

    /// Block owned by this allocator
    pub fn block(&self, key: BlockKey) -> Option<&MemoryBlock> {
        self.blocks.get(key)
    }

    /// Most recently allocated block of `class`
    pub fn allocated_block(&self, class: MemoryClass) -> Option<BlockKey> {
        self.allocated.get(&class).copied()
    }

    /// Pending (not yet backed) block for `class`
    pub fn pending_block(&self, class: MemoryClass) -> Option<BlockKey> {
        self.pending.get(&class).copied()
    }

    /// Number of blocks owned
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Write host data into a mapped block
    pub fn write(&mut self, key: BlockKey, offset: u64, bytes: &[u8]) -> VulkanResult<()> {
        self.block_mut(key)?.write(offset, bytes)
    }

    /// Device the allocator allocates from
    pub const fn device(&self) -> &ash::Device {
        &self.device
    }

    /// Memory heaps and types of the device
    pub const fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    fn block_mut(&mut self, key: BlockKey) -> VulkanResult<&mut MemoryBlock> {
        self.blocks
            .get_mut(key)
            .ok_or_else(|| VulkanError::invalid("unknown memory block"))
    }

    fn release_pending(&mut self, class: MemoryClass, key: BlockKey) {
        if self.pending.get(&class) == Some(&key) {
            self.pending.remove(&class);
        }
    }
}

impl Drop for MemoryAllocator {
    fn drop(&mut self) {
        for (key, block) in &mut self.blocks {
            let (memory, mapped) = block.take_mapping();
            if memory == vk::DeviceMemory::null() {
                continue;
            }
            debug!("Freeing memory block {:?} ({} bytes)", key, block.size());
            unsafe {
                if mapped {
                    self.device.unmap_memory(memory);
                }
                self.device.free_memory(memory, None);
            }
        }
    }
}

//! # Resource Views
//!
//! A resource view is one buffer split into `frame_count` equally strided
//! slots, one per frame in flight. Creation and memory binding are separate
//! stages:
//!
//! ```text
//! Empty --create_resource--> Created --set_memory_offset_and_type--> Placed
//!       --(block allocated)-- bind_resource_to_memory --> Bound
//! ```
//!
//! Calling a stage out of order is reported as `InvalidOperation`. Until the
//! view is bound, [`ResourceView::resource`] returns `vk::Buffer::null()`.

use ash::vk;

use super::alignment::SubAllocationLayout;
use super::allocator::{BlockKey, MemoryAllocator};
use super::block::MemoryClass;
use crate::foundation::logging::debug;
use crate::vulkan::initialization::queue_family::resolve_queue_indices;
use crate::vulkan::{VulkanError, VulkanResult};

/// Lifecycle stage of a resource view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceState {
    /// Nothing created
    Empty,
    /// Buffer handle exists, no memory claimed
    Created,
    /// Range claimed in a pending block
    Placed,
    /// Buffer bound to backing memory
    Bound,
}

/// Where a view lives inside the allocator's blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    /// Owning block
    pub block: BlockKey,
    /// Byte offset inside the block
    pub offset: u64,
    /// Memory class of the block
    pub class: MemoryClass,
}

/// Buffer handle plus a ring of per-frame sub-allocations
pub struct ResourceView {
    device: Option<ash::Device>,
    buffer: vk::Buffer,
    layout: Option<SubAllocationLayout>,
    usage: vk::BufferUsageFlags,
    sharing_mode: vk::SharingMode,
    queue_families: Vec<u32>,
    requirements: vk::MemoryRequirements,
    epoch: u64,
    placement: Option<Placement>,
    state: ResourceState,
}

impl Default for ResourceView {
    fn default() -> Self {
        Self {
            device: None,
            buffer: vk::Buffer::null(),
            layout: None,
            usage: vk::BufferUsageFlags::empty(),
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            queue_families: Vec::new(),
            requirements: vk::MemoryRequirements::default(),
            epoch: 0,
            placement: None,
            state: ResourceState::Empty,
        }
    }
}

impl ResourceView {
    /// Create an empty view
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the buffer handle for `frame_count` slots of `element_size` bytes
    ///
    /// The slot stride comes from the allocator's captured alignment for
    /// `usage`. With more than one distinct queue family the buffer is shared
    /// concurrently.
    pub fn create_resource(
        &mut self,
        allocator: &mut MemoryAllocator,
        element_size: u64,
        frame_count: u32,
        usage: vk::BufferUsageFlags,
        queue_families: &[u32],
    ) -> VulkanResult<()> {
        self.expect_state(ResourceState::Empty, "create_resource")?;

        let (alignment, epoch) = allocator.register_resource(usage)?;
        let layout = SubAllocationLayout::new(element_size, frame_count, alignment)?;

        let families = resolve_queue_indices(queue_families);
        let sharing_mode = if families.len() > 1 {
            vk::SharingMode::CONCURRENT
        } else {
            vk::SharingMode::EXCLUSIVE
        };

        let mut create_info = vk::BufferCreateInfo::builder()
            .size(layout.total_size())
            .usage(usage)
            .sharing_mode(sharing_mode);
        if sharing_mode == vk::SharingMode::CONCURRENT {
            create_info = create_info.queue_family_indices(&families);
        }

        let device = allocator.device().clone();
        let buffer = unsafe { device.create_buffer(&create_info, None) }.map_err(VulkanError::from)?;
        let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };

        debug!(
            "Created resource buffer {:?}: {} x {} bytes (stride {}, total {})",
            buffer,
            frame_count,
            element_size,
            layout.stride(),
            layout.total_size()
        );

        self.device = Some(device);
        self.buffer = buffer;
        self.layout = Some(layout);
        self.usage = usage;
        self.sharing_mode = sharing_mode;
        self.queue_families = families;
        self.requirements = requirements;
        self.epoch = epoch;
        self.state = ResourceState::Created;
        Ok(())
    }

    /// Claim this view's range in the pending block of `class`
    ///
    /// Logical only; nothing is bound until the block is allocated.
    pub fn set_memory_offset_and_type(
        &mut self,
        allocator: &mut MemoryAllocator,
        class: MemoryClass,
    ) -> VulkanResult<()> {
        self.expect_state(ResourceState::Created, "set_memory_offset_and_type")?;
        let placement = allocator.claim(class, &self.requirements, self.epoch)?;
        self.placement = Some(placement);
        self.state = ResourceState::Placed;
        Ok(())
    }

    /// Bind the buffer to its claimed range; the block must already be allocated
    pub fn bind_resource_to_memory(&mut self, allocator: &MemoryAllocator) -> VulkanResult<()> {
        self.expect_state(ResourceState::Placed, "bind_resource_to_memory")?;
        allocator.check_epoch(self.epoch)?;

        let placement = self
            .placement
            .ok_or_else(|| VulkanError::invalid("resource has no memory placement"))?;
        let block = allocator
            .block(placement.block)
            .ok_or_else(|| VulkanError::invalid("resource placement refers to an unknown block"))?;
        if !block.is_allocated() {
            return Err(VulkanError::invalid(
                "bind_resource_to_memory called before the memory block was allocated",
            ));
        }

        let device = self
            .device
            .as_ref()
            .ok_or_else(|| VulkanError::invalid("resource has no device"))?;
        unsafe { device.bind_buffer_memory(self.buffer, block.memory(), placement.offset) }
            .map_err(VulkanError::from)?;

        self.state = ResourceState::Bound;
        Ok(())
    }

    /// Buffer handle, or `vk::Buffer::null()` until bound
    pub fn resource(&self) -> vk::Buffer {
        if self.state == ResourceState::Bound {
            self.buffer
        } else {
            vk::Buffer::null()
        }
    }

    /// Current stage
    pub const fn state(&self) -> ResourceState {
        self.state
    }

    /// Block placement, once claimed
    pub const fn placement(&self) -> Option<Placement> {
        self.placement
    }

    /// Byte offset of `slot` inside the buffer (`stride * slot`)
    pub fn sub_allocation_offset(&self, slot: u32) -> u64 {
        self.layout.map_or(0, |layout| layout.offset(slot))
    }

    /// Size of one slot's element
    pub fn sub_buffer_size(&self) -> u64 {
        self.layout.map_or(0, |layout| layout.element_size())
    }

    /// Total buffer size
    pub fn buffer_size(&self) -> u64 {
        self.layout.map_or(0, |layout| layout.total_size())
    }

    /// Number of slots
    pub fn frame_count(&self) -> u32 {
        self.layout.map_or(0, |layout| layout.frame_count())
    }

    /// Usage the buffer was created with
    pub const fn usage(&self) -> vk::BufferUsageFlags {
        self.usage
    }

    /// Sharing mode the buffer was created with
    pub const fn sharing_mode(&self) -> vk::SharingMode {
        self.sharing_mode
    }

    /// Distinct queue families the buffer is shared between
    pub fn queue_families(&self) -> &[u32] {
        &self.queue_families
    }

    /// Copy `bytes` into `slot` through the block's persistent mapping
    pub fn write_slot(&self, allocator: &mut MemoryAllocator, slot: u32, bytes: &[u8]) -> VulkanResult<()> {
        self.expect_state(ResourceState::Bound, "write_slot")?;
        if slot >= self.frame_count() {
            return Err(VulkanError::invalid(format!(
                "slot {slot} out of range for {} frames",
                self.frame_count()
            )));
        }
        if bytes.len() as u64 > self.sub_buffer_size() {
            return Err(VulkanError::invalid(format!(
                "{} bytes do not fit a {} byte slot",
                bytes.len(),
                self.sub_buffer_size()
            )));
        }

        let placement = self
            .placement
            .ok_or_else(|| VulkanError::invalid("resource has no memory placement"))?;
        allocator.write(placement.block, placement.offset + self.sub_allocation_offset(slot), bytes)
    }

    /// Descriptor range covering `slot`
    pub fn descriptor_info(&self, slot: u32) -> vk::DescriptorBufferInfo {
        vk::DescriptorBufferInfo {
            buffer: self.resource(),
            offset: self.sub_allocation_offset(slot),
            range: self.sub_buffer_size(),
        }
    }

    fn expect_state(&self, expected: ResourceState, operation: &str) -> VulkanResult<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(VulkanError::invalid(format!(
                "{operation} requires a {expected:?} resource, found {:?}",
                self.state
            )))
        }
    }
}

impl Drop for ResourceView {
    fn drop(&mut self) {
        if let Some(device) = &self.device {
            if self.buffer != vk::Buffer::null() {
                unsafe {
                    device.destroy_buffer(self.buffer, None);
                }
            }
        }
    }
}

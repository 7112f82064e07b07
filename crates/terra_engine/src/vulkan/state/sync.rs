//! Vulkan synchronization primitives for GPU/CPU coordination
//!
//! RAII wrappers for fences and semaphores, plus the per-queue ring of frame
//! slots. Each slot owns a command buffer, a completion fence and a signal
//! semaphore; the front slot advances by one on every submission.
//!
//! The ring never submits or waits on its own. Callers follow the contract:
//!
//! 1. wait on the front fence ([`SyncObjects::wait_front_fence`])
//! 2. record into the front command buffer ([`begin_front`])
//! 3. submit, signaling the front fence and semaphore ([`submit_front`])
//! 4. advance ([`SyncObjects::advance_sync_objects_in_queue`], done by `submit_front`)

use ash::{vk, Device};

use crate::foundation::logging::debug;
use crate::vulkan::{VulkanError, VulkanResult};

/// GPU-GPU synchronization primitive with automatic resource management
pub struct Semaphore {
    device: Device,
    semaphore: vk::Semaphore,
}

impl Semaphore {
    /// Create a new semaphore
    pub fn new(device: Device) -> VulkanResult<Self> {
        let create_info = vk::SemaphoreCreateInfo::builder();
        let semaphore = unsafe { device.create_semaphore(&create_info, None) }.map_err(VulkanError::from)?;
        Ok(Self { device, semaphore })
    }

    /// Get the semaphore handle
    pub const fn handle(&self) -> vk::Semaphore {
        self.semaphore
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_semaphore(self.semaphore, None);
        }
    }
}

/// Fence wrapper with RAII cleanup
pub struct Fence {
    device: Device,
    fence: vk::Fence,
}

impl Fence {
    /// Create a new fence
    pub fn new(device: Device, signaled: bool) -> VulkanResult<Self> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let create_info = vk::FenceCreateInfo::builder().flags(flags);
        let fence = unsafe { device.create_fence(&create_info, None) }.map_err(VulkanError::from)?;
        Ok(Self { device, fence })
    }

    /// Wait for the fence
    ///
    /// A timeout is reported as [`VulkanError::FenceTimeout`], device loss as
    /// [`VulkanError::DeviceLost`]; neither is retried.
    pub fn wait(&self, timeout_ns: u64) -> VulkanResult<()> {
        unsafe { self.device.wait_for_fences(&[self.fence], true, timeout_ns) }
            .map_err(|e| VulkanError::from_fence_wait(e, timeout_ns))
    }

    /// Reset the fence
    pub fn reset(&self) -> VulkanResult<()> {
        unsafe { self.device.reset_fences(&[self.fence]) }.map_err(VulkanError::from)
    }

    /// Whether the fence is signaled, without blocking
    pub fn is_signaled(&self) -> VulkanResult<bool> {
        unsafe { self.device.get_fence_status(self.fence) }.map_err(VulkanError::from)
    }

    /// Get the fence handle
    pub const fn handle(&self) -> vk::Fence {
        self.fence
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_fence(self.fence, None);
        }
    }
}

/// Front index of a ring of `len` slots
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameRing {
    front: u32,
    len: u32,
}

impl FrameRing {
    /// Ring of `len` slots starting at slot 0
    pub fn new(len: u32) -> VulkanResult<Self> {
        if len == 0 {
            return Err(VulkanError::invalid("a sync ring needs at least one slot"));
        }
        Ok(Self { front: 0, len })
    }

    /// Current front slot
    pub const fn front(&self) -> u32 {
        self.front
    }

    /// Number of slots
    pub const fn len(&self) -> u32 {
        self.len
    }

    /// Always false; a ring has at least one slot
    pub const fn is_empty(&self) -> bool {
        false
    }

    /// Move the front to the next slot, returning it
    pub fn advance(&mut self) -> u32 {
        self.front = (self.front + 1) % self.len;
        self.front
    }
}

struct FrameSlot {
    command_buffer: vk::CommandBuffer,
    fence: Fence,
    semaphore: Semaphore,
}

/// Per-queue ring of command buffers, fences and semaphores
pub struct SyncObjects {
    device: Device,
    family: u32,
    timeout_ns: u64,
    command_pool: vk::CommandPool,
    slots: Vec<FrameSlot>,
    ring: FrameRing,
}

impl SyncObjects {
    /// Create `slot_count` slots for a queue of `family`
    ///
    /// Fences start signaled so the first wait on every slot returns at once.
    pub fn new(device: &Device, family: u32, slot_count: u32, timeout_ns: u64) -> VulkanResult<Self> {
        let ring = FrameRing::new(slot_count)?;

        let pool_info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(family);
        let command_pool = unsafe { device.create_command_pool(&pool_info, None) }.map_err(VulkanError::from)?;

        // From here on, Drop releases whatever has been created so far
        let mut sync = Self {
            device: device.clone(),
            family,
            timeout_ns,
            command_pool,
            slots: Vec::with_capacity(slot_count as usize),
            ring,
        };

        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(slot_count);
        let command_buffers =
            unsafe { device.allocate_command_buffers(&alloc_info) }.map_err(VulkanError::from)?;

        for command_buffer in command_buffers {
            let fence = Fence::new(device.clone(), true)?;
            let semaphore = Semaphore::new(device.clone())?;
            sync.slots.push(FrameSlot {
                command_buffer,
                fence,
                semaphore,
            });
        }

        debug!("Created {} sync slots for queue family {}", slot_count, family);
        Ok(sync)
    }

    /// Index of the front slot
    pub const fn front_index(&self) -> u32 {
        self.ring.front()
    }

    /// Number of slots
    pub fn slot_count(&self) -> u32 {
        self.ring.len()
    }

    /// Queue family the command pool belongs to
    pub const fn family(&self) -> u32 {
        self.family
    }

    /// Timeout applied to fence waits
    pub const fn timeout_ns(&self) -> u64 {
        self.timeout_ns
    }

    /// Fence of the front slot
    pub fn front_fence(&self) -> vk::Fence {
        self.front().fence.handle()
    }

    /// Semaphore of the front slot
    pub fn front_semaphore(&self) -> vk::Semaphore {
        self.front().semaphore.handle()
    }

    /// Command buffer of the front slot
    pub fn front_command_buffer(&self) -> vk::CommandBuffer {
        self.front().command_buffer
    }

    /// Fence of `slot`
    pub fn fence(&self, slot: u32) -> Option<&Fence> {
        self.slots.get(slot as usize).map(|s| &s.fence)
    }

    /// Semaphore of `slot`
    pub fn semaphore(&self, slot: u32) -> Option<vk::Semaphore> {
        self.slots.get(slot as usize).map(|s| s.semaphore.handle())
    }

    /// Command buffer of `slot`
    pub fn command_buffer(&self, slot: u32) -> Option<vk::CommandBuffer> {
        self.slots.get(slot as usize).map(|s| s.command_buffer)
    }

    /// Rotate the front to the next slot
    pub fn advance_sync_objects_in_queue(&mut self) {
        self.ring.advance();
    }

    /// Block until the front slot's previous submission has completed
    pub fn wait_front_fence(&self) -> VulkanResult<()> {
        self.front().fence.wait(self.timeout_ns)
    }

    /// Block until every slot's previous submission has completed
    pub fn wait_all(&self) -> VulkanResult<()> {
        for slot in &self.slots {
            slot.fence.wait(self.timeout_ns)?;
        }
        Ok(())
    }

    /// Replace the front fence with a fresh signaled one
    ///
    /// For a front slot whose fence was reset but whose submission never
    /// reached the queue; without this the next wait on the slot times out.
    pub fn rearm_front_fence(&mut self) -> VulkanResult<()> {
        let fence = Fence::new(self.device.clone(), true)?;
        let index = self.ring.front() as usize;
        if let Some(slot) = self.slots.get_mut(index) {
            slot.fence = fence;
        }
        debug!("Re-armed fence of slot {} on queue family {}", index, self.family);
        Ok(())
    }

    pub(crate) const fn device(&self) -> &Device {
        &self.device
    }

    fn front(&self) -> &FrameSlot {
        // The ring length equals the slot count, so the front is always in range
        &self.slots[self.ring.front() as usize]
    }
}

impl Drop for SyncObjects {
    fn drop(&mut self) {
        debug!("Destroying sync slots for queue family {}", self.family);
        unsafe {
            let command_buffers: Vec<_> = self.slots.iter().map(|s| s.command_buffer).collect();
            if !command_buffers.is_empty() {
                self.device.free_command_buffers(self.command_pool, &command_buffers);
            }
            self.device.destroy_command_pool(self.command_pool, None);
        }
    }
}

/// Wait for the front slot, then reset and begin its command buffer
pub fn begin_front(sync: &SyncObjects) -> VulkanResult<vk::CommandBuffer> {
    sync.wait_front_fence()?;

    let command_buffer = sync.front_command_buffer();
    let device = sync.device();
    unsafe {
        device
            .reset_command_buffer(command_buffer, vk::CommandBufferResetFlags::empty())
            .map_err(VulkanError::from)?;
        let begin_info =
            vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        device
            .begin_command_buffer(command_buffer, &begin_info)
            .map_err(VulkanError::from)?;
    }
    Ok(command_buffer)
}

/// End and submit the front command buffer, then advance the ring
///
/// Signals the front fence, and the front semaphore when `signal` is set; the
/// returned semaphore is what a consumer on another queue waits on. If the
/// queue rejects the submission the ring stays put and the front fence is
/// re-armed, so the slot can be recorded again.
pub fn submit_front(
    sync: &mut SyncObjects,
    queue: vk::Queue,
    waits: &[(vk::Semaphore, vk::PipelineStageFlags)],
    signal: bool,
) -> VulkanResult<Option<vk::Semaphore>> {
    let command_buffer = sync.front_command_buffer();
    let fence = sync.front().fence.handle();
    let semaphore = sync.front_semaphore();

    let wait_semaphores: Vec<_> = waits.iter().map(|&(semaphore, _)| semaphore).collect();
    let wait_stages: Vec<_> = waits.iter().map(|&(_, stage)| stage).collect();
    let command_buffers = [command_buffer];
    let signal_semaphores = if signal { vec![semaphore] } else { Vec::new() };

    let submit_info = vk::SubmitInfo::builder()
        .wait_semaphores(&wait_semaphores)
        .wait_dst_stage_mask(&wait_stages)
        .command_buffers(&command_buffers)
        .signal_semaphores(&signal_semaphores);

    let device = sync.device();
    let submitted = unsafe {
        device.end_command_buffer(command_buffer).map_err(VulkanError::from)?;
        device.reset_fences(&[fence]).map_err(VulkanError::from)?;
        device.queue_submit(queue, &[submit_info.build()], fence)
    };
    if let Err(result) = submitted {
        let error = VulkanError::from(result);
        if !matches!(error, VulkanError::DeviceLost) {
            sync.rearm_front_fence()?;
        }
        return Err(error);
    }

    sync.advance_sync_objects_in_queue();
    Ok(signal.then_some(semaphore))
}

//! Upload path
//!
//! Host data bound for device-local buffers is accumulated in an
//! [`UploadBatch`] and flushed once per frame: one staging buffer, one command
//! buffer of copies, one submission on the transfer queue.

use ash::{vk, Device};

use super::allocator::find_memory_type;
use super::alignment::align_up;
use super::block::MemoryClass;
use crate::foundation::logging::debug;
use crate::vulkan::state::sync::{begin_front, submit_front, SyncObjects};
use crate::vulkan::{VulkanError, VulkanResult};

/// Staging offsets are kept 4-byte aligned for `vkCmdCopyBuffer`
const STAGING_ALIGNMENT: u64 = 4;

/// One pending copy out of the staging bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadRegion {
    /// Destination buffer
    pub dst: vk::Buffer,
    /// Offset in the destination buffer
    pub dst_offset: u64,
    /// Offset in the staging bytes
    pub src_offset: u64,
    /// Bytes to copy
    pub size: u64,
}

/// Host-side accumulation of pending copies
#[derive(Debug, Default)]
pub struct UploadBatch {
    bytes: Vec<u8>,
    regions: Vec<UploadRegion>,
}

impl UploadBatch {
    /// Queue a copy of `data` to `dst` at `dst_offset`
    pub fn add(&mut self, dst: vk::Buffer, dst_offset: u64, data: &[u8]) -> VulkanResult<()> {
        if dst == vk::Buffer::null() {
            return Err(VulkanError::invalid("upload destination is not a bound buffer"));
        }
        if data.is_empty() {
            return Ok(());
        }

        let src_offset = align_up(self.bytes.len() as u64, STAGING_ALIGNMENT);
        let padded = usize::try_from(src_offset)
            .map_err(|_| VulkanError::invalid("upload batch exceeds address space"))?;
        self.bytes.resize(padded, 0);
        self.bytes.extend_from_slice(data);
        self.regions.push(UploadRegion {
            dst,
            dst_offset,
            src_offset,
            size: data.len() as u64,
        });
        Ok(())
    }

    /// Staging bytes, copies packed at their `src_offset`
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Pending copies in submission order
    pub fn regions(&self) -> &[UploadRegion] {
        &self.regions
    }

    /// Whether nothing is pending
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Drop everything pending
    pub fn clear(&mut self) {
        self.bytes.clear();
        self.regions.clear();
    }
}

/// Dedicated host-visible transfer source
struct StagingBuffer {
    device: Device,
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    size: u64,
}

impl StagingBuffer {
    fn new(device: &Device, memory_properties: &vk::PhysicalDeviceMemoryProperties, bytes: &[u8]) -> VulkanResult<Self> {
        let size = bytes.len() as u64;
        let create_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(vk::BufferUsageFlags::TRANSFER_SRC)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { device.create_buffer(&create_info, None) }.map_err(VulkanError::from)?;

        // Drop frees the buffer (and memory, once assigned) on any later failure
        let mut staging = Self {
            device: device.clone(),
            buffer,
            memory: vk::DeviceMemory::null(),
            size,
        };

        let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };
        let class = MemoryClass::Upload;
        let memory_type = find_memory_type(
            memory_properties,
            requirements.memory_type_bits,
            class.required_flags(),
            class.preferred_flags(),
        )
        .ok_or(VulkanError::NoSuitableMemoryType)?;

        let allocate_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type);
        staging.memory = unsafe { device.allocate_memory(&allocate_info, None) }.map_err(|e| match e {
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
                VulkanError::OutOfMemory {
                    requested: requirements.size,
                }
            }
            other => VulkanError::from(other),
        })?;

        unsafe {
            let mapped = device
                .map_memory(staging.memory, 0, size, vk::MemoryMapFlags::empty())
                .map_err(VulkanError::from)?;
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), mapped.cast::<u8>(), bytes.len());
            device.unmap_memory(staging.memory);
            device
                .bind_buffer_memory(staging.buffer, staging.memory, 0)
                .map_err(VulkanError::from)?;
        }

        Ok(staging)
    }
}

impl Drop for StagingBuffer {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_buffer(self.buffer, None);
            if self.memory != vk::DeviceMemory::null() {
                self.device.free_memory(self.memory, None);
            }
        }
    }
}

/// Once-per-frame accumulator of host → device copies
///
/// Each flush owns one staging buffer, kept alive in the transfer ring slot it
/// was submitted from until that slot's fence signals.
///
/// A semaphore returned by a signaling flush is binary: it stays signaled until
/// a submission waits on it. Until the consumer reports that wait through
/// [`acknowledge_wait`](Self::acknowledge_wait), the same ring slot refuses to
/// signal again.
pub struct UploadContainer {
    device: Device,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    batch: UploadBatch,
    in_flight: Vec<Option<StagingBuffer>>,
    unwaited: Vec<Option<vk::Semaphore>>,
}

impl UploadContainer {
    /// Container for a transfer ring of `slot_count` slots
    pub fn new(device: Device, memory_properties: vk::PhysicalDeviceMemoryProperties, slot_count: u32) -> Self {
        Self {
            device,
            memory_properties,
            batch: UploadBatch::default(),
            in_flight: (0..slot_count).map(|_| None).collect(),
            unwaited: vec![None; slot_count as usize],
        }
    }

    /// Queue a copy of `data` into `dst` at `dst_offset`
    pub fn add(&mut self, dst: vk::Buffer, dst_offset: u64, data: &[u8]) -> VulkanResult<()> {
        self.batch.add(dst, dst_offset, data)
    }

    /// Pending copies
    pub const fn batch(&self) -> &UploadBatch {
        &self.batch
    }

    /// Whether any copy is pending
    pub fn has_pending(&self) -> bool {
        !self.batch.is_empty()
    }

    /// Number of staging buffers still held for in-flight submissions
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.iter().filter(|slot| slot.is_some()).count()
    }

    /// Semaphores handed out by signaling flushes and not yet acknowledged
    pub fn outstanding_signals(&self) -> usize {
        self.unwaited.iter().flatten().count()
    }

    /// Record that a submission waiting on `semaphore` has been queued
    ///
    /// Returns false if the semaphore was not outstanding.
    pub fn acknowledge_wait(&mut self, semaphore: vk::Semaphore) -> bool {
        match self.unwaited.iter_mut().find(|pending| **pending == Some(semaphore)) {
            Some(pending) => {
                *pending = None;
                true
            }
            None => false,
        }
    }

    /// Submit every pending copy on `queue` using the front slot of `sync`
    ///
    /// Returns the semaphore the consuming queue must wait on when `signal` is
    /// set; the consumer must wait on it and then call
    /// [`acknowledge_wait`](Self::acknowledge_wait) before this ring slot can
    /// signal again, otherwise the flush fails with `InvalidOperation` and the
    /// batch is kept. With nothing pending this is a no-op returning `None`.
    pub fn flush(&mut self, sync: &mut SyncObjects, queue: vk::Queue, signal: bool) -> VulkanResult<Option<vk::Semaphore>> {
        if self.batch.is_empty() {
            return Ok(None);
        }

        let slot = sync.front_index() as usize;
        if self.in_flight.len() < sync.slot_count() as usize {
            self.in_flight.resize_with(sync.slot_count() as usize, || None);
            self.unwaited.resize(sync.slot_count() as usize, None);
        }
        if signal {
            if let Some(semaphore) = self.unwaited[slot] {
                return Err(VulkanError::invalid(format!(
                    "transfer slot {slot} semaphore {semaphore:?} is still signaled; wait on it and acknowledge before signaling again"
                )));
            }
        }

        let command_buffer = begin_front(sync)?;
        // The front fence has signaled, so the slot's previous staging buffer is idle
        self.in_flight[slot] = None;

        let staging = StagingBuffer::new(&self.device, &self.memory_properties, self.batch.bytes())?;
        for region in self.batch.regions() {
            let copy = vk::BufferCopy {
                src_offset: region.src_offset,
                dst_offset: region.dst_offset,
                size: region.size,
            };
            unsafe {
                self.device
                    .cmd_copy_buffer(command_buffer, staging.buffer, region.dst, &[copy]);
            }
        }

        let semaphore = submit_front(sync, queue, &[], signal)?;
        debug!(
            "Flushed {} uploads ({} staging bytes) from transfer slot {}",
            self.batch.regions().len(),
            staging.size,
            slot
        );
        self.in_flight[slot] = Some(staging);
        if semaphore.is_some() {
            self.unwaited[slot] = semaphore;
        }
        self.batch.clear();
        Ok(semaphore)
    }

    /// Release staging buffers whose submissions have completed
    pub fn release_completed(&mut self, sync: &SyncObjects) -> VulkanResult<usize> {
        let mut released = 0;
        for (slot, staging) in (0_u32..).zip(self.in_flight.iter_mut()) {
            if staging.is_none() {
                continue;
            }
            if let Some(fence) = sync.fence(slot) {
                if fence.is_signaled()? {
                    *staging = None;
                    released += 1;
                }
            }
        }
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use crate::vulkan::memory::resource_view::ResourceView;
    use crate::vulkan::QueueRole;

    fn buffer(raw: u64) -> vk::Buffer {
        use ash::vk::Handle;
        vk::Buffer::from_raw(raw)
    }

    #[test]
    fn test_batch_offsets_are_aligned() {
        let mut batch = UploadBatch::default();
        batch.add(buffer(1), 0, &[1, 2, 3]).unwrap();
        batch.add(buffer(2), 64, &[4, 5, 6, 7, 8]).unwrap();
        batch.add(buffer(1), 16, &[9]).unwrap();

        let offsets: Vec<u64> = batch.regions().iter().map(|r| r.src_offset).collect();
        assert_eq!(offsets, vec![0, 4, 12]);
        assert_eq!(batch.bytes().len(), 13);
        assert_eq!(&batch.bytes()[4..9], &[4, 5, 6, 7, 8]);
        assert_eq!(batch.regions()[1].dst_offset, 64);
    }

    #[test]
    fn test_batch_rejects_unbound_destination() {
        let mut batch = UploadBatch::default();
        assert!(batch.add(vk::Buffer::null(), 0, &[1]).is_err());
        batch.add(buffer(3), 0, &[]).unwrap();
        assert!(batch.is_empty());
    }

    #[test]
    fn test_flush_on_transfer_queue() {
        let Some(mut terra) = testing::headless_terra(2, false) else {
            return;
        };
        let transfer = terra.device().unwrap().queue(QueueRole::Transfer);
        let families = terra.device().unwrap().unique_family_indices();

        let mut view = ResourceView::new();
        {
            let allocator = terra.allocator_mut().unwrap();
            view.create_resource(
                allocator,
                256,
                1,
                vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
                &families,
            )
            .unwrap();
            view.set_memory_offset_and_type(allocator, MemoryClass::GpuOnly).unwrap();
            allocator.allocate_memory(MemoryClass::GpuOnly).unwrap();
            view.bind_resource_to_memory(allocator).unwrap();
        }

        let (upload, sync) = terra.upload_and_transfer_sync().unwrap();
        assert!(upload.flush(sync, transfer.queue, false).unwrap().is_none());

        upload.add(view.resource(), 0, &[0xCD; 256]).unwrap();
        let semaphore = upload.flush(sync, transfer.queue, true).unwrap();
        assert!(semaphore.is_some());
        assert!(!upload.has_pending());
        assert_eq!(upload.in_flight_count(), 1);

        sync.wait_all().unwrap();
        assert_eq!(upload.release_completed(sync).unwrap(), 1);
        assert_eq!(upload.in_flight_count(), 0);

        drop(view);
    }

    #[test]
    fn test_unconsumed_signal_blocks_next_signal() {
        let Some(mut terra) = testing::headless_terra(2, false) else {
            return;
        };
        let transfer = terra.device().unwrap().queue(QueueRole::Transfer);
        let graphics = terra.device().unwrap().queue(QueueRole::Graphics);
        let families = terra.device().unwrap().unique_family_indices();

        let mut view = ResourceView::new();
        {
            let allocator = terra.allocator_mut().unwrap();
            view.create_resource(
                allocator,
                64,
                1,
                vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
                &families,
            )
            .unwrap();
            view.set_memory_offset_and_type(allocator, MemoryClass::GpuOnly).unwrap();
            allocator.allocate_memory(MemoryClass::GpuOnly).unwrap();
            view.bind_resource_to_memory(allocator).unwrap();
        }

        let semaphore = {
            let (upload, sync) = terra.upload_and_transfer_sync().unwrap();
            assert_eq!(sync.slot_count(), 1);

            upload.add(view.resource(), 0, &[1; 64]).unwrap();
            let semaphore = upload.flush(sync, transfer.queue, true).unwrap().unwrap();
            assert_eq!(upload.outstanding_signals(), 1);

            // Same slot, semaphore still signaled: refused, batch kept
            upload.add(view.resource(), 0, &[2; 64]).unwrap();
            assert!(matches!(
                upload.flush(sync, transfer.queue, true),
                Err(VulkanError::InvalidOperation { .. })
            ));
            assert!(upload.has_pending());

            // Copies without a signal still go through
            assert!(upload.flush(sync, transfer.queue, false).unwrap().is_none());
            semaphore
        };

        {
            let sync = terra.sync_mut(QueueRole::Graphics).unwrap();
            begin_front(sync).unwrap();
            submit_front(sync, graphics.queue, &[(semaphore, vk::PipelineStageFlags::ALL_COMMANDS)], false).unwrap();
        }

        let (upload, sync) = terra.upload_and_transfer_sync().unwrap();
        assert!(upload.acknowledge_wait(semaphore));
        assert!(!upload.acknowledge_wait(semaphore));
        assert_eq!(upload.outstanding_signals(), 0);

        upload.add(view.resource(), 0, &[3; 64]).unwrap();
        assert_eq!(upload.flush(sync, transfer.queue, true).unwrap(), Some(semaphore));
        sync.wait_all().unwrap();
        terra.sync(QueueRole::Graphics).unwrap().wait_all().unwrap();

        drop(view);
    }
}

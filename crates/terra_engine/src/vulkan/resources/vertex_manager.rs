//! # Vertex Data Managers
//!
//! GPU-resident geometry fed through the upload path. The managers take the
//! host vectors by value; their bytes are held only until
//! [`record_upload`](VertexManager::record_upload) has queued the copies, then
//! released.
//!
//! Both variants follow the resource view stages:
//!
//! ```text
//! add_gvi -> set_memory_offset_and_type -> (allocate block) -> bind_resource_to_memory -> record_upload
//! ```

use ash::{vk, Device};
use bytemuck::Pod;

use crate::foundation::logging::debug;
use crate::vulkan::initialization::queue_family::resolve_queue_indices;
use crate::vulkan::memory::allocator::MemoryAllocator;
use crate::vulkan::memory::block::MemoryClass;
use crate::vulkan::memory::resource_view::{ResourceState, ResourceView};
use crate::vulkan::memory::upload::UploadContainer;
use crate::vulkan::resources::descriptor_set::{DescriptorInfo, DescriptorSetManager};
use crate::vulkan::{VulkanError, VulkanResult};

/// One device buffer plus the host bytes waiting to be copied into it
struct StagedBuffer {
    view: ResourceView,
    host: Option<Vec<u8>>,
    element_count: u32,
}

impl StagedBuffer {
    fn new<T: Pod>(
        allocator: &mut MemoryAllocator,
        data: Vec<T>,
        usage: vk::BufferUsageFlags,
        queue_families: &[u32],
    ) -> VulkanResult<Self> {
        if data.is_empty() {
            return Err(VulkanError::invalid("geometry buffers cannot be empty"));
        }
        let element_count = u32::try_from(data.len())
            .map_err(|_| VulkanError::invalid("geometry exceeds u32 element count"))?;
        let host: Vec<u8> = bytemuck::cast_slice(&data).to_vec();
        drop(data);

        let mut view = ResourceView::new();
        view.create_resource(
            allocator,
            host.len() as u64,
            1,
            usage | vk::BufferUsageFlags::TRANSFER_DST,
            queue_families,
        )?;
        Ok(Self {
            view,
            host: Some(host),
            element_count,
        })
    }

    fn record(&mut self, upload: &mut UploadContainer) -> VulkanResult<()> {
        if self.view.state() != ResourceState::Bound {
            return Err(VulkanError::invalid("geometry must be bound before recording its upload"));
        }
        if let Some(host) = self.host.take() {
            upload.add(self.view.resource(), self.view.sub_allocation_offset(0), &host)?;
        }
        Ok(())
    }
}

/// Applies one stage to every buffer a manager owns
fn place_all(buffers: &mut [StagedBuffer], allocator: &mut MemoryAllocator, class: MemoryClass) -> VulkanResult<()> {
    for buffer in buffers {
        buffer.view.set_memory_offset_and_type(allocator, class)?;
    }
    Ok(())
}

fn bind_all(buffers: &mut [StagedBuffer], allocator: &MemoryAllocator) -> VulkanResult<()> {
    for buffer in buffers {
        buffer.view.bind_resource_to_memory(allocator)?;
    }
    Ok(())
}

fn record_all(buffers: &mut [StagedBuffer], upload: &mut UploadContainer) -> VulkanResult<()> {
    for buffer in buffers {
        buffer.record(upload)?;
    }
    Ok(())
}

/// Classic vertex + index buffers
pub struct VertexManager {
    queue_families: Vec<u32>,
    buffers: Vec<StagedBuffer>,
}

const VERTICES: usize = 0;
const INDICES: usize = 1;
const PRIMITIVE_INDICES: usize = 2;

impl VertexManager {
    /// Manager whose buffers are shared by `queue_families`
    ///
    /// Pass every family that touches the data (transfer and graphics at
    /// least); duplicates collapse.
    pub fn new(queue_families: &[u32]) -> Self {
        Self {
            queue_families: resolve_queue_indices(queue_families),
            buffers: Vec::new(),
        }
    }

    /// Take ownership of a mesh and create its vertex and index buffers
    pub fn add_gvi<V: Pod>(
        &mut self,
        allocator: &mut MemoryAllocator,
        vertices: Vec<V>,
        indices: Vec<u32>,
    ) -> VulkanResult<()> {
        if !self.buffers.is_empty() {
            return Err(VulkanError::invalid("vertex manager already holds geometry"));
        }
        let vertex_buffer = StagedBuffer::new(
            allocator,
            vertices,
            vk::BufferUsageFlags::VERTEX_BUFFER,
            &self.queue_families,
        )?;
        let index_buffer = StagedBuffer::new(
            allocator,
            indices,
            vk::BufferUsageFlags::INDEX_BUFFER,
            &self.queue_families,
        )?;
        debug!(
            "Vertex manager holds {} vertices and {} indices",
            vertex_buffer.element_count, index_buffer.element_count
        );
        self.buffers = vec![vertex_buffer, index_buffer];
        Ok(())
    }

    /// Claim device-local space for both buffers
    pub fn set_memory_offset_and_type(&mut self, allocator: &mut MemoryAllocator) -> VulkanResult<()> {
        place_all(&mut self.buffers, allocator, MemoryClass::GpuOnly)
    }

    /// Bind both buffers to their claimed ranges once the block is allocated
    pub fn bind_resource_to_memory(&mut self, allocator: &MemoryAllocator) -> VulkanResult<()> {
        bind_all(&mut self.buffers, allocator)
    }

    /// Queue the host → device copies and release the host bytes
    pub fn record_upload(&mut self, upload: &mut UploadContainer) -> VulkanResult<()> {
        record_all(&mut self.buffers, upload)
    }

    /// Bind both buffers for an indexed draw
    pub fn bind_vertex_and_index_buffer(&self, device: &Device, command_buffer: vk::CommandBuffer) -> VulkanResult<()> {
        let vertex_buffer = self.buffer(VERTICES)?;
        let index_buffer = self.buffer(INDICES)?;
        unsafe {
            device.cmd_bind_vertex_buffers(command_buffer, 0, &[vertex_buffer], &[0]);
            device.cmd_bind_index_buffer(command_buffer, index_buffer, 0, vk::IndexType::UINT32);
        }
        Ok(())
    }

    /// Number of vertices in the mesh
    pub fn vertex_count(&self) -> u32 {
        self.buffers.get(VERTICES).map_or(0, |b| b.element_count)
    }

    /// Number of indices in the mesh
    pub fn index_count(&self) -> u32 {
        self.buffers.get(INDICES).map_or(0, |b| b.element_count)
    }

    /// Whether host bytes are still waiting for `record_upload`
    pub fn has_pending_host_data(&self) -> bool {
        self.buffers.iter().any(|b| b.host.is_some())
    }

    /// Vertex buffer view, once a mesh was added
    pub fn vertex_view(&self) -> Option<&ResourceView> {
        self.buffers.get(VERTICES).map(|b| &b.view)
    }

    /// Index buffer view, once a mesh was added
    pub fn index_view(&self) -> Option<&ResourceView> {
        self.buffers.get(INDICES).map(|b| &b.view)
    }

    fn buffer(&self, which: usize) -> VulkanResult<vk::Buffer> {
        let resource = self.buffers.get(which).map_or(vk::Buffer::null(), |b| b.view.resource());
        if resource == vk::Buffer::null() {
            return Err(VulkanError::invalid("vertex data is not bound to memory"));
        }
        Ok(resource)
    }
}

/// Vertex, index and primitive-index storage buffers for cluster rendering
///
/// The buffers are read from shaders, so they are exposed through descriptors
/// rather than bound as vertex input.
pub struct ClusterVertexManager {
    queue_families: Vec<u32>,
    buffers: Vec<StagedBuffer>,
}

impl ClusterVertexManager {
    /// Manager whose buffers are shared by `queue_families`
    pub fn new(queue_families: &[u32]) -> Self {
        Self {
            queue_families: resolve_queue_indices(queue_families),
            buffers: Vec::new(),
        }
    }

    /// Take ownership of a clustered mesh
    pub fn add_gvi<V: Pod>(
        &mut self,
        allocator: &mut MemoryAllocator,
        vertices: Vec<V>,
        indices: Vec<u32>,
        primitive_indices: Vec<u32>,
    ) -> VulkanResult<()> {
        if !self.buffers.is_empty() {
            return Err(VulkanError::invalid("cluster vertex manager already holds geometry"));
        }
        let usage = vk::BufferUsageFlags::STORAGE_BUFFER;
        let buffers = vec![
            StagedBuffer::new(allocator, vertices, usage, &self.queue_families)?,
            StagedBuffer::new(allocator, indices, usage, &self.queue_families)?,
            StagedBuffer::new(allocator, primitive_indices, usage, &self.queue_families)?,
        ];
        debug!(
            "Cluster manager holds {} vertices, {} indices, {} primitive indices",
            buffers[VERTICES].element_count, buffers[INDICES].element_count, buffers[PRIMITIVE_INDICES].element_count
        );
        self.buffers = buffers;
        Ok(())
    }

    /// Claim device-local space for all three buffers
    pub fn set_memory_offset_and_type(&mut self, allocator: &mut MemoryAllocator) -> VulkanResult<()> {
        place_all(&mut self.buffers, allocator, MemoryClass::GpuOnly)
    }

    /// Bind all three buffers to their claimed ranges
    pub fn bind_resource_to_memory(&mut self, allocator: &MemoryAllocator) -> VulkanResult<()> {
        bind_all(&mut self.buffers, allocator)
    }

    /// Queue the host → device copies and release the host bytes
    pub fn record_upload(&mut self, upload: &mut UploadContainer) -> VulkanResult<()> {
        record_all(&mut self.buffers, upload)
    }

    /// Stage the three buffers as storage bindings `first_binding..first_binding + 3`
    ///
    /// The data is static, so every frame's set points at the same range.
    pub fn add_descriptors(
        &self,
        descriptors: &mut DescriptorSetManager,
        first_binding: u32,
        stage_flags: vk::ShaderStageFlags,
    ) -> VulkanResult<()> {
        if self.buffers.is_empty() {
            return Err(VulkanError::invalid("cluster vertex manager holds no geometry"));
        }
        for (binding, buffer) in (first_binding..).zip(&self.buffers) {
            let info = buffer.view.descriptor_info(0);
            if info.buffer == vk::Buffer::null() {
                return Err(VulkanError::invalid("cluster data is not bound to memory"));
            }
            let per_frame = vec![info; descriptors.frame_count() as usize];
            descriptors.add_buffers_split(DescriptorInfo::storage(binding), per_frame, stage_flags)?;
        }
        Ok(())
    }

    /// Sharing mode the buffers were created with
    pub fn sharing_mode(&self) -> vk::SharingMode {
        if self.queue_families.len() > 1 {
            vk::SharingMode::CONCURRENT
        } else {
            vk::SharingMode::EXCLUSIVE
        }
    }

    /// Distinct queue families sharing the buffers
    pub fn queue_families(&self) -> &[u32] {
        &self.queue_families
    }

    /// Number of vertices in the mesh
    pub fn vertex_count(&self) -> u32 {
        self.buffers.get(VERTICES).map_or(0, |b| b.element_count)
    }

    /// Number of indices in the mesh
    pub fn index_count(&self) -> u32 {
        self.buffers.get(INDICES).map_or(0, |b| b.element_count)
    }

    /// Number of primitive indices in the mesh
    pub fn primitive_index_count(&self) -> u32 {
        self.buffers.get(PRIMITIVE_INDICES).map_or(0, |b| b.element_count)
    }

    /// Whether host bytes are still waiting for `record_upload`
    pub fn has_pending_host_data(&self) -> bool {
        self.buffers.iter().any(|b| b.host.is_some())
    }
}

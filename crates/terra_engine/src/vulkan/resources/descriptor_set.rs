//! # Descriptor Set Manager
//!
//! One layout plus one descriptor set per frame in flight. Bindings are staged
//! first and only become native objects in
//! [`create_descriptor_sets`](DescriptorSetManager::create_descriptor_sets).
//! Until then every handle accessor returns null.

use ash::{vk, Device};

use crate::foundation::logging::debug;
use crate::vulkan::memory::resource_view::ResourceView;
use crate::vulkan::{VulkanError, VulkanResult};

/// Binding slot and descriptor type of one shader-visible resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorInfo {
    /// Binding index in the set
    pub binding: u32,
    /// Descriptor type
    pub descriptor_type: vk::DescriptorType,
}

impl DescriptorInfo {
    /// Uniform buffer at `binding`
    pub const fn uniform(binding: u32) -> Self {
        Self {
            binding,
            descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
        }
    }

    /// Storage buffer at `binding`
    pub const fn storage(binding: u32) -> Self {
        Self {
            binding,
            descriptor_type: vk::DescriptorType::STORAGE_BUFFER,
        }
    }

    fn is_buffer(self) -> bool {
        matches!(
            self.descriptor_type,
            vk::DescriptorType::UNIFORM_BUFFER
                | vk::DescriptorType::STORAGE_BUFFER
                | vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC
                | vk::DescriptorType::STORAGE_BUFFER_DYNAMIC
        )
    }
}

#[derive(Debug, Clone)]
struct StagedBinding {
    info: DescriptorInfo,
    stage_flags: vk::ShaderStageFlags,
    buffers: Vec<vk::DescriptorBufferInfo>,
}

struct RealizedSets {
    device: Device,
    layout: vk::DescriptorSetLayout,
    pool: vk::DescriptorPool,
    sets: Vec<vk::DescriptorSet>,
}

impl Drop for RealizedSets {
    fn drop(&mut self) {
        unsafe {
            // Destroying the pool frees its sets
            if self.pool != vk::DescriptorPool::null() {
                self.device.destroy_descriptor_pool(self.pool, None);
            }
            if self.layout != vk::DescriptorSetLayout::null() {
                self.device.destroy_descriptor_set_layout(self.layout, None);
            }
        }
    }
}

/// Per-frame descriptor sets sharing one layout
pub struct DescriptorSetManager {
    frame_count: u32,
    staged: Vec<StagedBinding>,
    realized: Option<RealizedSets>,
}

impl DescriptorSetManager {
    /// Manager for `frame_count` descriptor sets
    pub fn new(frame_count: u32) -> VulkanResult<Self> {
        if frame_count == 0 {
            return Err(VulkanError::invalid("descriptor frame count must be non-zero"));
        }
        Ok(Self {
            frame_count,
            staged: Vec::new(),
            realized: None,
        })
    }

    /// Stage a buffer binding with one range per frame
    ///
    /// Records intent only; nothing native is created.
    pub fn add_buffers_split(
        &mut self,
        info: DescriptorInfo,
        per_frame: Vec<vk::DescriptorBufferInfo>,
        stage_flags: vk::ShaderStageFlags,
    ) -> VulkanResult<()> {
        if self.realized.is_some() {
            return Err(VulkanError::invalid(
                "bindings cannot be added after descriptor sets were created",
            ));
        }
        if !info.is_buffer() {
            return Err(VulkanError::invalid(format!(
                "{:?} is not a buffer descriptor type",
                info.descriptor_type
            )));
        }
        if self.staged.iter().any(|staged| staged.info.binding == info.binding) {
            return Err(VulkanError::invalid(format!("binding {} is already staged", info.binding)));
        }
        self.check_frame_count(per_frame.len())?;

        self.staged.push(StagedBinding {
            info,
            stage_flags,
            buffers: per_frame,
        });
        Ok(())
    }

    /// Stage a binding whose frame `i` is slot `i` of `view`
    pub fn add_view_split(
        &mut self,
        info: DescriptorInfo,
        view: &ResourceView,
        stage_flags: vk::ShaderStageFlags,
    ) -> VulkanResult<()> {
        let per_frame = self.view_ranges(view)?;
        self.add_buffers_split(info, per_frame, stage_flags)
    }

    /// Layout bindings for every staged binding, by binding index
    pub fn layout_bindings(&self) -> Vec<vk::DescriptorSetLayoutBinding> {
        let mut bindings: Vec<_> = self
            .staged
            .iter()
            .map(|staged| {
                vk::DescriptorSetLayoutBinding::builder()
                    .binding(staged.info.binding)
                    .descriptor_type(staged.info.descriptor_type)
                    .descriptor_count(1)
                    .stage_flags(staged.stage_flags)
                    .build()
            })
            .collect();
        bindings.sort_by_key(|binding| binding.binding);
        bindings
    }

    /// Pool sizes covering every set
    pub fn pool_sizes(&self) -> Vec<vk::DescriptorPoolSize> {
        let mut sizes: Vec<vk::DescriptorPoolSize> = Vec::new();
        for staged in &self.staged {
            match sizes.iter_mut().find(|size| size.ty == staged.info.descriptor_type) {
                Some(size) => size.descriptor_count += self.frame_count,
                None => sizes.push(vk::DescriptorPoolSize {
                    ty: staged.info.descriptor_type,
                    descriptor_count: self.frame_count,
                }),
            }
        }
        sizes
    }

    /// Create the layout, the pool and every set, then write the staged bindings
    ///
    /// Runs once; a second call is misuse.
    pub fn create_descriptor_sets(&mut self, device: &Device) -> VulkanResult<()> {
        if self.realized.is_some() {
            return Err(VulkanError::invalid("descriptor sets were already created"));
        }
        if self.staged.is_empty() {
            return Err(VulkanError::invalid("no descriptor bindings were staged"));
        }

        let mut realized = RealizedSets {
            device: device.clone(),
            layout: vk::DescriptorSetLayout::null(),
            pool: vk::DescriptorPool::null(),
            sets: Vec::new(),
        };

        let bindings = self.layout_bindings();
        let layout_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings);
        realized.layout = unsafe { device.create_descriptor_set_layout(&layout_info, None) }
            .map_err(VulkanError::from)?;

        let pool_sizes = self.pool_sizes();
        let pool_info = vk::DescriptorPoolCreateInfo::builder()
            .pool_sizes(&pool_sizes)
            .max_sets(self.frame_count);
        realized.pool =
            unsafe { device.create_descriptor_pool(&pool_info, None) }.map_err(VulkanError::from)?;

        let layouts = vec![realized.layout; self.frame_count as usize];
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(realized.pool)
            .set_layouts(&layouts);
        realized.sets =
            unsafe { device.allocate_descriptor_sets(&alloc_info) }.map_err(VulkanError::from)?;

        write_sets(device, &realized.sets, &self.staged);

        debug!(
            "Created {} descriptor sets with {} bindings",
            realized.sets.len(),
            bindings.len()
        );
        self.realized = Some(realized);
        Ok(())
    }

    /// Replace the per-frame ranges of an existing binding
    ///
    /// The layout is untouched; created sets are rewritten in place.
    pub fn update_buffers_split(&mut self, binding: u32, per_frame: Vec<vk::DescriptorBufferInfo>) -> VulkanResult<()> {
        self.check_frame_count(per_frame.len())?;
        let index = self
            .staged
            .iter()
            .position(|staged| staged.info.binding == binding)
            .ok_or_else(|| VulkanError::invalid(format!("binding {binding} was never staged")))?;
        self.staged[index].buffers = per_frame;

        if let Some(realized) = &self.realized {
            write_sets(&realized.device, &realized.sets, &self.staged[index..=index]);
        }
        Ok(())
    }

    /// Point an existing binding at the slots of another view
    pub fn update_view_split(&mut self, binding: u32, view: &ResourceView) -> VulkanResult<()> {
        let per_frame = self.view_ranges(view)?;
        self.update_buffers_split(binding, per_frame)
    }

    /// Record binding of the set for `frame`
    pub fn bind(
        &self,
        device: &Device,
        command_buffer: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        pipeline_layout: vk::PipelineLayout,
        frame: u32,
    ) -> VulkanResult<()> {
        let set = self.descriptor_set(frame);
        if set == vk::DescriptorSet::null() {
            return Err(VulkanError::invalid(format!("no descriptor set for frame {frame}")));
        }
        unsafe {
            device.cmd_bind_descriptor_sets(command_buffer, bind_point, pipeline_layout, 0, &[set], &[]);
        }
        Ok(())
    }

    /// Set for `frame`, null before creation
    pub fn descriptor_set(&self, frame: u32) -> vk::DescriptorSet {
        self.realized
            .as_ref()
            .and_then(|realized| realized.sets.get(frame as usize).copied())
            .unwrap_or_else(vk::DescriptorSet::null)
    }

    /// Shared layout, null before creation
    pub fn layout(&self) -> vk::DescriptorSetLayout {
        self.realized
            .as_ref()
            .map_or_else(vk::DescriptorSetLayout::null, |realized| realized.layout)
    }

    /// Layout per set, as passed to allocation
    pub fn layouts(&self) -> Vec<vk::DescriptorSetLayout> {
        vec![self.layout(); self.set_count()]
    }

    /// Number of created sets
    pub fn set_count(&self) -> usize {
        self.realized.as_ref().map_or(0, |realized| realized.sets.len())
    }

    /// Number of layout entries, one per set
    pub fn layout_count(&self) -> usize {
        self.layouts().len()
    }

    /// Configured frame count
    pub const fn frame_count(&self) -> u32 {
        self.frame_count
    }

    /// Whether native sets exist
    pub const fn is_created(&self) -> bool {
        self.realized.is_some()
    }

    fn view_ranges(&self, view: &ResourceView) -> VulkanResult<Vec<vk::DescriptorBufferInfo>> {
        if view.resource() == vk::Buffer::null() {
            return Err(VulkanError::invalid("resource view must be bound before it is used in descriptors"));
        }
        if view.frame_count() < self.frame_count {
            return Err(VulkanError::invalid(format!(
                "resource view has {} slots but {} frames need descriptors",
                view.frame_count(),
                self.frame_count
            )));
        }
        Ok((0..self.frame_count).map(|slot| view.descriptor_info(slot)).collect())
    }

    fn check_frame_count(&self, count: usize) -> VulkanResult<()> {
        if count != self.frame_count as usize {
            return Err(VulkanError::invalid(format!(
                "expected {} per-frame buffer infos, got {}",
                self.frame_count, count
            )));
        }
        Ok(())
    }
}

fn write_sets(device: &Device, sets: &[vk::DescriptorSet], bindings: &[StagedBinding]) {
    let writes: Vec<vk::WriteDescriptorSet> = bindings
        .iter()
        .flat_map(|staged| {
            sets.iter().zip(staged.buffers.iter()).map(move |(&set, buffer)| {
                vk::WriteDescriptorSet::builder()
                    .dst_set(set)
                    .dst_binding(staged.info.binding)
                    .descriptor_type(staged.info.descriptor_type)
                    .buffer_info(std::slice::from_ref(buffer))
                    .build()
            })
        })
        .collect();
    unsafe {
        device.update_descriptor_sets(&writes, &[]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use crate::vulkan::memory::block::MemoryClass;

    fn ranges(count: usize) -> Vec<vk::DescriptorBufferInfo> {
        (0..count)
            .map(|slot| vk::DescriptorBufferInfo {
                buffer: vk::Buffer::null(),
                offset: slot as u64 * 256,
                range: 64,
            })
            .collect()
    }

    #[test]
    fn test_staging_records_intent_only() {
        let mut manager = DescriptorSetManager::new(2).unwrap();
        manager
            .add_buffers_split(DescriptorInfo::uniform(0), ranges(2), vk::ShaderStageFlags::VERTEX)
            .unwrap();

        assert!(!manager.is_created());
        assert_eq!(manager.set_count(), 0);
        assert_eq!(manager.layout(), vk::DescriptorSetLayout::null());
        assert_eq!(manager.descriptor_set(0), vk::DescriptorSet::null());
    }

    #[test]
    fn test_staging_validation() {
        let mut manager = DescriptorSetManager::new(2).unwrap();
        assert!(manager
            .add_buffers_split(DescriptorInfo::uniform(0), ranges(3), vk::ShaderStageFlags::VERTEX)
            .is_err());

        manager
            .add_buffers_split(DescriptorInfo::uniform(0), ranges(2), vk::ShaderStageFlags::VERTEX)
            .unwrap();
        assert!(manager
            .add_buffers_split(DescriptorInfo::storage(0), ranges(2), vk::ShaderStageFlags::COMPUTE)
            .is_err());

        let sampler = DescriptorInfo {
            binding: 1,
            descriptor_type: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
        };
        assert!(manager
            .add_buffers_split(sampler, ranges(2), vk::ShaderStageFlags::FRAGMENT)
            .is_err());
        assert!(manager.update_buffers_split(7, ranges(2)).is_err());
        assert!(DescriptorSetManager::new(0).is_err());
    }

    #[test]
    fn test_layout_and_pool_sizes() {
        let mut manager = DescriptorSetManager::new(3).unwrap();
        manager
            .add_buffers_split(DescriptorInfo::storage(2), ranges(3), vk::ShaderStageFlags::COMPUTE)
            .unwrap();
        manager
            .add_buffers_split(DescriptorInfo::uniform(0), ranges(3), vk::ShaderStageFlags::VERTEX)
            .unwrap();
        manager
            .add_buffers_split(DescriptorInfo::storage(1), ranges(3), vk::ShaderStageFlags::COMPUTE)
            .unwrap();

        let bindings: Vec<u32> = manager.layout_bindings().iter().map(|b| b.binding).collect();
        assert_eq!(bindings, vec![0, 1, 2]);

        let sizes: Vec<(vk::DescriptorType, u32)> = manager
            .pool_sizes()
            .iter()
            .map(|size| (size.ty, size.descriptor_count))
            .collect();
        assert_eq!(
            sizes,
            vec![
                (vk::DescriptorType::STORAGE_BUFFER, 6),
                (vk::DescriptorType::UNIFORM_BUFFER, 3)
            ]
        );
    }

    #[test]
    fn test_create_descriptor_sets_once() {
        let Some(mut terra) = testing::headless_terra(2, false) else {
            return;
        };
        let device = terra.device().unwrap().raw().clone();
        let allocator = terra.allocator_mut().unwrap();

        let mut view = ResourceView::new();
        view.create_resource(allocator, 64, 2, vk::BufferUsageFlags::UNIFORM_BUFFER, &[0])
            .unwrap();
        view.set_memory_offset_and_type(allocator, MemoryClass::CpuWritable).unwrap();
        allocator.allocate_memory(MemoryClass::CpuWritable).unwrap();
        view.bind_resource_to_memory(allocator).unwrap();

        let mut manager = DescriptorSetManager::new(2).unwrap();
        manager
            .add_view_split(DescriptorInfo::uniform(0), &view, vk::ShaderStageFlags::VERTEX)
            .unwrap();
        manager.create_descriptor_sets(&device).unwrap();

        assert_eq!(manager.set_count(), 2);
        assert_eq!(manager.layout_count(), 2);
        assert_ne!(manager.layout(), vk::DescriptorSetLayout::null());
        assert_ne!(manager.descriptor_set(0), vk::DescriptorSet::null());
        assert_ne!(manager.descriptor_set(1), vk::DescriptorSet::null());
        assert_eq!(manager.descriptor_set(2), vk::DescriptorSet::null());

        assert!(matches!(
            manager.create_descriptor_sets(&device),
            Err(VulkanError::InvalidOperation { .. })
        ));

        // Rebinding rewrites sets without touching the layout
        let layout = manager.layout();
        manager.update_view_split(0, &view).unwrap();
        assert_eq!(manager.layout(), layout);

        drop(manager);
        drop(view);
    }
}

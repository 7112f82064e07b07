//! # Engine Context
//!
//! [`Terra`] is the explicit registry every engine singleton lives in. Each
//! `init_*` stage builds its objects and hands them to the lifecycle manager
//! under a typed slot and a teardown priority, so a partially initialised
//! engine still tears down in a valid order.
//!
//! ```text
//! init_instance -> init_surface (optional) -> init_device -> init_sync_objects -> init_swapchain
//! ```

use ash::vk;

use crate::config::RendererConfig;
use crate::foundation::logging::{debug, info, warn};
use crate::lifecycle::ObjectManager;
use crate::vulkan::initialization::debug_layer::select_debug_layer;
use crate::vulkan::initialization::device::PhysicalDeviceInfo;
use crate::vulkan::{
    LogicalDevice, MemoryAllocator, QueueRole, RenderPass, Surface, SurfaceTarget, SwapchainManager,
    SyncObjects, UploadContainer, VulkanError, VulkanInstance, VulkanResult,
};

/// Typed lifecycle slots of the engine singletons
pub mod slots {
    use crate::lifecycle::Slot;
    use crate::vulkan::{
        DebugLayer, LogicalDevice, MemoryAllocator, RenderPass, Surface, SwapchainManager, SyncObjects,
        UploadContainer, VulkanInstance,
    };

    /// Loader entry and instance
    pub const INSTANCE: Slot<VulkanInstance> = Slot::new("instance");
    /// Validation messenger or its no-op stand-in
    pub const DEBUG_LAYER: Slot<Box<dyn DebugLayer>> = Slot::new("debug_layer");
    /// Presentation surface
    pub const SURFACE: Slot<Surface> = Slot::new("surface");
    /// Logical device and its queues
    pub const DEVICE: Slot<LogicalDevice> = Slot::new("device");
    /// Device memory blocks
    pub const ALLOCATOR: Slot<MemoryAllocator> = Slot::new("allocator");
    /// Frame ring of the graphics queue
    pub const GRAPHICS_SYNC: Slot<SyncObjects> = Slot::new("graphics_sync");
    /// Frame ring of the transfer queue
    pub const TRANSFER_SYNC: Slot<SyncObjects> = Slot::new("transfer_sync");
    /// Frame ring of the compute queue
    pub const COMPUTE_SYNC: Slot<SyncObjects> = Slot::new("compute_sync");
    /// Pending uploads and in-flight staging buffers
    pub const UPLOAD: Slot<UploadContainer> = Slot::new("upload");
    /// Colour pass matching the swapchain format
    pub const RENDER_PASS: Slot<RenderPass> = Slot::new("render_pass");
    /// Swapchain, image views and framebuffers
    pub const SWAPCHAIN: Slot<SwapchainManager> = Slot::new("swapchain");
}

/// Teardown priorities; higher is destroyed first
///
/// An object can only be destroyed on its own while nothing above it is live,
/// so the swapchain and its render pass sit on top where resize can rebuild them.
pub mod priority {
    use crate::lifecycle::Priority;

    /// Destroyed last
    pub const INSTANCE: Priority = 0;
    /// Messenger, destroyed before the instance it hangs off
    pub const DEBUG_LAYER: Priority = 1;
    /// Surface, destroyed before the instance
    pub const SURFACE: Priority = 1;
    /// Logical device
    pub const DEVICE: Priority = 2;
    /// Memory blocks, freed before the device
    pub const ALLOCATOR: Priority = 3;
    /// Frame rings of every queue
    pub const SYNC: Priority = 4;
    /// Upload container and its staging buffers
    pub const UPLOAD: Priority = 5;
    /// Application resources (views, descriptor sets, vertex data)
    pub const RESOURCES: Priority = 6;
    /// Render pass, rebuilt when the surface format changes
    pub const RENDER_PASS: Priority = 7;
    /// Swapchain, rebuilt on every resize
    pub const SWAPCHAIN: Priority = 8;
}

/// Engine context owning every long-lived GPU object
pub struct Terra {
    config: RendererConfig,
    objects: ObjectManager,
}

impl Terra {
    /// Create an empty context; nothing touches the driver until `init_instance`
    pub const fn new(config: RendererConfig) -> Self {
        Self {
            config,
            objects: ObjectManager::new(),
        }
    }

    /// Renderer settings the context was built with
    pub const fn config(&self) -> &RendererConfig {
        &self.config
    }

    /// Lifecycle registry, for application-owned resources
    pub const fn objects(&self) -> &ObjectManager {
        &self.objects
    }

    /// Mutable lifecycle registry, for registering application resources
    pub fn objects_mut(&mut self) -> &mut ObjectManager {
        &mut self.objects
    }

    /// Load Vulkan and create the instance with the configured debug layer
    ///
    /// Pass the surface target that will be used later so its extensions are
    /// enabled; `None` brings up a compute/transfer-only instance.
    pub fn init_instance(&mut self, target: Option<&SurfaceTarget>) -> VulkanResult<()> {
        self.config
            .validate()
            .map_err(|e| VulkanError::InitializationFailed(e.to_string()))?;
        self.objects.ensure_vacant(&slots::INSTANCE)?;
        self.objects.ensure_vacant(&slots::DEBUG_LAYER)?;

        let entry = VulkanInstance::load_entry()?;
        let mut debug_layer = select_debug_layer(&entry, self.config.validation_requested());

        let mut extensions = match target {
            Some(target) => target.required_extensions()?,
            None => Vec::new(),
        };
        extensions.extend(debug_layer.instance_extensions().iter().map(|ext| ext.as_ptr()));
        let layers = debug_layer.instance_layers();

        let instance = VulkanInstance::new(entry, &self.config.application_name, &extensions, &layers)?;
        debug_layer.attach(&instance.entry, &instance.instance)?;
        debug!("Debug layer: {}", debug_layer.name());

        self.objects
            .create_object(&slots::INSTANCE, instance, priority::INSTANCE)?;
        self.objects
            .create_object(&slots::DEBUG_LAYER, debug_layer, priority::DEBUG_LAYER)?;
        Ok(())
    }

    /// Create the presentation surface
    pub fn init_surface(&mut self, target: &SurfaceTarget) -> VulkanResult<()> {
        self.objects.ensure_vacant(&slots::SURFACE)?;
        let surface = Surface::new(self.objects.get(&slots::INSTANCE)?, target)?;
        self.objects
            .create_object(&slots::SURFACE, surface, priority::SURFACE)?;
        Ok(())
    }

    /// Pick a GPU, create the logical device and the memory allocator
    pub fn init_device(&mut self) -> VulkanResult<()> {
        self.objects.ensure_vacant(&slots::DEVICE)?;
        self.objects.ensure_vacant(&slots::ALLOCATOR)?;

        let device = {
            let instance = self.objects.get(&slots::INSTANCE)?;
            let surface = self.objects.try_get(&slots::SURFACE);
            let physical = PhysicalDeviceInfo::find_physical_device(&instance.instance, surface)?;
            LogicalDevice::new(&instance.instance, physical, surface.is_some())?
        };

        let mut allocator = MemoryAllocator::new(device.raw().clone(), device.physical().memory_properties);
        allocator.set_buffer_alignments(device.physical().buffer_alignments());

        self.objects.create_object(&slots::DEVICE, device, priority::DEVICE)?;
        self.objects
            .create_object(&slots::ALLOCATOR, allocator, priority::ALLOCATOR)?;
        Ok(())
    }

    /// Create the per-queue frame rings and the upload container
    ///
    /// Graphics and compute rings hold one slot per frame in flight; the
    /// transfer ring holds the configured transfer slots.
    pub fn init_sync_objects(&mut self) -> VulkanResult<()> {
        for slot in [&slots::GRAPHICS_SYNC, &slots::TRANSFER_SYNC, &slots::COMPUTE_SYNC] {
            self.objects.ensure_vacant(slot)?;
        }
        self.objects.ensure_vacant(&slots::UPLOAD)?;

        let frames = self.config.frames_in_flight;
        let transfer_slots = self.config.transfer_slots;
        let timeout_ns = self.config.fence_timeout_ns;

        let (graphics, transfer, compute, upload) = {
            let device = self.objects.get(&slots::DEVICE)?;
            let ring = |role: QueueRole, count: u32| {
                SyncObjects::new(device.raw(), device.queue(role).family, count, timeout_ns)
            };
            (
                ring(QueueRole::Graphics, frames)?,
                ring(QueueRole::Transfer, transfer_slots)?,
                ring(QueueRole::Compute, frames)?,
                UploadContainer::new(
                    device.raw().clone(),
                    device.physical().memory_properties,
                    transfer_slots,
                ),
            )
        };

        self.objects
            .create_object(&slots::GRAPHICS_SYNC, graphics, priority::SYNC)?;
        self.objects
            .create_object(&slots::TRANSFER_SYNC, transfer, priority::SYNC)?;
        self.objects
            .create_object(&slots::COMPUTE_SYNC, compute, priority::SYNC)?;
        self.objects.create_object(&slots::UPLOAD, upload, priority::UPLOAD)?;
        Ok(())
    }

    /// Create the swapchain, its render pass and framebuffers
    ///
    /// The render pass survives resizes unless the surface format changes.
    pub fn init_swapchain(&mut self, extent: vk::Extent2D) -> VulkanResult<()> {
        self.objects.ensure_vacant(&slots::SWAPCHAIN)?;

        let mut swapchain = {
            let instance = self.objects.get(&slots::INSTANCE)?;
            let device = self.objects.get(&slots::DEVICE)?;
            let surface = self.objects.get(&slots::SURFACE)?;
            SwapchainManager::new(
                &instance.instance,
                device,
                surface,
                extent,
                self.config.frames_in_flight,
                device.queue(QueueRole::Graphics),
            )?
        };

        let format = swapchain.format().format;
        let reusable = self
            .objects
            .try_get(&slots::RENDER_PASS)
            .is_some_and(|pass| pass.color_format() == format);
        if !reusable {
            if self.objects.contains(&slots::RENDER_PASS) {
                self.objects.destroy_object(&slots::RENDER_PASS)?;
            }
            let device = self.objects.get(&slots::DEVICE)?.raw().clone();
            let render_pass = RenderPass::new_color_pass(device, format)?;
            self.objects
                .create_object(&slots::RENDER_PASS, render_pass, priority::RENDER_PASS)?;
        }

        swapchain.realize_framebuffers(self.objects.get(&slots::RENDER_PASS)?)?;
        self.objects
            .create_object(&slots::SWAPCHAIN, swapchain, priority::SWAPCHAIN)?;
        Ok(())
    }

    /// Destroy and recreate the swapchain at `extent`
    pub fn resize(&mut self, extent: vk::Extent2D) -> VulkanResult<()> {
        self.device()?.wait_idle()?;
        if self.objects.contains(&slots::SWAPCHAIN) {
            self.objects.destroy_object(&slots::SWAPCHAIN)?;
        }
        self.init_swapchain(extent)?;
        info!("Swapchain resized to {}x{}", extent.width, extent.height);
        Ok(())
    }

    /// Release finished staging buffers and submit pending uploads
    ///
    /// Returns the semaphore graphics work must wait on when `signal` is set
    /// and something was submitted. After queueing that wait, report it with
    /// [`UploadContainer::acknowledge_wait`] (through
    /// [`upload_and_transfer_sync`](Self::upload_and_transfer_sync)); until then
    /// a signaling flush from the same transfer slot is refused.
    pub fn flush_uploads(&mut self, signal: bool) -> VulkanResult<Option<vk::Semaphore>> {
        let queue = self.device()?.queue(QueueRole::Transfer).queue;
        let (upload, sync) = self.upload_and_transfer_sync()?;
        upload.release_completed(sync)?;
        upload.flush(sync, queue, signal)
    }

    /// Current extent of the surface, when it reports one
    pub fn display_extent(&self) -> VulkanResult<Option<vk::Extent2D>> {
        let surface = self.objects.get(&slots::SURFACE)?;
        surface.current_extent(self.device()?.physical().device)
    }

    /// Logical device, once `init_device` has run
    pub fn device(&self) -> VulkanResult<&LogicalDevice> {
        Ok(self.objects.get(&slots::DEVICE)?)
    }

    /// Device memory allocator
    pub fn allocator(&self) -> VulkanResult<&MemoryAllocator> {
        Ok(self.objects.get(&slots::ALLOCATOR)?)
    }

    /// Mutable allocator, for placing and allocating resources
    pub fn allocator_mut(&mut self) -> VulkanResult<&mut MemoryAllocator> {
        Ok(self.objects.get_mut(&slots::ALLOCATOR)?)
    }

    /// Current swapchain, once `init_swapchain` has run
    pub fn swapchain(&self) -> VulkanResult<&SwapchainManager> {
        Ok(self.objects.get(&slots::SWAPCHAIN)?)
    }

    /// Colour pass the framebuffers were realized against
    pub fn render_pass(&self) -> VulkanResult<&RenderPass> {
        Ok(self.objects.get(&slots::RENDER_PASS)?)
    }

    /// Frame ring of the queue serving `role`
    pub fn sync(&self, role: QueueRole) -> VulkanResult<&SyncObjects> {
        Ok(self.objects.get(Self::sync_slot(role))?)
    }

    /// Mutable frame ring of the queue serving `role`
    pub fn sync_mut(&mut self, role: QueueRole) -> VulkanResult<&mut SyncObjects> {
        Ok(self.objects.get_mut(Self::sync_slot(role))?)
    }

    /// The upload container together with the transfer ring it submits on
    pub fn upload_and_transfer_sync(&mut self) -> VulkanResult<(&mut UploadContainer, &mut SyncObjects)> {
        Ok(self
            .objects
            .get_pair_mut(&slots::UPLOAD, &slots::TRANSFER_SYNC)?)
    }

    /// Wait for every queue's outstanding work, then destroy everything
    ///
    /// A fence timeout aborts with nothing destroyed, since the GPU may still
    /// be using the objects. A lost device is logged and teardown proceeds.
    pub fn shutdown(&mut self) -> VulkanResult<()> {
        for role in QueueRole::ALL {
            if let Some(sync) = self.objects.try_get(Self::sync_slot(role)) {
                match sync.wait_all() {
                    Ok(()) => {}
                    Err(VulkanError::DeviceLost) => warn!("Device lost while draining the {} queue", role),
                    Err(error) => return Err(error),
                }
            }
        }
        if let Some(device) = self.objects.try_get(&slots::DEVICE) {
            match device.wait_idle() {
                Ok(()) | Err(VulkanError::DeviceLost) => {}
                Err(error) => return Err(error),
            }
        }

        let objects = self.objects.len();
        self.objects.start_clean_up();
        info!("Terra shut down ({} objects destroyed)", objects);
        Ok(())
    }

    const fn sync_slot(role: QueueRole) -> &'static crate::lifecycle::Slot<SyncObjects> {
        match role {
            QueueRole::Graphics => &slots::GRAPHICS_SYNC,
            QueueRole::Transfer => &slots::TRANSFER_SYNC,
            QueueRole::Compute => &slots::COMPUTE_SYNC,
        }
    }
}

impl Drop for Terra {
    fn drop(&mut self) {
        if let Some(device) = self.objects.try_get(&slots::DEVICE) {
            if let Err(error) = device.wait_idle() {
                warn!("Device did not go idle before teardown: {}", error);
            }
        }
        self.objects.start_clean_up();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::{ObjectManagerError, Slot};
    use crate::testing;
    use crate::vulkan::{DescriptorInfo, DescriptorSetManager, MemoryClass, ResourceView};

    const UNIFORMS: Slot<ResourceView> = Slot::new("uniforms");
    const DESCRIPTORS: Slot<DescriptorSetManager> = Slot::new("descriptors");

    #[test]
    fn test_priorities_tear_down_dependents_first() {
        assert!(priority::SWAPCHAIN > priority::RENDER_PASS);
        assert!(priority::RENDER_PASS > priority::RESOURCES);
        assert!(priority::RESOURCES > priority::UPLOAD);
        assert!(priority::UPLOAD > priority::SYNC);
        assert!(priority::SYNC > priority::DEVICE);
        assert!(priority::ALLOCATOR > priority::DEVICE);
        assert!(priority::SURFACE > priority::INSTANCE);
        assert!(priority::DEBUG_LAYER > priority::INSTANCE);
    }

    #[test]
    fn test_shutdown_without_init() {
        let mut terra = Terra::new(RendererConfig::default());
        terra.shutdown().unwrap();
        assert!(terra.objects().is_empty());
        assert!(matches!(
            terra.device().err(),
            Some(VulkanError::Lifecycle(ObjectManagerError::SlotEmpty { slot: "device" }))
        ));
    }

    #[test]
    fn test_invalid_config_is_rejected_before_loading() {
        let mut terra = Terra::new(RendererConfig::default().with_frames_in_flight(0));
        assert!(matches!(
            terra.init_instance(None),
            Err(VulkanError::InitializationFailed(_))
        ));
        assert!(terra.objects().is_empty());
    }

    #[test]
    fn test_double_init_is_rejected() {
        let Some(mut terra) = testing::headless_terra(2, false) else {
            return;
        };
        let count = terra.objects().len();
        assert!(matches!(
            terra.init_instance(None),
            Err(VulkanError::Lifecycle(ObjectManagerError::SlotOccupied { slot: "instance" }))
        ));
        assert!(matches!(
            terra.init_sync_objects(),
            Err(VulkanError::Lifecycle(ObjectManagerError::SlotOccupied { .. }))
        ));
        assert_eq!(terra.objects().len(), count);
    }

    #[test]
    fn test_headless_bring_up_and_teardown() {
        let Some(mut terra) = testing::headless_terra(2, true) else {
            return;
        };
        terra.init_swapchain(terra.config().extent()).unwrap();

        let swapchain = terra.swapchain().unwrap();
        assert!(swapchain.image_count() > 0);
        for image in 0..swapchain.image_count() {
            assert_ne!(swapchain.framebuffer(image), vk::Framebuffer::null());
        }
        assert_eq!(terra.render_pass().unwrap().color_format(), swapchain.format().format);

        let device = terra.device().unwrap().raw().clone();
        let families = terra.device().unwrap().unique_family_indices();
        let mut uniforms = ResourceView::new();
        {
            let allocator = terra.allocator_mut().unwrap();
            uniforms
                .create_resource(allocator, 64, 2, vk::BufferUsageFlags::UNIFORM_BUFFER, &families)
                .unwrap();
            uniforms
                .set_memory_offset_and_type(allocator, MemoryClass::CpuWritable)
                .unwrap();
            allocator.allocate_memory(MemoryClass::CpuWritable).unwrap();
            uniforms.bind_resource_to_memory(allocator).unwrap();
            uniforms.write_slot(allocator, 1, &[7; 64]).unwrap();
        }

        let mut descriptors = DescriptorSetManager::new(2).unwrap();
        descriptors
            .add_view_split(DescriptorInfo::uniform(0), &uniforms, vk::ShaderStageFlags::VERTEX)
            .unwrap();
        descriptors.create_descriptor_sets(&device).unwrap();
        assert_eq!(descriptors.set_count(), 2);
        assert_ne!(descriptors.descriptor_set(0), descriptors.descriptor_set(1));

        let objects = terra.objects_mut();
        objects.create_object(&UNIFORMS, uniforms, priority::RESOURCES).unwrap();
        objects
            .create_object(&DESCRIPTORS, descriptors, priority::RESOURCES)
            .unwrap();

        let order = terra.objects().teardown_order();
        assert_eq!(order.first(), Some(&("swapchain", priority::SWAPCHAIN)));
        assert_eq!(order.last(), Some(&("instance", priority::INSTANCE)));
        let descriptors_at = order.iter().position(|&(slot, _)| slot == "descriptors").unwrap();
        let allocator_at = order.iter().position(|&(slot, _)| slot == "allocator").unwrap();
        assert!(descriptors_at < allocator_at);

        // The device cannot go while anything built on it is live
        assert!(matches!(
            terra.objects_mut().destroy_object(&slots::DEVICE),
            Err(ObjectManagerError::OutOfOrder { slot: "device", .. })
        ));

        terra.resize(vk::Extent2D { width: 640, height: 480 }).unwrap();
        assert!(terra.swapchain().unwrap().has_framebuffers());

        terra.shutdown().unwrap();
        assert!(terra.objects().is_empty());
    }
}

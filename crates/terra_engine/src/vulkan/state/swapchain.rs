//! # Swapchain Manager
//!
//! Owns the presentable images, their views and (once realized) one
//! framebuffer per image. There is no in-place resize: on an extent change the
//! manager is destroyed and built again.

use ash::extensions::khr::Swapchain as SwapchainLoader;
use ash::{vk, Device, Instance};

use super::render_pass::RenderPass;
use crate::foundation::logging::{debug, info};
use crate::vulkan::initialization::device::{LogicalDevice, QueueHandle};
use crate::vulkan::initialization::queue_family::QueueRole;
use crate::vulkan::initialization::surface::Surface;
use crate::vulkan::{VulkanError, VulkanResult};

/// Prefer B8G8R8A8_SRGB with an sRGB colour space, else the first reported format
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> VulkanResult<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .copied()
        .find(|sf| {
            sf.format == vk::Format::B8G8R8A8_SRGB && sf.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| formats.first().copied())
        .ok_or_else(|| VulkanError::missing("surface formats"))
}

/// Prefer MAILBOX, else FIFO (always available)
pub fn choose_present_mode(modes: &[vk::PresentModeKHR]) -> vk::PresentModeKHR {
    modes
        .iter()
        .copied()
        .find(|&mode| mode == vk::PresentModeKHR::MAILBOX)
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

/// Surface-dictated extent, or the target clamped into the supported range
pub fn choose_extent(capabilities: &vk::SurfaceCapabilitiesKHR, target: vk::Extent2D) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        return capabilities.current_extent;
    }
    vk::Extent2D {
        width: target.width.clamp(
            capabilities.min_image_extent.width,
            capabilities.max_image_extent.width,
        ),
        height: target.height.clamp(
            capabilities.min_image_extent.height,
            capabilities.max_image_extent.height,
        ),
    }
}

/// Requested buffer count clamped into the surface's `[min, max]` (max 0 = unbounded)
pub fn choose_image_count(capabilities: &vk::SurfaceCapabilitiesKHR, requested: u32) -> u32 {
    let count = requested.max(capabilities.min_image_count);
    if capabilities.max_image_count > 0 {
        count.min(capabilities.max_image_count)
    } else {
        count
    }
}

/// OPAQUE when supported, else the first supported mode
pub fn choose_composite_alpha(supported: vk::CompositeAlphaFlagsKHR) -> vk::CompositeAlphaFlagsKHR {
    [
        vk::CompositeAlphaFlagsKHR::OPAQUE,
        vk::CompositeAlphaFlagsKHR::PRE_MULTIPLIED,
        vk::CompositeAlphaFlagsKHR::POST_MULTIPLIED,
        vk::CompositeAlphaFlagsKHR::INHERIT,
    ]
    .into_iter()
    .find(|&mode| supported.contains(mode))
    .unwrap_or(vk::CompositeAlphaFlagsKHR::OPAQUE)
}

/// Check the present queue against the families that can present
///
/// When only the graphics family presents, the present queue must be the
/// graphics queue; a mismatch is misuse rather than something to work around.
pub fn check_present_queue(present_family: u32, graphics_family: u32, capable_families: &[u32]) -> VulkanResult<()> {
    if capable_families.contains(&present_family) {
        return Ok(());
    }
    if capable_families.contains(&graphics_family) {
        return Err(VulkanError::invalid(format!(
            "queue family {present_family} cannot present; use the graphics queue (family {graphics_family})"
        )));
    }
    Err(VulkanError::missing(format!(
        "present support on queue family {present_family}"
    )))
}

/// Swapchain management wrapper with RAII cleanup
pub struct SwapchainManager {
    device: Device,
    loader: SwapchainLoader,
    swapchain: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    image_views: Vec<vk::ImageView>,
    framebuffers: Vec<vk::Framebuffer>,
    format: vk::SurfaceFormatKHR,
    present_mode: vk::PresentModeKHR,
    extent: vk::Extent2D,
    present_queue: QueueHandle,
}

impl SwapchainManager {
    /// Create a swapchain of about `buffer_count` images presented on `present_queue`
    pub fn new(
        instance: &Instance,
        device: &LogicalDevice,
        surface: &Surface,
        target_extent: vk::Extent2D,
        buffer_count: u32,
        present_queue: QueueHandle,
    ) -> VulkanResult<Self> {
        if !device.swapchain_enabled() {
            return Err(VulkanError::invalid("device was created without the swapchain extension"));
        }

        let physical = device.physical();
        let graphics = device.queue(QueueRole::Graphics);
        let mut capable_families = Vec::new();
        for family in 0..physical.queue_families.len() as u32 {
            if surface.supports_present(physical.device, family)? {
                capable_families.push(family);
            }
        }
        check_present_queue(present_queue.family, graphics.family, &capable_families)?;

        let capabilities = surface.capabilities(physical.device)?;
        if !capabilities
            .supported_usage_flags
            .contains(vk::ImageUsageFlags::COLOR_ATTACHMENT)
        {
            return Err(VulkanError::missing("colour attachment usage on swapchain images"));
        }
        let format = choose_surface_format(&surface.formats(physical.device)?)?;
        let present_mode = choose_present_mode(&surface.present_modes(physical.device)?);
        let extent = choose_extent(&capabilities, target_extent);
        let image_count = choose_image_count(&capabilities, buffer_count);

        let queue_families = [graphics.family, present_queue.family];
        let mut create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(surface.handle())
            .min_image_count(image_count)
            .image_format(format.format)
            .image_color_space(format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .pre_transform(capabilities.current_transform)
            .composite_alpha(choose_composite_alpha(capabilities.supported_composite_alpha))
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(vk::SwapchainKHR::null());
        create_info = if graphics.family == present_queue.family {
            create_info.image_sharing_mode(vk::SharingMode::EXCLUSIVE)
        } else {
            create_info
                .image_sharing_mode(vk::SharingMode::CONCURRENT)
                .queue_family_indices(&queue_families)
        };

        let loader = SwapchainLoader::new(instance, device.raw());
        let swapchain = unsafe { loader.create_swapchain(&create_info, None) }
            .map_err(|e| VulkanError::InitializationFailed(format!("Swapchain rejected by the surface: {e:?}")))?;

        // Drop destroys whatever has been created if a later step fails
        let mut manager = Self {
            device: device.raw().clone(),
            loader,
            swapchain,
            images: Vec::new(),
            image_views: Vec::new(),
            framebuffers: Vec::new(),
            format,
            present_mode,
            extent,
            present_queue,
        };

        manager.images =
            unsafe { manager.loader.get_swapchain_images(swapchain) }.map_err(VulkanError::from)?;
        for &image in &manager.images {
            let view_info = vk::ImageViewCreateInfo::builder()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(format.format)
                .components(vk::ComponentMapping {
                    r: vk::ComponentSwizzle::IDENTITY,
                    g: vk::ComponentSwizzle::IDENTITY,
                    b: vk::ComponentSwizzle::IDENTITY,
                    a: vk::ComponentSwizzle::IDENTITY,
                })
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                });
            let view =
                unsafe { manager.device.create_image_view(&view_info, None) }.map_err(VulkanError::from)?;
            manager.image_views.push(view);
        }

        info!(
            "Created swapchain: {} images, {}x{}, {:?}, {:?}",
            manager.images.len(),
            extent.width,
            extent.height,
            format.format,
            present_mode
        );
        Ok(manager)
    }

    /// Create one framebuffer per image against `render_pass`
    ///
    /// Framebuffers stay null until this is called. Realizing again replaces them.
    pub fn realize_framebuffers(&mut self, render_pass: &RenderPass) -> VulkanResult<()> {
        if render_pass.color_format() != self.format.format {
            return Err(VulkanError::invalid(format!(
                "render pass format {:?} does not match swapchain format {:?}",
                render_pass.color_format(),
                self.format.format
            )));
        }
        self.destroy_framebuffers();

        for &view in &self.image_views {
            let attachments = [view];
            let create_info = vk::FramebufferCreateInfo::builder()
                .render_pass(render_pass.handle())
                .attachments(&attachments)
                .width(self.extent.width)
                .height(self.extent.height)
                .layers(1);
            let framebuffer =
                unsafe { self.device.create_framebuffer(&create_info, None) }.map_err(VulkanError::from)?;
            self.framebuffers.push(framebuffer);
        }
        debug!("Realized {} framebuffers", self.framebuffers.len());
        Ok(())
    }

    /// Framebuffer for `image_index`, null until realized
    pub fn framebuffer(&self, image_index: u32) -> vk::Framebuffer {
        self.framebuffers
            .get(image_index as usize)
            .copied()
            .unwrap_or_else(vk::Framebuffer::null)
    }

    /// Whether framebuffers have been realized
    pub fn has_framebuffers(&self) -> bool {
        !self.framebuffers.is_empty()
    }

    /// Acquire the next image, signaling `semaphore` when it is ready
    ///
    /// Returns the image index and whether the swapchain is suboptimal.
    pub fn acquire_next_image(&self, semaphore: vk::Semaphore, timeout_ns: u64) -> VulkanResult<(u32, bool)> {
        unsafe {
            self.loader
                .acquire_next_image(self.swapchain, timeout_ns, semaphore, vk::Fence::null())
        }
        .map_err(VulkanError::from)
    }

    /// Present `image_index` on the present queue after `wait_semaphores`
    ///
    /// Returns whether the swapchain is suboptimal.
    pub fn present(&self, image_index: u32, wait_semaphores: &[vk::Semaphore]) -> VulkanResult<bool> {
        let swapchains = [self.swapchain];
        let image_indices = [image_index];
        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);
        unsafe { self.loader.queue_present(self.present_queue.queue, &present_info) }
            .map_err(VulkanError::from)
    }

    /// Swapchain handle
    pub const fn handle(&self) -> vk::SwapchainKHR {
        self.swapchain
    }

    /// Number of images
    pub fn image_count(&self) -> u32 {
        self.images.len() as u32
    }

    /// Image views, one per image
    pub fn image_views(&self) -> &[vk::ImageView] {
        &self.image_views
    }

    /// Chosen surface format
    pub const fn format(&self) -> vk::SurfaceFormatKHR {
        self.format
    }

    /// Chosen present mode
    pub const fn present_mode(&self) -> vk::PresentModeKHR {
        self.present_mode
    }

    /// Image extent
    pub const fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// Queue images are presented on
    pub const fn present_queue(&self) -> QueueHandle {
        self.present_queue
    }

    fn destroy_framebuffers(&mut self) {
        for framebuffer in self.framebuffers.drain(..) {
            unsafe {
                self.device.destroy_framebuffer(framebuffer, None);
            }
        }
    }
}

impl Drop for SwapchainManager {
    fn drop(&mut self) {
        debug!("Destroying swapchain {:?}", self.swapchain);
        self.destroy_framebuffers();
        unsafe {
            for &view in &self.image_views {
                self.device.destroy_image_view(view, None);
            }
            self.loader.destroy_swapchain(self.swapchain, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capabilities(current: (u32, u32), min_count: u32, max_count: u32) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: min_count,
            max_image_count: max_count,
            current_extent: vk::Extent2D {
                width: current.0,
                height: current.1,
            },
            min_image_extent: vk::Extent2D { width: 1, height: 1 },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 4096,
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_choose_surface_format() {
        let srgb = vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_SRGB,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        let unorm = vk::SurfaceFormatKHR {
            format: vk::Format::R8G8B8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        assert_eq!(choose_surface_format(&[unorm, srgb]).unwrap(), srgb);
        assert_eq!(choose_surface_format(&[unorm]).unwrap(), unorm);
        assert!(matches!(
            choose_surface_format(&[]),
            Err(VulkanError::MissingCapability { .. })
        ));
    }

    #[test]
    fn test_choose_present_mode() {
        assert_eq!(
            choose_present_mode(&[vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX]),
            vk::PresentModeKHR::MAILBOX
        );
        assert_eq!(
            choose_present_mode(&[vk::PresentModeKHR::IMMEDIATE]),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn test_choose_extent() {
        let target = vk::Extent2D {
            width: 8000,
            height: 600,
        };
        let fixed = capabilities((1280, 720), 2, 3);
        assert_eq!(choose_extent(&fixed, target), fixed.current_extent);

        let free = capabilities((u32::MAX, u32::MAX), 2, 3);
        assert_eq!(
            choose_extent(&free, target),
            vk::Extent2D {
                width: 4096,
                height: 600
            }
        );
    }

    #[test]
    fn test_choose_image_count() {
        assert_eq!(choose_image_count(&capabilities((1, 1), 2, 8), 2), 2);
        assert_eq!(choose_image_count(&capabilities((1, 1), 3, 8), 2), 3);
        assert_eq!(choose_image_count(&capabilities((1, 1), 1, 2), 4), 2);
        assert_eq!(choose_image_count(&capabilities((1, 1), 1, 0), 5), 5);
    }

    #[test]
    fn test_choose_composite_alpha() {
        assert_eq!(
            choose_composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE | vk::CompositeAlphaFlagsKHR::INHERIT),
            vk::CompositeAlphaFlagsKHR::OPAQUE
        );
        assert_eq!(
            choose_composite_alpha(vk::CompositeAlphaFlagsKHR::INHERIT),
            vk::CompositeAlphaFlagsKHR::INHERIT
        );
    }

    #[test]
    fn test_present_queue_precondition() {
        assert!(check_present_queue(0, 0, &[0]).is_ok());
        assert!(check_present_queue(1, 0, &[0, 1]).is_ok());
        assert!(matches!(
            check_present_queue(1, 0, &[0]),
            Err(VulkanError::InvalidOperation { .. })
        ));
        assert!(matches!(
            check_present_queue(1, 0, &[]),
            Err(VulkanError::MissingCapability { .. })
        ));
    }
}

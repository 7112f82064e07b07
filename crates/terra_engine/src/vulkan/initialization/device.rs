//! Physical device selection and logical device ownership

use ash::extensions::khr::Swapchain as SwapchainLoader;
use ash::{vk, Device, Instance};
use std::ffi::{c_char, CStr};

use super::context::{VulkanError, VulkanResult};
use super::queue_family::{resolve_queue_indices, QueueAssignment, QueueFamilyCaps, QueueRole};
use super::surface::Surface;
use crate::foundation::logging::{debug, info};
use crate::vulkan::memory::alignment::BufferAlignments;

/// Physical device selection and capabilities
#[derive(Debug, Clone)]
pub struct PhysicalDeviceInfo {
    /// Vulkan physical device handle
    pub device: vk::PhysicalDevice,
    /// Device properties and limits
    pub properties: vk::PhysicalDeviceProperties,
    /// Memory heaps and types
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    /// Available queue families
    pub queue_families: Vec<vk::QueueFamilyProperties>,
    /// Resolved role → queue mapping
    pub queues: QueueAssignment,
}

impl PhysicalDeviceInfo {
    /// Select a device whose families resolve every queue role
    ///
    /// With a surface, the graphics family must present and the device must
    /// expose the swapchain extension. Discrete GPUs win over other types.
    pub fn find_physical_device(instance: &Instance, surface: Option<&Surface>) -> VulkanResult<Self> {
        let devices = unsafe { instance.enumerate_physical_devices() }.map_err(VulkanError::from)?;
        if devices.is_empty() {
            return Err(VulkanError::missing("Vulkan physical device"));
        }

        let mut last_error = None;
        let mut candidates = Vec::new();
        for device in devices {
            match Self::evaluate_device(instance, device, surface) {
                Ok(info) => candidates.push(info),
                Err(error) => {
                    debug!("Skipping physical device {:?}: {}", device, error);
                    last_error = Some(error);
                }
            }
        }

        let selected = candidates
            .iter()
            .position(|info| info.properties.device_type == vk::PhysicalDeviceType::DISCRETE_GPU)
            .unwrap_or(0);
        if candidates.is_empty() {
            return Err(last_error.unwrap_or_else(|| VulkanError::missing("suitable GPU")));
        }
        let info = candidates.swap_remove(selected);

        info!("Selected GPU: {}", info.name());
        Ok(info)
    }

    fn evaluate_device(
        instance: &Instance,
        device: vk::PhysicalDevice,
        surface: Option<&Surface>,
    ) -> VulkanResult<Self> {
        let properties = unsafe { instance.get_physical_device_properties(device) };
        let memory_properties = unsafe { instance.get_physical_device_memory_properties(device) };
        let queue_families = unsafe { instance.get_physical_device_queue_family_properties(device) };

        let mut caps = Vec::with_capacity(queue_families.len());
        for (index, family) in (0_u32..).zip(queue_families.iter()) {
            let present = match surface {
                Some(surface) => surface.supports_present(device, index)?,
                None => false,
            };
            caps.push(QueueFamilyCaps::from_properties(family, present));
        }
        let queues = QueueAssignment::resolve(&caps, surface.is_some())?;

        if surface.is_some() {
            let extensions = unsafe { instance.enumerate_device_extension_properties(device) }
                .map_err(VulkanError::from)?;
            let has_swapchain = extensions.iter().any(|available| {
                (unsafe { CStr::from_ptr(available.extension_name.as_ptr()) }) == SwapchainLoader::name()
            });
            if !has_swapchain {
                return Err(VulkanError::missing("VK_KHR_swapchain device extension"));
            }
        }

        Ok(Self {
            device,
            properties,
            memory_properties,
            queue_families,
            queues,
        })
    }

    /// Device name as reported by the driver
    pub fn name(&self) -> String {
        unsafe { CStr::from_ptr(self.properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned()
    }

    /// Minimum buffer offset alignments for this device
    pub fn buffer_alignments(&self) -> BufferAlignments {
        BufferAlignments::from_limits(&self.properties.limits)
    }
}

/// A device queue bound to its role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueHandle {
    /// Queue handle
    pub queue: vk::Queue,
    /// Family index
    pub family: u32,
    /// Queue index inside the family
    pub index: u32,
    /// Role the queue was resolved for
    pub role: QueueRole,
}

/// Logical device wrapper with RAII cleanup
pub struct LogicalDevice {
    device: Device,
    physical: PhysicalDeviceInfo,
    queues: [QueueHandle; 3],
    swapchain_enabled: bool,
}

impl LogicalDevice {
    /// Create a logical device with one queue create-info per distinct family
    pub fn new(instance: &Instance, physical: PhysicalDeviceInfo, enable_swapchain: bool) -> VulkanResult<Self> {
        let queue_counts = physical.queues.queue_counts();
        let priorities: Vec<Vec<f32>> = queue_counts
            .iter()
            .map(|&(_, count)| vec![1.0; count as usize])
            .collect();
        let queue_infos: Vec<vk::DeviceQueueCreateInfo> = queue_counts
            .iter()
            .zip(priorities.iter())
            .map(|(&(family, _), priorities)| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(priorities)
                    .build()
            })
            .collect();

        let extensions: Vec<*const c_char> = if enable_swapchain {
            vec![SwapchainLoader::name().as_ptr()]
        } else {
            Vec::new()
        };
        let features = vk::PhysicalDeviceFeatures::default();

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&extensions)
            .enabled_features(&features);

        let device = unsafe { instance.create_device(physical.device, &create_info, None) }
            .map_err(|e| match e {
                vk::Result::ERROR_EXTENSION_NOT_PRESENT => {
                    VulkanError::missing("VK_KHR_swapchain device extension")
                }
                other => VulkanError::from(other),
            })?;

        let queues = QueueRole::ALL.map(|role| {
            let slot = physical.queues.slot(role);
            QueueHandle {
                queue: unsafe { device.get_device_queue(slot.family, slot.index) },
                family: slot.family,
                index: slot.index,
                role,
            }
        });

        for queue in &queues {
            info!(
                "{} queue: family {} index {}",
                queue.role, queue.family, queue.index
            );
        }

        Ok(Self {
            device,
            physical,
            queues,
            swapchain_enabled: enable_swapchain,
        })
    }

    /// Raw ash device
    pub const fn raw(&self) -> &Device {
        &self.device
    }

    /// Physical device the logical device was created on
    pub const fn physical(&self) -> &PhysicalDeviceInfo {
        &self.physical
    }

    /// Queue resolved for `role`
    pub fn queue(&self, role: QueueRole) -> QueueHandle {
        self.queues
            .iter()
            .copied()
            .find(|queue| queue.role == role)
            .unwrap_or(self.queues[0])
    }

    /// Distinct family indices of every role, ascending
    pub fn unique_family_indices(&self) -> Vec<u32> {
        self.physical.queues.unique_families()
    }

    /// Distinct family indices of the given roles, ascending
    pub fn family_indices(&self, roles: &[QueueRole]) -> Vec<u32> {
        let families: Vec<u32> = roles.iter().map(|&role| self.queue(role).family).collect();
        resolve_queue_indices(&families)
    }

    /// Whether the swapchain extension was enabled
    pub const fn swapchain_enabled(&self) -> bool {
        self.swapchain_enabled
    }

    /// Block until the device is idle
    pub fn wait_idle(&self) -> VulkanResult<()> {
        unsafe { self.device.device_wait_idle() }.map_err(VulkanError::from)
    }
}

impl Drop for LogicalDevice {
    fn drop(&mut self) {
        debug!("Destroying logical device");
        unsafe {
            let _ = self.device.device_wait_idle();
            self.device.destroy_device(None);
        }
    }
}

//! Vulkan surface management
//!
//! Handles surface creation for presentation. Window creation and message
//! handling live outside the engine; it only consumes raw handles, or renders
//! to a headless surface when no window exists.

use ash::{extensions::khr, vk};
use raw_window_handle::{
    RawDisplayHandle, RawWindowHandle, Win32WindowHandle, WindowsDisplayHandle,
};
use std::ffi::{c_char, c_void, CStr};

use super::context::{VulkanError, VulkanInstance, VulkanResult};
use crate::foundation::logging::debug;

/// What a surface is created against
#[derive(Debug, Clone, Copy)]
pub enum SurfaceTarget {
    /// A native window owned by an external windowing component
    Native {
        /// Display connection handle
        display: RawDisplayHandle,
        /// Window handle
        window: RawWindowHandle,
    },
    /// `VK_EXT_headless_surface`, for offscreen bring-up and tests
    Headless,
}

impl SurfaceTarget {
    /// Target a Win32 window from its HWND and module HINSTANCE
    pub fn win32(hwnd: *mut c_void, hinstance: *mut c_void) -> Self {
        let mut window = Win32WindowHandle::empty();
        window.hwnd = hwnd;
        window.hinstance = hinstance;
        Self::Native {
            display: RawDisplayHandle::Windows(WindowsDisplayHandle::empty()),
            window: RawWindowHandle::Win32(window),
        }
    }

    /// Instance extensions needed to create a surface for this target
    pub fn required_extensions(&self) -> VulkanResult<Vec<*const c_char>> {
        match self {
            Self::Native { display, .. } => ash_window::enumerate_required_extensions(*display)
                .map(<[*const c_char]>::to_vec)
                .map_err(|_| VulkanError::missing("surface extensions for this display")),
            Self::Headless => Ok(vec![
                khr::Surface::name().as_ptr(),
                vk::ExtHeadlessSurfaceFn::name().as_ptr(),
            ]),
        }
    }
}

/// Vulkan surface wrapper for presentation
pub struct Surface {
    surface_loader: khr::Surface,
    surface: vk::SurfaceKHR,
}

impl Surface {
    /// Create a surface for `target`
    pub fn new(instance: &VulkanInstance, target: &SurfaceTarget) -> VulkanResult<Self> {
        let surface_loader = khr::Surface::new(&instance.entry, &instance.instance);

        let surface = match target {
            SurfaceTarget::Native { display, window } => unsafe {
                ash_window::create_surface(
                    &instance.entry,
                    &instance.instance,
                    *display,
                    *window,
                    None,
                )
            }
            .map_err(|e| {
                VulkanError::InitializationFailed(format!("Failed to create surface: {e:?}"))
            })?,
            SurfaceTarget::Headless => Self::create_headless(instance)?,
        };

        debug!("Created surface {:?}", surface);
        Ok(Self {
            surface_loader,
            surface,
        })
    }

    fn create_headless(instance: &VulkanInstance) -> VulkanResult<vk::SurfaceKHR> {
        let headless = vk::ExtHeadlessSurfaceFn::load(|name: &CStr| unsafe {
            std::mem::transmute(
                instance
                    .entry
                    .get_instance_proc_addr(instance.instance.handle(), name.as_ptr()),
            )
        });

        let create_info = vk::HeadlessSurfaceCreateInfoEXT::builder();
        let mut surface = vk::SurfaceKHR::null();
        unsafe {
            (headless.create_headless_surface_ext)(
                instance.instance.handle(),
                &*create_info,
                std::ptr::null(),
                &mut surface,
            )
        }
        .result()
        .map_err(|e| VulkanError::InitializationFailed(format!("Failed to create headless surface: {e:?}")))?;

        Ok(surface)
    }

    /// Get the underlying surface handle
    pub const fn handle(&self) -> vk::SurfaceKHR {
        self.surface
    }

    /// Get the surface loader
    pub const fn loader(&self) -> &khr::Surface {
        &self.surface_loader
    }

    /// Whether `family` on `physical_device` can present to this surface
    pub fn supports_present(&self, physical_device: vk::PhysicalDevice, family: u32) -> VulkanResult<bool> {
        unsafe {
            self.surface_loader
                .get_physical_device_surface_support(physical_device, family, self.surface)
        }
        .map_err(VulkanError::from)
    }

    /// Get surface capabilities for a physical device
    pub fn capabilities(&self, physical_device: vk::PhysicalDevice) -> VulkanResult<vk::SurfaceCapabilitiesKHR> {
        unsafe {
            self.surface_loader
                .get_physical_device_surface_capabilities(physical_device, self.surface)
        }
        .map_err(VulkanError::from)
    }

    /// Get surface formats for a physical device
    pub fn formats(&self, physical_device: vk::PhysicalDevice) -> VulkanResult<Vec<vk::SurfaceFormatKHR>> {
        unsafe {
            self.surface_loader
                .get_physical_device_surface_formats(physical_device, self.surface)
        }
        .map_err(VulkanError::from)
    }

    /// Get surface present modes for a physical device
    pub fn present_modes(&self, physical_device: vk::PhysicalDevice) -> VulkanResult<Vec<vk::PresentModeKHR>> {
        unsafe {
            self.surface_loader
                .get_physical_device_surface_present_modes(physical_device, self.surface)
        }
        .map_err(VulkanError::from)
    }

    /// Current surface extent, if the surface reports a fixed one
    pub fn current_extent(&self, physical_device: vk::PhysicalDevice) -> VulkanResult<Option<vk::Extent2D>> {
        let capabilities = self.capabilities(physical_device)?;
        Ok((capabilities.current_extent.width != u32::MAX).then_some(capabilities.current_extent))
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        debug!("Destroying surface {:?}", self.surface);
        unsafe {
            self.surface_loader.destroy_surface(self.surface, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headless_required_extensions() {
        let extensions = SurfaceTarget::Headless.required_extensions().unwrap();
        let names: Vec<&CStr> = extensions
            .iter()
            .map(|&ptr| unsafe { CStr::from_ptr(ptr) })
            .collect();
        assert_eq!(names, vec![khr::Surface::name(), vk::ExtHeadlessSurfaceFn::name()]);
    }

    #[test]
    fn test_win32_target_carries_handles() {
        let hwnd = 0x1234 as *mut c_void;
        let hinstance = 0x5678 as *mut c_void;
        match SurfaceTarget::win32(hwnd, hinstance) {
            SurfaceTarget::Native {
                display: RawDisplayHandle::Windows(_),
                window: RawWindowHandle::Win32(window),
            } => {
                assert_eq!(window.hwnd, hwnd);
                assert_eq!(window.hinstance, hinstance);
            }
            other => panic!("unexpected target {other:?}"),
        }
    }
}

//! Vulkan context management
//!
//! Error taxonomy shared by every Vulkan component, plus the instance wrapper
//! that owns the loaded entry points.

use ash::{vk, Entry, Instance};
use std::ffi::{c_char, CStr, CString};
use thiserror::Error;

use crate::foundation::logging::{debug, info};
use crate::lifecycle::ObjectManagerError;

/// Vulkan-specific error types
#[derive(Error, Debug)]
pub enum VulkanError {
    /// General Vulkan API error with result code
    #[error("Vulkan API error: {0:?}")]
    Api(vk::Result),

    /// Vulkan context initialization failed
    #[error("Initialization failed: {0}")]
    InitializationFailed(String),

    /// The environment lacks a capability the engine requires
    #[error("Missing capability: {capability}")]
    MissingCapability {
        /// What is missing (queue role, extension, memory type, ...)
        capability: String,
    },

    /// Invalid operation attempted
    #[error("Invalid operation: {reason}")]
    InvalidOperation {
        /// Description of why the operation is invalid
        reason: String,
    },

    /// A fence wait exceeded its timeout
    #[error("Fence wait timed out after {timeout_ns} ns")]
    FenceTimeout {
        /// Timeout that elapsed
        timeout_ns: u64,
    },

    /// The logical device was lost
    #[error("Device lost")]
    DeviceLost,

    /// No suitable memory type found for allocation
    #[error("No suitable memory type found")]
    NoSuitableMemoryType,

    /// Memory allocation failed
    #[error("Out of memory: {requested} bytes")]
    OutOfMemory {
        /// Number of bytes that were requested
        requested: u64,
    },

    /// Lifecycle manager misuse
    #[error(transparent)]
    Lifecycle(#[from] ObjectManagerError),
}

impl VulkanError {
    /// Fatal misuse
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidOperation {
            reason: reason.into(),
        }
    }

    /// Environment failure naming the missing capability
    pub fn missing(capability: impl Into<String>) -> Self {
        Self::MissingCapability {
            capability: capability.into(),
        }
    }

    /// Map the result of a fence wait, keeping timeouts distinct from device loss
    pub fn from_fence_wait(result: vk::Result, timeout_ns: u64) -> Self {
        match result {
            vk::Result::TIMEOUT => Self::FenceTimeout { timeout_ns },
            other => Self::from(other),
        }
    }

    /// Whether this is a transient GPU condition rather than misuse or setup failure
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::FenceTimeout { .. } | Self::DeviceLost)
    }
}

impl From<vk::Result> for VulkanError {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_DEVICE_LOST => Self::DeviceLost,
            other => Self::Api(other),
        }
    }
}

/// Result type for Vulkan operations
pub type VulkanResult<T> = Result<T, VulkanError>;

/// Vulkan instance wrapper with RAII cleanup
pub struct VulkanInstance {
    /// Vulkan entry point
    pub entry: Entry,
    /// Vulkan instance handle
    pub instance: Instance,
}

impl VulkanInstance {
    /// Load the Vulkan loader library
    pub fn load_entry() -> VulkanResult<Entry> {
        unsafe { Entry::load() }
            .map_err(|e| VulkanError::InitializationFailed(format!("Failed to load Vulkan: {e}")))
    }

    /// Create an instance with the given extensions and layers
    ///
    /// Every requested extension is checked against the loader first so a
    /// missing one is reported by name.
    pub fn new(
        entry: Entry,
        app_name: &str,
        extensions: &[*const c_char],
        layers: &[&CStr],
    ) -> VulkanResult<Self> {
        let available = unsafe { entry.enumerate_instance_extension_properties(None) }
            .map_err(VulkanError::from)?;
        for &required in extensions {
            let required = unsafe { CStr::from_ptr(required) };
            let present = available.iter().any(|ext| {
                (unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) }) == required
            });
            if !present {
                return Err(VulkanError::missing(format!(
                    "instance extension {}",
                    required.to_string_lossy()
                )));
            }
        }

        let app_name_cstr = CString::new(app_name).map_err(|_| {
            VulkanError::InitializationFailed("Application name contains a NUL byte".to_string())
        })?;
        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 1, 0, 0))
            .engine_name(crate::ENGINE_NAME)
            .engine_version(vk::make_api_version(0, 1, 0, 0))
            .api_version(vk::API_VERSION_1_0);

        let layer_ptrs: Vec<*const c_char> = layers.iter().map(|layer| layer.as_ptr()).collect();
        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(extensions)
            .enabled_layer_names(&layer_ptrs);

        let instance = unsafe { entry.create_instance(&create_info, None) }.map_err(|e| match e {
            vk::Result::ERROR_EXTENSION_NOT_PRESENT => {
                VulkanError::missing("requested instance extension")
            }
            vk::Result::ERROR_LAYER_NOT_PRESENT => VulkanError::missing("requested instance layer"),
            vk::Result::ERROR_INCOMPATIBLE_DRIVER => {
                VulkanError::missing("Vulkan 1.0 compatible driver")
            }
            other => VulkanError::from(other),
        })?;

        info!(
            "Created Vulkan instance for '{}' ({} extensions, {} layers)",
            app_name,
            extensions.len(),
            layers.len()
        );

        Ok(Self { entry, instance })
    }
}

impl Drop for VulkanInstance {
    fn drop(&mut self) {
        debug!("Destroying Vulkan instance");
        unsafe {
            self.instance.destroy_instance(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_lost_mapping() {
        assert!(matches!(
            VulkanError::from(vk::Result::ERROR_DEVICE_LOST),
            VulkanError::DeviceLost
        ));
        assert!(matches!(
            VulkanError::from(vk::Result::ERROR_INITIALIZATION_FAILED),
            VulkanError::Api(vk::Result::ERROR_INITIALIZATION_FAILED)
        ));
    }

    #[test]
    fn test_fence_wait_mapping() {
        assert!(matches!(
            VulkanError::from_fence_wait(vk::Result::TIMEOUT, 500),
            VulkanError::FenceTimeout { timeout_ns: 500 }
        ));
        assert!(matches!(
            VulkanError::from_fence_wait(vk::Result::ERROR_DEVICE_LOST, 500),
            VulkanError::DeviceLost
        ));
        assert!(VulkanError::DeviceLost.is_transient());
        assert!(!VulkanError::invalid("double allocation").is_transient());
    }

    #[test]
    fn test_lifecycle_error_conversion() {
        let error: VulkanError = ObjectManagerError::SlotEmpty { slot: "device" }.into();
        assert!(matches!(error, VulkanError::Lifecycle(_)));
        assert_eq!(error.to_string(), "Slot 'device' is empty");
    }
}

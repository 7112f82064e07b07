//! Debug layer capability
//!
//! Validation is a startup decision. When it is off, or the layer is not
//! installed, the engine holds a [`NoDebugLayer`] behind the same trait so the
//! rest of the bring-up never branches on build configuration.

use ash::extensions::ext::DebugUtils;
use ash::{vk, Entry, Instance};
use std::ffi::CStr;

use super::context::{VulkanError, VulkanResult};
use crate::foundation::logging::{debug, warn};

const VALIDATION_LAYER: &CStr =
    unsafe { CStr::from_bytes_with_nul_unchecked(b"VK_LAYER_KHRONOS_validation\0") };

/// Capability interface of an optional debug subsystem
pub trait DebugLayer {
    /// Human readable name
    fn name(&self) -> &'static str;

    /// Whether driver messages are being captured
    fn is_active(&self) -> bool;

    /// Instance layers this subsystem needs enabled
    fn instance_layers(&self) -> Vec<&'static CStr>;

    /// Instance extensions this subsystem needs enabled
    fn instance_extensions(&self) -> Vec<&'static CStr>;

    /// Hook into a freshly created instance
    fn attach(&mut self, entry: &Entry, instance: &Instance) -> VulkanResult<()>;
}

/// Stand-in used when validation is disabled or unavailable
#[derive(Debug, Default)]
pub struct NoDebugLayer;

impl DebugLayer for NoDebugLayer {
    fn name(&self) -> &'static str {
        "none"
    }

    fn is_active(&self) -> bool {
        false
    }

    fn instance_layers(&self) -> Vec<&'static CStr> {
        Vec::new()
    }

    fn instance_extensions(&self) -> Vec<&'static CStr> {
        Vec::new()
    }

    fn attach(&mut self, _entry: &Entry, _instance: &Instance) -> VulkanResult<()> {
        Ok(())
    }
}

/// Khronos validation layer with a debug-utils messenger forwarding into `log`
#[derive(Default)]
pub struct ValidationLayer {
    messenger: Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>,
}

impl ValidationLayer {
    /// Create an unattached validation layer
    pub const fn new() -> Self {
        Self { messenger: None }
    }
}

impl DebugLayer for ValidationLayer {
    fn name(&self) -> &'static str {
        "VK_LAYER_KHRONOS_validation"
    }

    fn is_active(&self) -> bool {
        self.messenger.is_some()
    }

    fn instance_layers(&self) -> Vec<&'static CStr> {
        vec![VALIDATION_LAYER]
    }

    fn instance_extensions(&self) -> Vec<&'static CStr> {
        vec![DebugUtils::name()]
    }

    fn attach(&mut self, entry: &Entry, instance: &Instance) -> VulkanResult<()> {
        if self.messenger.is_some() {
            return Err(VulkanError::invalid("validation layer is already attached"));
        }

        let debug_utils = DebugUtils::new(entry, instance);
        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }
            .map_err(VulkanError::from)?;
        debug!("Validation messenger attached");
        self.messenger = Some((debug_utils, messenger));
        Ok(())
    }
}

impl Drop for ValidationLayer {
    fn drop(&mut self) {
        if let Some((debug_utils, messenger)) = self.messenger.take() {
            debug!("Destroying validation messenger");
            unsafe {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }
        }
    }
}

/// Pick the debug layer for this run
///
/// Falls back to [`NoDebugLayer`] with a warning when validation is requested
/// but the layer or the debug-utils extension is not installed.
pub fn select_debug_layer(entry: &Entry, requested: bool) -> Box<dyn DebugLayer> {
    if !requested {
        return Box::new(NoDebugLayer);
    }

    let layer_installed = unsafe { entry.enumerate_instance_layer_properties() }
        .map(|layers| {
            layers.iter().any(|layer| {
                (unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) }) == VALIDATION_LAYER
            })
        })
        .unwrap_or(false);
    let extension_installed = unsafe { entry.enumerate_instance_extension_properties(None) }
        .map(|extensions| {
            extensions.iter().any(|ext| {
                (unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) }) == DebugUtils::name()
            })
        })
        .unwrap_or(false);

    if layer_installed && extension_installed {
        Box::new(ValidationLayer::new())
    } else {
        warn!("Validation requested but VK_LAYER_KHRONOS_validation is unavailable; continuing without it");
        Box::new(NoDebugLayer)
    }
}

/// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    if callback_data.is_null() || (*callback_data).p_message.is_null() {
        return vk::FALSE;
    }
    let message = CStr::from_ptr((*callback_data).p_message).to_string_lossy();

    if message_severity >= vk::DebugUtilsMessageSeverityFlagsEXT::ERROR {
        log::error!("[Vulkan] {:?} - {}", message_type, message);
    } else if message_severity >= vk::DebugUtilsMessageSeverityFlagsEXT::WARNING {
        log::warn!("[Vulkan] {:?} - {}", message_type, message);
    } else {
        log::debug!("[Vulkan] {:?} - {}", message_type, message);
    }

    vk::FALSE
}

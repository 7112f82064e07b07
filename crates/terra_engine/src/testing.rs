//! Device-backed test helpers

use std::ffi::{c_char, c_void};
use std::io::Write;

use ash::vk;

use crate::config::RendererConfig;
use crate::foundation::logging::{self, warn};
use crate::vulkan::{SurfaceTarget, VulkanResult};
use crate::Terra;

/// Set to make a missing Vulkan device fail device-backed tests instead of skipping them
pub const REQUIRE_DEVICE_ENV: &str = "TERRA_REQUIRE_DEVICE";

/// Bring up a validation-free engine on the first usable GPU
///
/// Instance, device, allocator and every frame ring are initialised; with
/// `with_surface` a headless surface is created first. Returns `None` when no
/// driver (or no headless surface support) is available so the calling test
/// can skip. The skip is written straight to stderr, past the test harness
/// capture, so a driverless run is visible in the output. With
/// [`REQUIRE_DEVICE_ENV`] set, a failed bring-up panics instead.
pub fn headless_terra(frames_in_flight: u32, with_surface: bool) -> Option<Terra> {
    logging::init("warn");

    let config = RendererConfig::new("terra-tests")
        .with_frames_in_flight(frames_in_flight)
        .with_validation(false)
        .with_extent(256, 256);
    let mut terra = Terra::new(config);
    match bring_up(&mut terra, with_surface) {
        Ok(()) => Some(terra),
        Err(error) => {
            let test = std::thread::current().name().unwrap_or("<unnamed>").to_string();
            if std::env::var_os(REQUIRE_DEVICE_ENV).is_some() {
                panic!("{test}: Vulkan bring-up failed with {REQUIRE_DEVICE_ENV} set: {error}");
            }
            warn!("Skipping device-backed test {}: {}", test, error);
            let _ = writeln!(
                std::io::stderr(),
                "SKIPPED {test}: no usable Vulkan device ({error}); set {REQUIRE_DEVICE_ENV}=1 to fail instead"
            );
            None
        }
    }
}

fn bring_up(terra: &mut Terra, with_surface: bool) -> VulkanResult<()> {
    let target = SurfaceTarget::Headless;
    if with_surface {
        terra.init_instance(Some(&target))?;
        terra.init_surface(&target)?;
    } else {
        terra.init_instance(None)?;
    }
    terra.init_device()?;
    terra.init_sync_objects()
}

unsafe extern "system" fn no_device_proc(_device: vk::Device, _name: *const c_char) -> vk::PFN_vkVoidFunction {
    None
}

/// Device dispatch table with no driver behind it
///
/// Every entry point is ash's panicking placeholder, so this only suits code
/// paths that never reach the driver (bookkeeping and validation).
pub fn driverless_device() -> ash::Device {
    let instance_fn = vk::InstanceFnV1_0::load(|name| {
        if name.to_bytes() == b"vkGetDeviceProcAddr" {
            no_device_proc as vk::PFN_vkGetDeviceProcAddr as *const c_void
        } else {
            std::ptr::null()
        }
    });
    unsafe { ash::Device::load(&instance_fn, vk::Device::null()) }
}

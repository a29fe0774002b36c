// Copyright (c) 2024 The vk-extmem developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Device bootstrap for the ownership-transfer protocol.
//!
//! [`DeviceContext`] owns the Vulkan library, instance, logical device and one
//! universal queue. It is deliberately minimal: the protocol only needs
//! transfer work on a single queue plus the physical-device query entry
//! points, so there is no surface, no swapchain and no feature negotiation
//! beyond the external-memory extension set.

use crate::VulkanError;
use ash::{vk, Device, Entry, Instance};
use std::{
    error,
    ffi::{c_char, CStr},
    fmt,
    sync::Arc,
};

/// Device extensions the ownership-transfer protocol depends on.
///
/// `VK_KHR_external_memory` is core since 1.1 but listed so the requirement is
/// visible in one place next to the extensions that actually gate support.
const REQUIRED_DEVICE_EXTENSIONS: [&CStr; 5] = [
    ash::khr::external_memory::NAME,
    ash::ext::external_memory_dma_buf::NAME,
    ash::ext::image_drm_format_modifier::NAME,
    ash::ext::queue_family_foreign::NAME,
    ash::ext::external_memory_acquire_unmodified::NAME,
];

/// An open channel of communication with a Vulkan device, scoped to what the
/// external-memory protocol needs.
///
/// All resource owners in this crate hold an `Arc<DeviceContext>` and are
/// destroyed before it; the context tears down the device and instance exactly
/// once when the last owner goes away.
pub struct DeviceContext {
    // Never read, but must outlive every loaded function pointer.
    #[allow(dead_code)]
    entry: Entry,
    instance: Instance,
    physical_device: vk::PhysicalDevice,
    device: Device,
    queue: vk::Queue,
    queue_family_index: u32,
}

impl DeviceContext {
    /// Loads the Vulkan library and opens a device suitable for the protocol.
    ///
    /// Returns a not-supported error (see
    /// [`ContextCreationError::is_not_supported`]) when there is no driver, no
    /// device with the required extensions, or the instance version is below
    /// 1.2. Those outcomes mean the environment cannot run the protocol, not
    /// that something went wrong.
    pub fn new() -> Result<Arc<DeviceContext>, ContextCreationError> {
        let entry = unsafe { Entry::load() }.map_err(ContextCreationError::LibraryLoad)?;

        let instance_version = unsafe { entry.try_enumerate_instance_version() }
            .map_err(VulkanError::from)?
            .unwrap_or(vk::API_VERSION_1_0);
        if instance_version < vk::API_VERSION_1_2 {
            return Err(ContextCreationError::UnsupportedInstanceVersion);
        }

        let application_info = vk::ApplicationInfo::default()
            .application_name(c"vk-extmem")
            .api_version(vk::API_VERSION_1_2);
        let instance_info = vk::InstanceCreateInfo::default().application_info(&application_info);
        let instance = unsafe { entry.create_instance(&instance_info, None) }
            .map_err(VulkanError::from)?;

        match Self::open_device(&instance) {
            Ok((physical_device, device, queue, queue_family_index)) => Ok(Arc::new(DeviceContext {
                entry,
                instance,
                physical_device,
                device,
                queue,
                queue_family_index,
            })),
            Err(err) => {
                unsafe { instance.destroy_instance(None) };
                Err(err)
            }
        }
    }

    fn open_device(
        instance: &Instance,
    ) -> Result<(vk::PhysicalDevice, Device, vk::Queue, u32), ContextCreationError> {
        let physical_devices = unsafe { instance.enumerate_physical_devices() }
            .map_err(VulkanError::from)?;

        for physical_device in physical_devices {
            let properties = unsafe { instance.get_physical_device_properties(physical_device) };
            if properties.api_version < vk::API_VERSION_1_2 {
                continue;
            }
            if !Self::supports_required_extensions(instance, physical_device)? {
                continue;
            }
            let Some(queue_family_index) = Self::find_queue_family(instance, physical_device)
            else {
                continue;
            };

            let priorities = [1.0];
            let queue_infos = [vk::DeviceQueueCreateInfo::default()
                .queue_family_index(queue_family_index)
                .queue_priorities(&priorities)];
            let extension_names: Vec<*const c_char> = REQUIRED_DEVICE_EXTENSIONS
                .iter()
                .map(|name| name.as_ptr())
                .collect();
            let device_info = vk::DeviceCreateInfo::default()
                .queue_create_infos(&queue_infos)
                .enabled_extension_names(&extension_names);

            let device = unsafe { instance.create_device(physical_device, &device_info, None) }
                .map_err(VulkanError::from)?;
            let queue = unsafe { device.get_device_queue(queue_family_index, 0) };

            let device_name = properties
                .device_name_as_c_str()
                .unwrap_or(c"unknown")
                .to_string_lossy()
                .into_owned();
            tracing::info!(device = %device_name, queue_family_index, "opened device");

            return Ok((physical_device, device, queue, queue_family_index));
        }

        Err(ContextCreationError::NoSuitableDevice)
    }

    fn supports_required_extensions(
        instance: &Instance,
        physical_device: vk::PhysicalDevice,
    ) -> Result<bool, ContextCreationError> {
        let available = unsafe { instance.enumerate_device_extension_properties(physical_device) }
            .map_err(VulkanError::from)?;
        Ok(REQUIRED_DEVICE_EXTENSIONS.iter().all(|required| {
            available.iter().any(|extension| {
                extension.extension_name_as_c_str() == Ok(*required)
            })
        }))
    }

    /// The protocol is transfer-only, but a graphics queue is preferred since
    /// it is the "universal" queue on every driver this has been run against.
    fn find_queue_family(
        instance: &Instance,
        physical_device: vk::PhysicalDevice,
    ) -> Option<u32> {
        let families =
            unsafe { instance.get_physical_device_queue_family_properties(physical_device) };
        let graphics = families
            .iter()
            .position(|family| family.queue_flags.contains(vk::QueueFlags::GRAPHICS));
        let transfer = families
            .iter()
            .position(|family| family.queue_flags.contains(vk::QueueFlags::TRANSFER));
        graphics.or(transfer).map(|index| index as u32)
    }

    /// Submits one command buffer to the universal queue and blocks until the
    /// device has finished executing it.
    ///
    /// This is the only submission path in the crate. Trading throughput for
    /// determinism keeps every ownership transition fully ordered with respect
    /// to the host.
    pub fn submit_and_wait(&self, command_buffer: vk::CommandBuffer) -> Result<(), VulkanError> {
        let fence = unsafe { self.device.create_fence(&vk::FenceCreateInfo::default(), None) }?;
        let command_buffers = [command_buffer];
        let submit_info = vk::SubmitInfo::default().command_buffers(&command_buffers);
        let result = unsafe { self.device.queue_submit(self.queue, &[submit_info], fence) }
            .and_then(|_| unsafe { self.device.wait_for_fences(&[fence], true, u64::MAX) });
        unsafe { self.device.destroy_fence(fence, None) };
        result.map_err(VulkanError::from)
    }

    /// Per-type and per-heap memory properties of the physical device.
    pub fn memory_properties(&self) -> vk::PhysicalDeviceMemoryProperties {
        unsafe {
            self.instance
                .get_physical_device_memory_properties(self.physical_device)
        }
    }

    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn queue_family_index(&self) -> u32 {
        self.queue_family_index
    }
}

impl fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceContext")
            .field("physical_device", &self.physical_device)
            .field("queue_family_index", &self.queue_family_index)
            .finish_non_exhaustive()
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        unsafe { self.device.destroy_device(None) };
        unsafe { self.instance.destroy_instance(None) };
        // `entry` is dropped last, keeping the library loaded until here.
    }
}

/// Error that can happen when opening a [`DeviceContext`].
#[derive(Debug)]
pub enum ContextCreationError {
    /// The Vulkan library could not be loaded.
    LibraryLoad(ash::LoadingError),
    /// The instance does not support Vulkan 1.2.
    UnsupportedInstanceVersion,
    /// No physical device supports the required extensions and queues.
    NoSuitableDevice,
    /// The Vulkan implementation returned an error.
    Vulkan(VulkanError),
}

impl ContextCreationError {
    /// Whether the error means "this environment cannot run the protocol",
    /// as opposed to a genuine device failure. Callers running against
    /// arbitrary machines should treat such outcomes as a skip.
    pub fn is_not_supported(&self) -> bool {
        match self {
            ContextCreationError::LibraryLoad(_)
            | ContextCreationError::UnsupportedInstanceVersion
            | ContextCreationError::NoSuitableDevice => true,
            ContextCreationError::Vulkan(VulkanError::IncompatibleDriver) => true,
            ContextCreationError::Vulkan(_) => false,
        }
    }
}

impl error::Error for ContextCreationError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            ContextCreationError::LibraryLoad(err) => Some(err),
            ContextCreationError::Vulkan(err) => Some(err),
            _ => None,
        }
    }
}

impl fmt::Display for ContextCreationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextCreationError::LibraryLoad(_) => {
                write!(f, "the Vulkan library could not be loaded")
            }
            ContextCreationError::UnsupportedInstanceVersion => {
                write!(f, "the instance does not support Vulkan 1.2")
            }
            ContextCreationError::NoSuitableDevice => {
                write!(f, "no device supports the required external-memory extensions")
            }
            ContextCreationError::Vulkan(err) => write!(f, "{}", err),
        }
    }
}

impl From<VulkanError> for ContextCreationError {
    fn from(err: VulkanError) -> ContextCreationError {
        ContextCreationError::Vulkan(err)
    }
}

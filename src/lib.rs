// Copyright (c) 2024 The vk-extmem developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! External-memory image sharing for Vulkan.
//!
//! This crate implements the two pieces needed to hand a device-memory-backed
//! image to a consumer outside the current Vulkan instance and take it back
//! without corrupting its content:
//!
//! - **Format-modifier negotiation**: discovering which DRM format modifiers a
//!   device supports for a given format and usage, and filtering them down to
//!   those that can actually be imported and exported through an external
//!   memory handle ([`memory::modifier`]).
//!
//! - **Queue-family ownership transfer**: the release/acquire barrier protocol
//!   that moves an [`image::ExternalImage`] between the local queue family and
//!   the foreign-queue sentinel, including the `VK_EXT_external_memory_acquire_unmodified`
//!   fast path where the consumer asserts that the memory content is unchanged
//!   since the last release ([`protocol::ForeignHandoff`]).
//!
//! Everything is driven synchronously: each protocol phase is a single
//! command-buffer submission that blocks until device completion, so state
//! transitions are deterministic and easy to diagnose.
//!
//! Unsupported format/modifier/memory-type combinations surface as dedicated
//! not-supported error variants before any resource is created; they are an
//! environment limitation, not a failure. Device errors during creation or
//! submission are propagated as [`VulkanError`].

use ash::vk;
use std::{error, fmt};

pub mod buffer;
pub mod context;
pub mod format;
pub mod image;
pub mod memory;
pub mod pixel;
pub mod protocol;
pub mod sync;

/// Represents memory size and offset values on a Vulkan device.
pub use ash::vk::DeviceSize;

/// Error reported by the Vulkan implementation itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum VulkanError {
    /// There is no memory available on the host.
    OutOfHostMemory,
    /// There is no memory available on the device.
    OutOfDeviceMemory,
    /// Initialization of an object failed for implementation-specific reasons.
    InitializationFailed,
    /// The logical or physical device has been lost.
    DeviceLost,
    /// Mapping of a memory object has failed.
    MemoryMapFailed,
    /// The installed driver is incompatible with the requested API version.
    IncompatibleDriver,
    /// The requested format is not supported by the device.
    FormatNotSupported,
    /// The requested DRM format modifier plane layout is invalid.
    InvalidDrmFormatModifierPlaneLayout,
    /// A return code this crate has no dedicated variant for.
    Unexpected(vk::Result),
}

impl From<vk::Result> for VulkanError {
    fn from(result: vk::Result) -> VulkanError {
        match result {
            vk::Result::ERROR_OUT_OF_HOST_MEMORY => VulkanError::OutOfHostMemory,
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => VulkanError::OutOfDeviceMemory,
            vk::Result::ERROR_INITIALIZATION_FAILED => VulkanError::InitializationFailed,
            vk::Result::ERROR_DEVICE_LOST => VulkanError::DeviceLost,
            vk::Result::ERROR_MEMORY_MAP_FAILED => VulkanError::MemoryMapFailed,
            vk::Result::ERROR_INCOMPATIBLE_DRIVER => VulkanError::IncompatibleDriver,
            vk::Result::ERROR_FORMAT_NOT_SUPPORTED => VulkanError::FormatNotSupported,
            vk::Result::ERROR_INVALID_DRM_FORMAT_MODIFIER_PLANE_LAYOUT_EXT => {
                VulkanError::InvalidDrmFormatModifierPlaneLayout
            }
            other => VulkanError::Unexpected(other),
        }
    }
}

impl error::Error for VulkanError {}

impl fmt::Display for VulkanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VulkanError::OutOfHostMemory => write!(f, "no memory available on the host"),
            VulkanError::OutOfDeviceMemory => write!(f, "no memory available on the device"),
            VulkanError::InitializationFailed => write!(f, "initialization failed"),
            VulkanError::DeviceLost => write!(f, "the device has been lost"),
            VulkanError::MemoryMapFailed => write!(f, "memory mapping failed"),
            VulkanError::IncompatibleDriver => write!(f, "the driver is incompatible"),
            VulkanError::FormatNotSupported => write!(f, "the format is not supported"),
            VulkanError::InvalidDrmFormatModifierPlaneLayout => {
                write!(f, "the DRM format modifier plane layout is invalid")
            }
            VulkanError::Unexpected(result) => write!(f, "unexpected error: {:?}", result),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vulkan_error_from_raw_result() {
        assert_eq!(
            VulkanError::from(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY),
            VulkanError::OutOfDeviceMemory,
        );
        assert_eq!(
            VulkanError::from(vk::Result::ERROR_FORMAT_NOT_SUPPORTED),
            VulkanError::FormatNotSupported,
        );
        assert_eq!(
            VulkanError::from(vk::Result::ERROR_FRAGMENTED_POOL),
            VulkanError::Unexpected(vk::Result::ERROR_FRAGMENTED_POOL),
        );
    }
}

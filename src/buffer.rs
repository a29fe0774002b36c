// Copyright (c) 2024 The vk-extmem developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Host-visible staging buffers.

use crate::{
    context::DeviceContext,
    memory::{choose_memory_type, MemoryTypeFilter},
    VulkanError,
};
use ash::vk;
use std::{error, fmt, slice, sync::Arc};

/// A buffer backed by host-visible memory, persistently mapped.
///
/// Used for the host side of every transfer: gradient fills go in through
/// [`Self::mapped_mut`] followed by [`Self::flush`], readback comes out
/// through [`Self::invalidate`] followed by [`Self::mapped`]. Skipping either
/// step on a non-coherent memory type reads or writes stale data, so the
/// protocol calls them at every transition boundary regardless of coherency
/// (they are no-ops for coherent types).
pub struct HostBuffer {
    context: Arc<DeviceContext>,
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    size: vk::DeviceSize,
    ptr: *mut u8,
}

impl HostBuffer {
    /// Creates a buffer of `size` bytes with the given usage, binds
    /// host-visible memory to it at offset 0 and maps the whole range.
    pub fn new(
        context: &Arc<DeviceContext>,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
    ) -> Result<HostBuffer, HostBufferCreationError> {
        assert!(size > 0, "buffers must not be empty");

        let device = context.device();
        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer =
            unsafe { device.create_buffer(&buffer_info, None) }.map_err(VulkanError::from)?;

        match Self::allocate_bind_and_map(context, buffer) {
            Ok((memory, ptr)) => Ok(HostBuffer {
                context: context.clone(),
                buffer,
                memory,
                size,
                ptr,
            }),
            Err(err) => {
                unsafe { device.destroy_buffer(buffer, None) };
                Err(err)
            }
        }
    }

    fn allocate_bind_and_map(
        context: &Arc<DeviceContext>,
        buffer: vk::Buffer,
    ) -> Result<(vk::DeviceMemory, *mut u8), HostBufferCreationError> {
        let device = context.device();
        let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };

        let filter = MemoryTypeFilter {
            allowed_types: requirements.memory_type_bits,
            required_properties: vk::MemoryPropertyFlags::HOST_VISIBLE,
            preferred_properties: vk::MemoryPropertyFlags::empty(),
        };
        let memory_type_index = choose_memory_type(&context.memory_properties(), &filter)
            .ok_or(HostBufferCreationError::NoSuitableMemoryType)?;

        let allocate_info = vk::MemoryAllocateInfo::default()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index);
        let memory = unsafe { device.allocate_memory(&allocate_info, None) }
            .map_err(VulkanError::from)?;

        let bind_and_map = || -> Result<*mut u8, VulkanError> {
            unsafe { device.bind_buffer_memory(buffer, memory, 0) }?;
            let ptr = unsafe {
                device.map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
            }?;
            Ok(ptr.cast())
        };
        match bind_and_map() {
            Ok(ptr) => Ok((memory, ptr)),
            Err(err) => {
                unsafe { device.free_memory(memory, None) };
                Err(err.into())
            }
        }
    }

    pub fn buffer(&self) -> vk::Buffer {
        self.buffer
    }

    /// Size in bytes.
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    /// The mapped content. Call [`Self::invalidate`] first when the device
    /// wrote it since the last host read.
    pub fn mapped(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.ptr, self.size as usize) }
    }

    /// The mapped content, writable. Call [`Self::flush`] afterwards so the
    /// device sees the writes.
    pub fn mapped_mut(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.ptr, self.size as usize) }
    }

    /// Makes host writes visible to the device.
    pub fn flush(&self) -> Result<(), VulkanError> {
        let range = vk::MappedMemoryRange::default()
            .memory(self.memory)
            .offset(0)
            .size(vk::WHOLE_SIZE);
        unsafe { self.context.device().flush_mapped_memory_ranges(&[range]) }
            .map_err(VulkanError::from)
    }

    /// Makes device writes visible to the host.
    pub fn invalidate(&self) -> Result<(), VulkanError> {
        let range = vk::MappedMemoryRange::default()
            .memory(self.memory)
            .offset(0)
            .size(vk::WHOLE_SIZE);
        unsafe {
            self.context
                .device()
                .invalidate_mapped_memory_ranges(&[range])
        }
        .map_err(VulkanError::from)
    }
}

impl fmt::Debug for HostBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostBuffer")
            .field("buffer", &self.buffer)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

impl Drop for HostBuffer {
    fn drop(&mut self) {
        let device = self.context.device();
        unsafe { device.unmap_memory(self.memory) };
        unsafe { device.destroy_buffer(self.buffer, None) };
        unsafe { device.free_memory(self.memory, None) };
    }
}

/// Error that can happen when creating a [`HostBuffer`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HostBufferCreationError {
    /// No host-visible memory type accepts the buffer.
    NoSuitableMemoryType,
    /// The Vulkan implementation returned an error.
    Vulkan(VulkanError),
}

impl error::Error for HostBufferCreationError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            HostBufferCreationError::Vulkan(err) => Some(err),
            _ => None,
        }
    }
}

impl fmt::Display for HostBufferCreationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostBufferCreationError::NoSuitableMemoryType => {
                write!(f, "no suitable host-visible memory type")
            }
            HostBufferCreationError::Vulkan(err) => write!(f, "{}", err),
        }
    }
}

impl From<VulkanError> for HostBufferCreationError {
    fn from(err: VulkanError) -> HostBufferCreationError {
        HostBufferCreationError::Vulkan(err)
    }
}

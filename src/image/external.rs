// Copyright (c) 2024 The vk-extmem developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use crate::{
    context::DeviceContext,
    image::ExternalHandleKind,
    memory::{choose_memory_type, compatible_modifiers, DrmFormatModifier, MemoryTypeFilter},
    VulkanError,
};
use ash::vk;
use smallvec::SmallVec;
use std::{error, fmt, sync::Arc};

/// A 2D image plus the device memory bound to it at offset 0, created for
/// sharing through an external memory handle.
///
/// Ownership is singular: the pair is move-only and the only thing exposed is
/// a read-only accessor to the image handle. There is no rebinding and no
/// re-creation; a new iteration creates a new `ExternalImage`.
///
/// The image is created with DRM-format-modifier tiling, declaring the full
/// set of modifiers that survived the compatibility check, and the driver
/// picks one of them. Layout transitions and queue-family ownership are the
/// caller's responsibility (see [`crate::protocol::ForeignHandoff`]).
pub struct ExternalImage {
    context: Arc<DeviceContext>,
    image: vk::Image,
    memory: vk::DeviceMemory,
    format: vk::Format,
    extent: vk::Extent3D,
    handle_kind: ExternalHandleKind,
}

impl ExternalImage {
    /// The fixed usage of every external image: transfer in both directions,
    /// nothing else.
    pub const USAGE: vk::ImageUsageFlags = vk::ImageUsageFlags::from_raw(
        vk::ImageUsageFlags::TRANSFER_SRC.as_raw() | vk::ImageUsageFlags::TRANSFER_DST.as_raw(),
    );

    /// Format features a modifier must support to be usable with [`Self::USAGE`].
    pub const REQUIRED_FORMAT_FEATURES: vk::FormatFeatureFlags = vk::FormatFeatureFlags::from_raw(
        vk::FormatFeatureFlags::TRANSFER_SRC.as_raw()
            | vk::FormatFeatureFlags::TRANSFER_DST.as_raw(),
    );

    /// The single color subresource every external image consists of.
    pub const SUBRESOURCE_RANGE: vk::ImageSubresourceRange = vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    };

    /// Creates an image compatible with `handle_kind` and binds fresh device
    /// memory to it.
    ///
    /// The compatible-modifier set is computed first; if it is empty, this
    /// returns [`ExternalImageCreationError::NoCompatibleModifier`] before any
    /// image-create call is made.
    ///
    /// # Panics
    ///
    /// Panics if `extent.depth != 1`. Only 2D images are supported; a 3D
    /// extent is a logic defect in the caller, not an environment limitation.
    pub fn new(
        context: &Arc<DeviceContext>,
        format: vk::Format,
        extent: vk::Extent3D,
        handle_kind: ExternalHandleKind,
    ) -> Result<ExternalImage, ExternalImageCreationError> {
        assert_eq!(extent.depth, 1, "only 2D images are supported");

        let modifiers = compatible_modifiers(
            context.instance(),
            context.physical_device(),
            format,
            extent,
            handle_kind,
        )?;
        if modifiers.is_empty() {
            return Err(ExternalImageCreationError::NoCompatibleModifier);
        }

        Self::with_modifiers(context, format, extent, handle_kind, &modifiers)
    }

    /// Like [`Self::new`], but with a caller-chosen modifier list. Useful to
    /// pin the image to a single modifier when iterating over candidates.
    ///
    /// # Panics
    ///
    /// Panics if `extent.depth != 1` or if `modifiers` is empty. The caller
    /// is responsible for only passing modifiers that passed the
    /// compatibility check.
    pub fn with_modifiers(
        context: &Arc<DeviceContext>,
        format: vk::Format,
        extent: vk::Extent3D,
        handle_kind: ExternalHandleKind,
        modifiers: &[DrmFormatModifier],
    ) -> Result<ExternalImage, ExternalImageCreationError> {
        assert_eq!(extent.depth, 1, "only 2D images are supported");
        assert!(!modifiers.is_empty(), "the modifier list must not be empty");

        let device = context.device();
        let raw_modifiers: SmallVec<[u64; 8]> =
            modifiers.iter().map(|modifier| modifier.0).collect();

        let mut modifier_info = vk::ImageDrmFormatModifierListCreateInfoEXT::default()
            .drm_format_modifiers(&raw_modifiers);
        let mut external_info =
            vk::ExternalMemoryImageCreateInfo::default().handle_types(handle_kind.handle_type());
        let create_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(extent)
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::DRM_FORMAT_MODIFIER_EXT)
            .usage(Self::USAGE)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .push_next(&mut external_info)
            .push_next(&mut modifier_info);

        let image =
            unsafe { device.create_image(&create_info, None) }.map_err(VulkanError::from)?;

        match Self::allocate_and_bind(context, image) {
            Ok(memory) => Ok(ExternalImage {
                context: context.clone(),
                image,
                memory,
                format,
                extent,
                handle_kind,
            }),
            Err(err) => {
                // Partial construction must not leak the image.
                unsafe { device.destroy_image(image, None) };
                Err(err)
            }
        }
    }

    fn allocate_and_bind(
        context: &Arc<DeviceContext>,
        image: vk::Image,
    ) -> Result<vk::DeviceMemory, ExternalImageCreationError> {
        let device = context.device();

        let requirements_info = vk::ImageMemoryRequirementsInfo2::default().image(image);
        let mut dedicated_requirements = vk::MemoryDedicatedRequirements::default();
        let mut requirements =
            vk::MemoryRequirements2::default().push_next(&mut dedicated_requirements);
        unsafe { device.get_image_memory_requirements2(&requirements_info, &mut requirements) };
        let memory_requirements = requirements.memory_requirements;
        let requires_dedicated =
            dedicated_requirements.requires_dedicated_allocation != vk::FALSE;

        let filter = MemoryTypeFilter {
            allowed_types: memory_requirements.memory_type_bits,
            required_properties: vk::MemoryPropertyFlags::empty(),
            preferred_properties: vk::MemoryPropertyFlags::DEVICE_LOCAL,
        };
        let memory_type_index = choose_memory_type(&context.memory_properties(), &filter)
            .ok_or(ExternalImageCreationError::NoSuitableMemoryType)?;
        tracing::debug!(
            memory_type_index,
            size = memory_requirements.size,
            requires_dedicated,
            "allocating external image memory"
        );

        let mut dedicated_info = vk::MemoryDedicatedAllocateInfo::default().image(image);
        let mut allocate_info = vk::MemoryAllocateInfo::default()
            .allocation_size(memory_requirements.size)
            .memory_type_index(memory_type_index);
        if requires_dedicated {
            // Only attach the hint when the device reported it is required.
            allocate_info = allocate_info.push_next(&mut dedicated_info);
        }

        let memory = unsafe { device.allocate_memory(&allocate_info, None) }
            .map_err(VulkanError::from)?;
        if let Err(err) = unsafe { device.bind_image_memory(image, memory, 0) } {
            unsafe { device.free_memory(memory, None) };
            return Err(VulkanError::from(err).into());
        }
        Ok(memory)
    }

    /// The underlying image handle. Read-only; the image stays alive for as
    /// long as `self` does.
    pub fn image(&self) -> vk::Image {
        self.image
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn extent(&self) -> vk::Extent3D {
        self.extent
    }

    pub fn handle_kind(&self) -> ExternalHandleKind {
        self.handle_kind
    }
}

impl fmt::Debug for ExternalImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExternalImage")
            .field("image", &self.image)
            .field("format", &self.format)
            .field("extent", &self.extent)
            .field("handle_kind", &self.handle_kind)
            .finish_non_exhaustive()
    }
}

impl Drop for ExternalImage {
    fn drop(&mut self) {
        let device = self.context.device();
        unsafe { device.free_memory(self.memory, None) };
        unsafe { device.destroy_image(self.image, None) };
    }
}

/// Error that can happen when creating an [`ExternalImage`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExternalImageCreationError {
    /// No DRM format modifier is both supported for the format/extent and
    /// importable through the handle kind. A not-supported outcome.
    NoCompatibleModifier,
    /// No memory type satisfies the image's requirements. A not-supported
    /// outcome.
    NoSuitableMemoryType,
    /// The Vulkan implementation returned an error.
    Vulkan(VulkanError),
}

impl ExternalImageCreationError {
    /// Whether the error means the device cannot support this image at all,
    /// as opposed to a device failure while creating it.
    pub fn is_not_supported(&self) -> bool {
        !matches!(self, ExternalImageCreationError::Vulkan(_))
    }
}

impl error::Error for ExternalImageCreationError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            ExternalImageCreationError::Vulkan(err) => Some(err),
            _ => None,
        }
    }
}

impl fmt::Display for ExternalImageCreationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExternalImageCreationError::NoCompatibleModifier => {
                write!(f, "no compatible DRM format modifier")
            }
            ExternalImageCreationError::NoSuitableMemoryType => {
                write!(f, "no suitable memory type for the image")
            }
            ExternalImageCreationError::Vulkan(err) => write!(f, "{}", err),
        }
    }
}

impl From<VulkanError> for ExternalImageCreationError {
    fn from(err: VulkanError) -> ExternalImageCreationError {
        ExternalImageCreationError::Vulkan(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_supported_classification() {
        assert!(ExternalImageCreationError::NoCompatibleModifier.is_not_supported());
        assert!(ExternalImageCreationError::NoSuitableMemoryType.is_not_supported());
        assert!(!ExternalImageCreationError::Vulkan(VulkanError::DeviceLost).is_not_supported());
    }

    #[test]
    fn fixed_usage_is_transfer_only() {
        assert!(ExternalImage::USAGE.contains(vk::ImageUsageFlags::TRANSFER_SRC));
        assert!(ExternalImage::USAGE.contains(vk::ImageUsageFlags::TRANSFER_DST));
        assert!(!ExternalImage::USAGE.contains(vk::ImageUsageFlags::SAMPLED));
    }
}

// Copyright (c) 2024 The vk-extmem developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! DRM format-modifier discovery and compatibility checking.
//!
//! A format modifier names a device-specific memory layout for image data.
//! Two drivers can only share an image if they agree on one, so before an
//! external image is created the catalog of modifiers the device reports for
//! the format is narrowed down to those that the device can also import and
//! export through the chosen external-memory handle.
//!
//! None of the functions here create or bind resources; they only read
//! physical-device properties and are safe to call any number of times.

use crate::{image::ExternalHandleKind, VulkanError};
use ash::{vk, Instance};
use smallvec::SmallVec;
use std::fmt;

/// Opaque 64-bit identifier for a device-specific image memory layout.
///
/// Only meaningful together with the (format, usage) pair it was queried for.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct DrmFormatModifier(pub u64);

impl fmt::Debug for DrmFormatModifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DrmFormatModifier({:#018x})", self.0)
    }
}

impl fmt::Display for DrmFormatModifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

/// What the device reports about one modifier for a given format.
#[derive(Clone, Copy, Debug)]
pub struct DrmFormatModifierProperties {
    pub modifier: DrmFormatModifier,
    pub plane_count: u32,
    /// Format features supported when an image uses this modifier.
    pub tiling_features: vk::FormatFeatureFlags,
}

/// Returns everything the device reports about the modifiers of `format`.
///
/// The order is device-defined and not guaranteed stable across calls. An
/// unsupported format yields an empty vector, not an error.
///
/// This wraps the usual count-then-fill query pair behind a single call.
pub fn list_modifier_properties(
    instance: &Instance,
    physical_device: vk::PhysicalDevice,
    format: vk::Format,
) -> Vec<DrmFormatModifierProperties> {
    let mut modifier_list = vk::DrmFormatModifierPropertiesListEXT::default();
    let mut format_properties = vk::FormatProperties2::default().push_next(&mut modifier_list);
    unsafe {
        instance.get_physical_device_format_properties2(
            physical_device,
            format,
            &mut format_properties,
        )
    };
    let count = modifier_list.drm_format_modifier_count as usize;
    if count == 0 {
        return Vec::new();
    }

    let mut properties = vec![vk::DrmFormatModifierPropertiesEXT::default(); count];
    let mut modifier_list = vk::DrmFormatModifierPropertiesListEXT::default()
        .drm_format_modifier_properties(&mut properties);
    let mut format_properties = vk::FormatProperties2::default().push_next(&mut modifier_list);
    unsafe {
        instance.get_physical_device_format_properties2(
            physical_device,
            format,
            &mut format_properties,
        )
    };
    let filled = modifier_list.drm_format_modifier_count as usize;
    properties.truncate(filled.min(count));

    properties
        .iter()
        .map(|properties| DrmFormatModifierProperties {
            modifier: DrmFormatModifier(properties.drm_format_modifier),
            plane_count: properties.drm_format_modifier_plane_count,
            tiling_features: properties.drm_format_modifier_tiling_features,
        })
        .collect()
}

/// Keeps the modifiers whose supported features are a superset of
/// `required_features`.
pub fn filter_by_features(
    properties: &[DrmFormatModifierProperties],
    required_features: vk::FormatFeatureFlags,
) -> SmallVec<[DrmFormatModifier; 8]> {
    properties
        .iter()
        .filter(|properties| properties.tiling_features.contains(required_features))
        .map(|properties| properties.modifier)
        .collect()
}

/// Modifiers the device supports for `format` with at least
/// `required_features`. Empty when the combination is unsupported.
pub fn list_modifiers(
    instance: &Instance,
    physical_device: vk::PhysicalDevice,
    format: vk::Format,
    required_features: vk::FormatFeatureFlags,
) -> SmallVec<[DrmFormatModifier; 8]> {
    let properties = list_modifier_properties(instance, physical_device, format);
    let modifiers = filter_by_features(&properties, required_features);
    tracing::debug!(
        ?format,
        reported = properties.len(),
        usable = modifiers.len(),
        "queried DRM format modifiers"
    );
    modifiers
}

/// Device-reported limits for one (format, modifier, handle kind) tuple.
#[derive(Clone, Copy, Debug)]
pub struct ExternalImageSupport {
    pub max_extent: vk::Extent3D,
    pub external_memory_features: vk::ExternalMemoryFeatureFlags,
}

impl ExternalImageSupport {
    /// Whether an image created with this combination can be imported through
    /// the external-memory mechanism.
    pub fn is_importable(&self) -> bool {
        self.external_memory_features
            .contains(vk::ExternalMemoryFeatureFlags::IMPORTABLE)
    }

    /// Whether `extent` stays within the reported maximum on every axis.
    pub fn admits(&self, extent: vk::Extent3D) -> bool {
        extent.width <= self.max_extent.width
            && extent.height <= self.max_extent.height
            && extent.depth <= self.max_extent.depth
    }
}

/// Queries image-format properties for a 2D image with DRM-format-modifier
/// tiling and the given external handle kind.
///
/// `Ok(None)` means the device rejected the (format, tiling, usage, handle,
/// modifier) tuple outright; any other device error propagates.
pub fn query_external_image_support(
    instance: &Instance,
    physical_device: vk::PhysicalDevice,
    format: vk::Format,
    usage: vk::ImageUsageFlags,
    modifier: DrmFormatModifier,
    handle_kind: ExternalHandleKind,
) -> Result<Option<ExternalImageSupport>, VulkanError> {
    let mut modifier_info = vk::PhysicalDeviceImageDrmFormatModifierInfoEXT::default()
        .drm_format_modifier(modifier.0)
        .sharing_mode(vk::SharingMode::EXCLUSIVE);
    let mut external_info = vk::PhysicalDeviceExternalImageFormatInfo::default()
        .handle_type(handle_kind.handle_type());
    let format_info = vk::PhysicalDeviceImageFormatInfo2::default()
        .format(format)
        .ty(vk::ImageType::TYPE_2D)
        .tiling(vk::ImageTiling::DRM_FORMAT_MODIFIER_EXT)
        .usage(usage)
        .push_next(&mut external_info)
        .push_next(&mut modifier_info);

    let mut external_properties = vk::ExternalImageFormatProperties::default();
    let mut image_properties =
        vk::ImageFormatProperties2::default().push_next(&mut external_properties);

    let result = unsafe {
        instance.get_physical_device_image_format_properties2(
            physical_device,
            &format_info,
            &mut image_properties,
        )
    };
    match result {
        Ok(()) => {
            let max_extent = image_properties.image_format_properties.max_extent;
            Ok(Some(ExternalImageSupport {
                max_extent,
                external_memory_features: external_properties
                    .external_memory_properties
                    .external_memory_features,
            }))
        }
        Err(vk::Result::ERROR_FORMAT_NOT_SUPPORTED) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// Whether an external image of `format`/`extent` can be created with
/// `modifier` and shared through `handle_kind`.
///
/// False when the device rejects the combination, when it is not importable,
/// or when `extent` exceeds the reported maximum on any axis. Side-effect-free.
pub fn is_modifier_compatible(
    instance: &Instance,
    physical_device: vk::PhysicalDevice,
    format: vk::Format,
    extent: vk::Extent3D,
    modifier: DrmFormatModifier,
    handle_kind: ExternalHandleKind,
) -> Result<bool, VulkanError> {
    let support = query_external_image_support(
        instance,
        physical_device,
        format,
        crate::image::ExternalImage::USAGE,
        modifier,
        handle_kind,
    )?;
    Ok(match support {
        None => false,
        Some(support) => support.is_importable() && support.admits(extent),
    })
}

/// The full modifier catalog narrowed by the compatibility check: every
/// member is guaranteed importable for the given format, extent and handle
/// kind.
///
/// An empty set means "not supported", which callers surface before creating
/// any resource.
pub fn compatible_modifiers(
    instance: &Instance,
    physical_device: vk::PhysicalDevice,
    format: vk::Format,
    extent: vk::Extent3D,
    handle_kind: ExternalHandleKind,
) -> Result<SmallVec<[DrmFormatModifier; 8]>, VulkanError> {
    let catalog = list_modifiers(
        instance,
        physical_device,
        format,
        crate::image::ExternalImage::REQUIRED_FORMAT_FEATURES,
    );

    let mut compatible = SmallVec::new();
    for modifier in catalog {
        if is_modifier_compatible(instance, physical_device, format, extent, modifier, handle_kind)?
        {
            compatible.push(modifier);
        }
    }
    tracing::debug!(?format, compatible = compatible.len(), "filtered compatible modifiers");
    Ok(compatible)
}

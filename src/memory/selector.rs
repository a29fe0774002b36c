// Copyright (c) 2024 The vk-extmem developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Memory-type selection.

use ash::vk;

/// Constraints for picking a memory type index.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryTypeFilter {
    /// Bitmask of memory type indices the resource accepts, usually taken
    /// straight from `VkMemoryRequirements::memoryTypeBits`.
    pub allowed_types: u32,
    /// Properties the chosen type must have.
    pub required_properties: vk::MemoryPropertyFlags,
    /// Properties that raise a type's score but are not mandatory.
    pub preferred_properties: vk::MemoryPropertyFlags,
}

/// Picks the index of the memory type best matching `filter`.
///
/// Types outside `allowed_types` or missing any required property are skipped.
/// With no preferred properties the first surviving index wins, so the result
/// is deterministic by ascending index. Otherwise each survivor is scored by
/// `1 + popcount(preferred & actual)` and the strictly highest score wins,
/// ties broken by the lowest index.
///
/// Returns `None` when nothing survives the filter. Callers must treat that as
/// "not supported" for the resource at hand; retrying cannot help.
pub fn choose_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    filter: &MemoryTypeFilter,
) -> Option<u32> {
    let mut best: Option<(u32, u32)> = None;

    for index in 0..memory_properties.memory_type_count {
        if filter.allowed_types & (1 << index) == 0 {
            continue;
        }

        let actual = memory_properties.memory_types[index as usize].property_flags;
        if !actual.contains(filter.required_properties) {
            continue;
        }

        if filter.preferred_properties.is_empty() {
            // First match wins.
            return Some(index);
        }

        let score = 1 + (filter.preferred_properties & actual).as_raw().count_ones();
        if best.is_none_or(|(_, best_score)| score > best_score) {
            best = Some((index, score));
        }
    }

    best.map(|(index, _)| index)
}

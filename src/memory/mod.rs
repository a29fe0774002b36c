// Copyright (c) 2024 The vk-extmem developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Memory-type selection and format-modifier negotiation.

pub use self::{
    modifier::{
        compatible_modifiers, filter_by_features, is_modifier_compatible, list_modifier_properties,
        list_modifiers, query_external_image_support, DrmFormatModifier,
        DrmFormatModifierProperties, ExternalImageSupport,
    },
    selector::{choose_memory_type, MemoryTypeFilter},
};

pub mod modifier;
pub mod selector;

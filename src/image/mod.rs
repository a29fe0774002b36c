// Copyright (c) 2024 The vk-extmem developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Images backed by externally shareable device memory.

pub use self::external::{ExternalImage, ExternalImageCreationError};

mod external;

use ash::vk;

/// Kinds of external memory handles an [`ExternalImage`] can be shared
/// through.
///
/// This is a closed set: matches over it are exhaustive, so growing it (for
/// example with Android hardware buffers) turns every place that needs
/// updating into a compile error instead of a run-time assertion.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ExternalHandleKind {
    /// A Linux DMA-buf file descriptor.
    DmaBuf,
}

impl ExternalHandleKind {
    /// The Vulkan handle-type bit for this kind.
    pub fn handle_type(self) -> vk::ExternalMemoryHandleTypeFlags {
        match self {
            ExternalHandleKind::DmaBuf => vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_kind_maps_to_the_vulkan_bit() {
        assert_eq!(
            ExternalHandleKind::DmaBuf.handle_type(),
            vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT,
        );
    }
}

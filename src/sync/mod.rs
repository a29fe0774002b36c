// Copyright (c) 2024 The vk-extmem developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Queue-family ownership bookkeeping.
//!
//! Cross-API hand-off is expressed entirely through barrier metadata: the
//! foreign consumer never appears as an actual queue, only as the
//! `VK_QUEUE_FAMILY_FOREIGN_EXT` sentinel in release and acquire barriers.
//! The types here replace the raw sentinel constants with a closed set, so an
//! ill-formed transfer (foreign to foreign, say) cannot be written down.

use ash::vk;

/// A queue family as it appears in ownership-transfer barriers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum QueueFamily {
    /// The queue family the protocol submits on.
    Local,
    /// Any execution context outside the current Vulkan instance.
    Foreign,
    /// No ownership transfer; both sides of the barrier use this.
    Ignored,
}

impl QueueFamily {
    /// The index to put in a barrier, given the local family's index.
    pub fn index(self, local_family_index: u32) -> u32 {
        match self {
            QueueFamily::Local => local_family_index,
            QueueFamily::Foreign => vk::QUEUE_FAMILY_FOREIGN_EXT,
            QueueFamily::Ignored => vk::QUEUE_FAMILY_IGNORED,
        }
    }
}

/// The ownership transfers an image barrier can perform.
///
/// Only the meaningful pairings are constructible. The unmodified-memory
/// assertion exists solely on the acquire side, matching
/// `VkExternalMemoryAcquireUnmodifiedEXT`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OwnershipTransfer {
    /// No queue-family change; a plain layout/access barrier.
    None,
    /// Hand the image to a consumer outside this instance.
    ReleaseToForeign,
    /// Take the image back from the foreign consumer.
    ///
    /// `acquire_unmodified` asserts that **no write** touched the underlying
    /// memory between the matching release and this acquire, letting the
    /// device skip an invalidation step. The device trusts the assertion:
    /// passing `true` after the memory was modified is undefined behavior,
    /// not a detectable error. It is a contract, not a hint to experiment
    /// with.
    AcquireFromForeign { acquire_unmodified: bool },
}

impl OwnershipTransfer {
    /// The (source, destination) queue families of this transfer.
    pub fn queue_families(self) -> (QueueFamily, QueueFamily) {
        match self {
            OwnershipTransfer::None => (QueueFamily::Ignored, QueueFamily::Ignored),
            OwnershipTransfer::ReleaseToForeign => (QueueFamily::Local, QueueFamily::Foreign),
            OwnershipTransfer::AcquireFromForeign { .. } => {
                (QueueFamily::Foreign, QueueFamily::Local)
            }
        }
    }
}

/// Where an image is in the release/acquire cycle.
///
/// Transitions are driven exclusively by the barriers
/// [`crate::protocol::ForeignHandoff`] records; there are no implicit
/// transitions, and the cycle cannot be cancelled once it has begun.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OwnershipState {
    /// Freshly created, content undefined.
    Undefined,
    /// Owned by the local family as a transfer destination.
    LocalTransferDst,
    /// Released to the foreign family; the local family must not touch it.
    ReleasedToForeign,
    /// Re-acquired by the local family as a transfer destination.
    ReacquiredTransferDst,
    /// Owned by the local family as a transfer source.
    LocalTransferSrc,
    /// Content has been copied out; the cycle is complete.
    CopiedOut,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_indices() {
        assert_eq!(QueueFamily::Local.index(3), 3);
        assert_eq!(QueueFamily::Foreign.index(3), vk::QUEUE_FAMILY_FOREIGN_EXT);
        assert_eq!(QueueFamily::Ignored.index(3), vk::QUEUE_FAMILY_IGNORED);
    }

    #[test]
    fn transfer_family_pairs() {
        assert_eq!(
            OwnershipTransfer::None.queue_families(),
            (QueueFamily::Ignored, QueueFamily::Ignored),
        );
        assert_eq!(
            OwnershipTransfer::ReleaseToForeign.queue_families(),
            (QueueFamily::Local, QueueFamily::Foreign),
        );
        assert_eq!(
            OwnershipTransfer::AcquireFromForeign { acquire_unmodified: true }.queue_families(),
            (QueueFamily::Foreign, QueueFamily::Local),
        );
    }
}

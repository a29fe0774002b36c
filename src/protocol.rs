// Copyright (c) 2024 The vk-extmem developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! The release/acquire ownership-transfer protocol.
//!
//! [`ForeignHandoff`] drives one [`ExternalImage`] through the full cycle:
//!
//! ```plain
//! Undefined
//!   └─ populate_and_release ──► LocalTransferDst ──► ReleasedToForeign
//!                                                        │
//!   ┌─ acquire_and_copy_back ◄────────────────────────────┘
//!   └──► ReacquiredTransferDst ──► LocalTransferSrc ──► CopiedOut
//! ```
//!
//! Each phase is one command buffer submitted synchronously; the caller
//! blocks until the device is done, so every transition is fully ordered
//! with respect to the host. The foreign side never executes anything here;
//! it exists only as barrier metadata. That is what makes the acquire's
//! unmodified-memory assertion valid: nothing touched the memory between the
//! two phases.
//!
//! Once `populate_and_release` has run, the cycle cannot be cancelled; the
//! image is either carried through `acquire_and_copy_back` or destroyed
//! wholesale with the handoff.

use crate::{
    buffer::HostBuffer,
    context::DeviceContext,
    format::FormatInfo,
    image::ExternalImage,
    sync::{OwnershipState, OwnershipTransfer, QueueFamily},
    VulkanError,
};
use ash::vk;
use std::sync::Arc;

const SUBRESOURCE_LAYERS: vk::ImageSubresourceLayers = vk::ImageSubresourceLayers {
    aspect_mask: vk::ImageAspectFlags::COLOR,
    mip_level: 0,
    base_array_layer: 0,
    layer_count: 1,
};

/// Drives one image through release to a foreign consumer and re-acquisition.
///
/// The handoff exclusively owns its image for the duration of the cycle; no
/// other component may read or write it concurrently.
pub struct ForeignHandoff {
    context: Arc<DeviceContext>,
    image: ExternalImage,
    format_info: FormatInfo,
    command_pool: vk::CommandPool,
    state: OwnershipState,
}

impl ForeignHandoff {
    /// Takes ownership of `image` and prepares a transient command pool on
    /// the context's queue family.
    ///
    /// # Panics
    ///
    /// Panics if the image's format has no texel description (see
    /// [`FormatInfo::of`]); the protocol needs it to address sub-rectangle
    /// copies.
    pub fn new(
        context: &Arc<DeviceContext>,
        image: ExternalImage,
    ) -> Result<ForeignHandoff, VulkanError> {
        let format_info = match FormatInfo::of(image.format()) {
            Some(info) => info,
            None => panic!("image format {:?} has no texel description", image.format()),
        };

        let pool_info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::TRANSIENT)
            .queue_family_index(context.queue_family_index());
        let command_pool =
            unsafe { context.device().create_command_pool(&pool_info, None) }?;

        Ok(ForeignHandoff {
            context: context.clone(),
            image,
            format_info,
            command_pool,
            state: OwnershipState::Undefined,
        })
    }

    /// Where the image currently is in the cycle.
    pub fn state(&self) -> OwnershipState {
        self.state
    }

    pub fn image(&self) -> &ExternalImage {
        &self.image
    }

    /// The sub-rectangle `acquire_and_copy_back` overwrites: always the
    /// centered rectangle of half the image's width and height. Fixed so the
    /// unmodified assertion is exercised against a partial, not full-image,
    /// overwrite.
    pub fn update_region(extent: vk::Extent3D) -> (vk::Offset3D, vk::Extent3D) {
        let offset = vk::Offset3D {
            x: (extent.width / 4) as i32,
            y: (extent.height / 4) as i32,
            z: 0,
        };
        let update_extent = vk::Extent3D {
            width: extent.width / 2,
            height: extent.height / 2,
            depth: 1,
        };
        (offset, update_extent)
    }

    /// Fills the whole image from `source` and releases ownership to the
    /// foreign queue family.
    ///
    /// `source` must hold a full tightly packed image and have been flushed
    /// after the last host write.
    ///
    /// # Panics
    ///
    /// Panics unless the image is in the [`OwnershipState::Undefined`] state.
    pub fn populate_and_release(&mut self, source: &HostBuffer) -> Result<(), VulkanError> {
        assert_eq!(self.state, OwnershipState::Undefined, "image already populated");
        assert!(source.size() >= self.format_info.buffer_size(self.image.extent()));

        let device = self.context.device();
        let local = self.context.queue_family_index();
        let extent = self.image.extent();
        let command_buffer = self.begin_command_buffer()?;

        // Source readable by transfer, image writable as transfer dst.
        {
            let buffer_barrier = vk::BufferMemoryBarrier::default()
                .src_access_mask(vk::AccessFlags::HOST_WRITE)
                .dst_access_mask(vk::AccessFlags::TRANSFER_READ)
                .src_queue_family_index(QueueFamily::Ignored.index(local))
                .dst_queue_family_index(QueueFamily::Ignored.index(local))
                .buffer(source.buffer())
                .offset(0)
                .size(vk::WHOLE_SIZE);
            let image_barrier = vk::ImageMemoryBarrier::default()
                .src_access_mask(vk::AccessFlags::empty())
                .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                .old_layout(vk::ImageLayout::UNDEFINED)
                .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                .src_queue_family_index(QueueFamily::Ignored.index(local))
                .dst_queue_family_index(QueueFamily::Ignored.index(local))
                .image(self.image.image())
                .subresource_range(ExternalImage::SUBRESOURCE_RANGE);
            unsafe {
                device.cmd_pipeline_barrier(
                    command_buffer,
                    vk::PipelineStageFlags::HOST,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[buffer_barrier],
                    &[image_barrier],
                )
            };
        }
        self.state = OwnershipState::LocalTransferDst;

        // Full-extent copy into the image.
        {
            let copy = vk::BufferImageCopy {
                buffer_offset: 0,
                buffer_row_length: extent.width,
                buffer_image_height: extent.height,
                image_subresource: SUBRESOURCE_LAYERS,
                image_offset: vk::Offset3D::default(),
                image_extent: extent,
            };
            unsafe {
                device.cmd_copy_buffer_to_image(
                    command_buffer,
                    source.buffer(),
                    self.image.image(),
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[copy],
                )
            };
        }

        // Release ownership to the foreign family. The destination side gets
        // no access mask: the matching acquire provides it. The dst stage
        // must be BOTTOM_OF_PIPE, not a zero mask; a zero stage mask in
        // vkCmdPipelineBarrier requires the synchronization2 feature, which
        // this device does not enable.
        {
            let transfer = OwnershipTransfer::ReleaseToForeign;
            let (src_family, dst_family) = transfer.queue_families();
            let image_barrier = vk::ImageMemoryBarrier::default()
                .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                .dst_access_mask(vk::AccessFlags::NONE)
                .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                .new_layout(vk::ImageLayout::GENERAL)
                .src_queue_family_index(src_family.index(local))
                .dst_queue_family_index(dst_family.index(local))
                .image(self.image.image())
                .subresource_range(ExternalImage::SUBRESOURCE_RANGE);
            unsafe {
                device.cmd_pipeline_barrier(
                    command_buffer,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[],
                    &[image_barrier],
                )
            };
        }

        self.finish_and_submit(command_buffer)?;
        self.state = OwnershipState::ReleasedToForeign;
        tracing::debug!(image = ?self.image.image(), "released image to the foreign queue family");
        Ok(())
    }

    /// Re-acquires the image from the foreign family, overwrites the centered
    /// half-extent rectangle from `reference`, and copies the whole image
    /// into `result`.
    ///
    /// The acquire barrier carries the unmodified-memory assertion. That is
    /// sound here because the foreign side of this protocol is metadata only;
    /// a caller that actually let a consumer write the memory in between must
    /// not reuse this entry point.
    ///
    /// On return, `result` has been invalidated and is ready for host reads.
    ///
    /// # Panics
    ///
    /// Panics unless the image is in the [`OwnershipState::ReleasedToForeign`]
    /// state.
    pub fn acquire_and_copy_back(
        &mut self,
        reference: &HostBuffer,
        result: &HostBuffer,
    ) -> Result<(), VulkanError> {
        assert_eq!(
            self.state,
            OwnershipState::ReleasedToForeign,
            "image is not released to the foreign queue family"
        );
        let image_size = self.format_info.buffer_size(self.image.extent());
        assert!(reference.size() >= image_size);
        assert!(result.size() >= image_size);

        let device = self.context.device();
        let local = self.context.queue_family_index();
        let extent = self.image.extent();
        let command_buffer = self.begin_command_buffer()?;

        // Acquire ownership with the unmodified assertion and prepare the
        // image as a copy destination again.
        {
            let acquire_unmodified = true;
            let transfer = OwnershipTransfer::AcquireFromForeign { acquire_unmodified };
            let (src_family, dst_family) = transfer.queue_families();

            let buffer_barrier = vk::BufferMemoryBarrier::default()
                .src_access_mask(vk::AccessFlags::HOST_WRITE)
                .dst_access_mask(vk::AccessFlags::TRANSFER_READ)
                .src_queue_family_index(QueueFamily::Ignored.index(local))
                .dst_queue_family_index(QueueFamily::Ignored.index(local))
                .buffer(reference.buffer())
                .offset(0)
                .size(vk::WHOLE_SIZE);
            let mut unmodified_info = vk::ExternalMemoryAcquireUnmodifiedEXT::default()
                .acquire_unmodified_memory(acquire_unmodified);
            let image_barrier = vk::ImageMemoryBarrier::default()
                .src_access_mask(vk::AccessFlags::NONE)
                .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                .old_layout(vk::ImageLayout::GENERAL)
                .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                .src_queue_family_index(src_family.index(local))
                .dst_queue_family_index(dst_family.index(local))
                .image(self.image.image())
                .subresource_range(ExternalImage::SUBRESOURCE_RANGE)
                .push_next(&mut unmodified_info);
            unsafe {
                device.cmd_pipeline_barrier(
                    command_buffer,
                    vk::PipelineStageFlags::HOST,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[buffer_barrier],
                    &[image_barrier],
                )
            };
        }
        self.state = OwnershipState::ReacquiredTransferDst;

        // Partial copy: only the centered rectangle, so the interaction of
        // the unmodified assertion with a partial overwrite is exercised.
        {
            let (offset, update_extent) = Self::update_region(extent);
            let texel_size = vk::DeviceSize::from(self.format_info.block_size);
            let copy = vk::BufferImageCopy {
                buffer_offset: (offset.y as vk::DeviceSize * vk::DeviceSize::from(extent.width)
                    + offset.x as vk::DeviceSize)
                    * texel_size,
                buffer_row_length: extent.width,
                buffer_image_height: extent.height,
                image_subresource: SUBRESOURCE_LAYERS,
                image_offset: offset,
                image_extent: update_extent,
            };
            unsafe {
                device.cmd_copy_buffer_to_image(
                    command_buffer,
                    reference.buffer(),
                    self.image.image(),
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[copy],
                )
            };
        }

        // Image as a copy source.
        {
            let transfer = OwnershipTransfer::None;
            let (src_family, dst_family) = transfer.queue_families();
            let image_barrier = vk::ImageMemoryBarrier::default()
                .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                .dst_access_mask(vk::AccessFlags::TRANSFER_READ)
                .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                .new_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
                .src_queue_family_index(src_family.index(local))
                .dst_queue_family_index(dst_family.index(local))
                .image(self.image.image())
                .subresource_range(ExternalImage::SUBRESOURCE_RANGE);
            unsafe {
                device.cmd_pipeline_barrier(
                    command_buffer,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[],
                    &[image_barrier],
                )
            };
        }
        self.state = OwnershipState::LocalTransferSrc;

        // Full image into the result buffer.
        {
            let copy = vk::BufferImageCopy {
                buffer_offset: 0,
                buffer_row_length: 0,
                buffer_image_height: 0,
                image_subresource: SUBRESOURCE_LAYERS,
                image_offset: vk::Offset3D::default(),
                image_extent: extent,
            };
            unsafe {
                device.cmd_copy_image_to_buffer(
                    command_buffer,
                    self.image.image(),
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    result.buffer(),
                    &[copy],
                )
            };
        }

        // Result buffer readable by the host.
        {
            let buffer_barrier = vk::BufferMemoryBarrier::default()
                .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                .dst_access_mask(vk::AccessFlags::HOST_READ)
                .src_queue_family_index(QueueFamily::Ignored.index(local))
                .dst_queue_family_index(QueueFamily::Ignored.index(local))
                .buffer(result.buffer())
                .offset(0)
                .size(vk::WHOLE_SIZE);
            unsafe {
                device.cmd_pipeline_barrier(
                    command_buffer,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::PipelineStageFlags::HOST,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[buffer_barrier],
                    &[],
                )
            };
        }

        self.finish_and_submit(command_buffer)?;
        result.invalidate()?;
        self.state = OwnershipState::CopiedOut;
        tracing::debug!(image = ?self.image.image(), "re-acquired image and copied content out");
        Ok(())
    }

    fn begin_command_buffer(&self) -> Result<vk::CommandBuffer, VulkanError> {
        let device = self.context.device();
        let allocate_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let command_buffer = unsafe { device.allocate_command_buffers(&allocate_info) }?[0];

        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { device.begin_command_buffer(command_buffer, &begin_info) }?;
        Ok(command_buffer)
    }

    fn finish_and_submit(&self, command_buffer: vk::CommandBuffer) -> Result<(), VulkanError> {
        let device = self.context.device();
        unsafe { device.end_command_buffer(command_buffer) }?;
        let result = self.context.submit_and_wait(command_buffer);
        unsafe { device.free_command_buffers(self.command_pool, &[command_buffer]) };
        result
    }
}

impl Drop for ForeignHandoff {
    fn drop(&mut self) {
        unsafe {
            self.context
                .device()
                .destroy_command_pool(self.command_pool, None)
        };
        // The image and its memory are dropped after the pool.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_region_is_the_centered_half_extent() {
        let extent = vk::Extent3D { width: 512, height: 512, depth: 1 };
        let (offset, update) = ForeignHandoff::update_region(extent);
        assert_eq!((offset.x, offset.y, offset.z), (128, 128, 0));
        assert_eq!((update.width, update.height, update.depth), (256, 256, 1));

        // Non-square images stay centered per axis.
        let extent = vk::Extent3D { width: 640, height: 480, depth: 1 };
        let (offset, update) = ForeignHandoff::update_region(extent);
        assert_eq!((offset.x, offset.y), (160, 120));
        assert_eq!((update.width, update.height), (320, 240));
    }
}

// Copyright (c) 2024 The vk-extmem developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Gradient fills and content comparison for tightly packed pixel buffers.

use crate::format::{FormatInfo, NumericKind};
use ash::vk;

/// A sub-rectangle of an image, in texels.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PixelRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl PixelRect {
    /// The full extent as a rectangle.
    pub fn full(extent: vk::Extent3D) -> PixelRect {
        PixelRect { x: 0, y: 0, width: extent.width, height: extent.height }
    }
}

/// Fills the whole buffer with per-component gradients between `min_color`
/// and `max_color`.
///
/// Red runs along x, green along y, blue along the diagonal and alpha along
/// the inverse diagonal, so no two neighbouring texels are equal and
/// misplaced copies show up in a comparison.
pub fn fill_gradient(
    info: &FormatInfo,
    extent: vk::Extent3D,
    min_color: [f32; 4],
    max_color: [f32; 4],
    out: &mut [u8],
) {
    fill_gradient_region(info, extent, PixelRect::full(extent), min_color, max_color, out);
}

/// Like [`fill_gradient`], but only texels inside `rect` are written; the
/// rest of the buffer is left untouched. The gradient coordinates are local
/// to `rect`.
pub fn fill_gradient_region(
    info: &FormatInfo,
    extent: vk::Extent3D,
    rect: PixelRect,
    min_color: [f32; 4],
    max_color: [f32; 4],
    out: &mut [u8],
) {
    assert_eq!(out.len() as vk::DeviceSize, info.buffer_size(extent));
    assert!(rect.x + rect.width <= extent.width);
    assert!(rect.y + rect.height <= extent.height);

    let block_size = info.block_size as usize;
    for row in 0..rect.height {
        let ty = gradient_position(row, rect.height);
        for column in 0..rect.width {
            let tx = gradient_position(column, rect.width);
            let factors = [tx, ty, (tx + ty) / 2.0, 1.0 - (tx + ty) / 2.0];
            let mut texel = [0.0; 4];
            for channel in 0..4 {
                texel[channel] =
                    min_color[channel] + (max_color[channel] - min_color[channel]) * factors[channel];
            }

            let index =
                ((rect.y + row) as usize * extent.width as usize + (rect.x + column) as usize)
                    * block_size;
            info.encode(texel, &mut out[index..index + block_size]);
        }
    }
}

fn gradient_position(index: u32, length: u32) -> f32 {
    if length <= 1 {
        0.0
    } else {
        index as f32 / (length - 1) as f32
    }
}

/// First difference between two buffers of identical format and extent.
#[derive(Clone, Copy, Debug)]
pub struct PixelDiff {
    pub x: u32,
    pub y: u32,
    pub reference: [f32; 4],
    pub result: [f32; 4],
}

/// Compares two tightly packed images texel by texel.
///
/// Unorm formats compare exactly on the raw bytes; float formats decode and
/// compare with a zero threshold. Returns the first mismatch, or `None` when
/// the buffers agree. A mismatch is a verdict, not an error.
pub fn compare(
    info: &FormatInfo,
    extent: vk::Extent3D,
    reference: &[u8],
    result: &[u8],
) -> Option<PixelDiff> {
    assert_eq!(reference.len() as vk::DeviceSize, info.buffer_size(extent));
    assert_eq!(result.len() as vk::DeviceSize, info.buffer_size(extent));

    let block_size = info.block_size as usize;
    for y in 0..extent.height {
        for x in 0..extent.width {
            let index = (y as usize * extent.width as usize + x as usize) * block_size;
            let reference_bytes = &reference[index..index + block_size];
            let result_bytes = &result[index..index + block_size];

            let matches = match info.numeric_kind {
                NumericKind::Unorm => reference_bytes == result_bytes,
                NumericKind::Sfloat => {
                    let expected = info.decode(reference_bytes);
                    let actual = info.decode(result_bytes);
                    (0..4).all(|channel| (expected[channel] - actual[channel]).abs() <= 0.0)
                }
            };
            if !matches {
                return Some(PixelDiff {
                    x,
                    y,
                    reference: info.decode(reference_bytes),
                    result: info.decode(result_bytes),
                });
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXTENT: vk::Extent3D = vk::Extent3D { width: 8, height: 8, depth: 1 };
    const MIN: [f32; 4] = [0.1, 0.0, 0.8, 1.0];
    const MAX: [f32; 4] = [0.9, 0.7, 0.2, 1.0];

    fn rgba8() -> FormatInfo {
        FormatInfo::of(vk::Format::R8G8B8A8_UNORM).unwrap()
    }

    #[test]
    fn identical_buffers_compare_equal() {
        let info = rgba8();
        let mut buffer = vec![0; info.buffer_size(EXTENT) as usize];
        fill_gradient(&info, EXTENT, MIN, MAX, &mut buffer);
        assert!(compare(&info, EXTENT, &buffer, &buffer).is_none());
    }

    #[test]
    fn compare_reports_the_first_mismatch() {
        let info = rgba8();
        let mut reference = vec![0; info.buffer_size(EXTENT) as usize];
        fill_gradient(&info, EXTENT, MIN, MAX, &mut reference);
        let mut result = reference.clone();
        // Corrupt the green channel of texel (3, 5).
        result[(5 * 8 + 3) * 4 + 1] ^= 0xff;

        let diff = compare(&info, EXTENT, &reference, &result).unwrap();
        assert_eq!((diff.x, diff.y), (3, 5));
        assert_ne!(diff.reference[1], diff.result[1]);
    }

    #[test]
    fn float_compare_uses_zero_threshold() {
        let info = FormatInfo::of(vk::Format::R32G32B32A32_SFLOAT).unwrap();
        let mut reference = vec![0; info.buffer_size(EXTENT) as usize];
        fill_gradient(&info, EXTENT, MIN, MAX, &mut reference);
        let mut result = reference.clone();
        assert!(compare(&info, EXTENT, &reference, &result).is_none());

        let mut texel = info.decode(&result[0..16]);
        texel[0] += 1e-6;
        let mut bytes = [0; 16];
        info.encode(texel, &mut bytes);
        result[0..16].copy_from_slice(&bytes);
        assert!(compare(&info, EXTENT, &reference, &result).is_some());
    }

    #[test]
    fn region_fill_leaves_the_outside_untouched() {
        let info = rgba8();
        let mut buffer = vec![0; info.buffer_size(EXTENT) as usize];
        fill_gradient(&info, EXTENT, MIN, MAX, &mut buffer);
        let mut updated = buffer.clone();
        let rect = PixelRect { x: 2, y: 2, width: 4, height: 4 };
        fill_gradient_region(&info, EXTENT, rect, MAX, MIN, &mut updated);

        for y in 0..8u32 {
            for x in 0..8u32 {
                let index = (y as usize * 8 + x as usize) * 4;
                let inside =
                    x >= rect.x && x < rect.x + rect.width && y >= rect.y && y < rect.y + rect.height;
                let changed = buffer[index..index + 4] != updated[index..index + 4];
                if !inside {
                    assert!(!changed, "texel ({x}, {y}) outside the rect changed");
                }
            }
        }
        // And the inside did change somewhere.
        assert!(compare(&info, EXTENT, &buffer, &updated).is_some());
    }
}

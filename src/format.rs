// Copyright (c) 2024 The vk-extmem developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Texel descriptions for the formats the protocol exercises.
//!
//! Only the handful of color formats the round trip is run against are
//! described; everything else yields `None` from [`FormatInfo::of`]. The
//! descriptions are enough to size buffers, fill gradients and compare
//! readback content, nothing more.

use ash::vk;
use half::f16;

/// How texel values of a format compare.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NumericKind {
    /// Unsigned normalized integers; comparisons are exact on the raw bytes.
    Unorm,
    /// Floating point; comparisons decode and apply a threshold.
    Sfloat,
}

/// In-memory layout of one texel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TexelLayout {
    Rgba8,
    Bgra8,
    Rgba16,
    Rgba16f,
    Rgba32f,
}

/// Description of a supported color format.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FormatInfo {
    pub format: vk::Format,
    /// Bytes per texel.
    pub block_size: u32,
    pub numeric_kind: NumericKind,
    layout: TexelLayout,
}

impl FormatInfo {
    /// The description of `format`, or `None` for formats the protocol does
    /// not exercise.
    pub fn of(format: vk::Format) -> Option<FormatInfo> {
        let (block_size, numeric_kind, layout) = match format {
            vk::Format::R8G8B8A8_UNORM => (4, NumericKind::Unorm, TexelLayout::Rgba8),
            vk::Format::B8G8R8A8_UNORM => (4, NumericKind::Unorm, TexelLayout::Bgra8),
            vk::Format::R16G16B16A16_UNORM => (8, NumericKind::Unorm, TexelLayout::Rgba16),
            vk::Format::R16G16B16A16_SFLOAT => (8, NumericKind::Sfloat, TexelLayout::Rgba16f),
            vk::Format::R32G32B32A32_SFLOAT => (16, NumericKind::Sfloat, TexelLayout::Rgba32f),
            _ => return None,
        };
        Some(FormatInfo { format, block_size, numeric_kind, layout })
    }

    /// Bytes needed for a tightly packed image of `extent`.
    pub fn buffer_size(&self, extent: vk::Extent3D) -> vk::DeviceSize {
        vk::DeviceSize::from(self.block_size)
            * vk::DeviceSize::from(extent.width)
            * vk::DeviceSize::from(extent.height)
            * vk::DeviceSize::from(extent.depth)
    }

    /// Encodes one RGBA texel into `out`, which must be `block_size` bytes.
    pub fn encode(&self, texel: [f32; 4], out: &mut [u8]) {
        assert_eq!(out.len(), self.block_size as usize);
        match self.layout {
            TexelLayout::Rgba8 => {
                for (channel, value) in texel.into_iter().enumerate() {
                    out[channel] = unorm8(value);
                }
            }
            TexelLayout::Bgra8 => {
                let [r, g, b, a] = texel;
                out.copy_from_slice(&[unorm8(b), unorm8(g), unorm8(r), unorm8(a)]);
            }
            TexelLayout::Rgba16 => {
                let encoded = texel.map(unorm16);
                out.copy_from_slice(bytemuck::bytes_of(&encoded));
            }
            TexelLayout::Rgba16f => {
                let encoded = texel.map(|value| f16::from_f32(value).to_bits());
                out.copy_from_slice(bytemuck::bytes_of(&encoded));
            }
            TexelLayout::Rgba32f => {
                out.copy_from_slice(bytemuck::bytes_of(&texel));
            }
        }
    }

    /// Decodes one texel from `bytes`, which must be `block_size` bytes.
    pub fn decode(&self, bytes: &[u8]) -> [f32; 4] {
        assert_eq!(bytes.len(), self.block_size as usize);
        match self.layout {
            TexelLayout::Rgba8 => {
                [bytes[0], bytes[1], bytes[2], bytes[3]].map(|value| f32::from(value) / 255.0)
            }
            TexelLayout::Bgra8 => {
                [bytes[2], bytes[1], bytes[0], bytes[3]].map(|value| f32::from(value) / 255.0)
            }
            TexelLayout::Rgba16 => {
                let raw: [u16; 4] = bytemuck::pod_read_unaligned(bytes);
                raw.map(|value| f32::from(value) / 65535.0)
            }
            TexelLayout::Rgba16f => {
                let raw: [u16; 4] = bytemuck::pod_read_unaligned(bytes);
                raw.map(|value| f16::from_bits(value).to_f32())
            }
            TexelLayout::Rgba32f => bytemuck::pod_read_unaligned(bytes),
        }
    }
}

fn unorm8(value: f32) -> u8 {
    (value.clamp(0.0, 1.0) * 255.0 + 0.5) as u8
}

fn unorm16(value: f32) -> u16 {
    (value.clamp(0.0, 1.0) * 65535.0 + 0.5) as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_formats_are_not_described() {
        assert!(FormatInfo::of(vk::Format::D32_SFLOAT).is_none());
        assert!(FormatInfo::of(vk::Format::UNDEFINED).is_none());
    }

    #[test]
    fn block_sizes() {
        let size = |format| FormatInfo::of(format).unwrap().block_size;
        assert_eq!(size(vk::Format::R8G8B8A8_UNORM), 4);
        assert_eq!(size(vk::Format::B8G8R8A8_UNORM), 4);
        assert_eq!(size(vk::Format::R16G16B16A16_UNORM), 8);
        assert_eq!(size(vk::Format::R16G16B16A16_SFLOAT), 8);
        assert_eq!(size(vk::Format::R32G32B32A32_SFLOAT), 16);
    }

    #[test]
    fn buffer_size_is_tightly_packed() {
        let info = FormatInfo::of(vk::Format::R16G16B16A16_UNORM).unwrap();
        let extent = vk::Extent3D { width: 512, height: 512, depth: 1 };
        assert_eq!(info.buffer_size(extent), 512 * 512 * 8);
    }

    #[test]
    fn bgra_swizzles_red_and_blue() {
        let info = FormatInfo::of(vk::Format::B8G8R8A8_UNORM).unwrap();
        let mut bytes = [0; 4];
        info.encode([1.0, 0.0, 0.25, 0.5], &mut bytes);
        assert_eq!(bytes, [64, 0, 255, 128]);
        let decoded = info.decode(&bytes);
        assert_eq!(decoded[0], 1.0);
        assert!((decoded[2] - 0.25).abs() < 0.01);
    }

    #[test]
    fn float_texels_keep_exact_values() {
        let info = FormatInfo::of(vk::Format::R32G32B32A32_SFLOAT).unwrap();
        let texel = [0.1, -2.5, 1e20, 0.0];
        let mut bytes = [0; 16];
        info.encode(texel, &mut bytes);
        assert_eq!(info.decode(&bytes), texel);
    }

    #[test]
    fn half_float_texels_quantize_to_f16() {
        let info = FormatInfo::of(vk::Format::R16G16B16A16_SFLOAT).unwrap();
        let mut bytes = [0; 8];
        info.encode([0.5, 1.0, -1.0, 0.0], &mut bytes);
        assert_eq!(info.decode(&bytes), [0.5, 1.0, -1.0, 0.0]);
    }
}

//! Pixel layout conversions.
//!
//! The kernel writes one packed `0x00RRGGBB` word per pixel. Stored frame
//! files carry three bytes per pixel in B, G, R order, which is the packed
//! word's little-endian byte sequence with the fourth (always zero) byte
//! dropped.

use framecap_common::PixelLayout;

/// Bytes per pixel in a stored frame file.
pub const STORED_BYTES_PER_PIXEL: usize = 3;

#[inline]
pub const fn pack_rgb(r: u8, g: u8, b: u8) -> u32 {
    ((r as u32) << 16) | ((g as u32) << 8) | b as u32
}

#[inline]
pub const fn unpack_rgb(packed: u32) -> (u8, u8, u8) {
    ((packed >> 16) as u8, (packed >> 8) as u8, packed as u8)
}

/// Widen a 5-bit channel to 8 bits by bit replication (0x1F -> 0xFF).
#[inline]
pub const fn expand5(v: u16) -> u8 {
    let v = (v & 0x1F) as u8;
    (v << 3) | (v >> 2)
}

/// Widen a 6-bit channel to 8 bits by bit replication (0x3F -> 0xFF).
#[inline]
pub const fn expand6(v: u16) -> u8 {
    let v = (v & 0x3F) as u8;
    (v << 2) | (v >> 4)
}

/// Read one texel in `layout` and return its (r, g, b) channels.
///
/// `texel` must hold at least `layout.bytes_per_pixel()` bytes.
#[inline]
pub fn decode_texel(layout: PixelLayout, texel: &[u8]) -> (u8, u8, u8) {
    match layout {
        PixelLayout::Bgra8 => (texel[2], texel[1], texel[0]),
        PixelLayout::Rgba8 | PixelLayout::Rgb8 => (texel[0], texel[1], texel[2]),
        PixelLayout::Argb8 => (texel[1], texel[2], texel[3]),
        PixelLayout::Rgb565 => {
            let v = u16::from_le_bytes([texel[0], texel[1]]);
            (expand5(v >> 11), expand6(v >> 5), expand5(v))
        }
    }
}

/// Write (r, g, b) into one texel in `layout`. Alpha is set opaque.
#[inline]
pub fn encode_texel(layout: PixelLayout, r: u8, g: u8, b: u8, texel: &mut [u8]) {
    match layout {
        PixelLayout::Bgra8 => texel[..4].copy_from_slice(&[b, g, r, 0xFF]),
        PixelLayout::Rgba8 => texel[..4].copy_from_slice(&[r, g, b, 0xFF]),
        PixelLayout::Argb8 => texel[..4].copy_from_slice(&[0xFF, r, g, b]),
        PixelLayout::Rgb8 => texel[..3].copy_from_slice(&[r, g, b]),
        PixelLayout::Rgb565 => {
            let v = ((r as u16 >> 3) << 11) | ((g as u16 >> 2) << 5) | (b as u16 >> 3);
            texel[..2].copy_from_slice(&v.to_le_bytes());
        }
    }
}

/// Unpack kernel output into tightly packed B, G, R bytes.
pub fn packed_to_bgr(pixels: &[u32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(pixels.len() * STORED_BYTES_PER_PIXEL);
    for p in pixels {
        let bytes = p.to_le_bytes();
        out.extend_from_slice(&bytes[..STORED_BYTES_PER_PIXEL]);
    }
    out
}

/// Reorder stored B, G, R bytes into R, G, B for image encoders.
pub fn bgr_to_rgb_in_place(data: &mut [u8]) {
    for px in data.chunks_exact_mut(STORED_BYTES_PER_PIXEL) {
        px.swap(0, 2);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_layout() {
        assert_eq!(pack_rgb(0x12, 0x34, 0x56), 0x0012_3456);
        assert_eq!(unpack_rgb(0x00AB_CDEF), (0xAB, 0xCD, 0xEF));
    }

    #[test]
    fn test_packed_to_bgr_drops_fourth_byte() {
        let bgr = packed_to_bgr(&[pack_rgb(1, 2, 3), 0xFF00_0000 | pack_rgb(4, 5, 6)]);
        assert_eq!(bgr, vec![3, 2, 1, 6, 5, 4]);
    }

    #[test]
    fn test_rgb565_expands_by_replication() {
        let mut texel = [0u8; 2];
        encode_texel(PixelLayout::Rgb565, 0xFF, 0xFF, 0xFF, &mut texel);
        assert_eq!(decode_texel(PixelLayout::Rgb565, &texel), (0xFF, 0xFF, 0xFF));

        encode_texel(PixelLayout::Rgb565, 0, 0, 0, &mut texel);
        assert_eq!(decode_texel(PixelLayout::Rgb565, &texel), (0, 0, 0));

        assert_eq!(expand5(0x10), 0x84);
        assert_eq!(expand6(0x20), 0x82);
    }

    #[test]
    fn test_eight_bit_layouts_are_lossless() {
        for layout in [
            PixelLayout::Bgra8,
            PixelLayout::Rgba8,
            PixelLayout::Argb8,
            PixelLayout::Rgb8,
        ] {
            let mut texel = [0u8; 4];
            encode_texel(layout, 10, 20, 30, &mut texel);
            assert_eq!(decode_texel(layout, &texel), (10, 20, 30), "{:?}", layout);
        }
    }

    #[test]
    fn test_bgr_to_rgb() {
        let mut data = vec![3, 2, 1, 6, 5, 4];
        bgr_to_rgb_in_place(&mut data);
        assert_eq!(data, vec![1, 2, 3, 4, 5, 6]);
    }
}

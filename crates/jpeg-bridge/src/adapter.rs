//! Per-scanline conversion between engine row layouts and caller buffers.
//!
//! Colour conversion for packed RGB is left to the engine; this module only
//! chooses which native colorspace to request and does the byte shuffles the
//! engine cannot: alpha injection and removal, YCbCr de-interleaving, and
//! edge extension of planar rows fed to the encoder.

use mozjpeg_sys::J_COLOR_SPACE;

/// Opaque alpha value injected into expanded rows.
pub const OPAQUE: u8 = 0xFF;

/// Pixel layout the caller wants out of a decode, or hands to an encode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelLayout {
    /// One byte per pixel.
    Gray,
    /// Packed R, G, B.
    Rgb,
    /// Packed R, G, B, A.
    Rgba,
    /// Packed Y, Cb, Cr, split into planes by the adapter.
    YCbCr,
}

impl PixelLayout {
    /// Bytes per pixel in the caller's buffer.
    pub fn channels(self) -> usize {
        match self {
            PixelLayout::Gray => 1,
            PixelLayout::Rgb | PixelLayout::YCbCr => 3,
            PixelLayout::Rgba => 4,
        }
    }

    /// Colorspace the engine is asked to produce or consume.
    ///
    /// RGBA is exchanged with the engine as RGB; the alpha channel is added or
    /// dropped here, one row at a time.
    pub(crate) fn engine_colorspace(self) -> J_COLOR_SPACE {
        match self {
            PixelLayout::Gray => J_COLOR_SPACE::JCS_GRAYSCALE,
            PixelLayout::Rgb | PixelLayout::Rgba => J_COLOR_SPACE::JCS_RGB,
            PixelLayout::YCbCr => J_COLOR_SPACE::JCS_YCbCr,
        }
    }

    /// Bytes per pixel in the engine's rows.
    pub(crate) fn engine_channels(self) -> usize {
        match self {
            PixelLayout::Gray => 1,
            _ => 3,
        }
    }
}

/// Expand packed RGB into packed RGBA with opaque alpha.
///
/// Converts `min(rgb.len() / 3, rgba.len() / 4)` pixels.
pub fn expand_rgb_to_rgba(rgb: &[u8], rgba: &mut [u8]) {
    for (src, dst) in rgb.chunks_exact(3).zip(rgba.chunks_exact_mut(4)) {
        dst[..3].copy_from_slice(src);
        dst[3] = OPAQUE;
    }
}

/// Drop the alpha channel from packed RGBA.
pub fn strip_alpha(rgba: &[u8], rgb: &mut [u8]) {
    for (src, dst) in rgba.chunks_exact(4).zip(rgb.chunks_exact_mut(3)) {
        dst.copy_from_slice(&src[..3]);
    }
}

/// Split one interleaved YCbCr row into three plane rows.
pub fn deinterleave_ycbcr(row: &[u8], y: &mut [u8], cb: &mut [u8], cr: &mut [u8]) {
    let pixels = row.chunks_exact(3).zip(y.iter_mut().zip(cb.iter_mut().zip(cr.iter_mut())));
    for (px, (y, (cb, cr))) in pixels {
        *y = px[0];
        *cb = px[1];
        *cr = px[2];
    }
}

/// Copy `src` into `dst`, repeating the last sample across the remainder.
///
/// Used to feed the encoder complete blocks at the right and bottom image
/// edges without reading past the caller's logical width.
pub fn extend_row(src: &[u8], dst: &mut [u8]) {
    let n = src.len().min(dst.len());
    dst[..n].copy_from_slice(&src[..n]);
    if let Some(&last) = src.last() {
        dst[n..].fill(last);
    }
}

/// Full-range JFIF YCbCr to RGB.
#[inline]
pub fn ycbcr_to_rgb(y: u8, cb: u8, cr: u8) -> [u8; 3] {
    let y = y as f32;
    let cb = cb as f32 - 128.0;
    let cr = cr as f32 - 128.0;
    let r = y + 1.402 * cr;
    let g = y - 0.344_136 * cb - 0.714_136 * cr;
    let b = y + 1.772 * cb;
    [clamp_u8(r), clamp_u8(g), clamp_u8(b)]
}

/// Full-range JFIF RGB to YCbCr.
#[inline]
pub fn rgb_to_ycbcr(rgb: [u8; 3]) -> [u8; 3] {
    let [r, g, b] = rgb.map(|c| c as f32);
    let y = 0.299 * r + 0.587 * g + 0.114 * b;
    let cb = 128.0 - 0.168_736 * r - 0.331_264 * g + 0.5 * b;
    let cr = 128.0 + 0.5 * r - 0.418_688 * g - 0.081_312 * b;
    [clamp_u8(y), clamp_u8(cb), clamp_u8(cr)]
}

#[inline]
fn clamp_u8(v: f32) -> u8 {
    v.round().clamp(0.0, 255.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_rgb_to_rgba() {
        let rgb = [1, 2, 3, 4, 5, 6];
        let mut rgba = [0u8; 8];
        expand_rgb_to_rgba(&rgb, &mut rgba);
        assert_eq!(rgba, [1, 2, 3, 255, 4, 5, 6, 255]);
    }

    #[test]
    fn test_expand_stops_at_shorter_buffer() {
        let rgb = [9u8; 9];
        let mut rgba = [0u8; 8];
        expand_rgb_to_rgba(&rgb, &mut rgba);
        assert_eq!(rgba, [9, 9, 9, 255, 9, 9, 9, 255]);
    }

    #[test]
    fn test_strip_alpha() {
        let rgba = [1, 2, 3, 0, 4, 5, 6, 128];
        let mut rgb = [0u8; 6];
        strip_alpha(&rgba, &mut rgb);
        assert_eq!(rgb, [1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_deinterleave_ycbcr() {
        let row = [10, 20, 30, 11, 21, 31];
        let (mut y, mut cb, mut cr) = ([0u8; 2], [0u8; 2], [0u8; 2]);
        deinterleave_ycbcr(&row, &mut y, &mut cb, &mut cr);
        assert_eq!(y, [10, 11]);
        assert_eq!(cb, [20, 21]);
        assert_eq!(cr, [30, 31]);
    }

    #[test]
    fn test_extend_row() {
        let mut dst = [0u8; 6];
        extend_row(&[1, 2, 3], &mut dst);
        assert_eq!(dst, [1, 2, 3, 3, 3, 3]);

        let mut short = [0u8; 2];
        extend_row(&[1, 2, 3], &mut short);
        assert_eq!(short, [1, 2]);
    }

    #[test]
    fn test_layout_channels() {
        assert_eq!(PixelLayout::Gray.channels(), 1);
        assert_eq!(PixelLayout::Rgba.channels(), 4);
        assert_eq!(PixelLayout::Rgba.engine_channels(), 3);
        assert!(matches!(
            PixelLayout::Rgba.engine_colorspace(),
            J_COLOR_SPACE::JCS_RGB
        ));
        assert!(matches!(
            PixelLayout::YCbCr.engine_colorspace(),
            J_COLOR_SPACE::JCS_YCbCr
        ));
    }

    #[test]
    fn test_ycbcr_primaries() {
        let red = rgb_to_ycbcr([255, 0, 0]);
        assert_eq!(red, [76, 85, 255]);
        let back = ycbcr_to_rgb(red[0], red[1], red[2]);
        for (got, want) in back.iter().zip([255u8, 0, 0]) {
            assert!((*got as i32 - want as i32).abs() <= 2);
        }
    }
}

// ============================================================================
// Property-Based Tests
// ============================================================================

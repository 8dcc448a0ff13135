//! JPEG encoding through the native engine.
//!
//! Compressed output is pushed to the caller's writer in 16 KiB chunks as
//! the engine produces it. Packed sources (gray, RGB, RGBA, interleaved
//! YCbCr) go through the engine's scanline interface, which converts colour
//! and downsamples chroma. Planar sources go through the raw-data interface
//! and keep their own subsampling.
//!
//! # Examples
//!
//! ```ignore
//! use jpeg_bridge::{encode_to_vec, EncodeOptions, EncodeSource};
//!
//! let img = image::RgbImage::from_pixel(100, 100, image::Rgb([128, 128, 128]));
//! let jpeg = encode_to_vec(EncodeSource::from(&img), &EncodeOptions::new().with_quality(90))?;
//! println!("Encoded {} bytes", jpeg.len());
//! ```

mod compressor;
mod destination;

use std::io::Write;

use image::{DynamicImage, GrayImage, RgbImage, RgbaImage};

use crate::adapter::{self, PixelLayout};
use crate::geometry::PlaneSet;
use crate::types::{validate_dimensions, CodecError, EncodeOptions};
use compressor::{Compressor, InputFormat};

/// Pixels to encode, borrowed from the caller.
#[derive(Debug, Clone, Copy)]
pub enum EncodeSource<'a> {
    /// Interleaved pixels, `width * height * layout.channels()` bytes, rows
    /// packed without padding.
    Packed {
        layout: PixelLayout,
        width: u32,
        height: u32,
        pixels: &'a [u8],
    },
    /// Gray or YCbCr planes.
    Planes(&'a PlaneSet),
}

impl<'a> EncodeSource<'a> {
    pub fn packed(layout: PixelLayout, width: u32, height: u32, pixels: &'a [u8]) -> Self {
        EncodeSource::Packed {
            layout,
            width,
            height,
            pixels,
        }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        match self {
            EncodeSource::Packed { width, height, .. } => (*width, *height),
            EncodeSource::Planes(planes) => (planes.width(), planes.height()),
        }
    }

    /// Check dimensions and buffer size before anything reaches the writer.
    fn validate(&self) -> Result<(), CodecError> {
        let (width, height) = self.dimensions();
        validate_dimensions(width, height)?;
        if let EncodeSource::Packed { layout, pixels, .. } = self {
            let expected = width as usize * height as usize * layout.channels();
            if pixels.len() != expected {
                return Err(CodecError::InvalidPixelData {
                    expected,
                    actual: pixels.len(),
                });
            }
        }
        Ok(())
    }
}

impl<'a> From<&'a GrayImage> for EncodeSource<'a> {
    fn from(img: &'a GrayImage) -> Self {
        EncodeSource::packed(PixelLayout::Gray, img.width(), img.height(), img.as_raw())
    }
}

impl<'a> From<&'a RgbImage> for EncodeSource<'a> {
    fn from(img: &'a RgbImage) -> Self {
        EncodeSource::packed(PixelLayout::Rgb, img.width(), img.height(), img.as_raw())
    }
}

impl<'a> From<&'a RgbaImage> for EncodeSource<'a> {
    fn from(img: &'a RgbaImage) -> Self {
        EncodeSource::packed(PixelLayout::Rgba, img.width(), img.height(), img.as_raw())
    }
}

impl<'a> From<&'a PlaneSet> for EncodeSource<'a> {
    fn from(planes: &'a PlaneSet) -> Self {
        EncodeSource::Planes(planes)
    }
}

impl<'a> TryFrom<&'a DynamicImage> for EncodeSource<'a> {
    type Error = CodecError;

    fn try_from(img: &'a DynamicImage) -> Result<Self, Self::Error> {
        match img {
            DynamicImage::ImageLuma8(gray) => Ok(gray.into()),
            DynamicImage::ImageRgb8(rgb) => Ok(rgb.into()),
            DynamicImage::ImageRgba8(rgba) => Ok(rgba.into()),
            other => Err(CodecError::UnsupportedFormat(format!(
                "{:?} pixels; convert to 8-bit gray, RGB or RGBA first",
                other.color()
            ))),
        }
    }
}

/// Encode `source` as JPEG into `writer`.
///
/// Nothing is written when the source is rejected up front.
///
/// # Errors
///
/// - `InvalidDimensions` for zero or oversized dimensions
/// - `InvalidPixelData` if a packed buffer does not match its dimensions
/// - `Io` if the writer fails
/// - `UnsupportedFormat` if the engine rejects the parameters
pub fn encode<W: Write>(
    writer: W,
    source: EncodeSource<'_>,
    options: &EncodeOptions,
) -> Result<(), CodecError> {
    source.validate()?;
    let (width, height) = source.dimensions();

    let mut session = Compressor::open(writer)?;
    match source {
        EncodeSource::Packed { layout, pixels, .. } => {
            session.configure(width, height, InputFormat::Packed(layout), options)?;
            session.start()?;
            let row_len = width as usize * layout.channels();
            if layout.channels() == layout.engine_channels() {
                session.write_packed(pixels, row_len)?;
            } else {
                let engine_len = width as usize * layout.engine_channels();
                session.write_converted(engine_len, |y, row| {
                    adapter::strip_alpha(&pixels[y * row_len..(y + 1) * row_len], row);
                })?;
            }
        }
        EncodeSource::Planes(planes) => {
            session.configure(width, height, InputFormat::Raw(planes.ratio()), options)?;
            session.start()?;
            session.write_raw(planes)?;
        }
    }
    let written = session.finish()?;
    log::debug!("encoded {width}x{height} into {written} bytes");
    Ok(())
}

/// Encode `source` into a new buffer.
pub fn encode_to_vec(source: EncodeSource<'_>, options: &EncodeOptions) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::new();
    encode(&mut out, source, options)?;
    Ok(out)
}


// ============================================================================
// Property-Based Tests
// ============================================================================

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    /// Strategy for generating image dimensions (keep small for speed).
    fn dimensions_strategy() -> impl Strategy<Value = (u32, u32)> {
        (1u32..=50, 1u32..=50)
    }

    /// Strategy for generating quality values.
    fn quality_strategy() -> impl Strategy<Value = u8> {
        1u8..=100
    }

    fn encode_rgb(pixels: &[u8], width: u32, height: u32, quality: u8) -> Result<Vec<u8>, CodecError> {
        encode_to_vec(
            EncodeSource::packed(PixelLayout::Rgb, width, height, pixels),
            &EncodeOptions::new().with_quality(quality),
        )
    }

    proptest! {
        /// Property: Encoding always produces valid JPEG when given valid input.
        #[test]
        fn prop_valid_input_produces_valid_jpeg(
            (width, height) in dimensions_strategy(),
            quality in quality_strategy(),
        ) {
            let pixels = vec![128u8; (width as usize) * (height as usize) * 3];

            let result = encode_rgb(&pixels, width, height, quality);
            prop_assert!(result.is_ok(), "Valid input should produce valid output");
            let jpeg_bytes = result.unwrap();

            prop_assert_eq!(&jpeg_bytes[0..2], &[0xFF, 0xD8], "Should have SOI marker");
            let len = jpeg_bytes.len();
            prop_assert!(len >= 4, "JPEG should have at least 4 bytes");
            prop_assert_eq!(&jpeg_bytes[len - 2..], &[0xFF, 0xD9], "Should have EOI marker");
        }

        /// Property: Same input always produces same output (deterministic).
        #[test]
        fn prop_deterministic_output(
            (width, height) in (1u32..=20, 1u32..=20),
            quality in quality_strategy(),
        ) {
            let pixels = vec![100u8; (width as usize) * (height as usize) * 3];

            let result1 = encode_rgb(&pixels, width, height, quality);
            let result2 = encode_rgb(&pixels, width, height, quality);

            prop_assert!(result1.is_ok() && result2.is_ok());
            prop_assert_eq!(result1.unwrap(), result2.unwrap(), "Same input should produce same output");
        }

        /// Property: Invalid pixel data length always returns error.
        #[test]
        fn prop_invalid_pixel_length_returns_error(
            (width, height) in dimensions_strategy(),
            extra_or_missing in -10i32..=10,
        ) {
            prop_assume!(extra_or_missing != 0);

            let expected_size = (width as usize) * (height as usize) * 3;
            let actual_size = if extra_or_missing > 0 {
                expected_size + extra_or_missing as usize
            } else {
                expected_size.saturating_sub((-extra_or_missing) as usize)
            };
            prop_assume!(actual_size != expected_size);

            let pixels = vec![128u8; actual_size];
            let mut out = Vec::new();
            let result = encode(
                &mut out,
                EncodeSource::packed(PixelLayout::Rgb, width, height, &pixels),
                &EncodeOptions::default(),
            );

            prop_assert!(
                matches!(result, Err(CodecError::InvalidPixelData { .. })),
                "Mismatched pixel data should return InvalidPixelData error"
            );
            prop_assert!(out.is_empty());
        }

        /// Property: All quality values in range produce valid output.
        #[test]
        fn prop_all_quality_values_work(quality in 0u8..=255) {
            let pixels = vec![128u8; 10 * 10 * 3];
            let result = encode_rgb(&pixels, 10, 10, quality);
            prop_assert!(result.is_ok(), "Quality {} should work after clamping", quality);
        }

        /// Property: Planes of any size and ratio encode, including sizes that
        /// are not a multiple of the MCU.
        #[test]
        fn prop_planes_any_geometry(
            (width, height) in dimensions_strategy(),
            ratio in prop::sample::select(crate::geometry::SubsamplingRatio::ALL.to_vec()),
        ) {
            let planes = PlaneSet::new_ycbcr(width, height, ratio).unwrap();
            let jpeg = encode_to_vec((&planes).into(), &EncodeOptions::default());
            prop_assert!(jpeg.is_ok(), "{}x{} at {} failed: {:?}", width, height, ratio, jpeg.err());
        }

        /// Property: Aspect ratios don't affect encoding success.
        #[test]
        fn prop_aspect_ratio_independence(
            short_side in 5u32..=20,
            ratio in 1u32..=10,
        ) {
            let long_side = short_side * ratio;

            let pixels = vec![128u8; (long_side * short_side * 3) as usize];
            prop_assert!(encode_rgb(&pixels, long_side, short_side, 90).is_ok(), "Wide image should encode");
            prop_assert!(encode_rgb(&pixels, short_side, long_side, 90).is_ok(), "Tall image should encode");
        }
    }
}

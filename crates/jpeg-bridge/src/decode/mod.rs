//! JPEG decoding through the native engine.
//!
//! Every operation here runs one complete session: open, read the header,
//! configure, stream scanlines, finish. Compressed bytes are pulled from the
//! caller's reader on demand, so nothing is buffered beyond one 16 KiB
//! window.
//!
//! - [`decode`] keeps the stream's own representation: planar YCbCr (at the
//!   stream's subsampling when unscaled), a single gray plane, or packed RGB
//!   for RGB-coded streams.
//! - [`decode_into_rgb`] and [`decode_into_rgba`] let the engine convert to
//!   packed pixels.
//! - [`decode_header`] reads dimensions and colour model without decoding.
//!
//! # Examples
//!
//! ```ignore
//! use jpeg_bridge::{decode, DecodeOptions};
//!
//! let file = std::fs::File::open("photo.jpg")?;
//! let image = decode(std::io::BufReader::new(file), &DecodeOptions::new().with_scale_target(256, 256))?;
//! println!("Decoded {}x{} image", image.width(), image.height());
//! ```

mod decompressor;
mod header;
mod scale;
mod source;

use std::io::Read;

use image::{RgbImage, RgbaImage};

use crate::adapter::{self, PixelLayout};
use crate::geometry::{PlaneSet, SubsamplingRatio};
use crate::session::{capabilities, Capabilities};
use crate::types::{CodecError, ColorModel, DecodeOptions, ImageInfo};
use decompressor::{Decompressor, RowSink};

pub use scale::{ScaleFactor, SCALE_DENOMINATOR};

/// Pixels produced by [`decode`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedImage {
    /// Gray or YCbCr planes.
    Planes(PlaneSet),
    /// Packed RGB, for streams stored without a YCbCr transform.
    Rgb(RgbImage),
}

impl DecodedImage {
    pub fn width(&self) -> u32 {
        match self {
            DecodedImage::Planes(planes) => planes.width(),
            DecodedImage::Rgb(img) => img.width(),
        }
    }

    pub fn height(&self) -> u32 {
        match self {
            DecodedImage::Planes(planes) => planes.height(),
            DecodedImage::Rgb(img) => img.height(),
        }
    }

    /// Planes, unless the stream was RGB-coded.
    pub fn planes(&self) -> Option<&PlaneSet> {
        match self {
            DecodedImage::Planes(planes) => Some(planes),
            DecodedImage::Rgb(_) => None,
        }
    }

    pub fn into_planes(self) -> Option<PlaneSet> {
        match self {
            DecodedImage::Planes(planes) => Some(planes),
            DecodedImage::Rgb(_) => None,
        }
    }

    /// Packed RGB copy of the pixels.
    pub fn to_rgb8(&self) -> RgbImage {
        match self {
            DecodedImage::Planes(planes) => planes.to_rgb_image(),
            DecodedImage::Rgb(img) => img.clone(),
        }
    }
}

/// Decode a JPEG stream into its native representation.
///
/// YCbCr streams come back as planes. Without scaling they keep the
/// stream's subsampling (4:4:4, 4:4:0, 4:2:2 or 4:2:0) and are read with the
/// engine's raw-data interface; scaled decodes and other ratios come back
/// as full-resolution 4:4:4 planes. Gray streams yield a single plane.
///
/// # Errors
///
/// - `MalformedInput` for corrupt, truncated or non-JPEG data
/// - `UnsupportedFormat` for CMYK and YCCK streams
/// - `Io` if the reader fails
pub fn decode<R: Read>(reader: R, options: &DecodeOptions) -> Result<DecodedImage, CodecError> {
    let mut session = Decompressor::open(reader)?;
    session.read_header(false)?;
    let info = session.info();

    let image = match info.color_model {
        ColorModel::Gray => DecodedImage::Planes(read_gray(&mut session, options)?),
        ColorModel::YCbCr if info.components == 3 => {
            DecodedImage::Planes(read_ycbcr(&mut session, &info, options)?)
        }
        ColorModel::Rgb if info.components == 3 => {
            DecodedImage::Rgb(read_rgb(&mut session, options)?)
        }
        model => {
            return Err(session.reject(CodecError::UnsupportedFormat(format!(
                "cannot decode {model:?} stream with {} components",
                info.components
            ))))
        }
    };
    session.finish()?;
    Ok(image)
}

/// Decode to packed RGB, letting the engine convert colour.
pub fn decode_into_rgb<R: Read>(reader: R, options: &DecodeOptions) -> Result<RgbImage, CodecError> {
    let mut session = Decompressor::open(reader)?;
    session.read_header(false)?;
    require_rgb_convertible(&mut session)?;
    let img = read_rgb(&mut session, options)?;
    session.finish()?;
    Ok(img)
}

/// Decode to packed RGBA with opaque alpha.
///
/// # Errors
///
/// `UnsupportedFormat` if the linked engine cannot produce four-component
/// output (see [`crate::supports_rgba`]), before any data is read.
pub fn decode_into_rgba<R: Read>(
    reader: R,
    options: &DecodeOptions,
) -> Result<RgbaImage, CodecError> {
    decode_into_rgba_with(reader, options, capabilities())
}

pub(crate) fn decode_into_rgba_with<R: Read>(
    reader: R,
    options: &DecodeOptions,
    caps: Capabilities,
) -> Result<RgbaImage, CodecError> {
    if !caps.rgba_output {
        return Err(CodecError::UnsupportedFormat(
            "RGBA output is not available in this engine build".to_string(),
        ));
    }
    let mut session = Decompressor::open(reader)?;
    session.read_header(false)?;
    require_rgb_convertible(&mut session)?;

    let (width, height) = session.configure(PixelLayout::Rgba, options, false)?;
    let row_len = width as usize * PixelLayout::Rgba.channels();
    let mut buf = vec![0u8; row_len * height as usize];
    session.start()?;
    let mut expand = |y: usize, row: &[u8]| {
        adapter::expand_rgb_to_rgba(row, &mut buf[y * row_len..(y + 1) * row_len]);
    };
    session.read_scanlines(RowSink::Convert(&mut expand))?;
    session.finish()?;

    RgbaImage::from_raw(width, height, buf).ok_or_else(|| {
        CodecError::InternalInvariant(format!("RGBA buffer does not match {width}x{height}"))
    })
}

/// Read the stream header without decoding pixels.
///
/// Also reports the EXIF orientation when the stream carries one.
pub fn decode_header<R: Read>(reader: R) -> Result<ImageInfo, CodecError> {
    let mut session = Decompressor::open(reader)?;
    session.read_header(true)?;
    Ok(session.info())
}

fn require_rgb_convertible<R: Read>(session: &mut Decompressor<R>) -> Result<(), CodecError> {
    match session.color_model() {
        ColorModel::Gray | ColorModel::YCbCr | ColorModel::Rgb => Ok(()),
        model => Err(session.reject(CodecError::UnsupportedFormat(format!(
            "cannot convert {model:?} stream to RGB"
        )))),
    }
}

fn read_gray<R: Read>(
    session: &mut Decompressor<R>,
    options: &DecodeOptions,
) -> Result<PlaneSet, CodecError> {
    let (width, height) = session.configure(PixelLayout::Gray, options, false)?;
    let mut planes = PlaneSet::new_gray(width, height)?;
    session.start()?;
    if let PlaneSet::Gray(plane) = &mut planes {
        let stride = plane.stride();
        session.read_scanlines(RowSink::Direct {
            buf: plane.data_mut(),
            stride,
        })?;
    }
    Ok(planes)
}

fn read_ycbcr<R: Read>(
    session: &mut Decompressor<R>,
    info: &ImageInfo,
    options: &DecodeOptions,
) -> Result<PlaneSet, CodecError> {
    let unscaled = ScaleFactor::select(info.width, info.height, options.scale_target).is_identity();
    if let Some(ratio) = info.subsampling.filter(|_| unscaled) {
        let (width, height) = session.configure(PixelLayout::YCbCr, options, true)?;
        let mut planes = PlaneSet::new_ycbcr(width, height, ratio)?;
        session.start()?;
        session.read_raw(&mut planes)?;
        return Ok(planes);
    }

    if unscaled {
        log::debug!("no planar path for this sampling layout, decoding to 4:4:4");
    }
    let (width, height) = session.configure(PixelLayout::YCbCr, options, false)?;
    let mut planes = PlaneSet::new_ycbcr(width, height, SubsamplingRatio::Ratio444)?;
    session.start()?;
    if let PlaneSet::YCbCr { y, cb, cr, .. } = &mut planes {
        let mut split = |row: usize, samples: &[u8]| {
            adapter::deinterleave_ycbcr(samples, y.row_mut(row), cb.row_mut(row), cr.row_mut(row));
        };
        session.read_scanlines(RowSink::Convert(&mut split))?;
    }
    Ok(planes)
}

fn read_rgb<R: Read>(
    session: &mut Decompressor<R>,
    options: &DecodeOptions,
) -> Result<RgbImage, CodecError> {
    let (width, height) = session.configure(PixelLayout::Rgb, options, false)?;
    let row_len = width as usize * PixelLayout::Rgb.channels();
    let mut buf = vec![0u8; row_len * height as usize];
    session.start()?;
    session.read_scanlines(RowSink::Direct {
        buf: &mut buf,
        stride: row_len,
    })?;
    RgbImage::from_raw(width, height, buf).ok_or_else(|| {
        CodecError::InternalInvariant(format!("RGB buffer does not match {width}x{height}"))
    })
}

//! Block-aligned plane storage.
//!
//! The engine moves pixels in whole blocks: raw-data transfers write every
//! block of the last partial MCU column and row, so a plane must be
//! addressable past its logical edge. Every plane here is laid out with a
//! stride and row count of `round_up(n, ALIGN) + ALIGN`, which covers the
//! largest MCU (16x16 at 4:2:0) at any image size.
//!
//! Logical (unpadded) width and height are kept alongside so readers can
//! crop at the boundary.

use image::{GrayImage, RgbImage};
use serde::{Deserialize, Serialize};

use crate::adapter;
use crate::types::{validate_dimensions, CodecError};

/// Alignment unit in pixels.
pub const ALIGN: usize = 16;

/// Pixels per block side in the engine's transform.
pub const BLOCK_SIZE: usize = 8;

/// Padded extent for a logical extent `n`.
#[inline]
pub fn aligned_extent(n: usize) -> usize {
    n.div_ceil(ALIGN) * ALIGN + ALIGN
}

/// Chroma subsampling relative to the luma plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubsamplingRatio {
    /// No chroma reduction.
    Ratio444,
    /// Half vertical chroma resolution.
    Ratio440,
    /// Half horizontal chroma resolution.
    Ratio422,
    /// Half chroma resolution on both axes.
    Ratio420,
}

impl SubsamplingRatio {
    pub const ALL: [SubsamplingRatio; 4] = [
        SubsamplingRatio::Ratio444,
        SubsamplingRatio::Ratio440,
        SubsamplingRatio::Ratio422,
        SubsamplingRatio::Ratio420,
    ];

    /// Horizontal and vertical chroma divisors.
    ///
    /// These double as the luma sampling factors handed to the engine, with
    /// both chroma components at 1x1.
    pub fn divisors(self) -> (usize, usize) {
        match self {
            SubsamplingRatio::Ratio444 => (1, 1),
            SubsamplingRatio::Ratio440 => (1, 2),
            SubsamplingRatio::Ratio422 => (2, 1),
            SubsamplingRatio::Ratio420 => (2, 2),
        }
    }

    /// MCU size in luma pixels.
    pub fn mcu_size(self) -> (usize, usize) {
        let (h, v) = self.divisors();
        (BLOCK_SIZE * h, BLOCK_SIZE * v)
    }

    /// Logical chroma plane size for a `width`x`height` image.
    pub fn chroma_dimensions(self, width: u32, height: u32) -> (u32, u32) {
        let (h, v) = self.divisors();
        (width.div_ceil(h as u32), height.div_ceil(v as u32))
    }

    /// Derive the ratio from luma and chroma sampling factors.
    ///
    /// Returns `None` for layouts outside the four supported ratios, such as
    /// 4:1:1 or chroma sampled more densely than luma.
    pub fn from_sampling(luma: (i32, i32), chroma: (i32, i32)) -> Option<Self> {
        let (lh, lv) = luma;
        let (ch, cv) = chroma;
        if ch <= 0 || cv <= 0 || lh % ch != 0 || lv % cv != 0 {
            return None;
        }
        match (lh / ch, lv / cv) {
            (1, 1) => Some(SubsamplingRatio::Ratio444),
            (1, 2) => Some(SubsamplingRatio::Ratio440),
            (2, 1) => Some(SubsamplingRatio::Ratio422),
            (2, 2) => Some(SubsamplingRatio::Ratio420),
            _ => None,
        }
    }
}

impl std::fmt::Display for SubsamplingRatio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SubsamplingRatio::Ratio444 => "4:4:4",
            SubsamplingRatio::Ratio440 => "4:4:0",
            SubsamplingRatio::Ratio422 => "4:2:2",
            SubsamplingRatio::Ratio420 => "4:2:0",
        };
        f.write_str(s)
    }
}

/// One 8-bit sample plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plane {
    data: Vec<u8>,
    stride: usize,
    width: u32,
    height: u32,
}

impl Plane {
    /// Allocate a zeroed, block-aligned plane for a logical `width`x`height`.
    pub fn aligned(width: u32, height: u32) -> Self {
        let stride = aligned_extent(width as usize);
        let rows = aligned_extent(height as usize);
        Self {
            data: vec![0; stride * rows],
            stride,
            width,
            height,
        }
    }

    /// Wrap caller-owned samples.
    ///
    /// `data` must hold `height` rows of `stride` bytes, except that the last
    /// row only needs `width` bytes. Padding is not required: the encoder
    /// extends edges itself.
    pub fn from_raw(
        width: u32,
        height: u32,
        stride: usize,
        data: Vec<u8>,
    ) -> Result<Self, CodecError> {
        validate_dimensions(width, height)?;
        if stride < width as usize {
            return Err(CodecError::BufferTooSmall {
                expected: width as usize,
                actual: stride,
            });
        }
        let expected = stride
            .checked_mul(height as usize - 1)
            .and_then(|n| n.checked_add(width as usize))
            .ok_or(CodecError::BufferTooSmall {
                expected: usize::MAX,
                actual: data.len(),
            })?;
        if data.len() < expected {
            return Err(CodecError::BufferTooSmall {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            data,
            stride,
            width,
            height,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Row length in bytes, including alignment padding.
    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Rows backed by storage, including alignment padding.
    pub fn allocated_rows(&self) -> usize {
        self.data.len() / self.stride
    }

    /// Full storage, padding included.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub(crate) fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// Logical samples of row `y` (padding cropped).
    pub fn row(&self, y: usize) -> &[u8] {
        let start = y * self.stride;
        &self.data[start..start + self.width as usize]
    }

    pub fn row_mut(&mut self, y: usize) -> &mut [u8] {
        let start = y * self.stride;
        let width = self.width as usize;
        &mut self.data[start..start + width]
    }

    /// Whole padded row `y`, or `None` past the allocated rows.
    pub(crate) fn padded_row_mut(&mut self, y: usize) -> Option<&mut [u8]> {
        let start = y.checked_mul(self.stride)?;
        self.data.get_mut(start..start + self.stride)
    }

    /// Sample at `(x, y)`.
    #[inline]
    pub fn sample(&self, x: usize, y: usize) -> u8 {
        self.data[y * self.stride + x]
    }

    /// Copy the logical area into a tightly packed buffer.
    pub fn to_packed(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.width as usize * self.height as usize);
        for y in 0..self.height as usize {
            out.extend_from_slice(self.row(y));
        }
        out
    }
}

/// Pixel storage for one image: a single luma plane, or luma plus two
/// chroma planes at a subsampling ratio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaneSet {
    Gray(Plane),
    YCbCr {
        y: Plane,
        cb: Plane,
        cr: Plane,
        ratio: SubsamplingRatio,
    },
}

impl PlaneSet {
    /// Allocate an aligned grayscale plane set.
    pub fn new_gray(width: u32, height: u32) -> Result<Self, CodecError> {
        validate_dimensions(width, height)?;
        Ok(PlaneSet::Gray(Plane::aligned(width, height)))
    }

    /// Allocate aligned Y, Cb and Cr planes for `ratio`.
    pub fn new_ycbcr(width: u32, height: u32, ratio: SubsamplingRatio) -> Result<Self, CodecError> {
        validate_dimensions(width, height)?;
        let (cw, ch) = ratio.chroma_dimensions(width, height);
        Ok(PlaneSet::YCbCr {
            y: Plane::aligned(width, height),
            cb: Plane::aligned(cw, ch),
            cr: Plane::aligned(cw, ch),
            ratio,
        })
    }

    /// Assemble caller-owned planes, checking they agree with `ratio`.
    pub fn from_planes(
        y: Plane,
        cb: Plane,
        cr: Plane,
        ratio: SubsamplingRatio,
    ) -> Result<Self, CodecError> {
        let expected = ratio.chroma_dimensions(y.width, y.height);
        for chroma in [&cb, &cr] {
            if (chroma.width, chroma.height) != expected {
                return Err(CodecError::InvalidDimensions {
                    width: chroma.width,
                    height: chroma.height,
                });
            }
        }
        Ok(PlaneSet::YCbCr { y, cb, cr, ratio })
    }

    /// Luma plane.
    pub fn luma(&self) -> &Plane {
        match self {
            PlaneSet::Gray(plane) => plane,
            PlaneSet::YCbCr { y, .. } => y,
        }
    }

    pub fn width(&self) -> u32 {
        self.luma().width
    }

    pub fn height(&self) -> u32 {
        self.luma().height
    }

    /// Subsampling ratio, `None` for grayscale.
    pub fn ratio(&self) -> Option<SubsamplingRatio> {
        match self {
            PlaneSet::Gray(_) => None,
            PlaneSet::YCbCr { ratio, .. } => Some(*ratio),
        }
    }

    /// Planes in engine component order.
    pub fn planes(&self) -> Vec<&Plane> {
        match self {
            PlaneSet::Gray(plane) => vec![plane],
            PlaneSet::YCbCr { y, cb, cr, .. } => vec![y, cb, cr],
        }
    }

    pub(crate) fn planes_mut(&mut self) -> Vec<&mut Plane> {
        match self {
            PlaneSet::Gray(plane) => vec![plane],
            PlaneSet::YCbCr { y, cb, cr, .. } => vec![y, cb, cr],
        }
    }

    /// Luma as a packed grayscale image.
    pub fn to_gray_image(&self) -> Option<GrayImage> {
        let luma = self.luma();
        GrayImage::from_raw(luma.width, luma.height, luma.to_packed())
    }

    /// Convert to packed RGB using full-range JFIF coefficients.
    pub fn to_rgb_image(&self) -> RgbImage {
        let (width, height) = (self.width(), self.height());
        let mut out = RgbImage::new(width, height);
        match self {
            PlaneSet::Gray(plane) => {
                for (x, y, px) in out.enumerate_pixels_mut() {
                    let v = plane.sample(x as usize, y as usize);
                    px.0 = [v, v, v];
                }
            }
            PlaneSet::YCbCr {
                y: luma,
                cb,
                cr,
                ratio,
            } => {
                let (h, v) = ratio.divisors();
                for (x, y, px) in out.enumerate_pixels_mut() {
                    let (x, y) = (x as usize, y as usize);
                    px.0 = adapter::ycbcr_to_rgb(
                        luma.sample(x, y),
                        cb.sample(x / h, y / v),
                        cr.sample(x / h, y / v),
                    );
                }
            }
        }
        out
    }

    /// Convert packed RGB into aligned YCbCr planes, box-averaging chroma.
    pub fn from_rgb_image(img: &RgbImage, ratio: SubsamplingRatio) -> Result<Self, CodecError> {
        let (width, height) = img.dimensions();
        let mut set = PlaneSet::new_ycbcr(width, height, ratio)?;
        if let PlaneSet::YCbCr { y, cb, cr, .. } = &mut set {
            let (h, v) = ratio.divisors();
            for row in 0..height as usize {
                let dst = y.row_mut(row);
                for (col, sample) in dst.iter_mut().enumerate() {
                    let px = img.get_pixel(col as u32, row as u32).0;
                    *sample = adapter::rgb_to_ycbcr(px)[0];
                }
            }
            for crow in 0..cb.height() as usize {
                for ccol in 0..cb.width() as usize {
                    let (mut sum_cb, mut sum_cr, mut count) = (0u32, 0u32, 0u32);
                    for dy in 0..v {
                        for dx in 0..h {
                            let (sx, sy) = (ccol * h + dx, crow * v + dy);
                            if sx < width as usize && sy < height as usize {
                                let [_, pb, pr] =
                                    adapter::rgb_to_ycbcr(img.get_pixel(sx as u32, sy as u32).0);
                                sum_cb += pb as u32;
                                sum_cr += pr as u32;
                                count += 1;
                            }
                        }
                    }
                    cb.row_mut(crow)[ccol] = ((sum_cb + count / 2) / count) as u8;
                    cr.row_mut(crow)[ccol] = ((sum_cr + count / 2) / count) as u8;
                }
            }
        }
        Ok(set)
    }
}


// ============================================================================
// Property-Based Tests
// ============================================================================

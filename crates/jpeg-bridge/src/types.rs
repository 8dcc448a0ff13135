//! Core types shared by the decode and encode pipelines.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::geometry::SubsamplingRatio;

/// Largest width or height the JPEG format can carry.
pub const MAX_DIMENSION: u32 = 65_500;

/// Broad classification of a [`CodecError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Header or entropy-coded data is corrupt, truncated or not JPEG at all.
    MalformedInput,
    /// Valid input that this build cannot produce or consume.
    UnsupportedFormat,
    /// The underlying reader or writer failed.
    IoFailure,
    /// Zero or oversized dimensions, or a buffer too small for its geometry.
    InvalidDimensions,
    /// A bridge bookkeeping error. Indicates a bug, not bad input.
    InternalInvariant,
}

/// Error types for JPEG decode and encode sessions.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The engine rejected the compressed stream.
    #[error("Malformed JPEG data{}: {message}", scanline_suffix(.scanline))]
    MalformedInput {
        message: String,
        /// Output scanline the engine had reached, if streaming had started.
        scanline: Option<u32>,
    },

    /// The stream or pixel layout is valid but not supported by this build.
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    /// I/O error from the abstract source or sink.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Width or height is zero or above the format limit.
    #[error("Invalid dimensions: {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },

    /// Packed pixel data does not match its declared dimensions.
    #[error("Invalid pixel data: expected {expected} bytes, got {actual}")]
    InvalidPixelData { expected: usize, actual: usize },

    /// A caller-provided buffer cannot hold its declared geometry.
    #[error("Buffer too small: expected at least {expected} bytes, got {actual}")]
    BufferTooSmall { expected: usize, actual: usize },

    /// Registry or geometry bookkeeping went wrong inside the bridge.
    #[error("Internal invariant violated: {0}")]
    InternalInvariant(String),
}

fn scanline_suffix(scanline: &Option<u32>) -> String {
    match scanline {
        Some(line) => format!(" at scanline {line}"),
        None => String::new(),
    }
}

impl CodecError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CodecError::MalformedInput { .. } => ErrorKind::MalformedInput,
            CodecError::UnsupportedFormat(_) => ErrorKind::UnsupportedFormat,
            CodecError::Io(_) => ErrorKind::IoFailure,
            CodecError::InvalidDimensions { .. }
            | CodecError::InvalidPixelData { .. }
            | CodecError::BufferTooSmall { .. } => ErrorKind::InvalidDimensions,
            CodecError::InternalInvariant(_) => ErrorKind::InternalInvariant,
        }
    }

    pub(crate) fn malformed(message: impl Into<String>) -> Self {
        CodecError::MalformedInput {
            message: message.into(),
            scanline: None,
        }
    }

    /// Attach a scanline coordinate to malformed-input errors.
    pub(crate) fn at_scanline(self, line: u32) -> Self {
        match self {
            CodecError::MalformedInput {
                message,
                scanline: None,
            } => CodecError::MalformedInput {
                message,
                scanline: Some(line),
            },
            other => other,
        }
    }
}

/// Check that a width/height pair can be handed to the engine.
pub(crate) fn validate_dimensions(width: u32, height: u32) -> Result<(), CodecError> {
    if width == 0 || height == 0 || width > MAX_DIMENSION || height > MAX_DIMENSION {
        return Err(CodecError::InvalidDimensions { width, height });
    }
    Ok(())
}

/// Discrete cosine transform implementation used by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DctMethod {
    /// Accurate integer transform.
    #[default]
    IntegerSlow,
    /// Faster, less accurate integer transform.
    IntegerFast,
    /// Floating-point transform.
    Float,
}

impl DctMethod {
    pub(crate) fn to_engine(self) -> mozjpeg_sys::J_DCT_METHOD {
        match self {
            DctMethod::IntegerSlow => mozjpeg_sys::J_DCT_METHOD::JDCT_ISLOW,
            DctMethod::IntegerFast => mozjpeg_sys::J_DCT_METHOD::JDCT_IFAST,
            DctMethod::Float => mozjpeg_sys::J_DCT_METHOD::JDCT_FLOAT,
        }
    }
}

/// Bounding box a scaled decode should cover.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScaleTarget {
    pub width: u32,
    pub height: u32,
}

impl ScaleTarget {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// An empty box requests no scaling.
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// Options recognised by the decode operations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecodeOptions {
    /// Downscale with the engine's scaled IDCT so the output covers this box.
    pub scale_target: Option<ScaleTarget>,
    /// IDCT implementation.
    pub dct_method: DctMethod,
    /// Skip inter-block smoothing of progressive scans.
    pub disable_block_smoothing: bool,
    /// Use box-filter chroma upsampling instead of the triangle filter.
    pub disable_fancy_upsampling: bool,
}

impl DecodeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a downscaled decode covering `width`x`height`.
    pub fn with_scale_target(mut self, width: u32, height: u32) -> Self {
        self.scale_target = Some(ScaleTarget::new(width, height));
        self
    }
}

/// Options recognised by the encode operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncodeOptions {
    /// Quantization quality, 0 to 100. Values above 100 are clamped.
    pub quality: u8,
    /// Compute optimal Huffman tables (an extra pass over the data).
    pub optimize_coding: bool,
    /// Emit a progressive scan script instead of a single baseline scan.
    pub progressive: bool,
    /// Forward DCT implementation.
    pub dct_method: DctMethod,
    /// Chroma subsampling for packed RGB/RGBA input. `None` keeps the engine
    /// default (4:2:0). Planar input always keeps its own ratio.
    pub subsampling: Option<SubsamplingRatio>,
}

impl Default for EncodeOptions {
    fn default() -> Self {
        Self {
            quality: 75,
            optimize_coding: false,
            progressive: false,
            dct_method: DctMethod::default(),
            subsampling: None,
        }
    }
}

impl EncodeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quality(mut self, quality: u8) -> Self {
        self.quality = quality;
        self
    }

    /// Quality clamped to the engine's 0-100 range.
    pub fn effective_quality(&self) -> u8 {
        self.quality.min(100)
    }
}

/// Colour model of a JPEG stream as stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColorModel {
    Gray,
    YCbCr,
    /// Three components stored without a YCbCr transform.
    Rgb,
    Cmyk,
    Ycck,
    Unknown,
}

/// EXIF orientation values (1-8).
/// See: https://exiftool.org/TagNames/EXIF.html
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum Orientation {
    /// Normal (no transformation needed).
    #[default]
    Normal = 1,
    /// Horizontal flip.
    FlipHorizontal = 2,
    /// Rotate 180 degrees.
    Rotate180 = 3,
    /// Vertical flip.
    FlipVertical = 4,
    /// Transpose (flip horizontal + rotate 270 CW).
    Transpose = 5,
    /// Rotate 90 degrees clockwise.
    Rotate90CW = 6,
    /// Transverse (flip horizontal + rotate 90 CW).
    Transverse = 7,
    /// Rotate 270 degrees clockwise (90 CCW).
    Rotate270CW = 8,
}

impl Orientation {
    /// Returns true if this orientation swaps width and height dimensions.
    #[inline]
    pub fn swaps_dimensions(self) -> bool {
        matches!(
            self,
            Orientation::Transpose
                | Orientation::Rotate90CW
                | Orientation::Transverse
                | Orientation::Rotate270CW
        )
    }
}

impl From<u32> for Orientation {
    fn from(value: u32) -> Self {
        match value {
            2 => Orientation::FlipHorizontal,
            3 => Orientation::Rotate180,
            4 => Orientation::FlipVertical,
            5 => Orientation::Transpose,
            6 => Orientation::Rotate90CW,
            7 => Orientation::Transverse,
            8 => Orientation::Rotate270CW,
            _ => Orientation::Normal,
        }
    }
}

/// Header information read without decoding any pixels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageInfo {
    /// Image width in pixels (before orientation correction).
    pub width: u32,
    /// Image height in pixels (before orientation correction).
    pub height: u32,
    pub color_model: ColorModel,
    pub components: u8,
    /// Chroma subsampling of a three-component stream, when it is one of the
    /// ratios the planar path supports.
    pub subsampling: Option<SubsamplingRatio>,
    pub progressive: bool,
    /// EXIF orientation, `Normal` when the stream carries none.
    pub orientation: Orientation,
}

impl ImageInfo {
    /// Get the effective dimensions after orientation correction.
    pub fn oriented_dimensions(&self) -> (u32, u32) {
        if self.orientation.swaps_dimensions() {
            (self.height, self.width)
        } else {
            (self.width, self.height)
        }
    }
}

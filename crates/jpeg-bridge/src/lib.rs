//! JPEG Bridge - streaming JPEG codec on a native engine
//!
//! This crate decodes and encodes JPEG through the libjpeg-turbo API (as
//! built by `mozjpeg-sys`), streaming compressed bytes through any
//! [`std::io::Read`] or [`std::io::Write`]. Decoded pixels land in
//! block-aligned planes or packed `image` buffers; encoding accepts the same.
//!
//! Each call runs one self-contained engine session. Sessions on different
//! threads are independent; [`active_sessions`] reports how many are live.

pub mod adapter;
pub mod decode;
pub mod encode;
pub mod geometry;
mod registry;
mod session;
pub mod types;

pub use adapter::PixelLayout;
pub use decode::{
    decode, decode_header, decode_into_rgb, decode_into_rgba, DecodedImage, ScaleFactor,
};
pub use encode::{encode, encode_to_vec, EncodeSource};
pub use geometry::{Plane, PlaneSet, SubsamplingRatio};
pub use registry::active_sessions;
pub use session::{capabilities, supports_rgba, Capabilities};
pub use types::{
    CodecError, ColorModel, DctMethod, DecodeOptions, EncodeOptions, ErrorKind, ImageInfo,
    Orientation, ScaleTarget, MAX_DIMENSION,
};

//! EXIF orientation from a saved APP1 segment.

use exif::{In, Reader, Tag};

use crate::types::Orientation;

/// Identifier that opens an EXIF APP1 payload.
const EXIF_HEADER: &[u8] = b"Exif\0\0";

/// Extract the orientation tag from an APP1 payload.
///
/// Returns `None` for non-EXIF APP1 segments (XMP, for instance) and for
/// EXIF data without a readable orientation.
pub(crate) fn exif_orientation(app1: &[u8]) -> Option<Orientation> {
    let tiff = app1.strip_prefix(EXIF_HEADER)?;
    match Reader::new().read_raw(tiff.to_vec()) {
        Ok(exif) => exif
            .get_field(Tag::Orientation, In::PRIMARY)
            .and_then(|field| field.value.get_uint(0))
            .map(Orientation::from),
        Err(e) => {
            log::debug!("ignoring unreadable EXIF segment: {e}");
            None
        }
    }
}

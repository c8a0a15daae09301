//! Image thumbnail rendering.

use std::path::Path;

use image::codecs::jpeg::JpegEncoder;
use thiserror::Error;

/// Longest edge of a generated thumbnail, in pixels.
pub const THUMBNAIL_MAX_EDGE: u32 = 360;
const JPEG_QUALITY: u8 = 85;

#[derive(Debug, Error)]
pub enum ThumbnailError {
    #[error("unsupported or corrupt image: {0}")]
    Decode(#[from] image::ImageError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct ThumbnailOutput {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Render a JPEG thumbnail for the image at `path`, preserving aspect
/// ratio within [`THUMBNAIL_MAX_EDGE`] on both sides. Alpha is flattened
/// since JPEG cannot carry it.
pub fn render_thumbnail(path: &Path) -> Result<ThumbnailOutput, ThumbnailError> {
    let bytes = std::fs::read(path)?;
    let decoded = image::load_from_memory(&bytes)?;
    // `thumbnail` fits to the box in both directions, so small images
    // must be kept as-is rather than stretched up
    let thumb = if decoded.width() <= THUMBNAIL_MAX_EDGE && decoded.height() <= THUMBNAIL_MAX_EDGE {
        decoded
    } else {
        decoded.thumbnail(THUMBNAIL_MAX_EDGE, THUMBNAIL_MAX_EDGE)
    };
    let rgb = thumb.to_rgb8();
    let (width, height) = rgb.dimensions();
    let mut data = Vec::new();
    JpegEncoder::new_with_quality(&mut data, JPEG_QUALITY).encode_image(&rgb)?;
    Ok(ThumbnailOutput { data, width, height })
}

/// Pixel dimensions of the image at `path`, or `None` if the format
/// is unreadable. The format is sniffed from content, not the file
/// extension, since assembled uploads carry no meaningful name.
/// Dimension capture is best effort and never fails an upload.
pub fn probe_dimensions(path: &Path) -> Option<(u32, u32)> {
    image::io::Reader::open(path)
        .ok()?
        .with_guessed_format()
        .ok()?
        .into_dimensions()
        .ok()
}

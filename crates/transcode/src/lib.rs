//! Recompress arbitrary raster images into baseline JPEG.
//!
//! Covers are shown as small thumbnails, so whatever the source serves (PNG,
//! WebP, oversized JPEG) is decoded, flattened to RGB and re-encoded at a
//! fixed quality. Transcoding is CPU-bound: async callers should run it on a
//! blocking thread.

pub mod error;

use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use image::ExtendedColorType;
use image::codecs::jpeg::JpegEncoder;

/// Default JPEG quality for cover thumbnails.
pub const DEFAULT_QUALITY: u8 = 80;

/// JPEG re-encoder with a fixed quality.
///
/// # Examples
///
/// ```
/// use kura_transcode::Transcoder;
///
/// let transcoder = Transcoder::new(80).unwrap();
/// assert!(transcoder.to_jpeg(b"not an image").is_err());
/// assert!(Transcoder::new(0).is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transcoder {
    quality: u8,
}

impl Default for Transcoder {
    fn default() -> Self {
        Self { quality: DEFAULT_QUALITY }
    }
}

impl Transcoder {
    /// `quality` must be in `1..=100`.
    pub fn new(quality: u8) -> Result<Self> {
        if !(1..=100).contains(&quality) {
            exn::bail!(ErrorKind::InvalidQuality(quality));
        }
        Ok(Self { quality })
    }

    pub fn quality(&self) -> u8 {
        self.quality
    }

    /// Decode `data` (any format the `image` crate recognizes) and re-encode
    /// it as JPEG. Alpha is discarded.
    pub fn to_jpeg(&self, data: &[u8]) -> Result<Vec<u8>> {
        let decoded = image::load_from_memory(data).or_raise(|| ErrorKind::Decode)?;
        let rgb = decoded.to_rgb8();
        let mut output = Vec::new();
        JpegEncoder::new_with_quality(&mut output, self.quality)
            .encode(rgb.as_raw(), rgb.width(), rgb.height(), ExtendedColorType::Rgb8)
            .or_raise(|| ErrorKind::Encode)?;
        if output.is_empty() {
            exn::bail!(ErrorKind::EmptyOutput);
        }
        tracing::trace!(input = data.len(), output = output.len(), quality = self.quality, "Transcoded image to JPEG");
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, ImageFormat, Rgba};
    use rstest::rstest;
    use std::io::Cursor;

    fn png(width: u32, height: u32) -> Vec<u8> {
        let buffer = ImageBuffer::from_fn(width, height, |x, y| Rgba([(x * 7) as u8, (y * 3) as u8, 128, 200]));
        let mut out = Cursor::new(Vec::new());
        buffer.write_to(&mut out, ImageFormat::Png).unwrap();
        out.into_inner()
    }

    #[test]
    fn test_png_to_jpeg() {
        let jpeg = Transcoder::default().to_jpeg(&png(64, 48)).unwrap();
        // JPEG SOI marker.
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        let decoded = image::load_from_memory_with_format(&jpeg, ImageFormat::Jpeg).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (64, 48));
    }

    #[test]
    fn test_lower_quality_is_smaller() {
        let input = png(128, 128);
        let high = Transcoder::new(100).unwrap().to_jpeg(&input).unwrap();
        let low = Transcoder::new(10).unwrap().to_jpeg(&input).unwrap();
        assert!(low.len() < high.len());
    }

    #[rstest]
    #[case(b"".as_slice())]
    #[case(b"garbage bytes".as_slice())]
    #[case(b"\x89PNG\r\n\x1a\n truncated".as_slice())]
    fn test_undecodable_input(#[case] input: &[u8]) {
        let err = Transcoder::default().to_jpeg(input).unwrap_err();
        assert_eq!(*err, ErrorKind::Decode);
    }

    #[rstest]
    #[case(0, false)]
    #[case(1, true)]
    #[case(80, true)]
    #[case(100, true)]
    #[case(101, false)]
    fn test_quality_bounds(#[case] quality: u8, #[case] valid: bool) {
        assert_eq!(Transcoder::new(quality).is_ok(), valid);
    }
}

// THEORY:
// Image codec contract. Decoding proper is delegated to the `image` crate.

use std::fmt::Debug;

use image::DynamicImage;
use image::imageops::FilterType;

use crate::core_modules::region::{Frame, FrameShape};
use crate::error::CodecError;

pub trait Codec: Send + Sync + Debug {
    /// Decodes `bytes` into a frame of exactly `shape`.
    fn decode(&self, bytes: &[u8], shape: FrameShape) -> Result<Frame, CodecError>;
}

/// Decodes any format the `image` crate recognises, resizing to the target
/// shape when the source dimensions differ.
#[derive(Debug, Clone, Copy)]
pub struct ImageCodec {
    pub filter: FilterType,
}

impl Default for ImageCodec {
    fn default() -> Self {
        Self {
            filter: FilterType::Triangle,
        }
    }
}

impl Codec for ImageCodec {
    fn decode(&self, bytes: &[u8], shape: FrameShape) -> Result<Frame, CodecError> {
        let mut image = image::load_from_memory(bytes)?;
        if image.width() != shape.width || image.height() != shape.height {
            image = image.resize_exact(shape.width, shape.height, self.filter);
        }
        let data = pixels(image, shape.channels)?;
        let actual = data.len();
        Frame::from_raw(shape, data).ok_or(CodecError::SizeMismatch {
            expected: shape.len(),
            actual,
        })
    }
}

fn pixels(image: DynamicImage, channels: u32) -> Result<Vec<u8>, CodecError> {
    match channels {
        1 => Ok(image.to_luma8().into_raw()),
        3 => Ok(image.to_rgb8().into_raw()),
        4 => Ok(image.to_rgba8().into_raw()),
        other => Err(CodecError::UnsupportedChannels(other)),
    }
}

/// Treats the object bytes as an already decoded pixel buffer.
#[derive(Debug, Default, Clone, Copy)]
pub struct RawCodec;

impl Codec for RawCodec {
    fn decode(&self, bytes: &[u8], shape: FrameShape) -> Result<Frame, CodecError> {
        Frame::from_raw(shape, bytes.to_vec()).ok_or(CodecError::SizeMismatch {
            expected: shape.len(),
            actual: bytes.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;

    fn png(width: u32, height: u32, pixel: [u8; 3]) -> Vec<u8> {
        let image = RgbImage::from_pixel(width, height, Rgb(pixel));
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(image)
            .write_to(&mut out, ImageFormat::Png)
            .unwrap();
        out.into_inner()
    }

    #[test]
    fn decodes_and_resizes_to_the_frame_shape() {
        let shape = FrameShape::new(4, 2, 3);
        let frame = ImageCodec::default()
            .decode(&png(8, 8, [10, 20, 30]), shape)
            .unwrap();
        assert_eq!(frame.shape(), shape);
        assert_eq!(&frame.as_bytes()[..3], &[10, 20, 30]);
    }

    #[test]
    fn converts_to_the_requested_channel_count() {
        let frame = ImageCodec::default()
            .decode(&png(2, 2, [200, 200, 200]), FrameShape::new(2, 2, 1))
            .unwrap();
        assert_eq!(frame.as_bytes().len(), 4);
        assert!(matches!(
            ImageCodec::default().decode(&png(2, 2, [0, 0, 0]), FrameShape::new(2, 2, 2)),
            Err(CodecError::UnsupportedChannels(2))
        ));
    }

    #[test]
    fn garbage_is_a_decode_error() {
        assert!(matches!(
            ImageCodec::default().decode(b"not an image", FrameShape::new(1, 1, 3)),
            Err(CodecError::Image(_))
        ));
    }

    #[test]
    fn raw_codec_requires_the_exact_length() {
        let shape = FrameShape::new(1, 1, 3);
        assert!(RawCodec.decode(&[1, 2, 3], shape).is_ok());
        assert!(matches!(
            RawCodec.decode(&[1, 2], shape),
            Err(CodecError::SizeMismatch {
                expected: 3,
                actual: 2
            })
        ));
    }
}

//! Photo preconditions checked before any extraction is attempted.

use crate::error::PreconditionFailure;
use crate::liveness::{check_liveness, LivenessPolicy, LivenessResult};
use image::DynamicImage;

/// Upper bound on accepted photo size (5 MiB).
pub const DEFAULT_MAX_IMAGE_BYTES: usize = 5 * 1024 * 1024;

#[derive(Debug, Clone, Copy)]
pub struct PhotoLimits {
    pub max_bytes: usize,
}

impl Default for PhotoLimits {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_MAX_IMAGE_BYTES,
        }
    }
}

/// A captured photo that decoded successfully.
///
/// Only the encoded bytes are kept; the decoded pixels are dropped once
/// the image has been validated.
#[derive(Debug, Clone)]
pub struct Photo {
    bytes: Vec<u8>,
    width: u32,
    height: u32,
}

impl Photo {
    pub fn decode(bytes: Vec<u8>, limits: &PhotoLimits) -> Result<Self, PreconditionFailure> {
        Self::decode_image(bytes, limits).map(|(photo, _)| photo)
    }

    /// Decodes and runs the liveness checks on the decoded pixels.
    ///
    /// A photo that scores below `policy.min_score` is rejected with
    /// `LivenessFailed`; otherwise the result comes back for the audit
    /// entry.
    pub fn decode_live(
        bytes: Vec<u8>,
        limits: &PhotoLimits,
        policy: &LivenessPolicy,
    ) -> Result<(Self, LivenessResult), PreconditionFailure> {
        let (photo, image) = Self::decode_image(bytes, limits)?;
        let liveness = check_liveness(&image, policy);
        if !liveness.is_live {
            return Err(PreconditionFailure::LivenessFailed {
                score: liveness.score,
                required: policy.min_score,
            });
        }
        Ok((photo, liveness))
    }

    fn decode_image(
        bytes: Vec<u8>,
        limits: &PhotoLimits,
    ) -> Result<(Self, DynamicImage), PreconditionFailure> {
        if bytes.is_empty() {
            return Err(PreconditionFailure::EmptyImage);
        }
        if bytes.len() > limits.max_bytes {
            return Err(PreconditionFailure::ImageTooLarge {
                size: bytes.len(),
                limit: limits.max_bytes,
            });
        }

        let image = image::load_from_memory(&bytes)
            .map_err(|e| PreconditionFailure::MalformedImage(e.to_string()))?;
        let (width, height) = (image.width(), image.height());
        if width == 0 || height == 0 {
            return Err(PreconditionFailure::MalformedImage(
                "image has zero area".to_string(),
            ));
        }

        Ok((
            Self {
                bytes,
                width,
                height,
            },
            image,
        ))
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;

    fn encode(img: RgbImage) -> Vec<u8> {
        let mut buf = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img)
            .write_to(&mut buf, ImageFormat::Png)
            .unwrap();
        buf.into_inner()
    }

    fn png(width: u32, height: u32) -> Vec<u8> {
        encode(RgbImage::new(width, height))
    }

    #[test]
    fn test_decode_valid_png() {
        let photo = Photo::decode(png(8, 6), &PhotoLimits::default()).unwrap();
        assert_eq!((photo.width(), photo.height()), (8, 6));
        assert!(!photo.bytes().is_empty());
    }

    #[test]
    fn test_empty_rejected() {
        assert_eq!(
            Photo::decode(Vec::new(), &PhotoLimits::default()).unwrap_err(),
            PreconditionFailure::EmptyImage
        );
    }

    #[test]
    fn test_oversized_rejected() {
        let bytes = png(8, 8);
        let limits = PhotoLimits { max_bytes: 10 };
        assert!(matches!(
            Photo::decode(bytes, &limits).unwrap_err(),
            PreconditionFailure::ImageTooLarge { limit: 10, .. }
        ));
    }

    #[test]
    fn test_garbage_rejected_as_malformed() {
        let err = Photo::decode(b"definitely not an image".to_vec(), &PhotoLimits::default())
            .unwrap_err();
        assert!(matches!(err, PreconditionFailure::MalformedImage(_)));
    }

    #[test]
    fn test_flat_photo_fails_liveness() {
        let policy = LivenessPolicy::default();
        let err = Photo::decode_live(png(16, 16), &PhotoLimits::default(), &policy).unwrap_err();
        assert_eq!(
            err,
            PreconditionFailure::LivenessFailed {
                score: 0.0,
                required: 0.7
            }
        );
        assert_eq!(err.code(), "liveness_failed");
    }

    #[test]
    fn test_live_photo_returns_score() {
        let skin = Rgb([200, 140, 110]);
        let img = RgbImage::from_fn(16, 16, |x, y| {
            if (x + y) % 2 == 0 {
                skin
            } else {
                Rgb([0, 0, 0])
            }
        });
        let policy = LivenessPolicy::default();
        let (photo, liveness) =
            Photo::decode_live(encode(img), &PhotoLimits::default(), &policy).unwrap();
        assert_eq!(photo.width(), 16);
        assert_eq!(liveness.score, 1.0);
    }

    #[test]
    fn test_size_checked_before_liveness() {
        let limits = PhotoLimits { max_bytes: 10 };
        assert!(matches!(
            Photo::decode_live(png(8, 8), &limits, &LivenessPolicy::default()).unwrap_err(),
            PreconditionFailure::ImageTooLarge { .. }
        ));
    }
}

use bytes::Bytes;
use chrono::{DateTime, Utc};
use image::codecs::jpeg::JpegEncoder;
use image::{ImageError, RgbImage};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

static PROCESS_EPOCH: OnceLock<Instant> = OnceLock::new();

/// Nanoseconds elapsed on the monotonic clock since the first call in this process.
pub fn monotonic_ns(at: Instant) -> u64 {
    let epoch = *PROCESS_EPOCH.get_or_init(Instant::now);
    u64::try_from(at.saturating_duration_since(epoch).as_nanos()).unwrap_or(u64::MAX)
}

/// A captured RGB frame. Cloning shares the pixel buffer; the buffer is never
/// mutated after capture, so every reader sees a complete frame.
#[derive(Debug, Clone)]
pub struct Frame {
    image: Arc<RgbImage>,
    timestamp_ns: u64,
    captured_at: Instant,
    wall_time: DateTime<Utc>,
}

impl Frame {
    pub fn new(image: RgbImage, captured_at: Instant) -> Self {
        Self {
            image: Arc::new(image),
            timestamp_ns: monotonic_ns(captured_at),
            captured_at,
            wall_time: Utc::now(),
        }
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn timestamp_ns(&self) -> u64 {
        self.timestamp_ns
    }

    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }

    pub fn wall_time(&self) -> DateTime<Utc> {
        self.wall_time
    }
}

/// Mean BT.601 luma over the whole image.
pub fn mean_luma(image: &RgbImage) -> f64 {
    let pixels = u64::from(image.width()) * u64::from(image.height());
    if pixels == 0 {
        return 0.0;
    }
    let total: f64 = image
        .pixels()
        .map(|p| 0.299 * f64::from(p[0]) + 0.587 * f64::from(p[1]) + 0.114 * f64::from(p[2]))
        .sum();
    total / pixels as f64
}

pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Bytes, ImageError> {
    let mut buffer = Vec::new();
    JpegEncoder::new_with_quality(&mut buffer, quality).encode_image(image)?;
    Ok(Bytes::from(buffer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use std::time::Duration;

    #[test]
    fn jpeg_encoding_produces_soi_marker() {
        let jpeg = encode_jpeg(&RgbImage::from_pixel(8, 8, Rgb([10, 20, 30])), 70).expect("encodes");
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn cloning_frame_shares_image_buffer() {
        let f1 = Frame::new(RgbImage::from_pixel(16, 16, Rgb([1, 2, 3])), Instant::now());
        let f2 = f1.clone();
        assert!(Arc::ptr_eq(&f1.image, &f2.image));
        assert_eq!(f1.timestamp_ns(), f2.timestamp_ns());
    }

    #[test]
    fn timestamps_are_monotonic() {
        let now = Instant::now();
        let earlier = Frame::new(RgbImage::new(2, 2), now);
        let later = Frame::new(RgbImage::new(2, 2), now + Duration::from_millis(5));
        assert!(later.timestamp_ns() > earlier.timestamp_ns());
    }

    #[test]
    fn mean_luma_of_uniform_gray_is_its_value() {
        let image = RgbImage::from_pixel(4, 4, Rgb([100, 100, 100]));
        assert!((mean_luma(&image) - 100.0).abs() < 1e-6);
        assert_eq!(mean_luma(&RgbImage::new(0, 0)), 0.0);
    }
}

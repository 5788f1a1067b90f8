use chrono::{DateTime, Utc};
use image::RgbImage;

/// A captured camera frame plus acquisition metadata.
///
/// Frames are immutable once they enter the pipeline: they are shared as
/// `Arc<Frame>` and any stage that needs to draw on the pixels works on its
/// own copy of the buffer.
#[derive(Debug, Clone)]
pub struct Frame {
    pub image: RgbImage,
    /// Capture time, when the source knows it. File-backed sources recover
    /// this from the file name; live sources stamp it at acquisition.
    pub captured_at: Option<DateTime<Utc>>,
    /// Identifier of the producing source (directory path, device name).
    pub source_id: String,
    /// Monotonic per-source sequence number.
    pub seq: u64,
}

impl Frame {
    pub fn new(
        image: RgbImage,
        captured_at: Option<DateTime<Utc>>,
        source_id: impl Into<String>,
        seq: u64,
    ) -> Self {
        Self {
            image,
            captured_at,
            source_id: source_id.into(),
            seq,
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Frame area in pixels, as f64 for ratio arithmetic.
    pub fn area(&self) -> f64 {
        f64::from(self.width()) * f64::from(self.height())
    }

    /// The capture timestamp, or `fallback` when the source did not provide
    /// one.
    pub fn timestamp_or(&self, fallback: DateTime<Utc>) -> DateTime<Utc> {
        self.captured_at.unwrap_or(fallback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use image::Rgb;

    #[test]
    fn area_and_dimensions() {
        let frame = Frame::new(RgbImage::from_pixel(64, 48, Rgb([0, 0, 0])), None, "test", 0);
        assert_eq!(frame.width(), 64);
        assert_eq!(frame.height(), 48);
        assert_eq!(frame.area(), 64.0 * 48.0);
    }

    #[test]
    fn timestamp_fallback() {
        let captured = Utc.with_ymd_and_hms(2026, 2, 18, 9, 30, 0).unwrap();
        let fallback = Utc.with_ymd_and_hms(2026, 2, 18, 10, 0, 0).unwrap();

        let with_ts = Frame::new(RgbImage::new(1, 1), Some(captured), "test", 0);
        assert_eq!(with_ts.timestamp_or(fallback), captured);

        let without_ts = Frame::new(RgbImage::new(1, 1), None, "test", 1);
        assert_eq!(without_ts.timestamp_or(fallback), fallback);
    }
}

use image::{GrayImage, ImageBuffer, Luma};
use imageproc::contours::{find_contours, BorderType, Contour};
use imageproc::distance_transform::Norm;
use imageproc::filter::gaussian_blur_f32;
use imageproc::morphology::erode;
use imageproc::point::Point;
use motion_relay_common::config::DetectorConfig;
use motion_relay_common::frame::Frame;
use serde::Serialize;
use tracing::debug;

/// Floating-point running background estimate.
type BackgroundBuffer = ImageBuffer<Luma<f32>, Vec<f32>>;

/// Axis-aligned bounding box of one detected change region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Region {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Output of one detector step.
///
/// The first frame a detector ever sees only initializes the background, so
/// there is nothing to compare against yet; that case is its own variant so
/// warm-up output can never be mistaken for a measured change ratio.
#[derive(Debug, Clone)]
pub enum ChangeResult {
    Warmup,
    Observed(ChangeObservation),
}

impl ChangeResult {
    pub fn observation(&self) -> Option<&ChangeObservation> {
        match self {
            ChangeResult::Warmup => None,
            ChangeResult::Observed(observation) => Some(observation),
        }
    }
}

/// Per-frame change measurement against the running background.
#[derive(Debug, Clone)]
pub struct ChangeObservation {
    /// Background estimate rounded back to 8-bit, as it stood for this frame.
    pub background: GrayImage,
    /// Absolute difference between the blurred frame and the background.
    pub delta: GrayImage,
    /// `delta` binarized at the configured cutoff.
    pub threshold: GrayImage,
    /// `threshold` after erosion; this is what contours are found on.
    pub threshold_eroded: GrayImage,
    /// Fraction of the frame area covered by external contours, in [0, 1].
    pub change_ratio: f64,
    /// Bounding box per external contour.
    pub regions: Vec<Region>,
}

#[derive(Debug, thiserror::Error)]
pub enum DetectorError {
    #[error("frame is {got_width}x{got_height} but the background is {expected_width}x{expected_height}")]
    DimensionMismatch {
        expected_width: u32,
        expected_height: u32,
        got_width: u32,
        got_height: u32,
    },
}

/// Per-pixel background differencing.
///
/// Maintains an exponential-moving-average background estimate and measures
/// each new frame against it: blur, subtract, binarize, erode, then take the
/// area covered by the surviving external contours as the change ratio.
pub struct ChangeDetector {
    config: DetectorConfig,
    background: Option<BackgroundBuffer>,
}

impl ChangeDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self {
            config,
            background: None,
        }
    }

    /// Drop the background estimate; the next frame starts a fresh warm-up.
    pub fn reset(&mut self) {
        self.background = None;
    }

    pub fn process(&mut self, frame: &Frame) -> Result<ChangeResult, DetectorError> {
        let gray = image::imageops::grayscale(&frame.image);
        let blurred = gaussian_blur_f32(&gray, sigma_for_kernel(self.config.blur_size));
        let (width, height) = blurred.dimensions();

        let mut background = match self.background.take() {
            None => {
                debug!(width, height, "initializing background estimate");
                self.background = Some(to_float(&blurred));
                return Ok(ChangeResult::Warmup);
            }
            Some(background) => background,
        };
        if background.dimensions() != (width, height) {
            let err = DetectorError::DimensionMismatch {
                expected_width: background.width(),
                expected_height: background.height(),
                got_width: width,
                got_height: height,
            };
            self.background = Some(background);
            return Err(err);
        }

        // Running average update happens before the comparison, so the
        // current frame already contributes to the baseline it is measured
        // against.
        let alpha = self.config.accumulate_alpha as f32;
        for (bg, px) in background.pixels_mut().zip(blurred.pixels()) {
            bg.0[0] = bg.0[0] * (1.0 - alpha) + f32::from(px.0[0]) * alpha;
        }

        let snapshot = to_rounded(&background);
        self.background = Some(background);
        let delta = GrayImage::from_fn(width, height, |x, y| {
            Luma([blurred.get_pixel(x, y)[0].abs_diff(snapshot.get_pixel(x, y)[0])])
        });

        let cutoff = self.config.threshold;
        let threshold = GrayImage::from_fn(width, height, |x, y| {
            Luma([if delta.get_pixel(x, y)[0] > cutoff { 255 } else { 0 }])
        });

        let threshold_eroded = if self.config.erode_iterations > 0 {
            erode(
                &threshold,
                Norm::LInf,
                self.config.erode_iterations.min(255) as u8,
            )
        } else {
            threshold.clone()
        };

        let contours: Vec<Contour<i32>> = find_contours(&threshold_eroded);
        let outer: Vec<&Contour<i32>> = contours
            .iter()
            .filter(|c| c.border_type == BorderType::Outer)
            .collect();

        let total_area = f64::from(width) * f64::from(height);
        let contour_area_sum: f64 = outer.iter().map(|c| contour_area(&c.points)).sum();
        let change_ratio = (contour_area_sum / total_area).clamp(0.0, 1.0);
        let regions = outer.iter().filter_map(|c| bounding_box(&c.points)).collect();

        debug!(
            change_ratio = format!("{change_ratio:.4}"),
            contours = outer.len(),
            "frame measured against background"
        );

        Ok(ChangeResult::Observed(ChangeObservation {
            background: snapshot,
            delta,
            threshold,
            threshold_eroded,
            change_ratio,
            regions,
        }))
    }
}

/// OpenCV's default sigma for a given odd kernel size; the original tuning
/// of the blur stage assumed that mapping.
fn sigma_for_kernel(kernel_size: u32) -> f32 {
    0.3 * ((kernel_size.max(1) as f32 - 1.0) * 0.5 - 1.0) + 0.8
}

fn to_float(image: &GrayImage) -> BackgroundBuffer {
    BackgroundBuffer::from_fn(image.width(), image.height(), |x, y| {
        Luma([f32::from(image.get_pixel(x, y)[0])])
    })
}

fn to_rounded(background: &BackgroundBuffer) -> GrayImage {
    GrayImage::from_fn(background.width(), background.height(), |x, y| {
        Luma([background.get_pixel(x, y)[0].round().clamp(0.0, 255.0) as u8])
    })
}

/// Shoelace area of a closed pixel contour.
fn contour_area(points: &[Point<i32>]) -> f64 {
    if points.len() < 3 {
        return 0.0;
    }
    let mut doubled: i64 = 0;
    for (i, p) in points.iter().enumerate() {
        let q = points[(i + 1) % points.len()];
        doubled += i64::from(p.x) * i64::from(q.y) - i64::from(q.x) * i64::from(p.y);
    }
    doubled.unsigned_abs() as f64 / 2.0
}

fn bounding_box(points: &[Point<i32>]) -> Option<Region> {
    let first = points.first()?;
    let (mut min_x, mut min_y, mut max_x, mut max_y) = (first.x, first.y, first.x, first.y);
    for p in points {
        min_x = min_x.min(p.x);
        min_y = min_y.min(p.y);
        max_x = max_x.max(p.x);
        max_y = max_y.max(p.y);
    }
    Some(Region {
        x: min_x.max(0) as u32,
        y: min_y.max(0) as u32,
        width: (max_x - min_x + 1) as u32,
        height: (max_y - min_y + 1) as u32,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn solid_frame(width: u32, height: u32, value: u8, seq: u64) -> Frame {
        Frame::new(
            RgbImage::from_pixel(width, height, Rgb([value, value, value])),
            None,
            "test",
            seq,
        )
    }

    fn frame_with_block(
        width: u32,
        height: u32,
        base: u8,
        block: u8,
        block_origin: (u32, u32),
        block_size: u32,
        seq: u64,
    ) -> Frame {
        let mut image = RgbImage::from_pixel(width, height, Rgb([base, base, base]));
        for y in block_origin.1..block_origin.1 + block_size {
            for x in block_origin.0..block_origin.0 + block_size {
                image.put_pixel(x, y, Rgb([block, block, block]));
            }
        }
        Frame::new(image, None, "test", seq)
    }

    #[test]
    fn first_frame_is_warmup() {
        let mut detector = ChangeDetector::new(DetectorConfig::default());
        let result = detector.process(&solid_frame(64, 64, 128, 0)).unwrap();
        assert!(matches!(result, ChangeResult::Warmup));
    }

    #[test]
    fn identical_frame_measures_no_change() {
        let mut detector = ChangeDetector::new(DetectorConfig::default());
        detector.process(&solid_frame(64, 64, 128, 0)).unwrap();
        let result = detector.process(&solid_frame(64, 64, 128, 1)).unwrap();

        let observation = result.observation().expect("second frame is observed");
        assert_eq!(observation.change_ratio, 0.0);
        assert!(observation.regions.is_empty());
        assert!(observation.threshold_eroded.pixels().all(|p| p.0[0] == 0));
    }

    #[test]
    fn bright_block_measures_its_area() {
        let mut detector = ChangeDetector::new(DetectorConfig::default());
        detector.process(&solid_frame(128, 128, 128, 0)).unwrap();
        let result = detector
            .process(&frame_with_block(128, 128, 128, 230, (48, 48), 32, 1))
            .unwrap();

        let observation = result.observation().expect("observed");
        // A 32x32 block in a 128x128 frame covers ~6% of the area; the
        // contour sits just inside the block and erosion trims a pixel.
        assert!(
            observation.change_ratio > 0.03 && observation.change_ratio < 0.09,
            "change_ratio = {}",
            observation.change_ratio
        );
        assert_eq!(observation.regions.len(), 1);
        let region = observation.regions[0];
        assert!(region.width >= 25 && region.width <= 34);
        assert!(region.height >= 25 && region.height <= 34);
    }

    #[test]
    fn change_ratio_stays_in_unit_interval() {
        let mut detector = ChangeDetector::new(DetectorConfig::default());
        detector.process(&solid_frame(32, 32, 0, 0)).unwrap();
        // Full-frame flip is the worst case for contour coverage.
        let result = detector.process(&solid_frame(32, 32, 255, 1)).unwrap();
        let observation = result.observation().expect("observed");
        assert!(
            (0.0..=1.0).contains(&observation.change_ratio),
            "change_ratio = {}",
            observation.change_ratio
        );
        assert!(observation.change_ratio > 0.5);
    }

    #[test]
    fn dimension_mismatch_rejected() {
        let mut detector = ChangeDetector::new(DetectorConfig::default());
        detector.process(&solid_frame(64, 64, 128, 0)).unwrap();
        let err = detector.process(&solid_frame(32, 32, 128, 1)).unwrap_err();
        assert!(matches!(err, DetectorError::DimensionMismatch { .. }));
    }

    #[test]
    fn reset_restarts_warmup() {
        let mut detector = ChangeDetector::new(DetectorConfig::default());
        detector.process(&solid_frame(64, 64, 128, 0)).unwrap();
        detector.reset();
        let result = detector.process(&solid_frame(32, 32, 128, 1)).unwrap();
        assert!(matches!(result, ChangeResult::Warmup));
    }
}

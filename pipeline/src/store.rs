use std::io::Cursor;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use image::codecs::jpeg::JpegEncoder;
use motion_relay_common::config::StorageConfig;
use serde::Serialize;
use tracing::{debug, error, info};

use crate::detector::Region;
use crate::events::Artifact;

/// Persistence collaborator: receives the artifacts that belong to motion
/// events for durable storage.
///
/// Implementations absorb their own failures; the pipeline never stops
/// because persistence hiccupped.
pub trait ArtifactStore: Send + Sync {
    fn store(&self, artifact: &Artifact);
}

/// Discards everything. Used when storage is disabled and in tests.
pub struct NullStore;

impl ArtifactStore for NullStore {
    fn store(&self, _artifact: &Artifact) {}
}

#[derive(Debug, thiserror::Error)]
enum StoreError {
    #[error("failed to write {0}: {1}")]
    Write(String, std::io::Error),
    #[error("failed to encode JPEG: {0}")]
    Encode(image::ImageError),
    #[error("failed to serialize metadata: {0}")]
    Metadata(serde_json::Error),
}

/// What gets written alongside each stored frame.
#[derive(Serialize)]
struct SidecarRecord<'a> {
    event_id: Option<u64>,
    kind: &'static str,
    change_ratio: f64,
    regions: &'a [Region],
    captured_at: String,
    source_id: &'a str,
    seq: u64,
}

/// Writes event artifacts as timestamped JPEGs with a JSON metadata sidecar.
pub struct JpegDirStore {
    output_dir: PathBuf,
    jpeg_quality: u8,
}

impl JpegDirStore {
    pub fn new(config: &StorageConfig) -> Result<Self, std::io::Error> {
        let output_dir = PathBuf::from(&config.output_dir);
        std::fs::create_dir_all(&output_dir)?;
        info!(output_dir = config.output_dir, "artifact store ready");
        Ok(Self {
            output_dir,
            jpeg_quality: config.jpeg_quality,
        })
    }

    fn write(&self, artifact: &Artifact) -> Result<PathBuf, StoreError> {
        let stem = file_stem(artifact.captured_at, artifact.frame.seq);

        let mut jpeg = Vec::new();
        JpegEncoder::new_with_quality(Cursor::new(&mut jpeg), self.jpeg_quality)
            .encode_image(&artifact.frame.image)
            .map_err(StoreError::Encode)?;

        let jpeg_path = self.output_dir.join(format!("{stem}.jpg"));
        write_file(&jpeg_path, &jpeg)?;

        let record = SidecarRecord {
            event_id: artifact.event_id,
            kind: artifact.kind.as_str(),
            change_ratio: artifact.change_ratio,
            regions: &artifact.regions,
            captured_at: artifact.captured_at.to_rfc3339(),
            source_id: &artifact.frame.source_id,
            seq: artifact.frame.seq,
        };
        let metadata = serde_json::to_vec_pretty(&record).map_err(StoreError::Metadata)?;
        write_file(&self.output_dir.join(format!("{stem}.json")), &metadata)?;

        Ok(jpeg_path)
    }
}

impl ArtifactStore for JpegDirStore {
    fn store(&self, artifact: &Artifact) {
        match self.write(artifact) {
            Ok(path) => debug!(
                path = %path.display(),
                event_id = artifact.event_id,
                kind = artifact.kind.as_str(),
                "stored event artifact"
            ),
            Err(e) => error!(
                error = %e,
                event_id = artifact.event_id,
                "failed to store event artifact"
            ),
        }
    }
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    std::fs::write(path, bytes).map_err(|e| StoreError::Write(path.display().to_string(), e))
}

/// `YYYYmmdd-HHMMSS-mmm-seq`, the naming the recording tools expect.
fn file_stem(captured_at: DateTime<Utc>, seq: u64) -> String {
    format!(
        "{}-{:03}-{seq:06}",
        captured_at.format("%Y%m%d-%H%M%S"),
        captured_at.timestamp_subsec_millis()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ArtifactKind;
    use chrono::TimeZone;
    use image::{Rgb, RgbImage};
    use motion_relay_common::frame::Frame;
    use std::sync::Arc;

    fn test_artifact(captured_at: DateTime<Utc>) -> Artifact {
        Artifact {
            frame: Arc::new(Frame::new(
                RgbImage::from_pixel(8, 8, Rgb([200, 100, 50])),
                Some(captured_at),
                "testcam",
                17,
            )),
            kind: ArtifactKind::Onset,
            event_id: Some(3),
            change_ratio: 0.042,
            regions: vec![Region {
                x: 1,
                y: 2,
                width: 3,
                height: 4,
            }],
            captured_at,
        }
    }

    #[test]
    fn stem_includes_millis_and_seq() {
        let ts = Utc
            .with_ymd_and_hms(2026, 2, 18, 9, 30, 15)
            .unwrap()
            .checked_add_signed(chrono::Duration::milliseconds(7))
            .unwrap();
        assert_eq!(file_stem(ts, 17), "20260218-093015-007-000017");
    }

    #[test]
    fn stores_jpeg_with_sidecar() {
        let dir = std::env::temp_dir().join(format!("motion-relay-store-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let store = JpegDirStore::new(&StorageConfig {
            enabled: true,
            output_dir: dir.display().to_string(),
            jpeg_quality: 80,
        })
        .unwrap();

        let ts = Utc.with_ymd_and_hms(2026, 2, 18, 9, 30, 15).unwrap();
        store.store(&test_artifact(ts));

        let jpeg_path = dir.join("20260218-093015-000-000017.jpg");
        let sidecar_path = dir.join("20260218-093015-000-000017.json");
        assert!(jpeg_path.is_file());
        assert!(sidecar_path.is_file());

        let decoded = image::open(&jpeg_path).unwrap().to_rgb8();
        assert_eq!(decoded.dimensions(), (8, 8));

        let metadata: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&sidecar_path).unwrap()).unwrap();
        assert_eq!(metadata["event_id"], 3);
        assert_eq!(metadata["kind"], "onset");
        assert_eq!(metadata["regions"][0]["width"], 3);
        assert_eq!(metadata["source_id"], "testcam");

        let _ = std::fs::remove_dir_all(&dir);
    }
}

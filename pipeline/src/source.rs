use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use futures_util::stream::{self, Stream};
use image::{Rgb, RgbImage};
use motion_relay_common::config::SourceConfig;
use motion_relay_common::frame::Frame;
use tracing::{debug, info, warn};

use crate::distributor::SourceError;

#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("failed to scan frame directory {0}: {1}")]
    ReadDir(String, std::io::Error),
}

/// Replays a directory of still images as a frame sequence.
///
/// Files are served in name order, one per configured interval. A timestamp
/// embedded in the file name (`YYYYmmdd-HHMMSS`, local time) becomes the
/// frame's capture time. When the directory yields nothing usable a
/// placeholder frame is emitted instead, so downstream still warms up and
/// the loop never spins.
pub struct DirectorySource {
    directory: PathBuf,
    files: Vec<PathBuf>,
    interval: Duration,
    loop_forever: bool,
}

impl DirectorySource {
    pub fn new(config: &SourceConfig) -> Result<Self, ScanError> {
        let directory = PathBuf::from(&config.directory);
        let entries = std::fs::read_dir(&directory)
            .map_err(|e| ScanError::ReadDir(config.directory.clone(), e))?;

        let mut files: Vec<PathBuf> = entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| {
                path.is_file()
                    && path
                        .extension()
                        .and_then(|ext| ext.to_str())
                        .is_some_and(|ext| {
                            config
                                .extensions
                                .iter()
                                .any(|wanted| wanted.eq_ignore_ascii_case(ext))
                        })
            })
            .collect();
        files.sort();

        info!(
            directory = config.directory,
            files = files.len(),
            loop_forever = config.loop_forever,
            "scanned frame directory"
        );

        Ok(Self {
            directory,
            files,
            interval: Duration::from_millis(config.frame_interval_ms),
            loop_forever: config.loop_forever,
        })
    }

    /// Turn the source into its frame stream. The stream owns the source;
    /// dropping the stream releases it.
    pub fn into_stream(self) -> impl Stream<Item = Result<Arc<Frame>, SourceError>> + Send {
        let state = StreamState {
            source: self,
            index: 0,
            seq: 0,
            yielded_this_pass: false,
        };
        stream::unfold(state, |mut state| async move {
            loop {
                if state.index >= state.source.files.len() {
                    let ended_empty = !state.yielded_this_pass;
                    if ended_empty {
                        // Nothing decodable in this pass; hand out a
                        // placeholder so consumers still get frames.
                        warn!(
                            directory = %state.source.directory.display(),
                            "no usable images, yielding placeholder frame"
                        );
                        tokio::time::sleep(state.source.interval).await;
                        let frame = state.source.placeholder_frame(state.seq);
                        state.seq += 1;
                        // The placeholder counts as this pass's output, so a
                        // non-looping source ends after emitting it once.
                        state.yielded_this_pass = true;
                        state.index = 0;
                        return Some((Ok(Arc::new(frame)), state));
                    }
                    if !state.source.loop_forever {
                        info!(frames = state.seq, "frame directory exhausted");
                        return None;
                    }
                    state.index = 0;
                    state.yielded_this_pass = false;
                }

                let path = state.source.files[state.index].clone();
                state.index += 1;

                match load_frame(&path).await {
                    Some(image) => {
                        tokio::time::sleep(state.source.interval).await;
                        let frame = Frame::new(
                            image,
                            timestamp_from_name(&path),
                            state.source.directory.display().to_string(),
                            state.seq,
                        );
                        debug!(path = %path.display(), seq = frame.seq, "yielding frame");
                        state.seq += 1;
                        state.yielded_this_pass = true;
                        return Some((Ok(Arc::new(frame)), state));
                    }
                    None => continue,
                }
            }
        })
    }

    fn placeholder_frame(&self, seq: u64) -> Frame {
        Frame::new(
            RgbImage::from_pixel(1024, 768, Rgb([0, 0, 0])),
            None,
            self.directory.display().to_string(),
            seq,
        )
    }
}

impl Drop for DirectorySource {
    fn drop(&mut self) {
        debug!(directory = %self.directory.display(), "frame source released");
    }
}

struct StreamState {
    source: DirectorySource,
    index: usize,
    seq: u64,
    yielded_this_pass: bool,
}

async fn load_frame(path: &std::path::Path) -> Option<RgbImage> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to read image file, skipping");
            return None;
        }
    };
    match image::load_from_memory(&bytes) {
        Ok(image) => Some(image.to_rgb8()),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to decode image file, skipping");
            None
        }
    }
}

/// Extract a `YYYYmmdd-HHMMSS` capture time from a file name, interpreted in
/// local time the way the recording tools write it.
fn timestamp_from_name(path: &std::path::Path) -> Option<DateTime<Utc>> {
    let name = path.file_name()?.to_str()?;
    let bytes = name.as_bytes();
    const PATTERN_LEN: usize = 15; // 8 digits, '-', 6 digits

    for start in 0..bytes.len().saturating_sub(PATTERN_LEN - 1) {
        let window = &bytes[start..start + PATTERN_LEN];
        let shape_matches = window[..8].iter().all(u8::is_ascii_digit)
            && window[8] == b'-'
            && window[9..].iter().all(u8::is_ascii_digit);
        if !shape_matches {
            continue;
        }
        let text = &name[start..start + PATTERN_LEN];
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, "%Y%m%d-%H%M%S") {
            if let Some(local) = Local.from_local_datetime(&naive).single() {
                return Some(local.with_timezone(&Utc));
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};
    use futures_util::StreamExt;

    fn test_config(directory: &std::path::Path) -> SourceConfig {
        SourceConfig {
            directory: directory.display().to_string(),
            extensions: vec!["jpg".into(), "jpeg".into()],
            loop_forever: false,
            frame_interval_ms: 0,
        }
    }

    fn unique_test_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "motion-relay-source-{}-{}",
            name,
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn write_jpeg(path: &std::path::Path, value: u8) {
        let image = RgbImage::from_pixel(16, 16, Rgb([value, value, value]));
        image.save(path).unwrap();
    }

    #[test]
    fn timestamp_parsed_from_name() {
        let ts = timestamp_from_name(std::path::Path::new("cam0-20260218-093015.jpg"))
            .expect("timestamp parses");
        let local = ts.with_timezone(&Local);
        assert_eq!(
            (local.year(), local.month(), local.day()),
            (2026, 2, 18)
        );
        assert_eq!(
            (local.hour(), local.minute(), local.second()),
            (9, 30, 15)
        );
    }

    #[test]
    fn name_without_timestamp_yields_none() {
        assert!(timestamp_from_name(std::path::Path::new("frame-0001.jpg")).is_none());
        assert!(timestamp_from_name(std::path::Path::new("202602181-93015.jpg")).is_none());
    }

    #[tokio::test]
    async fn files_served_in_name_order_then_end() {
        let dir = unique_test_dir("order");
        write_jpeg(&dir.join("b.jpg"), 20);
        write_jpeg(&dir.join("a.jpg"), 10);
        std::fs::write(dir.join("notes.txt"), b"ignored").unwrap();

        let source = DirectorySource::new(&test_config(&dir)).unwrap();
        let frames: Vec<_> = source.into_stream().collect().await;

        assert_eq!(frames.len(), 2);
        let first = frames[0].as_ref().unwrap();
        let second = frames[1].as_ref().unwrap();
        // JPEG round-trips are lossy, so compare with slack.
        assert!(first.image.get_pixel(0, 0)[0] < 15);
        assert!(second.image.get_pixel(0, 0)[0] > 15);
        assert_eq!(first.seq, 0);
        assert_eq!(second.seq, 1);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn empty_directory_yields_placeholder() {
        let dir = unique_test_dir("empty");
        let source = DirectorySource::new(&test_config(&dir)).unwrap();
        let frames: Vec<_> = source.into_stream().collect().await;

        assert_eq!(frames.len(), 1);
        let frame = frames[0].as_ref().unwrap();
        assert_eq!(frame.width(), 1024);
        assert_eq!(frame.height(), 768);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn undecodable_file_skipped() {
        let dir = unique_test_dir("corrupt");
        std::fs::write(dir.join("bad.jpg"), b"not a jpeg").unwrap();
        write_jpeg(&dir.join("good.jpg"), 42);

        let source = DirectorySource::new(&test_config(&dir)).unwrap();
        let frames: Vec<_> = source.into_stream().collect().await;

        assert_eq!(frames.len(), 1);
        let value = frames[0].as_ref().unwrap().image.get_pixel(0, 0)[0];
        assert!((38..=46).contains(&value), "decoded pixel = {value}");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_directory_is_an_error() {
        let config = test_config(std::path::Path::new("/definitely/not/here"));
        assert!(matches!(
            DirectorySource::new(&config),
            Err(ScanError::ReadDir(_, _))
        ));
    }
}

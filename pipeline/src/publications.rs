use std::sync::Arc;

use futures_util::{Stream, StreamExt};
use image::{GrayImage, Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;
use motion_relay_common::frame::Frame;

use crate::detector::{ChangeDetector, ChangeResult, Region};
use crate::distributor::SourceError;
use crate::events::{Artifact, EventTracker};
use crate::store::ArtifactStore;

/// One processed frame as consumers see it: the live artifact plus the
/// presentation buffers derived from it.
pub struct Publication {
    pub artifact: Artifact,
    /// The frame with change regions outlined, for the live video feed.
    pub annotated: RgbImage,
    /// Eroded threshold mask for the diff feed; absent during warm-up.
    pub mask: Option<GrayImage>,
}

/// Wire the detector, event tracker and artifact store into the publication
/// sequence the distributor pulls from.
///
/// Event-tagged artifacts (including the retroactive pre-onset frame) go to
/// the store as they are emitted; every frame, quiet or not, becomes a
/// publication. A detector error ends the stream with that error, which the
/// distributor turns into a producer failure for all consumers.
pub fn publication_stream<S>(
    frames: S,
    mut detector: ChangeDetector,
    mut tracker: EventTracker,
    store: Arc<dyn ArtifactStore>,
) -> impl Stream<Item = Result<Publication, SourceError>> + Send
where
    S: Stream<Item = Result<Arc<Frame>, SourceError>> + Send + 'static,
{
    frames.map(move |next| {
        let frame = next?;
        let change = detector
            .process(&frame)
            .map_err(|e| -> SourceError { Box::new(e) })?;
        let step = tracker.process(Arc::clone(&frame), &change);

        if let Some(pre_onset) = &step.pre_onset {
            store.store(pre_onset);
        }
        if step.live.is_event() {
            store.store(&step.live);
        }

        let annotated = annotate(&step.live.frame.image, &step.live.regions);
        let mask = change
            .observation()
            .map(|observation| observation.threshold_eroded.clone());

        Ok(Publication {
            artifact: step.live,
            annotated,
            mask,
        })
    })
}

const REGION_OUTLINE: Rgb<u8> = Rgb([0, 255, 0]);

fn annotate(image: &RgbImage, regions: &[Region]) -> RgbImage {
    let mut annotated = image.clone();
    for region in regions {
        draw_hollow_rect_mut(
            &mut annotated,
            Rect::at(region.x as i32, region.y as i32).of_size(region.width, region.height),
            REGION_OUTLINE,
        );
    }
    annotated
}

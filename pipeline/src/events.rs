use std::sync::Arc;

use chrono::{DateTime, Utc};
use motion_relay_common::config::EventConfig;
use motion_relay_common::frame::Frame;
use tracing::{debug, info};

use crate::detector::{ChangeResult, Region};

/// Where a frame falls within the life of a motion event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    /// Nothing happening; the scene is quiet.
    Quiescent,
    /// The last quiet frame, emitted retroactively when an event opens.
    PreOnset,
    /// The frame that opened the event.
    Onset,
    /// The event is still running.
    Continuation,
    /// The frame that closed the event.
    Closure,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Quiescent => "quiescent",
            ArtifactKind::PreOnset => "pre_onset",
            ArtifactKind::Onset => "onset",
            ArtifactKind::Continuation => "continuation",
            ArtifactKind::Closure => "closure",
        }
    }
}

/// One emitted frame, tagged with its place in the event timeline.
/// Persistence stores the event-tagged ones; presentation shows them all.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub frame: Arc<Frame>,
    pub kind: ArtifactKind,
    /// Set for every artifact that belongs to an event, including the
    /// retroactive pre-onset frame and the closing frame.
    pub event_id: Option<u64>,
    pub change_ratio: f64,
    pub regions: Vec<Region>,
    pub captured_at: DateTime<Utc>,
}

impl Artifact {
    pub fn is_event(&self) -> bool {
        !matches!(self.kind, ArtifactKind::Quiescent)
    }
}

/// Output of one tracker step: the artifact for the current frame, preceded
/// by the buffered quiet frame when this step opened an event.
#[derive(Debug)]
pub struct EventStep {
    pub pre_onset: Option<Artifact>,
    pub live: Artifact,
}

/// The last quiet frame, kept so an opening event can emit the instant
/// before motion began.
struct QuiescentFrame {
    frame: Arc<Frame>,
    change_ratio: f64,
    regions: Vec<Region>,
    captured_at: DateTime<Utc>,
}

enum TrackerState {
    Idle { quiescent: Option<QuiescentFrame> },
    Active,
}

/// Converts per-frame change ratios into discrete motion events.
///
/// Events are numbered from 1; the id advances only when an event closes, so
/// every artifact of one event carries the same id. There is no hysteresis
/// around the hit threshold: a ratio oscillating across it opens and closes
/// an event on every step.
pub struct EventTracker {
    state: TrackerState,
    event_id: u64,
    hit_threshold: f64,
}

impl EventTracker {
    pub fn new(config: &EventConfig) -> Self {
        Self {
            state: TrackerState::Idle { quiescent: None },
            event_id: 1,
            hit_threshold: config.hit_threshold,
        }
    }

    /// Id the next opening (or currently open) event will carry.
    pub fn event_id(&self) -> u64 {
        self.event_id
    }

    pub fn process(&mut self, frame: Arc<Frame>, change: &ChangeResult) -> EventStep {
        let captured_at = frame.timestamp_or(Utc::now());
        // Warm-up frames carry no measurement; they behave like quiet frames
        // and a zero ratio, never like hits.
        let (change_ratio, regions) = match change.observation() {
            Some(observation) => (observation.change_ratio, observation.regions.clone()),
            None => (0.0, Vec::new()),
        };
        let hit = change
            .observation()
            .is_some_and(|o| o.change_ratio > self.hit_threshold);

        let state = std::mem::replace(&mut self.state, TrackerState::Active);
        match (state, hit) {
            (TrackerState::Idle { .. }, false) => {
                debug!(change_ratio, "scene quiet");
                self.state = TrackerState::Idle {
                    quiescent: Some(QuiescentFrame {
                        frame: Arc::clone(&frame),
                        change_ratio,
                        regions: regions.clone(),
                        captured_at,
                    }),
                };
                EventStep {
                    pre_onset: None,
                    live: Artifact {
                        frame,
                        kind: ArtifactKind::Quiescent,
                        event_id: None,
                        change_ratio,
                        regions,
                        captured_at,
                    },
                }
            }
            (TrackerState::Idle { quiescent }, true) => {
                info!(event_id = self.event_id, change_ratio, "motion event starting");
                let pre_onset = quiescent.map(|q| Artifact {
                    frame: q.frame,
                    kind: ArtifactKind::PreOnset,
                    event_id: Some(self.event_id),
                    change_ratio: q.change_ratio,
                    regions: q.regions,
                    captured_at: q.captured_at,
                });
                self.state = TrackerState::Active;
                EventStep {
                    pre_onset,
                    live: Artifact {
                        frame,
                        kind: ArtifactKind::Onset,
                        event_id: Some(self.event_id),
                        change_ratio,
                        regions,
                        captured_at,
                    },
                }
            }
            (TrackerState::Active, true) => {
                debug!(event_id = self.event_id, change_ratio, "motion event continuing");
                self.state = TrackerState::Active;
                EventStep {
                    pre_onset: None,
                    live: Artifact {
                        frame,
                        kind: ArtifactKind::Continuation,
                        event_id: Some(self.event_id),
                        change_ratio,
                        regions,
                        captured_at,
                    },
                }
            }
            (TrackerState::Active, false) => {
                info!(event_id = self.event_id, "motion event ending");
                let closing_id = self.event_id;
                self.event_id += 1;
                // The closing frame is already quiet, so it doubles as the
                // buffered pre-onset candidate for the next event.
                self.state = TrackerState::Idle {
                    quiescent: Some(QuiescentFrame {
                        frame: Arc::clone(&frame),
                        change_ratio,
                        regions: regions.clone(),
                        captured_at,
                    }),
                };
                EventStep {
                    pre_onset: None,
                    live: Artifact {
                        frame,
                        kind: ArtifactKind::Closure,
                        event_id: Some(closing_id),
                        change_ratio,
                        regions,
                        captured_at,
                    },
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::ChangeObservation;
    use image::{GrayImage, Rgb, RgbImage};

    fn frame(seq: u64) -> Arc<Frame> {
        Arc::new(Frame::new(
            RgbImage::from_pixel(8, 8, Rgb([128, 128, 128])),
            None,
            "test",
            seq,
        ))
    }

    fn observed(change_ratio: f64) -> ChangeResult {
        ChangeResult::Observed(ChangeObservation {
            background: GrayImage::new(8, 8),
            delta: GrayImage::new(8, 8),
            threshold: GrayImage::new(8, 8),
            threshold_eroded: GrayImage::new(8, 8),
            change_ratio,
            regions: Vec::new(),
        })
    }

    #[test]
    fn event_lifecycle() {
        let mut tracker = EventTracker::new(&EventConfig::default());

        // Warm-up behaves like a quiet frame and becomes the buffered one.
        let step1 = tracker.process(frame(1), &ChangeResult::Warmup);
        assert_eq!(step1.live.kind, ArtifactKind::Quiescent);
        assert!(step1.pre_onset.is_none());
        assert!(!step1.live.is_event());

        // Quiet frame replaces the buffer.
        let f2 = frame(2);
        let step2 = tracker.process(Arc::clone(&f2), &observed(0.0));
        assert_eq!(step2.live.kind, ArtifactKind::Quiescent);
        assert_eq!(step2.live.event_id, None);

        // Onset: the buffered frame 2 comes out first, tagged with the
        // opening event's id.
        let step3 = tracker.process(frame(3), &observed(0.05));
        let pre_onset = step3.pre_onset.expect("pre-onset emitted on open");
        assert_eq!(pre_onset.kind, ArtifactKind::PreOnset);
        assert_eq!(pre_onset.event_id, Some(1));
        assert!(Arc::ptr_eq(&pre_onset.frame, &f2));
        assert_eq!(step3.live.kind, ArtifactKind::Onset);
        assert_eq!(step3.live.event_id, Some(1));

        // Continuation keeps the id and emits nothing retroactive.
        let step4 = tracker.process(frame(4), &observed(0.04));
        assert_eq!(step4.live.kind, ArtifactKind::Continuation);
        assert_eq!(step4.live.event_id, Some(1));
        assert!(step4.pre_onset.is_none());

        // Closure carries the closing id, then the id advances.
        let f5 = frame(5);
        let step5 = tracker.process(Arc::clone(&f5), &observed(0.0));
        assert_eq!(step5.live.kind, ArtifactKind::Closure);
        assert_eq!(step5.live.event_id, Some(1));
        assert_eq!(tracker.event_id(), 2);

        // The closing frame became the new quiescent buffer.
        let step6 = tracker.process(frame(6), &observed(0.05));
        let pre_onset = step6.pre_onset.expect("pre-onset for second event");
        assert!(Arc::ptr_eq(&pre_onset.frame, &f5));
        assert_eq!(pre_onset.event_id, Some(2));
        assert_eq!(step6.live.event_id, Some(2));
    }

    #[test]
    fn id_advances_once_per_closed_event() {
        let mut tracker = EventTracker::new(&EventConfig::default());
        tracker.process(frame(0), &ChangeResult::Warmup);

        let mut last_id = tracker.event_id();
        for round in 0..3 {
            for seq in 0..4 {
                let step = tracker.process(frame(round * 10 + seq), &observed(0.02));
                assert_eq!(step.live.event_id, Some(last_id));
            }
            let step = tracker.process(frame(round * 10 + 9), &observed(0.0));
            assert_eq!(step.live.kind, ArtifactKind::Closure);
            assert_eq!(step.live.event_id, Some(last_id));
            assert_eq!(tracker.event_id(), last_id + 1);
            last_id += 1;
        }
    }

    #[test]
    fn ratio_at_threshold_is_not_a_hit() {
        let config = EventConfig::default();
        let mut tracker = EventTracker::new(&config);
        tracker.process(frame(0), &ChangeResult::Warmup);
        let step = tracker.process(frame(1), &observed(config.hit_threshold));
        assert_eq!(step.live.kind, ArtifactKind::Quiescent);
    }

    #[test]
    fn onset_without_buffer_emits_no_pre_onset() {
        let mut tracker = EventTracker::new(&EventConfig::default());
        // First frame ever is already a hit; nothing is buffered yet.
        let step = tracker.process(frame(0), &observed(0.5));
        assert!(step.pre_onset.is_none());
        assert_eq!(step.live.kind, ArtifactKind::Onset);
    }
}

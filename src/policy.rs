//! Scheduling policies: how content time maps onto the break timeline.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ad_break::{AdBreak, BreakOffset};
use crate::player::ContentPosition;

/// How far ahead of a break its first ad is prepared
pub const DEFAULT_PRELOAD_OFFSET: Duration = Duration::from_millis(4000);

/// Scheduling decisions the ads manager delegates.
///
/// Every method has a default matching plain content-time scheduling;
/// variants override what they change.
pub trait AdSchedulingPolicy: Send {
    fn name(&self) -> &str {
        "default"
    }

    /// A break becomes due this long before its start
    fn preload_offset(&self) -> Duration {
        DEFAULT_PRELOAD_OFFSET
    }

    fn media_load_timeout(&self, configured: Duration) -> Duration {
        configured
    }

    /// Translate the host's content position to the timeline breaks are
    /// scheduled on
    fn content_position(&mut self, reported: ContentPosition) -> ContentPosition {
        reported
    }

    /// Adjust break offsets before scheduling starts
    fn schedule(&mut self, _breaks: &mut [AdBreak], _content_duration: Option<Duration>) {}

    /// Cue points in seconds for the host's timeline, -1 for a post-roll
    fn cue_points(&self, breaks: &[AdBreak], content_duration: Option<Duration>) -> Vec<f64> {
        breaks.iter().map(|b| b.offset.seconds(content_duration)).collect()
    }
}

/// Content-time scheduling with a configurable preload offset
#[derive(Debug, Clone)]
pub struct DefaultPolicy {
    preload_offset: Duration,
}

impl DefaultPolicy {
    pub fn new(preload_offset: Duration) -> Self {
        Self { preload_offset }
    }
}

impl Default for DefaultPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_PRELOAD_OFFSET)
    }
}

impl AdSchedulingPolicy for DefaultPolicy {
    fn preload_offset(&self) -> Duration {
        self.preload_offset
    }
}

/// Which cue point survives when a synthetic and a real one are too close
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProximityTieBreak {
    #[default]
    PreferReal,
    PreferSynthetic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CueKind {
    Real,
    Synthetic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CuePoint {
    pub at: Duration,
    pub kind: CueKind,
}

/// Merge real mid-roll cue points with synthetic ones.
///
/// A synthetic point closer than `threshold` to a real one is a conflict;
/// `tie_break` decides which of the two is kept. The result is sorted.
pub fn reconcile_cue_points(
    real: &[Duration],
    synthetic: &[Duration],
    threshold: Duration,
    tie_break: ProximityTieBreak,
) -> Vec<CuePoint> {
    let near = |a: Duration, b: Duration| a.abs_diff(b) < threshold;

    let mut points: Vec<CuePoint> = match tie_break {
        ProximityTieBreak::PreferReal => {
            let mut points: Vec<CuePoint> = real.iter().map(|&at| CuePoint { at, kind: CueKind::Real }).collect();
            points.extend(
                synthetic
                    .iter()
                    .filter(|&&s| !real.iter().any(|&r| near(r, s)))
                    .map(|&at| CuePoint { at, kind: CueKind::Synthetic }),
            );
            points
        }
        ProximityTieBreak::PreferSynthetic => {
            let mut points: Vec<CuePoint> = synthetic
                .iter()
                .map(|&at| CuePoint { at, kind: CueKind::Synthetic })
                .collect();
            points.extend(
                real.iter()
                    .filter(|&&r| !synthetic.iter().any(|&s| near(r, s)))
                    .map(|&at| CuePoint { at, kind: CueKind::Real }),
            );
            points
        }
    };
    points.sort_by_key(|p| p.at);
    points
}

/// Schedules mid-rolls on watch time rather than on the content clock.
///
/// Watch time only grows with normal playback, so seeking neither brings a
/// break forward nor replays one. Synthetic cue points are laid every
/// `interval` over the expected content length and reconciled with the
/// real mid-rolls; a mid-roll whose cue lost to a synthetic one moves to it.
#[derive(Debug, Clone)]
pub struct WatchTimePolicy {
    inner: DefaultPolicy,
    interval: Duration,
    threshold: Duration,
    max_step: Duration,
    tie_break: ProximityTieBreak,
    content_duration: Duration,
    watched: Duration,
    last_reported: Option<u64>,
    cue_points: Vec<CuePoint>,
}

impl WatchTimePolicy {
    pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(10);
    pub const DEFAULT_THRESHOLD: Duration = Duration::from_secs(8);
    /// Position jumps larger than this count as seeks
    pub const DEFAULT_MAX_STEP: Duration = Duration::from_secs(2);

    pub fn new(content_duration: Duration, tie_break: ProximityTieBreak) -> Self {
        Self {
            inner: DefaultPolicy::default(),
            interval: Self::DEFAULT_INTERVAL,
            threshold: Self::DEFAULT_THRESHOLD,
            max_step: Self::DEFAULT_MAX_STEP,
            tie_break,
            content_duration,
            watched: Duration::ZERO,
            last_reported: None,
            cue_points: Vec::new(),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval.max(Duration::from_secs(1));
        self
    }

    pub fn with_threshold(mut self, threshold: Duration) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_preload_offset(mut self, preload_offset: Duration) -> Self {
        self.inner = DefaultPolicy::new(preload_offset);
        self
    }

    pub fn watched(&self) -> Duration {
        self.watched
    }

    fn synthetic_cue_points(&self) -> Vec<Duration> {
        let mut points = Vec::new();
        let mut at = self.interval;
        while at <= self.content_duration {
            points.push(at);
            at += self.interval;
        }
        points
    }
}

impl AdSchedulingPolicy for WatchTimePolicy {
    fn name(&self) -> &str {
        "watch-time"
    }

    fn preload_offset(&self) -> Duration {
        self.inner.preload_offset()
    }

    fn media_load_timeout(&self, _configured: Duration) -> Duration {
        self.threshold * 2
    }

    fn content_position(&mut self, reported: ContentPosition) -> ContentPosition {
        let ContentPosition::Millis(ms) = reported else {
            return ContentPosition::End;
        };
        if let Some(last) = self.last_reported {
            let step = ms.saturating_sub(last);
            if ms > last && Duration::from_millis(step) <= self.max_step {
                self.watched += Duration::from_millis(step);
            } else if ms != last {
                log::debug!("Seek from {}ms to {}ms not counted as watch time", last, ms);
            }
        }
        self.last_reported = Some(ms);
        ContentPosition::Millis(self.watched.as_millis() as u64)
    }

    fn schedule(&mut self, breaks: &mut [AdBreak], content_duration: Option<Duration>) {
        let real: Vec<Duration> = breaks
            .iter()
            .filter(|b| !matches!(b.offset, BreakOffset::PreRoll | BreakOffset::PostRoll))
            .filter_map(|b| b.start(content_duration))
            .collect();
        self.cue_points = reconcile_cue_points(&real, &self.synthetic_cue_points(), self.threshold, self.tie_break);

        if self.tie_break == ProximityTieBreak::PreferSynthetic {
            for ad_break in breaks.iter_mut() {
                let Some(start) = ad_break.start(content_duration) else {
                    continue;
                };
                if matches!(ad_break.offset, BreakOffset::PreRoll | BreakOffset::PostRoll) {
                    continue;
                }
                let replacement = self
                    .cue_points
                    .iter()
                    .find(|p| p.kind == CueKind::Synthetic && p.at.abs_diff(start) < self.threshold);
                if let Some(point) = replacement {
                    log::debug!("Ad break {} moved from {:?} to cue point {:?}", ad_break.id, start, point.at);
                    ad_break.offset = BreakOffset::At(point.at);
                }
            }
        }
    }

    fn cue_points(&self, breaks: &[AdBreak], content_duration: Option<Duration>) -> Vec<f64> {
        let mut points: Vec<f64> = Vec::new();
        if breaks.iter().any(|b| b.offset == BreakOffset::PreRoll) {
            points.push(0.0);
        }
        points.extend(self.cue_points.iter().map(|p| p.at.as_secs_f64()));
        if self.cue_points.is_empty() {
            points.extend(
                breaks
                    .iter()
                    .filter(|b| !matches!(b.offset, BreakOffset::PreRoll | BreakOffset::PostRoll))
                    .map(|b| b.offset.seconds(content_duration)),
            );
        }
        if breaks.iter().any(|b| b.offset.is_post_roll()) {
            points.push(-1.0);
        }
        points
    }
}

//! The host player seen from the engine: directives going out, reports coming back.

use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;

use crate::ad_break::AdPodInfo;
use crate::loader::LoadOutcome;

/// Media the host is asked to load for one ad
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct AdMediaInfo {
    /// `Ad::uid` of the ad this media belongs to
    pub ad_uid: String,
    pub url: String,
}

/// Playback position of an ad or of the content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VideoProgressUpdate {
    pub current: Duration,
    pub duration: Duration,
}

impl VideoProgressUpdate {
    pub fn new(current: Duration, duration: Duration) -> Self {
        Self { current, duration }
    }

    pub fn from_millis(current_ms: u64, duration_ms: u64) -> Self {
        Self::new(Duration::from_millis(current_ms), Duration::from_millis(duration_ms))
    }

    /// Playback has moved past zero on media of known length
    pub fn is_advancing(&self) -> bool {
        !self.current.is_zero() && !self.duration.is_zero()
    }

    /// Fraction played, 0.0 when the duration is unknown
    pub fn fraction(&self) -> f64 {
        if self.duration.is_zero() {
            return 0.0;
        }
        (self.current.as_secs_f64() / self.duration.as_secs_f64()).min(1.0)
    }
}

/// Where the content is. `End` once the stream has truly finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ContentPosition {
    Millis(u64),
    End,
}

impl ContentPosition {
    pub fn millis(&self) -> Option<u64> {
        match self {
            ContentPosition::Millis(ms) => Some(*ms),
            ContentPosition::End => None,
        }
    }

    /// Whether the content has reached `start`. A post-roll (`None`) is
    /// only reached at the end.
    pub fn has_reached(&self, start: Option<Duration>) -> bool {
        match (self, start) {
            (ContentPosition::End, _) => true,
            (ContentPosition::Millis(_), None) => false,
            (ContentPosition::Millis(ms), Some(start)) => u128::from(*ms) >= start.as_millis(),
        }
    }
}

/// Directives the engine sends to the host player.
///
/// Calls are made from the scheduling task and must return quickly; the
/// player reports back through [`PlayerCallbacks`].
pub trait VideoAdPlayer: Send + Sync {
    fn load_ad(&self, media: &AdMediaInfo, pod_info: &AdPodInfo);
    fn play_ad(&self, media: &AdMediaInfo);
    fn pause_ad(&self, media: &AdMediaInfo);
    fn stop_ad(&self, media: &AdMediaInfo);

    /// The engine is going away
    fn release(&self) {}
}

/// Reports from the host player and content feed
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerEvent {
    ContentProgress {
        position: ContentPosition,
        duration: Option<Duration>,
    },
    Loaded(AdMediaInfo),
    Progress(AdMediaInfo, VideoProgressUpdate),
    Paused(AdMediaInfo),
    Resumed(AdMediaInfo),
    Buffering(AdMediaInfo),
    Ended(AdMediaInfo),
    Error(AdMediaInfo, String),
}

/// Everything the scheduling task reacts to
#[derive(Debug)]
pub(crate) enum EngineMessage {
    Player(PlayerEvent),
    MediaLoadTimeout(AdMediaInfo),
    BreakLoaded { break_id: String, outcome: LoadOutcome },
}

/// Cloneable handle a host uses to report playback, from any thread
#[derive(Debug, Clone)]
pub struct PlayerCallbacks {
    tx: mpsc::UnboundedSender<EngineMessage>,
}

impl PlayerCallbacks {
    pub(crate) fn new(tx: mpsc::UnboundedSender<EngineMessage>) -> Self {
        Self { tx }
    }

    fn send(&self, event: PlayerEvent) {
        if self.tx.send(EngineMessage::Player(event)).is_err() {
            log::debug!("Ads manager is gone, dropping player report");
        }
    }

    pub fn on_content_progress(&self, position: ContentPosition, duration: Option<Duration>) {
        self.send(PlayerEvent::ContentProgress { position, duration });
    }

    pub fn on_content_complete(&self) {
        self.on_content_progress(ContentPosition::End, None);
    }

    pub fn on_loaded(&self, media: &AdMediaInfo) {
        self.send(PlayerEvent::Loaded(media.clone()));
    }

    pub fn on_progress(&self, media: &AdMediaInfo, progress: VideoProgressUpdate) {
        self.send(PlayerEvent::Progress(media.clone(), progress));
    }

    pub fn on_pause(&self, media: &AdMediaInfo) {
        self.send(PlayerEvent::Paused(media.clone()));
    }

    pub fn on_resume(&self, media: &AdMediaInfo) {
        self.send(PlayerEvent::Resumed(media.clone()));
    }

    pub fn on_buffering(&self, media: &AdMediaInfo) {
        self.send(PlayerEvent::Buffering(media.clone()));
    }

    pub fn on_ended(&self, media: &AdMediaInfo) {
        self.send(PlayerEvent::Ended(media.clone()));
    }

    pub fn on_error(&self, media: &AdMediaInfo, message: impl Into<String>) {
        self.send(PlayerEvent::Error(media.clone(), message.into()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_fraction_and_start() {
        let update = VideoProgressUpdate::from_millis(5_000, 20_000);
        assert!(update.is_advancing());
        assert!((update.fraction() - 0.25).abs() < f64::EPSILON);
        assert!(!VideoProgressUpdate::from_millis(0, 20_000).is_advancing());
        assert_eq!(VideoProgressUpdate::from_millis(100, 0).fraction(), 0.0);
    }

    #[test]
    fn post_rolls_are_only_reached_at_the_end() {
        assert!(!ContentPosition::Millis(u64::MAX).has_reached(None));
        assert!(ContentPosition::End.has_reached(None));
        assert!(ContentPosition::Millis(30_000).has_reached(Some(Duration::from_secs(30))));
        assert!(!ContentPosition::Millis(29_999).has_reached(Some(Duration::from_secs(30))));
    }

    #[tokio::test]
    async fn callbacks_reach_the_engine() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let callbacks = PlayerCallbacks::new(tx);
        let media = AdMediaInfo {
            ad_uid: "0.0".into(),
            url: "https://cdn.example/a.mp4".into(),
        };
        callbacks.on_ended(&media);
        match rx.recv().await {
            Some(EngineMessage::Player(PlayerEvent::Ended(got))) => assert_eq!(got, media),
            other => panic!("unexpected message {other:?}"),
        }
    }
}

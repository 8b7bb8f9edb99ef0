//! Lifecycle events and the bus they are published on.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;

use crate::ad_break::{Ad, AdBreak};
use crate::error::AdErrorInfo;
use crate::player::VideoProgressUpdate;
use crate::tracking::TrackingEvents;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdEventType {
    AdBreakReady,
    AdBreakStarted,
    AdBreakEnded,
    AdBreakFetchError,
    AdBuffering,
    AdProgress,
    AllAdsCompleted,
    Clicked,
    Completed,
    ContentPauseRequested,
    ContentResumeRequested,
    Error,
    FirstQuartile,
    Loaded,
    Log,
    Midpoint,
    Paused,
    Resumed,
    Skipped,
    SkippableStateChanged,
    Started,
    ThirdQuartile,
}

impl fmt::Display for AdEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AdEventType::AdBreakReady => "AD_BREAK_READY",
            AdEventType::AdBreakStarted => "AD_BREAK_STARTED",
            AdEventType::AdBreakEnded => "AD_BREAK_ENDED",
            AdEventType::AdBreakFetchError => "AD_BREAK_FETCH_ERROR",
            AdEventType::AdBuffering => "AD_BUFFERING",
            AdEventType::AdProgress => "AD_PROGRESS",
            AdEventType::AllAdsCompleted => "ALL_ADS_COMPLETED",
            AdEventType::Clicked => "CLICKED",
            AdEventType::Completed => "COMPLETED",
            AdEventType::ContentPauseRequested => "CONTENT_PAUSE_REQUESTED",
            AdEventType::ContentResumeRequested => "CONTENT_RESUME_REQUESTED",
            AdEventType::Error => "ERROR",
            AdEventType::FirstQuartile => "FIRST_QUARTILE",
            AdEventType::Loaded => "LOADED",
            AdEventType::Log => "LOG",
            AdEventType::Midpoint => "MIDPOINT",
            AdEventType::Paused => "PAUSED",
            AdEventType::Resumed => "RESUMED",
            AdEventType::Skipped => "SKIPPED",
            AdEventType::SkippableStateChanged => "SKIPPABLE_STATE_CHANGED",
            AdEventType::Started => "STARTED",
            AdEventType::ThirdQuartile => "THIRD_QUARTILE",
        };
        f.write_str(name)
    }
}

/// What listeners need to know about the break an event belongs to
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakInfo {
    pub id: String,
    pub pod_index: i32,
    /// Break offset in seconds, -1 for post-rolls
    pub time_offset: f64,
    pub tracking: TrackingEvents,
}

impl BreakInfo {
    pub fn of(ad_break: &AdBreak, content_duration: Option<Duration>) -> Arc<Self> {
        Arc::new(Self {
            id: ad_break.id.clone(),
            pod_index: ad_break.pod_index,
            time_offset: ad_break.offset.seconds(content_duration),
            tracking: ad_break.tracking.clone(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct AdEvent {
    pub kind: AdEventType,
    pub ad: Option<Arc<Ad>>,
    pub ad_break: Option<Arc<BreakInfo>>,
    pub error: Option<AdErrorInfo>,
    pub progress: Option<VideoProgressUpdate>,
}

impl AdEvent {
    pub fn new(kind: AdEventType) -> Self {
        Self {
            kind,
            ad: None,
            ad_break: None,
            error: None,
            progress: None,
        }
    }

    pub fn with_ad(mut self, ad: &Arc<Ad>) -> Self {
        self.ad = Some(Arc::clone(ad));
        self
    }

    pub fn with_break(mut self, info: &Arc<BreakInfo>) -> Self {
        self.ad_break = Some(Arc::clone(info));
        self
    }

    pub fn with_error(mut self, error: AdErrorInfo) -> Self {
        self.error = Some(error);
        self
    }

    pub fn with_progress(mut self, progress: VideoProgressUpdate) -> Self {
        self.progress = Some(progress);
        self
    }
}

impl fmt::Display for AdEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(ad) = &self.ad {
            write!(f, " ad={} ({}/{})", ad.ad_id, ad.pod_info.position, ad.pod_info.total_ads)?;
        }
        if let Some(ad_break) = &self.ad_break {
            write!(f, " break={}", ad_break.id)?;
        }
        if let Some(error) = &self.error {
            write!(f, " error={} {}", error.code, error.message)?;
        }
        Ok(())
    }
}

/// Broadcast channel every state machine publishes to.
///
/// `publish` never blocks and drops the event when nobody listens. Slow
/// subscribers see `RecvError::Lagged` instead of holding producers up.
#[derive(Clone, Debug)]
pub struct EventBus {
    tx: broadcast::Sender<AdEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: AdEvent) {
        log::debug!("event: {}", event);
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AdEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_without_subscribers_does_not_panic() {
        let bus = EventBus::new(4);
        bus.publish(AdEvent::new(AdEventType::AllAdsCompleted));
    }

    #[tokio::test]
    async fn every_subscriber_receives() {
        let bus = EventBus::new(16);
        let mut first = bus.subscribe();
        let mut second = bus.clone().subscribe();
        bus.publish(AdEvent::new(AdEventType::ContentPauseRequested));
        assert_eq!(first.recv().await.unwrap().kind, AdEventType::ContentPauseRequested);
        assert_eq!(second.recv().await.unwrap().kind, AdEventType::ContentPauseRequested);
    }

    #[tokio::test]
    async fn lagging_subscriber_is_told() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();
        for _ in 0..5 {
            bus.publish(AdEvent::new(AdEventType::AdProgress));
        }
        assert!(matches!(rx.recv().await, Err(broadcast::error::RecvError::Lagged(_))));
    }

    #[test]
    fn event_names_match_the_wire_names() {
        assert_eq!(AdEventType::AdBreakFetchError.to_string(), "AD_BREAK_FETCH_ERROR");
        assert_eq!(AdEventType::ContentResumeRequested.to_string(), "CONTENT_RESUME_REQUESTED");
    }
}

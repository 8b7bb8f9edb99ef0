//! Tracking URLs attached to ads and breaks, and the handler that fires them.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::events::{AdEvent, AdEventType, EventBus};
use crate::fetch::AdTagFetcher;

/// Names used by `<Tracking event="...">` and the implicit URL lists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrackingEventName {
    CreativeView,
    Loaded,
    Start,
    FirstQuartile,
    Midpoint,
    ThirdQuartile,
    Complete,
    Skip,
    Progress,
    Mute,
    Unmute,
    Pause,
    Resume,
    Rewind,
    Fullscreen,
    ExitFullscreen,
    PlayerExpand,
    PlayerCollapse,
    AcceptInvitation,
    AcceptInvitationLinear,
    CloseLinear,
    Close,
    OtherAdInteraction,
    Impression,
    ClickTracking,
    Error,
    BreakStart,
    BreakEnd,
}

impl TrackingEventName {
    pub fn as_str(self) -> &'static str {
        match self {
            TrackingEventName::CreativeView => "creativeView",
            TrackingEventName::Loaded => "loaded",
            TrackingEventName::Start => "start",
            TrackingEventName::FirstQuartile => "firstQuartile",
            TrackingEventName::Midpoint => "midpoint",
            TrackingEventName::ThirdQuartile => "thirdQuartile",
            TrackingEventName::Complete => "complete",
            TrackingEventName::Skip => "skip",
            TrackingEventName::Progress => "progress",
            TrackingEventName::Mute => "mute",
            TrackingEventName::Unmute => "unmute",
            TrackingEventName::Pause => "pause",
            TrackingEventName::Resume => "resume",
            TrackingEventName::Rewind => "rewind",
            TrackingEventName::Fullscreen => "fullscreen",
            TrackingEventName::ExitFullscreen => "exitFullscreen",
            TrackingEventName::PlayerExpand => "playerExpand",
            TrackingEventName::PlayerCollapse => "playerCollapse",
            TrackingEventName::AcceptInvitation => "acceptInvitation",
            TrackingEventName::AcceptInvitationLinear => "acceptInvitationLinear",
            TrackingEventName::CloseLinear => "closeLinear",
            TrackingEventName::Close => "close",
            TrackingEventName::OtherAdInteraction => "otherAdInteraction",
            TrackingEventName::Impression => "Impression",
            TrackingEventName::ClickTracking => "ClickTracking",
            TrackingEventName::Error => "error",
            TrackingEventName::BreakStart => "breakStart",
            TrackingEventName::BreakEnd => "breakEnd",
        }
    }

    /// Click trackers fire on every click.
    pub fn allows_repeat(self) -> bool {
        matches!(self, TrackingEventName::ClickTracking)
    }
}

impl fmt::Display for TrackingEventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownTrackingEvent(pub String);

impl FromStr for TrackingEventName {
    type Err = UnknownTrackingEvent;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = match s.trim() {
            "creativeView" => TrackingEventName::CreativeView,
            "loaded" => TrackingEventName::Loaded,
            "start" => TrackingEventName::Start,
            "firstQuartile" => TrackingEventName::FirstQuartile,
            "midpoint" => TrackingEventName::Midpoint,
            "thirdQuartile" => TrackingEventName::ThirdQuartile,
            "complete" => TrackingEventName::Complete,
            "skip" => TrackingEventName::Skip,
            "progress" => TrackingEventName::Progress,
            "mute" => TrackingEventName::Mute,
            "unmute" => TrackingEventName::Unmute,
            "pause" => TrackingEventName::Pause,
            "resume" => TrackingEventName::Resume,
            "rewind" => TrackingEventName::Rewind,
            "fullscreen" => TrackingEventName::Fullscreen,
            "exitFullscreen" => TrackingEventName::ExitFullscreen,
            "playerExpand" => TrackingEventName::PlayerExpand,
            "playerCollapse" => TrackingEventName::PlayerCollapse,
            "acceptInvitation" => TrackingEventName::AcceptInvitation,
            "acceptInvitationLinear" => TrackingEventName::AcceptInvitationLinear,
            "closeLinear" => TrackingEventName::CloseLinear,
            "close" => TrackingEventName::Close,
            "otherAdInteraction" => TrackingEventName::OtherAdInteraction,
            "Impression" | "impression" => TrackingEventName::Impression,
            "ClickTracking" | "clickTracking" => TrackingEventName::ClickTracking,
            "error" | "Error" => TrackingEventName::Error,
            "breakStart" => TrackingEventName::BreakStart,
            "breakEnd" => TrackingEventName::BreakEnd,
            other => return Err(UnknownTrackingEvent(other.to_string())),
        };
        Ok(name)
    }
}

/// A single tracking pixel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackingUrl {
    pub event: TrackingEventName,
    pub url: String,
}

impl TrackingUrl {
    pub fn new(event: TrackingEventName, url: impl Into<String>) -> Self {
        Self { event, url: url.into() }
    }
}

/// Tracking URLs keyed by event name, in document order
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TrackingEvents {
    entries: Vec<TrackingUrl>,
}

impl TrackingEvents {
    pub fn push(&mut self, url: TrackingUrl) {
        self.entries.push(url);
    }

    pub fn extend(&mut self, other: &TrackingEvents) {
        self.entries.extend(other.entries.iter().cloned());
    }

    pub fn urls_for(&self, event: TrackingEventName) -> impl Iterator<Item = &TrackingUrl> {
        self.entries.iter().filter(move |u| u.event == event)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TrackingUrl> {
        self.entries.iter()
    }
}

impl FromIterator<TrackingUrl> for TrackingEvents {
    fn from_iter<I: IntoIterator<Item = TrackingUrl>>(iter: I) -> Self {
        Self { entries: iter.into_iter().collect() }
    }
}

/// Turns lifecycle events into tracking pixel requests.
///
/// Every tracking name fires at most once per ad (or per break), except
/// click trackers which fire on each click.
pub struct TrackingHandler {
    fetcher: Arc<dyn AdTagFetcher>,
    fired: HashSet<(String, TrackingEventName)>,
}

impl TrackingHandler {
    pub fn new(fetcher: Arc<dyn AdTagFetcher>) -> Self {
        Self {
            fetcher,
            fired: HashSet::new(),
        }
    }

    /// Macro-substituted URLs that `event` should fire now
    pub fn urls_for_event(&mut self, event: &AdEvent) -> Vec<String> {
        let error_code = event.error.as_ref().map(|e| e.code.value());
        let mut urls = Vec::new();

        if let Some(ad) = &event.ad {
            let names: &[TrackingEventName] = match event.kind {
                AdEventType::Loaded => &[TrackingEventName::Loaded],
                AdEventType::Started => &[
                    TrackingEventName::Impression,
                    TrackingEventName::CreativeView,
                    TrackingEventName::Start,
                ],
                AdEventType::FirstQuartile => &[TrackingEventName::FirstQuartile],
                AdEventType::Midpoint => &[TrackingEventName::Midpoint],
                AdEventType::ThirdQuartile => &[TrackingEventName::ThirdQuartile],
                AdEventType::Completed => &[TrackingEventName::Complete],
                AdEventType::Skipped => &[TrackingEventName::Skip],
                AdEventType::Paused => &[TrackingEventName::Pause],
                AdEventType::Resumed => &[TrackingEventName::Resume],
                AdEventType::Clicked => &[TrackingEventName::ClickTracking],
                AdEventType::Error => &[TrackingEventName::Error],
                _ => &[],
            };
            for &name in names {
                if !self.claim(&ad.uid, name) {
                    continue;
                }
                let source: Box<dyn Iterator<Item = &TrackingUrl> + '_> = match name {
                    TrackingEventName::Impression => Box::new(ad.tracking.impressions.iter()),
                    TrackingEventName::Error => Box::new(ad.tracking.errors.iter()),
                    TrackingEventName::ClickTracking => Box::new(ad.tracking.clicks.iter()),
                    other => Box::new(ad.tracking.events.urls_for(other)),
                };
                urls.extend(source.map(|u| substitute_macros(&u.url, error_code)));
            }
        } else if let Some(ad_break) = &event.ad_break {
            let name = match event.kind {
                AdEventType::AdBreakStarted => Some(TrackingEventName::BreakStart),
                AdEventType::AdBreakEnded => Some(TrackingEventName::BreakEnd),
                AdEventType::AdBreakFetchError => Some(TrackingEventName::Error),
                _ => None,
            };
            if let Some(name) = name {
                let scope = format!("break:{}", ad_break.id);
                if self.claim(&scope, name) {
                    urls.extend(
                        ad_break
                            .tracking
                            .urls_for(name)
                            .map(|u| substitute_macros(&u.url, error_code)),
                    );
                }
            }
        }

        urls
    }

    fn claim(&mut self, scope: &str, name: TrackingEventName) -> bool {
        name.allows_repeat() || self.fired.insert((scope.to_string(), name))
    }

    /// Listen on `bus` until `token` is cancelled, firing pixels as events arrive
    pub fn spawn(mut self, bus: &EventBus, token: CancellationToken) -> JoinHandle<()> {
        let mut rx = bus.subscribe();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = token.cancelled() => break,
                    event = rx.recv() => event,
                };
                match event {
                    Ok(event) => {
                        for url in self.urls_for_event(&event) {
                            let fetcher = Arc::clone(&self.fetcher);
                            tokio::spawn(async move {
                                if let Err(e) = fetcher.ping(&url).await {
                                    log::warn!("Tracking pixel {} failed: {}", url, e);
                                }
                            });
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        log::warn!("Tracking handler lagged behind, {} events dropped", missed);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}

/// Replace the VAST macros this engine knows about
pub fn substitute_macros(url: &str, error_code: Option<i32>) -> String {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    let cache_buster: u32 = rand::thread_rng().gen_range(10_000_000..100_000_000);

    let mut out = url
        .replace("[TIMESTAMP]", &timestamp.to_string())
        .replace("[CACHEBUSTING]", &cache_buster.to_string());
    if let Some(code) = error_code {
        out = out.replace("[ERRORCODE]", &code.to_string());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_names_and_rejects_unknown() {
        assert_eq!("firstQuartile".parse::<TrackingEventName>(), Ok(TrackingEventName::FirstQuartile));
        assert_eq!("Impression".parse::<TrackingEventName>(), Ok(TrackingEventName::Impression));
        assert!("acceptInvitationLinearX".parse::<TrackingEventName>().is_err());
    }

    #[test]
    fn macros_are_replaced() {
        let url = substitute_macros("https://t.example/e?c=[ERRORCODE]&cb=[CACHEBUSTING]", Some(402));
        assert!(url.starts_with("https://t.example/e?c=402&cb="));
        assert!(!url.contains('['));
        let untouched = substitute_macros("https://t.example/e?c=[ERRORCODE]", None);
        assert!(untouched.contains("[ERRORCODE]"));
    }
}

//! Playback state of a single ad.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::ad_break::Ad;
use crate::companion::CompanionPlacement;
use crate::error::{Result, VastError};
use crate::events::{AdEvent, AdEventType, EventBus};
use crate::media::MediaRenditionSelector;
use crate::player::{AdMediaInfo, EngineMessage, VideoProgressUpdate};

/// Ordered so that a later stage compares greater. `Completed`, `Skipped`
/// and `Error` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AdState {
    None,
    Loaded,
    Started,
    FirstQuartile,
    Midpoint,
    ThirdQuartile,
    Completed,
    Skipped,
    Error,
}

impl AdState {
    pub fn is_terminal(self) -> bool {
        matches!(self, AdState::Completed | AdState::Skipped | AdState::Error)
    }

    fn event(self) -> Option<AdEventType> {
        match self {
            AdState::None => None,
            AdState::Loaded => Some(AdEventType::Loaded),
            AdState::Started => Some(AdEventType::Started),
            AdState::FirstQuartile => Some(AdEventType::FirstQuartile),
            AdState::Midpoint => Some(AdEventType::Midpoint),
            AdState::ThirdQuartile => Some(AdEventType::ThirdQuartile),
            AdState::Completed => Some(AdEventType::Completed),
            AdState::Skipped => Some(AdEventType::Skipped),
            AdState::Error => Some(AdEventType::Error),
        }
    }

    /// Stage a progress fraction corresponds to once playback has started
    fn for_fraction(fraction: f64) -> AdState {
        if fraction >= 0.75 {
            AdState::ThirdQuartile
        } else if fraction >= 0.5 {
            AdState::Midpoint
        } else if fraction >= 0.25 {
            AdState::FirstQuartile
        } else {
            AdState::Started
        }
    }

    fn successor(self) -> AdState {
        match self {
            AdState::None => AdState::Loaded,
            AdState::Loaded => AdState::Started,
            AdState::Started => AdState::FirstQuartile,
            AdState::FirstQuartile => AdState::Midpoint,
            AdState::Midpoint => AdState::ThirdQuartile,
            AdState::ThirdQuartile => AdState::Completed,
            terminal => terminal,
        }
    }
}

pub struct ActiveAd {
    ad: Arc<Ad>,
    media: AdMediaInfo,
    state: AdState,
    companions: Option<Vec<CompanionPlacement>>,
    media_timer: Option<CancellationToken>,
    play_requested: bool,
    skippable_announced: bool,
    last_progress: Option<VideoProgressUpdate>,
}

impl ActiveAd {
    /// Pick the rendition for `ad`. Fails with `NoSuitableMedia` when none fits.
    pub fn new(ad: Arc<Ad>, selector: &MediaRenditionSelector) -> Result<Self> {
        let media_file = selector.select(ad.media_files())?;
        let media = AdMediaInfo {
            ad_uid: ad.uid.clone(),
            url: media_file.url.clone(),
        };
        Ok(Self {
            ad,
            media,
            state: AdState::None,
            companions: None,
            media_timer: None,
            play_requested: false,
            skippable_announced: false,
            last_progress: None,
        })
    }

    pub fn ad(&self) -> &Arc<Ad> {
        &self.ad
    }

    pub fn media(&self) -> &AdMediaInfo {
        &self.media
    }

    pub fn state(&self) -> AdState {
        self.state
    }

    pub fn last_progress(&self) -> Option<VideoProgressUpdate> {
        self.last_progress
    }

    pub fn companions(&self) -> Option<&[CompanionPlacement]> {
        self.companions.as_deref()
    }

    pub(crate) fn set_companions(&mut self, placements: Vec<CompanionPlacement>) {
        self.companions = Some(placements);
    }

    /// Playback was handed to this ad and is waiting on the media
    pub fn play_requested(&self) -> bool {
        self.play_requested
    }

    fn transition(&mut self, to: AdState, bus: &EventBus) -> bool {
        if self.state.is_terminal() || (!to.is_terminal() && to <= self.state) {
            return false;
        }
        log::debug!("Ad {} state {:?} -> {:?}", self.ad.uid, self.state, to);
        self.state = to;
        if to >= AdState::Started {
            self.cancel_media_timer();
        }
        if let Some(kind) = to.event().filter(|k| *k != AdEventType::Error) {
            bus.publish(AdEvent::new(kind).with_ad(&self.ad));
        }
        true
    }

    /// Media was prepared by the player
    pub fn mark_loaded(&mut self, bus: &EventBus) -> bool {
        self.state == AdState::None && self.transition(AdState::Loaded, bus)
    }

    /// Feed an ad progress sample, returning the states entered in order.
    ///
    /// Stages skipped over by a jump (a seek, a late sample) are emitted
    /// on the way; nothing earlier than the current stage is ever emitted.
    pub fn on_progress(&mut self, update: VideoProgressUpdate, bus: &EventBus) -> Vec<AdState> {
        self.last_progress = Some(update);
        if self.state.is_terminal() || self.state == AdState::None {
            return Vec::new();
        }

        let target = if update.is_advancing() {
            AdState::for_fraction(update.fraction())
        } else {
            self.state
        };

        let mut entered = Vec::new();
        while self.state < target {
            let next = self.state.successor();
            if !self.transition(next, bus) {
                break;
            }
            entered.push(next);
        }

        if entered.is_empty() && self.state >= AdState::Started {
            bus.publish(AdEvent::new(AdEventType::AdProgress).with_ad(&self.ad).with_progress(update));
        }

        if !self.skippable_announced && self.state >= AdState::Started {
            if let Some(offset) = self.ad.skip_offset().filter(|offset| update.current >= *offset) {
                log::debug!("Ad {} skippable after {:?}", self.ad.uid, offset);
                self.skippable_announced = true;
                bus.publish(AdEvent::new(AdEventType::SkippableStateChanged).with_ad(&self.ad));
            }
        }
        entered
    }

    /// The player finished the media
    pub fn on_ended(&mut self, bus: &EventBus) -> bool {
        (AdState::Started..=AdState::ThirdQuartile).contains(&self.state) && self.transition(AdState::Completed, bus)
    }

    pub fn skip(&mut self, bus: &EventBus) -> bool {
        self.transition(AdState::Skipped, bus)
    }

    /// Move to `Error`, publishing the error event
    pub fn fail(&mut self, error: &VastError, bus: &EventBus) -> bool {
        if !self.transition(AdState::Error, bus) {
            return false;
        }
        log::warn!("Ad {} failed: {}", self.ad.uid, error);
        bus.publish(AdEvent::new(AdEventType::Error).with_ad(&self.ad).with_error(error.info()));
        true
    }

    /// The media timer went off. Only an ad still waiting on its media fails.
    pub fn on_media_timeout(&mut self, timeout: Duration, bus: &EventBus) -> bool {
        self.state == AdState::Loaded && self.fail(&VastError::MediaLoadTimeout(timeout), bus)
    }

    pub fn on_paused(&self, bus: &EventBus) {
        if !self.state.is_terminal() {
            bus.publish(AdEvent::new(AdEventType::Paused).with_ad(&self.ad));
        }
    }

    pub fn on_resumed(&self, bus: &EventBus) {
        if !self.state.is_terminal() {
            bus.publish(AdEvent::new(AdEventType::Resumed).with_ad(&self.ad));
        }
    }

    pub fn on_buffering(&self, bus: &EventBus) {
        bus.publish(AdEvent::new(AdEventType::AdBuffering).with_ad(&self.ad));
    }

    /// Returns the click-through URL for the host to open
    pub fn click(&self, bus: &EventBus) -> Option<String> {
        bus.publish(AdEvent::new(AdEventType::Clicked).with_ad(&self.ad));
        self.ad.click_through().map(str::to_string)
    }

    /// Hand playback to this ad: arm the media timer under `parent`
    pub(crate) fn begin_playback(
        &mut self,
        timeout: Duration,
        tx: &mpsc::UnboundedSender<EngineMessage>,
        parent: &CancellationToken,
    ) {
        self.play_requested = true;
        self.cancel_media_timer();

        let token = parent.child_token();
        let timer = token.clone();
        let tx = tx.clone();
        let media = self.media.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = timer.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    let _ = tx.send(EngineMessage::MediaLoadTimeout(media));
                }
            }
        });
        self.media_timer = Some(token);
    }

    fn cancel_media_timer(&mut self) {
        if let Some(timer) = self.media_timer.take() {
            timer.cancel();
        }
    }
}

impl Drop for ActiveAd {
    fn drop(&mut self) {
        self.cancel_media_timer();
    }
}

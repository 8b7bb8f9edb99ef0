//! The break currently being played: which ad is on, which is preloaded,
//! and when content pauses and resumes around them.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::active_ad::{ActiveAd, AdState};
use crate::ad_break::AdBreak;
use crate::companion::{select_companions, CompanionRenderer, CompanionSlot};
use crate::error::{AdErrorInfo, VastError};
use crate::events::{AdEvent, AdEventType, BreakInfo, EventBus};
use crate::loader::{AdBreakLoader, LoadOutcome};
use crate::media::MediaRenditionSelector;
use crate::player::{AdMediaInfo, ContentPosition, EngineMessage, VideoAdPlayer, VideoProgressUpdate};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdBreakState {
    Init,
    Started,
    Ended,
}

/// Host companion slots and the renderer drawing into them
#[derive(Clone)]
pub struct CompanionSetup {
    pub slots: Vec<CompanionSlot>,
    pub renderer: Arc<dyn CompanionRenderer>,
}

/// Collaborators shared by every break of one manager
pub struct BreakContext {
    pub player: Arc<dyn VideoAdPlayer>,
    pub bus: EventBus,
    pub loader: AdBreakLoader,
    pub selector: MediaRenditionSelector,
    pub companions: Option<CompanionSetup>,
    pub vast_load_timeout: Duration,
    pub media_load_timeout: Duration,
    pub(crate) tx: mpsc::UnboundedSender<EngineMessage>,
    pub(crate) token: CancellationToken,
}

pub struct ActiveAdBreak {
    break_id: String,
    info: Arc<BreakInfo>,
    start: Option<Duration>,
    state: AdBreakState,
    current: Option<ActiveAd>,
    next: Option<ActiveAd>,
    prepared: HashSet<String>,
    loading: bool,
    content_paused: bool,
    last_error: Option<AdErrorInfo>,
    token: CancellationToken,
}

impl ActiveAdBreak {
    /// Take over `ad_break` and prepare its first ad, asking the loader for
    /// more when nothing is playable yet.
    pub fn activate(ad_break: &mut AdBreak, content_duration: Option<Duration>, ctx: &BreakContext) -> Self {
        log::info!(
            "Activating ad break {} ({} ads listed, {} total)",
            ad_break.id,
            ad_break.ads().len(),
            ad_break.total_ads()
        );
        let mut active = Self {
            break_id: ad_break.id.clone(),
            info: BreakInfo::of(ad_break, content_duration),
            start: ad_break.start(content_duration),
            state: AdBreakState::Init,
            current: None,
            next: None,
            prepared: HashSet::new(),
            loading: false,
            content_paused: false,
            last_error: None,
            token: ctx.token.child_token(),
        };
        active.current = active.load_next(ad_break, ctx);
        if active.current.is_none() {
            active.settle(ad_break, ctx);
        }
        active
    }

    pub fn break_id(&self) -> &str {
        &self.break_id
    }

    pub fn state(&self) -> AdBreakState {
        self.state
    }

    pub fn is_ended(&self) -> bool {
        self.state == AdBreakState::Ended
    }

    /// Content is paused for this break's ads
    pub fn is_content_paused(&self) -> bool {
        self.content_paused
    }

    pub fn current_ad(&self) -> Option<&ActiveAd> {
        self.current.as_ref()
    }

    pub fn next_ad(&self) -> Option<&ActiveAd> {
        self.next.as_ref()
    }

    /// Content moved. Starts the current ad once the break's start is reached.
    pub fn on_content_progress(&mut self, position: ContentPosition, ctx: &BreakContext) {
        if self.state == AdBreakState::Ended || self.content_paused || !position.has_reached(self.start) {
            return;
        }
        let ready = self
            .current
            .as_ref()
            .is_some_and(|ad| ad.state() == AdState::Loaded && !ad.play_requested());
        if ready {
            self.play_current(ctx);
        }
    }

    fn play_current(&mut self, ctx: &BreakContext) {
        let Some(current) = self.current.as_mut() else {
            return;
        };
        if !self.content_paused {
            self.content_paused = true;
            ctx.bus.publish(
                AdEvent::new(AdEventType::ContentPauseRequested)
                    .with_ad(current.ad())
                    .with_break(&self.info),
            );
        }
        current.begin_playback(ctx.media_load_timeout, &ctx.tx, &self.token);
        ctx.player.play_ad(current.media());
    }

    /// First ad of the break not prepared yet, loaded into the player.
    ///
    /// Ads without a usable rendition are passed over. With nothing listed,
    /// claims the next pending redirect.
    fn load_next(&mut self, ad_break: &AdBreak, ctx: &BreakContext) -> Option<ActiveAd> {
        loop {
            let candidate = ad_break
                .ads()
                .iter()
                .find(|ad| !self.prepared.contains(&ad.uid))
                .cloned();
            let Some(ad) = candidate else {
                self.request_more(ad_break, ctx);
                return None;
            };

            self.prepared.insert(ad.uid.clone());
            match ActiveAd::new(Arc::clone(&ad), &ctx.selector) {
                Ok(mut next) => {
                    next.mark_loaded(&ctx.bus);
                    self.pick_companions(&mut next, ctx);
                    ctx.player.load_ad(next.media(), &next.ad().pod_info);
                    return Some(next);
                }
                Err(e) => {
                    log::warn!("Passing over ad {} of break {}: {}", ad.uid, ad_break.id, e);
                    let info = e.info();
                    ctx.bus.publish(AdEvent::new(AdEventType::Log).with_ad(&ad).with_error(info.clone()));
                    self.last_error = Some(info);
                }
            }
        }
    }

    fn request_more(&mut self, ad_break: &AdBreak, ctx: &BreakContext) {
        if self.loading {
            return;
        }
        let tx = ctx.tx.clone();
        let break_id = ad_break.id.clone();
        // Loads outlive deactivation so a superseded break keeps what it fetched
        let handle = ctx
            .loader
            .load(ad_break, ctx.vast_load_timeout, ctx.token.child_token(), move |outcome| {
                let _ = tx.send(EngineMessage::BreakLoaded { break_id, outcome });
            });
        // A claim still held belongs to a load started by an earlier activation
        self.loading = handle.is_some() || ctx.loader.is_claimed(ad_break);
    }

    fn pick_companions(&self, ad: &mut ActiveAd, ctx: &BreakContext) {
        let Some(setup) = &ctx.companions else {
            return;
        };
        if ad.companions().is_some() {
            return;
        }
        let placements = select_companions(&setup.slots, &ad.ad().companions).unwrap_or_default();
        setup.renderer.load(&placements);
        ad.set_companions(placements);
    }

    /// No current ad: wait for the loader, or end the break
    fn settle(&mut self, ad_break: &mut AdBreak, ctx: &BreakContext) {
        if self.loading || self.current.is_some() {
            return;
        }
        if self.state == AdBreakState::Init && !self.content_paused {
            let error = self
                .last_error
                .take()
                .unwrap_or_else(|| VastError::EmptyResponse.info());
            self.fail_fetch(error, ad_break, ctx);
        } else {
            self.end(ad_break, ctx);
        }
    }

    /// The loader finished resolving this break's redirects
    pub fn on_break_loaded(
        &mut self,
        outcome: LoadOutcome,
        ad_break: &mut AdBreak,
        content_duration: Option<Duration>,
        ctx: &BreakContext,
    ) {
        self.loading = false;
        let (resolved, error) = match outcome {
            LoadOutcome::Loaded(resolved) => (resolved, None),
            LoadOutcome::Failed { ad_break, error } => (ad_break, Some(error)),
        };
        ad_break.sources = resolved.sources;
        ad_break.refresh_ads(content_duration);
        if self.state == AdBreakState::Ended {
            return;
        }

        match &error {
            None => ctx
                .bus
                .publish(AdEvent::new(AdEventType::AdBreakReady).with_break(&self.info)),
            Some(e) => {
                log::warn!("Ad break {} failed to load: {}", ad_break.id, e);
                self.last_error = Some(e.info());
            }
        }

        if self.current.is_none() {
            self.current = self.load_next(ad_break, ctx);
            match &self.current {
                Some(_) if self.content_paused => self.play_current(ctx),
                Some(_) => {}
                None => self.settle(ad_break, ctx),
            }
        } else if self.next.is_none() && self.current.as_ref().is_some_and(|c| c.state() >= AdState::Started) {
            self.next = self.load_next(ad_break, ctx);
        }

        if let (Some(e), Some(_)) = (error, &self.current) {
            ctx.bus.publish(
                AdEvent::new(AdEventType::AdBreakFetchError)
                    .with_break(&self.info)
                    .with_error(e.info()),
            );
        }
    }

    /// The whole break failed before any ad played
    fn fail_fetch(&mut self, error: AdErrorInfo, ad_break: &mut AdBreak, ctx: &BreakContext) {
        log::warn!("Ad break {} has no playable ads: {}", ad_break.id, error.message);
        self.state = AdBreakState::Ended;
        ad_break.has_unplayed_ads = false;
        self.token.cancel();
        ctx.bus
            .publish(AdEvent::new(AdEventType::Log).with_break(&self.info).with_error(error.clone()));
        ctx.bus.publish(
            AdEvent::new(AdEventType::AdBreakFetchError)
                .with_break(&self.info)
                .with_error(error),
        );
        ctx.bus
            .publish(AdEvent::new(AdEventType::ContentResumeRequested).with_break(&self.info));
    }

    fn end(&mut self, ad_break: &mut AdBreak, ctx: &BreakContext) {
        log::info!("Ad break {} ended", ad_break.id);
        self.state = AdBreakState::Ended;
        ad_break.has_unplayed_ads = false;
        if let Some(next) = self.next.take() {
            ctx.player.stop_ad(next.media());
        }
        self.token.cancel();
        if let Some(setup) = &ctx.companions {
            setup.renderer.release(&setup.slots);
        }
        ctx.bus.publish(AdEvent::new(AdEventType::AdBreakEnded).with_break(&self.info));
        self.content_paused = false;
        ctx.bus
            .publish(AdEvent::new(AdEventType::ContentResumeRequested).with_break(&self.info));
    }

    fn on_started(&mut self, ad_break: &AdBreak, ctx: &BreakContext) {
        if self.state == AdBreakState::Init {
            self.state = AdBreakState::Started;
            ctx.bus
                .publish(AdEvent::new(AdEventType::AdBreakStarted).with_break(&self.info));
        }
        if let (Some(setup), Some(current)) = (&ctx.companions, &self.current) {
            setup.renderer.release(&setup.slots);
            if let Some(placements) = current.companions() {
                setup.renderer.render(placements);
            }
        }
        if self.next.is_none() {
            self.next = self.load_next(ad_break, ctx);
        }
    }

    /// The current ad reached a terminal state: swap in the next one or end
    fn finish_current(&mut self, ad_break: &mut AdBreak, error: Option<&VastError>, ctx: &BreakContext) {
        let Some(finished) = self.current.take() else {
            return;
        };
        ctx.player.stop_ad(finished.media());

        if error.is_some_and(|e| !e.is_recoverable()) {
            log::warn!("Unrecoverable error, ending ad break {}", ad_break.id);
            self.end(ad_break, ctx);
            return;
        }

        self.current = match self.next.take() {
            Some(next) => Some(next),
            None => self.load_next(ad_break, ctx),
        };
        if self.current.is_some() {
            self.play_current(ctx);
        } else {
            self.settle(ad_break, ctx);
        }
    }

    fn target(&mut self, media: &AdMediaInfo) -> Option<&mut ActiveAd> {
        if self.current.as_ref().is_some_and(|ad| ad.media() == media) {
            return self.current.as_mut();
        }
        if self.next.as_ref().is_some_and(|ad| ad.media() == media) {
            return self.next.as_mut();
        }
        None
    }

    fn is_current(&self, media: &AdMediaInfo) -> bool {
        self.current.as_ref().is_some_and(|ad| ad.media() == media)
    }

    pub fn on_ad_loaded(&mut self, media: &AdMediaInfo, ctx: &BreakContext) {
        if let Some(ad) = self.target(media) {
            ad.mark_loaded(&ctx.bus);
        }
    }

    pub fn on_ad_progress(
        &mut self,
        media: &AdMediaInfo,
        progress: VideoProgressUpdate,
        ad_break: &AdBreak,
        ctx: &BreakContext,
    ) {
        if !self.is_current(media) {
            return;
        }
        let Some(current) = self.current.as_mut() else {
            return;
        };
        let entered = current.on_progress(progress, &ctx.bus);
        if entered.contains(&AdState::Started) {
            self.on_started(ad_break, ctx);
        }
    }

    pub fn on_ad_ended(&mut self, media: &AdMediaInfo, ad_break: &mut AdBreak, ctx: &BreakContext) {
        if !self.is_current(media) {
            return;
        }
        if self.current.as_mut().is_some_and(|ad| ad.on_ended(&ctx.bus)) {
            self.finish_current(ad_break, None, ctx);
        }
    }

    pub fn on_ad_error(&mut self, media: &AdMediaInfo, error: VastError, ad_break: &mut AdBreak, ctx: &BreakContext) {
        if self.is_current(media) {
            if self.current.as_mut().is_some_and(|ad| ad.fail(&error, &ctx.bus)) {
                self.finish_current(ad_break, Some(&error), ctx);
            }
        } else if self.next.as_ref().is_some_and(|ad| ad.media() == media) {
            if let Some(mut next) = self.next.take() {
                next.fail(&error, &ctx.bus);
                ctx.player.stop_ad(next.media());
            }
        }
    }

    pub fn on_media_timeout(&mut self, media: &AdMediaInfo, ad_break: &mut AdBreak, ctx: &BreakContext) {
        if !self.is_current(media) {
            return;
        }
        let timeout = ctx.media_load_timeout;
        if self.current.as_mut().is_some_and(|ad| ad.on_media_timeout(timeout, &ctx.bus)) {
            self.finish_current(ad_break, Some(&VastError::MediaLoadTimeout(timeout)), ctx);
        }
    }

    pub fn on_ad_paused(&mut self, media: &AdMediaInfo, ctx: &BreakContext) {
        if let Some(ad) = self.target(media) {
            ad.on_paused(&ctx.bus);
        }
    }

    pub fn on_ad_resumed(&mut self, media: &AdMediaInfo, ctx: &BreakContext) {
        if let Some(ad) = self.target(media) {
            ad.on_resumed(&ctx.bus);
        }
    }

    pub fn on_ad_buffering(&mut self, media: &AdMediaInfo, ctx: &BreakContext) {
        if self.is_current(media) {
            if let Some(ad) = &self.current {
                ad.on_buffering(&ctx.bus);
            }
        }
    }

    /// Skip the ad on screen. Returns whether anything was skipped.
    pub fn skip(&mut self, ad_break: &mut AdBreak, ctx: &BreakContext) -> bool {
        let skipped = self
            .current
            .as_mut()
            .is_some_and(|ad| ad.state() >= AdState::Loaded && ad.skip(&ctx.bus));
        if skipped {
            self.finish_current(ad_break, None, ctx);
        }
        skipped
    }

    pub fn click(&self, ctx: &BreakContext) -> Option<String> {
        self.current
            .as_ref()
            .filter(|ad| ad.state() >= AdState::Started && !ad.state().is_terminal())
            .and_then(|ad| ad.click(&ctx.bus))
    }

    pub fn pause(&self, ctx: &BreakContext) {
        if let Some(current) = self.current.as_ref().filter(|ad| ad.play_requested()) {
            ctx.player.pause_ad(current.media());
        }
    }

    pub fn resume(&self, ctx: &BreakContext) {
        if let Some(current) = self.current.as_ref().filter(|ad| ad.play_requested()) {
            ctx.player.play_ad(current.media());
        }
    }

    /// Another break became due before this one played. Releases preloaded
    /// media and stops timers. A redirect still resolving keeps going and is
    /// handed back to the break when it lands.
    pub fn deactivate(mut self, ctx: &BreakContext) {
        log::debug!("Deactivating ad break {}", self.break_id);
        self.token.cancel();
        for ad in [self.current.take(), self.next.take()].into_iter().flatten() {
            ctx.player.stop_ad(ad.media());
        }
    }
}

impl Drop for ActiveAdBreak {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

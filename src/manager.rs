//! Ad break scheduling for one piece of content.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::active_break::{ActiveAdBreak, BreakContext, CompanionSetup};
use crate::ad_break::{Ad, AdBreak, BreakOffset};
use crate::companion::{CompanionRenderer, CompanionSlot};
use crate::config::{AdsRenderingSettings, EngineConfig};
use crate::error::VastError;
use crate::events::{AdEvent, AdEventType, EventBus};
use crate::loader::{AdBreakLoader, LoadOutcome};
use crate::media::MediaRenditionSelector;
use crate::player::{
    ContentPosition, EngineMessage, PlayerCallbacks, PlayerEvent, VideoAdPlayer, VideoProgressUpdate,
};
use crate::policy::{AdSchedulingPolicy, DefaultPolicy, WatchTimePolicy};
use crate::vmap::{POST_ROLL_POD_INDEX, PRE_ROLL_POD_INDEX};

/// Decides which break is due, activates it and routes player reports to it.
///
/// All state lives on the task driving the manager. Player reports, media
/// timers and redirect resolutions come back as messages through
/// [`next_message`](Self::next_message) or
/// [`process_pending`](Self::process_pending); hosts on the same task may also
/// call the `on_*` methods directly.
pub struct AdsManager {
    breaks: Vec<AdBreak>,
    active: Option<ActiveAdBreak>,
    ctx: BreakContext,
    policy: Box<dyn AdSchedulingPolicy>,
    rx: mpsc::UnboundedReceiver<EngineMessage>,
    configured_media_timeout: Duration,
    content_duration: Option<Duration>,
    last_position: Option<ContentPosition>,
    last_ad_progress: Option<VideoProgressUpdate>,
    all_ads_completed: bool,
    destroyed: bool,
}

impl AdsManager {
    pub fn new(breaks: Vec<AdBreak>, player: Arc<dyn VideoAdPlayer>, loader: AdBreakLoader, config: &EngineConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let policy: Box<dyn AdSchedulingPolicy> = match &config.watch_time {
            Some(watch_time) => Box::new(
                WatchTimePolicy::new(Duration::from_secs(watch_time.content_duration_secs), watch_time.tie_break)
                    .with_interval(Duration::from_secs(watch_time.interval_secs))
                    .with_threshold(Duration::from_millis(watch_time.threshold_ms))
                    .with_preload_offset(config.preload_offset()),
            ),
            None => Box::new(DefaultPolicy::new(config.preload_offset())),
        };
        let ctx = BreakContext {
            player,
            bus: EventBus::default(),
            loader,
            selector: MediaRenditionSelector::new(&config.mime_types, config.bitrate_kbps),
            companions: None,
            vast_load_timeout: config.vast_load_timeout(),
            media_load_timeout: policy.media_load_timeout(config.media_load_timeout()),
            tx,
            token: CancellationToken::new(),
        };

        let mut manager = Self {
            breaks,
            active: None,
            ctx,
            policy,
            rx,
            configured_media_timeout: config.media_load_timeout(),
            content_duration: None,
            last_position: None,
            last_ad_progress: None,
            all_ads_completed: false,
            destroyed: false,
        };
        manager.sort_breaks();
        manager
    }

    pub fn with_policy(mut self, policy: Box<dyn AdSchedulingPolicy>) -> Self {
        log::debug!("Scheduling with the {} policy", policy.name());
        self.ctx.media_load_timeout = policy.media_load_timeout(self.configured_media_timeout);
        self.policy = policy;
        self
    }

    pub fn with_companions(mut self, slots: Vec<CompanionSlot>, renderer: Arc<dyn CompanionRenderer>) -> Self {
        self.ctx.companions = Some(CompanionSetup { slots, renderer });
        self
    }

    /// Publish on an existing bus instead of a private one
    pub fn with_event_bus(mut self, bus: EventBus) -> Self {
        self.ctx.bus = bus;
        self
    }

    /// Apply session settings. Returns where content playback should begin.
    pub fn init(&mut self, settings: AdsRenderingSettings) -> Duration {
        self.ctx.selector = MediaRenditionSelector::new(&settings.mime_types, settings.bitrate_kbps);
        self.configured_media_timeout = settings.media_load_timeout;
        self.ctx.media_load_timeout = self.policy.media_load_timeout(settings.media_load_timeout);

        let duration = self.content_duration;
        if let Some(after) = settings.play_ads_after_time {
            let before = self.breaks.len();
            self.breaks
                .retain(|b| b.offset.is_post_roll() || b.start(duration).is_none_or(|start| start >= after));
            log::info!("Dropped {} ad breaks before {:?}", before - self.breaks.len(), after);
        }

        self.policy.schedule(&mut self.breaks, duration);
        self.sort_breaks();

        let mut pod_index = 1;
        for ad_break in &mut self.breaks {
            ad_break.pod_index = match ad_break.offset {
                BreakOffset::PreRoll => PRE_ROLL_POD_INDEX,
                BreakOffset::PostRoll => POST_ROLL_POD_INDEX,
                _ => {
                    pod_index += 1;
                    pod_index - 1
                }
            };
            ad_break.refresh_ads(duration);
        }
        settings.play_ads_after_time.unwrap_or_default()
    }

    pub fn breaks(&self) -> &[AdBreak] {
        &self.breaks
    }

    pub fn ad_cue_points(&self) -> Vec<f64> {
        self.policy.cue_points(&self.breaks, self.content_duration)
    }

    pub fn has_unplayed_ads(&self) -> bool {
        self.breaks.iter().any(|b| b.has_unplayed_ads)
    }

    pub fn current_ad(&self) -> Option<Arc<Ad>> {
        self.active
            .as_ref()
            .and_then(|a| a.current_ad())
            .map(|ad| Arc::clone(ad.ad()))
    }

    pub fn active_break(&self) -> Option<&ActiveAdBreak> {
        self.active.as_ref()
    }

    pub fn ad_progress(&self) -> Option<VideoProgressUpdate> {
        self.last_ad_progress
    }

    pub fn content_position(&self) -> Option<ContentPosition> {
        self.last_position
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.ctx.bus
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AdEvent> {
        self.ctx.bus.subscribe()
    }

    /// Handle the host player reports through
    pub fn callbacks(&self) -> PlayerCallbacks {
        PlayerCallbacks::new(self.ctx.tx.clone())
    }

    /// Token cancelled when the manager is destroyed
    pub fn cancellation_token(&self) -> CancellationToken {
        self.ctx.token.clone()
    }

    fn sort_breaks(&mut self) {
        let duration = self.content_duration;
        self.breaks.sort_by_key(|b| b.offset.sort_key(duration));
    }

    /// Whether `position` comes before `ad_break` is due. The end of the
    /// content is at the post-roll and after everything else.
    fn is_before(&self, position: ContentPosition, ad_break: &AdBreak) -> bool {
        let ContentPosition::Millis(ms) = position else {
            return false;
        };
        match ad_break.start(self.content_duration) {
            None => true,
            Some(start) => u128::from(ms) + self.policy.preload_offset().as_millis() < start.as_millis(),
        }
    }

    /// Latest break not after `position`, if it still has ads to play
    fn next_break(&self, position: ContentPosition) -> Option<usize> {
        let mut index = self.breaks.len();
        while index > 0 && self.is_before(position, &self.breaks[index - 1]) {
            index -= 1;
        }
        let index = index.checked_sub(1)?;
        self.breaks[index].has_unplayed_ads.then_some(index)
    }

    fn with_active<R>(&mut self, f: impl FnOnce(&mut ActiveAdBreak, &mut AdBreak, &BreakContext) -> R) -> Option<R> {
        let active = self.active.as_mut()?;
        let ad_break = self.breaks.iter_mut().find(|b| b.id == active.break_id())?;
        Some(f(active, ad_break, &self.ctx))
    }

    pub fn on_content_progress(&mut self, position: ContentPosition, duration: Option<Duration>) {
        if self.destroyed {
            return;
        }
        if let Some(duration) = duration.filter(|d| !d.is_zero()) {
            if self.content_duration != Some(duration) {
                self.content_duration = Some(duration);
                for ad_break in &mut self.breaks {
                    ad_break.refresh_ads(Some(duration));
                }
                self.sort_breaks();
            }
        }

        let position = self.policy.content_position(position);
        self.last_position = Some(position);
        if self.active.as_ref().is_some_and(|a| a.is_content_paused()) {
            return;
        }

        if let Some(index) = self.next_break(position) {
            let due = self.breaks[index].id.clone();
            if self.active.as_ref().map(|a| a.break_id()) != Some(due.as_str()) {
                if let Some(previous) = self.active.take() {
                    previous.deactivate(&self.ctx);
                }
                self.active = Some(ActiveAdBreak::activate(
                    &mut self.breaks[index],
                    self.content_duration,
                    &self.ctx,
                ));
            }
        }

        self.with_active(|active, _, ctx| active.on_content_progress(position, ctx));
        self.check_all_ads_completed();
    }

    pub fn handle_player_event(&mut self, event: PlayerEvent) {
        if self.destroyed {
            return;
        }
        match event {
            PlayerEvent::ContentProgress { position, duration } => {
                self.on_content_progress(position, duration);
                return;
            }
            PlayerEvent::Loaded(media) => {
                self.with_active(|active, _, ctx| active.on_ad_loaded(&media, ctx));
            }
            PlayerEvent::Progress(media, progress) => {
                self.last_ad_progress = Some(progress);
                self.with_active(|active, ad_break, ctx| active.on_ad_progress(&media, progress, ad_break, ctx));
            }
            PlayerEvent::Paused(media) => {
                self.with_active(|active, _, ctx| active.on_ad_paused(&media, ctx));
            }
            PlayerEvent::Resumed(media) => {
                self.with_active(|active, _, ctx| active.on_ad_resumed(&media, ctx));
            }
            PlayerEvent::Buffering(media) => {
                self.with_active(|active, _, ctx| active.on_ad_buffering(&media, ctx));
            }
            PlayerEvent::Ended(media) => {
                self.with_active(|active, ad_break, ctx| active.on_ad_ended(&media, ad_break, ctx));
            }
            PlayerEvent::Error(media, message) => {
                let error = VastError::PlaybackError(message);
                self.with_active(|active, ad_break, ctx| active.on_ad_error(&media, error, ad_break, ctx));
            }
        }
        self.check_all_ads_completed();
    }

    fn handle(&mut self, message: EngineMessage) {
        match message {
            EngineMessage::Player(event) => self.handle_player_event(event),
            EngineMessage::MediaLoadTimeout(media) => {
                self.with_active(|active, ad_break, ctx| active.on_media_timeout(&media, ad_break, ctx));
                self.check_all_ads_completed();
            }
            EngineMessage::BreakLoaded { break_id, outcome } => {
                self.on_break_loaded(&break_id, outcome);
                self.check_all_ads_completed();
            }
        }
    }

    fn on_break_loaded(&mut self, break_id: &str, outcome: LoadOutcome) {
        let duration = self.content_duration;
        if self.active.as_ref().is_some_and(|a| a.break_id() == break_id) {
            self.with_active(|active, ad_break, ctx| active.on_break_loaded(outcome, ad_break, duration, ctx));
            return;
        }
        // Resolved after its break was deactivated: keep what was fetched
        if let Some(ad_break) = self.breaks.iter_mut().find(|b| b.id == break_id) {
            let (LoadOutcome::Loaded(resolved) | LoadOutcome::Failed { ad_break: resolved, .. }) = outcome;
            ad_break.sources = resolved.sources;
            ad_break.refresh_ads(duration);
        }
    }

    fn check_all_ads_completed(&mut self) {
        if self.all_ads_completed || self.destroyed || self.has_unplayed_ads() {
            return;
        }
        if self.active.as_ref().is_some_and(|a| !a.is_ended()) {
            return;
        }
        self.all_ads_completed = true;
        log::info!("All ads completed");
        self.ctx.bus.publish(AdEvent::new(AdEventType::AllAdsCompleted));
    }

    /// Wait for the next message and handle it. Returns `false` once the
    /// manager is destroyed.
    pub async fn next_message(&mut self) -> bool {
        if self.destroyed {
            return false;
        }
        let message = tokio::select! {
            _ = self.ctx.token.cancelled() => return false,
            message = self.rx.recv() => message,
        };
        match message {
            Some(message) => {
                self.handle(message);
                true
            }
            None => false,
        }
    }

    /// Handle every message already queued, returning how many there were
    pub fn process_pending(&mut self) -> usize {
        let mut handled = 0;
        while !self.destroyed {
            let Ok(message) = self.rx.try_recv() else {
                break;
            };
            self.handle(message);
            handled += 1;
        }
        handled
    }

    /// Drive the manager until it is destroyed
    pub async fn run(mut self) {
        while self.next_message().await {}
    }

    pub fn pause(&mut self) {
        if let Some(active) = &self.active {
            active.pause(&self.ctx);
        }
    }

    pub fn resume(&mut self) {
        if let Some(active) = &self.active {
            active.resume(&self.ctx);
        }
    }

    /// Skip the ad on screen
    pub fn skip_ad(&mut self) -> bool {
        let skipped = self
            .with_active(|active, ad_break, ctx| active.skip(ad_break, ctx))
            .unwrap_or(false);
        self.check_all_ads_completed();
        skipped
    }

    /// Report a click on the ad on screen, returning its click-through URL
    pub fn click(&self) -> Option<String> {
        self.active.as_ref().and_then(|active| active.click(&self.ctx))
    }

    /// Stop everything: timers, loads, and the active break
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        log::debug!("Destroying ads manager");
        self.destroyed = true;
        self.ctx.token.cancel();
        if let Some(active) = self.active.take() {
            active.deactivate(&self.ctx);
        }
        self.breaks.clear();
        self.ctx.loader.release_all();
        self.ctx.player.release();
    }
}

impl Drop for AdsManager {
    fn drop(&mut self) {
        self.ctx.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ad_break::AdSource;
    use crate::fetch::AdTagFetcher;
    use crate::player::AdMediaInfo;
    use crate::vmap::parse_ad_response;
    use async_trait::async_trait;
    use std::sync::Mutex;

    const VMAP: &str = r#"<vmap:VMAP xmlns:vmap="http://www.iab.net/videosuite/vmap" version="1.0">
      <vmap:AdBreak timeOffset="start" breakType="linear" breakId="pre">
        <vmap:AdSource id="pre-src"><vmap:VASTAdData>
          <VAST version="3.0"><Ad id="p1"><InLine><AdSystem>t</AdSystem><AdTitle>pre</AdTitle>
            <Impression>https://t.example/pre</Impression>
            <Creatives><Creative><Linear><Duration>00:00:10</Duration><MediaFiles>
              <MediaFile delivery="progressive" type="video/mp4" bitrate="500" width="640" height="360">https://cdn.example/pre.mp4</MediaFile>
            </MediaFiles></Linear></Creative></Creatives></InLine></Ad></VAST>
        </vmap:VASTAdData></vmap:AdSource>
      </vmap:AdBreak>
      <vmap:AdBreak timeOffset="00:01:00.000" breakType="linear" breakId="mid">
        <vmap:AdSource id="mid-src"><vmap:VASTAdData>
          <VAST version="3.0"><Ad id="m1"><InLine><AdSystem>t</AdSystem><AdTitle>mid</AdTitle>
            <Creatives><Creative><Linear><Duration>00:00:10</Duration><MediaFiles>
              <MediaFile delivery="progressive" type="video/mp4" bitrate="500" width="640" height="360">https://cdn.example/mid.mp4</MediaFile>
            </MediaFiles></Linear></Creative></Creatives></InLine></Ad></VAST>
        </vmap:VASTAdData></vmap:AdSource>
      </vmap:AdBreak>
      <vmap:AdBreak timeOffset="end" breakType="linear" breakId="post">
        <vmap:AdSource id="post-src"><vmap:VASTAdData>
          <VAST version="3.0"><Ad id="q1"><InLine><AdSystem>t</AdSystem><AdTitle>post</AdTitle>
            <Creatives><Creative><Linear><Duration>00:00:10</Duration><MediaFiles>
              <MediaFile delivery="progressive" type="video/mp4" bitrate="500" width="640" height="360">https://cdn.example/post.mp4</MediaFile>
            </MediaFiles></Linear></Creative></Creatives></InLine></Ad></VAST>
        </vmap:VASTAdData></vmap:AdSource>
      </vmap:AdBreak>
    </vmap:VMAP>"#;

    #[derive(Default)]
    struct RecordingPlayer {
        calls: Mutex<Vec<String>>,
    }

    impl RecordingPlayer {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl VideoAdPlayer for RecordingPlayer {
        fn load_ad(&self, media: &AdMediaInfo, _pod_info: &crate::ad_break::AdPodInfo) {
            self.calls.lock().unwrap().push(format!("load {}", media.url));
        }
        fn play_ad(&self, media: &AdMediaInfo) {
            self.calls.lock().unwrap().push(format!("play {}", media.url));
        }
        fn pause_ad(&self, media: &AdMediaInfo) {
            self.calls.lock().unwrap().push(format!("pause {}", media.url));
        }
        fn stop_ad(&self, media: &AdMediaInfo) {
            self.calls.lock().unwrap().push(format!("stop {}", media.url));
        }
    }

    struct NoFetch;

    #[async_trait]
    impl AdTagFetcher for NoFetch {
        async fn fetch(&self, _url: &str) -> crate::error::Result<String> {
            Err(VastError::HttpStatus(404))
        }
    }

    fn manager(player: Arc<RecordingPlayer>) -> AdsManager {
        let breaks = parse_ad_response(VMAP).unwrap().ad_breaks;
        let loader = AdBreakLoader::new(Arc::new(NoFetch), 4);
        AdsManager::new(breaks, player, loader, &EngineConfig::default())
    }

    fn drain(rx: &mut broadcast::Receiver<AdEvent>) -> Vec<AdEventType> {
        std::iter::from_fn(|| rx.try_recv().ok()).map(|e| e.kind).collect()
    }

    fn media(url: &str, uid: &str) -> AdMediaInfo {
        AdMediaInfo {
            ad_uid: uid.into(),
            url: url.into(),
        }
    }

    #[tokio::test]
    async fn pre_roll_holds_content_while_playing() {
        let player = Arc::new(RecordingPlayer::default());
        let mut manager = manager(player.clone());
        manager.init(AdsRenderingSettings::default());

        manager.on_content_progress(ContentPosition::Millis(0), None);
        assert_eq!(manager.active_break().map(|a| a.break_id()), Some("pre"));
        assert_eq!(player.calls(), ["load https://cdn.example/pre.mp4", "play https://cdn.example/pre.mp4"]);

        // Content updates are ignored while the pre-roll has content paused
        manager.on_content_progress(ContentPosition::Millis(57_000), None);
        assert_eq!(manager.active_break().map(|a| a.break_id()), Some("pre"));
    }

    #[tokio::test]
    async fn mid_roll_is_preloaded_then_played() {
        let player = Arc::new(RecordingPlayer::default());
        let mut manager = manager(player.clone());
        manager.init(AdsRenderingSettings {
            play_ads_after_time: Some(Duration::from_secs(1)),
            ..AdsRenderingSettings::default()
        });
        assert_eq!(manager.breaks().len(), 2);
        assert_eq!(manager.breaks()[0].pod_index, 1);
        assert_eq!(manager.ad_cue_points(), [60.0, -1.0]);

        manager.on_content_progress(ContentPosition::Millis(50_000), None);
        assert!(manager.active_break().is_none());

        manager.on_content_progress(ContentPosition::Millis(56_500), None);
        assert_eq!(manager.active_break().map(|a| a.break_id()), Some("mid"));
        assert_eq!(player.calls(), ["load https://cdn.example/mid.mp4"]);

        manager.on_content_progress(ContentPosition::Millis(60_000), None);
        assert_eq!(player.calls().last().map(String::as_str), Some("play https://cdn.example/mid.mp4"));
    }

    #[tokio::test]
    async fn played_breaks_are_not_reactivated() {
        let player = Arc::new(RecordingPlayer::default());
        let mut manager = manager(player.clone());
        let mut rx = manager.subscribe();
        manager.init(AdsRenderingSettings::default());

        manager.on_content_progress(ContentPosition::Millis(0), None);
        let pre = media("https://cdn.example/pre.mp4", "0.0");
        manager.handle_player_event(PlayerEvent::Progress(pre.clone(), VideoProgressUpdate::from_millis(1_000, 10_000)));
        manager.handle_player_event(PlayerEvent::Ended(pre));
        assert!(!manager.breaks()[0].has_unplayed_ads);

        let events = drain(&mut rx);
        assert!(events.contains(&AdEventType::AdBreakEnded));
        assert_eq!(events.last(), Some(&AdEventType::ContentResumeRequested));

        let calls_before = player.calls().len();
        manager.on_content_progress(ContentPosition::Millis(0), None);
        manager.on_content_progress(ContentPosition::Millis(1_000), None);
        assert_eq!(player.calls().len(), calls_before);
        assert!(!drain(&mut rx).contains(&AdEventType::AllAdsCompleted));
    }

    #[tokio::test]
    async fn fetch_failure_resumes_content() {
        let player = Arc::new(RecordingPlayer::default());
        let mut ad_break = AdBreak::new("pre", BreakOffset::PreRoll);
        ad_break.sources.push(AdSource {
            id: "1".into(),
            allow_multiple_ads: true,
            follow_redirects: true,
            ad_tag_uri: Some("https://ads.example/missing".into()),
            vast: None,
        });
        ad_break.refresh_ads(None);
        let loader = AdBreakLoader::new(Arc::new(NoFetch), 4);
        let mut manager = AdsManager::new(vec![ad_break], player.clone(), loader, &EngineConfig::default());
        let mut rx = manager.subscribe();

        manager.on_content_progress(ContentPosition::Millis(0), None);
        assert!(manager.next_message().await);

        let events = drain(&mut rx);
        assert_eq!(
            events,
            [
                AdEventType::Log,
                AdEventType::AdBreakFetchError,
                AdEventType::ContentResumeRequested,
                AdEventType::AllAdsCompleted,
            ]
        );
        assert!(player.calls().is_empty());
    }

    #[tokio::test]
    async fn destroy_stops_the_message_loop() {
        let player = Arc::new(RecordingPlayer::default());
        let mut manager = manager(player);
        manager.destroy();
        assert!(!manager.next_message().await);
        assert!(manager.breaks().is_empty());
    }
}

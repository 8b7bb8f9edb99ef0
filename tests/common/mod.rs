#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use vast_ad_engine::ad_break::AdPodInfo;
use vast_ad_engine::fetch::AdTagFetcher;
use vast_ad_engine::{AdEvent, AdEventType, AdMediaInfo, AdsManager, VastError, VideoAdPlayer};

pub const VMAP_PRE_POST: &str = include_str!("../fixtures/vmap_pre_post.xml");
pub const VMAP_REDIRECT: &str = include_str!("../fixtures/vmap_redirect.xml");
pub const VMAP_REDIRECT_MID: &str = include_str!("../fixtures/vmap_redirect_mid.xml");
pub const POD: &str = include_str!("../fixtures/pod.xml");
pub const WRAPPER: &str = include_str!("../fixtures/wrapper.xml");
pub const EMPTY: &str = include_str!("../fixtures/empty.xml");

/// A wrapper document pointing at `next`
pub fn wrapper_to(next: &str) -> String {
    WRAPPER.replace("{NEXT}", next)
}

/// Serves canned bodies by URL and counts what was asked for
#[derive(Default)]
pub struct MockFetcher {
    bodies: Mutex<HashMap<String, String>>,
    delay: Option<Duration>,
    fetches: AtomicUsize,
    pings: Mutex<Vec<String>>,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn serve(self, url: &str, body: impl Into<String>) -> Self {
        self.bodies.lock().unwrap().insert(url.to_string(), body.into());
        self
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn pinged(&self) -> Vec<String> {
        self.pings.lock().unwrap().clone()
    }
}

#[async_trait]
impl AdTagFetcher for MockFetcher {
    async fn fetch(&self, url: &str) -> Result<String, VastError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.bodies.lock().unwrap().get(url).cloned().ok_or(VastError::HttpStatus(404))
    }

    async fn ping(&self, url: &str) -> Result<(), VastError> {
        self.pings.lock().unwrap().push(url.to_string());
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayerCall {
    Load(String),
    Play(String),
    Pause(String),
    Stop(String),
}

/// Remembers every directive it gets and plays nothing
#[derive(Default)]
pub struct RecordingPlayer {
    calls: Mutex<Vec<PlayerCall>>,
}

impl RecordingPlayer {
    pub fn calls(&self) -> Vec<PlayerCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn loads(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                PlayerCall::Load(url) => Some(url),
                _ => None,
            })
            .collect()
    }

    pub fn plays(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                PlayerCall::Play(url) => Some(url),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: PlayerCall) {
        self.calls.lock().unwrap().push(call);
    }
}

impl VideoAdPlayer for RecordingPlayer {
    fn load_ad(&self, media: &AdMediaInfo, _pod_info: &AdPodInfo) {
        self.record(PlayerCall::Load(media.url.clone()));
    }

    fn play_ad(&self, media: &AdMediaInfo) {
        self.record(PlayerCall::Play(media.url.clone()));
    }

    fn pause_ad(&self, media: &AdMediaInfo) {
        self.record(PlayerCall::Pause(media.url.clone()));
    }

    fn stop_ad(&self, media: &AdMediaInfo) {
        self.record(PlayerCall::Stop(media.url.clone()));
    }
}

/// Media of the ad currently on screen
pub fn current_media(manager: &AdsManager) -> Option<AdMediaInfo> {
    manager
        .active_break()
        .and_then(|b| b.current_ad())
        .map(|ad| ad.media().clone())
}

pub fn drain(rx: &mut broadcast::Receiver<AdEvent>) -> Vec<AdEvent> {
    std::iter::from_fn(|| rx.try_recv().ok()).collect()
}

pub fn kinds(events: &[AdEvent]) -> Vec<AdEventType> {
    events.iter().map(|e| e.kind).collect()
}

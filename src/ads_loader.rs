//! Entry point for hosts: turn an ad request into a ready [`AdsManager`].

use std::sync::Arc;

use crate::config::EngineConfig;
use crate::error::{Result, VastError};
use crate::fetch::{AdTagFetcher, HttpFetcher};
use crate::loader::AdBreakLoader;
use crate::manager::AdsManager;
use crate::player::VideoAdPlayer;
use crate::tracking::TrackingHandler;
use crate::vmap::parse_ad_response;

/// What the host asks ads for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdsRequest {
    /// VMAP or VAST served from this URL (or local path)
    AdTagUrl(String),
    /// A response the host already has in hand
    AdsResponse(String),
}

pub struct AdsLoader {
    config: EngineConfig,
    fetcher: Arc<dyn AdTagFetcher>,
}

impl AdsLoader {
    /// Loader fetching over HTTP with the configured timeout and user agent
    pub fn new(config: EngineConfig) -> Result<Self> {
        let fetcher = HttpFetcher::new(config.http_timeout(), &config.user_agent)?;
        Ok(Self::with_fetcher(config, Arc::new(fetcher)))
    }

    pub fn with_fetcher(config: EngineConfig, fetcher: Arc<dyn AdTagFetcher>) -> Self {
        Self { config, fetcher }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Fetch and parse the ad response, then build and initialise a manager
    /// for it. Tracking pixels fire on a background task until the manager
    /// is destroyed.
    pub async fn request_ads(&self, request: AdsRequest, player: Arc<dyn VideoAdPlayer>) -> Result<AdsManager> {
        let body = match request {
            AdsRequest::AdsResponse(body) => body,
            AdsRequest::AdTagUrl(url) => {
                let timeout = self.config.vast_load_timeout();
                log::info!("Requesting ads from {}", url);
                tokio::time::timeout(timeout, self.fetcher.fetch(&url))
                    .await
                    .map_err(|_| VastError::LoadTimeout(timeout))??
            }
        };

        let document = parse_ad_response(&body)?;
        log::info!("Ad response has {} ad breaks", document.ad_breaks.len());

        let loader = AdBreakLoader::new(Arc::clone(&self.fetcher), self.config.max_redirects);
        let mut manager = AdsManager::new(document.ad_breaks, player, loader, &self.config);
        if self.config.tracking {
            let _tracking =
                TrackingHandler::new(Arc::clone(&self.fetcher)).spawn(manager.event_bus(), manager.cancellation_token());
        }
        manager.init(self.config.rendering_settings());
        Ok(manager)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ad_break::AdPodInfo;
    use crate::player::AdMediaInfo;
    use async_trait::async_trait;
    use std::time::Duration;

    struct SilentPlayer;

    impl VideoAdPlayer for SilentPlayer {
        fn load_ad(&self, _media: &AdMediaInfo, _pod_info: &AdPodInfo) {}
        fn play_ad(&self, _media: &AdMediaInfo) {}
        fn pause_ad(&self, _media: &AdMediaInfo) {}
        fn stop_ad(&self, _media: &AdMediaInfo) {}
    }

    struct StalledFetcher;

    #[async_trait]
    impl AdTagFetcher for StalledFetcher {
        async fn fetch(&self, _url: &str) -> Result<String> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn bare_vast_becomes_a_pre_roll() {
        let loader = AdsLoader::with_fetcher(
            EngineConfig {
                tracking: false,
                ..EngineConfig::default()
            },
            Arc::new(StalledFetcher),
        );
        let manager = loader
            .request_ads(
                AdsRequest::AdsResponse(r#"<VAST version="3.0"/>"#.into()),
                Arc::new(SilentPlayer),
            )
            .await
            .unwrap();
        assert_eq!(manager.breaks().len(), 1);
        assert_eq!(manager.ad_cue_points(), [0.0]);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_ad_tag_times_out() {
        let config = EngineConfig {
            vast_load_timeout_ms: 500,
            ..EngineConfig::default()
        };
        let loader = AdsLoader::with_fetcher(config, Arc::new(StalledFetcher));
        let err = loader
            .request_ads(AdsRequest::AdTagUrl("https://ads.example/slow".into()), Arc::new(SilentPlayer))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, VastError::LoadTimeout(t) if t == Duration::from_millis(500)));
    }
}

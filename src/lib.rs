pub mod error;
pub(crate) mod xml;
pub mod timecode;
pub mod models;
pub mod tracking;
pub mod parser;
pub mod ad_break;
pub mod vmap;
pub mod fetch;
pub mod loader;
pub mod media;
pub mod companion;
pub mod events;
pub mod player;
pub mod active_ad;
pub mod active_break;
pub mod policy;
pub mod config;
pub mod manager;
pub mod ads_loader;

pub use ad_break::{Ad, AdBreak, AdPodInfo, BreakOffset};
pub use ads_loader::{AdsLoader, AdsRequest};
pub use config::{AdsRenderingSettings, EngineConfig};
pub use error::{AdErrorCode, AdErrorInfo, Result, VastError};
pub use events::{AdEvent, AdEventType, EventBus};
pub use manager::AdsManager;
pub use player::{AdMediaInfo, ContentPosition, PlayerCallbacks, VideoAdPlayer, VideoProgressUpdate};

pub mod async_api {
    use std::sync::Arc;
    use std::time::Duration;

    use crate::ad_break::AdBreak;
    use crate::error::{Result, VastError};
    use crate::fetch::AdTagFetcher;
    use crate::loader::{AdBreakLoader, LoadOutcome};
    use crate::vmap::{parse_ad_response, VmapDocument};

    /// Fetch an ad tag and parse it as VMAP or bare VAST
    pub async fn fetch_ad_response(fetcher: &dyn AdTagFetcher, url: &str) -> Result<VmapDocument> {
        let body = fetcher.fetch(url).await?;
        parse_ad_response(&body)
    }

    /// Resolve every pending redirect of every break, one break at a time.
    ///
    /// Each break comes back with the error that stopped its resolution, if any.
    pub async fn resolve_ad_breaks(
        fetcher: Arc<dyn AdTagFetcher>,
        breaks: Vec<AdBreak>,
        max_redirects: usize,
        timeout: Duration,
    ) -> Vec<(AdBreak, Option<VastError>)> {
        let loader = AdBreakLoader::new(fetcher, max_redirects);
        let mut resolved = Vec::with_capacity(breaks.len());

        for mut ad_break in breaks {
            let mut error = None;
            while let Some(outcome) = loader.resolve(ad_break.clone(), timeout).await {
                ad_break = match outcome {
                    LoadOutcome::Loaded(ad_break) => ad_break,
                    LoadOutcome::Failed { ad_break, error: e } => {
                        error = Some(e);
                        ad_break
                    }
                };
            }
            resolved.push((ad_break, error));
        }
        resolved
    }
}

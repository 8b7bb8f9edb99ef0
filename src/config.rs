//! Engine configuration.
//!
//! [`EngineConfig`] is read from TOML; every field has a default so an empty
//! file is valid. [`AdsRenderingSettings`] is what a host hands to
//! `AdsManager::init` for one playback session.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::loader::DEFAULT_MAX_REDIRECTS;
use crate::media::default_mime_types;
use crate::policy::{ProximityTieBreak, DEFAULT_PRELOAD_OFFSET};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Redirect hops allowed per chain, at least 1
    pub max_redirects: usize,
    pub vast_load_timeout_ms: u64,
    pub media_load_timeout_ms: u64,
    pub preload_offset_ms: u64,
    pub http_timeout_ms: u64,
    /// Target bitrate for rendition selection. Unset uses the selector default.
    pub bitrate_kbps: Option<u32>,
    pub mime_types: Vec<String>,
    pub play_ads_after_time_secs: Option<f64>,
    pub user_agent: String,
    /// Fire tracking pixels for lifecycle events
    pub tracking: bool,
    pub watch_time: Option<WatchTimeConfig>,
    pub debug: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_redirects: DEFAULT_MAX_REDIRECTS,
            vast_load_timeout_ms: 4000,
            media_load_timeout_ms: 8000,
            preload_offset_ms: DEFAULT_PRELOAD_OFFSET.as_millis() as u64,
            http_timeout_ms: 8000,
            bitrate_kbps: None,
            mime_types: default_mime_types(),
            play_ads_after_time_secs: None,
            user_agent: concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")).to_string(),
            tracking: true,
            watch_time: None,
            debug: false,
        }
    }
}

/// Settings for scheduling on watch time instead of content time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchTimeConfig {
    pub content_duration_secs: u64,
    pub interval_secs: u64,
    pub threshold_ms: u64,
    pub tie_break: ProximityTieBreak,
}

impl Default for WatchTimeConfig {
    fn default() -> Self {
        Self {
            content_duration_secs: 0,
            interval_secs: 10,
            threshold_ms: 8000,
            tie_break: ProximityTieBreak::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_toml(contents: &str) -> Result<Self> {
        let mut config: EngineConfig = toml::from_str(contents)?;
        config.max_redirects = config.max_redirects.max(1);
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config = Self::from_toml(&contents)?;
        log::debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn vast_load_timeout(&self) -> Duration {
        Duration::from_millis(self.vast_load_timeout_ms)
    }

    pub fn media_load_timeout(&self) -> Duration {
        Duration::from_millis(self.media_load_timeout_ms)
    }

    pub fn preload_offset(&self) -> Duration {
        Duration::from_millis(self.preload_offset_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }

    pub fn rendering_settings(&self) -> AdsRenderingSettings {
        AdsRenderingSettings {
            play_ads_after_time: self
                .play_ads_after_time_secs
                .filter(|s| s.is_finite() && *s > 0.0)
                .map(Duration::from_secs_f64),
            mime_types: self.mime_types.clone(),
            bitrate_kbps: self.bitrate_kbps,
            media_load_timeout: self.media_load_timeout(),
        }
    }
}

/// Per-session settings applied by `AdsManager::init`
#[derive(Debug, Clone, PartialEq)]
pub struct AdsRenderingSettings {
    /// Breaks before this point are dropped, the post-roll excepted
    pub play_ads_after_time: Option<Duration>,
    pub mime_types: Vec<String>,
    pub bitrate_kbps: Option<u32>,
    pub media_load_timeout: Duration,
}

impl Default for AdsRenderingSettings {
    fn default() -> Self {
        EngineConfig::default().rendering_settings()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config = EngineConfig::from_toml("").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.max_redirects, 4);
        assert_eq!(config.vast_load_timeout(), Duration::from_secs(4));
        assert_eq!(config.media_load_timeout(), Duration::from_secs(8));
        assert!(config.mime_types.iter().any(|m| m == "video/mp4"));
    }

    #[test]
    fn overrides_and_clamping() {
        let config = EngineConfig::from_toml(
            r#"
            max_redirects = 0
            bitrate_kbps = 700
            play_ads_after_time_secs = 30.0

            [watch_time]
            content_duration_secs = 600
            tie_break = "prefer_synthetic"
            "#,
        )
        .unwrap();
        assert_eq!(config.max_redirects, 1);
        assert_eq!(config.bitrate_kbps, Some(700));
        let watch_time = config.watch_time.as_ref().unwrap();
        assert_eq!(watch_time.tie_break, ProximityTieBreak::PreferSynthetic);
        assert_eq!(watch_time.interval_secs, 10);
        assert_eq!(config.rendering_settings().play_ads_after_time, Some(Duration::from_secs(30)));
    }

    #[test]
    fn bad_toml_is_a_config_error() {
        let err = EngineConfig::from_toml("max_redirects = \"many\"").unwrap_err();
        assert!(matches!(err, crate::error::VastError::Config(_)));
    }
}

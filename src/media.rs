//! Choice of the media rendition to play for an ad.

use crate::error::{Result, VastError};
use crate::models::{Delivery, MediaFile};

/// Target bitrate used when none is configured
pub const DEFAULT_TARGET_BITRATE_KBPS: u32 = 7000;

/// Mime types ranked from most to least adaptive
pub const MIME_PRIORITY: &[&str] = &[
    "application/x-mpegurl",
    "application/vnd.apple.mpegurl",
    "application/dash+xml",
    "video/mp4",
    "video/webm",
    "video/3gpp",
];

/// Mime types accepted when the host does not say otherwise
pub fn default_mime_types() -> Vec<String> {
    MIME_PRIORITY.iter().map(|m| m.to_string()).collect()
}

#[derive(Debug, Clone)]
pub struct MediaRenditionSelector {
    allowed: Vec<String>,
    target_bitrate: u32,
}

impl MediaRenditionSelector {
    /// An empty `allowed_mime_types` falls back to [`default_mime_types`];
    /// a missing or zero bitrate falls back to [`DEFAULT_TARGET_BITRATE_KBPS`].
    pub fn new(allowed_mime_types: &[String], target_bitrate_kbps: Option<u32>) -> Self {
        let allowed = if allowed_mime_types.is_empty() {
            default_mime_types()
        } else {
            allowed_mime_types.iter().map(|m| m.to_ascii_lowercase()).collect()
        };
        Self {
            allowed,
            target_bitrate: target_bitrate_kbps
                .filter(|b| *b > 0)
                .unwrap_or(DEFAULT_TARGET_BITRATE_KBPS),
        }
    }

    pub fn target_bitrate(&self) -> u32 {
        self.target_bitrate
    }

    /// Pick one rendition.
    ///
    /// Streaming renditions are tried before progressive ones. Within a
    /// delivery group the highest bitrate not above the target wins. Mime
    /// priority only breaks ties between equal bitrates, so a 5033 kbps webm
    /// beats a 2000 kbps mp4 of the same delivery under a 5500 kbps target. With nothing under the target the lowest bitrate overall is
    /// used.
    pub fn select<'a>(&self, candidates: &'a [MediaFile]) -> Result<&'a MediaFile> {
        let allowed: Vec<&'a MediaFile> = candidates
            .iter()
            .filter(|m| self.rank(&m.mime_type).is_some())
            .collect();
        if allowed.is_empty() {
            log::debug!("No rendition among {} candidates matches {:?}", candidates.len(), self.allowed);
            return Err(VastError::NoSuitableMedia);
        }

        for delivery in [Delivery::Streaming, Delivery::Progressive] {
            let group: Vec<&'a MediaFile> = allowed.iter().copied().filter(|m| m.delivery == delivery).collect();
            if let Some(found) = self.floor(&group) {
                log::debug!(
                    "Selected {} ({:?}, {} kbps, target {} kbps)",
                    found.url,
                    delivery,
                    bitrate(found),
                    self.target_bitrate
                );
                return Ok(found);
            }
        }

        // Everything is above the target: take the cheapest
        allowed
            .iter()
            .copied()
            .min_by_key(|m| (bitrate(m), self.rank(&m.mime_type)))
            .ok_or(VastError::NoSuitableMedia)
    }

    fn floor<'a>(&self, group: &[&'a MediaFile]) -> Option<&'a MediaFile> {
        group
            .iter()
            .copied()
            .filter(|m| bitrate(m) <= self.target_bitrate)
            .max_by(|a, b| {
                bitrate(a)
                    .cmp(&bitrate(b))
                    .then_with(|| self.rank(&b.mime_type).cmp(&self.rank(&a.mime_type)))
            })
    }

    /// Lower is preferred. `None` when the mime type is not allowed.
    fn rank(&self, mime_type: &str) -> Option<usize> {
        let mime_type = mime_type.trim().to_ascii_lowercase();
        if mime_type.is_empty() {
            return Some(usize::MAX);
        }
        if !self.allowed.contains(&mime_type) {
            return None;
        }
        Some(
            MIME_PRIORITY
                .iter()
                .position(|m| *m == mime_type)
                .unwrap_or_else(|| MIME_PRIORITY.len() + self.allowed.iter().position(|m| *m == mime_type).unwrap_or(0)),
        )
    }
}

fn bitrate(media: &MediaFile) -> u32 {
    media.bitrate.unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn media(mime_type: &str, bitrate: u32, delivery: Delivery) -> MediaFile {
        MediaFile {
            url: format!("https://cdn.example/{bitrate}"),
            mime_type: mime_type.to_string(),
            delivery,
            bitrate: Some(bitrate),
            ..MediaFile::default()
        }
    }

    fn others() -> Vec<MediaFile> {
        vec![
            media("video/3gpp", 79, Delivery::Progressive),
            media("video/mp4", 675, Delivery::Progressive),
            media("video/webm", 5033, Delivery::Progressive),
            media("video/webm", 2456, Delivery::Progressive),
        ]
    }

    fn allowed() -> Vec<String> {
        ["video/mp4", "video/webm", "video/3gpp", "application/dash+xml", "application/x-mpegURL", "audio/mpeg"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    #[test]
    fn prefers_streaming_hls_at_default_bitrate() {
        let mut candidates = vec![
            media("application/dash+xml", 45, Delivery::Streaming),
            media("application/x-mpegURL", 45, Delivery::Streaming),
        ];
        candidates.extend(others());
        let selector = MediaRenditionSelector::new(&allowed(), Some(0));
        assert_eq!(selector.target_bitrate(), DEFAULT_TARGET_BITRATE_KBPS);
        assert_eq!(selector.select(&candidates).unwrap().mime_type, "application/x-mpegURL");
    }

    #[test]
    fn picks_the_nearest_bitrate_below_target() {
        let candidates = others();
        let at_700 = MediaRenditionSelector::new(&allowed(), Some(700)).select(&candidates).unwrap();
        assert_eq!(at_700.bitrate, Some(675));
        let at_5500 = MediaRenditionSelector::new(&allowed(), Some(5500)).select(&candidates).unwrap();
        assert_eq!(at_5500.bitrate, Some(5033));
    }

    #[test]
    fn bitrate_outranks_mime_priority() {
        let candidates = vec![
            media("video/mp4", 2000, Delivery::Progressive),
            media("video/webm", 5033, Delivery::Progressive),
            media("video/webm", 2000, Delivery::Progressive),
        ];
        let at_5500 = MediaRenditionSelector::new(&allowed(), Some(5500)).select(&candidates).unwrap();
        assert_eq!(at_5500.mime_type, "video/webm");
        let at_3000 = MediaRenditionSelector::new(&allowed(), Some(3000)).select(&candidates).unwrap();
        assert_eq!(at_3000.mime_type, "video/mp4");
    }

    #[test]
    fn falls_back_to_the_lowest_bitrate() {
        let candidates = others();
        let chosen = MediaRenditionSelector::new(&allowed(), Some(50)).select(&candidates).unwrap();
        assert_eq!(chosen.bitrate, Some(79));
    }

    #[test]
    fn fails_without_an_allowed_mime_type() {
        let selector = MediaRenditionSelector::new(&["audio/mpeg".to_string()], None);
        assert!(matches!(selector.select(&others()), Err(VastError::NoSuitableMedia)));
        assert!(matches!(selector.select(&[]), Err(VastError::NoSuitableMedia)));
    }
}

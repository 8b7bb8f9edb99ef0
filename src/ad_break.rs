//! Ad breaks, their sources, and the flattened list of playable ads.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, VastError};
use crate::models::{AdKind, CompanionCreative, InLine, LinearCreative, MediaFile, VastAd, VastDocument, Verification};
use crate::timecode::parse_clock;
use crate::tracking::{TrackingEvents, TrackingUrl};

/// Where in the content a break is inserted
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum BreakOffset {
    PreRoll,
    PostRoll,
    At(Duration),
    /// Fraction of the content duration, resolved once the duration is known
    Percent(f64),
}

impl BreakOffset {
    /// Parse a VMAP `timeOffset` value
    pub fn parse(value: &str) -> Result<Self> {
        let value = value.trim();
        match value {
            "start" => Ok(BreakOffset::PreRoll),
            "end" => Ok(BreakOffset::PostRoll),
            _ => match value.strip_suffix('%') {
                Some(percent) => percent
                    .trim()
                    .parse::<f64>()
                    .ok()
                    .filter(|p| (0.0..=100.0).contains(p))
                    .map(BreakOffset::Percent)
                    .ok_or_else(|| VastError::malformed(format!("invalid timeOffset '{value}'"))),
                None => parse_clock(value).map(BreakOffset::At),
            },
        }
    }

    pub fn is_post_roll(&self) -> bool {
        matches!(self, BreakOffset::PostRoll)
    }

    /// Start time in content, `None` for post-rolls and unresolvable percentages
    pub fn start(&self, content_duration: Option<Duration>) -> Option<Duration> {
        match *self {
            BreakOffset::PreRoll => Some(Duration::ZERO),
            BreakOffset::PostRoll => None,
            BreakOffset::At(at) => Some(at),
            BreakOffset::Percent(p) => {
                content_duration.map(|d| Duration::from_millis((d.as_millis() as f64 * p / 100.0) as u64))
            }
        }
    }

    /// Offset in seconds as reported in `AdPodInfo`, -1 for post-rolls
    pub fn seconds(&self, content_duration: Option<Duration>) -> f64 {
        match self.start(content_duration) {
            Some(start) => start.as_secs_f64(),
            None => -1.0,
        }
    }

    /// Ordering key: pre-rolls first, post-rolls last
    pub(crate) fn sort_key(&self, content_duration: Option<Duration>) -> u128 {
        match self {
            BreakOffset::PostRoll => u128::MAX,
            other => other.start(content_duration).map_or(u128::MAX - 1, |d| d.as_millis()),
        }
    }
}

/// Position of an ad within its break
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdPodInfo {
    /// 0 for pre-rolls, -1 for post-rolls, sequential from 1 otherwise
    pub pod_index: i32,
    /// 1-based position inside the pod
    pub position: usize,
    pub total_ads: usize,
    /// Break offset in seconds, -1 for post-rolls
    pub time_offset: f64,
    pub max_duration: Option<Duration>,
}

/// URLs an ad fires, its own plus those inherited from wrapper ancestors
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AdTracking {
    pub impressions: Vec<TrackingUrl>,
    pub errors: Vec<TrackingUrl>,
    pub events: TrackingEvents,
    pub clicks: Vec<TrackingUrl>,
}

/// Location of a node inside a break: source index, then ad indices down
/// through resolved wrapper documents.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AdPath(pub Vec<usize>);

impl AdPath {
    pub fn child(&self, index: usize) -> AdPath {
        let mut path = self.0.clone();
        path.push(index);
        AdPath(path)
    }

    pub fn starts_with(&self, prefix: &AdPath) -> bool {
        self.0.starts_with(&prefix.0)
    }

    pub fn depth(&self) -> usize {
        self.0.len()
    }
}

impl fmt::Display for AdPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(usize::to_string).collect();
        f.write_str(&parts.join("."))
    }
}

/// A playable inline ad, flattened out of its wrapper chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ad {
    /// Stable identity within the break
    pub uid: String,
    pub ad_id: String,
    pub sequence: Option<u32>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub advertiser: Option<String>,
    pub ad_system: Option<String>,
    pub creative_id: Option<String>,
    pub linear: LinearCreative,
    pub companions: Vec<CompanionCreative>,
    pub verifications: Vec<Verification>,
    pub tracking: AdTracking,
    /// Ids of the wrapper ads this ad was reached through, outermost first
    pub wrapper_ids: Vec<String>,
    pub pod_info: AdPodInfo,
}

impl Ad {
    pub fn duration(&self) -> Option<Duration> {
        self.linear.duration
    }

    pub fn skip_offset(&self) -> Option<Duration> {
        self.linear.skip_offset
    }

    pub fn is_skippable(&self) -> bool {
        self.linear.is_skippable()
    }

    pub fn media_files(&self) -> &[MediaFile] {
        &self.linear.media_files
    }

    pub fn click_through(&self) -> Option<&str> {
        self.linear.video_clicks.click_through.as_deref()
    }
}

/// One VMAP `<AdSource>`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdSource {
    pub id: String,
    pub allow_multiple_ads: bool,
    pub follow_redirects: bool,
    pub ad_tag_uri: Option<String>,
    pub vast: Option<VastDocument>,
}

impl AdSource {
    pub fn ads_count(&self) -> usize {
        match &self.vast {
            Some(vast) => vast.ads_count(),
            None => usize::from(self.ad_tag_uri.is_some() && self.follow_redirects),
        }
    }
}

/// A redirect waiting to be fetched
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRedirect {
    pub path: AdPath,
    pub uri: String,
}

/// A scheduled insertion point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdBreak {
    pub id: String,
    pub offset: BreakOffset,
    pub break_type: Option<String>,
    pub repeat_after: Option<Duration>,
    pub pod_index: i32,
    pub sources: Vec<AdSource>,
    pub tracking: TrackingEvents,
    pub has_unplayed_ads: bool,
    ads: Vec<Arc<Ad>>,
    total_ads: usize,
}

impl AdBreak {
    pub fn new(id: impl Into<String>, offset: BreakOffset) -> Self {
        Self {
            id: id.into(),
            offset,
            break_type: None,
            repeat_after: None,
            pod_index: 0,
            sources: Vec::new(),
            tracking: TrackingEvents::default(),
            has_unplayed_ads: true,
            ads: Vec::new(),
            total_ads: 0,
        }
    }

    /// Playable ads resolved so far, in pod order
    pub fn ads(&self) -> &[Arc<Ad>] {
        &self.ads
    }

    /// Ads this break stands for, counting each unresolved redirect as one
    pub fn total_ads(&self) -> usize {
        self.total_ads
    }

    pub fn start(&self, content_duration: Option<Duration>) -> Option<Duration> {
        self.offset.start(content_duration)
    }

    /// Rebuild the flattened ad list and aggregate count from the sources
    pub fn refresh_ads(&mut self, content_duration: Option<Duration>) {
        let mut ads = Vec::new();
        let mut total = 0;

        for (index, source) in self.sources.iter().enumerate() {
            match &source.vast {
                Some(vast) => {
                    let path = AdPath(vec![index]);
                    total += collect_ads(vast, &path, &Inherited::default(), &mut ads);
                }
                None => total += source.ads_count(),
            }
        }

        let time_offset = self.offset.seconds(content_duration);
        self.ads = ads
            .into_iter()
            .enumerate()
            .map(|(i, mut ad)| {
                ad.pod_info = AdPodInfo {
                    pod_index: self.pod_index,
                    position: i + 1,
                    total_ads: total,
                    time_offset,
                    max_duration: None,
                };
                Arc::new(ad)
            })
            .collect();
        self.total_ads = total;
    }

    /// First redirect still waiting to be fetched, in document order
    pub fn pending_redirect(&self) -> Option<PendingRedirect> {
        self.sources.iter().enumerate().find_map(|(index, source)| {
            if !source.follow_redirects {
                return None;
            }
            let path = AdPath(vec![index]);
            match (&source.vast, &source.ad_tag_uri) {
                (None, Some(uri)) => Some(PendingRedirect { path, uri: uri.clone() }),
                (Some(vast), _) => pending_in(vast, &path),
                (None, None) => None,
            }
        })
    }

    /// First pending redirect underneath `root`
    pub fn pending_redirect_within(&self, root: &AdPath) -> Option<PendingRedirect> {
        let index = *root.0.first()?;
        let source = self.sources.get(index)?;
        if !source.follow_redirects {
            return None;
        }
        let found = match (&source.vast, &source.ad_tag_uri) {
            (None, Some(uri)) => Some(PendingRedirect {
                path: AdPath(vec![index]),
                uri: uri.clone(),
            }),
            (Some(vast), _) => pending_in(vast, &AdPath(vec![index])),
            (None, None) => None,
        };
        found.filter(|p| p.path.starts_with(root))
    }

    /// Whether a failing redirect at `path` may be dropped in favour of its siblings
    pub fn falls_back_on_no_ad(&self, path: &AdPath) -> bool {
        match self.wrapper_at(path) {
            Some(WrapperRef { fallback_on_no_ad, .. }) => fallback_on_no_ad,
            None => false,
        }
    }

    /// Store the document fetched for `path`. `None` drops the redirect.
    pub fn apply_redirect(&mut self, path: &AdPath, document: Option<VastDocument>) -> Result<()> {
        let (&source_index, rest) = path
            .0
            .split_first()
            .ok_or_else(|| VastError::malformed("empty redirect path"))?;
        let source = self
            .sources
            .get_mut(source_index)
            .ok_or_else(|| VastError::malformed(format!("no ad source at {path}")))?;

        if rest.is_empty() {
            match document {
                Some(mut vast) => {
                    if !source.allow_multiple_ads {
                        vast.truncate_to_first_ad();
                    }
                    source.vast = Some(vast);
                }
                None => {
                    source.ad_tag_uri = None;
                    source.vast = None;
                }
            }
            return Ok(());
        }

        let mut vast = source
            .vast
            .as_mut()
            .ok_or_else(|| VastError::malformed(format!("no document at {path}")))?;
        let (&last, middle) = rest
            .split_last()
            .ok_or_else(|| VastError::malformed("empty redirect path"))?;
        for &index in middle {
            vast = match vast.ads.get_mut(index).map(|ad| &mut ad.kind) {
                Some(AdKind::Wrapper(wrapper)) => wrapper
                    .resolved
                    .as_mut()
                    .ok_or_else(|| VastError::malformed(format!("unresolved wrapper on {path}")))?,
                _ => return Err(VastError::malformed(format!("no wrapper on {path}"))),
            };
        }
        match vast.ads.get_mut(last).map(|ad| &mut ad.kind) {
            Some(AdKind::Wrapper(wrapper)) => {
                let mut resolved = document.unwrap_or_default();
                if !wrapper.allow_multiple_ads {
                    resolved.truncate_to_first_ad();
                }
                wrapper.resolved = Some(resolved);
                Ok(())
            }
            _ => Err(VastError::malformed(format!("no wrapper at {path}"))),
        }
    }

    fn wrapper_at(&self, path: &AdPath) -> Option<WrapperRef> {
        let (&source_index, rest) = path.0.split_first()?;
        let mut vast = self.sources.get(source_index)?.vast.as_ref()?;
        let (&last, middle) = rest.split_last()?;
        for &index in middle {
            vast = vast.ads.get(index)?.wrapper()?.resolved.as_ref()?;
        }
        let wrapper = vast.ads.get(last)?.wrapper()?;
        Some(WrapperRef {
            fallback_on_no_ad: wrapper.fallback_on_no_ad,
        })
    }
}

struct WrapperRef {
    fallback_on_no_ad: bool,
}

fn pending_in(vast: &VastDocument, path: &AdPath) -> Option<PendingRedirect> {
    vast.ads.iter().enumerate().find_map(|(index, ad)| match &ad.kind {
        AdKind::Wrapper(wrapper) => match &wrapper.resolved {
            None => Some(PendingRedirect {
                path: path.child(index),
                uri: wrapper.ad_tag_uri.clone(),
            }),
            Some(resolved) => pending_in(resolved, &path.child(index)),
        },
        AdKind::InLine(_) => None,
    })
}

/// Tracking accumulated from wrapper ancestors
#[derive(Default, Clone)]
struct Inherited {
    tracking: AdTracking,
    verifications: Vec<Verification>,
    companions: Vec<CompanionCreative>,
    wrapper_ids: Vec<String>,
}

impl Inherited {
    fn with_wrapper(&self, ad: &VastAd) -> Inherited {
        let mut next = self.clone();
        let common = ad.common();
        next.tracking.impressions.extend(common.impressions.iter().cloned());
        next.tracking.errors.extend(common.error_urls.iter().cloned());
        if let Some(linear) = common.linear() {
            next.tracking.events.extend(&linear.tracking);
            next.tracking.clicks.extend(linear.video_clicks.click_tracking.iter().cloned());
        }
        next.verifications.extend(common.verifications.iter().cloned());
        next.companions.extend(common.companions().cloned());
        next.wrapper_ids.push(ad.id.clone());
        next
    }
}

/// Append the playable ads of `vast` to `out`, returning how many ads the
/// document stands for. Ads listed after an unresolved wrapper are held back
/// until it resolves so the pod keeps its order.
fn collect_ads(vast: &VastDocument, path: &AdPath, inherited: &Inherited, out: &mut Vec<Ad>) -> usize {
    let mut groups: Vec<(u32, Vec<Ad>)> = Vec::new();
    let mut keep_adding = true;
    let mut count = 0;

    for (index, ad) in vast.ads.iter().enumerate() {
        let sequence = ad.sequence.unwrap_or(0);
        match &ad.kind {
            AdKind::InLine(inline) => {
                let Some(linear) = inline.linear().filter(|l| l.has_media()) else {
                    log::debug!("Ad {} has no linear media, not playable", ad.id);
                    continue;
                };
                count += 1;
                if keep_adding {
                    let built = build_ad(ad, inline, linear, &path.child(index), inherited);
                    groups.push((sequence, vec![built]));
                }
            }
            AdKind::Wrapper(wrapper) => match &wrapper.resolved {
                Some(resolved) => {
                    let mut nested = Vec::new();
                    count += collect_ads(resolved, &path.child(index), &inherited.with_wrapper(ad), &mut nested);
                    if keep_adding && !nested.is_empty() {
                        groups.push((sequence, nested));
                    }
                }
                None => {
                    count += 1;
                    keep_adding = false;
                }
            },
        }
    }

    groups.sort_by_key(|(sequence, _)| *sequence);
    out.extend(groups.into_iter().flat_map(|(_, ads)| ads));
    count
}

fn build_ad(ad: &VastAd, inline: &InLine, linear: &LinearCreative, path: &AdPath, inherited: &Inherited) -> Ad {
    let common = &inline.common;

    let mut tracking = inherited.tracking.clone();
    tracking.impressions.extend(common.impressions.iter().cloned());
    tracking.errors.extend(common.error_urls.iter().cloned());
    tracking.events.extend(&linear.tracking);
    tracking.clicks.extend(linear.video_clicks.click_tracking.iter().cloned());

    let mut companions: Vec<CompanionCreative> = common.companions().cloned().collect();
    companions.extend(inherited.companions.iter().cloned());

    let mut verifications = inherited.verifications.clone();
    verifications.extend(common.verifications.iter().cloned());

    let creative_id = common
        .creatives
        .iter()
        .find(|c| c.linear.is_some())
        .and_then(|c| c.id.clone().or_else(|| c.ad_id.clone()));

    Ad {
        uid: path.to_string(),
        ad_id: ad.id.clone(),
        sequence: ad.sequence,
        title: inline.ad_title.clone(),
        description: inline.description.clone(),
        advertiser: inline.advertiser.clone(),
        ad_system: common.ad_system.as_ref().map(|s| s.name.clone()),
        creative_id,
        linear: linear.clone(),
        companions,
        verifications,
        tracking,
        wrapper_ids: inherited.wrapper_ids.clone(),
        pod_info: AdPodInfo {
            pod_index: 0,
            position: 0,
            total_ads: 0,
            time_offset: 0.0,
            max_duration: None,
        },
    }
}

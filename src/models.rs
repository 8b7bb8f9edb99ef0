use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::tracking::{TrackingEventName, TrackingEvents, TrackingUrl};

/// A parsed VAST document
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone, Default)]
pub struct VastDocument {
    /// The VAST version (e.g., "2.0", "3.0", "4.0", etc.)
    pub version: Option<String>,

    /// The Ad elements within the VAST document, in document order
    pub ads: Vec<VastAd>,

    /// Document-level error URLs, fired when no ad could be served
    pub error_urls: Vec<String>,
}

impl VastDocument {
    /// Number of playable ads this document stands for, counting each
    /// unresolved wrapper as one pending ad.
    pub fn ads_count(&self) -> usize {
        self.ads.iter().map(VastAd::ads_count).sum()
    }

    /// Keep only the first ad, for sources that disallow ad pods
    pub fn truncate_to_first_ad(&mut self) {
        self.ads.truncate(1);
    }
}

/// One `<Ad>` node
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct VastAd {
    /// The ad ID, generated when the document omits it
    pub id: String,

    /// Position inside an ad pod
    pub sequence: Option<u32>,

    pub kind: AdKind,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub enum AdKind {
    InLine(InLine),
    Wrapper(Wrapper),
}

impl VastAd {
    pub fn inline(&self) -> Option<&InLine> {
        match &self.kind {
            AdKind::InLine(inline) => Some(inline),
            AdKind::Wrapper(_) => None,
        }
    }

    pub fn wrapper(&self) -> Option<&Wrapper> {
        match &self.kind {
            AdKind::Wrapper(wrapper) => Some(wrapper),
            AdKind::InLine(_) => None,
        }
    }

    pub fn ads_count(&self) -> usize {
        match &self.kind {
            AdKind::InLine(inline) => usize::from(inline.linear().is_some_and(LinearCreative::has_media)),
            AdKind::Wrapper(wrapper) => match &wrapper.resolved {
                Some(vast) => vast.ads_count(),
                None => 1,
            },
        }
    }

    /// Tracking URLs shared by inline and wrapper ads
    pub fn common(&self) -> &AdCommon {
        match &self.kind {
            AdKind::InLine(inline) => &inline.common,
            AdKind::Wrapper(wrapper) => &wrapper.common,
        }
    }
}

/// Elements an InLine and a Wrapper both carry
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone, Default)]
pub struct AdCommon {
    /// The ad system name and version
    pub ad_system: Option<AdSystem>,

    /// Impression tracking URLs
    pub impressions: Vec<TrackingUrl>,

    /// Error tracking URLs
    pub error_urls: Vec<TrackingUrl>,

    /// Verification scripts
    pub verifications: Vec<Verification>,

    /// Creative elements
    pub creatives: Vec<Creative>,

    /// Extensions
    pub extensions: Vec<Extension>,
}

impl AdCommon {
    pub fn linear(&self) -> Option<&LinearCreative> {
        self.creatives.iter().find_map(|c| c.linear.as_ref())
    }

    pub fn companions(&self) -> impl Iterator<Item = &CompanionCreative> {
        self.creatives.iter().flat_map(|c| c.companions.iter())
    }
}

/// An InLine ad, which contains all the media files and tracking information
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone, Default)]
pub struct InLine {
    pub common: AdCommon,

    /// The ad title
    pub ad_title: Option<String>,

    /// The description of the ad
    pub description: Option<String>,

    /// The advertiser name
    pub advertiser: Option<String>,
}

impl InLine {
    pub fn linear(&self) -> Option<&LinearCreative> {
        self.common.linear()
    }
}

/// A Wrapper ad, which references another VAST document
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct Wrapper {
    pub common: AdCommon,

    /// The URL of the next VAST document
    pub ad_tag_uri: String,

    /// Whether the referenced document may return an ad pod
    pub allow_multiple_ads: bool,

    /// Whether a failing redirect may fall back to sibling ads
    pub fallback_on_no_ad: bool,

    /// The document fetched from `ad_tag_uri`, once resolved
    pub resolved: Option<VastDocument>,
}

impl Wrapper {
    pub fn new(ad_tag_uri: impl Into<String>) -> Self {
        Self {
            common: AdCommon::default(),
            ad_tag_uri: ad_tag_uri.into(),
            allow_multiple_ads: false,
            fallback_on_no_ad: true,
            resolved: None,
        }
    }
}

/// The ad system name and version
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct AdSystem {
    pub name: String,
    pub version: Option<String>,
}

/// An Extension, kept as opaque text
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct Extension {
    pub r#type: Option<String>,
    pub content: String,
}

/// A verification script descriptor
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone, Default)]
pub struct Verification {
    pub vendor: Option<String>,
    pub api_framework: Option<String>,
    pub javascript_resource: Option<String>,
    pub parameters: Option<String>,
    pub tracking: TrackingEvents,
}

/// A Creative element
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone, Default)]
pub struct Creative {
    pub id: Option<String>,
    pub ad_id: Option<String>,
    pub sequence: Option<u32>,

    /// The linear (video) creative, if this is one
    pub linear: Option<LinearCreative>,

    /// Companion creatives
    pub companions: Vec<CompanionCreative>,
}

/// A playable video creative
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone, Default)]
pub struct LinearCreative {
    pub duration: Option<Duration>,

    /// Resolved skip offset. `None` for non-skippable creatives.
    pub skip_offset: Option<Duration>,

    pub media_files: Vec<MediaFile>,
    pub video_clicks: VideoClicks,
    pub tracking: TrackingEvents,
    pub ad_parameters: Option<String>,
}

impl LinearCreative {
    pub fn has_media(&self) -> bool {
        !self.media_files.is_empty()
    }

    pub fn is_skippable(&self) -> bool {
        self.skip_offset.is_some()
    }
}

/// How a media file is delivered
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Default)]
pub enum Delivery {
    #[default]
    Progressive,
    Streaming,
}

impl Delivery {
    pub fn parse(value: &str) -> Self {
        if value.eq_ignore_ascii_case("streaming") {
            Delivery::Streaming
        } else {
            Delivery::Progressive
        }
    }
}

/// A MediaFile candidate
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone, Default)]
pub struct MediaFile {
    pub id: Option<String>,

    /// The URL of the media file
    pub url: String,

    /// The MIME type of the media file
    pub mime_type: String,

    pub delivery: Delivery,

    /// The bitrate in kbps
    pub bitrate: Option<u32>,

    pub width: Option<u32>,
    pub height: Option<u32>,
    pub codec: Option<String>,
}

/// VideoClicks of a linear creative
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone, Default)]
pub struct VideoClicks {
    pub click_through: Option<String>,
    pub click_tracking: Vec<TrackingUrl>,
    pub custom_click: Vec<String>,
}

/// Resource a companion renders
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub enum CompanionResource {
    Static { creative_type: Option<String>, url: String },
    Html(String),
    IFrame(String),
}

/// A display companion creative
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone, Default)]
pub struct CompanionCreative {
    pub id: Option<String>,
    pub width: u32,
    pub height: u32,
    pub resource: Option<CompanionResource>,
    pub click_through: Option<String>,
    pub click_tracking: Vec<TrackingUrl>,
    pub tracking: TrackingEvents,
}

impl CompanionCreative {
    pub fn creative_view_urls(&self) -> impl Iterator<Item = &TrackingUrl> {
        self.tracking.urls_for(TrackingEventName::CreativeView)
    }
}

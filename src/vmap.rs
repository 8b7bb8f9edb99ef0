//! VMAP parsing, and the entry point that accepts either VMAP or bare VAST.

use std::collections::HashMap;

use quick_xml::events::{BytesStart, Event};
use serde::{Deserialize, Serialize};

use crate::ad_break::{AdBreak, AdSource, BreakOffset};
use crate::error::{Result, VastError};
use crate::models::VastDocument;
use crate::parser::{empty_document, parse_tracking_events, parse_vast_element};
use crate::tracking::TrackingEvents;
use crate::xml::{self, attr, attr_bool, read_text, skip_element, unexpected_eof, XmlReader};

pub const PRE_ROLL_POD_INDEX: i32 = 0;
pub const POST_ROLL_POD_INDEX: i32 = -1;

/// Break id given to a bare VAST response
pub const SYNTHETIC_PRE_ROLL_ID: &str = "preroll";

/// A parsed ad response, normalised to a list of breaks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmapDocument {
    pub version: Option<String>,
    pub ad_breaks: Vec<AdBreak>,
}

/// Parse an ad server response. A bare VAST document becomes a single
/// pre-roll break.
pub fn parse_ad_response(xml_content: &str) -> Result<VmapDocument> {
    let mut reader = xml::reader(xml_content);
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(ref e) => {
                return match e.local_name().as_ref() {
                    b"VMAP" => parse_vmap_element(&mut reader, e).map_err(into_vmap_error),
                    b"VAST" => wrap_vast(parse_vast_element(&mut reader, e)?),
                    _ => Err(VastError::malformed(format!(
                        "unsupported ad response root <{}>",
                        xml::element_name(e)
                    ))),
                };
            }
            Event::Empty(ref e) => {
                return match e.local_name().as_ref() {
                    b"VMAP" => Err(VastError::EmptyResponse),
                    b"VAST" => wrap_vast(empty_document(e)),
                    _ => Err(VastError::malformed(format!(
                        "unsupported ad response root <{}>",
                        xml::element_name(e)
                    ))),
                };
            }
            Event::Eof => return Err(VastError::malformed("empty ad response")),
            _ => (),
        }
        buf.clear();
    }
}

/// Parse a VMAP document
pub fn parse_vmap(xml_content: &str) -> Result<VmapDocument> {
    let mut reader = xml::reader(xml_content);
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(ref e) => {
                xml::expect_tag(e, b"VMAP").map_err(into_vmap_error)?;
                return parse_vmap_element(&mut reader, e).map_err(into_vmap_error);
            }
            Event::Eof => return Err(into_vmap_error(VastError::malformed("no <VMAP> element found"))),
            _ => (),
        }
        buf.clear();
    }
}

fn into_vmap_error(err: VastError) -> VastError {
    match err {
        VastError::MalformedResponse { .. } => VastError::MalformedVmap(Box::new(err)),
        other => other,
    }
}

fn wrap_vast(vast: VastDocument) -> Result<VmapDocument> {
    let mut ad_break = AdBreak::new(SYNTHETIC_PRE_ROLL_ID, BreakOffset::PreRoll);
    ad_break.pod_index = PRE_ROLL_POD_INDEX;
    ad_break.sources.push(AdSource {
        id: "1".to_string(),
        allow_multiple_ads: true,
        follow_redirects: true,
        ad_tag_uri: None,
        vast: Some(vast),
    });
    ad_break.refresh_ads(None);

    Ok(VmapDocument {
        version: None,
        ad_breaks: vec![ad_break],
    })
}

fn parse_vmap_element(reader: &mut XmlReader, start: &BytesStart) -> Result<VmapDocument> {
    let version = attr(start, b"version");
    let mut parsed = Vec::new();

    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(ref e) if e.local_name().as_ref() == b"AdBreak" => {
                if let Some(ad_break) = parse_ad_break(reader, e, parsed.len())? {
                    parsed.push(ad_break);
                }
            }
            Event::Start(ref e) => skip_element(reader, e)?,
            Event::End(_) => break,
            Event::Eof => return Err(unexpected_eof(start)),
            _ => (),
        }
        buf.clear();
    }

    let ad_breaks = merge_breaks(parsed);
    if ad_breaks.is_empty() {
        return Err(VastError::EmptyResponse);
    }

    Ok(VmapDocument { version, ad_breaks })
}

/// Merge breaks sharing an id and assign pod indices
fn merge_breaks(parsed: Vec<AdBreak>) -> Vec<AdBreak> {
    let mut merged: Vec<AdBreak> = Vec::new();
    let mut by_id: HashMap<String, usize> = HashMap::new();
    let mut next_pod_index = 1;

    for mut ad_break in parsed {
        if let Some(&existing) = by_id.get(&ad_break.id) {
            let target = &mut merged[existing];
            log::debug!("Merging duplicate ad break {}", target.id);
            target.sources.append(&mut ad_break.sources);
            target.tracking.extend(&ad_break.tracking);
            for source in &mut target.sources {
                source.allow_multiple_ads = false;
            }
            continue;
        }

        ad_break.pod_index = match ad_break.offset {
            BreakOffset::PreRoll => PRE_ROLL_POD_INDEX,
            BreakOffset::PostRoll => POST_ROLL_POD_INDEX,
            _ => {
                next_pod_index += 1;
                next_pod_index - 1
            }
        };
        by_id.insert(ad_break.id.clone(), merged.len());
        merged.push(ad_break);
    }

    for ad_break in &mut merged {
        ad_break.refresh_ads(None);
    }
    merged
}

/// Parse one AdBreak. Breaks with an unusable timeOffset are dropped.
fn parse_ad_break(reader: &mut XmlReader, start: &BytesStart, ordinal: usize) -> Result<Option<AdBreak>> {
    let time_offset = attr(start, b"timeOffset").unwrap_or_default();
    let offset = BreakOffset::parse(&time_offset);
    let id = attr(start, b"breakId")
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| format!("break-{}", ordinal + 1));

    let mut sources = Vec::new();
    let mut tracking = TrackingEvents::default();

    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(ref e) => match e.local_name().as_ref() {
                b"AdSource" => sources.push(parse_ad_source(reader, e)?),
                b"TrackingEvents" => tracking.extend(&parse_tracking_events(reader, e)?),
                _ => skip_element(reader, e)?,
            },
            Event::End(_) => break,
            Event::Eof => return Err(unexpected_eof(start)),
            _ => (),
        }
        buf.clear();
    }

    let offset = match offset {
        Ok(offset) => offset,
        Err(e) => {
            log::warn!("Dropping ad break {}: {}", id, e);
            return Ok(None);
        }
    };

    let mut ad_break = AdBreak::new(id, offset);
    ad_break.break_type = attr(start, b"breakType");
    ad_break.repeat_after = attr(start, b"repeatAfter").and_then(|v| crate::timecode::parse_clock(&v).ok());
    ad_break.sources = sources;
    ad_break.tracking = tracking;
    Ok(Some(ad_break))
}

fn parse_ad_source(reader: &mut XmlReader, start: &BytesStart) -> Result<AdSource> {
    let mut source = AdSource {
        id: attr(start, b"id").unwrap_or_else(|| "1".to_string()),
        allow_multiple_ads: attr_bool(start, b"allowMultipleAds").unwrap_or(true),
        follow_redirects: attr_bool(start, b"followRedirects").unwrap_or(true),
        ad_tag_uri: None,
        vast: None,
    };

    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(ref e) => match e.local_name().as_ref() {
                b"AdTagURI" => {
                    let uri = read_text(reader, e)?;
                    source.ad_tag_uri = Some(uri).filter(|u| !u.is_empty());
                }
                b"VASTAdData" | b"VASTData" => source.vast = parse_vast_data(reader, e)?,
                _ => skip_element(reader, e)?,
            },
            Event::End(_) => break,
            Event::Eof => return Err(unexpected_eof(start)),
            _ => (),
        }
        buf.clear();
    }

    Ok(source)
}

/// Parse the VAST document embedded in a VASTAdData element
fn parse_vast_data(reader: &mut XmlReader, start: &BytesStart) -> Result<Option<VastDocument>> {
    let mut vast = None;

    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(ref e) if e.local_name().as_ref() == b"VAST" => {
                vast = Some(parse_vast_element(reader, e)?);
            }
            Event::Empty(ref e) if e.local_name().as_ref() == b"VAST" => vast = Some(empty_document(e)),
            Event::Start(ref e) => skip_element(reader, e)?,
            Event::End(_) => break,
            Event::Eof => return Err(unexpected_eof(start)),
            _ => (),
        }
        buf.clear();
    }

    Ok(vast)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const VMAP: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<vmap:VMAP xmlns:vmap="http://www.iab.net/videosuite/vmap" version="1.0">
  <vmap:AdBreak timeOffset="start" breakType="linear" breakId="preroll">
    <vmap:AdSource id="pre-1" allowMultipleAds="true" followRedirects="true">
      <vmap:AdTagURI templateType="vast3"><![CDATA[https://ads.example/pre]]></vmap:AdTagURI>
    </vmap:AdSource>
    <vmap:TrackingEvents>
      <vmap:Tracking event="breakStart">https://t.example/break-start</vmap:Tracking>
    </vmap:TrackingEvents>
  </vmap:AdBreak>
  <vmap:AdBreak timeOffset="00:10:00.000" breakType="linear" breakId="mid">
    <vmap:AdSource id="mid-1">
      <vmap:AdTagURI><![CDATA[https://ads.example/mid-a]]></vmap:AdTagURI>
    </vmap:AdSource>
  </vmap:AdBreak>
  <vmap:AdBreak timeOffset="00:10:00.000" breakType="linear" breakId="mid">
    <vmap:AdSource id="mid-2">
      <vmap:AdTagURI><![CDATA[https://ads.example/mid-b]]></vmap:AdTagURI>
    </vmap:AdSource>
    <vmap:TrackingEvents>
      <vmap:Tracking event="breakEnd">https://t.example/break-end</vmap:Tracking>
    </vmap:TrackingEvents>
  </vmap:AdBreak>
  <vmap:AdBreak timeOffset="00:20:00" breakType="linear" breakId="mid2">
    <vmap:AdSource id="mid2-1">
      <vmap:AdTagURI>https://ads.example/mid2</vmap:AdTagURI>
    </vmap:AdSource>
  </vmap:AdBreak>
  <vmap:AdBreak timeOffset="end" breakType="linear" breakId="postroll">
    <vmap:AdSource id="post-1">
      <vmap:VASTAdData>
        <VAST version="3.0"></VAST>
      </vmap:VASTAdData>
    </vmap:AdSource>
  </vmap:AdBreak>
  <vmap:Extensions><vmap:Extension type="x"><Anything/></vmap:Extension></vmap:Extensions>
</vmap:VMAP>"#;

    #[test]
    fn merges_duplicate_break_ids() {
        let vmap = parse_vmap(VMAP).unwrap();
        let ids: Vec<_> = vmap.ad_breaks.iter().map(|b| b.id.as_str()).collect();
        assert_eq!(ids, ["preroll", "mid", "mid2", "postroll"]);

        let mid = &vmap.ad_breaks[1];
        let source_ids: Vec<_> = mid.sources.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(source_ids, ["mid-1", "mid-2"]);
        assert!(mid.sources.iter().all(|s| !s.allow_multiple_ads));
        assert_eq!(mid.tracking.len(), 1);
        assert_eq!(mid.total_ads(), 2);
    }

    #[test]
    fn assigns_pod_indices_by_offset_class() {
        let vmap = parse_vmap(VMAP).unwrap();
        let pods: Vec<_> = vmap.ad_breaks.iter().map(|b| b.pod_index).collect();
        assert_eq!(pods, [0, 1, 2, -1]);
        assert_eq!(vmap.ad_breaks[1].offset, BreakOffset::At(Duration::from_secs(600)));
        assert!(vmap.ad_breaks[3].offset.is_post_roll());
    }

    #[test]
    fn reads_sources() {
        let vmap = parse_vmap(VMAP).unwrap();
        let pre = &vmap.ad_breaks[0].sources[0];
        assert_eq!(pre.ad_tag_uri.as_deref(), Some("https://ads.example/pre"));
        assert!(pre.vast.is_none());

        let post = &vmap.ad_breaks[3].sources[0];
        assert!(post.vast.as_ref().is_some_and(|v| v.ads.is_empty()));
        assert_eq!(vmap.ad_breaks[3].total_ads(), 0);
    }

    #[test]
    fn vmap_without_breaks_is_empty() {
        let xml = r#"<vmap:VMAP xmlns:vmap="http://www.iab.net/videosuite/vmap" version="1.0"></vmap:VMAP>"#;
        assert!(matches!(parse_vmap(xml), Err(VastError::EmptyResponse)));
        assert!(matches!(parse_ad_response(xml), Err(VastError::EmptyResponse)));
    }

    #[test]
    fn unparseable_offsets_drop_the_break() {
        let xml = VMAP.replace(r#"timeOffset="00:20:00""#, r##"timeOffset="#3""##);
        let vmap = parse_vmap(&xml).unwrap();
        assert_eq!(vmap.ad_breaks.len(), 3);
        assert_eq!(vmap.ad_breaks.last().map(|b| b.pod_index), Some(-1));
    }

    #[test]
    fn bare_vast_becomes_a_pre_roll() {
        let xml = r#"<VAST version="3.0"><Ad id="w"><Wrapper><VASTAdTagURI>https://ads.example/next</VASTAdTagURI></Wrapper></Ad></VAST>"#;
        let vmap = parse_ad_response(xml).unwrap();
        assert_eq!(vmap.ad_breaks.len(), 1);

        let ad_break = &vmap.ad_breaks[0];
        assert_eq!(ad_break.id, SYNTHETIC_PRE_ROLL_ID);
        assert_eq!(ad_break.pod_index, PRE_ROLL_POD_INDEX);
        assert_eq!(ad_break.offset, BreakOffset::PreRoll);
        assert_eq!(ad_break.sources[0].id, "1");
        assert!(ad_break.sources[0].allow_multiple_ads);
        assert!(ad_break.sources[0].follow_redirects);
        assert_eq!(ad_break.total_ads(), 1);
    }

    #[test]
    fn malformed_vmap_is_reported_as_such() {
        let xml = r#"<vmap:VMAP xmlns:vmap="http://www.iab.net/videosuite/vmap"><vmap:AdBreak timeOffset="start">"#;
        let err = parse_ad_response(xml).unwrap_err();
        assert!(matches!(err, VastError::MalformedVmap(_)));
        assert_eq!(err.code().value(), 1002);
        assert!(parse_ad_response("<html></html>").is_err());
    }
}

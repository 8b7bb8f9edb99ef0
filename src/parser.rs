use quick_xml::events::{BytesStart, Event};
use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};

use crate::error::{Result, VastError};
use crate::fetch::is_locator;
use crate::models::*;
use crate::timecode::{parse_clock, SkipOffset};
use crate::tracking::{TrackingEventName, TrackingEvents, TrackingUrl};
use crate::xml::{self, attr, attr_bool, attr_parse, read_text, skip_element, unexpected_eof, XmlReader};

/// Parse a VAST XML string into a VastDocument
pub fn parse_vast(xml_content: &str) -> Result<VastDocument> {
    let mut reader = xml::reader(xml_content);
    let mut buf = Vec::new();

    // Look for the VAST element
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(ref e) => {
                xml::expect_tag(e, b"VAST")?;
                return parse_vast_element(&mut reader, e);
            }
            Event::Empty(ref e) => {
                xml::expect_tag(e, b"VAST")?;
                return Ok(empty_document(e));
            }
            Event::Eof => return Err(VastError::malformed("no <VAST> element found")),
            _ => (),
        }
        buf.clear();
    }
}

pub(crate) fn empty_document(start: &BytesStart) -> VastDocument {
    VastDocument {
        version: attr(start, b"version"),
        ..VastDocument::default()
    }
}

/// Parse the children of a `<VAST>` element whose start tag was just read
pub(crate) fn parse_vast_element(reader: &mut XmlReader, start: &BytesStart) -> Result<VastDocument> {
    let mut vast = empty_document(start);
    if vast.version.is_none() {
        log::warn!("VAST document without version attribute");
    }

    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(ref e) => match e.local_name().as_ref() {
                b"Ad" => vast.ads.push(parse_ad(reader, e)?),
                b"Error" => vast.error_urls.push(read_text(reader, e)?),
                _ => skip_element(reader, e)?,
            },
            Event::End(_) => break,
            Event::Eof => return Err(unexpected_eof(start)),
            _ => (),
        }
        buf.clear();
    }

    Ok(vast)
}

/// Parse a single Ad element
fn parse_ad(reader: &mut XmlReader, start: &BytesStart) -> Result<VastAd> {
    let id = attr(start, b"id").filter(|id| !id.is_empty()).unwrap_or_else(random_ad_id);
    let sequence = attr_parse::<u32>(start, b"sequence");
    let mut kind = None;

    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(ref e) => match e.local_name().as_ref() {
                b"InLine" => kind = Some(AdKind::InLine(parse_inline(reader, e)?)),
                b"Wrapper" => kind = Some(AdKind::Wrapper(parse_wrapper(reader, e)?)),
                _ => skip_element(reader, e)?,
            },
            Event::End(_) => break,
            Event::Eof => return Err(unexpected_eof(start)),
            _ => (),
        }
        buf.clear();
    }

    let kind = kind.ok_or_else(|| VastError::malformed(format!("Ad {id} is neither InLine nor Wrapper")))?;
    Ok(VastAd { id, sequence, kind })
}

fn random_ad_id() -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(12)
        .map(char::from)
        .collect()
}

/// Read one of the children InLine and Wrapper share. Returns false when
/// the element is not one of them and is still unread.
fn parse_common_child(reader: &mut XmlReader, e: &BytesStart, common: &mut AdCommon) -> Result<bool> {
    match e.local_name().as_ref() {
        b"AdSystem" => {
            let version = attr(e, b"version");
            let name = read_text(reader, e)?;
            common.ad_system = Some(AdSystem { name, version });
        }
        b"Impression" => {
            let url = read_text(reader, e)?;
            if !url.is_empty() {
                common.impressions.push(TrackingUrl::new(TrackingEventName::Impression, url));
            }
        }
        b"Error" => {
            let url = read_text(reader, e)?;
            if !url.is_empty() {
                common.error_urls.push(TrackingUrl::new(TrackingEventName::Error, url));
            }
        }
        b"AdVerifications" => common.verifications.extend(parse_verifications(reader, e)?),
        b"Creatives" => common.creatives = parse_creatives(reader, e)?,
        b"Extensions" => common.extensions = parse_extensions(reader, e)?,
        _ => return Ok(false),
    }
    Ok(true)
}

/// Parse an InLine element
fn parse_inline(reader: &mut XmlReader, start: &BytesStart) -> Result<InLine> {
    let mut inline = InLine::default();

    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(ref e) => {
                if !parse_common_child(reader, e, &mut inline.common)? {
                    match e.local_name().as_ref() {
                        b"AdTitle" => inline.ad_title = Some(read_text(reader, e)?),
                        b"Description" => inline.description = Some(read_text(reader, e)?),
                        b"Advertiser" => inline.advertiser = Some(read_text(reader, e)?),
                        _ => skip_element(reader, e)?,
                    }
                }
            }
            Event::End(_) => break,
            Event::Eof => return Err(unexpected_eof(start)),
            _ => (),
        }
        buf.clear();
    }

    Ok(inline)
}

/// Parse a Wrapper element
fn parse_wrapper(reader: &mut XmlReader, start: &BytesStart) -> Result<Wrapper> {
    let mut wrapper = Wrapper::new(String::new());
    wrapper.allow_multiple_ads = attr_bool(start, b"allowMultipleAds").unwrap_or(false);
    wrapper.fallback_on_no_ad = attr_bool(start, b"fallbackOnNoAd").unwrap_or(true);

    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(ref e) => {
                if !parse_common_child(reader, e, &mut wrapper.common)? {
                    match e.local_name().as_ref() {
                        b"VASTAdTagURI" => wrapper.ad_tag_uri = read_text(reader, e)?,
                        _ => skip_element(reader, e)?,
                    }
                }
            }
            Event::End(_) => break,
            Event::Eof => return Err(unexpected_eof(start)),
            _ => (),
        }
        buf.clear();
    }

    if wrapper.ad_tag_uri.is_empty() {
        return Err(VastError::malformed("Wrapper without VASTAdTagURI"));
    }
    Ok(wrapper)
}

/// Parse AdVerifications. A broken Verification is dropped, not fatal.
fn parse_verifications(reader: &mut XmlReader, start: &BytesStart) -> Result<Vec<Verification>> {
    let mut verifications = Vec::new();

    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(ref e) if e.local_name().as_ref() == b"Verification" => {
                let verification = parse_verification(reader, e)?;
                if verification.javascript_resource.is_some() {
                    verifications.push(verification);
                } else {
                    log::warn!("Dropping verification without a script resource");
                }
            }
            Event::Start(ref e) => skip_element(reader, e)?,
            Event::End(_) => break,
            Event::Eof => return Err(unexpected_eof(start)),
            _ => (),
        }
        buf.clear();
    }

    Ok(verifications)
}

fn parse_verification(reader: &mut XmlReader, start: &BytesStart) -> Result<Verification> {
    let mut verification = Verification {
        vendor: attr(start, b"vendor"),
        ..Verification::default()
    };

    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(ref e) => match e.local_name().as_ref() {
                b"JavaScriptResource" => {
                    verification.api_framework = attr(e, b"apiFramework");
                    verification.javascript_resource = Some(read_text(reader, e)?);
                }
                b"VerificationParameters" => verification.parameters = Some(read_text(reader, e)?),
                b"TrackingEvents" => verification.tracking = parse_tracking_events(reader, e)?,
                _ => skip_element(reader, e)?,
            },
            Event::End(_) => break,
            Event::Eof => return Err(unexpected_eof(start)),
            _ => (),
        }
        buf.clear();
    }

    Ok(verification)
}

/// Parse Extensions element
fn parse_extensions(reader: &mut XmlReader, start: &BytesStart) -> Result<Vec<Extension>> {
    let mut extensions = Vec::new();

    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(ref e) if e.local_name().as_ref() == b"Extension" => {
                let r#type = attr(e, b"type");
                // Only the text content is kept, nested markup is skipped
                let content = read_text(reader, e)?;
                extensions.push(Extension { r#type, content });
            }
            Event::Start(ref e) => skip_element(reader, e)?,
            Event::End(_) => break,
            Event::Eof => return Err(unexpected_eof(start)),
            _ => (),
        }
        buf.clear();
    }

    Ok(extensions)
}

/// Parse Creatives element
fn parse_creatives(reader: &mut XmlReader, start: &BytesStart) -> Result<Vec<Creative>> {
    let mut creatives = Vec::new();

    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(ref e) if e.local_name().as_ref() == b"Creative" => {
                creatives.push(parse_creative(reader, e)?);
            }
            Event::Start(ref e) => skip_element(reader, e)?,
            Event::End(_) => break,
            Event::Eof => return Err(unexpected_eof(start)),
            _ => (),
        }
        buf.clear();
    }

    Ok(creatives)
}

/// Parse Creative element
fn parse_creative(reader: &mut XmlReader, start: &BytesStart) -> Result<Creative> {
    let mut creative = Creative {
        id: attr(start, b"id"),
        ad_id: attr(start, b"adId").or_else(|| attr(start, b"AdID")),
        sequence: attr_parse(start, b"sequence"),
        ..Creative::default()
    };

    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(ref e) => match e.local_name().as_ref() {
                b"Linear" => creative.linear = Some(parse_linear(reader, e)?),
                b"CompanionAds" => creative.companions = parse_companion_ads(reader, e)?,
                _ => skip_element(reader, e)?,
            },
            Event::End(_) => break,
            Event::Eof => return Err(unexpected_eof(start)),
            _ => (),
        }
        buf.clear();
    }

    Ok(creative)
}

/// Parse Linear element. The skip offset is resolved once Duration is known.
fn parse_linear(reader: &mut XmlReader, start: &BytesStart) -> Result<LinearCreative> {
    let mut linear = LinearCreative::default();
    let skip_offset = match attr(start, b"skipoffset") {
        Some(value) => Some(SkipOffset::parse(&value)?),
        None => None,
    };

    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(ref e) => match e.local_name().as_ref() {
                b"Duration" => linear.duration = Some(parse_clock(&read_text(reader, e)?)?),
                b"MediaFiles" => linear.media_files = parse_media_files(reader, e)?,
                b"VideoClicks" => linear.video_clicks = parse_video_clicks(reader, e)?,
                b"TrackingEvents" => linear.tracking = parse_tracking_events(reader, e)?,
                b"AdParameters" => linear.ad_parameters = Some(read_text(reader, e)?),
                _ => skip_element(reader, e)?,
            },
            Event::End(_) => break,
            Event::Eof => return Err(unexpected_eof(start)),
            _ => (),
        }
        buf.clear();
    }

    linear.skip_offset = skip_offset.and_then(|offset| offset.resolve(linear.duration));
    Ok(linear)
}

/// Parse MediaFiles element
fn parse_media_files(reader: &mut XmlReader, start: &BytesStart) -> Result<Vec<MediaFile>> {
    let mut media_files = Vec::new();

    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(ref e) if e.local_name().as_ref() == b"MediaFile" => {
                media_files.push(parse_media_file(reader, e)?);
            }
            Event::Start(ref e) => skip_element(reader, e)?,
            Event::End(_) => break,
            Event::Eof => return Err(unexpected_eof(start)),
            _ => (),
        }
        buf.clear();
    }

    Ok(media_files)
}

/// Parse MediaFile element
fn parse_media_file(reader: &mut XmlReader, start: &BytesStart) -> Result<MediaFile> {
    let mut media_file = MediaFile {
        id: attr(start, b"id"),
        mime_type: attr(start, b"type").unwrap_or_default(),
        delivery: attr(start, b"delivery").map(|d| Delivery::parse(&d)).unwrap_or_default(),
        bitrate: attr_parse(start, b"bitrate").or_else(|| attr_parse(start, b"minBitrate")),
        width: attr_parse(start, b"width"),
        height: attr_parse(start, b"height"),
        codec: attr(start, b"codec"),
        ..MediaFile::default()
    };

    // Read the MediaFile URL
    media_file.url = read_text(reader, start)?;
    if !is_locator(&media_file.url) {
        return Err(VastError::malformed(format!("invalid media url '{}'", media_file.url)));
    }

    Ok(media_file)
}

/// Parse VideoClicks element
fn parse_video_clicks(reader: &mut XmlReader, start: &BytesStart) -> Result<VideoClicks> {
    let mut video_clicks = VideoClicks::default();

    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(ref e) => match e.local_name().as_ref() {
                b"ClickThrough" => video_clicks.click_through = Some(read_text(reader, e)?),
                b"ClickTracking" => video_clicks
                    .click_tracking
                    .push(TrackingUrl::new(TrackingEventName::ClickTracking, read_text(reader, e)?)),
                b"CustomClick" => video_clicks.custom_click.push(read_text(reader, e)?),
                _ => skip_element(reader, e)?,
            },
            Event::End(_) => break,
            Event::Eof => return Err(unexpected_eof(start)),
            _ => (),
        }
        buf.clear();
    }

    Ok(video_clicks)
}

/// Parse a TrackingEvents element. Unknown event names are skipped.
pub(crate) fn parse_tracking_events(reader: &mut XmlReader, start: &BytesStart) -> Result<TrackingEvents> {
    let mut tracking = TrackingEvents::default();

    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(ref e) if e.local_name().as_ref() == b"Tracking" => {
                let name = attr(e, b"event").unwrap_or_default();
                let url = read_text(reader, e)?;
                match name.parse::<TrackingEventName>() {
                    Ok(event) if !url.is_empty() => tracking.push(TrackingUrl::new(event, url)),
                    Ok(_) => (),
                    Err(_) => log::debug!("Ignoring tracking event '{}'", name),
                }
            }
            Event::Start(ref e) => skip_element(reader, e)?,
            Event::End(_) => break,
            Event::Eof => return Err(unexpected_eof(start)),
            _ => (),
        }
        buf.clear();
    }

    Ok(tracking)
}

/// Parse CompanionAds element
fn parse_companion_ads(reader: &mut XmlReader, start: &BytesStart) -> Result<Vec<CompanionCreative>> {
    let mut companions = Vec::new();

    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(ref e) if e.local_name().as_ref() == b"Companion" => {
                companions.push(parse_companion(reader, e)?);
            }
            Event::Start(ref e) => skip_element(reader, e)?,
            Event::End(_) => break,
            Event::Eof => return Err(unexpected_eof(start)),
            _ => (),
        }
        buf.clear();
    }

    Ok(companions)
}

/// Parse Companion element. Width and height are mandatory.
fn parse_companion(reader: &mut XmlReader, start: &BytesStart) -> Result<CompanionCreative> {
    let (Some(width), Some(height)) = (attr_parse::<u32>(start, b"width"), attr_parse::<u32>(start, b"height")) else {
        return Err(VastError::malformed("Companion without width/height"));
    };
    let mut companion = CompanionCreative {
        id: attr(start, b"id"),
        width,
        height,
        resource: None,
        click_through: None,
        click_tracking: Vec::new(),
        tracking: TrackingEvents::default(),
    };

    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(ref e) => match e.local_name().as_ref() {
                b"StaticResource" => {
                    let creative_type = attr(e, b"creativeType");
                    let url = read_text(reader, e)?;
                    companion.resource = Some(CompanionResource::Static { creative_type, url });
                }
                b"HTMLResource" => companion.resource = Some(CompanionResource::Html(read_text(reader, e)?)),
                b"IFrameResource" => companion.resource = Some(CompanionResource::IFrame(read_text(reader, e)?)),
                b"CompanionClickThrough" => companion.click_through = Some(read_text(reader, e)?),
                b"CompanionClickTracking" => companion
                    .click_tracking
                    .push(TrackingUrl::new(TrackingEventName::ClickTracking, read_text(reader, e)?)),
                b"TrackingEvents" => companion.tracking = parse_tracking_events(reader, e)?,
                _ => skip_element(reader, e)?,
            },
            Event::End(_) => break,
            Event::Eof => return Err(unexpected_eof(start)),
            _ => (),
        }
        buf.clear();
    }

    Ok(companion)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const INLINE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<VAST version="4.0">
  <Ad id="ad-1" sequence="1">
    <InLine>
      <AdSystem version="1.0">Example</AdSystem>
      <AdTitle>Spring Sale</AdTitle>
      <Impression><![CDATA[https://t.example/imp]]></Impression>
      <Error>https://t.example/err?code=[ERRORCODE]</Error>
      <Unknown><Nested attr="x">ignored</Nested></Unknown>
      <Creatives>
        <Creative id="c-1">
          <Linear skipoffset="50%">
            <Duration>00:00:20</Duration>
            <TrackingEvents>
              <Tracking event="start">https://t.example/start</Tracking>
              <Tracking event="madeUpEvent">https://t.example/other</Tracking>
            </TrackingEvents>
            <VideoClicks>
              <ClickThrough>https://advertiser.example</ClickThrough>
              <ClickTracking>https://t.example/click</ClickTracking>
            </VideoClicks>
            <MediaFiles>
              <MediaFile delivery="progressive" type="video/mp4" bitrate="500" width="640" height="360">
                https://cdn.example/ad.mp4
              </MediaFile>
            </MediaFiles>
          </Linear>
        </Creative>
        <Creative>
          <CompanionAds>
            <Companion width="300" height="250">
              <StaticResource creativeType="image/png">https://cdn.example/c.png</StaticResource>
            </Companion>
          </CompanionAds>
        </Creative>
      </Creatives>
    </InLine>
  </Ad>
</VAST>"#;

    #[test]
    fn parses_inline_ad() {
        let vast = parse_vast(INLINE).unwrap();
        assert_eq!(vast.version.as_deref(), Some("4.0"));
        assert_eq!(vast.ads.len(), 1);

        let ad = &vast.ads[0];
        assert_eq!(ad.id, "ad-1");
        assert_eq!(ad.sequence, Some(1));
        let inline = ad.inline().unwrap();
        assert_eq!(inline.ad_title.as_deref(), Some("Spring Sale"));
        assert_eq!(inline.common.impressions[0].url, "https://t.example/imp");

        let linear = inline.linear().unwrap();
        assert_eq!(linear.duration, Some(Duration::from_secs(20)));
        assert_eq!(linear.skip_offset, Some(Duration::from_secs(10)));
        assert_eq!(linear.tracking.len(), 1);
        assert_eq!(linear.media_files[0].url, "https://cdn.example/ad.mp4");
        assert_eq!(linear.media_files[0].bitrate, Some(500));
        assert_eq!(inline.common.companions().count(), 1);
        assert_eq!(vast.ads_count(), 1);
    }

    #[test]
    fn media_urls_are_checked_without_the_filesystem() {
        let relative = INLINE.replace("https://cdn.example/ad.mp4", "renditions/missing.mp4");
        let vast = parse_vast(&relative).unwrap();
        let linear = vast.ads[0].inline().unwrap().linear().unwrap();
        assert_eq!(linear.media_files[0].url, "renditions/missing.mp4");

        let broken = INLINE.replace("https://cdn.example/ad.mp4", "not a media url");
        assert!(parse_vast(&broken).is_err());
    }

    #[test]
    fn absolute_skip_offset_does_not_depend_on_duration() {
        let xml = INLINE.replace("50%", "00:00:05.000");
        let vast = parse_vast(&xml).unwrap();
        let linear = vast.ads[0].inline().unwrap().linear().unwrap();
        assert_eq!(linear.skip_offset, Some(Duration::from_secs(5)));
    }

    #[test]
    fn parses_wrapper_attributes() {
        let xml = r#"<VAST version="3.0"><Ad id="w"><Wrapper allowMultipleAds="true" fallbackOnNoAd="false">
            <AdSystem>Net</AdSystem>
            <VASTAdTagURI><![CDATA[https://ads.example/next]]></VASTAdTagURI>
            <Impression>https://t.example/w-imp</Impression>
        </Wrapper></Ad></VAST>"#;
        let vast = parse_vast(xml).unwrap();
        let wrapper = vast.ads[0].wrapper().unwrap();
        assert_eq!(wrapper.ad_tag_uri, "https://ads.example/next");
        assert!(wrapper.allow_multiple_ads);
        assert!(!wrapper.fallback_on_no_ad);
        assert_eq!(vast.ads_count(), 1);
    }

    #[test]
    fn empty_vast_has_no_ads() {
        assert!(parse_vast(r#"<VAST version="3.0"/>"#).unwrap().ads.is_empty());
        assert!(parse_vast(r#"<VAST version="3.0"></VAST>"#).unwrap().ads.is_empty());
    }

    #[test]
    fn rejects_malformed_documents() {
        assert!(matches!(parse_vast("<VMAPX/>"), Err(VastError::MalformedResponse { .. })));
        assert!(matches!(
            parse_vast(r#"<VAST version="3.0"><Ad id="x"></Ad></VAST>"#),
            Err(VastError::MalformedResponse { .. })
        ));
        assert!(parse_vast(r#"<VAST version="3.0"><Ad><InLine>"#).is_err());
        let no_size = INLINE.replace(r#"width="300" height="250""#, "");
        assert!(parse_vast(&no_size).is_err());
    }

    #[test]
    fn missing_ad_id_is_generated() {
        let xml = INLINE.replace(r#"id="ad-1" "#, "");
        let vast = parse_vast(&xml).unwrap();
        assert_eq!(vast.ads[0].id.len(), 12);
    }
}

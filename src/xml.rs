//! Small helpers shared by the VAST and VMAP readers.
//!
//! Elements are matched by their local name so `vmap:AdBreak` and `AdBreak`
//! are treated the same.

use std::str::FromStr;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::error::{Result, VastError};

pub(crate) type XmlReader<'a> = Reader<&'a [u8]>;

pub(crate) fn reader(xml: &str) -> XmlReader<'_> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);
    reader
}

/// Local name of an element as an owned string, for error messages
pub(crate) fn element_name(start: &BytesStart) -> String {
    String::from_utf8_lossy(start.local_name().as_ref()).into_owned()
}

/// Fail unless `start` is the element named `tag`
pub(crate) fn expect_tag(start: &BytesStart, tag: &[u8]) -> Result<()> {
    if start.local_name().as_ref() == tag {
        Ok(())
    } else {
        Err(VastError::malformed(format!(
            "expected <{}>, found <{}>",
            String::from_utf8_lossy(tag),
            element_name(start)
        )))
    }
}

/// Read an attribute value, unescaped
pub(crate) fn attr(start: &BytesStart, name: &[u8]) -> Option<String> {
    start
        .attributes()
        .flatten()
        .find(|a| a.key.local_name().as_ref() == name)
        .and_then(|a| a.unescape_value().ok().map(|v| v.trim().to_string()))
}

pub(crate) fn attr_parse<T: FromStr>(start: &BytesStart, name: &[u8]) -> Option<T> {
    attr(start, name).and_then(|v| v.parse().ok())
}

pub(crate) fn attr_bool(start: &BytesStart, name: &[u8]) -> Option<bool> {
    attr(start, name).and_then(|v| match v.to_ascii_lowercase().as_str() {
        "true" | "1" => Some(true),
        "false" | "0" => Some(false),
        _ => None,
    })
}

/// Collect the text and CDATA content of the current element, up to its end tag.
///
/// Nested elements are skipped.
pub(crate) fn read_text(reader: &mut XmlReader, start: &BytesStart) -> Result<String> {
    let mut text = String::new();
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Text(e) => text.push_str(&e.unescape()?),
            Event::CData(e) => text.push_str(&String::from_utf8_lossy(&e)),
            Event::Start(ref e) => skip_element(reader, e)?,
            Event::End(_) => break,
            Event::Eof => return Err(unexpected_eof(start)),
            _ => (),
        }
        buf.clear();
    }

    Ok(text.trim().to_string())
}

/// Skip the current element and all of its children
pub(crate) fn skip_element(reader: &mut XmlReader, start: &BytesStart) -> Result<()> {
    let mut buf = Vec::new();
    let mut depth = 0usize;

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(_) => depth += 1,
            Event::End(_) if depth == 0 => break,
            Event::End(_) => depth -= 1,
            Event::Eof => return Err(unexpected_eof(start)),
            _ => (),
        }
        buf.clear();
    }

    Ok(())
}

pub(crate) fn unexpected_eof(start: &BytesStart) -> VastError {
    VastError::malformed(format!("unexpected end of document inside <{}>", element_name(start)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn first_start(reader: &mut XmlReader) -> BytesStart<'static> {
        let mut buf = Vec::new();
        loop {
            if let Event::Start(e) = reader.read_event_into(&mut buf).unwrap() {
                return e.into_owned();
            }
            buf.clear();
        }
    }

    #[test]
    fn reads_cdata_and_skips_nested_markup() {
        let mut r = reader("<Url> <![CDATA[https://ads.example/a?x=1]]><b>ignored</b></Url><Next/>");
        let start = first_start(&mut r);
        assert_eq!(read_text(&mut r, &start).unwrap(), "https://ads.example/a?x=1");
    }

    #[test]
    fn attributes_ignore_namespace_prefix() {
        let mut r = reader(r#"<vmap:AdBreak vmap:breakId="mid" timeOffset="00:00:10" allow="TRUE">x</vmap:AdBreak>"#);
        let start = first_start(&mut r);
        expect_tag(&start, b"AdBreak").unwrap();
        assert_eq!(attr(&start, b"breakId").as_deref(), Some("mid"));
        assert_eq!(attr_bool(&start, b"allow"), Some(true));
        assert!(expect_tag(&start, b"AdSource").is_err());
    }

    #[test]
    fn skip_element_consumes_the_whole_subtree() {
        let mut r = reader("<Extensions><Extension><Deep>1</Deep></Extension></Extensions><After>2</After>");
        let start = first_start(&mut r);
        skip_element(&mut r, &start).unwrap();
        let next = first_start(&mut r);
        assert_eq!(element_name(&next), "After");
    }

    #[test]
    fn truncated_document_is_malformed() {
        let mut r = reader("<Duration>00:00");
        let start = first_start(&mut r);
        assert!(matches!(read_text(&mut r, &start), Err(VastError::MalformedResponse { .. })));
    }
}

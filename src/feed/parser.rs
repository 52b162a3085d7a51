//! Notification payload parsing.
//!
//! Two formats arrive on the callback endpoint:
//!
//! - **Atom** pushed by the hub. Each `<entry>` carries `yt:videoId` and
//!   `yt:channelId`. A feed may instead carry `<at:deleted-entry>` when a video
//!   is removed; those are acknowledged and ignored.
//! - **JSON** manual submissions:
//!
//! ```text
//! {"platform": "tiktok", "url": "https://www.tiktok.com/@x/video/7506491557038640406"}
//! {"platform": "youtube", "url": "...", "video_id": "abc", "channel_id": "UC1",
//!  "local_path": "downloads/UC1/abc.mp4"}
//! ```
//!
//!   A missing `video_id` is derived from the URL; a missing `channel_id`
//!   defaults to the platform name. `local_path` is only honoured for files
//!   under the download directory.

use std::path::PathBuf;

use chrono::Utc;
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use serde::Deserialize;
use thiserror::Error;
use url::Url;

use crate::types::{ChannelId, ItemId, NotificationEvent, Platform, youtube_watch_url};

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("empty body")]
    EmptyBody,

    #[error("malformed XML: {0}")]
    Xml(String),

    #[error("feed entry without {0}")]
    MissingField(&'static str),

    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("cannot derive item id from url {0:?}")]
    NoItemId(String),
}

/// One `<entry>` of a hub delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedEntry {
    pub video_id: ItemId,
    pub channel_id: ChannelId,
    pub title: Option<String>,
    pub link: Option<String>,
    pub published: Option<String>,
}

impl FeedEntry {
    pub fn into_event(self) -> NotificationEvent {
        let mut event = NotificationEvent::youtube(self.channel_id, self.video_id);
        if let Some(link) = self.link {
            event.source_url = link;
        }
        event
    }
}

/// Result of parsing a hub delivery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AtomPayload {
    pub entries: Vec<FeedEntry>,
    /// `at:deleted-entry` elements seen (and ignored).
    pub deleted: usize,
}

#[derive(Default)]
struct EntryBuilder {
    video_id: Option<String>,
    channel_id: Option<String>,
    title: Option<String>,
    link: Option<String>,
    published: Option<String>,
}

impl EntryBuilder {
    fn build(self) -> Result<FeedEntry, ParseError> {
        let video_id = self
            .video_id
            .filter(|s| !s.is_empty())
            .ok_or(ParseError::MissingField("yt:videoId"))?;
        let channel_id = self
            .channel_id
            .filter(|s| !s.is_empty())
            .ok_or(ParseError::MissingField("yt:channelId"))?;
        Ok(FeedEntry {
            video_id: ItemId::new(video_id),
            channel_id: ChannelId::new(channel_id),
            title: self.title,
            link: self.link,
            published: self.published,
        })
    }
}

fn local_name(e: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(e.local_name().into_inner()).to_string()
}

fn alternate_href(e: &BytesStart<'_>) -> Option<String> {
    let mut href = None;
    let mut rel = None;
    for attr in e.attributes().flatten() {
        let key = String::from_utf8_lossy(attr.key.local_name().into_inner()).to_string();
        let value = String::from_utf8_lossy(&attr.value).to_string();
        match key.as_str() {
            "href" => href = Some(value),
            "rel" => rel = Some(value),
            _ => {}
        }
    }
    match rel.as_deref() {
        None | Some("alternate") => href,
        _ => None,
    }
}

/// Parses an Atom delivery from the hub.
pub fn parse_atom(body: &[u8]) -> Result<AtomPayload, ParseError> {
    let xml = std::str::from_utf8(body).map_err(|e| ParseError::Xml(e.to_string()))?;
    if xml.trim().is_empty() {
        return Err(ParseError::EmptyBody);
    }

    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut payload = AtomPayload::default();
    let mut entry: Option<EntryBuilder> = None;
    let mut current_element = String::new();
    let mut saw_root = false;

    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => {
                saw_root = true;
                let local = local_name(e);
                match local.as_str() {
                    "entry" => entry = Some(EntryBuilder::default()),
                    "deleted-entry" => payload.deleted += 1,
                    "link" => {
                        if let Some(entry) = entry.as_mut()
                            && entry.link.is_none()
                        {
                            entry.link = alternate_href(e);
                        }
                    }
                    _ => {}
                }
                current_element = local;
            }
            Ok(Event::Empty(ref e)) => {
                saw_root = true;
                match local_name(e).as_str() {
                    "deleted-entry" => payload.deleted += 1,
                    "link" => {
                        if let Some(entry) = entry.as_mut()
                            && entry.link.is_none()
                        {
                            entry.link = alternate_href(e);
                        }
                    }
                    _ => {}
                }
            }
            Ok(Event::Text(ref e)) => {
                if let Some(entry) = entry.as_mut() {
                    let text = e
                        .unescape()
                        .map_err(|e| ParseError::Xml(e.to_string()))?
                        .trim()
                        .to_string();
                    match current_element.as_str() {
                        "videoId" => entry.video_id = Some(text),
                        "channelId" => entry.channel_id = Some(text),
                        "title" => entry.title = Some(text),
                        "published" => entry.published = Some(text),
                        _ => {}
                    }
                }
            }
            Ok(Event::End(ref e)) => {
                if e.local_name().into_inner() == b"entry"
                    && let Some(done) = entry.take()
                {
                    payload.entries.push(done.build()?);
                }
                current_element.clear();
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(ParseError::Xml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }

    if !saw_root {
        return Err(ParseError::Xml("no root element".to_string()));
    }
    if entry.is_some() {
        return Err(ParseError::Xml("unterminated <entry>".to_string()));
    }
    Ok(payload)
}

/// A manually submitted item.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ManualSubmission {
    pub platform: Platform,
    pub url: String,
    #[serde(default, alias = "item_id")]
    pub video_id: Option<String>,
    #[serde(default)]
    pub channel_id: Option<String>,
    #[serde(default)]
    pub local_path: Option<PathBuf>,
}

impl ManualSubmission {
    pub fn into_event(self) -> Result<NotificationEvent, ParseError> {
        let item_id = match self.video_id.filter(|s| !s.trim().is_empty()) {
            Some(id) => id.trim().to_string(),
            None => item_id_from_url(&self.url)
                .ok_or_else(|| ParseError::NoItemId(self.url.clone()))?,
        };
        let channel_id = self
            .channel_id
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| self.platform.as_str().to_string());

        let item_id = ItemId::new(item_id);
        let source_url = if self.url.trim().is_empty() && self.platform.is_youtube() {
            youtube_watch_url(&item_id)
        } else {
            self.url
        };

        Ok(NotificationEvent {
            platform: self.platform,
            channel_id: ChannelId::new(channel_id),
            item_id,
            source_url,
            local_path: self.local_path,
            manual: true,
            received_at: Utc::now(),
        })
    }
}

pub fn parse_manual(body: &[u8]) -> Result<NotificationEvent, ParseError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(ParseError::EmptyBody);
    }
    let submission: ManualSubmission = serde_json::from_slice(body)?;
    submission.into_event()
}

/// Extracts an item id from a media URL.
///
/// Recognizes `?v=ID`, `youtu.be/ID`, `/shorts/ID`, `/video/ID` and
/// `/reel/ID`.
pub fn item_id_from_url(raw: &str) -> Option<String> {
    let url = Url::parse(raw.trim()).ok()?;

    if let Some((_, v)) = url.query_pairs().find(|(k, _)| k == "v")
        && !v.is_empty()
    {
        return Some(v.into_owned());
    }

    let segments: Vec<&str> = url.path_segments()?.filter(|s| !s.is_empty()).collect();

    if url.host_str() == Some("youtu.be") {
        return segments.first().map(|s| s.to_string());
    }

    segments
        .windows(2)
        .find(|w| matches!(w[0], "shorts" | "video" | "reel" | "reels"))
        .map(|w| w[1].to_string())
}

/// Decides whether a POST body should go to the Atom parser.
pub fn is_xml_payload(content_type: Option<&str>, body: &[u8]) -> bool {
    if let Some(ct) = content_type {
        let ct = ct.to_ascii_lowercase();
        if ct.contains("json") {
            return false;
        }
        if ct.contains("xml") {
            return true;
        }
    }
    body.iter()
        .find(|b| !b.is_ascii_whitespace())
        .is_some_and(|b| *b == b'<')
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const NEW_VIDEO: &str = r#"<?xml version='1.0' encoding='UTF-8'?>
<feed xmlns:yt="http://www.youtube.com/xml/schemas/2015" xmlns="http://www.w3.org/2005/Atom">
  <link rel="hub" href="https://pubsubhubbub.appspot.com"/>
  <link rel="self" href="https://www.youtube.com/xml/feeds/videos.xml?channel_id=UCabc"/>
  <title>YouTube video feed</title>
  <updated>2025-06-01T12:00:00.000000+00:00</updated>
  <entry>
    <id>yt:video:dQw4w9WgXcQ</id>
    <yt:videoId>dQw4w9WgXcQ</yt:videoId>
    <yt:channelId>UCabc</yt:channelId>
    <title>Tom &amp; Jerry short</title>
    <link rel="alternate" href="https://www.youtube.com/shorts/dQw4w9WgXcQ"/>
    <author>
      <name>Someone</name>
      <uri>https://www.youtube.com/channel/UCabc</uri>
    </author>
    <published>2025-06-01T11:59:30+00:00</published>
    <updated>2025-06-01T12:00:00.000000+00:00</updated>
  </entry>
</feed>"#;

    const DELETED: &str = r#"<feed xmlns:at="http://purl.org/atompub/tombstones/1.0" xmlns="http://www.w3.org/2005/Atom">
  <at:deleted-entry ref="yt:video:dQw4w9WgXcQ" when="2025-06-01T12:00:00+00:00">
    <link href="https://www.youtube.com/watch?v=dQw4w9WgXcQ"/>
    <at:by><name>Someone</name></at:by>
  </at:deleted-entry>
</feed>"#;

    // ─── Atom tests ───

    #[test]
    fn parses_new_video_entry() {
        let payload = parse_atom(NEW_VIDEO.as_bytes()).unwrap();

        assert_eq!(payload.deleted, 0);
        assert_eq!(payload.entries.len(), 1);
        let entry = &payload.entries[0];
        assert_eq!(entry.video_id, ItemId::new("dQw4w9WgXcQ"));
        assert_eq!(entry.channel_id, ChannelId::new("UCabc"));
        assert_eq!(entry.title.as_deref(), Some("Tom & Jerry short"));
        assert_eq!(
            entry.link.as_deref(),
            Some("https://www.youtube.com/shorts/dQw4w9WgXcQ")
        );
        assert_eq!(entry.published.as_deref(), Some("2025-06-01T11:59:30+00:00"));

        let event = entry.clone().into_event();
        assert!(event.platform.is_youtube());
        assert!(!event.manual);
    }

    #[test]
    fn deleted_entry_yields_no_items() {
        let payload = parse_atom(DELETED.as_bytes()).unwrap();
        assert!(payload.entries.is_empty());
        assert_eq!(payload.deleted, 1);
    }

    #[test]
    fn feed_without_entries_is_empty() {
        let payload = parse_atom(b"<feed xmlns=\"http://www.w3.org/2005/Atom\"></feed>").unwrap();
        assert_eq!(payload, AtomPayload::default());
    }

    #[test]
    fn entry_without_video_id_is_rejected() {
        let xml = r#"<feed><entry><yt:channelId>UC1</yt:channelId></entry></feed>"#;
        assert!(matches!(
            parse_atom(xml.as_bytes()),
            Err(ParseError::MissingField("yt:videoId"))
        ));
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(matches!(parse_atom(b""), Err(ParseError::EmptyBody)));
        assert!(parse_atom(b"not xml at all").is_err());
        assert!(parse_atom(b"<feed><entry><yt:videoId>x</yt:videoId>").is_err());
        assert!(parse_atom(&[0xff, 0xfe, 0x00]).is_err());
    }

    // ─── Manual submission tests ───

    #[test]
    fn manual_with_explicit_ids() {
        let event = parse_manual(
            br#"{"platform":"YouTube","url":"https://youtu.be/abc","video_id":"abc","channel_id":"UC9","local_path":"/tmp/abc.mp4"}"#,
        )
        .unwrap();

        assert!(event.manual);
        assert!(event.platform.is_youtube());
        assert_eq!(event.item_id, ItemId::new("abc"));
        assert_eq!(event.channel_id, ChannelId::new("UC9"));
        assert_eq!(event.local_path, Some(PathBuf::from("/tmp/abc.mp4")));
    }

    #[test]
    fn manual_derives_ids_from_url() {
        let event = parse_manual(
            br#"{"platform":"tiktok","url":"https://www.tiktok.com/@someone/video/7506491557038640406?lang=en"}"#,
        )
        .unwrap();
        assert_eq!(event.item_id, ItemId::new("7506491557038640406"));
        assert_eq!(event.channel_id, ChannelId::new("tiktok"));
        assert_eq!(event.platform, Platform::new("tiktok"));
    }

    #[test]
    fn manual_without_derivable_id_is_rejected() {
        let err = parse_manual(br#"{"platform":"tiktok","url":"https://www.tiktok.com/@someone"}"#)
            .unwrap_err();
        assert!(matches!(err, ParseError::NoItemId(_)));
    }

    #[test]
    fn manual_missing_platform_is_rejected() {
        assert!(matches!(
            parse_manual(br#"{"url":"https://youtu.be/abc"}"#),
            Err(ParseError::Json(_))
        ));
        assert!(matches!(parse_manual(b"  "), Err(ParseError::EmptyBody)));
    }

    #[test]
    fn item_id_patterns() {
        let cases = [
            ("https://www.youtube.com/watch?v=dQw4w9WgXcQ&t=1", Some("dQw4w9WgXcQ")),
            ("https://youtu.be/dQw4w9WgXcQ", Some("dQw4w9WgXcQ")),
            ("https://www.youtube.com/shorts/abc_DEF-123", Some("abc_DEF-123")),
            ("https://www.instagram.com/reel/C8xYz-AbC/", Some("C8xYz-AbC")),
            ("https://www.tiktok.com/@u/video/123", Some("123")),
            ("https://example.com/", None),
            ("not a url", None),
        ];
        for (url, expected) in cases {
            assert_eq!(item_id_from_url(url).as_deref(), expected, "{}", url);
        }
    }

    #[test]
    fn payload_sniffing() {
        assert!(is_xml_payload(Some("application/atom+xml"), b"{}"));
        assert!(is_xml_payload(Some("text/xml; charset=utf-8"), b""));
        assert!(!is_xml_payload(Some("application/json"), b"<feed/>"));
        assert!(is_xml_payload(None, b"  <?xml version='1.0'?><feed/>"));
        assert!(!is_xml_payload(Some("text/plain"), b"{\"a\":1}"));
    }

    proptest! {
        #[test]
        fn arbitrary_bytes_never_panic(body: Vec<u8>) {
            let _ = parse_atom(&body);
            let _ = parse_manual(&body);
        }

        #[test]
        fn any_youtube_id_roundtrips_through_entry(
            id in "[A-Za-z0-9_-]{11}",
            channel in "UC[A-Za-z0-9_-]{22}",
        ) {
            let xml = format!(
                concat!(
                    "<feed><entry><yt:videoId>{}</yt:videoId>",
                    "<yt:channelId>{}</yt:channelId></entry></feed>"
                ),
                id, channel
            );
            let payload = parse_atom(xml.as_bytes()).unwrap();
            prop_assert_eq!(payload.entries.len(), 1);
            prop_assert_eq!(payload.entries[0].video_id.as_str(), id.as_str());
            prop_assert_eq!(payload.entries[0].channel_id.as_str(), channel.as_str());
        }
    }
}

//! YouTube Data API v3 metadata lookups.
//!
//! `GET {api_url}?key=..&id=..&part=snippet,contentDetails`. Only the fields
//! used by the fetch stage filters are read: `snippet.publishedAt`,
//! `snippet.channelId`, `snippet.title` and `contentDetails.duration`.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, instrument};

use super::{MetadataError, MetadataSource, VideoMetadata};
use crate::types::{ChannelId, ItemId};

#[derive(Debug, Deserialize)]
struct VideoListResponse {
    #[serde(default)]
    items: Vec<VideoResource>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoResource {
    snippet: Snippet,
    content_details: ContentDetails,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Snippet {
    published_at: DateTime<Utc>,
    #[serde(default)]
    channel_id: Option<String>,
    #[serde(default)]
    title: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ContentDetails {
    #[serde(default)]
    duration: Option<String>,
}

/// Parses an ISO 8601 duration such as `PT1M5S` or `P1DT2H`.
///
/// Years, months and fractional components are not used by YouTube and are
/// rejected.
pub fn parse_iso8601_duration(s: &str) -> Option<Duration> {
    let rest = s.strip_prefix('P')?;
    if rest.is_empty() {
        return None;
    }
    let (date, time) = match rest.split_once('T') {
        Some((date, time)) if !time.is_empty() => (date, Some(time)),
        Some(_) => return None,
        None => (rest, None),
    };

    let mut secs: u64 = 0;
    let mut add = |part: &str, units: &[(char, u64)]| -> Option<()> {
        let mut digits = String::new();
        let mut allowed = units.iter();
        for c in part.chars() {
            if c.is_ascii_digit() {
                digits.push(c);
                continue;
            }
            if digits.is_empty() {
                return None;
            }
            // Designators must appear in order, each at most once.
            let (_, scale) = allowed.by_ref().find(|(unit, _)| *unit == c)?;
            let n: u64 = digits.parse().ok()?;
            secs = secs.checked_add(n.checked_mul(*scale)?)?;
            digits.clear();
        }
        digits.is_empty().then_some(())
    };

    add(date, &[('W', 7 * 86_400), ('D', 86_400)])?;
    if let Some(time) = time {
        add(time, &[('H', 3_600), ('M', 60), ('S', 1)])?;
    }
    Some(Duration::from_secs(secs))
}

fn metadata_from_response(
    item: &ItemId,
    response: VideoListResponse,
) -> Result<VideoMetadata, MetadataError> {
    let resource = response
        .items
        .into_iter()
        .next()
        .ok_or_else(|| MetadataError::NotFound(item.clone()))?;

    let duration = resource
        .content_details
        .duration
        .as_deref()
        .and_then(parse_iso8601_duration);
    if duration.is_none() {
        debug!(item = %item, raw = ?resource.content_details.duration, "Unparseable duration");
    }

    Ok(VideoMetadata {
        item_id: item.clone(),
        channel_id: resource.snippet.channel_id.map(ChannelId::new),
        title: resource.snippet.title,
        published_at: resource.snippet.published_at,
        duration,
    })
}

#[derive(Debug, Clone)]
pub struct YouTubeDataApi {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
}

impl YouTubeDataApi {
    pub fn new(
        api_url: impl Into<String>,
        api_key: impl Into<String>,
        proxy: Option<&str>,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let mut builder = reqwest::Client::builder().timeout(timeout);
        if let Some(proxy) = proxy {
            builder = builder.proxy(reqwest::Proxy::all(proxy)?);
        }
        Ok(YouTubeDataApi {
            client: builder.build()?,
            api_url: api_url.into(),
            api_key: api_key.into(),
        })
    }
}

impl MetadataSource for YouTubeDataApi {
    #[instrument(skip_all, fields(item = %item))]
    async fn video_metadata(&self, item: &ItemId) -> Result<VideoMetadata, MetadataError> {
        let response = self
            .client
            .get(&self.api_url)
            .query(&[
                ("key", self.api_key.as_str()),
                ("id", item.as_str()),
                ("part", "snippet,contentDetails"),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(MetadataError::Status(status.as_u16()));
        }
        let body: VideoListResponse = response
            .json()
            .await
            .map_err(|e| MetadataError::Malformed(e.to_string()))?;
        metadata_from_response(item, body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::extract::Query;
    use axum::routing::get;
    use std::collections::HashMap;

    #[test]
    fn iso_durations() {
        let cases = [
            ("PT59S", Some(59)),
            ("PT1M", Some(60)),
            ("PT1M5S", Some(65)),
            ("PT2H0M1S", Some(7201)),
            ("P1DT1S", Some(86_401)),
            ("P0D", Some(0)),
            ("P1W", Some(604_800)),
            ("PT", None),
            ("P", None),
            ("1M", None),
            ("PT1.5S", None),
            ("PT5S1M", None),
            ("P1Y", None),
            ("PTS", None),
        ];
        for (input, expected) in cases {
            assert_eq!(
                parse_iso8601_duration(input),
                expected.map(Duration::from_secs),
                "{}",
                input
            );
        }
    }

    const RESPONSE: &str = r#"{
      "kind": "youtube#videoListResponse",
      "items": [{
        "id": "dQw4w9WgXcQ",
        "snippet": {
          "publishedAt": "2025-06-01T11:59:30Z",
          "channelId": "UCabc",
          "title": "A short"
        },
        "contentDetails": { "duration": "PT42S", "dimension": "2d" }
      }]
    }"#;

    #[test]
    fn parses_video_resource() {
        let item = ItemId::new("dQw4w9WgXcQ");
        let meta = metadata_from_response(&item, serde_json::from_str(RESPONSE).unwrap()).unwrap();
        assert_eq!(meta.channel_id, Some(ChannelId::new("UCabc")));
        assert_eq!(meta.duration, Some(Duration::from_secs(42)));
        assert_eq!(meta.published_at.to_rfc3339(), "2025-06-01T11:59:30+00:00");
    }

    #[test]
    fn empty_items_is_not_found() {
        let item = ItemId::new("gone");
        let err = metadata_from_response(&item, serde_json::from_str(r#"{"items":[]}"#).unwrap())
            .unwrap_err();
        assert!(matches!(err, MetadataError::NotFound(_)));
    }

    #[tokio::test]
    async fn queries_api_with_key_and_parts() {
        let app = Router::new().route(
            "/videos",
            get(|Query(q): Query<HashMap<String, String>>| async move {
                assert_eq!(q.get("key").map(String::as_str), Some("k"));
                assert_eq!(q.get("part").map(String::as_str), Some("snippet,contentDetails"));
                assert_eq!(q.get("id").map(String::as_str), Some("dQw4w9WgXcQ"));
                RESPONSE
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let api = YouTubeDataApi::new(
            format!("http://{}/videos", addr),
            "k",
            None,
            Duration::from_secs(5),
        )
        .unwrap();
        let meta = api.video_metadata(&ItemId::new("dQw4w9WgXcQ")).await.unwrap();
        assert_eq!(meta.title.as_deref(), Some("A short"));
    }

    #[tokio::test]
    async fn non_success_status_is_reported() {
        let app = Router::new().route(
            "/videos",
            get(|| async { (axum::http::StatusCode::FORBIDDEN, "quota") }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let api = YouTubeDataApi::new(
            format!("http://{}/videos", addr),
            "k",
            None,
            Duration::from_secs(5),
        )
        .unwrap();
        let err = api.video_metadata(&ItemId::new("x")).await.unwrap_err();
        assert!(matches!(err, MetadataError::Status(403)));
    }
}

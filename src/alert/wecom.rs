//! WeCom (企业微信) group-bot alert sink.
//!
//! The bot accepts `{"msgtype":"text","text":{"content":...}}` and answers
//! with `{"errcode":0,"errmsg":"ok"}` on success. Any other status or a
//! non-zero `errcode` is a rejected delivery.

use std::time::Duration;

use serde::Deserialize;
use serde_json::json;

use super::{AlertError, AlertSink};

const DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct WeComResponse {
    #[serde(default = "missing_errcode")]
    errcode: i64,
    #[serde(default)]
    errmsg: String,
}

fn missing_errcode() -> i64 {
    -1
}

#[derive(Debug, Clone)]
pub struct WeComSink {
    client: reqwest::Client,
    webhook_url: String,
}

impl WeComSink {
    pub fn new(webhook_url: impl Into<String>) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(DELIVERY_TIMEOUT).build()?;
        Ok(WeComSink {
            client,
            webhook_url: webhook_url.into(),
        })
    }
}

pub(crate) fn text_payload(text: &str) -> serde_json::Value {
    json!({
        "msgtype": "text",
        "text": { "content": text },
    })
}

impl AlertSink for WeComSink {
    async fn deliver(&self, text: &str) -> Result<(), AlertError> {
        let response = self
            .client
            .post(&self.webhook_url)
            .json(&text_payload(text))
            .send()
            .await?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(AlertError::Rejected(format!("HTTP {}", status)));
        }

        let body: WeComResponse = response.json().await?;
        if body.errcode != 0 {
            return Err(AlertError::Rejected(format!(
                "errcode {}: {}",
                body.errcode, body.errmsg
            )));
        }
        Ok(())
    }
}

//! Client for the external video-metadata extractor (§4.12).
//!
//! A thin `reqwest` wrapper; failures are never retried, matching the
//! `video_change` handler's "fall back to URL-guessed format" policy (§4.9).

use serde::Deserialize;
use std::time::Duration;

use watch_party_types::VideoFormat;

const EXTRACT_TIMEOUT_SECS: u64 = 15;

#[derive(Debug, Clone, Deserialize)]
struct ExtractResponseEnvelope {
    result: ExtractResultWire,
}

#[derive(Debug, Clone, Deserialize)]
struct ExtractResultWire {
    #[serde(default)]
    stream_url: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    format: Option<String>,
    #[serde(default)]
    duration: f64,
    #[serde(default)]
    user_agent: String,
    #[serde(default)]
    referer: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExtractResult {
    pub stream_url: String,
    pub title: String,
    pub format: VideoFormat,
    pub duration: f64,
    pub user_agent: String,
    pub referer: String,
}

fn parse_format(raw: Option<&str>, fallback_url: &str) -> VideoFormat {
    raw.and_then(VideoFormat::parse)
        .unwrap_or_else(|| VideoFormat::guess_from_url(fallback_url))
}

pub struct Extractor {
    client: reqwest::Client,
    base_url: String,
}

impl Extractor {
    pub fn new(base_url: String) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(EXTRACT_TIMEOUT_SECS))
            .build()?;
        Ok(Self { client, base_url: base_url.trim_end_matches('/').to_string() })
    }

    /// Calls the extractor for `url`. On any failure (network, timeout,
    /// non-2xx, malformed body) returns an error; the caller falls back to
    /// guessing the format from `url`'s suffix and keeps client-supplied
    /// fields, per §4.9.
    pub async fn extract(&self, url: &str) -> anyhow::Result<ExtractResult> {
        let endpoint = format!(
            "{}/api/v1/ytdlp-extract?url={}",
            self.base_url,
            urlencoding::encode(url)
        );
        let response = self.client.get(&endpoint).send().await?;
        if !response.status().is_success() {
            anyhow::bail!("extractor returned {}", response.status());
        }
        let envelope: ExtractResponseEnvelope = response.json().await?;
        let format = parse_format(envelope.result.format.as_deref(), &envelope.result.stream_url);
        Ok(ExtractResult {
            stream_url: envelope.result.stream_url,
            title: envelope.result.title,
            format,
            duration: envelope.result.duration,
            user_agent: envelope.result.user_agent,
            referer: envelope.result.referer,
        })
    }
}

//! HTTP client for the upstream synthesis service.
//!
//! The neural engine is an external collaborator: we send text plus voice
//! parameters and consume the returned PCM byte stream. Validation of the
//! payload is the service's concern; ours is mapping transport failures
//! into the retry taxonomy.

use bytes::Bytes;
use serde::Serialize;
use tracing::debug;

use crate::config::SynthesisConfig;
use crate::error::{Error, Result};

#[derive(Debug, Serialize)]
struct SynthesisBody<'a> {
    text: &'a str,
    voice: &'a str,
    speed: f32,
}

/// Client for one synthesis endpoint.
pub struct SynthesisClient {
    http: reqwest::Client,
    config: SynthesisConfig,
}

impl SynthesisClient {
    pub fn new(config: SynthesisConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        Ok(Self { http, config })
    }

    pub fn config(&self) -> &SynthesisConfig {
        &self.config
    }

    /// Synthesize one text segment, returning its PCM bytes.
    pub async fn synthesize(&self, text: &str) -> Result<Bytes> {
        let body = SynthesisBody {
            text,
            voice: &self.config.voice,
            speed: self.config.speed,
        };
        debug!(endpoint = %self.config.endpoint, chars = text.len(), "requesting synthesis");

        let response = self
            .http
            .post(&self.config.endpoint)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(Error::RateLimited(format!(
                "synthesis endpoint throttled request ({} chars)",
                text.len()
            )));
        }
        if status.is_server_error() {
            return Err(Error::Server {
                status: status.as_u16(),
                message: "synthesis service failed".into(),
            });
        }
        if status.is_client_error() {
            return Err(Error::Client {
                status: status.as_u16(),
                message: "synthesis request rejected".into(),
            });
        }

        let bytes = response.bytes().await?;
        debug!(bytes = bytes.len(), "synthesis segment received");
        Ok(bytes)
    }
}

/// Split input text into synthesis segments at sentence boundaries,
/// merging fragments shorter than `min_len` into their neighbor.
pub fn split_segments(text: &str, min_len: usize) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();

    for piece in text.split_inclusive(['.', '!', '?']) {
        current.push_str(piece);
        if current.trim().len() >= min_len {
            segments.push(current.trim().to_string());
            current.clear();
        }
    }
    let tail = current.trim();
    if !tail.is_empty() {
        segments.push(tail.to_string());
    }
    segments
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_sentence_boundaries() {
        let segments = split_segments("Hello there. How are you today? Fine.", 4);
        assert_eq!(
            segments,
            vec!["Hello there.", "How are you today?", "Fine."]
        );
    }

    #[test]
    fn merges_short_fragments_forward() {
        let segments = split_segments("Hi. This one is long enough to stand alone.", 10);
        assert_eq!(segments.len(), 1);
        assert!(segments[0].starts_with("Hi."));
        assert!(segments[0].ends_with("alone."));
    }

    #[test]
    fn unterminated_tail_is_kept() {
        let segments = split_segments("No punctuation at all", 4);
        assert_eq!(segments, vec!["No punctuation at all"]);
    }

    #[test]
    fn empty_text_yields_nothing() {
        assert!(split_segments("", 4).is_empty());
        assert!(split_segments("   ", 4).is_empty());
    }
}

pub mod payload;

use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::fetcher::ResponseRecord;
use crate::links::Link;

/// Substring identifying the GraphQL call that returns a single post.
pub const DEFAULT_ENDPOINT_MARKER: &str = "TweetResultByRestId";

/// Fixed-shape metadata for one post. `None` means "not available".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TweetMetadata {
    pub text: Option<String>,
    pub username: Option<String>,
    pub date: Option<String>,
    pub comment_count: Option<u64>,
    pub like_count: Option<u64>,
    pub share_count: Option<u64>,
}

impl TweetMetadata {
    /// Record returned when no matching response was observed.
    pub fn not_available(username: Option<String>) -> Self {
        TweetMetadata {
            username,
            ..Default::default()
        }
    }

    /// True when nothing beyond the URL-derived username was found.
    pub fn is_empty(&self) -> bool {
        self.text.is_none()
            && self.date.is_none()
            && self.comment_count.is_none()
            && self.like_count.is_none()
            && self.share_count.is_none()
    }

    fn from_legacy(legacy: &Value, username: Option<String>) -> Self {
        TweetMetadata {
            text: payload::string_field(legacy, "full_text"),
            username,
            date: payload::string_field(legacy, "created_at"),
            comment_count: payload::count_field(legacy, "reply_count"),
            like_count: payload::count_field(legacy, "favorite_count"),
            share_count: payload::count_field(legacy, "retweet_count"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtractError {
    #[error("response body for {url} was not available")]
    MissingBody { url: String },

    #[error("invalid JSON payload: {0}")]
    InvalidJson(String),

    #[error("payload is missing `{step}`")]
    MissingPath { step: &'static str },
}

/// Pull post metadata out of the responses captured while `link` loaded.
///
/// Matching responses are tried in arrival order; the first one that yields a
/// post record wins. If none do, the first failure is returned.
pub fn extract_metadata(
    link: &Link,
    responses: &[ResponseRecord],
    marker: &str,
) -> Result<TweetMetadata, ExtractError> {
    let username = link.username();
    let mut first_err = None;

    for record in responses.iter().filter(|r| r.url.contains(marker)) {
        match parse_record(record, username.clone()) {
            Ok(meta) => return Ok(meta),
            Err(e) => {
                debug!("Unusable {:?} response {} for {}: {}", record.kind, record.url, link, e);
                first_err.get_or_insert(e);
            }
        }
    }

    match first_err {
        Some(e) => Err(e),
        None => Ok(TweetMetadata::not_available(username)),
    }
}

fn parse_record(
    record: &ResponseRecord,
    username: Option<String>,
) -> Result<TweetMetadata, ExtractError> {
    let body = record
        .body
        .as_deref()
        .ok_or_else(|| ExtractError::MissingBody {
            url: record.url.clone(),
        })?;
    let json: Value =
        serde_json::from_str(body).map_err(|e| ExtractError::InvalidJson(e.to_string()))?;
    let legacy = payload::legacy_record(&json)?;
    Ok(TweetMetadata::from_legacy(legacy, username))
}

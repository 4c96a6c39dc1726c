use serde_json::Value;

use super::ExtractError;

/// Walk `data.tweetResult.result` down to the post's `legacy` object.
///
/// Posts with restricted visibility are wrapped one level deeper, under
/// `result.tweet`.
pub fn legacy_record(payload: &Value) -> Result<&Value, ExtractError> {
    let data = step(payload, "data")?;
    let tweet_result = step(data, "tweetResult")?;
    let mut result = step(tweet_result, "result")?;

    if result.get("__typename").and_then(Value::as_str) == Some("TweetWithVisibilityResults") {
        result = step(result, "tweet")?;
    }

    let legacy = step(result, "legacy")?;
    if !legacy.is_object() {
        return Err(ExtractError::MissingPath { step: "legacy" });
    }
    Ok(legacy)
}

fn step<'a>(value: &'a Value, key: &'static str) -> Result<&'a Value, ExtractError> {
    match value.get(key) {
        Some(Value::Null) | None => Err(ExtractError::MissingPath { step: key }),
        Some(next) => Ok(next),
    }
}

pub fn string_field(legacy: &Value, key: &str) -> Option<String> {
    legacy.get(key).and_then(Value::as_str).map(str::to_string)
}

/// Counts arrive as JSON numbers; older payloads sometimes quote them.
pub fn count_field(legacy: &Value, key: &str) -> Option<u64> {
    match legacy.get(key)? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

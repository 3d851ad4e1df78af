//! Small shared helpers for URL building and timestamp normalization.

use crate::error::Result;
use chrono::{DateTime, Utc};

/// Normalize a timestamp to `%Y-%m-%dT%H:%M:%SZ` in UTC.
///
/// Values that do not parse as RFC 3339 (e.g. bare dates used as initial
/// watermarks) are passed through unchanged.
pub fn utc_format(value: &str) -> String {
    match DateTime::parse_from_rfc3339(value) {
        Ok(parsed) => parsed
            .with_timezone(&Utc)
            .format("%Y-%m-%dT%H:%M:%SZ")
            .to_string(),
        Err(_) => value.to_string(),
    }
}

/// Build `{base}/{path}?{query}` with the query pairs sorted by key and
/// form-encoded.
pub(crate) fn build_url(base: &str, path: &str, query: &[(String, String)]) -> Result<String> {
    let mut pairs: Vec<&(String, String)> = query.iter().collect();
    pairs.sort_by(|a, b| a.0.cmp(&b.0));

    let joined = format!("{}/{}", base.trim_end_matches('/'), path);
    if pairs.is_empty() {
        return Ok(joined);
    }
    let url = url::Url::parse_with_params(&joined, pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .map_err(|e| anyhow::anyhow!("invalid URL '{}': {}", joined, e))?;
    Ok(url.to_string())
}

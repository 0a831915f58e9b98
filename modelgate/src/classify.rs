//! Map vendor failures (status codes, error bodies, stream error events)
//! onto [`ErrorKind`].

use crate::error::{ErrorKind, ProviderError};
use crate::sanitize::sanitize_api_error;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::time::Duration;

/// Ordered, case-insensitive substring markers for one vendor.
#[derive(Debug)]
pub struct ErrorTable {
    pub provider: &'static str,
    pub markers: &'static [(&'static str, ErrorKind)],
}

/// Checked before any vendor marker: these phrases are unambiguous even
/// inside a generic `invalid_request_error`.
const CONTEXT_MARKERS: &[(&str, ErrorKind)] = &[
    ("context length", ErrorKind::ContextLengthExceeded),
    ("context_length_exceeded", ErrorKind::ContextLengthExceeded),
    ("maximum context", ErrorKind::ContextLengthExceeded),
    ("context window", ErrorKind::ContextLengthExceeded),
    ("prompt is too long", ErrorKind::ContextLengthExceeded),
    ("too many tokens", ErrorKind::ContextLengthExceeded),
];

const COMMON_MARKERS: &[(&str, ErrorKind)] = &[
    ("invalid api key", ErrorKind::Authentication),
    ("invalid_api_key", ErrorKind::Authentication),
    ("unauthenticated", ErrorKind::Authentication),
    ("unauthorized", ErrorKind::Authentication),
    ("rate limit", ErrorKind::RateLimited),
    ("rate_limit", ErrorKind::RateLimited),
    ("too many requests", ErrorKind::RateLimited),
    ("overloaded", ErrorKind::ServerError),
];

/// Classify by HTTP status alone.
pub fn classify_status(status: u16) -> ErrorKind {
    match status {
        401 | 403 => ErrorKind::Authentication,
        429 => ErrorKind::RateLimited,
        408 | 504 => ErrorKind::Timeout,
        400 | 404 | 409 | 413 | 422 => ErrorKind::Validation,
        500..=599 => ErrorKind::ServerError,
        _ => ErrorKind::Unknown,
    }
}

fn find_marker(markers: &[(&str, ErrorKind)], lower: &str) -> Option<ErrorKind> {
    markers
        .iter()
        .find(|(marker, _)| lower.contains(marker))
        .map(|(_, kind)| *kind)
}

/// Classify a failure from its status (absent for in-stream errors) and
/// body text.
///
/// 401/403/429 are decided by status. Otherwise context-length markers win,
/// then the vendor table, then the shared markers, then the status fallback.
pub fn classify(table: &ErrorTable, status: Option<u16>, body: &str) -> ErrorKind {
    if let Some(code @ (401 | 403 | 429)) = status {
        return classify_status(code);
    }

    let lower = body.to_lowercase();
    find_marker(CONTEXT_MARKERS, &lower)
        .or_else(|| find_marker(table.markers, &lower))
        .or_else(|| find_marker(COMMON_MARKERS, &lower))
        .unwrap_or_else(|| status.map(classify_status).unwrap_or(ErrorKind::Unknown))
}

/// Pull the human message out of a vendor error body.
///
/// Understands `{"error":{"message"}}`, `{"message"}`, `{"Message"}` and
/// `{"error":"..."}`; anything else is returned as-is.
pub fn extract_message(body: &str) -> String {
    let text = match serde_json::from_str::<Value>(body) {
        Ok(value) => message_from_json(&value).unwrap_or_else(|| body.to_string()),
        Err(_) => body.to_string(),
    };
    sanitize_api_error(&text)
}

fn message_from_json(value: &Value) -> Option<String> {
    // Gemini streams errors wrapped in a one-element array.
    let value = match value {
        Value::Array(items) => items.first()?,
        other => other,
    };
    let candidates = [
        value.pointer("/error/message"),
        value.get("message"),
        value.get("Message"),
        value.get("error"),
        value.get("detail"),
    ];
    candidates
        .into_iter()
        .flatten()
        .find_map(|v| v.as_str().map(str::to_string))
}

/// Parse a `Retry-After` header value: delay-seconds or an HTTP-date.
pub fn parse_retry_after_header(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<f64>() {
        return seconds(secs);
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?;
    let delta = at.with_timezone(&Utc) - Utc::now();
    Some(delta.to_std().unwrap_or(Duration::ZERO))
}

/// Find a retry hint inside an error body: Gemini's `retryDelay: "30s"`
/// or free text such as `retry after: 2.5`.
pub fn retry_after_from_body(body: &str) -> Option<Duration> {
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        let value = match &value {
            Value::Array(items) => items.first().cloned().unwrap_or(Value::Null),
            other => other.clone(),
        };
        let details = value.pointer("/error/details").and_then(Value::as_array);
        for detail in details.into_iter().flatten() {
            if let Some(delay) = detail.get("retryDelay").and_then(Value::as_str) {
                if let Some(secs) = delay.strip_suffix('s') {
                    if let Some(delay) = secs.parse::<f64>().ok().and_then(seconds) {
                        return Some(delay);
                    }
                }
            }
        }
    }
    parse_retry_after_text(body)
}

/// Find `retry-after: N` (seconds) in free text.
pub fn parse_retry_after_text(msg: &str) -> Option<Duration> {
    let lower = msg.to_lowercase();
    for prefix in &[
        "retry-after:",
        "retry_after:",
        "retry-after ",
        "retry_after ",
        "retry after ",
    ] {
        if let Some(pos) = lower.find(prefix) {
            let after = &lower[pos + prefix.len()..];
            let num_str: String = after
                .trim()
                .chars()
                .take_while(|c| c.is_ascii_digit() || *c == '.')
                .collect();
            if let Some(delay) = num_str.parse::<f64>().ok().and_then(seconds) {
                return Some(delay);
            }
        }
    }
    None
}

/// Vendor-supplied seconds; `None` when negative, NaN or too large for a
/// `Duration`.
fn seconds(secs: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(secs).ok()
}

/// Build the classified error for a non-2xx HTTP response.
pub fn from_http(
    table: &ErrorTable,
    status: u16,
    retry_after_header: Option<&str>,
    body: &str,
) -> ProviderError {
    let kind = classify(table, Some(status), body);
    let mut message = extract_message(body);
    if message.is_empty() {
        message = format!("HTTP {status}");
    }
    let retry_after = retry_after_header
        .and_then(parse_retry_after_header)
        .or_else(|| retry_after_from_body(body));
    ProviderError::Api {
        provider: table.provider.to_string(),
        kind,
        status: Some(status),
        message,
        retry_after,
    }
}

/// Classify an error that arrived inside a stream (no HTTP status).
pub fn from_stream(table: &ErrorTable, body: &str) -> (ErrorKind, String) {
    let kind = classify(table, None, body);
    (kind, extract_message(body))
}

#[cfg(test)]
mod tests {
    use super::*;

    static TEST_TABLE: ErrorTable = ErrorTable {
        provider: "test",
        markers: &[
            ("resource_exhausted", ErrorKind::RateLimited),
            ("overloaded_error", ErrorKind::ServerError),
        ],
    };

    #[test]
    fn status_fallback() {
        assert_eq!(classify_status(401), ErrorKind::Authentication);
        assert_eq!(classify_status(403), ErrorKind::Authentication);
        assert_eq!(classify_status(429), ErrorKind::RateLimited);
        assert_eq!(classify_status(400), ErrorKind::Validation);
        assert_eq!(classify_status(404), ErrorKind::Validation);
        assert_eq!(classify_status(408), ErrorKind::Timeout);
        assert_eq!(classify_status(504), ErrorKind::Timeout);
        assert_eq!(classify_status(500), ErrorKind::ServerError);
        assert_eq!(classify_status(503), ErrorKind::ServerError);
        assert_eq!(classify_status(302), ErrorKind::Unknown);
    }

    #[test]
    fn context_length_beats_generic_validation() {
        let body = r#"{"error":{"type":"invalid_request_error","message":"This model's maximum context length is 8192 tokens"}}"#;
        assert_eq!(
            classify(&TEST_TABLE, Some(400), body),
            ErrorKind::ContextLengthExceeded
        );
    }

    #[test]
    fn auth_status_wins_over_body() {
        assert_eq!(
            classify(&TEST_TABLE, Some(401), "rate limit"),
            ErrorKind::Authentication
        );
    }

    #[test]
    fn vendor_markers_apply_to_stream_errors() {
        assert_eq!(
            classify(&TEST_TABLE, None, r#"{"type":"overloaded_error"}"#),
            ErrorKind::ServerError
        );
        assert_eq!(
            classify(&TEST_TABLE, Some(400), "RESOURCE_EXHAUSTED"),
            ErrorKind::RateLimited
        );
        assert_eq!(classify(&TEST_TABLE, None, "weird"), ErrorKind::Unknown);
    }

    #[test]
    fn extracts_nested_and_flat_messages() {
        assert_eq!(
            extract_message(r#"{"error":{"message":"bad key"}}"#),
            "bad key"
        );
        assert_eq!(extract_message(r#"{"message":"throttled"}"#), "throttled");
        assert_eq!(extract_message(r#"{"error":"model not found"}"#), "model not found");
        assert_eq!(
            extract_message(r#"[{"error":{"message":"quota"}}]"#),
            "quota"
        );
        assert_eq!(extract_message("plain text"), "plain text");
    }

    #[test]
    fn retry_after_seconds_and_date() {
        assert_eq!(parse_retry_after_header("5"), Some(Duration::from_secs(5)));
        assert_eq!(
            parse_retry_after_header("1.5"),
            Some(Duration::from_millis(1500))
        );
        // A date in the past means "now".
        assert_eq!(
            parse_retry_after_header("Wed, 21 Oct 2015 07:28:00 GMT"),
            Some(Duration::ZERO)
        );
        assert_eq!(parse_retry_after_header("soon"), None);
    }

    #[test]
    fn retry_after_from_gemini_details() {
        let body = r#"{"error":{"code":429,"status":"RESOURCE_EXHAUSTED","details":[{"@type":"type.googleapis.com/google.rpc.RetryInfo","retryDelay":"7s"}]}}"#;
        assert_eq!(retry_after_from_body(body), Some(Duration::from_secs(7)));
    }

    #[test]
    fn retry_after_from_text() {
        assert_eq!(
            parse_retry_after_text("Rate limited. retry_after: 2.5 seconds"),
            Some(Duration::from_millis(2500))
        );
        assert_eq!(parse_retry_after_text("500 Internal Server Error"), None);
    }

    #[test]
    fn oversized_retry_hints_are_ignored() {
        assert_eq!(parse_retry_after_header("1e30"), None);
        assert_eq!(parse_retry_after_header("-1"), None);
        assert_eq!(parse_retry_after_header("NaN"), None);
        let body = r#"{"error":{"details":[{"retryDelay":"1e30s"}]}}"#;
        assert_eq!(retry_after_from_body(body), None);
        assert_eq!(
            parse_retry_after_text("retry after 99999999999999999999999"),
            None
        );
    }

    #[test]
    fn from_http_prefers_header() {
        let err = from_http(&TEST_TABLE, 429, Some("3"), r#"{"message":"slow down"}"#);
        assert_eq!(err.kind(), ErrorKind::RateLimited);
        assert_eq!(err.retry_after(), Some(Duration::from_secs(3)));
        assert_eq!(err.status(), Some(429));
        assert_eq!(err.message(), "slow down");
    }
}

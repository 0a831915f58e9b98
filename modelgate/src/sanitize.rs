//! Scrub credentials out of vendor error text before it reaches logs or users.

const MAX_API_ERROR_CHARS: usize = 240;
const REDACTED: &str = "[REDACTED]";

/// Prefixes of vendor credentials: OpenAI/Anthropic keys, Google API keys,
/// AWS access key ids, Slack tokens that leak through proxies.
const SECRET_PREFIXES: [&str; 6] = ["sk-", "AIza", "AKIA", "ASIA", "xoxb-", "xoxp-"];

fn is_secret_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':')
}

fn token_end(input: &str, from: usize) -> usize {
    let mut end = from;
    for (i, c) in input[from..].char_indices() {
        if is_secret_char(c) {
            end = from + i + c.len_utf8();
        } else {
            break;
        }
    }
    end
}

/// Redact every token that starts with one of `prefixes`.
fn redact_prefixed(input: &str, prefixes: &[&str], keep_prefix: bool) -> String {
    let mut scrubbed = input.to_string();

    for prefix in prefixes {
        let mut search_from = 0;
        while let Some(rel) = scrubbed[search_from..].find(prefix) {
            let start = search_from + rel;
            let content_start = start + prefix.len();
            let end = token_end(&scrubbed, content_start);

            // A bare prefix is not a secret; keep scanning past it.
            if end == content_start {
                search_from = content_start;
                continue;
            }

            let replace_from = if keep_prefix { content_start } else { start };
            scrubbed.replace_range(replace_from..end, REDACTED);
            search_from = replace_from + REDACTED.len();
        }
    }

    scrubbed
}

/// Scrub known secret-like tokens and `key=` query values from a string.
pub fn scrub_secret_patterns(input: &str) -> String {
    let scrubbed = redact_prefixed(input, &SECRET_PREFIXES, false);
    redact_prefixed(&scrubbed, &["key=", "api_key="], true)
}

/// Scrub secrets and truncate to a displayable length.
pub fn sanitize_api_error(input: &str) -> String {
    let scrubbed = scrub_secret_patterns(input.trim());

    if scrubbed.chars().count() <= MAX_API_ERROR_CHARS {
        return scrubbed;
    }

    let mut end = MAX_API_ERROR_CHARS;
    while end > 0 && !scrubbed.is_char_boundary(end) {
        end -= 1;
    }

    format!("{}...", &scrubbed[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scrubs_openai_style_keys() {
        let out = scrub_secret_patterns("Incorrect API key provided: sk-proj-abc123XYZ.");
        assert_eq!(out, "Incorrect API key provided: [REDACTED]");
    }

    #[test]
    fn scrubs_google_key_query_param() {
        let out = scrub_secret_patterns("GET /v1beta/models?key=abc_123-def failed");
        assert_eq!(out, "GET /v1beta/models?key=[REDACTED] failed");
        let out = scrub_secret_patterns("key AIzaSyD-123 is invalid");
        assert_eq!(out, "key [REDACTED] is invalid");
    }

    #[test]
    fn bare_prefix_is_kept() {
        assert_eq!(scrub_secret_patterns("ask- me"), "ask- me");
    }

    #[test]
    fn truncates_long_messages_on_char_boundary() {
        let long = "é".repeat(400);
        let out = sanitize_api_error(&long);
        assert!(out.ends_with("..."));
        assert!(out.chars().count() <= MAX_API_ERROR_CHARS + 3);
    }
}

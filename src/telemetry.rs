//! Per-attempt telemetry with cookie redaction.
//!
//! Every upstream attempt emits one structured event. Cookie material and
//! values behind sensitive keys never reach the log stream.

use crate::grok::Outcome;

/// Keys whose values are always redacted from error snippets.
const SENSITIVE_KEYS: &[&str] = &[
    "cookie",
    "authorization",
    "password",
    "token",
    "bearer",
    "set-cookie",
];

const REDACTED: &str = "[REDACTED]";

/// Maximum characters of an error snippet retained in telemetry.
const SNIPPET_LIMIT: usize = 256;

/// Characters that terminate a secret value in `key=value` / `"key": "value"`
/// shapes.
fn is_value_terminator(c: char) -> bool {
    matches!(c, '"' | '\'' | ';' | ',' | '}' | '&' | '\n' | '\r')
}

/// Redact values that follow a sensitive key in either JSON-ish
/// (`"cookie": "..."`) or header-ish (`cookie=...;`) form.
fn redact_sensitive_values(text: &str) -> String {
    let mut result = text.to_string();
    for key in SENSITIVE_KEYS {
        let lower = result.to_lowercase();
        let mut output = String::with_capacity(result.len());
        let mut cursor = 0;

        while let Some(found) = lower[cursor..].find(key) {
            let key_start = cursor + found;
            let key_end = key_start + key.len();
            output.push_str(&result[cursor..key_end]);

            // Skip separators between the key and its value
            let mut value_start = key_end;
            let bytes = result.as_bytes();
            while value_start < result.len()
                && matches!(bytes[value_start], b':' | b'=' | b' ' | b'"' | b'\'')
            {
                output.push(bytes[value_start] as char);
                value_start += 1;
            }

            if value_start >= result.len() {
                cursor = result.len();
                break;
            }

            // Replace the value run with the redaction marker
            let value_end = result[value_start..]
                .find(is_value_terminator)
                .map(|offset| value_start + offset)
                .unwrap_or(result.len());
            if value_end > value_start {
                output.push_str(REDACTED);
            }
            cursor = value_end;
        }
        output.push_str(&result[cursor..]);
        result = output;
    }
    result
}

/// Sanitize an upstream error snippet: drop the session's cookie material,
/// redact sensitive key-value pairs, and bound the length.
pub fn sanitize_snippet(snippet: &str, cookie_text: &str) -> String {
    let mut clean = if cookie_text.is_empty() {
        snippet.to_string()
    } else {
        snippet.replace(cookie_text, REDACTED)
    };
    clean = redact_sensitive_values(&clean);
    if clean.len() > SNIPPET_LIMIT {
        let mut end = SNIPPET_LIMIT;
        while !clean.is_char_boundary(end) {
            end -= 1;
        }
        clean.truncate(end);
    }
    clean
}

/// Emit the structured event and counter for one upstream attempt.
#[allow(clippy::too_many_arguments)]
pub fn record_attempt(
    request_id: &str,
    attempt: u32,
    session_id: &str,
    outcome: Outcome,
    http_status: Option<u16>,
    latency_ms: i64,
    error_snippet: Option<&str>,
    cookie_text: &str,
) {
    let sanitized = error_snippet.map(|snippet| sanitize_snippet(snippet, cookie_text));

    tracing::info!(
        target: "grok_proxy::attempt",
        request_id = %request_id,
        attempt = attempt,
        session_id = %session_id,
        outcome = %outcome,
        upstream_status = http_status.unwrap_or(0),
        latency_ms = latency_ms,
        error = sanitized.as_deref().unwrap_or(""),
        "Upstream attempt finished"
    );

    metrics::counter!("grokproxy_attempts_total", "outcome" => outcome.as_str()).increment(1);
}

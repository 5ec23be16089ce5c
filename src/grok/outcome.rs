use serde::{Deserialize, Serialize};

/// Body markers that identify a challenge-page interception rather than an
/// application-level answer.
const ANTI_BOT_MARKERS: &[&str] = &[
    "cloudflare",
    "cf-chl",
    "challenge-platform",
    "just a moment",
    "anti-bot",
];

/// Classification of a single upstream attempt. Exactly one class per
/// attempt; drives both the retry decision and session health accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    RateLimit,
    AuthFailure,
    AntiBot,
    Upstream5xx,
    ClientError,
    TransportError,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::RateLimit => "rate_limit",
            Outcome::AuthFailure => "auth_failure",
            Outcome::AntiBot => "anti_bot",
            Outcome::Upstream5xx => "upstream_5xx",
            Outcome::ClientError => "client_error",
            Outcome::TransportError => "transport_error",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }

    /// Whether the coordinator should rotate to the next session and retry.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Outcome::Success | Outcome::ClientError)
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub(crate) fn has_anti_bot_signature(body: &str) -> bool {
    let lower = body.to_lowercase();
    ANTI_BOT_MARKERS.iter().any(|marker| lower.contains(marker))
}

/// Classify an upstream HTTP status together with the first error body.
///
/// 403 and 503 are ambiguous: with a challenge signature in the body they are
/// anti-bot interceptions, otherwise an auth failure (403) or a plain
/// upstream outage (503).
pub fn classify_status(status: u16, body: &str) -> Outcome {
    match status {
        200..=299 => Outcome::Success,
        429 => Outcome::RateLimit,
        401 => Outcome::AuthFailure,
        403 => {
            if has_anti_bot_signature(body) {
                Outcome::AntiBot
            } else {
                Outcome::AuthFailure
            }
        }
        503 => {
            if has_anti_bot_signature(body) {
                Outcome::AntiBot
            } else {
                Outcome::Upstream5xx
            }
        }
        400 | 404 | 422 => Outcome::ClientError,
        _ if body.to_lowercase().contains("rate limit") => Outcome::RateLimit,
        500..=599 => Outcome::Upstream5xx,
        _ => Outcome::ClientError,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_statuses() {
        assert_eq!(classify_status(200, ""), Outcome::Success);
        assert_eq!(classify_status(201, ""), Outcome::Success);
    }

    #[test]
    fn test_rate_limit() {
        assert_eq!(classify_status(429, ""), Outcome::RateLimit);
        assert_eq!(
            classify_status(418, "You have hit a rate limit, slow down"),
            Outcome::RateLimit
        );
    }

    #[test]
    fn test_auth_failures() {
        assert_eq!(classify_status(401, ""), Outcome::AuthFailure);
        assert_eq!(
            classify_status(403, r#"{"error": "invalid session"}"#),
            Outcome::AuthFailure
        );
    }

    #[test]
    fn test_anti_bot_signatures() {
        assert_eq!(
            classify_status(403, "Request rejected by anti-bot rules"),
            Outcome::AntiBot
        );
        assert_eq!(
            classify_status(403, "<html>Attention: Cloudflare</html>"),
            Outcome::AntiBot
        );
        assert_eq!(
            classify_status(503, "<title>Just a moment...</title>"),
            Outcome::AntiBot
        );
        assert_eq!(
            classify_status(503, "/cdn-cgi/challenge-platform/orchestrate"),
            Outcome::AntiBot
        );
    }

    #[test]
    fn test_503_without_challenge_is_upstream_outage() {
        assert_eq!(
            classify_status(503, "service temporarily overloaded"),
            Outcome::Upstream5xx
        );
        assert_eq!(classify_status(503, ""), Outcome::Upstream5xx);
    }

    #[test]
    fn test_server_errors() {
        assert_eq!(classify_status(500, ""), Outcome::Upstream5xx);
        assert_eq!(classify_status(502, ""), Outcome::Upstream5xx);
        assert_eq!(classify_status(504, ""), Outcome::Upstream5xx);
    }

    #[test]
    fn test_client_errors_are_terminal() {
        for status in [400, 404, 422] {
            let outcome = classify_status(status, "");
            assert_eq!(outcome, Outcome::ClientError);
            assert!(!outcome.is_retryable());
        }
    }

    #[test]
    fn test_retryable_classes() {
        assert!(Outcome::RateLimit.is_retryable());
        assert!(Outcome::AuthFailure.is_retryable());
        assert!(Outcome::AntiBot.is_retryable());
        assert!(Outcome::Upstream5xx.is_retryable());
        assert!(Outcome::TransportError.is_retryable());
        assert!(!Outcome::Success.is_retryable());
    }
}

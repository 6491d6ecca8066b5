//! Provider failure classification
//!
//! Ordered matcher table: HTTP status shortcuts first, then
//! locale-agnostic substring patterns, then a billing/payment semantic
//! fallback, else `unknown`. New provider phrasing is a data change to
//! the tables below, not a code change.

use bpd_common::types::ErrorKind;

use super::gateway::GatewayError;

/// Substring pattern groups, checked in order against the lowercased
/// provider message. First group with any hit wins.
const TEXT_MATCHERS: &[(&[&str], ErrorKind)] = &[
    (
        &[
            "invalid api key",
            "incorrect api key",
            "invalid authentication",
            "authentication error",
            "api key not valid",
            "unauthorized",
            "permission denied",
        ],
        ErrorKind::InvalidCredentials,
    ),
    (
        &[
            "insufficient_quota",
            "quota exceeded",
            "exceeded your current quota",
            "resource_exhausted",
            "out of credits",
        ],
        ErrorKind::QuotaExhausted,
    ),
    (
        &["rate limit", "too many requests", "requests per minute"],
        ErrorKind::RateLimited,
    ),
    (
        &[
            "content policy",
            "content_policy",
            "content filter",
            "content_filter",
            "safety system",
            "blocked by safety",
            "flagged as potentially violating",
        ],
        ErrorKind::ContentSafetyViolation,
    ),
    (
        &[
            "service unavailable",
            "temporarily unavailable",
            "currently overloaded",
            "engine is overloaded",
        ],
        ErrorKind::ServiceUnavailable,
    ),
    (
        &[
            "internal server error",
            "server had an error",
            "internal error",
        ],
        ErrorKind::ServerError,
    ),
    (
        &["timed out", "timeout", "deadline exceeded"],
        ErrorKind::Timeout,
    ),
];

/// Semantic fallback: billing/payment phrasing means the account ran
/// dry even when the provider never says "quota"
const BILLING_FALLBACK: &[&str] = &[
    "billing",
    "payment",
    "insufficient funds",
    "credit balance",
    "purchase",
];

/// Classify a provider failure into the error taxonomy
pub fn classify(error: &GatewayError) -> ErrorKind {
    // HTTP status shortcuts take precedence over message text
    if let Some(status) = error.http_status {
        match status {
            401 => return ErrorKind::InvalidCredentials,
            402 => return ErrorKind::QuotaExhausted,
            429 => return ErrorKind::RateLimited,
            502 | 503 => return ErrorKind::ServiceUnavailable,
            500 | 504 => return ErrorKind::ServerError,
            _ => {}
        }
    }

    let message = error.message.to_lowercase();

    for (patterns, kind) in TEXT_MATCHERS {
        if patterns.iter().any(|p| message.contains(p)) {
            return *kind;
        }
    }

    if BILLING_FALLBACK.iter().any(|p| message.contains(p)) {
        return ErrorKind::QuotaExhausted;
    }

    ErrorKind::Unknown
}

//! Twitter (X) API adapters
//!
//! Twitter is a destination only.

mod write;

pub use write::TwitterPublisher;

use crate::http::RateLimitHeaders;

pub(crate) const RATE_LIMIT_HEADERS: RateLimitHeaders = RateLimitHeaders {
    limit: "x-rate-limit-limit",
    remaining: "x-rate-limit-remaining",
    reset: "x-rate-limit-reset",
};

pub(crate) const DEFAULT_BASE_URL: &str = "https://api.twitter.com";

/// Twitter rejects alt text above this many characters
pub(crate) const MAX_ALT_CHARS: usize = 1000;

/// Alt text cut to the service limit with a trailing ellipsis
pub(crate) fn clip_alt(alt: &str) -> String {
    if alt.chars().count() <= MAX_ALT_CHARS {
        return alt.to_string();
    }
    let mut clipped: String = alt.chars().take(MAX_ALT_CHARS - 3).collect();
    clipped.push_str("...");
    clipped
}

//! Signed, time-bound launch credentials.
//!
//! An LMS-side issuer mints a token binding a learner to a course; the
//! embedded content receives it as an opaque `token` query parameter and
//! validates it before trusting the launch. The secret lives with whoever
//! constructs [`LaunchTokenIssuer`]; nothing in here is a trust boundary on
//! its own.

pub mod clock;
pub mod token;

pub use clock::{Clock, ManualClock, SystemClock};
pub use token::{
    describe_expiry, LaunchClaims, LaunchTokenIssuer, RejectReason, TokenError, TokenRejection,
    TokenVerdict, DEFAULT_EXPIRATION,
};

use time::Duration;
use url::Url;

/// Name of the query parameter carrying the token.
pub const TOKEN_QUERY_PARAM: &str = "token";

/// Pulls the `token` query parameter out of an absolute or relative URL.
/// Returns `None` when the parameter is absent or empty.
pub fn token_from_url(input: &str) -> Option<String> {
    let base = Url::parse("http://localhost/").ok()?;
    let url = Url::options().base_url(Some(&base)).parse(input).ok()?;
    url.query_pairs()
        .find(|(key, _)| key == TOKEN_QUERY_PARAM)
        .map(|(_, value)| value.into_owned())
        .filter(|value| !value.is_empty())
}

/// Formats a remaining lifetime as `"4m 59s"`, or `"42s"` under a minute.
pub fn format_time_remaining(remaining: Duration) -> String {
    let seconds = remaining.whole_seconds().max(0);
    let minutes = seconds / 60;
    if minutes > 0 {
        format!("{minutes}m {}s", seconds % 60)
    } else {
        format!("{seconds}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_is_read_from_query() {
        assert_eq!(
            token_from_url("https://content.example/launch.html?course=7&token=abc_DEF-1").as_deref(),
            Some("abc_DEF-1")
        );
        assert_eq!(token_from_url("?token=xyz").as_deref(), Some("xyz"));
        assert_eq!(token_from_url("/launch.html?token="), None);
        assert_eq!(token_from_url("https://content.example/launch.html"), None);
    }

    #[test]
    fn remaining_time_formatting() {
        assert_eq!(format_time_remaining(Duration::milliseconds(299_999)), "4m 59s");
        assert_eq!(format_time_remaining(Duration::seconds(42)), "42s");
        assert_eq!(format_time_remaining(Duration::seconds(-3)), "0s");
    }
}

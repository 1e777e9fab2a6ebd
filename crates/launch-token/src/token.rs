use std::{fmt, sync::Arc};

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine as _;
use hmac::{Hmac, Mac};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;
use thiserror::Error;
use time::format_description::well_known::Rfc3339;
use time::{Duration, OffsetDateTime};

use crate::clock::{Clock, SystemClock};

type HmacSha256 = Hmac<Sha256>;

/// Lifetime of a freshly issued launch token.
pub const DEFAULT_EXPIRATION: Duration = Duration::minutes(5);

const SESSION_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Claims bound into a launch token. Timestamps are unix milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchClaims {
    pub user_id: String,
    pub course_id: String,
    pub issued_at: i64,
    pub expires_at: i64,
    pub session_id: String,
}

impl LaunchClaims {
    pub fn expires_at_time(&self) -> Option<OffsetDateTime> {
        from_unix_millis(self.expires_at)
    }

    pub fn issued_at_time(&self) -> Option<OffsetDateTime> {
        from_unix_millis(self.issued_at)
    }
}

/// Encoded form before base64: the claims plus their signature.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SignedToken {
    payload: LaunchClaims,
    signature: String,
}

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("failed to encode token payload: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("signing key rejected")]
    InvalidKey,
    #[error("expiration window of {0} does not fit a millisecond timestamp")]
    WindowOutOfRange(Duration),
}

/// Why a token was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    Malformed,
    SignatureMismatch,
    Expired,
    ParseError,
}

impl RejectReason {
    pub fn metric_label(&self) -> &'static str {
        match self {
            RejectReason::Malformed => "malformed",
            RejectReason::SignatureMismatch => "signature_mismatch",
            RejectReason::Expired => "expired",
            RejectReason::ParseError => "parse_error",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            RejectReason::Malformed => "Invalid token structure",
            RejectReason::SignatureMismatch => "Invalid signature",
            RejectReason::Expired => "Token expired",
            RejectReason::ParseError => "Token parsing error",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenRejection {
    pub reason: RejectReason,
    pub details: String,
    /// Set only for [`RejectReason::Expired`].
    pub expired_at: Option<OffsetDateTime>,
    /// Time elapsed since expiry, whole seconds. Set only for expired tokens.
    pub elapsed: Option<Duration>,
}

impl TokenRejection {
    fn new(reason: RejectReason, details: impl Into<String>) -> Self {
        Self {
            reason,
            details: details.into(),
            expired_at: None,
            elapsed: None,
        }
    }
}

/// Outcome of [`LaunchTokenIssuer::validate`]. Failures are values, never
/// panics or errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenVerdict {
    Valid {
        claims: LaunchClaims,
        time_remaining: Duration,
    },
    Invalid(TokenRejection),
}

impl TokenVerdict {
    pub fn is_valid(&self) -> bool {
        matches!(self, TokenVerdict::Valid { .. })
    }

    pub fn rejection(&self) -> Option<&TokenRejection> {
        match self {
            TokenVerdict::Invalid(rejection) => Some(rejection),
            TokenVerdict::Valid { .. } => None,
        }
    }
}

/// Issues and checks launch tokens against a shared secret.
#[derive(Clone)]
pub struct LaunchTokenIssuer {
    secret: Vec<u8>,
    window: Duration,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for LaunchTokenIssuer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LaunchTokenIssuer")
            .field("window", &self.window)
            .finish_non_exhaustive()
    }
}

impl LaunchTokenIssuer {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
            window: DEFAULT_EXPIRATION,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn expiration_window(&self) -> Duration {
        self.window
    }

    /// Mints a token binding `user_id` to `course_id` for the configured window.
    pub fn issue(&self, user_id: &str, course_id: &str) -> Result<String, TokenError> {
        let now = unix_millis(self.clock.now());
        let expires_at = i64::try_from(self.window.whole_milliseconds())
            .ok()
            .and_then(|window| now.checked_add(window))
            .ok_or(TokenError::WindowOutOfRange(self.window))?;
        let claims = LaunchClaims {
            user_id: user_id.to_owned(),
            course_id: course_id.to_owned(),
            issued_at: now,
            expires_at,
            session_id: generate_session_id(now),
        };
        let signature = self.sign(&serde_json::to_value(&claims)?)?;
        let token = SignedToken {
            payload: claims,
            signature,
        };
        Ok(URL_SAFE_NO_PAD.encode(serde_json::to_vec(&token)?))
    }

    pub fn validate(&self, token: &str) -> TokenVerdict {
        let envelope = match decode_envelope(token.trim()) {
            Ok(value) => value,
            Err(details) => {
                return TokenVerdict::Invalid(TokenRejection::new(RejectReason::ParseError, details))
            }
        };

        let (Some(payload), Some(signature)) = (
            envelope.get("payload"),
            envelope.get("signature").and_then(Value::as_str),
        ) else {
            return TokenVerdict::Invalid(TokenRejection::new(
                RejectReason::Malformed,
                "Token is missing required fields",
            ));
        };

        let claims: LaunchClaims = match serde_json::from_value(payload.clone()) {
            Ok(claims) => claims,
            Err(err) => {
                return TokenVerdict::Invalid(TokenRejection::new(
                    RejectReason::Malformed,
                    format!("Token payload is incomplete: {err}"),
                ))
            }
        };

        let expected = match self.sign(payload) {
            Ok(signature) => signature,
            Err(err) => {
                return TokenVerdict::Invalid(TokenRejection::new(
                    RejectReason::ParseError,
                    err.to_string(),
                ))
            }
        };
        if signature != expected {
            return TokenVerdict::Invalid(TokenRejection::new(
                RejectReason::SignatureMismatch,
                "Token signature verification failed. Token may have been tampered with.",
            ));
        }

        let now = unix_millis(self.clock.now());
        if now > claims.expires_at {
            let elapsed_secs = now.saturating_sub(claims.expires_at) / 1000;
            let expired_at = claims.expires_at_time();
            let mut rejection = TokenRejection::new(
                RejectReason::Expired,
                format!(
                    "Token expired {elapsed_secs} seconds ago. Please launch the content again from the LMS."
                ),
            );
            rejection.expired_at = expired_at;
            rejection.elapsed = Some(Duration::seconds(elapsed_secs));
            return TokenVerdict::Invalid(rejection);
        }

        let time_remaining = Duration::milliseconds(claims.expires_at.saturating_sub(now));
        TokenVerdict::Valid {
            claims,
            time_remaining,
        }
    }

    fn sign(&self, payload: &Value) -> Result<String, TokenError> {
        let canonical = serde_json::to_string(payload)?;
        let mut mac = HmacSha256::new_from_slice(&self.secret).map_err(|_| TokenError::InvalidKey)?;
        mac.update(canonical.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

/// Renders an expiry instant for humans, falling back to the raw millis.
pub fn describe_expiry(claims: &LaunchClaims) -> String {
    claims
        .expires_at_time()
        .and_then(|at| at.format(&Rfc3339).ok())
        .unwrap_or_else(|| claims.expires_at.to_string())
}

fn decode_envelope(token: &str) -> Result<Value, String> {
    let bytes = URL_SAFE_NO_PAD
        .decode(token)
        .or_else(|_| STANDARD.decode(token))
        .map_err(|err| format!("invalid base64 token: {err}"))?;
    serde_json::from_slice(&bytes).map_err(|err| format!("invalid token json: {err}"))
}

fn generate_session_id(now_ms: i64) -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..9)
        .map(|_| SESSION_ALPHABET[rng.gen_range(0..SESSION_ALPHABET.len())] as char)
        .collect();
    format!("sess_{suffix}_{now_ms}")
}

pub(crate) fn unix_millis(instant: OffsetDateTime) -> i64 {
    (instant.unix_timestamp_nanos() / 1_000_000) as i64
}

fn from_unix_millis(millis: i64) -> Option<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000).ok()
}

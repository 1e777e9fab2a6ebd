use std::time::Duration;

use launch_token::{LaunchTokenIssuer, DEFAULT_EXPIRATION};
use rand::RngCore;
use thiserror::Error;
use tracing::warn;

use crate::content::DEFAULT_ACK_TIMEOUT;
use crate::host::AckTarget;
use crate::origin::OriginAllowList;
use crate::window::TargetOrigin;

/// Local dev servers the content is usually served from.
pub const DEFAULT_ALLOWED_ORIGINS: [&str; 2] = ["http://localhost:5500", "http://127.0.0.1:5500"];

/// Longest launch token lifetime accepted from configuration.
pub const MAX_TOKEN_TTL: time::Duration = time::Duration::days(30);

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub allowed_origins: OriginAllowList,
    /// Target origin the content posts commands with.
    pub target_origin: TargetOrigin,
    pub ack_target: AckTarget,
    pub ack_timeout: Duration,
    pub token_secret: Option<String>,
    pub token_ttl: time::Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            allowed_origins: OriginAllowList::new(DEFAULT_ALLOWED_ORIGINS),
            target_origin: TargetOrigin::Any,
            ack_target: AckTarget::Any,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            token_secret: None,
            token_ttl: DEFAULT_EXPIRATION,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("allowed origin list is empty; no content could ever reach the host")]
    EmptyAllowList,
    #[error("ack timeout must be greater than zero")]
    ZeroAckTimeout,
    #[error("token lifetime must be positive, got {0} seconds")]
    NonPositiveTokenTtl(i64),
    #[error("token lifetime of {0} seconds exceeds the 30 day limit")]
    TokenTtlTooLong(i64),
}

impl RelayConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.allowed_origins.is_empty() {
            return Err(ConfigError::EmptyAllowList);
        }
        if self.ack_timeout.is_zero() {
            return Err(ConfigError::ZeroAckTimeout);
        }
        if !self.token_ttl.is_positive() {
            return Err(ConfigError::NonPositiveTokenTtl(self.token_ttl.whole_seconds()));
        }
        if self.token_ttl > MAX_TOKEN_TTL {
            return Err(ConfigError::TokenTtlTooLong(self.token_ttl.whole_seconds()));
        }
        Ok(())
    }

    /// Issuer keyed by the configured secret. Without one a random secret is
    /// generated, so tokens only validate within this process.
    pub fn token_issuer(&self) -> LaunchTokenIssuer {
        let secret = match &self.token_secret {
            Some(secret) if !secret.is_empty() => secret.clone(),
            _ => {
                warn!("no token secret configured, using an ephemeral one");
                let mut bytes = [0u8; 32];
                rand::thread_rng().fill_bytes(&mut bytes);
                hex::encode(bytes)
            }
        };
        LaunchTokenIssuer::new(secret.into_bytes()).with_window(self.token_ttl)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use launch_token::TokenVerdict;

    #[test]
    fn defaults_match_local_development() {
        let config = RelayConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.allowed_origins.is_allowed("http://localhost:5500"));
        assert!(config.allowed_origins.is_allowed("http://127.0.0.1:5500"));
        assert_eq!(config.ack_timeout, Duration::from_secs(5));
        assert_eq!(config.token_ttl, time::Duration::minutes(5));
    }

    #[test]
    fn validation_rejects_unusable_settings() {
        let config = RelayConfig {
            allowed_origins: OriginAllowList::parse_list(" , "),
            ..RelayConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::EmptyAllowList));

        let config = RelayConfig {
            ack_timeout: Duration::ZERO,
            ..RelayConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::ZeroAckTimeout));

        let config = RelayConfig {
            token_ttl: time::Duration::seconds(-3),
            ..RelayConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::NonPositiveTokenTtl(-3)));
    }

    #[test]
    fn token_ttl_is_capped() {
        let config = RelayConfig {
            token_ttl: MAX_TOKEN_TTL,
            ..RelayConfig::default()
        };
        assert!(config.validate().is_ok());
        assert!(config.token_issuer().issue("u1", "c1").is_ok());

        let config = RelayConfig {
            token_ttl: time::Duration::seconds(i64::MAX),
            ..RelayConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::TokenTtlTooLong(i64::MAX)));
    }

    #[test]
    fn shared_secret_is_stable_across_issuers() {
        let config = RelayConfig {
            token_secret: Some("course-secret".into()),
            ..RelayConfig::default()
        };
        let token = config.token_issuer().issue("u1", "c1").expect("issue");
        assert!(config.token_issuer().validate(&token).is_valid());
    }

    #[test]
    fn ephemeral_secrets_differ() {
        let config = RelayConfig::default();
        let token = config.token_issuer().issue("u1", "c1").expect("issue");
        assert!(matches!(
            config.token_issuer().validate(&token),
            TokenVerdict::Invalid(_)
        ));
    }
}

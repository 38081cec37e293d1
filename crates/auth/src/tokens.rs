//! HS256 token issuing and validation.

use std::time::Duration;

use chrono::{DateTime, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use tierguard_core::{OrganizationId, RoleId, UserId};

use crate::claims::{
    AccessClaims, ClaimSet, RefreshClaims, TokenKind, TokenValidationError, validate_window,
};

/// Freshly minted access + refresh pair.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    pub access_expires_at: DateTime<Utc>,
    pub refresh_expires_at: DateTime<Utc>,
}

impl core::fmt::Debug for TokenPair {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TokenPair")
            .field("token_type", &self.token_type)
            .field("access_expires_at", &self.access_expires_at)
            .field("refresh_expires_at", &self.refresh_expires_at)
            .finish_non_exhaustive()
    }
}

#[derive(Clone)]
pub struct TokenIssuer {
    encoding: EncodingKey,
    decoding: DecodingKey,
    access_ttl: chrono::Duration,
    refresh_ttl: chrono::Duration,
}

impl TokenIssuer {
    pub fn new(
        secret: &[u8],
        access_ttl: Duration,
        refresh_ttl: Duration,
    ) -> Result<Self, TokenValidationError> {
        if secret.is_empty() {
            return Err(TokenValidationError::Encoding(
                "signing secret must not be empty".to_string(),
            ));
        }
        Ok(Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            access_ttl: to_chrono(access_ttl)?,
            refresh_ttl: to_chrono(refresh_ttl)?,
        })
    }

    pub fn issue_pair(
        &self,
        user: UserId,
        role_id: Option<RoleId>,
        organization_id: Option<OrganizationId>,
    ) -> Result<TokenPair, TokenValidationError> {
        self.issue_pair_at(user, role_id, organization_id, Utc::now())
    }

    pub fn issue_pair_at(
        &self,
        user: UserId,
        role_id: Option<RoleId>,
        organization_id: Option<OrganizationId>,
        now: DateTime<Utc>,
    ) -> Result<TokenPair, TokenValidationError> {
        let access_expires_at = now + self.access_ttl;
        let refresh_expires_at = now + self.refresh_ttl;

        let access = AccessClaims {
            sub: user,
            typ: TokenKind::Access,
            role_id,
            organization_id,
            jti: Uuid::now_v7(),
            iat: now.timestamp(),
            nbf: now.timestamp(),
            exp: access_expires_at.timestamp(),
        };
        let refresh = RefreshClaims {
            sub: user,
            typ: TokenKind::Refresh,
            jti: Uuid::now_v7(),
            iat: now.timestamp(),
            nbf: now.timestamp(),
            exp: refresh_expires_at.timestamp(),
        };

        Ok(TokenPair {
            access_token: self.sign(&access)?,
            refresh_token: self.sign(&refresh)?,
            token_type: "Bearer".to_string(),
            access_expires_at,
            refresh_expires_at,
        })
    }

    pub fn validate_access(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<AccessClaims, TokenValidationError> {
        self.decode(token, now)
    }

    /// Signature and window only; whether the session is still live is the
    /// session store's call.
    pub fn validate_refresh(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<RefreshClaims, TokenValidationError> {
        self.decode(token, now)
    }

    fn sign<C: Serialize>(&self, claims: &C) -> Result<String, TokenValidationError> {
        jsonwebtoken::encode(&Header::new(Algorithm::HS256), claims, &self.encoding)
            .map_err(|e| TokenValidationError::Encoding(e.to_string()))
    }

    fn decode<C>(&self, token: &str, now: DateTime<Utc>) -> Result<C, TokenValidationError>
    where
        C: ClaimSet + DeserializeOwned,
    {
        let mut validation = Validation::new(Algorithm::HS256);
        // The time window is checked below against the caller's clock.
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.leeway = 0;
        validation.set_required_spec_claims(&["sub", "exp", "nbf", "iat"]);

        let data = jsonwebtoken::decode::<C>(token, &self.decoding, &validation).map_err(|e| {
            match e.kind() {
                ErrorKind::InvalidSignature => TokenValidationError::InvalidSignature,
                ErrorKind::ExpiredSignature => TokenValidationError::Expired,
                ErrorKind::ImmatureSignature => TokenValidationError::NotYetValid,
                _ => TokenValidationError::Malformed(e.to_string()),
            }
        })?;

        validate_window(&data.claims, now.timestamp())?;
        Ok(data.claims)
    }
}

fn to_chrono(ttl: Duration) -> Result<chrono::Duration, TokenValidationError> {
    chrono::Duration::from_std(ttl)
        .map_err(|e| TokenValidationError::Encoding(format!("token ttl out of range: {e}")))
}

impl core::fmt::Debug for TokenIssuer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TokenIssuer")
            .field("secret", &"<redacted>")
            .field("access_ttl", &self.access_ttl)
            .field("refresh_ttl", &self.refresh_ttl)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    const SECRET: &[u8] = b"test-secret-with-enough-entropy";

    fn issuer() -> TokenIssuer {
        TokenIssuer::new(
            SECRET,
            Duration::from_secs(15 * 60),
            Duration::from_secs(7 * 24 * 3600),
        )
        .unwrap()
    }

    #[test]
    fn access_roundtrip_carries_context() {
        let issuer = issuer();
        let user = UserId::new();
        let role = RoleId::new();
        let org = OrganizationId::new();
        let now = Utc::now();

        let pair = issuer.issue_pair_at(user, Some(role), Some(org), now).unwrap();
        let claims = issuer.validate_access(&pair.access_token, now).unwrap();

        assert_eq!(claims.sub, user);
        assert_eq!(claims.role_id, Some(role));
        assert_eq!(claims.organization_id, Some(org));
        assert_eq!(claims.exp - claims.iat, 15 * 60);
        assert_eq!(pair.token_type, "Bearer");
    }

    #[test]
    fn refresh_token_is_subject_only() {
        let issuer = issuer();
        let user = UserId::new();
        let now = Utc::now();
        let pair = issuer.issue_pair_at(user, Some(RoleId::new()), None, now).unwrap();

        let claims = issuer.validate_refresh(&pair.refresh_token, now).unwrap();
        assert_eq!(claims.sub, user);
        assert_eq!(claims.exp - claims.iat, 7 * 24 * 3600);
    }

    #[test]
    fn kinds_are_not_interchangeable() {
        let issuer = issuer();
        let now = Utc::now();
        let pair = issuer.issue_pair_at(UserId::new(), None, None, now).unwrap();

        assert_eq!(
            issuer.validate_refresh(&pair.access_token, now),
            Err(TokenValidationError::WrongKind {
                expected: TokenKind::Refresh
            })
        );
        // Missing role/org fields default to None, so shape alone would not catch this.
        assert_eq!(
            issuer.validate_access(&pair.refresh_token, now),
            Err(TokenValidationError::WrongKind {
                expected: TokenKind::Access
            })
        );
    }

    #[test]
    fn same_second_refresh_tokens_differ() {
        let issuer = issuer();
        let user = UserId::new();
        let now = Utc::now();
        let a = issuer.issue_pair_at(user, None, None, now).unwrap();
        let b = issuer.issue_pair_at(user, None, None, now).unwrap();
        assert_ne!(a.refresh_token, b.refresh_token);
    }

    #[test]
    fn expired_and_future_tokens_are_rejected() {
        let issuer = issuer();
        let issued = Utc::now() - ChronoDuration::minutes(30);
        let pair = issuer.issue_pair_at(UserId::new(), None, None, issued).unwrap();

        assert_eq!(
            issuer.validate_access(&pair.access_token, Utc::now()),
            Err(TokenValidationError::Expired)
        );
        assert_eq!(
            issuer.validate_access(&pair.access_token, issued - ChronoDuration::seconds(5)),
            Err(TokenValidationError::NotYetValid)
        );
    }

    #[test]
    fn foreign_signature_is_rejected() {
        let other = TokenIssuer::new(
            b"a-different-secret",
            Duration::from_secs(60),
            Duration::from_secs(60),
        )
        .unwrap();
        let now = Utc::now();
        let pair = other.issue_pair_at(UserId::new(), None, None, now).unwrap();

        assert_eq!(
            issuer().validate_access(&pair.access_token, now),
            Err(TokenValidationError::InvalidSignature)
        );
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(matches!(
            issuer().validate_access("not.a.jwt", Utc::now()),
            Err(TokenValidationError::Malformed(_))
        ));
    }

    #[test]
    fn debug_redacts_secret() {
        let rendered = format!("{:?}", issuer());
        assert!(rendered.contains("<redacted>"));
        assert!(!rendered.contains("entropy"));
    }

    #[test]
    fn empty_secret_is_refused() {
        assert!(TokenIssuer::new(b"", Duration::from_secs(1), Duration::from_secs(1)).is_err());
    }
}

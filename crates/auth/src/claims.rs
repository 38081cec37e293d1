use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use tierguard_core::{OrganizationId, RoleId, UserId};

/// Discriminates the two token families so one can never stand in for the other.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    Access,
    Refresh,
}

/// Short-lived access token claims.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessClaims {
    /// Subject / principal identifier.
    pub sub: UserId,
    pub typ: TokenKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role_id: Option<RoleId>,
    /// Organization context selected at login/refresh.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<OrganizationId>,
    pub jti: Uuid,
    pub iat: i64,
    pub nbf: i64,
    pub exp: i64,
}

/// Long-lived refresh token claims. Subject only: no role or organization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshClaims {
    pub sub: UserId,
    pub typ: TokenKind,
    /// Keeps two tokens minted within the same second distinct.
    pub jti: Uuid,
    pub iat: i64,
    pub nbf: i64,
    pub exp: i64,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TokenValidationError {
    #[error("token has expired")]
    Expired,

    #[error("token not yet valid")]
    NotYetValid,

    #[error("invalid token time window (exp <= iat)")]
    InvalidTimeWindow,

    #[error("invalid token signature")]
    InvalidSignature,

    #[error("malformed token: {0}")]
    Malformed(String),

    #[error("expected a {expected:?} token")]
    WrongKind { expected: TokenKind },

    #[error("token encoding failed: {0}")]
    Encoding(String),
}

/// Claims shared by both token families.
pub trait ClaimSet {
    const KIND: TokenKind;

    fn kind(&self) -> TokenKind;
    fn issued_at(&self) -> i64;
    fn not_before(&self) -> i64;
    fn expires_at(&self) -> i64;
}

impl ClaimSet for AccessClaims {
    const KIND: TokenKind = TokenKind::Access;

    fn kind(&self) -> TokenKind {
        self.typ
    }
    fn issued_at(&self) -> i64 {
        self.iat
    }
    fn not_before(&self) -> i64 {
        self.nbf
    }
    fn expires_at(&self) -> i64 {
        self.exp
    }
}

impl ClaimSet for RefreshClaims {
    const KIND: TokenKind = TokenKind::Refresh;

    fn kind(&self) -> TokenKind {
        self.typ
    }
    fn issued_at(&self) -> i64 {
        self.iat
    }
    fn not_before(&self) -> i64 {
        self.nbf
    }
    fn expires_at(&self) -> i64 {
        self.exp
    }
}

/// Deterministically validate the claim window against `now` (unix seconds).
///
/// Runs after signature verification; it also rejects windows that were
/// signed inconsistent in the first place and tokens of the other family.
pub fn validate_window<C: ClaimSet>(claims: &C, now: i64) -> Result<(), TokenValidationError> {
    if claims.kind() != C::KIND {
        return Err(TokenValidationError::WrongKind { expected: C::KIND });
    }
    if claims.expires_at() <= claims.issued_at() {
        return Err(TokenValidationError::InvalidTimeWindow);
    }
    if now < claims.not_before() {
        return Err(TokenValidationError::NotYetValid);
    }
    if now >= claims.expires_at() {
        return Err(TokenValidationError::Expired);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn refresh(iat: i64, nbf: i64, exp: i64) -> RefreshClaims {
        RefreshClaims {
            sub: UserId::new(),
            typ: TokenKind::Refresh,
            jti: Uuid::now_v7(),
            iat,
            nbf,
            exp,
        }
    }

    #[test]
    fn window_checks() {
        assert_eq!(validate_window(&refresh(100, 100, 200), 150), Ok(()));
        assert_eq!(
            validate_window(&refresh(100, 100, 200), 200),
            Err(TokenValidationError::Expired)
        );
        assert_eq!(
            validate_window(&refresh(100, 120, 200), 110),
            Err(TokenValidationError::NotYetValid)
        );
        assert_eq!(
            validate_window(&refresh(200, 200, 200), 200),
            Err(TokenValidationError::InvalidTimeWindow)
        );
    }

    #[test]
    fn refresh_shape_with_access_kind_is_rejected() {
        let mut claims = refresh(100, 100, 200);
        claims.typ = TokenKind::Access;
        assert_eq!(
            validate_window(&claims, 150),
            Err(TokenValidationError::WrongKind {
                expected: TokenKind::Refresh
            })
        );
    }

    #[test]
    fn access_claims_omit_absent_context() {
        let claims = AccessClaims {
            sub: UserId::new(),
            typ: TokenKind::Access,
            role_id: None,
            organization_id: None,
            jti: Uuid::now_v7(),
            iat: 1,
            nbf: 1,
            exp: 2,
        };
        let json = serde_json::to_value(&claims).unwrap();
        assert!(json.get("role_id").is_none());
        assert!(json.get("organization_id").is_none());
        assert_eq!(json["typ"], "access");
    }
}

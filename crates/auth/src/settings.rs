use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::roles::RoleLevel;

/// How bulk session revocation finds a principal's refresh tokens.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionRevocation {
    /// Per-principal set of active tokens, maintained on issue/consume.
    #[default]
    PrincipalIndex,
    /// Scan every session key and compare its value. O(active sessions).
    KeyspaceScan,
}

/// Tunables for the engine, token issuer and session store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSettings {
    pub access_token_ttl: Duration,
    pub refresh_token_ttl: Duration,
    pub permission_cache_ttl: Duration,
    /// Principals at or above this level see every organization.
    pub platform_level_threshold: RoleLevel,
    /// Lowest level a custom role may be created with.
    pub custom_role_level_floor: RoleLevel,
    pub session_revocation: SessionRevocation,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            access_token_ttl: Duration::from_secs(15 * 60),
            refresh_token_ttl: Duration::from_secs(7 * 24 * 60 * 60),
            permission_cache_ttl: Duration::from_secs(5 * 60),
            platform_level_threshold: RoleLevel::saturating(76),
            custom_role_level_floor: RoleLevel::saturating(10),
            session_revocation: SessionRevocation::default(),
        }
    }
}

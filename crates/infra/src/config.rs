//! Process configuration loaded from the environment.
//!
//! | Variable | Default |
//! |---|---|
//! | `DATABASE_URL` | unset: in-memory directory |
//! | `REDIS_URL` | unset: in-memory cache store |
//! | `JWT_SECRET` | required, at least 32 bytes |
//! | `ACCESS_TOKEN_TTL_SECS` | 900 |
//! | `REFRESH_TOKEN_TTL_SECS` | 604800 |
//! | `PERMISSION_CACHE_TTL_SECS` | 300 |
//! | `PLATFORM_LEVEL_THRESHOLD` | 76 |
//! | `CUSTOM_ROLE_LEVEL_FLOOR` | 10 |
//! | `SESSION_REVOCATION` | `principal_index` (or `keyspace_scan`) |
//! | `ARGON2_MEMORY_KIB` / `ARGON2_ITERATIONS` / `ARGON2_PARALLELISM` | 19456 / 2 / 1 |
//! | `LOG_FORMAT` | `json` (or `pretty`) |
//! | `RUST_LOG` | `info` |

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use tierguard_auth::{AuthSettings, HashingCost, RoleLevel, SessionRevocation};
use tierguard_observability::{LogConfig, LogFormat};

const MIN_SECRET_LEN: usize = 32;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{key} is invalid: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// HMAC signing secret. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct SigningSecret(String);

impl SigningSecret {
    pub fn expose(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl core::fmt::Debug for SigningSecret {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("SigningSecret(<redacted>)")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub jwt_secret: SigningSecret,
    pub auth: AuthSettings,
    pub hashing: HashingCost,
    pub log: LogConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let jwt_secret = get("JWT_SECRET").ok_or(ConfigError::Missing("JWT_SECRET"))?;
        if jwt_secret.len() < MIN_SECRET_LEN {
            return Err(ConfigError::Invalid {
                key: "JWT_SECRET",
                reason: format!("must be at least {MIN_SECRET_LEN} bytes"),
            });
        }

        let defaults = AuthSettings::default();
        let auth = AuthSettings {
            access_token_ttl: secs(&get, "ACCESS_TOKEN_TTL_SECS", defaults.access_token_ttl)?,
            refresh_token_ttl: secs(&get, "REFRESH_TOKEN_TTL_SECS", defaults.refresh_token_ttl)?,
            permission_cache_ttl: secs(
                &get,
                "PERMISSION_CACHE_TTL_SECS",
                defaults.permission_cache_ttl,
            )?,
            platform_level_threshold: level(
                &get,
                "PLATFORM_LEVEL_THRESHOLD",
                defaults.platform_level_threshold,
            )?,
            custom_role_level_floor: level(
                &get,
                "CUSTOM_ROLE_LEVEL_FLOOR",
                defaults.custom_role_level_floor,
            )?,
            session_revocation: match get("SESSION_REVOCATION").as_deref() {
                None => defaults.session_revocation,
                Some("principal_index") => SessionRevocation::PrincipalIndex,
                Some("keyspace_scan") => SessionRevocation::KeyspaceScan,
                Some(other) => {
                    return Err(ConfigError::Invalid {
                        key: "SESSION_REVOCATION",
                        reason: format!(
                            "'{other}' is not one of 'principal_index', 'keyspace_scan'"
                        ),
                    });
                }
            },
        };
        if auth.access_token_ttl >= auth.refresh_token_ttl {
            return Err(ConfigError::Invalid {
                key: "ACCESS_TOKEN_TTL_SECS",
                reason: "must be shorter than REFRESH_TOKEN_TTL_SECS".to_string(),
            });
        }
        if auth.custom_role_level_floor.is_super() {
            return Err(ConfigError::Invalid {
                key: "CUSTOM_ROLE_LEVEL_FLOOR",
                reason: "must be below 100".to_string(),
            });
        }

        let cost_defaults = HashingCost::default();
        let hashing = HashingCost {
            memory_kib: parsed(&get, "ARGON2_MEMORY_KIB")?.unwrap_or(cost_defaults.memory_kib),
            iterations: parsed(&get, "ARGON2_ITERATIONS")?.unwrap_or(cost_defaults.iterations),
            parallelism: parsed(&get, "ARGON2_PARALLELISM")?.unwrap_or(cost_defaults.parallelism),
        };

        let log = LogConfig {
            filter: get("RUST_LOG").unwrap_or_else(|| "info".to_string()),
            format: match get("LOG_FORMAT") {
                Some(raw) => raw.parse::<LogFormat>().map_err(|e| ConfigError::Invalid {
                    key: "LOG_FORMAT",
                    reason: e.to_string(),
                })?,
                None => LogFormat::default(),
            },
        };

        Ok(Self {
            database_url: get("DATABASE_URL"),
            redis_url: get("REDIS_URL"),
            jwt_secret: SigningSecret(jwt_secret),
            auth,
            hashing,
            log,
        })
    }
}

fn parsed<T, G>(get: &G, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: core::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    get(key)
        .map(|raw| {
            raw.parse::<T>().map_err(|e| ConfigError::Invalid {
                key,
                reason: e.to_string(),
            })
        })
        .transpose()
}

fn secs<G>(get: &G, key: &'static str, default: Duration) -> Result<Duration, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    match parsed::<u64, _>(get, key)? {
        None => Ok(default),
        Some(0) => Err(ConfigError::Invalid {
            key,
            reason: "must be greater than zero".to_string(),
        }),
        Some(secs) => Ok(Duration::from_secs(secs)),
    }
}

fn level<G>(get: &G, key: &'static str, default: RoleLevel) -> Result<RoleLevel, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    match parsed::<u8, _>(get, key)? {
        None => Ok(default),
        Some(raw) => RoleLevel::new(raw).map_err(|e| ConfigError::Invalid {
            key,
            reason: e.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    const SECRET: &str = "0123456789abcdef0123456789abcdef";

    fn config(pairs: &[(&str, &str)]) -> Result<AppConfig, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_only_the_secret_is_set() {
        let cfg = config(&[("JWT_SECRET", SECRET)]).unwrap();

        assert_eq!(cfg.auth, AuthSettings::default());
        assert_eq!(cfg.hashing, HashingCost::default());
        assert_eq!(cfg.log, LogConfig::default());
        assert_eq!(cfg.database_url, None);
        assert_eq!(cfg.redis_url, None);
        assert_eq!(cfg.jwt_secret.expose(), SECRET.as_bytes());
    }

    #[test]
    fn secret_is_required_and_long_enough() {
        assert_eq!(config(&[]), Err(ConfigError::Missing("JWT_SECRET")));
        assert_eq!(
            config(&[("JWT_SECRET", "   ")]),
            Err(ConfigError::Missing("JWT_SECRET"))
        );
        assert!(matches!(
            config(&[("JWT_SECRET", "short")]),
            Err(ConfigError::Invalid { key: "JWT_SECRET", .. })
        ));
    }

    #[test]
    fn overrides_are_parsed() {
        let cfg = config(&[
            ("JWT_SECRET", SECRET),
            ("DATABASE_URL", "postgres://localhost/tierguard"),
            ("ACCESS_TOKEN_TTL_SECS", "60"),
            ("PERMISSION_CACHE_TTL_SECS", "30"),
            ("PLATFORM_LEVEL_THRESHOLD", "80"),
            ("SESSION_REVOCATION", "keyspace_scan"),
            ("ARGON2_MEMORY_KIB", "8192"),
            ("LOG_FORMAT", "pretty"),
            ("RUST_LOG", "debug"),
        ])
        .unwrap();

        assert_eq!(cfg.database_url.as_deref(), Some("postgres://localhost/tierguard"));
        assert_eq!(cfg.auth.access_token_ttl, Duration::from_secs(60));
        assert_eq!(cfg.auth.permission_cache_ttl, Duration::from_secs(30));
        assert_eq!(cfg.auth.platform_level_threshold, RoleLevel::saturating(80));
        assert_eq!(cfg.auth.session_revocation, SessionRevocation::KeyspaceScan);
        assert_eq!(cfg.hashing.memory_kib, 8192);
        assert_eq!(cfg.log.format, LogFormat::Pretty);
        assert_eq!(cfg.log.filter, "debug");
    }

    #[test]
    fn bad_values_name_their_key() {
        let cases = [
            ("ACCESS_TOKEN_TTL_SECS", "soon"),
            ("REFRESH_TOKEN_TTL_SECS", "0"),
            ("PLATFORM_LEVEL_THRESHOLD", "101"),
            ("CUSTOM_ROLE_LEVEL_FLOOR", "100"),
            ("SESSION_REVOCATION", "never"),
            ("ARGON2_ITERATIONS", "-1"),
            ("LOG_FORMAT", "xml"),
        ];
        for (key, value) in cases {
            match config(&[("JWT_SECRET", SECRET), (key, value)]) {
                Err(ConfigError::Invalid { key: got, .. }) => assert_eq!(got, key),
                other => panic!("{key}={value}: expected Invalid, got {other:?}"),
            }
        }
    }

    #[test]
    fn access_ttl_must_be_shorter_than_refresh_ttl() {
        assert!(matches!(
            config(&[
                ("JWT_SECRET", SECRET),
                ("ACCESS_TOKEN_TTL_SECS", "3600"),
                ("REFRESH_TOKEN_TTL_SECS", "3600"),
            ]),
            Err(ConfigError::Invalid {
                key: "ACCESS_TOKEN_TTL_SECS",
                ..
            })
        ));
    }

    #[test]
    fn debug_redacts_secret() {
        let cfg = config(&[("JWT_SECRET", SECRET)]).unwrap();
        assert!(!format!("{cfg:?}").contains(SECRET));
    }
}

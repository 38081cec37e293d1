//! Infrastructure layer: Postgres directory, Redis cache store, environment
//! configuration and service wiring.

pub mod bootstrap;
pub mod config;
pub mod db;
#[cfg(feature = "redis")]
pub mod redis_store;

pub use bootstrap::{Runtime, build_access_service, claim_super_role, seed_super_role};
pub use config::{AppConfig, ConfigError, SigningSecret};
pub use db::PostgresDirectory;
#[cfg(feature = "redis")]
pub use redis_store::RedisCacheStore;

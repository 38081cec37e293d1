//! `tierguard-auth`: authentication, session rotation and hierarchical
//! authorization.
//!
//! Storage is reached only through the `store` traits; persistent adapters
//! live in `tierguard-infra`.

pub mod cache;
pub mod claims;
pub mod credentials;
pub mod engine;
pub mod hierarchy;
pub mod organization;
pub mod permissions;
pub mod principal;
pub mod roles;
pub mod service;
pub mod session;
pub mod settings;
pub mod store;
pub mod tokens;

pub use cache::PermissionCache;
pub use claims::{AccessClaims, RefreshClaims, TokenKind, TokenValidationError, validate_window};
pub use credentials::{Argon2Verifier, CredentialError, CredentialVerifier, HashingCost};
pub use engine::{AuthorizationEngine, AuthorizationExplanation, DenialKind, PermissionSnapshot};
pub use hierarchy::{AccessibleOrganizations, OrganizationHierarchy, RoleHierarchy};
pub use organization::{
    Membership, MembershipAction, MembershipHistory, NewOrganization, Organization,
    OrganizationType,
};
pub use permissions::Permission;
pub use principal::{AuthProvenance, Principal, RoleAssignment, RoleRef, User};
pub use roles::{NewRole, Role, RoleLevel, RoleUpdate, SUPER_ROLE_NAME};
pub use service::{AccessService, AuthSession};
pub use session::SessionStore;
pub use settings::{AuthSettings, SessionRevocation};
pub use store::{
    CacheStore, Directory, InMemoryCacheStore, InMemoryDirectory, OrganizationFilter,
    OrganizationRepository, Pagination, PermissionRepository, RoleRepository, StoreError,
    StoreResult, UserFilter, UserRepository,
};
pub use tokens::{TokenIssuer, TokenPair};

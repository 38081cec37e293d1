//! `tierguard-core`: shared primitives for the access-control engine.
//!
//! Identifiers, the error taxonomy surfaced to callers, and the request
//! context that every engine call is scoped to. No storage or crypto here.

pub mod context;
pub mod error;
pub mod id;

pub use context::RequestContext;
pub use error::{AccessError, AccessResult};
pub use id::{MembershipEventId, OrganizationId, PermissionId, RoleId, UserId};

//! Hierarchical trust rules: who may act on which role, and which
//! organizations a principal can see.

pub mod organizations;
pub mod roles;

pub use organizations::{AccessibleOrganizations, OrganizationHierarchy};
pub use roles::RoleHierarchy;

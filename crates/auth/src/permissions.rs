use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tierguard_core::{AccessError, AccessResult, PermissionId};

/// An atomic, uniquely named capability (e.g. `users:read`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permission {
    pub id: PermissionId,
    pub name: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

impl Permission {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> AccessResult<Self> {
        let name = name.into();
        validate_permission_name(&name)?;
        Ok(Self {
            id: PermissionId::new(),
            name,
            description: description.into(),
            created_at: Utc::now(),
        })
    }
}

fn validate_permission_name(name: &str) -> AccessResult<()> {
    if name.is_empty() || name.len() > 128 {
        return Err(AccessError::validation("permission name must be 1..=128 characters"));
    }
    if name.chars().any(char::is_whitespace) {
        return Err(AccessError::validation("permission name must not contain whitespace"));
    }
    Ok(())
}

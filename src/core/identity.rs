//! Verified caller identity.
//!
//! The authentication layer resolves a token into an [`Actor`] before any core
//! operation runs. The core trusts it and only checks the role.

use crate::errors::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Student,
    Teacher,
    Admin,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Student => "student",
            Self::Teacher => "teacher",
            Self::Admin => "admin",
        })
    }
}

/// A user as seen by the core: a student ID or staff ID plus a role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub user_id: String,
    pub role: Role,
}

impl Actor {
    #[must_use]
    pub fn student(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            role: Role::Student,
        }
    }

    #[must_use]
    pub fn admin(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            role: Role::Admin,
        }
    }

    /// Fails with [`Error::Forbidden`] unless the actor holds `role`.
    pub fn require(&self, role: Role, operation: &'static str) -> Result<()> {
        if self.role == role {
            Ok(())
        } else {
            tracing::warn!(user_id = %self.user_id, role = %self.role, operation, "Role check failed");
            Err(Error::Forbidden {
                operation,
                role: self.role.to_string(),
            })
        }
    }
}

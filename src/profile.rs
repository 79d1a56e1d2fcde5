//! Application-level profile record and the `ProfileStore` seam.
//!
//! SYSTEM CONTEXT
//! ==============
//! A profile is keyed 1:1 by the identity id the provider assigns. The store
//! must enforce uniqueness on that id; provisioning relies on the resulting
//! duplicate-key error to detect a lost insert race.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::ErrorCode;
use crate::session::Identity;

// =============================================================================
// ROLE
// =============================================================================

/// Application role. Closed set, stored as lowercase text.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Manager,
    #[default]
    Member,
}

impl Role {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Manager => "manager",
            Self::Member => "member",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown role: {0}")]
pub struct UnknownRole(pub String);

impl FromStr for Role {
    type Err = UnknownRole;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "admin" => Ok(Self::Admin),
            "manager" => Ok(Self::Manager),
            "member" => Ok(Self::Member),
            _ => Err(UnknownRole(raw.to_owned())),
        }
    }
}

// =============================================================================
// PROFILE
// =============================================================================

/// Mirrors the `profiles` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub id: Uuid,
    pub email: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub avatar_url: Option<String>,
    pub role: Role,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub created_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub updated_at: Option<OffsetDateTime>,
}

impl Profile {
    /// Merge the present fields of `patch` into this record.
    pub fn apply(&mut self, patch: &ProfilePatch) {
        if let Some(first_name) = &patch.first_name {
            self.first_name = Some(first_name.clone());
        }
        if let Some(last_name) = &patch.last_name {
            self.last_name = Some(last_name.clone());
        }
        if let Some(avatar_url) = &patch.avatar_url {
            self.avatar_url = Some(avatar_url.clone());
        }
        if let Some(role) = patch.role {
            self.role = role;
        }
    }

    /// "First Last" when names are known, otherwise the email.
    #[must_use]
    pub fn display_name(&self) -> String {
        let name = [self.first_name.as_deref(), self.last_name.as_deref()]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join(" ");
        if name.is_empty() { self.email.clone() } else { name }
    }
}

/// Insert payload for a first-time identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewProfile {
    pub id: Uuid,
    pub email: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub role: Role,
}

impl NewProfile {
    /// Seed a profile from the identity and its sign-up metadata.
    #[must_use]
    pub fn from_identity(identity: &Identity) -> Self {
        Self {
            id: identity.id,
            email: identity.email.clone(),
            first_name: non_blank(identity.metadata.first_name.as_deref()),
            last_name: non_blank(identity.metadata.last_name.as_deref()),
            role: Role::default(),
        }
    }
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
}

/// Partial, user-initiated profile update. `None` fields are left alone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfilePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
}

impl ProfilePatch {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.first_name.is_none() && self.last_name.is_none() && self.avatar_url.is_none() && self.role.is_none()
    }
}

// =============================================================================
// STORE
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A profile with this id already exists (lost insert race).
    #[error("profile {0} already exists")]
    DuplicateKey(Uuid),

    #[error("profile {0} not found")]
    NotFound(Uuid),

    #[error("stored role is invalid: {0}")]
    InvalidRole(#[from] UnknownRole),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Non-SQL backends report transport failures here.
    #[error("profile store unavailable: {0}")]
    Unavailable(String),
}

impl ErrorCode for StoreError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::DuplicateKey(_) => "E_DUPLICATE_KEY",
            Self::NotFound(_) => "E_NOT_FOUND",
            Self::InvalidRole(_) => "E_INVALID_ROLE",
            Self::Database(_) => "E_DATABASE",
            Self::Unavailable(_) => "E_STORE_UNAVAILABLE",
        }
    }

    fn retryable(&self) -> bool {
        matches!(
            self,
            Self::Unavailable(_) | Self::Database(sqlx::Error::PoolTimedOut | sqlx::Error::Io(_))
        )
    }
}

/// Remote profile table consumed by the provisioner and synchronizer.
#[async_trait::async_trait]
pub trait ProfileStore: Send + Sync {
    /// Point lookup by identity id.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the store cannot be read.
    async fn get_by_id(&self, id: Uuid) -> Result<Option<Profile>, StoreError>;

    /// Insert a new profile.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DuplicateKey`] if the id already exists, or
    /// another [`StoreError`] on failure.
    async fn insert(&self, profile: &NewProfile) -> Result<Profile, StoreError>;

    /// Write the present fields of `patch` to the profile `id`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if no such profile exists, or another
    /// [`StoreError`] on failure.
    async fn update(&self, id: Uuid, patch: &ProfilePatch) -> Result<(), StoreError>;
}

#[cfg(test)]
#[path = "profile_test.rs"]
mod tests;

//! Profile provisioning — ensure exactly one profile per identity.
//!
//! DESIGN
//! ======
//! Lookup, then insert, then on a duplicate-key failure re-read. Whichever
//! concurrent caller inserts first wins; every other caller observes that
//! row. No lock is held and no delay is used; the store's uniqueness
//! constraint on id is the only concurrency control.

use std::sync::Arc;

use tracing::{debug, info};
use uuid::Uuid;

use crate::error::ErrorCode;
use crate::profile::{NewProfile, Profile, ProfileStore, StoreError};
use crate::session::Identity;

#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("profile lookup failed: {0}")]
    Lookup(StoreError),

    #[error("profile insert failed: {0}")]
    Insert(StoreError),

    /// Insert lost a race, but the winning row could not be read back.
    #[error("profile {0} reported as duplicate but not found on re-read")]
    Vanished(Uuid),
}

impl ErrorCode for ProvisionError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Lookup(_) => "E_PROFILE_LOOKUP",
            Self::Insert(_) => "E_PROFILE_INSERT",
            Self::Vanished(_) => "E_PROFILE_VANISHED",
        }
    }

    fn retryable(&self) -> bool {
        match self {
            Self::Lookup(e) | Self::Insert(e) => e.retryable(),
            Self::Vanished(_) => true,
        }
    }
}

/// Idempotent get-or-create over a [`ProfileStore`].
#[derive(Clone)]
pub struct ProfileProvisioner {
    store: Arc<dyn ProfileStore>,
}

impl ProfileProvisioner {
    #[must_use]
    pub fn new(store: Arc<dyn ProfileStore>) -> Self {
        Self { store }
    }

    /// Return the profile for `identity`, creating it on first sight.
    ///
    /// Concurrent and repeated calls for one identity converge on a single
    /// stored row; a lost insert race is never reported to the caller.
    ///
    /// # Errors
    ///
    /// Returns a [`ProvisionError`] for store failures not caused by the race.
    pub async fn ensure(&self, identity: &Identity) -> Result<Profile, ProvisionError> {
        if let Some(existing) = self
            .store
            .get_by_id(identity.id)
            .await
            .map_err(ProvisionError::Lookup)?
        {
            debug!(user_id = %identity.id, "profile exists");
            return Ok(existing);
        }

        let new = NewProfile::from_identity(identity);
        match self.store.insert(&new).await {
            Ok(created) => {
                info!(user_id = %identity.id, "profile created");
                Ok(created)
            }
            Err(StoreError::DuplicateKey(_)) => {
                debug!(user_id = %identity.id, "lost profile insert race; reading winner");
                self.store
                    .get_by_id(identity.id)
                    .await
                    .map_err(ProvisionError::Lookup)?
                    .ok_or(ProvisionError::Vanished(identity.id))
            }
            Err(e) => Err(ProvisionError::Insert(e)),
        }
    }
}

#[cfg(test)]
#[path = "provision_test.rs"]
mod tests;

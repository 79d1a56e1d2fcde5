//! Read model exposed to consumers of the synchronizer.
//!
//! DESIGN
//! ======
//! `SyncState` is a plain value published through a `tokio::sync::watch`
//! channel. Consumers only ever see clones; every mutation goes through the
//! transition methods below, which are crate-private so the synchronizer is
//! the single writer.
//!
//! INVARIANTS
//! ==========
//! - `profile` is `Some` only if `user` is `Some`.
//! - `user` is `Some` only if `session` is `Some` and not expired. Expiry is
//!   time-dependent, so the synchronizer re-checks the session when it expires.
//! - `loading` starts `true` and drops to `false` once, at the first resolved
//!   outcome. It never goes back to `true`.

use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::profile::{Profile, ProfilePatch};
use crate::session::{Identity, Session};

// =============================================================================
// PHASE
// =============================================================================

/// Lifecycle phase of the synchronizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Uninitialized,
    Initializing,
    Unauthenticated,
    /// Authenticated, profile resolution in flight.
    ProfilePending,
    ProfileReady,
    /// Authenticated, profile could not be resolved. Usable without a profile.
    ProfileFailed,
}

impl SyncPhase {
    #[must_use]
    pub fn is_authenticated(self) -> bool {
        matches!(self, Self::ProfilePending | Self::ProfileReady | Self::ProfileFailed)
    }
}

/// What gated UI should do with a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthGate {
    /// Render a neutral placeholder; make no redirect decisions.
    Pending,
    Anonymous,
    Authenticated,
}

// =============================================================================
// SYNC STATE
// =============================================================================

/// Snapshot of the current session, user, and profile.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncState {
    pub session: Option<Session>,
    pub user: Option<Identity>,
    pub profile: Option<Profile>,
    pub loading: bool,
    pub phase: SyncPhase,
}

impl Default for SyncState {
    fn default() -> Self {
        Self { session: None, user: None, profile: None, loading: true, phase: SyncPhase::Uninitialized }
    }
}

impl SyncState {
    #[must_use]
    pub fn user_id(&self) -> Option<Uuid> {
        self.user.as_ref().map(|u| u.id)
    }

    #[must_use]
    pub fn gate(&self) -> AuthGate {
        if self.loading {
            AuthGate::Pending
        } else if self.user.is_some() {
            AuthGate::Authenticated
        } else {
            AuthGate::Anonymous
        }
    }

    /// Whether the invariants above hold for this snapshot right now.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.is_consistent_at(OffsetDateTime::now_utc().unix_timestamp())
    }

    /// Whether the invariants above hold at `now_unix` (unix seconds).
    #[must_use]
    pub fn is_consistent_at(&self, now_unix: i64) -> bool {
        self.is_well_formed()
            && (self.user.is_none() || self.session.as_ref().is_some_and(|s| !s.is_expired(now_unix)))
    }

    /// The clock-independent part of the invariants.
    pub(crate) fn is_well_formed(&self) -> bool {
        (self.profile.is_none() || self.user.is_some())
            && (self.user.is_none() || self.session.is_some())
            && self
                .profile
                .as_ref()
                .zip(self.user.as_ref())
                .is_none_or(|(p, u)| p.id == u.id)
            && self.user.is_some() == self.phase.is_authenticated()
    }

    // -------------------------------------------------------------------------
    // transitions
    // -------------------------------------------------------------------------

    pub(crate) fn begin_initializing(&mut self) -> bool {
        if self.phase != SyncPhase::Uninitialized {
            return false;
        }
        self.phase = SyncPhase::Initializing;
        true
    }

    /// Signed out or no session. Returns whether anything changed.
    pub(crate) fn clear_session(&mut self) -> bool {
        let changed = self.session.is_some() || self.loading || self.phase != SyncPhase::Unauthenticated;
        self.session = None;
        self.user = None;
        self.profile = None;
        self.loading = false;
        self.phase = SyncPhase::Unauthenticated;
        changed
    }

    /// The initial fetch failed. Only settles `loading` if nothing else has.
    pub(crate) fn fetch_failed(&mut self) -> bool {
        if self.phase != SyncPhase::Initializing {
            return false;
        }
        self.clear_session()
    }

    /// Cache `session`. Returns whether the profile needs resolving.
    pub(crate) fn authenticate(&mut self, session: Session) -> bool {
        let same_identity = self.user_id() == Some(session.identity.id);
        self.user = Some(session.identity.clone());
        self.session = Some(session);

        if same_identity && self.phase == SyncPhase::ProfileReady {
            return false;
        }
        if !same_identity {
            self.profile = None;
        }
        self.phase = SyncPhase::ProfilePending;
        true
    }

    /// A stale read confirmed the identity already in state. The cached
    /// session is newer and is kept. Returns whether the profile needs
    /// resolving.
    pub(crate) fn reaffirm_identity(&mut self) -> bool {
        if !self.phase.is_authenticated() || self.phase == SyncPhase::ProfileReady {
            return false;
        }
        self.phase = SyncPhase::ProfilePending;
        true
    }

    /// Clear the session if it has expired at `now_unix`.
    pub(crate) fn expire_session(&mut self, now_unix: i64) -> bool {
        if !self.session.as_ref().is_some_and(|s| s.is_expired(now_unix)) {
            return false;
        }
        self.clear_session()
    }

    /// Apply a profile resolution for `identity_id`. `None` means it failed.
    ///
    /// Ignored when the state no longer names that identity. A failure never
    /// replaces a profile another resolution already delivered.
    pub(crate) fn profile_resolved(&mut self, identity_id: Uuid, profile: Option<Profile>) -> bool {
        if self.user_id() != Some(identity_id) {
            return false;
        }
        match profile {
            Some(profile) => {
                self.profile = Some(profile);
                self.phase = SyncPhase::ProfileReady;
            }
            None if self.phase == SyncPhase::ProfileReady => return false,
            None => {
                self.profile = None;
                self.phase = SyncPhase::ProfileFailed;
            }
        }
        self.loading = false;
        true
    }

    /// Merge a stored patch into the cached profile for `identity_id`.
    pub(crate) fn merge_profile(&mut self, identity_id: Uuid, patch: &ProfilePatch) -> bool {
        match self.profile.as_mut() {
            Some(profile) if profile.id == identity_id => {
                profile.apply(patch);
                true
            }
            _ => false,
        }
    }
}

/// Route-guard rule: redirect to sign-in once loading is over and nobody is signed in.
#[must_use]
pub fn should_redirect_unauth(state: &SyncState) -> bool {
    state.gate() == AuthGate::Anonymous
}

#[cfg(test)]
#[path = "test_helpers.rs"]
pub mod test_helpers;

#[cfg(test)]
#[path = "state_test.rs"]
mod tests;

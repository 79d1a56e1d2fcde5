//! Session synchronizer — keeps [`SyncState`] in step with the identity provider.
//!
//! ARCHITECTURE
//! ============
//! Startup races two paths into the same `observe` routine:
//! 1. a listener task draining the session-change subscription (registered first),
//! 2. a one-shot `get_session` fetch issued right after.
//!
//! An authenticated observation spawns a resolve task that runs
//! [`ProfileProvisioner::ensure`] and publishes the result. Resolve tasks are
//! not serialized against each other; provisioning is idempotent, so the two
//! paths converge on the same profile and the last write wins.
//!
//! LIVENESS
//! ========
//! `alive` is read inside the watch channel's write lock on every publish and
//! flipped under that same lock on teardown. A continuation that completes
//! after `dispose` therefore never writes. Resolutions also check that the
//! state still names the identity they resolved, which covers sign-out and
//! account switches while a lookup is in flight.
//!
//! EXPIRY
//! ======
//! Every adopted session arms a timer for its `expires_at`. When it fires the
//! synchronizer re-reads the session from the source, which refreshes it or
//! signs out. If that read fails, an expired session is cleared locally.
//!
//! TRADE-OFFS
//! ==========
//! Events are newer than any one-shot read. A read that completes after an
//! event has been applied never replaces the cached session: it may only
//! confirm the identity already in state, and is dropped otherwise.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::provision::ProfileProvisioner;
use crate::error::ErrorCode;
use crate::profile::{ProfilePatch, ProfileStore, StoreError};
use crate::session::{AuthError, Identity, Session, SessionSource, SignupMetadata};
use crate::state::SyncState;

#[derive(Debug, thiserror::Error)]
pub enum UpdateProfileError {
    /// `update_profile` was called with nobody signed in.
    #[error("no active identity")]
    NoActiveIdentity,

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ErrorCode for UpdateProfileError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::NoActiveIdentity => "E_NO_ACTIVE_IDENTITY",
            Self::Store(e) => e.error_code(),
        }
    }

    fn retryable(&self) -> bool {
        match self {
            Self::NoActiveIdentity => false,
            Self::Store(e) => e.retryable(),
        }
    }
}

/// Which path produced an observation.
#[derive(Debug, Clone, Copy)]
enum Origin {
    Subscription,
    /// Startup fetch; carries the event count seen when the fetch was issued.
    Fetch { events_before: u64 },
    /// Re-read after the cached session expired.
    Expiry { events_before: u64 },
}

impl Origin {
    fn events_before(self) -> Option<u64> {
        match self {
            Self::Subscription => None,
            Self::Fetch { events_before } | Self::Expiry { events_before } => Some(events_before),
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Subscription => f.write_str("subscription"),
            Self::Fetch { .. } => f.write_str("fetch"),
            Self::Expiry { .. } => f.write_str("expiry"),
        }
    }
}

fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

/// Time left until `expires_at` (unix seconds); zero once it has passed.
fn until_expiry(expires_at: i64) -> Duration {
    let remaining = i128::from(expires_at) * 1_000_000_000 - OffsetDateTime::now_utc().unix_timestamp_nanos();
    u64::try_from(remaining.max(0)).map_or(Duration::MAX, Duration::from_nanos)
}

struct Inner {
    source: Arc<dyn SessionSource>,
    store: Arc<dyn ProfileStore>,
    provisioner: ProfileProvisioner,
    state: watch::Sender<SyncState>,
    alive: AtomicBool,
    /// Subscription events applied so far.
    events: AtomicU64,
    /// Timer for the cached session's expiry.
    expiry: Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Publish a transition. No-op (and no notification) once disposed.
    fn apply<F>(&self, f: F) -> bool
    where
        F: FnOnce(&mut SyncState) -> bool,
    {
        let alive = &self.alive;
        self.state.send_if_modified(|state| {
            if !alive.load(Ordering::Acquire) {
                return false;
            }
            let changed = f(state);
            debug_assert!(state.is_well_formed(), "inconsistent sync state: {state:?}");
            changed
        })
    }

    /// Replace the expiry timer. `None` only cancels the current one.
    fn arm_expiry(self: &Arc<Self>, expires_at: Option<i64>) {
        let timer = expires_at.map(|expires_at| {
            let inner = Arc::clone(self);
            tokio::spawn(async move {
                tokio::time::sleep(until_expiry(expires_at)).await;
                inner.recheck_expired().await;
            })
        });
        let previous = std::mem::replace(&mut *self.expiry.lock().unwrap_or_else(PoisonError::into_inner), timer);
        if let Some(previous) = previous {
            previous.abort();
        }
        // Disposal flips `alive` before cancelling, so one of the two sees this timer.
        if !self.is_alive() {
            self.cancel_expiry();
        }
    }

    fn cancel_expiry(&self) {
        if let Some(timer) = self.expiry.lock().unwrap_or_else(PoisonError::into_inner).take() {
            timer.abort();
        }
    }

    async fn recheck_expired(self: Arc<Self>) {
        // The running timer is this task; detach it so re-arming cannot abort it.
        drop(self.expiry.lock().unwrap_or_else(PoisonError::into_inner).take());
        if !self.is_alive() {
            return;
        }

        debug!("cached session expired; re-reading");
        let events_before = self.events.load(Ordering::Acquire);
        match self.source.get_session().await {
            Ok(session) => self.observe(session, Origin::Expiry { events_before }),
            Err(e) => {
                warn!(error = %e, code = e.error_code(), "session re-read failed after expiry");
                if self.apply(|state| state.expire_session(now_unix())) {
                    info!("expired session cleared");
                }
            }
        }
    }

    fn observe(self: &Arc<Self>, session: Option<Session>, origin: Origin) {
        let superseded = origin
            .events_before()
            .is_some_and(|before| self.events.load(Ordering::Acquire) != before);

        let Some(session) = session.filter(|s| !s.is_expired_now()) else {
            if superseded {
                debug!(%origin, "dropping stale empty session");
            } else {
                if self.apply(SyncState::clear_session) {
                    info!(%origin, "no active session");
                }
                self.cancel_expiry();
            }
            return;
        };

        let identity = session.identity.clone();
        let expires_at = session.expires_at;
        let mut accepted = false;
        let mut needs_resolve = false;
        self.apply(|state| {
            if superseded {
                if state.user_id() != Some(identity.id) {
                    return false;
                }
                accepted = true;
                needs_resolve = state.reaffirm_identity();
                return needs_resolve;
            }
            accepted = true;
            needs_resolve = state.authenticate(session);
            true
        });

        if !accepted {
            debug!(%origin, user_id = %identity.id, "session observation discarded");
            return;
        }
        if superseded {
            debug!(%origin, user_id = %identity.id, "stale read confirmed identity; keeping newer session");
        } else {
            info!(%origin, user_id = %identity.id, "session active");
            self.arm_expiry(expires_at);
        }
        if needs_resolve {
            let inner = Arc::clone(self);
            tokio::spawn(async move { inner.resolve(identity, origin).await });
        }
    }

    async fn resolve(&self, identity: Identity, origin: Origin) {
        let profile = match self.provisioner.ensure(&identity).await {
            Ok(profile) => Some(profile),
            Err(e) => {
                warn!(
                    %origin,
                    user_id = %identity.id,
                    error = %e,
                    code = e.error_code(),
                    "profile resolution failed; continuing without profile"
                );
                None
            }
        };

        if !self.apply(|state| state.profile_resolved(identity.id, profile)) {
            debug!(%origin, user_id = %identity.id, "profile resolution discarded");
        }
    }
}

// =============================================================================
// SYNCHRONIZER
// =============================================================================

/// Owner of the current session/user/profile tuple.
///
/// Construct with [`SessionSynchronizer::start`]; tear down with
/// [`SessionSynchronizer::dispose`] or by dropping it.
pub struct SessionSynchronizer {
    inner: Arc<Inner>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl SessionSynchronizer {
    /// Subscribe to `source`, then issue the one-shot session fetch.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn start(source: Arc<dyn SessionSource>, store: Arc<dyn ProfileStore>) -> Self {
        let (state, _) = watch::channel(SyncState::default());
        let inner = Arc::new(Inner {
            provisioner: ProfileProvisioner::new(Arc::clone(&store)),
            source,
            store,
            state,
            alive: AtomicBool::new(true),
            events: AtomicU64::new(0),
            expiry: Mutex::new(None),
        });
        inner.apply(SyncState::begin_initializing);

        let mut events = inner.source.on_session_change();
        let listener = {
            let inner = Arc::clone(&inner);
            tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    if !inner.is_alive() {
                        break;
                    }
                    debug!(change = ?event.change, "session event");
                    inner.events.fetch_add(1, Ordering::AcqRel);
                    inner.observe(event.session, Origin::Subscription);
                }
            })
        };

        {
            let inner = Arc::clone(&inner);
            tokio::spawn(async move {
                let events_before = inner.events.load(Ordering::Acquire);
                match inner.source.get_session().await {
                    Ok(session) => inner.observe(session, Origin::Fetch { events_before }),
                    Err(e) => {
                        warn!(error = %e, code = e.error_code(), "initial session fetch failed");
                        inner.apply(SyncState::fetch_failed);
                    }
                }
            });
        }

        Self { inner, listener: Mutex::new(Some(listener)) }
    }

    // -------------------------------------------------------------------------
    // read model
    // -------------------------------------------------------------------------

    /// Current snapshot.
    #[must_use]
    pub fn snapshot(&self) -> SyncState {
        self.inner.state.borrow().clone()
    }

    /// Receiver notified on every state change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SyncState> {
        self.inner.state.subscribe()
    }

    /// Wait for the end of the loading window and return that snapshot.
    ///
    /// Never returns if the synchronizer is disposed while still loading.
    pub async fn settled(&self) -> SyncState {
        let mut rx = self.subscribe();
        match rx.wait_for(|state| !state.loading).await {
            Ok(state) => state.clone(),
            Err(_) => self.snapshot(),
        }
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.inner.is_alive()
    }

    fn current_user_id(&self) -> Option<Uuid> {
        self.inner.state.borrow().user_id()
    }

    // -------------------------------------------------------------------------
    // operations
    // -------------------------------------------------------------------------

    /// Register an account. A pre-confirmed identity gets its profile
    /// provisioned in the background; this call does not wait for it.
    ///
    /// # Errors
    ///
    /// Returns the provider's [`AuthError`].
    pub async fn sign_up(&self, email: &str, password: &str, metadata: &SignupMetadata) -> Result<(), AuthError> {
        let outcome = self.inner.source.sign_up(email, password, metadata).await?;
        info!(user_id = %outcome.identity.id, confirmed = outcome.identity.confirmed, "signed up");

        if outcome.identity.confirmed && self.inner.is_alive() {
            let provisioner = self.inner.provisioner.clone();
            let identity = outcome.identity;
            tokio::spawn(async move {
                if let Err(e) = provisioner.ensure(&identity).await {
                    warn!(user_id = %identity.id, error = %e, "sign-up provisioning failed");
                }
            });
        }
        Ok(())
    }

    /// Sign in. State follows from the provider's `SignedIn` event.
    ///
    /// # Errors
    ///
    /// Returns the provider's [`AuthError`].
    pub async fn sign_in(&self, email: &str, password: &str) -> Result<(), AuthError> {
        let session = self.inner.source.sign_in(email, password).await?;
        info!(user_id = %session.identity.id, "signed in");
        Ok(())
    }

    /// Sign out. State clears when the provider's `SignedOut` event arrives.
    ///
    /// # Errors
    ///
    /// Returns the provider's [`AuthError`].
    pub async fn sign_out(&self) -> Result<(), AuthError> {
        self.inner.source.sign_out().await?;
        info!("signed out");
        Ok(())
    }

    /// Write `patch` through to the store, then merge it into the cached
    /// profile. The profile is not re-read.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateProfileError::NoActiveIdentity`] when nobody is signed
    /// in (the store is not touched), or the store's error.
    pub async fn update_profile(&self, patch: ProfilePatch) -> Result<(), UpdateProfileError> {
        let user_id = self.current_user_id().ok_or(UpdateProfileError::NoActiveIdentity)?;
        if patch.is_empty() {
            return Ok(());
        }

        self.inner.store.update(user_id, &patch).await?;
        if !self.inner.apply(|state| state.merge_profile(user_id, &patch)) {
            debug!(%user_id, "profile updated in store; no matching cached profile");
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // teardown
    // -------------------------------------------------------------------------

    /// Unsubscribe and invalidate the liveness guard. Idempotent.
    pub fn dispose(&self) {
        let alive = &self.inner.alive;
        let mut was_alive = false;
        // Flipped under the state lock: a concurrent publish lands before this or not at all.
        self.inner.state.send_if_modified(|_| {
            was_alive = alive.swap(false, Ordering::AcqRel);
            false
        });

        if let Some(listener) = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            listener.abort();
        }
        self.inner.cancel_expiry();

        if was_alive {
            info!("session synchronizer disposed");
        }
    }
}

impl Drop for SessionSynchronizer {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
#[path = "sync_test.rs"]
mod tests;

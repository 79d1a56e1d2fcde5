//! Fakes and fixtures shared by unit tests.
//!
//! `FakeSessionSource` and `FakeProfileStore` run entirely in memory. Both can
//! hold calls at a gate (a zero-permit semaphore) so tests control exactly
//! when a suspended continuation resumes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::{Barrier, Semaphore, watch};
use uuid::Uuid;

use super::SyncState;
use crate::profile::{NewProfile, Profile, ProfilePatch, ProfileStore, Role, StoreError};
use crate::session::{
    AuthChange, AuthError, Identity, Session, SessionBroadcaster, SessionEvent, SessionSource,
    SessionSubscription, SignUpOutcome, SignupMetadata,
};

// =============================================================================
// FIXTURES
// =============================================================================

#[must_use]
pub fn identity_for(id: Uuid, email: &str) -> Identity {
    Identity { id, email: email.to_owned(), confirmed: true, metadata: SignupMetadata::default() }
}

#[must_use]
pub fn session_for(id: Uuid, email: &str) -> Session {
    Session {
        access_token: format!("access-{id}"),
        refresh_token: Some(format!("refresh-{id}")),
        expires_at: Some(OffsetDateTime::now_utc().unix_timestamp() + 3600),
        identity: identity_for(id, email),
    }
}

#[must_use]
pub fn profile_for(id: Uuid, email: &str, first_name: Option<&str>) -> Profile {
    Profile {
        id,
        email: email.to_owned(),
        first_name: first_name.map(str::to_owned),
        last_name: None,
        avatar_url: None,
        role: Role::Member,
        created_at: None,
        updated_at: None,
    }
}

/// Wait (bounded) until a published state satisfies `pred`.
pub async fn wait_for_state<F>(rx: &mut watch::Receiver<SyncState>, pred: F) -> SyncState
where
    F: FnMut(&SyncState) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(pred))
        .await
        .expect("state wait timed out")
        .expect("synchronizer dropped")
        .clone()
}

/// Poll `cond` until true, yielding to other tasks between checks.
pub async fn wait_until<F>(mut cond: F)
where
    F: FnMut() -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("condition wait timed out");
}

/// Let every runnable task make progress.
pub async fn drain_tasks() {
    for _ in 0..32 {
        tokio::task::yield_now().await;
    }
}

async fn pass_gate(gate: Option<&Arc<Semaphore>>) {
    if let Some(gate) = gate {
        gate.acquire().await.expect("gate closed").forget();
    }
}

// =============================================================================
// FAKE PROFILE STORE
// =============================================================================

/// In-memory profile table with a uniqueness constraint on id.
#[derive(Default)]
pub struct FakeProfileStore {
    rows: Mutex<HashMap<Uuid, Profile>>,
    lookups: AtomicUsize,
    insert_attempts: AtomicUsize,
    updates: Mutex<Vec<(Uuid, ProfilePatch)>>,
    lookup_gate: Option<Arc<Semaphore>>,
    lookup_barrier: Option<(Arc<Barrier>, usize)>,
    fail_lookups: AtomicBool,
    fail_inserts: AtomicBool,
    fail_updates: AtomicBool,
}

impl FakeProfileStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every lookup waits for a permit on `gate`.
    #[must_use]
    pub fn with_lookup_gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.lookup_gate = Some(gate);
        self
    }

    /// The first `n` lookups read the table, then wait for each other before any returns.
    #[must_use]
    pub fn with_lookup_barrier(mut self, n: usize) -> Self {
        self.lookup_barrier = Some((Arc::new(Barrier::new(n)), n));
        self
    }

    #[must_use]
    pub fn seeded(self, profile: Profile) -> Self {
        self.rows.lock().unwrap().insert(profile.id, profile);
        self
    }

    pub fn fail_lookups(&self) {
        self.fail_lookups.store(true, Ordering::SeqCst);
    }

    pub fn fail_inserts(&self) {
        self.fail_inserts.store(true, Ordering::SeqCst);
    }

    pub fn fail_updates(&self) {
        self.fail_updates.store(true, Ordering::SeqCst);
    }

    pub fn lookup_calls(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    pub fn insert_attempts(&self) -> usize {
        self.insert_attempts.load(Ordering::SeqCst)
    }

    pub fn row_count(&self) -> usize {
        self.rows.lock().unwrap().len()
    }

    pub fn row(&self, id: Uuid) -> Option<Profile> {
        self.rows.lock().unwrap().get(&id).cloned()
    }

    pub fn updates(&self) -> Vec<(Uuid, ProfilePatch)> {
        self.updates.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl ProfileStore for FakeProfileStore {
    async fn get_by_id(&self, id: Uuid) -> Result<Option<Profile>, StoreError> {
        let n = self.lookups.fetch_add(1, Ordering::SeqCst);
        pass_gate(self.lookup_gate.as_ref()).await;
        if self.fail_lookups.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("lookup failed".into()));
        }
        let found = self.rows.lock().unwrap().get(&id).cloned();
        // Read first, then wait: every barrier participant sees the same table.
        if let Some((barrier, size)) = &self.lookup_barrier {
            if n < *size {
                barrier.wait().await;
            }
        }
        Ok(found)
    }

    async fn insert(&self, profile: &NewProfile) -> Result<Profile, StoreError> {
        self.insert_attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("insert failed".into()));
        }
        let mut rows = self.rows.lock().unwrap();
        if rows.contains_key(&profile.id) {
            return Err(StoreError::DuplicateKey(profile.id));
        }
        let now = OffsetDateTime::now_utc();
        let row = Profile {
            id: profile.id,
            email: profile.email.clone(),
            first_name: profile.first_name.clone(),
            last_name: profile.last_name.clone(),
            avatar_url: None,
            role: profile.role,
            created_at: Some(now),
            updated_at: Some(now),
        };
        rows.insert(row.id, row.clone());
        Ok(row)
    }

    async fn update(&self, id: Uuid, patch: &ProfilePatch) -> Result<(), StoreError> {
        self.updates.lock().unwrap().push((id, patch.clone()));
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("update failed".into()));
        }
        let mut rows = self.rows.lock().unwrap();
        let row = rows.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        row.apply(patch);
        Ok(())
    }
}

// =============================================================================
// FAKE SESSION SOURCE
// =============================================================================

struct Account {
    password: String,
    identity: Identity,
}

/// In-memory identity provider.
pub struct FakeSessionSource {
    events: SessionBroadcaster,
    accounts: Mutex<HashMap<String, Account>>,
    initial_event: bool,
    auto_confirm: bool,
    signup_emits_event: bool,
    fetch_gate: Option<Arc<Semaphore>>,
    fetch_error: AtomicBool,
    sign_outs: AtomicUsize,
}

impl Default for FakeSessionSource {
    fn default() -> Self {
        Self {
            events: SessionBroadcaster::new(),
            accounts: Mutex::new(HashMap::new()),
            initial_event: true,
            auto_confirm: true,
            signup_emits_event: true,
            fetch_gate: None,
            fetch_error: AtomicBool::new(false),
            sign_outs: AtomicUsize::new(0),
        }
    }
}

impl FakeSessionSource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribers get no `InitialSession` event.
    #[must_use]
    pub fn without_initial_event(mut self) -> Self {
        self.initial_event = false;
        self
    }

    /// Sign-ups stay unconfirmed and get no session.
    #[must_use]
    pub fn requiring_confirmation(mut self) -> Self {
        self.auto_confirm = false;
        self
    }

    /// Confirmed sign-ups get a session but no `SignedIn` event.
    #[must_use]
    pub fn silent_signup(mut self) -> Self {
        self.signup_emits_event = false;
        self
    }

    /// `get_session` waits for a permit on `gate`.
    #[must_use]
    pub fn with_fetch_gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.fetch_gate = Some(gate);
        self
    }

    #[must_use]
    pub fn with_account(self, identity: Identity, password: &str) -> Self {
        self.accounts
            .lock()
            .unwrap()
            .insert(identity.email.clone(), Account { password: password.to_owned(), identity });
        self
    }

    #[must_use]
    pub fn with_current(self, session: Session) -> Self {
        self.events.set_current(Some(session));
        self
    }

    /// Swap the cached session without notifying subscribers.
    pub fn set_current(&self, session: Option<Session>) {
        self.events.set_current(session);
    }

    pub fn fail_fetch(&self) {
        self.fetch_error.store(true, Ordering::SeqCst);
    }

    /// Push an event to subscribers without touching the cached session.
    pub fn emit(&self, change: AuthChange, session: Option<Session>) {
        self.events.emit(&SessionEvent::new(change, session));
    }

    pub fn subscriber_count(&self) -> usize {
        self.events.subscriber_count()
    }

    pub fn sign_out_calls(&self) -> usize {
        self.sign_outs.load(Ordering::SeqCst)
    }

    fn replace(&self, session: Option<Session>, change: AuthChange) {
        self.events.publish(change, session);
    }
}

#[async_trait::async_trait]
impl SessionSource for FakeSessionSource {
    async fn get_session(&self) -> Result<Option<Session>, AuthError> {
        pass_gate(self.fetch_gate.as_ref()).await;
        if self.fetch_error.load(Ordering::SeqCst) {
            return Err(AuthError::Network("fetch failed".into()));
        }
        Ok(self.events.current())
    }

    fn on_session_change(&self) -> SessionSubscription {
        if self.initial_event {
            self.events.subscribe()
        } else {
            self.events.subscribe_quiet()
        }
    }

    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        metadata: &SignupMetadata,
    ) -> Result<SignUpOutcome, AuthError> {
        let identity = {
            let mut accounts = self.accounts.lock().unwrap();
            if accounts.contains_key(email) {
                return Err(AuthError::Rejected { status: 422, message: "User already registered".into() });
            }
            let identity = Identity {
                id: Uuid::new_v4(),
                email: email.to_owned(),
                confirmed: self.auto_confirm,
                metadata: metadata.clone(),
            };
            accounts.insert(email.to_owned(), Account { password: password.to_owned(), identity: identity.clone() });
            identity
        };

        let session = self.auto_confirm.then(|| {
            let mut session = session_for(identity.id, email);
            session.identity = identity.clone();
            session
        });
        if let Some(session) = &session {
            if self.signup_emits_event {
                self.replace(Some(session.clone()), AuthChange::SignedIn);
            } else {
                self.events.set_current(Some(session.clone()));
            }
        }
        Ok(SignUpOutcome { identity, session })
    }

    async fn sign_in(&self, email: &str, password: &str) -> Result<Session, AuthError> {
        let identity = {
            let accounts = self.accounts.lock().unwrap();
            match accounts.get(email) {
                Some(account) if account.password == password => account.identity.clone(),
                _ => {
                    return Err(AuthError::Rejected { status: 400, message: "Invalid login credentials".into() });
                }
            }
        };
        let mut session = session_for(identity.id, email);
        session.identity = identity;
        self.replace(Some(session.clone()), AuthChange::SignedIn);
        Ok(session)
    }

    async fn sign_out(&self) -> Result<(), AuthError> {
        self.sign_outs.fetch_add(1, Ordering::SeqCst);
        self.replace(None, AuthChange::SignedOut);
        Ok(())
    }
}

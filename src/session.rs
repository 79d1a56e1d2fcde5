//! Identity-provider session model and the `SessionSource` seam.
//!
//! ARCHITECTURE
//! ============
//! The identity provider is ground truth for who is signed in. The
//! synchronizer only ever reads sessions through [`SessionSource`]: a one-shot
//! fetch plus an event subscription. Providers keep their session in a
//! [`SessionBroadcaster`], which gives every subscriber its own unbounded
//! queue so events are delivered in provider order.
//!
//! TRADE-OFFS
//! ==========
//! Unsubscribing is dropping the receiver. The broadcaster prunes closed
//! senders lazily on the next emit instead of tracking handles.

use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::ErrorCode;

// =============================================================================
// ERROR
// =============================================================================

/// Failures from the identity provider on explicit user actions.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// The provider answered with a non-success status.
    #[error("{message}")]
    Rejected { status: u16, message: String },

    /// The provider could not be reached.
    #[error("identity provider unreachable: {0}")]
    Network(String),

    /// The provider answered with a body we could not interpret.
    #[error("unexpected provider response: {0}")]
    Parse(String),

    /// The underlying HTTP client could not be constructed.
    #[error("HTTP client build failed: {0}")]
    HttpClientBuild(String),
}

impl ErrorCode for AuthError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Rejected { .. } => "E_AUTH_REJECTED",
            Self::Network(_) => "E_AUTH_NETWORK",
            Self::Parse(_) => "E_AUTH_PARSE",
            Self::HttpClientBuild(_) => "E_HTTP_CLIENT_BUILD",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Rejected { status: 429 | 500..=599, .. })
    }
}

// =============================================================================
// IDENTITY + SESSION
// =============================================================================

/// Optional names supplied at sign-up, used to seed the profile.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignupMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
}

/// The provider's account record for a signed-in user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: Uuid,
    pub email: String,
    /// Whether the provider considers the email confirmed.
    pub confirmed: bool,
    #[serde(default)]
    pub metadata: SignupMetadata,
}

/// Token-bearing credential for one identity. Tokens never serialize.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Session {
    #[serde(skip_serializing)]
    pub access_token: String,
    #[serde(skip_serializing)]
    pub refresh_token: Option<String>,
    /// Expiry as unix seconds. `None` means the provider gave no expiry.
    pub expires_at: Option<i64>,
    pub identity: Identity,
}

impl Session {
    /// Whether the session has expired at `now_unix` (unix seconds).
    #[must_use]
    pub fn is_expired(&self, now_unix: i64) -> bool {
        self.expires_at.is_some_and(|exp| exp <= now_unix)
    }

    /// Whether the session has expired by the wall clock.
    #[must_use]
    pub fn is_expired_now(&self) -> bool {
        self.is_expired(OffsetDateTime::now_utc().unix_timestamp())
    }
}

/// Result of a successful sign-up.
#[derive(Debug, Clone)]
pub struct SignUpOutcome {
    pub identity: Identity,
    /// Present when the provider signed the user in immediately.
    pub session: Option<Session>,
}

// =============================================================================
// EVENTS
// =============================================================================

/// Why the provider's session changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthChange {
    InitialSession,
    SignedIn,
    SignedOut,
    TokenRefreshed,
}

/// A session-change notification. `session` is `None` when signed out.
#[derive(Debug, Clone)]
pub struct SessionEvent {
    pub change: AuthChange,
    pub session: Option<Session>,
}

impl SessionEvent {
    #[must_use]
    pub fn new(change: AuthChange, session: Option<Session>) -> Self {
        Self { change, session }
    }
}

/// Receiving end of a session-change subscription. Drop to unsubscribe.
pub type SessionSubscription = mpsc::UnboundedReceiver<SessionEvent>;

/// Current session plus fan-out of its changes to any number of subscribers.
///
/// The cached session and the subscriber list share one lock: a change is
/// stored and delivered in one step, and a new subscriber's initial snapshot
/// is taken in the same step that registers it.
#[derive(Debug, Default)]
pub struct SessionBroadcaster {
    inner: Mutex<BroadcastState>,
}

#[derive(Debug, Default)]
struct BroadcastState {
    current: Option<Session>,
    subscribers: Vec<mpsc::UnboundedSender<SessionEvent>>,
}

impl BroadcastState {
    fn deliver(&mut self, event: &SessionEvent) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

impl SessionBroadcaster {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BroadcastState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The cached session.
    #[must_use]
    pub fn current(&self) -> Option<Session> {
        self.lock().current.clone()
    }

    /// Replace the cached session without notifying anyone.
    pub fn set_current(&self, session: Option<Session>) {
        self.lock().current = session;
    }

    /// Replace the cached session and deliver `change` to every subscriber.
    pub fn publish(&self, change: AuthChange, session: Option<Session>) {
        let mut state = self.lock();
        state.current.clone_from(&session);
        state.deliver(&SessionEvent::new(change, session));
    }

    /// Deliver `event` without touching the cached session.
    pub fn emit(&self, event: &SessionEvent) {
        self.lock().deliver(event);
    }

    /// Register a subscriber whose first event is `InitialSession` with the
    /// cached session.
    pub fn subscribe(&self) -> SessionSubscription {
        let mut state = self.lock();
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(SessionEvent::new(AuthChange::InitialSession, state.current.clone()));
        state.subscribers.push(tx);
        rx
    }

    /// Register a subscriber that only sees later events.
    pub fn subscribe_quiet(&self) -> SessionSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().subscribers.push(tx);
        rx
    }

    /// Number of subscribers whose receivers are still alive.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        let mut state = self.lock();
        state.subscribers.retain(|tx| !tx.is_closed());
        state.subscribers.len()
    }
}

// =============================================================================
// SESSION SOURCE TRAIT
// =============================================================================

/// Identity-provider client consumed by the synchronizer. Enables fakes in tests.
#[async_trait::async_trait]
pub trait SessionSource: Send + Sync {
    /// Point-in-time read of the current session.
    ///
    /// # Errors
    ///
    /// Returns an [`AuthError`] if the provider cannot produce a session.
    async fn get_session(&self) -> Result<Option<Session>, AuthError>;

    /// Subscribe to session changes. Dropping the receiver unsubscribes.
    fn on_session_change(&self) -> SessionSubscription;

    /// Register a new account.
    ///
    /// # Errors
    ///
    /// Returns an [`AuthError`] if the provider rejects the sign-up.
    async fn sign_up(&self, email: &str, password: &str, metadata: &SignupMetadata)
    -> Result<SignUpOutcome, AuthError>;

    /// Sign in with email and password.
    ///
    /// # Errors
    ///
    /// Returns an [`AuthError`] if the credentials are rejected.
    async fn sign_in(&self, email: &str, password: &str) -> Result<Session, AuthError>;

    /// End the current session.
    ///
    /// # Errors
    ///
    /// Returns an [`AuthError`] if the provider call fails.
    async fn sign_out(&self) -> Result<(), AuthError>;
}

#[cfg(test)]
#[path = "session_test.rs"]
mod tests;

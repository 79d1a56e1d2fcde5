//! GoTrue REST client — the concrete [`SessionSource`].
//!
//! Thin HTTP wrapper over `/auth/v1/{signup,token,logout}` of a
//! GoTrue-compatible identity provider (the Supabase auth server). The client
//! caches the current session in memory and fans session changes out through
//! a [`SessionBroadcaster`]. Response parsing lives in pure functions for
//! testability.

use std::time::Duration;

use serde::Deserialize;
use time::OffsetDateTime;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::AuthConfig;
use crate::session::{
    AuthChange, AuthError, Identity, Session, SessionBroadcaster, SessionSource, SessionSubscription, SignUpOutcome,
    SignupMetadata,
};

// =============================================================================
// CLIENT
// =============================================================================

pub struct GoTrueClient {
    http: reqwest::Client,
    base_url: String,
    anon_key: String,
    /// Cached session and its subscribers.
    events: SessionBroadcaster,
}

impl GoTrueClient {
    /// Build a client from typed config.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::HttpClientBuild`] if the HTTP client fails to build.
    pub fn new(config: &AuthConfig) -> Result<Self, AuthError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeouts.request_secs))
            .connect_timeout(Duration::from_secs(config.timeouts.connect_secs))
            .build()
            .map_err(|e| AuthError::HttpClientBuild(e.to_string()))?;
        Ok(Self {
            http,
            base_url: config.base_url.clone(),
            anon_key: config.anon_key.clone(),
            events: SessionBroadcaster::new(),
        })
    }

    /// Adopt a previously persisted session and announce it as `SignedIn`.
    pub fn restore_session(&self, session: Session) {
        self.replace_session(Some(session), AuthChange::SignedIn);
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/auth/v1/{path}", self.base_url)
    }

    fn replace_session(&self, session: Option<Session>, change: AuthChange) {
        debug!(?change, "session changed");
        self.events.publish(change, session);
    }

    async fn post(&self, url: &str, body: Option<&serde_json::Value>, bearer: Option<&str>) -> Result<String, AuthError> {
        let mut request = self.http.post(url).header("apikey", &self.anon_key);
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| AuthError::Network(e.to_string()))?;
        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| AuthError::Network(e.to_string()))?;

        if !(200..300).contains(&status) {
            return Err(AuthError::Rejected { status, message: error_message(status, &text) });
        }
        Ok(text)
    }

    async fn refresh(&self, refresh_token: &str) -> Result<Session, AuthError> {
        let body = serde_json::json!({ "refresh_token": refresh_token });
        let text = self
            .post(&self.endpoint("token?grant_type=refresh_token"), Some(&body), None)
            .await?;
        parse_session(&text, now_unix())
    }
}

#[async_trait::async_trait]
impl SessionSource for GoTrueClient {
    async fn get_session(&self) -> Result<Option<Session>, AuthError> {
        let Some(session) = self.events.current() else {
            return Ok(None);
        };
        if !session.is_expired_now() {
            return Ok(Some(session));
        }

        let Some(refresh_token) = session.refresh_token.clone() else {
            self.replace_session(None, AuthChange::SignedOut);
            return Ok(None);
        };
        match self.refresh(&refresh_token).await {
            Ok(fresh) => {
                self.replace_session(Some(fresh.clone()), AuthChange::TokenRefreshed);
                Ok(Some(fresh))
            }
            Err(AuthError::Rejected { status, message }) => {
                warn!(status, %message, "refresh token rejected; signing out");
                self.replace_session(None, AuthChange::SignedOut);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn on_session_change(&self) -> SessionSubscription {
        self.events.subscribe()
    }

    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        metadata: &SignupMetadata,
    ) -> Result<SignUpOutcome, AuthError> {
        let body = serde_json::json!({ "email": email, "password": password, "data": metadata });
        let text = self.post(&self.endpoint("signup"), Some(&body), None).await?;
        let outcome = parse_sign_up(&text, now_unix())?;
        if let Some(session) = &outcome.session {
            self.replace_session(Some(session.clone()), AuthChange::SignedIn);
        }
        Ok(outcome)
    }

    async fn sign_in(&self, email: &str, password: &str) -> Result<Session, AuthError> {
        let body = serde_json::json!({ "email": email, "password": password });
        let text = self
            .post(&self.endpoint("token?grant_type=password"), Some(&body), None)
            .await?;
        let session = parse_session(&text, now_unix())?;
        self.replace_session(Some(session.clone()), AuthChange::SignedIn);
        Ok(session)
    }

    async fn sign_out(&self) -> Result<(), AuthError> {
        let result = match self.events.current() {
            Some(session) => self
                .post(&self.endpoint("logout"), None, Some(&session.access_token))
                .await
                .map(|_| ()),
            None => Ok(()),
        };
        // The local session ends regardless; an already-invalid token is not an error.
        self.replace_session(None, AuthChange::SignedOut);
        match result {
            Err(AuthError::Rejected { status: 401 | 403 | 404, .. }) => Ok(()),
            other => other,
        }
    }
}

// =============================================================================
// WIRE TYPES
// =============================================================================

#[derive(Deserialize)]
struct WireUser {
    id: Uuid,
    email: Option<String>,
    email_confirmed_at: Option<String>,
    confirmed_at: Option<String>,
    #[serde(default)]
    user_metadata: serde_json::Value,
}

#[derive(Deserialize)]
struct WireSession {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
    expires_at: Option<i64>,
    user: WireUser,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WireSignUp {
    Session(WireSession),
    User(WireUser),
}

#[derive(Deserialize)]
struct WireError {
    error_description: Option<String>,
    msg: Option<String>,
    message: Option<String>,
    error: Option<String>,
}

// =============================================================================
// PARSING
// =============================================================================

fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

fn identity_from_wire(user: WireUser) -> Identity {
    let metadata = serde_json::from_value::<SignupMetadata>(user.user_metadata).unwrap_or_default();
    Identity {
        id: user.id,
        email: user.email.unwrap_or_default(),
        confirmed: user.email_confirmed_at.is_some() || user.confirmed_at.is_some(),
        metadata,
    }
}

fn session_from_wire(wire: WireSession, now_unix: i64) -> Session {
    let expires_at = wire
        .expires_at
        .or_else(|| wire.expires_in.map(|secs| now_unix + secs));
    Session {
        access_token: wire.access_token,
        refresh_token: wire.refresh_token,
        expires_at,
        identity: identity_from_wire(wire.user),
    }
}

/// Parse a token-endpoint response into a session.
pub(crate) fn parse_session(json: &str, now_unix: i64) -> Result<Session, AuthError> {
    let wire: WireSession = serde_json::from_str(json).map_err(|e| AuthError::Parse(e.to_string()))?;
    Ok(session_from_wire(wire, now_unix))
}

/// Parse a sign-up response: a full session when auto-confirmed, else a bare user.
pub(crate) fn parse_sign_up(json: &str, now_unix: i64) -> Result<SignUpOutcome, AuthError> {
    let wire: WireSignUp = serde_json::from_str(json).map_err(|e| AuthError::Parse(e.to_string()))?;
    Ok(match wire {
        WireSignUp::Session(wire) => {
            let session = session_from_wire(wire, now_unix);
            SignUpOutcome { identity: session.identity.clone(), session: Some(session) }
        }
        WireSignUp::User(user) => SignUpOutcome { identity: identity_from_wire(user), session: None },
    })
}

/// Pull the most specific human-readable message out of an error body.
pub(crate) fn error_message(status: u16, body: &str) -> String {
    let parsed = serde_json::from_str::<WireError>(body).ok().and_then(|e| {
        e.error_description
            .or(e.msg)
            .or(e.message)
            .or(e.error)
    });
    match parsed {
        Some(message) if !message.trim().is_empty() => message,
        _ if !body.trim().is_empty() => body.trim().to_owned(),
        _ => format!("identity provider returned status {status}"),
    }
}

#[cfg(test)]
#[path = "gotrue_test.rs"]
mod tests;

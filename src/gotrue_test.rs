use super::*;
use crate::config::AuthTimeouts;
use crate::error::ErrorCode;
use crate::state::test_helpers::session_for;

fn offline_client() -> GoTrueClient {
    let config = AuthConfig {
        base_url: "http://127.0.0.1:9".into(),
        anon_key: "anon-key".into(),
        timeouts: AuthTimeouts { request_secs: 1, connect_secs: 1 },
    };
    GoTrueClient::new(&config).unwrap()
}

const USER_ID: &str = "6f1d1f3e-8c4a-4a55-9d0b-2a2c3f1e9b10";

fn token_body(expires: &str, confirmed: bool) -> String {
    let confirmed_at = if confirmed { r#""2024-01-01T00:00:00Z""# } else { "null" };
    format!(
        r#"{{
            "access_token": "at",
            "token_type": "bearer",
            "refresh_token": "rt",
            {expires},
            "user": {{
                "id": "{USER_ID}",
                "email": "ada@example.com",
                "email_confirmed_at": {confirmed_at},
                "user_metadata": {{"first_name": "Ada", "last_name": "Lovelace"}}
            }}
        }}"#
    )
}

// =============================================================================
// parse_session
// =============================================================================

#[test]
fn parse_session_prefers_absolute_expiry() {
    let body = token_body(r#""expires_in": 3600, "expires_at": 5000"#, true);
    let session = parse_session(&body, 1_000).unwrap();
    assert_eq!(session.expires_at, Some(5_000));
    assert_eq!(session.access_token, "at");
    assert_eq!(session.refresh_token.as_deref(), Some("rt"));
}

#[test]
fn parse_session_derives_expiry_from_expires_in() {
    let body = token_body(r#""expires_in": 3600"#, true);
    let session = parse_session(&body, 1_000).unwrap();
    assert_eq!(session.expires_at, Some(4_600));
}

#[test]
fn parse_session_maps_identity_and_metadata() {
    let body = token_body(r#""expires_in": 60"#, true);
    let identity = parse_session(&body, 0).unwrap().identity;
    assert_eq!(identity.id.to_string(), USER_ID);
    assert_eq!(identity.email, "ada@example.com");
    assert!(identity.confirmed);
    assert_eq!(identity.metadata.first_name.as_deref(), Some("Ada"));
    assert_eq!(identity.metadata.last_name.as_deref(), Some("Lovelace"));
}

#[test]
fn parse_session_treats_missing_confirmation_as_unconfirmed() {
    let body = token_body(r#""expires_in": 60"#, false);
    assert!(!parse_session(&body, 0).unwrap().identity.confirmed);
}

#[test]
fn parse_session_tolerates_unexpected_metadata() {
    let body = format!(
        r#"{{"access_token":"at","user":{{"id":"{USER_ID}","email":"a@b.c","user_metadata":{{"first_name":42}}}}}}"#
    );
    let session = parse_session(&body, 0).unwrap();
    assert_eq!(session.identity.metadata, SignupMetadata::default());
    assert_eq!(session.expires_at, None);
}

#[test]
fn parse_session_rejects_garbage() {
    let err = parse_session("not json", 0).unwrap_err();
    assert!(matches!(err, AuthError::Parse(_)));
}

// =============================================================================
// parse_sign_up
// =============================================================================

#[test]
fn parse_sign_up_with_session_signs_in() {
    let body = token_body(r#""expires_in": 3600"#, true);
    let outcome = parse_sign_up(&body, 0).unwrap();
    let session = outcome.session.expect("session");
    assert_eq!(session.identity, outcome.identity);
    assert!(outcome.identity.confirmed);
}

#[test]
fn parse_sign_up_bare_user_has_no_session() {
    let body = format!(r#"{{"id":"{USER_ID}","email":"ada@example.com","confirmation_sent_at":"2024-01-01T00:00:00Z"}}"#);
    let outcome = parse_sign_up(&body, 0).unwrap();
    assert!(outcome.session.is_none());
    assert!(!outcome.identity.confirmed);
    assert_eq!(outcome.identity.email, "ada@example.com");
}

// =============================================================================
// error_message
// =============================================================================

#[test]
fn error_message_prefers_error_description() {
    let body = r#"{"error":"invalid_grant","error_description":"Invalid login credentials"}"#;
    assert_eq!(error_message(400, body), "Invalid login credentials");
}

#[test]
fn error_message_reads_msg() {
    assert_eq!(error_message(422, r#"{"code":422,"msg":"User already registered"}"#), "User already registered");
}

#[test]
fn error_message_falls_back_to_raw_body() {
    assert_eq!(error_message(502, "  Bad Gateway \n"), "Bad Gateway");
}

#[test]
fn error_message_falls_back_to_status() {
    assert_eq!(error_message(503, ""), "identity provider returned status 503");
}

// =============================================================================
// client session cache
// =============================================================================

#[tokio::test]
async fn new_subscriber_receives_initial_session() {
    let client = offline_client();
    let mut rx = client.on_session_change();
    let event = rx.try_recv().unwrap();
    assert_eq!(event.change, AuthChange::InitialSession);
    assert!(event.session.is_none());
}

#[tokio::test]
async fn get_session_without_session_is_none() {
    let client = offline_client();
    assert!(client.get_session().await.unwrap().is_none());
}

#[tokio::test]
async fn restore_session_is_returned_and_announced() {
    let client = offline_client();
    let mut rx = client.on_session_change();
    let _ = rx.try_recv();

    let session = session_for(Uuid::new_v4(), "ada@example.com");
    client.restore_session(session.clone());

    let event = rx.try_recv().unwrap();
    assert_eq!(event.change, AuthChange::SignedIn);
    assert_eq!(event.session.as_ref(), Some(&session));
    assert_eq!(client.get_session().await.unwrap(), Some(session));
}

#[tokio::test]
async fn expired_session_without_refresh_token_signs_out() {
    let client = offline_client();
    let mut session = session_for(Uuid::new_v4(), "ada@example.com");
    session.expires_at = Some(1);
    session.refresh_token = None;
    client.restore_session(session);

    let mut rx = client.on_session_change();
    let _ = rx.try_recv();

    assert!(client.get_session().await.unwrap().is_none());
    let event = rx.try_recv().unwrap();
    assert_eq!(event.change, AuthChange::SignedOut);
    assert!(event.session.is_none());
}

#[tokio::test]
async fn sign_out_without_session_still_announces() {
    let client = offline_client();
    let mut rx = client.on_session_change();
    let _ = rx.try_recv();

    client.sign_out().await.unwrap();
    assert_eq!(rx.try_recv().unwrap().change, AuthChange::SignedOut);
}

#[tokio::test]
async fn sign_in_against_unreachable_provider_is_network_error() {
    let client = offline_client();
    let err = client.sign_in("ada@example.com", "pw").await.unwrap_err();
    assert!(matches!(err, AuthError::Network(_)));
    assert!(err.retryable());
    assert!(client.get_session().await.unwrap().is_none());
}

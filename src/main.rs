use std::sync::Arc;

use authsync::config::{AuthConfig, Credentials, DbConfig};
use authsync::db::{self, PgProfileStore};
use authsync::gotrue::GoTrueClient;
use authsync::{ErrorCode, Profile, SessionSynchronizer};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let auth_config = AuthConfig::from_env().expect("auth config");
    let db_config = DbConfig::from_env().expect("database config");

    let pool = db::init_pool(&db_config)
        .await
        .expect("database init failed");
    let source = Arc::new(GoTrueClient::new(&auth_config).expect("auth client"));
    let store = Arc::new(PgProfileStore::new(pool));

    let sync = SessionSynchronizer::start(source, store);
    let mut states = sync.subscribe();

    if let Some(credentials) = Credentials::from_env() {
        if let Err(e) = sync.sign_in(&credentials.email, &credentials.password).await {
            tracing::error!(error = %e, code = e.error_code(), "sign-in failed");
        }
    }

    tracing::info!(auth_url = %auth_config.base_url, "authsync running");
    loop {
        tokio::select! {
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = states.borrow_and_update().clone();
                let display_name = state.profile.as_ref().map_or_else(String::new, Profile::display_name);
                match serde_json::to_string(&state) {
                    Ok(json) => tracing::info!(user = %display_name, state = %json, "sync state"),
                    Err(e) => tracing::warn!(error = %e, "failed to serialize sync state"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutting down");
                break;
            }
        }
    }

    sync.dispose();
}

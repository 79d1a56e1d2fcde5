use super::*;

fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
        .collect()
}

// =============================================================================
// AuthConfig
// =============================================================================

#[test]
fn auth_config_defaults_timeouts() {
    let vars = env(&[("AUTH_URL", "https://demo.supabase.co/"), ("AUTH_ANON_KEY", "anon")]);
    let cfg = AuthConfig::from_lookup(map_lookup(&vars)).unwrap();
    assert_eq!(cfg.base_url, "https://demo.supabase.co");
    assert_eq!(cfg.anon_key, "anon");
    assert_eq!(cfg.timeouts, AuthTimeouts::default());
}

#[test]
fn auth_config_reads_timeouts() {
    let vars = env(&[
        ("AUTH_URL", "http://localhost:9999"),
        ("AUTH_ANON_KEY", "anon"),
        ("AUTH_REQUEST_TIMEOUT_SECS", "5"),
        ("AUTH_CONNECT_TIMEOUT_SECS", " 2 "),
    ]);
    let cfg = AuthConfig::from_lookup(map_lookup(&vars)).unwrap();
    assert_eq!(cfg.timeouts, AuthTimeouts { request_secs: 5, connect_secs: 2 });
}

#[test]
fn auth_config_bad_timeout_falls_back_to_default() {
    let vars = env(&[
        ("AUTH_URL", "http://localhost:9999"),
        ("AUTH_ANON_KEY", "anon"),
        ("AUTH_REQUEST_TIMEOUT_SECS", "soon"),
    ]);
    let cfg = AuthConfig::from_lookup(map_lookup(&vars)).unwrap();
    assert_eq!(cfg.timeouts.request_secs, DEFAULT_AUTH_REQUEST_TIMEOUT_SECS);
}

#[test]
fn auth_config_missing_url() {
    let vars = env(&[("AUTH_ANON_KEY", "anon")]);
    let err = AuthConfig::from_lookup(map_lookup(&vars)).unwrap_err();
    assert_eq!(err, ConfigError::Missing("AUTH_URL"));
    assert_eq!(err.error_code(), "E_CONFIG_MISSING");
}

#[test]
fn auth_config_blank_key_is_missing() {
    let vars = env(&[("AUTH_URL", "https://demo.supabase.co"), ("AUTH_ANON_KEY", "  ")]);
    let err = AuthConfig::from_lookup(map_lookup(&vars)).unwrap_err();
    assert_eq!(err, ConfigError::Missing("AUTH_ANON_KEY"));
}

#[test]
fn auth_config_rejects_non_http_url() {
    let vars = env(&[("AUTH_URL", "demo.supabase.co"), ("AUTH_ANON_KEY", "anon")]);
    let err = AuthConfig::from_lookup(map_lookup(&vars)).unwrap_err();
    assert_eq!(err, ConfigError::Invalid { key: "AUTH_URL", value: "demo.supabase.co".into() });
}

// =============================================================================
// DbConfig / Credentials
// =============================================================================

#[test]
fn db_config_defaults_max_connections() {
    let vars = env(&[("DATABASE_URL", "postgres://localhost/app")]);
    let cfg = DbConfig::from_lookup(map_lookup(&vars)).unwrap();
    assert_eq!(cfg.url, "postgres://localhost/app");
    assert_eq!(cfg.max_connections, DEFAULT_DB_MAX_CONNECTIONS);
}

#[test]
fn db_config_requires_url() {
    let vars = env(&[("DB_MAX_CONNECTIONS", "9")]);
    assert_eq!(DbConfig::from_lookup(map_lookup(&vars)).unwrap_err(), ConfigError::Missing("DATABASE_URL"));
}

#[test]
fn credentials_need_both_values() {
    let only_email = env(&[("AUTHSYNC_EMAIL", "a@example.com")]);
    assert!(Credentials::from_lookup(map_lookup(&only_email)).is_none());

    let both = env(&[("AUTHSYNC_EMAIL", "a@example.com"), ("AUTHSYNC_PASSWORD", "hunter2")]);
    let creds = Credentials::from_lookup(map_lookup(&both)).unwrap();
    assert_eq!(creds.email, "a@example.com");
    assert!(!format!("{creds:?}").contains("hunter2"));
}

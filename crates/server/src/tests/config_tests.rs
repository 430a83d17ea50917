use std::collections::HashMap;

use super::*;

#[test]
fn defaults_seed_a_demo_account() {
    let settings = Settings::default();
    assert_eq!(settings.server_bind, "127.0.0.1:8443");
    assert_eq!(settings.users.len(), 1);
    assert_eq!(settings.users[0].email, "demo@tours.example");
    assert!(settings.access_ttl_seconds < settings.refresh_ttl_seconds);
}

#[test]
fn toml_file_replaces_accounts_and_keeps_other_defaults() {
    let settings: Settings = toml::from_str(
        r#"
jwt_secret = "from-file"

[[users]]
id = "u1"
email = "ana@tours.example"
password = "secret"
display_name = "Ana"
"#,
    )
    .expect("toml");

    assert_eq!(settings.jwt_secret, "from-file");
    assert_eq!(settings.users.len(), 1);
    assert_eq!(settings.users[0].id, "u1");
    assert_eq!(settings.access_ttl_seconds, 900);
}

#[test]
fn env_overrides_apply_last() {
    let env: HashMap<&str, &str> = HashMap::from([
        ("SERVER_BIND", "0.0.0.0:1"),
        ("APP__BIND_ADDR", "0.0.0.0:9000"),
        ("APP__JWT_SECRET", "from-env"),
        ("APP__ACCESS_TTL_SECONDS", "60"),
        ("APP__REFRESH_TTL_SECONDS", "not-a-number"),
        ("APP__COOKIE_SECURE", "true"),
    ]);

    let settings = apply_env_overrides(Settings::default(), |key| {
        env.get(key).map(|value| value.to_string())
    });

    assert_eq!(settings.server_bind, "0.0.0.0:9000");
    assert_eq!(settings.jwt_secret, "from-env");
    assert_eq!(settings.access_ttl_seconds, 60);
    assert_eq!(
        settings.refresh_ttl_seconds,
        Settings::default().refresh_ttl_seconds
    );
    assert!(settings.cookie_secure);
}

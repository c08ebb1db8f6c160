use chat_relay::config::{RelayConfig, UpstreamAuthType};
use std::collections::HashMap;
use std::time::Duration;

fn from_vars(vars: &[(&str, &str)]) -> Result<RelayConfig, chat_relay::error::AppError> {
    let map: HashMap<&str, &str> = vars.iter().copied().collect();
    RelayConfig::from_lookup(|key| map.get(key).map(|v| v.to_string()))
}

#[test]
fn defaults_apply_when_only_credential_is_set() {
    let cfg = from_vars(&[("OPENAI_API_KEY", "sk-test")]).expect("config");
    assert_eq!(cfg.listen, "0.0.0.0:8080");
    assert_eq!(cfg.metrics_path, "/metrics");
    assert_eq!(cfg.deadline, Duration::from_secs(55));
    assert_eq!(cfg.allowed_origin, "*");
    assert_eq!(cfg.upstream.auth.auth_type, UpstreamAuthType::Bearer);
    assert_eq!(cfg.upstream.auth.value, "sk-test");
    assert_eq!(cfg.system_prompt, chat_relay::config::DEFAULT_SYSTEM_PROMPT);
    assert!(cfg.upstream.temperature.is_none());
}

#[test]
fn relay_key_wins_over_openai_key() {
    let cfg = from_vars(&[
        ("OPENAI_API_KEY", "sk-fallback"),
        ("CHAT_RELAY_UPSTREAM_API_KEY", "sk-primary"),
    ])
    .expect("config");
    assert_eq!(cfg.upstream.auth.value, "sk-primary");
}

#[test]
fn missing_credential_fails_startup() {
    let err = from_vars(&[]).unwrap_err();
    assert_eq!(err.code, "config_invalid");
    assert!(err.message.contains("CHAT_RELAY_UPSTREAM_API_KEY"));
}

#[test]
fn invalid_numbers_fail_startup() {
    let err = from_vars(&[
        ("OPENAI_API_KEY", "sk-test"),
        ("CHAT_RELAY_DEADLINE_MS", "soon"),
    ])
    .unwrap_err();
    assert!(err.message.starts_with("CHAT_RELAY_DEADLINE_MS"));

    let err = from_vars(&[
        ("OPENAI_API_KEY", "sk-test"),
        ("CHAT_RELAY_DEADLINE_MS", "0"),
    ])
    .unwrap_err();
    assert_eq!(err.code, "config_invalid");
}

#[test]
fn header_auth_and_sampling_options() {
    let cfg = from_vars(&[
        ("CHAT_RELAY_UPSTREAM_API_KEY", "secret"),
        ("CHAT_RELAY_UPSTREAM_AUTH", "header"),
        ("CHAT_RELAY_UPSTREAM_AUTH_NAME", "api-key"),
        ("CHAT_RELAY_TEMPERATURE", "0.2"),
        ("CHAT_RELAY_MAX_TOKENS", "512"),
        ("CHAT_RELAY_DEADLINE_MS", "1500"),
    ])
    .expect("config");
    assert_eq!(cfg.upstream.auth.auth_type, UpstreamAuthType::Header);
    assert_eq!(cfg.upstream.auth.header_name.as_deref(), Some("api-key"));
    assert_eq!(cfg.upstream.temperature, Some(0.2));
    assert_eq!(cfg.upstream.max_tokens, Some(512));
    assert_eq!(cfg.deadline, Duration::from_millis(1500));
}

#[tokio::test]
async fn state_loads_from_config() {
    let cfg = from_vars(&[("OPENAI_API_KEY", "sk-test")]).expect("config");
    let state = chat_relay::app::load_state_with_config(cfg).expect("load state");
    assert_eq!(state.config.upstream.model, "gpt-4o-mini");
    let _router = chat_relay::app::build_app(state);
}

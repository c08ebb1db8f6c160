use crate::error::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant. Answer clearly and concisely. \
When the user shares a file, acknowledge it and help with whatever they ask about it.";

const DEFAULT_LISTEN: &str = "0.0.0.0:8080";
const DEFAULT_METRICS_PATH: &str = "/metrics";
const DEFAULT_BASE_URL: &str = "https://api.openai.com";
const DEFAULT_MODEL: &str = "gpt-4o-mini";
const DEFAULT_DEADLINE_MS: u64 = 55_000;
const DEFAULT_BODY_LIMIT_BYTES: usize = 25 * 1024 * 1024;

/// Process-wide relay configuration. Read once at startup and shared read-only.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen: String,
    pub metrics_path: String,
    pub upstream: UpstreamConfig,
    pub system_prompt: String,
    pub deadline: Duration,
    pub allowed_origin: String,
    pub body_limit_bytes: usize,
}

#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub base_url: String,
    pub model: String,
    pub auth: UpstreamAuthConfig,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct UpstreamAuthConfig {
    pub auth_type: UpstreamAuthType,
    pub value: String,
    pub header_name: Option<String>,
    pub query_name: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UpstreamAuthType {
    Bearer,
    Header,
    Query,
}

impl FromStr for UpstreamAuthType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bearer" => Ok(Self::Bearer),
            "header" => Ok(Self::Header),
            "query" => Ok(Self::Query),
            other => Err(format!(
                "unknown upstream auth type `{other}` (expected bearer, header or query)"
            )),
        }
    }
}

impl RelayConfig {
    pub fn from_env() -> AppResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary variable source. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> AppResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let api_key = get("CHAT_RELAY_UPSTREAM_API_KEY")
            .or_else(|| get("OPENAI_API_KEY"))
            .ok_or_else(|| {
                AppError::config("CHAT_RELAY_UPSTREAM_API_KEY (or OPENAI_API_KEY) must be set")
            })?;
        let auth_type = match get("CHAT_RELAY_UPSTREAM_AUTH") {
            Some(raw) => raw.parse::<UpstreamAuthType>().map_err(AppError::config)?,
            None => UpstreamAuthType::Bearer,
        };
        let auth_name = get("CHAT_RELAY_UPSTREAM_AUTH_NAME");
        let auth = UpstreamAuthConfig {
            auth_type,
            value: api_key,
            header_name: auth_name
                .clone()
                .filter(|_| auth_type == UpstreamAuthType::Header),
            query_name: auth_name.filter(|_| auth_type == UpstreamAuthType::Query),
        };

        let upstream = UpstreamConfig {
            base_url: get("CHAT_RELAY_UPSTREAM_BASE_URL")
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            model: get("CHAT_RELAY_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            auth,
            temperature: parse_optional(get("CHAT_RELAY_TEMPERATURE"), "CHAT_RELAY_TEMPERATURE")?,
            max_tokens: parse_optional(get("CHAT_RELAY_MAX_TOKENS"), "CHAT_RELAY_MAX_TOKENS")?,
        };

        let deadline_ms: u64 =
            parse_optional(get("CHAT_RELAY_DEADLINE_MS"), "CHAT_RELAY_DEADLINE_MS")?
                .unwrap_or(DEFAULT_DEADLINE_MS);
        if deadline_ms == 0 {
            return Err(AppError::config("CHAT_RELAY_DEADLINE_MS must be positive"));
        }

        Ok(Self {
            listen: get("CHAT_RELAY_LISTEN").unwrap_or_else(|| DEFAULT_LISTEN.to_string()),
            metrics_path: get("CHAT_RELAY_METRICS_PATH")
                .unwrap_or_else(|| DEFAULT_METRICS_PATH.to_string()),
            upstream,
            system_prompt: get("CHAT_RELAY_SYSTEM_PROMPT")
                .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
            deadline: Duration::from_millis(deadline_ms),
            allowed_origin: get("CHAT_RELAY_ALLOWED_ORIGIN").unwrap_or_else(|| "*".to_string()),
            body_limit_bytes: parse_optional(
                get("CHAT_RELAY_BODY_LIMIT_BYTES"),
                "CHAT_RELAY_BODY_LIMIT_BYTES",
            )?
            .unwrap_or(DEFAULT_BODY_LIMIT_BYTES),
        })
    }
}

fn parse_optional<T>(raw: Option<String>, key: &str) -> AppResult<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.map(|v| {
        v.trim()
            .parse::<T>()
            .map_err(|err| AppError::config(format!("{key}: {err}")))
    })
    .transpose()
}

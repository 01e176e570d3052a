//! Environment-driven configuration

use std::env;
use std::time::Duration;

/// Backend configuration, loaded from the environment
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub redis_url: String,
    pub session_secret: String,
    pub join_token_key: String,
    pub cors_allowed_origins: Vec<String>,
    pub room_ttl: Duration,
    pub cookie_secure: bool,
    pub cookie_domain: String,
    pub openai_api_key: String,
    pub openai_base_url: String,
    pub public_base_url: String,
    pub ecb_rates_url: String,
}

impl Config {
    /// Load configuration from environment variables, falling back to
    /// defaults suitable for local development.
    pub fn from_env() -> Self {
        Self {
            port: env_parse("BACKEND_PORT", 8080),
            redis_url: env_or("REDIS_URL", "redis://127.0.0.1:6379/0"),
            session_secret: env::var("SESSION_SECRET").unwrap_or_default(),
            join_token_key: env::var("JOIN_TOKEN_SIGNING_KEY").unwrap_or_default(),
            cors_allowed_origins: split_csv(&env::var("CORS_ALLOWED_ORIGINS").unwrap_or_default()),
            room_ttl: Duration::from_secs(env_parse("ROOM_TTL_SECONDS", 14_400)),
            cookie_secure: env_bool("COOKIE_SECURE", true),
            cookie_domain: env::var("COOKIE_DOMAIN").unwrap_or_default(),
            openai_api_key: env::var("OPENAI_API_KEY").unwrap_or_default(),
            openai_base_url: env_or("OPENAI_BASE_URL", "https://api.openai.com"),
            public_base_url: env_or("PUBLIC_BASE_URL", "https://localhost"),
            ecb_rates_url: env_or("ECB_RATES_URL", "https://api.exchangerate.host/latest"),
        }
    }
}

fn env_or(key: &str, fallback: &str) -> String {
    match env::var(key) {
        Ok(value) if !value.is_empty() => value,
        _ => fallback.to_string(),
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, fallback: T) -> T {
    env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(fallback)
}

fn env_bool(key: &str, fallback: bool) -> bool {
    match env::var(key) {
        Ok(value) if !value.is_empty() => matches!(
            value.to_ascii_lowercase().as_str(),
            "1" | "t" | "true" | "yes" | "on"
        ),
        _ => fallback,
    }
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_split_csv_trims_and_drops_empty_entries() {
        let origins = split_csv(" https://a.example , ,https://b.example,");
        assert_eq!(origins, vec!["https://a.example", "https://b.example"]);
    }

    #[test]
    fn test_split_csv_empty_input_yields_no_origins() {
        assert!(split_csv("").is_empty());
    }
}

//! Gateway configuration loaded from the environment (spec.md 6).

use std::env;
use std::time::Duration;

use crate::error::ConfigError;
use crate::registry::UpstreamName;

#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub name: UpstreamName,
    pub enabled: bool,
    pub command: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub enabled: bool,
    pub ttl: Duration,
    pub max_size: usize,
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub upstreams: Vec<UpstreamConfig>,
    pub cache: CacheConfig,
    pub retry: RetryConfig,
    pub max_concurrent_operations: usize,
    pub metrics_enabled: bool,
    pub log_level: String,
}

impl GatewayConfig {
    /// Parse the full gateway configuration from process environment
    /// variables, applying spec.md 6's documented defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let upstreams = UpstreamName::all()
            .into_iter()
            .map(upstream_config_from_env)
            .collect::<Result<Vec<_>, _>>()?;

        let cache = CacheConfig {
            enabled: bool_var("CACHE_ENABLED", true)?,
            ttl: Duration::from_secs(u64_var("CACHE_TTL_SECONDS", 300)?),
            max_size: u64_var("CACHE_MAX_SIZE", 1000)? as usize,
        };

        let retry = RetryConfig {
            max_attempts: u64_var("RETRY_MAX_ATTEMPTS", 3)? as u32,
            initial_delay: Duration::from_millis(u64_var("RETRY_INITIAL_DELAY_MS", 1000)?),
            max_delay: Duration::from_millis(u64_var("RETRY_MAX_DELAY_MS", 10000)?),
        };

        let max_concurrent_operations = u64_var("MAX_CONCURRENT_OPERATIONS", 10)? as usize;
        let metrics_enabled = bool_var("METRICS_ENABLED", true)?;
        let log_level = log_level_var()?;

        Ok(Self {
            upstreams,
            cache,
            retry,
            max_concurrent_operations,
            metrics_enabled,
            log_level,
        })
    }
}

fn upstream_config_from_env(name: UpstreamName) -> Result<UpstreamConfig, ConfigError> {
    let prefix = name.as_str().to_uppercase();
    let enabled = bool_var(&format!("{prefix}_ENABLED"), true)?;

    if name == UpstreamName::Tavily && enabled && env::var("TAVILY_API_KEY").is_err() {
        return Err(ConfigError::MissingRequired("TAVILY_API_KEY"));
    }

    let command = match env::var(format!("{prefix}_COMMAND")) {
        Ok(value) if value.trim().is_empty() => {
            return Err(ConfigError::EmptyCommand(leak_upper(&prefix)));
        }
        Ok(value) => Some(value),
        Err(_) => None,
    };

    Ok(UpstreamConfig {
        name,
        enabled,
        command,
    })
}

/// `&'static str` keys are required by [`ConfigError`], but the upstream
/// prefix is computed at runtime; leaking a handful of short strings once
/// per process start is cheap and keeps the error type simple.
fn leak_upper(value: &str) -> &'static str {
    Box::leak(value.to_string().into_boxed_str())
}

fn bool_var(key: &str, default: bool) -> Result<bool, ConfigError> {
    match env::var(key) {
        Err(_) => Ok(default),
        Ok(value) => match value.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            _ => Err(ConfigError::InvalidValue {
                key: leak_upper(key),
                value,
                expected: "a boolean (true/false/1/0/yes/no)",
            }),
        },
    }
}

fn u64_var(key: &str, default: u64) -> Result<u64, ConfigError> {
    match env::var(key) {
        Err(_) => Ok(default),
        Ok(value) => value.trim().parse::<u64>().map_err(|_| ConfigError::InvalidValue {
            key: leak_upper(key),
            value,
            expected: "a non-negative integer",
        }),
    }
}

fn log_level_var() -> Result<String, ConfigError> {
    let raw = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    match raw.trim().to_lowercase().as_str() {
        "debug" | "info" | "warn" | "error" => Ok(raw.trim().to_lowercase()),
        _ => Err(ConfigError::InvalidValue {
            key: "LOG_LEVEL",
            value: raw,
            expected: "one of debug, info, warn, error",
        }),
    }
}

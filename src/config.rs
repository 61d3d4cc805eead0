use std::{env, str::FromStr, time::Duration};

use thiserror::Error;

pub const DEFAULT_MAPS_BASE_URL: &str = "https://maps.googleapis.com";
pub const DEFAULT_GEOLOCATION_BASE_URL: &str = "https://www.googleapis.com";

#[derive(Debug, Clone)]
pub struct Config {
    pub api_key: String,
    pub maps_base_url: String,
    pub geolocation_base_url: String,
    pub http_timeout: Duration,
    pub cache: CacheSettings,
    pub rate_limit: RateLimitSettings,
    pub retry: RetrySettings,
    pub shutdown_grace: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheSettings {
    pub enabled: bool,
    pub max_entries: usize,
    pub ttl: Duration,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: 1_000,
            ttl: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitSettings {
    pub capacity: f64,
    pub refill_per_sec: f64,
    pub max_buckets: usize,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            capacity: 50.0,
            refill_per_sec: 10.0,
            max_buckets: 1_024,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(10_000),
            jitter: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("GOOGLE_MAPS_API_KEY is required and must not be empty")]
    MissingApiKey,
    #[error("{name} must be a valid number")]
    InvalidNumber { name: &'static str },
    #[error("{name} must be true or false")]
    InvalidBool { name: &'static str },
    #[error("{name} must be greater than zero")]
    NotPositive { name: &'static str },
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_key = env::var("GOOGLE_MAPS_API_KEY")
            .ok()
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty())
            .ok_or(ConfigError::MissingApiKey)?;

        let maps_base_url = env_string("MAPS_API_BASE_URL", DEFAULT_MAPS_BASE_URL);
        let geolocation_base_url =
            env_string("MAPS_GEOLOCATION_BASE_URL", DEFAULT_GEOLOCATION_BASE_URL);
        let http_timeout = Duration::from_secs(positive("MAPS_HTTP_TIMEOUT_SECS", 10)?);

        let cache = CacheSettings {
            enabled: env_bool("MAPS_CACHE_ENABLED", true)?,
            max_entries: positive("MAPS_CACHE_MAX_ENTRIES", 1_000)?,
            ttl: Duration::from_secs(positive("MAPS_CACHE_TTL_SECS", 300)?),
        };

        let rate_limit = RateLimitSettings {
            capacity: positive_rate("MAPS_RATE_LIMIT_CAPACITY", 50.0)?,
            refill_per_sec: positive_rate("MAPS_RATE_LIMIT_REFILL_PER_SEC", 10.0)?,
            ..RateLimitSettings::default()
        };

        let retry = RetrySettings {
            max_attempts: positive("MAPS_RETRY_MAX_ATTEMPTS", 3)?,
            base_delay: Duration::from_millis(positive("MAPS_RETRY_BASE_DELAY_MS", 1_000)?),
            max_delay: Duration::from_millis(positive("MAPS_RETRY_MAX_DELAY_MS", 10_000)?),
            jitter: true,
        };

        let shutdown_grace = Duration::from_millis(env_number("MAPS_SHUTDOWN_GRACE_MS", 2_000)?);

        Ok(Self {
            api_key,
            maps_base_url,
            geolocation_base_url,
            http_timeout,
            cache,
            rate_limit,
            retry,
            shutdown_grace,
        })
    }
}

fn env_string(name: &str, default: &str) -> String {
    env::var(name)
        .ok()
        .map(|value| value.trim().trim_end_matches('/').to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_number<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .map(|value| {
            value
                .parse::<T>()
                .map_err(|_| ConfigError::InvalidNumber { name })
        })
        .transpose()
        .map(|value| value.unwrap_or(default))
}

fn positive<T>(name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + Default,
{
    let value = env_number(name, default)?;
    if value <= T::default() {
        return Err(ConfigError::NotPositive { name });
    }
    Ok(value)
}

/// `NaN` and infinities parse as `f64` but cannot drive a token bucket.
fn positive_rate(name: &'static str, default: f64) -> Result<f64, ConfigError> {
    let value = env_number(name, default)?;
    if !value.is_finite() {
        return Err(ConfigError::InvalidNumber { name });
    }
    if value <= 0.0 {
        return Err(ConfigError::NotPositive { name });
    }
    Ok(value)
}

fn env_bool(name: &'static str, default: bool) -> Result<bool, ConfigError> {
    let Ok(value) = env::var(name) else {
        return Ok(default);
    };

    match value.trim().to_ascii_lowercase().as_str() {
        "" => Ok(default),
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidBool { name }),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    // Environment variables are process-global.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const VARS: [&str; 12] = [
        "GOOGLE_MAPS_API_KEY",
        "MAPS_API_BASE_URL",
        "MAPS_GEOLOCATION_BASE_URL",
        "MAPS_HTTP_TIMEOUT_SECS",
        "MAPS_CACHE_ENABLED",
        "MAPS_CACHE_MAX_ENTRIES",
        "MAPS_CACHE_TTL_SECS",
        "MAPS_RATE_LIMIT_CAPACITY",
        "MAPS_RATE_LIMIT_REFILL_PER_SEC",
        "MAPS_RETRY_MAX_ATTEMPTS",
        "MAPS_RETRY_BASE_DELAY_MS",
        "MAPS_RETRY_MAX_DELAY_MS",
    ];

    fn clear_env() {
        for name in VARS {
            env::remove_var(name);
        }
        env::remove_var("MAPS_SHUTDOWN_GRACE_MS");
    }

    #[test]
    fn parse_defaults() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        clear_env();
        env::set_var("GOOGLE_MAPS_API_KEY", " abc ");

        let config = Config::from_env().expect("config should parse");
        assert_eq!(config.api_key, "abc");
        assert_eq!(config.maps_base_url, DEFAULT_MAPS_BASE_URL);
        assert_eq!(config.http_timeout, Duration::from_secs(10));
        assert_eq!(config.cache, CacheSettings::default());
        assert_eq!(config.rate_limit, RateLimitSettings::default());
        assert_eq!(config.retry, RetrySettings::default());
        assert_eq!(config.shutdown_grace, Duration::from_millis(2_000));
    }

    #[test]
    fn missing_key_fails() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        clear_env();
        env::set_var("GOOGLE_MAPS_API_KEY", "   ");

        let err = Config::from_env().expect_err("expected missing key error");
        assert!(matches!(err, ConfigError::MissingApiKey));
    }

    #[test]
    fn overrides_are_applied() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        clear_env();
        env::set_var("GOOGLE_MAPS_API_KEY", "abc");
        env::set_var("MAPS_API_BASE_URL", "http://127.0.0.1:9000/");
        env::set_var("MAPS_CACHE_ENABLED", "false");
        env::set_var("MAPS_RATE_LIMIT_REFILL_PER_SEC", "2.5");
        env::set_var("MAPS_RETRY_MAX_ATTEMPTS", "5");

        let config = Config::from_env().expect("config should parse");
        assert_eq!(config.maps_base_url, "http://127.0.0.1:9000");
        assert!(!config.cache.enabled);
        assert_eq!(config.rate_limit.refill_per_sec, 2.5);
        assert_eq!(config.retry.max_attempts, 5);
    }

    #[test]
    fn invalid_numbers_fail() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        clear_env();
        env::set_var("GOOGLE_MAPS_API_KEY", "abc");
        env::set_var("MAPS_CACHE_TTL_SECS", "five");

        let err = Config::from_env().expect_err("expected invalid number");
        assert!(matches!(
            err,
            ConfigError::InvalidNumber {
                name: "MAPS_CACHE_TTL_SECS"
            }
        ));

        env::set_var("MAPS_CACHE_TTL_SECS", "300");
        env::set_var("MAPS_RETRY_MAX_ATTEMPTS", "0");
        let err = Config::from_env().expect_err("expected non-positive error");
        assert!(matches!(
            err,
            ConfigError::NotPositive {
                name: "MAPS_RETRY_MAX_ATTEMPTS"
            }
        ));
    }

    #[test]
    fn rate_limits_must_be_finite() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        clear_env();
        env::set_var("GOOGLE_MAPS_API_KEY", "abc");

        for raw in ["NaN", "inf", "-inf", "infinity"] {
            env::set_var("MAPS_RATE_LIMIT_REFILL_PER_SEC", raw);
            let err = Config::from_env().expect_err("expected invalid rate");
            assert!(
                matches!(
                    err,
                    ConfigError::InvalidNumber {
                        name: "MAPS_RATE_LIMIT_REFILL_PER_SEC"
                    }
                ),
                "{raw} was accepted as {err:?}"
            );
        }

        env::remove_var("MAPS_RATE_LIMIT_REFILL_PER_SEC");
        env::set_var("MAPS_RATE_LIMIT_CAPACITY", "inf");
        let err = Config::from_env().expect_err("expected invalid capacity");
        assert!(matches!(
            err,
            ConfigError::InvalidNumber {
                name: "MAPS_RATE_LIMIT_CAPACITY"
            }
        ));

        env::set_var("MAPS_RATE_LIMIT_CAPACITY", "-1.5");
        let err = Config::from_env().expect_err("expected non-positive capacity");
        assert!(matches!(
            err,
            ConfigError::NotPositive {
                name: "MAPS_RATE_LIMIT_CAPACITY"
            }
        ));
    }
}

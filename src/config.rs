//! Process configuration
//!
//! Read once at startup from `RELAYBOT_*` environment variables.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {var}: {value:?} ({reason})")]
    Invalid {
        var: &'static str,
        value: String,
        reason: &'static str,
    },
    #[error("{0} must be set when RELAYBOT_BACKEND=sheet")]
    Missing(&'static str),
}

/// Where conversation state lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendConfig {
    /// SQLite file
    Local { path: PathBuf },
    /// Spreadsheet web app
    Sheet { url: String, token: Option<String> },
}

/// Retry budgets for the dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    /// Total attempts per event when writes conflict
    pub max_attempts: u32,
    /// Base delay between attempts; doubles each retry
    pub backoff: Duration,
    /// Total attempts per event when the backend is unreachable
    pub unavailable_max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            backoff: Duration::from_millis(20),
            unavailable_max_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BotConfig {
    pub backend: BackendConfig,
    pub retry: RetryConfig,
    /// Bound on every single store call
    pub request_timeout: Duration,
    /// How long a conversation worker waits to collect out-of-order events
    pub reorder_window: Duration,
    /// Idle conversation workers exit after this long
    pub idle_timeout: Duration,
    /// Callback receiving outbound actions; log-only when unset
    pub delivery_url: Option<String>,
    pub port: u16,
}

impl BotConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from any variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let backend = match lookup("RELAYBOT_BACKEND").as_deref() {
            None | Some("local") => {
                let path = lookup("RELAYBOT_DB_PATH").map_or_else(
                    || {
                        let home = lookup("HOME").unwrap_or_else(|| "/tmp".to_string());
                        PathBuf::from(format!("{home}/.relaybot/relaybot.db"))
                    },
                    PathBuf::from,
                );
                BackendConfig::Local { path }
            }
            Some("sheet") => BackendConfig::Sheet {
                url: lookup("RELAYBOT_SHEET_URL").ok_or(ConfigError::Missing("RELAYBOT_SHEET_URL"))?,
                token: lookup("RELAYBOT_SHEET_TOKEN"),
            },
            Some(other) => {
                return Err(ConfigError::Invalid {
                    var: "RELAYBOT_BACKEND",
                    value: other.to_string(),
                    reason: "expected `local` or `sheet`",
                })
            }
        };

        let defaults = RetryConfig::default();
        let retry = RetryConfig {
            max_attempts: positive(&lookup, "RELAYBOT_RETRY_MAX_ATTEMPTS", defaults.max_attempts)?,
            backoff: Duration::from_millis(number(
                &lookup,
                "RELAYBOT_RETRY_BACKOFF_MS",
                20,
            )?),
            unavailable_max_attempts: positive(
                &lookup,
                "RELAYBOT_UNAVAILABLE_MAX_ATTEMPTS",
                defaults.unavailable_max_attempts,
            )?,
        };

        let request_timeout_ms: u64 = number(&lookup, "RELAYBOT_REQUEST_TIMEOUT_MS", 5_000)?;
        if request_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                var: "RELAYBOT_REQUEST_TIMEOUT_MS",
                value: "0".to_string(),
                reason: "must be positive",
            });
        }

        Ok(Self {
            backend,
            retry,
            request_timeout: Duration::from_millis(request_timeout_ms),
            reorder_window: Duration::from_millis(number(&lookup, "RELAYBOT_REORDER_WINDOW_MS", 25)?),
            idle_timeout: Duration::from_secs(number(&lookup, "RELAYBOT_IDLE_TIMEOUT_SECS", 300)?),
            delivery_url: lookup("RELAYBOT_DELIVERY_URL").filter(|u| !u.is_empty()),
            port: number(&lookup, "RELAYBOT_PORT", 8080)?,
        })
    }
}

fn number<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(var) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid {
            var,
            value: raw,
            reason: "not a number",
        }),
    }
}

fn positive(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: u32,
) -> Result<u32, ConfigError> {
    let n = number(lookup, var, default)?;
    if n == 0 {
        return Err(ConfigError::Invalid {
            var,
            value: n.to_string(),
            reason: "must be at least 1",
        });
    }
    Ok(n)
}

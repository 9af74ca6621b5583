//! Registry configuration management

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::registry::{CachePolicy, RefreshMode};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid {setting} value: {reason}")]
    Invalid { setting: String, reason: String },

    #[error("The global registry is already initialized")]
    AlreadyInitialized,
}

pub(crate) fn invalid(setting: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        setting: setting.to_string(),
        reason: reason.into(),
    }
}

/// Which caching policy to build
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyKind {
    None,
    #[default]
    Ttl,
    Lru,
}

impl FromStr for PolicyKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "none" => Ok(PolicyKind::None),
            "ttl" => Ok(PolicyKind::Ttl),
            "lru" => Ok(PolicyKind::Lru),
            other => Err(invalid(
                "TEMPLAR_CACHE_POLICY",
                format!("expected one of none, ttl, lru, got '{}'", other),
            )),
        }
    }
}

impl fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyKind::None => write!(f, "none"),
            PolicyKind::Ttl => write!(f, "ttl"),
            PolicyKind::Lru => write!(f, "lru"),
        }
    }
}

/// Registry configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Caching policy
    pub policy: PolicyKind,

    /// Maximum number of cached templates
    pub capacity: usize,

    /// Seconds an entry stays fresh before it is revalidated
    pub ttl_secs: u64,

    /// Poll interval of the background refresher; `None` refreshes on access
    pub refresh_interval_secs: Option<u64>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            policy: PolicyKind::Ttl,
            capacity: 100,
            ttl_secs: 30,
            refresh_interval_secs: None,
        }
    }
}

impl RegistryConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from any key/value source, falling back to the
    /// defaults for unset keys.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            policy: match lookup("TEMPLAR_CACHE_POLICY") {
                Some(value) => value.parse()?,
                None => defaults.policy,
            },
            capacity: parse_or("TEMPLAR_CACHE_CAPACITY", &lookup, defaults.capacity)?,
            ttl_secs: parse_or("TEMPLAR_CACHE_TTL_SECS", &lookup, defaults.ttl_secs)?,
            refresh_interval_secs: match lookup("TEMPLAR_REFRESH_INTERVAL_SECS") {
                Some(value) => Some(parse_value("TEMPLAR_REFRESH_INTERVAL_SECS", &value)?),
                None => None,
            },
        })
    }

    /// Build the cache policy this configuration describes.
    pub fn cache_policy(&self) -> Result<CachePolicy, ConfigError> {
        let ttl = Duration::from_secs(self.ttl_secs);
        let capacity = || {
            if self.capacity == 0 {
                Err(invalid("TEMPLAR_CACHE_CAPACITY", "capacity must be at least 1"))
            } else {
                Ok(self.capacity)
            }
        };

        Ok(match self.policy {
            PolicyKind::None => CachePolicy::NoCache,
            PolicyKind::Ttl => CachePolicy::TtlLazy {
                capacity: capacity()?,
                ttl,
            },
            PolicyKind::Lru => {
                let refresh = match self.refresh_interval_secs {
                    Some(0) => {
                        return Err(invalid(
                            "TEMPLAR_REFRESH_INTERVAL_SECS",
                            "interval must be at least 1 second",
                        ));
                    }
                    Some(secs) => RefreshMode::Poll {
                        interval: Duration::from_secs(secs),
                    },
                    None => RefreshMode::OnAccess,
                };
                CachePolicy::LruBackground {
                    capacity: capacity()?,
                    ttl,
                    refresh,
                }
            }
        })
    }
}

fn parse_value<T: FromStr>(setting: &str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| invalid(setting, format!("'{}' is not a valid number", value)))
}

fn parse_or<T: FromStr>(
    setting: &str,
    lookup: &impl Fn(&str) -> Option<String>,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(setting) {
        Some(value) => parse_value(setting, &value),
        None => Ok(default),
    }
}

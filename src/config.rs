//! Host configuration and the policies shared by exporters and importers.

use serde::{Deserialize, Serialize};
use std::{env, str::FromStr, time::Duration};

use crate::error::{Error, Result};

pub const TRACKING_URI_VAR: &str = "MLFLOW_TRACKING_URI";
pub const TRACKING_TOKEN_VAR: &str = "MLFLOW_TRACKING_TOKEN";

/// Where a tracking server lives and how to authenticate against it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackingConfig {
    /// Base URI such as `http://127.0.0.1:5000`.
    pub uri: String,
    #[serde(default, skip_serializing)]
    pub token: Option<String>,
}

impl TrackingConfig {
    pub fn from_env() -> Result<Self> {
        Self::new(env::var(TRACKING_URI_VAR).ok(), env::var(TRACKING_TOKEN_VAR).ok())
    }

    /// Validates the URI; only HTTP(S) tracking servers are supported.
    pub fn new(uri: Option<String>, token: Option<String>) -> Result<Self> {
        let uri = match uri {
            Some(uri) if !uri.trim().is_empty() => uri.trim().trim_end_matches('/').to_owned(),
            _ => {
                return Err(Error::Configuration(format!(
                    "tracking URI ({} environment variable) is not set",
                    TRACKING_URI_VAR
                )))
            }
        };
        if !(uri.starts_with("http://") || uri.starts_with("https://")) {
            return Err(Error::Configuration(format!(
                "tracking URI ({} environment variable) must be an HTTP URI: '{}'",
                TRACKING_URI_VAR, uri
            )));
        }
        let token = token.filter(|token| !token.is_empty());
        Ok(TrackingConfig { uri, token })
    }

    /// REST API base, as expected by [`crate::backend::rest::Server`].
    pub fn api_url(&self) -> String {
        format!("{}/api", self.uri)
    }
}

/// What to do when the destination already holds an object of the same name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnConflict {
    /// Add everything to the existing object, duplicating previous imports.
    Append,
    /// Refuse with [`Error::DestinationConflict`] before any mutation.
    Fail,
    /// Add only what the provenance tags show was not imported yet.
    Reuse,
}

impl FromStr for OnConflict {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "append" => Ok(OnConflict::Append),
            "fail" => Ok(OnConflict::Fail),
            "reuse" => Ok(OnConflict::Reuse),
            other => Err(Error::Configuration(format!("unknown conflict policy '{}'", other))),
        }
    }
}

/// Bounded retry for artifact transfers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub attempts: u32,
    #[serde(with = "millis")]
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            attempts: 3,
            delay: Duration::from_millis(500),
        }
    }
}

pub const MIN_POLL_DELAY: Duration = Duration::from_millis(1);

/// Exponential backoff used while waiting for a model version to become ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollPolicy {
    #[serde(with = "millis")]
    pub initial_delay: Duration,
    #[serde(with = "millis")]
    pub max_delay: Duration,
    #[serde(with = "millis")]
    pub max_wait: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        PollPolicy {
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
            max_wait: Duration::from_secs(300),
        }
    }
}

impl PollPolicy {
    /// Sleep durations to use between polls, never exceeding `max_wait` in total.
    ///
    /// Delays are at least [`MIN_POLL_DELAY`], so the sequence always ends.
    pub fn delays(&self) -> impl Iterator<Item = Duration> {
        let max_delay = self.max_delay.max(MIN_POLL_DELAY);
        let mut remaining = self.max_wait;
        let mut next = self.initial_delay.max(MIN_POLL_DELAY);
        std::iter::from_fn(move || {
            if remaining.is_zero() {
                return None;
            }
            let delay = next.min(remaining).min(max_delay);
            remaining -= delay;
            next = (next * 2).min(max_delay);
            Some(delay)
        })
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn rejects_non_http_uri() {
        let error = TrackingConfig::new(Some("databricks://profile".into()), None).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Configuration);
        let error = TrackingConfig::new(None, None).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn normalizes_uri() {
        let config = TrackingConfig::new(Some("http://localhost:5000/".into()), Some(String::new())).unwrap();
        assert_eq!(config.uri, "http://localhost:5000");
        assert_eq!(config.api_url(), "http://localhost:5000/api");
        assert_eq!(config.token, None);
    }

    #[test]
    fn poll_delays_are_bounded() {
        let policy = PollPolicy {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(400),
            max_wait: Duration::from_millis(1000),
        };
        let delays: Vec<_> = policy.delays().map(|d| d.as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 400, 300]);
        assert_eq!(delays.iter().sum::<u128>(), 1000);
    }

    #[test]
    fn zero_poll_delays_still_end() {
        let policy = PollPolicy {
            initial_delay: Duration::ZERO,
            max_delay: Duration::from_millis(5),
            max_wait: Duration::from_millis(40),
        };
        let delays: Vec<_> = policy.delays().take(1000).collect();
        assert!(delays.len() < 1000);
        assert_eq!(delays.iter().sum::<Duration>(), Duration::from_millis(40));

        let policy = PollPolicy { max_delay: Duration::ZERO, ..policy };
        assert_eq!(policy.delays().take(1000).count(), 40);

        let policy = PollPolicy { max_wait: Duration::ZERO, ..policy };
        assert_eq!(policy.delays().count(), 0);
    }

    #[test]
    fn options_load_from_json() {
        let retry: RetryPolicy = serde_json::from_str(r#"{"attempts": 5}"#).unwrap();
        assert_eq!(retry.attempts, 5);
        assert_eq!(retry.delay, RetryPolicy::default().delay);
        let conflict: OnConflict = serde_json::from_str(r#""reuse""#).unwrap();
        assert_eq!(conflict, OnConflict::Reuse);
        assert_eq!("Append".parse::<OnConflict>().unwrap(), OnConflict::Append);
        assert!("overwrite".parse::<OnConflict>().is_err());
    }
}

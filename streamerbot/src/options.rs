//! Client configuration.

use crate::subscription::SubscriptionSpec;

use serde::{Deserialize, Serialize};
use std::{fmt, time::Duration};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    #[default]
    Ws,
    Wss,
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Scheme::Ws => "ws",
            Scheme::Wss => "wss",
        })
    }
}

/// Durations serialize as integer milliseconds.
mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Per-operation time limits. Every awaited external event gets its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Timeouts {
    /// Opening the socket.
    #[serde(with = "millis")]
    pub connect: Duration,
    /// Waiting for the Hello message after the socket opened.
    #[serde(with = "millis")]
    pub handshake: Duration,
    /// Default for `request`.
    #[serde(with = "millis")]
    pub request: Duration,
    /// Waiting for the close acknowledgement.
    #[serde(with = "millis")]
    pub disconnect: Duration,
    /// Default window of the custom-event response bridge.
    #[serde(with = "millis")]
    pub custom_event: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(10),
            handshake: Duration::from_secs(5),
            request: Duration::from_secs(5),
            disconnect: Duration::from_secs(5),
            custom_event: Duration::from_secs(10),
        }
    }
}

/// Capped exponential backoff between reconnect attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReconnectOptions {
    #[serde(with = "millis")]
    pub base_delay: Duration,
    #[serde(with = "millis")]
    pub max_delay: Duration,
}

impl Default for ReconnectOptions {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl ReconnectOptions {
    /// Delay before the given 1-based attempt: `min(base * 2^(attempt-1), max)`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1 << exponent)
            .min(self.max_delay)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientOptions {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    pub endpoint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Connect as soon as the client is built.
    pub immediate: bool,
    pub auto_reconnect: bool,
    /// Reconnect attempts after an unexpected close. Negative means unlimited.
    pub retries: i32,
    /// Subscriptions (re)issued after every handshake.
    pub subscribe: SubscriptionSpec,
    pub timeouts: Timeouts,
    pub reconnect: ReconnectOptions,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            scheme: Scheme::Ws,
            host: "127.0.0.1".into(),
            port: 8080,
            endpoint: "/".into(),
            password: None,
            immediate: true,
            auto_reconnect: true,
            retries: -1,
            subscribe: SubscriptionSpec::default(),
            timeouts: Timeouts::default(),
            reconnect: ReconnectOptions::default(),
        }
    }
}

impl ClientOptions {
    /// `scheme://host:port/endpoint`
    pub fn url(&self) -> String {
        let endpoint = self.endpoint.trim_start_matches('/');
        format!("{}://{}:{}/{}", self.scheme, self.host, self.port, endpoint)
    }
    /// Whether the 1-based reconnect `attempt` is within budget.
    pub fn retry_allowed(&self, attempt: u32) -> bool {
        self.retries < 0 || i64::from(attempt) <= i64::from(self.retries)
    }
}

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::util::json::{deserialize_duration_from_ms, serialize_duration_to_ms};
use crate::util::types::AccessToken;

/// Timing configuration for a session.
///
/// None of these values are mandated by the platform, they only bound how
/// long the session waits on the network.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Maximum time to wait for a single HTTP request or for the MQTT
    /// handshake to complete. Long-poll requests get their poll timeout
    /// added on top of this.
    #[serde(
        deserialize_with = "deserialize_duration_from_ms",
        serialize_with = "serialize_duration_to_ms"
    )]
    pub request_timeout: Duration,

    /// Delay between two long-poll attempts of an HTTP subscription
    #[serde(
        deserialize_with = "deserialize_duration_from_ms",
        serialize_with = "serialize_duration_to_ms"
    )]
    pub poll_interval: Duration,

    /// How long an MQTT attribute request or client RPC waits for its reply
    #[serde(
        deserialize_with = "deserialize_duration_from_ms",
        serialize_with = "serialize_duration_to_ms"
    )]
    pub reply_timeout: Duration,

    /// MQTT keep-alive interval
    #[serde(
        deserialize_with = "deserialize_duration_from_ms",
        serialize_with = "serialize_duration_to_ms"
    )]
    pub keep_alive: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_millis(59_000),
            poll_interval: Duration::from_millis(3_000),
            reply_timeout: Duration::from_millis(1_000),
            keep_alive: Duration::from_secs(60),
        }
    }
}

/// Routing parameters stored by `connect`
#[derive(Clone, Debug)]
pub struct Connection {
    pub host: String,
    pub port: u16,
    pub token: AccessToken,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn it_fills_missing_fields_with_defaults() {
        let config: SessionConfig =
            serde_json::from_value(json!({"poll_interval": 250})).unwrap();
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.reply_timeout, Duration::from_secs(1));
        assert_eq!(config.request_timeout, Duration::from_secs(59));
        assert_eq!(config.keep_alive, Duration::from_secs(60));
    }
}

use clap::Parser;
use std::num::ParseIntError;
use std::time::Duration;

use crate::client::Transport;

fn parse_duration(s: &str) -> Result<Duration, ParseIntError> {
    let millis: u64 = s.parse()?;
    Ok(Duration::from_millis(millis))
}

#[derive(Clone, Debug, Parser)]
#[command(version, about, long_about = None)] // read from Cargo.toml
pub struct Cli {
    /// Wire transport, "mqtt" or "http"
    #[arg(
        env = "TB_TRANSPORT",
        long = "transport",
        value_name = "name",
        default_value = "http"
    )]
    pub transport: Transport,

    /// Platform host name or address
    #[arg(
        env = "TB_HOST",
        long = "host",
        value_name = "host",
        default_value = "127.0.0.1"
    )]
    pub host: String,

    /// Platform port, 1883 for MQTT or the HTTP API port
    #[arg(env = "TB_PORT", long = "port", value_name = "port", default_value_t = 8080)]
    pub port: u16,

    /// Device access token
    #[arg(env = "TB_ACCESS_TOKEN", long = "access-token", value_name = "token")]
    pub access_token: String,

    /// Long-poll timeout of HTTP subscriptions in milliseconds
    #[arg(
        env = "TB_SUBSCRIBE_TIMEOUT_MS",
        long = "subscribe-timeout-ms",
        value_name = "ms",
        value_parser = parse_duration,
        default_value = "5000"
    )]
    pub subscribe_timeout: Duration,

    /// Request timeout in milliseconds
    #[arg(
        env = "TB_REQUEST_TIMEOUT_MS",
        long = "request-timeout-ms",
        value_name = "ms",
        value_parser = parse_duration
    )]
    pub request_timeout: Option<Duration>,

    /// Delay between long-poll calls in milliseconds
    #[arg(
        env = "TB_POLL_INTERVAL_MS",
        long = "poll-interval-ms",
        value_name = "ms",
        value_parser = parse_duration
    )]
    pub poll_interval: Option<Duration>,

    /// Time to wait for MQTT replies in milliseconds
    #[arg(
        env = "TB_REPLY_TIMEOUT_MS",
        long = "reply-timeout-ms",
        value_name = "ms",
        value_parser = parse_duration
    )]
    pub reply_timeout: Option<Duration>,

    /// Secret key used to claim the device
    #[arg(env = "TB_CLAIM_SECRET", long = "claim-secret", value_name = "secret")]
    pub claim_secret: Option<String>,

    /// Provisioning key of the device profile
    #[arg(
        env = "TB_PROVISION_KEY",
        long = "provision-key",
        value_name = "key",
        requires = "provision_secret"
    )]
    pub provision_key: Option<String>,

    /// Provisioning secret of the device profile
    #[arg(
        env = "TB_PROVISION_SECRET",
        long = "provision-secret",
        value_name = "secret",
        requires = "provision_key"
    )]
    pub provision_secret: Option<String>,
}

pub fn parse() -> Cli {
    Parser::parse()
}

use tracing::{info, warn};
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

mod cli;

use thingsboard_client as client;

use crate::cli::Cli;
use crate::client::{AttributesQuery, Session, SessionConfig, code_of};

fn initialize_tracing() {
    // Initialize tracing subscriber for human-readable logs
    tracing_subscriber::registry()
        .with(
            // Use some log defaults. These can be overriden using
            // RUST_LOG
            EnvFilter::try_from_default_env().unwrap_or(
                EnvFilter::default()
                    .add_directive("debug".parse().unwrap())
                    .add_directive("hyper=error".parse().unwrap())
                    .add_directive("hyper_util=error".parse().unwrap())
                    .add_directive("reqwest=info".parse().unwrap())
                    .add_directive("rumqttc=warn".parse().unwrap()),
            ),
        )
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_span_events(FmtSpan::CLOSE)
                .event_format(fmt::format().compact().with_target(false).without_time()),
        )
        .init();
}

fn session_config(cli: &Cli) -> SessionConfig {
    let defaults = SessionConfig::default();
    SessionConfig {
        request_timeout: cli.request_timeout.unwrap_or(defaults.request_timeout),
        poll_interval: cli.poll_interval.unwrap_or(defaults.poll_interval),
        reply_timeout: cli.reply_timeout.unwrap_or(defaults.reply_timeout),
        ..defaults
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    initialize_tracing();

    let cli = cli::parse();

    let session = Session::with_config(cli.transport, session_config(&cli))?;
    info!(transport = %cli.transport, "session initialized");

    session
        .connect(&cli.host, cli.port, &cli.access_token)
        .await?;

    let res = session
        .send_telemetry(r#"{"temperature":50}"#, None)
        .await;
    info!(code = %code_of(&res), "published telemetry");

    let res = session.publish_attributes(r#"{"temperature":50}"#).await;
    info!(code = %code_of(&res), "published attributes");

    let query = AttributesQuery::default().shared_keys("firmwareVersion,targetFirmware");
    let res = session
        .request_attributes(5, &query, |_, body| {
            info!(body, "attribute request response")
        })
        .await;
    info!(code = %code_of(&res), "requested attributes");

    let res = session
        .claim_device(cli.claim_secret.as_deref(), -1)
        .await;
    info!(code = %code_of(&res), "claimed device");

    let res = session
        .subscribe_rpc(cli.subscribe_timeout, |session, body, id| {
            info!(id, body, "rpc request");
            let session = session.clone();
            tokio::spawn(async move {
                let _ = session.rpc_reply(id, r#"{"response":"OK"}"#).await;
            });
        })
        .await;
    info!(code = %code_of(&res), "subscribed to rpc");

    let res = session
        .subscribe_attributes(cli.subscribe_timeout, |_, body| {
            info!(body, "attribute update")
        })
        .await;
    info!(code = %code_of(&res), "subscribed to attributes");

    let res = session
        .rpc_send(1, "getTemperature", "param:value", |_, body| {
            info!(body, "rpc response")
        })
        .await;
    info!(code = %code_of(&res), "sent rpc");

    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            if let Err(e) = res {
                warn!("failed to listen for ctrl-c: {e}");
            }
            info!("interrupted, shutting down");
        }
        _ = session.wait_idle() => {
            info!("no active subscriptions left");
        }
    }

    let res = session.unsubscribe_rpc().await;
    info!(code = %code_of(&res), "unsubscribed from rpc");

    let res = session.unsubscribe_attributes().await;
    info!(code = %code_of(&res), "unsubscribed from attributes");

    if let (Some(key), Some(secret)) = (&cli.provision_key, &cli.provision_secret) {
        let res = session.provision_device(key, secret).await;
        info!(code = %code_of(&res), "provisioned device");
    }

    let res = session
        .claim_device(cli.claim_secret.as_deref(), -1)
        .await;
    info!(code = %code_of(&res), "claimed device");

    let res = session.disconnect().await;
    info!(code = %code_of(&res), "disconnected");

    session.cleanup().await;

    Ok(())
}

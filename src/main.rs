//! eventlink command-line tail.
//!
//! Connects to the configured endpoint, subscribes to the status and log
//! channels of every resource in `EVENTLINK_RESOURCES`, and prints each
//! notification to stdout as one JSON line. Logs go to stderr.

use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

use eventlink::channels::{ChannelCallback, ConnectionRegistry, StaticToken};
use eventlink::config::ClientConfig;
use eventlink::protocol::{Channel, LogOutput, StatusChange};

/// One printed line.
#[derive(Debug, Serialize)]
struct EventLine<'a> {
    received_at: DateTime<Utc>,
    channel: &'static str,
    resource_id: &'a str,
    event: EventBody<'a>,
}

/// Typed notification body, or the raw params when they do not parse.
#[derive(Debug, Serialize)]
#[serde(untagged)]
enum EventBody<'a> {
    Status(StatusChange),
    Log(LogOutput),
    Raw(&'a Value),
}

impl<'a> EventBody<'a> {
    fn parse(channel: Channel, params: &'a Value) -> Self {
        let parsed = match channel {
            Channel::Status => StatusChange::from_params(params).map(Self::Status),
            Channel::Log => LogOutput::from_params(params).map(Self::Log),
        };
        parsed.unwrap_or_else(|e| {
            tracing::debug!(%channel, error = %e, "printing raw params");
            Self::Raw(params)
        })
    }
}

fn printer(channel: Channel, resource_id: &str) -> ChannelCallback {
    let resource_id = resource_id.to_string();
    Arc::new(move |params: &Value| {
        let line = EventLine {
            received_at: Utc::now(),
            channel: channel.as_str(),
            resource_id: &resource_id,
            event: EventBody::parse(channel, params),
        };
        match serde_json::to_string(&line) {
            Ok(text) => println!("{text}"),
            Err(e) => tracing::warn!(error = %e, "unprintable event"),
        }
    })
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json")) {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = ClientConfig::from_env()?;
    if config.resources.is_empty() {
        tracing::warn!("EVENTLINK_RESOURCES is empty, nothing to subscribe to");
    }
    tracing::info!(url = %config.endpoint, resources = config.resources.len(), "starting eventlink");

    let tokens = Arc::new(StaticToken::from(config.token.clone()));
    let registry = ConnectionRegistry::new(&config, tokens);

    let mux = tokio::time::timeout(
        config.request_timeout,
        registry.connect(config.endpoint.as_str()),
    )
    .await
    .with_context(|| format!("no handshake within {:?}", config.request_timeout))?
    .with_context(|| format!("connecting to {}", config.endpoint))?;
    tracing::info!(client_id = ?mux.client_id(), "connected");

    for resource_id in &config.resources {
        for channel in Channel::ALL {
            mux.subscribe(channel, resource_id, printer(channel, resource_id))
                .await
                .with_context(|| format!("subscribing to {channel} for {resource_id}"))?;
        }
    }

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;
    tracing::info!("shutting down");
    registry.disconnect_all().await;

    Ok(())
}

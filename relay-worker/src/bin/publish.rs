//! Notification publisher - manual testing utility.
//!
//! Publishes one notification to the `notifications` exchange:
//!
//! ```text
//! notification-publish Your order has shipped
//! ```
//!
//! The command-line arguments become the message body. The recipient comes
//! from `PUBLISH_TO` and the message expires after five minutes.

use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use relay::{NotificationPayload, PublishConfig, Publisher};

const MESSAGE_TTL: Duration = Duration::from_secs(5 * 60);

#[tokio::main]
async fn main() -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    let config = PublishConfig::from_env().context("Failed to load configuration")?;

    let message = std::env::args().skip(1).collect::<Vec<_>>().join(" ");
    let payload = NotificationPayload::new(
        message,
        config.from_address,
        config.to_address,
        "Test message",
    );

    let publisher = Publisher::new(config.broker.amqp_uri());
    let result = publisher.publish(&payload, Some(MESSAGE_TTL)).await;
    publisher.close().await;

    let message_id = result.context("Failed to publish notification")?;
    info!(message_id = %message_id, "notification_published");

    Ok(())
}

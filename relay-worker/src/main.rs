//! Notification relay - RabbitMQ consumer that sends notifications by SMTP.
//!
//! Consumes JSON notifications from `notification_queue` one at a time and
//! relays each as a plain-text email. Exits non-zero on configuration errors
//! and on loss of the broker connection so a supervisor can restart it.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use relay::{Config, Consumer, Dispatcher, RabbitMqBroker, SmtpMailer};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env();

    // Verbosity follows ENVIRONMENT unless RUST_LOG is set
    let directive = config
        .as_ref()
        .map(|c| c.environment.default_log_directive())
        .unwrap_or("error");
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    let config = match config {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "config_invalid");
            return Err(e).context("Failed to load configuration");
        }
    };

    info!(
        amqp_host = %config.broker.host,
        amqp_port = config.broker.port,
        smtp_host = %config.smtp_host,
        smtp_port = config.smtp_port,
        environment = ?config.environment,
        failure_policy = ?config.failure_policy,
        retry_delay_ms = config.retry_delay.as_millis() as u64,
        "config_loaded"
    );

    let mailer = SmtpMailer::connect(&config.smtp_host, config.smtp_port, config.smtp_timeout)
        .await
        .context("Failed to open SMTP session")?;
    let mailer = Arc::new(mailer);

    let broker = RabbitMqBroker::connect(config.broker.amqp_uri(), &config.consumer_tag)
        .await
        .context("Failed to connect to RabbitMQ")?
        .with_retry_delay(config.retry_delay);

    let dispatcher = Dispatcher::new(mailer.clone(), config.failure_policy);
    let result = Consumer::new(broker, dispatcher)
        .start(shutdown_signal())
        .await;

    // The consumer has been dropped, so this is the last reference.
    if let Ok(mailer) = Arc::try_unwrap(mailer) {
        mailer.close();
    }

    result.context("Notification consumer stopped")?;

    Ok(())
}

/// Create a future that completes when a shutdown signal is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "sigint_handler_failed");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "sigterm_handler_failed");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

//! Telegram Relay - line-oriented front end for the publisher.
//!
//! Reads one JSON update per line from stdin, stamps it with the receive time,
//! and publishes it to the updates queue. SIGINT/SIGTERM or end of input close
//! the broker connection.

use anyhow::{Context, Result};
use serde_json::Value;
use tokio::io::{self, AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

use relay::{install_shutdown_handler, logging, Config, Publisher, UpdateEnvelope};

#[tokio::main]
async fn main() -> Result<()> {
    logging::init().context("Failed to initialize logging")?;

    info!("relay_starting");

    let config = Config::from_env();
    let publisher = Publisher::amqp(config);

    let topology = publisher.topology();
    info!(
        queue = %topology.queue,
        dead_letter_exchange = %topology.dead_letter_exchange,
        dead_letter_queue = %topology.dead_letter_queue,
        "config_loaded"
    );

    install_shutdown_handler(publisher.clone());

    run(&publisher).await?;

    let outcome = relay::signals::shutdown(&publisher).await;
    info!(outcome = ?outcome, "relay_stopped");

    Ok(())
}

/// Publish every line of stdin until end of input.
async fn run(publisher: &Publisher) -> Result<()> {
    let mut lines = BufReader::new(io::stdin()).lines();
    let mut published = 0u64;

    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let update: Value = match serde_json::from_str(line) {
            Ok(update) => update,
            Err(e) => {
                warn!(error = %e, "update_parse_failed");
                continue;
            }
        };

        match publisher.publish(&UpdateEnvelope::new(update)).await {
            Ok(()) => published += 1,
            Err(e) => error!(
                error = %e,
                broker_unavailable = e.is_broker_unavailable(),
                "update_publish_failed"
            ),
        }
    }

    info!(published, "stdin_closed");
    Ok(())
}

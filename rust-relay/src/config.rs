//! Configuration module for environment variable parsing.
//!
//! Every broker setting has a fixed fallback except the broker URL, which is
//! required at publish time rather than at startup.

use std::env;
use std::str::FromStr;
use tracing::warn;

/// Default main queue for relayed updates.
pub const DEFAULT_QUEUE: &str = "telegram.updates";

/// Default dead-letter exchange.
pub const DEFAULT_DEAD_LETTER_EXCHANGE: &str = "telegram.dlx";

/// Default dead-letter queue.
pub const DEFAULT_DEAD_LETTER_QUEUE: &str = "telegram.dlq";

/// Relay configuration loaded from environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// RabbitMQ connection URL. Empty means "not configured".
    pub rabbitmq_url: String,

    /// Heartbeat interval in seconds
    pub heartbeat_secs: u16,

    /// Maximum AMQP frame size in bytes
    pub frame_max: u32,

    /// Queue that receives every relayed update
    pub queue: String,

    /// Direct exchange that dead-lettered messages are routed through
    pub dead_letter_exchange: String,

    /// Queue bound to the dead-letter exchange
    pub dead_letter_queue: String,

    /// Number of unconfirmed publishes allowed before `publish` waits
    pub publish_window: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            rabbitmq_url: String::new(),
            heartbeat_secs: 60,
            frame_max: 131_072,
            queue: DEFAULT_QUEUE.to_string(),
            dead_letter_exchange: DEFAULT_DEAD_LETTER_EXCHANGE.to_string(),
            dead_letter_queue: DEFAULT_DEAD_LETTER_QUEUE.to_string(),
            publish_window: 1024,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let defaults = Config::default();

        Config {
            rabbitmq_url: env::var("RABBITMQ_URL")
                .map(|v| v.trim().to_string())
                .unwrap_or_default(),

            heartbeat_secs: parse_or("RABBITMQ_HEARTBEAT", defaults.heartbeat_secs),

            frame_max: parse_or("RABBITMQ_FRAME_MAX", defaults.frame_max),

            queue: name_or("RABBITMQ_QUEUE", defaults.queue),

            dead_letter_exchange: name_or("RABBITMQ_DLX", defaults.dead_letter_exchange),

            dead_letter_queue: name_or("RABBITMQ_DLQ", defaults.dead_letter_queue),

            publish_window: parse_or("RABBITMQ_PUBLISH_WINDOW", defaults.publish_window)
                .max(1),
        }
    }
}

/// Parse a numeric variable, falling back to `default` when unset or invalid.
fn parse_or<T: FromStr + Copy>(name: &str, default: T) -> T {
    let raw = match env::var(name) {
        Ok(v) => v,
        Err(_) => return default,
    };

    match raw.trim().parse::<T>() {
        Ok(value) => value,
        Err(_) => {
            warn!(env_var = name, value = %raw, "Invalid numeric value, using default");
            default
        }
    }
}

/// Read a queue or exchange name; blank values count as unset.
fn name_or(name: &str, default: String) -> String {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_or_valid() {
        env::set_var("TEST_RELAY_HEARTBEAT", " 30 ");
        let result: u16 = parse_or("TEST_RELAY_HEARTBEAT", 60);
        assert_eq!(result, 30);
        env::remove_var("TEST_RELAY_HEARTBEAT");
    }

    #[test]
    fn test_parse_or_invalid_uses_default() {
        env::set_var("TEST_RELAY_FRAME_MAX", "lots");
        let result: u32 = parse_or("TEST_RELAY_FRAME_MAX", 131_072);
        assert_eq!(result, 131_072);
        env::remove_var("TEST_RELAY_FRAME_MAX");
    }

    #[test]
    fn test_parse_or_default() {
        let result: usize = parse_or("NONEXISTENT_RELAY_VAR", 7);
        assert_eq!(result, 7);
    }

    #[test]
    fn test_name_or_blank_uses_default() {
        env::set_var("TEST_RELAY_QUEUE", "   ");
        assert_eq!(name_or("TEST_RELAY_QUEUE", "fallback".to_string()), "fallback");
        env::set_var("TEST_RELAY_QUEUE", "orders");
        assert_eq!(name_or("TEST_RELAY_QUEUE", "fallback".to_string()), "orders");
        env::remove_var("TEST_RELAY_QUEUE");
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert!(config.rabbitmq_url.is_empty());
        assert_eq!(config.heartbeat_secs, 60);
        assert_eq!(config.frame_max, 131_072);
        assert_eq!(config.queue, "telegram.updates");
        assert_eq!(config.dead_letter_exchange, "telegram.dlx");
        assert_eq!(config.dead_letter_queue, "telegram.dlq");
    }
}

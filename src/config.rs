//! Runtime configuration read from the environment.

use std::time::Duration;

use tracing_error::SpanTrace;

use crate::recovery::TIMEOUT_NOTIFICATION_TTL;

/// Settings read once at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Broker URL (`AMQP_URL`).
    pub amqp_url: String,
    /// Dead-letter exchange every request queue routes expired messages to
    /// (`AMQP_DLX`).
    pub amqp_dlx: String,
    /// Shared queue consuming the dead-letter exchange (`AMQP_DLX_QUEUE`).
    /// `None` gives every process an exclusive queue.
    pub dead_letter_queue: Option<String>,
    /// Expiration of timeout notifications (`AMQP_TIMEOUT_NOTIFICATION_TTL_MS`).
    pub timeout_notification_ttl: Duration,
    /// Pause between reconnection attempts (`AMQP_RECONNECT_DELAY_MS`).
    pub reconnect_delay: Duration,
    pub multi_tenant: bool,
    pub update_acl_based_on_groups: bool,
}

impl Default for Config {
    fn default() -> Self {
        let amqp_dlx = "openflow-dlx".to_owned();
        Self {
            amqp_url: "amqp://localhost".to_owned(),
            dead_letter_queue: Some(format!("{amqp_dlx}.timeouts")),
            amqp_dlx,
            timeout_notification_ttl: TIMEOUT_NOTIFICATION_TTL,
            reconnect_delay: Duration::from_secs(1),
            multi_tenant: false,
            update_acl_based_on_groups: false,
        }
    }
}

impl Config {
    /// Read the configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read the configuration through `lookup`, which returns the value of a
    /// variable if it is set.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let amqp_dlx = lookup("AMQP_DLX").unwrap_or(defaults.amqp_dlx);
        let dead_letter_queue = match lookup("AMQP_DLX_QUEUE") {
            Some(queue) if queue.is_empty() => None,
            Some(queue) => Some(queue),
            None => Some(format!("{amqp_dlx}.timeouts")),
        };

        Ok(Self {
            amqp_url: lookup("AMQP_URL").unwrap_or(defaults.amqp_url),
            amqp_dlx,
            dead_letter_queue,
            timeout_notification_ttl: millis(
                &lookup,
                "AMQP_TIMEOUT_NOTIFICATION_TTL_MS",
                defaults.timeout_notification_ttl,
            )?,
            reconnect_delay: millis(&lookup, "AMQP_RECONNECT_DELAY_MS", defaults.reconnect_delay)?,
            multi_tenant: flag(&lookup, "MULTI_TENANT", defaults.multi_tenant)?,
            update_acl_based_on_groups: flag(
                &lookup,
                "UPDATE_ACL_BASED_ON_GROUPS",
                defaults.update_acl_based_on_groups,
            )?,
        })
    }
}

fn millis(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    match lookup(key) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map(Duration::from_millis)
            .map_err(|_| ConfigError::invalid(key, value)),
    }
}

fn flag(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: bool,
) -> Result<bool, ConfigError> {
    let Some(value) = lookup(key) else {
        return Ok(default);
    };
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(ConfigError::invalid(key, value)),
    }
}

/// Error returned when a variable holds an unusable value.
#[derive(Debug)]
pub struct ConfigError {
    context: SpanTrace,
    key: &'static str,
    value: String,
}

impl ConfigError {
    fn invalid(key: &'static str, value: String) -> Self {
        Self {
            context: SpanTrace::capture(),
            key,
            value,
        }
    }

    /// Name of the offending variable.
    pub fn key(&self) -> &str {
        self.key
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Invalid value {:?} for {}", self.value, self.key)?;
        self.context.fmt(f)
    }
}

impl std::error::Error for ConfigError {}

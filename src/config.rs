//! Connection options and reconnect policy

use crate::{
    constants::{
        DEFAULT_ACTION_TIMEOUT_MS, DEFAULT_AMI_PORT, DEFAULT_CONNECT_TIMEOUT_MS,
        DEFAULT_KEEPALIVE_INTERVAL_MS, DEFAULT_KEEPALIVE_TIMEOUT_MS, DEFAULT_RECONNECT_INITIAL_MS,
        DEFAULT_RECONNECT_MAX_MS, MAX_EVENT_QUEUE_SIZE,
    },
    error::{AmiError, AmiResult},
};
use serde::Deserialize;
use std::fmt;
use std::time::Duration;

/// Exponential reconnect backoff with a cap.
///
/// Attempt `n` (1-based) waits `initial_delay_ms * multiplier^(n-1)`, capped
/// at `max_delay_ms`: 1s, 2s, 4s, ... 30s with the defaults.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Delay before the first reconnect attempt.
    pub initial_delay_ms: u64,
    /// Upper bound for any single delay.
    pub max_delay_ms: u64,
    /// Growth factor between attempts.
    pub multiplier: f64,
    /// Give up after this many failed attempts. `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: DEFAULT_RECONNECT_INITIAL_MS,
            max_delay_ms: DEFAULT_RECONNECT_MAX_MS,
            multiplier: 2.0,
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before attempt `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let raw = self.initial_delay_ms as f64 * self.multiplier.max(1.0).powi(exponent);
        let capped = raw.min(self.max_delay_ms as f64);
        Duration::from_millis(capped as u64)
    }

    /// Whether another attempt is allowed after `attempt` failures.
    pub fn allows(&self, attempt: u32) -> bool {
        self.max_attempts
            .map_or(true, |max| attempt <= max)
    }
}

/// Everything needed to reach and log into the exchange.
///
/// Durations are millisecond integers so the struct deserializes cleanly
/// from configuration files; use the accessor methods for [`Duration`]s.
///
/// ```
/// use asterisk_ami_tokio::ConnectOptions;
///
/// let options = ConnectOptions::new("pbx.example.net", "monitor", "s3cret");
/// assert_eq!(options.port, 5038);
/// assert!(!format!("{:?}", options).contains("s3cret"));
/// ```
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct ConnectOptions {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub secret: String,
    /// Ask the exchange to send unsolicited events (`Events: on`).
    pub events: bool,
    pub connect_timeout_ms: u64,
    /// Default deadline for a single action.
    pub action_timeout_ms: u64,
    /// Idle time after which a keepalive `Ping` is sent. Zero disables it.
    pub keepalive_interval_ms: u64,
    pub keepalive_timeout_ms: u64,
    /// Capacity of each [`AmiEventStream`](crate::AmiEventStream).
    pub event_queue_size: usize,
    /// Reconnect automatically after a drop. Login rejection is never retried.
    pub auto_reconnect: bool,
    pub reconnect: ReconnectPolicy,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_AMI_PORT,
            username: String::new(),
            secret: String::new(),
            events: true,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            action_timeout_ms: DEFAULT_ACTION_TIMEOUT_MS,
            keepalive_interval_ms: DEFAULT_KEEPALIVE_INTERVAL_MS,
            keepalive_timeout_ms: DEFAULT_KEEPALIVE_TIMEOUT_MS,
            event_queue_size: MAX_EVENT_QUEUE_SIZE,
            auto_reconnect: true,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("secret", &"[REDACTED]")
            .field("events", &self.events)
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .field("action_timeout_ms", &self.action_timeout_ms)
            .field("keepalive_interval_ms", &self.keepalive_interval_ms)
            .field("keepalive_timeout_ms", &self.keepalive_timeout_ms)
            .field("event_queue_size", &self.event_queue_size)
            .field("auto_reconnect", &self.auto_reconnect)
            .field("reconnect", &self.reconnect)
            .finish()
    }
}

impl ConnectOptions {
    /// Options for `host` on the default port with the given credentials.
    pub fn new(host: impl Into<String>, username: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            username: username.into(),
            secret: secret.into(),
            ..Self::default()
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn action_timeout(&self) -> Duration {
        Duration::from_millis(self.action_timeout_ms)
    }

    /// `None` when keepalive is disabled.
    pub fn keepalive_interval(&self) -> Option<Duration> {
        (self.keepalive_interval_ms > 0).then(|| Duration::from_millis(self.keepalive_interval_ms))
    }

    pub fn keepalive_timeout(&self) -> Duration {
        Duration::from_millis(self.keepalive_timeout_ms)
    }

    /// Reject options that can never produce a working session.
    pub fn validate(&self) -> AmiResult<()> {
        if self
            .host
            .trim()
            .is_empty()
        {
            return Err(AmiError::InvalidConfig("host must not be empty".into()));
        }
        if self.port == 0 {
            return Err(AmiError::InvalidConfig("port must not be zero".into()));
        }
        if self
            .username
            .is_empty()
        {
            return Err(AmiError::InvalidConfig("username must not be empty".into()));
        }
        if self.action_timeout_ms == 0 {
            return Err(AmiError::InvalidConfig(
                "action_timeout_ms must be positive".into(),
            ));
        }
        Ok(())
    }
}

//! Typed runtime settings read from the environment.
//!
//! Every knob has a documented default; values are read after
//! [`crate::load_and_apply`] so `.env` and the XDG config participate.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: String, value: String },
}

fn read<T: FromStr>(key: &str, default: T) -> Result<T, SettingsError> {
    match std::env::var(key) {
        Ok(raw) => raw.parse().map_err(|_| SettingsError::Invalid {
            key: key.to_string(),
            value: raw,
        }),
        Err(_) => Ok(default),
    }
}

fn read_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Messaging provider backing the bus.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Provider {
    /// In-process bounded queues with worker pools.
    Local,
    /// External AMQP broker (transactional delivery).
    Amqp,
}

impl FromStr for Provider {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(Provider::Local),
            "amqp" | "external-broker" => Ok(Provider::Amqp),
            _ => Err(()),
        }
    }
}

/// Logical topic names. Defaults: `event`, `response`, `audit`.
#[derive(Clone, Debug)]
pub struct TopicNames {
    pub event: String,
    pub response: String,
    pub audit: String,
}

impl Default for TopicNames {
    fn default() -> Self {
        Self {
            event: "event".into(),
            response: "response".into(),
            audit: "audit".into(),
        }
    }
}

/// Bus and in-memory backend knobs.
#[derive(Clone, Debug)]
pub struct MessagingSettings {
    pub provider: Provider,
    pub topics: TopicNames,
    pub broker_url: String,
    pub queue_capacity: usize,
    pub consumer_threads: usize,
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
    pub poll_timeout_seconds: u64,
    pub exponential_backoff: bool,
}

impl Default for MessagingSettings {
    fn default() -> Self {
        Self {
            provider: Provider::Local,
            topics: TopicNames::default(),
            broker_url: "amqp://127.0.0.1:5672".into(),
            queue_capacity: 1000,
            consumer_threads: 1,
            retry_attempts: 3,
            retry_delay_ms: 1000,
            max_retry_delay_ms: 30_000,
            poll_timeout_seconds: 5,
            exponential_backoff: true,
        }
    }
}

/// Session transport knobs.
#[derive(Clone, Debug)]
pub struct TransportSettings {
    /// Base WebSocket URL of the agent server.
    pub agent_url: String,
    /// Bearer token sent in the `Authorization` header on every connect.
    pub agent_token: Option<String>,
    pub ping_interval_seconds: u64,
    pub pong_timeout_seconds: u64,
    pub connection_timeout_seconds: u64,
    pub max_reconnect_attempts: u32,
    pub initial_reconnect_delay_ms: u64,
    pub max_reconnect_delay_ms: u64,
    pub ready_signal_timeout_seconds: u64,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            agent_url: "ws://127.0.0.1:8080/session".into(),
            agent_token: None,
            ping_interval_seconds: 30,
            pong_timeout_seconds: 10,
            connection_timeout_seconds: 60,
            max_reconnect_attempts: 3,
            initial_reconnect_delay_ms: 1000,
            max_reconnect_delay_ms: 10_000,
            ready_signal_timeout_seconds: 30,
        }
    }
}

impl TransportSettings {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_seconds)
    }

    pub fn pong_timeout(&self) -> Duration {
        Duration::from_secs(self.pong_timeout_seconds)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_seconds)
    }

    pub fn ready_signal_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_signal_timeout_seconds)
    }
}

/// Tool-server invocation knobs.
#[derive(Clone, Debug)]
pub struct ToolServerSettings {
    /// Per tool-call timeout. Default 90 s.
    pub request_timeout_seconds: u64,
}

impl Default for ToolServerSettings {
    fn default() -> Self {
        Self {
            request_timeout_seconds: 90,
        }
    }
}

impl ToolServerSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

/// Handler knobs.
#[derive(Clone, Debug)]
pub struct HandlerSettings {
    /// Wire cap before the unstructured trace is stripped. Default ~100 MiB.
    pub max_message_size_bytes: usize,
}

impl Default for HandlerSettings {
    fn default() -> Self {
        Self {
            max_message_size_bytes: 100 * 1024 * 1024,
        }
    }
}

/// All runtime settings.
#[derive(Clone, Debug)]
pub struct Settings {
    pub messaging: MessagingSettings,
    pub transport: TransportSettings,
    pub toolserver: ToolServerSettings,
    pub handler: HandlerSettings,
    /// Path of the YAML command catalog.
    pub catalog_path: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            messaging: MessagingSettings::default(),
            transport: TransportSettings::default(),
            toolserver: ToolServerSettings::default(),
            handler: HandlerSettings::default(),
            catalog_path: "commands.yaml".into(),
        }
    }
}

impl Settings {
    /// Reads all knobs from the environment, falling back to defaults.
    pub fn from_env() -> Result<Self, SettingsError> {
        let d = MessagingSettings::default();
        let messaging = MessagingSettings {
            provider: read("WEFT_MESSAGING_PROVIDER", d.provider)?,
            topics: TopicNames {
                event: read_string("WEFT_TOPIC_EVENT", "event"),
                response: read_string("WEFT_TOPIC_RESPONSE", "response"),
                audit: read_string("WEFT_TOPIC_AUDIT", "audit"),
            },
            broker_url: read_string("WEFT_BROKER_URL", &d.broker_url),
            queue_capacity: read("WEFT_QUEUE_CAPACITY", d.queue_capacity)?,
            consumer_threads: read("WEFT_CONSUMER_THREADS", d.consumer_threads)?,
            retry_attempts: read("WEFT_RETRY_ATTEMPTS", d.retry_attempts)?,
            retry_delay_ms: read("WEFT_RETRY_DELAY_MS", d.retry_delay_ms)?,
            max_retry_delay_ms: read("WEFT_MAX_RETRY_DELAY_MS", d.max_retry_delay_ms)?,
            poll_timeout_seconds: read("WEFT_POLL_TIMEOUT_SECONDS", d.poll_timeout_seconds)?,
            exponential_backoff: read("WEFT_EXPONENTIAL_BACKOFF", d.exponential_backoff)?,
        };

        let d = TransportSettings::default();
        let transport = TransportSettings {
            agent_url: read_string("WEFT_AGENT_URL", &d.agent_url),
            agent_token: std::env::var("WEFT_AGENT_TOKEN").ok(),
            ping_interval_seconds: read("WEFT_PING_INTERVAL_SECONDS", d.ping_interval_seconds)?,
            pong_timeout_seconds: read("WEFT_PONG_TIMEOUT_SECONDS", d.pong_timeout_seconds)?,
            connection_timeout_seconds: read(
                "WEFT_CONNECTION_TIMEOUT_SECONDS",
                d.connection_timeout_seconds,
            )?,
            max_reconnect_attempts: read("WEFT_MAX_RECONNECT_ATTEMPTS", d.max_reconnect_attempts)?,
            initial_reconnect_delay_ms: read(
                "WEFT_INITIAL_RECONNECT_DELAY_MS",
                d.initial_reconnect_delay_ms,
            )?,
            max_reconnect_delay_ms: read("WEFT_MAX_RECONNECT_DELAY_MS", d.max_reconnect_delay_ms)?,
            ready_signal_timeout_seconds: read(
                "WEFT_READY_SIGNAL_TIMEOUT_SECONDS",
                d.ready_signal_timeout_seconds,
            )?,
        };

        let toolserver = ToolServerSettings {
            request_timeout_seconds: read(
                "WEFT_TOOL_REQUEST_TIMEOUT_SECONDS",
                ToolServerSettings::default().request_timeout_seconds,
            )?,
        };

        let handler = HandlerSettings {
            max_message_size_bytes: read(
                "WEFT_MAX_MESSAGE_SIZE_BYTES",
                HandlerSettings::default().max_message_size_bytes,
            )?,
        };

        Ok(Settings {
            messaging,
            transport,
            toolserver,
            handler,
            catalog_path: read_string("WEFT_CATALOG_PATH", "commands.yaml"),
        })
    }
}

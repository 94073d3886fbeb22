//! Application configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

use broker::BrokerConfig;
use saga::{CommandKind, DispatcherConfig, EventKind};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Pretty,
    /// One JSON object per line.
    Json,
}

impl LogFormat {
    fn parse(value: &str) -> Self {
        if value.eq_ignore_ascii_case("json") {
            LogFormat::Json
        } else {
            LogFormat::Pretty
        }
    }
}

/// Coordinator configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST`, `PORT`: HTTP bind address (default `0.0.0.0:3000`)
/// - `RUST_LOG`: tracing filter directive (default `info`)
/// - `LOG_FORMAT`: `pretty` or `json`
/// - `DATABASE_URL`: PostgreSQL URL; unset means an in-memory store
/// - `DATABASE_MAX_CONNECTIONS` (default `10`)
/// - `AMQP_URL`, `AMQP_PREFETCH`, `AMQP_DELIVERY_LIMIT`
/// - `MAX_CAS_RETRIES`, `HOLD_DELAY_MS`, `RETRY_DELAY_MS`
/// - `QUEUE_*`: per-queue name overrides, see [`event_queue_var`] and
///   [`command_queue_var`]
///
/// Values that do not parse fall back to the default.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub broker: BrokerConfig,
    pub dispatcher: DispatcherConfig,
}

/// Environment variable overriding the queue of an event type.
pub fn event_queue_var(kind: EventKind) -> &'static str {
    match kind {
        EventKind::OperationReceived => "QUEUE_OPERATION_RECEIVED",
        EventKind::InvoicesParsed => "QUEUE_INVOICES_PARSED",
        EventKind::InvoicesValidated => "QUEUE_INVOICES_VALIDATED",
        EventKind::FilesArchived => "QUEUE_FILES_ARCHIVED",
        EventKind::EmailSent => "QUEUE_EMAIL_SENT",
        EventKind::CardCreated => "QUEUE_CARD_CREATED",
    }
}

/// Environment variable overriding the queue of a command type.
pub fn command_queue_var(kind: CommandKind) -> &'static str {
    match kind {
        CommandKind::Parse => "QUEUE_PARSE_COMMAND",
        CommandKind::Validate => "QUEUE_VALIDATE_COMMAND",
        CommandKind::Archive => "QUEUE_ARCHIVE_COMMAND",
        CommandKind::Notify => "QUEUE_NOTIFY_COMMAND",
        CommandKind::CreateCard => "QUEUE_CARD_COMMAND",
    }
}

fn parsed<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    lookup(key).and_then(|v| v.trim().parse().ok())
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration from any key/value source.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let mut broker = BrokerConfig {
            url: lookup("AMQP_URL").unwrap_or(defaults.broker.url),
            prefetch: parsed(&lookup, "AMQP_PREFETCH").unwrap_or(defaults.broker.prefetch),
            delivery_limit: parsed(&lookup, "AMQP_DELIVERY_LIMIT").unwrap_or(defaults.broker.delivery_limit),
            queues: defaults.broker.queues,
        };
        for kind in EventKind::ALL {
            if let Some(queue) = lookup(event_queue_var(kind)).filter(|q| !q.trim().is_empty()) {
                broker.queues.set_event_queue(kind, queue);
            }
        }
        for kind in CommandKind::ALL {
            if let Some(queue) = lookup(command_queue_var(kind)).filter(|q| !q.trim().is_empty()) {
                broker.queues.set_command_queue(kind, queue);
            }
        }

        let dispatcher = DispatcherConfig {
            max_cas_retries: parsed(&lookup, "MAX_CAS_RETRIES").unwrap_or(defaults.dispatcher.max_cas_retries),
            hold_delay: parsed(&lookup, "HOLD_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.dispatcher.hold_delay),
            retry_delay: parsed(&lookup, "RETRY_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.dispatcher.retry_delay),
        };

        Self {
            host: lookup("HOST").unwrap_or(defaults.host),
            port: parsed(&lookup, "PORT").unwrap_or(defaults.port),
            log_level: lookup("RUST_LOG").unwrap_or(defaults.log_level),
            log_format: lookup("LOG_FORMAT")
                .map(|v| LogFormat::parse(&v))
                .unwrap_or_default(),
            database_url: lookup("DATABASE_URL").filter(|url| !url.trim().is_empty()),
            database_max_connections: parsed(&lookup, "DATABASE_MAX_CONNECTIONS")
                .unwrap_or(defaults.database_max_connections),
            broker,
            dispatcher,
        }
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            database_url: None,
            database_max_connections: 10,
            broker: BrokerConfig::default(),
            dispatcher: DispatcherConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn from_pairs(pairs: &[(&str, &str)]) -> Config {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn test_default_values() {
        let config = from_pairs(&[]);
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 3000);
        assert_eq!(config.log_level, "info");
        assert_eq!(config.log_format, LogFormat::Pretty);
        assert!(config.database_url.is_none());
        assert_eq!(config.database_max_connections, 10);
        assert_eq!(config.broker, BrokerConfig::default());
        assert_eq!(config.dispatcher, DispatcherConfig::default());
    }

    #[test]
    fn test_addr_formatting() {
        let config = Config {
            host: "127.0.0.1".to_string(),
            port: 8080,
            ..Default::default()
        };
        assert_eq!(config.addr(), "127.0.0.1:8080");
    }

    #[test]
    fn test_reads_overrides() {
        let config = from_pairs(&[
            ("PORT", "8081"),
            ("LOG_FORMAT", "JSON"),
            ("DATABASE_URL", "postgres://localhost/ops"),
            ("AMQP_URL", "amqp://rabbit:5672/%2f"),
            ("AMQP_PREFETCH", "4"),
            ("MAX_CAS_RETRIES", "9"),
            ("HOLD_DELAY_MS", "250"),
            ("QUEUE_INVOICES_PARSED", "q.custom.parsed"),
            ("QUEUE_CARD_COMMAND", "q.custom.card"),
        ]);

        assert_eq!(config.port, 8081);
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.database_url.as_deref(), Some("postgres://localhost/ops"));
        assert_eq!(config.broker.url, "amqp://rabbit:5672/%2f");
        assert_eq!(config.broker.prefetch, 4);
        assert_eq!(config.dispatcher.max_cas_retries, 9);
        assert_eq!(config.dispatcher.hold_delay, Duration::from_millis(250));
        assert_eq!(
            config.broker.queues.event_queue(EventKind::InvoicesParsed),
            "q.custom.parsed"
        );
        assert_eq!(
            config.broker.queues.command_queue(CommandKind::CreateCard),
            "q.custom.card"
        );
        assert_eq!(
            config.broker.queues.command_queue(CommandKind::Parse),
            "q.commands.parse.xml"
        );
    }

    #[test]
    fn test_unparseable_values_fall_back() {
        let config = from_pairs(&[
            ("PORT", "not-a-port"),
            ("AMQP_DELIVERY_LIMIT", "-3"),
            ("RETRY_DELAY_MS", "soon"),
            ("DATABASE_URL", "  "),
        ]);
        assert_eq!(config.port, 3000);
        assert_eq!(config.broker.delivery_limit, 50);
        assert_eq!(config.dispatcher.retry_delay, Duration::from_millis(1000));
        assert!(config.database_url.is_none());
    }
}
